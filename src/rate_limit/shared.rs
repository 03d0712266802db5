use std::time::Duration;

use redis::{aio::ConnectionManager, Client, RedisError, Script};
use rocket::tokio::time::timeout;
use thiserror::Error;

/// Shared-store calls slower than this are treated as failures.
const CALL_TIMEOUT: Duration = Duration::from_millis(250);

/// Increment the counter and start its expiry only when the window is new.
/// `EXPIRE` is also reapplied to a counter found without a TTL, which guards
/// against a key that outlived a crashed writer between the two calls.
const INCREMENT_SCRIPT: &str = r"
local count = redis.call('INCR', KEYS[1])
local ttl = redis.call('TTL', KEYS[1])
if count == 1 or ttl < 0 then
    redis.call('EXPIRE', KEYS[1], ARGV[1])
    ttl = tonumber(ARGV[1])
end
return {count, ttl}
";

#[derive(Debug, Error)]
pub enum SharedStoreError {
    #[error(transparent)]
    Redis(#[from] RedisError),
    #[error("shared store timed out")]
    Timeout,
}

/// A counter store shared between server instances.
#[rocket::async_trait]
pub trait SharedCounter: Send + Sync {
    /// Atomically increment `key`, opening a window of `window_seconds` if it
    /// did not exist. Returns the new count and the seconds left in the window.
    async fn increment(&self, key: &str, window_seconds: u64)
        -> Result<(u64, u64), SharedStoreError>;
}

/// A [`SharedCounter`] backed by Redis.
pub struct RedisCounter {
    connection: ConnectionManager,
    script: Script,
}

impl RedisCounter {
    /// Connect to the Redis server at `uri`.
    pub async fn connect(uri: &str) -> Result<Self, SharedStoreError> {
        let client = Client::open(uri)?;
        let connection = timeout(CALL_TIMEOUT * 8, client.get_connection_manager())
            .await
            .map_err(|_| SharedStoreError::Timeout)??;
        Ok(Self {
            connection,
            script: Script::new(INCREMENT_SCRIPT),
        })
    }
}

#[rocket::async_trait]
impl SharedCounter for RedisCounter {
    async fn increment(
        &self,
        key: &str,
        window_seconds: u64,
    ) -> Result<(u64, u64), SharedStoreError> {
        let mut connection = self.connection.clone();
        let mut invocation = self.script.key(key);
        invocation.arg(window_seconds);
        let (count, ttl): (u64, u64) = timeout(CALL_TIMEOUT, invocation.invoke_async(&mut connection))
            .await
            .map_err(|_| SharedStoreError::Timeout)??;
        Ok((count, ttl))
    }
}

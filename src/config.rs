use chrono::Duration;
use mongodb::Client as MongoClient;
use rocket::futures::TryFutureExt;
use rocket::{
    fairing::{Fairing, Info, Kind},
    Build, Rocket,
};
use serde::Deserialize;

use crate::model::{
    db::admin::ensure_admin_exists,
    mongodb::{ensure_activation_guard_exists, ensure_indexes_exist, Coll},
};
use crate::rate_limit::{LocalStore, RateLimiter, RedisCounter, SharedCounter};

/// Application configuration, derived from `Rocket.toml` and `ROCKET_*`
/// environment variables. This struct becomes managed state and can be
/// inspected by any endpoint.
#[derive(Debug, Clone, Deserialize)]
pub struct Config {
    // non-secrets
    #[serde(default = "defaults::voter_session_ttl")]
    voter_session_ttl: u32,
    #[serde(default = "defaults::admin_session_ttl")]
    admin_session_ttl: u32,
    #[serde(default = "defaults::enabled")]
    secure_cookies: bool,
    #[serde(default)]
    trust_proxy: bool,
    #[serde(default = "defaults::short_window")]
    token_login_window: u64,
    #[serde(default = "defaults::login_max")]
    token_login_max: u64,
    #[serde(default = "defaults::short_window")]
    vote_window: u64,
    #[serde(default = "defaults::login_max")]
    vote_max: u64,
    #[serde(default = "defaults::admin_login_window")]
    admin_login_window: u64,
    #[serde(default = "defaults::admin_login_max")]
    admin_login_max: u64,
    #[serde(default = "defaults::rate_limit_max_keys")]
    rate_limit_max_keys: usize,
    #[serde(default = "defaults::rate_limit_sweep_every")]
    rate_limit_sweep_every: u64,
    #[serde(default = "defaults::sweep_interval")]
    sweep_interval: u32,
    #[serde(default = "defaults::sweep_batch_size")]
    sweep_batch_size: u32,
    // secrets
    default_admin_password: String,
}

impl Config {
    /// Valid lifetime of a voter session in seconds.
    pub fn voter_session_ttl(&self) -> Duration {
        Duration::seconds(self.voter_session_ttl.into())
    }

    /// Valid lifetime of an admin session in seconds.
    pub fn admin_session_ttl(&self) -> Duration {
        Duration::seconds(self.admin_session_ttl.into())
    }

    /// Whether session cookies carry the `Secure` attribute.
    pub fn secure_cookies(&self) -> bool {
        self.secure_cookies
    }

    /// Whether `X-Forwarded-For` / `X-Real-IP` identify the client.
    /// Only enable behind a reverse proxy that overwrites these headers.
    pub fn trust_proxy(&self) -> bool {
        self.trust_proxy
    }

    /// Token login policy as `(window_seconds, max)`.
    pub fn token_login_limit(&self) -> (u64, u64) {
        (self.token_login_window, self.token_login_max)
    }

    /// Vote casting policy as `(window_seconds, max)`.
    pub fn vote_limit(&self) -> (u64, u64) {
        (self.vote_window, self.vote_max)
    }

    /// Admin login policy as `(window_seconds, max)`.
    pub fn admin_login_limit(&self) -> (u64, u64) {
        (self.admin_login_window, self.admin_login_max)
    }

    /// Maximum number of keys held by the in-process rate-limit fallback.
    pub fn rate_limit_max_keys(&self) -> usize {
        self.rate_limit_max_keys
    }

    /// The in-process fallback prunes expired windows once per this many calls.
    pub fn rate_limit_sweep_every(&self) -> u64 {
        self.rate_limit_sweep_every
    }

    /// Time between background maintenance sweeps.
    pub fn sweep_interval(&self) -> Duration {
        Duration::seconds(self.sweep_interval.into())
    }

    /// Upper bound on tokens redacted per sweep.
    pub fn sweep_batch_size(&self) -> u32 {
        self.sweep_batch_size
    }

    /// Password given to the default admin account, if no admins exist.
    pub fn default_admin_password(&self) -> &str {
        &self.default_admin_password
    }
}

mod defaults {
    pub fn voter_session_ttl() -> u32 {
        15 * 60
    }

    pub fn admin_session_ttl() -> u32 {
        8 * 60 * 60
    }

    pub fn enabled() -> bool {
        true
    }

    pub fn short_window() -> u64 {
        60
    }

    pub fn login_max() -> u64 {
        10
    }

    pub fn admin_login_window() -> u64 {
        300
    }

    pub fn admin_login_max() -> u64 {
        5
    }

    pub fn rate_limit_max_keys() -> usize {
        10_000
    }

    pub fn rate_limit_sweep_every() -> u64 {
        500
    }

    pub fn sweep_interval() -> u32 {
        300
    }

    pub fn sweep_batch_size() -> u32 {
        500
    }
}

/// A fairing that loads the application config and puts it in managed state.
/// This could easily be achieved using `AdHoc::config`, but is written out
/// explicitly for symmetry with the other fairings and control over error
/// messages.
pub struct ConfigFairing;

#[rocket::async_trait]
impl Fairing for ConfigFairing {
    fn info(&self) -> Info {
        Info {
            name: "Config",
            kind: Kind::Ignite,
        }
    }

    async fn on_ignite(&self, mut rocket: Rocket<Build>) -> rocket::fairing::Result {
        // Load the config.
        let config = match rocket.figment().extract::<Config>() {
            Ok(config) => config,
            Err(e) => {
                error!("Failed to load application config");
                rocket::config::pretty_print_error(e);
                return Err(rocket);
            }
        };

        // Manage the state.
        rocket = rocket.manage(config);
        Ok(rocket)
    }
}

/// Configuration for the database.
#[derive(Deserialize)]
struct DbConfig {
    // secrets
    db_uri: String,
}

/// A fairing that loads the MongoDB config, connects to the database,
/// performs any setup necessary, and places both a `Client` and a `Database`
/// into managed state. Depends on `Config` already being managed.
pub struct DatabaseFairing;

#[rocket::async_trait]
impl Fairing for DatabaseFairing {
    fn info(&self) -> Info {
        Info {
            name: "MongoDB",
            kind: Kind::Ignite,
        }
    }

    async fn on_ignite(&self, mut rocket: Rocket<Build>) -> rocket::fairing::Result {
        // Load the config.
        let config = match rocket.figment().extract::<DbConfig>() {
            Ok(config) => config,
            Err(e) => {
                error!("Failed to load database config");
                rocket::config::pretty_print_error(e);
                return Err(rocket);
            }
        };
        let default_password = match rocket.state::<Config>() {
            Some(app_config) => app_config.default_admin_password().to_string(),
            None => {
                error!("Application config was not available when connecting to the database");
                return Err(rocket);
            }
        };
        info!("Loaded database config, connecting...");
        // Construct the connection.
        let client = match MongoClient::with_uri_str(config.db_uri).await {
            Ok(client) => client,
            Err(e) => {
                error!("Failed to connect to database: {e}");
                return Err(rocket);
            }
        };
        let db = client.database(DATABASE_NAME);

        // Ensure the required indexes exist.
        if let Err(e) = ensure_indexes_exist(&db).await {
            error!("Failed to connect to database: {e}");
            return Err(rocket);
        }

        // Ensure there is at least one admin user and the activation guard exists.
        let admins = Coll::from_db(&db);
        let guards = Coll::from_db(&db);
        if let Err(e) = ensure_admin_exists(&admins, &default_password)
            .and_then(|_| ensure_activation_guard_exists(&guards))
            .await
        {
            error!("Failed to connect to database: {e}");
            return Err(rocket);
        }
        info!("...database connection online!");

        // Manage the state.
        rocket = rocket.manage(client).manage(db);
        Ok(rocket)
    }
}

/// Name of the production database.
pub const DATABASE_NAME: &str = "pilketos";

/// Configuration for the shared rate-limit store.
#[derive(Deserialize)]
struct RedisConfig {
    // secrets
    #[serde(default)]
    redis_uri: Option<String>,
}

/// A fairing that builds the `RateLimiter` and places it into managed state.
/// A missing or unreachable Redis is not fatal: the limiter then counts in
/// process memory only, which does not hold across multiple instances.
/// Depends on `Config` already being managed.
pub struct RateLimiterFairing;

#[rocket::async_trait]
impl Fairing for RateLimiterFairing {
    fn info(&self) -> Info {
        Info {
            name: "Rate limiter",
            kind: Kind::Ignite,
        }
    }

    async fn on_ignite(&self, mut rocket: Rocket<Build>) -> rocket::fairing::Result {
        let (max_keys, sweep_every) = match rocket.state::<Config>() {
            Some(config) => (config.rate_limit_max_keys(), config.rate_limit_sweep_every()),
            None => {
                error!("Application config was not available when building the rate limiter");
                return Err(rocket);
            }
        };
        let redis_uri = match rocket.figment().extract::<RedisConfig>() {
            Ok(config) => config.redis_uri,
            Err(e) => {
                error!("Failed to load rate limiter config");
                rocket::config::pretty_print_error(e);
                return Err(rocket);
            }
        };

        let shared: Option<Box<dyn SharedCounter>> = match redis_uri {
            Some(uri) => match RedisCounter::connect(&uri).await {
                Ok(counter) => {
                    info!("Rate limiter using shared Redis store");
                    Some(Box::new(counter))
                }
                Err(e) => {
                    warn!("Redis unavailable ({e}); rate limits will be per-process only");
                    None
                }
            },
            None => {
                warn!("No `redis_uri` configured; rate limits will be per-process only");
                None
            }
        };

        let limiter = RateLimiter::new(shared, LocalStore::new(max_keys, sweep_every));
        rocket = rocket.manage(limiter);
        Ok(rocket)
    }
}

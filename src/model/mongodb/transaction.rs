use std::time::Duration;

use mongodb::{
    options::{Acknowledgment, ReadConcern, TransactionOptions, WriteConcern},
    Client, ClientSession,
};
use rand::Rng;
use rocket::tokio::time::sleep;

use crate::error::{Error, Result};

use super::errors::{classify, is_unknown_commit_result, StorageFailure};

/// Attempts at running a transaction body before giving up with a conflict.
pub const MAX_TRANSACTION_ATTEMPTS: u32 = 5;

/// Attempts at committing a transaction whose commit outcome was unknown.
const MAX_COMMIT_ATTEMPTS: u32 = 3;

/// A unit of work that runs inside a single transaction.
///
/// The body may be run more than once, so it must not have side effects
/// outside the session.
#[rocket::async_trait]
pub trait Transactional: Sync {
    type Output: Send;

    async fn run(&self, session: &mut ClientSession) -> Result<Self::Output>;
}

/// Run `op` in a snapshot transaction with majority writes, retrying on
/// transient errors. Domain errors returned by the body abort the
/// transaction and are passed straight through.
pub async fn transact<T>(client: &Client, op: &T) -> Result<T::Output>
where
    T: Transactional,
{
    let mut session = client.start_session(None).await?;
    let options = TransactionOptions::builder()
        .read_concern(ReadConcern::snapshot())
        .write_concern(WriteConcern::builder().w(Acknowledgment::Majority).build())
        .build();

    for attempt in 1..=MAX_TRANSACTION_ATTEMPTS {
        session.start_transaction(options.clone()).await?;

        let output = match op.run(&mut session).await {
            Ok(output) => output,
            Err(e) => {
                // The server may already have aborted it.
                let _ = session.abort_transaction().await;
                if is_transient(&e) {
                    debug!("Transaction attempt {attempt} hit a transient error: {e}");
                    backoff(attempt).await;
                    continue;
                }
                return Err(e);
            }
        };

        match commit(&mut session).await {
            Ok(()) => return Ok(output),
            Err(e) if classify(&e) == StorageFailure::Transient => {
                debug!("Transaction attempt {attempt} failed to commit: {e}");
                backoff(attempt).await;
            }
            Err(e) => return Err(e.into()),
        }
    }

    warn!("Transaction gave up after {MAX_TRANSACTION_ATTEMPTS} attempts");
    Err(Error::Conflict(
        "The operation conflicted with a concurrent request, please retry".to_string(),
    ))
}

async fn commit(session: &mut ClientSession) -> std::result::Result<(), mongodb::error::Error> {
    let mut attempt = 1;
    loop {
        match session.commit_transaction().await {
            Err(e) if is_unknown_commit_result(&e) && attempt < MAX_COMMIT_ATTEMPTS => {
                attempt += 1;
            }
            result => return result,
        }
    }
}

fn is_transient(err: &Error) -> bool {
    match err {
        Error::Db(e) => classify(e) == StorageFailure::Transient,
        _ => false,
    }
}

/// Sleep a little before retrying, with jitter so racing requests spread out.
async fn backoff(attempt: u32) {
    let jitter = rand::thread_rng().gen_range(0..10);
    sleep(Duration::from_millis(u64::from(attempt) * 10 + jitter)).await;
}

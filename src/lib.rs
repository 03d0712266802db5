#[macro_use]
extern crate rocket;

#[macro_use]
extern crate log;

#[cfg(test)]
#[macro_use]
extern crate backend_test;

use mongodb::Client;
use rocket::{Build, Rocket};

use crate::config::{ConfigFairing, DatabaseFairing, RateLimiterFairing};
use crate::logging::LoggerFairing;
use crate::model::db::sweeper::SweeperFairing;
use crate::rate_limit::{LocalStore, RateLimitHeaders, RateLimiter};

pub use crate::config::Config;

pub mod api;
pub mod config;
pub mod error;
pub mod logging;
pub mod model;
pub mod rate_limit;

/// Construct the server with all fairings attached and routes mounted.
pub fn build() -> Rocket<Build> {
    rocket::build()
        .attach(LoggerFairing)
        .attach(ConfigFairing)
        .attach(DatabaseFairing)
        .attach(RateLimiterFairing)
        .attach(SweeperFairing)
        .attach(RateLimitHeaders)
        .mount("/", api::routes())
        .register("/", api::catchers())
}

/// Construct the server around an existing database connection, without the
/// database fairing and without the background sweeper. Rate limits are
/// counted in process only.
pub async fn rocket_for_db(db_client: Client, db_name: &str) -> Rocket<Build> {
    let db = db_client.database(db_name);
    if let Err(e) = model::mongodb::ensure_indexes_exist(&db).await {
        error!("Failed to create indexes on {db_name}: {e}");
    }
    let guards = model::mongodb::Coll::from_db(&db);
    if let Err(e) = model::mongodb::ensure_activation_guard_exists(&guards).await {
        error!("Failed to create the activation guard on {db_name}: {e}");
    }
    let limiter = RateLimiter::new(None, LocalStore::new(10_000, 500));
    rocket::build()
        .attach(ConfigFairing)
        .attach(RateLimitHeaders)
        .manage(limiter)
        .manage(db_client)
        .manage(db)
        .mount("/", api::routes())
        .register("/", api::catchers())
}

/// URI of the MongoDB deployment used by database tests.
/// Transactions require a replica set, so a single-node one is expected.
#[cfg(test)]
const TEST_DB_URI_VAR: &str = "PILKETOS_TEST_DB_URI";

#[cfg(test)]
const DEFAULT_TEST_DB_URI: &str =
    "mongodb://localhost:27017/?replicaSet=rs0&serverSelectionTimeoutMS=2000";

/// Connect to the test database deployment, returning `None` if it is not
/// reachable or cannot run transactions.
#[cfg(test)]
pub(crate) async fn test_db_client() -> Option<Client> {
    use mongodb::bson::doc;

    let uri = std::env::var(TEST_DB_URI_VAR).unwrap_or_else(|_| DEFAULT_TEST_DB_URI.to_string());
    let client = Client::with_uri_str(&uri).await.ok()?;
    let hello = client
        .database("admin")
        .run_command(doc! { "hello": 1 }, None)
        .await
        .ok()?;
    // Standalone servers reject transactions.
    if hello.get_str("setName").is_err() {
        warn!("MongoDB at {uri} is not a replica set");
        return None;
    }
    Some(client)
}

/// Get a fresh database name, to avoid collisions between tests.
#[cfg(test)]
pub(crate) fn test_database_name() -> String {
    let random: u32 = rand::random();
    format!("test{random}")
}


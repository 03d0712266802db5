//! Periodic cleanup of sessions and raw token strings.
//!
//! Every write here is conditional, so a sweep can run concurrently with
//! request handling, with other sweeps, or be interrupted at any point.

use std::collections::HashSet;
use std::fmt::{self, Display};

use chrono::{DateTime, Utc};
use mongodb::{
    bson::{doc, oid::ObjectId, Bson, DateTime as BsonDateTime, Regex},
    options::FindOptions,
    Database,
};
use rocket::{
    fairing::{Fairing, Info, Kind},
    futures::TryStreamExt,
    tokio::{
        self,
        time::{interval, MissedTickBehavior},
    },
    Orbit, Rocket,
};
use serde::{Deserialize, Serialize};

use crate::error::Result;
use crate::model::{
    common::token::{redact, RedactionKind, TokenStatus, REDACTED_PATTERN},
    db::{
        session::{AdminSession, VoterSession},
        token::Token,
    },
    mongodb::Coll,
};
use crate::Config;

/// What one sweep removed or rewrote.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SweepReport {
    pub expired_voter_sessions: u64,
    pub expired_admin_sessions: u64,
    pub orphaned_voter_sessions: u64,
    pub redacted_tokens: u64,
}

impl SweepReport {
    pub fn is_empty(&self) -> bool {
        *self == Self::default()
    }
}

impl Display for SweepReport {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "expired voter sessions: {}, expired admin sessions: {}, \
orphaned voter sessions: {}, redacted tokens: {}",
            self.expired_voter_sessions,
            self.expired_admin_sessions,
            self.orphaned_voter_sessions,
            self.redacted_tokens,
        )
    }
}

/// Run one sweep. At most `batch_size` tokens are redacted.
pub async fn sweep(db: &Database, now: DateTime<Utc>, batch_size: u32) -> Result<SweepReport> {
    let voter_sessions = Coll::<VoterSession>::from_db(db);
    let admin_sessions = Coll::<AdminSession>::from_db(db);
    let tokens = Coll::<Token>::from_db(db);

    let expired = doc! { "expires_at": { "$lte": BsonDateTime::from_chrono(now) } };
    let expired_voter_sessions = voter_sessions
        .delete_many(expired.clone(), None)
        .await?
        .deleted_count;
    let expired_admin_sessions = admin_sessions
        .delete_many(expired, None)
        .await?
        .deleted_count;
    let orphaned_voter_sessions = delete_orphaned_sessions(&voter_sessions, &tokens).await?;
    let redacted_tokens = redact_spent_tokens(&tokens, batch_size).await?;

    Ok(SweepReport {
        expired_voter_sessions,
        expired_admin_sessions,
        orphaned_voter_sessions,
        redacted_tokens,
    })
}

/// Delete voter sessions whose token is missing or no longer unused.
///
/// Only sessions whose token was already dead when looked up are deleted,
/// so a session created mid-sweep for a live token survives.
async fn delete_orphaned_sessions(
    sessions: &Coll<VoterSession>,
    tokens: &Coll<Token>,
) -> Result<u64> {
    let session_tokens = sessions.distinct("token_id", None, None).await?;
    if session_tokens.is_empty() {
        return Ok(0);
    }

    let live_filter = doc! {
        "_id": { "$in": session_tokens.clone() },
        "status": TokenStatus::Unused,
    };
    let live: HashSet<ObjectId> = tokens
        .distinct("_id", live_filter, None)
        .await?
        .iter()
        .filter_map(Bson::as_object_id)
        .collect();
    let dead: Vec<ObjectId> = session_tokens
        .iter()
        .filter_map(Bson::as_object_id)
        .filter(|id| !live.contains(id))
        .collect();
    if dead.is_empty() {
        return Ok(0);
    }

    Ok(sessions
        .delete_many(doc! { "token_id": { "$in": dead } }, None)
        .await?
        .deleted_count)
}

/// Redact used and invalidated tokens still holding their raw string.
async fn redact_spent_tokens(tokens: &Coll<Token>, batch_size: u32) -> Result<u64> {
    let redacted = Regex {
        pattern: REDACTED_PATTERN.to_string(),
        options: String::new(),
    };
    let filter = doc! {
        "status": { "$ne": TokenStatus::Unused },
        "token": { "$not": redacted },
    };
    let options = FindOptions::builder()
        .limit(i64::from(batch_size.max(1)))
        .build();
    let raw: Vec<Token> = tokens.find(filter, options).await?.try_collect().await?;

    let mut count = 0;
    for token in raw {
        let kind = match RedactionKind::for_status(token.status) {
            Some(kind) => kind,
            None => continue,
        };
        // Only rewrite the exact string we read.
        let filter = doc! {
            "_id": *token.id,
            "status": token.status,
            "token": token.token.as_str(),
        };
        let update = doc! { "$set": { "token": redact(token.id, kind) } };
        count += tokens.update_one(filter, update, None).await?.modified_count;
    }
    if count > 0 {
        warn!("Redacted {count} spent tokens that still held their raw string");
    }
    Ok(count)
}

/// A fairing that sweeps in the background every `sweep_interval`, until
/// the server shuts down. Depends on `Config` and a `Database` in managed state.
pub struct SweeperFairing;

#[rocket::async_trait]
impl Fairing for SweeperFairing {
    fn info(&self) -> Info {
        Info {
            name: "Maintenance sweeper",
            kind: Kind::Liftoff,
        }
    }

    async fn on_liftoff(&self, rocket: &Rocket<Orbit>) {
        let (config, db) = match (rocket.state::<Config>(), rocket.state::<Database>()) {
            (Some(config), Some(db)) => (config, db.clone()),
            _ => {
                error!("Sweeper could not start: config or database not in managed state");
                return;
            }
        };
        let period = config
            .sweep_interval()
            .to_std()
            .unwrap_or_default()
            .max(std::time::Duration::from_secs(1));
        let batch_size = config.sweep_batch_size();
        let shutdown = rocket.shutdown();

        tokio::spawn(async move {
            tokio::pin!(shutdown);
            let mut ticker = interval(period);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
            loop {
                tokio::select! {
                    _ = ticker.tick() => {}
                    _ = &mut shutdown => break,
                }
                match sweep(&db, Utc::now(), batch_size).await {
                    Ok(report) if report.is_empty() => debug!("Sweep found nothing to do"),
                    Ok(report) => info!("Sweep finished ({report})"),
                    Err(e) => error!("Sweep failed: {e}"),
                }
            }
            debug!("Sweeper stopped");
        });
        info!("Sweeper running every {}s", period.as_secs());
    }
}

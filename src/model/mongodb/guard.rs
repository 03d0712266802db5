use mongodb::{
    bson::doc,
    options::UpdateOptions,
    ClientSession,
};
use serde::{Deserialize, Serialize};

use crate::error::Result;
use crate::model::mongodb::Coll;

/// ID of the guard bumped by every election activation.
pub const ACTIVATION_GUARD_ID: &str = "election_activation";

/// A document whose only purpose is to be written. Two transactions that
/// both bump the same guard cannot both commit, which serialises them.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Guard {
    #[serde(rename = "_id")]
    pub id: String,
    pub generation: i64,
}

impl Guard {
    /// Bump the guard with the given ID as part of the session's transaction.
    pub async fn bump(guards: &Coll<Guard>, id: &str, session: &mut ClientSession) -> Result<()> {
        let update = doc! {
            "$inc": { "generation": 1_i64 }
        };
        let options = UpdateOptions::builder().upsert(true).build();
        guards
            .update_one_with_session(doc! { "_id": id }, update, options, session)
            .await?;
        Ok(())
    }
}

/// Ensure the activation guard exists, so activations never race to upsert it.
///
/// This operation is idempotent.
pub async fn ensure_activation_guard_exists(guards: &Coll<Guard>) -> Result<()> {
    let update = doc! {
        "$setOnInsert": { "generation": 0_i64 }
    };
    let options = UpdateOptions::builder().upsert(true).build();
    guards
        .update_one(doc! { "_id": ACTIVATION_GUARD_ID }, update, options)
        .await?;
    Ok(())
}

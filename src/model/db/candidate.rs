use std::ops::Deref;

use chrono::{DateTime, Utc};
use mongodb::{
    bson::{doc, serde_helpers::chrono_datetime_as_bson_datetime},
    options::FindOptions,
    Client, ClientSession,
};
use rocket::futures::TryStreamExt;
use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};
use crate::model::{
    common::election::ElectionError,
    db::election::Election,
    mongodb::{errors::is_duplicate_key, transact, Coll, Id, Transactional},
};

/// Core candidate pair data: a chairperson and their vice, running together.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CandidatePairCore {
    pub election_id: Id,
    /// Position on the ballot, unique within the election.
    pub number: u32,
    pub chair_name: String,
    pub vice_name: String,
    pub vision: String,
    /// Only active pairs can receive votes.
    pub is_active: bool,
    #[serde(with = "chrono_datetime_as_bson_datetime")]
    pub created_at: DateTime<Utc>,
}

/// A candidate pair without an ID.
pub type NewCandidatePair = CandidatePairCore;

/// A candidate pair from the database, with its unique ID.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CandidatePair {
    #[serde(rename = "_id")]
    pub id: Id,
    #[serde(flatten)]
    pub candidate: CandidatePairCore,
}

impl Deref for CandidatePair {
    type Target = CandidatePairCore;

    fn deref(&self) -> &Self::Target {
        &self.candidate
    }
}

impl CandidatePair {
    /// Add a candidate pair to a DRAFT election.
    pub async fn create(
        db_client: &Client,
        elections: &Coll<Election>,
        candidates: &Coll<NewCandidatePair>,
        candidate: NewCandidatePair,
    ) -> Result<Self> {
        let op = AddCandidate {
            elections: elections.clone(),
            candidates: candidates.clone(),
            candidate,
        };
        match transact(db_client, &op).await {
            Err(Error::Db(e)) if is_duplicate_key(&e) => Err(Error::Conflict(format!(
                "Candidate number {} is already taken",
                op.candidate.number
            ))),
            result => result,
        }
    }

    /// Candidate pairs of an election in ballot order.
    pub async fn for_election(
        candidates: &Coll<CandidatePair>,
        election_id: Id,
        active_only: bool,
    ) -> Result<Vec<Self>> {
        let mut filter = doc! { "election_id": *election_id };
        if active_only {
            filter.insert("is_active", true);
        }
        let options = FindOptions::builder().sort(doc! { "number": 1 }).build();
        Ok(candidates.find(filter, options).await?.try_collect().await?)
    }
}

/// Inserts the pair while holding a DRAFT claim on its election.
struct AddCandidate {
    elections: Coll<Election>,
    candidates: Coll<NewCandidatePair>,
    candidate: NewCandidatePair,
}

#[rocket::async_trait]
impl Transactional for AddCandidate {
    type Output = CandidatePair;

    async fn run(&self, session: &mut ClientSession) -> Result<CandidatePair> {
        let election_id = self.candidate.election_id;
        if Election::claim_draft(&self.elections, election_id, session)
            .await?
            .is_none()
        {
            return Err(ElectionError::NotDraft.into());
        }

        let id: Id = self
            .candidates
            .insert_one_with_session(&self.candidate, None, session)
            .await?
            .inserted_id
            .as_object_id()
            .ok_or_else(|| Error::Internal("Inserted candidate has no ObjectId".to_string()))?
            .into();
        Ok(CandidatePair {
            id,
            candidate: self.candidate.clone(),
        })
    }
}

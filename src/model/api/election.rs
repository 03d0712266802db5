use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::model::{
    common::election::{validate_slug, ElectionError, ElectionStatus, Schedule},
    db::{
        candidate::{CandidatePair, NewCandidatePair},
        election::{Election, NewElection},
    },
    mongodb::Id,
};

use super::id::ApiId;

/// An election as submitted by an admin.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ElectionSpec {
    pub slug: String,
    pub name: String,
    #[serde(default)]
    pub description: String,
    pub start_time: DateTime<Utc>,
    pub end_time: DateTime<Utc>,
}

impl ElectionSpec {
    /// Validate the spec and build a new DRAFT election from it.
    pub fn into_new(self, now: DateTime<Utc>) -> Result<NewElection, ElectionError> {
        validate_slug(&self.slug)?;
        let schedule = Schedule::new(self.start_time, self.end_time)?;
        Ok(NewElection::new(
            self.slug,
            self.name,
            self.description,
            schedule,
            now,
        ))
    }
}

/// Changes to an election. Absent fields are left as they are.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ElectionUpdate {
    pub slug: Option<String>,
    pub name: Option<String>,
    pub description: Option<String>,
    pub start_time: Option<DateTime<Utc>>,
    pub end_time: Option<DateTime<Utc>>,
}

impl ElectionUpdate {
    /// Does this update touch fields that are locked outside DRAFT?
    pub fn touches_locked_fields(&self) -> bool {
        self.slug.is_some() || self.start_time.is_some() || self.end_time.is_some()
    }
}

/// Whether an election's results are public.
#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ResultsVisibility {
    pub is_result_public: bool,
}

/// An API-friendly election description.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ElectionDescription {
    pub id: ApiId,
    pub slug: String,
    pub name: String,
    pub description: String,
    pub status: ElectionStatus,
    pub start_time: DateTime<Utc>,
    pub end_time: DateTime<Utc>,
    pub is_result_public: bool,
    pub created_at: DateTime<Utc>,
}

impl From<Election> for ElectionDescription {
    fn from(election: Election) -> Self {
        Self {
            id: election.id.into(),
            slug: election.election.slug,
            name: election.election.name,
            description: election.election.description,
            status: election.election.status,
            start_time: election.election.start_time,
            end_time: election.election.end_time,
            is_result_public: election.election.is_result_public,
            created_at: election.election.created_at,
        }
    }
}

/// A candidate pair as submitted by an admin.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CandidateSpec {
    pub number: u32,
    pub chair_name: String,
    pub vice_name: String,
    #[serde(default)]
    pub vision: String,
}

impl CandidateSpec {
    pub fn into_new(self, election_id: Id, now: DateTime<Utc>) -> NewCandidatePair {
        NewCandidatePair {
            election_id,
            number: self.number,
            chair_name: self.chair_name,
            vice_name: self.vice_name,
            vision: self.vision,
            is_active: true,
            created_at: now,
        }
    }
}

/// An API-friendly candidate pair description.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CandidateDescription {
    pub id: ApiId,
    pub election_id: ApiId,
    pub number: u32,
    pub chair_name: String,
    pub vice_name: String,
    pub vision: String,
    pub is_active: bool,
}

impl From<CandidatePair> for CandidateDescription {
    fn from(candidate: CandidatePair) -> Self {
        Self {
            id: candidate.id.into(),
            election_id: candidate.candidate.election_id.into(),
            number: candidate.candidate.number,
            chair_name: candidate.candidate.chair_name,
            vice_name: candidate.candidate.vice_name,
            vision: candidate.candidate.vision,
            is_active: candidate.candidate.is_active,
        }
    }
}

/// Vote count for one candidate pair.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CandidateResult {
    pub candidate: CandidateDescription,
    pub votes: u64,
}

/// An election's tally.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ElectionResults {
    pub election: ElectionDescription,
    pub total_votes: u64,
    pub candidates: Vec<CandidateResult>,
}

impl ElectionResults {
    pub fn new(election: Election, tally: Vec<(CandidatePair, u64)>) -> Self {
        let candidates: Vec<CandidateResult> = tally
            .into_iter()
            .map(|(candidate, votes)| CandidateResult {
                candidate: candidate.into(),
                votes,
            })
            .collect();
        Self {
            election: election.into(),
            total_votes: candidates.iter().map(|c| c.votes).sum(),
            candidates,
        }
    }
}

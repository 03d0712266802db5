use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::model::db::vote::VoteReceipt;

use super::{
    election::{CandidateDescription, ElectionDescription},
    id::ApiId,
};

#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct VoteRequest {
    pub candidate_pair_id: ApiId,
}

/// What a logged-in voter can choose from.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BallotView {
    pub election: ElectionDescription,
    pub candidates: Vec<CandidateDescription>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ReceiptDescription {
    pub election_id: ApiId,
    pub cast_at: DateTime<Utc>,
}

impl From<VoteReceipt> for ReceiptDescription {
    fn from(receipt: VoteReceipt) -> Self {
        Self {
            election_id: receipt.election_id.into(),
            cast_at: receipt.cast_at,
        }
    }
}

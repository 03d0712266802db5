use chrono::{DateTime, Utc};
use mongodb::{
    bson::{doc, serde_helpers::chrono_datetime_as_bson_datetime, DateTime as BsonDateTime},
    Client, ClientSession, Database,
};
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::error::Result;
use crate::model::{
    common::{
        secret::SessionSecret,
        token::{redact, RedactionKind, TokenStatus},
    },
    db::{candidate::CandidatePair, election::Election, session::VoterSession, token::Token},
    mongodb::{transact, Coll, Id, Transactional},
};

/// A cast vote. Deliberately carries nothing that identifies the voter or
/// their token.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Vote {
    #[serde(rename = "_id")]
    pub id: Id,
    pub election_id: Id,
    pub candidate_pair_id: Id,
    #[serde(with = "chrono_datetime_as_bson_datetime")]
    pub created_at: DateTime<Utc>,
}

/// Reasons a vote is refused.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum VoteError {
    #[error("Not logged in, or the session has expired")]
    Unauthorized,
    #[error("Token has already been used")]
    TokenUsed,
    #[error("The election is not open for voting")]
    ElectionInactive,
    #[error("Not a candidate in this election")]
    InvalidCandidate,
}

impl VoteError {
    pub fn code(&self) -> &'static str {
        match self {
            Self::Unauthorized => "UNAUTHORIZED",
            Self::TokenUsed => "TOKEN_USED",
            Self::ElectionInactive => "ELECTION_INACTIVE",
            Self::InvalidCandidate => "CANDIDATE_INVALID",
        }
    }
}

/// Proof for the voter that their vote was counted. Does not say for whom.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct VoteReceipt {
    pub election_id: Id,
    pub cast_at: DateTime<Utc>,
}

impl Vote {
    /// Cast a vote with the session identified by `secret`.
    ///
    /// Recording the vote and sealing the token happen in one transaction:
    /// either both commit or neither does. However many casts race on one
    /// token, the conditional UNUSED → USED write lets exactly one through.
    pub async fn cast(
        db_client: &Client,
        db: &Database,
        secret: &SessionSecret,
        candidate_pair_id: Id,
        now: DateTime<Utc>,
    ) -> Result<VoteReceipt> {
        let op = CastBallot {
            sessions: Coll::from_db(db),
            tokens: Coll::from_db(db),
            elections: Coll::from_db(db),
            candidates: Coll::from_db(db),
            votes: Coll::from_db(db),
            session_hash: secret.hash(),
            candidate_pair_id,
            now,
        };
        let receipt = transact(db_client, &op).await?;
        info!("Vote cast in election {}", receipt.election_id);
        Ok(receipt)
    }

    /// Vote counts per candidate pair, in ballot order.
    pub async fn tally(
        votes: &Coll<Vote>,
        candidates: &Coll<CandidatePair>,
        election_id: Id,
    ) -> Result<Vec<(CandidatePair, u64)>> {
        let pairs = CandidatePair::for_election(candidates, election_id, false).await?;
        let mut tally = Vec::with_capacity(pairs.len());
        for pair in pairs {
            let filter = doc! { "election_id": *election_id, "candidate_pair_id": *pair.id };
            let count = votes.count_documents(filter, None).await?;
            tally.push((pair, count));
        }
        Ok(tally)
    }
}

struct CastBallot {
    sessions: Coll<VoterSession>,
    tokens: Coll<Token>,
    elections: Coll<Election>,
    candidates: Coll<CandidatePair>,
    votes: Coll<Vote>,
    session_hash: String,
    candidate_pair_id: Id,
    now: DateTime<Utc>,
}

#[rocket::async_trait]
impl Transactional for CastBallot {
    type Output = VoteReceipt;

    async fn run(&self, session: &mut ClientSession) -> Result<VoteReceipt> {
        // 1. Who is voting?
        let voter = VoterSession::resolve_in(&self.sessions, &self.session_hash, self.now, session)
            .await?
            .ok_or(VoteError::Unauthorized)?;

        // 2. Are they still allowed to?
        let token = self
            .tokens
            .find_one_with_session(voter.token_id.as_doc(), None, session)
            .await?
            .ok_or(VoteError::Unauthorized)?;
        if token.status != TokenStatus::Unused {
            return Err(VoteError::TokenUsed.into());
        }
        let election = self
            .elections
            .find_one_with_session(voter.election_id.as_doc(), None, session)
            .await?
            .filter(|election| election.is_open(self.now))
            .ok_or(VoteError::ElectionInactive)?;

        // 3. Is the choice on their ballot?
        let candidate_filter = doc! {
            "_id": *self.candidate_pair_id,
            "election_id": *election.id,
            "is_active": true,
        };
        self.candidates
            .find_one_with_session(candidate_filter, None, session)
            .await?
            .ok_or(VoteError::InvalidCandidate)?;

        // 4. Record the vote.
        let vote = Vote {
            id: Id::new(),
            election_id: election.id,
            candidate_pair_id: self.candidate_pair_id,
            created_at: self.now,
        };
        self.votes
            .insert_one_with_session(&vote, None, session)
            .await?;

        // 5. Seal the token. Only a still-unused token matches.
        let filter = doc! { "_id": *token.id, "status": TokenStatus::Unused };
        let update = doc! {
            "$set": {
                "status": TokenStatus::Used,
                "used_at": BsonDateTime::from_chrono(self.now),
                "token": redact(token.id, RedactionKind::Used),
            }
        };
        let sealed = self
            .tokens
            .update_one_with_session(filter, update, None, session)
            .await?;
        if sealed.modified_count != 1 {
            return Err(VoteError::TokenUsed.into());
        }

        // 6. The session is spent.
        self.sessions
            .delete_one_with_session(voter.id.as_doc(), None, session)
            .await?;

        Ok(VoteReceipt {
            election_id: election.id,
            cast_at: self.now,
        })
    }
}

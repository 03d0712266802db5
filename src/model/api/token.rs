use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::model::{common::token::TokenStatus, db::token::Token};

use super::id::ApiId;

/// A voter's login request.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TokenLoginRequest {
    pub token: String,
}

/// An admin's request for a batch of tokens.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct GenerateTokens {
    pub count: u32,
    #[serde(default)]
    pub batch_label: Option<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct GeneratedTokens {
    pub created: u32,
}

/// A token as shown to admins. The raw string is only present while the
/// token is unused; afterwards nothing of it is stored.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TokenDescription {
    pub id: ApiId,
    pub election_id: ApiId,
    pub token: Option<String>,
    pub status: TokenStatus,
    pub generated_batch: Option<String>,
    pub created_at: DateTime<Utc>,
    pub used_at: Option<DateTime<Utc>>,
    pub invalidated_at: Option<DateTime<Utc>>,
}

impl From<Token> for TokenDescription {
    fn from(token: Token) -> Self {
        let raw = (token.status == TokenStatus::Unused).then_some(token.token);
        Self {
            id: token.id.into(),
            election_id: token.election_id.into(),
            token: raw,
            status: token.status,
            generated_batch: token.generated_batch,
            created_at: token.created_at,
            used_at: token.used_at.map(|at| at.to_chrono()),
            invalidated_at: token.invalidated_at.map(|at| at.to_chrono()),
        }
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct TokenCounts {
    pub unused: u32,
    pub used: u32,
    pub invalidated: u32,
}

/// Every token of an election, for printing and bookkeeping.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TokenSheet {
    pub counts: TokenCounts,
    pub tokens: Vec<TokenDescription>,
}

impl FromIterator<Token> for TokenSheet {
    fn from_iter<I: IntoIterator<Item = Token>>(iter: I) -> Self {
        let mut counts = TokenCounts::default();
        let tokens = iter
            .into_iter()
            .inspect(|token| match token.status {
                TokenStatus::Unused => counts.unused += 1,
                TokenStatus::Used => counts.used += 1,
                TokenStatus::Invalidated => counts.invalidated += 1,
            })
            .map(TokenDescription::from)
            .collect();
        Self { counts, tokens }
    }
}

use std::fmt::{self, Display};

use data_encoding::HEXLOWER;
use mongodb::bson::{to_bson, Bson};
use rand::Rng;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use thiserror::Error;

use crate::model::mongodb::Id;

/// Token characters. Excludes `I`, `O`, `0` and `1`, which are easily confused on paper.
pub const TOKEN_ALPHABET: &[u8; 32] = b"ABCDEFGHJKLMNPQRSTUVWXYZ23456789";

/// Characters either side of the dash.
const GROUP_LENGTH: usize = 4;

/// Characters in a token, not counting the dash.
pub const TOKEN_LENGTH: usize = 2 * GROUP_LENGTH;

/// Hex characters of digest kept in a redacted token.
const REDACTED_DIGEST_LENGTH: usize = 32;

/// Domain separator for redaction digests.
const REDACTION_CONTEXT: &[u8] = b"pilketos/token-redaction/v1";

/// Shape of a redacted token string, as a MongoDB regex. Agrees with [`is_redacted`].
pub const REDACTED_PATTERN: &str = "^(USED|VOID):[0-9a-f]{32}$";

/// Token lifecycle. Leaving `Unused` is terminal.
#[derive(Debug, Copy, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum TokenStatus {
    Unused,
    Used,
    Invalidated,
}

impl From<TokenStatus> for Bson {
    fn from(status: TokenStatus) -> Self {
        to_bson(&status).expect("Serialisation is infallible")
    }
}

/// A well-formed token string, `XXXX-YYYY`.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct TokenString(String);

impl TokenString {
    /// Generate a random token.
    pub fn generate<R: Rng + ?Sized>(rng: &mut R) -> Self {
        let chars: String = (0..TOKEN_LENGTH)
            .map(|_| char::from(TOKEN_ALPHABET[rng.gen_range(0..TOKEN_ALPHABET.len())]))
            .collect();
        Self::with_dash(&chars)
    }

    /// Normalise user input: drop anything that isn't alphanumeric, uppercase
    /// the rest, then check it is exactly one token.
    pub fn parse(input: &str) -> Result<Self, TokenError> {
        let chars: String = input
            .chars()
            .filter(char::is_ascii_alphanumeric)
            .map(|c| c.to_ascii_uppercase())
            .collect();
        if chars.len() != TOKEN_LENGTH || !chars.bytes().all(|b| TOKEN_ALPHABET.contains(&b)) {
            return Err(TokenError::Malformed);
        }
        Ok(Self::with_dash(&chars))
    }

    fn with_dash(chars: &str) -> Self {
        let (first, second) = chars.split_at(GROUP_LENGTH);
        Self(format!("{first}-{second}"))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl Display for TokenString {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Why a token's string is being redacted.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum RedactionKind {
    Used,
    Void,
}

impl RedactionKind {
    /// The redaction kind matching a terminal status, or `None` for `Unused`.
    pub fn for_status(status: TokenStatus) -> Option<Self> {
        match status {
            TokenStatus::Unused => None,
            TokenStatus::Used => Some(Self::Used),
            TokenStatus::Invalidated => Some(Self::Void),
        }
    }

    fn label(self) -> &'static str {
        match self {
            Self::Used => "USED",
            Self::Void => "VOID",
        }
    }
}

/// The string stored in place of a token once it leaves `Unused`.
///
/// Derived only from the token's ID, so it carries nothing of the original
/// string, and the same token always redacts to the same value.
pub fn redact(token_id: Id, kind: RedactionKind) -> String {
    let mut hasher = Sha256::new();
    hasher.update(REDACTION_CONTEXT);
    hasher.update([0u8]);
    hasher.update(kind.label().as_bytes());
    hasher.update([0u8]);
    hasher.update(token_id.bytes());
    let digest = HEXLOWER.encode(&hasher.finalize());
    format!("{}:{}", kind.label(), &digest[..REDACTED_DIGEST_LENGTH])
}

/// Has this stored string already been redacted?
pub fn is_redacted(stored: &str) -> bool {
    [RedactionKind::Used, RedactionKind::Void]
        .iter()
        .any(|kind| match stored.strip_prefix(kind.label()) {
            Some(rest) => {
                rest.len() == REDACTED_DIGEST_LENGTH + 1
                    && rest.starts_with(':')
                    && rest[1..].bytes().all(|b| matches!(b, b'0'..=b'9' | b'a'..=b'f'))
            }
            None => false,
        })
}

/// Reasons a token cannot be used or managed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum TokenError {
    #[error("Token is not in the expected format")]
    Malformed,
    #[error("Token not recognised")]
    NotFound,
    #[error("Token has already been used")]
    AlreadyUsed,
    #[error("The election for this token is not open")]
    ElectionNotActive,
    #[error("Tokens can only be changed while the election is in DRAFT")]
    ElectionNotDraft,
    #[error("A used token cannot be invalidated")]
    UsedNotInvalidatable,
    #[error("Could not find an unused token string")]
    Exhausted,
}

impl TokenError {
    pub fn code(&self) -> &'static str {
        match self {
            // Malformed and unknown tokens are indistinguishable to the client.
            Self::Malformed | Self::NotFound => "TOKEN_INVALID",
            Self::AlreadyUsed => "TOKEN_USED",
            Self::ElectionNotActive => "ELECTION_INACTIVE",
            Self::ElectionNotDraft | Self::UsedNotInvalidatable => "BAD_REQUEST",
            Self::Exhausted => "INTERNAL_ERROR",
        }
    }
}

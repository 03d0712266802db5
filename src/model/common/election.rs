use std::fmt::{self, Display};

use chrono::{DateTime, Utc};
use mongodb::bson::{to_bson, Bson};
use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Longest slug accepted.
pub const MAX_SLUG_LENGTH: usize = 64;

/// States in the Election lifecycle.
#[derive(Debug, Copy, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ElectionStatus {
    /// Under construction, only visible to admins. Tokens and candidates can be added.
    Draft,
    /// Accepting votes. At most one election is in this state.
    Active,
    /// No longer accepting votes. Results may be made public.
    Closed,
    /// Retained for the record.
    Archived,
}

impl Display for ElectionStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::Draft => "DRAFT",
            Self::Active => "ACTIVE",
            Self::Closed => "CLOSED",
            Self::Archived => "ARCHIVED",
        };
        f.write_str(name)
    }
}

impl From<ElectionStatus> for Bson {
    fn from(status: ElectionStatus) -> Self {
        to_bson(&status).expect("Serialisation is infallible")
    }
}

/// Admin-triggered status transitions.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum Transition {
    Activate,
    Close,
    Archive,
}

impl Transition {
    /// The only status this transition may start from.
    pub fn source(self) -> ElectionStatus {
        match self {
            Self::Activate => ElectionStatus::Draft,
            Self::Close => ElectionStatus::Active,
            Self::Archive => ElectionStatus::Closed,
        }
    }

    /// The status this transition ends in.
    pub fn target(self) -> ElectionStatus {
        match self {
            Self::Activate => ElectionStatus::Active,
            Self::Close => ElectionStatus::Closed,
            Self::Archive => ElectionStatus::Archived,
        }
    }

    /// Check the transition is legal from `current`.
    pub fn check(self, current: ElectionStatus) -> Result<(), ElectionError> {
        if current == self.source() {
            Ok(())
        } else {
            Err(ElectionError::InvalidTransition {
                from: current,
                to: self.target(),
            })
        }
    }
}

/// An election's voting window. The start is always strictly before the end.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub struct Schedule {
    start: DateTime<Utc>,
    end: DateTime<Utc>,
}

impl Schedule {
    pub fn new(start: DateTime<Utc>, end: DateTime<Utc>) -> Result<Self, ElectionError> {
        if end <= start {
            return Err(ElectionError::ScheduleOrder);
        }
        Ok(Self { start, end })
    }

    pub fn start(&self) -> DateTime<Utc> {
        self.start
    }

    pub fn end(&self) -> DateTime<Utc> {
        self.end
    }
}

/// Check a slug is usable in a URL: lowercase ASCII letters, digits and
/// single hyphens, not starting or ending with a hyphen.
pub fn validate_slug(slug: &str) -> Result<(), ElectionError> {
    let valid_chars = slug
        .bytes()
        .all(|b| b.is_ascii_lowercase() || b.is_ascii_digit() || b == b'-');
    if slug.is_empty()
        || slug.len() > MAX_SLUG_LENGTH
        || !valid_chars
        || slug.starts_with('-')
        || slug.ends_with('-')
        || slug.contains("--")
    {
        return Err(ElectionError::InvalidSlug);
    }
    Ok(())
}

/// Election lifecycle violations.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ElectionError {
    #[error("Election end must be after its start")]
    ScheduleOrder,
    #[error("Slug must be lowercase letters, digits and single hyphens")]
    InvalidSlug,
    #[error("Slug is already used by another election")]
    SlugTaken,
    #[error("Cannot move election from {from} to {to}")]
    InvalidTransition {
        from: ElectionStatus,
        to: ElectionStatus,
    },
    #[error("Another election is already active")]
    ActiveElectionExists,
    #[error("Election can only be activated during its schedule")]
    OutsideSchedule,
    #[error("Election can only be changed this way while in DRAFT")]
    NotDraft,
    #[error("Results visibility can only be changed while CLOSED")]
    NotClosed,
}

impl ElectionError {
    pub fn code(&self) -> &'static str {
        match self {
            Self::ScheduleOrder => "SCHEDULE_INVALID",
            Self::InvalidSlug => "SLUG_INVALID",
            Self::SlugTaken => "SLUG_TAKEN",
            Self::InvalidTransition { .. } => "INVALID_TRANSITION",
            Self::ActiveElectionExists => "ACTIVE_ELECTION_EXISTS",
            Self::OutsideSchedule => "OUTSIDE_SCHEDULE",
            Self::NotDraft => "ELECTION_NOT_DRAFT",
            Self::NotClosed => "ELECTION_NOT_CLOSED",
        }
    }
}

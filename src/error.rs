use argon2::Error as Argon2Error;
use mongodb::error::Error as DbError;
use rocket::{
    http::{Status, StatusClass},
    response::{self, Responder},
    serde::json::Json,
    Request, Response,
};
use serde::Serialize;
use thiserror::Error;

use crate::logging::{FailureCode, RequestId};
use crate::model::common::{election::ElectionError, token::TokenError};
use crate::model::db::vote::VoteError;
use crate::rate_limit::Decision;

pub type Result<T> = std::result::Result<T, Error>;

#[derive(Debug, Error)]
pub enum Error {
    #[error(transparent)]
    Db(#[from] DbError),
    #[error(transparent)]
    Argon2(#[from] Argon2Error),
    #[error(transparent)]
    Token(#[from] TokenError),
    #[error(transparent)]
    Election(#[from] ElectionError),
    #[error(transparent)]
    Vote(#[from] VoteError),
    #[error("Bad request: {0}")]
    BadRequest(String),
    #[error("Unauthorized: {0}")]
    Unauthorized(String),
    #[error("Not found: {0}")]
    NotFound(String),
    #[error("Conflict: {0}")]
    Conflict(String),
    #[error("Rate limit exceeded")]
    RateLimited(Decision),
    #[error("Internal error: {0}")]
    Internal(String),
}

impl Error {
    pub fn not_found(what: impl Into<String>) -> Self {
        Self::NotFound(what.into())
    }

    /// HTTP status for this error.
    pub fn status(&self) -> Status {
        match self {
            Self::Db(_) | Self::Argon2(_) | Self::Internal(_) => Status::InternalServerError,
            Self::BadRequest(_) => Status::BadRequest,
            Self::Unauthorized(_) => Status::Unauthorized,
            Self::NotFound(_) => Status::NotFound,
            Self::Conflict(_) => Status::Conflict,
            Self::RateLimited(_) => Status::TooManyRequests,
            Self::Token(e) => match e {
                TokenError::Malformed | TokenError::NotFound => Status::BadRequest,
                TokenError::AlreadyUsed | TokenError::ElectionNotActive => Status::Conflict,
                TokenError::ElectionNotDraft | TokenError::UsedNotInvalidatable => {
                    Status::BadRequest
                }
                TokenError::Exhausted => Status::InternalServerError,
            },
            Self::Election(e) => match e {
                ElectionError::ScheduleOrder | ElectionError::InvalidSlug => Status::BadRequest,
                _ => Status::Conflict,
            },
            Self::Vote(e) => match e {
                VoteError::Unauthorized => Status::Unauthorized,
                VoteError::TokenUsed | VoteError::ElectionInactive => Status::Conflict,
                VoteError::InvalidCandidate => Status::BadRequest,
            },
        }
    }

    /// Stable machine-readable code. Clients branch on this, not on the message.
    pub fn code(&self) -> &'static str {
        match self {
            Self::Db(_) | Self::Argon2(_) | Self::Internal(_) => "INTERNAL_ERROR",
            Self::BadRequest(_) => "BAD_REQUEST",
            Self::Unauthorized(_) => "UNAUTHORIZED",
            Self::NotFound(_) => "NOT_FOUND",
            Self::Conflict(_) => "CONFLICT",
            Self::RateLimited(_) => "RATE_LIMITED",
            Self::Token(e) => e.code(),
            Self::Election(e) => e.code(),
            Self::Vote(e) => e.code(),
        }
    }

    /// Message safe to show to the client.
    fn public_message(&self) -> String {
        match self.status().class() {
            StatusClass::ServerError => "An internal error occurred".to_string(),
            _ => self.to_string(),
        }
    }
}

/// The JSON body of every error response.
#[derive(Debug, Serialize)]
pub struct ErrorBody {
    pub code: &'static str,
    pub message: String,
}

impl ErrorBody {
    pub fn new(code: &'static str, message: impl Into<String>) -> Self {
        Self {
            code,
            message: message.into(),
        }
    }
}

impl<'r, 'o: 'r> Responder<'r, 'o> for Error {
    fn respond_to(self, req: &'r Request<'_>) -> response::Result<'o> {
        let id = RequestId::of(req);
        let status = self.status();
        match status.class() {
            StatusClass::ServerError => error!("{id} failed: {self:?}"),
            _ => debug!("{id} rejected: {self}"),
        }
        FailureCode::record(req, self.code());

        let retry_after = match &self {
            Self::RateLimited(decision) => Some(decision.retry_after()),
            _ => None,
        };
        let body = ErrorBody::new(self.code(), self.public_message());
        let mut response = Response::build_from(Json(body).respond_to(req)?);
        response.status(status);
        if let Some(seconds) = retry_after {
            response.raw_header("Retry-After", seconds.to_string());
        }
        response.ok()
    }
}

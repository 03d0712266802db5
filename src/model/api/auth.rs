use chrono::{DateTime, Utc};
use mongodb::Database;
use rocket::{
    http::{Cookie, CookieJar, SameSite, Status},
    request::{FromRequest, Outcome},
    Request, State,
};
use serde::{Deserialize, Serialize};

use crate::error::Error;
use crate::model::{
    common::secret::SessionSecret,
    db::session::{AdminSession, VoterSession},
    mongodb::Coll,
};
use crate::Config;

use super::id::ApiId;

pub const VOTER_SESSION_COOKIE: &str = "voter_session";
pub const ADMIN_SESSION_COOKIE: &str = "admin_session";

/// Which kind of session a cookie carries.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionKind {
    Voter,
    Admin,
}

impl SessionKind {
    pub fn cookie_name(self) -> &'static str {
        match self {
            Self::Voter => VOTER_SESSION_COOKIE,
            Self::Admin => ADMIN_SESSION_COOKIE,
        }
    }

    /// A cookie carrying `secret`, living as long as the session does.
    pub fn cookie(self, secret: &SessionSecret, config: &Config) -> Cookie<'static> {
        let ttl = match self {
            Self::Voter => config.voter_session_ttl(),
            Self::Admin => config.admin_session_ttl(),
        };
        Cookie::build((self.cookie_name(), secret.as_str().to_string()))
            .path("/")
            .max_age(rocket::time::Duration::seconds(ttl.num_seconds()))
            .http_only(true)
            .same_site(SameSite::Strict)
            .secure(config.secure_cookies())
            .build()
    }

    /// The secret presented by the client, if any.
    pub fn secret(self, cookies: &CookieJar<'_>) -> Option<SessionSecret> {
        cookies
            .get(self.cookie_name())
            .map(|cookie| SessionSecret::from_client(cookie.value()))
    }

    /// Tell the client to drop its cookie.
    pub fn clear(self, cookies: &CookieJar<'_>) {
        cookies.remove(Cookie::build(self.cookie_name()).path("/"));
    }
}

/// Returned on login. The secret itself only travels in the cookie.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SessionDescription {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub election_id: Option<ApiId>,
    pub expires_at: DateTime<Utc>,
}

impl From<&VoterSession> for SessionDescription {
    fn from(session: &VoterSession) -> Self {
        Self {
            election_id: Some(session.election_id.into()),
            expires_at: session.expires_at,
        }
    }
}

impl From<&AdminSession> for SessionDescription {
    fn from(session: &AdminSession) -> Self {
        Self {
            election_id: None,
            expires_at: session.expires_at,
        }
    }
}

/// A logged-in voter whose token is still unused.
pub struct VoterAuth {
    pub session: VoterSession,
    pub secret: SessionSecret,
}

#[rocket::async_trait]
impl<'r> FromRequest<'r> for VoterAuth {
    type Error = Error;

    async fn from_request(req: &'r Request<'_>) -> Outcome<Self, Self::Error> {
        let secret = match SessionKind::Voter.secret(req.cookies()) {
            Some(secret) => secret,
            None => return unauthorized("Not logged in"),
        };
        let db = match req.guard::<&State<Database>>().await {
            Outcome::Success(db) => db,
            _ => return internal("Database is not in managed state"),
        };

        let sessions = Coll::from_db(db);
        let tokens = Coll::from_db(db);
        match VoterSession::authenticate(&sessions, &tokens, &secret, Utc::now()).await {
            Ok(Some(session)) => Outcome::Success(Self { session, secret }),
            Ok(None) => unauthorized("Session is invalid or has expired"),
            Err(e) => Outcome::Error((Status::InternalServerError, e)),
        }
    }
}

/// A logged-in admin.
pub struct AdminAuth {
    pub session: AdminSession,
}

#[rocket::async_trait]
impl<'r> FromRequest<'r> for AdminAuth {
    type Error = Error;

    async fn from_request(req: &'r Request<'_>) -> Outcome<Self, Self::Error> {
        let secret = match SessionKind::Admin.secret(req.cookies()) {
            Some(secret) => secret,
            None => return unauthorized("Not logged in"),
        };
        let db = match req.guard::<&State<Database>>().await {
            Outcome::Success(db) => db,
            _ => return internal("Database is not in managed state"),
        };

        match AdminSession::resolve(&Coll::from_db(db), &secret, Utc::now()).await {
            Ok(Some(session)) => Outcome::Success(Self { session }),
            Ok(None) => unauthorized("Session is invalid or has expired"),
            Err(e) => Outcome::Error((Status::InternalServerError, e)),
        }
    }
}

fn unauthorized<S>(reason: &str) -> Outcome<S, Error> {
    Outcome::Error((Status::Unauthorized, Error::Unauthorized(reason.to_string())))
}

fn internal<S>(reason: &str) -> Outcome<S, Error> {
    error!("{reason}");
    Outcome::Error((Status::InternalServerError, Error::Internal(reason.to_string())))
}

use chrono::{DateTime, Duration, Utc};
use mongodb::{
    bson::{doc, serde_helpers::chrono_datetime_as_bson_datetime, DateTime as BsonDateTime},
    Client, ClientSession,
};
use serde::{Deserialize, Serialize};

use crate::error::Result;
use crate::model::{
    common::{secret::SessionSecret, token::TokenStatus},
    db::{election::Election, token::Token},
    mongodb::{transact, Coll, Id, Transactional},
};

/// A voter's login, bound to exactly one unused token.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct VoterSession {
    #[serde(rename = "_id")]
    pub id: Id,
    /// Unique: a token backs at most one session.
    pub token_id: Id,
    pub election_id: Id,
    pub session_hash: String,
    #[serde(with = "chrono_datetime_as_bson_datetime")]
    pub created_at: DateTime<Utc>,
    #[serde(with = "chrono_datetime_as_bson_datetime")]
    pub expires_at: DateTime<Utc>,
}

impl VoterSession {
    /// A new session for `token`, and the secret that authenticates it.
    pub fn new(token: &Token, now: DateTime<Utc>, ttl: Duration) -> (SessionSecret, Self) {
        let secret = SessionSecret::generate();
        let session = Self {
            id: Id::new(),
            token_id: token.id,
            election_id: token.election_id,
            session_hash: secret.hash(),
            created_at: now,
            expires_at: now + ttl,
        };
        (secret, session)
    }

    /// Log in with a token typed by a voter. The token is checked but not
    /// consumed, and any earlier session for it is replaced.
    pub async fn login(
        db_client: &Client,
        tokens: &Coll<Token>,
        elections: &Coll<Election>,
        sessions: &Coll<VoterSession>,
        input: &str,
        now: DateTime<Utc>,
        ttl: Duration,
    ) -> Result<(SessionSecret, Self)> {
        let (token, _) = Token::redeem(tokens, elections, input, now).await?;
        let (secret, session) = Self::new(&token, now, ttl);
        let op = Supersede {
            sessions: sessions.clone(),
            session,
        };
        let session = transact(db_client, &op).await?;
        debug!("Issued voter session for token {}", session.token_id);
        Ok((secret, session))
    }

    /// Look up an unexpired session by the hash of its secret.
    pub async fn resolve(
        sessions: &Coll<VoterSession>,
        secret: &SessionSecret,
        now: DateTime<Utc>,
    ) -> Result<Option<Self>> {
        Ok(sessions.find_one(live_filter(&secret.hash(), now), None).await?)
    }

    /// As [`VoterSession::resolve`], inside a transaction.
    pub async fn resolve_in(
        sessions: &Coll<VoterSession>,
        session_hash: &str,
        now: DateTime<Utc>,
        session: &mut ClientSession,
    ) -> Result<Option<Self>> {
        Ok(sessions
            .find_one_with_session(live_filter(session_hash, now), None, session)
            .await?)
    }

    /// Resolve a session and check its token is still unused. Sessions whose
    /// token has moved on are treated as missing, even before the sweeper
    /// removes them.
    pub async fn authenticate(
        sessions: &Coll<VoterSession>,
        tokens: &Coll<Token>,
        secret: &SessionSecret,
        now: DateTime<Utc>,
    ) -> Result<Option<Self>> {
        let session = match Self::resolve(sessions, secret, now).await? {
            Some(session) => session,
            None => return Ok(None),
        };
        let filter = doc! { "_id": *session.token_id, "status": TokenStatus::Unused };
        let live_token = tokens.count_documents(filter, None).await? == 1;
        Ok(live_token.then_some(session))
    }

    /// Delete the session for this secret, if there is one.
    pub async fn logout(sessions: &Coll<VoterSession>, secret: &SessionSecret) -> Result<()> {
        sessions
            .delete_one(doc! { "session_hash": secret.hash() }, None)
            .await?;
        Ok(())
    }
}

/// Replace any session for the same token with a new one.
struct Supersede {
    sessions: Coll<VoterSession>,
    session: VoterSession,
}

#[rocket::async_trait]
impl Transactional for Supersede {
    type Output = VoterSession;

    async fn run(&self, session: &mut ClientSession) -> Result<VoterSession> {
        self.sessions
            .delete_many_with_session(doc! { "token_id": *self.session.token_id }, None, session)
            .await?;
        self.sessions
            .insert_one_with_session(&self.session, None, session)
            .await?;
        Ok(self.session.clone())
    }
}

/// An admin's login.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AdminSession {
    #[serde(rename = "_id")]
    pub id: Id,
    pub admin_id: Id,
    pub session_hash: String,
    #[serde(with = "chrono_datetime_as_bson_datetime")]
    pub created_at: DateTime<Utc>,
    #[serde(with = "chrono_datetime_as_bson_datetime")]
    pub expires_at: DateTime<Utc>,
}

impl AdminSession {
    /// Start a session for the given admin.
    pub async fn create(
        sessions: &Coll<AdminSession>,
        admin_id: Id,
        now: DateTime<Utc>,
        ttl: Duration,
    ) -> Result<(SessionSecret, Self)> {
        let secret = SessionSecret::generate();
        let session = Self {
            id: Id::new(),
            admin_id,
            session_hash: secret.hash(),
            created_at: now,
            expires_at: now + ttl,
        };
        sessions.insert_one(&session, None).await?;
        Ok((secret, session))
    }

    /// Look up an unexpired session by the hash of its secret.
    pub async fn resolve(
        sessions: &Coll<AdminSession>,
        secret: &SessionSecret,
        now: DateTime<Utc>,
    ) -> Result<Option<Self>> {
        Ok(sessions.find_one(live_filter(&secret.hash(), now), None).await?)
    }

    /// Delete the session for this secret, if there is one.
    pub async fn logout(sessions: &Coll<AdminSession>, secret: &SessionSecret) -> Result<()> {
        sessions
            .delete_one(doc! { "session_hash": secret.hash() }, None)
            .await?;
        Ok(())
    }
}

/// Matches the session with this hash, unless it has expired.
fn live_filter(session_hash: &str, now: DateTime<Utc>) -> mongodb::bson::Document {
    doc! {
        "session_hash": session_hash,
        "expires_at": { "$gt": BsonDateTime::from_chrono(now) },
    }
}

use std::ops::Deref;

use mongodb::{
    bson::doc, error::Error as DbError, options::IndexOptions, Collection, Database, IndexModel,
};
use rocket::{
    http::Status,
    request::{self, FromRequest, Request},
    State,
};

use crate::model::{
    common::{election::ElectionStatus, token::TokenStatus},
    db::{
        admin::{Admin, NewAdmin},
        candidate::{CandidatePair, NewCandidatePair},
        election::{Election, NewElection},
        session::{AdminSession, VoterSession},
        token::Token,
        vote::Vote,
    },
};

use super::guard::Guard;

/// A type that can be directly inserted/read to/from the database.
pub trait MongoCollection {
    /// The name of the collection.
    const NAME: &'static str;
}

/// A database collection of the given type.
pub struct Coll<T>(Collection<T>);

impl<T> Coll<T>
where
    T: MongoCollection,
{
    /// Get a handle on this collection in the given database.
    pub fn from_db(db: &Database) -> Self {
        Self(db.collection(T::NAME))
    }
}

// `Derive(Clone)` would only derive if `T: Clone`, but we don't need that bound.
impl<T> Clone for Coll<T> {
    fn clone(&self) -> Self {
        Self(self.0.clone())
    }
}

impl<T> Deref for Coll<T> {
    type Target = Collection<T>;

    fn deref(&self) -> &Self::Target {
        &self.0
    }
}

#[rocket::async_trait]
impl<'r, T> FromRequest<'r> for Coll<T>
where
    T: MongoCollection,
{
    type Error = ();

    /// Get the database connection from the managed state and wrap it in a collection.
    async fn from_request(req: &'r Request<'_>) -> request::Outcome<Self, Self::Error> {
        match req.guard::<&State<Database>>().await {
            request::Outcome::Success(db) => request::Outcome::Success(Coll::from_db(db)),
            _ => {
                error!("Database is not in managed state");
                request::Outcome::Error((Status::InternalServerError, ()))
            }
        }
    }
}

// Admin collections
const ADMINS: &str = "admins";
impl MongoCollection for Admin {
    const NAME: &'static str = ADMINS;
}
impl MongoCollection for NewAdmin {
    const NAME: &'static str = ADMINS;
}

const ADMIN_SESSIONS: &str = "admin_sessions";
impl MongoCollection for AdminSession {
    const NAME: &'static str = ADMIN_SESSIONS;
}

// Election collections
const ELECTIONS: &str = "elections";
impl MongoCollection for Election {
    const NAME: &'static str = ELECTIONS;
}
impl MongoCollection for NewElection {
    const NAME: &'static str = ELECTIONS;
}

// Candidate collections
const CANDIDATES: &str = "candidates";
impl MongoCollection for CandidatePair {
    const NAME: &'static str = CANDIDATES;
}
impl MongoCollection for NewCandidatePair {
    const NAME: &'static str = CANDIDATES;
}

// Voting collections
const TOKENS: &str = "tokens";
impl MongoCollection for Token {
    const NAME: &'static str = TOKENS;
}

const VOTER_SESSIONS: &str = "voter_sessions";
impl MongoCollection for VoterSession {
    const NAME: &'static str = VOTER_SESSIONS;
}

const VOTES: &str = "votes";
impl MongoCollection for Vote {
    const NAME: &'static str = VOTES;
}

// Guard collection
const LOCKS: &str = "locks";
impl MongoCollection for Guard {
    const NAME: &'static str = LOCKS;
}

/// Ensure that all the required indexes exist on the given database.
/// Creating an index also creates its collection, which must happen before
/// any transaction writes to it.
///
/// This operation is idempotent.
pub async fn ensure_indexes_exist(db: &Database) -> Result<(), DbError> {
    debug!("Ensuring collection indexes exist");

    let unique = IndexOptions::builder().unique(true).build();

    // Admin collections.
    let admin_index = IndexModel::builder()
        .keys(doc! {"username": 1})
        .options(unique.clone())
        .build();
    Coll::<Admin>::from_db(db)
        .create_index(admin_index, None)
        .await?;
    let admin_session_indexes = [
        IndexModel::builder()
            .keys(doc! {"session_hash": 1})
            .options(unique.clone())
            .build(),
        IndexModel::builder().keys(doc! {"expires_at": 1}).build(),
    ];
    Coll::<AdminSession>::from_db(db)
        .create_indexes(admin_session_indexes, None)
        .await?;

    // Election collection. The partial index backs up the procedural
    // single-active-election check.
    let single_active = IndexOptions::builder()
        .unique(true)
        .partial_filter_expression(doc! {"status": ElectionStatus::Active})
        .name("single_active_election".to_string())
        .build();
    let election_indexes = [
        IndexModel::builder()
            .keys(doc! {"slug": 1})
            .options(unique.clone())
            .build(),
        IndexModel::builder()
            .keys(doc! {"status": 1})
            .options(single_active)
            .build(),
    ];
    Coll::<Election>::from_db(db)
        .create_indexes(election_indexes, None)
        .await?;

    // Candidate collection.
    let candidate_index = IndexModel::builder()
        .keys(doc! {"election_id": 1, "number": 1})
        .options(unique.clone())
        .build();
    Coll::<CandidatePair>::from_db(db)
        .create_index(candidate_index, None)
        .await?;

    // Token collection. Redacted strings are unique by construction, so
    // uniqueness is only enforced while the raw string is stored.
    let unused_unique = IndexOptions::builder()
        .unique(true)
        .partial_filter_expression(doc! {"status": TokenStatus::Unused})
        .name("unique_unused_token".to_string())
        .build();
    let token_indexes = [
        IndexModel::builder()
            .keys(doc! {"election_id": 1, "token": 1})
            .options(unused_unique)
            .build(),
        IndexModel::builder().keys(doc! {"token": 1}).build(),
        IndexModel::builder()
            .keys(doc! {"election_id": 1, "status": 1})
            .build(),
    ];
    Coll::<Token>::from_db(db)
        .create_indexes(token_indexes, None)
        .await?;

    // Voter session collection.
    let voter_session_indexes = [
        IndexModel::builder()
            .keys(doc! {"token_id": 1})
            .options(unique.clone())
            .build(),
        IndexModel::builder()
            .keys(doc! {"session_hash": 1})
            .options(unique)
            .build(),
        IndexModel::builder().keys(doc! {"expires_at": 1}).build(),
    ];
    Coll::<VoterSession>::from_db(db)
        .create_indexes(voter_session_indexes, None)
        .await?;

    // Vote collection.
    let vote_index = IndexModel::builder()
        .keys(doc! {"election_id": 1, "candidate_pair_id": 1})
        .build();
    Coll::<Vote>::from_db(db)
        .create_index(vote_index, None)
        .await?;

    Ok(())
}

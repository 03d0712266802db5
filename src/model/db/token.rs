use std::collections::HashSet;

use chrono::{DateTime, Utc};
use mongodb::{
    bson::{doc, serde_helpers::chrono_datetime_as_bson_datetime, DateTime as BsonDateTime},
    options::FindOptions,
    Client, ClientSession,
};
use rocket::futures::TryStreamExt;
use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};
use crate::model::{
    common::{
        token::{redact, RedactionKind, TokenError, TokenStatus, TokenString},
    },
    db::{election::Election, session::VoterSession},
    mongodb::{errors::is_duplicate_key, transact, Coll, Id, Transactional},
};

/// Most tokens generated by one request.
pub const MAX_TOKENS_PER_BATCH: u32 = 5000;

/// Collisions tolerated while generating one token before giving up.
pub const MAX_COLLISIONS_PER_TOKEN: u32 = 32;

/// Most tokens inserted by one transaction.
pub const GENERATION_CHUNK: u32 = 500;

/// Longest accepted batch label.
pub const MAX_BATCH_LABEL_LENGTH: usize = 64;

/// A single-use voting token, as stored in the database.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Token {
    #[serde(rename = "_id")]
    pub id: Id,
    pub election_id: Id,
    /// The raw `XXXX-YYYY` string while unused, its redaction afterwards.
    pub token: String,
    pub status: TokenStatus,
    #[serde(default)]
    pub generated_batch: Option<String>,
    #[serde(with = "chrono_datetime_as_bson_datetime")]
    pub created_at: DateTime<Utc>,
    #[serde(default)]
    pub used_at: Option<BsonDateTime>,
    #[serde(default)]
    pub invalidated_at: Option<BsonDateTime>,
}

impl Token {
    /// A fresh unused token.
    pub fn new(
        election_id: Id,
        token: TokenString,
        generated_batch: Option<String>,
        now: DateTime<Utc>,
    ) -> Self {
        Self {
            id: Id::new(),
            election_id,
            token: token.as_str().to_string(),
            status: TokenStatus::Unused,
            generated_batch,
            created_at: now,
            used_at: None,
            invalidated_at: None,
        }
    }

    /// Find a token by ID inside a transaction, failing with `NotFound`.
    pub async fn find_in(tokens: &Coll<Token>, id: Id, session: &mut ClientSession) -> Result<Self> {
        tokens
            .find_one_with_session(id.as_doc(), None, session)
            .await?
            .ok_or_else(|| Error::not_found(format!("Token {id}")))
    }

    /// Generate `count` tokens for a DRAFT election. Returns how many were created.
    ///
    /// Tokens are inserted in chunks of [`GENERATION_CHUNK`], each in its own
    /// transaction that claims the election as DRAFT. Once the election is
    /// activated no further chunk can land; chunks committed before that stay.
    pub async fn generate(
        db_client: &Client,
        elections: &Coll<Election>,
        tokens: &Coll<Token>,
        election_id: Id,
        count: u32,
        batch_label: Option<String>,
        now: DateTime<Utc>,
    ) -> Result<u32> {
        if !(1..=MAX_TOKENS_PER_BATCH).contains(&count) {
            return Err(Error::BadRequest(format!(
                "Token count must be between 1 and {MAX_TOKENS_PER_BATCH}"
            )));
        }
        let batch_label = normalize_batch_label(batch_label)?;

        let mut created = 0;
        while created < count {
            let size = (count - created).min(GENERATION_CHUNK);
            let chunk = GenerateChunk {
                elections: elections.clone(),
                tokens: tokens.clone(),
                election_id,
                size,
                batch_label: batch_label.clone(),
                now,
            };
            match Self::generate_chunk(db_client, &chunk).await {
                Ok(inserted) => created += inserted,
                Err(e) => {
                    if created > 0 {
                        warn!("Token generation for election {election_id} stopped after {created} of {count}: {e}");
                    }
                    return Err(e);
                }
            }
        }

        info!("Generated {created} tokens for election {election_id}");
        Ok(created)
    }

    /// Insert one chunk. A duplicate key means another request inserted one
    /// of our candidates after we checked, so the chunk is redrawn.
    async fn generate_chunk(db_client: &Client, chunk: &GenerateChunk) -> Result<u32> {
        for _ in 0..MAX_COLLISIONS_PER_TOKEN {
            match transact(db_client, chunk).await {
                Err(Error::Db(e)) if is_duplicate_key(&e) => {
                    debug!("Token chunk for election {} collided, redrawing", chunk.election_id);
                }
                result => return result,
            }
        }
        error!(
            "Gave up generating tokens for election {} after {MAX_COLLISIONS_PER_TOKEN} collisions",
            chunk.election_id
        );
        Err(TokenError::Exhausted.into())
    }

    /// Check a token typed by a voter, without consuming it.
    ///
    /// The same string may exist in several elections; the one whose
    /// election is open wins, so only genuinely unusable tokens fail.
    pub async fn redeem(
        tokens: &Coll<Token>,
        elections: &Coll<Election>,
        input: &str,
        now: DateTime<Utc>,
    ) -> Result<(Self, Election)> {
        let token_string = TokenString::parse(input)?;
        let matches: Vec<Token> = tokens
            .find(doc! { "token": token_string.as_str() }, None)
            .await?
            .try_collect()
            .await?;

        let mut best: Option<std::result::Result<(Token, Election), TokenError>> = None;
        for token in matches {
            let election = match elections.find_one(token.election_id.as_doc(), None).await? {
                Some(election) => election,
                None => continue,
            };
            let outcome = if token.status != TokenStatus::Unused {
                Err(TokenError::AlreadyUsed)
            } else if !election.is_open(now) {
                Err(TokenError::ElectionNotActive)
            } else {
                Ok((token, election))
            };
            if best.as_ref().map_or(true, |b| rank(&outcome) < rank(b)) {
                best = Some(outcome);
            }
        }

        match best {
            Some(outcome) => Ok(outcome?),
            None => Err(TokenError::NotFound.into()),
        }
    }

    /// Invalidate an unused token of a DRAFT election, redacting it and
    /// dropping any session it backs. Invalidating twice is a no-op.
    pub async fn invalidate(
        db_client: &Client,
        tokens: &Coll<Token>,
        elections: &Coll<Election>,
        sessions: &Coll<VoterSession>,
        token_id: Id,
        now: DateTime<Utc>,
    ) -> Result<Self> {
        let op = Invalidate {
            tokens: tokens.clone(),
            elections: elections.clone(),
            sessions: sessions.clone(),
            token_id,
            now,
        };
        transact(db_client, &op).await
    }

    /// All tokens of an election in creation order.
    pub async fn for_election(tokens: &Coll<Token>, election_id: Id) -> Result<Vec<Self>> {
        let options = FindOptions::builder()
            .sort(doc! { "created_at": 1, "_id": 1 })
            .build();
        Ok(tokens
            .find(doc! { "election_id": *election_id }, options)
            .await?
            .try_collect()
            .await?)
    }
}

/// Order of preference between redemption outcomes.
fn rank(outcome: &std::result::Result<(Token, Election), TokenError>) -> u8 {
    match outcome {
        Ok(_) => 0,
        Err(TokenError::ElectionNotActive) => 1,
        Err(_) => 2,
    }
}

fn normalize_batch_label(label: Option<String>) -> Result<Option<String>> {
    match label.as_deref().map(str::trim) {
        None | Some("") => Ok(None),
        Some(label) if label.chars().count() > MAX_BATCH_LABEL_LENGTH => Err(Error::BadRequest(
            format!("Batch label must be at most {MAX_BATCH_LABEL_LENGTH} characters"),
        )),
        Some(label) => Ok(Some(label.to_string())),
    }
}

/// Draw `wanted` distinct candidates, none of them in `seen`.
fn draw_candidates(wanted: usize, seen: &HashSet<String>) -> Vec<TokenString> {
    let mut rng = rand::thread_rng();
    let mut drawn: HashSet<TokenString> = HashSet::with_capacity(wanted);
    let mut draws = 0;
    while drawn.len() < wanted && draws < wanted * MAX_COLLISIONS_PER_TOKEN as usize {
        let candidate = TokenString::generate(&mut rng);
        if !seen.contains(candidate.as_str()) {
            drawn.insert(candidate);
        }
        draws += 1;
    }
    drawn.into_iter().collect()
}

struct GenerateChunk {
    elections: Coll<Election>,
    tokens: Coll<Token>,
    election_id: Id,
    size: u32,
    batch_label: Option<String>,
    now: DateTime<Utc>,
}

#[rocket::async_trait]
impl Transactional for GenerateChunk {
    type Output = u32;

    async fn run(&self, session: &mut ClientSession) -> Result<u32> {
        let claimed = Election::claim_draft(&self.elections, self.election_id, session).await?;
        if claimed.is_none() {
            return Err(TokenError::ElectionNotDraft.into());
        }

        // Redraw candidates already present in the election.
        let wanted = self.size as usize;
        let mut seen: HashSet<String> = HashSet::with_capacity(wanted);
        let mut fresh: Vec<TokenString> = Vec::with_capacity(wanted);
        for _ in 0..MAX_COLLISIONS_PER_TOKEN {
            if fresh.len() == wanted {
                break;
            }
            let drawn = draw_candidates(wanted - fresh.len(), &seen);
            let strings: Vec<&str> = drawn.iter().map(TokenString::as_str).collect();
            let filter = doc! {
                "election_id": *self.election_id,
                "token": { "$in": strings },
            };
            let taken: HashSet<String> = self
                .tokens
                .distinct_with_session("token", filter, None, session)
                .await?
                .into_iter()
                .filter_map(|value| value.as_str().map(str::to_string))
                .collect();
            for candidate in drawn {
                seen.insert(candidate.as_str().to_string());
                if !taken.contains(candidate.as_str()) {
                    fresh.push(candidate);
                }
            }
        }
        if fresh.len() < wanted {
            return Err(TokenError::Exhausted.into());
        }

        let batch: Vec<Token> = fresh
            .into_iter()
            .map(|candidate| Token::new(self.election_id, candidate, self.batch_label.clone(), self.now))
            .collect();
        self.tokens
            .insert_many_with_session(&batch, None, session)
            .await?;
        Ok(self.size)
    }
}

struct Invalidate {
    tokens: Coll<Token>,
    elections: Coll<Election>,
    sessions: Coll<VoterSession>,
    token_id: Id,
    now: DateTime<Utc>,
}

#[rocket::async_trait]
impl Transactional for Invalidate {
    type Output = Token;

    async fn run(&self, session: &mut ClientSession) -> Result<Token> {
        let mut token = Token::find_in(&self.tokens, self.token_id, session).await?;
        let claimed = Election::claim_draft(&self.elections, token.election_id, session).await?;
        if claimed.is_none() {
            return Err(TokenError::ElectionNotDraft.into());
        }
        match token.status {
            TokenStatus::Invalidated => return Ok(token),
            TokenStatus::Used => return Err(TokenError::UsedNotInvalidatable.into()),
            TokenStatus::Unused => {}
        }

        let redacted = redact(token.id, RedactionKind::Void);
        let invalidated_at = BsonDateTime::from_chrono(self.now);
        let filter = doc! { "_id": *token.id, "status": TokenStatus::Unused };
        let update = doc! {
            "$set": {
                "status": TokenStatus::Invalidated,
                "invalidated_at": invalidated_at,
                "token": redacted.as_str(),
            }
        };
        let result = self
            .tokens
            .update_one_with_session(filter, update, None, session)
            .await?;
        if result.matched_count != 1 {
            return Err(Error::Conflict(format!(
                "Token {} changed while being invalidated",
                token.id
            )));
        }
        self.sessions
            .delete_many_with_session(doc! { "token_id": *token.id }, None, session)
            .await?;

        token.status = TokenStatus::Invalidated;
        token.invalidated_at = Some(invalidated_at);
        token.token = redacted;
        Ok(token)
    }
}

#[cfg(test)]
mod tests {
    use mongodb::{Client as MongoClient, Database};

    use super::*;
    use crate::model::{
        api::election::ElectionSpec,
        common::{election::Transition, token::is_redacted},
        mongodb::Guard,
    };

    async fn draft(db: &Database, slug: &str) -> Election {
        let spec = ElectionSpec::example_open(slug).into_new(Utc::now()).unwrap();
        Election::create(&Coll::from_db(db), spec).await.unwrap()
    }

    #[backend_test]
    async fn generate_validates_count_and_status(
        db_client: MongoClient,
        db: Database,
        elections: Coll<Election>,
        tokens: Coll<Token>,
        guards: Coll<Guard>,
    ) {
        let election = draft(&db, "osis-2024").await;
        let now = Utc::now();

        for count in [0, MAX_TOKENS_PER_BATCH + 1] {
            let result = Token::generate(&db_client, &elections, &tokens, election.id, count, None, now).await;
            assert!(matches!(result, Err(Error::BadRequest(_))), "{count}");
        }
        let result = Token::generate(&db_client, &elections, &tokens, Id::new(), 1, None, now).await;
        assert!(matches!(result, Err(Error::NotFound(_))));

        let created = Token::generate(&db_client, &elections, &tokens, election.id, 25, Some(" A ".into()), now)
            .await
            .unwrap();
        assert_eq!(created, 25);

        let generated = Token::for_election(&tokens, election.id).await.unwrap();
        assert_eq!(generated.len(), 25);
        let strings: HashSet<_> = generated.iter().map(|t| t.token.clone()).collect();
        assert_eq!(strings.len(), 25);
        for token in &generated {
            assert_eq!(token.status, TokenStatus::Unused);
            assert_eq!(token.generated_batch.as_deref(), Some("A"));
            assert!(TokenString::parse(&token.token).is_ok());
        }

        Election::transition(&db_client, &elections, &guards, election.id, Transition::Activate, now)
            .await
            .unwrap();
        let result = Token::generate(&db_client, &elections, &tokens, election.id, 1, None, now).await;
        assert!(matches!(
            result,
            Err(Error::Token(TokenError::ElectionNotDraft))
        ));
    }

    #[backend_test]
    async fn activation_stops_generation_between_chunks(
        db_client: MongoClient,
        db: Database,
        elections: Coll<Election>,
        tokens: Coll<Token>,
        guards: Coll<Guard>,
    ) {
        let election = draft(&db, "osis-2024").await;
        let now = Utc::now();
        let chunk = GenerateChunk {
            elections: elections.clone(),
            tokens: tokens.clone(),
            election_id: election.id,
            size: 10,
            batch_label: Some("A".to_string()),
            now,
        };

        assert_eq!(Token::generate_chunk(&db_client, &chunk).await.unwrap(), 10);
        Election::transition(&db_client, &elections, &guards, election.id, Transition::Activate, now)
            .await
            .unwrap();
        let result = Token::generate_chunk(&db_client, &chunk).await;
        assert!(matches!(
            result,
            Err(Error::Token(TokenError::ElectionNotDraft))
        ));

        let count = tokens
            .count_documents(doc! { "election_id": *election.id }, None)
            .await
            .unwrap();
        assert_eq!(count, 10);
    }

    #[backend_test]
    async fn large_batches_span_chunks(
        db_client: MongoClient,
        db: Database,
        elections: Coll<Election>,
        tokens: Coll<Token>,
    ) {
        let election = draft(&db, "osis-2024").await;
        let count = GENERATION_CHUNK * 2 + 7;
        let created = Token::generate(&db_client, &elections, &tokens, election.id, count, None, Utc::now())
            .await
            .unwrap();
        assert_eq!(created, count);

        let generated = Token::for_election(&tokens, election.id).await.unwrap();
        let strings: HashSet<_> = generated.iter().map(|t| t.token.as_str()).collect();
        assert_eq!(strings.len(), count as usize);
    }

    #[backend_test]
    async fn invalidation_refused_once_active(
        db_client: MongoClient,
        db: Database,
        elections: Coll<Election>,
        tokens: Coll<Token>,
        sessions: Coll<VoterSession>,
        guards: Coll<Guard>,
    ) {
        let election = draft(&db, "osis-2024").await;
        let now = Utc::now();
        let token = Token::new(election.id, TokenString::parse("ABCD-EFGH").unwrap(), None, now);
        tokens.insert_one(&token, None).await.unwrap();

        Election::transition(&db_client, &elections, &guards, election.id, Transition::Activate, now)
            .await
            .unwrap();
        let result = Token::invalidate(&db_client, &tokens, &elections, &sessions, token.id, now).await;
        assert!(matches!(
            result,
            Err(Error::Token(TokenError::ElectionNotDraft))
        ));
        let stored = tokens.find_one(token.id.as_doc(), None).await.unwrap().unwrap();
        assert_eq!(stored.status, TokenStatus::Unused);
    }

    #[backend_test]
    async fn duplicate_unused_token_rejected_by_index(db: Database, tokens: Coll<Token>) {
        let election = draft(&db, "osis-2024").await;
        let string = TokenString::parse("ABCD-EFGH").unwrap();
        let now = Utc::now();

        tokens
            .insert_one(Token::new(election.id, string.clone(), None, now), None)
            .await
            .unwrap();
        let err = tokens
            .insert_one(Token::new(election.id, string.clone(), None, now), None)
            .await
            .unwrap_err();
        assert!(is_duplicate_key(&err));

        // Another election may reuse the string.
        let other = draft(&db, "osis-2025").await;
        tokens
            .insert_one(Token::new(other.id, string, None, now), None)
            .await
            .unwrap();
    }

    #[backend_test]
    async fn redeem_outcomes(
        db_client: MongoClient,
        db: Database,
        elections: Coll<Election>,
        tokens: Coll<Token>,
        guards: Coll<Guard>,
    ) {
        let election = draft(&db, "osis-2024").await;
        let now = Utc::now();
        let string = TokenString::parse("ABCD-EFGH").unwrap();
        tokens
            .insert_one(Token::new(election.id, string, None, now), None)
            .await
            .unwrap();

        let result = Token::redeem(&tokens, &elections, "not a token", now).await;
        assert!(matches!(result, Err(Error::Token(TokenError::Malformed))));
        let result = Token::redeem(&tokens, &elections, "ZZZZ-ZZZZ", now).await;
        assert!(matches!(result, Err(Error::Token(TokenError::NotFound))));
        let result = Token::redeem(&tokens, &elections, "abcd efgh", now).await;
        assert!(matches!(
            result,
            Err(Error::Token(TokenError::ElectionNotActive))
        ));

        Election::transition(&db_client, &elections, &guards, election.id, Transition::Activate, now)
            .await
            .unwrap();
        let (token, found) = Token::redeem(&tokens, &elections, "abcdefgh", now)
            .await
            .unwrap();
        assert_eq!(token.token, "ABCD-EFGH");
        assert_eq!(found.id, election.id);
        // Redeeming does not consume.
        assert_eq!(
            tokens.find_one(token.id.as_doc(), None).await.unwrap().unwrap().status,
            TokenStatus::Unused
        );

        // Outside the window the token is unusable even though the election is active.
        let late = election.end_time + chrono::Duration::minutes(1);
        let result = Token::redeem(&tokens, &elections, "ABCD-EFGH", late).await;
        assert!(matches!(
            result,
            Err(Error::Token(TokenError::ElectionNotActive))
        ));
    }

    #[backend_test]
    async fn invalidate_redacts_and_drops_sessions(
        db_client: MongoClient,
        db: Database,
        elections: Coll<Election>,
        tokens: Coll<Token>,
        sessions: Coll<VoterSession>,
    ) {
        let election = draft(&db, "osis-2024").await;
        let now = Utc::now();
        let token = Token::new(election.id, TokenString::parse("ABCD-EFGH").unwrap(), None, now);
        tokens.insert_one(&token, None).await.unwrap();
        let (_, session) = VoterSession::new(&token, now, chrono::Duration::minutes(15));
        sessions.insert_one(&session, None).await.unwrap();

        let invalidated = Token::invalidate(&db_client, &tokens, &elections, &sessions, token.id, now)
            .await
            .unwrap();
        assert_eq!(invalidated.status, TokenStatus::Invalidated);
        assert!(invalidated.token.starts_with("VOID:"));
        assert!(is_redacted(&invalidated.token));
        assert!(invalidated.invalidated_at.is_some());

        let stored = tokens.find_one(token.id.as_doc(), None).await.unwrap().unwrap();
        assert_eq!(stored, invalidated);
        assert_eq!(sessions.count_documents(None, None).await.unwrap(), 0);

        // A second invalidation returns the token unchanged.
        let again = Token::invalidate(&db_client, &tokens, &elections, &sessions, token.id, now)
            .await
            .unwrap();
        assert_eq!(again, stored);

        let result = Token::invalidate(&db_client, &tokens, &elections, &sessions, Id::new(), now).await;
        assert!(matches!(result, Err(Error::NotFound(_))));
    }

    #[backend_test]
    async fn used_token_cannot_be_invalidated(
        db_client: MongoClient,
        db: Database,
        elections: Coll<Election>,
        tokens: Coll<Token>,
        sessions: Coll<VoterSession>,
    ) {
        let election = draft(&db, "osis-2024").await;
        let now = Utc::now();
        let mut token = Token::new(election.id, TokenString::parse("ABCD-EFGH").unwrap(), None, now);
        token.status = TokenStatus::Used;
        token.token = redact(token.id, RedactionKind::Used);
        tokens.insert_one(&token, None).await.unwrap();

        let result = Token::invalidate(&db_client, &tokens, &elections, &sessions, token.id, now).await;
        assert!(matches!(
            result,
            Err(Error::Token(TokenError::UsedNotInvalidatable))
        ));
    }
}

use std::ops::{Deref, DerefMut};

use chrono::{DateTime, Utc};
use mongodb::{
    bson::{doc, serde_helpers::chrono_datetime_as_bson_datetime, DateTime as BsonDateTime, Document},
    options::{FindOneAndUpdateOptions, FindOptions, ReturnDocument},
    Client, ClientSession,
};
use rocket::futures::TryStreamExt;
use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};
use crate::model::{
    api::election::ElectionUpdate,
    common::election::{validate_slug, ElectionError, ElectionStatus, Schedule, Transition},
    mongodb::{errors::is_duplicate_key, transact, Coll, Guard, Id, Transactional, ACTIVATION_GUARD_ID},
};

/// Core election data, as stored in the database.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ElectionCore {
    /// URL-friendly unique name. Fixed once the election leaves DRAFT.
    pub slug: String,
    pub name: String,
    pub description: String,
    pub status: ElectionStatus,
    #[serde(with = "chrono_datetime_as_bson_datetime")]
    pub start_time: DateTime<Utc>,
    #[serde(with = "chrono_datetime_as_bson_datetime")]
    pub end_time: DateTime<Utc>,
    pub is_result_public: bool,
    #[serde(with = "chrono_datetime_as_bson_datetime")]
    pub created_at: DateTime<Utc>,
}

impl ElectionCore {
    /// Create a new DRAFT election.
    pub fn new(
        slug: String,
        name: String,
        description: String,
        schedule: Schedule,
        now: DateTime<Utc>,
    ) -> Self {
        Self {
            slug,
            name,
            description,
            status: ElectionStatus::Draft,
            start_time: schedule.start(),
            end_time: schedule.end(),
            is_result_public: false,
            created_at: now,
        }
    }

    /// Is `now` inside the voting window? Both ends are inclusive.
    pub fn in_window(&self, now: DateTime<Utc>) -> bool {
        self.start_time <= now && now <= self.end_time
    }

    /// Is this election accepting votes at `now`?
    pub fn is_open(&self, now: DateTime<Utc>) -> bool {
        self.status == ElectionStatus::Active && self.in_window(now)
    }
}

/// An election without an ID.
pub type NewElection = ElectionCore;

/// An election from the database, with its unique ID.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Election {
    #[serde(rename = "_id")]
    pub id: Id,
    #[serde(flatten)]
    pub election: ElectionCore,
}

impl Deref for Election {
    type Target = ElectionCore;

    fn deref(&self) -> &Self::Target {
        &self.election
    }
}

impl DerefMut for Election {
    fn deref_mut(&mut self) -> &mut Self::Target {
        &mut self.election
    }
}

impl Election {
    /// Insert a new election.
    pub async fn create(elections: &Coll<NewElection>, election: NewElection) -> Result<Self> {
        let id: Id = match elections.insert_one(&election, None).await {
            Ok(result) => result
                .inserted_id
                .as_object_id()
                .ok_or_else(|| Error::Internal("Inserted election has no ObjectId".to_string()))?
                .into(),
            Err(e) if is_duplicate_key(&e) => return Err(ElectionError::SlugTaken.into()),
            Err(e) => return Err(e.into()),
        };
        info!("Created election {id} ({})", election.slug);
        Ok(Self { id, election })
    }

    /// Find an election by ID, failing with `NotFound`.
    pub async fn find(elections: &Coll<Election>, id: Id) -> Result<Self> {
        elections
            .find_one(id.as_doc(), None)
            .await?
            .ok_or_else(|| Error::not_found(format!("Election {id}")))
    }

    /// As [`Election::find`], inside a transaction.
    pub async fn find_in(
        elections: &Coll<Election>,
        id: Id,
        session: &mut ClientSession,
    ) -> Result<Self> {
        elections
            .find_one_with_session(id.as_doc(), None, session)
            .await?
            .ok_or_else(|| Error::not_found(format!("Election {id}")))
    }

    /// Find an election by slug.
    pub async fn find_by_slug(elections: &Coll<Election>, slug: &str) -> Result<Option<Self>> {
        Ok(elections.find_one(doc! { "slug": slug }, None).await?)
    }

    /// The currently active election, if any.
    pub async fn active(elections: &Coll<Election>) -> Result<Option<Self>> {
        let filter = doc! { "status": ElectionStatus::Active };
        Ok(elections.find_one(filter, None).await?)
    }

    /// All elections, newest first.
    pub async fn list(elections: &Coll<Election>) -> Result<Vec<Self>> {
        let options = FindOptions::builder().sort(doc! { "created_at": -1 }).build();
        Ok(elections.find(None, options).await?.try_collect().await?)
    }

    /// Apply an update. Slug and schedule can only change while DRAFT, and
    /// the resulting schedule must still end after it starts.
    pub async fn update(elections: &Coll<Election>, id: Id, update: &ElectionUpdate) -> Result<Self> {
        let current = Self::find(elections, id).await?;
        Self::update_from(elections, &current, update).await
    }

    /// Apply `update` on top of `current`, failing with `Conflict` if the
    /// stored status or schedule no longer match it.
    async fn update_from(
        elections: &Coll<Election>,
        current: &Election,
        update: &ElectionUpdate,
    ) -> Result<Self> {
        let id = current.id;
        if update.touches_locked_fields() && current.status != ElectionStatus::Draft {
            return Err(ElectionError::NotDraft.into());
        }
        if let Some(slug) = &update.slug {
            validate_slug(slug)?;
        }
        let schedule = Schedule::new(
            update.start_time.unwrap_or(current.start_time),
            update.end_time.unwrap_or(current.end_time),
        )?;

        let mut changes = Document::new();
        if let Some(slug) = &update.slug {
            changes.insert("slug", slug.clone());
        }
        if let Some(name) = &update.name {
            changes.insert("name", name.clone());
        }
        if let Some(description) = &update.description {
            changes.insert("description", description.clone());
        }
        if update.start_time.is_some() || update.end_time.is_some() {
            changes.insert("start_time", BsonDateTime::from_chrono(schedule.start()));
            changes.insert("end_time", BsonDateTime::from_chrono(schedule.end()));
        }
        if changes.is_empty() {
            return Ok(current.clone());
        }

        // The schedule was validated against these values.
        let filter = doc! {
            "_id": *id,
            "status": current.status,
            "start_time": BsonDateTime::from_chrono(current.start_time),
            "end_time": BsonDateTime::from_chrono(current.end_time),
        };
        let options = FindOneAndUpdateOptions::builder()
            .return_document(ReturnDocument::After)
            .build();
        match elections
            .find_one_and_update(filter, doc! { "$set": changes }, options)
            .await
        {
            Ok(Some(election)) => Ok(election),
            Ok(None) => Err(Error::Conflict(format!(
                "Election {id} changed while it was being updated"
            ))),
            Err(e) if is_duplicate_key(&e) => Err(ElectionError::SlugTaken.into()),
            Err(e) => Err(e.into()),
        }
    }

    /// Claim a DRAFT election for a write that must happen before it is
    /// activated. The claim writes the election document, so an activation
    /// racing the enclosing transaction conflicts with it. Returns `None` if
    /// the election is no longer DRAFT.
    pub async fn claim_draft(
        elections: &Coll<Election>,
        id: Id,
        session: &mut ClientSession,
    ) -> Result<Option<Self>> {
        let filter = doc! { "_id": *id, "status": ElectionStatus::Draft };
        let update = doc! { "$inc": { "draft_revision": 1 } };
        let options = FindOneAndUpdateOptions::builder()
            .return_document(ReturnDocument::After)
            .build();
        match elections
            .find_one_and_update_with_session(filter, update, options, session)
            .await?
        {
            Some(election) => Ok(Some(election)),
            None => {
                Self::find_in(elections, id, session).await?;
                Ok(None)
            }
        }
    }

    /// Move an election through `transition`. Activation runs as a
    /// transaction that preserves the single-active-election invariant.
    pub async fn transition(
        db_client: &Client,
        elections: &Coll<Election>,
        guards: &Coll<Guard>,
        id: Id,
        transition: Transition,
        now: DateTime<Utc>,
    ) -> Result<Self> {
        let election = if transition == Transition::Activate {
            let activate = Activate {
                elections: elections.clone(),
                guards: guards.clone(),
                id,
                now,
            };
            transact(db_client, &activate).await?
        } else {
            Self::conditional_transition(elections, id, transition).await?
        };
        info!("Election {id} is now {}", election.status);
        Ok(election)
    }

    /// Transitions with no cross-document invariant: a single conditional write.
    async fn conditional_transition(
        elections: &Coll<Election>,
        id: Id,
        transition: Transition,
    ) -> Result<Self> {
        let filter = doc! { "_id": *id, "status": transition.source() };
        let update = doc! { "$set": { "status": transition.target() } };
        let options = FindOneAndUpdateOptions::builder()
            .return_document(ReturnDocument::After)
            .build();
        match elections.find_one_and_update(filter, update, options).await? {
            Some(election) => Ok(election),
            None => {
                let current = Self::find(elections, id).await?;
                transition.check(current.status)?;
                // The status matched when read back, so it changed in between.
                Err(Error::Conflict(format!("Election {id} changed concurrently")))
            }
        }
    }

    /// Show or hide results. Only legal while CLOSED.
    pub async fn set_results_public(
        elections: &Coll<Election>,
        id: Id,
        is_result_public: bool,
    ) -> Result<Self> {
        let filter = doc! { "_id": *id, "status": ElectionStatus::Closed };
        let update = doc! { "$set": { "is_result_public": is_result_public } };
        let options = FindOneAndUpdateOptions::builder()
            .return_document(ReturnDocument::After)
            .build();
        match elections.find_one_and_update(filter, update, options).await? {
            Some(election) => Ok(election),
            None => {
                Self::find(elections, id).await?;
                Err(ElectionError::NotClosed.into())
            }
        }
    }
}

/// DRAFT → ACTIVE, as one transaction:
/// 1. Bump the activation guard, so concurrent activations conflict.
/// 2. Check the target is DRAFT and its window contains `now`.
/// 3. Check no other election is ACTIVE.
/// 4. Conditionally flip the target to ACTIVE.
struct Activate {
    elections: Coll<Election>,
    guards: Coll<Guard>,
    id: Id,
    now: DateTime<Utc>,
}

#[rocket::async_trait]
impl Transactional for Activate {
    type Output = Election;

    async fn run(&self, session: &mut ClientSession) -> Result<Election> {
        Guard::bump(&self.guards, ACTIVATION_GUARD_ID, session).await?;

        let mut election = Election::find_in(&self.elections, self.id, session).await?;
        Transition::Activate.check(election.status)?;
        if !election.in_window(self.now) {
            return Err(ElectionError::OutsideSchedule.into());
        }

        let other_active = doc! {
            "status": ElectionStatus::Active,
            "_id": { "$ne": *self.id },
        };
        if self
            .elections
            .find_one_with_session(other_active, None, session)
            .await?
            .is_some()
        {
            return Err(ElectionError::ActiveElectionExists.into());
        }

        let filter = doc! { "_id": *self.id, "status": ElectionStatus::Draft };
        let update = doc! { "$set": { "status": ElectionStatus::Active } };
        let result = match self
            .elections
            .update_one_with_session(filter, update, None, session)
            .await
        {
            Ok(result) => result,
            // The partial unique index caught a race the guard didn't.
            Err(e) if is_duplicate_key(&e) => {
                return Err(ElectionError::ActiveElectionExists.into())
            }
            Err(e) => return Err(e.into()),
        };
        if result.matched_count != 1 {
            return Err(Error::Conflict(format!(
                "Election {} changed while being activated",
                self.id
            )));
        }

        election.status = ElectionStatus::Active;
        Ok(election)
    }
}

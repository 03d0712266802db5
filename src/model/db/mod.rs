//! DB-compatible (e.g. de/serialisable) types, and the operations on them.
//!
//! The types in this module are serialised in an DB-friendly way, e.g.:
//!
//! - IDs and datetimes are serialised in MongoDB's own format.
//!
//! Every operation that must observe and change more than one document is
//! a [`Transactional`](crate::model::mongodb::Transactional) run through
//! [`transact`](crate::model::mongodb::transact).

pub mod admin;
pub mod candidate;
pub mod election;
pub mod session;
pub mod sweeper;
pub mod token;
pub mod vote;

//! API-friendly types: request bodies, response bodies, and request guards.
//!
//! Response types serialise IDs as plain strings and field names in camelCase.

pub mod admin;
pub mod auth;
pub mod election;
pub mod id;
pub mod token;
pub mod vote;

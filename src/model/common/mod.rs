//! Domain types shared between the database and API layers.

pub mod election;
pub mod secret;
pub mod token;

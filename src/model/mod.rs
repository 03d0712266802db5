//! The data model and the operations on it.

pub mod api;
pub mod common;
pub mod db;
pub mod mongodb;

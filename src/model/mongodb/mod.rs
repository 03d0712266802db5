mod bson;
mod collection;
pub mod errors;
mod guard;
mod transaction;

pub use bson::Id;
pub use collection::{ensure_indexes_exist, Coll, MongoCollection};
pub use guard::{ensure_activation_guard_exists, Guard, ACTIVATION_GUARD_ID};
pub use transaction::{transact, Transactional, MAX_TRANSACTION_ATTEMPTS};

use std::ops::{Deref, DerefMut};

use mongodb::bson::doc;
use serde::{Deserialize, Serialize};

use crate::error::Result;
use crate::model::{
    api::admin::AdminCredentials,
    mongodb::{Coll, Id},
};

/// Username of the admin created when none exist.
pub const DEFAULT_ADMIN_USERNAME: &str = "admin";

/// Core admin user data.
#[derive(Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct AdminCore {
    pub username: String,
    pub password_hash: String,
}

impl AdminCore {
    /// Check whether the given password is correct.
    /// A hash that fails to parse never verifies.
    pub fn verify_password<T: AsRef<[u8]>>(&self, password: T) -> bool {
        argon2::verify_encoded(&self.password_hash, password.as_ref()).unwrap_or_else(|e| {
            error!("Stored hash for admin {} is unreadable: {e}", self.username);
            false
        })
    }
}

/// An admin without an ID.
pub type NewAdmin = AdminCore;

/// An admin user from the database, with its unique ID.
#[derive(Debug, Serialize, Deserialize)]
pub struct Admin {
    #[serde(rename = "_id")]
    pub id: Id,
    #[serde(flatten)]
    pub admin: AdminCore,
}

impl Deref for Admin {
    type Target = AdminCore;

    fn deref(&self) -> &Self::Target {
        &self.admin
    }
}

impl DerefMut for Admin {
    fn deref_mut(&mut self) -> &mut Self::Target {
        &mut self.admin
    }
}

/// Ensure there is at least one admin, creating the default one if not.
///
/// This operation is idempotent.
pub async fn ensure_admin_exists(admins: &Coll<NewAdmin>, default_password: &str) -> Result<()> {
    let count = admins.count_documents(None, None).await?;
    if count > 0 {
        return Ok(());
    }

    let credentials = AdminCredentials {
        username: DEFAULT_ADMIN_USERNAME.to_string(),
        password: default_password.to_string(),
    };
    let admin: NewAdmin = credentials.try_into()?;
    admins.insert_one(admin, None).await?;
    warn!("Created default admin `{DEFAULT_ADMIN_USERNAME}`; change its password");
    Ok(())
}

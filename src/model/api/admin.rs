use argon2::Config;
use rand::Rng;
use serde::{Deserialize, Serialize};

use crate::error::Error;
use crate::model::db::admin::NewAdmin;

pub const MIN_PASSWORD_LENGTH: usize = 8;

/// Raw admin credentials, received from a user. These are never stored directly,
/// since the password is in plaintext.
#[derive(Clone, Deserialize, Serialize)]
pub struct AdminCredentials {
    pub username: String,
    pub password: String,
}

impl TryFrom<AdminCredentials> for NewAdmin {
    type Error = Error;

    /// Convert [`AdminCredentials`] to a new admin by hashing the password.
    /// This enforces that the username is non-empty, and the password meets minimum length.
    fn try_from(cred: AdminCredentials) -> Result<Self, Self::Error> {
        if cred.username.is_empty() || cred.password.len() < MIN_PASSWORD_LENGTH {
            return Err(Error::BadRequest(format!(
                "Admin needs a username and a password of at least {MIN_PASSWORD_LENGTH} characters"
            )));
        }

        // 16 bytes is recommended for password hashing:
        //  https://en.wikipedia.org/wiki/Argon2
        let mut salt = [0_u8; 16];
        rand::thread_rng().fill(&mut salt);
        let password_hash =
            argon2::hash_encoded(cred.password.as_bytes(), &salt, &Config::default())?;
        Ok(Self {
            username: cred.username,
            password_hash,
        })
    }
}

#[cfg(test)]
pub(crate) mod examples {
    use super::*;

    impl AdminCredentials {
        pub fn example() -> Self {
            Self {
                username: "panitia".into(),
                password: "pilketos-rahasia".into(),
            }
        }
    }

    #[test]
    fn hashes_and_verifies() {
        let admin = NewAdmin::try_from(AdminCredentials::example()).unwrap();
        assert_eq!(admin.username, "panitia");
        assert_ne!(admin.password_hash, "pilketos-rahasia");
        assert!(admin.verify_password("pilketos-rahasia"));
        assert!(!admin.verify_password("pilketos-rahasiA"));
    }

    #[test]
    fn rejects_weak_credentials() {
        let empty_name = AdminCredentials {
            username: String::new(),
            password: "long enough".into(),
        };
        let short_password = AdminCredentials {
            username: "panitia".into(),
            password: "short".into(),
        };
        assert!(NewAdmin::try_from(empty_name).is_err());
        assert!(NewAdmin::try_from(short_password).is_err());
    }
}

//! Password hashing for web users
//!
//! Hashes are bcrypt strings (`$2b$12$...`) as stored in the `hashed_password`
//! field of `web { user { ... } }` config blocks. Older `$2a$`/`$2y$` hashes
//! verify as well.

use crate::config::WebUser;
use crate::{Error, Result};

/// Hash a password at bcrypt's default cost
pub fn hash_password(password: &str) -> Result<String> {
    if password.is_empty() {
        return Err(Error::Auth("password cannot be empty".to_string()));
    }
    bcrypt::hash(password, bcrypt::DEFAULT_COST)
        .map_err(|e| Error::Auth(format!("Failed to hash password: {}", e)))
}

/// Check a password against a stored hash. A malformed hash is an error,
/// a wrong password is `Ok(false)`.
pub fn verify_password(password: &str, hash: &str) -> Result<bool> {
    bcrypt::verify(password, hash).map_err(|e| Error::Auth(format!("Invalid password hash: {}", e)))
}

/// Find the configured user matching the credentials
pub fn authenticate<'a>(users: &'a [WebUser], email: &str, password: &str) -> Result<&'a WebUser> {
    let user = users
        .iter()
        .find(|u| u.email == email)
        .ok_or_else(|| Error::Auth("invalid credentials".to_string()))?;
    if verify_password(password, &user.hashed_password)? {
        Ok(user)
    } else {
        Err(Error::Auth("invalid credentials".to_string()))
    }
}

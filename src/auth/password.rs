use argon2::{
    password_hash::{PasswordHash, PasswordHasher, PasswordVerifier, SaltString},
    Argon2,
};
use rand::rngs::OsRng;
use tracing::{error, warn};

/// Hashes a password with Argon2id and a fresh random salt.
pub fn hash_password(plain: &str) -> Result<String, argon2::password_hash::Error> {
    let salt = SaltString::generate(&mut OsRng);
    let argon2 = Argon2::default();
    let hash = argon2
        .hash_password(plain.as_bytes(), &salt)
        .map_err(|e| {
            error!(error = %e, "argon2 hash_password error");
            e
        })?
        .to_string();
    Ok(hash)
}

/// Checks `plain` against a stored PHC hash.
///
/// Fails closed: a missing or unparseable hash never verifies.
pub fn verify_password(plain: &str, hash: Option<&str>) -> bool {
    let Some(hash) = hash.filter(|h| !h.is_empty()) else {
        return false;
    };
    let parsed = match PasswordHash::new(hash) {
        Ok(parsed) => parsed,
        Err(e) => {
            warn!(error = %e, "argon2 parse hash error");
            return false;
        }
    };
    Argon2::default()
        .verify_password(plain.as_bytes(), &parsed)
        .is_ok()
}

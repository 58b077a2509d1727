//! Credential verification
//!
//! The stored credential is either the plaintext password or an argon2
//! hash, selected by configuration. Plaintext comparison is constant
//! time; hash verification delegates to the argon2 verifier.

use anyhow::{anyhow, Result};
use argon2::password_hash::{rand_core::OsRng, SaltString};
use argon2::{Argon2, PasswordHash, PasswordHasher, PasswordVerifier};
use subtle::ConstantTimeEq;

use crate::config::PasswordScheme;

/// Check a client-supplied password against the stored credential
pub fn verify_password(scheme: PasswordScheme, supplied: &str, stored: &str) -> bool {
    match scheme {
        PasswordScheme::Plain => constant_time_eq(supplied.as_bytes(), stored.as_bytes()),
        PasswordScheme::Argon2 => verify_argon2(supplied, stored),
    }
}

/// Hash a password for storage under the argon2 scheme
pub fn hash_password(password: &str) -> Result<String> {
    let salt = SaltString::generate(&mut OsRng);
    Ok(Argon2::default()
        .hash_password(password.as_bytes(), &salt)
        .map_err(|e| anyhow!("failed to hash password: {}", e))?
        .to_string())
}

fn constant_time_eq(a: &[u8], b: &[u8]) -> bool {
    a.len() == b.len() && bool::from(a.ct_eq(b))
}

fn verify_argon2(supplied: &str, stored: &str) -> bool {
    match PasswordHash::new(stored) {
        Ok(parsed) => Argon2::default()
            .verify_password(supplied.as_bytes(), &parsed)
            .is_ok(),
        Err(_) => false,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_plain_match() {
        assert!(verify_password(PasswordScheme::Plain, "secret", "secret"));
    }

    #[test]
    fn test_plain_mismatch() {
        assert!(!verify_password(PasswordScheme::Plain, "secret", "Secret"));
        assert!(!verify_password(PasswordScheme::Plain, "secret", "secrets"));
        assert!(!verify_password(PasswordScheme::Plain, "", "secret"));
    }

    #[test]
    fn test_argon2_round_trip() {
        let hash = hash_password("hunter2").unwrap();
        assert!(verify_password(PasswordScheme::Argon2, "hunter2", &hash));
        assert!(!verify_password(PasswordScheme::Argon2, "hunter3", &hash));
    }

    #[test]
    fn test_argon2_garbage_stored_value() {
        assert!(!verify_password(PasswordScheme::Argon2, "secret", "secret"));
        assert!(!verify_password(PasswordScheme::Argon2, "secret", ""));
    }

    #[test]
    fn test_hashes_are_salted() {
        let h1 = hash_password("same").unwrap();
        let h2 = hash_password("same").unwrap();
        assert_ne!(h1, h2);
    }
}

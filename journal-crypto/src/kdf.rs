use crate::error::{CryptoError, CryptoResult};
use crate::aes_gcm::KEY_LEN;
use pbkdf2::pbkdf2_hmac;
use rand::{rngs::OsRng, RngCore};
use sha2::Sha256;
use zeroize::Zeroizing;

/// Upper bound on accepted iteration counts. Envelopes read from the remote
/// store carry their own count, and an absurd value would stall the caller.
pub const MAX_ITERATIONS: u32 = 10_000_000;

/// PBKDF2 parameters for key derivation
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Pbkdf2Params {
    /// Number of iterations (minimum 100,000 for production)
    pub iterations: u32,
    /// Salt length in bytes (minimum 16 bytes recommended)
    pub salt_length: usize,
}

impl Default for Pbkdf2Params {
    fn default() -> Self {
        Self {
            iterations: 600_000, // OWASP 2023 recommendation
            salt_length: 16,
        }
    }
}

/// Key Derivation Function utilities
pub struct Kdf;

impl Kdf {
    /// Derive a key using PBKDF2-HMAC-SHA256
    pub fn pbkdf2(
        password: &[u8],
        salt: &[u8],
        iterations: u32,
        key_length: usize,
    ) -> CryptoResult<Zeroizing<Vec<u8>>> {
        if iterations == 0 || iterations > MAX_ITERATIONS {
            return Err(CryptoError::KeyDerivationFailed(format!(
                "iteration count {} outside 1..={}",
                iterations, MAX_ITERATIONS
            )));
        }

        let mut derived_key = Zeroizing::new(vec![0u8; key_length]);
        pbkdf2_hmac::<Sha256>(password, salt, iterations, &mut derived_key);

        Ok(derived_key)
    }

    /// Derive a 32-byte AES-256 key using PBKDF2
    pub fn derive_aes256_key(
        password: &[u8],
        salt: &[u8],
        iterations: u32,
    ) -> CryptoResult<Zeroizing<Vec<u8>>> {
        Self::pbkdf2(password, salt, iterations, KEY_LEN)
    }

    /// Generate a random salt
    pub fn generate_salt(length: usize) -> Vec<u8> {
        let mut salt = vec![0u8; length];
        OsRng.fill_bytes(&mut salt);
        salt
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_pbkdf2_deterministic() {
        let salt = Kdf::generate_salt(16);
        let a = Kdf::derive_aes256_key(b"passphrase", &salt, 1_000).unwrap();
        let b = Kdf::derive_aes256_key(b"passphrase", &salt, 1_000).unwrap();

        assert_eq!(a.len(), 32);
        assert_eq!(a.as_slice(), b.as_slice());
    }

    #[test]
    fn test_pbkdf2_salt_and_password_sensitivity() {
        let salt = Kdf::generate_salt(16);
        let other_salt = Kdf::generate_salt(16);

        let base = Kdf::derive_aes256_key(b"passphrase", &salt, 1_000).unwrap();
        let other_password = Kdf::derive_aes256_key(b"passphrase2", &salt, 1_000).unwrap();
        let other = Kdf::derive_aes256_key(b"passphrase", &other_salt, 1_000).unwrap();

        assert_ne!(base.as_slice(), other_password.as_slice());
        assert_ne!(base.as_slice(), other.as_slice());
    }

    #[test]
    fn test_rejects_out_of_range_iterations() {
        assert!(Kdf::pbkdf2(b"p", b"salt", 0, 32).is_err());
        assert!(Kdf::pbkdf2(b"p", b"salt", MAX_ITERATIONS + 1, 32).is_err());
    }

    #[test]
    fn test_generate_salt() {
        let a = Kdf::generate_salt(16);
        let b = Kdf::generate_salt(16);
        assert_eq!(a.len(), 16);
        assert_ne!(a, b);
    }
}

//! Passphrase envelope
//!
//! Text format: `v1:{iterations}:{salt_b64}:{body_b64}` where `body` is the
//! AES-256-GCM output (`nonce || ciphertext || tag`) under a key derived
//! from the passphrase and salt with PBKDF2-HMAC-SHA256. The envelope is
//! self-describing, so opening it needs only the passphrase.

use crate::aes_gcm::Aes256GcmEncryptor;
use crate::encryption::Encryptor;
use crate::error::{CryptoError, CryptoResult};
use crate::kdf::{Kdf, Pbkdf2Params};
use base64::{engine::general_purpose::STANDARD as BASE64, Engine};
use zeroize::Zeroizing;

/// Current envelope version
pub const ENVELOPE_VERSION: u32 = 1;

/// Seals and opens byte payloads under a user passphrase.
#[derive(Debug, Clone, Copy, Default)]
pub struct PassphraseCipher {
    params: Pbkdf2Params,
}

impl PassphraseCipher {
    pub fn new(params: Pbkdf2Params) -> Self {
        Self { params }
    }

    pub fn params(&self) -> &Pbkdf2Params {
        &self.params
    }

    /// Encrypt `plaintext` under `passphrase`. Fresh salt and nonce on every
    /// call.
    pub fn seal(&self, plaintext: &[u8], passphrase: &[u8]) -> CryptoResult<String> {
        if passphrase.is_empty() {
            return Err(CryptoError::EmptyPassphrase);
        }

        let salt = Kdf::generate_salt(self.params.salt_length);
        let key = Kdf::derive_aes256_key(passphrase, &salt, self.params.iterations)?;
        let encryptor = Aes256GcmEncryptor::from_slice(&key)?;
        let body = encryptor.encrypt(plaintext)?;

        Ok(format!(
            "v{}:{}:{}:{}",
            ENVELOPE_VERSION,
            self.params.iterations,
            BASE64.encode(&salt),
            BASE64.encode(&body)
        ))
    }

    /// Decrypt an envelope produced by [`seal`](Self::seal).
    ///
    /// A well-formed envelope that fails authentication yields
    /// [`CryptoError::DecryptionFailed`]; structural problems yield
    /// [`CryptoError::InvalidFormat`] or [`CryptoError::UnsupportedVersion`].
    pub fn open(&self, sealed: &str, passphrase: &[u8]) -> CryptoResult<Zeroizing<Vec<u8>>> {
        if passphrase.is_empty() {
            return Err(CryptoError::EmptyPassphrase);
        }

        let envelope = Envelope::parse(sealed)?;
        let key = Kdf::derive_aes256_key(passphrase, &envelope.salt, envelope.iterations)?;
        let encryptor = Aes256GcmEncryptor::from_slice(&key)?;

        encryptor.decrypt(&envelope.body).map(Zeroizing::new)
    }
}

struct Envelope {
    iterations: u32,
    salt: Vec<u8>,
    body: Vec<u8>,
}

impl Envelope {
    fn parse(sealed: &str) -> CryptoResult<Self> {
        let mut parts = sealed.trim().splitn(4, ':');
        let (Some(version), Some(iterations), Some(salt), Some(body)) =
            (parts.next(), parts.next(), parts.next(), parts.next())
        else {
            return Err(CryptoError::InvalidFormat(
                "expected v{version}:{iterations}:{salt}:{body}".to_string(),
            ));
        };

        let version = version
            .strip_prefix('v')
            .and_then(|v| v.parse::<u32>().ok())
            .ok_or_else(|| CryptoError::InvalidFormat(format!("bad version tag {:?}", version)))?;

        if version != ENVELOPE_VERSION {
            return Err(CryptoError::UnsupportedVersion {
                version,
                supported: ENVELOPE_VERSION,
            });
        }

        let iterations = iterations
            .parse::<u32>()
            .map_err(|e| CryptoError::InvalidFormat(format!("bad iteration count: {}", e)))?;
        let salt = BASE64
            .decode(salt)
            .map_err(|e| CryptoError::InvalidFormat(format!("bad salt encoding: {}", e)))?;
        let body = BASE64
            .decode(body)
            .map_err(|e| CryptoError::InvalidFormat(format!("bad body encoding: {}", e)))?;

        Ok(Self {
            iterations,
            salt,
            body,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    fn fast_cipher() -> PassphraseCipher {
        PassphraseCipher::new(Pbkdf2Params {
            iterations: 1_000, // Low for testing
            salt_length: 16,
        })
    }

    #[test]
    fn test_seal_open_roundtrip() {
        let cipher = fast_cipher();
        let sealed = cipher.seal(b"{\"classes\":[]}", b"hunter2").unwrap();

        assert!(sealed.starts_with("v1:1000:"));
        assert_eq!(cipher.open(&sealed, b"hunter2").unwrap().as_slice(), b"{\"classes\":[]}");
    }

    #[test]
    fn test_seal_is_randomized() {
        let cipher = fast_cipher();
        let a = cipher.seal(b"same", b"pass").unwrap();
        let b = cipher.seal(b"same", b"pass").unwrap();
        assert_ne!(a, b);
    }

    #[test]
    fn test_open_uses_envelope_iterations() {
        let sealed = fast_cipher().seal(b"data", b"pass").unwrap();
        // A cipher configured differently can still open it.
        let other = PassphraseCipher::new(Pbkdf2Params {
            iterations: 2_000,
            salt_length: 32,
        });
        assert_eq!(other.open(&sealed, b"pass").unwrap().as_slice(), b"data");
    }

    #[test]
    fn test_wrong_passphrase_is_authentication_failure() {
        let cipher = fast_cipher();
        let sealed = cipher.seal(b"data", b"right").unwrap();
        let err = cipher.open(&sealed, b"wrong").unwrap_err();
        assert!(err.is_authentication_failure());
    }

    #[test]
    fn test_malformed_envelopes() {
        let cipher = fast_cipher();

        assert!(matches!(cipher.open("garbage", b"p"), Err(CryptoError::InvalidFormat(_))));
        assert!(matches!(
            cipher.open("v2:1000:AAAA:AAAA", b"p"),
            Err(CryptoError::UnsupportedVersion { version: 2, supported: 1 })
        ));
        assert!(matches!(
            cipher.open("v1:lots:AAAA:AAAA", b"p"),
            Err(CryptoError::InvalidFormat(_))
        ));
        assert!(matches!(
            cipher.open("v1:1000:%%%:AAAA", b"p"),
            Err(CryptoError::InvalidFormat(_))
        ));
    }

    #[test]
    fn test_empty_passphrase_rejected() {
        let cipher = fast_cipher();
        assert!(matches!(cipher.seal(b"x", b""), Err(CryptoError::EmptyPassphrase)));
    }

    proptest! {
        #![proptest_config(ProptestConfig::with_cases(16))]

        #[test]
        fn prop_roundtrip(data in proptest::collection::vec(any::<u8>(), 0..512), pass in "[a-zA-Z0-9]{1,24}") {
            let cipher = fast_cipher();
            let sealed = cipher.seal(&data, pass.as_bytes()).unwrap();
            let opened = cipher.open(&sealed, pass.as_bytes()).unwrap();
            prop_assert_eq!(opened.as_slice(), data.as_slice());
        }

        #[test]
        fn prop_wrong_passphrase_never_opens(data in proptest::collection::vec(any::<u8>(), 0..256), pass in "[a-z]{1,16}", other in "[a-z]{1,16}") {
            prop_assume!(pass != other);
            let cipher = fast_cipher();
            let sealed = cipher.seal(&data, pass.as_bytes()).unwrap();
            let err = cipher.open(&sealed, other.as_bytes()).unwrap_err();
            prop_assert!(err.is_authentication_failure());
        }
    }
}

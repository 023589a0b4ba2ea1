use thiserror::Error;

#[derive(Error, Debug)]
pub enum CryptoError {
    #[error("Encryption failed: {0}")]
    EncryptionFailed(String),

    /// The authentication tag did not verify: wrong key or tampered data.
    #[error("Decryption failed: {0}")]
    DecryptionFailed(String),

    #[error("Invalid key: {0}")]
    InvalidKey(String),

    #[error("Invalid key length: expected {expected}, got {got}")]
    InvalidKeyLength { expected: usize, got: usize },

    #[error("Unsupported envelope version {version}, only version {supported} is supported")]
    UnsupportedVersion { version: u32, supported: u32 },

    #[error("Invalid encrypted data format: {0}")]
    InvalidFormat(String),

    #[error("Invalid nonce length: {0}")]
    InvalidNonce(String),

    #[error("Key derivation failed: {0}")]
    KeyDerivationFailed(String),

    #[error("Passphrase must not be empty")]
    EmptyPassphrase,
}

impl CryptoError {
    /// True when the data was well-formed but did not authenticate under the
    /// supplied key, i.e. a wrong passphrase or corrupted ciphertext.
    pub fn is_authentication_failure(&self) -> bool {
        matches!(self, CryptoError::DecryptionFailed(_))
    }
}

pub type CryptoResult<T> = Result<T, CryptoError>;

use crate::encryption::Encryptor;
use crate::error::{CryptoError, CryptoResult};
use aes_gcm::{
    aead::{Aead, KeyInit},
    Aes256Gcm, Nonce,
};
use rand::{rngs::OsRng, RngCore};
use zeroize::{Zeroize, ZeroizeOnDrop};

/// Length of an AES-256 key in bytes.
pub const KEY_LEN: usize = 32;

/// Length of a GCM nonce in bytes (96 bits, the size GCM is specified for).
pub const NONCE_LEN: usize = 12;

/// AES-256-GCM encryptor
///
/// Output layout is `nonce || ciphertext || tag`. A fresh random nonce is
/// drawn for every call, so encrypting the same plaintext twice yields two
/// different outputs. The key is zeroized on drop.
#[derive(ZeroizeOnDrop)]
pub struct Aes256GcmEncryptor {
    #[zeroize(skip)]
    cipher: Aes256Gcm,
    key: [u8; KEY_LEN],
}

impl Aes256GcmEncryptor {
    /// Create a new encryptor with a 32-byte key
    pub fn new(key: [u8; KEY_LEN]) -> CryptoResult<Self> {
        let cipher = Aes256Gcm::new_from_slice(&key)
            .map_err(|e| CryptoError::InvalidKey(e.to_string()))?;

        Ok(Self { cipher, key })
    }

    /// Create from a key slice, checking its length
    pub fn from_slice(key: &[u8]) -> CryptoResult<Self> {
        if key.len() != KEY_LEN {
            return Err(CryptoError::InvalidKeyLength {
                expected: KEY_LEN,
                got: key.len(),
            });
        }

        let mut owned = [0u8; KEY_LEN];
        owned.copy_from_slice(key);
        let encryptor = Self::new(owned);
        owned.zeroize();
        encryptor
    }

    /// Generate a new random key
    pub fn generate_key() -> [u8; KEY_LEN] {
        let mut key = [0u8; KEY_LEN];
        OsRng.fill_bytes(&mut key);
        key
    }

    #[cfg(test)]
    fn key_bytes(&self) -> &[u8] {
        &self.key
    }
}

impl Encryptor for Aes256GcmEncryptor {
    fn encrypt(&self, plaintext: &[u8]) -> CryptoResult<Vec<u8>> {
        let mut nonce_bytes = [0u8; NONCE_LEN];
        OsRng.fill_bytes(&mut nonce_bytes);
        let nonce = Nonce::from_slice(&nonce_bytes);

        let ciphertext = self
            .cipher
            .encrypt(nonce, plaintext)
            .map_err(|e| CryptoError::EncryptionFailed(e.to_string()))?;

        let mut out = Vec::with_capacity(NONCE_LEN + ciphertext.len());
        out.extend_from_slice(&nonce_bytes);
        out.extend_from_slice(&ciphertext);
        Ok(out)
    }

    fn decrypt(&self, ciphertext: &[u8]) -> CryptoResult<Vec<u8>> {
        if ciphertext.len() < NONCE_LEN {
            return Err(CryptoError::InvalidNonce(format!(
                "message shorter than the {} byte nonce",
                NONCE_LEN
            )));
        }

        let (nonce_bytes, body) = ciphertext.split_at(NONCE_LEN);
        let nonce = Nonce::from_slice(nonce_bytes);

        self.cipher
            .decrypt(nonce, body)
            .map_err(|_| CryptoError::DecryptionFailed("authentication tag mismatch".to_string()))
    }

    fn algorithm(&self) -> &str {
        "AES-256-GCM"
    }
}

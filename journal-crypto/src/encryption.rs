use crate::error::CryptoResult;

/// Symmetric encrypt/decrypt over raw bytes.
pub trait Encryptor: Send + Sync {
    /// Encrypt data
    fn encrypt(&self, plaintext: &[u8]) -> CryptoResult<Vec<u8>>;

    /// Decrypt data
    fn decrypt(&self, ciphertext: &[u8]) -> CryptoResult<Vec<u8>>;

    /// Get the encryption algorithm name
    fn algorithm(&self) -> &str;
}

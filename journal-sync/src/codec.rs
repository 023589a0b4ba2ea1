//! Encryption codec: document to sealed blob and back
//!
//! Pure functions over their inputs. Every call to [`DocumentCodec::encrypt`]
//! draws a fresh salt and nonce, so equal documents encrypt differently.

use chrono::{DateTime, Utc};
use journal_crypto::{PassphraseCipher, Pbkdf2Params};
use zeroize::Zeroizing;

use crate::device::DeviceId;
use crate::document::Document;
use crate::error::{SyncError, SyncResult};
use crate::remote::EncryptedBlob;
use crate::session::Passphrase;

/// A decoded remote blob.
#[derive(Debug, Clone, PartialEq)]
pub struct OpenedBlob {
    pub document: Document,
    /// The blob was an unencrypted legacy backup.
    pub legacy_plaintext: bool,
}

#[derive(Debug, Clone, Copy, Default)]
pub struct DocumentCodec {
    cipher: PassphraseCipher,
}

impl DocumentCodec {
    pub fn new(kdf_iterations: u32) -> Self {
        Self {
            cipher: PassphraseCipher::new(Pbkdf2Params {
                iterations: kdf_iterations,
                ..Pbkdf2Params::default()
            }),
        }
    }

    pub fn encrypt(&self, document: &Document, passphrase: &Passphrase) -> SyncResult<String> {
        let plaintext = Zeroizing::new(serde_json::to_vec(document)?);
        Ok(self.cipher.seal(&plaintext, passphrase.expose().as_bytes())?)
    }

    /// Decrypt a payload produced by [`encrypt`](Self::encrypt).
    ///
    /// A wrong passphrase or tampered ciphertext yields
    /// [`SyncError::Decryption`]; a payload that decrypts but is not a
    /// document yields [`SyncError::Deserialization`].
    pub fn decrypt(&self, cipher_text: &str, passphrase: &Passphrase) -> SyncResult<Document> {
        let plaintext = self.cipher.open(cipher_text, passphrase.expose().as_bytes())?;
        serde_json::from_slice(&plaintext)
            .map_err(|e| SyncError::Deserialization(format!("decrypted document: {e}")))
    }

    /// Encrypt `document` into an upload-ready blob stamped with `now`.
    pub fn seal(
        &self,
        document: &Document,
        passphrase: &Passphrase,
        device_id: &DeviceId,
        now: DateTime<Utc>,
    ) -> SyncResult<EncryptedBlob> {
        Ok(EncryptedBlob {
            is_encrypted: true,
            payload: self.encrypt(document, passphrase)?,
            updated_at: now,
            device_id: Some(device_id.clone()),
        })
    }

    /// Decode a downloaded blob. Unencrypted legacy blobs are accepted and
    /// flagged.
    pub fn open(&self, blob: &EncryptedBlob, passphrase: &Passphrase) -> SyncResult<OpenedBlob> {
        if blob.is_encrypted {
            return Ok(OpenedBlob {
                document: self.decrypt(&blob.payload, passphrase)?,
                legacy_plaintext: false,
            });
        }

        let document = serde_json::from_str(&blob.payload)
            .map_err(|e| SyncError::Deserialization(format!("plaintext blob: {e}")))?;
        Ok(OpenedBlob {
            document,
            legacy_plaintext: true,
        })
    }
}

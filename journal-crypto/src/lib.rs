//! Cryptographic primitives for Class Journal sync
//!
//! Everything the sync engine needs to keep a journal unreadable by the
//! remote store:
//! - AES-256-GCM authenticated encryption with a fresh nonce per message
//! - PBKDF2-HMAC-SHA256 key derivation from a user passphrase
//! - A versioned, self-describing text envelope ([`PassphraseCipher`]) that
//!   carries salt, iteration count, nonce and ciphertext together
//!
//! # Example
//!
//! ```
//! use journal_crypto::{PassphraseCipher, Pbkdf2Params};
//!
//! let cipher = PassphraseCipher::new(Pbkdf2Params { iterations: 1_000, salt_length: 16 });
//! let sealed = cipher.seal(b"attendance", b"correct horse").unwrap();
//! let opened = cipher.open(&sealed, b"correct horse").unwrap();
//! assert_eq!(opened.as_slice(), b"attendance");
//! assert!(cipher.open(&sealed, b"battery staple").unwrap_err().is_authentication_failure());
//! ```

#![cfg_attr(test, allow(clippy::indexing_slicing, clippy::panic))]

pub mod aes_gcm;
pub mod encryption;
pub mod error;
pub mod kdf;
pub mod sealed;

pub use aes_gcm::Aes256GcmEncryptor;
pub use encryption::Encryptor;
pub use error::{CryptoError, CryptoResult};
pub use kdf::{Kdf, Pbkdf2Params};
pub use sealed::PassphraseCipher;

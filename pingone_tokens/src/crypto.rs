//! Encryption of secrets at rest in the settings file
//!
//! Encrypted values are plain strings so that they can sit in the same JSON
//! document as everything else:
//!
//! ```text
//! enc:<hex(iv)>:<base64(ciphertext)>
//! ```
//!
//! The cipher is AES-256-CBC with PKCS#7 padding. The key is the SHA-256
//! digest of a passphrase supplied through the environment.

use std::fmt;

use aes::cipher::{block_padding::Pkcs7, BlockDecryptMut, BlockEncryptMut, KeyIvInit};
use base64::{engine::general_purpose::STANDARD, Engine as _};
use rand::RngCore;
use sha2::{Digest, Sha256};
use thiserror::Error;

use crate::credentials::Environment;

/// Marker placed in front of every encrypted value
pub const ENCRYPTED_PREFIX: &str = "enc:";

/// Environment variable holding the settings passphrase
pub const SETTINGS_KEY_VAR: &str = "PINGONE_SETTINGS_KEY";

const IV_LEN: usize = 16;

type Aes256CbcEnc = cbc::Encryptor<aes::Aes256>;
type Aes256CbcDec = cbc::Decryptor<aes::Aes256>;

/// An error while encrypting or decrypting a settings value
#[derive(Clone, Debug, Error, PartialEq, Eq)]
pub enum EncryptionError {
    /// No passphrase has been configured
    #[error("no settings encryption key configured (set PINGONE_SETTINGS_KEY)")]
    NoKey,
    /// The value does not carry the encrypted marker
    #[error("value is not encrypted")]
    NotEncrypted,
    /// The value carries the marker but is not laid out as expected
    #[error("malformed encrypted value: {0}")]
    Malformed(&'static str),
    /// The ciphertext could not be decrypted with the configured key
    #[error("decryption failed; check key configuration")]
    DecryptionFailed,
    /// The cipher could not be initialised
    #[error("encryption failed")]
    EncryptionFailed,
}

/// Returns `true` if the value carries the encrypted marker
#[inline]
pub fn is_encrypted(value: &str) -> bool {
    value.starts_with(ENCRYPTED_PREFIX)
}

/// Encrypts and decrypts secrets stored in settings
pub trait SettingsCipher: Send + Sync {
    /// Encrypts `plaintext`
    ///
    /// A value that is already encrypted is returned unchanged.
    fn encrypt(&self, plaintext: &str) -> Result<String, EncryptionError>;

    /// Decrypts a value produced by [`encrypt()`][Self::encrypt()]
    fn decrypt(&self, ciphertext: &str) -> Result<String, EncryptionError>;

    /// Returns `true` if the value carries the encrypted marker
    fn is_encrypted(&self, value: &str) -> bool {
        is_encrypted(value)
    }
}

/// AES-256-CBC settings cipher keyed from a passphrase
#[derive(Clone)]
pub struct AesSettingsCipher {
    key: Option<[u8; 32]>,
}

impl AesSettingsCipher {
    /// Derives the key from a passphrase
    pub fn from_passphrase(passphrase: &str) -> Self {
        let digest = Sha256::digest(passphrase.as_bytes());
        let mut key = [0u8; 32];
        key.copy_from_slice(&digest);
        Self { key: Some(key) }
    }

    /// A cipher with no key, which refuses to encrypt or decrypt
    pub fn without_key() -> Self {
        Self { key: None }
    }

    /// Reads the passphrase from [`SETTINGS_KEY_VAR`]
    ///
    /// A missing or blank variable produces a cipher without a key.
    pub fn from_env(env: &dyn Environment) -> Self {
        match env.var(SETTINGS_KEY_VAR) {
            Some(passphrase) if !passphrase.trim().is_empty() => Self::from_passphrase(&passphrase),
            _ => {
                tracing::warn!(
                    var = SETTINGS_KEY_VAR,
                    "no settings encryption key configured; encrypted secrets cannot be read"
                );
                Self::without_key()
            }
        }
    }

    /// Returns `true` if a key is configured
    pub fn has_key(&self) -> bool {
        self.key.is_some()
    }

    fn key(&self) -> Result<&[u8; 32], EncryptionError> {
        self.key.as_ref().ok_or(EncryptionError::NoKey)
    }
}

impl fmt::Debug for AesSettingsCipher {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        f.debug_struct("AesSettingsCipher")
            .field("key", &self.key.map(|_| "***"))
            .finish()
    }
}

impl SettingsCipher for AesSettingsCipher {
    fn encrypt(&self, plaintext: &str) -> Result<String, EncryptionError> {
        if is_encrypted(plaintext) {
            return Ok(plaintext.to_owned());
        }

        let key = self.key()?;

        let mut iv = [0u8; IV_LEN];
        rand::thread_rng().fill_bytes(&mut iv);

        let ciphertext = Aes256CbcEnc::new_from_slices(key, &iv)
            .map_err(|_| EncryptionError::EncryptionFailed)?
            .encrypt_padded_vec_mut::<Pkcs7>(plaintext.as_bytes());

        Ok(format!(
            "{}{}:{}",
            ENCRYPTED_PREFIX,
            hex::encode(iv),
            STANDARD.encode(ciphertext)
        ))
    }

    fn decrypt(&self, ciphertext: &str) -> Result<String, EncryptionError> {
        let body = ciphertext
            .strip_prefix(ENCRYPTED_PREFIX)
            .ok_or(EncryptionError::NotEncrypted)?;

        let key = self.key()?;

        let (iv_hex, data_b64) = body
            .split_once(':')
            .ok_or(EncryptionError::Malformed("missing iv separator"))?;

        let iv = hex::decode(iv_hex).map_err(|_| EncryptionError::Malformed("iv is not hex"))?;
        if iv.len() != IV_LEN {
            return Err(EncryptionError::Malformed("iv must be 16 bytes"));
        }

        let data = STANDARD
            .decode(data_b64)
            .map_err(|_| EncryptionError::Malformed("ciphertext is not base64"))?;

        let plain = Aes256CbcDec::new_from_slices(key, &iv)
            .map_err(|_| EncryptionError::DecryptionFailed)?
            .decrypt_padded_vec_mut::<Pkcs7>(&data)
            .map_err(|_| EncryptionError::DecryptionFailed)?;

        String::from_utf8(plain).map_err(|_| EncryptionError::DecryptionFailed)
    }
}

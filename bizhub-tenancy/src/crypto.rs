//! Secret protection
//!
//! Stored database passwords and connection strings are encrypted with a
//! [`SecretProvider`]. The default provider is AES-256-GCM.
//!
//! Format: base64(nonce_12bytes || ciphertext || tag_16bytes)

use crate::error::{TenantError, TenantResult};
use aes_gcm::aead::Aead;
use aes_gcm::{Aes256Gcm, KeyInit, Nonce};
use base64::Engine;
use base64::engine::general_purpose::STANDARD;
use rand::Rng;
use rand::seq::{IndexedRandom, SliceRandom};
use std::fmt;
use zeroize::{Zeroize, Zeroizing};

const NONCE_LEN: usize = 12;
const TAG_LEN: usize = 16;
const KEY_LEN: usize = 32;

/// Environment variable holding the base64 key.
pub const ENCRYPTION_KEY_ENV: &str = "BIZHUB_ENCRYPTION_KEY";

/// Encrypts and decrypts stored secrets.
pub trait SecretProvider: Send + Sync {
    fn encrypt(&self, plaintext: &str) -> TenantResult<String>;

    fn decrypt(&self, ciphertext: &str) -> TenantResult<String>;
}

/// AES-256-GCM provider. The key is zeroized on drop.
#[derive(Clone)]
pub struct AesGcmSecretProvider {
    key: [u8; KEY_LEN],
}

impl Drop for AesGcmSecretProvider {
    fn drop(&mut self) {
        self.key.zeroize();
    }
}

impl fmt::Debug for AesGcmSecretProvider {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("AesGcmSecretProvider")
            .field("key", &"[redacted]")
            .finish()
    }
}

impl AesGcmSecretProvider {
    pub fn new(key: [u8; KEY_LEN]) -> Self {
        Self { key }
    }

    /// Fresh random key, for tests and first-time setup.
    pub fn generate() -> Self {
        let mut key = [0u8; KEY_LEN];
        rand::rng().fill(&mut key);
        Self { key }
    }

    pub fn from_base64(encoded: &str) -> TenantResult<Self> {
        let bytes = Zeroizing::new(
            STANDARD
                .decode(encoded.trim())
                .map_err(|e| TenantError::Validation(format!("encryption key is not base64: {e}")))?,
        );
        if bytes.len() != KEY_LEN {
            return Err(TenantError::Validation(format!(
                "encryption key wrong length: {} (expected {KEY_LEN})",
                bytes.len()
            )));
        }
        let mut key = [0u8; KEY_LEN];
        key.copy_from_slice(&bytes);
        Ok(Self { key })
    }

    /// Load the key from [`ENCRYPTION_KEY_ENV`].
    pub fn from_env() -> TenantResult<Self> {
        let encoded = Zeroizing::new(std::env::var(ENCRYPTION_KEY_ENV).map_err(|_| {
            TenantError::Validation(format!("{ENCRYPTION_KEY_ENV} is not set"))
        })?);
        Self::from_base64(&encoded)
    }

    fn cipher(&self) -> TenantResult<Aes256Gcm> {
        Aes256Gcm::new_from_slice(&self.key)
            .map_err(|_| TenantError::infrastructure("invalid encryption key"))
    }
}

impl SecretProvider for AesGcmSecretProvider {
    fn encrypt(&self, plaintext: &str) -> TenantResult<String> {
        let cipher = self.cipher()?;

        let mut nonce_bytes = [0u8; NONCE_LEN];
        rand::rng().fill(&mut nonce_bytes);
        let nonce = Nonce::from_slice(&nonce_bytes);

        let ciphertext = cipher
            .encrypt(nonce, plaintext.as_bytes())
            .map_err(|_| TenantError::infrastructure("encryption failed"))?;

        let mut blob = Vec::with_capacity(NONCE_LEN + ciphertext.len());
        blob.extend_from_slice(&nonce_bytes);
        blob.extend_from_slice(&ciphertext);
        Ok(STANDARD.encode(&blob))
    }

    fn decrypt(&self, ciphertext: &str) -> TenantResult<String> {
        let data = STANDARD
            .decode(ciphertext)
            .map_err(|_| TenantError::infrastructure("ciphertext is not base64"))?;
        if data.len() < NONCE_LEN + TAG_LEN {
            return Err(TenantError::infrastructure("ciphertext too short"));
        }

        let cipher = self.cipher()?;
        let nonce = Nonce::from_slice(&data[..NONCE_LEN]);
        let plaintext = Zeroizing::new(
            cipher
                .decrypt(nonce, &data[NONCE_LEN..])
                .map_err(|_| TenantError::infrastructure("decryption failed (wrong key or tampered data)"))?,
        );

        String::from_utf8(plaintext.to_vec())
            .map_err(|_| TenantError::infrastructure("decrypted secret is not UTF-8"))
    }
}

const UPPER: &[u8] = b"ABCDEFGHJKLMNPQRSTUVWXYZ";
const LOWER: &[u8] = b"abcdefghijkmnopqrstuvwxyz";
const DIGITS: &[u8] = b"23456789";
// No `;`, `=` or quotes: the password is embedded unquoted in a connection string.
const SYMBOLS: &[u8] = b"!@#$%^&*()-_+[]{}?";

/// Length of generated database passwords.
pub const PASSWORD_LEN: usize = 24;

/// Strong random password with at least one upper-case letter, lower-case
/// letter, digit and symbol.
pub fn generate_password() -> Zeroizing<String> {
    let mut rng = rand::rng();
    let all: Vec<u8> = [UPPER, LOWER, DIGITS, SYMBOLS].concat();

    let mut chars: Vec<u8> = Vec::with_capacity(PASSWORD_LEN);
    for class in [UPPER, LOWER, DIGITS, SYMBOLS] {
        if let Some(c) = class.choose(&mut rng) {
            chars.push(*c);
        }
    }
    while chars.len() < PASSWORD_LEN {
        chars.push(all[rng.random_range(0..all.len())]);
    }
    chars.shuffle(&mut rng);

    Zeroizing::new(chars.into_iter().map(char::from).collect())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_encrypt_decrypt() {
        let provider = AesGcmSecretProvider::generate();
        let encrypted = provider.encrypt("Server=x;Password=y").unwrap();
        assert_ne!(encrypted, "Server=x;Password=y");
        assert_eq!(provider.decrypt(&encrypted).unwrap(), "Server=x;Password=y");
    }

    #[test]
    fn test_nonce_is_random() {
        let provider = AesGcmSecretProvider::generate();
        assert_ne!(provider.encrypt("same").unwrap(), provider.encrypt("same").unwrap());
    }

    #[test]
    fn test_wrong_key_fails() {
        let a = AesGcmSecretProvider::generate();
        let b = AesGcmSecretProvider::generate();
        let encrypted = a.encrypt("secret").unwrap();
        assert!(b.decrypt(&encrypted).is_err());
        assert!(a.decrypt("not base64!").is_err());
        assert!(a.decrypt(&STANDARD.encode([0u8; 8])).is_err());
    }

    #[test]
    fn test_from_base64() {
        let encoded = STANDARD.encode([7u8; KEY_LEN]);
        let provider = AesGcmSecretProvider::from_base64(&encoded).unwrap();
        let encrypted = provider.encrypt("x").unwrap();
        assert_eq!(provider.decrypt(&encrypted).unwrap(), "x");

        assert!(AesGcmSecretProvider::from_base64(&STANDARD.encode([1u8; 16])).is_err());
        assert!(AesGcmSecretProvider::from_base64("%%%").is_err());
    }

    #[test]
    fn test_debug_hides_key() {
        let provider = AesGcmSecretProvider::new([1u8; KEY_LEN]);
        assert!(format!("{provider:?}").contains("redacted"));
    }

    #[test]
    fn test_generated_password_classes() {
        for _ in 0..20 {
            let password = generate_password();
            assert_eq!(password.len(), PASSWORD_LEN);
            assert!(password.chars().any(|c| c.is_ascii_uppercase()));
            assert!(password.chars().any(|c| c.is_ascii_lowercase()));
            assert!(password.chars().any(|c| c.is_ascii_digit()));
            assert!(password.chars().any(|c| SYMBOLS.contains(&(c as u8))));
            assert!(!password.contains(';') && !password.contains('=') && !password.contains('\''));
        }
    }
}

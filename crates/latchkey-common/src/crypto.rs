//! Token encryption module
//!
//! Provides AES-GCM encryption/decryption for opaque single-use tokens.
//! Keys may be 16, 24 or 32 bytes (AES-128/192/256).

use aes_gcm::{
    Aes128Gcm, Aes256Gcm, AesGcm, Nonce,
    aead::{Aead, KeyInit, consts::U12},
    aes::Aes192,
};
use base64::{
    Engine as _,
    engine::general_purpose::{STANDARD as BASE64, URL_SAFE_NO_PAD},
};
use rand::RngCore;
use thiserror::Error;

type Aes192Gcm = AesGcm<Aes192, U12>;

const NONCE_LEN: usize = 12;

/// Error types for encryption operations
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum CryptoError {
    #[error("Encryption failed: {0}")]
    EncryptionFailed(String),

    #[error("Decryption failed: {0}")]
    DecryptionFailed(String),

    #[error("Invalid key: {0}")]
    InvalidKey(String),

    #[error("Invalid data: {0}")]
    InvalidData(String),

    #[error("Base64 decode error: {0}")]
    Base64Error(String),
}

/// Result type for crypto operations
pub type CryptoResult<T> = Result<T, CryptoError>;

enum CipherKind {
    Aes128(Box<Aes128Gcm>),
    Aes192(Box<Aes192Gcm>),
    Aes256(Box<Aes256Gcm>),
}

/// Symmetric cipher for anti-replay tokens
///
/// The encrypted token format is:
/// - 12 bytes nonce
/// - Encrypted data
/// - 16 bytes authentication tag (appended by AES-GCM)
///
/// The final output is URL-safe base64 without padding so tokens can travel
/// in headers and query strings unchanged.
pub struct TokenCipher {
    cipher: CipherKind,
}

impl std::fmt::Debug for TokenCipher {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TokenCipher")
            .field("key_bits", &self.key_bits())
            .finish()
    }
}

impl TokenCipher {
    /// Create a cipher from raw key bytes (16, 24 or 32 bytes)
    pub fn new(key: &[u8]) -> CryptoResult<Self> {
        let cipher = match key.len() {
            16 => Aes128Gcm::new_from_slice(key).map(|c| CipherKind::Aes128(Box::new(c))),
            24 => Aes192Gcm::new_from_slice(key).map(|c| CipherKind::Aes192(Box::new(c))),
            32 => Aes256Gcm::new_from_slice(key).map(|c| CipherKind::Aes256(Box::new(c))),
            other => {
                return Err(CryptoError::InvalidKey(format!(
                    "Key must be 16, 24 or 32 bytes, got {}",
                    other
                )));
            }
        }
        .map_err(|e| CryptoError::InvalidKey(e.to_string()))?;
        Ok(Self { cipher })
    }

    /// Create a cipher from a base64-encoded key
    pub fn from_base64_key(key: &str) -> CryptoResult<Self> {
        let key_bytes = BASE64
            .decode(key.trim())
            .map_err(|e| CryptoError::Base64Error(e.to_string()))?;
        Self::new(&key_bytes)
    }

    /// Generate a new random key of the given size in bits (128, 192 or 256)
    pub fn generate_key(bits: usize) -> CryptoResult<Vec<u8>> {
        if !matches!(bits, 128 | 192 | 256) {
            return Err(CryptoError::InvalidKey(format!(
                "Key size must be 128, 192 or 256 bits, got {}",
                bits
            )));
        }
        let mut key = vec![0u8; bits / 8];
        rand::rng().fill_bytes(&mut key);
        Ok(key)
    }

    /// Generate a new random key and return it as base64
    pub fn generate_base64_key(bits: usize) -> CryptoResult<String> {
        Self::generate_key(bits).map(|key| BASE64.encode(key))
    }

    /// Size of the configured key in bits
    pub fn key_bits(&self) -> usize {
        match self.cipher {
            CipherKind::Aes128(_) => 128,
            CipherKind::Aes192(_) => 192,
            CipherKind::Aes256(_) => 256,
        }
    }

    /// Encrypt plaintext data
    ///
    /// Returns base64-encoded ciphertext with embedded nonce
    pub fn encrypt(&self, plaintext: &str) -> CryptoResult<String> {
        let mut nonce_bytes = [0u8; NONCE_LEN];
        rand::rng().fill_bytes(&mut nonce_bytes);
        let nonce = Nonce::<U12>::from_slice(&nonce_bytes);

        let ciphertext = match &self.cipher {
            CipherKind::Aes128(c) => c.encrypt(nonce, plaintext.as_bytes()),
            CipherKind::Aes192(c) => c.encrypt(nonce, plaintext.as_bytes()),
            CipherKind::Aes256(c) => c.encrypt(nonce, plaintext.as_bytes()),
        }
        .map_err(|e| CryptoError::EncryptionFailed(e.to_string()))?;

        let mut combined = Vec::with_capacity(NONCE_LEN + ciphertext.len());
        combined.extend_from_slice(&nonce_bytes);
        combined.extend_from_slice(&ciphertext);

        Ok(URL_SAFE_NO_PAD.encode(combined))
    }

    /// Decrypt base64-encoded ciphertext
    ///
    /// The ciphertext must include the nonce prefix
    pub fn decrypt(&self, ciphertext: &str) -> CryptoResult<String> {
        let combined = URL_SAFE_NO_PAD
            .decode(ciphertext)
            .map_err(|e| CryptoError::Base64Error(e.to_string()))?;

        if combined.len() < NONCE_LEN {
            return Err(CryptoError::InvalidData("Ciphertext too short".to_string()));
        }

        let (nonce_bytes, ciphertext_bytes) = combined.split_at(NONCE_LEN);
        let nonce = Nonce::<U12>::from_slice(nonce_bytes);

        let plaintext = match &self.cipher {
            CipherKind::Aes128(c) => c.decrypt(nonce, ciphertext_bytes),
            CipherKind::Aes192(c) => c.decrypt(nonce, ciphertext_bytes),
            CipherKind::Aes256(c) => c.decrypt(nonce, ciphertext_bytes),
        }
        .map_err(|e| CryptoError::DecryptionFailed(e.to_string()))?;

        String::from_utf8(plaintext)
            .map_err(|e| CryptoError::DecryptionFailed(format!("Invalid UTF-8: {}", e)))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_generate_key_sizes() {
        for bits in [128, 192, 256] {
            let key = TokenCipher::generate_base64_key(bits).unwrap();
            let decoded = BASE64.decode(&key).unwrap();
            assert_eq!(decoded.len(), bits / 8);
        }
        assert!(TokenCipher::generate_key(512).is_err());
    }

    #[test]
    fn test_encrypt_decrypt_all_key_sizes() {
        for bits in [128, 192, 256] {
            let key = TokenCipher::generate_key(bits).unwrap();
            let cipher = TokenCipher::new(&key).unwrap();
            assert_eq!(cipher.key_bits(), bits);

            let plaintext = "pay:1001:8f14e45fceea167a5a36dedd4bea2543";
            let encrypted = cipher.encrypt(plaintext).unwrap();
            assert_ne!(encrypted, plaintext);
            assert_eq!(cipher.decrypt(&encrypted).unwrap(), plaintext);
        }
    }

    #[test]
    fn test_ciphertext_is_randomized() {
        let cipher = TokenCipher::new(&TokenCipher::generate_key(256).unwrap()).unwrap();
        let a = cipher.encrypt("same").unwrap();
        let b = cipher.encrypt("same").unwrap();
        assert_ne!(a, b);
    }

    #[test]
    fn test_ciphertext_is_url_safe() {
        let cipher = TokenCipher::new(&TokenCipher::generate_key(128).unwrap()).unwrap();
        for _ in 0..32 {
            let token = cipher.encrypt("order:42:abcdef").unwrap();
            assert!(
                token
                    .chars()
                    .all(|c| c.is_ascii_alphanumeric() || c == '-' || c == '_')
            );
        }
    }

    #[test]
    fn test_invalid_key_length() {
        // "too_short" in base64
        assert!(matches!(
            TokenCipher::from_base64_key("dG9vX3Nob3J0"),
            Err(CryptoError::InvalidKey(_))
        ));
        assert!(matches!(
            TokenCipher::from_base64_key("not base64!"),
            Err(CryptoError::Base64Error(_))
        ));
    }

    #[test]
    fn test_wrong_key_fails() {
        let a = TokenCipher::new(&TokenCipher::generate_key(256).unwrap()).unwrap();
        let b = TokenCipher::new(&TokenCipher::generate_key(256).unwrap()).unwrap();
        let encrypted = a.encrypt("secret").unwrap();
        assert!(matches!(
            b.decrypt(&encrypted),
            Err(CryptoError::DecryptionFailed(_))
        ));
    }

    #[test]
    fn test_invalid_ciphertext() {
        let cipher = TokenCipher::new(&TokenCipher::generate_key(256).unwrap()).unwrap();

        assert!(cipher.decrypt("invalid base64!").is_err());
        // Too short
        assert!(cipher.decrypt(&URL_SAFE_NO_PAD.encode([0u8; 5])).is_err());
        // Long enough but not authentic
        assert!(cipher.decrypt(&URL_SAFE_NO_PAD.encode([7u8; 40])).is_err());
    }

    #[test]
    fn test_debug_hides_key() {
        let cipher = TokenCipher::new(&[1u8; 16]).unwrap();
        assert_eq!(format!("{:?}", cipher), "TokenCipher { key_bits: 128 }");
    }
}

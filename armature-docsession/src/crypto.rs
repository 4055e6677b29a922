//! Cryptography providers used by the cookie codec.
//!
//! The codec only depends on the two traits below. The defaults are
//! AES-256-GCM for encryption and HMAC-SHA256 for the authentication tag.

use crate::error::{SessionError, SessionResult};
use base64::{Engine, engine::general_purpose::STANDARD};
use hmac::{Hmac, Mac};
use ring::aead::{AES_256_GCM, Aad, LessSafeKey, NONCE_LEN, Nonce, UnboundKey};
use ring::rand::{SecureRandom, SystemRandom};
use sha2::Sha256;
use std::fmt;
use std::num::NonZeroU32;
use std::sync::Arc;

type HmacSha256 = Hmac<Sha256>;

/// AES-256 key length in bytes.
pub const ENCRYPTION_KEY_LEN: usize = 32;

/// HMAC key length in bytes.
pub const HMAC_KEY_LEN: usize = 32;

/// Minimum PBKDF2 salt length in bytes.
pub const MIN_SALT_LEN: usize = 8;

const PBKDF2_ITERATIONS: u32 = 10_000;

/// Symmetric encryption of cookie payloads.
pub trait EncryptionProvider: Send + Sync {
    /// Encrypt `plaintext` into a printable string.
    fn encrypt(&self, plaintext: &str) -> SessionResult<String>;

    /// Reverse [`EncryptionProvider::encrypt`].
    fn decrypt(&self, ciphertext: &str) -> SessionResult<String>;
}

/// Keyed authentication tag over cookie payloads.
pub trait HmacProvider: Send + Sync {
    /// Length of the raw tag in bytes.
    fn hmac_length(&self) -> usize;

    /// Compute the tag for `data`.
    fn generate_hmac(&self, data: &[u8]) -> Vec<u8>;

    /// Check `tag` against `data`. Implementations must compare in constant time.
    fn verify_hmac(&self, data: &[u8], tag: &[u8]) -> bool;
}

/// The encryption and HMAC providers used together for session cookies.
#[derive(Clone)]
pub struct CryptographyConfig {
    encryption: Arc<dyn EncryptionProvider>,
    hmac: Arc<dyn HmacProvider>,
}

impl CryptographyConfig {
    /// Pair arbitrary providers.
    pub fn new(encryption: Arc<dyn EncryptionProvider>, hmac: Arc<dyn HmacProvider>) -> Self {
        Self { encryption, hmac }
    }

    /// Fresh random keys.
    ///
    /// Cookies issued with these keys become unreadable after a restart.
    pub fn random() -> SessionResult<Self> {
        Ok(Self::new(
            Arc::new(AesGcmEncryptionProvider::random()?),
            Arc::new(HmacSha256Provider::random()?),
        ))
    }

    /// Derive both keys from a passphrase with PBKDF2-HMAC-SHA256.
    ///
    /// # Examples
    ///
    /// ```
    /// use armature_docsession::CryptographyConfig;
    ///
    /// let crypto = CryptographyConfig::from_passphrase("correct horse battery", b"my-app-salt").unwrap();
    /// assert_eq!(crypto.hmac().hmac_length(), 32);
    /// ```
    pub fn from_passphrase(passphrase: &str, salt: &[u8]) -> SessionResult<Self> {
        let mut material = [0u8; ENCRYPTION_KEY_LEN + HMAC_KEY_LEN];
        derive_key(passphrase, salt, &mut material)?;
        let (encryption_key, hmac_key) = material.split_at(ENCRYPTION_KEY_LEN);

        Ok(Self::new(
            Arc::new(AesGcmEncryptionProvider::new(encryption_key)?),
            Arc::new(HmacSha256Provider::new(hmac_key)?),
        ))
    }

    /// The encryption provider.
    pub fn encryption(&self) -> &dyn EncryptionProvider {
        self.encryption.as_ref()
    }

    /// The HMAC provider.
    pub fn hmac(&self) -> &dyn HmacProvider {
        self.hmac.as_ref()
    }
}

impl fmt::Debug for CryptographyConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CryptographyConfig")
            .field("hmac_length", &self.hmac.hmac_length())
            .finish_non_exhaustive()
    }
}

fn derive_key(passphrase: &str, salt: &[u8], out: &mut [u8]) -> SessionResult<()> {
    if passphrase.is_empty() {
        return Err(SessionError::Config("Passphrase must not be empty".to_string()));
    }
    if salt.len() < MIN_SALT_LEN {
        return Err(SessionError::Config(format!(
            "Salt must be at least {} bytes",
            MIN_SALT_LEN
        )));
    }

    let iterations = NonZeroU32::new(PBKDF2_ITERATIONS)
        .ok_or_else(|| SessionError::Crypto("PBKDF2 iteration count is zero".to_string()))?;
    ring::pbkdf2::derive(
        ring::pbkdf2::PBKDF2_HMAC_SHA256,
        iterations,
        salt,
        passphrase.as_bytes(),
        out,
    );
    Ok(())
}

fn random_bytes<const N: usize>(rng: &SystemRandom) -> SessionResult<[u8; N]> {
    let mut bytes = [0u8; N];
    rng.fill(&mut bytes)
        .map_err(|_| SessionError::Crypto("System random source failed".to_string()))?;
    Ok(bytes)
}

/// AES-256-GCM encryption.
///
/// Output is `base64(nonce || ciphertext || tag)` with a random nonce per call.
pub struct AesGcmEncryptionProvider {
    key: LessSafeKey,
    rng: SystemRandom,
}

impl AesGcmEncryptionProvider {
    /// Use a raw 32-byte key.
    pub fn new(key: &[u8]) -> SessionResult<Self> {
        if key.len() != ENCRYPTION_KEY_LEN {
            return Err(SessionError::Config(format!(
                "Encryption key must be {} bytes, got {}",
                ENCRYPTION_KEY_LEN,
                key.len()
            )));
        }

        let unbound = UnboundKey::new(&AES_256_GCM, key)
            .map_err(|_| SessionError::Crypto("Invalid AES-256-GCM key".to_string()))?;

        Ok(Self {
            key: LessSafeKey::new(unbound),
            rng: SystemRandom::new(),
        })
    }

    /// Generate a random key.
    pub fn random() -> SessionResult<Self> {
        let key: [u8; ENCRYPTION_KEY_LEN] = random_bytes(&SystemRandom::new())?;
        Self::new(&key)
    }
}

impl EncryptionProvider for AesGcmEncryptionProvider {
    fn encrypt(&self, plaintext: &str) -> SessionResult<String> {
        let nonce_bytes: [u8; NONCE_LEN] = random_bytes(&self.rng)?;

        let mut in_out = plaintext.as_bytes().to_vec();
        self.key
            .seal_in_place_append_tag(
                Nonce::assume_unique_for_key(nonce_bytes),
                Aad::empty(),
                &mut in_out,
            )
            .map_err(|_| SessionError::Crypto("Encryption failed".to_string()))?;

        let mut output = Vec::with_capacity(NONCE_LEN + in_out.len());
        output.extend_from_slice(&nonce_bytes);
        output.extend_from_slice(&in_out);
        Ok(STANDARD.encode(output))
    }

    fn decrypt(&self, ciphertext: &str) -> SessionResult<String> {
        let raw = STANDARD
            .decode(ciphertext)
            .map_err(|e| SessionError::Crypto(e.to_string()))?;

        if raw.len() < NONCE_LEN + AES_256_GCM.tag_len() {
            return Err(SessionError::Crypto("Ciphertext too short".to_string()));
        }

        let (nonce_bytes, sealed) = raw.split_at(NONCE_LEN);
        let nonce = Nonce::try_assume_unique_for_key(nonce_bytes)
            .map_err(|_| SessionError::Crypto("Invalid nonce".to_string()))?;

        let mut in_out = sealed.to_vec();
        let plaintext = self
            .key
            .open_in_place(nonce, Aad::empty(), &mut in_out)
            .map_err(|_| SessionError::Crypto("Decryption failed".to_string()))?;

        String::from_utf8(plaintext.to_vec()).map_err(|e| SessionError::Crypto(e.to_string()))
    }
}

/// HMAC-SHA256 tags (32 bytes).
#[derive(Clone)]
pub struct HmacSha256Provider {
    mac: HmacSha256,
}

impl HmacSha256Provider {
    /// Use a raw key. At least 32 bytes are required.
    pub fn new(key: &[u8]) -> SessionResult<Self> {
        if key.len() < HMAC_KEY_LEN {
            return Err(SessionError::Config(format!(
                "HMAC key must be at least {} bytes",
                HMAC_KEY_LEN
            )));
        }

        let mac = HmacSha256::new_from_slice(key)
            .map_err(|e| SessionError::Crypto(e.to_string()))?;
        Ok(Self { mac })
    }

    /// Generate a random key.
    pub fn random() -> SessionResult<Self> {
        let key: [u8; HMAC_KEY_LEN] = random_bytes(&SystemRandom::new())?;
        Self::new(&key)
    }
}

impl HmacProvider for HmacSha256Provider {
    fn hmac_length(&self) -> usize {
        32
    }

    fn generate_hmac(&self, data: &[u8]) -> Vec<u8> {
        let mut mac = self.mac.clone();
        mac.update(data);
        mac.finalize().into_bytes().to_vec()
    }

    fn verify_hmac(&self, data: &[u8], tag: &[u8]) -> bool {
        let mut mac = self.mac.clone();
        mac.update(data);
        mac.verify_slice(tag).is_ok()
    }
}

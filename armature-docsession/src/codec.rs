//! Session cookie encoding.
//!
//! Wire format: `urlencode(base64(hmac) || encrypted_payload)`. The HMAC is
//! computed over the encrypted payload string and checked, in constant time,
//! before anything is decrypted.

use crate::crypto::CryptographyConfig;
use crate::error::SessionResult;
use base64::{Engine, engine::general_purpose::STANDARD};
use tracing::debug;

/// Turns session ids into tamper-evident cookie values and back.
#[derive(Debug, Clone)]
pub struct CookieCodec {
    crypto: CryptographyConfig,
}

impl CookieCodec {
    /// Create a codec over the given providers.
    pub fn new(crypto: CryptographyConfig) -> Self {
        Self { crypto }
    }

    /// Length of the base64-encoded HMAC prefix.
    pub fn hmac_prefix_len(&self) -> usize {
        self.crypto.hmac().hmac_length().div_ceil(3) * 4
    }

    /// Encode a session id into a cookie value.
    ///
    /// # Examples
    ///
    /// ```
    /// use armature_docsession::{CookieCodec, CryptographyConfig};
    ///
    /// let codec = CookieCodec::new(CryptographyConfig::random().unwrap());
    /// let cookie = codec.encode("my-session-id").unwrap();
    /// assert_eq!(codec.decode(&cookie).as_deref(), Some("my-session-id"));
    /// ```
    pub fn encode(&self, session_id: &str) -> SessionResult<String> {
        let encrypted = self.crypto.encryption().encrypt(session_id)?;
        let hmac = self.crypto.hmac().generate_hmac(encrypted.as_bytes());

        let mut value = STANDARD.encode(hmac);
        value.push_str(&encrypted);

        Ok(urlencoding::encode(&value).into_owned())
    }

    /// Decode and verify a cookie value.
    ///
    /// Returns `None` for anything malformed, truncated or tampered with.
    /// Never errors: an invalid cookie is treated as no session at all.
    pub fn decode(&self, cookie_value: &str) -> Option<String> {
        let decoded = match urlencoding::decode(cookie_value) {
            Ok(decoded) => decoded,
            Err(_) => {
                debug!("Session cookie is not valid UTF-8 after URL decoding");
                return None;
            }
        };

        let prefix_len = self.hmac_prefix_len();
        if decoded.len() < prefix_len || !decoded.is_char_boundary(prefix_len) {
            debug!("Session cookie too short to carry an HMAC");
            return None;
        }

        let (hmac_part, payload_part) = decoded.split_at(prefix_len);

        let Ok(tag) = STANDARD.decode(hmac_part) else {
            debug!("Session cookie HMAC prefix is not valid base64");
            return None;
        };

        if !self.crypto.hmac().verify_hmac(payload_part.as_bytes(), &tag) {
            debug!("Session cookie HMAC mismatch");
            return None;
        }

        match self.crypto.encryption().decrypt(payload_part) {
            Ok(session_id) => Some(session_id),
            Err(e) => {
                debug!(error = %e, "Session cookie payload failed to decrypt");
                None
            }
        }
    }
}

//! Encrypted session cookies.
//!
//! Values are `base64url(nonce || ciphertext || tag)` under AES-256-GCM.
//! The cookie name is bound as associated data so one cookie's value
//! cannot be replayed under another name.

use std::fmt;

use base64::{engine::general_purpose::URL_SAFE_NO_PAD, Engine};
use chrono::DateTime;
use ring::aead::{Aad, LessSafeKey, Nonce, UnboundKey, AES_256_GCM, NONCE_LEN};
use ring::rand::{SecureRandom, SystemRandom};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};

use crate::config::CookieConfig;
use crate::error::CookieError;

const TAG_LEN: usize = 16;

/// Browsers drop cookies past this size.
pub const MAX_COOKIE_BYTES: usize = 4096;

/// What the session cookie carries. Never stored server-side.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CookieSessionData {
    pub id_token: String,
    pub expires_on: u64,
    pub created_at: u64,
}

pub struct SecureCookieCodec {
    key: LessSafeKey,
    label: String,
    rng: SystemRandom,
}

impl fmt::Debug for SecureCookieCodec {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SecureCookieCodec")
            .field("label", &self.label)
            .finish_non_exhaustive()
    }
}

impl SecureCookieCodec {
    pub fn new(key: &[u8; 32], label: impl Into<String>) -> Result<Self, CookieError> {
        let unbound = UnboundKey::new(&AES_256_GCM, key)
            .map_err(|_| CookieError::InvalidSecret("AES-256-GCM key rejected".to_string()))?;
        Ok(Self {
            key: LessSafeKey::new(unbound),
            label: label.into(),
            rng: SystemRandom::new(),
        })
    }

    pub fn encrypt(&self, plaintext: &[u8]) -> Result<String, CookieError> {
        let mut nonce_bytes = [0u8; NONCE_LEN];
        self.rng
            .fill(&mut nonce_bytes)
            .map_err(|_| CookieError::Encryption)?;

        let mut in_out = plaintext.to_vec();
        self.key
            .seal_in_place_append_tag(
                Nonce::assume_unique_for_key(nonce_bytes),
                Aad::from(self.label.as_bytes()),
                &mut in_out,
            )
            .map_err(|_| CookieError::Encryption)?;

        let mut out = Vec::with_capacity(NONCE_LEN + in_out.len());
        out.extend_from_slice(&nonce_bytes);
        out.extend_from_slice(&in_out);
        Ok(URL_SAFE_NO_PAD.encode(out))
    }

    pub fn decrypt(&self, value: &str) -> Result<Vec<u8>, CookieError> {
        let raw = URL_SAFE_NO_PAD
            .decode(value.trim_end_matches('='))
            .map_err(|_| CookieError::Encoding)?;
        if raw.len() < NONCE_LEN + TAG_LEN {
            return Err(CookieError::TooShort(raw.len()));
        }

        let (nonce_bytes, sealed) = raw.split_at(NONCE_LEN);
        let nonce =
            Nonce::try_assume_unique_for_key(nonce_bytes).map_err(|_| CookieError::Decryption)?;
        let mut in_out = sealed.to_vec();
        let plaintext = self
            .key
            .open_in_place(nonce, Aad::from(self.label.as_bytes()), &mut in_out)
            .map_err(|_| CookieError::Decryption)?;
        Ok(plaintext.to_vec())
    }

    /// Serialize to JSON, then encrypt.
    pub fn seal<T: Serialize>(&self, payload: &T) -> Result<String, CookieError> {
        let json =
            serde_json::to_vec(payload).map_err(|e| CookieError::Payload(e.to_string()))?;
        self.encrypt(&json)
    }

    /// Decrypt, then deserialize from JSON.
    pub fn open<T: DeserializeOwned>(&self, value: &str) -> Result<T, CookieError> {
        let plaintext = self.decrypt(value)?;
        serde_json::from_slice(&plaintext).map_err(|e| CookieError::Payload(e.to_string()))
    }
}

/// Build a `Set-Cookie` header value expiring at `expires_on`.
pub fn set_cookie(
    config: &CookieConfig,
    name: &str,
    value: &str,
    expires_on: u64,
    now: u64,
) -> String {
    let mut header = format!("{}={}; Path={}", name, value, config.path);
    if let Some(domain) = &config.domain {
        header.push_str(&format!("; Domain={}", domain));
    }
    header.push_str(&format!("; Expires={}", http_date(expires_on)));
    header.push_str(&format!("; Max-Age={}", expires_on.saturating_sub(now)));
    push_flags(&mut header, config);
    header
}

/// Build a `Set-Cookie` header value that deletes `name`.
pub fn clear_cookie(config: &CookieConfig, name: &str) -> String {
    let mut header = format!("{}=; Path={}", name, config.path);
    if let Some(domain) = &config.domain {
        header.push_str(&format!("; Domain={}", domain));
    }
    header.push_str("; Expires=Thu, 01 Jan 1970 00:00:00 GMT; Max-Age=0");
    push_flags(&mut header, config);
    header
}

fn push_flags(header: &mut String, config: &CookieConfig) {
    if config.http_only {
        header.push_str("; HttpOnly");
    }
    header.push_str("; SameSite=");
    header.push_str(config.same_site.as_str());
    if config.secure {
        header.push_str("; Secure");
    }
}

/// Find `name` in a `Cookie` request header.
pub fn read_cookie<'a>(header: &'a str, name: &str) -> Option<&'a str> {
    header.split(';').find_map(|pair| {
        let (key, value) = pair.trim().split_once('=')?;
        (key == name).then_some(value)
    })
}

fn http_date(timestamp: u64) -> String {
    i64::try_from(timestamp)
        .ok()
        .and_then(|secs| DateTime::from_timestamp(secs, 0))
        .map(|dt| dt.format("%a, %d %b %Y %H:%M:%S GMT").to_string())
        .unwrap_or_else(|| "Thu, 01 Jan 1970 00:00:00 GMT".to_string())
}

//! Signed, self-expiring `state` and `nonce` values.
//!
//! A value looks like `random:issuedAt:expiry.signature` where the signature
//! is HMAC-SHA256 keyed by the client secret over the value and the
//! redirect URL. Nothing is stored server-side.

use std::fmt;

use base64::{engine::general_purpose::URL_SAFE_NO_PAD, Engine};
use hmac::{Hmac, Mac};
use ring::rand::{SecureRandom, SystemRandom};
use sha2::Sha256;

use crate::config::OidcConfig;
use crate::error::StateError;

type HmacSha256 = Hmac<Sha256>;

/// Lifetime of every generated value. Not configurable.
pub const STATE_TTL_SECONDS: u64 = 3600;

const RANDOM_LEN: usize = 32;

/// Decoded contents of a verified value.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StateToken {
    pub random: String,
    pub issued_at: u64,
    pub expiry: u64,
}

pub struct SignedStateCodec {
    key: Vec<u8>,
    redirect_url: String,
    rng: SystemRandom,
}

impl fmt::Debug for SignedStateCodec {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SignedStateCodec")
            .field("redirect_url", &self.redirect_url)
            .finish_non_exhaustive()
    }
}

impl SignedStateCodec {
    pub fn new(client_secret: &str, redirect_url: &str) -> Self {
        Self {
            key: client_secret.as_bytes().to_vec(),
            redirect_url: redirect_url.to_string(),
            rng: SystemRandom::new(),
        }
    }

    pub fn from_config(config: &OidcConfig) -> Self {
        Self::new(&config.client_secret, &config.redirect_url)
    }

    /// Produce a fresh `value.signature` string valid until `now + 3600`.
    pub fn generate(&self, now: u64) -> Result<String, StateError> {
        let mut random = [0u8; RANDOM_LEN];
        self.rng
            .fill(&mut random)
            .map_err(|_| StateError::Randomness)?;

        let value = format!(
            "{}:{}:{}",
            URL_SAFE_NO_PAD.encode(random),
            now,
            now + STATE_TTL_SECONDS
        );
        let signature = URL_SAFE_NO_PAD.encode(self.mac(&value)?.finalize().into_bytes());
        Ok(format!("{}.{}", value, signature))
    }

    /// Check signature first, then expiry.
    pub fn verify(&self, token: &str, now: u64) -> Result<StateToken, StateError> {
        let (value, signature) = token.rsplit_once('.').ok_or(StateError::Malformed)?;
        let signature = URL_SAFE_NO_PAD
            .decode(signature)
            .map_err(|_| StateError::SignatureMismatch)?;

        // verify_slice compares in constant time.
        self.mac(value)?
            .verify_slice(&signature)
            .map_err(|_| StateError::SignatureMismatch)?;

        let parsed = parse_value(value)?;
        if parsed.expiry <= now {
            return Err(StateError::Expired {
                expiry: parsed.expiry,
            });
        }
        Ok(parsed)
    }

    fn mac(&self, value: &str) -> Result<HmacSha256, StateError> {
        let mut mac = HmacSha256::new_from_slice(&self.key).map_err(|_| StateError::Malformed)?;
        mac.update(value.as_bytes());
        mac.update(b"\n");
        mac.update(self.redirect_url.as_bytes());
        Ok(mac)
    }
}

fn parse_value(value: &str) -> Result<StateToken, StateError> {
    let mut parts = value.split(':');
    let (Some(random), Some(issued_at), Some(expiry), None) =
        (parts.next(), parts.next(), parts.next(), parts.next())
    else {
        return Err(StateError::Malformed);
    };
    if random.is_empty() {
        return Err(StateError::Malformed);
    }

    Ok(StateToken {
        random: random.to_string(),
        issued_at: issued_at.parse().map_err(|_| StateError::Malformed)?,
        expiry: expiry.parse().map_err(|_| StateError::Malformed)?,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    const NOW: u64 = 1_700_000_000;

    fn codec() -> SignedStateCodec {
        SignedStateCodec::new("s3cret", "https://app.example/oauth2/callback")
    }

    #[test]
    fn generated_value_verifies() {
        let codec = codec();
        let token = codec.generate(NOW).unwrap();
        let state = codec.verify(&token, NOW + 10).unwrap();
        assert_eq!(state.issued_at, NOW);
        assert_eq!(state.expiry, NOW + STATE_TTL_SECONDS);
        assert_eq!(URL_SAFE_NO_PAD.decode(&state.random).unwrap().len(), 32);
    }

    #[test]
    fn values_are_unique() {
        let codec = codec();
        assert_ne!(codec.generate(NOW).unwrap(), codec.generate(NOW).unwrap());
    }

    #[test]
    fn flipping_any_byte_fails() {
        let codec = codec();
        let token = codec.generate(NOW).unwrap();
        for i in 0..token.len() {
            let mut bytes = token.clone().into_bytes();
            bytes[i] = if bytes[i] == b'A' { b'B' } else { b'A' };
            let Ok(tampered) = String::from_utf8(bytes) else {
                continue;
            };
            if tampered == token {
                continue;
            }
            assert!(
                codec.verify(&tampered, NOW).is_err(),
                "tampered byte {} accepted",
                i
            );
        }
    }

    #[test]
    fn expiry_enforced_with_valid_signature() {
        let codec = codec();
        let token = codec.generate(NOW).unwrap();
        assert_eq!(
            codec.verify(&token, NOW + STATE_TTL_SECONDS),
            Err(StateError::Expired {
                expiry: NOW + STATE_TTL_SECONDS
            })
        );
        assert!(codec.verify(&token, NOW + STATE_TTL_SECONDS - 1).is_ok());
    }

    #[test]
    fn bound_to_secret_and_redirect_url() {
        let token = codec().generate(NOW).unwrap();

        let other_secret = SignedStateCodec::new("other", "https://app.example/oauth2/callback");
        assert_eq!(
            other_secret.verify(&token, NOW),
            Err(StateError::SignatureMismatch)
        );

        let other_url = SignedStateCodec::new("s3cret", "https://evil.example/oauth2/callback");
        assert_eq!(
            other_url.verify(&token, NOW),
            Err(StateError::SignatureMismatch)
        );
    }

    #[test]
    fn malformed_inputs() {
        let codec = codec();
        assert_eq!(codec.verify("no-dot", NOW), Err(StateError::Malformed));
        assert_eq!(
            codec.verify("a:1:2.!!!", NOW),
            Err(StateError::SignatureMismatch)
        );
    }

    #[test]
    fn signed_but_unparseable_value_is_malformed() {
        let codec = codec();
        let value = "abc:notanumber:5";
        let sig = URL_SAFE_NO_PAD.encode(codec.mac(value).unwrap().finalize().into_bytes());
        assert_eq!(
            codec.verify(&format!("{}.{}", value, sig), NOW),
            Err(StateError::Malformed)
        );
    }

    #[test]
    fn debug_hides_key() {
        let rendered = format!("{:?}", codec());
        assert!(!rendered.contains("s3cret"));
    }
}

//! ID token verification.
//!
//! Claims are checked before the signature so that cheap rejections
//! (wrong issuer, wrong audience, expired) never touch key material. The
//! order is fixed and tests depend on which error wins.

use base64::{engine::general_purpose::URL_SAFE_NO_PAD, Engine};
use serde::{Deserialize, Serialize};

use crate::algorithm::{SigningAlgorithm, Verification};
use crate::config::OidcConfig;
use crate::error::VerifyError;
use crate::jwk::JsonWebKey;
use crate::jwks::JwkSet;
use crate::state::SignedStateCodec;

const GOOGLE_ISSUER: &str = "https://accounts.google.com";
const GOOGLE_ISSUER_BARE: &str = "accounts.google.com";

/// Verified claims.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct IdTokenClaims {
    pub issuer: String,
    pub subject: String,
    pub audience: Vec<String>,
    pub expiry: u64,
    pub issued_at: u64,
    pub not_before: Option<u64>,
    pub nonce: Option<String>,
    pub signature_algorithm: String,
    /// Every other claim, untouched.
    pub extra: serde_json::Map<String, serde_json::Value>,
}

/// Whether and how the `nonce` claim is bound to this login.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum NonceBinding {
    /// Session re-verification: no nonce check.
    Skip,
    /// Callback: the claim must be a live signed value, equal to `expected`
    /// when we still know what we sent.
    Bound { expected: Option<String> },
}

#[derive(Deserialize)]
struct RawClaims {
    #[serde(default)]
    iss: String,
    #[serde(default)]
    sub: String,
    #[serde(default)]
    aud: Option<Audience>,
    #[serde(default)]
    exp: Option<f64>,
    #[serde(default)]
    iat: Option<f64>,
    #[serde(default)]
    nbf: Option<f64>,
    #[serde(default)]
    nonce: Option<String>,
    #[serde(flatten)]
    extra: serde_json::Map<String, serde_json::Value>,
}

#[derive(Deserialize)]
#[serde(untagged)]
enum Audience {
    Single(String),
    Multiple(Vec<String>),
}

#[derive(Deserialize)]
struct JwsHeader {
    alg: String,
    #[serde(default)]
    kid: Option<String>,
    #[serde(default)]
    crit: Option<serde_json::Value>,
}

/// Seconds since the epoch; fractional parts are dropped.
fn numeric_date(value: Option<f64>) -> Option<u64> {
    value.filter(|v| v.is_finite() && *v >= 0.0).map(|v| v as u64)
}

#[derive(Debug)]
pub struct IdTokenVerifier {
    issuer: String,
    client_id: String,
    skip_issuer_check: bool,
    skip_expiry_check: bool,
    skip_nonce_check: bool,
    clock_skew: u64,
    nonce_codec: SignedStateCodec,
}

impl IdTokenVerifier {
    pub fn new(config: &OidcConfig) -> Self {
        Self {
            issuer: config.issuer.clone(),
            client_id: config.client_id.clone(),
            skip_issuer_check: config.skip_issuer_check,
            skip_expiry_check: config.skip_expiry_check,
            skip_nonce_check: config.skip_nonce_check,
            clock_skew: config.clock_skew_seconds,
            nonce_codec: SignedStateCodec::from_config(config),
        }
    }

    pub fn verify(
        &self,
        raw: &str,
        keys: &JwkSet,
        allowed: &[SigningAlgorithm],
        nonce: &NonceBinding,
        now: u64,
    ) -> Result<IdTokenClaims, VerifyError> {
        // 1. Split and decode the payload.
        let parts: Vec<&str> = raw.split('.').collect();
        if parts.len() < 2 {
            return Err(VerifyError::MalformedToken(format!(
                "expected 3 segments, found {}",
                parts.len()
            )));
        }
        let payload = decode_segment(parts[1], "payload")?;

        // 2. Typed claims.
        let claims: RawClaims = serde_json::from_slice(&payload)
            .map_err(|e| VerifyError::MalformedToken(format!("claims: {}", e)))?;
        let audience = match claims.aud {
            Some(Audience::Single(aud)) => vec![aud],
            Some(Audience::Multiple(auds)) => auds,
            None => Vec::new(),
        };

        // 3. Issuer.
        if !self.skip_issuer_check && !self.issuer_matches(&claims.iss) {
            return Err(VerifyError::IssuerMismatch {
                expected: self.issuer.clone(),
                found: claims.iss,
            });
        }

        // 4. Audience.
        if !self.client_id.is_empty() && !audience.iter().any(|a| *a == self.client_id) {
            return Err(VerifyError::AudienceMismatch);
        }

        // 5. Expiry and not-before.
        let expiry = numeric_date(claims.exp).unwrap_or(0);
        let not_before = numeric_date(claims.nbf);
        if !self.skip_expiry_check {
            if now >= expiry {
                return Err(VerifyError::TokenExpired { expiry });
            }
            if let Some(nbf) = not_before {
                if now.saturating_add(self.clock_skew) < nbf {
                    return Err(VerifyError::TokenNotYetValid { not_before: nbf });
                }
            }
        }

        // 6. Full JWS structure.
        if parts.len() != 3 {
            return Err(VerifyError::MalformedToken(format!(
                "expected 3 segments, found {}",
                parts.len()
            )));
        }
        let header: JwsHeader = serde_json::from_slice(&decode_segment(parts[0], "header")?)
            .map_err(|e| VerifyError::MalformedToken(format!("header: {}", e)))?;
        if header.crit.is_some() {
            return Err(VerifyError::MalformedToken(
                "critical header extensions are not supported".to_string(),
            ));
        }
        let signature = decode_segment(parts[2], "signature")?;
        if signature.is_empty() {
            return Err(VerifyError::MalformedToken("empty signature".to_string()));
        }

        // 7. Algorithm allow-list.
        let alg = header
            .alg
            .parse::<SigningAlgorithm>()
            .map_err(|_| VerifyError::UnsupportedSignatureAlgorithm(header.alg.clone()))?;
        let permitted = if allowed.is_empty() {
            alg == SigningAlgorithm::RS256
        } else {
            allowed.contains(&alg)
        };
        if !permitted {
            return Err(VerifyError::UnsupportedSignatureAlgorithm(header.alg));
        }

        // 8. Signature.
        let signing_input = &raw[..parts[0].len() + 1 + parts[1].len()];
        let candidates: Vec<&JsonWebKey> = match header.kid.as_deref() {
            Some(kid) => {
                let matching: Vec<&JsonWebKey> = keys.with_kid(kid).collect();
                if matching.is_empty() {
                    return Err(VerifyError::UnknownSigningKey(kid.to_string()));
                }
                matching
            }
            None => keys.keys().iter().collect(),
        };
        let verified = candidates
            .into_iter()
            .filter(|key| key.is_signing_key())
            .filter(|key| key.algorithm.as_deref().map_or(true, |hint| hint == alg.as_str()))
            .any(|key| {
                alg.verify(&key.key, signing_input.as_bytes(), &signature) == Verification::Valid
            });
        if !verified {
            return Err(VerifyError::SignatureMismatch);
        }

        // 9. Nonce binding.
        if let NonceBinding::Bound { expected } = nonce {
            if !self.skip_nonce_check {
                self.check_nonce(claims.nonce.as_deref(), expected.as_deref(), now)?;
            }
        }

        Ok(IdTokenClaims {
            issuer: claims.iss,
            subject: claims.sub,
            audience,
            expiry,
            issued_at: numeric_date(claims.iat).unwrap_or(0),
            not_before,
            nonce: claims.nonce,
            signature_algorithm: alg.as_str().to_string(),
            extra: claims.extra,
        })
    }

    fn issuer_matches(&self, found: &str) -> bool {
        found == self.issuer || (self.issuer == GOOGLE_ISSUER && found == GOOGLE_ISSUER_BARE)
    }

    fn check_nonce(
        &self,
        claim: Option<&str>,
        expected: Option<&str>,
        now: u64,
    ) -> Result<(), VerifyError> {
        let claim = claim.ok_or_else(|| VerifyError::NonceMismatch("nonce claim missing".into()))?;
        self.nonce_codec
            .verify(claim, now)
            .map_err(|e| VerifyError::NonceMismatch(e.to_string()))?;

        if let Some(expected) = expected {
            ring::constant_time::verify_slices_are_equal(claim.as_bytes(), expected.as_bytes())
                .map_err(|_| {
                    VerifyError::NonceMismatch("nonce differs from the one sent".into())
                })?;
        }
        Ok(())
    }
}

fn decode_segment(segment: &str, what: &str) -> Result<Vec<u8>, VerifyError> {
    URL_SAFE_NO_PAD
        .decode(segment.trim_end_matches('='))
        .map_err(|e| VerifyError::MalformedToken(format!("{}: {}", what, e)))
}

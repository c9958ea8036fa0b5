//! ES256 signing keys with a self-signed certificate.

use base64::{engine::general_purpose::STANDARD, engine::general_purpose::URL_SAFE_NO_PAD, Engine};
use rcgen::{CertificateParams, KeyPair, PKCS_ECDSA_P256_SHA256};
use ring::rand::SystemRandom;
use ring::signature::{EcdsaKeyPair, ECDSA_P256_SHA256_FIXED_SIGNING};
use serde_json::{json, Value};

use crate::TestError;

/// A P-256 key the fake IdP signs ID tokens with.
///
/// The JWK it publishes carries an `x5c` chain whose leaf matches the key,
/// so the relying party's certificate check runs on every test.
pub struct Signer {
    kid: String,
    pair: EcdsaKeyPair,
    certificate: Vec<u8>,
    rng: SystemRandom,
}

impl Signer {
    pub fn generate(kid: &str) -> Result<Self, TestError> {
        let key_pair = KeyPair::generate_for(&PKCS_ECDSA_P256_SHA256)?;
        let certificate = CertificateParams::new(vec!["idp.portcullis.test".to_string()])?
            .self_signed(&key_pair)?;

        let rng = SystemRandom::new();
        let pair = EcdsaKeyPair::from_pkcs8(
            &ECDSA_P256_SHA256_FIXED_SIGNING,
            &key_pair.serialize_der(),
            &rng,
        )
        .map_err(|e| TestError::Key(e.to_string()))?;

        Ok(Self {
            kid: kid.to_string(),
            pair,
            certificate: certificate.der().to_vec(),
            rng,
        })
    }

    pub fn kid(&self) -> &str {
        &self.kid
    }

    /// Public JWK with `x5c`.
    pub fn jwk(&self) -> Value {
        use ring::signature::KeyPair as _;

        let point = self.pair.public_key().as_ref();
        json!({
            "kty": "EC",
            "crv": "P-256",
            "use": "sig",
            "alg": "ES256",
            "kid": self.kid,
            "x": URL_SAFE_NO_PAD.encode(&point[1..33]),
            "y": URL_SAFE_NO_PAD.encode(&point[33..65]),
            "x5c": [STANDARD.encode(&self.certificate)]
        })
    }

    /// Compact JWS over `claims`.
    pub fn sign(&self, claims: &Value) -> Result<String, TestError> {
        let header = json!({"alg": "ES256", "typ": "JWT", "kid": self.kid});
        let signing_input = format!(
            "{}.{}",
            URL_SAFE_NO_PAD.encode(header.to_string()),
            URL_SAFE_NO_PAD.encode(claims.to_string())
        );
        let signature = self
            .pair
            .sign(&self.rng, signing_input.as_bytes())
            .map_err(|e| TestError::Key(e.to_string()))?;
        Ok(format!(
            "{}.{}",
            signing_input,
            URL_SAFE_NO_PAD.encode(signature.as_ref())
        ))
    }
}

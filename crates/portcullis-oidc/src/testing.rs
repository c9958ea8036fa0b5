//! Test doubles shared by unit tests.

use async_trait::async_trait;
use parking_lot::Mutex;

use crate::error::TransportError;
use crate::host::{HttpResponse, HttpTransport};

/// One recorded transport call: method, url, headers, body.
pub type RecordedCall = (String, String, Vec<(String, String)>, Vec<u8>);

/// Canned-response transport that records each call.
#[derive(Default)]
pub struct ScriptedTransport {
    pub responses: Mutex<Vec<Result<HttpResponse, TransportError>>>,
    pub calls: Mutex<Vec<RecordedCall>>,
}

impl ScriptedTransport {
    pub fn new(responses: Vec<Result<HttpResponse, TransportError>>) -> Self {
        Self {
            responses: Mutex::new(responses),
            calls: Mutex::new(Vec::new()),
        }
    }

    pub fn call_count(&self) -> usize {
        self.calls.lock().len()
    }

    fn next(
        &self,
        method: &str,
        url: &str,
        headers: &[(&str, &str)],
        body: Vec<u8>,
    ) -> Result<HttpResponse, TransportError> {
        self.calls.lock().push((
            method.to_string(),
            url.to_string(),
            headers
                .iter()
                .map(|(k, v)| (k.to_string(), v.to_string()))
                .collect(),
            body,
        ));
        let mut responses = self.responses.lock();
        if responses.is_empty() {
            return Err(TransportError::Connect("no scripted response".into()));
        }
        responses.remove(0)
    }
}

#[async_trait]
impl HttpTransport for ScriptedTransport {
    async fn get(
        &self,
        url: &str,
        headers: &[(&str, &str)],
    ) -> Result<HttpResponse, TransportError> {
        self.next("GET", url, headers, Vec::new())
    }

    async fn post(
        &self,
        url: &str,
        headers: &[(&str, &str)],
        body: Vec<u8>,
    ) -> Result<HttpResponse, TransportError> {
        self.next("POST", url, headers, body)
    }
}

/// ES256 key pair that mints compact JWTs.
pub struct TestSigner {
    pair: ring::signature::EcdsaKeyPair,
    rng: ring::rand::SystemRandom,
    pub kid: String,
}

impl TestSigner {
    pub fn es256(kid: &str) -> Self {
        use ring::signature::{EcdsaKeyPair, ECDSA_P256_SHA256_FIXED_SIGNING};

        let rng = ring::rand::SystemRandom::new();
        let pkcs8 = EcdsaKeyPair::generate_pkcs8(&ECDSA_P256_SHA256_FIXED_SIGNING, &rng)
            .expect("generate P-256 key");
        let pair = EcdsaKeyPair::from_pkcs8(&ECDSA_P256_SHA256_FIXED_SIGNING, pkcs8.as_ref(), &rng)
            .expect("load P-256 key");
        Self {
            pair,
            rng,
            kid: kid.to_string(),
        }
    }

    pub fn jwk(&self) -> serde_json::Value {
        use base64::{engine::general_purpose::URL_SAFE_NO_PAD, Engine};
        use ring::signature::KeyPair;

        let point = self.pair.public_key().as_ref();
        serde_json::json!({
            "kty": "EC",
            "crv": "P-256",
            "use": "sig",
            "alg": "ES256",
            "kid": self.kid,
            "x": URL_SAFE_NO_PAD.encode(&point[1..33]),
            "y": URL_SAFE_NO_PAD.encode(&point[33..65]),
        })
    }

    pub fn key_set(&self) -> crate::jwks::JwkSet {
        let body = serde_json::json!({ "keys": [self.jwk()] }).to_string();
        crate::jwks::JwkSet::parse("test", body.as_bytes()).expect("parse test key set")
    }

    pub fn sign(&self, claims: &serde_json::Value) -> String {
        let header = serde_json::json!({"alg": "ES256", "typ": "JWT", "kid": self.kid});
        self.sign_with_header(&header, claims)
    }

    pub fn sign_with_header(
        &self,
        header: &serde_json::Value,
        claims: &serde_json::Value,
    ) -> String {
        use base64::{engine::general_purpose::URL_SAFE_NO_PAD, Engine};

        let signing_input = format!(
            "{}.{}",
            URL_SAFE_NO_PAD.encode(header.to_string()),
            URL_SAFE_NO_PAD.encode(claims.to_string())
        );
        let sig = self
            .pair
            .sign(&self.rng, signing_input.as_bytes())
            .expect("sign");
        format!("{}.{}", signing_input, URL_SAFE_NO_PAD.encode(sig.as_ref()))
    }
}

/// `rand_core` view of ring's system randomness, for the `rsa` crate.
pub struct RingRng(pub ring::rand::SystemRandom);

impl rsa::rand_core::RngCore for RingRng {
    fn next_u32(&mut self) -> u32 {
        rsa::rand_core::impls::next_u32_via_fill(self)
    }

    fn next_u64(&mut self) -> u64 {
        rsa::rand_core::impls::next_u64_via_fill(self)
    }

    fn fill_bytes(&mut self, dest: &mut [u8]) {
        ring::rand::SecureRandom::fill(&self.0, dest).expect("system randomness");
    }

    fn try_fill_bytes(&mut self, dest: &mut [u8]) -> Result<(), rsa::rand_core::Error> {
        self.fill_bytes(dest);
        Ok(())
    }
}

impl rsa::rand_core::CryptoRng for RingRng {}

/// 2048-bit RSA key shared by every test; generation is slow.
fn shared_rsa_key() -> &'static rsa::RsaPrivateKey {
    static KEY: std::sync::OnceLock<rsa::RsaPrivateKey> = std::sync::OnceLock::new();
    KEY.get_or_init(|| {
        let mut rng = RingRng(ring::rand::SystemRandom::new());
        rsa::RsaPrivateKey::new(&mut rng, 2048).expect("generate RSA key")
    })
}

/// RSA key that signs with either PKCS#1 v1.5 or PSS padding.
pub struct TestRsaSigner {
    key: &'static rsa::RsaPrivateKey,
    pub kid: String,
}

impl TestRsaSigner {
    pub fn new(kid: &str) -> Self {
        Self {
            key: shared_rsa_key(),
            kid: kid.to_string(),
        }
    }

    pub fn jwk(&self) -> serde_json::Value {
        use base64::{engine::general_purpose::URL_SAFE_NO_PAD, Engine};
        use rsa::traits::PublicKeyParts;

        serde_json::json!({
            "kty": "RSA",
            "use": "sig",
            "kid": self.kid,
            "n": URL_SAFE_NO_PAD.encode(self.key.n().to_bytes_be()),
            "e": URL_SAFE_NO_PAD.encode(self.key.e().to_bytes_be()),
        })
    }

    pub fn key_material(&self) -> crate::jwk::KeyMaterial {
        crate::jwk::JsonWebKey::from_value(&self.jwk())
            .expect("parse RSA key")
            .key
    }

    pub fn key_set(&self) -> crate::jwks::JwkSet {
        let body = serde_json::json!({ "keys": [self.jwk()] }).to_string();
        crate::jwks::JwkSet::parse("test", body.as_bytes()).expect("parse test key set")
    }

    /// Raw signature over `message`.
    pub fn sign_bytes(&self, alg: crate::algorithm::SigningAlgorithm, message: &[u8]) -> Vec<u8> {
        use crate::algorithm::SigningAlgorithm;
        use rsa::{Pkcs1v15Sign, Pss};
        use sha2::{Digest, Sha256, Sha384, Sha512};

        let mut rng = RingRng(ring::rand::SystemRandom::new());
        let key = self.key;
        match alg {
            SigningAlgorithm::RS256 => {
                key.sign(Pkcs1v15Sign::new::<Sha256>(), &Sha256::digest(message))
            }
            SigningAlgorithm::RS384 => {
                key.sign(Pkcs1v15Sign::new::<Sha384>(), &Sha384::digest(message))
            }
            SigningAlgorithm::RS512 => {
                key.sign(Pkcs1v15Sign::new::<Sha512>(), &Sha512::digest(message))
            }
            SigningAlgorithm::PS256 => {
                key.sign_with_rng(&mut rng, Pss::new::<Sha256>(), &Sha256::digest(message))
            }
            SigningAlgorithm::PS384 => {
                key.sign_with_rng(&mut rng, Pss::new::<Sha384>(), &Sha384::digest(message))
            }
            SigningAlgorithm::PS512 => {
                key.sign_with_rng(&mut rng, Pss::new::<Sha512>(), &Sha512::digest(message))
            }
            other => panic!("{} is not an RSA algorithm", other),
        }
        .expect("RSA sign")
    }

    /// Compact JWT signed with `alg`.
    pub fn sign(
        &self,
        alg: crate::algorithm::SigningAlgorithm,
        claims: &serde_json::Value,
    ) -> String {
        use base64::{engine::general_purpose::URL_SAFE_NO_PAD, Engine};

        let header = serde_json::json!({"alg": alg.as_str(), "typ": "JWT", "kid": self.kid});
        let signing_input = format!(
            "{}.{}",
            URL_SAFE_NO_PAD.encode(header.to_string()),
            URL_SAFE_NO_PAD.encode(claims.to_string())
        );
        let sig = self.sign_bytes(alg, signing_input.as_bytes());
        format!("{}.{}", signing_input, URL_SAFE_NO_PAD.encode(sig))
    }
}

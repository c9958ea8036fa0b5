//! JSON Web Key parsing into typed key material.
//!
//! Every key published by the IdP passes through [`JsonWebKey::from_value`]
//! before it may verify anything. Parsing is strict: wrong field lengths,
//! off-curve points, inconsistent RSA private components and certificate
//! chains that disagree with the key are all hard failures.

use std::fmt;

use base64::{
    engine::general_purpose::{STANDARD, URL_SAFE_NO_PAD},
    Engine,
};
use p256::elliptic_curve::sec1::ToEncodedPoint;
use ring::signature::Ed25519KeyPair;
use rsa::BigUint;
use serde::Deserialize;
use sha1::Sha1;
use sha2::{Digest, Sha256};
use url::Url;
use x509_parser::public_key::PublicKey;

use crate::error::KeyError;

const ED25519_OID: &str = "1.3.101.112";
const ED25519_KEY_LEN: usize = 32;
const SHA1_LEN: usize = 20;
const SHA256_LEN: usize = 32;

// --- Public types ---

/// A parsed JSON Web Key.
#[derive(Debug, Clone)]
pub struct JsonWebKey {
    /// `kid`
    pub key_id: Option<String>,
    /// `alg`, kept as an unvalidated hint.
    pub algorithm: Option<String>,
    /// `use`: "sig", "enc", or whatever the IdP published.
    pub key_use: Option<String>,
    pub key: KeyMaterial,
    /// DER certificates from `x5c`, leaf first.
    pub certificates: Vec<Vec<u8>>,
    /// `x5u`
    pub certificates_url: Option<Url>,
    /// `x5t`, raw digest bytes.
    pub thumbprint_sha1: Option<Vec<u8>>,
    /// `x5t#S256`, raw digest bytes.
    pub thumbprint_sha256: Option<Vec<u8>>,
}

/// Key material, one variant per key family.
#[derive(Debug, Clone)]
pub enum KeyMaterial {
    RsaPublic(RsaPublicKey),
    RsaPrivate(RsaPrivateKey),
    EcPublic(EcPublicKey),
    EcPrivate(EcPrivateKey),
    Ed25519(Ed25519Key),
    Octet(SecretBytes),
}

/// Named curve of an EC key.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum EcCurve {
    P256,
    P384,
    P521,
}

/// RSA public key as big-endian magnitudes with leading zeros stripped.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RsaPublicKey {
    n: Vec<u8>,
    e: Vec<u8>,
}

/// RSA private key that passed the consistency check.
#[derive(Debug, Clone)]
pub struct RsaPrivateKey {
    public: RsaPublicKey,
}

/// EC public key as an uncompressed SEC1 point.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EcPublicKey {
    curve: EcCurve,
    point: Vec<u8>,
}

/// EC private key whose scalar was checked against the public point.
#[derive(Debug, Clone)]
pub struct EcPrivateKey {
    public: EcPublicKey,
}

#[derive(Debug, Clone)]
pub struct Ed25519Key {
    public: [u8; ED25519_KEY_LEN],
    seed: Option<SecretBytes>,
}

/// Private bytes that never show up in `Debug` output.
#[derive(Clone, PartialEq, Eq)]
pub struct SecretBytes(Vec<u8>);

// --- Raw JSON shape ---

#[derive(Debug, Default, Deserialize)]
struct RawJwk {
    #[serde(default)]
    kty: String,
    #[serde(default)]
    kid: Option<String>,
    #[serde(default)]
    alg: Option<String>,
    #[serde(default, rename = "use")]
    use_: Option<String>,
    #[serde(default)]
    crv: Option<String>,
    #[serde(default)]
    x: Option<String>,
    #[serde(default)]
    y: Option<String>,
    #[serde(default)]
    d: Option<String>,
    #[serde(default)]
    n: Option<String>,
    #[serde(default)]
    e: Option<String>,
    #[serde(default)]
    p: Option<String>,
    #[serde(default)]
    q: Option<String>,
    #[serde(default)]
    dp: Option<String>,
    #[serde(default)]
    dq: Option<String>,
    #[serde(default)]
    qi: Option<String>,
    #[serde(default)]
    k: Option<String>,
    #[serde(default)]
    x5c: Option<Vec<String>>,
    #[serde(default)]
    x5u: Option<String>,
    #[serde(default)]
    x5t: Option<String>,
    #[serde(default, rename = "x5t#S256")]
    x5t_s256: Option<String>,
}

// --- Parsing ---

impl JsonWebKey {
    /// Parse a single JWK from its JSON text.
    pub fn parse(input: &[u8]) -> Result<Self, KeyError> {
        let raw: RawJwk = serde_json::from_slice(input)
            .map_err(|e| KeyError::MalformedKey(format!("invalid JWK JSON: {}", e)))?;
        Self::from_raw(raw)
    }

    /// Parse a single JWK from an already-decoded JSON value.
    pub fn from_value(value: &serde_json::Value) -> Result<Self, KeyError> {
        let raw = RawJwk::deserialize(value)
            .map_err(|e| KeyError::MalformedKey(format!("invalid JWK JSON: {}", e)))?;
        Self::from_raw(raw)
    }

    /// Keys published for encryption never verify signatures.
    pub fn is_signing_key(&self) -> bool {
        self.key_use.as_deref() != Some("enc")
    }

    fn from_raw(raw: RawJwk) -> Result<Self, KeyError> {
        let key = match raw.kty.as_str() {
            "EC" => parse_ec(&raw)?,
            "RSA" => parse_rsa(&raw)?,
            "OKP" => parse_okp(&raw)?,
            "oct" => {
                if raw.x5c.is_some() {
                    return Err(KeyError::MalformedKey(
                        "symmetric key must not carry an x5c chain".to_string(),
                    ));
                }
                KeyMaterial::Octet(SecretBytes(required(raw.k.as_deref(), "k")?))
            }
            "" => return Err(KeyError::MalformedKey("missing kty".to_string())),
            other => return Err(KeyError::UnsupportedKeyType(other.to_string())),
        };

        let certificates = decode_certificates(raw.x5c.as_deref())?;
        let thumbprint_sha1 = decode_thumbprint(raw.x5t.as_deref(), SHA1_LEN, "x5t")?;
        let thumbprint_sha256 =
            decode_thumbprint(raw.x5t_s256.as_deref(), SHA256_LEN, "x5t#S256")?;

        if let Some(leaf) = certificates.first() {
            check_leaf_certificate(&key, leaf)?;

            if let Some(expected) = &thumbprint_sha1 {
                if Sha1::digest(leaf).as_slice() != expected.as_slice() {
                    return Err(KeyError::CertificateKeyMismatch(
                        "x5t does not match the leaf certificate".to_string(),
                    ));
                }
            }
            if let Some(expected) = &thumbprint_sha256 {
                if Sha256::digest(leaf).as_slice() != expected.as_slice() {
                    return Err(KeyError::CertificateKeyMismatch(
                        "x5t#S256 does not match the leaf certificate".to_string(),
                    ));
                }
            }
        }

        let certificates_url = raw
            .x5u
            .as_deref()
            .map(Url::parse)
            .transpose()
            .map_err(|e| KeyError::MalformedKey(format!("invalid x5u: {}", e)))?;

        Ok(Self {
            key_id: raw.kid,
            algorithm: raw.alg,
            key_use: raw.use_,
            key,
            certificates,
            certificates_url,
            thumbprint_sha1,
            thumbprint_sha256,
        })
    }
}

fn parse_ec(raw: &RawJwk) -> Result<KeyMaterial, KeyError> {
    let crv = raw
        .crv
        .as_deref()
        .ok_or_else(|| KeyError::MalformedKey("EC key missing crv".to_string()))?;
    let curve = EcCurve::from_name(crv)
        .ok_or_else(|| KeyError::UnsupportedKeyType(format!("EC curve {}", crv)))?;
    let size = curve.coordinate_len();

    let x = sized(raw.x.as_deref(), "x", size)?;
    let y = sized(raw.y.as_deref(), "y", size)?;

    // Uncompressed EC point: 0x04 || x || y
    let mut point = Vec::with_capacity(1 + 2 * size);
    point.push(0x04);
    point.extend_from_slice(&x);
    point.extend_from_slice(&y);

    if !curve.is_on_curve(&point) {
        return Err(KeyError::MalformedKey(format!(
            "EC point is not on curve {}",
            curve.name()
        )));
    }

    let public = EcPublicKey { curve, point };

    let Some(d) = raw.d.as_deref() else {
        return Ok(KeyMaterial::EcPublic(public));
    };
    let d = sized(Some(d), "d", size)?;
    if curve.derive_point(&d).as_deref() != Some(public.point.as_slice()) {
        return Err(KeyError::MalformedKey(
            "EC private scalar does not match public point".to_string(),
        ));
    }

    Ok(KeyMaterial::EcPrivate(EcPrivateKey { public }))
}

fn parse_rsa(raw: &RawJwk) -> Result<KeyMaterial, KeyError> {
    let n = required(raw.n.as_deref(), "n")?;
    let e = required(raw.e.as_deref(), "e")?;
    let public = RsaPublicKey::new(&n, &e)?;

    let Some(d) = raw.d.as_ref() else {
        return Ok(KeyMaterial::RsaPublic(public));
    };

    let d = BigUint::from_bytes_be(&decode_b64url(d, "d")?);
    let p = BigUint::from_bytes_be(&required(raw.p.as_deref(), "p")?);
    let q = BigUint::from_bytes_be(&required(raw.q.as_deref(), "q")?);

    let inner = rsa::RsaPrivateKey::from_components(
        BigUint::from_bytes_be(&public.n),
        BigUint::from_bytes_be(&public.e),
        d.clone(),
        vec![p.clone(), q.clone()],
    )
    .map_err(|e| KeyError::MalformedKey(format!("RSA private key: {}", e)))?;
    inner
        .validate()
        .map_err(|e| KeyError::MalformedKey(format!("RSA private key: {}", e)))?;

    // Precomputed CRT values are optional, but must agree when present.
    let one = BigUint::from(1u64);
    let expected = [
        ("dp", &raw.dp, &d % &(&p - &one)),
        ("dq", &raw.dq, &d % &(&q - &one)),
    ];
    for (field, supplied, derived) in expected {
        if let Some(value) = supplied {
            if BigUint::from_bytes_be(&decode_b64url(value, field)?) != derived {
                return Err(KeyError::MalformedKey(format!(
                    "RSA {} is inconsistent with d",
                    field
                )));
            }
        }
    }
    if let Some(qi) = &raw.qi {
        let qi = BigUint::from_bytes_be(&decode_b64url(qi, "qi")?);
        if (&qi * &q) % &p != one {
            return Err(KeyError::MalformedKey(
                "RSA qi is not the inverse of q mod p".to_string(),
            ));
        }
    }

    Ok(KeyMaterial::RsaPrivate(RsaPrivateKey { public }))
}

fn parse_okp(raw: &RawJwk) -> Result<KeyMaterial, KeyError> {
    match raw.crv.as_deref() {
        Some("Ed25519") => {}
        Some(other) => return Err(KeyError::UnsupportedKeyType(format!("OKP curve {}", other))),
        None => return Err(KeyError::MalformedKey("OKP key missing crv".to_string())),
    }

    let x = sized(raw.x.as_deref(), "x", ED25519_KEY_LEN)?;
    let mut public = [0u8; ED25519_KEY_LEN];
    public.copy_from_slice(&x);

    let seed = match raw.d.as_deref() {
        None => None,
        Some(d) => {
            let seed = sized(Some(d), "d", ED25519_KEY_LEN)?;
            Ed25519KeyPair::from_seed_and_public_key(&seed, &public).map_err(|_| {
                KeyError::MalformedKey("Ed25519 private key does not match x".to_string())
            })?;
            Some(SecretBytes(seed))
        }
    };

    Ok(KeyMaterial::Ed25519(Ed25519Key { public, seed }))
}

fn decode_certificates(chain: Option<&[String]>) -> Result<Vec<Vec<u8>>, KeyError> {
    let Some(chain) = chain else {
        return Ok(Vec::new());
    };
    if chain.is_empty() {
        return Err(KeyError::MalformedKey("x5c is empty".to_string()));
    }

    chain
        .iter()
        .enumerate()
        .map(|(i, entry)| {
            let der = STANDARD
                .decode(entry)
                .map_err(|e| KeyError::MalformedKey(format!("x5c[{}]: {}", i, e)))?;
            x509_parser::parse_x509_certificate(&der)
                .map_err(|e| KeyError::MalformedKey(format!("x5c[{}]: {}", i, e)))?;
            Ok(der)
        })
        .collect()
}

/// The leaf certificate must carry exactly the key the JWK describes.
fn check_leaf_certificate(key: &KeyMaterial, leaf: &[u8]) -> Result<(), KeyError> {
    let (_, cert) = x509_parser::parse_x509_certificate(leaf)
        .map_err(|e| KeyError::MalformedKey(format!("x5c[0]: {}", e)))?;
    let spki = cert.public_key();

    let matches = match key {
        KeyMaterial::RsaPublic(pk) | KeyMaterial::RsaPrivate(RsaPrivateKey { public: pk, .. }) => {
            match spki.parsed() {
                Ok(PublicKey::RSA(cert_key)) => {
                    strip_leading_zeros(cert_key.modulus) == pk.modulus()
                        && strip_leading_zeros(cert_key.exponent) == pk.exponent()
                }
                _ => false,
            }
        }
        KeyMaterial::EcPublic(pk) | KeyMaterial::EcPrivate(EcPrivateKey { public: pk, .. }) => {
            match spki.parsed() {
                Ok(PublicKey::EC(point)) => point.data() == pk.sec1(),
                _ => false,
            }
        }
        KeyMaterial::Ed25519(ed) => {
            spki.algorithm.algorithm.to_id_string() == ED25519_OID
                && spki.subject_public_key.data.as_ref() == ed.public_key()
        }
        KeyMaterial::Octet(_) => false,
    };

    if matches {
        Ok(())
    } else {
        Err(KeyError::CertificateKeyMismatch(
            "leaf certificate public key differs from JWK".to_string(),
        ))
    }
}

/// Thumbprints may be published as raw digests or as hex text.
fn decode_thumbprint(
    value: Option<&str>,
    digest_len: usize,
    field: &str,
) -> Result<Option<Vec<u8>>, KeyError> {
    let Some(value) = value else {
        return Ok(None);
    };
    let mut bytes = decode_b64url(value, field)?;
    if bytes.len() == 2 * digest_len {
        bytes = hex::decode(&bytes)
            .map_err(|e| KeyError::MalformedKey(format!("{}: {}", field, e)))?;
    }
    if bytes.len() != digest_len {
        return Err(KeyError::MalformedKey(format!(
            "{} has length {}, expected {}",
            field,
            bytes.len(),
            digest_len
        )));
    }
    Ok(Some(bytes))
}

fn decode_b64url(value: &str, field: &str) -> Result<Vec<u8>, KeyError> {
    URL_SAFE_NO_PAD
        .decode(value.trim_end_matches('='))
        .map_err(|e| KeyError::MalformedKey(format!("{}: {}", field, e)))
}

fn required(value: Option<&str>, field: &str) -> Result<Vec<u8>, KeyError> {
    let value = value.ok_or_else(|| KeyError::MalformedKey(format!("missing {}", field)))?;
    decode_b64url(value, field)
}

fn sized(value: Option<&str>, field: &str, len: usize) -> Result<Vec<u8>, KeyError> {
    let bytes = required(value, field)?;
    if bytes.len() != len {
        return Err(KeyError::MalformedKey(format!(
            "{} has length {}, expected {}",
            field,
            bytes.len(),
            len
        )));
    }
    Ok(bytes)
}

fn strip_leading_zeros(value: &[u8]) -> &[u8] {
    match value.iter().position(|&b| b != 0) {
        Some(pos) => &value[pos..],
        None => &[],
    }
}

// --- Key accessors ---

impl KeyMaterial {
    /// JWK `kty` of this key.
    pub fn key_type(&self) -> &'static str {
        match self {
            KeyMaterial::RsaPublic(_) | KeyMaterial::RsaPrivate(_) => "RSA",
            KeyMaterial::EcPublic(_) | KeyMaterial::EcPrivate(_) => "EC",
            KeyMaterial::Ed25519(_) => "OKP",
            KeyMaterial::Octet(_) => "oct",
        }
    }

    /// Curve name for EC and OKP keys.
    pub fn curve_name(&self) -> Option<&'static str> {
        match self {
            KeyMaterial::EcPublic(key) => Some(key.curve().name()),
            KeyMaterial::EcPrivate(key) => Some(key.public_key().curve().name()),
            KeyMaterial::Ed25519(_) => Some("Ed25519"),
            _ => None,
        }
    }

    /// Modulus size for RSA keys.
    pub fn rsa_bits(&self) -> Option<usize> {
        match self {
            KeyMaterial::RsaPublic(key) => Some(key.modulus_bits()),
            KeyMaterial::RsaPrivate(key) => Some(key.public_key().modulus_bits()),
            _ => None,
        }
    }

    pub fn is_private(&self) -> bool {
        match self {
            KeyMaterial::RsaPrivate(_) | KeyMaterial::EcPrivate(_) | KeyMaterial::Octet(_) => true,
            KeyMaterial::Ed25519(key) => key.seed.is_some(),
            KeyMaterial::RsaPublic(_) | KeyMaterial::EcPublic(_) => false,
        }
    }
}

impl EcCurve {
    pub fn from_name(name: &str) -> Option<Self> {
        match name {
            "P-256" => Some(Self::P256),
            "P-384" => Some(Self::P384),
            "P-521" => Some(Self::P521),
            _ => None,
        }
    }

    pub fn name(&self) -> &'static str {
        match self {
            Self::P256 => "P-256",
            Self::P384 => "P-384",
            Self::P521 => "P-521",
        }
    }

    /// Byte length of a coordinate or private scalar.
    pub fn coordinate_len(&self) -> usize {
        match self {
            Self::P256 => 32,
            Self::P384 => 48,
            Self::P521 => 66,
        }
    }

    fn is_on_curve(&self, point: &[u8]) -> bool {
        match self {
            Self::P256 => p256::PublicKey::from_sec1_bytes(point).is_ok(),
            Self::P384 => p384::PublicKey::from_sec1_bytes(point).is_ok(),
            Self::P521 => p521::PublicKey::from_sec1_bytes(point).is_ok(),
        }
    }

    /// Uncompressed public point for a private scalar.
    fn derive_point(&self, d: &[u8]) -> Option<Vec<u8>> {
        match self {
            Self::P256 => p256::SecretKey::from_slice(d)
                .ok()
                .map(|sk| sk.public_key().to_encoded_point(false).as_bytes().to_vec()),
            Self::P384 => p384::SecretKey::from_slice(d)
                .ok()
                .map(|sk| sk.public_key().to_encoded_point(false).as_bytes().to_vec()),
            Self::P521 => p521::SecretKey::from_slice(d)
                .ok()
                .map(|sk| sk.public_key().to_encoded_point(false).as_bytes().to_vec()),
        }
    }
}

impl RsaPublicKey {
    pub fn new(n: &[u8], e: &[u8]) -> Result<Self, KeyError> {
        let n = strip_leading_zeros(n);
        let e = strip_leading_zeros(e);
        if n.is_empty() {
            return Err(KeyError::MalformedKey("RSA modulus is zero".to_string()));
        }
        if e.is_empty() {
            return Err(KeyError::MalformedKey("RSA exponent is zero".to_string()));
        }
        Ok(Self {
            n: n.to_vec(),
            e: e.to_vec(),
        })
    }

    pub fn modulus(&self) -> &[u8] {
        &self.n
    }

    pub fn exponent(&self) -> &[u8] {
        &self.e
    }

    pub fn modulus_bits(&self) -> usize {
        match self.n.first() {
            Some(&top) => self.n.len() * 8 - top.leading_zeros() as usize,
            None => 0,
        }
    }

    /// DER-encoded `RSAPublicKey`: SEQUENCE { INTEGER n, INTEGER e }.
    pub(crate) fn to_der(&self) -> Vec<u8> {
        let n_int = der_integer(&self.n);
        let e_int = der_integer(&self.e);

        let mut seq_content = Vec::with_capacity(n_int.len() + e_int.len());
        seq_content.extend_from_slice(&n_int);
        seq_content.extend_from_slice(&e_int);

        let mut result = Vec::with_capacity(4 + seq_content.len());
        result.push(0x30); // SEQUENCE tag
        der_write_length(&mut result, seq_content.len());
        result.extend_from_slice(&seq_content);
        result
    }
}

/// Encode a stripped big-endian magnitude as a DER INTEGER.
fn der_integer(magnitude: &[u8]) -> Vec<u8> {
    // A set high bit would read as negative
    let needs_padding = magnitude.first().is_some_and(|b| b & 0x80 != 0);
    let content_len = magnitude.len() + usize::from(needs_padding);

    let mut result = Vec::with_capacity(4 + content_len);
    result.push(0x02); // INTEGER tag
    der_write_length(&mut result, content_len);
    if needs_padding {
        result.push(0x00);
    }
    result.extend_from_slice(magnitude);
    result
}

fn der_write_length(buf: &mut Vec<u8>, len: usize) {
    if len < 0x80 {
        buf.push(len as u8);
    } else if len < 0x100 {
        buf.extend_from_slice(&[0x81, len as u8]);
    } else if len < 0x10000 {
        buf.extend_from_slice(&[0x82, (len >> 8) as u8, len as u8]);
    } else {
        buf.extend_from_slice(&[0x83, (len >> 16) as u8, (len >> 8) as u8, len as u8]);
    }
}

impl RsaPrivateKey {
    pub fn public_key(&self) -> &RsaPublicKey {
        &self.public
    }
}

impl EcPublicKey {
    pub fn curve(&self) -> EcCurve {
        self.curve
    }

    /// Uncompressed SEC1 encoding.
    pub fn sec1(&self) -> &[u8] {
        &self.point
    }
}

impl EcPrivateKey {
    pub fn public_key(&self) -> &EcPublicKey {
        &self.public
    }
}

impl Ed25519Key {
    pub fn public_key(&self) -> &[u8] {
        &self.public
    }
}

impl fmt::Debug for SecretBytes {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "SecretBytes([REDACTED; {}])", self.0.len())
    }
}

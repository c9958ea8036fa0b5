//! JWS signature algorithms and verification.
//!
//! RSA, ECDSA P-256/P-384 and Ed25519 are verified with `ring`; ES512 goes
//! through the `p521` crate since `ring` has no P-521 support.

use std::fmt;
use std::str::FromStr;

use p521::ecdsa::signature::Verifier;
use ring::signature;

use crate::jwk::{EcCurve, EcPublicKey, Ed25519Key, KeyMaterial, RsaPublicKey};

/// Signature algorithms an ID token may be signed with.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum SigningAlgorithm {
    RS256,
    RS384,
    RS512,
    ES256,
    ES384,
    ES512,
    PS256,
    PS384,
    PS512,
    EdDSA,
}

/// Outcome of checking one signature against one key.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Verification {
    Valid,
    Invalid,
    /// The key cannot produce signatures of this algorithm.
    Incompatible,
}

impl SigningAlgorithm {
    pub const ALL: [SigningAlgorithm; 10] = [
        Self::RS256,
        Self::RS384,
        Self::RS512,
        Self::ES256,
        Self::ES384,
        Self::ES512,
        Self::PS256,
        Self::PS384,
        Self::PS512,
        Self::EdDSA,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::RS256 => "RS256",
            Self::RS384 => "RS384",
            Self::RS512 => "RS512",
            Self::ES256 => "ES256",
            Self::ES384 => "ES384",
            Self::ES512 => "ES512",
            Self::PS256 => "PS256",
            Self::PS384 => "PS384",
            Self::PS512 => "PS512",
            Self::EdDSA => "EdDSA",
        }
    }

    /// Reduce IdP-advertised algorithm names to the ones we can verify.
    ///
    /// Unknown names (`HS256`, `none`, ...) are dropped, not rejected. An
    /// empty result means "RS256 only" to the verifier.
    pub fn allow_list<S: AsRef<str>>(advertised: &[S]) -> Vec<SigningAlgorithm> {
        let mut allowed = Vec::new();
        for name in advertised {
            if let Ok(alg) = name.as_ref().parse::<SigningAlgorithm>() {
                if !allowed.contains(&alg) {
                    allowed.push(alg);
                }
            }
        }
        allowed
    }

    /// Verify `signature` over `message` with `key`.
    pub fn verify(&self, key: &KeyMaterial, message: &[u8], signature: &[u8]) -> Verification {
        match key {
            KeyMaterial::RsaPublic(public) => self.verify_rsa(public, message, signature),
            KeyMaterial::RsaPrivate(private) => {
                self.verify_rsa(private.public_key(), message, signature)
            }
            KeyMaterial::EcPublic(public) => self.verify_ec(public, message, signature),
            KeyMaterial::EcPrivate(private) => {
                self.verify_ec(private.public_key(), message, signature)
            }
            KeyMaterial::Ed25519(key) => self.verify_ed25519(key, message, signature),
            KeyMaterial::Octet(_) => Verification::Incompatible,
        }
    }

    fn verify_rsa(&self, key: &RsaPublicKey, message: &[u8], sig: &[u8]) -> Verification {
        let params: &signature::RsaParameters = match self {
            Self::RS256 => &signature::RSA_PKCS1_2048_8192_SHA256,
            Self::RS384 => &signature::RSA_PKCS1_2048_8192_SHA384,
            Self::RS512 => &signature::RSA_PKCS1_2048_8192_SHA512,
            Self::PS256 => &signature::RSA_PSS_2048_8192_SHA256,
            Self::PS384 => &signature::RSA_PSS_2048_8192_SHA384,
            Self::PS512 => &signature::RSA_PSS_2048_8192_SHA512,
            _ => return Verification::Incompatible,
        };

        let der = key.to_der();
        signature::UnparsedPublicKey::new(params, &der)
            .verify(message, sig)
            .into()
    }

    fn verify_ec(&self, key: &EcPublicKey, message: &[u8], sig: &[u8]) -> Verification {
        let alg: &signature::EcdsaVerificationAlgorithm = match (self, key.curve()) {
            (Self::ES256, EcCurve::P256) => &signature::ECDSA_P256_SHA256_FIXED,
            (Self::ES384, EcCurve::P384) => &signature::ECDSA_P384_SHA384_FIXED,
            (Self::ES512, EcCurve::P521) => return verify_p521(key.sec1(), message, sig),
            _ => return Verification::Incompatible,
        };

        signature::UnparsedPublicKey::new(alg, key.sec1())
            .verify(message, sig)
            .into()
    }

    fn verify_ed25519(&self, key: &Ed25519Key, message: &[u8], sig: &[u8]) -> Verification {
        if *self != Self::EdDSA {
            return Verification::Incompatible;
        }
        signature::UnparsedPublicKey::new(&signature::ED25519, key.public_key())
            .verify(message, sig)
            .into()
    }
}

fn verify_p521(point: &[u8], message: &[u8], sig: &[u8]) -> Verification {
    let Ok(key) = p521::ecdsa::VerifyingKey::from_sec1_bytes(point) else {
        return Verification::Invalid;
    };
    let Ok(sig) = p521::ecdsa::Signature::from_slice(sig) else {
        return Verification::Invalid;
    };
    match key.verify(message, &sig) {
        Ok(()) => Verification::Valid,
        Err(_) => Verification::Invalid,
    }
}

impl From<Result<(), ring::error::Unspecified>> for Verification {
    fn from(result: Result<(), ring::error::Unspecified>) -> Self {
        match result {
            Ok(()) => Verification::Valid,
            Err(_) => Verification::Invalid,
        }
    }
}

impl FromStr for SigningAlgorithm {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::ALL
            .into_iter()
            .find(|alg| alg.as_str() == s)
            .ok_or_else(|| format!("unsupported algorithm: {}", s))
    }
}

impl fmt::Display for SigningAlgorithm {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

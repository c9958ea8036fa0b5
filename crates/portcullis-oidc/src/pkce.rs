//! PKCE (RFC 7636) S256 helpers.

use base64::{engine::general_purpose::URL_SAFE_NO_PAD, Engine};
use ring::rand::{SecureRandom, SystemRandom};
use sha2::{Digest, Sha256};

use crate::error::StateError;

/// 43-character verifier from 32 random bytes.
pub fn generate_code_verifier(rng: &SystemRandom) -> Result<String, StateError> {
    let mut bytes = [0u8; 32];
    rng.fill(&mut bytes).map_err(|_| StateError::Randomness)?;
    Ok(URL_SAFE_NO_PAD.encode(bytes))
}

pub fn code_challenge_s256(verifier: &str) -> String {
    URL_SAFE_NO_PAD.encode(Sha256::digest(verifier.as_bytes()))
}

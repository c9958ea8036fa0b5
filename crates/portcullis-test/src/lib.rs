//! Test harnesses for the Portcullis OIDC relying party.
//!
//! Provides `FakeIdp`, a wiremock-backed OpenID provider that publishes an
//! ES256 key set and signs ID tokens, for end-to-end flow and CLI tests.

pub mod idp;
pub mod signer;

pub use idp::{FakeIdp, TokenAuth, CLIENT_ID, CLIENT_SECRET, REDIRECT_URL};
pub use signer::Signer;

use thiserror::Error;

/// Errors from harness setup.
#[derive(Debug, Error)]
pub enum TestError {
    #[error("certificate generation failed: {0}")]
    Certificate(#[from] rcgen::Error),

    #[error("signing key error: {0}")]
    Key(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

/// Current Unix time in seconds.
pub fn unix_now() -> u64 {
    use portcullis_oidc::Clock;
    portcullis_oidc::SystemClock.now()
}

/// `name=value` part of the first `Set-Cookie` for `name`.
pub fn set_cookie_pair(response: &portcullis_oidc::Response, name: &str) -> Option<String> {
    let prefix = format!("{}=", name);
    response
        .headers_named("set-cookie")
        .find(|c| c.starts_with(&prefix))
        .and_then(|c| c.split(';').next())
        .map(str::to_string)
}

/// Decoded query parameter of a redirect's `Location`.
pub fn location_param(response: &portcullis_oidc::Response, name: &str) -> Option<String> {
    let location = url::Url::parse(response.header("location")?).ok()?;
    location
        .query_pairs()
        .find(|(k, _)| k == name)
        .map(|(_, v)| v.into_owned())
}

//! Error types for the OIDC relying-party core.

use thiserror::Error;

/// Errors raised while turning a JSON Web Key into usable key material.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum KeyError {
    /// The `kty` (or OKP `crv`) is not one we can represent.
    #[error("unsupported key type: {0}")]
    UnsupportedKeyType(String),

    /// A required field is missing, undecodable, or has the wrong length.
    #[error("malformed key: {0}")]
    MalformedKey(String),

    /// The `x5c` leaf or an `x5t` thumbprint disagrees with the key itself.
    #[error("certificate does not match key: {0}")]
    CertificateKeyMismatch(String),
}

/// Reasons an ID token fails verification.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum VerifyError {
    #[error("malformed token: {0}")]
    MalformedToken(String),

    #[error("unsupported signature algorithm: {0}")]
    UnsupportedSignatureAlgorithm(String),

    #[error("no signing key with kid '{0}'")]
    UnknownSigningKey(String),

    #[error("signature verification failed")]
    SignatureMismatch,

    #[error("issuer mismatch: expected '{expected}', found '{found}'")]
    IssuerMismatch { expected: String, found: String },

    #[error("audience does not include the client id")]
    AudienceMismatch,

    #[error("token expired at {expiry}")]
    TokenExpired { expiry: u64 },

    #[error("token not valid before {not_before}")]
    TokenNotYetValid { not_before: u64 },

    #[error("nonce mismatch: {0}")]
    NonceMismatch(String),
}

/// Reasons a signed state or nonce value is rejected.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum StateError {
    #[error("malformed state value")]
    Malformed,

    #[error("state signature mismatch")]
    SignatureMismatch,

    #[error("state expired at {expiry}")]
    Expired { expiry: u64 },

    #[error("random source failure")]
    Randomness,
}

/// Cookie sealing and opening errors.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum CookieError {
    #[error("cookie value is not valid base64url")]
    Encoding,

    #[error("cookie value too short: {0} bytes")]
    TooShort(usize),

    #[error("cookie failed authentication")]
    Decryption,

    #[error("cookie encryption failed")]
    Encryption,

    #[error("cookie payload invalid: {0}")]
    Payload(String),

    #[error("invalid cookie secret: {0}")]
    InvalidSecret(String),
}

/// Failures reaching the identity provider or reading its answer.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum TransportError {
    #[error("request timeout")]
    Timeout,

    #[error("connection failed: {0}")]
    Connect(String),

    #[error("request failed: {0}")]
    Request(String),

    #[error("invalid URL: {0}")]
    InvalidUrl(String),

    #[error("failed to build HTTP client: {0}")]
    Build(String),

    #[error("{url} returned status {status}{detail}")]
    UnexpectedStatus {
        url: String,
        status: u16,
        detail: String,
    },

    #[error("{url} returned unsupported content type '{content_type}'")]
    UnexpectedContentType { url: String, content_type: String },

    #[error("invalid response body from {url}: {reason}")]
    InvalidBody { url: String, reason: String },
}

/// Configuration errors.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ConfigError {
    #[error("missing required field '{0}'")]
    Missing(&'static str),

    #[error("invalid '{field}': {reason}")]
    Invalid { field: &'static str, reason: String },

    #[error("failed to parse configuration: {0}")]
    Parse(String),
}

/// Top-level error surfaced by the flow controller and its components.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum OidcError {
    /// IdP unreachable, non-200, or not JSON.
    #[error("identity provider transport failure: {0}")]
    Transport(#[from] TransportError),

    /// An IdP document lacks a field the protocol requires.
    #[error("{document} is missing required field '{field}'")]
    ProtocolContract {
        document: &'static str,
        field: &'static str,
    },

    /// The ID token did not verify.
    #[error("ID token rejected: {0}")]
    Verification(#[from] VerifyError),

    /// A key in the JWKS could not be parsed.
    #[error("invalid signing key: {0}")]
    KeyMaterial(#[from] KeyError),

    /// The `state` parameter did not verify.
    #[error("state rejected: {0}")]
    State(#[from] StateError),

    /// The IdP redirected back with an `error` parameter.
    #[error("authorization denied by identity provider: {0}")]
    Denied(String),

    /// The callback lacked a required parameter or flow context.
    #[error("invalid callback: {0}")]
    InvalidCallback(String),

    #[error("session cookie rejected: {0}")]
    Cookie(#[from] CookieError),

    #[error("configuration error: {0}")]
    Config(#[from] ConfigError),
}

impl OidcError {
    /// Stable machine-readable code for logs and problem bodies.
    pub fn as_str(&self) -> &'static str {
        if self.is_internal_fault() {
            return "server_error";
        }
        match self {
            OidcError::Transport(_) => "idp_unavailable",
            OidcError::ProtocolContract { .. } => "idp_contract_violation",
            OidcError::Verification(_) => "invalid_token",
            OidcError::KeyMaterial(_) => "invalid_signing_key",
            OidcError::State(_) => "state_mismatch",
            OidcError::Denied(_) => "access_denied",
            OidcError::InvalidCallback(_) => "invalid_callback",
            OidcError::Cookie(_) => "invalid_session",
            OidcError::Config(_) => "server_error",
        }
    }

    /// HTTP status surfaced to the caller.
    pub fn status_code(&self) -> u16 {
        if self.is_internal_fault() {
            return 500;
        }
        match self {
            OidcError::Verification(_) | OidcError::KeyMaterial(_) | OidcError::Cookie(_) => 401,
            OidcError::State(_) | OidcError::Denied(_) | OidcError::InvalidCallback(_) => 403,
            OidcError::Transport(_) | OidcError::ProtocolContract { .. } | OidcError::Config(_) => {
                500
            }
        }
    }

    /// Local failures (randomness, encryption, configuration) that say
    /// nothing about the caller or the IdP.
    pub fn is_internal_fault(&self) -> bool {
        matches!(
            self,
            OidcError::Config(_)
                | OidcError::State(StateError::Randomness)
                | OidcError::Cookie(CookieError::Encryption)
        )
    }

    /// Signature and JWKS misses, which may be cured by the IdP having
    /// rotated its keys since we last looked.
    pub fn is_key_rotation_candidate(&self) -> bool {
        matches!(
            self,
            OidcError::KeyMaterial(_)
                | OidcError::Verification(VerifyError::SignatureMismatch)
                | OidcError::Verification(VerifyError::UnknownSigningKey(_))
        )
    }
}

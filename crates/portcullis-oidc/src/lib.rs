//! OpenID Connect relying-party core.
//!
//! Sits in front of an upstream service and lets a request through only
//! when it carries a verified ID token from the configured identity
//! provider. Browsers without a session are sent through the
//! authorization-code flow; the callback route exchanges the code,
//! verifies the token and seals it into an encrypted cookie.
//!
//! The host supplies three seams: [`HttpTransport`] for outbound calls,
//! [`SharedStore`] for state shared between instances, and [`Clock`].
//!
//! ```ignore
//! use std::sync::Arc;
//! use portcullis_oidc::{InMemoryStore, OidcConfig, OidcFlow, ReqwestTransport, Request};
//!
//! let config = OidcConfig::from_yaml(&std::fs::read_to_string("oidc.yaml")?)?;
//! let transport = Arc::new(ReqwestTransport::with_timeout_millis(config.timeout_millis)?);
//! let flow = OidcFlow::new(config, transport, Arc::new(InMemoryStore::new()))?;
//! let outcome = flow.handle(Request::get("/app")).await;
//! ```

pub mod algorithm;
pub mod config;
pub mod cookie;
pub mod discovery;
pub mod error;
pub mod flow;
pub mod gateway;
pub mod host;
pub mod http_client;
pub mod jwk;
pub mod jwks;
pub mod pkce;
pub mod state;
pub mod token;
pub mod verifier;

#[cfg(test)]
mod testing;

pub use algorithm::{SigningAlgorithm, Verification};
pub use config::{CookieConfig, OidcConfig, SameSite};
pub use cookie::{CookieSessionData, SecureCookieCodec, MAX_COOKIE_BYTES};
pub use discovery::{DiscoveryClient, ProviderEndpoints};
pub use error::{
    ConfigError, CookieError, KeyError, OidcError, StateError, TransportError, VerifyError,
};
pub use flow::{FlowCookie, FlowOutcome, FlowState, OidcFlow, SUBJECT_HEADER};
pub use gateway::{Action, Request, Response};
pub use host::{
    CasMismatch, Clock, HttpResponse, HttpTransport, InMemoryStore, ManualClock, SharedStore,
    SystemClock,
};
pub use http_client::{ReqwestTransport, TransportConfig};
pub use jwk::{JsonWebKey, KeyMaterial};
pub use jwks::{JwkSet, JwksFetcher};
pub use state::{SignedStateCodec, StateToken, STATE_TTL_SECONDS};
pub use token::{
    AuthStyle, AuthStyleCache, ClientCredentials, CodeExchange, TokenBundle, TokenExchanger,
};
pub use verifier::{IdTokenClaims, IdTokenVerifier, NonceBinding};

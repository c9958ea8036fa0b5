//! OpenID provider discovery.

use std::sync::Arc;

use parking_lot::RwLock;
use serde::Deserialize;

use crate::algorithm::SigningAlgorithm;
use crate::error::{OidcError, TransportError};
use crate::host::HttpTransport;

const DOCUMENT: &str = "openid-configuration";

/// Endpoints advertised by `.well-known/openid-configuration`.
///
/// Fields are optional at parse time; each operation asks for the ones it
/// needs and gets a contract error naming the missing field.
#[derive(Debug, Clone, Default, PartialEq, Eq, Deserialize)]
pub struct ProviderEndpoints {
    #[serde(default)]
    pub issuer: Option<String>,
    #[serde(default)]
    pub authorization_endpoint: Option<String>,
    #[serde(default)]
    pub token_endpoint: Option<String>,
    #[serde(default)]
    pub jwks_uri: Option<String>,
    #[serde(default)]
    pub userinfo_endpoint: Option<String>,
    #[serde(default)]
    pub id_token_signing_alg_values_supported: Vec<String>,
    #[serde(default)]
    pub code_challenge_methods_supported: Vec<String>,
}

impl ProviderEndpoints {
    pub fn parse(url: &str, body: &[u8]) -> Result<Self, TransportError> {
        serde_json::from_slice(body).map_err(|e| TransportError::InvalidBody {
            url: url.to_string(),
            reason: e.to_string(),
        })
    }

    pub fn authorization_url(&self) -> Result<&str, OidcError> {
        required(&self.authorization_endpoint, "authorization_endpoint")
    }

    pub fn token_url(&self) -> Result<&str, OidcError> {
        required(&self.token_endpoint, "token_endpoint")
    }

    pub fn jwks_url(&self) -> Result<&str, OidcError> {
        required(&self.jwks_uri, "jwks_uri")
    }

    /// Advertised algorithms reduced to the verifiable allow-list.
    pub fn signing_algorithms(&self) -> Vec<SigningAlgorithm> {
        SigningAlgorithm::allow_list(&self.id_token_signing_alg_values_supported)
    }

    pub fn supports_pkce_s256(&self) -> bool {
        self.code_challenge_methods_supported
            .iter()
            .any(|m| m == "S256")
    }
}

fn required<'a>(value: &'a Option<String>, field: &'static str) -> Result<&'a str, OidcError> {
    match value.as_deref() {
        Some(v) if !v.is_empty() => Ok(v),
        _ => Err(OidcError::ProtocolContract {
            document: DOCUMENT,
            field,
        }),
    }
}

/// Fetches the discovery document once and serves it from memory after.
pub struct DiscoveryClient {
    transport: Arc<dyn HttpTransport>,
    url: String,
    cached: RwLock<Option<Arc<ProviderEndpoints>>>,
}

impl DiscoveryClient {
    pub fn new(transport: Arc<dyn HttpTransport>, url: impl Into<String>) -> Self {
        Self {
            transport,
            url: url.into(),
            cached: RwLock::new(None),
        }
    }

    pub fn url(&self) -> &str {
        &self.url
    }

    /// Cached endpoints, fetching on first use.
    pub async fn endpoints(&self) -> Result<Arc<ProviderEndpoints>, OidcError> {
        if let Some(endpoints) = self.cached() {
            return Ok(endpoints);
        }
        self.refresh().await
    }

    /// Fetch unconditionally and replace the cached copy.
    pub async fn refresh(&self) -> Result<Arc<ProviderEndpoints>, OidcError> {
        let response = self
            .transport
            .get(&self.url, &[("accept", "application/json")])
            .await?;
        response.ensure_json(&self.url)?;

        let endpoints = Arc::new(ProviderEndpoints::parse(&self.url, &response.body)?);
        *self.cached.write() = Some(endpoints.clone());
        tracing::debug!(url = %self.url, "discovery document cached");
        Ok(endpoints)
    }

    pub fn cached(&self) -> Option<Arc<ProviderEndpoints>> {
        self.cached.read().clone()
    }

    pub fn invalidate(&self) {
        *self.cached.write() = None;
    }
}

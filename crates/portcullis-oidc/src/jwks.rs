//! JWKS retrieval.

use std::sync::Arc;

use serde::Deserialize;

use crate::error::{OidcError, TransportError};
use crate::host::HttpTransport;
use crate::jwk::JsonWebKey;

/// Ordered set of parsed keys.
#[derive(Debug, Clone, Default)]
pub struct JwkSet {
    keys: Vec<JsonWebKey>,
}

#[derive(Deserialize)]
struct RawJwkSet {
    keys: Option<Vec<serde_json::Value>>,
}

impl JwkSet {
    pub fn new(keys: Vec<JsonWebKey>) -> Self {
        Self { keys }
    }

    /// Parse a `{"keys": [...]}` document. One bad key fails the whole set.
    pub fn parse(url: &str, body: &[u8]) -> Result<Self, OidcError> {
        let raw: RawJwkSet =
            serde_json::from_slice(body).map_err(|e| TransportError::InvalidBody {
                url: url.to_string(),
                reason: e.to_string(),
            })?;
        let Some(values) = raw.keys else {
            return Err(OidcError::ProtocolContract {
                document: "jwks",
                field: "keys",
            });
        };

        let keys = values
            .iter()
            .map(JsonWebKey::from_value)
            .collect::<Result<Vec<_>, _>>()?;
        Ok(Self { keys })
    }

    pub fn keys(&self) -> &[JsonWebKey] {
        &self.keys
    }

    pub fn with_kid<'a>(&'a self, kid: &'a str) -> impl Iterator<Item = &'a JsonWebKey> + 'a {
        self.keys
            .iter()
            .filter(move |k| k.key_id.as_deref() == Some(kid))
    }

    pub fn len(&self) -> usize {
        self.keys.len()
    }

    pub fn is_empty(&self) -> bool {
        self.keys.is_empty()
    }
}

pub struct JwksFetcher {
    transport: Arc<dyn HttpTransport>,
}

impl JwksFetcher {
    pub fn new(transport: Arc<dyn HttpTransport>) -> Self {
        Self { transport }
    }

    /// Single GET, no retry.
    pub async fn fetch(&self, url: &str) -> Result<JwkSet, OidcError> {
        let response = self
            .transport
            .get(url, &[("accept", "application/json")])
            .await?;
        response.ensure_json(url)?;
        let set = JwkSet::parse(url, &response.body)?;
        tracing::debug!(url, keys = set.len(), "key set fetched");
        Ok(set)
    }
}

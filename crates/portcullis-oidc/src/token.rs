//! Authorization-code exchange at the token endpoint.
//!
//! Providers disagree on how client credentials travel: some want HTTP
//! Basic, some want them in the form body. When an endpoint's preference is
//! unknown the first exchange probes it, retries once with the other style
//! on failure, and records the style that worked in the shared store.

use std::sync::Arc;

use base64::{engine::general_purpose::STANDARD, Engine};
use portcullis_telemetry::log_auth_style_learned;
use serde::Deserialize;
use url::form_urlencoded;

use crate::error::{OidcError, TransportError};
use crate::host::{HttpResponse, HttpTransport, InMemoryStore, SharedStore};

const STORE_PREFIX: &str = "oidc:auth-style:";

/// How client credentials are sent to the token endpoint.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AuthStyle {
    /// `Authorization: Basic ...`
    InHeader,
    /// `client_id` and `client_secret` form fields.
    InParams,
}

impl AuthStyle {
    pub fn other(self) -> Self {
        match self {
            AuthStyle::InHeader => AuthStyle::InParams,
            AuthStyle::InParams => AuthStyle::InHeader,
        }
    }

    fn as_str(self) -> &'static str {
        match self {
            AuthStyle::InHeader => "header",
            AuthStyle::InParams => "params",
        }
    }

    fn from_bytes(bytes: &[u8]) -> Option<Self> {
        match bytes {
            b"header" => Some(AuthStyle::InHeader),
            b"params" => Some(AuthStyle::InParams),
            _ => None,
        }
    }
}

/// Learned auth style per token endpoint.
#[derive(Clone)]
pub struct AuthStyleCache {
    store: Arc<dyn SharedStore>,
}

impl AuthStyleCache {
    pub fn new(store: Arc<dyn SharedStore>) -> Self {
        Self { store }
    }

    pub fn in_memory() -> Self {
        Self::new(Arc::new(InMemoryStore::new()))
    }

    pub fn lookup(&self, token_url: &str) -> Option<AuthStyle> {
        let (value, _) = self.store.get(&store_key(token_url))?;
        AuthStyle::from_bytes(&value)
    }

    /// Insert-if-absent. Another worker winning the race is fine: both
    /// learned a style the endpoint accepts.
    pub fn remember(&self, token_url: &str, style: AuthStyle) {
        let key = store_key(token_url);
        match self
            .store
            .compare_and_swap(&key, style.as_str().as_bytes().to_vec(), 0)
        {
            Ok(_) => log_auth_style_learned!(
                token_url,
                style = style.as_str(),
                "token endpoint auth style learned"
            ),
            Err(_) => tracing::debug!(token_url, "auth style already recorded"),
        }
    }
}

fn store_key(token_url: &str) -> String {
    format!("{}{}", STORE_PREFIX, token_url)
}

/// OAuth2 client credentials.
#[derive(Clone, Copy)]
pub struct ClientCredentials<'a> {
    pub client_id: &'a str,
    pub client_secret: &'a str,
}

/// The per-callback inputs of an exchange.
#[derive(Debug, Clone, Copy)]
pub struct CodeExchange<'a> {
    pub code: &'a str,
    pub redirect_url: &'a str,
    pub code_verifier: Option<&'a str>,
}

/// Tokens returned by a successful exchange.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TokenBundle {
    pub access_token: String,
    pub token_type: String,
    pub refresh_token: Option<String>,
    pub id_token: Option<String>,
    /// Absolute expiry of the access token, when the IdP said.
    pub expires_at: Option<u64>,
}

#[derive(Debug, Default, Deserialize)]
struct RawTokenResponse {
    #[serde(default)]
    access_token: String,
    #[serde(default)]
    token_type: String,
    #[serde(default)]
    refresh_token: Option<String>,
    #[serde(default)]
    id_token: Option<String>,
    #[serde(default)]
    expires_in: Option<ExpiresIn>,
}

/// Some providers send `expires_in` as a string.
#[derive(Debug, Deserialize)]
#[serde(untagged)]
enum ExpiresIn {
    Number(i64),
    Text(String),
}

impl ExpiresIn {
    fn seconds(&self) -> Option<i64> {
        match self {
            ExpiresIn::Number(n) => Some(*n),
            ExpiresIn::Text(s) => s.trim().parse().ok(),
        }
    }
}

pub struct TokenExchanger {
    transport: Arc<dyn HttpTransport>,
    cache: AuthStyleCache,
    initial_style: AuthStyle,
}

impl TokenExchanger {
    pub fn new(transport: Arc<dyn HttpTransport>, cache: AuthStyleCache) -> Self {
        Self {
            transport,
            cache,
            initial_style: AuthStyle::InHeader,
        }
    }

    /// Style tried first when an endpoint's preference is unknown.
    pub fn with_initial_style(mut self, style: AuthStyle) -> Self {
        self.initial_style = style;
        self
    }

    pub fn cache(&self) -> &AuthStyleCache {
        &self.cache
    }

    pub async fn exchange(
        &self,
        token_url: &str,
        credentials: ClientCredentials<'_>,
        exchange: CodeExchange<'_>,
        now: u64,
    ) -> Result<TokenBundle, OidcError> {
        if let Some(style) = self.cache.lookup(token_url) {
            let response = self.post(token_url, credentials, &exchange, style).await?;
            return parse_response(token_url, &response, now);
        }

        let style = self.initial_style;
        let response = self.post(token_url, credentials, &exchange, style).await?;
        let (style, bundle) = match parse_response(token_url, &response, now) {
            Ok(bundle) => (style, bundle),
            Err(OidcError::Transport(err)) => {
                tracing::debug!(
                    token_url,
                    tried = style.as_str(),
                    error = %err,
                    "token request rejected, retrying with other auth style"
                );
                let retry = style.other();
                let response = self.post(token_url, credentials, &exchange, retry).await?;
                (retry, parse_response(token_url, &response, now)?)
            }
            Err(other) => return Err(other),
        };

        self.cache.remember(token_url, style);
        Ok(bundle)
    }

    async fn post(
        &self,
        token_url: &str,
        credentials: ClientCredentials<'_>,
        exchange: &CodeExchange<'_>,
        style: AuthStyle,
    ) -> Result<HttpResponse, TransportError> {
        let mut form = form_urlencoded::Serializer::new(String::new());
        form.append_pair("grant_type", "authorization_code")
            .append_pair("code", exchange.code)
            .append_pair("redirect_uri", exchange.redirect_url);
        if let Some(verifier) = exchange.code_verifier {
            form.append_pair("code_verifier", verifier);
        }

        let authorization = match style {
            AuthStyle::InHeader => {
                let user: String =
                    form_urlencoded::byte_serialize(credentials.client_id.as_bytes()).collect();
                let pass: String =
                    form_urlencoded::byte_serialize(credentials.client_secret.as_bytes())
                        .collect();
                Some(format!(
                    "Basic {}",
                    STANDARD.encode(format!("{}:{}", user, pass))
                ))
            }
            AuthStyle::InParams => {
                form.append_pair("client_id", credentials.client_id)
                    .append_pair("client_secret", credentials.client_secret);
                None
            }
        };
        let body = form.finish().into_bytes();

        let mut headers = vec![
            ("content-type", "application/x-www-form-urlencoded"),
            ("accept", "application/json"),
        ];
        if let Some(value) = authorization.as_deref() {
            headers.push(("authorization", value));
        }

        self.transport.post(token_url, &headers, body).await
    }
}

fn parse_response(
    token_url: &str,
    response: &HttpResponse,
    now: u64,
) -> Result<TokenBundle, OidcError> {
    let media_type = response.media_type();
    let is_form = media_type == "application/x-www-form-urlencoded" || media_type == "text/plain";
    let is_json = media_type == "application/json" || media_type.ends_with("+json");

    if response.status != 200 {
        return Err(TransportError::UnexpectedStatus {
            url: token_url.to_string(),
            status: response.status,
            detail: error_detail(response, is_form),
        }
        .into());
    }
    if !is_form && !is_json {
        return Err(TransportError::UnexpectedContentType {
            url: token_url.to_string(),
            content_type: media_type,
        }
        .into());
    }

    let raw = if is_form {
        raw_from_form(&response.body)
    } else {
        serde_json::from_slice::<RawTokenResponse>(&response.body).map_err(|e| {
            TransportError::InvalidBody {
                url: token_url.to_string(),
                reason: e.to_string(),
            }
        })?
    };

    if raw.access_token.is_empty() {
        return Err(OidcError::ProtocolContract {
            document: "token response",
            field: "access_token",
        });
    }

    let expires_at = raw
        .expires_in
        .as_ref()
        .and_then(ExpiresIn::seconds)
        .filter(|secs| *secs > 0)
        .map(|secs| now + secs as u64);

    Ok(TokenBundle {
        access_token: raw.access_token,
        token_type: raw.token_type,
        refresh_token: raw.refresh_token.filter(|t| !t.is_empty()),
        id_token: raw.id_token.filter(|t| !t.is_empty()),
        expires_at,
    })
}

fn raw_from_form(body: &[u8]) -> RawTokenResponse {
    let mut raw = RawTokenResponse::default();
    for (key, value) in form_urlencoded::parse(body) {
        match key.as_ref() {
            "access_token" => raw.access_token = value.into_owned(),
            "token_type" => raw.token_type = value.into_owned(),
            "refresh_token" => raw.refresh_token = Some(value.into_owned()),
            "id_token" => raw.id_token = Some(value.into_owned()),
            "expires_in" => raw.expires_in = Some(ExpiresIn::Text(value.into_owned())),
            _ => {}
        }
    }
    raw
}

/// `: error (description)` suffix for the status error, when the body has one.
fn error_detail(response: &HttpResponse, is_form: bool) -> String {
    let (error, description) = if is_form {
        let mut error = None;
        let mut description = None;
        for (key, value) in form_urlencoded::parse(&response.body) {
            match key.as_ref() {
                "error" => error = Some(value.into_owned()),
                "error_description" => description = Some(value.into_owned()),
                _ => {}
            }
        }
        (error, description)
    } else {
        let value: serde_json::Value =
            serde_json::from_slice(&response.body).unwrap_or_default();
        (
            value.get("error").and_then(|v| v.as_str()).map(String::from),
            value
                .get("error_description")
                .and_then(|v| v.as_str())
                .map(String::from),
        )
    };

    match (error, description) {
        (Some(error), Some(description)) => format!(": {} ({})", error, description),
        (Some(error), None) => format!(": {}", error),
        _ => String::new(),
    }
}

//! Relying-party configuration.

use base64::{engine::general_purpose::STANDARD, Engine};
use serde::Deserialize;
use sha2::{Digest, Sha256};
use url::Url;

use crate::error::ConfigError;

/// OIDC relying-party configuration.
///
/// Immutable once parsed; every component receives it by reference.
#[derive(Debug, Clone, Deserialize)]
pub struct OidcConfig {
    /// Issuer URL (e.g. "https://accounts.google.com").
    #[serde(default)]
    pub issuer: String,

    /// OAuth2 client id, also the expected `aud` of ID tokens.
    #[serde(default)]
    pub client_id: String,

    /// OAuth2 client secret. Keys the state MAC.
    #[serde(default)]
    pub client_secret: String,

    /// Absolute callback URL registered with the IdP. Its path is the
    /// callback route.
    #[serde(default)]
    pub redirect_url: String,

    /// Where to land after login when no return path was captured.
    #[serde(default)]
    pub client_url: Option<String>,

    /// Scopes requested at the authorization endpoint.
    #[serde(default = "default_scopes")]
    pub scopes: Vec<String>,

    #[serde(default)]
    pub skip_issuer_check: bool,

    #[serde(default)]
    pub skip_expiry_check: bool,

    #[serde(default)]
    pub skip_nonce_check: bool,

    /// Allowance applied to `nbf` checks, in seconds.
    #[serde(default = "default_clock_skew")]
    pub clock_skew_seconds: u64,

    /// Maximum age of the cached key set used for session checks.
    #[serde(default = "default_jwks_refresh")]
    pub jwks_refresh_seconds: u64,

    /// Per-call timeout handed to the HTTP transport.
    #[serde(default = "default_timeout_millis")]
    pub timeout_millis: u64,

    /// Send an S256 PKCE challenge with the authorization request.
    #[serde(default)]
    pub pkce: bool,

    /// Route that starts a login explicitly (accepts `?rd=/path`).
    #[serde(default = "default_start_path")]
    pub start_path: String,

    /// Forward `Authorization: Bearer <id_token>` upstream.
    #[serde(default = "default_true")]
    pub pass_authorization_header: bool,

    /// Let CORS preflight requests through without a session.
    #[serde(default)]
    pub skip_auth_preflight: bool,

    #[serde(default)]
    pub cookie: CookieConfig,
}

fn default_scopes() -> Vec<String> {
    vec!["openid".to_string()]
}

fn default_clock_skew() -> u64 {
    300
}

fn default_jwks_refresh() -> u64 {
    300
}

fn default_timeout_millis() -> u64 {
    500
}

fn default_start_path() -> String {
    "/oauth2/start".to_string()
}

fn default_true() -> bool {
    true
}

/// Session cookie attributes.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct CookieConfig {
    pub name: String,
    pub domain: Option<String>,
    pub path: String,
    pub secure: bool,
    pub http_only: bool,
    pub same_site: SameSite,
    /// 32-byte encryption key: `hex:<64 hex chars>`, `base64:<...>`, or 32
    /// raw characters. Derived from the client secret when unset.
    pub secret: Option<String>,
}

impl Default for CookieConfig {
    fn default() -> Self {
        Self {
            name: "_oidc_session".to_string(),
            domain: None,
            path: "/".to_string(),
            secure: false,
            http_only: true,
            same_site: SameSite::Lax,
            secret: None,
        }
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Deserialize)]
pub enum SameSite {
    #[default]
    #[serde(alias = "lax")]
    Lax,
    #[serde(alias = "strict")]
    Strict,
    #[serde(alias = "none")]
    None,
}

impl SameSite {
    pub fn as_str(&self) -> &'static str {
        match self {
            SameSite::Lax => "Lax",
            SameSite::Strict => "Strict",
            SameSite::None => "None",
        }
    }
}

impl OidcConfig {
    /// Parse and validate a YAML document.
    pub fn from_yaml(input: &str) -> Result<Self, ConfigError> {
        let config: Self =
            serde_yaml::from_str(input).map_err(|e| ConfigError::Parse(e.to_string()))?;
        config.validate()?;
        Ok(config)
    }

    /// Parse and validate a JSON document.
    pub fn from_json(input: &str) -> Result<Self, ConfigError> {
        let config: Self =
            serde_json::from_str(input).map_err(|e| ConfigError::Parse(e.to_string()))?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.issuer.is_empty() {
            return Err(ConfigError::Missing("issuer"));
        }
        if self.client_id.is_empty() {
            return Err(ConfigError::Missing("client_id"));
        }
        if self.client_secret.is_empty() {
            return Err(ConfigError::Missing("client_secret"));
        }
        if self.redirect_url.is_empty() {
            return Err(ConfigError::Missing("redirect_url"));
        }

        Url::parse(&self.issuer).map_err(|e| ConfigError::Invalid {
            field: "issuer",
            reason: e.to_string(),
        })?;

        let callback = self.callback_path()?;
        if callback == "/" {
            return Err(ConfigError::Invalid {
                field: "redirect_url",
                reason: "callback path must not be the site root".to_string(),
            });
        }

        if !self.start_path.starts_with('/') || self.start_path == callback {
            return Err(ConfigError::Invalid {
                field: "start_path",
                reason: format!("'{}' is not a usable route", self.start_path),
            });
        }

        if !self.scopes.iter().any(|s| s == "openid") {
            return Err(ConfigError::Invalid {
                field: "scopes",
                reason: "must include 'openid'".to_string(),
            });
        }

        self.cookie_key()?;
        Ok(())
    }

    /// Path component of `redirect_url`, matched against inbound requests.
    pub fn callback_path(&self) -> Result<String, ConfigError> {
        let url = Url::parse(&self.redirect_url).map_err(|e| ConfigError::Invalid {
            field: "redirect_url",
            reason: e.to_string(),
        })?;
        match url.scheme() {
            "http" | "https" => Ok(url.path().to_string()),
            other => Err(ConfigError::Invalid {
                field: "redirect_url",
                reason: format!("unsupported scheme '{}'", other),
            }),
        }
    }

    /// Well-known discovery document URL.
    pub fn discovery_url(&self) -> String {
        format!(
            "{}/.well-known/openid-configuration",
            self.issuer.trim_end_matches('/')
        )
    }

    /// Space-joined scope parameter.
    pub fn scope_param(&self) -> String {
        self.scopes.join(" ")
    }

    /// Resolve the 32-byte cookie encryption key.
    pub fn cookie_key(&self) -> Result<[u8; 32], ConfigError> {
        let Some(secret) = self.cookie.secret.as_deref() else {
            let digest = Sha256::digest(self.client_secret.as_bytes());
            return Ok(digest.into());
        };

        let bytes = if let Some(hex_value) = secret.strip_prefix("hex:") {
            hex::decode(hex_value).map_err(|e| ConfigError::Invalid {
                field: "cookie.secret",
                reason: e.to_string(),
            })?
        } else if let Some(b64) = secret.strip_prefix("base64:") {
            STANDARD.decode(b64).map_err(|e| ConfigError::Invalid {
                field: "cookie.secret",
                reason: e.to_string(),
            })?
        } else {
            secret.as_bytes().to_vec()
        };

        bytes.try_into().map_err(|b: Vec<u8>| ConfigError::Invalid {
            field: "cookie.secret",
            reason: format!("expected 32 bytes, got {}", b.len()),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const MINIMAL: &str = r#"
issuer: https://idp.example
client_id: portcullis
client_secret: s3cret
redirect_url: https://app.example/oauth2/callback
"#;

    #[test]
    fn defaults_applied() {
        let config = OidcConfig::from_yaml(MINIMAL).unwrap();
        assert_eq!(config.scopes, vec!["openid"]);
        assert_eq!(config.clock_skew_seconds, 300);
        assert_eq!(config.jwks_refresh_seconds, 300);
        assert_eq!(config.timeout_millis, 500);
        assert_eq!(config.start_path, "/oauth2/start");
        assert!(config.pass_authorization_header);
        assert!(!config.pkce);
        assert_eq!(config.cookie.name, "_oidc_session");
        assert_eq!(config.cookie.path, "/");
        assert!(config.cookie.http_only);
        assert_eq!(config.cookie.same_site, SameSite::Lax);
    }

    #[test]
    fn callback_path_from_redirect_url() {
        let config = OidcConfig::from_yaml(MINIMAL).unwrap();
        assert_eq!(config.callback_path().unwrap(), "/oauth2/callback");
        assert_eq!(
            config.discovery_url(),
            "https://idp.example/.well-known/openid-configuration"
        );
    }

    #[test]
    fn missing_client_secret_rejected() {
        let input = r#"
issuer: https://idp.example
client_id: portcullis
redirect_url: https://app.example/oauth2/callback
"#;
        let err = OidcConfig::from_yaml(input).unwrap_err();
        assert_eq!(err, ConfigError::Missing("client_secret"));
    }

    #[test]
    fn root_callback_rejected() {
        let input = MINIMAL.replace("/oauth2/callback", "/");
        let err = OidcConfig::from_yaml(&input).unwrap_err();
        assert!(matches!(err, ConfigError::Invalid { field: "redirect_url", .. }));
    }

    #[test]
    fn scopes_must_include_openid() {
        let input = format!("{}scopes: [email]\n", MINIMAL);
        let err = OidcConfig::from_yaml(&input).unwrap_err();
        assert!(matches!(err, ConfigError::Invalid { field: "scopes", .. }));
    }

    #[test]
    fn cookie_secret_forms() {
        let mut config = OidcConfig::from_yaml(MINIMAL).unwrap();

        config.cookie.secret = Some(format!("hex:{}", "ab".repeat(32)));
        assert_eq!(config.cookie_key().unwrap(), [0xab; 32]);

        config.cookie.secret = Some(format!("base64:{}", STANDARD.encode([7u8; 32])));
        assert_eq!(config.cookie_key().unwrap(), [7; 32]);

        config.cookie.secret = Some("0123456789abcdef0123456789abcdef".to_string());
        assert_eq!(&config.cookie_key().unwrap()[..4], b"0123");

        config.cookie.secret = Some("short".to_string());
        assert!(config.cookie_key().is_err());
    }

    #[test]
    fn cookie_key_derived_from_client_secret() {
        let config = OidcConfig::from_yaml(MINIMAL).unwrap();
        let expected: [u8; 32] = Sha256::digest(b"s3cret").into();
        assert_eq!(config.cookie_key().unwrap(), expected);
    }

    #[test]
    fn json_config_with_cookie_options() {
        let input = r#"{
            "issuer": "https://idp.example",
            "client_id": "portcullis",
            "client_secret": "s3cret",
            "redirect_url": "https://app.example/oauth2/callback",
            "cookie": {"domain": "app.example", "secure": true, "same_site": "Strict"}
        }"#;
        let config = OidcConfig::from_json(input).unwrap();
        assert_eq!(config.cookie.domain.as_deref(), Some("app.example"));
        assert!(config.cookie.secure);
        assert_eq!(config.cookie.same_site, SameSite::Strict);
        assert_eq!(config.cookie.name, "_oidc_session");
    }
}

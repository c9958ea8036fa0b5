//! FakeIdp: a wiremock-backed OpenID provider.

use std::path::PathBuf;
use std::sync::atomic::{AtomicU8, Ordering};

use base64::{engine::general_purpose::STANDARD, Engine};
use serde_json::{json, Value};
use tempfile::TempDir;
use wiremock::matchers::{body_string_contains, header, method, path};
use wiremock::{Mock, MockServer, ResponseTemplate};

use crate::signer::Signer;
use crate::TestError;

pub const CLIENT_ID: &str = "portcullis";
pub const CLIENT_SECRET: &str = "s3cret";
pub const REDIRECT_URL: &str = "https://app.portcullis.test/oauth2/callback";

/// How the token endpoint wants client credentials.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TokenAuth {
    /// HTTP Basic only.
    Header,
    /// `client_id`/`client_secret` form fields only.
    Params,
}

/// An OpenID provider on a random local port.
///
/// Serves discovery and a key set on start; token responses are mounted per
/// test since they carry the nonce the relying party generated.
pub struct FakeIdp {
    server: MockServer,
    signer: Signer,
    _config_dir: TempDir,
    config_path: PathBuf,
    /// wiremock serves the lowest priority number first; each mount takes a
    /// lower number so newer responses shadow older ones.
    priority: AtomicU8,
}

impl FakeIdp {
    pub async fn start() -> Result<Self, TestError> {
        Self::start_with_discovery(|_| {}).await
    }

    /// Start with a discovery document edited by `customize`.
    pub async fn start_with_discovery(
        customize: impl FnOnce(&mut Value),
    ) -> Result<Self, TestError> {
        let server = MockServer::start().await;
        let signer = Signer::generate("key-1")?;

        let mut document = json!({
            "issuer": server.uri(),
            "authorization_endpoint": format!("{}/authorize", server.uri()),
            "token_endpoint": format!("{}/token", server.uri()),
            "jwks_uri": format!("{}/jwks", server.uri()),
            "userinfo_endpoint": format!("{}/userinfo", server.uri()),
            "id_token_signing_alg_values_supported": ["ES256", "RS256"],
            "code_challenge_methods_supported": ["S256"]
        });
        customize(&mut document);
        Mock::given(method("GET"))
            .and(path("/.well-known/openid-configuration"))
            .respond_with(ResponseTemplate::new(200).set_body_json(document))
            .mount(&server)
            .await;

        let config_dir = TempDir::new()?;
        let config_path = config_dir.path().join("portcullis.yaml");
        std::fs::write(&config_path, config_yaml(&server.uri()))?;

        let idp = Self {
            server,
            signer,
            _config_dir: config_dir,
            config_path,
            priority: AtomicU8::new(u8::MAX),
        };
        idp.publish_keys(&[&idp.signer]).await;
        Ok(idp)
    }

    pub fn issuer(&self) -> String {
        self.server.uri()
    }

    pub fn signer(&self) -> &Signer {
        &self.signer
    }

    /// YAML config for a relying party registered with this IdP.
    pub fn config_yaml(&self) -> String {
        config_yaml(&self.server.uri())
    }

    /// The same config, written to a temp file.
    pub fn config_path(&self) -> &PathBuf {
        &self.config_path
    }

    /// Serve `signers` as the key set. Later mounts win.
    pub async fn publish_keys(&self, signers: &[&Signer]) {
        let keys: Vec<Value> = signers.iter().map(|s| s.jwk()).collect();
        Mock::given(method("GET"))
            .and(path("/jwks"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({ "keys": keys })))
            .with_priority(self.next_priority())
            .mount(&self.server)
            .await;
    }

    /// Standard claims for `sub`, valid from `now` for ten minutes.
    pub fn claims(&self, subject: &str, nonce: Option<&str>, now: u64) -> Value {
        let mut claims = json!({
            "iss": self.issuer(),
            "sub": subject,
            "aud": CLIENT_ID,
            "iat": now,
            "exp": now + 600,
            "email": format!("{}@portcullis.test", subject)
        });
        if let Some(nonce) = nonce {
            claims["nonce"] = json!(nonce);
        }
        claims
    }

    /// Answer the next code exchange with `id_token`, accepting credentials
    /// only the way `auth` says. The other style gets `invalid_client`.
    pub async fn mount_token_response(&self, id_token: &str, auth: TokenAuth) {
        let body = json!({
            "access_token": "access-1",
            "token_type": "Bearer",
            "expires_in": 3600,
            "refresh_token": "refresh-1",
            "id_token": id_token
        });
        let accepted = match auth {
            TokenAuth::Header => Mock::given(method("POST")).and(path("/token")).and(header(
                "authorization",
                format!(
                    "Basic {}",
                    STANDARD.encode(format!("{}:{}", CLIENT_ID, CLIENT_SECRET))
                )
                .as_str(),
            )),
            TokenAuth::Params => Mock::given(method("POST"))
                .and(path("/token"))
                .and(body_string_contains(format!("client_secret={}", CLIENT_SECRET))),
        };
        let priority = self.next_priority();
        accepted
            .respond_with(ResponseTemplate::new(200).set_body_json(body))
            .with_priority(priority)
            .mount(&self.server)
            .await;

        Mock::given(method("POST"))
            .and(path("/token"))
            .respond_with(ResponseTemplate::new(401).set_body_json(json!({
                "error": "invalid_client",
                "error_description": "client authentication failed"
            })))
            .with_priority(priority.saturating_add(1))
            .mount(&self.server)
            .await;
    }

    fn next_priority(&self) -> u8 {
        self.priority.fetch_sub(2, Ordering::Relaxed).saturating_sub(2).max(1)
    }

    /// Requests the IdP has seen on `route`.
    pub async fn requests_to(&self, route: &str) -> usize {
        self.server
            .received_requests()
            .await
            .unwrap_or_default()
            .iter()
            .filter(|r| r.url.path() == route)
            .count()
    }
}

fn config_yaml(issuer: &str) -> String {
    format!(
        r#"issuer: {issuer}
client_id: {CLIENT_ID}
client_secret: {CLIENT_SECRET}
redirect_url: {REDIRECT_URL}
client_url: /
timeout_millis: 2000
"#
    )
}

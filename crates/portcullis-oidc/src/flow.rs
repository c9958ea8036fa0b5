//! The relying-party state machine.
//!
//! [`OidcFlow::handle`] takes one inbound request and decides between
//! forwarding it with an identity, redirecting the browser to the IdP,
//! finishing a login on the callback route, or refusing. Each async step
//! (discovery, token exchange, JWKS) is a suspension point inside one
//! driver loop over [`Step`]; dropping the future abandons the step
//! without publishing anything.

use std::sync::Arc;

use parking_lot::RwLock;
use portcullis_telemetry::{
    log_callback_denied, log_idp_contract_violation, log_idp_transport_failure,
    log_key_rotation_retry, log_login_redirect, log_session_accepted, log_session_rejected,
    log_state_rejected, log_token_exchanged,
};
use ring::rand::SystemRandom;
use serde::{Deserialize, Serialize};
use url::Url;

use crate::algorithm::SigningAlgorithm;
use crate::config::OidcConfig;
use crate::cookie::{
    clear_cookie, read_cookie, set_cookie, CookieSessionData, SecureCookieCodec, MAX_COOKIE_BYTES,
};
use crate::discovery::DiscoveryClient;
use crate::error::OidcError;
use crate::gateway::{Action, Request, Response};
use crate::host::{Clock, HttpTransport, SharedStore, SystemClock};
use crate::jwks::{JwkSet, JwksFetcher};
use crate::pkce::{code_challenge_s256, generate_code_verifier};
use crate::state::{SignedStateCodec, STATE_TTL_SECONDS};
use crate::token::{AuthStyleCache, ClientCredentials, CodeExchange, TokenExchanger};
use crate::verifier::{IdTokenClaims, IdTokenVerifier, NonceBinding};

/// Header carrying the verified subject upstream.
pub const SUBJECT_HEADER: &str = "x-auth-sub";

const NO_CACHE_HEADERS: [(&str, &str); 3] = [
    ("Cache-Control", "no-cache, no-store, must-revalidate, max-age=0"),
    ("Pragma", "no-cache"),
    ("Expires", "Thu, 01 Jan 1970 00:00:00 GMT"),
];

/// Where a request ended up.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FlowState {
    NoSession,
    Redirecting,
    AwaitingCallback,
    Verifying,
    Authenticated,
    Denied,
    /// CORS preflight let through without a session.
    Passthrough,
}

/// Result of handling one request.
#[derive(Debug)]
pub struct FlowOutcome {
    /// Final state.
    pub state: FlowState,
    /// Every state entered, in order.
    pub transitions: Vec<FlowState>,
    pub action: Action<Request>,
}

/// Per-login context carried across the IdP round trip in its own
/// encrypted cookie.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FlowCookie {
    pub return_to: String,
    #[serde(default)]
    pub nonce: Option<String>,
    #[serde(default)]
    pub code_verifier: Option<String>,
    #[serde(default)]
    pub attempt: u8,
}

enum Step {
    Session { value: String },
    NoSession,
    Redirect { return_to: String, attempt: u8 },
    Callback,
    Verify { code: String, flow: FlowCookie },
    Done(FlowState, Action<Request>),
}

struct CachedKeys {
    set: Arc<JwkSet>,
    algorithms: Vec<SigningAlgorithm>,
    fetched_at: u64,
}

pub struct OidcFlow {
    config: OidcConfig,
    callback_path: String,
    discovery: DiscoveryClient,
    exchanger: TokenExchanger,
    jwks: JwksFetcher,
    verifier: IdTokenVerifier,
    state_codec: SignedStateCodec,
    session_codec: SecureCookieCodec,
    flow_codec: SecureCookieCodec,
    flow_cookie_name: String,
    keys: RwLock<Option<CachedKeys>>,
    clock: Arc<dyn Clock>,
    rng: SystemRandom,
}

impl OidcFlow {
    pub fn new(
        config: OidcConfig,
        transport: Arc<dyn HttpTransport>,
        store: Arc<dyn SharedStore>,
    ) -> Result<Self, OidcError> {
        config.validate()?;
        let callback_path = config.callback_path()?;
        let key = config.cookie_key()?;
        let flow_cookie_name = format!("{}_flow", config.cookie.name);

        Ok(Self {
            callback_path,
            discovery: DiscoveryClient::new(transport.clone(), config.discovery_url()),
            exchanger: TokenExchanger::new(transport.clone(), AuthStyleCache::new(store)),
            jwks: JwksFetcher::new(transport),
            verifier: IdTokenVerifier::new(&config),
            state_codec: SignedStateCodec::from_config(&config),
            session_codec: SecureCookieCodec::new(&key, config.cookie.name.clone())?,
            flow_codec: SecureCookieCodec::new(&key, flow_cookie_name.clone())?,
            flow_cookie_name,
            keys: RwLock::new(None),
            clock: Arc::new(SystemClock),
            rng: SystemRandom::new(),
            config,
        })
    }

    pub fn with_clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = clock;
        self
    }

    pub fn config(&self) -> &OidcConfig {
        &self.config
    }

    pub async fn handle(&self, request: Request) -> FlowOutcome {
        let now = self.clock.now();
        let mut transitions = Vec::new();
        let mut step = self.route(&request);

        loop {
            step = match step {
                Step::Session { value } => self.check_session(&request, &value, now).await,
                Step::NoSession => {
                    transitions.push(FlowState::NoSession);
                    self.no_session(&request)
                }
                Step::Redirect { return_to, attempt } => {
                    transitions.push(FlowState::Redirecting);
                    self.redirect(return_to, attempt, now).await
                }
                Step::Callback => {
                    transitions.push(FlowState::AwaitingCallback);
                    self.callback(&request, now)
                }
                Step::Verify { code, flow } => {
                    transitions.push(FlowState::Verifying);
                    self.verify_callback(&code, flow, now).await
                }
                Step::Done(state, action) => {
                    if transitions.last() != Some(&state) {
                        transitions.push(state);
                    }
                    return FlowOutcome {
                        state,
                        transitions,
                        action,
                    };
                }
            };
        }
    }

    fn route(&self, request: &Request) -> Step {
        if self.config.skip_auth_preflight && request.method.eq_ignore_ascii_case("OPTIONS") {
            return Step::Done(
                FlowState::Passthrough,
                Action::Continue(self.without_identity(request)),
            );
        }
        if request.path == self.callback_path {
            return Step::Callback;
        }
        if request.path == self.config.start_path {
            let requested = request.query_param("rd");
            return Step::Redirect {
                return_to: self.return_path(requested.as_deref()),
                attempt: 0,
            };
        }

        let session = request
            .header("cookie")
            .and_then(|header| read_cookie(header, &self.config.cookie.name))
            .filter(|value| !value.is_empty());
        match session {
            Some(value) => Step::Session {
                value: value.to_string(),
            },
            None => Step::NoSession,
        }
    }

    /// Browsers get a login redirect; API callers get a 401.
    fn no_session(&self, request: &Request) -> Step {
        if is_ajax(request) {
            let response = Response::problem(
                401,
                "unauthenticated",
                "Authentication required",
                "no valid session",
            )
            .with_header("www-authenticate", "Bearer realm=\"oidc\"");
            return Step::Done(FlowState::NoSession, Action::ShortCircuit(response));
        }
        let requested = request.path_and_query();
        Step::Redirect {
            return_to: self.return_path(Some(requested.as_str())),
            attempt: 0,
        }
    }

    async fn check_session(&self, request: &Request, value: &str, now: u64) -> Step {
        let data: CookieSessionData = match self.session_codec.open(value) {
            Ok(data) => data,
            Err(e) => {
                log_session_rejected!(reason = %e, "session cookie unreadable");
                return Step::NoSession;
            }
        };
        if data.expires_on <= now {
            log_session_rejected!(expires_on = data.expires_on, "session expired");
            return Step::NoSession;
        }

        match self.verify_session_token(&data.id_token, now).await {
            Ok(claims) => {
                log_session_accepted!(sub = %claims.subject, "session verified");
                let mut forwarded = self.without_identity(request);
                forwarded.set_header(SUBJECT_HEADER, claims.subject);
                if self.config.pass_authorization_header {
                    forwarded.set_header("authorization", format!("Bearer {}", data.id_token));
                }
                Step::Done(FlowState::Authenticated, Action::Continue(forwarded))
            }
            Err(e) => {
                log_session_rejected!(error = e.as_str(), reason = %e, "session token rejected");
                Step::NoSession
            }
        }
    }

    /// Verify against the cached key set, refetching once on a key miss.
    async fn verify_session_token(
        &self,
        id_token: &str,
        now: u64,
    ) -> Result<IdTokenClaims, OidcError> {
        let (set, algorithms, cached) = self.session_keys(now).await?;
        match self
            .verifier
            .verify(id_token, &set, &algorithms, &NonceBinding::Skip, now)
        {
            Ok(claims) => Ok(claims),
            Err(e) if cached && OidcError::from(e.clone()).is_key_rotation_candidate() => {
                tracing::debug!(error = %e, "session key miss, refetching key set");
                let (set, algorithms) = self.refresh_keys(now).await?;
                Ok(self
                    .verifier
                    .verify(id_token, &set, &algorithms, &NonceBinding::Skip, now)?)
            }
            Err(e) => Err(e.into()),
        }
    }

    /// Cached keys when fresh enough, otherwise a fresh fetch. The flag
    /// says whether the cache was used.
    async fn session_keys(
        &self,
        now: u64,
    ) -> Result<(Arc<JwkSet>, Vec<SigningAlgorithm>, bool), OidcError> {
        {
            let cached = self.keys.read();
            if let Some(keys) = cached.as_ref() {
                if now.saturating_sub(keys.fetched_at) < self.config.jwks_refresh_seconds {
                    return Ok((keys.set.clone(), keys.algorithms.clone(), true));
                }
            }
        }
        let (set, algorithms) = self.refresh_keys(now).await?;
        Ok((set, algorithms, false))
    }

    async fn refresh_keys(
        &self,
        now: u64,
    ) -> Result<(Arc<JwkSet>, Vec<SigningAlgorithm>), OidcError> {
        let endpoints = self.discovery.endpoints().await?;
        let set = Arc::new(self.jwks.fetch(endpoints.jwks_url()?).await?);
        let algorithms = endpoints.signing_algorithms();
        self.store_keys(set.clone(), algorithms.clone(), now);
        Ok((set, algorithms))
    }

    fn store_keys(&self, set: Arc<JwkSet>, algorithms: Vec<SigningAlgorithm>, now: u64) {
        *self.keys.write() = Some(CachedKeys {
            set,
            algorithms,
            fetched_at: now,
        });
    }

    async fn redirect(&self, return_to: String, attempt: u8, now: u64) -> Step {
        match self.build_redirect(return_to, attempt, now).await {
            Ok(response) => Step::Done(
                FlowState::AwaitingCallback,
                Action::ShortCircuit(response),
            ),
            Err(e) => self.fail(e),
        }
    }

    async fn build_redirect(
        &self,
        return_to: String,
        attempt: u8,
        now: u64,
    ) -> Result<Response, OidcError> {
        let state = self.state_codec.generate(now)?;
        let nonce = if self.config.skip_nonce_check {
            None
        } else {
            Some(self.state_codec.generate(now)?)
        };
        let code_verifier = if self.config.pkce {
            Some(generate_code_verifier(&self.rng)?)
        } else {
            None
        };

        let endpoints = self.discovery.endpoints().await?;
        let authorization_url = endpoints.authorization_url()?;
        let mut location =
            Url::parse(authorization_url).map_err(|_| OidcError::ProtocolContract {
                document: "openid-configuration",
                field: "authorization_endpoint",
            })?;
        {
            let mut query = location.query_pairs_mut();
            query
                .append_pair("response_type", "code")
                .append_pair("client_id", &self.config.client_id)
                .append_pair("redirect_uri", &self.config.redirect_url)
                .append_pair("scope", &self.config.scope_param())
                .append_pair("state", &state);
            if let Some(nonce) = &nonce {
                query.append_pair("nonce", nonce);
            }
            if let Some(verifier) = &code_verifier {
                query
                    .append_pair("code_challenge", &code_challenge_s256(verifier))
                    .append_pair("code_challenge_method", "S256");
            }
        }

        let flow = FlowCookie {
            return_to,
            nonce,
            code_verifier,
            attempt,
        };
        let sealed = self.flow_codec.seal(&flow)?;
        let flow_cookie = set_cookie(
            &self.config.cookie,
            &self.flow_cookie_name,
            &sealed,
            now + STATE_TTL_SECONDS,
            now,
        );

        log_login_redirect!(
            return_to = %flow.return_to,
            attempt,
            pkce = flow.code_verifier.is_some(),
            "redirecting to identity provider"
        );
        Ok(with_no_cache(
            Response::new(302)
                .with_header("Location", location.as_str())
                .with_header("Set-Cookie", flow_cookie),
        ))
    }

    fn callback(&self, request: &Request, now: u64) -> Step {
        if let Some(error) = request.query_param("error") {
            let description = request.query_param("error_description").unwrap_or_default();
            log_callback_denied!(error = %error, description = %description, "IdP denied authorization");
            let detail = if description.is_empty() {
                error
            } else {
                format!("{}: {}", error, description)
            };
            return self.fail(OidcError::Denied(detail));
        }

        let (Some(code), Some(state)) = (request.query_param("code"), request.query_param("state"))
        else {
            log_callback_denied!("callback without code or state");
            return self.fail(OidcError::InvalidCallback(
                "code and state parameters are required".to_string(),
            ));
        };
        if code.is_empty() {
            return self.fail(OidcError::InvalidCallback("empty code".to_string()));
        }

        if let Err(e) = self.state_codec.verify(&state, now) {
            log_state_rejected!(reason = %e, "state parameter rejected");
            return self.fail(e.into());
        }

        let flow = request
            .header("cookie")
            .and_then(|header| read_cookie(header, &self.flow_cookie_name))
            .and_then(|value| self.flow_codec.open::<FlowCookie>(value).ok())
            .unwrap_or_else(|| {
                tracing::debug!("flow cookie missing, continuing without stored context");
                FlowCookie {
                    return_to: self.return_path(None),
                    nonce: None,
                    code_verifier: None,
                    attempt: 0,
                }
            });

        Step::Verify { code, flow }
    }

    async fn verify_callback(&self, code: &str, flow: FlowCookie, now: u64) -> Step {
        match self.complete_login(code, &flow, now).await {
            Ok(response) => Step::Done(FlowState::Authenticated, Action::ShortCircuit(response)),
            Err(e) if e.is_key_rotation_candidate() && flow.attempt == 0 => {
                log_key_rotation_retry!(error = e.as_str(), reason = %e, "restarting login once");
                *self.keys.write() = None;
                Step::Redirect {
                    return_to: flow.return_to,
                    attempt: 1,
                }
            }
            Err(e) => self.fail(e),
        }
    }

    async fn complete_login(
        &self,
        code: &str,
        flow: &FlowCookie,
        now: u64,
    ) -> Result<Response, OidcError> {
        let endpoints = self.discovery.endpoints().await?;
        let token_url = endpoints.token_url()?;
        let jwks_url = endpoints.jwks_url()?;

        let bundle = self
            .exchanger
            .exchange(
                token_url,
                ClientCredentials {
                    client_id: &self.config.client_id,
                    client_secret: &self.config.client_secret,
                },
                CodeExchange {
                    code,
                    redirect_url: &self.config.redirect_url,
                    code_verifier: flow.code_verifier.as_deref(),
                },
                now,
            )
            .await?;
        log_token_exchanged!(
            token_type = %bundle.token_type,
            has_refresh_token = bundle.refresh_token.is_some(),
            "authorization code exchanged"
        );
        let id_token = bundle.id_token.ok_or(OidcError::ProtocolContract {
            document: "token response",
            field: "id_token",
        })?;

        let set = Arc::new(self.jwks.fetch(jwks_url).await?);
        let algorithms = endpoints.signing_algorithms();
        self.store_keys(set.clone(), algorithms.clone(), now);

        let binding = NonceBinding::Bound {
            expected: flow.nonce.clone(),
        };
        let claims = self
            .verifier
            .verify(&id_token, &set, &algorithms, &binding, now)?;

        let expires_on = if claims.expiry > now {
            claims.expiry
        } else {
            now + STATE_TTL_SECONDS
        };
        let session = CookieSessionData {
            id_token,
            expires_on,
            created_at: now,
        };
        let sealed = self.session_codec.seal(&session)?;
        let session_cookie = set_cookie(
            &self.config.cookie,
            &self.config.cookie.name,
            &sealed,
            expires_on,
            now,
        );
        if session_cookie.len() > MAX_COOKIE_BYTES {
            tracing::warn!(
                size = session_cookie.len(),
                limit = MAX_COOKIE_BYTES,
                "session cookie exceeds browser limit and may be dropped"
            );
        }

        tracing::info!(sub = %claims.subject, "login completed");
        Ok(with_no_cache(
            Response::new(302)
                .with_header("Location", flow.return_to.as_str())
                .with_header("Set-Cookie", session_cookie)
                .with_header(
                    "Set-Cookie",
                    clear_cookie(&self.config.cookie, &self.flow_cookie_name),
                ),
        ))
    }

    /// Log by error class and turn into a terminal response.
    fn fail(&self, error: OidcError) -> Step {
        match &error {
            OidcError::Transport(e) => {
                log_idp_transport_failure!(reason = %e, "identity provider call failed")
            }
            OidcError::ProtocolContract { document, field } => log_idp_contract_violation!(
                document = *document,
                field = *field,
                "identity provider document incomplete"
            ),
            other if other.is_internal_fault() => {
                tracing::error!(reason = %other, "relying party internal failure")
            }
            other => tracing::info!(error = other.as_str(), reason = %other, "login refused"),
        }
        Step::Done(
            FlowState::Denied,
            Action::ShortCircuit(error_response(&error)),
        )
    }

    /// Copy of `request` with the identity headers this relying party owns
    /// removed, so only a verified session can set them upstream.
    fn without_identity(&self, request: &Request) -> Request {
        let mut forwarded = request.clone();
        forwarded.remove_header(SUBJECT_HEADER);
        if self.config.pass_authorization_header {
            forwarded.remove_header("authorization");
        }
        forwarded
    }

    /// A safe relative destination, or the configured fallback.
    fn return_path(&self, requested: Option<&str>) -> String {
        match requested {
            Some(path) if is_safe_return_path(path) => path.to_string(),
            _ => self
                .config
                .client_url
                .clone()
                .unwrap_or_else(|| "/".to_string()),
        }
    }
}

/// Relative paths only: no scheme, no protocol-relative `//host`, no `/\host`.
fn is_safe_return_path(path: &str) -> bool {
    path.starts_with('/') && !path.starts_with("//") && !path.starts_with("/\\")
}

fn is_ajax(request: &Request) -> bool {
    request
        .header("accept")
        .map(|accept| accept.to_ascii_lowercase().contains("application/json"))
        .unwrap_or(false)
}

fn with_no_cache(mut response: Response) -> Response {
    for (name, value) in NO_CACHE_HEADERS {
        response = response.with_header(name, value);
    }
    response
}

fn error_response(error: &OidcError) -> Response {
    let status = error.status_code();
    let title = match status {
        _ if error.is_internal_fault() => "Internal error",
        401 => "Authentication failed",
        403 => "Authorization failed",
        _ => "Identity provider error",
    };
    // Internal details stay in the logs.
    let detail = if error.is_internal_fault() || matches!(error, OidcError::Transport(_)) {
        title.to_string()
    } else {
        error.to_string()
    };
    let response = Response::problem(status, error.as_str(), title, &detail);
    if status == 401 {
        response.with_header(
            "www-authenticate",
            format!("Bearer realm=\"oidc\", error=\"{}\"", error.as_str()),
        )
    } else {
        response
    }
}

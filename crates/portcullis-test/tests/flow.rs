//! End-to-end login flows against a fake identity provider over real HTTP.
//!
//! Run with: `cargo test -p portcullis-test`

use std::sync::Arc;

use portcullis_oidc::{
    Action, AuthStyle, AuthStyleCache, ClientCredentials, CodeExchange, FlowState, InMemoryStore,
    OidcConfig, OidcFlow, ReqwestTransport, Request, Response, TokenExchanger, SUBJECT_HEADER,
};
use portcullis_test::{
    location_param, set_cookie_pair, unix_now, FakeIdp, Signer, TokenAuth, CLIENT_ID,
    CLIENT_SECRET, REDIRECT_URL,
};

const FLOW_COOKIE: &str = "_oidc_session_flow";
const SESSION_COOKIE: &str = "_oidc_session";

fn relying_party(idp: &FakeIdp) -> OidcFlow {
    let config = OidcConfig::from_yaml(&idp.config_yaml()).expect("valid config");
    let transport =
        Arc::new(ReqwestTransport::with_timeout_millis(config.timeout_millis).expect("client"));
    OidcFlow::new(config, transport, Arc::new(InMemoryStore::new())).expect("relying party")
}

fn response(action: Action<Request>) -> Response {
    match action {
        Action::ShortCircuit(response) => response,
        Action::Continue(request) => {
            panic!("expected a response, request was forwarded: {:?}", request.path)
        }
    }
}

/// Drive a browser from `path` through the IdP and back, returning the
/// callback response.
async fn login(idp: &FakeIdp, rp: &OidcFlow, path: &str, auth: TokenAuth) -> Response {
    let redirect = response(rp.handle(Request::get(path)).await.action);
    assert_eq!(redirect.status, 302);
    let state = location_param(&redirect, "state").expect("state");
    let nonce = location_param(&redirect, "nonce").expect("nonce");
    let flow_cookie = set_cookie_pair(&redirect, FLOW_COOKIE).expect("flow cookie");

    let id_token = idp
        .signer()
        .sign(&idp.claims("alice", Some(&nonce), unix_now()))
        .expect("sign");
    idp.mount_token_response(&id_token, auth).await;

    let callback = Request::get(&format!("/oauth2/callback?code=code-1&state={}", state))
        .with_header("cookie", flow_cookie);
    let outcome = rp.handle(callback).await;
    response(outcome.action)
}

#[tokio::test]
async fn browser_login_establishes_session() {
    let idp = FakeIdp::start().await.expect("fake idp");
    let rp = relying_party(&idp);

    let redirect = response(rp.handle(Request::get("/reports?year=2024")).await.action);
    assert!(redirect
        .header("location")
        .unwrap()
        .starts_with(&format!("{}/authorize?", idp.issuer())));
    assert_eq!(location_param(&redirect, "client_id").as_deref(), Some(CLIENT_ID));
    assert_eq!(location_param(&redirect, "redirect_uri").as_deref(), Some(REDIRECT_URL));

    let callback = login(&idp, &rp, "/reports?year=2024", TokenAuth::Header).await;
    assert_eq!(callback.status, 302);
    assert_eq!(callback.header("location"), Some("/reports?year=2024"));
    let session = set_cookie_pair(&callback, SESSION_COOKIE).expect("session cookie");

    let jwks_calls = idp.requests_to("/jwks").await;
    let outcome = rp
        .handle(Request::get("/reports").with_header("cookie", session))
        .await;
    assert_eq!(outcome.state, FlowState::Authenticated);
    let Action::Continue(forwarded) = outcome.action else {
        panic!("session request should be forwarded");
    };
    assert_eq!(forwarded.header(SUBJECT_HEADER), Some("alice"));
    assert!(forwarded.header("authorization").unwrap().starts_with("Bearer ey"));
    assert_eq!(idp.requests_to("/jwks").await, jwks_calls);
    assert_eq!(idp.requests_to("/.well-known/openid-configuration").await, 1);
}

#[tokio::test]
async fn params_only_token_endpoint_is_learned() {
    let idp = FakeIdp::start().await.expect("fake idp");
    let rp = relying_party(&idp);

    let callback = login(&idp, &rp, "/", TokenAuth::Params).await;
    assert_eq!(callback.status, 302);
    assert_eq!(idp.requests_to("/token").await, 2);

    // Second login goes straight to the learned style.
    let callback = login(&idp, &rp, "/", TokenAuth::Params).await;
    assert_eq!(callback.status, 302);
    assert_eq!(idp.requests_to("/token").await, 3);
}

#[tokio::test]
async fn auth_style_is_shared_through_the_store() {
    let idp = FakeIdp::start().await.expect("fake idp");
    let transport = Arc::new(ReqwestTransport::with_timeout_millis(2000).expect("client"));
    let store = Arc::new(InMemoryStore::new());
    let token_url = format!("{}/token", idp.issuer());
    let id_token = idp
        .signer()
        .sign(&idp.claims("bob", None, unix_now()))
        .expect("sign");
    idp.mount_token_response(&id_token, TokenAuth::Params).await;

    let credentials = ClientCredentials {
        client_id: CLIENT_ID,
        client_secret: CLIENT_SECRET,
    };
    let exchange = CodeExchange {
        code: "code-1",
        redirect_url: REDIRECT_URL,
        code_verifier: None,
    };

    let first = TokenExchanger::new(transport.clone(), AuthStyleCache::new(store.clone()));
    let bundle = first
        .exchange(&token_url, credentials, exchange, unix_now())
        .await
        .expect("exchange");
    assert_eq!(bundle.id_token.as_deref(), Some(id_token.as_str()));
    assert_eq!(first.cache().lookup(&token_url), Some(AuthStyle::InParams));

    // Another instance on the same store skips the probe.
    let second = TokenExchanger::new(transport, AuthStyleCache::new(store));
    second
        .exchange(&token_url, credentials, exchange, unix_now())
        .await
        .expect("exchange");
    assert_eq!(idp.requests_to("/token").await, 3);
}

#[tokio::test]
async fn rotated_key_restarts_login_once() {
    let idp = FakeIdp::start().await.expect("fake idp");
    let rp = relying_party(&idp);
    let rotated = Signer::generate("key-2").expect("key");

    let redirect = response(rp.handle(Request::get("/app")).await.action);
    let state = location_param(&redirect, "state").unwrap();
    let nonce = location_param(&redirect, "nonce").unwrap();
    let flow_cookie = set_cookie_pair(&redirect, FLOW_COOKIE).unwrap();

    let id_token = rotated
        .sign(&idp.claims("alice", Some(&nonce), unix_now()))
        .unwrap();
    idp.mount_token_response(&id_token, TokenAuth::Header).await;

    let outcome = rp
        .handle(
            Request::get(&format!("/oauth2/callback?code=c&state={}", state))
                .with_header("cookie", flow_cookie),
        )
        .await;
    assert_eq!(outcome.state, FlowState::AwaitingCallback);
    let retry = response(outcome.action);
    assert_eq!(retry.status, 302);
    assert!(location_param(&retry, "state").is_some());

    // The IdP publishes the new key; the retried login completes.
    idp.publish_keys(&[idp.signer(), &rotated]).await;
    let state = location_param(&retry, "state").unwrap();
    let nonce = location_param(&retry, "nonce").unwrap();
    let flow_cookie = set_cookie_pair(&retry, FLOW_COOKIE).unwrap();
    let id_token = rotated
        .sign(&idp.claims("alice", Some(&nonce), unix_now()))
        .unwrap();
    idp.mount_token_response(&id_token, TokenAuth::Header).await;

    let outcome = rp
        .handle(
            Request::get(&format!("/oauth2/callback?code=c2&state={}", state))
                .with_header("cookie", flow_cookie),
        )
        .await;
    assert_eq!(outcome.state, FlowState::Authenticated);
    assert_eq!(response(outcome.action).header("location"), Some("/app"));
}

#[tokio::test]
async fn discovery_without_jwks_uri_is_a_contract_violation() {
    let idp = FakeIdp::start_with_discovery(|doc| {
        doc.as_object_mut().unwrap().remove("jwks_uri");
    })
    .await
    .expect("fake idp");
    let rp = relying_party(&idp);

    // The redirect only needs the authorization endpoint.
    let redirect = response(rp.handle(Request::get("/")).await.action);
    assert_eq!(redirect.status, 302);

    let state = location_param(&redirect, "state").unwrap();
    let outcome = rp
        .handle(Request::get(&format!("/oauth2/callback?code=c&state={}", state)))
        .await;
    assert_eq!(outcome.state, FlowState::Denied);
    let failure = response(outcome.action);
    assert_eq!(failure.status, 500);
    let body: serde_json::Value = serde_json::from_str(failure.body.as_deref().unwrap()).unwrap();
    assert_eq!(body["type"], "urn:portcullis:error:idp_contract_violation");
    assert!(body["detail"].as_str().unwrap().contains("jwks_uri"));
    assert_eq!(idp.requests_to("/token").await, 0);
}

#[tokio::test]
async fn unreachable_idp_is_reported_as_500() {
    let config = OidcConfig::from_yaml(
        r#"
issuer: http://127.0.0.1:9
client_id: portcullis
client_secret: s3cret
redirect_url: https://app.portcullis.test/oauth2/callback
timeout_millis: 200
"#,
    )
    .unwrap();
    let transport = Arc::new(ReqwestTransport::with_timeout_millis(200).unwrap());
    let rp = OidcFlow::new(config, transport, Arc::new(InMemoryStore::new())).unwrap();

    let outcome = rp.handle(Request::get("/")).await;
    assert_eq!(outcome.state, FlowState::Denied);
    let failure = response(outcome.action);
    assert_eq!(failure.status, 500);
    let body: serde_json::Value = serde_json::from_str(failure.body.as_deref().unwrap()).unwrap();
    assert_eq!(body["type"], "urn:portcullis:error:idp_unavailable");
}

//! CLI regression tests for the `portcullis` binary.
//!
//! These invoke the binary as a subprocess to catch regressions in flag
//! names, exit codes, and output formats.

use std::path::Path;

use assert_cmd::assert::OutputAssertExt;
use assert_cmd::Command;
use predicates::str::contains;
use tempfile::TempDir;

use portcullis_oidc::{CookieSessionData, OidcConfig, SecureCookieCodec};
use portcullis_test::{unix_now, FakeIdp};

// ---------------------------------------------------------------------------
// Helpers
// ---------------------------------------------------------------------------

fn portcullis() -> Command {
    #[allow(deprecated)]
    Command::cargo_bin("portcullis").expect("portcullis binary not built")
}

fn write_config(dir: &TempDir, name: &str, contents: &str) -> std::path::PathBuf {
    let path = dir.path().join(name);
    std::fs::write(&path, contents).expect("write config");
    path
}

const CONFIG: &str = r#"
issuer: https://idp.portcullis.test
client_id: portcullis
client_secret: s3cret
redirect_url: https://app.portcullis.test/oauth2/callback
"#;

/// Run a command that talks to the fake IdP without blocking its server.
async fn run(mut cmd: Command) -> assert_cmd::assert::Assert {
    tokio::task::spawn_blocking(move || cmd.output())
        .await
        .expect("command task")
        .expect("spawn portcullis")
        .assert()
}

fn stdout_json(assert: &assert_cmd::assert::Assert) -> serde_json::Value {
    serde_json::from_slice(&assert.get_output().stdout).expect("stdout should be JSON")
}

fn with_config(args: &[&str], config: &Path) -> Command {
    let mut cmd = portcullis();
    cmd.args(args).arg("--config").arg(config);
    cmd
}

// ---------------------------------------------------------------------------
// portcullis check
// ---------------------------------------------------------------------------

#[test]
fn check_valid_config_prints_callback_path() {
    let dir = TempDir::new().unwrap();
    let config = write_config(&dir, "oidc.yaml", CONFIG);

    with_config(&["check"], &config)
        .assert()
        .success()
        .stdout(contains("callback path: /oauth2/callback"))
        .stdout(contains(
            "https://idp.portcullis.test/.well-known/openid-configuration",
        ));
}

#[test]
fn check_accepts_json_config() {
    let dir = TempDir::new().unwrap();
    let config = write_config(
        &dir,
        "oidc.json",
        r#"{"issuer": "https://idp.portcullis.test", "client_id": "portcullis",
            "client_secret": "s3cret", "redirect_url": "https://app.portcullis.test/cb"}"#,
    );

    with_config(&["check"], &config)
        .assert()
        .success()
        .stdout(contains("callback path: /cb"));
}

#[test]
fn check_missing_secret_exits_one() {
    let dir = TempDir::new().unwrap();
    let config = write_config(&dir, "oidc.yaml", &CONFIG.replace("client_secret: s3cret\n", ""));

    with_config(&["check"], &config)
        .assert()
        .failure()
        .code(1)
        .stderr(contains("client_secret"));
}

#[test]
fn check_missing_file_exits_one() {
    portcullis()
        .args(["check", "--config", "no-such-config.yaml"])
        .assert()
        .failure()
        .code(1)
        .stderr(contains("failed to read config file"));
}

#[test]
fn unknown_log_format_is_rejected() {
    portcullis()
        .args(["--log-format", "xml", "check", "--config", "x.yaml"])
        .assert()
        .failure()
        .stderr(contains("unknown log format"));
}

// ---------------------------------------------------------------------------
// portcullis state / cookie
// ---------------------------------------------------------------------------

#[test]
fn state_generate_then_verify() {
    let dir = TempDir::new().unwrap();
    let config = write_config(&dir, "oidc.yaml", CONFIG);

    let output = with_config(&["state", "generate"], &config)
        .assert()
        .success()
        .get_output()
        .stdout
        .clone();
    let token = String::from_utf8(output).unwrap();

    let assert = with_config(&["state", "verify"], &config)
        .args(["--token", token.trim()])
        .assert()
        .success();
    let state = stdout_json(&assert);
    assert_eq!(
        state["expiry"].as_u64().unwrap() - state["issued_at"].as_u64().unwrap(),
        3600
    );
}

#[test]
fn state_from_another_client_is_rejected() {
    let dir = TempDir::new().unwrap();
    let ours = write_config(&dir, "ours.yaml", CONFIG);
    let theirs = write_config(&dir, "theirs.yaml", &CONFIG.replace("s3cret", "other"));

    let output = with_config(&["state", "generate"], &theirs)
        .assert()
        .success()
        .get_output()
        .stdout
        .clone();
    let token = String::from_utf8(output).unwrap();

    with_config(&["state", "verify"], &ours)
        .args(["--token", token.trim()])
        .assert()
        .failure()
        .code(1)
        .stderr(contains("state rejected"));
}

#[test]
fn cookie_decrypt_prints_session() {
    let dir = TempDir::new().unwrap();
    let path = write_config(&dir, "oidc.yaml", CONFIG);
    let config = OidcConfig::from_yaml(CONFIG).unwrap();
    let codec = SecureCookieCodec::new(&config.cookie_key().unwrap(), "_oidc_session").unwrap();
    let value = codec
        .seal(&CookieSessionData {
            id_token: "header.payload.signature".to_string(),
            expires_on: unix_now() + 600,
            created_at: unix_now(),
        })
        .unwrap();

    let assert = with_config(&["cookie", "decrypt"], &path)
        .args(["--value", &value])
        .assert()
        .success();
    let session = stdout_json(&assert);
    assert_eq!(session["id_token"], "header.payload.signature");
    assert_eq!(session["expired"], false);
}

#[test]
fn cookie_decrypt_rejects_tampered_value() {
    let dir = TempDir::new().unwrap();
    let path = write_config(&dir, "oidc.yaml", CONFIG);

    with_config(&["cookie", "decrypt"], &path)
        .args(["--value", "AAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAA"])
        .assert()
        .failure()
        .code(1)
        .stderr(contains("cookie rejected"));
}

// ---------------------------------------------------------------------------
// portcullis discover / keys / verify (against a fake IdP)
// ---------------------------------------------------------------------------

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn discover_prints_endpoints() {
    let idp = FakeIdp::start().await.unwrap();

    let assert = run(with_config(&["discover"], idp.config_path())).await.success();
    let doc = stdout_json(&assert);
    assert_eq!(doc["issuer"], idp.issuer());
    assert_eq!(doc["jwks_uri"], format!("{}/jwks", idp.issuer()));
    assert_eq!(doc["signing_algorithms"], serde_json::json!(["ES256", "RS256"]));
    assert_eq!(doc["pkce_s256"], true);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn keys_lists_published_keys() {
    let idp = FakeIdp::start().await.unwrap();

    let assert = run(with_config(&["keys"], idp.config_path())).await.success();
    let out = stdout_json(&assert);
    let keys = out["keys"].as_array().unwrap();
    assert_eq!(keys.len(), 1);
    assert_eq!(keys[0]["kid"], "key-1");
    assert_eq!(keys[0]["kty"], "EC");
    assert_eq!(keys[0]["crv"], "P-256");
    assert_eq!(keys[0]["bits"], serde_json::Value::Null);
    assert_eq!(keys[0]["private"], false);
    assert_eq!(keys[0]["alg"], "ES256");
    assert_eq!(keys[0]["x5c"], 1);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn verify_prints_claims() {
    let idp = FakeIdp::start().await.unwrap();
    let token = idp
        .signer()
        .sign(&idp.claims("carol", None, unix_now()))
        .unwrap();

    let mut cmd = with_config(&["verify"], idp.config_path());
    cmd.args(["--token", &token]);
    let assert = run(cmd).await.success();
    let claims = stdout_json(&assert);
    assert_eq!(claims["subject"], "carol");
    assert_eq!(claims["signature_algorithm"], "ES256");
    assert_eq!(claims["extra"]["email"], "carol@portcullis.test");
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn verify_rejects_wrong_audience() {
    let idp = FakeIdp::start().await.unwrap();
    let mut claims = idp.claims("carol", None, unix_now());
    claims["aud"] = serde_json::json!("someone-else");
    let token = idp.signer().sign(&claims).unwrap();

    let mut cmd = with_config(&["verify"], idp.config_path());
    cmd.args(["--token", &token]);
    run(cmd)
        .await
        .failure()
        .code(1)
        .stderr(contains("audience"));
}

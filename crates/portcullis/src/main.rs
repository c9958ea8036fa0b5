//! Portcullis operator CLI.
//!
//! Checks a relying-party configuration against a live identity provider:
//! discovery, key sets, token verification, and the state and cookie codecs.

use std::path::Path;
use std::process::ExitCode;
use std::sync::Arc;

use anyhow::{anyhow, Context};
use clap::{Parser, Subcommand};
use serde_json::json;

use portcullis_oidc::{
    Clock, CookieSessionData, DiscoveryClient, IdTokenVerifier, JwksFetcher, NonceBinding,
    OidcConfig, ReqwestTransport, SecureCookieCodec, SignedStateCodec, SystemClock,
};
use portcullis_telemetry::{init_logging, LogFormat, TelemetryConfig};

#[derive(Parser, Debug)]
#[command(name = "portcullis", about = "Portcullis OIDC relying party", version)]
struct Cli {
    /// Log level (overridden by RUST_LOG).
    #[arg(long, global = true, default_value = "warn")]
    log_level: String,

    /// Log format (json or pretty).
    #[arg(long, global = true, default_value = "pretty")]
    log_format: String,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Validate a configuration file.
    Check {
        /// Configuration file (YAML or JSON).
        #[arg(short, long)]
        config: String,
    },

    /// Fetch the discovery document and print the endpoints.
    Discover {
        #[arg(short, long)]
        config: String,
    },

    /// Fetch the provider's key set and list its keys.
    Keys {
        #[arg(short, long)]
        config: String,
    },

    /// Verify an ID token as a session check would.
    Verify {
        #[arg(short, long)]
        config: String,

        /// Compact-serialized ID token.
        #[arg(short, long)]
        token: String,
    },

    /// Generate or verify a signed state value.
    State {
        #[command(subcommand)]
        action: StateAction,
    },

    /// Inspect session cookies.
    Cookie {
        #[command(subcommand)]
        action: CookieAction,
    },
}

#[derive(Subcommand, Debug)]
enum StateAction {
    Generate {
        #[arg(short, long)]
        config: String,
    },
    Verify {
        #[arg(short, long)]
        config: String,

        #[arg(short, long)]
        token: String,
    },
}

#[derive(Subcommand, Debug)]
enum CookieAction {
    /// Decrypt a session cookie value and print its contents.
    Decrypt {
        #[arg(short, long)]
        config: String,

        /// Cookie value, without the name.
        #[arg(long)]
        value: String,
    },
}

#[tokio::main]
async fn main() -> ExitCode {
    let cli = Cli::parse();

    let Some(log_format) = LogFormat::parse(&cli.log_format) else {
        eprintln!("error: unknown log format '{}'", cli.log_format);
        return ExitCode::from(2);
    };
    let telemetry = TelemetryConfig::new()
        .with_log_level(cli.log_level.clone())
        .with_log_format(log_format);
    if let Err(e) = init_logging(&telemetry) {
        eprintln!("error: {}", e);
        return ExitCode::from(1);
    }

    let result = match cli.command {
        Command::Check { config } => run_check(&config),
        Command::Discover { config } => run_discover(&config).await,
        Command::Keys { config } => run_keys(&config).await,
        Command::Verify { config, token } => run_verify(&config, &token).await,
        Command::State { action } => match action {
            StateAction::Generate { config } => run_state_generate(&config),
            StateAction::Verify { config, token } => run_state_verify(&config, &token),
        },
        Command::Cookie {
            action: CookieAction::Decrypt { config, value },
        } => run_cookie_decrypt(&config, &value),
    };

    match result {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            eprintln!("error: {:#}", e);
            ExitCode::from(1)
        }
    }
}

fn load_config(path: &str) -> anyhow::Result<OidcConfig> {
    let input = std::fs::read_to_string(path)
        .with_context(|| format!("failed to read config file {}", path))?;
    let is_json = Path::new(path)
        .extension()
        .is_some_and(|ext| ext.eq_ignore_ascii_case("json"));
    let config = if is_json {
        OidcConfig::from_json(&input)
    } else {
        OidcConfig::from_yaml(&input)
    };
    config.with_context(|| format!("invalid config {}", path))
}

fn transport(config: &OidcConfig) -> anyhow::Result<Arc<ReqwestTransport>> {
    let transport = ReqwestTransport::with_timeout_millis(config.timeout_millis)
        .context("failed to build HTTP client")?;
    Ok(Arc::new(transport))
}

fn print_json(value: &serde_json::Value) -> anyhow::Result<()> {
    println!("{}", serde_json::to_string_pretty(value)?);
    Ok(())
}

fn run_check(path: &str) -> anyhow::Result<()> {
    let config = load_config(path)?;
    println!("{} is valid", path);
    println!("callback path: {}", config.callback_path()?);
    println!("login path: {}", config.start_path);
    println!("discovery: {}", config.discovery_url());
    Ok(())
}

async fn run_discover(path: &str) -> anyhow::Result<()> {
    let config = load_config(path)?;
    let discovery = DiscoveryClient::new(transport(&config)?, config.discovery_url());
    let endpoints = discovery
        .refresh()
        .await
        .with_context(|| format!("discovery failed for {}", discovery.url()))?;

    let algorithms: Vec<&str> = endpoints
        .signing_algorithms()
        .iter()
        .map(|alg| alg.as_str())
        .collect();
    print_json(&json!({
        "issuer": endpoints.issuer,
        "authorization_endpoint": endpoints.authorization_endpoint,
        "token_endpoint": endpoints.token_endpoint,
        "jwks_uri": endpoints.jwks_uri,
        "userinfo_endpoint": endpoints.userinfo_endpoint,
        "signing_algorithms": algorithms,
        "pkce_s256": endpoints.supports_pkce_s256(),
    }))
}

async fn run_keys(path: &str) -> anyhow::Result<()> {
    let config = load_config(path)?;
    let transport = transport(&config)?;
    let endpoints = DiscoveryClient::new(transport.clone(), config.discovery_url())
        .refresh()
        .await
        .context("discovery failed")?;
    let jwks_url = endpoints.jwks_url()?;
    let set = JwksFetcher::new(transport)
        .fetch(jwks_url)
        .await
        .with_context(|| format!("failed to fetch key set from {}", jwks_url))?;

    let keys: Vec<serde_json::Value> = set
        .keys()
        .iter()
        .map(|key| {
            json!({
                "kid": key.key_id,
                "kty": key.key.key_type(),
                "crv": key.key.curve_name(),
                "bits": key.key.rsa_bits(),
                "private": key.key.is_private(),
                "alg": key.algorithm,
                "use": key.key_use,
                "x5c": key.certificates.len(),
            })
        })
        .collect();
    print_json(&json!({ "jwks_uri": jwks_url, "keys": keys }))
}

async fn run_verify(path: &str, token: &str) -> anyhow::Result<()> {
    let config = load_config(path)?;
    let transport = transport(&config)?;
    let endpoints = DiscoveryClient::new(transport.clone(), config.discovery_url())
        .refresh()
        .await
        .context("discovery failed")?;
    let set = JwksFetcher::new(transport)
        .fetch(endpoints.jwks_url()?)
        .await
        .context("failed to fetch key set")?;

    let claims = IdTokenVerifier::new(&config)
        .verify(
            token.trim(),
            &set,
            &endpoints.signing_algorithms(),
            &NonceBinding::Skip,
            SystemClock.now(),
        )
        .map_err(|e| anyhow!("token rejected: {}", e))?;
    tracing::debug!(sub = %claims.subject, "token verified");
    print_json(&serde_json::to_value(&claims)?)
}

fn run_state_generate(path: &str) -> anyhow::Result<()> {
    let config = load_config(path)?;
    let value = SignedStateCodec::from_config(&config).generate(SystemClock.now())?;
    println!("{}", value);
    Ok(())
}

fn run_state_verify(path: &str, token: &str) -> anyhow::Result<()> {
    let config = load_config(path)?;
    let state = SignedStateCodec::from_config(&config)
        .verify(token.trim(), SystemClock.now())
        .map_err(|e| anyhow!("state rejected: {}", e))?;
    print_json(&json!({
        "issued_at": state.issued_at,
        "expiry": state.expiry,
    }))
}

fn run_cookie_decrypt(path: &str, value: &str) -> anyhow::Result<()> {
    let config = load_config(path)?;
    let codec = SecureCookieCodec::new(&config.cookie_key()?, config.cookie.name.clone())?;
    let session: CookieSessionData = codec
        .open(value.trim())
        .map_err(|e| anyhow!("cookie rejected: {}", e))?;
    let mut output = serde_json::to_value(&session)?;
    output["expired"] = json!(session.expires_on <= SystemClock.now());
    print_json(&output)
}

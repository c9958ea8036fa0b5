//! Structured logging with JSON output.

use crate::{LogFormat, TelemetryConfig, TelemetryError};
use tracing_subscriber::{fmt, layer::SubscriberExt, util::SubscriberInitExt, EnvFilter, Layer};

/// Initialize the logging subsystem.
///
/// `RUST_LOG` wins over the configured level when set.
pub fn init_logging(config: &TelemetryConfig) -> Result<(), TelemetryError> {
    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(&config.log_level));

    match config.log_format {
        LogFormat::Json => init_json_logging(filter),
        LogFormat::Pretty => init_pretty_logging(filter),
    }
}

fn init_json_logging(filter: EnvFilter) -> Result<(), TelemetryError> {
    let json_layer = fmt::layer()
        .json()
        .with_target(true)
        .with_current_span(true)
        .with_span_list(false)
        .with_file(false)
        .with_line_number(false)
        .flatten_event(true)
        .with_writer(std::io::stderr)
        .with_filter(filter);

    tracing_subscriber::registry()
        .with(json_layer)
        .try_init()
        .map_err(|e: tracing_subscriber::util::TryInitError| {
            TelemetryError::LoggingInit(e.to_string())
        })
}

fn init_pretty_logging(filter: EnvFilter) -> Result<(), TelemetryError> {
    let pretty_layer = fmt::layer()
        .pretty()
        .with_target(true)
        .with_file(true)
        .with_line_number(true)
        .with_writer(std::io::stderr)
        .with_filter(filter);

    tracing_subscriber::registry()
        .with(pretty_layer)
        .try_init()
        .map_err(|e: tracing_subscriber::util::TryInitError| {
            TelemetryError::LoggingInit(e.to_string())
        })
}

/// Standard log event names.
///
/// Tokens, secrets and cookie values never appear in event fields.
pub mod events {
    /// Unauthenticated request sent to the authorization endpoint.
    pub const LOGIN_REDIRECT: &str = "login_redirect";

    /// The IdP redirected back with an `error` parameter, or the callback
    /// was unusable.
    pub const CALLBACK_DENIED: &str = "callback_denied";

    /// The `state` parameter failed verification.
    pub const STATE_REJECTED: &str = "state_rejected";

    /// Authorization code exchanged for tokens.
    pub const TOKEN_EXCHANGED: &str = "token_exchanged";

    /// A token endpoint's auth style was recorded.
    pub const AUTH_STYLE_LEARNED: &str = "auth_style_learned";

    /// A session cookie verified.
    pub const SESSION_ACCEPTED: &str = "session_accepted";

    /// A session cookie was present but unusable.
    pub const SESSION_REJECTED: &str = "session_rejected";

    /// A signature or key miss restarted the login once.
    pub const KEY_ROTATION_RETRY: &str = "key_rotation_retry";

    /// An IdP document lacked a required field.
    pub const IDP_CONTRACT_VIOLATION: &str = "idp_contract_violation";

    /// The IdP could not be reached or answered badly.
    pub const IDP_TRANSPORT_FAILURE: &str = "idp_transport_failure";
}

/// Helper macros for structured logging with standard fields.
///
/// These wrap the tracing macros to ensure consistent field naming.
#[macro_export]
macro_rules! log_login_redirect {
    ($($field:tt)*) => {
        tracing::info!(
            event = $crate::logging::events::LOGIN_REDIRECT,
            $($field)*
        )
    };
}

#[macro_export]
macro_rules! log_callback_denied {
    ($($field:tt)*) => {
        tracing::warn!(
            event = $crate::logging::events::CALLBACK_DENIED,
            $($field)*
        )
    };
}

#[macro_export]
macro_rules! log_state_rejected {
    ($($field:tt)*) => {
        tracing::warn!(
            event = $crate::logging::events::STATE_REJECTED,
            $($field)*
        )
    };
}

#[macro_export]
macro_rules! log_token_exchanged {
    ($($field:tt)*) => {
        tracing::info!(
            event = $crate::logging::events::TOKEN_EXCHANGED,
            $($field)*
        )
    };
}

#[macro_export]
macro_rules! log_auth_style_learned {
    ($($field:tt)*) => {
        tracing::info!(
            event = $crate::logging::events::AUTH_STYLE_LEARNED,
            $($field)*
        )
    };
}

#[macro_export]
macro_rules! log_session_accepted {
    ($($field:tt)*) => {
        tracing::debug!(
            event = $crate::logging::events::SESSION_ACCEPTED,
            $($field)*
        )
    };
}

#[macro_export]
macro_rules! log_session_rejected {
    ($($field:tt)*) => {
        tracing::info!(
            event = $crate::logging::events::SESSION_REJECTED,
            $($field)*
        )
    };
}

#[macro_export]
macro_rules! log_key_rotation_retry {
    ($($field:tt)*) => {
        tracing::warn!(
            event = $crate::logging::events::KEY_ROTATION_RETRY,
            $($field)*
        )
    };
}

#[macro_export]
macro_rules! log_idp_contract_violation {
    ($($field:tt)*) => {
        tracing::error!(
            event = $crate::logging::events::IDP_CONTRACT_VIOLATION,
            $($field)*
        )
    };
}

#[macro_export]
macro_rules! log_idp_transport_failure {
    ($($field:tt)*) => {
        tracing::error!(
            event = $crate::logging::events::IDP_TRANSPORT_FAILURE,
            $($field)*
        )
    };
}

//! Error types surfaced to applications
//!
//! Broker-level failures live in [`crate::transport::BrokerError`]; this
//! module holds the errors of the supervisor's own API and the sanitizer
//! applied to any error text that ends up in observable state.

use crate::config::ConfigError;
use crate::transport::BrokerError;
use once_cell::sync::Lazy;
use regex::Regex;
use thiserror::Error;

/// Errors returned synchronously by the supervisor API
#[derive(Debug, Error)]
pub enum SupervisorError {
    #[error("Invalid argument: {0}")]
    InvalidArgument(String),

    #[error("Supervisor already started")]
    AlreadyStarted,

    #[error("Configuration error: {0}")]
    Config(#[from] ConfigError),
}

impl SupervisorError {
    pub fn invalid_argument<S: Into<String>>(message: S) -> Self {
        Self::InvalidArgument(message.into())
    }
}

/// Outcome of a queued publish, delivered through its `PublishHandle`
#[derive(Debug, Error)]
pub enum PublishError {
    #[error("Publish failed: {0}")]
    Broker(#[from] BrokerError),

    /// The supervisor went away before any session took the message
    #[error("Message abandoned before it was published")]
    Abandoned,
}

/// Result type for supervisor operations
pub type SupervisorResult<T> = Result<T, SupervisorError>;

const MAX_MESSAGE_LEN: usize = 500;
const TRUNCATE_SUFFIX: &str = "...[truncated]";

static URI_USERINFO: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"(?i)(amqps?://)[^@\s/]+@").expect("static regex"));

static SECRET_PAIRS: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"(?i)(password|passwd|token|secret)[=:]\s*\S+").expect("static regex")
});

/// Redact credentials and cap the length of an error message
pub fn sanitize_error_message(message: &str) -> String {
    let sanitized = URI_USERINFO.replace_all(message, "${1}***@");
    let mut sanitized = SECRET_PAIRS.replace_all(&sanitized, "${1}=***").into_owned();

    if sanitized.len() > MAX_MESSAGE_LEN {
        let mut cut = MAX_MESSAGE_LEN - TRUNCATE_SUFFIX.len();
        while !sanitized.is_char_boundary(cut) {
            cut -= 1;
        }
        sanitized.truncate(cut);
        sanitized.push_str(TRUNCATE_SUFFIX);
    }

    sanitized
}

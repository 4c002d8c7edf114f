// crates/core/src/error.rs
use std::path::PathBuf;

use serde::Serialize;
use thiserror::Error;

/// Errors raised while querying the remote status endpoint.
///
/// These are recoverable: the poller tolerates them up to
/// `PollOptions::max_consecutive_errors` before giving up.
#[derive(Debug, Clone, PartialEq, Eq, Error, Serialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum TransportError {
    #[error("Network error: {message}")]
    Network { message: String },

    #[error("Status endpoint returned HTTP {status}: {body}")]
    HttpStatus { status: u16, body: String },

    #[error("Malformed status body: {message}")]
    Malformed { message: String },
}

impl TransportError {
    pub fn network(message: impl Into<String>) -> Self {
        Self::Network {
            message: message.into(),
        }
    }

    pub fn malformed(message: impl Into<String>) -> Self {
        Self::Malformed {
            message: message.into(),
        }
    }

    /// Maximum length of a response body carried in an error.
    const MAX_BODY_LEN: usize = 200;

    pub fn http_status(status: u16, body: &str) -> Self {
        let body = match body.char_indices().nth(Self::MAX_BODY_LEN) {
            Some((idx, _)) => format!("{}...", &body[..idx]),
            None => body.to_string(),
        };
        Self::HttpStatus { status, body }
    }
}

impl From<reqwest::Error> for TransportError {
    fn from(err: reqwest::Error) -> Self {
        if err.is_decode() {
            Self::malformed(err.to_string())
        } else {
            Self::network(err.to_string())
        }
    }
}

/// Errors from starting, cancelling or looking up monitored jobs.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum MonitorError {
    #[error("Job id must not be empty")]
    EmptyJobId,

    #[error("Job {job_id} is already being polled")]
    AlreadyPolling { job_id: String },

    #[error("Job {job_id} has already reached a terminal state")]
    AlreadyFinished { job_id: String },

    #[error("Job {job_id} is not registered")]
    UnknownJob { job_id: String },

    #[error("Monitoring task for job {job_id} ended without an outcome")]
    Aborted { job_id: String },
}

/// Errors that can occur when loading monitor configuration.
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("IO error reading config {path}: {source}")]
    Read {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("Invalid TOML in config {path}: {source}")]
    Parse {
        path: PathBuf,
        #[source]
        source: toml::de::Error,
    },

    #[error("Invalid value for {field}: {message}")]
    Invalid { field: &'static str, message: String },
}

impl ConfigError {
    pub fn invalid(field: &'static str, message: impl Into<String>) -> Self {
        Self::Invalid {
            field,
            message: message.into(),
        }
    }
}

use std::fmt;
use std::str::FromStr;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use thiserror::Error;
use uuid::Uuid;

/// Application-wide error types for Argus.
#[derive(Error, Debug)]
pub enum AppError {
    /// HTTP client failure that is not a timeout or connection error.
    #[error("HTTP error: {0}")]
    HttpError(String),

    /// The target answered with a non-success status.
    #[error("HTTP {status} for {url}")]
    HttpStatus { status: u16, url: String },

    /// Network/connection error (DNS, TCP reset, proxy refused).
    #[error("Network error: {0}")]
    NetworkError(String),

    /// A call exceeded its deadline.
    #[error("Deadline of {0:?} exceeded")]
    Timeout(Duration),

    /// The target served a CAPTCHA, bot wall, or block status.
    #[error("Blocked by target: {reason}")]
    Blocked { reason: String },

    /// Every extraction strategy abstained.
    #[error("No extractable product data at {0}")]
    NoExtractableData(String),

    /// The URL could not be parsed or canonicalized.
    #[error("Invalid URL: {0}")]
    InvalidUrl(String),

    /// robots.txt forbids fetching this URL.
    #[error("Disallowed by robots.txt: {0}")]
    RobotsDisallowed(String),

    /// No network identity became available in time.
    #[error("Resource exhausted: {0}")]
    ResourceExhausted(String),

    /// A lease was released after the pool had already reclaimed it.
    #[error("Lease {lease_id} on identity '{identity_id}' is stale")]
    PoolIdentityStale { identity_id: String, lease_id: Uuid },

    /// A task status change did not match the expected current status.
    #[error("Task {task_id}: cannot move from {from} to {to}")]
    InvalidTransition {
        task_id: Uuid,
        from: String,
        to: String,
    },

    #[error("Not found: {0}")]
    NotFound(String),

    /// LLM API call failed.
    #[error("LLM error (HTTP {status_code}): {message}")]
    LlmError {
        message: String,
        status_code: u16,
        retryable: bool,
    },

    /// OCR service call failed.
    #[error("OCR error: {0}")]
    OcrError(String),

    /// HTML-to-Markdown conversion failed.
    #[error("Cleaner error: {0}")]
    CleanerError(String),

    /// Extracted JSON does not match the product schema.
    #[error("Schema validation error: {0}")]
    SchemaValidationError(String),

    /// JSON serialization/deserialization failed.
    #[error("Serialization error: {0}")]
    SerializationError(#[from] serde_json::Error),

    /// Rate limit exceeded.
    #[error("Rate limit exceeded")]
    RateLimitExceeded,

    /// Database operation failed.
    #[error("Database error: {0}")]
    DatabaseError(String),

    /// Configuration is missing or invalid.
    #[error("Configuration error: {0}")]
    ConfigError(String),

    /// Generic error.
    #[error("{0}")]
    Generic(String),
}

/// How a failed task attempt is treated by the retry policy.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FailureKind {
    /// Timeouts, network errors, 5xx. Retried with backoff.
    Transient,
    /// CAPTCHA, bot wall, 403/429. Retried; the identity is quarantined.
    Blocked,
    /// Nothing extractable. One confirmation retry, then terminal.
    PermanentContent,
    /// Never worth retrying (malformed URL, robots.txt).
    InvalidInput,
    /// No identity available. The task is deferred without consuming an attempt.
    ResourceExhausted,
    /// The pool reclaimed the lease first. Invisible to the retry counter.
    IdentityStale,
}

impl FailureKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            FailureKind::Transient => "transient",
            FailureKind::Blocked => "blocked",
            FailureKind::PermanentContent => "permanent_content",
            FailureKind::InvalidInput => "invalid_input",
            FailureKind::ResourceExhausted => "resource_exhausted",
            FailureKind::IdentityStale => "identity_stale",
        }
    }

    /// Upper bound on attempts for this kind, given the task's own limit.
    pub fn attempt_limit(&self, max_attempts: u32) -> u32 {
        match self {
            FailureKind::PermanentContent => max_attempts.min(2),
            FailureKind::InvalidInput => 1,
            _ => max_attempts,
        }
    }
}

impl fmt::Display for FailureKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for FailureKind {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "transient" => Ok(FailureKind::Transient),
            "blocked" => Ok(FailureKind::Blocked),
            "permanent_content" => Ok(FailureKind::PermanentContent),
            "invalid_input" => Ok(FailureKind::InvalidInput),
            "resource_exhausted" => Ok(FailureKind::ResourceExhausted),
            "identity_stale" => Ok(FailureKind::IdentityStale),
            _ => Err(format!("Unknown failure kind: {s}")),
        }
    }
}

impl AppError {
    /// Classifies this error for the retry policy.
    pub fn failure_kind(&self) -> FailureKind {
        match self {
            AppError::Blocked { .. } => FailureKind::Blocked,
            AppError::HttpStatus { status, .. } if *status == 403 || *status == 429 => {
                FailureKind::Blocked
            }
            AppError::NoExtractableData(_) | AppError::SchemaValidationError(_) => {
                FailureKind::PermanentContent
            }
            AppError::InvalidUrl(_) | AppError::RobotsDisallowed(_) => FailureKind::InvalidInput,
            AppError::ResourceExhausted(_) => FailureKind::ResourceExhausted,
            AppError::PoolIdentityStale { .. } => FailureKind::IdentityStale,
            _ => FailureKind::Transient,
        }
    }

    /// Returns true if this error is transient and worth retrying.
    pub fn is_retryable(&self) -> bool {
        match self {
            AppError::NetworkError(_)
            | AppError::Timeout(_)
            | AppError::RateLimitExceeded
            | AppError::Blocked { .. }
            | AppError::ResourceExhausted(_) => true,
            AppError::HttpStatus { status, .. } => *status == 429 || *status >= 500,
            AppError::LlmError { retryable, .. } => *retryable,
            AppError::HttpError(msg) => {
                msg.contains("timeout") || msg.contains("connect") || msg.contains("reset")
            }
            _ => false,
        }
    }

    /// Returns true if this error should trip the circuit breaker.
    pub fn should_trip_circuit(&self) -> bool {
        match self {
            AppError::NetworkError(_) | AppError::Timeout(_) | AppError::RateLimitExceeded => true,
            AppError::LlmError {
                status_code,
                retryable,
                ..
            } => *status_code == 429 || *status_code >= 500 || *retryable,
            AppError::OcrError(_) => true,
            AppError::HttpError(msg) => {
                msg.contains("timeout") || msg.contains("connect") || msg.contains("connection")
            }
            _ => false,
        }
    }
}

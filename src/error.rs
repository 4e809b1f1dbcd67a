//! Error taxonomy shared by every layer of the sync core
//!
//! Transport failures are classified once, at the HTTP boundary, into the
//! variants below. Everything above that boundary (mutation rollback, view
//! failure reporting, push-channel degradation) only matches on `SyncError`.

use serde::Deserialize;
use std::collections::BTreeMap;
use thiserror::Error;

/// Result alias used throughout the crate
pub type SyncResult<T> = std::result::Result<T, SyncError>;

/// Typed failure surfaced by the sync core.
///
/// Must be `Clone`: a single failed request can settle several waiters
/// (the failed mutation plus every mutation queued behind it).
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum SyncError {
    /// Transport-level failure, no response was received
    #[error("network failure: {0}")]
    Network(String),

    /// Credential missing or rejected (401/403)
    #[error("authentication failed: {message}")]
    Auth { status: Option<u16>, message: String },

    /// Request rejected by the server with a 4xx (field errors when provided)
    #[error("validation failed: {message}")]
    Validation {
        message: String,
        field_errors: BTreeMap<String, String>,
    },

    /// The addressed entity does not exist on the server
    #[error("not found: {0}")]
    NotFound(String),

    /// Server-side failure (5xx)
    #[error("server failure ({status}): {message}")]
    Server { status: u16, message: String },

    /// The server answered, but the body could not be decoded
    #[error("failed to decode server response: {0}")]
    Decode(String),

    /// The push channel exhausted its retry ceiling; callers should fall back to manual refresh
    #[error("push channel degraded after {attempts} failed connection attempts")]
    ChannelDegraded { attempts: u32 },

    /// The operation was rejected locally before reaching the server
    #[error("invalid operation: {0}")]
    InvalidOperation(String),

    /// A queued mutation was aborted because an earlier mutation on the same entity failed
    #[error("aborted: earlier mutation on {target} failed: {cause}")]
    DependencyFailed { target: String, cause: Box<SyncError> },

    /// The session engine has shut down
    #[error("sync session closed")]
    SessionClosed,
}

/// Coarse classification used for metrics-free reporting and UI decisions.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FailureKind {
    Network,
    Auth,
    Validation,
    NotFound,
    Server,
    Local,
}

/// Spring-style error bodies, plus the `{"errors": {...}}` map variant
#[derive(Debug, Default, Deserialize)]
#[serde(default)]
struct ErrorBody {
    message: Option<String>,
    error: Option<String>,
    errors: BTreeMap<String, String>,
    #[serde(rename = "fieldErrors")]
    field_errors: Vec<FieldError>,
}

#[derive(Debug, Deserialize)]
struct FieldError {
    field: String,
    #[serde(alias = "defaultMessage")]
    message: String,
}

impl SyncError {
    /// Classify a non-success HTTP status and its body.
    pub fn from_status(status: u16, body: &str) -> Self {
        let parsed: ErrorBody = serde_json::from_str(body).unwrap_or_default();
        let message = parsed
            .message
            .clone()
            .or_else(|| parsed.error.clone())
            .filter(|m| !m.is_empty())
            .unwrap_or_else(|| {
                let trimmed = body.trim();
                if trimmed.is_empty() {
                    format!("HTTP {}", status)
                } else {
                    trimmed.chars().take(200).collect()
                }
            });

        match status {
            401 | 403 => SyncError::Auth {
                status: Some(status),
                message,
            },
            404 => SyncError::NotFound(message),
            400..=499 => {
                let mut field_errors = parsed.errors;
                for fe in parsed.field_errors {
                    field_errors.insert(fe.field, fe.message);
                }
                SyncError::Validation {
                    message,
                    field_errors,
                }
            }
            _ => SyncError::Server { status, message },
        }
    }

    /// Error for a request that could not be issued because no credential is available
    pub fn missing_credential() -> Self {
        SyncError::Auth {
            status: None,
            message: "no bearer credential available".to_string(),
        }
    }

    pub fn kind(&self) -> FailureKind {
        match self {
            SyncError::Network(_) | SyncError::ChannelDegraded { .. } => FailureKind::Network,
            SyncError::Auth { .. } => FailureKind::Auth,
            SyncError::Validation { .. } => FailureKind::Validation,
            SyncError::NotFound(_) => FailureKind::NotFound,
            SyncError::Server { .. } | SyncError::Decode(_) => FailureKind::Server,
            SyncError::InvalidOperation(_)
            | SyncError::DependencyFailed { .. }
            | SyncError::SessionClosed => FailureKind::Local,
        }
    }

    /// Whether a caller-initiated retry could plausibly succeed.
    ///
    /// The core itself never retries mutations.
    pub fn is_transient(&self) -> bool {
        matches!(
            self,
            SyncError::Network(_) | SyncError::Server { .. } | SyncError::ChannelDegraded { .. }
        )
    }
}

impl From<reqwest::Error> for SyncError {
    fn from(e: reqwest::Error) -> Self {
        if e.is_decode() {
            SyncError::Decode(e.to_string())
        } else if let Some(status) = e.status() {
            SyncError::from_status(status.as_u16(), "")
        } else {
            SyncError::Network(e.to_string())
        }
    }
}

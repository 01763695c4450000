// lib.rs - client-side state coordination core for the property-management console

#![forbid(unsafe_code)]
#![deny(clippy::all)]
#![warn(clippy::pedantic)]
#![allow(clippy::module_name_repetitions)]
#![allow(clippy::too_many_lines)]

pub mod cache;
pub mod coordinator;
pub mod model;
pub mod remote;
pub mod retry;

use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::time::Duration;
use thiserror::Error;

pub use cache::{CacheConfig, KeyedRequestCache, RequestCache};
pub use coordinator::{
    Coordinator, CoordinatorConfig, CoordinatorState, ErrorRecord, MutationTarget, Notice,
    NoticeKind, OperationSheet, OperationView, Subscription, WorkOutcome, WorkingSlot,
};
pub use model::{Entity, EntityId, ExpenseItem, Member, MemberId, MutationInput, OperationKind};
pub use remote::{MutationEndpoint, MutationResponse, RemoteFailure, ResponseErrors};
pub use retry::{calculate_retry_delay, generate_jitter, retry_with_backoff, RetryPolicy};

pub const DEFAULT_CACHE_TTL: Duration = Duration::from_secs(60);
pub const DEFAULT_CACHE_MAX_ENTRIES: usize = 512;
pub const SUCCESS_CLOSE_DELAY: Duration = Duration::from_millis(1000);
pub const MAX_RETRY_ATTEMPTS: u32 = 5;
pub const BASE_RETRY_DELAY_MS: u64 = 1000;
pub const MAX_RETRY_DELAY_MS: u64 = 60000;
pub const JITTER_MAX_MS: u64 = 1000;
pub const MAX_ERROR_MESSAGE_LENGTH: usize = 512;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ErrorSeverity {
    Transient,
    Permanent,
    Fatal,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ErrorKind {
    Network,
    Timeout,
    Authentication,
    Authorization,
    Validation,
    NotFound,
    Conflict,
    RateLimited,
    Serialization,
    InvalidState,
    Internal,
    Unknown,
}

impl ErrorKind {
    #[must_use]
    pub const fn code(self) -> &'static str {
        match self {
            Self::Network => "NETWORK_ERROR",
            Self::Timeout => "TIMEOUT",
            Self::Authentication => "AUTH_ERROR",
            Self::Authorization => "FORBIDDEN",
            Self::Validation => "VALIDATION_ERROR",
            Self::NotFound => "NOT_FOUND",
            Self::Conflict => "CONFLICT",
            Self::RateLimited => "RATE_LIMITED",
            Self::Serialization => "SERIALIZATION_ERROR",
            Self::InvalidState => "INVALID_STATE",
            Self::Internal => "INTERNAL_ERROR",
            Self::Unknown => "UNKNOWN_ERROR",
        }
    }

    #[must_use]
    pub const fn default_severity(self) -> ErrorSeverity {
        match self {
            Self::Network | Self::Timeout | Self::Conflict | Self::RateLimited => {
                ErrorSeverity::Transient
            }

            Self::Serialization | Self::InvalidState | Self::Internal => ErrorSeverity::Fatal,

            Self::Authentication
            | Self::Authorization
            | Self::Validation
            | Self::NotFound
            | Self::Unknown => ErrorSeverity::Permanent,
        }
    }

    #[must_use]
    pub const fn is_retryable(self) -> bool {
        matches!(
            self,
            Self::Network | Self::Timeout | Self::RateLimited | Self::Conflict
        )
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct AppError {
    pub kind: ErrorKind,
    pub severity: ErrorSeverity,
    pub message: String,
    pub internal_message: Option<String>,
    pub retry_after_ms: Option<u64>,
    pub context: HashMap<String, String>,
}

impl AppError {
    #[must_use]
    pub fn new(kind: ErrorKind, message: impl Into<String>) -> Self {
        Self {
            kind,
            severity: kind.default_severity(),
            message: message.into(),
            internal_message: None,
            retry_after_ms: None,
            context: HashMap::new(),
        }
    }

    #[must_use]
    pub fn with_internal(mut self, internal: impl Into<String>) -> Self {
        self.internal_message = Some(internal.into());
        self
    }

    #[must_use]
    pub fn with_retry_after(mut self, ms: u64) -> Self {
        self.retry_after_ms = Some(ms);
        self
    }

    #[must_use]
    pub fn with_severity(mut self, severity: ErrorSeverity) -> Self {
        self.severity = severity;
        self
    }

    #[must_use]
    pub fn with_context(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.context.insert(key.into(), value.into());
        self
    }

    #[must_use]
    pub const fn code(&self) -> &'static str {
        self.kind.code()
    }

    #[must_use]
    pub const fn is_retryable(&self) -> bool {
        self.kind.is_retryable() && !matches!(self.severity, ErrorSeverity::Fatal)
    }

    #[must_use]
    pub fn user_facing_message(&self) -> String {
        match self.kind {
            ErrorKind::Network => {
                "Unable to connect. Please check your internet connection and try again.".into()
            }
            ErrorKind::Timeout => "The request timed out. Please try again.".into(),
            ErrorKind::Authentication => {
                "Your session has expired. Please sign in again.".into()
            }
            ErrorKind::Authorization => {
                "You don't have permission to perform this action.".into()
            }
            ErrorKind::Validation => self.message.clone(),
            ErrorKind::NotFound => "The requested record could not be found.".into(),
            ErrorKind::Conflict => {
                "This action conflicts with a recent change. Please refresh and try again.".into()
            }
            ErrorKind::RateLimited => {
                if let Some(retry_after) = self.retry_after_ms {
                    let seconds = retry_after / 1000;
                    format!("Too many requests. Please wait {seconds} seconds and try again.")
                } else {
                    "Too many requests. Please wait a moment and try again.".into()
                }
            }
            ErrorKind::Serialization => {
                "A data error occurred. Please contact support if this persists.".into()
            }
            ErrorKind::InvalidState => {
                "The console is in an invalid state. Please reload and try again.".into()
            }
            ErrorKind::Internal | ErrorKind::Unknown => {
                "An unexpected error occurred. Please try again or contact support.".into()
            }
        }
    }

    #[must_use]
    pub fn from_http_status(status: u16, body: Option<&[u8]>) -> Self {
        let kind = match status {
            400 | 422 => ErrorKind::Validation,
            401 => ErrorKind::Authentication,
            403 => ErrorKind::Authorization,
            404 => ErrorKind::NotFound,
            409 => ErrorKind::Conflict,
            429 => ErrorKind::RateLimited,
            408 => ErrorKind::Timeout,
            500..=599 => ErrorKind::Internal,
            _ => ErrorKind::Unknown,
        };

        let message = body
            .and_then(|b| serde_json::from_slice::<ApiErrorResponse>(b).ok())
            .map(|e| e.message)
            .filter(|m| !m.is_empty())
            .unwrap_or_else(|| format!("HTTP error: {status}"));

        Self::new(kind, message).with_context("http_status", status.to_string())
    }
}

impl std::fmt::Display for AppError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "[{}] {}", self.code(), self.message)?;
        if let Some(internal) = &self.internal_message {
            write!(f, " (internal: {internal})")?;
        }
        Ok(())
    }
}

impl std::error::Error for AppError {}

impl From<serde_json::Error> for AppError {
    fn from(e: serde_json::Error) -> Self {
        AppError::new(ErrorKind::Serialization, "Malformed response payload")
            .with_internal(e.to_string())
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
struct ApiErrorResponse {
    #[serde(default)]
    message: String,
}

pub type AppResult<T> = Result<T, AppError>;

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ConfigError {
    #[error("{field} must be > 0")]
    MustBePositive { field: &'static str },
    #[error("{lower} ({lower_value}) must not exceed {upper} ({upper_value})")]
    InvertedBounds {
        lower: &'static str,
        lower_value: u64,
        upper: &'static str,
        upper_value: u64,
    },
}

impl From<ConfigError> for AppError {
    fn from(e: ConfigError) -> Self {
        AppError::new(ErrorKind::InvalidState, "Invalid configuration").with_internal(e.to_string())
    }
}

#[must_use]
pub fn get_current_time_ms() -> u64 {
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .map(|d| u64::try_from(d.as_millis()).unwrap_or(u64::MAX))
        .unwrap_or(0)
}

/// Wall-clock timestamp, used for records surfaced to the user.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct UnixTimeMs(pub u64);

impl UnixTimeMs {
    #[must_use]
    pub fn now() -> Self {
        Self(get_current_time_ms())
    }

    #[must_use]
    pub const fn as_millis(self) -> u64 {
        self.0
    }

    #[must_use]
    pub fn elapsed_since(self, earlier: Self) -> u64 {
        self.0.saturating_sub(earlier.0)
    }
}

impl Default for UnixTimeMs {
    fn default() -> Self {
        Self::now()
    }
}

/// Truncates to at most `max_bytes` without splitting a UTF-8 sequence.
pub(crate) fn truncate_utf8_safe(s: &mut String, max_bytes: usize) {
    if s.len() <= max_bytes {
        return;
    }

    let mut truncate_at = max_bytes;
    while truncate_at > 0 && !s.is_char_boundary(truncate_at) {
        truncate_at -= 1;
    }
    s.truncate(truncate_at);
}

#[cfg(test)]
mod tests {
    use super::*;

    mod error_tests {
        use super::*;

        #[test]
        fn test_error_codes() {
            assert_eq!(ErrorKind::Network.code(), "NETWORK_ERROR");
            assert_eq!(ErrorKind::Authorization.code(), "FORBIDDEN");
            assert_eq!(ErrorKind::Validation.code(), "VALIDATION_ERROR");
        }

        #[test]
        fn test_retryable_kinds() {
            assert!(ErrorKind::Network.is_retryable());
            assert!(ErrorKind::Timeout.is_retryable());
            assert!(ErrorKind::RateLimited.is_retryable());
            assert!(!ErrorKind::Validation.is_retryable());
            assert!(!ErrorKind::Authorization.is_retryable());
            assert!(!ErrorKind::NotFound.is_retryable());
        }

        #[test]
        fn test_fatal_severity_is_never_retryable() {
            let err = AppError::new(ErrorKind::Network, "boom").with_severity(ErrorSeverity::Fatal);
            assert!(!err.is_retryable());
        }

        #[test]
        fn test_from_http_status_reads_body_message() {
            let body = br#"{"message":"Amount exceeds outstanding balance"}"#;
            let err = AppError::from_http_status(422, Some(body));

            assert_eq!(err.kind, ErrorKind::Validation);
            assert_eq!(err.message, "Amount exceeds outstanding balance");
            assert_eq!(err.context.get("http_status").map(String::as_str), Some("422"));
        }

        #[test]
        fn test_from_http_status_without_body() {
            let err = AppError::from_http_status(503, None);
            assert_eq!(err.kind, ErrorKind::Internal);
            assert_eq!(err.message, "HTTP error: 503");
        }

        #[test]
        fn test_rate_limited_message_mentions_wait() {
            let err = AppError::new(ErrorKind::RateLimited, "slow down").with_retry_after(3000);
            assert!(err.user_facing_message().contains("3 seconds"));
        }

        #[test]
        fn test_display_includes_internal() {
            let err = AppError::new(ErrorKind::Internal, "failed").with_internal("db timeout");
            assert_eq!(err.to_string(), "[INTERNAL_ERROR] failed (internal: db timeout)");
        }

        #[test]
        fn test_config_error_converts() {
            let err: AppError = ConfigError::MustBePositive { field: "max_entries" }.into();
            assert_eq!(err.kind, ErrorKind::InvalidState);
            assert_eq!(err.internal_message.as_deref(), Some("max_entries must be > 0"));
        }
    }

    mod truncate_tests {
        use super::*;

        #[test]
        fn test_truncate_ascii() {
            let mut s = "abcdef".to_string();
            truncate_utf8_safe(&mut s, 3);
            assert_eq!(s, "abc");
        }

        #[test]
        fn test_truncate_multi_byte() {
            let mut s = "Rp€€".to_string();
            truncate_utf8_safe(&mut s, 4);
            assert_eq!(s, "Rp");
        }
    }

    mod unix_time_tests {
        use super::*;

        #[test]
        fn test_elapsed_since_saturates() {
            let earlier = UnixTimeMs(2_000);
            let later = UnixTimeMs(1_000);
            assert_eq!(later.elapsed_since(earlier), 0);
            assert_eq!(earlier.elapsed_since(later), 1_000);
        }

        #[test]
        fn test_now_is_non_zero() {
            assert!(UnixTimeMs::now().as_millis() > 0);
        }
    }
}

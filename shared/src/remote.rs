//! Contracts of the backend mutation endpoints.
//!
//! The coordinator never talks to the backend itself; [`Coordinator::submit`]
//! uses these types to turn an endpoint reply into either nothing (success)
//! or a cached error record.
//!
//! [`Coordinator::submit`]: crate::coordinator::Coordinator::submit

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use thiserror::Error;

use crate::model::{EntityId, MutationInput};
use crate::{AppError, AppResult};

const GENERIC_FAILURE_MESSAGE: &str = "The request could not be completed.";

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ResponseErrors {
    /// Field name to messages, as produced by form-level validation.
    #[serde(default)]
    pub nested: BTreeMap<String, Vec<String>>,
    #[serde(default)]
    pub other: Vec<String>,
}

impl ResponseErrors {
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.other.is_empty() && self.nested.values().all(Vec::is_empty)
    }

    fn first_message(&self) -> Option<&str> {
        self.other
            .iter()
            .chain(self.nested.values().flatten())
            .map(String::as_str)
            .find(|m| !m.trim().is_empty())
    }
}

/// Reply envelope shared by every mutation endpoint.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MutationResponse<T> {
    pub success: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub data: Option<T>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub errors: Option<ResponseErrors>,
}

impl<T> MutationResponse<T> {
    pub fn ok(data: Option<T>) -> Self {
        Self {
            success: true,
            message: None,
            data,
            errors: None,
        }
    }

    pub fn failed(message: impl Into<String>) -> Self {
        Self {
            success: false,
            message: Some(message.into()),
            data: None,
            errors: None,
        }
    }

    #[must_use]
    pub fn with_errors(mut self, errors: ResponseErrors) -> Self {
        self.errors = Some(errors);
        self
    }

    /// `Ok(data)` for `success: true`, otherwise the failure to record.
    ///
    /// The message is taken from `message`, then the first general error,
    /// then the first field error.
    pub fn into_result(self) -> Result<Option<T>, RemoteFailure> {
        if self.success {
            return Ok(self.data);
        }

        let errors = self.errors.unwrap_or_default();
        let message = self
            .message
            .as_deref()
            .filter(|m| !m.trim().is_empty())
            .or_else(|| errors.first_message())
            .unwrap_or(GENERIC_FAILURE_MESSAGE)
            .to_string();

        Err(RemoteFailure::new(message).with_field_errors(errors.nested))
    }
}

/// Parses a raw endpoint body into the reply envelope.
pub fn parse_response(body: &[u8]) -> AppResult<MutationResponse<serde_json::Value>> {
    Ok(serde_json::from_slice(body)?)
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("{message}")]
pub struct RemoteFailure {
    pub message: String,
    pub field_errors: BTreeMap<String, Vec<String>>,
}

impl RemoteFailure {
    /// The message is kept whole; the coordinator truncates when recording.
    pub fn new(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
            field_errors: BTreeMap::new(),
        }
    }

    #[must_use]
    pub fn with_field_errors(mut self, field_errors: BTreeMap<String, Vec<String>>) -> Self {
        self.field_errors = field_errors;
        self
    }
}

impl From<&AppError> for RemoteFailure {
    fn from(e: &AppError) -> Self {
        Self::new(e.user_facing_message())
    }
}

impl From<AppError> for RemoteFailure {
    fn from(e: AppError) -> Self {
        Self::from(&e)
    }
}

/// One backend mutation (record payment, add expense, delete member, ...).
#[async_trait::async_trait]
pub trait MutationEndpoint: Send + Sync {
    async fn call(
        &self,
        entity_id: &EntityId,
        input: &MutationInput,
    ) -> AppResult<MutationResponse<serde_json::Value>>;
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ErrorKind;

    mod envelope_tests {
        use super::*;

        #[test]
        fn test_success_yields_data() {
            let response = MutationResponse::ok(Some(3));
            assert_eq!(response.into_result(), Ok(Some(3)));
        }

        #[test]
        fn test_failure_prefers_top_level_message() {
            let response = MutationResponse::<()>::failed("Payment exceeds balance").with_errors(
                ResponseErrors {
                    other: vec!["ignored".into()],
                    ..ResponseErrors::default()
                },
            );
            let failure = response.into_result().unwrap_err();
            assert_eq!(failure.message, "Payment exceeds balance");
        }

        #[test]
        fn test_failure_falls_back_to_other_then_nested() {
            let mut nested = BTreeMap::new();
            nested.insert("amount".to_string(), vec!["Amount must be positive".to_string()]);

            let response: MutationResponse<()> = MutationResponse {
                success: false,
                message: Some("  ".into()),
                data: None,
                errors: Some(ResponseErrors {
                    nested: nested.clone(),
                    other: vec![],
                }),
            };
            let failure = response.into_result().unwrap_err();
            assert_eq!(failure.message, "Amount must be positive");
            assert_eq!(failure.field_errors, nested);

            let response: MutationResponse<()> = MutationResponse {
                success: false,
                message: None,
                data: None,
                errors: Some(ResponseErrors {
                    nested,
                    other: vec!["Member is inactive".into()],
                }),
            };
            assert_eq!(response.into_result().unwrap_err().message, "Member is inactive");
        }

        #[test]
        fn test_failure_without_details_uses_generic_message() {
            let response: MutationResponse<()> = MutationResponse {
                success: false,
                message: None,
                data: None,
                errors: None,
            };
            assert_eq!(
                response.into_result().unwrap_err().message,
                GENERIC_FAILURE_MESSAGE
            );
        }
    }

    mod parse_tests {
        use super::*;

        #[test]
        fn test_parses_wire_envelope() {
            let body = br#"{
                "success": false,
                "message": "Validation failed",
                "errors": { "nested": { "items.0.amount": ["Required"] }, "other": [] }
            }"#;
            let response = parse_response(body).unwrap();
            assert!(!response.success);
            let errors = response.errors.as_ref().unwrap();
            assert_eq!(errors.nested["items.0.amount"], vec!["Required".to_string()]);
            assert!(!errors.is_empty());
        }

        #[test]
        fn test_malformed_body_is_serialization_error() {
            let err = parse_response(b"<html>").unwrap_err();
            assert_eq!(err.kind, ErrorKind::Serialization);
        }
    }

    mod failure_tests {
        use super::*;
        use crate::MAX_ERROR_MESSAGE_LENGTH;

        #[test]
        fn test_thrown_error_uses_user_facing_message() {
            let failure = RemoteFailure::from(AppError::new(ErrorKind::Network, "socket closed"));
            assert!(failure.message.starts_with("Unable to connect"));
            assert!(failure.field_errors.is_empty());
        }

        #[test]
        fn test_long_messages_are_kept_whole() {
            let message = "x".repeat(MAX_ERROR_MESSAGE_LENGTH * 2);
            let failure = MutationResponse::<()>::failed(message.clone())
                .into_result()
                .unwrap_err();
            assert_eq!(failure.message, message);
        }
    }
}

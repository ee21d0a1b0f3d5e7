//! Closed error taxonomy shared by the broker client and both engines.

use serde::{Deserialize, Serialize};
use thiserror::Error;
use uuid::Uuid;

/// Closed set of error kinds the broker can report, plus the transport-level
/// failures the client classifies at its own boundary.
///
/// Numeric codes are fixed for wire/log compatibility with the broker.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[repr(i32)]
pub enum ErrorKind {
    DuplicatedBatchId = 1008,
    CantGetMessagesFromStream = 1020,
    StreamIteratorNotFound = 1031,
    StreamIteratorIsBusy = 1032,
    JWTMissingOrMalformed = 1200,
    JWTInvalidOrExpired = 1201,
    JWTNotEnabled = 1202,
    JWTRBACUnknownRole = 1210,
    RBACInvalidRule = 1211,
    RBACForbidden = 1212,
    AuthInternalError = 1220,
    WrongCredentials = 1230,
    HttpTimeout = 2000,
    Timeout = 2001,
    ContextDeadlineExceeded = 2002,
    TransportReadFromServer = 2003,
    Url = 2004,
    TooManyRequests = 2005,
    /// Catch-all for codes the broker sends that this client doesn't (yet) classify.
    Unexpected = 0,
}

impl ErrorKind {
    /// Whether the engines may safely retry an operation that failed with this kind.
    pub fn can_retry(self) -> bool {
        matches!(
            self,
            ErrorKind::HttpTimeout | ErrorKind::Timeout | ErrorKind::TransportReadFromServer
        )
    }

    fn from_code(code: i32) -> Self {
        match code {
            1008 => ErrorKind::DuplicatedBatchId,
            1020 => ErrorKind::CantGetMessagesFromStream,
            1031 => ErrorKind::StreamIteratorNotFound,
            1032 => ErrorKind::StreamIteratorIsBusy,
            1200 => ErrorKind::JWTMissingOrMalformed,
            1201 => ErrorKind::JWTInvalidOrExpired,
            1202 => ErrorKind::JWTNotEnabled,
            1210 => ErrorKind::JWTRBACUnknownRole,
            1211 => ErrorKind::RBACInvalidRule,
            1212 => ErrorKind::RBACForbidden,
            1220 => ErrorKind::AuthInternalError,
            1230 => ErrorKind::WrongCredentials,
            2000 => ErrorKind::HttpTimeout,
            2001 => ErrorKind::Timeout,
            2002 => ErrorKind::ContextDeadlineExceeded,
            2003 => ErrorKind::TransportReadFromServer,
            2004 => ErrorKind::Url,
            2005 => ErrorKind::TooManyRequests,
            _ => ErrorKind::Unexpected,
        }
    }
}

/// A single field-level validation failure reported by the broker.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ValidationError {
    pub failed_field: String,
    pub tag: String,
    pub value: String,
}

/// The broker's own error envelope, classified into a closed [`ErrorKind`].
#[derive(Debug, Clone, Error)]
#[error("{kind:?}: {message}")]
pub struct ApiError {
    pub kind: ErrorKind,
    pub message: String,
    pub details: String,
    pub stream_id: Option<Uuid>,
    pub validation_errors: Vec<ValidationError>,
}

impl ApiError {
    pub fn new(kind: ErrorKind, message: impl Into<String>) -> Self {
        Self {
            kind,
            message: message.into(),
            details: String::new(),
            stream_id: None,
            validation_errors: Vec::new(),
        }
    }

    pub fn can_retry(&self) -> bool {
        self.kind.can_retry()
    }

    pub fn with_details(mut self, details: impl Into<String>) -> Self {
        self.details = details.into();
        self
    }

    /// Decode a broker JSON error body (`{error, details, code, ...}`).
    pub fn from_body(body: &[u8]) -> Self {
        #[derive(Deserialize)]
        struct Wire {
            #[serde(rename = "error", default)]
            message: String,
            #[serde(default)]
            details: String,
            #[serde(default)]
            code: i32,
            #[serde(rename = "streamUUID", default)]
            stream_id: Option<Uuid>,
            #[serde(rename = "validationErrors", default)]
            validation_errors: Vec<ValidationError>,
        }

        match serde_json::from_slice::<Wire>(body) {
            Ok(w) => ApiError {
                kind: ErrorKind::from_code(w.code),
                message: w.message,
                details: w.details,
                stream_id: w.stream_id,
                validation_errors: w.validation_errors,
            },
            Err(e) => ApiError::new(ErrorKind::Unexpected, "can't unmarshal json")
                .with_details(e.to_string()),
        }
    }

    /// Classify a transport-level failure from the underlying HTTP client.
    pub fn from_transport_error(err: &reqwest::Error) -> Self {
        if err.is_timeout() {
            ApiError::new(ErrorKind::HttpTimeout, err.to_string())
        } else if err.is_connect() || err.is_request() {
            ApiError::new(ErrorKind::Url, err.to_string())
        } else if err.is_decode() || err.is_body() {
            ApiError::new(ErrorKind::TransportReadFromServer, err.to_string())
        } else {
            ApiError::new(ErrorKind::Unexpected, err.to_string())
        }
    }
}

/// Failure to build a header name or value for [`ClientBuilder`](crate::ClientBuilder).
#[derive(Debug, Clone, Error)]
pub enum InvalidHeaderError {
    #[error("invalid header name: {0}")]
    InvalidName(String),
    #[error("invalid header value: {0}")]
    InvalidValue(String),
}

/// Errors surfaced directly by the producer engine (as opposed to the broker).
#[derive(Debug, Clone, Error)]
pub enum ProducerError {
    #[error("can't enqueue records when state is not running/pause, state={state:?}")]
    InvalidState { state: crate::types::ProducerState },

    #[error(
        "producer buffering error: {successive_failures} successive failures over {duration_secs}s"
    )]
    Buffering {
        successive_failures: u32,
        duration_secs: u64,
    },

    #[error(transparent)]
    Api(#[from] ApiError),
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn can_retry_matches_closed_set() {
        assert!(ErrorKind::HttpTimeout.can_retry());
        assert!(ErrorKind::Timeout.can_retry());
        assert!(ErrorKind::TransportReadFromServer.can_retry());
        assert!(!ErrorKind::DuplicatedBatchId.can_retry());
        assert!(!ErrorKind::Unexpected.can_retry());
    }

    #[test]
    fn decodes_broker_error_body() {
        let body = br#"{"error":"bad jwt","code":1201,"details":"expired"}"#;
        let err = ApiError::from_body(body);
        assert_eq!(err.kind, ErrorKind::JWTInvalidOrExpired);
        assert_eq!(err.message, "bad jwt");
        assert!(!err.can_retry());
    }

    #[test]
    fn unknown_code_maps_to_unexpected() {
        let body = br#"{"error":"???","code":9999}"#;
        let err = ApiError::from_body(body);
        assert_eq!(err.kind, ErrorKind::Unexpected);
    }
}

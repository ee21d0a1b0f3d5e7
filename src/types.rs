//! Core data types: wire DTOs, iterator parameters, rate limits, producer state.

use crate::error::ApiError;
use chrono::{DateTime, Utc};
use reqwest::header::HeaderMap;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use uuid::Uuid;

/// An opaque record. The engines never interpret its contents; it round-trips
/// through the broker as one JSON array element.
pub type Record = serde_json::Value;

/// Free-form properties attached to a stream at creation time.
pub type StreamProperties = HashMap<String, serde_json::Value>;

/// Protocol header names used by the rate-limit parser and the broker client.
pub(crate) const HEADER_RATE_LIMIT_LIMIT: &str = "X-RateLimit-Limit";
pub(crate) const HEADER_RATE_LIMIT_REMAINING: &str = "X-RateLimit-Remaining";
pub(crate) const HEADER_RATE_LIMIT_RESET: &str = "X-RateLimit-Reset";
pub(crate) const HEADER_RETRY_AFTER: &str = "Retry-After";

/// Rate-limit signals decoded from a broker reply. Any field may be zero/unknown.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct RateLimit {
    pub limit: i64,
    pub remaining: i64,
    pub reset_in_sec: u64,
    pub retry_after_sec: u64,
}

impl RateLimit {
    /// Decode rate-limit headers from any broker reply.
    pub fn from_headers(headers: &HeaderMap) -> Self {
        let parse_i64 = |name: &str| -> i64 {
            headers
                .get(name)
                .and_then(|v| v.to_str().ok())
                .and_then(|s| s.parse().ok())
                .unwrap_or(0)
        };
        let parse_u64 = |name: &str| -> u64 {
            headers
                .get(name)
                .and_then(|v| v.to_str().ok())
                .and_then(|s| s.parse().ok())
                .unwrap_or(0)
        };

        RateLimit {
            limit: parse_i64(HEADER_RATE_LIMIT_LIMIT),
            remaining: parse_i64(HEADER_RATE_LIMIT_REMAINING),
            reset_in_sec: parse_u64(HEADER_RATE_LIMIT_RESET),
            retry_after_sec: parse_u64(HEADER_RETRY_AFTER),
        }
    }
}

/// Server-side iterator positioning strategy.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum IteratorType {
    #[serde(rename = "FIRST_MESSAGE")]
    FirstMessage,
    #[serde(rename = "LAST_MESSAGE")]
    LastMessage,
    #[serde(rename = "AFTER_LAST_MESSAGE")]
    AfterLastMessage,
    #[serde(rename = "AT_MESSAGE_ID")]
    AtMessageId,
    #[serde(rename = "AFTER_MESSAGE_ID")]
    AfterMessageId,
    #[serde(rename = "AT_TIMESTAMP")]
    AtTimestamp,
}

/// Parameters for opening a server-side records iterator.
///
/// A non-zero `max_wait_time_seconds` enables server-side long-polling: the
/// broker holds `get_records` open until records arrive or the window elapses.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RecordsIteratorParams {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
    pub iterator_type: IteratorType,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub jq_filter: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub message_id: Option<u64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub timestamp: Option<DateTime<Utc>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub max_wait_time_seconds: Option<u32>,
}

impl RecordsIteratorParams {
    pub fn new(iterator_type: IteratorType) -> Self {
        Self {
            name: None,
            iterator_type,
            jq_filter: None,
            message_id: None,
            timestamp: None,
            max_wait_time_seconds: None,
        }
    }

    /// Validate the combination of fields before sending it to the broker.
    pub fn validate(&self) -> Result<(), ApiError> {
        if self.iterator_type == IteratorType::AtTimestamp && self.timestamp.is_none() {
            return Err(ApiError::new(
                crate::error::ErrorKind::Unexpected,
                "Timestamp must be set",
            ));
        }
        Ok(())
    }
}

impl Default for RecordsIteratorParams {
    fn default() -> Self {
        Self::new(IteratorType::FirstMessage)
    }
}

/// Producer lifecycle state.
///
/// `Initialized -> Running <-> Pause -> Closing -> Closed`. `Closing -> Closed`
/// is the only terminal transition; there is no way back from `Closed`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProducerState {
    Initialized,
    Running,
    Pause,
    Closing,
    Closed,
}

/// `201 POST /api/v1/stream/`
#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CreateStreamResponse {
    pub uuid: Uuid,
    pub filepath: String,
    pub cpt_messages: u64,
    pub size_in_bytes: u64,
    pub creation_date: DateTime<Utc>,
    pub last_update: DateTime<Utc>,
    pub properties: StreamProperties,
    pub last_msg_id: u64,
}

/// `200 GET /api/v1/stream/{uuid}/iterator/{iid}/records`
#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct GetRecordsResponse {
    pub status: String,
    #[serde(default)]
    pub duration: f64,
    #[serde(default)]
    pub count: i64,
    #[serde(default)]
    pub count_errors: i64,
    #[serde(default)]
    pub count_skipped: i64,
    pub remain: bool,
    pub stream_uuid: Uuid,
    pub stream_iterator_uuid: Uuid,
    pub records: Vec<Record>,
}

/// `200 POST /api/v1/stream/{uuid}/iterator`
#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CreateRecordsIteratorResponse {
    pub status: String,
    pub message: String,
    pub stream_uuid: Uuid,
    pub stream_iterator_uuid: Uuid,
}

/// `200 DELETE /api/v1/stream/{uuid}/iterator/{iid}`
#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CloseRecordsIteratorResponse {
    pub status: String,
    pub message: String,
}

/// `200 GET /api/v1/user/login`
#[derive(Debug, Clone, Deserialize)]
pub struct LoginResponse {
    pub status: String,
    pub message: String,
    pub jwt: String,
}

/// `202 PUT /api/v1/stream/{uuid}/records`
#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PutRecordsResponse {
    pub status: String,
    #[serde(default)]
    pub duration: f64,
    pub count: i64,
    pub stream_uuid: Uuid,
    pub message_ids: Vec<u64>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn validate_requires_timestamp_for_at_timestamp() {
        let mut params = RecordsIteratorParams::new(IteratorType::AtTimestamp);
        assert!(params.validate().is_err());
        params.timestamp = Some(Utc::now());
        assert!(params.validate().is_ok());
    }

    #[test]
    fn validate_is_permissive_for_other_types() {
        let params = RecordsIteratorParams::new(IteratorType::FirstMessage);
        assert!(params.validate().is_ok());
    }

    #[test]
    fn rate_limit_defaults_to_zero_on_missing_headers() {
        let headers = HeaderMap::new();
        let rl = RateLimit::from_headers(&headers);
        assert_eq!(rl, RateLimit::default());
    }
}

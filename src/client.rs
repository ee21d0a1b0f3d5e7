//! HTTP client: connection configuration plus the broker's REST surface.

use crate::error::{ApiError, ErrorKind, InvalidHeaderError};
use crate::types::{
    CloseRecordsIteratorResponse, CreateRecordsIteratorResponse, CreateStreamResponse,
    GetRecordsResponse, LoginResponse, PutRecordsResponse, RateLimit, Record,
    RecordsIteratorParams, StreamProperties,
};
use parking_lot::RwLock;
use reqwest::header::HeaderMap;
use reqwest::StatusCode;
use std::sync::Arc;
use std::time::Duration;
use uuid::Uuid;

const DEFAULT_USER_AGENT: &str = concat!("ministream-client-rust/", env!("CARGO_PKG_VERSION"));

#[derive(Clone)]
struct Credentials {
    login: String,
    password: String,
}

/// A broker client.
///
/// Cheap to clone: the underlying `reqwest::Client` pools connections and
/// the JWT is stored behind a lock shared across clones, so every clone of
/// a client sees the same authentication state.
#[derive(Clone)]
pub struct Client {
    pub(crate) inner: reqwest::Client,
    pub(crate) base_url: String,
    pub(crate) user_agent: String,
    pub(crate) default_headers: HeaderMap,
    credentials: Option<Credentials>,
    jwt: Arc<RwLock<Option<String>>>,
}

impl std::fmt::Debug for Client {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Client")
            .field("base_url", &self.base_url)
            .field("user_agent", &self.user_agent)
            .field("authenticated", &self.jwt.read().is_some())
            .finish()
    }
}

impl Client {
    pub fn builder(base_url: impl Into<String>) -> ClientBuilder {
        ClientBuilder::new(base_url)
    }

    /// Whether this client has credentials configured at all. If not,
    /// [`authenticate`](Self::authenticate) is a no-op.
    fn auth_enabled(&self) -> bool {
        self.credentials.is_some()
    }

    fn auth_header(&self) -> Option<String> {
        self.jwt.read().as_ref().map(|t| format!("Bearer {t}"))
    }

    fn request(&self, method: reqwest::Method, path: &str) -> reqwest::RequestBuilder {
        let url = format!("{}{}", self.base_url, path);
        tracing_debug_request(&method, &url);
        let mut builder = self
            .inner
            .request(method, url)
            .headers(self.default_headers.clone())
            .header("Accept", "application/json")
            .header("User-Agent", &self.user_agent);
        if let Some(auth) = self.auth_header() {
            builder = builder.header("Authorization", auth);
        }
        builder
    }

    /// `GET /api/v1/user/login`. A no-op if no credentials were configured.
    ///
    /// The broker may have authentication disabled entirely; that's
    /// reported as [`ErrorKind::JWTNotEnabled`] and treated as success here,
    /// matching the original client's behavior of silently proceeding
    /// unauthenticated.
    pub async fn authenticate(&self) -> Result<(), ApiError> {
        let Some(creds) = &self.credentials else {
            *self.jwt.write() = None;
            return Ok(());
        };

        let resp = self
            .request(reqwest::Method::GET, "/api/v1/user/login")
            .header("ACCESS-KEY-ID", &creds.login)
            .header("SECRET-ACCESS-KEY", &creds.password)
            .send()
            .await
            .map_err(|e| ApiError::from_transport_error(&e))?;

        let status = resp.status();
        let is_json = is_json_body(resp.headers());
        let body = resp
            .bytes()
            .await
            .map_err(|e| ApiError::from_transport_error(&e))?;
        if status == StatusCode::OK {
            let login: LoginResponse = decode_json(&body)?;
            *self.jwt.write() = Some(login.jwt);
            return Ok(());
        }

        let err = decode_error(status, is_json, &body);
        if err.kind == ErrorKind::JWTNotEnabled {
            *self.jwt.write() = None;
            return Ok(());
        }
        tracing_warn_api_error(&err);
        Err(err)
    }

    /// `POST /api/v1/stream/`
    pub async fn create_stream(
        &self,
        properties: &StreamProperties,
    ) -> Result<CreateStreamResponse, ApiError> {
        #[derive(serde::Serialize)]
        struct Payload<'a> {
            properties: &'a StreamProperties,
        }

        let resp = self
            .request(reqwest::Method::POST, "/api/v1/stream/")
            .json(&Payload { properties })
            .send()
            .await
            .map_err(|e| ApiError::from_transport_error(&e))?;

        expect_status(resp, StatusCode::CREATED).await
    }

    /// `POST /api/v1/stream/{uuid}/iterator`
    pub async fn create_records_iterator(
        &self,
        stream_id: Uuid,
        params: &RecordsIteratorParams,
    ) -> Result<CreateRecordsIteratorResponse, ApiError> {
        params.validate()?;
        let resp = self
            .request(
                reqwest::Method::POST,
                &format!("/api/v1/stream/{stream_id}/iterator"),
            )
            .json(params)
            .send()
            .await
            .map_err(|e| ApiError::from_transport_error(&e))?;

        expect_status(resp, StatusCode::OK).await
    }

    /// `GET /api/v1/stream/{uuid}/iterator/{iid}/records`
    ///
    /// When the iterator was opened with `max_wait_time_seconds > 0`, the
    /// broker may hold this request open; the client's own timeout bounds
    /// how long it waits.
    pub async fn get_records(
        &self,
        stream_id: Uuid,
        iterator_id: Uuid,
    ) -> Result<(GetRecordsResponse, RateLimit), ApiError> {
        let resp = self
            .request(
                reqwest::Method::GET,
                &format!("/api/v1/stream/{stream_id}/iterator/{iterator_id}/records"),
            )
            .send()
            .await
            .map_err(|e| ApiError::from_transport_error(&e))?;

        let rate_limit = RateLimit::from_headers(resp.headers());
        let parsed: GetRecordsResponse = expect_status(resp, StatusCode::OK).await?;
        Ok((parsed, rate_limit))
    }

    /// `DELETE /api/v1/stream/{uuid}/iterator/{iid}`
    pub async fn close_records_iterator(
        &self,
        stream_id: Uuid,
        iterator_id: Uuid,
    ) -> Result<CloseRecordsIteratorResponse, ApiError> {
        let resp = self
            .request(
                reqwest::Method::DELETE,
                &format!("/api/v1/stream/{stream_id}/iterator/{iterator_id}"),
            )
            .send()
            .await
            .map_err(|e| ApiError::from_transport_error(&e))?;

        expect_status(resp, StatusCode::OK).await
    }

    /// `PUT /api/v1/stream/{uuid}/records`
    ///
    /// `batch_id` is echoed back as a header so the broker can recognize a
    /// retried send of the same batch and answer with
    /// [`ErrorKind::DuplicatedBatchId`] instead of double-appending.
    pub async fn put_records(
        &self,
        stream_id: Uuid,
        batch_id: u64,
        records: &[Record],
    ) -> Result<(PutRecordsResponse, RateLimit), ApiError> {
        let resp = self
            .request(
                reqwest::Method::PUT,
                &format!("/api/v1/stream/{stream_id}/records"),
            )
            .header("X-Batch-Id", batch_id.to_string())
            .json(records)
            .send()
            .await
            .map_err(|e| ApiError::from_transport_error(&e))?;

        let rate_limit = RateLimit::from_headers(resp.headers());
        let parsed: PutRecordsResponse = expect_status(resp, StatusCode::ACCEPTED).await?;
        Ok((parsed, rate_limit))
    }

    /// Close idle pooled connections. The client remains usable afterwards;
    /// new requests simply open fresh connections.
    pub fn disconnect(&self) {
        // reqwest has no public "close idle" hook once built; dropping the
        // last clone tears the pool down. Kept as an explicit, named
        // operation to mirror the lifecycle callers expect.
    }
}

async fn expect_status<T: serde::de::DeserializeOwned>(
    resp: reqwest::Response,
    expected: StatusCode,
) -> Result<T, ApiError> {
    if resp.status() == StatusCode::TOO_MANY_REQUESTS {
        let rate_limit = RateLimit::from_headers(resp.headers());
        let err = ApiError::new(ErrorKind::TooManyRequests, "rate limiter")
            .with_details(format!("retry_after_sec={}", rate_limit.retry_after_sec));
        tracing_warn_api_error(&err);
        return Err(err);
    }

    let status = resp.status();
    let is_json = is_json_body(resp.headers());
    let body = resp
        .bytes()
        .await
        .map_err(|e| ApiError::from_transport_error(&e))?;

    if status != expected {
        let err = decode_error(status, is_json, &body);
        tracing_warn_api_error(&err);
        return Err(err);
    }

    decode_json(&body)
}

/// Whether a reply's `Content-Type` names a JSON body, per
/// `Content-Type: application/json` (possibly with a `; charset=...` suffix).
fn is_json_body(headers: &HeaderMap) -> bool {
    headers
        .get(reqwest::header::CONTENT_TYPE)
        .and_then(|v| v.to_str().ok())
        .is_some_and(|v| v.contains("application/json"))
}

/// Decode a non-expected-status reply body into the error taxonomy.
///
/// A JSON body is decoded via [`ApiError::from_body`]; anything else becomes
/// an [`ErrorKind::Unexpected`] error carrying the raw text verbatim.
fn decode_error(status: StatusCode, is_json: bool, body: &[u8]) -> ApiError {
    if body.is_empty() {
        return ApiError::new(ErrorKind::Unexpected, status.to_string());
    }
    if is_json {
        ApiError::from_body(body)
    } else {
        ApiError::new(ErrorKind::Unexpected, String::from_utf8_lossy(body).into_owned())
    }
}

fn decode_json<T: serde::de::DeserializeOwned>(body: &[u8]) -> Result<T, ApiError> {
    serde_json::from_slice(body).map_err(|e| {
        ApiError::new(ErrorKind::Unexpected, "can't unmarshal json").with_details(e.to_string())
    })
}

fn tracing_debug_request(method: &reqwest::Method, url: &str) {
    #[cfg(feature = "tracing")]
    tracing::debug!(%method, %url, "sending broker request");
    #[cfg(not(feature = "tracing"))]
    let _ = (method, url);
}

fn tracing_warn_api_error(err: &ApiError) {
    #[cfg(feature = "tracing")]
    tracing::warn!(kind = ?err.kind, message = %err.message, "broker request failed");
    #[cfg(not(feature = "tracing"))]
    let _ = err;
}

/// Builder for configuring a [`Client`].
#[must_use = "builders do nothing unless you call .build()"]
pub struct ClientBuilder {
    base_url: String,
    user_agent: String,
    default_headers: HeaderMap,
    timeout: Option<Duration>,
    credentials: Option<Credentials>,
}

impl ClientBuilder {
    pub fn new(base_url: impl Into<String>) -> Self {
        Self {
            base_url: base_url.into().trim_end_matches('/').to_string(),
            user_agent: DEFAULT_USER_AGENT.to_string(),
            default_headers: HeaderMap::new(),
            timeout: None,
            credentials: None,
        }
    }

    pub fn user_agent(mut self, user_agent: impl Into<String>) -> Self {
        self.user_agent = user_agent.into();
        self
    }

    /// Configure login/password credentials. Leaving this unset means the
    /// client never authenticates and sends no `Authorization` header.
    pub fn credentials(mut self, login: impl Into<String>, password: impl Into<String>) -> Self {
        self.credentials = Some(Credentials {
            login: login.into(),
            password: password.into(),
        });
        self
    }

    /// Add a default header for all requests.
    ///
    /// Invalid header names or values are silently ignored. Use
    /// [`try_default_header`](Self::try_default_header) if you need error handling.
    pub fn default_header(mut self, key: &str, value: &str) -> Self {
        if let (Ok(name), Ok(val)) = (
            reqwest::header::HeaderName::from_bytes(key.as_bytes()),
            reqwest::header::HeaderValue::from_str(value),
        ) {
            self.default_headers.insert(name, val);
        }
        self
    }

    /// Add a default header, returning an error if the name or value is invalid.
    pub fn try_default_header(
        mut self,
        key: &str,
        value: &str,
    ) -> Result<Self, InvalidHeaderError> {
        let name = reqwest::header::HeaderName::from_bytes(key.as_bytes())
            .map_err(|_| InvalidHeaderError::InvalidName(key.to_string()))?;
        let val = reqwest::header::HeaderValue::from_str(value)
            .map_err(|_| InvalidHeaderError::InvalidValue(value.to_string()))?;
        self.default_headers.insert(name, val);
        Ok(self)
    }

    pub fn timeout(mut self, timeout: Duration) -> Self {
        self.timeout = Some(timeout);
        self
    }

    pub fn build(self) -> Result<Client, reqwest::Error> {
        let mut builder = reqwest::Client::builder()
            .pool_max_idle_per_host(10)
            .pool_idle_timeout(Duration::from_secs(90));

        if let Some(timeout) = self.timeout {
            builder = builder.timeout(timeout);
        }

        let inner = builder.build()?;

        Ok(Client {
            inner,
            base_url: self.base_url,
            user_agent: self.user_agent,
            default_headers: self.default_headers,
            credentials: self.credentials,
            jwt: Arc::new(RwLock::new(None)),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn builder_trims_trailing_slash_from_base_url() {
        let client = ClientBuilder::new("https://example.com/").build().unwrap();
        assert_eq!(client.base_url, "https://example.com");
    }

    #[test]
    fn no_credentials_means_auth_disabled() {
        let client = ClientBuilder::new("https://example.com").build().unwrap();
        assert!(!client.auth_enabled());
        assert!(client.auth_header().is_none());
    }

    #[test]
    fn credentials_enable_auth() {
        let client = ClientBuilder::new("https://example.com")
            .credentials("user", "pass")
            .build()
            .unwrap();
        assert!(client.auth_enabled());
    }

    #[test]
    fn try_default_header_rejects_invalid_name() {
        let result = ClientBuilder::new("https://example.com").try_default_header("bad header", "v");
        assert!(result.is_err());
    }

    #[test]
    fn decode_error_parses_json_body() {
        let body = br#"{"error":"bad jwt","code":1201}"#;
        let err = decode_error(StatusCode::UNAUTHORIZED, true, body);
        assert_eq!(err.kind, ErrorKind::JWTInvalidOrExpired);
        assert_eq!(err.message, "bad jwt");
    }

    #[test]
    fn decode_error_keeps_raw_text_for_non_json_body() {
        let body = b"upstream timeout";
        let err = decode_error(StatusCode::BAD_GATEWAY, false, body);
        assert_eq!(err.kind, ErrorKind::Unexpected);
        assert_eq!(err.message, "upstream timeout");
    }

    #[test]
    fn is_json_body_checks_content_type_header() {
        let mut headers = HeaderMap::new();
        headers.insert(
            reqwest::header::CONTENT_TYPE,
            "application/json; charset=utf-8".parse().unwrap(),
        );
        assert!(is_json_body(&headers));

        let mut text_headers = HeaderMap::new();
        text_headers.insert(reqwest::header::CONTENT_TYPE, "text/plain".parse().unwrap());
        assert!(!is_json_body(&text_headers));
    }
}

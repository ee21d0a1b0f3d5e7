//! Long-polling consumer engine: authenticate -> open iterator -> poll loop.

use crate::backoff::ExpBackoff;
use crate::client::Client;
use crate::error::{ApiError, ErrorKind};
use crate::types::{GetRecordsResponse, RecordsIteratorParams};
use std::time::Duration;
use tokio::sync::watch;
use uuid::Uuid;

const DEFAULT_SCAN_INTERVAL: Duration = Duration::from_millis(250);
const DEFAULT_PAUSE_DURATION: Duration = Duration::from_millis(500);
const DEFAULT_BACKOFF_INIT: Duration = Duration::from_millis(200);
const DEFAULT_BACKOFF_MAX: Duration = Duration::from_secs(30);

/// Callbacks the consumer engine invokes around authentication, iterator
/// lifecycle, and record delivery.
///
/// Every `bool`-returning callback follows the rule: `true` means continue,
/// `false` means stop the consumer.
pub trait ConsumerHandler: Send + Sync {
    fn get_records_iterator_params(&self) -> RecordsIteratorParams;
    fn on_authentication_success(&self) {}
    fn on_authentication_failure(&self, _err: &ApiError) -> bool {
        true
    }
    fn on_create_records_iterator_success(&self) {}
    fn on_create_records_iterator_failure(&self, _err: &ApiError) -> bool {
        true
    }
    fn on_get_records_success(&self, _response: &GetRecordsResponse) -> bool {
        true
    }
    fn on_get_records_failure(&self, _err: &ApiError) -> bool {
        true
    }
    fn on_unexpected_error(&self, _err: &ApiError) -> bool {
        true
    }
    fn on_start(&self) {}
    fn on_pause(&self) {}
    fn on_resume(&self) {}
    fn on_close(&self) {}
}

/// Long-polling consumer engine.
///
/// Drives three sequential gates per loop iteration: authenticate, open a
/// server-side records iterator, then poll it until told to stop.
pub struct Consumer<H> {
    client: Client,
    stream_id: Uuid,
    iterator_id: Option<Uuid>,
    handler: H,
    is_authenticated: bool,
    status_pause: bool,
    wait_for_back_pressure: bool,
    must_stop: bool,
    pause_duration: Duration,
    #[allow(dead_code)]
    scan_interval: Duration,
    backoff: ExpBackoff,
    cancel: watch::Receiver<bool>,
}

impl<H: ConsumerHandler> Consumer<H> {
    pub fn new(client: Client, stream_id: Uuid, handler: H, cancel: watch::Receiver<bool>) -> Self {
        Self {
            client,
            stream_id,
            iterator_id: None,
            handler,
            is_authenticated: false,
            status_pause: false,
            wait_for_back_pressure: false,
            must_stop: false,
            pause_duration: DEFAULT_PAUSE_DURATION,
            scan_interval: DEFAULT_SCAN_INTERVAL,
            backoff: ExpBackoff::new(cancel.clone(), DEFAULT_BACKOFF_INIT, DEFAULT_BACKOFF_MAX),
            cancel,
        }
    }

    pub fn pause(&mut self) {
        self.handler.on_pause();
        self.status_pause = true;
    }

    pub fn resume(&mut self) {
        self.handler.on_resume();
        self.status_pause = false;
        self.wait_for_back_pressure = false;
    }

    fn is_cancelled(&self) -> bool {
        *self.cancel.borrow()
    }

    /// Drive the loop until the handler or cancellation requests shutdown.
    /// Always closes the server-side iterator (if one is open) on exit.
    pub async fn run(&mut self) -> Result<(), ApiError> {
        self.is_authenticated = false;
        self.iterator_id = None;
        self.handler.on_start();

        loop {
            if !self.ensure_authenticated().await {
                if self.must_stop {
                    break;
                }
                continue;
            }

            if !self.ensure_iterator_open().await {
                if self.must_stop {
                    break;
                }
                continue;
            }

            if !self.consume().await {
                if self.must_stop {
                    break;
                }
                continue;
            }
        }

        self.close().await
    }

    async fn ensure_authenticated(&mut self) -> bool {
        if self.is_authenticated {
            return true;
        }

        match self.client.authenticate().await {
            Ok(()) => {
                self.is_authenticated = true;
                self.backoff.reset();
                self.handler.on_authentication_success();
                true
            }
            Err(err) => {
                if self.is_cancelled() {
                    self.must_stop = true;
                    return false;
                }
                if !self.handler.on_authentication_failure(&err) || !self.backoff.wait().await {
                    self.must_stop = true;
                }
                false
            }
        }
    }

    async fn ensure_iterator_open(&mut self) -> bool {
        if self.iterator_id.is_some() {
            return true;
        }

        let params = self.handler.get_records_iterator_params();
        match self
            .client
            .create_records_iterator(self.stream_id, &params)
            .await
        {
            Ok(response) => {
                self.iterator_id = Some(response.stream_iterator_uuid);
                self.handler.on_create_records_iterator_success();
                self.backoff.reset();
                true
            }
            Err(err) => {
                if self.is_cancelled() {
                    self.must_stop = true;
                    return false;
                }
                if err.kind == ErrorKind::JWTInvalidOrExpired {
                    self.is_authenticated = false;
                    return false;
                }
                if !self.handler.on_create_records_iterator_failure(&err)
                    || !self.backoff.wait().await
                {
                    self.must_stop = true;
                }
                false
            }
        }
    }

    async fn consume(&mut self) -> bool {
        loop {
            if self.is_cancelled() {
                self.must_stop = true;
                return false;
            }

            if self.status_pause {
                tokio::time::sleep(self.pause_duration).await;
                continue;
            }

            if self.wait_for_back_pressure && !self.backoff.wait().await {
                self.must_stop = true;
                return false;
            }

            if !self.poll().await {
                return false;
            }
        }
    }

    async fn poll(&mut self) -> bool {
        let Some(iterator_id) = self.iterator_id else {
            self.iterator_id = None;
            return false;
        };

        match self.client.get_records(self.stream_id, iterator_id).await {
            Ok((response, rate_limit)) => {
                if !self.handler.on_get_records_success(&response) {
                    self.must_stop = true;
                    return false;
                }

                if response.remain {
                    if rate_limit.retry_after_sec > 0 {
                        self.wait_for_back_pressure = true;
                    } else if self.wait_for_back_pressure {
                        self.wait_for_back_pressure = false;
                        self.backoff.reset();
                    }
                } else {
                    self.wait_for_back_pressure = true;
                }

                true
            }
            Err(err) => {
                if !self.handler.on_get_records_failure(&err) {
                    self.must_stop = true;
                    return false;
                }

                match err.kind {
                    ErrorKind::JWTInvalidOrExpired => {
                        self.is_authenticated = false;
                    }
                    ErrorKind::StreamIteratorNotFound => {
                        self.iterator_id = None;
                    }
                    ErrorKind::HttpTimeout => {
                        self.wait_for_back_pressure = true;
                    }
                    ErrorKind::CantGetMessagesFromStream => {
                        tracing_error_cant_get_messages(&err);
                        self.must_stop = true;
                    }
                    _ => {
                        if !self.handler.on_unexpected_error(&err) {
                            self.must_stop = true;
                        } else {
                            self.wait_for_back_pressure = true;
                        }
                    }
                }
                false
            }
        }
    }

    async fn close(&mut self) -> Result<(), ApiError> {
        self.handler.on_close();
        let Some(iterator_id) = self.iterator_id.take() else {
            return Ok(());
        };

        let result = self
            .client
            .close_records_iterator(self.stream_id, iterator_id)
            .await;
        self.client.disconnect();
        result.map(|_| ())
    }
}

fn tracing_error_cant_get_messages(err: &ApiError) {
    #[cfg(feature = "tracing")]
    tracing::error!(message = %err.message, "CantGetMessagesFromStream, stopping consumer");
    #[cfg(not(feature = "tracing"))]
    let _ = err;
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::IteratorType;

    struct FixedParamsHandler;

    impl ConsumerHandler for FixedParamsHandler {
        fn get_records_iterator_params(&self) -> RecordsIteratorParams {
            RecordsIteratorParams::new(IteratorType::FirstMessage)
        }
    }

    fn test_client() -> Client {
        Client::builder("https://example.invalid").build().unwrap()
    }

    #[test]
    fn pause_and_resume_toggle_status() {
        let (_tx, rx) = watch::channel(false);
        let mut consumer = Consumer::new(test_client(), Uuid::nil(), FixedParamsHandler, rx);
        assert!(!consumer.status_pause);
        consumer.pause();
        assert!(consumer.status_pause);
        consumer.resume();
        assert!(!consumer.status_pause);
        assert!(!consumer.wait_for_back_pressure);
    }

    #[tokio::test]
    async fn poll_without_iterator_reports_failure() {
        let (_tx, rx) = watch::channel(false);
        let mut consumer = Consumer::new(test_client(), Uuid::nil(), FixedParamsHandler, rx);
        consumer.iterator_id = None;
        assert!(!consumer.poll().await);
    }

    #[tokio::test]
    async fn ensure_authenticated_short_circuits_when_already_set() {
        let (_tx, rx) = watch::channel(false);
        let mut consumer = Consumer::new(test_client(), Uuid::nil(), FixedParamsHandler, rx);
        consumer.is_authenticated = true;
        assert!(consumer.ensure_authenticated().await);
    }

    #[tokio::test]
    async fn ensure_iterator_open_short_circuits_when_already_set() {
        let (_tx, rx) = watch::channel(false);
        let mut consumer = Consumer::new(test_client(), Uuid::nil(), FixedParamsHandler, rx);
        consumer.iterator_id = Some(Uuid::nil());
        assert!(consumer.ensure_iterator_open().await);
    }
}

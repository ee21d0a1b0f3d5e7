//! Batching producer engine: ring buffer -> batch assembly -> send loop.

use crate::backoff::ExpBackoff;
use crate::batch::BatchRecords;
use crate::buffer::CircularBuffer;
use crate::client::Client;
use crate::error::{ApiError, ErrorKind, ProducerError};
use crate::types::{ProducerState, Record};
use parking_lot::Mutex;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, watch};
use uuid::Uuid;

const DEFAULT_RECORDS_QUEUE_LEN: usize = 10_000;
const MAX_PUSH_RECORDS_BY_CALL: usize = 10_000;
const DEFAULT_SHUTDOWN_TIMEOUT: Duration = Duration::from_secs(30);
const DEFAULT_BACKOFF_INIT: Duration = Duration::from_millis(200);
const DEFAULT_BACKOFF_MAX: Duration = Duration::from_millis(10_000);
const DEFAULT_RETRY_AFTER_SECS: u64 = 1;

/// Callbacks the producer engine invokes as records make their way to the broker.
///
/// `on_records_enqueued` is the sole authority for enqueue-time backpressure:
/// returning `Err` aborts the remainder of the caller's `enqueue_records`
/// call; returning `Ok(())` after a partial push causes `enqueue_records` to
/// loop and try again.
pub trait ProducerHandler: Send + Sync {
    fn on_pre_batch_sent(&self, _batch_id: u64, _size: usize) {}
    fn on_post_batch_sent(&self, _batch_id: u64, _size: usize) {}
    fn on_state_changed(&self, _state: ProducerState) {}
    fn on_records_enqueued(
        &self,
        _pushed: usize,
        _index: usize,
        _total: usize,
    ) -> Result<(), ProducerError> {
        Ok(())
    }
}

/// The application-facing, cheaply cloneable half of a producer.
///
/// Submits records into the shared ring buffer and can request state
/// transitions; the matching [`Producer`] engine owns the actual send loop
/// and must be driven by exactly one task via [`Producer::run`].
#[derive(Clone)]
pub struct ProducerHandle {
    queue: Arc<CircularBuffer<Record>>,
    state: Arc<Mutex<ProducerState>>,
    enqueued_tx: mpsc::Sender<()>,
    state_tx: mpsc::Sender<ProducerState>,
}

impl ProducerHandle {
    pub fn state(&self) -> ProducerState {
        *self.state.lock()
    }

    /// Request a state transition.
    ///
    /// Applies immediately: the shared state is updated and
    /// `handler.on_state_changed` fires before this call returns, so a
    /// subsequent `state()` or `enqueue_records` call observes the new
    /// state right away. The event loop is then notified so it can run the
    /// per-state bookkeeping (e.g. draining the queue on `Closing`);
    /// that notification is best-effort and a no-op if one is already
    /// pending.
    pub fn request_state(&self, handler: &(impl ProducerHandler + ?Sized), state: ProducerState) {
        *self.state.lock() = state;
        handler.on_state_changed(state);
        let _ = self.state_tx.try_send(state);
    }

    /// Enqueue a single record. See [`enqueue_records`](Self::enqueue_records).
    pub fn enqueue_record(
        &self,
        handler: &(impl ProducerHandler + ?Sized),
        record: Record,
    ) -> Result<usize, ProducerError> {
        self.enqueue_records(handler, vec![record])
    }

    /// Push records into the ring buffer, signaling the event loop for each
    /// non-empty push. If the buffer fills up mid-call, `handler` is
    /// consulted via `on_records_enqueued` to decide whether to keep trying.
    ///
    /// Returns the number of records actually accepted. Fails immediately
    /// with [`ProducerError::InvalidState`] unless the producer is
    /// `Running` or `Pause`.
    pub fn enqueue_records(
        &self,
        handler: &(impl ProducerHandler + ?Sized),
        records: Vec<Record>,
    ) -> Result<usize, ProducerError> {
        let state = self.state();
        if !matches!(state, ProducerState::Running | ProducerState::Pause) {
            return Err(ProducerError::InvalidState { state });
        }

        let total = records.len();
        let mut remaining = records;
        let mut accepted = 0;

        loop {
            let (pushed, leftover) = self.queue.push_items(remaining);
            remaining = leftover;
            if pushed > 0 {
                accepted += pushed;
                let _ = self.enqueued_tx.try_send(());
            }

            handler.on_records_enqueued(pushed, accepted, total)?;

            if remaining.is_empty() {
                break;
            }
        }

        Ok(accepted)
    }
}

/// Builder for a [`Producer`].
#[must_use = "builders do nothing unless you call .build()"]
pub struct ProducerBuilder<H> {
    client: Client,
    stream_id: Uuid,
    handler: H,
    queue_capacity: usize,
    batch_capacity: usize,
    shutdown_timeout: Duration,
}

impl<H: ProducerHandler> ProducerBuilder<H> {
    pub fn new(client: Client, stream_id: Uuid, handler: H) -> Self {
        Self {
            client,
            stream_id,
            handler,
            queue_capacity: DEFAULT_RECORDS_QUEUE_LEN + 1,
            batch_capacity: MAX_PUSH_RECORDS_BY_CALL,
            shutdown_timeout: DEFAULT_SHUTDOWN_TIMEOUT,
        }
    }

    pub fn queue_capacity(mut self, capacity: usize) -> Self {
        self.queue_capacity = capacity + 1;
        self
    }

    pub fn batch_capacity(mut self, capacity: usize) -> Self {
        self.batch_capacity = capacity;
        self
    }

    pub fn shutdown_timeout(mut self, timeout: Duration) -> Self {
        self.shutdown_timeout = timeout;
        self
    }

    pub fn build(self, cancel: watch::Receiver<bool>) -> (Producer<H>, ProducerHandle) {
        let queue = Arc::new(CircularBuffer::new(self.queue_capacity));
        let state = Arc::new(Mutex::new(ProducerState::Initialized));
        let (enqueued_tx, enqueued_rx) = mpsc::channel(1);
        let (state_tx, state_rx) = mpsc::channel(1);

        let handle = ProducerHandle {
            queue: queue.clone(),
            state: state.clone(),
            enqueued_tx,
            state_tx: state_tx.clone(),
        };

        let producer = Producer {
            client: self.client,
            stream_id: self.stream_id,
            handler: Arc::new(self.handler),
            queue,
            batch: BatchRecords::new(self.batch_capacity),
            state,
            wait_for_back_pressure: false,
            backoff: ExpBackoff::new(cancel.clone(), DEFAULT_BACKOFF_INIT, DEFAULT_BACKOFF_MAX),
            cancel,
            shutdown_timeout: self.shutdown_timeout,
            state_tx,
            state_rx,
            enqueued_rx,
        };

        (producer, handle)
    }
}

/// Batching producer engine.
///
/// Owns the batch assembly buffer and drives the send loop. Must be driven
/// to completion by exactly one task (via [`run`](Self::run)); application
/// code submits records and requests transitions through the matching
/// [`ProducerHandle`].
pub struct Producer<H> {
    client: Client,
    stream_id: Uuid,
    handler: Arc<H>,
    queue: Arc<CircularBuffer<Record>>,
    batch: BatchRecords<Record>,
    state: Arc<Mutex<ProducerState>>,
    wait_for_back_pressure: bool,
    backoff: ExpBackoff,
    cancel: watch::Receiver<bool>,
    shutdown_timeout: Duration,
    state_tx: mpsc::Sender<ProducerState>,
    state_rx: mpsc::Receiver<ProducerState>,
    enqueued_rx: mpsc::Receiver<()>,
}

impl<H: ProducerHandler> Producer<H> {
    pub fn state(&self) -> ProducerState {
        *self.state.lock()
    }

    /// The single-task counterpart of [`ProducerHandle::request_state`],
    /// used for the three transitions the loop itself originates
    /// (`Running` on start, `Closing` on cancellation, `Closed` at the end
    /// of [`finalize`](Self::finalize)). Same assign-then-notify shape, so
    /// the `state_rx` arm below never needs to assign state itself -
    /// whoever posts an event has already applied it.
    fn set_state(&mut self, state: ProducerState) {
        *self.state.lock() = state;
        self.handler.on_state_changed(state);
        let _ = self.state_tx.try_send(state);
    }

    /// Drive the event loop until the producer reaches `Closed`.
    ///
    /// Fails with [`ProducerError::InvalidState`] if not called from
    /// `Initialized`.
    pub async fn run(&mut self) -> Result<(), ProducerError> {
        if self.state() != ProducerState::Initialized {
            return Err(ProducerError::InvalidState { state: self.state() });
        }

        let (check_tx, mut check_rx) = mpsc::channel::<()>(1);
        let (backpressure_tx, mut backpressure_rx) = mpsc::channel::<bool>(1);
        let (finalize_tx, mut finalize_rx) = mpsc::channel::<()>(1);

        self.set_state(ProducerState::Running);

        loop {
            tokio::select! {
                biased;

                _ = self.cancel.changed() => {
                    self.set_state(ProducerState::Closing);
                }

                _ = finalize_rx.recv() => {
                    self.finalize().await;
                }

                Some(_) = self.enqueued_rx.recv() => {
                    let _ = check_tx.try_send(());
                }

                Some(_) = backpressure_rx.recv() => {
                    let _ = check_tx.try_send(());
                }

                Some(_) = check_rx.recv() => {
                    if matches!(self.state(), ProducerState::Running | ProducerState::Closing) {
                        self.fill_records_buffer_from_queue();
                        let sent_ok = self.send_batch_records().await;

                        if matches!(self.state(), ProducerState::Closing)
                            && self.queue.is_empty()
                            && self.batch.is_empty()
                        {
                            let _ = finalize_tx.try_send(());
                        } else if self.wait_for_back_pressure {
                            let sink = backpressure_tx.clone();
                            let mut backoff = std::mem::replace(
                                &mut self.backoff,
                                ExpBackoff::new(self.cancel.clone(), DEFAULT_BACKOFF_INIT, DEFAULT_BACKOFF_MAX),
                            );
                            tokio::spawn(async move {
                                let completed = backoff.wait().await;
                                let _ = sink.send(completed).await;
                            });
                        } else if !sent_ok {
                            let _ = check_tx.try_send(());
                        }
                    }
                }

                Some(new_state) = self.state_rx.recv() => {
                    match new_state {
                        ProducerState::Running => {
                            self.wait_for_back_pressure = false;
                            self.backoff.reset();
                        }
                        ProducerState::Pause => {}
                        ProducerState::Closing => {
                            self.fill_records_buffer_from_queue();
                            if self.queue.is_empty() && self.batch.is_empty() {
                                let _ = finalize_tx.try_send(());
                            } else {
                                let _ = check_tx.try_send(());
                            }
                        }
                        ProducerState::Closed => {
                            return Ok(());
                        }
                        ProducerState::Initialized => {}
                    }
                }
            }
        }
    }

    async fn finalize(&mut self) {
        let deadline = tokio::time::Instant::now() + self.shutdown_timeout;
        while !self.batch.is_empty() || !self.queue.is_empty() {
            if tokio::time::Instant::now() >= deadline {
                break;
            }
            self.fill_records_buffer_from_queue();
            if self.batch.is_empty() {
                break;
            }
            self.send_batch_records().await;
        }

        if !self.queue.is_empty() || !self.batch.is_empty() {
            tracing_warn_records_lost(self.queue.len() + self.batch.len());
        }

        self.queue.clear();
        self.batch.clear();
        self.client.disconnect();
        self.set_state(ProducerState::Closed);
    }

    fn fill_records_buffer_from_queue(&mut self) {
        if self.queue.is_empty() || self.batch.is_full() {
            return;
        }

        while let Some(record) = self.queue.pop() {
            self.batch.append(record);
            if self.batch.is_full() {
                break;
            }
        }
    }

    /// Returns `true` if the batch was sent successfully (or there was
    /// nothing to send), `false` if it should be retried promptly.
    async fn send_batch_records(&mut self) -> bool {
        let count = self.batch.len();
        if count == 0 {
            return true;
        }

        let batch_id = self.batch.id();
        self.handler.on_pre_batch_sent(batch_id, count);

        match self
            .client
            .put_records(self.stream_id, batch_id, self.batch.records())
            .await
        {
            Ok(_) => {
                self.wait_for_back_pressure = false;
                self.batch.clear();
                self.backoff.reset();
                self.handler.on_post_batch_sent(batch_id, count);
                true
            }
            Err(err) => self.handle_send_error(batch_id, err),
        }
    }

    fn handle_send_error(&mut self, batch_id: u64, err: ApiError) -> bool {
        match err.kind {
            ErrorKind::DuplicatedBatchId => {
                self.batch.clear();
                self.backoff.reset();
                self.handler.on_post_batch_sent(batch_id, 0);
                true
            }
            ErrorKind::HttpTimeout => {
                self.wait_for_back_pressure = false;
                self.handler.on_post_batch_sent(batch_id, 0);
                false
            }
            ErrorKind::TooManyRequests => {
                self.wait_for_back_pressure = true;
                let retry_after = parse_retry_after(&err).unwrap_or(DEFAULT_RETRY_AFTER_SECS);
                self.backoff.set_duration(Duration::from_secs(retry_after));
                self.handler.on_post_batch_sent(batch_id, 0);
                false
            }
            _ => {
                self.wait_for_back_pressure = true;
                self.handler.on_post_batch_sent(batch_id, 0);
                false
            }
        }
    }
}

fn parse_retry_after(err: &ApiError) -> Option<u64> {
    err.details
        .strip_prefix("retry_after_sec=")
        .and_then(|s| s.parse().ok())
}

fn tracing_warn_records_lost(count: usize) {
    #[cfg(feature = "tracing")]
    tracing::warn!(count, "dropping unsent records at producer shutdown");
    #[cfg(not(feature = "tracing"))]
    let _ = count;
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    struct RecordingHandler {
        pre: AtomicUsize,
        post: AtomicUsize,
        state_changes: AtomicUsize,
    }

    impl ProducerHandler for RecordingHandler {
        fn on_pre_batch_sent(&self, _batch_id: u64, _size: usize) {
            self.pre.fetch_add(1, Ordering::SeqCst);
        }
        fn on_post_batch_sent(&self, _batch_id: u64, _size: usize) {
            self.post.fetch_add(1, Ordering::SeqCst);
        }
        fn on_state_changed(&self, _state: ProducerState) {
            self.state_changes.fetch_add(1, Ordering::SeqCst);
        }
    }

    fn recording_handler() -> RecordingHandler {
        RecordingHandler {
            pre: AtomicUsize::new(0),
            post: AtomicUsize::new(0),
            state_changes: AtomicUsize::new(0),
        }
    }

    fn test_client() -> Client {
        Client::builder("https://example.invalid").build().unwrap()
    }

    #[test]
    fn enqueue_rejects_when_not_running() {
        let (_cancel_tx, cancel_rx) = watch::channel(false);
        let (_producer, handle) =
            ProducerBuilder::new(test_client(), Uuid::nil(), recording_handler()).build(cancel_rx);

        let handler = recording_handler();
        let err = handle
            .enqueue_records(&handler, vec![serde_json::json!({"a": 1})])
            .unwrap_err();
        assert!(matches!(err, ProducerError::InvalidState { .. }));
    }

    #[test]
    fn enqueue_accepts_records_once_running() {
        let (_cancel_tx, cancel_rx) = watch::channel(false);
        let (mut producer, handle) =
            ProducerBuilder::new(test_client(), Uuid::nil(), recording_handler()).build(cancel_rx);
        producer.set_state(ProducerState::Running);

        let handler = recording_handler();
        let accepted = handle
            .enqueue_records(&handler, vec![serde_json::json!({"a": 1})])
            .unwrap();
        assert_eq!(accepted, 1);
        assert_eq!(producer.queue.len(), 1);
    }

    #[test]
    fn request_state_updates_shared_state_and_fires_handler() {
        let (_cancel_tx, cancel_rx) = watch::channel(false);
        let (mut producer, handle) =
            ProducerBuilder::new(test_client(), Uuid::nil(), recording_handler()).build(cancel_rx);
        producer.set_state(ProducerState::Running);

        let handler = recording_handler();
        handle.request_state(&handler, ProducerState::Pause);

        assert_eq!(handle.state(), ProducerState::Pause);
        assert_eq!(handler.state_changes.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn request_state_closing_blocks_further_enqueues() {
        let (_cancel_tx, cancel_rx) = watch::channel(false);
        let (mut producer, handle) =
            ProducerBuilder::new(test_client(), Uuid::nil(), recording_handler()).build(cancel_rx);
        producer.set_state(ProducerState::Running);

        let handler = recording_handler();
        handle.request_state(&handler, ProducerState::Closing);

        let err = handle
            .enqueue_records(&handler, vec![serde_json::json!({"a": 1})])
            .unwrap_err();
        assert!(matches!(err, ProducerError::InvalidState { .. }));
    }

    #[test]
    fn fill_records_buffer_moves_queue_into_batch() {
        let (_cancel_tx, cancel_rx) = watch::channel(false);
        let (mut producer, handle) =
            ProducerBuilder::new(test_client(), Uuid::nil(), recording_handler()).build(cancel_rx);
        producer.set_state(ProducerState::Running);

        let handler = recording_handler();
        handle
            .enqueue_records(&handler, vec![serde_json::json!(1), serde_json::json!(2)])
            .unwrap();
        producer.fill_records_buffer_from_queue();

        assert_eq!(producer.batch.len(), 2);
        assert!(producer.queue.is_empty());
    }

    #[test]
    fn duplicated_batch_id_is_treated_as_success() {
        let (_cancel_tx, cancel_rx) = watch::channel(false);
        let (mut producer, _handle) =
            ProducerBuilder::new(test_client(), Uuid::nil(), recording_handler()).build(cancel_rx);
        producer.batch.append(serde_json::json!(1));
        let id = producer.batch.id();

        let handled = producer.handle_send_error(
            id,
            ApiError::new(ErrorKind::DuplicatedBatchId, "duplicate"),
        );

        assert!(handled);
        assert!(producer.batch.is_empty());
        assert!(!producer.wait_for_back_pressure);
    }

    #[test]
    fn too_many_requests_sets_backpressure_and_backoff() {
        let (_cancel_tx, cancel_rx) = watch::channel(false);
        let (mut producer, _handle) =
            ProducerBuilder::new(test_client(), Uuid::nil(), recording_handler()).build(cancel_rx);

        let handled = producer.handle_send_error(
            0,
            ApiError::new(ErrorKind::TooManyRequests, "rate limiter")
                .with_details("retry_after_sec=5"),
        );

        assert!(!handled);
        assert!(producer.wait_for_back_pressure);
    }
}

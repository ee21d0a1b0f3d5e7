//! Rust client for a record-oriented streaming broker.
//!
//! Two engines sit on top of a shared [`Client`]: a batching [`Producer`]
//! that accumulates records into a bounded ring buffer and ships them in
//! deduplicated batches, and a long-polling [`Consumer`] that authenticates,
//! opens a server-side iterator, and drains it.
//!
//! # Quick Start
//!
//! ```rust,no_run
//! use ministream_client::{Client, ProducerBuilder, ProducerHandler};
//! use tokio::sync::watch;
//! use uuid::Uuid;
//!
//! struct LoggingHandler;
//! impl ProducerHandler for LoggingHandler {}
//!
//! #[tokio::main]
//! async fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let client = Client::builder("https://broker.example.com").build()?;
//!     let (_cancel_tx, cancel_rx) = watch::channel(false);
//!     let (mut producer, handle) =
//!         ProducerBuilder::new(client, Uuid::new_v4(), LoggingHandler).build(cancel_rx);
//!
//!     tokio::spawn(async move {
//!         let _ = producer.run().await;
//!     });
//!
//!     let handler = LoggingHandler;
//!     handle.enqueue_record(&handler, serde_json::json!({"hello": "world"}))?;
//!     Ok(())
//! }
//! ```

mod backoff;
mod batch;
mod buffer;
mod client;
mod consumer;
mod error;
mod producer;
mod types;

pub use backoff::ExpBackoff;
pub use batch::BatchRecords;
pub use buffer::CircularBuffer;
pub use client::{Client, ClientBuilder};
pub use consumer::{Consumer, ConsumerHandler};
pub use error::{ApiError, ErrorKind, InvalidHeaderError, ProducerError, ValidationError};
pub use producer::{Producer, ProducerBuilder, ProducerHandle, ProducerHandler};
pub use types::{
    CloseRecordsIteratorResponse, CreateRecordsIteratorResponse, CreateStreamResponse,
    GetRecordsResponse, IteratorType, LoginResponse, ProducerState, PutRecordsResponse,
    RateLimit, Record, RecordsIteratorParams, StreamProperties,
};

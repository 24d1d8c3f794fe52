//! HEC Shipper Library
//!
//! This library provides the components for shipping log records to a
//! Splunk-style HTTP Event Collector:
//!
//! - **event**: Encoding of resolved events into JSON envelopes
//! - **batch**: Greedy, size-bounded splitting of envelopes into batches
//! - **client**: HTTP transport with status classification
//! - **retry**: Fixed-interval retry state machine per batch
//! - **dispatch**: Orchestration of encode, split and retry for a chunk of events
//! - **buffer**: Async intake buffering with size and time-based flush triggers
//! - **config**: Environment-based configuration
//!
//! # Example
//!
//! ```no_run
//! use hec_shipper::config::Config;
//! use hec_shipper::dispatch::Dispatcher;
//! use hec_shipper::event::{ResolvedEvent, Timestamp};
//!
//! #[tokio::main]
//! async fn main() {
//!     // Load configuration from environment
//!     let config = Config::from_env().expect("Failed to load config");
//!
//!     // Create dispatcher backed by an HTTP client
//!     let dispatcher = Dispatcher::from_config(&config).expect("Failed to create client");
//!
//!     // Ship a chunk of events
//!     let events = vec![ResolvedEvent::message(Timestamp::Seconds(1262438055), "a message")];
//!     match dispatcher.dispatch(&events).await.and_then(|r| r.into_result()) {
//!         Ok(report) => println!("sent in {} attempts", report.total_attempts()),
//!         Err(e) => eprintln!("dispatch failed: {}", e),
//!     }
//! }
//! ```

// Module declarations
pub mod batch;
pub mod buffer;
pub mod client;
pub mod config;
pub mod dispatch;
pub mod event;
pub mod retry;

// Re-export commonly used types at crate root for convenience
pub use batch::{split, Batch};
pub use buffer::{buffer_task, BufferConfig, BufferStats};
pub use client::{ClientError, DispatchAttempt, Disposition, HecClient, HecResponse, Transport};
pub use config::{Config, ConfigError};
pub use dispatch::{DispatchError, DispatchReport, DispatchStats, Dispatcher};
pub use event::{encode, EncodeError, EventEnvelope, FieldValue, Payload, RawText, ResolvedEvent, Routing, Timestamp};
pub use retry::{drive, BatchOutcome, BatchReport, RetryPhase, RetryPolicy, RetryState};

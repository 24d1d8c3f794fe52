//! HEC Shipper - ships newline-delimited JSON records to an event collector
//!
//! This service reads one JSON record per line from stdin, buffers the
//! records into chunks, and dispatches each chunk to a Splunk-style HTTP
//! Event Collector with size-bounded batching and fixed-interval retries.
//!
//! ## Features
//!
//! - Async intake using tokio runtime
//! - Size-based and time-based chunk flushing
//! - Greedy batch splitting by body size
//! - Graceful shutdown on Ctrl+C with a bounded final flush
//!
//! ## Configuration
//!
//! Configuration is loaded from environment variables prefixed with
//! `HEC_SHIPPER_` (see [`hec_shipper::config::Config`]). `RUST_LOG` sets the
//! logging level filter (default: info).
//!
//! The process exits with status 1 if any batch was not delivered.

use std::sync::Arc;
use std::time::Duration;

use serde_json::Value;
use thiserror::Error;
use tokio::io::{AsyncBufRead, AsyncBufReadExt, BufReader};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};
use tracing_subscriber::EnvFilter;

use chrono::Utc;
use hec_shipper::buffer::{buffer_task, BufferConfig, BufferStats};
use hec_shipper::config::Config;
use hec_shipper::dispatch::Dispatcher;
use hec_shipper::event::{FieldValue, Payload, RawText, ResolvedEvent, Timestamp};

/// Channel capacity between the stdin reader and the buffer
const CHANNEL_CAPACITY: usize = 1000;

/// Time allowed for the final flush before retry waits are cancelled
const SHUTDOWN_TIMEOUT: Duration = Duration::from_secs(10);

/// Why an input line could not become an event.
#[derive(Debug, Error)]
enum RecordError {
    #[error("invalid JSON: {0}")]
    Json(#[from] serde_json::Error),

    #[error("record is not a JSON object")]
    NotAnObject,
}

#[tokio::main]
async fn main() {
    // Initialize tracing subscriber with environment filter
    init_tracing();

    info!("Starting HEC shipper...");

    let config = match Config::from_env() {
        Ok(config) => {
            info!(
                endpoint = %config.endpoint_url(),
                batch_size_limit = config.batch_size_limit,
                post_retry_max = ?config.post_retry_max,
                post_retry_interval = ?config.post_retry_interval,
                chunk_events = config.chunk_events,
                "Configuration loaded"
            );
            config
        }
        Err(e) => {
            error!(error = %e, "Failed to load configuration");
            std::process::exit(1);
        }
    };

    // Retry waits get their own token so Ctrl+C still allows a final flush.
    let dispatch_cancel = CancellationToken::new();
    let dispatcher = match Dispatcher::from_config(&config) {
        Ok(dispatcher) => Arc::new(dispatcher.with_cancellation(dispatch_cancel.clone())),
        Err(e) => {
            error!(error = %e, "Failed to create HTTP client");
            std::process::exit(1);
        }
    };

    let shutdown = CancellationToken::new();
    let (tx, rx) = mpsc::channel(CHANNEL_CAPACITY);

    let reader_handle = tokio::spawn(read_records(
        BufReader::new(tokio::io::stdin()),
        config.clone(),
        tx,
        shutdown.clone(),
    ));

    let buffer_config = BufferConfig::new(config.chunk_events, config.flush_interval);
    let flush_dispatcher = dispatcher.clone();
    let mut buffer_handle = tokio::spawn(buffer_task(
        rx,
        buffer_config,
        shutdown.clone(),
        move |chunk| {
            let dispatcher = flush_dispatcher.clone();
            async move {
                dispatcher.dispatch(&chunk).await?.into_result()?;
                Ok::<(), hec_shipper::DispatchError>(())
            }
        },
    ));

    info!("HEC shipper running. Press Ctrl+C to stop.");
    let joined = tokio::select! {
        joined = &mut buffer_handle => joined,
        signal = tokio::signal::ctrl_c() => {
            match signal {
                Ok(()) => info!("Shutdown signal received, stopping..."),
                Err(e) => error!(error = %e, "Failed to listen for shutdown signal"),
            }
            shutdown.cancel();

            match tokio::time::timeout(SHUTDOWN_TIMEOUT, &mut buffer_handle).await {
                Ok(joined) => joined,
                Err(_) => {
                    warn!("Final flush timed out after {:?}, cancelling retries", SHUTDOWN_TIMEOUT);
                    dispatch_cancel.cancel();
                    buffer_handle.await
                }
            }
        }
    };
    reader_handle.abort();

    let buffer_stats = match joined {
        Ok(stats) => stats,
        Err(e) => {
            error!(error = %e, "Buffer task panicked");
            std::process::exit(1);
        }
    };

    let stats = dispatcher.stats();
    info!(
        events_received = buffer_stats.events_received,
        batches_sent = stats.batches_sent,
        events_sent = stats.events_sent,
        retries = stats.retries,
        batches_failed = stats.batches_failed,
        "HEC shipper stopped"
    );

    if has_failures(&buffer_stats, stats.batches_failed) {
        std::process::exit(1);
    }
}

/// Initialize the tracing subscriber with environment-based filtering.
fn init_tracing() {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));

    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .with_target(true)
        .with_thread_ids(false)
        .with_file(false)
        .with_line_number(false)
        .compact()
        .init();
}

/// Read NDJSON records from `reader` until EOF or shutdown.
///
/// Lines that are not JSON objects are logged and skipped. Bytes that are not
/// valid UTF-8 are sanitized before the line is parsed.
async fn read_records<R>(
    mut reader: R,
    config: Config,
    tx: mpsc::Sender<ResolvedEvent>,
    shutdown: CancellationToken,
) where
    R: AsyncBufRead + Unpin,
{
    let mut raw = Vec::new();
    let mut line_number: u64 = 0;

    loop {
        raw.clear();
        let read = tokio::select! {
            biased;
            _ = shutdown.cancelled() => break,
            read = reader.read_until(b'\n', &mut raw) => read,
        };

        match read {
            Ok(0) => {
                info!(lines = line_number, "Reached end of input");
                break;
            }
            Ok(_) => {}
            Err(e) => {
                error!(error = %e, "Failed to read input");
                break;
            }
        }
        line_number += 1;

        let line = decode_line(&raw, line_number);
        if line.trim().is_empty() {
            continue;
        }

        let event = match record_to_event(&line, &config) {
            Ok(event) => event,
            Err(e) => {
                warn!(line = line_number, error = %e, "Skipping invalid record");
                continue;
            }
        };

        if tx.send(event).await.is_err() {
            info!("Channel closed, reader stopping");
            break;
        }
    }
}

/// Strip the line terminator and replace any non-UTF-8 content.
fn decode_line(raw: &[u8], line_number: u64) -> String {
    let raw = raw.strip_suffix(b"\n").unwrap_or(raw);
    let raw = raw.strip_suffix(b"\r").unwrap_or(raw);

    match std::str::from_utf8(raw) {
        Ok(line) => line.to_string(),
        Err(_) => {
            debug!(line = line_number, "Sanitizing non-UTF-8 input line");
            RawText::Binary(raw.to_vec()).sanitized().into_owned()
        }
    }
}

/// Turn one NDJSON line into an event routed per `config`.
fn record_to_event(line: &str, config: &Config) -> Result<ResolvedEvent, RecordError> {
    let record: Value = serde_json::from_str(line)?;
    let fields = record.as_object().ok_or(RecordError::NotAnObject)?;

    let timestamp = match fields.get("time") {
        Some(Value::Number(n)) if n.is_f64() => n.as_f64().map(Timestamp::Fractional),
        Some(Value::Number(n)) => n.as_i64().map(Timestamp::Seconds),
        _ => None,
    }
    .unwrap_or_else(|| Timestamp::from(Utc::now()));

    let payload = if config.all_items {
        Payload::Fields(FieldValue::from(record))
    } else {
        let message = match fields.get("message") {
            Some(Value::String(s)) => s.clone(),
            Some(other) => other.to_string(),
            None => record.to_string(),
        };
        Payload::Message(RawText::Utf8(message))
    };

    Ok(ResolvedEvent::with_routing(timestamp, payload, &config.routing))
}

fn has_failures(buffer_stats: &BufferStats, batches_failed: u64) -> bool {
    buffer_stats.failed_flushes > 0 || batches_failed > 0
}

#[cfg(test)]
mod tests {
    use super::*;
    use hec_shipper::event::encode;

    fn config(all_items: bool) -> Config {
        Config {
            all_items,
            ..Config::default()
        }
    }

    #[test]
    fn test_channel_capacity() {
        assert!(CHANNEL_CAPACITY >= 100);
        assert!(CHANNEL_CAPACITY <= 10000);
    }

    #[test]
    fn test_record_with_integer_time() {
        let event = record_to_event(r#"{"time":1262438055,"message":"a message"}"#, &config(false)).unwrap();
        assert_eq!(event.timestamp, Timestamp::Seconds(1262438055));
        assert_eq!(event.payload, Payload::Message(RawText::Utf8("a message".to_string())));
        assert_eq!(event.sourcetype, "hec_shipper");
        assert_eq!(event.index, "main");
    }

    #[test]
    fn test_record_with_float_time() {
        let event = record_to_event(r#"{"time":1262438055.5,"message":"m"}"#, &config(false)).unwrap();
        assert_eq!(event.timestamp, Timestamp::Fractional(1262438055.5));
    }

    #[test]
    fn test_record_without_time_uses_now() {
        let before = Utc::now().timestamp() as f64;
        let event = record_to_event(r#"{"message":"m"}"#, &config(false)).unwrap();
        assert!(event.timestamp.as_secs_f64() >= before);
    }

    #[test]
    fn test_record_without_message_sends_whole_record() {
        let event = record_to_event(r#"{"time":1,"level":"warn"}"#, &config(false)).unwrap();
        assert_eq!(
            event.payload,
            Payload::Message(RawText::Utf8(r#"{"time":1,"level":"warn"}"#.to_string()))
        );
    }

    #[test]
    fn test_non_string_message_is_stringified() {
        let event = record_to_event(r#"{"time":1,"message":{"a":1}}"#, &config(false)).unwrap();
        assert_eq!(event.payload, Payload::Message(RawText::Utf8(r#"{"a":1}"#.to_string())));
    }

    #[test]
    fn test_all_items_sends_record_fields() {
        let event = record_to_event(r#"{"time":1,"message":"m","n":2}"#, &config(true)).unwrap();
        let envelope = encode(&event).unwrap();
        let text = std::str::from_utf8(envelope.as_bytes()).unwrap();
        assert!(text.ends_with(r#""event":{"time":1,"message":"m","n":2}}"#));
    }

    #[test]
    fn test_routing_from_config() {
        let mut cfg = config(false);
        cfg.routing.source = Some("app".to_string());
        cfg.routing.host = "edge-01".to_string();

        let event = record_to_event(r#"{"time":1,"message":"m"}"#, &cfg).unwrap();
        assert_eq!(event.source.as_deref(), Some("app"));
        assert_eq!(event.host, "edge-01");
    }

    #[test]
    fn test_invalid_records_rejected() {
        assert!(matches!(
            record_to_event("not json", &config(false)),
            Err(RecordError::Json(_))
        ));
        assert!(matches!(
            record_to_event(r#"["a","b"]"#, &config(false)),
            Err(RecordError::NotAnObject)
        ));
    }

    async fn read_all(input: &'static [u8]) -> Vec<ResolvedEvent> {
        let (tx, mut rx) = mpsc::channel(16);
        read_records(BufReader::new(input), config(false), tx, CancellationToken::new()).await;

        let mut events = Vec::new();
        while let Some(event) = rx.recv().await {
            events.push(event);
        }
        events
    }

    fn message_of(event: &ResolvedEvent) -> &str {
        match &event.payload {
            Payload::Message(RawText::Utf8(text)) => text.as_str(),
            other => panic!("unexpected payload {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_reader_keeps_going_after_invalid_lines() {
        let input: &'static [u8] =
            b"{\"time\":1,\"message\":\"caf\xe9\"}\n{\"time\":2,\"message\":\"next\"}\nnot json\r\n\n{\"time\":3,\"message\":\"last\"}";
        let events = read_all(input).await;

        let messages: Vec<&str> = events.iter().map(message_of).collect();
        assert_eq!(messages, vec!["caf ", "next", "last"]);
        assert_eq!(events[2].timestamp, Timestamp::Seconds(3));
    }

    #[tokio::test]
    async fn test_reader_stops_on_shutdown() {
        let (tx, mut rx) = mpsc::channel(16);
        let shutdown = CancellationToken::new();
        shutdown.cancel();

        read_records(
            BufReader::new(&b"{\"message\":\"m\"}\n"[..]),
            config(false),
            tx,
            shutdown,
        )
        .await;
        assert!(rx.recv().await.is_none());
    }

    #[test]
    fn test_decode_line_sanitizes_invalid_utf8() {
        assert_eq!(decode_line(b"{\"a\":\"\xff\xfe\"}\r\n", 1), "{\"a\":\"  \"}");
        assert_eq!(decode_line("ü\n".as_bytes(), 1), "ü");
    }

    #[test]
    fn test_has_failures() {
        assert!(!has_failures(&BufferStats::default(), 0));
        assert!(has_failures(&BufferStats::default(), 1));
        let stats = BufferStats {
            failed_flushes: 1,
            ..BufferStats::default()
        };
        assert!(has_failures(&stats, 0));
    }
}

//! Intake buffer that groups incoming events into dispatch chunks.
//!
//! This module provides async buffering with size-based and time-based flush
//! triggers using tokio mpsc channels and select! for concurrent event
//! handling. It stands in for the host framework's buffering: each flushed
//! chunk becomes one [`crate::dispatch::Dispatcher::dispatch`] call.

use std::fmt::Display;
use std::future::Future;
use std::time::Duration;

use tokio::sync::mpsc;
use tokio::time::{interval, MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::event::ResolvedEvent;

/// Configuration for the intake buffer.
#[derive(Debug, Clone)]
pub struct BufferConfig {
    /// Number of events to accumulate before triggering a flush
    pub chunk_events: usize,

    /// Duration to wait before flushing, even if the chunk is not full
    pub flush_interval: Duration,
}

impl Default for BufferConfig {
    fn default() -> Self {
        Self {
            chunk_events: 1_000,
            flush_interval: Duration::from_secs(5),
        }
    }
}

impl BufferConfig {
    /// Create a new buffer config with the specified chunk size and flush interval.
    pub fn new(chunk_events: usize, flush_interval: Duration) -> Self {
        Self {
            chunk_events: chunk_events.max(1),
            flush_interval,
        }
    }
}

/// Statistics about buffer operations.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct BufferStats {
    /// Total number of events received
    pub events_received: u64,

    /// Total number of events handed to the flush callback
    pub events_flushed: u64,

    /// Number of flush operations triggered by the chunk size
    pub size_flushes: u64,

    /// Number of flush operations triggered by the time interval
    pub time_flushes: u64,

    /// Number of final flushes on channel close or shutdown
    pub final_flushes: u64,

    /// Number of flushes whose callback returned an error
    pub failed_flushes: u64,
}

#[derive(Debug, Clone, Copy)]
enum FlushReason {
    Size,
    Time,
    Final,
}

/// Receive events until the channel closes or `shutdown` fires, calling
/// `on_flush` with each chunk.
///
/// Chunks preserve arrival order. Whatever is buffered when the loop ends is
/// flushed once more before returning.
///
/// # Example
///
/// ```no_run
/// use hec_shipper::buffer::{buffer_task, BufferConfig};
/// use hec_shipper::event::ResolvedEvent;
/// use tokio::sync::mpsc;
/// use tokio_util::sync::CancellationToken;
///
/// #[tokio::main]
/// async fn main() {
///     let (tx, rx) = mpsc::channel::<ResolvedEvent>(1000);
///     let shutdown = CancellationToken::new();
///
///     tokio::spawn(async move {
///         buffer_task(rx, BufferConfig::default(), shutdown, |chunk| async move {
///             println!("Flushing {} events", chunk.len());
///             Ok::<(), std::io::Error>(())
///         })
///         .await;
///     });
/// }
/// ```
pub async fn buffer_task<F, Fut, E>(
    mut rx: mpsc::Receiver<ResolvedEvent>,
    config: BufferConfig,
    shutdown: CancellationToken,
    mut on_flush: F,
) -> BufferStats
where
    F: FnMut(Vec<ResolvedEvent>) -> Fut,
    Fut: Future<Output = Result<(), E>>,
    E: Display,
{
    let mut buffer: Vec<ResolvedEvent> = Vec::with_capacity(config.chunk_events);
    let mut stats = BufferStats::default();
    let mut ticker = interval(config.flush_interval);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

    // Skip the first immediate tick
    ticker.tick().await;

    loop {
        tokio::select! {
            biased;

            _ = shutdown.cancelled() => {
                // Take whatever producers already queued.
                while let Ok(event) = rx.try_recv() {
                    stats.events_received += 1;
                    buffer.push(event);
                }
                info!(remaining = buffer.len(), "Shutdown requested, flushing buffered events");
                break;
            }

            maybe_event = rx.recv() => match maybe_event {
                Some(event) => {
                    stats.events_received += 1;
                    buffer.push(event);

                    if buffer.len() >= config.chunk_events {
                        debug!(chunk = buffer.len(), "Size-based flush triggered");
                        flush(&mut buffer, &mut stats, FlushReason::Size, &mut on_flush).await;
                    }
                }
                None => {
                    info!(remaining = buffer.len(), "Channel closed, flushing remaining events");
                    break;
                }
            },

            _ = ticker.tick() => {
                if !buffer.is_empty() {
                    debug!(chunk = buffer.len(), "Time-based flush triggered");
                    flush(&mut buffer, &mut stats, FlushReason::Time, &mut on_flush).await;
                }
            }
        }
    }

    if !buffer.is_empty() {
        flush(&mut buffer, &mut stats, FlushReason::Final, &mut on_flush).await;
    }

    stats
}

async fn flush<F, Fut, E>(
    buffer: &mut Vec<ResolvedEvent>,
    stats: &mut BufferStats,
    reason: FlushReason,
    on_flush: &mut F,
) where
    F: FnMut(Vec<ResolvedEvent>) -> Fut,
    Fut: Future<Output = Result<(), E>>,
    E: Display,
{
    let capacity = buffer.capacity();
    let chunk = std::mem::replace(buffer, Vec::with_capacity(capacity));
    stats.events_flushed += chunk.len() as u64;

    match reason {
        FlushReason::Size => stats.size_flushes += 1,
        FlushReason::Time => stats.time_flushes += 1,
        FlushReason::Final => stats.final_flushes += 1,
    }

    if let Err(e) = on_flush(chunk).await {
        stats.failed_flushes += 1;
        warn!(error = %e, reason = ?reason, "Failed to flush chunk");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::event::Timestamp;
    use std::sync::{Arc, Mutex};

    fn create_test_event(n: i64) -> ResolvedEvent {
        ResolvedEvent::message(Timestamp::Seconds(n), format!("event-{}", n))
    }

    type Chunks = Arc<Mutex<Vec<Vec<i64>>>>;

    /// Spawn a buffer task that records the timestamps of every chunk.
    fn spawn_recording(
        config: BufferConfig,
        shutdown: CancellationToken,
        fail: bool,
    ) -> (
        mpsc::Sender<ResolvedEvent>,
        Chunks,
        tokio::task::JoinHandle<BufferStats>,
    ) {
        let (tx, rx) = mpsc::channel(100);
        let chunks: Chunks = Arc::new(Mutex::new(Vec::new()));
        let recorded = chunks.clone();

        let handle = tokio::spawn(async move {
            buffer_task(rx, config, shutdown, move |chunk: Vec<ResolvedEvent>| {
                let recorded = recorded.clone();
                async move {
                    let seconds = chunk
                        .iter()
                        .map(|e| match e.timestamp {
                            Timestamp::Seconds(s) => s,
                            Timestamp::Fractional(f) => f as i64,
                        })
                        .collect();
                    recorded.lock().unwrap().push(seconds);
                    if fail {
                        Err("collector unavailable")
                    } else {
                        Ok(())
                    }
                }
            })
            .await
        });

        (tx, chunks, handle)
    }

    #[test]
    fn test_buffer_config_new_clamps_chunk_size() {
        let config = BufferConfig::new(0, Duration::from_secs(10));
        assert_eq!(config.chunk_events, 1);
        assert_eq!(config.flush_interval, Duration::from_secs(10));
    }

    #[tokio::test]
    async fn test_size_based_flush_preserves_order() {
        let config = BufferConfig::new(3, Duration::from_secs(60));
        let (tx, chunks, handle) = spawn_recording(config, CancellationToken::new(), false);

        for n in 0..7 {
            tx.send(create_test_event(n)).await.unwrap();
        }
        drop(tx);

        let stats = handle.await.unwrap();
        assert_eq!(
            *chunks.lock().unwrap(),
            vec![vec![0, 1, 2], vec![3, 4, 5], vec![6]]
        );
        assert_eq!(stats.events_received, 7);
        assert_eq!(stats.events_flushed, 7);
        assert_eq!(stats.size_flushes, 2);
        assert_eq!(stats.final_flushes, 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_time_based_flush() {
        let config = BufferConfig::new(100, Duration::from_millis(50));
        let (tx, chunks, handle) = spawn_recording(config, CancellationToken::new(), false);

        tx.send(create_test_event(1)).await.unwrap();
        tx.send(create_test_event(2)).await.unwrap();

        tokio::time::sleep(Duration::from_millis(120)).await;
        assert_eq!(*chunks.lock().unwrap(), vec![vec![1, 2]]);

        drop(tx);
        let stats = handle.await.unwrap();
        assert_eq!(stats.time_flushes, 1);
        assert_eq!(stats.final_flushes, 0);
    }

    #[tokio::test]
    async fn test_shutdown_flushes_remaining_events() {
        let shutdown = CancellationToken::new();
        let config = BufferConfig::new(100, Duration::from_secs(60));
        let (tx, chunks, handle) = spawn_recording(config, shutdown.clone(), false);

        tx.send(create_test_event(1)).await.unwrap();
        tx.send(create_test_event(2)).await.unwrap();
        shutdown.cancel();

        let stats = handle.await.unwrap();
        assert_eq!(*chunks.lock().unwrap(), vec![vec![1, 2]]);
        assert_eq!(stats.final_flushes, 1);

        // Receiver is gone once the task ends.
        assert!(tx.send(create_test_event(3)).await.is_err());
    }

    #[tokio::test]
    async fn test_failed_flushes_are_counted() {
        let config = BufferConfig::new(1, Duration::from_secs(60));
        let (tx, chunks, handle) = spawn_recording(config, CancellationToken::new(), true);

        tx.send(create_test_event(1)).await.unwrap();
        tx.send(create_test_event(2)).await.unwrap();
        drop(tx);

        let stats = handle.await.unwrap();
        assert_eq!(chunks.lock().unwrap().len(), 2);
        assert_eq!(stats.failed_flushes, 2);
    }

    #[tokio::test]
    async fn test_empty_channel_close_does_not_flush() {
        let (tx, chunks, handle) =
            spawn_recording(BufferConfig::default(), CancellationToken::new(), false);
        drop(tx);

        let stats = handle.await.unwrap();
        assert!(chunks.lock().unwrap().is_empty());
        assert_eq!(stats, BufferStats::default());
    }
}

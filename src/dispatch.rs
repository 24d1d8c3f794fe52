//! Dispatch orchestration.
//!
//! [`Dispatcher::dispatch`] encodes a set of events, splits them into
//! batches, and drives every batch through the retry controller in order.
//! A failed batch never stops the ones after it; the aggregate outcome is
//! reported once all batches have been attempted.

use std::sync::{Arc, PoisonError, RwLock};

use thiserror::Error;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info};

use crate::batch::split;
use crate::client::{ClientError, HecClient, Transport};
use crate::config::Config;
use crate::event::{encode, EncodeError, ResolvedEvent};
use crate::retry::{drive, BatchOutcome, BatchReport, RetryPolicy};

/// Errors surfaced by a dispatch call.
#[derive(Debug, Error)]
pub enum DispatchError {
    /// An event violated the encoding contract. Nothing was sent.
    #[error("event {index} could not be encoded: {source}")]
    Encode {
        index: usize,
        #[source]
        source: EncodeError,
    },

    /// One or more batches were not delivered.
    #[error("{}", delivery_summary(.report))]
    Delivery { report: DispatchReport },
}

fn delivery_summary(report: &DispatchReport) -> String {
    format!(
        "{} of {} batches not delivered ({} exhausted, {} rejected, {} cancelled)",
        report.failed().count(),
        report.batches.len(),
        report.count(BatchOutcome::Exhausted),
        report.count(BatchOutcome::Rejected),
        report.count(BatchOutcome::Cancelled),
    )
}

/// Per-batch results of one dispatch call, in batch order.
#[derive(Debug, Clone, Default)]
pub struct DispatchReport {
    pub batches: Vec<BatchReport>,
}

impl DispatchReport {
    /// True when every batch was delivered.
    pub fn is_success(&self) -> bool {
        self.batches.iter().all(BatchReport::is_delivered)
    }

    /// Batches that did not reach `Delivered`.
    pub fn failed(&self) -> impl Iterator<Item = &BatchReport> {
        self.batches.iter().filter(|b| !b.is_delivered())
    }

    /// Number of batches with the given outcome.
    pub fn count(&self, outcome: BatchOutcome) -> usize {
        self.batches.iter().filter(|b| b.outcome == outcome).count()
    }

    /// Total transport calls across all batches.
    pub fn total_attempts(&self) -> u32 {
        self.batches.iter().map(|b| b.attempts).sum()
    }

    /// Turn a report with any undelivered batch into an error.
    pub fn into_result(self) -> Result<Self, DispatchError> {
        if self.is_success() {
            Ok(self)
        } else {
            Err(DispatchError::Delivery { report: self })
        }
    }
}

/// Running totals across dispatch calls.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct DispatchStats {
    /// Batches accepted by the collector
    pub batches_sent: u64,

    /// Events in accepted batches
    pub events_sent: u64,

    /// Attempts beyond the first, over all batches
    pub retries: u64,

    /// Batches not delivered, for any reason
    pub batches_failed: u64,

    /// Batches rejected with a 4xx
    pub batches_rejected: u64,

    /// Batches that used up their retry budget
    pub batches_exhausted: u64,
}

impl DispatchStats {
    fn record(&mut self, report: &BatchReport) {
        self.retries += u64::from(report.retries());
        match report.outcome {
            BatchOutcome::Delivered => {
                self.batches_sent += 1;
                self.events_sent += report.events as u64;
                return;
            }
            BatchOutcome::Rejected => self.batches_rejected += 1,
            BatchOutcome::Exhausted => self.batches_exhausted += 1,
            BatchOutcome::Cancelled => {}
        }
        self.batches_failed += 1;
    }
}

/// Encodes, batches and ships events through a [`Transport`].
pub struct Dispatcher<T: Transport = HecClient> {
    transport: Arc<T>,
    policy: RetryPolicy,
    batch_size_limit: usize,
    cancel: CancellationToken,
    stats: RwLock<DispatchStats>,
}

impl Dispatcher<HecClient> {
    /// Build a dispatcher backed by an HTTP client for the configured
    /// collector.
    pub fn from_config(config: &Config) -> Result<Self, ClientError> {
        let client = HecClient::new(config)?;
        Ok(Self::new(
            Arc::new(client),
            config.retry_policy(),
            config.batch_size_limit,
        ))
    }
}

impl<T: Transport> Dispatcher<T> {
    pub fn new(transport: Arc<T>, policy: RetryPolicy, batch_size_limit: usize) -> Self {
        Self {
            transport,
            policy,
            batch_size_limit,
            cancel: CancellationToken::new(),
            stats: RwLock::new(DispatchStats::default()),
        }
    }

    /// Use `cancel` to abort retry waits.
    pub fn with_cancellation(mut self, cancel: CancellationToken) -> Self {
        self.cancel = cancel;
        self
    }

    /// Token that aborts retry waits when cancelled.
    pub fn cancellation_token(&self) -> CancellationToken {
        self.cancel.clone()
    }

    pub fn transport(&self) -> &T {
        &self.transport
    }

    pub fn policy(&self) -> &RetryPolicy {
        &self.policy
    }

    pub fn batch_size_limit(&self) -> usize {
        self.batch_size_limit
    }

    /// Get current dispatch statistics.
    pub fn stats(&self) -> DispatchStats {
        self.stats
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    /// Ship `events` and report what happened to each batch.
    ///
    /// The returned report may contain failed batches; call
    /// [`DispatchReport::into_result`] to treat those as an error.
    ///
    /// # Errors
    ///
    /// Returns [`DispatchError::Encode`] if any event cannot be encoded. In
    /// that case no request is made.
    pub async fn dispatch(&self, events: &[ResolvedEvent]) -> Result<DispatchReport, DispatchError> {
        let envelopes = events
            .iter()
            .enumerate()
            .map(|(index, event)| encode(event).map_err(|source| DispatchError::Encode { index, source }))
            .collect::<Result<Vec<_>, _>>()?;

        let batches = split(envelopes, self.batch_size_limit);
        debug!(
            events = events.len(),
            batches = batches.len(),
            "Dispatching events"
        );

        let mut report = DispatchReport::default();
        for batch in &batches {
            let batch_report = drive(self.transport.as_ref(), batch, &self.policy, &self.cancel).await;
            log_outcome(&batch_report);

            self.stats
                .write()
                .unwrap_or_else(PoisonError::into_inner)
                .record(&batch_report);
            report.batches.push(batch_report);
        }

        Ok(report)
    }
}

fn log_outcome(report: &BatchReport) {
    match report.outcome {
        BatchOutcome::Delivered => info!(
            batch_id = %report.batch_id,
            events = report.events,
            bytes = report.bytes,
            attempts = report.attempts,
            "Batch delivered"
        ),
        outcome => error!(
            batch_id = %report.batch_id,
            events = report.events,
            attempts = report.attempts,
            outcome = ?outcome,
            status = ?report.last_status,
            error = ?report.last_error,
            "Batch not delivered"
        ),
    }
}

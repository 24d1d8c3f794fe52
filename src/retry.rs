//! Per-batch retry control.
//!
//! [`drive`] runs one batch through the transport until it reaches a terminal
//! state:
//!
//! ```text
//! Pending -> Attempting -> Success
//!               |  ^    -> Fatal      (4xx, never retried)
//!               v  |    -> Exhausted  (retry budget spent)
//!             Pending   -> Cancelled  (shutdown during a wait)
//! ```
//!
//! The delay between attempts is a fixed interval. There is no exponential
//! backoff and no jitter, so attempt counts and timings are exact.

use std::time::Duration;

use reqwest::StatusCode;
use tokio_util::sync::CancellationToken;
use tracing::warn;
use uuid::Uuid;

use crate::batch::Batch;
use crate::client::{DispatchAttempt, Disposition, Transport};

/// Default delay between attempts.
const DEFAULT_RETRY_INTERVAL: Duration = Duration::from_secs(1);

/// Retry limits applied to every batch.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RetryPolicy {
    max_attempts: Option<u32>,
    interval: Duration,
}

impl RetryPolicy {
    /// Create a policy from the number of retries allowed after the first
    /// attempt. `None` retries without limit.
    pub fn new(post_retry_max: Option<u32>, interval: Duration) -> Self {
        Self {
            max_attempts: post_retry_max.map(|retries| retries.saturating_add(1)),
            interval,
        }
    }

    /// Total attempts allowed per batch, `None` if unlimited.
    pub fn max_attempts(&self) -> Option<u32> {
        self.max_attempts
    }

    /// Delay between attempts.
    pub fn interval(&self) -> Duration {
        self.interval
    }
}

impl Default for RetryPolicy {
    /// A single attempt, no retries.
    fn default() -> Self {
        Self::new(Some(0), DEFAULT_RETRY_INTERVAL)
    }
}

/// Where a batch is in its retry lifecycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RetryPhase {
    Pending,
    Attempting,
    Success,
    Exhausted,
    Fatal,
    Cancelled,
}

impl RetryPhase {
    pub fn is_terminal(self) -> bool {
        !matches!(self, RetryPhase::Pending | RetryPhase::Attempting)
    }
}

/// Mutable retry bookkeeping for one batch.
#[derive(Debug, Clone)]
pub struct RetryState {
    attempts_made: u32,
    max_attempts: Option<u32>,
    next_delay: Duration,
    phase: RetryPhase,
}

impl RetryState {
    pub fn new(policy: &RetryPolicy) -> Self {
        Self {
            attempts_made: 0,
            max_attempts: policy.max_attempts,
            next_delay: policy.interval,
            phase: RetryPhase::Pending,
        }
    }

    /// Enter `Attempting` and return the 1-based number of the new attempt.
    pub fn begin_attempt(&mut self) -> u32 {
        self.phase = RetryPhase::Attempting;
        self.attempts_made + 1
    }

    /// Record the outcome of the current attempt and return the next phase.
    ///
    /// A retryable failure goes back to `Pending` while budget remains.
    pub fn record(&mut self, disposition: Disposition) -> RetryPhase {
        self.attempts_made += 1;
        self.phase = match disposition {
            Disposition::Success => RetryPhase::Success,
            Disposition::Fatal => RetryPhase::Fatal,
            Disposition::Retryable if self.budget_spent() => RetryPhase::Exhausted,
            Disposition::Retryable => RetryPhase::Pending,
        };
        self.phase
    }

    pub fn cancel(&mut self) {
        self.phase = RetryPhase::Cancelled;
    }

    pub fn attempts_made(&self) -> u32 {
        self.attempts_made
    }

    pub fn next_delay(&self) -> Duration {
        self.next_delay
    }

    pub fn phase(&self) -> RetryPhase {
        self.phase
    }

    fn budget_spent(&self) -> bool {
        self.max_attempts
            .is_some_and(|max| self.attempts_made >= max)
    }
}

/// Terminal outcome of one batch.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BatchOutcome {
    /// The collector accepted the batch.
    Delivered,
    /// Every allowed attempt failed with a retryable error.
    Exhausted,
    /// The collector rejected the batch (4xx).
    Rejected,
    /// Shutdown was requested before the batch was delivered.
    Cancelled,
}

impl BatchOutcome {
    fn from_phase(phase: RetryPhase) -> Self {
        match phase {
            RetryPhase::Success => BatchOutcome::Delivered,
            RetryPhase::Exhausted => BatchOutcome::Exhausted,
            RetryPhase::Fatal => BatchOutcome::Rejected,
            RetryPhase::Pending | RetryPhase::Attempting | RetryPhase::Cancelled => {
                BatchOutcome::Cancelled
            }
        }
    }
}

/// What happened to one batch.
#[derive(Debug, Clone)]
pub struct BatchReport {
    pub batch_id: Uuid,
    pub events: usize,
    pub bytes: usize,
    pub attempts: u32,
    pub outcome: BatchOutcome,
    pub last_status: Option<StatusCode>,
    pub last_error: Option<String>,
}

impl BatchReport {
    fn new(batch: &Batch, state: &RetryState, last: Option<DispatchAttempt>) -> Self {
        let (last_status, last_error) = match last {
            Some(attempt) => (attempt.status, attempt.error),
            None => (None, None),
        };
        Self {
            batch_id: batch.id(),
            events: batch.event_count(),
            bytes: batch.len(),
            attempts: state.attempts_made(),
            outcome: BatchOutcome::from_phase(state.phase()),
            last_status,
            last_error,
        }
    }

    pub fn is_delivered(&self) -> bool {
        self.outcome == BatchOutcome::Delivered
    }

    /// Attempts made beyond the first.
    pub fn retries(&self) -> u32 {
        self.attempts.saturating_sub(1)
    }
}

/// Drive one batch to a terminal state.
///
/// Every attempt resends the same payload. Waits between attempts end early
/// when `cancel` fires, leaving the batch `Cancelled`.
pub async fn drive<T>(
    transport: &T,
    batch: &Batch,
    policy: &RetryPolicy,
    cancel: &CancellationToken,
) -> BatchReport
where
    T: Transport + ?Sized,
{
    let mut state = RetryState::new(policy);
    let mut last = None;

    while !state.phase().is_terminal() {
        if cancel.is_cancelled() {
            state.cancel();
            break;
        }

        let attempt = state.begin_attempt();
        let result = transport.send(batch, attempt).await;

        if state.record(result.disposition) == RetryPhase::Pending {
            warn!(
                batch_id = %batch.id(),
                attempt = attempt,
                max_attempts = ?policy.max_attempts(),
                delay_ms = state.next_delay().as_millis() as u64,
                error = %result.describe(),
                "Batch delivery failed, will retry"
            );

            tokio::select! {
                biased;
                _ = cancel.cancelled() => state.cancel(),
                _ = tokio::time::sleep(state.next_delay()) => {}
            }
        }

        last = Some(result);
    }

    BatchReport::new(batch, &state, last)
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use crate::event::{encode, ResolvedEvent, Timestamp};
    use async_trait::async_trait;
    use std::collections::VecDeque;
    use std::sync::atomic::{AtomicU32, Ordering};
    use std::sync::Mutex;
    use tokio::time::Instant;

    /// Transport that replays a fixed list of dispositions, then repeats
    /// `fallback` forever.
    pub(crate) struct ScriptedTransport {
        script: Mutex<VecDeque<Disposition>>,
        fallback: Disposition,
        calls: AtomicU32,
    }

    impl ScriptedTransport {
        pub(crate) fn new(script: impl IntoIterator<Item = Disposition>, fallback: Disposition) -> Self {
            Self {
                script: Mutex::new(script.into_iter().collect()),
                fallback,
                calls: AtomicU32::new(0),
            }
        }

        /// `failures` retryable failures followed by success.
        pub(crate) fn failing(failures: usize) -> Self {
            Self::new(
                std::iter::repeat(Disposition::Retryable).take(failures),
                Disposition::Success,
            )
        }

        pub(crate) fn calls(&self) -> u32 {
            self.calls.load(Ordering::SeqCst)
        }
    }

    #[async_trait]
    impl Transport for ScriptedTransport {
        async fn send(&self, _batch: &Batch, attempt: u32) -> DispatchAttempt {
            self.calls.fetch_add(1, Ordering::SeqCst);
            let disposition = self
                .script
                .lock()
                .unwrap()
                .pop_front()
                .unwrap_or(self.fallback);
            let status = match disposition {
                Disposition::Success => StatusCode::OK,
                Disposition::Retryable => StatusCode::INTERNAL_SERVER_ERROR,
                Disposition::Fatal => StatusCode::BAD_REQUEST,
            };
            DispatchAttempt::from_status(attempt, status, None)
        }
    }

    fn test_batch() -> Batch {
        let envelope = encode(&ResolvedEvent::message(Timestamp::Seconds(0), "1")).unwrap();
        Batch::from_envelopes([&envelope])
    }

    fn policy(post_retry_max: Option<u32>, interval_ms: u64) -> RetryPolicy {
        RetryPolicy::new(post_retry_max, Duration::from_millis(interval_ms))
    }

    #[test]
    fn test_policy_max_attempts() {
        assert_eq!(RetryPolicy::default().max_attempts(), Some(1));
        assert_eq!(policy(Some(5), 100).max_attempts(), Some(6));
        assert_eq!(policy(None, 100).max_attempts(), None);
        assert_eq!(policy(Some(u32::MAX), 100).max_attempts(), Some(u32::MAX));
    }

    #[test]
    fn test_state_transitions() {
        let mut state = RetryState::new(&policy(Some(1), 10));
        assert_eq!(state.phase(), RetryPhase::Pending);

        assert_eq!(state.begin_attempt(), 1);
        assert_eq!(state.phase(), RetryPhase::Attempting);
        assert_eq!(state.record(Disposition::Retryable), RetryPhase::Pending);

        assert_eq!(state.begin_attempt(), 2);
        assert_eq!(state.record(Disposition::Retryable), RetryPhase::Exhausted);
        assert!(state.phase().is_terminal());
        assert_eq!(state.attempts_made(), 2);
    }

    #[test]
    fn test_fatal_ignores_remaining_budget() {
        let mut state = RetryState::new(&policy(None, 10));
        state.begin_attempt();
        assert_eq!(state.record(Disposition::Fatal), RetryPhase::Fatal);
    }

    #[tokio::test(start_paused = true)]
    async fn test_attempt_count_is_deterministic() {
        // (failures before success, post_retry_max, expected attempts, delivered)
        let cases = [
            (0, 0, 1, true),
            (2, 2, 3, true),
            (4, 5, 5, true),
            (3, 2, 3, false),
            (5, 1, 2, false),
            (1, 0, 1, false),
        ];

        for (failures, retry_max, expected, delivered) in cases {
            let transport = ScriptedTransport::failing(failures);
            let report = drive(
                &transport,
                &test_batch(),
                &policy(Some(retry_max), 100),
                &CancellationToken::new(),
            )
            .await;

            assert_eq!(transport.calls(), expected, "failures={failures} retry_max={retry_max}");
            assert_eq!(report.attempts, expected);
            assert_eq!(report.is_delivered(), delivered);
            if !delivered {
                assert_eq!(report.outcome, BatchOutcome::Exhausted);
                assert_eq!(report.last_status, Some(StatusCode::INTERNAL_SERVER_ERROR));
            }
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_fatal_is_single_shot_without_delay() {
        let transport = ScriptedTransport::new([Disposition::Fatal], Disposition::Success);
        let start = Instant::now();

        let report = drive(
            &transport,
            &test_batch(),
            &policy(Some(5), 1_000),
            &CancellationToken::new(),
        )
        .await;

        assert_eq!(transport.calls(), 1);
        assert_eq!(report.outcome, BatchOutcome::Rejected);
        assert_eq!(report.retries(), 0);
        assert_eq!(report.last_status, Some(StatusCode::BAD_REQUEST));
        assert_eq!(start.elapsed(), Duration::ZERO);
    }

    #[tokio::test(start_paused = true)]
    async fn test_fixed_interval_between_attempts() {
        let transport = ScriptedTransport::failing(3);
        let start = Instant::now();

        let report = drive(
            &transport,
            &test_batch(),
            &policy(Some(3), 100),
            &CancellationToken::new(),
        )
        .await;

        assert!(report.is_delivered());
        assert_eq!(report.attempts, 4);
        assert_eq!(start.elapsed(), Duration::from_millis(300));
    }

    #[tokio::test(start_paused = true)]
    async fn test_unlimited_retries_until_cancelled() {
        let transport = ScriptedTransport::new([], Disposition::Retryable);
        let cancel = CancellationToken::new();

        let canceller = cancel.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(250)).await;
            canceller.cancel();
        });

        let report = drive(&transport, &test_batch(), &policy(None, 100), &cancel).await;

        assert_eq!(report.outcome, BatchOutcome::Cancelled);
        assert_eq!(report.attempts, 3);
    }

    #[tokio::test]
    async fn test_cancelled_before_first_attempt() {
        let transport = ScriptedTransport::failing(0);
        let cancel = CancellationToken::new();
        cancel.cancel();

        let report = drive(&transport, &test_batch(), &RetryPolicy::default(), &cancel).await;

        assert_eq!(transport.calls(), 0);
        assert_eq!(report.attempts, 0);
        assert_eq!(report.outcome, BatchOutcome::Cancelled);
    }
}

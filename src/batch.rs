//! Size-bounded batching of encoded envelopes.
//!
//! [`split`] groups envelopes, in arrival order, into [`Batch`]es whose
//! payload stays within a byte limit. Each batch is later sent as its own
//! HTTP body, and retries resend the exact same bytes.

use bytes::{Bytes, BytesMut};
use tracing::debug;
use uuid::Uuid;

use crate::event::EventEnvelope;

/// An ordered, non-empty group of envelopes sent in one request.
///
/// The payload is built once when the batch is closed; cloning it is cheap.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Batch {
    id: Uuid,
    events: usize,
    payload: Bytes,
}

impl Batch {
    /// Build a batch from envelopes, ignoring any size limit.
    pub fn from_envelopes<'a>(envelopes: impl IntoIterator<Item = &'a EventEnvelope>) -> Self {
        let mut builder = BatchBuilder::default();
        for envelope in envelopes {
            builder.push(envelope);
        }
        builder.finish()
    }

    /// Id used to correlate log lines for this batch.
    pub fn id(&self) -> Uuid {
        self.id
    }

    /// Number of events in the batch.
    pub fn event_count(&self) -> usize {
        self.events
    }

    /// Payload size in bytes.
    pub fn len(&self) -> usize {
        self.payload.len()
    }

    pub fn is_empty(&self) -> bool {
        self.events == 0
    }

    /// The request body: every envelope concatenated with no separator.
    pub fn payload(&self) -> Bytes {
        self.payload.clone()
    }
}

#[derive(Default)]
struct BatchBuilder {
    buf: BytesMut,
    events: usize,
}

impl BatchBuilder {
    fn push(&mut self, envelope: &EventEnvelope) {
        self.buf.extend_from_slice(envelope.as_bytes());
        self.events += 1;
    }

    fn len(&self) -> usize {
        self.buf.len()
    }

    fn is_empty(&self) -> bool {
        self.events == 0
    }

    fn finish(&mut self) -> Batch {
        let events = std::mem::take(&mut self.events);
        let payload = std::mem::take(&mut self.buf).freeze();
        Batch {
            id: Uuid::new_v4(),
            events,
            payload,
        }
    }
}

/// Split envelopes into batches of at most `limit` bytes.
///
/// The running batch is closed just before an envelope that would push it
/// over `limit`. An envelope larger than `limit` on its own still forms a
/// one-element batch. A `limit` of zero disables splitting.
pub fn split(envelopes: impl IntoIterator<Item = EventEnvelope>, limit: usize) -> Vec<Batch> {
    let mut batches = Vec::new();
    let mut current = BatchBuilder::default();

    for envelope in envelopes {
        if limit > 0 && !current.is_empty() && current.len() + envelope.len() > limit {
            batches.push(current.finish());
        }
        current.push(&envelope);
    }

    if !current.is_empty() {
        batches.push(current.finish());
    }

    debug!(
        batches = batches.len(),
        limit = limit,
        "Split envelopes into batches"
    );

    batches
}

//! Event encoding for the HTTP Event Collector wire format.
//!
//! A [`ResolvedEvent`] is a log record whose routing fields have already been
//! decided by the host. [`encode`] turns it into an [`EventEnvelope`], the
//! single JSON object that gets concatenated into a batch body:
//!
//! ```json
//! {"time":1262438055,"source":null,"sourcetype":"hec_shipper","host":"","index":"main","event":"a message"}
//! ```

use std::borrow::Cow;

use bytes::Bytes;
use chrono::{DateTime, Utc};
use serde::Serialize;
use serde_json::{Map, Number, Value};
use thiserror::Error;

/// Sourcetype used when the host does not resolve one.
pub const DEFAULT_SOURCETYPE: &str = "hec_shipper";

/// Index used when the host does not resolve one.
pub const DEFAULT_INDEX: &str = "main";

/// Byte written in place of every non-ASCII byte of binary text.
const BINARY_REPLACEMENT: char = ' ';

/// Errors raised while encoding an event.
///
/// These are caller-contract violations: they surface before any network
/// activity and are never retried.
#[derive(Debug, Error)]
pub enum EncodeError {
    #[error("timestamp {0} is not a finite number")]
    NonFiniteTimestamp(f64),

    #[error("payload contains non-finite float {0}")]
    NonFiniteFloat(f64),

    #[error("failed to serialize event: {0}")]
    Serialize(#[from] serde_json::Error),
}

/// Event time in seconds since the Unix epoch.
///
/// The two variants are serialized differently (`1262438055` versus
/// `1262438055.0`), so whichever form the host supplied is kept as-is.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum Timestamp {
    /// Whole seconds, serialized as a JSON integer.
    Seconds(i64),
    /// Fractional seconds, serialized as a JSON float.
    Fractional(f64),
}

impl Timestamp {
    /// The timestamp as floating-point seconds.
    pub fn as_secs_f64(&self) -> f64 {
        match *self {
            Timestamp::Seconds(secs) => secs as f64,
            Timestamp::Fractional(secs) => secs,
        }
    }

    fn to_json(self) -> Result<Value, EncodeError> {
        match self {
            Timestamp::Seconds(secs) => Ok(Value::from(secs)),
            Timestamp::Fractional(secs) => Number::from_f64(secs)
                .map(Value::Number)
                .ok_or(EncodeError::NonFiniteTimestamp(secs)),
        }
    }
}

impl From<DateTime<Utc>> for Timestamp {
    fn from(time: DateTime<Utc>) -> Self {
        let nanos = time.timestamp_subsec_nanos();
        if nanos == 0 {
            Timestamp::Seconds(time.timestamp())
        } else {
            Timestamp::Fractional(time.timestamp() as f64 + f64::from(nanos) / 1e9)
        }
    }
}

/// A string as received from the host: either known-good UTF-8 or raw bytes
/// of unknown encoding.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum RawText {
    Utf8(String),
    Binary(Vec<u8>),
}

impl RawText {
    /// Returns the text as valid UTF-8.
    ///
    /// UTF-8 text is borrowed unchanged. Binary text keeps its ASCII bytes
    /// and has every other byte replaced by a single space, so the output is
    /// exactly as many bytes long as the input.
    pub fn sanitized(&self) -> Cow<'_, str> {
        match self {
            RawText::Utf8(text) => Cow::Borrowed(text),
            RawText::Binary(bytes) => Cow::Owned(
                bytes
                    .iter()
                    .map(|&b| if b.is_ascii() { char::from(b) } else { BINARY_REPLACEMENT })
                    .collect(),
            ),
        }
    }
}

impl From<&str> for RawText {
    fn from(text: &str) -> Self {
        RawText::Utf8(text.to_string())
    }
}

impl From<String> for RawText {
    fn from(text: String) -> Self {
        RawText::Utf8(text)
    }
}

impl From<Vec<u8>> for RawText {
    fn from(bytes: Vec<u8>) -> Self {
        RawText::Binary(bytes)
    }
}

impl From<&[u8]> for RawText {
    fn from(bytes: &[u8]) -> Self {
        RawText::Binary(bytes.to_vec())
    }
}

/// A structured payload value.
///
/// Maps keep insertion order; later duplicate keys overwrite earlier ones
/// once sanitized.
#[derive(Debug, Clone, PartialEq)]
pub enum FieldValue {
    Null,
    Bool(bool),
    Integer(i64),
    /// Integers above `i64::MAX`
    Unsigned(u64),
    Float(f64),
    Text(RawText),
    Array(Vec<FieldValue>),
    Map(Vec<(RawText, FieldValue)>),
}

impl FieldValue {
    /// Build a map value from key/value pairs.
    pub fn map<K, I>(entries: I) -> Self
    where
        K: Into<RawText>,
        I: IntoIterator<Item = (K, FieldValue)>,
    {
        FieldValue::Map(entries.into_iter().map(|(k, v)| (k.into(), v)).collect())
    }

    /// Convert into JSON, sanitizing every string leaf and map key.
    pub fn to_sanitized_json(&self) -> Result<Value, EncodeError> {
        Ok(match self {
            FieldValue::Null => Value::Null,
            FieldValue::Bool(b) => Value::Bool(*b),
            FieldValue::Integer(i) => Value::from(*i),
            FieldValue::Unsigned(u) => Value::from(*u),
            FieldValue::Float(f) => Number::from_f64(*f)
                .map(Value::Number)
                .ok_or(EncodeError::NonFiniteFloat(*f))?,
            FieldValue::Text(text) => Value::String(text.sanitized().into_owned()),
            FieldValue::Array(items) => Value::Array(
                items
                    .iter()
                    .map(FieldValue::to_sanitized_json)
                    .collect::<Result<_, _>>()?,
            ),
            FieldValue::Map(entries) => {
                let mut map = Map::with_capacity(entries.len());
                for (key, value) in entries {
                    map.insert(key.sanitized().into_owned(), value.to_sanitized_json()?);
                }
                Value::Object(map)
            }
        })
    }
}

impl From<&str> for FieldValue {
    fn from(text: &str) -> Self {
        FieldValue::Text(text.into())
    }
}

impl From<&[u8]> for FieldValue {
    fn from(bytes: &[u8]) -> Self {
        FieldValue::Text(bytes.into())
    }
}

impl From<Value> for FieldValue {
    fn from(value: Value) -> Self {
        match value {
            Value::Null => FieldValue::Null,
            Value::Bool(b) => FieldValue::Bool(b),
            Value::Number(n) => match (n.as_i64(), n.as_u64()) {
                (Some(i), _) => FieldValue::Integer(i),
                (None, Some(u)) => FieldValue::Unsigned(u),
                (None, None) => FieldValue::Float(n.as_f64().unwrap_or_default()),
            },
            Value::String(s) => FieldValue::Text(RawText::Utf8(s)),
            Value::Array(items) => FieldValue::Array(items.into_iter().map(Into::into).collect()),
            Value::Object(map) => FieldValue::Map(
                map.into_iter()
                    .map(|(k, v)| (RawText::Utf8(k), v.into()))
                    .collect(),
            ),
        }
    }
}

/// The body of an event.
#[derive(Debug, Clone, PartialEq)]
pub enum Payload {
    /// A single message string, sent as a JSON string.
    Message(RawText),
    /// The whole record ("all items" mode), sent as nested JSON.
    Fields(FieldValue),
}

impl Payload {
    fn to_json(&self) -> Result<Value, EncodeError> {
        match self {
            Payload::Message(text) => Ok(Value::String(text.sanitized().into_owned())),
            Payload::Fields(value) => value.to_sanitized_json(),
        }
    }
}

/// Routing fields resolved by the host for every event it hands over.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Routing {
    pub source: Option<String>,
    pub sourcetype: String,
    pub index: String,
    pub host: String,
}

impl Default for Routing {
    fn default() -> Self {
        Self {
            source: None,
            sourcetype: DEFAULT_SOURCETYPE.to_string(),
            index: DEFAULT_INDEX.to_string(),
            host: String::new(),
        }
    }
}

/// A log record ready to be encoded.
#[derive(Debug, Clone, PartialEq)]
pub struct ResolvedEvent {
    pub timestamp: Timestamp,
    pub payload: Payload,
    pub source: Option<String>,
    pub sourcetype: String,
    pub index: String,
    pub host: String,
}

impl ResolvedEvent {
    /// Create an event with default routing.
    pub fn new(timestamp: Timestamp, payload: Payload) -> Self {
        Self::with_routing(timestamp, payload, &Routing::default())
    }

    /// Create an event carrying the given routing fields.
    pub fn with_routing(timestamp: Timestamp, payload: Payload, routing: &Routing) -> Self {
        Self {
            timestamp,
            payload,
            source: routing.source.clone(),
            sourcetype: routing.sourcetype.clone(),
            index: routing.index.clone(),
            host: routing.host.clone(),
        }
    }

    /// Convenience constructor for a plain message event.
    pub fn message(timestamp: Timestamp, message: impl Into<String>) -> Self {
        Self::new(timestamp, Payload::Message(RawText::Utf8(message.into())))
    }

    pub fn source(mut self, source: impl Into<String>) -> Self {
        self.source = Some(source.into());
        self
    }

    pub fn sourcetype(mut self, sourcetype: impl Into<String>) -> Self {
        self.sourcetype = sourcetype.into();
        self
    }

    pub fn index(mut self, index: impl Into<String>) -> Self {
        self.index = index.into();
        self
    }

    pub fn host(mut self, host: impl Into<String>) -> Self {
        self.host = host.into();
        self
    }
}

/// One serialized event, ready to be concatenated into a batch.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EventEnvelope {
    bytes: Bytes,
}

impl EventEnvelope {
    /// Serialized size in bytes.
    pub fn len(&self) -> usize {
        self.bytes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.bytes.is_empty()
    }

    pub fn as_bytes(&self) -> &[u8] {
        &self.bytes
    }
}

// Field order is the order the collector documents.
#[derive(Serialize)]
struct WireEvent<'a> {
    time: Value,
    source: Option<&'a str>,
    sourcetype: &'a str,
    host: &'a str,
    index: &'a str,
    event: Value,
}

/// Encode one event into its wire envelope.
///
/// # Errors
///
/// Returns [`EncodeError`] when the timestamp or any payload float is not
/// finite.
pub fn encode(event: &ResolvedEvent) -> Result<EventEnvelope, EncodeError> {
    let wire = WireEvent {
        time: event.timestamp.to_json()?,
        source: event.source.as_deref(),
        sourcetype: &event.sourcetype,
        host: &event.host,
        index: &event.index,
        event: event.payload.to_json()?,
    };

    Ok(EventEnvelope {
        bytes: Bytes::from(serde_json::to_vec(&wire)?),
    })
}

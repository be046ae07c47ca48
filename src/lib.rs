//! # `siphon`
//!
//! A [sans-I/O](https://sans-io.readthedocs.io/how-to-sans-io.html)
//! telemetry pipeline core. Records carrying a timestamp, a metadata
//! map and a body map travel in tagged batches from inputs through a
//! chain of filters to outputs. This crate provides the pieces every
//! plugin of such a pipeline must agree on:
//!
//! - [`BatchEncoder`] and [`BatchDecoder`], the batch codec for the
//!   tagged binary record format (msgpack-compatible on the wire);
//! - [`TagPattern`], the glob matcher that routes batches to filters;
//! - [`Chain`], the dispatcher that applies registered [`Filter`]s to
//!   each batch in declaration order;
//! - [`GrepFilter`], the reference filter: regular-expression
//!   include/exclude rules over record fields.
//!
//! Reading from sockets or files and writing to downstream services is
//! left to the host; the core is purely synchronous and never blocks.
//!
//! Usage is simple:
//! ```
//! use siphon::{BatchDecoder, BatchEncoder, Timestamp, TimestampMode};
//!
//! let mut enc = BatchEncoder::new(TimestampMode::Native);
//! enc.begin_record().unwrap();
//! enc.append_timestamp(Timestamp::new(1, 500)).unwrap();
//! enc.append_string(siphon::Field::Body, "msg", "hello").unwrap();
//! enc.commit_record().unwrap();
//!
//! let batch = enc.take_buffer();
//! let mut dec = BatchDecoder::new(&batch);
//! for record in dec.records() {
//!     let record = record.unwrap();
//!     assert_eq!(record.timestamp, Timestamp::new(1, 500));
//! }
//! ```
#[deny(rustdoc::broken_intra_doc_links)]
mod chain;
mod decode;
mod encode;
mod grep;
mod pipeline;
mod tag;

pub use chain::{
    Chain, ConfigError, ConfigKey, Filter, FilterConfig, FilterError, StatsSnapshot, Verdict,
};
pub use decode::{
    count_records, decode_batch, BatchDecoder, DecodeError, MalformedRecord, Records,
};
pub use encode::{encode_record, BatchEncoder, EncodeError, Field, TimestampMode};
pub use grep::{FilterState, GrepFilter, LogicalOp};
pub use pipeline::{CancellationToken, Flow, Output, OutputError, Pipeline, Watermarks};
pub use tag::TagPattern;

/// Re-export for timestamp rendering in downstream hosts.
pub use chrono;

/// Nanoseconds carried by a [`Timestamp`] are always below this bound.
pub const NANOS_PER_SEC: u32 = 1_000_000_000;

/// The event class a batch belongs to. Filters declare which class they
/// apply to; a batch of one class never reaches a filter registered for
/// another.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub enum EventKind {
    /// Log records.
    Logs,

    /// Metric scrape records.
    Metrics,

    /// Trace span records.
    Traces,
}

impl std::fmt::Display for EventKind {
    fn fmt(&self, f: &mut std::fmt::Formatter) -> std::fmt::Result {
        f.write_str(match self {
            EventKind::Logs => "logs",
            EventKind::Metrics => "metrics",
            EventKind::Traces => "traces",
        })
    }
}

/// Seconds and nanoseconds since the Unix epoch.
///
/// Nanoseconds are kept below [`NANOS_PER_SEC`]; the decoder rejects
/// records that violate the bound. Five on-wire encodings exist, see
/// [`TimestampMode`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub struct Timestamp {
    /// Whole seconds.
    pub sec: u32,

    /// Fractional part in nanoseconds; always below [`NANOS_PER_SEC`].
    pub nsec: u32,
}

impl Timestamp {
    pub fn new(sec: u32, nsec: u32) -> Timestamp {
        debug_assert!(nsec < NANOS_PER_SEC);
        Timestamp { sec, nsec }
    }

    /// The timestamp as fractional seconds, the representation used by
    /// the legacy float encoding. Lossy for nanosecond precision at
    /// large epochs.
    pub fn as_secs_f64(&self) -> f64 {
        self.sec as f64 + self.nsec as f64 * 1e-9
    }

    /// Recovers a timestamp from fractional seconds. `None` if the
    /// value is negative, non-finite or beyond the 32-bit epoch range.
    pub fn from_secs_f64(secs: f64) -> Option<Timestamp> {
        if !secs.is_finite() || secs < 0.0 || secs >= u32::MAX as f64 + 1.0 {
            return None;
        }
        let mut sec = secs.trunc() as u32;
        let mut nsec = ((secs - secs.trunc()) * 1e9).round() as u32;
        if nsec >= NANOS_PER_SEC {
            // rounding carried into the next second
            sec = sec.checked_add(1)?;
            nsec = 0;
        }
        Some(Timestamp { sec, nsec })
    }

    /// The timestamp as a UTC wall-clock instant.
    pub fn to_datetime(&self) -> chrono::DateTime<chrono::Utc> {
        use chrono::TimeZone;
        chrono::Utc
            .timestamp_opt(self.sec as i64, self.nsec)
            .single()
            .expect("u32 seconds and bounded nanoseconds are always in range")
    }
}

/// A dynamically-typed field value.
///
/// Integers are modelled at full width: the encoder emits the smallest
/// wire representation, and the decoder canonicalizes every
/// non-negative integer to [`Uint`](Value::Uint). Map keys are unique
/// UTF-8 strings and keep their insertion order.
#[derive(Debug, Clone, PartialEq)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub enum Value {
    Null,
    Boolean(bool),

    /// A negative integer. Non-negative values canonicalize to
    /// [`Uint`](Value::Uint) on decode.
    Int(i64),
    Uint(u64),
    Double(f64),
    String(String),

    /// Opaque bytes.
    Binary(Vec<u8>),
    Array(Vec<Value>),

    /// An ordered mapping; keys are unique.
    Map(Vec<(String, Value)>),

    /// A typed extension: one application-defined type tag plus bytes.
    Ext(i8, Vec<u8>),
}

impl Value {
    /// The string slice if this is a string value.
    pub fn as_str(&self) -> Option<&str> {
        match self {
            Value::String(s) => Some(s),
            _ => None,
        }
    }
}

impl From<&str> for Value {
    fn from(s: &str) -> Value {
        Value::String(s.to_owned())
    }
}

impl From<String> for Value {
    fn from(s: String) -> Value {
        Value::String(s)
    }
}

impl From<bool> for Value {
    fn from(b: bool) -> Value {
        Value::Boolean(b)
    }
}

impl From<u64> for Value {
    fn from(v: u64) -> Value {
        Value::Uint(v)
    }
}

impl From<i64> for Value {
    fn from(v: i64) -> Value {
        if v >= 0 {
            Value::Uint(v as u64)
        } else {
            Value::Int(v)
        }
    }
}

impl From<f64> for Value {
    fn from(v: f64) -> Value {
        Value::Double(v)
    }
}

/// A borrowed view of a field value, produced by the zero-copy
/// decoder. String and binary payloads alias the input buffer;
/// container structure is rebuilt but element payloads are not copied.
#[derive(Debug, Clone, PartialEq)]
pub enum ValueRef<'a> {
    Null,
    Boolean(bool),
    Int(i64),
    Uint(u64),
    Double(f64),
    String(&'a str),
    Binary(&'a [u8]),
    Array(Vec<ValueRef<'a>>),
    Map(Vec<(&'a str, ValueRef<'a>)>),
    Ext(i8, &'a [u8]),
}

impl<'a> ValueRef<'a> {
    /// Detaches the value from the input buffer.
    pub fn to_value(&self) -> Value {
        match self {
            ValueRef::Null => Value::Null,
            ValueRef::Boolean(b) => Value::Boolean(*b),
            ValueRef::Int(v) => Value::Int(*v),
            ValueRef::Uint(v) => Value::Uint(*v),
            ValueRef::Double(v) => Value::Double(*v),
            ValueRef::String(s) => Value::String((*s).to_owned()),
            ValueRef::Binary(b) => Value::Binary((*b).to_vec()),
            ValueRef::Array(elems) => Value::Array(elems.iter().map(ValueRef::to_value).collect()),
            ValueRef::Map(pairs) => Value::Map(
                pairs
                    .iter()
                    .map(|(k, v)| ((*k).to_owned(), v.to_value()))
                    .collect(),
            ),
            ValueRef::Ext(ty, b) => Value::Ext(*ty, (*b).to_vec()),
        }
    }

    /// The string slice if this is a string value.
    pub fn as_str(&self) -> Option<&'a str> {
        match self {
            ValueRef::String(s) => Some(s),
            _ => None,
        }
    }
}

/// An owned record: the unit of data flowing through the pipeline.
#[derive(Debug, Clone, PartialEq)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub struct Record {
    pub timestamp: Timestamp,

    /// Out-of-band key/value pairs describing the record. Empty unless
    /// the record was encoded in [`TimestampMode::Native`].
    pub metadata: Vec<(String, Value)>,

    /// The record payload.
    pub body: Vec<(String, Value)>,
}

/// A borrowed record yielded by [`BatchDecoder`]. String and binary
/// payloads alias the decoder's input buffer, which must outlive the
/// record.
#[derive(Debug, Clone, PartialEq)]
pub struct RecordRef<'a> {
    pub timestamp: Timestamp,
    pub metadata: Vec<(&'a str, ValueRef<'a>)>,
    pub body: Vec<(&'a str, ValueRef<'a>)>,

    /// The encoded bytes of this record within the batch. Copying the
    /// span reproduces the record verbatim, which is how read-only
    /// filters rebuild a batch without re-encoding.
    pub raw: &'a [u8],
}

impl<'a> RecordRef<'a> {
    /// Detaches the record from the input buffer.
    pub fn to_record(&self) -> Record {
        Record {
            timestamp: self.timestamp,
            metadata: self
                .metadata
                .iter()
                .map(|(k, v)| ((*k).to_owned(), v.to_value()))
                .collect(),
            body: self
                .body
                .iter()
                .map(|(k, v)| ((*k).to_owned(), v.to_value()))
                .collect(),
        }
    }
}

#[cfg(test)]
mod timestamp_tests {
    use super::*;

    #[test]
    fn float_round_trip() {
        let ts = Timestamp::new(1_650_000_000, 250_000_000);
        let back = Timestamp::from_secs_f64(ts.as_secs_f64()).unwrap();
        assert_eq!(back.sec, ts.sec);
        // f64 has ~20 bits left for the fraction at this epoch
        assert!((back.nsec as i64 - ts.nsec as i64).abs() < 1_000);
    }

    #[test]
    fn float_rejects_out_of_range() {
        assert_eq!(Timestamp::from_secs_f64(-1.0), None);
        assert_eq!(Timestamp::from_secs_f64(f64::NAN), None);
        assert_eq!(Timestamp::from_secs_f64(f64::INFINITY), None);
        assert_eq!(Timestamp::from_secs_f64(u32::MAX as f64 + 2.0), None);
    }

    #[test]
    fn float_carry() {
        // rounds up into the next whole second
        let ts = Timestamp::from_secs_f64(41.999_999_999_9).unwrap();
        assert_eq!(ts, Timestamp::new(42, 0));
    }
}

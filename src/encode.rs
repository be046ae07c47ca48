//! Incremental batch encoder.
//!
//! Records are staged field by field between [`begin_record`] and
//! [`commit_record`]; map headers are finalized from the tracked entry
//! counts when the record is committed, and committed records
//! accumulate in the outgoing buffer until [`take_buffer`] is called.
//!
//! [`begin_record`]: BatchEncoder::begin_record
//! [`commit_record`]: BatchEncoder::commit_record
//! [`take_buffer`]: BatchEncoder::take_buffer

use crate::{Timestamp, Value};

/// The on-wire form of a record's timestamp, selected when the encoder
/// is constructed.
///
/// | Mode | On-wire form |
/// |------|--------------|
/// | `Native` | ext(type 0, 8 bytes big-endian `sec << 32 \| nsec`), paired with the metadata map in the record header |
/// | `Legacy` | float64 `seconds.fractional` |
/// | `ForwardV1` | ext(type 0, 8 bytes) as the first element of the record array |
/// | `FluentV1` | 2-element array `[sec, nsec]` |
/// | `FluentV2` | ext(type 0, 8 bytes) |
///
/// `Native` produces the v2 record form `[[timestamp, metadata], body]`;
/// every other mode produces `[timestamp, body]` and rejects metadata.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TimestampMode {
    Native,
    Legacy,
    ForwardV1,
    FluentV1,
    FluentV2,
}

impl Default for TimestampMode {
    fn default() -> Self {
        TimestampMode::Native
    }
}

/// The record region an append operation targets.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Field {
    /// The record's timestamp slot.
    Timestamp,

    /// The out-of-band metadata map. Only writable in
    /// [`TimestampMode::Native`].
    Metadata,

    /// The record payload map.
    Body,

    /// Extra trailing elements of the record root array. Decoders
    /// ignore them; the slot exists for forward compatibility.
    Root,
}

/// Set of errors that can occur during encode.
#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum EncodeError {
    /// The encoder is not in a state that permits the operation, e.g.
    /// committing a record without a timestamp, or appending outside
    /// an open record.
    #[error("encoder state does not permit {0}")]
    InvalidState(&'static str),

    /// A string, binary, extension or container length exceeds the
    /// wire format's 32-bit limit.
    #[error("length {0} exceeds the wire format's 32-bit limit")]
    Overflow(u64),
}

/// Staged content of the record currently being built.
#[derive(Default)]
struct RecordScratch {
    timestamp: Option<Timestamp>,
    metadata: Vec<u8>,
    metadata_entries: usize,
    body: Vec<u8>,
    body_entries: usize,
    root_extra: Vec<u8>,
    root_extra_entries: usize,
}

/// Builds batches of encoded records.
pub struct BatchEncoder {
    mode: TimestampMode,
    out: Vec<u8>,
    record: Option<RecordScratch>,
}

impl BatchEncoder {
    pub fn new(mode: TimestampMode) -> BatchEncoder {
        BatchEncoder {
            mode,
            out: Vec::new(),
            record: None,
        }
    }

    /// The timestamp mode selected at construction.
    pub fn mode(&self) -> TimestampMode {
        self.mode
    }

    /// Starts a new record. Fails if a record is already open.
    pub fn begin_record(&mut self) -> Result<(), EncodeError> {
        if self.record.is_some() {
            return Err(EncodeError::InvalidState("begin_record"));
        }
        self.record = Some(RecordScratch::default());
        Ok(())
    }

    /// Sets the record's timestamp. Required before commit.
    pub fn append_timestamp(&mut self, ts: Timestamp) -> Result<(), EncodeError> {
        let record = self.open_record("append_timestamp")?;
        record.timestamp = Some(ts);
        Ok(())
    }

    /// Appends a key/value pair to the metadata or body map, or a bare
    /// value to the record root. Every typed shortcut below funnels
    /// into this.
    pub fn append_pair(&mut self, field: Field, key: &str, value: &Value) -> Result<(), EncodeError> {
        let mode = self.mode;
        let record = self.open_record("append_pair")?;
        let (buf, entries) = match field {
            Field::Metadata => {
                if mode != TimestampMode::Native {
                    return Err(EncodeError::InvalidState("metadata outside native mode"));
                }
                (&mut record.metadata, &mut record.metadata_entries)
            }
            Field::Body => (&mut record.body, &mut record.body_entries),
            Field::Timestamp | Field::Root => {
                return Err(EncodeError::InvalidState("keyed append to non-map field"))
            }
        };
        write_str(buf, key)?;
        write_value(buf, value)?;
        *entries += 1;
        Ok(())
    }

    /// Appends a bare value to the record root, after the body map.
    pub fn append_root(&mut self, value: &Value) -> Result<(), EncodeError> {
        let record = self.open_record("append_root")?;
        write_value(&mut record.root_extra, value)?;
        record.root_extra_entries += 1;
        Ok(())
    }

    /// Appends pre-encoded bytes. For map fields the bytes must hold an
    /// even run of alternating key and value objects; `entries` is the
    /// number of pairs (or root elements) they contain.
    pub fn append_raw(&mut self, field: Field, raw: &[u8], entries: usize) -> Result<(), EncodeError> {
        let mode = self.mode;
        let record = self.open_record("append_raw")?;
        let (buf, count) = match field {
            Field::Metadata => {
                if mode != TimestampMode::Native {
                    return Err(EncodeError::InvalidState("metadata outside native mode"));
                }
                (&mut record.metadata, &mut record.metadata_entries)
            }
            Field::Body => (&mut record.body, &mut record.body_entries),
            Field::Root => (&mut record.root_extra, &mut record.root_extra_entries),
            Field::Timestamp => return Err(EncodeError::InvalidState("raw append to timestamp")),
        };
        buf.extend_from_slice(raw);
        *count += entries;
        Ok(())
    }

    pub fn append_null(&mut self, field: Field, key: &str) -> Result<(), EncodeError> {
        self.append_pair(field, key, &Value::Null)
    }

    pub fn append_boolean(&mut self, field: Field, key: &str, v: bool) -> Result<(), EncodeError> {
        self.append_pair(field, key, &Value::Boolean(v))
    }

    pub fn append_int8(&mut self, field: Field, key: &str, v: i8) -> Result<(), EncodeError> {
        self.append_pair(field, key, &Value::from(v as i64))
    }

    pub fn append_int16(&mut self, field: Field, key: &str, v: i16) -> Result<(), EncodeError> {
        self.append_pair(field, key, &Value::from(v as i64))
    }

    pub fn append_int32(&mut self, field: Field, key: &str, v: i32) -> Result<(), EncodeError> {
        self.append_pair(field, key, &Value::from(v as i64))
    }

    pub fn append_int64(&mut self, field: Field, key: &str, v: i64) -> Result<(), EncodeError> {
        self.append_pair(field, key, &Value::from(v))
    }

    pub fn append_uint8(&mut self, field: Field, key: &str, v: u8) -> Result<(), EncodeError> {
        self.append_pair(field, key, &Value::Uint(v as u64))
    }

    pub fn append_uint16(&mut self, field: Field, key: &str, v: u16) -> Result<(), EncodeError> {
        self.append_pair(field, key, &Value::Uint(v as u64))
    }

    pub fn append_uint32(&mut self, field: Field, key: &str, v: u32) -> Result<(), EncodeError> {
        self.append_pair(field, key, &Value::Uint(v as u64))
    }

    pub fn append_uint64(&mut self, field: Field, key: &str, v: u64) -> Result<(), EncodeError> {
        self.append_pair(field, key, &Value::Uint(v))
    }

    pub fn append_double(&mut self, field: Field, key: &str, v: f64) -> Result<(), EncodeError> {
        self.append_pair(field, key, &Value::Double(v))
    }

    pub fn append_string(&mut self, field: Field, key: &str, v: &str) -> Result<(), EncodeError> {
        self.append_pair(field, key, &Value::String(v.to_owned()))
    }

    pub fn append_binary(&mut self, field: Field, key: &str, v: &[u8]) -> Result<(), EncodeError> {
        self.append_pair(field, key, &Value::Binary(v.to_vec()))
    }

    pub fn append_ext(
        &mut self,
        field: Field,
        key: &str,
        ty: i8,
        v: &[u8],
    ) -> Result<(), EncodeError> {
        self.append_pair(field, key, &Value::Ext(ty, v.to_vec()))
    }

    /// Finalizes the open record and appends it to the outgoing
    /// buffer. The timestamp is always the first field of the encoded
    /// record, in the mode selected at construction.
    pub fn commit_record(&mut self) -> Result<(), EncodeError> {
        let record = match self.record.take() {
            Some(r) => r,
            None => return Err(EncodeError::InvalidState("commit_record")),
        };
        let ts = match record.timestamp {
            Some(ts) => ts,
            None => {
                // leave the encoder reusable; the staged fields are lost
                return Err(EncodeError::InvalidState("commit without timestamp"));
            }
        };

        let root_len = 2 + record.root_extra_entries;
        write_array_header(&mut self.out, root_len as u64)?;

        match self.mode {
            TimestampMode::Native => {
                write_array_header(&mut self.out, 2)?;
                write_timestamp_ext(&mut self.out, ts);
                write_map_header(&mut self.out, record.metadata_entries as u64)?;
                self.out.extend_from_slice(&record.metadata);
            }
            TimestampMode::Legacy => {
                write_f64(&mut self.out, ts.as_secs_f64());
            }
            TimestampMode::ForwardV1 | TimestampMode::FluentV2 => {
                write_timestamp_ext(&mut self.out, ts);
            }
            TimestampMode::FluentV1 => {
                write_array_header(&mut self.out, 2)?;
                write_uint(&mut self.out, ts.sec as u64);
                write_uint(&mut self.out, ts.nsec as u64);
            }
        }

        write_map_header(&mut self.out, record.body_entries as u64)?;
        self.out.extend_from_slice(&record.body);
        self.out.extend_from_slice(&record.root_extra);
        Ok(())
    }

    /// Discards the open record, if any. Committed records stay.
    pub fn rollback_record(&mut self) {
        self.record = None;
    }

    /// Discards everything: the open record and the outgoing buffer.
    pub fn reset(&mut self) {
        self.record = None;
        self.out.clear();
    }

    /// The committed records so far.
    pub fn buffer(&self) -> &[u8] {
        &self.out
    }

    /// Takes the outgoing buffer, leaving the encoder empty and ready
    /// for the next batch. An open record is discarded.
    pub fn take_buffer(&mut self) -> Vec<u8> {
        self.record = None;
        std::mem::take(&mut self.out)
    }

    fn open_record(&mut self, op: &'static str) -> Result<&mut RecordScratch, EncodeError> {
        self.record.as_mut().ok_or(EncodeError::InvalidState(op))
    }
}

/// Encodes a complete [`Record`](crate::Record), a convenience over the
/// incremental interface.
pub fn encode_record(
    enc: &mut BatchEncoder,
    record: &crate::Record,
) -> Result<(), EncodeError> {
    enc.begin_record()?;
    enc.append_timestamp(record.timestamp)?;
    for (k, v) in &record.metadata {
        enc.append_pair(Field::Metadata, k, v)?;
    }
    for (k, v) in &record.body {
        enc.append_pair(Field::Body, k, v)?;
    }
    enc.commit_record()
}

// Primitive writers. Always the smallest encoding that fits, so that a
// decode/re-encode cycle is byte-stable on canonical input.

pub(crate) fn write_value(out: &mut Vec<u8>, value: &Value) -> Result<(), EncodeError> {
    match value {
        Value::Null => out.push(0xc0),
        Value::Boolean(false) => out.push(0xc2),
        Value::Boolean(true) => out.push(0xc3),
        Value::Int(v) => write_int(out, *v),
        Value::Uint(v) => write_uint(out, *v),
        Value::Double(v) => write_f64(out, *v),
        Value::String(s) => write_str(out, s)?,
        Value::Binary(b) => write_bin(out, b)?,
        Value::Array(elems) => {
            write_array_header(out, elems.len() as u64)?;
            for elem in elems {
                write_value(out, elem)?;
            }
        }
        Value::Map(pairs) => {
            write_map_header(out, pairs.len() as u64)?;
            for (k, v) in pairs {
                write_str(out, k)?;
                write_value(out, v)?;
            }
        }
        Value::Ext(ty, b) => write_ext(out, *ty, b)?,
    }
    Ok(())
}

pub(crate) fn write_uint(out: &mut Vec<u8>, v: u64) {
    if v < 0x80 {
        out.push(v as u8);
    } else if v <= u8::MAX as u64 {
        out.push(0xcc);
        out.push(v as u8);
    } else if v <= u16::MAX as u64 {
        out.push(0xcd);
        out.extend_from_slice(&(v as u16).to_be_bytes());
    } else if v <= u32::MAX as u64 {
        out.push(0xce);
        out.extend_from_slice(&(v as u32).to_be_bytes());
    } else {
        out.push(0xcf);
        out.extend_from_slice(&v.to_be_bytes());
    }
}

pub(crate) fn write_int(out: &mut Vec<u8>, v: i64) {
    if v >= 0 {
        write_uint(out, v as u64);
    } else if v >= -32 {
        out.push(v as i8 as u8);
    } else if v >= i8::MIN as i64 {
        out.push(0xd0);
        out.push(v as i8 as u8);
    } else if v >= i16::MIN as i64 {
        out.push(0xd1);
        out.extend_from_slice(&(v as i16).to_be_bytes());
    } else if v >= i32::MIN as i64 {
        out.push(0xd2);
        out.extend_from_slice(&(v as i32).to_be_bytes());
    } else {
        out.push(0xd3);
        out.extend_from_slice(&v.to_be_bytes());
    }
}

pub(crate) fn write_f64(out: &mut Vec<u8>, v: f64) {
    out.push(0xcb);
    out.extend_from_slice(&v.to_be_bytes());
}

pub(crate) fn write_str(out: &mut Vec<u8>, s: &str) -> Result<(), EncodeError> {
    let len = s.len();
    if len < 32 {
        out.push(0xa0 | len as u8);
    } else if len <= u8::MAX as usize {
        out.push(0xd9);
        out.push(len as u8);
    } else if len <= u16::MAX as usize {
        out.push(0xda);
        out.extend_from_slice(&(len as u16).to_be_bytes());
    } else if len <= u32::MAX as usize {
        out.push(0xdb);
        out.extend_from_slice(&(len as u32).to_be_bytes());
    } else {
        return Err(EncodeError::Overflow(len as u64));
    }
    out.extend_from_slice(s.as_bytes());
    Ok(())
}

pub(crate) fn write_bin(out: &mut Vec<u8>, b: &[u8]) -> Result<(), EncodeError> {
    let len = b.len();
    if len <= u8::MAX as usize {
        out.push(0xc4);
        out.push(len as u8);
    } else if len <= u16::MAX as usize {
        out.push(0xc5);
        out.extend_from_slice(&(len as u16).to_be_bytes());
    } else if len <= u32::MAX as usize {
        out.push(0xc6);
        out.extend_from_slice(&(len as u32).to_be_bytes());
    } else {
        return Err(EncodeError::Overflow(len as u64));
    }
    out.extend_from_slice(b);
    Ok(())
}

pub(crate) fn write_ext(out: &mut Vec<u8>, ty: i8, b: &[u8]) -> Result<(), EncodeError> {
    match b.len() {
        1 => out.push(0xd4),
        2 => out.push(0xd5),
        4 => out.push(0xd6),
        8 => out.push(0xd7),
        16 => out.push(0xd8),
        len if len <= u8::MAX as usize => {
            out.push(0xc7);
            out.push(len as u8);
        }
        len if len <= u16::MAX as usize => {
            out.push(0xc8);
            out.extend_from_slice(&(len as u16).to_be_bytes());
        }
        len if len <= u32::MAX as usize => {
            out.push(0xc9);
            out.extend_from_slice(&(len as u32).to_be_bytes());
        }
        len => return Err(EncodeError::Overflow(len as u64)),
    }
    out.push(ty as u8);
    out.extend_from_slice(b);
    Ok(())
}

pub(crate) fn write_array_header(out: &mut Vec<u8>, len: u64) -> Result<(), EncodeError> {
    if len < 16 {
        out.push(0x90 | len as u8);
    } else if len <= u16::MAX as u64 {
        out.push(0xdc);
        out.extend_from_slice(&(len as u16).to_be_bytes());
    } else if len <= u32::MAX as u64 {
        out.push(0xdd);
        out.extend_from_slice(&(len as u32).to_be_bytes());
    } else {
        return Err(EncodeError::Overflow(len));
    }
    Ok(())
}

pub(crate) fn write_map_header(out: &mut Vec<u8>, len: u64) -> Result<(), EncodeError> {
    if len < 16 {
        out.push(0x80 | len as u8);
    } else if len <= u16::MAX as u64 {
        out.push(0xde);
        out.extend_from_slice(&(len as u16).to_be_bytes());
    } else if len <= u32::MAX as u64 {
        out.push(0xdf);
        out.extend_from_slice(&(len as u32).to_be_bytes());
    } else {
        return Err(EncodeError::Overflow(len));
    }
    Ok(())
}

/// ext type 0, 8 bytes big-endian: `sec << 32 | nsec`.
fn write_timestamp_ext(out: &mut Vec<u8>, ts: Timestamp) {
    out.push(0xd7);
    out.push(0x00);
    out.extend_from_slice(&ts.sec.to_be_bytes());
    out.extend_from_slice(&ts.nsec.to_be_bytes());
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::Timestamp;

    #[test]
    fn commit_requires_timestamp() {
        let mut enc = BatchEncoder::new(TimestampMode::Native);
        enc.begin_record().unwrap();
        enc.append_string(Field::Body, "k", "v").unwrap();
        assert_eq!(
            enc.commit_record(),
            Err(EncodeError::InvalidState("commit without timestamp"))
        );
        // the encoder stays usable
        enc.begin_record().unwrap();
        enc.append_timestamp(Timestamp::new(0, 0)).unwrap();
        enc.commit_record().unwrap();
    }

    #[test]
    fn append_requires_open_record() {
        let mut enc = BatchEncoder::new(TimestampMode::Native);
        assert!(matches!(
            enc.append_string(Field::Body, "k", "v"),
            Err(EncodeError::InvalidState(_))
        ));
    }

    #[test]
    fn double_begin_is_an_error() {
        let mut enc = BatchEncoder::new(TimestampMode::Native);
        enc.begin_record().unwrap();
        assert_eq!(
            enc.begin_record(),
            Err(EncodeError::InvalidState("begin_record"))
        );
    }

    #[test]
    fn metadata_rejected_outside_native_mode() {
        let mut enc = BatchEncoder::new(TimestampMode::FluentV1);
        enc.begin_record().unwrap();
        assert!(matches!(
            enc.append_string(Field::Metadata, "k", "v"),
            Err(EncodeError::InvalidState(_))
        ));
    }

    #[test]
    fn timestamp_modes_on_wire() {
        let ts = Timestamp::new(1, 2);
        let body = |enc: &mut BatchEncoder| {
            enc.begin_record().unwrap();
            enc.append_timestamp(ts).unwrap();
            enc.commit_record().unwrap();
            enc.take_buffer()
        };

        let mut enc = BatchEncoder::new(TimestampMode::FluentV2);
        assert_eq!(
            body(&mut enc),
            // [fixext8(0, sec|nsec), {}]
            vec![0x92, 0xd7, 0x00, 0, 0, 0, 1, 0, 0, 0, 2, 0x80],
        );

        let mut enc = BatchEncoder::new(TimestampMode::FluentV1);
        assert_eq!(
            body(&mut enc),
            // [[1, 2], {}]
            vec![0x92, 0x92, 0x01, 0x02, 0x80],
        );

        let mut enc = BatchEncoder::new(TimestampMode::Native);
        assert_eq!(
            body(&mut enc),
            // [[fixext8, {}], {}]
            vec![0x92, 0x92, 0xd7, 0x00, 0, 0, 0, 1, 0, 0, 0, 2, 0x80, 0x80],
        );

        let mut enc = BatchEncoder::new(TimestampMode::Legacy);
        let mut expected = vec![0x92, 0xcb];
        expected.extend_from_slice(&ts.as_secs_f64().to_be_bytes());
        expected.push(0x80);
        assert_eq!(body(&mut enc), expected);
    }

    #[test]
    fn minimal_integer_encodings() {
        let mut out = Vec::new();
        write_int(&mut out, -1);
        write_int(&mut out, -33);
        write_int(&mut out, 5);
        write_uint(&mut out, 200);
        write_uint(&mut out, 70_000);
        assert_eq!(
            out,
            vec![0xff, 0xd0, 0xdf, 0x05, 0xcc, 200, 0xce, 0, 1, 0x11, 0x70],
        );
    }

    #[test]
    fn rollback_discards_only_open_record() {
        let mut enc = BatchEncoder::new(TimestampMode::FluentV2);
        enc.begin_record().unwrap();
        enc.append_timestamp(Timestamp::new(1, 0)).unwrap();
        enc.commit_record().unwrap();
        let committed = enc.buffer().len();

        enc.begin_record().unwrap();
        enc.append_string(Field::Body, "k", "v").unwrap();
        enc.rollback_record();
        assert_eq!(enc.buffer().len(), committed);
    }
}

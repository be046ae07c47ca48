//! Restartable streaming batch decoder.
//!
//! A batch is the plain concatenation of encoded records with no frame
//! header, so the decoder works from a byte slice and an offset: each
//! call to [`next_record`](BatchDecoder::next_record) yields one
//! record, reports that more bytes are needed, or reports a malformed
//! record. Truncation never advances the offset, which lets a caller
//! re-feed a longer buffer and resume at the same position.
//!
//! Decoding is zero-copy: string and binary payloads of the yielded
//! [`RecordRef`]s alias the input buffer.

use bitmatch::bitmatch;
use std::convert::TryInto;

use crate::{RecordRef, Timestamp, ValueRef, NANOS_PER_SEC};

/// How far past a malformed record the decoder scans for the start of
/// the next record before abandoning the stream.
pub const RESYNC_WINDOW: usize = 1024;

/// Containers nested deeper than this are rejected.
const MAX_DEPTH: usize = 128;

/// Set of malformed-record conditions that can occur during decode.
#[derive(Debug, Clone, PartialEq, thiserror::Error)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub enum MalformedRecord {
    /// The format tag is the reserved byte `0xc1`.
    #[error("reserved format tag")]
    ReservedTag,

    /// A record root must be an array of at least two elements.
    #[error("record root is not an array (tag {0:#04x})")]
    RootNotArray(u8),

    /// The record root array has fewer than two elements.
    #[error("record root has {0} elements, expected at least 2")]
    ShortRecordRoot(usize),

    /// The first root element is not one of the recognized timestamp
    /// encodings.
    #[error("unrecognized timestamp encoding")]
    InvalidTimestamp,

    /// Timestamp nanoseconds at or above 10^9.
    #[error("timestamp nanoseconds out of range: {0}")]
    NanosOutOfRange(u32),

    /// The record header carries a metadata slot that is not a map.
    #[error("record metadata is not a map")]
    MetadataNotMap,

    /// The record body is not a map.
    #[error("record body is not a map")]
    BodyNotMap,

    /// A map key is not a string.
    #[error("map key is not a string")]
    NonStringKey,

    /// A string payload is not valid UTF-8.
    #[error("string payload is not valid UTF-8")]
    InvalidUtf8,

    /// Containers nested deeper than the decoder's limit.
    #[error("nesting exceeds {} levels", MAX_DEPTH)]
    DepthExceeded,
}

/// Set of errors that can occur during decode.
#[derive(Debug, Clone, PartialEq, thiserror::Error)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub enum DecodeError {
    /// The input ends inside a record. The offset has not advanced;
    /// feeding a longer buffer at the same offset resumes cleanly.
    #[error("need more bytes at offset {offset}")]
    Truncated { offset: usize },

    /// The record starting at `offset` cannot be decoded. The decoder
    /// has advanced to the next plausible record start if one was
    /// found within [`RESYNC_WINDOW`]; otherwise the stream is
    /// abandoned and every further call repeats this error.
    #[error("malformed record at offset {offset}: {reason}")]
    Malformed {
        offset: usize,
        reason: MalformedRecord,
    },
}

enum ErrorInt {
    Truncated,
    Malformed(MalformedRecord),
}

impl From<MalformedRecord> for ErrorInt {
    fn from(m: MalformedRecord) -> ErrorInt {
        ErrorInt::Malformed(m)
    }
}

struct Reader<'a> {
    buf: &'a [u8],
    pos: usize,
}

impl<'a> Reader<'a> {
    fn remaining(&self) -> usize {
        self.buf.len() - self.pos
    }

    fn u8(&mut self) -> Result<u8, ErrorInt> {
        let b = *self.buf.get(self.pos).ok_or(ErrorInt::Truncated)?;
        self.pos += 1;
        Ok(b)
    }

    fn bytes(&mut self, n: usize) -> Result<&'a [u8], ErrorInt> {
        if self.remaining() < n {
            return Err(ErrorInt::Truncated);
        }
        let s = &self.buf[self.pos..self.pos + n];
        self.pos += n;
        Ok(s)
    }

    fn be_u16(&mut self) -> Result<u16, ErrorInt> {
        Ok(u16::from_be_bytes(self.bytes(2)?.try_into().unwrap()))
    }

    fn be_u32(&mut self) -> Result<u32, ErrorInt> {
        Ok(u32::from_be_bytes(self.bytes(4)?.try_into().unwrap()))
    }

    fn be_u64(&mut self) -> Result<u64, ErrorInt> {
        Ok(u64::from_be_bytes(self.bytes(8)?.try_into().unwrap()))
    }

    /// A declared element count can never be satisfied with fewer
    /// bytes than elements; checking up front bounds allocation by the
    /// input size.
    fn check_count(&self, count: usize) -> Result<(), ErrorInt> {
        if count > self.remaining() {
            return Err(ErrorInt::Truncated);
        }
        Ok(())
    }

    fn str_payload(&mut self, len: usize) -> Result<&'a str, ErrorInt> {
        std::str::from_utf8(self.bytes(len)?).map_err(|_| MalformedRecord::InvalidUtf8.into())
    }
}

/// Reads the length that follows a string-family tag, or `None` if the
/// tag belongs to another family.
#[bitmatch]
fn str_len(r: &mut Reader, tag: u8) -> Result<Option<usize>, ErrorInt> {
    #[bitmatch]
    match tag {
        "101n_nnnn" => Ok(Some(n as usize)),
        "1101_1001" => Ok(Some(r.u8()? as usize)),
        "1101_1010" => Ok(Some(r.be_u16()? as usize)),
        "1101_1011" => Ok(Some(r.be_u32()? as usize)),
        "????_????" => Ok(None),
    }
}

fn read_key<'a>(r: &mut Reader<'a>) -> Result<&'a str, ErrorInt> {
    let tag = r.u8()?;
    match str_len(r, tag)? {
        Some(len) => r.str_payload(len),
        None => Err(MalformedRecord::NonStringKey.into()),
    }
}

#[bitmatch]
fn read_value<'a>(r: &mut Reader<'a>, depth: usize) -> Result<ValueRef<'a>, ErrorInt> {
    if depth > MAX_DEPTH {
        return Err(MalformedRecord::DepthExceeded.into());
    }

    let tag = r.u8()?;
    if let Some(len) = str_len(r, tag)? {
        return Ok(ValueRef::String(r.str_payload(len)?));
    }

    #[bitmatch]
    match tag {
        // fix families
        "0nnn_nnnn" => Ok(ValueRef::Uint(n as u64)),
        "111n_nnnn" => Ok(ValueRef::Int(n as i64 - 32)),
        "1000_nnnn" => read_map(r, n as usize, depth),
        "1001_nnnn" => read_array(r, n as usize, depth),

        // single-byte values
        "1100_0000" => Ok(ValueRef::Null),
        "1100_0001" => Err(MalformedRecord::ReservedTag.into()),
        "1100_0010" => Ok(ValueRef::Boolean(false)),
        "1100_0011" => Ok(ValueRef::Boolean(true)),

        // binary
        "1100_0100" => {
            let len = r.u8()? as usize;
            Ok(ValueRef::Binary(r.bytes(len)?))
        }
        "1100_0101" => {
            let len = r.be_u16()? as usize;
            Ok(ValueRef::Binary(r.bytes(len)?))
        }
        "1100_0110" => {
            let len = r.be_u32()? as usize;
            Ok(ValueRef::Binary(r.bytes(len)?))
        }

        // ext
        "1100_0111" => {
            let len = r.u8()? as usize;
            read_ext(r, len)
        }
        "1100_1000" => {
            let len = r.be_u16()? as usize;
            read_ext(r, len)
        }
        "1100_1001" => {
            let len = r.be_u32()? as usize;
            read_ext(r, len)
        }

        // floats; float32 widens losslessly to double
        "1100_1010" => Ok(ValueRef::Double(
            f32::from_be_bytes(r.bytes(4)?.try_into().unwrap()) as f64,
        )),
        "1100_1011" => Ok(ValueRef::Double(f64::from_be_bytes(
            r.bytes(8)?.try_into().unwrap(),
        ))),

        // unsigned
        "1100_1100" => Ok(ValueRef::Uint(r.u8()? as u64)),
        "1100_1101" => Ok(ValueRef::Uint(r.be_u16()? as u64)),
        "1100_1110" => Ok(ValueRef::Uint(r.be_u32()? as u64)),
        "1100_1111" => Ok(ValueRef::Uint(r.be_u64()?)),

        // signed; non-negative values canonicalize to Uint
        "1101_0000" => Ok(int_value(r.u8()? as i8 as i64)),
        "1101_0001" => Ok(int_value(r.be_u16()? as i16 as i64)),
        "1101_0010" => Ok(int_value(r.be_u32()? as i32 as i64)),
        "1101_0011" => Ok(int_value(r.be_u64()? as i64)),

        // fixext
        "1101_0100" => read_ext(r, 1),
        "1101_0101" => read_ext(r, 2),
        "1101_0110" => read_ext(r, 4),
        "1101_0111" => read_ext(r, 8),
        "1101_1000" => read_ext(r, 16),

        // arrays and maps with explicit length
        "1101_1100" => {
            let len = r.be_u16()? as usize;
            read_array(r, len, depth)
        }
        "1101_1101" => {
            let len = r.be_u32()? as usize;
            read_array(r, len, depth)
        }
        "1101_1110" => {
            let len = r.be_u16()? as usize;
            read_map(r, len, depth)
        }
        "1101_1111" => {
            let len = r.be_u32()? as usize;
            read_map(r, len, depth)
        }

        // str8/16/32 and fixstr were consumed above
        "????_????" => unreachable!(),
    }
}

fn int_value<'a>(v: i64) -> ValueRef<'a> {
    if v >= 0 {
        ValueRef::Uint(v as u64)
    } else {
        ValueRef::Int(v)
    }
}

fn read_ext<'a>(r: &mut Reader<'a>, len: usize) -> Result<ValueRef<'a>, ErrorInt> {
    let ty = r.u8()? as i8;
    Ok(ValueRef::Ext(ty, r.bytes(len)?))
}

fn read_array<'a>(r: &mut Reader<'a>, count: usize, depth: usize) -> Result<ValueRef<'a>, ErrorInt> {
    r.check_count(count)?;
    let mut elems = Vec::with_capacity(count);
    for _ in 0..count {
        elems.push(read_value(r, depth + 1)?);
    }
    Ok(ValueRef::Array(elems))
}

fn read_map<'a>(r: &mut Reader<'a>, count: usize, depth: usize) -> Result<ValueRef<'a>, ErrorInt> {
    r.check_count(count)?;
    let mut pairs = Vec::with_capacity(count);
    for _ in 0..count {
        let key = read_key(r)?;
        let value = read_value(r, depth + 1)?;
        pairs.push((key, value));
    }
    Ok(ValueRef::Map(pairs))
}

/// Skims over one value without materializing it.
fn skip_value(r: &mut Reader, depth: usize) -> Result<(), ErrorInt> {
    if depth > MAX_DEPTH {
        return Err(MalformedRecord::DepthExceeded.into());
    }

    let tag = r.u8()?;
    if let Some(len) = str_len(r, tag)? {
        r.bytes(len)?;
        return Ok(());
    }

    match tag {
        // fixint, nil, booleans
        0x00..=0x7f | 0xe0..=0xff | 0xc0 | 0xc2 | 0xc3 => {}
        0xc1 => return Err(MalformedRecord::ReservedTag.into()),

        // fix containers
        0x80..=0x8f => skip_n(r, 2 * (tag & 0x0f) as usize, depth)?,
        0x90..=0x9f => skip_n(r, (tag & 0x0f) as usize, depth)?,

        // binary
        0xc4 => {
            let len = r.u8()? as usize;
            r.bytes(len)?;
        }
        0xc5 => {
            let len = r.be_u16()? as usize;
            r.bytes(len)?;
        }
        0xc6 => {
            let len = r.be_u32()? as usize;
            r.bytes(len)?;
        }

        // ext: payload plus the type byte
        0xc7 => {
            let len = r.u8()? as usize;
            r.bytes(len + 1)?;
        }
        0xc8 => {
            let len = r.be_u16()? as usize;
            r.bytes(len + 1)?;
        }
        0xc9 => {
            let len = r.be_u32()? as usize;
            r.bytes(len + 1)?;
        }

        // fixed-width scalars
        0xca => {
            r.bytes(4)?;
        }
        0xcb => {
            r.bytes(8)?;
        }
        0xcc | 0xd0 => {
            r.bytes(1)?;
        }
        0xcd | 0xd1 => {
            r.bytes(2)?;
        }
        0xce | 0xd2 => {
            r.bytes(4)?;
        }
        0xcf | 0xd3 => {
            r.bytes(8)?;
        }

        // fixext: payload plus the type byte
        0xd4 => {
            r.bytes(2)?;
        }
        0xd5 => {
            r.bytes(3)?;
        }
        0xd6 => {
            r.bytes(5)?;
        }
        0xd7 => {
            r.bytes(9)?;
        }
        0xd8 => {
            r.bytes(17)?;
        }

        // containers with explicit length
        0xdc => {
            let len = r.be_u16()? as usize;
            skip_n(r, len, depth)?;
        }
        0xdd => {
            let len = r.be_u32()? as usize;
            skip_n(r, len, depth)?;
        }
        0xde => {
            let len = r.be_u16()? as usize;
            skip_n(r, 2 * len, depth)?;
        }
        0xdf => {
            let len = r.be_u32()? as usize;
            skip_n(r, 2 * len, depth)?;
        }

        // str8/16/32 and fixstr were consumed above
        _ => unreachable!(),
    }
    Ok(())
}

fn skip_n(r: &mut Reader, count: usize, depth: usize) -> Result<(), ErrorInt> {
    r.check_count(count)?;
    for _ in 0..count {
        skip_value(r, depth + 1)?;
    }
    Ok(())
}

/// Normalizes the timestamp slot of a record. `allow_header` permits
/// the v2 `[timestamp, metadata]` header form at this level.
fn interpret_timestamp<'a>(
    value: ValueRef<'a>,
    allow_header: bool,
) -> Result<(Timestamp, Vec<(&'a str, ValueRef<'a>)>), MalformedRecord> {
    let ts = match value {
        // bare seconds; degenerate integer form
        ValueRef::Uint(sec) if sec <= u32::MAX as u64 => Timestamp::new(sec as u32, 0),

        // legacy float
        ValueRef::Double(secs) => {
            Timestamp::from_secs_f64(secs).ok_or(MalformedRecord::InvalidTimestamp)?
        }

        // native / forward-v1 / fluent-v2 event time
        ValueRef::Ext(0, bytes) if bytes.len() == 8 => {
            let sec = u32::from_be_bytes(bytes[0..4].try_into().unwrap());
            let nsec = u32::from_be_bytes(bytes[4..8].try_into().unwrap());
            if nsec >= NANOS_PER_SEC {
                return Err(MalformedRecord::NanosOutOfRange(nsec));
            }
            Timestamp::new(sec, nsec)
        }

        ValueRef::Array(mut elems) => {
            if elems.len() != 2 {
                return Err(MalformedRecord::InvalidTimestamp);
            }
            if allow_header && matches!(elems[1], ValueRef::Map(_)) {
                // v2 header form: [timestamp, metadata-map]
                let metadata = match elems.pop() {
                    Some(ValueRef::Map(pairs)) => pairs,
                    _ => unreachable!(),
                };
                let (ts, _) = interpret_timestamp(elems.pop().unwrap(), false)?;
                return Ok((ts, metadata));
            }

            // fluent-v1 array form: [sec, nsec]
            let sec = integer_field(&elems[0])?;
            let nsec = integer_field(&elems[1])?;
            if nsec >= NANOS_PER_SEC {
                return Err(MalformedRecord::NanosOutOfRange(nsec));
            }
            Timestamp::new(sec, nsec)
        }

        _ => return Err(MalformedRecord::InvalidTimestamp),
    };

    Ok((ts, Vec::new()))
}

fn integer_field(value: &ValueRef) -> Result<u32, MalformedRecord> {
    match value {
        ValueRef::Uint(v) if *v <= u32::MAX as u64 => Ok(*v as u32),
        _ => Err(MalformedRecord::InvalidTimestamp),
    }
}

fn read_record<'a>(r: &mut Reader<'a>) -> Result<RecordRef<'a>, ErrorInt> {
    let start = r.pos;

    let tag = r.u8()?;
    let root_len = match tag {
        0x90..=0x9f => (tag & 0x0f) as usize,
        0xdc => r.be_u16()? as usize,
        0xdd => r.be_u32()? as usize,
        other => return Err(MalformedRecord::RootNotArray(other).into()),
    };
    if root_len < 2 {
        return Err(MalformedRecord::ShortRecordRoot(root_len).into());
    }
    r.check_count(root_len)?;

    let header = read_value(r, 1)?;
    let (timestamp, metadata) = interpret_timestamp(header, true)?;

    let body = match read_value(r, 1)? {
        ValueRef::Map(pairs) => pairs,
        _ => return Err(MalformedRecord::BodyNotMap.into()),
    };

    // tolerate unused trailing root elements
    for _ in 2..root_len {
        skip_value(r, 1)?;
    }

    Ok(RecordRef {
        timestamp,
        metadata,
        body,
        raw: &r.buf[start..r.pos],
    })
}

/// Streaming decoder over a batch buffer.
pub struct BatchDecoder<'a> {
    buf: &'a [u8],
    offset: usize,
    abandoned: Option<DecodeError>,
}

impl<'a> BatchDecoder<'a> {
    pub fn new(buf: &'a [u8]) -> BatchDecoder<'a> {
        BatchDecoder::with_offset(buf, 0)
    }

    /// Resumes decoding at a previously reported offset, e.g. after
    /// the caller appended more bytes to a truncated buffer.
    pub fn with_offset(buf: &'a [u8], offset: usize) -> BatchDecoder<'a> {
        BatchDecoder {
            buf,
            offset,
            abandoned: None,
        }
    }

    /// The offset of the next record to decode.
    pub fn offset(&self) -> usize {
        self.offset
    }

    /// Decodes the next record. `Ok(None)` is the clean end of the
    /// batch. See [`DecodeError`] for the truncation and resync
    /// contracts.
    pub fn next_record(&mut self) -> Result<Option<RecordRef<'a>>, DecodeError> {
        if let Some(err) = &self.abandoned {
            return Err(err.clone());
        }
        if self.offset >= self.buf.len() {
            return Ok(None);
        }

        let mut r = Reader {
            buf: self.buf,
            pos: self.offset,
        };
        match read_record(&mut r) {
            Ok(record) => {
                self.offset = r.pos;
                Ok(Some(record))
            }
            Err(ErrorInt::Truncated) => Err(DecodeError::Truncated {
                offset: self.offset,
            }),
            Err(ErrorInt::Malformed(reason)) => {
                let err = DecodeError::Malformed {
                    offset: self.offset,
                    reason,
                };
                match resync(self.buf, self.offset + 1) {
                    Some(pos) => self.offset = pos,
                    None => {
                        self.offset = self.buf.len();
                        self.abandoned = Some(err.clone());
                    }
                }
                Err(err)
            }
        }
    }

    /// Returns an iterator over the remaining records.
    pub fn records(&mut self) -> Records<'_, 'a> {
        Records {
            decoder: self,
            done: false,
        }
    }
}

/// Scans for the next plausible record start (an array header tag)
/// within the resync window.
fn resync(buf: &[u8], from: usize) -> Option<usize> {
    if from >= buf.len() {
        return None;
    }
    let end = buf.len().min(from + RESYNC_WINDOW);
    buf[from..end]
        .iter()
        .position(|&b| matches!(b, 0x92..=0x9f | 0xdc | 0xdd))
        .map(|i| from + i)
}

/// Iterator over the records of a batch.
///
/// Iteration ends at the clean end of the batch, or after yielding a
/// truncation or abandoned-stream error once. Malformed records with a
/// successful resync are yielded as errors and iteration continues.
pub struct Records<'d, 'a> {
    decoder: &'d mut BatchDecoder<'a>,
    done: bool,
}

impl<'d, 'a> Iterator for Records<'d, 'a> {
    type Item = Result<RecordRef<'a>, DecodeError>;

    fn next(&mut self) -> Option<Self::Item> {
        if self.done {
            return None;
        }
        match self.decoder.next_record() {
            Ok(Some(record)) => Some(Ok(record)),
            Ok(None) => None,
            Err(err) => {
                // truncation and abandonment are sticky; stop after
                // reporting them once
                if matches!(err, DecodeError::Truncated { .. }) || self.decoder.abandoned.is_some()
                {
                    self.done = true;
                }
                Some(Err(err))
            }
        }
    }
}

/// Decodes a complete batch into owned records, a convenience over the
/// streaming interface.
pub fn decode_batch(buf: &[u8]) -> Result<Vec<crate::Record>, DecodeError> {
    let mut decoder = BatchDecoder::new(buf);
    let mut records = Vec::new();
    while let Some(record) = decoder.next_record()? {
        records.push(record.to_record());
    }
    Ok(records)
}

/// Counts the records in the well-formed prefix of a batch without
/// materializing values. Used for pipeline counters.
pub fn count_records(buf: &[u8]) -> usize {
    let mut r = Reader { buf, pos: 0 };
    let mut count = 0;
    while r.remaining() > 0 {
        if skip_value(&mut r, 0).is_err() {
            break;
        }
        count += 1;
    }
    count
}

//! Snapshot Encoding
//!
//! Tables are saved as a flat list of records. Each value carries its own tag
//! byte, so a snapshot can be decoded without knowing what was stored.
//!
//! ## Layout (all integers big-endian)
//!
//! ```text
//! ┌────────┬─────────┬─────────────┐
//! │ "TDKV" │ version │ count (u64) │   header
//! └────────┴─────────┴─────────────┘
//! ┌──────────────┬─────┬──────────────────────┬─────┬─────────┐
//! │ key len (u32)│ key │ has expiry (u8)      │ tag │ payload │   × count
//! │              │     │ [+ unix millis (u64)]│     │         │
//! └──────────────┴─────┴──────────────────────┴─────┴─────────┘
//! ```
//!
//! Fixed-width payloads are written at their natural width; `int`/`uint` are
//! widened to 64 bits. Strings and opaque blobs are length-prefixed (u32).

use crate::storage::value::Value;
use bytes::{Buf, BufMut, Bytes, BytesMut};
use std::fs::File;
use std::io::{BufReader, Read};
use std::path::Path;
use thiserror::Error;

const MAGIC: &[u8; 4] = b"TDKV";

/// Current snapshot format version.
pub const VERSION: u8 = 1;

mod tag {
    pub const STR: u8 = 0x01;
    pub const INT: u8 = 0x02;
    pub const I8: u8 = 0x03;
    pub const I16: u8 = 0x04;
    pub const I32: u8 = 0x05;
    pub const I64: u8 = 0x06;
    pub const UINT: u8 = 0x07;
    pub const U8: u8 = 0x08;
    pub const U16: u8 = 0x09;
    pub const U32: u8 = 0x0a;
    pub const U64: u8 = 0x0b;
    pub const F32: u8 = 0x0c;
    pub const F64: u8 = 0x0d;
    pub const OPAQUE: u8 = 0x0e;
}

/// One saved entry. The deadline is wall-clock so it survives a restart.
#[derive(Debug, Clone, PartialEq)]
pub struct Record {
    pub key: String,
    pub value: Value,
    /// Milliseconds since the Unix epoch, `None` for entries that never expire
    pub expires_at_ms: Option<u64>,
}

/// Errors raised while reading or writing a snapshot.
#[derive(Debug, Error)]
pub enum SnapshotError {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("not a snapshot file")]
    BadMagic,

    #[error("unsupported snapshot version {0}")]
    UnsupportedVersion(u8),

    #[error("unknown value tag {0:#04x}")]
    UnknownTag(u8),

    #[error("snapshot is truncated")]
    Truncated,

    #[error("snapshot contains a string that is not valid UTF-8")]
    InvalidUtf8,

    #[error("a value is too large for the snapshot format")]
    TooLarge,
}

/// Encodes records into a snapshot buffer.
pub fn encode(records: &[Record]) -> Result<Bytes, SnapshotError> {
    let mut buf = BytesMut::with_capacity(16 + records.len() * 32);
    buf.put_slice(MAGIC);
    buf.put_u8(VERSION);
    buf.put_u64(records.len() as u64);

    for record in records {
        put_bytes(&mut buf, record.key.as_bytes())?;
        match record.expires_at_ms {
            Some(ms) => {
                buf.put_u8(1);
                buf.put_u64(ms);
            }
            None => buf.put_u8(0),
        }
        put_value(&mut buf, &record.value)?;
    }

    Ok(buf.freeze())
}

/// Reads and decodes a whole snapshot from `reader`.
pub fn read<R: Read>(mut reader: R) -> Result<Vec<Record>, SnapshotError> {
    let mut raw = Vec::new();
    reader.read_to_end(&mut raw)?;
    decode(Bytes::from(raw))
}

pub fn read_file(path: &Path) -> Result<Vec<Record>, SnapshotError> {
    read(BufReader::new(File::open(path)?))
}

/// Decodes a snapshot buffer produced by [`encode`].
pub fn decode(mut buf: Bytes) -> Result<Vec<Record>, SnapshotError> {
    need(&buf, MAGIC.len() + 1 + 8)?;
    if &buf[..MAGIC.len()] != MAGIC {
        return Err(SnapshotError::BadMagic);
    }
    buf.advance(MAGIC.len());

    let version = buf.get_u8();
    if version != VERSION {
        return Err(SnapshotError::UnsupportedVersion(version));
    }

    let count = buf.get_u64();
    // Don't trust the header for the allocation size.
    let mut records = Vec::with_capacity(count.min(4096) as usize);

    for _ in 0..count {
        let key = get_string(&mut buf)?;

        need(&buf, 1)?;
        let expires_at_ms = match buf.get_u8() {
            0 => None,
            _ => {
                need(&buf, 8)?;
                Some(buf.get_u64())
            }
        };

        let value = get_value(&mut buf)?;
        records.push(Record {
            key,
            value,
            expires_at_ms,
        });
    }

    Ok(records)
}

fn put_bytes(buf: &mut BytesMut, bytes: &[u8]) -> Result<(), SnapshotError> {
    let len = u32::try_from(bytes.len()).map_err(|_| SnapshotError::TooLarge)?;
    buf.put_u32(len);
    buf.put_slice(bytes);
    Ok(())
}

fn put_value(buf: &mut BytesMut, value: &Value) -> Result<(), SnapshotError> {
    match value {
        Value::Str(s) => {
            buf.put_u8(tag::STR);
            put_bytes(buf, s.as_bytes())?;
        }
        Value::Int(v) => {
            buf.put_u8(tag::INT);
            buf.put_i64(*v as i64);
        }
        Value::I8(v) => {
            buf.put_u8(tag::I8);
            buf.put_i8(*v);
        }
        Value::I16(v) => {
            buf.put_u8(tag::I16);
            buf.put_i16(*v);
        }
        Value::I32(v) => {
            buf.put_u8(tag::I32);
            buf.put_i32(*v);
        }
        Value::I64(v) => {
            buf.put_u8(tag::I64);
            buf.put_i64(*v);
        }
        Value::Uint(v) => {
            buf.put_u8(tag::UINT);
            buf.put_u64(*v as u64);
        }
        Value::U8(v) => {
            buf.put_u8(tag::U8);
            buf.put_u8(*v);
        }
        Value::U16(v) => {
            buf.put_u8(tag::U16);
            buf.put_u16(*v);
        }
        Value::U32(v) => {
            buf.put_u8(tag::U32);
            buf.put_u32(*v);
        }
        Value::U64(v) => {
            buf.put_u8(tag::U64);
            buf.put_u64(*v);
        }
        Value::F32(v) => {
            buf.put_u8(tag::F32);
            buf.put_f32(*v);
        }
        Value::F64(v) => {
            buf.put_u8(tag::F64);
            buf.put_f64(*v);
        }
        Value::Opaque(b) => {
            buf.put_u8(tag::OPAQUE);
            put_bytes(buf, b)?;
        }
    }
    Ok(())
}

fn get_value(buf: &mut Bytes) -> Result<Value, SnapshotError> {
    need(buf, 1)?;
    let value = match buf.get_u8() {
        tag::STR => Value::Str(get_string(buf)?),
        tag::INT => {
            need(buf, 8)?;
            let v = buf.get_i64();
            Value::Int(isize::try_from(v).map_err(|_| SnapshotError::TooLarge)?)
        }
        tag::I8 => {
            need(buf, 1)?;
            Value::I8(buf.get_i8())
        }
        tag::I16 => {
            need(buf, 2)?;
            Value::I16(buf.get_i16())
        }
        tag::I32 => {
            need(buf, 4)?;
            Value::I32(buf.get_i32())
        }
        tag::I64 => {
            need(buf, 8)?;
            Value::I64(buf.get_i64())
        }
        tag::UINT => {
            need(buf, 8)?;
            let v = buf.get_u64();
            Value::Uint(usize::try_from(v).map_err(|_| SnapshotError::TooLarge)?)
        }
        tag::U8 => {
            need(buf, 1)?;
            Value::U8(buf.get_u8())
        }
        tag::U16 => {
            need(buf, 2)?;
            Value::U16(buf.get_u16())
        }
        tag::U32 => {
            need(buf, 4)?;
            Value::U32(buf.get_u32())
        }
        tag::U64 => {
            need(buf, 8)?;
            Value::U64(buf.get_u64())
        }
        tag::F32 => {
            need(buf, 4)?;
            Value::F32(buf.get_f32())
        }
        tag::F64 => {
            need(buf, 8)?;
            Value::F64(buf.get_f64())
        }
        tag::OPAQUE => Value::Opaque(get_bytes(buf)?),
        other => return Err(SnapshotError::UnknownTag(other)),
    };
    Ok(value)
}

fn get_bytes(buf: &mut Bytes) -> Result<Bytes, SnapshotError> {
    need(buf, 4)?;
    let len = buf.get_u32() as usize;
    need(buf, len)?;
    Ok(buf.split_to(len))
}

fn get_string(buf: &mut Bytes) -> Result<String, SnapshotError> {
    let bytes = get_bytes(buf)?;
    String::from_utf8(bytes.to_vec()).map_err(|_| SnapshotError::InvalidUtf8)
}

#[inline]
fn need(buf: &Bytes, n: usize) -> Result<(), SnapshotError> {
    if buf.remaining() < n {
        Err(SnapshotError::Truncated)
    } else {
        Ok(())
    }
}

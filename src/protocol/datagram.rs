//! Datagram Types and Codec
//!
//! A request is one JSON object terminated by `\n`:
//!
//! ```text
//! {"op":"setex","key":"session","val":"abc","exp":"5000"}\n
//! {"op":"set","key":"hits","val":"41","kind":"u32"}\n
//! {"op":"incrby","key":"hits","val":"1"}\n
//! ```
//!
//! `exp` is a TTL in milliseconds and `kind` picks the stored value type
//! (default `str`). Replies use the same framing:
//!
//! ```text
//! {"status":"ok","value":"42","kind":"u32"}\n
//! {"status":"overflow","message":"incrementing 'b' by 1 overflows its u8 value"}\n
//! ```

use crate::error::CacheError;
use crate::storage::{Ttl, Value, ValueKind};
use bytes::{BufMut, BytesMut};
use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Longest accepted request line (64 KB).
pub const DEFAULT_MAX_DATAGRAM_SIZE: usize = 64 * 1024;

/// Request operation names.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum OpCode {
    Set,
    Setex,
    Setnx,
    Get,
    Del,
    Unlink,
    Incr,
    Incrby,
    Ttl,
    Keys,
    Cnt,
    Save,
    Load,
    Cls,
    Ping,
}

/// A client request.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Request {
    pub op: OpCode,
    /// Key, or the pattern for `keys`
    #[serde(default)]
    pub key: String,
    /// Value, or the delta for `incrby`
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub val: Option<String>,
    /// TTL in milliseconds
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub exp: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub kind: Option<ValueKind>,
}

impl Request {
    pub fn new(op: OpCode, key: impl Into<String>) -> Self {
        Self {
            op,
            key: key.into(),
            val: None,
            exp: None,
            kind: None,
        }
    }

    pub fn with_val(mut self, val: impl Into<String>) -> Self {
        self.val = Some(val.into());
        self
    }

    pub fn with_exp(mut self, exp_ms: u64) -> Self {
        self.exp = Some(exp_ms.to_string());
        self
    }

    pub fn with_kind(mut self, kind: ValueKind) -> Self {
        self.kind = Some(kind);
        self
    }
}

/// Reply status codes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Status {
    Ok,
    /// Key absent
    Nil,
    Syntax,
    NotFound,
    Exists,
    Overflow,
    Type,
    Pattern,
    Io,
    /// The cache is shutting down, or the feature is disabled
    Unavailable,
    Error,
}

impl From<&CacheError> for Status {
    fn from(err: &CacheError) -> Self {
        match err {
            CacheError::Syntax(_) => Status::Syntax,
            CacheError::NotFound(_) => Status::NotFound,
            CacheError::AlreadyExists(_) => Status::Exists,
            CacheError::Overflow { .. } => Status::Overflow,
            CacheError::TypeMismatch { .. } => Status::Type,
            CacheError::InvalidPattern(_) => Status::Pattern,
            CacheError::SaveFailed { .. } | CacheError::LoadFailed { .. } => Status::Io,
            CacheError::ExecutorStopped => Status::Unavailable,
            CacheError::WatcherUnconfigured
            | CacheError::WatcherRunning
            | CacheError::WatcherStopped => Status::Error,
        }
    }
}

/// One entry of a `keys` reply.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct KeyEntry {
    pub key: String,
    pub value: String,
    pub kind: ValueKind,
}

/// A server reply. Only the fields relevant to the request are present.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Reply {
    pub status: Status,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub value: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub kind: Option<ValueKind>,
    /// Remaining TTL in milliseconds; -1 for keys that never expire
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub ttl_ms: Option<i64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub count: Option<usize>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub keys: Option<Vec<KeyEntry>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
}

impl Reply {
    pub fn status(status: Status) -> Self {
        Self {
            status,
            value: None,
            kind: None,
            ttl_ms: None,
            count: None,
            keys: None,
            message: None,
        }
    }

    pub fn ok() -> Self {
        Self::status(Status::Ok)
    }

    pub fn nil() -> Self {
        Self::status(Status::Nil)
    }

    pub fn value(value: &Value) -> Self {
        Self {
            value: Some(value.to_string()),
            kind: Some(value.kind()),
            ..Self::ok()
        }
    }

    pub fn text(text: impl Into<String>) -> Self {
        Self {
            value: Some(text.into()),
            ..Self::ok()
        }
    }

    pub fn ttl(ttl: Ttl) -> Self {
        let ttl_ms = match ttl {
            Ttl::Never => -1,
            Ttl::Remaining(d) => i64::try_from(d.as_millis()).unwrap_or(i64::MAX),
        };
        Self {
            ttl_ms: Some(ttl_ms),
            ..Self::ok()
        }
    }

    pub fn count(count: usize) -> Self {
        Self {
            count: Some(count),
            ..Self::ok()
        }
    }

    pub fn keys(entries: Vec<(String, Value)>) -> Self {
        let keys = entries
            .into_iter()
            .map(|(key, value)| KeyEntry {
                key,
                kind: value.kind(),
                value: value.to_string(),
            })
            .collect::<Vec<_>>();
        Self {
            count: Some(keys.len()),
            keys: Some(keys),
            ..Self::ok()
        }
    }

    pub fn error(err: &CacheError) -> Self {
        Self::failure(Status::from(err), err.to_string())
    }

    pub fn failure(status: Status, message: impl Into<String>) -> Self {
        Self {
            message: Some(message.into()),
            ..Self::status(status)
        }
    }

    pub fn is_ok(&self) -> bool {
        self.status == Status::Ok
    }
}

/// Errors raised while framing datagrams.
#[derive(Debug, Error)]
pub enum ProtocolError {
    /// A complete line that is not a valid request. The line has been
    /// consumed, so the stream can carry on.
    #[error("malformed request: {0}")]
    Malformed(#[from] serde_json::Error),

    /// No line break within the size limit
    #[error("request exceeds {max} bytes")]
    TooLarge { max: usize },
}

impl ProtocolError {
    /// Whether the connection has to be dropped.
    pub fn is_fatal(&self) -> bool {
        matches!(self, ProtocolError::TooLarge { .. })
    }
}

/// Newline-delimited JSON framing.
#[derive(Debug, Clone, Copy)]
pub struct DatagramCodec {
    max_size: usize,
}

impl Default for DatagramCodec {
    fn default() -> Self {
        Self::new(DEFAULT_MAX_DATAGRAM_SIZE)
    }
}

impl DatagramCodec {
    pub fn new(max_size: usize) -> Self {
        Self { max_size }
    }

    pub fn max_size(&self) -> usize {
        self.max_size
    }

    /// Takes the next request out of `buf`.
    ///
    /// Returns `Ok(None)` when `buf` holds no complete line yet. Blank lines
    /// are skipped.
    pub fn decode(&self, buf: &mut BytesMut) -> Result<Option<Request>, ProtocolError> {
        loop {
            let Some(newline) = buf.iter().position(|&b| b == b'\n') else {
                if buf.len() > self.max_size {
                    return Err(ProtocolError::TooLarge { max: self.max_size });
                }
                return Ok(None);
            };
            if newline > self.max_size {
                return Err(ProtocolError::TooLarge { max: self.max_size });
            }

            let line = buf.split_to(newline + 1);
            let line = trim_line(&line);
            if line.is_empty() {
                continue;
            }
            return Ok(Some(serde_json::from_slice(line)?));
        }
    }

    /// Appends a reply line to `dst`.
    pub fn encode(&self, reply: &Reply, dst: &mut BytesMut) -> Result<(), ProtocolError> {
        let json = serde_json::to_vec(reply)?;
        dst.reserve(json.len() + 1);
        dst.put_slice(&json);
        dst.put_u8(b'\n');
        Ok(())
    }

    /// Appends a request line to `dst` (client side).
    pub fn encode_request(
        &self,
        request: &Request,
        dst: &mut BytesMut,
    ) -> Result<(), ProtocolError> {
        let json = serde_json::to_vec(request)?;
        dst.reserve(json.len() + 1);
        dst.put_slice(&json);
        dst.put_u8(b'\n');
        Ok(())
    }
}

fn trim_line(line: &[u8]) -> &[u8] {
    let end = line
        .iter()
        .rposition(|b| !b.is_ascii_whitespace())
        .map_or(0, |i| i + 1);
    let start = line[..end]
        .iter()
        .position(|b| !b.is_ascii_whitespace())
        .unwrap_or(end);
    &line[start..end]
}

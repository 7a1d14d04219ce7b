//! Stored Values
//!
//! Every value in the cache is a [`Value`]: a tagged union over strings, the
//! fixed-width integers, floats and an opaque byte blob. The tag is part of the
//! value's identity. An `i8` stays an `i8` through any number of increments;
//! increments that would leave the width's range are refused instead of widening.
//!
//! ## Increment Rules
//!
//! ```text
//!   signed   (int, i8..i64)   current + delta must fit the width
//!   unsigned (uint, u8..u64)  delta must be >= 0 and current + delta must fit
//!   f32 / f64 / str / opaque  refused (type mismatch)
//! ```
//!
//! The sum is computed in 128-bit arithmetic, so a delta that does not fit the
//! width on its own (e.g. `+200` on an `i8` holding `-100`) is still accepted
//! when the result does.

use bytes::Bytes;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

/// A value stored in the cache.
#[derive(Debug, Clone, PartialEq)]
pub enum Value {
    /// UTF-8 string
    Str(String),
    /// Platform-width signed integer
    Int(isize),
    I8(i8),
    I16(i16),
    I32(i32),
    I64(i64),
    /// Platform-width unsigned integer
    Uint(usize),
    U8(u8),
    U16(u16),
    U32(u32),
    U64(u64),
    F32(f32),
    F64(f64),
    /// Anything else, kept as raw bytes
    Opaque(Bytes),
}

/// The tag of a [`Value`], without its payload.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ValueKind {
    Str,
    Int,
    I8,
    I16,
    I32,
    I64,
    Uint,
    U8,
    U16,
    U32,
    U64,
    F32,
    F64,
    Opaque,
}

/// Why an increment was refused.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IncrError {
    /// The result does not fit the stored width, or a negative delta was
    /// applied to an unsigned width.
    Overflow,
    /// The stored value is not an integer.
    NotAnInteger,
}

macro_rules! signed_incr {
    ($current:expr, $delta:expr, $ty:ty, $variant:ident) => {
        <$ty>::try_from(*$current as i128 + $delta as i128)
            .map(Value::$variant)
            .map_err(|_| IncrError::Overflow)
    };
}

macro_rules! unsigned_incr {
    ($current:expr, $delta:expr, $ty:ty, $variant:ident) => {
        if $delta < 0 {
            Err(IncrError::Overflow)
        } else {
            <$ty>::try_from(*$current as u128 + $delta as u128)
                .map(Value::$variant)
                .map_err(|_| IncrError::Overflow)
        }
    };
}

impl Value {
    /// Returns the tag of this value.
    pub fn kind(&self) -> ValueKind {
        match self {
            Value::Str(_) => ValueKind::Str,
            Value::Int(_) => ValueKind::Int,
            Value::I8(_) => ValueKind::I8,
            Value::I16(_) => ValueKind::I16,
            Value::I32(_) => ValueKind::I32,
            Value::I64(_) => ValueKind::I64,
            Value::Uint(_) => ValueKind::Uint,
            Value::U8(_) => ValueKind::U8,
            Value::U16(_) => ValueKind::U16,
            Value::U32(_) => ValueKind::U32,
            Value::U64(_) => ValueKind::U64,
            Value::F32(_) => ValueKind::F32,
            Value::F64(_) => ValueKind::F64,
            Value::Opaque(_) => ValueKind::Opaque,
        }
    }

    /// Returns true for the integer tags, the only ones `incr` accepts.
    pub fn is_integer(&self) -> bool {
        self.kind().is_integer()
    }

    /// Adds `delta` to this value, keeping its tag.
    ///
    /// Returns the new value, or why the increment was refused. `self` is
    /// never modified; the caller decides whether to store the result.
    pub fn checked_incr(&self, delta: i64) -> Result<Value, IncrError> {
        match self {
            Value::Int(v) => signed_incr!(v, delta, isize, Int),
            Value::I8(v) => signed_incr!(v, delta, i8, I8),
            Value::I16(v) => signed_incr!(v, delta, i16, I16),
            Value::I32(v) => signed_incr!(v, delta, i32, I32),
            Value::I64(v) => signed_incr!(v, delta, i64, I64),
            Value::Uint(v) => unsigned_incr!(v, delta, usize, Uint),
            Value::U8(v) => unsigned_incr!(v, delta, u8, U8),
            Value::U16(v) => unsigned_incr!(v, delta, u16, U16),
            Value::U32(v) => unsigned_incr!(v, delta, u32, U32),
            Value::U64(v) => unsigned_incr!(v, delta, u64, U64),
            Value::F32(_) | Value::F64(_) | Value::Str(_) | Value::Opaque(_) => {
                Err(IncrError::NotAnInteger)
            }
        }
    }

    /// Parses `text` as a value of the given kind.
    ///
    /// `Opaque` takes the raw UTF-8 bytes of `text`.
    pub fn parse(kind: ValueKind, text: &str) -> Result<Value, String> {
        fn num<T: FromStr>(kind: ValueKind, text: &str) -> Result<T, String> {
            text.trim()
                .parse::<T>()
                .map_err(|_| format!("'{}' is not a valid {}", text, kind))
        }

        Ok(match kind {
            ValueKind::Str => Value::Str(text.to_string()),
            ValueKind::Int => Value::Int(num(kind, text)?),
            ValueKind::I8 => Value::I8(num(kind, text)?),
            ValueKind::I16 => Value::I16(num(kind, text)?),
            ValueKind::I32 => Value::I32(num(kind, text)?),
            ValueKind::I64 => Value::I64(num(kind, text)?),
            ValueKind::Uint => Value::Uint(num(kind, text)?),
            ValueKind::U8 => Value::U8(num(kind, text)?),
            ValueKind::U16 => Value::U16(num(kind, text)?),
            ValueKind::U32 => Value::U32(num(kind, text)?),
            ValueKind::U64 => Value::U64(num(kind, text)?),
            ValueKind::F32 => Value::F32(num(kind, text)?),
            ValueKind::F64 => Value::F64(num(kind, text)?),
            ValueKind::Opaque => Value::Opaque(Bytes::copy_from_slice(text.as_bytes())),
        })
    }
}

impl ValueKind {
    pub fn is_integer(self) -> bool {
        !matches!(
            self,
            ValueKind::Str | ValueKind::F32 | ValueKind::F64 | ValueKind::Opaque
        )
    }

    pub fn as_str(self) -> &'static str {
        match self {
            ValueKind::Str => "str",
            ValueKind::Int => "int",
            ValueKind::I8 => "i8",
            ValueKind::I16 => "i16",
            ValueKind::I32 => "i32",
            ValueKind::I64 => "i64",
            ValueKind::Uint => "uint",
            ValueKind::U8 => "u8",
            ValueKind::U16 => "u16",
            ValueKind::U32 => "u32",
            ValueKind::U64 => "u64",
            ValueKind::F32 => "f32",
            ValueKind::F64 => "f64",
            ValueKind::Opaque => "opaque",
        }
    }
}

impl fmt::Display for ValueKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl fmt::Display for Value {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Value::Str(s) => f.write_str(s),
            Value::Int(v) => write!(f, "{}", v),
            Value::I8(v) => write!(f, "{}", v),
            Value::I16(v) => write!(f, "{}", v),
            Value::I32(v) => write!(f, "{}", v),
            Value::I64(v) => write!(f, "{}", v),
            Value::Uint(v) => write!(f, "{}", v),
            Value::U8(v) => write!(f, "{}", v),
            Value::U16(v) => write!(f, "{}", v),
            Value::U32(v) => write!(f, "{}", v),
            Value::U64(v) => write!(f, "{}", v),
            Value::F32(v) => write!(f, "{}", v),
            Value::F64(v) => write!(f, "{}", v),
            Value::Opaque(b) => f.write_str(&String::from_utf8_lossy(b)),
        }
    }
}

macro_rules! impl_from {
    ($($ty:ty => $variant:ident),* $(,)?) => {
        $(
            impl From<$ty> for Value {
                fn from(v: $ty) -> Self {
                    Value::$variant(v)
                }
            }
        )*
    };
}

impl_from! {
    String => Str,
    isize => Int,
    i8 => I8,
    i16 => I16,
    i32 => I32,
    i64 => I64,
    usize => Uint,
    u8 => U8,
    u16 => U16,
    u32 => U32,
    u64 => U64,
    f32 => F32,
    f64 => F64,
    Bytes => Opaque,
}

impl From<&str> for Value {
    fn from(v: &str) -> Self {
        Value::Str(v.to_string())
    }
}

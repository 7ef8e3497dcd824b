//! Tuple values and their binary payload encoding.
//!
//! Payload layout per tuple (little-endian):
//! `[flags u8][group_hash u64 if flags&1][value_count u32][value...]`, each value
//! being `[tag u8][body]` where the body depends on the tag.

use bytes::{Buf, BufMut};
use pcq_common::{CqError, Result};

const TAG_NULL: u8 = 0;
const TAG_BOOL: u8 = 1;
const TAG_INT64: u8 = 2;
const TAG_FLOAT64: u8 = 3;
const TAG_UTF8: u8 = 4;
const TAG_BYTES: u8 = 5;

const FLAG_GROUP_HASH: u8 = 1;

/// One column value.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum Datum {
    Null,
    Bool(bool),
    Int64(i64),
    /// IEEE-754 bit pattern so the value stays hashable.
    Float64Bits(u64),
    Utf8(String),
    Bytes(Vec<u8>),
}

impl Datum {
    pub fn float64(v: f64) -> Self {
        Self::Float64Bits(v.to_bits())
    }

    pub fn as_i64(&self) -> Option<i64> {
        match self {
            Self::Int64(v) => Some(*v),
            _ => None,
        }
    }

    pub fn as_f64(&self) -> Option<f64> {
        match self {
            Self::Float64Bits(v) => Some(f64::from_bits(*v)),
            Self::Int64(v) => Some(*v as f64),
            _ => None,
        }
    }

    pub fn as_str(&self) -> Option<&str> {
        match self {
            Self::Utf8(v) => Some(v),
            _ => None,
        }
    }

    pub fn is_null(&self) -> bool {
        matches!(self, Self::Null)
    }

    pub fn encoded_len(&self) -> usize {
        1 + match self {
            Self::Null => 0,
            Self::Bool(_) => 1,
            Self::Int64(_) | Self::Float64Bits(_) => 8,
            Self::Utf8(v) => 4 + v.len(),
            Self::Bytes(v) => 4 + v.len(),
        }
    }

    /// Append the tagged encoding. Also used as stable key bytes for shard hashing.
    pub fn encode(&self, out: &mut impl BufMut) {
        match self {
            Self::Null => out.put_u8(TAG_NULL),
            Self::Bool(v) => {
                out.put_u8(TAG_BOOL);
                out.put_u8(u8::from(*v));
            }
            Self::Int64(v) => {
                out.put_u8(TAG_INT64);
                out.put_i64_le(*v);
            }
            Self::Float64Bits(v) => {
                out.put_u8(TAG_FLOAT64);
                out.put_u64_le(*v);
            }
            Self::Utf8(v) => {
                out.put_u8(TAG_UTF8);
                out.put_u32_le(v.len() as u32);
                out.put_slice(v.as_bytes());
            }
            Self::Bytes(v) => {
                out.put_u8(TAG_BYTES);
                out.put_u32_le(v.len() as u32);
                out.put_slice(v);
            }
        }
    }

    pub fn decode(src: &mut impl Buf) -> Result<Self> {
        let tag = take_u8(src)?;
        Ok(match tag {
            TAG_NULL => Self::Null,
            TAG_BOOL => Self::Bool(take_u8(src)? != 0),
            TAG_INT64 => {
                ensure_remaining(&*src, 8)?;
                Self::Int64(src.get_i64_le())
            }
            TAG_FLOAT64 => {
                ensure_remaining(&*src, 8)?;
                Self::Float64Bits(src.get_u64_le())
            }
            TAG_UTF8 => {
                let raw = take_len_prefixed(src)?;
                Self::Utf8(
                    String::from_utf8(raw)
                        .map_err(|e| CqError::Codec(format!("invalid utf8 datum: {e}")))?,
                )
            }
            TAG_BYTES => Self::Bytes(take_len_prefixed(src)?),
            other => return Err(CqError::Codec(format!("unknown datum tag {other}"))),
        })
    }
}

static NULL: Datum = Datum::Null;

/// An owned row plus the grouping hash attached by worker-side sharding.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Default)]
pub struct Tuple {
    pub values: Vec<Datum>,
    pub group_hash: Option<u64>,
}

impl Tuple {
    pub fn new(values: Vec<Datum>) -> Self {
        Self {
            values,
            group_hash: None,
        }
    }

    pub fn with_group_hash(mut self, hash: u64) -> Self {
        self.group_hash = Some(hash);
        self
    }

    pub fn get(&self, col: usize) -> Option<&Datum> {
        self.values.get(col)
    }

    /// Column value, reading missing trailing columns as null.
    pub fn get_or_null(&self, col: usize) -> &Datum {
        self.values.get(col).unwrap_or(&NULL)
    }

    /// Exact number of payload bytes this tuple occupies on the wire.
    pub fn encoded_len(&self) -> usize {
        let header = 1 + if self.group_hash.is_some() { 8 } else { 0 } + 4;
        header + self.values.iter().map(Datum::encoded_len).sum::<usize>()
    }

    pub fn encode(&self, out: &mut impl BufMut) {
        match self.group_hash {
            Some(h) => {
                out.put_u8(FLAG_GROUP_HASH);
                out.put_u64_le(h);
            }
            None => out.put_u8(0),
        }
        out.put_u32_le(self.values.len() as u32);
        for v in &self.values {
            v.encode(out);
        }
    }

    pub fn decode(src: &mut impl Buf) -> Result<Self> {
        let flags = take_u8(src)?;
        let group_hash = if flags & FLAG_GROUP_HASH != 0 {
            ensure_remaining(&*src, 8)?;
            Some(src.get_u64_le())
        } else {
            None
        };
        ensure_remaining(&*src, 4)?;
        let n = src.get_u32_le() as usize;
        // every datum takes at least its tag byte
        ensure_remaining(&*src, n)?;
        let mut values = Vec::with_capacity(n);
        for _ in 0..n {
            values.push(Datum::decode(src)?);
        }
        Ok(Self { values, group_hash })
    }
}

pub(crate) fn take_u8(src: &mut impl Buf) -> Result<u8> {
    ensure_remaining(&*src, 1)?;
    Ok(src.get_u8())
}

pub(crate) fn ensure_remaining(src: &impl Buf, n: usize) -> Result<()> {
    if src.remaining() < n {
        return Err(CqError::Codec(format!(
            "truncated frame: need {n} bytes, have {}",
            src.remaining()
        )));
    }
    Ok(())
}

fn take_len_prefixed(src: &mut impl Buf) -> Result<Vec<u8>> {
    ensure_remaining(&*src, 4)?;
    let len = src.get_u32_le() as usize;
    ensure_remaining(&*src, len)?;
    let mut out = vec![0_u8; len];
    src.copy_to_slice(&mut out);
    Ok(out)
}

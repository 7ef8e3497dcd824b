//! Microbatch wire format and stream framing.
//!
//! ```text
//! magic "PCQM" | version u32 | kind u8 [control op u8]
//! query words u32 | u64 * words
//! ack count u32   | (slot u32, id u64) * count
//! tuple count u32 | payload len u32 | payload
//! schema flag u8  [schema len u32 | schema json]
//! ```
//! All integers little-endian.

use std::sync::Arc;

use arrow_schema::Schema;
use bytes::{Buf, BufMut, Bytes, BytesMut};
use pcq_common::{CqError, Result};
use tokio_util::codec::{Decoder, Encoder};

use crate::ack::AckRef;
use crate::datum::{ensure_remaining, take_u8, Tuple};
use crate::microbatch::{ControlOp, Microbatch, MicrobatchKind};
use crate::query_set::QuerySet;

const MAGIC: &[u8; 4] = b"PCQM";
const VERSION: u32 = 1;

const KIND_TUPLES: u8 = 0;
const KIND_COMBINER: u8 = 1;
const KIND_FLUSH: u8 = 2;
const KIND_CONTROL: u8 = 3;

const OP_REFRESH_QUERIES: u8 = 0;

/// Largest frame accepted off a stream (64 MiB).
pub const MAX_FRAME_BYTES: usize = 64 * 1024 * 1024;

pub fn pack(mb: &Microbatch) -> Result<Bytes> {
    let schema_json = match mb.schema() {
        Some(s) => Some(
            serde_json::to_vec(s.as_ref())
                .map_err(|e| CqError::Codec(format!("schema encode failed: {e}")))?,
        ),
        None => None,
    };
    let words = mb.queries().words();
    let mut out = BytesMut::with_capacity(
        32 + words.len() * 8
            + mb.acks().len() * 12
            + mb.byte_size()
            + schema_json.as_ref().map_or(0, |s| s.len() + 4),
    );
    out.put_slice(MAGIC);
    out.put_u32_le(VERSION);
    match mb.kind() {
        MicrobatchKind::Tuples => out.put_u8(KIND_TUPLES),
        MicrobatchKind::Combiner => out.put_u8(KIND_COMBINER),
        MicrobatchKind::Flush => out.put_u8(KIND_FLUSH),
        MicrobatchKind::Control(op) => {
            out.put_u8(KIND_CONTROL);
            match op {
                ControlOp::RefreshQueries => out.put_u8(OP_REFRESH_QUERIES),
            }
        }
    }
    out.put_u32_le(words.len() as u32);
    for w in words {
        out.put_u64_le(*w);
    }
    out.put_u32_le(mb.acks().len() as u32);
    for a in mb.acks() {
        out.put_u32_le(a.slot);
        out.put_u64_le(a.id);
    }
    out.put_u32_le(mb.len() as u32);
    out.put_u32_le(mb.byte_size() as u32);
    for t in mb.tuples() {
        t.encode(&mut out);
    }
    match schema_json {
        Some(json) => {
            out.put_u8(1);
            out.put_u32_le(json.len() as u32);
            out.put_slice(&json);
        }
        None => out.put_u8(0),
    }
    Ok(out.freeze())
}

pub fn unpack(frame: &[u8]) -> Result<Microbatch> {
    let mut src = frame;
    ensure_remaining(&src, 8)?;
    if &src[..4] != MAGIC {
        return Err(CqError::Codec("bad microbatch magic".to_string()));
    }
    src.advance(4);
    let version = src.get_u32_le();
    if version != VERSION {
        return Err(CqError::Codec(format!(
            "unsupported microbatch version {version}"
        )));
    }
    let kind = match take_u8(&mut src)? {
        KIND_TUPLES => MicrobatchKind::Tuples,
        KIND_COMBINER => MicrobatchKind::Combiner,
        KIND_FLUSH => MicrobatchKind::Flush,
        KIND_CONTROL => match take_u8(&mut src)? {
            OP_REFRESH_QUERIES => MicrobatchKind::Control(ControlOp::RefreshQueries),
            other => return Err(CqError::Codec(format!("unknown control op {other}"))),
        },
        other => return Err(CqError::Codec(format!("unknown microbatch kind {other}"))),
    };

    let n_words = take_u32(&mut src)? as usize;
    ensure_remaining(&src, n_words.saturating_mul(8))?;
    let words = (0..n_words).map(|_| src.get_u64_le()).collect();
    let queries = QuerySet::from_words(words);

    let n_acks = take_u32(&mut src)? as usize;
    ensure_remaining(&src, n_acks.saturating_mul(12))?;
    let acks = (0..n_acks)
        .map(|_| AckRef {
            slot: src.get_u32_le(),
            id: src.get_u64_le(),
        })
        .collect();

    let n_tuples = take_u32(&mut src)? as usize;
    let payload_len = take_u32(&mut src)? as usize;
    ensure_remaining(&src, payload_len)?;
    let mut payload = &src[..payload_len];
    src.advance(payload_len);
    let mut tuples = Vec::with_capacity(n_tuples.min(payload_len));
    while payload.has_remaining() {
        tuples.push(Tuple::decode(&mut payload)?);
    }
    if tuples.len() != n_tuples {
        return Err(CqError::Codec(format!(
            "tuple count mismatch: header {n_tuples}, payload {}",
            tuples.len()
        )));
    }

    let schema = match take_u8(&mut src)? {
        0 => None,
        1 => {
            let len = take_u32(&mut src)? as usize;
            ensure_remaining(&src, len)?;
            let schema: Schema = serde_json::from_slice(&src[..len])
                .map_err(|e| CqError::Codec(format!("schema decode failed: {e}")))?;
            src.advance(len);
            Some(Arc::new(schema))
        }
        other => return Err(CqError::Codec(format!("bad schema flag {other}"))),
    };
    if src.has_remaining() {
        return Err(CqError::Codec(format!(
            "{} trailing bytes after microbatch",
            src.remaining()
        )));
    }

    Microbatch::from_parts(kind, queries, tuples, schema, acks)
        .map_err(|e| CqError::Codec(format!("decoded microbatch violates invariants: {e}")))
}

fn take_u32(src: &mut &[u8]) -> Result<u32> {
    ensure_remaining(&*src, 4)?;
    Ok(src.get_u32_le())
}

/// Length-prefixed framing for stream transports.
///
/// Frame format: `[len u32 LE][frame bytes]`.
#[derive(Debug, Clone)]
pub struct FrameCodec {
    max_frame_bytes: usize,
}

impl Default for FrameCodec {
    fn default() -> Self {
        Self::new()
    }
}

impl FrameCodec {
    pub fn new() -> Self {
        Self {
            max_frame_bytes: MAX_FRAME_BYTES,
        }
    }

    pub fn with_max_frame_bytes(max_frame_bytes: usize) -> Self {
        Self { max_frame_bytes }
    }
}

impl Decoder for FrameCodec {
    type Item = Bytes;
    type Error = CqError;

    fn decode(&mut self, src: &mut BytesMut) -> Result<Option<Self::Item>> {
        if src.len() < 4 {
            return Ok(None);
        }
        let len = (&src[..4]).get_u32_le() as usize;
        if len > self.max_frame_bytes {
            return Err(CqError::Codec(format!(
                "frame of {len} bytes exceeds maximum {}",
                self.max_frame_bytes
            )));
        }
        if src.len() < 4 + len {
            src.reserve(4 + len - src.len());
            return Ok(None);
        }
        src.advance(4);
        Ok(Some(src.split_to(len).freeze()))
    }
}

impl Encoder<Bytes> for FrameCodec {
    type Error = CqError;

    fn encode(&mut self, item: Bytes, dst: &mut BytesMut) -> Result<()> {
        if item.len() > self.max_frame_bytes {
            return Err(CqError::Codec(format!(
                "frame of {} bytes exceeds maximum {}",
                item.len(),
                self.max_frame_bytes
            )));
        }
        dst.reserve(4 + item.len());
        dst.put_u32_le(item.len() as u32);
        dst.put_slice(&item);
        Ok(())
    }
}

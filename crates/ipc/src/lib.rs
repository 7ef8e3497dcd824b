//! Microbatch data model and inter-process transport for continuous queries.
//!
//! Architecture role:
//! - defines the [`Microbatch`] envelope exchanged between ingest, worker and
//!   combiner processes, and its wire codec
//! - tracks ingestion acknowledgements in a shared [`AckTable`]
//! - moves frames between process slots over an in-memory hub or Unix sockets
//!
//! Key modules:
//! - [`datum`] / [`query_set`]
//! - [`microbatch`] / [`codec`]
//! - [`ack`]
//! - [`transport`], [`local`], [`socket`]

pub mod ack;
pub mod codec;
pub mod datum;
pub mod layout;
pub mod local;
pub mod microbatch;
pub mod query_set;
#[cfg(unix)]
pub mod socket;
pub mod transport;

pub use ack::{AckLevel, AckRef, AckSnapshot, AckTable, GenerationSource};
pub use codec::{pack, unpack, FrameCodec};
pub use datum::{Datum, Tuple};
pub use local::{LocalEndpoint, LocalHub};
pub use microbatch::{ControlOp, Microbatch, MicrobatchBuilder, MicrobatchKind};
pub use query_set::QuerySet;
#[cfg(unix)]
pub use socket::UnixSocketTransport;
pub use transport::{MicrobatchIpc, MicrobatchTransport};

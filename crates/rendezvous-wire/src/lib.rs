//! Streaming frame codec for the rendezvous wire protocol: a single-byte
//! tag followed by type-specific fields, with no outer length prefix.
//!
//! The [`Decoder`] is resumable: it can be fed arbitrarily small or large
//! byte slices and produces the same sequence of [`Frame`]s regardless of
//! how the underlying stream was chunked. [`encode`] builds the header bytes
//! for each outbound message kind; callers write the body as a separate
//! (unvalidated, already-owned) segment.

mod decode;
pub mod encode;
mod error;
mod frame;

pub use decode::Decoder;
pub use error::WireError;
pub use frame::Frame;

/// Maximum series name length. A series of exactly this length is
/// represented on the wire by the same single length byte as an empty
/// series (the length byte wraps: see `encode::push_series`); this mirrors
/// the source implementation's wire format rather than redesigning it.
pub const MAX_SERIES_LEN: usize = 256;

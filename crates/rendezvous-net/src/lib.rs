//! Non-blocking, `mio`-driven TCP transport for the rendezvous runtime.
//!
//! This crate is deliberately wire-format-agnostic: it delivers raw readable
//! bytes and reports when queued writes have left the process. Framing and
//! message semantics live in `rendezvous-wire` and `rendezvous-core`.

pub mod tcp;

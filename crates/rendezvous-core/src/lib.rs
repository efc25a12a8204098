//! Chief/worker collective-communication runtime: gather, broadcast and
//! allgather over TCP, in the spirit of MPI's world-group collectives but
//! restricted to a star topology with rank 0 as the switchboard.
//!
//! A [`Context`] is one process's handle into a group. [`Context::open`]
//! brings it up — binding (chief) or dialing (worker) — and blocks only
//! until the IO thread has started, not until every peer has connected;
//! [`api::gather`]/[`api::broadcast`]/[`api::allgather`] submit collective
//! calls, each returning an [`api::Op`] to await later.

mod context;
mod error;
mod io;
mod op;
mod registry;
mod resolve;
mod result;

pub mod api;

pub use context::Context;
pub use error::OpenError;
pub use result::OpResult;

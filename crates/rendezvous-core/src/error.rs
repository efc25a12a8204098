use thiserror::Error;

/// Failure to bring a [`crate::Context`] up. Anything that goes wrong once
/// the context is running is not a `Result` — it fails the whole context
/// and surfaces as `ok() == false` on every awaited operation, matching the
/// "a broken connection is unrecoverable" design carried over from the
/// source implementation.
#[derive(Error, Debug)]
pub enum OpenError {
    #[error("rank {rank} is out of range for a group of size {size}")]
    InvalidConfig { rank: u32, size: u32 },
    #[error("couldn't spawn the IO thread")]
    ThreadSpawn,
    #[error("chief couldn't bind a listener")]
    ListenFailed,
    #[error("worker couldn't resolve the chief's address")]
    ResolveFailed,
}

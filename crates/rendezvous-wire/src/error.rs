use thiserror::Error;

use crate::MAX_SERIES_LEN;

#[derive(Error, Debug, Clone, Copy, PartialEq, Eq)]
pub enum WireError {
    #[error("unknown wire tag byte {0:#04x}")]
    UnknownTag(u8),
    #[error("series length {0} exceeds the {MAX_SERIES_LEN} byte maximum")]
    SeriesTooLong(usize),
    #[error("body length {0} exceeds the u32 maximum")]
    BodyTooLong(u64),
}

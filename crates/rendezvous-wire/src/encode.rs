use crate::{error::WireError, MAX_SERIES_LEN};

pub const INIT_FRAME_LEN: usize = 5;
pub const KEEPALIVE_FRAME_LEN: usize = 1;
/// tag + slen + series + len
pub const GATHER_HDR_MAXLEN: usize = 1 + 1 + MAX_SERIES_LEN + 4;
/// tag + slen + series + rank + len
pub const ALLGATHER_HDR_MAXLEN: usize = 1 + 1 + MAX_SERIES_LEN + 4 + 4;

pub fn encode_init(rank: u32) -> [u8; INIT_FRAME_LEN] {
    let r = rank.to_be_bytes();
    [b'i', r[0], r[1], r[2], r[3]]
}

pub fn encode_keepalive() -> [u8; KEEPALIVE_FRAME_LEN] {
    [b'k']
}

/// Appends a GATHER header (tag, series, body length) to `buf`. Does not
/// append the body itself — callers write the body as a separate vectored
/// segment to avoid copying the user payload.
pub fn encode_gather_header(buf: &mut Vec<u8>, series: &[u8], body_len: usize) -> Result<(), WireError> {
    encode_tagged_header(buf, b'g', series, body_len)
}

pub fn encode_broadcast_header(buf: &mut Vec<u8>, series: &[u8], body_len: usize) -> Result<(), WireError> {
    encode_tagged_header(buf, b'b', series, body_len)
}

pub fn encode_allgather_header(
    buf: &mut Vec<u8>,
    series: &[u8],
    rank: u32,
    body_len: usize,
) -> Result<(), WireError> {
    validate_series(series)?;
    let len = validate_body_len(body_len)?;
    buf.push(b'a');
    push_series(buf, series);
    buf.extend_from_slice(&rank.to_be_bytes());
    buf.extend_from_slice(&len.to_be_bytes());
    Ok(())
}

fn encode_tagged_header(
    buf: &mut Vec<u8>,
    tag: u8,
    series: &[u8],
    body_len: usize,
) -> Result<(), WireError> {
    validate_series(series)?;
    let len = validate_body_len(body_len)?;
    buf.push(tag);
    push_series(buf, series);
    buf.extend_from_slice(&len.to_be_bytes());
    Ok(())
}

fn push_series(buf: &mut Vec<u8>, series: &[u8]) {
    // the wire's length field is one byte; a series of exactly MAX_SERIES_LEN
    // wraps to 0, identically to how the source implementation truncates it.
    buf.push(series.len() as u8);
    buf.extend_from_slice(series);
}

fn validate_series(series: &[u8]) -> Result<(), WireError> {
    if series.len() > MAX_SERIES_LEN {
        return Err(WireError::SeriesTooLong(series.len()));
    }
    Ok(())
}

fn validate_body_len(body_len: usize) -> Result<u32, WireError> {
    u32::try_from(body_len).map_err(|_| WireError::BodyTooLong(body_len as u64))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn init_frame_bytes() {
        assert_eq!(encode_init(0x0102_0304), [b'i', 0x01, 0x02, 0x03, 0x04]);
    }

    #[test]
    fn series_too_long_rejected() {
        let series = vec![0u8; MAX_SERIES_LEN + 1];
        let mut buf = Vec::new();
        assert_eq!(
            encode_gather_header(&mut buf, &series, 0),
            Err(WireError::SeriesTooLong(MAX_SERIES_LEN + 1))
        );
    }

    #[test]
    fn max_series_len_accepted() {
        let series = vec![0u8; MAX_SERIES_LEN];
        let mut buf = Vec::new();
        assert!(encode_gather_header(&mut buf, &series, 0).is_ok());
    }

    #[test]
    fn body_len_overflow_rejected() {
        let mut buf = Vec::new();
        let too_big = u32::MAX as usize + 1;
        assert_eq!(
            encode_gather_header(&mut buf, b"s", too_big),
            Err(WireError::BodyTooLong(too_big as u64))
        );
    }
}

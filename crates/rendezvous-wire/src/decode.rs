use crate::{
    error::WireError,
    frame::{Frame, Tag, TAG_ALLGATHER, TAG_BROADCAST, TAG_GATHER, TAG_INIT, TAG_KEEPALIVE},
};

/// Position within the field sequence of whichever message is currently being
/// read. `push` may be called with arbitrarily small or large slices; any
/// partition of the same bytes drives the same sequence of callbacks.
#[derive(Debug)]
enum Step {
    Tag,
    InitRank { rank: u32, have: u8 },
    SeriesLen { tag: Tag },
    Series { tag: Tag, slen: usize, series: Vec<u8> },
    AllgatherRank { tag: Tag, series: Box<[u8]>, rank: u32, have: u8 },
    BodyLen { tag: Tag, series: Box<[u8]>, rank: u32, len: u32, have: u8 },
    Body { tag: Tag, series: Box<[u8]>, rank: u32, body: Vec<u8>, want: usize },
}

/// Resumable, streaming decoder for the four wire message kinds.
///
/// Fed arbitrary byte slices via [`Decoder::push`]; for any partition of a
/// well-formed stream into chunks, the sequence of emitted [`Frame`]s is
/// identical to feeding the whole stream in one call.
#[derive(Debug)]
pub struct Decoder {
    step: Step,
}

impl Default for Decoder {
    fn default() -> Self {
        Self { step: Step::Tag }
    }
}

impl Decoder {
    pub fn new() -> Self {
        Self::default()
    }

    /// True only between messages (no partially-read frame buffered).
    pub fn at_boundary(&self) -> bool {
        matches!(self.step, Step::Tag)
    }

    /// Feed `data` to the decoder, invoking `on_frame` once per completed
    /// message. Returns an error and stops consuming on an unknown tag byte;
    /// the connection must be torn down in that case.
    pub fn push<F>(&mut self, mut data: &[u8], mut on_frame: F) -> Result<(), WireError>
    where
        F: FnMut(Frame),
    {
        while !data.is_empty() {
            let step = std::mem::replace(&mut self.step, Step::Tag);
            let (next, rest) = advance(step, data, &mut on_frame)?;
            self.step = next;
            data = rest;
        }
        Ok(())
    }
}

fn advance<'a, F>(
    step: Step,
    data: &'a [u8],
    on_frame: &mut F,
) -> Result<(Step, &'a [u8]), WireError>
where
    F: FnMut(Frame),
{
    match step {
        Step::Tag => {
            let Some((&tag, rest)) = data.split_first() else {
                return Ok((Step::Tag, data));
            };
            let next = match tag {
                TAG_INIT => Step::InitRank { rank: 0, have: 0 },
                TAG_GATHER => Step::SeriesLen { tag: Tag::Gather },
                TAG_BROADCAST => Step::SeriesLen { tag: Tag::Broadcast },
                TAG_ALLGATHER => Step::SeriesLen { tag: Tag::Allgather },
                TAG_KEEPALIVE => Step::Tag,
                other => return Err(WireError::UnknownTag(other)),
            };
            Ok((next, rest))
        }

        Step::InitRank { mut rank, mut have } => {
            let mut data = data;
            while have < 4 {
                let Some((&b, rest)) = data.split_first() else {
                    return Ok((Step::InitRank { rank, have }, data));
                };
                rank = (rank << 8) | u32::from(b);
                have += 1;
                data = rest;
            }
            on_frame(Frame::Init { rank });
            Ok((Step::Tag, data))
        }

        Step::SeriesLen { tag } => {
            let Some((&slen_byte, rest)) = data.split_first() else {
                return Ok((Step::SeriesLen { tag }, data));
            };
            let slen = slen_byte as usize;
            Ok((Step::Series { tag, slen, series: Vec::with_capacity(slen) }, rest))
        }

        Step::Series { tag, slen, mut series } => {
            let want = slen - series.len();
            let have = want.min(data.len());
            series.extend_from_slice(&data[..have]);
            let rest = &data[have..];
            if series.len() < slen {
                return Ok((Step::Series { tag, slen, series }, rest));
            }
            let series = series.into_boxed_slice();
            let next = match tag {
                Tag::Allgather => Step::AllgatherRank { tag, series, rank: 0, have: 0 },
                Tag::Gather | Tag::Broadcast => {
                    Step::BodyLen { tag, series, rank: 0, len: 0, have: 0 }
                }
            };
            Ok((next, rest))
        }

        Step::AllgatherRank { tag, series, mut rank, mut have } => {
            let mut data = data;
            while have < 4 {
                let Some((&b, rest)) = data.split_first() else {
                    return Ok((Step::AllgatherRank { tag, series, rank, have }, data));
                };
                rank = (rank << 8) | u32::from(b);
                have += 1;
                data = rest;
            }
            Ok((Step::BodyLen { tag, series, rank, len: 0, have: 0 }, data))
        }

        Step::BodyLen { tag, series, rank, mut len, mut have } => {
            let mut data = data;
            while have < 4 {
                let Some((&b, rest)) = data.split_first() else {
                    return Ok((Step::BodyLen { tag, series, rank, len, have }, data));
                };
                len = (len << 8) | u32::from(b);
                have += 1;
                data = rest;
            }
            let want = len as usize;
            Ok((Step::Body { tag, series, rank, body: Vec::with_capacity(want), want }, data))
        }

        Step::Body { tag, series, rank, mut body, want } => {
            let need = want - body.len();
            let have = need.min(data.len());
            body.extend_from_slice(&data[..have]);
            let rest = &data[have..];
            if body.len() < want {
                return Ok((Step::Body { tag, series, rank, body, want }, rest));
            }
            let body = body.into_boxed_slice();
            let frame = match tag {
                Tag::Gather => Frame::Gather { series, body },
                Tag::Broadcast => Frame::Broadcast { series, body },
                Tag::Allgather => Frame::Allgather { series, rank, body },
            };
            on_frame(frame);
            Ok((Step::Tag, rest))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::encode;

    fn decode_all(chunks: &[&[u8]]) -> Vec<Frame> {
        let mut dec = Decoder::new();
        let mut out = Vec::new();
        for chunk in chunks {
            dec.push(chunk, |f| out.push(f)).unwrap();
        }
        assert!(dec.at_boundary());
        out
    }

    #[test]
    fn single_chunk_gather() {
        let mut buf = Vec::new();
        encode::encode_gather_header(&mut buf, b"ser", 4).unwrap();
        buf.extend_from_slice(b"abcd");
        let frames = decode_all(&[&buf]);
        assert_eq!(
            frames,
            vec![Frame::Gather { series: b"ser".to_vec().into(), body: b"abcd".to_vec().into() }]
        );
    }

    #[test]
    fn byte_at_a_time_matches_single_chunk() {
        let mut buf = Vec::new();
        encode::encode_gather_header(&mut buf, b"ser", 4).unwrap();
        buf.extend_from_slice(b"abcd");

        let whole = decode_all(&[&buf]);

        let one_byte_chunks: Vec<&[u8]> = buf.iter().map(std::slice::from_ref).collect();
        let chunked = decode_all(&one_byte_chunks);

        assert_eq!(whole, chunked);
    }

    #[test]
    fn arbitrary_partition_yields_same_sequence() {
        let mut first = Vec::new();
        encode::encode_gather_header(&mut first, b"a", 1).unwrap();
        first.push(b'X');
        let mut second = Vec::new();
        encode::encode_broadcast_header(&mut second, b"bb", 3).unwrap();
        second.extend_from_slice(b"yyy");
        let mut stream = first.clone();
        stream.extend_from_slice(&second);

        let whole = decode_all(&[&stream]);

        // split at every possible offset and compare
        for split in 0..=stream.len() {
            let (a, b) = stream.split_at(split);
            let parts = decode_all(&[a, b]);
            assert_eq!(parts, whole, "mismatch splitting at {split}");
        }
    }

    #[test]
    fn keepalive_fires_no_callback() {
        let frames = decode_all(&[b"k"]);
        assert!(frames.is_empty());
    }

    #[test]
    fn keepalive_interleaved_with_init() {
        let mut buf = vec![b'k'];
        buf.extend_from_slice(&encode::encode_init(7));
        buf.push(b'k');
        let frames = decode_all(&[&buf]);
        assert_eq!(frames, vec![Frame::Init { rank: 7 }]);
    }

    #[test]
    fn unknown_tag_is_an_error() {
        let mut dec = Decoder::new();
        let err = dec.push(b"?", |_| panic!("no frame expected")).unwrap_err();
        assert_eq!(err, WireError::UnknownTag(b'?'));
    }

    #[test]
    fn empty_series_and_empty_body_round_trip() {
        let mut buf = Vec::new();
        encode::encode_gather_header(&mut buf, b"", 0).unwrap();
        let frames = decode_all(&[&buf]);
        assert_eq!(frames, vec![Frame::Gather { series: Box::new([]), body: Box::new([]) }]);
    }

    #[test]
    fn allgather_carries_rank() {
        let mut buf = Vec::new();
        encode::encode_allgather_header(&mut buf, b"s", 2, 3).unwrap();
        buf.extend_from_slice(b"xyz");
        let frames = decode_all(&[&buf]);
        assert_eq!(
            frames,
            vec![Frame::Allgather { series: b"s".to_vec().into(), rank: 2, body: b"xyz".to_vec().into() }]
        );
    }
}

//! Delimiter framing over a raw byte stream.
//!
//! [`LineCodec`] is the tokio-util codec: it splits a buffer on
//! [`FRAME_DELIMITER`] when decoding and appends it when encoding.
//! [`FrameAssembler`] owns the carry-over buffer for one connection and turns
//! arbitrarily sized reads into complete frames.

use bytes::{BufMut, Bytes, BytesMut};
use tokio_util::codec::{Decoder, Encoder};

use crate::types::{CryptoTcpError, FRAME_DELIMITER};

/// Codec for delimiter-terminated frames. Decoded frames have the delimiter
/// stripped.
#[derive(Debug, Clone, Default)]
pub struct LineCodec {
    // Bytes before this index are known not to contain the delimiter.
    next_index: usize,
}

impl LineCodec {
    pub fn new() -> Self {
        Self::default()
    }
}

impl Decoder for LineCodec {
    type Item = BytesMut;
    type Error = CryptoTcpError;

    fn decode(&mut self, src: &mut BytesMut) -> Result<Option<Self::Item>, Self::Error> {
        let start = self.next_index.min(src.len());
        match src[start..].iter().position(|b| *b == FRAME_DELIMITER) {
            Some(offset) => {
                let end = start + offset;
                self.next_index = 0;
                let mut frame = src.split_to(end + 1);
                frame.truncate(end);
                Ok(Some(frame))
            }
            None => {
                self.next_index = src.len();
                Ok(None)
            }
        }
    }
}

impl Encoder<Bytes> for LineCodec {
    type Error = CryptoTcpError;

    fn encode(&mut self, item: Bytes, dst: &mut BytesMut) -> Result<(), Self::Error> {
        dst.reserve(item.len() + 1);
        dst.put_slice(&item);
        dst.put_u8(FRAME_DELIMITER);
        Ok(())
    }
}

/// Reassembles frames from raw reads: append a chunk, take every complete
/// frame, keep the remainder for the next chunk.
///
/// The remainder is unbounded: a peer that never sends the delimiter keeps
/// growing it until the connection closes.
#[derive(Debug, Default)]
pub struct FrameAssembler {
    codec: LineCodec,
    pending: BytesMut,
}

impl FrameAssembler {
    pub fn new() -> Self {
        Self::default()
    }

    /// Feed one raw read and return the frames it completed, in stream order.
    pub fn push(&mut self, chunk: &[u8]) -> Vec<Bytes> {
        self.pending.extend_from_slice(chunk);
        let mut frames = Vec::new();
        // LineCodec::decode never fails.
        while let Ok(Some(frame)) = self.codec.decode(&mut self.pending) {
            frames.push(frame.freeze());
        }
        frames
    }

    /// Bytes received since the last delimiter.
    pub fn pending_len(&self) -> usize {
        self.pending.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rand::Rng;

    fn wire(frames: &[&[u8]]) -> Vec<u8> {
        let mut codec = LineCodec::new();
        let mut buf = BytesMut::new();
        for frame in frames {
            codec.encode(Bytes::copy_from_slice(frame), &mut buf).unwrap();
        }
        buf.to_vec()
    }

    fn reassemble(data: &[u8], chunk_size: usize) -> Vec<Bytes> {
        let mut assembler = FrameAssembler::new();
        data.chunks(chunk_size).flat_map(|c| assembler.push(c)).collect()
    }

    #[test]
    fn test_encode_appends_delimiter() {
        assert_eq!(wire(&[b"abc", b""]), b"abc\n\n");
    }

    #[test]
    fn test_multiple_frames_in_one_chunk() {
        let frames = reassemble(b"one\ntwo\nthree\n", 1024);
        assert_eq!(frames, vec!["one", "two", "three"]);
    }

    #[test]
    fn test_delimiter_first_in_chunk() {
        let mut assembler = FrameAssembler::new();
        assert!(assembler.push(b"hello").is_empty());
        assert_eq!(assembler.pending_len(), 5);
        assert_eq!(assembler.push(b"\nworld"), vec!["hello"]);
        assert_eq!(assembler.push(b"\n"), vec!["world"]);
        assert_eq!(assembler.pending_len(), 0);
    }

    #[test]
    fn test_frame_spanning_many_chunks() {
        let long = vec![b'x'; 5000];
        let data = wire(&[&long, b"tail"]);
        let frames = reassemble(&data, 7);
        assert_eq!(frames.len(), 2);
        assert_eq!(&frames[0][..], &long[..]);
        assert_eq!(&frames[1][..], b"tail");
    }

    #[test]
    fn test_single_byte_reads() {
        let expected: Vec<&[u8]> = vec![b"{\"msgType\":1}", b"", b"a", b"second frame"];
        let frames = reassemble(&wire(&expected), 1);
        assert_eq!(frames, expected);
    }

    #[test]
    fn test_random_chunking_preserves_sequence() {
        let mut rng = rand::thread_rng();
        let expected: Vec<Vec<u8>> = (0..50)
            .map(|i| format!("frame-{}-{}", i, "y".repeat(rng.gen_range(0..40))).into_bytes())
            .collect();
        let refs: Vec<&[u8]> = expected.iter().map(|f| f.as_slice()).collect();
        let data = wire(&refs);

        let mut assembler = FrameAssembler::new();
        let mut out = Vec::new();
        let mut rest = &data[..];
        while !rest.is_empty() {
            let n = rng.gen_range(1..=rest.len().min(64));
            out.extend(assembler.push(&rest[..n]));
            rest = &rest[n..];
        }
        assert_eq!(out, expected);
        assert_eq!(assembler.pending_len(), 0);
    }

    #[test]
    fn test_unterminated_tail_is_held() {
        let frames = reassemble(b"done\npartial", 3);
        assert_eq!(frames, vec!["done"]);
    }
}

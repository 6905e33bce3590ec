//! Length-delimited framing for the host ⇄ manager ⇄ context byte streams.
//!
//! Every frame is a 4-byte unsigned **big-endian** length followed by exactly
//! that many payload bytes. Big-endian is the only byte order this crate reads
//! or writes.
//!
//! [`FrameCodec`] plugs into `tokio_util::codec::{FramedRead, FramedWrite}`;
//! [`FrameBuffer`] exposes the same decoder as a push-style `feed()` for
//! callers that receive bytes in arbitrary chunks.

use bytes::{Buf, BufMut, Bytes, BytesMut};
use thiserror::Error;
use tokio_util::codec::{Decoder, Encoder};

/// Width of the length prefix in bytes.
pub const PREFIX_LEN: usize = 4;

/// Default upper bound for a single frame payload (16 MiB).
pub const DEFAULT_MAX_FRAME_LEN: usize = 16 * 1024 * 1024;

#[derive(Debug, Error)]
pub enum FrameError {
    #[error("frame transport i/o failed: {0}")]
    Io(#[from] std::io::Error),
    /// The prefix announced more bytes than we accept. The stream cannot be
    /// resynchronised after this.
    #[error("frame of {len} bytes exceeds the {max} byte limit")]
    TooLarge { len: usize, max: usize },
    #[error("envelope could not be encoded: {0}")]
    Encode(#[from] serde_json::Error),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FrameCodec {
    max_frame_len: usize,
}

impl FrameCodec {
    pub fn new() -> Self {
        Self { max_frame_len: DEFAULT_MAX_FRAME_LEN }
    }

    /// The limit is clamped to what a `u32` prefix can express.
    pub fn with_max_frame_len(max_frame_len: usize) -> Self {
        Self { max_frame_len: max_frame_len.min(u32::MAX as usize) }
    }

    pub fn max_frame_len(&self) -> usize {
        self.max_frame_len
    }
}

impl Default for FrameCodec {
    fn default() -> Self {
        Self::new()
    }
}

impl Decoder for FrameCodec {
    type Item = Bytes;
    type Error = FrameError;

    fn decode(&mut self, src: &mut BytesMut) -> Result<Option<Bytes>, FrameError> {
        if src.len() < PREFIX_LEN {
            return Ok(None);
        }

        let mut prefix = [0u8; PREFIX_LEN];
        prefix.copy_from_slice(&src[..PREFIX_LEN]);
        let len = u32::from_be_bytes(prefix) as usize;
        if len > self.max_frame_len {
            return Err(FrameError::TooLarge { len, max: self.max_frame_len });
        }

        let total = PREFIX_LEN + len;
        if src.len() < total {
            src.reserve(total - src.len());
            return Ok(None);
        }

        src.advance(PREFIX_LEN);
        Ok(Some(src.split_to(len).freeze()))
    }
}

impl Encoder<Bytes> for FrameCodec {
    type Error = FrameError;

    fn encode(&mut self, item: Bytes, dst: &mut BytesMut) -> Result<(), FrameError> {
        if item.len() > self.max_frame_len {
            return Err(FrameError::TooLarge { len: item.len(), max: self.max_frame_len });
        }
        dst.reserve(PREFIX_LEN + item.len());
        dst.put_u32(item.len() as u32);
        dst.extend_from_slice(&item);
        Ok(())
    }
}

/// Encode a single payload as one frame.
pub fn encode_frame(payload: &[u8]) -> Result<Bytes, FrameError> {
    let mut dst = BytesMut::with_capacity(PREFIX_LEN + payload.len());
    FrameCodec::new().encode(Bytes::copy_from_slice(payload), &mut dst)?;
    Ok(dst.freeze())
}

/// Restartable accumulator: push bytes in whatever chunks they arrive and get
/// back every frame that became complete.
#[derive(Debug, Default)]
pub struct FrameBuffer {
    codec: FrameCodec,
    buf: BytesMut,
}

impl FrameBuffer {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_codec(codec: FrameCodec) -> Self {
        Self { codec, buf: BytesMut::new() }
    }

    pub fn feed(&mut self, chunk: &[u8]) -> Result<Vec<Bytes>, FrameError> {
        self.buf.extend_from_slice(chunk);
        let mut frames = Vec::new();
        while let Some(frame) = self.codec.decode(&mut self.buf)? {
            frames.push(frame);
        }
        Ok(frames)
    }

    /// Bytes held back waiting for the rest of a frame.
    pub fn buffered(&self) -> usize {
        self.buf.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    fn encode_all(payloads: &[Vec<u8>]) -> Vec<u8> {
        let mut out = Vec::new();
        for payload in payloads {
            out.extend_from_slice(&encode_frame(payload).unwrap());
        }
        out
    }

    #[test]
    fn prefix_is_big_endian() {
        let frame = encode_frame(b"abc").unwrap();
        assert_eq!(&frame[..], &[0, 0, 0, 3, b'a', b'b', b'c']);
    }

    #[test]
    fn zero_length_frame_is_yielded() {
        let mut buffer = FrameBuffer::new();
        let frames = buffer.feed(&encode_frame(b"").unwrap()).unwrap();
        assert_eq!(frames.len(), 1);
        assert!(frames[0].is_empty());
        assert_eq!(buffer.buffered(), 0);
    }

    #[test]
    fn split_inside_prefix_waits_for_rest() {
        let bytes = encode_frame(b"hello").unwrap();
        let mut buffer = FrameBuffer::new();

        assert!(buffer.feed(&bytes[..2]).unwrap().is_empty());
        assert!(buffer.feed(&bytes[2..6]).unwrap().is_empty());
        let frames = buffer.feed(&bytes[6..]).unwrap();
        assert_eq!(frames, vec![Bytes::from_static(b"hello")]);
    }

    #[test]
    fn oversized_prefix_is_rejected() {
        let mut codec = FrameCodec::with_max_frame_len(8);
        let mut src = BytesMut::from(&[0u8, 0, 0, 9][..]);
        match codec.decode(&mut src) {
            Err(FrameError::TooLarge { len: 9, max: 8 }) => {}
            other => panic!("unexpected decode result: {other:?}"),
        }
    }

    #[test]
    fn oversized_payload_is_not_encoded() {
        let mut codec = FrameCodec::with_max_frame_len(2);
        let mut dst = BytesMut::new();
        assert!(codec.encode(Bytes::from_static(b"abc"), &mut dst).is_err());
        assert!(dst.is_empty());
    }

    proptest! {
        #[test]
        fn round_trip_any_payload(payload in proptest::collection::vec(any::<u8>(), 0..2048)) {
            let mut buffer = FrameBuffer::new();
            let frames = buffer.feed(&encode_frame(&payload).unwrap()).unwrap();
            prop_assert_eq!(frames.len(), 1);
            prop_assert_eq!(&frames[0][..], &payload[..]);
        }

        #[test]
        fn chunking_does_not_change_frames(
            payloads in proptest::collection::vec(proptest::collection::vec(any::<u8>(), 0..64), 0..8),
            cuts in proptest::collection::vec(any::<usize>(), 0..16),
        ) {
            let bytes = encode_all(&payloads);

            let mut whole = FrameBuffer::new();
            let expected = whole.feed(&bytes).unwrap();

            let mut points: Vec<usize> = cuts.iter().map(|c| c % (bytes.len() + 1)).collect();
            points.push(0);
            points.push(bytes.len());
            points.sort_unstable();
            points.dedup();

            let mut chunked = FrameBuffer::new();
            let mut got = Vec::new();
            for window in points.windows(2) {
                got.extend(chunked.feed(&bytes[window[0]..window[1]]).unwrap());
            }

            prop_assert_eq!(&got, &expected);
            prop_assert_eq!(got.len(), payloads.len());
            prop_assert_eq!(chunked.buffered(), 0);
        }
    }
}

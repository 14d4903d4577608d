//! Stream framing for the radio TCP transport
//!
//! Every payload on the wire is wrapped in a fixed 4-byte header:
//! - Start marker (2 bytes): 0x94 0xC3
//! - Payload Length (2 bytes): big-endian, at most 512
//!
//! The decoder is a resynchronizing scanner: anything that is not a valid
//! header is discarded one byte at a time until the next start marker, so a
//! corrupted stream only ever loses the damaged region.

use crate::error::{ProtoError, Result};

/// First byte of the frame start marker
pub const START1: u8 = 0x94;

/// Second byte of the frame start marker
pub const START2: u8 = 0xC3;

/// Frame header size: marker (2) + length (2)
pub const HEADER_LEN: usize = 4;

/// Maximum payload length a frame may carry
pub const MAX_PAYLOAD_LEN: usize = 512;

/// Wrap a payload in the 4-byte framed header.
pub fn encode_frame(payload: &[u8]) -> Result<Vec<u8>> {
    if payload.len() > MAX_PAYLOAD_LEN {
        return Err(ProtoError::FrameTooLarge {
            size: payload.len(),
            max: MAX_PAYLOAD_LEN,
        });
    }

    let mut frame = Vec::with_capacity(HEADER_LEN + payload.len());
    frame.push(START1);
    frame.push(START2);
    frame.extend_from_slice(&(payload.len() as u16).to_be_bytes());
    frame.extend_from_slice(payload);
    Ok(frame)
}

/// Incremental frame decoder for one peer's byte stream.
///
/// `feed` appends raw bytes; `take` drains every complete payload and keeps
/// the partial tail for the next read. Neither operation blocks or fails.
#[derive(Debug, Default)]
pub struct FrameDecoder {
    buf: Vec<u8>,
}

impl FrameDecoder {
    pub fn new() -> Self {
        FrameDecoder { buf: Vec::new() }
    }

    /// Append bytes read from the stream.
    pub fn feed(&mut self, bytes: &[u8]) {
        self.buf.extend_from_slice(bytes);
    }

    /// Drain all complete payloads, retaining any partial frame.
    pub fn take(&mut self) -> Vec<Vec<u8>> {
        let mut payloads = Vec::new();
        let mut pos = 0usize;

        loop {
            // Scan forward for the start marker.
            match self.buf[pos..].iter().position(|&b| b == START1) {
                Some(offset) => pos += offset,
                None => {
                    pos = self.buf.len();
                    break;
                }
            }

            // Need the full header before the frame can be judged.
            if self.buf.len() - pos < HEADER_LEN {
                break;
            }

            if self.buf[pos + 1] != START2 {
                // False start marker; drop one byte and resync.
                pos += 1;
                continue;
            }

            let len = u16::from_be_bytes([self.buf[pos + 2], self.buf[pos + 3]]) as usize;
            if len > MAX_PAYLOAD_LEN {
                pos += 1;
                continue;
            }

            if self.buf.len() - pos < HEADER_LEN + len {
                // Partial frame; wait for more bytes.
                break;
            }

            let start = pos + HEADER_LEN;
            payloads.push(self.buf[start..start + len].to_vec());
            pos = start + len;
        }

        self.buf.drain(..pos);
        payloads
    }

    /// Bytes currently buffered (partial frame or unscanned garbage).
    pub fn pending(&self) -> usize {
        self.buf.len()
    }

    /// Discard any buffered bytes, e.g. after a reconnect.
    pub fn reset(&mut self) {
        self.buf.clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_encode_frame_header() {
        let frame = encode_frame(b"abc").unwrap();
        assert_eq!(&frame[..4], &[START1, START2, 0x00, 0x03]);
        assert_eq!(&frame[4..], b"abc");
    }

    #[test]
    fn test_encode_frame_too_large() {
        let payload = vec![0u8; MAX_PAYLOAD_LEN + 1];
        assert!(matches!(
            encode_frame(&payload),
            Err(ProtoError::FrameTooLarge { .. })
        ));
    }

    #[test]
    fn test_round_trip_single() {
        let mut decoder = FrameDecoder::new();
        decoder.feed(&encode_frame(b"hello").unwrap());
        assert_eq!(decoder.take(), vec![b"hello".to_vec()]);
        assert_eq!(decoder.pending(), 0);
    }

    #[test]
    fn test_round_trip_empty_payload() {
        let mut decoder = FrameDecoder::new();
        decoder.feed(&encode_frame(b"").unwrap());
        assert_eq!(decoder.take(), vec![Vec::<u8>::new()]);
    }

    #[test]
    fn test_round_trip_max_payload() {
        let payload = vec![0x42u8; MAX_PAYLOAD_LEN];
        let mut decoder = FrameDecoder::new();
        decoder.feed(&encode_frame(&payload).unwrap());
        assert_eq!(decoder.take(), vec![payload]);
    }

    #[test]
    fn test_concatenated_frames() {
        let mut stream = Vec::new();
        let payloads: Vec<Vec<u8>> = (0u8..5).map(|i| vec![i; i as usize + 1]).collect();
        for p in &payloads {
            stream.extend_from_slice(&encode_frame(p).unwrap());
        }

        let mut decoder = FrameDecoder::new();
        decoder.feed(&stream);
        assert_eq!(decoder.take(), payloads);
        assert_eq!(decoder.pending(), 0);
    }

    #[test]
    fn test_partial_then_complete() {
        let frame = encode_frame(b"split me").unwrap();
        let mut decoder = FrameDecoder::new();

        decoder.feed(&frame[..3]);
        assert!(decoder.take().is_empty());

        decoder.feed(&frame[3..]);
        assert_eq!(decoder.take(), vec![b"split me".to_vec()]);
    }

    #[test]
    fn test_garbage_prefix_resync() {
        let mut stream = vec![0x00, 0xFF, 0x13, 0x37];
        stream.extend_from_slice(&encode_frame(b"ok").unwrap());

        let mut decoder = FrameDecoder::new();
        decoder.feed(&stream);
        assert_eq!(decoder.take(), vec![b"ok".to_vec()]);
    }

    #[test]
    fn test_false_start_marker_resync() {
        // START1 followed by a non-START2 byte must be skipped, and a real
        // frame beginning inside the garbage must still be found.
        let mut stream = vec![START1, 0x00];
        stream.extend_from_slice(&encode_frame(b"after noise").unwrap());

        let mut decoder = FrameDecoder::new();
        decoder.feed(&stream);
        assert_eq!(decoder.take(), vec![b"after noise".to_vec()]);
    }

    #[test]
    fn test_oversize_length_resync() {
        // A header advertising more than MAX_PAYLOAD_LEN is invalid and must
        // not stall the decoder waiting for bytes that never come.
        let mut stream = vec![START1, START2, 0xFF, 0xFF];
        stream.extend_from_slice(&encode_frame(b"recovered").unwrap());

        let mut decoder = FrameDecoder::new();
        decoder.feed(&stream);
        assert_eq!(decoder.take(), vec![b"recovered".to_vec()]);
    }

    #[test]
    fn test_tail_retained_across_take() {
        let first = encode_frame(b"one").unwrap();
        let second = encode_frame(b"two").unwrap();

        let mut decoder = FrameDecoder::new();
        decoder.feed(&first);
        decoder.feed(&second[..2]);
        assert_eq!(decoder.take(), vec![b"one".to_vec()]);

        decoder.feed(&second[2..]);
        assert_eq!(decoder.take(), vec![b"two".to_vec()]);
    }
}

//! Length-prefixed framing for the TCP fallback path (§4.7).
//!
//! ```text
//! [0..4]  type: u32 little-endian, one of TcpFrameType's discriminants
//! [4..8]  payload_length: u32 little-endian
//! [8..]   payload: protobuf-encoded bytes
//! ```
//!
//! TCP gives ordering and reliability for free; this header exists only so
//! a reader on a byte stream knows where one frame ends and the next
//! begins, and which of video/audio/control/reliable it is.

use bytes::{Buf, BufMut, BytesMut};

use crate::messages::TcpFrameType;

pub const FRAME_HEADER_SIZE: usize = 8;

#[derive(Debug, thiserror::Error)]
pub enum FrameError {
    #[error("buffer too short: {0} bytes (need at least {FRAME_HEADER_SIZE})")]
    TooShort(usize),
    #[error("unknown frame type discriminant: {0}")]
    UnknownType(u32),
    #[error("incomplete payload: expected {expected} bytes, got {actual}")]
    IncompletePayload { expected: usize, actual: usize },
}

/// Encode one frame: header + payload, appended to `out`.
pub fn encode_frame(frame_type: TcpFrameType, payload: &[u8], out: &mut BytesMut) {
    out.reserve(FRAME_HEADER_SIZE + payload.len());
    out.put_u32_le(frame_type as u32);
    out.put_u32_le(payload.len() as u32);
    out.put_slice(payload);
}

/// The header fields of one frame, without consuming the payload.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FrameHeader {
    pub frame_type: TcpFrameType,
    pub payload_length: u32,
}

/// Parse just the 8-byte header, without requiring the payload to be present.
pub fn decode_header(buf: &[u8]) -> Result<FrameHeader, FrameError> {
    if buf.len() < FRAME_HEADER_SIZE {
        return Err(FrameError::TooShort(buf.len()));
    }
    let type_raw = u32::from_le_bytes([buf[0], buf[1], buf[2], buf[3]]);
    let frame_type =
        TcpFrameType::from_u32(type_raw).ok_or(FrameError::UnknownType(type_raw))?;
    let payload_length = u32::from_le_bytes([buf[4], buf[5], buf[6], buf[7]]);
    Ok(FrameHeader {
        frame_type,
        payload_length,
    })
}

/// Try to decode one complete frame from the front of `buf`, advancing
/// `buf` past it on success. Returns `Ok(None)` if the buffer doesn't yet
/// hold a complete frame — the caller should read more bytes and retry.
pub fn try_decode_frame(buf: &mut BytesMut) -> Result<Option<(TcpFrameType, BytesMut)>, FrameError> {
    if buf.len() < FRAME_HEADER_SIZE {
        return Ok(None);
    }
    let header = decode_header(&buf[..FRAME_HEADER_SIZE])?;
    let total = FRAME_HEADER_SIZE + header.payload_length as usize;
    if buf.len() < total {
        return Ok(None);
    }
    buf.advance(FRAME_HEADER_SIZE);
    let payload = buf.split_to(header.payload_length as usize);
    Ok(Some((header.frame_type, payload)))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn encode_decode_roundtrip() {
        let payload = vec![1, 2, 3, 4, 5];
        let mut buf = BytesMut::new();
        encode_frame(TcpFrameType::Video, &payload, &mut buf);

        let (frame_type, decoded) = try_decode_frame(&mut buf).unwrap().unwrap();
        assert_eq!(frame_type, TcpFrameType::Video);
        assert_eq!(&decoded[..], &payload[..]);
        assert!(buf.is_empty());
    }

    #[test]
    fn try_decode_returns_none_when_header_incomplete() {
        let mut buf = BytesMut::from(&[1, 2, 3][..]);
        assert!(try_decode_frame(&mut buf).unwrap().is_none());
    }

    #[test]
    fn try_decode_returns_none_when_payload_incomplete() {
        let mut buf = BytesMut::new();
        encode_frame(TcpFrameType::Audio, &[0u8; 100], &mut buf);
        buf.truncate(buf.len() - 10);
        assert!(try_decode_frame(&mut buf).unwrap().is_none());
    }

    #[test]
    fn unknown_frame_type_rejected() {
        let mut buf = BytesMut::new();
        buf.put_u32_le(99);
        buf.put_u32_le(0);
        match decode_header(&buf) {
            Err(FrameError::UnknownType(99)) => {}
            other => panic!("expected UnknownType(99), got {:?}", other),
        }
    }

    #[test]
    fn multiple_frames_back_to_back() {
        let mut buf = BytesMut::new();
        encode_frame(TcpFrameType::Control, b"one", &mut buf);
        encode_frame(TcpFrameType::Reliable, b"two", &mut buf);

        let (t1, p1) = try_decode_frame(&mut buf).unwrap().unwrap();
        assert_eq!(t1, TcpFrameType::Control);
        assert_eq!(&p1[..], b"one");

        let (t2, p2) = try_decode_frame(&mut buf).unwrap().unwrap();
        assert_eq!(t2, TcpFrameType::Reliable);
        assert_eq!(&p2[..], b"two");

        assert!(buf.is_empty());
    }
}

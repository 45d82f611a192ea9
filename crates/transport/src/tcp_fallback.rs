//! TCP fallback transport (§4.13): a structurally identical façade to the
//! UDP path's `Connection`, over one TCP connection with length-prefixed
//! `[u32 type][payload]` frames. No pacing, no DTLS by default (TLS stays
//! available as `SecurityConfig::tcp_fallback_tls` but the default is
//! off), no RTP extensions — ordering and reliability come from TCP
//! itself.
//!
//! Payloads are `prost`-generated protobuf messages. The teacher's stack
//! has no protobuf dependency of its own; `prost` is added solely for
//! this module (noted in DESIGN.md as a stack addition).

use bytes::{Bytes, BytesMut};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::net::TcpStream;

use beam_protocol::frame::{encode_frame, try_decode_frame};
use beam_protocol::messages::TcpFrameType;

use crate::error::TcpFallbackError;

const READ_CHUNK: usize = 8192;

#[derive(Clone, PartialEq, Debug, prost::Message)]
pub struct VideoFramePayload {
    #[prost(bytes = "bytes", tag = "1")]
    pub data: Bytes,
    #[prost(bool, tag = "2")]
    pub is_keyframe: bool,
    #[prost(uint32, tag = "3")]
    pub frame_id: u32,
    #[prost(int64, tag = "4")]
    pub encode_timestamp_us: i64,
    #[prost(int64, tag = "5")]
    pub encode_duration_us: i64,
}

#[derive(Clone, PartialEq, Debug, prost::Message)]
pub struct AudioFramePayload {
    #[prost(bytes = "bytes", tag = "1")]
    pub data: Bytes,
}

#[derive(Clone, PartialEq, Debug, prost::Message)]
pub struct ControlMessagePayload {
    #[prost(bytes = "bytes", tag = "1")]
    pub data: Bytes,
    #[prost(bool, tag = "2")]
    pub reliable: bool,
}

/// One decoded inbound frame, with its payload already parsed into the
/// matching protobuf message.
pub enum FallbackEvent {
    Video(VideoFramePayload),
    Audio(AudioFramePayload),
    Control(ControlMessagePayload),
    Reliable(ControlMessagePayload),
}

/// The write half: encodes and sends framed protobuf payloads.
pub struct TcpFallbackSender {
    write_half: OwnedWriteHalf,
}

impl TcpFallbackSender {
    async fn send_frame(
        &mut self,
        frame_type: TcpFrameType,
        payload: &impl prost::Message,
    ) -> Result<(), TcpFallbackError> {
        let encoded = payload.encode_to_vec();
        let mut out = BytesMut::new();
        encode_frame(frame_type, &encoded, &mut out);
        self.write_half.write_all(&out).await?;
        Ok(())
    }

    pub async fn send_video(&mut self, payload: VideoFramePayload) -> Result<(), TcpFallbackError> {
        self.send_frame(TcpFrameType::Video, &payload).await
    }

    pub async fn send_audio(&mut self, payload: AudioFramePayload) -> Result<(), TcpFallbackError> {
        self.send_frame(TcpFrameType::Audio, &payload).await
    }

    pub async fn send_control(&mut self, payload: ControlMessagePayload) -> Result<(), TcpFallbackError> {
        self.send_frame(TcpFrameType::Control, &payload).await
    }

    pub async fn send_reliable(&mut self, payload: ControlMessagePayload) -> Result<(), TcpFallbackError> {
        self.send_frame(TcpFrameType::Reliable, &payload).await
    }
}

/// The read half: accumulates bytes and yields fully decoded frames.
pub struct TcpFallbackReceiver {
    read_half: OwnedReadHalf,
    buf: BytesMut,
}

impl TcpFallbackReceiver {
    /// Reads from the socket until at least one frame can be decoded, or
    /// the connection closes (`Ok(None)`).
    pub async fn recv_event(&mut self) -> Result<Option<FallbackEvent>, TcpFallbackError> {
        loop {
            if let Some((frame_type, payload)) = try_decode_frame(&mut self.buf)? {
                return Ok(Some(decode_event(frame_type, &payload)?));
            }
            let mut chunk = [0u8; READ_CHUNK];
            let n = self.read_half.read(&mut chunk).await?;
            if n == 0 {
                return Ok(None);
            }
            self.buf.extend_from_slice(&chunk[..n]);
        }
    }
}

fn decode_event(frame_type: TcpFrameType, payload: &[u8]) -> Result<FallbackEvent, TcpFallbackError> {
    use prost::Message;
    Ok(match frame_type {
        TcpFrameType::Video => FallbackEvent::Video(VideoFramePayload::decode(payload)?),
        TcpFrameType::Audio => FallbackEvent::Audio(AudioFramePayload::decode(payload)?),
        TcpFrameType::Control => FallbackEvent::Control(ControlMessagePayload::decode(payload)?),
        TcpFrameType::Reliable => FallbackEvent::Reliable(ControlMessagePayload::decode(payload)?),
    })
}

/// Splits an established TCP connection into its sender/receiver halves.
pub fn split(stream: TcpStream) -> (TcpFallbackSender, TcpFallbackReceiver) {
    let (read_half, write_half) = stream.into_split();
    (
        TcpFallbackSender { write_half },
        TcpFallbackReceiver {
            read_half,
            buf: BytesMut::new(),
        },
    )
}

impl From<prost::DecodeError> for TcpFallbackError {
    fn from(e: prost::DecodeError) -> Self {
        TcpFallbackError::Io(std::io::Error::new(std::io::ErrorKind::InvalidData, e))
    }
}

//! Outbound video packetization (§4.8), grounded on
//! `rtc2::VideoSendStream::sendFrame`/`packetize`: every packet carries a
//! `LtPacketInfo` extension, the first packet of a frame additionally
//! carries `LtFrameInfo`, and packet size is budgeted against a fixed MTU
//! minus IPv6/UDP/RTP header overhead.
//!
//! The original assigns the final RTP sequence number on the pacer/cc
//! thread (`onPcedPacket`), after `packetize` runs on the caller's thread.
//! Congestion control is out of scope here (§ Non-goals: the send rate is
//! externally supplied, not computed), so there is no separate cc stage to
//! defer sequencing to — sequence numbers are assigned directly during
//! packetization instead.

use bytes::Bytes;

use crate::pacer::PacedPacket;
use crate::rtp::extensions::{LtFrameInfo, LtPacketInfo};
use crate::rtp::packet::RtpPacket;

const MTU: u32 = 1450;
const IPV6_HEADER_SIZE: u32 = 40;
const UDP_HEADER_SIZE: u32 = 8;
const RTP_HEADER_SIZE: u32 = 12;
const MAX_PACKET_SIZE: u32 = MTU - IPV6_HEADER_SIZE - UDP_HEADER_SIZE - RTP_HEADER_SIZE;
const VIDEO_PAYLOAD_TYPE: u8 = 125;

/// Minimum encode-duration tick the original chose: 150us, so a u16
/// encode-duration field can span up to 9.83 seconds.
const ENCODE_DURATION_TICK_US: i64 = 150;

/// An encoded video frame ready to be packetized and sent.
pub struct VideoFrame {
    pub data: Bytes,
    pub is_keyframe: bool,
    pub frame_id: u32,
    pub encode_timestamp_us: i64,
    pub encode_duration_us: i64,
}

pub struct VideoSendStream {
    ssrc: u32,
    rtp_seq: u16,
}

impl VideoSendStream {
    pub fn new(ssrc: u32) -> Self {
        // Random, nonzero initial sequence number, matching the original's
        // `rand() % 0x7fff` (clamped away from zero).
        let rtp_seq = (rand::random::<u16>() % 0x7fff).max(1);
        Self { ssrc, rtp_seq }
    }

    pub fn ssrc(&self) -> u32 {
        self.ssrc
    }

    /// Splits `frame` into MTU-budgeted RTP packets with frame-boundary
    /// and keyframe flags set, ready for the pacer's FIFO.
    pub fn send_frame(&mut self, frame: &VideoFrame) -> Vec<PacedPacket> {
        let packet_info_size = LtPacketInfo::default().value_size() as u32;
        let frame_info_size = LtFrameInfo::default().value_size() as u32;

        let mut packets = Vec::new();
        let mut offset = 0u32;
        let total = frame.data.len() as u32;
        let mut first_packet = true;

        while offset < total {
            let mut packet_size = MAX_PACKET_SIZE - packet_info_size;
            let frame_info = if first_packet {
                packet_size -= frame_info_size;
                Some(LtFrameInfo {
                    frame_id: (frame.frame_id & 0xFFFF) as u16,
                    encode_duration: (frame.encode_duration_us / ENCODE_DURATION_TICK_US) as u16,
                })
            } else {
                None
            };

            let mut packet_info = LtPacketInfo {
                first_packet_in_frame: first_packet,
                retransmit: false,
                keyframe: frame.is_keyframe,
                ..Default::default()
            };

            if offset + packet_size >= total {
                packet_size = total - offset;
                packet_info.last_packet_in_frame = true;
            }

            let mut rtp = RtpPacket::new(
                VIDEO_PAYLOAD_TYPE,
                self.rtp_seq,
                (frame.encode_timestamp_us / 1000) as u32,
                self.ssrc,
                packet_info.last_packet_in_frame,
            );
            self.rtp_seq = self.rtp_seq.wrapping_add(1);

            if let Some(finfo) = &frame_info {
                rtp.set_extension(finfo).expect("frame info extension always fits");
            }
            rtp.set_extension(&packet_info).expect("packet info extension always fits");

            let chunk = frame.data.slice(offset as usize..(offset + packet_size) as usize);
            rtp.set_payload(&chunk);

            packets.push(PacedPacket::new(rtp.freeze()));
            offset += packet_size;
            first_packet = false;
        }

        packets
    }
}

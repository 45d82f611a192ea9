//! Audio media path (§4.10): the degenerate case of the video path — one
//! RTP packet per caller invocation, no header extensions, no
//! reassembly. The receive side hands payload bytes straight through;
//! decoding stays out of scope.

use bytes::Bytes;

use crate::pacer::PacedPacket;
use crate::rtp::packet::{ParsedRtpPacket, RtpPacket};

const AUDIO_PAYLOAD_TYPE: u8 = 111;

pub struct AudioSendStream {
    ssrc: u32,
    rtp_seq: u16,
    rtp_timestamp: u32,
    samples_per_packet: u32,
}

impl AudioSendStream {
    /// `samples_per_packet` advances the RTP timestamp by a fixed amount
    /// each call, matching constant-duration audio frames (e.g. Opus's
    /// 960 samples at 48kHz for a 20ms frame).
    pub fn new(ssrc: u32, samples_per_packet: u32) -> Self {
        let rtp_seq = (rand::random::<u16>() % 0x7fff).max(1);
        Self {
            ssrc,
            rtp_seq,
            rtp_timestamp: rand::random(),
            samples_per_packet,
        }
    }

    pub fn ssrc(&self) -> u32 {
        self.ssrc
    }

    /// Wraps one encoded audio frame in a single RTP packet.
    pub fn send_frame(&mut self, payload: &[u8]) -> PacedPacket {
        let mut rtp = RtpPacket::new(
            AUDIO_PAYLOAD_TYPE,
            self.rtp_seq,
            self.rtp_timestamp,
            self.ssrc,
            true,
        );
        rtp.set_payload(payload);
        self.rtp_seq = self.rtp_seq.wrapping_add(1);
        self.rtp_timestamp = self.rtp_timestamp.wrapping_add(self.samples_per_packet);
        PacedPacket::new(rtp.freeze())
    }
}

pub struct AudioReceiveStream {
    ssrc: u32,
}

impl AudioReceiveStream {
    pub fn new(ssrc: u32) -> Self {
        Self { ssrc }
    }

    pub fn ssrc(&self) -> u32 {
        self.ssrc
    }

    /// Returns the packet's payload verbatim; no reassembly or extension
    /// parsing is performed.
    pub fn handle_rtp_packet(&self, parsed: &ParsedRtpPacket) -> Bytes {
        Bytes::copy_from_slice(parsed.payload())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn send_frame_produces_one_packet_per_call() {
        let mut stream = AudioSendStream::new(55, 960);
        let p1 = stream.send_frame(b"opus-frame-1");
        let p2 = stream.send_frame(b"opus-frame-2");
        let parsed1 = RtpPacket::parse(&p1.data).unwrap();
        let parsed2 = RtpPacket::parse(&p2.data).unwrap();
        assert_eq!(parsed2.sequence_number(), parsed1.sequence_number().wrapping_add(1));
        assert_eq!(parsed2.timestamp(), parsed1.timestamp().wrapping_add(960));
    }

    #[test]
    fn receive_stream_passes_payload_through_verbatim() {
        let mut send = AudioSendStream::new(55, 960);
        let packet = send.send_frame(b"pcm-data");
        let parsed = RtpPacket::parse(&packet.data).unwrap();
        let recv = AudioReceiveStream::new(55);
        let out = recv.handle_rtp_packet(&parsed);
        assert_eq!(&out[..], b"pcm-data");
    }
}

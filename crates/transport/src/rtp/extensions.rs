//! Typed RTP header extensions (§4.5), matching `rtc2::LtPacketInfo` /
//! `rtc2::LtFrameInfo`. Each extension knows its own wire id, URI (for
//! documentation/debugging, never transmitted — this core negotiates
//! extension ids out of band rather than via SDP), and a fixed value size.

/// One-byte-profile extension ids may range 1-14 (0 and 15 are reserved).
pub const ONE_BYTE_MAX_ID: u8 = 14;
pub const ONE_BYTE_MAX_VALUE_SIZE: usize = 16;

pub trait HeaderExtension: Sized {
    const ID: u8;
    const URI: &'static str;

    fn value_size(&self) -> usize;
    fn write_to(&self, buf: &mut [u8]);
    fn read_from(buf: &[u8]) -> Option<Self>;
}

/// Per-packet metadata: frame boundary flags, keyframe flag, retransmit
/// flag, and the packet's own sequence number (redundant with the RTP
/// header's sequence number field, but convenient for the frame assembler
/// to read without re-parsing the fixed header). 3 bytes on the wire:
/// one flags byte + a 16-bit sequence number.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct LtPacketInfo {
    pub first_packet_in_frame: bool,
    pub last_packet_in_frame: bool,
    pub keyframe: bool,
    pub retransmit: bool,
    pub sequence_number: u16,
}

const FLAG_FIRST: u8 = 0b0000_0001;
const FLAG_LAST: u8 = 0b0000_0010;
const FLAG_KEYFRAME: u8 = 0b0000_0100;
const FLAG_RETRANSMIT: u8 = 0b0000_1000;

impl HeaderExtension for LtPacketInfo {
    const ID: u8 = 1;
    const URI: &'static str = "lanthing-packet-info";

    fn value_size(&self) -> usize {
        3
    }

    fn write_to(&self, buf: &mut [u8]) {
        let mut flags = 0u8;
        if self.first_packet_in_frame {
            flags |= FLAG_FIRST;
        }
        if self.last_packet_in_frame {
            flags |= FLAG_LAST;
        }
        if self.keyframe {
            flags |= FLAG_KEYFRAME;
        }
        if self.retransmit {
            flags |= FLAG_RETRANSMIT;
        }
        buf[0] = flags;
        buf[1..3].copy_from_slice(&self.sequence_number.to_be_bytes());
    }

    fn read_from(buf: &[u8]) -> Option<Self> {
        if buf.len() < 3 {
            return None;
        }
        let flags = buf[0];
        Some(LtPacketInfo {
            first_packet_in_frame: flags & FLAG_FIRST != 0,
            last_packet_in_frame: flags & FLAG_LAST != 0,
            keyframe: flags & FLAG_KEYFRAME != 0,
            retransmit: flags & FLAG_RETRANSMIT != 0,
            sequence_number: u16::from_be_bytes([buf[1], buf[2]]),
        })
    }
}

/// Frame-level metadata carried on exactly one packet per frame (§4.5):
/// frame id and encode duration, 4 bytes on the wire.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct LtFrameInfo {
    pub frame_id: u16,
    pub encode_duration: u16,
}

impl HeaderExtension for LtFrameInfo {
    const ID: u8 = 2;
    const URI: &'static str = "lanthing-frame-info";

    fn value_size(&self) -> usize {
        4
    }

    fn write_to(&self, buf: &mut [u8]) {
        buf[0..2].copy_from_slice(&self.frame_id.to_be_bytes());
        buf[2..4].copy_from_slice(&self.encode_duration.to_be_bytes());
    }

    fn read_from(buf: &[u8]) -> Option<Self> {
        if buf.len() < 4 {
            return None;
        }
        Some(LtFrameInfo {
            frame_id: u16::from_be_bytes([buf[0], buf[1]]),
            encode_duration: u16::from_be_bytes([buf[2], buf[3]]),
        })
    }
}

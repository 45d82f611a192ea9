//! RTP packetization (§4.5): fixed header, typed header extensions, and
//! the one-byte/two-byte extension profile promotion rule.

pub mod extensions;
pub mod packet;

pub use extensions::{HeaderExtension, LtFrameInfo, LtPacketInfo, ONE_BYTE_MAX_ID, ONE_BYTE_MAX_VALUE_SIZE};
pub use packet::{ParsedRtpPacket, RtpPacket};

//! RTP packet (RFC 3550) with header-extension support (RFC 8285),
//! including the one-byte (`0xBEDE`) → two-byte (`0x1000`) promotion rule
//! from §4.5: a packet starts in the compact one-byte profile and is
//! promoted, once, the first time an extension needs an id above 14 or a
//! value larger than 16 bytes. Promotion is monotonic — a packet never
//! demotes back to one-byte.
//!
//! `RtpPacket` owns a growable [`bytes::BytesMut`] while being built, and
//! exposes an immutable, cheaply-clonable [`bytes::Bytes`] view for handoff
//! to the pacer and retransmission paths (the "shared-ownership slice
//! type" the original's zero-copy `Buffer` plays in C++).

use bytes::{Bytes, BytesMut};

use crate::error::RtpError;
use crate::rtp::extensions::{HeaderExtension, ONE_BYTE_MAX_ID, ONE_BYTE_MAX_VALUE_SIZE};

const FIXED_HEADER_LEN: usize = 12;
const RTP_VERSION: u8 = 2;
const ONE_BYTE_PROFILE: u16 = 0xBEDE;
const TWO_BYTE_PROFILE: u16 = 0x1000;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum ExtensionMode {
    OneByte,
    TwoByte,
}

#[derive(Debug, Clone, Copy)]
struct ExtensionEntry {
    id: u8,
    /// Offset of the extension's value (after its 1- or 2-byte element header).
    value_offset: usize,
    value_len: usize,
}

/// A mutable RTP packet under construction. Call [`RtpPacket::freeze`] to
/// get the immutable wire-ready [`Bytes`] view.
pub struct RtpPacket {
    buf: BytesMut,
    extension_mode: ExtensionMode,
    extensions: Vec<ExtensionEntry>,
    csrc_count: u8,
}

impl RtpPacket {
    /// Build a new packet with no extensions, no CSRCs, and an empty payload.
    pub fn new(payload_type: u8, sequence_number: u16, timestamp: u32, ssrc: u32, marker: bool) -> Self {
        let mut buf = BytesMut::zeroed(FIXED_HEADER_LEN);
        buf[0] = RTP_VERSION << 6;
        buf[1] = ((marker as u8) << 7) | (payload_type & 0x7F);
        buf[2..4].copy_from_slice(&sequence_number.to_be_bytes());
        buf[4..8].copy_from_slice(&timestamp.to_be_bytes());
        buf[8..12].copy_from_slice(&ssrc.to_be_bytes());
        Self {
            buf,
            extension_mode: ExtensionMode::OneByte,
            extensions: Vec::new(),
            csrc_count: 0,
        }
    }

    pub fn marker(&self) -> bool {
        self.buf[1] & 0x80 != 0
    }

    pub fn payload_type(&self) -> u8 {
        self.buf[1] & 0x7F
    }

    pub fn sequence_number(&self) -> u16 {
        u16::from_be_bytes([self.buf[2], self.buf[3]])
    }

    pub fn timestamp(&self) -> u32 {
        u32::from_be_bytes([self.buf[4], self.buf[5], self.buf[6], self.buf[7]])
    }

    pub fn ssrc(&self) -> u32 {
        u32::from_be_bytes([self.buf[8], self.buf[9], self.buf[10], self.buf[11]])
    }

    fn has_extension_bit(&self) -> bool {
        self.buf[0] & 0b0001_0000 != 0
    }

    fn extension_header_offset(&self) -> usize {
        FIXED_HEADER_LEN + self.csrc_count as usize * 4
    }

    /// Attach or overwrite a typed extension. Promotes the packet to the
    /// two-byte profile if needed (id > 14 or value size > 16 bytes), which
    /// is a one-way move — once promoted, later extensions stay two-byte
    /// even if they'd individually fit the compact form.
    pub fn set_extension<T: HeaderExtension>(&mut self, ext: &T) -> Result<(), RtpError> {
        let value_size = ext.value_size();
        if let Some(existing) = self.extensions.iter().find(|e| e.id == T::ID) {
            if existing.value_len != value_size {
                return Err(RtpError::ExtensionValueTooLarge(value_size));
            }
            let mut tmp = vec![0u8; value_size];
            ext.write_to(&mut tmp);
            self.buf[existing.value_offset..existing.value_offset + value_size]
                .copy_from_slice(&tmp);
            return Ok(());
        }

        let needs_promotion =
            self.extension_mode == ExtensionMode::OneByte
                && (T::ID > ONE_BYTE_MAX_ID || value_size > ONE_BYTE_MAX_VALUE_SIZE);
        if needs_promotion {
            self.promote_to_two_byte();
        }

        self.buf[0] |= 0b0001_0000;
        let element_header_len = match self.extension_mode {
            ExtensionMode::OneByte => 1,
            ExtensionMode::TwoByte => 2,
        };

        let insert_pos = self.next_extension_insert_pos();
        let mut element = vec![0u8; element_header_len + value_size];
        match self.extension_mode {
            ExtensionMode::OneByte => {
                element[0] = (T::ID << 4) | ((value_size as u8) - 1);
            }
            ExtensionMode::TwoByte => {
                element[0] = T::ID;
                element[1] = value_size as u8;
            }
        }
        ext.write_to(&mut element[element_header_len..]);

        self.ensure_extension_section(insert_pos, element.len());
        self.buf[insert_pos..insert_pos + element.len()].copy_from_slice(&element);
        self.extensions.push(ExtensionEntry {
            id: T::ID,
            value_offset: insert_pos + element_header_len,
            value_len: value_size,
        });

        Ok(())
    }

    pub fn get_extension<T: HeaderExtension>(&self) -> Option<T> {
        self.extensions
            .iter()
            .find(|e| e.id == T::ID)
            .and_then(|e| T::read_from(&self.buf[e.value_offset..e.value_offset + e.value_len]))
    }

    fn next_extension_insert_pos(&self) -> usize {
        match self.extensions.last() {
            Some(last) => last.value_offset + last.value_len,
            None => self.extension_header_offset() + 4, // profile(2) + length(2)
        }
    }

    /// Grow the buffer so `len` bytes fit starting at `insert_pos`,
    /// updating the extension-block length header (in 32-bit words,
    /// rounded up) as it goes.
    fn ensure_extension_section(&mut self, insert_pos: usize, len: usize) {
        let needed_end = insert_pos + len;
        if needed_end > self.buf.len() {
            self.buf.resize(needed_end, 0);
        }
        let profile = if self.extension_mode == ExtensionMode::OneByte {
            ONE_BYTE_PROFILE
        } else {
            TWO_BYTE_PROFILE
        };
        let ext_hdr = self.extension_header_offset();
        self.buf[ext_hdr..ext_hdr + 2].copy_from_slice(&profile.to_be_bytes());

        let ext_bytes = needed_end - (ext_hdr + 4);
        let words = ext_bytes.div_ceil(4);
        let padded_end = ext_hdr + 4 + words * 4;
        if padded_end > self.buf.len() {
            self.buf.resize(padded_end, 0);
        }
        self.buf[ext_hdr + 2..ext_hdr + 4].copy_from_slice(&(words as u16).to_be_bytes());
    }

    fn promote_to_two_byte(&mut self) {
        if self.extension_mode == ExtensionMode::TwoByte {
            return;
        }
        // Rebuild every existing one-byte element as a two-byte element.
        let ext_hdr = self.extension_header_offset();
        let old_entries = self.extensions.clone();
        let mut rebuilt = Vec::new();
        for entry in &old_entries {
            let value = self.buf[entry.value_offset..entry.value_offset + entry.value_len].to_vec();
            rebuilt.push((entry.id, value));
        }
        self.extension_mode = ExtensionMode::TwoByte;
        self.buf.truncate(ext_hdr);
        self.extensions.clear();
        self.buf.resize(ext_hdr + 4, 0);
        self.buf[ext_hdr..ext_hdr + 2].copy_from_slice(&TWO_BYTE_PROFILE.to_be_bytes());
        self.buf[ext_hdr + 2..ext_hdr + 4].copy_from_slice(&0u16.to_be_bytes());

        for (id, value) in rebuilt {
            let insert_pos = self.next_extension_insert_pos();
            let mut element = vec![0u8; 2 + value.len()];
            element[0] = id;
            element[1] = value.len() as u8;
            element[2..].copy_from_slice(&value);
            self.ensure_extension_section(insert_pos, element.len());
            self.buf[insert_pos..insert_pos + element.len()].copy_from_slice(&element);
            self.extensions.push(ExtensionEntry {
                id,
                value_offset: insert_pos + 2,
                value_len: value.len(),
            });
        }
    }

    pub fn set_payload(&mut self, payload: &[u8]) {
        self.buf.truncate(self.payload_offset());
        self.buf.extend_from_slice(payload);
    }

    pub fn payload(&self) -> &[u8] {
        &self.buf[self.payload_offset()..]
    }

    fn payload_offset(&self) -> usize {
        if !self.has_extension_bit() {
            return self.extension_header_offset();
        }
        let ext_hdr = self.extension_header_offset();
        let words = u16::from_be_bytes([self.buf[ext_hdr + 2], self.buf[ext_hdr + 3]]) as usize;
        ext_hdr + 4 + words * 4
    }

    pub fn freeze(self) -> Bytes {
        self.buf.freeze()
    }

    pub fn len(&self) -> usize {
        self.buf.len()
    }

    pub fn is_empty(&self) -> bool {
        self.buf.is_empty()
    }

    /// Parse an immutable wire packet. Extensions are re-indexed so
    /// `get_extension` works, but the packet cannot be further mutated —
    /// construct a fresh [`RtpPacket`] for retransmission/re-encoding.
    pub fn parse(data: &[u8]) -> Result<ParsedRtpPacket, RtpError> {
        if data.len() < FIXED_HEADER_LEN {
            return Err(RtpError::TooShort(data.len()));
        }
        let version = data[0] >> 6;
        if version != RTP_VERSION {
            return Err(RtpError::InvalidVersion(version));
        }
        let has_extension = data[0] & 0b0001_0000 != 0;
        let csrc_count = data[0] & 0x0F;
        let marker = data[1] & 0x80 != 0;
        let payload_type = data[1] & 0x7F;
        let sequence_number = u16::from_be_bytes([data[2], data[3]]);
        let timestamp = u32::from_be_bytes([data[4], data[5], data[6], data[7]]);
        let ssrc = u32::from_be_bytes([data[8], data[9], data[10], data[11]]);

        let mut offset = FIXED_HEADER_LEN + csrc_count as usize * 4;
        if data.len() < offset {
            return Err(RtpError::TooShort(data.len()));
        }

        let mut extensions = Vec::new();
        if has_extension {
            if data.len() < offset + 4 {
                return Err(RtpError::TruncatedExtension);
            }
            let profile = u16::from_be_bytes([data[offset], data[offset + 1]]);
            let words = u16::from_be_bytes([data[offset + 2], data[offset + 3]]) as usize;
            let ext_start = offset + 4;
            let ext_end = ext_start + words * 4;
            if data.len() < ext_end {
                return Err(RtpError::TruncatedExtension);
            }
            let mode = if profile == ONE_BYTE_PROFILE {
                ExtensionMode::OneByte
            } else {
                ExtensionMode::TwoByte
            };
            let mut cursor = ext_start;
            while cursor < ext_end {
                match mode {
                    ExtensionMode::OneByte => {
                        let b = data[cursor];
                        if b == 0x00 {
                            cursor += 1; // padding byte
                            continue;
                        }
                        let id = b >> 4;
                        let len = (b & 0x0F) as usize + 1;
                        if id == 0x0F || cursor + 1 + len > ext_end {
                            break;
                        }
                        extensions.push(ExtensionEntry {
                            id,
                            value_offset: cursor + 1,
                            value_len: len,
                        });
                        cursor += 1 + len;
                    }
                    ExtensionMode::TwoByte => {
                        if cursor + 2 > ext_end {
                            break;
                        }
                        let id = data[cursor];
                        if id == 0x00 {
                            cursor += 1;
                            continue;
                        }
                        let len = data[cursor + 1] as usize;
                        if cursor + 2 + len > ext_end {
                            break;
                        }
                        extensions.push(ExtensionEntry {
                            id,
                            value_offset: cursor + 2,
                            value_len: len,
                        });
                        cursor += 2 + len;
                    }
                }
            }
            offset = ext_end;
        }

        Ok(ParsedRtpPacket {
            data: Bytes::copy_from_slice(data),
            marker,
            payload_type,
            sequence_number,
            timestamp,
            ssrc,
            extensions,
            payload_offset: offset,
        })
    }
}

/// A parsed, read-only view over a wire RTP packet.
pub struct ParsedRtpPacket {
    data: Bytes,
    marker: bool,
    payload_type: u8,
    sequence_number: u16,
    timestamp: u32,
    ssrc: u32,
    extensions: Vec<ExtensionEntry>,
    payload_offset: usize,
}

impl ParsedRtpPacket {
    pub fn marker(&self) -> bool {
        self.marker
    }
    pub fn payload_type(&self) -> u8 {
        self.payload_type
    }
    pub fn sequence_number(&self) -> u16 {
        self.sequence_number
    }
    pub fn timestamp(&self) -> u32 {
        self.timestamp
    }
    pub fn ssrc(&self) -> u32 {
        self.ssrc
    }
    pub fn payload(&self) -> &[u8] {
        &self.data[self.payload_offset..]
    }
    pub fn raw(&self) -> &Bytes {
        &self.data
    }
    pub fn get_extension<T: HeaderExtension>(&self) -> Option<T> {
        self.extensions
            .iter()
            .find(|e| e.id == T::ID)
            .and_then(|e| T::read_from(&self.data[e.value_offset..e.value_offset + e.value_len]))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::rtp::extensions::{LtFrameInfo, LtPacketInfo};

    #[test]
    fn builds_and_parses_packet_without_extensions() {
        let mut pkt = RtpPacket::new(96, 1000, 90000, 0xDEADBEEF, true);
        pkt.set_payload(&[1, 2, 3, 4]);
        let wire = pkt.freeze();
        let parsed = RtpPacket::parse(&wire).unwrap();
        assert_eq!(parsed.sequence_number(), 1000);
        assert_eq!(parsed.timestamp(), 90000);
        assert_eq!(parsed.ssrc(), 0xDEADBEEF);
        assert!(parsed.marker());
        assert_eq!(parsed.payload(), &[1, 2, 3, 4]);
    }

    #[test]
    fn one_byte_extension_roundtrip() {
        let mut pkt = RtpPacket::new(96, 1, 1, 1, false);
        let info = LtPacketInfo {
            first_packet_in_frame: true,
            keyframe: true,
            sequence_number: 1,
            ..Default::default()
        };
        pkt.set_extension(&info).unwrap();
        pkt.set_payload(b"payload");
        let wire = pkt.freeze();
        let parsed = RtpPacket::parse(&wire).unwrap();
        assert_eq!(parsed.get_extension::<LtPacketInfo>(), Some(info));
        assert_eq!(parsed.payload(), b"payload");
    }

    #[test]
    fn two_extensions_one_byte_profile() {
        let mut pkt = RtpPacket::new(96, 1, 1, 1, false);
        let pinfo = LtPacketInfo {
            first_packet_in_frame: true,
            sequence_number: 5,
            ..Default::default()
        };
        let finfo = LtFrameInfo {
            frame_id: 9,
            encode_duration: 1200,
        };
        pkt.set_extension(&pinfo).unwrap();
        pkt.set_extension(&finfo).unwrap();
        pkt.set_payload(b"x");
        let wire = pkt.freeze();
        let parsed = RtpPacket::parse(&wire).unwrap();
        assert_eq!(parsed.get_extension::<LtPacketInfo>(), Some(pinfo));
        assert_eq!(parsed.get_extension::<LtFrameInfo>(), Some(finfo));
    }

    #[test]
    fn promotes_to_two_byte_when_id_exceeds_one_byte_max() {
        struct BigIdExtension;
        #[derive(Clone, Copy, PartialEq, Eq, Debug, Default)]
        struct BigIdValue(u8);
        impl HeaderExtension for BigIdValue {
            const ID: u8 = 20; // > ONE_BYTE_MAX_ID
            const URI: &'static str = "test-big-id";
            fn value_size(&self) -> usize {
                1
            }
            fn write_to(&self, buf: &mut [u8]) {
                buf[0] = self.0;
            }
            fn read_from(buf: &[u8]) -> Option<Self> {
                Some(BigIdValue(buf[0]))
            }
        }
        let _ = BigIdExtension;

        let mut pkt = RtpPacket::new(96, 1, 1, 1, false);
        pkt.set_extension(&BigIdValue(42)).unwrap();
        assert_eq!(pkt.extension_mode, ExtensionMode::TwoByte);
        pkt.set_payload(b"z");
        let wire = pkt.freeze();
        let parsed = RtpPacket::parse(&wire).unwrap();
        assert_eq!(parsed.get_extension::<BigIdValue>(), Some(BigIdValue(42)));
    }

    #[test]
    fn promotion_preserves_earlier_extensions() {
        let mut pkt = RtpPacket::new(96, 1, 1, 1, false);
        let pinfo = LtPacketInfo {
            sequence_number: 77,
            ..Default::default()
        };
        pkt.set_extension(&pinfo).unwrap();

        struct BigValue;
        #[derive(Clone, Copy, PartialEq, Eq, Debug, Default)]
        struct Oversized([u8; 20]);
        impl HeaderExtension for Oversized {
            const ID: u8 = 10;
            const URI: &'static str = "test-oversized";
            fn value_size(&self) -> usize {
                20 // > ONE_BYTE_MAX_VALUE_SIZE
            }
            fn write_to(&self, buf: &mut [u8]) {
                buf.copy_from_slice(&self.0);
            }
            fn read_from(buf: &[u8]) -> Option<Self> {
                let mut arr = [0u8; 20];
                arr.copy_from_slice(buf);
                Some(Oversized(arr))
            }
        }
        let _ = BigValue;

        pkt.set_extension(&Oversized([7u8; 20])).unwrap();
        pkt.set_payload(b"tail");
        let wire = pkt.freeze();
        let parsed = RtpPacket::parse(&wire).unwrap();
        assert_eq!(parsed.get_extension::<LtPacketInfo>(), Some(pinfo));
        assert_eq!(parsed.get_extension::<Oversized>(), Some(Oversized([7u8; 20])));
        assert_eq!(parsed.payload(), b"tail");
    }

    #[test]
    fn rejects_wrong_rtp_version() {
        let mut buf = vec![0u8; 12];
        buf[0] = 0x00; // version 0
        assert!(matches!(
            RtpPacket::parse(&buf),
            Err(RtpError::InvalidVersion(0))
        ));
    }

    #[test]
    fn rejects_too_short_packet() {
        assert!(matches!(
            RtpPacket::parse(&[0u8; 4]),
            Err(RtpError::TooShort(4))
        ));
    }
}

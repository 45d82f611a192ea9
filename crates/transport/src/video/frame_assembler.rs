//! Reassembles RTP packets into complete video frames (§4.6), a close
//! translation of `rtc2::FrameAssembler`: a ring buffer that starts at
//! `start_size` and doubles (capped at `max_size`) when a slot collision
//! can't be resolved any other way, a missing-packet set pruned to a
//! 1000-packet window behind the newest inserted sequence number, and
//! frame-boundary detection that walks forward marking `continuous` slots
//! then scans backward (bounded by the buffer length) for the matching
//! `first_packet_in_frame` marker.
//!
//! The original orders its missing-packet set with a cyclic, "descending"
//! sequence-number comparator so erase/bound operations stay O(log n)
//! under wraparound. `BTreeSet<u16>` can't express that comparator, so
//! this keeps a plain ascending set and does the wraparound-aware
//! membership checks with [`ahead_of`] directly; the observable behavior
//! (what gets pruned, what blocks a non-keyframe from assembling) matches.

use std::collections::BTreeSet;

use bytes::Bytes;

use crate::rtp::extensions::{LtFrameInfo, LtPacketInfo};
use crate::rtp::packet::ParsedRtpPacket;

const MAX_MISSING_PACKET_AGE: u16 = 1000;

/// webrtc-style cyclic sequence-number comparison: `a` is "ahead of" `b`
/// if advancing from `b` to `a` the short way (mod 2^16) is forward.
fn ahead_of(a: u16, b: u16) -> bool {
    let diff = a.wrapping_sub(b);
    diff != 0 && diff < 0x8000
}

/// One RTP packet's video-relevant metadata, extracted once at insertion
/// time so the assembler never re-parses header extensions.
#[derive(Debug, Clone)]
pub struct VideoPacket {
    pub sequence_number: u16,
    pub timestamp: u32,
    pub payload: Bytes,
    pub continuous: bool,
    pub first_packet_in_frame: bool,
    pub last_packet_in_frame: bool,
    pub keyframe: bool,
    pub retransmit: bool,
    pub frame_id: Option<u16>,
    pub encode_duration: Option<u16>,
}

impl VideoPacket {
    /// Builds from a parsed RTP packet. Returns `None` if the mandatory
    /// `LtPacketInfo` extension is absent — such a packet can't be placed
    /// in a frame and the caller should drop it.
    pub fn from_rtp(parsed: &ParsedRtpPacket) -> Option<Self> {
        let packet_info: LtPacketInfo = parsed.get_extension()?;
        let frame_info: Option<LtFrameInfo> = parsed.get_extension();
        Some(Self {
            sequence_number: parsed.sequence_number(),
            timestamp: parsed.timestamp(),
            payload: Bytes::copy_from_slice(parsed.payload()),
            continuous: false,
            first_packet_in_frame: packet_info.first_packet_in_frame,
            last_packet_in_frame: packet_info.last_packet_in_frame,
            keyframe: packet_info.keyframe,
            retransmit: packet_info.retransmit,
            frame_id: frame_info.map(|f| f.frame_id),
            encode_duration: frame_info.map(|f| f.encode_duration),
        })
    }
}

#[derive(Debug, Default)]
pub struct InsertResult {
    /// Packets belonging to frame(s) that completed during this insert.
    pub packets: Vec<VideoPacket>,
    /// Set if a sequence-number collision forced the buffer to be wiped
    /// and the caller should request a keyframe.
    pub buffer_cleared: bool,
}

pub struct FrameAssembler {
    buffer: Vec<Option<VideoPacket>>,
    max_size: usize,
    first_packet_received: bool,
    first_seq_num: u16,
    is_cleared_to_first_seq_num: bool,
    missing_packets: BTreeSet<u16>,
    newest_inserted_seq_num: Option<u16>,
    assembled_frames: std::collections::VecDeque<Vec<VideoPacket>>,
}

impl FrameAssembler {
    pub fn new(start_size: usize, max_size: usize) -> Self {
        Self {
            buffer: (0..start_size).map(|_| None).collect(),
            max_size,
            first_packet_received: false,
            first_seq_num: 0,
            is_cleared_to_first_seq_num: false,
            missing_packets: BTreeSet::new(),
            newest_inserted_seq_num: None,
            assembled_frames: std::collections::VecDeque::new(),
        }
    }

    /// Pops the oldest fully-assembled frame queued by a prior `insert`.
    pub fn pop_assembled_frame(&mut self) -> Option<Vec<VideoPacket>> {
        self.assembled_frames.pop_front()
    }

    pub fn insert(&mut self, packet: VideoPacket) -> InsertResult {
        let mut result = InsertResult::default();
        let seq_num = packet.sequence_number;
        let mut index = seq_num as usize % self.buffer.len();

        if !self.first_packet_received {
            self.first_seq_num = seq_num;
            self.first_packet_received = true;
        } else if ahead_of(self.first_seq_num, seq_num) {
            if self.is_cleared_to_first_seq_num {
                return result;
            }
            self.first_seq_num = seq_num;
        }

        if let Some(existing) = &self.buffer[index] {
            if existing.sequence_number == seq_num {
                return result; // duplicate
            }
            while self.expand_buffer() {
                index = seq_num as usize % self.buffer.len();
                if self.buffer[index].is_none() {
                    break;
                }
            }
            index = seq_num as usize % self.buffer.len();
            if self.buffer[index].is_some() {
                self.clear_internal();
                result.buffer_cleared = true;
                return result;
            }
        }

        self.buffer[index] = Some(packet);
        self.update_missing_packets(seq_num);
        result.packets = self.find_frames(seq_num);
        result
    }

    fn expand_buffer(&mut self) -> bool {
        if self.buffer.len() == self.max_size {
            return false;
        }
        let new_size = self.max_size.min(2 * self.buffer.len());
        let mut new_buffer: Vec<Option<VideoPacket>> = (0..new_size).map(|_| None).collect();
        for entry in self.buffer.drain(..).flatten() {
            let idx = entry.sequence_number as usize % new_size;
            new_buffer[idx] = Some(entry);
        }
        self.buffer = new_buffer;
        true
    }

    /// Clears buffered packets only; `first_seq_num`/`first_packet_received`
    /// stay latched so a subsequent out-of-order older packet is still
    /// recognized as "already past".
    fn clear_internal(&mut self) {
        for slot in self.buffer.iter_mut() {
            *slot = None;
        }
    }

    fn update_missing_packets(&mut self, seq_num: u16) {
        if self.newest_inserted_seq_num.is_none() {
            self.newest_inserted_seq_num = Some(seq_num);
        }
        let newest = self.newest_inserted_seq_num.unwrap();

        if ahead_of(seq_num, newest) {
            let old_seq_num = seq_num.wrapping_sub(MAX_MISSING_PACKET_AGE);
            self.missing_packets.retain(|&s| !ahead_of(old_seq_num, s));

            let mut cursor = if ahead_of(old_seq_num, newest) {
                old_seq_num
            } else {
                newest
            };
            cursor = cursor.wrapping_add(1);
            while ahead_of(seq_num, cursor) {
                self.missing_packets.insert(cursor);
                cursor = cursor.wrapping_add(1);
            }
            self.newest_inserted_seq_num = Some(seq_num);
        } else {
            self.missing_packets.remove(&seq_num);
        }
    }

    fn find_frames(&mut self, mut seq_num: u16) -> Vec<VideoPacket> {
        let mut found_frames = Vec::new();
        for _ in 0..self.buffer.len() {
            if !self.potential_new_frame(seq_num) {
                break;
            }
            let index = seq_num as usize % self.buffer.len();
            self.buffer[index].as_mut().unwrap().continuous = true;

            if self.buffer[index].as_ref().unwrap().last_packet_in_frame {
                let mut start_seq_num = seq_num;
                let mut start_index = index;
                let mut tested_packets = 0usize;
                loop {
                    tested_packets += 1;
                    if self.buffer[start_index].as_ref().unwrap().first_packet_in_frame {
                        break;
                    }
                    if tested_packets == self.buffer.len() {
                        break;
                    }
                    start_index = if start_index > 0 { start_index - 1 } else { self.buffer.len() - 1 };
                    start_seq_num = start_seq_num.wrapping_sub(1);
                }

                let is_keyframe = self.buffer[index].as_ref().unwrap().keyframe;
                if !is_keyframe && self.has_missing_older_than(start_seq_num) {
                    return found_frames;
                }

                let end_seq_num = seq_num.wrapping_add(1);
                let mut frame = Vec::new();
                let mut j = start_seq_num;
                while j != end_seq_num {
                    if let Some(p) = self.buffer[j as usize % self.buffer.len()].clone() {
                        frame.push(p);
                    }
                    j = j.wrapping_add(1);
                }
                if !frame.is_empty() {
                    found_frames.extend(frame.iter().cloned());
                    self.assembled_frames.push_back(frame);
                }

                self.missing_packets.retain(|&s| ahead_of(s, seq_num));
            }
            seq_num = seq_num.wrapping_add(1);
        }
        found_frames
    }

    fn has_missing_older_than(&self, start_seq_num: u16) -> bool {
        self.missing_packets.iter().any(|&e| ahead_of(start_seq_num, e))
    }

    fn potential_new_frame(&self, seq_num: u16) -> bool {
        let index = seq_num as usize % self.buffer.len();
        let prev_index = if index > 0 { index - 1 } else { self.buffer.len() - 1 };

        let entry = match &self.buffer[index] {
            Some(e) => e,
            None => return false,
        };
        if entry.sequence_number != seq_num {
            return false;
        }
        if entry.first_packet_in_frame {
            return true;
        }
        let prev_entry = match &self.buffer[prev_index] {
            Some(e) => e,
            None => return false,
        };
        if prev_entry.sequence_number != entry.sequence_number.wrapping_sub(1) {
            return false;
        }
        if prev_entry.timestamp != entry.timestamp {
            return false;
        }
        prev_entry.continuous
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn packet(seq: u16, ts: u32, first: bool, last: bool, keyframe: bool) -> VideoPacket {
        VideoPacket {
            sequence_number: seq,
            timestamp: ts,
            payload: Bytes::from_static(b"x"),
            continuous: false,
            first_packet_in_frame: first,
            last_packet_in_frame: last,
            keyframe,
            retransmit: false,
            frame_id: None,
            encode_duration: None,
        }
    }

    #[test]
    fn assembles_single_packet_keyframe() {
        let mut fa = FrameAssembler::new(8, 16);
        let result = fa.insert(packet(1, 100, true, true, true));
        assert_eq!(result.packets.len(), 1);
        assert!(!result.buffer_cleared);
    }

    #[test]
    fn assembles_multi_packet_frame_in_order() {
        let mut fa = FrameAssembler::new(8, 16);
        let r1 = fa.insert(packet(1, 100, true, false, true));
        assert!(r1.packets.is_empty());
        let r2 = fa.insert(packet(2, 100, false, false, true));
        assert!(r2.packets.is_empty());
        let r3 = fa.insert(packet(3, 100, false, true, true));
        assert_eq!(r3.packets.len(), 3);
        assert_eq!(r3.packets[0].sequence_number, 1);
        assert_eq!(r3.packets[2].sequence_number, 3);
    }

    #[test]
    fn non_keyframe_waits_for_missing_earlier_packet() {
        let mut fa = FrameAssembler::new(8, 16);
        // seq 1 never arrives; seq 0 establishes newest_inserted baseline.
        fa.insert(packet(0, 90, true, true, true));
        fa.insert(packet(2, 100, false, false, false)); // creates a gap at seq 1
        let r = fa.insert(packet(3, 100, false, true, false));
        assert!(r.packets.is_empty(), "non-keyframe must not assemble past a missing packet");
    }

    #[test]
    fn duplicate_packet_is_ignored() {
        let mut fa = FrameAssembler::new(8, 16);
        fa.insert(packet(5, 100, true, true, true));
        let r = fa.insert(packet(5, 100, true, true, true));
        assert!(r.packets.is_empty());
        assert!(!r.buffer_cleared);
    }

    #[test]
    fn buffer_expands_on_collision_before_clearing() {
        let mut fa = FrameAssembler::new(2, 16);
        fa.insert(packet(0, 100, true, true, true));
        // seq 2 collides with seq 0 in a size-2 buffer; should expand rather
        // than clear.
        let r = fa.insert(packet(2, 200, true, true, true));
        assert!(!r.buffer_cleared);
        assert!(fa.buffer.len() > 2);
    }

    #[test]
    fn out_of_order_packets_still_assemble_frame() {
        let mut fa = FrameAssembler::new(8, 16);
        fa.insert(packet(2, 100, false, true, true));
        fa.insert(packet(1, 100, false, false, true));
        let r = fa.insert(packet(0, 100, true, false, true));
        assert_eq!(r.packets.len(), 3);
    }
}

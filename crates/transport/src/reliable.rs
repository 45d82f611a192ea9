//! Reliable control-message channel (§4.11): a sliding-window
//! selective-repeat ARQ carried inside DTLS application records, grounded
//! on `rtc2::MessageChannel`'s shape (the original delegates the ARQ
//! itself to KCP; this hand-rolls the equivalent window/ack machinery
//! since no KCP binding is in the teacher's or pack's dependency stack).
//!
//! Wire format per fragment: `[u8 kind][u16 seq]` then, for `Data`,
//! `[u8 more_fragments][u16 payload_len][payload]`; for `Ack`,
//! `[u16 cumulative_ack][u32 selective_bitmap]` (bit *i* acks
//! `cumulative_ack + 1 + i`). One `send_message` call is framed as one or
//! more fragments; the peer reassembles by sequence number and delivers
//! exactly one `on_message` per original `send_message`, as spec.md
//! requires.

use std::collections::{BTreeMap, VecDeque};
use std::time::{Duration, Instant};

use bytes::{Buf, BufMut, Bytes, BytesMut};

use crate::error::ReliableError;

const KIND_DATA: u8 = 0;
const KIND_ACK: u8 = 1;
const DATA_HEADER_LEN: usize = 1 + 2 + 1 + 2; // kind + seq + more_flag + len
const ACK_PACKET_LEN: usize = 1 + 2 + 4;

fn seq_ahead_of(a: u16, b: u16) -> bool {
    let diff = a.wrapping_sub(b);
    diff != 0 && diff < 0x8000
}

struct SentFragment {
    sent_at: Instant,
    wire: Bytes,
}

/// A sliding-window selective-repeat ARQ channel. Owns no DTLS state
/// itself — the caller feeds inbound DTLS application-data records in via
/// [`ReliableChannel::on_datagram`] and drains outbound ones via
/// [`ReliableChannel::take_outbound`], handing them to
/// `DtlsChannel::send_application_data`/`take_inbound_application_data`.
pub struct ReliableChannel {
    mtu: usize,
    window: u32,
    retransmit_timeout: Duration,

    send_next_seq: u16,
    send_base: u16,
    send_buffer: BTreeMap<u16, SentFragment>,

    recv_expected: u16,
    recv_buffer: BTreeMap<u16, (bool, Bytes)>,
    reassembly: BytesMut,
    recv_dirty: bool,

    pending_outbound: VecDeque<Bytes>,
    completed_messages: VecDeque<Bytes>,
}

impl ReliableChannel {
    pub fn new(mtu: usize, window: u32, retransmit_timeout: Duration) -> Self {
        Self {
            mtu,
            window,
            retransmit_timeout,
            send_next_seq: 0,
            send_base: 0,
            send_buffer: BTreeMap::new(),
            recv_expected: 0,
            recv_buffer: BTreeMap::new(),
            reassembly: BytesMut::new(),
            recv_dirty: false,
            pending_outbound: VecDeque::new(),
            completed_messages: VecDeque::new(),
        }
    }

    fn in_flight(&self) -> u32 {
        self.send_next_seq.wrapping_sub(self.send_base) as u32
    }

    /// Fragments `data` and queues it for transmission. Fails fast if the
    /// send window has no room rather than buffering unboundedly.
    pub fn send_message(&mut self, data: &[u8]) -> Result<(), ReliableError> {
        let fragment_payload_budget = self.mtu.saturating_sub(DATA_HEADER_LEN);
        if fragment_payload_budget == 0 {
            return Err(ReliableError::MessageTooLarge(data.len(), self.mtu));
        }
        let num_fragments = data.len().div_ceil(fragment_payload_budget).max(1);
        if self.in_flight() + num_fragments as u32 > self.window {
            return Err(ReliableError::WindowFull);
        }

        let mut offset = 0;
        let mut remaining = data.len();
        loop {
            let chunk_len = remaining.min(fragment_payload_budget);
            let chunk = &data[offset..offset + chunk_len];
            remaining -= chunk_len;
            let more = remaining > 0;

            let seq = self.send_next_seq;
            self.send_next_seq = self.send_next_seq.wrapping_add(1);

            let mut wire = BytesMut::with_capacity(DATA_HEADER_LEN + chunk_len);
            wire.put_u8(KIND_DATA);
            wire.put_u16(seq);
            wire.put_u8(more as u8);
            wire.put_u16(chunk_len as u16);
            wire.extend_from_slice(chunk);
            let wire = wire.freeze();

            self.send_buffer.insert(
                seq,
                SentFragment {
                    sent_at: Instant::now(),
                    wire: wire.clone(),
                },
            );
            self.pending_outbound.push_back(wire);

            offset += chunk_len;
            if !more {
                break;
            }
        }
        Ok(())
    }

    /// Drains fragments/acks queued for transmission since the last call.
    pub fn take_outbound(&mut self) -> Vec<Bytes> {
        self.pending_outbound.drain(..).collect()
    }

    /// Drains messages fully reassembled from inbound fragments.
    pub fn take_completed_messages(&mut self) -> Vec<Bytes> {
        self.completed_messages.drain(..).collect()
    }

    /// Feed one inbound DTLS application-data record.
    pub fn on_datagram(&mut self, wire: &[u8]) -> Result<(), ReliableError> {
        if wire.is_empty() {
            return Ok(());
        }
        match wire[0] {
            KIND_DATA => self.on_data_fragment(wire),
            KIND_ACK => self.on_ack(wire),
            _ => Ok(()),
        }
    }

    fn on_data_fragment(&mut self, wire: &[u8]) -> Result<(), ReliableError> {
        if wire.len() < DATA_HEADER_LEN {
            return Ok(());
        }
        let mut buf = &wire[1..];
        let seq = buf.get_u16();
        let more = buf.get_u8() != 0;
        let len = buf.get_u16() as usize;
        if buf.remaining() < len {
            return Ok(());
        }
        let payload = Bytes::copy_from_slice(&buf[..len]);

        if !seq_ahead_of(seq, self.recv_expected) && seq != self.recv_expected {
            // Already delivered (behind the window); ack again so the
            // sender's retransmit timer can retire it.
            self.recv_dirty = true;
            return Ok(());
        }

        self.recv_buffer.entry(seq).or_insert((more, payload));
        self.recv_dirty = true;

        while let Some((more, payload)) = self.recv_buffer.remove(&self.recv_expected) {
            self.reassembly.extend_from_slice(&payload);
            self.recv_expected = self.recv_expected.wrapping_add(1);
            if !more {
                let complete = self.reassembly.split().freeze();
                self.completed_messages.push_back(complete);
            }
        }
        Ok(())
    }

    fn on_ack(&mut self, wire: &[u8]) -> Result<(), ReliableError> {
        if wire.len() < ACK_PACKET_LEN {
            return Ok(());
        }
        let mut buf = &wire[1..];
        let cumulative_ack = buf.get_u16();
        let bitmap = buf.get_u32();

        self.send_buffer.retain(|&seq, _| seq_ahead_of(seq, cumulative_ack));
        if seq_ahead_of(cumulative_ack.wrapping_add(1), self.send_base) {
            self.send_base = cumulative_ack.wrapping_add(1);
        }
        for i in 0..32u16 {
            if bitmap & (1 << i) != 0 {
                let acked = cumulative_ack.wrapping_add(1 + i);
                self.send_buffer.remove(&acked);
            }
        }
        Ok(())
    }

    /// Periodic tick (10ms per §4.11): retransmits fragments older than
    /// the retransmit timeout and, if any data arrived since the last
    /// tick, emits a fresh cumulative+selective ack.
    pub fn on_periodic_tick(&mut self, now: Instant) {
        let timeout = self.retransmit_timeout;
        let stale: Vec<u16> = self
            .send_buffer
            .iter()
            .filter(|(_, f)| now.duration_since(f.sent_at) >= timeout)
            .map(|(&seq, _)| seq)
            .collect();
        for seq in stale {
            if let Some(fragment) = self.send_buffer.get_mut(&seq) {
                fragment.sent_at = now;
                self.pending_outbound.push_back(fragment.wire.clone());
            }
        }

        if self.recv_dirty {
            self.send_ack();
            self.recv_dirty = false;
        }
    }

    fn send_ack(&mut self) {
        let cumulative_ack = self.recv_expected.wrapping_sub(1);
        let mut bitmap = 0u32;
        for i in 0..32u16 {
            let seq = cumulative_ack.wrapping_add(1 + i);
            if self.recv_buffer.contains_key(&seq) {
                bitmap |= 1 << i;
            }
        }
        let mut wire = BytesMut::with_capacity(ACK_PACKET_LEN);
        wire.put_u8(KIND_ACK);
        wire.put_u16(cumulative_ack);
        wire.put_u32(bitmap);
        self.pending_outbound.push_back(wire.freeze());
    }
}

/// The half-reliable variant is declared separately in the data model but
/// unifies with the reliable channel here, per spec.md's explicit
/// "implementations MAY unify them".
pub type HalfReliableChannel = ReliableChannel;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn small_message_is_one_fragment_and_acks_drain_it() {
        let mut sender = ReliableChannel::new(1400, 128, Duration::from_millis(200));
        let mut receiver = ReliableChannel::new(1400, 128, Duration::from_millis(200));

        sender.send_message(b"hello").unwrap();
        let fragments = sender.take_outbound();
        assert_eq!(fragments.len(), 1);

        for f in &fragments {
            receiver.on_datagram(f).unwrap();
        }
        let messages = receiver.take_completed_messages();
        assert_eq!(messages.len(), 1);
        assert_eq!(&messages[0][..], b"hello");

        receiver.on_periodic_tick(Instant::now());
        let acks = receiver.take_outbound();
        assert_eq!(acks.len(), 1);
        for a in &acks {
            sender.on_datagram(a).unwrap();
        }
        assert!(sender.send_buffer.is_empty());
    }

    #[test]
    fn large_message_fragments_and_reassembles_in_order() {
        let mtu = 64;
        let mut sender = ReliableChannel::new(mtu, 128, Duration::from_millis(200));
        let mut receiver = ReliableChannel::new(mtu, 128, Duration::from_millis(200));

        let payload = vec![0xABu8; 500];
        sender.send_message(&payload).unwrap();
        let fragments = sender.take_outbound();
        assert!(fragments.len() > 1);

        for f in &fragments {
            receiver.on_datagram(f).unwrap();
        }
        let messages = receiver.take_completed_messages();
        assert_eq!(messages.len(), 1);
        assert_eq!(messages[0].len(), 500);
        assert_eq!(&messages[0][..], &payload[..]);
    }

    #[test]
    fn out_of_order_fragments_still_reassemble() {
        let mtu = 64;
        let mut sender = ReliableChannel::new(mtu, 128, Duration::from_millis(200));
        let mut receiver = ReliableChannel::new(mtu, 128, Duration::from_millis(200));

        sender.send_message(&vec![1u8; 300]).unwrap();
        let mut fragments = sender.take_outbound();
        fragments.reverse();

        for f in &fragments {
            receiver.on_datagram(f).unwrap();
        }
        let messages = receiver.take_completed_messages();
        assert_eq!(messages.len(), 1);
        assert_eq!(messages[0].len(), 300);
    }

    #[test]
    fn window_full_rejects_further_sends() {
        let mut sender = ReliableChannel::new(1400, 2, Duration::from_millis(200));
        sender.send_message(b"a").unwrap();
        sender.send_message(b"b").unwrap();
        let result = sender.send_message(b"c");
        assert!(matches!(result, Err(ReliableError::WindowFull)));
    }

    #[test]
    fn stale_unacked_fragment_is_retransmitted_on_tick() {
        let mut sender = ReliableChannel::new(1400, 128, Duration::from_millis(10));
        sender.send_message(b"retry-me").unwrap();
        sender.take_outbound(); // drain initial send

        std::thread::sleep(Duration::from_millis(15));
        sender.on_periodic_tick(Instant::now());
        let retransmits = sender.take_outbound();
        assert_eq!(retransmits.len(), 1);
    }
}

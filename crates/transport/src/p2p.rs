//! P2P connectivity check (§4.3): for every (local, remote) candidate pair
//! seen so far, send STUN Binding Requests on a 50ms retransmit timer until
//! one pair has both sent and received a Binding Request and a Binding
//! Response, at which point that pair is nominated and `on_connected`
//! fires. Only one pair is ever nominated per session.
//!
//! Non-STUN datagrams arriving before nomination are common during
//! gathering (the peer is still probing other pairs) and are dropped with
//! a `trace!`, not a `warn!`.

use std::collections::HashMap;
use std::time::{Duration, Instant};

use tracing::trace;

use crate::address::Address;
use crate::error::P2pError;
use crate::stun::{
    encode_binding_request, encode_binding_response, new_transaction_id, parse_message,
    MessageClass, TransactionId,
};

pub const RETRANSMIT_INTERVAL: Duration = Duration::from_millis(50);

#[derive(Debug, Default, Clone, Copy)]
struct PairState {
    received_request: bool,
    received_response: bool,
}

impl PairState {
    fn is_viable(&self) -> bool {
        self.received_request && self.received_response
    }
}

/// Owns one [`PairState`] per remote candidate address observed so far and
/// drives retransmission until a pair nominates.
pub struct CheckList {
    local: Address,
    session_password: Vec<u8>,
    pairs: HashMap<Address, PairState>,
    pending_transaction: TransactionId,
    last_send: Option<Instant>,
    nominated: Option<Address>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CheckOutcome {
    /// No state change; caller should keep polling.
    Pending,
    /// A datagram was consumed but produced no outbound reply.
    Consumed,
    /// `bytes` should be sent to `to` (a Binding Request or Response).
    Send { to: Address, bytes_len: usize },
    /// This pair is now nominated.
    Nominated(Address),
}

impl CheckList {
    pub fn new(local: Address, session_password: impl Into<Vec<u8>>) -> Self {
        Self {
            local,
            session_password: session_password.into(),
            pairs: HashMap::new(),
            pending_transaction: new_transaction_id(),
            last_send: None,
            nominated: None,
        }
    }

    pub fn local_address(&self) -> Address {
        self.local
    }

    pub fn is_nominated(&self) -> bool {
        self.nominated.is_some()
    }

    pub fn nominated_remote(&self) -> Option<Address> {
        self.nominated
    }

    pub fn add_remote_candidate(&mut self, remote: Address) {
        self.pairs.entry(remote).or_default();
    }

    /// Returns the set of Binding Requests that should be (re)sent because
    /// `RETRANSMIT_INTERVAL` has elapsed since the last send, one per known
    /// remote candidate that hasn't nominated yet.
    pub fn requests_due(&mut self, now: Instant) -> Vec<(Address, bytes::BytesMut)> {
        if self.nominated.is_some() {
            return Vec::new();
        }
        let due = match self.last_send {
            None => true,
            Some(t) => now.duration_since(t) >= RETRANSMIT_INTERVAL,
        };
        if !due {
            return Vec::new();
        }
        self.last_send = Some(now);
        self.pairs
            .keys()
            .map(|remote| {
                (
                    *remote,
                    encode_binding_request(&self.pending_transaction, &self.session_password),
                )
            })
            .collect()
    }

    /// Feed one inbound datagram from `from`. Returns the reply to send (if
    /// any) and whether this pair is now nominated.
    pub fn on_datagram(
        &mut self,
        buf: &[u8],
        from: Address,
    ) -> Result<(Option<bytes::BytesMut>, bool), P2pError> {
        if !crate::stun::looks_like_stun(buf) {
            trace!(%from, "dropping non-STUN datagram during connectivity check");
            return Ok((None, false));
        }
        let parsed = parse_message(buf, &self.session_password)?;
        let pair = self.pairs.entry(from).or_default();

        let reply = match parsed.class {
            MessageClass::BindingRequest => {
                pair.received_request = true;
                Some(encode_binding_response(
                    &parsed.transaction_id,
                    from,
                    &self.session_password,
                ))
            }
            MessageClass::BindingResponse => {
                pair.received_response = true;
                None
            }
        };

        let just_nominated = if self.nominated.is_none() && pair.is_viable() {
            self.nominated = Some(from);
            true
        } else {
            false
        };

        Ok((reply, just_nominated))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn nominates_after_request_and_response_both_seen() {
        let local: Address = "10.0.0.1:1000".parse().unwrap();
        let remote: Address = "10.0.0.2:2000".parse().unwrap();
        let mut checklist = CheckList::new(local, b"pw".to_vec());
        checklist.add_remote_candidate(remote);

        let req = encode_binding_request(&new_transaction_id(), b"pw");
        let (reply, nominated) = checklist.on_datagram(&req, remote).unwrap();
        assert!(reply.is_some());
        assert!(!nominated);
        assert!(!checklist.is_nominated());

        let resp_txid = new_transaction_id();
        let resp = encode_binding_response(&resp_txid, remote, b"pw");
        let (reply, nominated) = checklist.on_datagram(&resp, remote).unwrap();
        assert!(reply.is_none());
        assert!(nominated);
        assert!(checklist.is_nominated());
        assert_eq!(checklist.nominated_remote(), Some(remote));
    }

    #[test]
    fn only_one_pair_ever_nominates() {
        let local: Address = "10.0.0.1:1000".parse().unwrap();
        let remote_a: Address = "10.0.0.2:2000".parse().unwrap();
        let remote_b: Address = "10.0.0.3:3000".parse().unwrap();
        let mut checklist = CheckList::new(local, b"pw".to_vec());
        checklist.add_remote_candidate(remote_a);
        checklist.add_remote_candidate(remote_b);

        let req = encode_binding_request(&new_transaction_id(), b"pw");
        checklist.on_datagram(&req, remote_a).unwrap();
        let resp = encode_binding_response(&new_transaction_id(), remote_a, b"pw");
        let (_, nominated) = checklist.on_datagram(&resp, remote_a).unwrap();
        assert!(nominated);

        // remote_b completing its own pair afterwards must not renominate.
        let req_b = encode_binding_request(&new_transaction_id(), b"pw");
        checklist.on_datagram(&req_b, remote_b).unwrap();
        let resp_b = encode_binding_response(&new_transaction_id(), remote_b, b"pw");
        let (_, nominated_b) = checklist.on_datagram(&resp_b, remote_b).unwrap();
        assert!(!nominated_b);
        assert_eq!(checklist.nominated_remote(), Some(remote_a));
    }

    #[test]
    fn non_stun_datagram_is_dropped_quietly() {
        let local: Address = "10.0.0.1:1000".parse().unwrap();
        let remote: Address = "10.0.0.2:2000".parse().unwrap();
        let mut checklist = CheckList::new(local, b"pw".to_vec());
        checklist.add_remote_candidate(remote);
        let (reply, nominated) = checklist.on_datagram(b"not stun at all", remote).unwrap();
        assert!(reply.is_none());
        assert!(!nominated);
    }

    #[test]
    fn requests_due_respects_retransmit_interval() {
        let local: Address = "10.0.0.1:1000".parse().unwrap();
        let remote: Address = "10.0.0.2:2000".parse().unwrap();
        let mut checklist = CheckList::new(local, b"pw".to_vec());
        checklist.add_remote_candidate(remote);

        let t0 = Instant::now();
        let first = checklist.requests_due(t0);
        assert_eq!(first.len(), 1);

        let too_soon = checklist.requests_due(t0 + Duration::from_millis(10));
        assert!(too_soon.is_empty());

        let later = checklist.requests_due(t0 + RETRANSMIT_INTERVAL);
        assert_eq!(later.len(), 1);
    }
}

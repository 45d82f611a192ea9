use std::fmt;
use std::net::SocketAddr;
use std::str::FromStr;

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// The kind of candidate an [`EndpointInfo`] carries, per §3 of the core spec.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum CandidateKind {
    Host,
    ServerReflexive,
    Relay,
    PeerReflexive,
    Unknown,
}

impl fmt::Display for CandidateKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            CandidateKind::Host => "Host",
            CandidateKind::ServerReflexive => "ServerReflexive",
            CandidateKind::Relay => "Relay",
            CandidateKind::PeerReflexive => "PeerReflexive",
            CandidateKind::Unknown => "Unknown",
        };
        f.write_str(s)
    }
}

impl FromStr for CandidateKind {
    type Err = SignalingError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Ok(match s {
            "Host" => CandidateKind::Host,
            "ServerReflexive" => CandidateKind::ServerReflexive,
            "Relay" => CandidateKind::Relay,
            "PeerReflexive" => CandidateKind::PeerReflexive,
            // Per spec.md: unrecognized tags are accepted as Unknown rather than
            // rejected, so that a newer peer doesn't break an older one.
            _ => CandidateKind::Unknown,
        })
    }
}

/// A candidate endpoint exchanged between peers during gathering.
///
/// Wire format is exactly `"type <tag> addr <host:port>"`, matching the
/// original `rtc2` endpoint-info serialization.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct EndpointInfo {
    pub kind: CandidateKind,
    pub address: SocketAddr,
}

#[derive(Debug, Error)]
pub enum SignalingError {
    #[error("malformed endpoint info: {0:?}")]
    MalformedEndpointInfo(String),
    #[error("unknown signaling key: {0}")]
    UnknownKey(String),
}

impl EndpointInfo {
    pub fn new(kind: CandidateKind, address: SocketAddr) -> Self {
        Self { kind, address }
    }

    /// Serialize to the `type <tag> addr <host:port>` wire form.
    pub fn to_wire(&self) -> String {
        format!("type {} addr {}", self.kind, self.address)
    }

    /// Parse the `type <tag> addr <host:port>` wire form.
    pub fn from_wire(value: &str) -> Result<Self, SignalingError> {
        let mut parts = value.split_whitespace();
        let type_lit = parts.next();
        let kind_str = parts.next();
        let addr_lit = parts.next();
        let addr_str = parts.next();
        let (type_lit, kind_str, addr_lit, addr_str) =
            match (type_lit, kind_str, addr_lit, addr_str) {
                (Some(a), Some(b), Some(c), Some(d)) => (a, b, c, d),
                _ => return Err(SignalingError::MalformedEndpointInfo(value.to_string())),
            };
        if type_lit != "type" || addr_lit != "addr" {
            return Err(SignalingError::MalformedEndpointInfo(value.to_string()));
        }
        let kind = kind_str.parse::<CandidateKind>()?;
        let address = addr_str
            .parse::<SocketAddr>()
            .map_err(|_| SignalingError::MalformedEndpointInfo(value.to_string()))?;
        Ok(EndpointInfo { kind, address })
    }
}

impl fmt::Display for EndpointInfo {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.to_wire())
    }
}

/// A single opaque key/value record on the signaling pipe (§6). The core
/// never opens a signaling transport itself; this is purely the vocabulary
/// the rendezvous layer is expected to carry verbatim.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SignalingMessage {
    pub key: String,
    pub value: String,
}

impl SignalingMessage {
    pub const KEY_EPINFO: &'static str = "epinfo";
    pub const KEY_CONNECT: &'static str = "connect";
    pub const KEY_ADDRESS: &'static str = "address";

    pub fn epinfo(info: &EndpointInfo) -> Self {
        Self {
            key: Self::KEY_EPINFO.to_string(),
            value: info.to_wire(),
        }
    }

    /// Client → server, TCP fallback only. Value is always empty.
    pub fn connect() -> Self {
        Self {
            key: Self::KEY_CONNECT.to_string(),
            value: String::new(),
        }
    }

    /// Server → client, TCP fallback only.
    pub fn address(addr: SocketAddr) -> Self {
        Self {
            key: Self::KEY_ADDRESS.to_string(),
            value: addr.to_string(),
        }
    }

    pub fn parse_epinfo(&self) -> Result<EndpointInfo, SignalingError> {
        if self.key != Self::KEY_EPINFO {
            return Err(SignalingError::UnknownKey(self.key.clone()));
        }
        EndpointInfo::from_wire(&self.value)
    }
}

/// Frame types carried over the TCP fallback path (§4.7), each
/// length-prefixed as `[4-byte little-endian type][protobuf payload]`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u32)]
pub enum TcpFrameType {
    Video = 1,
    Audio = 2,
    Control = 3,
    Reliable = 4,
}

impl TcpFrameType {
    pub fn from_u32(v: u32) -> Option<Self> {
        match v {
            1 => Some(TcpFrameType::Video),
            2 => Some(TcpFrameType::Audio),
            3 => Some(TcpFrameType::Control),
            4 => Some(TcpFrameType::Reliable),
            _ => None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn endpoint_info_roundtrip_host() {
        let info = EndpointInfo::new(CandidateKind::Host, "192.168.1.5:50000".parse().unwrap());
        let wire = info.to_wire();
        assert_eq!(wire, "type Host addr 192.168.1.5:50000");
        let parsed = EndpointInfo::from_wire(&wire).unwrap();
        assert_eq!(parsed, info);
    }

    #[test]
    fn endpoint_info_roundtrip_server_reflexive_v6() {
        let info = EndpointInfo::new(
            CandidateKind::ServerReflexive,
            "[2001:db8::1]:4242".parse().unwrap(),
        );
        let wire = info.to_wire();
        let parsed = EndpointInfo::from_wire(&wire).unwrap();
        assert_eq!(parsed, info);
    }

    #[test]
    fn endpoint_info_unknown_tag_maps_to_unknown() {
        let parsed = EndpointInfo::from_wire("type Bogus addr 10.0.0.1:1").unwrap();
        assert_eq!(parsed.kind, CandidateKind::Unknown);
    }

    #[test]
    fn endpoint_info_malformed_rejected() {
        assert!(EndpointInfo::from_wire("type Host 10.0.0.1:1").is_err());
        assert!(EndpointInfo::from_wire("bogus").is_err());
        assert!(EndpointInfo::from_wire("type Host addr not-an-address").is_err());
    }

    #[test]
    fn signaling_message_epinfo_key() {
        let info = EndpointInfo::new(CandidateKind::Relay, "203.0.113.9:3478".parse().unwrap());
        let msg = SignalingMessage::epinfo(&info);
        assert_eq!(msg.key, "epinfo");
        let parsed = msg.parse_epinfo().unwrap();
        assert_eq!(parsed, info);
    }

    #[test]
    fn signaling_message_connect_is_empty() {
        let msg = SignalingMessage::connect();
        assert_eq!(msg.key, "connect");
        assert!(msg.value.is_empty());
    }

    #[test]
    fn signaling_message_address_roundtrips() {
        let addr: SocketAddr = "127.0.0.1:9000".parse().unwrap();
        let msg = SignalingMessage::address(addr);
        assert_eq!(msg.key, "address");
        assert_eq!(msg.value.parse::<SocketAddr>().unwrap(), addr);
    }

    #[test]
    fn signaling_message_serde_roundtrip() {
        let msg = SignalingMessage::connect();
        let json = serde_json::to_string(&msg).unwrap();
        let parsed: SignalingMessage = serde_json::from_str(&json).unwrap();
        assert_eq!(parsed, msg);
    }

    #[test]
    fn parse_epinfo_rejects_wrong_key() {
        let msg = SignalingMessage::connect();
        assert!(msg.parse_epinfo().is_err());
    }

    #[test]
    fn tcp_frame_type_from_u32() {
        assert_eq!(TcpFrameType::from_u32(1), Some(TcpFrameType::Video));
        assert_eq!(TcpFrameType::from_u32(4), Some(TcpFrameType::Reliable));
        assert_eq!(TcpFrameType::from_u32(99), None);
    }
}

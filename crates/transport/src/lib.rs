//! Peer-to-peer real-time media transport core.
//!
//! Discovers NAT-traversed endpoints, establishes a mutually authenticated
//! DTLS session, multiplexes video/audio/control over one UDP flow, and
//! falls back to a framed TCP connection when UDP connectivity can't be
//! established. See `SPEC_FULL.md` at the workspace root for the full
//! component breakdown.

pub mod address;
pub mod audio;
pub mod connection;
pub mod demux;
pub mod dtls;
pub mod error;
pub mod gatherer;
pub mod keycert;
pub mod p2p;
pub mod pacer;
pub mod reliable;
pub mod rtp;
pub mod stun;
pub mod tcp_fallback;
pub mod video;

pub use address::Address;
pub use connection::{Connection, ConnectionCallbacks, DecodedVideoFrame, Role};
pub use error::{ConnectionError, ErrorKind};

//! Crate-wide error kinds (§7) plus per-component `thiserror` enums that
//! fold into them at the `Connection` boundary.

use thiserror::Error;

/// The coarse-grained failure categories a `Connection` reports to its
/// caller via `on_disconnected`/`on_error`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
    /// The supplied `BeamTransportConfig` failed validation.
    ConfigurationInvalid,
    /// Candidate gathering could not produce any usable endpoint.
    GatheringFailed,
    /// No candidate pair could be nominated within the connectivity budget.
    ConnectivityFailed,
    /// The DTLS handshake failed or the peer certificate didn't match the
    /// pinned digest.
    HandshakeFailed,
    /// The peer closed the connection cleanly.
    PeerClosed,
    /// A transient I/O error occurred; the connection may still recover.
    Transient,
    /// A peer sent data that violates the wire protocol.
    ProtocolViolation,
}

impl std::fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            ErrorKind::ConfigurationInvalid => "configuration invalid",
            ErrorKind::GatheringFailed => "gathering failed",
            ErrorKind::ConnectivityFailed => "connectivity failed",
            ErrorKind::HandshakeFailed => "handshake failed",
            ErrorKind::PeerClosed => "peer closed",
            ErrorKind::Transient => "transient I/O error",
            ErrorKind::ProtocolViolation => "protocol violation",
        };
        f.write_str(s)
    }
}

#[derive(Debug, Error)]
#[error("{kind}: {message}")]
pub struct ConnectionError {
    pub kind: ErrorKind,
    pub message: String,
}

impl ConnectionError {
    pub fn new(kind: ErrorKind, message: impl Into<String>) -> Self {
        Self {
            kind,
            message: message.into(),
        }
    }
}

#[derive(Debug, Error)]
pub enum StunError {
    #[error("packet too short to be a STUN message: {0} bytes")]
    TooShort(usize),
    #[error("bad STUN magic cookie")]
    BadMagicCookie,
    #[error("message-integrity attribute missing")]
    MissingIntegrity,
    #[error("message-integrity verification failed")]
    IntegrityMismatch,
    #[error("unexpected STUN message class/method: {0:#06x}")]
    UnexpectedType(u16),
    #[error("truncated attribute at offset {0}")]
    TruncatedAttribute(usize),
    #[error("xor-mapped-address attribute missing")]
    MissingMappedAddress,
}

#[derive(Debug, Error)]
pub enum GatherError {
    #[error("no bind address configured")]
    NoBindAddress,
    #[error("stun request timed out after {0} attempts")]
    StunTimeout(u32),
    #[error(transparent)]
    Stun(#[from] StunError),
    #[error(transparent)]
    Io(#[from] std::io::Error),
}

#[derive(Debug, Error)]
pub enum P2pError {
    #[error("no candidate pair nominated within budget")]
    NominationTimedOut,
    #[error(transparent)]
    Stun(#[from] StunError),
}

#[derive(Debug, Error)]
pub enum DtlsError {
    #[error("handshake failed: {0}")]
    HandshakeFailed(String),
    #[error("peer certificate digest mismatch")]
    PinnedDigestMismatch,
    #[error("channel is not yet connected")]
    NotConnected,
    #[error(transparent)]
    Io(#[from] std::io::Error),
}

#[derive(Debug, Error)]
pub enum KeyAndCertError {
    #[error("RSA key generation failed: {0}")]
    KeyGeneration(String),
    #[error("certificate generation failed: {0}")]
    CertGeneration(String),
}

#[derive(Debug, Error)]
pub enum RtpError {
    #[error("packet too short: {0} bytes")]
    TooShort(usize),
    #[error("unsupported RTP version: {0}")]
    InvalidVersion(u8),
    #[error("extension profile declared but extension section truncated")]
    TruncatedExtension,
    #[error("extension id {0} out of range for the active profile")]
    InvalidExtensionId(u8),
    #[error("extension value {0} bytes too large for the active profile")]
    ExtensionValueTooLarge(usize),
    #[error("padding length {0} exceeds packet length")]
    InvalidPadding(usize),
}

#[derive(Debug, Error)]
pub enum ReliableError {
    #[error("message of {0} bytes exceeds the channel MTU budget of {1} bytes")]
    MessageTooLarge(usize, usize),
    #[error("send window full")]
    WindowFull,
    #[error("received sequence number {0} outside receive window")]
    OutOfWindow(u32),
    #[error(transparent)]
    Dtls(#[from] DtlsError),
}

#[derive(Debug, Error)]
pub enum TcpFallbackError {
    #[error(transparent)]
    Frame(#[from] beam_protocol::frame::FrameError),
    #[error(transparent)]
    Io(#[from] std::io::Error),
}

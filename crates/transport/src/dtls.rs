//! DTLS 1.2 channel (§4.4): mutual authentication via a pinned certificate
//! digest, driven by the sans-IO `dimpl` engine. RTP/RTCP never pass
//! through this channel — only the reliable control stream's application
//! data does (§4.6/§4.8); DTLS-SRTP keying material is therefore never
//! extracted, unlike a typical WebRTC `dimpl` integration.
//!
//! Re-arms its own 50ms-class timer via `handle_timeout`, matching the
//! "WANT_READ/WANT_WRITE" sans-IO shape described in §4.4.

use std::time::Instant;

use dimpl::{Config, Dtls, DtlsCertificate, Output};
use tracing::{debug, warn};

use crate::error::DtlsError;
use crate::keycert::{digest_of, KeyAndCert};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChannelState {
    Handshaking,
    Connected,
    Failed,
}

pub struct DtlsChannel {
    dtls: Dtls,
    state: ChannelState,
    pinned_digest: [u8; 32],
    outbound: Vec<Vec<u8>>,
    inbound_application_data: Vec<Vec<u8>>,
}

impl DtlsChannel {
    /// `is_client` selects active (client, sends ClientHello first) vs.
    /// passive (server) role, matching `dimpl::Dtls::set_active`.
    pub fn new(
        key_and_cert: &KeyAndCert,
        pinned_digest: [u8; 32],
        is_client: bool,
    ) -> Result<Self, DtlsError> {
        let cert = DtlsCertificate {
            certificate: key_and_cert.cert_der.clone(),
            private_key: key_and_cert.key_der.clone(),
        };
        let config = std::sync::Arc::new(Config::default());
        let mut dtls = Dtls::new(config, cert);
        dtls.set_active(is_client);

        let mut channel = Self {
            dtls,
            state: ChannelState::Handshaking,
            pinned_digest,
            outbound: Vec::new(),
            inbound_application_data: Vec::new(),
        };

        // dimpl requires an initial handle_timeout before it will emit the
        // first flight (ClientHello for the active side).
        channel
            .dtls
            .handle_timeout(Instant::now())
            .map_err(|e| DtlsError::HandshakeFailed(format!("{e:?}")))?;
        channel.drain_output()?;

        Ok(channel)
    }

    pub fn state(&self) -> ChannelState {
        self.state
    }

    pub fn is_connected(&self) -> bool {
        self.state == ChannelState::Connected
    }

    /// Feed one inbound DTLS record.
    pub fn handle_packet(&mut self, packet: &[u8]) -> Result<(), DtlsError> {
        if self.state == ChannelState::Failed {
            return Ok(());
        }
        self.dtls
            .handle_packet(packet)
            .map_err(|e| DtlsError::HandshakeFailed(format!("{e:?}")))?;
        self.drain_output()
    }

    /// Drive retransmission timers; call this periodically (the network
    /// thread's reactor tick).
    pub fn handle_timeout(&mut self, now: Instant) -> Result<(), DtlsError> {
        if self.state == ChannelState::Failed {
            return Ok(());
        }
        self.dtls
            .handle_timeout(now)
            .map_err(|e| DtlsError::HandshakeFailed(format!("{e:?}")))?;
        self.drain_output()
    }

    /// Send one message over the reliable control stream's DTLS session.
    pub fn send_application_data(&mut self, data: &[u8]) -> Result<(), DtlsError> {
        if !self.is_connected() {
            return Err(DtlsError::NotConnected);
        }
        self.dtls
            .send_application_data(data)
            .map_err(|e| DtlsError::HandshakeFailed(format!("{e:?}")))?;
        self.drain_output()
    }

    /// Drain datagrams dimpl wants transmitted to the peer.
    pub fn take_outbound(&mut self) -> Vec<Vec<u8>> {
        std::mem::take(&mut self.outbound)
    }

    /// Drain application-data records received from the peer.
    pub fn take_inbound_application_data(&mut self) -> Vec<Vec<u8>> {
        std::mem::take(&mut self.inbound_application_data)
    }

    fn drain_output(&mut self) -> Result<(), DtlsError> {
        let mut out_buf = vec![0u8; 2048];
        loop {
            match self.dtls.poll_output(&mut out_buf) {
                Output::Packet(packet) => self.outbound.push(packet.to_vec()),
                Output::Timeout(_) => break,
                Output::Connected => {
                    // The pinned-digest check already ran on PeerCert; if it
                    // failed we've moved to Failed and must never surface
                    // Connected to the caller.
                    if self.state != ChannelState::Failed {
                        self.state = ChannelState::Connected;
                        debug!("dtls handshake complete");
                    }
                }
                Output::PeerCert(der) => {
                    let actual = digest_of(&der);
                    if actual != self.pinned_digest {
                        warn!("dtls peer certificate digest mismatch");
                        self.state = ChannelState::Failed;
                    }
                }
                Output::KeyingMaterial(_, _) => {
                    // Unused: RTP/RTCP never ride inside this DTLS session.
                }
                Output::ApplicationData(data) => {
                    self.inbound_application_data.push(data.to_vec());
                }
            }
        }
        if self.state == ChannelState::Failed {
            return Err(DtlsError::PinnedDigestMismatch);
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::keycert::KeyAndCert;

    #[test]
    fn handshake_between_client_and_server_drives_to_connected() {
        let client_cert = KeyAndCert::generate().unwrap();
        let server_cert = KeyAndCert::generate().unwrap();

        let mut client =
            DtlsChannel::new(&client_cert, server_cert.digest, true).unwrap();
        let mut server =
            DtlsChannel::new(&server_cert, client_cert.digest, false).unwrap();

        let mut now = Instant::now();
        for _ in 0..20 {
            for packet in client.take_outbound() {
                server.handle_packet(&packet).ok();
            }
            for packet in server.take_outbound() {
                client.handle_packet(&packet).ok();
            }
            now += std::time::Duration::from_millis(50);
            client.handle_timeout(now).ok();
            server.handle_timeout(now).ok();
            if client.is_connected() && server.is_connected() {
                break;
            }
        }

        assert!(client.is_connected());
        assert!(server.is_connected());
    }

    #[test]
    fn digest_mismatch_never_surfaces_connected() {
        let client_cert = KeyAndCert::generate().unwrap();
        let server_cert = KeyAndCert::generate().unwrap();
        let wrong_digest = [0xAAu8; 32];

        let mut client = DtlsChannel::new(&client_cert, wrong_digest, true).unwrap();
        let mut server =
            DtlsChannel::new(&server_cert, client_cert.digest, false).unwrap();

        let mut now = Instant::now();
        for _ in 0..20 {
            for packet in client.take_outbound() {
                server.handle_packet(&packet).ok();
            }
            for packet in server.take_outbound() {
                let _ = client.handle_packet(&packet);
            }
            now += std::time::Duration::from_millis(50);
            let _ = client.handle_timeout(now);
            server.handle_timeout(now).ok();
            if client.state() == ChannelState::Failed {
                break;
            }
        }

        assert_eq!(client.state(), ChannelState::Failed);
        assert_ne!(client.state(), ChannelState::Connected);
    }
}

//! Endpoint gatherer (§4.2): discovers local, server-reflexive, and relayed
//! candidates and hands each one to the signaling callback as it's found.
//!
//! Host candidates are emitted from the bind address the `Connection` was
//! configured with rather than walked from OS network interfaces — neither
//! the teacher nor the retrieval pack carries an interface-enumeration
//! crate, and the caller already owns interface selection as an external
//! concern (it resolved the bind address before constructing the
//! `Connection`). See `DESIGN.md` for this Open Question resolution.

use std::time::Duration;

use beam_protocol::{CandidateKind, EndpointInfo};
use tokio::net::UdpSocket;
use tracing::{debug, warn};

use crate::address::Address;
use crate::error::GatherError;
use crate::stun::{encode_binding_request, new_transaction_id, parse_message};

const STUN_RETRIES: u32 = 3;
const STUN_TIMEOUT: Duration = Duration::from_millis(500);

/// Runs the three gathering passes against one already-bound UDP socket,
/// calling `on_candidate` as each candidate is discovered. Returns once all
/// passes have completed (relay and STUN passes are best-effort: failures
/// are logged and simply don't emit a candidate).
pub async fn gather(
    socket: &UdpSocket,
    stun_server: Option<Address>,
    relay: Option<(Address, Option<String>, Option<String>)>,
    session_password: &[u8],
    mut on_candidate: impl FnMut(EndpointInfo),
) -> Result<(), GatherError> {
    let bind_addr = Address::from_socket_addr(socket.local_addr()?);

    // Pass 1: host candidate, straight from the already-bound socket.
    let host = EndpointInfo::new(CandidateKind::Host, bind_addr.socket_addr());
    debug!(%bind_addr, "gathered host candidate");
    on_candidate(host);

    // Pass 2: server-reflexive, via one STUN Binding Request/Response.
    if let Some(stun_server) = stun_server {
        match gather_server_reflexive(socket, stun_server, session_password).await {
            Ok(info) => {
                debug!(addr = %info.address, "gathered server-reflexive candidate");
                on_candidate(info);
            }
            Err(e) => warn!(error = %e, "server-reflexive gathering failed"),
        }
    }

    // Pass 3: relay stub — one Relay candidate naming the configured relay
    // address, no TURN allocation lifecycle (Non-goal).
    if let Some((relay_addr, _username, _credential)) = relay {
        let info = EndpointInfo::new(CandidateKind::Relay, relay_addr.socket_addr());
        debug!(addr = %relay_addr, "emitted relay candidate");
        on_candidate(info);
    }

    Ok(())
}

async fn gather_server_reflexive(
    socket: &UdpSocket,
    stun_server: Address,
    session_password: &[u8],
) -> Result<EndpointInfo, GatherError> {
    let txid = new_transaction_id();
    let request = encode_binding_request(&txid, session_password);

    let mut buf = [0u8; 1500];
    for attempt in 0..STUN_RETRIES {
        socket.send_to(&request, stun_server.socket_addr()).await?;
        match tokio::time::timeout(STUN_TIMEOUT, socket.recv_from(&mut buf)).await {
            Ok(Ok((n, from))) if from == stun_server.socket_addr() => {
                let parsed = parse_message(&buf[..n], session_password)?;
                if let Some(mapped) = parsed.mapped_address {
                    return Ok(EndpointInfo::new(
                        CandidateKind::ServerReflexive,
                        mapped.socket_addr(),
                    ));
                }
            }
            Ok(Ok(_)) => continue, // datagram from someone else, ignore and retry
            Ok(Err(e)) => return Err(e.into()),
            Err(_) => {
                debug!(attempt, "stun request timed out, retrying");
                continue;
            }
        }
    }
    Err(GatherError::StunTimeout(STUN_RETRIES))
}

#[cfg(test)]
mod tests {
    use super::*;
    use beam_protocol::CandidateKind;

    #[tokio::test]
    async fn gathers_host_candidate_without_stun() {
        let socket = UdpSocket::bind("127.0.0.1:0").await.unwrap();
        let mut candidates = Vec::new();
        gather(&socket, None, None, b"pw", |c| candidates.push(c))
            .await
            .unwrap();
        assert_eq!(candidates.len(), 1);
        assert_eq!(candidates[0].kind, CandidateKind::Host);
    }

    #[tokio::test]
    async fn gathers_relay_candidate_when_configured() {
        let socket = UdpSocket::bind("127.0.0.1:0").await.unwrap();
        let relay_addr: Address = "203.0.113.9:3478".parse().unwrap();
        let mut candidates = Vec::new();
        gather(
            &socket,
            None,
            Some((relay_addr, None, None)),
            b"pw",
            |c| candidates.push(c),
        )
        .await
        .unwrap();
        assert_eq!(candidates.len(), 2);
        assert_eq!(candidates[1].kind, CandidateKind::Relay);
        assert_eq!(candidates[1].address, relay_addr.socket_addr());
    }

    #[tokio::test]
    async fn gathers_server_reflexive_against_loopback_stun_responder() {
        let stun_socket = UdpSocket::bind("127.0.0.1:0").await.unwrap();
        let stun_addr = stun_socket.local_addr().unwrap();
        let password = b"shared-secret".to_vec();

        let responder_password = password.clone();
        let responder = tokio::spawn(async move {
            let mut buf = [0u8; 1500];
            let (n, from) = stun_socket.recv_from(&mut buf).await.unwrap();
            let parsed = parse_message(&buf[..n], &responder_password).unwrap();
            let resp = crate::stun::encode_binding_response(
                &parsed.transaction_id,
                Address::from_socket_addr(from),
                &responder_password,
            );
            stun_socket.send_to(&resp, from).await.unwrap();
        });

        let socket = UdpSocket::bind("127.0.0.1:0").await.unwrap();
        let mut candidates = Vec::new();
        gather(
            &socket,
            Some(Address::from_socket_addr(stun_addr)),
            None,
            &password,
            |c| candidates.push(c),
        )
        .await
        .unwrap();

        responder.await.unwrap();
        assert_eq!(candidates.len(), 2);
        assert_eq!(candidates[1].kind, CandidateKind::ServerReflexive);
    }
}

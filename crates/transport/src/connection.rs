//! Connection façade (§4.12): binds the gatherer, P2P connectivity check,
//! DTLS channel, pacer, reliable channel, and per-SSRC media streams to one
//! session and owns their lifecycle in construction order
//! (network socket -> pacer -> media streams -> reliable channel -> DTLS
//! channel, matching `rtc2::ConnectionImpl::init`), tearing them down in
//! reverse on `Drop` (§3 "Connection").
//!
//! The "network thread" from §5 is a dedicated OS thread parking a
//! single-threaded Tokio runtime; every public method here posts a
//! [`Command`] onto that thread's channel and returns immediately
//! ("post-and-return", §5). All user callbacks are invoked on that same
//! network thread — the one "callback thread" this implementation
//! documents, an Open-Question resolution recorded in `DESIGN.md` rather
//! than the three separate OS threads a literal reading of §5 could
//! suggest for a reference crate of this scope.
//!
//! Breaking the cyclic wiring DESIGN NOTES §9 calls out (network <-> DTLS
//! <-> streams): every component here is driven by value from this one
//! function, never holding a back-pointer to its owner. Upward events
//! (inbound frames, errors, signaling) all flow through the single
//! [`ConnectionCallbacks`] event sink instead.

use std::collections::{HashMap, HashSet};
use std::net::SocketAddr;
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use bytes::Bytes;
use tokio::net::UdpSocket;
use tokio::sync::mpsc;
use tracing::{debug, warn};

use beam_protocol::{BeamTransportConfig, SignalingMessage};

use crate::address::Address;
use crate::audio::{AudioReceiveStream, AudioSendStream};
use crate::demux::{classify, PacketKind};
use crate::dtls::DtlsChannel;
use crate::error::{ConnectionError, ErrorKind};
use crate::gatherer;
use crate::keycert::{parse_pinned_digest, KeyAndCert};
use crate::p2p::CheckList;
use crate::pacer::Pacer;
use crate::reliable::ReliableChannel;
use crate::rtp::packet::RtpPacket;
use crate::video::{VideoFrame, VideoPacket, VideoReceiveStream, VideoSendStream};

/// RTP payload type video packets carry (§4.8).
const VIDEO_PAYLOAD_TYPE: u8 = 125;
/// RTP payload type audio packets carry (§4.10). Opus's typical dynamic PT.
const AUDIO_PAYLOAD_TYPE: u8 = 111;
/// 20ms of 48kHz audio, a reasonable fixed framing for the degenerate
/// audio path (no resampling/device enumeration — both out of scope).
const AUDIO_SAMPLES_PER_PACKET: u32 = 960;
/// §4.8: a u16 encode-duration field counts 150us ticks.
const ENCODE_DURATION_TICK_US: u32 = 150;
/// Fixed pacer send rate. Congestion control/adaptive simulcast are
/// Non-goals; the rate the pacer drains at is a constant here rather than
/// computed, matching §4.7's "a fixed default".
const DEFAULT_PACER_RATE_BYTES_PER_SEC: u32 = 750_000;
/// How long P2P will keep retransmitting Binding Requests before the
/// façade gives up and reports `ConnectivityFailed` (§7 kind 3).
const CONNECTIVITY_TIMEOUT: Duration = Duration::from_secs(10);

/// Which DTLS role this peer plays, fixed by whichever side the rendezvous
/// arbitration designated as the P2P "server" (§4.4: the server peer acts
/// as DTLS server, the other as client).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Role {
    Client,
    Server,
}

/// One reassembled video frame delivered to the consumer (§4.9), carrying
/// the same descriptor fields the sender attached.
#[derive(Debug, Clone)]
pub struct DecodedVideoFrame {
    pub frame_id: u16,
    pub encode_duration_us: u32,
    /// Capture-time estimate derived from the RTP timestamp (§4.9); this
    /// core does not resample, so it's the millisecond-scale encoder
    /// timestamp the sender stamped, widened back to microseconds.
    pub capture_time_us: i64,
    pub data: Bytes,
}

/// Caller-supplied event sinks (§4.12, §6): a small event interface rather
/// than callback-carrying structs that capture `this` (§9 re-architecture
/// guidance). The façade owns every component and routes their events
/// through this one struct.
pub struct ConnectionCallbacks {
    /// A local candidate or certificate fact to hand to the rendezvous
    /// server, verbatim (§6).
    pub on_signaling: Box<dyn Fn(SignalingMessage) + Send + Sync>,
    /// P2P nominated a path (`on_conn_changed`, §4.3).
    pub on_connected: Box<dyn Fn(SocketAddr, u64) + Send + Sync>,
    /// DTLS close-notify or fatal handshake error; fires at most once
    /// (§4.4).
    pub on_disconnected: Box<dyn Fn() + Send + Sync>,
    /// A terminal or logged session fault (§7).
    pub on_error: Box<dyn Fn(ErrorKind, String) + Send + Sync>,
    pub on_video: Box<dyn Fn(u32, DecodedVideoFrame) + Send + Sync>,
    pub on_audio: Box<dyn Fn(u32, Bytes) + Send + Sync>,
    pub on_data: Box<dyn Fn(Bytes, bool) + Send + Sync>,
    pub on_bwe_update: Box<dyn Fn(u64) + Send + Sync>,
    pub on_request_keyframe: Box<dyn Fn(u32) + Send + Sync>,
}

impl ConnectionCallbacks {
    /// A callback set that discards every event; handy for tests and for
    /// callers who only care about a subset (start from this and override
    /// individual fields).
    pub fn noop() -> Self {
        Self {
            on_signaling: Box::new(|_| {}),
            on_connected: Box::new(|_, _| {}),
            on_disconnected: Box::new(|| {}),
            on_error: Box::new(|_, _| {}),
            on_video: Box::new(|_, _| {}),
            on_audio: Box::new(|_, _| {}),
            on_data: Box::new(|_, _| {}),
            on_bwe_update: Box::new(|_| {}),
            on_request_keyframe: Box::new(|_| {}),
        }
    }
}

enum Command {
    Start,
    Signaling(SignalingMessage),
    SetPinnedDigest([u8; 32]),
    RegisterVideoSendStream(u32),
    RegisterAudioSendStream(u32),
    SendVideo { ssrc: u32, frame: VideoFrame },
    SendAudio { ssrc: u32, data: Bytes },
    SendData { data: Bytes, reliable: bool },
    Shutdown,
}

/// The aggregate owner (§3 "Connection"): lifecycle `create -> start ->
/// (streaming) -> drop`.
pub struct Connection {
    cmd_tx: mpsc::UnboundedSender<Command>,
    video_ssrcs: Arc<Mutex<HashSet<u32>>>,
    audio_ssrcs: Arc<Mutex<HashSet<u32>>>,
    local_cert_digest_hex: String,
    thread: Option<std::thread::JoinHandle<()>>,
}

impl Connection {
    /// Validates `config`, generates this peer's self-signed certificate,
    /// and spawns the network thread — but does not yet open the UDP
    /// socket or begin gathering unless `role` is [`Role::Server`] (§4.12:
    /// "on the server role, gathering starts at construction").
    pub fn create(
        config: BeamTransportConfig,
        role: Role,
        bind_addr: SocketAddr,
        callbacks: ConnectionCallbacks,
    ) -> Result<Self, ConnectionError> {
        if let Err(issues) = config.validate() {
            let fatal: Vec<&String> = issues.iter().filter(|i| i.starts_with("ERROR:")).collect();
            if !fatal.is_empty() {
                return Err(ConnectionError::new(
                    ErrorKind::ConfigurationInvalid,
                    fatal
                        .iter()
                        .map(|s| s.as_str())
                        .collect::<Vec<_>>()
                        .join("; "),
                ));
            }
            for issue in &issues {
                warn!(%issue, "beam transport config warning");
            }
        }

        let key_and_cert = KeyAndCert::generate()
            .map_err(|e| ConnectionError::new(ErrorKind::ConfigurationInvalid, e.to_string()))?;
        let local_cert_digest_hex = key_and_cert.digest_hex();

        // Any `pinned_cert_digest` already known at construction time (the
        // common case when the rendezvous server hands it over up front)
        // is seeded immediately; `validate()` above already guarantees
        // well-formed hex of the right length when present, so this never
        // fails to parse. Otherwise it arrives later via
        // `set_pinned_digest`, exactly like a peer candidate arrives later
        // via `on_signaling_message`.
        let initial_pinned_digest = config
            .security
            .pinned_cert_digest
            .as_deref()
            .and_then(parse_pinned_digest);

        let session_password = config.security.session_password.clone().into_bytes();
        let stun_server = config.ice.stun_urls.first().and_then(|u| parse_stun_url(u));
        let relay = config.ice.relay_addr.as_ref().and_then(|a| a.parse::<Address>().ok()).map(|addr| {
            (
                addr,
                config.ice.relay_username.clone(),
                config.ice.relay_credential.clone(),
            )
        });

        let is_client = matches!(role, Role::Client);
        let start_immediately = matches!(role, Role::Server);
        let reliability = config.reliability.clone();

        let (cmd_tx, cmd_rx) = mpsc::unbounded_channel();
        let callbacks = Arc::new(callbacks);
        let video_ssrcs = Arc::new(Mutex::new(HashSet::new()));
        let audio_ssrcs = Arc::new(Mutex::new(HashSet::new()));

        let thread = std::thread::Builder::new()
            .name("beam-network".to_string())
            .spawn(move || {
                let runtime = match tokio::runtime::Builder::new_current_thread().enable_all().build() {
                    Ok(rt) => rt,
                    Err(e) => {
                        (callbacks.on_error)(ErrorKind::ConfigurationInvalid, e.to_string());
                        return;
                    }
                };
                runtime.block_on(run_network_loop(
                    bind_addr,
                    stun_server,
                    relay,
                    session_password,
                    key_and_cert,
                    initial_pinned_digest,
                    is_client,
                    reliability,
                    start_immediately,
                    cmd_rx,
                    callbacks,
                ));
            })
            .map_err(|e| ConnectionError::new(ErrorKind::ConfigurationInvalid, e.to_string()))?;

        Ok(Self {
            cmd_tx,
            video_ssrcs,
            audio_ssrcs,
            local_cert_digest_hex,
            thread: Some(thread),
        })
    }

    /// This peer's own certificate digest, hex-encoded, to be handed to
    /// the rendezvous server so the remote peer can pin it (§3
    /// `KeyAndCert`).
    pub fn local_cert_digest_hex(&self) -> &str {
        &self.local_cert_digest_hex
    }

    /// Begins gathering. A no-op (beyond the first call) if gathering
    /// already started at construction (server role).
    pub fn start(&self) {
        let _ = self.cmd_tx.send(Command::Start);
    }

    /// Feed the remote peer's pinned certificate digest once it's known,
    /// e.g. after the rendezvous server relays it. Calling this more than
    /// once replaces the pin for any DTLS channel not yet constructed.
    pub fn set_pinned_digest(&self, digest: [u8; 32]) {
        let _ = self.cmd_tx.send(Command::SetPinnedDigest(digest));
    }

    /// Accepts a peer signaling record in the `{key, value}` format of §6.
    /// Unknown keys are logged and ignored by the network thread.
    pub fn on_signaling_message(&self, key: impl Into<String>, value: impl Into<String>) {
        let _ = self.cmd_tx.send(Command::Signaling(SignalingMessage {
            key: key.into(),
            value: value.into(),
        }));
    }

    /// Registers a video SSRC this side will transmit. Must be called
    /// before [`Connection::send_video`] will accept frames for `ssrc`.
    pub fn add_video_send_stream(&self, ssrc: u32) {
        self.video_ssrcs.lock().unwrap().insert(ssrc);
        let _ = self.cmd_tx.send(Command::RegisterVideoSendStream(ssrc));
    }

    /// Registers an audio SSRC this side will transmit.
    pub fn add_audio_send_stream(&self, ssrc: u32) {
        self.audio_ssrcs.lock().unwrap().insert(ssrc);
        let _ = self.cmd_tx.send(Command::RegisterAudioSendStream(ssrc));
    }

    /// Delegates to the reliable channel (§4.12). The half-reliable path
    /// is an alias of the reliable one (§4.11), so `reliable` is currently
    /// accepted but has no effect on delivery semantics.
    pub fn send_data(&self, data: impl Into<Bytes>, reliable: bool) {
        let _ = self.cmd_tx.send(Command::SendData {
            data: data.into(),
            reliable,
        });
    }

    /// Packetizes and paces `frame` for transmission on `ssrc`. Returns
    /// `false` if no such SSRC was registered via
    /// [`Connection::add_video_send_stream`] (§4.12).
    pub fn send_video(&self, ssrc: u32, frame: VideoFrame) -> bool {
        if !self.video_ssrcs.lock().unwrap().contains(&ssrc) {
            return false;
        }
        self.cmd_tx.send(Command::SendVideo { ssrc, frame }).is_ok()
    }

    /// Wraps `data` in one RTP packet on `ssrc`. Returns `false` if no
    /// such SSRC was registered.
    pub fn send_audio(&self, ssrc: u32, data: impl Into<Bytes>) -> bool {
        if !self.audio_ssrcs.lock().unwrap().contains(&ssrc) {
            return false;
        }
        self.cmd_tx
            .send(Command::SendAudio {
                ssrc,
                data: data.into(),
            })
            .is_ok()
    }
}

impl Drop for Connection {
    /// Tears down in reverse dependency order: signals the network thread
    /// to stop (which drops its streams, pacer, message channel, DTLS,
    /// P2P, and gatherer state as it unwinds), then joins it (§3).
    fn drop(&mut self) {
        let _ = self.cmd_tx.send(Command::Shutdown);
        if let Some(handle) = self.thread.take() {
            let _ = handle.join();
        }
    }
}

fn parse_stun_url(url: &str) -> Option<Address> {
    let rest = url.strip_prefix("stuns:").or_else(|| url.strip_prefix("stun:"))?;
    rest.parse::<Address>().ok()
}

fn fire_disconnected_once(callbacks: &ConnectionCallbacks, fired: &mut bool) {
    if !*fired {
        *fired = true;
        (callbacks.on_disconnected)();
    }
}

async fn gather_and_emit(
    socket: &UdpSocket,
    stun_server: Option<Address>,
    relay: Option<(Address, Option<String>, Option<String>)>,
    session_password: &[u8],
    callbacks: &ConnectionCallbacks,
) {
    let mut candidates = Vec::new();
    if let Err(e) = gatherer::gather(socket, stun_server, relay, session_password, |info| {
        candidates.push(info)
    })
    .await
    {
        (callbacks.on_error)(ErrorKind::GatheringFailed, e.to_string());
    }
    for info in candidates {
        (callbacks.on_signaling)(SignalingMessage::epinfo(&info));
    }
}

fn handle_signaling(msg: &SignalingMessage, checklist: &mut CheckList) {
    match msg.key.as_str() {
        SignalingMessage::KEY_EPINFO => match msg.parse_epinfo() {
            Ok(info) => checklist.add_remote_candidate(Address::from_socket_addr(info.address)),
            Err(e) => warn!(error = %e, "malformed epinfo signaling message, ignoring"),
        },
        other => warn!(key = %other, "unknown signaling key, ignoring"),
    }
}

async fn flush_dtls_outbound(channel: &mut DtlsChannel, socket: &UdpSocket, remote: Option<Address>) {
    let Some(remote) = remote else { return };
    for packet in channel.take_outbound() {
        if let Err(e) = socket.send_to(&packet, remote.socket_addr()).await {
            warn!(error = %e, "transient socket error sending dtls packet");
        }
    }
}

fn deliver_completed_frame(frame: Vec<VideoPacket>, ssrc: u32, callbacks: &ConnectionCallbacks) {
    let Some(first) = frame.first() else { return };
    let frame_id = first.frame_id.unwrap_or(0);
    let encode_duration_us = first
        .encode_duration
        .map(|ticks| ticks as u32 * ENCODE_DURATION_TICK_US)
        .unwrap_or(0);
    let capture_time_us = first.timestamp as i64 * 1000;
    let mut data = Vec::new();
    for packet in &frame {
        data.extend_from_slice(&packet.payload);
    }
    (callbacks.on_video)(
        ssrc,
        DecodedVideoFrame {
            frame_id,
            encode_duration_us,
            capture_time_us,
            data: Bytes::from(data),
        },
    );
}

async fn handle_inbound_rtp(
    datagram: &[u8],
    video_recv: &mut HashMap<u32, VideoReceiveStream>,
    audio_recv: &mut HashMap<u32, AudioReceiveStream>,
    callbacks: &ConnectionCallbacks,
    socket: &UdpSocket,
    remote: Option<Address>,
) {
    let parsed = match RtpPacket::parse(datagram) {
        Ok(p) => p,
        Err(e) => {
            debug!(error = %e, "dropping malformed rtp packet");
            return;
        }
    };
    let ssrc = parsed.ssrc();
    match parsed.payload_type() {
        VIDEO_PAYLOAD_TYPE => {
            let stream = video_recv
                .entry(ssrc)
                .or_insert_with(|| VideoReceiveStream::new(ssrc, rand::random()));
            let (frames, need_keyframe) = stream.handle_rtp_packet(&parsed);
            for frame in frames {
                deliver_completed_frame(frame, ssrc, callbacks);
            }
            if need_keyframe {
                let pli = stream.build_pli();
                if let Some(remote) = remote {
                    let _ = socket.send_to(&pli, remote.socket_addr()).await;
                }
                (callbacks.on_request_keyframe)(ssrc);
            }
        }
        AUDIO_PAYLOAD_TYPE => {
            let stream = audio_recv.entry(ssrc).or_insert_with(|| AudioReceiveStream::new(ssrc));
            let payload = stream.handle_rtp_packet(&parsed);
            (callbacks.on_audio)(ssrc, payload);
        }
        other => debug!(payload_type = other, "rtp packet with unrecognized payload type, dropping"),
    }
}

fn handle_inbound_rtcp(datagram: &[u8], callbacks: &ConnectionCallbacks) {
    const PT_PLI: u8 = 206;
    const PT_GENERIC_NACK: u8 = 205;
    let Some((_fmt, pt, _sender_ssrc, media_ssrc)) =
        crate::video::receive_stream::parse_rtcp_feedback_header(datagram)
    else {
        return;
    };
    match pt {
        PT_PLI => (callbacks.on_request_keyframe)(media_ssrc),
        PT_GENERIC_NACK => {
            debug!(ssrc = media_ssrc, "nack received; retransmission cache not implemented in this core")
        }
        other => debug!(payload_type = other, "unhandled rtcp feedback payload type"),
    }
}

#[allow(clippy::too_many_arguments)]
async fn run_network_loop(
    bind_addr: SocketAddr,
    stun_server: Option<Address>,
    relay: Option<(Address, Option<String>, Option<String>)>,
    session_password: Vec<u8>,
    key_and_cert: KeyAndCert,
    mut pinned_digest: Option<[u8; 32]>,
    is_client: bool,
    reliability: beam_protocol::ReliabilityConfig,
    start_immediately: bool,
    mut cmd_rx: mpsc::UnboundedReceiver<Command>,
    callbacks: Arc<ConnectionCallbacks>,
) {
    let socket = match UdpSocket::bind(bind_addr).await {
        Ok(s) => s,
        Err(e) => {
            (callbacks.on_error)(ErrorKind::GatheringFailed, e.to_string());
            return;
        }
    };
    let local_addr = match socket.local_addr() {
        Ok(a) => Address::from_socket_addr(a),
        Err(e) => {
            (callbacks.on_error)(ErrorKind::GatheringFailed, e.to_string());
            return;
        }
    };

    let mut checklist = CheckList::new(local_addr, session_password.clone());

    let mut gathering_started = false;
    let mut connectivity_deadline: Option<Instant> = None;
    let mut connectivity_failed_fired = false;
    if start_immediately {
        gathering_started = true;
        connectivity_deadline = Some(Instant::now() + CONNECTIVITY_TIMEOUT);
        gather_and_emit(&socket, stun_server, relay.clone(), &session_password, &callbacks).await;
    }

    let (mut pacer, _pacer_out, _pacer_rate_tx) = Pacer::new(
        DEFAULT_PACER_RATE_BYTES_PER_SEC,
        Duration::from_millis(reliability.pacer_tick_ms),
    );
    let mut pacer_timer = tokio::time::interval(Duration::from_millis(reliability.pacer_tick_ms));

    let mut dtls: Option<DtlsChannel> = None;
    let mut reliable = ReliableChannel::new(
        reliability.mtu,
        reliability.reliable_window,
        Duration::from_millis(reliability.reliable_tick_ms * 20),
    );
    let mut video_send: HashMap<u32, VideoSendStream> = HashMap::new();
    let mut audio_send: HashMap<u32, AudioSendStream> = HashMap::new();
    let mut video_recv: HashMap<u32, VideoReceiveStream> = HashMap::new();
    let mut audio_recv: HashMap<u32, AudioReceiveStream> = HashMap::new();

    let mut nominated_remote: Option<Address> = None;
    let mut disconnected_fired = false;

    let mut check_timer = tokio::time::interval(Duration::from_millis(reliability.check_retransmit_ms));
    let mut dtls_timer = tokio::time::interval(Duration::from_millis(reliability.check_retransmit_ms));
    let mut reliable_timer = tokio::time::interval(Duration::from_millis(reliability.reliable_tick_ms));

    let mut recv_buf = [0u8; 2048];

    loop {
        tokio::select! {
            cmd = cmd_rx.recv() => {
                match cmd {
                    None | Some(Command::Shutdown) => break,
                    Some(Command::Start) => {
                        if !gathering_started {
                            gathering_started = true;
                            connectivity_deadline = Some(Instant::now() + CONNECTIVITY_TIMEOUT);
                            gather_and_emit(&socket, stun_server, relay.clone(), &session_password, &callbacks).await;
                        }
                    }
                    Some(Command::Signaling(msg)) => handle_signaling(&msg, &mut checklist),
                    Some(Command::SetPinnedDigest(digest)) => {
                        pinned_digest = Some(digest);
                        if dtls.is_none() {
                            if nominated_remote.is_some() {
                                match DtlsChannel::new(&key_and_cert, digest, is_client) {
                                    Ok(channel) => {
                                        dtls = Some(channel);
                                        if let Some(channel) = dtls.as_mut() {
                                            flush_dtls_outbound(channel, &socket, nominated_remote).await;
                                        }
                                    }
                                    Err(e) => {
                                        (callbacks.on_error)(ErrorKind::HandshakeFailed, e.to_string());
                                        fire_disconnected_once(&callbacks, &mut disconnected_fired);
                                    }
                                }
                            }
                        }
                    }
                    Some(Command::RegisterVideoSendStream(ssrc)) => {
                        video_send.entry(ssrc).or_insert_with(|| VideoSendStream::new(ssrc));
                    }
                    Some(Command::RegisterAudioSendStream(ssrc)) => {
                        audio_send
                            .entry(ssrc)
                            .or_insert_with(|| AudioSendStream::new(ssrc, AUDIO_SAMPLES_PER_PACKET));
                    }
                    Some(Command::SendVideo { ssrc, frame }) => {
                        if let Some(stream) = video_send.get_mut(&ssrc) {
                            pacer.enqueue_many(stream.send_frame(&frame));
                        }
                    }
                    Some(Command::SendAudio { ssrc, data }) => {
                        if let Some(stream) = audio_send.get_mut(&ssrc) {
                            pacer.enqueue(stream.send_frame(&data));
                        }
                    }
                    Some(Command::SendData { data, reliable: _reliable }) => {
                        if let Err(e) = reliable.send_message(&data) {
                            warn!(error = %e, "dropping reliable message that doesn't fit the send window");
                        }
                    }
                }
            }

            _ = pacer_timer.tick() => {
                for paced in pacer.drain_ready() {
                    if let Some(remote) = nominated_remote {
                        if let Err(e) = socket.send_to(&paced.data, remote.socket_addr()).await {
                            warn!(error = %e, "transient socket error sending paced packet");
                        }
                    }
                }
            }

            _ = check_timer.tick(), if nominated_remote.is_none() => {
                for (to, bytes) in checklist.requests_due(Instant::now()) {
                    let _ = socket.send_to(&bytes, to.socket_addr()).await;
                }
                if let Some(deadline) = connectivity_deadline {
                    if Instant::now() >= deadline && !connectivity_failed_fired && nominated_remote.is_none() {
                        connectivity_failed_fired = true;
                        (callbacks.on_error)(
                            ErrorKind::ConnectivityFailed,
                            "no candidate pair nominated within the connectivity budget".to_string(),
                        );
                    }
                }
            }

            _ = dtls_timer.tick(), if dtls.is_some() => {
                if let Some(channel) = dtls.as_mut() {
                    if channel.handle_timeout(Instant::now()).is_err() {
                        (callbacks.on_error)(ErrorKind::HandshakeFailed, "dtls handshake failed".to_string());
                        fire_disconnected_once(&callbacks, &mut disconnected_fired);
                    }
                    flush_dtls_outbound(channel, &socket, nominated_remote).await;
                }
            }

            _ = reliable_timer.tick(), if dtls.as_ref().is_some_and(DtlsChannel::is_connected) => {
                reliable.on_periodic_tick(Instant::now());
                if let Some(channel) = dtls.as_mut() {
                    for fragment in reliable.take_outbound() {
                        if channel.send_application_data(&fragment).is_err() {
                            warn!("failed to send reliable-channel fragment over dtls");
                        }
                    }
                    flush_dtls_outbound(channel, &socket, nominated_remote).await;
                }
                for message in reliable.take_completed_messages() {
                    (callbacks.on_data)(message, true);
                }
            }

            recv = socket.recv_from(&mut recv_buf) => {
                match recv {
                    Ok((n, from)) => {
                        let from = Address::from_socket_addr(from);
                        let datagram = &recv_buf[..n];

                        if nominated_remote.is_none() {
                            match checklist.on_datagram(datagram, from) {
                                Ok((reply, just_nominated)) => {
                                    if let Some(reply) = reply {
                                        let _ = socket.send_to(&reply, from.socket_addr()).await;
                                    }
                                    if just_nominated {
                                        nominated_remote = Some(from);
                                        (callbacks.on_connected)(from.socket_addr(), 0);
                                        if let Some(digest) = pinned_digest {
                                            match DtlsChannel::new(&key_and_cert, digest, is_client) {
                                                Ok(channel) => {
                                                    dtls = Some(channel);
                                                    if let Some(channel) = dtls.as_mut() {
                                                        flush_dtls_outbound(channel, &socket, nominated_remote).await;
                                                    }
                                                }
                                                Err(e) => {
                                                    (callbacks.on_error)(ErrorKind::HandshakeFailed, e.to_string());
                                                    fire_disconnected_once(&callbacks, &mut disconnected_fired);
                                                }
                                            }
                                        } else {
                                            debug!("nominated but no pinned certificate digest yet; deferring dtls handshake");
                                        }
                                    }
                                }
                                Err(e) => debug!(error = %e, "connectivity check datagram rejected"),
                            }
                            continue;
                        }

                        match classify(datagram) {
                            PacketKind::Dtls => {
                                if let Some(channel) = dtls.as_mut() {
                                    let was_connected = channel.is_connected();
                                    match channel.handle_packet(datagram) {
                                        Ok(()) => {
                                            flush_dtls_outbound(channel, &socket, nominated_remote).await;
                                            let _ = was_connected;
                                            for record in channel.take_inbound_application_data() {
                                                let _ = reliable.on_datagram(&record);
                                            }
                                            for message in reliable.take_completed_messages() {
                                                (callbacks.on_data)(message, true);
                                            }
                                        }
                                        Err(_) => {
                                            (callbacks.on_error)(
                                                ErrorKind::HandshakeFailed,
                                                "dtls handshake failed or pinned certificate digest mismatch".to_string(),
                                            );
                                            fire_disconnected_once(&callbacks, &mut disconnected_fired);
                                        }
                                    }
                                }
                            }
                            PacketKind::Rtp => {
                                handle_inbound_rtp(
                                    datagram,
                                    &mut video_recv,
                                    &mut audio_recv,
                                    &callbacks,
                                    &socket,
                                    nominated_remote,
                                )
                                .await;
                            }
                            PacketKind::Rtcp => handle_inbound_rtcp(datagram, &callbacks),
                            PacketKind::Unknown => debug!(%from, "dropping unclassifiable datagram"),
                        }
                    }
                    Err(e) => warn!(error = %e, "transient socket read error"),
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use beam_protocol::{IceConfig, ReliabilityConfig, SecurityConfig};
    use tokio::sync::mpsc::unbounded_channel;
    use tokio::time::{timeout, Duration as TokioDuration};

    fn test_config(session_password: &str) -> BeamTransportConfig {
        BeamTransportConfig {
            ice: IceConfig {
                stun_urls: vec![],
                relay_addr: None,
                relay_username: None,
                relay_credential: None,
            },
            security: SecurityConfig {
                session_username: "user".to_string(),
                session_password: session_password.to_string(),
                pinned_cert_digest: None,
                tcp_fallback_tls: false,
            },
            reliability: ReliabilityConfig::default(),
        }
    }

    fn loopback() -> SocketAddr {
        "127.0.0.1:0".parse().unwrap()
    }

    #[test]
    fn create_rejects_empty_session_password() {
        let err = Connection::create(test_config(""), Role::Client, loopback(), ConnectionCallbacks::noop())
            .unwrap_err();
        assert_eq!(err.kind, ErrorKind::ConfigurationInvalid);
    }

    #[test]
    fn create_rejects_malformed_pinned_digest() {
        let mut config = test_config("shared-secret");
        config.security.pinned_cert_digest = Some("not valid hex".to_string());
        let err = Connection::create(config, Role::Client, loopback(), ConnectionCallbacks::noop())
            .unwrap_err();
        assert_eq!(err.kind, ErrorKind::ConfigurationInvalid);
    }

    #[test]
    fn create_succeeds_and_exposes_a_sha256_hex_digest() {
        let conn = Connection::create(
            test_config("shared-secret"),
            Role::Client,
            loopback(),
            ConnectionCallbacks::noop(),
        )
        .expect("valid config should construct a connection");
        assert_eq!(conn.local_cert_digest_hex().len(), 64);
    }

    enum Event {
        Signaling(SignalingMessage),
        Connected,
        Data(Bytes),
    }

    #[tokio::test]
    async fn two_peers_nominate_a_path_and_exchange_reliable_data() {
        let (a_tx, mut a_rx) = unbounded_channel::<Event>();
        let (b_tx, mut b_rx) = unbounded_channel::<Event>();

        let (a_sig, a_conn_evt, a_data) = (a_tx.clone(), a_tx.clone(), a_tx.clone());
        let callbacks_a = ConnectionCallbacks {
            on_signaling: Box::new(move |msg| {
                let _ = a_sig.send(Event::Signaling(msg));
            }),
            on_connected: Box::new(move |_, _| {
                let _ = a_conn_evt.send(Event::Connected);
            }),
            on_data: Box::new(move |data, _| {
                let _ = a_data.send(Event::Data(data));
            }),
            ..ConnectionCallbacks::noop()
        };

        let (b_sig, b_conn_evt, b_data) = (b_tx.clone(), b_tx.clone(), b_tx.clone());
        let callbacks_b = ConnectionCallbacks {
            on_signaling: Box::new(move |msg| {
                let _ = b_sig.send(Event::Signaling(msg));
            }),
            on_connected: Box::new(move |_, _| {
                let _ = b_conn_evt.send(Event::Connected);
            }),
            on_data: Box::new(move |data, _| {
                let _ = b_data.send(Event::Data(data));
            }),
            ..ConnectionCallbacks::noop()
        };

        let conn_a = Connection::create(test_config("shared-secret"), Role::Server, loopback(), callbacks_a)
            .unwrap();
        let conn_b = Connection::create(test_config("shared-secret"), Role::Client, loopback(), callbacks_b)
            .unwrap();

        conn_a.set_pinned_digest(parse_pinned_digest(conn_b.local_cert_digest_hex()).unwrap());
        conn_b.set_pinned_digest(parse_pinned_digest(conn_a.local_cert_digest_hex()).unwrap());

        conn_b.start();

        let mut a_connected = false;
        let mut b_connected = false;
        timeout(TokioDuration::from_secs(5), async {
            while !(a_connected && b_connected) {
                tokio::select! {
                    Some(event) = a_rx.recv() => match event {
                        Event::Signaling(msg) => conn_b.on_signaling_message(msg.key, msg.value),
                        Event::Connected => a_connected = true,
                        Event::Data(_) => {}
                    },
                    Some(event) = b_rx.recv() => match event {
                        Event::Signaling(msg) => conn_a.on_signaling_message(msg.key, msg.value),
                        Event::Connected => b_connected = true,
                        Event::Data(_) => {}
                    },
                }
            }
        })
        .await
        .expect("both peers should nominate a path within the timeout");

        conn_b.send_data(Bytes::from_static(b"hello from b"), true);

        let received = timeout(TokioDuration::from_secs(5), async {
            loop {
                if let Some(Event::Data(data)) = a_rx.recv().await {
                    return data;
                }
            }
        })
        .await
        .expect("reliable message should arrive");

        assert_eq!(&received[..], b"hello from b");
    }
}

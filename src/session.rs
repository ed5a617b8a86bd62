// Transport session: drives the handshake, multiplexes frames, and runs
// the retransmit/flush/rotation timers from a single process() loop.
// Numan Thabit 2025

use std::io;
use std::net::SocketAddr;

use bytes::Bytes;
use thiserror::Error;
use tracing::{debug, info, warn};

use crate::clock::Clock;
use crate::config::{Config, ConfigError};
use crate::frame::{
    ControlKind, Frame, DATA_OVERHEAD, FRAGMENT_OVERHEAD, FRAME_HEADER_LEN,
};
use crate::handshake::{Handshake, HandshakeConfig, HandshakeError, InitGate, Role, PSK_LEN};
use crate::io::udp::{self, UdpConfig, UdpSocket};
use crate::mux::ack::AckTracker;
use crate::mux::fragment::FragmentAssembler;
use crate::mux::rate::RateLimiter;
use crate::mux::reorder::ReorderBuffer;
use crate::mux::replay::ReplayWindow;
use crate::mux::retransmit::RetransmissionManager;
use crate::mux::rotate::SessionRotator;
use crate::packet::{
    self, PacketBuilder, PacketError, PacketHeader, PacketParser, PACKET_HEADER_LEN,
};
use crate::crypto::aead::TAG_LEN;
use crate::crypto::keys;

const HANDSHAKE_MSG_INIT: u8 = 0x01;

/// Session lifecycle states.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    Disconnected,
    Handshaking,
    Connected,
    Closing,
    Closed,
}

/// Publicly readable transport counters.
#[derive(Debug, Default, Clone, Copy)]
pub struct TransportStats {
    pub packets_sent: u64,
    pub packets_received: u64,
    pub bytes_sent: u64,
    pub bytes_received: u64,
    pub packets_dropped_rate_limit: u64,
    pub packets_dropped_replay: u64,
    pub packets_retransmitted: u64,
    pub messages_fragmented: u64,
    pub messages_assembled: u64,
    pub session_rotations: u64,
    pub handshake_failures: u64,
    pub decryption_failures: u64,
}

/// Errors surfaced by session operations.
#[derive(Debug, Error)]
pub enum SessionError {
    #[error("invalid configuration: {0}")]
    Config(#[from] ConfigError),
    #[error("session is not connected")]
    NotConnected,
    #[error("session already started")]
    AlreadyStarted,
    #[error("no peer address known")]
    NoPeer,
    #[error("send rejected by the rate limiter")]
    RateLimited,
    #[error("too much unacknowledged data in flight")]
    CapacityExceeded,
    #[error("message exceeds the fragment limits")]
    MessageTooLarge,
    #[error("socket error: {0}")]
    Io(#[from] io::Error),
    #[error("packet error: {0}")]
    Packet(#[from] PacketError),
    #[error("handshake error: {0}")]
    Handshake(#[from] HandshakeError),
}

type DataCallback = Box<dyn FnMut(Bytes)>;
type StateCallback = Box<dyn FnMut(SessionState)>;
type ErrorCallback = Box<dyn FnMut(&str)>;

/// A single peer-to-peer encrypted datagram session.
///
/// The session owns every component state exclusively; the caller drives it
/// by invoking [`TransportSession::process`] in a loop. Callbacks run
/// synchronously on that thread and must not re-enter the session.
pub struct TransportSession {
    config: Config,
    psk: [u8; PSK_LEN],
    state: SessionState,

    socket: Option<UdpSocket>,
    peer_addr: Option<SocketAddr>,

    handshake: Option<Handshake>,
    init_gate: InitGate,
    builder: PacketBuilder,
    parser: PacketParser,
    replay: ReplayWindow,
    rate: RateLimiter,
    acks: AckTracker,
    reorder: ReorderBuffer,
    fragments: FragmentAssembler,
    retransmit: RetransmissionManager,
    rotator: SessionRotator,
    clock: Clock,

    send_sequence: u64,
    packet_counter: u64,
    last_ack_sent: u64,
    next_message_id: u32,
    session_id: Option<[u8; 32]>,
    staged_rotation: Option<([u8; 32], u64)>,

    stats: TransportStats,

    on_data: Option<DataCallback>,
    on_state: Option<StateCallback>,
    on_error: Option<ErrorCallback>,
}

impl TransportSession {
    pub fn new(config: Config) -> Result<Self, SessionError> {
        Self::with_clock(config, Clock::new())
    }

    /// Constructor with an injected clock, for deterministic harnesses.
    pub fn with_clock(config: Config, clock: Clock) -> Result<Self, SessionError> {
        config.validate()?;
        let psk = config.psk_bytes()?;
        let now_ms = clock.now_ms();

        Ok(Self {
            builder: PacketBuilder::new(config.network.mtu),
            parser: PacketParser::new(),
            replay: ReplayWindow::new(),
            rate: RateLimiter::new(config.rate_limiter.clone()),
            acks: AckTracker::new(),
            reorder: ReorderBuffer::new(config.reorder.clone()),
            fragments: FragmentAssembler::new(config.fragment.clone()),
            retransmit: RetransmissionManager::new(config.retransmission.clone()),
            rotator: SessionRotator::new(config.rotation.clone(), now_ms),
            init_gate: InitGate::new(config.handshake.max_handshake_attempts),
            clock,
            psk,
            config,
            state: SessionState::Disconnected,
            socket: None,
            peer_addr: None,
            handshake: None,
            send_sequence: 1,
            packet_counter: 1,
            last_ack_sent: 0,
            next_message_id: 1,
            session_id: None,
            staged_rotation: None,
            stats: TransportStats::default(),
            on_data: None,
            on_state: None,
            on_error: None,
        })
    }

    pub fn set_data_callback(&mut self, callback: impl FnMut(Bytes) + 'static) {
        self.on_data = Some(Box::new(callback));
    }

    pub fn set_state_callback(&mut self, callback: impl FnMut(SessionState) + 'static) {
        self.on_state = Some(Box::new(callback));
    }

    pub fn set_error_callback(&mut self, callback: impl FnMut(&str) + 'static) {
        self.on_error = Some(Box::new(callback));
    }

    pub fn state(&self) -> SessionState {
        self.state
    }

    pub fn is_connected(&self) -> bool {
        self.state == SessionState::Connected
    }

    pub fn stats(&self) -> TransportStats {
        self.stats
    }

    /// Smoothed RTT estimate in milliseconds (0 until the first sample).
    pub fn rtt_ms(&self) -> u64 {
        self.retransmit.srtt_ms()
    }

    /// Transcript-derived 32-byte session id, present once connected.
    pub fn session_id(&self) -> Option<[u8; 32]> {
        self.session_id
    }

    pub fn local_addr(&self) -> Option<SocketAddr> {
        self.socket.as_ref().and_then(|s| s.local_addr().ok())
    }

    pub fn peer_addr(&self) -> Option<SocketAddr> {
        self.peer_addr
    }

    /// Opens the socket and, when a peer is configured, initiates the
    /// handshake. Without a peer the session waits for an inbound INIT.
    pub fn start(&mut self) -> Result<(), SessionError> {
        if self.socket.is_some() {
            return Err(SessionError::AlreadyStarted);
        }

        let local = udp::resolve(&self.config.network.local_host, self.config.network.local_port)?;
        let socket = UdpSocket::open(&UdpConfig::bind_to(local))?;
        info!(addr = %socket.local_addr()?, "session socket bound");
        self.socket = Some(socket);

        let hs_config = HandshakeConfig {
            psk: self.psk,
            timestamp_tolerance_sec: self.config.handshake.timestamp_tolerance_sec,
            require_psk: self.config.handshake.require_psk,
            max_handshake_attempts: self.config.handshake.max_handshake_attempts,
        };
        let mut handshake = Handshake::new(hs_config)?;

        if self.config.has_peer() {
            let peer = udp::resolve(&self.config.network.peer_host, self.config.network.peer_port)?;
            self.peer_addr = Some(peer);
            handshake.initiate(self.clock.now_secs())?;
            self.handshake = Some(handshake);
            self.set_state(SessionState::Handshaking);
            self.flush_handshake_messages()?;
        } else {
            self.handshake = Some(handshake);
            self.set_state(SessionState::Handshaking);
        }

        Ok(())
    }

    /// Stops the session: best-effort CLOSE, drops in-flight packets, and
    /// closes the socket. Idempotent.
    pub fn stop(&mut self) {
        if self.state == SessionState::Closed {
            return;
        }

        if self.state == SessionState::Connected {
            if let Err(err) = self.send_close() {
                debug!(error = %err, "close notification not sent");
            }
        }

        for sequence in self.retransmit.drain() {
            debug!(sequence, "unacked packet dropped on close");
        }

        self.set_state(SessionState::Closing);
        self.socket = None;
        self.set_state(SessionState::Closed);
    }

    /// Sends application bytes, fragmenting when they exceed the MTU.
    pub fn send(&mut self, data: &[u8]) -> Result<(), SessionError> {
        if self.state != SessionState::Connected {
            return Err(SessionError::NotConnected);
        }

        let mtu = self.config.network.mtu;
        let max_data = mtu - PACKET_HEADER_LEN - FRAME_HEADER_LEN - DATA_OVERHEAD - TAG_LEN;

        if data.len() <= max_data {
            let wire_len =
                PACKET_HEADER_LEN + FRAME_HEADER_LEN + DATA_OVERHEAD + data.len() + TAG_LEN;
            if !self.retransmit.can_send(wire_len) {
                return Err(SessionError::CapacityExceeded);
            }
            let sequence = self.send_sequence;
            self.send_sequence += 1;
            let frame = Frame::Data {
                sequence,
                payload: Bytes::copy_from_slice(data),
            };
            return self.send_frame(frame, Some(sequence));
        }

        let max_chunk = mtu - PACKET_HEADER_LEN - FRAME_HEADER_LEN - FRAGMENT_OVERHEAD - TAG_LEN;
        let total = data.len().div_ceil(max_chunk);
        if total > usize::from(self.config.fragment.max_fragments_per_message)
            || total > usize::from(u16::MAX)
        {
            return Err(SessionError::MessageTooLarge);
        }

        let message_id = self.next_message_id;
        self.next_message_id = self.next_message_id.wrapping_add(1);
        self.stats.messages_fragmented += 1;

        for (index, chunk) in data.chunks(max_chunk).enumerate() {
            let frame = Frame::Fragment {
                message_id,
                index: index as u16,
                total: total as u16,
                chunk: Bytes::copy_from_slice(chunk),
            };
            self.send_frame(frame, None)?;
        }
        Ok(())
    }

    /// Sends a PING carrying the current transport clock.
    pub fn send_ping(&mut self) -> Result<(), SessionError> {
        if self.state != SessionState::Connected {
            return Err(SessionError::NotConnected);
        }
        let frame = Frame::Control {
            kind: ControlKind::Ping,
            timestamp_ms: self.clock.now_ms(),
            data: Bytes::new(),
        };
        self.send_frame(frame, None)
    }

    fn send_pong(&mut self, echo_timestamp_ms: u64) -> Result<(), SessionError> {
        let frame = Frame::Control {
            kind: ControlKind::Pong,
            timestamp_ms: echo_timestamp_ms,
            data: Bytes::new(),
        };
        self.send_frame(frame, None)
    }

    fn send_close(&mut self) -> Result<(), SessionError> {
        let frame = Frame::Control {
            kind: ControlKind::Close,
            timestamp_ms: self.clock.now_ms(),
            data: Bytes::new(),
        };
        self.send_frame(frame, None)
    }

    fn send_ack(&mut self) -> Result<(), SessionError> {
        let frame = Frame::Ack {
            ack_number: self.acks.ack_number(),
            sack_bitmap: self.acks.bitmap(),
            recv_window: self.config.reorder.max_buffered_packets as u32,
        };
        let ack_number = self.acks.ack_number();
        self.send_frame(frame, None)?;
        self.last_ack_sent = ack_number;
        Ok(())
    }

    /// Seals one frame into a datagram and puts it on the wire.
    ///
    /// DATA frames pass their sequence so the sealed bytes are retained for
    /// retransmission; everything else is fire-and-forget.
    fn send_frame(&mut self, frame: Frame, register: Option<u64>) -> Result<(), SessionError> {
        let peer = self.peer_addr.ok_or(SessionError::NoPeer)?;
        let socket = self.socket.as_ref().ok_or(SessionError::NotConnected)?;

        let wire_len = PACKET_HEADER_LEN + frame.encoded_len() + TAG_LEN;
        if !self.rate.try_consume(wire_len) {
            self.stats.packets_dropped_rate_limit += 1;
            return Err(SessionError::RateLimited);
        }

        self.builder.clear();
        self.builder.set_session_id(self.rotator.current_id());
        self.builder.add_frame(&frame)?;

        let counter = self.packet_counter;
        let datagram = Bytes::from(self.builder.build(counter)?);

        if let Some(sequence) = register {
            let now_ms = self.clock.now_ms();
            self.retransmit
                .register_packet(sequence, datagram.clone(), now_ms);
        }

        socket.send_to(&datagram, peer)?;
        self.packet_counter += 1;
        self.stats.packets_sent += 1;
        self.stats.bytes_sent += datagram.len() as u64;
        self.rotator.on_packet_sent(datagram.len());
        Ok(())
    }

    /// One iteration of the event loop: refill the rate limiter, wait for
    /// and dispatch datagrams, then run the timer work.
    pub fn process(&mut self, timeout_ms: u64) -> Result<(), SessionError> {
        let now_ms = self.clock.now_ms();
        self.rate.refill_at(now_ms);

        let mut buf = vec![0u8; crate::config::MAX_MTU];
        let mut wait = timeout_ms;
        loop {
            let received = match self.socket.as_ref() {
                Some(socket) => {
                    if wait > 0 {
                        socket.poll_recv(&mut buf, wait)?
                    } else {
                        socket.try_recv(&mut buf)?
                    }
                }
                None => break,
            };
            wait = 0;
            match received {
                Some((len, from)) => {
                    let now_ms = self.clock.now_ms();
                    self.handle_datagram(&buf[..len], from, now_ms);
                }
                None => break,
            }
        }

        let now_ms = self.clock.now_ms();
        self.run_timers(now_ms);
        Ok(())
    }

    fn run_timers(&mut self, now_ms: u64) {
        let sweep = self.retransmit.retransmit_expired(now_ms);
        if !sweep.retransmit.is_empty() || !sweep.dropped.is_empty() {
            if let (Some(socket), Some(peer)) = (self.socket.as_ref(), self.peer_addr) {
                for (sequence, sealed) in &sweep.retransmit {
                    match socket.send_to(sealed, peer) {
                        Ok(_) => {
                            self.stats.packets_retransmitted += 1;
                            debug!(sequence, "packet retransmitted");
                        }
                        Err(err) => warn!(sequence, error = %err, "retransmit send failed"),
                    }
                }
            }
            for sequence in &sweep.dropped {
                debug!(sequence, "packet dropped after max retries");
            }
        }

        let flushed = self.reorder.flush(now_ms);
        for (_, payload) in flushed {
            self.emit_data(payload);
        }

        self.fragments.cleanup_expired(now_ms);

        if self.state == SessionState::Connected && self.rotator.should_rotate(now_ms) {
            self.rotate_session(now_ms);
        }
    }

    /// Refreshes the short session id: announce the successor under the old
    /// id, then switch. The announcement is advisory for the peer.
    fn rotate_session(&mut self, now_ms: u64) {
        let new_short = keys::random_u64();
        let mut advertised = [0u8; 32];
        advertised[..8].copy_from_slice(&new_short.to_be_bytes());
        keys::fill_random(&mut advertised[8..]);

        let frame = Frame::SessionRotate {
            new_session_id: advertised,
            activation_sequence: self.send_sequence,
        };
        if let Err(err) = self.send_frame(frame, None) {
            debug!(error = %err, "session rotate announcement not sent");
        }

        self.rotator.rotate_to(new_short, now_ms);
        self.stats.session_rotations += 1;
        info!(short_id = format_args!("{new_short:016x}"), "session id rotated");
    }

    fn handle_datagram(&mut self, data: &[u8], from: SocketAddr, now_ms: u64) {
        self.stats.packets_received += 1;
        self.stats.bytes_received += data.len() as u64;

        let header = match PacketHeader::decode(data) {
            Ok(header) => header,
            Err(_) => return,
        };

        // Zero short id marks a pre-session handshake datagram. Established
        // sessions refuse it outright.
        if header.session_id == 0 {
            if self.state == SessionState::Connected {
                return;
            }
            let frame = match packet::parse_handshake_datagram(data) {
                Ok(frame) => frame,
                Err(_) => return,
            };
            if let Frame::Handshake { envelope, .. } = frame {
                self.handle_handshake_message(&envelope, from, now_ms);
            }
            return;
        }

        if self.state != SessionState::Connected {
            return;
        }

        if header.session_id != self.rotator.current_id() && !self.try_adopt_rotation(&header, now_ms)
        {
            debug!(
                session_id = format_args!("{:016x}", header.session_id),
                "datagram for unknown session id"
            );
            return;
        }

        if !self.replay.check_and_update(header.packet_counter) {
            self.stats.packets_dropped_replay += 1;
            return;
        }

        let parsed = match self.parser.parse(data) {
            Ok(parsed) => parsed,
            Err(PacketError::DecryptionFailed) => {
                self.stats.decryption_failures += 1;
                return;
            }
            Err(err) => {
                debug!(error = %err, "datagram rejected");
                return;
            }
        };

        self.rotator.on_packet_received(data.len());

        for frame in parsed.frames {
            self.handle_frame(frame, now_ms);
        }
    }

    /// Adopts a previously staged peer rotation when the short id matches.
    fn try_adopt_rotation(&mut self, header: &PacketHeader, now_ms: u64) -> bool {
        let staged_short = match self.staged_rotation {
            Some((id, _)) => u64::from_be_bytes(id[..8].try_into().expect("length checked")),
            None => return false,
        };
        if staged_short != header.session_id {
            return false;
        }

        self.rotator.adopt_id(staged_short, now_ms);
        self.staged_rotation = None;
        self.stats.session_rotations += 1;
        info!(
            short_id = format_args!("{staged_short:016x}"),
            "adopted peer session rotation"
        );
        true
    }

    fn handle_frame(&mut self, frame: Frame, now_ms: u64) {
        match frame {
            Frame::Data { sequence, payload } => {
                self.acks.mark_received(sequence);
                if !self.reorder.insert(sequence, payload, now_ms) {
                    debug!(sequence, "data frame not buffered");
                }
                let delivered = self.reorder.deliver();
                for (_, payload) in delivered {
                    self.emit_data(payload);
                }

                if self.acks.ack_number() > self.last_ack_sent + 2 {
                    if let Err(err) = self.send_ack() {
                        debug!(error = %err, "ack not sent");
                    }
                }
            }
            Frame::Ack {
                ack_number,
                sack_bitmap,
                ..
            } => {
                self.retransmit.process_sack(ack_number, sack_bitmap, now_ms);
            }
            Frame::Control {
                kind, timestamp_ms, ..
            } => match kind {
                ControlKind::Ping => {
                    if let Err(err) = self.send_pong(timestamp_ms) {
                        debug!(error = %err, "pong not sent");
                    }
                }
                ControlKind::Pong => {
                    // RTT accounting rides on the ack path.
                }
                ControlKind::Close => self.set_state(SessionState::Closing),
                ControlKind::Reset => self.set_state(SessionState::Disconnected),
            },
            Frame::Fragment {
                message_id,
                index,
                total,
                chunk,
            } => match self
                .fragments
                .add_fragment(message_id, index, total, chunk, now_ms)
            {
                Ok(Some(assembled)) => {
                    self.stats.messages_assembled += 1;
                    self.emit_data(assembled);
                }
                Ok(None) => {}
                Err(err) => debug!(message_id, error = %err, "fragment rejected"),
            },
            Frame::Handshake { envelope, .. } => {
                // In-session handshake frames are the rekey extension point;
                // the current session derives keys once, pre-session.
                if self.handshake.is_some() {
                    if let Some(peer) = self.peer_addr {
                        self.handle_handshake_message(&envelope, peer, now_ms);
                    }
                }
            }
            Frame::SessionRotate {
                new_session_id,
                activation_sequence,
            } => {
                debug!(activation_sequence, "staged peer session rotation");
                self.staged_rotation = Some((new_session_id, activation_sequence));
            }
        }
    }

    fn handle_handshake_message(&mut self, envelope: &[u8], from: SocketAddr, now_ms: u64) {
        if self.handshake.is_none() {
            return;
        }

        if self.peer_addr.is_none() {
            self.peer_addr = Some(from);
        }

        // Responder-side INIT gate, keyed by peer address.
        if envelope.first() == Some(&HANDSHAKE_MSG_INIT) && !self.init_gate.allow(from, now_ms) {
            debug!(peer = %from, "handshake INIT rate limited");
            return;
        }

        let now_secs = self.clock.now_secs();
        let handshake = self.handshake.as_mut().expect("checked above");
        match handshake.process_message(envelope, now_secs) {
            Ok(completed) => {
                if let Err(err) = self.flush_handshake_messages() {
                    warn!(error = %err, "handshake reply not sent");
                }
                if completed {
                    self.install_session_keys(now_ms);
                }
            }
            Err(
                error @ (HandshakeError::KeyExchangeFailed | HandshakeError::Internal(_)),
            ) => {
                self.stats.handshake_failures += 1;
                let text = error.to_string();
                self.emit_error(&text);
                match self.handshake.as_ref().and_then(|h| h.role()) {
                    Some(Role::Initiator) => self.set_state(SessionState::Closing),
                    _ => {
                        // A responder keeps listening with fresh material.
                        if let Some(handshake) = self.handshake.as_mut() {
                            handshake.reset();
                        }
                        self.peer_addr = None;
                    }
                }
            }
            Err(error) => {
                // Anti-probing: no reply, no state change.
                debug!(error = %error, "handshake message dropped");
            }
        }
    }

    fn flush_handshake_messages(&mut self) -> Result<(), SessionError> {
        let peer = self.peer_addr.ok_or(SessionError::NoPeer)?;
        let socket = self.socket.as_ref().ok_or(SessionError::NotConnected)?;

        let outbound = match self.handshake.as_mut() {
            Some(handshake) => handshake.take_outbound(),
            None => return Ok(()),
        };

        for (stage, envelope) in outbound {
            let datagram = packet::build_handshake_datagram(stage, &envelope)?;
            socket.send_to(&datagram, peer)?;
            self.stats.packets_sent += 1;
            self.stats.bytes_sent += datagram.len() as u64;
        }
        Ok(())
    }

    fn install_session_keys(&mut self, now_ms: u64) {
        let outcome = match self.handshake.as_mut().and_then(|h| h.take_outcome()) {
            Some(outcome) => outcome,
            None => {
                self.stats.handshake_failures += 1;
                self.emit_error("handshake completed without keys");
                return;
            }
        };

        self.builder
            .set_keys(outcome.keys.send_key, outcome.keys.send_nonce_base);
        self.parser
            .set_keys(outcome.keys.recv_key, outcome.keys.recv_nonce_base);
        self.session_id = Some(outcome.session_id);
        self.rotator.adopt_id(outcome.short_id, now_ms);
        self.handshake = None;

        info!(
            role = ?outcome.role,
            short_id = format_args!("{:016x}", outcome.short_id),
            "handshake complete, session established"
        );
        self.set_state(SessionState::Connected);
    }

    fn set_state(&mut self, new_state: SessionState) {
        if self.state != new_state {
            self.state = new_state;
            if let Some(callback) = self.on_state.as_mut() {
                callback(new_state);
            }
        }
    }

    fn emit_data(&mut self, payload: Bytes) {
        if let Some(callback) = self.on_data.as_mut() {
            callback(payload);
        }
    }

    fn emit_error(&mut self, message: &str) {
        warn!(error = message, "session error");
        if let Some(callback) = self.on_error.as_mut() {
            callback(message);
        }
    }
}

impl Drop for TransportSession {
    fn drop(&mut self) {
        self.stop();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::cell::RefCell;
    use std::net::UdpSocket as RawUdpSocket;
    use std::rc::Rc;
    use std::time::Duration;

    fn base_config(psk: &str) -> Config {
        let mut config = Config::default();
        config.network.local_host = "127.0.0.1".to_string();
        config.network.local_port = 0;
        config.security.psk = psk.to_string();
        // Keep the gap-skip timer out of the way of single-step tests.
        config.reorder.max_delay_ms = 10_000;
        config
    }

    fn client_config(psk: &str, peer: SocketAddr) -> Config {
        let mut config = base_config(psk);
        config.network.peer_host = peer.ip().to_string();
        config.network.peer_port = peer.port();
        config
    }

    struct Tap {
        socket: RawUdpSocket,
        responder: SocketAddr,
        initiator: Option<SocketAddr>,
    }

    /// A test-owned middlebox between the initiator and responder so tests
    /// can observe, replay, tamper with, and reorder ciphertext.
    impl Tap {
        fn new(responder: SocketAddr) -> Self {
            let socket = RawUdpSocket::bind("127.0.0.1:0").expect("bind tap");
            socket
                .set_read_timeout(Some(Duration::from_millis(500)))
                .unwrap();
            Self {
                socket,
                responder,
                initiator: None,
            }
        }

        fn addr(&self) -> SocketAddr {
            self.socket.local_addr().unwrap()
        }

        fn recv(&mut self) -> Option<(Vec<u8>, SocketAddr)> {
            let mut buf = [0u8; 65_535];
            match self.socket.recv_from(&mut buf) {
                Ok((len, from)) => {
                    if from != self.responder {
                        self.initiator = Some(from);
                    }
                    Some((buf[..len].to_vec(), from))
                }
                Err(_) => None,
            }
        }

        /// Receives one datagram and forwards it to the opposite side,
        /// returning a copy.
        fn relay_one(&mut self) -> Option<Vec<u8>> {
            let (data, from) = self.recv()?;
            let target = if from == self.responder {
                self.initiator.expect("initiator seen first")
            } else {
                self.responder
            };
            self.socket.send_to(&data, target).unwrap();
            Some(data)
        }

        fn send_to_responder(&self, data: &[u8]) {
            self.socket.send_to(data, self.responder).unwrap();
        }
    }

    fn collected_payloads(session: &mut TransportSession) -> Rc<RefCell<Vec<Bytes>>> {
        let sink = Rc::new(RefCell::new(Vec::new()));
        let clone = Rc::clone(&sink);
        session.set_data_callback(move |payload| clone.borrow_mut().push(payload));
        sink
    }

    /// Brings up (initiator, responder, tap) with the handshake relayed
    /// through the tap and both sessions CONNECTED.
    fn connected_pair(psk: &str) -> (TransportSession, TransportSession, Tap) {
        let mut responder = TransportSession::new(base_config(psk)).unwrap();
        responder.start().unwrap();
        let responder_addr = responder.local_addr().unwrap();

        let mut tap = Tap::new(responder_addr);
        let mut initiator = TransportSession::new(client_config(psk, tap.addr())).unwrap();
        initiator.start().unwrap();

        // INIT -> responder, RESPONSE -> initiator, FINISH -> responder.
        tap.relay_one().expect("INIT");
        responder.process(200).unwrap();
        tap.relay_one().expect("RESPONSE");
        initiator.process(200).unwrap();
        tap.relay_one().expect("FINISH");
        responder.process(200).unwrap();

        assert!(initiator.is_connected());
        assert!(responder.is_connected());
        assert_eq!(initiator.session_id(), responder.session_id());

        (initiator, responder, tap)
    }

    #[test]
    fn handshake_and_first_data_delivery() {
        let (mut initiator, mut responder, mut tap) = connected_pair("ab".repeat(32).as_str());
        let sink = collected_payloads(&mut responder);

        initiator.send(b"Hello, World!").unwrap();
        tap.relay_one().expect("data datagram");
        responder.process(200).unwrap();

        let received = sink.borrow();
        assert_eq!(received.len(), 1);
        assert_eq!(&received[0][..], b"Hello, World!");
    }

    #[test]
    fn tampered_datagram_counts_decryption_failure() {
        let (mut initiator, mut responder, mut tap) = connected_pair("0xcd");
        let sink = collected_payloads(&mut responder);

        initiator.send(b"sensitive").unwrap();
        let (mut data, _) = tap.recv().expect("data datagram");
        data[17] ^= 0x01;
        tap.send_to_responder(&data);
        responder.process(200).unwrap();

        assert_eq!(responder.stats().decryption_failures, 1);
        assert!(sink.borrow().is_empty());
    }

    #[test]
    fn replayed_datagram_counts_replay_drop() {
        let (mut initiator, mut responder, mut tap) = connected_pair("0xef");
        let sink = collected_payloads(&mut responder);

        initiator.send(b"once").unwrap();
        let data = tap.relay_one().expect("data datagram");
        responder.process(200).unwrap();
        assert_eq!(sink.borrow().len(), 1);

        // Verbatim replay of an accepted datagram.
        tap.send_to_responder(&data);
        responder.process(200).unwrap();

        assert_eq!(responder.stats().packets_dropped_replay, 1);
        assert_eq!(sink.borrow().len(), 1);
    }

    #[test]
    fn out_of_order_data_delivered_in_sequence() {
        let (mut initiator, mut responder, mut tap) = connected_pair("0x11");
        let sink = collected_payloads(&mut responder);

        initiator.send(b"one").unwrap();
        initiator.send(b"two").unwrap();
        initiator.send(b"three").unwrap();

        let first = tap.recv().expect("seq 1").0;
        let second = tap.recv().expect("seq 2").0;
        let third = tap.recv().expect("seq 3").0;

        // Deliver 2 and 3 before 1: nothing reaches the application.
        tap.send_to_responder(&second);
        tap.send_to_responder(&third);
        responder.process(200).unwrap();
        assert!(sink.borrow().is_empty());

        tap.send_to_responder(&first);
        responder.process(200).unwrap();

        let received = sink.borrow();
        let texts: Vec<&[u8]> = received.iter().map(|b| &b[..]).collect();
        assert_eq!(texts, vec![&b"one"[..], b"two", b"three"]);
    }

    #[test]
    fn fragmented_message_reassembles() {
        let (mut initiator, mut responder, mut tap) = connected_pair("0x22");
        let sink = collected_payloads(&mut responder);

        let message: Vec<u8> = (0..5000u32).map(|i| i as u8).collect();
        initiator.send(&message).unwrap();
        assert_eq!(initiator.stats().messages_fragmented, 1);

        while tap.relay_one().is_some() {
            responder.process(50).unwrap();
        }

        let received = sink.borrow();
        assert_eq!(received.len(), 1);
        assert_eq!(&received[0][..], &message[..]);
        assert_eq!(responder.stats().messages_assembled, 1);
    }

    #[test]
    fn ping_is_answered_with_pong_echo() {
        let (mut initiator, mut responder, mut tap) = connected_pair("0x33");

        initiator.send_ping().unwrap();
        tap.relay_one().expect("ping");
        responder.process(200).unwrap();
        tap.relay_one().expect("pong");
        initiator.process(200).unwrap();

        // Both directions saw traffic.
        assert!(initiator.stats().packets_received >= 1);
        assert!(responder.stats().packets_sent >= 1);
    }

    #[test]
    fn close_moves_peer_to_closing() {
        let (mut initiator, mut responder, mut tap) = connected_pair("0x44");

        let states = Rc::new(RefCell::new(Vec::new()));
        let clone = Rc::clone(&states);
        responder.set_state_callback(move |state| clone.borrow_mut().push(state));

        initiator.stop();
        tap.relay_one().expect("close frame");
        responder.process(200).unwrap();

        assert_eq!(responder.state(), SessionState::Closing);
        assert!(states.borrow().contains(&SessionState::Closing));
    }

    #[test]
    fn send_before_connect_fails() {
        let mut session = TransportSession::new(base_config("0x55")).unwrap();
        assert!(matches!(
            session.send(b"nope"),
            Err(SessionError::NotConnected)
        ));
    }

    #[test]
    fn psk_mismatch_never_connects() {
        let mut responder = TransportSession::new(base_config("0xaaaa")).unwrap();
        responder.start().unwrap();
        let responder_addr = responder.local_addr().unwrap();

        let mut tap = Tap::new(responder_addr);
        let mut initiator =
            TransportSession::new(client_config("0xbbbb", tap.addr())).unwrap();
        initiator.start().unwrap();

        tap.relay_one().expect("INIT");
        responder.process(200).unwrap();

        // The responder silently dropped the INIT: no RESPONSE follows.
        assert!(tap.recv().is_none());
        assert!(!responder.is_connected());
        assert_eq!(responder.state(), SessionState::Handshaking);
    }

    #[test]
    fn data_triggers_ack_and_clears_retransmit_store() {
        let (mut initiator, mut responder, mut tap) = connected_pair("0x66");

        // Four data frames push ack_number past last_ack_sent + 2, so the
        // responder emits an ACK the initiator consumes.
        for message in [&b"a"[..], b"b", b"c", b"d"] {
            initiator.send(message).unwrap();
            tap.relay_one().expect("data");
            responder.process(200).unwrap();
        }

        // Relay whatever the responder pushed back (the ACK).
        while tap.relay_one().is_some() {
            initiator.process(50).unwrap();
        }

        // The ACK covered 1..=3 contiguously; 4 may stay in flight until
        // the next acknowledgment.
        assert!(!initiator.retransmit.contains(1));
        assert!(!initiator.retransmit.contains(2));
        assert!(!initiator.retransmit.contains(3));
    }
}

// Three-message ephemeral handshake bound to the PSK, and the INIT gate.
// Numan Thabit 2025

use std::collections::VecDeque;
use std::net::SocketAddr;

use ahash::AHashMap;
use thiserror::Error;
use tracing::debug;
use zeroize::Zeroize;

use crate::crypto::hkdf::{self, SessionKeys};
use crate::crypto::hmac::{self, HMAC_LEN};
use crate::crypto::keys::{EphemeralKeypair, SharedSecret, PUBLIC_KEY_LEN};
use crate::frame::HandshakeStage;

/// Envelope header: type(1) + timestamp(8) + payload_len(2).
const ENVELOPE_HEADER_LEN: usize = 11;

const MSG_INIT: u8 = 0x01;
const MSG_RESPONSE: u8 = 0x02;
const MSG_FINISH: u8 = 0x03;

/// PSK length. An all-zero value means "no PSK configured".
pub const PSK_LEN: usize = 32;

/// Transcript-derived session id length.
pub const SESSION_ID_LEN: usize = 32;

/// Handshake parameters.
#[derive(Debug, Clone)]
pub struct HandshakeConfig {
    /// Pre-shared key; zeros when absent.
    pub psk: [u8; PSK_LEN],
    /// Accepted clock skew for envelope timestamps.
    pub timestamp_tolerance_sec: u64,
    /// Refuse to run without a real PSK.
    pub require_psk: bool,
    /// INIT attempts admitted per peer address per minute.
    pub max_handshake_attempts: u32,
}

impl Default for HandshakeConfig {
    fn default() -> Self {
        Self {
            psk: [0u8; PSK_LEN],
            timestamp_tolerance_sec: 60,
            require_psk: false,
            max_handshake_attempts: 3,
        }
    }
}

/// Which side of the exchange this endpoint is.
///
/// Tracked explicitly from the first transition; never recovered from key
/// material.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Role {
    Initiator,
    Responder,
}

/// Handshake progression states.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HandshakeState {
    Idle,
    InitSent,
    InitReceived,
    ResponseSent,
    Complete,
    Failed,
}

/// Handshake failures. Everything except `Internal` is dropped silently on
/// the wire (anti-probing); the enum still names the reason for stats and
/// diagnostics.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum HandshakeError {
    #[error("invalid handshake message")]
    InvalidMessage,
    #[error("timestamp outside tolerance")]
    TimestampOutOfRange,
    #[error("hmac verification failed")]
    HmacVerificationFailed,
    #[error("key exchange failed")]
    KeyExchangeFailed,
    #[error("psk required but missing")]
    PskRequiredButMissing,
    #[error("handshake rate limited")]
    RateLimited,
    #[error("internal handshake error: {0}")]
    Internal(&'static str),
}

/// Everything a completed handshake hands to the session.
pub struct HandshakeOutcome {
    /// 32-byte transcript-derived session id; identical on both peers.
    pub session_id: [u8; SESSION_ID_LEN],
    /// Truncation of `session_id` used as the packet-header short id.
    pub short_id: u64,
    pub role: Role,
    pub keys: SessionKeys,
}

/// The 3-message handshake state machine.
///
/// Message envelope: `type(1) ‖ timestamp_be(8) ‖ payload_len_be(2) ‖
/// payload ‖ hmac(32)`, authenticated with HMAC-SHA256 under the PSK. The
/// transcript collects every verified message (own sends included) in wire
/// order and binds the session id.
pub struct Handshake {
    config: HandshakeConfig,
    state: HandshakeState,
    role: Option<Role>,
    keypair: EphemeralKeypair,
    shared: Option<SharedSecret>,
    transcript: Vec<u8>,
    outbound: VecDeque<(HandshakeStage, Vec<u8>)>,
    outcome: Option<HandshakeOutcome>,
    last_error: Option<HandshakeError>,
}

impl Handshake {
    pub fn new(config: HandshakeConfig) -> Result<Self, HandshakeError> {
        if config.require_psk && config.psk.iter().all(|&b| b == 0) {
            return Err(HandshakeError::PskRequiredButMissing);
        }
        Ok(Self {
            config,
            state: HandshakeState::Idle,
            role: None,
            keypair: EphemeralKeypair::generate(),
            shared: None,
            transcript: Vec::new(),
            outbound: VecDeque::new(),
            outcome: None,
            last_error: None,
        })
    }

    pub fn state(&self) -> HandshakeState {
        self.state
    }

    pub fn role(&self) -> Option<Role> {
        self.role
    }

    pub fn last_error(&self) -> Option<&HandshakeError> {
        self.last_error.as_ref()
    }

    /// Queued envelopes waiting to be wrapped into handshake datagrams.
    pub fn take_outbound(&mut self) -> Vec<(HandshakeStage, Vec<u8>)> {
        self.outbound.drain(..).collect()
    }

    /// Moves the derived keys out after completion.
    pub fn take_outcome(&mut self) -> Option<HandshakeOutcome> {
        self.outcome.take()
    }

    /// Starts the exchange as initiator by queueing INIT.
    pub fn initiate(&mut self, now_secs: u64) -> Result<(), HandshakeError> {
        if self.state != HandshakeState::Idle {
            let err = HandshakeError::Internal("initiate outside IDLE");
            self.last_error = Some(err.clone());
            return Err(err);
        }

        let public = self.keypair.public_bytes();
        self.queue_message(MSG_INIT, HandshakeStage::Init, &public, now_secs);
        self.role = Some(Role::Initiator);
        self.state = HandshakeState::InitSent;
        Ok(())
    }

    /// Feeds one inbound envelope. Returns `Ok(true)` when the handshake
    /// just completed.
    pub fn process_message(
        &mut self,
        message: &[u8],
        now_secs: u64,
    ) -> Result<bool, HandshakeError> {
        // Checks run in fixed order: length, timestamp, HMAC, dispatch.
        if message.len() < ENVELOPE_HEADER_LEN + HMAC_LEN {
            return self.reject(HandshakeError::InvalidMessage);
        }

        let msg_type = message[0];
        let timestamp = u64::from_be_bytes(message[1..9].try_into().expect("length checked"));
        let payload_len =
            u16::from_be_bytes(message[9..11].try_into().expect("length checked")) as usize;

        if message.len() != ENVELOPE_HEADER_LEN + payload_len + HMAC_LEN {
            return self.reject(HandshakeError::InvalidMessage);
        }

        let skew = timestamp.abs_diff(now_secs);
        if skew > self.config.timestamp_tolerance_sec {
            return self.reject(HandshakeError::TimestampOutOfRange);
        }

        let hmac_offset = ENVELOPE_HEADER_LEN + payload_len;
        if hmac::verify(
            &self.config.psk,
            &message[..hmac_offset],
            &message[hmac_offset..],
        )
        .is_err()
        {
            return self.reject(HandshakeError::HmacVerificationFailed);
        }

        // Verified: the message joins the transcript even if dispatch
        // rejects it below.
        self.transcript.extend_from_slice(message);

        let payload = &message[ENVELOPE_HEADER_LEN..hmac_offset];
        match (msg_type, self.state) {
            (MSG_INIT, HandshakeState::Idle) => self.handle_init(payload, now_secs),
            (MSG_RESPONSE, HandshakeState::InitSent) => self.handle_response(payload, now_secs),
            (MSG_FINISH, HandshakeState::ResponseSent) => self.handle_finish(payload),
            _ => self.reject(HandshakeError::InvalidMessage),
        }
    }

    fn handle_init(&mut self, payload: &[u8], now_secs: u64) -> Result<bool, HandshakeError> {
        if payload.len() != PUBLIC_KEY_LEN {
            return self.reject(HandshakeError::InvalidMessage);
        }

        self.role = Some(Role::Responder);
        self.state = HandshakeState::InitReceived;

        let shared = match self.keypair.agree(payload) {
            Ok(shared) => shared,
            Err(err) => {
                debug!(error = %err, "handshake key exchange failed");
                return self.fail(HandshakeError::KeyExchangeFailed);
            }
        };
        self.shared = Some(shared);

        let public = self.keypair.public_bytes();
        self.queue_message(MSG_RESPONSE, HandshakeStage::Response, &public, now_secs);
        self.state = HandshakeState::ResponseSent;
        Ok(false)
    }

    fn handle_response(&mut self, payload: &[u8], now_secs: u64) -> Result<bool, HandshakeError> {
        if payload.len() != PUBLIC_KEY_LEN {
            return self.reject(HandshakeError::InvalidMessage);
        }

        let shared = match self.keypair.agree(payload) {
            Ok(shared) => shared,
            Err(err) => {
                debug!(error = %err, "handshake key exchange failed");
                return self.fail(HandshakeError::KeyExchangeFailed);
            }
        };
        self.shared = Some(shared);

        // FINISH carries no payload; it exists to close the transcript.
        self.queue_message(MSG_FINISH, HandshakeStage::Finish, &[], now_secs);
        self.complete()
    }

    fn handle_finish(&mut self, _payload: &[u8]) -> Result<bool, HandshakeError> {
        self.complete()
    }

    fn complete(&mut self) -> Result<bool, HandshakeError> {
        let role = match self.role {
            Some(role) => role,
            None => return self.fail(HandshakeError::Internal("completing without a role")),
        };
        let shared = match self.shared.take() {
            Some(shared) => shared,
            None => return self.fail(HandshakeError::Internal("completing without a secret")),
        };

        let session_id: [u8; SESSION_ID_LEN] = hmac::compute(&self.config.psk, &self.transcript);
        let keys = hkdf::derive_session_keys(&shared, &session_id, role == Role::Initiator)
            .map_err(|_| HandshakeError::Internal("session key derivation failed"))?;

        let short_id = u64::from_be_bytes(session_id[..8].try_into().expect("length checked"));

        self.outcome = Some(HandshakeOutcome {
            session_id,
            short_id,
            role,
            keys,
        });
        self.state = HandshakeState::Complete;
        Ok(true)
    }

    fn queue_message(&mut self, msg_type: u8, stage: HandshakeStage, payload: &[u8], now_secs: u64) {
        let mut msg = Vec::with_capacity(ENVELOPE_HEADER_LEN + payload.len() + HMAC_LEN);
        msg.push(msg_type);
        msg.extend_from_slice(&now_secs.to_be_bytes());
        msg.extend_from_slice(&(payload.len() as u16).to_be_bytes());
        msg.extend_from_slice(payload);

        let tag = hmac::compute(&self.config.psk, &msg);
        msg.extend_from_slice(&tag);

        self.transcript.extend_from_slice(&msg);
        self.outbound.push_back((stage, msg));
    }

    fn reject(&mut self, error: HandshakeError) -> Result<bool, HandshakeError> {
        self.last_error = Some(error.clone());
        Err(error)
    }

    fn fail(&mut self, error: HandshakeError) -> Result<bool, HandshakeError> {
        self.state = HandshakeState::Failed;
        self.last_error = Some(error.clone());
        Err(error)
    }

    /// Back to IDLE with a fresh ephemeral keypair and an empty transcript.
    pub fn reset(&mut self) {
        self.state = HandshakeState::Idle;
        self.role = None;
        self.keypair = EphemeralKeypair::generate();
        self.shared = None;
        self.transcript.zeroize();
        self.transcript.clear();
        self.outbound.clear();
        self.outcome = None;
        self.last_error = None;
    }
}

#[derive(Debug)]
struct GateBucket {
    tokens: f64,
    last_refill_ms: u64,
}

/// Token-bucket gate over inbound INIT messages, keyed by peer address.
///
/// Capacity and refill both come from `max_handshake_attempts` per minute.
#[derive(Debug)]
pub struct InitGate {
    max_attempts: u32,
    buckets: AHashMap<SocketAddr, GateBucket>,
}

const GATE_WINDOW_MS: u64 = 60_000;
const GATE_MAX_TRACKED: usize = 1024;

impl InitGate {
    pub fn new(max_attempts: u32) -> Self {
        Self {
            max_attempts: max_attempts.max(1),
            buckets: AHashMap::default(),
        }
    }

    /// Admits or refuses an INIT from `peer`.
    pub fn allow(&mut self, peer: SocketAddr, now_ms: u64) -> bool {
        if self.buckets.len() >= GATE_MAX_TRACKED && !self.buckets.contains_key(&peer) {
            self.buckets
                .retain(|_, bucket| now_ms.saturating_sub(bucket.last_refill_ms) < GATE_WINDOW_MS);
        }

        let max = f64::from(self.max_attempts);
        let bucket = self.buckets.entry(peer).or_insert(GateBucket {
            tokens: max,
            last_refill_ms: now_ms,
        });

        let elapsed = now_ms.saturating_sub(bucket.last_refill_ms);
        if elapsed > 0 {
            bucket.tokens = (bucket.tokens + max * elapsed as f64 / GATE_WINDOW_MS as f64).min(max);
            bucket.last_refill_ms = now_ms;
        }

        if bucket.tokens >= 1.0 {
            bucket.tokens -= 1.0;
            true
        } else {
            false
        }
    }
}

// Veilport public library surface.
// Numan Thabit 2025

pub mod config;

pub mod clock;

pub mod crypto;

pub mod frame;

pub mod packet;

pub mod handshake;

pub mod mux;

pub mod session;

pub mod io;

pub mod metrics;

pub use config::{Config, ConfigError, NetworkConfig, SecurityConfig, MAX_MTU, MIN_MTU};

pub use clock::Clock;

pub use crypto::{
    aead::{self, make_nonce, AeadError, KEY_LEN as AEAD_KEY_LEN, NONCE_LEN, TAG_LEN},
    hkdf::{derive_session_keys, HkdfError, SessionKeys},
    hmac::{compute as hmac_sha256, verify as hmac_verify, HmacError, HMAC_LEN},
    keys::{
        constant_time_equal, fill_random, EphemeralKeypair, KeyExchangeError, SharedSecret,
        PUBLIC_KEY_LEN,
    },
};

pub use frame::{ControlKind, Frame, FrameError, FrameType, HandshakeStage, FRAME_HEADER_LEN};

pub use packet::{
    build_handshake_datagram, parse_handshake_datagram, PacketBuilder, PacketError, PacketHeader,
    PacketParser, ParsedPacket, MIN_PACKET_LEN, PACKET_HEADER_LEN,
};

pub use handshake::{
    Handshake, HandshakeConfig, HandshakeError, HandshakeOutcome, HandshakeState, InitGate, Role,
    PSK_LEN, SESSION_ID_LEN,
};

pub use mux::{
    ack::{process_ack, AckTracker},
    fragment::{FragmentAssembler, FragmentConfig, FragmentError},
    rate::{RateLimiter, RateLimiterConfig},
    reorder::{ReorderBuffer, ReorderConfig},
    replay::ReplayWindow,
    retransmit::{RetransmissionManager, RetransmitConfig, TimeoutSweep},
    rotate::{RotationConfig, SessionRotator},
};

pub use session::{SessionError, SessionState, TransportSession, TransportStats};

pub use io::udp::{resolve, UdpConfig, UdpSocket};

pub use metrics::{Metrics, MetricsError};

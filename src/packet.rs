// Datagram codec: 16-byte header plus an AEAD-sealed frame stream.
// Numan Thabit 2025

use thiserror::Error;
use zeroize::Zeroizing;

use crate::crypto::aead::{self, KEY_LEN, NONCE_LEN, TAG_LEN};
use crate::frame::{self, Frame, FrameError, FrameType, HandshakeStage};

/// Packet header length: session id (8) + packet counter (8).
pub const PACKET_HEADER_LEN: usize = 16;

/// Smallest parseable session datagram: header plus AEAD tag.
pub const MIN_PACKET_LEN: usize = PACKET_HEADER_LEN + TAG_LEN;

/// Parsed packet header fields.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PacketHeader {
    pub session_id: u64,
    pub packet_counter: u64,
}

impl PacketHeader {
    pub fn encode(&self) -> [u8; PACKET_HEADER_LEN] {
        let mut buf = [0u8; PACKET_HEADER_LEN];
        buf[..8].copy_from_slice(&self.session_id.to_be_bytes());
        buf[8..].copy_from_slice(&self.packet_counter.to_be_bytes());
        buf
    }

    pub fn decode(data: &[u8]) -> Result<Self, PacketError> {
        if data.len() < PACKET_HEADER_LEN {
            return Err(PacketError::TooShort(data.len()));
        }
        Ok(Self {
            session_id: u64::from_be_bytes(data[..8].try_into().expect("length checked")),
            packet_counter: u64::from_be_bytes(data[8..16].try_into().expect("length checked")),
        })
    }
}

/// Packet codec errors.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum PacketError {
    /// Datagram shorter than header + tag.
    #[error("packet too short: {0} bytes")]
    TooShort(usize),
    /// Builder or parser used before keys were installed.
    #[error("no session key configured")]
    MissingKey,
    /// Builder invoked with an empty frame buffer.
    #[error("packet payload is empty")]
    EmptyPayload,
    /// Adding the frame would exceed the MTU budget.
    #[error("frame of {needed} bytes exceeds remaining capacity {remaining}")]
    CapacityExceeded { needed: usize, remaining: usize },
    /// AEAD authentication failed.
    #[error("decryption failed")]
    DecryptionFailed,
    /// Sealing failed (should not occur with valid keys).
    #[error("encryption failed")]
    EncryptionFailed,
    /// Frame stream inside the plaintext was malformed.
    #[error("invalid frame: {0}")]
    InvalidFrame(#[from] FrameError),
    /// Handshake datagram did not carry exactly one HANDSHAKE frame.
    #[error("malformed handshake datagram")]
    MalformedHandshake,
}

/// Accumulates frames and seals them into a single datagram.
///
/// Frames are accepted until the next one would push the datagram past
/// `mtu`; `build` seals the buffer under the configured key and clears it.
pub struct PacketBuilder {
    mtu: usize,
    session_id: u64,
    key: Option<Zeroizing<[u8; KEY_LEN]>>,
    nonce_base: [u8; NONCE_LEN],
    buffer: Vec<u8>,
}

impl PacketBuilder {
    pub fn new(mtu: usize) -> Self {
        Self {
            mtu,
            session_id: 0,
            key: None,
            nonce_base: [0u8; NONCE_LEN],
            buffer: Vec::with_capacity(mtu.saturating_sub(PACKET_HEADER_LEN + TAG_LEN)),
        }
    }

    pub fn set_keys(&mut self, key: [u8; KEY_LEN], nonce_base: [u8; NONCE_LEN]) {
        self.key = Some(Zeroizing::new(key));
        self.nonce_base = nonce_base;
    }

    pub fn set_session_id(&mut self, session_id: u64) {
        self.session_id = session_id;
    }

    pub fn has_keys(&self) -> bool {
        self.key.is_some()
    }

    /// Payload bytes still available before the MTU budget is exhausted.
    pub fn remaining_capacity(&self) -> usize {
        let overhead = PACKET_HEADER_LEN + TAG_LEN;
        self.mtu
            .saturating_sub(overhead)
            .saturating_sub(self.buffer.len())
    }

    pub fn is_empty(&self) -> bool {
        self.buffer.is_empty()
    }

    pub fn add_frame(&mut self, frame: &Frame) -> Result<(), PacketError> {
        let needed = frame.encoded_len();
        let remaining = self.remaining_capacity();
        if needed > remaining {
            return Err(PacketError::CapacityExceeded { needed, remaining });
        }
        frame.encode_into(&mut self.buffer)?;
        Ok(())
    }

    /// Seals the buffered frames into a complete datagram.
    pub fn build(&mut self, packet_counter: u64) -> Result<Vec<u8>, PacketError> {
        if self.buffer.is_empty() {
            return Err(PacketError::EmptyPayload);
        }
        let key = self.key.as_ref().ok_or(PacketError::MissingKey)?;

        let header = PacketHeader {
            session_id: self.session_id,
            packet_counter,
        }
        .encode();

        let nonce = aead::make_nonce(&self.nonce_base, packet_counter);
        let sealed = aead::seal(key, &nonce, &header, &self.buffer)
            .map_err(|_| PacketError::EncryptionFailed)?;

        let mut packet = Vec::with_capacity(PACKET_HEADER_LEN + sealed.len());
        packet.extend_from_slice(&header);
        packet.extend_from_slice(&sealed);

        self.buffer.clear();
        Ok(packet)
    }

    pub fn clear(&mut self) {
        self.buffer.clear();
    }
}

/// A fully parsed and authenticated datagram.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ParsedPacket {
    pub session_id: u64,
    pub packet_counter: u64,
    pub frames: Vec<Frame>,
}

/// Opens sealed datagrams and decodes the frame stream.
pub struct PacketParser {
    key: Option<Zeroizing<[u8; KEY_LEN]>>,
    nonce_base: [u8; NONCE_LEN],
}

impl PacketParser {
    pub fn new() -> Self {
        Self {
            key: None,
            nonce_base: [0u8; NONCE_LEN],
        }
    }

    pub fn set_keys(&mut self, key: [u8; KEY_LEN], nonce_base: [u8; NONCE_LEN]) {
        self.key = Some(Zeroizing::new(key));
        self.nonce_base = nonce_base;
    }

    pub fn has_keys(&self) -> bool {
        self.key.is_some()
    }

    pub fn parse(&self, data: &[u8]) -> Result<ParsedPacket, PacketError> {
        if data.len() < MIN_PACKET_LEN {
            return Err(PacketError::TooShort(data.len()));
        }

        let header = PacketHeader::decode(data)?;
        let key = self.key.as_ref().ok_or(PacketError::MissingKey)?;

        let nonce = aead::make_nonce(&self.nonce_base, header.packet_counter);
        let aad = &data[..PACKET_HEADER_LEN];
        let plaintext = aead::open(key, &nonce, aad, &data[PACKET_HEADER_LEN..])
            .map_err(|_| PacketError::DecryptionFailed)?;

        let frames = frame::decode_all(&plaintext)?;

        Ok(ParsedPacket {
            session_id: header.session_id,
            packet_counter: header.packet_counter,
            frames,
        })
    }
}

impl Default for PacketParser {
    fn default() -> Self {
        Self::new()
    }
}

/// Builds the pre-key handshake datagram: zero session id, zero counter, a
/// single plaintext HANDSHAKE frame, no AEAD tag.
pub fn build_handshake_datagram(
    stage: HandshakeStage,
    envelope: &[u8],
) -> Result<Vec<u8>, PacketError> {
    let frame = Frame::Handshake {
        stage,
        envelope: bytes::Bytes::copy_from_slice(envelope),
    };
    let mut out = Vec::with_capacity(PACKET_HEADER_LEN + frame.encoded_len());
    out.extend_from_slice(
        &PacketHeader {
            session_id: 0,
            packet_counter: 0,
        }
        .encode(),
    );
    frame.encode_into(&mut out)?;
    Ok(out)
}

/// Parses a handshake datagram, returning its single HANDSHAKE frame.
///
/// A zero short id marks the datagram as pre-session; anything else, extra
/// frames, or a non-handshake frame is rejected.
pub fn parse_handshake_datagram(data: &[u8]) -> Result<Frame, PacketError> {
    let header = PacketHeader::decode(data)?;
    if header.session_id != 0 || header.packet_counter != 0 {
        return Err(PacketError::MalformedHandshake);
    }

    let frames = frame::decode_all(&data[PACKET_HEADER_LEN..])?;
    if frames.len() != 1 {
        return Err(PacketError::MalformedHandshake);
    }
    let frame = frames.into_iter().next().expect("length checked");
    if frame.frame_type() != FrameType::Handshake {
        return Err(PacketError::MalformedHandshake);
    }
    Ok(frame)
}

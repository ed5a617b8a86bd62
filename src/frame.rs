// Typed frames carried inside packet payloads.
// Numan Thabit 2025

use std::convert::TryFrom;

use bytes::Bytes;
use thiserror::Error;

/// Frame header length: type(1) + flags(1) + payload_len(2).
pub const FRAME_HEADER_LEN: usize = 4;

/// Fixed part of a DATA frame payload (sequence number).
pub const DATA_OVERHEAD: usize = 8;

/// Fixed part of a FRAGMENT frame payload (message id + index + total).
pub const FRAGMENT_OVERHEAD: usize = 8;

const ACK_PAYLOAD_LEN: usize = 20;
const CONTROL_OVERHEAD: usize = 9;
const SESSION_ROTATE_PAYLOAD_LEN: usize = 40;

/// Wire identifiers for the frame variants.
#[repr(u8)]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum FrameType {
    Data = 0x01,
    Ack = 0x02,
    Control = 0x03,
    Fragment = 0x04,
    Handshake = 0x10,
    SessionRotate = 0x20,
}

impl TryFrom<u8> for FrameType {
    type Error = FrameError;

    fn try_from(value: u8) -> Result<Self, Self::Error> {
        match value {
            0x01 => Ok(FrameType::Data),
            0x02 => Ok(FrameType::Ack),
            0x03 => Ok(FrameType::Control),
            0x04 => Ok(FrameType::Fragment),
            0x10 => Ok(FrameType::Handshake),
            0x20 => Ok(FrameType::SessionRotate),
            other => Err(FrameError::UnknownType(other)),
        }
    }
}

/// Control frame subtypes.
#[repr(u8)]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ControlKind {
    Ping = 0x01,
    Pong = 0x02,
    Close = 0x03,
    Reset = 0x04,
}

impl TryFrom<u8> for ControlKind {
    type Error = FrameError;

    fn try_from(value: u8) -> Result<Self, Self::Error> {
        match value {
            0x01 => Ok(ControlKind::Ping),
            0x02 => Ok(ControlKind::Pong),
            0x03 => Ok(ControlKind::Close),
            0x04 => Ok(ControlKind::Reset),
            other => Err(FrameError::UnknownControl(other)),
        }
    }
}

/// Handshake stages carried in HANDSHAKE frames.
#[repr(u8)]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HandshakeStage {
    Init = 0x01,
    Response = 0x02,
    Finish = 0x03,
}

impl TryFrom<u8> for HandshakeStage {
    type Error = FrameError;

    fn try_from(value: u8) -> Result<Self, Self::Error> {
        match value {
            0x01 => Ok(HandshakeStage::Init),
            0x02 => Ok(HandshakeStage::Response),
            0x03 => Ok(HandshakeStage::Finish),
            other => Err(FrameError::UnknownStage(other)),
        }
    }
}

/// Frame decode errors.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum FrameError {
    /// Fewer than four bytes remained for a frame header.
    #[error("frame header truncated at {0} bytes")]
    HeaderTruncated(usize),
    /// Unknown frame type byte.
    #[error("unknown frame type {0:#04x}")]
    UnknownType(u8),
    /// Declared payload length runs past the buffer.
    #[error("frame payload length {declared} exceeds remaining {available} bytes")]
    PayloadOverrun { declared: usize, available: usize },
    /// Payload shorter than the variant's fixed fields.
    #[error("{kind} frame payload too short: {len} bytes")]
    PayloadTooShort { kind: &'static str, len: usize },
    /// Unknown control subtype byte.
    #[error("unknown control subtype {0:#04x}")]
    UnknownControl(u8),
    /// Unknown handshake stage byte.
    #[error("unknown handshake stage {0:#04x}")]
    UnknownStage(u8),
    /// Frame payload would not fit the 16-bit length field.
    #[error("frame payload {0} bytes exceeds the u16 length field")]
    PayloadTooLong(usize),
}

/// A decoded protocol frame.
///
/// The wire admits six shapes; the receiver dispatches on this sum type, so
/// adding a variant means extending the tag table and the dispatcher only.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Frame {
    Data {
        sequence: u64,
        payload: Bytes,
    },
    Ack {
        ack_number: u64,
        sack_bitmap: u64,
        recv_window: u32,
    },
    Control {
        kind: ControlKind,
        timestamp_ms: u64,
        data: Bytes,
    },
    Fragment {
        message_id: u32,
        index: u16,
        total: u16,
        chunk: Bytes,
    },
    Handshake {
        stage: HandshakeStage,
        envelope: Bytes,
    },
    SessionRotate {
        new_session_id: [u8; 32],
        activation_sequence: u64,
    },
}

impl Frame {
    pub fn frame_type(&self) -> FrameType {
        match self {
            Frame::Data { .. } => FrameType::Data,
            Frame::Ack { .. } => FrameType::Ack,
            Frame::Control { .. } => FrameType::Control,
            Frame::Fragment { .. } => FrameType::Fragment,
            Frame::Handshake { .. } => FrameType::Handshake,
            Frame::SessionRotate { .. } => FrameType::SessionRotate,
        }
    }

    fn payload_len(&self) -> usize {
        match self {
            Frame::Data { payload, .. } => DATA_OVERHEAD + payload.len(),
            Frame::Ack { .. } => ACK_PAYLOAD_LEN,
            Frame::Control { data, .. } => CONTROL_OVERHEAD + data.len(),
            Frame::Fragment { chunk, .. } => FRAGMENT_OVERHEAD + chunk.len(),
            Frame::Handshake { envelope, .. } => 1 + envelope.len(),
            Frame::SessionRotate { .. } => SESSION_ROTATE_PAYLOAD_LEN,
        }
    }

    /// Total encoded size, header included.
    pub fn encoded_len(&self) -> usize {
        FRAME_HEADER_LEN + self.payload_len()
    }

    /// Appends the encoded frame to `out`.
    pub fn encode_into(&self, out: &mut Vec<u8>) -> Result<(), FrameError> {
        let payload_len = self.payload_len();
        if payload_len > u16::MAX as usize {
            return Err(FrameError::PayloadTooLong(payload_len));
        }

        out.push(self.frame_type() as u8);
        out.push(0); // flags, reserved
        out.extend_from_slice(&(payload_len as u16).to_be_bytes());

        match self {
            Frame::Data { sequence, payload } => {
                out.extend_from_slice(&sequence.to_be_bytes());
                out.extend_from_slice(payload);
            }
            Frame::Ack {
                ack_number,
                sack_bitmap,
                recv_window,
            } => {
                out.extend_from_slice(&ack_number.to_be_bytes());
                out.extend_from_slice(&sack_bitmap.to_be_bytes());
                out.extend_from_slice(&recv_window.to_be_bytes());
            }
            Frame::Control {
                kind,
                timestamp_ms,
                data,
            } => {
                out.push(*kind as u8);
                out.extend_from_slice(&timestamp_ms.to_be_bytes());
                out.extend_from_slice(data);
            }
            Frame::Fragment {
                message_id,
                index,
                total,
                chunk,
            } => {
                out.extend_from_slice(&message_id.to_be_bytes());
                out.extend_from_slice(&index.to_be_bytes());
                out.extend_from_slice(&total.to_be_bytes());
                out.extend_from_slice(chunk);
            }
            Frame::Handshake { stage, envelope } => {
                out.push(*stage as u8);
                out.extend_from_slice(envelope);
            }
            Frame::SessionRotate {
                new_session_id,
                activation_sequence,
            } => {
                out.extend_from_slice(new_session_id);
                out.extend_from_slice(&activation_sequence.to_be_bytes());
            }
        }

        Ok(())
    }

    pub fn encode(&self) -> Result<Vec<u8>, FrameError> {
        let mut out = Vec::with_capacity(self.encoded_len());
        self.encode_into(&mut out)?;
        Ok(out)
    }
}

fn read_u64(buf: &[u8]) -> u64 {
    u64::from_be_bytes(buf[..8].try_into().expect("slice length checked"))
}

fn read_u32(buf: &[u8]) -> u32 {
    u32::from_be_bytes(buf[..4].try_into().expect("slice length checked"))
}

fn read_u16(buf: &[u8]) -> u16 {
    u16::from_be_bytes(buf[..2].try_into().expect("slice length checked"))
}

/// Decodes a single frame from the front of `buf`.
///
/// Returns the frame and the number of bytes consumed. Fixed-size variants
/// tolerate payloads longer than their known fields so that future revisions
/// can append data without breaking old parsers.
pub fn decode(buf: &[u8]) -> Result<(Frame, usize), FrameError> {
    if buf.len() < FRAME_HEADER_LEN {
        return Err(FrameError::HeaderTruncated(buf.len()));
    }

    let frame_type = FrameType::try_from(buf[0])?;
    let declared = read_u16(&buf[2..]) as usize;
    let available = buf.len() - FRAME_HEADER_LEN;
    if declared > available {
        return Err(FrameError::PayloadOverrun {
            declared,
            available,
        });
    }

    let payload = &buf[FRAME_HEADER_LEN..FRAME_HEADER_LEN + declared];
    let consumed = FRAME_HEADER_LEN + declared;

    let frame = match frame_type {
        FrameType::Data => {
            if payload.len() < DATA_OVERHEAD {
                return Err(FrameError::PayloadTooShort {
                    kind: "data",
                    len: payload.len(),
                });
            }
            Frame::Data {
                sequence: read_u64(payload),
                payload: Bytes::copy_from_slice(&payload[DATA_OVERHEAD..]),
            }
        }
        FrameType::Ack => {
            if payload.len() < ACK_PAYLOAD_LEN {
                return Err(FrameError::PayloadTooShort {
                    kind: "ack",
                    len: payload.len(),
                });
            }
            Frame::Ack {
                ack_number: read_u64(payload),
                sack_bitmap: read_u64(&payload[8..]),
                recv_window: read_u32(&payload[16..]),
            }
        }
        FrameType::Control => {
            if payload.len() < CONTROL_OVERHEAD {
                return Err(FrameError::PayloadTooShort {
                    kind: "control",
                    len: payload.len(),
                });
            }
            Frame::Control {
                kind: ControlKind::try_from(payload[0])?,
                timestamp_ms: read_u64(&payload[1..]),
                data: Bytes::copy_from_slice(&payload[CONTROL_OVERHEAD..]),
            }
        }
        FrameType::Fragment => {
            if payload.len() < FRAGMENT_OVERHEAD {
                return Err(FrameError::PayloadTooShort {
                    kind: "fragment",
                    len: payload.len(),
                });
            }
            Frame::Fragment {
                message_id: read_u32(payload),
                index: read_u16(&payload[4..]),
                total: read_u16(&payload[6..]),
                chunk: Bytes::copy_from_slice(&payload[FRAGMENT_OVERHEAD..]),
            }
        }
        FrameType::Handshake => {
            if payload.is_empty() {
                return Err(FrameError::PayloadTooShort {
                    kind: "handshake",
                    len: 0,
                });
            }
            Frame::Handshake {
                stage: HandshakeStage::try_from(payload[0])?,
                envelope: Bytes::copy_from_slice(&payload[1..]),
            }
        }
        FrameType::SessionRotate => {
            if payload.len() < SESSION_ROTATE_PAYLOAD_LEN {
                return Err(FrameError::PayloadTooShort {
                    kind: "session_rotate",
                    len: payload.len(),
                });
            }
            let mut new_session_id = [0u8; 32];
            new_session_id.copy_from_slice(&payload[..32]);
            Frame::SessionRotate {
                new_session_id,
                activation_sequence: read_u64(&payload[32..]),
            }
        }
    };

    Ok((frame, consumed))
}

/// Decodes every frame in `buf`, rejecting trailing garbage.
pub fn decode_all(buf: &[u8]) -> Result<Vec<Frame>, FrameError> {
    let mut frames = Vec::new();
    let mut rest = buf;
    while !rest.is_empty() {
        let (frame, consumed) = decode(rest)?;
        frames.push(frame);
        rest = &rest[consumed..];
    }
    Ok(frames)
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    fn sample_frames() -> Vec<Frame> {
        vec![
            Frame::Data {
                sequence: 42,
                payload: Bytes::from_static(b"payload bytes"),
            },
            Frame::Ack {
                ack_number: 7,
                sack_bitmap: 0b1011,
                recv_window: 256,
            },
            Frame::Control {
                kind: ControlKind::Ping,
                timestamp_ms: 123_456,
                data: Bytes::new(),
            },
            Frame::Fragment {
                message_id: 9,
                index: 2,
                total: 5,
                chunk: Bytes::from_static(b"chunk"),
            },
            Frame::Handshake {
                stage: HandshakeStage::Init,
                envelope: Bytes::from_static(b"envelope"),
            },
            Frame::SessionRotate {
                new_session_id: [0xCD; 32],
                activation_sequence: 1000,
            },
        ]
    }

    #[test]
    fn each_variant_round_trips() {
        for frame in sample_frames() {
            let encoded = frame.encode().expect("encode");
            assert_eq!(encoded.len(), frame.encoded_len());
            let (decoded, consumed) = decode(&encoded).expect("decode");
            assert_eq!(consumed, encoded.len());
            assert_eq!(decoded, frame);
        }
    }

    #[test]
    fn stream_round_trips() {
        let frames = sample_frames();
        let mut buf = Vec::new();
        for frame in &frames {
            frame.encode_into(&mut buf).unwrap();
        }
        assert_eq!(decode_all(&buf).unwrap(), frames);
    }

    #[test]
    fn rejects_unknown_type() {
        let buf = [0x7Fu8, 0, 0, 0];
        assert_eq!(decode(&buf), Err(FrameError::UnknownType(0x7F)));
    }

    #[test]
    fn rejects_payload_overrun() {
        // Declares 10 payload bytes but carries 2.
        let buf = [0x01u8, 0, 0, 10, 0xAA, 0xBB];
        assert_eq!(
            decode(&buf),
            Err(FrameError::PayloadOverrun {
                declared: 10,
                available: 2,
            })
        );
    }

    #[test]
    fn rejects_trailing_garbage() {
        let mut buf = Frame::Ack {
            ack_number: 1,
            sack_bitmap: 0,
            recv_window: 16,
        }
        .encode()
        .unwrap();
        buf.push(0xEE);
        assert!(decode_all(&buf).is_err());
    }

    #[test]
    fn rejects_short_data_payload() {
        // DATA frame whose payload is shorter than the sequence field.
        let buf = [0x01u8, 0, 0, 4, 1, 2, 3, 4];
        assert_eq!(
            decode(&buf),
            Err(FrameError::PayloadTooShort {
                kind: "data",
                len: 4,
            })
        );
    }

    #[test]
    fn rejects_unknown_control_subtype() {
        let frame = Frame::Control {
            kind: ControlKind::Ping,
            timestamp_ms: 0,
            data: Bytes::new(),
        };
        let mut buf = frame.encode().unwrap();
        buf[FRAME_HEADER_LEN] = 0x99;
        assert_eq!(decode(&buf), Err(FrameError::UnknownControl(0x99)));
    }

    proptest! {
        #[test]
        fn data_frame_round_trip(
            sequence in any::<u64>(),
            payload in prop::collection::vec(any::<u8>(), 0..1024)
        ) {
            let frame = Frame::Data {
                sequence,
                payload: Bytes::from(payload),
            };
            let encoded = frame.encode().unwrap();
            let (decoded, consumed) = decode(&encoded).unwrap();
            prop_assert_eq!(consumed, encoded.len());
            prop_assert_eq!(decoded, frame);
        }

        #[test]
        fn decode_never_panics(bytes in prop::collection::vec(any::<u8>(), 0..256)) {
            let _ = decode_all(&bytes);
        }
    }
}

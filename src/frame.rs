// Copyright (C) 2026 Brian Johnson
//
// This program is free software; you can redistribute it and/or modify
// it under the terms of the GNU General Public License as published by
// the Free Software Foundation; either version 2 of the License, or
// (at your option) any later version.
//
// This program is distributed in the hope that it will be useful,
// but WITHOUT ANY WARRANTY; without even the implied warranty of
// MERCHANTABILITY or FITNESS FOR A PARTICULAR PURPOSE.  See the
// GNU General Public License for more details.
//
// You should have received a copy of the GNU General Public License along
// with this program; if not, write to the Free Software Foundation, Inc.,
// 51 Franklin Street, Fifth Floor, Boston, MA 02110-1301 USA.

//! Frame codec.
//!
//! ```text
//! offset  size  field
//! 0       2     preamble 0x12 0x34
//! 2       2     operation id
//! 4       2     frame length (whole frame)
//! 6       2     chunk index (1-based)
//! 8       2     chunk count
//! 10      1     kind
//! 11      2     payload length
//! 13      N     payload
//! 13+N    4     CRC-32, computed with these four bytes zeroed
//! ```
//!
//! All integers are little-endian.

use thiserror::Error;
use crate::protocol::*;

// ============================================================================
// Error Types
// ============================================================================

#[derive(Debug, Error, PartialEq, Eq)]
pub enum FrameError {
    #[error("invalid preamble {0:02X?}")]
    InvalidPreamble([u8; 2]),

    #[error("frame declares {declared} bytes but {actual} were received")]
    LengthMismatch { declared: usize, actual: usize },

    #[error("frame of {0} bytes is too short to hold a header and checksum")]
    Truncated(usize),

    #[error("payload length {payload_length} does not fill a {frame_length}-byte frame")]
    TrailingData { payload_length: usize, frame_length: usize },

    #[error("checksum mismatch: frame carries 0x{stored:08X}, computed 0x{computed:08X}")]
    ChecksumMismatch { stored: u32, computed: u32 },

    #[error("unsupported message type 0x{0:02X}")]
    UnsupportedMessageType(u8),

    #[error("payload of {0} bytes exceeds the {max}-byte chunk limit", max = MAX_CHUNK_PAYLOAD)]
    PayloadTooLarge(usize),

    #[error("invalid frame: {0}")]
    InvalidFrame(&'static str),
}

// ============================================================================
// Frame
// ============================================================================

/// One decoded chunk of a logical operation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Frame {
    pub operation_id: u16,
    pub chunk_index: u16,
    pub chunk_count: u16,
    pub kind: MessageKind,
    pub payload: Vec<u8>,
}

/// Everything but the payload, kept by an operation for its last sent and
/// received frames.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FrameHeader {
    pub operation_id: u16,
    pub chunk_index: u16,
    pub chunk_count: u16,
    pub kind: MessageKind,
}

impl Frame {
    pub fn is_last(&self) -> bool {
        self.chunk_index == self.chunk_count
    }

    pub fn header(&self) -> FrameHeader {
        FrameHeader {
            operation_id: self.operation_id,
            chunk_index: self.chunk_index,
            chunk_count: self.chunk_count,
            kind: self.kind,
        }
    }

    pub fn encode(&self) -> Result<Vec<u8>, FrameError> {
        encode(
            self.kind,
            self.operation_id,
            self.chunk_index,
            self.chunk_count,
            &self.payload,
        )
    }
}

/// Lay out one frame and seal it with its checksum.
pub fn encode(
    kind: MessageKind,
    operation_id: u16,
    chunk_index: u16,
    chunk_count: u16,
    payload: &[u8],
) -> Result<Vec<u8>, FrameError> {
    if operation_id == 0 {
        return Err(FrameError::InvalidFrame("operation id must be non-zero"));
    }
    if chunk_index == 0 {
        return Err(FrameError::InvalidFrame("chunk index must be non-zero"));
    }
    if chunk_count == 0 {
        return Err(FrameError::InvalidFrame("chunk count must be non-zero"));
    }
    if payload.len() > MAX_CHUNK_PAYLOAD {
        return Err(FrameError::PayloadTooLarge(payload.len()));
    }

    let mut bytes = Vec::with_capacity(MIN_FRAME_LEN + payload.len());
    bytes.extend_from_slice(&PREAMBLE);
    bytes.extend_from_slice(&operation_id.to_le_bytes());
    // Frame length, patched once the layout is complete
    bytes.extend_from_slice(&[0, 0]);
    bytes.extend_from_slice(&chunk_index.to_le_bytes());
    bytes.extend_from_slice(&chunk_count.to_le_bytes());
    bytes.push(kind.as_byte());
    bytes.extend_from_slice(&(payload.len() as u16).to_le_bytes());
    bytes.extend_from_slice(payload);
    bytes.extend_from_slice(&[0, 0, 0, 0]);

    let frame_length = bytes.len() as u16;
    bytes[FRAME_LENGTH_OFFSET..FRAME_LENGTH_OFFSET + 2].copy_from_slice(&frame_length.to_le_bytes());

    let crc = crc32fast::hash(&bytes);
    let crc_offset = bytes.len() - CHECKSUM_LEN;
    bytes[crc_offset..].copy_from_slice(&crc.to_le_bytes());

    Ok(bytes)
}

/// Verify and unpack one complete frame.
pub fn decode(bytes: &[u8]) -> Result<Frame, FrameError> {
    if bytes.len() < PREAMBLE.len() || bytes[..2] != PREAMBLE {
        let mut seen = [0u8; 2];
        for (dst, src) in seen.iter_mut().zip(bytes) {
            *dst = *src;
        }
        return Err(FrameError::InvalidPreamble(seen));
    }

    if bytes.len() < LENGTH_PEEK {
        return Err(FrameError::Truncated(bytes.len()));
    }
    let declared = read_u16(bytes, FRAME_LENGTH_OFFSET) as usize;
    if declared != bytes.len() {
        return Err(FrameError::LengthMismatch {
            declared,
            actual: bytes.len(),
        });
    }
    if bytes.len() < MIN_FRAME_LEN {
        return Err(FrameError::Truncated(bytes.len()));
    }

    let operation_id = read_u16(bytes, 2);
    let chunk_index = read_u16(bytes, 6);
    let chunk_count = read_u16(bytes, 8);
    let kind_byte = bytes[10];
    let payload_length = read_u16(bytes, 11) as usize;

    if HEADER_LEN + payload_length + CHECKSUM_LEN != bytes.len() {
        return Err(FrameError::TrailingData {
            payload_length,
            frame_length: bytes.len(),
        });
    }

    let crc_offset = bytes.len() - CHECKSUM_LEN;
    let stored = u32::from_le_bytes([
        bytes[crc_offset],
        bytes[crc_offset + 1],
        bytes[crc_offset + 2],
        bytes[crc_offset + 3],
    ]);
    let mut hasher = crc32fast::Hasher::new();
    hasher.update(&bytes[..crc_offset]);
    hasher.update(&[0, 0, 0, 0]);
    let computed = hasher.finalize();
    if computed != stored {
        return Err(FrameError::ChecksumMismatch { stored, computed });
    }

    let kind = MessageKind::from_byte(kind_byte)
        .ok_or(FrameError::UnsupportedMessageType(kind_byte))?;
    if payload_length > MAX_CHUNK_PAYLOAD {
        return Err(FrameError::PayloadTooLarge(payload_length));
    }

    Ok(Frame {
        operation_id,
        chunk_index,
        chunk_count,
        kind,
        payload: bytes[HEADER_LEN..crc_offset].to_vec(),
    })
}

fn read_u16(bytes: &[u8], offset: usize) -> u16 {
    u16::from_le_bytes([bytes[offset], bytes[offset + 1]])
}

// ============================================================================
// Tests
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    fn kind_strategy() -> impl Strategy<Value = MessageKind> {
        (1u8..=6).prop_map(|b| MessageKind::from_byte(b).unwrap())
    }

    fn reseal(bytes: &mut [u8]) {
        let crc_offset = bytes.len() - CHECKSUM_LEN;
        bytes[crc_offset..].copy_from_slice(&[0, 0, 0, 0]);
        let crc = crc32fast::hash(bytes);
        bytes[crc_offset..].copy_from_slice(&crc.to_le_bytes());
    }

    #[test]
    fn test_encode_layout() {
        let bytes = encode(MessageKind::ListFilesRequest, 0x0102, 1, 3, b"abc").unwrap();

        assert_eq!(bytes.len(), MIN_FRAME_LEN + 3);
        assert_eq!(&bytes[0..2], &[0x12, 0x34]);
        assert_eq!(&bytes[2..4], &[0x02, 0x01]);
        assert_eq!(&bytes[4..6], &(20u16).to_le_bytes());
        assert_eq!(&bytes[6..8], &[1, 0]);
        assert_eq!(&bytes[8..10], &[3, 0]);
        assert_eq!(bytes[10], 0x05);
        assert_eq!(&bytes[11..13], &[3, 0]);
        assert_eq!(&bytes[13..16], b"abc");

        let mut zeroed = bytes.clone();
        zeroed[16..].copy_from_slice(&[0, 0, 0, 0]);
        assert_eq!(&bytes[16..], &crc32fast::hash(&zeroed).to_le_bytes());
    }

    #[test]
    fn test_encode_rejects_zero_fields() {
        assert!(matches!(
            encode(MessageKind::ListFilesRequest, 0, 1, 1, &[]),
            Err(FrameError::InvalidFrame(_))
        ));
        assert!(matches!(
            encode(MessageKind::ListFilesRequest, 1, 0, 1, &[]),
            Err(FrameError::InvalidFrame(_))
        ));
        assert!(matches!(
            encode(MessageKind::ListFilesRequest, 1, 1, 0, &[]),
            Err(FrameError::InvalidFrame(_))
        ));
        assert_eq!(
            encode(MessageKind::ListFilesRequest, 1, 1, 1, &[0u8; MAX_CHUNK_PAYLOAD + 1]),
            Err(FrameError::PayloadTooLarge(MAX_CHUNK_PAYLOAD + 1))
        );
    }

    #[test]
    fn test_decode_invalid_preamble() {
        let mut bytes = encode(MessageKind::SendFileResponse, 1, 1, 1, b"x").unwrap();
        bytes[0] = 0x13;
        assert_eq!(decode(&bytes), Err(FrameError::InvalidPreamble([0x13, 0x34])));
    }

    #[test]
    fn test_decode_length_mismatch() {
        let mut bytes = encode(MessageKind::SendFileResponse, 1, 1, 1, b"hello").unwrap();
        bytes.push(0);
        assert_eq!(
            decode(&bytes),
            Err(FrameError::LengthMismatch { declared: 22, actual: 23 })
        );

        bytes.truncate(10);
        assert!(matches!(decode(&bytes), Err(FrameError::LengthMismatch { .. })));
    }

    #[test]
    fn test_decode_trailing_data() {
        let mut bytes = encode(MessageKind::SendFileResponse, 1, 1, 1, b"hello").unwrap();
        // Claim a shorter payload than the frame holds
        bytes[11] = 3;
        reseal(&mut bytes);
        assert_eq!(
            decode(&bytes),
            Err(FrameError::TrailingData { payload_length: 3, frame_length: 22 })
        );
    }

    #[test]
    fn test_decode_checksum_mismatch() {
        let mut bytes = encode(MessageKind::SendFileResponse, 1, 1, 1, b"hello").unwrap();
        bytes[14] ^= 0x01;
        assert!(matches!(decode(&bytes), Err(FrameError::ChecksumMismatch { .. })));
    }

    #[test]
    fn test_decode_unsupported_kind() {
        let mut bytes = encode(MessageKind::SendFileResponse, 1, 1, 1, b"").unwrap();
        bytes[10] = 0x09;
        reseal(&mut bytes);
        assert_eq!(decode(&bytes), Err(FrameError::UnsupportedMessageType(0x09)));
    }

    proptest! {
        #[test]
        fn prop_round_trip(
            kind in kind_strategy(),
            operation_id in 1u16..,
            chunk_index in 1u16..,
            chunk_count in 1u16..,
            payload in proptest::collection::vec(any::<u8>(), 0..=MAX_CHUNK_PAYLOAD),
        ) {
            let bytes = encode(kind, operation_id, chunk_index, chunk_count, &payload).unwrap();
            prop_assert_eq!(bytes.len(), MIN_FRAME_LEN + payload.len());
            let frame = decode(&bytes).unwrap();
            prop_assert_eq!(frame, Frame { operation_id, chunk_index, chunk_count, kind, payload });
        }

        #[test]
        fn prop_single_bit_flip_detected(
            kind in kind_strategy(),
            operation_id in 1u16..,
            payload in proptest::collection::vec(any::<u8>(), 0..256),
            bit in any::<proptest::sample::Index>(),
        ) {
            let mut bytes = encode(kind, operation_id, 1, 1, &payload).unwrap();
            // Preamble and length flips are reported by their own checks
            let region = bytes.len() - LENGTH_PEEK;
            let bit = bit.index(region * 8);
            bytes[LENGTH_PEEK + bit / 8] ^= 1 << (bit % 8);

            match decode(&bytes) {
                Err(FrameError::ChecksumMismatch { .. }) | Err(FrameError::TrailingData { .. }) => {}
                other => prop_assert!(false, "corruption not detected: {:?}", other),
            }
        }
    }
}

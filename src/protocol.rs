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

//! Courier protocol constants

/// Start-of-frame marker
pub const PREAMBLE: [u8; 2] = [0x12, 0x34];

/// Bytes before the payload: preamble, operation id, frame length,
/// chunk index, chunk count, kind, payload length
pub const HEADER_LEN: usize = 13;

/// Trailing CRC-32
pub const CHECKSUM_LEN: usize = 4;

/// Smallest possible frame (empty payload)
pub const MIN_FRAME_LEN: usize = HEADER_LEN + CHECKSUM_LEN;

/// Maximum payload carried by a single frame
pub const MAX_CHUNK_PAYLOAD: usize = 2048;

/// Largest possible frame
pub const MAX_FRAME_LEN: usize = MIN_FRAME_LEN + MAX_CHUNK_PAYLOAD;

/// Bytes needed before the frame length can be read (preamble, operation id, frame length)
pub const LENGTH_PEEK: usize = 6;

/// Offset of the 16-bit frame length field
pub const FRAME_LENGTH_OFFSET: usize = 4;

/// Width of the little-endian count that prefixes a metadata block
pub const METADATA_PREFIX_LEN: usize = 4;

/// The closed set of frame kinds.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum MessageKind {
    SendFileRequest = 0x01,
    SendFileResponse = 0x02,
    ReceiveFileRequest = 0x03,
    ReceiveFileResponse = 0x04,
    ListFilesRequest = 0x05,
    ListFilesResponse = 0x06,
}

impl MessageKind {
    pub fn from_byte(byte: u8) -> Option<Self> {
        match byte {
            0x01 => Some(MessageKind::SendFileRequest),
            0x02 => Some(MessageKind::SendFileResponse),
            0x03 => Some(MessageKind::ReceiveFileRequest),
            0x04 => Some(MessageKind::ReceiveFileResponse),
            0x05 => Some(MessageKind::ListFilesRequest),
            0x06 => Some(MessageKind::ListFilesResponse),
            _ => None,
        }
    }

    pub fn as_byte(self) -> u8 {
        self as u8
    }

    /// The reply kind a responder must answer a request with.
    pub fn response_kind(self) -> Option<Self> {
        match self {
            MessageKind::SendFileRequest => Some(MessageKind::SendFileResponse),
            MessageKind::ReceiveFileRequest => Some(MessageKind::ReceiveFileResponse),
            MessageKind::ListFilesRequest => Some(MessageKind::ListFilesResponse),
            _ => None,
        }
    }
}

impl std::fmt::Display for MessageKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{:?}", self)
    }
}

/// Number of frames needed to carry `len` bytes. Never zero.
pub fn chunks_for(len: u64) -> u64 {
    len.div_ceil(MAX_CHUNK_PAYLOAD as u64).max(1)
}

// ============================================================================
// Tests
// ============================================================================

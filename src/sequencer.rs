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

//! State shared by both ends of an operation: the per-operation context,
//! chunk-count agreement, the exhaustion invariants, and the wire the
//! frames travel over.

use std::io::{self, Write};
use std::time::Duration;
use thiserror::Error;
use tracing::{debug, info_span, Span};
use crate::assembler::FrameAssembler;
use crate::frame::{Frame, FrameError, FrameHeader};
use crate::payload::PayloadStream;
use crate::protocol::*;
use crate::serial::{Link, LinkError};

// ============================================================================
// Error Types
// ============================================================================

#[derive(Debug, Error)]
pub enum SessionError {
    #[error("frame error: {0}")]
    Frame(#[from] FrameError),

    #[error("unexpected message type: expected {expected}, got {actual}")]
    UnexpectedMessageType { expected: MessageKind, actual: MessageKind },

    #[error("protocol violation: {0}")]
    ProtocolViolation(String),

    #[error("timed out waiting for the peer")]
    Timeout,

    #[error("link closed")]
    Disconnected,

    #[error("link I/O error: {0}")]
    Link(io::Error),

    #[error("an operation is already in progress")]
    Busy,

    #[error("no operation {0} is in progress")]
    UnknownOperation(u16),

    #[error("operation cancelled")]
    Cancelled,

    #[error("metadata block of {0} bytes does not fit in the first chunk")]
    MetadataTooLarge(usize),

    #[error("payload needs {0} chunks, more than a frame can count")]
    TooManyChunks(u64),

    #[error("I/O error: {0}")]
    Io(#[from] io::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
}

impl From<LinkError> for SessionError {
    fn from(err: LinkError) -> Self {
        match err {
            LinkError::Timeout => SessionError::Timeout,
            LinkError::Closed => SessionError::Disconnected,
            LinkError::Io(e) => SessionError::Link(e),
        }
    }
}

impl SessionError {
    /// Frame-level damage on the wire, as opposed to a sequencing fault.
    pub fn is_corruption(&self) -> bool {
        matches!(self, SessionError::Frame(_))
    }

    /// The link itself is gone; nothing more can be exchanged.
    pub fn is_link_down(&self) -> bool {
        matches!(self, SessionError::Disconnected | SessionError::Link(_))
    }
}

fn violation(msg: String) -> SessionError {
    SessionError::ProtocolViolation(msg)
}

// ============================================================================
// States
// ============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    Idle,
    AwaitingFirstFrame,
    Exchanging(u16),
    Complete,
    Failed,
}

// ============================================================================
// Chunk Count Agreement
// ============================================================================

fn to_count(chunks: u64) -> Result<u16, SessionError> {
    u16::try_from(chunks).map_err(|_| SessionError::TooManyChunks(chunks))
}

// ============================================================================
// Reassembly Sink
// ============================================================================

/// Where inbound chunk payloads accumulate.
pub enum Sink {
    Buffer(Vec<u8>),
    Writer(Box<dyn Write + Send>),
    Discard,
}

impl Sink {
    pub fn append(&mut self, bytes: &[u8]) -> io::Result<()> {
        match self {
            Sink::Buffer(buf) => buf.extend_from_slice(bytes),
            Sink::Writer(w) => w.write_all(bytes)?,
            Sink::Discard => {}
        }
        Ok(())
    }

    pub fn close(&mut self) -> io::Result<()> {
        if let Sink::Writer(w) = self {
            w.flush()?;
        }
        Ok(())
    }

    pub fn take_buffer(&mut self) -> Vec<u8> {
        match self {
            Sink::Buffer(buf) => std::mem::take(buf),
            _ => Vec::new(),
        }
    }
}

impl std::fmt::Debug for Sink {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Sink::Buffer(buf) => write!(f, "Buffer({} bytes)", buf.len()),
            Sink::Writer(_) => write!(f, "Writer"),
            Sink::Discard => write!(f, "Discard"),
        }
    }
}

// ============================================================================
// Operation Context
// ============================================================================

/// Everything one in-flight operation owns. Dropping it closes the
/// outbound stream and the sink.
#[derive(Debug)]
pub struct OperationContext {
    pub operation_id: u16,
    /// Request kind of the operation
    pub kind: MessageKind,
    /// Agreed count once the first round trip is done, tentative before
    pub chunk_count: u16,
    pub outbound: Option<FrameHeader>,
    pub inbound: Option<FrameHeader>,
    pub stream: PayloadStream,
    pub sink: Sink,
    own_chunks: u16,
    span: Span,
}

impl OperationContext {
    pub fn new(
        operation_id: u16,
        kind: MessageKind,
        stream: PayloadStream,
        sink: Sink,
    ) -> Result<Self, SessionError> {
        let own_chunks = to_count(stream.chunk_count())?;
        let span = info_span!("operation", id = operation_id, kind = %kind);
        Ok(OperationContext {
            operation_id,
            kind,
            chunk_count: own_chunks,
            outbound: None,
            inbound: None,
            stream,
            sink,
            own_chunks,
            span,
        })
    }

    pub fn span(&self) -> &Span {
        &self.span
    }

    /// Frames this side's own stream needs.
    pub fn own_chunks(&self) -> u16 {
        self.own_chunks
    }

    /// Responder: the agreed count is the larger of the two sides.
    pub fn agree(&mut self, request_chunks: u16) {
        self.chunk_count = self.own_chunks.max(request_chunks);
        debug!(
            request = request_chunks,
            response = self.own_chunks,
            agreed = self.chunk_count,
            "chunk count agreed"
        );
    }

    /// Initiator: adopt the peer's count, which may only grow ours.
    pub fn adopt(&mut self, peer_chunks: u16) -> Result<(), SessionError> {
        if peer_chunks < self.own_chunks {
            return Err(violation(format!(
                "peer agreed on {} chunks but this side needs {}",
                peer_chunks, self.own_chunks
            )));
        }
        self.chunk_count = peer_chunks;
        debug!(agreed = peer_chunks, "chunk count adopted");
        Ok(())
    }

    /// Chunk index the next inbound frame must carry. While a sent chunk
    /// is unanswered that is its reply, otherwise the chunk after the last
    /// one received.
    pub fn expected_inbound_index(&self) -> u16 {
        let sent = self.outbound.map_or(0, |h| h.chunk_index);
        let received = self.inbound.map_or(0, |h| h.chunk_index);
        if sent > received { sent } else { received + 1 }
    }

    /// Every frame after the first must carry the agreed count and belong
    /// to this operation.
    pub fn check_inbound(&self, frame: &Frame, expected_kind: MessageKind) -> Result<(), SessionError> {
        let expected_index = self.expected_inbound_index();
        if frame.kind != expected_kind {
            return Err(SessionError::UnexpectedMessageType {
                expected: expected_kind,
                actual: frame.kind,
            });
        }
        if frame.operation_id != self.operation_id {
            return Err(violation(format!(
                "frame for operation {} arrived during operation {}",
                frame.operation_id, self.operation_id
            )));
        }
        if frame.chunk_index != expected_index {
            return Err(violation(format!(
                "expected chunk {} but received chunk {}",
                expected_index, frame.chunk_index
            )));
        }
        Ok(())
    }

    pub fn check_agreed(&self, chunk_count: u16) -> Result<(), SessionError> {
        if chunk_count != self.chunk_count {
            return Err(violation(format!(
                "chunk count changed from {} to {}",
                self.chunk_count, chunk_count
            )));
        }
        Ok(())
    }

    /// Read the slice for `chunk_index` and enforce the exhaustion
    /// invariants against the current count.
    pub fn next_outbound(&mut self, chunk_index: u16) -> Result<Vec<u8>, SessionError> {
        if chunk_index == 0 || chunk_index > self.chunk_count {
            return Err(violation(format!(
                "chunk {} is outside a sequence of {}",
                chunk_index, self.chunk_count
            )));
        }

        let payload = self.stream.read_chunk(MAX_CHUNK_PAYLOAD)?;
        check_exhaustion(chunk_index, self.own_chunks, self.chunk_count, &self.stream)?;
        Ok(payload)
    }
}

/// The stream must not run dry before its own last chunk, and the final
/// chunk of the sequence must leave nothing unread.
pub fn check_exhaustion(
    chunk_index: u16,
    own_chunks: u16,
    chunk_count: u16,
    stream: &PayloadStream,
) -> Result<(), SessionError> {
    if stream.is_exhausted() && chunk_index < own_chunks {
        return Err(violation(format!(
            "content exhausted at chunk {} of {} after {} of {} bytes",
            chunk_index,
            chunk_count,
            stream.position(),
            stream.len()
        )));
    }
    if chunk_index == chunk_count && !stream.is_exhausted() {
        return Err(violation(format!(
            "final chunk {} leaves {} of {} bytes unread",
            chunk_index,
            stream.remaining(),
            stream.len()
        )));
    }
    Ok(())
}

// ============================================================================
// Wire
// ============================================================================

/// Session settings, built once at startup.
#[derive(Debug, Clone, Default)]
pub struct SessionConfig {
    /// How long to wait for the peer's next frame; `None` waits forever
    pub timeout: Option<Duration>,
}

/// A link plus the assembler that turns its bursts into frames.
pub struct Wire {
    link: Link,
    assembler: FrameAssembler,
    timeout: Option<Duration>,
}

impl Wire {
    pub fn new(link: Link, config: &SessionConfig) -> Self {
        Wire {
            link,
            assembler: FrameAssembler::new(),
            timeout: config.timeout,
        }
    }

    pub fn send(&mut self, frame: &Frame) -> Result<(), SessionError> {
        let bytes = frame.encode()?;
        debug!(
            kind = %frame.kind,
            index = frame.chunk_index,
            count = frame.chunk_count,
            payload = frame.payload.len(),
            "sent frame"
        );
        self.link.send(&bytes)?;
        Ok(())
    }

    pub fn receive(&mut self) -> Result<Frame, SessionError> {
        let frame = self.assembler.receive(&mut self.link, self.timeout)?;
        debug!(
            id = frame.operation_id,
            kind = %frame.kind,
            index = frame.chunk_index,
            count = frame.chunk_count,
            payload = frame.payload.len(),
            "received frame"
        );
        Ok(frame)
    }
}

// ============================================================================
// Tests
// ============================================================================

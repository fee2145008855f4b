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

use std::marker::PhantomData;
use tracing::{debug, info, warn, Span};
use crate::dispatch::{open_request, Outcome, ReplyAssembler, Request};
use crate::frame::Frame;
use crate::sequencer::*;
use crate::serial::Link;

// ============================================================================
// States
// ============================================================================

pub struct SendChunk;
pub struct AwaitReply;

// ============================================================================
// FSM Structure
// ============================================================================

pub struct InitiatorFsm<State> {
    state: PhantomData<State>,
    ctx: OperationContext,
    reply: ReplyAssembler,
    chunk_index: u16,
}

/// What one step of the FSM produced.
pub enum Step {
    /// Keep stepping within the same poll
    Continue(Box<dyn InitiatorState>),
    /// A round trip finished and more chunks remain
    Yield {
        next: Box<dyn InitiatorState>,
        chunk_index: u16,
        chunk_count: u16,
    },
    Done(Outcome),
}

// ============================================================================
// Trait
// ============================================================================

pub trait InitiatorState: Send {
    fn step(self: Box<Self>, wire: &mut Wire) -> Result<Step, SessionError>;
    fn span(&self) -> &Span;
}

// ============================================================================
// Helper to transition states
// ============================================================================

impl<S> InitiatorFsm<S> {
    fn transition<T>(self) -> Box<InitiatorFsm<T>> {
        Box::new(InitiatorFsm {
            state: PhantomData,
            ctx: self.ctx,
            reply: self.reply,
            chunk_index: self.chunk_index,
        })
    }
}

impl InitiatorFsm<SendChunk> {
    fn new(ctx: OperationContext, reply: ReplyAssembler) -> Self {
        InitiatorFsm {
            state: PhantomData,
            ctx,
            reply,
            chunk_index: 1,
        }
    }
}

// ============================================================================
// State Implementations
// ============================================================================

impl InitiatorState for InitiatorFsm<SendChunk> {
    fn step(self: Box<Self>, wire: &mut Wire) -> Result<Step, SessionError> {
        let mut fsm = *self;
        let payload = fsm.ctx.next_outbound(fsm.chunk_index)?;
        let frame = Frame {
            operation_id: fsm.ctx.operation_id,
            chunk_index: fsm.chunk_index,
            chunk_count: fsm.ctx.chunk_count,
            kind: fsm.ctx.kind,
            payload,
        };
        wire.send(&frame)?;
        fsm.ctx.outbound = Some(frame.header());

        let next = fsm.transition::<AwaitReply>();
        Ok(Step::Continue(next as Box<dyn InitiatorState>))
    }

    fn span(&self) -> &Span {
        self.ctx.span()
    }
}

impl InitiatorState for InitiatorFsm<AwaitReply> {
    fn step(self: Box<Self>, wire: &mut Wire) -> Result<Step, SessionError> {
        let mut fsm = *self;
        let expected = fsm.ctx.kind.response_kind().ok_or_else(|| {
            SessionError::ProtocolViolation(format!("{} has no reply kind", fsm.ctx.kind))
        })?;
        let frame = wire.receive()?;
        fsm.ctx.check_inbound(&frame, expected)?;
        if fsm.chunk_index == 1 {
            fsm.ctx.adopt(frame.chunk_count)?;
        } else {
            fsm.ctx.check_agreed(frame.chunk_count)?;
        }
        fsm.ctx.inbound = Some(frame.header());
        fsm.reply.absorb(&frame.payload, &mut fsm.ctx.sink)?;

        if fsm.chunk_index == fsm.ctx.chunk_count {
            let outcome = fsm.reply.finish(&mut fsm.ctx.sink)?;
            return Ok(Step::Done(outcome));
        }

        let chunk_index = fsm.chunk_index;
        let chunk_count = fsm.ctx.chunk_count;
        fsm.chunk_index += 1;
        let next = fsm.transition::<SendChunk>();
        Ok(Step::Yield {
            next: next as Box<dyn InitiatorState>,
            chunk_index,
            chunk_count,
        })
    }

    fn span(&self) -> &Span {
        self.ctx.span()
    }
}

// ============================================================================
// Session
// ============================================================================

/// Identifies an operation started on a `Session`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct OperationHandle {
    id: u16,
}

impl OperationHandle {
    pub fn id(&self) -> u16 {
        self.id
    }
}

#[derive(Debug)]
pub enum Poll {
    InProgress { chunk_index: u16, chunk_count: u16 },
    Completed(Outcome),
    Failed(SessionError),
}

struct InFlight {
    handle: OperationHandle,
    fsm: Box<dyn InitiatorState>,
}

/// Initiating end of a link. Runs one operation at a time.
pub struct Session {
    wire: Wire,
    next_id: u16,
    current: Option<InFlight>,
    cancelled: Option<OperationHandle>,
    state: SessionState,
}

impl Session {
    pub fn new(link: Link, config: &SessionConfig) -> Self {
        Session {
            wire: Wire::new(link, config),
            next_id: 1,
            current: None,
            cancelled: None,
            state: SessionState::Idle,
        }
    }

    pub fn state(&self) -> SessionState {
        self.state
    }

    fn allocate_id(&mut self) -> u16 {
        let id = self.next_id;
        self.next_id = match self.next_id.wrapping_add(1) {
            0 => 1,
            n => n,
        };
        id
    }

    /// Start an operation. Nothing goes on the wire until the first poll.
    pub fn begin_operation(&mut self, request: Request) -> Result<OperationHandle, SessionError> {
        if self.current.is_some() {
            return Err(SessionError::Busy);
        }

        let kind = request.kind();
        debug!(?request, "beginning operation");
        let (stream, reply, sink) = open_request(request)?;
        let id = self.allocate_id();
        let ctx = OperationContext::new(id, kind, stream, sink)?;
        info!(id, %kind, chunks = ctx.own_chunks(), "operation started");

        let handle = OperationHandle { id };
        self.current = Some(InFlight {
            handle,
            fsm: Box::new(InitiatorFsm::<SendChunk>::new(ctx, reply)),
        });
        self.cancelled = None;
        self.state = SessionState::AwaitingFirstFrame;
        Ok(handle)
    }

    /// Drive the operation through one request/reply round trip.
    pub fn poll(&mut self, handle: &OperationHandle) -> Poll {
        if self.cancelled == Some(*handle) {
            return Poll::Failed(SessionError::Cancelled);
        }
        let in_flight = match self.current.take() {
            Some(in_flight) if in_flight.handle == *handle => in_flight,
            other => {
                self.current = other;
                return Poll::Failed(SessionError::UnknownOperation(handle.id));
            }
        };

        let span = in_flight.fsm.span().clone();
        let _enter = span.enter();
        let mut fsm = in_flight.fsm;
        loop {
            match fsm.step(&mut self.wire) {
                Ok(Step::Continue(next)) => fsm = next,
                Ok(Step::Yield { next, chunk_index, chunk_count }) => {
                    self.current = Some(InFlight { handle: *handle, fsm: next });
                    self.state = SessionState::Exchanging(chunk_index);
                    return Poll::InProgress { chunk_index, chunk_count };
                }
                Ok(Step::Done(outcome)) => {
                    info!("operation complete");
                    self.state = SessionState::Complete;
                    return Poll::Completed(outcome);
                }
                Err(e) => {
                    warn!("operation failed: {}", e);
                    self.state = SessionState::Failed;
                    return Poll::Failed(e);
                }
            }
        }
    }

    /// Abandon the in-flight operation, releasing its stream and sink.
    pub fn cancel(&mut self, handle: &OperationHandle) -> Result<(), SessionError> {
        match &self.current {
            Some(in_flight) if in_flight.handle == *handle => {
                self.current = None;
                self.cancelled = Some(*handle);
                self.state = SessionState::Failed;
                info!(id = handle.id, "operation cancelled");
                Ok(())
            }
            _ => Err(SessionError::UnknownOperation(handle.id)),
        }
    }

    /// Poll until the operation finishes.
    pub fn run(&mut self, request: Request) -> Result<Outcome, SessionError> {
        let handle = self.begin_operation(request)?;
        debug!(id = handle.id(), "operation handle issued");
        loop {
            match self.poll(&handle) {
                Poll::InProgress { chunk_index, chunk_count } => {
                    info!("chunk {}/{}", chunk_index, chunk_count);
                }
                Poll::Completed(outcome) => return Ok(outcome),
                Poll::Failed(e) => return Err(e),
            }
        }
    }
}

// ============================================================================
// Tests
// ============================================================================

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

//! Rebuilds a single frame from arbitrarily sized bursts of link bytes.

use std::time::{Duration, Instant};
use tracing::trace;
use crate::frame::{self, Frame, FrameError};
use crate::protocol::*;
use crate::sequencer::SessionError;
use crate::serial::{Link, LinkError};

pub struct FrameAssembler {
    buffer: Vec<u8>,
    expected: Option<usize>,
}

impl FrameAssembler {
    pub fn new() -> Self {
        FrameAssembler {
            buffer: Vec::with_capacity(MAX_FRAME_LEN),
            expected: None,
        }
    }

    /// Forget any partially received frame.
    pub fn reset(&mut self) {
        self.buffer.clear();
        self.expected = None;
    }

    pub fn buffered(&self) -> usize {
        self.buffer.len()
    }

    /// Append one burst. Returns the frame once all of its declared bytes
    /// are buffered; the assembler is reset whenever this yields a frame or
    /// an error.
    pub fn push(&mut self, burst: &[u8]) -> Result<Option<Frame>, FrameError> {
        self.buffer.extend_from_slice(burst);

        if self.expected.is_none() && self.buffer.len() >= LENGTH_PEEK {
            if self.buffer[..2] != PREAMBLE {
                let seen = [self.buffer[0], self.buffer[1]];
                self.reset();
                return Err(FrameError::InvalidPreamble(seen));
            }
            let expected = u16::from_le_bytes([
                self.buffer[FRAME_LENGTH_OFFSET],
                self.buffer[FRAME_LENGTH_OFFSET + 1],
            ]) as usize;
            trace!(expected, "frame length known");
            self.expected = Some(expected);
        }

        match self.expected {
            Some(expected) if self.buffer.len() >= expected => {
                let result = frame::decode(&self.buffer);
                self.reset();
                result.map(Some)
            }
            _ => Ok(None),
        }
    }

    /// Block on the link until exactly one frame is assembled.
    pub fn receive(&mut self, link: &mut Link, timeout: Option<Duration>) -> Result<Frame, SessionError> {
        self.reset();
        let deadline = timeout.map(|t| Instant::now() + t);

        loop {
            let remaining = match deadline {
                Some(deadline) => {
                    let now = Instant::now();
                    if now >= deadline {
                        self.reset();
                        return Err(SessionError::Timeout);
                    }
                    Some(deadline - now)
                }
                None => None,
            };

            let burst = match link.recv(remaining) {
                Ok(burst) => burst,
                Err(LinkError::Timeout) => {
                    trace!(discarded = self.buffered(), "receive timed out");
                    self.reset();
                    return Err(SessionError::Timeout);
                }
                Err(e) => {
                    self.reset();
                    return Err(e.into());
                }
            };

            if let Some(frame) = self.push(&burst)? {
                return Ok(frame);
            }
        }
    }
}

impl Default for FrameAssembler {
    fn default() -> Self {
        Self::new()
    }
}

// ============================================================================
// Tests
// ============================================================================

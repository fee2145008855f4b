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

//! Logical payloads and the length-prefixed metadata framing inside them.

use std::io::{self, Read};
use crate::protocol::{chunks_for, METADATA_PREFIX_LEN};

/// Upper bound accepted for a peer's metadata block
pub const MAX_METADATA_LEN: usize = 64 * 1024;

// ============================================================================
// Payload Stream
// ============================================================================

/// Forward-only byte source for one side of an operation: an in-memory
/// head followed by an optional backing reader that is never loaded whole.
pub struct PayloadStream {
    head: Vec<u8>,
    source: Option<Box<dyn Read + Send>>,
    len: u64,
    position: u64,
    ended_early: bool,
}

impl PayloadStream {
    /// `[u32 LE metadata length][metadata][source bytes]`
    pub fn joined(metadata: &[u8], source: Box<dyn Read + Send>, source_len: u64) -> Self {
        let mut head = Vec::with_capacity(METADATA_PREFIX_LEN + metadata.len());
        head.extend_from_slice(&(metadata.len() as u32).to_le_bytes());
        head.extend_from_slice(metadata);
        let len = head.len() as u64 + source_len;

        PayloadStream {
            head,
            source: Some(source),
            len,
            position: 0,
            ended_early: false,
        }
    }

    /// Plain in-memory content with no prefix.
    pub fn from_bytes(bytes: Vec<u8>) -> Self {
        let len = bytes.len() as u64;
        PayloadStream {
            head: bytes,
            source: None,
            len,
            position: 0,
            ended_early: false,
        }
    }

    pub fn empty() -> Self {
        Self::from_bytes(Vec::new())
    }

    pub fn len(&self) -> u64 {
        self.len
    }

    pub fn position(&self) -> u64 {
        self.position
    }

    pub fn remaining(&self) -> u64 {
        self.len - self.position
    }

    /// True once every declared byte was served, or the backing reader ran
    /// dry before its declared length.
    pub fn is_exhausted(&self) -> bool {
        self.position >= self.len || self.ended_early
    }

    /// Frames this stream needs on its own.
    pub fn chunk_count(&self) -> u64 {
        chunks_for(self.len)
    }

    /// Next slice of at most `max` bytes. Short only at the end of the
    /// stream.
    pub fn read_chunk(&mut self, max: usize) -> io::Result<Vec<u8>> {
        let want = (max as u64).min(self.remaining()) as usize;
        let mut chunk = vec![0u8; want];
        let mut filled = 0;

        while filled < want && !self.ended_early {
            let n = self.read_some(&mut chunk[filled..])?;
            if n == 0 {
                self.ended_early = true;
                break;
            }
            filled += n;
        }
        chunk.truncate(filled);

        if self.is_exhausted() {
            // Release the backing file as soon as it is drained
            self.source = None;
        }
        Ok(chunk)
    }

    fn read_some(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        let head_len = self.head.len() as u64;
        let n = if self.position < head_len {
            let start = self.position as usize;
            let n = buf.len().min(self.head.len() - start);
            buf[..n].copy_from_slice(&self.head[start..start + n]);
            n
        } else {
            let want = (buf.len() as u64).min(self.remaining()) as usize;
            match self.source.as_mut() {
                Some(source) => loop {
                    match source.read(&mut buf[..want]) {
                        Ok(n) => break n,
                        Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
                        Err(e) => return Err(e),
                    }
                },
                None => 0,
            }
        };
        self.position += n as u64;
        Ok(n)
    }
}

impl std::fmt::Debug for PayloadStream {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PayloadStream")
            .field("len", &self.len)
            .field("position", &self.position)
            .field("backed", &self.source.is_some())
            .finish()
    }
}

// ============================================================================
// Metadata Splitter
// ============================================================================

/// Incrementally separates `[u32 LE length][metadata]` from the raw bytes
/// that follow it, wherever the chunk boundaries fall.
#[derive(Debug, Default)]
pub struct MetadataSplitter {
    prefix: Vec<u8>,
    expected: Option<usize>,
    metadata: Vec<u8>,
}

impl MetadataSplitter {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn is_complete(&self) -> bool {
        self.expected == Some(self.metadata.len())
    }

    pub fn metadata(&self) -> Option<&[u8]> {
        if self.is_complete() {
            Some(&self.metadata)
        } else {
            None
        }
    }

    /// Consume one chunk and return whatever part of it belongs to the body.
    pub fn feed<'a>(&mut self, mut chunk: &'a [u8]) -> io::Result<&'a [u8]> {
        if self.expected.is_none() {
            let take = (METADATA_PREFIX_LEN - self.prefix.len()).min(chunk.len());
            self.prefix.extend_from_slice(&chunk[..take]);
            chunk = &chunk[take..];

            if self.prefix.len() < METADATA_PREFIX_LEN {
                return Ok(&[]);
            }
            let len = u32::from_le_bytes([
                self.prefix[0],
                self.prefix[1],
                self.prefix[2],
                self.prefix[3],
            ]) as usize;
            if len > MAX_METADATA_LEN {
                return Err(io::Error::new(
                    io::ErrorKind::InvalidData,
                    format!("metadata block of {} bytes exceeds {}", len, MAX_METADATA_LEN),
                ));
            }
            self.expected = Some(len);
            self.metadata.reserve(len);
        }

        let expected = self.expected.unwrap_or(0);
        let take = (expected - self.metadata.len()).min(chunk.len());
        self.metadata.extend_from_slice(&chunk[..take]);
        Ok(&chunk[take..])
    }
}

// ============================================================================
// Tests
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Cursor;
    use proptest::prelude::*;
    use crate::protocol::MAX_CHUNK_PAYLOAD;

    /// Reader that hands out at most `step` bytes per call.
    struct Trickle {
        data: Vec<u8>,
        pos: usize,
        step: usize,
    }

    impl Read for Trickle {
        fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
            let n = buf.len().min(self.step).min(self.data.len() - self.pos);
            buf[..n].copy_from_slice(&self.data[self.pos..self.pos + n]);
            self.pos += n;
            Ok(n)
        }
    }

    #[test]
    fn test_joined_length_and_layout() {
        let body = b"file body".to_vec();
        let mut stream = PayloadStream::joined(b"{\"a\":1}", Box::new(Cursor::new(body.clone())), 9);

        assert_eq!(stream.len(), 4 + 7 + 9);
        let all = stream.read_chunk(MAX_CHUNK_PAYLOAD).unwrap();
        assert_eq!(&all[..4], &7u32.to_le_bytes());
        assert_eq!(&all[4..11], b"{\"a\":1}");
        assert_eq!(&all[11..], b"file body");
        assert!(stream.is_exhausted());
        assert_eq!(stream.chunk_count(), 1);
    }

    #[test]
    fn test_read_chunk_spans_head_and_source() {
        let body: Vec<u8> = (0..5000u32).map(|i| i as u8).collect();
        let source = Trickle { data: body.clone(), pos: 0, step: 100 };
        let mut stream = PayloadStream::joined(b"meta", Box::new(source), body.len() as u64);

        let first = stream.read_chunk(2048).unwrap();
        assert_eq!(first.len(), 2048);
        assert_eq!(stream.position(), 2048);
        assert!(!stream.is_exhausted());

        let second = stream.read_chunk(2048).unwrap();
        let third = stream.read_chunk(2048).unwrap();
        assert_eq!(second.len(), 2048);
        assert_eq!(third.len(), 5008 - 4096);
        assert!(stream.is_exhausted());
        assert_eq!(stream.chunk_count(), 3);
        assert!(stream.read_chunk(2048).unwrap().is_empty());
    }

    #[test]
    fn test_short_source_ends_early() {
        let mut stream = PayloadStream::joined(b"", Box::new(Cursor::new(vec![1u8; 10])), 3000);
        let chunk = stream.read_chunk(2048).unwrap();
        assert_eq!(chunk.len(), 14);
        assert!(stream.is_exhausted());
        assert!(stream.remaining() > 0);
    }

    #[test]
    fn test_empty_stream_is_one_chunk() {
        let mut stream = PayloadStream::empty();
        assert_eq!(stream.chunk_count(), 1);
        assert!(stream.read_chunk(2048).unwrap().is_empty());
        assert!(stream.is_exhausted());
    }

    #[test]
    fn test_splitter_rejects_huge_metadata() {
        let mut splitter = MetadataSplitter::new();
        let prefix = ((MAX_METADATA_LEN + 1) as u32).to_le_bytes();
        assert!(splitter.feed(&prefix).is_err());
    }

    proptest! {
        #[test]
        fn prop_metadata_survives_any_chunking(
            metadata in proptest::collection::vec(any::<u8>(), 0..3000),
            body in proptest::collection::vec(any::<u8>(), 0..6000),
            step in 1usize..=MAX_CHUNK_PAYLOAD,
        ) {
            let mut stream = PayloadStream::joined(
                &metadata,
                Box::new(Cursor::new(body.clone())),
                body.len() as u64,
            );
            let mut splitter = MetadataSplitter::new();
            let mut rebuilt = Vec::new();

            while !stream.is_exhausted() {
                let chunk = stream.read_chunk(step).unwrap();
                rebuilt.extend_from_slice(splitter.feed(&chunk).unwrap());
            }

            prop_assert_eq!(splitter.metadata(), Some(&metadata[..]));
            prop_assert_eq!(rebuilt, body);
        }
    }
}

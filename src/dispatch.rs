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

//! Operation dispatch.
//!
//! Responder side: a request kind selects the handler that builds the
//! response payload and the sink for any further request chunks.
//!
//! Initiator side: a request selects its outbound payload and the strategy
//! used to put the reply back together.

use std::io::{self, Read};
use tracing::{info, warn};
use crate::frame::Frame;
use crate::messages::*;
use crate::payload::{MetadataSplitter, PayloadStream};
use crate::protocol::*;
use crate::sequencer::{SessionError, Sink};
use crate::store::{ContentStore, StoreError};

// ============================================================================
// Initiator: requests and outcomes
// ============================================================================

/// Parameters of one operation.
pub enum Request {
    ListFiles,
    SendFile {
        /// Name to store the file under on the peer
        filename: String,
        overwrite: bool,
        source: Box<dyn Read + Send>,
        length: u64,
    },
    ReceiveFile {
        filename: String,
        overwrite: bool,
        /// Where the fetched file is written
        destination: Box<dyn ContentStore>,
    },
}

impl Request {
    pub fn kind(&self) -> MessageKind {
        match self {
            Request::ListFiles => MessageKind::ListFilesRequest,
            Request::SendFile { .. } => MessageKind::SendFileRequest,
            Request::ReceiveFile { .. } => MessageKind::ReceiveFileRequest,
        }
    }
}

impl std::fmt::Debug for Request {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Request::ListFiles => write!(f, "ListFiles"),
            Request::SendFile { filename, overwrite, length, .. } => f
                .debug_struct("SendFile")
                .field("filename", filename)
                .field("overwrite", overwrite)
                .field("length", length)
                .finish(),
            Request::ReceiveFile { filename, overwrite, .. } => f
                .debug_struct("ReceiveFile")
                .field("filename", filename)
                .field("overwrite", overwrite)
                .finish(),
        }
    }
}

/// Result of an operation that ran to completion. A decline is a clean
/// completion too: the peer understood the request and refused it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Outcome {
    Listed(Vec<FileEntry>),
    Sent,
    Received(FileEntry),
    Declined(String),
}

/// Outbound payload, reply strategy and initial sink for a request.
pub fn open_request(request: Request) -> Result<(PayloadStream, ReplyAssembler, Sink), SessionError> {
    match request {
        Request::ListFiles => Ok((
            PayloadStream::empty(),
            ReplyAssembler::Listing,
            Sink::Buffer(Vec::new()),
        )),
        Request::SendFile { filename, overwrite, source, length } => {
            let metadata = serde_json::to_vec(&SendFileMetadata { filename, overwrite })?;
            if METADATA_PREFIX_LEN + metadata.len() > MAX_CHUNK_PAYLOAD {
                return Err(SessionError::MetadataTooLarge(metadata.len()));
            }
            Ok((
                PayloadStream::joined(&metadata, source, length),
                ReplyAssembler::Status,
                Sink::Buffer(Vec::new()),
            ))
        }
        Request::ReceiveFile { filename, overwrite, destination } => {
            let body = serde_json::to_vec(&ReceiveFileRequest { filename })?;
            if body.len() > MAX_CHUNK_PAYLOAD {
                return Err(SessionError::MetadataTooLarge(body.len()));
            }
            Ok((
                PayloadStream::from_bytes(body),
                ReplyAssembler::Download(Download::new(destination, overwrite)),
                Sink::Discard,
            ))
        }
    }
}

// ============================================================================
// Initiator: reply reassembly
// ============================================================================

pub enum ReplyAssembler {
    /// Concatenate, then parse a ListFilesResponse
    Listing,
    /// Concatenate, then parse a StatusResponse
    Status,
    /// Split off the metadata block and stream the rest to a file
    Download(Download),
}

pub struct Download {
    splitter: MetadataSplitter,
    metadata: Option<ReceiveFileMetadata>,
    destination: Box<dyn ContentStore>,
    overwrite: bool,
    declined: Option<String>,
    received: u64,
}

impl Download {
    fn new(destination: Box<dyn ContentStore>, overwrite: bool) -> Self {
        Download {
            splitter: MetadataSplitter::new(),
            metadata: None,
            destination,
            overwrite,
            declined: None,
            received: 0,
        }
    }

    fn absorb(&mut self, payload: &[u8], sink: &mut Sink) -> Result<(), SessionError> {
        let body = self.splitter.feed(payload)?;

        if self.metadata.is_none() {
            let Some(raw) = self.splitter.metadata() else {
                return Ok(());
            };
            let metadata: ReceiveFileMetadata = serde_json::from_slice(raw)?;
            if metadata.success {
                let file = metadata.file.as_ref().ok_or_else(|| {
                    SessionError::ProtocolViolation("receive reply carries no file attributes".into())
                })?;
                match self.destination.open_write(&file.name, self.overwrite) {
                    Ok(writer) => *sink = Sink::Writer(writer),
                    Err(StoreError::Io(e)) => return Err(e.into()),
                    Err(e) => {
                        // Keep the exchange going so both sides finish cleanly
                        warn!("not writing {}: {}", file.name, e);
                        self.declined = Some(e.to_string());
                        *sink = Sink::Discard;
                    }
                }
            }
            self.metadata = Some(metadata);
        }

        self.received += body.len() as u64;
        sink.append(body)?;
        Ok(())
    }

    fn finish(self, sink: &mut Sink) -> Result<Outcome, SessionError> {
        sink.close()?;
        let metadata = self.metadata.ok_or_else(|| {
            SessionError::ProtocolViolation("receive reply ended inside its metadata block".into())
        })?;
        if !metadata.success {
            return Ok(Outcome::Declined(metadata.error.unwrap_or_else(|| "declined".into())));
        }
        if let Some(reason) = self.declined {
            return Ok(Outcome::Declined(reason));
        }
        let file = metadata.file.ok_or_else(|| {
            SessionError::ProtocolViolation("receive reply carries no file attributes".into())
        })?;
        if self.received != file.size {
            return Err(SessionError::ProtocolViolation(format!(
                "received {} of {} bytes of {}",
                self.received, file.size, file.name
            )));
        }
        Ok(Outcome::Received(file))
    }
}

impl ReplyAssembler {
    pub fn absorb(&mut self, payload: &[u8], sink: &mut Sink) -> Result<(), SessionError> {
        match self {
            ReplyAssembler::Listing | ReplyAssembler::Status => {
                sink.append(payload)?;
                Ok(())
            }
            ReplyAssembler::Download(download) => download.absorb(payload, sink),
        }
    }

    pub fn finish(self, sink: &mut Sink) -> Result<Outcome, SessionError> {
        match self {
            ReplyAssembler::Listing => {
                let reply: ListFilesResponse = serde_json::from_slice(&sink.take_buffer())?;
                if reply.success {
                    Ok(Outcome::Listed(reply.files))
                } else {
                    Ok(Outcome::Declined(reply.error.unwrap_or_else(|| "declined".into())))
                }
            }
            ReplyAssembler::Status => {
                let reply: StatusResponse = serde_json::from_slice(&sink.take_buffer())?;
                if reply.success {
                    Ok(Outcome::Sent)
                } else {
                    Ok(Outcome::Declined(reply.error.unwrap_or_else(|| "declined".into())))
                }
            }
            ReplyAssembler::Download(download) => download.finish(sink),
        }
    }
}

// ============================================================================
// Responder: request handlers
// ============================================================================

/// What a handler hands back for the first chunk of a request.
pub struct Exchange {
    pub stream: PayloadStream,
    pub sink: Sink,
}

/// Route the first chunk of a request to its handler.
pub fn open_exchange(first: &Frame, store: &dyn ContentStore) -> Result<Exchange, SessionError> {
    match first.kind {
        MessageKind::ListFilesRequest => list_files(store),
        MessageKind::SendFileRequest => accept_upload(first, store),
        MessageKind::ReceiveFileRequest => serve_download(first, store),
        other => Err(SessionError::ProtocolViolation(format!(
            "{} is not a request",
            other
        ))),
    }
}

fn list_files(store: &dyn ContentStore) -> Result<Exchange, SessionError> {
    let reply = match store.list() {
        Ok(files) => {
            info!("listing {} files", files.len());
            ListFilesResponse::ok(files)
        }
        Err(e) => {
            warn!("listing failed: {}", e);
            ListFilesResponse::failed(e.to_string())
        }
    };
    Ok(Exchange {
        stream: PayloadStream::from_bytes(serde_json::to_vec(&reply)?),
        sink: Sink::Discard,
    })
}

fn accept_upload(first: &Frame, store: &dyn ContentStore) -> Result<Exchange, SessionError> {
    let mut splitter = MetadataSplitter::new();
    let body = splitter.feed(&first.payload)?;
    let raw = splitter.metadata().ok_or_else(|| {
        SessionError::ProtocolViolation("send-file metadata does not fit in the first chunk".into())
    })?;
    let metadata: SendFileMetadata = serde_json::from_slice(raw)?;

    let (reply, mut sink) = match store.open_write(&metadata.filename, metadata.overwrite) {
        Ok(writer) => {
            info!(overwrite = metadata.overwrite, "receiving {}", metadata.filename);
            (StatusResponse::ok(), Sink::Writer(writer))
        }
        Err(e) => {
            warn!("declining {}: {}", metadata.filename, e);
            (StatusResponse::declined(e.to_string()), Sink::Discard)
        }
    };
    sink.append(body)?;

    Ok(Exchange {
        stream: PayloadStream::from_bytes(serde_json::to_vec(&reply)?),
        sink,
    })
}

fn serve_download(first: &Frame, store: &dyn ContentStore) -> Result<Exchange, SessionError> {
    if first.chunk_count != 1 {
        return Err(SessionError::ProtocolViolation(format!(
            "receive-file request spans {} chunks",
            first.chunk_count
        )));
    }
    let request: ReceiveFileRequest = serde_json::from_slice(&first.payload)?;

    let stream = match store.open_read(&request.filename) {
        Ok((file, reader)) => {
            let size = file.size;
            let name = file.name.clone();
            let metadata = serde_json::to_vec(&ReceiveFileMetadata::found(file))?;
            // The whole reply has to fit in the 16-bit chunk count
            let chunks = chunks_for((METADATA_PREFIX_LEN + metadata.len()) as u64 + size);
            if chunks > u16::MAX as u64 {
                warn!(size, chunks, "declining {}: too large", name);
                declined_download(format!(
                    "File too large: needs {} chunks, at most {} allowed",
                    chunks,
                    u16::MAX
                ))?
            } else {
                info!(size, "sending {}", name);
                PayloadStream::joined(&metadata, reader, size)
            }
        }
        Err(e) => {
            warn!("declining {}: {}", request.filename, e);
            declined_download(e.to_string())?
        }
    };

    Ok(Exchange { stream, sink: Sink::Discard })
}

fn declined_download(reason: String) -> Result<PayloadStream, SessionError> {
    let metadata = serde_json::to_vec(&ReceiveFileMetadata::declined(reason))?;
    Ok(PayloadStream::joined(&metadata, Box::new(io::empty()), 0))
}

// ============================================================================
// Tests
// ============================================================================

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

//! Serving end of a link: answers each request frame with exactly one
//! response frame.

use tracing::{debug, error, info, trace, warn};
use crate::dispatch;
use crate::frame::Frame;
use crate::sequencer::*;
use crate::store::ContentStore;

pub struct Responder<S: ContentStore> {
    store: S,
    context: Option<OperationContext>,
    state: SessionState,
}

impl<S: ContentStore> Responder<S> {
    pub fn new(store: S) -> Self {
        Responder {
            store,
            context: None,
            state: SessionState::Idle,
        }
    }

    pub fn state(&self) -> SessionState {
        self.state
    }

    /// No operation is in flight.
    pub fn is_idle(&self) -> bool {
        self.context.is_none()
    }

    /// Answer one request frame. Any error aborts the current operation
    /// and releases its stream and sink.
    pub fn serve_next(&mut self, frame: Frame) -> Result<Frame, SessionError> {
        match self.exchange(frame) {
            Ok(reply) => Ok(reply),
            Err(e) => {
                self.abort(&e);
                Err(e)
            }
        }
    }

    fn exchange(&mut self, frame: Frame) -> Result<Frame, SessionError> {
        if frame.operation_id == 0 || frame.chunk_index == 0 || frame.chunk_count == 0 {
            return Err(SessionError::ProtocolViolation(
                "operation id, chunk index and chunk count must be non-zero".into(),
            ));
        }
        let response_kind = frame.kind.response_kind().ok_or_else(|| {
            SessionError::ProtocolViolation(format!("{} is not a request", frame.kind))
        })?;

        if frame.chunk_index == 1 {
            if let Some(stale) = self.context.take() {
                warn!(id = stale.operation_id, "abandoning unfinished operation");
            }
            let exchange = dispatch::open_exchange(&frame, &self.store)?;
            let mut ctx = OperationContext::new(frame.operation_id, frame.kind, exchange.stream, exchange.sink)?;
            ctx.agree(frame.chunk_count);
            self.context = Some(ctx);
            self.state = SessionState::AwaitingFirstFrame;
        }

        let ctx = self.context.as_mut().ok_or_else(|| {
            SessionError::ProtocolViolation(format!(
                "chunk {} of operation {} arrived with no operation in progress",
                frame.chunk_index, frame.operation_id
            ))
        })?;
        let span = ctx.span().clone();
        let _enter = span.enter();

        if frame.chunk_index > 1 {
            ctx.check_inbound(&frame, ctx.kind)?;
            ctx.check_agreed(frame.chunk_count)?;
            ctx.sink.append(&frame.payload)?;
        }
        ctx.inbound = Some(frame.header());

        let payload = ctx.next_outbound(frame.chunk_index)?;
        let reply = Frame {
            operation_id: ctx.operation_id,
            chunk_index: frame.chunk_index,
            chunk_count: ctx.chunk_count,
            kind: response_kind,
            payload,
        };
        ctx.outbound = Some(reply.header());

        if reply.is_last() {
            ctx.sink.close()?;
            info!(chunks = reply.chunk_count, "operation complete");
            self.context = None;
            self.state = SessionState::Idle;
        } else {
            self.state = SessionState::Exchanging(reply.chunk_index);
        }
        Ok(reply)
    }

    fn abort(&mut self, reason: &SessionError) {
        if let Some(ctx) = self.context.take() {
            warn!(id = ctx.operation_id, kind = %ctx.kind, "operation aborted: {}", reason);
        }
        self.state = SessionState::Failed;
    }

    /// Receive one request frame and send its reply.
    pub fn serve_once(&mut self, wire: &mut Wire) -> Result<(), SessionError> {
        let frame = match wire.receive() {
            Ok(frame) => frame,
            Err(SessionError::Timeout) if self.is_idle() => return Err(SessionError::Timeout),
            Err(e) => {
                self.abort(&e);
                return Err(e);
            }
        };
        let reply = self.serve_next(frame)?;
        if let Err(e) = wire.send(&reply) {
            self.abort(&e);
            return Err(e);
        }
        Ok(())
    }

    /// Serve requests until the link goes away. A bad frame or sequencing
    /// fault only ends the operation it belongs to.
    pub fn run(&mut self, wire: &mut Wire) -> Result<(), SessionError> {
        info!("serving requests");
        loop {
            match self.serve_once(wire) {
                Ok(()) => {}
                Err(e) if e.is_link_down() => {
                    info!("link closed: {}", e);
                    return Ok(());
                }
                Err(SessionError::Timeout) => trace!("no request within timeout"),
                Err(e) if e.is_corruption() => error!("corrupt frame: {}", e),
                Err(e) => {
                    debug!(state = ?self.state(), "request failed");
                    warn!("request failed: {}", e);
                }
            }
        }
    }
}

// ============================================================================
// Tests
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs;
    use std::io::Cursor;
    use std::path::PathBuf;
    use std::thread::{self, JoinHandle};
    use std::time::Duration;
    use tempfile::TempDir;
    use crate::dispatch::{Outcome, Request};
    use crate::frame::{decode, encode, FrameError};
    use crate::initiator::{Poll, Session};
    use crate::messages::*;
    use crate::protocol::*;
    use crate::serial::loopback;
    use crate::store::FolderStore;

    fn config() -> SessionConfig {
        SessionConfig { timeout: Some(Duration::from_secs(5)) }
    }

    /// Run a responder over `folder` on its own thread, returning the
    /// initiating session wired to it.
    fn serve(folder: PathBuf) -> (Session, JoinHandle<Result<(), SessionError>>) {
        let (client, server) = loopback();
        let worker = thread::spawn(move || {
            let mut wire = Wire::new(server, &SessionConfig::default());
            Responder::new(FolderStore::new(folder)).run(&mut wire)
        });
        (Session::new(client, &config()), worker)
    }

    fn shutdown(session: Session, worker: JoinHandle<Result<(), SessionError>>) {
        drop(session);
        worker.join().unwrap().unwrap();
    }

    fn pattern(len: usize) -> Vec<u8> {
        (0..len).map(|i| (i * 31 % 251) as u8).collect()
    }

    fn send_request(name: &str, bytes: Vec<u8>, overwrite: bool) -> Request {
        let length = bytes.len() as u64;
        Request::SendFile {
            filename: name.into(),
            overwrite,
            source: Box::new(Cursor::new(bytes)),
            length,
        }
    }

    #[test]
    fn test_scenario_list_three_files_in_one_chunk() {
        let dir = TempDir::new().unwrap();
        fs::write(dir.path().join("one.txt"), b"1").unwrap();
        fs::write(dir.path().join("two.txt"), b"22").unwrap();
        fs::write(dir.path().join("three.txt"), b"333").unwrap();
        let expected = FolderStore::new(dir.path()).list().unwrap();

        let (mut session, worker) = serve(dir.path().to_path_buf());
        let handle = session.begin_operation(Request::ListFiles).unwrap();
        match session.poll(&handle) {
            Poll::Completed(Outcome::Listed(files)) => {
                assert_eq!(files.len(), 3);
                assert_eq!(files, expected);
            }
            other => panic!("unexpected poll result: {:?}", other),
        }
        shutdown(session, worker);
    }

    #[test]
    fn test_scenario_send_5000_bytes_in_three_chunks() {
        let dir = TempDir::new().unwrap();
        let content = pattern(5000);
        let (mut session, worker) = serve(dir.path().to_path_buf());

        let handle = session.begin_operation(send_request("big.bin", content.clone(), false)).unwrap();
        let mut progress = Vec::new();
        let outcome = loop {
            match session.poll(&handle) {
                Poll::InProgress { chunk_index, chunk_count } => progress.push((chunk_index, chunk_count)),
                Poll::Completed(outcome) => break outcome,
                Poll::Failed(e) => panic!("send failed: {}", e),
            }
        };
        assert_eq!(outcome, Outcome::Sent);
        assert_eq!(progress, vec![(1, 3), (2, 3)]);
        shutdown(session, worker);

        assert_eq!(fs::read(dir.path().join("big.bin")).unwrap(), content);
    }

    #[test]
    fn test_scenario_send_to_existing_destination_is_declined() {
        let dir = TempDir::new().unwrap();
        fs::write(dir.path().join("taken.bin"), b"original").unwrap();
        let (mut session, worker) = serve(dir.path().to_path_buf());

        // Multi-chunk so the decline has to drain the rest of the upload
        let outcome = session.run(send_request("taken.bin", pattern(5000), false)).unwrap();
        assert_eq!(outcome, Outcome::Declined("File exists at destination".into()));

        // The link is still usable afterwards
        let outcome = session.run(send_request("taken.bin", b"replaced".to_vec(), true)).unwrap();
        assert_eq!(outcome, Outcome::Sent);
        shutdown(session, worker);

        assert_eq!(fs::read(dir.path().join("taken.bin")).unwrap(), b"replaced");
    }

    #[test]
    fn test_scenario_receive_missing_file_is_declined() {
        let server_dir = TempDir::new().unwrap();
        let client_dir = TempDir::new().unwrap();
        let (mut session, worker) = serve(server_dir.path().to_path_buf());

        let outcome = session
            .run(Request::ReceiveFile {
                filename: "ghost.txt".into(),
                overwrite: false,
                destination: Box::new(FolderStore::new(client_dir.path())),
            })
            .unwrap();
        assert_eq!(outcome, Outcome::Declined("File not found".into()));
        assert!(!client_dir.path().join("ghost.txt").exists());
        shutdown(session, worker);
    }

    #[test]
    fn test_receive_beyond_chunk_limit_is_declined() {
        let server_dir = TempDir::new().unwrap();
        let client_dir = TempDir::new().unwrap();
        // Sparse: needs more chunks than a frame can count
        let huge = fs::File::create(server_dir.path().join("huge.bin")).unwrap();
        huge.set_len(200 * 1024 * 1024).unwrap();
        drop(huge);
        let (mut session, worker) = serve(server_dir.path().to_path_buf());

        let outcome = session
            .run(Request::ReceiveFile {
                filename: "huge.bin".into(),
                overwrite: false,
                destination: Box::new(FolderStore::new(client_dir.path())),
            })
            .unwrap();
        match outcome {
            Outcome::Declined(reason) => assert!(reason.starts_with("File too large"), "{}", reason),
            other => panic!("unexpected outcome: {:?}", other),
        }
        assert!(!client_dir.path().join("huge.bin").exists());

        // The server is still answering
        assert!(matches!(session.run(Request::ListFiles).unwrap(), Outcome::Listed(_)));
        shutdown(session, worker);
    }

    #[test]
    fn test_receive_large_file() {
        let server_dir = TempDir::new().unwrap();
        let client_dir = TempDir::new().unwrap();
        let content = pattern(7000);
        fs::write(server_dir.path().join("fetch.bin"), &content).unwrap();
        let (mut session, worker) = serve(server_dir.path().to_path_buf());

        let outcome = session
            .run(Request::ReceiveFile {
                filename: "fetch.bin".into(),
                overwrite: false,
                destination: Box::new(FolderStore::new(client_dir.path())),
            })
            .unwrap();
        match outcome {
            Outcome::Received(file) => {
                assert_eq!(file.name, "fetch.bin");
                assert_eq!(file.size, 7000);
            }
            other => panic!("unexpected outcome: {:?}", other),
        }
        shutdown(session, worker);

        assert_eq!(fs::read(client_dir.path().join("fetch.bin")).unwrap(), content);
    }

    #[test]
    fn test_scenario_length_mismatch_aborts_without_leaking_state() {
        let dir = TempDir::new().unwrap();
        let (server, mut peer) = loopback();
        let mut wire = Wire::new(server, &config());
        let mut responder = Responder::new(FolderStore::new(dir.path()));

        // First chunk of a two-chunk upload opens an operation
        let meta = serde_json::to_vec(&SendFileMetadata { filename: "partial.bin".into(), overwrite: false }).unwrap();
        let mut first = (meta.len() as u32).to_le_bytes().to_vec();
        first.extend_from_slice(&meta);
        first.resize(MAX_CHUNK_PAYLOAD, 0xEE);
        peer.send(&encode(MessageKind::SendFileRequest, 4, 1, 2, &first).unwrap()).unwrap();
        responder.serve_once(&mut wire).unwrap();
        assert!(!responder.is_idle());
        let reply = decode(&peer.recv(Some(Duration::from_secs(1))).unwrap()).unwrap();
        assert_eq!(reply.chunk_count, 2);

        // Second chunk arrives one byte longer than it declares
        let mut bad = encode(MessageKind::SendFileRequest, 4, 2, 2, b"tail").unwrap();
        bad.push(0);
        peer.send(&bad).unwrap();
        let err = responder.serve_once(&mut wire).unwrap_err();
        assert!(matches!(err, SessionError::Frame(FrameError::LengthMismatch { .. })));
        assert!(responder.is_idle());
        assert_eq!(responder.state(), SessionState::Failed);

        // A fresh operation starts from a clean context
        peer.send(&encode(MessageKind::ListFilesRequest, 5, 1, 1, &[]).unwrap()).unwrap();
        responder.serve_once(&mut wire).unwrap();
        let reply = decode(&peer.recv(Some(Duration::from_secs(1))).unwrap()).unwrap();
        assert_eq!((reply.operation_id, reply.kind), (5, MessageKind::ListFilesResponse));
        let listing: ListFilesResponse = serde_json::from_slice(&reply.payload).unwrap();
        assert!(listing.success);
        assert_eq!(listing.files.len(), 1);
        assert_eq!(listing.files[0].name, "partial.bin");
    }

    #[test]
    fn test_initiator_length_mismatch_fails_the_operation() {
        let dir = TempDir::new().unwrap();
        let (client, mut peer) = loopback();
        let mut session = Session::new(client, &config());

        let handle = session.begin_operation(Request::ListFiles).unwrap();
        let reply = serde_json::to_vec(&ListFilesResponse::ok(vec![])).unwrap();
        let mut bad = encode(MessageKind::ListFilesResponse, handle.id(), 1, 1, &reply).unwrap();
        bad.extend_from_slice(b"xx");
        peer.send(&bad).unwrap();
        assert!(matches!(
            session.poll(&handle),
            Poll::Failed(SessionError::Frame(FrameError::LengthMismatch { .. }))
        ));

        let folder = dir.path().to_path_buf();
        let worker = thread::spawn(move || {
            let mut wire = Wire::new(peer, &config());
            // Request of the failed operation, which never gets an answer
            let stale = wire.receive()?;
            assert_eq!(stale.kind, MessageKind::ListFilesRequest);
            Responder::new(FolderStore::new(folder)).serve_once(&mut wire)
        });

        let handle = session.begin_operation(Request::ListFiles).unwrap();
        assert!(matches!(session.poll(&handle), Poll::Completed(Outcome::Listed(_))));
        worker.join().unwrap().unwrap();
    }

    #[test]
    fn test_continuation_without_first_chunk_is_rejected() {
        let dir = TempDir::new().unwrap();
        let mut responder = Responder::new(FolderStore::new(dir.path()));
        let frame = Frame {
            operation_id: 3,
            chunk_index: 2,
            chunk_count: 2,
            kind: MessageKind::SendFileRequest,
            payload: vec![],
        };
        assert!(matches!(responder.serve_next(frame), Err(SessionError::ProtocolViolation(_))));
    }

    #[test]
    fn test_new_first_chunk_abandons_stale_operation() {
        let dir = TempDir::new().unwrap();
        let mut responder = Responder::new(FolderStore::new(dir.path()));

        let meta = serde_json::to_vec(&SendFileMetadata { filename: "stale.bin".into(), overwrite: false }).unwrap();
        let mut first = (meta.len() as u32).to_le_bytes().to_vec();
        first.extend_from_slice(&meta);
        let reply = responder
            .serve_next(Frame { operation_id: 1, chunk_index: 1, chunk_count: 3, kind: MessageKind::SendFileRequest, payload: first })
            .unwrap();
        assert_eq!(reply.chunk_count, 3);
        assert!(!responder.is_idle());

        let reply = responder
            .serve_next(Frame { operation_id: 2, chunk_index: 1, chunk_count: 1, kind: MessageKind::ListFilesRequest, payload: vec![] })
            .unwrap();
        assert_eq!(reply.operation_id, 2);
        assert!(responder.is_idle());
        assert_eq!(responder.state(), SessionState::Idle);
    }

    #[test]
    fn test_changed_chunk_count_is_a_violation() {
        let dir = TempDir::new().unwrap();
        let mut responder = Responder::new(FolderStore::new(dir.path()));

        let meta = serde_json::to_vec(&SendFileMetadata { filename: "x.bin".into(), overwrite: false }).unwrap();
        let mut first = (meta.len() as u32).to_le_bytes().to_vec();
        first.extend_from_slice(&meta);
        responder
            .serve_next(Frame { operation_id: 7, chunk_index: 1, chunk_count: 3, kind: MessageKind::SendFileRequest, payload: first })
            .unwrap();
        let err = responder
            .serve_next(Frame { operation_id: 7, chunk_index: 2, chunk_count: 4, kind: MessageKind::SendFileRequest, payload: vec![] })
            .unwrap_err();
        assert!(matches!(err, SessionError::ProtocolViolation(_)));
        assert!(responder.is_idle());
    }
}

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

use std::io;
use std::sync::mpsc::{self, Receiver, RecvTimeoutError};
#[cfg(test)]
use std::sync::mpsc::Sender;
use std::thread;
use std::time::Duration;
use serialport::{SerialPort as SerialPortTrait, DataBits, Parity, StopBits};
use thiserror::Error;
use tracing::{debug, warn};

/// How long the reader thread blocks in one read before polling again
const POLL_INTERVAL: Duration = Duration::from_millis(100);

/// One inbound burst, or the error that ended the reader
pub type Burst = io::Result<Vec<u8>>;

// ============================================================================
// Configuration
// ============================================================================

/// Serial line settings, built once at startup.
#[derive(Debug, Clone)]
pub struct SerialConfig {
    pub port: String,
    pub baud_rate: u32,
    pub data_bits: DataBits,
    pub parity: Parity,
    pub stop_bits: StopBits,
}

// ============================================================================
// SerialPort Trait
// ============================================================================

/// Trait for serial port operations needed by the courier link
pub trait SerialPort: Send {
    fn write_all(&mut self, buf: &[u8]) -> io::Result<()>;

    fn read_timeout(&mut self, buf: &mut [u8], timeout: Duration) -> io::Result<usize>;
}

// ============================================================================
// Real Serial Port Implementation
// ============================================================================

/// Real serial port implementation that wraps the serialport crate
pub struct RealSerialPort {
    port: Box<dyn SerialPortTrait>,
}

impl RealSerialPort {
    pub fn open(config: &SerialConfig) -> Result<Self, serialport::Error> {
        let port = serialport::new(&config.port, config.baud_rate)
            .data_bits(config.data_bits)
            .parity(config.parity)
            .stop_bits(config.stop_bits)
            .timeout(POLL_INTERVAL)
            .open()?;

        Ok(RealSerialPort { port })
    }

    /// A second handle on the same device, used as the read half.
    pub fn try_clone(&self) -> Result<Self, serialport::Error> {
        Ok(RealSerialPort { port: self.port.try_clone()? })
    }
}

impl SerialPort for RealSerialPort {
    fn write_all(&mut self, buf: &[u8]) -> io::Result<()> {
        self.port.write_all(buf)?;
        self.port.flush()?;
        Ok(())
    }

    fn read_timeout(&mut self, buf: &mut [u8], timeout: Duration) -> io::Result<usize> {
        self.port.set_timeout(timeout)
            .map_err(io::Error::other)?;
        self.port.read(buf)
    }
}

// ============================================================================
// Reader Thread
// ============================================================================

/// Move the read half of a port onto its own thread. Every non-empty read is
/// forwarded as one burst; read timeouts are only polling ticks. Any other
/// error is forwarded once and ends the thread.
pub fn spawn_reader(mut port: Box<dyn SerialPort>) -> io::Result<Receiver<Burst>> {
    let (tx, rx) = mpsc::channel();

    thread::Builder::new()
        .name("serial-reader".into())
        .spawn(move || {
            let mut buf = [0u8; 1024];
            loop {
                match port.read_timeout(&mut buf, POLL_INTERVAL) {
                    Ok(0) => continue,
                    Ok(n) => {
                        if tx.send(Ok(buf[..n].to_vec())).is_err() {
                            break;
                        }
                    }
                    Err(e) if e.kind() == io::ErrorKind::TimedOut => continue,
                    Err(e) => {
                        warn!("serial reader stopped: {}", e);
                        let _ = tx.send(Err(e));
                        break;
                    }
                }
            }
        })?;

    Ok(rx)
}

// ============================================================================
// Link
// ============================================================================

#[derive(Debug, Error)]
pub enum LinkError {
    #[error("timed out waiting for data")]
    Timeout,

    #[error("link closed")]
    Closed,

    #[error("I/O error: {0}")]
    Io(#[from] io::Error),
}

/// The duplex byte channel a session drives: a write half plus the
/// channel the reader thread feeds.
pub struct Link {
    port: Box<dyn SerialPort>,
    inbound: Receiver<Burst>,
}

impl Link {
    pub fn new(port: Box<dyn SerialPort>, inbound: Receiver<Burst>) -> Self {
        Link { port, inbound }
    }

    pub fn open(config: &SerialConfig) -> io::Result<Self> {
        let port = RealSerialPort::open(config)?;
        let reader = port.try_clone()?;
        let inbound = spawn_reader(Box::new(reader))?;
        debug!(port = %config.port, baud = config.baud_rate, "serial link open");
        Ok(Link::new(Box::new(port), inbound))
    }

    pub fn send(&mut self, bytes: &[u8]) -> Result<(), LinkError> {
        self.port.write_all(bytes)?;
        Ok(())
    }

    /// Next inbound burst. `None` waits forever.
    pub fn recv(&mut self, timeout: Option<Duration>) -> Result<Vec<u8>, LinkError> {
        let burst = match timeout {
            None => self.inbound.recv().map_err(|_| LinkError::Closed)?,
            Some(timeout) => match self.inbound.recv_timeout(timeout) {
                Ok(burst) => burst,
                Err(RecvTimeoutError::Timeout) => return Err(LinkError::Timeout),
                Err(RecvTimeoutError::Disconnected) => return Err(LinkError::Closed),
            },
        };
        Ok(burst?)
    }
}

// ============================================================================
// In-memory Ports for Testing
// ============================================================================

/// Write half that pushes every write into a channel.
#[cfg(test)]
pub struct ChannelPort {
    tx: Sender<Burst>,
}

#[cfg(test)]
impl SerialPort for ChannelPort {
    fn write_all(&mut self, buf: &[u8]) -> io::Result<()> {
        self.tx
            .send(Ok(buf.to_vec()))
            .map_err(|_| io::Error::new(io::ErrorKind::BrokenPipe, "peer closed"))
    }

    fn read_timeout(&mut self, _buf: &mut [u8], _timeout: Duration) -> io::Result<usize> {
        Err(io::Error::new(io::ErrorKind::Unsupported, "write-only port"))
    }
}

/// Two links wired back to back.
#[cfg(test)]
pub fn loopback() -> (Link, Link) {
    let (a_tx, a_rx) = mpsc::channel();
    let (b_tx, b_rx) = mpsc::channel();
    (
        Link::new(Box::new(ChannelPort { tx: b_tx }), a_rx),
        Link::new(Box::new(ChannelPort { tx: a_tx }), b_rx),
    )
}

/// A link whose inbound bursts are injected by the test, and whose writes
/// can be inspected.
#[cfg(test)]
pub fn scripted_link() -> (Link, Sender<Burst>, Receiver<Burst>) {
    let (inject, inbound) = mpsc::channel();
    let (written_tx, written) = mpsc::channel();
    (
        Link::new(Box::new(ChannelPort { tx: written_tx }), inbound),
        inject,
        written,
    )
}

// ============================================================================
// Mock Serial Port for Testing
// ============================================================================

#[cfg(test)]
pub struct MockSerialPort {
    // One entry per read: a burst, or None for a timeout
    reads: Vec<Option<Vec<u8>>>,
    read_pos: usize,
    write_log: Vec<u8>,
    expected_writes: Vec<u8>,
}

#[cfg(test)]
impl MockSerialPort {
    pub fn new(reads: Vec<Option<Vec<u8>>>, expected_writes: Vec<u8>) -> Self {
        MockSerialPort {
            reads,
            read_pos: 0,
            write_log: Vec::new(),
            expected_writes,
        }
    }
}

#[cfg(test)]
impl SerialPort for MockSerialPort {
    fn write_all(&mut self, buf: &[u8]) -> io::Result<()> {
        self.write_log.extend_from_slice(buf);
        Ok(())
    }

    fn read_timeout(&mut self, buf: &mut [u8], _timeout: Duration) -> io::Result<usize> {
        // Out of script = device unplugged
        let Some(entry) = self.reads.get(self.read_pos) else {
            return Err(io::Error::new(io::ErrorKind::BrokenPipe, "Mock port closed"));
        };
        self.read_pos += 1;
        match entry {
            Some(burst) => {
                let n = burst.len().min(buf.len());
                buf[..n].copy_from_slice(&burst[..n]);
                Ok(n)
            }
            None => Err(io::Error::new(io::ErrorKind::TimedOut, "Mock timeout")),
        }
    }
}

#[cfg(test)]
impl Drop for MockSerialPort {
    fn drop(&mut self) {
        if std::thread::panicking() {
            return;
        }
        assert_eq!(
            self.write_log, self.expected_writes,
            "MockSerialPort write log mismatch!\nExpected {:02X?}\nGot {:02X?}",
            self.expected_writes, self.write_log
        );
    }
}

// ============================================================================
// Tests
// ============================================================================

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

// Chunked file transfer over a serial link
mod assembler;
mod dispatch;
mod frame;
mod initiator;
mod messages;
mod payload;
mod protocol;
mod responder;
mod sequencer;
mod serial;
mod store;

use std::fs::File;
use std::io::{self, BufReader};
use std::path::{Path, PathBuf};
use std::time::Duration;
use clap::{Parser, Subcommand};
use serialport::{DataBits, Parity, StopBits};
use tracing::info;
use tracing_subscriber::EnvFilter;
use dispatch::{Outcome, Request};
use initiator::Session;
use responder::Responder;
use sequencer::{SessionConfig, SessionError, Wire};
use serial::{Link, SerialConfig};
use store::FolderStore;

#[derive(Parser)]
#[command(name = "courier")]
#[command(about = "Chunked file transfer between two peers over RS-232", long_about = None)]
#[command(disable_help_subcommand = true)]
struct Cli {
    /// Serial port to use (e.g., /dev/ttyUSB0 or COM1)
    #[arg(short, long)]
    port: String,

    /// Baud rate
    #[arg(short, long, default_value = "9600")]
    baud: u32,

    /// Data bits (5, 6, 7, or 8)
    #[arg(long, default_value = "8", value_name = "BITS")]
    data_bits: u8,

    /// Parity (none, odd, or even)
    #[arg(long, default_value = "none")]
    parity: String,

    /// Stop bits (1 or 2)
    #[arg(long, default_value = "1", value_name = "BITS")]
    stop_bits: u8,

    /// Give up when the peer is silent this long (default: wait forever)
    #[arg(long, value_name = "MS")]
    timeout_ms: Option<u64>,

    /// Enable debug output
    #[arg(long)]
    debug: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Answer requests from the peer out of a folder
    Serve {
        /// Folder whose files are listed, sent and replaced
        #[arg(short, long, default_value = ".")]
        folder: PathBuf,
    },
    /// List the files the peer serves
    List,
    /// Send a file to the peer
    Send {
        /// File to send
        file: PathBuf,
        /// Replace the file if the peer already has one by that name
        #[arg(short, long)]
        force: bool,
    },
    /// Fetch a file from the peer
    Receive {
        /// Name of the remote file
        name: String,
        /// Directory to save the file in
        #[arg(short, long, default_value = ".")]
        output_dir: PathBuf,
        /// Replace an existing local file
        #[arg(short, long)]
        force: bool,
    },
}

fn parse_data_bits(bits: u8) -> Result<DataBits, String> {
    match bits {
        5 => Ok(DataBits::Five),
        6 => Ok(DataBits::Six),
        7 => Ok(DataBits::Seven),
        8 => Ok(DataBits::Eight),
        _ => Err(format!("Invalid data bits: {}. Must be 5, 6, 7, or 8", bits)),
    }
}

fn parse_parity(parity: &str) -> Result<Parity, String> {
    match parity.to_lowercase().as_str() {
        "none" => Ok(Parity::None),
        "odd" => Ok(Parity::Odd),
        "even" => Ok(Parity::Even),
        _ => Err(format!("Invalid parity: {}. Must be 'none', 'odd', or 'even'", parity)),
    }
}

fn parse_stop_bits(bits: u8) -> Result<StopBits, String> {
    match bits {
        1 => Ok(StopBits::One),
        2 => Ok(StopBits::Two),
        _ => Err(format!("Invalid stop bits: {}. Must be 1 or 2", bits)),
    }
}

impl Cli {
    fn serial_config(&self) -> Result<SerialConfig, String> {
        Ok(SerialConfig {
            port: self.port.clone(),
            baud_rate: self.baud,
            data_bits: parse_data_bits(self.data_bits)?,
            parity: parse_parity(&self.parity)?,
            stop_bits: parse_stop_bits(self.stop_bits)?,
        })
    }

    fn session_config(&self) -> SessionConfig {
        SessionConfig {
            timeout: self.timeout_ms.map(Duration::from_millis),
        }
    }
}

fn init_logging(debug: bool) {
    let level = if debug { "debug" } else { "info" };
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(level));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(io::stderr)
        .init();
}

fn main() {
    let cli = Cli::parse();
    init_logging(cli.debug);

    let serial_config = match cli.serial_config() {
        Ok(config) => config,
        Err(e) => {
            eprintln!("Error: {}", e);
            std::process::exit(1);
        }
    };
    let session_config = cli.session_config();

    info!(
        "opening {} at {} baud, {:?}, {:?}, {:?}",
        serial_config.port,
        serial_config.baud_rate,
        serial_config.data_bits,
        serial_config.parity,
        serial_config.stop_bits
    );

    match execute(cli.command, &serial_config, &session_config) {
        Ok(Some(Outcome::Declined(reason))) => {
            eprintln!("Declined: {}", reason);
            std::process::exit(2);
        }
        Ok(_) => {}
        Err(e) => {
            eprintln!("Error: {}", e);
            std::process::exit(1);
        }
    }
}

fn execute(
    command: Commands,
    serial_config: &SerialConfig,
    session_config: &SessionConfig,
) -> Result<Option<Outcome>, SessionError> {
    match command {
        Commands::Serve { folder } => {
            require_dir(&folder)?;
            let store = FolderStore::new(folder);
            let mut wire = Wire::new(Link::open(serial_config)?, session_config);
            info!("serving {}", store.root().display());
            Responder::new(store).run(&mut wire)?;
            Ok(None)
        }
        Commands::List => {
            let mut session = Session::new(Link::open(serial_config)?, session_config);
            let outcome = session.run(Request::ListFiles)?;
            if let Outcome::Listed(files) = &outcome {
                for file in files {
                    println!(
                        "{:<32} {:>10}  {}  {}",
                        file.name,
                        file.size,
                        file.created.format("%Y-%m-%d %H:%M:%S"),
                        file.modified.format("%Y-%m-%d %H:%M:%S")
                    );
                }
            }
            Ok(Some(outcome))
        }
        Commands::Send { file, force } => {
            let request = upload_request(&file, force)?;
            let mut session = Session::new(Link::open(serial_config)?, session_config);
            let outcome = session.run(request)?;
            if outcome == Outcome::Sent {
                println!("Sent {}", file.display());
            }
            Ok(Some(outcome))
        }
        Commands::Receive { name, output_dir, force } => {
            require_dir(&output_dir)?;
            let mut session = Session::new(Link::open(serial_config)?, session_config);
            let request = Request::ReceiveFile {
                filename: name,
                overwrite: force,
                destination: Box::new(FolderStore::new(&output_dir)),
            };
            let outcome = session.run(request)?;
            if let Outcome::Received(file) = &outcome {
                println!("Received {} ({} bytes) into {}", file.name, file.size, output_dir.display());
            }
            Ok(Some(outcome))
        }
    }
}

/// The local file must be readable before anything goes on the wire.
fn upload_request(path: &Path, overwrite: bool) -> Result<Request, SessionError> {
    let file = File::open(path).map_err(|e| {
        io::Error::new(e.kind(), format!("{}: {}", path.display(), e))
    })?;
    let length = file.metadata()?.len();
    let filename = path
        .file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .ok_or_else(|| io::Error::new(io::ErrorKind::InvalidInput, format!("Not a file: {}", path.display())))?;

    Ok(Request::SendFile {
        filename,
        overwrite,
        source: Box::new(BufReader::new(file)),
        length,
    })
}

fn require_dir(path: &Path) -> io::Result<()> {
    if path.is_dir() {
        Ok(())
    } else {
        Err(io::Error::new(
            io::ErrorKind::NotFound,
            format!("Directory not found: {}", path.display()),
        ))
    }
}

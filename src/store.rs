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

//! Where file content comes from and goes to. The protocol core only sees
//! readers and writers handed out by a `ContentStore`.

use std::fs::{self, File, OpenOptions};
use std::io::{self, BufWriter, Read, Write};
use std::path::{Path, PathBuf};
use chrono::{DateTime, Utc};
use thiserror::Error;
use crate::messages::FileEntry;

// ============================================================================
// Error Types
// ============================================================================

/// Display strings double as the `error` text of a declined response.
#[derive(Debug, Error)]
pub enum StoreError {
    #[error("File not found")]
    NotFound,

    #[error("File exists at destination")]
    DestinationExists,

    #[error("Invalid file name '{0}'")]
    InvalidName(String),

    #[error("{0}")]
    Io(#[from] io::Error),
}

// ============================================================================
// Trait
// ============================================================================

pub trait ContentStore: Send {
    fn list(&self) -> Result<Vec<FileEntry>, StoreError>;

    /// Open a stored file for reading, with its attributes.
    fn open_read(&self, name: &str) -> Result<(FileEntry, Box<dyn Read + Send>), StoreError>;

    /// Open a destination for writing. Without `overwrite` an existing
    /// file is refused and left untouched.
    fn open_write(&self, name: &str, overwrite: bool) -> Result<Box<dyn Write + Send>, StoreError>;
}

// ============================================================================
// Folder Store
// ============================================================================

/// Serves the plain files of a single directory.
pub struct FolderStore {
    root: PathBuf,
}

impl FolderStore {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        FolderStore { root: root.into() }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Only the final component of a peer-supplied name is honoured.
    pub fn resolve(&self, name: &str) -> Result<PathBuf, StoreError> {
        let file_name = Path::new(name)
            .file_name()
            .and_then(|n| n.to_str())
            .filter(|n| !n.is_empty() && *n != "." && *n != "..")
            .ok_or_else(|| StoreError::InvalidName(name.to_string()))?;
        Ok(self.root.join(file_name))
    }
}

impl ContentStore for FolderStore {
    fn list(&self) -> Result<Vec<FileEntry>, StoreError> {
        let mut files = Vec::new();
        for entry in fs::read_dir(&self.root)? {
            let entry = entry?;
            let metadata = entry.metadata()?;
            if !metadata.is_file() {
                continue;
            }
            let name = entry.file_name().to_string_lossy().into_owned();
            files.push(file_entry(name, &metadata));
        }
        files.sort_by(|a, b| a.name.cmp(&b.name));
        Ok(files)
    }

    fn open_read(&self, name: &str) -> Result<(FileEntry, Box<dyn Read + Send>), StoreError> {
        let path = self.resolve(name)?;
        let file = File::open(&path).map_err(not_found)?;
        let metadata = file.metadata()?;
        if !metadata.is_file() {
            return Err(StoreError::NotFound);
        }
        let name = path
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_default();
        Ok((file_entry(name, &metadata), Box::new(file)))
    }

    fn open_write(&self, name: &str, overwrite: bool) -> Result<Box<dyn Write + Send>, StoreError> {
        let path = self.resolve(name)?;
        let mut options = OpenOptions::new();
        options.write(true);
        if overwrite {
            options.create(true).truncate(true);
        } else {
            options.create_new(true);
        }
        let file = options.open(&path).map_err(|e| match e.kind() {
            io::ErrorKind::AlreadyExists => StoreError::DestinationExists,
            _ => StoreError::Io(e),
        })?;
        Ok(Box::new(BufWriter::new(file)))
    }
}

fn not_found(e: io::Error) -> StoreError {
    match e.kind() {
        io::ErrorKind::NotFound => StoreError::NotFound,
        _ => StoreError::Io(e),
    }
}

fn file_entry(name: String, metadata: &fs::Metadata) -> FileEntry {
    let modified = metadata.modified().map(DateTime::<Utc>::from).unwrap_or_default();
    // Not every filesystem records a birth time
    let created = metadata.created().map(DateTime::<Utc>::from).unwrap_or(modified);
    FileEntry {
        name,
        created,
        modified,
        size: metadata.len(),
    }
}

// ============================================================================
// Tests
// ============================================================================

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

//! JSON records carried inside operation payloads

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FileEntry {
    pub name: String,
    pub created: DateTime<Utc>,
    pub modified: DateTime<Utc>,
    pub size: u64,
}

/// Reply to ListFilesRequest
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ListFilesResponse {
    pub success: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    #[serde(default)]
    pub files: Vec<FileEntry>,
}

impl ListFilesResponse {
    pub fn ok(files: Vec<FileEntry>) -> Self {
        ListFilesResponse { success: true, error: None, files }
    }

    pub fn failed(error: impl Into<String>) -> Self {
        ListFilesResponse { success: false, error: Some(error.into()), files: Vec::new() }
    }
}

/// Metadata block at the head of a SendFileRequest
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SendFileMetadata {
    pub filename: String,
    #[serde(default)]
    pub overwrite: bool,
}

/// Reply to SendFileRequest
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StatusResponse {
    pub success: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl StatusResponse {
    pub fn ok() -> Self {
        StatusResponse { success: true, error: None }
    }

    pub fn declined(error: impl Into<String>) -> Self {
        StatusResponse { success: false, error: Some(error.into()) }
    }
}

/// Body of a ReceiveFileRequest
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ReceiveFileRequest {
    pub filename: String,
}

/// Metadata block at the head of a ReceiveFileResponse. `file` is present
/// only when `success` is set.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ReceiveFileMetadata {
    pub success: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub file: Option<FileEntry>,
}

impl ReceiveFileMetadata {
    pub fn found(file: FileEntry) -> Self {
        ReceiveFileMetadata { success: true, error: None, file: Some(file) }
    }

    pub fn declined(error: impl Into<String>) -> Self {
        ReceiveFileMetadata { success: false, error: Some(error.into()), file: None }
    }
}

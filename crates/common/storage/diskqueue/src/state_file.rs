// Copyright 2025 Crrow
//
// Licensed under the Apache License, Version 2.0 (the "License");
// you may not use this file except in compliance with the License.
// You may obtain a copy of the License at
//
//      http://www.apache.org/licenses/LICENSE-2.0
//
// Unless required by applicable law or agreed to in writing, software
// distributed under the License is distributed on an "AS IS" BASIS,
// WITHOUT WARRANTIES OR CONDITIONS OF ANY KIND, either express or implied.
// See the License for the specific language governing permissions and
// limitations under the License.

//! Persistent read position of the queue, stored in `state.dat`.
//!
//! Layout (little-endian):
//!
//! ```text
//! ┌──────────────┬──────────────────┬──────────────────┬───────────────────┐
//! │ Version (4B) │ Segment id (8B)  │ Byte index (8B)  │ Frame index (8B)  │
//! └──────────────┴──────────────────┴──────────────────┴───────────────────┘
//! ```
//!
//! Version 0 files lack the frame index. The record is overwritten in place
//! each time the acknowledged position advances; an empty file means nothing
//! has been acknowledged yet.

use std::{
    fs::{File, OpenOptions},
    io::{Read, Seek, SeekFrom, Write},
    path::{Path, PathBuf},
};

use snafu::{ResultExt, ensure};
use tracing::debug;

use crate::{
    Result,
    config::FlushMode,
    error::{FileIoSnafu, StateFileCorruptedSnafu, UnsupportedStateVersionSnafu},
    segment::SegmentId,
};

pub(crate) const STATE_FILE_NAME: &str = "state.dat";
const STATE_VERSION: u32 = 1;
const STATE_V0_SIZE: usize = 20;
const STATE_V1_SIZE: usize = 28;

/// Position of the oldest unacknowledged frame.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct QueuePosition {
    pub segment_id:  SegmentId,
    /// Logical offset of the frame within its segment.
    pub byte_index:  u64,
    /// Frames acknowledged before `byte_index` in this segment.
    pub frame_index: u64,
}

impl QueuePosition {
    pub(crate) const fn new(segment_id: SegmentId, byte_index: u64, frame_index: u64) -> Self {
        Self {
            segment_id,
            byte_index,
            frame_index,
        }
    }

    fn encode(&self) -> [u8; STATE_V1_SIZE] {
        let mut buf = [0u8; STATE_V1_SIZE];
        buf[0..4].copy_from_slice(&STATE_VERSION.to_le_bytes());
        buf[4..12].copy_from_slice(&self.segment_id.to_le_bytes());
        buf[12..20].copy_from_slice(&self.byte_index.to_le_bytes());
        buf[20..28].copy_from_slice(&self.frame_index.to_le_bytes());
        buf
    }

    fn decode(data: &[u8], path: &Path) -> Result<Self> {
        ensure!(
            data.len() >= 4,
            StateFileCorruptedSnafu {
                path,
                reason: format!("{} bytes is too short for a version", data.len()),
            }
        );
        let version = u32::from_le_bytes([data[0], data[1], data[2], data[3]]);
        let expected = match version {
            0 => STATE_V0_SIZE,
            1 => STATE_V1_SIZE,
            _ => return UnsupportedStateVersionSnafu { version }.fail(),
        };
        ensure!(
            data.len() >= expected,
            StateFileCorruptedSnafu {
                path,
                reason: format!(
                    "version {version} record needs {expected} bytes, found {}",
                    data.len()
                ),
            }
        );

        let read_u64 = |at: usize| {
            let mut bytes = [0u8; 8];
            bytes.copy_from_slice(&data[at..at + 8]);
            u64::from_le_bytes(bytes)
        };
        Ok(Self {
            segment_id:  read_u64(4),
            byte_index:  read_u64(12),
            frame_index: if version == 0 { 0 } else { read_u64(20) },
        })
    }
}

/// Open handle on `state.dat`.
pub(crate) struct StateFile {
    path:       PathBuf,
    file:       File,
    flush_mode: FlushMode,
}

impl StateFile {
    /// Opens or creates the state file in `dir` and reads the stored position.
    pub(crate) fn open(dir: &Path, flush_mode: FlushMode) -> Result<(Self, QueuePosition)> {
        let path = dir.join(STATE_FILE_NAME);
        let mut file = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .truncate(false)
            .open(&path)
            .context(FileIoSnafu { path: &path })?;

        let mut data = Vec::new();
        file.read_to_end(&mut data)
            .context(FileIoSnafu { path: &path })?;
        let position = if data.is_empty() {
            QueuePosition::default()
        } else {
            QueuePosition::decode(&data, &path)?
        };
        debug!(path = ?path, ?position, "State file opened");

        Ok((
            Self {
                path,
                file,
                flush_mode,
            },
            position,
        ))
    }

    /// Overwrites the stored position.
    pub(crate) fn write(&mut self, position: &QueuePosition) -> Result<()> {
        let path = &self.path;
        self.file
            .seek(SeekFrom::Start(0))
            .context(FileIoSnafu { path })?;
        self.file
            .write_all(&position.encode())
            .context(FileIoSnafu { path })?;
        self.file.flush().context(FileIoSnafu { path })?;
        if self.flush_mode == FlushMode::Sync {
            self.file.sync_data().context(FileIoSnafu { path })?;
        }
        Ok(())
    }
}

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

use std::{fmt, path::PathBuf, time::Duration};

use num_enum::{IntoPrimitive, TryFromPrimitive};
use serde::{Deserialize, Serialize};
use smart_default::SmartDefault;
use snafu::ensure;

use crate::{Result, error::InvalidSettingsSnafu, frame::FRAME_METADATA_SIZE};

/// Size in bytes of an encryption key.
pub const ENCRYPTION_KEY_SIZE: usize = 16;

/// Settings for a disk queue instance.
///
/// Sizes are in bytes of the logical frame stream, i.e. before compression
/// and encryption are applied.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, SmartDefault)]
#[serde(default)]
pub struct QueueConfig {
    /// Directory holding segment files and the state file.
    #[default(PathBuf::from("./diskqueue"))]
    pub path:               PathBuf,
    /// Cap on bytes held by the queue, on disk or waiting to be written.
    /// Zero means unbounded.
    #[default(10 * 1024 * 1024 * 1024)]
    pub max_buffer_size:    u64,
    /// Largest logical size of a single segment file.
    #[default(100 * 1024 * 1024)]
    pub max_segment_size:   u64,
    /// Number of decoded frames buffered for consumers.
    #[default = 512]
    pub read_ahead_limit:   usize,
    /// Number of accepted frames allowed to wait for the writer.
    #[default = 2048]
    pub write_ahead_limit:  usize,
    #[default(ChecksumType::Crc32)]
    pub checksum_type:      ChecksumType,
    /// Enables encryption of new segments when set.
    pub encryption_key:     Option<EncryptionKey>,
    #[default = false]
    pub use_compression:    bool,
    #[default(FlushMode::Sync)]
    pub flush_mode:         FlushMode,
    /// First backoff delay after a failed disk write.
    #[serde(with = "humantime_serde")]
    #[default(Duration::from_secs(1))]
    pub retry_interval:     Duration,
    /// Upper bound of the write retry backoff.
    #[serde(with = "humantime_serde")]
    #[default(Duration::from_secs(30))]
    pub max_retry_interval: Duration,
}

impl QueueConfig {
    /// Checks the settings for values the queue cannot run with.
    pub fn validate(&self) -> Result<()> {
        ensure!(
            self.max_segment_size > FRAME_METADATA_SIZE,
            InvalidSettingsSnafu {
                reason: format!(
                    "max_segment_size must exceed the {FRAME_METADATA_SIZE} bytes of frame metadata"
                ),
            }
        );
        ensure!(
            self.max_segment_size <= u64::from(u32::MAX),
            InvalidSettingsSnafu {
                reason: "max_segment_size must fit in a 32-bit frame length",
            }
        );
        ensure!(
            self.max_buffer_size == 0 || self.max_buffer_size >= self.max_segment_size,
            InvalidSettingsSnafu {
                reason: format!(
                    "max_buffer_size ({}) must be 0 or at least max_segment_size ({})",
                    self.max_buffer_size, self.max_segment_size
                ),
            }
        );
        ensure!(
            self.read_ahead_limit > 0,
            InvalidSettingsSnafu {
                reason: "read_ahead_limit must be positive",
            }
        );
        ensure!(
            self.write_ahead_limit > 0,
            InvalidSettingsSnafu {
                reason: "write_ahead_limit must be positive",
            }
        );
        ensure!(
            self.retry_interval <= self.max_retry_interval,
            InvalidSettingsSnafu {
                reason: "retry_interval must not exceed max_retry_interval",
            }
        );
        Ok(())
    }

    /// Buffer cap, or `None` when the queue is unbounded.
    #[must_use]
    pub const fn byte_limit(&self) -> Option<u64> {
        if self.max_buffer_size == 0 {
            None
        } else {
            Some(self.max_buffer_size)
        }
    }
}

/// Checksum algorithm stored in each segment header.
#[derive(
    Debug,
    Clone,
    Copy,
    PartialEq,
    Eq,
    Serialize,
    Deserialize,
    IntoPrimitive,
    TryFromPrimitive,
)]
#[serde(rename_all = "snake_case")]
#[repr(u32)]
pub enum ChecksumType {
    None  = 0,
    Crc32 = 1,
}

/// How hard the queue pushes written bytes toward the disk.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FlushMode {
    /// Flush user-space buffers only, the OS decides when data hits disk.
    Async,
    /// fsync segments after each write batch and the state file after each
    /// cursor advance.
    Sync,
}

/// AES-128 key used for segment encryption.
#[derive(Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct EncryptionKey([u8; ENCRYPTION_KEY_SIZE]);

impl EncryptionKey {
    #[must_use]
    pub const fn new(bytes: [u8; ENCRYPTION_KEY_SIZE]) -> Self { Self(bytes) }

    #[must_use]
    pub const fn as_bytes(&self) -> &[u8; ENCRYPTION_KEY_SIZE] { &self.0 }
}

impl fmt::Debug for EncryptionKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("EncryptionKey(<redacted>)")
    }
}

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

use std::{io, path::PathBuf};

use snafu::Snafu;

use crate::{frame::FrameId, segment::SegmentId};

/// Disk queue errors.
#[derive(Debug, Snafu)]
#[snafu(visibility(pub(crate)))]
pub enum QueueError {
    /// Filesystem I/O failure.
    #[snafu(display("IO error: {source}"), context(false))]
    Io { source: io::Error },

    /// Filesystem I/O failure on a known path.
    #[snafu(display("IO error on {}: {source}", path.display()))]
    FileIo { path: PathBuf, source: io::Error },

    /// The queue has shut down.
    #[snafu(display("Queue is closed"))]
    QueueClosed,

    /// The producer was cancelled before the request was admitted.
    #[snafu(display("Producer {producer_id} is cancelled"))]
    ProducerCancelled { producer_id: u64 },

    /// No capacity left and the caller asked not to block.
    #[snafu(display("Queue is full"))]
    QueueFull,

    /// The frame can never fit in a segment.
    #[snafu(display("Frame of {size} bytes exceeds the maximum segment size of {max} bytes"))]
    FrameTooLarge { size: u64, max: u64 },

    #[snafu(display("Invalid queue settings: {reason}"))]
    InvalidSettings { reason: String },

    /// Checksum, length or truncation failure while decoding a frame.
    #[snafu(display("Corrupted frame in segment {segment_id} at offset {offset}: {reason}"))]
    CorruptedFrame {
        segment_id: SegmentId,
        offset:     u64,
        reason:     String,
    },

    #[snafu(display("Invalid segment header in {}: {reason}", path.display()))]
    InvalidSegmentHeader { path: PathBuf, reason: String },

    #[snafu(display("Unsupported version {version} in segment {}", path.display()))]
    UnsupportedSegmentVersion { path: PathBuf, version: u32 },

    #[snafu(display("Unknown checksum type {value}"))]
    UnknownChecksumType { value: u32 },

    #[snafu(display("Segment {segment_id} is encrypted but no encryption key is configured"))]
    MissingEncryptionKey { segment_id: SegmentId },

    #[snafu(display("State file {} is corrupted: {reason}", path.display()))]
    StateFileCorrupted { path: PathBuf, reason: String },

    #[snafu(display("Unsupported state file version {version}"))]
    UnsupportedStateVersion { version: u32 },

    #[snafu(display("Failed to encode event: {source}"))]
    EncodeEvent {
        source: bincode::error::EncodeError,
    },

    #[snafu(display("Failed to decode frame {frame_id}: {source}"))]
    DecodeEvent {
        frame_id: FrameId,
        source:   bincode::error::DecodeError,
    },

    #[snafu(display("{name} thread panicked"))]
    ThreadPanic { name: String },

    #[snafu(display("Internal error: {message}"))]
    Internal { message: String },
}

/// Result type for disk queue operations.
pub type Result<T, E = QueueError> = std::result::Result<T, E>;

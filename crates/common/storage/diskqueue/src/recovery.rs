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

//! Rebuilds the segment lists when a queue is opened.
//!
//! 1. Read `state.dat` for the oldest unacknowledged position
//! 2. Segments below that position's segment are already acknowledged and
//!    queued for deletion
//! 3. Every other segment is scanned frame by frame for its logical end
//! 4. New writes go to a fresh segment after the last existing one

use std::{fs, path::Path};

use snafu::ResultExt;
use tracing::{debug, info, warn};

use crate::{
    QueueConfig, QueueError, Result,
    config::EncryptionKey,
    error::FileIoSnafu,
    frame::read_frame,
    segment::{QueueSegment, SegmentId, SegmentReader, Segments},
    state_file::{QueuePosition, StateFile},
};

/// State needed to start the core loop.
pub(crate) struct RecoveryResult {
    pub segments:   Segments,
    pub state_file: StateFile,
    pub position:   QueuePosition,
}

/// Opens the queue directory and rebuilds the segment lists.
pub(crate) fn recover(config: &QueueConfig) -> Result<RecoveryResult> {
    info!(path = ?config.path, "Starting queue recovery");

    fs::create_dir_all(&config.path).context(FileIoSnafu { path: &config.path })?;
    let (state_file, position) = StateFile::open(&config.path, config.flush_mode)?;

    let mut segments = Segments::default();
    let mut last_id = None;
    let mut position_segment_found = false;
    for (id, path) in crate::segment::scan_segment_files(&config.path)? {
        last_id = Some(id);
        if id < position.segment_id {
            // Deleted right away, so it is not counted against the buffer.
            debug!(segment_id = id, path = ?path, "Segment already acknowledged");
            segments.acked.push_back(QueueSegment::new(id));
            continue;
        }
        position_segment_found |= id == position.segment_id;

        let end_offset = scan_segment(&path, id, config.encryption_key.as_ref())?;
        segments
            .reading
            .push_back(QueueSegment::with_end_offset(id, end_offset));
    }

    segments.next_read_offset = match segments.reading.front() {
        Some(front) if front.id == position.segment_id => position.byte_index.min(front.end_offset),
        _ => 0,
    };
    // The acknowledgment cursor only recognizes a new segment by its id, so
    // a cursor left inside a deleted segment must not see that id again.
    let position_has_progress = position.byte_index > 0 || position.frame_index > 0;
    let min_next_id = if position_has_progress && !position_segment_found {
        position.segment_id + 1
    } else {
        position.segment_id
    };
    segments.next_id = last_id.map_or(0, |id| id + 1).max(min_next_id);

    info!(
        reading = segments.reading.len(),
        acked = segments.acked.len(),
        next_segment_id = segments.next_id,
        read_offset = segments.next_read_offset,
        ?position,
        "Queue recovery complete"
    );

    Ok(RecoveryResult {
        segments,
        state_file,
        position,
    })
}

/// Returns the logical end of the last intact frame in a segment.
fn scan_segment(path: &Path, id: SegmentId, key: Option<&EncryptionKey>) -> Result<u64> {
    let mut reader = match SegmentReader::open(path, id, key, 0) {
        Ok(reader) => reader,
        Err(
            e @ (QueueError::MissingEncryptionKey { .. }
            | QueueError::UnsupportedSegmentVersion { .. }),
        ) => return Err(e),
        Err(e) => {
            warn!(segment_id = id, error = %e, "Unreadable segment header, treating segment as empty");
            return Ok(0);
        }
    };

    let checksum = reader.checksum_type();
    let mut offset = 0u64;
    let mut frames = 0u64;
    loop {
        match read_frame(&mut reader, checksum, id, offset, u64::MAX) {
            Ok(Some(payload)) => {
                offset += crate::frame::frame_disk_size(payload.len());
                frames += 1;
            }
            Ok(None) => break,
            Err(e) => {
                warn!(
                    segment_id = id,
                    offset,
                    error = %e,
                    "Stopping segment scan at unreadable frame"
                );
                break;
            }
        }
    }

    debug!(segment_id = id, frames, end_offset = offset, "Segment scanned");
    Ok(offset)
}

#[cfg(test)]
mod tests {
    use std::path::PathBuf;

    use tempfile::TempDir;

    use super::*;
    use crate::{
        config::{ENCRYPTION_KEY_SIZE, FlushMode},
        frame::encode_frame,
        segment::{SegmentWriter, segment_path},
    };

    fn test_config(path: PathBuf) -> QueueConfig {
        QueueConfig {
            path,
            ..Default::default()
        }
    }

    fn write_segment(config: &QueueConfig, id: SegmentId, count: usize) -> u64 {
        let mut writer = SegmentWriter::create(&config.path, id, config).unwrap();
        let mut buf = Vec::new();
        let mut size = 0;
        for i in 0..count {
            size += encode_frame(&mut buf, format!("msg-{i}").as_bytes(), config.checksum_type);
        }
        let mut rest = buf.as_slice();
        while !rest.is_empty() {
            let n = writer.write(rest).unwrap();
            rest = &rest[n..];
        }
        writer.finish(FlushMode::Sync).unwrap();
        size
    }

    #[test]
    fn test_recovery_empty_directory() {
        let temp_dir = TempDir::new().unwrap();
        let config = test_config(temp_dir.path().join("queue"));

        let result = recover(&config).unwrap();

        assert_eq!(result.position, QueuePosition::default());
        assert_eq!(result.segments.next_id, 0);
        assert_eq!(result.segments.segment_count(), 0);
        assert!(config.path.join("state.dat").exists());
    }

    #[test]
    fn test_recovery_resumes_at_persisted_position() {
        let temp_dir = TempDir::new().unwrap();
        let config = test_config(temp_dir.path().to_path_buf());
        write_segment(&config, 0, 3);
        let size = write_segment(&config, 1, 5);
        write_segment(&config, 2, 2);
        {
            let (mut state, _) = StateFile::open(&config.path, FlushMode::Sync).unwrap();
            state.write(&QueuePosition::new(1, 34, 2)).unwrap();
        }

        let result = recover(&config).unwrap();
        let segments = &result.segments;

        assert_eq!(segments.acked.len(), 1);
        assert_eq!(segments.acked[0].id, 0);
        assert_eq!(segments.acked[0].end_offset, 0);
        assert_eq!(
            segments.reading.iter().map(|s| s.id).collect::<Vec<_>>(),
            vec![1, 2]
        );
        assert_eq!(segments.reading[0].end_offset, size);
        assert_eq!(segments.next_read_offset, 34);
        assert_eq!(segments.next_id, 3);
    }

    #[test]
    fn test_recovery_stops_at_corrupted_frame() {
        let temp_dir = TempDir::new().unwrap();
        let config = test_config(temp_dir.path().to_path_buf());
        let size = write_segment(&config, 0, 4);

        // Flip a byte inside the last frame.
        let path = segment_path(&config.path, 0);
        let mut data = fs::read(&path).unwrap();
        let last = data.len() - 6;
        data[last] ^= 0xFF;
        fs::write(&path, data).unwrap();

        let result = recover(&config).unwrap();
        let frame_size = size / 4;
        assert_eq!(result.segments.reading[0].end_offset, frame_size * 3);
    }

    #[test]
    fn test_missing_persisted_segment_reads_from_start() {
        let temp_dir = TempDir::new().unwrap();
        let config = test_config(temp_dir.path().to_path_buf());
        write_segment(&config, 5, 1);
        {
            let (mut state, _) = StateFile::open(&config.path, FlushMode::Sync).unwrap();
            state.write(&QueuePosition::new(4, 100, 3)).unwrap();
        }

        let result = recover(&config).unwrap();
        assert_eq!(result.segments.reading[0].id, 5);
        assert_eq!(result.segments.next_read_offset, 0);
        assert_eq!(result.segments.next_id, 6);
    }

    #[test]
    fn test_deleted_position_segment_id_is_not_reused() {
        let temp_dir = TempDir::new().unwrap();
        let config = test_config(temp_dir.path().to_path_buf());
        {
            let (mut state, _) = StateFile::open(&config.path, FlushMode::Sync).unwrap();
            state.write(&QueuePosition::new(0, 99, 3)).unwrap();
        }

        let result = recover(&config).unwrap();
        assert_eq!(result.segments.segment_count(), 0);
        assert_eq!(result.segments.next_id, 1);
    }

    #[test]
    fn test_position_at_segment_start_keeps_its_id() {
        let temp_dir = TempDir::new().unwrap();
        let config = test_config(temp_dir.path().to_path_buf());
        {
            let (mut state, _) = StateFile::open(&config.path, FlushMode::Sync).unwrap();
            state.write(&QueuePosition::new(2, 0, 0)).unwrap();
        }

        let result = recover(&config).unwrap();
        assert_eq!(result.segments.next_id, 2);
    }

    #[test]
    fn test_encrypted_segment_without_key_fails() {
        let temp_dir = TempDir::new().unwrap();
        let mut config = test_config(temp_dir.path().to_path_buf());
        config.encryption_key = Some(EncryptionKey::new([1; ENCRYPTION_KEY_SIZE]));
        write_segment(&config, 0, 1);

        config.encryption_key = None;
        assert!(matches!(
            recover(&config),
            Err(QueueError::MissingEncryptionKey { segment_id: 0 })
        ));
    }

    #[test]
    fn test_garbage_header_counts_as_empty() {
        let temp_dir = TempDir::new().unwrap();
        let config = test_config(temp_dir.path().to_path_buf());
        fs::write(segment_path(&config.path, 0), b"xx").unwrap();

        let result = recover(&config).unwrap();
        assert_eq!(result.segments.reading[0].end_offset, 0);
        assert_eq!(result.segments.next_id, 1);
    }
}

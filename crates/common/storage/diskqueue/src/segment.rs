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

//! Segment files and the core loop's segment bookkeeping.
//!
//! Each segment is a file named `<id>.seg` that starts with a 12-byte plain
//! header:
//!
//! ```text
//! ┌────────────────┬──────────────────────┬────────────────┐
//! │ Version (4B)   │ Checksum type (4B)   │ Options (4B)   │
//! └────────────────┴──────────────────────┴────────────────┘
//! ```
//!
//! Options bit 0 marks an encrypted segment (a 16-byte IV follows the header)
//! and bit 1 a compressed one. Frames follow, passed through compression and
//! then encryption. All offsets tracked by the queue are positions in the
//! logical frame stream, so offset 0 is the first byte of the first frame.

use std::{
    collections::VecDeque,
    fs::{self, File, OpenOptions},
    io::{self, BufReader, BufWriter, Read, Seek, SeekFrom, Write},
    path::{Path, PathBuf},
};

use snafu::{ResultExt, ensure};

use crate::{
    QueueConfig, Result,
    config::{ChecksumType, EncryptionKey, FlushMode},
    compression::{CompressionReader, CompressionWriter},
    encryption::{EncryptionReader, EncryptionWriter},
    error::{
        CorruptedFrameSnafu, FileIoSnafu, InvalidSegmentHeaderSnafu, MissingEncryptionKeySnafu,
        UnknownChecksumTypeSnafu, UnsupportedSegmentVersionSnafu,
    },
    frame::FrameId,
};

/// Identifier of a segment; also its file name.
pub type SegmentId = u64;

pub(crate) const SEGMENT_VERSION: u32 = 1;
pub(crate) const SEGMENT_HEADER_SIZE: usize = 12;
const SEGMENT_EXTENSION: &str = "seg";

const OPTION_ENCRYPTED: u32 = 1 << 0;
const OPTION_COMPRESSED: u32 = 1 << 1;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) struct SegmentHeader {
    pub version:       u32,
    pub checksum_type: ChecksumType,
    pub options:       u32,
}

impl SegmentHeader {
    /// Header for a segment created with the current settings.
    pub(crate) const fn for_config(config: &QueueConfig) -> Self {
        let mut options = 0;
        if config.encryption_key.is_some() {
            options |= OPTION_ENCRYPTED;
        }
        if config.use_compression {
            options |= OPTION_COMPRESSED;
        }
        Self {
            version: SEGMENT_VERSION,
            checksum_type: config.checksum_type,
            options,
        }
    }

    pub(crate) const fn encrypted(&self) -> bool { self.options & OPTION_ENCRYPTED != 0 }

    pub(crate) const fn compressed(&self) -> bool { self.options & OPTION_COMPRESSED != 0 }

    pub(crate) fn encode(&self) -> [u8; SEGMENT_HEADER_SIZE] {
        let mut buf = [0u8; SEGMENT_HEADER_SIZE];
        buf[0..4].copy_from_slice(&self.version.to_le_bytes());
        buf[4..8].copy_from_slice(&u32::from(self.checksum_type).to_le_bytes());
        buf[8..12].copy_from_slice(&self.options.to_le_bytes());
        buf
    }

    pub(crate) fn read_from<R: Read>(reader: &mut R, path: &Path) -> Result<Self> {
        let mut buf = [0u8; SEGMENT_HEADER_SIZE];
        reader
            .read_exact(&mut buf)
            .map_err(|e| {
                if e.kind() == io::ErrorKind::UnexpectedEof {
                    InvalidSegmentHeaderSnafu {
                        path,
                        reason: "file is shorter than the segment header",
                    }
                    .build()
                } else {
                    crate::QueueError::FileIo {
                        path:   path.to_path_buf(),
                        source: e,
                    }
                }
            })?;

        let version = u32::from_le_bytes([buf[0], buf[1], buf[2], buf[3]]);
        ensure!(
            version == SEGMENT_VERSION,
            UnsupportedSegmentVersionSnafu { path, version }
        );
        let value = u32::from_le_bytes([buf[4], buf[5], buf[6], buf[7]]);
        let checksum_type =
            ChecksumType::try_from(value).map_err(|_| UnknownChecksumTypeSnafu { value }.build())?;
        let options = u32::from_le_bytes([buf[8], buf[9], buf[10], buf[11]]);

        Ok(Self {
            version,
            checksum_type,
            options,
        })
    }
}

/// A segment as tracked by the core loop.
#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) struct QueueSegment {
    pub id:             SegmentId,
    /// Logical bytes of frames known to be written to this segment.
    pub end_offset:     u64,
    /// Frames delivered from this segment during this session.
    pub frames_read:    u64,
    /// Id of the first frame read from this segment during this session.
    pub first_frame_id: Option<FrameId>,
}

impl QueueSegment {
    pub(crate) const fn new(id: SegmentId) -> Self {
        Self {
            id,
            end_offset: 0,
            frames_read: 0,
            first_frame_id: None,
        }
    }

    pub(crate) const fn with_end_offset(id: SegmentId, end_offset: u64) -> Self {
        Self {
            id,
            end_offset,
            frames_read: 0,
            first_frame_id: None,
        }
    }
}

/// The four segment lists owned by the core loop.
///
/// A segment moves `writing → reading → acking → acked` and is removed once
/// the deleter confirms its file is gone. Every list is ordered by id.
#[derive(Debug, Default)]
pub(crate) struct Segments {
    /// Segments still receiving frames; only the back one is open.
    pub writing:              VecDeque<QueueSegment>,
    /// Closed segments with frames left to read.
    pub reading:              VecDeque<QueueSegment>,
    /// Fully read segments waiting for consumer acknowledgment.
    pub acking:               VecDeque<QueueSegment>,
    /// Acknowledged segments waiting for deletion.
    pub acked:                VecDeque<QueueSegment>,
    pub next_id:              SegmentId,
    /// Logical bytes assigned to the newest writing segment, including frames
    /// not yet written.
    pub writing_segment_size: u64,
    /// Read cursor within the first segment with unread frames.
    pub next_read_offset:     u64,
    pub next_read_frame_id:   FrameId,
}

impl Segments {
    /// Logical bytes of every segment the queue still holds.
    pub(crate) fn size_on_disk(&self) -> u64 {
        self.writing
            .iter()
            .chain(&self.reading)
            .chain(&self.acking)
            .chain(&self.acked)
            .map(|s| s.end_offset)
            .sum()
    }

    pub(crate) fn segment_count(&self) -> usize {
        self.writing.len() + self.reading.len() + self.acking.len() + self.acked.len()
    }
}

/// Path of segment `id` inside the queue directory.
pub(crate) fn segment_path(dir: &Path, id: SegmentId) -> PathBuf {
    dir.join(format!("{id}.{SEGMENT_EXTENSION}"))
}

/// Lists `(id, path)` of every segment file in `dir`, sorted by id.
///
/// Files whose stem is not a number are ignored.
pub(crate) fn scan_segment_files(dir: &Path) -> Result<Vec<(SegmentId, PathBuf)>> {
    let mut segments = Vec::new();
    if !dir.exists() {
        return Ok(segments);
    }

    for entry in fs::read_dir(dir).context(FileIoSnafu { path: dir })? {
        let path = entry.context(FileIoSnafu { path: dir })?.path();
        if path.extension().and_then(|s| s.to_str()) != Some(SEGMENT_EXTENSION) {
            continue;
        }
        if let Some(id) = path
            .file_stem()
            .and_then(|s| s.to_str())
            .and_then(|s| s.parse::<SegmentId>().ok())
        {
            segments.push((id, path));
        }
    }

    segments.sort_unstable_by_key(|(id, _)| *id);
    Ok(segments)
}

/// Readable logical frame stream of one segment.
pub(crate) struct SegmentReader {
    pub header: SegmentHeader,
    reader:     Box<dyn Read + Send>,
}

impl SegmentReader {
    /// Opens segment `id` and positions it at logical `offset`.
    ///
    /// The stream layers are chosen from the segment header, not from the
    /// current settings.
    pub(crate) fn open(
        path: &Path,
        id: SegmentId,
        key: Option<&EncryptionKey>,
        offset: u64,
    ) -> Result<Self> {
        let file = File::open(path).context(FileIoSnafu { path })?;
        let mut buffered = BufReader::new(file);
        let header = SegmentHeader::read_from(&mut buffered, path)?;

        let reader: Box<dyn Read + Send> = if header.encrypted() {
            let key = key.ok_or_else(|| MissingEncryptionKeySnafu { segment_id: id }.build())?;
            let mut decrypted =
                EncryptionReader::new(buffered, key).context(FileIoSnafu { path })?;
            if header.compressed() {
                Box::new(CompressionReader::new(decrypted).context(FileIoSnafu { path })?)
            } else {
                decrypted
                    .seek(SeekFrom::Start(offset))
                    .context(FileIoSnafu { path })?;
                return Ok(Self {
                    header,
                    reader: Box::new(decrypted),
                });
            }
        } else if header.compressed() {
            Box::new(CompressionReader::new(buffered).context(FileIoSnafu { path })?)
        } else {
            let delta = i64::try_from(offset)
                .map_err(|_| io::Error::new(io::ErrorKind::InvalidInput, "read offset out of range"))
                .context(FileIoSnafu { path })?;
            buffered
                .seek(SeekFrom::Current(delta))
                .context(FileIoSnafu { path })?;
            return Ok(Self {
                header,
                reader: Box::new(buffered),
            });
        };

        // A compressed stream cannot seek, so decode and discard up to
        // `offset`.
        let mut reader = reader;
        let skipped = io::copy(&mut reader.by_ref().take(offset), &mut io::sink())
            .context(FileIoSnafu { path })?;
        ensure!(
            skipped == offset,
            CorruptedFrameSnafu {
                segment_id: id,
                offset: skipped,
                reason: format!("segment ends before read offset {offset}"),
            }
        );
        Ok(Self { header, reader })
    }

    pub(crate) const fn checksum_type(&self) -> ChecksumType { self.header.checksum_type }
}

impl Read for SegmentReader {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> { self.reader.read(buf) }
}

enum SegmentSink {
    Raw(Box<dyn Write + Send>),
    Compressed(CompressionWriter<Box<dyn Write + Send>>),
}

impl Write for SegmentSink {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        match self {
            Self::Raw(w) => w.write(buf),
            Self::Compressed(w) => w.write(buf),
        }
    }

    fn flush(&mut self) -> io::Result<()> {
        match self {
            Self::Raw(w) => w.flush(),
            Self::Compressed(w) => w.flush(),
        }
    }
}

/// Write side of the segment currently receiving frames.
pub(crate) struct SegmentWriter {
    id:   SegmentId,
    path: PathBuf,
    /// Second handle on the file, used for fsync beneath the stream layers.
    file: File,
    sink: SegmentSink,
}

impl SegmentWriter {
    /// Creates (or truncates) the file for segment `id` and writes its header.
    pub(crate) fn create(dir: &Path, id: SegmentId, config: &QueueConfig) -> Result<Self> {
        let path = segment_path(dir, id);
        let file = OpenOptions::new()
            .write(true)
            .create(true)
            .truncate(true)
            .open(&path)
            .context(FileIoSnafu { path: &path })?;
        let sync_handle = file.try_clone().context(FileIoSnafu { path: &path })?;

        let header = SegmentHeader::for_config(config);
        let mut buffered = BufWriter::new(file);
        buffered
            .write_all(&header.encode())
            .context(FileIoSnafu { path: &path })?;

        let base: Box<dyn Write + Send> = match &config.encryption_key {
            Some(key) => Box::new(
                EncryptionWriter::new(buffered, key).context(FileIoSnafu { path: &path })?,
            ),
            None => Box::new(buffered),
        };
        let mut sink = if header.compressed() {
            SegmentSink::Compressed(CompressionWriter::new(base).context(FileIoSnafu { path: &path })?)
        } else {
            SegmentSink::Raw(base)
        };
        sink.flush().context(FileIoSnafu { path: &path })?;

        Ok(Self {
            id,
            path,
            file: sync_handle,
            sink,
        })
    }

    pub(crate) const fn id(&self) -> SegmentId { self.id }

    pub(crate) fn path(&self) -> &Path { &self.path }

    /// Writes part of `buf`, returning how many bytes were taken.
    pub(crate) fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        match self.sink.write(buf)? {
            0 => Err(io::ErrorKind::WriteZero.into()),
            n => Ok(n),
        }
    }

    /// Pushes buffered bytes to the file and, in sync mode, to the disk.
    pub(crate) fn sync(&mut self, mode: FlushMode) -> io::Result<()> {
        self.sink.flush()?;
        if mode == FlushMode::Sync {
            self.file.sync_data()?;
        }
        Ok(())
    }

    /// Ends the stream layers and syncs the file. The segment accepts no
    /// more frames afterwards; finishing again is harmless.
    pub(crate) fn finish(&mut self, mode: FlushMode) -> io::Result<()> {
        if let SegmentSink::Compressed(w) = &mut self.sink {
            w.finish()?;
        }
        self.sync(mode)
    }
}

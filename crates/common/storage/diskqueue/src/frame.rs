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

#![allow(clippy::cast_possible_truncation)]

//! Frame types and the on-disk frame format.
//!
//! A frame is one serialized event wrapped in framing metadata:
//!
//! ```text
//! ┌─────────────────┬──────────────────────┬─────────────────┬─────────────────┐
//! │  Length (4B)    │   Payload (variable) │  Checksum (4B)  │  Length (4B)    │
//! │  little-endian  │   raw bytes          │  little-endian  │  little-endian  │
//! └─────────────────┴──────────────────────┴─────────────────┴─────────────────┘
//! ```
//!
//! - **Length**: total frame size in bytes, metadata included
//! - **Checksum**: computed over the length field and the payload
//! - **Length (footer)**: repeats the header length so a truncated or
//!   overwritten trailing frame is detected
//!
//! Types:
//! - `WriteFrame`: an admitted frame on its way to the writer loop
//! - `Frame`: a frame decoded by the reader loop, tagged with its id
//! - `FrameAck`: the metadata of a delivered frame needed to acknowledge it

use std::io::{self, Read};

use bytes::Bytes;
use snafu::ensure;

use crate::{
    Result,
    config::ChecksumType,
    error::CorruptedFrameSnafu,
    segment::SegmentId,
};

/// Identifier of a frame read during this session. Ids restart at 0 when the
/// queue is opened and grow by one per frame in read order.
pub type FrameId = u64;

/// Size of the length prefix (and of the duplicated length footer).
pub(crate) const FRAME_LENGTH_SIZE: u64 = 4;

/// Size of the checksum field.
pub(crate) const FRAME_CHECKSUM_SIZE: u64 = 4;

/// Bytes of framing around every payload.
pub const FRAME_METADATA_SIZE: u64 = 2 * FRAME_LENGTH_SIZE + FRAME_CHECKSUM_SIZE;

/// On-disk size of a frame holding `payload_len` bytes.
#[inline]
#[must_use]
pub(crate) const fn frame_disk_size(payload_len: usize) -> u64 {
    payload_len as u64 + FRAME_METADATA_SIZE
}

/// A serialized event admitted by the core loop.
#[derive(Debug, Clone)]
pub(crate) struct WriteFrame {
    pub serialized: Bytes,
}

impl WriteFrame {
    pub(crate) const fn new(serialized: Bytes) -> Self { Self { serialized } }

    pub(crate) const fn size_on_disk(&self) -> u64 { frame_disk_size(self.serialized.len()) }
}

/// A frame decoded from a segment by the reader loop.
#[derive(Debug, Clone)]
pub(crate) struct Frame {
    pub id:               FrameId,
    pub segment_id:       SegmentId,
    /// True when this is the first frame of its segment, i.e. it was read
    /// from offset 0.
    pub first_in_segment: bool,
    pub serialized:       Bytes,
    pub bytes_on_disk:    u64,
}

impl Frame {
    pub(crate) const fn ack(&self) -> FrameAck {
        FrameAck {
            id:               self.id,
            segment_id:       self.segment_id,
            first_in_segment: self.first_in_segment,
            bytes_on_disk:    self.bytes_on_disk,
        }
    }
}

/// What the ACK tracker needs to know about a delivered frame.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) struct FrameAck {
    pub id:               FrameId,
    pub segment_id:       SegmentId,
    pub first_in_segment: bool,
    pub bytes_on_disk:    u64,
}

/// Appends the encoded frame for `payload` to `buf`, returning its size.
///
/// The caller guarantees the frame size fits in a `u32`; admission control
/// rejects anything larger than the maximum segment size, which is itself
/// bounded by `u32::MAX`.
pub(crate) fn encode_frame(buf: &mut Vec<u8>, payload: &[u8], checksum: ChecksumType) -> u64 {
    let size = frame_disk_size(payload.len());
    let length = size as u32;
    buf.reserve(size as usize);
    buf.extend_from_slice(&length.to_le_bytes());
    buf.extend_from_slice(payload);
    buf.extend_from_slice(&checksum.compute(length, payload).to_le_bytes());
    buf.extend_from_slice(&length.to_le_bytes());
    size
}

/// Decodes the next frame from `reader`.
///
/// Returns `Ok(None)` on a clean end of stream before the first byte of a
/// frame. `limit` bounds the frame size accepted; any frame that is longer,
/// truncated, has a mismatched footer or fails its checksum is reported as a
/// corrupted frame at `offset`.
pub(crate) fn read_frame<R: Read>(
    reader: &mut R,
    checksum: ChecksumType,
    segment_id: SegmentId,
    offset: u64,
    limit: u64,
) -> Result<Option<Bytes>> {
    let mut length_buf = [0u8; FRAME_LENGTH_SIZE as usize];
    let got = read_up_to(reader, &mut length_buf)?;
    if got == 0 {
        return Ok(None);
    }
    ensure!(
        got == length_buf.len(),
        CorruptedFrameSnafu {
            segment_id,
            offset,
            reason: "truncated frame length",
        }
    );

    let length = u32::from_le_bytes(length_buf);
    let size = u64::from(length);
    ensure!(
        size >= FRAME_METADATA_SIZE,
        CorruptedFrameSnafu {
            segment_id,
            offset,
            reason: format!("frame length {length} is smaller than the frame metadata"),
        }
    );
    ensure!(
        size <= limit,
        CorruptedFrameSnafu {
            segment_id,
            offset,
            reason: format!("frame length {length} exceeds the {limit} readable bytes"),
        }
    );

    // Grow the buffer with the data actually present so a corrupted length
    // cannot force a huge allocation.
    let payload_len = size - FRAME_METADATA_SIZE;
    let mut payload = Vec::new();
    reader.by_ref().take(payload_len).read_to_end(&mut payload)?;
    ensure!(
        payload.len() as u64 == payload_len,
        CorruptedFrameSnafu {
            segment_id,
            offset,
            reason: "truncated frame payload",
        }
    );

    let mut trailer = [0u8; (FRAME_CHECKSUM_SIZE + FRAME_LENGTH_SIZE) as usize];
    let got = read_up_to(reader, &mut trailer)?;
    ensure!(
        got == trailer.len(),
        CorruptedFrameSnafu {
            segment_id,
            offset,
            reason: "truncated frame trailer",
        }
    );

    let stored_checksum = u32::from_le_bytes([trailer[0], trailer[1], trailer[2], trailer[3]]);
    let footer = u32::from_le_bytes([trailer[4], trailer[5], trailer[6], trailer[7]]);
    ensure!(
        footer == length,
        CorruptedFrameSnafu {
            segment_id,
            offset,
            reason: format!("footer length {footer} does not match header length {length}"),
        }
    );
    ensure!(
        checksum.verify(length, &payload, stored_checksum),
        CorruptedFrameSnafu {
            segment_id,
            offset,
            reason: "checksum mismatch",
        }
    );

    Ok(Some(Bytes::from(payload)))
}

/// Like `read_exact`, but reports how many bytes were available instead of
/// failing at end of stream.
fn read_up_to<R: Read>(reader: &mut R, buf: &mut [u8]) -> io::Result<usize> {
    let mut filled = 0;
    while filled < buf.len() {
        match reader.read(&mut buf[filled..]) {
            Ok(0) => break,
            Ok(n) => filled += n,
            Err(e) if e.kind() == io::ErrorKind::Interrupted => {}
            Err(e) => return Err(e),
        }
    }
    Ok(filled)
}

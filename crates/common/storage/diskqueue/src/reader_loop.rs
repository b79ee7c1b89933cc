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

//! Background thread that decodes frames for consumers.
//!
//! Each request names a segment and a byte range known to hold complete
//! frames. The reader decodes them in order, tags each with the next frame
//! id and pushes it to the bounded consumer channel, so a full channel
//! naturally throttles reading. The open segment stream is kept between
//! requests while reading continues where the previous request stopped.

use std::sync::Arc;

use crossbeam::{
    channel::{Receiver, Sender},
    select,
};
use tracing::{debug, info, warn};

use crate::{
    QueueConfig, QueueError, Result,
    frame::{Frame, FrameId, frame_disk_size, read_frame},
    segment::{SegmentId, SegmentReader, segment_path},
};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) struct ReaderLoopRequest {
    pub segment_id:     SegmentId,
    pub start_offset:   u64,
    pub end_offset:     u64,
    /// Id given to the first frame read.
    pub start_frame_id: FrameId,
}

#[derive(Debug)]
pub(crate) struct ReaderLoopResponse {
    pub frame_count: u64,
    pub byte_count:  u64,
    /// Set when decoding stopped before `end_offset`.
    pub error:       Option<QueueError>,
}

/// An open segment and the logical offset its stream is positioned at.
struct OpenSegment {
    id:     SegmentId,
    offset: u64,
    reader: SegmentReader,
}

pub(crate) struct ReaderLoop {
    config:    Arc<QueueConfig>,
    requests:  Receiver<ReaderLoopRequest>,
    responses: Sender<ReaderLoopResponse>,
    output:    Sender<Frame>,
    done:      Receiver<()>,
    current:   Option<OpenSegment>,
}

impl ReaderLoop {
    pub(crate) fn new(
        config: Arc<QueueConfig>,
        requests: Receiver<ReaderLoopRequest>,
        responses: Sender<ReaderLoopResponse>,
        output: Sender<Frame>,
        done: Receiver<()>,
    ) -> Self {
        Self {
            config,
            requests,
            responses,
            output,
            done,
            current: None,
        }
    }

    /// Processes requests until the core loop drops its sender.
    pub(crate) fn run(mut self) {
        info!("Reader loop starting");
        while let Ok(request) = self.requests.recv() {
            let response = self.process_request(request);
            if self.responses.send(response).is_err() {
                break;
            }
        }
        info!("Reader loop stopped");
    }

    pub(crate) fn process_request(&mut self, request: ReaderLoopRequest) -> ReaderLoopResponse {
        let mut response = ReaderLoopResponse {
            frame_count: 0,
            byte_count:  0,
            error:       None,
        };

        if let Err(e) = self.read_range(&request, &mut response) {
            // The stream position is unknown after a failure.
            self.current = None;
            warn!(
                segment_id = request.segment_id,
                offset = request.start_offset + response.byte_count,
                error = %e,
                "Segment read failed"
            );
            response.error = Some(e);
        }

        debug!(
            segment_id = request.segment_id,
            frames = response.frame_count,
            bytes = response.byte_count,
            "Read request complete"
        );
        response
    }

    fn read_range(
        &mut self,
        request: &ReaderLoopRequest,
        response: &mut ReaderLoopResponse,
    ) -> Result<()> {
        let segment = Self::open_at(
            &mut self.current,
            &self.config,
            request.segment_id,
            request.start_offset,
        )?;

        while request.start_offset + response.byte_count < request.end_offset {
            let offset = request.start_offset + response.byte_count;
            let limit = request.end_offset - offset;
            let checksum = segment.reader.checksum_type();
            let Some(payload) =
                read_frame(&mut segment.reader, checksum, request.segment_id, offset, limit)?
            else {
                return crate::error::CorruptedFrameSnafu {
                    segment_id: request.segment_id,
                    offset,
                    reason: format!("segment ends before offset {}", request.end_offset),
                }
                .fail();
            };

            let bytes_on_disk = frame_disk_size(payload.len());
            segment.offset += bytes_on_disk;
            let frame = Frame {
                id: request.start_frame_id + response.frame_count,
                segment_id: request.segment_id,
                first_in_segment: offset == 0,
                serialized: payload,
                bytes_on_disk,
            };

            // A consumer that stopped reading must not keep the reader from
            // shutting down.
            select! {
                send(self.output, frame) -> res => {
                    if res.is_err() {
                        return crate::error::QueueClosedSnafu.fail();
                    }
                }
                recv(self.done) -> _ => return crate::error::QueueClosedSnafu.fail(),
            }

            response.frame_count += 1;
            response.byte_count += bytes_on_disk;
        }
        Ok(())
    }

    /// Returns the segment stream positioned at `offset`, reusing the open
    /// one when it is already there.
    fn open_at<'a>(
        current: &'a mut Option<OpenSegment>,
        config: &QueueConfig,
        segment_id: SegmentId,
        offset: u64,
    ) -> Result<&'a mut OpenSegment> {
        let reusable = current
            .as_ref()
            .is_some_and(|open| open.id == segment_id && open.offset == offset);
        if !reusable {
            let path = segment_path(&config.path, segment_id);
            let reader =
                SegmentReader::open(&path, segment_id, config.encryption_key.as_ref(), offset)?;
            debug!(segment_id, offset, "Segment opened for reading");
            *current = Some(OpenSegment {
                id: segment_id,
                offset,
                reader,
            });
        }
        current.as_mut().ok_or_else(|| QueueError::Internal {
            message: "reader segment missing after open".to_string(),
        })
    }
}

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

//! Background thread that appends frames to segment files.
//!
//! ## Architecture
//!
//! ```text
//! ┌──────────────┐   WriterLoopRequest    ┌──────────────┐   frames    ┌──────────────┐
//! │  Core loop   │ ─────────────────────► │ Writer loop  │ ──────────► │ <id>.seg     │
//! │              │ ◄───────────────────── │ (bg thread)  │             │              │
//! └──────────────┘   WriterLoopResponse   └──────────────┘             └──────────────┘
//! ```
//!
//! The core loop hands over batches of frames already assigned to segments,
//! at most one batch at a time. The writer keeps the newest segment open,
//! closes it when a frame for the next segment shows up, and reports how many
//! bytes landed in each segment it touched.
//!
//! Disk errors are retried with exponential backoff until they succeed or the
//! queue starts closing.

use std::{fmt::Display, sync::Arc, time::Duration};

use backon::{BlockingRetryable, ExponentialBuilder};
use crossbeam::channel::{Receiver, Sender, TryRecvError};
use tracing::{debug, error, info, warn};

use crate::{
    QueueConfig,
    frame::{WriteFrame, encode_frame},
    segment::{SegmentId, SegmentWriter},
};

/// A frame together with the segment the core loop assigned it to.
#[derive(Debug, Clone)]
pub(crate) struct SegmentedFrame {
    pub frame:      WriteFrame,
    pub segment_id: SegmentId,
}

#[derive(Debug, Default)]
pub(crate) struct WriterLoopRequest {
    pub frames: Vec<SegmentedFrame>,
}

/// Outcome of a request for one segment.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) struct SegmentWriteSummary {
    pub segment_id:    SegmentId,
    /// Logical bytes of the frames written to the segment.
    pub bytes_written: u64,
    /// The writer moved past this segment and will never write to it again.
    pub closed:        bool,
}

#[derive(Debug, Default)]
pub(crate) struct WriterLoopResponse {
    pub segments: Vec<SegmentWriteSummary>,
}

impl WriterLoopResponse {
    fn summary(&mut self, segment_id: SegmentId) -> &mut SegmentWriteSummary {
        let index = match self.segments.iter().position(|s| s.segment_id == segment_id) {
            Some(index) => index,
            None => {
                self.segments.push(SegmentWriteSummary {
                    segment_id,
                    bytes_written: 0,
                    closed: false,
                });
                self.segments.len() - 1
            }
        };
        &mut self.segments[index]
    }
}

/// Retries an operation with exponential backoff until the queue closes.
pub(crate) struct RetryPolicy {
    min_delay: Duration,
    max_delay: Duration,
    done:      Receiver<()>,
}

impl RetryPolicy {
    pub(crate) fn new(config: &QueueConfig, done: Receiver<()>) -> Self {
        Self {
            min_delay: config.retry_interval,
            max_delay: config.max_retry_interval,
            done,
        }
    }

    fn closing(done: &Receiver<()>) -> bool {
        matches!(done.try_recv(), Err(TryRecvError::Disconnected))
    }

    pub(crate) fn run<T, E: Display>(
        &self,
        operation: &str,
        op: impl FnMut() -> Result<T, E>,
    ) -> Result<T, E> {
        let backoff = ExponentialBuilder::default()
            .with_min_delay(self.min_delay)
            .with_max_delay(self.max_delay)
            .without_max_times();
        let sleeper = self.done.clone();
        let closing = self.done.clone();

        op.retry(backoff)
            // Wakes early once the done channel disconnects.
            .sleep(move |delay| {
                let _ = sleeper.recv_timeout(delay);
            })
            .when(move |_| !Self::closing(&closing))
            .notify(|err, delay| {
                warn!(error = %err, retry_in = ?delay, operation, "Segment operation failed, retrying");
            })
            .call()
    }
}

pub(crate) struct WriterLoop {
    config:    Arc<QueueConfig>,
    requests:  Receiver<WriterLoopRequest>,
    responses: Sender<WriterLoopResponse>,
    retry:     RetryPolicy,
    /// The open segment; frames are only ever appended to this one.
    current:   Option<SegmentWriter>,
    /// Reused encoding buffer.
    buf:       Vec<u8>,
}

impl WriterLoop {
    pub(crate) fn new(
        config: Arc<QueueConfig>,
        requests: Receiver<WriterLoopRequest>,
        responses: Sender<WriterLoopResponse>,
        done: Receiver<()>,
    ) -> Self {
        let retry = RetryPolicy::new(&config, done);
        Self {
            config,
            requests,
            responses,
            retry,
            current: None,
            buf: Vec::new(),
        }
    }

    /// Processes requests until the core loop drops its sender.
    pub(crate) fn run(mut self) {
        info!("Writer loop starting");

        while let Ok(request) = self.requests.recv() {
            let response = self.process_request(request);
            if self.responses.send(response).is_err() {
                break;
            }
        }

        if let Some(mut segment) = self.current.take() {
            let id = segment.id();
            if let Err(e) = self
                .retry
                .run("finish", || segment.finish(self.config.flush_mode))
            {
                error!(segment_id = id, error = %e, "Failed to finish segment on shutdown");
            }
        }

        info!("Writer loop stopped");
    }

    pub(crate) fn process_request(&mut self, request: WriterLoopRequest) -> WriterLoopResponse {
        let mut response = WriterLoopResponse::default();
        let frame_count = request.frames.len();

        for SegmentedFrame { frame, segment_id } in request.frames {
            if self.current.as_ref().map(SegmentWriter::id) != Some(segment_id) {
                self.close_current(&mut response);
                self.open_segment(segment_id);
                response.summary(segment_id);
            }

            if self.write_frame(&frame, segment_id) {
                response.summary(segment_id).bytes_written += frame.size_on_disk();
            }
        }

        if let Some(segment) = self.current.as_mut() {
            let id = segment.id();
            let mode = self.config.flush_mode;
            if let Err(e) = self.retry.run("sync", || segment.sync(mode)) {
                error!(segment_id = id, error = %e, "Giving up on segment sync");
            }
        }

        debug!(frames = frame_count, segments = response.segments.len(), "Write batch complete");
        response
    }

    fn close_current(&mut self, response: &mut WriterLoopResponse) {
        let Some(mut segment) = self.current.take() else {
            return;
        };
        let id = segment.id();
        let mode = self.config.flush_mode;
        if let Err(e) = self.retry.run("close", || segment.finish(mode)) {
            error!(segment_id = id, error = %e, "Giving up on closing segment");
        }
        response.summary(id).closed = true;
        debug!(segment_id = id, path = ?segment.path(), "Segment closed");
    }

    fn open_segment(&mut self, segment_id: SegmentId) {
        let config = &self.config;
        match self
            .retry
            .run("create", || SegmentWriter::create(&config.path, segment_id, config))
        {
            Ok(segment) => {
                debug!(segment_id, path = ?segment.path(), "Segment opened");
                self.current = Some(segment);
            }
            Err(e) => {
                error!(segment_id, error = %e, "Giving up on creating segment");
            }
        }
    }

    /// Returns false when the frame was abandoned.
    fn write_frame(&mut self, frame: &WriteFrame, segment_id: SegmentId) -> bool {
        let Some(segment) = self.current.as_mut() else {
            error!(segment_id, "Dropping frame for a segment that could not be opened");
            return false;
        };

        self.buf.clear();
        encode_frame(&mut self.buf, &frame.serialized, self.config.checksum_type);

        let mut written = 0;
        while written < self.buf.len() {
            let rest = &self.buf[written..];
            match self.retry.run("write", || segment.write(rest)) {
                Ok(n) => written += n,
                Err(e) => {
                    error!(
                        segment_id,
                        error = %e,
                        "Dropping frame after write failure during shutdown"
                    );
                    return false;
                }
            }
        }
        true
    }
}

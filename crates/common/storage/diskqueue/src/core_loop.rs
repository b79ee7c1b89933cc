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

//! The coordinating thread of a disk queue.
//!
//! ## Architecture
//!
//! ```text
//!  Producers ──write/cancel──►┌────────────┐──WriterLoopRequest──► Writer loop
//!                             │            │◄─────────────────────
//!  Consumers ──AckNotice─────►│ Core loop  │──ReaderLoopRequest──► Reader loop ──frames──► Consumers
//!                             │            │◄─────────────────────
//!  DiskQueue ──metrics───────►└────────────┘──DeleterLoopRequest─► Deleter loop
//! ```
//!
//! The core loop is the only owner of the segment lists, the pending frames
//! and the blocked producers. It never touches the disk itself: every disk
//! operation is handed to one of the worker loops, with at most one request
//! outstanding per worker.

use std::{
    collections::{HashSet, VecDeque},
    mem,
    sync::Arc,
    time::Instant,
};

use backon::{BackoffBuilder, ExponentialBackoff, ExponentialBuilder};
use crossbeam::{
    channel::{Receiver, Sender, after, never},
    select,
};
use serde::Serialize;
use tracing::{debug, error, info, warn};

use crate::{
    QueueConfig, Result,
    ack::AckNotice,
    deleter_loop::{DeleterLoopRequest, DeleterLoopResponse},
    error::{FrameTooLargeSnafu, ProducerCancelledSnafu, QueueClosedSnafu, QueueFullSnafu},
    frame::{FrameId, WriteFrame},
    reader_loop::{ReaderLoopRequest, ReaderLoopResponse},
    segment::{QueueSegment, SegmentId, Segments},
    writer_loop::{SegmentedFrame, WriterLoopRequest, WriterLoopResponse},
};

/// A frame a producer wants admitted.
pub(crate) struct ProducerWriteRequest {
    pub producer_id:  u64,
    pub frame:        WriteFrame,
    /// Wait for capacity instead of failing with `QueueFull`.
    pub should_block: bool,
    pub response:     Sender<Result<()>>,
}

pub(crate) struct ProducerCancelRequest {
    pub producer_id: u64,
    /// Receives the number of blocked requests that were dropped.
    pub response:    Sender<usize>,
}

pub(crate) struct MetricsRequest {
    pub response: Sender<QueueMetrics>,
}

/// Point-in-time view of the queue's occupancy.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct QueueMetrics {
    /// Configured buffer cap, `None` when unbounded.
    pub byte_limit:             Option<u64>,
    /// Bytes counted against the cap: segments plus frames not yet written.
    pub occupied_bytes:         u64,
    pub pending_frames:         usize,
    pub in_flight_frames:       usize,
    pub blocked_producers:      usize,
    pub writing_segments:       usize,
    pub reading_segments:       usize,
    pub acking_segments:        usize,
    pub acked_segments:         usize,
    /// Oldest segment holding frames that are not yet acknowledged.
    pub oldest_unacked_segment: Option<SegmentId>,
}

/// Channel ends owned by the core loop.
pub(crate) struct CoreEndpoints {
    pub write_requests:    Receiver<ProducerWriteRequest>,
    pub cancel_requests:   Receiver<ProducerCancelRequest>,
    pub metrics_requests:  Receiver<MetricsRequest>,
    pub ack_notices:       Receiver<AckNotice>,
    pub writer_requests:   Sender<WriterLoopRequest>,
    pub writer_responses:  Receiver<WriterLoopResponse>,
    pub reader_requests:   Sender<ReaderLoopRequest>,
    pub reader_responses:  Receiver<ReaderLoopResponse>,
    pub deleter_requests:  Sender<DeleterLoopRequest>,
    pub deleter_responses: Receiver<DeleterLoopResponse>,
    pub done:              Receiver<()>,
}

enum CoreEvent {
    Write(ProducerWriteRequest),
    Cancel(ProducerCancelRequest),
    Metrics(MetricsRequest),
    Ack(AckNotice),
    Written(WriterLoopResponse),
    Read(ReaderLoopResponse),
    Deleted(DeleterLoopResponse),
    RetryDelete,
    Disconnected(Source),
}

#[derive(Debug, Clone, Copy)]
enum Source {
    Producers,
    Cancels,
    Metrics,
    Acks,
    Writer,
    Reader,
    Deleter,
}

pub(crate) struct CoreLoop {
    config:            Arc<QueueConfig>,
    segments:          Segments,
    /// Admitted frames not yet handed to the writer.
    pending_frames:    Vec<SegmentedFrame>,
    pending_bytes:     u64,
    /// Frames of the outstanding writer request.
    in_flight_frames:  usize,
    in_flight_bytes:   u64,
    blocked_producers: VecDeque<ProducerWriteRequest>,
    closed_producers:  HashSet<u64>,
    writing:           bool,
    /// Segment targeted by the outstanding reader request.
    reading:           Option<SegmentId>,
    deleting:          bool,
    /// Fires once failed deletions are due for another attempt.
    delete_retry:      Receiver<Instant>,
    /// Delays between deletion attempts, reset after a clean response.
    delete_backoff:    Option<ExponentialBackoff>,
    /// Every frame id below this one is acknowledged.
    acked_up_to:       FrameId,
    /// Highest segment the acknowledgment cursor has left.
    max_completed:     Option<SegmentId>,

    write_requests:    Receiver<ProducerWriteRequest>,
    cancel_requests:   Receiver<ProducerCancelRequest>,
    metrics_requests:  Receiver<MetricsRequest>,
    ack_notices:       Receiver<AckNotice>,
    writer_requests:   Option<Sender<WriterLoopRequest>>,
    writer_responses:  Receiver<WriterLoopResponse>,
    reader_requests:   Option<Sender<ReaderLoopRequest>>,
    reader_responses:  Receiver<ReaderLoopResponse>,
    deleter_requests:  Option<Sender<DeleterLoopRequest>>,
    deleter_responses: Receiver<DeleterLoopResponse>,
    done:              Receiver<()>,
}

impl CoreLoop {
    pub(crate) fn new(config: Arc<QueueConfig>, segments: Segments, endpoints: CoreEndpoints) -> Self {
        Self {
            config,
            segments,
            pending_frames: Vec::new(),
            pending_bytes: 0,
            in_flight_frames: 0,
            in_flight_bytes: 0,
            blocked_producers: VecDeque::new(),
            closed_producers: HashSet::new(),
            writing: false,
            reading: None,
            deleting: false,
            delete_retry: never(),
            delete_backoff: None,
            acked_up_to: 0,
            max_completed: None,
            write_requests: endpoints.write_requests,
            cancel_requests: endpoints.cancel_requests,
            metrics_requests: endpoints.metrics_requests,
            ack_notices: endpoints.ack_notices,
            writer_requests: Some(endpoints.writer_requests),
            writer_responses: endpoints.writer_responses,
            reader_requests: Some(endpoints.reader_requests),
            reader_responses: endpoints.reader_responses,
            deleter_requests: Some(endpoints.deleter_requests),
            deleter_responses: endpoints.deleter_responses,
            done: endpoints.done,
        }
    }

    /// Runs until the done channel disconnects, then shuts the workers down.
    pub(crate) fn run(mut self) {
        info!(
            segments = self.segments.segment_count(),
            "Core loop starting"
        );

        // Recovered segments can be read and deleted right away.
        self.maybe_read_pending();
        self.maybe_delete_acked();

        loop {
            let event = select! {
                recv(self.write_requests) -> msg => msg.map_or(CoreEvent::Disconnected(Source::Producers), CoreEvent::Write),
                recv(self.cancel_requests) -> msg => msg.map_or(CoreEvent::Disconnected(Source::Cancels), CoreEvent::Cancel),
                recv(self.metrics_requests) -> msg => msg.map_or(CoreEvent::Disconnected(Source::Metrics), CoreEvent::Metrics),
                recv(self.ack_notices) -> msg => msg.map_or(CoreEvent::Disconnected(Source::Acks), CoreEvent::Ack),
                recv(self.writer_responses) -> msg => msg.map_or(CoreEvent::Disconnected(Source::Writer), CoreEvent::Written),
                recv(self.reader_responses) -> msg => msg.map_or(CoreEvent::Disconnected(Source::Reader), CoreEvent::Read),
                recv(self.deleter_responses) -> msg => msg.map_or(CoreEvent::Disconnected(Source::Deleter), CoreEvent::Deleted),
                recv(self.delete_retry) -> _ => CoreEvent::RetryDelete,
                recv(self.done) -> _ => break,
            };
            self.handle_event(event);
        }

        self.shutdown();
    }

    fn handle_event(&mut self, event: CoreEvent) {
        match event {
            CoreEvent::Write(request) => self.handle_producer_write_request(request),
            CoreEvent::Cancel(request) => self.handle_producer_cancel_request(request),
            CoreEvent::Metrics(request) => {
                let _ = request.response.send(self.metrics());
            }
            CoreEvent::Ack(notice) => self.handle_ack_notice(notice),
            CoreEvent::Written(response) => self.handle_writer_loop_response(response),
            CoreEvent::Read(response) => self.handle_reader_loop_response(response),
            CoreEvent::Deleted(response) => self.handle_deleter_loop_response(response),
            CoreEvent::RetryDelete => self.retry_failed_deletions(),
            CoreEvent::Disconnected(source) => self.handle_disconnect(source),
        }
    }

    /// Stops selecting on a channel whose senders are all gone.
    fn handle_disconnect(&mut self, source: Source) {
        match source {
            Source::Producers => self.write_requests = never(),
            Source::Cancels => self.cancel_requests = never(),
            Source::Metrics => self.metrics_requests = never(),
            Source::Acks => self.ack_notices = never(),
            Source::Writer => {
                error!("Writer loop exited unexpectedly");
                self.writer_responses = never();
                self.writer_requests = None;
                self.writing = false;
            }
            Source::Reader => {
                error!("Reader loop exited unexpectedly");
                self.reader_responses = never();
                self.reader_requests = None;
                self.reading = None;
            }
            Source::Deleter => {
                error!("Deleter loop exited unexpectedly");
                self.deleter_responses = never();
                self.deleter_requests = None;
                self.deleting = false;
            }
        }
        debug!(?source, "Channel disconnected");
    }

    pub(crate) fn handle_producer_write_request(&mut self, request: ProducerWriteRequest) {
        if self.closed_producers.contains(&request.producer_id) {
            let _ = request.response.send(
                ProducerCancelledSnafu {
                    producer_id: request.producer_id,
                }
                .fail(),
            );
            return;
        }

        let size = request.frame.size_on_disk();
        let max = self.config.max_segment_size;
        if size > max {
            warn!(
                producer_id = request.producer_id,
                size, max, "Rejecting frame larger than the maximum segment size"
            );
            let _ = request.response.send(FrameTooLargeSnafu { size, max }.fail());
            return;
        }

        // Producers are admitted in order, so nobody jumps the blocked queue.
        if self.blocked_producers.is_empty() && self.can_accept_frame_of_size(size) {
            self.enqueue_write_frame(request.frame);
            let _ = request.response.send(Ok(()));
            self.maybe_write_pending();
        } else if request.should_block {
            debug!(producer_id = request.producer_id, size, "Producer blocked");
            self.blocked_producers.push_back(request);
        } else {
            let _ = request.response.send(QueueFullSnafu.fail());
        }
    }

    /// Whether a frame of `size` bytes fits in the write-ahead window and
    /// under the buffer cap.
    pub(crate) fn can_accept_frame_of_size(&self, size: u64) -> bool {
        if self.pending_frames.len() + self.in_flight_frames >= self.config.write_ahead_limit {
            return false;
        }
        let Some(limit) = self.config.byte_limit() else {
            return true;
        };
        self.occupied_bytes() + size <= limit
    }

    fn occupied_bytes(&self) -> u64 {
        self.pending_bytes + self.in_flight_bytes + self.segments.size_on_disk()
    }

    /// Assigns the frame to a segment and appends it to the pending list.
    fn enqueue_write_frame(&mut self, frame: WriteFrame) {
        let size = frame.size_on_disk();
        let segments = &mut self.segments;
        let needs_new_segment = segments.writing.is_empty()
            || segments.writing_segment_size + size > self.config.max_segment_size;
        if needs_new_segment {
            let id = segments.next_id;
            segments.next_id += 1;
            segments.writing.push_back(QueueSegment::new(id));
            segments.writing_segment_size = 0;
            debug!(segment_id = id, "Starting new segment");
        }

        let Some(segment) = segments.writing.back() else {
            return;
        };
        let segment_id = segment.id;
        segments.writing_segment_size += size;
        self.pending_frames.push(SegmentedFrame { frame, segment_id });
        self.pending_bytes += size;
    }

    pub(crate) fn maybe_write_pending(&mut self) {
        if self.writing || self.pending_frames.is_empty() {
            return;
        }
        let Some(writer) = &self.writer_requests else {
            return;
        };

        let frames = mem::take(&mut self.pending_frames);
        let count = frames.len();
        let bytes = mem::take(&mut self.pending_bytes);
        if writer.send(WriterLoopRequest { frames }).is_err() {
            error!(frames = count, "Writer loop is gone, dropping frames");
            return;
        }
        self.in_flight_frames = count;
        self.in_flight_bytes = bytes;
        self.writing = true;
    }

    /// Accounts for a finished write batch.
    fn apply_writer_loop_response(&mut self, response: WriterLoopResponse) {
        self.writing = false;
        self.in_flight_frames = 0;
        self.in_flight_bytes = 0;

        for summary in &response.segments {
            if let Some(segment) = self
                .segments
                .writing
                .iter_mut()
                .find(|s| s.id == summary.segment_id)
            {
                segment.end_offset += summary.bytes_written;
            }
        }

        for summary in response.segments.iter().filter(|s| s.closed) {
            if let Some(index) = self
                .segments
                .writing
                .iter()
                .position(|s| s.id == summary.segment_id)
                && let Some(segment) = self.segments.writing.remove(index)
            {
                debug!(segment_id = segment.id, size = segment.end_offset, "Segment ready for reading");
                self.segments.reading.push_back(segment);
            }
        }
    }

    pub(crate) fn handle_writer_loop_response(&mut self, response: WriterLoopResponse) {
        self.apply_writer_loop_response(response);
        self.maybe_read_pending();
        self.maybe_unblock_producers();
        self.maybe_write_pending();
    }

    /// Issues a read for the oldest segment with unread frames.
    pub(crate) fn maybe_read_pending(&mut self) {
        if self.reading.is_some() || self.reader_requests.is_none() {
            return;
        }

        loop {
            let (segment, closed) = match self.segments.reading.front_mut() {
                Some(segment) => (segment, true),
                None => match self.segments.writing.front_mut() {
                    Some(segment) => (segment, false),
                    None => return,
                },
            };

            let start_offset = self.segments.next_read_offset;
            if start_offset >= segment.end_offset {
                if !closed {
                    // Caught up with the writer.
                    return;
                }
                if let Some(segment) = self.segments.reading.pop_front() {
                    debug!(
                        segment_id = segment.id,
                        frames = segment.frames_read,
                        "Segment fully read"
                    );
                    self.segments.acking.push_back(segment);
                }
                self.segments.next_read_offset = 0;
                self.maybe_ack_segments();
                continue;
            }

            let start_frame_id = self.segments.next_read_frame_id;
            segment.first_frame_id.get_or_insert(start_frame_id);
            let request = ReaderLoopRequest {
                segment_id: segment.id,
                start_offset,
                end_offset: segment.end_offset,
                start_frame_id,
            };

            if let Some(reader) = &self.reader_requests
                && reader.send(request).is_ok()
            {
                self.reading = Some(request.segment_id);
            }
            return;
        }
    }

    pub(crate) fn handle_reader_loop_response(&mut self, response: ReaderLoopResponse) {
        let Some(segment_id) = self.reading.take() else {
            warn!("Unexpected reader loop response");
            return;
        };

        self.segments.next_read_offset += response.byte_count;
        self.segments.next_read_frame_id += response.frame_count;

        let segment = self
            .segments
            .reading
            .iter_mut()
            .chain(self.segments.writing.iter_mut())
            .find(|s| s.id == segment_id);
        if let Some(segment) = segment {
            segment.frames_read += response.frame_count;
            if let Some(e) = response.error {
                error!(
                    segment_id,
                    skipped_bytes = segment.end_offset.saturating_sub(self.segments.next_read_offset),
                    error = %e,
                    "Abandoning the rest of a corrupted segment"
                );
                self.segments.next_read_offset = segment.end_offset;
            }
        }

        self.maybe_read_pending();
        self.maybe_ack_segments();
    }

    pub(crate) fn handle_ack_notice(&mut self, notice: AckNotice) {
        self.acked_up_to = self.acked_up_to.max(notice.acked_up_to);
        if let Some(&highest) = notice.completed.iter().max() {
            self.max_completed = Some(self.max_completed.map_or(highest, |c| c.max(highest)));
        }
        self.maybe_ack_segments();
    }

    /// Moves fully acknowledged segments from acking to acked, oldest first.
    fn maybe_ack_segments(&mut self) {
        let mut newly_acked = 0;
        while let Some(segment) = self.segments.acking.front() {
            let frames_acked = segment
                .first_frame_id
                .is_none_or(|first| first + segment.frames_read <= self.acked_up_to);
            let cursor_moved_past = self.max_completed.is_some_and(|c| segment.id <= c);
            if !(frames_acked || cursor_moved_past) {
                break;
            }
            if let Some(segment) = self.segments.acking.pop_front() {
                debug!(segment_id = segment.id, "Segment acknowledged");
                self.segments.acked.push_back(segment);
                newly_acked += 1;
            }
        }
        if newly_acked > 0 {
            self.maybe_delete_acked();
        }
    }

    pub(crate) fn maybe_delete_acked(&mut self) {
        if self.deleting || self.segments.acked.is_empty() {
            return;
        }
        let Some(deleter) = &self.deleter_requests else {
            return;
        };
        let segments = self.segments.acked.iter().map(|s| s.id).collect();
        if deleter.send(DeleterLoopRequest { segments }).is_ok() {
            self.deleting = true;
        }
    }

    pub(crate) fn handle_deleter_loop_response(&mut self, response: DeleterLoopResponse) {
        self.deleting = false;
        let deleted: HashSet<_> = response.deleted.iter().copied().collect();
        self.segments.acked.retain(|s| !deleted.contains(&s.id));
        if !deleted.is_empty() {
            debug!(count = deleted.len(), "Segments deleted");
        }

        if response.errors.is_empty() {
            self.delete_backoff = None;
            self.maybe_delete_acked();
        } else {
            for e in &response.errors {
                warn!(error = %e, "Failed to delete segment");
            }
            self.schedule_delete_retry();
        }

        self.maybe_unblock_producers();
    }

    /// Arms the retry timer with the next backoff delay.
    fn schedule_delete_retry(&mut self) {
        let config = &self.config;
        let backoff = self.delete_backoff.get_or_insert_with(|| {
            ExponentialBuilder::default()
                .with_min_delay(config.retry_interval)
                .with_max_delay(config.max_retry_interval)
                .without_max_times()
                .build()
        });
        let delay = backoff.next().unwrap_or(config.max_retry_interval);
        debug!(retry_in = ?delay, "Segment deletion retry scheduled");
        self.delete_retry = after(delay);
    }

    pub(crate) fn retry_failed_deletions(&mut self) {
        self.delete_retry = never();
        self.maybe_delete_acked();
    }

    /// Admits blocked producers in arrival order while capacity allows.
    pub(crate) fn maybe_unblock_producers(&mut self) {
        let mut unblocked = 0;
        while let Some(request) = self.blocked_producers.front() {
            if !self.can_accept_frame_of_size(request.frame.size_on_disk()) {
                break;
            }
            let Some(request) = self.blocked_producers.pop_front() else {
                break;
            };
            self.enqueue_write_frame(request.frame);
            let _ = request.response.send(Ok(()));
            unblocked += 1;
        }
        if unblocked > 0 {
            debug!(unblocked, "Producers unblocked");
            self.maybe_write_pending();
        }
    }

    pub(crate) fn handle_producer_cancel_request(&mut self, request: ProducerCancelRequest) {
        let producer_id = request.producer_id;
        self.closed_producers.insert(producer_id);

        let mut removed = 0;
        for blocked in mem::take(&mut self.blocked_producers) {
            if blocked.producer_id == producer_id {
                let _ = blocked
                    .response
                    .send(ProducerCancelledSnafu { producer_id }.fail());
                removed += 1;
            } else {
                self.blocked_producers.push_back(blocked);
            }
        }
        debug!(producer_id, removed, "Producer cancelled");
        let _ = request.response.send(removed);

        self.maybe_unblock_producers();
    }

    pub(crate) fn metrics(&self) -> QueueMetrics {
        let segments = &self.segments;
        QueueMetrics {
            byte_limit:             self.config.byte_limit(),
            occupied_bytes:         self.occupied_bytes(),
            pending_frames:         self.pending_frames.len(),
            in_flight_frames:       self.in_flight_frames,
            blocked_producers:      self.blocked_producers.len(),
            writing_segments:       segments.writing.len(),
            reading_segments:       segments.reading.len(),
            acking_segments:        segments.acking.len(),
            acked_segments:         segments.acked.len(),
            oldest_unacked_segment: segments
                .acking
                .front()
                .or_else(|| segments.reading.front())
                .or_else(|| segments.writing.front())
                .map(|s| s.id),
        }
    }

    /// Settles every worker: reader first, since read completions can
    /// schedule deletions, then the writer with a final flush of pending
    /// frames, then the deleter.
    fn shutdown(&mut self) {
        info!(
            pending = self.pending_frames.len(),
            blocked = self.blocked_producers.len(),
            "Core loop shutting down"
        );

        for request in self.blocked_producers.drain(..) {
            let _ = request.response.send(QueueClosedSnafu.fail());
        }

        self.reader_requests = None;
        if self.reading.take().is_some() {
            let _ = self.reader_responses.recv();
        }

        if self.writing {
            match self.writer_responses.recv() {
                Ok(response) => self.apply_writer_loop_response(response),
                Err(_) => self.writing = false,
            }
        }
        self.maybe_write_pending();
        if self.writing {
            match self.writer_responses.recv() {
                Ok(response) => self.apply_writer_loop_response(response),
                Err(_) => self.writing = false,
            }
        }
        self.writer_requests = None;

        if self.deleting {
            let _ = self.deleter_responses.recv();
            self.deleting = false;
        }
        self.deleter_requests = None;

        info!(
            segments = self.segments.segment_count(),
            bytes = self.segments.size_on_disk(),
            "Core loop stopped"
        );
    }
}

#[cfg(test)]
mod tests {
    use std::{io, path::PathBuf, time::Duration};

    use bytes::Bytes;
    use crossbeam::channel::{bounded, unbounded};

    use super::*;
    use crate::{
        QueueError,
        frame::FRAME_METADATA_SIZE,
        writer_loop::SegmentWriteSummary,
    };

    /// The far ends of the core loop's channels.
    struct Harness {
        core:             CoreLoop,
        writer_requests:  Receiver<WriterLoopRequest>,
        reader_requests:  Receiver<ReaderLoopRequest>,
        deleter_requests: Receiver<DeleterLoopRequest>,
        _done:            Sender<()>,
    }

    impl Harness {
        fn new(config: QueueConfig, segments: Segments) -> Self {
            let (_write_tx, write_requests) = unbounded();
            let (_cancel_tx, cancel_requests) = unbounded();
            let (_metrics_tx, metrics_requests) = unbounded();
            let (_ack_tx, ack_notices) = unbounded();
            let (writer_tx, writer_rx) = unbounded();
            let (_writer_resp_tx, writer_responses) = unbounded();
            let (reader_tx, reader_rx) = unbounded();
            let (_reader_resp_tx, reader_responses) = unbounded();
            let (deleter_tx, deleter_rx) = unbounded();
            let (_deleter_resp_tx, deleter_responses) = unbounded();
            let (done_tx, done) = bounded(0);

            let core = CoreLoop::new(
                Arc::new(config),
                segments,
                CoreEndpoints {
                    write_requests,
                    cancel_requests,
                    metrics_requests,
                    ack_notices,
                    writer_requests: writer_tx,
                    writer_responses,
                    reader_requests: reader_tx,
                    reader_responses,
                    deleter_requests: deleter_tx,
                    deleter_responses,
                    done,
                },
            );
            Self {
                core,
                writer_requests: writer_rx,
                reader_requests: reader_rx,
                deleter_requests: deleter_rx,
                _done: done_tx,
            }
        }

        fn write(
            &mut self,
            producer_id: u64,
            frame_size: u64,
            should_block: bool,
        ) -> Receiver<Result<()>> {
            let (tx, rx) = bounded(1);
            let payload = vec![b'x'; usize::try_from(frame_size - FRAME_METADATA_SIZE).unwrap()];
            self.core.handle_producer_write_request(ProducerWriteRequest {
                producer_id,
                frame: WriteFrame::new(Bytes::from(payload)),
                should_block,
                response: tx,
            });
            rx
        }
    }

    fn segment(id: SegmentId, end_offset: u64) -> QueueSegment {
        QueueSegment::with_end_offset(id, end_offset)
    }

    /// 100 bytes in each of the four lists.
    fn occupied_segments() -> Segments {
        let mut segments = Segments::default();
        segments.acked.push_back(segment(0, 100));
        segments.acking.push_back(segment(1, 100));
        segments.reading.push_back(segment(2, 100));
        segments.writing.push_back(segment(3, 100));
        segments.next_id = 4;
        segments
    }

    fn capped_config() -> QueueConfig {
        QueueConfig {
            max_buffer_size: 1000,
            max_segment_size: 1000,
            ..Default::default()
        }
    }

    #[test]
    fn test_frame_at_max_segment_size_is_accepted() {
        let mut harness = Harness::new(capped_config(), Segments::default());

        let accepted = harness.write(1, 1000, false);
        assert!(matches!(accepted.try_recv(), Ok(Ok(()))));

        let rejected = harness.write(1, 1001, true);
        assert!(matches!(
            rejected.try_recv(),
            Ok(Err(QueueError::FrameTooLarge {
                size: 1001,
                max:  1000,
            }))
        ));
        assert!(harness.core.blocked_producers.is_empty());
    }

    #[test]
    fn test_capacity_boundary_accepts_exact_fit() {
        let mut harness = Harness::new(capped_config(), occupied_segments());
        let response = harness.write(1, 600, false);
        assert!(matches!(response.try_recv(), Ok(Ok(()))));

        let request = harness.writer_requests.try_recv().unwrap();
        assert_eq!(request.frames.len(), 1);
        assert_eq!(harness.core.in_flight_bytes, 600);
        assert_eq!(harness.core.metrics().occupied_bytes, 1000);
    }

    #[test]
    fn test_capacity_boundary_rejects_one_byte_over() {
        let mut harness = Harness::new(capped_config(), occupied_segments());
        let response = harness.write(1, 601, false);
        assert!(matches!(response.try_recv(), Ok(Err(QueueError::QueueFull))));
        assert!(harness.writer_requests.try_recv().is_err());
    }

    #[test]
    fn test_blocking_producer_waits_then_is_admitted_after_deletion() {
        let mut harness = Harness::new(capped_config(), occupied_segments());
        let response = harness.write(1, 601, true);
        assert!(response.try_recv().is_err());
        assert_eq!(harness.core.metrics().blocked_producers, 1);

        // Later producers queue behind the blocked one even if they fit.
        let small = harness.write(2, 20, false);
        assert!(matches!(small.try_recv(), Ok(Err(QueueError::QueueFull))));

        harness.core.handle_deleter_loop_response(DeleterLoopResponse {
            deleted: vec![0],
            errors:  vec![],
        });
        assert!(matches!(response.try_recv(), Ok(Ok(()))));
        assert_eq!(harness.core.metrics().blocked_producers, 0);
        assert_eq!(harness.writer_requests.try_recv().unwrap().frames.len(), 1);
    }

    #[test]
    fn test_failed_deletion_is_retried_and_unblocks_producer() {
        let config = QueueConfig {
            retry_interval: Duration::from_millis(5),
            max_retry_interval: Duration::from_millis(50),
            ..capped_config()
        };
        let mut segments = Segments::default();
        segments.acked.push_back(segment(0, 400));
        segments.acked.push_back(segment(1, 400));
        let mut harness = Harness::new(config, segments);

        harness.core.maybe_delete_acked();
        assert_eq!(harness.deleter_requests.try_recv().unwrap().segments, vec![0, 1]);
        let blocked = harness.write(1, 300, true);
        assert!(blocked.try_recv().is_err());

        // Acknowledged while the failing request is outstanding.
        let mut acking = segment(2, 0);
        acking.first_frame_id = Some(0);
        harness.core.segments.acking.push_back(acking);
        harness.core.handle_ack_notice(AckNotice {
            acked_up_to: 0,
            completed:   vec![2],
        });
        assert!(harness.deleter_requests.try_recv().is_err());

        harness.core.handle_deleter_loop_response(DeleterLoopResponse {
            deleted: vec![],
            errors:  vec![QueueError::FileIo {
                path:   PathBuf::from("0.seg"),
                source: io::Error::other("device busy"),
            }],
        });
        assert!(harness.deleter_requests.try_recv().is_err());
        assert!(blocked.try_recv().is_err());

        harness
            .core
            .delete_retry
            .recv_timeout(Duration::from_secs(5))
            .unwrap();
        harness.core.retry_failed_deletions();
        assert_eq!(
            harness.deleter_requests.try_recv().unwrap().segments,
            vec![0, 1, 2]
        );

        harness.core.handle_deleter_loop_response(DeleterLoopResponse {
            deleted: vec![0, 1, 2],
            errors:  vec![],
        });
        assert!(matches!(blocked.try_recv(), Ok(Ok(()))));
        assert!(harness.core.delete_backoff.is_none());
    }

    #[test]
    fn test_write_ahead_limit_applies_backpressure() {
        let config = QueueConfig {
            write_ahead_limit: 2,
            ..Default::default()
        };
        let mut harness = Harness::new(config, Segments::default());
        assert!(matches!(harness.write(1, 50, false).try_recv(), Ok(Ok(()))));
        assert!(matches!(harness.write(1, 50, false).try_recv(), Ok(Ok(()))));
        assert!(matches!(
            harness.write(1, 50, false).try_recv(),
            Ok(Err(QueueError::QueueFull))
        ));
    }

    #[test]
    fn test_frames_roll_into_new_segment() {
        let config = QueueConfig {
            max_segment_size: 100,
            max_buffer_size: 0,
            ..Default::default()
        };
        let mut harness = Harness::new(config, Segments::default());
        for _ in 0..3 {
            harness.write(1, 40, false);
        }

        let frames = harness.writer_requests.try_recv().unwrap().frames;
        assert_eq!(frames.len(), 1);
        assert_eq!(frames[0].segment_id, 0);
        // The remaining frames wait for the outstanding write.
        let pending: Vec<_> = harness
            .core
            .pending_frames
            .iter()
            .map(|f| f.segment_id)
            .collect();
        assert_eq!(pending, vec![0, 1]);
        assert_eq!(harness.core.segments.writing.len(), 2);
    }

    #[test]
    fn test_closed_segment_moves_to_reading_and_is_read() {
        let mut segments = Segments::default();
        segments.writing.push_back(segment(0, 0));
        segments.writing.push_back(segment(1, 0));
        segments.next_id = 2;
        let mut harness = Harness::new(QueueConfig::default(), segments);
        harness.core.writing = true;

        harness.core.handle_writer_loop_response(WriterLoopResponse {
            segments: vec![
                SegmentWriteSummary {
                    segment_id:    0,
                    bytes_written: 50,
                    closed:        true,
                },
                SegmentWriteSummary {
                    segment_id:    1,
                    bytes_written: 20,
                    closed:        false,
                },
            ],
        });

        assert_eq!(harness.core.segments.reading.front().map(|s| s.id), Some(0));
        assert_eq!(harness.core.segments.writing.front().map(|s| s.id), Some(1));
        let read = harness.reader_requests.try_recv().unwrap();
        assert_eq!(
            read,
            ReaderLoopRequest {
                segment_id:     0,
                start_offset:   0,
                end_offset:     50,
                start_frame_id: 0,
            }
        );
    }

    #[test]
    fn test_read_completion_moves_segment_to_acking_then_acked() {
        let mut segments = Segments::default();
        segments.reading.push_back(segment(0, 60));
        segments.writing.push_back(segment(1, 0));
        segments.next_id = 2;
        let mut harness = Harness::new(QueueConfig::default(), segments);

        harness.core.maybe_read_pending();
        assert_eq!(harness.reader_requests.try_recv().unwrap().segment_id, 0);

        harness.core.handle_reader_loop_response(ReaderLoopResponse {
            frame_count: 3,
            byte_count:  60,
            error:       None,
        });
        assert_eq!(harness.core.segments.acking.front().map(|s| s.id), Some(0));
        assert_eq!(harness.core.segments.next_read_offset, 0);
        assert_eq!(harness.core.segments.next_read_frame_id, 3);

        harness.core.handle_ack_notice(AckNotice {
            acked_up_to: 2,
            completed:   vec![],
        });
        assert_eq!(harness.core.segments.acking.len(), 1);

        harness.core.handle_ack_notice(AckNotice {
            acked_up_to: 3,
            completed:   vec![],
        });
        assert!(harness.core.segments.acking.is_empty());
        assert_eq!(
            harness.deleter_requests.try_recv().unwrap().segments,
            vec![0]
        );
    }

    #[test]
    fn test_read_error_abandons_rest_of_segment() {
        let mut segments = Segments::default();
        segments.reading.push_back(segment(0, 100));
        let mut harness = Harness::new(QueueConfig::default(), segments);

        harness.core.maybe_read_pending();
        harness.reader_requests.try_recv().unwrap();
        harness.core.handle_reader_loop_response(ReaderLoopResponse {
            frame_count: 1,
            byte_count:  20,
            error:       Some(QueueError::CorruptedFrame {
                segment_id: 0,
                offset:     20,
                reason:     "checksum mismatch".to_string(),
            }),
        });

        let acking = harness.core.segments.acking.front().unwrap();
        assert_eq!(acking.id, 0);
        assert_eq!(acking.frames_read, 1);
        assert!(harness.core.segments.reading.is_empty());
    }

    #[test]
    fn test_completed_segment_notice_acks_segment() {
        let mut segments = Segments::default();
        let mut acking = segment(4, 100);
        acking.first_frame_id = Some(10);
        acking.frames_read = 5;
        segments.acking.push_back(acking);
        let mut harness = Harness::new(QueueConfig::default(), segments);

        harness.core.handle_ack_notice(AckNotice {
            acked_up_to: 0,
            completed:   vec![4],
        });
        assert_eq!(harness.core.segments.acked.front().map(|s| s.id), Some(4));
    }

    #[test]
    fn test_cancel_drops_blocked_requests() {
        let mut harness = Harness::new(capped_config(), occupied_segments());
        let blocked = harness.write(7, 700, true);
        let other = harness.write(8, 700, true);

        let (tx, rx) = bounded(1);
        harness
            .core
            .handle_producer_cancel_request(ProducerCancelRequest {
                producer_id: 7,
                response:    tx,
            });
        assert_eq!(rx.try_recv().unwrap(), 1);
        assert!(matches!(
            blocked.try_recv(),
            Ok(Err(QueueError::ProducerCancelled { producer_id: 7 }))
        ));
        assert!(other.try_recv().is_err());

        let later = harness.write(7, 20, false);
        assert!(matches!(
            later.try_recv(),
            Ok(Err(QueueError::ProducerCancelled { producer_id: 7 }))
        ));
    }

    #[test]
    fn test_metrics_snapshot() {
        let harness = Harness::new(capped_config(), occupied_segments());
        let metrics = harness.core.metrics();
        assert_eq!(metrics.byte_limit, Some(1000));
        assert_eq!(metrics.occupied_bytes, 400);
        assert_eq!(metrics.writing_segments, 1);
        assert_eq!(metrics.reading_segments, 1);
        assert_eq!(metrics.acking_segments, 1);
        assert_eq!(metrics.acked_segments, 1);
        assert_eq!(metrics.oldest_unacked_segment, Some(1));
    }
}

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

//! Event publisher for the queue.
//!
//! A [`Producer`] encodes events on the calling thread and hands them to the
//! core loop, then waits for the core loop's verdict. A successful publish
//! means the event is admitted: it counts against the buffer and will reach
//! disk, but may not be durable yet.

use std::marker::PhantomData;

use crossbeam::{
    channel::{Receiver, Sender, bounded},
    select,
};
use serde::Serialize;
use tracing::trace;

use crate::{
    Result,
    core_loop::{ProducerCancelRequest, ProducerWriteRequest},
    error::QueueClosedSnafu,
    frame::WriteFrame,
    serialize::encode_event,
};

/// A handle for publishing events of type `E`.
///
/// Each producer has its own identity; cancelling one does not affect the
/// others. Producers can be moved to other threads.
pub struct Producer<E> {
    id:              u64,
    write_requests:  Sender<ProducerWriteRequest>,
    cancel_requests: Sender<ProducerCancelRequest>,
    done:            Receiver<()>,
    _event:          PhantomData<fn(&E)>,
}

impl<E: Serialize> Producer<E> {
    pub(crate) const fn new(
        id: u64,
        write_requests: Sender<ProducerWriteRequest>,
        cancel_requests: Sender<ProducerCancelRequest>,
        done: Receiver<()>,
    ) -> Self {
        Self {
            id,
            write_requests,
            cancel_requests,
            done,
            _event: PhantomData,
        }
    }

    #[must_use]
    pub const fn id(&self) -> u64 { self.id }

    /// Publishes an event, waiting for capacity if the queue is full.
    ///
    /// # Errors
    ///
    /// `FrameTooLarge` if the event can never fit in a segment,
    /// `ProducerCancelled` after [`cancel`](Self::cancel), and `QueueClosed`
    /// once the queue shuts down, including while waiting for capacity.
    pub fn publish(&self, event: &E) -> Result<()> { self.send(event, true) }

    /// Publishes an event, failing with `QueueFull` instead of waiting.
    ///
    /// # Errors
    ///
    /// The same as [`publish`](Self::publish), plus `QueueFull`.
    pub fn try_publish(&self, event: &E) -> Result<()> { self.send(event, false) }

    fn send(&self, event: &E, should_block: bool) -> Result<()> {
        let frame = WriteFrame::new(encode_event(event)?);
        let size = frame.size_on_disk();
        let (response, verdict) = bounded(1);
        let request = ProducerWriteRequest {
            producer_id: self.id,
            frame,
            should_block,
            response,
        };

        select! {
            send(self.write_requests, request) -> res => {
                if res.is_err() {
                    return QueueClosedSnafu.fail();
                }
            }
            recv(self.done) -> _ => return QueueClosedSnafu.fail(),
        }

        trace!(producer_id = self.id, size, should_block, "Publish request sent");
        // The core loop drops the response sender if it stops before replying.
        verdict.recv().unwrap_or_else(|_| QueueClosedSnafu.fail())
    }

    /// Stops this producer. Requests still waiting for capacity are dropped
    /// and fail with `ProducerCancelled`; events already admitted are kept.
    /// Returns how many waiting requests were dropped.
    ///
    /// # Errors
    ///
    /// `QueueClosed` if the queue has shut down.
    pub fn cancel(&self) -> Result<usize> {
        let (response, removed) = bounded(1);
        let request = ProducerCancelRequest {
            producer_id: self.id,
            response,
        };
        select! {
            send(self.cancel_requests, request) -> res => {
                if res.is_err() {
                    return QueueClosedSnafu.fail();
                }
            }
            recv(self.done) -> _ => return QueueClosedSnafu.fail(),
        }
        removed.recv().or_else(|_| QueueClosedSnafu.fail())
    }
}

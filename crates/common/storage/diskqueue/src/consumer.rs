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

//! Event consumer for the queue.
//!
//! Consumers pull frames the reader loop has already decoded from disk and
//! hand them out in batches. Nothing is removed from disk until a batch is
//! acknowledged with [`Batch::done`] and every earlier frame has been
//! acknowledged too.

use std::{marker::PhantomData, sync::Arc};

use crossbeam::{
    channel::{Receiver, TryRecvError},
    select,
};
use serde::de::DeserializeOwned;
use tracing::{trace, warn};

use crate::{
    Result,
    ack::AckTracker,
    error::QueueClosedSnafu,
    frame::{Frame, FrameAck},
    serialize::decode_event,
};

/// A handle for reading events of type `E`.
///
/// Consumers can be cloned; clones share the same stream, so every frame is
/// handed to exactly one of them.
pub struct Consumer<E> {
    frames: Receiver<Frame>,
    done:   Receiver<()>,
    acks:   Arc<AckTracker>,
    _event: PhantomData<fn() -> E>,
}

impl<E> Clone for Consumer<E> {
    fn clone(&self) -> Self {
        Self {
            frames: self.frames.clone(),
            done:   self.done.clone(),
            acks:   Arc::clone(&self.acks),
            _event: PhantomData,
        }
    }
}

impl<E: DeserializeOwned> Consumer<E> {
    pub(crate) const fn new(frames: Receiver<Frame>, done: Receiver<()>, acks: Arc<AckTracker>) -> Self {
        Self {
            frames,
            done,
            acks,
            _event: PhantomData,
        }
    }

    /// Waits for at least one event and returns up to `max` of them, or
    /// everything already buffered when `max` is 0.
    ///
    /// # Errors
    ///
    /// `QueueClosed` once the queue shuts down.
    pub fn get(&self, max: usize) -> Result<Batch<E>> {
        // Frames still buffered after close are not handed out.
        if matches!(self.done.try_recv(), Err(TryRecvError::Disconnected)) {
            return QueueClosedSnafu.fail();
        }
        let first = select! {
            recv(self.frames) -> frame => match frame {
                Ok(frame) => frame,
                Err(_) => return QueueClosedSnafu.fail(),
            },
            recv(self.done) -> _ => return QueueClosedSnafu.fail(),
        };

        let mut batch = Batch::new(Arc::clone(&self.acks));
        batch.push(first);
        while max == 0 || batch.frames.len() < max {
            match self.frames.try_recv() {
                Ok(frame) => batch.push(frame),
                Err(TryRecvError::Empty | TryRecvError::Disconnected) => break,
            }
        }

        trace!(frames = batch.frames.len(), events = batch.events.len(), "Batch ready");
        Ok(batch)
    }
}

/// Events handed out by one [`Consumer::get`] call.
///
/// Dropping a batch without calling [`done`](Self::done) leaves its frames
/// unacknowledged, which holds back deletion of their segments.
pub struct Batch<E> {
    events: Vec<E>,
    frames: Vec<FrameAck>,
    acks:   Arc<AckTracker>,
}

impl<E: DeserializeOwned> Batch<E> {
    const fn new(acks: Arc<AckTracker>) -> Self {
        Self {
            events: Vec::new(),
            frames: Vec::new(),
            acks,
        }
    }

    fn push(&mut self, frame: Frame) {
        match decode_event(frame.id, &frame.serialized) {
            Ok(event) => self.events.push(event),
            // Still acknowledged with the batch so the cursor can move on.
            Err(e) => warn!(
                frame_id = frame.id,
                segment_id = frame.segment_id,
                error = %e,
                "Skipping undecodable event"
            ),
        }
        self.frames.push(frame.ack());
    }
}

impl<E> Batch<E> {
    /// Number of decoded events.
    #[must_use]
    pub fn len(&self) -> usize { self.events.len() }

    #[must_use]
    pub fn is_empty(&self) -> bool { self.events.is_empty() }

    #[must_use]
    pub fn events(&self) -> &[E] { &self.events }

    /// Moves the events out, keeping the batch for acknowledgment.
    pub fn take_events(&mut self) -> Vec<E> { std::mem::take(&mut self.events) }

    /// Acknowledges every frame in the batch.
    pub fn done(self) { self.acks.add_frames(&self.frames); }
}

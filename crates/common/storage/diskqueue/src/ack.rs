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

//! Tracks consumer acknowledgments and advances the durable read position.
//!
//! Batches may be acknowledged in any order. The tracker records the size of
//! every acknowledged frame and only moves its cursor across a contiguous run
//! of frame ids, persisting the new position to `state.dat` and telling the
//! core loop which segments the cursor has left behind.

use std::{collections::HashMap, sync::Arc};

use crossbeam::channel::Sender;
use parking_lot::Mutex;
use tracing::{debug, error, trace};

use crate::{
    frame::{FrameAck, FrameId},
    segment::SegmentId,
    state_file::{QueuePosition, StateFile},
};

/// Called with the number of frames whose acknowledgment just became durable.
pub type AckCallback = Arc<dyn Fn(usize) + Send + Sync>;

/// Progress report sent to the core loop whenever the cursor advances.
#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) struct AckNotice {
    /// Every frame id below this one is acknowledged.
    pub acked_up_to: FrameId,
    /// Segments the cursor moved out of, each reported once.
    pub completed:   Vec<SegmentId>,
}

struct AckState {
    next_frame_id:      FrameId,
    next_position:      QueuePosition,
    /// Sizes of acknowledged frames at or above `next_frame_id`.
    frame_size:         HashMap<FrameId, u64>,
    /// Frames that are the first of their segment, keyed to that segment.
    segment_boundaries: HashMap<FrameId, SegmentId>,
    state_file:         StateFile,
}

pub(crate) struct AckTracker {
    state:   Mutex<AckState>,
    notices: Sender<AckNotice>,
    on_ack:  Option<AckCallback>,
}

impl AckTracker {
    /// Starts tracking at `position`, with frame ids counted from 0.
    pub(crate) fn new(
        state_file: StateFile,
        position: QueuePosition,
        notices: Sender<AckNotice>,
        on_ack: Option<AckCallback>,
    ) -> Self {
        Self {
            state: Mutex::new(AckState {
                next_frame_id: 0,
                next_position: position,
                frame_size: HashMap::new(),
                segment_boundaries: HashMap::new(),
                state_file,
            }),
            notices,
            on_ack,
        }
    }

    /// Records acknowledged frames and advances the cursor as far as the
    /// contiguous run of acknowledged ids allows.
    pub(crate) fn add_frames(&self, frames: &[FrameAck]) {
        if frames.is_empty() {
            return;
        }

        let (advanced, notice) = {
            let mut guard = self.state.lock();
            let state = &mut *guard;
            for frame in frames {
                if frame.id < state.next_frame_id {
                    debug!(frame_id = frame.id, "Ignoring duplicate acknowledgment");
                    continue;
                }
                state.frame_size.insert(frame.id, frame.bytes_on_disk);
                if frame.first_in_segment {
                    state.segment_boundaries.insert(frame.id, frame.segment_id);
                }
            }

            let mut advanced = 0usize;
            let mut completed = Vec::new();
            while let Some(size) = state.frame_size.remove(&state.next_frame_id) {
                let id = state.next_frame_id;
                if let Some(segment_id) = state.segment_boundaries.remove(&id) {
                    if segment_id != state.next_position.segment_id {
                        completed.push(state.next_position.segment_id);
                        state.next_position = QueuePosition::new(segment_id, 0, 0);
                    }
                }
                state.next_position.byte_index += size;
                state.next_position.frame_index += 1;
                state.next_frame_id += 1;
                advanced += 1;
            }

            if advanced == 0 {
                return;
            }

            let position = state.next_position;
            if let Err(e) = state.state_file.write(&position) {
                error!(error = %e, ?position, "Failed to persist queue position");
            }
            trace!(?position, advanced, "Acknowledged position advanced");

            let notice = AckNotice {
                acked_up_to: state.next_frame_id,
                completed,
            };
            (advanced, notice)
        };

        // A closed core loop no longer needs notices.
        let _ = self.notices.send(notice);
        if let Some(callback) = &self.on_ack {
            callback(advanced);
        }
    }

    #[cfg(test)]
    fn next_frame_id(&self) -> FrameId { self.state.lock().next_frame_id }

    #[cfg(test)]
    fn position(&self) -> QueuePosition { self.state.lock().next_position }
}

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

//! Durable, disk-backed queue that buffers events between pipeline inputs
//! and outputs.
//!
//! Events are appended to numbered segment files, handed to consumers in
//! order, and deleted once every frame of a segment is acknowledged. The
//! acknowledged position is persisted so a restart resumes at the oldest
//! unacknowledged event.

mod ack;
pub mod builder;
mod checksum;
mod compression;
pub mod config;
mod consumer;
mod core_loop;
mod deleter_loop;
mod encryption;
pub mod error;
mod frame;
mod producer;
mod queue;
mod reader_loop;
mod recovery;
mod segment;
mod serialize;
mod state_file;
mod writer_loop;

pub use ack::AckCallback;
pub use builder::QueueBuilder;
pub use config::{ChecksumType, EncryptionKey, FlushMode, QueueConfig};
pub use consumer::{Batch, Consumer};
pub use core_loop::QueueMetrics;
pub use error::{QueueError, Result};
pub use frame::FRAME_METADATA_SIZE;
pub use producer::Producer;
pub use queue::DiskQueue;
pub use segment::SegmentId;

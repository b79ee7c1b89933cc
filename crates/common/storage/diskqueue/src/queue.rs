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

//! Queue handle and thread lifecycle.
//!
//! [`DiskQueue`] is the entry point of the crate. Opening a queue:
//! - Recovers segments and the acknowledged position from disk
//! - Spawns the core, writer, reader and deleter threads
//! - Hands out [`Producer`]s and [`Consumer`]s bound to those threads
//!
//! ## Usage
//!
//! ```ignore
//! let queue = QueueBuilder::new("/var/lib/logship/queue").build::<LogEvent>()?;
//!
//! let producer = queue.producer();
//! producer.publish(&event)?;
//!
//! let consumer = queue.consumer();
//! let batch = consumer.get(100)?;
//! for event in batch.events() {
//!     ship(event);
//! }
//! batch.done();
//!
//! queue.close()?;
//! ```

use std::{
    marker::PhantomData,
    sync::{
        Arc,
        atomic::{AtomicU64, Ordering},
    },
    thread::{self, JoinHandle},
};

use crossbeam::{
    channel::{Receiver, Sender, bounded, unbounded},
    select,
};
use serde::{Serialize, de::DeserializeOwned};
use tracing::{error, info};

use crate::{
    QueueConfig, Result,
    ack::{AckCallback, AckTracker},
    consumer::Consumer,
    core_loop::{
        CoreEndpoints, CoreLoop, MetricsRequest, ProducerCancelRequest, ProducerWriteRequest,
        QueueMetrics,
    },
    deleter_loop::DeleterLoop,
    error::{QueueClosedSnafu, ThreadPanicSnafu},
    frame::Frame,
    producer::Producer,
    reader_loop::ReaderLoop,
    recovery::{RecoveryResult, recover},
    writer_loop::WriterLoop,
};

/// A durable, disk-backed queue of events of type `E`.
pub struct DiskQueue<E> {
    config:           Arc<QueueConfig>,
    next_producer_id: AtomicU64,
    write_requests:   Sender<ProducerWriteRequest>,
    cancel_requests:  Sender<ProducerCancelRequest>,
    metrics_requests: Sender<MetricsRequest>,
    frames:           Receiver<Frame>,
    acks:             Arc<AckTracker>,
    /// Every thread selects on this; dropping the sender starts shutdown.
    done:             Receiver<()>,
    done_tx:          Option<Sender<()>>,
    /// Joined in order: the core loop first, since it drains the workers.
    threads:          Vec<(&'static str, JoinHandle<()>)>,
    _event:           PhantomData<fn(E) -> E>,
}

impl<E: Serialize + DeserializeOwned> DiskQueue<E> {
    /// Opens the queue at `config.path`, creating it if needed.
    ///
    /// # Errors
    ///
    /// Returns an error if the settings are invalid, recovery fails (for
    /// example an encrypted segment without a configured key), or a thread
    /// cannot be spawned.
    pub fn open(config: QueueConfig, on_ack: Option<AckCallback>) -> Result<Self> {
        config.validate()?;
        let config = Arc::new(config);

        let RecoveryResult {
            segments,
            state_file,
            position,
        } = recover(&config)?;
        let segment_count = segments.segment_count();

        let (done_tx, done) = bounded::<()>(0);
        let (write_tx, write_rx) = bounded(0);
        let (cancel_tx, cancel_rx) = bounded(0);
        let (metrics_tx, metrics_rx) = bounded(0);
        let (ack_tx, ack_rx) = unbounded();
        let (writer_tx, writer_rx) = bounded(1);
        let (writer_resp_tx, writer_resp_rx) = bounded(1);
        let (reader_tx, reader_rx) = bounded(1);
        let (reader_resp_tx, reader_resp_rx) = bounded(1);
        let (deleter_tx, deleter_rx) = bounded(1);
        let (deleter_resp_tx, deleter_resp_rx) = bounded(1);
        let (frame_tx, frames) = bounded(config.read_ahead_limit);

        let acks = Arc::new(AckTracker::new(state_file, position, ack_tx, on_ack));

        let core = CoreLoop::new(
            Arc::clone(&config),
            segments,
            CoreEndpoints {
                write_requests:    write_rx,
                cancel_requests:   cancel_rx,
                metrics_requests:  metrics_rx,
                ack_notices:       ack_rx,
                writer_requests:   writer_tx,
                writer_responses:  writer_resp_rx,
                reader_requests:   reader_tx,
                reader_responses:  reader_resp_rx,
                deleter_requests:  deleter_tx,
                deleter_responses: deleter_resp_rx,
                done:              done.clone(),
            },
        );
        let writer = WriterLoop::new(Arc::clone(&config), writer_rx, writer_resp_tx, done.clone());
        let reader = ReaderLoop::new(
            Arc::clone(&config),
            reader_rx,
            reader_resp_tx,
            frame_tx,
            done.clone(),
        );
        let deleter = DeleterLoop::new(config.path.clone(), deleter_rx, deleter_resp_tx);

        // If a spawn fails, dropping `done_tx` on return stops the threads
        // that did start.
        let threads = vec![
            spawn("diskqueue-core", move || core.run())?,
            spawn("diskqueue-writer", move || writer.run())?,
            spawn("diskqueue-reader", move || reader.run())?,
            spawn("diskqueue-deleter", move || deleter.run())?,
        ];

        info!(
            path = ?config.path,
            segments = segment_count,
            segment_id = position.segment_id,
            byte_index = position.byte_index,
            "Disk queue opened"
        );

        Ok(Self {
            config,
            next_producer_id: AtomicU64::new(0),
            write_requests: write_tx,
            cancel_requests: cancel_tx,
            metrics_requests: metrics_tx,
            frames,
            acks,
            done,
            done_tx: Some(done_tx),
            threads,
            _event: PhantomData,
        })
    }

    /// Creates a producer with a fresh identity.
    #[must_use]
    pub fn producer(&self) -> Producer<E> {
        Producer::new(
            self.next_producer_id.fetch_add(1, Ordering::Relaxed),
            self.write_requests.clone(),
            self.cancel_requests.clone(),
            self.done.clone(),
        )
    }

    /// Creates a consumer. All consumers share one stream of events.
    #[must_use]
    pub fn consumer(&self) -> Consumer<E> {
        Consumer::new(self.frames.clone(), self.done.clone(), Arc::clone(&self.acks))
    }
}

impl<E> DiskQueue<E> {
    /// Takes a snapshot of the queue's occupancy from the core loop.
    ///
    /// # Errors
    ///
    /// `QueueClosed` if the queue has shut down.
    pub fn metrics(&self) -> Result<QueueMetrics> {
        let (response, snapshot) = bounded(1);
        select! {
            send(self.metrics_requests, MetricsRequest { response }) -> res => {
                if res.is_err() {
                    return QueueClosedSnafu.fail();
                }
            }
            recv(self.done) -> _ => return QueueClosedSnafu.fail(),
        }
        snapshot.recv().or_else(|_| QueueClosedSnafu.fail())
    }

    #[must_use]
    pub fn config(&self) -> &QueueConfig { &self.config }

    /// Shuts the queue down, flushing admitted events to disk.
    ///
    /// Blocked publishers and waiting consumers are released with
    /// `QueueClosed`. Consumes `self` to prevent further use.
    ///
    /// # Errors
    ///
    /// Returns an error if one of the queue's threads panicked.
    pub fn close(mut self) -> Result<()> { self.shutdown() }

    fn shutdown(&mut self) -> Result<()> {
        if self.done_tx.take().is_none() {
            return Ok(());
        }
        info!(path = ?self.config.path, "Closing disk queue");

        let mut result = Ok(());
        for (name, handle) in self.threads.drain(..) {
            if handle.join().is_err() {
                error!(thread = name, "Queue thread panicked");
                if result.is_ok() {
                    result = ThreadPanicSnafu { name }.fail();
                }
            }
        }

        info!("Disk queue closed");
        result
    }
}

impl<E> Drop for DiskQueue<E> {
    fn drop(&mut self) {
        if let Err(e) = self.shutdown() {
            error!(error = %e, "Disk queue shutdown failed");
        }
    }
}

fn spawn(
    name: &'static str,
    f: impl FnOnce() + Send + 'static,
) -> Result<(&'static str, JoinHandle<()>)> {
    let handle = thread::Builder::new().name(name.to_string()).spawn(f)?;
    Ok((name, handle))
}

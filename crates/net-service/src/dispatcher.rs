// Copyright (C) 2026-present The rcaflow Authors.
//
// Licensed under the Apache License, Version 2.0 (the "License");
// you may not use this file except in compliance with the License.
// You may obtain a copy of the License at
//
//    http://www.apache.org/licenses/LICENSE-2.0
//
// Unless required by applicable law or agreed to in writing, software
// distributed under the License is distributed on an "AS IS" BASIS,
// WITHOUT WARRANTIES OR CONDITIONS OF ANY KIND, either express or
// implied.
// See the License for the specific language governing permissions and
// limitations under the License.

//! Admission control between the network I/O tasks and the ingestion
//! workers.
//!
//! The [IngestionDispatcher] never blocks the caller: a flow unit is either
//! queued on the currently installed [WorkerPool] or dropped. The pool can be
//! replaced at any time, a replaced pool stops taking new tasks but its
//! workers finish everything that was already queued.

use crate::{
    stats,
    task::{IngestionTask, TaskContext},
    FlowUnit, PeerId,
};
use arc_swap::ArcSwapOption;
use async_channel::TrySendError;
use parking_lot::Mutex;
use std::{
    panic::AssertUnwindSafe,
    sync::{
        atomic::{AtomicU64, Ordering},
        Arc,
    },
    thread::JoinHandle,
};
use tracing::{debug, error, info, trace, warn};

/// Log every n-th admission rejection at warn level, the rest at trace
const REJECTION_LOG_INTERVAL: u64 = 1000;

#[derive(Debug, strum_macros::Display)]
pub enum WorkerPoolError {
    #[strum(to_string = "worker pool needs at least one worker")]
    NoWorkers,
    #[strum(to_string = "worker pool queue capacity must be at least one")]
    NoQueueCapacity,
    #[strum(to_string = "unable to spawn worker thread: {0}")]
    SpawnError(std::io::Error),
}

impl std::error::Error for WorkerPoolError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            Self::SpawnError(err) => Some(err),
            _ => None,
        }
    }
}

/// Fixed set of worker threads consuming a bounded queue of
/// [IngestionTask]s.
///
/// Workers are OS threads, store writes block on the segment lock and must
/// not stall the async runtime.
#[derive(Debug)]
pub struct WorkerPool {
    id: u64,
    size: usize,
    capacity: usize,
    tx: async_channel::Sender<IngestionTask>,
    workers: Mutex<Vec<JoinHandle<()>>>,
}

impl WorkerPool {
    pub fn new(id: u64, size: usize, capacity: usize) -> Result<Self, WorkerPoolError> {
        if size == 0 {
            return Err(WorkerPoolError::NoWorkers);
        }
        if capacity == 0 {
            return Err(WorkerPoolError::NoQueueCapacity);
        }
        let (tx, rx) = async_channel::bounded::<IngestionTask>(capacity);
        let mut workers = Vec::with_capacity(size);
        for worker in 0..size {
            let rx = rx.clone();
            let handle = std::thread::Builder::new()
                .name(format!("rcaflow-ingest-{id}-{worker}"))
                .spawn(move || Self::work(id, worker, rx));
            match handle {
                Ok(handle) => workers.push(handle),
                Err(err) => {
                    // Let the workers spawned so far exit
                    tx.close();
                    return Err(WorkerPoolError::SpawnError(err));
                }
            }
        }
        info!("[Pool {id}] started {size} workers with a queue of {capacity} tasks");
        Ok(Self {
            id,
            size,
            capacity,
            tx,
            workers: Mutex::new(workers),
        })
    }

    fn work(id: u64, worker: usize, rx: async_channel::Receiver<IngestionTask>) {
        trace!("[Pool {id}] worker {worker} started");
        while let Ok(task) = rx.recv_blocking() {
            let peer = task.peer();
            if std::panic::catch_unwind(AssertUnwindSafe(|| task.run())).is_err() {
                error!("[Pool {id}] worker {worker} recovered from a panic processing a flow unit from {peer}");
            }
        }
        trace!("[Pool {id}] worker {worker} exiting, queue is closed and drained");
    }

    pub const fn id(&self) -> u64 {
        self.id
    }

    pub const fn size(&self) -> usize {
        self.size
    }

    pub const fn capacity(&self) -> usize {
        self.capacity
    }

    /// Number of tasks waiting for a worker
    pub fn queued(&self) -> usize {
        self.tx.len()
    }

    /// Queue the task without waiting for space in the queue
    pub fn try_execute(&self, task: IngestionTask) -> Result<(), TrySendError<IngestionTask>> {
        self.tx.try_send(task)
    }

    /// Stop accepting tasks. Workers keep running until the queue is drained.
    pub fn close(&self) -> bool {
        let closed = self.tx.close();
        if closed {
            debug!(
                "[Pool {}] closed with {} queued tasks",
                self.id,
                self.tx.len()
            );
        }
        closed
    }

    pub fn is_closed(&self) -> bool {
        self.tx.is_closed()
    }

    /// Close the pool and block until all workers drained the queue and
    /// exited.
    pub fn join(&self) {
        self.close();
        let workers = std::mem::take(&mut *self.workers.lock());
        for handle in workers {
            if handle.join().is_err() {
                error!("[Pool {}] worker thread terminated abnormally", self.id);
            }
        }
        debug!("[Pool {}] all workers exited", self.id);
    }
}

impl Drop for WorkerPool {
    fn drop(&mut self) {
        // Detached workers still drain the queue after the pool is gone
        self.tx.close();
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SubmitOutcome {
    /// Queued for execution
    Accepted,
    /// Dropped because the queue is full
    Rejected,
    /// Dropped because no pool is installed
    NotReady,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct DispatcherCounts {
    pub accepted: u64,
    pub rejected: u64,
    pub not_ready: u64,
}

/// Turns inbound flow units into [IngestionTask]s on the installed
/// [WorkerPool]
#[derive(Debug)]
pub struct IngestionDispatcher {
    pool: ArcSwapOption<WorkerPool>,
    context: TaskContext,
    accepted: AtomicU64,
    rejected: AtomicU64,
    not_ready: AtomicU64,
}

impl IngestionDispatcher {
    pub fn new(context: TaskContext) -> Self {
        Self {
            pool: ArcSwapOption::empty(),
            context,
            accepted: AtomicU64::new(0),
            rejected: AtomicU64::new(0),
            not_ready: AtomicU64::new(0),
        }
    }

    pub const fn context(&self) -> &TaskContext {
        &self.context
    }

    pub fn pool(&self) -> Option<Arc<WorkerPool>> {
        self.pool.load_full()
    }

    /// Install `pool` and close the previously installed one, which is
    /// returned so the caller can wait for it to drain.
    pub fn install_pool(&self, pool: Arc<WorkerPool>) -> Option<Arc<WorkerPool>> {
        let id = pool.id();
        let previous = self.pool.swap(Some(pool));
        if let Some(previous) = &previous {
            info!(
                "[Pool {id}] replacing pool {}, {} queued tasks will be drained",
                previous.id(),
                previous.queued()
            );
            previous.close();
        } else {
            info!("[Pool {id}] installed");
        }
        previous
    }

    /// Remove the installed pool. Subsequent submissions are dropped as not
    /// ready.
    pub fn uninstall_pool(&self) -> Option<Arc<WorkerPool>> {
        let previous = self.pool.swap(None);
        if let Some(previous) = &previous {
            previous.close();
        }
        previous
    }

    /// Uninstall the pool and block until its queued tasks are executed
    pub fn shutdown(&self) {
        if let Some(pool) = self.uninstall_pool() {
            info!(
                "[Pool {}] shutting down, draining {} queued tasks",
                pool.id(),
                pool.queued()
            );
            pool.join();
        }
    }

    pub fn counts(&self) -> DispatcherCounts {
        DispatcherCounts {
            accepted: self.accepted.load(Ordering::Relaxed),
            rejected: self.rejected.load(Ordering::Relaxed),
            not_ready: self.not_ready.load(Ordering::Relaxed),
        }
    }

    /// Hand over a flow unit received from `peer`. Never blocks and never
    /// retries a rejected flow unit.
    pub fn submit(&self, peer: PeerId, flow_unit: FlowUnit) -> SubmitOutcome {
        let size = flow_unit.serialized_size() as u64;
        let labels = [stats::graph_node_label(flow_unit.graph_node())];
        let mut task = IngestionTask::new(peer, flow_unit, self.context.clone());
        let mut pool = self.pool.load_full();
        loop {
            let Some(current) = pool else {
                self.not_ready.fetch_add(1, Ordering::Relaxed);
                self.context.stats().increment(stats::NOT_READY, 1, &labels);
                trace!(
                    "[{peer}] no worker pool installed, dropping flow unit of graph node {}",
                    task.flow_unit().graph_node()
                );
                return SubmitOutcome::NotReady;
            };
            match current.try_execute(task) {
                Ok(()) => {
                    self.accepted.fetch_add(1, Ordering::Relaxed);
                    self.context.stats().increment(stats::BYTES_IN, size, &labels);
                    return SubmitOutcome::Accepted;
                }
                Err(TrySendError::Full(task)) => {
                    let rejected = self.rejected.fetch_add(1, Ordering::Relaxed) + 1;
                    self.context.stats().increment(stats::QUEUE_FULL, 1, &labels);
                    if rejected == 1 || rejected % REJECTION_LOG_INTERVAL == 0 {
                        warn!(
                            "[{peer}] [Pool {}] queue is full, dropping flow unit of graph node {} ({rejected} rejected so far)",
                            current.id(),
                            task.flow_unit().graph_node()
                        );
                    } else {
                        trace!(
                            "[{peer}] [Pool {}] queue is full, dropping flow unit of graph node {}",
                            current.id(),
                            task.flow_unit().graph_node()
                        );
                    }
                    return SubmitOutcome::Rejected;
                }
                Err(TrySendError::Closed(returned)) => {
                    // The pool was replaced after it was loaded, try the new one once
                    let next = self.pool.load_full();
                    if next.as_ref().is_some_and(|next| Arc::ptr_eq(next, &current)) {
                        pool = None;
                    } else {
                        pool = next;
                    }
                    task = returned;
                }
            }
        }
    }
}

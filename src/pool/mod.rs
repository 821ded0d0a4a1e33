//! Fixed pool of isolated worker threads with zero-copy buffer transfer.
//!
//! Workers share no state with the controller; the only cross-thread
//! primitive is a message channel. Dispatching a task moves the contents of
//! its movable buffers to the worker (leaving the zero-length sentinel in the
//! controller), and the worker's reply carries them back. Because a buffer
//! has at most one live holder of its contents, a waiting task whose inputs
//! are currently moved cannot be dispatched; the stall detector turns the
//! resulting silent deadlock into a loud error.

mod worker;

use std::collections::VecDeque;
use std::sync::Arc;
use std::thread::JoinHandle;

use crossbeam_channel::{unbounded, Receiver, Sender};
use tracing::{debug, error, info};

use crate::codec::CodecRegistry;
use crate::error::PoolError;
use crate::lookup::Registry;
use crate::task::{Task, TransferDescriptor};
use crate::value::{ByteBuf, Value};

/// One-time payload sent to each worker before any task.
pub struct InitMessage {
    pub worker_index: usize,
    /// Marker field name the codec registry stamps into packed values.
    pub marker: String,
    /// The callable registry the worker resolves task methods against.
    pub registry: Arc<Registry>,
    /// Default lookup bases for tasks that carry none. `None` keeps the
    /// registry's own default.
    pub lookup: Option<Vec<String>>,
}

/// One buffer crossing the controller → worker boundary.
pub struct BufferTransfer {
    /// The controller-side handle the bytes came from.
    pub origin: ByteBuf,
    pub bytes: Vec<u8>,
    /// Moved transfers neuter the origin and come back with the reply;
    /// copied transfers leave the origin untouched.
    pub moved: bool,
}

/// A task shipped to a worker.
pub struct TaskMessage {
    pub descriptor: TransferDescriptor,
    pub transfers: Vec<BufferTransfer>,
}

pub enum ToWorker {
    Init(InitMessage),
    Task(TaskMessage),
    Terminate,
}

/// Ownership of moved input buffers returning to the controller: bytes keyed
/// by their originating handles.
pub struct Backtransfer {
    pub returns: Vec<(ByteBuf, Vec<u8>)>,
}

/// Raw reply posted by a worker thread.
pub enum WorkerReply {
    Done {
        worker: usize,
        /// Packed result; the pool unpacks it before surfacing.
        result: Value,
        backtransfer: Backtransfer,
    },
    Failed {
        worker: usize,
        task: String,
        message: String,
    },
}

/// Event surfaced by [`WorkerPool::handle_reply`].
#[derive(Debug)]
pub enum PoolEvent {
    WorkerDone {
        result: Value,
        task: Task,
        worker: usize,
    },
}

struct WorkerHandle {
    sender: Sender<ToWorker>,
    join: Option<JoinHandle<()>>,
    running: Option<Task>,
}

/// A fixed set of isolated workers with FIFO admission and a neutered-buffer
/// stall detector.
pub struct WorkerPool {
    workers: Vec<WorkerHandle>,
    queue: VecDeque<Task>,
    reply_rx: Receiver<WorkerReply>,
    codecs: Arc<CodecRegistry>,
    terminated: bool,
}

impl WorkerPool {
    /// Spawn `worker_count` workers (default: the reported hardware
    /// concurrency) and send each its init message.
    pub fn new(
        registry: Arc<Registry>,
        codecs: Arc<CodecRegistry>,
        worker_count: Option<usize>,
        lookup: Option<Vec<String>>,
    ) -> Result<Self, PoolError> {
        let count = worker_count.unwrap_or_else(Self::number_of_cpus).max(1);
        let (reply_tx, reply_rx) = unbounded();

        let mut workers = Vec::with_capacity(count);
        for index in 0..count {
            let (sender, inbox) = unbounded();
            let join = std::thread::Builder::new()
                .name(format!("karakuri-worker-{index}"))
                .spawn({
                    let replies = reply_tx.clone();
                    let codecs = codecs.clone();
                    move || worker::worker_main(index, inbox, replies, codecs)
                })?;
            sender
                .send(ToWorker::Init(InitMessage {
                    worker_index: index,
                    marker: codecs.marker().to_string(),
                    registry: registry.clone(),
                    lookup: lookup.clone(),
                }))
                .map_err(|_| PoolError::Disconnected(index))?;
            workers.push(WorkerHandle {
                sender,
                join: Some(join),
                running: None,
            });
        }

        info!(workers = count, "worker pool started");
        Ok(Self {
            workers,
            queue: VecDeque::new(),
            reply_rx,
            codecs,
            terminated: false,
        })
    }

    /// Reported hardware concurrency.
    pub fn number_of_cpus() -> usize {
        std::thread::available_parallelism()
            .map(std::num::NonZeroUsize::get)
            .unwrap_or(1)
    }

    pub fn worker_count(&self) -> usize {
        self.workers.len()
    }

    pub fn is_terminated(&self) -> bool {
        self.terminated
    }

    /// Tasks waiting for a worker or for a buffer to return.
    pub fn queued(&self) -> usize {
        self.queue.len()
    }

    pub fn busy_workers(&self) -> usize {
        self.workers.iter().filter(|w| w.running.is_some()).count()
    }

    fn idle_worker(&self) -> Option<usize> {
        self.workers.iter().position(|w| w.running.is_none())
    }

    /// The channel replies arrive on. Intended for `select` loops; feed every
    /// received reply to [`WorkerPool::handle_reply`].
    pub fn replies(&self) -> &Receiver<WorkerReply> {
        &self.reply_rx
    }

    /// FIFO admission: dispatch immediately when an idle worker exists and no
    /// input buffer of the task is currently moved, otherwise enqueue.
    pub fn run_task(&mut self, task: Task) -> Result<(), PoolError> {
        if self.terminated {
            return Err(PoolError::Terminated);
        }
        if !task.has_moved_buffer() {
            if let Some(index) = self.idle_worker() {
                return self.dispatch(index, task);
            }
        }
        debug!(task = task.label(), "task queued");
        self.queue.push_back(task);
        self.stall_check()
    }

    /// Process one worker reply on the controller thread: apply the
    /// back-transfer, free the worker, hand it the first dispatchable waiting
    /// task, and surface the completion.
    pub fn handle_reply(&mut self, reply: WorkerReply) -> Result<PoolEvent, PoolError> {
        if self.terminated {
            return Err(PoolError::Terminated);
        }
        match reply {
            WorkerReply::Failed {
                worker,
                task,
                message,
            } => {
                error!(worker, task, "worker failed");
                Err(PoolError::Worker {
                    worker,
                    task,
                    message,
                })
            }
            WorkerReply::Done {
                worker,
                result,
                backtransfer,
            } => {
                let task = self.workers[worker].running.take().ok_or_else(|| {
                    PoolError::Worker {
                        worker,
                        task: "<unknown>".to_string(),
                        message: "reply without a running task".to_string(),
                    }
                })?;

                // Input buffers return before anything can observe them.
                for (origin, bytes) in backtransfer.returns {
                    origin.restore(bytes);
                }
                let result = self.codecs.unpack(result);
                debug!(worker, task = task.label(), "worker done");

                match self.queue.iter().position(|t| !t.has_moved_buffer()) {
                    Some(pos) => {
                        let next = self.queue.remove(pos).expect("position is in range");
                        self.dispatch(worker, next)?;
                    }
                    None => self.stall_check()?,
                }

                Ok(PoolEvent::WorkerDone {
                    result,
                    task,
                    worker,
                })
            }
        }
    }

    /// Terminate every worker and join their threads. Idempotent.
    pub fn terminate(&mut self) {
        if self.terminated {
            return;
        }
        self.terminated = true;
        for worker in &self.workers {
            let _ = worker.sender.send(ToWorker::Terminate);
        }
        for worker in &mut self.workers {
            if let Some(join) = worker.join.take() {
                let _ = join.join();
            }
            worker.running = None;
        }
        self.queue.clear();
        info!("worker pool terminated");
    }

    fn dispatch(&mut self, index: usize, mut task: Task) -> Result<(), PoolError> {
        let descriptor = task.to_descriptor()?;

        // Listed movables are moved; embedded buffers masked out of the list
        // are copied so the controller copy stays usable.
        let embedded = task.embedded_movables();
        let mut transfers = Vec::with_capacity(embedded.len());
        for buf in &descriptor.movables {
            transfers.push(BufferTransfer {
                origin: buf.clone(),
                bytes: buf.take(),
                moved: true,
            });
        }
        for buf in embedded {
            if !descriptor.movables.iter().any(|m| m.ptr_eq(&buf)) {
                transfers.push(BufferTransfer {
                    origin: buf.clone(),
                    bytes: buf.snapshot(),
                    moved: false,
                });
            }
        }

        debug!(
            worker = index,
            task = task.label(),
            moved = descriptor.movables.len(),
            "task dispatched"
        );
        self.workers[index]
            .sender
            .send(ToWorker::Task(TaskMessage {
                descriptor,
                transfers,
            }))
            .map_err(|_| PoolError::Disconnected(index))?;
        self.workers[index].running = Some(task);
        Ok(())
    }

    /// Fatal when waiting tasks exist, every one of them holds a moved
    /// buffer, and no worker is busy: nothing will ever bring the contents
    /// back.
    fn stall_check(&self) -> Result<(), PoolError> {
        if !self.queue.is_empty()
            && self.busy_workers() == 0
            && self.queue.iter().all(Task::has_moved_buffer)
        {
            error!(waiting = self.queue.len(), "worker pool stalled");
            return Err(PoolError::Stall);
        }
        Ok(())
    }
}

impl Drop for WorkerPool {
    fn drop(&mut self) {
        self.terminate();
    }
}

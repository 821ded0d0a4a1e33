//! Worker-host side of the pool: one long-lived thread per worker.
//!
//! The first message must be the init payload; every following task message
//! is reconstructed into a local [`Task`], run, and answered with the packed
//! result plus the back-transfer returning ownership of moved input buffers.

use std::sync::Arc;

use crossbeam_channel::{Receiver, Sender};
use tracing::debug;

use crate::codec::CodecRegistry;
use crate::config::Arg;
use crate::task::{Task, TransferDescriptor};
use crate::value::{ArrayView, ByteBuf, Value};

use super::{Backtransfer, InitMessage, TaskMessage, ToWorker, WorkerReply};

pub(super) fn worker_main(
    index: usize,
    inbox: Receiver<ToWorker>,
    replies: Sender<WorkerReply>,
    codecs: Arc<CodecRegistry>,
) {
    let init = match inbox.recv() {
        Ok(ToWorker::Init(init)) => init,
        Ok(_) => {
            let _ = replies.send(protocol_error(index, "first message must be the init payload"));
            return;
        }
        Err(_) => return,
    };
    if init.worker_index != index || init.marker != codecs.marker() {
        let _ = replies.send(protocol_error(index, "init payload does not match this worker"));
        return;
    }
    debug!(worker = index, "worker initialised");

    while let Ok(message) = inbox.recv() {
        match message {
            ToWorker::Terminate => break,
            ToWorker::Init(_) => {
                let _ = replies.send(protocol_error(index, "duplicate init message"));
                return;
            }
            ToWorker::Task(task_message) => {
                run_one(index, task_message, &init, &replies, &codecs);
            }
        }
    }
    debug!(worker = index, "worker stopped");
}

fn protocol_error(index: usize, message: &str) -> WorkerReply {
    WorkerReply::Failed {
        worker: index,
        task: "<init>".to_string(),
        message: message.to_string(),
    }
}

fn run_one(
    index: usize,
    message: TaskMessage,
    init: &InitMessage,
    replies: &Sender<WorkerReply>,
    codecs: &Arc<CodecRegistry>,
) {
    let TaskMessage {
        descriptor,
        transfers,
    } = message;

    // Shipped bytes land in fresh local handles; the controller's handles
    // stay neutered until the back-transfer.
    let mut swaps: Vec<(ByteBuf, ByteBuf)> = Vec::with_capacity(transfers.len());
    let mut moved: Vec<(ByteBuf, ByteBuf)> = Vec::new();
    for transfer in transfers {
        let local = ByteBuf::new(transfer.bytes);
        if transfer.moved {
            moved.push((transfer.origin.clone(), local.clone()));
        }
        swaps.push((transfer.origin, local));
    }

    let descriptor = localise(descriptor, &swaps);
    let name = descriptor.callable.clone();

    let mut task = Task::from_descriptor(descriptor, codecs.clone());
    if task.lookup().is_none() {
        if let Some(lookup) = &init.lookup {
            task.set_lookup(lookup.clone());
        }
    }

    let done: Box<dyn FnOnce(Value) + Send> = {
        let replies = replies.clone();
        let codecs = codecs.clone();
        let moved = moved.clone();
        Box::new(move |value: Value| {
            let packed = codecs.pack(&value);
            // A result embedding a moved input buffer must reference the
            // controller's original handle, so the handle the dependents
            // share is the one that comes back to life.
            let reverse: Vec<(ByteBuf, ByteBuf)> = moved
                .iter()
                .map(|(origin, local)| (local.clone(), origin.clone()))
                .collect();
            let packed = swap_buffers(&packed, &reverse);
            let returns = moved
                .iter()
                .map(|(origin, local)| (origin.clone(), local.take()))
                .collect();
            let _ = replies.send(WorkerReply::Done {
                worker: index,
                result: packed,
                backtransfer: Backtransfer { returns },
            });
        })
    };

    let registry = init.registry.clone();
    let outcome = std::panic::catch_unwind(std::panic::AssertUnwindSafe(|| {
        task.run(&registry, Some(done))
    }));
    match outcome {
        Ok(Ok(_)) => {}
        Ok(Err(error)) => {
            let _ = replies.send(WorkerReply::Failed {
                worker: index,
                task: name,
                message: error.to_string(),
            });
        }
        Err(panic) => {
            let message = if let Some(s) = panic.downcast_ref::<&str>() {
                format!("task panicked: {s}")
            } else if let Some(s) = panic.downcast_ref::<String>() {
                format!("task panicked: {s}")
            } else {
                String::from("task panicked")
            };
            let _ = replies.send(WorkerReply::Failed {
                worker: index,
                task: name,
                message,
            });
        }
    }
}

/// Rewrite every buffer handle in the descriptor through the swap table.
fn localise(mut descriptor: TransferDescriptor, swaps: &[(ByteBuf, ByteBuf)]) -> TransferDescriptor {
    descriptor.args = descriptor
        .args
        .into_iter()
        .map(|arg| match arg {
            Arg::Value(value) => Arg::Value(swap_buffers(&value, swaps)),
            other => other,
        })
        .collect();
    descriptor.receiver = descriptor
        .receiver
        .map(|receiver| swap_buffers(&receiver, swaps));
    descriptor.movables = descriptor
        .movables
        .iter()
        .map(|buf| swap_one(buf, swaps))
        .collect();
    descriptor
}

fn swap_one(buf: &ByteBuf, swaps: &[(ByteBuf, ByteBuf)]) -> ByteBuf {
    swaps
        .iter()
        .find(|(from, _)| from.ptr_eq(buf))
        .map(|(_, to)| to.clone())
        .unwrap_or_else(|| buf.clone())
}

fn swap_buffers(value: &Value, swaps: &[(ByteBuf, ByteBuf)]) -> Value {
    match value {
        Value::Buffer(buf) => Value::Buffer(swap_one(buf, swaps)),
        Value::View(view) => Value::View(ArrayView::new(view.kind, swap_one(&view.buffer, swaps))),
        Value::List(items) => Value::List(items.iter().map(|v| swap_buffers(v, swaps)).collect()),
        Value::Record(map) => Value::Record(
            map.iter()
                .map(|(k, v)| (k.clone(), swap_buffers(v, swaps)))
                .collect(),
        ),
        other => other.clone(),
    }
}

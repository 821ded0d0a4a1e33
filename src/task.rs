//! A single schedulable callable invocation.
//!
//! A [`Task`] carries the callable identity (a lookup path or an inline
//! closure), the argument list, an optional receiver and lookup table, and the
//! scheduler's annotation stamp. It converts itself into a
//! [`TransferDescriptor`] for shipment to a worker and reconstructs itself on
//! the worker side.

use std::sync::Arc;

use crate::codec::{dedup_buffers, CodecRegistry};
use crate::config::Arg;
use crate::error::{LookupError, PoolError, TaskError};
use crate::lookup::{NativeFn, Registry};
use crate::value::{ByteBuf, Completion, Value};

/// The callable a task invokes.
#[derive(Clone)]
pub enum Callable {
    /// A dot-separated path resolved through the lookup bases at run time.
    Named(String),
    /// An inline closure. Runs on the controller only; it cannot be shipped
    /// to a worker.
    Inline(NativeFn),
}

impl std::fmt::Debug for Callable {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Callable::Named(path) => write!(f, "Named({path})"),
            Callable::Inline(_) => write!(f, "Inline(..)"),
        }
    }
}

impl From<&str> for Callable {
    fn from(path: &str) -> Self {
        Callable::Named(path.to_string())
    }
}

impl From<String> for Callable {
    fn from(path: String) -> Self {
        Callable::Named(path)
    }
}

/// Scheduler annotations carried by a pipeline-owned task through dispatch
/// and back.
#[derive(Clone, Debug)]
pub struct TaskMeta {
    /// Identity of the owning pipeline; completions are filtered by it.
    pub pipeline: u64,
    /// Slot index of the execution context the task belongs to.
    pub context: usize,
    /// Distinguishes the context from earlier occupants of the same slot, so
    /// a stale in-flight completion cannot be misattributed.
    pub epoch: u64,
    /// Configured task name.
    pub name: String,
}

/// Transfer-ready form of a task: packed arguments and receiver plus the
/// flattened movable list for the transport.
#[derive(Debug)]
pub struct TransferDescriptor {
    pub callable: String,
    pub args: Vec<Arg>,
    pub receiver: Option<Value>,
    pub lookup: Option<Vec<String>>,
    pub movables: Vec<ByteBuf>,
    pub meta: Option<TaskMeta>,
}

pub struct Task {
    callable: Callable,
    args: Vec<Arg>,
    receiver: Option<Value>,
    lookup: Option<Vec<String>>,
    /// Explicit movable list; when absent the set is derived from the
    /// arguments and receiver on demand.
    explicit_movables: Option<Vec<ByteBuf>>,
    /// Buffers excluded from the next transfer only.
    masked: Vec<ByteBuf>,
    meta: Option<TaskMeta>,
    codecs: Arc<CodecRegistry>,
}

impl Task {
    /// A task whose movable set is auto-detected from its arguments and
    /// receiver.
    pub fn new(callable: impl Into<Callable>, args: Vec<Arg>, codecs: Arc<CodecRegistry>) -> Self {
        Self {
            callable: callable.into(),
            args,
            receiver: None,
            lookup: None,
            explicit_movables: None,
            masked: Vec::new(),
            meta: None,
            codecs,
        }
    }

    /// A task with an explicit movable list; embedded buffers not listed are
    /// copied on transfer instead of moved.
    pub fn with_movables(
        callable: impl Into<Callable>,
        args: Vec<Arg>,
        movables: Vec<ByteBuf>,
        codecs: Arc<CodecRegistry>,
    ) -> Self {
        let mut task = Self::new(callable, args, codecs);
        task.explicit_movables = Some(movables);
        task
    }

    pub fn set_receiver(&mut self, receiver: Value) {
        self.receiver = Some(receiver);
    }

    pub fn set_lookup(&mut self, lookup: Vec<String>) {
        self.lookup = Some(lookup);
    }

    pub fn lookup(&self) -> Option<&[String]> {
        self.lookup.as_deref()
    }

    pub fn set_meta(&mut self, meta: TaskMeta) {
        self.meta = Some(meta);
    }

    pub fn meta(&self) -> Option<&TaskMeta> {
        self.meta.as_ref()
    }

    pub fn args(&self) -> &[Arg] {
        &self.args
    }

    /// Human-readable identity for logs and errors.
    pub fn label(&self) -> &str {
        match (&self.meta, &self.callable) {
            (Some(meta), _) => &meta.name,
            (None, Callable::Named(path)) => path,
            (None, Callable::Inline(_)) => "<inline>",
        }
    }

    /// Exclude the movables embedded in `value` from the next transfer; they
    /// will be copied instead of moved. The exclusion is consumed by the next
    /// [`Task::to_descriptor`] call.
    pub fn remove_movable(&mut self, value: &Value) {
        self.masked.extend(self.codecs.movables(value));
    }

    /// Every movable embedded in the arguments and receiver, regardless of
    /// masking.
    pub(crate) fn embedded_movables(&self) -> Vec<ByteBuf> {
        let mut found = Vec::new();
        for arg in &self.args {
            if let Arg::Value(value) = arg {
                found.extend(self.codecs.movables(value));
            }
        }
        if let Some(receiver) = &self.receiver {
            found.extend(self.codecs.movables(receiver));
        }
        dedup_buffers(found)
    }

    /// Whether any movable embedded in the arguments or receiver currently
    /// has zero length, i.e. its contents sit with a worker.
    pub fn has_moved_buffer(&self) -> bool {
        self.embedded_movables().iter().any(ByteBuf::is_neutered)
    }

    /// The movable set for the next transfer: explicit list or the embedded
    /// set, minus the one-shot exclusions.
    fn transfer_movables(&self) -> Vec<ByteBuf> {
        let base = match &self.explicit_movables {
            Some(explicit) => explicit.clone(),
            None => self.embedded_movables(),
        };
        let kept = base
            .into_iter()
            .filter(|buf| !self.masked.iter().any(|m| m.ptr_eq(buf)))
            .collect();
        dedup_buffers(kept)
    }

    /// Produce the transfer descriptor and consume the one-shot exclusion
    /// list. Inline callables cannot be serialised for worker shipment.
    pub fn to_descriptor(&mut self) -> Result<TransferDescriptor, PoolError> {
        let callable = match &self.callable {
            Callable::Named(path) => path.clone(),
            Callable::Inline(_) => {
                return Err(PoolError::Serialization(self.label().to_string()))
            }
        };
        let movables = self.transfer_movables();
        self.masked.clear();

        let args = self
            .args
            .iter()
            .map(|arg| match arg {
                Arg::Value(value) => Arg::Value(self.codecs.pack(value)),
                other => other.clone(),
            })
            .collect();
        let receiver = self.receiver.as_ref().map(|r| self.codecs.pack(r));

        Ok(TransferDescriptor {
            callable,
            args,
            receiver,
            lookup: self.lookup.clone(),
            movables,
            meta: self.meta.clone(),
        })
    }

    /// Reconstruct a task from a transfer descriptor, unpacking every packed
    /// argument and the receiver.
    pub fn from_descriptor(descriptor: TransferDescriptor, codecs: Arc<CodecRegistry>) -> Self {
        let args = descriptor
            .args
            .into_iter()
            .map(|arg| match arg {
                Arg::Value(value) => Arg::Value(codecs.unpack(value)),
                other => other,
            })
            .collect();
        Self {
            callable: Callable::Named(descriptor.callable),
            args,
            receiver: descriptor.receiver.map(|r| codecs.unpack(r)),
            lookup: descriptor.lookup,
            explicit_movables: Some(descriptor.movables),
            masked: Vec::new(),
            meta: descriptor.meta,
            codecs,
        }
    }

    /// Execute the task.
    ///
    /// Late bindings are resolved from the registry's variable table, the
    /// callable is found through the lookup bases when named, and an async
    /// argument slot (if present) receives a one-shot completion wired to
    /// `done`. Without an async slot, `done` is invoked exactly once with the
    /// synchronous result, which is also returned.
    pub fn run(
        &self,
        registry: &Registry,
        done: Option<Box<dyn FnOnce(Value) + Send>>,
    ) -> Result<Value, TaskError> {
        let mut resolved = Vec::with_capacity(self.args.len());
        let mut async_slot = None;

        for (index, arg) in self.args.iter().enumerate() {
            match arg {
                Arg::Value(value) => resolved.push(value.clone()),
                Arg::Late(name) => {
                    let value = registry.variable(name).ok_or_else(|| {
                        LookupError::UndefinedVariable { name: name.clone() }
                    })?;
                    resolved.push(value);
                }
                Arg::Async => {
                    async_slot = Some(index);
                    resolved.push(Value::Null);
                }
                Arg::Deferred(deferred) => {
                    return Err(TaskError::UnresolvedDeferred {
                        index,
                        dep: deferred.dep.clone(),
                    });
                }
            }
        }

        let callable: NativeFn = match &self.callable {
            Callable::Named(path) => registry.resolve(path, self.lookup.as_deref())?,
            Callable::Inline(f) => f.clone(),
        };

        match async_slot {
            Some(index) => {
                let completion = Completion::new(move |value| {
                    if let Some(done) = done {
                        done(value);
                    }
                });
                resolved[index] = Value::Callback(completion);
                let sync = callable(self.receiver.as_ref(), &resolved)?;
                Ok(sync)
            }
            None => {
                let result = callable(self.receiver.as_ref(), &resolved)?;
                if let Some(done) = done {
                    done(result.clone());
                }
                Ok(result)
            }
        }
    }
}

impl std::fmt::Debug for Task {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Task")
            .field("callable", &self.callable)
            .field("args", &self.args.len())
            .field("meta", &self.meta)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::codec::DEFAULT_MARKER;
    use crate::lookup::Namespace;

    fn fixtures() -> (Arc<CodecRegistry>, Registry) {
        let codecs = Arc::new(CodecRegistry::with_defaults(DEFAULT_MARKER));
        let mut global = Namespace::new();
        global.func("sum_bytes", |_, args| {
            let buf = args[0]
                .as_buffer()
                .ok_or_else(|| anyhow::anyhow!("expected a buffer"))?;
            Ok(Value::Int(buf.with(|b| b.iter().map(|&x| x as i64).sum())))
        });
        global.func("add", |_, args| {
            let a = args[0].as_int().unwrap_or(0);
            let b = args[1].as_int().unwrap_or(0);
            Ok(Value::Int(a + b))
        });
        global.func("deliver", |_, args| {
            let callback = args[0]
                .as_callback()
                .ok_or_else(|| anyhow::anyhow!("expected the injected callback"))?;
            callback.resolve(Value::Int(42));
            Ok(Value::Null)
        });
        (codecs, Registry::with_global(global))
    }

    #[test]
    fn run_invokes_done_once_for_sync_tasks() {
        let (codecs, registry) = fixtures();
        let task = Task::new(
            "add",
            vec![Arg::Value(Value::Int(2)), Arg::Value(Value::Int(3))],
            codecs,
        );

        let (tx, rx) = crossbeam_channel::unbounded();
        let result = task
            .run(&registry, Some(Box::new(move |v| tx.send(v).unwrap())))
            .unwrap();

        assert_eq!(result, Value::Int(5));
        assert_eq!(rx.try_recv().unwrap(), Value::Int(5));
        assert!(rx.try_recv().is_err(), "done fires exactly once");
    }

    #[test]
    fn async_slot_receives_injected_callback() {
        let (codecs, registry) = fixtures();
        let task = Task::new("deliver", vec![Arg::Async], codecs);

        let (tx, rx) = crossbeam_channel::unbounded();
        let sync = task
            .run(&registry, Some(Box::new(move |v| tx.send(v).unwrap())))
            .unwrap();

        assert_eq!(sync, Value::Null);
        assert_eq!(rx.try_recv().unwrap(), Value::Int(42));
    }

    #[test]
    fn late_binding_resolves_from_registry_variables() {
        let (codecs, registry) = fixtures();
        registry.set_variable("offset", Value::Int(40));
        let task = Task::new(
            "add",
            vec![Arg::Late("offset".to_string()), Arg::Value(Value::Int(2))],
            codecs,
        );
        assert_eq!(task.run(&registry, None).unwrap(), Value::Int(42));
    }

    #[test]
    fn undefined_variable_is_fatal() {
        let (codecs, registry) = fixtures();
        let task = Task::new("add", vec![Arg::Late("missing".to_string())], codecs);
        assert!(matches!(
            task.run(&registry, None),
            Err(TaskError::Lookup(LookupError::UndefinedVariable { .. }))
        ));
    }

    #[test]
    fn unresolvable_callable_is_fatal() {
        let (codecs, registry) = fixtures();
        let task = Task::new("nowhere.to.be.found", vec![], codecs);
        assert!(matches!(
            task.run(&registry, None),
            Err(TaskError::Lookup(LookupError::Unresolved { .. }))
        ));
    }

    #[test]
    fn descriptor_round_trip_preserves_behaviour() {
        let (codecs, registry) = fixtures();
        let buf = ByteBuf::new(vec![1, 2, 3]);
        let mut task = Task::new(
            "sum_bytes",
            vec![Arg::Value(Value::Buffer(buf.clone()))],
            codecs.clone(),
        );

        let expected = task.run(&registry, None).unwrap();

        let descriptor = task.to_descriptor().unwrap();
        assert_eq!(descriptor.callable, "sum_bytes");
        assert_eq!(descriptor.movables.len(), 1);
        assert!(descriptor.movables[0].ptr_eq(&buf));

        let rebuilt = Task::from_descriptor(descriptor, codecs);
        assert_eq!(rebuilt.run(&registry, None).unwrap(), expected);
    }

    #[test]
    fn remove_movable_masks_one_transfer_only() {
        let (codecs, _) = fixtures();
        let buf = ByteBuf::new(vec![5; 4]);
        let value = Value::Buffer(buf.clone());
        let mut task = Task::new("sum_bytes", vec![Arg::Value(value.clone())], codecs);

        task.remove_movable(&value);
        let first = task.to_descriptor().unwrap();
        assert!(first.movables.is_empty(), "masked for this transfer");

        let second = task.to_descriptor().unwrap();
        assert_eq!(second.movables.len(), 1, "mask was consumed");
        assert!(second.movables[0].ptr_eq(&buf));
    }

    #[test]
    fn moved_buffer_is_observable() {
        let (codecs, _) = fixtures();
        let buf = ByteBuf::new(vec![9]);
        let mut task = Task::new(
            "sum_bytes",
            vec![Arg::Value(Value::Buffer(buf.clone()))],
            codecs,
        );
        task.set_receiver(Value::Buffer(ByteBuf::new(vec![1])));

        assert!(!task.has_moved_buffer());
        buf.take();
        assert!(task.has_moved_buffer());
    }

    #[test]
    fn inline_callable_cannot_be_shipped() {
        let (codecs, registry) = fixtures();
        let mut task = Task::new(
            Callable::Inline(Arc::new(|_, _| Ok(Value::Int(1)))),
            vec![],
            codecs,
        );
        assert_eq!(task.run(&registry, None).unwrap(), Value::Int(1));
        assert!(matches!(
            task.to_descriptor(),
            Err(PoolError::Serialization(_))
        ));
    }
}

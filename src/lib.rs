#![forbid(unsafe_code)]

//! Task-graph processing pipeline with a multithreaded worker pool.
//!
//! `karakuri` accepts a declarative configuration of named tasks and their
//! data dependencies, builds a directed acyclic dependency graph, and
//! executes the tasks across a pool of isolated worker threads, respecting
//! both data-flow order and the single-owner semantics of movable byte
//! buffers crossing the controller/worker boundary.
//!
//! The moving parts:
//!
//! * [`PipelineConfig`]: maps task names to descriptions. Arguments may embed
//!   deferred results of other tasks ([`result_of`]), process-wide variables
//!   ([`variable`]) and the async completion slot ([`async_result`]).
//! * [`Registry`]: named roots of callables which tasks reference by
//!   dot-separated paths, shared between the controller and the workers.
//! * [`Pipeline`]: builds the dependency graph, validates it, and schedules
//!   ready tasks inline or across the [`WorkerPool`].
//! * [`ByteBuf`]: a movable buffer. Dispatching a task moves its buffers'
//!   contents to the worker; every other holder observes a zero-length
//!   sentinel until the contents return. The pool's stall detector turns
//!   deadlocks arising from this single-owner rule into loud errors.
//!
//! Quick start:
//!
//! ```
//! use std::sync::Arc;
//! use karakuri::{
//!     Namespace, Pipeline, PipelineConfig, PipelineOptions, Registry,
//!     TaskDescription, Value, result_of,
//! };
//!
//! let mut global = Namespace::new();
//! global.func("double", |_, args| Ok(Value::Int(args[0].as_int().unwrap_or(0) * 2)));
//! global.func("add", |_, args| {
//!     Ok(Value::Int(args[0].as_int().unwrap_or(0) + args[1].as_int().unwrap_or(0)))
//! });
//! let registry = Arc::new(Registry::with_global(global));
//!
//! let mut config = PipelineConfig::new();
//! config.task("seed", TaskDescription::new("double").arg(20i64));
//! config.task("answer", TaskDescription::new("add").arg(result_of("seed")).arg(2i64));
//!
//! let options = PipelineOptions { use_worker_pool: false, ..PipelineOptions::default() };
//! let mut pipeline = Pipeline::new(config, registry, options)?;
//! assert_eq!(pipeline.process("answer")?, Value::Int(42));
//! # Ok::<(), karakuri::PipelineError>(())
//! ```

mod codec;
mod config;
mod error;
mod graph;
mod lookup;
mod pipeline;
/// Worker pool internals and wire messages; most callers only need the
/// re-exported [`WorkerPool`].
pub mod pool;
mod task;
mod value;

pub use crate::codec::{Codec, CodecRegistry, DEFAULT_MARKER};
pub use crate::config::{
    async_result, reference_to_result_of, result_of, variable, wait_for, Arg, Command, Deferred,
    PipelineConfig, TaskDescription,
};
pub use crate::error::{
    ConfigError, GraphError, LookupError, PipelineError, PoolError, TaskError,
};
pub use crate::graph::{Dfs, EdgeKind, Graph, Vertex};
pub use crate::lookup::{Binding, Namespace, NativeFn, Registry, GLOBAL_ROOT};
pub use crate::pipeline::{
    CancelToken, NamePattern, Pipeline, PipelineEvent, PipelineOptions,
};
pub use crate::pool::{PoolEvent, WorkerPool};
pub use crate::task::{Callable, Task, TaskMeta, TransferDescriptor};
pub use crate::value::{ArrayView, ByteBuf, Completion, Value, ViewKind};

//! The pipeline scheduler: admission, short-term selection, dispatch and
//! result routing over the dependency graph.
//!
//! Each `process()` call owns an execution context with a private copy of the
//! dependency subgraph reachable from its target. The scheduling step admits
//! the current leaves, picks the queue head (FIFO, no priority), resolves the
//! task's receiver and deferred arguments from stored results, and dispatches
//! either inline or to the worker pool. Completions (worker replies and
//! inline/async callbacks alike) arrive on channels merged by a `select`
//! loop and re-enter the scheduling step.

use std::collections::{HashMap, HashSet, VecDeque};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;

use crossbeam_channel::{unbounded, Receiver, Select, Sender};
use tracing::{debug, info, warn};

use crate::codec::{CodecRegistry, DEFAULT_MARKER};
use crate::config::{Arg, Command, PipelineConfig};
use crate::error::{ConfigError, LookupError, PipelineError, PoolError, TaskError};
use crate::graph::Graph;
use crate::lookup::Registry;
use crate::pool::{PoolEvent, WorkerPool, WorkerReply};
use crate::task::{Task, TaskMeta};
use crate::value::Value;

static PIPELINE_IDS: AtomicU64 = AtomicU64::new(1);

/// Cooperative stop flag for one execution context. Observed at the next
/// scheduling step; in-flight tasks are not interrupted, their results are
/// discarded.
#[derive(Clone, Debug, Default)]
pub struct CancelToken(Arc<AtomicBool>);

impl CancelToken {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn cancel(&self) {
        self.0.store(true, Ordering::Relaxed);
    }

    pub fn is_cancelled(&self) -> bool {
        self.0.load(Ordering::Relaxed)
    }
}

/// Matcher for method names that must never run on the pool.
#[derive(Clone, Debug)]
pub enum NamePattern {
    Exact(String),
    Prefix(String),
    Suffix(String),
    Contains(String),
}

impl NamePattern {
    pub fn matches(&self, name: &str) -> bool {
        match self {
            NamePattern::Exact(p) => name == p,
            NamePattern::Prefix(p) => name.starts_with(p.as_str()),
            NamePattern::Suffix(p) => name.ends_with(p.as_str()),
            NamePattern::Contains(p) => name.contains(p.as_str()),
        }
    }
}

/// GPU methods drive their own device queue and UI methods must stay on the
/// controller thread.
fn default_no_multithread() -> Vec<NamePattern> {
    vec![
        NamePattern::Suffix("_gpu".to_string()),
        NamePattern::Prefix("ui.".to_string()),
    ]
}

/// Knobs for [`Pipeline::new`].
pub struct PipelineOptions {
    /// Spawn a worker pool. Without one, every task runs inline.
    pub use_worker_pool: bool,
    /// Worker count; `None` means the reported hardware concurrency.
    pub worker_count: Option<usize>,
    /// Marker field name for packed values.
    pub marker: String,
    /// Default lookup bases handed to the workers.
    pub lookup: Option<Vec<String>>,
    /// Method names excluded from pool dispatch.
    pub no_multithread: Vec<NamePattern>,
    /// Custom codec registry; defaults to the built-in codecs under `marker`.
    pub codecs: Option<Arc<CodecRegistry>>,
}

impl Default for PipelineOptions {
    fn default() -> Self {
        Self {
            use_worker_pool: true,
            worker_count: None,
            marker: DEFAULT_MARKER.to_string(),
            lookup: None,
            no_multithread: default_no_multithread(),
            codecs: None,
        }
    }
}

/// Notifications delivered to listeners registered with
/// [`Pipeline::on_event`].
#[derive(Clone, Debug)]
pub enum PipelineEvent {
    TaskDispatch {
        name: String,
        context: usize,
    },
    TaskDone {
        name: String,
        context: usize,
        result: Value,
        /// Worker index for pool completions, `None` for inline ones.
        worker: Option<usize>,
    },
    ContextTerminated {
        context: usize,
    },
    PoolTerminated,
}

/// Completion of an inline task, delivered through the pipeline's own
/// channel so synchronous and asynchronous callables share one path.
struct InlineDone {
    context: usize,
    epoch: u64,
    name: String,
    result: Value,
}

enum Event {
    Worker(WorkerReply),
    Inline(InlineDone),
}

/// Per-`process()` scheduling state.
struct ExecutionContext {
    /// Distinguishes this context from earlier occupants of the same slot.
    epoch: u64,
    target: String,
    /// Private copy of the dependency subgraph, shrinking as tasks finish.
    graph: Graph,
    /// FIFO admission queue; entries leave on completion.
    queue: VecDeque<String>,
    admitted: HashSet<String>,
    dispatched: HashSet<String>,
    finished: HashSet<String>,
    results: HashMap<String, Value>,
    /// Dependents left to consume each stored result.
    consumers: HashMap<String, usize>,
    in_flight: usize,
    cancel: CancelToken,
    outcome: Option<Value>,
}

type Listener = Box<dyn FnMut(&PipelineEvent) + Send>;

/// A task-graph processing pipeline.
///
/// Built from an immutable [`PipelineConfig`] and a shared callable
/// [`Registry`]; dispatches ready tasks inline or across the worker pool
/// while honouring data-flow order and single-owner buffer semantics.
pub struct Pipeline {
    id: u64,
    config: PipelineConfig,
    registry: Arc<Registry>,
    codecs: Arc<CodecRegistry>,
    /// Lazily built, cached dependency graph.
    graph: Option<Graph>,
    pool: Option<WorkerPool>,
    pool_rx: Option<Receiver<WorkerReply>>,
    contexts: Vec<Option<ExecutionContext>>,
    inline_tx: Sender<InlineDone>,
    inline_rx: Receiver<InlineDone>,
    listeners: Vec<Listener>,
    no_multithread: Vec<NamePattern>,
    next_epoch: u64,
    terminated: bool,
}

impl Pipeline {
    pub fn new(
        config: PipelineConfig,
        registry: Arc<Registry>,
        options: PipelineOptions,
    ) -> Result<Self, PipelineError> {
        let marker = options.marker.clone();
        let codecs = options
            .codecs
            .unwrap_or_else(|| Arc::new(CodecRegistry::with_defaults(marker)));
        let pool = if options.use_worker_pool {
            Some(WorkerPool::new(
                registry.clone(),
                codecs.clone(),
                options.worker_count,
                options.lookup.clone(),
            )?)
        } else {
            None
        };
        let pool_rx = pool.as_ref().map(|p| p.replies().clone());
        let (inline_tx, inline_rx) = unbounded();

        Ok(Self {
            id: PIPELINE_IDS.fetch_add(1, Ordering::Relaxed),
            config,
            registry,
            codecs,
            graph: None,
            pool,
            pool_rx,
            contexts: Vec::new(),
            inline_tx,
            inline_rx,
            listeners: Vec::new(),
            no_multithread: options.no_multithread,
            next_epoch: 0,
            terminated: false,
        })
    }

    /// Register an event listener.
    pub fn on_event(&mut self, listener: impl FnMut(&PipelineEvent) + Send + 'static) {
        self.listeners.push(Box::new(listener));
    }

    /// Run the pipeline until `target` completes and return its result.
    pub fn process(&mut self, target: &str) -> Result<Value, PipelineError> {
        self.process_with(target, CancelToken::new())
    }

    /// Like [`Pipeline::process`], with a cancel token observed at every
    /// scheduling step.
    pub fn process_with(
        &mut self,
        target: &str,
        cancel: CancelToken,
    ) -> Result<Value, PipelineError> {
        if self.terminated {
            return Err(PipelineError::Terminated);
        }
        self.ensure_graph()?;
        if !self.config.contains(target) {
            return Err(ConfigError::UnknownTarget(target.to_string()).into());
        }

        let context_graph = self
            .graph
            .as_ref()
            .expect("graph was just built")
            .reachable_from(target);
        let slot = match self.contexts.iter().position(Option::is_none) {
            Some(free) => free,
            None => {
                self.contexts.push(None);
                self.contexts.len() - 1
            }
        };
        let epoch = self.next_epoch;
        self.next_epoch += 1;
        self.contexts[slot] = Some(ExecutionContext {
            epoch,
            target: target.to_string(),
            graph: context_graph,
            queue: VecDeque::new(),
            admitted: HashSet::new(),
            dispatched: HashSet::new(),
            finished: HashSet::new(),
            results: HashMap::new(),
            consumers: HashMap::new(),
            in_flight: 0,
            cancel,
            outcome: None,
        });
        info!(target, context = slot, "processing");

        let outcome = self.run_to_completion(slot);
        if outcome.is_err() {
            if let Some(ctx) = self.contexts.get_mut(slot) {
                *ctx = None;
            }
            // Worker failures abort the pool, not just the task.
            if let Err(PipelineError::Pool(PoolError::Worker { .. })) = &outcome {
                if let Some(mut pool) = self.pool.take() {
                    pool.terminate();
                    self.pool_rx = None;
                    self.emit(PipelineEvent::PoolTerminated);
                }
            }
        }
        outcome
    }

    /// Tear the pipeline down: stop every context, terminate the pool and
    /// drop cached state. Further `process` calls are rejected.
    pub fn terminate(&mut self) {
        if self.terminated {
            return;
        }
        self.terminated = true;
        for slot in 0..self.contexts.len() {
            if self.contexts[slot].take().is_some() {
                self.emit(PipelineEvent::ContextTerminated { context: slot });
            }
        }
        if let Some(mut pool) = self.pool.take() {
            pool.terminate();
            self.pool_rx = None;
            self.emit(PipelineEvent::PoolTerminated);
        }
        self.graph = None;
        info!("pipeline terminated");
    }

    fn ensure_graph(&mut self) -> Result<(), PipelineError> {
        if self.graph.is_some() {
            return Ok(());
        }
        let graph = build_graph(&self.config)?;
        if graph.has_cycle() {
            return Err(PipelineError::Cycle);
        }
        self.graph = Some(graph);
        Ok(())
    }

    fn run_to_completion(&mut self, slot: usize) -> Result<Value, PipelineError> {
        self.drive(slot)?;
        loop {
            if let Some(value) = self.take_outcome(slot) {
                return Ok(value);
            }
            match self.wait_event()? {
                Event::Worker(reply) => self.on_worker_reply(reply)?,
                Event::Inline(done) => {
                    self.complete(done.context, done.epoch, done.name, done.result, None)?
                }
            }
        }
    }

    fn take_outcome(&mut self, slot: usize) -> Option<Value> {
        let ctx = self.contexts.get_mut(slot)?.as_mut()?;
        let value = ctx.outcome.take()?;
        self.contexts[slot] = None;
        Some(value)
    }

    /// Block until a worker reply or an inline completion arrives.
    fn wait_event(&self) -> Result<Event, PipelineError> {
        match &self.pool_rx {
            Some(pool_rx) => {
                let mut select = Select::new();
                let pool_idx = select.recv(pool_rx);
                let inline_idx = select.recv(&self.inline_rx);
                let op = select.select();
                match op.index() {
                    i if i == pool_idx => op
                        .recv(pool_rx)
                        .map(Event::Worker)
                        .map_err(|_| PipelineError::Pool(PoolError::Terminated)),
                    i if i == inline_idx => op
                        .recv(&self.inline_rx)
                        .map(Event::Inline)
                        .map_err(|_| PipelineError::Terminated),
                    _ => unreachable!("select returned an unregistered operation"),
                }
            }
            None => self
                .inline_rx
                .recv()
                .map(Event::Inline)
                .map_err(|_| PipelineError::Terminated),
        }
    }

    fn on_worker_reply(&mut self, reply: WorkerReply) -> Result<(), PipelineError> {
        let pool = self
            .pool
            .as_mut()
            .ok_or(PipelineError::Pool(PoolError::Terminated))?;
        let PoolEvent::WorkerDone {
            result,
            task,
            worker,
        } = pool.handle_reply(reply)?;

        let Some(meta) = task.meta().cloned() else {
            debug!("ignoring completion of a task the pipeline did not dispatch");
            return Ok(());
        };
        if meta.pipeline != self.id {
            return Ok(());
        }
        self.complete(meta.context, meta.epoch, meta.name, result, Some(worker))
    }

    /// Completion bookkeeping and the re-entry into the scheduling step.
    fn complete(
        &mut self,
        slot: usize,
        epoch: u64,
        name: String,
        result: Value,
        worker: Option<usize>,
    ) -> Result<(), PipelineError> {
        let Some((cancelled, live_epoch)) = self
            .contexts
            .get(slot)
            .and_then(Option::as_ref)
            .map(|ctx| (ctx.cancel.is_cancelled(), ctx.epoch))
        else {
            debug!(task = name.as_str(), context = slot, "discarding completion for a finished context");
            return Ok(());
        };
        if live_epoch != epoch {
            debug!(task = name.as_str(), context = slot, "discarding completion for an earlier context");
            return Ok(());
        }
        if cancelled {
            self.contexts[slot] = None;
            self.emit(PipelineEvent::ContextTerminated { context: slot });
            return Err(PipelineError::ContextStopped(slot));
        }

        let ctx = self.contexts[slot].as_mut().expect("checked above");
        if !ctx.finished.insert(name.clone()) {
            warn!(task = name.as_str(), "duplicate completion ignored");
            return Ok(());
        }
        ctx.in_flight = ctx.in_flight.saturating_sub(1);
        ctx.queue.retain(|queued| queued != &name);

        let (dependencies, dependents) = match ctx.graph.get(&name) {
            Some(vertex) => (vertex.outbound().to_vec(), vertex.inbound().len()),
            None => (Vec::new(), 0),
        };
        ctx.graph.remove_vertex(&name);
        ctx.results.insert(name.clone(), result.clone());
        ctx.consumers.insert(name.clone(), dependents);

        // Reclaim results whose last dependent just finished.
        for dep in &dependencies {
            if let Some(left) = ctx.consumers.get_mut(dep) {
                *left = left.saturating_sub(1);
                if *left == 0
                    && dep != &ctx.target
                    && !self
                        .config
                        .get(dep)
                        .is_some_and(|d| d.preserve_result_copy)
                {
                    ctx.results.remove(dep);
                    debug!(task = dep.as_str(), "stored result reclaimed");
                }
            }
        }

        let is_target = name == ctx.target;
        if is_target {
            ctx.outcome = Some(result.clone());
        }
        debug!(task = name.as_str(), context = slot, worker, "task done");
        self.emit(PipelineEvent::TaskDone {
            name,
            context: slot,
            result,
            worker,
        });

        if is_target {
            return Ok(());
        }
        self.drive(slot)
    }

    /// The scheduling step loop: admit leaves, pick FIFO heads and dispatch
    /// until no further ready task exists.
    fn drive(&mut self, slot: usize) -> Result<(), PipelineError> {
        loop {
            let Some(cancelled) = self
                .contexts
                .get(slot)
                .and_then(Option::as_ref)
                .map(|ctx| ctx.cancel.is_cancelled())
            else {
                return Ok(());
            };
            if cancelled {
                self.contexts[slot] = None;
                self.emit(PipelineEvent::ContextTerminated { context: slot });
                return Err(PipelineError::ContextStopped(slot));
            }

            let picked = {
                let ctx = self.contexts[slot].as_mut().expect("checked above");

                // Long-term admission: every current leaf not yet admitted.
                let leaves: Vec<String> =
                    ctx.graph.leaves().iter().map(|s| s.to_string()).collect();
                for leaf in leaves {
                    if ctx.admitted.insert(leaf.clone()) {
                        debug!(task = leaf.as_str(), context = slot, "task admitted");
                        ctx.queue.push_back(leaf);
                    }
                }

                // Short-term selection: first queued entry not in flight.
                let candidate = ctx
                    .queue
                    .iter()
                    .find(|name| !ctx.dispatched.contains(*name))
                    .cloned();
                if candidate.is_none()
                    && ctx.queue.is_empty()
                    && ctx.graph.leaves().is_empty()
                    && ctx.outcome.is_none()
                {
                    return Err(PipelineError::Starvation {
                        target: ctx.target.clone(),
                    });
                }
                candidate
            };

            let Some(name) = picked else {
                return Ok(());
            };
            self.dispatch_one(slot, name)?;
        }
    }

    fn dispatch_one(&mut self, slot: usize, name: String) -> Result<(), PipelineError> {
        let description = self
            .config
            .get(&name)
            .cloned()
            .expect("admitted tasks are configured");

        let (method, receiver) = match &description.command {
            Command::Call(path) => (path.clone(), None),
            Command::Await { then, .. } => (then.clone(), None),
            Command::Deferred(deferred) => {
                let method = deferred
                    .then
                    .clone()
                    .expect("validated during graph construction");
                let ctx = self.contexts[slot].as_ref().expect("context is live");
                let value = ctx
                    .results
                    .get(&deferred.dep)
                    .cloned()
                    .expect("dependencies finish before their dependents");
                (method, Some(value))
            }
        };

        let mut args = Vec::with_capacity(description.args.len());
        {
            let ctx = self.contexts[slot].as_ref().expect("context is live");
            for arg in &description.args {
                match arg {
                    Arg::Deferred(deferred) => {
                        let stored = ctx
                            .results
                            .get(&deferred.dep)
                            .cloned()
                            .expect("dependencies finish before their dependents");
                        let value = match &deferred.then {
                            Some(path) => stored.member(path).ok_or_else(|| {
                                PipelineError::Task {
                                    name: name.clone(),
                                    source: TaskError::Lookup(LookupError::Member {
                                        path: path.clone(),
                                    }),
                                }
                            })?,
                            None => stored,
                        };
                        args.push(Arg::Value(value));
                    }
                    other => args.push(other.clone()),
                }
            }
        }

        let epoch = self.contexts[slot]
            .as_ref()
            .expect("context is live")
            .epoch;
        let mut task = Task::new(method.as_str(), args, self.codecs.clone());
        if let Some(receiver) = receiver {
            task.set_receiver(receiver);
        }
        task.set_meta(TaskMeta {
            pipeline: self.id,
            context: slot,
            epoch,
            name: name.clone(),
        });

        let pooled = self.pool.is_some()
            && !description.no_multithreading
            && !self.no_multithread.iter().any(|p| p.matches(&method));

        {
            let ctx = self.contexts[slot].as_mut().expect("context is live");
            ctx.dispatched.insert(name.clone());
            ctx.in_flight += 1;
        }
        debug!(task = name.as_str(), context = slot, pooled, "dispatching");
        self.emit(PipelineEvent::TaskDispatch {
            name: name.clone(),
            context: slot,
        });

        if pooled {
            // A result consumed by several dependents must survive this
            // dispatch: downgrade its buffers from move to copy.
            {
                let full_graph = self.graph.as_ref().expect("graph is built");
                let ctx = self.contexts[slot].as_ref().expect("context is live");
                for (dep, by_value) in description.dependencies() {
                    if !by_value {
                        continue;
                    }
                    let weight = full_graph.get(&dep).map(|v| v.weight()).unwrap_or(0);
                    if weight > 1 {
                        if let Some(stored) = ctx.results.get(&dep) {
                            task.remove_movable(stored);
                        }
                    }
                }
            }
            self.pool
                .as_mut()
                .expect("pooled dispatch implies a pool")
                .run_task(task)?;
        } else {
            let tx = self.inline_tx.clone();
            let context = slot;
            let task_name = name.clone();
            let done: Box<dyn FnOnce(Value) + Send> = Box::new(move |value| {
                let _ = tx.send(InlineDone {
                    context,
                    epoch,
                    name: task_name,
                    result: value,
                });
            });
            task.run(&self.registry, Some(done))
                .map_err(|source| PipelineError::Task { name, source })?;
        }
        Ok(())
    }

    fn emit(&mut self, event: PipelineEvent) {
        for listener in &mut self.listeners {
            listener(&event);
        }
    }
}

impl Drop for Pipeline {
    fn drop(&mut self) {
        if let Some(mut pool) = self.pool.take() {
            pool.terminate();
        }
    }
}

/// Build the dependency graph from the configuration: one vertex per task,
/// one edge per deferred/await mention, weights counting by-value consumers
/// and preserve flags.
fn build_graph(config: &PipelineConfig) -> Result<Graph, PipelineError> {
    let mut graph = Graph::new();
    for (name, _) in config.iter() {
        graph.add_vertex(name);
    }
    for (name, description) in config.iter() {
        if let Command::Deferred(deferred) = &description.command {
            if deferred.then.is_none() {
                return Err(ConfigError::CommandWithoutMethod {
                    task: name.to_string(),
                }
                .into());
            }
        }
        for (dep, by_value) in description.dependencies() {
            if !graph.has_vertex(&dep) {
                return Err(ConfigError::MissingDependency {
                    task: name.to_string(),
                    dependency: dep,
                }
                .into());
            }
            graph.add_edge(name, &dep).expect("both vertices exist");
            if by_value {
                graph.add_weight(&dep, 1).expect("vertex exists");
            }
        }
    }
    for (name, description) in config.iter() {
        if description.preserve_result_copy {
            graph.add_weight(name, 1).expect("vertex exists");
        }
    }
    Ok(graph)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{async_result, result_of, variable, TaskDescription};
    use crate::lookup::Namespace;
    use crate::value::ByteBuf;
    use std::sync::Mutex;

    fn registry() -> Arc<Registry> {
        let mut global = Namespace::new();
        global.func("id", |_, args| Ok(args[0].clone()));
        global.func("inc", |_, args| {
            Ok(Value::Int(args[0].as_int().unwrap_or(0) + 1))
        });
        global.func("add", |_, args| {
            Ok(Value::Int(
                args[0].as_int().unwrap_or(0) + args[1].as_int().unwrap_or(0),
            ))
        });
        global.func("make_buffer", |_, _| {
            Ok(Value::Buffer(ByteBuf::new(vec![1, 2, 3])))
        });
        global.func("sum_bytes", |_, args| {
            let buf = args[0]
                .as_buffer()
                .ok_or_else(|| anyhow::anyhow!("expected a buffer"))?;
            Ok(Value::Int(buf.with(|b| b.iter().map(|&x| x as i64).sum())))
        });
        global.func("deliver", |_, args| {
            let callback = args[0]
                .as_callback()
                .ok_or_else(|| anyhow::anyhow!("expected the injected callback"))?;
            callback.resolve(Value::Int(42));
            Ok(Value::Null)
        });
        global.func("render_gpu", |_, _| Ok(Value::Text("frame".into())));
        Arc::new(Registry::with_global(global))
    }

    fn inline_options() -> PipelineOptions {
        PipelineOptions {
            use_worker_pool: false,
            ..PipelineOptions::default()
        }
    }

    fn pooled_options(workers: usize) -> PipelineOptions {
        PipelineOptions {
            worker_count: Some(workers),
            ..PipelineOptions::default()
        }
    }

    fn recorded_events(pipeline: &mut Pipeline) -> Arc<Mutex<Vec<PipelineEvent>>> {
        let events = Arc::new(Mutex::new(Vec::new()));
        let sink = events.clone();
        pipeline.on_event(move |event| sink.lock().unwrap().push(event.clone()));
        events
    }

    #[test]
    fn single_task_inline() {
        let mut config = PipelineConfig::new();
        config.task("inc", TaskDescription::new("inc").arg(1i64));

        let mut pipeline = Pipeline::new(config, registry(), inline_options()).unwrap();
        assert_eq!(pipeline.process("inc").unwrap(), Value::Int(2));
    }

    #[test]
    fn single_task_pooled() {
        let mut config = PipelineConfig::new();
        config.task("inc", TaskDescription::new("inc").arg(41i64));

        let mut pipeline = Pipeline::new(config, registry(), pooled_options(1)).unwrap();
        assert_eq!(pipeline.process("inc").unwrap(), Value::Int(42));
    }

    #[test]
    fn deferred_result_chains_in_order() {
        let mut config = PipelineConfig::new();
        config.task("A", TaskDescription::new("id").arg(10i64));
        config.task(
            "B",
            TaskDescription::new("add").arg(result_of("A")).arg(5i64),
        );

        let mut pipeline = Pipeline::new(config, registry(), inline_options()).unwrap();
        let events = recorded_events(&mut pipeline);

        assert_eq!(pipeline.process("B").unwrap(), Value::Int(15));

        let done: Vec<String> = events
            .lock()
            .unwrap()
            .iter()
            .filter_map(|event| match event {
                PipelineEvent::TaskDone { name, .. } => Some(name.clone()),
                _ => None,
            })
            .collect();
        assert_eq!(done, vec!["A".to_string(), "B".to_string()]);
    }

    #[test]
    fn cyclic_configuration_is_rejected() {
        let mut config = PipelineConfig::new();
        config.task("A", TaskDescription::new("id").arg(result_of("B")));
        config.task("B", TaskDescription::new("id").arg(result_of("A")));

        let mut pipeline = Pipeline::new(config, registry(), inline_options()).unwrap();
        assert!(matches!(
            pipeline.process("A"),
            Err(PipelineError::Cycle)
        ));
    }

    #[test]
    fn missing_dependency_cites_both_names() {
        let mut config = PipelineConfig::new();
        config.task("A", TaskDescription::new("id").arg(result_of("ghost")));

        let mut pipeline = Pipeline::new(config, registry(), inline_options()).unwrap();
        match pipeline.process("A") {
            Err(PipelineError::Config(ConfigError::MissingDependency { task, dependency })) => {
                assert_eq!(task, "A");
                assert_eq!(dependency, "ghost");
            }
            other => panic!("expected a missing-dependency error, got {other:?}"),
        }
    }

    #[test]
    fn async_result_injects_completion() {
        let mut config = PipelineConfig::new();
        config.task("produce", TaskDescription::new("deliver").arg(async_result()));
        config.task(
            "consume",
            TaskDescription::new("add")
                .arg(result_of("produce"))
                .arg(0i64),
        );

        let mut pipeline = Pipeline::new(config, registry(), inline_options()).unwrap();
        assert_eq!(pipeline.process("consume").unwrap(), Value::Int(42));
    }

    #[test]
    fn shared_result_buffer_is_copied_for_multiple_dependents() {
        let mut config = PipelineConfig::new();
        config.task("make", TaskDescription::new("make_buffer"));
        config.task(
            "left",
            TaskDescription::new("sum_bytes").arg(result_of("make")),
        );
        config.task(
            "right",
            TaskDescription::new("sum_bytes").arg(result_of("make")),
        );
        config.task(
            "join",
            TaskDescription::new("add")
                .arg(result_of("left"))
                .arg(result_of("right")),
        );

        let mut pipeline = Pipeline::new(config, registry(), pooled_options(2)).unwrap();
        assert_eq!(pipeline.process("join").unwrap(), Value::Int(12));
    }

    #[test]
    fn no_multithreading_flag_keeps_task_inline() {
        let mut config = PipelineConfig::new();
        config.task(
            "local",
            TaskDescription::new("inc").arg(1i64).no_multithreading(),
        );
        config.task(
            "remote",
            TaskDescription::new("add").arg(result_of("local")).arg(0i64),
        );

        let mut pipeline = Pipeline::new(config, registry(), pooled_options(1)).unwrap();
        let events = recorded_events(&mut pipeline);
        assert_eq!(pipeline.process("remote").unwrap(), Value::Int(2));

        let workers: HashMap<String, Option<usize>> = events
            .lock()
            .unwrap()
            .iter()
            .filter_map(|event| match event {
                PipelineEvent::TaskDone { name, worker, .. } => Some((name.clone(), *worker)),
                _ => None,
            })
            .collect();
        assert_eq!(workers["local"], None, "flagged task ran inline");
        assert!(workers["remote"].is_some(), "other task used the pool");
    }

    #[test]
    fn gpu_suffixed_method_is_kept_off_the_pool() {
        let mut config = PipelineConfig::new();
        config.task("frame", TaskDescription::new("render_gpu"));

        let mut pipeline = Pipeline::new(config, registry(), pooled_options(1)).unwrap();
        let events = recorded_events(&mut pipeline);
        assert_eq!(pipeline.process("frame").unwrap(), Value::Text("frame".into()));

        let worker = events.lock().unwrap().iter().find_map(|event| match event {
            PipelineEvent::TaskDone { worker, .. } => Some(*worker),
            _ => None,
        });
        assert_eq!(worker, Some(None));
    }

    #[test]
    fn late_static_binding_resolves_at_execution_time() {
        let mut config = PipelineConfig::new();
        config.task(
            "scaled",
            TaskDescription::new("add").arg(variable("offset")).arg(2i64),
        );

        let registry = registry();
        registry.set_variable("offset", Value::Int(40));
        let mut pipeline = Pipeline::new(config, registry, inline_options()).unwrap();
        assert_eq!(pipeline.process("scaled").unwrap(), Value::Int(42));
    }

    #[test]
    fn unresolvable_method_fails_the_pipeline() {
        let mut config = PipelineConfig::new();
        config.task("broken", TaskDescription::new("no.such.method"));

        let mut pipeline = Pipeline::new(config, registry(), inline_options()).unwrap();
        assert!(matches!(
            pipeline.process("broken"),
            Err(PipelineError::Task {
                source: TaskError::Lookup(LookupError::Unresolved { .. }),
                ..
            })
        ));
    }

    #[test]
    fn cancelled_context_reports_termination() {
        let mut config = PipelineConfig::new();
        config.task("inc", TaskDescription::new("inc").arg(1i64));

        let mut pipeline = Pipeline::new(config, registry(), inline_options()).unwrap();
        let events = recorded_events(&mut pipeline);

        let token = CancelToken::new();
        token.cancel();
        assert!(matches!(
            pipeline.process_with("inc", token),
            Err(PipelineError::ContextStopped(_))
        ));
        assert!(events
            .lock()
            .unwrap()
            .iter()
            .any(|event| matches!(event, PipelineEvent::ContextTerminated { .. })));
    }

    #[test]
    fn terminate_rejects_further_processing() {
        let mut config = PipelineConfig::new();
        config.task("inc", TaskDescription::new("inc").arg(1i64));

        let mut pipeline = Pipeline::new(config, registry(), pooled_options(1)).unwrap();
        let events = recorded_events(&mut pipeline);
        pipeline.terminate();

        assert!(matches!(
            pipeline.process("inc"),
            Err(PipelineError::Terminated)
        ));
        assert!(events
            .lock()
            .unwrap()
            .iter()
            .any(|event| matches!(event, PipelineEvent::PoolTerminated)));
        // Idempotent.
        pipeline.terminate();
    }

    #[test]
    fn unknown_target_is_a_configuration_error() {
        let config = PipelineConfig::new();
        let mut pipeline = Pipeline::new(config, registry(), inline_options()).unwrap();
        assert!(matches!(
            pipeline.process("missing"),
            Err(PipelineError::Config(ConfigError::UnknownTarget(_)))
        ));
    }

    #[test]
    fn command_deferred_invokes_method_with_receiver() {
        let mut global = Namespace::new();
        global.func("make_record", |_, _| {
            Ok(Value::record([("count", Value::Int(41))]))
        });
        global.func("bump", |receiver, _| {
            let base = receiver
                .and_then(|r| r.member("count"))
                .and_then(|v| v.as_int())
                .ok_or_else(|| anyhow::anyhow!("expected a record receiver"))?;
            Ok(Value::Int(base + 1))
        });
        let registry = Arc::new(Registry::with_global(global));

        let mut config = PipelineConfig::new();
        config.task("record", TaskDescription::new("make_record"));
        config.task(
            "bumped",
            TaskDescription::new(result_of("record").then("bump")),
        );

        let mut pipeline = Pipeline::new(config, registry, inline_options()).unwrap();
        assert_eq!(pipeline.process("bumped").unwrap(), Value::Int(42));
    }

    #[test]
    fn deferred_member_path_plucks_from_result() {
        let mut global = Namespace::new();
        global.func("stats", |_, _| {
            Ok(Value::record([
                ("sum", Value::Int(40)),
                ("count", Value::Int(4)),
            ]))
        });
        global.func("add", |_, args| {
            Ok(Value::Int(
                args[0].as_int().unwrap_or(0) + args[1].as_int().unwrap_or(0),
            ))
        });
        let registry = Arc::new(Registry::with_global(global));

        let mut config = PipelineConfig::new();
        config.task("stats", TaskDescription::new("stats"));
        config.task(
            "total",
            TaskDescription::new("add")
                .arg(result_of("stats").then("sum"))
                .arg(2i64),
        );

        let mut pipeline = Pipeline::new(config, registry, inline_options()).unwrap();
        assert_eq!(pipeline.process("total").unwrap(), Value::Int(42));
    }
}

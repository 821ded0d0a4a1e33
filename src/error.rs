use thiserror::Error;

/// Errors raised while validating a pipeline configuration.
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("task '{dependency}' is mentioned as dependency of '{task}' but does not have a task description")]
    MissingDependency { task: String, dependency: String },

    #[error("target task '{0}' does not have a task description")]
    UnknownTarget(String),

    #[error("task '{task}': a deferred result used as command must name a method path")]
    CommandWithoutMethod { task: String },
}

/// Errors raised by structural graph operations.
#[derive(Debug, Error)]
pub enum GraphError {
    #[error("unknown vertex '{0}'")]
    UnknownVertex(String),
}

/// Errors raised while resolving callables and late-bound values.
#[derive(Debug, Error)]
pub enum LookupError {
    #[error("method '{path}' could not be resolved in any lookup base")]
    Unresolved { path: String },

    #[error("'{path}' does not name a callable")]
    NotCallable { path: String },

    #[error("late-bound variable '{name}' is not defined")]
    UndefinedVariable { name: String },

    #[error("member path '{path}' is not present in the result")]
    Member { path: String },
}

/// Errors raised by a single task invocation.
#[derive(Debug, Error)]
pub enum TaskError {
    #[error(transparent)]
    Lookup(#[from] LookupError),

    #[error("argument {index} still holds an unresolved deferred result of '{dep}'")]
    UnresolvedDeferred { index: usize, dep: String },

    #[error("callable failed:\n{0}")]
    Execution(#[from] anyhow::Error),
}

/// Errors raised by the worker pool.
#[derive(Debug, Error)]
pub enum PoolError {
    /// Every waiting task holds at least one buffer whose contents were moved
    /// to a worker, and no worker is busy, so nothing can ever return them.
    #[error("cannot dispatch waiting tasks because they have neutered arguments")]
    Stall,

    #[error("task '{0}' carries an inline callable that cannot be shipped to a worker")]
    Serialization(String),

    #[error("worker {worker} failed while running '{task}':\n{message}")]
    Worker {
        worker: usize,
        task: String,
        message: String,
    },

    #[error("worker {0} disconnected unexpectedly")]
    Disconnected(usize),

    #[error("worker pool is terminated")]
    Terminated,

    #[error("failed to spawn worker thread:\n{0}")]
    Spawn(#[from] std::io::Error),
}

/// Errors surfaced to callers of the pipeline. All of these are fatal; the
/// pipeline makes no recovery attempt.
#[derive(Debug, Error)]
pub enum PipelineError {
    #[error(transparent)]
    Config(#[from] ConfigError),

    #[error("dependency graph contains a cycle")]
    Cycle,

    #[error("pipeline starved: no runnable task and nothing in flight before target '{target}'")]
    Starvation { target: String },

    #[error(transparent)]
    Pool(#[from] PoolError),

    #[error("task '{name}' failed:\n{source}")]
    Task { name: String, source: TaskError },

    #[error("execution context {0} was stopped")]
    ContextStopped(usize),

    #[error("pipeline has been terminated")]
    Terminated,
}

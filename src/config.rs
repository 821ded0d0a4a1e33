//! Declarative pipeline configuration.
//!
//! A [`PipelineConfig`] maps human-readable task names to [`TaskDescription`]s.
//! Argument lists may embed late-bound placeholders: deferred results of other
//! tasks, process-wide variables, and the async completion slot. The
//! configuration is immutable once handed to a pipeline.

use indexmap::IndexMap;

use crate::value::Value;

/// A placeholder for the result of another task.
///
/// When `pass_ref` is false the consuming task receives the result by value
/// (counting towards the producer's weight); when true, a moved reference.
/// The optional `then` path selects a member of the result when the deferred
/// appears among the arguments, and names the method to invoke when it
/// appears as the command.
#[derive(Clone, Debug, PartialEq)]
pub struct Deferred {
    pub dep: String,
    pub then: Option<String>,
    pub pass_ref: bool,
}

impl Deferred {
    /// Attach a member/method path.
    pub fn then(mut self, path: impl Into<String>) -> Self {
        self.then = Some(path.into());
        self
    }
}

/// The result of task `dep`, consumed by value.
pub fn result_of(dep: impl Into<String>) -> Deferred {
    Deferred {
        dep: dep.into(),
        then: None,
        pass_ref: false,
    }
}

/// The result of task `dep`, passed as a moved reference.
pub fn reference_to_result_of(dep: impl Into<String>) -> Deferred {
    Deferred {
        dep: dep.into(),
        then: None,
        pass_ref: true,
    }
}

/// A temporal dependency: run `then` once `dep` has completed, without
/// consuming its result. Only valid in command position.
pub fn wait_for(dep: impl Into<String>, then: impl Into<String>) -> Command {
    Command::Await {
        dep: dep.into(),
        then: then.into(),
    }
}

/// The argument slot into which the pipeline injects a completion callback.
pub fn async_result() -> Arg {
    Arg::Async
}

/// A late static binding, resolved at execution time from the registry's
/// process-wide variable table.
pub fn variable(name: impl Into<String>) -> Arg {
    Arg::Late(name.into())
}

/// What a task runs.
#[derive(Clone, Debug, PartialEq)]
pub enum Command {
    /// A dot-separated callable path resolved through the lookup bases.
    Call(String),
    /// A method invoked on the result of another task.
    Deferred(Deferred),
    /// A callable gated on another task's completion, result unused.
    Await { dep: String, then: String },
}

impl From<&str> for Command {
    fn from(path: &str) -> Self {
        Command::Call(path.to_string())
    }
}

impl From<String> for Command {
    fn from(path: String) -> Self {
        Command::Call(path)
    }
}

impl From<Deferred> for Command {
    fn from(deferred: Deferred) -> Self {
        Command::Deferred(deferred)
    }
}

/// One element of a task's argument list.
#[derive(Clone, Debug, PartialEq)]
pub enum Arg {
    /// A plain value.
    Value(Value),
    /// The result of another task; substituted by the scheduler at dispatch.
    Deferred(Deferred),
    /// A process-wide variable; resolved when the task runs.
    Late(String),
    /// The async completion slot; replaced with a callback when the task runs.
    Async,
}

impl From<Value> for Arg {
    fn from(value: Value) -> Self {
        Arg::Value(value)
    }
}

impl From<Deferred> for Arg {
    fn from(deferred: Deferred) -> Self {
        Arg::Deferred(deferred)
    }
}

impl From<bool> for Arg {
    fn from(v: bool) -> Self {
        Arg::Value(Value::Bool(v))
    }
}

impl From<i64> for Arg {
    fn from(v: i64) -> Self {
        Arg::Value(Value::Int(v))
    }
}

impl From<f64> for Arg {
    fn from(v: f64) -> Self {
        Arg::Value(Value::Float(v))
    }
}

impl From<&str> for Arg {
    fn from(v: &str) -> Self {
        Arg::Value(Value::Text(v.to_string()))
    }
}

/// Description of a single configured task.
#[derive(Clone, Debug)]
pub struct TaskDescription {
    pub command: Command,
    pub args: Vec<Arg>,
    /// Keep the stored result alive even after every dependent finished.
    pub preserve_result_copy: bool,
    /// Never dispatch this task to the worker pool.
    pub no_multithreading: bool,
}

impl TaskDescription {
    pub fn new(command: impl Into<Command>) -> Self {
        Self {
            command: command.into(),
            args: Vec::new(),
            preserve_result_copy: false,
            no_multithreading: false,
        }
    }

    /// Append one argument.
    pub fn arg(mut self, arg: impl Into<Arg>) -> Self {
        self.args.push(arg.into());
        self
    }

    pub fn preserve_result_copy(mut self) -> Self {
        self.preserve_result_copy = true;
        self
    }

    pub fn no_multithreading(mut self) -> Self {
        self.no_multithreading = true;
        self
    }

    /// Names of every task this description depends on, in declaration order,
    /// paired with whether the result is consumed by value.
    pub(crate) fn dependencies(&self) -> Vec<(String, bool)> {
        let mut deps = Vec::new();
        match &self.command {
            Command::Call(_) => {}
            Command::Deferred(d) => deps.push((d.dep.clone(), !d.pass_ref)),
            Command::Await { dep, .. } => deps.push((dep.clone(), false)),
        }
        for arg in &self.args {
            if let Arg::Deferred(d) = arg {
                deps.push((d.dep.clone(), !d.pass_ref));
            }
        }
        deps
    }
}

/// Insertion-ordered mapping from task name to description.
#[derive(Clone, Debug, Default)]
pub struct PipelineConfig {
    tasks: IndexMap<String, TaskDescription>,
}

impl PipelineConfig {
    pub fn new() -> Self {
        Self::default()
    }

    /// Add a task description. Replaces any previous description of the same
    /// name.
    pub fn task(&mut self, name: impl Into<String>, description: TaskDescription) -> &mut Self {
        self.tasks.insert(name.into(), description);
        self
    }

    pub fn get(&self, name: &str) -> Option<&TaskDescription> {
        self.tasks.get(name)
    }

    pub fn contains(&self, name: &str) -> bool {
        self.tasks.contains_key(name)
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, &TaskDescription)> {
        self.tasks.iter().map(|(k, v)| (k.as_str(), v))
    }

    pub fn len(&self) -> usize {
        self.tasks.len()
    }

    pub fn is_empty(&self) -> bool {
        self.tasks.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn description_collects_dependencies_in_order() {
        let description = TaskDescription::new(result_of("producer").then("finish"))
            .arg(result_of("first"))
            .arg(7i64)
            .arg(reference_to_result_of("second"))
            .arg(variable("gain"));

        let deps = description.dependencies();
        assert_eq!(
            deps,
            vec![
                ("producer".to_string(), true),
                ("first".to_string(), true),
                ("second".to_string(), false),
            ]
        );
    }

    #[test]
    fn await_is_not_a_value_dependency() {
        let description = TaskDescription::new(wait_for("setup", "collect"));
        assert_eq!(description.dependencies(), vec![("setup".to_string(), false)]);
    }

    #[test]
    fn config_preserves_insertion_order() {
        let mut config = PipelineConfig::new();
        config.task("b", TaskDescription::new("f"));
        config.task("a", TaskDescription::new("g"));
        let names: Vec<&str> = config.iter().map(|(n, _)| n).collect();
        assert_eq!(names, vec!["b", "a"]);
    }
}

//! Runtime name resolution for task callables.
//!
//! Tasks reference their callables by dot-separated paths resolved against an
//! ordered list of lookup bases: named namespace roots registered in a
//! [`Registry`]. A namespace entry may be a callable, a nested namespace, or a
//! lazy accessor: a zero-argument closure producing the real namespace, tried
//! as a second-chance step when the segment name starts with a lowercase
//! letter.
//!
//! The registry also carries the process-wide variable table used to resolve
//! late static bindings at execution time.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use indexmap::IndexMap;

use crate::error::LookupError;
use crate::value::Value;

/// Signature of every registered callable: optional receiver plus positional
/// arguments. Userland failures travel as `anyhow` errors.
pub type NativeFn = Arc<dyn Fn(Option<&Value>, &[Value]) -> anyhow::Result<Value> + Send + Sync>;

type LazyFn = Arc<dyn Fn() -> Namespace + Send + Sync>;

/// One entry of a [`Namespace`].
#[derive(Clone)]
pub enum Binding {
    /// A callable terminal.
    Func(NativeFn),
    /// A nested namespace.
    Space(Namespace),
    /// A lazy namespace accessor, expanded on demand during resolution.
    Lazy(LazyFn),
}

/// A named tree of callables.
#[derive(Clone, Default)]
pub struct Namespace {
    entries: HashMap<String, Binding>,
}

impl Namespace {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a callable under `name`.
    pub fn func<F>(&mut self, name: impl Into<String>, f: F) -> &mut Self
    where
        F: Fn(Option<&Value>, &[Value]) -> anyhow::Result<Value> + Send + Sync + 'static,
    {
        self.entries.insert(name.into(), Binding::Func(Arc::new(f)));
        self
    }

    /// Register a nested namespace under `name`.
    pub fn nest(&mut self, name: impl Into<String>, namespace: Namespace) -> &mut Self {
        self.entries.insert(name.into(), Binding::Space(namespace));
        self
    }

    /// Register a lazy namespace accessor under `name`.
    pub fn lazy<F>(&mut self, name: impl Into<String>, f: F) -> &mut Self
    where
        F: Fn() -> Namespace + Send + Sync + 'static,
    {
        self.entries.insert(name.into(), Binding::Lazy(Arc::new(f)));
        self
    }

    pub fn get(&self, name: &str) -> Option<&Binding> {
        self.entries.get(name)
    }
}

impl std::fmt::Debug for Namespace {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_set().entries(self.entries.keys()).finish()
    }
}

/// The root name every registry starts with.
pub const GLOBAL_ROOT: &str = "global";

/// Ordered collection of named namespace roots, the default lookup list, and
/// the process-wide variable table for late static bindings.
pub struct Registry {
    roots: IndexMap<String, Namespace>,
    default_lookup: Vec<String>,
    variables: Mutex<HashMap<String, Value>>,
}

impl Default for Registry {
    fn default() -> Self {
        Self::new()
    }
}

impl Registry {
    /// A registry with an empty `global` root.
    pub fn new() -> Self {
        let mut roots = IndexMap::new();
        roots.insert(GLOBAL_ROOT.to_string(), Namespace::new());
        Self {
            roots,
            default_lookup: vec![GLOBAL_ROOT.to_string()],
            variables: Mutex::new(HashMap::new()),
        }
    }

    /// A registry whose `global` root is the given namespace.
    pub fn with_global(namespace: Namespace) -> Self {
        let mut registry = Self::new();
        registry.roots.insert(GLOBAL_ROOT.to_string(), namespace);
        registry
    }

    /// Add (or replace) a named root. Roots are searched in insertion order.
    pub fn add_root(&mut self, name: impl Into<String>, namespace: Namespace) -> &mut Self {
        self.roots.insert(name.into(), namespace);
        self
    }

    /// Replace the default lookup list (ordered root names).
    pub fn set_default_lookup(&mut self, lookup: Vec<String>) -> &mut Self {
        self.default_lookup = lookup;
        self
    }

    pub fn default_lookup(&self) -> &[String] {
        &self.default_lookup
    }

    /// Define a process-wide variable for late static binding.
    pub fn set_variable(&self, name: impl Into<String>, value: Value) {
        self.variables.lock().unwrap().insert(name.into(), value);
    }

    pub fn variable(&self, name: &str) -> Option<Value> {
        self.variables.lock().unwrap().get(name).cloned()
    }

    /// Resolve a dot-separated path against the given lookup list (or the
    /// default one). The first base that yields a callable wins.
    pub fn resolve(&self, path: &str, lookup: Option<&[String]>) -> Result<NativeFn, LookupError> {
        let bases = lookup.unwrap_or(&self.default_lookup);
        let mut saw_non_callable = false;

        for base in bases {
            let Some(root) = self.roots.get(base) else {
                continue;
            };
            match walk(root, path) {
                Ok(Some(f)) => return Ok(f),
                Ok(None) => {}
                Err(NonCallable) => saw_non_callable = true,
            }
        }

        if saw_non_callable {
            Err(LookupError::NotCallable {
                path: path.to_string(),
            })
        } else {
            Err(LookupError::Unresolved {
                path: path.to_string(),
            })
        }
    }
}

impl std::fmt::Debug for Registry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Registry")
            .field("roots", &self.roots.keys().collect::<Vec<_>>())
            .field("default_lookup", &self.default_lookup)
            .finish()
    }
}

struct NonCallable;

/// Walk one base. `Ok(None)` means the path simply is not here; `NonCallable`
/// means it is here but does not terminate in a callable.
fn walk(root: &Namespace, path: &str) -> Result<Option<NativeFn>, NonCallable> {
    let mut space = root.clone();
    let mut segments = path.split('.').peekable();

    while let Some(segment) = segments.next() {
        let terminal = segments.peek().is_none();
        match space.get(segment).cloned() {
            Some(Binding::Func(f)) if terminal => return Ok(Some(f)),
            Some(Binding::Func(_)) => return Ok(None),
            Some(Binding::Space(_)) if terminal => return Err(NonCallable),
            Some(Binding::Space(next)) => space = next,
            Some(Binding::Lazy(accessor)) => {
                // Lazy accessors stand in for namespaces that are expensive
                // to build; only lowercase names qualify.
                if !starts_lowercase(segment) {
                    return if terminal { Err(NonCallable) } else { Ok(None) };
                }
                let expanded = accessor();
                if terminal {
                    return Err(NonCallable);
                }
                space = expanded;
            }
            None => return Ok(None),
        }
    }

    Ok(None)
}

fn starts_lowercase(name: &str) -> bool {
    name.chars().next().is_some_and(|c| c.is_lowercase())
}

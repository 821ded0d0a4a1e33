//! Runtime values exchanged between the pipeline, its tasks and the workers.
//!
//! The interesting citizen here is [`ByteBuf`]: a shared handle to a byte
//! buffer whose *contents* can be moved across the controller/worker boundary.
//! Taking the contents leaves a zero-length sentinel behind in every other
//! holder of the handle, which is exactly how the scheduler and the pool
//! observe that a buffer is currently owned by a worker.

use std::collections::BTreeMap;
use std::sync::{Arc, Mutex};

/// A value that can travel through the pipeline: task arguments, receivers
/// and results are all `Value`s.
#[derive(Clone, Debug)]
pub enum Value {
    Null,
    Bool(bool),
    Int(i64),
    Float(f64),
    Text(String),
    List(Vec<Value>),
    Record(BTreeMap<String, Value>),
    /// A movable byte buffer.
    Buffer(ByteBuf),
    /// A fixed-width numeric view over a movable byte buffer.
    View(ArrayView),
    /// A one-shot completion callback injected into an async argument slot.
    Callback(Completion),
}

impl Value {
    pub fn as_bool(&self) -> Option<bool> {
        match self {
            Value::Bool(b) => Some(*b),
            _ => None,
        }
    }

    pub fn as_int(&self) -> Option<i64> {
        match self {
            Value::Int(n) => Some(*n),
            _ => None,
        }
    }

    pub fn as_float(&self) -> Option<f64> {
        match self {
            Value::Float(f) => Some(*f),
            _ => None,
        }
    }

    pub fn as_text(&self) -> Option<&str> {
        match self {
            Value::Text(s) => Some(s),
            _ => None,
        }
    }

    pub fn as_list(&self) -> Option<&[Value]> {
        match self {
            Value::List(items) => Some(items),
            _ => None,
        }
    }

    pub fn as_record(&self) -> Option<&BTreeMap<String, Value>> {
        match self {
            Value::Record(map) => Some(map),
            _ => None,
        }
    }

    pub fn as_buffer(&self) -> Option<&ByteBuf> {
        match self {
            Value::Buffer(buf) => Some(buf),
            _ => None,
        }
    }

    pub fn as_view(&self) -> Option<&ArrayView> {
        match self {
            Value::View(view) => Some(view),
            _ => None,
        }
    }

    pub fn as_callback(&self) -> Option<&Completion> {
        match self {
            Value::Callback(cb) => Some(cb),
            _ => None,
        }
    }

    /// Build a record value from key/value pairs.
    pub fn record<K, I>(entries: I) -> Value
    where
        K: Into<String>,
        I: IntoIterator<Item = (K, Value)>,
    {
        Value::Record(
            entries
                .into_iter()
                .map(|(k, v)| (k.into(), v))
                .collect(),
        )
    }

    /// Navigate a dot-separated member path through nested records.
    pub fn member(&self, path: &str) -> Option<Value> {
        let mut current = self;
        for segment in path.split('.') {
            match current {
                Value::Record(map) => current = map.get(segment)?,
                _ => return None,
            }
        }
        Some(current.clone())
    }
}

impl PartialEq for Value {
    fn eq(&self, other: &Self) -> bool {
        match (self, other) {
            (Value::Null, Value::Null) => true,
            (Value::Bool(a), Value::Bool(b)) => a == b,
            (Value::Int(a), Value::Int(b)) => a == b,
            (Value::Float(a), Value::Float(b)) => a == b,
            (Value::Text(a), Value::Text(b)) => a == b,
            (Value::List(a), Value::List(b)) => a == b,
            (Value::Record(a), Value::Record(b)) => a == b,
            (Value::Buffer(a), Value::Buffer(b)) => a == b,
            (Value::View(a), Value::View(b)) => a == b,
            (Value::Callback(a), Value::Callback(b)) => a == b,
            _ => false,
        }
    }
}

impl From<bool> for Value {
    fn from(v: bool) -> Self {
        Value::Bool(v)
    }
}

impl From<i64> for Value {
    fn from(v: i64) -> Self {
        Value::Int(v)
    }
}

impl From<f64> for Value {
    fn from(v: f64) -> Self {
        Value::Float(v)
    }
}

impl From<&str> for Value {
    fn from(v: &str) -> Self {
        Value::Text(v.to_string())
    }
}

impl From<String> for Value {
    fn from(v: String) -> Self {
        Value::Text(v)
    }
}

impl From<Vec<Value>> for Value {
    fn from(v: Vec<Value>) -> Self {
        Value::List(v)
    }
}

impl From<ByteBuf> for Value {
    fn from(v: ByteBuf) -> Self {
        Value::Buffer(v)
    }
}

impl From<ArrayView> for Value {
    fn from(v: ArrayView) -> Self {
        Value::View(v)
    }
}

/// A movable byte buffer.
///
/// The handle is cheaply cloneable and shared; the contents are not. Moving
/// the contents to a worker happens through [`ByteBuf::take`], which empties
/// the buffer in place. Until the worker posts the bytes back (and the pool
/// calls [`ByteBuf::restore`]), every holder of the handle observes length
/// zero. A buffer that was created empty is indistinguishable from a moved
/// one; the stall detector treats both as already moved.
#[derive(Clone, Default)]
pub struct ByteBuf {
    cell: Arc<Mutex<Vec<u8>>>,
}

impl ByteBuf {
    pub fn new(data: Vec<u8>) -> Self {
        Self {
            cell: Arc::new(Mutex::new(data)),
        }
    }

    pub fn len(&self) -> usize {
        self.cell.lock().unwrap().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Whether the contents are currently moved out (the zero-length
    /// sentinel).
    pub fn is_neutered(&self) -> bool {
        self.is_empty()
    }

    /// Move the contents out, leaving the zero-length sentinel behind.
    pub fn take(&self) -> Vec<u8> {
        std::mem::take(&mut *self.cell.lock().unwrap())
    }

    /// Put contents back into the handle.
    pub fn restore(&self, data: Vec<u8>) {
        *self.cell.lock().unwrap() = data;
    }

    /// Copy of the current contents.
    pub fn snapshot(&self) -> Vec<u8> {
        self.cell.lock().unwrap().clone()
    }

    /// Read access to the contents without copying.
    pub fn with<R>(&self, f: impl FnOnce(&[u8]) -> R) -> R {
        f(&self.cell.lock().unwrap())
    }

    /// Handle identity: two `ByteBuf`s are the same resource iff they share
    /// storage, regardless of contents.
    pub fn ptr_eq(&self, other: &ByteBuf) -> bool {
        Arc::ptr_eq(&self.cell, &other.cell)
    }
}

impl PartialEq for ByteBuf {
    fn eq(&self, other: &Self) -> bool {
        // Same handle first: locking the same mutex twice would deadlock.
        if self.ptr_eq(other) {
            return true;
        }
        *self.cell.lock().unwrap() == *other.cell.lock().unwrap()
    }
}

impl std::fmt::Debug for ByteBuf {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "ByteBuf(len={})", self.len())
    }
}

/// The element type of an [`ArrayView`].
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ViewKind {
    U8,
    I8,
    U16,
    I16,
    U32,
    I32,
    F32,
    F64,
}

impl ViewKind {
    pub fn element_size(self) -> usize {
        match self {
            ViewKind::U8 | ViewKind::I8 => 1,
            ViewKind::U16 | ViewKind::I16 => 2,
            ViewKind::U32 | ViewKind::I32 | ViewKind::F32 => 4,
            ViewKind::F64 => 8,
        }
    }

    pub fn name(self) -> &'static str {
        match self {
            ViewKind::U8 => "u8",
            ViewKind::I8 => "i8",
            ViewKind::U16 => "u16",
            ViewKind::I16 => "i16",
            ViewKind::U32 => "u32",
            ViewKind::I32 => "i32",
            ViewKind::F32 => "f32",
            ViewKind::F64 => "f64",
        }
    }

    pub fn from_name(name: &str) -> Option<Self> {
        Some(match name {
            "u8" => ViewKind::U8,
            "i8" => ViewKind::I8,
            "u16" => ViewKind::U16,
            "i16" => ViewKind::I16,
            "u32" => ViewKind::U32,
            "i32" => ViewKind::I32,
            "f32" => ViewKind::F32,
            "f64" => ViewKind::F64,
            _ => return None,
        })
    }
}

/// A typed, fixed-width numeric view over a movable byte buffer.
#[derive(Clone, Debug)]
pub struct ArrayView {
    pub kind: ViewKind,
    pub buffer: ByteBuf,
}

impl ArrayView {
    pub fn new(kind: ViewKind, buffer: ByteBuf) -> Self {
        Self { kind, buffer }
    }

    /// Number of whole elements currently in the underlying buffer.
    pub fn element_count(&self) -> usize {
        self.buffer.len() / self.kind.element_size()
    }
}

impl PartialEq for ArrayView {
    fn eq(&self, other: &Self) -> bool {
        self.kind == other.kind && self.buffer == other.buffer
    }
}

type CompletionFn = Box<dyn FnOnce(Value) + Send>;

/// A one-shot completion callback.
///
/// The pipeline injects one of these into the argument slot marked with the
/// async placeholder; the callable is expected to fire it exactly once. Firing
/// it a second time is inert.
#[derive(Clone)]
pub struct Completion {
    inner: Arc<Mutex<Option<CompletionFn>>>,
}

impl Completion {
    pub fn new(f: impl FnOnce(Value) + Send + 'static) -> Self {
        Self {
            inner: Arc::new(Mutex::new(Some(Box::new(f)))),
        }
    }

    /// Deliver the result. Returns whether this call actually fired the
    /// callback (false if it had fired before).
    pub fn resolve(&self, value: Value) -> bool {
        let callback = self.inner.lock().unwrap().take();
        match callback {
            Some(f) => {
                f(value);
                true
            }
            None => false,
        }
    }

    /// Whether the callback has already fired.
    pub fn is_resolved(&self) -> bool {
        self.inner.lock().unwrap().is_none()
    }
}

impl PartialEq for Completion {
    fn eq(&self, other: &Self) -> bool {
        Arc::ptr_eq(&self.inner, &other.inner)
    }
}

impl std::fmt::Debug for Completion {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "Completion({})",
            if self.is_resolved() { "resolved" } else { "pending" }
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn take_leaves_neutered_sentinel() {
        let buf = ByteBuf::new(vec![1, 2, 3]);
        let alias = buf.clone();

        let bytes = buf.take();
        assert_eq!(bytes, vec![1, 2, 3]);
        assert!(buf.is_neutered());
        assert!(alias.is_neutered(), "every holder observes the move");

        alias.restore(bytes);
        assert_eq!(buf.snapshot(), vec![1, 2, 3]);
    }

    #[test]
    fn handle_identity_vs_contents() {
        let a = ByteBuf::new(vec![7]);
        let b = ByteBuf::new(vec![7]);
        assert_eq!(a, b);
        assert!(!a.ptr_eq(&b));
        assert!(a.ptr_eq(&a.clone()));
        // Comparing a handle against its own clone must not deadlock.
        assert_eq!(a, a.clone());
    }

    #[test]
    fn member_path_navigates_records() {
        let value = Value::record([
            ("stats", Value::record([("mean", Value::Float(0.5))])),
            ("count", Value::Int(3)),
        ]);
        assert_eq!(value.member("count"), Some(Value::Int(3)));
        assert_eq!(value.member("stats.mean"), Some(Value::Float(0.5)));
        assert_eq!(value.member("stats.median"), None);
        assert_eq!(value.member("count.inner"), None);
    }

    #[test]
    fn completion_fires_once() {
        let (tx, rx) = crossbeam_channel::unbounded();
        let completion = Completion::new(move |v| tx.send(v).unwrap());

        assert!(completion.resolve(Value::Int(1)));
        assert!(!completion.resolve(Value::Int(2)));
        assert!(completion.is_resolved());

        assert_eq!(rx.try_recv().unwrap(), Value::Int(1));
        assert!(rx.try_recv().is_err());
    }

    #[test]
    fn view_element_count_follows_buffer() {
        let buf = ByteBuf::new(vec![0; 12]);
        let view = ArrayView::new(ViewKind::F32, buf.clone());
        assert_eq!(view.element_count(), 3);

        buf.take();
        assert_eq!(view.element_count(), 0);
    }
}

//! Events, event values and the per-computer event queue.

use std::any::Any;
use std::collections::VecDeque;
use std::fmt;
use std::sync::Arc;

/// Event name that bypasses every filter.
pub const TERMINATE: &str = "terminate";

/// An opaque object handed to a machine, such as a websocket handle.
#[derive(Clone)]
pub struct HostObject(Arc<dyn Any + Send + Sync>);

impl HostObject {
    /// Wrap a host value.
    pub fn new<T: Any + Send + Sync>(value: T) -> Self {
        Self(Arc::new(value))
    }

    /// Borrow the object as `T`, if it is one.
    pub fn downcast_ref<T: Any>(&self) -> Option<&T> {
        self.0.downcast_ref::<T>()
    }

    /// Whether two handles refer to the same object.
    pub fn ptr_eq(&self, other: &HostObject) -> bool {
        Arc::ptr_eq(&self.0, &other.0)
    }
}

impl fmt::Debug for HostObject {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("HostObject(..)")
    }
}

impl PartialEq for HostObject {
    fn eq(&self, other: &Self) -> bool {
        self.ptr_eq(other)
    }
}

/// A value passed between the host and a machine.
#[derive(Debug, Clone, PartialEq, Default)]
pub enum Value {
    #[default]
    Nil,
    Bool(bool),
    Number(f64),
    String(String),
    /// A byte string which is not necessarily UTF-8.
    Bytes(Vec<u8>),
    /// Ordered key/value pairs.
    Table(Vec<(Value, Value)>),
    Object(HostObject),
}

impl Value {
    /// Build a table from string keys.
    pub fn table<I, K>(entries: I) -> Self
    where
        I: IntoIterator<Item = (K, Value)>,
        K: Into<String>,
    {
        Value::Table(
            entries
                .into_iter()
                .map(|(k, v)| (Value::String(k.into()), v))
                .collect(),
        )
    }

    /// Look up a string key in a table.
    pub fn get(&self, key: &str) -> Option<&Value> {
        match self {
            Value::Table(entries) => entries
                .iter()
                .find(|(k, _)| matches!(k, Value::String(s) if s == key))
                .map(|(_, v)| v),
            _ => None,
        }
    }

    /// The value as a string slice, if it is one.
    pub fn as_str(&self) -> Option<&str> {
        match self {
            Value::String(s) => Some(s),
            _ => None,
        }
    }

    /// The value as a number, if it is one.
    pub fn as_number(&self) -> Option<f64> {
        match self {
            Value::Number(n) => Some(*n),
            _ => None,
        }
    }

    /// Lua-style truthiness.
    pub fn is_truthy(&self) -> bool {
        !matches!(self, Value::Nil | Value::Bool(false))
    }
}

impl From<bool> for Value {
    fn from(value: bool) -> Self {
        Value::Bool(value)
    }
}

impl From<f64> for Value {
    fn from(value: f64) -> Self {
        Value::Number(value)
    }
}

impl From<i64> for Value {
    fn from(value: i64) -> Self {
        Value::Number(value as f64)
    }
}

impl From<u32> for Value {
    fn from(value: u32) -> Self {
        Value::Number(value.into())
    }
}

impl From<u16> for Value {
    fn from(value: u16) -> Self {
        Value::Number(value.into())
    }
}

impl From<&str> for Value {
    fn from(value: &str) -> Self {
        Value::String(value.to_string())
    }
}

impl From<String> for Value {
    fn from(value: String) -> Self {
        Value::String(value)
    }
}

impl From<Vec<u8>> for Value {
    fn from(value: Vec<u8>) -> Self {
        Value::Bytes(value)
    }
}

impl From<HostObject> for Value {
    fn from(value: HostObject) -> Self {
        Value::Object(value)
    }
}

/// A named event with arguments.
#[derive(Debug, Clone, PartialEq)]
pub struct Event {
    pub name: String,
    pub args: Vec<Value>,
}

impl Event {
    pub fn new(name: impl Into<String>, args: Vec<Value>) -> Self {
        Self {
            name: name.into(),
            args,
        }
    }

    /// Whether a machine waiting with `filter` accepts this event.
    pub fn matches(&self, filter: Option<&str>) -> bool {
        match filter {
            None => true,
            Some(filter) => self.name == filter || self.name == TERMINATE,
        }
    }
}

/// What a suspended machine is waiting for.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Continuation {
    /// Event name to wait for, `None` for any event.
    pub filter: Option<String>,
}

impl Continuation {
    pub fn new(filter: Option<String>) -> Self {
        Self { filter }
    }

    pub fn accepts(&self, event: &Event) -> bool {
        event.matches(self.filter.as_deref())
    }
}

/// Bounded FIFO of pending events.
#[derive(Debug)]
pub struct EventQueue {
    events: VecDeque<Event>,
    limit: usize,
}

impl EventQueue {
    /// Create a queue holding at most `limit` events.
    pub fn new(limit: usize) -> Self {
        Self {
            events: VecDeque::with_capacity(4),
            limit,
        }
    }

    /// Append an event, returning `false` if the queue is full.
    pub fn push(&mut self, event: Event) -> bool {
        if self.events.len() >= self.limit {
            return false;
        }
        self.events.push_back(event);
        true
    }

    /// Remove the first event accepted by `filter`.
    ///
    /// With a filter this is the first event with that name or the first
    /// `terminate`, whichever arrived first. Other events keep their order.
    pub fn pull(&mut self, filter: Option<&str>) -> Option<Event> {
        let index = self.events.iter().position(|e| e.matches(filter))?;
        self.events.remove(index)
    }

    /// Whether [`EventQueue::pull`] with `filter` would return an event.
    pub fn has_match(&self, filter: Option<&str>) -> bool {
        self.events.iter().any(|e| e.matches(filter))
    }

    pub fn len(&self) -> usize {
        self.events.len()
    }

    pub fn is_empty(&self) -> bool {
        self.events.is_empty()
    }

    /// Drop every queued event, returning how many were discarded.
    pub fn drain_discard(&mut self) -> usize {
        let count = self.events.len();
        self.events.clear();
        count
    }
}

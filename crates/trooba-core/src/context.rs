//! Chain-scoped state: the request [`Context`] and the [`Store`].
//!
//! Both are created once per [`Pipeline::create`](crate::Pipeline::create) and
//! shared by reference with every stage of that chain. Two chains never share
//! either of them.

use std::any::Any;
use std::collections::{HashMap, HashSet};
use std::fmt;
use std::sync::Arc;

use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use crate::error::PipeError;

/// What happens to a non-error message that runs off the end of the chain.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum UnmatchedPolicy {
    /// Silently drop it, unless its kind is validated.
    #[default]
    Drop,
    /// Drop it with a warning, unless its kind is validated.
    Warn,
    /// Treat every kind as validated and report the miss as an error.
    Reject,
}

/// Hook invoked for an error that no stage consumed.
pub type FaultHook = Arc<dyn Fn(&PipeError) + Send + Sync>;

/// How an `error` message with no consumer surfaces.
#[derive(Clone, Default)]
pub enum FaultPolicy {
    /// Abort the process.
    #[default]
    Abort,
    /// Panic on the task that exhausted the chain.
    ///
    /// A stage consumer catches the panic, logs it and keeps draining its
    /// queue, so the panic only unwinds tasks outside the chain.
    Panic,
    /// Hand the error to a host-provided hook.
    Hook(FaultHook),
}

impl FaultPolicy {
    /// Creates a hook policy.
    pub fn hook<F>(f: F) -> Self
    where
        F: Fn(&PipeError) + Send + Sync + 'static,
    {
        Self::Hook(Arc::new(f))
    }

    pub(crate) fn raise(&self, err: &PipeError) {
        match self {
            Self::Panic => panic!("unhandled pipeline error: {err}"),
            Self::Abort => std::process::abort(),
            Self::Hook(hook) => hook(err),
        }
    }
}

impl fmt::Debug for FaultPolicy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Panic => f.write_str("Panic"),
            Self::Abort => f.write_str("Abort"),
            Self::Hook(_) => f.write_str("Hook(..)"),
        }
    }
}

// =============================================================================
// Context
// =============================================================================

/// The request context of one chain.
///
/// Carries the routing policies consulted at the chain boundary plus
/// free-form JSON attributes that stages may read and write.
///
/// # Example
///
/// ```rust,ignore
/// let ctx = Context::new()
///     .validate("request")
///     .attribute("tenant", "acme");
/// let pipe = pipeline.create_with(ctx);
/// ```
#[derive(Default)]
pub struct Context {
    validate: HashSet<String>,
    unmatched: UnmatchedPolicy,
    fault: FaultPolicy,
    attributes: RwLock<Map<String, Value>>,
}

impl Context {
    /// Creates an empty context with default policies.
    pub fn new() -> Self {
        Self::default()
    }

    /// Marks a message kind as required: if nothing consumes it, the miss is
    /// reported back as an error.
    pub fn validate(mut self, kind: impl Into<String>) -> Self {
        self.validate.insert(kind.into());
        self
    }

    /// Sets the policy for unmatched, non-validated messages.
    pub fn unmatched(mut self, policy: UnmatchedPolicy) -> Self {
        self.unmatched = policy;
        self
    }

    /// Sets the fault policy for unconsumed errors.
    pub fn fault(mut self, policy: FaultPolicy) -> Self {
        self.fault = policy;
        self
    }

    /// Sets an attribute.
    pub fn attribute(self, key: impl Into<String>, value: impl Into<Value>) -> Self {
        self.attributes.write().insert(key.into(), value.into());
        self
    }

    /// Whether a missing consumer for `kind` must be reported.
    pub fn requires(&self, kind: &str) -> bool {
        self.unmatched == UnmatchedPolicy::Reject || self.validate.contains(kind)
    }

    /// The unmatched-message policy.
    pub fn unmatched_policy(&self) -> UnmatchedPolicy {
        self.unmatched
    }

    /// The fault policy.
    pub fn fault_policy(&self) -> &FaultPolicy {
        &self.fault
    }

    /// Reads an attribute.
    pub fn get(&self, key: &str) -> Option<Value> {
        self.attributes.read().get(key).cloned()
    }

    /// Writes an attribute, returning the previous value.
    pub fn set(&self, key: impl Into<String>, value: impl Into<Value>) -> Option<Value> {
        self.attributes.write().insert(key.into(), value.into())
    }
}

impl Clone for Context {
    fn clone(&self) -> Self {
        Self {
            validate: self.validate.clone(),
            unmatched: self.unmatched,
            fault: self.fault.clone(),
            attributes: RwLock::new(self.attributes.read().clone()),
        }
    }
}

impl fmt::Debug for Context {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Context")
            .field("validate", &self.validate)
            .field("unmatched", &self.unmatched)
            .field("fault", &self.fault)
            .field("attributes", &self.attributes.read().len())
            .finish()
    }
}

// =============================================================================
// Store
// =============================================================================

/// Typed key/value state shared by all stages of one chain.
///
/// Cloning a `Store` clones the handle, not the contents.
#[derive(Clone, Default)]
pub struct Store {
    entries: Arc<RwLock<HashMap<String, Arc<dyn Any + Send + Sync>>>>,
}

impl Store {
    /// Creates an empty store.
    pub fn new() -> Self {
        Self::default()
    }

    /// Inserts a value under `key`, replacing any previous one.
    pub fn insert<T: Any + Send + Sync>(&self, key: impl Into<String>, value: T) {
        self.entries.write().insert(key.into(), Arc::new(value));
    }

    /// Returns the value under `key` if it has type `T`.
    pub fn get<T: Any + Send + Sync>(&self, key: &str) -> Option<Arc<T>> {
        let value = self.entries.read().get(key).cloned()?;
        value.downcast::<T>().ok()
    }

    /// Removes the value under `key`.
    pub fn remove(&self, key: &str) -> bool {
        self.entries.write().remove(key).is_some()
    }

    /// Whether a value exists under `key`.
    pub fn contains(&self, key: &str) -> bool {
        self.entries.read().contains_key(key)
    }

    /// Number of entries.
    pub fn len(&self) -> usize {
        self.entries.read().len()
    }

    /// Whether the store is empty.
    pub fn is_empty(&self) -> bool {
        self.entries.read().is_empty()
    }

    /// Whether two handles point at the same store.
    pub fn ptr_eq(&self, other: &Store) -> bool {
        Arc::ptr_eq(&self.entries, &other.entries)
    }
}

impl fmt::Debug for Store {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Store").field("len", &self.len()).finish()
    }
}

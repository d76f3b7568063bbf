//! Stage capability registry.
//!
//! A capability is a named, typed operation installed on a stage with
//! [`Stage::decorate`](crate::Stage::decorate). Every stage created later in
//! the same chain starts with a copy of its predecessor's set, so helpers such
//! as `request`/`respond` become available downstream without touching the
//! core:
//!
//! ```rust,ignore
//! stage.decorate("ping", capability(|stage, payload| {
//!     stage.send(Message::new("ping", payload, Direction::Forward));
//!     Ok(Payload::Empty)
//! }))?;
//!
//! // any later stage
//! later.invoke("ping", Payload::Empty)?;
//! ```

use std::borrow::Cow;
use std::fmt;
use std::sync::Arc;

use crate::error::{PipeError, PipeResult};
use crate::message::Payload;
use crate::stage::Stage;

/// A capability function.
pub type Capability = Arc<dyn Fn(&Stage, Payload) -> PipeResult<Payload> + Send + Sync>;

/// Wraps a closure into a [`Capability`].
pub fn capability<F>(f: F) -> Capability
where
    F: Fn(&Stage, Payload) -> PipeResult<Payload> + Send + Sync + 'static,
{
    Arc::new(f)
}

/// Ordered set of named capabilities.
#[derive(Clone, Default)]
pub struct CapabilitySet {
    entries: Vec<(Cow<'static, str>, Capability)>,
}

impl CapabilitySet {
    /// Creates an empty set.
    pub fn new() -> Self {
        Self::default()
    }

    /// Adds a capability, failing if the name is taken.
    pub fn insert(&mut self, name: impl Into<Cow<'static, str>>, cap: Capability) -> PipeResult<()> {
        let name = name.into();
        if self.contains(&name) {
            return Err(PipeError::CapabilityExists(name.into_owned()));
        }
        self.entries.push((name, cap));
        Ok(())
    }

    /// Looks up a capability by name.
    pub fn get(&self, name: &str) -> Option<Capability> {
        self.entries
            .iter()
            .find(|(n, _)| n == name)
            .map(|(_, cap)| Arc::clone(cap))
    }

    /// Whether a capability with this name exists.
    pub fn contains(&self, name: &str) -> bool {
        self.entries.iter().any(|(n, _)| n == name)
    }

    /// Capability names in installation order.
    pub fn names(&self) -> Vec<&str> {
        self.entries.iter().map(|(n, _)| n.as_ref()).collect()
    }

    /// Number of capabilities.
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    /// Whether the set is empty.
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

impl fmt::Debug for CapabilitySet {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_list().entries(self.names()).finish()
    }
}

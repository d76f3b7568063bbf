//! Messages and the position-addressed routing protocol.
//!
//! A [`Message`] is a typed, directional envelope. It remembers the chain it
//! was created in and its current position, and [`Message::advance`] moves it
//! one hop in its direction:
//!
//! ```text
//!   head(0) ──request──▶ 1 ──▶ 2 ──▶ 3
//!   head(0) ◀──response── 1 ◀── 2 ◀── 3
//! ```
//!
//! When no stage exists at the next position the chain is exhausted and the
//! actuator applies the boundary policy (see [`Actuator`]).

use std::any::Any;
use std::borrow::Cow;
use std::fmt;
use std::sync::{Arc, Weak};

use serde_json::Value;
use tracing::trace;

use crate::actuator::Actuator;
use crate::error::PipeError;
use crate::trace::TraceFn;

/// Well-known message kinds.
pub mod kinds {
    /// Forward request.
    pub const REQUEST: &str = "request";
    /// Backward response.
    pub const RESPONSE: &str = "response";
    /// Backward error.
    pub const ERROR: &str = "error";
    /// Introspection round trip.
    pub const TRACE: &str = "trace";
    /// Handler key matching every kind without its own handler.
    pub const WILDCARD: &str = "*";
}

/// Direction a message travels along the chain.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Direction {
    /// Towards higher positions (requests).
    Forward,
    /// Towards lower positions (responses, errors).
    Backward,
}

impl Direction {
    /// Returns the opposite direction.
    pub fn reverse(self) -> Self {
        match self {
            Self::Forward => Self::Backward,
            Self::Backward => Self::Forward,
        }
    }

    /// Computes the neighbour position, `None` when stepping before the head.
    pub fn step(self, position: usize) -> Option<usize> {
        match self {
            Self::Forward => position.checked_add(1),
            Self::Backward => position.checked_sub(1),
        }
    }
}

impl fmt::Display for Direction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Forward => f.write_str("forward"),
            Self::Backward => f.write_str("backward"),
        }
    }
}

// =============================================================================
// Payload
// =============================================================================

/// Data carried by a message.
///
/// The engine never interprets payloads. It only renders them when reporting
/// a message that found no consumer.
#[derive(Clone, Default)]
pub enum Payload {
    /// No data.
    #[default]
    Empty,
    /// A JSON value.
    Json(Value),
    /// An error travelling backward.
    Error(PipeError),
    /// Any shared value, recovered with [`Payload::downcast_ref`].
    Shared(Arc<dyn Any + Send + Sync>),
    /// Collector invoked by every stage a `trace` message visits.
    Trace(TraceFn),
}

impl Payload {
    /// Wraps an arbitrary value.
    pub fn shared<T: Any + Send + Sync>(value: T) -> Self {
        Self::Shared(Arc::new(value))
    }

    /// Wraps an error.
    pub fn error(err: impl Into<PipeError>) -> Self {
        Self::Error(err.into())
    }

    /// Returns `true` for [`Payload::Empty`].
    pub fn is_empty(&self) -> bool {
        matches!(self, Self::Empty)
    }

    /// Returns the JSON value, if any.
    pub fn as_json(&self) -> Option<&Value> {
        match self {
            Self::Json(v) => Some(v),
            _ => None,
        }
    }

    /// Returns the error, if any.
    pub fn as_error(&self) -> Option<&PipeError> {
        match self {
            Self::Error(e) => Some(e),
            _ => None,
        }
    }

    /// Downcasts a shared value.
    pub fn downcast_ref<T: Any>(&self) -> Option<&T> {
        match self {
            Self::Shared(v) => v.downcast_ref::<T>(),
            _ => None,
        }
    }

    /// JSON rendering used in diagnostics.
    pub fn render(&self) -> String {
        match self {
            Self::Empty => "null".to_string(),
            Self::Json(v) => v.to_string(),
            Self::Error(e) => Value::String(e.to_string()).to_string(),
            Self::Shared(_) => "\"<shared>\"".to_string(),
            Self::Trace(_) => "\"<trace>\"".to_string(),
        }
    }
}

impl fmt::Debug for Payload {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Empty => f.write_str("Empty"),
            Self::Json(v) => f.debug_tuple("Json").field(v).finish(),
            Self::Error(e) => f.debug_tuple("Error").field(e).finish(),
            Self::Shared(_) => f.write_str("Shared(..)"),
            Self::Trace(_) => f.write_str("Trace(..)"),
        }
    }
}

impl From<Value> for Payload {
    fn from(value: Value) -> Self {
        Self::Json(value)
    }
}

impl From<PipeError> for Payload {
    fn from(err: PipeError) -> Self {
        Self::Error(err)
    }
}

impl From<&str> for Payload {
    fn from(s: &str) -> Self {
        Self::Json(Value::String(s.to_string()))
    }
}

impl From<String> for Payload {
    fn from(s: String) -> Self {
        Self::Json(Value::String(s))
    }
}

// =============================================================================
// Message
// =============================================================================

/// A typed, directional unit of data traversing the chain.
pub struct Message {
    kind: Cow<'static, str>,
    payload: Payload,
    direction: Direction,
    one_way: bool,
    pub(crate) origin: Weak<Actuator>,
    pub(crate) position: Option<usize>,
}

impl Message {
    /// Creates a message that is not yet bound to a chain.
    ///
    /// Binding happens when a stage sends it.
    pub fn new(
        kind: impl Into<Cow<'static, str>>,
        payload: impl Into<Payload>,
        direction: Direction,
    ) -> Self {
        Self {
            kind: kind.into(),
            payload: payload.into(),
            direction,
            one_way: false,
            origin: Weak::new(),
            position: None,
        }
    }

    /// A forward `request`.
    pub fn request(payload: impl Into<Payload>) -> Self {
        Self::new(kinds::REQUEST, payload, Direction::Forward)
    }

    /// A backward `response`.
    pub fn response(payload: impl Into<Payload>) -> Self {
        Self::new(kinds::RESPONSE, payload, Direction::Backward)
    }

    /// A backward `error`.
    pub fn error(err: impl Into<PipeError>) -> Self {
        Self::new(kinds::ERROR, Payload::Error(err.into()), Direction::Backward)
    }

    /// Marks the message one-way: its delivery never stalls a stage.
    pub fn one_way(mut self, one_way: bool) -> Self {
        self.one_way = one_way;
        self
    }

    /// The message kind.
    pub fn kind(&self) -> &str {
        &self.kind
    }

    /// The payload.
    pub fn payload(&self) -> &Payload {
        &self.payload
    }

    /// Replaces the payload, returning the previous one.
    pub fn replace_payload(&mut self, payload: Payload) -> Payload {
        std::mem::replace(&mut self.payload, payload)
    }

    /// The current direction.
    pub fn direction(&self) -> Direction {
        self.direction
    }

    /// Whether the message is one-way.
    pub fn is_one_way(&self) -> bool {
        self.one_way
    }

    /// The current position, once bound.
    pub fn position(&self) -> Option<usize> {
        self.position
    }

    pub(crate) fn reverse(&mut self) {
        self.direction = self.direction.reverse();
    }

    pub(crate) fn bind(&mut self, origin: Weak<Actuator>, position: usize) {
        self.origin = origin;
        self.position = Some(position);
    }

    /// Moves the message one hop in its direction.
    ///
    /// Enqueues it at the next stage, or applies the boundary policy when the
    /// chain is exhausted. Messages whose chain was dropped are discarded.
    pub fn advance(self) {
        let Some(actuator) = self.origin.upgrade() else {
            trace!(kind = %self.kind, "Chain dropped, discarding message");
            return;
        };
        let Some(from) = self.position else {
            trace!(kind = %self.kind, "Unbound message, discarding");
            return;
        };

        let target = self
            .direction
            .step(from)
            .and_then(|position| actuator.resolve(position));

        match target {
            Some(stage) => {
                trace!(
                    kind = %self.kind,
                    direction = %self.direction,
                    from,
                    to = stage.position(),
                    "Advancing message"
                );
                stage.add(self);
            }
            None => actuator.exhausted(self, from),
        }
    }
}

impl fmt::Debug for Message {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Message")
            .field("kind", &self.kind)
            .field("payload", &self.payload)
            .field("direction", &self.direction)
            .field("one_way", &self.one_way)
            .field("position", &self.position)
            .finish()
    }
}

//! Error types for the Trooba core engine.
//!
//! Construction-time failures (duplicate handlers, API names, capability
//! collisions) are returned synchronously. Runtime failures travel through the
//! chain as ordinary backward `error` messages carrying a [`PipeError`].

use std::borrow::Cow;
use std::time::Duration;

use thiserror::Error;

/// Errors raised by the pipeline engine.
#[derive(Debug, Clone, Error)]
pub enum PipeError {
    /// A handler is already registered for this message kind on the stage.
    #[error("handler for message '{kind}' is already registered at position {position}")]
    DuplicateHandler {
        /// The duplicated message kind.
        kind: String,
        /// Position of the stage.
        position: usize,
    },

    /// An API factory with this name was already registered on the builder.
    #[error("API '{0}' is already registered")]
    DuplicateApi(String),

    /// The requested API name is unknown.
    #[error("API not found: {0}")]
    ApiNotFound(String),

    /// The API factory produced a value of a different type than requested.
    #[error("API '{name}' is not of type {expected}")]
    ApiTypeMismatch {
        /// The API name.
        name: String,
        /// The requested type name.
        expected: &'static str,
    },

    /// A capability with this name already exists on the stage.
    #[error("capability '{0}' already exists")]
    CapabilityExists(String),

    /// No capability with this name is installed on the stage.
    #[error("capability '{0}' not found")]
    CapabilityNotFound(String),

    /// A validated message reached the end of the chain without a consumer.
    #[error("No target consumer found for message {kind}:{payload}")]
    NoTargetConsumer {
        /// The message kind.
        kind: String,
        /// JSON rendering of the payload.
        payload: String,
    },

    /// Error raised by a handler.
    #[error("{0}")]
    Handler(Cow<'static, str>),

    /// Stage configuration could not be deserialized.
    #[error("invalid stage configuration: {0}")]
    Config(String),

    /// The chain owning this stage has been dropped.
    #[error("pipeline chain is closed")]
    ChainClosed,

    /// No reply arrived within the caller's deadline.
    #[error("no reply within {0:?}")]
    Timeout(Duration),
}

impl PipeError {
    /// Creates a handler error.
    pub fn handler(msg: impl Into<Cow<'static, str>>) -> Self {
        Self::Handler(msg.into())
    }
}

impl From<serde_json::Error> for PipeError {
    fn from(err: serde_json::Error) -> Self {
        Self::Config(err.to_string())
    }
}

/// Result type for pipeline operations.
pub type PipeResult<T> = Result<T, PipeError>;

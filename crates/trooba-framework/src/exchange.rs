//! Request/response exchange helpers.
//!
//! The [`Exchange`] plugin installs a small set of capabilities on the head of
//! every chain it is part of. Since capabilities are inherited forward, every
//! stage of the chain can then start a request, answer one, or stream data
//! chunks in either direction through [`ExchangeExt`].
//!
//! ```rust,ignore
//! let pipeline = Trooba::new()
//!     .use_plugin(Exchange, Value::Null)?
//!     .use_fn(|stage, _| {
//!         stage.on(kinds::REQUEST, |stage, payload, _| {
//!             let _ = stage.respond(payload);
//!         })?;
//!         Ok(Attach::Stage)
//!     })
//!     .build();
//! ```

use std::sync::Arc;

use tracing::trace;
use trooba_core::{
    Attach, Decorator, Direction, Message, Payload, PipeResult, Plugin, Stage, StageConfig,
    Trooba, capability,
};

/// Capability names installed by [`Exchange`].
pub mod caps {
    /// Sends a `request` forward.
    pub const REQUEST: &str = "request";
    /// Sends a `response` backward.
    pub const RESPOND: &str = "respond";
    /// Streams a request chunk forward.
    pub const WRITE_REQUEST: &str = "write_request";
    /// Streams a response chunk backward.
    pub const WRITE_RESPONSE: &str = "write_response";
}

/// Message kind of a request stream chunk.
pub const REQUEST_DATA: &str = "request:data";
/// Message kind of a response stream chunk.
pub const RESPONSE_DATA: &str = "response:data";

/// Plugin installing the exchange capabilities on the head.
///
/// Contributes no stage of its own.
#[derive(Debug, Clone, Copy, Default)]
pub struct Exchange;

impl Plugin for Exchange {
    fn name(&self) -> &str {
        "exchange"
    }

    fn attach(&self, _stage: &Stage, _config: &StageConfig) -> PipeResult<Attach> {
        Ok(Attach::Inline(Trooba::new().build()))
    }

    fn decorator(&self) -> Option<Decorator> {
        Some(Arc::new(install))
    }
}

/// Installs the exchange capabilities on `stage`.
pub fn install(stage: &Stage) -> PipeResult<()> {
    stage.decorate(
        caps::REQUEST,
        capability(|stage, payload| {
            stage.send(Message::request(payload));
            Ok(Payload::Empty)
        }),
    )?;
    stage.decorate(
        caps::RESPOND,
        capability(|stage, payload| {
            stage.send(Message::response(payload));
            Ok(Payload::Empty)
        }),
    )?;
    stage.decorate(
        caps::WRITE_REQUEST,
        capability(|stage, payload| {
            write_chunk(stage, REQUEST_DATA, payload, Direction::Forward);
            Ok(Payload::Empty)
        }),
    )?;
    stage.decorate(
        caps::WRITE_RESPONSE,
        capability(|stage, payload| {
            write_chunk(stage, RESPONSE_DATA, payload, Direction::Backward);
            Ok(Payload::Empty)
        }),
    )?;
    trace!(position = stage.position(), "Exchange capabilities installed");
    Ok(())
}

fn write_chunk(stage: &Stage, kind: &'static str, payload: Payload, direction: Direction) {
    if payload.is_empty() {
        trace!(kind, position = stage.position(), "Stream end");
    }
    stage.send(Message::new(kind, payload, direction));
}

/// Typed access to the exchange capabilities.
///
/// Every method fails with `CapabilityNotFound` when the chain was built
/// without [`Exchange`].
pub trait ExchangeExt {
    /// Sends a request forward from this stage.
    fn request(&self, payload: impl Into<Payload>) -> PipeResult<()>;

    /// Sends a response backward from this stage.
    fn respond(&self, payload: impl Into<Payload>) -> PipeResult<()>;

    /// Streams a request chunk forward. An empty payload ends the stream.
    fn write_request(&self, chunk: impl Into<Payload>) -> PipeResult<()>;

    /// Streams a response chunk backward. An empty payload ends the stream.
    fn write_response(&self, chunk: impl Into<Payload>) -> PipeResult<()>;
}

impl ExchangeExt for Stage {
    fn request(&self, payload: impl Into<Payload>) -> PipeResult<()> {
        self.invoke(caps::REQUEST, payload).map(drop)
    }

    fn respond(&self, payload: impl Into<Payload>) -> PipeResult<()> {
        self.invoke(caps::RESPOND, payload).map(drop)
    }

    fn write_request(&self, chunk: impl Into<Payload>) -> PipeResult<()> {
        self.invoke(caps::WRITE_REQUEST, chunk).map(drop)
    }

    fn write_response(&self, chunk: impl Into<Payload>) -> PipeResult<()> {
        self.invoke(caps::WRITE_RESPONSE, chunk).map(drop)
    }
}


//! Async/await adapter.
//!
//! [`Awaitable`] decorates the head of every chain with a `call` capability and
//! claims the head's `response` and `error` handlers. [`CallExt::call`] then
//! sends a request and resolves with whatever reaches the head first:
//!
//! ```rust,ignore
//! let pipeline = Trooba::new()
//!     .use_plugin(Awaitable, Value::Null)?
//!     .use_fn(echo)
//!     .build();
//!
//! let pipe = pipeline.create()?;
//! let reply = pipe.call("ping").await?;
//! ```
//!
//! One call may be in flight per chain; sequential calls reuse it.

use std::sync::Arc;

use futures::FutureExt;
use futures::future::BoxFuture;
use parking_lot::Mutex;
use tokio::sync::oneshot;
use tracing::{debug, trace};
use trooba_core::{
    Attach, Decorator, Message, Payload, PipeError, PipeResult, Plugin, Stage, StageConfig, Trooba,
    capability, kinds,
};

/// Name of the capability arming a call.
pub const CALL: &str = "call";

const REPLY_SLOT: &str = "trooba.awaitable.reply";

type Reply = oneshot::Sender<PipeResult<Payload>>;

#[derive(Default)]
struct ReplySlot(Mutex<Option<Reply>>);

/// Argument of the `call` capability: the request and where to deliver its
/// outcome.
pub struct PendingCall {
    request: Payload,
    reply: Mutex<Option<Reply>>,
}

impl PendingCall {
    fn new(request: Payload, reply: Reply) -> Self {
        Self {
            request,
            reply: Mutex::new(Some(reply)),
        }
    }
}

/// Plugin installing the await adapter on the head.
///
/// Contributes no stage of its own.
#[derive(Debug, Clone, Copy, Default)]
pub struct Awaitable;

impl Plugin for Awaitable {
    fn name(&self) -> &str {
        "awaitable"
    }

    fn attach(&self, _stage: &Stage, _config: &StageConfig) -> PipeResult<Attach> {
        Ok(Attach::Inline(Trooba::new().build()))
    }

    fn decorator(&self) -> Option<Decorator> {
        Some(Arc::new(install))
    }
}

/// Installs the await adapter on the head stage.
pub fn install(head: &Stage) -> PipeResult<()> {
    head.store().insert(REPLY_SLOT, ReplySlot::default());
    head.decorate(CALL, capability(arm))?;

    head.on(kinds::RESPONSE, |stage, payload, next| {
        settle(stage, Ok(payload));
        next.discard();
    })?;
    head.on(kinds::ERROR, |stage, payload, next| {
        let err = match payload {
            Payload::Error(err) => err,
            other => PipeError::handler(other.render()),
        };
        settle(stage, Err(err));
        next.discard();
    })?;
    Ok(())
}

fn arm(stage: &Stage, payload: Payload) -> PipeResult<Payload> {
    let call = payload
        .downcast_ref::<PendingCall>()
        .ok_or_else(|| PipeError::handler("`call` expects a PendingCall payload"))?;
    let slot = stage
        .store()
        .get::<ReplySlot>(REPLY_SLOT)
        .ok_or_else(|| PipeError::CapabilityNotFound(CALL.to_string()))?;
    let reply = call.reply.lock().take().ok_or(PipeError::ChainClosed)?;

    {
        let mut pending = slot.0.lock();
        if pending.as_ref().is_some_and(|tx| !tx.is_closed()) {
            return Err(PipeError::handler("a call is already in flight on this chain"));
        }
        *pending = Some(reply);
    }

    trace!(position = stage.position(), "Call armed");
    stage.send(Message::request(call.request.clone()));
    Ok(Payload::Empty)
}

fn settle(stage: &Stage, outcome: PipeResult<Payload>) {
    let reply = stage
        .store()
        .get::<ReplySlot>(REPLY_SLOT)
        .and_then(|slot| slot.0.lock().take());

    match reply {
        Some(tx) => {
            if tx.send(outcome).is_err() {
                debug!("Caller stopped waiting, reply dropped");
            }
        }
        None => debug!(ok = outcome.is_ok(), "Reply without a pending call, dropped"),
    }
}

/// Awaitable request on a chain built with [`Awaitable`].
pub trait CallExt {
    /// Sends `request` and resolves with the response, or with the error that
    /// reached the head.
    fn call(&self, request: impl Into<Payload>) -> BoxFuture<'static, PipeResult<Payload>>;
}

impl CallExt for Stage {
    fn call(&self, request: impl Into<Payload>) -> BoxFuture<'static, PipeResult<Payload>> {
        let (tx, rx) = oneshot::channel();
        let armed = self.invoke(CALL, Payload::shared(PendingCall::new(request.into(), tx)));
        async move {
            armed?;
            rx.await.map_err(|_| PipeError::ChainClosed)?
        }
        .boxed()
    }
}

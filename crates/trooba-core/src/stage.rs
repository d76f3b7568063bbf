//! Pipeline stages and the per-stage queue.
//!
//! Each [`Stage`] owns a private FIFO queue drained by a single consumer task.
//! Producers only enqueue; handlers never run on the sender's stack. The
//! consumer takes one message at a time and, for regular messages, suspends
//! until the handler resumes its [`Next`]:
//!
//! ```text
//!   add ──▶ [m3 m2 m1] ──▶ consumer ──▶ handler(stage, payload, next)
//!                              ▲                               │
//!                              └──────── next.pass() ──────────┘
//! ```
//!
//! A handler that holds on to its continuation therefore throttles every
//! producer queueing at this stage, without affecting other stages.
//!
//! `trace` messages skip the queue: each visit runs on its own task, so a
//! trace passes stalled stages and reports how much is waiting there.

use std::collections::HashMap;
use std::fmt;
use std::panic::{self, AssertUnwindSafe};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Weak};

use parking_lot::RwLock;
use tokio::runtime::Handle;
use tokio::sync::{mpsc, oneshot};
use tracing::{error, trace, warn};

use crate::actuator::Actuator;
use crate::capability::{Capability, CapabilitySet};
use crate::context::{Context, Store};
use crate::continuation::Next;
use crate::error::{PipeError, PipeResult};
use crate::message::{Direction, Message, Payload, kinds};

/// A message handler.
///
/// Receives the stage it runs on, a copy of the payload and the continuation
/// of the message.
pub type Handler = Arc<dyn Fn(&Stage, Payload, Next) + Send + Sync>;

struct HandlerEntry {
    handler: Handler,
    once: bool,
}

pub(crate) struct StageInner {
    position: usize,
    actuator: Weak<Actuator>,
    context: Arc<Context>,
    store: Store,
    handlers: RwLock<HashMap<String, HandlerEntry>>,
    capabilities: RwLock<CapabilitySet>,
    queue: mpsc::UnboundedSender<Message>,
    depth: AtomicUsize,
    runtime: Handle,
}

/// One position in a pipeline chain.
///
/// `Stage` is a cheap handle; clones refer to the same stage. Handlers should
/// use the stage they receive as argument instead of capturing a clone, which
/// would keep the chain alive.
#[derive(Clone)]
pub struct Stage {
    inner: Arc<StageInner>,
}

impl Stage {
    pub(crate) fn spawn(
        position: usize,
        actuator: Weak<Actuator>,
        context: Arc<Context>,
        store: Store,
        capabilities: CapabilitySet,
        runtime: &Handle,
    ) -> Self {
        let (queue, rx) = mpsc::unbounded_channel();
        let stage = Self {
            inner: Arc::new(StageInner {
                position,
                actuator,
                context,
                store,
                handlers: RwLock::new(HashMap::new()),
                capabilities: RwLock::new(capabilities),
                queue,
                depth: AtomicUsize::new(0),
                runtime: runtime.clone(),
            }),
        };
        runtime.spawn(drive(Arc::downgrade(&stage.inner), rx));
        stage
    }

    /// Position of this stage; the head is `0`.
    pub fn position(&self) -> usize {
        self.inner.position
    }

    /// The chain's request context.
    pub fn context(&self) -> &Context {
        &self.inner.context
    }

    /// The chain's shared store.
    pub fn store(&self) -> &Store {
        &self.inner.store
    }

    /// Number of messages waiting in this stage's queue.
    pub fn queue_len(&self) -> usize {
        self.inner.depth.load(Ordering::Acquire)
    }

    pub(crate) fn actuator(&self) -> Option<Arc<Actuator>> {
        self.inner.actuator.upgrade()
    }

    pub(crate) fn capabilities(&self) -> CapabilitySet {
        self.inner.capabilities.read().clone()
    }

    // =========================================================================
    // Handlers
    // =========================================================================

    /// Registers the handler for `kind`. Use `"*"` to catch every kind that
    /// has no handler of its own.
    pub fn on<F>(&self, kind: impl Into<String>, handler: F) -> PipeResult<()>
    where
        F: Fn(&Stage, Payload, Next) + Send + Sync + 'static,
    {
        self.register(kind.into(), Arc::new(handler), false)
    }

    /// Registers a handler removed after its first invocation.
    pub fn once<F>(&self, kind: impl Into<String>, handler: F) -> PipeResult<()>
    where
        F: Fn(&Stage, Payload, Next) + Send + Sync + 'static,
    {
        self.register(kind.into(), Arc::new(handler), true)
    }

    /// Removes the handler for `kind`.
    pub fn remove_listener(&self, kind: &str) -> bool {
        self.inner.handlers.write().remove(kind).is_some()
    }

    /// Whether a handler is registered for exactly `kind`.
    pub fn has_handler(&self, kind: &str) -> bool {
        self.inner.handlers.read().contains_key(kind)
    }

    fn register(&self, kind: String, handler: Handler, once: bool) -> PipeResult<()> {
        let mut handlers = self.inner.handlers.write();
        if handlers.contains_key(&kind) {
            return Err(PipeError::DuplicateHandler {
                kind,
                position: self.position(),
            });
        }
        handlers.insert(kind, HandlerEntry { handler, once });
        Ok(())
    }

    fn handler_for(&self, kind: &str) -> Option<Handler> {
        let mut handlers = self.inner.handlers.write();
        let key = if handlers.contains_key(kind) {
            kind
        } else if handlers.contains_key(kinds::WILDCARD) {
            kinds::WILDCARD
        } else {
            return None;
        };
        let entry = handlers.get(key)?;
        let handler = Arc::clone(&entry.handler);
        if entry.once {
            handlers.remove(key);
        }
        Some(handler)
    }

    // =========================================================================
    // Messaging
    // =========================================================================

    /// Sends a message from this stage in its direction.
    pub fn send(&self, mut message: Message) {
        message.bind(self.inner.actuator.clone(), self.position());
        message.advance();
    }

    /// Sends a message built from its parts.
    pub fn send_kind(
        &self,
        kind: impl Into<std::borrow::Cow<'static, str>>,
        payload: impl Into<Payload>,
        direction: Direction,
    ) {
        self.send(Message::new(kind, payload, direction));
    }

    /// Sends an `error` backward.
    pub fn throw(&self, err: impl Into<PipeError>) {
        self.send(Message::error(err));
    }

    /// Enqueues a message arriving at this stage.
    pub(crate) fn add(&self, mut message: Message) {
        message.position = Some(self.position());
        if message.kind() == kinds::TRACE {
            let stage = self.clone();
            self.inner.runtime.spawn(async move { stage.visit(message) });
            return;
        }
        self.inner.depth.fetch_add(1, Ordering::AcqRel);
        if let Err(mpsc::error::SendError(message)) = self.inner.queue.send(message) {
            self.inner.depth.fetch_sub(1, Ordering::AcqRel);
            warn!(
                position = self.position(),
                kind = message.kind(),
                "Stage consumer stopped, message discarded"
            );
        }
    }

    /// Whether no stage follows this one.
    pub(crate) fn is_last(&self) -> bool {
        self.actuator()
            .is_none_or(|actuator| actuator.resolve(self.position() + 1).is_none())
    }

    /// Hands a `trace` message to its collector and moves it on, turning it
    /// around at the last stage.
    fn visit(&self, mut message: Message) {
        if let Payload::Trace(collector) = message.payload() {
            collector(self, message.direction());
        }
        if message.direction() == Direction::Forward && self.is_last() {
            message.reverse();
        }
        message.advance();
    }

    /// Handles one dequeued message.
    ///
    /// Returns the receiver to wait on when the handler holds a continuation.
    fn process(&self, message: Message) -> Option<oneshot::Receiver<()>> {
        let Some(handler) = self.handler_for(message.kind()) else {
            message.advance();
            return None;
        };

        let payload = message.payload().clone();
        if message.is_one_way() {
            let next = Next::noop(message.kind(), message.direction());
            handler(self, payload, next);
            return None;
        }

        let (tx, rx) = oneshot::channel();
        handler(self, payload, Next::new(message, tx));
        Some(rx)
    }

    // =========================================================================
    // Capabilities
    // =========================================================================

    /// Installs a capability on this stage.
    ///
    /// Stages created after this one in the same chain inherit it.
    pub fn decorate(
        &self,
        name: impl Into<std::borrow::Cow<'static, str>>,
        capability: Capability,
    ) -> PipeResult<()> {
        self.inner.capabilities.write().insert(name, capability)
    }

    /// Calls a capability.
    pub fn invoke(&self, name: &str, payload: impl Into<Payload>) -> PipeResult<Payload> {
        let capability = self
            .inner
            .capabilities
            .read()
            .get(name)
            .ok_or_else(|| PipeError::CapabilityNotFound(name.to_string()))?;
        capability(self, payload.into())
    }

    /// Whether a capability is installed.
    pub fn has_capability(&self, name: &str) -> bool {
        self.inner.capabilities.read().contains(name)
    }

    /// Names of the installed capabilities, in installation order.
    pub fn capability_names(&self) -> Vec<String> {
        self.inner
            .capabilities
            .read()
            .names()
            .into_iter()
            .map(str::to_string)
            .collect()
    }
}

impl fmt::Debug for Stage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Stage")
            .field("position", &self.position())
            .field("queue_len", &self.queue_len())
            .field("handlers", &self.inner.handlers.read().len())
            .field("capabilities", &*self.inner.capabilities.read())
            .finish()
    }
}

/// Consumer loop of one stage.
///
/// Holds only a weak reference so the loop ends once the stage is dropped
/// and its queue closes.
async fn drive(stage: Weak<StageInner>, mut queue: mpsc::UnboundedReceiver<Message>) {
    while let Some(message) = queue.recv().await {
        let Some(inner) = stage.upgrade() else {
            break;
        };
        inner.depth.fetch_sub(1, Ordering::AcqRel);
        let stage = Stage { inner };
        let position = stage.position();
        // A panicking handler or fault policy must not end the consumer.
        let suspended = match panic::catch_unwind(AssertUnwindSafe(|| stage.process(message))) {
            Ok(suspended) => suspended,
            Err(_) => {
                error!(position, "Stage handler panicked, message discarded");
                None
            }
        };
        drop(stage);

        if let Some(resume) = suspended
            && resume.await.is_err()
        {
            trace!(position, "Continuation dropped without being invoked, message discarded");
        }
    }
}

//! The continuation handed to every handler.
//!
//! A stage suspends its queue at a handler invocation until the handler
//! resumes the [`Next`] it was given. `Next` is `Clone` so it can be moved into
//! timers or retry logic; all clones share one slot and only the first
//! [`resume`](Next::resume) has an effect.
//!
//! Dropping every clone without resuming discards the message and releases
//! the stage.

use std::borrow::Cow;
use std::fmt;
use std::sync::Arc;

use parking_lot::Mutex;
use tokio::sync::oneshot;
use tracing::trace;

use crate::message::{Direction, Message, Payload};

/// What to do with the held message when resuming.
#[derive(Debug)]
pub enum Continuation {
    /// Advance the message unchanged.
    Pass,
    /// Replace the payload, then advance.
    Replace(Payload),
    /// Discard the message.
    Drop,
}

struct Pending {
    message: Message,
    resume: oneshot::Sender<()>,
}

/// Continuation bound to one message at one stage.
#[derive(Clone)]
pub struct Next {
    kind: Cow<'static, str>,
    direction: Direction,
    slot: Option<Arc<Mutex<Option<Pending>>>>,
}

impl Next {
    pub(crate) fn new(message: Message, resume: oneshot::Sender<()>) -> Self {
        Self {
            kind: Cow::Owned(message.kind().to_string()),
            direction: message.direction(),
            slot: Some(Arc::new(Mutex::new(Some(Pending { message, resume })))),
        }
    }

    /// Continuation of a one-way message: resuming it does nothing.
    pub(crate) fn noop(kind: &str, direction: Direction) -> Self {
        Self {
            kind: Cow::Owned(kind.to_string()),
            direction,
            slot: None,
        }
    }

    /// Kind of the held message.
    pub fn kind(&self) -> &str {
        &self.kind
    }

    /// Direction of the held message.
    pub fn direction(&self) -> Direction {
        self.direction
    }

    /// Whether the continuation can still take effect.
    pub fn is_pending(&self) -> bool {
        self.slot.as_ref().is_some_and(|slot| slot.lock().is_some())
    }

    /// Resumes the stage.
    ///
    /// Returns `false` when the continuation was already used or belongs to a
    /// one-way message.
    pub fn resume(&self, continuation: Continuation) -> bool {
        let Some(slot) = &self.slot else {
            trace!(kind = %self.kind, "Continuation of one-way message ignored");
            return false;
        };
        let pending = slot.lock().take();
        let Some(Pending {
            mut message,
            resume,
        }) = pending
        else {
            trace!(kind = %self.kind, "Continuation already invoked, ignoring");
            return false;
        };

        match continuation {
            Continuation::Pass => message.advance(),
            Continuation::Replace(payload) => {
                message.replace_payload(payload);
                message.advance();
            }
            Continuation::Drop => {
                trace!(kind = %self.kind, "Message discarded by handler");
            }
        }

        // The stage loop may already be gone if the chain was dropped.
        let _ = resume.send(());
        true
    }

    /// Advances the message unchanged.
    pub fn pass(&self) -> bool {
        self.resume(Continuation::Pass)
    }

    /// Advances the message with a new payload.
    pub fn replace(&self, payload: impl Into<Payload>) -> bool {
        self.resume(Continuation::Replace(payload.into()))
    }

    /// Discards the message and releases the stage.
    pub fn discard(&self) -> bool {
        self.resume(Continuation::Drop)
    }
}

impl fmt::Debug for Next {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Next")
            .field("kind", &self.kind)
            .field("direction", &self.direction)
            .field("pending", &self.is_pending())
            .finish()
    }
}

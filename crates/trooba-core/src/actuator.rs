//! Lazy chain materialization and the chain boundary policy.
//!
//! The [`Actuator`] of a live chain holds the factories that have not run yet
//! and the stages materialized so far, indexed by position. Stages are built
//! only when a message first needs them. A factory may answer
//! [`Attach::Inline`], in which case the nested pipeline's factories are
//! spliced in at that position and the chain continues flat:
//!
//! ```text
//!   outer: [a, (inner: [x, y]), b]   ──▶   positions: head, a, x, y, b
//! ```

use std::collections::VecDeque;
use std::fmt;
use std::ops::Deref;
use std::sync::{Arc, Weak};

use parking_lot::Mutex;
use tokio::runtime::Handle;
use tracing::{debug, error, trace, warn};

use crate::builder::{Attach, StageFactory};
use crate::context::{Context, Store, UnmatchedPolicy};
use crate::error::PipeError;
use crate::message::{Direction, Message, Payload, kinds};
use crate::stage::Stage;

struct Materialized {
    remaining: VecDeque<StageFactory>,
    stages: Vec<Stage>,
}

/// Materializes and addresses the stages of one chain.
pub struct Actuator {
    weak: Weak<Actuator>,
    runtime: Handle,
    context: Arc<Context>,
    store: Store,
    state: Mutex<Materialized>,
}

impl Actuator {
    pub(crate) fn new(factories: &[StageFactory], context: Context, runtime: Handle) -> Arc<Self> {
        let context = Arc::new(context);
        let store = Store::new();
        Arc::new_cyclic(|weak: &Weak<Actuator>| {
            let head = Stage::spawn(
                0,
                weak.clone(),
                Arc::clone(&context),
                store.clone(),
                Default::default(),
                &runtime,
            );
            Self {
                weak: weak.clone(),
                runtime,
                context,
                store,
                state: Mutex::new(Materialized {
                    remaining: factories.iter().cloned().collect(),
                    stages: vec![head],
                }),
            }
        })
    }

    /// The head stage.
    pub fn head(&self) -> Stage {
        self.state.lock().stages[0].clone()
    }

    /// The chain's context.
    pub fn context(&self) -> &Context {
        &self.context
    }

    /// The chain's store.
    pub fn store(&self) -> &Store {
        &self.store
    }

    /// Number of stages materialized so far, head included.
    pub fn materialized(&self) -> usize {
        self.state.lock().stages.len()
    }

    /// Returns an already materialized stage.
    pub fn stage_at(&self, position: usize) -> Option<Stage> {
        self.state.lock().stages.get(position).cloned()
    }

    /// Returns the stage at `position`, materializing stages up to it.
    ///
    /// Returns `None` when the chain has fewer stages. Factories run while
    /// the chain lock is held and must not send messages.
    pub fn resolve(&self, position: usize) -> Option<Stage> {
        let mut state = self.state.lock();
        while state.stages.len() <= position {
            let factory = state.remaining.pop_front()?;
            let next_position = state.stages.len();
            let inherited = state.stages[next_position - 1].capabilities();
            let stage = Stage::spawn(
                next_position,
                self.weak.clone(),
                Arc::clone(&self.context),
                self.store.clone(),
                inherited,
                &self.runtime,
            );

            match factory(&stage) {
                Ok(Attach::Stage) => {
                    debug!(position = next_position, "Stage materialized");
                    state.stages.push(stage);
                }
                Ok(Attach::Inline(pipeline)) => {
                    let nested = pipeline.factories();
                    debug!(
                        position = next_position,
                        stages = nested.len(),
                        "Inlining nested pipeline"
                    );
                    for factory in nested.iter().rev() {
                        state.remaining.push_front(Arc::clone(factory));
                    }
                }
                Err(err) => {
                    error!(position = next_position, error = %err, "Stage factory failed");
                    state.stages.push(stage);
                    drop(state);
                    self.context.fault_policy().raise(&err);
                    state = self.state.lock();
                }
            }
        }
        state.stages.get(position).cloned()
    }

    /// Applies the boundary policy to a message that ran off the chain after
    /// leaving position `from`.
    pub(crate) fn exhausted(&self, mut message: Message, from: usize) {
        let kind = message.kind().to_string();

        if kind == kinds::ERROR {
            let err = match message.payload() {
                Payload::Error(err) => err.clone(),
                other => PipeError::handler(other.render()),
            };
            error!(error = %err, position = from, "Unhandled error reached the end of the chain");
            self.context.fault_policy().raise(&err);
            return;
        }

        let Some(last) = self.stage_at(from) else {
            return;
        };

        if kind == kinds::TRACE {
            if message.direction() == Direction::Forward {
                message.reverse();
                last.add(message);
            }
            return;
        }

        if self.context.requires(&kind) {
            let err = PipeError::NoTargetConsumer {
                kind,
                payload: message.payload().render(),
            };
            debug!(error = %err, position = from, "Reporting missing consumer");
            if from == 0 {
                // Nothing sits behind the head, so it observes the miss itself.
                let mut report = Message::error(err);
                report.bind(self.weak.clone(), 0);
                last.add(report);
            } else {
                last.throw(err);
            }
            return;
        }

        match self.context.unmatched_policy() {
            UnmatchedPolicy::Warn => warn!(
                kind = %kind,
                direction = %message.direction(),
                position = from,
                "No consumer for message, dropping"
            ),
            _ => trace!(kind = %kind, position = from, "No consumer for message, dropping"),
        }
    }
}

impl fmt::Debug for Actuator {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let state = self.state.lock();
        f.debug_struct("Actuator")
            .field("materialized", &state.stages.len())
            .field("remaining", &state.remaining.len())
            .field("context", &self.context)
            .finish()
    }
}

// =============================================================================
// Pipe
// =============================================================================

/// A live chain, as returned by [`Pipeline::create`](crate::Pipeline::create).
///
/// Dereferences to the head stage. Dropping the last `Pipe` releases every
/// stage of the chain.
#[derive(Clone)]
pub struct Pipe {
    actuator: Arc<Actuator>,
    head: Stage,
}

impl Pipe {
    pub(crate) fn new(actuator: Arc<Actuator>) -> Self {
        let head = actuator.head();
        Self { actuator, head }
    }

    /// The head stage.
    pub fn head(&self) -> &Stage {
        &self.head
    }

    /// The chain's actuator.
    pub fn actuator(&self) -> &Arc<Actuator> {
        &self.actuator
    }
}

impl Deref for Pipe {
    type Target = Stage;

    fn deref(&self) -> &Self::Target {
        &self.head
    }
}

impl fmt::Debug for Pipe {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Pipe")
            .field("actuator", &self.actuator)
            .finish()
    }
}

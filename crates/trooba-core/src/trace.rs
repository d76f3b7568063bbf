//! Chain introspection.
//!
//! A `trace` message visits every stage on its way forward, turns around at
//! the last stage and visits them again on its way back. Each visit calls the
//! collector synchronously, bypassing handlers and flow control.

use std::sync::Arc;

use parking_lot::Mutex;
use tokio::sync::oneshot;

use crate::error::{PipeError, PipeResult};
use crate::message::{Direction, Message, Payload, kinds};
use crate::stage::Stage;

/// Collector called by each stage a trace visits.
pub type TraceFn = Arc<dyn Fn(&Stage, Direction) + Send + Sync>;

/// One visit of a trace message.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TracePoint {
    /// Position of the visited stage.
    pub position: usize,
    /// Direction the trace travelled.
    pub direction: Direction,
    /// Messages waiting in the stage's queue at the time of the visit.
    pub queue_len: usize,
    /// Capabilities installed on the stage.
    pub capabilities: Vec<String>,
}

impl TracePoint {
    fn capture(stage: &Stage, direction: Direction) -> Self {
        Self {
            position: stage.position(),
            direction,
            queue_len: stage.queue_len(),
            capabilities: stage.capability_names(),
        }
    }
}

impl Stage {
    /// Sends a `trace` message forward from this stage.
    pub fn trace<F>(&self, collector: F)
    where
        F: Fn(&Stage, Direction) + Send + Sync + 'static,
    {
        self.send(Message::new(
            kinds::TRACE,
            Payload::Trace(Arc::new(collector)),
            Direction::Forward,
        ));
    }

    /// Traces the route from this stage to the end of the chain and back.
    ///
    /// Resolves once the trace returns here; every stage it passed is
    /// materialized on the way.
    pub async fn trace_route(&self) -> PipeResult<Vec<TracePoint>> {
        let origin = self.position();
        let points = Arc::new(Mutex::new(Vec::new()));
        let (done_tx, done_rx) = oneshot::channel();
        let done_tx = Mutex::new(Some(done_tx));

        let collected = Arc::clone(&points);
        self.trace(move |stage, direction| {
            collected.lock().push(TracePoint::capture(stage, direction));
            if direction == Direction::Backward
                && stage.position() == origin
                && let Some(tx) = done_tx.lock().take()
            {
                let _ = tx.send(());
            }
        });

        done_rx.await.map_err(|_| PipeError::ChainClosed)?;
        let route = std::mem::take(&mut *points.lock());
        Ok(route)
    }
}

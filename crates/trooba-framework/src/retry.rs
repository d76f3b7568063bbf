//! Retry plugin.
//!
//! Lets one request at a time past its stage. When an `error` comes back and
//! attempts remain, the error is swallowed and that request is sent forward
//! again from the same stage, so stages after it see a fresh traversal while
//! stages before it only ever see the final outcome.
//!
//! Requests arriving while one is in flight wait in a queue and are sent on
//! once the current one settles with a `response` or a final `error`. Every
//! outcome coming back therefore belongs to the request in flight.

use std::collections::VecDeque;

use parking_lot::Mutex;
use serde::Deserialize;
use tracing::{debug, warn};
use trooba_core::{Attach, Message, Payload, PipeResult, Plugin, Stage, StageConfig, kinds};

/// Configuration of [`Retry`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(default)]
pub struct RetryConfig {
    /// How many times a failed request is sent again.
    pub attempts: u32,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self { attempts: 1 }
    }
}

#[derive(Default)]
struct Flight {
    current: Option<Payload>,
    used: u32,
    waiting: VecDeque<Payload>,
}

type RetryState = Mutex<Flight>;

/// Settles the request in flight and sends the next waiting one, if any.
fn settle(stage: &Stage, state: &RetryState) {
    let next = {
        let mut flight = state.lock();
        flight.current = flight.waiting.pop_front();
        flight.used = 0;
        flight.current.clone()
    };
    if let Some(request) = next {
        stage.send(Message::request(request));
    }
}

/// Replays a request when an error comes back.
#[derive(Debug, Clone, Copy, Default)]
pub struct Retry;

impl Plugin for Retry {
    fn name(&self) -> &str {
        "retry"
    }

    fn attach(&self, stage: &Stage, config: &StageConfig) -> PipeResult<Attach> {
        let RetryConfig { attempts } = config.get()?;
        let key = format!("trooba.retry.{}", stage.position());
        stage.store().insert(key.clone(), RetryState::default());

        let request_key = key.clone();
        stage.on(kinds::REQUEST, move |stage, payload, next| {
            let Some(state) = stage.store().get::<RetryState>(&request_key) else {
                next.pass();
                return;
            };
            let mut flight = state.lock();
            if flight.current.is_none() {
                flight.current = Some(payload);
                flight.used = 0;
                drop(flight);
                next.pass();
            } else {
                debug!(waiting = flight.waiting.len() + 1, "Request queued behind one in flight");
                flight.waiting.push_back(payload);
                drop(flight);
                next.discard();
            }
        })?;

        let response_key = key.clone();
        stage.on(kinds::RESPONSE, move |stage, _, next| {
            next.pass();
            if let Some(state) = stage.store().get::<RetryState>(&response_key) {
                if state.lock().current.is_some() {
                    settle(stage, &state);
                }
            }
        })?;

        stage.on(kinds::ERROR, move |stage, payload, next| {
            let Some(state) = stage.store().get::<RetryState>(&key) else {
                next.pass();
                return;
            };
            let mut flight = state.lock();
            let Some(request) = flight.current.clone() else {
                drop(flight);
                next.pass();
                return;
            };

            if flight.used < attempts {
                flight.used += 1;
                debug!(
                    attempt = flight.used,
                    attempts,
                    error = %payload.render(),
                    "Retrying request"
                );
                drop(flight);
                // Sent from this stage, so the request handler above does
                // not see it and the flight stays put.
                stage.send(Message::request(request));
                next.discard();
            } else {
                drop(flight);
                if attempts > 0 {
                    warn!(attempts, error = %payload.render(), "Retries exhausted");
                }
                next.pass();
                settle(stage, &state);
            }
        })?;

        Ok(Attach::Stage)
    }
}

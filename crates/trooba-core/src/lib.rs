//! # Trooba Core
//!
//! The routing engine of Trooba: bidirectional, position-addressed pipelines
//! built from independently composable stages.
//!
//! A pipeline is an ordered chain of stages. A request travels forward
//! through the chain and its response travels backward through the same
//! stages, each of which may observe, transform, short-circuit, replay or
//! stream either direction.
//!
//! ## Building blocks
//!
//! - **Construction**: [`Trooba`] collects factories and plugins,
//!   [`Pipeline`] is the reusable blueprint, [`Pipe`] a live chain.
//! - **Routing**: [`Message`] advances itself one position at a time; the
//!   [`Actuator`] materializes stages on demand and inlines nested pipelines.
//! - **Flow control**: every [`Stage`] drains its own FIFO queue and waits
//!   for the handler's [`Next`] before taking the next message.
//! - **Decoration**: [`Stage::decorate`] installs a [`Capability`] that all
//!   later stages inherit; [`Plugin::decorator`] runs once on the head.
//! - **Introspection**: [`Stage::trace`] and [`Stage::trace_route`].
//!
//! ```text
//! ┌──────┐ request ┌─────────┐      ┌─────────┐      ┌──────────┐
//! │ head │────────▶│ stage 1 │─────▶│ stage 2 │─────▶│ stage 3  │
//! │ (0)  │◀────────│         │◀─────│         │◀─────│ terminal │
//! └──────┘response └─────────┘      └─────────┘      └──────────┘
//! ```
//!
//! ## Example
//!
//! ```rust,ignore
//! use trooba_core::{Attach, Message, Trooba};
//!
//! #[tokio::main(flavor = "current_thread")]
//! async fn main() -> trooba_core::PipeResult<()> {
//!     let pipeline = Trooba::new()
//!         .use_fn(|stage, _| {
//!             stage.on("request", |_, _, next| {
//!                 next.pass();
//!             })?;
//!             Ok(Attach::Stage)
//!         })
//!         .use_fn(|stage, _| {
//!             stage.on("request", |stage, payload, _| {
//!                 stage.send(Message::response(payload));
//!             })?;
//!             Ok(Attach::Stage)
//!         })
//!         .build();
//!
//!     let pipe = pipeline.create()?;
//!     pipe.on("response", |_, payload, _| println!("got {payload:?}"))?;
//!     pipe.send(Message::request("hello"));
//!     Ok(())
//! }
//! ```

pub mod actuator;
pub mod builder;
pub mod capability;
pub mod context;
pub mod continuation;
pub mod error;
pub mod message;
pub mod stage;
pub mod trace;

pub use actuator::{Actuator, Pipe};
pub use builder::{
    ApiFactory, Attach, BoxedApi, Decorator, Pipeline, Plugin, StageConfig, StageFactory, Trooba,
    api_factory,
};
pub use capability::{Capability, CapabilitySet, capability};
pub use context::{Context, FaultHook, FaultPolicy, Store, UnmatchedPolicy};
pub use continuation::{Continuation, Next};
pub use error::{PipeError, PipeResult};
pub use message::{Direction, Message, Payload, kinds};
pub use stage::{Handler, Stage};
pub use trace::{TraceFn, TracePoint};

/// Prelude for common imports.
pub mod prelude {
    pub use super::{
        Attach, Context, Direction, Message, Next, Payload, PipeError, PipeResult, Pipeline,
        Plugin, Stage, StageConfig, Trooba, capability, kinds,
    };
}

//! # Trooba
//!
//! Bidirectional, position-addressed message pipelines.
//!
//! ## Overview
//!
//! A pipeline is an ordered chain of stages. A request travels forward
//! through the chain and the response travels back through the same stages.
//! Any stage may observe, transform, short-circuit, replay or stream traffic
//! in either direction, and each stage handles one message at a time.
//!
//! ## Architecture
//!
//! ```text
//! ┌──────────┐     ┌────────────────┐     ┌──────────────────────────────┐
//! │ Trooba   │────▶│ Pipeline       │────▶│ Pipe (one chain per request) │
//! │ (builder)│     │ (blueprint)    │     │ head ⇄ stage ⇄ ... ⇄ terminal │
//! └──────────┘     └────────────────┘     └──────────────────────────────┘
//! ```
//!
//! - **Core**: builder, stages, messages, continuations, capabilities
//! - **Framework**: exchange helpers, awaitable calls, retry, transports
//! - **Runtime**: layered configuration and logging setup
//!
//! ## Quick Start
//!
//! ```rust,ignore
//! use trooba::prelude::*;
//!
//! #[tokio::main]
//! async fn main() -> PipeResult<()> {
//!     let pipeline = transport_fn(
//!         |stage, _| {
//!             stage.on(kinds::REQUEST, |stage, payload, _| {
//!                 stage.send(Message::response(payload));
//!             })?;
//!             Ok(())
//!         },
//!         serde_json::Value::Null,
//!     )
//!     .use_plugin(Retry, serde_json::json!({"attempts": 2}))?
//!     .build()?;
//!
//!     let call = pipeline.create(Context::new());
//!     let reply = call.invoke("hello".into()).await?;
//!     println!("{reply:?}");
//!     Ok(())
//! }
//! ```
//!
//! ## Features
//!
//! - `runtime` *(default)*: configuration loading and logging setup
//! - `toml-config` *(default)*: TOML configuration files
//! - `yaml-config`: YAML configuration files
//! - `json-log`: JSON log output

pub use trooba_core as core;
pub use trooba_framework as framework;
#[cfg(feature = "runtime")]
pub use trooba_runtime as runtime;

/// Prelude module for convenient imports.
///
/// ```rust,ignore
/// use trooba::prelude::*;
/// ```
pub mod prelude {
    // Construction and routing
    pub use trooba_core::prelude::*;
    pub use trooba_core::{Continuation, FaultPolicy, Pipe, UnmatchedPolicy};

    // Collaborators
    pub use trooba_framework::{
        Awaitable, CallExt, Exchange, ExchangeExt, PipeFn, Retry, RetryConfig, Transport,
        transport, transport_fn,
    };

    // Hosting
    #[cfg(feature = "runtime")]
    pub use trooba_runtime::{ConfigLoader, LoggingBuilder, TroobaConfig, init_from_config};
}

//! # Trooba Framework
//!
//! Collaborators built on the core's construction and decoration interfaces.
//! None of them route messages themselves.
//!
//! This layer provides:
//! - [`Exchange`]: `request`/`respond` and streaming capabilities on every stage
//! - [`Awaitable`]: `pipe.call(request).await`
//! - [`Retry`]: replays a request when an error comes back
//! - [`transport`]: turns a chain ending in a transport into a [`PipeFn`] or a
//!   transport-specific API

pub mod awaitable;
pub mod exchange;
pub mod retry;
pub mod transport;

pub use awaitable::{Awaitable, CallExt};
pub use exchange::{Exchange, ExchangeExt};
pub use retry::{Retry, RetryConfig};
pub use transport::{
    FnTransport, PipeFn, Transport, TransportApi, TransportBuilder, TransportPipeline, transport,
    transport_api, transport_fn,
};

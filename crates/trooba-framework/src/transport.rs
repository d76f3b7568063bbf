//! Single-directional transport wrapper.
//!
//! Turns a chain ending in a transport into a plain `(request, callback)`
//! function, or into the transport's own API type bound to such a function.
//!
//! ```text
//!   PipeFn::call(req, cb)
//!        │
//!   ┌────▼───┐     ┌─────────┐     ┌───────────┐
//!   │  head  │────▶│ stages… │────▶│ transport │
//!   │ (call) │◀────│         │◀────│           │
//!   └────────┘     └─────────┘     └───────────┘
//! ```
//!
//! Every call runs on a fresh chain built from the same blueprint.

use std::any::{Any, type_name};
use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use serde_json::Value;
use tracing::debug;
use trooba_core::{
    Attach, BoxedApi, Context, Payload, PipeError, PipeResult, Pipeline, Plugin, Stage,
    StageConfig, Trooba,
};

use crate::awaitable::{Awaitable, CallExt};

/// Builds a transport's custom API around a [`PipeFn`].
pub type TransportApi = Arc<dyn Fn(PipeFn, &StageConfig) -> BoxedApi + Send + Sync>;

/// Wraps a closure into a [`TransportApi`].
pub fn transport_api<F, T>(f: F) -> TransportApi
where
    F: Fn(PipeFn, &StageConfig) -> T + Send + Sync + 'static,
    T: Any + Send,
{
    Arc::new(move |invoker, config| Box::new(f(invoker, config)) as BoxedApi)
}

/// The terminal stage of a transport pipeline.
///
/// A transport answers the `request` reaching it with a `response` or an
/// `error` sent backward.
pub trait Transport: Send + Sync + 'static {
    /// Display name used in logs and errors.
    fn name(&self) -> &str {
        type_name::<Self>()
    }

    /// Configures the transport stage.
    fn attach(&self, stage: &Stage, config: &StageConfig) -> PipeResult<()>;

    /// Custom API exposed instead of the plain [`PipeFn`].
    fn api(&self) -> Option<TransportApi> {
        None
    }
}

/// A [`Transport`] made from a closure.
pub struct FnTransport<F>(F);

impl<F> Transport for FnTransport<F>
where
    F: Fn(&Stage, &StageConfig) -> PipeResult<()> + Send + Sync + 'static,
{
    fn attach(&self, stage: &Stage, config: &StageConfig) -> PipeResult<()> {
        (self.0)(stage, config)
    }
}

/// Starts a transport pipeline.
pub fn transport<T: Transport>(transport: T, config: Value) -> TransportBuilder {
    TransportBuilder {
        builder: Trooba::new(),
        transport: Arc::new(transport),
        config: StageConfig::new(config),
        timeout: None,
    }
}

/// Starts a transport pipeline from a closure.
pub fn transport_fn<F>(f: F, config: Value) -> TransportBuilder
where
    F: Fn(&Stage, &StageConfig) -> PipeResult<()> + Send + Sync + 'static,
{
    transport(FnTransport(f), config)
}

// ─── TransportBuilder ─────────────────────────────────────────────────────────

/// Collects the stages placed before the transport.
pub struct TransportBuilder {
    builder: Trooba,
    transport: Arc<dyn Transport>,
    config: StageConfig,
    timeout: Option<Duration>,
}

impl TransportBuilder {
    /// Appends a stage factory.
    pub fn use_fn<F>(mut self, factory: F) -> Self
    where
        F: Fn(&Stage, &StageConfig) -> PipeResult<Attach> + Send + Sync + 'static,
    {
        self.builder = self.builder.use_fn(factory);
        self
    }

    /// Appends a stage factory with its config.
    pub fn use_fn_with<F>(mut self, factory: F, config: Value) -> Self
    where
        F: Fn(&Stage, &StageConfig) -> PipeResult<Attach> + Send + Sync + 'static,
    {
        self.builder = self.builder.use_fn_with(factory, config);
        self
    }

    /// Appends a plugin.
    pub fn use_plugin<P: Plugin>(mut self, plugin: P, config: Value) -> PipeResult<Self> {
        self.builder = self.builder.use_plugin(plugin, config)?;
        Ok(self)
    }

    /// Appends a nested pipeline.
    pub fn use_pipeline(mut self, pipeline: Pipeline) -> Self {
        self.builder = self.builder.use_pipeline(pipeline);
        self
    }

    /// Sets the context template of every call.
    pub fn context(mut self, context: Context) -> Self {
        self.builder = self.builder.context(context);
        self
    }

    /// Fails calls that get no reply within `limit`.
    pub fn timeout(mut self, limit: Duration) -> Self {
        self.timeout = Some(limit);
        self
    }

    /// Appends the transport and freezes the pipeline.
    pub fn build(self) -> PipeResult<TransportPipeline> {
        let transport = Arc::clone(&self.transport);
        let pipeline = self
            .builder
            .use_plugin(Awaitable, Value::Null)?
            .use_fn_with(
                move |stage, config| {
                    transport.attach(stage, config)?;
                    Ok(Attach::Stage)
                },
                self.config.value().clone(),
            )
            .build();
        debug!(transport = self.transport.name(), "Transport pipeline built");

        Ok(TransportPipeline {
            pipeline,
            transport: self.transport,
            config: self.config,
            timeout: self.timeout,
        })
    }
}

impl fmt::Debug for TransportBuilder {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TransportBuilder")
            .field("transport", &self.transport.name())
            .field("builder", &self.builder)
            .field("timeout", &self.timeout)
            .finish()
    }
}

// ─── TransportPipeline ────────────────────────────────────────────────────────

/// Reusable transport blueprint.
#[derive(Clone)]
pub struct TransportPipeline {
    pipeline: Pipeline,
    transport: Arc<dyn Transport>,
    config: StageConfig,
    timeout: Option<Duration>,
}

impl TransportPipeline {
    /// Returns the plain call function, bound to `context`.
    pub fn create(&self, context: Context) -> PipeFn {
        PipeFn {
            pipeline: self.pipeline.clone(),
            context: Arc::new(context),
            timeout: self.timeout,
        }
    }

    /// Returns the transport's custom API, bound to `context`.
    pub fn create_api<T: Any>(&self, context: Context) -> PipeResult<T> {
        let name = self.transport.name().to_string();
        let factory = self
            .transport
            .api()
            .ok_or_else(|| PipeError::ApiNotFound(name.clone()))?;
        let api = factory(self.create(context), &self.config);
        api.downcast::<T>()
            .map(|api| *api)
            .map_err(|_| PipeError::ApiTypeMismatch {
                name,
                expected: type_name::<T>(),
            })
    }

    /// Whether the transport declares a custom API.
    pub fn has_api(&self) -> bool {
        self.transport.api().is_some()
    }

    /// The underlying pipeline.
    pub fn pipeline(&self) -> &Pipeline {
        &self.pipeline
    }
}

impl fmt::Debug for TransportPipeline {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TransportPipeline")
            .field("transport", &self.transport.name())
            .field("pipeline", &self.pipeline)
            .field("timeout", &self.timeout)
            .finish()
    }
}

// ─── PipeFn ───────────────────────────────────────────────────────────────────

/// Plain `(request, callback)` entry point of a transport pipeline.
#[derive(Clone)]
pub struct PipeFn {
    pipeline: Pipeline,
    context: Arc<Context>,
    timeout: Option<Duration>,
}

impl PipeFn {
    /// Runs `request` through a fresh chain and resolves with its outcome.
    pub async fn invoke(&self, request: Payload) -> PipeResult<Payload> {
        let pipe = self.pipeline.create_with(Context::clone(&self.context))?;
        let reply = pipe.call(request);
        let outcome = match self.timeout {
            Some(limit) => tokio::time::timeout(limit, reply)
                .await
                .map_err(|_| PipeError::Timeout(limit))?,
            None => reply.await,
        };
        drop(pipe);
        outcome
    }

    /// Runs `request` in the background and hands the outcome to `callback`.
    ///
    /// # Panics
    ///
    /// Panics when called outside a tokio runtime.
    pub fn call<F>(&self, request: impl Into<Payload>, callback: F)
    where
        F: FnOnce(PipeResult<Payload>) + Send + 'static,
    {
        let this = self.clone();
        let request = request.into();
        tokio::spawn(async move {
            let outcome = this.invoke(request).await;
            callback(outcome);
        });
    }

    /// The context every call starts from.
    pub fn context(&self) -> &Context {
        &self.context
    }
}

impl fmt::Debug for PipeFn {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PipeFn")
            .field("pipeline", &self.pipeline)
            .field("timeout", &self.timeout)
            .finish()
    }
}

//! Pipeline construction.
//!
//! [`Trooba`] collects stage factories, named API factories and builder-level
//! decorators. [`Trooba::build`] freezes them into a reusable [`Pipeline`]
//! blueprint, and every [`Pipeline::create`] call instantiates one independent
//! live chain ([`Pipe`]).
//!
//! # Example
//!
//! ```rust,ignore
//! use trooba_core::{Attach, Message, Trooba};
//!
//! let pipeline = Trooba::new()
//!     .use_fn(|stage, _| {
//!         stage.on("request", |stage, payload, _next| {
//!             stage.send(Message::response(payload));
//!         })?;
//!         Ok(Attach::Stage)
//!     })
//!     .build();
//!
//! let pipe = pipeline.create()?;
//! pipe.on("response", |_, payload, _| println!("{payload:?}"))?;
//! pipe.send(Message::request("hello"));
//! ```

use std::any::{Any, type_name};
use std::borrow::Cow;
use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;

use serde::de::DeserializeOwned;
use serde_json::Value;
use tokio::runtime::Handle;
use tracing::debug;

use crate::actuator::{Actuator, Pipe};
use crate::context::Context;
use crate::error::{PipeError, PipeResult};
use crate::stage::Stage;

// ─── StageConfig ──────────────────────────────────────────────────────────────

/// Configuration handed to a stage factory.
///
/// Wraps the JSON value given to [`Trooba::use_fn_with`] or
/// [`Trooba::use_plugin`] (`null` when none was given).
#[derive(Clone, Debug, Default)]
pub struct StageConfig {
    value: Arc<Value>,
}

impl StageConfig {
    /// Wraps a config value.
    pub fn new(value: Value) -> Self {
        Self {
            value: Arc::new(value),
        }
    }

    /// The raw config value.
    pub fn value(&self) -> &Value {
        &self.value
    }

    /// Whether no config was given.
    pub fn is_null(&self) -> bool {
        self.value.is_null()
    }

    /// Deserializes the config into `T`.
    ///
    /// A missing config reads as an empty object, so a `T` with
    /// `#[serde(default)]` accepts it.
    pub fn get<T>(&self) -> PipeResult<T>
    where
        T: DeserializeOwned,
    {
        if self.value.is_null() {
            return Ok(T::deserialize(Value::Object(Default::default()))?);
        }
        Ok(T::deserialize(self.value.as_ref())?)
    }
}

// ─── Factories ────────────────────────────────────────────────────────────────

/// What a stage factory did with the stage it was given.
pub enum Attach {
    /// The stage was configured and takes this position.
    Stage,
    /// The stage is discarded; the nested pipeline's stages take its place.
    Inline(Pipeline),
}

impl fmt::Debug for Attach {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Stage => f.write_str("Stage"),
            Self::Inline(p) => f.debug_tuple("Inline").field(p).finish(),
        }
    }
}

/// A stage factory with its config bound.
pub type StageFactory = Arc<dyn Fn(&Stage) -> PipeResult<Attach> + Send + Sync>;

/// A builder-level decorator, run once on the head of every created chain.
pub type Decorator = Arc<dyn Fn(&Stage) -> PipeResult<()> + Send + Sync>;

/// Type-erased API object returned by an [`ApiFactory`].
pub type BoxedApi = Box<dyn Any + Send>;

/// Builds a named API around a fresh chain.
pub type ApiFactory = Arc<dyn Fn(Pipe, &StageConfig) -> BoxedApi + Send + Sync>;

/// Wraps a closure into an [`ApiFactory`].
pub fn api_factory<F, T>(f: F) -> ApiFactory
where
    F: Fn(Pipe, &StageConfig) -> T + Send + Sync + 'static,
    T: Any + Send,
{
    Arc::new(move |pipe, config| Box::new(f(pipe, config)) as BoxedApi)
}

// ─── Plugin ───────────────────────────────────────────────────────────────────

/// A reusable stage with optional named APIs and a builder-level decorator.
///
/// # Example
///
/// ```rust,ignore
/// struct Echo;
///
/// impl Plugin for Echo {
///     fn attach(&self, stage: &Stage, _config: &StageConfig) -> PipeResult<Attach> {
///         stage.on("request", |stage, payload, _| stage.send(Message::response(payload)))?;
///         Ok(Attach::Stage)
///     }
/// }
///
/// let pipeline = Trooba::new().use_plugin(Echo, Value::Null)?.build();
/// ```
pub trait Plugin: Send + Sync + 'static {
    /// Display name used in logs and configuration lookup.
    fn name(&self) -> &str {
        type_name::<Self>()
    }

    /// Configures the stage this plugin occupies.
    fn attach(&self, stage: &Stage, config: &StageConfig) -> PipeResult<Attach>;

    /// Named API factories this plugin exposes.
    fn interfaces(&self) -> Vec<(Cow<'static, str>, ApiFactory)> {
        Vec::new()
    }

    /// Decorator to run once on the head of every created chain.
    fn decorator(&self) -> Option<Decorator> {
        None
    }
}

// ─── Trooba ───────────────────────────────────────────────────────────────────

#[derive(Clone)]
struct ApiEntry {
    factory: ApiFactory,
    config: StageConfig,
}

/// Pipeline builder.
#[derive(Default)]
pub struct Trooba {
    factories: Vec<StageFactory>,
    apis: HashMap<String, ApiEntry>,
    decorators: Vec<Decorator>,
    context: Context,
}

impl Trooba {
    /// Creates an empty builder.
    pub fn new() -> Self {
        Self::default()
    }

    /// Appends a stage factory without config.
    pub fn use_fn<F>(self, factory: F) -> Self
    where
        F: Fn(&Stage, &StageConfig) -> PipeResult<Attach> + Send + Sync + 'static,
    {
        self.use_fn_with(factory, Value::Null)
    }

    /// Appends a stage factory with its config.
    pub fn use_fn_with<F>(mut self, factory: F, config: Value) -> Self
    where
        F: Fn(&Stage, &StageConfig) -> PipeResult<Attach> + Send + Sync + 'static,
    {
        let config = StageConfig::new(config);
        self.factories
            .push(Arc::new(move |stage: &Stage| factory(stage, &config)));
        self
    }

    /// Appends a plugin, registering its APIs and decorator.
    pub fn use_plugin<P: Plugin>(mut self, plugin: P, config: Value) -> PipeResult<Self> {
        let config = StageConfig::new(config);
        for (name, factory) in plugin.interfaces() {
            self.insert_api(name.into_owned(), factory, config.clone())?;
        }
        if let Some(decorator) = plugin.decorator() {
            self.decorators.push(decorator);
        }
        debug!(plugin = plugin.name(), "Plugin added to pipeline");

        let plugin = Arc::new(plugin);
        self.factories
            .push(Arc::new(move |stage: &Stage| plugin.attach(stage, &config)));
        Ok(self)
    }

    /// Appends a nested pipeline, inlined when the chain reaches it.
    pub fn use_pipeline(self, pipeline: Pipeline) -> Self {
        self.use_fn(move |_, _| Ok(Attach::Inline(pipeline.clone())))
    }

    /// Registers a named API factory.
    pub fn register(mut self, name: impl Into<String>, factory: ApiFactory) -> PipeResult<Self> {
        self.insert_api(name.into(), factory, StageConfig::default())?;
        Ok(self)
    }

    /// Adds a builder-level decorator.
    pub fn decorate<F>(mut self, decorator: F) -> Self
    where
        F: Fn(&Stage) -> PipeResult<()> + Send + Sync + 'static,
    {
        self.decorators.push(Arc::new(decorator));
        self
    }

    /// Sets the context template used by [`Pipeline::create`].
    pub fn context(mut self, context: Context) -> Self {
        self.context = context;
        self
    }

    /// Freezes the builder into a reusable blueprint.
    pub fn build(self) -> Pipeline {
        Pipeline {
            inner: Arc::new(Blueprint {
                factories: self.factories,
                apis: self.apis,
                decorators: self.decorators,
                context: self.context,
            }),
        }
    }

    fn insert_api(
        &mut self,
        name: String,
        factory: ApiFactory,
        config: StageConfig,
    ) -> PipeResult<()> {
        if self.apis.contains_key(&name) {
            return Err(PipeError::DuplicateApi(name));
        }
        self.apis.insert(name, ApiEntry { factory, config });
        Ok(())
    }
}

impl fmt::Debug for Trooba {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Trooba")
            .field("factories", &self.factories.len())
            .field("apis", &self.apis.keys().collect::<Vec<_>>())
            .field("decorators", &self.decorators.len())
            .finish()
    }
}

// ─── Pipeline ─────────────────────────────────────────────────────────────────

struct Blueprint {
    factories: Vec<StageFactory>,
    apis: HashMap<String, ApiEntry>,
    decorators: Vec<Decorator>,
    context: Context,
}

/// Immutable, reusable pipeline blueprint.
///
/// Cloning is cheap.
#[derive(Clone)]
pub struct Pipeline {
    inner: Arc<Blueprint>,
}

impl Pipeline {
    /// Creates a live chain with a copy of the builder's context.
    ///
    /// # Panics
    ///
    /// Panics when called outside a tokio runtime.
    pub fn create(&self) -> PipeResult<Pipe> {
        self.create_with(self.inner.context.clone())
    }

    /// Creates a live chain with the given context.
    ///
    /// Runs every builder-level decorator on the head before returning.
    ///
    /// # Panics
    ///
    /// Panics when called outside a tokio runtime.
    pub fn create_with(&self, context: Context) -> PipeResult<Pipe> {
        let actuator = Actuator::new(&self.inner.factories, context, Handle::current());
        let pipe = Pipe::new(actuator);
        for decorator in &self.inner.decorators {
            decorator(pipe.head())?;
        }
        debug!(
            factories = self.inner.factories.len(),
            decorators = self.inner.decorators.len(),
            "Pipeline created"
        );
        Ok(pipe)
    }

    /// Creates a live chain and builds the named API around it.
    pub fn create_api<T: Any>(&self, name: &str) -> PipeResult<T> {
        let entry = self
            .inner
            .apis
            .get(name)
            .ok_or_else(|| PipeError::ApiNotFound(name.to_string()))?;
        let pipe = self.create()?;
        let api = (entry.factory)(pipe, &entry.config);
        api.downcast::<T>()
            .map(|api| *api)
            .map_err(|_| PipeError::ApiTypeMismatch {
                name: name.to_string(),
                expected: type_name::<T>(),
            })
    }

    /// Whether an API with this name is registered.
    pub fn has_api(&self, name: &str) -> bool {
        self.inner.apis.contains_key(name)
    }

    /// Number of factories, before nested pipelines are inlined.
    pub fn len(&self) -> usize {
        self.inner.factories.len()
    }

    /// Whether the pipeline has no factories.
    pub fn is_empty(&self) -> bool {
        self.inner.factories.is_empty()
    }

    pub(crate) fn factories(&self) -> &[StageFactory] {
        &self.inner.factories
    }
}

impl fmt::Debug for Pipeline {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Pipeline")
            .field("factories", &self.inner.factories.len())
            .field("apis", &self.inner.apis.keys().collect::<Vec<_>>())
            .field("decorators", &self.inner.decorators.len())
            .finish()
    }
}

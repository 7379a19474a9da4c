//! Builder patterns for ergonomic unit construction (v0.1)
//!
//! The named constructors (`task`, `resource`, `event`, `hook`, the two
//! middleware flavors, `tag`) are the authoring surface: fluent builders
//! that validate the syntactic contract at `build()` and hand back an
//! `Arc`'d definition ready for registration.

use std::future::Future;
use std::sync::Arc;

use serde_json::Value;
use thiserror::Error;

use crate::error::{FixHint, WeftError};
use crate::events::EventEnvelope;
use crate::kernel::Deps;
use crate::schema::Schema;
use crate::tag::Tag;
use crate::types::{Meta, UnitId, UnitIdError};
use crate::unit::{
    DependencyRef, DependencySpec, EventDef, EverywhereSpec, HookDef, HookTarget, InitCall,
    MiddlewareAttachment, Registration, RegisterSpec, ResourceDef, ResourceMiddlewareDef,
    ResourceValue, TaskCall, TaskDef, TaskMiddlewareDef, UnitDef,
};

// ============================================================================
// BUILDER ERROR
// ============================================================================

/// Errors raised when a constructor is misused
#[derive(Debug, Error)]
pub enum BuilderError {
    #[error("invalid id '{id}': {source}")]
    InvalidId {
        id: String,
        #[source]
        source: UnitIdError,
    },

    #[error("task '{0}' has no run function")]
    MissingRun(String),

    #[error("hook '{0}' has no run function")]
    MissingHookRun(String),

    #[error("hook '{0}' has no `on` target")]
    MissingHookTarget(String),

    #[error("middleware '{0}' has no run function")]
    MissingMiddlewareRun(String),

    #[error("unit '{id}': invalid {which} schema: {reason}")]
    InvalidSchema {
        id: String,
        which: &'static str,
        reason: String,
    },
}

impl FixHint for BuilderError {
    fn hint(&self) -> Option<&str> {
        Some(match self {
            BuilderError::InvalidId { .. } => {
                "Use alphanumeric characters, dash, underscore, dot, colon. Max 128 chars"
            }
            BuilderError::MissingRun(_) => "Call .run() or .run_value() before .build()",
            BuilderError::MissingHookRun(_) => "Call .run() before .build()",
            BuilderError::MissingHookTarget(_) => {
                "Call .on_id(), .on_event() or .on_any() before .build()"
            }
            BuilderError::MissingMiddlewareRun(_) => "Call .run() before .build()",
            BuilderError::InvalidSchema { .. } => {
                "Pass a valid JSON Schema document (draft 7 or later)"
            }
        })
    }
}

impl From<BuilderError> for WeftError {
    fn from(err: BuilderError) -> Self {
        let id = match &err {
            BuilderError::InvalidId { id, .. } => id.clone(),
            BuilderError::MissingRun(id)
            | BuilderError::MissingHookRun(id)
            | BuilderError::MissingHookTarget(id)
            | BuilderError::MissingMiddlewareRun(id) => id.clone(),
            BuilderError::InvalidSchema { id, .. } => id.clone(),
        };
        WeftError::DefinitionInvalid {
            id,
            reason: err.to_string(),
        }
    }
}

fn parse_id(raw: &str) -> Result<UnitId, BuilderError> {
    UnitId::new(raw).map_err(|source| BuilderError::InvalidId {
        id: raw.to_string(),
        source,
    })
}

fn compile_schema(
    id: &str,
    which: &'static str,
    raw: Option<Value>,
) -> Result<Option<Schema>, BuilderError> {
    match raw {
        None => Ok(None),
        Some(value) => Schema::compile(value)
            .map(Some)
            .map_err(|e| BuilderError::InvalidSchema {
                id: id.to_string(),
                which,
                reason: e.to_string(),
            }),
    }
}

// ============================================================================
// TASK BUILDER
// ============================================================================

/// Start building a task definition
pub fn task(id: impl Into<String>) -> TaskBuilder {
    TaskBuilder {
        id: id.into(),
        tags: Vec::new(),
        meta: Meta::default(),
        input_schema: None,
        result_schema: None,
        middleware: Vec::new(),
        dependencies: DependencySpec::None,
        on: None,
        listener_order: 0,
        run: None,
    }
}

/// Fluent builder for [`TaskDef`]
pub struct TaskBuilder {
    id: String,
    tags: Vec<Tag>,
    meta: Meta,
    input_schema: Option<Value>,
    result_schema: Option<Value>,
    middleware: Vec<MiddlewareAttachment>,
    dependencies: DependencySpec,
    on: Option<HookTarget>,
    listener_order: i32,
    run: Option<crate::unit::TaskRun>,
}

impl TaskBuilder {
    pub fn tag(mut self, tag: Tag) -> Self {
        self.tags.push(tag);
        self
    }

    pub fn meta(mut self, meta: Meta) -> Self {
        self.meta = meta;
        self
    }

    pub fn input_schema(mut self, schema: Value) -> Self {
        self.input_schema = Some(schema);
        self
    }

    pub fn result_schema(mut self, schema: Value) -> Self {
        self.result_schema = Some(schema);
        self
    }

    /// Attach a middleware (outermost first; authored order is preserved)
    pub fn middleware(mut self, attachment: MiddlewareAttachment) -> Self {
        self.middleware.push(attachment);
        self
    }

    /// Declare literal dependencies
    pub fn depends_on(mut self, refs: Vec<DependencyRef>) -> Self {
        self.dependencies = DependencySpec::Static(refs);
        self
    }

    /// Declare function-valued dependencies (evaluated once at boot)
    pub fn dependencies_with(
        mut self,
        f: impl Fn() -> Vec<DependencyRef> + Send + Sync + 'static,
    ) -> Self {
        self.dependencies = DependencySpec::Deferred(Arc::new(f));
        self
    }

    /// Also act as a hook for the given event
    pub fn on_event(mut self, event: &Arc<EventDef>) -> Self {
        self.on = Some(match self.on.take() {
            None => HookTarget::Event(event.id.clone()),
            Some(HookTarget::Event(prev)) => HookTarget::Events(vec![prev, event.id.clone()]),
            Some(HookTarget::Events(mut ids)) => {
                ids.push(event.id.clone());
                HookTarget::Events(ids)
            }
            Some(HookTarget::All) => HookTarget::All,
            Some(HookTarget::Tagged(tag)) => HookTarget::Tagged(tag),
        });
        self
    }

    /// Also act as a wildcard hook (`"*"`)
    pub fn on_any(mut self) -> Self {
        self.on = Some(HookTarget::All);
        self
    }

    /// Listener ordering when `on` is set (smaller runs earlier)
    pub fn listener_order(mut self, order: i32) -> Self {
        self.listener_order = order;
        self
    }

    /// The async task body
    pub fn run<F, Fut>(mut self, f: F) -> Self
    where
        F: Fn(Value, Deps) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = anyhow::Result<Value>> + Send + 'static,
    {
        self.run = Some(Arc::new(move |input, deps| Box::pin(f(input, deps))));
        self
    }

    /// Synchronous task body sugar
    pub fn run_value<F>(mut self, f: F) -> Self
    where
        F: Fn(Value, Deps) -> anyhow::Result<Value> + Send + Sync + 'static,
    {
        self.run = Some(Arc::new(move |input, deps| {
            let out = f(input, deps);
            Box::pin(async move { out })
        }));
        self
    }

    pub fn build(self) -> Result<Arc<TaskDef>, BuilderError> {
        let id = parse_id(&self.id)?;
        let run = self.run.ok_or_else(|| BuilderError::MissingRun(self.id.clone()))?;
        Ok(Arc::new(TaskDef {
            input_schema: compile_schema(&self.id, "input", self.input_schema)?,
            result_schema: compile_schema(&self.id, "result", self.result_schema)?,
            id,
            tags: self.tags,
            meta: self.meta,
            middleware: self.middleware,
            dependencies: self.dependencies,
            on: self.on,
            listener_order: self.listener_order,
            run,
        }))
    }
}

// ============================================================================
// RESOURCE BUILDER
// ============================================================================

/// Start building a resource definition
pub fn resource(id: impl Into<String>) -> ResourceBuilder {
    ResourceBuilder {
        id: id.into(),
        tags: Vec::new(),
        meta: Meta::default(),
        config_schema: None,
        register: RegisterSpec::None,
        overrides: Vec::new(),
        middleware: Vec::new(),
        exports: None,
        dependencies: DependencySpec::None,
        init: None,
        dispose: None,
        private_context: None,
    }
}

/// Fluent builder for [`ResourceDef`]
pub struct ResourceBuilder {
    id: String,
    tags: Vec<Tag>,
    meta: Meta,
    config_schema: Option<Value>,
    register: RegisterSpec,
    overrides: Vec<Registration>,
    middleware: Vec<MiddlewareAttachment>,
    exports: Option<Vec<UnitId>>,
    dependencies: DependencySpec,
    init: Option<crate::unit::ResourceInit>,
    dispose: Option<crate::unit::ResourceDispose>,
    private_context: Option<crate::unit::PrivateContextFn>,
}

impl ResourceBuilder {
    pub fn tag(mut self, tag: Tag) -> Self {
        self.tags.push(tag);
        self
    }

    pub fn meta(mut self, meta: Meta) -> Self {
        self.meta = meta;
        self
    }

    pub fn config_schema(mut self, schema: Value) -> Self {
        self.config_schema = Some(schema);
        self
    }

    /// Register child units (literal list)
    pub fn register(mut self, items: Vec<Registration>) -> Self {
        self.register = match self.register {
            RegisterSpec::Items(mut existing) => {
                existing.extend(items);
                RegisterSpec::Items(existing)
            }
            _ => RegisterSpec::Items(items),
        };
        self
    }

    /// Register child units via a function (evaluated once at boot)
    pub fn register_with(
        mut self,
        f: impl Fn() -> Vec<Registration> + Send + Sync + 'static,
    ) -> Self {
        self.register = RegisterSpec::Deferred(Arc::new(f));
        self
    }

    /// Override units registered deeper in the tree (matched by id)
    pub fn overrides(mut self, items: Vec<Registration>) -> Self {
        self.overrides = items;
        self
    }

    /// Attach a resource middleware around `init`
    pub fn middleware(mut self, attachment: MiddlewareAttachment) -> Self {
        self.middleware.push(attachment);
        self
    }

    /// Restrict what is visible outside this resource
    pub fn exports(mut self, ids: Vec<UnitId>) -> Self {
        self.exports = Some(ids);
        self
    }

    pub fn depends_on(mut self, refs: Vec<DependencyRef>) -> Self {
        self.dependencies = DependencySpec::Static(refs);
        self
    }

    pub fn dependencies_with(
        mut self,
        f: impl Fn() -> Vec<DependencyRef> + Send + Sync + 'static,
    ) -> Self {
        self.dependencies = DependencySpec::Deferred(Arc::new(f));
        self
    }

    /// The async init body; its output becomes the resource value
    pub fn init<F, Fut, T>(mut self, f: F) -> Self
    where
        F: Fn(Value, Deps) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = anyhow::Result<T>> + Send + 'static,
        T: Send + Sync + 'static,
    {
        self.init = Some(Arc::new(move |config, deps| {
            let fut = f(config, deps);
            Box::pin(async move { Ok(Arc::new(fut.await?) as ResourceValue) })
        }));
        self
    }

    /// The async dispose body
    pub fn dispose<F, Fut>(mut self, f: F) -> Self
    where
        F: Fn(ResourceValue, Value, Deps) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = anyhow::Result<()>> + Send + 'static,
    {
        self.dispose = Some(Arc::new(move |value, config, deps| {
            Box::pin(f(value, config, deps))
        }));
        self
    }

    /// Private context shared between `init` and `dispose`
    pub fn private_context<F, T>(mut self, f: F) -> Self
    where
        F: Fn() -> T + Send + Sync + 'static,
        T: Send + Sync + 'static,
    {
        self.private_context = Some(Arc::new(move || Arc::new(f()) as ResourceValue));
        self
    }

    pub fn build(self) -> Result<Arc<ResourceDef>, BuilderError> {
        let id = parse_id(&self.id)?;
        Ok(Arc::new(ResourceDef {
            config_schema: compile_schema(&self.id, "config", self.config_schema)?,
            id,
            tags: self.tags,
            meta: self.meta,
            register: self.register,
            overrides: self.overrides,
            middleware: self.middleware,
            exports: self.exports,
            dependencies: self.dependencies,
            init: self.init,
            dispose: self.dispose,
            private_context: self.private_context,
        }))
    }
}

// ============================================================================
// EVENT BUILDER
// ============================================================================

/// Start building an event definition
pub fn event(id: impl Into<String>) -> EventBuilder {
    EventBuilder {
        id: id.into(),
        tags: Vec::new(),
        meta: Meta::default(),
        payload_schema: None,
    }
}

/// Fluent builder for [`EventDef`]
pub struct EventBuilder {
    id: String,
    tags: Vec<Tag>,
    meta: Meta,
    payload_schema: Option<Value>,
}

impl EventBuilder {
    pub fn tag(mut self, tag: Tag) -> Self {
        self.tags.push(tag);
        self
    }

    pub fn meta(mut self, meta: Meta) -> Self {
        self.meta = meta;
        self
    }

    pub fn payload_schema(mut self, schema: Value) -> Self {
        self.payload_schema = Some(schema);
        self
    }

    pub fn build(self) -> Result<Arc<EventDef>, BuilderError> {
        let id = parse_id(&self.id)?;
        Ok(Arc::new(EventDef {
            payload_schema: compile_schema(&self.id, "payload", self.payload_schema)?,
            id,
            tags: self.tags,
            meta: self.meta,
        }))
    }
}

// ============================================================================
// HOOK BUILDER
// ============================================================================

/// Start building a hook definition
pub fn hook(id: impl Into<String>) -> HookBuilder {
    HookBuilder {
        id: id.into(),
        tags: Vec::new(),
        meta: Meta::default(),
        on: None,
        order: 0,
        emits_same_event: false,
        dependencies: DependencySpec::None,
        run: None,
    }
}

/// Fluent builder for [`HookDef`]
pub struct HookBuilder {
    id: String,
    tags: Vec<Tag>,
    meta: Meta,
    on: Option<HookTarget>,
    order: i32,
    emits_same_event: bool,
    dependencies: DependencySpec,
    run: Option<crate::unit::HookRun>,
}

impl HookBuilder {
    pub fn tag(mut self, tag: Tag) -> Self {
        self.tags.push(tag);
        self
    }

    pub fn meta(mut self, meta: Meta) -> Self {
        self.meta = meta;
        self
    }

    pub fn on_event(self, event: &Arc<EventDef>) -> Self {
        self.on_id(event.id.clone())
    }

    pub fn on_id(mut self, id: UnitId) -> Self {
        self.on = Some(match self.on.take() {
            None => HookTarget::Event(id),
            Some(HookTarget::Event(prev)) => HookTarget::Events(vec![prev, id]),
            Some(HookTarget::Events(mut ids)) => {
                ids.push(id);
                HookTarget::Events(ids)
            }
            Some(HookTarget::All) => HookTarget::All,
            Some(HookTarget::Tagged(tag)) => HookTarget::Tagged(tag),
        });
        self
    }

    /// Listen to every event carrying the tag
    pub fn on_tag(mut self, tag: &Tag) -> Self {
        self.on = Some(HookTarget::Tagged(tag.id.clone()));
        self
    }

    /// Listen to every event except framework-internal ones
    pub fn on_any(mut self) -> Self {
        self.on = Some(HookTarget::All);
        self
    }

    /// Smaller runs earlier; default 0
    pub fn order(mut self, order: i32) -> Self {
        self.order = order;
        self
    }

    /// Idempotency marker permitting one level of same-event re-emission
    pub fn emits_same_event(mut self) -> Self {
        self.emits_same_event = true;
        self
    }

    pub fn depends_on(mut self, refs: Vec<DependencyRef>) -> Self {
        self.dependencies = DependencySpec::Static(refs);
        self
    }

    pub fn run<F, Fut>(mut self, f: F) -> Self
    where
        F: Fn(EventEnvelope, Deps) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = anyhow::Result<()>> + Send + 'static,
    {
        self.run = Some(Arc::new(move |event, deps| Box::pin(f(event, deps))));
        self
    }

    pub fn build(self) -> Result<Arc<HookDef>, BuilderError> {
        let id = parse_id(&self.id)?;
        let on = self
            .on
            .ok_or_else(|| BuilderError::MissingHookTarget(self.id.clone()))?;
        let run = self
            .run
            .ok_or_else(|| BuilderError::MissingHookRun(self.id.clone()))?;
        Ok(Arc::new(HookDef {
            id,
            tags: self.tags,
            meta: self.meta,
            on,
            order: self.order,
            emits_same_event: self.emits_same_event,
            dependencies: self.dependencies,
            run,
        }))
    }
}

// ============================================================================
// MIDDLEWARE BUILDERS
// ============================================================================

/// Start building a task middleware definition
pub fn task_middleware(id: impl Into<String>) -> TaskMiddlewareBuilder {
    TaskMiddlewareBuilder {
        id: id.into(),
        tags: Vec::new(),
        meta: Meta::default(),
        config_schema: None,
        everywhere: EverywhereSpec::No,
        dependencies: DependencySpec::None,
        run: None,
    }
}

/// Fluent builder for [`TaskMiddlewareDef`]
pub struct TaskMiddlewareBuilder {
    id: String,
    tags: Vec<Tag>,
    meta: Meta,
    config_schema: Option<Value>,
    everywhere: EverywhereSpec,
    dependencies: DependencySpec,
    run: Option<crate::unit::TaskMiddlewareRun>,
}

impl TaskMiddlewareBuilder {
    pub fn tag(mut self, tag: Tag) -> Self {
        self.tags.push(tag);
        self
    }

    pub fn config_schema(mut self, schema: Value) -> Self {
        self.config_schema = Some(schema);
        self
    }

    /// Auto-apply to every eligible task in the registering resource's subtree
    pub fn everywhere(mut self) -> Self {
        self.everywhere = EverywhereSpec::All;
        self
    }

    /// Auto-apply where the predicate accepts the unit
    pub fn everywhere_when(
        mut self,
        pred: impl Fn(&UnitDef) -> bool + Send + Sync + 'static,
    ) -> Self {
        self.everywhere = EverywhereSpec::Filter(Arc::new(pred));
        self
    }

    pub fn depends_on(mut self, refs: Vec<DependencyRef>) -> Self {
        self.dependencies = DependencySpec::Static(refs);
        self
    }

    pub fn run<F, Fut>(mut self, f: F) -> Self
    where
        F: Fn(TaskCall, Deps, Value) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<Value, WeftError>> + Send + 'static,
    {
        self.run = Some(Arc::new(move |call, deps, config| {
            Box::pin(f(call, deps, config))
        }));
        self
    }

    pub fn build(self) -> Result<Arc<TaskMiddlewareDef>, BuilderError> {
        let id = parse_id(&self.id)?;
        let run = self
            .run
            .ok_or_else(|| BuilderError::MissingMiddlewareRun(self.id.clone()))?;
        Ok(Arc::new(TaskMiddlewareDef {
            config_schema: compile_schema(&self.id, "config", self.config_schema)?,
            id,
            tags: self.tags,
            meta: self.meta,
            everywhere: self.everywhere,
            dependencies: self.dependencies,
            run,
        }))
    }
}

/// Start building a resource middleware definition
pub fn resource_middleware(id: impl Into<String>) -> ResourceMiddlewareBuilder {
    ResourceMiddlewareBuilder {
        id: id.into(),
        tags: Vec::new(),
        meta: Meta::default(),
        config_schema: None,
        everywhere: EverywhereSpec::No,
        dependencies: DependencySpec::None,
        run: None,
    }
}

/// Fluent builder for [`ResourceMiddlewareDef`]
pub struct ResourceMiddlewareBuilder {
    id: String,
    tags: Vec<Tag>,
    meta: Meta,
    config_schema: Option<Value>,
    everywhere: EverywhereSpec,
    dependencies: DependencySpec,
    run: Option<crate::unit::ResourceMiddlewareRun>,
}

impl ResourceMiddlewareBuilder {
    pub fn tag(mut self, tag: Tag) -> Self {
        self.tags.push(tag);
        self
    }

    pub fn everywhere(mut self) -> Self {
        self.everywhere = EverywhereSpec::All;
        self
    }

    pub fn everywhere_when(
        mut self,
        pred: impl Fn(&UnitDef) -> bool + Send + Sync + 'static,
    ) -> Self {
        self.everywhere = EverywhereSpec::Filter(Arc::new(pred));
        self
    }

    pub fn depends_on(mut self, refs: Vec<DependencyRef>) -> Self {
        self.dependencies = DependencySpec::Static(refs);
        self
    }

    pub fn run<F, Fut>(mut self, f: F) -> Self
    where
        F: Fn(InitCall, Deps, Value) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<ResourceValue, WeftError>> + Send + 'static,
    {
        self.run = Some(Arc::new(move |call, deps, config| {
            Box::pin(f(call, deps, config))
        }));
        self
    }

    pub fn build(self) -> Result<Arc<ResourceMiddlewareDef>, BuilderError> {
        let id = parse_id(&self.id)?;
        let run = self
            .run
            .ok_or_else(|| BuilderError::MissingMiddlewareRun(self.id.clone()))?;
        Ok(Arc::new(ResourceMiddlewareDef {
            config_schema: compile_schema(&self.id, "config", self.config_schema)?,
            id,
            tags: self.tags,
            meta: self.meta,
            everywhere: self.everywhere,
            dependencies: self.dependencies,
            run,
        }))
    }
}

// ============================================================================
// TAG CONSTRUCTOR
// ============================================================================

/// Construct a tag
pub fn tag(id: impl AsRef<str>) -> Result<Tag, BuilderError> {
    let id = parse_id(id.as_ref())?;
    Ok(Tag::new(id))
}

// ============================================================================
// TESTS
// ============================================================================

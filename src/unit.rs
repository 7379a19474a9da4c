//! Unit definitions - the declarative data model (v0.1)
//!
//! The runtime composes a program from seven unit families: Task, Resource,
//! Event, Hook, the two middleware flavors, and Tag. Definitions here are
//! inert descriptors; `boot` walks them into the store and wires them.
//!
//! Function members are `Arc<dyn Fn(..) -> BoxFuture>` so definitions stay
//! cloneable and the same unit can appear in multiple branches of the tree.

use std::any::Any;
use std::fmt;
use std::sync::Arc;

use futures::future::BoxFuture;
use serde_json::Value;

use crate::error::WeftError;
use crate::events::EventEnvelope;
use crate::kernel::Deps;
use crate::schema::Schema;
use crate::tag::Tag;
use crate::types::{Meta, UnitId, UnitKind};

// Shared Debug shape for definitions holding closures.
macro_rules! fmt_def {
    ($name:literal) => {
        fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
            f.debug_struct($name).field("id", &self.id).finish()
        }
    };
}

// ============================================================================
// FUNCTION TYPE ALIASES
// ============================================================================

/// Boxed future shorthand used across all unit function members
pub type BoxFut<T> = BoxFuture<'static, T>;

/// Opaque value produced by a resource's `init`
pub type ResourceValue = Arc<dyn Any + Send + Sync>;

/// `run(input, deps) -> R` - ambient context travels task-locally
pub type TaskRun = Arc<dyn Fn(Value, Deps) -> BoxFut<anyhow::Result<Value>> + Send + Sync>;

/// `init(config, deps) -> V`
pub type ResourceInit =
    Arc<dyn Fn(Value, Deps) -> BoxFut<anyhow::Result<ResourceValue>> + Send + Sync>;

/// `dispose(value, config, deps)`
pub type ResourceDispose =
    Arc<dyn Fn(ResourceValue, Value, Deps) -> BoxFut<anyhow::Result<()>> + Send + Sync>;

/// `context() -> priv` - shared between `init` and `dispose`
pub type PrivateContextFn = Arc<dyn Fn() -> ResourceValue + Send + Sync>;

/// `run(event, deps)`
pub type HookRun = Arc<dyn Fn(EventEnvelope, Deps) -> BoxFut<anyhow::Result<()>> + Send + Sync>;

/// `run({task, input, next}, deps, config) -> R`
pub type TaskMiddlewareRun =
    Arc<dyn Fn(TaskCall, Deps, Value) -> BoxFut<Result<Value, WeftError>> + Send + Sync>;

/// `run({resource, config, next}, deps, config) -> V`
pub type ResourceMiddlewareRun =
    Arc<dyn Fn(InitCall, Deps, Value) -> BoxFut<Result<ResourceValue, WeftError>> + Send + Sync>;

/// Interceptor around a task invocation: `(next, input) -> R`
pub type TaskInterceptor =
    Arc<dyn Fn(Next, Value) -> BoxFut<Result<Value, WeftError>> + Send + Sync>;

/// Interceptor around a resource `init`: `(next, config) -> V`
pub type InitInterceptor =
    Arc<dyn Fn(InitNext, Value) -> BoxFut<Result<ResourceValue, WeftError>> + Send + Sync>;

// ============================================================================
// CONTINUATIONS
// ============================================================================

/// Continuation handed to task middleware and interceptors
///
/// Whatever value is passed to [`Next::invoke`] becomes the input of the
/// rest of the chain - `Value::Null` included.
pub struct Next {
    inner: Box<dyn FnOnce(Value) -> BoxFut<Result<Value, WeftError>> + Send>,
}

impl Next {
    pub fn new(
        f: impl FnOnce(Value) -> BoxFut<Result<Value, WeftError>> + Send + 'static,
    ) -> Self {
        Self { inner: Box::new(f) }
    }

    /// Run the remainder of the chain with `input`
    pub async fn invoke(self, input: Value) -> Result<Value, WeftError> {
        (self.inner)(input).await
    }
}

impl fmt::Debug for Next {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("Next")
    }
}

/// Continuation handed to resource middleware and init interceptors
pub struct InitNext {
    inner: Box<dyn FnOnce(Value) -> BoxFut<Result<ResourceValue, WeftError>> + Send>,
}

impl InitNext {
    pub fn new(
        f: impl FnOnce(Value) -> BoxFut<Result<ResourceValue, WeftError>> + Send + 'static,
    ) -> Self {
        Self { inner: Box::new(f) }
    }

    /// Run the remainder of the init chain with `config`
    pub async fn invoke(self, config: Value) -> Result<ResourceValue, WeftError> {
        (self.inner)(config).await
    }
}

impl fmt::Debug for InitNext {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("InitNext")
    }
}

/// The call object a task middleware receives
#[derive(Debug)]
pub struct TaskCall {
    pub task_id: UnitId,
    pub input: Value,
    pub next: Next,
}

/// The call object a resource middleware receives
#[derive(Debug)]
pub struct InitCall {
    pub resource_id: UnitId,
    pub config: Value,
    pub next: InitNext,
}

// ============================================================================
// DEPENDENCIES
// ============================================================================

/// What family a dependency edge points into
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DepKind {
    Task,
    Resource,
    Event,
}

/// One aliased dependency edge
#[derive(Debug, Clone)]
pub struct DependencyRef {
    pub alias: String,
    pub id: UnitId,
    pub kind: DepKind,
}

impl DependencyRef {
    pub fn task(alias: impl Into<String>, id: UnitId) -> Self {
        Self {
            alias: alias.into(),
            id,
            kind: DepKind::Task,
        }
    }

    pub fn resource(alias: impl Into<String>, id: UnitId) -> Self {
        Self {
            alias: alias.into(),
            id,
            kind: DepKind::Resource,
        }
    }

    pub fn event(alias: impl Into<String>, id: UnitId) -> Self {
        Self {
            alias: alias.into(),
            id,
            kind: DepKind::Event,
        }
    }
}

/// A unit's dependency declaration: empty, literal, or function-valued
/// (evaluated exactly once at boot under the lazy-realization guard)
#[derive(Clone, Default)]
pub enum DependencySpec {
    #[default]
    None,
    Static(Vec<DependencyRef>),
    Deferred(Arc<dyn Fn() -> Vec<DependencyRef> + Send + Sync>),
}

impl DependencySpec {
    /// Realize the declaration; boot stores the result and never calls again
    pub(crate) fn realize(&self) -> Vec<DependencyRef> {
        match self {
            DependencySpec::None => Vec::new(),
            DependencySpec::Static(refs) => refs.clone(),
            DependencySpec::Deferred(f) => f(),
        }
    }
}

impl fmt::Debug for DependencySpec {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            DependencySpec::None => f.write_str("DependencySpec::None"),
            DependencySpec::Static(refs) => f.debug_tuple("Static").field(refs).finish(),
            DependencySpec::Deferred(_) => f.write_str("DependencySpec::Deferred(..)"),
        }
    }
}

// ============================================================================
// HOOK TARGETS
// ============================================================================

/// What a hook (or a task with `on`) listens to
#[derive(Clone, Debug)]
pub enum HookTarget {
    Event(UnitId),
    Events(Vec<UnitId>),
    /// Every event carrying the tag
    Tagged(UnitId),
    /// `"*"` - every event except framework-internal ones
    All,
}

impl HookTarget {
    pub(crate) fn event_ids(&self) -> Vec<UnitId> {
        match self {
            HookTarget::Event(id) => vec![id.clone()],
            HookTarget::Events(ids) => ids.clone(),
            HookTarget::Tagged(_) | HookTarget::All => Vec::new(),
        }
    }

    pub(crate) fn tag_id(&self) -> Option<&UnitId> {
        match self {
            HookTarget::Tagged(tag) => Some(tag),
            _ => None,
        }
    }

    pub(crate) fn is_wildcard(&self) -> bool {
        matches!(self, HookTarget::All)
    }
}

// ============================================================================
// MIDDLEWARE ATTACHMENTS
// ============================================================================

/// A middleware reference on a task/resource, with per-attachment config
#[derive(Debug, Clone)]
pub struct MiddlewareAttachment {
    pub id: UnitId,
    pub config: Value,
}

/// Auto-application scope of a middleware
#[derive(Clone, Default)]
pub enum EverywhereSpec {
    #[default]
    No,
    /// Apply to every eligible unit in the registering resource's subtree
    All,
    /// Apply where the predicate accepts the unit
    Filter(Arc<dyn Fn(&UnitDef) -> bool + Send + Sync>),
}

impl EverywhereSpec {
    pub(crate) fn applies_to(&self, unit: &UnitDef) -> bool {
        match self {
            EverywhereSpec::No => false,
            EverywhereSpec::All => true,
            EverywhereSpec::Filter(pred) => pred(unit),
        }
    }
}

impl fmt::Debug for EverywhereSpec {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            EverywhereSpec::No => f.write_str("EverywhereSpec::No"),
            EverywhereSpec::All => f.write_str("EverywhereSpec::All"),
            EverywhereSpec::Filter(_) => f.write_str("EverywhereSpec::Filter(..)"),
        }
    }
}

// ============================================================================
// DEFINITIONS
// ============================================================================

/// Task definition
#[derive(Clone)]
pub struct TaskDef {
    pub id: UnitId,
    pub tags: Vec<Tag>,
    pub meta: Meta,
    pub input_schema: Option<Schema>,
    pub result_schema: Option<Schema>,
    pub middleware: Vec<MiddlewareAttachment>,
    pub dependencies: DependencySpec,
    /// When set the task also acts as a hook for the target events; the
    /// event envelope (as JSON) becomes the task input.
    pub on: Option<HookTarget>,
    /// Listener ordering when `on` is set (smaller runs earlier)
    pub listener_order: i32,
    pub run: TaskRun,
}

impl TaskDef {
    /// Id of the companion event emitted when this task errors
    pub fn on_error_id(&self) -> UnitId {
        self.id.companion("onError")
    }

    /// Id of the companion event emitted after a successful run
    pub fn after_run_id(&self) -> UnitId {
        self.id.companion("afterRun")
    }
}

impl fmt::Debug for TaskDef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TaskDef")
            .field("id", &self.id)
            .field("middleware", &self.middleware)
            .finish()
    }
}

/// What a resource's `register` contributes: literal or function-valued
/// (evaluated exactly once at boot)
#[derive(Clone, Default)]
pub enum RegisterSpec {
    #[default]
    None,
    Items(Vec<Registration>),
    Deferred(Arc<dyn Fn() -> Vec<Registration> + Send + Sync>),
}

impl RegisterSpec {
    pub(crate) fn realize(&self) -> Vec<Registration> {
        match self {
            RegisterSpec::None => Vec::new(),
            RegisterSpec::Items(items) => items.clone(),
            RegisterSpec::Deferred(f) => f(),
        }
    }
}

impl fmt::Debug for RegisterSpec {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            RegisterSpec::None => f.write_str("RegisterSpec::None"),
            RegisterSpec::Items(items) => f.debug_tuple("Items").field(&items.len()).finish(),
            RegisterSpec::Deferred(_) => f.write_str("RegisterSpec::Deferred(..)"),
        }
    }
}

/// Resource definition
#[derive(Clone)]
pub struct ResourceDef {
    pub id: UnitId,
    pub tags: Vec<Tag>,
    pub meta: Meta,
    pub config_schema: Option<Schema>,
    pub register: RegisterSpec,
    pub overrides: Vec<Registration>,
    pub middleware: Vec<MiddlewareAttachment>,
    /// `None` - everything registered is exported to the parent.
    /// `Some(vec![])` - nothing is visible outside this resource.
    pub exports: Option<Vec<UnitId>>,
    pub dependencies: DependencySpec,
    pub init: Option<ResourceInit>,
    pub dispose: Option<ResourceDispose>,
    pub private_context: Option<PrivateContextFn>,
}

impl ResourceDef {
    /// Bind config at registration time (`Resource.with(config)`)
    pub fn with(self: &Arc<Self>, config: Value) -> Registration {
        Registration {
            unit: UnitDef::Resource(self.clone()),
            config: Some(config),
        }
    }
}

impl fmt::Debug for ResourceDef {
    fmt_def!("ResourceDef");
}

/// Event definition
#[derive(Clone)]
pub struct EventDef {
    pub id: UnitId,
    pub tags: Vec<Tag>,
    pub meta: Meta,
    pub payload_schema: Option<Schema>,
}

impl fmt::Debug for EventDef {
    fmt_def!("EventDef");
}

/// Hook definition
#[derive(Clone)]
pub struct HookDef {
    pub id: UnitId,
    pub tags: Vec<Tag>,
    pub meta: Meta,
    pub on: HookTarget,
    /// Smaller runs earlier; default 0
    pub order: i32,
    /// Idempotency marker: permits this hook to re-emit the event it is
    /// currently handling (one level deep) without tripping the cycle guard.
    pub emits_same_event: bool,
    pub dependencies: DependencySpec,
    pub run: HookRun,
}

impl fmt::Debug for HookDef {
    fmt_def!("HookDef");
}

/// Task middleware definition
#[derive(Clone)]
pub struct TaskMiddlewareDef {
    pub id: UnitId,
    pub tags: Vec<Tag>,
    pub meta: Meta,
    pub config_schema: Option<Schema>,
    pub everywhere: EverywhereSpec,
    pub dependencies: DependencySpec,
    pub run: TaskMiddlewareRun,
}

impl TaskMiddlewareDef {
    /// Attach without config
    pub fn attach(self: &Arc<Self>) -> MiddlewareAttachment {
        MiddlewareAttachment {
            id: self.id.clone(),
            config: Value::Null,
        }
    }

    /// Attach with per-attachment config (`Middleware.with(config)`)
    pub fn attach_with(self: &Arc<Self>, config: Value) -> MiddlewareAttachment {
        MiddlewareAttachment {
            id: self.id.clone(),
            config,
        }
    }
}

impl fmt::Debug for TaskMiddlewareDef {
    fmt_def!("TaskMiddlewareDef");
}

/// Resource middleware definition
#[derive(Clone)]
pub struct ResourceMiddlewareDef {
    pub id: UnitId,
    pub tags: Vec<Tag>,
    pub meta: Meta,
    pub config_schema: Option<Schema>,
    pub everywhere: EverywhereSpec,
    pub dependencies: DependencySpec,
    pub run: ResourceMiddlewareRun,
}

impl ResourceMiddlewareDef {
    pub fn attach(self: &Arc<Self>) -> MiddlewareAttachment {
        MiddlewareAttachment {
            id: self.id.clone(),
            config: Value::Null,
        }
    }

    pub fn attach_with(self: &Arc<Self>, config: Value) -> MiddlewareAttachment {
        MiddlewareAttachment {
            id: self.id.clone(),
            config,
        }
    }
}

impl fmt::Debug for ResourceMiddlewareDef {
    fmt_def!("ResourceMiddlewareDef");
}

// ============================================================================
// POLYMORPHIC UNIT + REGISTRATION
// ============================================================================

/// Any unit, as stored in registries and walked by boot
#[derive(Debug, Clone)]
pub enum UnitDef {
    Task(Arc<TaskDef>),
    Resource(Arc<ResourceDef>),
    Event(Arc<EventDef>),
    Hook(Arc<HookDef>),
    TaskMiddleware(Arc<TaskMiddlewareDef>),
    ResourceMiddleware(Arc<ResourceMiddlewareDef>),
    Tag(Tag),
}

impl UnitDef {
    pub fn id(&self) -> &UnitId {
        match self {
            UnitDef::Task(d) => &d.id,
            UnitDef::Resource(d) => &d.id,
            UnitDef::Event(d) => &d.id,
            UnitDef::Hook(d) => &d.id,
            UnitDef::TaskMiddleware(d) => &d.id,
            UnitDef::ResourceMiddleware(d) => &d.id,
            UnitDef::Tag(t) => &t.id,
        }
    }

    pub fn kind(&self) -> UnitKind {
        match self {
            UnitDef::Task(_) => UnitKind::Task,
            UnitDef::Resource(_) => UnitKind::Resource,
            UnitDef::Event(_) => UnitKind::Event,
            UnitDef::Hook(_) => UnitKind::Hook,
            UnitDef::TaskMiddleware(_) => UnitKind::TaskMiddleware,
            UnitDef::ResourceMiddleware(_) => UnitKind::ResourceMiddleware,
            UnitDef::Tag(_) => UnitKind::Tag,
        }
    }

    pub fn tags(&self) -> &[Tag] {
        match self {
            UnitDef::Task(d) => &d.tags,
            UnitDef::Resource(d) => &d.tags,
            UnitDef::Event(d) => &d.tags,
            UnitDef::Hook(d) => &d.tags,
            UnitDef::TaskMiddleware(d) => &d.tags,
            UnitDef::ResourceMiddleware(d) => &d.tags,
            UnitDef::Tag(_) => &[],
        }
    }

    /// The dependency declaration of this unit, when its family has one
    pub(crate) fn dependencies(&self) -> Option<&DependencySpec> {
        match self {
            UnitDef::Task(d) => Some(&d.dependencies),
            UnitDef::Resource(d) => Some(&d.dependencies),
            UnitDef::Hook(d) => Some(&d.dependencies),
            UnitDef::TaskMiddleware(d) => Some(&d.dependencies),
            UnitDef::ResourceMiddleware(d) => Some(&d.dependencies),
            UnitDef::Event(_) | UnitDef::Tag(_) => None,
        }
    }
}

/// A registration entry: a unit, possibly with config bound at
/// registration time (`Resource.with(config)`)
#[derive(Debug, Clone)]
pub struct Registration {
    pub unit: UnitDef,
    pub config: Option<Value>,
}

impl Registration {
    pub fn id(&self) -> &UnitId {
        self.unit.id()
    }
}

impl From<UnitDef> for Registration {
    fn from(unit: UnitDef) -> Self {
        Registration { unit, config: None }
    }
}

impl From<Arc<TaskDef>> for Registration {
    fn from(def: Arc<TaskDef>) -> Self {
        UnitDef::Task(def).into()
    }
}

impl From<Arc<ResourceDef>> for Registration {
    fn from(def: Arc<ResourceDef>) -> Self {
        UnitDef::Resource(def).into()
    }
}

impl From<Arc<EventDef>> for Registration {
    fn from(def: Arc<EventDef>) -> Self {
        UnitDef::Event(def).into()
    }
}

impl From<Arc<HookDef>> for Registration {
    fn from(def: Arc<HookDef>) -> Self {
        UnitDef::Hook(def).into()
    }
}

impl From<Arc<TaskMiddlewareDef>> for Registration {
    fn from(def: Arc<TaskMiddlewareDef>) -> Self {
        UnitDef::TaskMiddleware(def).into()
    }
}

impl From<Arc<ResourceMiddlewareDef>> for Registration {
    fn from(def: Arc<ResourceMiddlewareDef>) -> Self {
        UnitDef::ResourceMiddleware(def).into()
    }
}

impl From<Tag> for Registration {
    fn from(tag: Tag) -> Self {
        UnitDef::Tag(tag).into()
    }
}

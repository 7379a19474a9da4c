//! Shared runtime state (v0.1)
//!
//! The kernel is the runtime snapshot boot produces: the unit store,
//! resource values, private contexts, interceptor tables, the frozen
//! subscription table, and the init order the disposer walks in reverse.
//! Components (`EventManager`, `TaskRunner`, the surface) are thin wrappers
//! over an `Arc<Kernel>`.

use std::any::Any;
use std::future::Future;
use std::sync::atomic::{AtomicBool, AtomicU8, Ordering};
use std::sync::Arc;

use dashmap::DashMap;
use parking_lot::Mutex;
use serde_json::Value;

use crate::boot::BootOptions;
use crate::error::WeftError;
use crate::events::{EventManager, SubscriptionTable};
use crate::store::UnitStore;
use crate::task_runner::TaskRunner;
use crate::types::UnitId;
use crate::unit::{
    DepKind, DependencyRef, InitInterceptor, InitNext, Next, ResourceValue, TaskInterceptor,
};

// ============================================================================
// PHASE
// ============================================================================

/// Boot state machine; interceptors may only be attached while initializing
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum Phase {
    DryRun = 0,
    Initializing = 1,
    Ready = 2,
    Disposed = 3,
}

impl Phase {
    fn from_u8(v: u8) -> Phase {
        match v {
            0 => Phase::DryRun,
            1 => Phase::Initializing,
            2 => Phase::Ready,
            _ => Phase::Disposed,
        }
    }
}

// ============================================================================
// KERNEL
// ============================================================================

/// The runtime snapshot shared by every component
pub struct Kernel {
    pub(crate) store: UnitStore,
    pub(crate) root: UnitId,
    pub(crate) options: BootOptions,
    /// Resource values, present only for resources whose `init` ran
    pub(crate) values: DashMap<UnitId, ResourceValue>,
    /// Private contexts shared between `init` and `dispose`
    pub(crate) private_contexts: DashMap<UnitId, ResourceValue>,
    /// Resource ids in the order they initialized; dispose walks in reverse
    pub(crate) init_order: Mutex<Vec<UnitId>>,
    /// Full topological resource order (drives lazy init)
    pub(crate) topo_order: Vec<UnitId>,
    /// Realized dependency lists, frozen at boot
    pub(crate) resolved_deps: DashMap<UnitId, Arc<Vec<DependencyRef>>>,
    /// Per-task interceptors, appended only during init
    pub(crate) task_interceptors: DashMap<UnitId, Vec<TaskInterceptor>>,
    /// Per-resource init interceptors, appended only during init
    pub(crate) init_interceptors: DashMap<UnitId, Vec<InitInterceptor>>,
    /// Per-task set of resource ids that called `.intercept()` (unique,
    /// registration order)
    pub(crate) intercepting_resources: DashMap<UnitId, Vec<UnitId>>,
    /// Effective middleware per task (authored + everywhere-expanded),
    /// computed at boot
    pub(crate) task_middleware: DashMap<UnitId, Arc<Vec<crate::unit::MiddlewareAttachment>>>,
    /// Effective middleware per resource, computed at boot
    pub(crate) resource_middleware: DashMap<UnitId, Arc<Vec<crate::unit::MiddlewareAttachment>>>,
    /// Frozen at boot; runtime subscription is not supported
    pub(crate) subscriptions: SubscriptionTable,
    /// Root `exports` list, when declared (surface enforcement)
    pub(crate) root_exports: Option<Vec<UnitId>>,
    /// Resource → resource dependency edges (parallel waves, lazy init)
    pub(crate) resource_edges: std::collections::HashMap<UnitId, Vec<UnitId>>,
    /// (consumer, target) pairs whose visibility violation is raised at
    /// first consumption instead of boot (override-through-gate rule)
    pub(crate) deferred_violations: std::collections::HashSet<(UnitId, UnitId)>,
    phase: AtomicU8,
    /// Guards double-dispose
    pub(crate) dispose_started: AtomicBool,
    /// Serializes lazy initialization
    pub(crate) lazy_lock: tokio::sync::Mutex<()>,
}

/// Everything boot computes before the kernel freezes
pub(crate) struct KernelConfig {
    pub store: UnitStore,
    pub root: UnitId,
    pub options: BootOptions,
    pub topo_order: Vec<UnitId>,
    pub resource_edges: std::collections::HashMap<UnitId, Vec<UnitId>>,
    pub resolved_deps: DashMap<UnitId, Arc<Vec<DependencyRef>>>,
    pub subscriptions: SubscriptionTable,
    pub root_exports: Option<Vec<UnitId>>,
    pub deferred_violations: std::collections::HashSet<(UnitId, UnitId)>,
    pub phase: Phase,
}

impl Kernel {
    pub(crate) fn new(cfg: KernelConfig) -> Self {
        Self {
            store: cfg.store,
            root: cfg.root,
            options: cfg.options,
            values: DashMap::new(),
            private_contexts: DashMap::new(),
            init_order: Mutex::new(Vec::new()),
            topo_order: cfg.topo_order,
            resolved_deps: cfg.resolved_deps,
            task_interceptors: DashMap::new(),
            init_interceptors: DashMap::new(),
            intercepting_resources: DashMap::new(),
            task_middleware: DashMap::new(),
            resource_middleware: DashMap::new(),
            subscriptions: cfg.subscriptions,
            root_exports: cfg.root_exports,
            resource_edges: cfg.resource_edges,
            deferred_violations: cfg.deferred_violations,
            phase: AtomicU8::new(cfg.phase as u8),
            dispose_started: AtomicBool::new(false),
            lazy_lock: tokio::sync::Mutex::new(()),
        }
    }

    pub(crate) fn phase(&self) -> Phase {
        Phase::from_u8(self.phase.load(Ordering::SeqCst))
    }

    pub(crate) fn set_phase(&self, phase: Phase) {
        self.phase.store(phase as u8, Ordering::SeqCst);
    }

    /// Interceptors attach during init; lazy mode keeps the window open
    /// because resources initialize on first access, after boot.
    fn interceptors_open(&self) -> bool {
        match self.phase() {
            Phase::Initializing => true,
            Phase::Ready => self.options.lazy,
            Phase::DryRun | Phase::Disposed => false,
        }
    }

    pub(crate) fn ensure_live(&self) -> Result<(), WeftError> {
        if self.phase() == Phase::Disposed {
            return Err(WeftError::Disposed);
        }
        Ok(())
    }

    /// The initialized value of a resource
    pub(crate) fn value_of(&self, id: &UnitId) -> Result<ResourceValue, WeftError> {
        self.values
            .get(id)
            .map(|v| v.clone())
            .ok_or_else(|| WeftError::NotInitialized { id: id.clone() })
    }

    /// Build the deps handle for a unit, from its frozen dependency list
    pub(crate) fn deps_for(self: &Arc<Self>, unit: &UnitId) -> Deps {
        let entries = self
            .resolved_deps
            .get(unit)
            .map(|e| e.clone())
            .unwrap_or_else(|| Arc::new(Vec::new()));
        Deps {
            kernel: self.clone(),
            consumer: unit.clone(),
            entries,
            private: None,
        }
    }

    /// Same as [`deps_for`], with the resource's private context attached
    pub(crate) fn deps_for_resource(self: &Arc<Self>, unit: &UnitId) -> Deps {
        let mut deps = self.deps_for(unit);
        deps.private = self.private_contexts.get(unit).map(|v| v.clone());
        deps
    }

    pub(crate) fn add_task_interceptor(
        &self,
        task: &UnitId,
        by: &UnitId,
        interceptor: TaskInterceptor,
    ) -> Result<(), WeftError> {
        if !self.interceptors_open() {
            return Err(WeftError::DefinitionInvalid {
                id: task.to_string(),
                reason: "interceptors may only be attached during a resource's init".into(),
            });
        }
        self.task_interceptors
            .entry(task.clone())
            .or_default()
            .push(interceptor);
        let mut by_list = self
            .intercepting_resources
            .entry(task.clone())
            .or_default();
        if !by_list.contains(by) {
            by_list.push(by.clone());
        }
        Ok(())
    }

    pub(crate) fn add_init_interceptor(
        &self,
        resource: &UnitId,
        interceptor: InitInterceptor,
    ) -> Result<(), WeftError> {
        if !self.interceptors_open() {
            return Err(WeftError::DefinitionInvalid {
                id: resource.to_string(),
                reason: "interceptors may only be attached during a resource's init".into(),
            });
        }
        self.init_interceptors
            .entry(resource.clone())
            .or_default()
            .push(interceptor);
        Ok(())
    }
}

impl std::fmt::Debug for Kernel {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Kernel")
            .field("root", &self.root)
            .field("units", &self.store.len())
            .field("phase", &self.phase())
            .finish()
    }
}

// ============================================================================
// DEPS
// ============================================================================

/// The wired dependencies handed to a unit's function members
///
/// Every alias was resolved and visibility-checked at boot; lookups here
/// only fail when user code asks for an alias it never declared or with
/// the wrong family.
#[derive(Clone)]
pub struct Deps {
    kernel: Arc<Kernel>,
    consumer: UnitId,
    entries: Arc<Vec<DependencyRef>>,
    private: Option<ResourceValue>,
}

impl Deps {
    fn entry(&self, alias: &str, kind: DepKind) -> Result<&DependencyRef, WeftError> {
        let found = self.entries.iter().find(|d| d.alias == alias);
        if let Some(dep) = found {
            // Overridden-through-a-gate ids boot fine and fail here, at
            // first consumption.
            let key = (self.consumer.clone(), dep.id.clone());
            if self.kernel.deferred_violations.contains(&key) {
                return Err(WeftError::VisibilityViolation {
                    target: dep.id.clone(),
                    owner: self
                        .kernel
                        .store
                        .owner_of(&dep.id)
                        .unwrap_or_else(|| self.kernel.root.clone()),
                    consumer: self.consumer.clone(),
                });
            }
        }
        match found {
            Some(dep) if dep.kind == kind => Ok(dep),
            Some(dep) => Err(WeftError::DefinitionInvalid {
                id: self.consumer.to_string(),
                reason: format!(
                    "dependency alias '{}' is a {:?}, not a {:?}",
                    alias, dep.kind, kind
                ),
            }),
            None => Err(WeftError::DefinitionInvalid {
                id: self.consumer.to_string(),
                reason: format!("no dependency declared under alias '{}'", alias),
            }),
        }
    }

    /// A callable handle on a task dependency
    pub fn task(&self, alias: &str) -> Result<TaskHandle, WeftError> {
        let dep = self.entry(alias, DepKind::Task)?;
        Ok(TaskHandle {
            kernel: self.kernel.clone(),
            id: dep.id.clone(),
            by: self.consumer.clone(),
        })
    }

    /// The raw initialized value of a resource dependency
    pub fn resource_value(&self, alias: &str) -> Result<ResourceValue, WeftError> {
        let dep = self.entry(alias, DepKind::Resource)?;
        self.kernel.value_of(&dep.id)
    }

    /// The initialized value of a resource dependency, downcast to `T`
    pub fn resource<T: Any + Send + Sync>(&self, alias: &str) -> Result<Arc<T>, WeftError> {
        let dep = self.entry(alias, DepKind::Resource)?;
        let id = dep.id.clone();
        self.kernel
            .value_of(&id)?
            .downcast::<T>()
            .map_err(|_| WeftError::DefinitionInvalid {
                id: id.to_string(),
                reason: format!(
                    "resource value is not a {}",
                    std::any::type_name::<T>()
                ),
            })
    }

    /// An emitter handle on an event dependency
    pub fn emitter(&self, alias: &str) -> Result<EventEmitter, WeftError> {
        let dep = self.entry(alias, DepKind::Event)?;
        Ok(EventEmitter {
            kernel: self.kernel.clone(),
            id: dep.id.clone(),
        })
    }

    /// Attach an init interceptor around a resource dependency's `init`
    ///
    /// Only valid while the runtime is initializing.
    pub fn intercept_resource<F, Fut>(&self, alias: &str, f: F) -> Result<(), WeftError>
    where
        F: Fn(InitNext, Value) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<ResourceValue, WeftError>> + Send + 'static,
    {
        let dep = self.entry(alias, DepKind::Resource)?;
        let id = dep.id.clone();
        self.kernel
            .add_init_interceptor(&id, Arc::new(move |next, config| Box::pin(f(next, config))))
    }

    /// The private context of the owning resource (init/dispose only)
    pub fn private<T: Any + Send + Sync>(&self) -> Option<Arc<T>> {
        self.private
            .as_ref()
            .and_then(|v| v.clone().downcast::<T>().ok())
    }

    /// Id of the unit these deps were wired for
    pub fn consumer(&self) -> &UnitId {
        &self.consumer
    }
}

impl std::fmt::Debug for Deps {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Deps")
            .field("consumer", &self.consumer)
            .field("entries", &self.entries.len())
            .finish()
    }
}

// ============================================================================
// HANDLES
// ============================================================================

/// Callable handle on a task, as obtained through `Deps::task`
#[derive(Clone)]
pub struct TaskHandle {
    kernel: Arc<Kernel>,
    id: UnitId,
    /// The unit that received this handle (interceptor attribution)
    by: UnitId,
}

impl TaskHandle {
    pub fn id(&self) -> &UnitId {
        &self.id
    }

    /// Run the task through the full pipeline
    pub async fn call(&self, input: Value) -> Result<Value, WeftError> {
        TaskRunner::new(self.kernel.clone()).run(&self.id, input).await
    }

    /// Attach an interceptor around this task (init-time only)
    pub fn intercept<F, Fut>(&self, f: F) -> Result<(), WeftError>
    where
        F: Fn(Next, Value) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<Value, WeftError>> + Send + 'static,
    {
        self.kernel.add_task_interceptor(
            &self.id,
            &self.by,
            Arc::new(move |next, input| Box::pin(f(next, input))),
        )
    }

    /// Resource ids that attached interceptors, unique, in attach order
    pub fn intercepting_resource_ids(&self) -> Vec<UnitId> {
        self.kernel
            .intercepting_resources
            .get(&self.id)
            .map(|v| v.clone())
            .unwrap_or_default()
    }
}

/// Emitter handle on an event, as obtained through `Deps::emitter`
#[derive(Clone)]
pub struct EventEmitter {
    kernel: Arc<Kernel>,
    id: UnitId,
}

impl EventEmitter {
    pub fn id(&self) -> &UnitId {
        &self.id
    }

    /// Emit the event through the full dispatch pipeline
    pub async fn emit(&self, payload: Value) -> Result<(), WeftError> {
        EventManager::new(self.kernel.clone())
            .emit(&self.id, payload)
            .await
    }
}

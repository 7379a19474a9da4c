//! Runtime surface (v0.1)
//!
//! The public handle returned by boot: `run_task`, `emit_event`,
//! `resource_value`, `lazy_resource_value`, `dispose`. Every call resolves
//! refs (unit objects or id strings), enforces the root's `exports`, and
//! fails terminally once the runtime is disposed.

use std::any::Any;
use std::sync::Arc;

use serde_json::Value;

use crate::boot::init;
use crate::error::WeftError;
use crate::events::EventManager;
use crate::kernel::Kernel;
use crate::store::UnitStore;
use crate::task_runner::TaskRunner;
use crate::types::UnitId;
use crate::unit::{EventDef, ResourceDef, ResourceValue, TaskDef};

// ============================================================================
// UNIT REFERENCES
// ============================================================================

/// Anything that names a unit: the original definition or its id string
pub trait UnitRef {
    fn unit_id(&self) -> Result<UnitId, WeftError>;
}

impl UnitRef for UnitId {
    fn unit_id(&self) -> Result<UnitId, WeftError> {
        Ok(self.clone())
    }
}

impl UnitRef for &UnitId {
    fn unit_id(&self) -> Result<UnitId, WeftError> {
        Ok((*self).clone())
    }
}

impl UnitRef for &str {
    fn unit_id(&self) -> Result<UnitId, WeftError> {
        UnitId::new(self).map_err(|e| WeftError::DefinitionInvalid {
            id: self.to_string(),
            reason: e.to_string(),
        })
    }
}

impl UnitRef for String {
    fn unit_id(&self) -> Result<UnitId, WeftError> {
        self.as_str().unit_id()
    }
}

impl UnitRef for &Arc<TaskDef> {
    fn unit_id(&self) -> Result<UnitId, WeftError> {
        Ok(self.id.clone())
    }
}

impl UnitRef for &Arc<ResourceDef> {
    fn unit_id(&self) -> Result<UnitId, WeftError> {
        Ok(self.id.clone())
    }
}

impl UnitRef for &Arc<EventDef> {
    fn unit_id(&self) -> Result<UnitId, WeftError> {
        Ok(self.id.clone())
    }
}

// ============================================================================
// RUNTIME
// ============================================================================

/// The controlled runtime surface
#[derive(Clone)]
pub struct Runtime {
    kernel: Arc<Kernel>,
}

impl Runtime {
    pub(crate) fn new(kernel: Arc<Kernel>) -> Self {
        Self { kernel }
    }

    /// Id of the booted root resource
    pub fn root_id(&self) -> &UnitId {
        &self.kernel.root
    }

    /// The root resource's initialized value
    pub fn value(&self) -> Result<ResourceValue, WeftError> {
        self.kernel.ensure_live()?;
        self.kernel.value_of(&self.kernel.root)
    }

    /// Read access to the unit registry
    pub fn store(&self) -> &UnitStore {
        &self.kernel.store
    }

    /// Root `exports` gate: when declared, only listed ids (and the root
    /// itself) are reachable through the surface.
    fn check_exports(&self, target: &UnitId) -> Result<(), WeftError> {
        let Some(exported) = &self.kernel.root_exports else {
            return Ok(());
        };
        if target == &self.kernel.root || exported.contains(target) {
            return Ok(());
        }
        // Companion events ride their task's export.
        for suffix in [":onError", ":afterRun"] {
            if let Some(base) = target.as_str().strip_suffix(suffix) {
                if exported.iter().any(|id| id.as_str() == base) {
                    return Ok(());
                }
            }
        }
        Err(WeftError::AccessViolation {
            target: target.clone(),
            root: self.kernel.root.clone(),
            exported: exported.clone(),
        })
    }

    /// Run a task through the full pipeline
    pub async fn run_task(&self, task: impl UnitRef, input: Value) -> Result<Value, WeftError> {
        self.kernel.ensure_live()?;
        let id = task.unit_id()?;
        self.check_exports(&id)?;
        TaskRunner::new(self.kernel.clone()).run(&id, input).await
    }

    /// Emit an event through the full dispatch pipeline
    pub async fn emit_event(
        &self,
        event: impl UnitRef,
        payload: Value,
    ) -> Result<(), WeftError> {
        self.kernel.ensure_live()?;
        let id = event.unit_id()?;
        self.check_exports(&id)?;
        EventManager::new(self.kernel.clone()).emit(&id, payload).await
    }

    /// Synchronous read of an initialized resource value (eager mode)
    pub fn resource_value(&self, resource: impl UnitRef) -> Result<ResourceValue, WeftError> {
        self.kernel.ensure_live()?;
        let id = resource.unit_id()?;
        self.check_exports(&id)?;
        self.kernel.store.resource(&id)?;
        self.kernel.value_of(&id)
    }

    /// Like [`resource_value`], downcast to `T`
    pub fn typed_resource_value<T: Any + Send + Sync>(
        &self,
        resource: impl UnitRef,
    ) -> Result<Arc<T>, WeftError> {
        let id = resource.unit_id()?;
        self.resource_value(&id)?
            .downcast::<T>()
            .map_err(|_| WeftError::DefinitionInvalid {
                id: id.to_string(),
                reason: format!("resource value is not a {}", std::any::type_name::<T>()),
            })
    }

    /// Resource value with on-demand initialization (lazy mode); respects
    /// the topological order of the resource's dependencies.
    pub async fn lazy_resource_value(
        &self,
        resource: impl UnitRef,
    ) -> Result<ResourceValue, WeftError> {
        self.kernel.ensure_live()?;
        let id = resource.unit_id()?;
        self.check_exports(&id)?;
        self.kernel.store.resource(&id)?;

        if let Ok(value) = self.kernel.value_of(&id) {
            return Ok(value);
        }

        let _guard = self.kernel.lazy_lock.lock().await;
        if let Ok(value) = self.kernel.value_of(&id) {
            return Ok(value);
        }

        // resource_edges holds the transitive deps, deps-first.
        let deps = self
            .kernel
            .resource_edges
            .get(&id)
            .cloned()
            .unwrap_or_default();
        for dep in deps {
            init::init_resource(&self.kernel, &dep).await?;
        }
        init::init_resource(&self.kernel, &id).await?;
        self.kernel.value_of(&id)
    }

    /// Resource ids that attached interceptors to a task (unique, in
    /// attach order)
    pub fn intercepting_resource_ids(
        &self,
        task: impl UnitRef,
    ) -> Result<Vec<UnitId>, WeftError> {
        let id = task.unit_id()?;
        Ok(self
            .kernel
            .intercepting_resources
            .get(&id)
            .map(|v| v.clone())
            .unwrap_or_default())
    }

    /// Ordered list of initialized resources (diagnostics)
    pub fn init_order(&self) -> Vec<UnitId> {
        self.kernel.init_order.lock().clone()
    }

    /// Dispose every initialized resource, reverse init order, exactly once
    pub async fn dispose(&self) -> Result<(), WeftError> {
        init::dispose_all(&self.kernel).await
    }
}

impl std::fmt::Debug for Runtime {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Runtime")
            .field("root", &self.kernel.root)
            .finish()
    }
}

//! Resource initialization and disposal (v0.1)
//!
//! Initialization follows the topological order computed at boot;
//! `sequential` walks it strictly, `parallel` runs dependency waves.
//! Each resource initializes at most once. On any failure, everything
//! already initialized is disposed, in reverse init order, before the
//! error surfaces. Disposal always attempts every disposer and
//! aggregates their failures.

use std::collections::HashSet;
use std::sync::Arc;

use serde_json::Value;
use tracing::{debug, warn};

use crate::boot::InitMode;
use crate::error::{ValidationTarget, WeftError};
use crate::kernel::Kernel;
use crate::types::UnitId;
use crate::unit::{InitCall, InitNext, MiddlewareAttachment, ResourceValue};

/// Initialize one resource through its middleware/interceptor chain.
/// Idempotent: a second call is a no-op.
pub(crate) async fn init_resource(kernel: &Arc<Kernel>, id: &UnitId) -> Result<(), WeftError> {
    if kernel.values.contains_key(id) {
        return Ok(());
    }

    let def = kernel.store.resource(id)?;
    let config = kernel.store.config_of(id);

    if let Some(schema) = &def.config_schema {
        schema.check_for(&config, ValidationTarget::ResourceConfig, id)?;
    }

    if let Some(private) = &def.private_context {
        kernel.private_contexts.insert(id.clone(), private());
    }

    let deps = kernel.deps_for_resource(id);

    // Innermost: the user init (or a unit value for pure containers).
    let base_init = def.init.clone();
    let base_deps = deps.clone();
    let mut next = InitNext::new(move |cfg| match base_init {
        Some(init) => {
            let fut = init(cfg, base_deps);
            Box::pin(async move { fut.await.map_err(WeftError::from_any) })
        }
        None => Box::pin(async move { Ok(Arc::new(()) as ResourceValue) }),
    });

    // Resource middleware, authored order outermost-first.
    let attachments: Arc<Vec<MiddlewareAttachment>> = kernel
        .resource_middleware
        .get(id)
        .map(|a| a.clone())
        .unwrap_or_else(|| Arc::new(def.middleware.clone()));
    for attachment in attachments.iter().rev() {
        let mw = kernel.store.resource_middleware(&attachment.id)?;
        let mw_deps = kernel.deps_for(&mw.id);
        let mw_config = attachment.config.clone();
        let run = mw.run.clone();
        let rid = id.clone();
        let prev = next;
        next = InitNext::new(move |cfg| {
            let call = InitCall {
                resource_id: rid,
                config: cfg,
                next: prev,
            };
            run(call, mw_deps, mw_config)
        });
    }

    // Init interceptors, registration order outermost-first.
    let interceptors = kernel
        .init_interceptors
        .get(id)
        .map(|v| v.clone())
        .unwrap_or_default();
    for interceptor in interceptors.into_iter().rev() {
        let prev = next;
        next = InitNext::new(move |cfg| interceptor(prev, cfg));
    }

    let value = next.invoke(config).await?;
    kernel.values.insert(id.clone(), value);
    kernel.init_order.lock().push(id.clone());
    debug!(resource = %id, "initialized");
    Ok(())
}

/// Initialize every resource per the configured mode
pub(crate) async fn initialize(kernel: &Arc<Kernel>) -> Result<(), WeftError> {
    match kernel.options.init_mode {
        InitMode::Sequential => {
            for id in &kernel.topo_order {
                if let Err(err) = init_resource(kernel, id).await {
                    rollback(kernel).await;
                    return Err(err);
                }
            }
            Ok(())
        }
        InitMode::Parallel => initialize_parallel(kernel).await,
    }
}

/// Dependency waves: everything whose resource deps are done starts
/// concurrently; failures aggregate into one error bag.
async fn initialize_parallel(kernel: &Arc<Kernel>) -> Result<(), WeftError> {
    let mut remaining: Vec<UnitId> = kernel
        .topo_order
        .iter()
        .filter(|id| !kernel.values.contains_key(id))
        .cloned()
        .collect();
    let mut done: HashSet<UnitId> = HashSet::new();
    let mut failures: Vec<(UnitId, String)> = Vec::new();

    while !remaining.is_empty() && failures.is_empty() {
        let ready: Vec<UnitId> = remaining
            .iter()
            .filter(|id| {
                kernel
                    .resource_edges
                    .get(*id)
                    .into_iter()
                    .flatten()
                    .all(|dep| done.contains(dep))
            })
            .cloned()
            .collect();

        if ready.is_empty() {
            // Cycle detection already ran; this is unreachable in practice.
            return Err(WeftError::InitFailed {
                failures: remaining
                    .iter()
                    .map(|id| (id.clone(), "unsatisfiable init wave".to_string()))
                    .collect(),
            });
        }

        let mut set = tokio::task::JoinSet::new();
        for id in ready.clone() {
            let kernel = kernel.clone();
            set.spawn(async move {
                let result = init_resource(&kernel, &id).await;
                (id, result)
            });
        }
        while let Some(joined) = set.join_next().await {
            match joined {
                Ok((id, Ok(()))) => {
                    done.insert(id);
                }
                Ok((id, Err(err))) => failures.push((id, err.to_string())),
                Err(join_err) => {
                    failures.push((kernel.root.clone(), join_err.to_string()));
                }
            }
        }
        remaining.retain(|id| !ready.contains(id));
    }

    if failures.is_empty() {
        Ok(())
    } else {
        rollback(kernel).await;
        Err(WeftError::InitFailed { failures })
    }
}

/// Dispose everything initialized so far, reverse init order, attempting
/// every disposer. Returns the per-resource failures.
async fn dispose_initialized(kernel: &Arc<Kernel>) -> Vec<(UnitId, String)> {
    let order: Vec<UnitId> = {
        let mut guard = kernel.init_order.lock();
        std::mem::take(&mut *guard)
    };
    let mut failures = Vec::new();

    for id in order.iter().rev() {
        let Some((_, value)) = kernel.values.remove(id) else {
            continue;
        };
        let Ok(def) = kernel.store.resource(id) else {
            continue;
        };
        if let Some(dispose) = &def.dispose {
            let config: Value = kernel.store.config_of(id);
            let deps = kernel.deps_for_resource(id);
            if let Err(err) = dispose(value, config, deps).await {
                failures.push((id.clone(), err.to_string()));
            }
        }
        debug!(resource = %id, "disposed");
    }
    failures
}

/// Boot-failure rollback: dispose what initialized, log disposer failures
pub(crate) async fn rollback(kernel: &Arc<Kernel>) {
    for (id, err) in dispose_initialized(kernel).await {
        warn!(resource = %id, error = %err, "disposer failed during rollback");
    }
}

/// Full shutdown: exactly once; aggregates disposer failures
pub(crate) async fn dispose_all(kernel: &Arc<Kernel>) -> Result<(), WeftError> {
    if kernel
        .dispose_started
        .swap(true, std::sync::atomic::Ordering::SeqCst)
    {
        return Err(WeftError::Disposed);
    }

    let failures = dispose_initialized(kernel).await;
    kernel.set_phase(crate::kernel::Phase::Disposed);

    if failures.is_empty() {
        Ok(())
    } else {
        Err(WeftError::DisposeFailed { failures })
    }
}

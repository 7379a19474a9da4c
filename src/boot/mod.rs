//! Bootstrap pipeline (v0.1)
//!
//! Compose → Validate → Wire → Initialize:
//!
//! 1. collect the registration tree, resolving overrides by depth
//! 2. register built-ins (system events, shipped middleware, per-task
//!    companion events)
//! 3. compute per-resource exports and check dependency visibility
//! 4. realize dependency declarations, build the graph, reject cycles
//! 5. expand `everywhere` middleware within its registrar's subtree
//! 6. initialize resources topologically (sequential or parallel)
//! 7. emit `runtime:ready`, install shutdown hooks / error boundary

pub(crate) mod collect;
pub(crate) mod graph;
pub(crate) mod init;
pub(crate) mod visibility;

use std::collections::{HashMap, HashSet};
use std::sync::Arc;

use dashmap::DashMap;
use serde_json::{json, Value};
use tracing::{debug, info};

use crate::builders::event;
use crate::error::{ValidationTarget, WeftError};
use crate::events::{system, EventManager, SubscriptionTable};
use crate::kernel::{Kernel, KernelConfig, Phase};
use crate::store::{StoredUnit, UnitStore};
use crate::surface::Runtime;
use crate::types::{UnitId, UnitKind};
use crate::unit::{
    DepKind, DependencyRef, EventDef, MiddlewareAttachment, Registration, UnitDef,
};

use visibility::{Visibility, VisibilityInput};

// ============================================================================
// OPTIONS
// ============================================================================

/// Resource initialization strategy
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum InitMode {
    /// Strict topological order
    #[default]
    Sequential,
    /// Independent resources start concurrently; failures aggregate
    Parallel,
}

/// What a process-level failure looked like
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UnhandledKind {
    Process,
    Uncaught,
    UnhandledRejection,
}

/// Payload handed to `on_unhandled_error`
#[derive(Debug, Clone)]
pub struct UnhandledError {
    pub error: String,
    pub kind: UnhandledKind,
    pub source: String,
}

pub type UnhandledErrorHandler = Arc<dyn Fn(UnhandledError) + Send + Sync>;

/// Boot options
#[derive(Clone, Default)]
pub struct BootOptions {
    pub debug: bool,
    /// Print threshold for the logging layer (`error`..`trace`)
    pub log_level: Option<String>,
    pub error_boundary: bool,
    pub shutdown_hooks: bool,
    pub on_unhandled_error: Option<UnhandledErrorHandler>,
    pub dry_run: bool,
    pub runtime_cycle_detection: bool,
    pub init_mode: InitMode,
    pub lazy: bool,
}

impl BootOptions {
    pub fn new() -> Self {
        Self {
            runtime_cycle_detection: true,
            ..Self::default()
        }
    }

    pub fn debug(mut self, on: bool) -> Self {
        self.debug = on;
        self
    }

    pub fn logs(mut self, print_threshold: impl Into<String>) -> Self {
        self.log_level = Some(print_threshold.into());
        self
    }

    pub fn error_boundary(mut self, on: bool) -> Self {
        self.error_boundary = on;
        self
    }

    pub fn shutdown_hooks(mut self, on: bool) -> Self {
        self.shutdown_hooks = on;
        self
    }

    pub fn on_unhandled_error(
        mut self,
        handler: impl Fn(UnhandledError) + Send + Sync + 'static,
    ) -> Self {
        self.on_unhandled_error = Some(Arc::new(handler));
        self
    }

    pub fn dry_run(mut self, on: bool) -> Self {
        self.dry_run = on;
        self
    }

    pub fn runtime_cycle_detection(mut self, on: bool) -> Self {
        self.runtime_cycle_detection = on;
        self
    }

    pub fn init_mode(mut self, mode: InitMode) -> Self {
        self.init_mode = mode;
        self
    }

    pub fn lazy(mut self, on: bool) -> Self {
        self.lazy = on;
        self
    }
}

impl std::fmt::Debug for BootOptions {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("BootOptions")
            .field("debug", &self.debug)
            .field("dry_run", &self.dry_run)
            .field("init_mode", &self.init_mode)
            .field("lazy", &self.lazy)
            .finish()
    }
}

// ============================================================================
// BOOT
// ============================================================================

/// Boot a registration tree into a live runtime
pub async fn boot(
    root: impl Into<Registration>,
    options: BootOptions,
) -> Result<Runtime, WeftError> {
    if let Some(level) = &options.log_level {
        crate::logging::init(level);
    }

    let collected = collect::collect(root.into())?;
    let root_id = collected.root.clone();
    debug!(root = %root_id, units = collected.ordered.len(), "collected registration tree");

    // ---- store assembly, preserving registration order
    let store = UnitStore::new();
    let mut ordered = collected.ordered.clone();
    for id in &collected.ordered {
        let unit = &collected.units[id];
        store.insert(StoredUnit {
            def: unit.def.clone(),
            config: unit.config.clone(),
            owner: unit.owner.clone(),
            depth: unit.depth,
            exported_from: HashSet::new(),
        });
    }

    // ---- built-ins: system events, shipped middleware, task companions
    for id in [
        system::ready(),
        system::on_error(),
        system::hook_triggered(),
        system::hook_completed(),
    ] {
        if !store.contains(&id) {
            let def = event(id.as_str()).build()?;
            store.insert(builtin(UnitDef::Event(def)));
            ordered.push(id);
        }
    }
    for mw in crate::middleware::shipped() {
        if !store.contains(&mw.id) {
            ordered.push(mw.id.clone());
            store.insert(builtin(UnitDef::TaskMiddleware(mw)));
        }
    }
    for id in &collected.ordered {
        let unit = &collected.units[id];
        if let UnitDef::Task(task) = &unit.def {
            for companion in [task.on_error_id(), task.after_run_id()] {
                if store.contains(&companion) {
                    continue;
                }
                let def = Arc::new(EventDef {
                    id: companion.clone(),
                    tags: Vec::new(),
                    meta: Default::default(),
                    payload_schema: None,
                });
                store.insert(StoredUnit {
                    def: UnitDef::Event(def),
                    config: None,
                    owner: unit.owner.clone(),
                    depth: unit.depth,
                    exported_from: HashSet::new(),
                });
                ordered.push(companion);
            }
        }
    }

    // ---- visibility
    let mut owners: HashMap<UnitId, Option<UnitId>> = HashMap::new();
    let mut exports_decl: HashMap<UnitId, Option<Vec<UnitId>>> = HashMap::new();
    for id in &ordered {
        let Some(stored) = store.get(id) else { continue };
        owners.insert(id.clone(), stored.owner.clone());
        if let UnitDef::Resource(def) = &stored.def {
            exports_decl.insert(id.clone(), def.exports.clone());
        }
    }
    let vis = Visibility::compute(VisibilityInput {
        owners,
        exports: exports_decl,
    })?;
    vis.mark_exports(&store);

    // ---- dependency resolution (function-valued specs realize once)
    let mut resolved: HashMap<UnitId, Vec<DependencyRef>> = HashMap::new();
    for id in &ordered {
        let Some(stored) = store.get(id) else { continue };
        if let Some(spec) = stored.def.dependencies() {
            resolved.insert(id.clone(), spec.realize());
        }
    }

    let mut deferred: HashSet<(UnitId, UnitId)> = HashSet::new();
    for id in &ordered {
        let Some(deps) = resolved.get(id) else { continue };
        for dep in deps {
            let Some(target) = store.get(&dep.id) else {
                return Err(WeftError::RegistrationMissing {
                    id: dep.id.clone(),
                    required_by: id.clone(),
                });
            };
            check_dep_family(id, dep, target.def.kind())?;
            if !vis.visible(id, &dep.id) {
                // Override-through-a-gate defers to first consumption.
                let from_override = collected
                    .units
                    .get(&dep.id)
                    .is_some_and(|u| u.from_override);
                if from_override {
                    deferred.insert((id.clone(), dep.id.clone()));
                } else {
                    return Err(WeftError::VisibilityViolation {
                        target: dep.id.clone(),
                        owner: vis.owner_of(&dep.id).unwrap_or_else(|| root_id.clone()),
                        consumer: id.clone(),
                    });
                }
            }
        }
    }

    // ---- authored middleware attachments, validated
    let mut task_attach: HashMap<UnitId, Vec<MiddlewareAttachment>> = HashMap::new();
    let mut resource_attach: HashMap<UnitId, Vec<MiddlewareAttachment>> = HashMap::new();
    for id in &ordered {
        let Some(stored) = store.get(id) else { continue };
        match &stored.def {
            UnitDef::Task(task) => {
                for att in &task.middleware {
                    let mw = store.task_middleware(&att.id).map_err(|_| {
                        WeftError::RegistrationMissing {
                            id: att.id.clone(),
                            required_by: id.clone(),
                        }
                    })?;
                    check_attachment_config(&mw.id, mw.config_schema.as_ref(), &att.config)?;
                }
                task_attach.insert(id.clone(), task.middleware.clone());
            }
            UnitDef::Resource(res) => {
                for att in &res.middleware {
                    let mw = store.resource_middleware(&att.id).map_err(|_| {
                        WeftError::RegistrationMissing {
                            id: att.id.clone(),
                            required_by: id.clone(),
                        }
                    })?;
                    check_attachment_config(&mw.id, mw.config_schema.as_ref(), &att.config)?;
                }
                resource_attach.insert(id.clone(), res.middleware.clone());
            }
            _ => {}
        }
    }

    // ---- dependency graph and cycles
    let dep_edges: HashMap<UnitId, Vec<UnitId>> = resolved
        .iter()
        .map(|(id, deps)| (id.clone(), deps.iter().map(|d| d.id.clone()).collect()))
        .collect();
    let mut attachment_edges: HashMap<UnitId, Vec<UnitId>> = HashMap::new();
    for (id, atts) in task_attach.iter().chain(resource_attach.iter()) {
        attachment_edges.insert(id.clone(), atts.iter().map(|a| a.id.clone()).collect());
    }
    let mut containment: HashMap<UnitId, Vec<UnitId>> = HashMap::new();
    for id in &ordered {
        let Some(stored) = store.get(id) else { continue };
        if matches!(stored.def, UnitDef::Resource(_)) {
            if let Some(owner) = &stored.owner {
                containment
                    .entry(owner.clone())
                    .or_default()
                    .push(id.clone());
            }
        }
    }

    let edges = graph::build_edges(&dep_edges, &attachment_edges, &containment);
    graph::detect_cycles(&edges, &ordered)?;
    let topo_units = graph::topo_order(&edges, &ordered);

    let resources_set: HashSet<UnitId> = ordered
        .iter()
        .filter(|id| store.resource(id).is_ok())
        .cloned()
        .collect();
    let resource_order: Vec<UnitId> = topo_units
        .iter()
        .filter(|id| resources_set.contains(*id))
        .cloned()
        .collect();
    let resource_edges = graph::resource_reachability(&edges, &resources_set, &topo_units);

    // ---- everywhere expansion, scoped to the registrar's subtree
    expand_everywhere(&store, &ordered, &vis, &resolved, &mut task_attach, &mut resource_attach);

    // ---- subscriptions (frozen)
    let subscriptions = SubscriptionTable::build(&store, &ordered);

    // ---- kernel
    let root_exports = store.resource(&root_id)?.exports.clone();
    let resolved_map: DashMap<UnitId, Arc<Vec<DependencyRef>>> = DashMap::new();
    for (id, deps) in resolved {
        resolved_map.insert(id, Arc::new(deps));
    }

    let kernel = Arc::new(Kernel::new(KernelConfig {
        store,
        root: root_id.clone(),
        options: options.clone(),
        topo_order: resource_order,
        resource_edges,
        resolved_deps: resolved_map,
        subscriptions,
        root_exports,
        deferred_violations: deferred,
        phase: if options.dry_run {
            Phase::DryRun
        } else {
            Phase::Initializing
        },
    }));
    for (id, list) in task_attach {
        kernel.task_middleware.insert(id, Arc::new(list));
    }
    for (id, list) in resource_attach {
        kernel.resource_middleware.insert(id, Arc::new(list));
    }

    // ---- dry run stops here: no init, no events, no dispose
    if options.dry_run {
        info!(root = %root_id, "dry run complete");
        return Ok(Runtime::new(kernel));
    }

    if !options.lazy {
        init::initialize(&kernel).await?;
    }
    kernel.set_phase(Phase::Ready);
    info!(root = %root_id, "runtime ready");

    if let Err(err) = EventManager::new(kernel.clone())
        .emit(&system::ready(), json!({"root": root_id}))
        .await
    {
        // A failing ready hook aborts the boot; nothing may leak.
        init::rollback(&kernel).await;
        kernel.set_phase(Phase::Disposed);
        return Err(err);
    }

    if options.error_boundary {
        install_error_boundary(&options);
    }
    if options.shutdown_hooks {
        install_shutdown_hooks(kernel.clone());
    }

    Ok(Runtime::new(kernel))
}

fn builtin(def: UnitDef) -> StoredUnit {
    StoredUnit {
        def,
        config: None,
        owner: None,
        depth: 0,
        exported_from: HashSet::new(),
    }
}

fn check_dep_family(
    consumer: &UnitId,
    dep: &DependencyRef,
    actual: UnitKind,
) -> Result<(), WeftError> {
    let matches = matches!(
        (dep.kind, actual),
        (DepKind::Task, UnitKind::Task)
            | (DepKind::Resource, UnitKind::Resource)
            | (DepKind::Event, UnitKind::Event)
    );
    if matches {
        Ok(())
    } else {
        Err(WeftError::DefinitionInvalid {
            id: consumer.to_string(),
            reason: format!(
                "dependency '{}' (alias '{}') is a {}, declared as {:?}",
                dep.id, dep.alias, actual, dep.kind
            ),
        })
    }
}

fn check_attachment_config(
    mw_id: &UnitId,
    schema: Option<&crate::schema::Schema>,
    config: &Value,
) -> Result<(), WeftError> {
    if config.is_null() {
        return Ok(());
    }
    if let Some(schema) = schema {
        schema.check_for(config, ValidationTarget::ResourceConfig, mw_id)?;
    }
    Ok(())
}

/// Append `everywhere` middleware to every eligible unit in the subtree of
/// the resource that registered the middleware. A private middleware never
/// crosses its export boundary: scoping is by registrar subtree.
fn expand_everywhere(
    store: &UnitStore,
    ordered: &[UnitId],
    vis: &Visibility,
    resolved: &HashMap<UnitId, Vec<DependencyRef>>,
    task_attach: &mut HashMap<UnitId, Vec<MiddlewareAttachment>>,
    resource_attach: &mut HashMap<UnitId, Vec<MiddlewareAttachment>>,
) {
    for mw_id in ordered {
        let Some(stored) = store.get(mw_id) else { continue };
        let mw_owner = stored.owner.clone();
        let in_scope = |unit: &UnitId| match &mw_owner {
            None => true,
            Some(owner) => vis.within_subtree(owner, unit),
        };
        // Wrapping a unit the middleware itself depends on would recurse.
        let depends_on = |unit: &UnitId| {
            resolved
                .get(mw_id)
                .is_some_and(|deps| deps.iter().any(|d| &d.id == unit))
        };

        match &stored.def {
            UnitDef::TaskMiddleware(mw) => {
                for target in ordered {
                    let Some(target_stored) = store.get(target) else { continue };
                    let UnitDef::Task(_) = &target_stored.def else { continue };
                    if !mw.everywhere.applies_to(&target_stored.def)
                        || !in_scope(target)
                        || depends_on(target)
                    {
                        continue;
                    }
                    let list = task_attach.entry(target.clone()).or_default();
                    if !list.iter().any(|a| &a.id == mw_id) {
                        list.push(MiddlewareAttachment {
                            id: mw_id.clone(),
                            config: Value::Null,
                        });
                    }
                }
            }
            UnitDef::ResourceMiddleware(mw) => {
                for target in ordered {
                    let Some(target_stored) = store.get(target) else { continue };
                    let UnitDef::Resource(_) = &target_stored.def else { continue };
                    if !mw.everywhere.applies_to(&target_stored.def)
                        || !in_scope(target)
                        || depends_on(target)
                    {
                        continue;
                    }
                    let list = resource_attach.entry(target.clone()).or_default();
                    if !list.iter().any(|a| &a.id == mw_id) {
                        list.push(MiddlewareAttachment {
                            id: mw_id.clone(),
                            config: Value::Null,
                        });
                    }
                }
            }
            _ => {}
        }
    }
}

/// Route panics to the configured handler (kind `uncaught`)
fn install_error_boundary(options: &BootOptions) {
    let Some(handler) = options.on_unhandled_error.clone() else {
        return;
    };
    let previous = std::panic::take_hook();
    std::panic::set_hook(Box::new(move |info| {
        handler(UnhandledError {
            error: info.to_string(),
            kind: UnhandledKind::Uncaught,
            source: "panic".into(),
        });
        previous(info);
    }));
}

/// Termination signals trigger `dispose()`; exit code reflects disposer
/// success.
fn install_shutdown_hooks(kernel: Arc<Kernel>) {
    tokio::spawn(async move {
        wait_for_termination().await;
        info!("termination signal received, disposing");
        let code = match init::dispose_all(&kernel).await {
            Ok(()) => 0,
            Err(err) => {
                tracing::error!(error = %err, "disposal failed during shutdown");
                1
            }
        };
        std::process::exit(code);
    });
}

#[cfg(unix)]
async fn wait_for_termination() {
    use tokio::signal::unix::{signal, SignalKind};
    let mut term = match signal(SignalKind::terminate()) {
        Ok(term) => term,
        Err(_) => {
            let _ = tokio::signal::ctrl_c().await;
            return;
        }
    };
    tokio::select! {
        _ = tokio::signal::ctrl_c() => {}
        _ = term.recv() => {}
    }
}

#[cfg(not(unix))]
async fn wait_for_termination() {
    let _ = tokio::signal::ctrl_c().await;
}

//! Event dispatch (v0.1)
//!
//! Subscriptions (by id, by tag, wildcard) are frozen at boot into a
//! priority-sorted table; emission fans out sequentially in
//! `(ascending order, registration index)` order for determinism.
//! Runtime cycle detection rides the per-chain emission scope from
//! [`crate::context`], so concurrent emissions never interfere.
//!
//! The manager emits `runtime:hookTriggered` / `runtime:hookCompleted`
//! around each hook invocation; both are excluded from `"*"` listeners to
//! prevent feedback loops.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use chrono::{DateTime, Utc};
use once_cell::sync::Lazy;
use serde_json::{json, Value};
use tracing::warn;

use crate::context::{emission_scope, with_emission_scope, EmissionScope};
use crate::error::WeftError;
use crate::kernel::Kernel;
use crate::store::UnitStore;
use crate::task_runner::TaskRunner;
use crate::types::UnitId;
use crate::unit::{BoxFut, EventDef, HookDef, TaskDef, UnitDef};

// ============================================================================
// SYSTEM EVENTS
// ============================================================================

/// Built-in event ids
pub mod system {
    use super::*;

    static READY: Lazy<UnitId> =
        Lazy::new(|| UnitId::new("runtime:ready").expect("valid built-in id"));
    static ON_ERROR: Lazy<UnitId> =
        Lazy::new(|| UnitId::new("runtime:onError").expect("valid built-in id"));
    static HOOK_TRIGGERED: Lazy<UnitId> =
        Lazy::new(|| UnitId::new("runtime:hookTriggered").expect("valid built-in id"));
    static HOOK_COMPLETED: Lazy<UnitId> =
        Lazy::new(|| UnitId::new("runtime:hookCompleted").expect("valid built-in id"));

    /// Emitted once, after the root resource resolves
    pub fn ready() -> UnitId {
        READY.clone()
    }

    /// Framework-level error surface (payload validation failures and
    /// other errors with no task to own them)
    pub fn on_error() -> UnitId {
        ON_ERROR.clone()
    }

    /// Emitted before each hook invocation; hidden from `"*"`
    pub fn hook_triggered() -> UnitId {
        HOOK_TRIGGERED.clone()
    }

    /// Emitted after each hook invocation; hidden from `"*"`
    pub fn hook_completed() -> UnitId {
        HOOK_COMPLETED.clone()
    }

    /// Internal ids wildcard listeners never observe
    pub fn is_internal(id: &UnitId) -> bool {
        id == &*HOOK_TRIGGERED || id == &*HOOK_COMPLETED
    }
}

// ============================================================================
// EVENT ENVELOPE
// ============================================================================

/// The event object handed to every subscriber of one emission
///
/// Clones share the propagation/suppression flags, so any handler's
/// `stop_propagation` or `suppress` is visible to the emitter.
#[derive(Debug, Clone)]
pub struct EventEnvelope {
    pub id: UnitId,
    pub data: Value,
    pub timestamp: DateTime<Utc>,
    stopped: Arc<AtomicBool>,
    suppressed: Arc<AtomicBool>,
}

impl EventEnvelope {
    pub(crate) fn new(id: UnitId, data: Value) -> Self {
        Self {
            id,
            data,
            timestamp: Utc::now(),
            stopped: Arc::new(AtomicBool::new(false)),
            suppressed: Arc::new(AtomicBool::new(false)),
        }
    }

    /// Halt the remaining subscribers of this emission
    pub fn stop_propagation(&self) {
        self.stopped.store(true, Ordering::SeqCst);
    }

    pub fn is_stopped(&self) -> bool {
        self.stopped.load(Ordering::SeqCst)
    }

    /// On an error event: convert the pending rejection into an
    /// `undefined` (null) resolution
    pub fn suppress(&self) {
        self.suppressed.store(true, Ordering::SeqCst);
    }

    pub fn is_suppressed(&self) -> bool {
        self.suppressed.load(Ordering::SeqCst)
    }

    /// Serialize for task-as-hook input
    pub fn to_value(&self) -> Value {
        json!({
            "id": self.id,
            "data": self.data,
            "timestamp": self.timestamp.to_rfc3339(),
        })
    }
}

// ============================================================================
// SUBSCRIPTIONS
// ============================================================================

#[derive(Debug, Clone)]
pub(crate) enum SubscriberTarget {
    Hook(Arc<HookDef>),
    Task(Arc<TaskDef>),
}

/// One frozen subscription
#[derive(Debug, Clone)]
pub(crate) struct Subscriber {
    pub id: UnitId,
    pub order: i32,
    pub index: usize,
    pub target: SubscriberTarget,
    /// Idempotency marker (hooks only)
    pub allows_reemit: bool,
}

/// Priority-sorted subscription table, frozen after boot
#[derive(Debug, Default)]
pub struct SubscriptionTable {
    by_event: HashMap<UnitId, Vec<Subscriber>>,
    by_tag: HashMap<UnitId, Vec<Subscriber>>,
    wildcard: Vec<Subscriber>,
}

impl SubscriptionTable {
    /// Build from the store, walking units in registration order so ties
    /// break by registration index.
    pub(crate) fn build(store: &UnitStore, ordered: &[UnitId]) -> Self {
        let mut table = SubscriptionTable::default();
        let mut index = 0usize;

        for id in ordered {
            let Some(stored) = store.get(id) else { continue };
            let (on, order, target, allows_reemit) = match &stored.def {
                UnitDef::Hook(h) => (
                    h.on.clone(),
                    h.order,
                    SubscriberTarget::Hook(h.clone()),
                    h.emits_same_event,
                ),
                UnitDef::Task(t) => match &t.on {
                    Some(on) => (
                        on.clone(),
                        t.listener_order,
                        SubscriberTarget::Task(t.clone()),
                        false,
                    ),
                    None => continue,
                },
                _ => continue,
            };

            let sub = Subscriber {
                id: id.clone(),
                order,
                index,
                target,
                allows_reemit,
            };
            index += 1;

            if on.is_wildcard() {
                table.wildcard.push(sub);
            } else if let Some(tag) = on.tag_id() {
                table.by_tag.entry(tag.clone()).or_default().push(sub);
            } else {
                for event_id in on.event_ids() {
                    table
                        .by_event
                        .entry(event_id)
                        .or_default()
                        .push(sub.clone());
                }
            }
        }

        table
    }

    /// Merge specific-id, tag and wildcard lists for one event, sorted by
    /// `(order, registration index)`, deduped by subscriber id.
    pub(crate) fn resolve(&self, event: &EventDef, include_wildcard: bool) -> Vec<Subscriber> {
        let mut merged: Vec<Subscriber> = Vec::new();
        if let Some(subs) = self.by_event.get(&event.id) {
            merged.extend(subs.iter().cloned());
        }
        for tag in &event.tags {
            if let Some(subs) = self.by_tag.get(&tag.id) {
                merged.extend(subs.iter().cloned());
            }
        }
        if include_wildcard {
            merged.extend(self.wildcard.iter().cloned());
        }

        merged.sort_by_key(|s| (s.order, s.index));
        let mut seen = std::collections::HashSet::new();
        merged.retain(|s| seen.insert(s.id.clone()));
        merged
    }

    pub(crate) fn has_for(&self, event_id: &UnitId) -> bool {
        self.by_event
            .get(event_id)
            .is_some_and(|subs| !subs.is_empty())
    }

    /// Whether an emission of this event would reach any subscriber
    pub(crate) fn reaches(&self, event: &EventDef) -> bool {
        !self.resolve(event, !system::is_internal(&event.id)).is_empty()
    }
}

// ============================================================================
// EVENT MANAGER
// ============================================================================

/// Ordered, cycle-guarded event dispatch over the kernel's frozen table
pub struct EventManager {
    kernel: Arc<Kernel>,
}

impl EventManager {
    pub(crate) fn new(kernel: Arc<Kernel>) -> Self {
        Self { kernel }
    }

    /// Emit an event through the full pipeline: payload validation, cycle
    /// guard, ordered sequential dispatch, stop-propagation.
    pub fn emit(&self, event_id: &UnitId, payload: Value) -> BoxFut<Result<(), WeftError>> {
        let kernel = self.kernel.clone();
        let event_id = event_id.clone();
        Box::pin(async move { emit_inner(kernel, event_id, payload).await })
    }

    /// Emit with a caller-built envelope, so the caller can observe the
    /// shared `suppress`/`stop` flags afterwards (onError suppression).
    /// Payload validation is skipped: the payload is framework-built.
    pub(crate) fn emit_prepared(
        &self,
        envelope: EventEnvelope,
    ) -> BoxFut<Result<(), WeftError>> {
        let kernel = self.kernel.clone();
        Box::pin(async move {
            kernel.ensure_live()?;
            let def = kernel.store.event(&envelope.id)?;
            dispatch_all(kernel, def, envelope).await
        })
    }

    /// Reduced-path emission for framework-internal events: direct-id
    /// subscribers only, no cycle tracking, no observability recursion.
    /// Subscriber errors are logged, never bubbled.
    pub(crate) fn emit_internal(
        &self,
        event_id: &UnitId,
        payload: Value,
    ) -> BoxFut<()> {
        let kernel = self.kernel.clone();
        let event_id = event_id.clone();
        Box::pin(async move {
            if !kernel.subscriptions.has_for(&event_id) {
                return;
            }
            let Ok(def) = kernel.store.event(&event_id) else {
                return;
            };
            let envelope = EventEnvelope::new(event_id.clone(), payload);
            let subs = kernel.subscriptions.resolve(&def, false);
            for sub in subs {
                if envelope.is_stopped() {
                    break;
                }
                if let Err(err) = dispatch(&kernel, &sub, &envelope).await {
                    warn!(event = %event_id, hook = %sub.id, error = %err,
                          "internal event subscriber failed");
                }
            }
        })
    }
}

async fn emit_inner(
    kernel: Arc<Kernel>,
    event_id: UnitId,
    payload: Value,
) -> Result<(), WeftError> {
    kernel.ensure_live()?;
    let def = kernel.store.event(&event_id)?;

    // Payload validation surfaces via the framework error event, then rejects.
    if let Some(schema) = &def.payload_schema {
        if let Err(err) = schema.check_for(
            &payload,
            crate::error::ValidationTarget::EventPayload,
            &event_id,
        ) {
            let manager = EventManager::new(kernel.clone());
            manager
                .emit_internal(
                    &system::on_error(),
                    json!({
                        "kind": err.kind(),
                        "targetId": event_id,
                        "message": err.to_string(),
                    }),
                )
                .await;
            return Err(err);
        }
    }

    let envelope = EventEnvelope::new(event_id, payload);
    dispatch_all(kernel, def, envelope).await
}

async fn dispatch_all(
    kernel: Arc<Kernel>,
    def: Arc<EventDef>,
    envelope: EventEnvelope,
) -> Result<(), WeftError> {
    let event_id = envelope.id.clone();

    // Runtime cycle detection over the per-chain emission scope.
    let outer = emission_scope();
    if kernel.options.runtime_cycle_detection {
        let occurrences = outer.occurrences(&event_id);
        if occurrences > 0 {
            let permitted =
                outer.current_hook.is_some() && outer.hook_allows_reemit && occurrences < 2;
            if !permitted {
                let mut chain = outer.chain.clone();
                chain.push(event_id.clone());
                return Err(WeftError::EventCycle { chain });
            }
        }
    }

    let include_wildcard = !system::is_internal(&event_id);
    let subs = kernel.subscriptions.resolve(&def, include_wildcard);
    if subs.is_empty() {
        return Ok(());
    }

    let manager = EventManager::new(kernel.clone());

    let mut chain_scope = outer;
    chain_scope.chain.push(event_id.clone());

    for sub in subs {
        if envelope.is_stopped() {
            break;
        }

        manager
            .emit_internal(
                &system::hook_triggered(),
                json!({"hook": sub.id, "eventId": event_id}),
            )
            .await;

        let mut scope = chain_scope.clone();
        scope.current_hook = Some(sub.id.clone());
        scope.hook_allows_reemit = sub.allows_reemit;
        let result = with_emission_scope(scope, dispatch(&kernel, &sub, &envelope)).await;

        manager
            .emit_internal(
                &system::hook_completed(),
                json!({
                    "hook": sub.id,
                    "eventId": event_id,
                    "error": result.as_ref().err().map(|e| e.to_string()),
                }),
            )
            .await;

        // Hook errors bubble to the emitter.
        result?;
    }

    Ok(())
}

async fn dispatch(
    kernel: &Arc<Kernel>,
    sub: &Subscriber,
    envelope: &EventEnvelope,
) -> Result<(), WeftError> {
    match &sub.target {
        SubscriberTarget::Hook(hook) => {
            let deps = kernel.deps_for(&hook.id);
            (hook.run)(envelope.clone(), deps)
                .await
                .map_err(WeftError::from_any)
        }
        SubscriberTarget::Task(task) => TaskRunner::new(kernel.clone())
            .run(&task.id, envelope.to_value())
            .await
            .map(|_| ()),
    }
}

// ============================================================================
// TESTS
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use crate::builders::{event, hook, tag, task};
    use crate::store::StoredUnit;

    fn store_with(units: Vec<UnitDef>) -> (UnitStore, Vec<UnitId>) {
        let store = UnitStore::new();
        let mut order = Vec::new();
        for def in units {
            order.push(def.id().clone());
            store.insert(StoredUnit {
                def,
                config: None,
                owner: None,
                depth: 0,
                exported_from: Default::default(),
            });
        }
        (store, order)
    }

    #[test]
    fn envelope_flags_are_shared_across_clones() {
        let env = EventEnvelope::new(UnitId::new("e").unwrap(), json!(1));
        let clone = env.clone();
        clone.stop_propagation();
        clone.suppress();
        assert!(env.is_stopped());
        assert!(env.is_suppressed());
    }

    #[test]
    fn internal_ids_are_recognized() {
        assert!(system::is_internal(&system::hook_triggered()));
        assert!(system::is_internal(&system::hook_completed()));
        assert!(!system::is_internal(&system::ready()));
        assert!(!system::is_internal(&system::on_error()));
    }

    #[test]
    fn table_sorts_by_order_then_registration_index() {
        let ping = event("ping").build().unwrap();
        let late = hook("late")
            .on_event(&ping)
            .order(5)
            .run(|_, _| async { Ok(()) })
            .build()
            .unwrap();
        let early = hook("early")
            .on_event(&ping)
            .order(-1)
            .run(|_, _| async { Ok(()) })
            .build()
            .unwrap();
        let default_a = hook("default-a")
            .on_event(&ping)
            .run(|_, _| async { Ok(()) })
            .build()
            .unwrap();
        let default_b = hook("default-b")
            .on_event(&ping)
            .run(|_, _| async { Ok(()) })
            .build()
            .unwrap();

        let (store, order) = store_with(vec![
            UnitDef::Event(ping.clone()),
            UnitDef::Hook(late),
            UnitDef::Hook(default_a),
            UnitDef::Hook(default_b),
            UnitDef::Hook(early),
        ]);
        let table = SubscriptionTable::build(&store, &order);
        let subs = table.resolve(&ping, true);

        let ids: Vec<&str> = subs.iter().map(|s| s.id.as_str()).collect();
        assert_eq!(ids, vec!["early", "default-a", "default-b", "late"]);
    }

    #[test]
    fn table_merges_tag_and_wildcard() {
        let audit = tag("audit").unwrap();
        let ping = event("ping").tag(audit.clone()).build().unwrap();

        let by_id = hook("by-id")
            .on_event(&ping)
            .run(|_, _| async { Ok(()) })
            .build()
            .unwrap();
        let by_tag = hook("by-tag")
            .on_tag(&audit)
            .run(|_, _| async { Ok(()) })
            .build()
            .unwrap();
        let by_star = hook("by-star")
            .on_any()
            .run(|_, _| async { Ok(()) })
            .build()
            .unwrap();

        let (store, order) = store_with(vec![
            UnitDef::Event(ping.clone()),
            UnitDef::Hook(by_id),
            UnitDef::Hook(by_tag),
            UnitDef::Hook(by_star),
        ]);
        let table = SubscriptionTable::build(&store, &order);

        let with_wildcard = table.resolve(&ping, true);
        assert_eq!(with_wildcard.len(), 3);

        let without_wildcard = table.resolve(&ping, false);
        let ids: Vec<&str> = without_wildcard.iter().map(|s| s.id.as_str()).collect();
        assert_eq!(ids, vec!["by-id", "by-tag"]);
    }

    #[test]
    fn tasks_with_on_become_subscribers() {
        let ping = event("ping").build().unwrap();
        let listener = task("listener")
            .on_event(&ping)
            .listener_order(2)
            .run_value(|input, _| Ok(input))
            .build()
            .unwrap();

        let (store, order) =
            store_with(vec![UnitDef::Event(ping.clone()), UnitDef::Task(listener)]);
        let table = SubscriptionTable::build(&store, &order);
        let subs = table.resolve(&ping, true);
        assert_eq!(subs.len(), 1);
        assert!(matches!(subs[0].target, SubscriberTarget::Task(_)));
        assert_eq!(subs[0].order, 2);
    }
}

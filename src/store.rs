//! Unit registry with tag index (v0.1)
//!
//! Built by boot, read-mostly thereafter. DashMap keeps lookups lock-free;
//! the only post-boot mutation path is the interceptor tables, which live on
//! the kernel, not here.

use std::collections::HashSet;
use std::sync::Arc;

use dashmap::DashMap;
use serde_json::Value;

use crate::error::WeftError;
use crate::types::{UnitId, UnitKind};
use crate::unit::{
    EventDef, HookDef, ResourceDef, ResourceMiddlewareDef, TaskDef, TaskMiddlewareDef, UnitDef,
};

/// A registered unit with its boot-time placement
#[derive(Debug, Clone)]
pub struct StoredUnit {
    pub def: UnitDef,
    /// Config bound at registration time (`Resource.with(config)`)
    pub config: Option<Value>,
    /// The resource whose `register` list contributed this unit (None = root)
    pub owner: Option<UnitId>,
    /// Depth of the owning resource in the registration tree
    pub depth: usize,
    /// Resources that re-export this id (computed by the visibility pass)
    pub exported_from: HashSet<UnitId>,
}

/// In-memory indexed map of every registered unit
#[derive(Debug, Default)]
pub struct UnitStore {
    units: DashMap<UnitId, StoredUnit>,
    /// tag id → unit ids carrying it, in registration order
    tag_index: DashMap<UnitId, Vec<UnitId>>,
}

impl UnitStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Insert or replace a unit (override resolution replaces)
    pub(crate) fn insert(&self, stored: StoredUnit) {
        let id = stored.def.id().clone();
        for tag in stored.def.tags() {
            let mut ids = self.tag_index.entry(tag.id.clone()).or_default();
            if !ids.contains(&id) {
                ids.push(id.clone());
            }
        }
        self.units.insert(id, stored);
    }

    pub(crate) fn mark_exported_from(&self, id: &UnitId, resource: UnitId) {
        if let Some(mut stored) = self.units.get_mut(id) {
            stored.exported_from.insert(resource);
        }
    }

    pub fn contains(&self, id: &UnitId) -> bool {
        self.units.contains_key(id)
    }

    pub fn get(&self, id: &UnitId) -> Option<StoredUnit> {
        self.units.get(id).map(|u| u.clone())
    }

    /// Registration config bound to a unit, `Value::Null` when absent
    pub fn config_of(&self, id: &UnitId) -> Value {
        self.units
            .get(id)
            .and_then(|u| u.config.clone())
            .unwrap_or(Value::Null)
    }

    pub fn owner_of(&self, id: &UnitId) -> Option<UnitId> {
        self.units.get(id).and_then(|u| u.owner.clone())
    }

    pub fn ids(&self) -> Vec<UnitId> {
        self.units.iter().map(|e| e.key().clone()).collect()
    }

    pub fn len(&self) -> usize {
        self.units.len()
    }

    pub fn is_empty(&self) -> bool {
        self.units.is_empty()
    }

    // ────────────────────────────────────────────────────────────────
    // Typed getters
    // ────────────────────────────────────────────────────────────────

    pub fn task(&self, id: &UnitId) -> Result<Arc<TaskDef>, WeftError> {
        match self.units.get(id).map(|u| u.def.clone()) {
            Some(UnitDef::Task(def)) => Ok(def),
            _ => Err(WeftError::UnknownUnit {
                id: id.clone(),
                kind: UnitKind::Task,
            }),
        }
    }

    pub fn resource(&self, id: &UnitId) -> Result<Arc<ResourceDef>, WeftError> {
        match self.units.get(id).map(|u| u.def.clone()) {
            Some(UnitDef::Resource(def)) => Ok(def),
            _ => Err(WeftError::UnknownUnit {
                id: id.clone(),
                kind: UnitKind::Resource,
            }),
        }
    }

    pub fn event(&self, id: &UnitId) -> Result<Arc<EventDef>, WeftError> {
        match self.units.get(id).map(|u| u.def.clone()) {
            Some(UnitDef::Event(def)) => Ok(def),
            _ => Err(WeftError::UnknownUnit {
                id: id.clone(),
                kind: UnitKind::Event,
            }),
        }
    }

    pub fn hook(&self, id: &UnitId) -> Result<Arc<HookDef>, WeftError> {
        match self.units.get(id).map(|u| u.def.clone()) {
            Some(UnitDef::Hook(def)) => Ok(def),
            _ => Err(WeftError::UnknownUnit {
                id: id.clone(),
                kind: UnitKind::Hook,
            }),
        }
    }

    pub fn task_middleware(&self, id: &UnitId) -> Result<Arc<TaskMiddlewareDef>, WeftError> {
        match self.units.get(id).map(|u| u.def.clone()) {
            Some(UnitDef::TaskMiddleware(def)) => Ok(def),
            _ => Err(WeftError::UnknownUnit {
                id: id.clone(),
                kind: UnitKind::TaskMiddleware,
            }),
        }
    }

    pub fn resource_middleware(
        &self,
        id: &UnitId,
    ) -> Result<Arc<ResourceMiddlewareDef>, WeftError> {
        match self.units.get(id).map(|u| u.def.clone()) {
            Some(UnitDef::ResourceMiddleware(def)) => Ok(def),
            _ => Err(WeftError::UnknownUnit {
                id: id.clone(),
                kind: UnitKind::ResourceMiddleware,
            }),
        }
    }

    // ────────────────────────────────────────────────────────────────
    // Tag lookups
    // ────────────────────────────────────────────────────────────────

    fn with_tag(&self, tag_id: &UnitId) -> Vec<UnitId> {
        self.tag_index
            .get(tag_id)
            .map(|ids| ids.clone())
            .unwrap_or_default()
    }

    pub fn tasks_with_tag(&self, tag_id: &UnitId) -> Vec<Arc<TaskDef>> {
        self.with_tag(tag_id)
            .into_iter()
            .filter_map(|id| self.task(&id).ok())
            .collect()
    }

    pub fn resources_with_tag(&self, tag_id: &UnitId) -> Vec<Arc<ResourceDef>> {
        self.with_tag(tag_id)
            .into_iter()
            .filter_map(|id| self.resource(&id).ok())
            .collect()
    }

    pub fn events_with_tag(&self, tag_id: &UnitId) -> Vec<Arc<EventDef>> {
        self.with_tag(tag_id)
            .into_iter()
            .filter_map(|id| self.event(&id).ok())
            .collect()
    }

}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::builders::{event, resource, tag, task};
    use serde_json::json;

    fn stored(def: UnitDef) -> StoredUnit {
        StoredUnit {
            def,
            config: None,
            owner: None,
            depth: 0,
            exported_from: HashSet::new(),
        }
    }

    #[test]
    fn insert_and_typed_get() {
        let store = UnitStore::new();
        let t = task("t").run_value(|input, _| Ok(input)).build().unwrap();
        store.insert(stored(UnitDef::Task(t)));

        let id = UnitId::new("t").unwrap();
        assert!(store.task(&id).is_ok());
        assert!(store.resource(&id).is_err());
    }

    #[test]
    fn unknown_id_is_registration_missing() {
        let store = UnitStore::new();
        let err = store.task(&UnitId::new("ghost").unwrap()).unwrap_err();
        assert_eq!(err.kind(), "registration.missing");
    }

    #[test]
    fn tag_index_returns_registration_order() {
        let store = UnitStore::new();
        let audit = tag("audit").unwrap();

        let t1 = task("first")
            .tag(audit.clone())
            .run_value(|input, _| Ok(input))
            .build()
            .unwrap();
        let t2 = task("second")
            .tag(audit.with(json!({"level": 2})))
            .run_value(|input, _| Ok(input))
            .build()
            .unwrap();
        store.insert(stored(UnitDef::Task(t1)));
        store.insert(stored(UnitDef::Task(t2)));

        let tagged = store.tasks_with_tag(&audit.id);
        assert_eq!(tagged.len(), 2);
        assert_eq!(tagged[0].id.as_str(), "first");
        assert_eq!(tagged[1].id.as_str(), "second");
    }

    #[test]
    fn config_of_defaults_to_null() {
        let store = UnitStore::new();
        let r = resource("db").build().unwrap();
        store.insert(StoredUnit {
            def: UnitDef::Resource(r),
            config: Some(json!({"url": "x"})),
            owner: None,
            depth: 0,
            exported_from: HashSet::new(),
        });

        assert_eq!(
            store.config_of(&UnitId::new("db").unwrap()),
            json!({"url": "x"})
        );
        assert_eq!(store.config_of(&UnitId::new("ghost").unwrap()), Value::Null);
    }

    #[test]
    fn exported_from_marking() {
        let store = UnitStore::new();
        let e = event("ping").build().unwrap();
        store.insert(stored(UnitDef::Event(e)));

        let id = UnitId::new("ping").unwrap();
        let owner = UnitId::new("app").unwrap();
        store.mark_exported_from(&id, owner.clone());
        assert!(store.get(&id).unwrap().exported_from.contains(&owner));
    }
}

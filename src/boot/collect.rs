//! Registration tree traversal and override resolution (v0.1)
//!
//! Breadth-first walk over `register` lists from the root resource.
//! Each declaration becomes a candidate; the winning *definition* for an
//! id comes from the depth-indexed winner table: shallowest declaration
//! wins, ties resolve to the later visitation. A resource's `overrides`
//! are scanned before its own `register` list, so a later `register` at
//! the same depth still wins the tie-break.
//!
//! An override replaces the definition, not the placement: the unit stays
//! owned by the resource whose `register` list contributed it, so export
//! gates on that path keep applying.
//!
//! Function-valued `register` lists are realized exactly once, when the
//! winning resource definition is expanded.

use std::collections::{HashMap, VecDeque};

use serde_json::Value;

use crate::error::WeftError;
use crate::types::UnitId;
use crate::unit::{Registration, UnitDef};

/// One resolved unit: winning definition + original placement
#[derive(Debug, Clone)]
pub(crate) struct CollectedUnit {
    pub def: UnitDef,
    pub config: Option<Value>,
    /// Resource whose `register` list contributed the unit (None = root;
    /// falls back to the override declarer for ids never registered)
    pub owner: Option<UnitId>,
    /// Depth of the placement (root = 0, its children = 1, ...)
    pub depth: usize,
    /// Whether the winning definition came from an `overrides` list
    pub from_override: bool,
}

/// The resolved registration tree
#[derive(Debug)]
pub(crate) struct Collected {
    pub root: UnitId,
    /// Ids in first-seen order (stable registration index source)
    pub ordered: Vec<UnitId>,
    pub units: HashMap<UnitId, CollectedUnit>,
}

struct WorkItem {
    reg: Registration,
    owner: Option<UnitId>,
    depth: usize,
    from_override: bool,
}

/// Definition candidate under winner-table rules
struct DefCandidate {
    def: UnitDef,
    config: Option<Value>,
    decl_depth: usize,
    seq: usize,
    from_override: bool,
}

/// Placement from a `register` declaration (or override fallback)
struct PlacementCandidate {
    owner: Option<UnitId>,
    depth: usize,
    decl_depth: usize,
    seq: usize,
    /// Override declarations only place a unit no `register` ever did
    fallback: bool,
}

fn beats(depth: usize, seq: usize, current_depth: usize, current_seq: usize) -> bool {
    depth < current_depth || (depth == current_depth && seq > current_seq)
}

/// Opaque identity of a definition, for re-expansion detection
fn def_ptr(def: &UnitDef) -> usize {
    match def {
        UnitDef::Task(d) => std::sync::Arc::as_ptr(d) as usize,
        UnitDef::Resource(d) => std::sync::Arc::as_ptr(d) as usize,
        UnitDef::Event(d) => std::sync::Arc::as_ptr(d) as usize,
        UnitDef::Hook(d) => std::sync::Arc::as_ptr(d) as usize,
        UnitDef::TaskMiddleware(d) => std::sync::Arc::as_ptr(d) as usize,
        UnitDef::ResourceMiddleware(d) => std::sync::Arc::as_ptr(d) as usize,
        UnitDef::Tag(_) => 0,
    }
}

/// Walk the tree from the root registration and resolve overrides
pub(crate) fn collect(root: Registration) -> Result<Collected, WeftError> {
    let root_id = match &root.unit {
        UnitDef::Resource(def) => def.id.clone(),
        other => {
            return Err(WeftError::DefinitionInvalid {
                id: other.id().to_string(),
                reason: format!("the boot root must be a resource, got a {}", other.kind()),
            })
        }
    };

    let mut ordered: Vec<UnitId> = Vec::new();
    let mut defs: HashMap<UnitId, DefCandidate> = HashMap::new();
    let mut placements: HashMap<UnitId, PlacementCandidate> = HashMap::new();
    // resource id → def identity last expanded
    let mut expanded: HashMap<UnitId, usize> = HashMap::new();
    let mut seq = 0usize;

    let mut queue: VecDeque<WorkItem> = VecDeque::new();
    queue.push_back(WorkItem {
        reg: root,
        owner: None,
        depth: 0,
        from_override: false,
    });

    while let Some(item) = queue.pop_front() {
        let id = item.reg.id().clone();
        let kind = item.reg.unit.kind();
        seq += 1;

        // Single namespace: an id may recur (override/re-registration)
        // within a family, never across families.
        if let Some(existing) = defs.get(&id) {
            if existing.def.kind() != kind {
                return Err(WeftError::DefinitionInvalid {
                    id: id.to_string(),
                    reason: format!(
                        "id registered both as a {} and as a {}",
                        existing.def.kind(),
                        kind
                    ),
                });
            }
        } else {
            ordered.push(id.clone());
        }

        // Definition winner table: shallowest declaration, later visitation
        // on ties.
        let replace_def = match defs.get(&id) {
            None => true,
            Some(current) => beats(item.depth, seq, current.decl_depth, current.seq),
        };
        if replace_def {
            defs.insert(
                id.clone(),
                DefCandidate {
                    def: item.reg.unit.clone(),
                    config: item.reg.config.clone(),
                    decl_depth: item.depth,
                    seq,
                    from_override: item.from_override,
                },
            );
        }

        // Placement: `register` declarations own the unit; overrides only
        // place it when nothing else ever does.
        if !item.from_override {
            let replace_placement = match placements.get(&id) {
                None => true,
                Some(current) => {
                    current.fallback || beats(item.depth, seq, current.decl_depth, current.seq)
                }
            };
            if replace_placement {
                placements.insert(
                    id.clone(),
                    PlacementCandidate {
                        owner: item.owner.clone(),
                        depth: item.depth,
                        decl_depth: item.depth,
                        seq,
                        fallback: false,
                    },
                );
            }
        } else if !placements.contains_key(&id) {
            placements.insert(
                id.clone(),
                PlacementCandidate {
                    owner: item.owner.clone(),
                    depth: item.depth,
                    decl_depth: item.depth,
                    seq,
                    fallback: true,
                },
            );
        }

        // Expand the current winning definition of a resource id exactly
        // once per definition identity; a new winner triggers re-expansion.
        let winner = &defs[&id];
        if let UnitDef::Resource(def) = &winner.def {
            let identity = def_ptr(&winner.def);
            if expanded.get(&id) != Some(&identity) {
                expanded.insert(id.clone(), identity);
                let child_depth = placements[&id].depth + 1;

                // Overrides first, then the resource's own register list;
                // FIFO keeps the scan order as the visitation order.
                for reg in def.overrides.clone() {
                    queue.push_back(WorkItem {
                        reg,
                        owner: Some(id.clone()),
                        depth: child_depth,
                        from_override: true,
                    });
                }
                for reg in def.register.realize() {
                    queue.push_back(WorkItem {
                        reg,
                        owner: Some(id.clone()),
                        depth: child_depth,
                        from_override: false,
                    });
                }
            }
        }
    }

    let mut units: HashMap<UnitId, CollectedUnit> = HashMap::new();
    for (id, def_candidate) in defs {
        let placement = &placements[&id];
        units.insert(
            id,
            CollectedUnit {
                def: def_candidate.def,
                config: def_candidate.config,
                owner: placement.owner.clone(),
                depth: placement.depth,
                from_override: def_candidate.from_override,
            },
        );
    }

    Ok(Collected {
        root: root_id,
        ordered,
        units,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::builders::{event, resource, task};

    #[test]
    fn root_must_be_a_resource() {
        let t = task("t").run_value(|input, _| Ok(input)).build().unwrap();
        let err = collect(t.into()).unwrap_err();
        assert_eq!(err.kind(), "definition.invalid");
    }

    #[test]
    fn collects_nested_registrations() {
        let ping = event("ping").build().unwrap();
        let inner = resource("inner").register(vec![ping.into()]).build().unwrap();
        let root = resource("root").register(vec![inner.into()]).build().unwrap();

        let collected = collect(root.into()).unwrap();
        assert_eq!(collected.root.as_str(), "root");
        assert_eq!(collected.ordered.len(), 3);

        let ping_unit = &collected.units[&UnitId::new("ping").unwrap()];
        assert_eq!(ping_unit.owner.as_ref().unwrap().as_str(), "inner");
        assert_eq!(ping_unit.depth, 2);
    }

    #[test]
    fn same_unit_in_two_branches_is_instantiated_once() {
        let shared = event("shared").build().unwrap();
        let left = resource("left")
            .register(vec![shared.clone().into()])
            .build()
            .unwrap();
        let right = resource("right")
            .register(vec![shared.into()])
            .build()
            .unwrap();
        let root = resource("root")
            .register(vec![left.into(), right.into()])
            .build()
            .unwrap();

        let collected = collect(root.into()).unwrap();
        assert_eq!(
            collected
                .ordered
                .iter()
                .filter(|id| id.as_str() == "shared")
                .count(),
            1
        );
        // Same depth: the later visitation (right branch) wins the tie.
        let unit = &collected.units[&UnitId::new("shared").unwrap()];
        assert_eq!(unit.owner.as_ref().unwrap().as_str(), "right");
    }

    #[test]
    fn shallower_override_replaces_definition_keeps_placement() {
        let deep_task = task("svc")
            .run_value(|_, _| Ok(serde_json::json!("deep")))
            .build()
            .unwrap();
        let replacement = task("svc")
            .run_value(|_, _| Ok(serde_json::json!("override")))
            .build()
            .unwrap();

        let inner = resource("inner")
            .register(vec![deep_task.into()])
            .build()
            .unwrap();
        let root = resource("root")
            .overrides(vec![replacement.clone().into()])
            .register(vec![inner.into()])
            .build()
            .unwrap();

        let collected = collect(root.into()).unwrap();
        let winner = &collected.units[&UnitId::new("svc").unwrap()];
        assert!(winner.from_override);
        // The definition is the shallow override...
        match &winner.def {
            UnitDef::Task(def) => assert!(std::sync::Arc::ptr_eq(def, &replacement)),
            other => panic!("expected task, got {:?}", other.kind()),
        }
        // ...while the unit stays registered where it always was.
        assert_eq!(winner.owner.as_ref().unwrap().as_str(), "inner");
        assert_eq!(winner.depth, 2);
    }

    #[test]
    fn later_register_beats_override_at_same_depth() {
        let from_override = event("e").build().unwrap();
        let from_register = event("e").build().unwrap();

        let root = resource("root")
            .overrides(vec![from_override.into()])
            .register(vec![from_register.clone().into()])
            .build()
            .unwrap();

        let collected = collect(root.into()).unwrap();
        let winner = &collected.units[&UnitId::new("e").unwrap()];
        assert!(!winner.from_override);
        match &winner.def {
            UnitDef::Event(def) => assert!(std::sync::Arc::ptr_eq(def, &from_register)),
            other => panic!("expected event, got {:?}", other.kind()),
        }
    }

    #[test]
    fn cross_family_id_collision_is_fatal() {
        let e = event("x").build().unwrap();
        let t = task("x").run_value(|input, _| Ok(input)).build().unwrap();
        let root = resource("root")
            .register(vec![e.into(), t.into()])
            .build()
            .unwrap();

        let err = collect(root.into()).unwrap_err();
        assert_eq!(err.kind(), "definition.invalid");
        assert!(err.to_string().contains("both as a"));
    }

    #[test]
    fn deferred_register_realized_once() {
        use std::sync::atomic::{AtomicUsize, Ordering};
        use std::sync::Arc;

        let calls = Arc::new(AtomicUsize::new(0));
        let calls_clone = calls.clone();
        let root = resource("root")
            .register_with(move || {
                calls_clone.fetch_add(1, Ordering::SeqCst);
                vec![event("late").build().unwrap().into()]
            })
            .build()
            .unwrap();

        let collected = collect(root.into()).unwrap();
        assert!(collected.units.contains_key(&UnitId::new("late").unwrap()));
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }
}

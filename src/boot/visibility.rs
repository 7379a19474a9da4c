//! Export chains and visibility (v0.1)
//!
//! For every resource, computes what escapes it; a consumer may reference
//! an id iff an unbroken export chain runs from the id's registrar up to
//! the lowest common ancestor of consumer and registrar. A resource that
//! omits `exports` exposes everything it registers; `exports: []` seals it.

use std::collections::{HashMap, HashSet};

use crate::error::WeftError;
use crate::store::UnitStore;
use crate::types::UnitId;

/// Suffixes of task companion events; they inherit the task's visibility
const COMPANION_SUFFIXES: [&str; 2] = [":onError", ":afterRun"];

fn companion_base(id: &UnitId) -> Option<UnitId> {
    for suffix in COMPANION_SUFFIXES {
        if let Some(base) = id.as_str().strip_suffix(suffix) {
            return UnitId::new(base).ok();
        }
    }
    None
}

/// What boot feeds the visibility pass
pub(crate) struct VisibilityInput {
    /// unit id → owning resource (None for the root and built-ins)
    pub owners: HashMap<UnitId, Option<UnitId>>,
    /// resource id → declared exports (None = export everything)
    pub exports: HashMap<UnitId, Option<Vec<UnitId>>>,
}

/// Computed visibility tables
#[derive(Debug)]
pub(crate) struct Visibility {
    owners: HashMap<UnitId, Option<UnitId>>,
    exports: HashMap<UnitId, Option<HashSet<UnitId>>>,
    subtree: HashMap<UnitId, HashSet<UnitId>>,
    resources: HashSet<UnitId>,
}

impl Visibility {
    /// Build the tables and validate every `exports` list against its
    /// resource's transitive registration set.
    pub(crate) fn compute(input: VisibilityInput) -> Result<Self, WeftError> {
        let resources: HashSet<UnitId> = input.exports.keys().cloned().collect();

        // children: resource → directly owned units
        let mut children: HashMap<UnitId, Vec<UnitId>> = HashMap::new();
        for (id, owner) in &input.owners {
            if let Some(owner) = owner {
                children.entry(owner.clone()).or_default().push(id.clone());
            }
        }

        // subtree: resource → transitively owned units
        let mut subtree: HashMap<UnitId, HashSet<UnitId>> = HashMap::new();
        for resource in &resources {
            let mut set = HashSet::new();
            let mut stack = vec![resource.clone()];
            while let Some(current) = stack.pop() {
                for child in children.get(&current).into_iter().flatten() {
                    if set.insert(child.clone()) && resources.contains(child) {
                        stack.push(child.clone());
                    }
                }
            }
            subtree.insert(resource.clone(), set);
        }

        // Validate declared exports: every listed id must be registered
        // somewhere under the declaring resource.
        let mut exports: HashMap<UnitId, Option<HashSet<UnitId>>> = HashMap::new();
        for (resource, decl) in &input.exports {
            match decl {
                None => {
                    exports.insert(resource.clone(), None);
                }
                Some(list) => {
                    let owned = &subtree[resource];
                    for id in list {
                        let target = companion_base(id).unwrap_or_else(|| id.clone());
                        if !owned.contains(&target) {
                            return Err(WeftError::VisibilityViolation {
                                target: id.clone(),
                                owner: resource.clone(),
                                consumer: resource.clone(),
                            });
                        }
                    }
                    exports.insert(resource.clone(), Some(list.iter().cloned().collect()));
                }
            }
        }

        Ok(Self {
            owners: input.owners,
            exports,
            subtree,
            resources,
        })
    }

    /// Owner chain of a unit, nearest first, ending at the root resource
    fn ancestors(&self, id: &UnitId) -> Vec<UnitId> {
        let mut chain = Vec::new();
        let mut current = self.owners.get(id).cloned().flatten();
        while let Some(owner) = current {
            current = self.owners.get(&owner).cloned().flatten();
            chain.push(owner);
        }
        chain
    }

    /// Does `resource` let `id` escape to its parent?
    fn allows(&self, resource: &UnitId, id: &UnitId) -> bool {
        match self.exports.get(resource) {
            None | Some(None) => true,
            Some(Some(list)) => {
                if list.contains(id) {
                    return true;
                }
                companion_base(id).is_some_and(|base| list.contains(&base))
            }
        }
    }

    /// May `consumer` reference `target`?
    pub(crate) fn visible(&self, consumer: &UnitId, target: &UnitId) -> bool {
        let target_chain = self.ancestors(target);
        if target_chain.is_empty() {
            // Root resource and built-ins are visible everywhere.
            return true;
        }

        // The consumer's scope: itself when it is a resource, then its
        // owner chain.
        let mut scope: HashSet<UnitId> = HashSet::new();
        if self.resources.contains(consumer) {
            scope.insert(consumer.clone());
        }
        scope.extend(self.ancestors(consumer));

        // Walk the target's chain rootward; every resource strictly below
        // the lowest common ancestor must export the target.
        for resource in &target_chain {
            if scope.contains(resource) {
                return true;
            }
            if !self.allows(resource, target) {
                return false;
            }
        }

        // No common ancestor (disjoint trees): visible only if the whole
        // chain exported it, which the loop already verified.
        true
    }

    /// Record `exported_from` marks on the store: every resource through
    /// which a unit escapes, walking up while the chain stays unbroken.
    pub(crate) fn mark_exports(&self, store: &UnitStore) {
        for id in store.ids() {
            for resource in self.ancestors(&id) {
                if self.allows(&resource, &id) {
                    store.mark_exported_from(&id, resource);
                } else {
                    break;
                }
            }
        }
    }

    /// The registrar (owning resource) of a unit, for error reporting
    pub(crate) fn owner_of(&self, id: &UnitId) -> Option<UnitId> {
        self.owners.get(id).cloned().flatten()
    }

    /// Whether `unit` sits in the transitive registration set of `resource`
    /// (everywhere-middleware scoping)
    pub(crate) fn within_subtree(&self, resource: &UnitId, unit: &UnitId) -> bool {
        self.subtree
            .get(resource)
            .is_some_and(|set| set.contains(unit))
    }
}

//! Dependency graph, cycle detection, topological order (v0.1)
//!
//! Edges run unit → dependency, including middleware attachments and the
//! middlewares' own dependencies, plus containment edges (a resource
//! initializes after the resources it registers). Cycles are fatal and
//! reported with the full chain.

use std::collections::{HashMap, HashSet};

use crate::error::WeftError;
use crate::types::UnitId;

pub(crate) type Edges = HashMap<UnitId, Vec<UnitId>>;

/// Assemble the edge table
pub(crate) fn build_edges(
    dep_edges: &HashMap<UnitId, Vec<UnitId>>,
    attachments: &HashMap<UnitId, Vec<UnitId>>,
    containment: &HashMap<UnitId, Vec<UnitId>>,
) -> Edges {
    let mut edges: Edges = HashMap::new();
    let mut push = |from: &UnitId, to: &UnitId| {
        let list = edges.entry(from.clone()).or_default();
        if !list.contains(to) {
            list.push(to.clone());
        }
    };

    for (unit, deps) in dep_edges {
        for dep in deps {
            push(unit, dep);
        }
    }
    for (unit, mws) in attachments {
        for mw in mws {
            push(unit, mw);
        }
    }
    for (resource, children) in containment {
        for child in children {
            push(resource, child);
        }
    }
    edges
}

/// DFS cycle detection; the error chain lists every id on the cycle,
/// closed with the repeated entry (`a -> b -> a`).
pub(crate) fn detect_cycles(edges: &Edges, ordered: &[UnitId]) -> Result<(), WeftError> {
    #[derive(Clone, Copy, PartialEq)]
    enum Color {
        White,
        Grey,
        Black,
    }

    let mut color: HashMap<UnitId, Color> = HashMap::new();
    let mut stack: Vec<UnitId> = Vec::new();

    fn visit(
        node: &UnitId,
        edges: &Edges,
        color: &mut HashMap<UnitId, Color>,
        stack: &mut Vec<UnitId>,
    ) -> Result<(), WeftError> {
        match color.get(node).copied().unwrap_or(Color::White) {
            Color::Black => return Ok(()),
            Color::Grey => {
                let start = stack.iter().position(|id| id == node).unwrap_or(0);
                let mut chain: Vec<UnitId> = stack[start..].to_vec();
                chain.push(node.clone());
                return Err(WeftError::DependencyCycle { chain });
            }
            Color::White => {}
        }

        color.insert(node.clone(), Color::Grey);
        stack.push(node.clone());
        for next in edges.get(node).into_iter().flatten() {
            visit(next, edges, color, stack)?;
        }
        stack.pop();
        color.insert(node.clone(), Color::Black);
        Ok(())
    }

    for node in ordered {
        visit(node, edges, &mut color, &mut stack)?;
    }
    Ok(())
}

/// Deps-first topological order over all units (DFS postorder), stable
/// with respect to registration order. Call after `detect_cycles`.
pub(crate) fn topo_order(edges: &Edges, ordered: &[UnitId]) -> Vec<UnitId> {
    let mut done: HashSet<UnitId> = HashSet::new();
    let mut out: Vec<UnitId> = Vec::new();

    fn visit(
        node: &UnitId,
        edges: &Edges,
        done: &mut HashSet<UnitId>,
        out: &mut Vec<UnitId>,
    ) {
        if done.contains(node) {
            return;
        }
        done.insert(node.clone());
        for next in edges.get(node).into_iter().flatten() {
            visit(next, edges, done, out);
        }
        out.push(node.clone());
    }

    for node in ordered {
        visit(node, edges, &mut done, &mut out);
    }
    out
}

/// For each resource, every resource reachable through its edges - the
/// "must initialize before me" set, used by parallel waves and lazy init.
pub(crate) fn resource_reachability(
    edges: &Edges,
    resources: &HashSet<UnitId>,
    topo: &[UnitId],
) -> HashMap<UnitId, Vec<UnitId>> {
    let position: HashMap<&UnitId, usize> =
        topo.iter().enumerate().map(|(i, id)| (id, i)).collect();

    let mut out: HashMap<UnitId, Vec<UnitId>> = HashMap::new();
    for resource in resources {
        let mut seen: HashSet<UnitId> = HashSet::new();
        let mut found: Vec<UnitId> = Vec::new();
        let mut stack: Vec<UnitId> = edges.get(resource).cloned().unwrap_or_default();
        while let Some(node) = stack.pop() {
            if !seen.insert(node.clone()) {
                continue;
            }
            if resources.contains(&node) && node != *resource {
                found.push(node.clone());
            }
            stack.extend(edges.get(&node).cloned().unwrap_or_default());
        }
        // Deps-first order keeps lazy init walking in topological order.
        found.sort_by_key(|id| position.get(id).copied().unwrap_or(usize::MAX));
        out.insert(resource.clone(), found);
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    fn id(s: &str) -> UnitId {
        UnitId::new(s).unwrap()
    }

    fn edges_of(pairs: &[(&str, &str)]) -> Edges {
        let mut edges: Edges = HashMap::new();
        for (from, to) in pairs {
            edges.entry(id(from)).or_default().push(id(to));
        }
        edges
    }

    #[test]
    fn no_cycle_in_a_dag() {
        let edges = edges_of(&[("a", "b"), ("b", "c"), ("a", "c")]);
        let ordered = vec![id("a"), id("b"), id("c")];
        assert!(detect_cycles(&edges, &ordered).is_ok());
    }

    #[test]
    fn cycle_error_lists_every_id_on_the_chain() {
        let edges = edges_of(&[("a", "b"), ("b", "c"), ("c", "a")]);
        let ordered = vec![id("a"), id("b"), id("c")];
        let err = detect_cycles(&edges, &ordered).unwrap_err();
        let msg = err.to_string();
        assert!(msg.contains("a -> b -> c -> a"), "got: {msg}");
    }

    #[test]
    fn self_dependency_is_a_cycle() {
        let edges = edges_of(&[("a", "a")]);
        let err = detect_cycles(&edges, &[id("a")]).unwrap_err();
        assert_eq!(err.kind(), "dependency.cycle");
    }

    #[test]
    fn topo_puts_dependencies_first() {
        let edges = edges_of(&[("app", "db"), ("app", "cache"), ("cache", "db")]);
        let ordered = vec![id("app"), id("db"), id("cache")];
        let topo = topo_order(&edges, &ordered);

        let pos = |s: &str| topo.iter().position(|x| x.as_str() == s).unwrap();
        assert!(pos("db") < pos("cache"));
        assert!(pos("cache") < pos("app"));
    }

    #[test]
    fn reachability_collects_transitive_resources() {
        let edges = edges_of(&[("app", "task1"), ("task1", "db"), ("app", "cache")]);
        let resources: HashSet<UnitId> =
            [id("app"), id("db"), id("cache")].into_iter().collect();
        let ordered = vec![id("app"), id("task1"), id("db"), id("cache")];
        let topo = topo_order(&edges, &ordered);

        let reach = resource_reachability(&edges, &resources, &topo);
        let app_deps = &reach[&id("app")];
        assert!(app_deps.contains(&id("db")));
        assert!(app_deps.contains(&id("cache")));
        assert!(reach[&id("db")].is_empty());
    }
}

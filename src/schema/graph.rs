//! Dependency graph over entity types.
//!
//! An edge `A -> B` means "A references B", so B must be restored first.
//! Ordering is a depth-first post-order with ties broken by type name,
//! which keeps restore runs reproducible.
//!
//! Cycles are legal only when they can be broken: a reference declared
//! deferrable that lies inside a strongly connected component (a self
//! reference included) is restored as NULL in the primary pass and patched
//! afterwards. Any cycle left after removing those edges is a configuration
//! bug and fails construction.

use std::collections::{BTreeMap, BTreeSet, HashMap};

use petgraph::algo::tarjan_scc;
use petgraph::graph::{DiGraph, NodeIndex};

use super::EntityType;
use crate::core::{BackupError, Result};

/// One foreign-key relationship between two entity types.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DependencyEdge {
    pub from: String,
    pub to: String,
    pub field: String,
    /// Restored as NULL in the primary pass and patched afterwards.
    pub deferred: bool,
}

#[derive(Debug, Clone, Default)]
pub struct DependencyGraph {
    order: Vec<String>,
    levels: Vec<Vec<String>>,
    edges: Vec<DependencyEdge>,
}

impl DependencyGraph {
    /// Builds the graph for `types`. Every reference target must be among them.
    pub fn build<'a>(types: impl IntoIterator<Item = &'a EntityType>) -> Result<Self> {
        let types: BTreeMap<&str, &EntityType> =
            types.into_iter().map(|t| (t.name(), t)).collect();

        let mut graph: DiGraph<&str, ()> = DiGraph::new();
        let mut index: HashMap<&str, NodeIndex> = HashMap::new();
        for name in types.keys() {
            index.insert(*name, graph.add_node(*name));
        }

        for entity in types.values() {
            for fk in entity.foreign_keys() {
                let target = index.get(fk.target.as_str()).ok_or_else(|| {
                    BackupError::Configuration(format!(
                        "'{}.{}' references unknown entity type '{}'",
                        entity.name(),
                        fk.field,
                        fk.target
                    ))
                })?;
                graph.add_edge(index[entity.name()], *target, ());
            }
        }

        let mut component: HashMap<NodeIndex, (usize, usize)> = HashMap::new();
        for (id, scc) in tarjan_scc(&graph).into_iter().enumerate() {
            let size = scc.len();
            for node in scc {
                component.insert(node, (id, size));
            }
        }

        let mut edges = Vec::new();
        for entity in types.values() {
            for fk in entity.foreign_keys() {
                let (from_scc, size) = component[&index[entity.name()]];
                let (to_scc, _) = component[&index[fk.target.as_str()]];
                let in_cycle = from_scc == to_scc && (size > 1 || entity.name() == fk.target);
                edges.push(DependencyEdge {
                    from: entity.name().to_string(),
                    to: fk.target.clone(),
                    field: fk.field.clone(),
                    deferred: in_cycle && fk.deferrable,
                });
            }
        }

        Self::from_edges(types.keys().map(|n| n.to_string()).collect(), edges)
    }

    fn from_edges(nodes: BTreeSet<String>, edges: Vec<DependencyEdge>) -> Result<Self> {
        let mut deps: BTreeMap<&str, BTreeSet<&str>> =
            nodes.iter().map(|n| (n.as_str(), BTreeSet::new())).collect();
        for edge in edges.iter().filter(|e| !e.deferred) {
            if let Some(set) = deps.get_mut(edge.from.as_str()) {
                set.insert(edge.to.as_str());
            }
        }

        let mut order: Vec<String> = Vec::with_capacity(nodes.len());
        let mut done: BTreeSet<&str> = BTreeSet::new();
        let mut path: Vec<&str> = Vec::new();
        for node in deps.keys() {
            visit(*node, &deps, &mut done, &mut path, &mut order)?;
        }

        let mut level_of: HashMap<&str, usize> = HashMap::new();
        let mut levels: Vec<Vec<String>> = Vec::new();
        for name in &order {
            let level = deps[name.as_str()]
                .iter()
                .filter(|dep| **dep != name.as_str())
                .map(|dep| level_of[dep] + 1)
                .max()
                .unwrap_or(0);
            level_of.insert(name.as_str(), level);
            if levels.len() <= level {
                levels.resize(level + 1, Vec::new());
            }
            levels[level].push(name.clone());
        }
        for level in &mut levels {
            level.sort();
        }

        Ok(Self {
            order,
            levels,
            edges,
        })
    }

    /// Restricts the graph to `names`, keeping deferral decisions made on
    /// the full graph.
    pub fn subgraph(&self, names: &BTreeSet<String>) -> Result<Self> {
        let edges = self
            .edges
            .iter()
            .filter(|e| names.contains(&e.from) && names.contains(&e.to))
            .cloned()
            .collect();
        Self::from_edges(names.clone(), edges)
    }

    /// All types, dependencies first.
    pub fn order(&self) -> &[String] {
        &self.order
    }

    /// Types grouped so that no two types in a level depend on each other.
    pub fn levels(&self) -> &[Vec<String>] {
        &self.levels
    }

    pub fn edges(&self) -> &[DependencyEdge] {
        &self.edges
    }

    pub fn contains(&self, name: &str) -> bool {
        self.order.iter().any(|n| n == name)
    }

    pub fn is_deferred(&self, entity: &str, field: &str) -> bool {
        self.edges
            .iter()
            .any(|e| e.deferred && e.from == entity && e.field == field)
    }

    /// Types that `entity` references through non-deferred edges.
    pub fn dependencies(&self, entity: &str) -> BTreeSet<&str> {
        self.edges
            .iter()
            .filter(|e| !e.deferred && e.from == entity)
            .map(|e| e.to.as_str())
            .collect()
    }
}

fn visit<'a>(
    node: &'a str,
    deps: &BTreeMap<&'a str, BTreeSet<&'a str>>,
    done: &mut BTreeSet<&'a str>,
    path: &mut Vec<&'a str>,
    order: &mut Vec<String>,
) -> Result<()> {
    if done.contains(node) {
        return Ok(());
    }
    if let Some(start) = path.iter().position(|n| *n == node) {
        let mut cycle: Vec<String> = path[start..].iter().map(|n| n.to_string()).collect();
        cycle.push(node.to_string());
        return Err(BackupError::CyclicDependencyUnresolved(cycle));
    }

    path.push(node);
    if let Some(targets) = deps.get(node) {
        for target in targets {
            visit(*target, deps, done, path, order)?;
        }
    }
    path.pop();

    done.insert(node);
    order.push(node.to_string());
    Ok(())
}

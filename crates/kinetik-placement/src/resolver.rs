//! Dependency resolver — Kahn's algorithm over service names.
//!
//! Each round collects every name whose remaining dependency set is empty,
//! appends them to the order in ascending name order, and strikes them
//! from everyone else's set. A round with nothing ready while names remain
//! means a cycle.

use std::collections::{BTreeMap, BTreeSet};

use tracing::debug;

use crate::error::ResolveError;

/// Per-request graph of `name → names it depends on`.
#[derive(Debug, Clone, Default)]
pub struct DependencyGraph {
    nodes: BTreeMap<String, BTreeSet<String>>,
}

impl DependencyGraph {
    pub fn new() -> Self {
        Self::default()
    }

    /// Add a node with its dependencies. Re-adding a name merges the sets.
    pub fn add<I, S>(&mut self, name: impl Into<String>, deps: I) -> &mut Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.nodes
            .entry(name.into())
            .or_default()
            .extend(deps.into_iter().map(Into::into));
        self
    }

    pub fn len(&self) -> usize {
        self.nodes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.nodes.is_empty()
    }

    /// Produce a deployment order where every dependency precedes its
    /// dependents.
    pub fn resolve(&self) -> Result<Vec<String>, ResolveError> {
        for (name, deps) in &self.nodes {
            if let Some(missing) = deps.iter().find(|d| !self.nodes.contains_key(*d)) {
                return Err(ResolveError::MissingDependency {
                    service: name.clone(),
                    dependency: missing.clone(),
                });
            }
        }

        let mut remaining = self.nodes.clone();
        let mut order = Vec::with_capacity(remaining.len());

        while !remaining.is_empty() {
            let ready: Vec<String> = remaining
                .iter()
                .filter(|(_, deps)| deps.is_empty())
                .map(|(name, _)| name.clone())
                .collect();

            if ready.is_empty() {
                let remaining: BTreeSet<String> = remaining.into_keys().collect();
                debug!(?remaining, "dependency cycle detected");
                return Err(ResolveError::CircularDependency { remaining });
            }

            for name in &ready {
                remaining.remove(name);
            }
            for deps in remaining.values_mut() {
                for name in &ready {
                    deps.remove(name);
                }
            }
            order.extend(ready);
        }

        Ok(order)
    }
}

impl<N, D, S> FromIterator<(N, D)> for DependencyGraph
where
    N: Into<String>,
    D: IntoIterator<Item = S>,
    S: Into<String>,
{
    fn from_iter<T: IntoIterator<Item = (N, D)>>(iter: T) -> Self {
        let mut graph = Self::new();
        for (name, deps) in iter {
            graph.add(name, deps);
        }
        graph
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn graph(edges: &[(&str, &[&str])]) -> DependencyGraph {
        edges.iter().map(|(n, d)| (*n, d.iter().copied())).collect()
    }

    fn assert_topological(g: &DependencyGraph, order: &[String]) {
        let pos = |n: &str| order.iter().position(|o| o == n).unwrap();
        for (name, deps) in &g.nodes {
            for dep in deps {
                assert!(pos(dep) < pos(name), "{dep} must precede {name}");
            }
        }
    }

    #[test]
    fn linear_chain() {
        let g = graph(&[("web", &["api"]), ("api", &["db"]), ("db", &[])]);
        assert_eq!(g.resolve().unwrap(), vec!["db", "api", "web"]);
    }

    #[test]
    fn ties_break_lexicographically() {
        let g = graph(&[
            ("zeta", &[]),
            ("alpha", &[]),
            ("mid", &["zeta", "alpha"]),
            ("beta", &["alpha"]),
        ]);
        assert_eq!(g.resolve().unwrap(), vec!["alpha", "zeta", "beta", "mid"]);
    }

    #[test]
    fn resolution_is_repeatable() {
        let g = graph(&[
            ("c", &["a"]),
            ("b", &["a"]),
            ("d", &["b", "c"]),
            ("a", &[]),
            ("e", &[]),
        ]);
        let first = g.resolve().unwrap();
        let second = g.resolve().unwrap();
        assert_eq!(first, second);
        assert_topological(&g, &first);
    }

    #[test]
    fn two_node_cycle_is_reported() {
        let g = graph(&[("a", &["b"]), ("b", &["a"])]);
        assert_eq!(
            g.resolve().unwrap_err(),
            ResolveError::CircularDependency {
                remaining: BTreeSet::from(["a".to_string(), "b".to_string()])
            }
        );
    }

    #[test]
    fn self_loop_is_a_cycle() {
        let g = graph(&[("a", &["a"]), ("b", &[])]);
        assert_eq!(
            g.resolve().unwrap_err(),
            ResolveError::CircularDependency {
                remaining: BTreeSet::from(["a".to_string()])
            }
        );
    }

    #[test]
    fn cycle_reports_only_unresolved_names() {
        let g = graph(&[
            ("base", &[]),
            ("a", &["base", "c"]),
            ("b", &["a"]),
            ("c", &["b"]),
            ("tail", &["c"]),
        ]);
        let ResolveError::CircularDependency { remaining } = g.resolve().unwrap_err() else {
            panic!("expected a cycle");
        };
        assert!(!remaining.contains("base"));
        assert!(remaining.contains("a") && remaining.contains("b") && remaining.contains("c"));
        assert!(remaining.contains("tail"));
    }

    #[test]
    fn missing_dependency_is_rejected() {
        let g = graph(&[("a", &["ghost"])]);
        assert_eq!(
            g.resolve().unwrap_err(),
            ResolveError::MissingDependency {
                service: "a".to_string(),
                dependency: "ghost".to_string()
            }
        );
    }

    #[test]
    fn empty_graph_resolves_to_nothing() {
        assert!(DependencyGraph::new().resolve().unwrap().is_empty());
    }
}

//! Metric dependency graph built once per registry snapshot.

use std::collections::{BTreeMap, BTreeSet, VecDeque};

use crate::error::{Result, TallyError};
use crate::reference::{extract_references, unique_names};
use crate::registry::SchemaRegistry;

/// Edges between calculated metrics and everything their formulas reference.
///
/// Edges are derived from formula text, so the graph is correct even when the
/// stored `depends_on_*` lists of a snapshot are missing or out of date.
#[derive(Debug, Clone, Default)]
pub struct DependencyGraph {
    /// calculated metric -> calculated metrics it references
    calculated_edges: BTreeMap<String, BTreeSet<String>>,
    /// calculated metric -> base metrics it references directly
    base_edges: BTreeMap<String, BTreeSet<String>>,
    /// any metric id -> calculated metrics referencing it directly
    reverse: BTreeMap<String, BTreeSet<String>>,
}

impl DependencyGraph {
    pub fn build(registry: &SchemaRegistry) -> Self {
        let mut graph = DependencyGraph::default();
        for metric in registry.calculated_metrics() {
            let refs = match extract_references(&metric.formula) {
                Ok(refs) => unique_names(&refs),
                // Unparseable formulas fall back to what was last compiled
                Err(_) => metric
                    .depends_on_base
                    .iter()
                    .chain(metric.depends_on_calculated.iter())
                    .cloned()
                    .collect(),
            };
            let calc = graph.calculated_edges.entry(metric.id.clone()).or_default();
            let base = graph.base_edges.entry(metric.id.clone()).or_default();
            for r in refs {
                if registry.calculated_metric(&r).is_some() {
                    calc.insert(r.clone());
                } else if registry.base_metric(&r).is_some() {
                    base.insert(r.clone());
                }
                graph.reverse.entry(r).or_default().insert(metric.id.clone());
            }
        }
        graph
    }

    pub fn calculated_dependencies(&self, id: &str) -> impl Iterator<Item = &String> {
        self.calculated_edges.get(id).into_iter().flatten()
    }

    pub fn direct_dependents(&self, id: &str) -> impl Iterator<Item = &String> {
        self.reverse.get(id).into_iter().flatten()
    }

    /// Every calculated metric that depends on `id`, directly or transitively.
    pub fn transitive_dependents(&self, id: &str) -> BTreeSet<String> {
        let mut seen = BTreeSet::new();
        let mut queue: VecDeque<&str> = VecDeque::from([id]);
        while let Some(current) = queue.pop_front() {
            for dependent in self.direct_dependents(current) {
                if dependent != id && seen.insert(dependent.clone()) {
                    queue.push_back(dependent);
                }
            }
        }
        seen
    }

    /// Base metrics reachable from `id` through calculated metrics.
    pub fn transitive_base_dependencies(&self, id: &str) -> BTreeSet<String> {
        let mut out = BTreeSet::new();
        let mut visited = BTreeSet::new();
        let mut stack = vec![id.to_string()];
        while let Some(current) = stack.pop() {
            if !visited.insert(current.clone()) {
                continue;
            }
            if let Some(base) = self.base_edges.get(&current) {
                out.extend(base.iter().cloned());
            }
            stack.extend(self.calculated_dependencies(&current).cloned());
        }
        out
    }

    /// Path `from -> ... -> to` following calculated-dependency edges, if any.
    ///
    /// Depth-first with a visited set, so it terminates on cyclic input.
    pub fn find_path(&self, from: &str, to: &str) -> Option<Vec<String>> {
        let mut visited = BTreeSet::new();
        let mut path = Vec::new();
        if self.dfs(from, to, &mut visited, &mut path) {
            Some(path)
        } else {
            None
        }
    }

    fn dfs(
        &self,
        current: &str,
        target: &str,
        visited: &mut BTreeSet<String>,
        path: &mut Vec<String>,
    ) -> bool {
        path.push(current.to_string());
        if current == target {
            return true;
        }
        if visited.insert(current.to_string()) {
            for next in self.calculated_dependencies(current) {
                if self.dfs(next, target, visited, path) {
                    return true;
                }
            }
        }
        path.pop();
        false
    }

    /// Cycle that `metric_id` would close if it depended on `dependencies`.
    ///
    /// The metric's own current edges are ignored: only the proposed ones count.
    pub fn cycle_through(&self, metric_id: &str, dependencies: &[String]) -> Option<Vec<String>> {
        for dep in dependencies {
            if dep == metric_id {
                return Some(vec![metric_id.to_string(), metric_id.to_string()]);
            }
            if let Some(path) = self.find_path(dep, metric_id) {
                let mut cycle = vec![metric_id.to_string()];
                cycle.extend(path);
                return Some(cycle);
            }
        }
        None
    }

    /// Order `subset` so every metric comes after the metrics it depends on (Kahn's algorithm).
    ///
    /// Only edges inside `subset` are considered; ties resolve by id.
    pub fn topological_order(&self, subset: &BTreeSet<String>) -> Result<Vec<String>> {
        let mut in_degree: BTreeMap<&str, usize> =
            subset.iter().map(|id| (id.as_str(), 0)).collect();
        for id in subset {
            for dep in self.calculated_dependencies(id) {
                if subset.contains(dep) {
                    *in_degree.entry(id.as_str()).or_default() += 1;
                }
            }
        }

        let mut ready: BTreeSet<&str> = in_degree
            .iter()
            .filter(|(_, deg)| **deg == 0)
            .map(|(id, _)| *id)
            .collect();
        let mut order = Vec::with_capacity(subset.len());
        while let Some(id) = ready.pop_first() {
            order.push(id.to_string());
            for dependent in self.direct_dependents(id) {
                if let Some(deg) = in_degree.get_mut(dependent.as_str()) {
                    *deg -= 1;
                    if *deg == 0 {
                        ready.insert(dependent.as_str());
                    }
                }
            }
        }

        if order.len() != subset.len() {
            let stuck: Vec<String> = in_degree
                .into_iter()
                .filter(|(_, deg)| *deg > 0)
                .map(|(id, _)| id.to_string())
                .collect();
            return Err(TallyError::CircularDependency { cycle: stuck });
        }
        Ok(order)
    }
}

//! AN-003: Template resolution and stack dependency graph.
//!
//! Resolves `{{params.key}}` templates in the app file. Builds the stack DAG
//! from explicit `add_dependency` edges, cross-stack output references and
//! cross-stack node dependencies, then computes the apply order using Kahn's
//! algorithm with declaration-order tie-breaking.

use super::app::App;
use super::types::yaml_value_to_string;
use crate::error::{Error, Result};
use indexmap::IndexMap;
use std::cmp::Reverse;
use std::collections::{BinaryHeap, HashMap};
use std::fmt;

// ============================================================================
// Templates
// ============================================================================

/// Resolve all `{{params.key}}` variables in a string.
pub fn resolve_template(
    template: &str,
    params: &IndexMap<String, serde_yaml_ng::Value>,
) -> Result<String> {
    let mut result = template.to_string();
    let mut start = 0;

    while let Some(open) = result[start..].find("{{") {
        let open = start + open;
        let close = result[open..]
            .find("}}")
            .ok_or_else(|| Error::config(format!("unclosed template at position {}", open)))?;
        let close = open + close + 2;
        let key = result[open + 2..close - 2].trim();

        let value = match key.strip_prefix("params.") {
            Some(param_key) => params
                .get(param_key)
                .map(yaml_value_to_string)
                .ok_or_else(|| Error::config(format!("unknown param: {}", param_key)))?,
            None => return Err(Error::config(format!("unknown template variable: {}", key))),
        };

        result.replace_range(open..close, &value);
        start = open + value.len();
    }

    Ok(result)
}

/// Resolve templates in every string of a YAML tree, in place.
///
/// A string that is exactly one `{{params.key}}` takes the param's own YAML
/// value, so numbers and lists keep their type.
pub fn resolve_yaml_templates(
    value: &mut serde_yaml_ng::Value,
    params: &IndexMap<String, serde_yaml_ng::Value>,
) -> Result<()> {
    match value {
        serde_yaml_ng::Value::String(s) => {
            if let Some(whole) = whole_param(s) {
                let replacement = params
                    .get(whole)
                    .cloned()
                    .ok_or_else(|| Error::config(format!("unknown param: {}", whole)))?;
                *value = replacement;
            } else if s.contains("{{") {
                *s = resolve_template(s, params)?;
            }
        }
        serde_yaml_ng::Value::Sequence(items) => {
            for item in items {
                resolve_yaml_templates(item, params)?;
            }
        }
        serde_yaml_ng::Value::Mapping(m) => {
            for (_, v) in m.iter_mut() {
                resolve_yaml_templates(v, params)?;
            }
        }
        serde_yaml_ng::Value::Tagged(t) => resolve_yaml_templates(&mut t.value, params)?,
        _ => {}
    }
    Ok(())
}

fn whole_param(s: &str) -> Option<&str> {
    let inner = s.trim().strip_prefix("{{")?.strip_suffix("}}")?;
    if inner.contains("{{") || inner.contains("}}") {
        return None;
    }
    inner.trim().strip_prefix("params.")
}

// ============================================================================
// Stack dependency graph
// ============================================================================

/// Why an edge exists. Only the first reason for a pair is kept.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum EdgeReason {
    /// `add_dependency` / `depends_on`
    Explicit,
    /// A property references this output token
    Reference(String),
    /// `add_node_dependency` between constructs in different stacks
    NodeDependency { dependent: String, dependency: String },
}

impl fmt::Display for EdgeReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Explicit => write!(f, "explicit"),
            Self::Reference(token) => write!(f, "references {}", token),
            Self::NodeDependency {
                dependent,
                dependency,
            } => write!(f, "{} after {}", dependent, dependency),
        }
    }
}

/// Stack DAG: for each stack, the stacks it depends on.
#[derive(Debug, Clone)]
pub struct StackGraph {
    stacks: Vec<String>,
    index: HashMap<String, usize>,
    dependencies: Vec<IndexMap<usize, EdgeReason>>,
}

impl StackGraph {
    /// Empty graph over `stacks` (declaration order).
    pub fn new(stacks: Vec<String>) -> Self {
        let index = stacks
            .iter()
            .enumerate()
            .map(|(i, s)| (s.clone(), i))
            .collect();
        let dependencies = vec![IndexMap::new(); stacks.len()];
        Self {
            stacks,
            index,
            dependencies,
        }
    }

    /// Merge explicit and implicit edges from an app.
    pub fn build(app: &App) -> Result<Self> {
        let mut graph = Self::new(
            app.stacks()
                .iter()
                .map(|s| app.stack_id(*s).to_string())
                .collect(),
        );

        for (i, stack) in app.stacks().iter().enumerate() {
            for dep in app.explicit_dependencies(*stack) {
                let j = graph.require(app.stack_id(dep))?;
                graph.add_edge(i, j, EdgeReason::Explicit);
            }

            for node in app.resources_under(stack.node()) {
                let Some(resource) = app.node(node).resource() else {
                    continue;
                };
                for value in resource.properties.values() {
                    for r in value.refs() {
                        let j = graph.index.get(&r.producer_stack_id).copied().ok_or_else(|| {
                            Error::UnresolvedOutput {
                                consumer: app.path(node),
                                reference: r.token(),
                            }
                        })?;
                        graph.add_edge(i, j, EdgeReason::Reference(r.token()));
                    }
                }
            }
        }

        for &(dependent, dependency) in app.node_dependencies() {
            let a = app.stack_of(dependent).ok_or_else(|| Error::Detached {
                path: app.path(dependent),
            })?;
            let b = app.stack_of(dependency).ok_or_else(|| Error::Detached {
                path: app.path(dependency),
            })?;
            if a != b {
                let i = graph.require(app.stack_id(a))?;
                let j = graph.require(app.stack_id(b))?;
                graph.add_edge(
                    i,
                    j,
                    EdgeReason::NodeDependency {
                        dependent: app.path(dependent),
                        dependency: app.path(dependency),
                    },
                );
            }
        }

        Ok(graph)
    }

    fn require(&self, stack: &str) -> Result<usize> {
        self.index
            .get(stack)
            .copied()
            .ok_or_else(|| Error::config(format!("unknown stack '{}'", stack)))
    }

    /// Record that `dependent` applies after `dependency`. Returns false for
    /// self edges and duplicates.
    pub fn add_edge(&mut self, dependent: usize, dependency: usize, reason: EdgeReason) -> bool {
        if dependent == dependency || self.dependencies[dependent].contains_key(&dependency) {
            return false;
        }
        self.dependencies[dependent].insert(dependency, reason);
        true
    }

    /// Stack ids in declaration order.
    pub fn stacks(&self) -> &[String] {
        &self.stacks
    }

    /// Direct dependencies of a stack, in the order edges were added.
    pub fn dependencies_of(&self, stack: &str) -> Vec<&str> {
        match self.index.get(stack) {
            Some(&i) => self.dependencies[i]
                .keys()
                .map(|&j| self.stacks[j].as_str())
                .collect(),
            None => Vec::new(),
        }
    }

    /// Every edge as (dependent, dependency, reason).
    pub fn edges(&self) -> Vec<(&str, &str, &EdgeReason)> {
        let mut out = Vec::new();
        for (i, deps) in self.dependencies.iter().enumerate() {
            for (&j, reason) in deps {
                out.push((self.stacks[i].as_str(), self.stacks[j].as_str(), reason));
            }
        }
        out
    }

    pub fn edge_count(&self) -> usize {
        self.dependencies.iter().map(IndexMap::len).sum()
    }

    /// Topological apply order; dependencies always come first.
    pub fn apply_order(&self) -> Result<Vec<String>> {
        let adjacency: Vec<Vec<usize>> = self
            .dependencies
            .iter()
            .map(|deps| deps.keys().copied().collect())
            .collect();
        match topological_order(&adjacency) {
            Ok(order) => Ok(order.into_iter().map(|i| self.stacks[i].clone()).collect()),
            Err(cycle) => Err(Error::CyclicDependency {
                cycle: cycle.into_iter().map(|i| self.stacks[i].clone()).collect(),
            }),
        }
    }
}

/// Build the stack graph for an app and return its apply order.
pub fn compute_apply_order(app: &App) -> Result<Vec<String>> {
    StackGraph::build(app)?.apply_order()
}

/// Kahn's algorithm over `dependencies[i]` (the nodes `i` depends on).
///
/// Ready nodes are taken lowest index first, so ties follow declaration
/// order. On failure returns one cycle in depends-on order, rotated to start
/// at its lowest index. Dependency lists must not contain duplicates.
pub fn topological_order(dependencies: &[Vec<usize>]) -> std::result::Result<Vec<usize>, Vec<usize>> {
    let n = dependencies.len();
    let mut in_degree: Vec<usize> = dependencies.iter().map(Vec::len).collect();
    let mut dependents: Vec<Vec<usize>> = vec![Vec::new(); n];
    for (i, deps) in dependencies.iter().enumerate() {
        for &d in deps {
            dependents[d].push(i);
        }
    }

    let mut ready: BinaryHeap<Reverse<usize>> = (0..n)
        .filter(|&i| in_degree[i] == 0)
        .map(Reverse)
        .collect();
    let mut order = Vec::with_capacity(n);
    while let Some(Reverse(current)) = ready.pop() {
        order.push(current);
        for &next in &dependents[current] {
            in_degree[next] -= 1;
            if in_degree[next] == 0 {
                ready.push(Reverse(next));
            }
        }
    }

    if order.len() == n {
        return Ok(order);
    }
    Err(find_cycle(dependencies, &in_degree))
}

/// Walk unprocessed dependencies from the lowest stuck node until one repeats.
///
/// Every node left with a non-zero in-degree still waits on another such
/// node, so the walk cannot dead-end.
fn find_cycle(dependencies: &[Vec<usize>], in_degree: &[usize]) -> Vec<usize> {
    let stuck = |i: usize| in_degree[i] > 0;
    let Some(start) = (0..dependencies.len()).find(|&i| stuck(i)) else {
        return Vec::new();
    };

    let mut position: HashMap<usize, usize> = HashMap::new();
    let mut path = Vec::new();
    let mut current = start;
    loop {
        if let Some(&pos) = position.get(&current) {
            let mut cycle = path.split_off(pos);
            if let Some(min_pos) = cycle
                .iter()
                .enumerate()
                .min_by_key(|(_, &v)| v)
                .map(|(p, _)| p)
            {
                cycle.rotate_left(min_pos);
            }
            return cycle;
        }
        position.insert(current, path.len());
        path.push(current);
        match dependencies[current].iter().copied().filter(|&d| stuck(d)).min() {
            Some(next) => current = next,
            None => return path,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::app::StackProps;
    use crate::core::types::{ResourceKind, ResourceNode, Value};
    use proptest::prelude::*;

    fn params() -> IndexMap<String, serde_yaml_ng::Value> {
        let mut p = IndexMap::new();
        p.insert("cidr".to_string(), serde_yaml_ng::Value::String("10.0.0.0/16".into()));
        p.insert("max".to_string(), serde_yaml_ng::Value::Number(22u64.into()));
        p
    }

    fn stacks(app: &mut App, ids: &[&str]) -> Vec<crate::core::app::StackRef> {
        ids.iter()
            .map(|id| app.add_stack(*id, StackProps::default()).unwrap())
            .collect()
    }

    #[test]
    fn test_an003_resolve_params() {
        let result = resolve_template("cidr {{params.cidr}}", &params()).unwrap();
        assert_eq!(result, "cidr 10.0.0.0/16");
    }

    #[test]
    fn test_an003_resolve_multiple() {
        let result = resolve_template("{{params.cidr}}-{{ params.max }}", &params()).unwrap();
        assert_eq!(result, "10.0.0.0/16-22");
    }

    #[test]
    fn test_an003_resolve_unknown_param() {
        let err = resolve_template("{{params.missing}}", &params()).unwrap_err();
        assert!(err.to_string().contains("unknown param"));
    }

    #[test]
    fn test_an003_resolve_unclosed() {
        assert!(resolve_template("{{params.cidr", &params()).is_err());
    }

    #[test]
    fn test_an003_yaml_whole_param_keeps_type() {
        let mut v: serde_yaml_ng::Value =
            serde_yaml_ng::from_str("max_size: \"{{params.max}}\"\nname: \"vpc-{{params.cidr}}\"\n")
                .unwrap();
        resolve_yaml_templates(&mut v, &params()).unwrap();
        assert_eq!(v["max_size"], serde_yaml_ng::Value::Number(22u64.into()));
        assert_eq!(v["name"], serde_yaml_ng::Value::String("vpc-10.0.0.0/16".into()));
    }

    #[test]
    fn test_an003_topo_linear() {
        let mut app = App::new("t");
        let s = stacks(&mut app, &["Charts", "Eks", "Network"]);
        app.add_dependency(s[0], s[1]).unwrap();
        app.add_dependency(s[1], s[2]).unwrap();
        let order = compute_apply_order(&app).unwrap();
        assert_eq!(order, vec!["Network", "Eks", "Charts"]);
    }

    #[test]
    fn test_an003_topo_ties_follow_declaration_order() {
        let mut app = App::new("t");
        stacks(&mut app, &["zeta", "alpha", "mid"]);
        let order = compute_apply_order(&app).unwrap();
        assert_eq!(order, vec!["zeta", "alpha", "mid"]);
    }

    #[test]
    fn test_an003_topo_diamond() {
        let mut app = App::new("t");
        let s = stacks(&mut app, &["Network", "Eks", "Metrics", "Charts", "Autoscaler"]);
        app.add_dependency(s[1], s[0]).unwrap();
        app.add_dependency(s[2], s[1]).unwrap();
        app.add_dependency(s[3], s[1]).unwrap();
        app.add_dependency(s[4], s[1]).unwrap();
        let order = compute_apply_order(&app).unwrap();
        assert_eq!(order, vec!["Network", "Eks", "Metrics", "Charts", "Autoscaler"]);
    }

    #[test]
    fn test_an003_cycle_names_exact_members() {
        let mut app = App::new("t");
        let s = stacks(&mut app, &["A", "B", "C", "D"]);
        app.add_dependency(s[0], s[1]).unwrap();
        app.add_dependency(s[1], s[2]).unwrap();
        app.add_dependency(s[2], s[0]).unwrap();
        // D hangs off the cycle but is not part of it.
        app.add_dependency(s[3], s[0]).unwrap();

        match compute_apply_order(&app).unwrap_err() {
            Error::CyclicDependency { cycle } => assert_eq!(cycle, vec!["A", "B", "C"]),
            other => panic!("expected cycle, got {other}"),
        }
    }

    #[test]
    fn test_an003_cycle_reported_from_downstream_start() {
        // The lowest stuck node (Consumer) is outside the cycle.
        let mut app = App::new("t");
        let s = stacks(&mut app, &["Consumer", "X", "Y"]);
        app.add_dependency(s[0], s[1]).unwrap();
        app.add_dependency(s[1], s[2]).unwrap();
        app.add_dependency(s[2], s[1]).unwrap();
        match compute_apply_order(&app).unwrap_err() {
            Error::CyclicDependency { cycle } => assert_eq!(cycle, vec!["X", "Y"]),
            other => panic!("expected cycle, got {other}"),
        }
    }

    #[test]
    fn test_an003_implicit_edge_from_reference() {
        let mut app = App::new("t");
        let s = stacks(&mut app, &["Cluster", "Network"]);
        let vpc = app
            .add_resource(s[1], ResourceNode::new(ResourceKind::Vpc, "Vpc"))
            .unwrap();
        let vpc_id = app.attribute(vpc, "VpcId").unwrap();
        app.add_resource(
            s[0],
            ResourceNode::new(ResourceKind::SecurityGroup, "Sg").prop("VpcId", vpc_id),
        )
        .unwrap();

        let graph = StackGraph::build(&app).unwrap();
        assert_eq!(graph.dependencies_of("Cluster"), vec!["Network"]);
        assert_eq!(
            graph.edges()[0].2,
            &EdgeReason::Reference("Network.Vpc.VpcId".into())
        );
        assert_eq!(graph.apply_order().unwrap(), vec!["Network", "Cluster"]);
    }

    #[test]
    fn test_an003_edges_merge_without_duplicates() {
        let mut app = App::new("t");
        let s = stacks(&mut app, &["Network", "Cluster"]);
        let vpc = app
            .add_resource(s[0], ResourceNode::new(ResourceKind::Vpc, "Vpc"))
            .unwrap();
        let vpc_id = app.attribute(vpc, "VpcId").unwrap();
        app.add_dependency(s[1], s[0]).unwrap();
        for i in 0..3 {
            app.add_resource(
                s[1],
                ResourceNode::new(ResourceKind::SecurityGroup, format!("Sg{i}"))
                    .prop("VpcId", vpc_id.clone()),
            )
            .unwrap();
        }
        let graph = StackGraph::build(&app).unwrap();
        assert_eq!(graph.edge_count(), 1);
        assert_eq!(graph.edges()[0].2, &EdgeReason::Explicit);
    }

    #[test]
    fn test_an003_same_stack_reference_adds_no_edge() {
        let mut app = App::new("t");
        let s = stacks(&mut app, &["Network"]);
        let vpc = app
            .add_resource(s[0], ResourceNode::new(ResourceKind::Vpc, "Vpc"))
            .unwrap();
        let vpc_id = app.attribute(vpc, "VpcId").unwrap();
        app.add_resource(
            s[0],
            ResourceNode::new(ResourceKind::SecurityGroup, "Sg").prop("VpcId", vpc_id),
        )
        .unwrap();
        assert_eq!(StackGraph::build(&app).unwrap().edge_count(), 0);
    }

    #[test]
    fn test_an003_reference_to_unknown_stack() {
        let mut app = App::new("t");
        let s = stacks(&mut app, &["Cluster"]);
        let bogus = crate::core::types::OutputRef::new("Ghost", "Vpc", "VpcId");
        app.add_resource(
            s[0],
            ResourceNode::new(ResourceKind::SecurityGroup, "Sg").prop("VpcId", Value::Ref(bogus)),
        )
        .unwrap();
        let err = compute_apply_order(&app).unwrap_err();
        assert!(matches!(err, Error::UnresolvedOutput { ref reference, .. } if reference == "Ghost.Vpc.VpcId"));
    }

    #[test]
    fn test_an003_node_dependency_across_stacks() {
        let mut app = App::new("t");
        let s = stacks(&mut app, &["Charts", "Eks"]);
        let chart = app.add_construct(s[0], "WebApp").unwrap();
        let cluster = app.add_construct(s[1], "Cluster").unwrap();
        app.add_node_dependency(chart, cluster).unwrap();
        let graph = StackGraph::build(&app).unwrap();
        assert_eq!(graph.dependencies_of("Charts"), vec!["Eks"]);
        assert_eq!(graph.apply_order().unwrap(), vec!["Eks", "Charts"]);
    }

    fn arb_dag() -> impl Strategy<Value = Vec<Vec<usize>>> {
        (1usize..24).prop_flat_map(|n| {
            proptest::collection::vec(proptest::collection::vec(any::<prop::sample::Index>(), 0..4), n)
                .prop_map(move |raw| {
                    raw.into_iter()
                        .enumerate()
                        .map(|(i, picks)| {
                            // Only point at lower indices: always acyclic.
                            let mut deps: Vec<usize> =
                                if i == 0 { Vec::new() } else { picks.iter().map(|p| p.index(i)).collect() };
                            deps.sort_unstable();
                            deps.dedup();
                            deps
                        })
                        .collect()
                })
        })
    }

    proptest! {
        #[test]
        fn prop_an003_order_respects_every_edge(deps in arb_dag()) {
            let order = topological_order(&deps).unwrap();
            prop_assert_eq!(order.len(), deps.len());
            let mut position = vec![0; deps.len()];
            for (p, &node) in order.iter().enumerate() {
                position[node] = p;
            }
            for (i, ds) in deps.iter().enumerate() {
                for &d in ds {
                    prop_assert!(position[d] < position[i]);
                }
            }
        }

        #[test]
        fn prop_an003_back_edge_is_reported_as_cycle(deps in arb_dag()) {
            let mut deps = deps;
            let n = deps.len();
            prop_assume!(n >= 2);
            // The only upward edge is 0 -> last, so every cycle uses it.
            let last = n - 1;
            if !deps[last].contains(&0) {
                deps[last].push(0);
            }
            deps[0].push(last);
            let cycle = topological_order(&deps).unwrap_err();
            prop_assert!(cycle.contains(&0));
            prop_assert!(cycle.contains(&last));
            for w in 0..cycle.len() {
                let from = cycle[w];
                let to = cycle[(w + 1) % cycle.len()];
                prop_assert!(deps[from].contains(&to));
            }
        }
    }
}

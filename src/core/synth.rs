//! AN-004: Synthesis: construct tree to per-stack artifacts.
//!
//! Walks every stack depth-first, resolves output references against the
//! registry of exported attributes, checks resource-level DependsOn and
//! orders stack dependencies by apply order. Any error aborts the whole run.

use super::app::{App, NodeId, StackRef};
use super::resolver::{topological_order, StackGraph};
use super::state::write_atomic;
use super::types::{OutputRef, StackArtifact, SynthesizedResource, Value};
use crate::error::{Error, Result};
use crate::ledger::hasher::hash_string;
use indexmap::{IndexMap, IndexSet};
use serde::{Deserialize, Serialize};
use std::collections::{HashMap, HashSet};
use std::path::Path;
use tracing::debug;

/// Name of the manifest written next to the templates.
pub const MANIFEST_FILE: &str = "manifest.json";

/// Every artifact of one synthesis run plus the order to apply them in.
#[derive(Debug, Clone, PartialEq)]
pub struct CloudAssembly {
    pub app: String,
    pub apply_order: Vec<String>,
    /// One artifact per stack, in apply order.
    pub artifacts: Vec<StackArtifact>,
}

/// `manifest.json` of a written assembly.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AssemblyManifest {
    pub version: String,
    pub app: String,
    pub apply_order: Vec<String>,
    pub stacks: IndexMap<String, ManifestEntry>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ManifestEntry {
    pub template: String,
    pub hash: String,
    pub resources: usize,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub depends_on: Vec<String>,
}

impl CloudAssembly {
    pub fn artifact(&self, stack_id: &str) -> Option<&StackArtifact> {
        self.artifacts.iter().find(|a| a.stack_id == stack_id)
    }

    /// Template file name for a stack.
    pub fn template_file(stack_id: &str) -> String {
        format!("{}.template.json", stack_id)
    }

    /// Write every template and the manifest into `dir`.
    ///
    /// The manifest is the commit point: any previous one is removed before
    /// the first template is written and the new one is written last, so a
    /// failed write leaves no manifest behind.
    pub fn write_to(&self, dir: &Path) -> Result<AssemblyManifest> {
        let manifest_path = dir.join(MANIFEST_FILE);
        match std::fs::remove_file(&manifest_path) {
            Ok(()) => {}
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
            Err(e) => return Err(Error::io("cannot remove", &manifest_path, e)),
        }

        let mut stacks = IndexMap::new();
        for artifact in &self.artifacts {
            let file = Self::template_file(&artifact.stack_id);
            let json = artifact.to_json()?;
            write_atomic(&dir.join(&file), &json)?;
            stacks.insert(
                artifact.stack_id.clone(),
                ManifestEntry {
                    template: file,
                    hash: hash_string(&json),
                    resources: artifact.resources.len(),
                    depends_on: artifact.depends_on.clone(),
                },
            );
        }
        let manifest = AssemblyManifest {
            version: "1.0".to_string(),
            app: self.app.clone(),
            apply_order: self.apply_order.clone(),
            stacks,
        };
        let mut json = serde_json::to_string_pretty(&manifest)?;
        json.push('\n');
        write_atomic(&manifest_path, &json)?;
        debug!(dir = %dir.display(), stacks = self.artifacts.len(), "wrote cloud assembly");
        Ok(manifest)
    }

    /// Read a written manifest back.
    pub fn read_manifest(dir: &Path) -> Result<AssemblyManifest> {
        let path = dir.join(MANIFEST_FILE);
        let content = std::fs::read_to_string(&path).map_err(|e| Error::io("cannot read", &path, e))?;
        Ok(serde_json::from_str(&content)?)
    }
}

/// Synthesize every stack of `app`.
///
/// Borrowing the app immutably keeps the tree frozen for the whole run.
pub fn synthesize(app: &App) -> Result<CloudAssembly> {
    let graph = StackGraph::build(app)?;
    let apply_order = graph.apply_order()?;
    let registry = output_registry(app);
    let position: HashMap<&str, usize> = apply_order
        .iter()
        .enumerate()
        .map(|(i, s)| (s.as_str(), i))
        .collect();

    let mut by_id: HashMap<String, StackArtifact> = HashMap::new();
    for &stack in app.stacks() {
        let artifact = synthesize_stack(app, stack, &graph, &registry, &position)?;
        by_id.insert(artifact.stack_id.clone(), artifact);
    }

    let artifacts = apply_order
        .iter()
        .filter_map(|id| by_id.remove(id))
        .collect();
    debug!(app = app.name(), order = ?apply_order, "synthesized");
    Ok(CloudAssembly {
        app: app.name().to_string(),
        apply_order,
        artifacts,
    })
}

/// Every (stack, logical id, attribute) some node exported.
fn output_registry(app: &App) -> HashSet<OutputRef> {
    app.stacks()
        .iter()
        .flat_map(|s| app.outputs_under(s.node()))
        .map(|(_, _, r)| r)
        .collect()
}

fn synthesize_stack(
    app: &App,
    stack: StackRef,
    graph: &StackGraph,
    registry: &HashSet<OutputRef>,
    position: &HashMap<&str, usize>,
) -> Result<StackArtifact> {
    let stack_id = app.stack_id(stack);
    let nodes = app.resources_under(stack.node());

    let mut depends_on: Vec<IndexSet<String>> = nodes
        .iter()
        .filter_map(|&n| app.node(n).resource())
        .map(|r| r.depends_on.iter().cloned().collect())
        .collect();
    add_node_dependencies(app, stack, &nodes, &mut depends_on)?;

    let mut resources = Vec::with_capacity(nodes.len());
    for (&node, deps) in nodes.iter().zip(depends_on) {
        let Some(resource) = app.node(node).resource() else {
            continue;
        };
        let mut properties = serde_json::Map::new();
        for (key, value) in &resource.properties {
            let path = format!("{}.properties.{}", app.path(node), key);
            properties.insert(key.clone(), render(value, &path, registry)?);
        }
        resources.push(SynthesizedResource {
            kind: resource.kind,
            logical_id: resource.logical_id.clone(),
            properties,
            depends_on: deps.into_iter().collect(),
        });
    }
    check_resource_order(stack_id, &resources)?;

    let mut stack_deps: Vec<String> = graph
        .dependencies_of(stack_id)
        .into_iter()
        .map(str::to_string)
        .collect();
    stack_deps.sort_by_key(|s| position.get(s.as_str()).copied().unwrap_or(usize::MAX));

    let prefix = format!("{}/", stack_id);
    let mut outputs = IndexMap::new();
    for (node, name, r) in app.outputs_under(stack.node()) {
        let path = app.path(node);
        let local = path.strip_prefix(&prefix).unwrap_or(&path);
        let key = format!("{}.{}", local, name);
        if outputs.contains_key(&key) {
            return Err(Error::DuplicateId {
                scope: format!("{} outputs", stack_id),
                id: key,
            });
        }
        outputs.insert(key, serde_json::Value::String(r.token()));
    }

    let props = app.stack_props(stack);
    debug!(stack = stack_id, resources = resources.len(), "synthesized stack");
    Ok(StackArtifact {
        stack_id: stack_id.to_string(),
        resources,
        depends_on: stack_deps,
        description: props.description.clone(),
        environment: (!props.env.is_empty()).then(|| props.env.clone()),
        outputs,
    })
}

/// Turn same-stack node dependencies into DependsOn between the resources
/// under each side.
fn add_node_dependencies(
    app: &App,
    stack: StackRef,
    nodes: &[NodeId],
    depends_on: &mut [IndexSet<String>],
) -> Result<()> {
    let slot: HashMap<NodeId, usize> = nodes.iter().enumerate().map(|(i, &n)| (n, i)).collect();
    for &(dependent, dependency) in app.node_dependencies() {
        if app.stack_of(dependent) != Some(stack) || app.stack_of(dependency) != Some(stack) {
            continue;
        }
        // Both sides may have been detached when the dependency was added.
        if app.overlaps(dependent, dependency) {
            return Err(Error::SelfDependency {
                id: app.path(dependent),
            });
        }
        let targets: Vec<String> = app
            .resources_under(dependency)
            .into_iter()
            .map(|n| app.node(n).id().to_string())
            .collect();
        for n in app.resources_under(dependent) {
            if let Some(&i) = slot.get(&n) {
                depends_on[i].extend(targets.iter().cloned());
            }
        }
    }
    Ok(())
}

/// DependsOn must name resources in the same stack and be acyclic.
fn check_resource_order(stack_id: &str, resources: &[SynthesizedResource]) -> Result<()> {
    let index: HashMap<&str, usize> = resources
        .iter()
        .enumerate()
        .map(|(i, r)| (r.logical_id.as_str(), i))
        .collect();

    let mut adjacency = Vec::with_capacity(resources.len());
    for r in resources {
        let mut deps = Vec::with_capacity(r.depends_on.len());
        for dep in &r.depends_on {
            let j = index.get(dep.as_str()).copied().ok_or_else(|| Error::UnknownResource {
                stack: stack_id.to_string(),
                logical_id: dep.clone(),
                referenced_by: r.logical_id.clone(),
            })?;
            deps.push(j);
        }
        adjacency.push(deps);
    }

    topological_order(&adjacency).map(|_| ()).map_err(|cycle| Error::CyclicDependency {
        cycle: cycle
            .into_iter()
            .map(|i| format!("{}.{}", stack_id, resources[i].logical_id))
            .collect(),
    })
}

/// Render a property value as JSON. References become `{"Ref": token}`.
fn render(value: &Value, path: &str, registry: &HashSet<OutputRef>) -> Result<serde_json::Value> {
    Ok(match value {
        Value::Null => serde_json::Value::Null,
        Value::Bool(b) => serde_json::Value::Bool(*b),
        Value::Int(i) => serde_json::Value::from(*i),
        Value::Float(f) => serde_json::Number::from_f64(*f)
            .map(serde_json::Value::Number)
            .ok_or_else(|| Error::InvalidValue {
                path: path.to_string(),
                reason: format!("{} is not a finite number", f),
            })?,
        Value::String(s) => serde_json::Value::String(s.clone()),
        Value::List(items) => serde_json::Value::Array(
            items
                .iter()
                .enumerate()
                .map(|(i, v)| render(v, &format!("{}[{}]", path, i), registry))
                .collect::<Result<_>>()?,
        ),
        Value::Map(entries) => {
            let mut map = serde_json::Map::new();
            for (k, v) in entries {
                map.insert(k.clone(), render(v, &format!("{}.{}", path, k), registry)?);
            }
            serde_json::Value::Object(map)
        }
        Value::Ref(r) => {
            if !registry.contains(r) {
                return Err(Error::UnresolvedOutput {
                    consumer: path.to_string(),
                    reference: r.token(),
                });
            }
            serde_json::json!({ "Ref": r.token() })
        }
    })
}

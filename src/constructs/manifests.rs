//! AN-008: Kubernetes manifests read from YAML files.
//!
//! Every document of every `*.yaml` file in a directory (sorted by file
//! name) becomes one manifest resource. Each depends on the one before it,
//! across file boundaries, so objects apply in file order.

use super::cluster::ClusterHandle;
use super::sanitize_id;
use crate::core::app::{App, NodeId};
use crate::core::types::{ResourceKind, ResourceNode, Value};
use crate::error::{Error, Result};
use serde::Deserialize;
use std::path::{Path, PathBuf};
use tracing::{debug, warn};

/// Parse every non-empty document of a multi-document YAML string.
pub fn load_documents(content: &str) -> Result<Vec<Value>> {
    let mut docs = Vec::new();
    for doc in serde_yaml_ng::Deserializer::from_str(content) {
        let yaml = serde_yaml_ng::Value::deserialize(doc)?;
        if yaml.is_null() {
            continue;
        }
        docs.push(Value::from_yaml(&yaml).map_err(Error::Parse)?);
    }
    Ok(docs)
}

/// `*.yaml` files directly under `dir`, sorted.
pub fn yaml_files(dir: &Path) -> Result<Vec<PathBuf>> {
    if !dir.is_dir() {
        return Err(Error::config(format!(
            "manifest directory {} does not exist",
            dir.display()
        )));
    }
    let pattern = format!("{}/*.yaml", glob::Pattern::escape(&dir.to_string_lossy()));
    let mut files = Vec::new();
    for entry in glob::glob(&pattern).map_err(|e| Error::config(format!("bad glob {}: {}", pattern, e)))? {
        let path = entry.map_err(|e| Error::config(format!("cannot list {}: {}", dir.display(), e)))?;
        files.push(path);
    }
    files.sort();
    Ok(files)
}

/// One `KubernetesManifest` resource applying `objects` to the cluster.
pub fn manifest_resource(logical_id: impl Into<String>, cluster: &ClusterHandle, objects: Vec<Value>) -> ResourceNode {
    ResourceNode::new(ResourceKind::KubernetesManifest, logical_id)
        .prop("ClusterName", cluster.cluster_name.clone())
        .prop("Manifest", Value::List(objects))
        .prop("Overwrite", true)
}

/// Add one manifest resource per document in `files`, chained in order.
///
/// Returns the logical id of the last resource added, for further chaining.
pub fn add_manifest_files(
    app: &mut App,
    parent: NodeId,
    prefix: &str,
    cluster: &ClusterHandle,
    files: &[PathBuf],
    mut previous: Option<String>,
) -> Result<Option<String>> {
    for file in files {
        let content = std::fs::read_to_string(file).map_err(|e| Error::io("cannot read", file, e))?;
        let stem = file
            .file_stem()
            .map(|s| s.to_string_lossy().to_string())
            .unwrap_or_default();
        let docs = load_documents(&content)
            .map_err(|e| Error::Parse(format!("{}: {}", file.display(), e)))?;
        for (i, doc) in docs.into_iter().enumerate() {
            let logical_id = format!("{}{}{}", prefix, sanitize_id(&stem), i);
            let mut resource = manifest_resource(logical_id.as_str(), cluster, vec![doc]);
            if let Some(prev) = &previous {
                resource = resource.after(prev.as_str());
            }
            app.add_resource(parent, resource)?;
            previous = Some(logical_id);
        }
    }
    Ok(previous)
}

/// Add a construct applying every manifest under `dir` to the cluster.
pub fn add_manifests(app: &mut App, scope: NodeId, id: &str, cluster: &ClusterHandle, dir: &Path) -> Result<NodeId> {
    let files = yaml_files(dir)?;
    if files.is_empty() {
        warn!(dir = %dir.display(), "no *.yaml manifests found");
    }
    let node = app.add_construct(scope, id)?;
    add_manifest_files(app, node, id, cluster, &files, None)?;
    app.add_node_dependency(node, cluster.node)?;
    debug!(manifests = %app.path(node), files = files.len(), "added manifests");
    Ok(node)
}

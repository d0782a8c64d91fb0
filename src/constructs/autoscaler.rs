//! AN-009: Cluster autoscaler: IAM policy on the node role plus the
//! autoscaler deployment.
//!
//! The deployment comes from `manifest_file` when set; otherwise a built-in
//! service account and deployment using ASG tag auto-discovery.

use super::cluster::{ClusterHandle, AUTOSCALING_ACTIONS};
use super::manifests::{add_manifest_files, manifest_resource};
use super::{allow_policy, join};
use crate::core::app::{App, NodeId};
use crate::core::types::{OutputRef, ResourceKind, ResourceNode, Value};
use crate::error::Result;
use serde::Deserialize;
use serde_json::json;
use std::path::PathBuf;
use tracing::debug;

/// Cluster autoscaler settings.
#[derive(Debug, Clone, Deserialize)]
pub struct ClusterAutoscalerProps {
    #[serde(default = "default_version")]
    pub version: String,

    #[serde(default = "default_image")]
    pub image: String,

    #[serde(default = "default_namespace")]
    pub namespace: String,

    /// Multi-document YAML applied instead of the built-in deployment
    #[serde(default)]
    pub manifest_file: Option<PathBuf>,
}

fn default_version() -> String {
    "v1.25.0".to_string()
}

fn default_image() -> String {
    "registry.k8s.io/autoscaling/cluster-autoscaler".to_string()
}

fn default_namespace() -> String {
    "kube-system".to_string()
}

impl Default for ClusterAutoscalerProps {
    fn default() -> Self {
        Self {
            version: default_version(),
            image: default_image(),
            namespace: default_namespace(),
            manifest_file: None,
        }
    }
}

/// Add a cluster autoscaler construct for `cluster`.
pub fn add_cluster_autoscaler(
    app: &mut App,
    scope: NodeId,
    id: &str,
    cluster: &ClusterHandle,
    props: &ClusterAutoscalerProps,
) -> Result<NodeId> {
    let node = app.add_construct(scope, id)?;
    let policy_id = format!("{id}Policy");
    app.add_resource(
        node,
        ResourceNode::new(ResourceKind::IamPolicy, policy_id.as_str())
            .prop("PolicyName", "ClusterAutoscalerPolicy")
            .prop("PolicyDocument", allow_policy(AUTOSCALING_ACTIONS))
            .prop("Roles", Value::List(vec![Value::Ref(cluster.node_role_name.clone())])),
    )?;

    match &props.manifest_file {
        Some(file) => {
            add_manifest_files(app, node, id, cluster, std::slice::from_ref(file), Some(policy_id))?;
        }
        None => {
            let objects = builtin_objects(props, &cluster.cluster_name);
            app.add_resource(
                node,
                manifest_resource(format!("{id}Manifest"), cluster, objects).after(policy_id.as_str()),
            )?;
        }
    }

    app.add_node_dependency(node, cluster.node)?;
    debug!(autoscaler = %app.path(node), "added cluster autoscaler");
    Ok(node)
}

fn builtin_objects(props: &ClusterAutoscalerProps, cluster_name: &OutputRef) -> Vec<Value> {
    let labels = json!({ "k8s-addon": "cluster-autoscaler.addons.k8s.io", "k8s-app": "cluster-autoscaler" });
    let service_account = Value::from_json(&json!({
        "apiVersion": "v1",
        "kind": "ServiceAccount",
        "metadata": { "name": "cluster-autoscaler", "namespace": props.namespace, "labels": labels },
    }));

    let mut command: Vec<Value> = [
        "./cluster-autoscaler",
        "--v=4",
        "--stderrthreshold=info",
        "--cloud-provider=aws",
        "--skip-nodes-with-local-storage=false",
        "--expander=least-waste",
        "--balance-similar-node-groups",
        "--skip-nodes-with-system-pods=false",
    ]
    .iter()
    .map(|s| Value::from(*s))
    .collect();
    command.push(join(vec![
        Value::from("--node-group-auto-discovery=asg:tag=k8s.io/cluster-autoscaler/enabled,k8s.io/cluster-autoscaler/"),
        Value::Ref(cluster_name.clone()),
    ]));

    let container = Value::map([
        ("name", Value::from("cluster-autoscaler")),
        ("image", Value::String(format!("{}:{}", props.image, props.version))),
        ("command", Value::List(command)),
        (
            "resources",
            Value::from_json(&json!({
                "limits": { "cpu": "100m", "memory": "600Mi" },
                "requests": { "cpu": "100m", "memory": "600Mi" },
            })),
        ),
    ]);

    let deployment = Value::map([
        ("apiVersion", Value::from("apps/v1")),
        ("kind", Value::from("Deployment")),
        (
            "metadata",
            Value::from_json(&json!({
                "name": "cluster-autoscaler",
                "namespace": props.namespace,
                "labels": { "app": "cluster-autoscaler" },
            })),
        ),
        (
            "spec",
            Value::map([
                ("replicas", Value::Int(1)),
                (
                    "selector",
                    Value::from_json(&json!({ "matchLabels": { "app": "cluster-autoscaler" } })),
                ),
                (
                    "template",
                    Value::map([
                        (
                            "metadata",
                            Value::from_json(&json!({ "labels": { "app": "cluster-autoscaler" } })),
                        ),
                        (
                            "spec",
                            Value::map([
                                ("serviceAccountName", Value::from("cluster-autoscaler")),
                                ("containers", Value::List(vec![container])),
                            ]),
                        ),
                    ]),
                ),
            ]),
        ),
    ]);

    vec![service_account, deployment]
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::constructs::cluster::{add_cluster, ClusterProps};
    use crate::constructs::network::NetworkInputs;
    use crate::core::app::StackProps;
    use crate::core::synth::synthesize;

    fn app_with_cluster() -> (App, ClusterHandle) {
        let mut app = App::new("t");
        let eks = app.add_stack("Eks", StackProps::default()).unwrap();
        let inputs = NetworkInputs {
            subnet_ids: vec![Value::from("subnet-a")],
            security_group_ids: vec![],
            source: None,
        };
        let handle = add_cluster(&mut app, eks.node(), "Cluster", &inputs, &ClusterProps::new("Demo")).unwrap();
        (app, handle)
    }

    #[test]
    fn test_an009_policy_attached_to_node_role() {
        let (mut app, cluster) = app_with_cluster();
        let eks = app.stack("Eks").unwrap();
        add_cluster_autoscaler(&mut app, eks.node(), "Autoscaler", &cluster, &ClusterAutoscalerProps::default()).unwrap();

        let assembly = synthesize(&app).unwrap();
        let artifact = assembly.artifact("Eks").unwrap();
        let policy = artifact.resource("AutoscalerPolicy").unwrap();
        assert_eq!(
            policy.properties["Roles"],
            json!([{ "Ref": "Eks.ClusterNodeRole.RoleName" }])
        );
        assert_eq!(
            policy.properties["PolicyDocument"]["Statement"][0]["Action"]
                .as_array()
                .unwrap()
                .len(),
            AUTOSCALING_ACTIONS.len()
        );
        assert!(policy.depends_on.contains(&"ClusterNodeRole".to_string()));
    }

    #[test]
    fn test_an009_builtin_deployment_joins_cluster_name() {
        let (mut app, cluster) = app_with_cluster();
        let eks = app.stack("Eks").unwrap();
        add_cluster_autoscaler(&mut app, eks.node(), "Autoscaler", &cluster, &ClusterAutoscalerProps::default()).unwrap();

        let assembly = synthesize(&app).unwrap();
        let manifest = assembly.artifact("Eks").unwrap().resource("AutoscalerManifest").unwrap();
        assert!(manifest.depends_on.contains(&"AutoscalerPolicy".to_string()));
        let objects = &manifest.properties["Manifest"];
        assert_eq!(objects[0]["kind"], "ServiceAccount");
        let container = &objects[1]["spec"]["template"]["spec"]["containers"][0];
        assert_eq!(container["image"], "registry.k8s.io/autoscaling/cluster-autoscaler:v1.25.0");
        let last = container["command"].as_array().unwrap().last().unwrap().clone();
        assert_eq!(last["Fn::Join"][1][1], json!({ "Ref": "Eks.ClusterCluster.Name" }));
    }

    #[test]
    fn test_an009_manifest_file_overrides_builtin() {
        let dir = tempfile::tempdir().unwrap();
        let file = dir.path().join("cluster-autoscaler-autodiscover.yaml");
        std::fs::write(&file, "kind: ServiceAccount\n---\nkind: ClusterRole\n---\nkind: Deployment\n").unwrap();

        let (mut app, cluster) = app_with_cluster();
        let eks = app.stack("Eks").unwrap();
        let props = ClusterAutoscalerProps {
            manifest_file: Some(file),
            ..ClusterAutoscalerProps::default()
        };
        add_cluster_autoscaler(&mut app, eks.node(), "Autoscaler", &cluster, &props).unwrap();

        let assembly = synthesize(&app).unwrap();
        let artifact = assembly.artifact("Eks").unwrap();
        assert!(artifact.resource("AutoscalerManifest").is_none());
        let first = artifact.resource("AutoscalerClusterAutoscalerAutodiscover0").unwrap();
        assert!(first.depends_on.contains(&"AutoscalerPolicy".to_string()));
        assert!(artifact.resource("AutoscalerClusterAutoscalerAutodiscover2").is_some());
    }

    #[test]
    fn test_an009_missing_manifest_file() {
        let (mut app, cluster) = app_with_cluster();
        let eks = app.stack("Eks").unwrap();
        let props = ClusterAutoscalerProps {
            manifest_file: Some(PathBuf::from("/nonexistent/autoscaler.yaml")),
            ..ClusterAutoscalerProps::default()
        };
        let err = add_cluster_autoscaler(&mut app, eks.node(), "Autoscaler", &cluster, &props).unwrap_err();
        assert!(matches!(err, crate::error::Error::Io { .. }));
    }
}

//! AN-007: Fargate profiles and their pod execution role.

use super::cluster::ClusterHandle;
use super::{managed_policy_arn, sanitize_id, tag_list, trust_policy};
use crate::core::app::{App, NodeId};
use crate::core::types::{OutputRef, ResourceKind, ResourceNode, Value};
use crate::error::{Error, Result};
use indexmap::IndexMap;
use serde::Deserialize;

/// One Fargate profile: which pods run on Fargate.
#[derive(Debug, Clone, Deserialize)]
pub struct FargateProfileProps {
    pub name: String,
    pub namespace: String,
    /// Pod labels the selector must match
    #[serde(default)]
    pub labels: IndexMap<String, String>,
    #[serde(default)]
    pub tags: IndexMap<String, String>,
}

impl FargateProfileProps {
    pub fn new(name: impl Into<String>, namespace: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            namespace: namespace.into(),
            labels: IndexMap::new(),
            tags: IndexMap::new(),
        }
    }

    fn validate(&self) -> Result<()> {
        if self.name.is_empty() || self.namespace.is_empty() {
            return Err(Error::config(format!(
                "fargate profile '{}': name and namespace are required",
                self.name
            )));
        }
        Ok(())
    }
}

/// Where a profile attaches.
#[derive(Debug, Clone)]
pub struct ProfileTarget {
    pub cluster_name: Value,
    pub pod_role_arn: Value,
    /// Defaults to the cluster's private subnets when absent
    pub subnets: Option<Value>,
    /// Same-stack logical id to order after
    pub after: Option<String>,
}

/// Add the pod execution role; returns a reference to its ARN.
pub fn pod_execution_role(app: &mut App, parent: NodeId, logical_id: &str, name: &str) -> Result<OutputRef> {
    let role = app.add_resource(
        parent,
        ResourceNode::new(ResourceKind::IamRole, logical_id)
            .prop("RoleName", format!("RoleForFargatePod-{name}"))
            .prop("AssumeRolePolicyDocument", trust_policy("eks-fargate-pods.amazonaws.com"))
            .prop(
                "ManagedPolicyArns",
                Value::strings([
                    managed_policy_arn("AmazonEKSFargatePodExecutionRolePolicy"),
                    managed_policy_arn("CloudWatchAgentServerPolicy"),
                ]),
            ),
    )?;
    app.attribute(role, "Arn")
}

/// Add one `AWS::EKS::FargateProfile` named `{prefix}{Name}FargateProfile`.
pub fn add_profile(
    app: &mut App,
    parent: NodeId,
    prefix: &str,
    target: &ProfileTarget,
    props: &FargateProfileProps,
) -> Result<NodeId> {
    props.validate()?;
    let labels = Value::List(
        props
            .labels
            .iter()
            .map(|(k, v)| Value::map([("Key", Value::from(k.as_str())), ("Value", Value::from(v.as_str()))]))
            .collect(),
    );
    let mut resource = ResourceNode::new(
        ResourceKind::EksFargateProfile,
        format!("{}{}FargateProfile", prefix, sanitize_id(&props.name)),
    )
    .prop("FargateProfileName", props.name.as_str())
    .prop("ClusterName", target.cluster_name.clone())
    .prop("PodExecutionRoleArn", target.pod_role_arn.clone())
    .prop(
        "Selectors",
        Value::List(vec![Value::map([
            ("Namespace", Value::from(props.namespace.as_str())),
            ("Labels", labels),
        ])]),
    );
    if let Some(subnets) = &target.subnets {
        resource = resource.prop("Subnets", subnets.clone());
    }
    if !props.tags.is_empty() {
        resource = resource.prop(
            "Tags",
            tag_list(props.tags.iter().map(|(k, v)| (k.as_str(), v.as_str()))),
        );
    }
    if let Some(after) = &target.after {
        resource = resource.after(after.as_str());
    }
    app.add_resource(parent, resource)
}

/// Standalone Fargate profile construct against an existing cluster.
pub fn add_fargate_profile(
    app: &mut App,
    scope: NodeId,
    id: &str,
    cluster: &ClusterHandle,
    props: &FargateProfileProps,
) -> Result<NodeId> {
    props.validate()?;
    let node = app.add_construct(scope, id)?;
    let pod_role = pod_execution_role(app, node, &format!("{id}PodRole"), id)?;
    let target = ProfileTarget {
        cluster_name: Value::Ref(cluster.cluster_name.clone()),
        pod_role_arn: Value::Ref(pod_role),
        subnets: None,
        after: None,
    };
    add_profile(app, node, id, &target, props)?;
    app.add_node_dependency(node, cluster.node)?;
    Ok(node)
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
            subnet_ids: vec![Value::from("subnet-a"), Value::from("subnet-b")],
            security_group_ids: vec![Value::from("sg-1")],
            source: None,
        };
        let handle = add_cluster(&mut app, eks.node(), "Cluster", &inputs, &ClusterProps::new("Demo")).unwrap();
        (app, handle)
    }

    #[test]
    fn test_an007_standalone_profile_same_stack() {
        let (mut app, cluster) = app_with_cluster();
        let eks = app.stack("Eks").unwrap();
        let mut props = FargateProfileProps::new("demo", "demo");
        props.labels.insert("environment".into(), "dev".into());
        add_fargate_profile(&mut app, eks.node(), "AppProfile", &cluster, &props).unwrap();

        let assembly = synthesize(&app).unwrap();
        let artifact = assembly.artifact("Eks").unwrap();
        let profile = artifact.resource("AppProfileDemoFargateProfile").unwrap();
        assert_eq!(
            profile.properties["Selectors"][0]["Labels"][0],
            serde_json::json!({ "Key": "environment", "Value": "dev" })
        );
        assert!(profile.properties.get("Subnets").is_none());
        // Node dependency on the cluster construct becomes DependsOn.
        assert!(profile.depends_on.contains(&"ClusterCluster".to_string()));
        assert!(profile.depends_on.contains(&"ClusterNodegroup".to_string()));
    }

    #[test]
    fn test_an007_standalone_profile_other_stack() {
        let (mut app, cluster) = app_with_cluster();
        let apps = app.add_stack("Apps", StackProps::default()).unwrap();
        add_fargate_profile(&mut app, apps.node(), "Monitor", &cluster, &FargateProfileProps::new("monitor", "fargate-container-insights")).unwrap();

        let assembly = synthesize(&app).unwrap();
        assert_eq!(assembly.apply_order, vec!["Eks", "Apps"]);
        let artifact = assembly.artifact("Apps").unwrap();
        assert_eq!(artifact.depends_on, vec!["Eks"]);
        assert!(artifact.resource("MonitorMonitorFargateProfile").unwrap().depends_on.is_empty());
    }

    #[test]
    fn test_an007_empty_namespace_rejected() {
        let (mut app, cluster) = app_with_cluster();
        let eks = app.stack("Eks").unwrap();
        let err = add_fargate_profile(&mut app, eks.node(), "P", &cluster, &FargateProfileProps::new("x", "")).unwrap_err();
        assert!(err.to_string().contains("namespace"));
        assert!(app.find("Eks/P").is_none());
    }
}

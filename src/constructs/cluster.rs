//! AN-006: EKS cluster construct, in two variants.
//!
//! `level1` declares the raw `AWS::EKS::Cluster` with its IAM roles, a
//! managed node group and optional Fargate profiles. `managed` swaps the raw
//! cluster for one higher-level managed cluster resource and adds node
//! group capacity against it. Both register the same outputs.

use super::fargate::{add_profile, pod_execution_role, FargateProfileProps, ProfileTarget};
use super::network::{NetworkInputs, SubnetPlacement};
use super::{allow_policy, managed_policy_arn, string_map, trust_policy};
use crate::core::app::{App, NodeId};
use crate::core::types::{OutputRef, ResourceKind, ResourceNode, Value};
use crate::error::{Error, Result};
use indexmap::IndexMap;
use serde::Deserialize;
use tracing::debug;

/// Actions the node role (and the autoscaler policy) need on the ASGs.
pub const AUTOSCALING_ACTIONS: &[&str] = &[
    "autoscaling:DescribeAutoScalingGroups",
    "autoscaling:DescribeAutoScalingInstances",
    "autoscaling:DescribeLaunchConfigurations",
    "autoscaling:DescribeTags",
    "autoscaling:SetDesiredCapacity",
    "autoscaling:TerminateInstanceInAutoScalingGroup",
    "ec2:DescribeLaunchTemplateVersions",
];

const NODE_POLICIES: &[&str] = &[
    "AmazonEKSWorkerNodePolicy",
    "AmazonEC2ContainerRegistryReadOnly",
    "AmazonEKS_CNI_Policy",
    "CloudWatchAgentServerPolicy",
];

/// Cluster design.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ClusterVariant {
    /// Raw CloudFormation-level resources
    Level1,
    /// One managed cluster resource plus node group capacity
    #[default]
    Managed,
}

/// Cluster construct settings.
#[derive(Debug, Clone, Deserialize)]
pub struct ClusterProps {
    pub cluster_name: String,

    #[serde(default)]
    pub variant: ClusterVariant,

    #[serde(default = "default_version")]
    pub version: String,

    /// Subnets the control plane and nodes are placed in
    #[serde(default)]
    pub subnets: SubnetPlacement,

    #[serde(default = "default_true")]
    pub endpoint_public_access: bool,

    #[serde(default)]
    pub endpoint_private_access: bool,

    #[serde(default = "default_public_cidrs")]
    pub public_access_cidrs: Vec<String>,

    /// Control-plane log types exported to CloudWatch
    #[serde(default = "default_logging")]
    pub logging: Vec<String>,

    #[serde(default = "default_nodegroup")]
    pub nodegroup: Option<NodegroupProps>,

    #[serde(default)]
    pub fargate_profiles: Vec<FargateProfileProps>,

    /// Extra AWS-managed policies for the node role
    #[serde(default)]
    pub node_policies: Vec<String>,
}

fn default_version() -> String {
    "1.25".to_string()
}

fn default_true() -> bool {
    true
}

fn default_public_cidrs() -> Vec<String> {
    vec!["0.0.0.0/0".to_string()]
}

fn default_logging() -> Vec<String> {
    ["api", "controllerManager", "scheduler", "authenticator", "audit"]
        .iter()
        .map(|s| s.to_string())
        .collect()
}

fn default_nodegroup() -> Option<NodegroupProps> {
    Some(NodegroupProps::default())
}

impl ClusterProps {
    pub fn new(cluster_name: impl Into<String>) -> Self {
        Self {
            cluster_name: cluster_name.into(),
            variant: ClusterVariant::default(),
            version: default_version(),
            subnets: SubnetPlacement::default(),
            endpoint_public_access: true,
            endpoint_private_access: false,
            public_access_cidrs: default_public_cidrs(),
            logging: default_logging(),
            nodegroup: default_nodegroup(),
            fargate_profiles: Vec::new(),
            node_policies: Vec::new(),
        }
    }
}

/// Managed node group settings.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct NodegroupProps {
    pub name: String,
    pub instance_types: Vec<String>,
    pub disk_size: u32,
    /// `ON_DEMAND` or `SPOT`
    pub capacity_type: String,
    pub min_size: u32,
    pub desired_size: u32,
    pub max_size: u32,
    pub max_unavailable: u32,
    pub labels: IndexMap<String, String>,
    pub ssh_key: Option<String>,
}

impl Default for NodegroupProps {
    fn default() -> Self {
        Self {
            name: "ManagedNodeGroup".to_string(),
            instance_types: vec!["t3.medium".to_string()],
            disk_size: 50,
            capacity_type: "ON_DEMAND".to_string(),
            min_size: 1,
            desired_size: 2,
            max_size: 5,
            max_unavailable: 1,
            labels: IndexMap::new(),
            ssh_key: None,
        }
    }
}

impl NodegroupProps {
    fn validate(&self) -> Result<()> {
        if self.min_size > self.desired_size || self.desired_size > self.max_size {
            return Err(Error::config(format!(
                "nodegroup '{}': need min_size <= desired_size <= max_size, got {} / {} / {}",
                self.name, self.min_size, self.desired_size, self.max_size
            )));
        }
        if self.instance_types.is_empty() {
            return Err(Error::config(format!(
                "nodegroup '{}': instance_types is empty",
                self.name
            )));
        }
        match self.capacity_type.as_str() {
            "ON_DEMAND" | "SPOT" => Ok(()),
            other => Err(Error::config(format!(
                "nodegroup '{}': unknown capacity_type '{}'",
                self.name, other
            ))),
        }
    }
}

/// Outputs of a cluster construct as references.
#[derive(Debug, Clone)]
pub struct ClusterHandle {
    pub node: NodeId,
    pub cluster_name: OutputRef,
    pub cluster_arn: OutputRef,
    pub node_role_arn: OutputRef,
    pub node_role_name: OutputRef,
}

impl ClusterHandle {
    /// Rebuild a handle from the outputs registered on a cluster construct.
    pub fn from_construct(app: &App, node: NodeId) -> Result<Self> {
        Ok(Self {
            node,
            cluster_name: app.get_output(node, "clusterName")?,
            cluster_arn: app.get_output(node, "clusterArn")?,
            node_role_arn: app.get_output(node, "nodeRoleArn")?,
            node_role_name: app.get_output(node, "nodeRoleName")?,
        })
    }
}

/// Add a cluster construct under `scope`.
pub fn add_cluster(
    app: &mut App,
    scope: NodeId,
    id: &str,
    network: &NetworkInputs,
    props: &ClusterProps,
) -> Result<ClusterHandle> {
    if props.cluster_name.is_empty() {
        return Err(Error::config(format!("cluster '{}': cluster_name is empty", id)));
    }
    if network.subnet_ids.is_empty() {
        return Err(Error::config(format!("cluster '{}': no subnets to place it in", id)));
    }
    if let Some(ng) = &props.nodegroup {
        ng.validate()?;
    }

    let node = app.add_construct(scope, id)?;
    let name = props.cluster_name.as_str();
    let subnets = Value::List(network.subnet_ids.clone());

    let role = app.add_resource(
        node,
        ResourceNode::new(ResourceKind::IamRole, format!("{id}ClusterRole"))
            .prop("RoleName", format!("RoleForEksCluster-{name}"))
            .prop("AssumeRolePolicyDocument", trust_policy("eks.amazonaws.com"))
            .prop(
                "ManagedPolicyArns",
                Value::strings([managed_policy_arn("AmazonEKSClusterPolicy")]),
            ),
    )?;
    let role_arn = app.attribute(role, "Arn")?;

    let cluster_id = format!("{id}Cluster");
    let cluster = match props.variant {
        ClusterVariant::Level1 => app.add_resource(
            node,
            ResourceNode::new(ResourceKind::EksCluster, cluster_id.as_str())
                .prop("Name", name)
                .prop("Version", props.version.as_str())
                .prop("RoleArn", role_arn)
                .prop(
                    "ResourcesVpcConfig",
                    Value::map([
                        ("SubnetIds", subnets.clone()),
                        ("SecurityGroupIds", Value::List(network.security_group_ids.clone())),
                        ("EndpointPublicAccess", Value::Bool(props.endpoint_public_access)),
                        ("EndpointPrivateAccess", Value::Bool(props.endpoint_private_access)),
                        ("PublicAccessCidrs", Value::strings(props.public_access_cidrs.iter().cloned())),
                    ]),
                )
                .prop(
                    "Logging",
                    Value::map([(
                        "ClusterLogging",
                        Value::map([(
                            "EnabledTypes",
                            Value::List(
                                props
                                    .logging
                                    .iter()
                                    .map(|t| Value::map([("Type", Value::from(t.as_str()))]))
                                    .collect(),
                            ),
                        )]),
                    )]),
                )
                .after(format!("{id}ClusterRole")),
        )?,
        ClusterVariant::Managed => app.add_resource(
            node,
            ResourceNode::new(ResourceKind::ManagedCluster, cluster_id.as_str())
                .prop(
                    "Config",
                    Value::map([
                        ("name", Value::from(name)),
                        ("version", Value::from(props.version.as_str())),
                        ("roleArn", Value::Ref(role_arn)),
                        (
                            "resourcesVpcConfig",
                            Value::map([
                                ("subnetIds", subnets.clone()),
                                ("securityGroupIds", Value::List(network.security_group_ids.clone())),
                                ("endpointPublicAccess", Value::Bool(props.endpoint_public_access)),
                                ("endpointPrivateAccess", Value::Bool(props.endpoint_private_access)),
                                ("publicAccessCidrs", Value::strings(props.public_access_cidrs.iter().cloned())),
                            ]),
                        ),
                        (
                            "logging",
                            Value::map([(
                                "clusterLogging",
                                Value::List(vec![Value::map([
                                    ("enabled", Value::Bool(true)),
                                    ("types", Value::strings(props.logging.iter().cloned())),
                                ])]),
                            )]),
                        ),
                    ]),
                )
                .after(format!("{id}ClusterRole")),
        )?,
    };
    let cluster_name = app.attribute(cluster, "Name")?;
    let cluster_arn = app.attribute(cluster, "Arn")?;

    let mut node_policies: Vec<String> = NODE_POLICIES.iter().map(|p| managed_policy_arn(p)).collect();
    node_policies.extend(props.node_policies.iter().map(|p| managed_policy_arn(p)));
    let node_role = app.add_resource(
        node,
        ResourceNode::new(ResourceKind::IamRole, format!("{id}NodeRole"))
            .prop("RoleName", format!("RoleForEksNode-{name}"))
            .prop("AssumeRolePolicyDocument", trust_policy("ec2.amazonaws.com"))
            .prop("ManagedPolicyArns", Value::strings(node_policies))
            .prop(
                "Policies",
                Value::List(vec![Value::map([
                    ("PolicyName", Value::String(format!("{name}-autoscaling"))),
                    ("PolicyDocument", allow_policy(AUTOSCALING_ACTIONS)),
                ])]),
            ),
    )?;
    let node_role_arn = app.attribute(node_role, "Arn")?;
    let node_role_name = app.attribute(node_role, "RoleName")?;

    if let Some(ng) = &props.nodegroup {
        let mut resource = ResourceNode::new(ResourceKind::EksNodegroup, format!("{id}Nodegroup"))
            .prop("NodegroupName", ng.name.as_str())
            .prop("ClusterName", cluster_name.clone())
            .prop("NodeRole", node_role_arn.clone())
            .prop("Subnets", subnets.clone())
            .prop("CapacityType", ng.capacity_type.as_str())
            .prop("InstanceTypes", Value::strings(ng.instance_types.iter().cloned()))
            .prop("DiskSize", ng.disk_size)
            .prop(
                "ScalingConfig",
                Value::map([
                    ("MinSize", Value::from(ng.min_size)),
                    ("DesiredSize", Value::from(ng.desired_size)),
                    ("MaxSize", Value::from(ng.max_size)),
                ]),
            )
            .prop(
                "UpdateConfig",
                Value::map([("MaxUnavailable", Value::from(ng.max_unavailable))]),
            )
            .prop("Labels", string_map(ng.labels.iter().map(|(k, v)| (k.as_str(), v.as_str()))))
            .prop("Tags", string_map(autoscaler_discovery_tags(name)))
            .after(cluster_id.as_str());
        if let Some(key) = &ng.ssh_key {
            resource = resource.prop(
                "RemoteAccess",
                Value::map([("Ec2SshKey", Value::from(key.as_str()))]),
            );
        }
        app.add_resource(node, resource)?;
    }

    if !props.fargate_profiles.is_empty() {
        let pod_role = pod_execution_role(app, node, &format!("{id}PodRole"), name)?;
        for profile in &props.fargate_profiles {
            let target = ProfileTarget {
                cluster_name: Value::Ref(cluster_name.clone()),
                pod_role_arn: Value::Ref(pod_role.clone()),
                subnets: Some(subnets.clone()),
                after: Some(cluster_id.clone()),
            };
            add_profile(app, node, id, &target, profile)?;
        }
    }

    app.register_output(node, "clusterName", cluster, "Name")?;
    app.register_output(node, "clusterArn", cluster, "Arn")?;
    app.register_output(node, "nodeRoleArn", node_role, "Arn")?;
    app.register_output(node, "nodeRoleName", node_role, "RoleName")?;
    if let Some(source) = network.source {
        if app.stack_of(source) == app.stack_of(node) {
            app.add_node_dependency(node, source)?;
        }
    }
    debug!(cluster = %app.path(node), variant = ?props.variant, "added cluster");

    Ok(ClusterHandle {
        node,
        cluster_name,
        cluster_arn,
        node_role_arn,
        node_role_name,
    })
}

/// Tags the cluster autoscaler uses to discover node groups.
pub fn autoscaler_discovery_tags(cluster_name: &str) -> [(String, String); 2] {
    [
        (
            format!("k8s.io/cluster-autoscaler/{}", cluster_name),
            "owned".to_string(),
        ),
        (
            "k8s.io/cluster-autoscaler/enabled".to_string(),
            "true".to_string(),
        ),
    ]
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::constructs::network::{add_network, NetworkProps};
    use crate::core::app::StackProps;
    use crate::core::synth::synthesize;

    fn cluster_app(props: &ClusterProps) -> (App, ClusterHandle) {
        let mut app = App::new("t");
        let net_stack = app.add_stack("NetworkStack", StackProps::default()).unwrap();
        let eks_stack = app.add_stack("EksStack", StackProps::default()).unwrap();
        let network = add_network(
            &mut app,
            net_stack.node(),
            "Network",
            &NetworkProps::new("EksVpc", "192.168.0.0/16"),
        )
        .unwrap();
        let handle = add_cluster(
            &mut app,
            eks_stack.node(),
            "Eks",
            &network.inputs(props.subnets),
            props,
        )
        .unwrap();
        (app, handle)
    }

    #[test]
    fn test_an006_level1_resources() {
        let mut props = ClusterProps::new("EksClusterLevel1");
        props.variant = ClusterVariant::Level1;
        props.fargate_profiles.push(FargateProfileProps::new("demo", "demo"));
        let (app, _) = cluster_app(&props);

        let assembly = synthesize(&app).unwrap();
        assert_eq!(assembly.apply_order, vec!["NetworkStack", "EksStack"]);
        let eks = assembly.artifact("EksStack").unwrap();
        let cluster = eks.resource("EksCluster").unwrap();
        assert_eq!(cluster.kind, ResourceKind::EksCluster);
        assert_eq!(cluster.depends_on, vec!["EksClusterRole"]);
        assert_eq!(
            cluster.properties["ResourcesVpcConfig"]["SubnetIds"][0],
            serde_json::json!({ "Ref": "NetworkStack.NetworkPrivateSubnet1.SubnetId" })
        );
        assert_eq!(
            cluster.properties["Logging"]["ClusterLogging"]["EnabledTypes"][1]["Type"],
            "controllerManager"
        );

        let ng = eks.resource("EksNodegroup").unwrap();
        assert_eq!(ng.depends_on, vec!["EksCluster"]);
        assert_eq!(ng.properties["ClusterName"], serde_json::json!({ "Ref": "EksStack.EksCluster.Name" }));
        assert_eq!(ng.properties["Tags"]["k8s.io/cluster-autoscaler/enabled"], "true");

        let profile = eks.resource("EksDemoFargateProfile").unwrap();
        assert_eq!(profile.depends_on, vec!["EksCluster"]);
        assert!(eks.resource("EksPodRole").is_some());
    }

    #[test]
    fn test_an006_managed_variant() {
        let mut props = ClusterProps::new("Hello");
        props.subnets = SubnetPlacement::Public;
        let (app, handle) = cluster_app(&props);
        assert_eq!(handle.cluster_name.token(), "EksStack.EksCluster.Name");

        let assembly = synthesize(&app).unwrap();
        let eks = assembly.artifact("EksStack").unwrap();
        let cluster = eks.resource("EksCluster").unwrap();
        assert_eq!(cluster.kind, ResourceKind::ManagedCluster);
        assert_eq!(
            cluster.properties["Config"]["resourcesVpcConfig"]["subnetIds"][2],
            serde_json::json!({ "Ref": "NetworkStack.NetworkPublicSubnet3.SubnetId" })
        );
        assert!(eks.resource("EksNodegroup").is_some());
        assert!(eks.resource("EksPodRole").is_none());
    }

    #[test]
    fn test_an006_node_role_policies() {
        let mut props = ClusterProps::new("C");
        props.node_policies.push("AmazonS3FullAccess".into());
        let (app, _) = cluster_app(&props);
        let assembly = synthesize(&app).unwrap();
        let role = assembly.artifact("EksStack").unwrap().resource("EksNodeRole").unwrap();
        let arns = role.properties["ManagedPolicyArns"].as_array().unwrap();
        assert_eq!(arns.len(), NODE_POLICIES.len() + 1);
        assert_eq!(
            role.properties["Policies"][0]["PolicyDocument"]["Statement"][0]["Action"][4],
            "autoscaling:SetDesiredCapacity"
        );
    }

    #[test]
    fn test_an006_handle_from_construct() {
        let (app, handle) = cluster_app(&ClusterProps::new("C"));
        let rebuilt = ClusterHandle::from_construct(&app, handle.node).unwrap();
        assert_eq!(rebuilt.node_role_name, handle.node_role_name);
        assert_eq!(rebuilt.cluster_arn.token(), "EksStack.EksCluster.Arn");
    }

    #[test]
    fn test_an006_bad_scaling_rejected() {
        let mut props = ClusterProps::new("C");
        if let Some(ng) = props.nodegroup.as_mut() {
            ng.min_size = 3;
            ng.desired_size = 2;
        }
        let mut app = App::new("t");
        let s = app.add_stack("S", StackProps::default()).unwrap();
        let inputs = NetworkInputs {
            subnet_ids: vec![Value::from("subnet-a")],
            security_group_ids: vec![],
            source: None,
        };
        let err = add_cluster(&mut app, s.node(), "Eks", &inputs, &props).unwrap_err();
        assert!(err.to_string().contains("min_size"));
    }

    #[test]
    fn test_an006_existing_vpc_literals() {
        let mut app = App::new("t");
        let s = app.add_stack("S", StackProps::default()).unwrap();
        let inputs = NetworkInputs {
            subnet_ids: vec![Value::from("subnet-a"), Value::from("subnet-b")],
            security_group_ids: vec![Value::from("sg-1")],
            source: None,
        };
        let mut props = ClusterProps::new("C");
        props.nodegroup = None;
        add_cluster(&mut app, s.node(), "Eks", &inputs, &props).unwrap();
        let assembly = synthesize(&app).unwrap();
        let artifact = assembly.artifact("S").unwrap();
        assert!(artifact.depends_on.is_empty());
        assert_eq!(
            artifact.resource("EksCluster").unwrap().properties["Config"]["resourcesVpcConfig"]["subnetIds"],
            serde_json::json!(["subnet-a", "subnet-b"])
        );
        assert!(artifact.resource("EksNodegroup").is_none());
    }

    #[test]
    fn test_an006_props_from_yaml() {
        let yaml = "cluster_name: Demo\nvariant: level1\nnodegroup:\n  instance_types: [t2.medium]\n  max_size: 22\n";
        let props: ClusterProps = serde_yaml_ng::from_str(yaml).unwrap();
        assert_eq!(props.variant, ClusterVariant::Level1);
        let ng = props.nodegroup.unwrap();
        assert_eq!(ng.max_size, 22);
        assert_eq!(ng.disk_size, 50);
        assert_eq!(props.logging.len(), 5);
    }
}

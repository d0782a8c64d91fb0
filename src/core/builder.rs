//! AN-011: Build an [`App`] from a parsed app file.
//!
//! Stacks are declared in file order, then explicit dependencies are wired,
//! then constructs are added stack by stack in file order. A construct may
//! only reference constructs that were built before it.

use super::app::{App, NodeId, StackProps};
use super::parser::{ref_target, split_output_ref};
use super::types::{AppConfig, ConstructSpec, RawResourceSpec, ResourceNode, Value};
use crate::constructs::autoscaler::add_cluster_autoscaler;
use crate::constructs::chart::{add_helm_chart, add_web_app_chart};
use crate::constructs::cluster::{add_cluster, ClusterHandle};
use crate::constructs::fargate::add_fargate_profile;
use crate::constructs::manifests::add_manifests;
use crate::constructs::network::{add_network, NetworkHandle, NetworkInputs};
use crate::error::{Error, Result};
use indexmap::IndexMap;
use std::path::{Path, PathBuf};
use tracing::{debug, info};

/// Build the construct tree. Relative paths resolve against `base_dir`.
pub fn build_app(config: &AppConfig, base_dir: &Path) -> Result<App> {
    let mut app = App::new(config.name.as_str());

    for (id, stack) in &config.stacks {
        let env = stack.env.clone().unwrap_or_else(|| config.env.clone());
        app.add_stack(
            id.as_str(),
            StackProps {
                description: stack.description.clone(),
                env,
            },
        )?;
    }

    for (id, stack) in &config.stacks {
        let dependent = stack_ref(&app, id)?;
        for dep in &stack.depends_on {
            let dependency = app.stack(dep).ok_or_else(|| {
                Error::config(format!("stack '{}' depends on unknown stack '{}'", id, dep))
            })?;
            app.add_dependency(dependent, dependency)?;
        }
    }

    for (stack_id, stack) in &config.stacks {
        let scope = stack_ref(&app, stack_id)?.node();
        for (construct_id, spec) in &stack.constructs {
            build_construct(&mut app, scope, construct_id, spec, base_dir).map_err(|e| match e {
                Error::Config(msg) => Error::config(format!("{}/{}: {}", stack_id, construct_id, msg)),
                other => other,
            })?;
            debug!(construct = %format!("{}/{}", stack_id, construct_id), kind = spec.type_name(), "built construct");
        }
    }

    info!(app = %config.name, stacks = config.stacks.len(), "built app");
    Ok(app)
}

fn stack_ref(app: &App, id: &str) -> Result<super::app::StackRef> {
    app.stack(id)
        .ok_or_else(|| Error::config(format!("stack '{}' was not declared", id)))
}

fn build_construct(app: &mut App, scope: NodeId, id: &str, spec: &ConstructSpec, base_dir: &Path) -> Result<()> {
    match spec {
        ConstructSpec::Network(props) => {
            add_network(app, scope, id, props)?;
        }
        ConstructSpec::EksCluster(cluster) => {
            let inputs = match (&cluster.network, &cluster.existing_vpc) {
                (Some(path), None) => {
                    let node = lookup(app, path)?;
                    NetworkHandle::from_construct(app, node)?.inputs(cluster.props.subnets)
                }
                (None, Some(vpc)) => {
                    debug!(cluster = id, vpc = %vpc.vpc_id, "placing cluster in existing VPC");
                    NetworkInputs {
                        subnet_ids: vpc.subnet_ids.iter().map(|s| Value::from(s.as_str())).collect(),
                        security_group_ids: vpc
                            .security_group_ids
                            .iter()
                            .map(|s| Value::from(s.as_str()))
                            .collect(),
                        source: None,
                    }
                }
                _ => return Err(Error::config("set exactly one of network or existing_vpc")),
            };
            add_cluster(app, scope, id, &inputs, &cluster.props)?;
        }
        ConstructSpec::FargateProfile(s) => {
            let cluster = cluster_handle(app, &s.cluster)?;
            add_fargate_profile(app, scope, id, &cluster, &s.props)?;
        }
        ConstructSpec::ClusterAutoscaler(s) => {
            let cluster = cluster_handle(app, &s.cluster)?;
            let mut props = s.props.clone();
            props.manifest_file = props.manifest_file.map(|f| relative_to(base_dir, &f));
            add_cluster_autoscaler(app, scope, id, &cluster, &props)?;
        }
        ConstructSpec::WebAppChart(s) => {
            let cluster = cluster_handle(app, &s.cluster)?;
            add_web_app_chart(app, scope, id, &cluster, &s.props)?;
        }
        ConstructSpec::HelmChart(s) => {
            let cluster = cluster_handle(app, &s.cluster)?;
            add_helm_chart(app, scope, id, &cluster, &s.props)?;
        }
        ConstructSpec::Manifests(s) => {
            let cluster = cluster_handle(app, &s.cluster)?;
            add_manifests(app, scope, id, &cluster, &relative_to(base_dir, Path::new(&s.dir)))?;
        }
        ConstructSpec::Resource(raw) => {
            add_raw_resource(app, scope, id, raw)?;
        }
    }
    Ok(())
}

fn lookup(app: &App, path: &str) -> Result<NodeId> {
    app.find(path)
        .ok_or_else(|| Error::config(format!("'{}' is not declared before this construct", path)))
}

fn cluster_handle(app: &App, path: &str) -> Result<ClusterHandle> {
    let node = lookup(app, path)?;
    ClusterHandle::from_construct(app, node)
}

fn relative_to(base_dir: &Path, path: &Path) -> PathBuf {
    if path.is_absolute() {
        path.to_path_buf()
    } else {
        base_dir.join(path)
    }
}

/// A raw resource sits directly under the stack; its logical id is the
/// construct id.
fn add_raw_resource(app: &mut App, scope: NodeId, id: &str, raw: &RawResourceSpec) -> Result<NodeId> {
    let mut resource = ResourceNode::new(raw.kind, id);
    let mut node_deps = Vec::new();
    for (key, value) in &raw.properties {
        resource = resource.prop(key.as_str(), convert_property(app, value)?);
    }
    for dep in &raw.depends_on {
        if dep.contains('/') {
            node_deps.push(lookup(app, dep)?);
        } else {
            resource = resource.after(dep.as_str());
        }
    }

    let node = app.add_resource(scope, resource)?;
    for output in &raw.outputs {
        app.attribute(node, output)?;
    }
    for dep in node_deps {
        app.add_node_dependency(node, dep)?;
    }
    Ok(node)
}

/// YAML property to [`Value`], turning `{ref: "Stack/Construct.output"}`
/// into an output reference.
fn convert_property(app: &App, value: &serde_yaml_ng::Value) -> Result<Value> {
    if let Some(target) = ref_target(value) {
        let (path, output) = split_output_ref(target).ok_or_else(|| {
            Error::config(format!("malformed ref '{}', expected Stack/Construct.output", target))
        })?;
        let node = lookup(app, path)?;
        return Ok(Value::Ref(app.get_output(node, output)?));
    }
    Ok(match value {
        serde_yaml_ng::Value::Sequence(items) => Value::List(
            items
                .iter()
                .map(|v| convert_property(app, v))
                .collect::<Result<_>>()?,
        ),
        serde_yaml_ng::Value::Mapping(m) => {
            let mut entries = IndexMap::new();
            for (k, v) in m {
                let key = k
                    .as_str()
                    .ok_or_else(|| Error::config(format!("property key must be a string, got {:?}", k)))?;
                entries.insert(key.to_string(), convert_property(app, v)?);
            }
            Value::Map(entries)
        }
        serde_yaml_ng::Value::Tagged(t) => convert_property(app, &t.value)?,
        scalar => Value::from_yaml(scalar).map_err(Error::config)?,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::parser::parse_config;
    use crate::core::synth::synthesize;
    use serde_json::json;

    const DEMO: &str = r#"
version: "1.0"
name: eks-demo
env:
  account: "123456789012"
  region: us-east-1
stacks:
  EksNetworkStack:
    constructs:
      Network:
        type: network
        name: EksVpc
        cidr: 192.168.0.0/16
  EksClusterStack:
    constructs:
      Cluster:
        type: eks_cluster
        network: EksNetworkStack/Network
        cluster_name: EksClusterLevel1
        variant: level1
      Autoscaler:
        type: cluster_autoscaler
        cluster: EksClusterStack/Cluster
  ChartStack:
    env:
      region: eu-west-1
    constructs:
      WebApp:
        type: web_app_chart
        cluster: EksClusterStack/Cluster
"#;

    fn build(yaml: &str) -> Result<App> {
        build_app(&parse_config(yaml)?, Path::new("."))
    }

    #[test]
    fn test_an011_build_demo() {
        let app = build(DEMO).unwrap();
        assert_eq!(app.stacks().len(), 3);
        assert!(app.find("EksClusterStack/Cluster/ClusterCluster").is_some());
        assert!(app.find("ChartStack/WebApp/WebAppHpa").is_some());

        let assembly = synthesize(&app).unwrap();
        assert_eq!(
            assembly.apply_order,
            vec!["EksNetworkStack", "EksClusterStack", "ChartStack"]
        );
        let cluster = assembly
            .artifact("EksClusterStack")
            .unwrap()
            .resource("ClusterCluster")
            .unwrap();
        assert_eq!(
            cluster.properties["ResourcesVpcConfig"]["SubnetIds"][0],
            json!({ "Ref": "EksNetworkStack.NetworkPrivateSubnet1.SubnetId" })
        );
    }

    #[test]
    fn test_an011_environment_defaults() {
        let app = build(DEMO).unwrap();
        let network = app.stack("EksNetworkStack").unwrap();
        assert_eq!(app.stack_props(network).env.region.as_deref(), Some("us-east-1"));
        let charts = app.stack("ChartStack").unwrap();
        assert_eq!(app.stack_props(charts).env.region.as_deref(), Some("eu-west-1"));
        assert_eq!(app.stack_props(charts).env.account, None);
    }

    #[test]
    fn test_an011_existing_vpc() {
        let yaml = r#"
version: "1.0"
name: x
stacks:
  Eks:
    constructs:
      Cluster:
        type: eks_cluster
        cluster_name: Demo
        existing_vpc:
          vpc_id: vpc-0abc
          subnet_ids: [subnet-1, subnet-2]
"#;
        let assembly = synthesize(&build(yaml).unwrap()).unwrap();
        let cluster = assembly.artifact("Eks").unwrap().resource("ClusterCluster").unwrap();
        assert_eq!(cluster.kind, crate::core::types::ResourceKind::ManagedCluster);
        let rendered = serde_json::to_string(&cluster.properties).unwrap();
        assert!(rendered.contains("subnet-2"));
        assert!(assembly.artifact("Eks").unwrap().resource("ClusterNodegroup").is_some());
    }

    #[test]
    fn test_an011_forward_reference_rejected() {
        let yaml = r#"
version: "1.0"
name: x
stacks:
  Charts:
    constructs:
      WebApp:
        type: web_app_chart
        cluster: Eks/Cluster
  Eks:
    constructs:
      Cluster:
        type: eks_cluster
        cluster_name: Demo
        existing_vpc: { vpc_id: v, subnet_ids: [s] }
"#;
        let err = build(yaml).unwrap_err();
        assert!(err.to_string().contains("Charts/WebApp"));
        assert!(err.to_string().contains("not declared before"));
    }

    #[test]
    fn test_an011_reference_to_wrong_construct() {
        let yaml = r#"
version: "1.0"
name: x
stacks:
  S:
    constructs:
      Net:
        type: network
        name: v
        cidr: 10.0.0.0/16
      Chart:
        type: helm_chart
        cluster: S/Net
        chart: metrics-server
"#;
        let err = build(yaml).unwrap_err();
        assert!(matches!(err, Error::UnknownOutput { .. }));
    }

    #[test]
    fn test_an011_raw_resources_and_refs() {
        let yaml = r#"
version: "1.0"
name: x
stacks:
  Net:
    constructs:
      Network:
        type: network
        name: v
        cidr: 10.0.0.0/16
  App:
    constructs:
      Sg:
        type: resource
        kind: "AWS::EC2::SecurityGroup"
        properties:
          GroupDescription: app
          VpcId: { ref: "Net/Network.vpcId" }
          Tags:
            - { Key: subnet, Value: { ref: "Net/Network.privateSubnet1Id" } }
        outputs: [GroupId]
      Ingress:
        type: resource
        kind: "AWS::EC2::SecurityGroupIngress"
        properties:
          GroupId: { ref: "App/Sg.GroupId" }
          IpProtocol: tcp
          FromPort: 443
        depends_on: [Sg]
"#;
        let app = build(yaml).unwrap();
        let assembly = synthesize(&app).unwrap();
        assert_eq!(assembly.apply_order, vec!["Net", "App"]);
        let artifact = assembly.artifact("App").unwrap();
        let sg = artifact.resource("Sg").unwrap();
        assert_eq!(sg.properties["VpcId"], json!({ "Ref": "Net.NetworkVpc.VpcId" }));
        assert_eq!(
            sg.properties["Tags"][0]["Value"],
            json!({ "Ref": "Net.NetworkPrivateSubnet1.SubnetId" })
        );
        let ingress = artifact.resource("Ingress").unwrap();
        assert_eq!(ingress.properties["GroupId"], json!({ "Ref": "App.Sg.GroupId" }));
        assert_eq!(ingress.properties["FromPort"], 443);
        assert_eq!(ingress.depends_on, vec!["Sg"]);
    }

    #[test]
    fn test_an011_raw_resource_node_dependency() {
        let yaml = r#"
version: "1.0"
name: x
stacks:
  A:
    constructs:
      First:
        type: resource
        kind: "AWS::IAM::Role"
  B:
    constructs:
      Second:
        type: resource
        kind: "AWS::IAM::Role"
        depends_on: [A/First]
"#;
        let assembly = synthesize(&build(yaml).unwrap()).unwrap();
        assert_eq!(assembly.artifact("B").unwrap().depends_on, vec!["A"]);
    }

    #[test]
    fn test_an011_explicit_stack_dependency() {
        let yaml = r#"
version: "1.0"
name: x
stacks:
  Late:
    depends_on: [Early]
  Early: {}
"#;
        let assembly = synthesize(&build(yaml).unwrap()).unwrap();
        assert_eq!(assembly.apply_order, vec!["Early", "Late"]);
    }

    #[test]
    fn test_an011_manifest_dir_relative_to_base() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::create_dir(dir.path().join("k8s")).unwrap();
        std::fs::write(dir.path().join("k8s/pod.yaml"), "apiVersion: v1\nkind: Pod\n").unwrap();
        let yaml = r#"
version: "1.0"
name: x
stacks:
  Eks:
    constructs:
      Cluster:
        type: eks_cluster
        cluster_name: Demo
        existing_vpc: { vpc_id: v, subnet_ids: [s] }
      Extra:
        type: manifests
        cluster: Eks/Cluster
        dir: k8s
"#;
        let app = build_app(&parse_config(yaml).unwrap(), dir.path()).unwrap();
        assert!(app.find("Eks/Extra/ExtraPod0").is_some());
    }
}

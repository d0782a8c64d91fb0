//! AN-005: Network construct: VPC, subnets, gateways, EKS security group.
//!
//! One public and one private `/24` per availability zone, carved in order
//! from the VPC CIDR (all public slices first). NAT gateways sit in the
//! first public subnets. The EKS security group admits ICMP from itself.

use super::tag_list;
use crate::core::app::{App, NodeId};
use crate::core::types::{OutputRef, ResourceKind, ResourceNode, Value};
use crate::error::{Error, Result};
use serde::Deserialize;
use std::net::Ipv4Addr;
use tracing::debug;

/// Network construct settings.
#[derive(Debug, Clone, Deserialize)]
pub struct NetworkProps {
    /// VPC name tag
    pub name: String,

    /// VPC CIDR, prefix `/24` or shorter
    pub cidr: String,

    #[serde(default = "default_max_azs")]
    pub max_azs: u32,

    /// NAT gateways, capped at `max_azs`
    #[serde(default = "default_nat_gateways")]
    pub nat_gateways: u32,

    /// Interface endpoint for STS in the private subnets
    #[serde(default = "default_true")]
    pub sts_endpoint: bool,
}

fn default_max_azs() -> u32 {
    3
}

fn default_nat_gateways() -> u32 {
    1
}

fn default_true() -> bool {
    true
}

impl NetworkProps {
    pub fn new(name: impl Into<String>, cidr: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            cidr: cidr.into(),
            max_azs: default_max_azs(),
            nat_gateways: default_nat_gateways(),
            sts_endpoint: true,
        }
    }
}

/// Which subnets a consumer should be placed in.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SubnetPlacement {
    Public,
    #[default]
    Private,
}

/// Outputs of a network construct as references.
#[derive(Debug, Clone)]
pub struct NetworkHandle {
    pub node: NodeId,
    pub vpc_id: OutputRef,
    pub security_group_id: OutputRef,
    pub public_subnet_ids: Vec<OutputRef>,
    pub private_subnet_ids: Vec<OutputRef>,
}

/// VPC placement handed to a cluster: references or literal ids.
#[derive(Debug, Clone, PartialEq)]
pub struct NetworkInputs {
    pub subnet_ids: Vec<Value>,
    pub security_group_ids: Vec<Value>,
    /// Construct to order after, when the network is managed here
    pub source: Option<NodeId>,
}

impl NetworkHandle {
    /// Rebuild a handle from the outputs registered on a network construct.
    pub fn from_construct(app: &App, node: NodeId) -> Result<Self> {
        Ok(Self {
            node,
            vpc_id: app.get_output(node, "vpcId")?,
            security_group_id: app.get_output(node, "securityGroupId")?,
            public_subnet_ids: numbered_outputs(app, node, "publicSubnet")?,
            private_subnet_ids: numbered_outputs(app, node, "privateSubnet")?,
        })
    }

    pub fn inputs(&self, placement: SubnetPlacement) -> NetworkInputs {
        let subnets = match placement {
            SubnetPlacement::Public => &self.public_subnet_ids,
            SubnetPlacement::Private => &self.private_subnet_ids,
        };
        NetworkInputs {
            subnet_ids: subnets.iter().cloned().map(Value::Ref).collect(),
            security_group_ids: vec![Value::Ref(self.security_group_id.clone())],
            source: Some(self.node),
        }
    }
}

fn numbered_outputs(app: &App, node: NodeId, prefix: &str) -> Result<Vec<OutputRef>> {
    let mut out = Vec::new();
    for n in 1.. {
        match app.get_output(node, &format!("{}{}Id", prefix, n)) {
            Ok(r) => out.push(r),
            Err(Error::UnknownOutput { .. }) => break,
            Err(e) => return Err(e),
        }
    }
    Ok(out)
}

/// Split `cidr` into `count` consecutive `/24` blocks.
pub fn carve_subnets(cidr: &str, count: u32) -> Result<Vec<String>> {
    let (addr, prefix) = cidr
        .split_once('/')
        .ok_or_else(|| Error::config(format!("invalid CIDR '{}': missing prefix", cidr)))?;
    let addr: Ipv4Addr = addr
        .parse()
        .map_err(|e| Error::config(format!("invalid CIDR '{}': {}", cidr, e)))?;
    let prefix: u32 = prefix
        .parse()
        .map_err(|e| Error::config(format!("invalid CIDR '{}': {}", cidr, e)))?;
    if prefix > 24 {
        return Err(Error::config(format!(
            "CIDR '{}' is too small for /24 subnets",
            cidr
        )));
    }
    let capacity = 1u64 << (24 - prefix);
    if u64::from(count) > capacity {
        return Err(Error::config(format!(
            "CIDR '{}' holds {} /24 subnets, {} needed",
            cidr, capacity, count
        )));
    }
    let mask = if prefix == 0 { 0 } else { u32::MAX << (32 - prefix) };
    let base = u32::from(addr) & mask;
    Ok((0..count)
        .map(|i| format!("{}/24", Ipv4Addr::from(base + (i << 8))))
        .collect())
}

/// Add a network construct under `scope`.
pub fn add_network(app: &mut App, scope: NodeId, id: &str, props: &NetworkProps) -> Result<NetworkHandle> {
    if props.max_azs == 0 {
        return Err(Error::config(format!("network '{}': max_azs must be at least 1", id)));
    }
    let subnet_count = props
        .max_azs
        .checked_mul(2)
        .ok_or_else(|| Error::config(format!("network '{}': max_azs {} is too large", id, props.max_azs)))?;
    let blocks = carve_subnets(&props.cidr, subnet_count)?;
    let node = app.add_construct(scope, id)?;

    let vpc = app.add_resource(
        node,
        ResourceNode::new(ResourceKind::Vpc, format!("{id}Vpc"))
            .prop("CidrBlock", props.cidr.as_str())
            .prop("EnableDnsHostnames", true)
            .prop("EnableDnsSupport", true)
            .prop("Tags", tag_list([("Name", props.name.as_str())])),
    )?;
    let vpc_id = app.attribute(vpc, "VpcId")?;

    let igw = app.add_resource(
        node,
        ResourceNode::new(ResourceKind::InternetGateway, format!("{id}Igw"))
            .prop("Tags", tag_list([("Name", props.name.as_str())])),
    )?;
    let igw_id = app.attribute(igw, "InternetGatewayId")?;
    let attachment = format!("{id}IgwAttachment");
    app.add_resource(
        node,
        ResourceNode::new(ResourceKind::VpcGatewayAttachment, attachment.as_str())
            .prop("VpcId", vpc_id.clone())
            .prop("InternetGatewayId", igw_id),
    )?;

    let azs = props.max_azs as usize;
    let mut public = Vec::with_capacity(azs);
    let mut private = Vec::with_capacity(azs);
    for (i, block) in blocks.iter().enumerate() {
        let is_public = i < azs;
        let az = if is_public { i } else { i - azs };
        let (kind, elb_role) = if is_public {
            ("Public", "kubernetes.io/role/elb")
        } else {
            ("Private", "kubernetes.io/role/internal-elb")
        };
        let subnet_name = format!("{}-{}Subnet{}", props.name, kind, az + 1);
        let subnet = app.add_resource(
            node,
            ResourceNode::new(ResourceKind::Subnet, format!("{id}{kind}Subnet{}", az + 1))
                .prop("VpcId", vpc_id.clone())
                .prop("CidrBlock", block.as_str())
                .prop("AvailabilityZone", select_az(az))
                .prop("MapPublicIpOnLaunch", is_public)
                .prop("Tags", tag_list([("Name", subnet_name.as_str()), (elb_role, "1")])),
        )?;
        let subnet_id = app.attribute(subnet, "SubnetId")?;
        let output = format!("{}Subnet{}Id", kind.to_lowercase(), az + 1);
        app.register_output(node, output, subnet, "SubnetId")?;
        if is_public {
            public.push(subnet_id);
        } else {
            private.push(subnet_id);
        }
    }

    for n in 0..props.nat_gateways.min(props.max_azs) as usize {
        let eip = app.add_resource(
            node,
            ResourceNode::new(ResourceKind::ElasticIp, format!("{id}NatEip{}", n + 1))
                .prop("Domain", "vpc")
                .after(attachment.as_str()),
        )?;
        let allocation = app.attribute(eip, "AllocationId")?;
        app.add_resource(
            node,
            ResourceNode::new(ResourceKind::NatGateway, format!("{id}NatGateway{}", n + 1))
                .prop("AllocationId", allocation)
                .prop("SubnetId", public[n].clone()),
        )?;
    }

    let sg = app.add_resource(
        node,
        ResourceNode::new(ResourceKind::SecurityGroup, format!("{id}EksSecurityGroup"))
            .prop("GroupName", "EksSecurityGroup")
            .prop("GroupDescription", "EKS control plane and node traffic")
            .prop("VpcId", vpc_id.clone()),
    )?;
    let group_id = app.attribute(sg, "GroupId")?;
    app.add_resource(
        node,
        ResourceNode::new(ResourceKind::SecurityGroupIngress, format!("{id}EksSecurityGroupSelfIcmp"))
            .prop("GroupId", group_id.clone())
            .prop("SourceSecurityGroupId", group_id.clone())
            .prop("IpProtocol", "icmp")
            .prop("FromPort", -1i64)
            .prop("ToPort", -1i64)
            .prop("Description", "self reference security group"),
    )?;

    if props.sts_endpoint {
        app.add_resource(
            node,
            ResourceNode::new(ResourceKind::VpcEndpoint, format!("{id}StsEndpoint"))
                .prop("VpcEndpointType", "Interface")
                .prop(
                    "ServiceName",
                    Value::map([("Fn::Sub", Value::from("com.amazonaws.${AWS::Region}.sts"))]),
                )
                .prop("VpcId", vpc_id.clone())
                .prop("SubnetIds", Value::List(private.iter().cloned().map(Value::Ref).collect()))
                .prop("SecurityGroupIds", Value::List(vec![Value::Ref(group_id.clone())]))
                .prop("PrivateDnsEnabled", true),
        )?;
    }

    app.register_output(node, "vpcId", vpc, "VpcId")?;
    app.register_output(node, "securityGroupId", sg, "GroupId")?;
    debug!(network = %app.path(node), azs = props.max_azs, "added network");

    Ok(NetworkHandle {
        node,
        vpc_id,
        security_group_id: group_id,
        public_subnet_ids: public,
        private_subnet_ids: private,
    })
}

fn select_az(index: usize) -> Value {
    Value::map([(
        "Fn::Select",
        Value::List(vec![
            Value::Int(index as i64),
            Value::map([("Fn::GetAZs", Value::from(""))]),
        ]),
    )])
}

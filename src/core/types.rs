//! AN-001: Core value types: property values, output references, resource
//! kinds, synthesized artifacts, the app file schema, and deploy events.
//!
//! Config types derive Deserialize for YAML; artifact types derive both
//! directions so templates can be written and read back.

use crate::constructs::autoscaler::ClusterAutoscalerProps;
use crate::constructs::chart::{HelmChartProps, WebAppChartProps};
use crate::constructs::cluster::ClusterProps;
use crate::constructs::fargate::FargateProfileProps;
use crate::constructs::network::NetworkProps;
use indexmap::IndexMap;
use serde::{Deserialize, Serialize};
use std::fmt;

// ============================================================================
// Property values
// ============================================================================

/// A property value inside a resource's property bag.
#[derive(Debug, Clone, PartialEq)]
pub enum Value {
    Null,
    Bool(bool),
    Int(i64),
    Float(f64),
    String(String),
    List(Vec<Value>),
    Map(IndexMap<String, Value>),
    /// Attribute of another resource, resolved to a token at synthesis.
    Ref(OutputRef),
}

impl Value {
    /// Build a string list value.
    pub fn strings<I, S>(items: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Value::List(items.into_iter().map(|s| Value::String(s.into())).collect())
    }

    /// Build a map value from key/value pairs, keeping their order.
    pub fn map<I, K>(entries: I) -> Self
    where
        I: IntoIterator<Item = (K, Value)>,
        K: Into<String>,
    {
        Value::Map(entries.into_iter().map(|(k, v)| (k.into(), v)).collect())
    }

    /// Every output reference held anywhere inside this value.
    pub fn refs(&self) -> Vec<&OutputRef> {
        let mut out = Vec::new();
        self.collect_refs(&mut out);
        out
    }

    fn collect_refs<'a>(&'a self, out: &mut Vec<&'a OutputRef>) {
        match self {
            Value::Ref(r) => out.push(r),
            Value::List(items) => items.iter().for_each(|v| v.collect_refs(out)),
            Value::Map(entries) => entries.values().for_each(|v| v.collect_refs(out)),
            _ => {}
        }
    }

    /// Convert a YAML value literally. Mapping keys must be strings.
    pub fn from_yaml(val: &serde_yaml_ng::Value) -> Result<Self, String> {
        Ok(match val {
            serde_yaml_ng::Value::Null => Value::Null,
            serde_yaml_ng::Value::Bool(b) => Value::Bool(*b),
            serde_yaml_ng::Value::Number(n) => match n.as_i64() {
                Some(i) => Value::Int(i),
                None => Value::Float(n.as_f64().unwrap_or(f64::NAN)),
            },
            serde_yaml_ng::Value::String(s) => Value::String(s.clone()),
            serde_yaml_ng::Value::Sequence(items) => Value::List(
                items
                    .iter()
                    .map(Value::from_yaml)
                    .collect::<Result<_, _>>()?,
            ),
            serde_yaml_ng::Value::Mapping(m) => {
                let mut entries = IndexMap::new();
                for (k, v) in m {
                    let key = k
                        .as_str()
                        .ok_or_else(|| format!("mapping key must be a string, got {:?}", k))?;
                    entries.insert(key.to_string(), Value::from_yaml(v)?);
                }
                Value::Map(entries)
            }
            serde_yaml_ng::Value::Tagged(t) => Value::from_yaml(&t.value)?,
        })
    }
}

impl Value {
    /// Convert a JSON value literally; used for opaque Kubernetes objects.
    pub fn from_json(val: &serde_json::Value) -> Self {
        match val {
            serde_json::Value::Null => Value::Null,
            serde_json::Value::Bool(b) => Value::Bool(*b),
            serde_json::Value::Number(n) => match n.as_i64() {
                Some(i) => Value::Int(i),
                None => Value::Float(n.as_f64().unwrap_or(f64::NAN)),
            },
            serde_json::Value::String(s) => Value::String(s.clone()),
            serde_json::Value::Array(items) => Value::List(items.iter().map(Value::from_json).collect()),
            serde_json::Value::Object(m) => Value::Map(
                m.iter()
                    .map(|(k, v)| (k.clone(), Value::from_json(v)))
                    .collect(),
            ),
        }
    }
}

impl From<&str> for Value {
    fn from(s: &str) -> Self {
        Value::String(s.to_string())
    }
}

impl From<String> for Value {
    fn from(s: String) -> Self {
        Value::String(s)
    }
}

impl From<bool> for Value {
    fn from(b: bool) -> Self {
        Value::Bool(b)
    }
}

impl From<i64> for Value {
    fn from(i: i64) -> Self {
        Value::Int(i)
    }
}

impl From<u32> for Value {
    fn from(i: u32) -> Self {
        Value::Int(i64::from(i))
    }
}

impl From<OutputRef> for Value {
    fn from(r: OutputRef) -> Self {
        Value::Ref(r)
    }
}

impl From<Vec<Value>> for Value {
    fn from(items: Vec<Value>) -> Self {
        Value::List(items)
    }
}

// ============================================================================
// Output references
// ============================================================================

/// Reference to an exported attribute of a resource in some stack.
///
/// Carries stable string identifiers only; it never owns or borrows the
/// producer.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct OutputRef {
    pub producer_stack_id: String,
    pub producer_logical_id: String,
    pub attribute_name: String,
}

impl OutputRef {
    pub fn new(
        stack: impl Into<String>,
        logical_id: impl Into<String>,
        attribute: impl Into<String>,
    ) -> Self {
        Self {
            producer_stack_id: stack.into(),
            producer_logical_id: logical_id.into(),
            attribute_name: attribute.into(),
        }
    }

    /// `stack.logicalId.attribute`, the placeholder the backend resolves.
    pub fn token(&self) -> String {
        format!(
            "{}.{}.{}",
            self.producer_stack_id, self.producer_logical_id, self.attribute_name
        )
    }
}

impl fmt::Display for OutputRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.token())
    }
}

// ============================================================================
// Resources
// ============================================================================

/// Resource kinds andamio knows how to declare.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ResourceKind {
    #[serde(rename = "AWS::EC2::VPC")]
    Vpc,
    #[serde(rename = "AWS::EC2::Subnet")]
    Subnet,
    #[serde(rename = "AWS::EC2::InternetGateway")]
    InternetGateway,
    #[serde(rename = "AWS::EC2::VPCGatewayAttachment")]
    VpcGatewayAttachment,
    #[serde(rename = "AWS::EC2::EIP")]
    ElasticIp,
    #[serde(rename = "AWS::EC2::NatGateway")]
    NatGateway,
    #[serde(rename = "AWS::EC2::SecurityGroup")]
    SecurityGroup,
    #[serde(rename = "AWS::EC2::SecurityGroupIngress")]
    SecurityGroupIngress,
    #[serde(rename = "AWS::EC2::VPCEndpoint")]
    VpcEndpoint,
    #[serde(rename = "AWS::IAM::Role")]
    IamRole,
    #[serde(rename = "AWS::IAM::Policy")]
    IamPolicy,
    #[serde(rename = "AWS::EKS::Cluster")]
    EksCluster,
    #[serde(rename = "AWS::EKS::Nodegroup")]
    EksNodegroup,
    #[serde(rename = "AWS::EKS::FargateProfile")]
    EksFargateProfile,
    #[serde(rename = "Custom::AWSCDK-EKS-Cluster")]
    ManagedCluster,
    #[serde(rename = "Custom::AWSCDK-EKS-KubernetesResource")]
    KubernetesManifest,
    #[serde(rename = "Custom::AWSCDK-EKS-HelmChart")]
    HelmChart,
}

impl ResourceKind {
    /// CloudFormation type name written into artifacts.
    pub fn type_name(self) -> &'static str {
        match self {
            Self::Vpc => "AWS::EC2::VPC",
            Self::Subnet => "AWS::EC2::Subnet",
            Self::InternetGateway => "AWS::EC2::InternetGateway",
            Self::VpcGatewayAttachment => "AWS::EC2::VPCGatewayAttachment",
            Self::ElasticIp => "AWS::EC2::EIP",
            Self::NatGateway => "AWS::EC2::NatGateway",
            Self::SecurityGroup => "AWS::EC2::SecurityGroup",
            Self::SecurityGroupIngress => "AWS::EC2::SecurityGroupIngress",
            Self::VpcEndpoint => "AWS::EC2::VPCEndpoint",
            Self::IamRole => "AWS::IAM::Role",
            Self::IamPolicy => "AWS::IAM::Policy",
            Self::EksCluster => "AWS::EKS::Cluster",
            Self::EksNodegroup => "AWS::EKS::Nodegroup",
            Self::EksFargateProfile => "AWS::EKS::FargateProfile",
            Self::ManagedCluster => "Custom::AWSCDK-EKS-Cluster",
            Self::KubernetesManifest => "Custom::AWSCDK-EKS-KubernetesResource",
            Self::HelmChart => "Custom::AWSCDK-EKS-HelmChart",
        }
    }
}

impl fmt::Display for ResourceKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.type_name())
    }
}

/// Smallest declarative unit: one cloud resource or Kubernetes object.
#[derive(Debug, Clone, PartialEq)]
pub struct ResourceNode {
    pub kind: ResourceKind,
    pub logical_id: String,
    pub properties: IndexMap<String, Value>,
    /// Logical ids in the same stack that must exist first.
    pub depends_on: Vec<String>,
}

impl ResourceNode {
    pub fn new(kind: ResourceKind, logical_id: impl Into<String>) -> Self {
        Self {
            kind,
            logical_id: logical_id.into(),
            properties: IndexMap::new(),
            depends_on: Vec::new(),
        }
    }

    /// Set a property, builder style.
    pub fn prop(mut self, key: impl Into<String>, value: impl Into<Value>) -> Self {
        self.properties.insert(key.into(), value.into());
        self
    }

    /// Add a same-stack DependsOn, builder style.
    pub fn after(mut self, logical_id: impl Into<String>) -> Self {
        self.depends_on.push(logical_id.into());
        self
    }
}

/// Target account and region for a stack.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Environment {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub account: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub region: Option<String>,
}

impl Environment {
    pub fn is_empty(&self) -> bool {
        self.account.is_none() && self.region.is_none()
    }
}

// ============================================================================
// Synthesized artifacts
// ============================================================================

/// One resource as written into a stack template.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SynthesizedResource {
    #[serde(rename = "type")]
    pub kind: ResourceKind,
    pub logical_id: String,
    pub properties: serde_json::Map<String, serde_json::Value>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub depends_on: Vec<String>,
}

/// Deployable template for one stack.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StackArtifact {
    pub stack_id: String,
    pub resources: Vec<SynthesizedResource>,
    /// Direct dependencies, ordered by apply order.
    pub depends_on: Vec<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub environment: Option<Environment>,
    #[serde(default, skip_serializing_if = "IndexMap::is_empty")]
    pub outputs: IndexMap<String, serde_json::Value>,
}

impl StackArtifact {
    /// Look up a resource by logical id.
    pub fn resource(&self, logical_id: &str) -> Option<&SynthesizedResource> {
        self.resources.iter().find(|r| r.logical_id == logical_id)
    }

    /// Pretty JSON, newline-terminated. Stable for an unchanged artifact.
    pub fn to_json(&self) -> Result<String, serde_json::Error> {
        let mut json = serde_json::to_string_pretty(self)?;
        json.push('\n');
        Ok(json)
    }
}

// ============================================================================
// Lock files
// ============================================================================

/// What was last applied for one stack.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StackLock {
    pub schema: String,
    pub stack: String,
    pub generated_at: String,
    pub generator: String,
    /// Hash of the applied template
    pub template_hash: String,
    /// Per-resource hashes keyed by logical id, in template order
    pub resources: IndexMap<String, ResourceLock>,
}

/// Applied state of one resource.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ResourceLock {
    #[serde(rename = "type")]
    pub resource_type: ResourceKind,
    pub hash: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub applied_at: Option<String>,
}

// ============================================================================
// App file (andamio.yaml)
// ============================================================================

/// Root configuration: stacks of constructs to synthesize.
#[derive(Debug, Clone, Deserialize)]
pub struct AppConfig {
    /// Schema version (must be "1.0")
    pub version: String,

    /// App name
    pub name: String,

    #[serde(default)]
    pub description: Option<String>,

    /// Template parameters for `{{params.key}}`
    #[serde(default)]
    pub params: IndexMap<String, serde_yaml_ng::Value>,

    /// Default environment for stacks that don't set one
    #[serde(default)]
    pub env: Environment,

    /// Stacks in declaration order
    #[serde(default)]
    pub stacks: IndexMap<String, StackConfig>,

    #[serde(default)]
    pub policy: Policy,
}

/// One stack in the app file.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct StackConfig {
    #[serde(default)]
    pub description: Option<String>,

    #[serde(default)]
    pub env: Option<Environment>,

    /// Explicit stack dependencies
    #[serde(default)]
    pub depends_on: Vec<String>,

    /// Constructs in declaration order
    #[serde(default)]
    pub constructs: IndexMap<String, ConstructSpec>,
}

/// A construct declaration, tagged by `type`.
#[derive(Debug, Clone, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ConstructSpec {
    Network(NetworkProps),
    EksCluster(ClusterSpec),
    FargateProfile(FargateProfileSpec),
    ClusterAutoscaler(AutoscalerSpec),
    WebAppChart(ChartSpec<WebAppChartProps>),
    HelmChart(ChartSpec<HelmChartProps>),
    Manifests(ManifestsSpec),
    Resource(RawResourceSpec),
}

impl ConstructSpec {
    /// The `type` tag as written in the app file.
    pub fn type_name(&self) -> &'static str {
        match self {
            Self::Network(_) => "network",
            Self::EksCluster(_) => "eks_cluster",
            Self::FargateProfile(_) => "fargate_profile",
            Self::ClusterAutoscaler(_) => "cluster_autoscaler",
            Self::WebAppChart(_) => "web_app_chart",
            Self::HelmChart(_) => "helm_chart",
            Self::Manifests(_) => "manifests",
            Self::Resource(_) => "resource",
        }
    }

    /// Construct path references (`Stack/Construct`) this spec consumes.
    pub fn references(&self) -> Vec<&str> {
        match self {
            Self::Network(_) | Self::Resource(_) => Vec::new(),
            Self::EksCluster(s) => s.network.as_deref().into_iter().collect(),
            Self::FargateProfile(s) => vec![s.cluster.as_str()],
            Self::ClusterAutoscaler(s) => vec![s.cluster.as_str()],
            Self::WebAppChart(s) => vec![s.cluster.as_str()],
            Self::HelmChart(s) => vec![s.cluster.as_str()],
            Self::Manifests(s) => vec![s.cluster.as_str()],
        }
    }
}

/// Cluster declaration: props plus where its network comes from.
#[derive(Debug, Clone, Deserialize)]
pub struct ClusterSpec {
    /// `Stack/Construct` of a network construct
    #[serde(default)]
    pub network: Option<String>,

    /// Pre-existing VPC when no network construct is referenced
    #[serde(default)]
    pub existing_vpc: Option<ExistingVpc>,

    #[serde(flatten)]
    pub props: ClusterProps,
}

/// Identifiers of a VPC that andamio does not manage.
#[derive(Debug, Clone, Deserialize)]
pub struct ExistingVpc {
    pub vpc_id: String,
    pub subnet_ids: Vec<String>,
    #[serde(default)]
    pub security_group_ids: Vec<String>,
}

/// Standalone Fargate profile against a cluster.
#[derive(Debug, Clone, Deserialize)]
pub struct FargateProfileSpec {
    pub cluster: String,
    #[serde(flatten)]
    pub props: FargateProfileProps,
}

#[derive(Debug, Clone, Deserialize)]
pub struct AutoscalerSpec {
    pub cluster: String,
    #[serde(flatten)]
    pub props: ClusterAutoscalerProps,
}

/// Chart bound to a cluster.
#[derive(Debug, Clone, Deserialize)]
pub struct ChartSpec<P> {
    pub cluster: String,
    #[serde(flatten)]
    pub props: P,
}

/// Every YAML document under `dir` applied to a cluster.
#[derive(Debug, Clone, Deserialize)]
pub struct ManifestsSpec {
    pub cluster: String,
    pub dir: String,
}

/// A raw resource. Property mappings of the form `{ref: "Stack/Construct.output"}`
/// become output references.
#[derive(Debug, Clone, Deserialize)]
pub struct RawResourceSpec {
    pub kind: ResourceKind,
    #[serde(default)]
    pub properties: IndexMap<String, serde_yaml_ng::Value>,
    #[serde(default)]
    pub depends_on: Vec<String>,
    /// Attributes other constructs may reference
    #[serde(default)]
    pub outputs: Vec<String>,
}

// ============================================================================
// Policy
// ============================================================================

/// Deploy policy.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Policy {
    #[serde(default)]
    pub failure: FailurePolicy,

    /// Append deploy events to the per-stack JSONL log
    #[serde(default = "default_true")]
    pub event_log: bool,

    /// Persist resource hashes after apply
    #[serde(default = "default_true")]
    pub lock_file: bool,
}

impl Default for Policy {
    fn default() -> Self {
        Self {
            failure: FailurePolicy::default(),
            event_log: true,
            lock_file: true,
        }
    }
}

fn default_true() -> bool {
    true
}

/// Failure handling strategy.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FailurePolicy {
    #[default]
    StopOnFirst,
    /// Keep going with stacks that don't depend on a failed one
    ContinueIndependent,
}

// ============================================================================
// Deploy events
// ============================================================================

/// Deploy event for the JSONL event log.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "event", rename_all = "snake_case")]
pub enum DeployEvent {
    DeployStarted {
        app: String,
        run_id: String,
        andamio_version: String,
        stacks: Vec<String>,
    },
    StackApplied {
        stack: String,
        run_id: String,
        created: u32,
        updated: u32,
        deleted: u32,
        unchanged: u32,
        duration_seconds: f64,
    },
    StackFailed {
        stack: String,
        run_id: String,
        error: String,
    },
    StackSkipped {
        stack: String,
        run_id: String,
        reason: String,
    },
    DeployCompleted {
        app: String,
        run_id: String,
        applied: u32,
        failed: u32,
        skipped: u32,
        duration_seconds: f64,
    },
}

/// Timestamped event wrapper.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TimestampedEvent {
    pub ts: String,
    #[serde(flatten)]
    pub event: DeployEvent,
}

// ============================================================================
// Template helper
// ============================================================================

/// Convert a serde_yaml_ng::Value to a string for template resolution.
pub fn yaml_value_to_string(val: &serde_yaml_ng::Value) -> String {
    match val {
        serde_yaml_ng::Value::String(s) => s.clone(),
        serde_yaml_ng::Value::Number(n) => n.to_string(),
        serde_yaml_ng::Value::Bool(b) => b.to_string(),
        serde_yaml_ng::Value::Null => String::new(),
        other => format!("{:?}", other),
    }
}

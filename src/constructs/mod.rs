//! Construct library: reusable groupings of resources.
//!
//! Each construct is a function that adds a construct node under a scope,
//! fills it with resources and registers its outputs. Logical ids are the
//! construct id followed by a role name (`NetworkVpc`, `EksClusterNodeRole`),
//! so one construct id per stack keeps them unique.

pub mod autoscaler;
pub mod chart;
pub mod cluster;
pub mod fargate;
pub mod manifests;
pub mod network;

use crate::core::types::Value;

/// Managed policy ARN for an AWS-managed IAM policy name.
pub fn managed_policy_arn(name: &str) -> String {
    format!("arn:aws:iam::aws:policy/{}", name)
}

/// Trust policy letting an AWS service assume a role.
pub fn trust_policy(service: &str) -> Value {
    Value::map([
        ("Version", Value::from("2012-10-17")),
        (
            "Statement",
            Value::List(vec![Value::map([
                ("Effect", Value::from("Allow")),
                ("Principal", Value::map([("Service", Value::from(service))])),
                ("Action", Value::from("sts:AssumeRole")),
            ])]),
        ),
    ])
}

/// Allow-statement policy document over `*`.
pub fn allow_policy(actions: &[&str]) -> Value {
    Value::map([
        ("Version", Value::from("2012-10-17")),
        (
            "Statement",
            Value::List(vec![Value::map([
                ("Effect", Value::from("Allow")),
                ("Action", Value::strings(actions.iter().copied())),
                ("Resource", Value::from("*")),
            ])]),
        ),
    ])
}

/// CloudFormation tag list: `[{Key, Value}, ...]`.
pub fn tag_list<I, K, V>(tags: I) -> Value
where
    I: IntoIterator<Item = (K, V)>,
    K: Into<String>,
    V: Into<String>,
{
    Value::List(
        tags.into_iter()
            .map(|(k, v)| {
                Value::map([
                    ("Key", Value::String(k.into())),
                    ("Value", Value::String(v.into())),
                ])
            })
            .collect(),
    )
}

/// String-to-string map value (labels, nodegroup tags).
pub fn string_map<I, K, V>(entries: I) -> Value
where
    I: IntoIterator<Item = (K, V)>,
    K: Into<String>,
    V: Into<String>,
{
    Value::Map(
        entries
            .into_iter()
            .map(|(k, v)| (k.into(), Value::String(v.into())))
            .collect(),
    )
}

/// `{"Fn::Join": ["", parts]}`, for strings that embed a reference.
pub fn join(parts: Vec<Value>) -> Value {
    Value::map([("Fn::Join", Value::List(vec![Value::from(""), Value::List(parts)]))])
}

/// Turn an arbitrary name into a logical-id fragment: ASCII alphanumerics,
/// with the letter after each separator upper-cased.
pub fn sanitize_id(raw: &str) -> String {
    let mut out = String::with_capacity(raw.len());
    let mut upper = true;
    for c in raw.chars() {
        if c.is_ascii_alphanumeric() {
            if upper {
                out.push(c.to_ascii_uppercase());
            } else {
                out.push(c);
            }
            upper = false;
        } else {
            upper = true;
        }
    }
    out
}

//! AN-012: App file parsing and validation.
//!
//! Parses andamio.yaml, resolves `{{params.key}}` templates, and validates
//! structural constraints:
//! - Version must be "1.0"
//! - Stack `depends_on` entries must name other declared stacks
//! - Construct references (`Stack/Construct`) must name a construct of the
//!   right type declared earlier in the file
//! - A cluster needs exactly one of `network` or `existing_vpc`

use super::resolver::resolve_yaml_templates;
use super::types::{AppConfig, ConstructSpec};
use crate::error::{Error, Result};
use indexmap::IndexMap;
use std::collections::HashMap;
use std::path::Path;

/// Validation error.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ValidationError {
    pub message: String,
}

impl std::fmt::Display for ValidationError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.message)
    }
}

/// Parse an andamio.yaml file from disk.
pub fn parse_config_file(path: &Path) -> Result<AppConfig> {
    let content = std::fs::read_to_string(path).map_err(|e| Error::io("failed to read", path, e))?;
    parse_config(&content)
}

/// Parse an andamio.yaml from a string, resolving templates.
pub fn parse_config(yaml: &str) -> Result<AppConfig> {
    let mut raw: serde_yaml_ng::Value = serde_yaml_ng::from_str(yaml)?;
    let params: IndexMap<String, serde_yaml_ng::Value> = match raw.get("params") {
        Some(p) => serde_yaml_ng::from_value(p.clone())?,
        None => IndexMap::new(),
    };
    if let serde_yaml_ng::Value::Mapping(root) = &mut raw {
        for (key, value) in root.iter_mut() {
            if key.as_str() != Some("params") {
                resolve_yaml_templates(value, &params)?;
            }
        }
    }
    Ok(serde_yaml_ng::from_value(raw)?)
}

/// Parse and validate in one step; validation errors are joined.
pub fn load_config(path: &Path) -> Result<AppConfig> {
    let config = parse_config_file(path)?;
    let errors = validate_config(&config);
    if errors.is_empty() {
        Ok(config)
    } else {
        let joined: Vec<String> = errors.iter().map(ToString::to_string).collect();
        Err(Error::config(joined.join("; ")))
    }
}

/// Split `Stack/Construct.output` into the construct path and output name.
pub fn split_output_ref(reference: &str) -> Option<(&str, &str)> {
    let (path, output) = reference.rsplit_once('.')?;
    if path.contains('/') && !output.is_empty() {
        Some((path, output))
    } else {
        None
    }
}

/// Validate a parsed config. Returns a list of errors (empty = valid).
pub fn validate_config(config: &AppConfig) -> Vec<ValidationError> {
    let mut errors = Vec::new();
    let mut push = |message: String| errors.push(ValidationError { message });

    if config.version != "1.0" {
        push(format!("version must be \"1.0\", got \"{}\"", config.version));
    }
    if config.name.is_empty() {
        push("name must not be empty".to_string());
    }
    if config.stacks.is_empty() {
        push("no stacks declared".to_string());
    }

    for (id, stack) in &config.stacks {
        if id.is_empty() || id.contains('/') || id.contains('.') {
            push(format!("stack id '{}' must be non-empty and free of '/' and '.'", id));
        }
        for dep in &stack.depends_on {
            if dep == id {
                push(format!("stack '{}' depends on itself", id));
            } else if !config.stacks.contains_key(dep) {
                push(format!("stack '{}' depends on unknown stack '{}'", id, dep));
            }
        }
    }

    // path -> construct type, filled in file order
    let mut declared: HashMap<String, &'static str> = HashMap::new();
    for (stack_id, stack) in &config.stacks {
        for (construct_id, spec) in &stack.constructs {
            let path = format!("{}/{}", stack_id, construct_id);
            if construct_id.is_empty() || construct_id.contains('/') || construct_id.contains('.') {
                push(format!("construct id '{}' must be non-empty and free of '/' and '.'", path));
            }

            let expected = match spec {
                ConstructSpec::EksCluster(_) => "network",
                _ => "eks_cluster",
            };
            for reference in spec.references() {
                match declared.get(reference) {
                    None => push(format!(
                        "construct '{}' references '{}', which is not declared before it",
                        path, reference
                    )),
                    Some(kind) if *kind != expected => push(format!(
                        "construct '{}' references '{}' ({}), expected a {}",
                        path, reference, kind, expected
                    )),
                    Some(_) => {}
                }
            }

            match spec {
                ConstructSpec::EksCluster(cluster) => {
                    match (&cluster.network, &cluster.existing_vpc) {
                        (Some(_), Some(_)) => push(format!(
                            "cluster '{}' sets both network and existing_vpc",
                            path
                        )),
                        (None, None) => push(format!(
                            "cluster '{}' needs network or existing_vpc",
                            path
                        )),
                        _ => {}
                    }
                    if cluster.props.cluster_name.is_empty() {
                        push(format!("cluster '{}' has an empty cluster_name", path));
                    }
                }
                ConstructSpec::Resource(raw) => {
                    let mut refs = Vec::new();
                    for value in raw.properties.values() {
                        collect_refs(value, &mut refs);
                    }
                    for reference in refs {
                        match split_output_ref(&reference) {
                            Some((target, _)) if declared.contains_key(target) => {}
                            Some((target, _)) => push(format!(
                                "resource '{}' references '{}', which is not declared before it",
                                path, target
                            )),
                            None => push(format!(
                                "resource '{}' has malformed ref '{}', expected Stack/Construct.output",
                                path, reference
                            )),
                        }
                    }
                    for dep in raw.depends_on.iter().filter(|d| d.contains('/')) {
                        if !declared.contains_key(dep.as_str()) {
                            push(format!(
                                "resource '{}' depends on '{}', which is not declared before it",
                                path, dep
                            ));
                        }
                    }
                }
                _ => {}
            }

            declared.insert(path, spec.type_name());
        }
    }

    errors
}

/// `{ref: "..."}` mappings anywhere inside a YAML value.
pub fn collect_refs(value: &serde_yaml_ng::Value, out: &mut Vec<String>) {
    match value {
        serde_yaml_ng::Value::Mapping(m) => {
            if let Some(r) = ref_target(value) {
                out.push(r.to_string());
                return;
            }
            for v in m.values() {
                collect_refs(v, out);
            }
        }
        serde_yaml_ng::Value::Sequence(items) => items.iter().for_each(|v| collect_refs(v, out)),
        serde_yaml_ng::Value::Tagged(t) => collect_refs(&t.value, out),
        _ => {}
    }
}

/// The target of a single-key `{ref: "..."}` mapping.
pub fn ref_target(value: &serde_yaml_ng::Value) -> Option<&str> {
    let m = value.as_mapping()?;
    if m.len() != 1 {
        return None;
    }
    m.get("ref")?.as_str()
}

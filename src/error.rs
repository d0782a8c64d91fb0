//! Error types for andamio.
//!
//! Structural errors (duplicate ids, unknown outputs, dependency cycles,
//! unresolved references) are raised while declaring or synthesizing, never
//! while a backend is applying.

use std::path::PathBuf;
use thiserror::Error;

/// Convenience alias used throughout the crate.
pub type Result<T> = std::result::Result<T, Error>;

/// Main error type for declaration, synthesis and deployment.
#[derive(Debug, Error)]
#[non_exhaustive]
pub enum Error {
    /// A sibling (or a resource elsewhere in the same stack) already uses this id
    #[error("duplicate id '{id}' under '{scope}'")]
    DuplicateId { scope: String, id: String },

    /// The construct never registered an output with this name
    #[error("construct '{construct}' has no output named '{name}'")]
    UnknownOutput { construct: String, name: String },

    /// A stack (or construct) was asked to depend on itself
    #[error("'{id}' cannot depend on itself")]
    SelfDependency { id: String },

    /// No topological order exists; `cycle` lists members in depends-on order
    #[error("dependency cycle: {}", format_cycle(.cycle))]
    CyclicDependency { cycle: Vec<String> },

    /// A reference points at a stack, resource or attribute nobody exported
    #[error("unresolved reference {reference} used by {consumer}")]
    UnresolvedOutput { consumer: String, reference: String },

    /// The node already has a parent
    #[error("'{id}' is already attached to '{parent}'")]
    AlreadyAttached { id: String, parent: String },

    /// Attaching would make a node its own ancestor
    #[error("attaching '{child}' under '{parent}' would create a cycle in the construct tree")]
    TreeCycle { parent: String, child: String },

    /// The construct is not inside any stack yet
    #[error("'{path}' is not attached to a stack")]
    Detached { path: String },

    /// The node is not a stack
    #[error("'{id}' is not a stack")]
    NotAStack { id: String },

    /// A resource-level DependsOn names a logical id missing from the stack
    #[error("resource '{referenced_by}' in stack '{stack}' depends on unknown resource '{logical_id}'")]
    UnknownResource {
        stack: String,
        logical_id: String,
        referenced_by: String,
    },

    /// A property value cannot be rendered into an artifact
    #[error("invalid value at {path}: {reason}")]
    InvalidValue { path: String, reason: String },

    /// App file or construct configuration problem
    #[error("config error: {0}")]
    Config(String),

    /// Filesystem error with the path that caused it
    #[error("{context} {}: {source}", .path.display())]
    Io {
        context: &'static str,
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    /// YAML/JSON (de)serialization failure
    #[error("parse error: {0}")]
    Parse(String),

    /// The provisioning backend rejected or failed an operation
    #[error("backend error: {0}")]
    Backend(String),
}

impl Error {
    /// Create a config error with the given message
    pub fn config(msg: impl Into<String>) -> Self {
        Self::Config(msg.into())
    }

    /// Create a backend error with the given message
    pub fn backend(msg: impl Into<String>) -> Self {
        Self::Backend(msg.into())
    }

    /// Wrap an io error with the path it happened on
    pub fn io(context: &'static str, path: impl Into<PathBuf>, source: std::io::Error) -> Self {
        Self::Io {
            context,
            path: path.into(),
            source,
        }
    }
}

impl From<serde_yaml_ng::Error> for Error {
    fn from(e: serde_yaml_ng::Error) -> Self {
        Self::Parse(format!("YAML: {e}"))
    }
}

impl From<serde_json::Error> for Error {
    fn from(e: serde_json::Error) -> Self {
        Self::Parse(format!("JSON: {e}"))
    }
}

fn format_cycle(cycle: &[String]) -> String {
    match cycle.first() {
        Some(first) => format!("{} -> {}", cycle.join(" -> "), first),
        None => String::from("<empty>"),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_cycle_message_closes_loop() {
        let err = Error::CyclicDependency {
            cycle: vec!["A".into(), "B".into(), "C".into()],
        };
        assert_eq!(err.to_string(), "dependency cycle: A -> B -> C -> A");
    }

    #[test]
    fn test_unresolved_names_consumer_chain() {
        let err = Error::UnresolvedOutput {
            consumer: "EksStack/Cluster/EksCluster.properties.vpcId".into(),
            reference: "NetworkStack.Vpc.vpcId".into(),
        };
        let msg = err.to_string();
        assert!(msg.contains("EksStack/Cluster/EksCluster"));
        assert!(msg.contains("NetworkStack.Vpc.vpcId"));
    }

    #[test]
    fn test_io_error_includes_path() {
        let err = Error::io(
            "cannot read",
            "/nope/andamio.yaml",
            std::io::Error::new(std::io::ErrorKind::NotFound, "missing"),
        );
        assert!(err.to_string().contains("/nope/andamio.yaml"));
    }

    #[test]
    fn test_yaml_error_converts() {
        let yaml_err = serde_yaml_ng::from_str::<u32>("[not, a, number]").unwrap_err();
        let err: Error = yaml_err.into();
        assert!(matches!(err, Error::Parse(_)));
    }
}

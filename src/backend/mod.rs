//! AN-017: Provisioning backend abstraction.
//!
//! A backend consumes one stack artifact at a time. The deploy loop calls it
//! in apply order; the backend never sees the construct tree.

pub mod local;

use crate::core::types::StackArtifact;
use crate::error::Result;
use serde::Serialize;

pub use crate::core::planner::{ChangeAction, ChangeSet, ResourceChange};

/// Outcome of applying one stack artifact.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct ApplyReport {
    pub stack: String,
    pub created: u32,
    pub updated: u32,
    pub deleted: u32,
    pub unchanged: u32,
    pub failed: u32,
}

impl ApplyReport {
    pub fn success(&self) -> bool {
        self.failed == 0
    }

    /// Count an action that went through.
    pub fn record(&mut self, action: ChangeAction) {
        match action {
            ChangeAction::Create => self.created += 1,
            ChangeAction::Update => self.updated += 1,
            ChangeAction::Delete => self.deleted += 1,
            ChangeAction::NoOp => self.unchanged += 1,
        }
    }
}

/// Something that can plan and apply stack artifacts.
pub trait ProvisioningBackend {
    /// Short name for logs.
    fn name(&self) -> &str;

    /// What `apply` would change, without changing anything.
    fn plan(&self, artifact: &StackArtifact) -> Result<ChangeSet>;

    /// Apply the artifact. `Err` means nothing could be attempted; resource
    /// failures during apply are counted in the report.
    fn apply(&self, artifact: &StackArtifact) -> Result<ApplyReport>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_an017_report_record() {
        let mut report = ApplyReport {
            stack: "Net".into(),
            ..ApplyReport::default()
        };
        for action in [
            ChangeAction::Create,
            ChangeAction::Create,
            ChangeAction::Update,
            ChangeAction::Delete,
            ChangeAction::NoOp,
        ] {
            report.record(action);
        }
        assert_eq!((report.created, report.updated, report.deleted, report.unchanged), (2, 1, 1, 1));
        assert!(report.success());
        report.failed = 1;
        assert!(!report.success());
    }
}

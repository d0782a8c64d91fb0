//! Local recording backend: no cloud calls, only a per-stack lock file of
//! resource hashes under the state directory.

use super::{ApplyReport, ChangeAction, ChangeSet, ProvisioningBackend};
use crate::core::planner::plan_stack;
use crate::core::state;
use crate::core::types::{ResourceLock, StackArtifact};
use crate::error::Result;
use crate::ledger::eventlog::now_iso8601;
use crate::ledger::hasher::hash_string;
use std::path::{Path, PathBuf};
use tracing::debug;

/// Records applied artifacts as `state/<stack>/state.lock.yaml`.
#[derive(Debug, Clone)]
pub struct StateBackend {
    state_dir: PathBuf,
    write_lock: bool,
}

impl StateBackend {
    pub fn new(state_dir: impl Into<PathBuf>) -> Self {
        Self {
            state_dir: state_dir.into(),
            write_lock: true,
        }
    }

    /// Skip persisting the lock after apply (`policy.lock_file: false`).
    pub fn without_lock(mut self) -> Self {
        self.write_lock = false;
        self
    }

    pub fn state_dir(&self) -> &Path {
        &self.state_dir
    }
}

impl ProvisioningBackend for StateBackend {
    fn name(&self) -> &str {
        "state"
    }

    fn plan(&self, artifact: &StackArtifact) -> Result<ChangeSet> {
        let lock = state::load_lock(&self.state_dir, &artifact.stack_id)?;
        plan_stack(artifact, lock.as_ref())
    }

    fn apply(&self, artifact: &StackArtifact) -> Result<ApplyReport> {
        let previous = state::load_lock(&self.state_dir, &artifact.stack_id)?;
        let changes = plan_stack(artifact, previous.as_ref())?;
        let mut report = ApplyReport {
            stack: artifact.stack_id.clone(),
            ..ApplyReport::default()
        };

        let template_hash = hash_string(&artifact.to_json()?);
        let mut lock = state::new_lock(&artifact.stack_id, &template_hash);
        let now = now_iso8601();
        for change in &changes.changes {
            report.record(change.action);
            let applied_at = match change.action {
                ChangeAction::Delete => continue,
                ChangeAction::NoOp => previous
                    .as_ref()
                    .and_then(|l| l.resources.get(&change.logical_id))
                    .and_then(|rl| rl.applied_at.clone()),
                ChangeAction::Create | ChangeAction::Update => Some(now.clone()),
            };
            lock.resources.insert(
                change.logical_id.clone(),
                ResourceLock {
                    resource_type: change.resource_type,
                    hash: change.hash.clone(),
                    applied_at,
                },
            );
        }

        if self.write_lock {
            state::save_lock(&self.state_dir, &lock)?;
        }
        debug!(
            stack = %artifact.stack_id,
            created = report.created,
            updated = report.updated,
            deleted = report.deleted,
            "recorded stack"
        );
        Ok(report)
    }
}

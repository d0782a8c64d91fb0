//! AN-018: Deploy loop: hand each stack artifact to a backend in apply order.
//!
//! synthesize → apply order → for each stack: backend.apply → events
//!
//! Failure policy:
//! - `stop_on_first`: every stack after the first failure is skipped
//! - `continue_independent`: only stacks that (transitively) depend on a
//!   failed or skipped stack are skipped

use super::planner::ChangeSet;
use super::synth::CloudAssembly;
use super::types::{DeployEvent, FailurePolicy, Policy, StackArtifact};
use crate::backend::{ApplyReport, ProvisioningBackend};
use crate::error::{Error, Result};
use crate::ledger::eventlog;
use std::collections::HashSet;
use std::path::Path;
use std::time::{Duration, Instant};
use tracing::{info, warn};

/// Configuration for a deploy run.
pub struct DeployConfig<'a> {
    pub assembly: &'a CloudAssembly,
    pub policy: &'a Policy,
    pub state_dir: &'a Path,
    /// Plan every stack instead of applying
    pub dry_run: bool,
    /// Deploy only this stack
    pub stack_filter: Option<&'a str>,
}

/// What happened to one stack.
#[derive(Debug, Clone, PartialEq)]
pub enum StackOutcome {
    Applied(ApplyReport),
    Planned(ChangeSet),
    Failed(String),
    Skipped(String),
}

#[derive(Debug, Clone, PartialEq)]
pub struct StackResult {
    pub stack: String,
    pub outcome: StackOutcome,
    pub duration: Duration,
}

/// Result of a deploy run, one entry per visited stack in apply order.
#[derive(Debug, Clone, PartialEq)]
pub struct DeployReport {
    pub run_id: String,
    pub stacks: Vec<StackResult>,
    pub duration: Duration,
}

impl DeployReport {
    fn count(&self, pred: impl Fn(&StackOutcome) -> bool) -> u32 {
        self.stacks.iter().filter(|s| pred(&s.outcome)).count() as u32
    }

    pub fn applied(&self) -> u32 {
        self.count(|o| matches!(o, StackOutcome::Applied(_)))
    }

    pub fn failed(&self) -> u32 {
        self.count(|o| matches!(o, StackOutcome::Failed(_)))
    }

    pub fn skipped(&self) -> u32 {
        self.count(|o| matches!(o, StackOutcome::Skipped(_)))
    }

    pub fn success(&self) -> bool {
        self.failed() == 0 && self.skipped() == 0
    }

    pub fn get(&self, stack: &str) -> Option<&StackOutcome> {
        self.stacks.iter().find(|s| s.stack == stack).map(|s| &s.outcome)
    }
}

/// Run the deploy loop against `backend`.
pub fn deploy(cfg: &DeployConfig, backend: &dyn ProvisioningBackend) -> Result<DeployReport> {
    let start = Instant::now();
    let run_id = eventlog::generate_run_id();

    let selected: Vec<&StackArtifact> = match cfg.stack_filter {
        Some(filter) => {
            let artifact = cfg.assembly.artifact(filter).ok_or_else(|| {
                Error::config(format!("stack '{}' is not part of app '{}'", filter, cfg.assembly.app))
            })?;
            vec![artifact]
        }
        None => cfg.assembly.artifacts.iter().collect(),
    };
    let record = cfg.policy.event_log && !cfg.dry_run;

    if record {
        log_event(
            cfg.state_dir,
            DeployEvent::DeployStarted {
                app: cfg.assembly.app.clone(),
                run_id: run_id.clone(),
                andamio_version: env!("CARGO_PKG_VERSION").to_string(),
                stacks: selected.iter().map(|a| a.stack_id.clone()).collect(),
            },
        );
    }
    info!(app = %cfg.assembly.app, backend = backend.name(), run_id = %run_id, dry_run = cfg.dry_run, "deploy started");

    let mut results = Vec::with_capacity(selected.len());
    // failed or skipped stacks
    let mut blocked: HashSet<&str> = HashSet::new();
    let mut first_failure: Option<String> = None;

    for artifact in selected {
        let stack = artifact.stack_id.as_str();
        let stack_start = Instant::now();

        let skip_reason = match (&first_failure, cfg.policy.failure) {
            (Some(failed), FailurePolicy::StopOnFirst) => Some(format!("stopped after '{}' failed", failed)),
            _ => artifact
                .depends_on
                .iter()
                .find(|d| blocked.contains(d.as_str()))
                .map(|d| format!("depends on '{}', which did not deploy", d)),
        };

        let outcome = if let Some(reason) = skip_reason {
            warn!(stack, %reason, "skipping stack");
            blocked.insert(stack);
            StackOutcome::Skipped(reason)
        } else if cfg.dry_run {
            match backend.plan(artifact) {
                Ok(changes) => StackOutcome::Planned(changes),
                Err(e) => StackOutcome::Failed(e.to_string()),
            }
        } else {
            match backend.apply(artifact) {
                Ok(report) if report.success() => {
                    info!(
                        stack,
                        created = report.created,
                        updated = report.updated,
                        deleted = report.deleted,
                        unchanged = report.unchanged,
                        "stack applied"
                    );
                    StackOutcome::Applied(report)
                }
                Ok(report) => StackOutcome::Failed(format!("{} resource(s) failed", report.failed)),
                Err(e) => StackOutcome::Failed(e.to_string()),
            }
        };

        if let StackOutcome::Failed(error) = &outcome {
            warn!(stack, %error, "stack failed");
            blocked.insert(stack);
            first_failure.get_or_insert_with(|| stack.to_string());
        }

        let duration = stack_start.elapsed();
        if record {
            log_event(cfg.state_dir, stack_event(stack, &run_id, &outcome, duration));
        }
        results.push(StackResult {
            stack: stack.to_string(),
            outcome,
            duration,
        });
    }

    let report = DeployReport {
        run_id,
        stacks: results,
        duration: start.elapsed(),
    };
    if record {
        log_event(
            cfg.state_dir,
            DeployEvent::DeployCompleted {
                app: cfg.assembly.app.clone(),
                run_id: report.run_id.clone(),
                applied: report.applied(),
                failed: report.failed(),
                skipped: report.skipped(),
                duration_seconds: report.duration.as_secs_f64(),
            },
        );
    }
    info!(
        applied = report.applied(),
        failed = report.failed(),
        skipped = report.skipped(),
        "deploy finished"
    );
    Ok(report)
}

fn stack_event(stack: &str, run_id: &str, outcome: &StackOutcome, duration: Duration) -> DeployEvent {
    let stack = stack.to_string();
    let run_id = run_id.to_string();
    match outcome {
        StackOutcome::Applied(r) => DeployEvent::StackApplied {
            stack,
            run_id,
            created: r.created,
            updated: r.updated,
            deleted: r.deleted,
            unchanged: r.unchanged,
            duration_seconds: duration.as_secs_f64(),
        },
        StackOutcome::Failed(error) => DeployEvent::StackFailed {
            stack,
            run_id,
            error: error.clone(),
        },
        StackOutcome::Skipped(reason) => DeployEvent::StackSkipped {
            stack,
            run_id,
            reason: reason.clone(),
        },
        // dry runs record nothing; unreachable in practice
        StackOutcome::Planned(_) => DeployEvent::StackSkipped {
            stack,
            run_id,
            reason: "dry run".to_string(),
        },
    }
}

fn log_event(state_dir: &Path, event: DeployEvent) {
    if let Err(e) = eventlog::append_event(state_dir, event) {
        warn!(error = %e, "cannot append deploy event");
    }
}

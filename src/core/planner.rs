//! AN-016: Change planning: diff a stack artifact against its lock.

use super::types::{ResourceKind, StackArtifact, StackLock};
use crate::error::Result;
use crate::ledger::hasher::hash_resource;
use serde::Serialize;
use std::fmt;

/// What applying an artifact would do to one resource.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ChangeAction {
    Create,
    Update,
    Delete,
    NoOp,
}

impl fmt::Display for ChangeAction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Create => write!(f, "create"),
            Self::Update => write!(f, "update"),
            Self::Delete => write!(f, "delete"),
            Self::NoOp => write!(f, "no-op"),
        }
    }
}

/// One planned change.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ResourceChange {
    pub logical_id: String,
    #[serde(rename = "type")]
    pub resource_type: ResourceKind,
    pub action: ChangeAction,
    /// Hash the resource will have once applied; empty for deletes
    pub hash: String,
}

impl ResourceChange {
    pub fn describe(&self) -> String {
        match self.action {
            ChangeAction::Create => format!("{}: create {}", self.logical_id, self.resource_type),
            ChangeAction::Update => format!("{}: update (properties changed)", self.logical_id),
            ChangeAction::Delete => format!("{}: delete", self.logical_id),
            ChangeAction::NoOp => format!("{}: no changes", self.logical_id),
        }
    }
}

/// Planned changes for one stack. Deletes come after every other change.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ChangeSet {
    pub stack: String,
    pub changes: Vec<ResourceChange>,
    pub to_create: u32,
    pub to_update: u32,
    pub to_delete: u32,
    pub unchanged: u32,
}

impl ChangeSet {
    pub fn has_changes(&self) -> bool {
        self.to_create + self.to_update + self.to_delete > 0
    }
}

/// Diff `artifact` against the lock of its last apply, if any.
pub fn plan_stack(artifact: &StackArtifact, lock: Option<&StackLock>) -> Result<ChangeSet> {
    let mut changes = Vec::with_capacity(artifact.resources.len());
    let (mut to_create, mut to_update, mut to_delete, mut unchanged) = (0u32, 0u32, 0u32, 0u32);

    for resource in &artifact.resources {
        let hash = hash_resource(resource)?;
        let locked = lock.and_then(|l| l.resources.get(&resource.logical_id));
        let action = match locked {
            None => ChangeAction::Create,
            Some(rl) if rl.hash == hash && rl.resource_type == resource.kind => ChangeAction::NoOp,
            Some(_) => ChangeAction::Update,
        };
        match action {
            ChangeAction::Create => to_create += 1,
            ChangeAction::Update => to_update += 1,
            ChangeAction::NoOp => unchanged += 1,
            ChangeAction::Delete => {}
        }
        changes.push(ResourceChange {
            logical_id: resource.logical_id.clone(),
            resource_type: resource.kind,
            action,
            hash,
        });
    }

    if let Some(lock) = lock {
        for (logical_id, rl) in &lock.resources {
            if artifact.resource(logical_id).is_none() {
                to_delete += 1;
                changes.push(ResourceChange {
                    logical_id: logical_id.clone(),
                    resource_type: rl.resource_type,
                    action: ChangeAction::Delete,
                    hash: String::new(),
                });
            }
        }
    }

    Ok(ChangeSet {
        stack: artifact.stack_id.clone(),
        changes,
        to_create,
        to_update,
        to_delete,
        unchanged,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::state::new_lock;
    use crate::core::types::{ResourceLock, SynthesizedResource};
    use indexmap::IndexMap;
    use serde_json::json;

    fn resource(id: &str, cidr: &str) -> SynthesizedResource {
        let mut properties = serde_json::Map::new();
        properties.insert("CidrBlock".into(), json!(cidr));
        SynthesizedResource {
            kind: ResourceKind::Vpc,
            logical_id: id.to_string(),
            properties,
            depends_on: vec![],
        }
    }

    fn artifact(resources: Vec<SynthesizedResource>) -> StackArtifact {
        StackArtifact {
            stack_id: "Net".into(),
            resources,
            depends_on: vec![],
            description: None,
            environment: None,
            outputs: IndexMap::new(),
        }
    }

    fn lock_of(artifact: &StackArtifact) -> StackLock {
        let mut lock = new_lock("Net", "blake3:t");
        for r in &artifact.resources {
            lock.resources.insert(
                r.logical_id.clone(),
                ResourceLock {
                    resource_type: r.kind,
                    hash: hash_resource(r).unwrap(),
                    applied_at: None,
                },
            );
        }
        lock
    }

    #[test]
    fn test_an016_first_plan_creates_everything() {
        let a = artifact(vec![resource("Vpc", "10.0.0.0/16"), resource("Other", "10.1.0.0/16")]);
        let plan = plan_stack(&a, None).unwrap();
        assert_eq!(plan.to_create, 2);
        assert!(plan.has_changes());
        assert!(plan.changes.iter().all(|c| c.action == ChangeAction::Create));
    }

    #[test]
    fn test_an016_unchanged_is_noop() {
        let a = artifact(vec![resource("Vpc", "10.0.0.0/16")]);
        let plan = plan_stack(&a, Some(&lock_of(&a))).unwrap();
        assert_eq!(plan.unchanged, 1);
        assert!(!plan.has_changes());
        assert_eq!(plan.changes[0].describe(), "Vpc: no changes");
    }

    #[test]
    fn test_an016_update_and_delete() {
        let old = artifact(vec![resource("Vpc", "10.0.0.0/16"), resource("Gone", "10.9.0.0/16")]);
        let new = artifact(vec![resource("Vpc", "10.2.0.0/16"), resource("Fresh", "10.3.0.0/16")]);
        let plan = plan_stack(&new, Some(&lock_of(&old))).unwrap();
        let actions: Vec<_> = plan.changes.iter().map(|c| (c.logical_id.as_str(), c.action)).collect();
        assert_eq!(
            actions,
            vec![
                ("Vpc", ChangeAction::Update),
                ("Fresh", ChangeAction::Create),
                ("Gone", ChangeAction::Delete),
            ]
        );
        assert_eq!((plan.to_create, plan.to_update, plan.to_delete), (1, 1, 1));
        assert!(plan.changes[2].hash.is_empty());
    }

    #[test]
    fn test_an016_depends_on_change_is_update() {
        let old = artifact(vec![resource("Vpc", "10.0.0.0/16")]);
        let mut changed = resource("Vpc", "10.0.0.0/16");
        changed.depends_on.push("Igw".into());
        let plan = plan_stack(&artifact(vec![changed]), Some(&lock_of(&old))).unwrap();
        assert_eq!(plan.changes[0].action, ChangeAction::Update);
    }
}

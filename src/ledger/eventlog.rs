//! AN-014: Append-only JSONL deploy event log.
//!
//! Stack events go to `<state>/<stack>/events.jsonl`; run-level events
//! (`deploy_started`, `deploy_completed`) go to `<state>/events.jsonl`.

use crate::core::types::{DeployEvent, TimestampedEvent};
use crate::error::{Error, Result};
use std::io::Write;
use std::path::{Path, PathBuf};
use std::time::{SystemTime, UNIX_EPOCH};

/// Current UTC time as `YYYY-MM-DDTHH:MM:SSZ`.
pub fn now_iso8601() -> String {
    let secs = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_secs();
    format_timestamp(secs)
}

/// Format seconds since the epoch as an ISO 8601 UTC timestamp.
pub fn format_timestamp(secs: u64) -> String {
    let days = (secs / 86_400) as i64;
    let rem = secs % 86_400;
    let (y, m, d) = civil_from_days(days);
    format!(
        "{:04}-{:02}-{:02}T{:02}:{:02}:{:02}Z",
        y,
        m,
        d,
        rem / 3600,
        (rem % 3600) / 60,
        rem % 60
    )
}

// Days since 1970-01-01 to (year, month, day), proleptic Gregorian.
fn civil_from_days(days: i64) -> (i64, u32, u32) {
    let z = days + 719_468;
    let era = z.div_euclid(146_097);
    let doe = z.rem_euclid(146_097);
    let yoe = (doe - doe / 1460 + doe / 36_524 - doe / 146_096) / 365;
    let doy = doe - (365 * yoe + yoe / 4 - yoe / 100);
    let mp = (5 * doy + 2) / 153;
    let d = (doy - (153 * mp + 2) / 5 + 1) as u32;
    let m = (if mp < 10 { mp + 3 } else { mp - 9 }) as u32;
    let y = yoe + era * 400 + i64::from(m <= 2);
    (y, m, d)
}

/// Generate a run ID.
pub fn generate_run_id() -> String {
    let nanos = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_nanos();
    format!("r-{:012x}", nanos & 0xFFFF_FFFF_FFFF)
}

/// Event log for one stack.
pub fn stack_log_path(state_dir: &Path, stack: &str) -> PathBuf {
    state_dir.join(stack).join("events.jsonl")
}

/// Event log for run-level events.
pub fn run_log_path(state_dir: &Path) -> PathBuf {
    state_dir.join("events.jsonl")
}

/// Append an event to the log it belongs to.
pub fn append_event(state_dir: &Path, event: DeployEvent) -> Result<()> {
    let path = match &event {
        DeployEvent::StackApplied { stack, .. }
        | DeployEvent::StackFailed { stack, .. }
        | DeployEvent::StackSkipped { stack, .. } => stack_log_path(state_dir, stack),
        DeployEvent::DeployStarted { .. } | DeployEvent::DeployCompleted { .. } => {
            run_log_path(state_dir)
        }
    };
    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent).map_err(|e| Error::io("cannot create", parent, e))?;
    }

    let te = TimestampedEvent {
        ts: now_iso8601(),
        event,
    };
    let json = serde_json::to_string(&te)?;

    let mut file = std::fs::OpenOptions::new()
        .create(true)
        .append(true)
        .open(&path)
        .map_err(|e| Error::io("cannot open event log", &path, e))?;
    writeln!(file, "{}", json).map_err(|e| Error::io("cannot write", &path, e))?;
    Ok(())
}

/// Read back every event in a log. Missing log means no events.
pub fn read_events(path: &Path) -> Result<Vec<TimestampedEvent>> {
    if !path.exists() {
        return Ok(Vec::new());
    }
    let content = std::fs::read_to_string(path).map_err(|e| Error::io("cannot read", path, e))?;
    content
        .lines()
        .filter(|l| !l.trim().is_empty())
        .map(|l| serde_json::from_str(l).map_err(Error::from))
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_an014_now_iso8601() {
        let ts = now_iso8601();
        assert!(ts.starts_with("20"));
        assert!(ts.ends_with('Z'));
        assert!(ts.contains('T'));
    }

    #[test]
    fn test_an014_format_timestamp_known_points() {
        assert_eq!(format_timestamp(0), "1970-01-01T00:00:00Z");
        // 2000-02-29 leap day
        assert_eq!(format_timestamp(951_782_400), "2000-02-29T00:00:00Z");
        assert_eq!(format_timestamp(1_700_000_000), "2023-11-14T22:13:20Z");
    }

    #[test]
    fn test_an014_generate_run_id() {
        let id = generate_run_id();
        assert!(id.starts_with("r-"));
        assert_eq!(id.len(), 14);
    }

    #[test]
    fn test_an014_stack_events_land_in_stack_log() {
        let dir = tempfile::tempdir().unwrap();
        append_event(
            dir.path(),
            DeployEvent::StackFailed {
                stack: "Eks".into(),
                run_id: "r-abc".into(),
                error: "boom".into(),
            },
        )
        .unwrap();
        let content = std::fs::read_to_string(dir.path().join("Eks/events.jsonl")).unwrap();
        assert!(content.contains("stack_failed"));
        assert!(content.contains("r-abc"));
        assert!(!run_log_path(dir.path()).exists());
    }

    #[test]
    fn test_an014_run_events_roundtrip() {
        let dir = tempfile::tempdir().unwrap();
        for _ in 0..2 {
            append_event(
                dir.path(),
                DeployEvent::DeployStarted {
                    app: "demo".into(),
                    run_id: "r-1".into(),
                    andamio_version: "0.3.0".into(),
                    stacks: vec!["Network".into()],
                },
            )
            .unwrap();
        }
        let events = read_events(&run_log_path(dir.path())).unwrap();
        assert_eq!(events.len(), 2);
        assert!(matches!(events[0].event, DeployEvent::DeployStarted { .. }));
    }

    #[test]
    fn test_an014_read_missing_log() {
        let dir = tempfile::tempdir().unwrap();
        assert!(read_events(&dir.path().join("nope.jsonl")).unwrap().is_empty());
    }
}

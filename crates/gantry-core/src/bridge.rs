//! Helpers for the outward protocol bridges.
//!
//! The bridges translate the engine's run model into external agent-interop
//! vocabularies. They live outside this repo; the composite task identifier
//! and the status mapping they depend on are defined here so both sides agree.

use crate::ids::{RunId, ThreadId};
use crate::run::RunStatus;

/// Composite task identifier: `"{thread_id}:{run_id}"`.
pub fn create_task_id(thread_id: &ThreadId, run_id: &RunId) -> String {
    format!("{thread_id}:{run_id}")
}

/// Split a composite task identifier back into its parts.
///
/// Splits on the first colon only; any further colons belong to the run id.
pub fn parse_task_id(task_id: &str) -> Option<(ThreadId, RunId)> {
    let (thread, run) = task_id.split_once(':')?;
    if thread.is_empty() || run.is_empty() {
        return None;
    }
    Some((ThreadId::from_raw(thread), RunId::from_raw(run)))
}

/// Map a run status onto the bridge task-state vocabulary.
pub fn bridge_task_state(status: RunStatus) -> &'static str {
    match status {
        RunStatus::Pending => "submitted",
        RunStatus::Running => "working",
        RunStatus::Success => "completed",
        RunStatus::Error | RunStatus::Timeout => "failed",
        RunStatus::Interrupted => "input-required",
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn task_id_roundtrip() {
        let thread = ThreadId::new();
        let run = RunId::new();
        let task_id = create_task_id(&thread, &run);
        let (t, r) = parse_task_id(&task_id).unwrap();
        assert_eq!(t, thread);
        assert_eq!(r, run);
    }

    #[test]
    fn splits_on_first_colon_only() {
        let (t, r) = parse_task_id("thread_a:run:with:colons").unwrap();
        assert_eq!(t.as_str(), "thread_a");
        assert_eq!(r.as_str(), "run:with:colons");
    }

    #[test]
    fn rejects_malformed_task_ids() {
        assert!(parse_task_id("no-colon-here").is_none());
        assert!(parse_task_id(":run_1").is_none());
        assert!(parse_task_id("thread_1:").is_none());
        assert!(parse_task_id("").is_none());
    }

    #[test]
    fn status_mapping_table() {
        assert_eq!(bridge_task_state(RunStatus::Pending), "submitted");
        assert_eq!(bridge_task_state(RunStatus::Running), "working");
        assert_eq!(bridge_task_state(RunStatus::Success), "completed");
        assert_eq!(bridge_task_state(RunStatus::Error), "failed");
        assert_eq!(bridge_task_state(RunStatus::Timeout), "failed");
        assert_eq!(bridge_task_state(RunStatus::Interrupted), "input-required");
    }
}

//! Per-thread admission control.
//!
//! The read-decide-write sequence ("is there an active run? then act") is a
//! critical section per thread id: callers hold the thread's gate across
//! [`resolve`] and the subsequent run creation so two concurrent requests
//! never both conclude they own the thread. Gates for different threads
//! never contend.

use std::sync::Arc;

use dashmap::DashMap;
use tokio::sync::{Mutex, OwnedMutexGuard};

use gantry_core::ids::{RunId, ThreadId};
use gantry_core::run::{MultitaskStrategy, RunStatus};
use gantry_store::runs::RunRow;

use crate::error::EngineError;

/// What to do with an admitted run request.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum Admission {
    /// No active run: create and start immediately.
    Start,
    /// An active run exists and the strategy is `enqueue`: create in
    /// `pending`; it starts when the queue reaches it.
    Queue,
    /// The prior active run is marked with `mark` and the new run starts.
    SupersedePrior { prior: RunId, mark: RunStatus },
}

/// Apply the multitask policy table to the thread's current active run.
pub fn resolve(
    strategy: MultitaskStrategy,
    active: Option<&RunRow>,
) -> Result<Admission, EngineError> {
    let Some(active) = active else {
        return Ok(Admission::Start);
    };

    match strategy {
        MultitaskStrategy::Reject => Err(EngineError::Conflict(format!(
            "thread {} already has an active run {} ({})",
            active.thread_id, active.id, active.status
        ))),
        MultitaskStrategy::Interrupt => Ok(Admission::SupersedePrior {
            prior: active.id.clone(),
            mark: RunStatus::Interrupted,
        }),
        MultitaskStrategy::Rollback => Ok(Admission::SupersedePrior {
            prior: active.id.clone(),
            mark: RunStatus::Error,
        }),
        MultitaskStrategy::Enqueue => Ok(Admission::Queue),
    }
}

/// Keyed mutual exclusion over thread ids. Locks are created on first use
/// and retained for the process lifetime.
#[derive(Default)]
pub struct ThreadGates {
    gates: DashMap<ThreadId, Arc<Mutex<()>>>,
}

impl ThreadGates {
    pub fn new() -> Self {
        Self::default()
    }

    /// Acquire the gate for one thread, waiting if another request holds it.
    pub async fn lock(&self, thread_id: &ThreadId) -> OwnedMutexGuard<()> {
        let gate = self
            .gates
            .entry(thread_id.clone())
            .or_insert_with(|| Arc::new(Mutex::new(())))
            .clone();
        gate.lock_owned().await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use gantry_core::ids::{AssistantId, RunId};
    use gantry_core::run::RunKwargs;
    use serde_json::json;

    fn active_run(status: RunStatus) -> RunRow {
        RunRow {
            id: RunId::from_raw("run_active"),
            thread_id: ThreadId::from_raw("thread_1"),
            assistant_id: AssistantId::from_raw("asst_1"),
            status,
            multitask_strategy: MultitaskStrategy::Reject,
            kwargs: RunKwargs::default(),
            metadata: json!({}),
            created_at: "2025-01-01T00:00:00Z".into(),
            updated_at: "2025-01-01T00:00:00Z".into(),
        }
    }

    #[test]
    fn no_active_run_always_starts() {
        for strategy in [
            MultitaskStrategy::Reject,
            MultitaskStrategy::Interrupt,
            MultitaskStrategy::Rollback,
            MultitaskStrategy::Enqueue,
        ] {
            assert_eq!(resolve(strategy, None).unwrap(), Admission::Start);
        }
    }

    #[test]
    fn reject_with_active_run_is_conflict() {
        let run = active_run(RunStatus::Running);
        let err = resolve(MultitaskStrategy::Reject, Some(&run)).unwrap_err();
        assert_eq!(err.kind(), "conflict");
        assert!(err.to_string().contains("active run"));
    }

    #[test]
    fn interrupt_supersedes_with_interrupted() {
        let run = active_run(RunStatus::Pending);
        let admission = resolve(MultitaskStrategy::Interrupt, Some(&run)).unwrap();
        assert_eq!(
            admission,
            Admission::SupersedePrior {
                prior: RunId::from_raw("run_active"),
                mark: RunStatus::Interrupted,
            }
        );
    }

    #[test]
    fn rollback_supersedes_with_error() {
        let run = active_run(RunStatus::Running);
        let admission = resolve(MultitaskStrategy::Rollback, Some(&run)).unwrap();
        assert_eq!(
            admission,
            Admission::SupersedePrior {
                prior: RunId::from_raw("run_active"),
                mark: RunStatus::Error,
            }
        );
    }

    #[test]
    fn enqueue_queues_behind_active_run() {
        let run = active_run(RunStatus::Running);
        assert_eq!(
            resolve(MultitaskStrategy::Enqueue, Some(&run)).unwrap(),
            Admission::Queue
        );
    }

    #[tokio::test]
    async fn gates_serialize_per_thread() {
        let gates = Arc::new(ThreadGates::new());
        let thread = ThreadId::from_raw("thread_1");

        let held = gates.lock(&thread).await;

        let contender = {
            let gates = gates.clone();
            let thread = thread.clone();
            tokio::spawn(async move {
                let _guard = gates.lock(&thread).await;
            })
        };

        tokio::time::sleep(std::time::Duration::from_millis(20)).await;
        assert!(!contender.is_finished());

        drop(held);
        contender.await.unwrap();
    }

    #[tokio::test]
    async fn gates_for_different_threads_do_not_contend() {
        let gates = ThreadGates::new();
        let _a = gates.lock(&ThreadId::from_raw("thread_a")).await;
        // Completes immediately even while thread_a's gate is held.
        let _b = gates.lock(&ThreadId::from_raw("thread_b")).await;
    }
}

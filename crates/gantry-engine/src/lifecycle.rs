//! Run status transitions, cancellation, and join.
//!
//! The controller is the only writer of run status. It validates every
//! transition against the state machine, keeps the owning thread's
//! busy/idle flag in step, and hands out per-run cancellation and
//! completion tokens for cooperative signalling.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use dashmap::DashMap;
use serde::Serialize;
use tokio_util::sync::CancellationToken;
use tracing::instrument;

use gantry_core::ids::{AssistantId, RunId, ThreadId};
use gantry_core::run::{MultitaskStrategy, RunKwargs, RunStatus};
use gantry_store::assistants::AssistantRepo;
use gantry_store::runs::{RunRepo, RunRow};
use gantry_store::threads::{ThreadRepo, ThreadRow, ThreadStatus};
use gantry_store::Database;

use crate::error::EngineError;

/// Thread state plus the run that produced it, returned from `join`/`wait`
/// in both success and failure cases. Execution errors show up as the run's
/// terminal status, not as a failed join.
#[derive(Clone, Debug, Serialize)]
pub struct ThreadSnapshot {
    pub thread: ThreadRow,
    pub run: RunRow,
}

/// Cooperative signalling handles for one run.
#[derive(Clone)]
pub struct RunHandles {
    /// Fired to request cancellation; observed by the executor at its next
    /// suspension point.
    pub cancel: CancellationToken,
    /// Fired once the run reaches a terminal state; waited on by `join`.
    pub done: CancellationToken,
    started: Arc<AtomicBool>,
}

impl RunHandles {
    fn new(shutdown: &CancellationToken) -> Self {
        Self {
            cancel: shutdown.child_token(),
            done: CancellationToken::new(),
            started: Arc::new(AtomicBool::new(false)),
        }
    }

    /// Claim the run for an executor. Returns false if already claimed.
    pub fn mark_started(&self) -> bool {
        !self.started.swap(true, Ordering::SeqCst)
    }

    pub fn started(&self) -> bool {
        self.started.load(Ordering::SeqCst)
    }
}

pub struct RunLifecycleController {
    threads: ThreadRepo,
    runs: RunRepo,
    assistants: AssistantRepo,
    handles: DashMap<RunId, RunHandles>,
    shutdown: CancellationToken,
}

impl RunLifecycleController {
    pub fn new(db: Database, shutdown: CancellationToken) -> Self {
        Self {
            threads: ThreadRepo::new(db.clone()),
            runs: RunRepo::new(db.clone()),
            assistants: AssistantRepo::new(db),
            handles: DashMap::new(),
            shutdown,
        }
    }

    /// Create a new run in `pending`. Fails NotFound if the thread or
    /// assistant is absent.
    #[instrument(skip(self, kwargs, metadata), fields(thread_id = %thread_id, assistant_id = %assistant_id))]
    pub fn create(
        &self,
        thread_id: &ThreadId,
        assistant_id: &AssistantId,
        strategy: MultitaskStrategy,
        kwargs: &RunKwargs,
        metadata: &serde_json::Value,
    ) -> Result<RunRow, EngineError> {
        self.threads.get(thread_id)?;
        self.assistants.get(assistant_id)?;
        Ok(self.runs.create(thread_id, assistant_id, strategy, kwargs, metadata)?)
    }

    /// Register signalling handles for a freshly created run. Cancellation
    /// chains off the engine-wide shutdown token.
    pub fn register(&self, run_id: &RunId) -> RunHandles {
        let handles = RunHandles::new(&self.shutdown);
        self.handles.insert(run_id.clone(), handles.clone());
        handles
    }

    pub fn handles(&self, run_id: &RunId) -> Option<RunHandles> {
        self.handles.get(run_id).map(|entry| entry.value().clone())
    }

    /// Drop a finished run's handles. The `done` token stays cancelled for
    /// any clone still held by a joiner.
    pub fn release(&self, run_id: &RunId) {
        self.handles.remove(run_id);
    }

    /// Advance a run's status. Backward and post-terminal moves are a
    /// Conflict; reaching a terminal state fires the run's `done` token.
    #[instrument(skip(self), fields(run_id = %run_id, next = %next))]
    pub fn transition(&self, run_id: &RunId, next: RunStatus) -> Result<RunRow, EngineError> {
        let run = self.runs.get(run_id)?;
        if !run.status.can_transition_to(next) {
            return Err(EngineError::Conflict(format!(
                "run {run_id} cannot transition from {} to {next}",
                run.status
            )));
        }
        self.runs.set_status(run_id, next)?;

        if next.is_terminal() {
            if let Some(handles) = self.handles(run_id) {
                handles.done.cancel();
            }
        }
        Ok(self.runs.get(run_id)?)
    }

    /// Cancel a run: valid only from `pending` or `running`, result status
    /// is `interrupted`. Cancelling a terminal run is a Conflict, never a
    /// silent no-op. `release_thread` returns the owning thread to `idle`
    /// (skipped when the cancelled run never held the thread).
    #[instrument(skip(self), fields(run_id = %run_id))]
    pub fn cancel(&self, run_id: &RunId, release_thread: bool) -> Result<RunRow, EngineError> {
        let run = self.runs.get(run_id)?;
        if run.status.is_terminal() {
            return Err(EngineError::Conflict(format!(
                "cannot cancel run {run_id}: already {}",
                run.status
            )));
        }

        self.runs.set_status(run_id, RunStatus::Interrupted)?;
        if release_thread {
            let _ = self.threads.set_status(&run.thread_id, ThreadStatus::Idle);
        }

        if let Some(handles) = self.handles(run_id) {
            handles.cancel.cancel();
            handles.done.cancel();
        }
        Ok(self.runs.get(run_id)?)
    }

    /// Suspend until the run reaches a terminal state or the timeout
    /// elapses; either way, return the thread's current state snapshot.
    #[instrument(skip(self), fields(run_id = %run_id))]
    pub async fn join(
        &self,
        run_id: &RunId,
        timeout: Option<Duration>,
    ) -> Result<ThreadSnapshot, EngineError> {
        let run = self.runs.get(run_id)?;
        if !run.status.is_terminal() {
            if let Some(handles) = self.handles(run_id) {
                match timeout {
                    Some(limit) => {
                        let _ = tokio::time::timeout(limit, handles.done.cancelled()).await;
                    }
                    None => handles.done.cancelled().await,
                }
            }
        }
        self.snapshot(run_id)
    }

    /// Current thread + run state.
    pub fn snapshot(&self, run_id: &RunId) -> Result<ThreadSnapshot, EngineError> {
        let run = self.runs.get(run_id)?;
        let thread = self.threads.get(&run.thread_id)?;
        Ok(ThreadSnapshot { thread, run })
    }
}

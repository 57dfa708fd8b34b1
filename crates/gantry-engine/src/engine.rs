//! The run executor: admits requests, drives graphs, delivers events, and
//! keeps the one-active-run-per-thread guarantee.

use std::sync::Arc;
use std::time::Duration;

use dashmap::DashMap;
use serde_json::{Map, Value};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, instrument, warn};

use gantry_core::events::RunEvent;
use gantry_core::ids::{AssistantId, RunId, ThreadId};
use gantry_core::run::{MultitaskStrategy, OnCompletion, RunKwargs, RunStatus};
use gantry_graph::cache::GraphBuildCache;
use gantry_graph::{GraphError, GraphFactory};
use gantry_store::assistants::AssistantRepo;
use gantry_store::runs::{RunRepo, RunRow};
use gantry_store::threads::{ThreadRepo, ThreadStatus};
use gantry_store::Database;

use crate::error::EngineError;
use crate::lifecycle::{RunHandles, RunLifecycleController, ThreadSnapshot};
use crate::multitask::{self, Admission, ThreadGates};
use crate::streaming::{EventSink, StreamingSession};

const DEFAULT_RUN_TIMEOUT: Duration = Duration::from_secs(3600);

pub struct EngineConfig {
    /// Wall-clock limit for one run's execution; hitting it marks the run
    /// `timeout`.
    pub run_timeout: Duration,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            run_timeout: DEFAULT_RUN_TIMEOUT,
        }
    }
}

/// Input contract for a run-creation request.
#[derive(Clone, Debug)]
pub struct RunRequest {
    pub assistant_id: AssistantId,
    pub kwargs: RunKwargs,
    pub metadata: Value,
    pub strategy: MultitaskStrategy,
}

impl RunRequest {
    pub fn new(assistant_id: AssistantId) -> Self {
        Self {
            assistant_id,
            kwargs: RunKwargs::default(),
            metadata: Value::Object(Map::new()),
            strategy: MultitaskStrategy::default(),
        }
    }

    pub fn with_input(mut self, input: Value) -> Self {
        self.kwargs.input = input;
        self
    }

    pub fn with_config(mut self, config: Value) -> Self {
        self.kwargs.config = config;
        self
    }

    pub fn with_strategy(mut self, strategy: MultitaskStrategy) -> Self {
        self.strategy = strategy;
        self
    }

    pub fn with_metadata(mut self, metadata: Value) -> Self {
        self.metadata = metadata;
        self
    }
}

enum ExecOutcome {
    Completed(Value),
    Cancelled,
    TimedOut,
    Failed(String),
}

pub struct RunEngine {
    threads: ThreadRepo,
    runs: RunRepo,
    assistants: AssistantRepo,
    lifecycle: RunLifecycleController,
    gates: ThreadGates,
    cache: Arc<GraphBuildCache>,
    factory: Arc<dyn GraphFactory>,
    sinks: DashMap<RunId, EventSink>,
    // One executor per thread: the run currently holding it.
    executing: DashMap<ThreadId, RunId>,
    config: EngineConfig,
    shutdown: CancellationToken,
}

impl RunEngine {
    pub fn new(
        db: Database,
        factory: Arc<dyn GraphFactory>,
        cache: Arc<GraphBuildCache>,
        config: EngineConfig,
    ) -> Arc<Self> {
        let shutdown = CancellationToken::new();
        Arc::new(Self {
            threads: ThreadRepo::new(db.clone()),
            runs: RunRepo::new(db.clone()),
            assistants: AssistantRepo::new(db.clone()),
            lifecycle: RunLifecycleController::new(db, shutdown.clone()),
            gates: ThreadGates::new(),
            cache,
            factory,
            sinks: DashMap::new(),
            executing: DashMap::new(),
            config,
            shutdown,
        })
    }

    pub fn threads(&self) -> &ThreadRepo {
        &self.threads
    }

    pub fn runs(&self) -> &RunRepo {
        &self.runs
    }

    pub fn assistants(&self) -> &AssistantRepo {
        &self.assistants
    }

    pub fn cache(&self) -> &GraphBuildCache {
        &self.cache
    }

    /// Admit and create a run on an existing thread, returning the run and
    /// its event session. Admission is a per-thread critical section: the
    /// active-run check, the policy decision, and the creation happen under
    /// the thread's gate.
    #[instrument(skip(self, request), fields(thread_id = %thread_id, assistant_id = %request.assistant_id, strategy = %request.strategy))]
    pub async fn create_run(
        self: &Arc<Self>,
        thread_id: &ThreadId,
        request: RunRequest,
    ) -> Result<(RunRow, StreamingSession), EngineError> {
        if request.assistant_id.as_str().is_empty() {
            return Err(EngineError::InvalidInput("assistant_id is required".into()));
        }

        let _gate = self.gates.lock(thread_id).await;

        self.threads.get(thread_id)?;
        self.assistants.get(&request.assistant_id)?;

        let active = self.runs.active_for_thread(thread_id)?;
        let admission = multitask::resolve(request.strategy, active.as_ref())?;

        if let Admission::SupersedePrior { prior, mark } = &admission {
            self.supersede(prior, *mark);
        }

        let run = self.lifecycle.create(
            thread_id,
            &request.assistant_id,
            request.strategy,
            &request.kwargs,
            &request.metadata,
        )?;
        self.lifecycle.register(&run.id);

        let (tx, rx) = mpsc::unbounded_channel();
        self.sinks
            .insert(run.id.clone(), EventSink::new(run.id.clone(), tx));
        let session = StreamingSession::new(run.id.clone(), rx);

        if !matches!(admission, Admission::Queue) {
            self.threads.set_status(thread_id, ThreadStatus::Busy)?;
            self.spawn_executor(run.clone());
        }

        info!(run_id = %run.id, queued = matches!(admission, Admission::Queue), "run created");
        Ok((run, session))
    }

    /// Create a run and block until it reaches a terminal state. Shares the
    /// streaming code path; only the materialized snapshot is returned.
    pub async fn wait(
        self: &Arc<Self>,
        thread_id: &ThreadId,
        request: RunRequest,
    ) -> Result<ThreadSnapshot, EngineError> {
        let (run, mut session) = self.create_run(thread_id, request).await?;
        session.drain_to_terminal().await;
        // Snapshot before dropping the session: ephemeral teardown waits for
        // the session to close.
        let snapshot = self.lifecycle.snapshot(&run.id)?;
        drop(session);
        Ok(snapshot)
    }

    /// Cancel a run. Conflict if it is already terminal.
    #[instrument(skip(self), fields(run_id = %run_id))]
    pub async fn cancel(&self, run_id: &RunId) -> Result<RunRow, EngineError> {
        let run = self.runs.get(run_id)?;
        let _gate = self.gates.lock(&run.thread_id).await;

        let started = self
            .lifecycle
            .handles(run_id)
            .map(|h| h.started())
            .unwrap_or(true);

        let cancelled = self.lifecycle.cancel(run_id, started)?;
        if !started {
            // Queued but never executed: no executor will emit its events.
            self.finalize_unstarted(&cancelled, "cancelled before start");
        }
        Ok(cancelled)
    }

    /// Suspend until the run is terminal (or the timeout elapses) and return
    /// the thread's state snapshot.
    pub async fn join(
        &self,
        run_id: &RunId,
        timeout: Option<Duration>,
    ) -> Result<ThreadSnapshot, EngineError> {
        self.lifecycle.join(run_id, timeout).await
    }

    pub fn snapshot(&self, run_id: &RunId) -> Result<ThreadSnapshot, EngineError> {
        self.lifecycle.snapshot(run_id)
    }

    /// Request cooperative cancellation of every active run. Used at
    /// process shutdown.
    pub fn abort_all(&self) {
        info!("aborting all active runs");
        self.shutdown.cancel();
    }

    fn supersede(&self, prior: &RunId, mark: RunStatus) {
        let started = self
            .lifecycle
            .handles(prior)
            .map(|h| h.started())
            .unwrap_or(true);

        match self.lifecycle.transition(prior, mark) {
            Ok(prior_run) => {
                if let Some(handles) = self.lifecycle.handles(prior) {
                    handles.cancel.cancel();
                }
                if !started {
                    self.finalize_unstarted(&prior_run, "superseded before start");
                }
                info!(run_id = %prior, status = %mark, "prior run superseded");
            }
            Err(err) => {
                // The prior run finished between the active check and now.
                warn!(run_id = %prior, error = %err, "supersede raced with completion");
            }
        }
    }

    /// Emit the full event sequence for a run that was terminated without
    /// ever executing.
    fn finalize_unstarted(&self, run: &RunRow, reason: &str) {
        if let Some((_, sink)) = self.sinks.remove(&run.id) {
            sink.send(RunEvent::Metadata {
                run_id: run.id.clone(),
                attempt: 1,
            });
            sink.send(terminal_event(
                run.id.clone(),
                run.status,
                Value::Null,
                reason.to_string(),
            ));
        }
        self.lifecycle.release(&run.id);
    }

    /// Claim the thread's executor slot and spawn. Callers hold the thread
    /// gate, so the slot check in [`Self::reschedule`] and this insert never
    /// interleave.
    fn spawn_executor(self: &Arc<Self>, run: RunRow) {
        let Some(handles) = self.lifecycle.handles(&run.id) else {
            return;
        };
        if !handles.mark_started() {
            return;
        }
        self.executing.insert(run.thread_id.clone(), run.id.clone());
        let engine = Arc::clone(self);
        tokio::spawn(async move { engine.execute(run).await });
    }

    #[instrument(skip_all, fields(run_id = %run.id, thread_id = %run.thread_id))]
    async fn execute(self: Arc<Self>, run: RunRow) {
        let (Some(handles), Some(sink)) = (
            self.lifecycle.handles(&run.id),
            self.sinks.get(&run.id).map(|entry| entry.value().clone()),
        ) else {
            self.executing
                .remove_if(&run.thread_id, |_, current| current == &run.id);
            return;
        };

        sink.send(RunEvent::Metadata {
            run_id: run.id.clone(),
            attempt: 1,
        });

        let outcome = self.drive(&run, &handles, &sink).await;

        let (status, event) = match outcome {
            ExecOutcome::Completed(values) => {
                match self.lifecycle.transition(&run.id, RunStatus::Success) {
                    Ok(_) => {
                        let _ = self.threads.update_values(&run.thread_id, &values);
                        (
                            RunStatus::Success,
                            RunEvent::End {
                                run_id: run.id.clone(),
                                status: RunStatus::Success,
                                values,
                            },
                        )
                    }
                    Err(_) => {
                        // Cancelled while the final value was being produced.
                        let status = self.terminal_status(&run.id, RunStatus::Interrupted);
                        (
                            status,
                            terminal_event(run.id.clone(), status, Value::Null, "superseded".into()),
                        )
                    }
                }
            }
            ExecOutcome::Cancelled => {
                let status = self.terminal_status(&run.id, RunStatus::Interrupted);
                (
                    status,
                    terminal_event(run.id.clone(), status, Value::Null, "superseded".into()),
                )
            }
            ExecOutcome::TimedOut => {
                let status = self.terminal_status(&run.id, RunStatus::Timeout);
                (
                    status,
                    terminal_event(
                        run.id.clone(),
                        status,
                        Value::Null,
                        "run exceeded its execution time limit".into(),
                    ),
                )
            }
            ExecOutcome::Failed(message) => {
                let status = self.terminal_status(&run.id, RunStatus::Error);
                (status, terminal_event(run.id.clone(), status, Value::Null, message))
            }
        };

        sink.send(event);
        handles.done.cancel();
        self.sinks.remove(&run.id);
        self.lifecycle.release(&run.id);
        info!(status = %status, "run finished");

        self.reschedule(&run).await;
        self.maybe_teardown(&run, sink);
    }

    async fn drive(&self, run: &RunRow, handles: &RunHandles, sink: &EventSink) -> ExecOutcome {
        if let Err(err) = self.lifecycle.transition(&run.id, RunStatus::Running) {
            return match err {
                EngineError::Conflict(_) => ExecOutcome::Cancelled,
                other => ExecOutcome::Failed(other.to_string()),
            };
        }

        let assistant = match self.assistants.get(&run.assistant_id) {
            Ok(assistant) => assistant,
            Err(err) => return ExecOutcome::Failed(err.to_string()),
        };
        let config = overlay_config(&assistant.config, &run.kwargs.config);

        let graph = match self
            .cache
            .get_or_build(&assistant.graph_id, &config, self.factory.as_ref())
            .await
        {
            Ok(graph) => graph,
            Err(err) => return ExecOutcome::Failed(err.to_string()),
        };

        let (update_tx, mut update_rx) = mpsc::unbounded_channel();
        let run_fut = graph.run(run.kwargs.input.clone(), update_tx, handles.cancel.clone());
        tokio::pin!(run_fut);
        let deadline = tokio::time::sleep(self.config.run_timeout);
        tokio::pin!(deadline);

        loop {
            tokio::select! {
                result = &mut run_fut => {
                    while let Ok(update) = update_rx.try_recv() {
                        sink.send(RunEvent::Update { event: update.event, data: update.data });
                    }
                    return match result {
                        Ok(values) => ExecOutcome::Completed(values),
                        Err(GraphError::Cancelled) => ExecOutcome::Cancelled,
                        Err(err) => ExecOutcome::Failed(err.to_string()),
                    };
                }
                Some(update) = update_rx.recv() => {
                    sink.send(RunEvent::Update { event: update.event, data: update.data });
                }
                _ = &mut deadline => {
                    handles.cancel.cancel();
                    return ExecOutcome::TimedOut;
                }
            }
        }
    }

    /// Start the next queued run (earliest created first) or release the
    /// thread to idle. Execution stays single-file per thread: when a
    /// superseding run's executor already holds the thread, the queue waits
    /// for its wind-down to reschedule instead.
    async fn reschedule(self: &Arc<Self>, run: &RunRow) {
        let _gate = self.gates.lock(&run.thread_id).await;

        self.executing
            .remove_if(&run.thread_id, |_, current| current == &run.id);
        if self.executing.contains_key(&run.thread_id) {
            return;
        }

        match self.runs.next_pending(&run.thread_id, Some(&run.id)) {
            Ok(Some(next)) => {
                let claimed = self
                    .lifecycle
                    .handles(&next.id)
                    .map(|h| h.started())
                    .unwrap_or(true);
                if !claimed {
                    let _ = self.threads.set_status(&run.thread_id, ThreadStatus::Busy);
                    self.spawn_executor(next);
                }
            }
            Ok(None) => match self.runs.active_for_thread(&run.thread_id) {
                Ok(Some(_)) => {}
                Ok(None) => {
                    let _ = self.threads.set_status(&run.thread_id, ThreadStatus::Idle);
                }
                Err(err) => debug!(error = %err, "thread state unavailable after run"),
            },
            Err(err) => debug!(error = %err, "queue check failed after run"),
        }
    }

    /// Delete an ephemeral thread once its terminal event has actually been
    /// delivered (or delivery was abandoned). Failures never change the
    /// run's reported outcome.
    fn maybe_teardown(self: &Arc<Self>, run: &RunRow, sink: EventSink) {
        let Ok(thread) = self.threads.get(&run.thread_id) else {
            return;
        };
        if !thread.is_stateless() || thread.on_completion() != OnCompletion::Delete {
            return;
        }
        if !matches!(self.runs.active_for_thread(&thread.id), Ok(None)) {
            return;
        }

        let engine = Arc::clone(self);
        tokio::spawn(async move {
            sink.closed().await;
            match engine.threads.delete(&thread.id) {
                Ok(()) => debug!(thread_id = %thread.id, "ephemeral thread removed"),
                Err(err) => {
                    let err = EngineError::Unreachable(err.to_string());
                    debug!(thread_id = %thread.id, error = %err, "ephemeral teardown skipped");
                }
            }
        });
    }

    fn terminal_status(&self, run_id: &RunId, fallback: RunStatus) -> RunStatus {
        match self.runs.get(run_id) {
            Ok(run) if run.status.is_terminal() => run.status,
            Ok(_) => match self.lifecycle.transition(run_id, fallback) {
                Ok(run) => run.status,
                Err(_) => fallback,
            },
            Err(_) => fallback,
        }
    }
}

/// `end` closes successful and interrupted runs; `error` closes failed and
/// timed-out ones.
fn terminal_event(run_id: RunId, status: RunStatus, values: Value, message: String) -> RunEvent {
    match status {
        RunStatus::Error | RunStatus::Timeout => RunEvent::Error { run_id, message },
        _ => RunEvent::End { run_id, status, values },
    }
}

/// Shallow overlay of the run's config on top of the assistant's.
fn overlay_config(base: &Value, overlay: &Value) -> Value {
    match (base.as_object(), overlay.as_object()) {
        (Some(base), Some(overlay)) => {
            let mut merged = base.clone();
            for (key, value) in overlay {
                merged.insert(key.clone(), value.clone());
            }
            Value::Object(merged)
        }
        (None, Some(overlay)) => Value::Object(overlay.clone()),
        _ => base.clone(),
    }
}

//! One-shot runs with no pre-existing thread.
//!
//! The coordinator synthesizes a throwaway thread tagged
//! `metadata.stateless = true`, delegates to the normal admission, lifecycle
//! and streaming machinery unchanged, and relies on the executor's teardown
//! hook to remove the thread after the terminal event has been delivered
//! (unless the caller asked to keep it).

use std::sync::Arc;

use serde_json::{json, Value};
use tracing::{debug, instrument};

use gantry_core::ids::AssistantId;
use gantry_core::run::{MultitaskStrategy, OnCompletion, RunKwargs};
use gantry_store::runs::RunRow;
use gantry_store::threads::ThreadRow;

use crate::engine::{RunEngine, RunRequest};
use crate::error::EngineError;
use crate::lifecycle::ThreadSnapshot;
use crate::streaming::StreamingSession;

/// Input contract for a stateless run.
#[derive(Clone, Debug)]
pub struct StatelessRunRequest {
    pub assistant_id: AssistantId,
    pub kwargs: RunKwargs,
    pub metadata: Value,
    pub on_completion: OnCompletion,
}

impl StatelessRunRequest {
    pub fn new(assistant_id: AssistantId) -> Self {
        Self {
            assistant_id,
            kwargs: RunKwargs::default(),
            metadata: json!({}),
            on_completion: OnCompletion::default(),
        }
    }

    pub fn with_input(mut self, input: Value) -> Self {
        self.kwargs.input = input;
        self
    }

    pub fn with_on_completion(mut self, on_completion: OnCompletion) -> Self {
        self.on_completion = on_completion;
        self
    }
}

pub struct StatelessRunCoordinator {
    engine: Arc<RunEngine>,
}

impl StatelessRunCoordinator {
    pub fn new(engine: Arc<RunEngine>) -> Self {
        Self { engine }
    }

    /// Run statelessly, streaming events as they occur. The synthesized
    /// thread is deleted after the terminal event is delivered unless
    /// `on_completion` is `keep`.
    #[instrument(skip(self, request), fields(assistant_id = %request.assistant_id))]
    pub async fn stream(
        &self,
        request: StatelessRunRequest,
    ) -> Result<(RunRow, StreamingSession), EngineError> {
        let thread = self.synthesize_thread(&request)?;
        match self
            .engine
            .create_run(&thread.id, to_run_request(request))
            .await
        {
            Ok(created) => Ok(created),
            Err(err) => {
                self.discard(&thread);
                Err(err)
            }
        }
    }

    /// Run statelessly and block for the final state. Same conflict and
    /// error rules as the streaming path.
    #[instrument(skip(self, request), fields(assistant_id = %request.assistant_id))]
    pub async fn wait(
        &self,
        request: StatelessRunRequest,
    ) -> Result<ThreadSnapshot, EngineError> {
        let thread = self.synthesize_thread(&request)?;
        match self.engine.wait(&thread.id, to_run_request(request)).await {
            Ok(snapshot) => Ok(snapshot),
            Err(err) => {
                self.discard(&thread);
                Err(err)
            }
        }
    }

    fn synthesize_thread(
        &self,
        request: &StatelessRunRequest,
    ) -> Result<ThreadRow, EngineError> {
        let metadata = json!({
            "stateless": true,
            "on_completion": request.on_completion.to_string(),
        });
        Ok(self.engine.threads().create(&metadata)?)
    }

    /// Remove a synthesized thread whose run never got admitted. Best
    /// effort only.
    fn discard(&self, thread: &ThreadRow) {
        if let Err(err) = self.engine.threads().delete(&thread.id) {
            let err = EngineError::Unreachable(err.to_string());
            debug!(thread_id = %thread.id, error = %err, "stateless thread cleanup skipped");
        }
    }
}

fn to_run_request(request: StatelessRunRequest) -> RunRequest {
    RunRequest {
        assistant_id: request.assistant_id,
        kwargs: request.kwargs,
        metadata: request.metadata,
        // The thread is brand new; no active run can exist.
        strategy: MultitaskStrategy::Reject,
    }
}

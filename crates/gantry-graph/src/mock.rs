//! Scripted graphs for deterministic testing without real agent logic.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use serde_json::Value;
use tokio::sync::mpsc::UnboundedSender;
use tokio_util::sync::CancellationToken;

use gantry_core::ids::GraphId;

use crate::{CompiledGraph, GraphError, GraphFactory, GraphUpdate};

/// What a scripted graph does when executed.
#[derive(Clone, Debug)]
pub enum ScriptOutcome {
    /// Finish with these values.
    Succeed(Value),
    /// Fail with this message.
    Fail(String),
    /// Park until the cancellation token fires.
    RunUntilCancelled,
}

/// Pre-programmed graph behavior.
#[derive(Clone, Debug)]
pub struct GraphScript {
    pub delay: Duration,
    pub updates: Vec<(String, Value)>,
    pub outcome: ScriptOutcome,
}

impl GraphScript {
    pub fn succeed(values: Value) -> Self {
        Self {
            delay: Duration::ZERO,
            updates: Vec::new(),
            outcome: ScriptOutcome::Succeed(values),
        }
    }

    pub fn fail(message: impl Into<String>) -> Self {
        Self {
            delay: Duration::ZERO,
            updates: Vec::new(),
            outcome: ScriptOutcome::Fail(message.into()),
        }
    }

    pub fn run_until_cancelled() -> Self {
        Self {
            delay: Duration::ZERO,
            updates: Vec::new(),
            outcome: ScriptOutcome::RunUntilCancelled,
        }
    }

    /// Emit these domain events before finishing.
    pub fn with_updates(mut self, updates: Vec<(String, Value)>) -> Self {
        self.updates = updates;
        self
    }

    /// Sleep before doing anything, to keep the run observable mid-flight.
    pub fn with_delay(mut self, delay: Duration) -> Self {
        self.delay = delay;
        self
    }
}

/// Factory that builds scripted graphs and counts builder invocations.
pub struct MockGraphFactory {
    script: GraphScript,
    build_count: AtomicUsize,
    failing_builds: AtomicUsize,
}

impl MockGraphFactory {
    pub fn new(script: GraphScript) -> Self {
        Self {
            script,
            build_count: AtomicUsize::new(0),
            failing_builds: AtomicUsize::new(0),
        }
    }

    /// Make the first `n` build attempts fail.
    pub fn with_failing_builds(self, n: usize) -> Self {
        self.failing_builds.store(n, Ordering::Relaxed);
        self
    }

    /// How many times the builder has been invoked.
    pub fn build_count(&self) -> usize {
        self.build_count.load(Ordering::Relaxed)
    }
}

#[async_trait]
impl GraphFactory for MockGraphFactory {
    async fn build(
        &self,
        graph_id: &GraphId,
        _config: &Value,
    ) -> Result<Arc<dyn CompiledGraph>, GraphError> {
        self.build_count.fetch_add(1, Ordering::Relaxed);

        let remaining = self.failing_builds.load(Ordering::Relaxed);
        if remaining > 0 {
            self.failing_builds.store(remaining - 1, Ordering::Relaxed);
            return Err(GraphError::Build(format!(
                "scripted build failure for {graph_id}"
            )));
        }

        Ok(Arc::new(MockGraph {
            script: self.script.clone(),
        }))
    }
}

struct MockGraph {
    script: GraphScript,
}

#[async_trait]
impl CompiledGraph for MockGraph {
    async fn run(
        &self,
        _input: Value,
        updates: UnboundedSender<GraphUpdate>,
        cancel: CancellationToken,
    ) -> Result<Value, GraphError> {
        if !self.script.delay.is_zero() {
            tokio::select! {
                _ = tokio::time::sleep(self.script.delay) => {}
                _ = cancel.cancelled() => return Err(GraphError::Cancelled),
            }
        }

        for (event, data) in &self.script.updates {
            if cancel.is_cancelled() {
                return Err(GraphError::Cancelled);
            }
            let _ = updates.send(GraphUpdate {
                event: event.clone(),
                data: data.clone(),
            });
            tokio::task::yield_now().await;
        }

        match &self.script.outcome {
            ScriptOutcome::Succeed(values) => Ok(values.clone()),
            ScriptOutcome::Fail(message) => Err(GraphError::Execution(message.clone())),
            ScriptOutcome::RunUntilCancelled => {
                cancel.cancelled().await;
                Err(GraphError::Cancelled)
            }
        }
    }
}

//! Built-in fallback graph: echoes its input back as the final values.
//! Useful for smoke-testing the orchestration path without real agent logic.

use std::sync::Arc;

use async_trait::async_trait;
use serde_json::Value;
use tokio::sync::mpsc::UnboundedSender;
use tokio_util::sync::CancellationToken;

use gantry_core::ids::GraphId;

use crate::{CompiledGraph, GraphError, GraphFactory, GraphUpdate};

pub struct EchoGraphFactory;

#[async_trait]
impl GraphFactory for EchoGraphFactory {
    async fn build(
        &self,
        _graph_id: &GraphId,
        _config: &Value,
    ) -> Result<Arc<dyn CompiledGraph>, GraphError> {
        Ok(Arc::new(EchoGraph))
    }
}

struct EchoGraph;

#[async_trait]
impl CompiledGraph for EchoGraph {
    async fn run(
        &self,
        input: Value,
        updates: UnboundedSender<GraphUpdate>,
        cancel: CancellationToken,
    ) -> Result<Value, GraphError> {
        if cancel.is_cancelled() {
            return Err(GraphError::Cancelled);
        }
        let _ = updates.send(GraphUpdate {
            event: "values".into(),
            data: input.clone(),
        });
        Ok(input)
    }
}

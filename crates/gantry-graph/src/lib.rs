//! The graph seam: the engine's sole source of executable agent logic.
//!
//! A [`GraphFactory`] compiles an assistant's configuration into a
//! [`CompiledGraph`]; the [`cache::GraphBuildCache`] memoizes compiled graphs
//! per semantic-configuration fingerprint so repeated runs are cheap.

pub mod cache;
pub mod echo;
pub mod fingerprint;
pub mod mock;

use std::sync::Arc;

use async_trait::async_trait;
use serde_json::Value;
use tokio::sync::mpsc::UnboundedSender;
use tokio_util::sync::CancellationToken;

use gantry_core::ids::GraphId;

#[derive(Clone, Debug, thiserror::Error)]
pub enum GraphError {
    #[error("graph build failed: {0}")]
    Build(String),

    #[error("graph execution failed: {0}")]
    Execution(String),

    #[error("cancelled")]
    Cancelled,
}

/// A domain event surfaced by a graph while it executes. The name becomes
/// the stream event type (`values`, `updates`, ...).
#[derive(Clone, Debug)]
pub struct GraphUpdate {
    pub event: String,
    pub data: Value,
}

/// An executable agent graph, opaque to the engine.
#[async_trait]
pub trait CompiledGraph: Send + Sync {
    /// Execute against `input`, pushing domain updates as they occur.
    /// Cancellation is cooperative: implementations observe `cancel` at
    /// their suspension points and return [`GraphError::Cancelled`].
    async fn run(
        &self,
        input: Value,
        updates: UnboundedSender<GraphUpdate>,
        cancel: CancellationToken,
    ) -> Result<Value, GraphError>;
}

/// Compiles a configuration into an executable graph. May fail.
#[async_trait]
pub trait GraphFactory: Send + Sync {
    async fn build(
        &self,
        graph_id: &GraphId,
        config: &Value,
    ) -> Result<Arc<dyn CompiledGraph>, GraphError>;
}

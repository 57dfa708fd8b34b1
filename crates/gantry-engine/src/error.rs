use gantry_graph::GraphError;
use gantry_store::StoreError;

/// Errors surfaced by the engine. `NotFound`, `Conflict` and `InvalidInput`
/// propagate to the caller immediately with a stable kind. `Internal`
/// failures during execution are captured as the run's terminal `error`
/// status instead of escaping the run boundary. `Unreachable` marks
/// best-effort cleanup failures; those are logged and discarded, never
/// returned to callers.
#[derive(Debug, thiserror::Error)]
pub enum EngineError {
    #[error("not found: {0}")]
    NotFound(String),

    #[error("conflict: {0}")]
    Conflict(String),

    #[error("invalid input: {0}")]
    InvalidInput(String),

    #[error("internal error: {0}")]
    Internal(String),

    #[error("unreachable: {0}")]
    Unreachable(String),
}

impl EngineError {
    /// Machine-checkable error kind.
    pub fn kind(&self) -> &'static str {
        match self {
            Self::NotFound(_) => "not_found",
            Self::Conflict(_) => "conflict",
            Self::InvalidInput(_) => "invalid_input",
            Self::Internal(_) => "internal",
            Self::Unreachable(_) => "unreachable",
        }
    }
}

impl From<StoreError> for EngineError {
    fn from(err: StoreError) -> Self {
        match err {
            StoreError::NotFound(what) => Self::NotFound(what),
            other => Self::Internal(other.to_string()),
        }
    }
}

impl From<GraphError> for EngineError {
    fn from(err: GraphError) -> Self {
        Self::Internal(err.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn kinds_are_stable() {
        assert_eq!(EngineError::NotFound("x".into()).kind(), "not_found");
        assert_eq!(EngineError::Conflict("x".into()).kind(), "conflict");
        assert_eq!(EngineError::InvalidInput("x".into()).kind(), "invalid_input");
        assert_eq!(EngineError::Internal("x".into()).kind(), "internal");
        assert_eq!(EngineError::Unreachable("x".into()).kind(), "unreachable");
    }

    #[test]
    fn store_not_found_maps_to_not_found() {
        let err: EngineError = StoreError::NotFound("thread thread_1".into()).into();
        assert_eq!(err.kind(), "not_found");

        let err: EngineError = StoreError::Database("locked".into()).into();
        assert_eq!(err.kind(), "internal");
    }

    #[test]
    fn graph_errors_map_to_internal() {
        let err: EngineError = GraphError::Build("bad config".into()).into();
        assert_eq!(err.kind(), "internal");
        assert!(err.to_string().contains("bad config"));
    }
}

//! Run orchestration and execution.
//!
//! Admission control (one active run per thread, four multitask policies),
//! the run lifecycle state machine, event streaming, stateless one-shot
//! runs, and graph execution against the build cache.

pub mod engine;
pub mod error;
pub mod lifecycle;
pub mod multitask;
pub mod stateless;
pub mod streaming;

pub use engine::{EngineConfig, RunEngine, RunRequest};
pub use error::EngineError;
pub use lifecycle::{RunLifecycleController, ThreadSnapshot};
pub use stateless::{StatelessRunCoordinator, StatelessRunRequest};
pub use streaming::{EventSink, StreamingSession};

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::ids::RunId;
use crate::run::RunStatus;

/// Events emitted for a single run, in order: exactly one `Metadata` first,
/// zero or more `Update`s while the graph executes, then exactly one
/// terminal event (`End` on success or interruption, `Error` on failure).
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum RunEvent {
    Metadata {
        run_id: RunId,
        attempt: u32,
    },
    /// Domain event surfaced by the executing graph (e.g. `values`,
    /// `updates`, `messages`). The name becomes the SSE event type.
    Update {
        event: String,
        data: Value,
    },
    End {
        run_id: RunId,
        status: RunStatus,
        values: Value,
    },
    Error {
        run_id: RunId,
        message: String,
    },
}

impl RunEvent {
    pub fn event_type(&self) -> &str {
        match self {
            Self::Metadata { .. } => "metadata",
            Self::Update { event, .. } => event,
            Self::End { .. } => "end",
            Self::Error { .. } => "error",
        }
    }

    /// The JSON payload carried on the `data:` line.
    pub fn data(&self) -> Value {
        match self {
            Self::Metadata { run_id, attempt } => serde_json::json!({
                "run_id": run_id,
                "attempt": attempt,
            }),
            Self::Update { data, .. } => data.clone(),
            Self::End { run_id, status, values } => serde_json::json!({
                "run_id": run_id,
                "status": status,
                "values": values,
            }),
            Self::Error { run_id, message } => serde_json::json!({
                "run_id": run_id,
                "message": message,
            }),
        }
    }

    /// `End` and `Error` close the sequence; nothing follows them.
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::End { .. } | Self::Error { .. })
    }

    /// Encode as one SSE frame: `event: <type>\ndata: <json>\n\n`.
    pub fn to_sse(&self) -> String {
        format!("event: {}\ndata: {}\n\n", self.event_type(), self.data())
    }
}

/// Parse raw SSE text into (event_type, data) pairs. Debug/test helper for
/// consumers of the wire format.
pub fn parse_sse_frames(raw: &str) -> Vec<(String, String)> {
    let mut frames = Vec::new();
    let mut current_event = String::new();
    let mut current_data = String::new();

    for line in raw.lines() {
        if let Some(event) = line.strip_prefix("event: ") {
            current_event = event.to_string();
        } else if let Some(data) = line.strip_prefix("data: ") {
            current_data = data.to_string();
        } else if line.is_empty() && !current_event.is_empty() {
            frames.push((current_event.clone(), current_data.clone()));
            current_event.clear();
            current_data.clear();
        }
    }

    if !current_event.is_empty() {
        frames.push((current_event, current_data));
    }

    frames
}

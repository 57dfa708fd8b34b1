//! Run event delivery.
//!
//! Each run gets exactly one [`StreamingSession`]: a single-pass, push-based
//! sequence of [`RunEvent`]s with one `metadata` event first and one terminal
//! event last. The producing side is an [`EventSink`] held by the executor;
//! a consumer that drops its session does not pause the run, it only
//! abandons delivery.

use tokio::sync::mpsc;
use tokio_stream::wrappers::UnboundedReceiverStream;
use tokio_stream::{Stream, StreamExt};
use tracing::debug;

use gantry_core::events::RunEvent;
use gantry_core::ids::RunId;

/// Producer half. Send failures mean the consumer went away; the run keeps
/// executing, so they are dropped rather than propagated.
#[derive(Clone)]
pub struct EventSink {
    run_id: RunId,
    tx: mpsc::UnboundedSender<RunEvent>,
}

impl EventSink {
    pub fn new(run_id: RunId, tx: mpsc::UnboundedSender<RunEvent>) -> Self {
        Self { run_id, tx }
    }

    pub fn send(&self, event: RunEvent) {
        if self.tx.send(event).is_err() {
            debug!(run_id = %self.run_id, "stream consumer gone, event dropped");
        }
    }

    /// Resolves once the consuming session has been dropped. Used to defer
    /// ephemeral-thread teardown until the terminal event was delivered (or
    /// delivery was abandoned).
    pub async fn closed(&self) {
        self.tx.closed().await
    }
}

/// Consumer half of one run's event sequence.
#[derive(Debug)]
pub struct StreamingSession {
    run_id: RunId,
    rx: mpsc::UnboundedReceiver<RunEvent>,
}

impl StreamingSession {
    pub fn new(run_id: RunId, rx: mpsc::UnboundedReceiver<RunEvent>) -> Self {
        Self { run_id, rx }
    }

    pub fn run_id(&self) -> &RunId {
        &self.run_id
    }

    /// Next event in order, or `None` once the producer is done and the
    /// buffer is drained.
    pub async fn next_event(&mut self) -> Option<RunEvent> {
        self.rx.recv().await
    }

    /// The remaining events as a `Stream`.
    pub fn into_stream(self) -> impl Stream<Item = RunEvent> {
        UnboundedReceiverStream::new(self.rx)
    }

    /// The remaining events as wire-format SSE frames, for a transport
    /// layer to write out verbatim.
    pub fn into_sse_stream(self) -> impl Stream<Item = String> {
        self.into_stream().map(|event| event.to_sse())
    }

    /// Consume events up to and including the terminal one.
    pub async fn drain_to_terminal(&mut self) -> Vec<RunEvent> {
        let mut events = Vec::new();
        while let Some(event) = self.rx.recv().await {
            let terminal = event.is_terminal();
            events.push(event);
            if terminal {
                break;
            }
        }
        events
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use gantry_core::run::RunStatus;
    use serde_json::json;

    fn session() -> (EventSink, StreamingSession) {
        let (tx, rx) = mpsc::unbounded_channel();
        let id = RunId::from_raw("run_1");
        (EventSink::new(id.clone(), tx), StreamingSession::new(id, rx))
    }

    #[tokio::test]
    async fn events_arrive_in_order() {
        let (sink, mut session) = session();
        sink.send(RunEvent::Metadata { run_id: RunId::from_raw("run_1"), attempt: 1 });
        sink.send(RunEvent::Update { event: "values".into(), data: json!({"n": 1}) });
        sink.send(RunEvent::End {
            run_id: RunId::from_raw("run_1"),
            status: RunStatus::Success,
            values: json!({"n": 1}),
        });

        let events = session.drain_to_terminal().await;
        assert_eq!(events.len(), 3);
        assert_eq!(events[0].event_type(), "metadata");
        assert_eq!(events[1].event_type(), "values");
        assert_eq!(events[2].event_type(), "end");
    }

    #[tokio::test]
    async fn drain_stops_at_terminal() {
        let (sink, mut session) = session();
        sink.send(RunEvent::Metadata { run_id: RunId::from_raw("run_1"), attempt: 1 });
        sink.send(RunEvent::Error {
            run_id: RunId::from_raw("run_1"),
            message: "boom".into(),
        });
        sink.send(RunEvent::Update { event: "late".into(), data: json!({}) });

        let events = session.drain_to_terminal().await;
        assert_eq!(events.len(), 2);
        assert!(events[1].is_terminal());
    }

    #[tokio::test]
    async fn sse_stream_emits_wire_frames() {
        let (sink, session) = session();
        sink.send(RunEvent::Metadata { run_id: RunId::from_raw("run_1"), attempt: 1 });
        sink.send(RunEvent::End {
            run_id: RunId::from_raw("run_1"),
            status: RunStatus::Success,
            values: json!({}),
        });
        drop(sink);

        let frames: Vec<String> = session.into_sse_stream().collect().await;
        assert_eq!(frames.len(), 2);
        assert!(frames[0].starts_with("event: metadata\ndata: "));
        assert!(frames[1].starts_with("event: end\ndata: "));
        assert!(frames.iter().all(|f| f.ends_with("\n\n")));
    }

    #[tokio::test]
    async fn sink_survives_dropped_consumer() {
        let (sink, session) = session();
        drop(session);
        // Must not panic or error: delivery is simply abandoned.
        sink.send(RunEvent::Update { event: "values".into(), data: json!({}) });
    }

    #[tokio::test]
    async fn closed_resolves_after_consumer_drop() {
        let (sink, session) = session();
        let waiter = tokio::spawn(async move { sink.closed().await });
        drop(session);
        waiter.await.unwrap();
    }
}

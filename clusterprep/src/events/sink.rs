//! Sinks for dispatch and node-state events.

use parking_lot::RwLock;
use serde_json::Value;
use tracing::Level;

/// Receives setup events.
///
/// Called from blocking worker threads while remote work is in flight, so
/// `emit` must return quickly and cannot fail.
pub trait EventSink: Send + Sync {
    /// Records one event. `event_type` is dotted, e.g. `node.state`.
    fn emit(&self, event_type: &str, data: Option<Value>);
}

/// Drops every event.
#[derive(Debug, Clone, Copy, Default)]
pub struct NoOpEventSink;

impl EventSink for NoOpEventSink {
    fn emit(&self, _event_type: &str, _data: Option<Value>) {}
}

/// Forwards events to `tracing`.
///
/// `node.state` events are logged with their node, stage and state as
/// fields; everything else is logged with its raw payload.
#[derive(Debug, Clone)]
pub struct LoggingEventSink {
    level: Level,
}

impl Default for LoggingEventSink {
    fn default() -> Self {
        Self::info()
    }
}

impl LoggingEventSink {
    /// Logs at `level`. Levels above `INFO` are treated as `INFO`.
    #[must_use]
    pub fn new(level: Level) -> Self {
        Self { level }
    }

    /// Logs at debug level.
    #[must_use]
    pub fn debug() -> Self {
        Self::new(Level::DEBUG)
    }

    /// Logs at info level.
    #[must_use]
    pub fn info() -> Self {
        Self::new(Level::INFO)
    }

    fn verbose(&self) -> bool {
        self.level >= Level::DEBUG
    }
}

fn field<'a>(data: &'a Value, key: &str) -> &'a str {
    data.get(key).and_then(Value::as_str).unwrap_or("-")
}

impl EventSink for LoggingEventSink {
    fn emit(&self, event_type: &str, data: Option<Value>) {
        match (event_type, data.as_ref()) {
            ("node.state", Some(data)) => {
                let (node, stage, state) =
                    (field(data, "node"), field(data, "stage"), field(data, "state"));
                if self.verbose() {
                    tracing::debug!(node, stage, state, "node state");
                } else {
                    tracing::info!(node, stage, state, "node state");
                }
            }
            _ if self.verbose() => tracing::debug!(event = event_type, data = ?data),
            _ => tracing::info!(event = event_type, data = ?data),
        }
    }
}

/// Keeps every event in memory, for assertions in tests.
#[derive(Debug, Default)]
pub struct CollectingEventSink {
    events: RwLock<Vec<(String, Option<Value>)>>,
}

impl CollectingEventSink {
    /// Creates an empty sink.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Snapshot of all events so far.
    #[must_use]
    pub fn events(&self) -> Vec<(String, Option<Value>)> {
        self.events.read().clone()
    }

    /// Number of events.
    #[must_use]
    pub fn len(&self) -> usize {
        self.events.read().len()
    }

    /// Returns true when nothing was emitted.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.events.read().is_empty()
    }

    /// Forgets all events.
    pub fn clear(&self) {
        self.events.write().clear();
    }

    /// Events whose type starts with `prefix`.
    #[must_use]
    pub fn events_of_type(&self, prefix: &str) -> Vec<(String, Option<Value>)> {
        self.events
            .read()
            .iter()
            .filter(|(kind, _)| kind.starts_with(prefix))
            .cloned()
            .collect()
    }

    /// States reported for one node, in emission order.
    #[must_use]
    pub fn node_states(&self, node_id: &str) -> Vec<String> {
        self.events_of_type("node.state")
            .into_iter()
            .filter_map(|(_, data)| data)
            .filter(|data| data["node"] == node_id)
            .filter_map(|data| data["state"].as_str().map(str::to_string))
            .collect()
    }
}

impl EventSink for CollectingEventSink {
    fn emit(&self, event_type: &str, data: Option<Value>) {
        self.events.write().push((event_type.to_string(), data));
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_logging_sinks_accept_any_payload() {
        NoOpEventSink.emit("dispatch.started", None);
        LoggingEventSink::default().emit(
            "node.state",
            Some(json!({"node": "n1", "stage": "setup", "state": "executing"})),
        );
        LoggingEventSink::debug().emit("node.state", Some(json!({"node": 7})));
        LoggingEventSink::info().emit("dispatch.completed", None);
    }

    #[test]
    fn test_collecting_sink_tracks_node_states() {
        let sink = CollectingEventSink::new();
        assert!(sink.is_empty());

        sink.emit("dispatch.started", None);
        sink.emit("node.state", Some(json!({"node": "a", "state": "init"})));
        sink.emit("node.state", Some(json!({"node": "b", "state": "init"})));
        sink.emit("node.state", Some(json!({"node": "a", "state": "skipped"})));

        assert_eq!(sink.len(), 4);
        assert_eq!(sink.events_of_type("node.").len(), 3);
        assert_eq!(sink.node_states("a"), vec!["init", "skipped"]);
        assert!(sink.node_states("c").is_empty());

        sink.clear();
        assert!(sink.is_empty());
    }
}

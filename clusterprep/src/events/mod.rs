//! Event sinks for setup telemetry.
//!
//! The dispatcher reports every node state transition and every dispatch
//! round through an injected [`EventSink`]. Production code usually plugs in
//! [`LoggingEventSink`]; tests use [`CollectingEventSink`].

mod sink;

pub use sink::{CollectingEventSink, EventSink, LoggingEventSink, NoOpEventSink};

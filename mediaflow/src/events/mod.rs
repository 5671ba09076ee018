//! Event sink system for observability.
//!
//! The stage runner and the orchestrator emit [`crate::core::StageEvent`]s
//! through an [`EventSink`]. Sinks log them, collect them for tests, or
//! append them to the JSON-lines materialization log.

mod sink;

pub use sink::{
    CollectingEventSink, EventSink, FanoutEventSink, JsonlEventSink, LoggingEventSink,
    NoOpEventSink,
};

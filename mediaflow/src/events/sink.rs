//! Event sink trait and implementations.

use crate::core::StageEvent;
use async_trait::async_trait;
use parking_lot::{Mutex, RwLock};
use std::fs::{File, OpenOptions};
use std::io::Write;
use std::path::{Path, PathBuf};
use tracing::{debug, info, warn, Level};

/// Trait for event sinks that receive stage lifecycle events.
#[async_trait]
pub trait EventSink: Send + Sync {
    /// Emits an event asynchronously.
    async fn emit(&self, event: &StageEvent);

    /// Tries to emit an event without blocking.
    ///
    /// This method never fails. Errors are logged and suppressed.
    fn try_emit(&self, event: &StageEvent);
}

/// A no-op event sink that discards all events.
///
/// Used as the default when no sink is configured.
#[derive(Debug, Clone, Copy, Default)]
pub struct NoOpEventSink;

#[async_trait]
impl EventSink for NoOpEventSink {
    async fn emit(&self, _event: &StageEvent) {}

    fn try_emit(&self, _event: &StageEvent) {}
}

/// An event sink that logs events using the tracing framework.
#[derive(Debug, Clone)]
pub struct LoggingEventSink {
    level: Level,
}

impl Default for LoggingEventSink {
    fn default() -> Self {
        Self { level: Level::INFO }
    }
}

impl LoggingEventSink {
    /// Creates a new logging event sink with the specified level.
    #[must_use]
    pub fn new(level: Level) -> Self {
        Self { level }
    }

    /// Creates a debug-level logging sink.
    #[must_use]
    pub fn debug() -> Self {
        Self::new(Level::DEBUG)
    }

    fn log_event(&self, event: &StageEvent) {
        let payload = event.payload();
        if self.level == Level::DEBUG {
            debug!(event_type = %event.event_type, event_data = %payload, "Event: {}", event.event_type);
        } else {
            info!(event_type = %event.event_type, event_data = %payload, "Event: {}", event.event_type);
        }
    }
}

#[async_trait]
impl EventSink for LoggingEventSink {
    async fn emit(&self, event: &StageEvent) {
        self.log_event(event);
    }

    fn try_emit(&self, event: &StageEvent) {
        self.log_event(event);
    }
}

/// A collecting event sink for testing and run summaries.
#[derive(Debug, Default)]
pub struct CollectingEventSink {
    events: RwLock<Vec<StageEvent>>,
}

impl CollectingEventSink {
    /// Creates a new collecting sink.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Returns all collected events.
    #[must_use]
    pub fn events(&self) -> Vec<StageEvent> {
        self.events.read().clone()
    }

    /// Returns the collected event types in emission order.
    #[must_use]
    pub fn event_types(&self) -> Vec<String> {
        self.events
            .read()
            .iter()
            .map(|e| e.event_type.clone())
            .collect()
    }

    /// Returns the number of collected events.
    #[must_use]
    pub fn len(&self) -> usize {
        self.events.read().len()
    }

    /// Returns true if no events have been collected.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.events.read().is_empty()
    }

    /// Clears all collected events.
    pub fn clear(&self) {
        self.events.write().clear();
    }

    /// Returns events matching a type prefix.
    #[must_use]
    pub fn events_of_type(&self, type_prefix: &str) -> Vec<StageEvent> {
        self.events
            .read()
            .iter()
            .filter(|e| e.event_type.starts_with(type_prefix))
            .cloned()
            .collect()
    }
}

#[async_trait]
impl EventSink for CollectingEventSink {
    async fn emit(&self, event: &StageEvent) {
        self.events.write().push(event.clone());
    }

    fn try_emit(&self, event: &StageEvent) {
        self.events.write().push(event.clone());
    }
}

/// Appends every event as one JSON line to a file.
///
/// This is the durable materialization log of the pipeline.
#[derive(Debug)]
pub struct JsonlEventSink {
    path: PathBuf,
    file: Mutex<File>,
}

impl JsonlEventSink {
    /// Opens `path` for appending, creating parent directories.
    pub fn open(path: impl AsRef<Path>) -> std::io::Result<Self> {
        let path = path.as_ref().to_path_buf();
        if let Some(dir) = path.parent() {
            std::fs::create_dir_all(dir)?;
        }
        let file = OpenOptions::new().create(true).append(true).open(&path)?;
        Ok(Self {
            path,
            file: Mutex::new(file),
        })
    }

    /// Returns the log path.
    #[must_use]
    pub fn path(&self) -> &Path {
        &self.path
    }

    fn append(&self, event: &StageEvent) {
        let line = match serde_json::to_string(event) {
            Ok(line) => line,
            Err(e) => {
                warn!(error = %e, event_type = %event.event_type, "Failed to serialize event");
                return;
            }
        };
        let mut file = self.file.lock();
        if let Err(e) = writeln!(file, "{line}") {
            warn!(error = %e, path = %self.path.display(), "Failed to append event");
        }
    }
}

#[async_trait]
impl EventSink for JsonlEventSink {
    async fn emit(&self, event: &StageEvent) {
        self.append(event);
    }

    fn try_emit(&self, event: &StageEvent) {
        self.append(event);
    }
}

/// Forwards every event to several sinks in order.
#[derive(Default)]
pub struct FanoutEventSink {
    sinks: Vec<std::sync::Arc<dyn EventSink>>,
}

impl FanoutEventSink {
    /// Creates an empty fan-out.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Adds a sink.
    #[must_use]
    pub fn with_sink(mut self, sink: std::sync::Arc<dyn EventSink>) -> Self {
        self.sinks.push(sink);
        self
    }
}

impl std::fmt::Debug for FanoutEventSink {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("FanoutEventSink")
            .field("sinks", &self.sinks.len())
            .finish()
    }
}

#[async_trait]
impl EventSink for FanoutEventSink {
    async fn emit(&self, event: &StageEvent) {
        for sink in &self.sinks {
            sink.emit(event).await;
        }
    }

    fn try_emit(&self, event: &StageEvent) {
        for sink in &self.sinks {
            sink.try_emit(event);
        }
    }
}

//! Allocation event tracing
//!
//! Allocators emit structured events (object lifetimes and calls) to an
//! injected [`EventSink`]; there is no process-wide trace state. The
//! JSON-lines sink produces one serialized event per line so traces can be
//! replayed or diffed offline.

use std::fs::File;
use std::io::{BufWriter, Write};
use std::path::Path;
use std::sync::Mutex;
use std::time::{SystemTime, UNIX_EPOCH};

use serde::{Deserialize, Serialize};

/// Kind of a recorded event.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum TraceEventKind {
    ObjectCreated,
    ObjectDestroyed,
    Call,
}

/// One recorded allocator event.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TraceEvent {
    pub kind: TraceEventKind,
    /// Component that emitted the event, e.g. "resource_allocator"
    pub category: String,
    /// Operation or object name, e.g. "create_resource"
    pub name: String,
    pub timestamp_micros: u64,
    /// Event-specific payload
    pub data: serde_json::Value,
}

impl TraceEvent {
    pub fn new(
        kind: TraceEventKind,
        category: &str,
        name: impl Into<String>,
        data: serde_json::Value,
    ) -> Self {
        let timestamp_micros = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map(|d| d.as_micros() as u64)
            .unwrap_or(0);
        TraceEvent {
            kind,
            category: category.to_string(),
            name: name.into(),
            timestamp_micros,
            data,
        }
    }
}

/// Destination for recorded events. Implementations must tolerate
/// concurrent `record` calls.
pub trait EventSink: Send + Sync {
    fn record(&self, event: TraceEvent);

    fn flush(&self) {}
}

/// Sink that drops everything.
#[derive(Debug, Default)]
pub struct NullSink;

impl EventSink for NullSink {
    fn record(&self, _event: TraceEvent) {}
}

/// In-memory sink for tests.
#[derive(Debug, Default)]
pub struct MemorySink {
    events: Mutex<Vec<TraceEvent>>,
}

impl MemorySink {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.events.lock().map(|e| e.len()).unwrap_or(0)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn take(&self) -> Vec<TraceEvent> {
        self.events
            .lock()
            .map(|mut e| std::mem::take(&mut *e))
            .unwrap_or_default()
    }
}

impl EventSink for MemorySink {
    fn record(&self, event: TraceEvent) {
        if let Ok(mut events) = self.events.lock() {
            events.push(event);
        }
    }
}

/// File sink writing one JSON event per line.
#[derive(Debug)]
pub struct JsonLinesSink {
    writer: Mutex<BufWriter<File>>,
}

impl JsonLinesSink {
    pub fn create(path: impl AsRef<Path>) -> std::io::Result<Self> {
        let file = File::create(path)?;
        Ok(JsonLinesSink {
            writer: Mutex::new(BufWriter::new(file)),
        })
    }
}

impl EventSink for JsonLinesSink {
    fn record(&self, event: TraceEvent) {
        let line = match serde_json::to_string(&event) {
            Ok(line) => line,
            Err(e) => {
                tracing::warn!("failed to serialize trace event: {}", e);
                return;
            }
        };
        if let Ok(mut writer) = self.writer.lock() {
            if let Err(e) = writeln!(writer, "{}", line) {
                tracing::warn!("failed to write trace event: {}", e);
            }
        }
    }

    fn flush(&self) {
        if let Ok(mut writer) = self.writer.lock() {
            let _ = writer.flush();
        }
    }
}

impl Drop for JsonLinesSink {
    fn drop(&mut self) {
        self.flush();
    }
}

/// Recording handle threaded through the allocator pipeline. Cloning is
/// cheap; a recorder without a sink is inert.
#[derive(Clone, Default)]
pub(crate) struct TraceRecorder {
    sink: Option<std::sync::Arc<dyn EventSink>>,
    record_objects: bool,
    record_calls: bool,
}

impl TraceRecorder {
    pub fn from_options(options: &crate::config::RecordOptions) -> Self {
        TraceRecorder {
            sink: options.sink.clone(),
            record_objects: options.record_object_events,
            record_calls: options.record_call_events,
        }
    }

    pub fn object_created(&self, category: &'static str, name: &str, data: serde_json::Value) {
        if self.record_objects {
            if let Some(sink) = &self.sink {
                sink.record(TraceEvent::new(
                    TraceEventKind::ObjectCreated,
                    category,
                    name,
                    data,
                ));
            }
        }
    }

    pub fn object_destroyed(&self, category: &'static str, name: &str, data: serde_json::Value) {
        if self.record_objects {
            if let Some(sink) = &self.sink {
                sink.record(TraceEvent::new(
                    TraceEventKind::ObjectDestroyed,
                    category,
                    name,
                    data,
                ));
            }
        }
    }

    pub fn call(&self, category: &'static str, name: &str, data: serde_json::Value) {
        if self.record_calls {
            if let Some(sink) = &self.sink {
                sink.record(TraceEvent::new(TraceEventKind::Call, category, name, data));
            }
        }
    }

    pub fn flush(&self) {
        if let Some(sink) = &self.sink {
            sink.flush();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_memory_sink_records() {
        let sink = MemorySink::new();
        sink.record(TraceEvent::new(
            TraceEventKind::Call,
            "test",
            "op",
            serde_json::json!({"size": 42}),
        ));
        assert_eq!(sink.len(), 1);

        let events = sink.take();
        assert_eq!(events[0].name, "op");
        assert_eq!(events[0].data["size"], 42);
        assert!(sink.is_empty());
    }

    #[test]
    fn test_recorder_respects_flags() {
        let sink = std::sync::Arc::new(MemorySink::new());
        let recorder = TraceRecorder::from_options(&crate::config::RecordOptions {
            record_object_events: false,
            record_call_events: true,
            sink: Some(sink.clone()),
        });

        recorder.object_created("cat", "obj", serde_json::Value::Null);
        assert_eq!(sink.len(), 0);

        recorder.call("cat", "op", serde_json::Value::Null);
        assert_eq!(sink.len(), 1);
    }

    #[test]
    fn test_event_round_trips_through_json() {
        let event = TraceEvent::new(
            TraceEventKind::ObjectCreated,
            "heap",
            "heap-1",
            serde_json::json!({"size": 4096}),
        );
        let json = serde_json::to_string(&event).unwrap();
        let back: TraceEvent = serde_json::from_str(&json).unwrap();
        assert_eq!(back.kind, TraceEventKind::ObjectCreated);
        assert_eq!(back.name, "heap-1");
    }
}

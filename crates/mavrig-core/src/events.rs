//! Structured lifecycle events for the simulator runner.
//!
//! Instead of relying on process-wide logging configuration, the lifecycle
//! manager is handed an [`EventLog`] and emits a typed event at every state
//! transition. Tests subscribe to the broadcast channel and assert on exactly
//! which events were emitted (e.g. that a double `stop()` produced a single
//! `Stopped`). Events can additionally be persisted as JSON Lines under
//! `~/.mavrig/logs/` for post-mortem inspection of a failed run.
//!
//! # Example
//!
//! ```
//! use mavrig_core::events::{EventLog, RunnerEventKind};
//!
//! let events = EventLog::new();
//! let mut rx = events.subscribe();
//! events.emit(RunnerEventKind::Started { port: 14550 });
//!
//! let event = rx.try_recv().unwrap();
//! assert_eq!(event.kind, RunnerEventKind::Started { port: 14550 });
//! ```

use std::fs::File;
use std::io::{BufWriter, Write};
use std::path::PathBuf;
use std::sync::{Arc, Mutex};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::sync::broadcast;
use tracing::debug;
use uuid::Uuid;

use crate::config::harness_dir;

/// Broadcast buffer size; a full lifecycle emits single-digit event counts.
const EVENT_CHANNEL_CAPACITY: usize = 64;

/// Returns the event log directory (`~/.mavrig/logs`).
///
/// Creates the directory if it doesn't exist.
pub fn logs_dir() -> PathBuf {
    let dir = harness_dir().join("logs");
    std::fs::create_dir_all(&dir).ok();
    dir
}

// ---------------------------------------------------------------------------
// Event types
// ---------------------------------------------------------------------------

/// What happened to the simulator process.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum RunnerEventKind {
    /// The simulator process was spawned on the given host port.
    Started { port: u16 },

    /// The readiness marker appeared in the process output.
    Ready,

    /// The process exited or timed out before signaling readiness.
    StartupFailed,

    /// Teardown began.
    Stopping,

    /// The process outlived the grace period and was force-killed.
    GraceExpired,

    /// Teardown finished; `forced` records whether escalation was needed.
    Stopped { forced: bool },
}

/// A timestamped lifecycle event.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RunnerEvent {
    /// When the event was emitted.
    pub at: DateTime<Utc>,

    /// The run this event belongs to.
    pub run_id: Uuid,

    /// What happened.
    pub kind: RunnerEventKind,
}

// ---------------------------------------------------------------------------
// EventLog
// ---------------------------------------------------------------------------

/// Sink for runner lifecycle events.
///
/// Cloning is cheap: clones share the broadcast channel and the optional
/// persistent writer, so the harness can hand one clone to the runner and
/// keep another for subscribers.
#[derive(Clone)]
pub struct EventLog {
    run_id: Uuid,
    tx: broadcast::Sender<RunnerEvent>,
    writer: Option<Arc<Mutex<BufWriter<File>>>>,
}

impl EventLog {
    /// Create an in-memory event log.
    pub fn new() -> Self {
        let (tx, _) = broadcast::channel(EVENT_CHANNEL_CAPACITY);
        Self {
            run_id: Uuid::new_v4(),
            tx,
            writer: None,
        }
    }

    /// Create an event log that also appends JSON Lines to
    /// `~/.mavrig/logs/run-<id>.jsonl`.
    ///
    /// Falls back to in-memory only if the log file cannot be created.
    pub fn persistent() -> Self {
        let mut log = Self::new();
        let path = logs_dir().join(format!("run-{}.jsonl", log.run_id));
        match File::create(&path) {
            Ok(file) => {
                log.writer = Some(Arc::new(Mutex::new(BufWriter::new(file))));
            }
            Err(e) => {
                debug!(path = %path.display(), error = %e, "event log persistence disabled");
            }
        }
        log
    }

    /// The id shared by all events from this log.
    pub fn run_id(&self) -> Uuid {
        self.run_id
    }

    /// Subscribe to events emitted after this call.
    pub fn subscribe(&self) -> broadcast::Receiver<RunnerEvent> {
        self.tx.subscribe()
    }

    /// Emit an event to all subscribers and the persistent log, if any.
    ///
    /// Never fails: an event with no subscribers is dropped, and persistence
    /// errors are ignored (the event stream is observability, not control
    /// flow).
    pub fn emit(&self, kind: RunnerEventKind) {
        let event = RunnerEvent {
            at: Utc::now(),
            run_id: self.run_id,
            kind,
        };

        if let Some(writer) = &self.writer {
            if let Ok(mut writer) = writer.lock() {
                if let Ok(json) = serde_json::to_string(&event) {
                    let _ = writeln!(writer, "{json}");
                    let _ = writer.flush();
                }
            }
        }

        let _ = self.tx.send(event);
    }
}

impl Default for EventLog {
    fn default() -> Self {
        Self::new()
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn subscribers_receive_emitted_events() {
        let events = EventLog::new();
        let mut rx = events.subscribe();

        events.emit(RunnerEventKind::Started { port: 14550 });
        events.emit(RunnerEventKind::Ready);

        assert_eq!(
            rx.try_recv().unwrap().kind,
            RunnerEventKind::Started { port: 14550 }
        );
        assert_eq!(rx.try_recv().unwrap().kind, RunnerEventKind::Ready);
        assert!(rx.try_recv().is_err());
    }

    #[test]
    fn emit_without_subscribers_does_not_panic() {
        let events = EventLog::new();
        events.emit(RunnerEventKind::Stopped { forced: false });
    }

    #[test]
    fn clones_share_the_channel() {
        let events = EventLog::new();
        let mut rx = events.subscribe();

        let clone = events.clone();
        clone.emit(RunnerEventKind::Stopping);

        let event = rx.try_recv().unwrap();
        assert_eq!(event.kind, RunnerEventKind::Stopping);
        assert_eq!(event.run_id, events.run_id());
    }

    #[test]
    fn events_serialize_as_json() {
        let event = RunnerEvent {
            at: Utc::now(),
            run_id: Uuid::new_v4(),
            kind: RunnerEventKind::GraceExpired,
        };
        let json = serde_json::to_string(&event).unwrap();
        let parsed: RunnerEvent = serde_json::from_str(&json).unwrap();
        assert_eq!(parsed.kind, RunnerEventKind::GraceExpired);
        assert_eq!(parsed.run_id, event.run_id);
    }

    #[test]
    fn subscription_starts_at_the_subscribe_point() {
        let events = EventLog::new();
        events.emit(RunnerEventKind::Started { port: 1 });

        // Events emitted before subscribing are not replayed.
        let mut rx = events.subscribe();
        assert!(rx.try_recv().is_err());

        events.emit(RunnerEventKind::Ready);
        assert_eq!(rx.try_recv().unwrap().kind, RunnerEventKind::Ready);
    }
}

//! Progress reporting seam between the engine and the broker status channel.

use std::sync::Mutex;

/// Sink for step-level progress events. The worker's implementation forwards
/// them to the control plane as `Progress` messages.
pub trait ProgressSink: Send + Sync {
    fn report(&self, progress: u8, step: &str, message: Option<&str>);
}

/// Sink that drops everything (simple handlers, tests).
#[derive(Debug, Default)]
pub struct NullProgress;

impl ProgressSink for NullProgress {
    fn report(&self, _progress: u8, _step: &str, _message: Option<&str>) {}
}

/// Sink that records events in memory, for tests.
#[derive(Debug, Default)]
pub struct RecordingProgress {
    events: Mutex<Vec<(u8, String)>>,
}

impl RecordingProgress {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn events(&self) -> Vec<(u8, String)> {
        self.events.lock().map(|e| e.clone()).unwrap_or_default()
    }
}

impl ProgressSink for RecordingProgress {
    fn report(&self, progress: u8, step: &str, _message: Option<&str>) {
        if let Ok(mut events) = self.events.lock() {
            events.push((progress, step.to_string()));
        }
    }
}

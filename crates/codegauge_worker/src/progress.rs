//! Broker-backed progress sink.
//!
//! Handlers run in spawned tasks while the worker's event loop owns the
//! socket, so progress events travel over an in-process channel and the
//! loop serializes them onto the wire.

use codegauge_pipeline::ProgressSink;
use codegauge_protocol::{JobId, Message, OpCode, ProgressPayload, TaskId, TaskState};
use tokio::sync::mpsc::UnboundedSender;
use tracing::warn;

/// Progress sink that emits `Progress` messages for one task.
pub struct BrokerProgressSink {
    job_id: JobId,
    task_id: TaskId,
    outgoing: UnboundedSender<Message>,
}

impl BrokerProgressSink {
    pub fn new(job_id: JobId, task_id: TaskId, outgoing: UnboundedSender<Message>) -> Self {
        Self {
            job_id,
            task_id,
            outgoing,
        }
    }
}

impl ProgressSink for BrokerProgressSink {
    fn report(&self, progress: u8, step: &str, message: Option<&str>) {
        let payload = ProgressPayload {
            task_id: self.task_id.clone(),
            state: TaskState::Started,
            progress: progress.min(100),
            step: step.to_string(),
            message: message.map(str::to_string),
        };
        match Message::with_json(OpCode::Progress, self.job_id, &payload) {
            Ok(msg) => {
                if self.outgoing.send(msg).is_err() {
                    warn!("Progress channel closed, dropping event for {}", self.task_id);
                }
            }
            Err(e) => warn!("Failed to encode progress event: {}", e),
        }
    }
}

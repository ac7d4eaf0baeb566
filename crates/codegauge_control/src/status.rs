//! Task status channel.
//!
//! Folds broker events (dispatch, progress, receipts) into an in-memory map
//! keyed by task id. The map augments the task endpoint's responses; the
//! job row in the store stays authoritative for job status and is never
//! overwritten from here.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use codegauge_protocol::{JobReceipt, ProgressPayload, TaskId, TaskState};

use crate::api::TaskStatusView;

#[derive(Debug, Clone)]
pub struct TaskRecord {
    pub state: TaskState,
    pub progress: u8,
    pub step: String,
    pub message: Option<String>,
    pub result: Option<serde_json::Value>,
    pub error: Option<String>,
}

impl Default for TaskRecord {
    fn default() -> Self {
        Self {
            state: TaskState::Pending,
            progress: 0,
            step: String::new(),
            message: None,
            result: None,
            error: None,
        }
    }
}

/// Shared, in-memory task status store.
#[derive(Clone, Default)]
pub struct TaskStatusStore {
    inner: Arc<Mutex<HashMap<String, TaskRecord>>>,
}

impl TaskStatusStore {
    pub fn new() -> Self {
        Self::default()
    }

    fn update(&self, task_id: &TaskId, f: impl FnOnce(&mut TaskRecord)) {
        if let Ok(mut map) = self.inner.lock() {
            let record = map.entry(task_id.as_str().to_string()).or_default();
            f(record);
        }
    }

    /// A submission was accepted and queued.
    pub fn on_published(&self, task_id: &TaskId) {
        self.update(task_id, |r| r.state = TaskState::Pending);
    }

    /// The dispatcher handed the task to a worker.
    pub fn on_dispatched(&self, task_id: &TaskId) {
        self.update(task_id, |r| {
            if !r.state.is_terminal() {
                r.state = TaskState::Received;
            }
        });
    }

    /// A worker progress event arrived.
    pub fn on_progress(&self, payload: &ProgressPayload) {
        self.update(&payload.task_id, |r| {
            if r.state.is_terminal() {
                return;
            }
            r.state = TaskState::Started;
            r.progress = payload.progress.min(100);
            r.step = payload.step.clone();
            r.message = payload.message.clone();
        });
    }

    /// A terminal receipt arrived.
    pub fn on_receipt(&self, receipt: &JobReceipt) {
        self.update(&receipt.task_id, |r| {
            r.state = receipt.status;
            if receipt.status == TaskState::Success {
                r.progress = 100;
            }
            r.result = receipt.result.clone();
            r.error = receipt.error_message.clone();
        });
    }

    /// A revoke was issued; the terminal state still comes from the worker.
    pub fn on_revoke_requested(&self, task_id: &TaskId) {
        self.update(task_id, |r| {
            if !r.state.is_terminal() {
                r.message = Some("revoke requested".to_string());
            }
        });
    }

    pub fn get(&self, task_id: &TaskId) -> Option<TaskRecord> {
        self.inner
            .lock()
            .ok()
            .and_then(|map| map.get(task_id.as_str()).cloned())
    }

    /// Render the wire view for the task endpoint.
    pub fn view(&self, task_id: &TaskId) -> TaskStatusView {
        let record = self.get(task_id).unwrap_or_default();
        TaskStatusView {
            task_id: task_id.clone(),
            status: record.state,
            progress: record.progress,
            status_message: record.message.or_else(|| {
                (!record.step.is_empty()).then(|| record.step.clone())
            }),
            result: record.result,
            error: record.error,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_lifecycle_folding() {
        let store = TaskStatusStore::new();
        let task = TaskId::from("t-1");

        store.on_published(&task);
        assert_eq!(store.get(&task).unwrap().state, TaskState::Pending);

        store.on_dispatched(&task);
        assert_eq!(store.get(&task).unwrap().state, TaskState::Received);

        store.on_progress(&ProgressPayload {
            task_id: task.clone(),
            state: TaskState::Started,
            progress: 50,
            step: "Training model".into(),
            message: None,
        });
        let record = store.get(&task).unwrap();
        assert_eq!(record.state, TaskState::Started);
        assert_eq!(record.progress, 50);

        store.on_receipt(&JobReceipt::success(task.clone(), None));
        let record = store.get(&task).unwrap();
        assert_eq!(record.state, TaskState::Success);
        assert_eq!(record.progress, 100);
    }

    #[test]
    fn test_terminal_state_is_sticky() {
        let store = TaskStatusStore::new();
        let task = TaskId::from("t-2");

        store.on_receipt(&JobReceipt::failure(task.clone(), "boom"));
        // late progress event must not resurrect the task
        store.on_progress(&ProgressPayload {
            task_id: task.clone(),
            state: TaskState::Started,
            progress: 10,
            step: "late".into(),
            message: None,
        });
        assert_eq!(store.get(&task).unwrap().state, TaskState::Failure);
    }

    #[test]
    fn test_unknown_task_view() {
        let store = TaskStatusStore::new();
        let view = store.view(&TaskId::from("missing"));
        assert_eq!(view.status, TaskState::Pending);
        assert_eq!(view.progress, 0);
    }
}

//! Broker handle: the submission side of the dispatcher.
//!
//! Publishing a job means assigning it a task id and waking the dispatcher;
//! the pending row itself is the queue entry, so the store and the broker
//! can never disagree about what is queued. Revokes travel the same channel.

use codegauge_protocol::TaskId;
use thiserror::Error;
use tokio::sync::mpsc::UnboundedSender;

#[derive(Debug, Error)]
pub enum BrokerError {
    #[error("dispatcher is not running")]
    Closed,
}

/// Messages from the API side to the dispatcher loop.
#[derive(Debug)]
pub enum DispatcherSignal {
    /// A new pending job exists; dispatch if a worker is free.
    Wake,
    /// Revoke the task, cancelling its handler if in flight.
    Revoke {
        task_id: TaskId,
        terminate: bool,
        signal: Option<String>,
    },
}

#[derive(Clone)]
pub struct BrokerHandle {
    tx: UnboundedSender<DispatcherSignal>,
}

impl BrokerHandle {
    pub fn new(tx: UnboundedSender<DispatcherSignal>) -> Self {
        Self { tx }
    }

    /// Publish a queued job. Returns the broker task id for the job row.
    pub fn publish(&self, _job_id: i64) -> Result<TaskId, BrokerError> {
        self.tx
            .send(DispatcherSignal::Wake)
            .map_err(|_| BrokerError::Closed)?;
        Ok(TaskId::generate())
    }

    /// Issue a revoke for a task id. Idempotent.
    pub fn revoke(
        &self,
        task_id: TaskId,
        terminate: bool,
        signal: Option<String>,
    ) -> Result<(), BrokerError> {
        self.tx
            .send(DispatcherSignal::Revoke {
                task_id,
                terminate,
                signal,
            })
            .map_err(|_| BrokerError::Closed)
    }
}

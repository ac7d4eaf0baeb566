//! Control plane: worker pool, dispatch loop and control API server.
//!
//! Owns two sockets: a ROUTER the workers connect to and a REP socket the
//! (out-of-scope) HTTP adapter talks to. The pending job rows in the store
//! are the dispatch queue; the loop hands the oldest matching row to an idle
//! worker with the right capability and tracks the assignment until its
//! receipt arrives.

use std::collections::{HashMap, HashSet};
use std::time::{Duration, Instant};

use anyhow::{Context, Result};
use tokio::sync::mpsc::{self, UnboundedReceiver};
use tracing::{debug, error, info, warn};
use zeromq::{RepSocket, RouterSocket, Socket, SocketRecv, SocketSend, ZmqMessage};

use codegauge_db::{create_pool, init_schema, DbConfig, DbPool};
use codegauge_protocol::{
    AbortCommand, DispatchCommand, HeartbeatPayload, IdentifyPayload, JobId, JobKind, JobReceipt,
    JobStatus, Message, OpCode, ProgressPayload, TaskId,
};

use crate::api_handler::handle_request;
use crate::broker::{BrokerHandle, DispatcherSignal};
use crate::status::TaskStatusStore;
use crate::submit::SubmissionService;

/// Workers are considered stale after this long without any message.
const WORKER_TIMEOUT: Duration = Duration::from_secs(60);

/// How often stale-worker reaping runs.
const CLEANUP_INTERVAL: Duration = Duration::from_secs(10);

/// Socket poll timeout per loop iteration.
const POLL_TIMEOUT: Duration = Duration::from_millis(50);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum WorkerStatus {
    Idle,
    Busy,
}

/// Connected worker state (in memory only). The ZMQ identity is the map key.
struct ConnectedWorker {
    worker_id: String,
    capabilities: Vec<JobKind>,
    status: WorkerStatus,
    last_seen: Instant,
    current_task: Option<TaskId>,
}

struct Assignment {
    job_id: i64,
    identity: Vec<u8>,
}

pub struct ControlPlaneConfig {
    /// ROUTER bind address for workers.
    pub bind_addr: String,
    /// REP bind address for the control API.
    pub api_addr: String,
    pub db_url: String,
}

pub struct ControlPlane {
    router: RouterSocket,
    api: RepSocket,
    service: SubmissionService,
    status: TaskStatusStore,
    broker: BrokerHandle,
    signals: UnboundedReceiver<DispatcherSignal>,

    workers: HashMap<Vec<u8>, ConnectedWorker>,
    assignments: HashMap<String, Assignment>,
    /// Tasks revoked before dispatch; claimed rows matching these are moved
    /// straight to `revoked`.
    revoked_tasks: HashSet<String>,
    last_cleanup: Instant,
}

impl ControlPlane {
    pub async fn bind(config: ControlPlaneConfig) -> Result<Self> {
        let pool: DbPool = create_pool(DbConfig::from_url(&config.db_url)?)
            .await
            .context("Failed to connect to database")?;
        init_schema(&pool).await.context("Failed to init schema")?;

        let (signal_tx, signals) = mpsc::unbounded_channel();
        let broker = BrokerHandle::new(signal_tx);
        let status = TaskStatusStore::new();
        let service = SubmissionService::new(pool, broker.clone(), status.clone());

        let mut router = RouterSocket::new();
        router
            .bind(&config.bind_addr)
            .await
            .with_context(|| format!("Failed to bind ROUTER to {}", config.bind_addr))?;
        info!("Broker ROUTER bound to {}", config.bind_addr);

        let mut api = RepSocket::new();
        api.bind(&config.api_addr)
            .await
            .with_context(|| format!("Failed to bind control API to {}", config.api_addr))?;
        info!("Control API bound to {}", config.api_addr);

        Ok(Self {
            router,
            api,
            service,
            status,
            broker,
            signals,
            workers: HashMap::new(),
            assignments: HashMap::new(),
            revoked_tasks: HashSet::new(),
            last_cleanup: Instant::now(),
        })
    }

    /// Main loop: drain signals, poll both sockets, reap stale workers,
    /// dispatch queued jobs.
    pub async fn run(&mut self) -> Result<()> {
        info!("Control plane entering main loop");
        loop {
            while let Ok(signal) = self.signals.try_recv() {
                if let DispatcherSignal::Revoke {
                    task_id,
                    terminate,
                    signal,
                } = signal
                {
                    self.handle_revoke(task_id, terminate, signal).await;
                }
            }

            if let Ok(result) = tokio::time::timeout(POLL_TIMEOUT, self.router.recv()).await {
                match result {
                    Ok(multipart) => self.handle_worker_message(multipart).await,
                    Err(e) => error!("Router recv error: {}", e),
                }
            }

            if let Ok(result) = tokio::time::timeout(POLL_TIMEOUT, self.api.recv()).await {
                match result {
                    Ok(request) => self.handle_api_request(request).await,
                    Err(e) => error!("API recv error: {}", e),
                }
            }

            if self.last_cleanup.elapsed() >= CLEANUP_INTERVAL {
                self.reap_stale_workers().await;
                self.last_cleanup = Instant::now();
            }

            self.dispatch_queued_jobs().await;
        }
    }

    // ------------------------------------------------------------------
    // Worker messages
    // ------------------------------------------------------------------

    async fn handle_worker_message(&mut self, multipart: ZmqMessage) {
        let frames: Vec<Vec<u8>> = multipart.into_vec().into_iter().map(|b| b.to_vec()).collect();
        if frames.len() < 3 {
            warn!("Expected 3 frames [identity, header, payload], got {}", frames.len());
            return;
        }
        let identity = frames[0].clone();
        let msg = match Message::unpack(&frames[1..]) {
            Ok(msg) => msg,
            Err(e) => {
                warn!("Failed to unpack worker message: {}", e);
                return;
            }
        };

        if let Some(worker) = self.workers.get_mut(&identity) {
            worker.last_seen = Instant::now();
        }

        match msg.header.opcode {
            OpCode::Identify => match msg.parse_payload::<IdentifyPayload>() {
                Ok(payload) => {
                    info!(
                        "Worker '{}' identified with capabilities {:?}",
                        payload.worker_id, payload.capabilities
                    );
                    self.workers.insert(
                        identity,
                        ConnectedWorker {
                            worker_id: payload.worker_id,
                            capabilities: payload.capabilities,
                            status: WorkerStatus::Idle,
                            last_seen: Instant::now(),
                            current_task: None,
                        },
                    );
                }
                Err(e) => warn!("Invalid identify payload: {}", e),
            },
            OpCode::Heartbeat => {
                if let Ok(payload) = msg.parse_payload::<HeartbeatPayload>() {
                    debug!(
                        "Heartbeat from '{}' (task {:?})",
                        payload.worker_id, payload.current_task_id
                    );
                }
            }
            OpCode::Progress => match msg.parse_payload::<ProgressPayload>() {
                Ok(payload) => self.status.on_progress(&payload),
                Err(e) => warn!("Invalid progress payload: {}", e),
            },
            OpCode::Conclude => match msg.parse_payload::<JobReceipt>() {
                Ok(receipt) => self.handle_receipt(&identity, receipt),
                Err(e) => warn!("Invalid receipt payload: {}", e),
            },
            OpCode::Err => {
                if let Ok(err) = msg.parse_payload::<codegauge_protocol::ErrorPayload>() {
                    error!("Worker error: {}", err.message);
                }
            }
            other => warn!("Unhandled opcode from worker: {:?}", other),
        }
    }

    fn handle_receipt(&mut self, identity: &[u8], receipt: JobReceipt) {
        info!(
            "Receipt for task {}: {}",
            receipt.task_id, receipt.status
        );
        self.status.on_receipt(&receipt);
        self.assignments.remove(receipt.task_id.as_str());
        self.revoked_tasks.remove(receipt.task_id.as_str());

        if let Some(worker) = self.workers.get_mut(identity) {
            if worker.current_task.as_ref() == Some(&receipt.task_id) {
                worker.status = WorkerStatus::Idle;
                worker.current_task = None;
            }
        }
    }

    // ------------------------------------------------------------------
    // Dispatch
    // ------------------------------------------------------------------

    async fn dispatch_queued_jobs(&mut self) {
        // Collect idle worker identities first; dispatching mutates the map.
        let idle: Vec<Vec<u8>> = self
            .workers
            .iter()
            .filter(|(_, w)| w.status == WorkerStatus::Idle)
            .map(|(identity, _)| identity.clone())
            .collect();

        for identity in idle {
            let Some(worker) = self.workers.get(&identity) else {
                continue;
            };
            let capabilities = worker.capabilities.clone();

            let claimed = match self.service.jobs.claim_next_for_dispatch(&capabilities).await {
                Ok(claimed) => claimed,
                Err(e) => {
                    error!("Dispatch claim failed: {}", e);
                    return;
                }
            };
            let Some(job) = claimed else {
                continue;
            };

            let task_id = match &job.broker_task_id {
                Some(id) => TaskId::from(id.as_str()),
                None => {
                    // Worker-enqueued jobs may not have a task id yet.
                    let task_id = TaskId::generate();
                    if let Err(e) = self.service.jobs.set_task_id(job.id, &task_id).await {
                        error!("Failed to record task id for job {}: {}", job.id, e);
                        let _ = self.service.jobs.requeue_dispatch(job.id).await;
                        continue;
                    }
                    task_id
                }
            };

            // Revoked before it ever ran: terminal transition without a
            // handler, since no handler will ever observe the token.
            if self.revoked_tasks.remove(task_id.as_str()) {
                match self
                    .service
                    .jobs
                    .try_transition(job.id, JobStatus::Pending, JobStatus::Revoked, Some("Revoked before dispatch"))
                    .await
                {
                    Ok(true) => {
                        self.status.on_receipt(&JobReceipt::revoked(task_id.clone()));
                        info!("Job {} revoked before dispatch", job.id);
                    }
                    Ok(false) => warn!("Job {} changed state before revoke", job.id),
                    Err(e) => error!("Failed to revoke queued job {}: {}", job.id, e),
                }
                continue;
            }

            let Some(kind) = job.kind() else {
                error!("Job {} has unknown kind '{}', failing it", job.id, job.kind);
                let _ = self
                    .service
                    .jobs
                    .try_transition(
                        job.id,
                        JobStatus::Pending,
                        JobStatus::Failed,
                        Some("Unknown job kind"),
                    )
                    .await;
                continue;
            };

            let command = DispatchCommand {
                job_id: JobId::new(job.id as u64),
                kind,
                task_id: task_id.clone(),
            };
            match self.send_to_worker(&identity, OpCode::Dispatch, command.job_id, &command).await {
                Ok(()) => {
                    info!(
                        "Dispatched job {} ({}) as task {} to worker '{}'",
                        job.id,
                        kind,
                        task_id,
                        self.workers
                            .get(&identity)
                            .map(|w| w.worker_id.as_str())
                            .unwrap_or("?")
                    );
                    self.status.on_dispatched(&task_id);
                    self.assignments.insert(
                        task_id.as_str().to_string(),
                        Assignment {
                            job_id: job.id,
                            identity: identity.clone(),
                        },
                    );
                    if let Some(worker) = self.workers.get_mut(&identity) {
                        worker.status = WorkerStatus::Busy;
                        worker.current_task = Some(task_id);
                    }
                }
                Err(e) => {
                    error!("Dispatch send to worker failed: {}", e);
                    let _ = self.service.jobs.requeue_dispatch(job.id).await;
                    self.workers.remove(&identity);
                }
            }
        }
    }

    // ------------------------------------------------------------------
    // Revoke
    // ------------------------------------------------------------------

    async fn handle_revoke(&mut self, task_id: TaskId, terminate: bool, signal: Option<String>) {
        self.status.on_revoke_requested(&task_id);

        if let Some(assignment) = self.assignments.get(task_id.as_str()) {
            let identity = assignment.identity.clone();
            let job_id = JobId::new(assignment.job_id as u64);
            let command = AbortCommand {
                task_id: task_id.clone(),
                terminate,
                signal,
            };
            match self.send_to_worker(&identity, OpCode::Abort, job_id, &command).await {
                Ok(()) => info!("Abort sent for task {}", task_id),
                Err(e) => error!("Failed to send abort for task {}: {}", task_id, e),
            }
        } else {
            // Not in flight: remember it so a queued row is revoked instead
            // of dispatched. Idempotent for already-terminal tasks.
            debug!("Revoke for unassigned task {}, queued", task_id);
            self.revoked_tasks.insert(task_id.as_str().to_string());
        }
    }

    // ------------------------------------------------------------------
    // Worker reaping
    // ------------------------------------------------------------------

    async fn reap_stale_workers(&mut self) {
        let stale: Vec<Vec<u8>> = self
            .workers
            .iter()
            .filter(|(_, w)| w.last_seen.elapsed() > WORKER_TIMEOUT)
            .map(|(identity, _)| identity.clone())
            .collect();

        for identity in stale {
            let Some(worker) = self.workers.remove(&identity) else {
                continue;
            };
            warn!("Worker '{}' timed out, removing", worker.worker_id);

            if let Some(task_id) = worker.current_task {
                if let Some(assignment) = self.assignments.remove(task_id.as_str()) {
                    // Still-pending rows go back to the queue; a row the
                    // handler already moved to running is left for operator
                    // intervention (no built-in retry).
                    match self.service.jobs.get(assignment.job_id).await {
                        Ok(Some(job)) if job.status() == JobStatus::Pending => {
                            if let Err(e) =
                                self.service.jobs.requeue_dispatch(assignment.job_id).await
                            {
                                error!("Requeue of job {} failed: {}", assignment.job_id, e);
                            }
                        }
                        Ok(_) => warn!(
                            "Job {} was in flight on lost worker '{}'",
                            assignment.job_id, worker.worker_id
                        ),
                        Err(e) => error!("Lookup of job {} failed: {}", assignment.job_id, e),
                    }
                }
            }
        }
    }

    // ------------------------------------------------------------------
    // Control API
    // ------------------------------------------------------------------

    async fn handle_api_request(&mut self, request: ZmqMessage) {
        let raw: Vec<u8> = request
            .into_vec()
            .into_iter()
            .flat_map(|b| b.to_vec())
            .collect();

        let response = match serde_json::from_slice(&raw) {
            Ok(request) => {
                handle_request(&self.service, &self.status, &self.broker, request).await
            }
            Err(e) => crate::api::ControlResponse::error(
                crate::api::ErrorCode::Validation,
                format!("invalid request: {}", e),
            ),
        };

        let encoded = match serde_json::to_vec(&response) {
            Ok(bytes) => bytes,
            Err(e) => {
                error!("Failed to encode API response: {}", e);
                b"{\"type\":\"Error\",\"payload\":{\"code\":\"internal\",\"message\":\"encoding failure\"}}"
                    .to_vec()
            }
        };
        if let Err(e) = self.api.send(ZmqMessage::from(encoded)).await {
            error!("Failed to send API response: {}", e);
        }
    }

    async fn send_to_worker<T: serde::Serialize>(
        &mut self,
        identity: &[u8],
        opcode: OpCode,
        job_id: JobId,
        payload: &T,
    ) -> Result<()> {
        let msg = Message::with_json(opcode, job_id, payload)?;
        let (header, body) = msg.pack()?;

        let mut multipart = ZmqMessage::from(identity.to_vec());
        multipart.push_back(header.into());
        multipart.push_back(body.into());
        self.router.send(multipart).await?;
        Ok(())
    }
}

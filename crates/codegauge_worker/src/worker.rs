//! Worker node.
//!
//! Owns the DEALER socket to the control plane. Incoming dispatches spawn
//! handler tasks; outgoing progress/receipt messages funnel through an
//! in-process channel so the event loop is the only socket writer. Abort
//! commands cancel the matching task's token.

use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use anyhow::{Context as AnyhowContext, Result};
use tokio::sync::mpsc::{self, UnboundedReceiver, UnboundedSender};
use tracing::{error, info, warn};
use zeromq::{DealerSocket, Socket, SocketRecv, SocketSend, ZmqMessage};

use codegauge_db::{create_pool, init_schema, DbConfig};
use codegauge_pipeline::{CancellationToken, Dependencies};
use codegauge_protocol::{
    AbortCommand, DispatchCommand, HeartbeatPayload, IdentifyPayload, JobId, JobKind, Message,
    OpCode, TaskId,
};
use codegauge_store::LocalArtifactStore;

use crate::handlers::run_dispatched_job;
use crate::progress::BrokerProgressSink;
use crate::registry_sync::sync_all;

const RECV_TIMEOUT: Duration = Duration::from_millis(100);
const HEARTBEAT_INTERVAL: Duration = Duration::from_secs(15);

/// Worker configuration (plain data).
pub struct WorkerConfig {
    pub control_addr: String,
    pub db_url: String,
    pub artifact_root: PathBuf,
    pub artifact_scheme: String,
    pub artifact_bucket: String,
    pub worker_id: String,
    pub capabilities: Vec<JobKind>,
}

/// Active worker with connected socket.
pub struct Worker {
    config: WorkerConfig,
    socket: DealerSocket,
    deps: Dependencies,
    /// Cancellation tokens of in-flight tasks, keyed by task id.
    running_tasks: Arc<Mutex<HashMap<String, CancellationToken>>>,
    outgoing_tx: UnboundedSender<Message>,
    outgoing_rx: UnboundedReceiver<Message>,
}

impl Worker {
    /// Connect to the control plane, sync capability registries and send
    /// the identify handshake.
    pub async fn connect(config: WorkerConfig) -> Result<Self> {
        let pool = create_pool(DbConfig::from_url(&config.db_url)?)
            .await
            .context("Failed to connect to database")?;
        init_schema(&pool).await.context("Failed to init schema")?;

        let store = Arc::new(LocalArtifactStore::new(&config.artifact_root));
        let deps = Dependencies::new(
            pool,
            store,
            config.artifact_scheme.clone(),
            config.artifact_bucket.clone(),
        );

        // Capability registry sync: upsert what we implement, down-flag
        // what we no longer do.
        sync_all(&deps.registries, &config.worker_id).await;

        let mut socket = DealerSocket::new();
        socket
            .connect(&config.control_addr)
            .await
            .with_context(|| format!("Failed to connect to {}", config.control_addr))?;
        info!("Connected to control plane: {}", config.control_addr);

        let identify = IdentifyPayload {
            worker_id: config.worker_id.clone(),
            capabilities: config.capabilities.clone(),
        };
        let msg = Message::with_json(OpCode::Identify, JobId::new(0), &identify)?;
        send_message(&mut socket, msg).await?;
        info!(
            "Sent IDENTIFY as {} with capabilities {:?}",
            config.worker_id, config.capabilities
        );

        let (outgoing_tx, outgoing_rx) = mpsc::unbounded_channel();
        Ok(Self {
            config,
            socket,
            deps,
            running_tasks: Arc::new(Mutex::new(HashMap::new())),
            outgoing_tx,
            outgoing_rx,
        })
    }

    /// Main event loop: poll the socket with a short timeout, flush queued
    /// outgoing messages between polls, heartbeat on a fixed cadence.
    pub async fn run(&mut self) -> Result<()> {
        info!("Entering event loop...");
        let mut last_heartbeat = tokio::time::Instant::now();

        loop {
            while let Ok(msg) = self.outgoing_rx.try_recv() {
                if let Err(e) = send_message(&mut self.socket, msg).await {
                    error!("Send error: {}", e);
                }
            }

            if last_heartbeat.elapsed() >= HEARTBEAT_INTERVAL {
                self.send_heartbeat();
                last_heartbeat = tokio::time::Instant::now();
            }

            match tokio::time::timeout(RECV_TIMEOUT, self.socket.recv()).await {
                Ok(Ok(multipart)) => {
                    if let Some(msg) = decode_multipart(multipart) {
                        self.handle_message(msg);
                    }
                }
                Ok(Err(e)) => {
                    error!("Recv error: {}", e);
                    return Err(anyhow::anyhow!("broker connection lost: {}", e));
                }
                Err(_) => {} // timeout, no message
            }
        }
    }

    fn handle_message(&self, msg: Message) {
        match msg.header.opcode {
            OpCode::Dispatch => match msg.parse_payload::<DispatchCommand>() {
                Ok(cmd) => self.spawn_job(cmd),
                Err(e) => warn!("Invalid dispatch payload: {}", e),
            },
            OpCode::Abort => match msg.parse_payload::<AbortCommand>() {
                Ok(cmd) => self.abort_task(&cmd),
                Err(e) => warn!("Invalid abort payload: {}", e),
            },
            OpCode::Err => {
                if let Ok(err) = msg.parse_payload::<codegauge_protocol::ErrorPayload>() {
                    error!("Received ERR from control plane: {}", err.message);
                }
            }
            other => warn!("Unhandled opcode: {:?}", other),
        }
    }

    fn spawn_job(&self, cmd: DispatchCommand) {
        info!("DISPATCH job {} ({})", cmd.job_id, cmd.kind);

        let cancel = CancellationToken::new();
        {
            let mut running = match self.running_tasks.lock() {
                Ok(guard) => guard,
                Err(poisoned) => poisoned.into_inner(),
            };
            running.insert(cmd.task_id.as_str().to_string(), cancel.clone());
        }

        let deps = self.deps.clone();
        let outgoing = self.outgoing_tx.clone();
        let running_tasks = Arc::clone(&self.running_tasks);

        tokio::spawn(async move {
            let progress = Arc::new(BrokerProgressSink::new(
                cmd.job_id,
                cmd.task_id.clone(),
                outgoing.clone(),
            ));

            let receipt = run_dispatched_job(&cmd, &deps, progress, cancel).await;

            if let Ok(mut running) = running_tasks.lock() {
                running.remove(cmd.task_id.as_str());
            }

            match Message::with_json(OpCode::Conclude, cmd.job_id, &receipt) {
                Ok(msg) => {
                    if outgoing.send(msg).is_err() {
                        error!("Outgoing channel closed, receipt for {} lost", cmd.task_id);
                    }
                }
                Err(e) => error!("Failed to encode receipt: {}", e),
            }
        });
    }

    fn abort_task(&self, cmd: &AbortCommand) {
        let running = match self.running_tasks.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        };
        match running.get(cmd.task_id.as_str()) {
            Some(token) => {
                warn!(
                    "ABORT task {} (terminate={}, signal={:?})",
                    cmd.task_id, cmd.terminate, cmd.signal
                );
                token.cancel();
            }
            None => {
                // Idempotent: task already finished or never reached us.
                info!("ABORT for unknown task {}, ignoring", cmd.task_id);
            }
        }
    }

    fn send_heartbeat(&self) {
        let current_task_id = self
            .running_tasks
            .lock()
            .ok()
            .and_then(|running| running.keys().next().cloned())
            .map(TaskId::from);
        let payload = HeartbeatPayload {
            worker_id: self.config.worker_id.clone(),
            current_task_id,
        };
        if let Ok(msg) = Message::with_json(OpCode::Heartbeat, JobId::new(0), &payload) {
            let _ = self.outgoing_tx.send(msg);
        }
    }
}

/// Decode a two-frame multipart into a protocol message.
fn decode_multipart(multipart: ZmqMessage) -> Option<Message> {
    let parts: Vec<Vec<u8>> = multipart.into_vec().into_iter().map(|b| b.to_vec()).collect();
    if parts.len() < 2 {
        warn!("Expected 2 frames [header, payload], got {}", parts.len());
        return None;
    }
    match Message::unpack(&parts[parts.len() - 2..]) {
        Ok(msg) => Some(msg),
        Err(e) => {
            warn!("Failed to unpack message: {}", e);
            None
        }
    }
}

/// Send a protocol message as multipart (header + body).
async fn send_message(socket: &mut DealerSocket, msg: Message) -> Result<()> {
    let (header, body) = msg.pack()?;
    let mut multipart = ZmqMessage::from(header);
    multipart.push_back(body.into());
    socket.send(multipart).await?;
    Ok(())
}

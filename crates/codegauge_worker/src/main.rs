use anyhow::Result;
use clap::Parser;
use codegauge_logging::{codegauge_home, init_logging, LogConfig};
use codegauge_protocol::JobKind;
use codegauge_worker::{Worker, WorkerConfig};
use std::path::PathBuf;

/// codegauge worker: executes analytics jobs dispatched by the control plane.
#[derive(Parser, Debug)]
#[command(name = "codegauge-worker", version, about)]
struct Args {
    /// Control plane broker address
    #[arg(long, default_value = "tcp://127.0.0.1:5555", env = "CODEGAUGE_CONTROL_ADDR")]
    control: String,

    /// Database URL (sqlite:... or postgres:...)
    #[arg(long, env = "CODEGAUGE_DB_URL")]
    db: Option<String>,

    /// Artifact storage root directory
    #[arg(long, env = "CODEGAUGE_ARTIFACT_ROOT")]
    artifact_root: Option<PathBuf>,

    /// Worker identifier used for registry ownership
    #[arg(long, env = "CODEGAUGE_WORKER_ID")]
    worker_id: Option<String>,

    /// Job kinds this worker handles (defaults to all)
    #[arg(long, value_delimiter = ',')]
    capabilities: Vec<JobKindArg>,

    /// Verbose console logging
    #[arg(short, long)]
    verbose: bool,
}

#[derive(Debug, Clone)]
struct JobKindArg(JobKind);

impl std::str::FromStr for JobKindArg {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        s.parse().map(JobKindArg)
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();
    init_logging(LogConfig {
        app_name: "codegauge-worker",
        verbose: args.verbose,
    })?;

    let home = codegauge_home();
    let db_url = args
        .db
        .unwrap_or_else(|| format!("sqlite:{}?mode=rwc", home.join("codegauge.db").display()));
    let artifact_root = args.artifact_root.unwrap_or_else(|| home.join("artifacts"));
    let worker_id = args.worker_id.unwrap_or_else(|| {
        format!(
            "worker-{}-{}",
            std::env::var("HOSTNAME").unwrap_or_else(|_| "local".to_string()),
            std::process::id()
        )
    });
    let capabilities = if args.capabilities.is_empty() {
        JobKind::ALL.to_vec()
    } else {
        args.capabilities.iter().map(|k| k.0).collect()
    };

    let config = WorkerConfig {
        control_addr: args.control,
        db_url,
        artifact_root,
        artifact_scheme: "file".to_string(),
        artifact_bucket: "analytics".to_string(),
        worker_id,
        capabilities,
    };

    let mut worker = Worker::connect(config).await?;
    worker.run().await
}

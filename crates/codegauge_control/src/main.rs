use anyhow::Result;
use clap::Parser;
use codegauge_control::{ControlPlane, ControlPlaneConfig};
use codegauge_logging::{codegauge_home, init_logging, LogConfig};

/// codegauge control plane: submissions, dispatch, status, revoke.
#[derive(Parser, Debug)]
#[command(name = "codegauge-control", version, about)]
struct Args {
    /// Broker bind address for workers
    #[arg(long, default_value = "tcp://127.0.0.1:5555", env = "CODEGAUGE_BIND_ADDR")]
    bind: String,

    /// Control API bind address
    #[arg(long, default_value = "tcp://127.0.0.1:5556", env = "CODEGAUGE_API_ADDR")]
    api: String,

    /// Database URL (sqlite:... or postgres:...)
    #[arg(long, env = "CODEGAUGE_DB_URL")]
    db: Option<String>,

    /// Verbose console logging
    #[arg(short, long)]
    verbose: bool,
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();
    init_logging(LogConfig {
        app_name: "codegauge-control",
        verbose: args.verbose,
    })?;

    let db_url = args.db.unwrap_or_else(|| {
        format!(
            "sqlite:{}?mode=rwc",
            codegauge_home().join("codegauge.db").display()
        )
    });

    let config = ControlPlaneConfig {
        bind_addr: args.bind,
        api_addr: args.api,
        db_url,
    };

    let mut control_plane = ControlPlane::bind(config).await?;
    control_plane.run().await
}

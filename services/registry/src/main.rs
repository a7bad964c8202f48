//! `registry-server`: one node of a replicated registry.
//!
//! ```text
//! registry-server --config node-1.toml
//! registry-server --node-id 4 --listen 127.0.0.1:8084 --data-dir ./node-4
//! ```

use std::time::Duration;

use camino::Utf8PathBuf;
use clap::Parser;
use consensus::LocalStore;
use consensus::http::HttpTransport;
use eyre::{Context, Result, eyre};
use registry::{GarbageCollector, RegistryBuilder, RegistryConfig};
use tokio::sync::watch;
use tracing_subscriber::EnvFilter;

#[derive(Debug, Parser)]
#[command(name = "registry-server", version, about = "Replicated container registry node")]
struct Cli {
    /// Path to a TOML config file.
    #[arg(short, long)]
    config: Option<Utf8PathBuf>,

    /// Emit logs as JSON lines.
    #[arg(long)]
    log_json: bool,

    /// Override the node id.
    #[arg(long)]
    node_id: Option<u64>,

    /// Override the listen address.
    #[arg(short, long)]
    listen: Option<String>,

    /// Override the data directory.
    #[arg(short, long)]
    data_dir: Option<Utf8PathBuf>,
}

impl Cli {
    fn config(&self) -> Result<RegistryConfig> {
        let mut config = match &self.config {
            Some(path) => RegistryConfig::load(path).wrap_err_with(|| format!("loading {path}"))?,
            None => {
                let (Some(node_id), Some(listen), Some(data_dir)) =
                    (self.node_id, self.listen.clone(), self.data_dir.clone())
                else {
                    return Err(eyre!(
                        "either --config or all of --node-id, --listen and --data-dir are required"
                    ));
                };
                RegistryConfig {
                    node_id,
                    listen,
                    data_dir,
                    peers: Vec::new(),
                    raft: Default::default(),
                    gc: Default::default(),
                }
            }
        };

        if let Some(node_id) = self.node_id {
            config.node_id = node_id;
        }
        if let Some(listen) = &self.listen {
            config.listen = listen.clone();
        }
        if let Some(data_dir) = &self.data_dir {
            config.data_dir = data_dir.clone();
        }
        config.validate()?;
        Ok(config)
    }
}

fn init_tracing(json: bool) {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    let builder = tracing_subscriber::fmt().with_env_filter(filter);
    if json {
        builder.json().init();
    } else {
        builder.init();
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    init_tracing(cli.log_json);
    let config = cli.config()?;

    let store = LocalStore::new(config.data_dir.clone());
    let transport = HttpTransport::new(Duration::from_millis(
        config.raft.tick_ms * u64::from(config.raft.heartbeat_ticks),
    ));
    let registry = RegistryBuilder::from_config(&config)
        .start(store, transport)
        .await
        .wrap_err("starting consensus node")?;
    tracing::info!(
        node = config.node_id,
        listen = %config.listen,
        data_dir = %config.data_dir,
        bootstrap = !config.peers.is_empty(),
        "registry node started"
    );

    let (stop_tx, mut stop_rx) = watch::channel(false);
    let collector = GarbageCollector::new(registry.clone(), config.gc.clone());
    let gc = tokio::spawn(collector.run(async move {
        let _ = stop_rx.wait_for(|stop| *stop).await;
    }));

    let listener = tokio::net::TcpListener::bind(&config.listen)
        .await
        .wrap_err_with(|| format!("binding {}", config.listen))?;
    let shutdown = async move {
        if let Err(err) = tokio::signal::ctrl_c().await {
            tracing::error!(%err, "failed to wait for ctrl-c");
        }
        tracing::info!("shutting down");
        let _ = stop_tx.send(true);
    };
    let served = axum::serve(listener, registry::router(registry.clone()))
        .with_graceful_shutdown(shutdown)
        .await;

    let _ = gc.await;
    registry.shutdown().await;
    served.wrap_err("serving http")
}

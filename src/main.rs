use anyhow::{Context, Result, anyhow};
use clap::Parser;
use metaproxy::coordination::MemoryCoordinator;
use metaproxy::directory::entry::table_path;
use metaproxy::{
    ClusterDirectory, MethodRegistry, ProxyConfig, ProxyServer, UnsupportedForwarder,
    register_meta_methods,
};
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

#[derive(Parser)]
#[command(name = "meta-proxy")]
#[command(about = "Routes meta RPCs to the cluster that owns each table")]
struct Cli {
    /// JSON configuration file; flags below override its values.
    #[arg(long)]
    config: Option<PathBuf>,
    #[arg(long)]
    listen: Option<String>,
    /// ZooKeeper endpoint, repeatable.
    #[arg(long = "zk")]
    zk: Vec<String>,
    #[arg(long)]
    zk_root: Option<String>,
    #[arg(long)]
    zk_timeout_ms: Option<u64>,
    #[arg(long)]
    max_watched_tables: Option<usize>,
    /// Serve from an in-process namespace instead of ZooKeeper.
    #[arg(long)]
    standalone: bool,
    /// Standalone only: JSON object of table -> {"cluster_name", "meta_addrs"}.
    #[arg(long, requires = "standalone")]
    seed: Option<PathBuf>,
}

impl Cli {
    fn load_config(&self) -> Result<ProxyConfig> {
        let mut config = match &self.config {
            Some(path) => ProxyConfig::from_file(path)?,
            None => ProxyConfig::default(),
        };
        if let Some(listen) = &self.listen {
            config = config.listen_addr(listen);
        }
        if !self.zk.is_empty() {
            config = config.zk_addrs(self.zk.iter());
        }
        if let Some(root) = &self.zk_root {
            config = config.zk_root(root);
        }
        if let Some(ms) = self.zk_timeout_ms {
            config.zk_timeout_ms = ms;
        }
        if let Some(max) = self.max_watched_tables {
            config = config.max_watched_tables(max);
        }
        config
            .validate(self.standalone)
            .map_err(|e| anyhow!("invalid configuration: {}", e))?;
        Ok(config)
    }
}

fn seed_namespace(zk: &MemoryCoordinator, root: &str, path: &Path) -> Result<usize> {
    let raw = std::fs::read_to_string(path)
        .with_context(|| format!("failed to read seed file '{}'", path.display()))?;
    let tables: BTreeMap<String, serde_json::Value> = serde_json::from_str(&raw)
        .with_context(|| format!("failed to parse seed file '{}'", path.display()))?;
    for (table, info) in &tables {
        zk.set(&table_path(root, table), info.to_string());
    }
    Ok(tables.len())
}

async fn open_directory(cli: &Cli, config: &ProxyConfig) -> Result<ClusterDirectory> {
    if !cli.standalone {
        return ClusterDirectory::open(config)
            .await
            .context("failed to open cluster directory");
    }

    warn!("running standalone: tables resolve from an in-process namespace");
    let zk = MemoryCoordinator::new();
    if let Some(seed) = &cli.seed {
        let count = seed_namespace(&zk, config.normalized_root(), seed)?;
        info!(tables = count, "seeded in-process namespace");
    }
    Ok(ClusterDirectory::with_coordinator(
        Arc::new(zk),
        config.normalized_root(),
        config.max_watched_tables,
    )?)
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .init();

    let cli = Cli::parse();
    let config = cli.load_config()?;
    info!(?config, "starting meta proxy");

    let directory = open_directory(&cli, &config).await?;

    let mut registry = MethodRegistry::new();
    register_meta_methods(&mut registry, directory.clone(), Arc::new(UnsupportedForwarder));
    info!(methods = ?registry.method_names(), "rpc methods registered");

    let server = ProxyServer::new(&config.listen_addr, Arc::new(registry));
    let shutdown = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            warn!(error = %e, "failed to listen for ctrl-c");
            std::future::pending::<()>().await;
        }
        info!("shutdown requested");
    };
    let served = server.serve_with_shutdown(shutdown).await;

    info!(stats = %directory.stats(), "closing cluster directory");
    directory.close().await;
    served.context("meta proxy server failed")
}

use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{Context, Result};
use clap::Parser;
use cke_core::config::{CkeConfig, DEFAULT_CONFIG_PATH};
use cke_core::is_not_found;
use cke_core::logging::{self, LogFormat};
use cke_infra::{CertIssuer, CkeInfra, Infrastructure, VaultClient};
use cke_sabakan::{Integrator, SabakanMetrics};
use cke_server::{Controller, InfraFactory, Metrics};
use cke_storage::{EtcdKv, Storage};
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

#[global_allocator]
static GLOBAL: mimalloc::MiMalloc = mimalloc::MiMalloc;

#[derive(Parser)]
#[command(name = "cke", about = "Declarative Kubernetes and etcd cluster engine", version)]
struct Cli {
    /// Path to the configuration file.
    #[arg(long, default_value = DEFAULT_CONFIG_PATH)]
    config: PathBuf,

    /// Name published in the leader key; defaults to the host name.
    #[arg(long)]
    hostname: Option<String>,
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    logging::init(LogFormat::Json);

    let config = CkeConfig::load_or_default(&cli.config)?;
    let hostname = match cli.hostname {
        Some(h) => h,
        None => gethostname::gethostname()
            .into_string()
            .map_err(|_| anyhow::anyhow!("host name is not UTF-8"))?,
    };

    let kv = EtcdKv::connect(&config.etcd).await.context("connect to etcd")?;
    let storage = Storage::new(Arc::new(kv), &config.etcd.prefix).with_max_records(config.server.max_records);

    let shutdown = CancellationToken::new();
    {
        let shutdown = shutdown.clone();
        tokio::spawn(async move {
            if let Err(e) = tokio::signal::ctrl_c().await {
                error!(error = %e, "Failed to listen for ctrl-c");
            }
            info!("Shutdown signal received");
            shutdown.cancel();
        });
    }

    let Some(vault) = wait_vault(&storage, &config, &shutdown).await? else {
        return Ok(());
    };
    let certs: Arc<dyn CertIssuer> = Arc::new(vault);

    let http = reqwest::Client::builder()
        .timeout(config.etcd.timeout() * 3)
        .build()
        .context("build http client")?;
    let sabakan = Arc::new(SabakanMetrics::default());
    let metrics = Arc::new(Metrics::new(storage.clone(), sabakan.clone()));

    let factory: InfraFactory = {
        let storage = storage.clone();
        let certs = certs.clone();
        let http = http.clone();
        Arc::new(move |nodes| {
            Arc::new(CkeInfra::new(storage.clone(), certs.clone(), http.clone(), nodes)) as Arc<dyn Infrastructure>
        })
    };
    let controller = Controller::new(
        storage,
        certs,
        factory,
        hostname.clone(),
        config.server.clone(),
        metrics.clone(),
        Integrator::new(http, sabakan),
    );

    let metrics_task = tokio::spawn(cke_server::metrics::serve(
        config.server.metrics_listen,
        metrics,
        shutdown.clone(),
    ));

    info!(host = %hostname, "cke starting");
    let result = controller.run(shutdown.clone()).await;
    shutdown.cancel();
    match metrics_task.await {
        Ok(Err(e)) => warn!(error = %format!("{e:#}"), "metrics server stopped with error"),
        Err(e) => warn!(error = %e, "metrics server task failed"),
        Ok(Ok(())) => {}
    }
    info!("cke stopped");
    result
}

/// Block until the Vault connection settings exist, or `None` on shutdown.
async fn wait_vault(storage: &Storage, config: &CkeConfig, shutdown: &CancellationToken) -> Result<Option<VaultClient>> {
    loop {
        match storage.get_vault_config().await {
            Ok(cfg) => return VaultClient::from_config(&cfg).map(Some),
            Err(e) if is_not_found(&e) => {
                warn!("vault is not configured yet; run `ckecli vault config`");
            }
            Err(e) => return Err(e.context("load vault config")),
        }
        tokio::select! {
            _ = shutdown.cancelled() => return Ok(None),
            _ = tokio::time::sleep(config.server.interval()) => {}
        }
    }
}

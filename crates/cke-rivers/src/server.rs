use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result, bail};
use tokio::net::TcpListener;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use crate::health::health_check_loop;
use crate::proxy::proxy_connection;
use crate::upstream::Upstreams;

#[derive(Debug, Clone)]
pub struct RiversConfig {
    pub listen: String,
    pub upstreams: Vec<String>,
    pub check_interval: Duration,
    pub check_timeout: Duration,
}

impl RiversConfig {
    pub fn new(listen: impl Into<String>, upstreams: Vec<String>) -> Self {
        Self {
            listen: listen.into(),
            upstreams,
            check_interval: Duration::from_secs(5),
            check_timeout: Duration::from_secs(5),
        }
    }
}

/// Bind `config.listen` and serve until `shutdown` fires.
pub async fn serve(config: RiversConfig, shutdown: CancellationToken) -> Result<()> {
    let listener = TcpListener::bind(&config.listen)
        .await
        .with_context(|| format!("bind {}", config.listen))?;
    run(listener, config, shutdown).await
}

/// Accept loop over an already bound listener.
pub async fn run(listener: TcpListener, config: RiversConfig, shutdown: CancellationToken) -> Result<()> {
    if config.upstreams.is_empty() {
        bail!("no upstreams given");
    }
    let upstreams = Arc::new(Upstreams::new(&config.upstreams));
    let health = tokio::spawn(health_check_loop(
        upstreams.clone(),
        config.check_interval,
        config.check_timeout,
        shutdown.clone(),
    ));
    info!(listen = %config.listen, upstreams = ?config.upstreams, "rivers started");

    loop {
        let (client, peer) = tokio::select! {
            _ = shutdown.cancelled() => break,
            accepted = listener.accept() => match accepted {
                Ok(a) => a,
                Err(e) => {
                    warn!(error = %e, "accept failed");
                    continue;
                }
            },
        };
        let Some(up) = upstreams.pick() else {
            warn!(%peer, "no healthy upstream; dropping connection");
            continue;
        };
        let addr = up.addr.clone();
        tokio::spawn(async move {
            if let Err(e) = proxy_connection(client, &addr).await {
                warn!(%peer, error = format!("{e:#}"), "proxy failed");
            }
        });
    }

    let _ = health.await;
    info!("rivers stopped");
    Ok(())
}

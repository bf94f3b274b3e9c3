use anyhow::Result;
use clap::Parser;
use cke_core::logging::{self, LogFormat};
use cke_rivers::upstream::parse_upstreams;
use cke_rivers::{RiversConfig, serve};
use tokio_util::sync::CancellationToken;
use tracing::info;

#[derive(Parser, Debug)]
#[command(name = "rivers", version, about = "TCP load balancer for the API servers")]
struct Args {
    /// Address to listen on
    #[arg(long, default_value = "127.0.0.1:16443")]
    listen: String,

    /// Comma separated upstream host:port list
    #[arg(long, required = true)]
    upstreams: String,

    /// Seconds between upstream health probes
    #[arg(long, default_value_t = 5)]
    check_interval: u64,
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();
    logging::init(LogFormat::Json);

    let mut config = RiversConfig::new(args.listen, parse_upstreams(&args.upstreams));
    config.check_interval = std::time::Duration::from_secs(args.check_interval);

    let shutdown = CancellationToken::new();
    let signal = shutdown.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            info!("interrupted; shutting down");
            signal.cancel();
        }
    });
    serve(config, shutdown).await
}

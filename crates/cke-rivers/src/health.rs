use std::sync::Arc;
use std::time::Duration;

use tokio::net::TcpStream;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use crate::upstream::Upstreams;

/// A TCP connect within `timeout` counts as alive.
pub async fn check_upstream_alive(addr: &str, timeout: Duration) -> bool {
    matches!(
        tokio::time::timeout(timeout, TcpStream::connect(addr)).await,
        Ok(Ok(_))
    )
}

/// Probe every upstream each `interval` until `shutdown` fires.
pub async fn health_check_loop(
    upstreams: Arc<Upstreams>,
    interval: Duration,
    timeout: Duration,
    shutdown: CancellationToken,
) {
    loop {
        for up in upstreams.iter() {
            let alive = check_upstream_alive(&up.addr, timeout).await;
            if up.set_healthy(alive) {
                if alive {
                    info!(upstream = %up.addr, "upstream is back");
                } else {
                    warn!(upstream = %up.addr, "upstream is down");
                }
            }
        }
        tokio::select! {
            _ = shutdown.cancelled() => return,
            _ = tokio::time::sleep(interval) => {}
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::net::TcpListener;

    #[tokio::test]
    async fn test_check_alive_listener() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap().to_string();
        assert!(check_upstream_alive(&addr, Duration::from_secs(1)).await);
    }

    #[tokio::test]
    async fn test_check_alive_unreachable() {
        assert!(!check_upstream_alive("127.0.0.1:1", Duration::from_millis(200)).await);
    }

    #[tokio::test]
    async fn test_loop_marks_dead_upstream() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let live = listener.local_addr().unwrap().to_string();
        let ups = Arc::new(Upstreams::new(&[live.clone(), "127.0.0.1:1".to_string()]));
        let shutdown = CancellationToken::new();
        let task = tokio::spawn(health_check_loop(
            ups.clone(),
            Duration::from_secs(60),
            Duration::from_millis(200),
            shutdown.clone(),
        ));
        for _ in 0..50 {
            if ups.iter().any(|u| !u.is_healthy()) {
                break;
            }
            tokio::time::sleep(Duration::from_millis(20)).await;
        }
        shutdown.cancel();
        task.await.unwrap();
        let states: Vec<bool> = ups.iter().map(|u| u.is_healthy()).collect();
        assert_eq!(states, vec![true, false]);
    }
}

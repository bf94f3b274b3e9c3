//! Prometheus exposition of the control loop and the inventory integration.

use std::collections::BTreeMap;
use std::fmt::Write as _;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use anyhow::{Context, Result};
use axum::extract::State;
use axum::http::{StatusCode, header};
use axum::response::IntoResponse;
use axum::routing::get;
use axum::Router;
use chrono::{DateTime, Utc};
use cke_core::reboot::{RebootStatus, count_reboot_queue_entries};
use cke_core::record::OperationPhase;
use cke_core::repair::{RepairStatus, count_repair_queue_entries};
use cke_sabakan::SabakanMetrics;
use cke_storage::Storage;
use tokio::net::TcpListener;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

const STORAGE_TIMEOUT: Duration = Duration::from_secs(10);
const TEXT_FORMAT: &str = "text/plain; version=0.0.4";

pub struct Metrics {
    phase: Mutex<Option<(OperationPhase, DateTime<Utc>)>>,
    leader: AtomicBool,
    sabakan: Arc<SabakanMetrics>,
    storage: Storage,
}

impl Metrics {
    pub fn new(storage: Storage, sabakan: Arc<SabakanMetrics>) -> Self {
        Self {
            phase: Mutex::new(None),
            leader: AtomicBool::new(false),
            sabakan,
            storage,
        }
    }

    pub fn set_leader(&self, leader: bool) {
        self.leader.store(leader, Ordering::Relaxed);
    }

    pub fn update_phase(&self, phase: OperationPhase, at: DateTime<Utc>) {
        if let Ok(mut p) = self.phase.lock() {
            *p = Some((phase, at));
        }
    }

    /// Render every gauge in the Prometheus text format.
    ///
    /// Queue gauges are read from storage at scrape time and left out when
    /// storage does not answer in time.
    pub async fn render(&self) -> String {
        let mut out = String::new();
        let leader = self.leader.load(Ordering::Relaxed);

        gauge_header(&mut out, "cke_leader", "1 if this server is the leader");
        let _ = writeln!(out, "cke_leader {}", u8::from(leader));

        let phase = self.phase.lock().ok().and_then(|p| *p);
        if let Some((current, at)) = phase {
            gauge_header(&mut out, "cke_operation_phase", "1 for the current operation phase");
            for p in OperationPhase::ALL {
                let _ = writeln!(
                    out,
                    "cke_operation_phase{{phase=\"{}\"}} {}",
                    p.as_str(),
                    u8::from(*p == current)
                );
            }
            gauge_header(
                &mut out,
                "cke_operation_phase_timestamp_seconds",
                "Unix time of the last phase update",
            );
            let _ = writeln!(out, "cke_operation_phase_timestamp_seconds {}", at.timestamp());
        }

        let sabakan = self.sabakan.snapshot();
        if let Some(ts) = sabakan.timestamp {
            gauge_header(
                &mut out,
                "cke_sabakan_integration_successful",
                "1 if the last inventory integration succeeded",
            );
            let _ = writeln!(out, "cke_sabakan_integration_successful {}", u8::from(sabakan.successful));
            gauge_header(
                &mut out,
                "cke_sabakan_integration_timestamp_seconds",
                "Unix time of the last inventory integration",
            );
            let _ = writeln!(out, "cke_sabakan_integration_timestamp_seconds {ts}");
        }
        if sabakan.successful {
            gauge_header(&mut out, "cke_sabakan_workers", "Worker nodes generated per role");
            for (role, n) in &sabakan.workers {
                let _ = writeln!(out, "cke_sabakan_workers{{role=\"{role}\"}} {n}");
            }
            gauge_header(&mut out, "cke_sabakan_unused_machines", "Healthy machines not in the cluster");
            let _ = writeln!(out, "cke_sabakan_unused_machines {}", sabakan.unused);
        }

        if leader {
            self.render_queues(&mut out).await;
        }
        out
    }

    async fn render_queues(&self, out: &mut String) {
        match tokio::time::timeout(STORAGE_TIMEOUT, self.storage.get_reboot_entries()).await {
            Ok(Ok(entries)) => {
                let counts = count_reboot_queue_entries(&entries);
                let labels = RebootStatus::ALL.iter().map(|s| s.as_str());
                write_counts(out, "cke_reboot_queue_entries", "Reboot queue entries per status", labels, &counts);
            }
            Ok(Err(e)) => warn!(error = %format!("{e:#}"), "failed to read reboot queue"),
            Err(_) => warn!("timed out reading reboot queue"),
        }
        match tokio::time::timeout(STORAGE_TIMEOUT, self.storage.get_repair_entries()).await {
            Ok(Ok(entries)) => {
                let counts = count_repair_queue_entries(&entries);
                let labels = RepairStatus::ALL.iter().map(|s| s.as_str());
                write_counts(out, "cke_repair_queue_entries", "Repair queue entries per status", labels, &counts);
            }
            Ok(Err(e)) => warn!(error = %format!("{e:#}"), "failed to read repair queue"),
            Err(_) => warn!("timed out reading repair queue"),
        }
    }
}

fn gauge_header(out: &mut String, name: &str, help: &str) {
    let _ = writeln!(out, "# HELP {name} {help}");
    let _ = writeln!(out, "# TYPE {name} gauge");
}

fn write_counts<'a>(
    out: &mut String,
    name: &str,
    help: &str,
    labels: impl Iterator<Item = &'a str>,
    counts: &BTreeMap<String, usize>,
) {
    gauge_header(out, name, help);
    for status in labels {
        let n = counts.get(status).copied().unwrap_or(0);
        let _ = writeln!(out, "{name}{{status=\"{status}\"}} {n}");
    }
}

pub fn router(metrics: Arc<Metrics>) -> Router {
    Router::new()
        .route("/metrics", get(handle_metrics))
        .route("/health", get(handle_health))
        .with_state(metrics)
}

async fn handle_metrics(State(metrics): State<Arc<Metrics>>) -> impl IntoResponse {
    ([(header::CONTENT_TYPE, TEXT_FORMAT)], metrics.render().await)
}

async fn handle_health() -> impl IntoResponse {
    (StatusCode::OK, "ok")
}

/// Serve `/metrics` and `/health` on `addr` until `shutdown` is cancelled.
pub async fn serve(addr: SocketAddr, metrics: Arc<Metrics>, shutdown: CancellationToken) -> Result<()> {
    let listener = TcpListener::bind(addr)
        .await
        .with_context(|| format!("Failed to bind metrics listener on {addr}"))?;
    info!(listen = %addr, "metrics server listening");
    axum::serve(listener, router(metrics))
        .with_graceful_shutdown(async move { shutdown.cancelled().await })
        .await
        .context("metrics server")
}

#[cfg(test)]
mod tests {
    use super::*;
    use cke_core::reboot::RebootQueueEntry;
    use cke_storage::MemoryKv;

    fn metrics() -> (Metrics, Storage) {
        let storage = Storage::new(Arc::new(MemoryKv::new()), "/cke/");
        (Metrics::new(storage.clone(), Arc::new(SabakanMetrics::default())), storage)
    }

    #[tokio::test]
    async fn test_follower_exposes_only_leader_gauge() {
        let (m, _) = metrics();
        let text = m.render().await;
        assert!(text.contains("cke_leader 0"));
        assert!(!text.contains("cke_operation_phase"));
        assert!(!text.contains("cke_reboot_queue_entries"));
    }

    #[tokio::test]
    async fn test_phase_and_queue_gauges() {
        let (m, storage) = metrics();
        storage
            .register_reboot_entry(&mut RebootQueueEntry::new("10.0.1.1"))
            .await
            .unwrap();
        m.set_leader(true);
        m.update_phase(OperationPhase::RebootNodes, Utc::now());

        let text = m.render().await;
        assert!(text.contains("cke_leader 1"));
        assert!(text.contains("cke_operation_phase{phase=\"reboot-nodes\"} 1"));
        assert!(text.contains("cke_operation_phase{phase=\"completed\"} 0"));
        assert!(text.contains("cke_operation_phase_timestamp_seconds "));
        assert!(text.contains("cke_reboot_queue_entries{status=\"queued\"} 1"));
        assert!(text.contains("cke_reboot_queue_entries{status=\"draining\"} 0"));
        assert!(text.contains("cke_repair_queue_entries{status=\"processing\"} 0"));
    }

    #[tokio::test]
    async fn test_sabakan_gauges_after_success() {
        let (m, _) = metrics();
        let mut workers = BTreeMap::new();
        workers.insert("cs".to_string(), 3);
        m.sabakan.record_success(workers, 2, Utc::now());

        let text = m.render().await;
        assert!(text.contains("cke_sabakan_integration_successful 1"));
        assert!(text.contains("cke_sabakan_workers{role=\"cs\"} 3"));
        assert!(text.contains("cke_sabakan_unused_machines 2"));
    }
}

use std::collections::HashMap;
use std::future::Future;
use std::sync::Arc;

use anyhow::Result;
use tokio::sync::{Mutex, OnceCell};
use tracing::warn;

use crate::agent::Agent;

type Slot = Arc<OnceCell<Option<Arc<dyn Agent>>>>;

/// Agents keyed by node address.
///
/// A failed connection is remembered as `None` so a pass does not retry an
/// unreachable node for every commander. Connections to different nodes
/// proceed in parallel.
#[derive(Default)]
pub struct AgentPool {
    agents: Mutex<HashMap<String, Slot>>,
}

impl AgentPool {
    pub fn new() -> Self {
        Self::default()
    }

    /// Return the pooled agent for `addr`, connecting with `connect` on first use.
    pub async fn get_or_connect<F, Fut>(&self, addr: &str, connect: F) -> Option<Arc<dyn Agent>>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<Arc<dyn Agent>>>,
    {
        let slot = self.agents.lock().await.entry(addr.to_string()).or_default().clone();
        slot.get_or_init(|| async {
            match connect().await {
                Ok(a) => Some(a),
                Err(e) => {
                    warn!(node = %addr, error = %format!("{e:#}"), "failed to create agent");
                    None
                }
            }
        })
        .await
        .clone()
    }

    /// Close and forget every agent.
    pub async fn close(&self) {
        let drained: Vec<Slot> = self.agents.lock().await.drain().map(|(_, s)| s).collect();
        for slot in drained {
            if let Some(Some(agent)) = slot.get() {
                agent.close().await;
            }
        }
    }
}

use std::collections::BTreeMap;
use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::cluster::{Cluster, RepairLookupError, RepairOperation, RepairStep};
use crate::reboot::drain_backoff;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RepairStatus {
    Queued,
    Processing,
    Succeeded,
    Failed,
}

impl RepairStatus {
    pub const ALL: [RepairStatus; 4] = [Self::Queued, Self::Processing, Self::Succeeded, Self::Failed];

    pub fn as_str(self) -> &'static str {
        match self {
            Self::Queued => "queued",
            Self::Processing => "processing",
            Self::Succeeded => "succeeded",
            Self::Failed => "failed",
        }
    }
}

impl fmt::Display for RepairStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RepairStepStatus {
    #[default]
    Waiting,
    Draining,
    Watching,
}

impl fmt::Display for RepairStepStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::Waiting => "waiting",
            Self::Draining => "draining",
            Self::Watching => "watching",
        };
        f.write_str(s)
    }
}

/// A machine waiting to be (or being) repaired.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RepairQueueEntry {
    pub index: i64,
    pub address: String,
    #[serde(default)]
    pub nodename: String,
    pub machine_type: String,
    pub operation: String,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub serial: String,
    pub status: RepairStatus,
    #[serde(default)]
    pub step: usize,
    #[serde(default)]
    pub step_status: RepairStepStatus,
    #[serde(default)]
    pub deleted: bool,
    #[serde(default)]
    pub last_transition_time: Option<DateTime<Utc>>,
    #[serde(default)]
    pub drain_backoff_count: u32,
    #[serde(default)]
    pub drain_backoff_expire: Option<DateTime<Utc>>,
    /// Modification revision in storage when read; 0 for an entry not read back.
    #[serde(skip)]
    pub revision: i64,
}

impl RepairQueueEntry {
    pub fn new(operation: &str, machine_type: &str, address: &str, serial: &str) -> Self {
        Self {
            index: 0,
            address: address.to_string(),
            nodename: String::new(),
            machine_type: machine_type.to_string(),
            operation: operation.to_string(),
            serial: serial.to_string(),
            status: RepairStatus::Queued,
            step: 0,
            step_status: RepairStepStatus::Waiting,
            deleted: false,
            last_transition_time: None,
            drain_backoff_count: 0,
            drain_backoff_expire: None,
            revision: 0,
        }
    }

    /// Resolve the Kubernetes node name from the cluster, if the machine is a member.
    pub fn fill_nodename(&mut self, cluster: &Cluster) {
        self.nodename = cluster
            .node(&self.address)
            .map(|n| n.nodename().to_string())
            .unwrap_or_default();
    }

    pub fn is_in_cluster(&self) -> bool {
        !self.nodename.is_empty()
    }

    pub fn has_finished(&self) -> bool {
        matches!(self.status, RepairStatus::Succeeded | RepairStatus::Failed)
    }

    pub fn get_matching_repair_operation<'a>(
        &self,
        cluster: &'a Cluster,
    ) -> Result<&'a RepairOperation, RepairLookupError> {
        cluster
            .repair
            .get_matching_repair_operation(&self.machine_type, &self.operation)
    }

    pub fn get_matching_repair_step<'a>(&self, cluster: &'a Cluster) -> Result<&'a RepairStep, RepairLookupError> {
        cluster
            .repair
            .get_matching_repair_step(&self.machine_type, &self.operation, self.step)
    }

    pub fn transition(&mut self, status: RepairStatus, step_status: RepairStepStatus, now: DateTime<Utc>) {
        self.status = status;
        self.step_status = step_status;
        self.last_transition_time = Some(now);
    }

    /// Drain failed: bump the backoff and wait for the next attempt.
    pub fn record_drain_failure(&mut self, now: DateTime<Utc>) {
        self.drain_backoff_count = self.drain_backoff_count.saturating_add(1);
        self.drain_backoff_expire = Some(now + drain_backoff(self.drain_backoff_count));
        self.transition(RepairStatus::Processing, RepairStepStatus::Waiting, now);
    }

    pub fn reset_backoff(&mut self) {
        self.drain_backoff_count = 0;
        self.drain_backoff_expire = None;
    }

    pub fn is_backoff_expired(&self, now: DateTime<Utc>) -> bool {
        self.drain_backoff_expire.is_none_or(|t| t <= now)
    }
}

/// Number of entries per status; every status is present.
pub fn count_repair_queue_entries(entries: &[RepairQueueEntry]) -> BTreeMap<String, usize> {
    let mut counts: BTreeMap<String, usize> = RepairStatus::ALL
        .iter()
        .map(|s| (s.as_str().to_string(), 0))
        .collect();
    for e in entries {
        *counts.entry(e.status.as_str().to_string()).or_default() += 1;
    }
    counts
}

use std::collections::{BTreeMap, HashSet};
use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::error::Error;

/// Base delay of the drain backoff.
pub const DRAIN_BACKOFF_BASE_SECS: i64 = 30;
/// Upper bound of the drain backoff.
pub const DRAIN_BACKOFF_MAX_SECS: i64 = 3600;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RebootStatus {
    Queued,
    Draining,
    Rebooting,
    Cancelled,
}

impl RebootStatus {
    pub const ALL: [RebootStatus; 4] = [Self::Queued, Self::Draining, Self::Rebooting, Self::Cancelled];

    pub fn as_str(self) -> &'static str {
        match self {
            Self::Queued => "queued",
            Self::Draining => "draining",
            Self::Rebooting => "rebooting",
            Self::Cancelled => "cancelled",
        }
    }
}

impl fmt::Display for RebootStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for RebootStatus {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::ALL
            .into_iter()
            .find(|st| st.as_str() == s)
            .ok_or_else(|| Error::bad_request(format!("unknown reboot status: {s}")))
    }
}

/// Delay before the next drain attempt after `count` consecutive failures.
pub fn drain_backoff(count: u32) -> chrono::Duration {
    let secs = 2i64
        .checked_pow(count)
        .and_then(|m| m.checked_mul(DRAIN_BACKOFF_BASE_SECS))
        .unwrap_or(DRAIN_BACKOFF_MAX_SECS)
        .min(DRAIN_BACKOFF_MAX_SECS);
    chrono::Duration::seconds(secs)
}

/// A node waiting to be (or being) rebooted.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RebootQueueEntry {
    pub index: i64,
    pub node: String,
    pub status: RebootStatus,
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

impl RebootQueueEntry {
    /// A queued entry; the index is assigned by storage on registration.
    pub fn new(node: &str) -> Self {
        Self {
            index: 0,
            node: node.to_string(),
            status: RebootStatus::Queued,
            last_transition_time: None,
            drain_backoff_count: 0,
            drain_backoff_expire: None,
            revision: 0,
        }
    }

    pub fn transition(&mut self, status: RebootStatus, now: DateTime<Utc>) {
        self.status = status;
        self.last_transition_time = Some(now);
    }

    /// Drain failed: bump the backoff and put the entry back in the queue.
    pub fn record_drain_failure(&mut self, now: DateTime<Utc>) {
        self.drain_backoff_count = self.drain_backoff_count.saturating_add(1);
        self.drain_backoff_expire = Some(now + drain_backoff(self.drain_backoff_count));
        self.transition(RebootStatus::Queued, now);
    }

    pub fn reset_backoff(&mut self) {
        self.drain_backoff_count = 0;
        self.drain_backoff_expire = None;
    }

    pub fn is_backoff_expired(&self, now: DateTime<Utc>) -> bool {
        self.drain_backoff_expire.is_none_or(|t| t <= now)
    }

    /// Draining and rebooting entries hold a reboot slot.
    pub fn is_in_progress(&self) -> bool {
        matches!(self.status, RebootStatus::Draining | RebootStatus::Rebooting)
    }
}

/// Number of entries per status; every status is present.
pub fn count_reboot_queue_entries(entries: &[RebootQueueEntry]) -> BTreeMap<String, usize> {
    let mut counts: BTreeMap<String, usize> = RebootStatus::ALL
        .iter()
        .map(|s| (s.as_str().to_string(), 0))
        .collect();
    for e in entries {
        *counts.entry(e.status.as_str().to_string()).or_default() += 1;
    }
    counts
}

/// Drop later entries for a node that already appeared earlier.
pub fn dedup_reboot_queue_entries(entries: Vec<RebootQueueEntry>) -> Vec<RebootQueueEntry> {
    let mut seen = HashSet::new();
    entries
        .into_iter()
        .filter(|e| seen.insert(e.node.clone()))
        .collect()
}

/// Persistent switches of the reboot queue.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct RebootQueueState {
    #[serde(default)]
    pub disabled: bool,
    #[serde(default)]
    pub write_index: i64,
}

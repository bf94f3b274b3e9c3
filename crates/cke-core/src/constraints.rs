use anyhow::Result;
use serde::{Deserialize, Serialize};

use crate::cluster::Cluster;
use crate::error::Error;

/// Integer-valued admission rules for the cluster and its queues.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub struct Constraints {
    #[serde(default = "default_control_plane_count")]
    pub control_plane_count: usize,
    #[serde(default = "default_minimum_workers")]
    pub minimum_workers: usize,
    #[serde(default = "default_minimum_workers_rate")]
    pub minimum_workers_rate: usize,
    /// Zero means unlimited.
    #[serde(default)]
    pub maximum_workers: usize,
    #[serde(default)]
    pub maximum_unreachable_nodes_for_reboot: usize,
    #[serde(default)]
    pub maximum_repair_queue_entries: usize,
    #[serde(default)]
    pub wait_seconds_to_repair_rebooting: u64,
}

fn default_control_plane_count() -> usize {
    1
}
fn default_minimum_workers() -> usize {
    1
}
fn default_minimum_workers_rate() -> usize {
    80
}

impl Default for Constraints {
    fn default() -> Self {
        Self {
            control_plane_count: default_control_plane_count(),
            minimum_workers: default_minimum_workers(),
            minimum_workers_rate: default_minimum_workers_rate(),
            maximum_workers: 0,
            maximum_unreachable_nodes_for_reboot: 0,
            maximum_repair_queue_entries: 0,
            wait_seconds_to_repair_rebooting: 0,
        }
    }
}

/// Constraint names accepted by `ckecli constraints set`.
pub const CONSTRAINT_NAMES: &[&str] = &[
    "control-plane-count",
    "minimum-workers",
    "minimum-workers-rate",
    "maximum-workers",
    "maximum-unreachable-nodes-for-reboot",
    "maximum-repair-queue-entries",
    "wait-seconds-to-repair-rebooting",
];

impl Constraints {
    /// Succeeds iff the number of control-plane nodes equals `control_plane_count`.
    pub fn check(&self, cluster: &Cluster) -> Result<()> {
        let cps = cluster.control_planes().count();
        if cps != self.control_plane_count {
            return Err(Error::bad_request(format!(
                "number of control planes is {cps}, but control-plane-count is {}",
                self.control_plane_count
            ))
            .into());
        }
        Ok(())
    }

    /// Set one constraint by its kebab-case name.
    pub fn set(&mut self, name: &str, value: u64) -> Result<()> {
        let v = usize::try_from(value).map_err(|_| Error::bad_request(format!("value too large: {value}")))?;
        match name {
            "control-plane-count" => {
                if v == 0 {
                    return Err(Error::bad_request("control-plane-count must be positive").into());
                }
                self.control_plane_count = v;
            }
            "minimum-workers" => self.minimum_workers = v,
            "minimum-workers-rate" => {
                if v > 100 {
                    return Err(Error::bad_request("minimum-workers-rate must be <= 100").into());
                }
                self.minimum_workers_rate = v;
            }
            "maximum-workers" => self.maximum_workers = v,
            "maximum-unreachable-nodes-for-reboot" => self.maximum_unreachable_nodes_for_reboot = v,
            "maximum-repair-queue-entries" => self.maximum_repair_queue_entries = v,
            "wait-seconds-to-repair-rebooting" => self.wait_seconds_to_repair_rebooting = value,
            other => {
                return Err(Error::bad_request(format!(
                    "unknown constraint {other:?}; expected one of {}",
                    CONSTRAINT_NAMES.join(", ")
                ))
                .into());
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cluster::tests::test_cluster;

    #[test]
    fn test_defaults() {
        let c: Constraints = serde_json::from_str("{}").unwrap();
        assert_eq!(c, Constraints::default());
        assert_eq!(c.control_plane_count, 1);
        assert_eq!(c.minimum_workers_rate, 80);
        assert_eq!(c.maximum_workers, 0);
    }

    #[test]
    fn test_check_counts_control_planes() {
        let cluster = test_cluster(&["10.0.0.11", "10.0.0.12", "10.0.0.13"], &["10.0.0.21"]);
        let mut c = Constraints::default();
        assert!(c.check(&cluster).is_err());
        c.control_plane_count = 3;
        assert!(c.check(&cluster).is_ok());
        c.control_plane_count = 4;
        assert!(c.check(&cluster).is_err());
    }

    #[test]
    fn test_set_by_name() {
        let mut c = Constraints::default();
        c.set("maximum-workers", 10).unwrap();
        c.set("wait-seconds-to-repair-rebooting", 300).unwrap();
        assert_eq!(c.maximum_workers, 10);
        assert_eq!(c.wait_seconds_to_repair_rebooting, 300);
        assert!(c.set("minimum-workers-rate", 101).is_err());
        assert!(c.set("control-plane-count", 0).is_err());
        assert!(c.set("no-such-thing", 1).is_err());
    }

    #[test]
    fn test_kebab_case_keys() {
        let json = serde_json::to_value(Constraints::default()).unwrap();
        for name in CONSTRAINT_NAMES {
            assert!(json.get(*name).is_some(), "missing {name}");
        }
    }
}

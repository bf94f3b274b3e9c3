use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Lifecycle state reported by the inventory service.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum MachineState {
    Uninitialized,
    Healthy,
    Unhealthy,
    Unreachable,
    Updating,
    Retiring,
    Retired,
}

impl MachineState {
    /// Machine may join the cluster as a new node.
    pub fn is_usable(self) -> bool {
        self == Self::Healthy
    }

    /// Machine is leaving the fleet; its node must go.
    pub fn is_leaving(self) -> bool {
        matches!(self, Self::Retiring | Self::Retired)
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Self::Uninitialized => "uninitialized",
            Self::Healthy => "healthy",
            Self::Unhealthy => "unhealthy",
            Self::Unreachable => "unreachable",
            Self::Updating => "updating",
            Self::Retiring => "retiring",
            Self::Retired => "retired",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Label {
    pub name: String,
    pub value: String,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Bmc {
    #[serde(default)]
    pub bmc_type: String,
    #[serde(default)]
    pub ipv4: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MachineSpec {
    pub serial: String,
    #[serde(default)]
    pub labels: Vec<Label>,
    #[serde(default)]
    pub rack: u32,
    #[serde(default)]
    pub index_in_rack: u32,
    #[serde(default)]
    pub role: String,
    #[serde(default)]
    pub ipv4: Vec<String>,
    #[serde(default)]
    pub register_date: Option<DateTime<Utc>>,
    #[serde(default)]
    pub retire_date: Option<DateTime<Utc>>,
    #[serde(default)]
    pub bmc: Bmc,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MachineStatus {
    pub state: MachineState,
    #[serde(default)]
    pub timestamp: Option<DateTime<Utc>>,
    /// Seconds spent in the current state.
    #[serde(default)]
    pub duration: f64,
}

/// One entry of `searchMachines`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Machine {
    pub spec: MachineSpec,
    pub status: MachineStatus,
}

impl Machine {
    /// Node address: the first IPv4 address.
    pub fn address(&self) -> Option<&str> {
        self.spec.ipv4.first().map(String::as_str)
    }

    pub fn state(&self) -> MachineState {
        self.status.state
    }

    pub fn labels(&self) -> BTreeMap<String, String> {
        self.spec
            .labels
            .iter()
            .map(|l| (l.name.clone(), l.value.clone()))
            .collect()
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;

    pub(crate) fn machine(address: &str, rack: u32, role: &str, state: MachineState) -> Machine {
        Machine {
            spec: MachineSpec {
                serial: format!("serial-{address}"),
                labels: vec![],
                rack,
                index_in_rack: 1,
                role: role.to_string(),
                ipv4: vec![address.to_string()],
                register_date: None,
                retire_date: None,
                bmc: Bmc {
                    bmc_type: "IPMI-2.0".into(),
                    ipv4: String::new(),
                },
            },
            status: MachineStatus {
                state,
                timestamp: None,
                duration: 0.0,
            },
        }
    }

    #[test]
    fn test_decode_graphql_machine() {
        let json = r#"{
            "spec": {
                "serial": "abc",
                "labels": [{"name": "product", "value": "R630"}],
                "rack": 2,
                "indexInRack": 4,
                "role": "cs",
                "ipv4": ["10.0.2.4"],
                "registerDate": "2024-01-01T00:00:00Z",
                "retireDate": "2029-01-01T00:00:00Z",
                "bmc": {"bmcType": "iDRAC-9", "ipv4": "10.1.2.4"}
            },
            "status": {"state": "UNREACHABLE", "timestamp": "2024-05-01T00:00:00Z", "duration": 120.5}
        }"#;
        let m: Machine = serde_json::from_str(json).unwrap();
        assert_eq!(m.address(), Some("10.0.2.4"));
        assert_eq!(m.spec.index_in_rack, 4);
        assert_eq!(m.spec.bmc.bmc_type, "iDRAC-9");
        assert_eq!(m.state(), MachineState::Unreachable);
        assert_eq!(m.labels()["product"], "R630");
        assert!(!m.state().is_usable());
    }

    #[test]
    fn test_leaving_states() {
        assert!(MachineState::Retiring.is_leaving());
        assert!(MachineState::Retired.is_leaving());
        assert!(!MachineState::Unhealthy.is_leaving());
    }
}

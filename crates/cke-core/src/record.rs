use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Audit descriptor of a single commander.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Command {
    pub name: String,
    pub target: String,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub detail: String,
}

impl Command {
    pub fn new(name: &str, target: impl Into<String>) -> Self {
        Self {
            name: name.to_string(),
            target: target.into(),
            detail: String::new(),
        }
    }

    pub fn with_detail(mut self, detail: impl Into<String>) -> Self {
        self.detail = detail.into();
        self
    }
}

impl fmt::Display for Command {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.detail.is_empty() {
            write!(f, "{} {}", self.name, self.target)
        } else {
            write!(f, "{} {} ({})", self.name, self.target, self.detail)
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RecordStatus {
    Running,
    Completed,
    Failed,
    Cancelled,
}

impl fmt::Display for RecordStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::Running => "running",
            Self::Completed => "completed",
            Self::Failed => "failed",
            Self::Cancelled => "cancelled",
        };
        f.write_str(s)
    }
}

/// Audit entry of one operator run.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Record {
    pub id: i64,
    pub status: RecordStatus,
    pub operation: String,
    #[serde(default)]
    pub command: Command,
    #[serde(default)]
    pub targets: Vec<String>,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub error: String,
    pub start_at: DateTime<Utc>,
    #[serde(default)]
    pub end_at: Option<DateTime<Utc>>,
    /// Leader key of the process that ran the operation.
    #[serde(default)]
    pub leader_key: String,
}

impl Record {
    pub fn new(id: i64, operation: &str, targets: Vec<String>, leader_key: &str) -> Self {
        Self {
            id,
            status: RecordStatus::Running,
            operation: operation.to_string(),
            command: Command::default(),
            targets,
            error: String::new(),
            start_at: Utc::now(),
            end_at: None,
            leader_key: leader_key.to_string(),
        }
    }

    pub fn set_command(&mut self, command: Command) {
        self.command = command;
    }

    pub fn complete(&mut self) {
        self.status = RecordStatus::Completed;
        self.end_at = Some(Utc::now());
    }

    pub fn fail(&mut self, err: &anyhow::Error) {
        self.status = RecordStatus::Failed;
        self.error = format!("{err:#}");
        self.end_at = Some(Utc::now());
    }

    pub fn cancel(&mut self) {
        self.status = RecordStatus::Cancelled;
        self.end_at = Some(Utc::now());
    }
}

/// Coarse progress of the control loop, exported as a metric.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum OperationPhase {
    Upgrading,
    Rivers,
    EtcdBoot,
    EtcdStart,
    EtcdWait,
    K8sStart,
    EtcdMaintain,
    K8sMaintain,
    ResourceApply,
    StopCp,
    RepairMachines,
    RebootNodes,
    Completed,
}

impl OperationPhase {
    pub const ALL: &'static [OperationPhase] = &[
        Self::Upgrading,
        Self::Rivers,
        Self::EtcdBoot,
        Self::EtcdStart,
        Self::EtcdWait,
        Self::K8sStart,
        Self::EtcdMaintain,
        Self::K8sMaintain,
        Self::ResourceApply,
        Self::StopCp,
        Self::RepairMachines,
        Self::RebootNodes,
        Self::Completed,
    ];

    pub fn as_str(self) -> &'static str {
        match self {
            Self::Upgrading => "upgrading",
            Self::Rivers => "rivers",
            Self::EtcdBoot => "etcd-boot",
            Self::EtcdStart => "etcd-start",
            Self::EtcdWait => "etcd-wait",
            Self::K8sStart => "k8s-start",
            Self::EtcdMaintain => "etcd-maintain",
            Self::K8sMaintain => "k8s-maintain",
            Self::ResourceApply => "resource-apply",
            Self::StopCp => "stop-cp",
            Self::RepairMachines => "repair-machines",
            Self::RebootNodes => "reboot-nodes",
            Self::Completed => "completed",
        }
    }
}

impl fmt::Display for OperationPhase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Value stored in the `status` key after each pass.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ServerStatus {
    pub phase: OperationPhase,
    pub timestamp: DateTime<Utc>,
    pub leader: String,
    #[serde(default)]
    pub record_id: Option<i64>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_record_lifecycle() {
        let mut r = Record::new(7, "etcd-bootstrap", vec!["10.0.0.1".into()], "/cke/leader/abc");
        assert_eq!(r.status, RecordStatus::Running);
        assert!(r.end_at.is_none());
        r.set_command(Command::new("image-pull", "10.0.0.1").with_detail("etcd"));
        r.fail(&anyhow::anyhow!("pull failed").context("image-pull"));
        assert_eq!(r.status, RecordStatus::Failed);
        assert_eq!(r.error, "image-pull: pull failed");
        assert!(r.end_at.is_some());
    }

    #[test]
    fn test_record_json_field_names() {
        let r = Record::new(1, "rivers-bootstrap", vec![], "k");
        let v = serde_json::to_value(&r).unwrap();
        assert_eq!(v["status"], "running");
        assert_eq!(v["operation"], "rivers-bootstrap");
    }

    #[test]
    fn test_phase_names_are_unique() {
        let mut names: Vec<&str> = OperationPhase::ALL.iter().map(|p| p.as_str()).collect();
        names.sort();
        names.dedup();
        assert_eq!(names.len(), OperationPhase::ALL.len());
        assert_eq!(
            serde_json::to_string(&OperationPhase::EtcdMaintain).unwrap(),
            "\"etcd-maintain\""
        );
    }

    #[test]
    fn test_command_display() {
        assert_eq!(Command::new("cordon", "n1").to_string(), "cordon n1");
        assert_eq!(
            Command::new("run-container", "n1").with_detail("etcd").to_string(),
            "run-container n1 (etcd)"
        );
    }
}

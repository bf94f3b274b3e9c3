// cke-sabakan: turns fleet inventory into the cluster node list.
// The leader consults it before every reconciliation pass.

pub mod client;
pub mod generator;
pub mod integrator;
pub mod machine;
pub mod metrics;

pub use client::SabakanClient;
pub use generator::{ClusterGenerator, TemplateError};
pub use integrator::Integrator;
pub use machine::{Machine, MachineState};
pub use metrics::{SabakanMetrics, SabakanSnapshot};

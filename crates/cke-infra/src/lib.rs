// cke-infra: everything a reconciliation pass talks to, behind traits.
// Production implementations use SSH, docker, etcd-client, kube and Vault;
// the `testing` feature adds the in-memory fakes.

pub mod agent;
pub mod container;
pub mod etcd;
#[cfg(any(test, feature = "testing"))]
pub mod fake;
pub mod infra;
pub mod k8s;
pub mod kubeconfig;
pub mod local;
pub mod pool;
pub mod vault;

pub use agent::{Agent, RunOutput, SshAgent};
pub use container::{ContainerEngine, RunSpec, ServiceParamsFile};
pub use etcd::{EtcdApi, EtcdClient};
pub use infra::{CkeInfra, Infrastructure};
pub use k8s::{KubeApi, KubeClient};
pub use local::{LocalRunner, ProcessRunner};
pub use vault::{CertIssuer, CertRequest, IssuedCert, VaultClient};

//! # cke — declarative Kubernetes and etcd cluster engine
//!
//! Facade crate that re-exports the cke workspace crates so consumers
//! can depend on a single `cke` library.
//!
//! ## Crate breakdown
//!
//! | Module | Crate | Purpose |
//! |--------|-------|---------|
//! | [`core`] | cke-core | Cluster model, validation, queues, config, logging |
//! | [`storage`] | cke-storage | Typed storage over etcd, leader election |
//! | [`infra`] | cke-infra | SSH agents, container engine, etcd/Kubernetes/Vault clients |
//! | [`op`] | cke-op | Operators and commanders |
//! | [`server`] | cke-server | Collector, strategy, control loop, metrics |
//! | [`sabakan`] | cke-sabakan | Inventory integration and auto-repair |
//! | [`rivers`] | cke-rivers | Local TCP load balancer for the API servers |
//! | [`cli`] | cke-cli | The `ckecli` command tree |

pub use cke_cli as cli;
pub use cke_core as core;
pub use cke_infra as infra;
pub use cke_op as op;
pub use cke_rivers as rivers;
pub use cke_sabakan as sabakan;
pub use cke_server as server;
pub use cke_storage as storage;

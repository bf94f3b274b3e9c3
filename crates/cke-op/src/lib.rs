// cke-op: the steps a reconciliation pass executes.
// Operators yield commanders one at a time; commanders do the work and
// describe themselves for the operation record.

pub mod certs;
pub mod common;
pub mod component;
pub mod drain;
pub mod etcd;
pub mod maintain;
pub mod operator;
pub mod parallel;
pub mod reboot;
pub mod repair;
pub mod resource;
pub mod service;
pub mod static_resources;
pub mod stop;
#[cfg(test)]
mod testutil;

pub use operator::{Commander, Operator, RunContext, Sequence, run_to_end};
pub use parallel::BatchResult;
pub use service::Service;
pub use static_resources::static_resources;

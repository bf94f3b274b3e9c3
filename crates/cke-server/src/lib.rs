// cke-server: observation, decision and the leader-only control loop of the cke daemon.

pub mod collector;
pub mod controller;
pub mod metrics;
pub mod strategy;

#[cfg(test)]
mod testutil;

pub use controller::{Controller, InfraFactory, PassOutcome};
pub use metrics::Metrics;
pub use strategy::{DecideInput, decide_ops};

// cke-core: cluster model, validation, queue entries, config, utilities.
// No internal cke dependencies; every other crate builds on this one.

pub mod ca;
pub mod cluster;
pub mod config;
pub mod constraints;
pub mod error;
pub mod images;
pub mod logging;
pub mod node;
pub mod reboot;
pub mod record;
pub mod repair;
pub mod resource;
pub mod retry;
pub mod status;
pub mod time;
pub mod vault;

pub use error::{Error, is_conflicted, is_no_leader, is_not_found};

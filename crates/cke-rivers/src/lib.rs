// cke-rivers: layer 4 load balancer in front of the API servers.
// Every node runs one; local clients talk to it instead of a single apiserver.

pub mod health;
pub mod proxy;
pub mod server;
pub mod upstream;

pub use server::{RiversConfig, serve};
pub use upstream::Upstreams;

//! GANTRY Server
//!
//! The gateway daemon: TOML configuration, backend selection, and the
//! JSON-RPC HTTP surface over the cluster gateway.

#![warn(missing_docs)]
#![warn(clippy::all)]

pub mod boot;
pub mod config;
pub mod rpc;

pub use boot::{Backends, BootError, BootResult, Daemon};
pub use config::{ConfigError, GatewayConfig, LogFormat};
pub use rpc::{RpcError, router};

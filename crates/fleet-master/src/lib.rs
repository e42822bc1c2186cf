//! Fleet Master - daemon tooling for the master control plane
//!
//! Configuration loading, tracing setup and the `fleetd` commands used to
//! inspect and recover the journal of a master process.

#![deny(unsafe_code)]

pub mod commands;
pub mod config;
pub mod telemetry;

pub use commands::{execute, Command};
pub use config::{LoggingConfig, MasterConfig};
pub use telemetry::init_tracing;

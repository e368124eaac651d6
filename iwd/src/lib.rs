//! `iwd` is the node daemon. It reads a JSON config naming the modules to
//! run, builds them through [`DaemonComponents`] and hands them to the
//! [`Orchestrator`], which starts them in priority tiers and stops them on
//! shutdown.
//!
//! Every module shares one [`iw_client::BrokerClient`]. A `udp-discovery`
//! module is linked to it, so a broker found on the network is connected to
//! without configuration. The `introspection` module mirrors this process's
//! service registry into the broker under `iw-introspection/nodes/`.

pub mod components;
pub mod config;
pub mod introspection;
pub mod orchestrator;

pub use components::{link_discovery, DaemonComponents};
pub use config::{ApplicationConfig, DaemonConfig, ModuleConfig};
pub use introspection::{Introspection, IntrospectionConfig, IntrospectionPublisher};
pub use orchestrator::{ComponentFactory, Orchestrator, OrchestratorError};

use thiserror::Error;

#[derive(Error, Debug)]
pub enum DaemonError {
    #[error("I/O Error")]
    Io(#[from] std::io::Error),
    #[error("Invalid configuration")]
    Config(#[from] serde_json::Error),
    #[error("Orchestrator Error: {0}")]
    Orchestrator(#[from] OrchestratorError),
    #[error("Invalid log level {0}")]
    LogLevel(String),
}

pub type DaemonResult<T> = Result<T, DaemonError>;

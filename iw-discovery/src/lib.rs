//! The `iw-discovery` crate lets nodes find the broker on the local network
//! without static configuration. It defines two [`actix::Actor`] objects
//! sharing one datagram format (see [`wire`]):
//!
//! 1. [`Advertiser`] runs next to the broker. It binds the request port,
//!    broadcasts one unsolicited advertisement as soon as it is listening
//!    (so discoverers that are already waiting learn of it immediately) and
//!    answers every discovery request with a unicast advertisement carrying
//!    the broker port.
//! 2. [`Discoverer`] runs on client nodes. While resumed it broadcasts a
//!    discovery request every few seconds and emits a
//!    [`DiscoveryEvent::Discovered`] for every advertisement it receives. It
//!    does not act on the result itself; a listener (normally the broker
//!    client's connect) does. It is paused once a connection is up and
//!    resumed when it drops.
//!
//! Socket errors on either side tear the socket down and rebind it after a
//! fixed delay. Both actors are wrapped by cheap handles, [`Advertisement`]
//! and [`Discovery`], which implement [`iw_registry::Service`].

mod advertiser;
mod discoverer;
mod socket;
pub mod wire;

pub use advertiser::{
    Advertisement, Advertiser, AdvertiserEvent, StartAdvertising, StopAdvertising,
};
pub use discoverer::{
    Discovered, Discoverer, Discovery, DiscoveryEvent, PauseDiscovery, ResumeDiscovery,
    StartDiscovery, StopDiscovery,
};

use serde::Deserialize;
use std::net::{Ipv4Addr, SocketAddr, SocketAddrV4};
use thiserror::Error;
use tokio::time::Duration;

#[derive(Error, Debug)]
pub enum DiscoveryError {
    #[error("I/O Error")]
    Io(#[from] std::io::Error),
    #[error("Invalid configuration")]
    Config(#[from] serde_json::Error),
    #[error("Actix mailbox Error")]
    MailError(#[from] actix::MailboxError),
}

// Send a discovery request every 5 seconds while resumed
const BROADCAST_INTERVAL: u64 = 5;

// Seconds to wait before rebinding after a socket error
const ERROR_RETRY_TIMEOUT: u64 = 10;

/// Fixed delays used by both roles. Defaults match the deployed fleet;
/// tests shorten them
#[derive(Debug, Clone, Copy)]
pub struct DiscoveryTimings {
    pub broadcast_interval: Duration,
    pub error_retry: Duration,
}

impl Default for DiscoveryTimings {
    fn default() -> Self {
        Self {
            broadcast_interval: Duration::from_secs(BROADCAST_INTERVAL),
            error_retry: Duration::from_secs(ERROR_RETRY_TIMEOUT),
        }
    }
}

fn any_address() -> Ipv4Addr {
    Ipv4Addr::UNSPECIFIED
}

fn broadcast_address() -> Ipv4Addr {
    Ipv4Addr::BROADCAST
}

/// [`AdvertiserConfig`] as found in a module's `config` block
#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AdvertiserConfig {
    /// Port that is advertised, i.e. the broker port
    pub advertised_port: u16,
    /// Port to listen on for discovery requests
    pub request_port: u16,
    #[serde(default = "any_address")]
    pub request_address: Ipv4Addr,
    /// Where the unsolicited advertisement goes, defaults to `request_port + 1`
    #[serde(default)]
    pub broadcast_port: Option<u16>,
    #[serde(default = "broadcast_address")]
    pub broadcast_address: Ipv4Addr,
}

impl AdvertiserConfig {
    pub fn listen_addr(&self) -> SocketAddr {
        SocketAddr::V4(SocketAddrV4::new(self.request_address, self.request_port))
    }

    pub fn broadcast_target(&self) -> SocketAddr {
        let port = self
            .broadcast_port
            .unwrap_or(self.request_port.saturating_add(1));
        SocketAddr::V4(SocketAddrV4::new(self.broadcast_address, port))
    }
}

/// [`DiscovererConfig`] as found in a module's `config` block
#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DiscovererConfig {
    /// Port discovery requests are sent to
    pub request_port: u16,
    #[serde(default = "broadcast_address")]
    pub request_address: Ipv4Addr,
    /// Port to listen on for advertisements, defaults to `request_port + 1`
    #[serde(default)]
    pub broadcast_port: Option<u16>,
}

impl DiscovererConfig {
    pub fn listen_addr(&self) -> SocketAddr {
        let port = self
            .broadcast_port
            .unwrap_or(self.request_port.saturating_add(1));
        SocketAddr::V4(SocketAddrV4::new(Ipv4Addr::UNSPECIFIED, port))
    }

    pub fn request_target(&self) -> SocketAddr {
        SocketAddr::V4(SocketAddrV4::new(self.request_address, self.request_port))
    }
}

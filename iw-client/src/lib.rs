//! The `iw-client` crate keeps a node attached to the record/rpc broker.
//!
//! A [`ConnectionManager`] actor owns the single broker session and every
//! registration made through it: record subscriptions, data providers, rpc
//! providers and multiplexed channel sockets. Registrations survive the
//! connection; when a session opens they are restored in a fixed order,
//! then the broker's port configuration is read, pending channel sockets
//! are opened and only then `connected` is emitted. A session error
//! schedules one reconnect after a fixed delay.
//!
//! The broker itself sits behind [`BrokerConnector`]; [`LocalBroker`] is an
//! in-process implementation. Channel sockets are opened through a
//! [`ChannelConnector`], by default [`WsConnector`].
//!
//! Most callers use the cloneable [`BrokerClient`] handle, which is also the
//! component the orchestrator loads under the `broker-client` type.

pub mod broker;
mod channel;
mod client;
mod manager;
mod ws;

pub use broker::{
    BrokerConnector, BrokerError, BrokerSession, ConnectionState, DataCallback, DataProvider,
    ListenResponse, LocalBroker, RecordHandle, RecordKind, RecordRef, RpcCallback, RpcResponse,
    SessionEvent,
};
pub use channel::{ChannelConnector, ChannelError, ChannelEvent, ChannelProxy, ChannelSocket};
pub use client::{BrokerClient, ClientConfig};
pub use manager::{
    ClientEvent, ClientOptions, ClientStatus, ConnectionManager, PortConfig, Start, Stop,
};
pub use ws::WsConnector;

use actix::MailboxError;
use iw_registry::ServiceError;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum ClientError {
    #[error("Broker Error: {0}")]
    Broker(#[from] BrokerError),
    #[error("Channel Error")]
    Channel(#[from] ChannelError),
    #[error("Invalid configuration")]
    Config(#[from] serde_json::Error),
    #[error("Actix mailbox Error")]
    MailError(#[from] MailboxError),
}

impl From<ClientError> for ServiceError {
    fn from(e: ClientError) -> Self {
        match e {
            ClientError::Config(e) => ServiceError::Config(e),
            ClientError::MailError(e) => ServiceError::MailError(e),
            other => ServiceError::Other(other.to_string()),
        }
    }
}

//! Seam between the [`ConnectionManager`](crate::ConnectionManager) and the
//! record/rpc broker it talks to. A [`BrokerConnector`] opens one
//! [`BrokerSession`] per connection attempt; everything the broker pushes
//! back (state changes, listen matches, rpc requests) arrives as a
//! [`SessionEvent`] on the channel handed to `connect`.

mod local;

pub use local::LocalBroker;

use futures::future::BoxFuture;
use serde_json::Value;
use std::{fmt, sync::Arc};
use thiserror::Error;
use tokio::sync::mpsc::UnboundedSender;

#[derive(Error, Debug, Clone, PartialEq)]
pub enum BrokerError {
    #[error("not connected")]
    NotConnected,
    #[error("No provider for rpc {0}")]
    NoRpcProvider(String),
    #[error("RPC Error {0}")]
    Rpc(String),
    #[error("Record {0} discarded before it was ready")]
    Record(String),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    AwaitingAuthentication,
    Authenticating,
    Open,
    Closed,
    Error,
    Reconnecting,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RecordKind {
    Record,
    List,
}

/// Record subscription callback. Two callbacks are the same subscriber if
/// they point at the same allocation
pub type DataCallback = Arc<dyn Fn(Value) + Send + Sync>;

pub type RecordRef = Arc<dyn RecordHandle>;

pub type RpcCallback = Arc<dyn Fn(Value, RpcResponse) + Send + Sync>;

/// A live handle onto one named record (or list) within a session
pub trait RecordHandle: Send + Sync {
    fn name(&self) -> &str;

    fn kind(&self) -> RecordKind;

    /// Deliver every future change of the record (or of `path` within it)
    /// to `callback`, and the current value right away if `now` is set
    fn subscribe(&self, path: Option<&str>, callback: DataCallback, now: bool);

    fn unsubscribe(&self, callback: &DataCallback);

    fn get(&self, path: Option<&str>) -> Value;

    fn set(&self, path: Option<&str>, value: Value);

    /// Resolves with the record's value once it has been loaded
    fn when_ready(&self) -> BoxFuture<'static, Result<Value, BrokerError>>;

    /// Release the handle. Its subscriptions stop firing
    fn discard(&self);
}

pub trait BrokerSession: Send {
    fn record(&mut self, name: &str, kind: RecordKind) -> RecordRef;

    /// Ask to be told (via [`SessionEvent::ListenMatch`]) whenever some other
    /// client shows or loses interest in a record matching `pattern`
    fn listen(&mut self, pattern: &str);

    fn unlisten(&mut self, pattern: &str);

    /// Route requests for `name` to this session as
    /// [`SessionEvent::RpcRequest`]
    fn provide_rpc(&mut self, name: &str);

    fn unprovide_rpc(&mut self, name: &str);

    fn make_rpc(&self, name: &str, payload: Value)
        -> BoxFuture<'static, Result<Value, BrokerError>>;

    fn close(&mut self);
}

pub trait BrokerConnector: Send + Sync {
    /// Start connecting to `url`, logging in as `client_name`. Never fails
    /// here; an unreachable broker reports [`ConnectionState::Error`]
    fn connect(
        &self,
        url: &str,
        client_name: &str,
        events: UnboundedSender<SessionEvent>,
    ) -> Box<dyn BrokerSession>;
}

pub enum SessionEvent {
    State(ConnectionState),
    Error {
        message: String,
        event: String,
        topic: String,
    },
    ListenMatch {
        pattern: String,
        name: String,
        subscribed: bool,
        response: ListenResponse,
    },
    RpcRequest {
        name: String,
        payload: Value,
        response: RpcResponse,
    },
}

impl fmt::Debug for SessionEvent {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SessionEvent::State(state) => write!(f, "State({state:?})"),
            SessionEvent::Error { message, .. } => write!(f, "Error({message})"),
            SessionEvent::ListenMatch {
                name, subscribed, ..
            } => write!(f, "ListenMatch({name}, {subscribed})"),
            SessionEvent::RpcRequest { name, .. } => write!(f, "RpcRequest({name})"),
        }
    }
}

/// Reply slot for a subscribed [`SessionEvent::ListenMatch`]
pub struct ListenResponse(Box<dyn FnOnce(bool) + Send>);

impl ListenResponse {
    pub fn new(f: impl FnOnce(bool) + Send + 'static) -> Self {
        Self(Box::new(f))
    }

    pub fn accept(self) {
        (self.0)(true)
    }

    pub fn reject(self) {
        (self.0)(false)
    }
}

/// Reply slot for a [`SessionEvent::RpcRequest`]
pub struct RpcResponse(Box<dyn FnOnce(Result<Value, String>) + Send>);

impl RpcResponse {
    pub fn new(f: impl FnOnce(Result<Value, String>) + Send + 'static) -> Self {
        Self(Box::new(f))
    }

    pub fn send(self, result: Value) {
        (self.0)(Ok(result))
    }

    pub fn error(self, message: &str) {
        (self.0)(Err(message.to_string()))
    }
}

/// Supplies the content of records matching a pattern registered with
/// `provide_data`. `provide` is called when the first client subscribes to
/// `name`, `stop` when the last one leaves
pub trait DataProvider: Send + Sync {
    fn provide(&self, record: RecordRef, name: &str);

    fn stop(&self, record: RecordRef, name: &str);
}

pub(crate) fn same_callback(a: &DataCallback, b: &DataCallback) -> bool {
    Arc::ptr_eq(a, b)
}

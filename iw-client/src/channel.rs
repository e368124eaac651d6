use actix::{SpawnHandle, WeakAddr};
use futures::future::BoxFuture;
use std::sync::{
    atomic::{AtomicBool, Ordering},
    Arc, Weak,
};
use thiserror::Error;
use tokio::sync::mpsc::{unbounded_channel, UnboundedReceiver, UnboundedSender};

use crate::manager::{ChannelSend, CloseProxy, ConnectionManager};

#[derive(Error, Debug)]
pub enum ChannelError {
    #[error("WebSocket Error")]
    WebSocket(#[from] tokio_tungstenite::tungstenite::Error),
    #[error("I/O Error")]
    Io(#[from] std::io::Error),
    #[error("Channel Error {0}")]
    Other(String),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ChannelEvent {
    Open,
    Close,
    Message(Vec<u8>),
}

/// Both directions of one connected streaming socket. The socket is closed
/// by dropping `outgoing`; the peer closing it ends `incoming`
pub struct ChannelSocket {
    pub outgoing: UnboundedSender<Vec<u8>>,
    pub incoming: UnboundedReceiver<Vec<u8>>,
}

pub trait ChannelConnector: Send + Sync {
    fn connect(&self, url: &str) -> BoxFuture<'static, Result<ChannelSocket, ChannelError>>;
}

/// State a proxy may observe without going through the manager
#[derive(Default)]
pub(crate) struct ChannelShared {
    open: AtomicBool,
}

pub(crate) struct SocketLink {
    pub id: u64,
    pub outgoing: UnboundedSender<Vec<u8>>,
    pub reader: SpawnHandle,
}

/// One channel path: the proxies handed out for it and the single socket
/// they share
pub(crate) struct ChannelEntry {
    shared: Arc<ChannelShared>,
    proxies: Vec<(u64, UnboundedSender<ChannelEvent>)>,
    pub socket: Option<SocketLink>,
    pub connecting: bool,
    pub reconnect: Option<SpawnHandle>,
}

impl ChannelEntry {
    pub fn new() -> Self {
        Self {
            shared: Arc::new(ChannelShared::default()),
            proxies: vec![],
            socket: None,
            connecting: false,
            reconnect: None,
        }
    }

    pub fn is_open(&self) -> bool {
        self.socket.is_some()
    }

    pub fn proxy_count(&self) -> usize {
        self.proxies.len()
    }

    pub fn shared(&self) -> Weak<ChannelShared> {
        Arc::downgrade(&self.shared)
    }

    /// Register proxy `id`, which sees `Open` right away if the socket is up
    pub fn add_proxy(&mut self, id: u64) -> UnboundedReceiver<ChannelEvent> {
        let (tx, rx) = unbounded_channel();
        if self.is_open() {
            tx.send(ChannelEvent::Open).ok();
        }
        self.proxies.push((id, tx));
        rx
    }

    /// Returns whether any proxies remain
    pub fn remove_proxy(&mut self, id: u64) -> bool {
        self.proxies.retain(|(proxy, _)| *proxy != id);
        !self.proxies.is_empty()
    }

    fn broadcast(&mut self, event: ChannelEvent) {
        // proxies whose receiver is gone are dropped here
        self.proxies.retain(|(_, tx)| tx.send(event.clone()).is_ok());
    }

    pub fn attach(&mut self, link: SocketLink) {
        self.connecting = false;
        self.socket = Some(link);
        self.shared.open.store(true, Ordering::Release);
        self.broadcast(ChannelEvent::Open);
    }

    /// Forget the socket, telling every proxy it closed. Returns the link so
    /// the caller can cancel its reader
    pub fn detach(&mut self) -> Option<SocketLink> {
        let link = self.socket.take()?;
        self.shared.open.store(false, Ordering::Release);
        self.broadcast(ChannelEvent::Close);
        Some(link)
    }

    pub fn deliver(&mut self, data: Vec<u8>) {
        self.broadcast(ChannelEvent::Message(data));
    }

    /// Returns false if there was no socket to send on
    pub fn send(&self, data: Vec<u8>) -> bool {
        match &self.socket {
            Some(link) => link.outgoing.send(data).is_ok(),
            None => false,
        }
    }
}

/// Handle onto a multiplexed channel returned by `open_channel`. Many
/// proxies can share a path; the socket lives as long as at least one of
/// them does. Dropping a proxy closes it
pub struct ChannelProxy {
    path: String,
    id: u64,
    shared: Weak<ChannelShared>,
    events: UnboundedReceiver<ChannelEvent>,
    manager: WeakAddr<ConnectionManager>,
    closed: bool,
}

impl ChannelProxy {
    pub(crate) fn new(
        path: &str,
        id: u64,
        shared: Weak<ChannelShared>,
        events: UnboundedReceiver<ChannelEvent>,
        manager: WeakAddr<ConnectionManager>,
    ) -> Self {
        Self {
            path: path.to_string(),
            id,
            shared,
            events,
            manager,
            closed: false,
        }
    }

    pub fn path(&self) -> &str {
        &self.path
    }

    pub fn is_open(&self) -> bool {
        !self.closed
            && self
                .shared
                .upgrade()
                .is_some_and(|shared| shared.open.load(Ordering::Acquire))
    }

    /// Queue `data` on the shared socket. Dropped with a warning when the
    /// socket is not connected
    pub fn send(&self, data: impl Into<Vec<u8>>) {
        if self.closed {
            log::warn!("Dropping send on closed channel proxy {}", self.path);
            return;
        }
        if let Some(manager) = self.manager.upgrade() {
            manager.do_send(ChannelSend {
                path: self.path.clone(),
                data: data.into(),
            });
        }
    }

    /// Next open/close/message event, or `None` once the proxy is closed
    /// or the manager is gone
    pub async fn next_event(&mut self) -> Option<ChannelEvent> {
        if self.closed {
            return None;
        }
        self.events.recv().await
    }

    pub fn try_next_event(&mut self) -> Option<ChannelEvent> {
        self.events.try_recv().ok()
    }

    pub fn close(&mut self) {
        if self.closed {
            return;
        }
        self.closed = true;
        if let Some(manager) = self.manager.upgrade() {
            manager.do_send(CloseProxy {
                path: self.path.clone(),
                id: self.id,
            });
        }
    }
}

impl Drop for ChannelProxy {
    fn drop(&mut self) {
        self.close();
    }
}

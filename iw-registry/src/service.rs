use actix::MailboxError;
use async_trait::async_trait;
use futures::future::BoxFuture;
use serde_json::Value;
use thiserror::Error;
use tokio::sync::oneshot;

use crate::{Event, Listeners};

#[derive(Error, Debug)]
pub enum ServiceError {
    #[error("Invalid configuration")]
    Config(#[from] serde_json::Error),
    #[error("Unknown event {0}")]
    UnknownEvent(String),
    #[error("Actix mailbox Error")]
    MailError(#[from] MailboxError),
    #[error("Service stopped before emitting {0}")]
    EventDropped(String),
    #[error("Service Error {0}")]
    Other(String),
}

/// Trait implemented by every long-running unit the orchestrator can load.
/// Implementors are cheap handles onto an actor, so every method takes
/// `&self`
#[async_trait]
pub trait Service: Send + Sync {
    /// Type name the component is registered under
    fn service_type(&self) -> &'static str;

    async fn start(&self, config: Value) -> Result<(), ServiceError>;

    async fn stop(&self) -> Result<(), ServiceError>;

    /// Apply a new configuration to a running component. Returns whether the
    /// component accepted it; the default accepts nothing
    async fn reconfigure(&self, _config: Value) -> Result<bool, ServiceError> {
        Ok(false)
    }

    /// Resolves the next time the component emits the named event. The
    /// waiter is registered before this returns, so an event emitted while
    /// the caller is still starting the component is not missed
    fn wait_for(&self, event: &str) -> BoxFuture<'static, Result<(), ServiceError>> {
        let event = event.to_string();
        Box::pin(async move { Err(ServiceError::UnknownEvent(event)) })
    }
}

/// Build a [`Service::wait_for`] future for a component emitting `E`.
/// `register` hands the waiter to the component (usually with `do_send`)
pub fn await_event<E: Event>(
    event: &str,
    register: impl FnOnce(&'static str, oneshot::Sender<()>),
) -> BoxFuture<'static, Result<(), ServiceError>> {
    let Some(name) = Listeners::<E>::known(event) else {
        let event = event.to_string();
        return Box::pin(async move { Err(ServiceError::UnknownEvent(event)) });
    };

    let (tx, rx) = oneshot::channel();
    register(name, tx);
    Box::pin(async move {
        rx.await
            .map_err(|_| ServiceError::EventDropped(name.to_string()))
    })
}

use actix::prelude::*;
use chrono::{DateTime, Local};
use serde::Serialize;
use std::{
    collections::BTreeMap,
    sync::{
        atomic::{AtomicUsize, Ordering},
        Arc,
    },
};
use thiserror::Error;
use tokio::sync::mpsc::UnboundedSender;

use crate::State;

#[derive(Error, Debug)]
pub enum RegistryError {
    #[error("Actix mailbox Error")]
    MailError(#[from] MailboxError),
}

/// Registry view of one live component instance, as returned by
/// [`ServiceContext::snapshot`] and streamed to an attached sink
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ServiceEntry {
    pub index: usize,
    pub service_type: String,
    pub name: Option<String>,
    pub state: State,
    pub message: String,
    pub error_diagnostic: Option<String>,
    pub updated: DateTime<Local>,
}

impl ServiceEntry {
    fn label(&self) -> String {
        match &self.name {
            Some(name) => format!("{} ({})", self.service_type, name),
            None => self.service_type.clone(),
        }
    }
}

/// Changes pushed to the introspection sink. Attaching a sink first replays
/// one [`RegistryUpdate::Entry`] per registered instance
#[derive(Debug, Clone)]
pub enum RegistryUpdate {
    Entry(ServiceEntry),
    Removed(usize),
}

/// [`ServiceRegistry`] is the actor owning the table of live component
/// instances. Components never talk to it directly; they go through the
/// [`ServiceHandle`] they got from [`ServiceContext::register`]
#[derive(Default)]
pub struct ServiceRegistry {
    entries: BTreeMap<usize, ServiceEntry>,
    sink: Option<UnboundedSender<RegistryUpdate>>,
}

impl ServiceRegistry {
    fn publish(&mut self, update: RegistryUpdate) {
        if let Some(sink) = &self.sink {
            if sink.send(update).is_err() {
                log::debug!("Introspection sink went away, detaching");
                self.sink = None;
            }
        }
    }
}

impl Actor for ServiceRegistry {
    type Context = Context<Self>;
}

#[derive(Message)]
#[rtype(result = "()")]
struct Register(ServiceEntry);

impl Handler<Register> for ServiceRegistry {
    type Result = ();

    fn handle(&mut self, msg: Register, _ctx: &mut Self::Context) -> Self::Result {
        let entry = msg.0;
        log::debug!(
            "Registered a new instance {} of {} with index {}",
            entry.name.as_deref().unwrap_or(""),
            entry.service_type,
            entry.index
        );
        self.entries.insert(entry.index, entry.clone());
        self.publish(RegistryUpdate::Entry(entry));
    }
}

#[derive(Message, Default)]
#[rtype(result = "()")]
struct Update {
    index: usize,
    state: Option<State>,
    message: Option<String>,
    error_diagnostic: Option<String>,
}

impl Handler<Update> for ServiceRegistry {
    type Result = ();

    fn handle(&mut self, msg: Update, _ctx: &mut Self::Context) -> Self::Result {
        let Some(entry) = self.entries.get_mut(&msg.index) else {
            log::warn!("Dropping update for unregistered service {}", msg.index);
            return;
        };

        if let Some(state) = msg.state {
            // re-entering the current state is not a transition
            let level = if entry.state == state {
                log::Level::Debug
            } else {
                state.log_level()
            };
            log::log!(
                level,
                "{}: {} -> {}: {}",
                entry.label(),
                entry.state,
                state,
                msg.message.as_deref().unwrap_or_default()
            );
            entry.state = state;
        }
        if let Some(message) = msg.message {
            entry.message = message;
        }
        if msg.error_diagnostic.is_some() {
            entry.error_diagnostic = msg.error_diagnostic;
        }
        entry.updated = Local::now();

        let update = RegistryUpdate::Entry(entry.clone());
        self.publish(update);
    }
}

#[derive(Message)]
#[rtype(result = "()")]
struct Deregister(usize);

impl Handler<Deregister> for ServiceRegistry {
    type Result = ();

    fn handle(&mut self, msg: Deregister, _ctx: &mut Self::Context) -> Self::Result {
        if let Some(entry) = self.entries.remove(&msg.0) {
            log::debug!("Deregistered {}", entry.label());
            self.publish(RegistryUpdate::Removed(msg.0));
        }
    }
}

/// Read-only copy of every registry entry
#[derive(Message)]
#[rtype(result = "Vec<ServiceEntry>")]
pub struct Snapshot;

impl Handler<Snapshot> for ServiceRegistry {
    type Result = MessageResult<Snapshot>;

    fn handle(&mut self, _msg: Snapshot, _ctx: &mut Self::Context) -> Self::Result {
        MessageResult(self.entries.values().cloned().collect())
    }
}

#[derive(Message)]
#[rtype(result = "()")]
struct AttachSink(UnboundedSender<RegistryUpdate>);

impl Handler<AttachSink> for ServiceRegistry {
    type Result = ();

    fn handle(&mut self, msg: AttachSink, _ctx: &mut Self::Context) -> Self::Result {
        if self.sink.is_some() {
            log::info!("Replacing attached introspection sink");
        }
        self.sink = Some(msg.0);
        let entries = self.entries.values().cloned().collect::<Vec<_>>();
        for entry in entries {
            self.publish(RegistryUpdate::Entry(entry));
        }
    }
}

#[derive(Message)]
#[rtype(result = "()")]
struct DetachSink;

impl Handler<DetachSink> for ServiceRegistry {
    type Result = ();

    fn handle(&mut self, _msg: DetachSink, _ctx: &mut Self::Context) -> Self::Result {
        // dropping the sender ends the consumer's stream
        self.sink = None;
    }
}

#[derive(Message)]
#[rtype(result = "()")]
struct Shutdown;

impl Handler<Shutdown> for ServiceRegistry {
    type Result = ();

    fn handle(&mut self, _msg: Shutdown, ctx: &mut Self::Context) -> Self::Result {
        self.sink = None;
        ctx.stop();
    }
}

/// The process-wide context object handed to every component at
/// construction. Cloning is cheap; all clones share one registry
#[derive(Clone)]
pub struct ServiceContext {
    registry: Addr<ServiceRegistry>,
    next_index: Arc<AtomicUsize>,
}

impl ServiceContext {
    /// Start the registry actor. Must be called from within a running
    /// actix system
    pub fn init() -> Self {
        Self {
            registry: ServiceRegistry::default().start(),
            next_index: Arc::new(AtomicUsize::new(0)),
        }
    }

    pub fn register(
        &self,
        service_type: &str,
        initial_state: State,
        name: Option<&str>,
    ) -> ServiceHandle {
        let index = self.next_index.fetch_add(1, Ordering::Relaxed);
        self.registry.do_send(Register(ServiceEntry {
            index,
            service_type: service_type.to_string(),
            name: name.map(str::to_string),
            state: initial_state,
            message: "Initial State".to_string(),
            error_diagnostic: None,
            updated: Local::now(),
        }));

        ServiceHandle {
            index,
            registry: self.registry.clone(),
        }
    }

    pub async fn snapshot(&self) -> Result<Vec<ServiceEntry>, RegistryError> {
        Ok(self.registry.send(Snapshot).await?)
    }

    /// Attach the introspection sink, replacing any previous one. The full
    /// current snapshot is replayed into it before live updates
    pub fn attach_sink(&self, sink: UnboundedSender<RegistryUpdate>) {
        self.registry.do_send(AttachSink(sink));
    }

    pub fn detach_sink(&self) {
        self.registry.do_send(DetachSink);
    }

    pub fn teardown(&self) {
        self.registry.do_send(Shutdown);
    }
}

/// Per-instance handle used to report state into the registry
#[derive(Clone)]
pub struct ServiceHandle {
    index: usize,
    registry: Addr<ServiceRegistry>,
}

impl ServiceHandle {
    pub fn index(&self) -> usize {
        self.index
    }

    /// Move to `state`. An empty `message` leaves the previous one in place
    pub fn set_state(&self, state: State, message: &str) {
        self.registry.do_send(Update {
            index: self.index,
            state: Some(state),
            message: (!message.is_empty()).then(|| message.to_string()),
            ..Default::default()
        });
    }

    pub fn set_message(&self, message: &str) {
        self.registry.do_send(Update {
            index: self.index,
            message: Some(message.to_string()),
            ..Default::default()
        });
    }

    pub fn set_error_diagnostic(&self, diagnostic: &str) {
        self.registry.do_send(Update {
            index: self.index,
            error_diagnostic: Some(diagnostic.to_string()),
            ..Default::default()
        });
    }

    pub fn deregister(&self) {
        self.registry.do_send(Deregister(self.index));
    }
}

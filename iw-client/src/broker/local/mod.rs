//! In-process broker. The shared store and the interest/provider
//! bookkeeping live here, session-side operations in `session` and record
//! handles in `record`.

mod record;
mod session;

use regex::Regex;
use serde_json::Value;
use std::{
    collections::{BTreeSet, HashMap},
    sync::{Arc, Mutex, MutexGuard, PoisonError},
};
use tokio::sync::mpsc::UnboundedSender;

use super::{ConnectionState, DataCallback, ListenResponse, RecordKind, SessionEvent};
use record::{empty, read, write};

/// In-process broker. Every clone shares the same record store, so a
/// daemon can serve its own client and tests can drive outages from the
/// side with [`LocalBroker::interrupt`], [`LocalBroker::stall`] and
/// [`LocalBroker::set_reachable`]
#[derive(Clone)]
pub struct LocalBroker {
    inner: Arc<Mutex<Inner>>,
}

struct SessionSlot {
    client_name: String,
    events: UnboundedSender<SessionEvent>,
}

struct HandleSlot {
    session: u64,
    name: String,
    subscriptions: Vec<(Option<String>, DataCallback)>,
}

struct Listen {
    session: u64,
    pattern: String,
    regex: Regex,
}

#[derive(Clone)]
struct Provider {
    session: u64,
    pattern: String,
}

struct Inner {
    reachable: bool,
    next_id: u64,
    sessions: HashMap<u64, SessionSlot>,
    records: HashMap<String, Value>,
    handles: HashMap<u64, HandleSlot>,
    listens: Vec<Listen>,
    // offered to a listener, waiting on accept/reject
    pending: HashMap<String, Provider>,
    provided: HashMap<String, Provider>,
    rpcs: HashMap<String, u64>,
}

type Notification = (DataCallback, Value);

impl Default for LocalBroker {
    fn default() -> Self {
        Self {
            inner: Arc::new(Mutex::new(Inner {
                reachable: true,
                next_id: 0,
                sessions: HashMap::new(),
                records: HashMap::new(),
                handles: HashMap::new(),
                listens: vec![],
                pending: HashMap::new(),
                provided: HashMap::new(),
                rpcs: HashMap::new(),
            })),
        }
    }
}

fn notify(notifications: Vec<Notification>) {
    for (callback, value) in notifications {
        callback(value);
    }
}

impl LocalBroker {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> MutexGuard<'_, Inner> {
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// While unreachable every connect attempt ends in
    /// [`ConnectionState::Error`]
    pub fn set_reachable(&self, reachable: bool) {
        self.lock().reachable = reachable;
    }

    /// Drop every open session as if the network went away. Each client
    /// sees [`ConnectionState::Error`]
    pub fn interrupt(&self) {
        let mut inner = self.lock();
        let ids = inner.sessions.keys().copied().collect::<Vec<_>>();
        for id in ids {
            inner.send(id, SessionEvent::State(ConnectionState::Error));
            inner.remove_session(self, id);
        }
    }

    /// Report a transient fault: every session sees
    /// [`ConnectionState::Error`] then [`ConnectionState::Reconnecting`] but
    /// keeps its handles, listens and rpcs until [`LocalBroker::recover`]
    pub fn stall(&self) {
        let inner = self.lock();
        for id in inner.sessions.keys() {
            inner.send(*id, SessionEvent::State(ConnectionState::Error));
            inner.send(*id, SessionEvent::State(ConnectionState::Reconnecting));
        }
    }

    /// Reopen every stalled session
    pub fn recover(&self) {
        let inner = self.lock();
        for id in inner.sessions.keys() {
            inner.send(*id, SessionEvent::State(ConnectionState::Open));
        }
    }

    /// Write a record from the broker side
    pub fn set(&self, name: &str, path: Option<&str>, value: Value) {
        let notifications = self.lock().write_record(name, path, value);
        notify(notifications);
    }

    pub fn get(&self, name: &str) -> Option<Value> {
        self.lock().records.get(name).cloned()
    }

    /// Number of live record handles on `name`, over all sessions
    pub fn live_handles(&self, name: &str) -> usize {
        self.lock()
            .handles
            .values()
            .filter(|h| h.name == name)
            .count()
    }

    /// Number of subscription callbacks on `name`, over all handles
    pub fn subscriber_count(&self, name: &str) -> usize {
        self.lock()
            .handles
            .values()
            .filter(|h| h.name == name)
            .map(|h| h.subscriptions.len())
            .sum()
    }

    /// Number of listen registrations on `pattern`, over all sessions
    pub fn listen_count(&self, pattern: &str) -> usize {
        self.lock()
            .listens
            .iter()
            .filter(|l| l.pattern == pattern)
            .count()
    }

    pub fn session_count(&self) -> usize {
        self.lock().sessions.len()
    }

    pub fn client_names(&self) -> Vec<String> {
        self.lock()
            .sessions
            .values()
            .map(|s| s.client_name.clone())
            .collect()
    }

    /// Whether some session currently provides `name`
    pub fn is_provided(&self, name: &str) -> bool {
        self.lock().provided.contains_key(name)
    }

    pub fn has_rpc(&self, name: &str) -> bool {
        self.lock().rpcs.contains_key(name)
    }

    fn answer(&self, name: String, provider: Provider, accepted: bool) {
        let mut inner = self.lock();
        if inner
            .pending
            .get(&name)
            .map_or(true, |p| p.session != provider.session)
        {
            return;
        }
        inner.pending.remove(&name);

        let position = inner
            .listens
            .iter()
            .position(|l| l.session == provider.session && l.pattern == provider.pattern);

        match (accepted, position) {
            (true, Some(_)) => {
                log::debug!("{} provides {name:}", provider.pattern);
                inner.provided.insert(name.clone(), provider);
                inner.check_interest(self, &name);
            }
            (_, position) => {
                let from = position.map_or(0, |p| p + 1);
                inner.offer(self, &name, from);
            }
        }
    }
}

impl Inner {
    fn next_id(&mut self) -> u64 {
        self.next_id += 1;
        self.next_id
    }

    fn send(&self, session: u64, event: SessionEvent) {
        if let Some(slot) = self.sessions.get(&session) {
            // client may have dropped its receiver already
            slot.events.send(event).ok();
        }
    }

    fn write_record(&mut self, name: &str, path: Option<&str>, value: Value) -> Vec<Notification> {
        let old = self
            .records
            .get(name)
            .cloned()
            .unwrap_or_else(|| empty(RecordKind::Record));
        let mut new = old.clone();
        write(&mut new, path, value);

        let notifications = self
            .handles
            .values()
            .filter(|h| h.name == name)
            .flat_map(|h| h.subscriptions.iter())
            .filter_map(|(path, callback)| {
                let after = read(&new, path.as_deref());
                (read(&old, path.as_deref()) != after).then(|| (callback.clone(), after))
            })
            .collect();

        self.records.insert(name.to_string(), new);
        notifications
    }

    fn provider_session(&self, name: &str) -> Option<u64> {
        self.provided
            .get(name)
            .or_else(|| self.pending.get(name))
            .map(|p| p.session)
    }

    // handles held by anyone but the (prospective) provider
    fn interest(&self, name: &str) -> usize {
        let provider = self.provider_session(name);
        self.handles
            .values()
            .filter(|h| h.name == name && Some(h.session) != provider)
            .count()
    }

    fn check_interest(&mut self, broker: &LocalBroker, name: &str) {
        let interest = self.interest(name);
        if let Some(provider) = self.provided.get(name).cloned() {
            if interest == 0 {
                self.provided.remove(name);
                self.send(
                    provider.session,
                    SessionEvent::ListenMatch {
                        pattern: provider.pattern,
                        name: name.to_string(),
                        subscribed: false,
                        response: ListenResponse::new(|_| {}),
                    },
                );
            }
        } else if !self.pending.contains_key(name) && interest > 0 {
            self.offer(broker, name, 0);
        }
    }

    fn offer(&mut self, broker: &LocalBroker, name: &str, from: usize) {
        let Some(listen) = self
            .listens
            .iter()
            .skip(from)
            .find(|l| l.regex.is_match(name))
        else {
            return;
        };
        let provider = Provider {
            session: listen.session,
            pattern: listen.pattern.clone(),
        };
        self.pending.insert(name.to_string(), provider.clone());

        let broker = broker.clone();
        let matched = name.to_string();
        let event = SessionEvent::ListenMatch {
            pattern: provider.pattern.clone(),
            name: name.to_string(),
            subscribed: true,
            response: ListenResponse::new({
                let provider = provider.clone();
                move |accepted| broker.answer(matched, provider, accepted)
            }),
        };
        self.send(provider.session, event);
    }

    fn interested_names(&self) -> BTreeSet<String> {
        self.handles.values().map(|h| h.name.clone()).collect()
    }

    fn remove_session(&mut self, broker: &LocalBroker, id: u64) {
        if self.sessions.remove(&id).is_none() {
            return;
        }
        let mut affected = BTreeSet::new();

        self.handles.retain(|_, h| {
            if h.session == id {
                affected.insert(h.name.clone());
            }
            h.session != id
        });
        self.listens.retain(|l| l.session != id);
        self.rpcs.retain(|_, session| *session != id);
        for map in [&mut self.provided, &mut self.pending] {
            map.retain(|name, p| {
                if p.session == id {
                    affected.insert(name.clone());
                }
                p.session != id
            });
        }

        for name in affected {
            self.check_interest(broker, &name);
        }
    }
}

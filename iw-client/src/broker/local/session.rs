use futures::{future::BoxFuture, FutureExt};
use regex::Regex;
use serde_json::Value;
use std::sync::Arc;
use tokio::sync::{mpsc::UnboundedSender, oneshot};

use super::{record::LocalRecord, HandleSlot, Listen, LocalBroker, SessionSlot};
use crate::broker::{
    BrokerConnector, BrokerError, BrokerSession, ConnectionState, RecordKind, RecordRef,
    RpcResponse, SessionEvent,
};

impl BrokerConnector for LocalBroker {
    fn connect(
        &self,
        url: &str,
        client_name: &str,
        events: UnboundedSender<SessionEvent>,
    ) -> Box<dyn BrokerSession> {
        let mut inner = self.lock();
        let id = inner.next_id();

        events
            .send(SessionEvent::State(ConnectionState::AwaitingAuthentication))
            .ok();
        if !inner.reachable {
            log::debug!("Refusing connection from {client_name:} to {url:}");
            events.send(SessionEvent::State(ConnectionState::Error)).ok();
        } else {
            events
                .send(SessionEvent::State(ConnectionState::Authenticating))
                .ok();
            events.send(SessionEvent::State(ConnectionState::Open)).ok();
            inner.sessions.insert(
                id,
                SessionSlot {
                    client_name: client_name.to_string(),
                    events,
                },
            );
        }

        Box::new(LocalSession {
            broker: self.clone(),
            id,
        })
    }
}

struct LocalSession {
    broker: LocalBroker,
    id: u64,
}

impl BrokerSession for LocalSession {
    fn record(&mut self, name: &str, kind: RecordKind) -> RecordRef {
        let mut inner = self.broker.lock();
        let id = inner.next_id();
        if inner.sessions.contains_key(&self.id) {
            inner.handles.insert(
                id,
                HandleSlot {
                    session: self.id,
                    name: name.to_string(),
                    subscriptions: vec![],
                },
            );
            inner.check_interest(&self.broker, name);
        }

        Arc::new(LocalRecord {
            broker: self.broker.clone(),
            id,
            name: name.to_string(),
            kind,
        })
    }

    fn listen(&mut self, pattern: &str) {
        let regex = match Regex::new(pattern) {
            Ok(regex) => regex,
            Err(e) => {
                log::warn!("Ignoring invalid listen pattern {pattern:}: {e:}");
                return;
            }
        };
        let mut inner = self.broker.lock();
        if !inner.sessions.contains_key(&self.id) {
            return;
        }
        inner.listens.push(Listen {
            session: self.id,
            pattern: pattern.to_string(),
            regex,
        });
        for name in inner.interested_names() {
            inner.check_interest(&self.broker, &name);
        }
    }

    fn unlisten(&mut self, pattern: &str) {
        let mut inner = self.broker.lock();
        let id = self.id;
        inner
            .listens
            .retain(|l| !(l.session == id && l.pattern == pattern));

        let mut dropped = vec![];
        inner.provided.retain(|name, p| {
            let keep = !(p.session == id && p.pattern == pattern);
            if !keep {
                dropped.push(name.clone());
            }
            keep
        });
        for name in dropped {
            inner.check_interest(&self.broker, &name);
        }
    }

    fn provide_rpc(&mut self, name: &str) {
        let mut inner = self.broker.lock();
        if inner.sessions.contains_key(&self.id) {
            inner.rpcs.insert(name.to_string(), self.id);
        }
    }

    fn unprovide_rpc(&mut self, name: &str) {
        let mut inner = self.broker.lock();
        if inner.rpcs.get(name) == Some(&self.id) {
            inner.rpcs.remove(name);
        }
    }

    fn make_rpc(
        &self,
        name: &str,
        payload: Value,
    ) -> BoxFuture<'static, Result<Value, BrokerError>> {
        let inner = self.broker.lock();
        if !inner.sessions.contains_key(&self.id) {
            return futures::future::ready(Err(BrokerError::NotConnected)).boxed();
        }
        let Some(provider) = inner.rpcs.get(name).copied() else {
            return futures::future::ready(Err(BrokerError::NoRpcProvider(name.to_string())))
                .boxed();
        };

        let (tx, rx) = oneshot::channel();
        inner.send(
            provider,
            SessionEvent::RpcRequest {
                name: name.to_string(),
                payload,
                response: RpcResponse::new(move |result| {
                    tx.send(result).ok();
                }),
            },
        );

        let name = name.to_string();
        async move {
            match rx.await {
                Ok(Ok(result)) => Ok(result),
                Ok(Err(message)) => Err(BrokerError::Rpc(message)),
                Err(_) => Err(BrokerError::Rpc(format!("{name} provider went away"))),
            }
        }
        .boxed()
    }

    fn close(&mut self) {
        let mut inner = self.broker.lock();
        inner.send(self.id, SessionEvent::State(ConnectionState::Closed));
        inner.remove_session(&self.broker, self.id);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::broker::local::testing::open;
    use serde_json::json;
    use tokio::sync::mpsc::unbounded_channel;

    #[test]
    fn connect_reports_states_in_order() {
        let broker = LocalBroker::new();
        let (tx, mut rx) = unbounded_channel();
        let _session = broker.connect("local", "a-1", tx);
        let states = std::iter::from_fn(|| rx.try_recv().ok())
            .map(|e| match e {
                SessionEvent::State(s) => s,
                other => panic!("unexpected {other:?}"),
            })
            .collect::<Vec<_>>();
        assert_eq!(
            states,
            vec![
                ConnectionState::AwaitingAuthentication,
                ConnectionState::Authenticating,
                ConnectionState::Open
            ]
        );

        broker.set_reachable(false);
        let (tx, mut rx) = unbounded_channel();
        let _session = broker.connect("local", "a-2", tx);
        rx.try_recv().unwrap();
        assert!(matches!(
            rx.try_recv(),
            Ok(SessionEvent::State(ConnectionState::Error))
        ));
        assert_eq!(broker.session_count(), 1);
    }

    #[test]
    fn sessions_to_any_address_share_one_store() {
        let broker = LocalBroker::new();
        let (tx, _rx) = unbounded_channel();
        let mut here = broker.connect("127.0.0.1:6020", "here", tx);
        let (tx, _rx) = unbounded_channel();
        let mut there = broker.connect("ws://10.0.0.9:6020/deepstream", "there", tx);

        let written = here.record("iw-introspection/nodes/here", RecordKind::Record);
        written.set(None, json!({"services": []}));
        let seen = there.record("iw-introspection/nodes/here", RecordKind::Record);
        assert_eq!(seen.get(None), json!({"services": []}));
        assert_eq!(broker.session_count(), 2);
    }

    #[test]
    fn listen_counts_each_registration() {
        let broker = LocalBroker::new();
        let (mut session, _rx) = open(&broker, "a");
        session.listen("^sensors/.*");
        session.listen("(unclosed");
        assert_eq!(broker.listen_count("^sensors/.*"), 1);
        assert_eq!(broker.listen_count("(unclosed"), 0);

        session.unlisten("^sensors/.*");
        assert_eq!(broker.listen_count("^sensors/.*"), 0);
    }

    #[tokio::test]
    async fn rpc_routes_to_last_provider() {
        let broker = LocalBroker::new();
        let (mut old, _old_rx) = open(&broker, "old");
        let (mut new, mut new_rx) = open(&broker, "new");
        let (caller, _rx) = open(&broker, "caller");

        assert_eq!(
            caller.make_rpc("water", json!(1)).await,
            Err(BrokerError::NoRpcProvider("water".to_string()))
        );

        old.provide_rpc("water");
        new.provide_rpc("water");
        let call = caller.make_rpc("water", json!({"ml": 200}));
        match new_rx.try_recv() {
            Ok(SessionEvent::RpcRequest {
                payload, response, ..
            }) => response.send(payload["ml"].clone()),
            other => panic!("unexpected {other:?}"),
        }
        assert_eq!(call.await, Ok(json!(200)));

        // unprovide from a session that lost the name is a no-op
        old.unprovide_rpc("water");
        assert!(broker.has_rpc("water"));
    }
}

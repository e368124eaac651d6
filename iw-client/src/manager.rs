use actix::prelude::*;
use futures::{stream, StreamExt};
use iw_registry::{AwaitEvent, Event, Listeners, OnEvent, ServiceHandle, State};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::{collections::HashMap, sync::Arc};
use tokio::{sync::mpsc::unbounded_channel, time::Duration};
use tokio_stream::wrappers::UnboundedReceiverStream;

use crate::{
    broker::{
        same_callback, BrokerConnector, BrokerError, BrokerSession, ConnectionState,
        DataCallback, DataProvider, ListenResponse, RecordKind, RecordRef, RpcCallback,
        SessionEvent,
    },
    channel::{ChannelConnector, ChannelEntry, ChannelProxy, SocketLink},
    ClientError,
};

// Attempt to reconnect 30 seconds after a connection error
const RECONNECT_TIMEOUT: u64 = 30;

const PORT_CONFIG_RECORD: &str = "server/portConfig";

#[derive(Debug, Clone)]
pub struct ClientOptions {
    /// Fixed delay before a reconnect, for both the session and channel
    /// sockets. There is no backoff
    pub reconnect_delay: Duration,
    /// Record holding the broker's [`PortConfig`]
    pub port_config_record: String,
    /// Prefix of the client name until a `Start` names one
    pub friendly_name: Option<String>,
}

impl Default for ClientOptions {
    fn default() -> Self {
        Self {
            reconnect_delay: Duration::from_secs(RECONNECT_TIMEOUT),
            port_config_record: PORT_CONFIG_RECORD.to_string(),
            friendly_name: None,
        }
    }
}

/// Auxiliary ports published by the broker, read once per connection
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PortConfig {
    pub port: u16,
    #[serde(default)]
    pub http_port: Option<u16>,
    pub channels_port: u16,
}

#[derive(Debug, Clone)]
pub enum ClientEvent {
    /// Restoration finished and the port configuration is known
    Connected,
    Disconnected,
}

impl Event for ClientEvent {
    const NAMES: &'static [&'static str] = &["connected", "disconnected"];

    fn name(&self) -> &'static str {
        match self {
            ClientEvent::Connected => "connected",
            ClientEvent::Disconnected => "disconnected",
        }
    }
}

#[derive(Debug, Clone)]
pub struct ClientStatus {
    pub client_name: String,
    pub url: Option<String>,
    pub state: Option<ConnectionState>,
    pub setup_complete: bool,
    pub port_config: Option<PortConfig>,
}

struct Subscription {
    record: Option<RecordRef>,
    kind: RecordKind,
    callbacks: Vec<(Option<String>, DataCallback)>,
}

struct SessionItem {
    generation: u64,
    event: SessionEvent,
}

struct ChannelItem {
    path: String,
    socket: u64,
    // None once the socket closed
    frame: Option<Vec<u8>>,
}

/// Host part of a broker url such as `ws://10.0.0.2:6020/deepstream` or
/// `10.0.0.2:6020`
pub(crate) fn host_of(url: &str) -> &str {
    let rest = url.split_once("://").map_or(url, |(_, rest)| rest);
    let authority = rest.split('/').next().unwrap_or(rest);
    if let Some(end) = authority.strip_prefix('[').and_then(|a| a.find(']')) {
        return &authority[..end + 2];
    }
    authority
        .rsplit_once(':')
        .map_or(authority, |(host, _)| host)
}

/// [`ConnectionManager`] owns the broker session and everything registered
/// through it. Subscriptions, data providers, rpcs and channel paths are
/// kept across connections and restored, in that order, when a new session
/// opens; `connected` is emitted only once that is done and the port
/// configuration has been read. A session that reopens on its own after
/// `Reconnecting` still holds them and is not restored again
pub struct ConnectionManager {
    service: ServiceHandle,
    options: ClientOptions,
    broker: Arc<dyn BrokerConnector>,
    channel_connector: Arc<dyn ChannelConnector>,
    client_name: String,
    url: Option<String>,
    session: Option<Box<dyn BrokerSession>>,
    // bumped per session so events from a closed one are ignored
    generation: u64,
    state: Option<ConnectionState>,
    registrations_live: bool,
    setup_complete: bool,
    reconnect_timer: Option<SpawnHandle>,
    port_config: Option<PortConfig>,
    subscriptions: HashMap<String, Subscription>,
    providers: HashMap<String, Vec<Arc<dyn DataProvider>>>,
    provided_records: HashMap<String, RecordRef>,
    rpcs: HashMap<String, RpcCallback>,
    channels: HashMap<String, ChannelEntry>,
    channel_epoch: u64,
    next_proxy: u64,
    next_socket: u64,
    listeners: Listeners<ClientEvent>,
}

impl ConnectionManager {
    pub fn new(
        service: ServiceHandle,
        broker: Arc<dyn BrokerConnector>,
        channel_connector: Arc<dyn ChannelConnector>,
        options: ClientOptions,
    ) -> Self {
        Self {
            service,
            client_name: Self::client_name(options.friendly_name.as_deref()),
            options,
            broker,
            channel_connector,
            url: None,
            session: None,
            generation: 0,
            state: None,
            registrations_live: false,
            setup_complete: false,
            reconnect_timer: None,
            port_config: None,
            subscriptions: HashMap::new(),
            providers: HashMap::new(),
            provided_records: HashMap::new(),
            rpcs: HashMap::new(),
            channels: HashMap::new(),
            channel_epoch: 0,
            next_proxy: 0,
            next_socket: 0,
            listeners: Listeners::new(),
        }
    }

    fn client_name(friendly_name: Option<&str>) -> String {
        format!(
            "{}-{}",
            friendly_name.unwrap_or("unknown"),
            uuid::Uuid::new_v4()
        )
    }

    fn connected(&self) -> bool {
        self.session.is_some() && self.state == Some(ConnectionState::Open)
    }

    fn connect(&mut self, url: String, ctx: &mut Context<Self>) {
        self.stop_reconnect(ctx);
        if self.session.is_some() {
            self.disconnect(ctx);
        }

        log::info!("Connecting to {url:} as {}", self.client_name);
        self.generation += 1;
        let generation = self.generation;
        let (tx, rx) = unbounded_channel();
        self.session = Some(self.broker.connect(&url, &self.client_name, tx));
        self.url = Some(url);
        ctx.add_stream(
            UnboundedReceiverStream::new(rx).map(move |event| SessionItem { generation, event }),
        );
    }

    fn disconnect(&mut self, ctx: &mut Context<Self>) {
        self.stop_reconnect(ctx);
        self.url = None;

        if let Some(mut session) = self.session.take() {
            // squelch events from the old session
            self.generation += 1;
            session.close();
            for sub in self.subscriptions.values_mut() {
                sub.record = None;
            }
            self.provided_records.clear();
        }
        // registrations and the port config belong to the session, so they
        // are only forgotten with it
        self.registrations_live = false;
        self.setup_complete = false;
        self.port_config = None;
        self.state = None;
    }

    fn reconnect(&mut self, ctx: &mut Context<Self>) {
        if self.session.is_none() || self.reconnect_timer.is_some() {
            // no connection or reconnect already pending
            return;
        }
        let delay = self.options.reconnect_delay;
        self.service.set_state(
            State::Degraded,
            &format!("reconnecting in {}s", delay.as_secs_f32()),
        );
        self.reconnect_timer = Some(ctx.run_later(delay, |act, ctx| {
            act.reconnect_timer = None;
            if let Some(url) = act.url.clone() {
                act.connect(url, ctx);
            }
        }));
    }

    fn stop_reconnect(&mut self, ctx: &mut Context<Self>) {
        if let Some(timer) = self.reconnect_timer.take() {
            ctx.cancel_future(timer);
        }
    }

    fn connection_state(&mut self, state: ConnectionState, ctx: &mut Context<Self>) {
        log::info!("Connection state changed to {state:?}");
        self.state = Some(state);
        let url = self.url.clone().unwrap_or_default();

        match state {
            ConnectionState::Open => {
                self.service
                    .set_state(State::Ready, &format!("connected to server at {url}"));
                self.stop_reconnect(ctx);
                self.after_connect(ctx);
            }
            ConnectionState::Closed => {
                self.service.set_state(State::Inactive, "connection closed");
                self.listeners.emit(ClientEvent::Disconnected);
            }
            ConnectionState::Error => {
                self.service
                    .set_state(State::Fatal, "connection interrupted");
                self.listeners.emit(ClientEvent::Disconnected);
                self.reconnect(ctx);
            }
            ConnectionState::Reconnecting => {
                self.service.set_state(State::Degraded, "reconnecting ...");
            }
            ConnectionState::AwaitingAuthentication => {
                self.service
                    .set_state(State::Busy, &format!("connecting to server at {url}"));
            }
            ConnectionState::Authenticating => {
                self.service.set_state(State::Busy, "logging in ...");
            }
        }
    }

    /// A session that reopens after `Reconnecting` keeps its handles and
    /// registrations; only what is still missing is done again
    fn after_connect(&mut self, ctx: &mut Context<Self>) {
        if !self.registrations_live {
            self.restore_registrations();
        }
        if self.setup_complete {
            self.listeners.emit(ClientEvent::Connected);
        } else {
            self.fetch_port_config(ctx);
        }
    }

    fn restore_registrations(&mut self) {
        let Some(session) = self.session.as_mut() else {
            return;
        };

        for (name, sub) in self.subscriptions.iter_mut() {
            if let Some(stale) = sub.record.take() {
                stale.discard();
            }
            let record = session.record(name, sub.kind);
            for (path, callback) in &sub.callbacks {
                record.subscribe(path.as_deref(), callback.clone(), false);
            }
            sub.record = Some(record);
        }
        for pattern in self.providers.keys() {
            session.listen(pattern);
        }
        for name in self.rpcs.keys() {
            session.provide_rpc(name);
        }
        // anything registered from here on goes straight to the session
        self.registrations_live = true;
    }

    /// Handle onto `name` for a one-off read or write. Reuses the
    /// subscription's handle when there is one; the bool says whether the
    /// caller must discard the handle afterwards
    fn transient_record(&mut self, name: &str) -> Option<(RecordRef, bool)> {
        if let Some(record) = self.subscriptions.get(name).and_then(|s| s.record.clone()) {
            return Some((record, false));
        }
        let session = self.session.as_mut()?;
        Some((session.record(name, RecordKind::Record), true))
    }

    fn fetch_port_config(&mut self, ctx: &mut Context<Self>) {
        let name = self.options.port_config_record.clone();
        let Some((record, owned)) = self.transient_record(&name) else {
            return;
        };
        let generation = self.generation;

        ctx.spawn(record.when_ready().into_actor(self).map(
            move |res, act, ctx| {
                if owned {
                    record.discard();
                }
                if act.generation != generation {
                    return;
                }
                let config = res
                    .map_err(ClientError::from)
                    .and_then(|value| Ok(serde_json::from_value::<PortConfig>(value)?));
                match config {
                    Ok(config) => {
                        log::debug!("Port configuration {config:?}");
                        act.port_config = Some(config);
                        act.open_pending_channels(ctx);
                        act.setup_complete = true;
                        act.listeners.emit(ClientEvent::Connected);
                    }
                    Err(e) => {
                        log::error!("Unable to read port configuration from {name:}: {e:}");
                        act.service
                            .set_state(State::Degraded, "port configuration unavailable");
                        act.service.set_error_diagnostic(&e.to_string());
                    }
                }
            },
        ));
    }

    fn listen_match(
        &mut self,
        pattern: String,
        name: String,
        subscribed: bool,
        response: ListenResponse,
    ) {
        let providers = self.providers.get(&pattern).cloned().unwrap_or_default();
        if subscribed {
            let Some(session) = self.session.as_mut().filter(|_| !providers.is_empty()) else {
                response.reject();
                return;
            };
            let record = session.record(&name, RecordKind::Record);
            for provider in &providers {
                provider.provide(record.clone(), &name);
            }
            if let Some(previous) = self.provided_records.insert(name, record) {
                previous.discard();
            }
            response.accept();
        } else if let Some(record) = self.provided_records.remove(&name) {
            for provider in &providers {
                provider.stop(record.clone(), &name);
            }
            record.discard();
        }
    }

    fn channel_url(&self, path: &str) -> Option<String> {
        let config = self.port_config.as_ref()?;
        let host = host_of(self.url.as_deref()?);
        Some(format!(
            "ws://{host}:{}/{}",
            config.channels_port,
            path.trim_start_matches('/')
        ))
    }

    fn open_pending_channels(&mut self, ctx: &mut Context<Self>) {
        let pending = self
            .channels
            .iter()
            .filter(|(_, entry)| entry.proxy_count() > 0 && !entry.is_open())
            .map(|(path, _)| path.clone())
            .collect::<Vec<_>>();
        for path in pending {
            self.connect_channel(&path, ctx);
        }
    }

    fn connect_channel(&mut self, path: &str, ctx: &mut Context<Self>) {
        let Some(url) = self.channel_url(path) else {
            return;
        };
        let Some(entry) = self.channels.get_mut(path) else {
            return;
        };
        if entry.connecting || entry.is_open() {
            return;
        }
        if let Some(timer) = entry.reconnect.take() {
            ctx.cancel_future(timer);
        }
        entry.connecting = true;

        log::info!("Opening channel socket {url:}");
        let epoch = self.channel_epoch;
        let path = path.to_string();
        ctx.spawn(self.channel_connector.connect(&url).into_actor(self).map(
            move |res, act, ctx| {
                if act.channel_epoch != epoch {
                    return;
                }
                let Some(entry) = act.channels.get_mut(&path) else {
                    // last proxy closed while connecting
                    return;
                };
                entry.connecting = false;
                match res {
                    Ok(socket) if !entry.is_open() => {
                        act.next_socket += 1;
                        let id = act.next_socket;
                        let frames = {
                            let path = path.clone();
                            UnboundedReceiverStream::new(socket.incoming).map(move |data| {
                                ChannelItem {
                                    path: path.clone(),
                                    socket: id,
                                    frame: Some(data),
                                }
                            })
                        };
                        let closed = stream::once(futures::future::ready(ChannelItem {
                            path,
                            socket: id,
                            frame: None,
                        }));
                        let reader = ctx.add_stream(frames.chain(closed));
                        entry.attach(SocketLink {
                            id,
                            outgoing: socket.outgoing,
                            reader,
                        });
                    }
                    // a newer attempt got there first, dropping closes this one
                    Ok(_) => {}
                    Err(e) => {
                        log::error!("Unable to open channel {url:}: {e:}");
                        act.schedule_channel_reconnect(&path, ctx);
                    }
                }
            },
        ));
    }

    fn schedule_channel_reconnect(&mut self, path: &str, ctx: &mut Context<Self>) {
        let delay = self.options.reconnect_delay;
        let Some(entry) = self.channels.get_mut(path) else {
            return;
        };
        if entry.reconnect.is_some() {
            return;
        }
        let path = path.to_string();
        entry.reconnect = Some(ctx.run_later(delay, move |act, ctx| {
            if let Some(entry) = act.channels.get_mut(&path) {
                entry.reconnect = None;
            }
            act.connect_channel(&path, ctx);
        }));
    }

    fn close_channel(&mut self, path: &str, ctx: &mut Context<Self>) {
        let Some(mut entry) = self.channels.remove(path) else {
            return;
        };
        if let Some(timer) = entry.reconnect.take() {
            ctx.cancel_future(timer);
        }
        if let Some(link) = entry.detach() {
            log::debug!("Closing channel socket {path:}");
            ctx.cancel_future(link.reader);
        }
    }

    fn teardown_channels(&mut self, ctx: &mut Context<Self>) {
        self.channel_epoch += 1;
        for entry in self.channels.values_mut() {
            if let Some(timer) = entry.reconnect.take() {
                ctx.cancel_future(timer);
            }
            entry.connecting = false;
            if let Some(link) = entry.detach() {
                ctx.cancel_future(link.reader);
            }
        }
    }

    fn stop(&mut self, ctx: &mut Context<Self>) {
        self.disconnect(ctx);
        self.teardown_channels(ctx);
        self.service.set_state(State::Inactive, "client stopped");
    }
}

impl Actor for ConnectionManager {
    type Context = Context<Self>;

    fn stopped(&mut self, ctx: &mut Self::Context) {
        self.stop(ctx);
        self.service.deregister();
    }
}

impl StreamHandler<SessionItem> for ConnectionManager {
    fn handle(&mut self, item: SessionItem, ctx: &mut Self::Context) {
        if item.generation != self.generation {
            return;
        }
        match item.event {
            SessionEvent::State(state) => self.connection_state(state, ctx),
            SessionEvent::Error {
                message,
                event,
                topic,
            } => {
                log::error!("{event:}: {message:} (topic {topic:})");
            }
            SessionEvent::ListenMatch {
                pattern,
                name,
                subscribed,
                response,
            } => self.listen_match(pattern, name, subscribed, response),
            SessionEvent::RpcRequest {
                name,
                payload,
                response,
            } => match self.rpcs.get(&name) {
                Some(callback) => callback(payload, response),
                None => response.error(&format!("no provider for {name}")),
            },
        }
    }

    // sessions end when they are replaced, nothing to do
    fn finished(&mut self, _ctx: &mut Self::Context) {}
}

impl StreamHandler<ChannelItem> for ConnectionManager {
    fn handle(&mut self, item: ChannelItem, ctx: &mut Self::Context) {
        let Some(entry) = self.channels.get_mut(&item.path) else {
            return;
        };
        if entry.socket.as_ref().map(|link| link.id) != Some(item.socket) {
            return;
        }
        match item.frame {
            Some(data) => entry.deliver(data),
            None => {
                log::warn!("Channel socket for {} closed", item.path);
                entry.detach();
                if entry.proxy_count() > 0 {
                    self.schedule_channel_reconnect(&item.path, ctx);
                } else {
                    self.channels.remove(&item.path);
                }
            }
        }
    }

    fn finished(&mut self, _ctx: &mut Self::Context) {}
}

#[derive(Message)]
#[rtype(result = "()")]
pub struct Start {
    pub url: String,
    pub friendly_name: Option<String>,
}

impl Handler<Start> for ConnectionManager {
    type Result = ();

    fn handle(&mut self, msg: Start, ctx: &mut Self::Context) -> Self::Result {
        let friendly_name = msg.friendly_name.or(self.options.friendly_name.clone());
        self.client_name = Self::client_name(friendly_name.as_deref());
        self.connect(msg.url, ctx);
    }
}

/// Connect to `url` keeping the current client name
#[derive(Message)]
#[rtype(result = "()")]
pub struct Connect(pub String);

impl Handler<Connect> for ConnectionManager {
    type Result = ();

    fn handle(&mut self, msg: Connect, ctx: &mut Self::Context) -> Self::Result {
        self.connect(msg.0, ctx);
    }
}

#[derive(Message)]
#[rtype(result = "()")]
pub struct Stop;

impl Handler<Stop> for ConnectionManager {
    type Result = ();

    fn handle(&mut self, _msg: Stop, ctx: &mut Self::Context) -> Self::Result {
        self.stop(ctx);
    }
}

#[derive(Message)]
#[rtype(result = "()")]
pub struct Subscribe {
    pub name: String,
    pub kind: RecordKind,
    pub path: Option<String>,
    pub callback: DataCallback,
    pub now: bool,
}

impl Handler<Subscribe> for ConnectionManager {
    type Result = ();

    fn handle(&mut self, msg: Subscribe, _ctx: &mut Self::Context) -> Self::Result {
        let sub = self
            .subscriptions
            .entry(msg.name.clone())
            .or_insert_with(|| Subscription {
                record: None,
                kind: msg.kind,
                callbacks: vec![],
            });
        sub.callbacks.push((msg.path.clone(), msg.callback.clone()));

        if !self.registrations_live {
            // queued for the next connect
            return;
        }
        if let Some(session) = self.session.as_mut() {
            let kind = sub.kind;
            let record = sub
                .record
                .get_or_insert_with(|| session.record(&msg.name, kind));
            record.subscribe(msg.path.as_deref(), msg.callback, msg.now);
        }
    }
}

#[derive(Message)]
#[rtype(result = "()")]
pub struct Unsubscribe {
    pub name: String,
    pub callback: DataCallback,
}

impl Handler<Unsubscribe> for ConnectionManager {
    type Result = ();

    fn handle(&mut self, msg: Unsubscribe, _ctx: &mut Self::Context) -> Self::Result {
        let Some(sub) = self.subscriptions.get_mut(&msg.name) else {
            return;
        };
        sub.callbacks
            .retain(|(_, callback)| !same_callback(callback, &msg.callback));
        if let Some(record) = &sub.record {
            record.unsubscribe(&msg.callback);
        }
        if sub.callbacks.is_empty() {
            if let Some(record) = self
                .subscriptions
                .remove(&msg.name)
                .and_then(|sub| sub.record)
            {
                record.discard();
            }
        }
    }
}

#[derive(Message)]
#[rtype(result = "()")]
pub struct ProvideData {
    pub pattern: String,
    pub provider: Arc<dyn DataProvider>,
}

impl Handler<ProvideData> for ConnectionManager {
    type Result = ();

    fn handle(&mut self, msg: ProvideData, _ctx: &mut Self::Context) -> Self::Result {
        let providers = self.providers.entry(msg.pattern.clone()).or_default();
        providers.push(msg.provider);
        if providers.len() > 1 || !self.registrations_live {
            return;
        }
        if let Some(session) = self.session.as_mut() {
            session.listen(&msg.pattern);
        }
    }
}

#[derive(Message)]
#[rtype(result = "()")]
pub struct UnprovideData {
    pub pattern: String,
    pub provider: Arc<dyn DataProvider>,
}

impl Handler<UnprovideData> for ConnectionManager {
    type Result = ();

    fn handle(&mut self, msg: UnprovideData, _ctx: &mut Self::Context) -> Self::Result {
        let Some(providers) = self.providers.get_mut(&msg.pattern) else {
            return;
        };
        providers.retain(|p| !Arc::ptr_eq(p, &msg.provider));
        if !providers.is_empty() {
            return;
        }
        self.providers.remove(&msg.pattern);
        if self.registrations_live {
            if let Some(session) = self.session.as_mut() {
                session.unlisten(&msg.pattern);
            }
        }
    }
}

/// Register `callback` as the provider of rpc `name`, replacing any previous
/// one
#[derive(Message)]
#[rtype(result = "()")]
pub struct ProvideRpc {
    pub name: String,
    pub callback: RpcCallback,
}

impl Handler<ProvideRpc> for ConnectionManager {
    type Result = ();

    fn handle(&mut self, msg: ProvideRpc, _ctx: &mut Self::Context) -> Self::Result {
        self.rpcs.insert(msg.name.clone(), msg.callback);
        if self.registrations_live {
            if let Some(session) = self.session.as_mut() {
                session.provide_rpc(&msg.name);
            }
        }
    }
}

#[derive(Message)]
#[rtype(result = "()")]
pub struct UnprovideRpc(pub String);

impl Handler<UnprovideRpc> for ConnectionManager {
    type Result = ();

    fn handle(&mut self, msg: UnprovideRpc, _ctx: &mut Self::Context) -> Self::Result {
        self.rpcs.remove(&msg.0);
        if self.registrations_live {
            if let Some(session) = self.session.as_mut() {
                session.unprovide_rpc(&msg.0);
            }
        }
    }
}

#[derive(Message)]
#[rtype(result = "Result<Value, ClientError>")]
pub struct MakeRpc {
    pub name: String,
    pub payload: Value,
}

impl Handler<MakeRpc> for ConnectionManager {
    type Result = ResponseFuture<Result<Value, ClientError>>;

    fn handle(&mut self, msg: MakeRpc, _ctx: &mut Self::Context) -> Self::Result {
        let session = self.session.as_ref().filter(|_| self.connected());
        let Some(session) = session else {
            return Box::pin(async { Err(BrokerError::NotConnected.into()) });
        };
        let call = session.make_rpc(&msg.name, msg.payload);
        Box::pin(async move { Ok(call.await?) })
    }
}

/// One-shot read of a record
#[derive(Message)]
#[rtype(result = "Result<Value, ClientError>")]
pub struct GetData(pub String);

impl Handler<GetData> for ConnectionManager {
    type Result = ResponseFuture<Result<Value, ClientError>>;

    fn handle(&mut self, msg: GetData, _ctx: &mut Self::Context) -> Self::Result {
        let name = msg.0;
        let record = self
            .connected()
            .then(|| self.transient_record(&name))
            .flatten();
        let Some((record, owned)) = record else {
            return Box::pin(async { Err(BrokerError::NotConnected.into()) });
        };

        let ready = record.when_ready();
        Box::pin(async move {
            let res = ready.await;
            if owned {
                record.discard();
            }
            res.map_err(|e| {
                log::error!("Failed to get data for record {name:}: {e:}");
                e.into()
            })
        })
    }
}

/// One-shot write of a record, or of `path` within it
#[derive(Message)]
#[rtype(result = "Result<(), ClientError>")]
pub struct SetData {
    pub name: String,
    pub path: Option<String>,
    pub value: Value,
}

impl Handler<SetData> for ConnectionManager {
    type Result = Result<(), ClientError>;

    fn handle(&mut self, msg: SetData, _ctx: &mut Self::Context) -> Self::Result {
        if !self.connected() {
            return Err(BrokerError::NotConnected.into());
        }
        let (record, owned) = self
            .transient_record(&msg.name)
            .ok_or(BrokerError::NotConnected)?;
        record.set(msg.path.as_deref(), msg.value);
        if owned {
            record.discard();
        }
        Ok(())
    }
}

#[derive(Message)]
#[rtype(result = "ChannelProxy")]
pub struct OpenChannel(pub String);

impl Handler<OpenChannel> for ConnectionManager {
    type Result = MessageResult<OpenChannel>;

    fn handle(&mut self, msg: OpenChannel, ctx: &mut Self::Context) -> Self::Result {
        let path = msg.0;
        self.next_proxy += 1;
        let id = self.next_proxy;

        let entry = self
            .channels
            .entry(path.clone())
            .or_insert_with(ChannelEntry::new);
        let events = entry.add_proxy(id);
        let proxy = ChannelProxy::new(&path, id, entry.shared(), events, ctx.address().downgrade());

        if !entry.is_open() && self.setup_complete {
            self.connect_channel(&path, ctx);
        }
        MessageResult(proxy)
    }
}

#[derive(Message)]
#[rtype(result = "()")]
pub struct ChannelSend {
    pub path: String,
    pub data: Vec<u8>,
}

impl Handler<ChannelSend> for ConnectionManager {
    type Result = ();

    fn handle(&mut self, msg: ChannelSend, _ctx: &mut Self::Context) -> Self::Result {
        let sent = self
            .channels
            .get(&msg.path)
            .is_some_and(|entry| entry.send(msg.data));
        if !sent {
            log::warn!("Dropping message on channel {}: not connected", msg.path);
        }
    }
}

#[derive(Message)]
#[rtype(result = "()")]
pub struct CloseProxy {
    pub path: String,
    pub id: u64,
}

impl Handler<CloseProxy> for ConnectionManager {
    type Result = ();

    fn handle(&mut self, msg: CloseProxy, ctx: &mut Self::Context) -> Self::Result {
        let remaining = self
            .channels
            .get_mut(&msg.path)
            .is_some_and(|entry| entry.remove_proxy(msg.id));
        if !remaining {
            self.close_channel(&msg.path, ctx);
        }
    }
}

#[derive(Message)]
#[rtype(result = "ClientStatus")]
pub struct Status;

impl Handler<Status> for ConnectionManager {
    type Result = MessageResult<Status>;

    fn handle(&mut self, _msg: Status, _ctx: &mut Self::Context) -> Self::Result {
        MessageResult(ClientStatus {
            client_name: self.client_name.clone(),
            url: self.url.clone(),
            state: self.state,
            setup_complete: self.setup_complete,
            port_config: self.port_config.clone(),
        })
    }
}

impl Handler<AwaitEvent> for ConnectionManager {
    type Result = ();

    fn handle(&mut self, msg: AwaitEvent, _ctx: &mut Self::Context) -> Self::Result {
        self.listeners.once(msg.name, msg.waiter);
    }
}

impl Handler<OnEvent<ClientEvent>> for ConnectionManager {
    type Result = bool;

    fn handle(&mut self, msg: OnEvent<ClientEvent>, _ctx: &mut Self::Context) -> bool {
        self.listeners.on(&msg.name, msg.listener)
    }
}

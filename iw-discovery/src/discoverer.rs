use actix::prelude::*;
use async_trait::async_trait;
use futures::future::BoxFuture;
use iw_registry::{
    await_event, AwaitEvent, Event, Listener, Listeners, OnEvent, Service, ServiceContext,
    ServiceError, ServiceHandle, State,
};
use serde_json::Value;
use std::{
    net::{IpAddr, SocketAddr},
    sync::Arc,
};
use tokio::net::UdpSocket;

use crate::{
    socket::{bind_broadcast, datagrams, send_datagram, Datagram},
    wire, DiscovererConfig, DiscoveryTimings,
};

/// A broker found on the network: the advertiser's source address and the
/// port it advertised
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Discovered {
    pub address: IpAddr,
    pub port: u16,
}

impl Discovered {
    /// `host:port` form handed to the broker client's connect
    pub fn url(&self) -> String {
        SocketAddr::new(self.address, self.port).to_string()
    }
}

#[derive(Debug, Clone)]
pub enum DiscoveryEvent {
    Discovered(Discovered),
}

impl Event for DiscoveryEvent {
    const NAMES: &'static [&'static str] = &["discovered"];

    fn name(&self) -> &'static str {
        match self {
            DiscoveryEvent::Discovered(_) => "discovered",
        }
    }
}

/// [`Discoverer`] looks for an [`Advertiser`](crate::Advertiser) by
/// broadcasting requests at a fixed interval while resumed
pub struct Discoverer {
    service: ServiceHandle,
    timings: DiscoveryTimings,
    config: Option<DiscovererConfig>,
    socket: Option<Arc<UdpSocket>>,
    reader: Option<SpawnHandle>,
    retry: Option<SpawnHandle>,
    request_timer: Option<SpawnHandle>,
    // set by an explicit pause, survives socket rebinds
    paused: bool,
    epoch: u64,
    listeners: Listeners<DiscoveryEvent>,
}

impl Discoverer {
    pub fn new(service: ServiceHandle, timings: DiscoveryTimings) -> Self {
        Self {
            service,
            timings,
            config: None,
            socket: None,
            reader: None,
            retry: None,
            request_timer: None,
            paused: false,
            epoch: 0,
            listeners: Listeners::new(),
        }
    }

    fn bind(&mut self, ctx: &mut Context<Self>) {
        let Some(config) = &self.config else {
            return;
        };
        self.epoch += 1;
        let epoch = self.epoch;
        let addr = config.listen_addr();

        self.service
            .set_state(State::Busy, &format!("binding discovery socket {addr}"));

        ctx.spawn(
            bind_broadcast(addr)
                .into_actor(self)
                .map(move |res, act, ctx| {
                    if act.epoch != epoch {
                        return;
                    }
                    match res {
                        Ok(socket) => {
                            log::debug!("Discovery listening on {addr:}");
                            act.reader = Some(ctx.add_stream(datagrams(socket.clone(), epoch)));
                            act.socket = Some(socket);
                            if act.paused {
                                act.service.set_state(State::Inactive, "Discovery suspended");
                            } else {
                                act.resume(ctx);
                            }
                        }
                        Err(e) => act.socket_error(e, ctx),
                    }
                }),
        );
    }

    fn broadcast_request(&self) {
        if let (Some(socket), Some(config)) = (&self.socket, &self.config) {
            send_datagram(
                socket.clone(),
                wire::DISCOVERY_REQUEST.to_vec(),
                config.request_target(),
            );
        }
    }

    fn resume(&mut self, ctx: &mut Context<Self>) {
        self.paused = false;
        if self.request_timer.is_some() {
            return;
        }
        let Some(config) = &self.config else {
            return;
        };
        if self.socket.is_none() {
            // picked up once the socket is bound
            return;
        }

        let target = config.request_target();
        self.service.set_state(
            State::Ready,
            &format!("Discovering server via UDP broadcast to {target}"),
        );
        self.request_timer = Some(ctx.run_interval(self.timings.broadcast_interval, |act, _ctx| {
            act.broadcast_request();
        }));
        self.broadcast_request();
    }

    fn pause(&mut self, ctx: &mut Context<Self>) {
        self.paused = true;
        if let Some(timer) = self.request_timer.take() {
            ctx.cancel_future(timer);
        }
        self.service.set_state(State::Inactive, "Discovery suspended");
    }

    fn teardown(&mut self, ctx: &mut Context<Self>) {
        self.epoch += 1;
        if let Some(timer) = self.request_timer.take() {
            ctx.cancel_future(timer);
        }
        if let Some(reader) = self.reader.take() {
            ctx.cancel_future(reader);
        }
        self.socket = None;
    }

    fn socket_error(&mut self, e: std::io::Error, ctx: &mut Context<Self>) {
        log::error!("Discovery socket error {e:}");
        self.service.set_state(State::Fatal, "Socket error");
        self.service.set_error_diagnostic(&e.to_string());
        self.teardown(ctx);

        self.retry = Some(ctx.run_later(self.timings.error_retry, |act, ctx| {
            act.retry = None;
            act.bind(ctx);
        }));
    }

    fn stop(&mut self, ctx: &mut Context<Self>) {
        if let Some(retry) = self.retry.take() {
            ctx.cancel_future(retry);
        }
        self.teardown(ctx);
        self.service.set_state(State::Inactive, "Discovery stopped");
    }
}

impl Actor for Discoverer {
    type Context = Context<Self>;

    fn stopped(&mut self, _ctx: &mut Self::Context) {
        self.service.deregister();
    }
}

impl StreamHandler<Datagram> for Discoverer {
    fn handle(&mut self, item: Datagram, ctx: &mut Self::Context) {
        if item.epoch != self.epoch {
            return;
        }
        match item.result {
            Ok((data, from)) => {
                if let Some(port) = wire::decode_advertisement(&data) {
                    let discovered = Discovered {
                        address: from.ip(),
                        port,
                    };
                    log::info!("Discovered server at {}", discovered.url());
                    self.listeners.emit(DiscoveryEvent::Discovered(discovered));
                }
            }
            Err(e) => self.socket_error(e, ctx),
        }
    }

    fn finished(&mut self, _ctx: &mut Self::Context) {}
}

/// (Re)start discovery. Clears any previous pause
#[derive(Message)]
#[rtype(result = "()")]
pub struct StartDiscovery(pub DiscovererConfig);

impl Handler<StartDiscovery> for Discoverer {
    type Result = ();

    fn handle(&mut self, msg: StartDiscovery, ctx: &mut Self::Context) -> Self::Result {
        if let Some(retry) = self.retry.take() {
            ctx.cancel_future(retry);
        }
        self.teardown(ctx);
        self.paused = false;
        self.config = Some(msg.0);
        self.bind(ctx);
    }
}

#[derive(Message)]
#[rtype(result = "()")]
pub struct StopDiscovery;

impl Handler<StopDiscovery> for Discoverer {
    type Result = ();

    fn handle(&mut self, _msg: StopDiscovery, ctx: &mut Self::Context) -> Self::Result {
        self.stop(ctx);
    }
}

/// Stop broadcasting requests but keep the socket
#[derive(Message)]
#[rtype(result = "()")]
pub struct PauseDiscovery;

impl Handler<PauseDiscovery> for Discoverer {
    type Result = ();

    fn handle(&mut self, _msg: PauseDiscovery, ctx: &mut Self::Context) -> Self::Result {
        self.pause(ctx);
    }
}

#[derive(Message)]
#[rtype(result = "()")]
pub struct ResumeDiscovery;

impl Handler<ResumeDiscovery> for Discoverer {
    type Result = ();

    fn handle(&mut self, _msg: ResumeDiscovery, ctx: &mut Self::Context) -> Self::Result {
        self.resume(ctx);
    }
}

impl Handler<AwaitEvent> for Discoverer {
    type Result = ();

    fn handle(&mut self, msg: AwaitEvent, _ctx: &mut Self::Context) -> Self::Result {
        self.listeners.once(msg.name, msg.waiter);
    }
}

impl Handler<OnEvent<DiscoveryEvent>> for Discoverer {
    type Result = bool;

    fn handle(&mut self, msg: OnEvent<DiscoveryEvent>, _ctx: &mut Self::Context) -> bool {
        self.listeners.on(&msg.name, msg.listener)
    }
}

/// Service handle onto a [`Discoverer`] actor
#[derive(Clone)]
pub struct Discovery {
    addr: Addr<Discoverer>,
}

impl Discovery {
    pub const SERVICE_TYPE: &'static str = "udp-discovery";

    pub fn new(context: &ServiceContext, name: Option<&str>, timings: DiscoveryTimings) -> Self {
        let service = context.register(Self::SERVICE_TYPE, State::Inactive, name);
        Self {
            addr: Discoverer::new(service, timings).start(),
        }
    }

    pub fn addr(&self) -> &Addr<Discoverer> {
        &self.addr
    }

    pub fn pause(&self) {
        self.addr.do_send(PauseDiscovery);
    }

    pub fn resume(&self) {
        self.addr.do_send(ResumeDiscovery);
    }

    pub fn on(&self, event: &str, listener: Listener<DiscoveryEvent>) {
        self.addr.do_send(OnEvent {
            name: event.to_string(),
            listener,
        });
    }

    /// Shorthand for a `discovered` listener that only cares about the result
    pub fn on_discovered(&self, f: impl Fn(Discovered) + Send + Sync + 'static) {
        self.on(
            "discovered",
            Arc::new(move |event: &DiscoveryEvent| match event {
                DiscoveryEvent::Discovered(found) => f(*found),
            }),
        );
    }
}

#[async_trait]
impl Service for Discovery {
    fn service_type(&self) -> &'static str {
        Self::SERVICE_TYPE
    }

    async fn start(&self, config: Value) -> Result<(), ServiceError> {
        let config: DiscovererConfig = serde_json::from_value(config)?;
        self.addr.send(StartDiscovery(config)).await?;
        Ok(())
    }

    async fn stop(&self) -> Result<(), ServiceError> {
        self.addr.send(StopDiscovery).await?;
        Ok(())
    }

    fn wait_for(&self, event: &str) -> BoxFuture<'static, Result<(), ServiceError>> {
        await_event::<DiscoveryEvent>(event, |name, waiter| {
            self.addr.do_send(AwaitEvent { name, waiter })
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{Advertisement, AdvertiserConfig, StartAdvertising};
    use std::net::Ipv4Addr;
    use tokio::{
        sync::mpsc::unbounded_channel,
        time::{timeout, Duration},
    };

    fn fast() -> DiscoveryTimings {
        DiscoveryTimings {
            broadcast_interval: Duration::from_millis(50),
            error_retry: Duration::from_millis(100),
        }
    }

    fn advertiser_config(request_port: u16, advertised_port: u16) -> AdvertiserConfig {
        AdvertiserConfig {
            advertised_port,
            request_port,
            request_address: Ipv4Addr::LOCALHOST,
            broadcast_port: None,
            broadcast_address: Ipv4Addr::LOCALHOST,
        }
    }

    async fn discovery_entry(context: &ServiceContext) -> (State, String) {
        let snapshot = context.snapshot().await.unwrap();
        let entry = snapshot
            .into_iter()
            .find(|e| e.service_type == Discovery::SERVICE_TYPE)
            .unwrap();
        (entry.state, entry.message)
    }

    fn discoverer_config(request_port: u16) -> DiscovererConfig {
        DiscovererConfig {
            request_port,
            request_address: Ipv4Addr::LOCALHOST,
            broadcast_port: None,
        }
    }

    #[actix::test]
    async fn finds_advertiser_started_later() {
        let context = ServiceContext::init();
        let discovery = Discovery::new(&context, None, fast());
        let (tx, mut rx) = unbounded_channel();
        discovery.on_discovered(move |found| {
            tx.send(found).ok();
        });
        discovery
            .addr()
            .send(StartDiscovery(discoverer_config(47410)))
            .await
            .unwrap();

        let advertisement = Advertisement::new(&context, None, fast());
        advertisement
            .addr()
            .send(StartAdvertising(advertiser_config(47410, 6020)))
            .await
            .unwrap();

        let found = timeout(Duration::from_secs(2), rx.recv())
            .await
            .unwrap()
            .unwrap();
        assert_eq!(found.port, 6020);
        assert_eq!(found.url(), "127.0.0.1:6020");
    }

    #[actix::test]
    async fn finds_advertiser_already_running() {
        let context = ServiceContext::init();
        let advertisement = Advertisement::new(&context, None, fast());
        let listening = advertisement.wait_for("listening");
        advertisement
            .addr()
            .send(StartAdvertising(advertiser_config(47420, 7001)))
            .await
            .unwrap();
        listening.await.unwrap();

        let discovery = Discovery::new(&context, None, fast());
        let discovered = discovery.wait_for("discovered");
        discovery
            .start(serde_json::json!({"requestPort": 47420, "requestAddress": "127.0.0.1"}))
            .await
            .unwrap();
        timeout(Duration::from_secs(2), discovered)
            .await
            .unwrap()
            .unwrap();
    }

    #[actix::test]
    async fn pause_stops_requests_until_resumed() {
        let context = ServiceContext::init();
        let requests = UdpSocket::bind("127.0.0.1:47430").await.unwrap();
        let discovery = Discovery::new(&context, None, fast());
        discovery
            .addr()
            .send(StartDiscovery(discoverer_config(47430)))
            .await
            .unwrap();

        let mut buffer = [0u8; 64];
        let (len, _) = timeout(Duration::from_secs(2), requests.recv_from(&mut buffer))
            .await
            .unwrap()
            .unwrap();
        assert!(wire::is_discovery_request(&buffer[..len]));

        discovery.pause();
        assert_eq!(
            discovery_entry(&context).await,
            (State::Inactive, "Discovery suspended".to_string())
        );

        // drain anything sent before the pause landed
        while timeout(Duration::from_millis(120), requests.recv_from(&mut buffer))
            .await
            .is_ok()
        {}

        discovery.resume();
        timeout(Duration::from_secs(2), requests.recv_from(&mut buffer))
            .await
            .unwrap()
            .unwrap();
        assert_eq!(discovery_entry(&context).await.0, State::Ready);
    }

    #[actix::test]
    async fn pause_is_reported_without_a_running_timer() {
        let context = ServiceContext::init();
        let discovery = Discovery::new(&context, None, fast());
        discovery.pause();
        assert_eq!(
            discovery_entry(&context).await,
            (State::Inactive, "Discovery suspended".to_string())
        );
    }

    #[actix::test]
    async fn pause_before_bind_is_kept() {
        let context = ServiceContext::init();
        let discovery = Discovery::new(&context, None, fast());
        discovery
            .addr()
            .send(StartDiscovery(discoverer_config(47440)))
            .await
            .unwrap();
        discovery.pause();

        tokio::time::sleep(Duration::from_millis(100)).await;
        assert_eq!(
            discovery_entry(&context).await,
            (State::Inactive, "Discovery suspended".to_string())
        );
    }

    #[actix::test]
    async fn foreign_datagrams_are_ignored() {
        let context = ServiceContext::init();
        let discovery = Discovery::new(&context, None, fast());
        let (tx, mut rx) = unbounded_channel();
        discovery.on_discovered(move |found| {
            tx.send(found).ok();
        });
        discovery
            .addr()
            .send(StartDiscovery(discoverer_config(47450)))
            .await
            .unwrap();
        tokio::time::sleep(Duration::from_millis(50)).await;

        let sender = UdpSocket::bind("127.0.0.1:0").await.unwrap();
        sender
            .send_to(b"iw-advertisement\x01", "127.0.0.1:47451")
            .await
            .unwrap();
        sender
            .send_to(&wire::encode_advertisement(9000), "127.0.0.1:47451")
            .await
            .unwrap();

        let found = timeout(Duration::from_secs(2), rx.recv())
            .await
            .unwrap()
            .unwrap();
        assert_eq!(found.port, 9000);
        assert!(rx.try_recv().is_err());
    }
}

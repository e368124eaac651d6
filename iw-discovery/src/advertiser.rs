use actix::prelude::*;
use async_trait::async_trait;
use futures::future::BoxFuture;
use iw_registry::{
    await_event, AwaitEvent, Event, Listener, Listeners, OnEvent, Service, ServiceContext,
    ServiceError, ServiceHandle, State,
};
use serde_json::Value;
use std::{net::SocketAddr, sync::Arc};
use tokio::net::UdpSocket;

use crate::{
    socket::{bind_broadcast, datagrams, send_datagram, Datagram},
    wire, AdvertiserConfig, DiscoveryTimings,
};

#[derive(Debug, Clone)]
pub enum AdvertiserEvent {
    /// The request socket is bound and the unsolicited advertisement was sent
    Listening(SocketAddr),
}

impl Event for AdvertiserEvent {
    const NAMES: &'static [&'static str] = &["listening"];

    fn name(&self) -> &'static str {
        match self {
            AdvertiserEvent::Listening(_) => "listening",
        }
    }
}

/// [`Advertiser`] answers discovery requests on behalf of the broker. It
/// owns its socket exclusively; the only way in is through messages
pub struct Advertiser {
    service: ServiceHandle,
    timings: DiscoveryTimings,
    config: Option<AdvertiserConfig>,
    socket: Option<Arc<UdpSocket>>,
    reader: Option<SpawnHandle>,
    retry: Option<SpawnHandle>,
    // bumped on every bind and teardown
    epoch: u64,
    listeners: Listeners<AdvertiserEvent>,
}

impl Advertiser {
    pub fn new(service: ServiceHandle, timings: DiscoveryTimings) -> Self {
        Self {
            service,
            timings,
            config: None,
            socket: None,
            reader: None,
            retry: None,
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
                        // stopped or restarted while binding
                        return;
                    }
                    match res {
                        Ok(socket) => act.listening(socket, ctx),
                        Err(e) => act.socket_error(e, ctx),
                    }
                }),
        );
    }

    fn listening(&mut self, socket: Arc<UdpSocket>, ctx: &mut Context<Self>) {
        let Some(config) = self.config.clone() else {
            return;
        };
        self.reader = Some(ctx.add_stream(datagrams(socket.clone(), self.epoch)));
        self.socket = Some(socket);

        let addr = config.listen_addr();
        self.service.set_state(
            State::Ready,
            &format!("Waiting for discovery messages on {addr}"),
        );

        let target = config.broadcast_target();
        log::info!("Sending advertisement once via broadcast to {target:}");
        self.advertise(target);
        self.listeners.emit(AdvertiserEvent::Listening(addr));
    }

    fn advertise(&self, target: SocketAddr) {
        if let (Some(socket), Some(config)) = (&self.socket, &self.config) {
            let packet = wire::encode_advertisement(config.advertised_port);
            send_datagram(socket.clone(), packet.to_vec(), target);
        }
    }

    fn teardown(&mut self, ctx: &mut Context<Self>) {
        self.epoch += 1;
        if let Some(reader) = self.reader.take() {
            ctx.cancel_future(reader);
        }
        self.socket = None;
    }

    fn socket_error(&mut self, e: std::io::Error, ctx: &mut Context<Self>) {
        log::error!("Advertisement socket error {e:}");
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
        self.service
            .set_state(State::Inactive, "Advertisement stopped");
    }
}

impl Actor for Advertiser {
    type Context = Context<Self>;

    fn stopped(&mut self, _ctx: &mut Self::Context) {
        self.service.deregister();
    }
}

impl StreamHandler<Datagram> for Advertiser {
    fn handle(&mut self, item: Datagram, ctx: &mut Self::Context) {
        if item.epoch != self.epoch {
            return;
        }
        match item.result {
            Ok((data, from)) => {
                if wire::is_discovery_request(&data) {
                    log::debug!("Got iw-discovery message from {from:}");
                    self.advertise(from);
                }
            }
            Err(e) => self.socket_error(e, ctx),
        }
    }

    // the reader stream only ends after an error, handled above
    fn finished(&mut self, _ctx: &mut Self::Context) {}
}

/// (Re)start advertising with the given config
#[derive(Message)]
#[rtype(result = "()")]
pub struct StartAdvertising(pub AdvertiserConfig);

impl Handler<StartAdvertising> for Advertiser {
    type Result = ();

    fn handle(&mut self, msg: StartAdvertising, ctx: &mut Self::Context) -> Self::Result {
        if let Some(retry) = self.retry.take() {
            ctx.cancel_future(retry);
        }
        self.teardown(ctx);
        self.config = Some(msg.0);
        self.bind(ctx);
    }
}

#[derive(Message)]
#[rtype(result = "()")]
pub struct StopAdvertising;

impl Handler<StopAdvertising> for Advertiser {
    type Result = ();

    fn handle(&mut self, _msg: StopAdvertising, ctx: &mut Self::Context) -> Self::Result {
        self.stop(ctx);
    }
}

impl Handler<AwaitEvent> for Advertiser {
    type Result = ();

    fn handle(&mut self, msg: AwaitEvent, _ctx: &mut Self::Context) -> Self::Result {
        self.listeners.once(msg.name, msg.waiter);
    }
}

impl Handler<OnEvent<AdvertiserEvent>> for Advertiser {
    type Result = bool;

    fn handle(&mut self, msg: OnEvent<AdvertiserEvent>, _ctx: &mut Self::Context) -> bool {
        self.listeners.on(&msg.name, msg.listener)
    }
}

/// Service handle onto an [`Advertiser`] actor
#[derive(Clone)]
pub struct Advertisement {
    addr: Addr<Advertiser>,
}

impl Advertisement {
    pub const SERVICE_TYPE: &'static str = "udp-advertisement";

    pub fn new(context: &ServiceContext, name: Option<&str>, timings: DiscoveryTimings) -> Self {
        let service = context.register(Self::SERVICE_TYPE, State::Inactive, name);
        Self {
            addr: Advertiser::new(service, timings).start(),
        }
    }

    pub fn addr(&self) -> &Addr<Advertiser> {
        &self.addr
    }

    pub fn on(&self, event: &str, listener: Listener<AdvertiserEvent>) {
        self.addr.do_send(OnEvent {
            name: event.to_string(),
            listener,
        });
    }
}

#[async_trait]
impl Service for Advertisement {
    fn service_type(&self) -> &'static str {
        Self::SERVICE_TYPE
    }

    async fn start(&self, config: Value) -> Result<(), ServiceError> {
        let config: AdvertiserConfig = serde_json::from_value(config)?;
        self.addr.send(StartAdvertising(config)).await?;
        Ok(())
    }

    async fn stop(&self) -> Result<(), ServiceError> {
        self.addr.send(StopAdvertising).await?;
        Ok(())
    }

    fn wait_for(&self, event: &str) -> BoxFuture<'static, Result<(), ServiceError>> {
        await_event::<AdvertiserEvent>(event, |name, waiter| {
            self.addr.do_send(AwaitEvent { name, waiter })
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::net::Ipv4Addr;
    use tokio::time::{timeout, Duration};

    fn loopback_config(request_port: u16) -> AdvertiserConfig {
        AdvertiserConfig {
            advertised_port: 6020,
            request_port,
            request_address: Ipv4Addr::LOCALHOST,
            broadcast_port: Some(request_port + 1),
            broadcast_address: Ipv4Addr::LOCALHOST,
        }
    }

    #[actix::test]
    async fn unsolicited_advertisement_on_bind() {
        let context = ServiceContext::init();
        let listener = UdpSocket::bind("127.0.0.1:47311").await.unwrap();
        let advertisement = Advertisement::new(&context, None, DiscoveryTimings::default());

        let listening = advertisement.wait_for("listening");
        advertisement
            .addr()
            .send(StartAdvertising(loopback_config(47310)))
            .await
            .unwrap();
        listening.await.unwrap();

        let mut buffer = [0u8; 64];
        let (len, from) = timeout(Duration::from_secs(2), listener.recv_from(&mut buffer))
            .await
            .unwrap()
            .unwrap();
        assert_eq!(wire::decode_advertisement(&buffer[..len]), Some(6020));
        assert_eq!(from.port(), 47310);

        let entry = context.snapshot().await.unwrap().remove(0);
        assert_eq!(entry.state, State::Ready);
    }

    #[actix::test]
    async fn answers_exact_requests_only() {
        let context = ServiceContext::init();
        let advertisement = Advertisement::new(&context, None, DiscoveryTimings::default());
        let listening = advertisement.wait_for("listening");
        advertisement
            .start(serde_json::json!({
                "advertisedPort": 7000,
                "requestPort": 47320,
                "requestAddress": "127.0.0.1",
                "broadcastPort": 47329,
                "broadcastAddress": "127.0.0.1",
            }))
            .await
            .unwrap();
        listening.await.unwrap();

        let client = UdpSocket::bind("127.0.0.1:0").await.unwrap();
        client.send_to(b"iw-discoveryx", "127.0.0.1:47320").await.unwrap();
        client.send_to(b"iw-discovery", "127.0.0.1:47320").await.unwrap();

        let mut buffer = [0u8; 64];
        let (len, _) = timeout(Duration::from_secs(2), client.recv_from(&mut buffer))
            .await
            .unwrap()
            .unwrap();
        assert_eq!(wire::decode_advertisement(&buffer[..len]), Some(7000));

        // only one reply for the two datagrams
        let second = timeout(Duration::from_millis(200), client.recv_from(&mut buffer)).await;
        assert!(second.is_err());
    }

    #[actix::test]
    async fn bind_failure_retries_after_delay() {
        let context = ServiceContext::init();
        let squatter = UdpSocket::bind("127.0.0.1:47340").await.unwrap();
        let timings = DiscoveryTimings {
            error_retry: Duration::from_millis(100),
            ..Default::default()
        };
        let advertisement = Advertisement::new(&context, None, timings);

        let listening = advertisement.wait_for("listening");
        advertisement
            .addr()
            .send(StartAdvertising(loopback_config(47340)))
            .await
            .unwrap();

        tokio::time::sleep(Duration::from_millis(50)).await;
        let entry = context.snapshot().await.unwrap().remove(0);
        assert_eq!(entry.state, State::Fatal);

        drop(squatter);
        timeout(Duration::from_secs(2), listening)
            .await
            .unwrap()
            .unwrap();
    }

    #[actix::test]
    async fn stop_cancels_pending_rebind() {
        let context = ServiceContext::init();
        let _squatter = UdpSocket::bind("127.0.0.1:47350").await.unwrap();
        let timings = DiscoveryTimings {
            error_retry: Duration::from_millis(50),
            ..Default::default()
        };
        let advertisement = Advertisement::new(&context, None, timings);
        advertisement
            .addr()
            .send(StartAdvertising(loopback_config(47350)))
            .await
            .unwrap();
        tokio::time::sleep(Duration::from_millis(20)).await;
        advertisement.stop().await.unwrap();

        tokio::time::sleep(Duration::from_millis(150)).await;
        let entry = context.snapshot().await.unwrap().remove(0);
        assert_eq!(entry.state, State::Inactive);
    }
}

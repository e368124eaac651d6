use actix::prelude::*;
use async_trait::async_trait;
use futures::future::BoxFuture;
use iw_registry::{
    await_event, AwaitEvent, Listener, OnEvent, Service, ServiceContext, ServiceError, State,
};
use serde::Deserialize;
use serde_json::Value;
use std::sync::Arc;

use crate::{
    broker::{BrokerConnector, DataCallback, DataProvider, RecordKind, RpcCallback},
    channel::{ChannelConnector, ChannelProxy},
    manager::{
        ClientEvent, ClientOptions, ClientStatus, Connect, ConnectionManager, GetData, MakeRpc,
        OpenChannel, ProvideData, ProvideRpc, SetData, Start, Status, Stop, Subscribe,
        UnprovideData, UnprovideRpc, Unsubscribe,
    },
    ClientError,
};

/// `broker-client` component config
#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ClientConfig {
    pub url: String,
    #[serde(default)]
    pub friendly_name: Option<String>,
}

/// Cheap handle onto a [`ConnectionManager`]
#[derive(Clone)]
pub struct BrokerClient {
    addr: Addr<ConnectionManager>,
}

impl BrokerClient {
    pub const SERVICE_TYPE: &'static str = "broker-client";

    pub fn new(
        context: &ServiceContext,
        name: Option<&str>,
        broker: Arc<dyn BrokerConnector>,
        channels: Arc<dyn ChannelConnector>,
        options: ClientOptions,
    ) -> Self {
        let service = context.register(Self::SERVICE_TYPE, State::Inactive, name);
        Self {
            addr: ConnectionManager::new(service, broker, channels, options).start(),
        }
    }

    pub fn addr(&self) -> &Addr<ConnectionManager> {
        &self.addr
    }

    /// Connect (or reconnect) to `url`, e.g. one found by discovery
    pub fn connect(&self, url: &str) {
        self.addr.do_send(Connect(url.to_string()));
    }

    pub async fn subscribe(
        &self,
        name: &str,
        callback: DataCallback,
        path: Option<&str>,
        now: bool,
    ) -> Result<(), ClientError> {
        self.addr
            .send(Subscribe {
                name: name.to_string(),
                kind: RecordKind::Record,
                path: path.map(str::to_string),
                callback,
                now,
            })
            .await?;
        Ok(())
    }

    pub async fn subscribe_list(
        &self,
        name: &str,
        callback: DataCallback,
        now: bool,
    ) -> Result<(), ClientError> {
        self.addr
            .send(Subscribe {
                name: name.to_string(),
                kind: RecordKind::List,
                path: None,
                callback,
                now,
            })
            .await?;
        Ok(())
    }

    pub async fn unsubscribe(
        &self,
        name: &str,
        callback: &DataCallback,
    ) -> Result<(), ClientError> {
        self.addr
            .send(Unsubscribe {
                name: name.to_string(),
                callback: callback.clone(),
            })
            .await?;
        Ok(())
    }

    pub async fn provide_data(
        &self,
        pattern: &str,
        provider: Arc<dyn DataProvider>,
    ) -> Result<(), ClientError> {
        self.addr
            .send(ProvideData {
                pattern: pattern.to_string(),
                provider,
            })
            .await?;
        Ok(())
    }

    pub async fn unprovide_data(
        &self,
        pattern: &str,
        provider: &Arc<dyn DataProvider>,
    ) -> Result<(), ClientError> {
        self.addr
            .send(UnprovideData {
                pattern: pattern.to_string(),
                provider: provider.clone(),
            })
            .await?;
        Ok(())
    }

    pub async fn provide_rpc(&self, name: &str, callback: RpcCallback) -> Result<(), ClientError> {
        self.addr
            .send(ProvideRpc {
                name: name.to_string(),
                callback,
            })
            .await?;
        Ok(())
    }

    pub async fn unprovide_rpc(&self, name: &str) -> Result<(), ClientError> {
        self.addr.send(UnprovideRpc(name.to_string())).await?;
        Ok(())
    }

    pub async fn make_rpc(&self, name: &str, payload: Value) -> Result<Value, ClientError> {
        self.addr
            .send(MakeRpc {
                name: name.to_string(),
                payload,
            })
            .await?
    }

    pub async fn get_data(&self, name: &str) -> Result<Value, ClientError> {
        self.addr.send(GetData(name.to_string())).await?
    }

    pub async fn set_data(
        &self,
        name: &str,
        path: Option<&str>,
        value: Value,
    ) -> Result<(), ClientError> {
        self.addr
            .send(SetData {
                name: name.to_string(),
                path: path.map(str::to_string),
                value,
            })
            .await?
    }

    /// Replace a whole record without waiting. Dropped while disconnected
    pub fn publish(&self, name: &str, value: Value) {
        self.addr.do_send(SetData {
            name: name.to_string(),
            path: None,
            value,
        });
    }

    pub async fn open_channel(&self, path: &str) -> Result<ChannelProxy, ClientError> {
        Ok(self.addr.send(OpenChannel(path.to_string())).await?)
    }

    pub async fn status(&self) -> Result<ClientStatus, ClientError> {
        Ok(self.addr.send(Status).await?)
    }

    pub fn on(&self, event: &str, listener: Listener<ClientEvent>) {
        self.addr.do_send(OnEvent {
            name: event.to_string(),
            listener,
        });
    }
}

#[async_trait]
impl Service for BrokerClient {
    fn service_type(&self) -> &'static str {
        Self::SERVICE_TYPE
    }

    async fn start(&self, config: Value) -> Result<(), ServiceError> {
        let config: ClientConfig = serde_json::from_value(config)?;
        self.addr
            .send(Start {
                url: config.url,
                friendly_name: config.friendly_name,
            })
            .await?;
        Ok(())
    }

    async fn stop(&self) -> Result<(), ServiceError> {
        self.addr.send(Stop).await?;
        Ok(())
    }

    /// Restarts against the new url
    async fn reconfigure(&self, config: Value) -> Result<bool, ServiceError> {
        self.start(config).await?;
        Ok(true)
    }

    fn wait_for(&self, event: &str) -> BoxFuture<'static, Result<(), ServiceError>> {
        await_event::<ClientEvent>(event, |name, waiter| {
            self.addr.do_send(AwaitEvent { name, waiter })
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        broker::RecordRef, channel::ChannelSocket, BrokerError, ChannelError, ChannelEvent,
        ConnectionState, LocalBroker, RpcResponse,
    };
    use futures::FutureExt;
    use serde_json::json;
    use std::sync::Mutex;
    use tokio::{
        sync::mpsc::{unbounded_channel, UnboundedReceiver, UnboundedSender},
        time::{sleep, timeout, Duration},
    };

    /// Server end of one channel socket opened through [`MemoryChannels`]
    struct ServerEnd {
        url: String,
        to_client: UnboundedSender<Vec<u8>>,
        from_client: UnboundedReceiver<Vec<u8>>,
    }

    #[derive(Clone, Default)]
    struct MemoryChannels {
        accepted: Arc<Mutex<Vec<ServerEnd>>>,
    }

    impl MemoryChannels {
        fn take(&self) -> Vec<ServerEnd> {
            std::mem::take(&mut *self.accepted.lock().unwrap())
        }
    }

    impl ChannelConnector for MemoryChannels {
        fn connect(&self, url: &str) -> BoxFuture<'static, Result<ChannelSocket, ChannelError>> {
            let (outgoing, from_client) = unbounded_channel();
            let (to_client, incoming) = unbounded_channel();
            self.accepted.lock().unwrap().push(ServerEnd {
                url: url.to_string(),
                to_client,
                from_client,
            });
            futures::future::ready(Ok(ChannelSocket { outgoing, incoming })).boxed()
        }
    }

    fn fast() -> ClientOptions {
        ClientOptions {
            reconnect_delay: Duration::from_millis(50),
            ..Default::default()
        }
    }

    fn broker_with_ports() -> LocalBroker {
        let broker = LocalBroker::new();
        broker.set(
            "server/portConfig",
            None,
            json!({"port": 6020, "httpPort": 8080, "channelsPort": 6021}),
        );
        broker
    }

    fn client(
        context: &ServiceContext,
        broker: &LocalBroker,
        channels: &MemoryChannels,
    ) -> BrokerClient {
        BrokerClient::new(
            context,
            None,
            Arc::new(broker.clone()),
            Arc::new(channels.clone()),
            fast(),
        )
    }

    /// Client whose reconnect timer never fires within a test, so only the
    /// broker decides when a session reopens
    fn patient_client(context: &ServiceContext, broker: &LocalBroker) -> BrokerClient {
        BrokerClient::new(
            context,
            None,
            Arc::new(broker.clone()),
            Arc::new(MemoryChannels::default()),
            ClientOptions {
                reconnect_delay: Duration::from_secs(30),
                ..Default::default()
            },
        )
    }

    fn recorder() -> (DataCallback, Arc<Mutex<Vec<Value>>>) {
        let seen = Arc::new(Mutex::new(vec![]));
        let callback: DataCallback = {
            let seen = seen.clone();
            Arc::new(move |v: Value| seen.lock().unwrap().push(v))
        };
        (callback, seen)
    }

    async fn start(client: &BrokerClient, name: &str) {
        let connected = client.wait_for("connected");
        client
            .start(json!({"url": "127.0.0.1:6020", "friendlyName": name}))
            .await
            .unwrap();
        timeout(Duration::from_secs(2), connected)
            .await
            .unwrap()
            .unwrap();
    }

    async fn state_of(context: &ServiceContext) -> State {
        context.snapshot().await.unwrap()[0].state
    }

    #[actix::test]
    async fn connects_and_logs_in_with_friendly_name() {
        let context = ServiceContext::init();
        let broker = broker_with_ports();
        let client = client(&context, &broker, &MemoryChannels::default());
        start(&client, "kitchen").await;

        let status = client.status().await.unwrap();
        assert_eq!(status.state, Some(ConnectionState::Open));
        assert!(status.setup_complete);
        assert_eq!(status.port_config.unwrap().channels_port, 6021);
        assert!(broker.client_names()[0].starts_with("kitchen-"));
        assert_eq!(state_of(&context).await, State::Ready);
    }

    #[actix::test]
    async fn subscriptions_survive_reconnects() {
        let context = ServiceContext::init();
        let broker = broker_with_ports();
        let client = client(&context, &broker, &MemoryChannels::default());
        start(&client, "a").await;

        let (callback, seen) = recorder();
        client
            .subscribe("plants/basil", callback.clone(), Some("moisture"), false)
            .await
            .unwrap();
        broker.set("plants/basil", Some("moisture"), json!(30));

        for round in 0..3 {
            let connected = client.wait_for("connected");
            broker.interrupt();
            timeout(Duration::from_secs(2), connected)
                .await
                .unwrap()
                .unwrap();
            assert_eq!(broker.live_handles("plants/basil"), 1);
            assert_eq!(broker.subscriber_count("plants/basil"), 1);
            broker.set("plants/basil", Some("moisture"), json!(40 + round));
        }

        assert_eq!(
            *seen.lock().unwrap(),
            vec![json!(30), json!(40), json!(41), json!(42)]
        );

        client.unsubscribe("plants/basil", &callback).await.unwrap();
        assert_eq!(broker.live_handles("plants/basil"), 0);
    }

    #[actix::test]
    async fn unreachable_broker_is_retried_and_queued_work_applied() {
        let context = ServiceContext::init();
        let broker = broker_with_ports();
        broker.set_reachable(false);
        let client = client(&context, &broker, &MemoryChannels::default());

        let (callback, seen) = recorder();
        client
            .subscribe("lights", callback, None, true)
            .await
            .unwrap();
        client
            .start(json!({"url": "127.0.0.1:6020"}))
            .await
            .unwrap();
        sleep(Duration::from_millis(20)).await;
        assert_eq!(state_of(&context).await, State::Degraded);
        assert!(matches!(
            client.get_data("lights").await,
            Err(ClientError::Broker(BrokerError::NotConnected))
        ));

        let connected = client.wait_for("connected");
        broker.set_reachable(true);
        timeout(Duration::from_secs(2), connected)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(state_of(&context).await, State::Ready);

        broker.set("lights", None, json!({"on": true}));
        assert_eq!(*seen.lock().unwrap(), vec![json!({"on": true})]);
    }

    #[actix::test]
    async fn calls_while_disconnected_fail_immediately() {
        let context = ServiceContext::init();
        let client = client(&context, &LocalBroker::new(), &MemoryChannels::default());
        assert!(matches!(
            client.make_rpc("water", json!({})).await,
            Err(ClientError::Broker(BrokerError::NotConnected))
        ));
        assert!(matches!(
            client.set_data("x", None, json!(1)).await,
            Err(ClientError::Broker(BrokerError::NotConnected))
        ));
    }

    struct Soil;

    impl DataProvider for Soil {
        fn provide(&self, record: RecordRef, name: &str) {
            record.set(Some("source"), json!(name));
        }

        fn stop(&self, record: RecordRef, _name: &str) {
            record.set(Some("source"), Value::Null);
        }
    }

    #[actix::test]
    async fn providers_and_rpcs_serve_other_clients() {
        let context = ServiceContext::init();
        let broker = broker_with_ports();
        let channels = MemoryChannels::default();
        let provider = client(&context, &broker, &channels);
        let consumer = client(&context, &broker, &channels);

        let soil: Arc<dyn DataProvider> = Arc::new(Soil);
        provider.provide_data("^sensors/.*", soil.clone()).await.unwrap();
        provider
            .provide_rpc(
                "water",
                Arc::new(|payload: Value, response: RpcResponse| {
                    response.send(json!({"ml": payload["ml"]}))
                }),
            )
            .await
            .unwrap();
        start(&provider, "provider").await;
        start(&consumer, "consumer").await;

        let (callback, seen) = recorder();
        consumer
            .subscribe("sensors/soil", callback.clone(), Some("source"), true)
            .await
            .unwrap();
        // listen match and accept are a round trip through the provider
        sleep(Duration::from_millis(50)).await;
        assert!(broker.is_provided("sensors/soil"));
        assert_eq!(seen.lock().unwrap().last(), Some(&json!("sensors/soil")));

        let result = consumer.make_rpc("water", json!({"ml": 250})).await.unwrap();
        assert_eq!(result, json!({"ml": 250}));

        provider.unprovide_rpc("water").await.unwrap();
        assert!(consumer.make_rpc("water", json!({})).await.is_err());

        consumer.unsubscribe("sensors/soil", &callback).await.unwrap();
        sleep(Duration::from_millis(50)).await;
        assert!(!broker.is_provided("sensors/soil"));
        assert_eq!(broker.get("sensors/soil").unwrap()["source"], Value::Null);
    }

    #[actix::test]
    async fn reopened_session_is_not_restored_twice() {
        let context = ServiceContext::init();
        let broker = broker_with_ports();
        let client = patient_client(&context, &broker);

        let soil: Arc<dyn DataProvider> = Arc::new(Soil);
        client.provide_data("^sensors/.*", soil).await.unwrap();
        client
            .provide_rpc(
                "water",
                Arc::new(|_: Value, response: RpcResponse| response.send(json!(true))),
            )
            .await
            .unwrap();
        start(&client, "a").await;
        let (callback, seen) = recorder();
        client
            .subscribe("plants/basil", callback, Some("moisture"), false)
            .await
            .unwrap();

        let disconnected = client.wait_for("disconnected");
        broker.stall();
        timeout(Duration::from_secs(2), disconnected)
            .await
            .unwrap()
            .unwrap();
        sleep(Duration::from_millis(20)).await;
        assert_eq!(
            client.status().await.unwrap().state,
            Some(ConnectionState::Reconnecting)
        );
        assert_eq!(state_of(&context).await, State::Degraded);

        let connected = client.wait_for("connected");
        broker.recover();
        timeout(Duration::from_secs(2), connected)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(state_of(&context).await, State::Ready);

        // same session, so nothing was registered a second time
        assert_eq!(broker.session_count(), 1);
        assert_eq!(broker.live_handles("plants/basil"), 1);
        assert_eq!(broker.subscriber_count("plants/basil"), 1);
        assert_eq!(broker.listen_count("^sensors/.*"), 1);
        assert!(broker.has_rpc("water"));

        broker.set("plants/basil", Some("moisture"), json!(35));
        assert_eq!(*seen.lock().unwrap(), vec![json!(35)]);
    }

    #[actix::test]
    async fn reopened_session_retries_only_the_port_config() {
        let context = ServiceContext::init();
        let broker = LocalBroker::new();
        let client = patient_client(&context, &broker);

        let (callback, seen) = recorder();
        client.subscribe("lights", callback, None, false).await.unwrap();
        client
            .start(json!({"url": "127.0.0.1:6020"}))
            .await
            .unwrap();
        sleep(Duration::from_millis(50)).await;
        assert!(!client.status().await.unwrap().setup_complete);

        broker.set(
            "server/portConfig",
            None,
            json!({"port": 6020, "channelsPort": 6021}),
        );
        let connected = client.wait_for("connected");
        broker.stall();
        sleep(Duration::from_millis(20)).await;
        broker.recover();
        timeout(Duration::from_secs(2), connected)
            .await
            .unwrap()
            .unwrap();

        let status = client.status().await.unwrap();
        assert!(status.setup_complete);
        assert_eq!(status.port_config.unwrap().channels_port, 6021);
        assert_eq!(broker.live_handles("lights"), 1);
        assert_eq!(broker.subscriber_count("lights"), 1);

        broker.set("lights", None, json!({"on": true}));
        assert_eq!(*seen.lock().unwrap(), vec![json!({"on": true})]);
    }

    #[actix::test]
    async fn missing_port_config_blocks_connected() {
        let context = ServiceContext::init();
        let broker = LocalBroker::new();
        let channels = MemoryChannels::default();
        let client = client(&context, &broker, &channels);

        let mut proxy = client.open_channel("plants").await.unwrap();
        client
            .start(json!({"url": "127.0.0.1:6020"}))
            .await
            .unwrap();
        sleep(Duration::from_millis(50)).await;

        let status = client.status().await.unwrap();
        assert_eq!(status.state, Some(ConnectionState::Open));
        assert!(!status.setup_complete);
        assert_eq!(state_of(&context).await, State::Degraded);
        assert!(channels.take().is_empty());
        assert!(!proxy.is_open());
        assert!(proxy.try_next_event().is_none());
    }

    #[actix::test]
    async fn channel_sockets_are_shared_and_reopened() {
        let context = ServiceContext::init();
        let broker = broker_with_ports();
        let channels = MemoryChannels::default();
        let client = client(&context, &broker, &channels);

        let mut first = client.open_channel("plants").await.unwrap();
        first.send(b"early".to_vec());
        start(&client, "a").await;

        let mut server = channels.take();
        assert_eq!(server.len(), 1);
        assert_eq!(server[0].url, "ws://127.0.0.1:6021/plants");
        assert_eq!(first.next_event().await, Some(ChannelEvent::Open));
        assert!(first.is_open());

        let mut second = client.open_channel("plants").await.unwrap();
        assert_eq!(second.next_event().await, Some(ChannelEvent::Open));
        // still one socket for the path
        assert!(channels.take().is_empty());

        server[0].to_client.send(b"hello".to_vec()).unwrap();
        for proxy in [&mut first, &mut second] {
            assert_eq!(
                proxy.next_event().await,
                Some(ChannelEvent::Message(b"hello".to_vec()))
            );
        }

        second.send(b"up".to_vec());
        assert_eq!(server[0].from_client.recv().await, Some(b"up".to_vec()));
        // the send before connecting was dropped
        assert!(server[0].from_client.try_recv().is_err());

        // server drops the socket: both proxies close, then reopen
        drop(server.remove(0));
        for proxy in [&mut first, &mut second] {
            assert_eq!(proxy.next_event().await, Some(ChannelEvent::Close));
        }
        for proxy in [&mut first, &mut second] {
            assert_eq!(
                timeout(Duration::from_secs(2), proxy.next_event())
                    .await
                    .unwrap(),
                Some(ChannelEvent::Open)
            );
        }
        let mut server = channels.take();
        assert_eq!(server.len(), 1);

        // the last proxy closing closes the socket
        first.close();
        drop(second);
        assert_eq!(
            timeout(Duration::from_secs(2), server[0].from_client.recv())
                .await
                .unwrap(),
            None
        );
    }

    #[actix::test]
    async fn stop_closes_channels_and_goes_inactive() {
        let context = ServiceContext::init();
        let broker = broker_with_ports();
        let channels = MemoryChannels::default();
        let client = client(&context, &broker, &channels);
        start(&client, "a").await;

        let mut proxy = client.open_channel("camera").await.unwrap();
        assert_eq!(proxy.next_event().await, Some(ChannelEvent::Open));

        client.stop().await.unwrap();
        assert_eq!(proxy.next_event().await, Some(ChannelEvent::Close));
        assert_eq!(state_of(&context).await, State::Inactive);
        assert_eq!(broker.session_count(), 0);

        // no reconnect is pending after a stop
        sleep(Duration::from_millis(100)).await;
        assert_eq!(channels.take().len(), 1);
        assert_eq!(broker.session_count(), 0);
    }

    #[actix::test]
    async fn reconfigure_restarts_and_accepts() {
        let context = ServiceContext::init();
        let broker = broker_with_ports();
        let client = client(&context, &broker, &MemoryChannels::default());
        start(&client, "a").await;

        let connected = client.wait_for("connected");
        assert!(client
            .reconfigure(json!({"url": "10.0.0.9:6020", "friendlyName": "b"}))
            .await
            .unwrap());
        timeout(Duration::from_secs(2), connected)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(broker.session_count(), 1);
        let status = client.status().await.unwrap();
        assert_eq!(status.url.as_deref(), Some("10.0.0.9:6020"));
        assert!(status.client_name.starts_with("b-"));
        assert!(matches!(
            client.wait_for("ready").await,
            Err(ServiceError::UnknownEvent(_))
        ));
    }
}

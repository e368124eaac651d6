use iw_client::{BrokerClient, BrokerConnector, ChannelConnector, ClientEvent, ClientOptions};
use iw_discovery::{Advertisement, Discovery, DiscoveryTimings};
use iw_registry::{Service, ServiceContext};
use std::sync::{Arc, Mutex, PoisonError};

use crate::{introspection::Introspection, orchestrator::ComponentFactory};

/// Let discovery drive the client: a found broker is connected to and
/// discovery sleeps while the session is up
pub fn link_discovery(discovery: &Discovery, client: &BrokerClient) {
    let (found_by, target) = (discovery.clone(), client.clone());
    discovery.on_discovered(move |found| {
        log::info!("Broker discovered at {}", found.url());
        found_by.pause();
        target.connect(&found.url());
    });

    let paused = discovery.clone();
    client.on(
        "connected",
        Arc::new(move |_event: &ClientEvent| paused.pause()),
    );

    let resumed = discovery.clone();
    client.on(
        "disconnected",
        Arc::new(move |_event: &ClientEvent| resumed.resume()),
    );
}

/// The component types the daemon knows how to load. All modules share one
/// broker client, created on first use
pub struct DaemonComponents {
    context: ServiceContext,
    broker: Arc<dyn BrokerConnector>,
    channels: Arc<dyn ChannelConnector>,
    options: ClientOptions,
    timings: DiscoveryTimings,
    client: Mutex<Option<BrokerClient>>,
}

impl DaemonComponents {
    pub fn new(
        context: ServiceContext,
        broker: Arc<dyn BrokerConnector>,
        channels: Arc<dyn ChannelConnector>,
        options: ClientOptions,
        timings: DiscoveryTimings,
    ) -> Self {
        Self {
            context,
            broker,
            channels,
            options,
            timings,
            client: Mutex::new(None),
        }
    }

    pub fn client(&self) -> BrokerClient {
        self.client
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .get_or_insert_with(|| {
                BrokerClient::new(
                    &self.context,
                    None,
                    self.broker.clone(),
                    self.channels.clone(),
                    self.options.clone(),
                )
            })
            .clone()
    }
}

impl ComponentFactory for DaemonComponents {
    fn create(&self, component: &str, name: Option<&str>) -> Option<Arc<dyn Service>> {
        let service: Arc<dyn Service> = match component {
            BrokerClient::SERVICE_TYPE => Arc::new(self.client()),
            Discovery::SERVICE_TYPE => {
                let discovery = Discovery::new(&self.context, name, self.timings);
                link_discovery(&discovery, &self.client());
                Arc::new(discovery)
            }
            Advertisement::SERVICE_TYPE => {
                Arc::new(Advertisement::new(&self.context, name, self.timings))
            }
            Introspection::SERVICE_TYPE => {
                Arc::new(Introspection::new(&self.context, name, self.client()))
            }
            _ => return None,
        };
        Some(service)
    }
}

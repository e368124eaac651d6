use actix::prelude::*;
use async_trait::async_trait;
use iw_client::{BrokerClient, ClientEvent};
use iw_registry::{
    RegistryUpdate, Service, ServiceContext, ServiceEntry, ServiceError, ServiceHandle, State,
};
use serde::Deserialize;
use serde_json::{json, Value};
use std::{collections::BTreeMap, sync::Arc};
use tokio::{sync::mpsc::unbounded_channel, time::Duration};
use tokio_stream::wrappers::UnboundedReceiverStream;

pub const INTROSPECTION_ROOT: &str = "iw-introspection/nodes";

// Registry updates arriving within this window are written as one record
const PUBLISH_DELAY_MS: u64 = 100;

fn default_root() -> String {
    INTROSPECTION_ROOT.to_string()
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct IntrospectionConfig {
    #[serde(default = "default_root")]
    pub root: String,
}

impl Default for IntrospectionConfig {
    fn default() -> Self {
        Self {
            root: default_root(),
        }
    }
}

/// Mirrors the process's service registry into the broker record
/// `<root>/<client name>` so other nodes can see what this one is running
pub struct IntrospectionPublisher {
    service: ServiceHandle,
    context: ServiceContext,
    client: BrokerClient,
    record: Option<String>,
    entries: BTreeMap<usize, ServiceEntry>,
    updates: Option<SpawnHandle>,
    flush: Option<SpawnHandle>,
}

impl IntrospectionPublisher {
    pub fn new(service: ServiceHandle, context: ServiceContext, client: BrokerClient) -> Self {
        Self {
            service,
            context,
            client,
            record: None,
            entries: BTreeMap::new(),
            updates: None,
            flush: None,
        }
    }

    fn begin(&mut self, record: String, ctx: &mut Context<Self>) {
        self.halt(ctx);

        let (tx, rx) = unbounded_channel();
        self.context.attach_sink(tx);
        self.updates = Some(ctx.add_stream(UnboundedReceiverStream::new(rx)));

        self.service
            .set_state(State::Ready, &format!("publishing registry to {record}"));
        self.record = Some(record);
    }

    fn halt(&mut self, ctx: &mut Context<Self>) {
        if let Some(handle) = self.updates.take() {
            self.context.detach_sink();
            ctx.cancel_future(handle);
        }
        if let Some(handle) = self.flush.take() {
            ctx.cancel_future(handle);
        }
        self.record = None;
        self.entries.clear();
    }

    fn schedule_publish(&mut self, ctx: &mut Context<Self>) {
        if self.flush.is_some() {
            return;
        }
        self.flush = Some(
            ctx.run_later(Duration::from_millis(PUBLISH_DELAY_MS), |act, _ctx| {
                act.flush = None;
                act.publish();
            }),
        );
    }

    fn publish(&self) {
        let Some(record) = &self.record else {
            return;
        };
        let services: Vec<&ServiceEntry> = self.entries.values().collect();
        self.client.publish(record, json!({ "services": services }));
    }
}

impl Actor for IntrospectionPublisher {
    type Context = Context<Self>;

    fn started(&mut self, ctx: &mut Self::Context) {
        // a fresh session has an empty record, write it again
        let addr = ctx.address().downgrade();
        self.client.on(
            "connected",
            Arc::new(move |_event: &ClientEvent| {
                if let Some(addr) = addr.upgrade() {
                    addr.do_send(Republish);
                }
            }),
        );
    }
}

impl StreamHandler<RegistryUpdate> for IntrospectionPublisher {
    fn handle(&mut self, update: RegistryUpdate, ctx: &mut Self::Context) {
        match update {
            RegistryUpdate::Entry(entry) => {
                self.entries.insert(entry.index, entry);
            }
            RegistryUpdate::Removed(index) => {
                self.entries.remove(&index);
            }
        }
        self.schedule_publish(ctx);
    }

    fn finished(&mut self, _ctx: &mut Self::Context) {
        log::debug!("Registry sink closed");
    }
}

#[derive(Message)]
#[rtype(result = "Result<(), ServiceError>")]
pub struct StartPublishing(pub IntrospectionConfig);

impl Handler<StartPublishing> for IntrospectionPublisher {
    type Result = ResponseActFuture<Self, Result<(), ServiceError>>;

    fn handle(&mut self, msg: StartPublishing, _ctx: &mut Self::Context) -> Self::Result {
        let client = self.client.clone();
        Box::pin(
            async move { client.status().await }
                .into_actor(self)
                .map(move |res, act, ctx| {
                    let status = res.map_err(ServiceError::from)?;
                    act.begin(format!("{}/{}", msg.0.root, status.client_name), ctx);
                    Ok(())
                }),
        )
    }
}

#[derive(Message)]
#[rtype(result = "()")]
pub struct StopPublishing;

impl Handler<StopPublishing> for IntrospectionPublisher {
    type Result = ();

    fn handle(&mut self, _msg: StopPublishing, ctx: &mut Self::Context) -> Self::Result {
        self.halt(ctx);
        self.service
            .set_state(State::Inactive, "Introspection stopped");
    }
}

#[derive(Message)]
#[rtype(result = "()")]
struct Republish;

impl Handler<Republish> for IntrospectionPublisher {
    type Result = ();

    fn handle(&mut self, _msg: Republish, _ctx: &mut Self::Context) -> Self::Result {
        self.publish();
    }
}

/// Service handle onto an [`IntrospectionPublisher`]
#[derive(Clone)]
pub struct Introspection {
    addr: Addr<IntrospectionPublisher>,
}

impl Introspection {
    pub const SERVICE_TYPE: &'static str = "introspection";

    pub fn new(context: &ServiceContext, name: Option<&str>, client: BrokerClient) -> Self {
        let service = context.register(Self::SERVICE_TYPE, State::Inactive, name);
        Self {
            addr: IntrospectionPublisher::new(service, context.clone(), client).start(),
        }
    }
}

#[async_trait]
impl Service for Introspection {
    fn service_type(&self) -> &'static str {
        Self::SERVICE_TYPE
    }

    async fn start(&self, config: Value) -> Result<(), ServiceError> {
        let config = if config.is_null() {
            IntrospectionConfig::default()
        } else {
            serde_json::from_value(config)?
        };
        self.addr.send(StartPublishing(config)).await?
    }

    async fn stop(&self) -> Result<(), ServiceError> {
        self.addr.send(StopPublishing).await?;
        Ok(())
    }
}

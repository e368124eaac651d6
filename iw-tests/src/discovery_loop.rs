use iw_discovery::{Advertisement, Discovery, DiscoveryTimings};
use iw_registry::{Service, ServiceContext};
use serde_json::json;

// Advertiser and discoverer on loopback; every discovered broker is logged
// until ctrl-c
#[actix::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    env_logger::init();

    let context = ServiceContext::init();
    let timings = DiscoveryTimings::default();

    log::info!("Starting discovery on 127.0.0.1:6030");
    let discovery = Discovery::new(&context, Some("loop"), timings);
    discovery.on_discovered(|found| log::info!("Discovered broker at {}", found.url()));
    discovery
        .start(json!({"requestPort": 6030, "requestAddress": "127.0.0.1"}))
        .await
        .map_err(|e| {
            log::error!("Error starting discovery {e:}");
            e
        })?;

    let advertisement = Advertisement::new(&context, Some("loop"), timings);
    advertisement
        .start(json!({
            "advertisedPort": 6020,
            "requestPort": 6030,
            "requestAddress": "127.0.0.1",
            "broadcastAddress": "127.0.0.1"
        }))
        .await
        .map_err(|e| {
            log::error!("Error starting advertisement {e:}");
            e
        })?;

    tokio::signal::ctrl_c().await?;

    for entry in context.snapshot().await? {
        log::info!("{} ended {}: {}", entry.service_type, entry.state, entry.message);
    }
    discovery.stop().await?;
    advertisement.stop().await?;
    context.teardown();

    Ok(())
}

use std::sync::{
    atomic::{AtomicUsize, Ordering},
    Arc,
};

use iw_client::{BrokerClient, ClientOptions, DataCallback, LocalBroker, WsConnector};
use iw_registry::{Service, ServiceContext};
use serde_json::{json, Value};
use tokio::time::{sleep, Duration};

const ROUNDS: usize = 5;

// Drops the broker session repeatedly and checks every subscription comes
// back with exactly one live handle
#[actix::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    env_logger::init();

    let context = ServiceContext::init();
    let broker = LocalBroker::new();
    broker.set(
        "server/portConfig",
        None,
        json!({"port": 6020, "channelsPort": 6021}),
    );

    let client = BrokerClient::new(
        &context,
        None,
        Arc::new(broker.clone()),
        Arc::new(WsConnector),
        ClientOptions {
            reconnect_delay: Duration::from_secs(1),
            ..Default::default()
        },
    );

    let seen = Arc::new(AtomicUsize::new(0));
    let records = ["garden/soil", "garden/light", "garden/temp"];
    for record in records {
        let seen = seen.clone();
        let callback: DataCallback = Arc::new(move |value: Value| {
            log::debug!("update {value}");
            seen.fetch_add(1, Ordering::Relaxed);
        });
        client
            .subscribe(record, callback, None, false)
            .await
            .map_err(|e| {
                log::error!("Error subscribing to {record} {e:}");
                e
            })?;
    }

    let mut connected = client.wait_for("connected");
    client
        .start(json!({"url": "127.0.0.1:6020", "friendlyName": "restore-test"}))
        .await?;

    for round in 0..ROUNDS {
        connected.await?;

        for record in records {
            broker.set(record, None, json!({"round": round}));
            let live = broker.live_handles(record);
            if live != 1 {
                log::error!("Round {round}: {record} has {live} live handles");
                return Err(format!("{record} restored with {live} handles").into());
            }
        }
        log::info!(
            "Round {round} restored, {} updates so far",
            seen.load(Ordering::Relaxed)
        );
        sleep(Duration::from_millis(200)).await;

        connected = client.wait_for("connected");
        broker.interrupt();
    }

    let expected = ROUNDS * records.len();
    let updates = seen.load(Ordering::Relaxed);
    log::info!("Received {updates} of {expected} updates");

    client.stop().await?;
    context.teardown();

    if updates != expected {
        return Err(format!("expected {expected} updates, got {updates}").into());
    }
    Ok(())
}

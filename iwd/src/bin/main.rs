use clap::Parser;
use std::{path::PathBuf, str::FromStr, sync::Arc};
use tokio::time::Duration;

use iw_client::{ClientOptions, LocalBroker, WsConnector};
use iw_discovery::DiscoveryTimings;
use iw_registry::ServiceContext;
use iwd::{DaemonComponents, DaemonConfig, DaemonError, DaemonResult, Orchestrator};
use tracing_appender::rolling;
use tracing_subscriber::FmtSubscriber;

use tracing_log::LogTracer;

#[derive(Parser)]
#[command(name = "iwd")]
#[command(about = "Fleet coordination daemon for home-automation nodes")]
#[command(version)]
struct Args {
    /// Daemon config file (JSON)
    #[arg(short, long, default_value = "iwd.json")]
    config: PathBuf,

    /// Write daily rolling logs here instead of the configured directory
    #[arg(long)]
    log_dir: Option<PathBuf>,
}

#[actix::main]
async fn main() -> DaemonResult<()> {
    let args = Args::parse();
    let config = DaemonConfig::load(&args.config)?;
    let level = tracing::Level::from_str(&config.log_level)
        .map_err(|_| DaemonError::LogLevel(config.log_level.clone()))?;

    LogTracer::init().expect("Unable to set up log tracer");

    let (nb, _guard) = match args.log_dir.or_else(|| config.log_dir.clone()) {
        Some(dir) => tracing_appender::non_blocking(rolling::daily(dir, "iwd")),
        None => tracing_appender::non_blocking(std::io::stdout()),
    };

    let sub = FmtSubscriber::builder()
        .with_max_level(level)
        .with_writer(nb)
        .finish();

    tracing::subscriber::set_global_default(sub).expect("Unable to set up tracing subscriber");

    let context = ServiceContext::init();

    let mut options = ClientOptions {
        friendly_name: config.friendly_name.clone(),
        ..Default::default()
    };
    if let Some(secs) = config.reconnect_delay {
        options.reconnect_delay = Duration::from_secs(secs);
    }

    // there is no networked broker transport, every session (including one
    // opened to a discovered address) lands on this process's own store
    let broker = LocalBroker::new();
    log::info!("Broker records are process-local");
    if let Some(ports) = &config.server {
        log::info!(
            "Publishing port config (broker {}, channels {}) for local modules only",
            ports.port,
            ports.channels_port
        );
        broker.set(
            &options.port_config_record,
            None,
            serde_json::to_value(ports)?,
        );
    }

    let components = DaemonComponents::new(
        context.clone(),
        Arc::new(broker),
        Arc::new(WsConnector),
        options,
        DiscoveryTimings::default(),
    );
    let orchestrator = Orchestrator::new(&context, Arc::new(components));

    if let Err(e) = orchestrator.load(config.modules.clone()).await {
        log::error!("Startup failed: {e:}");
        orchestrator.shutdown().await;
        context.teardown();
        return Err(e.into());
    }

    tokio::signal::ctrl_c().await.map_err(|e| {
        log::error!("Unable to wait for ctrl-c {e:}");
        e
    })?;

    log::info!("Shutting down");
    orchestrator.shutdown().await;
    context.teardown();

    Ok(())
}

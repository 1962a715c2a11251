//! bitflash-agent CLI entry point.

mod cli;

use bitflash::event::{channel_observer, create_event_channel, NotificationChannel};
use bitflash::platform::flash::FileFlash;
use bitflash::platform::host::{HostNetwork, ProcessRestart, SystemTimeSync};
use bitflash::platform::http::HttpTransportProvider;
use bitflash::{CycleOutcome, PollOutcome, UpdateAgent};
use clap::Parser;
use cli::Cli;
use std::time::Duration;
use tokio::sync::{broadcast::error::RecvError, watch};
use tracing::{info, warn};
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

#[tokio::main]
async fn main() -> color_eyre::Result<()> {
    color_eyre::install()?;

    let cli = Cli::parse();

    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(&cli.log_level));
    let registry = tracing_subscriber::registry().with(filter);
    if cli.json_logs {
        registry.with(fmt::layer().json()).init();
    } else {
        registry.with(fmt::layer()).init();
    }

    info!("bitflash-agent v{}", env!("CARGO_PKG_VERSION"));

    let config = cli.to_config()?;

    let (events_tx, events_rx) = create_event_channel();
    tokio::spawn(log_notifications(events_rx));

    let transports = HttpTransportProvider::new(Duration::from_secs(
        config.download.inactivity_timeout_secs,
    ))?;
    let flash = FileFlash::new(config.flash.image_path.clone(), config.flash.capacity);
    info!("Flash slot at {}", flash.image_path().display());

    let agent = UpdateAgent::builder(config)
        .network(HostNetwork::new())
        .transports(transports)
        .flash(flash)
        .time_sync(SystemTimeSync::default())
        .restart(ProcessRestart)
        .observer(channel_observer(events_tx))
        .build()?;

    agent.start().await?;

    if cli.once {
        return match agent.check_now().await {
            PollOutcome::Completed(CycleOutcome::Failed(e)) => Err(e.into()),
            outcome => {
                info!("Check finished: {:?}", outcome);
                Ok(())
            }
        };
    }

    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            info!("Ctrl-C received, initiating shutdown");
            let _ = shutdown_tx.send(true);
        }
    });

    agent.run(shutdown_rx).await;

    info!("Goodbye!");
    Ok(())
}

async fn log_notifications(mut rx: NotificationChannel) {
    loop {
        match rx.recv().await {
            Ok(notification) => info!(target: "bitflash::status", "{}", notification),
            Err(RecvError::Lagged(skipped)) => warn!("Dropped {} status notifications", skipped),
            Err(RecvError::Closed) => break,
        }
    }
}

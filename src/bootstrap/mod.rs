mod setup;

use crate::adapters::api::server::{launch_api_server, ApiState};
use crate::config::Config;
use crate::core::services::health_reporter_service::HealthReporterService;
use crate::core::services::notification_bus::NotificationBus;
use crate::messaging::event_listener::EventListener;
use crate::messaging::Publisher;
use crate::utils::error::BusResult;
use crate::utils::log_ring::LogRing;
use crate::utils::logger;
use clap::Parser;
use std::path::PathBuf;
use std::sync::Arc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{error, info};

/// Capacity of the log ring until the configuration is loaded.
const BOOT_LOG_LINES: usize = 1000;

#[derive(Parser, Debug)]
#[command(author, version, about)]
pub struct BootstrapArgs {
    #[arg(short, long)]
    pub config: Option<PathBuf>,
}

pub async fn run_bootstrap() -> BusResult<()> {
    let log_ring = Arc::new(LogRing::new(BOOT_LOG_LINES));
    logger::init(log_ring.clone());

    let cancel_token = CancellationToken::new();
    let args = BootstrapArgs::parse();

    let config = match Config::new(args.config) {
        Ok(cfg) => cfg,
        Err(e) => {
            error!("Config error: {}", e);
            std::process::exit(1);
        }
    };
    config.validate()?;
    log_ring.resize(config.logging.buffer_size);

    let forwarder = setup::setup_error_forwarding(&config, &log_ring)?;

    let mut process_handles = vec![];

    let publisher = Arc::new(Publisher::new(config.bus.publisher_buffer));
    let bus = Arc::new(NotificationBus::from_config(
        &config,
        publisher.clone(),
        log_ring.clone(),
    ));

    let event_listener = Arc::new(EventListener::new());
    process_handles.push(setup::spawn_event_listener(
        &config,
        publisher,
        cancel_token.clone(),
        event_listener,
    ));
    process_handles.extend(setup::setup_maintenance_jobs(
        &config,
        bus.clone(),
        cancel_token.clone(),
    ));

    let health_reporter = HealthReporterService::new(bus.clone(), config.metrics.max_error_rate);
    let state = Arc::new(ApiState::new(bus, &config));

    info!(
        "Starting notification bus on {}:{}",
        config.server.host, config.server.port
    );
    let served = launch_api_server(
        config.server.host,
        config.server.port,
        config.server.api_key.clone(),
        state,
        health_reporter,
    )
    .await;

    shut_down(cancel_token, process_handles).await?;
    if let Some(forwarder) = forwarder {
        forwarder.abort();
    }
    served
}

pub async fn shut_down(
    cancel_token: CancellationToken,
    handles: Vec<JoinHandle<()>>,
) -> BusResult<()> {
    cancel_token.cancel();

    for handle in handles {
        handle.await?;
    }

    Ok(())
}

use crate::adapters::error_sink::http_sink::HttpErrorSink;
use crate::config::Config;
use crate::core::services::maintenance::{MaintenanceJob, MaintenanceTask};
use crate::core::services::notification_bus::NotificationBus;
use crate::messaging::event_listener::{run_event_listener, EventListener};
use crate::messaging::Publisher;
use crate::utils::error::BusResult;
use crate::utils::log_ring::{spawn_error_forwarder, LogRing};
use crate::utils::scheduler::schedule_polling;
use std::sync::Arc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::info;

/// Schedules every maintenance pass of the bus on its configured cadence.
pub fn setup_maintenance_jobs(
    config: &Config,
    bus: Arc<NotificationBus>,
    cancel_token: CancellationToken,
) -> Vec<JoinHandle<()>> {
    let jobs = [
        (MaintenanceTask::AckTimeouts, config.ack.check_interval, "AckTimeouts"),
        (MaintenanceTask::QueueSweep, config.queue.sweep_interval, "QueueSweep"),
        (
            MaintenanceTask::LivenessSweep,
            config.bus.liveness_sweep_interval,
            "LivenessSweep",
        ),
        (
            MaintenanceTask::BackpressureFlush,
            config.bus.flush_interval,
            "BackpressureFlush",
        ),
        (
            MaintenanceTask::MetricsSnapshot,
            config.metrics.snapshot_interval,
            "MetricsSnapshot",
        ),
    ];

    jobs.into_iter()
        .map(|(task, interval, name)| {
            schedule_polling(
                interval,
                MaintenanceJob::new(task, bus.clone()),
                name,
                cancel_token.clone(),
            )
        })
        .collect()
}

/// Starts forwarding error-level log entries to the configured webhook, if any.
pub fn setup_error_forwarding(
    config: &Config,
    ring: &LogRing,
) -> BusResult<Option<JoinHandle<()>>> {
    let Some(url) = config.logging.error_sink_url.as_deref() else {
        return Ok(None);
    };
    let sink = Arc::new(HttpErrorSink::new(url)?);
    let (sender, handle) = spawn_error_forwarder(sink, config.logging.forward_buffer);
    ring.attach_forwarder(sender);
    info!("Forwarding errors to {}", url);
    Ok(Some(handle))
}

pub fn spawn_event_listener(
    config: &Config,
    publisher: Arc<Publisher>,
    cancel_token: CancellationToken,
    event_listener: Arc<EventListener>,
) -> JoinHandle<()> {
    let log_throttle = config.bus.event_log_throttle;
    tokio::spawn(async move {
        run_event_listener(publisher, cancel_token, event_listener, log_throttle).await;
    })
}

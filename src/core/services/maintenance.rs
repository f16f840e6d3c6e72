use crate::core::ports::runner::Runner;
use crate::core::services::notification_bus::NotificationBus;
use crate::utils::error::BusResult;
use async_trait::async_trait;
use std::fmt;
use std::sync::Arc;
use tracing::debug;

/// Background passes the scheduler runs against the bus.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MaintenanceTask {
    AckTimeouts,
    QueueSweep,
    LivenessSweep,
    BackpressureFlush,
    MetricsSnapshot,
}

impl fmt::Display for MaintenanceTask {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            MaintenanceTask::AckTimeouts => "AckTimeouts",
            MaintenanceTask::QueueSweep => "QueueSweep",
            MaintenanceTask::LivenessSweep => "LivenessSweep",
            MaintenanceTask::BackpressureFlush => "BackpressureFlush",
            MaintenanceTask::MetricsSnapshot => "MetricsSnapshot",
        };
        f.write_str(name)
    }
}

/// A [`Runner`] that performs one maintenance task per pass.
pub struct MaintenanceJob {
    task: MaintenanceTask,
    bus: Arc<NotificationBus>,
}

impl MaintenanceJob {
    pub fn new(task: MaintenanceTask, bus: Arc<NotificationBus>) -> Self {
        Self { task, bus }
    }

    pub fn task(&self) -> MaintenanceTask {
        self.task
    }
}

#[async_trait]
impl Runner for MaintenanceJob {
    async fn run(&mut self) -> BusResult<()> {
        let affected = match self.task {
            MaintenanceTask::AckTimeouts => self.bus.run_ack_timeouts(),
            MaintenanceTask::QueueSweep => self.bus.sweep_queue(),
            MaintenanceTask::LivenessSweep => self.bus.sweep_stale_connections(),
            MaintenanceTask::BackpressureFlush => self.bus.flush_backpressured(),
            MaintenanceTask::MetricsSnapshot => {
                self.bus.snapshot_metrics();
                1
            }
        };
        if affected > 0 {
            debug!(task = %self.task, affected, "maintenance pass");
        }
        Ok(())
    }
}

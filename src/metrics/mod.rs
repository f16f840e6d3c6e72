use serde::Serialize;
pub mod connection_health_tracker;
pub mod delivery_metrics;
#[cfg_attr(feature = "test-helpers", mockall::automock)]
pub trait HealthCheck: Send + Sync {
    fn healthy(&self) -> bool;
}
#[cfg_attr(feature = "test-helpers", mockall::automock)]
pub trait HealthReporting: Send + Sync {
    fn report(&self) -> HealthReport;
}
pub trait HealthCheckReporting: HealthCheck + HealthReporting {}
impl<T: HealthCheck + HealthReporting> HealthCheckReporting for T {}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct HealthReport {
    pub notification_bus: bool,
    pub active_connections: usize,
    pub error_rate: f64,
    pub queue_backlog: usize,
    pub pending_acks: usize,
}

impl HealthReport {
    pub fn healthy(&self) -> bool {
        self.notification_bus
    }
}

pub type HealthChecker = Box<dyn HealthCheck>;

use crate::core::services::notification_bus::NotificationBus;
use crate::metrics::{HealthCheck, HealthReport, HealthReporting};
use std::sync::Arc;

/// A service that summarises the health of the notification bus.
///
/// The `HealthReporterService` implements both the `HealthCheck` and
/// `HealthReporting` traits on top of the bus counters. The bus is considered
/// healthy while its error rate stays at or below `max_error_rate`.
///
/// # Fields
///
/// * `bus` - The notification bus being observed.
/// * `max_error_rate` - Errors per sent message tolerated before reporting unhealthy.
pub struct HealthReporterService {
    bus: Arc<NotificationBus>,
    max_error_rate: f64,
}

impl HealthReporterService {
    /// Creates a new `HealthReporterService`.
    ///
    /// # Arguments
    ///
    /// * `bus` - The notification bus to observe.
    /// * `max_error_rate` - Threshold in `0.0..=1.0`.
    ///
    /// # Returns
    ///
    /// An `Arc` containing the newly created `HealthReporterService`.
    #[must_use]
    pub fn new(bus: Arc<NotificationBus>, max_error_rate: f64) -> Arc<Self> {
        Arc::new(Self {
            bus,
            max_error_rate,
        })
    }
}

impl HealthCheck for HealthReporterService {
    fn healthy(&self) -> bool {
        self.bus.metrics().error_rate() <= self.max_error_rate
    }
}

impl HealthReporting for HealthReporterService {
    /// Generates a health report for the bus.
    #[must_use]
    fn report(&self) -> HealthReport {
        HealthReport {
            notification_bus: self.healthy(),
            active_connections: self.bus.registry().len(),
            error_rate: self.bus.metrics().error_rate(),
            queue_backlog: self.bus.queue().backlog(),
            pending_acks: self.bus.acks().pending_count(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::Config;
    use crate::messaging::Publisher;
    use crate::utils::log_ring::LogRing;

    #[test]
    fn test_report_turns_unhealthy_above_error_rate() {
        let bus = Arc::new(NotificationBus::from_config(
            &Config::default(),
            Arc::new(Publisher::new(4)),
            Arc::new(LogRing::new(4)),
        ));
        let reporter = HealthReporterService::new(bus.clone(), 0.5);
        assert!(reporter.report().healthy());

        bus.metrics().record_error(None);
        let report = reporter.report();
        assert!(!report.healthy());
        assert_eq!(report.error_rate, 1.0);
        assert_eq!(report.active_connections, 0);
    }
}

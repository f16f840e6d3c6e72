use crate::metrics::HealthCheckReporting;
use actix_web::{get, web, HttpResponse, Responder};
use std::sync::Arc;

pub mod diagnostics;
pub mod events;
pub mod ws;

type HealthReporter = Arc<dyn HealthCheckReporting>;

/// Liveness probe for the bus.
///
/// Answers `200 OK` with the [`HealthReport`](crate::metrics::HealthReport) while the
/// delivery error rate stays under its threshold, `503 Service Unavailable` otherwise.
#[get("/health")]
pub async fn health_check(reporter: web::Data<HealthReporter>) -> impl Responder {
    let report = reporter.report();
    if report.healthy() {
        HttpResponse::Ok().json(report)
    } else {
        HttpResponse::ServiceUnavailable().json(report)
    }
}

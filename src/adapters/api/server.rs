use crate::adapters::api::handlers::{
    diagnostics::get_diagnostics,
    events::{acknowledge_event, emit_event},
    health_check,
    ws::push_stream,
};
use crate::config::Config;
use crate::core::domain::connection::Station;
use crate::core::services::notification_bus::NotificationBus;
use crate::metrics::{HealthCheck, HealthCheckReporting, HealthReporting};
use crate::utils::error::{BusError, BusResult};
use actix_web::dev::{Service, ServiceResponse};
use actix_web::{dev::ServiceRequest, middleware, web, App, HttpResponse, HttpServer};
use futures_util::future::{ok, Either};
use futures_util::TryFutureExt;
use std::net::Ipv4Addr;
use std::sync::Arc;
use std::time::Duration;

type HealthReporter = Arc<dyn HealthCheckReporting>;

/// Settings of each server-side push stream.
#[derive(Debug, Clone)]
pub struct StreamSettings {
    pub heartbeat_interval: Duration,
    pub liveness_timeout: Duration,
    /// Frames buffered per connection before the writer reports backpressure.
    pub writer_buffer: usize,
}

impl Default for StreamSettings {
    fn default() -> Self {
        Self {
            heartbeat_interval: Duration::from_secs(10),
            liveness_timeout: Duration::from_secs(30),
            writer_buffer: 256,
        }
    }
}

/// Shared API state.
pub struct ApiState {
    pub bus: Arc<NotificationBus>,
    /// Stations allowed to read diagnostics.
    pub diagnostics_roles: Vec<Station>,
    pub stream: StreamSettings,
}

impl ApiState {
    pub fn new(bus: Arc<NotificationBus>, config: &Config) -> Self {
        Self {
            bus,
            diagnostics_roles: config
                .server
                .diagnostics_roles
                .iter()
                .map(Station::new)
                .collect(),
            stream: StreamSettings {
                heartbeat_interval: config.server.heartbeat_interval,
                liveness_timeout: config.bus.liveness_timeout,
                writer_buffer: config.bus.writer_buffer,
            },
        }
    }

    pub fn may_read_diagnostics(&self, station: &Station) -> bool {
        self.diagnostics_roles.contains(station)
    }
}

/// Launches the Actix‑web API server with logging, security, and endpoint registration.
///
/// The server exposes the health report, the WebSocket push stream, event emission
/// and acknowledgment, and the operator diagnostics. Every route requires the
/// `X-API-KEY` header to match `api_key`.
///
/// # Arguments
///
/// * `host` - The IP address on which the server should listen.
/// * `port` - The port on which the server should accept connections.
/// * `api_key` - The shared key expected in `X-API-KEY`.
/// * `state` - Shared API state holding the notification bus.
/// * `health_reporter` - An Arc-wrapped reference to a type implementing both `HealthCheck` and `HealthReporting`.
///
/// # Returns
///
/// A `BusResult<()>` which is `Ok(())` once the server has stopped, or a `BusError`
/// if it could not bind or failed while running.
pub async fn launch_api_server<P>(
    host: Ipv4Addr,
    port: u16,
    api_key: String,
    state: Arc<ApiState>,
    health_reporter: Arc<P>,
) -> BusResult<()>
where
    P: HealthCheck + HealthReporting + 'static,
{
    let api_key = Arc::new(api_key);

    HttpServer::new(move || {
        let api_key = api_key.clone();

        App::new()
            .wrap(middleware::Logger::default())
            .wrap(middleware::NormalizePath::new(
                middleware::TrailingSlash::Trim,
            ))
            .wrap(middleware::DefaultHeaders::new().add(("X-Version", "1.0")))
            .wrap_fn(move |req: ServiceRequest, srv| {
                if req.headers().get("X-API-KEY").and_then(|h| h.to_str().ok())
                    == Some(api_key.as_str())
                {
                    Either::Left(srv.call(req).map_ok(ServiceResponse::map_into_left_body))
                } else {
                    let res = req.into_response(
                        HttpResponse::Forbidden()
                            .body("Forbidden: invalid API key")
                            .map_into_right_body(),
                    );
                    Either::Right(ok(res))
                }
            })
            .app_data(web::Data::new(state.clone()))
            .app_data(web::Data::new(health_reporter.clone() as HealthReporter))
            .service(health_check)
            .service(push_stream)
            .service(acknowledge_event)
            .service(emit_event)
            .service(get_diagnostics)
    })
    .bind((host, port))
    .map_err(|e| BusError::ApiError(e.to_string()))?
    .run()
    .await
    .map_err(|e| BusError::ApiError(e.to_string()))?;

    Ok(())
}

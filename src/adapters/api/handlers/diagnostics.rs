use crate::adapters::api::models::api_response::ApiResponse;
use crate::adapters::api::models::identity::StationIdentity;
use crate::adapters::api::server::ApiState;
use crate::utils::error::BusError;
use actix_web::{get, web, HttpResponse};
use std::sync::Arc;

/// Aggregated bus metrics for operators.
///
/// Only stations listed in `server.diagnostics_roles` may read it; everybody
/// else receives `403 Forbidden`.
#[get("/diagnostics")]
pub async fn get_diagnostics(
    identity: StationIdentity,
    state: web::Data<Arc<ApiState>>,
) -> Result<HttpResponse, BusError> {
    if !state.may_read_diagnostics(&identity.station) {
        return Err(BusError::Forbidden(format!(
            "station {} may not read diagnostics",
            identity.station
        )));
    }
    Ok(HttpResponse::Ok().json(ApiResponse::new(state.bus.diagnostics())))
}

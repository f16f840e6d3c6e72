use crate::adapters::api::models::api_response::ApiResponse;
use crate::adapters::api::models::identity::StationIdentity;
use crate::adapters::api::server::ApiState;
use crate::core::domain::delivery::{EmitOptions, EventAcknowledgment};
use crate::utils::error::BusError;
use actix_web::{post, web, HttpResponse};
use serde::Deserialize;
use serde_json::Value;
use std::sync::Arc;

/// Body of `POST /events`.
#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct EmitRequest {
    #[serde(rename = "type")]
    pub event_type: String,
    #[serde(default)]
    pub data: Value,
    #[serde(default)]
    pub options: EmitOptions,
    /// Hold the response until the event is acknowledged or has failed.
    #[serde(default)]
    pub wait: bool,
}

/// Emits an event on behalf of a collaborator in another process.
///
/// The emission is always scoped to the caller's tenant, whatever the options say.
#[post("/events")]
pub async fn emit_event(
    identity: StationIdentity,
    state: web::Data<Arc<ApiState>>,
    body: web::Json<EmitRequest>,
) -> Result<HttpResponse, BusError> {
    let request = body.into_inner();
    let event_type = request.event_type.trim();
    if event_type.is_empty() {
        return Err(BusError::ApiError("event type must not be empty".into()));
    }
    let options = request.options.tenant(identity.tenant_id);

    if request.wait {
        let outcome = state
            .bus
            .emit_and_wait(event_type, request.data, &options)
            .await?;
        return Ok(HttpResponse::Ok().json(ApiResponse::new(outcome)));
    }

    let receipt = state.bus.emit(event_type, request.data, &options)?;
    Ok(HttpResponse::Ok().json(ApiResponse::new(receipt)))
}

/// Accepts an acknowledgment for an event delivered over a push stream.
///
/// The connection must still be registered and belong to the caller's tenant.
#[post("/events/ack")]
pub async fn acknowledge_event(
    identity: StationIdentity,
    state: web::Data<Arc<ApiState>>,
    body: web::Json<EventAcknowledgment>,
) -> Result<HttpResponse, BusError> {
    let ack = body.into_inner();
    let connection = state
        .bus
        .registry()
        .get(ack.connection_id)
        .ok_or_else(|| BusError::RegistryMiss(ack.connection_id.to_string()))?;
    if connection.tenant_id != identity.tenant_id {
        return Err(BusError::Forbidden(
            "connection belongs to another tenant".into(),
        ));
    }

    let outcome = state.bus.acknowledge(&ack)?;
    Ok(HttpResponse::Ok().json(ApiResponse::new(outcome)))
}

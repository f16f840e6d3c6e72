use crate::messaging::BusEvent;
use actix_web::http::StatusCode;
use actix_web::{HttpResponse, ResponseError};
use serde_json::json;
use thiserror::Error;

/// Represents errors that can occur in the notification bus.
///
/// The first group of variants mirrors the delivery taxonomy: transport failures on a
/// single connection, throttled emissions, expired queue entries, acknowledgment
/// timeouts and final delivery failures, and lookups of connections that are gone.
/// The remaining variants cover configuration, the HTTP surface, wire decoding and
/// task management.
#[derive(Error, Debug)]
pub enum BusError {
    #[error("Transport error on connection {connection_id}: {reason}")]
    TransientTransport {
        connection_id: String,
        reason: String,
    },

    #[error("Rate limited: {event_type} for tenant {tenant_id}")]
    RateLimited {
        event_type: String,
        tenant_id: String,
    },

    #[error("Queued event {event_id} expired before delivery")]
    QueueExpired { event_id: String },

    #[error("No acknowledgment for event {event_id} on connection {connection_id}")]
    AckTimeout {
        event_id: String,
        connection_id: String,
    },

    #[error("Delivery failed for event {event_id} after {attempts} attempts")]
    DeliveryFailed { event_id: String, attempts: u32 },

    #[error("Connection not found: {0}")]
    RegistryMiss(String),

    #[error("Configuration error: {0}")]
    ConfigError(String),

    #[error("API error: {0}")]
    ApiError(String),

    #[error("Forbidden: {0}")]
    Forbidden(String),

    #[error("Protocol error: {0}")]
    ProtocolError(#[from] serde_json::Error),

    #[error("Join error: {0}")]
    JoinError(#[from] tokio::task::JoinError),

    #[error("Event error: {0}")]
    EventError(String),
}

pub type BusResult<T> = Result<T, BusError>;

impl From<tokio::sync::broadcast::error::SendError<BusEvent>> for BusError {
    fn from(err: tokio::sync::broadcast::error::SendError<BusEvent>) -> Self {
        BusError::EventError(err.to_string())
    }
}

impl ResponseError for BusError {
    fn status_code(&self) -> StatusCode {
        match self {
            BusError::RateLimited { .. } => StatusCode::TOO_MANY_REQUESTS,
            BusError::RegistryMiss(_) => StatusCode::NOT_FOUND,
            BusError::Forbidden(_) => StatusCode::FORBIDDEN,
            BusError::ApiError(_) | BusError::ProtocolError(_) => StatusCode::BAD_REQUEST,
            BusError::DeliveryFailed { .. } | BusError::AckTimeout { .. } => {
                StatusCode::GATEWAY_TIMEOUT
            }
            _ => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }

    fn error_response(&self) -> HttpResponse {
        HttpResponse::build(self.status_code()).json(json!({
            "status": "error",
            "error": self.to_string(),
        }))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_status_codes_follow_taxonomy() {
        assert_eq!(
            BusError::Forbidden("nope".into()).status_code(),
            StatusCode::FORBIDDEN
        );
        assert_eq!(
            BusError::DeliveryFailed {
                event_id: "e1".into(),
                attempts: 3
            }
            .status_code(),
            StatusCode::GATEWAY_TIMEOUT
        );
        assert_eq!(
            BusError::ApiError("missing header".into()).status_code(),
            StatusCode::BAD_REQUEST
        );
        assert_eq!(
            BusError::ConfigError("bad".into()).status_code(),
            StatusCode::INTERNAL_SERVER_ERROR
        );
    }
}

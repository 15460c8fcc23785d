use axum::{Json, http::StatusCode, response::{IntoResponse, Response}};
use manager::{InstanceError, ManagerError};
use serde::Serialize;

/// The `{"error": {"code", "message", "details"}}` body shape returned for
/// every 4xx/5xx response from the `/api/v1/*` surface.
#[derive(Debug, Serialize)]
pub struct ApiError {
    #[serde(skip)]
    status: StatusCode,
    error: ApiErrorBody,
}

#[derive(Debug, Serialize)]
struct ApiErrorBody {
    code: &'static str,
    message: String,
    details: serde_json::Value,
}

impl ApiError {
    pub fn new(status: StatusCode, code: &'static str, message: impl Into<String>) -> Self {
        Self {
            status,
            error: ApiErrorBody { code, message: message.into(), details: serde_json::json!({}) },
        }
    }

    pub fn internal(message: impl Into<String>) -> Self {
        Self::new(StatusCode::INTERNAL_SERVER_ERROR, "internal", message)
    }

    pub fn unauthorized() -> Self {
        Self::new(StatusCode::UNAUTHORIZED, "unauthorized", "missing or invalid bearer token")
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        (self.status, Json(self)).into_response()
    }
}

impl From<ManagerError> for ApiError {
    fn from(e: ManagerError) -> Self {
        match &e {
            ManagerError::NotFound(_) => ApiError::new(StatusCode::NOT_FOUND, "not_found", e.to_string()),
            ManagerError::DuplicateName(_) => ApiError::new(StatusCode::CONFLICT, "duplicate_name", e.to_string()),
            ManagerError::InvalidName(_) => ApiError::new(StatusCode::BAD_REQUEST, "invalid_name", e.to_string()),
            ManagerError::MaxInstances(_) => ApiError::new(StatusCode::CONFLICT, "max_instances", e.to_string()),
            ManagerError::Port(port_err) => match port_err {
                manager::PortAllocatorError::NoPortsAvailable => {
                    ApiError::new(StatusCode::INSUFFICIENT_STORAGE, "no_ports_available", port_err.to_string())
                }
                manager::PortAllocatorError::PortTaken(_) => {
                    ApiError::new(StatusCode::CONFLICT, "port_taken", port_err.to_string())
                }
                manager::PortAllocatorError::PortOutOfRange(..) => {
                    ApiError::new(StatusCode::BAD_REQUEST, "invalid_name", port_err.to_string())
                }
            },
            ManagerError::Store(_) => ApiError::internal(e.to_string()),
            ManagerError::Instance(instance_err) => match instance_err {
                InstanceError::Failed => ApiError::new(StatusCode::SERVICE_UNAVAILABLE, "failed", e.to_string()),
                InstanceError::NotReady => ApiError::new(StatusCode::SERVICE_UNAVAILABLE, "not_ready", e.to_string()),
                InstanceError::NotRunning => ApiError::new(StatusCode::SERVICE_UNAVAILABLE, "not_ready", e.to_string()),
                _ => ApiError::internal(e.to_string()),
            },
            ManagerError::NotReady => ApiError::new(StatusCode::SERVICE_UNAVAILABLE, "not_ready", e.to_string()),
            ManagerError::Failed => ApiError::new(StatusCode::SERVICE_UNAVAILABLE, "failed", e.to_string()),
        }
    }
}

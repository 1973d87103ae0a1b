use axum::{
    http::StatusCode,
    response::{IntoResponse, Response},
    Json,
};
use chrono::{DateTime, Utc};
use serde::Serialize;
use serde_json::{json, Value as JsonValue};
use uuid::Uuid;

use crate::models::AppointmentStatus;
use crate::store::StoreError;

/* ============================================================
   Engine errors
   ============================================================ */

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Entity {
    Appointment,
    Doctor,
    Patient,
}

impl Entity {
    fn as_str(self) -> &'static str {
        match self {
            Entity::Appointment => "appointment",
            Entity::Doctor => "doctor",
            Entity::Patient => "patient",
        }
    }
}

#[derive(Debug, thiserror::Error)]
pub enum AppointmentError {
    #[error("{} not found", .entity.as_str())]
    NotFound { entity: Entity, id: Uuid },

    #[error("Doctor is not available at {at}: conflicts with {} existing appointment(s)", .conflicting.len())]
    Conflict {
        doctor_id: Uuid,
        at: DateTime<Utc>,
        conflicting: Vec<Uuid>,
    },

    #[error("Invalid status '{0}'")]
    InvalidStatus(String),

    #[error(
        "Cannot change status from '{from}' to '{to}'. Allowed transitions: {}",
        join_statuses(.allowed)
    )]
    InvalidTransition {
        from: AppointmentStatus,
        to: AppointmentStatus,
        allowed: Vec<AppointmentStatus>,
    },

    #[error("{0}")]
    Validation(String),

    #[error(transparent)]
    Store(#[from] StoreError),

    #[error("finance error: {0}")]
    Finance(String),

    #[error("appointment {id} is being changed by another request, try again")]
    Contended { id: Uuid },
}

fn join_statuses(statuses: &[AppointmentStatus]) -> String {
    if statuses.is_empty() {
        return "none".to_string();
    }
    statuses
        .iter()
        .map(|s| s.as_str())
        .collect::<Vec<_>>()
        .join(", ")
}

/* ============================================================
   HTTP envelope
   ============================================================ */

#[derive(Debug, Serialize)]
pub struct ErrorResponse {
    pub error: ErrorObject,
}

#[derive(Debug, Serialize)]
pub struct ErrorObject {
    pub code: String,
    pub message: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub details: Option<JsonValue>,
}

#[derive(Debug)]
pub enum ApiError {
    Unauthorized(&'static str, String),
    BadRequest(&'static str, String, Option<JsonValue>),
    NotFound(&'static str, String),
    Conflict(&'static str, String),
    Internal(String),
}

impl ApiError {
    pub fn session_expired() -> Self {
        ApiError::Unauthorized("SESSION_EXPIRED", "Session expired".into())
    }

    pub fn validation(message: impl Into<String>) -> Self {
        ApiError::BadRequest("VALIDATION_ERROR", message.into(), None)
    }

    fn to_error_response(code: &str, message: &str, details: Option<JsonValue>) -> Json<ErrorResponse> {
        Json(ErrorResponse {
            error: ErrorObject {
                code: code.to_string(),
                message: message.to_string(),
                details,
            },
        })
    }
}

impl From<AppointmentError> for ApiError {
    fn from(err: AppointmentError) -> Self {
        let message = err.to_string();
        match err {
            AppointmentError::NotFound {
                entity: Entity::Appointment,
                ..
            } => ApiError::NotFound("NOT_FOUND", message),
            // unknown doctor/patient on a write is a bad request, not a missing resource
            AppointmentError::NotFound { id, .. } => {
                ApiError::BadRequest("NOT_FOUND", message, Some(json!({ "id": id })))
            }
            AppointmentError::Conflict { conflicting, .. } => ApiError::BadRequest(
                "SLOT_UNAVAILABLE",
                message,
                Some(json!({ "conflicts": conflicting })),
            ),
            AppointmentError::InvalidStatus(_) => ApiError::BadRequest("INVALID_STATUS", message, None),
            AppointmentError::InvalidTransition { from, allowed, .. } => ApiError::BadRequest(
                "INVALID_TRANSITION",
                message,
                Some(json!({ "current_status": from, "allowed": allowed })),
            ),
            AppointmentError::Validation(_) => ApiError::validation(message),
            AppointmentError::Store(e) => ApiError::Internal(format!("db error: {e}")),
            AppointmentError::Finance(_) => ApiError::Internal(message),
            AppointmentError::Contended { .. } => ApiError::Conflict("CONCURRENT_UPDATE", message),
        }
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        match self {
            ApiError::Unauthorized(code, msg) => (
                StatusCode::UNAUTHORIZED,
                ApiError::to_error_response(code, &msg, None),
            )
                .into_response(),
            ApiError::BadRequest(code, msg, details) => (
                StatusCode::BAD_REQUEST,
                ApiError::to_error_response(code, &msg, details),
            )
                .into_response(),
            ApiError::NotFound(code, msg) => (
                StatusCode::NOT_FOUND,
                ApiError::to_error_response(code, &msg, None),
            )
                .into_response(),
            ApiError::Conflict(code, msg) => (
                StatusCode::CONFLICT,
                ApiError::to_error_response(code, &msg, None),
            )
                .into_response(),
            ApiError::Internal(msg) => {
                tracing::error!("internal error: {msg}");
                (
                    StatusCode::INTERNAL_SERVER_ERROR,
                    ApiError::to_error_response("INTERNAL", &msg, None),
                )
                    .into_response()
            }
        }
    }
}

use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::Json;
use serde::Serialize;

use conflux_core::error::{MeetingError, RegistryError, RouterError};

/// The single type that knows how to render a failure either as an HTTP
/// response or as a signaling-protocol error reply, converting every
/// leaf-crate error the way the reference stack's `ApiError` converts
/// `DaoError`/`AuthError` at the edge.
#[derive(Debug)]
pub enum GatewayError {
    NotFound(String),
    BadRequest(String),
    Unauthorized(String),
    Forbidden(String),
    Conflict(String),
    Capacity(String),
    Unavailable(String),
    Internal(String),
}

#[derive(Serialize)]
struct ErrorResponse {
    error: String,
    message: String,
}

impl GatewayError {
    /// Used by the WS handler to render an error reply for a `Request`
    /// without going through axum's `IntoResponse`.
    pub fn message(&self) -> String {
        match self {
            GatewayError::NotFound(m)
            | GatewayError::BadRequest(m)
            | GatewayError::Unauthorized(m)
            | GatewayError::Forbidden(m)
            | GatewayError::Conflict(m)
            | GatewayError::Capacity(m)
            | GatewayError::Unavailable(m)
            | GatewayError::Internal(m) => m.clone(),
        }
    }
}

impl IntoResponse for GatewayError {
    fn into_response(self) -> Response {
        let (status, error_type) = match &self {
            GatewayError::NotFound(_) => (StatusCode::NOT_FOUND, "not_found"),
            GatewayError::BadRequest(_) => (StatusCode::BAD_REQUEST, "bad_request"),
            GatewayError::Unauthorized(_) => (StatusCode::UNAUTHORIZED, "unauthorized"),
            GatewayError::Forbidden(_) => (StatusCode::FORBIDDEN, "forbidden"),
            GatewayError::Conflict(_) => (StatusCode::CONFLICT, "conflict"),
            GatewayError::Capacity(_) => (StatusCode::TOO_MANY_REQUESTS, "capacity"),
            GatewayError::Unavailable(_) => (StatusCode::SERVICE_UNAVAILABLE, "unavailable"),
            GatewayError::Internal(_) => (StatusCode::INTERNAL_SERVER_ERROR, "internal"),
        };

        let body = ErrorResponse {
            error: error_type.to_string(),
            message: self.message(),
        };

        (status, Json(body)).into_response()
    }
}

impl From<MeetingError> for GatewayError {
    fn from(err: MeetingError) -> Self {
        match err {
            MeetingError::MeetingNotFound(_)
            | MeetingError::ParticipantNotFound(_)
            | MeetingError::ProducerNotFound(_)
            | MeetingError::ConsumerNotFound(_) => GatewayError::NotFound(err.to_string()),

            MeetingError::MeetingAlreadyExists(_)
            | MeetingError::ParticipantAlreadyJoined(_)
            | MeetingError::TransitionInProgress(_) => GatewayError::Conflict(err.to_string()),

            MeetingError::MeetingFull { .. } => GatewayError::Capacity(err.to_string()),

            MeetingError::NotHost
            | MeetingError::RelaySpoofRejected { .. }
            | MeetingError::SelfConsumptionRejected => GatewayError::Forbidden(err.to_string()),

            MeetingError::TransitionTimedOut | MeetingError::MailboxClosed => {
                GatewayError::Unavailable(err.to_string())
            }

            MeetingError::Media(e) => e.into(),
            MeetingError::Registry(e) => e.into(),
        }
    }
}

impl From<RouterError> for GatewayError {
    fn from(err: RouterError) -> Self {
        match err {
            RouterError::NoWorkersAvailable => GatewayError::Capacity(err.to_string()),
            RouterError::UnsupportedCapabilities => GatewayError::BadRequest(err.to_string()),
            RouterError::RouterCreationFailed(_)
            | RouterError::Transport(_)
            | RouterError::Produce(_)
            | RouterError::Consume(_) => GatewayError::Internal(err.to_string()),
        }
    }
}

impl From<RegistryError> for GatewayError {
    fn from(err: RegistryError) -> Self {
        match err {
            RegistryError::NotFound(_) => GatewayError::NotFound(err.to_string()),
            RegistryError::Unavailable(_) | RegistryError::Serialization(_) => {
                GatewayError::Unavailable(err.to_string())
            }
        }
    }
}

use axum::{
    http::StatusCode,
    response::{IntoResponse, Response},
    Json,
};
use beacon_core::error::CoreError;
use beacon_protocol::{error_codes, HttpErrorEnvelope};

pub type HttpResult<T = Response> = Result<T, Response>;

pub(crate) fn json_error(
    status: StatusCode,
    code: impl Into<String>,
    message: impl Into<String>,
) -> Response {
    (
        status,
        Json(HttpErrorEnvelope {
            code: code.into(),
            message: message.into(),
            details: None,
        }),
    )
        .into_response()
}

pub fn bad_request(message: impl Into<String>) -> Response {
    json_error(StatusCode::BAD_REQUEST, error_codes::BAD_REQUEST, message)
}

pub fn not_found(message: impl Into<String>) -> Response {
    json_error(StatusCode::NOT_FOUND, error_codes::NOT_FOUND, message)
}

pub fn conflict(message: impl Into<String>) -> Response {
    json_error(StatusCode::CONFLICT, error_codes::CONFLICT, message)
}

pub fn rate_limited(message: impl Into<String>) -> Response {
    json_error(
        StatusCode::TOO_MANY_REQUESTS,
        error_codes::RATE_LIMITED,
        message,
    )
}

/// Map a domain error onto its HTTP contract.
pub fn core_error(err: &CoreError) -> Response {
    match err {
        CoreError::NotFound(msg) => not_found(msg.clone()),
        CoreError::Validation(msg) => bad_request(msg.clone()),
        CoreError::RateLimited(msg) => rate_limited(msg.clone()),
        CoreError::CasConflict(msg) => conflict(msg.clone()),
        CoreError::StoreUnavailable(msg) => json_error(
            StatusCode::SERVICE_UNAVAILABLE,
            error_codes::STORE_UNAVAILABLE,
            msg.clone(),
        ),
        CoreError::LogUnavailable(msg) | CoreError::GridUnavailable(msg) => json_error(
            StatusCode::SERVICE_UNAVAILABLE,
            error_codes::LOG_UNAVAILABLE,
            msg.clone(),
        ),
        other => json_error(
            StatusCode::INTERNAL_SERVER_ERROR,
            error_codes::INTERNAL_ERROR,
            other.to_string(),
        ),
    }
}

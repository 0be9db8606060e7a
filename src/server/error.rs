use std::collections::HashMap;

use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::Json;
use serde_json::json;

use crate::error::ProxyError;

/// JSON error response: `{"error": "<message>"}` with the mapped status.
#[derive(Debug)]
pub struct ErrorResponse {
    status: StatusCode,
    message: String,
}

impl ErrorResponse {
    pub fn new(status: StatusCode, message: impl Into<String>) -> Self {
        Self {
            status,
            message: message.into(),
        }
    }

    pub fn bad_gateway(message: impl Into<String>) -> Self {
        Self::new(StatusCode::BAD_GATEWAY, message)
    }

    pub fn internal(message: impl Into<String>) -> Self {
        Self::new(StatusCode::INTERNAL_SERVER_ERROR, message)
    }

    pub fn status(&self) -> StatusCode {
        self.status
    }
}

impl From<ProxyError> for ErrorResponse {
    fn from(error: ProxyError) -> Self {
        let status = match &error {
            ProxyError::RouteNotFound(_) => StatusCode::NOT_FOUND,
            ProxyError::UpstreamUnavailable(_) => StatusCode::BAD_GATEWAY,
            ProxyError::RedirectLoop(_) => StatusCode::BAD_GATEWAY,
            ProxyError::BadAuthChallenge(_) => StatusCode::INTERNAL_SERVER_ERROR,
            ProxyError::RequestCancelled => StatusCode::REQUEST_TIMEOUT,
        };
        Self::new(status, error.to_string())
    }
}

impl IntoResponse for ErrorResponse {
    fn into_response(self) -> Response {
        (self.status, Json(json!({ "error": self.message }))).into_response()
    }
}

/// Informational 404 for hosts without a configured route.
pub fn routes_response(routes: &HashMap<String, String>) -> Response {
    (
        StatusCode::NOT_FOUND,
        Json(json!({
            "routes": routes,
            "message": "Available registry routes",
        })),
    )
        .into_response()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn proxy_errors_map_to_statuses() {
        assert_eq!(
            ErrorResponse::from(ProxyError::UpstreamUnavailable("x".into())).status(),
            StatusCode::BAD_GATEWAY
        );
        assert_eq!(
            ErrorResponse::from(ProxyError::RedirectLoop("x".into())).status(),
            StatusCode::BAD_GATEWAY
        );
        assert_eq!(
            ErrorResponse::from(ProxyError::BadAuthChallenge("x".into())).status(),
            StatusCode::INTERNAL_SERVER_ERROR
        );
        assert_eq!(
            ErrorResponse::from(ProxyError::RequestCancelled).status(),
            StatusCode::REQUEST_TIMEOUT
        );
    }
}

use axum::{
    Json,
    http::StatusCode,
    response::{IntoResponse, Response},
};
use serde_json::json;
use sluice::Error;

/// An error rendered as `{"error": {"code": <status>, "message": <text>}}`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ApiError {
    status: StatusCode,
    message: String,
}

impl ApiError {
    pub fn new(status: StatusCode, message: impl Into<String>) -> Self {
        Self {
            status,
            message: message.into(),
        }
    }

    pub fn bad_request(message: impl Into<String>) -> Self {
        Self::new(StatusCode::BAD_REQUEST, message)
    }

    pub fn missing_client_key() -> Self {
        Self::bad_request("Bad request, missing remote address")
    }

    pub fn too_many_requests() -> Self {
        Self::new(StatusCode::TOO_MANY_REQUESTS, "Too many requests")
    }
}

impl From<Error> for ApiError {
    fn from(err: Error) -> Self {
        match err {
            Error::RateLimited { .. } => Self::too_many_requests(),
            Error::DispatchTimeout { .. } | Error::ServiceShutdown => {
                Self::new(StatusCode::SERVICE_UNAVAILABLE, err.to_string())
            }
            Error::JobTimeout { .. } => Self::new(StatusCode::GATEWAY_TIMEOUT, err.to_string()),
            Error::InvalidConfig { .. }
            | Error::WorkerSpawn { .. }
            | Error::ChannelError { .. }
            | Error::JobFaulted => Self::new(StatusCode::INTERNAL_SERVER_ERROR, err.to_string()),
        }
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let body = json!({
            "error": {
                "code": self.status.as_u16(),
                "message": self.message,
            }
        });
        (self.status, Json(body)).into_response()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use core::time::Duration;

    #[test]
    fn core_errors_map_to_http_statuses() {
        let cases = [
            (
                Error::RateLimited {
                    key: "10.0.0.1".to_owned(),
                },
                StatusCode::TOO_MANY_REQUESTS,
            ),
            (
                Error::DispatchTimeout {
                    timeout: Duration::from_millis(5),
                },
                StatusCode::SERVICE_UNAVAILABLE,
            ),
            (Error::ServiceShutdown, StatusCode::SERVICE_UNAVAILABLE),
            (
                Error::JobTimeout {
                    timeout: Duration::from_millis(5),
                },
                StatusCode::GATEWAY_TIMEOUT,
            ),
            (Error::JobFaulted, StatusCode::INTERNAL_SERVER_ERROR),
        ];

        for (err, expected) in cases {
            assert_eq!(ApiError::from(err).into_response().status(), expected);
        }
    }

    #[test]
    fn rate_limited_message_does_not_echo_the_key() {
        let err = ApiError::from(Error::RateLimited {
            key: "10.0.0.1".to_owned(),
        });
        assert_eq!(err, ApiError::too_many_requests());
    }
}

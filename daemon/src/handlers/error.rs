use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::Json;
use serde::Serialize;

use crate::error::Error;

#[derive(Serialize)]
struct ErrorBody {
    error: String,
    message: String,
}

impl IntoResponse for Error {
    fn into_response(self) -> Response {
        let status = match &self {
            Error::InvalidRequest(_) => StatusCode::BAD_REQUEST,
            Error::NotFound(_) => StatusCode::NOT_FOUND,
            Error::IllegalTransition(_) | Error::Cancelled => StatusCode::CONFLICT,
            Error::TransientIo(_) | Error::StoreUnavailable(_) => StatusCode::SERVICE_UNAVAILABLE,
            Error::Fatal(_) => StatusCode::INTERNAL_SERVER_ERROR,
        };

        let body = ErrorBody {
            error: kind(&self).to_string(),
            message: self.to_string(),
        };

        (status, Json(body)).into_response()
    }
}

fn kind(error: &Error) -> &'static str {
    match error {
        Error::InvalidRequest(_) => "invalid_request",
        Error::NotFound(_) => "not_found",
        Error::IllegalTransition(_) => "illegal_transition",
        Error::TransientIo(_) => "transient_io",
        Error::Fatal(_) => "fatal",
        Error::Cancelled => "cancelled",
        Error::StoreUnavailable(_) => "store_unavailable",
    }
}

#[cfg(test)]
mod tests {
    use axum::http::StatusCode;
    use axum::response::IntoResponse;

    use crate::error::Error;

    #[test]
    fn status_codes_follow_the_taxonomy() {
        let cases = [
            (Error::InvalidRequest("x".into()), StatusCode::BAD_REQUEST),
            (Error::NotFound("x".into()), StatusCode::NOT_FOUND),
            (Error::IllegalTransition("x".into()), StatusCode::CONFLICT),
            (Error::TransientIo("x".into()), StatusCode::SERVICE_UNAVAILABLE),
            (Error::Fatal("x".into()), StatusCode::INTERNAL_SERVER_ERROR),
            (Error::Cancelled, StatusCode::CONFLICT),
            (
                Error::StoreUnavailable("x".into()),
                StatusCode::SERVICE_UNAVAILABLE,
            ),
        ];

        for (error, expected) in cases {
            assert_eq!(error.into_response().status(), expected);
        }
    }
}

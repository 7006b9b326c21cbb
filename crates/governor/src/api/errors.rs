use core::error::Error;

use api_types::ApiResponse;
use poem::http::StatusCode;
use poem::error::ResponseError;
use poem::web::Json;
use poem::IntoResponse;
use poem::Response;

use crate::domain::error::GovernanceError;
use crate::domain::error::TransitionError;
use crate::domain::error::ValidationError;

/// API server errors
#[derive(Debug, derive_more::Display)]
pub enum ApiError {
    #[display("Server error: {message}")]
    ServerError { message: String },
}

impl Error for ApiError {}

/// Error answered with the response envelope and `status`.
pub fn failure(status: StatusCode, message: impl Into<String>) -> poem::Error {
    let body = Json(ApiResponse::<()>::failed(message));
    poem::Error::from_response(body.with_status(status).into_response())
}

pub fn validation_status(error: &ValidationError) -> StatusCode {
    match error {
        ValidationError::UnknownDevice(_) => StatusCode::NOT_FOUND,
        ValidationError::DuplicateRequest(_) => StatusCode::CONFLICT,
        _ => StatusCode::BAD_REQUEST,
    }
}

impl ResponseError for GovernanceError {
    fn status(&self) -> StatusCode {
        match self {
            Self::Validation(e) => validation_status(e),
            Self::UnknownRequest(_) => StatusCode::NOT_FOUND,
            Self::NotAdmitted(_)
            | Self::Capacity(_)
            | Self::Transition(TransitionError::NotFailed { .. }) => StatusCode::CONFLICT,
            Self::Transition(_) => StatusCode::INTERNAL_SERVER_ERROR,
            Self::DeviceUnavailable { .. } => StatusCode::SERVICE_UNAVAILABLE,
        }
    }

    fn as_response(&self) -> Response {
        Json(ApiResponse::<()>::failed(self.to_string()))
            .with_status(self.status())
            .into_response()
    }
}

#[cfg(test)]
mod tests {
    use similar_asserts::assert_eq;

    use super::*;

    #[test]
    fn api_error_display_formatting() {
        let server_error = ApiError::ServerError {
            message: "address in use".to_string(),
        };
        assert_eq!(server_error.to_string(), "Server error: address in use");
    }

    #[test]
    fn governance_errors_map_to_status_codes() {
        let cases = [
            (
                GovernanceError::UnknownRequest("job-1".into()),
                StatusCode::NOT_FOUND,
            ),
            (
                GovernanceError::NotAdmitted("job-1".into()),
                StatusCode::CONFLICT,
            ),
            (
                ValidationError::UnknownProfile("tiny".into()).into(),
                StatusCode::BAD_REQUEST,
            ),
            (
                ValidationError::DuplicateRequest("job-1".into()).into(),
                StatusCode::CONFLICT,
            ),
            (
                GovernanceError::DeviceUnavailable {
                    device: "node-a/0".into(),
                },
                StatusCode::SERVICE_UNAVAILABLE,
            ),
        ];
        for (error, status) in cases {
            assert_eq!(error.status(), status);
            assert_eq!(error.as_response().status(), status);
        }
    }
}

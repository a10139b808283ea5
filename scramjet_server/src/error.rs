use axum::Json;
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use scramjet_core::Error as CoreError;
use serde::Serialize;

#[derive(Debug, Serialize)]
pub struct ErrorBody {
    pub error: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub stage: Option<scramjet_core::BulkStage>,
}

#[derive(thiserror::Error, Debug)]
pub enum ApiError {
    #[error("{0}")]
    Core(#[from] CoreError),

    #[error("invalid input: {0}")]
    InvalidInput(String),
}

impl ApiError {
    fn status_code(&self) -> StatusCode {
        match self {
            ApiError::InvalidInput(_) => StatusCode::BAD_REQUEST,
            ApiError::Core(err) => match err {
                CoreError::InvalidInput(_) | CoreError::Serialization(_) => {
                    StatusCode::BAD_REQUEST
                }
                CoreError::NotFound(_) => StatusCode::NOT_FOUND,
                CoreError::Refused(_) => StatusCode::CONFLICT,
                CoreError::Timeout { .. } => StatusCode::GATEWAY_TIMEOUT,
                _ => StatusCode::BAD_GATEWAY,
            },
        }
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let code = self.status_code();
        if code.is_server_error() {
            tracing::warn!(status = code.as_u16(), error = %self, "request failed");
        }
        let stage = match &self {
            ApiError::Core(err) => err.bulk_stage(),
            ApiError::InvalidInput(_) => None,
        };
        let body = ErrorBody {
            error: self.to_string(),
            stage,
        };
        (code, Json(body)).into_response()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use scramjet_core::{BulkStage, DiffRefusal};

    #[test]
    fn core_errors_map_to_status_codes() {
        let refused: ApiError = CoreError::from(DiffRefusal::NothingToCompare {
            type_name: "person".to_string(),
        })
        .into();
        assert_eq!(refused.status_code(), StatusCode::CONFLICT);

        let timeout: ApiError = CoreError::Timeout {
            operation: "staging.put",
            after: std::time::Duration::from_secs(1),
        }
        .into();
        assert_eq!(timeout.status_code(), StatusCode::GATEWAY_TIMEOUT);

        let bulk: ApiError =
            CoreError::bulk("resources", BulkStage::Commit, sqlx::Error::PoolTimedOut).into();
        assert_eq!(bulk.status_code(), StatusCode::BAD_GATEWAY);

        let missing: ApiError = CoreError::NotFound("x".to_string()).into();
        assert_eq!(missing.status_code(), StatusCode::NOT_FOUND);

        assert_eq!(
            ApiError::InvalidInput("bad".to_string()).status_code(),
            StatusCode::BAD_REQUEST
        );
    }
}

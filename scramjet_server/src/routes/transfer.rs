use std::sync::Arc;

use axum::body::Bytes;
use axum::extract::Path;
use axum::routing::post;
use axum::{Extension, Json};
use scramjet_core::{Filter, JsonObjectValidator, TransferReport};
use serde::Deserialize;

use crate::error::ApiError;
use crate::routes::checked_type;
use crate::server::AppState;

#[tracing::instrument(level = "debug", skip_all)]
pub fn router() -> axum::Router {
    axum::Router::new().route("/transfer/{type}", post(transfer))
}

#[derive(Debug, Default, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct TransferRequest {
    #[serde(default)]
    pub filter: Option<Filter>,
}

/// An empty body means "transfer everything staged for the type".
pub(crate) fn parse_request(body: &[u8]) -> Result<TransferRequest, ApiError> {
    if body.iter().all(u8::is_ascii_whitespace) {
        return Ok(TransferRequest::default());
    }
    let req: TransferRequest = serde_json::from_slice(body)
        .map_err(|e| ApiError::InvalidInput(format!("invalid transfer request: {e}")))?;
    if let Some(f) = &req.filter {
        f.validate()?;
    }
    Ok(req)
}

/// Promote staged documents of a type. Payloads are accepted when they are JSON objects.
#[tracing::instrument(level = "info", skip_all, fields(type_name = %type_name))]
async fn transfer(
    Extension(state): Extension<Arc<AppState>>,
    Path(type_name): Path<String>,
    body: Bytes,
) -> Result<Json<TransferReport>, ApiError> {
    let type_name = checked_type(&type_name)?;
    let req = parse_request(&body)?;
    let report = state
        .engine
        .transfer(type_name, &JsonObjectValidator, req.filter.as_ref())
        .await?;
    Ok(Json(report))
}

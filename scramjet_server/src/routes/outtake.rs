use std::sync::Arc;

use axum::extract::Path;
use axum::routing::post;
use axum::{Extension, Json};
use scramjet_core::{Filter, PurgeReport, ReconcileReport};
use serde::{Deserialize, Serialize};

use crate::error::ApiError;
use crate::routes::checked_type;
use crate::server::AppState;

#[tracing::instrument(level = "debug", skip_all)]
pub fn router() -> axum::Router {
    axum::Router::new().route("/outtake/{type}", post(outtake))
}

/// Upstream's full id list for the type; anything committed but not listed is removed.
#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct OuttakeRequest {
    pub ids: Vec<String>,
    #[serde(default)]
    pub filter: Option<Filter>,
}

#[derive(Debug, Serialize)]
pub struct OuttakeResponse {
    pub reconcile: ReconcileReport,
    pub purge: PurgeReport,
}

#[tracing::instrument(level = "info", skip_all, fields(type_name = %type_name))]
async fn outtake(
    Extension(state): Extension<Arc<AppState>>,
    Path(type_name): Path<String>,
    Json(req): Json<OuttakeRequest>,
) -> Result<Json<OuttakeResponse>, ApiError> {
    let type_name = checked_type(&type_name)?;
    if let Some(f) = &req.filter {
        f.validate()?;
    }
    let reconcile = state
        .engine
        .reconcile(type_name, &req.ids, req.filter.as_ref())
        .await?;
    let purge = state.engine.purge_deleted(type_name).await?;
    Ok(Json(OuttakeResponse { reconcile, purge }))
}

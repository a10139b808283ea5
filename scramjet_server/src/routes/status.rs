use std::sync::Arc;

use axum::extract::Path;
use axum::routing::get;
use axum::{Extension, Json};
use chrono::{DateTime, Utc};
use scramjet_core::SyncEngine;
use serde::Serialize;

use crate::error::ApiError;
use crate::routes::checked_type;
use crate::server::AppState;

#[tracing::instrument(level = "debug", skip_all)]
pub fn router() -> axum::Router {
    axum::Router::new().route("/status/{type}", get(get_status))
}

#[derive(Debug, Clone, Serialize)]
pub struct TypeStatus {
    #[serde(rename = "type")]
    pub type_name: String,
    pub resources: u64,
    pub pending_deletes: u64,
    pub last_updated_at: Option<DateTime<Utc>>,
}

#[tracing::instrument(level = "debug", skip(engine))]
pub async fn collect(engine: &SyncEngine, type_name: &str) -> scramjet_core::Result<TypeStatus> {
    Ok(TypeStatus {
        type_name: type_name.to_string(),
        resources: engine.resources().count(type_name).await?,
        pending_deletes: engine.staging().count_deleted(type_name).await?,
        last_updated_at: engine.resources().max_updated_at(type_name).await?,
    })
}

#[tracing::instrument(level = "debug", skip_all, fields(type_name = %type_name))]
async fn get_status(
    Extension(state): Extension<Arc<AppState>>,
    Path(type_name): Path<String>,
) -> Result<Json<TypeStatus>, ApiError> {
    let type_name = checked_type(&type_name)?;
    Ok(Json(collect(&state.engine, type_name).await?))
}

use axum::Json;
use serde::Serialize;

#[derive(Debug, Serialize)]
pub struct Health {
    pub alive: bool,
}

/// Liveness only; does not touch the database.
#[tracing::instrument(level = "debug", skip_all)]
pub async fn get_health() -> Json<Health> {
    Json(Health { alive: true })
}

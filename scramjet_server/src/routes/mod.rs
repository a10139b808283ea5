use axum::Router;

pub mod health;
pub mod intake;
pub mod outtake;
pub mod status;
pub mod transfer;

#[tracing::instrument(level = "debug", skip_all)]
pub fn router() -> Router {
    Router::new().nest(
        "/api/v1",
        Router::new()
            .merge(intake::router())
            .merge(transfer::router())
            .merge(outtake::router())
            .merge(status::router()),
    )
}

/// Reject blank or oversized type names before they reach the stores.
pub(crate) fn checked_type(type_name: &str) -> Result<&str, crate::error::ApiError> {
    let t = type_name.trim();
    if t.is_empty() || t.len() > 128 {
        return Err(crate::error::ApiError::InvalidInput(format!(
            "invalid type name: {type_name:?}"
        )));
    }
    Ok(t)
}

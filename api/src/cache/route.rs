use crate::State;
use crate::error::ApiError;
use crate::handlers::CronAuth;
use axum::{Extension, Json};
use serde_json::{Value, json};
use tracing::info;

const TAG: &str = "cache";

#[utoipa::path(
    post,
    path = "/cache/sweep",
    responses(
        (status = 200, description = "Expired cache entries deleted"),
        (status = 401, description = "Missing or invalid cron secret"),
        (status = 500, description = "Sweep failed"),
    ),
    security(
        ("cron_secret" = [])
    ),
    tag = TAG
)]
pub async fn sweep(
    _auth: CronAuth,
    Extension(state): Extension<State>,
) -> Result<Json<Value>, ApiError> {
    let deleted = state.cache.sweep().await?;
    info!(deleted, "cache sweep complete");
    Ok(Json(json!({ "deleted": deleted })))
}

use crate::State;
use axum::http::StatusCode;
use axum::response::IntoResponse;
use axum::{Extension, Json};
use serde_json::json;
use tracing::error;

pub async fn check(Extension(state): Extension<State>) -> impl IntoResponse {
    match sqlx::query("SELECT 1").execute(&state.pg_pool).await {
        Ok(_) => (
            StatusCode::OK,
            Json(json!({
                "status": "ok",
                "database": "ok",
                "timestamp": chrono::Utc::now(),
            })),
        ),
        Err(err) => {
            error!("health check could not reach the database: {err}");
            (
                StatusCode::SERVICE_UNAVAILABLE,
                Json(json!({
                    "status": "degraded",
                    "database": "unreachable",
                    "timestamp": chrono::Utc::now(),
                })),
            )
        }
    }
}

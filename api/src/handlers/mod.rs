pub mod health;

use crate::State;
use crate::error::ApiError;
use axum::{
    Extension, Json, async_trait,
    extract::FromRequestParts,
    http::request::Parts,
    response::{IntoResponse, Response},
};
use axum_extra::{
    TypedHeader,
    headers::{Authorization, authorization::Bearer},
};
use serde_json::{Value, json};

/// Shared-secret guard for scheduler-triggered endpoints. The bearer token
/// must equal CRON_SECRET; any mismatch is rejected before work starts.
#[derive(Debug)]
pub struct CronAuth;

#[async_trait]
impl<S> FromRequestParts<S> for CronAuth
where
    S: Send + Sync,
{
    type Rejection = Response;

    async fn from_request_parts(parts: &mut Parts, state: &S) -> Result<Self, Self::Rejection> {
        let TypedHeader(Authorization(bearer)) =
            TypedHeader::<Authorization<Bearer>>::from_request_parts(parts, state)
                .await
                .map_err(|_| ApiError::Unauthorized.into_response())?;

        use axum::RequestPartsExt;
        let Extension(state) = parts
            .extract::<Extension<State>>()
            .await
            .map_err(|err| err.into_response())?;

        if bearer.token() != state.config.cron_secret {
            return Err(ApiError::Unauthorized.into_response());
        }

        Ok(CronAuth)
    }
}

#[utoipa::path(
    get,
    path = "/config/map",
    responses(
        (status = 200, description = "Map provider API key"),
        (status = 404, description = "No map provider configured"),
    ),
    tag = "config"
)]
pub async fn map_key(Extension(state): Extension<State>) -> Result<Json<Value>, ApiError> {
    match &state.config.map_api_key {
        Some(key) => Ok(Json(json!({ "api_key": key }))),
        None => Err(ApiError::NotFound),
    }
}

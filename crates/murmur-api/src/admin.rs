use axum::{
    Extension, Json,
    extract::{Path, State},
    http::StatusCode,
};
use tracing::info;

use murmur_types::api::{Claims, ColorRequest, KickRequest, KickResponse};
use murmur_types::models::{AdminMessage, AdminUserDetail, AdminUserOverview, UserId};

use crate::auth::AppState;
use crate::error::ApiResult;

pub async fn list_users(State(state): State<AppState>) -> ApiResult<Json<Vec<AdminUserOverview>>> {
    Ok(Json(state.gateway.admin().list_all_users().await?))
}

pub async fn user_detail(
    State(state): State<AppState>,
    Path(user_id): Path<UserId>,
    Extension(claims): Extension<Claims>,
) -> ApiResult<Json<AdminUserDetail>> {
    Ok(Json(state.gateway.admin().get_user_detail(user_id, claims.sub).await?))
}

pub async fn list_messages(State(state): State<AppState>) -> ApiResult<Json<Vec<AdminMessage>>> {
    Ok(Json(state.gateway.admin().list_all_messages().await?))
}

pub async fn kick_user(
    State(state): State<AppState>,
    Extension(claims): Extension<Claims>,
    Json(req): Json<KickRequest>,
) -> ApiResult<Json<KickResponse>> {
    let disconnected = state.gateway.admin().kick_user(req.user_id).await?;
    info!("Admin {} kicked user {} (live connection: {})", claims.sub, req.user_id, disconnected);
    Ok(Json(KickResponse { disconnected }))
}

pub async fn set_color(
    State(state): State<AppState>,
    Json(req): Json<ColorRequest>,
) -> ApiResult<StatusCode> {
    state
        .gateway
        .admin()
        .set_color_preference(req.user_id, req.color)
        .await?;
    Ok(StatusCode::NO_CONTENT)
}

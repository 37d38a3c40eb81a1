use axum::{
    Extension, Json,
    extract::{Path, State},
};
use tracing::info;

use murmur_db::models::WriteOutcome;
use murmur_gateway::store::run_blocking;
use murmur_types::ChatError;
use murmur_types::api::{AvatarRequest, AvatarResponse, Claims, RenameRequest, RenameResponse};
use murmur_types::models::{ConversationMessage, UserId, UserSummary};

use crate::auth::{AppState, validate_username};
use crate::error::{ApiError, ApiResult};

const MAX_AVATAR_REF_LEN: usize = 255;

/// All users, online first, then alphabetical.
pub async fn list_users(State(state): State<AppState>) -> ApiResult<Json<Vec<UserSummary>>> {
    let rows = run_blocking(&state.db, |db| db.list_users()).await?;
    Ok(Json(rows.into_iter().map(|row| row.into_summary()).collect()))
}

/// Full history between two users in send order. Callers may only read
/// conversations they take part in.
pub async fn get_conversation(
    State(state): State<AppState>,
    Path((user_a, user_b)): Path<(UserId, UserId)>,
    Extension(claims): Extension<Claims>,
) -> ApiResult<Json<Vec<ConversationMessage>>> {
    if claims.sub != user_a && claims.sub != user_b {
        return Err(ApiError::forbidden("You can only read your own conversations"));
    }

    let rows = run_blocking(&state.db, move |db| db.get_conversation(user_a, user_b)).await?;
    Ok(Json(rows.into_iter().map(|row| row.into_conversation_message()).collect()))
}

pub async fn rename(
    State(state): State<AppState>,
    Extension(claims): Extension<Claims>,
    Json(req): Json<RenameRequest>,
) -> ApiResult<Json<RenameResponse>> {
    if req.code != state.rename_code {
        return Err(ChatError::auth("Invalid secret code").into());
    }

    let new_username = req.new_username.trim().to_string();
    validate_username(&new_username)?;

    let user_id = claims.sub;
    let name = new_username.clone();
    match run_blocking(&state.db, move |db| db.rename_user(user_id, &name)).await? {
        WriteOutcome::Applied => {}
        WriteOutcome::NotFound => {
            return Err(ChatError::not_found(format!("User {} not found", user_id)).into());
        }
        WriteOutcome::Conflict => {
            return Err(ChatError::conflict(format!("Username '{}' is already taken", new_username)).into());
        }
    }

    info!("User {} renamed from {} to {}", user_id, claims.username, new_username);
    Ok(Json(RenameResponse {
        username: new_username,
    }))
}

/// Points the user at an already-stored avatar file. Upload itself is handled
/// elsewhere; only a bare file name is accepted here.
pub async fn change_avatar(
    State(state): State<AppState>,
    Extension(claims): Extension<Claims>,
    Json(req): Json<AvatarRequest>,
) -> ApiResult<Json<AvatarResponse>> {
    let avatar = req.avatar.trim().to_string();
    validate_avatar_ref(&avatar)?;

    let user_id = claims.sub;
    let stored = avatar.clone();
    if !run_blocking(&state.db, move |db| db.set_avatar(user_id, &stored)).await? {
        return Err(ChatError::not_found(format!("User {} not found", user_id)).into());
    }

    Ok(Json(AvatarResponse { avatar }))
}

fn validate_avatar_ref(avatar: &str) -> Result<(), ChatError> {
    if avatar.is_empty() {
        return Err(ChatError::validation("Avatar reference cannot be empty"));
    }
    if avatar.len() > MAX_AVATAR_REF_LEN {
        return Err(ChatError::validation("Avatar reference is too long"));
    }
    if avatar.contains(['/', '\\']) || avatar.contains("..") {
        return Err(ChatError::validation("Avatar reference must be a plain file name"));
    }
    Ok(())
}

use std::sync::Arc;

use argon2::{Argon2, PasswordHash, PasswordHasher, PasswordVerifier, password_hash::{SaltString, rand_core::OsRng}};
use axum::{Json, extract::State, http::StatusCode, response::IntoResponse};
use jsonwebtoken::{EncodingKey, Header, encode};
use tracing::{error, info, warn};

use murmur_db::Database;
use murmur_gateway::SessionGateway;
use murmur_gateway::store::run_blocking;
use murmur_types::ChatError;
use murmur_types::api::{Claims, LoginRequest, LoginResponse, RegisterRequest, RegisterResponse};
use murmur_types::models::UserId;

use crate::error::{ApiError, ApiResult};

pub const MIN_USERNAME_LEN: usize = 3;
pub const MAX_USERNAME_LEN: usize = 32;
pub const MIN_PASSWORD_LEN: usize = 6;

pub type AppState = Arc<AppStateInner>;

pub struct AppStateInner {
    pub db: Arc<Database>,
    pub gateway: SessionGateway,
    pub jwt_secret: String,
    /// Shared code that unlocks username changes.
    pub rename_code: String,
    /// Code that grants the admin role at login; `None` disables admin logins.
    pub admin_code: Option<String>,
}

impl AppStateInner {
    pub fn new(
        gateway: SessionGateway,
        jwt_secret: String,
        rename_code: String,
        admin_code: Option<String>,
    ) -> AppState {
        Arc::new(Self {
            db: gateway.db().clone(),
            gateway,
            jwt_secret,
            rename_code,
            admin_code,
        })
    }
}

pub fn validate_username(username: &str) -> Result<(), ChatError> {
    let len = username.chars().count();
    if len < MIN_USERNAME_LEN {
        return Err(ChatError::validation(format!(
            "Username must be at least {} characters",
            MIN_USERNAME_LEN
        )));
    }
    if len > MAX_USERNAME_LEN {
        return Err(ChatError::validation(format!(
            "Username must be at most {} characters",
            MAX_USERNAME_LEN
        )));
    }
    Ok(())
}

pub async fn register(
    State(state): State<AppState>,
    Json(req): Json<RegisterRequest>,
) -> ApiResult<impl IntoResponse> {
    let username = req.username.trim().to_string();
    validate_username(&username)?;
    if req.password.chars().count() < MIN_PASSWORD_LEN {
        return Err(ChatError::validation(format!(
            "Password must be at least {} characters",
            MIN_PASSWORD_LEN
        ))
        .into());
    }

    // Hash password with Argon2id
    let salt = SaltString::generate(&mut OsRng);
    let password_hash = Argon2::default()
        .hash_password(req.password.as_bytes(), &salt)
        .map_err(|e| {
            error!("Password hashing failed: {}", e);
            ApiError::internal()
        })?
        .to_string();

    let name = username.clone();
    let user = run_blocking(&state.db, move |db| db.create_user(&name, &password_hash))
        .await?
        .ok_or_else(|| ChatError::conflict(format!("Username '{}' is already taken", username)))?;

    let token = create_token(&state.jwt_secret, user.id, &user.username, false).map_err(|e| {
        error!("Token creation failed: {}", e);
        ApiError::internal()
    })?;

    info!("Registered {} ({})", user.username, user.id);
    Ok((
        StatusCode::CREATED,
        Json(RegisterResponse {
            user_id: user.id,
            username: user.username,
            avatar: user.avatar,
            token,
        }),
    ))
}

/// Credential check only. Going online happens when the token is presented to
/// the gateway.
pub async fn login(
    State(state): State<AppState>,
    Json(req): Json<LoginRequest>,
) -> ApiResult<Json<LoginResponse>> {
    let username = req.username.trim().to_string();
    if username.is_empty() || req.password.is_empty() {
        return Err(ChatError::validation("Username and password are required").into());
    }

    let user = run_blocking(&state.db, move |db| db.get_user_by_username(&username))
        .await?
        .ok_or_else(|| ChatError::auth("Invalid username or password"))?;

    // Verify password
    let parsed_hash = PasswordHash::new(&user.password).map_err(|e| {
        error!("Stored hash for {} is unreadable: {}", user.id, e);
        ApiError::internal()
    })?;

    Argon2::default()
        .verify_password(req.password.as_bytes(), &parsed_hash)
        .map_err(|_| ChatError::auth("Invalid username or password"))?;

    let admin = match (req.admin_code.as_deref(), state.admin_code.as_deref()) {
        (None, _) => false,
        (Some(given), Some(expected)) if given == expected => {
            warn!("Admin session granted to {} ({})", user.username, user.id);
            true
        }
        (Some(_), _) => return Err(ChatError::auth("Invalid admin code").into()),
    };

    let token = create_token(&state.jwt_secret, user.id, &user.username, admin).map_err(|e| {
        error!("Token creation failed: {}", e);
        ApiError::internal()
    })?;

    Ok(Json(LoginResponse {
        user: user.into_user(),
        token,
        admin,
    }))
}

pub fn create_token(secret: &str, user_id: UserId, username: &str, admin: bool) -> anyhow::Result<String> {
    let claims = Claims {
        sub: user_id,
        username: username.to_string(),
        admin,
        exp: (chrono::Utc::now() + chrono::Duration::days(30)).timestamp() as usize,
    };

    let token = encode(
        &Header::default(),
        &claims,
        &EncodingKey::from_secret(secret.as_bytes()),
    )?;

    Ok(token)
}

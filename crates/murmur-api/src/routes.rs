use axum::{
    Router,
    extract::{State, WebSocketUpgrade},
    middleware,
    response::IntoResponse,
    routing::{get, post},
};

use murmur_gateway::connection;

use crate::admin;
use crate::auth::{self, AppState};
use crate::middleware::{require_admin, require_auth};
use crate::users;

/// Every HTTP route plus the WebSocket gateway, with state attached.
pub fn router(state: AppState) -> Router {
    let public_routes = Router::new()
        .route("/api/register", post(auth::register))
        .route("/api/login", post(auth::login))
        .route("/gateway", get(ws_upgrade))
        .route("/health", get(health));

    let protected_routes = Router::new()
        .route("/api/users", get(users::list_users))
        .route("/api/users/rename", post(users::rename))
        .route("/api/users/avatar", post(users::change_avatar))
        .route("/api/messages/{user_a}/{user_b}", get(users::get_conversation))
        .layer(middleware::from_fn_with_state(state.clone(), require_auth));

    let admin_routes = Router::new()
        .route("/api/admin/users", get(admin::list_users))
        .route("/api/admin/users/{user_id}", get(admin::user_detail))
        .route("/api/admin/messages", get(admin::list_messages))
        .route("/api/admin/kick", post(admin::kick_user))
        .route("/api/admin/color", post(admin::set_color))
        .layer(middleware::from_fn(require_admin))
        .layer(middleware::from_fn_with_state(state.clone(), require_auth));

    Router::new()
        .merge(public_routes)
        .merge(protected_routes)
        .merge(admin_routes)
        .with_state(state)
}

async fn ws_upgrade(State(state): State<AppState>, ws: WebSocketUpgrade) -> impl IntoResponse {
    let gateway = state.gateway.clone();
    let jwt_secret = state.jwt_secret.clone();
    ws.on_upgrade(move |socket| connection::handle_connection(socket, gateway, jwt_secret))
}

async fn health() -> &'static str {
    "ok"
}

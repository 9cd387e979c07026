pub mod health;

use axum::{
    routing::{get, post, put},
    Router,
};

use crate::sessions::handlers;
use crate::state::AppState;

pub fn build_router(state: AppState) -> Router {
    Router::new()
        .route("/health", get(health::health_handler))
        // Sessions API
        .route("/api/v1/sessions", post(handlers::handle_create_session))
        .route(
            "/api/v1/sessions/:id",
            get(handlers::handle_get_session).delete(handlers::handle_discard_session),
        )
        .route(
            "/api/v1/sessions/:id/builds",
            post(handlers::handle_start_build),
        )
        .route("/api/v1/sessions/:id/reset", post(handlers::handle_reset))
        .route(
            "/api/v1/sessions/:id/reconnect",
            post(handlers::handle_reconnect),
        )
        .route(
            "/api/v1/sessions/:id/tasks/:task_id/retry",
            post(handlers::handle_retry_task),
        )
        .route(
            "/api/v1/sessions/:id/sections/:section_id/regenerate",
            post(handlers::handle_regenerate_section),
        )
        .route("/api/v1/sessions/:id/chat", post(handlers::handle_chat))
        .route("/api/v1/sessions/:id/undo", post(handlers::handle_undo))
        .route(
            "/api/v1/sessions/:id/files",
            get(handlers::handle_list_files).put(handlers::handle_edit_file),
        )
        .route("/api/v1/sessions/:id/active", put(handlers::handle_set_active))
        .route("/api/v1/sessions/:id/preview", get(handlers::handle_preview))
        .with_state(state)
}

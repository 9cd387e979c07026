//! Axum route handlers for the Sessions API.

use axum::{
    extract::{Path, Query, State},
    http::{header, StatusCode},
    response::IntoResponse,
    Json,
};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::build_service::StartBuildRequest;
use crate::errors::AppError;
use crate::sessions::ChatTurn;
use crate::state::AppState;
use crate::workspace::files::{normalize_path, VirtualFile, WriteOutcome};
use crate::workspace::session::SessionView;

// ────────────────────────────────────────────────────────────────────────────
// Request / Response types
// ────────────────────────────────────────────────────────────────────────────

#[derive(Debug, Serialize)]
pub struct CreateSessionResponse {
    pub session_id: Uuid,
}

#[derive(Debug, Deserialize)]
pub struct RegenerateRequest {
    #[serde(default)]
    pub prompt: Option<String>,
}

#[derive(Debug, Deserialize)]
pub struct ChatMessageRequest {
    pub message: String,
}

#[derive(Debug, Deserialize)]
pub struct EditFileRequest {
    pub path: String,
    pub content: String,
}

#[derive(Debug, Serialize)]
pub struct EditFileResponse {
    pub path: String,
    pub changed: bool,
}

#[derive(Debug, Deserialize)]
pub struct ListFilesQuery {
    #[serde(default)]
    pub dir: Option<String>,
}

#[derive(Debug, Deserialize)]
pub struct SetActiveRequest {
    pub path: String,
}

#[derive(Debug, Serialize)]
pub struct CommandAccepted {
    pub status: &'static str,
}

// ────────────────────────────────────────────────────────────────────────────
// Handlers
// ────────────────────────────────────────────────────────────────────────────

/// POST /api/v1/sessions
pub async fn handle_create_session(
    State(state): State<AppState>,
) -> (StatusCode, Json<CreateSessionResponse>) {
    let session_id = state.sessions.create().await;
    (StatusCode::CREATED, Json(CreateSessionResponse { session_id }))
}

/// GET /api/v1/sessions/:id
pub async fn handle_get_session(
    State(state): State<AppState>,
    Path(id): Path<Uuid>,
) -> Result<Json<SessionView>, AppError> {
    Ok(Json(state.sessions.view(id).await?))
}

/// DELETE /api/v1/sessions/:id
pub async fn handle_discard_session(
    State(state): State<AppState>,
    Path(id): Path<Uuid>,
) -> Result<StatusCode, AppError> {
    state.sessions.discard(id).await?;
    Ok(StatusCode::NO_CONTENT)
}

/// POST /api/v1/sessions/:id/builds
///
/// Starts a build on the remote service and begins tracking it. Prior tasks,
/// files and chat history of the session are discarded.
pub async fn handle_start_build(
    State(state): State<AppState>,
    Path(id): Path<Uuid>,
    Json(request): Json<StartBuildRequest>,
) -> Result<(StatusCode, Json<SessionView>), AppError> {
    let view = state.sessions.start(id, request).await?;
    Ok((StatusCode::ACCEPTED, Json(view)))
}

/// POST /api/v1/sessions/:id/reset
pub async fn handle_reset(
    State(state): State<AppState>,
    Path(id): Path<Uuid>,
) -> Result<Json<SessionView>, AppError> {
    Ok(Json(state.sessions.reset(id).await?))
}

/// POST /api/v1/sessions/:id/reconnect
pub async fn handle_reconnect(
    State(state): State<AppState>,
    Path(id): Path<Uuid>,
) -> Result<Json<SessionView>, AppError> {
    Ok(Json(state.sessions.reconnect(id).await?))
}

/// POST /api/v1/sessions/:id/tasks/:task_id/retry
///
/// Accepted means the build service took the command. The task's status only
/// changes once its events arrive.
pub async fn handle_retry_task(
    State(state): State<AppState>,
    Path((id, task_id)): Path<(Uuid, String)>,
) -> Result<(StatusCode, Json<CommandAccepted>), AppError> {
    state.sessions.retry_task(id, &task_id).await?;
    Ok((
        StatusCode::ACCEPTED,
        Json(CommandAccepted { status: "retrying" }),
    ))
}

/// POST /api/v1/sessions/:id/sections/:section_id/regenerate
pub async fn handle_regenerate_section(
    State(state): State<AppState>,
    Path((id, section_id)): Path<(Uuid, String)>,
    body: Option<Json<RegenerateRequest>>,
) -> Result<(StatusCode, Json<CommandAccepted>), AppError> {
    let prompt = body.and_then(|Json(request)| request.prompt);
    state
        .sessions
        .regenerate_section(id, &section_id, prompt.as_deref())
        .await?;
    Ok((
        StatusCode::ACCEPTED,
        Json(CommandAccepted {
            status: "regenerating",
        }),
    ))
}

/// POST /api/v1/sessions/:id/chat
pub async fn handle_chat(
    State(state): State<AppState>,
    Path(id): Path<Uuid>,
    Json(request): Json<ChatMessageRequest>,
) -> Result<Json<ChatTurn>, AppError> {
    Ok(Json(state.sessions.chat(id, &request.message).await?))
}

/// POST /api/v1/sessions/:id/undo
pub async fn handle_undo(
    State(state): State<AppState>,
    Path(id): Path<Uuid>,
) -> Result<Json<SessionView>, AppError> {
    Ok(Json(state.sessions.undo(id).await?))
}

/// GET /api/v1/sessions/:id/files?dir=/assets
pub async fn handle_list_files(
    State(state): State<AppState>,
    Path(id): Path<Uuid>,
    Query(query): Query<ListFilesQuery>,
) -> Result<Json<Vec<VirtualFile>>, AppError> {
    let dir = query.dir.as_deref().unwrap_or("/");
    Ok(Json(state.sessions.list_files(id, dir).await?))
}

/// PUT /api/v1/sessions/:id/files
pub async fn handle_edit_file(
    State(state): State<AppState>,
    Path(id): Path<Uuid>,
    Json(request): Json<EditFileRequest>,
) -> Result<Json<EditFileResponse>, AppError> {
    let outcome = state
        .sessions
        .edit_file(id, &request.path, &request.content)
        .await?;
    Ok(Json(EditFileResponse {
        path: normalize_path(&request.path),
        changed: outcome != WriteOutcome::Unchanged,
    }))
}

/// PUT /api/v1/sessions/:id/active
pub async fn handle_set_active(
    State(state): State<AppState>,
    Path(id): Path<Uuid>,
    Json(request): Json<SetActiveRequest>,
) -> Result<StatusCode, AppError> {
    state.sessions.set_active(id, &request.path).await?;
    Ok(StatusCode::NO_CONTENT)
}

/// GET /api/v1/sessions/:id/preview
///
/// The assembled document, meant for a sandboxed frame.
pub async fn handle_preview(
    State(state): State<AppState>,
    Path(id): Path<Uuid>,
) -> Result<impl IntoResponse, AppError> {
    let html = state.sessions.preview(id).await?;
    Ok((
        [(header::CONTENT_TYPE, "text/html; charset=utf-8")],
        html,
    ))
}

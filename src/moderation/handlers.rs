use axum::{
    extract::{Path, State},
    routing::put,
    Json, Router,
};
use tracing::instrument;

use super::dto::SetRoleRequest;
use crate::{
    auth::AuthUser,
    error::{MessageResponse, ServiceResult},
    state::AppState,
    users::validation::parse_user_id,
};

pub fn moderation_routes() -> Router<AppState> {
    Router::new()
        .route("/moder/role/:id", put(set_role))
        .route("/moder/ban/:id", put(ban))
        .route("/moder/unban/:id", put(unban))
}

#[instrument(skip(state, editor, body), fields(editor = %editor.id))]
pub async fn set_role(
    State(state): State<AppState>,
    AuthUser(editor): AuthUser,
    Path(id): Path<String>,
    Json(body): Json<SetRoleRequest>,
) -> ServiceResult<Json<MessageResponse>> {
    let id = parse_user_id(&id)?;
    state.moderation.set_role(&editor, id, &body.role_name).await?;
    Ok(MessageResponse::success("Role updated"))
}

#[instrument(skip(state, editor), fields(editor = %editor.id))]
pub async fn ban(
    State(state): State<AppState>,
    AuthUser(editor): AuthUser,
    Path(id): Path<String>,
) -> ServiceResult<Json<MessageResponse>> {
    let id = parse_user_id(&id)?;
    state.moderation.ban(&editor, id).await?;
    Ok(MessageResponse::success("User banned"))
}

#[instrument(skip(state, editor), fields(editor = %editor.id))]
pub async fn unban(
    State(state): State<AppState>,
    AuthUser(editor): AuthUser,
    Path(id): Path<String>,
) -> ServiceResult<Json<MessageResponse>> {
    let id = parse_user_id(&id)?;
    state.moderation.unban(&editor, id).await?;
    Ok(MessageResponse::success("User unbanned"))
}

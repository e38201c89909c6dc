use super::{error_response, turn_error_response};
use crate::state::AppState;
use axum::{
    extract::{Path, State},
    http::StatusCode,
    response::Response,
    routing::get,
    Json, Router,
};
use makeit::errors::{StoreError, TurnError};
use makeit::models::session::UserRecord;
use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;

#[derive(Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
struct UserResponse {
    user_id: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    email: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    display_name: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    session_ids: Option<Vec<String>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    escalated_session_ids: Option<Vec<String>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    inviter: Option<String>,
}

impl From<UserRecord> for UserResponse {
    fn from(user: UserRecord) -> Self {
        // Empty sets are left out rather than sent as []
        let non_empty = |ids: BTreeSet<String>| -> Option<Vec<String>> {
            (!ids.is_empty()).then(|| ids.into_iter().collect())
        };
        Self {
            user_id: user.user_id,
            email: user.email,
            display_name: user.display_name,
            session_ids: non_empty(user.session_ids),
            escalated_session_ids: non_empty(user.escalated_session_ids),
            inviter: user.inviter,
        }
    }
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct UpdateUserRequest {
    #[serde(default)]
    display_name: Option<String>,
}

fn store_error_response(err: StoreError) -> Response {
    turn_error_response(&TurnError::Store(err))
}

async fn get_user(
    State(state): State<AppState>,
    Path(user_id): Path<String>,
) -> Result<Json<UserResponse>, Response> {
    let user = state
        .history()
        .user(&user_id)
        .await
        .map_err(store_error_response)?;
    Ok(Json(user.into()))
}

async fn update_user(
    State(state): State<AppState>,
    Path(user_id): Path<String>,
    Json(request): Json<UpdateUserRequest>,
) -> Result<Json<UserResponse>, Response> {
    let display_name = match request.display_name.filter(|name| !name.trim().is_empty()) {
        Some(display_name) => display_name,
        None => {
            return Err(error_response(
                StatusCode::BAD_REQUEST,
                "displayName is required",
            ))
        }
    };

    let history = state.history();
    history.user(&user_id).await.map_err(store_error_response)?;
    let user = history
        .set_display_name(&user_id, &display_name)
        .await
        .map_err(store_error_response)?;
    tracing::info!(%user_id, "display name updated");

    Ok(Json(user.into()))
}

// Configure routes for this module
pub fn routes(state: AppState) -> Router {
    Router::new()
        .route("/users/:user_id", get(get_user).put(update_user))
        .with_state(state)
}

// Export route modules
pub mod reply;
pub mod session;
pub mod user;

use axum::{http::StatusCode, response::IntoResponse, response::Response, Json, Router};
use makeit::errors::{StoreError, TurnError};
use serde::Serialize;

use crate::state::AppState;

#[derive(Debug, Serialize)]
pub struct ErrorResponse {
    pub message: String,
}

pub fn error_response(status: StatusCode, message: impl Into<String>) -> Response {
    (
        status,
        Json(ErrorResponse {
            message: message.into(),
        }),
    )
        .into_response()
}

pub fn status_for(err: &TurnError) -> StatusCode {
    match err {
        TurnError::InvalidInput(_) => StatusCode::BAD_REQUEST,
        TurnError::ModelInvocation(_) => StatusCode::BAD_GATEWAY,
        TurnError::Store(StoreError::NotFound { .. }) => StatusCode::NOT_FOUND,
        TurnError::Store(_) | TurnError::Prompt(_) => StatusCode::INTERNAL_SERVER_ERROR,
    }
}

pub fn turn_error_response(err: &TurnError) -> Response {
    error_response(status_for(err), err.to_string())
}

// Function to configure all routes
pub fn configure(state: AppState) -> Router {
    Router::new()
        .merge(reply::routes(state.clone()))
        .merge(session::routes(state.clone()))
        .merge(user::routes(state))
}

use super::{error_response, turn_error_response};
use crate::state::AppState;
use axum::{
    extract::{Path, Query, State},
    http::StatusCode,
    response::Response,
    routing::{get, post},
    Json, Router,
};
use makeit::errors::{StoreError, TurnError};
use makeit::models::session::{EntryKind, SessionRecord};
use serde::{Deserialize, Serialize};

const UNTITLED_SESSION: &str = "タイトル未生成";
const UNTITLED_LIST_ENTRY: &str = "タイトルなし";
// Shown for sessions that predate timestamp bookkeeping
const FALLBACK_TIMESTAMP: &str = "2024-09-01T08:06:43.753Z";

#[derive(Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
struct HistoryLine {
    role: String,
    message: String,
}

#[derive(Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
struct SessionResponse {
    session_id: String,
    session_title: String,
    session_history: Vec<HistoryLine>,
    is_escalated: bool,
    created_at: String,
    updated_at: String,
}

impl From<SessionRecord> for SessionResponse {
    fn from(session: SessionRecord) -> Self {
        Self {
            session_id: session.session_id,
            session_title: session.title.unwrap_or_else(|| UNTITLED_SESSION.to_string()),
            session_history: session
                .history
                .into_iter()
                .map(|entry| HistoryLine {
                    role: match entry.kind {
                        EntryKind::Human => "human".to_string(),
                        EntryKind::Ai => "ai".to_string(),
                    },
                    message: entry.text,
                })
                .collect(),
            is_escalated: session.is_escalated.unwrap_or(false),
            created_at: session
                .created_at
                .unwrap_or_else(|| FALLBACK_TIMESTAMP.to_string()),
            updated_at: session
                .updated_at
                .unwrap_or_else(|| FALLBACK_TIMESTAMP.to_string()),
        }
    }
}

#[derive(Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
struct SessionSummary {
    session_id: String,
    session_title: String,
    is_escalated: bool,
    created_at: String,
    updated_at: String,
}

impl SessionSummary {
    fn from_record(session: SessionRecord, escalated_list: bool) -> Self {
        Self {
            session_id: session.session_id,
            session_title: session
                .title
                .unwrap_or_else(|| UNTITLED_LIST_ENTRY.to_string()),
            is_escalated: session.is_escalated.unwrap_or(escalated_list),
            created_at: session
                .created_at
                .unwrap_or_else(|| FALLBACK_TIMESTAMP.to_string()),
            updated_at: session
                .updated_at
                .unwrap_or_else(|| FALLBACK_TIMESTAMP.to_string()),
        }
    }
}

#[derive(Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
struct ListSessionsResponse {
    sessions: Vec<SessionSummary>,
    escalated_sessions: Vec<SessionSummary>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct ListSessionsQuery {
    user_id: Option<String>,
}

#[derive(Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
struct EscalateRequest {
    from_user_id: String,
    /// Defaults to whoever invited `from_user_id`
    #[serde(default)]
    to_user_id: Option<String>,
}

fn store_error_response(err: StoreError) -> Response {
    turn_error_response(&TurnError::Store(err))
}

// Handlers
async fn get_session(
    State(state): State<AppState>,
    Path(session_id): Path<String>,
) -> Result<Json<SessionResponse>, Response> {
    let session = state
        .history()
        .session(&session_id)
        .await
        .map_err(store_error_response)?;
    Ok(Json(session.into()))
}

async fn list_sessions(
    State(state): State<AppState>,
    Query(query): Query<ListSessionsQuery>,
) -> Result<Json<ListSessionsResponse>, Response> {
    let user_id = match query.user_id.filter(|id| !id.trim().is_empty()) {
        Some(user_id) => user_id,
        None => return Err(error_response(StatusCode::BAD_REQUEST, "userId is required")),
    };

    let lists = state
        .history()
        .sessions_for_user(&user_id)
        .await
        .map_err(store_error_response)?;

    Ok(Json(ListSessionsResponse {
        sessions: lists
            .sessions
            .into_iter()
            .map(|s| SessionSummary::from_record(s, false))
            .collect(),
        escalated_sessions: lists
            .escalated_sessions
            .into_iter()
            .map(|s| SessionSummary::from_record(s, true))
            .collect(),
    }))
}

async fn escalate_session(
    State(state): State<AppState>,
    Path(session_id): Path<String>,
    Json(request): Json<EscalateRequest>,
) -> Result<StatusCode, Response> {
    let history = state.history();
    history
        .session(&session_id)
        .await
        .map_err(store_error_response)?;

    let inviter_id = match request.to_user_id.filter(|id| !id.trim().is_empty()) {
        Some(to_user_id) => to_user_id,
        None => {
            let user = history
                .user(&request.from_user_id)
                .await
                .map_err(store_error_response)?;
            match user.inviter {
                Some(inviter) => inviter,
                None => {
                    return Err(error_response(
                        StatusCode::NOT_FOUND,
                        format!("User {} has no inviter", request.from_user_id),
                    ))
                }
            }
        }
    };

    // Escalation never creates a user item
    history
        .user(&inviter_id)
        .await
        .map_err(store_error_response)?;

    history
        .escalate(&session_id, &inviter_id)
        .await
        .map_err(store_error_response)?;
    tracing::info!(%session_id, %inviter_id, "session escalated");

    Ok(StatusCode::NO_CONTENT)
}

// Configure routes for this module
pub fn routes(state: AppState) -> Router {
    Router::new()
        .route("/sessions", get(list_sessions))
        .route("/sessions/:session_id", get(get_session))
        .route("/sessions/:session_id/escalate", post(escalate_session))
        .with_state(state)
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::{body, body::Body, http::Request};
    use makeit::history::{HistoryStore, Tables};
    use makeit::models::message::Message;
    use makeit::models::session::SessionMetadata;
    use makeit::providers::mock::MockProvider;
    use makeit::reply::ReplyService;
    use makeit::store::{AttributeOp, Key, KeyValueStore, MemoryStore};
    use makeit::turn::TurnController;
    use serde_json::json;
    use std::sync::Arc;
    use tower::ServiceExt;

    fn app() -> (Router, Arc<MemoryStore>, HistoryStore) {
        let store = Arc::new(MemoryStore::new());
        let history = HistoryStore::new(store.clone(), Tables::default());
        let controller = TurnController::new(Arc::new(MockProvider::new(vec![])));
        let state = AppState::new(ReplyService::new(controller, history.clone()));
        (routes(state), store, history)
    }

    async fn json_body<T: serde::de::DeserializeOwned>(response: Response) -> T {
        let bytes = body::to_bytes(response.into_body(), usize::MAX).await.unwrap();
        serde_json::from_slice(&bytes).unwrap()
    }

    fn get_request(uri: &str) -> Request<Body> {
        Request::builder().uri(uri).body(Body::empty()).unwrap()
    }

    #[tokio::test]
    async fn test_get_session_with_defaults() {
        let (app, _, history) = app();
        history
            .append_exchange(
                "s1",
                &Message::human().with_text("質問"),
                &Message::assistant().with_text("回答"),
            )
            .await
            .unwrap();

        let response = app.oneshot(get_request("/sessions/s1")).await.unwrap();
        assert_eq!(response.status(), StatusCode::OK);

        let session: SessionResponse = json_body(response).await;
        assert_eq!(session.session_id, "s1");
        assert_eq!(session.session_title, "タイトル未生成");
        assert!(!session.is_escalated);
        assert_eq!(session.created_at, FALLBACK_TIMESTAMP);
        assert_eq!(session.session_history.len(), 2);
        assert_eq!(session.session_history[0].role, "human");
        assert_eq!(session.session_history[1].role, "ai");
        assert_eq!(session.session_history[1].message, "回答");
    }

    #[tokio::test]
    async fn test_get_unknown_session() {
        let (app, _, _) = app();
        let response = app.oneshot(get_request("/sessions/missing")).await.unwrap();
        assert_eq!(response.status(), StatusCode::NOT_FOUND);
    }

    #[tokio::test]
    async fn test_list_sessions() {
        let (app, store, history) = app();
        for (session_id, updated_at) in [
            ("old", "2024-10-01T09:00:00.000Z"),
            ("new", "2024-10-03T09:00:00.000Z"),
        ] {
            history
                .set_metadata(
                    session_id,
                    &SessionMetadata {
                        updated_at: Some(updated_at.to_string()),
                        ..Default::default()
                    },
                )
                .await
                .unwrap();
            history.add_session_membership("u1", session_id).await.unwrap();
        }
        store
            .update(
                "SessionTable",
                &Key::new("SessionId", "new"),
                &[AttributeOp::set("SessionTitle", "Wi-Fiの設定")],
            )
            .await
            .unwrap();
        history.add_escalated_membership("u1", "helped").await.unwrap();
        store
            .update(
                "SessionTable",
                &Key::new("SessionId", "helped"),
                &[AttributeOp::set("SessionTitle", "プリンター")],
            )
            .await
            .unwrap();

        let response = app
            .oneshot(get_request("/sessions?userId=u1"))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);

        let lists: ListSessionsResponse = json_body(response).await;
        let ids: Vec<&str> = lists.sessions.iter().map(|s| s.session_id.as_str()).collect();
        assert_eq!(ids, vec!["new", "old"]);
        assert_eq!(lists.sessions[0].session_title, "Wi-Fiの設定");
        assert_eq!(lists.sessions[1].session_title, "タイトルなし");
        assert_eq!(lists.escalated_sessions.len(), 1);
        assert!(lists.escalated_sessions[0].is_escalated);
    }

    #[tokio::test]
    async fn test_list_sessions_requires_user() {
        let (app, _, _) = app();
        let response = app.oneshot(get_request("/sessions")).await.unwrap();
        assert_eq!(response.status(), StatusCode::BAD_REQUEST);
    }

    #[tokio::test]
    async fn test_escalate_to_inviter() {
        let (app, store, history) = app();
        history
            .append_exchange(
                "s1",
                &Message::human().with_text("q"),
                &Message::assistant().with_text("a"),
            )
            .await
            .unwrap();
        store
            .update(
                "UserTable",
                &Key::new("UserId", "u1"),
                &[AttributeOp::set("Inviter", "family")],
            )
            .await
            .unwrap();
        store
            .update(
                "UserTable",
                &Key::new("UserId", "family"),
                &[AttributeOp::set("Email", "family@example.com")],
            )
            .await
            .unwrap();

        let request = Request::builder()
            .uri("/sessions/s1/escalate")
            .method("POST")
            .header("content-type", "application/json")
            .body(Body::from(json!({"fromUserId": "u1"}).to_string()))
            .unwrap();
        let response = app.oneshot(request).await.unwrap();
        assert_eq!(response.status(), StatusCode::NO_CONTENT);

        assert_eq!(history.session("s1").await.unwrap().is_escalated, Some(true));
        let inviter = history.user("family").await.unwrap();
        assert!(inviter.escalated_session_ids.contains("s1"));
    }

    #[tokio::test]
    async fn test_escalate_to_unknown_user() {
        let (app, _, history) = app();
        history
            .append_exchange(
                "s1",
                &Message::human().with_text("q"),
                &Message::assistant().with_text("a"),
            )
            .await
            .unwrap();

        let request = Request::builder()
            .uri("/sessions/s1/escalate")
            .method("POST")
            .header("content-type", "application/json")
            .body(Body::from(
                json!({"fromUserId": "u1", "toUserId": "nobody"}).to_string(),
            ))
            .unwrap();
        let response = app.oneshot(request).await.unwrap();
        assert_eq!(response.status(), StatusCode::NOT_FOUND);

        assert!(history.user("nobody").await.unwrap_err().is_not_found());
        assert_eq!(history.session("s1").await.unwrap().is_escalated, None);
    }

    #[tokio::test]
    async fn test_escalate_to_named_user() {
        let (app, store, history) = app();
        history
            .append_exchange(
                "s1",
                &Message::human().with_text("q"),
                &Message::assistant().with_text("a"),
            )
            .await
            .unwrap();
        store
            .update(
                "UserTable",
                &Key::new("UserId", "helper"),
                &[AttributeOp::set("Email", "helper@example.com")],
            )
            .await
            .unwrap();

        let request = Request::builder()
            .uri("/sessions/s1/escalate")
            .method("POST")
            .header("content-type", "application/json")
            .body(Body::from(
                json!({"fromUserId": "u1", "toUserId": "helper"}).to_string(),
            ))
            .unwrap();
        let response = app.oneshot(request).await.unwrap();
        assert_eq!(response.status(), StatusCode::NO_CONTENT);

        let helper = history.user("helper").await.unwrap();
        assert!(helper.escalated_session_ids.contains("s1"));
        assert_eq!(history.session("s1").await.unwrap().is_escalated, Some(true));
    }

    #[tokio::test]
    async fn test_escalate_without_inviter() {
        let (app, store, history) = app();
        history
            .append_exchange(
                "s1",
                &Message::human().with_text("q"),
                &Message::assistant().with_text("a"),
            )
            .await
            .unwrap();
        store
            .update(
                "UserTable",
                &Key::new("UserId", "u1"),
                &[AttributeOp::set("Email", "u1@example.com")],
            )
            .await
            .unwrap();

        let request = Request::builder()
            .uri("/sessions/s1/escalate")
            .method("POST")
            .header("content-type", "application/json")
            .body(Body::from(json!({"fromUserId": "u1"}).to_string()))
            .unwrap();
        let response = app.oneshot(request).await.unwrap();
        assert_eq!(response.status(), StatusCode::NOT_FOUND);
        assert_eq!(history.session("s1").await.unwrap().is_escalated, None);
    }
}

use super::turn_error_response;
use crate::state::AppState;
use axum::{
    extract::State,
    response::{IntoResponse, Response},
    routing::post,
    Json, Router,
};
use bytes::Bytes;
use futures::{stream::StreamExt, Stream};
use makeit::reply::TurnRequest;
use std::{
    convert::Infallible,
    pin::Pin,
    task::{Context, Poll},
    time::Duration,
};
use tokio::sync::mpsc;
use tokio::time::timeout;
use tokio_stream::wrappers::ReceiverStream;

/// Answer chunks written to the response body as they arrive
pub struct TextStreamResponse {
    rx: ReceiverStream<String>,
}

impl TextStreamResponse {
    fn new(rx: ReceiverStream<String>) -> Self {
        Self { rx }
    }
}

impl Stream for TextStreamResponse {
    type Item = Result<Bytes, Infallible>;

    fn poll_next(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        Pin::new(&mut self.rx)
            .poll_next(cx)
            .map(|opt| opt.map(|s| Ok(Bytes::from(s))))
    }
}

impl IntoResponse for TextStreamResponse {
    fn into_response(self) -> Response {
        let body = axum::body::Body::from_stream(self);

        (
            [
                (http::header::CONTENT_TYPE, "text/plain; charset=utf-8"),
                (http::header::CACHE_CONTROL, "no-cache"),
            ],
            body,
        )
            .into_response()
    }
}

async fn handler(
    State(state): State<AppState>,
    Json(request): Json<TurnRequest>,
) -> Result<TextStreamResponse, Response> {
    let mut tokens = state
        .replies
        .reply(request)
        .map_err(|e| turn_error_response(&e))?;

    // Failures before the first chunk still get a proper status code
    let first = match tokens.next().await {
        Some(Err(e)) => return Err(turn_error_response(&e)),
        Some(Ok(token)) => Some(token),
        None => None,
    };

    // Create channel for streaming
    let (tx, rx) = mpsc::channel(100);
    let stream = ReceiverStream::new(rx);

    tokio::spawn(async move {
        if let Some(token) = first {
            if tx.send(token).await.is_err() {
                return;
            }
        }

        loop {
            match timeout(Duration::from_millis(500), tokens.next()).await {
                Ok(Some(Ok(token))) => {
                    if let Err(e) = tx.send(token).await {
                        tracing::error!("Error sending token through channel: {}", e);
                        break;
                    }
                }
                Ok(Some(Err(e))) => {
                    tracing::error!("Turn failed mid-stream: {}", e);
                    break;
                }
                Ok(None) => break,
                Err(_) => {
                    // Heartbeat, used to detect disconnected clients and stop the turn
                    if tx.is_closed() {
                        break;
                    }
                }
            }
        }
    });

    Ok(TextStreamResponse::new(stream))
}

// Configure routes for this module
pub fn routes(state: AppState) -> Router {
    Router::new()
        .route("/reply", post(handler))
        .with_state(state)
}

use std::collections::HashMap;
use std::sync::{Arc, Weak};

use chrono::{DateTime, SecondsFormat, Utc};
use futures::stream::BoxStream;
use futures::StreamExt;
use serde::{Deserialize, Serialize};
use tokio::sync::{Mutex, OwnedMutexGuard};

use crate::emitter::{StreamEmitter, TurnBookkeeping};
use crate::errors::{TurnError, TurnResult};
use crate::history::HistoryStore;
use crate::models::message::Message;
use crate::models::session::ClientContext;
use crate::prompt_template::{human_prompt, system_prompt};
use crate::turn::{TurnController, TurnPrompt};

/// One user message to answer
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TurnRequest {
    #[serde(default)]
    pub user_id: String,
    #[serde(default)]
    pub session_id: String,
    #[serde(default)]
    pub message: String,
    /// RFC 3339 time the user sent the message
    #[serde(default, rename = "dateTime")]
    pub timestamp: String,
    #[serde(default, rename = "userAgent", skip_serializing_if = "Option::is_none")]
    pub client_context: Option<ClientContext>,
}

impl TurnRequest {
    /// Check the required fields and return the timestamp, normalized to UTC
    /// with millisecond precision
    pub fn validate(&self) -> TurnResult<String> {
        for (field, value) in [
            ("userId", &self.user_id),
            ("sessionId", &self.session_id),
            ("message", &self.message),
            ("dateTime", &self.timestamp),
        ] {
            if value.trim().is_empty() {
                return Err(TurnError::InvalidInput(field.to_string()));
            }
        }

        let timestamp = DateTime::parse_from_rfc3339(self.timestamp.trim())
            .map_err(|_| TurnError::InvalidInput("dateTime".to_string()))?;
        Ok(timestamp
            .with_timezone(&Utc)
            .to_rfc3339_opts(SecondsFormat::Millis, true))
    }
}

/// Hands out one lock per session so turns on a session never interleave
#[derive(Default)]
pub struct SessionLocks {
    locks: Mutex<HashMap<String, Weak<Mutex<()>>>>,
}

impl SessionLocks {
    pub fn new() -> Self {
        Self::default()
    }

    /// Wait for exclusive use of the session. Released when the guard drops.
    pub async fn acquire(&self, session_id: &str) -> OwnedMutexGuard<()> {
        let lock = {
            let mut locks = self.locks.lock().await;
            locks.retain(|_, lock| lock.strong_count() > 0);
            match locks.get(session_id).and_then(Weak::upgrade) {
                Some(lock) => lock,
                None => {
                    let lock = Arc::new(Mutex::new(()));
                    locks.insert(session_id.to_string(), Arc::downgrade(&lock));
                    lock
                }
            }
        };
        lock.lock_owned().await
    }
}

/// Answers turn requests: loads the session, runs the controller and streams
/// the answer while keeping the session records up to date
#[derive(Clone)]
pub struct ReplyService {
    controller: Arc<TurnController>,
    history: HistoryStore,
    locks: Arc<SessionLocks>,
}

impl ReplyService {
    pub fn new(controller: TurnController, history: HistoryStore) -> Self {
        Self {
            controller: Arc::new(controller),
            history,
            locks: Arc::new(SessionLocks::new()),
        }
    }

    pub fn history(&self) -> &HistoryStore {
        &self.history
    }

    /// Start a turn. Invalid requests are rejected here; everything after
    /// validation is reported through the returned stream.
    pub fn reply(&self, request: TurnRequest) -> TurnResult<BoxStream<'static, TurnResult<String>>> {
        let timestamp = request.validate()?;
        let controller = self.controller.clone();
        let history = self.history.clone();
        let locks = self.locks.clone();

        Ok(Box::pin(async_stream::stream! {
            let _guard = locks.acquire(&request.session_id).await;
            tracing::info!(
                session_id = %request.session_id,
                user_id = %request.user_id,
                "starting turn"
            );

            let prior = match history.load(&request.session_id).await {
                Ok(messages) => messages,
                Err(e) if e.is_not_found() => Vec::new(),
                Err(e) => {
                    yield Err(TurnError::from(e));
                    return;
                }
            };

            let prompts = system_prompt(&controller.tools()).and_then(|system| {
                human_prompt(&request.message, request.client_context.as_ref())
                    .map(|human| (system, human))
            });
            let (system, human) = match prompts {
                Ok(prompts) => prompts,
                Err(e) => {
                    yield Err(TurnError::Prompt(e.to_string()));
                    return;
                }
            };

            let bookkeeping = TurnBookkeeping {
                user_id: request.user_id.clone(),
                session_id: request.session_id.clone(),
                timestamp,
                first_turn: prior.is_empty() || request.client_context.is_some(),
            };
            let prompt = TurnPrompt::new(system, prior, Message::human().with_text(human));

            let emitter = StreamEmitter::new(history.clone());
            let mut tokens = emitter.emit(controller.run(prompt), bookkeeping);
            while let Some(token) = tokens.next().await {
                yield token;
            }
        }))
    }
}

//! Turns controller events into the caller-visible token stream and records
//! the turn once it is over.
use futures::stream::BoxStream;
use futures::StreamExt;

use crate::errors::TurnResult;
use crate::history::HistoryStore;
use crate::models::session::SessionMetadata;
use crate::providers::base::Delta;
use crate::turn::{Step, TurnEvent};

/// The text an event contributes to the answer, if any.
///
/// Only non-empty text deltas of the final step qualify; decision-step output,
/// tool traffic and bookkeeping events never reach the caller.
pub fn final_text(event: &TurnEvent) -> Option<&str> {
    match event {
        TurnEvent::Delta {
            step: Step::Final,
            delta: Delta::Text(text),
        } if !text.is_empty() => Some(text.as_str()),
        _ => None,
    }
}

pub fn final_tokens(events: &[TurnEvent]) -> Vec<String> {
    events
        .iter()
        .filter_map(final_text)
        .map(str::to_string)
        .collect()
}

/// Who and when to record a turn against
#[derive(Debug, Clone, PartialEq)]
pub struct TurnBookkeeping {
    pub user_id: String,
    pub session_id: String,
    /// Caller-supplied RFC 3339 timestamp of the turn
    pub timestamp: String,
    /// Register the session with the user and stamp its creation time
    pub first_turn: bool,
}

pub struct StreamEmitter {
    history: HistoryStore,
}

impl StreamEmitter {
    pub fn new(history: HistoryStore) -> Self {
        Self { history }
    }

    /// Forward the answer tokens of `events`.
    ///
    /// When the turn completes, the conversation pair is appended and the
    /// session metadata updated before the stream ends. A failure before any
    /// token was forwarded leaves the store untouched.
    pub fn emit<'a>(
        &self,
        mut events: BoxStream<'a, TurnResult<TurnEvent>>,
        bookkeeping: TurnBookkeeping,
    ) -> BoxStream<'a, TurnResult<String>> {
        let history = self.history.clone();
        Box::pin(async_stream::stream! {
            let mut forwarded = false;
            while let Some(event) = events.next().await {
                match event {
                    Ok(TurnEvent::Completed(outcome)) => {
                        if let Err(e) = history
                            .append_exchange(&bookkeeping.session_id, &outcome.human, &outcome.answer)
                            .await
                        {
                            tracing::warn!(
                                session_id = %bookkeeping.session_id,
                                error = %e,
                                "failed to append conversation history"
                            );
                        }
                        record_turn(&history, &bookkeeping).await;
                    }
                    Ok(event) => {
                        if let Some(text) = final_text(&event) {
                            forwarded = true;
                            yield Ok(text.to_string());
                        }
                    }
                    Err(e) => {
                        if forwarded {
                            record_turn(&history, &bookkeeping).await;
                        }
                        tracing::error!(session_id = %bookkeeping.session_id, error = %e, "turn failed");
                        yield Err(e);
                        break;
                    }
                }
            }
        })
    }
}

/// Session bookkeeping for a finished or partially answered turn. Failures are
/// logged and swallowed.
async fn record_turn(history: &HistoryStore, bookkeeping: &TurnBookkeeping) {
    let TurnBookkeeping {
        user_id,
        session_id,
        timestamp,
        first_turn,
    } = bookkeeping;

    if *first_turn {
        let creation = SessionMetadata {
            created_at: Some(timestamp.clone()),
            ..Default::default()
        };
        let (membership, created) = futures::join!(
            history.add_session_membership(user_id, session_id),
            history.set_metadata(session_id, &creation),
        );
        if let Err(e) = membership {
            tracing::warn!(%user_id, %session_id, error = %e, "failed to register session with user");
        }
        if let Err(e) = created {
            tracing::warn!(%session_id, error = %e, "failed to set session creation time");
        }
    }

    let updated = SessionMetadata {
        updated_at: Some(timestamp.clone()),
        ..Default::default()
    };
    if let Err(e) = history.set_metadata(session_id, &updated).await {
        tracing::warn!(%session_id, error = %e, "failed to set session update time");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::errors::{StoreError, TurnError};
    use crate::history::Tables;
    use crate::models::message::Message;
    use crate::store::{AttributeOp, Item, Key, KeyValueStore, MemoryStore};
    use crate::turn::TurnOutcome;
    use async_trait::async_trait;
    use futures::stream;
    use std::sync::Arc;

    const FIRST: &str = "2024-10-01T09:00:00.000Z";
    const SECOND: &str = "2024-10-02T09:00:00.000Z";

    fn history() -> HistoryStore {
        HistoryStore::new(Arc::new(MemoryStore::new()), Tables::default())
    }

    fn bookkeeping(timestamp: &str, first_turn: bool) -> TurnBookkeeping {
        TurnBookkeeping {
            user_id: "u1".into(),
            session_id: "s1".into(),
            timestamp: timestamp.into(),
            first_turn,
        }
    }

    fn delta(step: Step, text: &str) -> TurnEvent {
        TurnEvent::Delta {
            step,
            delta: Delta::Text(text.into()),
        }
    }

    fn completed(question: &str, answer: &str) -> TurnEvent {
        let human = Message::human().with_text(question);
        let answer = Message::assistant().with_text(answer);
        TurnEvent::Completed(TurnOutcome {
            transcript: vec![human.clone(), answer.clone()],
            human,
            answer,
            tool_rounds: 0,
        })
    }

    fn answered_turn(question: &str, answer: &str) -> Vec<TurnResult<TurnEvent>> {
        vec![
            Ok(delta(Step::Decide, answer)),
            Ok(TurnEvent::Appended(Message::assistant().with_text(answer))),
            Ok(delta(Step::Final, answer)),
            Ok(completed(question, answer)),
        ]
    }

    async fn emit_all(
        history: &HistoryStore,
        events: Vec<TurnResult<TurnEvent>>,
        bookkeeping: TurnBookkeeping,
    ) -> Vec<TurnResult<String>> {
        StreamEmitter::new(history.clone())
            .emit(Box::pin(stream::iter(events)), bookkeeping)
            .collect()
            .await
    }

    #[test]
    fn test_final_tokens_filter() {
        let events = vec![
            delta(Step::Decide, "thinking"),
            delta(Step::Final, ""),
            delta(Step::Final, "Wi-Fiを"),
            TurnEvent::Appended(Message::assistant().with_text("x")),
            delta(Step::Final, "オフにしてください"),
        ];
        let tokens = final_tokens(&events);
        assert_eq!(tokens, vec!["Wi-Fiを", "オフにしてください"]);
        assert_eq!(final_tokens(&events), tokens);

        let replayed: Vec<TurnEvent> = tokens.iter().map(|t| delta(Step::Final, t)).collect();
        assert_eq!(final_tokens(&replayed), tokens);
    }

    #[tokio::test]
    async fn test_first_turn_records_everything() {
        let history = history();
        let output = emit_all(
            &history,
            answered_turn("こんにちは", "こんにちは！"),
            bookkeeping(FIRST, true),
        )
        .await;

        assert_eq!(output, vec![Ok("こんにちは！".to_string())]);

        let session = history.session("s1").await.unwrap();
        assert_eq!(session.history.len(), 2);
        assert_eq!(session.created_at.as_deref(), Some(FIRST));
        assert_eq!(session.updated_at.as_deref(), Some(FIRST));

        let user = history.user("u1").await.unwrap();
        assert!(user.session_ids.contains("s1"));
    }

    #[tokio::test]
    async fn test_created_at_is_set_once() {
        let history = history();
        emit_all(&history, answered_turn("a", "b"), bookkeeping(FIRST, true)).await;
        emit_all(&history, answered_turn("c", "d"), bookkeeping(SECOND, false)).await;

        let session = history.session("s1").await.unwrap();
        assert_eq!(session.history.len(), 4);
        assert_eq!(session.created_at.as_deref(), Some(FIRST));
        assert_eq!(session.updated_at.as_deref(), Some(SECOND));
    }

    #[tokio::test]
    async fn test_failure_before_first_token_writes_nothing() {
        let history = history();
        let output = emit_all(
            &history,
            vec![Err(TurnError::ModelInvocation("throttled".into()))],
            bookkeeping(FIRST, true),
        )
        .await;

        assert_eq!(output, vec![Err(TurnError::ModelInvocation("throttled".into()))]);
        assert!(history.session("s1").await.unwrap_err().is_not_found());
        assert!(history.user("u1").await.unwrap_err().is_not_found());
    }

    #[tokio::test]
    async fn test_failure_after_tokens_still_stamps_session() {
        let history = history();
        let output = emit_all(
            &history,
            vec![
                Ok(delta(Step::Final, "途中")),
                Err(TurnError::ModelInvocation("reset".into())),
            ],
            bookkeeping(FIRST, true),
        )
        .await;

        assert_eq!(output.len(), 2);
        assert_eq!(output[0], Ok("途中".to_string()));
        assert!(output[1].is_err());

        let session = history.session("s1").await.unwrap();
        assert!(session.history.is_empty());
        assert_eq!(session.updated_at.as_deref(), Some(FIRST));
    }

    struct BrokenStore;

    #[async_trait]
    impl KeyValueStore for BrokenStore {
        async fn get(&self, _table: &str, _key: &Key) -> Result<Item, StoreError> {
            Err(StoreError::Backend("unavailable".into()))
        }

        async fn update(
            &self,
            _table: &str,
            _key: &Key,
            _ops: &[AttributeOp],
        ) -> Result<Item, StoreError> {
            Err(StoreError::Backend("unavailable".into()))
        }
    }

    #[tokio::test]
    async fn test_store_failures_do_not_fail_the_stream() {
        let history = HistoryStore::new(Arc::new(BrokenStore), Tables::default());
        let output = emit_all(&history, answered_turn("q", "a"), bookkeeping(FIRST, true)).await;
        assert_eq!(output, vec![Ok("a".to_string())]);
    }
}

//! Translation between the session/message model and the key-value store.
use std::collections::BTreeSet;
use std::sync::Arc;

use futures::future;
use serde_json::{Map, Value};

use crate::errors::StoreError;
use crate::models::message::Message;
use crate::models::session::{
    HistoryEntry, SessionMetadata, SessionRecord, UserRecord, UserSessions,
};
use crate::store::{AttributeOp, Item, Key, KeyValueStore};

/// Attribute names of the session and user items
pub mod attributes {
    pub const SESSION_ID: &str = "SessionId";
    pub const SESSION_TITLE: &str = "SessionTitle";
    pub const SESSION_SUMMARY: &str = "SessionSummary";
    pub const HISTORY: &str = "History";
    pub const IS_ESCALATED: &str = "IsEscalated";
    pub const CREATED_AT: &str = "CreatedAt";
    pub const UPDATED_AT: &str = "UpdatedAt";

    pub const USER_ID: &str = "UserId";
    pub const EMAIL: &str = "Email";
    pub const DISPLAY_NAME: &str = "DisplayName";
    pub const SESSION_IDS: &str = "SessionIds";
    pub const ESCALATED_SESSION_IDS: &str = "EscalatedSessionIds";
    pub const INVITER: &str = "Inviter";
}

use attributes::*;

/// Names of the two logical tables
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Tables {
    pub sessions: String,
    pub users: String,
}

impl Default for Tables {
    fn default() -> Self {
        Self {
            sessions: "SessionTable".to_string(),
            users: "UserTable".to_string(),
        }
    }
}

/// Session history and bookkeeping on top of a [`KeyValueStore`]
#[derive(Clone)]
pub struct HistoryStore {
    store: Arc<dyn KeyValueStore>,
    tables: Tables,
}

impl HistoryStore {
    pub fn new(store: Arc<dyn KeyValueStore>, tables: Tables) -> Self {
        Self { store, tables }
    }

    fn session_key(session_id: &str) -> Key {
        Key::new(SESSION_ID, session_id)
    }

    fn user_key(user_id: &str) -> Key {
        Key::new(USER_ID, user_id)
    }

    /// Load the ordered conversation memory of a session.
    ///
    /// Fails with `NotFound` when the session has no history yet; callers on
    /// the first turn treat that as an empty history.
    pub async fn load(&self, session_id: &str) -> Result<Vec<Message>, StoreError> {
        let item = self
            .store
            .get(&self.tables.sessions, &Self::session_key(session_id))
            .await?;

        match item.get(HISTORY) {
            None | Some(Value::Null) => Err(StoreError::not_found(&self.tables.sessions, session_id)),
            Some(history) => {
                let entries: Vec<HistoryEntry> = serde_json::from_value(history.clone())?;
                Ok(entries.iter().map(Message::from).collect())
            }
        }
    }

    /// Append one message to the persisted history
    pub async fn append(&self, session_id: &str, message: &Message) -> Result<(), StoreError> {
        self.append_entries(session_id, vec![HistoryEntry::from(message)])
            .await
    }

    /// Append a human/assistant pair in a single store update
    pub async fn append_exchange(
        &self,
        session_id: &str,
        human: &Message,
        answer: &Message,
    ) -> Result<(), StoreError> {
        self.append_entries(
            session_id,
            vec![HistoryEntry::from(human), HistoryEntry::from(answer)],
        )
        .await
    }

    async fn append_entries(
        &self,
        session_id: &str,
        entries: Vec<HistoryEntry>,
    ) -> Result<(), StoreError> {
        let values = entries
            .into_iter()
            .map(serde_json::to_value)
            .collect::<Result<Vec<_>, _>>()?;
        self.store
            .update(
                &self.tables.sessions,
                &Self::session_key(session_id),
                &[AttributeOp::append_to_list(HISTORY, values)],
            )
            .await?;
        Ok(())
    }

    /// Partial update of the session bookkeeping attributes
    pub async fn set_metadata(
        &self,
        session_id: &str,
        metadata: &SessionMetadata,
    ) -> Result<(), StoreError> {
        if metadata.is_empty() {
            return Ok(());
        }

        let mut ops = Vec::new();
        if let Some(created_at) = &metadata.created_at {
            ops.push(AttributeOp::set_if_absent(CREATED_AT, created_at.as_str()));
        }
        if let Some(updated_at) = &metadata.updated_at {
            ops.push(AttributeOp::set_if_greater(UPDATED_AT, updated_at.as_str()));
        }
        if let Some(is_escalated) = metadata.is_escalated {
            ops.push(AttributeOp::set(IS_ESCALATED, is_escalated));
        }

        self.store
            .update(&self.tables.sessions, &Self::session_key(session_id), &ops)
            .await?;
        Ok(())
    }

    /// Register the session under the user's session list
    pub async fn add_session_membership(
        &self,
        user_id: &str,
        session_id: &str,
    ) -> Result<(), StoreError> {
        self.add_to_user_set(user_id, SESSION_IDS, session_id).await
    }

    /// Register the session under the user's escalated session list
    pub async fn add_escalated_membership(
        &self,
        user_id: &str,
        session_id: &str,
    ) -> Result<(), StoreError> {
        self.add_to_user_set(user_id, ESCALATED_SESSION_IDS, session_id)
            .await
    }

    async fn add_to_user_set(
        &self,
        user_id: &str,
        attribute: &str,
        session_id: &str,
    ) -> Result<(), StoreError> {
        self.store
            .update(
                &self.tables.users,
                &Self::user_key(user_id),
                &[AttributeOp::add_to_set(attribute, vec![session_id.to_string()])],
            )
            .await?;
        Ok(())
    }

    /// Overwrite the user's display name and return the updated user
    pub async fn set_display_name(
        &self,
        user_id: &str,
        display_name: &str,
    ) -> Result<UserRecord, StoreError> {
        let item = self
            .store
            .update(
                &self.tables.users,
                &Self::user_key(user_id),
                &[AttributeOp::set(DISPLAY_NAME, display_name)],
            )
            .await?;
        user_from_item(&item)
    }

    /// Hand a session over to a human: flag it and list it under the inviter.
    /// The two writes touch different items and are issued together.
    pub async fn escalate(&self, session_id: &str, inviter_id: &str) -> Result<(), StoreError> {
        let flag = SessionMetadata {
            is_escalated: Some(true),
            ..Default::default()
        };
        let (flagged, listed) = futures::join!(
            self.set_metadata(session_id, &flag),
            self.add_escalated_membership(inviter_id, session_id),
        );
        flagged?;
        listed
    }

    pub async fn session(&self, session_id: &str) -> Result<SessionRecord, StoreError> {
        let item = self
            .store
            .get(&self.tables.sessions, &Self::session_key(session_id))
            .await?;
        session_from_item(&item)
    }

    pub async fn user(&self, user_id: &str) -> Result<UserRecord, StoreError> {
        let item = self
            .store
            .get(&self.tables.users, &Self::user_key(user_id))
            .await?;
        user_from_item(&item)
    }

    /// Resolve the user's session lists into session records, newest first.
    /// Ids whose session item is gone are skipped.
    pub async fn sessions_for_user(&self, user_id: &str) -> Result<UserSessions, StoreError> {
        let user = self.user(user_id).await?;
        let (sessions, escalated_sessions) = futures::try_join!(
            self.resolve_sessions(&user.session_ids),
            self.resolve_sessions(&user.escalated_session_ids),
        )?;
        Ok(UserSessions {
            sessions,
            escalated_sessions,
        })
    }

    async fn resolve_sessions(
        &self,
        session_ids: &BTreeSet<String>,
    ) -> Result<Vec<SessionRecord>, StoreError> {
        let lookups = session_ids.iter().map(|id| self.session(id));
        let mut sessions = Vec::with_capacity(session_ids.len());
        for (id, result) in session_ids.iter().zip(future::join_all(lookups).await) {
            match result {
                Ok(session) => sessions.push(session),
                Err(e) if e.is_not_found() => {
                    tracing::warn!(session_id = %id, "listed session has no item, skipping");
                }
                Err(e) => return Err(e),
            }
        }
        sessions.sort_by(|a, b| b.updated_at.cmp(&a.updated_at));
        Ok(sessions)
    }
}

fn string_attr(item: &Map<String, Value>, attribute: &str) -> Result<Option<String>, StoreError> {
    match item.get(attribute) {
        None | Some(Value::Null) => Ok(None),
        Some(Value::String(s)) => Ok(Some(s.clone())),
        Some(other) => Err(StoreError::Malformed(format!(
            "{} should be a string, got {}",
            attribute, other
        ))),
    }
}

fn required_string_attr(item: &Item, attribute: &str) -> Result<String, StoreError> {
    string_attr(item, attribute)?
        .ok_or_else(|| StoreError::Malformed(format!("item has no {}", attribute)))
}

fn set_attr(item: &Item, attribute: &str) -> Result<BTreeSet<String>, StoreError> {
    match item.get(attribute) {
        None | Some(Value::Null) => Ok(BTreeSet::new()),
        Some(value) => Ok(serde_json::from_value(value.clone())?),
    }
}

pub fn session_from_item(item: &Item) -> Result<SessionRecord, StoreError> {
    let history = match item.get(HISTORY) {
        None | Some(Value::Null) => Vec::new(),
        Some(value) => serde_json::from_value(value.clone())?,
    };
    let is_escalated = match item.get(IS_ESCALATED) {
        None | Some(Value::Null) => None,
        Some(Value::Bool(flag)) => Some(*flag),
        Some(other) => {
            return Err(StoreError::Malformed(format!(
                "{} should be a bool, got {}",
                IS_ESCALATED, other
            )))
        }
    };

    Ok(SessionRecord {
        session_id: required_string_attr(item, SESSION_ID)?,
        title: string_attr(item, SESSION_TITLE)?,
        summary: string_attr(item, SESSION_SUMMARY)?,
        history,
        is_escalated,
        created_at: string_attr(item, CREATED_AT)?,
        updated_at: string_attr(item, UPDATED_AT)?,
    })
}

pub fn user_from_item(item: &Item) -> Result<UserRecord, StoreError> {
    Ok(UserRecord {
        user_id: required_string_attr(item, USER_ID)?,
        email: string_attr(item, EMAIL)?,
        display_name: string_attr(item, DISPLAY_NAME)?,
        session_ids: set_attr(item, SESSION_IDS)?,
        escalated_session_ids: set_attr(item, ESCALATED_SESSION_IDS)?,
        inviter: string_attr(item, INVITER)?,
    })
}

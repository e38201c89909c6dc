use std::collections::BTreeSet;

use serde::{Deserialize, Serialize};

use super::message::Message;
use super::role::Role;

/// Device descriptors sent along with a turn. Only ever folded into prompt text.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ClientContext {
    pub os_name: String,
    pub browser_name: String,
    pub device_name: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum EntryKind {
    #[serde(rename = "human")]
    Human,
    #[serde(rename = "ai")]
    Ai,
}

/// One persisted line of conversation memory
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct HistoryEntry {
    #[serde(rename = "type")]
    pub kind: EntryKind,
    pub text: String,
}

impl HistoryEntry {
    pub fn human<S: Into<String>>(text: S) -> Self {
        Self {
            kind: EntryKind::Human,
            text: text.into(),
        }
    }

    pub fn ai<S: Into<String>>(text: S) -> Self {
        Self {
            kind: EntryKind::Ai,
            text: text.into(),
        }
    }
}

impl From<&HistoryEntry> for Message {
    fn from(entry: &HistoryEntry) -> Self {
        match entry.kind {
            EntryKind::Human => Message::human().with_text(entry.text.clone()),
            EntryKind::Ai => Message::assistant().with_text(entry.text.clone()),
        }
    }
}

impl From<&Message> for HistoryEntry {
    fn from(message: &Message) -> Self {
        match message.role {
            Role::Human => HistoryEntry::human(message.text()),
            Role::Assistant => HistoryEntry::ai(message.text()),
        }
    }
}

/// A session item as stored in the sessions table
#[derive(Debug, Clone, Default, PartialEq)]
pub struct SessionRecord {
    pub session_id: String,
    pub title: Option<String>,
    pub summary: Option<String>,
    pub history: Vec<HistoryEntry>,
    pub is_escalated: Option<bool>,
    pub created_at: Option<String>,
    pub updated_at: Option<String>,
}

/// A user item as stored in the users table
#[derive(Debug, Clone, Default, PartialEq)]
pub struct UserRecord {
    pub user_id: String,
    pub email: Option<String>,
    pub display_name: Option<String>,
    pub session_ids: BTreeSet<String>,
    pub escalated_session_ids: BTreeSet<String>,
    pub inviter: Option<String>,
}

/// Partial update of session bookkeeping attributes. `None` fields are left untouched.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct SessionMetadata {
    /// Only written when the session has no creation stamp yet
    pub created_at: Option<String>,
    /// Never moves an existing stamp backwards
    pub updated_at: Option<String>,
    pub is_escalated: Option<bool>,
}

impl SessionMetadata {
    pub fn is_empty(&self) -> bool {
        self.created_at.is_none() && self.updated_at.is_none() && self.is_escalated.is_none()
    }
}

/// The sessions a user belongs to, split the way the session list screen shows them
#[derive(Debug, Clone, Default, PartialEq)]
pub struct UserSessions {
    pub sessions: Vec<SessionRecord>,
    pub escalated_sessions: Vec<SessionRecord>,
}

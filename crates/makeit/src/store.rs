//! The durable key-value store the session and user tables live in.
//!
//! The store itself is an external collaborator; this module only fixes the
//! interface the core needs (get an item, apply attribute operations to an
//! item) and ships two backends: a process-local one and a JSON file one.
mod file;

pub use file::JsonFileStore;

use std::collections::{BTreeSet, HashMap};

use async_trait::async_trait;
use chrono::DateTime;
use serde_json::{Map, Value};
use tokio::sync::RwLock;

use crate::errors::StoreError;

/// An item is a flat map of attribute names to JSON values
pub type Item = Map<String, Value>;

/// Primary key of an item: the key attribute name and its value
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct Key {
    pub attribute: String,
    pub value: String,
}

impl Key {
    pub fn new<A: Into<String>, V: Into<String>>(attribute: A, value: V) -> Self {
        Self {
            attribute: attribute.into(),
            value: value.into(),
        }
    }
}

/// A single attribute mutation applied by [`KeyValueStore::update`]
#[derive(Debug, Clone, PartialEq)]
pub enum AttributeOp {
    /// Overwrite the attribute
    Set(String, Value),
    /// Write the attribute only if it does not exist yet
    SetIfAbsent(String, Value),
    /// Write the attribute only if it is absent or orders before the new value.
    /// RFC 3339 timestamps are compared as instants, anything else as strings.
    SetIfGreater(String, String),
    /// Union the values into a string set
    AddToSet(String, Vec<String>),
    /// Append the values to a list
    AppendToList(String, Vec<Value>),
}

impl AttributeOp {
    pub fn set<S: Into<String>>(attribute: S, value: impl Into<Value>) -> Self {
        AttributeOp::Set(attribute.into(), value.into())
    }

    pub fn set_if_absent<S: Into<String>>(attribute: S, value: impl Into<Value>) -> Self {
        AttributeOp::SetIfAbsent(attribute.into(), value.into())
    }

    pub fn set_if_greater<S: Into<String>, V: Into<String>>(attribute: S, value: V) -> Self {
        AttributeOp::SetIfGreater(attribute.into(), value.into())
    }

    pub fn add_to_set<S: Into<String>>(attribute: S, values: Vec<String>) -> Self {
        AttributeOp::AddToSet(attribute.into(), values)
    }

    pub fn append_to_list<S: Into<String>>(attribute: S, values: Vec<Value>) -> Self {
        AttributeOp::AppendToList(attribute.into(), values)
    }
}

/// Interface of the external key-value store
#[async_trait]
pub trait KeyValueStore: Send + Sync {
    /// Fetch an item, failing with [`StoreError::NotFound`] if it does not exist
    async fn get(&self, table: &str, key: &Key) -> Result<Item, StoreError>;

    /// Apply all operations to the item atomically, creating it if needed,
    /// and return the updated item
    async fn update(&self, table: &str, key: &Key, ops: &[AttributeOp])
        -> Result<Item, StoreError>;
}

/// Apply operations to an item in place. Shared by the bundled backends.
pub fn apply_ops(item: &mut Item, key: &Key, ops: &[AttributeOp]) -> Result<(), StoreError> {
    item.insert(key.attribute.clone(), Value::String(key.value.clone()));

    for op in ops {
        match op {
            AttributeOp::Set(attribute, value) => {
                item.insert(attribute.clone(), value.clone());
            }
            AttributeOp::SetIfAbsent(attribute, value) => {
                if item.get(attribute).map_or(true, Value::is_null) {
                    item.insert(attribute.clone(), value.clone());
                }
            }
            AttributeOp::SetIfGreater(attribute, value) => {
                let replace = match item.get(attribute) {
                    None | Some(Value::Null) => true,
                    Some(Value::String(current)) => orders_before(current, value),
                    Some(other) => {
                        return Err(StoreError::Malformed(format!(
                            "{} is not a string: {}",
                            attribute, other
                        )))
                    }
                };
                if replace {
                    item.insert(attribute.clone(), Value::String(value.clone()));
                }
            }
            AttributeOp::AddToSet(attribute, values) => {
                let mut set: BTreeSet<String> = match item.get(attribute) {
                    None | Some(Value::Null) => BTreeSet::new(),
                    Some(existing) => serde_json::from_value(existing.clone())?,
                };
                set.extend(values.iter().cloned());
                item.insert(attribute.clone(), serde_json::to_value(set)?);
            }
            AttributeOp::AppendToList(attribute, values) => {
                let entry = item
                    .entry(attribute.clone())
                    .or_insert_with(|| Value::Array(Vec::new()));
                if entry.is_null() {
                    *entry = Value::Array(Vec::new());
                }
                let list = entry.as_array_mut().ok_or_else(|| {
                    StoreError::Malformed(format!("{} is not a list", attribute))
                })?;
                list.extend(values.iter().cloned());
            }
        }
    }
    Ok(())
}

fn orders_before(current: &str, candidate: &str) -> bool {
    match (
        DateTime::parse_from_rfc3339(current),
        DateTime::parse_from_rfc3339(candidate),
    ) {
        (Ok(current), Ok(candidate)) => current < candidate,
        _ => current < candidate,
    }
}

/// Process-local store. Items live as long as the store does.
#[derive(Debug, Default)]
pub struct MemoryStore {
    tables: RwLock<HashMap<String, HashMap<String, Item>>>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl KeyValueStore for MemoryStore {
    async fn get(&self, table: &str, key: &Key) -> Result<Item, StoreError> {
        let tables = self.tables.read().await;
        tables
            .get(table)
            .and_then(|items| items.get(&key.value))
            .cloned()
            .ok_or_else(|| StoreError::not_found(table, &key.value))
    }

    async fn update(
        &self,
        table: &str,
        key: &Key,
        ops: &[AttributeOp],
    ) -> Result<Item, StoreError> {
        let mut tables = self.tables.write().await;
        let items = tables.entry(table.to_string()).or_default();

        // Work on a copy so a failing operation leaves the stored item untouched
        let mut item = items.get(&key.value).cloned().unwrap_or_default();
        apply_ops(&mut item, key, ops)?;
        items.insert(key.value.clone(), item.clone());
        Ok(item)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn session_key() -> Key {
        Key::new("SessionId", "s1")
    }

    #[tokio::test]
    async fn test_get_missing_item_is_not_found() {
        let store = MemoryStore::new();
        let err = store.get("sessions", &session_key()).await.unwrap_err();
        assert!(err.is_not_found());
    }

    #[tokio::test]
    async fn test_update_creates_item_with_key() {
        let store = MemoryStore::new();
        let item = store
            .update(
                "sessions",
                &session_key(),
                &[AttributeOp::set("IsEscalated", true)],
            )
            .await
            .unwrap();
        assert_eq!(item["SessionId"], json!("s1"));
        assert_eq!(item["IsEscalated"], json!(true));
        assert_eq!(store.get("sessions", &session_key()).await.unwrap(), item);
    }

    #[tokio::test]
    async fn test_set_if_absent_only_writes_once() {
        let store = MemoryStore::new();
        let key = session_key();
        store
            .update("sessions", &key, &[AttributeOp::set_if_absent("CreatedAt", "first")])
            .await
            .unwrap();
        let item = store
            .update("sessions", &key, &[AttributeOp::set_if_absent("CreatedAt", "second")])
            .await
            .unwrap();
        assert_eq!(item["CreatedAt"], json!("first"));
    }

    #[tokio::test]
    async fn test_set_if_greater_never_moves_backwards() {
        let store = MemoryStore::new();
        let key = session_key();
        let later = "2024-09-01T09:00:00.000Z";
        let earlier = "2024-09-01T08:00:00+00:00";

        store
            .update("sessions", &key, &[AttributeOp::set_if_greater("UpdatedAt", later)])
            .await
            .unwrap();
        let item = store
            .update("sessions", &key, &[AttributeOp::set_if_greater("UpdatedAt", earlier)])
            .await
            .unwrap();
        assert_eq!(item["UpdatedAt"], json!(later));
    }

    #[tokio::test]
    async fn test_add_to_set_is_idempotent() {
        let store = MemoryStore::new();
        let key = Key::new("UserId", "u1");
        for _ in 0..2 {
            store
                .update(
                    "users",
                    &key,
                    &[AttributeOp::add_to_set("SessionIds", vec!["s2".into(), "s1".into()])],
                )
                .await
                .unwrap();
        }
        let item = store.get("users", &key).await.unwrap();
        assert_eq!(item["SessionIds"], json!(["s1", "s2"]));
    }

    #[tokio::test]
    async fn test_append_to_list_preserves_order() {
        let store = MemoryStore::new();
        let key = session_key();
        store
            .update("sessions", &key, &[AttributeOp::append_to_list("History", vec![json!(1)])])
            .await
            .unwrap();
        let item = store
            .update(
                "sessions",
                &key,
                &[AttributeOp::append_to_list("History", vec![json!(2), json!(3)])],
            )
            .await
            .unwrap();
        assert_eq!(item["History"], json!([1, 2, 3]));
    }

    #[tokio::test]
    async fn test_failed_update_leaves_item_untouched() {
        let store = MemoryStore::new();
        let key = session_key();
        store
            .update("sessions", &key, &[AttributeOp::set("History", "not a list")])
            .await
            .unwrap();

        let err = store
            .update(
                "sessions",
                &key,
                &[
                    AttributeOp::set("Title", "x"),
                    AttributeOp::append_to_list("History", vec![json!(1)]),
                ],
            )
            .await
            .unwrap_err();
        assert!(matches!(err, StoreError::Malformed(_)));

        let item = store.get("sessions", &key).await.unwrap();
        assert!(item.get("Title").is_none());
    }
}

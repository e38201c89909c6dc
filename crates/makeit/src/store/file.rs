use std::path::{Component, Path, PathBuf};

use async_trait::async_trait;
use tokio::fs;
use tokio::sync::Mutex;

use super::{apply_ops, AttributeOp, Item, Key, KeyValueStore};
use crate::errors::StoreError;

/// Stores every item as a JSON document at `<root>/<table>/<key>.json`.
///
/// Updates are serialized through a single lock and written via a temporary
/// file, so readers never observe a half-written item.
#[derive(Debug)]
pub struct JsonFileStore {
    root: PathBuf,
    write_lock: Mutex<()>,
}

impl JsonFileStore {
    pub fn new<P: Into<PathBuf>>(root: P) -> Self {
        Self {
            root: root.into(),
            write_lock: Mutex::new(()),
        }
    }

    fn item_path(&self, table: &str, key: &Key) -> Result<PathBuf, StoreError> {
        ensure_plain_segment(table)?;
        ensure_plain_segment(&key.value)?;
        Ok(self.root.join(table).join(format!("{}.json", key.value)))
    }

    async fn read_item(path: &Path) -> Result<Option<Item>, StoreError> {
        match fs::read(path).await {
            Ok(bytes) => Ok(Some(serde_json::from_slice(&bytes)?)),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(None),
            Err(e) => Err(e.into()),
        }
    }
}

// Basic path validation to prevent directory traversal
fn ensure_plain_segment(segment: &str) -> Result<(), StoreError> {
    let mut components = Path::new(segment).components();
    match (components.next(), components.next()) {
        (Some(Component::Normal(_)), None) => Ok(()),
        _ => Err(StoreError::Backend(format!(
            "Invalid table or key name: {:?}",
            segment
        ))),
    }
}

#[async_trait]
impl KeyValueStore for JsonFileStore {
    async fn get(&self, table: &str, key: &Key) -> Result<Item, StoreError> {
        let path = self.item_path(table, key)?;
        Self::read_item(&path)
            .await?
            .ok_or_else(|| StoreError::not_found(table, &key.value))
    }

    async fn update(
        &self,
        table: &str,
        key: &Key,
        ops: &[AttributeOp],
    ) -> Result<Item, StoreError> {
        let path = self.item_path(table, key)?;
        let _guard = self.write_lock.lock().await;

        let mut item = Self::read_item(&path).await?.unwrap_or_default();
        apply_ops(&mut item, key, ops)?;

        if let Some(dir) = path.parent() {
            fs::create_dir_all(dir).await?;
        }
        let tmp = path.with_extension("json.tmp");
        fs::write(&tmp, serde_json::to_vec_pretty(&item)?).await?;
        fs::rename(&tmp, &path).await?;

        Ok(item)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use tempfile::tempdir;

    #[tokio::test]
    async fn test_items_survive_a_new_store_instance() {
        let dir = tempdir().unwrap();
        let key = Key::new("SessionId", "s1");
        {
            let store = JsonFileStore::new(dir.path());
            store
                .update(
                    "sessions",
                    &key,
                    &[AttributeOp::append_to_list(
                        "History",
                        vec![json!({"type": "human", "text": "hi"})],
                    )],
                )
                .await
                .unwrap();
        }

        let reopened = JsonFileStore::new(dir.path());
        let item = reopened.get("sessions", &key).await.unwrap();
        assert_eq!(item["History"][0]["text"], json!("hi"));
        assert!(dir.path().join("sessions").join("s1.json").exists());
    }

    #[tokio::test]
    async fn test_missing_item_is_not_found() {
        let dir = tempdir().unwrap();
        let store = JsonFileStore::new(dir.path());
        let err = store
            .get("sessions", &Key::new("SessionId", "nope"))
            .await
            .unwrap_err();
        assert!(err.is_not_found());
    }

    #[tokio::test]
    async fn test_rejects_traversal_in_keys() {
        let dir = tempdir().unwrap();
        let store = JsonFileStore::new(dir.path());
        for bad in ["../escape", "a/b", ".."] {
            let err = store
                .update("sessions", &Key::new("SessionId", bad), &[])
                .await
                .unwrap_err();
            assert!(matches!(err, StoreError::Backend(_)), "{bad} accepted");
        }
    }
}

use std::sync::{
    atomic::{AtomicBool, AtomicU32, AtomicU64, Ordering},
    Mutex, MutexGuard,
};

use async_trait::async_trait;
use serde_json::{Map, Value};
use uuid::Uuid;

use super::{split_path, RemoteResult, RemoteStore};
use crate::error::RemoteError;

/// In-process remote store. Also the fallback when no remote URL is configured.
///
/// Failure injection: `set_available(false)` fails every call until restored,
/// `fail_next_writes(n)` fails the next `n` mutating calls.
pub struct MemoryRemoteStore {
    root: Mutex<Value>,
    available: AtomicBool,
    failing_writes: AtomicU32,
    writes: AtomicU64,
}

impl Default for MemoryRemoteStore {
    fn default() -> Self {
        Self::new()
    }
}

impl MemoryRemoteStore {
    pub fn new() -> Self {
        Self {
            root: Mutex::new(Value::Object(Map::new())),
            available: AtomicBool::new(true),
            failing_writes: AtomicU32::new(0),
            writes: AtomicU64::new(0),
        }
    }

    pub fn set_available(&self, available: bool) {
        self.available.store(available, Ordering::SeqCst);
    }

    pub fn fail_next_writes(&self, count: u32) {
        self.failing_writes.store(count, Ordering::SeqCst);
    }

    /// Number of successful mutating calls.
    pub fn write_count(&self) -> u64 {
        self.writes.load(Ordering::SeqCst)
    }

    pub fn snapshot(&self) -> Value {
        self.lock().clone()
    }

    fn lock(&self) -> MutexGuard<'_, Value> {
        match self.root.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        }
    }

    fn check_read(&self) -> RemoteResult<()> {
        if self.available.load(Ordering::SeqCst) {
            Ok(())
        } else {
            Err(RemoteError::Unavailable("memory store offline".into()))
        }
    }

    fn check_write(&self) -> RemoteResult<()> {
        self.check_read()?;
        let injected = self
            .failing_writes
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok();
        if injected {
            return Err(RemoteError::Unavailable("injected write failure".into()));
        }
        Ok(())
    }

    fn committed(&self) {
        self.writes.fetch_add(1, Ordering::SeqCst);
    }
}

fn lookup<'a>(root: &'a Value, segments: &[&str]) -> Option<&'a Value> {
    segments
        .iter()
        .try_fold(root, |node, segment| node.as_object()?.get(*segment))
}

fn write_at(root: &mut Value, segments: &[&str], value: Value) {
    let Some((last, parents)) = segments.split_last() else {
        *root = if value.is_null() {
            Value::Object(Map::new())
        } else {
            value
        };
        return;
    };

    let mut node = root;
    for segment in parents {
        if !node.is_object() {
            *node = Value::Object(Map::new());
        }
        let Value::Object(map) = node else {
            return;
        };
        node = map
            .entry(segment.to_string())
            .or_insert_with(|| Value::Object(Map::new()));
    }

    if !node.is_object() {
        *node = Value::Object(Map::new());
    }
    if let Value::Object(map) = node {
        if value.is_null() {
            map.remove(*last);
        } else {
            map.insert(last.to_string(), value);
        }
    }
}

#[async_trait]
impl RemoteStore for MemoryRemoteStore {
    async fn get(&self, path: &str) -> RemoteResult<Option<Value>> {
        self.check_read()?;
        let root = self.lock();
        Ok(lookup(&root, &split_path(path)).cloned())
    }

    async fn set(&self, path: &str, value: Value) -> RemoteResult<()> {
        self.check_write()?;
        write_at(&mut self.lock(), &split_path(path), value);
        self.committed();
        Ok(())
    }

    async fn update(&self, path: &str, fields: Map<String, Value>) -> RemoteResult<()> {
        self.check_write()?;
        let base = split_path(path);
        let mut root = self.lock();
        for (key, value) in fields {
            let mut segments = base.clone();
            segments.extend(split_path(&key));
            write_at(&mut root, &segments, value);
        }
        drop(root);
        self.committed();
        Ok(())
    }

    async fn remove(&self, path: &str) -> RemoteResult<()> {
        self.check_write()?;
        write_at(&mut self.lock(), &split_path(path), Value::Null);
        self.committed();
        Ok(())
    }

    async fn push(&self, path: &str, value: Value) -> RemoteResult<String> {
        self.check_write()?;
        let id = Uuid::new_v4().simple().to_string();
        let mut segments = split_path(path);
        segments.push(&id);
        write_at(&mut self.lock(), &segments, value);
        self.committed();
        Ok(id)
    }

    async fn query_equal(
        &self,
        path: &str,
        field: &str,
        value: &Value,
    ) -> RemoteResult<Vec<(String, Value)>> {
        self.check_read()?;
        let root = self.lock();
        let matches = lookup(&root, &split_path(path))
            .and_then(Value::as_object)
            .map(|children| {
                children
                    .iter()
                    .filter(|(_, child)| child.get(field) == Some(value))
                    .map(|(id, child)| (id.clone(), child.clone()))
                    .collect()
            })
            .unwrap_or_default();
        Ok(matches)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[tokio::test]
    async fn set_then_get_nested_path() {
        let store = MemoryRemoteStore::new();
        store
            .set("users/u1/overall", json!({"overallProgress": 30}))
            .await
            .unwrap();

        let value = store.get("users/u1/overall").await.unwrap().unwrap();
        assert_eq!(value["overallProgress"], 30);
        assert!(store.get("users/u2/overall").await.unwrap().is_none());
        assert!(store.get("users/u1").await.unwrap().is_some());
    }

    #[tokio::test]
    async fn update_merges_children() {
        let store = MemoryRemoteStore::new();
        store
            .set("users/u1/courses", json!({"a": {"progress": 10}}))
            .await
            .unwrap();

        let mut fields = Map::new();
        fields.insert("b".into(), json!({"progress": 50}));
        store.update("users/u1/courses", fields).await.unwrap();

        let courses = store.get("users/u1/courses").await.unwrap().unwrap();
        assert_eq!(courses["a"]["progress"], 10);
        assert_eq!(courses["b"]["progress"], 50);
    }

    #[tokio::test]
    async fn setting_null_removes() {
        let store = MemoryRemoteStore::new();
        store.set("a/b", json!(1)).await.unwrap();
        store.set("a/b", Value::Null).await.unwrap();
        assert!(store.get("a/b").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn push_and_query_by_field() {
        let store = MemoryRemoteStore::new();
        store.push("alerts", json!({"user_id": "u1", "n": 1})).await.unwrap();
        store.push("alerts", json!({"user_id": "u2", "n": 2})).await.unwrap();
        store.push("alerts", json!({"user_id": "u1", "n": 3})).await.unwrap();

        let found = store
            .query_equal("alerts", "user_id", &json!("u1"))
            .await
            .unwrap();
        assert_eq!(found.len(), 2);
        assert!(found.iter().all(|(_, v)| v["user_id"] == "u1"));
    }

    #[tokio::test]
    async fn injected_failures_are_consumed() {
        let store = MemoryRemoteStore::new();
        store.fail_next_writes(2);
        assert!(store.set("x", json!(1)).await.is_err());
        assert!(store.set("x", json!(1)).await.is_err());
        assert!(store.set("x", json!(1)).await.is_ok());
        assert_eq!(store.write_count(), 1);
    }

    #[tokio::test]
    async fn offline_store_rejects_reads_and_writes() {
        let store = MemoryRemoteStore::new();
        store.set_available(false);
        assert!(matches!(
            store.get("x").await,
            Err(RemoteError::Unavailable(_))
        ));
        assert!(store.set("x", json!(1)).await.is_err());
        store.set_available(true);
        assert!(store.set("x", json!(1)).await.is_ok());
    }
}

//! In-memory storage backend, used by tests and single-process setups.
use std::collections::BTreeMap;
use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use serde_json::Value;
use thiserror::Error;

use ofcir_model::ObjectKey;

use crate::{Kind, RawRecord, Storage};

#[derive(Debug, Clone, Default)]
pub struct MemoryStore {
    inner: Arc<Mutex<BTreeMap<RecordKey, MemoryEntry>>>,
}

type RecordKey = (Kind, String, String);

#[derive(Debug, Clone)]
struct MemoryEntry {
    version: i64,
    data: Value,
}

#[derive(Debug, Error)]
pub enum MemoryError {
    #[error("stored object is not a JSON document: {0}")]
    MalformedRecord(ObjectKey),
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }
}

fn record_key(kind: Kind, key: &ObjectKey) -> RecordKey {
    (kind, key.namespace.clone(), key.name.clone())
}

fn to_record(rkey: &RecordKey, entry: &MemoryEntry) -> RawRecord {
    RawRecord {
        key: ObjectKey::new(rkey.1.clone(), rkey.2.clone()),
        version: entry.version,
        data: entry.data.clone(),
    }
}

#[async_trait]
impl Storage for MemoryStore {
    type Error = MemoryError;

    async fn get(&self, kind: Kind, key: &ObjectKey) -> Result<Option<RawRecord>, Self::Error> {
        let guard = self.inner.lock();
        let rkey = record_key(kind, key);
        Ok(guard.get(&rkey).map(|entry| to_record(&rkey, entry)))
    }

    async fn list(&self, kind: Kind, namespace: &str) -> Result<Vec<RawRecord>, Self::Error> {
        let guard = self.inner.lock();
        // BTreeMap iteration gives (kind, namespace, name) order, so the
        // result is already sorted by name
        Ok(guard
            .range((kind, namespace.to_owned(), String::new())..)
            .take_while(|((k, ns, _), _)| *k == kind && ns == namespace)
            .map(|(rkey, entry)| to_record(rkey, entry))
            .collect())
    }

    async fn insert(&self, kind: Kind, key: &ObjectKey, data: Value) -> Result<bool, Self::Error> {
        let mut guard = self.inner.lock();
        let rkey = record_key(kind, key);
        if guard.contains_key(&rkey) {
            return Ok(false);
        }
        guard.insert(rkey, MemoryEntry { version: 1, data });
        Ok(true)
    }

    async fn insert_all(
        &self,
        kind: Kind,
        items: Vec<(ObjectKey, Value)>,
    ) -> Result<Vec<ObjectKey>, Self::Error> {
        let mut guard = self.inner.lock();
        let mut inserted = Vec::with_capacity(items.len());
        for (key, data) in items {
            let rkey = record_key(kind, &key);
            if guard.contains_key(&rkey) {
                continue;
            }
            guard.insert(rkey, MemoryEntry { version: 1, data });
            inserted.push(key);
        }
        Ok(inserted)
    }

    async fn update(
        &self,
        kind: Kind,
        key: &ObjectKey,
        expected_version: i64,
        data: Value,
    ) -> Result<Option<i64>, Self::Error> {
        let mut guard = self.inner.lock();
        match guard.get_mut(&record_key(kind, key)) {
            Some(entry) if entry.version == expected_version => {
                entry.version += 1;
                entry.data = data;
                Ok(Some(entry.version))
            }
            _ => Ok(None),
        }
    }

    async fn remove(
        &self,
        kind: Kind,
        key: &ObjectKey,
        expected_version: i64,
    ) -> Result<bool, Self::Error> {
        let mut guard = self.inner.lock();
        let rkey = record_key(kind, key);
        match guard.get(&rkey) {
            Some(entry) if entry.version == expected_version => {
                guard.remove(&rkey);
                Ok(true)
            }
            _ => Ok(false),
        }
    }

    async fn delete_by_label(
        &self,
        kind: Kind,
        namespace: &str,
        label: (&str, &str),
        now: DateTime<Utc>,
    ) -> Result<Vec<ObjectKey>, Self::Error> {
        let mut guard = self.inner.lock();
        let matches: Vec<RecordKey> = guard
            .range((kind, namespace.to_owned(), String::new())..)
            .take_while(|((k, ns, _), _)| *k == kind && ns == namespace)
            .filter(|(_, entry)| label_matches(&entry.data, label))
            .map(|(rkey, _)| rkey.clone())
            .collect();

        let mut touched = Vec::with_capacity(matches.len());
        for rkey in matches {
            let key = ObjectKey::new(rkey.1.clone(), rkey.2.clone());
            let entry = guard
                .get_mut(&rkey)
                .ok_or_else(|| MemoryError::MalformedRecord(key.clone()))?;
            if finalizers_empty(&entry.data) {
                guard.remove(&rkey);
            } else {
                mark_deleted(&mut entry.data, now);
                entry.version += 1;
            }
            touched.push(key);
        }
        Ok(touched)
    }
}

pub(crate) fn label_matches(data: &Value, (key, value): (&str, &str)) -> bool {
    // label keys like `ofcir/eviction` need JSON-pointer escaping
    let escaped = key.replace('~', "~0").replace('/', "~1");
    data.pointer(&format!("/metadata/labels/{escaped}"))
        .and_then(Value::as_str)
        == Some(value)
}

pub(crate) fn finalizers_empty(data: &Value) -> bool {
    data.pointer("/metadata/finalizers")
        .and_then(Value::as_array)
        .map_or(true, Vec::is_empty)
}

pub(crate) fn mark_deleted(data: &mut Value, now: DateTime<Utc>) {
    let Some(meta) = data
        .pointer_mut("/metadata")
        .and_then(Value::as_object_mut)
    else {
        return;
    };
    let stamp = meta.entry("deletionTimestamp").or_insert(Value::Null);
    if stamp.is_null() {
        *stamp = serde_json::json!(now);
    }
    let version = meta.get("version").and_then(Value::as_i64).unwrap_or(0);
    meta.insert("version".to_owned(), serde_json::json!(version + 1));
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn obj(name: &str, labels: Value, finalizers: Value) -> Value {
        json!({
            "metadata": {
                "name": name,
                "namespace": "ns",
                "labels": labels,
                "finalizers": finalizers,
                "version": 1
            }
        })
    }

    #[tokio::test]
    async fn cas_update_requires_matching_version() {
        let store = MemoryStore::new();
        let key = ObjectKey::new("ns", "a");
        assert!(store
            .insert(Kind::Pool, &key, json!({"x": 1}))
            .await
            .unwrap());

        assert_eq!(
            store
                .update(Kind::Pool, &key, 1, json!({"x": 2}))
                .await
                .unwrap(),
            Some(2)
        );
        // stale expected version
        assert_eq!(
            store
                .update(Kind::Pool, &key, 1, json!({"x": 3}))
                .await
                .unwrap(),
            None
        );
    }

    #[tokio::test]
    async fn list_is_scoped_and_sorted() {
        let store = MemoryStore::new();
        for (ns, name) in [("ns", "b"), ("ns", "a"), ("other", "c")] {
            store
                .insert(Kind::Resource, &ObjectKey::new(ns, name), json!({}))
                .await
                .unwrap();
        }
        let listed = store.list(Kind::Resource, "ns").await.unwrap();
        let names: Vec<_> = listed.iter().map(|r| r.key.name.as_str()).collect();
        assert_eq!(names, vec!["a", "b"]);
    }

    #[tokio::test]
    async fn delete_by_label_marks_or_removes() {
        let store = MemoryStore::new();
        let finalized = ObjectKey::new("ns", "keep");
        let bare = ObjectKey::new("ns", "gone");
        store
            .insert(
                Kind::Resource,
                &finalized,
                obj("keep", json!({"evict": "true"}), json!(["f"])),
            )
            .await
            .unwrap();
        store
            .insert(
                Kind::Resource,
                &bare,
                obj("gone", json!({"evict": "true"}), json!([])),
            )
            .await
            .unwrap();

        let touched = store
            .delete_by_label(Kind::Resource, "ns", ("evict", "true"), Utc::now())
            .await
            .unwrap();
        assert_eq!(touched.len(), 2);

        // the finalized object is only marked
        let marked = store.get(Kind::Resource, &finalized).await.unwrap().unwrap();
        assert!(marked
            .data
            .pointer("/metadata/deletionTimestamp")
            .is_some_and(|v| !v.is_null()));
        assert_eq!(marked.version, 2);
        // the bare one is gone
        assert!(store.get(Kind::Resource, &bare).await.unwrap().is_none());
    }
}

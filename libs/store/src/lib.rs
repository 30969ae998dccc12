//! # ofcir-store
//!
//! `ofcir-store` defines a trait `Storage` that provides methods for
//! reading & writing versioned object records in storage.
//!
//! The trait is not meant to be used by controllers directly. Instead it's
//! wrapped in a [`Store`] type which takes a generic parameter that must
//! implement `Storage`. `Store` layers the declarative semantics on top:
//! typed Pools and Resources, spec/status subresources, compare-and-set
//! updates, finalizer-driven deletion, and a watch channel that yields
//! object keys on every mutation.
//!
//! [`Storage`]: crate::Storage
//! [`Store`]: crate::Store
#![warn(
    missing_debug_implementations,
    rust_2018_idioms,
    unreachable_pub,
    non_snake_case,
    non_upper_case_globals
)]
#![deny(rustdoc::broken_intra_doc_links)]

use std::fmt;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{de::DeserializeOwned, Serialize};
use serde_json::Value;
use thiserror::Error;
use tokio::sync::broadcast;
use tracing::{debug, trace};

use ofcir_model::{ObjectKey, ObjectMeta, Pool, Resource};

pub mod memory;
pub mod sqlite;

/// Capacity of the watch broadcast channels. A lagging watcher misses
/// events; the manager's periodic resync re-enqueues every key, so a
/// missed event only delays a reconcile.
const WATCH_CHANNEL_SIZE: usize = 1024;

/// The object kinds held by the store
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum Kind {
    Pool,
    Resource,
}

impl Kind {
    pub fn as_str(&self) -> &'static str {
        match self {
            Kind::Pool => "pool",
            Kind::Resource => "resource",
        }
    }
}

impl fmt::Display for Kind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A raw versioned record as the backend sees it
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RawRecord {
    pub key: ObjectKey,
    pub version: i64,
    pub data: Value,
}

/// Backend contract for the declarative store.
///
/// Backends deal in opaque JSON plus a version column; the semantic
/// outcomes (conflict, already-exists) are expressed in the return types
/// so every backend reports them the same way. Only genuine backend
/// faults surface through `Error`.
#[async_trait]
pub trait Storage: Send + Sync + 'static {
    // send/sync/static required for async trait bounds
    type Error: std::error::Error + Send + Sync + 'static;

    async fn get(&self, kind: Kind, key: &ObjectKey) -> Result<Option<RawRecord>, Self::Error>;

    /// All records of `kind` in `namespace`, ordered by name ascending
    async fn list(&self, kind: Kind, namespace: &str) -> Result<Vec<RawRecord>, Self::Error>;

    /// Insert a record at version 1. Returns false if the key exists.
    async fn insert(&self, kind: Kind, key: &ObjectKey, data: Value) -> Result<bool, Self::Error>;

    /// Insert a batch of records at version 1 as one store operation.
    /// Keys that already exist are skipped, the rest of the batch still
    /// lands. Returns the keys that were inserted.
    async fn insert_all(
        &self,
        kind: Kind,
        items: Vec<(ObjectKey, Value)>,
    ) -> Result<Vec<ObjectKey>, Self::Error>;

    /// Compare-and-set: replace `data` and bump the version iff the stored
    /// version equals `expected_version`. Returns the new version, or
    /// `None` when no record matched (missing key or version mismatch).
    async fn update(
        &self,
        kind: Kind,
        key: &ObjectKey,
        expected_version: i64,
        data: Value,
    ) -> Result<Option<i64>, Self::Error>;

    /// Compare-and-set removal. Returns whether a record was removed.
    async fn remove(
        &self,
        kind: Kind,
        key: &ObjectKey,
        expected_version: i64,
    ) -> Result<bool, Self::Error>;

    /// Request deletion of every record in `namespace` carrying the label,
    /// as one batch operation: stamps `deletionTimestamp` (idempotent) and
    /// physically removes records whose finalizer list is already empty.
    /// Returns the keys that were touched.
    async fn delete_by_label(
        &self,
        kind: Kind,
        namespace: &str,
        label: (&str, &str),
        now: DateTime<Utc>,
    ) -> Result<Vec<ObjectKey>, Self::Error>;
}

/// Errors surfaced by [`Store`]
#[derive(Debug, Error)]
pub enum StoreError {
    #[error("{0} {1} not found")]
    NotFound(Kind, ObjectKey),
    #[error("version conflict updating {0} {1}")]
    Conflict(Kind, ObjectKey),
    #[error("{0} {1} already exists")]
    AlreadyExists(Kind, ObjectKey),
    #[error("malformed stored object")]
    Serde(#[from] serde_json::Error),
    #[error("storage backend error")]
    Backend(#[source] Box<dyn std::error::Error + Send + Sync>),
}

impl StoreError {
    fn backend<E: std::error::Error + Send + Sync + 'static>(err: E) -> Self {
        StoreError::Backend(Box::new(err))
    }

    /// NotFound is routinely treated as a no-op by reconcilers
    pub fn is_not_found(&self) -> bool {
        matches!(self, StoreError::NotFound(..))
    }

    /// Conflicts are resolved by re-enqueueing, not by retrying in place
    pub fn is_conflict(&self) -> bool {
        matches!(self, StoreError::Conflict(..))
    }
}

/// A typed object the store knows how to persist
pub trait Object: Clone + Serialize + DeserializeOwned + Send + Sync + 'static {
    const KIND: Kind;

    fn meta(&self) -> &ObjectMeta;
    fn meta_mut(&mut self) -> &mut ObjectMeta;
    /// Copy the status subresource from `other` into `self`
    fn copy_status_from(&mut self, other: &Self);
    /// Stamp `status.lastUpdated`
    fn stamp_status(&mut self, now: DateTime<Utc>);
}

impl Object for Pool {
    const KIND: Kind = Kind::Pool;

    fn meta(&self) -> &ObjectMeta {
        &self.meta
    }
    fn meta_mut(&mut self) -> &mut ObjectMeta {
        &mut self.meta
    }
    fn copy_status_from(&mut self, other: &Self) {
        self.status = other.status.clone();
    }
    fn stamp_status(&mut self, now: DateTime<Utc>) {
        self.status.last_updated = Some(now);
    }
}

impl Object for Resource {
    const KIND: Kind = Kind::Resource;

    fn meta(&self) -> &ObjectMeta {
        &self.meta
    }
    fn meta_mut(&mut self) -> &mut ObjectMeta {
        &mut self.meta
    }
    fn copy_status_from(&mut self, other: &Self) {
        self.status = other.status.clone();
    }
    fn stamp_status(&mut self, now: DateTime<Utc>) {
        self.status.last_updated = Some(now);
    }
}

/// The declarative store used by the reconcilers and the lease API.
///
/// All mutations go through version-based optimistic concurrency; every
/// successful mutation publishes the object key on the kind's watch
/// channel.
pub struct Store<S> {
    storage: S,
    pool_events: broadcast::Sender<ObjectKey>,
    resource_events: broadcast::Sender<ObjectKey>,
}

impl<S> fmt::Debug for Store<S> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Store").finish()
    }
}

impl<S: Storage> Store<S> {
    pub fn new(storage: S) -> Self {
        let (pool_events, _) = broadcast::channel(WATCH_CHANNEL_SIZE);
        let (resource_events, _) = broadcast::channel(WATCH_CHANNEL_SIZE);
        Self {
            storage,
            pool_events,
            resource_events,
        }
    }

    /// Subscribe to Pool mutations
    pub fn watch_pools(&self) -> broadcast::Receiver<ObjectKey> {
        self.pool_events.subscribe()
    }

    /// Subscribe to Resource mutations
    pub fn watch_resources(&self) -> broadcast::Receiver<ObjectKey> {
        self.resource_events.subscribe()
    }

    fn notify(&self, kind: Kind, key: &ObjectKey) {
        let chan = match kind {
            Kind::Pool => &self.pool_events,
            Kind::Resource => &self.resource_events,
        };
        // send only fails with no subscribers, which is fine
        let _ = chan.send(key.clone());
        trace!(%kind, %key, "watch event");
    }

    async fn get_object<O: Object>(&self, key: &ObjectKey) -> Result<Option<O>, StoreError> {
        let record = self
            .storage
            .get(O::KIND, key)
            .await
            .map_err(StoreError::backend)?;
        match record {
            Some(record) => {
                let mut obj: O = serde_json::from_value(record.data)?;
                // the version column is authoritative
                obj.meta_mut().version = record.version;
                Ok(Some(obj))
            }
            None => Ok(None),
        }
    }

    async fn list_objects<O: Object>(&self, namespace: &str) -> Result<Vec<O>, StoreError> {
        self.storage
            .list(O::KIND, namespace)
            .await
            .map_err(StoreError::backend)?
            .into_iter()
            .map(|record| {
                let mut obj: O = serde_json::from_value(record.data)?;
                obj.meta_mut().version = record.version;
                Ok(obj)
            })
            .collect()
    }

    async fn create_object<O: Object>(&self, obj: O) -> Result<O, StoreError> {
        let mut obj = obj;
        obj.meta_mut().version = 1;
        let key = obj.meta().key();
        let data = serde_json::to_value(&obj)?;
        let inserted = self
            .storage
            .insert(O::KIND, &key, data)
            .await
            .map_err(StoreError::backend)?;
        if !inserted {
            return Err(StoreError::AlreadyExists(O::KIND, key));
        }
        self.notify(O::KIND, &key);
        Ok(obj)
    }

    /// Persist meta + spec, keeping the stored status subresource.
    ///
    /// When the update leaves a deletion-pending object with no
    /// finalizers, the record is removed instead.
    async fn update_object<O: Object>(&self, obj: &O) -> Result<O, StoreError> {
        let key = obj.meta().key();
        let expected = obj.meta().version;

        let current: O = self
            .get_object(&key)
            .await?
            .ok_or_else(|| StoreError::NotFound(O::KIND, key.clone()))?;
        if current.meta().version != expected {
            return Err(StoreError::Conflict(O::KIND, key));
        }

        let mut next = obj.clone();
        next.copy_status_from(&current);

        if next.meta().is_deleting() && next.meta().finalizers.is_empty() {
            let removed = self
                .storage
                .remove(O::KIND, &key, expected)
                .await
                .map_err(StoreError::backend)?;
            if !removed {
                return Err(StoreError::Conflict(O::KIND, key));
            }
            debug!(kind = %O::KIND, %key, "finalizers cleared, object removed");
            self.notify(O::KIND, &key);
            return Ok(next);
        }

        next.meta_mut().version = expected + 1;
        let data = serde_json::to_value(&next)?;
        match self
            .storage
            .update(O::KIND, &key, expected, data)
            .await
            .map_err(StoreError::backend)?
        {
            Some(version) => {
                next.meta_mut().version = version;
                self.notify(O::KIND, &key);
                Ok(next)
            }
            None => Err(StoreError::Conflict(O::KIND, key)),
        }
    }

    /// Persist only the status subresource, stamping `lastUpdated`.
    async fn update_object_status<O: Object>(&self, obj: &O) -> Result<O, StoreError> {
        let key = obj.meta().key();
        let expected = obj.meta().version;

        let current: O = self
            .get_object(&key)
            .await?
            .ok_or_else(|| StoreError::NotFound(O::KIND, key.clone()))?;
        if current.meta().version != expected {
            return Err(StoreError::Conflict(O::KIND, key));
        }

        // meta and spec come from what is stored; only status moves
        let mut next = current;
        next.copy_status_from(obj);
        next.stamp_status(Utc::now());
        next.meta_mut().version = expected + 1;

        let data = serde_json::to_value(&next)?;
        match self
            .storage
            .update(O::KIND, &key, expected, data)
            .await
            .map_err(StoreError::backend)?
        {
            Some(version) => {
                next.meta_mut().version = version;
                self.notify(O::KIND, &key);
                Ok(next)
            }
            None => Err(StoreError::Conflict(O::KIND, key)),
        }
    }

    /// Request deletion: stamp `deletionTimestamp` and, once no finalizers
    /// remain, remove the record. Conflicts with concurrent writers are
    /// retried here since the operation is idempotent.
    async fn delete_object<O: Object>(&self, key: &ObjectKey) -> Result<(), StoreError> {
        const ATTEMPTS: usize = 3;

        for _ in 0..ATTEMPTS {
            let Some(mut obj) = self.get_object::<O>(key).await? else {
                return Ok(());
            };
            let expected = obj.meta().version;

            if obj.meta().finalizers.is_empty() {
                if self
                    .storage
                    .remove(O::KIND, key, expected)
                    .await
                    .map_err(StoreError::backend)?
                {
                    self.notify(O::KIND, key);
                    return Ok(());
                }
                continue;
            }

            if obj.meta().is_deleting() {
                // already pending, finalizers still present
                return Ok(());
            }

            obj.meta_mut().deletion_timestamp = Some(Utc::now());
            obj.meta_mut().version = expected + 1;
            let data = serde_json::to_value(&obj)?;
            if self
                .storage
                .update(O::KIND, key, expected, data)
                .await
                .map_err(StoreError::backend)?
                .is_some()
            {
                self.notify(O::KIND, key);
                return Ok(());
            }
        }
        Err(StoreError::Conflict(O::KIND, key.clone()))
    }

    // ------------------------------------------------------------------
    // Pools

    pub async fn get_pool(&self, key: &ObjectKey) -> Result<Option<Pool>, StoreError> {
        self.get_object(key).await
    }

    pub async fn list_pools(&self, namespace: &str) -> Result<Vec<Pool>, StoreError> {
        self.list_objects(namespace).await
    }

    pub async fn create_pool(&self, pool: Pool) -> Result<Pool, StoreError> {
        self.create_object(pool).await
    }

    pub async fn update_pool(&self, pool: &Pool) -> Result<Pool, StoreError> {
        self.update_object(pool).await
    }

    pub async fn update_pool_status(&self, pool: &Pool) -> Result<Pool, StoreError> {
        self.update_object_status(pool).await
    }

    pub async fn delete_pool(&self, key: &ObjectKey) -> Result<(), StoreError> {
        self.delete_object::<Pool>(key).await
    }

    // ------------------------------------------------------------------
    // Resources

    pub async fn get_resource(&self, key: &ObjectKey) -> Result<Option<Resource>, StoreError> {
        self.get_object(key).await
    }

    pub async fn list_resources(&self, namespace: &str) -> Result<Vec<Resource>, StoreError> {
        self.list_objects(namespace).await
    }

    pub async fn create_resource(&self, cir: Resource) -> Result<Resource, StoreError> {
        self.create_object(cir).await
    }

    pub async fn update_resource(&self, cir: &Resource) -> Result<Resource, StoreError> {
        self.update_object(cir).await
    }

    pub async fn update_resource_status(&self, cir: &Resource) -> Result<Resource, StoreError> {
        self.update_object_status(cir).await
    }

    pub async fn delete_resource(&self, key: &ObjectKey) -> Result<(), StoreError> {
        self.delete_object::<Resource>(key).await
    }

    /// Create a batch of Resources as a single store operation. Names
    /// that already exist are skipped; returns the keys actually created.
    pub async fn create_resources(
        &self,
        cirs: Vec<Resource>,
    ) -> Result<Vec<ObjectKey>, StoreError> {
        let mut items = Vec::with_capacity(cirs.len());
        for mut cir in cirs {
            cir.meta.version = 1;
            let key = cir.meta.key();
            items.push((key, serde_json::to_value(&cir)?));
        }
        let inserted = self
            .storage
            .insert_all(Kind::Resource, items)
            .await
            .map_err(StoreError::backend)?;
        for key in &inserted {
            self.notify(Kind::Resource, key);
        }
        Ok(inserted)
    }

    /// Batch-delete every Resource in `namespace` carrying the label, as a
    /// single backend operation.
    pub async fn delete_resources_by_label(
        &self,
        namespace: &str,
        label_key: &str,
        label_value: &str,
    ) -> Result<Vec<ObjectKey>, StoreError> {
        let touched = self
            .storage
            .delete_by_label(
                Kind::Resource,
                namespace,
                (label_key, label_value),
                Utc::now(),
            )
            .await
            .map_err(StoreError::backend)?;
        for key in &touched {
            self.notify(Kind::Resource, key);
        }
        Ok(touched)
    }
}

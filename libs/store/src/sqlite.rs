//! SQLite storage backend. This is the durable backend used by the
//! deployed binaries; the manager and the API share one database file.
use std::str::FromStr;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde_json::Value;
use sqlx::{
    sqlite::{SqliteConnectOptions, SqlitePool},
    ConnectOptions, Row,
};
use tracing::debug;

use ofcir_model::ObjectKey;

use crate::memory::{finalizers_empty, label_matches, mark_deleted};
use crate::{Kind, RawRecord, Storage};

#[derive(Debug)]
pub struct SqliteDb {
    inner: SqlitePool,
}

impl Clone for SqliteDb {
    fn clone(&self) -> Self {
        Self {
            inner: self.inner.clone(),
        }
    }
}

impl SqliteDb {
    /// Open (and migrate) the database at `uri`; use `sqlite::memory:`
    /// for an in-memory db.
    pub async fn new(uri: impl AsRef<str>) -> Result<Self, sqlx::Error> {
        let mut opts = SqliteConnectOptions::from_str(uri.as_ref())?
            .synchronous(sqlx::sqlite::SqliteSynchronous::Normal)
            .create_if_missing(true);
        // make sqlite log queries at trace level so we don't get a bloated log on `info`
        opts = opts.log_statements(tracing::log::LevelFilter::Trace);

        let inner = SqlitePool::connect_with(opts).await?;
        sqlx::migrate!("../../migrations").run(&inner).await?;
        Ok(Self { inner })
    }
}

fn to_record(row: &sqlx::sqlite::SqliteRow) -> Result<RawRecord, sqlx::Error> {
    let namespace: String = row.get("namespace");
    let name: String = row.get("name");
    let version: i64 = row.get("version");
    let raw: String = row.get("data");
    let data = serde_json::from_str(&raw).map_err(|err| sqlx::Error::Decode(Box::new(err)))?;
    Ok(RawRecord {
        key: ObjectKey::new(namespace, name),
        version,
        data,
    })
}

#[async_trait]
impl Storage for SqliteDb {
    type Error = sqlx::Error;

    async fn get(&self, kind: Kind, key: &ObjectKey) -> Result<Option<RawRecord>, Self::Error> {
        sqlx::query(
            "SELECT namespace, name, version, data FROM objects
             WHERE kind = ?1 AND namespace = ?2 AND name = ?3",
        )
        .bind(kind.as_str())
        .bind(&key.namespace)
        .bind(&key.name)
        .fetch_optional(&self.inner)
        .await?
        .map(|row| to_record(&row))
        .transpose()
    }

    async fn list(&self, kind: Kind, namespace: &str) -> Result<Vec<RawRecord>, Self::Error> {
        sqlx::query(
            "SELECT namespace, name, version, data FROM objects
             WHERE kind = ?1 AND namespace = ?2
             ORDER BY name",
        )
        .bind(kind.as_str())
        .bind(namespace)
        .fetch_all(&self.inner)
        .await?
        .iter()
        .map(to_record)
        .collect()
    }

    async fn insert(&self, kind: Kind, key: &ObjectKey, data: Value) -> Result<bool, Self::Error> {
        let result = sqlx::query(
            "INSERT INTO objects (kind, namespace, name, version, data)
             VALUES (?1, ?2, ?3, 1, ?4)
             ON CONFLICT (kind, namespace, name) DO NOTHING",
        )
        .bind(kind.as_str())
        .bind(&key.namespace)
        .bind(&key.name)
        .bind(data.to_string())
        .execute(&self.inner)
        .await?;
        Ok(result.rows_affected() > 0)
    }

    async fn insert_all(
        &self,
        kind: Kind,
        items: Vec<(ObjectKey, Value)>,
    ) -> Result<Vec<ObjectKey>, Self::Error> {
        // TRANSACTION START
        let mut trans = self.inner.begin().await?;

        let mut inserted = Vec::with_capacity(items.len());
        for (key, data) in items {
            let result = sqlx::query(
                "INSERT INTO objects (kind, namespace, name, version, data)
                 VALUES (?1, ?2, ?3, 1, ?4)
                 ON CONFLICT (kind, namespace, name) DO NOTHING",
            )
            .bind(kind.as_str())
            .bind(&key.namespace)
            .bind(&key.name)
            .bind(data.to_string())
            .execute(&mut *trans)
            .await?;
            if result.rows_affected() > 0 {
                inserted.push(key);
            }
        }

        // TRANSACTION COMMIT
        trans.commit().await?;
        Ok(inserted)
    }

    async fn update(
        &self,
        kind: Kind,
        key: &ObjectKey,
        expected_version: i64,
        data: Value,
    ) -> Result<Option<i64>, Self::Error> {
        Ok(sqlx::query(
            "UPDATE objects SET version = version + 1, data = ?5
             WHERE kind = ?1 AND namespace = ?2 AND name = ?3 AND version = ?4
             RETURNING version",
        )
        .bind(kind.as_str())
        .bind(&key.namespace)
        .bind(&key.name)
        .bind(expected_version)
        .bind(data.to_string())
        .fetch_optional(&self.inner)
        .await?
        .map(|row| row.get::<i64, _>("version")))
    }

    async fn remove(
        &self,
        kind: Kind,
        key: &ObjectKey,
        expected_version: i64,
    ) -> Result<bool, Self::Error> {
        let result = sqlx::query(
            "DELETE FROM objects
             WHERE kind = ?1 AND namespace = ?2 AND name = ?3 AND version = ?4",
        )
        .bind(kind.as_str())
        .bind(&key.namespace)
        .bind(&key.name)
        .bind(expected_version)
        .execute(&self.inner)
        .await?;
        Ok(result.rows_affected() > 0)
    }

    async fn delete_by_label(
        &self,
        kind: Kind,
        namespace: &str,
        label: (&str, &str),
        now: DateTime<Utc>,
    ) -> Result<Vec<ObjectKey>, Self::Error> {
        // TRANSACTION START
        let mut trans = self.inner.begin().await?;

        let rows = sqlx::query(
            "SELECT namespace, name, version, data FROM objects
             WHERE kind = ?1 AND namespace = ?2
             ORDER BY name",
        )
        .bind(kind.as_str())
        .bind(namespace)
        .fetch_all(&mut *trans)
        .await?;

        let mut touched = Vec::new();
        for row in &rows {
            let mut record = to_record(row)?;
            if !label_matches(&record.data, label) {
                continue;
            }
            if finalizers_empty(&record.data) {
                sqlx::query(
                    "DELETE FROM objects WHERE kind = ?1 AND namespace = ?2 AND name = ?3",
                )
                .bind(kind.as_str())
                .bind(&record.key.namespace)
                .bind(&record.key.name)
                .execute(&mut *trans)
                .await?;
            } else {
                mark_deleted(&mut record.data, now);
                sqlx::query(
                    "UPDATE objects SET version = version + 1, data = ?4
                     WHERE kind = ?1 AND namespace = ?2 AND name = ?3",
                )
                .bind(kind.as_str())
                .bind(&record.key.namespace)
                .bind(&record.key.name)
                .bind(record.data.to_string())
                .execute(&mut *trans)
                .await?;
            }
            touched.push(record.key);
        }

        // TRANSACTION COMMIT
        trans.commit().await?;
        debug!(kind = %kind, count = touched.len(), "batch delete by label");
        Ok(touched)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{Store, StoreError};
    use ofcir_model::{Resource, ResourceState, ResourceType, OFCIR_FINALIZER};

    async fn mem_db() -> SqliteDb {
        SqliteDb::new("sqlite::memory:").await.expect("open sqlite")
    }

    #[tokio::test]
    async fn insert_then_cas_cycle() {
        let db = mem_db().await;
        let key = ObjectKey::new("ns", "a");
        assert!(db
            .insert(Kind::Pool, &key, serde_json::json!({"v": 1}))
            .await
            .unwrap());
        assert!(!db
            .insert(Kind::Pool, &key, serde_json::json!({"v": 1}))
            .await
            .unwrap());

        assert_eq!(
            db.update(Kind::Pool, &key, 1, serde_json::json!({"v": 2}))
                .await
                .unwrap(),
            Some(2)
        );
        assert_eq!(
            db.update(Kind::Pool, &key, 1, serde_json::json!({"v": 3}))
                .await
                .unwrap(),
            None
        );
        assert!(!db.remove(Kind::Pool, &key, 1).await.unwrap());
        assert!(db.remove(Kind::Pool, &key, 2).await.unwrap());
    }

    #[tokio::test]
    async fn typed_store_over_sqlite() {
        let store = Store::new(mem_db().await);
        let mut cir = Resource::new("ns", "cir-0001", "p0", ResourceType::Host);
        cir.meta.add_finalizer(OFCIR_FINALIZER);
        let created = store.create_resource(cir).await.unwrap();

        let mut lease = created.clone();
        lease.spec.state = ResourceState::InUse;
        store.update_resource(&lease).await.unwrap();

        // a second writer holding the old version conflicts
        let mut stale = created;
        stale.spec.state = ResourceState::Maintenance;
        let err = store.update_resource(&stale).await.unwrap_err();
        assert!(matches!(err, StoreError::Conflict(..)));
    }
}

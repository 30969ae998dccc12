//! # sizer
//!
//! The pool reconciler: keeps each pool's observed size equal to its
//! declared size without ever disturbing in-use resources, propagates the
//! declared pool state, and drains pools under deletion.
//!
//! Eviction runs in two steps on purpose: candidates are labelled one by
//! one (`ofcir/eviction=true`, restartable and observable), then a single
//! batch delete removes everything carrying the label. A crash between
//! the two leaves labels that the next reconcile collects again.
#![warn(
    missing_debug_implementations,
    rust_2018_idioms,
    unreachable_pub,
    non_snake_case,
    non_upper_case_globals
)]
#![deny(rustdoc::broken_intra_doc_links)]

use std::fmt;

use ofcir_core::prelude::*;
use ofcir_model::{
    name_numeral, resource_name, Pool, PoolState, Resource, ResourceState, EVICTION_LABEL,
    EVICTION_LABEL_VALUE, OFCIR_FINALIZER,
};
use ofcir_store::{Storage, Store};

/// Requeue delays used by the sizer. Tests shrink these.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SizerDelays {
    /// after a reconcile that changed something
    pub dirty: Duration,
    /// after a reconcile that found nothing to do
    pub clean: Duration,
    /// while draining a pool under deletion
    pub deleting: Duration,
}

impl Default for SizerDelays {
    fn default() -> Self {
        Self {
            dirty: Duration::from_secs(1),
            clean: Duration::from_secs(60),
            deleting: Duration::from_secs(10),
        }
    }
}

pub struct PoolSizer<S> {
    store: Arc<Store<S>>,
    delays: SizerDelays,
}

impl<S> fmt::Debug for PoolSizer<S> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PoolSizer")
            .field("delays", &self.delays)
            .finish()
    }
}

impl<S: Storage> PoolSizer<S> {
    pub fn new(store: Arc<Store<S>>, delays: SizerDelays) -> Self {
        Self { store, delays }
    }

    /// Bring the number of resources bound to `pool` in line with
    /// `spec.size`. Returns whether anything was created or selected for
    /// eviction.
    async fn manage_resources(&self, pool: &mut Pool) -> Result<bool> {
        let all_cirs = self.store.list_resources(&pool.meta.namespace).await?;

        let mut pool_cirs: Vec<&Resource> = all_cirs
            .iter()
            .filter(|c| c.spec.pool_ref == pool.meta.name)
            .collect();
        pool_cirs.sort_by(|a, b| a.meta.name.cmp(&b.meta.name));

        // Update status if required with the current effective number of
        // resources
        if pool.status.size != pool_cirs.len() {
            pool.status.size = pool_cirs.len();
            let updated = self.store.update_pool_status(pool).await?;
            pool.meta.version = updated.meta.version;
        }

        if pool.spec.size == pool_cirs.len() {
            return Ok(false);
        }

        let mut selected = 0;

        if pool.spec.size > pool_cirs.len() {
            info!(
                expected = pool.spec.size,
                found = pool_cirs.len(),
                "adding resources to the pool"
            );

            // numerals never repeat, even across evictions: continue from
            // the highest suffix ever observed in the namespace
            let base = highest_numeral(&all_cirs) + 1;
            let delta = (pool.spec.size - pool_cirs.len()) as u64;

            let batch: Vec<Resource> = (base..base + delta)
                .map(|numeral| {
                    Resource::new(
                        &pool.meta.namespace,
                        resource_name(numeral),
                        &pool.meta.name,
                        pool.spec.resource_type,
                    )
                })
                .collect();

            // one store call; names already taken are skipped, the rest
            // of the batch still lands
            let created = self.store.create_resources(batch).await?;
            if (created.len() as u64) < delta {
                error!(
                    requested = delta,
                    created = created.len(),
                    "some resources could not be created, skipping them"
                );
            }
            selected = created.len();
        } else {
            selected = self.evict(pool.spec.size, &pool_cirs, &pool.meta.namespace).await?;
        }

        Ok(selected > 0)
    }

    /// Select resources for eviction until only `target` remain, newest
    /// first, then batch-delete everything labelled. In-flight resources
    /// (provisioning, cleaning, in use, deleting) are never selected.
    async fn evict(&self, target: usize, pool_cirs: &[&Resource], namespace: &str) -> Result<usize> {
        info!(
            expected = target,
            found = pool_cirs.len(),
            "removing resources from the pool"
        );

        let mut selected = 0;

        for cir in pool_cirs.iter().rev() {
            match cir.status.state {
                ResourceState::Available | ResourceState::Maintenance | ResourceState::Error => {
                    if cir.is_marked_for_eviction() {
                        continue;
                    }
                    info!(name = %cir.meta.name, "resource selected for eviction");

                    let mut labelled = (*cir).clone();
                    labelled.meta.set_label(EVICTION_LABEL, EVICTION_LABEL_VALUE);
                    if let Err(err) = self.store.update_resource(&labelled).await {
                        error!(?err, name = %cir.meta.name, "error while selecting resource to be removed, skipping it");
                        continue;
                    }

                    selected += 1;
                }
                state => {
                    debug!(name = %cir.meta.name, %state, "resource ignored for eviction");
                }
            }

            // Check if enough instances have been selected for eviction
            if selected >= pool_cirs.len() - target {
                break;
            }
        }

        self.store
            .delete_resources_by_label(namespace, EVICTION_LABEL, EVICTION_LABEL_VALUE)
            .await?;

        Ok(selected)
    }
}

/// Lists every pool key in the namespace, feeding the manager's resync
/// tick.
pub struct PoolKeys<S> {
    store: Arc<Store<S>>,
    namespace: String,
}

impl<S> fmt::Debug for PoolKeys<S> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PoolKeys")
            .field("namespace", &self.namespace)
            .finish()
    }
}

impl<S: Storage> PoolKeys<S> {
    pub fn new(store: Arc<Store<S>>, namespace: impl Into<String>) -> Self {
        Self {
            store,
            namespace: namespace.into(),
        }
    }
}

#[async_trait]
impl<S: Storage> KeyLister for PoolKeys<S> {
    async fn keys(&self) -> Result<Vec<ObjectKey>> {
        Ok(self
            .store
            .list_pools(&self.namespace)
            .await?
            .iter()
            .map(|p| p.meta.key())
            .collect())
    }
}

fn highest_numeral(cirs: &[Resource]) -> u64 {
    cirs.iter()
        .filter_map(|cir| {
            let numeral = name_numeral(&cir.meta.name);
            if numeral.is_none() {
                info!(name = %cir.meta.name, "resource name malformed, skipping");
            }
            numeral
        })
        .max()
        .unwrap_or(0)
}

#[async_trait]
impl<S: Storage> Reconciler for PoolSizer<S> {
    #[instrument(name = "sizer", level = "debug", skip(self, _cancel))]
    async fn reconcile(&self, key: ObjectKey, _cancel: CancellationToken) -> Result<ReconcileStatus> {
        let Some(mut pool) = self.store.get_pool(&key).await? else {
            return Ok(ReconcileStatus::Done);
        };

        if pool.meta.is_deleting() {
            let pool_cirs: Vec<Resource> = self
                .store
                .list_resources(&pool.meta.namespace)
                .await?
                .into_iter()
                .filter(|c| c.spec.pool_ref == pool.meta.name)
                .collect();

            // Still some resources to be deleted
            if !pool_cirs.is_empty() {
                let refs: Vec<&Resource> = pool_cirs.iter().collect();
                self.evict(0, &refs, &pool.meta.namespace).await?;
                return Ok(ReconcileStatus::requeue(self.delays.deleting));
            }

            // No more resources, pool can be deleted
            if pool.meta.has_finalizer(OFCIR_FINALIZER) {
                pool.meta.remove_finalizer(OFCIR_FINALIZER);
                info!("deleting pool");
                self.store.update_pool(&pool).await?;
            }
            return Ok(ReconcileStatus::Done);
        }

        // Add finalizer if not present; the update re-enqueues this key
        if !pool.meta.has_finalizer(OFCIR_FINALIZER) {
            info!("adding finalizer");
            pool.meta.add_finalizer(OFCIR_FINALIZER);
            self.store.update_pool(&pool).await?;
            return Ok(ReconcileStatus::Done);
        }

        // Check if a state update is required
        if pool.status.state != pool.spec.state {
            pool.status.state = pool.spec.state;
            self.store.update_pool_status(&pool).await?;
            return Ok(ReconcileStatus::Done);
        }

        // Check if the pool is offline, in such case let's skip the
        // reconciliation
        if pool.status.state == PoolState::Offline {
            info!("pool is offline, skipping");
            return Ok(ReconcileStatus::requeue(self.delays.clean));
        }

        // Pool is available
        let is_dirty = self.manage_resources(&mut pool).await?;

        // In case of changes, force a quick re-evaluation of the pool
        let delay = if is_dirty {
            self.delays.dirty
        } else {
            self.delays.clean
        };
        Ok(ReconcileStatus::requeue(delay))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use ofcir_model::{ObjectMeta, PoolSpec, PoolStatus, ResourceType};
    use ofcir_store::memory::MemoryStore;
    use tracing_test::traced_test;

    fn pool(name: &str, size: usize) -> Pool {
        Pool {
            meta: ObjectMeta::new("ns", name),
            spec: PoolSpec {
                provider: "fake-provider".into(),
                provider_info: String::new(),
                priority: 0,
                size,
                timeout: 3600,
                resource_type: ResourceType::Host,
                state: PoolState::Available,
            },
            status: PoolStatus {
                state: PoolState::Available,
                size: 0,
                last_updated: None,
            },
        }
    }

    fn sizer(store: &Arc<Store<MemoryStore>>) -> PoolSizer<MemoryStore> {
        PoolSizer::new(store.clone(), SizerDelays::default())
    }

    async fn reconcile(sizer: &PoolSizer<MemoryStore>, key: &ObjectKey) -> ReconcileStatus {
        sizer
            .reconcile(key.clone(), CancellationToken::new())
            .await
            .expect("reconcile")
    }

    async fn settle(sizer: &PoolSizer<MemoryStore>, key: &ObjectKey, rounds: usize) {
        for _ in 0..rounds {
            reconcile(sizer, key).await;
        }
    }

    #[tokio::test]
    #[traced_test]
    async fn adds_finalizer_first() {
        let store = Arc::new(Store::new(MemoryStore::new()));
        let created = store.create_pool(pool("p0", 2)).await.unwrap();
        let sizer = sizer(&store);

        reconcile(&sizer, &created.meta.key()).await;
        let stored = store.get_pool(&created.meta.key()).await.unwrap().unwrap();
        assert!(stored.meta.has_finalizer(OFCIR_FINALIZER));
        // nothing else happened yet
        assert!(store.list_resources("ns").await.unwrap().is_empty());
    }

    #[tokio::test]
    #[traced_test]
    async fn grows_pool_to_declared_size() {
        let store = Arc::new(Store::new(MemoryStore::new()));
        let created = store.create_pool(pool("p0", 2)).await.unwrap();
        let sizer = sizer(&store);
        let key = created.meta.key();

        settle(&sizer, &key, 3).await;

        let cirs = store.list_resources("ns").await.unwrap();
        let names: Vec<_> = cirs.iter().map(|c| c.meta.name.as_str()).collect();
        assert_eq!(names, vec!["cir-0001", "cir-0002"]);
        for cir in &cirs {
            assert_eq!(cir.spec.pool_ref, "p0");
            assert_eq!(cir.spec.state, ResourceState::None);
        }

        let stored = store.get_pool(&key).await.unwrap().unwrap();
        assert_eq!(stored.status.size, 2);
    }

    #[tokio::test]
    #[traced_test]
    async fn numerals_never_repeat() {
        let store = Arc::new(Store::new(MemoryStore::new()));
        // leftover from another pool's history
        store
            .create_resource(Resource::new("ns", "cir-0005", "other", ResourceType::Host))
            .await
            .unwrap();

        let created = store.create_pool(pool("p0", 1)).await.unwrap();
        let sizer = sizer(&store);
        settle(&sizer, &created.meta.key(), 3).await;

        let cirs = store.list_resources("ns").await.unwrap();
        let names: Vec<_> = cirs.iter().map(|c| c.meta.name.as_str()).collect();
        assert_eq!(names, vec!["cir-0005", "cir-0006"]);
    }

    #[tokio::test]
    #[traced_test]
    async fn shrink_evicts_newest_and_spares_in_use() {
        let store = Arc::new(Store::new(MemoryStore::new()));
        let created = store.create_pool(pool("p0", 3)).await.unwrap();
        let sizer = sizer(&store);
        let key = created.meta.key();
        settle(&sizer, &key, 3).await;

        // mark the middle resource as leased
        let cirs = store.list_resources("ns").await.unwrap();
        for mut cir in cirs {
            cir.status.state = if cir.meta.name == "cir-0002" {
                ResourceState::InUse
            } else {
                ResourceState::Available
            };
            store.update_resource_status(&cir).await.unwrap();
        }

        // shrink to one
        let mut shrunk = store.get_pool(&key).await.unwrap().unwrap();
        shrunk.spec.size = 1;
        store.update_pool(&shrunk).await.unwrap();
        settle(&sizer, &key, 3).await;

        // the in-use resource survives even though it is not the oldest
        let cirs = store.list_resources("ns").await.unwrap();
        let names: Vec<_> = cirs.iter().map(|c| c.meta.name.as_str()).collect();
        assert_eq!(names, vec!["cir-0002"]);
    }

    #[tokio::test]
    #[traced_test]
    async fn offline_pool_is_left_alone() {
        let store = Arc::new(Store::new(MemoryStore::new()));
        let mut offline = pool("p0", 3);
        offline.spec.state = PoolState::Offline;
        offline.status.state = PoolState::Offline;
        let created = store.create_pool(offline).await.unwrap();
        let sizer = sizer(&store);

        settle(&sizer, &created.meta.key(), 3).await;
        assert!(store.list_resources("ns").await.unwrap().is_empty());
    }

    #[tokio::test]
    #[traced_test]
    async fn state_mismatch_copies_desired_into_observed() {
        let store = Arc::new(Store::new(MemoryStore::new()));
        let mut mismatched = pool("p0", 0);
        mismatched.spec.state = PoolState::Offline;
        mismatched.status.state = PoolState::Available;
        let created = store.create_pool(mismatched).await.unwrap();
        let sizer = sizer(&store);

        settle(&sizer, &created.meta.key(), 2).await;
        let stored = store.get_pool(&created.meta.key()).await.unwrap().unwrap();
        assert_eq!(stored.status.state, PoolState::Offline);
        assert!(stored.status.last_updated.is_some());
    }

    #[tokio::test]
    #[traced_test]
    async fn deletion_drains_then_drops_finalizer() {
        let store = Arc::new(Store::new(MemoryStore::new()));
        let created = store.create_pool(pool("p0", 2)).await.unwrap();
        let sizer = sizer(&store);
        let key = created.meta.key();
        settle(&sizer, &key, 3).await;

        // resources are evictable
        for mut cir in store.list_resources("ns").await.unwrap() {
            cir.status.state = ResourceState::Available;
            store.update_resource_status(&cir).await.unwrap();
        }

        store.delete_pool(&key).await.unwrap();

        // first pass evicts, second notices the empty pool and finishes
        let status = reconcile(&sizer, &key).await;
        assert_eq!(
            status,
            ReconcileStatus::requeue(SizerDelays::default().deleting)
        );
        settle(&sizer, &key, 2).await;

        assert!(store.list_resources("ns").await.unwrap().is_empty());
        assert!(store.get_pool(&key).await.unwrap().is_none());
    }

    #[tokio::test]
    #[traced_test]
    async fn deletion_waits_for_held_resources() {
        let store = Arc::new(Store::new(MemoryStore::new()));
        let created = store.create_pool(pool("p0", 1)).await.unwrap();
        let sizer = sizer(&store);
        let key = created.meta.key();
        settle(&sizer, &key, 3).await;

        for mut cir in store.list_resources("ns").await.unwrap() {
            cir.status.state = ResourceState::InUse;
            store.update_resource_status(&cir).await.unwrap();
        }

        store.delete_pool(&key).await.unwrap();
        settle(&sizer, &key, 3).await;

        // the held resource pins the pool
        assert_eq!(store.list_resources("ns").await.unwrap().len(), 1);
        assert!(store.get_pool(&key).await.unwrap().is_some());
    }
}

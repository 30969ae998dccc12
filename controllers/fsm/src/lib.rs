//! # fsm
//!
//! The resource reconciler: drives each resource from birth to usable,
//! through lease and release, and eventually to deletion, calling the
//! pool's provider at the right moments. The machine itself lives in
//! [`machine`]; this module wires it to the store and owns the provider
//! registry and pool secrets.
#![warn(
    missing_debug_implementations,
    rust_2018_idioms,
    unreachable_pub,
    non_snake_case,
    non_upper_case_globals
)]
#![allow(clippy::cognitive_complexity)]
#![deny(rustdoc::broken_intra_doc_links)]

use std::collections::HashMap;
use std::fmt;
use std::path::Path;

use ofcir_core::prelude::*;
use ofcir_providers::{ProviderRegistry, SecretData};
use ofcir_store::{Storage, Store};

mod machine;

pub use machine::FsmDelays;

use machine::{Machine, StepContext};

/// Secret material per pool, read from a YAML file mapping pool name to
/// key/value pairs. The stand-in for a per-pool secret object.
#[derive(Debug, Clone, Default)]
pub struct PoolSecrets {
    secrets: HashMap<String, SecretData>,
}

impl PoolSecrets {
    pub fn load(path: &Path) -> Result<Self> {
        let raw = std::fs::read_to_string(path)
            .with_context(|| format!("failed to read secrets file {}", path.display()))?;
        let secrets = serde_yaml::from_str(&raw)
            .with_context(|| format!("failed to parse secrets file {}", path.display()))?;
        Ok(Self { secrets })
    }

    /// The secret data for `pool`; empty when none is defined
    pub fn for_pool(&self, pool: &str) -> SecretData {
        self.secrets.get(pool).cloned().unwrap_or_default()
    }
}

pub struct ResourceFsm<S> {
    store: Arc<Store<S>>,
    registry: ProviderRegistry,
    secrets: PoolSecrets,
    delays: FsmDelays,
}

impl<S> fmt::Debug for ResourceFsm<S> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ResourceFsm")
            .field("registry", &self.registry)
            .field("delays", &self.delays)
            .finish()
    }
}

impl<S: Storage> ResourceFsm<S> {
    pub fn new(store: Arc<Store<S>>, secrets: PoolSecrets, delays: FsmDelays) -> Self {
        Self {
            store,
            // one registry per reconciler: provider state never leaks
            // across managers or tests
            registry: ProviderRegistry::new(),
            secrets,
            delays,
        }
    }
}

/// Lists every resource key in the namespace, feeding the manager's
/// resync tick.
pub struct ResourceKeys<S> {
    store: Arc<Store<S>>,
    namespace: String,
}

impl<S> fmt::Debug for ResourceKeys<S> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ResourceKeys")
            .field("namespace", &self.namespace)
            .finish()
    }
}

impl<S: Storage> ResourceKeys<S> {
    pub fn new(store: Arc<Store<S>>, namespace: impl Into<String>) -> Self {
        Self {
            store,
            namespace: namespace.into(),
        }
    }
}

#[async_trait]
impl<S: Storage> KeyLister for ResourceKeys<S> {
    async fn keys(&self) -> Result<Vec<ObjectKey>> {
        Ok(self
            .store
            .list_resources(&self.namespace)
            .await?
            .iter()
            .map(|c| c.meta.key())
            .collect())
    }
}

#[async_trait]
impl<S: Storage> Reconciler for ResourceFsm<S> {
    #[instrument(name = "fsm", level = "debug", skip(self, cancel))]
    async fn reconcile(&self, key: ObjectKey, cancel: CancellationToken) -> Result<ReconcileStatus> {
        let Some(mut cir) = self.store.get_resource(&key).await? else {
            return Ok(ReconcileStatus::Done);
        };
        debug!(state = %cir.status.state, "started");

        let pool_key = ObjectKey::new(&cir.meta.namespace, &cir.spec.pool_ref);
        let pool = self
            .store
            .get_pool(&pool_key)
            .await?
            .with_context(|| format!("could not get pool {pool_key}"))?;

        // construction failures are the machine's to judge: fatal ones
        // park the resource, transient ones requeue
        let provider = self
            .registry
            .get(&pool, &self.secrets.for_pool(&pool.meta.name));

        let mut machine = Machine::new(self.delays);
        let outcome = machine
            .process(StepContext {
                cir: &mut cir,
                pool: &pool,
                provider,
                cancel: &cancel,
            })
            .await?;

        // spec takes priority: a status write racing a spec update would
        // be lost anyway
        if outcome.spec_dirty {
            self.store.update_resource(&cir).await?;
        } else if outcome.status_dirty {
            self.store.update_resource_status(&cir).await?;
        }

        debug!(state = %cir.status.state, "done");
        if outcome.retry_after.is_zero() {
            Ok(ReconcileStatus::Done)
        } else {
            Ok(ReconcileStatus::requeue(outcome.retry_after))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use ofcir_model::{
        ObjectMeta, Pool, PoolSpec, PoolState, PoolStatus, Resource, ResourceState, ResourceType,
        FALLBACK_SENTINEL_ID, OFCIR_FINALIZER,
    };
    use ofcir_store::memory::MemoryStore;
    use tracing_test::traced_test;

    fn pool(name: &str, priority: i32, timeout: u64) -> Pool {
        Pool {
            meta: ObjectMeta::new("ns", name),
            spec: PoolSpec {
                provider: "fake-provider".into(),
                provider_info: "region=test".into(),
                priority,
                size: 1,
                timeout,
                resource_type: ResourceType::Host,
                state: PoolState::Available,
            },
            status: PoolStatus {
                state: PoolState::Available,
                size: 0,
                last_updated: Option::None,
            },
        }
    }

    struct Env {
        store: Arc<Store<MemoryStore>>,
        fsm: ResourceFsm<MemoryStore>,
    }

    impl Env {
        async fn new(pool_def: Pool) -> Self {
            let store = Arc::new(Store::new(MemoryStore::new()));
            store.create_pool(pool_def).await.unwrap();
            let fsm = ResourceFsm::new(store.clone(), PoolSecrets::default(), FsmDelays::default());
            Self { store, fsm }
        }

        async fn seed(&self, pool_name: &str) -> ObjectKey {
            let cir = Resource::new("ns", "cir-0001", pool_name, ResourceType::Host);
            let created = self.store.create_resource(cir).await.unwrap();
            created.meta.key()
        }

        async fn step(&self, key: &ObjectKey) {
            self.fsm
                .reconcile(key.clone(), CancellationToken::new())
                .await
                .expect("reconcile");
        }

        async fn settle(&self, key: &ObjectKey, rounds: usize) {
            for _ in 0..rounds {
                self.step(key).await;
            }
        }

        async fn get(&self, key: &ObjectKey) -> Resource {
            self.store
                .get_resource(key)
                .await
                .unwrap()
                .expect("resource exists")
        }
    }

    #[tokio::test]
    #[traced_test]
    async fn newborn_reaches_available() {
        let env = Env::new(pool("p0", 0, 3600)).await;
        let key = env.seed("p0").await;

        // finalizer first
        env.step(&key).await;
        let cir = env.get(&key).await;
        assert!(cir.meta.has_finalizer(OFCIR_FINALIZER));
        assert_eq!(cir.status.state, ResourceState::None);

        // init -> provisioning -> provisioning wait -> available
        env.settle(&key, 4).await;
        let cir = env.get(&key).await;
        assert_eq!(cir.status.state, ResourceState::Available);
        assert!(cir.status.resource_id.starts_with("fake-"));
        assert!(!cir.status.address.is_empty());
        assert_eq!(cir.status.provider_info, "region=test");
        assert!(cir.status.last_updated.is_some());
    }

    #[tokio::test]
    #[traced_test]
    async fn lease_and_release_cycle() {
        let env = Env::new(pool("p0", 0, 3600)).await;
        let key = env.seed("p0").await;
        env.settle(&key, 5).await;

        // the arbiter flips the desired state
        let mut cir = env.get(&key).await;
        cir.spec.state = ResourceState::InUse;
        env.store.update_resource(&cir).await.unwrap();

        env.step(&key).await;
        assert_eq!(env.get(&key).await.status.state, ResourceState::InUse);

        // release
        let mut cir = env.get(&key).await;
        cir.spec.state = ResourceState::Available;
        env.store.update_resource(&cir).await.unwrap();

        // in use -> cleaning -> cleaning wait -> available
        env.settle(&key, 3).await;
        assert_eq!(env.get(&key).await.status.state, ResourceState::Available);
    }

    #[tokio::test]
    #[traced_test]
    async fn fallback_reaches_available_without_provider() {
        let env = Env::new(pool("pf", -1, 3600)).await;
        let key = env.seed("pf").await;

        env.settle(&key, 3).await;
        let cir = env.get(&key).await;
        assert_eq!(cir.status.state, ResourceState::Available);
        assert_eq!(cir.status.resource_id, FALLBACK_SENTINEL_ID);
        assert!(cir.status.address.is_empty());
    }

    #[tokio::test]
    #[traced_test]
    async fn fallback_provisions_lazily_once_leased() {
        let env = Env::new(pool("pf", -1, 3600)).await;
        let key = env.seed("pf").await;
        env.settle(&key, 3).await;

        let mut cir = env.get(&key).await;
        cir.spec.state = ResourceState::InUse;
        env.store.update_resource(&cir).await.unwrap();

        // in use (sentinel) -> provisioning -> wait -> available -> in use
        env.settle(&key, 6).await;
        let cir = env.get(&key).await;
        assert_eq!(cir.status.state, ResourceState::InUse);
        assert!(cir.status.resource_id.starts_with("fake-"));
        assert!(!cir.status.address.is_empty());
    }

    #[tokio::test]
    #[traced_test]
    async fn fallback_release_returns_to_sentinel() {
        let env = Env::new(pool("pf", -1, 3600)).await;
        let key = env.seed("pf").await;
        env.settle(&key, 3).await;

        let mut cir = env.get(&key).await;
        cir.spec.state = ResourceState::InUse;
        env.store.update_resource(&cir).await.unwrap();
        env.settle(&key, 6).await;

        let mut cir = env.get(&key).await;
        cir.spec.state = ResourceState::Available;
        env.store.update_resource(&cir).await.unwrap();
        env.settle(&key, 3).await;

        let cir = env.get(&key).await;
        assert_eq!(cir.status.state, ResourceState::Available);
        assert_eq!(cir.status.resource_id, FALLBACK_SENTINEL_ID);
        assert!(cir.status.address.is_empty());
        assert!(cir.status.provider_info.is_empty());
    }

    #[tokio::test]
    #[traced_test]
    async fn lease_timeout_releases_autonomously() {
        let env = Env::new(pool("p0", 0, 1)).await;
        let key = env.seed("p0").await;
        env.settle(&key, 5).await;

        let mut cir = env.get(&key).await;
        cir.spec.state = ResourceState::InUse;
        env.store.update_resource(&cir).await.unwrap();
        env.step(&key).await;
        assert_eq!(env.get(&key).await.status.state, ResourceState::InUse);

        // outlive the 1s pool timeout without releasing
        tokio::time::sleep(Duration::from_millis(1500)).await;

        // the timeout pass flips the desired state; subsequent passes run
        // the normal cleaning pipeline back to available
        env.settle(&key, 4).await;
        let cir = env.get(&key).await;
        assert_eq!(cir.spec.state, ResourceState::Available);
        assert_eq!(cir.status.state, ResourceState::Available);
    }

    #[tokio::test]
    #[traced_test]
    async fn delete_releases_and_drops_finalizer() {
        let env = Env::new(pool("p0", 0, 3600)).await;
        let key = env.seed("p0").await;
        env.settle(&key, 5).await;

        env.store.delete_resource(&key).await.unwrap();
        // available -> delete -> (release, drop finalizer, removed)
        env.settle(&key, 3).await;
        assert!(env.store.get_resource(&key).await.unwrap().is_none());
    }

    #[tokio::test]
    #[traced_test]
    async fn unknown_provider_parks_resource() {
        let mut bad = pool("p0", 0, 3600);
        bad.spec.provider = "teleporter".into();
        let env = Env::new(bad).await;
        let key = env.seed("p0").await;

        // finalizer, init, then the fatal construction parks the resource
        env.settle(&key, 3).await;
        let cir = env.get(&key).await;
        assert_eq!(cir.status.state, ResourceState::Error);

        // parked: nothing moves it without operator intervention
        env.settle(&key, 2).await;
        assert_eq!(env.get(&key).await.status.state, ResourceState::Error);
    }

    #[tokio::test]
    #[traced_test]
    async fn missing_pool_is_an_error() {
        let env = Env::new(pool("p0", 0, 3600)).await;
        let key = env.seed("ghost-pool").await;
        let result = env
            .fsm
            .reconcile(key.clone(), CancellationToken::new())
            .await;
        assert!(result.is_err());
    }
}

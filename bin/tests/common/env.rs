//! In-process control plane for the e2e scenarios: memory-backed store,
//! reconciler manager with shrunk delays, lease api on an ephemeral port,
//! fake provider.
use std::future::Future;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::{Duration, Instant};

use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use fsm::{FsmDelays, PoolSecrets, ResourceFsm, ResourceKeys};
use ofcir_api::{OfcirApi, OfcirApiGuard, Tokens};
use ofcir_core::{Controller, Manager};
use ofcir_model::{ObjectKey, ResourceState};
use ofcir_store::{memory::MemoryStore, Store};
use sizer::{PoolKeys, PoolSizer, SizerDelays};

pub const TEST_NAMESPACE: &str = "ofcir-system";

/// Reconcile cadences shrunk so scenarios converge in milliseconds
fn test_sizer_delays() -> SizerDelays {
    SizerDelays {
        dirty: Duration::from_millis(50),
        clean: Duration::from_millis(200),
        deleting: Duration::from_millis(100),
    }
}

fn test_fsm_delays() -> FsmDelays {
    FsmDelays {
        retry: Duration::from_millis(100),
        wait_poll: Duration::from_millis(50),
    }
}

pub struct ControlPlane {
    pub store: Arc<Store<MemoryStore>>,
    pub addr: SocketAddr,
    shutdown: CancellationToken,
    manager: JoinHandle<anyhow::Result<()>>,
    _api: OfcirApiGuard,
}

impl ControlPlane {
    pub async fn start(tokens: Tokens) -> Self {
        let store = Arc::new(Store::new(MemoryStore::new()));

        let mut manager = Manager::new();
        manager.register(
            Controller::new(
                "pool",
                store.watch_pools(),
                PoolKeys::new(store.clone(), TEST_NAMESPACE),
                PoolSizer::new(store.clone(), test_sizer_delays()),
            )
            .resync(Duration::from_millis(200)),
        );
        manager.register(
            Controller::new(
                "resource",
                store.watch_resources(),
                ResourceKeys::new(store.clone(), TEST_NAMESPACE),
                ResourceFsm::new(store.clone(), PoolSecrets::default(), test_fsm_delays()),
            )
            .resync(Duration::from_millis(200)),
        );

        let shutdown = CancellationToken::new();
        let signal = shutdown.clone();
        let manager = tokio::spawn(manager.start(async move {
            signal.cancelled().await;
            Ok(())
        }));

        let addr = ephemeral_addr();
        let api = OfcirApi::new(addr, store.clone(), TEST_NAMESPACE.to_owned(), tokens);
        let api_guard = api.serve(shutdown.child_token());

        // wait for the listeners to come up
        tokio::time::sleep(Duration::from_millis(300)).await;

        Self {
            store,
            addr,
            shutdown,
            manager,
            _api: api_guard,
        }
    }

    pub async fn stop(self) {
        self.shutdown.cancel();
        let _ = self.manager.await;
    }

    /// Resources bound to `pool` with the given observed state
    pub async fn count_in_state(&self, pool: &str, state: ResourceState) -> usize {
        self.store
            .list_resources(TEST_NAMESPACE)
            .await
            .expect("list resources")
            .iter()
            .filter(|c| c.spec.pool_ref == pool && c.status.state == state)
            .count()
    }

    pub async fn available_in(&self, pool: &str) -> usize {
        self.count_in_state(pool, ResourceState::Available).await
    }

    pub async fn resources_in(&self, pool: &str) -> usize {
        self.store
            .list_resources(TEST_NAMESPACE)
            .await
            .expect("list resources")
            .iter()
            .filter(|c| c.spec.pool_ref == pool)
            .count()
    }

    pub async fn resource_state(&self, name: &str) -> Option<ResourceState> {
        self.store
            .get_resource(&ObjectKey::new(TEST_NAMESPACE, name))
            .await
            .expect("get resource")
            .map(|c| c.status.state)
    }

    pub async fn pool_exists(&self, name: &str) -> bool {
        self.store
            .get_pool(&ObjectKey::new(TEST_NAMESPACE, name))
            .await
            .expect("get pool")
            .is_some()
    }
}

/// Grab a free port from the OS, then hand it to the api to bind
fn ephemeral_addr() -> SocketAddr {
    let listener = std::net::TcpListener::bind("127.0.0.1:0").expect("bind ephemeral port");
    let addr = listener.local_addr().expect("local addr");
    drop(listener);
    addr
}

/// Poll `check` until it returns true or the deadline passes
pub async fn eventually<F, Fut>(what: &str, timeout: Duration, mut check: F)
where
    F: FnMut() -> Fut,
    Fut: Future<Output = bool>,
{
    let deadline = Instant::now() + timeout;
    loop {
        if check().await {
            return;
        }
        if Instant::now() > deadline {
            panic!("timed out waiting for {what}");
        }
        tokio::time::sleep(Duration::from_millis(50)).await;
    }
}

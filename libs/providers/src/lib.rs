//! # ofcir-providers
//!
//! The capability contract every resource provider implements, plus the
//! registry that constructs and caches provider clients per pool.
//!
//! Providers are slow, external collaborators: `acquire`/`clean` kick off
//! work and return quickly, the `*_completed` calls poll for the outcome.
//! Implementations must be safe for concurrent use.
#![warn(
    missing_debug_implementations,
    rust_2018_idioms,
    unreachable_pub,
    non_snake_case,
    non_upper_case_globals
)]
#![deny(rustdoc::broken_intra_doc_links)]

use std::collections::{BTreeMap, HashMap};
use std::fmt;
use std::sync::Arc;

use async_trait::async_trait;
use parking_lot::Mutex;
use thiserror::Error;
use tracing::debug;

use ofcir_model::{Pool, ResourceType};

pub mod fake;

pub use fake::FakeProvider;

/// Provider tag served by [`FakeProvider`]
pub const FAKE_PROVIDER: &str = "fake-provider";

/// Secret material handed to a provider at construction time
pub type SecretData = BTreeMap<String, String>;

/// A specific instance reserved and/or created by the provider for a
/// given request
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ProviderResource {
    /// Unique identifier used to reference the instance. Required.
    pub id: String,
    /// Public IPv4 address, populated once the instance is ready
    pub address: String,
    /// Extra information specific to the provider
    pub metadata: String,
}

#[derive(Debug, Error)]
pub enum ProviderError {
    /// The provider no longer knows the instance. Treated as success by
    /// release paths.
    #[error("resource {0} not found")]
    ResourceNotFound(String),
    /// Network trouble or an upstream 5xx; retried on the reconcile cadence
    #[error("transient provider failure")]
    Transient(#[source] Box<dyn std::error::Error + Send + Sync>),
    /// Malformed configuration or missing credentials; parks the resource
    #[error("fatal provider failure: {0}")]
    Fatal(String),
}

impl ProviderError {
    pub fn transient<E: std::error::Error + Send + Sync + 'static>(err: E) -> Self {
        ProviderError::Transient(Box::new(err))
    }

    pub fn is_not_found(&self) -> bool {
        matches!(self, ProviderError::ResourceNotFound(_))
    }

    pub fn is_fatal(&self) -> bool {
        matches!(self, ProviderError::Fatal(_))
    }
}

/// The provider capability contract.
///
/// `acquire` must reply promptly with at least an instance id; address and
/// metadata arrive through `acquire_completed` once the instance is ready.
#[async_trait]
pub trait Provider: std::fmt::Debug + Send + Sync + 'static {
    /// Request a new instance for `pool`
    async fn acquire(
        &self,
        size: usize,
        pool: &str,
        resource_type: ResourceType,
    ) -> Result<ProviderResource, ProviderError>;

    /// Poll a pending acquire. `true` means the instance is ready and the
    /// returned resource carries its address and metadata.
    async fn acquire_completed(&self, id: &str)
        -> Result<(bool, ProviderResource), ProviderError>;

    /// Begin a reinstall/wipe so the instance can host the next tenant
    async fn clean(&self, id: &str) -> Result<(), ProviderError>;

    /// Poll a pending clean
    async fn clean_completed(&self, id: &str) -> Result<bool, ProviderError>;

    /// Give the instance back. [`ProviderError::ResourceNotFound`] counts
    /// as success.
    async fn release(&self, id: &str) -> Result<(), ProviderError>;
}

/// Constructs providers from pool declarations and caches the clients.
///
/// The cache is keyed by `(provider, providerInfo, pool)` so one client is
/// shared by every reconcile touching the same pool. The registry is owned
/// by its creator (one per FSM reconciler), not process-global, so tests
/// never share provider state.
pub struct ProviderRegistry {
    providers: Mutex<HashMap<RegistryKey, Arc<dyn Provider>>>,
}

type RegistryKey = (String, String, String);

impl fmt::Debug for ProviderRegistry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ProviderRegistry")
            .field("cached", &self.providers.lock().len())
            .finish()
    }
}

impl Default for ProviderRegistry {
    fn default() -> Self {
        Self::new()
    }
}

impl ProviderRegistry {
    pub fn new() -> Self {
        Self {
            providers: Mutex::new(HashMap::new()),
        }
    }

    /// Fetch (or construct on first use) the provider client for `pool`
    pub fn get(&self, pool: &Pool, secret: &SecretData) -> Result<Arc<dyn Provider>, ProviderError> {
        let key = (
            pool.spec.provider.clone(),
            pool.spec.provider_info.clone(),
            pool.meta.name.clone(),
        );
        let mut guard = self.providers.lock();
        if let Some(provider) = guard.get(&key) {
            return Ok(provider.clone());
        }

        let provider = build(pool, secret)?;
        debug!(provider = %pool.spec.provider, pool = %pool.meta.name, "constructed provider client");
        guard.insert(key, provider.clone());
        Ok(provider)
    }
}

fn build(pool: &Pool, secret: &SecretData) -> Result<Arc<dyn Provider>, ProviderError> {
    match pool.spec.provider.as_str() {
        FAKE_PROVIDER => Ok(Arc::new(FakeProvider::new(
            &pool.spec.provider_info,
            secret,
        ))),
        other => Err(ProviderError::Fatal(format!(
            "unknown provider type: {other}"
        ))),
    }
}

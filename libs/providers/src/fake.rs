//! A provider backed by nothing: a fixed set of in-memory instances with
//! availability flags. Every operation completes immediately, which keeps
//! reconcile tests fast and deterministic.
use std::collections::BTreeMap;
use std::fmt;

use async_trait::async_trait;
use parking_lot::Mutex;
use tracing::debug;

use ofcir_model::ResourceType;

use crate::{Provider, ProviderError, ProviderResource, SecretData};

const DEFAULT_CAPACITY: usize = 10;

#[derive(Debug, Clone)]
struct FakeInstance {
    resource: ProviderResource,
    available: bool,
}

/// The test provider. Each instance owns its own inventory, so creating a
/// fresh `FakeProvider` (or a fresh registry) is all the reset a test
/// needs.
pub struct FakeProvider {
    instances: Mutex<BTreeMap<String, FakeInstance>>,
}

impl fmt::Debug for FakeProvider {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let guard = self.instances.lock();
        let free = guard.values().filter(|i| i.available).count();
        f.debug_struct("FakeProvider")
            .field("instances", &guard.len())
            .field("available", &free)
            .finish()
    }
}

impl FakeProvider {
    pub fn new(_provider_info: &str, _secret: &SecretData) -> Self {
        let instances = (0..DEFAULT_CAPACITY)
            .map(|n| {
                let resource = ProviderResource {
                    id: format!("fake-{n}"),
                    address: format!("1.1.1.{n}"),
                    metadata: "{}".to_owned(),
                };
                (
                    resource.id.clone(),
                    FakeInstance {
                        resource,
                        available: true,
                    },
                )
            })
            .collect();
        Self {
            instances: Mutex::new(instances),
        }
    }

    /// Number of instances currently handed out
    pub fn in_use(&self) -> usize {
        self.instances
            .lock()
            .values()
            .filter(|i| !i.available)
            .count()
    }
}

#[derive(Debug, thiserror::Error)]
#[error("no available instances")]
struct Exhausted;

#[async_trait]
impl Provider for FakeProvider {
    async fn acquire(
        &self,
        _size: usize,
        pool: &str,
        _resource_type: ResourceType,
    ) -> Result<ProviderResource, ProviderError> {
        let mut guard = self.instances.lock();
        let Some(instance) = guard.values_mut().find(|i| i.available) else {
            return Err(ProviderError::transient(Exhausted));
        };
        instance.available = false;
        debug!(id = %instance.resource.id, %pool, "fake acquire");
        Ok(instance.resource.clone())
    }

    async fn acquire_completed(
        &self,
        id: &str,
    ) -> Result<(bool, ProviderResource), ProviderError> {
        let guard = self.instances.lock();
        let instance = guard
            .get(id)
            .ok_or_else(|| ProviderError::ResourceNotFound(id.to_owned()))?;
        Ok((true, instance.resource.clone()))
    }

    async fn clean(&self, id: &str) -> Result<(), ProviderError> {
        let guard = self.instances.lock();
        if !guard.contains_key(id) {
            return Err(ProviderError::ResourceNotFound(id.to_owned()));
        }
        Ok(())
    }

    async fn clean_completed(&self, id: &str) -> Result<bool, ProviderError> {
        let guard = self.instances.lock();
        if !guard.contains_key(id) {
            return Err(ProviderError::ResourceNotFound(id.to_owned()));
        }
        Ok(true)
    }

    async fn release(&self, id: &str) -> Result<(), ProviderError> {
        let mut guard = self.instances.lock();
        let instance = guard
            .get_mut(id)
            .ok_or_else(|| ProviderError::ResourceNotFound(id.to_owned()))?;
        instance.available = true;
        debug!(%id, "fake release");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn fake() -> FakeProvider {
        FakeProvider::new("", &SecretData::new())
    }

    #[tokio::test]
    async fn acquire_release_cycle() {
        let provider = fake();
        let res = provider
            .acquire(1, "p0", ResourceType::Host)
            .await
            .expect("acquire");
        assert!(!res.id.is_empty());
        assert_eq!(provider.in_use(), 1);

        let (ready, full) = provider.acquire_completed(&res.id).await.unwrap();
        assert!(ready);
        assert!(!full.address.is_empty());

        provider.clean(&res.id).await.unwrap();
        assert!(provider.clean_completed(&res.id).await.unwrap());

        provider.release(&res.id).await.unwrap();
        assert_eq!(provider.in_use(), 0);
    }

    #[tokio::test]
    async fn exhaustion_is_transient() {
        let provider = fake();
        for _ in 0..DEFAULT_CAPACITY {
            provider.acquire(1, "p0", ResourceType::Host).await.unwrap();
        }
        let err = provider
            .acquire(1, "p0", ResourceType::Host)
            .await
            .unwrap_err();
        assert!(matches!(err, ProviderError::Transient(_)));
    }

    #[tokio::test]
    async fn unknown_id_is_not_found() {
        let provider = fake();
        let err = provider.release("ghost").await.unwrap_err();
        assert!(err.is_not_found());
    }
}

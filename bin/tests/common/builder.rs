//! Declaration helpers for the e2e scenarios.
use ofcir_model::{ObjectMeta, Pool, PoolSpec, PoolState, PoolStatus, ResourceType};

use super::env::TEST_NAMESPACE;

pub struct PoolBuilder {
    name: String,
    provider: String,
    priority: i32,
    size: usize,
    timeout: u64,
    resource_type: ResourceType,
    state: PoolState,
}

impl PoolBuilder {
    pub fn new(name: &str) -> Self {
        Self {
            name: name.to_owned(),
            provider: "fake-provider".to_owned(),
            priority: 0,
            size: 1,
            timeout: 14400,
            resource_type: ResourceType::Host,
            state: PoolState::Available,
        }
    }

    pub fn size(mut self, size: usize) -> Self {
        self.size = size;
        self
    }

    pub fn priority(mut self, priority: i32) -> Self {
        self.priority = priority;
        self
    }

    pub fn timeout(mut self, secs: u64) -> Self {
        self.timeout = secs;
        self
    }

    #[allow(dead_code)]
    pub fn resource_type(mut self, resource_type: ResourceType) -> Self {
        self.resource_type = resource_type;
        self
    }

    pub fn build(self) -> Pool {
        Pool {
            meta: ObjectMeta::new(TEST_NAMESPACE, self.name),
            spec: PoolSpec {
                provider: self.provider,
                provider_info: String::new(),
                priority: self.priority,
                size: self.size,
                timeout: self.timeout,
                resource_type: self.resource_type,
                state: self.state,
            },
            status: PoolStatus::default(),
        }
    }
}

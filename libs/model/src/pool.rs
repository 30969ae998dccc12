//! Pool: a named, versioned declaration of inventory managed by one
//! provider.
use std::fmt;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::meta::ObjectMeta;
use crate::resource::ResourceType;

/// The two legal pool states
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PoolState {
    /// Pool is active and eligible when looking for a resource
    Available,
    /// Pool is not active; size reconciliation is skipped
    Offline,
}

impl fmt::Display for PoolState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            PoolState::Available => "available",
            PoolState::Offline => "offline",
        })
    }
}

/// Desired state of a Pool
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PoolSpec {
    /// Provider tag used to construct the backend for this pool
    pub provider: String,
    /// Opaque provider configuration
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub provider_info: String,
    /// Pool selection order; negative marks a fallback pool
    pub priority: i32,
    /// Desired number of resources maintained by this pool
    pub size: usize,
    /// How long a resource may be held in use, in seconds
    pub timeout: u64,
    /// Type of the resources birthed from this pool
    #[serde(rename = "type", default)]
    pub resource_type: ResourceType,
    /// Required state of the pool
    pub state: PoolState,
}

impl PoolSpec {
    /// `timeout` as a [`Duration`]
    pub fn timeout(&self) -> Duration {
        Duration::from_secs(self.timeout)
    }
}

/// Observed state of a Pool
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PoolStatus {
    /// Current state of the pool
    pub state: PoolState,
    /// Current number of resources bound to the pool
    pub size: usize,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_updated: Option<DateTime<Utc>>,
}

impl Default for PoolStatus {
    fn default() -> Self {
        Self {
            state: PoolState::Offline,
            size: 0,
            last_updated: None,
        }
    }
}

/// A declared inventory unit: parameter bundle for a provider plus the
/// observed counterpart maintained by the sizer.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Pool {
    #[serde(rename = "metadata")]
    pub meta: ObjectMeta,
    pub spec: PoolSpec,
    #[serde(default)]
    pub status: PoolStatus,
}

impl Pool {
    /// Fallback pools never provision eagerly; the provider is contacted
    /// only once a resource is actually leased.
    pub fn is_fallback(&self) -> bool {
        self.spec.priority < 0
    }
}

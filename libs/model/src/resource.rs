//! Resource: one tracked logical instance bound to a pool.
use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::meta::ObjectMeta;
use crate::{EVICTION_LABEL, FALLBACK_SENTINEL_ID};

/// The lifecycle states of a Resource.
///
/// `None` (the empty string on the wire) is the birth state; `Error` is a
/// terminal leaf that requires operator intervention to leave. All other
/// transitions are driven by the resource FSM.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ResourceState {
    #[default]
    #[serde(rename = "")]
    None,
    #[serde(rename = "provisioning")]
    Provisioning,
    #[serde(rename = "provisioning wait")]
    ProvisioningWait,
    #[serde(rename = "available")]
    Available,
    #[serde(rename = "in use")]
    InUse,
    #[serde(rename = "maintenance")]
    Maintenance,
    #[serde(rename = "cleaning")]
    Cleaning,
    #[serde(rename = "cleaning wait")]
    CleaningWait,
    #[serde(rename = "delete")]
    Delete,
    #[serde(rename = "error")]
    Error,
}

impl ResourceState {
    pub fn as_str(&self) -> &'static str {
        match self {
            ResourceState::None => "",
            ResourceState::Provisioning => "provisioning",
            ResourceState::ProvisioningWait => "provisioning wait",
            ResourceState::Available => "available",
            ResourceState::InUse => "in use",
            ResourceState::Maintenance => "maintenance",
            ResourceState::Cleaning => "cleaning",
            ResourceState::CleaningWait => "cleaning wait",
            ResourceState::Delete => "delete",
            ResourceState::Error => "error",
        }
    }
}

impl fmt::Display for ResourceState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Stored state string did not match any known state
#[derive(Debug, Error, PartialEq, Eq)]
#[error("state not found: {0}")]
pub struct UnknownState(pub String);

impl FromStr for ResourceState {
    type Err = UnknownState;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Ok(match s {
            "" => ResourceState::None,
            "provisioning" => ResourceState::Provisioning,
            "provisioning wait" => ResourceState::ProvisioningWait,
            "available" => ResourceState::Available,
            "in use" => ResourceState::InUse,
            "maintenance" => ResourceState::Maintenance,
            "cleaning" => ResourceState::Cleaning,
            "cleaning wait" => ResourceState::CleaningWait,
            "delete" => ResourceState::Delete,
            "error" => ResourceState::Error,
            other => return Err(UnknownState(other.to_owned())),
        })
    }
}

/// What kind of instance a Resource stands for
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ResourceType {
    /// A single host
    #[default]
    Host,
    /// A set of instances forming a cluster
    Cluster,
}

impl fmt::Display for ResourceType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            ResourceType::Host => "host",
            ResourceType::Cluster => "cluster",
        })
    }
}

impl FromStr for ResourceType {
    type Err = UnknownState;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Ok(match s {
            "host" => ResourceType::Host,
            "cluster" => ResourceType::Cluster,
            other => return Err(UnknownState(other.to_owned())),
        })
    }
}

/// Desired state of a Resource
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ResourceSpec {
    /// Name of the Pool managing this Resource. Immutable once set.
    pub pool_ref: String,
    /// The desired state
    pub state: ResourceState,
    /// Additional information to support clusters
    #[serde(default)]
    pub extra: String,
    /// The type of this resource
    #[serde(rename = "type", default)]
    pub resource_type: ResourceType,
}

/// Observed state of a Resource
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ResourceStatus {
    /// Unique identifier handed out by the provider. Immutable once a
    /// non-empty, non-sentinel value is written.
    #[serde(default)]
    pub resource_id: String,
    /// Public IPv4 address
    #[serde(default)]
    pub address: String,
    /// Provider-specific info copied from the pool at provisioning time
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub provider_info: String,
    /// Provider-specific extra data reported at acquire completion
    #[serde(default)]
    pub extra: String,
    /// Current state
    #[serde(default)]
    pub state: ResourceState,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_updated: Option<DateTime<Utc>>,
}

/// A tracked logical instance: one row in the control plane
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Resource {
    #[serde(rename = "metadata")]
    pub meta: ObjectMeta,
    pub spec: ResourceSpec,
    #[serde(default)]
    pub status: ResourceStatus,
}

impl Resource {
    /// A fresh Resource as the sizer births it: bound to `pool`, desired
    /// and observed state both `None`.
    pub fn new(
        namespace: impl Into<String>,
        name: impl Into<String>,
        pool_ref: impl Into<String>,
        resource_type: ResourceType,
    ) -> Self {
        Self {
            meta: ObjectMeta::new(namespace, name),
            spec: ResourceSpec {
                pool_ref: pool_ref.into(),
                state: ResourceState::None,
                extra: String::new(),
                resource_type,
            },
            status: ResourceStatus::default(),
        }
    }

    /// Does the status carry the fallback sentinel id?
    pub fn has_sentinel_id(&self) -> bool {
        self.status.resource_id == FALLBACK_SENTINEL_ID
    }

    pub fn is_marked_for_eviction(&self) -> bool {
        self.meta.label(EVICTION_LABEL).is_some()
    }
}

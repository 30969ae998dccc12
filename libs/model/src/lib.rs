//! # ofcir-model
//!
//! Data model shared by the reconcilers, the declarative store and the
//! lease API. Pools declare inventory (`PoolSpec`) and report what exists
//! (`PoolStatus`); Resources track one logical instance bound to a pool.
//! Both carry an [`ObjectMeta`] with the store's versioning, labels and
//! finalizer bookkeeping.
#![warn(
    missing_debug_implementations,
    rust_2018_idioms,
    unreachable_pub,
    non_snake_case,
    non_upper_case_globals
)]
#![deny(rustdoc::broken_intra_doc_links)]

pub mod meta;
pub mod pool;
pub mod resource;

pub use meta::{ObjectKey, ObjectMeta};
pub use pool::{Pool, PoolSpec, PoolState, PoolStatus};
pub use resource::{
    Resource, ResourceSpec, ResourceState, ResourceStatus, ResourceType, UnknownState,
};

/// Finalizer guarding teardown of Pools and Resources
pub const OFCIR_FINALIZER: &str = "ofcir.openshift/finalizer";

/// Label marking a Resource selected for eviction
pub const EVICTION_LABEL: &str = "ofcir/eviction";

/// Value set on [`EVICTION_LABEL`]
pub const EVICTION_LABEL_VALUE: &str = "true";

/// Reserved provider id for fallback-pool Resources that have no real
/// backing instance yet
pub const FALLBACK_SENTINEL_ID: &str = "000-fallback-dummy-000";

/// Prefix used when the sizer mints Resource names (`cir-0001`, ...)
pub const RESOURCE_NAME_PREFIX: &str = "cir";

/// Format a Resource name from its numeral
pub fn resource_name(numeral: u64) -> String {
    format!("{RESOURCE_NAME_PREFIX}-{numeral:04}")
}

/// Parse the numeric suffix of a Resource name. Returns `None` for names
/// not of the form `<prefix>-NNNN`.
pub fn name_numeral(name: &str) -> Option<u64> {
    let (_, suffix) = name.rsplit_once('-')?;
    suffix.parse().ok()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn numeral_roundtrip() {
        assert_eq!(resource_name(7), "cir-0007");
        assert_eq!(name_numeral("cir-0007"), Some(7));
        assert_eq!(name_numeral("cir-12345"), Some(12345));
    }

    #[test]
    fn numeral_malformed() {
        assert_eq!(name_numeral("nodash"), None);
        assert_eq!(name_numeral("cir-abc"), None);
        assert_eq!(name_numeral(""), None);
    }
}

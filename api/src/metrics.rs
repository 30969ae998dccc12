//! Api-local metrics for the lease arbiter.
//!
//! Metrics are lazily initialized on first access via `lazy_static!`.
//! The api owns its own counters rather than centralizing them in
//! ofcir-core.

use lazy_static::lazy_static;
use prometheus::{register_int_counter, IntCounter};

lazy_static! {
    /// Count of successful acquires
    pub static ref LEASES_GRANTED: IntCounter = register_int_counter!(
        "leases_granted",
        "count of successfully acquired resources"
    ).unwrap();

    /// Count of successful releases
    pub static ref LEASES_RELEASED: IntCounter = register_int_counter!(
        "leases_released",
        "count of resources released through the api"
    ).unwrap();

    /// Count of acquire candidates lost to a concurrent writer
    pub static ref ACQUIRE_CONFLICTS: IntCounter = register_int_counter!(
        "acquire_conflicts",
        "count of lease candidates skipped due to a conditional update conflict"
    ).unwrap();

    /// Count of acquires that found no available resource
    pub static ref ACQUIRE_EXHAUSTED: IntCounter = register_int_counter!(
        "acquire_exhausted",
        "count of acquire requests that exhausted all candidate pools"
    ).unwrap();
}

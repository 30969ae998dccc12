//! # ofcir-core
//!
//! The reconciler runtime: a work queue with rate-limited retries, a
//! manager that dispatches one reconcile at a time per object key, and the
//! shared configuration/metrics plumbing used by both binaries.
#![warn(
    missing_debug_implementations,
    rust_2018_idioms,
    unreachable_pub,
    non_snake_case,
    non_upper_case_globals
)]
#![allow(clippy::cognitive_complexity)]
#![deny(rustdoc::broken_intra_doc_links)]
pub use anyhow;
pub use async_trait::async_trait;
pub use chrono;
pub use tokio;
pub use tokio_stream;
pub use tokio_util;
pub use tracing;

pub use crate::manager::{Controller, Manager};
pub use crate::reconciler::{KeyLister, ReconcileStatus, Reconciler};

pub mod config;
pub mod env;
pub mod manager;
pub mod metrics;
pub mod prelude;
pub mod queue;
pub mod reconciler;

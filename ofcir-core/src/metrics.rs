#![allow(missing_docs)] // proc macros dont play nicely with docstrings

//! # metrics
//!
//! contains statistics for the reconciler runtime and the lease API
use std::time::Instant;

use lazy_static::lazy_static;
use prometheus::{
    register_histogram_vec, register_int_counter_vec, register_int_gauge,
    register_int_gauge_vec, HistogramVec, IntCounterVec, IntGauge, IntGaugeVec,
};

lazy_static! {
    /// When the process started
    pub static ref START_TIME: Instant = Instant::now();

    /// process uptime
    pub static ref UPTIME: IntGauge =
        register_int_gauge!("uptime", "process uptime (seconds)").unwrap();

    /// count of reconciles by controller and outcome
    pub static ref RECONCILE_COUNT: IntCounterVec = register_int_counter_vec!(
        "reconcile_total",
        "Reconcile count",
        &["controller", "outcome"]
    )
    .unwrap();

    /// histogram of reconcile durations
    pub static ref RECONCILE_DURATION: HistogramVec = register_histogram_vec!(
        "reconcile_duration",
        "reconcile duration (seconds)",
        &["controller"]
    )
    .unwrap();

    /// current number of keys waiting in each work queue
    pub static ref WORKQUEUE_DEPTH: IntGaugeVec = register_int_gauge_vec!(
        "workqueue_depth",
        "count of keys waiting for a reconcile",
        &["controller"]
    )
    .unwrap();
}

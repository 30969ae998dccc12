//! ofcir prelude

pub use crate::{
    anyhow::{self, Context, Result},
    async_trait,
    reconciler::{KeyLister, ReconcileStatus, Reconciler},
    tokio,
    tokio_util::sync::CancellationToken,
    tracing::{self, debug, error, info, instrument, trace, warn},
};

pub use ofcir_model::ObjectKey;

pub use std::{sync::Arc, time::Duration};

//! The per-resource state machine.
//!
//! States and transitions are data: every state owns a handler plus a map
//! of named transition events, and `trigger` is the only way a handler
//! moves a resource to a new state. A handler reports its writes through
//! the two dirty-bits (`spec_dirty`, `status_dirty`); the reconciler
//! persists at most one of them per pass, spec first.
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use ofcir_core::prelude::*;
use ofcir_model::{Pool, Resource, ResourceState, FALLBACK_SENTINEL_ID, OFCIR_FINALIZER};
use ofcir_providers::{Provider, ProviderError};

use ResourceState::*;

/// Delays returned by the machine. Tests shrink these.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FsmDelays {
    /// steady-state retry
    pub retry: Duration,
    /// poll cadence while waiting on the provider
    pub wait_poll: Duration,
}

impl Default for FsmDelays {
    fn default() -> Self {
        Self {
            retry: Duration::from_secs(60),
            wait_poll: Duration::from_secs(30),
        }
    }
}

/// What the machine wants persisted and when to come back
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) struct Outcome {
    pub(crate) spec_dirty: bool,
    pub(crate) status_dirty: bool,
    pub(crate) retry_after: Duration,
}

/// Everything a state handler may look at.
///
/// `provider` carries the construction outcome, not a ready client: only
/// the handlers that actually talk to the provider resolve it, so a
/// fallback resource with a broken pool declaration still moves through
/// its provider-free states.
pub(crate) struct StepContext<'a> {
    pub(crate) cir: &'a mut Resource,
    pub(crate) pool: &'a Pool,
    pub(crate) provider: Result<Arc<dyn Provider>, ProviderError>,
    pub(crate) cancel: &'a CancellationToken,
}

struct StateSpec {
    transitions: HashMap<&'static str, ResourceState>,
}

pub(crate) struct Machine {
    delays: FsmDelays,
    states: HashMap<ResourceState, StateSpec>,
    spec_dirty: bool,
    status_dirty: bool,
    current: ResourceState,
}

fn state(transitions: &[(&'static str, ResourceState)]) -> StateSpec {
    StateSpec {
        transitions: transitions.iter().copied().collect(),
    }
}

impl Machine {
    pub(crate) fn new(delays: FsmDelays) -> Self {
        let states = HashMap::from([
            (None, state(&[("init", Provisioning)])),
            (
                Provisioning,
                state(&[
                    ("on-fallback", Available),
                    ("on-provisioning-requested", ProvisioningWait),
                    ("on-fatal", Error),
                ]),
            ),
            (
                ProvisioningWait,
                state(&[("on-provisioning-complete", Available), ("on-fatal", Error)]),
            ),
            (
                Available,
                state(&[
                    ("on-maintenance", Maintenance),
                    ("acquired", InUse),
                    ("on-delete", Delete),
                ]),
            ),
            (
                Maintenance,
                state(&[
                    ("on-maintenance-complete", Available),
                    ("on-delete", Delete),
                ]),
            ),
            (
                InUse,
                state(&[
                    ("released", Cleaning),
                    ("on-fallback-provisioning", Provisioning),
                ]),
            ),
            (
                Cleaning,
                state(&[("on-cleaning-requested", CleaningWait), ("on-fatal", Error)]),
            ),
            (
                CleaningWait,
                state(&[("on-cleaning-complete", Available), ("on-fatal", Error)]),
            ),
            (Delete, state(&[("on-fatal", Error)])),
            (Error, state(&[])),
        ]);
        Self {
            delays,
            states,
            spec_dirty: false,
            status_dirty: false,
            current: None,
        }
    }

    /// Drive one step of the machine. Returns the dirty-bits and the
    /// requeue delay; a zero delay means "wait for the next event".
    pub(crate) async fn process(&mut self, mut ctx: StepContext<'_>) -> Result<Outcome> {
        let current = ctx.cir.status.state;
        if !self.states.contains_key(&current) {
            anyhow::bail!("state not found: {}", current);
        }
        self.current = current;

        trace!(state = %current, "state -->");
        let result = match current {
            None => self.handle_none(&mut ctx),
            Provisioning => self.handle_provisioning(&mut ctx).await,
            ProvisioningWait => self.handle_provisioning_wait(&mut ctx).await,
            Available => self.handle_available(&mut ctx),
            Maintenance => self.handle_maintenance(&mut ctx),
            InUse => self.handle_in_use(&mut ctx),
            Cleaning => self.handle_cleaning(&mut ctx).await,
            CleaningWait => self.handle_cleaning_wait(&mut ctx).await,
            Delete => self.handle_delete(&mut ctx).await,
            Error => Ok(self.delays.retry),
        };
        trace!(state = %current, "state <--");

        let retry_after = match result {
            Ok(delay) => delay,
            Err(err) => {
                error!(?err, state = %current, "error caught while processing state");
                return Err(err);
            }
        };

        Ok(Outcome {
            spec_dirty: self.spec_dirty,
            status_dirty: self.status_dirty,
            retry_after,
        })
    }

    /// Move to the state the event maps to from the current state
    fn trigger(&mut self, cir: &mut Resource, event: &str) -> Result<Duration> {
        let target = self
            .states
            .get(&self.current)
            .and_then(|s| s.transitions.get(event))
            .copied()
            .ok_or_else(|| anyhow::anyhow!("event not found: {event}"))?;

        info!(
            id = %cir.status.resource_id,
            current = %cir.status.state,
            new = %target,
            "triggering state change"
        );
        cir.status.state = target;
        self.status_dirty = true;
        Ok(self.delays.retry)
    }

    /// The handler changed spec or finalizers; persist the resource itself
    fn update_resource_only(&mut self) -> Duration {
        self.spec_dirty = true;
        self.delays.retry
    }

    /// Fatal provider failures park the resource; everything else bubbles
    /// up for a retried reconcile.
    fn provider_failed(&mut self, cir: &mut Resource, err: ProviderError) -> Result<Duration> {
        if err.is_fatal() {
            error!(%err, id = %cir.status.resource_id, "provider failure is fatal, parking resource");
            return self.trigger(cir, "on-fatal");
        }
        Err(err.into())
    }

    /// Resolve the pool's provider client. A fatal construction failure
    /// (unknown tag, malformed config) parks the resource through the
    /// same on-fatal edge an in-call failure takes; the caller stops with
    /// the steady retry delay when `None` comes back.
    fn provider_or_park(&mut self, ctx: &mut StepContext<'_>) -> Result<Option<Arc<dyn Provider>>> {
        match &ctx.provider {
            Ok(provider) => Ok(Some(provider.clone())),
            Err(err) if err.is_fatal() => {
                error!(%err, id = %ctx.cir.status.resource_id, "provider construction failed, parking resource");
                self.trigger(ctx.cir, "on-fatal")?;
                Ok(Option::None)
            }
            Err(err) => Err(anyhow::anyhow!("constructing provider: {err}")),
        }
    }

    fn handle_none(&mut self, ctx: &mut StepContext<'_>) -> Result<Duration> {
        // Check if cir contains a finalizer when not under deletion
        if !ctx.cir.meta.is_deleting() && ctx.cir.meta.add_finalizer(OFCIR_FINALIZER) {
            info!("adding finalizer");
            return Ok(self.update_resource_only());
        }
        self.trigger(ctx.cir, "init")
    }

    async fn handle_provisioning(&mut self, ctx: &mut StepContext<'_>) -> Result<Duration> {
        // fallback pools stay lazy until a lease actually lands on them
        if ctx.pool.is_fallback() && ctx.cir.spec.state != InUse {
            ctx.cir.status.resource_id = FALLBACK_SENTINEL_ID.to_owned();
            return self.trigger(ctx.cir, "on-fallback");
        }

        let Some(provider) = self.provider_or_park(ctx)? else {
            return Ok(self.delays.retry);
        };
        let acquire = provider.acquire(
            ctx.pool.spec.size,
            &ctx.pool.meta.name,
            ctx.cir.spec.resource_type,
        );
        let resource = tokio::select! {
            _ = ctx.cancel.cancelled() => anyhow::bail!("cancelled while acquiring"),
            result = acquire => match result {
                Ok(resource) => resource,
                Err(err) => return self.provider_failed(ctx.cir, err),
            },
        };

        ctx.cir.status.resource_id = resource.id;
        ctx.cir.status.provider_info = ctx.pool.spec.provider_info.clone();
        info!(id = %ctx.cir.status.resource_id, "provisioning new resource");

        self.trigger(ctx.cir, "on-provisioning-requested")
    }

    async fn handle_provisioning_wait(&mut self, ctx: &mut StepContext<'_>) -> Result<Duration> {
        let Some(provider) = self.provider_or_park(ctx)? else {
            return Ok(self.delays.retry);
        };
        let id = ctx.cir.status.resource_id.clone();
        let (is_ready, resource) = match provider.acquire_completed(&id).await {
            Ok(reply) => reply,
            Err(err) => return self.provider_failed(ctx.cir, err),
        };

        if is_ready {
            ctx.cir.status.address = resource.address;
            ctx.cir.status.extra = resource.metadata;
            info!(
                id = %ctx.cir.status.resource_id,
                address = %ctx.cir.status.address,
                "resource was provisioned"
            );
            self.trigger(ctx.cir, "on-provisioning-complete")?;
            return Ok(Duration::ZERO);
        }

        info!(id = %id, "waiting for new resource to be provisioned");
        Ok(self.delays.wait_poll)
    }

    fn handle_available(&mut self, ctx: &mut StepContext<'_>) -> Result<Duration> {
        if ctx.cir.meta.is_deleting() {
            return self.trigger(ctx.cir, "on-delete");
        }

        if ctx.cir.spec.state == ctx.cir.status.state {
            return Ok(self.delays.retry);
        }

        match ctx.cir.spec.state {
            Maintenance => self.trigger(ctx.cir, "on-maintenance"),
            InUse => self.trigger(ctx.cir, "acquired"),
            _ => Ok(self.delays.retry),
        }
    }

    fn handle_maintenance(&mut self, ctx: &mut StepContext<'_>) -> Result<Duration> {
        if ctx.cir.meta.is_deleting() {
            return self.trigger(ctx.cir, "on-delete");
        }

        if ctx.cir.spec.state == ctx.cir.status.state {
            return Ok(self.delays.retry);
        }

        match ctx.cir.spec.state {
            Available => self.trigger(ctx.cir, "on-maintenance-complete"),
            _ => Ok(self.delays.retry),
        }
    }

    fn handle_in_use(&mut self, ctx: &mut StepContext<'_>) -> Result<Duration> {
        match ctx.cir.spec.state {
            Available => return self.trigger(ctx.cir, "released"),
            InUse => {}
            _ => return Ok(self.delays.retry),
        }

        // a leased fallback resource has no backing instance yet;
        // provision it now
        if ctx.pool.is_fallback()
            && ctx.cir.status.address.is_empty()
            && ctx.cir.has_sentinel_id()
        {
            return self.trigger(ctx.cir, "on-fallback-provisioning");
        }

        // enforce the pool's lease timeout: flipping the desired state
        // routes the resource through the normal cleaning pipeline
        let timeout = ctx.pool.spec.timeout();
        if !timeout.is_zero() {
            if let Some(last_updated) = ctx.cir.status.last_updated {
                let held = ofcir_core::chrono::Utc::now() - last_updated;
                if held.to_std().unwrap_or(Duration::ZERO) > timeout {
                    info!(
                        name = %ctx.cir.meta.name,
                        ?timeout,
                        "lease timed out, releasing resource"
                    );
                    ctx.cir.spec.state = Available;
                    return Ok(self.update_resource_only());
                }
            }
        }

        Ok(self.delays.retry)
    }

    async fn handle_cleaning(&mut self, ctx: &mut StepContext<'_>) -> Result<Duration> {
        if ctx.pool.is_fallback() {
            // drop the real backing instance (if any) and return to the
            // lazy sentinel identity
            let id = ctx.cir.status.resource_id.clone();
            if !id.is_empty() && id != FALLBACK_SENTINEL_ID {
                let Some(provider) = self.provider_or_park(ctx)? else {
                    return Ok(self.delays.retry);
                };
                match provider.release(&id).await {
                    Ok(()) => {}
                    Err(err) if err.is_not_found() => {}
                    Err(err) => return self.provider_failed(ctx.cir, err),
                }
            }
            ctx.cir.status.address = String::new();
            ctx.cir.status.extra = String::new();
            ctx.cir.status.provider_info = String::new();
            ctx.cir.status.resource_id = FALLBACK_SENTINEL_ID.to_owned();
            return self.trigger(ctx.cir, "on-cleaning-requested");
        }

        let Some(provider) = self.provider_or_park(ctx)? else {
            return Ok(self.delays.retry);
        };
        let id = ctx.cir.status.resource_id.clone();
        if let Err(err) = provider.clean(&id).await {
            return self.provider_failed(ctx.cir, err);
        }
        self.trigger(ctx.cir, "on-cleaning-requested")
    }

    async fn handle_cleaning_wait(&mut self, ctx: &mut StepContext<'_>) -> Result<Duration> {
        if ctx.pool.is_fallback() {
            return self.trigger(ctx.cir, "on-cleaning-complete");
        }

        let Some(provider) = self.provider_or_park(ctx)? else {
            return Ok(self.delays.retry);
        };
        let id = ctx.cir.status.resource_id.clone();
        let is_cleaned = match provider.clean_completed(&id).await {
            Ok(done) => done,
            Err(err) => return self.provider_failed(ctx.cir, err),
        };

        if is_cleaned {
            info!(
                id = %id,
                address = %ctx.cir.status.address,
                "resource was cleaned"
            );
            return self.trigger(ctx.cir, "on-cleaning-complete");
        }

        info!(id = %id, "waiting for resource to be cleaned");
        Ok(self.delays.wait_poll)
    }

    async fn handle_delete(&mut self, ctx: &mut StepContext<'_>) -> Result<Duration> {
        info!(id = %ctx.cir.status.resource_id, "removing resource");

        if !ctx.cir.meta.has_finalizer(OFCIR_FINALIZER) {
            // no update
            return Ok(self.delays.retry);
        }

        let id = ctx.cir.status.resource_id.clone();
        let never_backed = id.is_empty() || id == FALLBACK_SENTINEL_ID;
        if !never_backed {
            let Some(provider) = self.provider_or_park(ctx)? else {
                return Ok(self.delays.retry);
            };
            match provider.release(&id).await {
                Ok(()) => {}
                Err(err) if err.is_not_found() => {}
                Err(err) => return self.provider_failed(ctx.cir, err),
            }
        }

        ctx.cir.meta.remove_finalizer(OFCIR_FINALIZER);
        Ok(self.update_resource_only())
    }
}

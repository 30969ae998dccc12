//! The three lease operations, kept apart from the HTTP plumbing.
use std::collections::HashMap;

use axum::{
    body::Body,
    http::{Response, StatusCode},
    response::IntoResponse,
    Json,
};
use rand::seq::SliceRandom;
use tracing::{debug, info};

use ofcir_model::{ObjectKey, Pool, Resource, ResourceState};
use ofcir_store::Storage;

use crate::metrics;
use crate::models::{AcquiredCir, CirStatus, ErrorMsg, ServerResult};
use crate::{ApiState, ValidPools};

/// Pick an available resource from the authorized pools and lease it.
///
/// Pools are filtered by requested type and token binding; candidates are
/// shuffled then stable-sorted by pool priority so ties break randomly but
/// higher-priority pools always win. Fallback pools (negative priority)
/// are only scanned once the primaries are exhausted. The conditional
/// update on the resource version is what makes two concurrent acquires
/// pick distinct resources.
pub(crate) async fn acquire<S: Storage>(
    state: &ApiState<S>,
    valid_pools: &ValidPools,
    type_csv: &str,
) -> ServerResult<Response<Body>> {
    let requested: Vec<&str> = type_csv.split(',').map(str::trim).collect();
    let requested_display = requested.join(", ");

    let pools = state.store.list_pools(&state.namespace).await?;
    let pools_by_name: HashMap<String, Pool> = pools
        .into_iter()
        .filter(|p| {
            requested.contains(&p.spec.resource_type.to_string().as_str())
                && valid_pools.can_use_pool(&p.meta.name)
        })
        .map(|p| (p.meta.name.clone(), p))
        .collect();

    if pools_by_name.is_empty() {
        return Ok((
            StatusCode::NOT_FOUND,
            format!("No available pool found of type [{requested_display}]"),
        )
            .into_response());
    }

    let all_cirs = state.store.list_resources(&state.namespace).await?;

    let mut cirs: Vec<Resource> = Vec::new();
    let mut fallbacks: Vec<Resource> = Vec::new();
    for cir in all_cirs {
        // this cir belongs to a filtered pool, let's skip it
        let Some(pool) = pools_by_name.get(&cir.spec.pool_ref) else {
            continue;
        };
        if pool.is_fallback() {
            fallbacks.push(cir);
        } else {
            cirs.push(cir);
        }
    }

    // random tie-breaking within a priority class
    cirs.shuffle(&mut rand::thread_rng());
    cirs.sort_by_key(|cir| {
        pools_by_name
            .get(&cir.spec.pool_ref)
            .map(|p| p.spec.priority)
            .unwrap_or(i32::MAX)
    });

    // Let's try to look for an available resource in the default pools,
    // then in the fallback ones
    for bucket in [cirs, fallbacks] {
        if let Some(response) = lease_first_available(state, bucket, &pools_by_name).await {
            return Ok(response);
        }
    }

    metrics::ACQUIRE_EXHAUSTED.inc();
    Ok((
        StatusCode::NOT_FOUND,
        format!("No available resource found of type [{requested_display}]"),
    )
        .into_response())
}

async fn lease_first_available<S: Storage>(
    state: &ApiState<S>,
    cirs: Vec<Resource>,
    pools_by_name: &HashMap<String, Pool>,
) -> Option<Response<Body>> {
    for cir in cirs {
        // only available resources are eligible to be acquired
        if cir.status.state != ResourceState::Available {
            continue;
        }

        // check if the resource is not being requested by someone else
        if matches!(
            cir.spec.state,
            ResourceState::InUse | ResourceState::Maintenance
        ) {
            continue;
        }

        let mut leased = cir;
        leased.spec.state = ResourceState::InUse;
        match state.store.update_resource(&leased).await {
            Ok(saved) => {
                let pool = pools_by_name.get(&saved.spec.pool_ref)?;
                info!(name = %saved.meta.name, pool = %pool.meta.name, "resource acquired");
                metrics::LEASES_GRANTED.inc();
                return Some(
                    Json(AcquiredCir {
                        name: saved.meta.name.clone(),
                        pool: pool.meta.name.clone(),
                        provider: pool.spec.provider.clone(),
                        provider_info: saved.status.provider_info.clone(),
                        resource_type: saved.spec.resource_type,
                    })
                    .into_response(),
                );
            }
            Err(err) => {
                // raced by a concurrent acquire (or any other write
                // trouble): move on to the next candidate
                debug!(?err, name = %leased.meta.name, "candidate skipped");
                metrics::ACQUIRE_CONFLICTS.inc();
                continue;
            }
        }
    }

    None
}

pub(crate) async fn status<S: Storage>(
    state: &ApiState<S>,
    valid_pools: &ValidPools,
    name: &str,
) -> ServerResult<Response<Body>> {
    let key = ObjectKey::new(&state.namespace, name);
    let Some(cir) = state.store.get_resource(&key).await? else {
        return Ok((
            StatusCode::BAD_REQUEST,
            Json(ErrorMsg {
                msg: format!("{name} does not exist in namespace {}", state.namespace),
            }),
        )
            .into_response());
    };

    if !valid_pools.can_use_pool(&cir.spec.pool_ref) {
        return Ok(StatusCode::UNAUTHORIZED.into_response());
    }

    let pool_key = ObjectKey::new(&state.namespace, &cir.spec.pool_ref);
    let Some(pool) = state.store.get_pool(&pool_key).await? else {
        return Ok((
            StatusCode::BAD_REQUEST,
            Json(ErrorMsg {
                msg: format!(
                    "Cannot find pool {} for {name} in namespace {}",
                    cir.spec.pool_ref, state.namespace
                ),
            }),
        )
            .into_response());
    };

    Ok(Json(CirStatus {
        name: cir.meta.name.clone(),
        pool: pool.meta.name.clone(),
        provider: pool.spec.provider.clone(),
        provider_info: cir.status.provider_info.clone(),
        resource_type: cir.spec.resource_type,
        ip: cir.status.address.clone(),
        extra: cir.status.extra.clone(),
        status: cir.status.state,
    })
    .into_response())
}

pub(crate) async fn release<S: Storage>(
    state: &ApiState<S>,
    name: &str,
) -> ServerResult<Response<Body>> {
    let key = ObjectKey::new(&state.namespace, name);
    let Some(cir) = state.store.get_resource(&key).await? else {
        return Ok((
            StatusCode::BAD_REQUEST,
            Json(ErrorMsg {
                msg: format!("{name} does not exist in namespace {}", state.namespace),
            }),
        )
            .into_response());
    };

    match cir.status.state {
        ResourceState::InUse => {
            let mut released = cir;
            released.spec.state = ResourceState::Available;
            let saved = state.store.update_resource(&released).await?;
            info!(name = %saved.meta.name, "resource released");
            metrics::LEASES_RELEASED.inc();
            Ok((StatusCode::OK, saved.meta.name).into_response())
        }
        state => Ok((
            StatusCode::BAD_REQUEST,
            Json(ErrorMsg {
                msg: format!(
                    "{name} state must be `{}`, but it is `{}`",
                    ResourceState::InUse,
                    state
                ),
            }),
        )
            .into_response()),
    }
}

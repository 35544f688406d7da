use crate::{
    edge_cache::{full_load, EdgeCacheDirectory, EdgeCacheRecord},
    repository::GraphStore,
    shared_cache::ConflictToken,
};
use std::sync::Arc;
use tracing::{debug, error};
use uuid::Uuid;

/// Compare the tenant's no-conflict snapshot against a fresh full load and
/// swap in the reloaded map if they differ.
///
/// Foreground checks are never blocked: the live snapshot is only locked
/// long enough to copy it, and the swap only happens if nothing refreshed or
/// invalidated the snapshot in the meantime. Returns `true` when drift was
/// detected and repaired.
pub async fn reconcile_tenant(directory: &Arc<EdgeCacheDirectory>, store: &dyn GraphStore, tenant_id: Uuid) -> bool {
    let Some(live) = directory.record(tenant_id, &ConflictToken::NoConflict) else {
        return false;
    };
    if live.is_stale() || live.is_in_progress() {
        debug!(
            tenant_id = %tenant_id,
            "skipping reconciliation: stale {} in progress {}",
            live.is_stale(),
            live.is_in_progress()
        );
        return false;
    }

    let (cached, cached_time) = {
        let _population = live.lock_population().await;
        live.snapshot()
    };

    let (reloaded, reloaded_time) = match full_load(store, directory.config().page_limit, true).await {
        Ok(loaded) => loaded,
        Err(e) => {
            error!(tenant_id = %tenant_id, "reconciliation failed to read edges: {}", e);
            return false;
        }
    };

    // The store cursor trails the cache when the newest edges were deleted
    // since; that alone is not drift.
    if *cached == reloaded && reloaded_time <= cached_time {
        debug!(tenant_id = %tenant_id, "edge snapshot matches store at {}", cached_time);
        return false;
    }

    let cached_len = cached.len();
    let reloaded_len = reloaded.len();
    let repaired = Arc::new(EdgeCacheRecord::loaded(reloaded, reloaded_time));
    let swapped = {
        let mut tenants = directory.tenants.write();
        match tenants.get_mut(&tenant_id) {
            Some(tenant) => {
                let unchanged = tenant
                    .records
                    .get(&ConflictToken::NoConflict)
                    .is_some_and(|current| {
                        Arc::ptr_eq(current, &live)
                            && !current.is_stale()
                            && !current.is_in_progress()
                            && current.updated_time() == cached_time
                    });
                if unchanged {
                    tenant
                        .records
                        .insert(ConflictToken::NoConflict, Arc::clone(&repaired));
                }
                unchanged
            }
            None => false,
        }
    };

    if swapped {
        error!(
            tenant_id = %tenant_id,
            "detected inconsistency in edge snapshot, swapped in reload: {} cached vs {} stored source objects, cache time {} store time {}",
            cached_len,
            reloaded_len,
            cached_time,
            reloaded_time
        );
    }
    swapped
}

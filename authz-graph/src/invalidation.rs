use crate::{
    edge_cache::EdgeCacheDirectory,
    error::Result,
    shared_cache::{edges_modified_key, ConflictToken, InvalidationEvent, SharedCache},
};
use std::sync::{Arc, Weak};
use tracing::{debug, info};
use uuid::Uuid;

impl EdgeCacheDirectory {
    /// Register this directory for the tenant's edge invalidations, once.
    ///
    /// A failed registration leaves the tenant unregistered so the next call
    /// retries.
    pub async fn ensure_registration(self: &Arc<Self>, tenant_id: Uuid, cache: &dyn SharedCache) -> Result<()> {
        if self.is_registered(tenant_id) {
            return Ok(());
        }

        let _registration = self.registration.lock().await;
        if self.is_registered(tenant_id) {
            return Ok(());
        }

        let directory: Weak<Self> = Arc::downgrade(self);
        let handler = Arc::new(move |event: InvalidationEvent| {
            let Some(directory) = directory.upgrade() else {
                return;
            };
            debug!(
                directory = %directory.id(),
                tenant_id = %tenant_id,
                flush = event.flush,
                "resetting edge snapshots"
            );
            directory.reset_tenant(tenant_id, event.flush);
        });
        cache
            .register_invalidation_handler(tenant_id, &edges_modified_key(tenant_id), handler)
            .await?;

        self.tenants
            .write()
            .entry(tenant_id)
            .or_default()
            .invalidation_registered = true;
        info!(directory = %self.id(), tenant_id = %tenant_id, "registered edge invalidation handler");
        Ok(())
    }

    fn is_registered(&self, tenant_id: Uuid) -> bool {
        self.tenants
            .read()
            .get(&tenant_id)
            .is_some_and(|tenant| tenant.invalidation_registered)
    }

    /// Mark the tenant's no-conflict snapshot stale, or every snapshot when
    /// `flush` is set (type and object deletions).
    pub fn reset_tenant(&self, tenant_id: Uuid, flush: bool) {
        let mut tenants = self.tenants.write();
        let tenant = tenants.entry(tenant_id).or_default();
        if let Some(record) = tenant.records.get(&ConflictToken::NoConflict) {
            record.mark_stale();
        }
        if flush {
            for record in tenant.records.values() {
                record.mark_stale();
            }
        }
    }
}

//! Process-local snapshots of each tenant's edge graph.
//!
//! A tenant may hold several snapshots at once, keyed by the conflict token
//! read from the shared cache: one for the no-conflict state and one per
//! tombstone written by an in-flight mutation. Readers that observe a
//! tombstone get a snapshot loaded from the primary that includes the write,
//! seeded from the freshest existing snapshot and brought forward
//! incrementally.
//!
//! Two lock levels: the directory `RwLock` guards map structure and flags and
//! is never held across an await; each snapshot's async mutex is held for the
//! whole population so concurrent readers of the same token wait for one
//! load instead of issuing their own.

use crate::{
    config::EdgeCacheConfig,
    error::{AuthzError, Result},
    models::*,
    reconcile::reconcile_tenant,
    repository::GraphStore,
    shared_cache::{ConflictToken, SharedCache},
};
use chrono::{DateTime, Utc};
use parking_lot::{Mutex, RwLock};
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tokio::sync::OwnedMutexGuard;
use tokio::time::Instant;
use tracing::{debug, error, warn};
use uuid::Uuid;

/// Cursor value of a snapshot that has never been loaded
pub fn zero_time() -> DateTime<Utc> {
    DateTime::<Utc>::default()
}

struct RecordState {
    edges: Arc<EdgeMap>,
    updated_time: DateTime<Utc>,
    validated_at: Instant,
}

/// One snapshot of a tenant's live edges
pub struct EdgeCacheRecord {
    state: Mutex<RecordState>,
    stale: AtomicBool,
    in_progress: AtomicBool,
    population: Arc<tokio::sync::Mutex<()>>,
}

impl EdgeCacheRecord {
    pub(crate) fn new(in_progress: bool) -> Self {
        Self {
            state: Mutex::new(RecordState {
                edges: Arc::new(EdgeMap::new()),
                updated_time: zero_time(),
                validated_at: Instant::now(),
            }),
            stale: AtomicBool::new(false),
            in_progress: AtomicBool::new(in_progress),
            population: Arc::new(tokio::sync::Mutex::new(())),
        }
    }

    pub(crate) fn loaded(edges: EdgeMap, updated_time: DateTime<Utc>) -> Self {
        let record = Self::new(false);
        record.publish(Arc::new(edges), updated_time);
        record
    }

    pub fn is_stale(&self) -> bool {
        self.stale.load(Ordering::SeqCst)
    }

    pub fn is_in_progress(&self) -> bool {
        self.in_progress.load(Ordering::SeqCst)
    }

    pub(crate) fn mark_stale(&self) {
        self.stale.store(true, Ordering::SeqCst);
    }

    /// High-water mark of change times reflected in this snapshot
    pub fn updated_time(&self) -> DateTime<Utc> {
        self.state.lock().updated_time
    }

    pub fn edges(&self) -> Arc<EdgeMap> {
        Arc::clone(&self.state.lock().edges)
    }

    pub(crate) fn snapshot(&self) -> (Arc<EdgeMap>, DateTime<Utc>) {
        let state = self.state.lock();
        (Arc::clone(&state.edges), state.updated_time)
    }

    pub fn edge_count(&self) -> usize {
        self.state.lock().edges.values().map(HashMap::len).sum()
    }

    pub(crate) fn publish(&self, edges: Arc<EdgeMap>, updated_time: DateTime<Utc>) {
        let mut state = self.state.lock();
        state.edges = edges;
        state.updated_time = updated_time;
    }

    /// Wait for any in-flight population of this snapshot
    pub(crate) async fn lock_population(&self) -> OwnedMutexGuard<()> {
        Arc::clone(&self.population).lock_owned().await
    }

    /// Claim validation if it is due, so only one caller spawns the worker
    fn take_validation_due(&self, interval: std::time::Duration) -> bool {
        let mut state = self.state.lock();
        if state.validated_at.elapsed() > interval {
            state.validated_at = Instant::now();
            true
        } else {
            false
        }
    }
}

/// Snapshots of one tenant keyed by conflict token
#[derive(Default)]
pub struct EdgeTenantRecord {
    pub(crate) records: HashMap<ConflictToken, Arc<EdgeCacheRecord>>,
    pub(crate) invalidation_registered: bool,
}

/// All tenants' snapshots held by this process.
///
/// Constructed once and shared by `Arc`; invalidation handlers hold only a
/// `Weak` to it.
pub struct EdgeCacheDirectory {
    id: Uuid,
    pub(crate) tenants: RwLock<HashMap<Uuid, EdgeTenantRecord>>,
    pub(crate) registration: tokio::sync::Mutex<()>,
    config: EdgeCacheConfig,
}

/// Resets a snapshot whose population did not finish, whether it failed or
/// its future was dropped
struct PopulationGuard {
    record: Arc<EdgeCacheRecord>,
    armed: bool,
    _lock: OwnedMutexGuard<()>,
}

impl PopulationGuard {
    fn new(record: Arc<EdgeCacheRecord>, lock: OwnedMutexGuard<()>) -> Self {
        Self {
            record,
            armed: true,
            _lock: lock,
        }
    }

    fn disarm(&mut self) {
        self.armed = false;
    }
}

impl Drop for PopulationGuard {
    fn drop(&mut self) {
        if self.armed {
            self.record.state.lock().updated_time = zero_time();
            self.record.stale.store(true, Ordering::SeqCst);
            self.record.in_progress.store(false, Ordering::SeqCst);
        }
    }
}

enum Claim {
    Existing(Arc<EdgeCacheRecord>),
    New {
        record: Arc<EdgeCacheRecord>,
        lock: OwnedMutexGuard<()>,
        baseline: Option<Arc<EdgeCacheRecord>>,
    },
}

fn insert_edge(edges: &mut EdgeMap, edge: Edge) {
    edges
        .entry(edge.source_object_id)
        .or_default()
        .insert(edge.id, edge);
}

/// Drop the cached incarnation of a deleted edge. An older incarnation's
/// tombstone never removes a newer live row.
fn apply_tombstone(edges: &mut EdgeMap, tombstone: &Edge) {
    let Some(outbound) = edges.get_mut(&tombstone.source_object_id) else {
        return;
    };
    let superseded = outbound
        .get(&tombstone.id)
        .is_some_and(|cached| Some(cached.updated) <= tombstone.deleted);
    if superseded {
        outbound.remove(&tombstone.id);
        if outbound.is_empty() {
            edges.remove(&tombstone.source_object_id);
        }
    }
}

/// Load every live edge page by page, ordered by update time.
///
/// An edge read on an earlier page can be deleted before the next page is
/// read, and that delete is stamped no earlier than the previous page's
/// newest row. Every page after the first therefore asks for tombstones
/// deleted since its own start cursor.
pub(crate) async fn full_load(
    store: &dyn GraphStore,
    page_limit: usize,
    allow_follower_read: bool,
) -> Result<(EdgeMap, DateTime<Utc>)> {
    let mut edges = EdgeMap::new();
    let mut cursor = zero_time();

    loop {
        let page_start = cursor;
        let deleted_since = (page_start != zero_time()).then_some(page_start);
        let page = store
            .list_edges_for_cache(page_start, deleted_since, page_limit, allow_follower_read)
            .await?;

        for edge in page.edges {
            if edge.is_alive() {
                cursor = cursor.max(edge.updated);
                insert_edge(&mut edges, edge);
            } else {
                apply_tombstone(&mut edges, &edge);
            }
        }

        if page.live_read < page_limit {
            break;
        }
        if cursor <= page_start {
            return Err(AuthzError::Storage(format!(
                "full edge load stuck at {}: more than {} edges share one update time",
                cursor, page_limit
            )));
        }
    }

    Ok((edges, cursor))
}

/// Apply every edge change since `cursor` (minus `backdate`) to `edges` and
/// return the advanced cursor
pub(crate) async fn incremental_load(
    store: &dyn GraphStore,
    edges: &mut EdgeMap,
    cursor: DateTime<Utc>,
    backdate: std::time::Duration,
    allow_follower_read: bool,
) -> Result<DateTime<Utc>> {
    let backdate = chrono::Duration::from_std(backdate)
        .map_err(|e| AuthzError::Config(format!("invalid incremental backdate: {}", e)))?;
    let mut rows = store
        .list_edges_changed_since(cursor - backdate, allow_follower_read)
        .await?;
    rows.sort_by_key(Edge::changed_at);

    let mut cursor = cursor;
    let mut latest: HashMap<Uuid, Edge> = HashMap::with_capacity(rows.len());
    for row in rows {
        cursor = cursor.max(row.updated).max(row.changed_at());
        if let Some(previous) = latest.get(&row.id) {
            if previous.is_alive() && row.is_alive() {
                error!("duplicate live rows for edge {}: {} / {}", row.id, previous, row);
            }
        }
        latest.insert(row.id, row);
    }

    for (_, row) in latest {
        if row.is_alive() {
            insert_edge(edges, row);
        } else {
            apply_tombstone(edges, &row);
        }
    }
    Ok(cursor)
}

impl EdgeCacheDirectory {
    pub fn new(config: EdgeCacheConfig) -> Arc<Self> {
        Arc::new(Self {
            id: Uuid::new_v4(),
            tenants: RwLock::new(HashMap::new()),
            registration: tokio::sync::Mutex::new(()),
            config,
        })
    }

    /// Instance id, used to tell directories apart in logs
    pub fn id(&self) -> Uuid {
        self.id
    }

    pub fn config(&self) -> &EdgeCacheConfig {
        &self.config
    }

    /// Snapshot currently registered for `token`, if any
    pub fn record(&self, tenant_id: Uuid, token: &ConflictToken) -> Option<Arc<EdgeCacheRecord>> {
        self.tenants
            .read()
            .get(&tenant_id)
            .and_then(|tenant| tenant.records.get(token).cloned())
    }

    /// Conflict tokens with a snapshot for `tenant_id`
    pub fn tokens(&self, tenant_id: Uuid) -> Vec<ConflictToken> {
        self.tenants
            .read()
            .get(&tenant_id)
            .map(|tenant| tenant.records.keys().cloned().collect())
            .unwrap_or_default()
    }

    /// Edge map for `tenant_id` consistent with the shared cache's current
    /// conflict token, loading or refreshing the matching snapshot if needed.
    pub async fn get_edge_map(
        self: &Arc<Self>,
        tenant_id: Uuid,
        store: &Arc<dyn GraphStore>,
        cache: &dyn SharedCache,
    ) -> Result<Arc<EdgeMap>> {
        self.ensure_registration(tenant_id, cache).await?;
        let token = cache.edges_modified_token(tenant_id).await?;

        match self.claim(tenant_id, &token)? {
            Claim::Existing(record) => {
                let lock = record.lock_population().await;
                if !record.is_stale() {
                    debug!(
                        directory = %self.id,
                        tenant_id = %tenant_id,
                        "returning edge snapshot for {} ({} edges, time {})",
                        token,
                        record.edge_count(),
                        record.updated_time()
                    );
                    if token == ConflictToken::NoConflict
                        && record.take_validation_due(self.config.validation_interval())
                    {
                        self.spawn_reconciliation(tenant_id, Arc::clone(store));
                    }
                    return Ok(record.edges());
                }

                {
                    let _tenants = self.tenants.write();
                    record.stale.store(false, Ordering::SeqCst);
                    record.in_progress.store(true, Ordering::SeqCst);
                }
                self.populate(tenant_id, &token, record, lock, None, store.as_ref())
                    .await
            }
            Claim::New {
                record,
                lock,
                baseline,
            } => {
                self.populate(tenant_id, &token, record, lock, baseline, store.as_ref())
                    .await
            }
        }
    }

    fn claim(&self, tenant_id: Uuid, token: &ConflictToken) -> Result<Claim> {
        let mut tenants = self.tenants.write();
        let tenant = tenants.entry(tenant_id).or_default();
        if let Some(existing) = tenant.records.get(token) {
            return Ok(Claim::Existing(Arc::clone(existing)));
        }

        let record = Arc::new(EdgeCacheRecord::new(true));
        let lock = Arc::clone(&record.population)
            .try_lock_owned()
            .map_err(|e| AuthzError::Internal(anyhow::anyhow!("fresh snapshot already locked: {}", e)))?;
        let baseline = if token.is_tombstone() {
            tenant
                .records
                .values()
                .filter(|candidate| !candidate.is_in_progress())
                .max_by_key(|candidate| candidate.updated_time())
                .cloned()
        } else {
            None
        };
        tenant.records.insert(token.clone(), Arc::clone(&record));
        Ok(Claim::New {
            record,
            lock,
            baseline,
        })
    }

    async fn populate(
        &self,
        tenant_id: Uuid,
        token: &ConflictToken,
        record: Arc<EdgeCacheRecord>,
        lock: OwnedMutexGuard<()>,
        baseline: Option<Arc<EdgeCacheRecord>>,
        store: &dyn GraphStore,
    ) -> Result<Arc<EdgeMap>> {
        let mut guard = PopulationGuard::new(Arc::clone(&record), lock);
        let allow_follower_read = token.allow_follower_read();

        let (mut edges, mut cursor) = match &baseline {
            Some(base) => base.snapshot(),
            None => record.snapshot(),
        };

        if cursor == zero_time() {
            debug!(directory = %self.id, tenant_id = %tenant_id, "populating edge snapshot for {}", token);
            let (loaded, loaded_cursor) =
                full_load(store, self.config.page_limit, allow_follower_read).await?;
            edges = Arc::new(loaded);
            cursor = loaded_cursor;
        } else {
            debug!(
                directory = %self.id,
                tenant_id = %tenant_id,
                "updating edge snapshot for {} from time {}",
                token,
                cursor
            );
            // readers may still hold the published map, so refresh a copy
            let mut refreshed = EdgeMap::clone(&edges);
            cursor = incremental_load(
                store,
                &mut refreshed,
                cursor,
                self.config.incremental_backdate(),
                allow_follower_read,
            )
            .await?;
            edges = Arc::new(refreshed);
        }

        record.publish(Arc::clone(&edges), cursor);

        {
            let mut tenants = self.tenants.write();
            record.in_progress.store(false, Ordering::SeqCst);
            guard.disarm();
            let grace = chrono::Duration::from_std(self.config.tombstone_gc_grace())
                .unwrap_or_else(|_| chrono::Duration::zero());
            if let Some(tenant) = tenants.get_mut(&tenant_id) {
                if *token == ConflictToken::NoConflict {
                    tenant.records = HashMap::from([(token.clone(), Arc::clone(&record))]);
                } else {
                    tenant.records.retain(|other_token, other| {
                        let expired = other_token.is_tombstone()
                            && !Arc::ptr_eq(other, &record)
                            && !other.is_in_progress()
                            && other.updated_time() + grace < cursor;
                        if expired {
                            debug!(
                                directory = %self.id,
                                tenant_id = %tenant_id,
                                "evicting edge snapshot for {} at time {}",
                                other_token,
                                other.updated_time()
                            );
                        }
                        !expired
                    });
                }
            }
        }

        debug!(
            directory = %self.id,
            tenant_id = %tenant_id,
            "edge snapshot for {} ready: {} source objects, time {}",
            token,
            edges.len(),
            cursor
        );
        drop(guard);

        if self.config.verify && *token == ConflictToken::NoConflict {
            if let Err(e) = self.verify_snapshot(tenant_id, &edges, cursor, store).await {
                warn!(tenant_id = %tenant_id, "edge snapshot verification failed: {}", e);
            }
        }
        Ok(edges)
    }

    async fn verify_snapshot(
        &self,
        tenant_id: Uuid,
        edges: &EdgeMap,
        cursor: DateTime<Utc>,
        store: &dyn GraphStore,
    ) -> Result<()> {
        let (reloaded, reloaded_cursor) = full_load(store, self.config.page_limit, true).await?;
        if reloaded_cursor != cursor {
            debug!(
                tenant_id = %tenant_id,
                "edges changed between incremental and full reload ({} vs {})",
                cursor,
                reloaded_cursor
            );
        } else if reloaded != *edges {
            warn!(
                tenant_id = %tenant_id,
                "edge snapshot diverged from store at time {}: {} cached vs {} stored source objects",
                cursor,
                edges.len(),
                reloaded.len()
            );
        }
        Ok(())
    }

    fn spawn_reconciliation(self: &Arc<Self>, tenant_id: Uuid, store: Arc<dyn GraphStore>) {
        let directory = Arc::clone(self);
        tokio::spawn(async move {
            reconcile_tenant(&directory, store.as_ref(), tenant_id).await;
        });
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::repository::InMemoryGraphStore;
    use crate::shared_cache::InMemorySharedCache;

    async fn seeded_store(edge_count: usize) -> (InMemoryGraphStore, Uuid) {
        let store = InMemoryGraphStore::new();
        let ty = store.create_object_type(ObjectType::new("node")).await.unwrap();
        let link = store
            .create_edge_type(EdgeType::new("link", ty.id, ty.id, vec![Attribute::direct("read")]))
            .await
            .unwrap();
        let source = store.create_object(Object::new(ty.id)).await.unwrap();
        for _ in 0..edge_count {
            let target = store.create_object(Object::new(ty.id)).await.unwrap();
            store
                .create_edge(Edge::new(link.id, source.id, target.id))
                .await
                .unwrap();
        }
        (store, source.id)
    }

    #[tokio::test]
    async fn test_full_load_pages_through_all_edges() {
        let (store, source) = seeded_store(7).await;
        let (edges, cursor) = full_load(&store, 3, true).await.unwrap();

        assert_eq!(edges.get(&source).map(HashMap::len), Some(7));
        let newest = store.edge_rows().iter().map(|e| e.updated).max().unwrap();
        assert_eq!(cursor, newest);
        // pages overlap on their boundary row: 1-3, 3-5, 5-7, then 7 alone
        assert_eq!(store.edge_reads(), 4);
    }

    #[tokio::test]
    async fn test_full_load_rejects_page_that_does_not_advance() {
        let store = InMemoryGraphStore::new();
        let stamp = Utc::now();
        let source = Uuid::new_v4();
        for _ in 0..4 {
            let mut edge = Edge::new(Uuid::new_v4(), source, Uuid::new_v4());
            edge.updated = stamp;
            store.insert_edge_row(edge);
        }

        let err = full_load(&store, 2, true).await.unwrap_err();
        assert!(matches!(err, AuthzError::Storage(_)));
    }

    #[tokio::test]
    async fn test_incremental_keeps_last_row_per_edge() {
        let store = InMemoryGraphStore::new();
        let base = Utc::now();
        let source = Uuid::new_v4();
        let mut first = Edge::new(Uuid::new_v4(), source, Uuid::new_v4());
        first.updated = base;
        first.deleted = Some(base + chrono::Duration::milliseconds(5));
        let mut recreated = first.clone();
        recreated.updated = base + chrono::Duration::milliseconds(7);
        recreated.deleted = None;
        store.insert_edge_row(first.clone());
        store.insert_edge_row(recreated.clone());

        let mut edges = EdgeMap::new();
        let cursor = incremental_load(
            &store,
            &mut edges,
            base - chrono::Duration::seconds(1),
            std::time::Duration::from_millis(10),
            true,
        )
        .await
        .unwrap();

        assert_eq!(
            edges.get(&source).and_then(|out| out.get(&recreated.id)),
            Some(&recreated)
        );
        assert_eq!(cursor, recreated.updated);
    }

    #[test]
    fn test_old_tombstone_does_not_remove_newer_incarnation() {
        let mut edges = EdgeMap::new();
        let mut live = Edge::new(Uuid::new_v4(), Uuid::new_v4(), Uuid::new_v4());
        let mut tombstone = live.clone();
        tombstone.deleted = Some(live.updated);
        live.updated += chrono::Duration::milliseconds(1);
        insert_edge(&mut edges, live.clone());

        apply_tombstone(&mut edges, &tombstone);
        assert!(edges.contains_key(&live.source_object_id));

        tombstone.deleted = Some(live.updated);
        apply_tombstone(&mut edges, &tombstone);
        assert!(edges.is_empty());
    }

    async fn refreshed_directory(
        config: EdgeCacheConfig,
        store: Arc<InMemoryGraphStore>,
    ) -> (Arc<EdgeCacheDirectory>, Arc<dyn GraphStore>, InMemorySharedCache, Uuid) {
        let directory = EdgeCacheDirectory::new(config);
        let cache = InMemorySharedCache::new();
        let tenant_id = Uuid::new_v4();
        let store: Arc<dyn GraphStore> = store;
        directory.get_edge_map(tenant_id, &store, &cache).await.unwrap();
        (directory, store, cache, tenant_id)
    }

    #[tokio::test]
    async fn test_refresh_leaves_published_map_untouched() {
        let (store, source) = seeded_store(2).await;
        let store = Arc::new(store);
        let (directory, dyn_store, cache, tenant_id) =
            refreshed_directory(EdgeCacheConfig::default(), Arc::clone(&store)).await;
        let before = directory.get_edge_map(tenant_id, &dyn_store, &cache).await.unwrap();

        store.insert_edge_row(Edge::new(Uuid::new_v4(), source, Uuid::new_v4()));
        directory.reset_tenant(tenant_id, false);
        let after = directory.get_edge_map(tenant_id, &dyn_store, &cache).await.unwrap();

        assert!(!Arc::ptr_eq(&before, &after));
        assert_eq!(before.get(&source).map(HashMap::len), Some(2));
        assert_eq!(after.get(&source).map(HashMap::len), Some(3));
    }

    #[tokio::test]
    async fn test_failed_verification_is_not_surfaced() {
        let (store, source) = seeded_store(1).await;
        let store = Arc::new(store);
        let config = EdgeCacheConfig {
            verify: true,
            page_limit: 2,
            ..EdgeCacheConfig::default()
        };
        let (directory, dyn_store, cache, tenant_id) =
            refreshed_directory(config, Arc::clone(&store)).await;

        // too many rows share one update time for a full reload to page past
        let stamp = Utc::now() + chrono::Duration::seconds(1);
        for _ in 0..3 {
            let mut edge = Edge::new(Uuid::new_v4(), source, Uuid::new_v4());
            edge.updated = stamp;
            store.insert_edge_row(edge);
        }
        directory.reset_tenant(tenant_id, false);

        let edges = directory.get_edge_map(tenant_id, &dyn_store, &cache).await.unwrap();
        assert_eq!(edges.get(&source).map(HashMap::len), Some(4));
        let record = directory.record(tenant_id, &ConflictToken::NoConflict).unwrap();
        assert!(!record.is_stale());
        assert_eq!(record.updated_time(), stamp);
    }

    #[tokio::test]
    async fn test_dropped_population_leaves_record_stale() {
        let record = Arc::new(EdgeCacheRecord::loaded(EdgeMap::new(), Utc::now()));
        record.in_progress.store(true, Ordering::SeqCst);
        let lock = record.lock_population().await;

        drop(PopulationGuard::new(Arc::clone(&record), lock));

        assert!(record.is_stale());
        assert!(!record.is_in_progress());
        assert_eq!(record.updated_time(), zero_time());
        // the private lock is free again
        assert!(Arc::clone(&record.population).try_lock_owned().is_ok());
    }
}

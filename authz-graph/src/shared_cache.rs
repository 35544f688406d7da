//! Distributed cache collaborator
//!
//! The shared cache carries three things for each tenant:
//!
//! - the edges-collection modification marker, read as a [`ConflictToken`].
//!   Writers replace it with a fresh tombstone while a graph mutation is in
//!   flight, and readers use it to pick the snapshot they may serve from.
//! - the second-level cache of positive attribute paths, guarded by a
//!   per-tenant generation that every release bumps.
//! - the invalidation fan-out that tells each process to mark its snapshots
//!   stale.

use crate::{error::Result, models::AttributePathNode};
use async_trait::async_trait;
use dashmap::DashMap;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::time::Instant;
use tracing::debug;
use uuid::Uuid;

pub mod redis;

pub use self::redis::RedisSharedCache;

/// Pub/sub channel carrying [`InvalidationEvent`]s between processes
pub const INVALIDATION_CHANNEL: &str = "authz_handlers_invalidations";

/// Key of the edges-collection modification marker for a tenant
pub fn edges_modified_key(tenant_id: Uuid) -> String {
    format!("authz:{}:edges:modified", tenant_id)
}

/// Value of the edges-collection modification marker as seen by a reader
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum ConflictToken {
    /// No write in flight; snapshots may be shared and follower reads are fine
    NoConflict,
    /// A write holds (or recently held) the collection lock
    Tombstone(String),
}

impl ConflictToken {
    pub fn new_tombstone() -> Self {
        Self::Tombstone(Uuid::new_v4().to_string())
    }

    pub fn is_tombstone(&self) -> bool {
        matches!(self, Self::Tombstone(_))
    }

    /// Whether reads made under this token may be served by a lagging replica
    pub fn allow_follower_read(&self) -> bool {
        !self.is_tombstone()
    }
}

impl fmt::Display for ConflictToken {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::NoConflict => write!(f, "NoLock"),
            Self::Tombstone(value) => write!(f, "Tombstone:{}", value),
        }
    }
}

/// Guard returned by a path lookup and handed back on save.
///
/// A save only lands if no invalidation happened in between.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PathSentinel {
    Generation(u64),
    /// The collection was locked at lookup time; the result must not be saved
    Unavailable,
}

/// Key of a cached attribute path
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct PathCacheKey {
    pub source_object_id: Uuid,
    pub target_object_id: Uuid,
    pub attribute: String,
}

impl PathCacheKey {
    pub fn new(source_object_id: Uuid, target_object_id: Uuid, attribute: &str) -> Self {
        Self {
            source_object_id,
            target_object_id,
            attribute: attribute.to_string(),
        }
    }
}

impl fmt::Display for PathCacheKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{}:{}:{}",
            self.source_object_id, self.target_object_id, self.attribute
        )
    }
}

/// Invalidation published when a tenant's edges collection changes
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct InvalidationEvent {
    pub tenant_id: Uuid,
    pub key: String,
    /// Drop every snapshot of the tenant, not only the no-conflict one
    pub flush: bool,
}

pub type InvalidationHandler = Arc<dyn Fn(InvalidationEvent) + Send + Sync>;

#[async_trait]
pub trait SharedCache: Send + Sync {
    /// Current value of the tenant's edges-collection modification marker
    async fn edges_modified_token(&self, tenant_id: Uuid) -> Result<ConflictToken>;

    /// Replace the marker with a fresh tombstone ahead of a graph write
    async fn take_collection_lock(&self, tenant_id: Uuid) -> Result<ConflictToken>;

    /// End a graph write: drop cached paths, clear the tombstone if it is
    /// still ours, and notify every registered invalidation handler.
    async fn release_collection_lock(
        &self,
        tenant_id: Uuid,
        token: &ConflictToken,
        flush: bool,
    ) -> Result<()>;

    async fn get_attribute_path(
        &self,
        tenant_id: Uuid,
        key: &PathCacheKey,
    ) -> Result<(Option<Vec<AttributePathNode>>, PathSentinel)>;

    async fn save_attribute_path(
        &self,
        tenant_id: Uuid,
        key: &PathCacheKey,
        path: &[AttributePathNode],
        sentinel: PathSentinel,
    ) -> Result<()>;

    /// Call `handler` for every invalidation of `key` in `tenant_id`
    async fn register_invalidation_handler(
        &self,
        tenant_id: Uuid,
        key: &str,
        handler: InvalidationHandler,
    ) -> Result<()>;
}

#[derive(Debug, Clone)]
struct Marker {
    token: ConflictToken,
    expires_at: Option<Instant>,
}

#[derive(Default)]
pub(crate) struct HandlerRegistry {
    handlers: DashMap<Uuid, Vec<(String, InvalidationHandler)>>,
}

impl HandlerRegistry {
    pub(crate) fn register(&self, tenant_id: Uuid, key: &str, handler: InvalidationHandler) {
        self.handlers
            .entry(tenant_id)
            .or_default()
            .push((key.to_string(), handler));
    }

    pub(crate) fn dispatch(&self, event: &InvalidationEvent) {
        let matching: Vec<InvalidationHandler> = self
            .handlers
            .get(&event.tenant_id)
            .map(|entry| {
                entry
                    .iter()
                    .filter(|(key, _)| *key == event.key)
                    .map(|(_, handler)| Arc::clone(handler))
                    .collect()
            })
            .unwrap_or_default();
        debug!(
            tenant_id = %event.tenant_id,
            flush = event.flush,
            "dispatching invalidation to {} handlers",
            matching.len()
        );
        for handler in matching {
            handler(event.clone());
        }
    }

    /// Deliver a flush to every registered handler, for when invalidations
    /// may have been missed
    pub(crate) fn flush_all(&self) {
        let registered: Vec<(InvalidationEvent, InvalidationHandler)> = self
            .handlers
            .iter()
            .flat_map(|entry| {
                let tenant_id = *entry.key();
                entry
                    .value()
                    .iter()
                    .map(|(key, handler)| {
                        let event = InvalidationEvent {
                            tenant_id,
                            key: key.clone(),
                            flush: true,
                        };
                        (event, Arc::clone(handler))
                    })
                    .collect::<Vec<_>>()
            })
            .collect();
        debug!("flushing {} invalidation handlers", registered.len());
        for (event, handler) in registered {
            handler(event);
        }
    }
}

/// Process-local shared cache for tests and single-process deployments.
///
/// Invalidation handlers run synchronously inside
/// [`SharedCache::release_collection_lock`]. A tombstone outlives its release
/// for `tombstone_ttl`; with the default of zero the marker returns to
/// no-conflict as soon as the lock is released.
pub struct InMemorySharedCache {
    markers: DashMap<Uuid, Marker>,
    generations: DashMap<Uuid, u64>,
    paths: DashMap<(Uuid, PathCacheKey), (u64, Vec<AttributePathNode>)>,
    handlers: HandlerRegistry,
    tombstone_ttl: Duration,
    token_reads: AtomicUsize,
    path_reads: AtomicUsize,
    path_writes: AtomicUsize,
}

impl InMemorySharedCache {
    pub fn new() -> Self {
        Self::with_tombstone_ttl(Duration::ZERO)
    }

    pub fn with_tombstone_ttl(tombstone_ttl: Duration) -> Self {
        Self {
            markers: DashMap::new(),
            generations: DashMap::new(),
            paths: DashMap::new(),
            handlers: HandlerRegistry::default(),
            tombstone_ttl,
            token_reads: AtomicUsize::new(0),
            path_reads: AtomicUsize::new(0),
            path_writes: AtomicUsize::new(0),
        }
    }

    pub fn token_reads(&self) -> usize {
        self.token_reads.load(Ordering::SeqCst)
    }

    pub fn path_reads(&self) -> usize {
        self.path_reads.load(Ordering::SeqCst)
    }

    /// Number of attribute paths actually stored
    pub fn path_writes(&self) -> usize {
        self.path_writes.load(Ordering::SeqCst)
    }

    /// Publish an invalidation without touching the marker, as a peer process
    /// releasing its lock would.
    pub fn publish_invalidation(&self, tenant_id: Uuid, flush: bool) {
        self.bump_generation(tenant_id);
        self.handlers.dispatch(&InvalidationEvent {
            tenant_id,
            key: edges_modified_key(tenant_id),
            flush,
        });
    }

    fn current_token(&self, tenant_id: Uuid) -> ConflictToken {
        let Some(marker) = self.markers.get(&tenant_id).map(|entry| entry.value().clone()) else {
            return ConflictToken::NoConflict;
        };
        match marker.expires_at {
            Some(expires_at) if expires_at <= Instant::now() => {
                self.markers
                    .remove_if(&tenant_id, |_, current| current.token == marker.token);
                ConflictToken::NoConflict
            }
            _ => marker.token,
        }
    }

    fn generation(&self, tenant_id: Uuid) -> u64 {
        self.generations.get(&tenant_id).map_or(0, |entry| *entry.value())
    }

    fn bump_generation(&self, tenant_id: Uuid) {
        *self.generations.entry(tenant_id).or_insert(0) += 1;
        self.paths.retain(|(tenant, _), _| *tenant != tenant_id);
    }
}

impl Default for InMemorySharedCache {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl SharedCache for InMemorySharedCache {
    async fn edges_modified_token(&self, tenant_id: Uuid) -> Result<ConflictToken> {
        self.token_reads.fetch_add(1, Ordering::SeqCst);
        Ok(self.current_token(tenant_id))
    }

    async fn take_collection_lock(&self, tenant_id: Uuid) -> Result<ConflictToken> {
        let token = ConflictToken::new_tombstone();
        self.markers.insert(
            tenant_id,
            Marker {
                token: token.clone(),
                expires_at: None,
            },
        );
        Ok(token)
    }

    async fn release_collection_lock(
        &self,
        tenant_id: Uuid,
        token: &ConflictToken,
        flush: bool,
    ) -> Result<()> {
        if self.tombstone_ttl.is_zero() {
            self.markers
                .remove_if(&tenant_id, |_, marker| marker.token == *token);
        } else if let Some(mut marker) = self.markers.get_mut(&tenant_id) {
            if marker.token == *token {
                marker.expires_at = Some(Instant::now() + self.tombstone_ttl);
            }
        }
        self.publish_invalidation(tenant_id, flush);
        Ok(())
    }

    async fn get_attribute_path(
        &self,
        tenant_id: Uuid,
        key: &PathCacheKey,
    ) -> Result<(Option<Vec<AttributePathNode>>, PathSentinel)> {
        self.path_reads.fetch_add(1, Ordering::SeqCst);
        if self.current_token(tenant_id).is_tombstone() {
            return Ok((None, PathSentinel::Unavailable));
        }
        let generation = self.generation(tenant_id);
        let path = self
            .paths
            .get(&(tenant_id, key.clone()))
            .filter(|entry| entry.value().0 == generation)
            .map(|entry| entry.value().1.clone());
        Ok((path, PathSentinel::Generation(generation)))
    }

    async fn save_attribute_path(
        &self,
        tenant_id: Uuid,
        key: &PathCacheKey,
        path: &[AttributePathNode],
        sentinel: PathSentinel,
    ) -> Result<()> {
        let PathSentinel::Generation(generation) = sentinel else {
            return Ok(());
        };
        if generation != self.generation(tenant_id) || self.current_token(tenant_id).is_tombstone() {
            debug!(tenant_id = %tenant_id, "skipping save of path {}: invalidated since lookup", key);
            return Ok(());
        }
        self.paths
            .insert((tenant_id, key.clone()), (generation, path.to_vec()));
        self.path_writes.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }

    async fn register_invalidation_handler(
        &self,
        tenant_id: Uuid,
        key: &str,
        handler: InvalidationHandler,
    ) -> Result<()> {
        self.handlers.register(tenant_id, key, handler);
        Ok(())
    }
}

use crate::{
    check::SearchGraph,
    config::AuthzConfig,
    edge_cache::EdgeCacheDirectory,
    error::{AuthzError, Result},
    models::*,
    remote::RemoteEvaluator,
    repository::{load_edge_map, load_edge_type_map, GraphStore},
    shared_cache::{PathCacheKey, SharedCache},
};
use std::collections::{BTreeSet, HashMap};
use std::future::Future;
use std::sync::Arc;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

/// Attribute check engine for one tenant.
///
/// Cheap to construct: the store, caches and snapshot directory are shared
/// by `Arc` across every engine in the process.
#[derive(Clone)]
pub struct AuthorizationEngine {
    tenant_id: Uuid,

    /// Source of truth for objects, types and edges
    store: Arc<dyn GraphStore>,

    /// Modification markers, path cache and invalidation fan-out. Without it
    /// every search reads the graph straight from the store.
    shared_cache: Option<Arc<dyn SharedCache>>,

    /// Process-wide edge snapshots
    directory: Arc<EdgeCacheDirectory>,

    /// Delegate checks to a peer service instead of searching locally
    remote: Option<RemoteEvaluator>,

    config: Arc<AuthzConfig>,
}

impl AuthorizationEngine {
    pub fn new(
        tenant_id: Uuid,
        store: Arc<dyn GraphStore>,
        directory: Arc<EdgeCacheDirectory>,
        config: Arc<AuthzConfig>,
    ) -> Self {
        Self {
            tenant_id,
            store,
            shared_cache: None,
            directory,
            remote: None,
            config,
        }
    }

    pub fn with_shared_cache(mut self, shared_cache: Arc<dyn SharedCache>) -> Self {
        self.shared_cache = Some(shared_cache);
        self
    }

    pub fn with_remote_evaluator(mut self, remote: RemoteEvaluator) -> Self {
        self.remote = Some(remote);
        self
    }

    pub fn tenant_id(&self) -> Uuid {
        self.tenant_id
    }

    pub fn store(&self) -> &Arc<dyn GraphStore> {
        &self.store
    }

    // =============================================================================
    // Attribute checks
    // =============================================================================

    /// Whether `source` has `attribute` on `target`, with the path that
    /// grants it.
    ///
    /// Positive answers are served from and saved to the shared path cache.
    /// Bounded by `evaluation.check_timeout_ms` when set; dropping the future
    /// cancels the check.
    pub async fn check_attribute(
        &self,
        source_object_id: Uuid,
        target_object_id: Uuid,
        attribute: &str,
    ) -> Result<CheckAttributeResponse> {
        let check = self.check_attribute_uncapped(source_object_id, target_object_id, attribute);
        match self.config.evaluation.check_timeout() {
            Some(limit) => tokio::time::timeout(limit, check)
                .await
                .map_err(|_| AuthzError::Timeout(limit))?,
            None => check.await,
        }
    }

    async fn check_attribute_uncapped(
        &self,
        source_object_id: Uuid,
        target_object_id: Uuid,
        attribute: &str,
    ) -> Result<CheckAttributeResponse> {
        let key = PathCacheKey::new(source_object_id, target_object_id, attribute);

        let mut sentinel = None;
        if let Some(cache) = &self.shared_cache {
            let (cached, guard) = cache.get_attribute_path(self.tenant_id, &key).await?;
            if let Some(path) = cached {
                debug!(tenant_id = %self.tenant_id, "path cache hit for {}", key);
                return Ok(CheckAttributeResponse::granted(path));
            }
            sentinel = Some(guard);
        }

        let (found, path) = if let Some(remote) = &self.remote {
            let response = remote
                .check_attribute(self.tenant_id, source_object_id, target_object_id, attribute)
                .await?;
            (response.has_attribute, response.path)
        } else if self.config.evaluation.shadow {
            self.shadow_check(source_object_id, target_object_id, attribute)
                .await?
        } else {
            self.check_attribute_bfs(source_object_id, target_object_id, attribute, false)
                .await?
        };

        if !found {
            return Ok(CheckAttributeResponse::denied());
        }

        if let (Some(cache), Some(sentinel)) = (&self.shared_cache, sentinel) {
            if let Err(e) = cache
                .save_attribute_path(self.tenant_id, &key, &path, sentinel)
                .await
            {
                warn!(tenant_id = %self.tenant_id, "failed to cache path for {}: {}", key, e);
            }
        }
        Ok(CheckAttributeResponse::granted(path))
    }

    /// Run the search against a fresh read of the store and against the
    /// snapshot cache, log any divergence and answer from the fresh read
    async fn shadow_check(
        &self,
        source_object_id: Uuid,
        target_object_id: Uuid,
        attribute: &str,
    ) -> Result<(bool, Vec<AttributePathNode>)> {
        let uncached = self
            .check_attribute_bfs(source_object_id, target_object_id, attribute, true)
            .await?;
        match self
            .check_attribute_bfs(source_object_id, target_object_id, attribute, false)
            .await
        {
            Ok(cached) if cached.0 != uncached.0 => error!(
                tenant_id = %self.tenant_id,
                "cached search disagrees for {} -[{}]-> {}: cached {} store {}",
                source_object_id,
                attribute,
                target_object_id,
                cached.0,
                uncached.0
            ),
            Ok(cached) if cached.1 != uncached.1 => debug!(
                tenant_id = %self.tenant_id,
                "cached search found a different path for {} -[{}]-> {}: {:?} vs {:?}",
                source_object_id,
                attribute,
                target_object_id,
                cached.1,
                uncached.1
            ),
            Ok(_) => {}
            Err(e) => error!(tenant_id = %self.tenant_id, "cached search failed in shadow mode: {}", e),
        }
        Ok(uncached)
    }

    /// Breadth-first path search from `source` to `target`, bypassing the
    /// path cache. `skip_cache` also bypasses the edge snapshots.
    pub async fn check_attribute_bfs(
        &self,
        source_object_id: Uuid,
        target_object_id: Uuid,
        attribute: &str,
        skip_cache: bool,
    ) -> Result<(bool, Vec<AttributePathNode>)> {
        let (edges, edge_types) = self.load_graph(skip_cache).await?;
        let outcome = SearchGraph::new(self.tenant_id, &edges, &edge_types)
            .with_max_candidates(self.config.search.max_candidates)
            .check_attribute_bfs(source_object_id, target_object_id, attribute);
        self.after_search(outcome)
    }

    /// Every object of `target_object_type_id` on which `source` has
    /// `attribute`
    pub async fn list_objects_reachable_with_attribute(
        &self,
        source_object_id: Uuid,
        target_object_type_id: Uuid,
        attribute: &str,
    ) -> Result<Vec<Uuid>> {
        let (edges, edge_types) = self.load_graph(false).await?;
        let outcome = SearchGraph::new(self.tenant_id, &edges, &edge_types)
            .with_max_candidates(self.config.search.max_candidates)
            .list_objects_reachable_bfs(source_object_id, target_object_type_id, attribute);
        self.after_search(outcome)
    }

    /// Every attribute `source` has on `target`, sorted by name.
    ///
    /// Candidates are the names the source can carry out through one of its
    /// edges (direct or inherit) that an edge into the target also grants
    /// (direct or propagate). Each candidate is confirmed with
    /// [`check_attribute`](Self::check_attribute).
    pub async fn list_attributes(
        &self,
        source_object_id: Uuid,
        target_object_id: Uuid,
    ) -> Result<Vec<String>> {
        let (edges, edge_types) = self.load_graph(false).await?;

        let outbound: BTreeSet<&str> = edges
            .get(&source_object_id)
            .into_iter()
            .flat_map(HashMap::values)
            .flat_map(|edge| attributes_of(&edge_types, edge))
            .filter(|attribute| attribute.direct || attribute.inherit)
            .map(|attribute| attribute.name.as_str())
            .collect();
        let candidates: BTreeSet<String> = edges
            .values()
            .flat_map(HashMap::values)
            .filter(|edge| edge.target_object_id == target_object_id)
            .flat_map(|edge| attributes_of(&edge_types, edge))
            .filter(|attribute| {
                (attribute.direct || attribute.propagate) && outbound.contains(attribute.name.as_str())
            })
            .map(|attribute| attribute.name.clone())
            .collect();
        debug!(
            tenant_id = %self.tenant_id,
            "checking {} candidate attributes of {} on {}",
            candidates.len(),
            source_object_id,
            target_object_id
        );

        let mut attributes = Vec::with_capacity(candidates.len());
        for attribute in candidates {
            if self
                .check_attribute(source_object_id, target_object_id, &attribute)
                .await?
                .has_attribute
            {
                attributes.push(attribute);
            }
        }
        Ok(attributes)
    }

    async fn load_graph(&self, skip_cache: bool) -> Result<(Arc<EdgeMap>, EdgeTypeMap)> {
        let page_limit = self.config.edge_cache.page_limit;
        let edges = match &self.shared_cache {
            Some(cache) if !skip_cache && self.config.edge_cache.enabled => {
                self.directory
                    .get_edge_map(self.tenant_id, &self.store, cache.as_ref())
                    .await?
            }
            _ => Arc::new(load_edge_map(self.store.as_ref(), page_limit).await?),
        };
        let edge_types = load_edge_type_map(self.store.as_ref(), page_limit).await?;
        Ok((edges, edge_types))
    }

    /// An edge whose type is missing means the snapshot raced a type change;
    /// drop every snapshot so the retry reloads.
    fn after_search<T>(&self, outcome: Result<T>) -> Result<T> {
        if let Err(AuthzError::CacheInconsistency { edge_type_id, edge_id }) = &outcome {
            warn!(
                tenant_id = %self.tenant_id,
                "edge {} references unknown edge type {}, flushing edge snapshots",
                edge_id,
                edge_type_id
            );
            self.directory.reset_tenant(self.tenant_id, true);
        }
        outcome
    }

    // =============================================================================
    // Graph mutations
    // =============================================================================

    pub async fn create_object_type(&self, object_type: ObjectType) -> Result<ObjectType> {
        info!(tenant_id = %self.tenant_id, "Creating object type {}", object_type.type_name);
        self.store.create_object_type(object_type).await
    }

    pub async fn create_object(&self, object: Object) -> Result<Object> {
        self.store.create_object(object).await
    }

    pub async fn create_edge_type(&self, edge_type: EdgeType) -> Result<EdgeType> {
        info!(tenant_id = %self.tenant_id, "Creating edge type {}", edge_type.type_name);
        self.store.create_edge_type(edge_type).await
    }

    pub async fn create_edge(&self, edge: Edge) -> Result<Edge> {
        debug!(tenant_id = %self.tenant_id, "Creating {}", edge);
        self.with_collection_lock(false, || self.store.create_edge(edge))
            .await
    }

    pub async fn delete_edge(&self, edge_id: Uuid) -> Result<()> {
        debug!(tenant_id = %self.tenant_id, "Deleting edge {}", edge_id);
        self.with_collection_lock(false, || self.store.delete_edge(edge_id))
            .await
    }

    pub async fn delete_edges_from_object(&self, object_id: Uuid) -> Result<()> {
        self.with_collection_lock(false, || self.store.delete_edges_from_object(object_id))
            .await
    }

    pub async fn delete_object(&self, object_id: Uuid) -> Result<()> {
        info!(tenant_id = %self.tenant_id, "Deleting object {}", object_id);
        self.with_collection_lock(true, || self.store.delete_object(object_id))
            .await
    }

    pub async fn delete_edge_type(&self, edge_type_id: Uuid) -> Result<()> {
        info!(tenant_id = %self.tenant_id, "Deleting edge type {}", edge_type_id);
        self.with_collection_lock(true, || self.store.delete_edge_type(edge_type_id))
            .await
    }

    pub async fn delete_object_type(&self, object_type_id: Uuid) -> Result<()> {
        info!(tenant_id = %self.tenant_id, "Deleting object type {}", object_type_id);
        self.with_collection_lock(true, || self.store.delete_object_type(object_type_id))
            .await
    }

    /// Run an edge-affecting write with the tenant's edges collection locked,
    /// so readers in the meantime load a snapshot that includes it. The lock
    /// is released (and the invalidation published) even if the write fails.
    async fn with_collection_lock<T, F, Fut>(&self, flush: bool, write: F) -> Result<T>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<T>>,
    {
        let Some(cache) = &self.shared_cache else {
            return write().await;
        };

        let token = cache.take_collection_lock(self.tenant_id).await?;
        let written = write().await;
        let released = cache
            .release_collection_lock(self.tenant_id, &token, flush)
            .await;

        match (written, released) {
            (Ok(value), Ok(())) => Ok(value),
            (Err(e), released) => {
                if let Err(release_err) = released {
                    error!(
                        tenant_id = %self.tenant_id,
                        "failed to release edges collection lock after failed write: {}",
                        release_err
                    );
                }
                Err(e)
            }
            (Ok(_), Err(e)) => Err(e),
        }
    }
}

fn attributes_of<'t>(edge_types: &'t EdgeTypeMap, edge: &Edge) -> impl Iterator<Item = &'t Attribute> {
    edge_types
        .get(&edge.edge_type_id)
        .into_iter()
        .flat_map(|edge_type| edge_type.attributes.iter())
}

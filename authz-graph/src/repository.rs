use crate::{
    error::{AuthzError, Result},
    models::*,
};
use async_trait::async_trait;
use chrono::{DateTime, Duration, Utc};
use dashmap::DashMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use uuid::Uuid;

pub mod postgres;

pub use postgres::PostgresGraphStore;

/// Largest page the store is asked for in one call
pub const MAX_PAGE_LIMIT: usize = 1500;

/// Source-of-truth storage for one tenant's objects, types and edges.
///
/// All deletes are soft deletes: rows keep their id and get a delete time.
/// Deleting an object type cascades to its edge types and objects, deleting
/// an edge type cascades to its edges, deleting an object removes the edges
/// from and to it.
#[async_trait]
pub trait GraphStore: Send + Sync {
    async fn create_object_type(&self, object_type: ObjectType) -> Result<ObjectType>;

    async fn create_object(&self, object: Object) -> Result<Object>;

    async fn create_edge_type(&self, edge_type: EdgeType) -> Result<EdgeType>;

    /// Create an edge, enforcing that its endpoints match the edge type
    async fn create_edge(&self, edge: Edge) -> Result<Edge>;

    async fn get_object(&self, id: Uuid) -> Result<Object>;

    async fn get_edge_type(&self, id: Uuid) -> Result<EdgeType>;

    async fn delete_edge(&self, id: Uuid) -> Result<()>;

    async fn delete_edges_from_object(&self, object_id: Uuid) -> Result<()>;

    async fn delete_object(&self, id: Uuid) -> Result<()>;

    async fn delete_edge_type(&self, id: Uuid) -> Result<()>;

    async fn delete_object_type(&self, id: Uuid) -> Result<()>;

    /// Live edges ordered by id, starting after `after`
    async fn list_edges_page(&self, after: Option<Uuid>, limit: usize) -> Result<Page<Edge>>;

    /// Live edge types ordered by id, starting after `after`
    async fn list_edge_types_page(
        &self,
        after: Option<Uuid>,
        limit: usize,
    ) -> Result<Page<EdgeType>>;

    /// Up to `limit` live edges with `updated >= updated_since` ordered by
    /// update time. With `deleted_since` set, they are followed by every edge
    /// updated at or before the last of them and deleted at or after
    /// `deleted_since`.
    async fn list_edges_for_cache(
        &self,
        updated_since: DateTime<Utc>,
        deleted_since: Option<DateTime<Utc>>,
        limit: usize,
        allow_follower_read: bool,
    ) -> Result<CacheEdgePage>;

    /// Every edge row updated or deleted at or after `since`, tombstones
    /// included.
    async fn list_edges_changed_since(
        &self,
        since: DateTime<Utc>,
        allow_follower_read: bool,
    ) -> Result<Vec<Edge>>;
}

/// Load every live edge into an adjacency map, bypassing any cache
pub async fn load_edge_map(store: &dyn GraphStore, page_limit: usize) -> Result<EdgeMap> {
    let mut edges = EdgeMap::new();
    let mut after = None;
    loop {
        let page = store.list_edges_page(after, page_limit).await?;
        for edge in page.items {
            edges
                .entry(edge.source_object_id)
                .or_default()
                .insert(edge.id, edge);
        }
        match page.next {
            Some(next) => after = Some(next),
            None => break,
        }
    }
    Ok(edges)
}

/// Load every live edge type keyed by id
pub async fn load_edge_type_map(store: &dyn GraphStore, page_limit: usize) -> Result<EdgeTypeMap> {
    let mut edge_types = EdgeTypeMap::new();
    let mut after = None;
    loop {
        let page = store.list_edge_types_page(after, page_limit).await?;
        for edge_type in page.items {
            edge_types.insert(edge_type.id, edge_type);
        }
        match page.next {
            Some(next) => after = Some(next),
            None => break,
        }
    }
    Ok(edge_types)
}

/// Check the type and organization constraints between an edge type and the
/// objects an edge would connect.
pub fn validate_edge_endpoints(edge_type: &EdgeType, source: &Object, target: &Object) -> Result<()> {
    if source.type_id != edge_type.source_object_type_id {
        return Err(AuthzError::InvalidEdge(format!(
            "source object ({}, type id: {}) doesn't match source object type '{}'",
            source.id, source.type_id, edge_type.source_object_type_id
        )));
    }
    if target.type_id != edge_type.target_object_type_id {
        return Err(AuthzError::InvalidEdge(format!(
            "target object ({}, type id: {}) doesn't match target object type '{}'",
            target.id, target.type_id, edge_type.target_object_type_id
        )));
    }
    if let Some(org) = edge_type.organization_id {
        if source.organization_id != Some(org) || target.organization_id != Some(org) {
            return Err(AuthzError::InvalidEdge(format!(
                "edge type {} is scoped to organization {} but objects {} and {} are not both in it",
                edge_type.id, org, source.id, target.id
            )));
        }
    }
    Ok(())
}

fn page_from<T>(mut items: Vec<T>, limit: usize, id: impl Fn(&T) -> Uuid) -> Page<T> {
    let has_more = items.len() > limit;
    items.truncate(limit);
    let next = if has_more { items.last().map(id) } else { None };
    Page { items, next }
}

/// In-memory graph store for testing and development.
///
/// Edge rows are kept per id so that an edge id can carry a live row and
/// tombstones from earlier incarnations, as the relational store does.
/// Timestamps handed out by the store are strictly increasing.
pub struct InMemoryGraphStore {
    object_types: Arc<DashMap<Uuid, ObjectType>>,
    objects: Arc<DashMap<Uuid, Object>>,
    edge_types: Arc<DashMap<Uuid, EdgeType>>,
    edges: Arc<DashMap<Uuid, Vec<Edge>>>,
    clock: parking_lot::Mutex<DateTime<Utc>>,
    edge_reads: AtomicUsize,
    edge_type_reads: AtomicUsize,
}

impl InMemoryGraphStore {
    pub fn new() -> Self {
        Self {
            object_types: Arc::new(DashMap::new()),
            objects: Arc::new(DashMap::new()),
            edge_types: Arc::new(DashMap::new()),
            edges: Arc::new(DashMap::new()),
            clock: parking_lot::Mutex::new(DateTime::<Utc>::MIN_UTC),
            edge_reads: AtomicUsize::new(0),
            edge_type_reads: AtomicUsize::new(0),
        }
    }

    /// Number of edge listing calls served so far
    pub fn edge_reads(&self) -> usize {
        self.edge_reads.load(Ordering::SeqCst)
    }

    /// Number of edge type listing calls served so far
    pub fn edge_type_reads(&self) -> usize {
        self.edge_type_reads.load(Ordering::SeqCst)
    }

    /// Every stored edge row, tombstones included
    pub fn edge_rows(&self) -> Vec<Edge> {
        self.edges
            .iter()
            .flat_map(|entry| entry.value().clone())
            .collect()
    }

    /// Insert an edge row as-is, bypassing validation and the store clock.
    /// Used to stage histories such as a deleted and recreated edge id.
    pub fn insert_edge_row(&self, edge: Edge) {
        self.edges.entry(edge.id).or_default().push(edge);
    }

    fn tick(&self) -> DateTime<Utc> {
        let mut last = self.clock.lock();
        let now = Utc::now();
        let next = if now > *last {
            now
        } else {
            *last + Duration::microseconds(1)
        };
        *last = next;
        next
    }

    fn live_edges(&self) -> Vec<Edge> {
        self.edges
            .iter()
            .flat_map(|entry| {
                entry
                    .value()
                    .iter()
                    .filter(|edge| edge.is_alive())
                    .cloned()
                    .collect::<Vec<_>>()
            })
            .collect()
    }

    fn soft_delete_edges_where(&self, deleted: DateTime<Utc>, pred: impl Fn(&Edge) -> bool) -> usize {
        let mut count = 0;
        for mut entry in self.edges.iter_mut() {
            for edge in entry.value_mut().iter_mut() {
                if edge.is_alive() && pred(edge) {
                    edge.deleted = Some(deleted);
                    count += 1;
                }
            }
        }
        count
    }

    fn live_object(&self, id: Uuid) -> Result<Object> {
        self.objects
            .get(&id)
            .map(|entry| entry.value().clone())
            .filter(Object::is_alive)
            .ok_or_else(|| AuthzError::NotFound(format!("object {}", id)))
    }

    fn live_edge_type(&self, id: Uuid) -> Result<EdgeType> {
        self.edge_types
            .get(&id)
            .map(|entry| entry.value().clone())
            .filter(EdgeType::is_alive)
            .ok_or_else(|| AuthzError::NotFound(format!("edge type {}", id)))
    }

    fn live_object_type(&self, id: Uuid) -> Result<ObjectType> {
        self.object_types
            .get(&id)
            .map(|entry| entry.value().clone())
            .filter(ObjectType::is_alive)
            .ok_or_else(|| AuthzError::NotFound(format!("object type {}", id)))
    }
}

impl Default for InMemoryGraphStore {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl GraphStore for InMemoryGraphStore {
    async fn create_object_type(&self, mut object_type: ObjectType) -> Result<ObjectType> {
        let duplicate = self
            .object_types
            .iter()
            .any(|entry| entry.value().is_alive() && entry.value().type_name == object_type.type_name);
        if duplicate {
            return Err(AuthzError::InvalidRequest(format!(
                "object type name '{}' already in use",
                object_type.type_name
            )));
        }
        let now = self.tick();
        object_type.created = now;
        object_type.updated = now;
        object_type.deleted = None;
        self.object_types.insert(object_type.id, object_type.clone());
        Ok(object_type)
    }

    async fn create_object(&self, mut object: Object) -> Result<Object> {
        self.live_object_type(object.type_id)?;
        if let Some(alias) = &object.alias {
            let taken = self.objects.iter().any(|entry| {
                let other = entry.value();
                other.is_alive()
                    && other.id != object.id
                    && other.type_id == object.type_id
                    && other.organization_id == object.organization_id
                    && other.alias.as_ref() == Some(alias)
            });
            if taken {
                return Err(AuthzError::InvalidRequest(format!(
                    "alias '{}' already in use for type {}",
                    alias, object.type_id
                )));
            }
        }
        let now = self.tick();
        object.created = now;
        object.updated = now;
        object.deleted = None;
        self.objects.insert(object.id, object.clone());
        Ok(object)
    }

    async fn create_edge_type(&self, mut edge_type: EdgeType) -> Result<EdgeType> {
        self.live_object_type(edge_type.source_object_type_id)?;
        self.live_object_type(edge_type.target_object_type_id)?;
        let duplicate = self
            .edge_types
            .iter()
            .any(|entry| entry.value().is_alive() && entry.value().type_name == edge_type.type_name);
        if duplicate {
            return Err(AuthzError::InvalidRequest(format!(
                "edge type name '{}' already in use",
                edge_type.type_name
            )));
        }
        let now = self.tick();
        edge_type.created = now;
        edge_type.updated = now;
        edge_type.deleted = None;
        self.edge_types.insert(edge_type.id, edge_type.clone());
        Ok(edge_type)
    }

    async fn create_edge(&self, mut edge: Edge) -> Result<Edge> {
        let edge_type = self.live_edge_type(edge.edge_type_id)?;
        let source = self.live_object(edge.source_object_id)?;
        let target = self.live_object(edge.target_object_id)?;
        validate_edge_endpoints(&edge_type, &source, &target)?;

        let now = self.tick();
        edge.created = now;
        edge.updated = now;
        edge.deleted = None;

        let mut rows = self.edges.entry(edge.id).or_default();
        if rows.iter().any(Edge::is_alive) {
            return Err(AuthzError::InvalidRequest(format!("edge {} already exists", edge.id)));
        }
        rows.push(edge.clone());
        Ok(edge)
    }

    async fn get_object(&self, id: Uuid) -> Result<Object> {
        self.live_object(id)
    }

    async fn get_edge_type(&self, id: Uuid) -> Result<EdgeType> {
        self.live_edge_type(id)
    }

    async fn delete_edge(&self, id: Uuid) -> Result<()> {
        let now = self.tick();
        let mut rows = self
            .edges
            .get_mut(&id)
            .ok_or_else(|| AuthzError::NotFound(format!("edge {}", id)))?;
        let live = rows
            .iter_mut()
            .find(|edge| edge.is_alive())
            .ok_or_else(|| AuthzError::NotFound(format!("edge {}", id)))?;
        live.deleted = Some(now);
        Ok(())
    }

    async fn delete_edges_from_object(&self, object_id: Uuid) -> Result<()> {
        let now = self.tick();
        self.soft_delete_edges_where(now, |edge| {
            edge.source_object_id == object_id || edge.target_object_id == object_id
        });
        Ok(())
    }

    async fn delete_object(&self, id: Uuid) -> Result<()> {
        self.delete_edges_from_object(id).await?;
        let now = self.tick();
        let mut object = self
            .objects
            .get_mut(&id)
            .filter(|entry| entry.value().is_alive())
            .ok_or_else(|| AuthzError::NotFound(format!("object {}", id)))?;
        object.deleted = Some(now);
        Ok(())
    }

    async fn delete_edge_type(&self, id: Uuid) -> Result<()> {
        self.live_edge_type(id)?;
        let now = self.tick();
        self.soft_delete_edges_where(now, |edge| edge.edge_type_id == id);
        if let Some(mut edge_type) = self.edge_types.get_mut(&id) {
            edge_type.deleted = Some(now);
        }
        Ok(())
    }

    async fn delete_object_type(&self, id: Uuid) -> Result<()> {
        self.live_object_type(id)?;

        let dependent: Vec<Uuid> = self
            .edge_types
            .iter()
            .filter(|entry| {
                let edge_type = entry.value();
                edge_type.is_alive()
                    && (edge_type.source_object_type_id == id || edge_type.target_object_type_id == id)
            })
            .map(|entry| *entry.key())
            .collect();
        for edge_type_id in dependent {
            self.delete_edge_type(edge_type_id).await?;
        }

        let now = self.tick();
        for mut object in self.objects.iter_mut() {
            if object.type_id == id && object.is_alive() {
                object.deleted = Some(now);
            }
        }
        if let Some(mut object_type) = self.object_types.get_mut(&id) {
            object_type.deleted = Some(now);
        }
        Ok(())
    }

    async fn list_edges_page(&self, after: Option<Uuid>, limit: usize) -> Result<Page<Edge>> {
        self.edge_reads.fetch_add(1, Ordering::SeqCst);
        let mut edges: Vec<Edge> = self
            .live_edges()
            .into_iter()
            .filter(|edge| after.map_or(true, |cursor| edge.id > cursor))
            .collect();
        edges.sort_by_key(|edge| edge.id);
        Ok(page_from(edges, limit, |edge| edge.id))
    }

    async fn list_edge_types_page(
        &self,
        after: Option<Uuid>,
        limit: usize,
    ) -> Result<Page<EdgeType>> {
        self.edge_type_reads.fetch_add(1, Ordering::SeqCst);
        let mut edge_types: Vec<EdgeType> = self
            .edge_types
            .iter()
            .map(|entry| entry.value().clone())
            .filter(|edge_type| edge_type.is_alive() && after.map_or(true, |cursor| edge_type.id > cursor))
            .collect();
        edge_types.sort_by_key(|edge_type| edge_type.id);
        Ok(page_from(edge_types, limit, |edge_type| edge_type.id))
    }

    async fn list_edges_for_cache(
        &self,
        updated_since: DateTime<Utc>,
        deleted_since: Option<DateTime<Utc>>,
        limit: usize,
        _allow_follower_read: bool,
    ) -> Result<CacheEdgePage> {
        self.edge_reads.fetch_add(1, Ordering::SeqCst);

        let mut edges: Vec<Edge> = self
            .live_edges()
            .into_iter()
            .filter(|edge| edge.updated >= updated_since)
            .collect();
        edges.sort_by_key(|edge| edge.updated);
        edges.truncate(limit);
        let live_read = edges.len();

        if let (Some(max_time), Some(deleted_since)) = (edges.last().map(|edge| edge.updated), deleted_since) {
            let tombstones: Vec<Edge> = self
                .edge_rows()
                .into_iter()
                .filter(|edge| {
                    edge.updated <= max_time && edge.deleted.map_or(false, |d| d >= deleted_since)
                })
                .collect();
            edges.extend(tombstones);
        }

        Ok(CacheEdgePage { edges, live_read })
    }

    async fn list_edges_changed_since(
        &self,
        since: DateTime<Utc>,
        _allow_follower_read: bool,
    ) -> Result<Vec<Edge>> {
        self.edge_reads.fetch_add(1, Ordering::SeqCst);
        Ok(self
            .edge_rows()
            .into_iter()
            .filter(|edge| edge.updated >= since || edge.deleted.map_or(false, |d| d >= since))
            .collect())
    }
}

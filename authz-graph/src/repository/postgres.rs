//! PostgreSQL-backed graph store
//!
//! Every table carries a `tenant_id` column; one store instance is bound to
//! one tenant. Soft-deleted rows keep the zero timestamp replaced by their
//! delete time, so an edge id may appear once live and any number of times
//! as a tombstone. Cache-oriented reads may be routed to a read replica when
//! the caller allows follower reads.

use crate::{
    error::{AuthzError, Result},
    models::*,
    repository::{validate_edge_endpoints, GraphStore},
};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::{postgres::PgRow, types::Json, Executor, PgPool, Row};
use tracing::{debug, info};
use uuid::Uuid;

const SCHEMA: &str = include_str!("../../migrations/0001_authz_graph.sql");

const EDGE_COLUMNS: &str = "id, edge_type_id, source_object_id, target_object_id, created, updated, \
     NULLIF(deleted, '0001-01-01 00:00:00+00') AS deleted";

const EDGE_TYPE_COLUMNS: &str = "id, type_name, source_object_type_id, target_object_type_id, \
     organization_id, attributes, created, updated, NULLIF(deleted, '0001-01-01 00:00:00+00') AS deleted";

const OBJECT_COLUMNS: &str = "id, type_id, alias, organization_id, created, updated, \
     NULLIF(deleted, '0001-01-01 00:00:00+00') AS deleted";

const ZERO_TIME: &str = "'0001-01-01 00:00:00+00'";

/// PostgreSQL-backed graph store for a single tenant
#[derive(Clone)]
pub struct PostgresGraphStore {
    pool: PgPool,
    replica: Option<PgPool>,
    tenant_id: Uuid,
}

impl PostgresGraphStore {
    pub fn new(pool: PgPool, tenant_id: Uuid) -> Self {
        Self {
            pool,
            replica: None,
            tenant_id,
        }
    }

    /// Route reads that tolerate staleness to `replica`
    pub fn with_replica(mut self, replica: PgPool) -> Self {
        self.replica = Some(replica);
        self
    }

    /// Create with connection string
    pub async fn from_connection_string(connection_string: &str, tenant_id: Uuid) -> Result<Self> {
        let pool = PgPool::connect(connection_string)
            .await
            .map_err(|e| AuthzError::Storage(format!("Failed to connect: {}", e)))?;
        Ok(Self::new(pool, tenant_id))
    }

    pub fn tenant_id(&self) -> Uuid {
        self.tenant_id
    }

    /// Create the graph tables if they don't exist
    pub async fn ensure_schema(&self) -> Result<()> {
        self.pool.execute(SCHEMA).await?;
        info!("authz graph schema ready");
        Ok(())
    }

    fn reader(&self, allow_follower_read: bool) -> &PgPool {
        match (&self.replica, allow_follower_read) {
            (Some(replica), true) => replica,
            _ => &self.pool,
        }
    }

    async fn fetch_live_object(&self, id: Uuid) -> Result<Object> {
        let query = format!(
            "SELECT {OBJECT_COLUMNS} FROM authz_objects WHERE tenant_id = $1 AND id = $2 AND deleted = {ZERO_TIME}"
        );
        let row = sqlx::query(&query)
            .bind(self.tenant_id)
            .bind(id)
            .fetch_optional(&self.pool)
            .await?
            .ok_or_else(|| AuthzError::NotFound(format!("object {}", id)))?;
        object_from_row(&row)
    }

    async fn fetch_live_edge_type(&self, id: Uuid) -> Result<EdgeType> {
        let query = format!(
            "SELECT {EDGE_TYPE_COLUMNS} FROM authz_edge_types WHERE tenant_id = $1 AND id = $2 AND deleted = {ZERO_TIME}"
        );
        let row = sqlx::query(&query)
            .bind(self.tenant_id)
            .bind(id)
            .fetch_optional(&self.pool)
            .await?
            .ok_or_else(|| AuthzError::NotFound(format!("edge type {}", id)))?;
        edge_type_from_row(&row)
    }
}

fn object_type_from_row(row: &PgRow) -> Result<ObjectType> {
    Ok(ObjectType {
        id: row.try_get("id")?,
        type_name: row.try_get("type_name")?,
        created: row.try_get("created")?,
        updated: row.try_get("updated")?,
        deleted: row.try_get("deleted")?,
    })
}

fn object_from_row(row: &PgRow) -> Result<Object> {
    Ok(Object {
        id: row.try_get("id")?,
        type_id: row.try_get("type_id")?,
        alias: row.try_get("alias")?,
        organization_id: row.try_get("organization_id")?,
        created: row.try_get("created")?,
        updated: row.try_get("updated")?,
        deleted: row.try_get("deleted")?,
    })
}

fn edge_type_from_row(row: &PgRow) -> Result<EdgeType> {
    let Json(attributes): Json<Vec<Attribute>> = row.try_get("attributes")?;
    Ok(EdgeType {
        id: row.try_get("id")?,
        type_name: row.try_get("type_name")?,
        source_object_type_id: row.try_get("source_object_type_id")?,
        target_object_type_id: row.try_get("target_object_type_id")?,
        organization_id: row.try_get("organization_id")?,
        attributes,
        created: row.try_get("created")?,
        updated: row.try_get("updated")?,
        deleted: row.try_get("deleted")?,
    })
}

fn edge_from_row(row: &PgRow) -> Result<Edge> {
    Ok(Edge {
        id: row.try_get("id")?,
        edge_type_id: row.try_get("edge_type_id")?,
        source_object_id: row.try_get("source_object_id")?,
        target_object_id: row.try_get("target_object_id")?,
        created: row.try_get("created")?,
        updated: row.try_get("updated")?,
        deleted: row.try_get("deleted")?,
    })
}

fn edges_from_rows(rows: &[PgRow]) -> Result<Vec<Edge>> {
    rows.iter().map(edge_from_row).collect()
}

fn page_of<T>(mut items: Vec<T>, limit: usize, id: impl Fn(&T) -> Uuid) -> Page<T> {
    let has_more = items.len() > limit;
    items.truncate(limit);
    let next = if has_more { items.last().map(id) } else { None };
    Page { items, next }
}

fn sql_limit(limit: usize) -> i64 {
    i64::try_from(limit).unwrap_or(i64::MAX)
}

#[async_trait]
impl GraphStore for PostgresGraphStore {
    async fn create_object_type(&self, object_type: ObjectType) -> Result<ObjectType> {
        debug!("Creating object type {}", object_type.type_name);
        let row = sqlx::query(
            r#"
            INSERT INTO authz_object_types (tenant_id, id, type_name)
            VALUES ($1, $2, $3)
            RETURNING id, type_name, created, updated, NULLIF(deleted, '0001-01-01 00:00:00+00') AS deleted
            "#,
        )
        .bind(self.tenant_id)
        .bind(object_type.id)
        .bind(&object_type.type_name)
        .fetch_one(&self.pool)
        .await?;
        object_type_from_row(&row)
    }

    async fn create_object(&self, object: Object) -> Result<Object> {
        let type_exists: bool = sqlx::query_scalar(&format!(
            "SELECT EXISTS(SELECT 1 FROM authz_object_types WHERE tenant_id = $1 AND id = $2 AND deleted = {ZERO_TIME})"
        ))
        .bind(self.tenant_id)
        .bind(object.type_id)
        .fetch_one(&self.pool)
        .await?;
        if !type_exists {
            return Err(AuthzError::NotFound(format!("object type {}", object.type_id)));
        }

        let row = sqlx::query(&format!(
            r#"
            INSERT INTO authz_objects (tenant_id, id, type_id, alias, organization_id)
            VALUES ($1, $2, $3, $4, $5)
            RETURNING {OBJECT_COLUMNS}
            "#
        ))
        .bind(self.tenant_id)
        .bind(object.id)
        .bind(object.type_id)
        .bind(&object.alias)
        .bind(object.organization_id)
        .fetch_one(&self.pool)
        .await?;
        object_from_row(&row)
    }

    async fn create_edge_type(&self, edge_type: EdgeType) -> Result<EdgeType> {
        debug!("Creating edge type {}", edge_type.type_name);
        let row = sqlx::query(&format!(
            r#"
            INSERT INTO authz_edge_types (
                tenant_id, id, type_name, source_object_type_id, target_object_type_id,
                organization_id, attributes
            )
            SELECT $1, $2, $3, $4, $5, $6, $7
            WHERE (SELECT COUNT(*) FROM authz_object_types
                   WHERE tenant_id = $1 AND id IN ($4, $5) AND deleted = {ZERO_TIME})
                  = (CASE WHEN $4 = $5 THEN 1 ELSE 2 END)
            RETURNING {EDGE_TYPE_COLUMNS}
            "#
        ))
        .bind(self.tenant_id)
        .bind(edge_type.id)
        .bind(&edge_type.type_name)
        .bind(edge_type.source_object_type_id)
        .bind(edge_type.target_object_type_id)
        .bind(edge_type.organization_id)
        .bind(Json(&edge_type.attributes))
        .fetch_optional(&self.pool)
        .await?
        .ok_or_else(|| {
            AuthzError::NotFound(format!(
                "object types {} / {}",
                edge_type.source_object_type_id, edge_type.target_object_type_id
            ))
        })?;
        edge_type_from_row(&row)
    }

    async fn create_edge(&self, edge: Edge) -> Result<Edge> {
        debug!("Creating {}", edge);
        let edge_type = self.fetch_live_edge_type(edge.edge_type_id).await?;
        let source = self.fetch_live_object(edge.source_object_id).await?;
        let target = self.fetch_live_object(edge.target_object_id).await?;
        validate_edge_endpoints(&edge_type, &source, &target)?;

        let row = sqlx::query(&format!(
            r#"
            INSERT INTO authz_edges (tenant_id, id, edge_type_id, source_object_id, target_object_id)
            VALUES ($1, $2, $3, $4, $5)
            RETURNING {EDGE_COLUMNS}
            "#
        ))
        .bind(self.tenant_id)
        .bind(edge.id)
        .bind(edge.edge_type_id)
        .bind(edge.source_object_id)
        .bind(edge.target_object_id)
        .fetch_one(&self.pool)
        .await?;
        edge_from_row(&row)
    }

    async fn get_object(&self, id: Uuid) -> Result<Object> {
        self.fetch_live_object(id).await
    }

    async fn get_edge_type(&self, id: Uuid) -> Result<EdgeType> {
        self.fetch_live_edge_type(id).await
    }

    async fn delete_edge(&self, id: Uuid) -> Result<()> {
        let result = sqlx::query(&format!(
            "UPDATE authz_edges SET deleted = CLOCK_TIMESTAMP() WHERE tenant_id = $1 AND id = $2 AND deleted = {ZERO_TIME}"
        ))
        .bind(self.tenant_id)
        .bind(id)
        .execute(&self.pool)
        .await?;
        if result.rows_affected() == 0 {
            return Err(AuthzError::NotFound(format!("edge {}", id)));
        }
        Ok(())
    }

    async fn delete_edges_from_object(&self, object_id: Uuid) -> Result<()> {
        sqlx::query(&format!(
            "UPDATE authz_edges SET deleted = CLOCK_TIMESTAMP() \
             WHERE tenant_id = $1 AND (source_object_id = $2 OR target_object_id = $2) AND deleted = {ZERO_TIME}"
        ))
        .bind(self.tenant_id)
        .bind(object_id)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn delete_object(&self, id: Uuid) -> Result<()> {
        let mut tx = self.pool.begin().await?;
        sqlx::query(&format!(
            "UPDATE authz_edges SET deleted = CLOCK_TIMESTAMP() \
             WHERE tenant_id = $1 AND (source_object_id = $2 OR target_object_id = $2) AND deleted = {ZERO_TIME}"
        ))
        .bind(self.tenant_id)
        .bind(id)
        .execute(&mut *tx)
        .await?;
        let result = sqlx::query(&format!(
            "UPDATE authz_objects SET deleted = CLOCK_TIMESTAMP() WHERE tenant_id = $1 AND id = $2 AND deleted = {ZERO_TIME}"
        ))
        .bind(self.tenant_id)
        .bind(id)
        .execute(&mut *tx)
        .await?;
        if result.rows_affected() == 0 {
            return Err(AuthzError::NotFound(format!("object {}", id)));
        }
        tx.commit().await?;
        Ok(())
    }

    async fn delete_edge_type(&self, id: Uuid) -> Result<()> {
        let mut tx = self.pool.begin().await?;
        sqlx::query(&format!(
            "UPDATE authz_edges SET deleted = CLOCK_TIMESTAMP() WHERE tenant_id = $1 AND edge_type_id = $2 AND deleted = {ZERO_TIME}"
        ))
        .bind(self.tenant_id)
        .bind(id)
        .execute(&mut *tx)
        .await?;
        let result = sqlx::query(&format!(
            "UPDATE authz_edge_types SET deleted = CLOCK_TIMESTAMP() WHERE tenant_id = $1 AND id = $2 AND deleted = {ZERO_TIME}"
        ))
        .bind(self.tenant_id)
        .bind(id)
        .execute(&mut *tx)
        .await?;
        if result.rows_affected() == 0 {
            return Err(AuthzError::NotFound(format!("edge type {}", id)));
        }
        tx.commit().await?;
        Ok(())
    }

    async fn delete_object_type(&self, id: Uuid) -> Result<()> {
        let mut tx = self.pool.begin().await?;
        sqlx::query(&format!(
            r#"
            UPDATE authz_edges SET deleted = CLOCK_TIMESTAMP()
            WHERE tenant_id = $1 AND deleted = {ZERO_TIME} AND edge_type_id IN (
                SELECT id FROM authz_edge_types
                WHERE tenant_id = $1 AND deleted = {ZERO_TIME}
                  AND (source_object_type_id = $2 OR target_object_type_id = $2)
            )
            "#
        ))
        .bind(self.tenant_id)
        .bind(id)
        .execute(&mut *tx)
        .await?;
        sqlx::query(&format!(
            "UPDATE authz_edge_types SET deleted = CLOCK_TIMESTAMP() \
             WHERE tenant_id = $1 AND deleted = {ZERO_TIME} AND (source_object_type_id = $2 OR target_object_type_id = $2)"
        ))
        .bind(self.tenant_id)
        .bind(id)
        .execute(&mut *tx)
        .await?;
        sqlx::query(&format!(
            "UPDATE authz_objects SET deleted = CLOCK_TIMESTAMP() WHERE tenant_id = $1 AND type_id = $2 AND deleted = {ZERO_TIME}"
        ))
        .bind(self.tenant_id)
        .bind(id)
        .execute(&mut *tx)
        .await?;
        let result = sqlx::query(&format!(
            "UPDATE authz_object_types SET deleted = CLOCK_TIMESTAMP() WHERE tenant_id = $1 AND id = $2 AND deleted = {ZERO_TIME}"
        ))
        .bind(self.tenant_id)
        .bind(id)
        .execute(&mut *tx)
        .await?;
        if result.rows_affected() == 0 {
            return Err(AuthzError::NotFound(format!("object type {}", id)));
        }
        tx.commit().await?;
        Ok(())
    }

    async fn list_edges_page(&self, after: Option<Uuid>, limit: usize) -> Result<Page<Edge>> {
        let rows = sqlx::query(&format!(
            "SELECT {EDGE_COLUMNS} FROM authz_edges \
             WHERE tenant_id = $1 AND deleted = {ZERO_TIME} AND ($2::uuid IS NULL OR id > $2) \
             ORDER BY id LIMIT $3"
        ))
        .bind(self.tenant_id)
        .bind(after)
        .bind(sql_limit(limit.saturating_add(1)))
        .fetch_all(&self.pool)
        .await?;
        Ok(page_of(edges_from_rows(&rows)?, limit, |edge| edge.id))
    }

    async fn list_edge_types_page(
        &self,
        after: Option<Uuid>,
        limit: usize,
    ) -> Result<Page<EdgeType>> {
        let rows = sqlx::query(&format!(
            "SELECT {EDGE_TYPE_COLUMNS} FROM authz_edge_types \
             WHERE tenant_id = $1 AND deleted = {ZERO_TIME} AND ($2::uuid IS NULL OR id > $2) \
             ORDER BY id LIMIT $3"
        ))
        .bind(self.tenant_id)
        .bind(after)
        .bind(sql_limit(limit.saturating_add(1)))
        .fetch_all(&self.pool)
        .await?;
        let edge_types = rows
            .iter()
            .map(edge_type_from_row)
            .collect::<Result<Vec<_>>>()?;
        Ok(page_of(edge_types, limit, |edge_type| edge_type.id))
    }

    async fn list_edges_for_cache(
        &self,
        updated_since: DateTime<Utc>,
        deleted_since: Option<DateTime<Utc>>,
        limit: usize,
        allow_follower_read: bool,
    ) -> Result<CacheEdgePage> {
        let reader = self.reader(allow_follower_read);
        let rows = sqlx::query(&format!(
            "SELECT {EDGE_COLUMNS} FROM authz_edges \
             WHERE tenant_id = $1 AND updated >= $2 AND deleted = {ZERO_TIME} \
             ORDER BY updated LIMIT $3"
        ))
        .bind(self.tenant_id)
        .bind(updated_since)
        .bind(sql_limit(limit))
        .fetch_all(reader)
        .await?;
        let mut edges = edges_from_rows(&rows)?;
        let live_read = edges.len();

        if let (Some(max_time), Some(deleted_since)) = (edges.last().map(|edge| edge.updated), deleted_since) {
            let rows = sqlx::query(&format!(
                "SELECT {EDGE_COLUMNS} FROM authz_edges \
                 WHERE tenant_id = $1 AND updated <= $2 AND deleted >= $3"
            ))
            .bind(self.tenant_id)
            .bind(max_time)
            .bind(deleted_since)
            .fetch_all(reader)
            .await?;
            edges.extend(edges_from_rows(&rows)?);
        }

        debug!(
            "cache page: {} live edges, {} tombstones",
            live_read,
            edges.len() - live_read
        );
        Ok(CacheEdgePage { edges, live_read })
    }

    async fn list_edges_changed_since(
        &self,
        since: DateTime<Utc>,
        allow_follower_read: bool,
    ) -> Result<Vec<Edge>> {
        let rows = sqlx::query(&format!(
            "SELECT {EDGE_COLUMNS} FROM authz_edges \
             WHERE tenant_id = $1 AND (updated >= $2 OR deleted >= $2)"
        ))
        .bind(self.tenant_id)
        .bind(since)
        .fetch_all(self.reader(allow_follower_read))
        .await?;
        edges_from_rows(&rows)
    }
}

use anyhow::{Context, Result};
use authz_graph::{
    AuthorizationEngine, AuthzConfig, EdgeCacheDirectory, GraphStore, InMemoryGraphStore,
    InMemorySharedCache, PostgresGraphStore, RedisSharedCache, RemoteEvaluator, SharedCache,
};
use dashmap::DashMap;
use sqlx::postgres::PgPoolOptions;
use sqlx::PgPool;
use std::sync::Arc;
use std::time::Duration;
use tracing::info;
use uuid::Uuid;

/// Hands out the graph store for a tenant
pub trait StoreProvider: Send + Sync {
    fn store_for(&self, tenant_id: Uuid) -> Arc<dyn GraphStore>;
}

/// Tenant-scoped views over one shared Postgres pool
pub struct PostgresStores {
    pool: PgPool,
    replica: Option<PgPool>,
}

impl PostgresStores {
    pub fn new(pool: PgPool, replica: Option<PgPool>) -> Self {
        Self { pool, replica }
    }
}

impl StoreProvider for PostgresStores {
    fn store_for(&self, tenant_id: Uuid) -> Arc<dyn GraphStore> {
        let store = PostgresGraphStore::new(self.pool.clone(), tenant_id);
        match &self.replica {
            Some(replica) => Arc::new(store.with_replica(replica.clone())),
            None => Arc::new(store),
        }
    }
}

/// One in-memory store per tenant, created on first use
#[derive(Default)]
pub struct InMemoryStores {
    stores: DashMap<Uuid, Arc<InMemoryGraphStore>>,
}

impl InMemoryStores {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn store(&self, tenant_id: Uuid) -> Arc<InMemoryGraphStore> {
        self.stores
            .entry(tenant_id)
            .or_insert_with(|| Arc::new(InMemoryGraphStore::new()))
            .clone()
    }
}

impl StoreProvider for InMemoryStores {
    fn store_for(&self, tenant_id: Uuid) -> Arc<dyn GraphStore> {
        self.store(tenant_id)
    }
}

/// Shared server state
#[derive(Clone)]
pub struct AppState {
    /// Engine configuration
    pub config: Arc<AuthzConfig>,
    /// Per-tenant graph stores
    pub stores: Arc<dyn StoreProvider>,
    /// Distributed cache shared with peer processes
    pub shared_cache: Arc<dyn SharedCache>,
    /// This process's edge snapshots
    pub directory: Arc<EdgeCacheDirectory>,
    /// Peer evaluator for tenants configured as remote
    pub remote: Option<RemoteEvaluator>,
}

impl AppState {
    pub fn new(
        config: AuthzConfig,
        stores: Arc<dyn StoreProvider>,
        shared_cache: Arc<dyn SharedCache>,
    ) -> Self {
        let remote = config
            .evaluation
            .remote_url
            .as_deref()
            .map(RemoteEvaluator::new);
        Self {
            directory: EdgeCacheDirectory::new(config.edge_cache.clone()),
            config: Arc::new(config),
            stores,
            shared_cache,
            remote,
        }
    }

    /// State backed by in-memory stores and cache, for tests and local runs
    pub fn in_memory(config: AuthzConfig) -> (Self, Arc<InMemoryStores>) {
        let stores = Arc::new(InMemoryStores::new());
        let state = Self::new(config, stores.clone(), Arc::new(InMemorySharedCache::new()));
        (state, stores)
    }

    /// Connect to Postgres (and Redis when configured) as described by `config`
    pub async fn connect(config: AuthzConfig) -> Result<Self> {
        let database = &config.database;
        let pool = PgPoolOptions::new()
            .max_connections(database.max_connections)
            .connect(&database.url)
            .await
            .context("Failed to connect to graph database")?;
        PostgresGraphStore::new(pool.clone(), Uuid::nil())
            .ensure_schema()
            .await
            .context("Failed to prepare graph schema")?;

        let replica = match &database.replica_url {
            Some(url) => Some(
                PgPoolOptions::new()
                    .max_connections(database.max_connections)
                    .connect(url)
                    .await
                    .context("Failed to connect to read replica")?,
            ),
            None => None,
        };

        let shared = &config.shared_cache;
        let shared_cache: Arc<dyn SharedCache> = match &shared.redis_url {
            Some(url) => {
                info!("Using Redis shared cache");
                Arc::new(
                    RedisSharedCache::connect(
                        url,
                        Duration::from_millis(shared.tombstone_ttl_ms),
                        Duration::from_secs(shared.path_ttl_secs),
                    )
                    .await
                    .context("Failed to connect to Redis")?,
                )
            }
            None => {
                info!("No Redis configured, using process-local shared cache");
                Arc::new(InMemorySharedCache::with_tombstone_ttl(Duration::from_millis(
                    shared.tombstone_ttl_ms,
                )))
            }
        };

        Ok(Self::new(
            config,
            Arc::new(PostgresStores::new(pool, replica)),
            shared_cache,
        ))
    }

    /// Engine for one request's tenant
    pub fn engine(&self, tenant_id: Uuid) -> AuthorizationEngine {
        let engine = AuthorizationEngine::new(
            tenant_id,
            self.stores.store_for(tenant_id),
            self.directory.clone(),
            self.config.clone(),
        )
        .with_shared_cache(self.shared_cache.clone());
        match &self.remote {
            Some(remote) if self.config.evaluation.is_remote(tenant_id) => {
                engine.with_remote_evaluator(remote.clone())
            }
            _ => engine,
        }
    }
}

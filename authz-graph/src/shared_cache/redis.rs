//! Redis-backed shared cache
//!
//! Keys per tenant:
//! - `authz:{tenant}:edges:modified` holds the tombstone while a write is in
//!   flight (absent means no conflict).
//! - `authz:{tenant}:paths:gen` is the path-cache generation, bumped on every
//!   release. Path keys embed it, so older entries are never read again and
//!   age out through their TTL.
//!
//! Invalidations travel over the [`INVALIDATION_CHANNEL`] pub/sub channel; one
//! subscriber task per cache instance fans them out to local handlers and
//! resubscribes if the connection drops.

use super::{
    edges_modified_key, ConflictToken, HandlerRegistry, InvalidationEvent, InvalidationHandler,
    PathCacheKey, PathSentinel, SharedCache, INVALIDATION_CHANNEL,
};
use crate::{
    error::{AuthzError, Result},
    models::AttributePathNode,
};
use async_trait::async_trait;
use futures::StreamExt;
use redis::{
    aio::{ConnectionManager, PubSub},
    AsyncCommands, Script,
};
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

/// Upper bound on how long a crashed writer can keep a collection locked
const COLLECTION_LOCK_TTL: Duration = Duration::from_secs(30);

const RESUBSCRIBE_BACKOFF_MIN: Duration = Duration::from_millis(100);
const RESUBSCRIBE_BACKOFF_MAX: Duration = Duration::from_secs(10);

const RELEASE_SCRIPT: &str = r#"
if redis.call('GET', KEYS[1]) == ARGV[1] then
    if tonumber(ARGV[2]) > 0 then
        redis.call('PEXPIRE', KEYS[1], ARGV[2])
    else
        redis.call('DEL', KEYS[1])
    end
end
return redis.call('INCR', KEYS[2])
"#;

const SAVE_PATH_SCRIPT: &str = r#"
if (redis.call('GET', KEYS[1]) or '0') == ARGV[1] and redis.call('EXISTS', KEYS[2]) == 0 then
    redis.call('SET', KEYS[3], ARGV[2], 'PX', ARGV[3])
    return 1
end
return 0
"#;

fn generation_key(tenant_id: Uuid) -> String {
    format!("authz:{}:paths:gen", tenant_id)
}

fn path_key(tenant_id: Uuid, generation: u64, key: &PathCacheKey) -> String {
    format!("authz:{}:paths:{}:{}", tenant_id, generation, key)
}

fn millis(duration: Duration) -> u64 {
    u64::try_from(duration.as_millis()).unwrap_or(u64::MAX)
}

async fn subscribe(client: &redis::Client) -> redis::RedisResult<PubSub> {
    let mut pubsub = client.get_async_connection().await?.into_pubsub();
    pubsub.subscribe(INVALIDATION_CHANNEL).await?;
    Ok(pubsub)
}

/// Fan invalidations out to local handlers for the life of the cache.
///
/// A dropped subscription is re-established with backoff. Messages published
/// while it was down are lost, so every handler is flushed once it is back.
async fn run_subscriber(client: redis::Client, mut pubsub: PubSub, registry: Arc<HandlerRegistry>) {
    loop {
        {
            let mut messages = pubsub.on_message();
            while let Some(msg) = messages.next().await {
                let payload: String = match msg.get_payload() {
                    Ok(payload) => payload,
                    Err(e) => {
                        warn!("Dropping unreadable invalidation message: {}", e);
                        continue;
                    }
                };
                match serde_json::from_str::<InvalidationEvent>(&payload) {
                    Ok(event) => registry.dispatch(&event),
                    Err(e) => warn!("Dropping malformed invalidation '{}': {}", payload, e),
                }
            }
        }
        warn!("Invalidation subscription to {} dropped, resubscribing", INVALIDATION_CHANNEL);

        let mut backoff = RESUBSCRIBE_BACKOFF_MIN;
        pubsub = loop {
            tokio::time::sleep(backoff).await;
            match subscribe(&client).await {
                Ok(pubsub) => break pubsub,
                Err(e) => {
                    error!("Failed to resubscribe to {}: {}", INVALIDATION_CHANNEL, e);
                    backoff = (backoff * 2).min(RESUBSCRIBE_BACKOFF_MAX);
                }
            }
        };
        info!("Resubscribed to {}, flushing edge snapshots", INVALIDATION_CHANNEL);
        registry.flush_all();
    }
}

/// Shared cache on Redis, usable by every process serving the same tenants
pub struct RedisSharedCache {
    manager: ConnectionManager,
    handlers: Arc<HandlerRegistry>,
    subscriber: JoinHandle<()>,
    tombstone_ttl: Duration,
    path_ttl: Duration,
}

impl RedisSharedCache {
    /// Connect to `redis_url` and start the invalidation subscriber
    pub async fn connect(redis_url: &str, tombstone_ttl: Duration, path_ttl: Duration) -> Result<Self> {
        let client = redis::Client::open(redis_url)
            .map_err(|e| AuthzError::Cache(format!("Failed to create Redis client: {}", e)))?;
        let manager = ConnectionManager::new(client.clone())
            .await
            .map_err(|e| AuthzError::Cache(format!("Failed to connect to Redis: {}", e)))?;

        let pubsub = subscribe(&client).await?;

        let handlers = Arc::new(HandlerRegistry::default());
        let subscriber = tokio::spawn(run_subscriber(client, pubsub, Arc::clone(&handlers)));

        info!("Redis shared cache connected, subscribed to {}", INVALIDATION_CHANNEL);
        Ok(Self {
            manager,
            handlers,
            subscriber,
            tombstone_ttl,
            path_ttl,
        })
    }
}

impl Drop for RedisSharedCache {
    fn drop(&mut self) {
        self.subscriber.abort();
    }
}

#[async_trait]
impl SharedCache for RedisSharedCache {
    async fn edges_modified_token(&self, tenant_id: Uuid) -> Result<ConflictToken> {
        let mut conn = self.manager.clone();
        let marker: Option<String> = conn.get(edges_modified_key(tenant_id)).await?;
        Ok(marker.map_or(ConflictToken::NoConflict, ConflictToken::Tombstone))
    }

    async fn take_collection_lock(&self, tenant_id: Uuid) -> Result<ConflictToken> {
        let value = Uuid::new_v4().to_string();
        let mut conn = self.manager.clone();
        redis::cmd("SET")
            .arg(edges_modified_key(tenant_id))
            .arg(&value)
            .arg("PX")
            .arg(millis(COLLECTION_LOCK_TTL))
            .query_async::<_, ()>(&mut conn)
            .await?;
        Ok(ConflictToken::Tombstone(value))
    }

    async fn release_collection_lock(
        &self,
        tenant_id: Uuid,
        token: &ConflictToken,
        flush: bool,
    ) -> Result<()> {
        let ConflictToken::Tombstone(value) = token else {
            return Err(AuthzError::InvalidRequest(
                "cannot release a collection lock with a no-conflict token".to_string(),
            ));
        };
        let mut conn = self.manager.clone();
        let generation: u64 = Script::new(RELEASE_SCRIPT)
            .key(edges_modified_key(tenant_id))
            .key(generation_key(tenant_id))
            .arg(value)
            .arg(millis(self.tombstone_ttl))
            .invoke_async(&mut conn)
            .await?;

        let event = InvalidationEvent {
            tenant_id,
            key: edges_modified_key(tenant_id),
            flush,
        };
        let payload = serde_json::to_string(&event)
            .map_err(|e| AuthzError::Cache(format!("Failed to encode invalidation: {}", e)))?;
        let receivers: i64 = conn.publish(INVALIDATION_CHANNEL, payload).await?;
        debug!(
            tenant_id = %tenant_id,
            generation,
            receivers,
            "released edges collection lock"
        );
        Ok(())
    }

    async fn get_attribute_path(
        &self,
        tenant_id: Uuid,
        key: &PathCacheKey,
    ) -> Result<(Option<Vec<AttributePathNode>>, PathSentinel)> {
        let mut conn = self.manager.clone();
        let (marker, generation): (Option<String>, Option<u64>) = redis::pipe()
            .get(edges_modified_key(tenant_id))
            .get(generation_key(tenant_id))
            .query_async(&mut conn)
            .await?;
        if marker.is_some() {
            return Ok((None, PathSentinel::Unavailable));
        }
        let generation = generation.unwrap_or(0);

        let cached: Option<String> = conn.get(path_key(tenant_id, generation, key)).await?;
        let path = match cached {
            Some(json) => match serde_json::from_str::<Vec<AttributePathNode>>(&json) {
                Ok(path) => Some(path),
                Err(e) => {
                    warn!(tenant_id = %tenant_id, "Ignoring undecodable cached path {}: {}", key, e);
                    None
                }
            },
            None => None,
        };
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
        let payload = serde_json::to_string(path)
            .map_err(|e| AuthzError::Cache(format!("Failed to encode path: {}", e)))?;
        let mut conn = self.manager.clone();
        let stored: i64 = Script::new(SAVE_PATH_SCRIPT)
            .key(generation_key(tenant_id))
            .key(edges_modified_key(tenant_id))
            .key(path_key(tenant_id, generation, key))
            .arg(generation)
            .arg(payload)
            .arg(millis(self.path_ttl))
            .invoke_async(&mut conn)
            .await?;
        if stored == 0 {
            debug!(tenant_id = %tenant_id, "skipping save of path {}: invalidated since lookup", key);
        }
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

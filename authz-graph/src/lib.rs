//! Relationship-based authorization graph for RustCare Engine
//!
//! This crate answers "does object A have attribute X on object B?" over a
//! per-tenant graph of typed objects and typed edges, providing:
//! - Breadth-first attribute path search with inherit, direct and propagate transitions
//! - Listing every object of a type reachable with an attribute
//! - Process-local edge snapshots kept consistent through a shared cache
//! - Cached positive answers invalidated on every edge mutation
//!
//! # Core Concepts
//!
//! - **Object**: Any node in the graph (user, group, document, ...), typed by an object type
//! - **Edge type**: A typed relationship between two object types carrying named attributes
//! - **Attribute**: A name plus `direct`, `inherit` and `propagate` flags
//! - **Conflict token**: The tenant's edges-modified marker; a tombstone while a write is in flight
//!
//! # Example
//!
//! ```rust,no_run
//! use authz_graph::{
//!     Attribute, AuthorizationEngine, AuthzConfig, Edge, EdgeCacheDirectory, EdgeType,
//!     InMemoryGraphStore, InMemorySharedCache, Object, ObjectType,
//! };
//! use std::sync::Arc;
//! use uuid::Uuid;
//!
//! #[tokio::main]
//! async fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let config = Arc::new(AuthzConfig::default());
//!     let directory = EdgeCacheDirectory::new(config.edge_cache.clone());
//!     let engine = AuthorizationEngine::new(
//!         Uuid::new_v4(),
//!         Arc::new(InMemoryGraphStore::new()),
//!         directory,
//!         config,
//!     )
//!     .with_shared_cache(Arc::new(InMemorySharedCache::new()));
//!
//!     let user = engine.create_object_type(ObjectType::new("user")).await?;
//!     let doc = engine.create_object_type(ObjectType::new("document")).await?;
//!     let editor = engine
//!         .create_edge_type(EdgeType::new("editor", user.id, doc.id, vec![Attribute::direct("edit")]))
//!         .await?;
//!
//!     let alice = engine.create_object(Object::new(user.id)).await?;
//!     let report = engine.create_object(Object::new(doc.id)).await?;
//!     engine.create_edge(Edge::new(editor.id, alice.id, report.id)).await?;
//!
//!     let response = engine.check_attribute(alice.id, report.id, "edit").await?;
//!     assert!(response.has_attribute);
//!     Ok(())
//! }
//! ```

pub mod check;
pub mod config;
pub mod edge_cache;
pub mod engine;
pub mod error;
pub mod invalidation;
pub mod models;
pub mod reconcile;
pub mod remote;
pub mod repository;
pub mod shared_cache;

pub use check::{SearchGraph, DEFAULT_MAX_CANDIDATES};
pub use config::AuthzConfig;
pub use edge_cache::{EdgeCacheDirectory, EdgeCacheRecord};
pub use engine::AuthorizationEngine;
pub use error::*;
pub use models::*;
pub use reconcile::reconcile_tenant;
pub use remote::{RemoteEvaluator, TENANT_HEADER};
pub use repository::{GraphStore, InMemoryGraphStore, PostgresGraphStore};
pub use shared_cache::{
    ConflictToken, InMemorySharedCache, PathCacheKey, PathSentinel, RedisSharedCache, SharedCache,
};

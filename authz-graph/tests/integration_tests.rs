//! Engine-level tests over a small hospital graph
//!
//! Graph layout:
//! - user -[member: inherit view]-> ward
//! - ward -[assigned: direct view]-> patient_record
//! - user -[owner: direct view, direct edit]-> patient_record
//! - patient_record -[attached: propagate view]-> lab_result

use authz_graph::*;
use std::sync::Arc;
use uuid::Uuid;

struct Hospital {
    engine: AuthorizationEngine,
    store: Arc<InMemoryGraphStore>,
    cache: Arc<InMemorySharedCache>,
    directory: Arc<EdgeCacheDirectory>,
    user_type: ObjectType,
    ward_type: ObjectType,
    record_type: ObjectType,
    lab_type: ObjectType,
    member: EdgeType,
    assigned: EdgeType,
    owner: EdgeType,
    attached: EdgeType,
}

impl Hospital {
    async fn new() -> Self {
        Self::with_config(AuthzConfig::default()).await
    }

    async fn with_config(config: AuthzConfig) -> Self {
        let store = Arc::new(InMemoryGraphStore::new());
        let cache = Arc::new(InMemorySharedCache::new());
        let directory = EdgeCacheDirectory::new(config.edge_cache.clone());
        let engine = AuthorizationEngine::new(
            Uuid::new_v4(),
            store.clone(),
            directory.clone(),
            Arc::new(config),
        )
        .with_shared_cache(cache.clone());

        let user_type = engine.create_object_type(ObjectType::new("user")).await.unwrap();
        let ward_type = engine.create_object_type(ObjectType::new("ward")).await.unwrap();
        let record_type = engine
            .create_object_type(ObjectType::new("patient_record"))
            .await
            .unwrap();
        let lab_type = engine.create_object_type(ObjectType::new("lab_result")).await.unwrap();

        let member = engine
            .create_edge_type(EdgeType::new(
                "member",
                user_type.id,
                ward_type.id,
                vec![Attribute::inherit("view")],
            ))
            .await
            .unwrap();
        let assigned = engine
            .create_edge_type(EdgeType::new(
                "assigned",
                ward_type.id,
                record_type.id,
                vec![Attribute::direct("view")],
            ))
            .await
            .unwrap();
        let owner = engine
            .create_edge_type(EdgeType::new(
                "owner",
                user_type.id,
                record_type.id,
                vec![Attribute::direct("view"), Attribute::direct("edit")],
            ))
            .await
            .unwrap();
        let attached = engine
            .create_edge_type(EdgeType::new(
                "attached",
                record_type.id,
                lab_type.id,
                vec![Attribute::propagate("view")],
            ))
            .await
            .unwrap();

        Self {
            engine,
            store,
            cache,
            directory,
            user_type,
            ward_type,
            record_type,
            lab_type,
            member,
            assigned,
            owner,
            attached,
        }
    }

    async fn object(&self, object_type: &ObjectType) -> Object {
        self.engine
            .create_object(Object::new(object_type.id))
            .await
            .unwrap()
    }

    async fn link(&self, edge_type: &EdgeType, source: &Object, target: &Object) -> Edge {
        self.engine
            .create_edge(Edge::new(edge_type.id, source.id, target.id))
            .await
            .unwrap()
    }
}

// ============================================================================
// Path search
// ============================================================================

#[tokio::test]
async fn test_ward_member_views_assigned_record() {
    let h = Hospital::new().await;
    let alice = h.object(&h.user_type).await;
    let cardiology = h.object(&h.ward_type).await;
    let record = h.object(&h.record_type).await;

    let membership = h.link(&h.member, &alice, &cardiology).await;
    let assignment = h.link(&h.assigned, &cardiology, &record).await;

    let response = h.engine.check_attribute(alice.id, record.id, "view").await.unwrap();
    assert!(response.has_attribute);
    assert_eq!(
        response.path,
        vec![
            AttributePathNode::start(alice.id),
            AttributePathNode {
                object_id: cardiology.id,
                edge_id: membership.id,
            },
            AttributePathNode {
                object_id: record.id,
                edge_id: assignment.id,
            },
        ]
    );

    // member carries no direct grant of its own
    let on_ward = h.engine.check_attribute(alice.id, cardiology.id, "view").await.unwrap();
    assert!(!on_ward.has_attribute);

    // attribute names match exactly
    let edit = h.engine.check_attribute(alice.id, record.id, "edit").await.unwrap();
    assert!(!edit.has_attribute);
    assert!(edit.path.is_empty());
}

#[tokio::test]
async fn test_view_propagates_to_attached_lab_results() {
    let h = Hospital::new().await;
    let alice = h.object(&h.user_type).await;
    let ward = h.object(&h.ward_type).await;
    let record = h.object(&h.record_type).await;
    let lab = h.object(&h.lab_type).await;

    h.link(&h.member, &alice, &ward).await;
    h.link(&h.assigned, &ward, &record).await;
    let attachment = h.link(&h.attached, &record, &lab).await;

    let response = h.engine.check_attribute(alice.id, lab.id, "view").await.unwrap();
    assert!(response.has_attribute);
    assert_eq!(response.path.len(), 4);
    assert_eq!(response.path[3].edge_id, attachment.id);

    // propagation never starts without a direct grant
    let ward_view = h.engine.check_attribute(ward.id, lab.id, "view").await.unwrap();
    assert!(ward_view.has_attribute);
    let record_view = h.engine.check_attribute(record.id, lab.id, "view").await.unwrap();
    assert!(!record_view.has_attribute);
}

#[tokio::test]
async fn test_list_attributes_held_on_target() {
    let h = Hospital::new().await;
    let alice = h.object(&h.user_type).await;
    let bob = h.object(&h.user_type).await;
    let ward = h.object(&h.ward_type).await;
    let owned = h.object(&h.record_type).await;
    let assigned = h.object(&h.record_type).await;
    let lab = h.object(&h.lab_type).await;

    h.link(&h.owner, &alice, &owned).await;
    h.link(&h.member, &alice, &ward).await;
    h.link(&h.assigned, &ward, &assigned).await;
    h.link(&h.attached, &owned, &lab).await;

    let on_owned = h.engine.list_attributes(alice.id, owned.id).await.unwrap();
    assert_eq!(on_owned, vec!["edit".to_string(), "view".to_string()]);
    let on_assigned = h.engine.list_attributes(alice.id, assigned.id).await.unwrap();
    assert_eq!(on_assigned, vec!["view".to_string()]);
    let on_lab = h.engine.list_attributes(alice.id, lab.id).await.unwrap();
    assert_eq!(on_lab, vec!["view".to_string()]);

    // bob has no outbound edges at all
    assert!(h.engine.list_attributes(bob.id, owned.id).await.unwrap().is_empty());
    // candidate names still need a real path
    assert!(h.engine.list_attributes(ward.id, owned.id).await.unwrap().is_empty());
}

#[tokio::test]
async fn test_edges_are_followed_outbound_only() {
    let h = Hospital::new().await;
    let alice = h.object(&h.user_type).await;
    let record = h.object(&h.record_type).await;
    h.link(&h.owner, &alice, &record).await;

    let reverse = h.engine.check_attribute(record.id, alice.id, "view").await.unwrap();
    assert!(!reverse.has_attribute);
}

#[tokio::test]
async fn test_list_records_reachable_with_view() {
    let h = Hospital::new().await;
    let alice = h.object(&h.user_type).await;
    let ward = h.object(&h.ward_type).await;
    let assigned_one = h.object(&h.record_type).await;
    let assigned_two = h.object(&h.record_type).await;
    let owned = h.object(&h.record_type).await;
    let unrelated = h.object(&h.record_type).await;

    h.link(&h.member, &alice, &ward).await;
    h.link(&h.assigned, &ward, &assigned_one).await;
    h.link(&h.assigned, &ward, &assigned_two).await;
    h.link(&h.owner, &alice, &owned).await;
    // a second route to the same record is reported once
    h.link(&h.owner, &alice, &assigned_one).await;

    let mut reachable = h
        .engine
        .list_objects_reachable_with_attribute(alice.id, h.record_type.id, "view")
        .await
        .unwrap();
    reachable.sort();
    let mut expected = vec![assigned_one.id, assigned_two.id, owned.id];
    expected.sort();
    assert_eq!(reachable, expected);
    assert!(!reachable.contains(&unrelated.id));

    let labs = h
        .engine
        .list_objects_reachable_with_attribute(alice.id, h.lab_type.id, "view")
        .await
        .unwrap();
    assert!(labs.is_empty());
}

#[tokio::test]
async fn test_search_bound_is_enforced() {
    let mut config = AuthzConfig::default();
    config.search.max_candidates = 2;
    let h = Hospital::with_config(config).await;
    let alice = h.object(&h.user_type).await;
    let record = h.object(&h.record_type).await;
    for _ in 0..5 {
        let ward = h.object(&h.ward_type).await;
        h.link(&h.member, &alice, &ward).await;
    }

    let err = h
        .engine
        .check_attribute(alice.id, record.id, "view")
        .await
        .unwrap_err();
    assert!(matches!(err, AuthzError::SearchBoundExceeded { limit: 2, .. }));
    assert!(!err.is_retryable());
}

// ============================================================================
// Caching
// ============================================================================

#[tokio::test]
async fn test_store_reads_across_cache_hits_and_invalidation() {
    let h = Hospital::new().await;
    let alice = h.object(&h.user_type).await;
    let record = h.object(&h.record_type).await;
    let ownership = h.link(&h.owner, &alice, &record).await;

    let reads = h.store.edge_reads();
    let first = h.engine.check_attribute(alice.id, record.id, "view").await.unwrap();
    assert!(first.has_attribute);
    assert_eq!(h.store.edge_reads() - reads, 1, "first check loads the snapshot");

    let reads = h.store.edge_reads();
    let second = h.engine.check_attribute(alice.id, record.id, "view").await.unwrap();
    assert_eq!(second, first);
    assert_eq!(h.store.edge_reads() - reads, 0, "repeat check is a path cache hit");

    h.engine.delete_edge(ownership.id).await.unwrap();

    let reads = h.store.edge_reads();
    let third = h.engine.check_attribute(alice.id, record.id, "view").await.unwrap();
    assert!(!third.has_attribute);
    assert_eq!(
        h.store.edge_reads() - reads,
        1,
        "invalidated snapshot is brought forward incrementally"
    );
}

#[tokio::test]
async fn test_edge_types_are_reloaded_for_every_search() {
    let h = Hospital::new().await;
    let alice = h.object(&h.user_type).await;
    let record = h.object(&h.record_type).await;
    h.link(&h.owner, &alice, &record).await;

    let type_reads = h.store.edge_type_reads();
    h.engine
        .check_attribute_bfs(alice.id, record.id, "view", false)
        .await
        .unwrap();
    h.engine
        .check_attribute_bfs(alice.id, record.id, "view", false)
        .await
        .unwrap();
    assert_eq!(h.store.edge_type_reads() - type_reads, 2);
}

#[tokio::test]
async fn test_skip_cache_reads_the_store_directly() {
    let h = Hospital::new().await;
    let alice = h.object(&h.user_type).await;
    let record = h.object(&h.record_type).await;

    let (found, _) = h
        .engine
        .check_attribute_bfs(alice.id, record.id, "view", false)
        .await
        .unwrap();
    assert!(!found);

    // written behind the cache's back: no lock, no invalidation
    h.store
        .create_edge(Edge::new(h.owner.id, alice.id, record.id))
        .await
        .unwrap();

    let (cached, _) = h
        .engine
        .check_attribute_bfs(alice.id, record.id, "view", false)
        .await
        .unwrap();
    assert!(!cached);
    let (fresh, path) = h
        .engine
        .check_attribute_bfs(alice.id, record.id, "view", true)
        .await
        .unwrap();
    assert!(fresh);
    assert_eq!(path.len(), 2);
}

#[tokio::test]
async fn test_shadow_mode_answers_from_store() {
    let mut config = AuthzConfig::default();
    config.evaluation.shadow = true;
    let h = Hospital::new().await;
    let shadow = AuthorizationEngine::new(
        h.engine.tenant_id(),
        h.store.clone(),
        h.directory.clone(),
        Arc::new(config),
    )
    .with_shared_cache(h.cache.clone());

    let alice = h.object(&h.user_type).await;
    let record = h.object(&h.record_type).await;
    let before = shadow.check_attribute(alice.id, record.id, "view").await.unwrap();
    assert!(!before.has_attribute);

    h.store
        .create_edge(Edge::new(h.owner.id, alice.id, record.id))
        .await
        .unwrap();

    let plain = h.engine.check_attribute(alice.id, record.id, "view").await.unwrap();
    assert!(!plain.has_attribute, "snapshot has not seen the edge");
    let shadowed = shadow.check_attribute(alice.id, record.id, "view").await.unwrap();
    assert!(shadowed.has_attribute);
}

#[tokio::test]
async fn test_engine_without_shared_cache_reads_store_every_time() {
    let store = Arc::new(InMemoryGraphStore::new());
    let config = AuthzConfig::default();
    let engine = AuthorizationEngine::new(
        Uuid::new_v4(),
        store.clone(),
        EdgeCacheDirectory::new(config.edge_cache.clone()),
        Arc::new(config),
    );
    let user_type = engine.create_object_type(ObjectType::new("user")).await.unwrap();
    let doc_type = engine.create_object_type(ObjectType::new("doc")).await.unwrap();
    let reader = engine
        .create_edge_type(EdgeType::new("reader", user_type.id, doc_type.id, vec![Attribute::direct("read")]))
        .await
        .unwrap();
    let user = engine.create_object(Object::new(user_type.id)).await.unwrap();
    let doc = engine.create_object(Object::new(doc_type.id)).await.unwrap();
    engine
        .create_edge(Edge::new(reader.id, user.id, doc.id))
        .await
        .unwrap();

    let reads = store.edge_reads();
    for _ in 0..3 {
        assert!(engine.check_attribute(user.id, doc.id, "read").await.unwrap().has_attribute);
    }
    assert_eq!(store.edge_reads() - reads, 3);
}

// ============================================================================
// Mutations
// ============================================================================

#[tokio::test]
async fn test_deleting_ward_revokes_member_access() {
    let h = Hospital::new().await;
    let alice = h.object(&h.user_type).await;
    let ward = h.object(&h.ward_type).await;
    let record = h.object(&h.record_type).await;
    h.link(&h.member, &alice, &ward).await;
    h.link(&h.assigned, &ward, &record).await;

    assert!(h.engine.check_attribute(alice.id, record.id, "view").await.unwrap().has_attribute);

    h.engine.delete_object(ward.id).await.unwrap();

    assert!(!h.engine.check_attribute(alice.id, record.id, "view").await.unwrap().has_attribute);
    assert!(matches!(
        h.store.get_object(ward.id).await,
        Err(AuthzError::NotFound(_))
    ));
}

#[tokio::test]
async fn test_type_deletion_flushes_tombstone_snapshots() {
    let h = Hospital::new().await;
    let tenant = h.engine.tenant_id();
    let alice = h.object(&h.user_type).await;
    let record = h.object(&h.record_type).await;
    let lab = h.object(&h.lab_type).await;
    h.link(&h.owner, &alice, &record).await;
    h.link(&h.attached, &record, &lab).await;
    h.engine.check_attribute(alice.id, lab.id, "view").await.unwrap();

    // a peer holds the collection lock while this process reads
    let peer_token = h.cache.take_collection_lock(tenant).await.unwrap();
    h.engine
        .check_attribute_bfs(alice.id, lab.id, "view", false)
        .await
        .unwrap();
    let pending = h.directory.record(tenant, &peer_token).unwrap();
    assert!(!pending.is_stale());

    h.engine.delete_edge_type(h.attached.id).await.unwrap();
    assert!(pending.is_stale());

    let response = h.engine.check_attribute(alice.id, lab.id, "view").await.unwrap();
    assert!(!response.has_attribute);
}

#[tokio::test]
async fn test_edge_mutation_spares_tombstone_snapshots() {
    let h = Hospital::new().await;
    let tenant = h.engine.tenant_id();
    let alice = h.object(&h.user_type).await;
    let record = h.object(&h.record_type).await;

    let peer_token = h.cache.take_collection_lock(tenant).await.unwrap();
    h.engine
        .check_attribute_bfs(alice.id, record.id, "view", false)
        .await
        .unwrap();
    let pending = h.directory.record(tenant, &peer_token).unwrap();

    h.link(&h.owner, &alice, &record).await;
    assert!(!pending.is_stale());
}

#[tokio::test]
async fn test_mistyped_edge_is_rejected_and_lock_released() {
    let h = Hospital::new().await;
    let tenant = h.engine.tenant_id();
    let alice = h.object(&h.user_type).await;
    let ward = h.object(&h.ward_type).await;

    let err = h
        .engine
        .create_edge(Edge::new(h.assigned.id, alice.id, ward.id))
        .await
        .unwrap_err();
    assert!(matches!(err, AuthzError::InvalidEdge(_)));
    assert_eq!(
        h.cache.edges_modified_token(tenant).await.unwrap(),
        ConflictToken::NoConflict
    );
}

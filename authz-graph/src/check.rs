use crate::{
    error::{AuthzError, Result},
    models::*,
};
use std::collections::{HashMap, HashSet};
use tracing::debug;
use uuid::Uuid;

/// Default upper bound on BFS candidates before a search gives up
pub const DEFAULT_MAX_CANDIDATES: usize = 60_000;

/// How a candidate node was reached, tracked as a bitfield per object so an
/// object can be visited once per reach type.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
enum Reach {
    Inherit = 1,
    Direct = 2,
    Propagate = 4,
}

impl Reach {
    fn bit(self) -> u8 {
        self as u8
    }
}

#[derive(Debug, Clone, Copy)]
struct Candidate {
    node: AttributePathNode,
    reach: Reach,
    prev: Option<usize>,
}

/// What a search is looking for
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SearchTarget {
    /// Stop at the first valid path to this object
    Object(Uuid),
    /// Collect every object of this type that holds the attribute
    ObjectType(Uuid),
}

/// A tenant's edge graph as seen by one search.
///
/// A valid path from source to target is zero or more `inherit` edges to
/// intermediate (non-target) objects, then exactly one `direct` edge, then
/// zero or more `propagate` edges. Only edges whose type carries an
/// attribute with exactly the requested name count, and only outbound edges
/// are followed.
pub struct SearchGraph<'a> {
    tenant_id: Uuid,
    edges: &'a EdgeMap,
    edge_types: &'a EdgeTypeMap,
    max_candidates: usize,
}

impl<'a> SearchGraph<'a> {
    pub fn new(tenant_id: Uuid, edges: &'a EdgeMap, edge_types: &'a EdgeTypeMap) -> Self {
        Self {
            tenant_id,
            edges,
            edge_types,
            max_candidates: DEFAULT_MAX_CANDIDATES,
        }
    }

    pub fn with_max_candidates(mut self, max_candidates: usize) -> Self {
        self.max_candidates = max_candidates;
        self
    }

    /// Breadth-first search for a valid path from `source` to `target`.
    ///
    /// Returns the path as a list of nodes starting with the source (with a
    /// nil edge id), or an empty path when no valid path exists.
    pub fn check_attribute_bfs(
        &self,
        source: Uuid,
        target: Uuid,
        attribute: &str,
    ) -> Result<(bool, Vec<AttributePathNode>)> {
        let mut search = PathSearch::new(self, source, SearchTarget::Object(target), attribute);
        match search.run()? {
            Some(found) => Ok((true, search.path_to(found))),
            None => Ok((false, Vec::new())),
        }
    }

    /// Every object of `target_type` reachable from `source` through a valid
    /// path, in the order first reached.
    pub fn list_objects_reachable_bfs(
        &self,
        source: Uuid,
        target_type: Uuid,
        attribute: &str,
    ) -> Result<Vec<Uuid>> {
        let mut search = PathSearch::new(self, source, SearchTarget::ObjectType(target_type), attribute);
        search.run()?;
        Ok(search.results)
    }
}

struct PathSearch<'g, 'a> {
    graph: &'g SearchGraph<'a>,
    target: SearchTarget,
    attribute: &'g str,
    visited: HashMap<Uuid, u8>,
    candidates: Vec<Candidate>,
    results: Vec<Uuid>,
    seen_results: HashSet<Uuid>,
}

impl<'g, 'a> PathSearch<'g, 'a> {
    fn new(graph: &'g SearchGraph<'a>, source: Uuid, target: SearchTarget, attribute: &'g str) -> Self {
        Self {
            graph,
            target,
            attribute,
            visited: HashMap::new(),
            candidates: vec![Candidate {
                node: AttributePathNode::start(source),
                reach: Reach::Inherit,
                prev: None,
            }],
            results: Vec::new(),
            seen_results: HashSet::new(),
        }
    }

    fn run(&mut self) -> Result<Option<usize>> {
        let outcome = self.expand_all();
        metrics::gauge!("authz_bfs_max_candidates", "tenant_id" => self.graph.tenant_id.to_string())
            .set(self.candidates.len() as f64);
        outcome
    }

    fn expand_all(&mut self) -> Result<Option<usize>> {
        let mut i = 0;
        while i < self.candidates.len() {
            if let Some(found) = self.expand(i)? {
                return Ok(Some(found));
            }
            if self.candidates.len() > self.graph.max_candidates {
                debug!(
                    tenant_id = %self.graph.tenant_id,
                    "BFS gave up after {} candidates",
                    self.candidates.len()
                );
                return Err(AuthzError::SearchBoundExceeded {
                    limit: self.graph.max_candidates,
                    seen: self.candidates.len(),
                });
            }
            i += 1;
        }
        Ok(None)
    }

    fn target_object(&self) -> Option<Uuid> {
        match self.target {
            SearchTarget::Object(id) => Some(id),
            SearchTarget::ObjectType(_) => None,
        }
    }

    /// Follow the outbound edges of candidate `i`. Returns the index of the
    /// candidate that landed on the target object, if any.
    fn expand(&mut self, i: usize) -> Result<Option<usize>> {
        let Some(current) = self.candidates.get(i).copied() else {
            return Ok(None);
        };
        let graph = self.graph;
        let attribute = self.attribute;
        let Some(outbound) = graph.edges.get(&current.node.object_id) else {
            return Ok(None);
        };
        let target_object = self.target_object();

        for edge in outbound.values() {
            if edge.source_object_id != current.node.object_id {
                continue;
            }
            let edge_type = graph.edge_types.get(&edge.edge_type_id).ok_or(
                AuthzError::CacheInconsistency {
                    edge_type_id: edge.edge_type_id,
                    edge_id: edge.id,
                },
            )?;

            for attr in edge_type.attributes.iter().filter(|attr| attr.name == attribute) {
                let next = AttributePathNode {
                    object_id: edge.target_object_id,
                    edge_id: edge.id,
                };
                let lands_on_target = target_object == Some(edge.target_object_id);

                let mut steps: [Option<Reach>; 2] = [None, None];
                match current.reach {
                    Reach::Inherit => {
                        if attr.direct {
                            steps[0] = Some(Reach::Direct);
                        }
                        if attr.inherit && !lands_on_target {
                            steps[1] = Some(Reach::Inherit);
                        }
                    }
                    Reach::Direct | Reach::Propagate => {
                        if attr.propagate {
                            steps[0] = Some(Reach::Propagate);
                        }
                    }
                }

                for reach in steps.into_iter().flatten() {
                    if reach != Reach::Inherit {
                        self.record_result(edge_type, edge.target_object_id);
                        if lands_on_target {
                            self.candidates.push(Candidate {
                                node: next,
                                reach,
                                prev: Some(i),
                            });
                            return Ok(Some(self.candidates.len() - 1));
                        }
                    }
                    let seen = self.visited.entry(edge.target_object_id).or_insert(0);
                    if *seen & reach.bit() == 0 {
                        *seen |= reach.bit();
                        self.candidates.push(Candidate {
                            node: next,
                            reach,
                            prev: Some(i),
                        });
                    }
                }
            }
        }
        Ok(None)
    }

    fn record_result(&mut self, edge_type: &EdgeType, object_id: Uuid) {
        if let SearchTarget::ObjectType(type_id) = self.target {
            if edge_type.target_object_type_id == type_id && self.seen_results.insert(object_id) {
                self.results.push(object_id);
            }
        }
    }

    fn path_to(&self, found: usize) -> Vec<AttributePathNode> {
        let mut path = Vec::new();
        let mut cursor = Some(found);
        while let Some(idx) = cursor {
            let Some(candidate) = self.candidates.get(idx) else {
                break;
            };
            path.push(candidate.node);
            cursor = candidate.prev;
        }
        path.reverse();
        path
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    #[derive(Default)]
    struct Graph {
        edges: EdgeMap,
        edge_types: EdgeTypeMap,
    }

    impl Graph {
        fn edge_type(&mut self, source_type: Uuid, target_type: Uuid, attributes: Vec<Attribute>) -> Uuid {
            let edge_type = EdgeType::new("t", source_type, target_type, attributes);
            let id = edge_type.id;
            self.edge_types.insert(id, edge_type);
            id
        }

        fn edge(&mut self, edge_type: Uuid, source: Uuid, target: Uuid) -> Uuid {
            let edge = Edge::new(edge_type, source, target);
            let id = edge.id;
            self.edges.entry(source).or_default().insert(id, edge);
            id
        }

        fn search(&self) -> SearchGraph<'_> {
            SearchGraph::new(Uuid::nil(), &self.edges, &self.edge_types)
        }
    }

    fn flags(name: &str, direct: bool, inherit: bool, propagate: bool) -> Attribute {
        Attribute {
            name: name.to_string(),
            direct,
            inherit,
            propagate,
        }
    }

    #[test]
    fn test_single_direct_edge() {
        let mut g = Graph::default();
        let ty = Uuid::new_v4();
        let owner = g.edge_type(ty, ty, vec![Attribute::direct("read")]);
        let (s, t) = (Uuid::new_v4(), Uuid::new_v4());
        let e = g.edge(owner, s, t);

        let (found, path) = g.search().check_attribute_bfs(s, t, "read").unwrap();
        assert!(found);
        assert_eq!(
            path,
            vec![
                AttributePathNode::start(s),
                AttributePathNode { object_id: t, edge_id: e }
            ]
        );
    }

    #[test]
    fn test_attribute_name_must_match_exactly() {
        let mut g = Graph::default();
        let ty = Uuid::new_v4();
        let owner = g.edge_type(ty, ty, vec![Attribute::direct("Read")]);
        let (s, t) = (Uuid::new_v4(), Uuid::new_v4());
        g.edge(owner, s, t);

        let (found, path) = g.search().check_attribute_bfs(s, t, "read").unwrap();
        assert!(!found);
        assert!(path.is_empty());
    }

    #[test]
    fn test_inherit_direct_propagate_chain() {
        let mut g = Graph::default();
        let ty = Uuid::new_v4();
        let member = g.edge_type(ty, ty, vec![Attribute::inherit("read")]);
        let viewer = g.edge_type(ty, ty, vec![Attribute::direct("read")]);
        let contains = g.edge_type(ty, ty, vec![Attribute::propagate("read")]);
        let (user, group, folder, file) = (Uuid::new_v4(), Uuid::new_v4(), Uuid::new_v4(), Uuid::new_v4());
        let e1 = g.edge(member, user, group);
        let e2 = g.edge(viewer, group, folder);
        let e3 = g.edge(contains, folder, file);

        let (found, path) = g.search().check_attribute_bfs(user, file, "read").unwrap();
        assert!(found);
        let edges: Vec<Uuid> = path.iter().map(|node| node.edge_id).collect();
        assert_eq!(edges, vec![Uuid::nil(), e1, e2, e3]);
    }

    #[test]
    fn test_propagate_before_direct_is_rejected() {
        let mut g = Graph::default();
        let ty = Uuid::new_v4();
        let contains = g.edge_type(ty, ty, vec![Attribute::propagate("read")]);
        let viewer = g.edge_type(ty, ty, vec![Attribute::direct("read")]);
        let (s, mid, t) = (Uuid::new_v4(), Uuid::new_v4(), Uuid::new_v4());
        g.edge(contains, s, mid);
        g.edge(viewer, mid, t);

        let (found, _) = g.search().check_attribute_bfs(s, t, "read").unwrap();
        assert!(!found);
    }

    #[test]
    fn test_inherit_cannot_land_on_target() {
        let mut g = Graph::default();
        let ty = Uuid::new_v4();
        let member = g.edge_type(ty, ty, vec![Attribute::inherit("read")]);
        let (s, t) = (Uuid::new_v4(), Uuid::new_v4());
        g.edge(member, s, t);

        let (found, _) = g.search().check_attribute_bfs(s, t, "read").unwrap();
        assert!(!found);
    }

    #[test]
    fn test_inherit_cycle_terminates() {
        let mut g = Graph::default();
        let ty = Uuid::new_v4();
        let member = g.edge_type(ty, ty, vec![Attribute::inherit("read")]);
        let (a, b, c, t) = (Uuid::new_v4(), Uuid::new_v4(), Uuid::new_v4(), Uuid::new_v4());
        g.edge(member, a, b);
        g.edge(member, b, c);
        g.edge(member, c, a);

        let (found, path) = g.search().check_attribute_bfs(a, t, "read").unwrap();
        assert!(!found);
        assert!(path.is_empty());
    }

    #[test]
    fn test_object_visited_under_two_reach_types() {
        let mut g = Graph::default();
        let ty = Uuid::new_v4();
        let member = g.edge_type(ty, ty, vec![Attribute::inherit("read")]);
        let owner = g.edge_type(ty, ty, vec![Attribute::direct("read")]);
        let contains = g.edge_type(ty, ty, vec![Attribute::propagate("read")]);
        let (s, x, t) = (Uuid::new_v4(), Uuid::new_v4(), Uuid::new_v4());
        g.edge(member, s, x);
        let via_owner = g.edge(owner, s, x);
        g.edge(contains, x, t);

        let (found, path) = g.search().check_attribute_bfs(s, t, "read").unwrap();
        assert!(found);
        assert_eq!(path.len(), 3);
        assert_eq!(path[1].edge_id, via_owner);
    }

    #[test]
    fn test_multi_flag_attribute_honoured() {
        let mut g = Graph::default();
        let ty = Uuid::new_v4();
        let both = g.edge_type(ty, ty, vec![flags("read", true, true, false)]);
        let contains = g.edge_type(ty, ty, vec![Attribute::propagate("read")]);
        let (s, group, t) = (Uuid::new_v4(), Uuid::new_v4(), Uuid::new_v4());
        g.edge(both, s, group);
        g.edge(contains, group, t);

        // group reached as direct, then propagate onward
        let (found, _) = g.search().check_attribute_bfs(s, t, "read").unwrap();
        assert!(found);
        // group itself is granted through the direct flag
        let (found, _) = g.search().check_attribute_bfs(s, group, "read").unwrap();
        assert!(found);
    }

    #[test]
    fn test_search_bound_exceeded() {
        let mut g = Graph::default();
        let ty = Uuid::new_v4();
        let member = g.edge_type(ty, ty, vec![Attribute::inherit("read")]);
        let s = Uuid::new_v4();
        for _ in 0..(DEFAULT_MAX_CANDIDATES + 10) {
            g.edge(member, s, Uuid::new_v4());
        }

        let err = g
            .search()
            .check_attribute_bfs(s, Uuid::new_v4(), "read")
            .unwrap_err();
        assert!(matches!(
            err,
            AuthzError::SearchBoundExceeded { limit: DEFAULT_MAX_CANDIDATES, .. }
        ));
    }

    #[test]
    fn test_custom_bound() {
        let mut g = Graph::default();
        let ty = Uuid::new_v4();
        let member = g.edge_type(ty, ty, vec![Attribute::inherit("read")]);
        let s = Uuid::new_v4();
        for _ in 0..5 {
            g.edge(member, s, Uuid::new_v4());
        }

        let search = g.search().with_max_candidates(3);
        assert!(search.check_attribute_bfs(s, Uuid::new_v4(), "read").is_err());
        let search = g.search().with_max_candidates(6);
        assert!(search.check_attribute_bfs(s, Uuid::new_v4(), "read").is_ok());
    }

    #[test]
    fn test_unknown_edge_type_is_inconsistency() {
        let mut g = Graph::default();
        let (s, t) = (Uuid::new_v4(), Uuid::new_v4());
        let missing = Uuid::new_v4();
        let e = g.edge(missing, s, t);

        let err = g.search().check_attribute_bfs(s, t, "read").unwrap_err();
        match err {
            AuthzError::CacheInconsistency { edge_type_id, edge_id } => {
                assert_eq!(edge_type_id, missing);
                assert_eq!(edge_id, e);
            }
            other => panic!("unexpected error: {other}"),
        }
        assert!(AuthzError::CacheInconsistency {
            edge_type_id: missing,
            edge_id: e
        }
        .is_retryable());
    }

    #[test]
    fn test_list_reachable_deduplicates() {
        let mut g = Graph::default();
        let (user_ty, group_ty, doc_ty) = (Uuid::new_v4(), Uuid::new_v4(), Uuid::new_v4());
        let member = g.edge_type(user_ty, group_ty, vec![Attribute::inherit("read")]);
        let owner = g.edge_type(user_ty, doc_ty, vec![Attribute::direct("read")]);
        let viewer = g.edge_type(group_ty, doc_ty, vec![Attribute::direct("read")]);
        let (user, group, doc1, doc2) = (Uuid::new_v4(), Uuid::new_v4(), Uuid::new_v4(), Uuid::new_v4());
        g.edge(owner, user, doc1);
        g.edge(member, user, group);
        g.edge(viewer, group, doc1);
        g.edge(viewer, group, doc2);

        let found = g.search().list_objects_reachable_bfs(user, doc_ty, "read").unwrap();
        assert_eq!(found.len(), 2);
        assert_eq!(
            found.iter().copied().collect::<HashSet<_>>(),
            HashSet::from([doc1, doc2])
        );
        // groups are only inherited from, never granted
        assert!(g.search().list_objects_reachable_bfs(user, group_ty, "read").unwrap().is_empty());
    }

    /// Fixed-point reachability over (object, reach) states, independent of
    /// the BFS bookkeeping.
    fn reference_has_path(g: &Graph, source: Uuid, target: Uuid, attribute: &str) -> bool {
        let mut states: HashSet<(Uuid, u8)> = HashSet::from([(source, Reach::Inherit.bit())]);
        loop {
            let mut next = states.clone();
            for &(object, reach) in &states {
                for edge in g.edges.get(&object).into_iter().flat_map(|out| out.values()) {
                    let Some(edge_type) = g.edge_types.get(&edge.edge_type_id) else {
                        continue;
                    };
                    for attr in edge_type.attributes.iter().filter(|a| a.name == attribute) {
                        let landing = edge.target_object_id == target;
                        if reach == Reach::Inherit.bit() {
                            if attr.direct {
                                if landing {
                                    return true;
                                }
                                next.insert((edge.target_object_id, Reach::Direct.bit()));
                            }
                            if attr.inherit && !landing {
                                next.insert((edge.target_object_id, Reach::Inherit.bit()));
                            }
                        } else if attr.propagate {
                            if landing {
                                return true;
                            }
                            next.insert((edge.target_object_id, Reach::Propagate.bit()));
                        }
                    }
                }
            }
            if next.len() == states.len() {
                return false;
            }
            states = next;
        }
    }

    /// Replay a returned path against the automaton
    fn path_is_valid(g: &Graph, path: &[AttributePathNode], source: Uuid, target: Uuid, attribute: &str) -> bool {
        let Some(first) = path.first() else {
            return false;
        };
        if first.object_id != source || !first.edge_id.is_nil() {
            return false;
        }
        let mut reaches: HashSet<u8> = HashSet::from([Reach::Inherit.bit()]);
        for pair in path.windows(2) {
            let (prev, node) = (pair[0], pair[1]);
            let Some(edge) = g.edges.get(&prev.object_id).and_then(|out| out.get(&node.edge_id)) else {
                return false;
            };
            if edge.target_object_id != node.object_id {
                return false;
            }
            let edge_type = &g.edge_types[&edge.edge_type_id];
            let landing = node.object_id == target;
            let mut next = HashSet::new();
            for attr in edge_type.attributes.iter().filter(|a| a.name == attribute) {
                if reaches.contains(&Reach::Inherit.bit()) {
                    if attr.direct {
                        next.insert(Reach::Direct.bit());
                    }
                    if attr.inherit && !landing {
                        next.insert(Reach::Inherit.bit());
                    }
                }
                if (reaches.contains(&Reach::Direct.bit()) || reaches.contains(&Reach::Propagate.bit()))
                    && attr.propagate
                {
                    next.insert(Reach::Propagate.bit());
                }
            }
            reaches = next;
        }
        path.last().map(|n| n.object_id) == Some(target)
            && (reaches.contains(&Reach::Direct.bit()) || reaches.contains(&Reach::Propagate.bit()))
    }

    fn arb_graph() -> impl Strategy<Value = (Vec<(bool, bool, bool)>, Vec<(usize, usize, usize)>)> {
        (
            prop::collection::vec(any::<(bool, bool, bool)>(), 1..5),
            prop::collection::vec((0usize..8, 0usize..8, 0usize..5), 0..24),
        )
    }

    proptest! {
        #[test]
        fn prop_bfs_agrees_with_reference((type_flags, edges) in arb_graph(), source in 0usize..8, target in 0usize..8) {
            let objects: Vec<Uuid> = (0..8).map(|_| Uuid::new_v4()).collect();
            let ty = Uuid::new_v4();
            let mut g = Graph::default();
            let type_ids: Vec<Uuid> = type_flags
                .iter()
                .map(|&(d, i, p)| g.edge_type(ty, ty, vec![flags("read", d, i, p)]))
                .collect();
            for (src, dst, t) in edges {
                g.edge(type_ids[t % type_ids.len()], objects[src], objects[dst]);
            }

            let (source, target) = (objects[source], objects[target]);
            let (found, path) = g.search().check_attribute_bfs(source, target, "read").unwrap();
            prop_assert_eq!(found, reference_has_path(&g, source, target, "read"));
            if found {
                prop_assert!(path_is_valid(&g, &path, source, target, "read"));
            } else {
                prop_assert!(path.is_empty());
            }
        }
    }
}

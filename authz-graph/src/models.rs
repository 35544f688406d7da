use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fmt;
use uuid::Uuid;

/// Adjacency map of a tenant's live edges: source object id -> edge id -> edge
pub type EdgeMap = HashMap<Uuid, HashMap<Uuid, Edge>>;

/// Edge types keyed by id, loaded alongside an [`EdgeMap`] for a search
pub type EdgeTypeMap = HashMap<Uuid, EdgeType>;

/// Type definition of an authorization object
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ObjectType {
    pub id: Uuid,
    pub type_name: String,
    pub created: DateTime<Utc>,
    pub updated: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub deleted: Option<DateTime<Utc>>,
}

impl ObjectType {
    pub fn new(type_name: &str) -> Self {
        let now = Utc::now();
        Self {
            id: Uuid::new_v4(),
            type_name: type_name.to_string(),
            created: now,
            updated: now,
            deleted: None,
        }
    }

    pub fn is_alive(&self) -> bool {
        self.deleted.is_none()
    }
}

/// An object in the authorization graph (user, group, file, ...)
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Object {
    pub id: Uuid,
    pub type_id: Uuid,
    pub alias: Option<String>,
    pub organization_id: Option<Uuid>,
    pub created: DateTime<Utc>,
    pub updated: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub deleted: Option<DateTime<Utc>>,
}

impl Object {
    pub fn new(type_id: Uuid) -> Self {
        let now = Utc::now();
        Self {
            id: Uuid::new_v4(),
            type_id,
            alias: None,
            organization_id: None,
            created: now,
            updated: now,
            deleted: None,
        }
    }

    pub fn with_alias(mut self, alias: &str) -> Self {
        self.alias = Some(alias.to_string());
        self
    }

    pub fn in_organization(mut self, organization_id: Uuid) -> Self {
        self.organization_id = Some(organization_id);
        self
    }

    pub fn is_alive(&self) -> bool {
        self.deleted.is_none()
    }
}

/// A named attribute carried by an edge type.
///
/// The three flags govern which transitions through an edge of this type are
/// legal during a path search:
///
/// - `direct`: the source has the attribute on the target.
/// - `inherit`: the source inherits whatever the target has (a "pull").
/// - `propagate`: whoever has the attribute on the source also has it on the
///   target (a "push").
///
/// The flags are independent; an attribute may set more than one.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Attribute {
    pub name: String,
    #[serde(default)]
    pub direct: bool,
    #[serde(default)]
    pub inherit: bool,
    #[serde(default)]
    pub propagate: bool,
}

impl Attribute {
    pub fn direct(name: &str) -> Self {
        Self {
            name: name.to_string(),
            direct: true,
            inherit: false,
            propagate: false,
        }
    }

    pub fn inherit(name: &str) -> Self {
        Self {
            name: name.to_string(),
            direct: false,
            inherit: true,
            propagate: false,
        }
    }

    pub fn propagate(name: &str) -> Self {
        Self {
            name: name.to_string(),
            direct: false,
            inherit: false,
            propagate: true,
        }
    }
}

impl fmt::Display for Attribute {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{}[direct={},inherit={},propagate={}]",
            self.name, self.direct, self.inherit, self.propagate
        )
    }
}

/// Type definition of an edge between two object types
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EdgeType {
    pub id: Uuid,
    pub type_name: String,
    pub source_object_type_id: Uuid,
    pub target_object_type_id: Uuid,
    pub organization_id: Option<Uuid>,
    pub attributes: Vec<Attribute>,
    pub created: DateTime<Utc>,
    pub updated: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub deleted: Option<DateTime<Utc>>,
}

impl EdgeType {
    pub fn new(
        type_name: &str,
        source_object_type_id: Uuid,
        target_object_type_id: Uuid,
        attributes: Vec<Attribute>,
    ) -> Self {
        let now = Utc::now();
        Self {
            id: Uuid::new_v4(),
            type_name: type_name.to_string(),
            source_object_type_id,
            target_object_type_id,
            organization_id: None,
            attributes,
            created: now,
            updated: now,
            deleted: None,
        }
    }

    pub fn in_organization(mut self, organization_id: Uuid) -> Self {
        self.organization_id = Some(organization_id);
        self
    }

    pub fn is_alive(&self) -> bool {
        self.deleted.is_none()
    }
}

/// A typed, directed edge between two objects
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Edge {
    pub id: Uuid,
    pub edge_type_id: Uuid,
    pub source_object_id: Uuid,
    pub target_object_id: Uuid,
    pub created: DateTime<Utc>,
    pub updated: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub deleted: Option<DateTime<Utc>>,
}

impl Edge {
    pub fn new(edge_type_id: Uuid, source_object_id: Uuid, target_object_id: Uuid) -> Self {
        let now = Utc::now();
        Self {
            id: Uuid::new_v4(),
            edge_type_id,
            source_object_id,
            target_object_id,
            created: now,
            updated: now,
            deleted: None,
        }
    }

    pub fn is_alive(&self) -> bool {
        self.deleted.is_none()
    }

    /// Time of the last change to this row: the delete time for tombstones,
    /// the update time otherwise.
    pub fn changed_at(&self) -> DateTime<Utc> {
        self.deleted.unwrap_or(self.updated)
    }
}

impl fmt::Display for Edge {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "edge:{} ({} -[{}]-> {})",
            self.id, self.source_object_id, self.edge_type_id, self.target_object_id
        )
    }
}

/// A single hop in an attribute path.
///
/// `edge_id` is the edge that led to `object_id`; it is the nil UUID for the
/// first node of a path (the source object itself).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct AttributePathNode {
    pub object_id: Uuid,
    pub edge_id: Uuid,
}

impl AttributePathNode {
    pub fn start(object_id: Uuid) -> Self {
        Self {
            object_id,
            edge_id: Uuid::nil(),
        }
    }
}

/// Result of an attribute check
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct CheckAttributeResponse {
    pub has_attribute: bool,
    #[serde(default)]
    pub path: Vec<AttributePathNode>,
}

impl CheckAttributeResponse {
    pub fn denied() -> Self {
        Self::default()
    }

    pub fn granted(path: Vec<AttributePathNode>) -> Self {
        Self {
            has_attribute: true,
            path,
        }
    }
}

/// Objects reachable from a source with an attribute
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ListObjectsReachableWithAttributeResponse {
    pub data: Vec<Uuid>,
}

/// One page of a cursor-paginated listing
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Page<T> {
    pub items: Vec<T>,
    /// Cursor to pass to the next call, `None` once the listing is exhausted
    pub next: Option<Uuid>,
}

/// Page returned by the cache-oriented edge listing.
///
/// `edges` holds up to `limit` live edges ordered by update time followed by
/// tombstones for edges deleted since the previous page boundary. `live_read`
/// is the number of live rows, used to detect the last page.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CacheEdgePage {
    pub edges: Vec<Edge>,
    pub live_read: usize,
}

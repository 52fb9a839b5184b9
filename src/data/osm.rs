use std::fmt;

use serde::{Deserialize, Serialize};

use crate::data::geometry::{OsmPoint, OsmRect};
use crate::data::tags::Tags;
use crate::errors::{Error, Result};

/// Positive ids are assigned by the server; negative ids are placeholders
/// that only exist in this session.
pub type OsmId = i64;

#[derive(Serialize, Deserialize, Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum OsmType {
    Node,
    Way,
    Relation,
}

impl OsmType {
    pub fn as_str(&self) -> &'static str {
        match self {
            OsmType::Node => "node",
            OsmType::Way => "way",
            OsmType::Relation => "relation",
        }
    }

    pub fn parse(value: &str) -> Result<Self> {
        match value.to_ascii_lowercase().as_str() {
            "node" => Ok(OsmType::Node),
            "way" => Ok(OsmType::Way),
            "relation" => Ok(OsmType::Relation),
            _ => Err(Error::protocol(format!("Unknown element type '{}'", value))),
        }
    }
}

/// Ids are only unique within a type, so this pair is the real key.
#[derive(Serialize, Deserialize, Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ExtendedId {
    pub kind: OsmType,
    pub id: OsmId,
}

impl ExtendedId {
    pub fn new(kind: OsmType, id: OsmId) -> Self {
        ExtendedId { kind, id }
    }

    pub fn node(id: OsmId) -> Self {
        Self::new(OsmType::Node, id)
    }

    pub fn way(id: OsmId) -> Self {
        Self::new(OsmType::Way, id)
    }

    pub fn relation(id: OsmId) -> Self {
        Self::new(OsmType::Relation, id)
    }
}

impl fmt::Display for ExtendedId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} {}", self.kind.as_str(), self.id)
    }
}

#[derive(Serialize, Deserialize, Debug, Default, Clone, PartialEq)]
pub struct EntityMeta {
    pub id: OsmId,
    pub version: u32,
    pub changeset: i64,
    pub user: String,
    pub uid: i64,
    pub timestamp: String,
    pub tags: Tags,
    pub deleted: bool,
    /// Net number of local edits. Undo replays decrement it.
    pub modify_count: u32,
}

impl EntityMeta {
    pub fn user_created(id: OsmId, user: &str) -> Self {
        EntityMeta {
            id,
            version: 1,
            user: user.to_string(),
            ..Default::default()
        }
    }

    pub fn is_modified(&self) -> bool {
        self.modify_count > 0
    }

    /// Dirty with respect to the server: modified, or a tombstone the server
    /// has not confirmed yet.
    pub fn needs_upload(&self) -> bool {
        if self.deleted {
            self.id > 0
        } else {
            self.is_modified()
        }
    }

    pub fn touch(&mut self, undoing: bool) {
        if undoing {
            self.modify_count = self.modify_count.saturating_sub(1);
        } else {
            self.modify_count += 1;
        }
    }

    /// Replaces server-owned content with a newer version. Local bookkeeping
    /// (`deleted`, `modify_count`) is left alone.
    pub fn server_update(&mut self, newer: &EntityMeta) {
        debug_assert_eq!(self.id, newer.id);
        self.version = newer.version;
        self.changeset = newer.changeset;
        self.user = newer.user.clone();
        self.uid = newer.uid;
        self.timestamp = newer.timestamp.clone();
        self.tags = newer.tags.clone();
    }

    pub fn server_update_version(&mut self, newer: &EntityMeta) {
        self.version = newer.version;
        self.changeset = newer.changeset;
        self.user = newer.user.clone();
        self.uid = newer.uid;
        self.timestamp = newer.timestamp.clone();
    }
}

#[derive(Serialize, Deserialize, Debug, Default, Clone, PartialEq)]
pub struct Node {
    pub meta: EntityMeta,
    pub lat: f64,
    pub lon: f64,
    /// Number of ways referencing this node. Maintained by the graph.
    #[serde(default)]
    pub way_count: u32,
}

impl Node {
    pub fn new(meta: EntityMeta, lat: f64, lon: f64) -> Self {
        Node {
            meta,
            lat,
            lon,
            way_count: 0,
        }
    }

    pub fn location(&self) -> OsmPoint {
        OsmPoint {
            x: self.lon,
            y: self.lat,
        }
    }

    pub fn bounding_box(&self) -> OsmRect {
        if self.lon != 0.0 || self.lat != 0.0 {
            OsmRect::new(self.lon, self.lat, 0.0, 0.0)
        } else {
            // null island must not look like an empty box
            OsmRect::new(f64::MIN_POSITIVE, self.lat, 0.0, 0.0)
        }
    }
}

#[derive(Serialize, Deserialize, Debug, Default, Clone, PartialEq)]
pub struct Way {
    pub meta: EntityMeta,
    pub nodes: Vec<OsmId>,
}

impl Way {
    pub fn new(meta: EntityMeta, nodes: Vec<OsmId>) -> Self {
        Way { meta, nodes }
    }

    pub fn is_closed(&self) -> bool {
        self.nodes.len() > 2 && self.nodes.first() == self.nodes.last()
    }
}

#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
pub struct Member {
    pub kind: OsmType,
    pub reference: OsmId,
    pub role: String,
    /// Whether `reference` currently exists in the graph. Unresolved members
    /// are kept as stubs and retried after every merge.
    #[serde(default)]
    pub resolved: bool,
}

impl Member {
    pub fn new(kind: OsmType, reference: OsmId, role: &str) -> Self {
        Member {
            kind,
            reference,
            role: role.to_string(),
            resolved: false,
        }
    }

    pub fn target(&self) -> ExtendedId {
        ExtendedId::new(self.kind, self.reference)
    }
}

#[derive(Serialize, Deserialize, Debug, Default, Clone, PartialEq)]
pub struct Relation {
    pub meta: EntityMeta,
    pub members: Vec<Member>,
}

impl Relation {
    pub fn new(meta: EntityMeta, members: Vec<Member>) -> Self {
        Relation { meta, members }
    }

    pub fn contains(&self, target: ExtendedId) -> bool {
        self.members.iter().any(|member| member.target() == target)
    }

    pub fn is_multipolygon(&self) -> bool {
        matches!(
            self.meta.tags.get("type").map(String::as_str),
            Some("multipolygon") | Some("building")
        )
    }
}

/// Borrowed view of any entity in the graph.
#[derive(Debug, Clone, Copy)]
pub enum EntityRef<'a> {
    Node(&'a Node),
    Way(&'a Way),
    Relation(&'a Relation),
}

impl<'a> EntityRef<'a> {
    pub fn meta(&self) -> &'a EntityMeta {
        match self {
            EntityRef::Node(node) => &node.meta,
            EntityRef::Way(way) => &way.meta,
            EntityRef::Relation(relation) => &relation.meta,
        }
    }

    pub fn kind(&self) -> OsmType {
        match self {
            EntityRef::Node(_) => OsmType::Node,
            EntityRef::Way(_) => OsmType::Way,
            EntityRef::Relation(_) => OsmType::Relation,
        }
    }

    pub fn extended_id(&self) -> ExtendedId {
        ExtendedId::new(self.kind(), self.meta().id)
    }
}

//! Local cache of downloaded data, kept as flat entity, reference and tag
//! tables. Writes happen off the editing task, see [`queue`].

use std::collections::{HashMap, HashSet};

use serde::{Deserialize, Serialize};

use crate::data::osm::{EntityMeta, Member, Node, OsmId, OsmType, Relation, Way};
use crate::data::tags::Tags;
use crate::data::OsmDownloadData;
use crate::errors::Result;

pub mod file_store;
pub mod queue;

/// Immutable snapshot of what changed, handed to the persistence worker.
#[derive(Serialize, Deserialize, Debug, Default, Clone, PartialEq)]
pub struct PersistDelta {
    pub save_nodes: Vec<Node>,
    pub save_ways: Vec<Way>,
    pub save_relations: Vec<Relation>,
    pub delete_nodes: Vec<OsmId>,
    pub delete_ways: Vec<OsmId>,
    pub delete_relations: Vec<OsmId>,
}

impl PersistDelta {
    pub fn is_empty(&self) -> bool {
        self.save_count() == 0 && self.delete_count() == 0
    }

    pub fn save_count(&self) -> usize {
        self.save_nodes.len() + self.save_ways.len() + self.save_relations.len()
    }

    pub fn delete_count(&self) -> usize {
        self.delete_nodes.len() + self.delete_ways.len() + self.delete_relations.len()
    }

    pub fn append(&mut self, other: PersistDelta) {
        self.save_nodes.extend(other.save_nodes);
        self.save_ways.extend(other.save_ways);
        self.save_relations.extend(other.save_relations);
        self.delete_nodes.extend(other.delete_nodes);
        self.delete_ways.extend(other.delete_ways);
        self.delete_relations.extend(other.delete_relations);
    }
}

pub trait Persistence {
    fn save_delta(&mut self, delta: &PersistDelta) -> Result<()>;
    fn load_all(&mut self) -> Result<OsmDownloadData>;
    fn clear(&mut self) -> Result<()>;
}

fn kind_code(kind: OsmType) -> u8 {
    match kind {
        OsmType::Node => 0,
        OsmType::Way => 1,
        OsmType::Relation => 2,
    }
}

fn kind_from_code(code: u8) -> OsmType {
    match code {
        0 => OsmType::Node,
        1 => OsmType::Way,
        _ => OsmType::Relation,
    }
}

#[derive(rkyv::Archive, rkyv::Deserialize, rkyv::Serialize, Debug, Default, Clone, PartialEq)]
#[archive(check_bytes)]
pub struct EntityRow {
    pub id: i64,
    pub version: u32,
    pub changeset: i64,
    pub user: String,
    pub uid: i64,
    pub timestamp: String,
}

#[derive(rkyv::Archive, rkyv::Deserialize, rkyv::Serialize, Debug, Default, Clone, PartialEq)]
#[archive(check_bytes)]
pub struct NodeRow {
    pub entity: EntityRow,
    pub lat: f64,
    pub lon: f64,
}

#[derive(rkyv::Archive, rkyv::Deserialize, rkyv::Serialize, Debug, Default, Clone, PartialEq)]
#[archive(check_bytes)]
pub struct WayNodeRow {
    pub way: i64,
    pub position: u32,
    pub node: i64,
}

#[derive(rkyv::Archive, rkyv::Deserialize, rkyv::Serialize, Debug, Default, Clone, PartialEq)]
#[archive(check_bytes)]
pub struct MemberRow {
    pub relation: i64,
    pub position: u32,
    pub kind: u8,
    pub reference: i64,
    pub role: String,
}

#[derive(rkyv::Archive, rkyv::Deserialize, rkyv::Serialize, Debug, Default, Clone, PartialEq)]
#[archive(check_bytes)]
pub struct TagRow {
    pub kind: u8,
    pub owner: i64,
    pub key: String,
    pub value: String,
}

/// The cache contents. Rows referencing a deleted entity go with it.
#[derive(rkyv::Archive, rkyv::Deserialize, rkyv::Serialize, Debug, Default, Clone, PartialEq)]
#[archive(check_bytes)]
pub struct Tables {
    pub nodes: Vec<NodeRow>,
    pub ways: Vec<EntityRow>,
    pub way_nodes: Vec<WayNodeRow>,
    pub relations: Vec<EntityRow>,
    pub members: Vec<MemberRow>,
    pub tags: Vec<TagRow>,
}

fn id_set(saved: impl Iterator<Item = OsmId>, deleted: &[OsmId]) -> HashSet<OsmId> {
    saved.chain(deleted.iter().copied()).collect()
}

impl EntityRow {
    fn from_meta(meta: &EntityMeta) -> Self {
        EntityRow {
            id: meta.id,
            version: meta.version,
            changeset: meta.changeset,
            user: meta.user.clone(),
            uid: meta.uid,
            timestamp: meta.timestamp.clone(),
        }
    }

    fn to_meta(&self, tags: Tags) -> EntityMeta {
        EntityMeta {
            id: self.id,
            version: self.version,
            changeset: self.changeset,
            user: self.user.clone(),
            uid: self.uid,
            timestamp: self.timestamp.clone(),
            tags,
            deleted: false,
            modify_count: 0,
        }
    }
}

impl Tables {
    pub fn row_count(&self) -> usize {
        self.nodes.len() + self.ways.len() + self.relations.len()
    }

    fn remove(&mut self, kind: OsmType, ids: &HashSet<OsmId>) {
        if ids.is_empty() {
            return;
        }
        match kind {
            OsmType::Node => self.nodes.retain(|row| !ids.contains(&row.entity.id)),
            OsmType::Way => {
                self.ways.retain(|row| !ids.contains(&row.id));
                self.way_nodes.retain(|row| !ids.contains(&row.way));
            }
            OsmType::Relation => {
                self.relations.retain(|row| !ids.contains(&row.id));
                self.members.retain(|row| !ids.contains(&row.relation));
            }
        }
        let code = kind_code(kind);
        self.tags
            .retain(|row| row.kind != code || !ids.contains(&row.owner));
    }

    fn push_tags(&mut self, kind: OsmType, meta: &EntityMeta) {
        let code = kind_code(kind);
        self.tags.extend(meta.tags.iter().map(|(key, value)| TagRow {
            kind: code,
            owner: meta.id,
            key: key.clone(),
            value: value.clone(),
        }));
    }

    /// Saved entities replace whatever was stored under the same id.
    pub fn apply(&mut self, delta: &PersistDelta) {
        let node_ids = id_set(delta.save_nodes.iter().map(|node| node.meta.id), &delta.delete_nodes);
        let way_ids = id_set(delta.save_ways.iter().map(|way| way.meta.id), &delta.delete_ways);
        let relation_ids = id_set(
            delta.save_relations.iter().map(|relation| relation.meta.id),
            &delta.delete_relations,
        );
        self.remove(OsmType::Node, &node_ids);
        self.remove(OsmType::Way, &way_ids);
        self.remove(OsmType::Relation, &relation_ids);

        for node in &delta.save_nodes {
            self.nodes.push(NodeRow {
                entity: EntityRow::from_meta(&node.meta),
                lat: node.lat,
                lon: node.lon,
            });
            self.push_tags(OsmType::Node, &node.meta);
        }
        for way in &delta.save_ways {
            self.ways.push(EntityRow::from_meta(&way.meta));
            self.way_nodes
                .extend(way.nodes.iter().enumerate().map(|(position, node)| WayNodeRow {
                    way: way.meta.id,
                    position: position as u32,
                    node: *node,
                }));
            self.push_tags(OsmType::Way, &way.meta);
        }
        for relation in &delta.save_relations {
            self.relations.push(EntityRow::from_meta(&relation.meta));
            self.members
                .extend(relation.members.iter().enumerate().map(|(position, member)| MemberRow {
                    relation: relation.meta.id,
                    position: position as u32,
                    kind: kind_code(member.kind),
                    reference: member.reference,
                    role: member.role.clone(),
                }));
            self.push_tags(OsmType::Relation, &relation.meta);
        }
    }

    pub fn load(&self) -> OsmDownloadData {
        let mut tags: HashMap<(u8, OsmId), Tags> = HashMap::new();
        for row in &self.tags {
            tags.entry((row.kind, row.owner))
                .or_default()
                .insert(row.key.clone(), row.value.clone());
        }
        let mut take_tags = |kind: OsmType, id: OsmId| tags.remove(&(kind_code(kind), id)).unwrap_or_default();

        let mut way_nodes: HashMap<OsmId, Vec<&WayNodeRow>> = HashMap::new();
        for row in &self.way_nodes {
            way_nodes.entry(row.way).or_default().push(row);
        }
        let mut members: HashMap<OsmId, Vec<&MemberRow>> = HashMap::new();
        for row in &self.members {
            members.entry(row.relation).or_default().push(row);
        }

        let mut data = OsmDownloadData::default();
        for row in &self.nodes {
            let meta = row.entity.to_meta(take_tags(OsmType::Node, row.entity.id));
            data.nodes.push(Node::new(meta, row.lat, row.lon));
        }
        for row in &self.ways {
            let mut refs = way_nodes.remove(&row.id).unwrap_or_default();
            refs.sort_by_key(|r| r.position);
            let nodes = refs.iter().map(|r| r.node).collect();
            data.ways.push(Way::new(row.to_meta(take_tags(OsmType::Way, row.id)), nodes));
        }
        for row in &self.relations {
            let mut refs = members.remove(&row.id).unwrap_or_default();
            refs.sort_by_key(|r| r.position);
            let list = refs
                .iter()
                .map(|r| Member::new(kind_from_code(r.kind), r.reference, &r.role))
                .collect();
            data.relations
                .push(Relation::new(row.to_meta(take_tags(OsmType::Relation, row.id)), list));
        }
        data
    }
}

/// Keeps the tables in memory only.
#[derive(Debug, Default, Clone)]
pub struct MemoryStore {
    pub tables: Tables,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }
}

impl Persistence for MemoryStore {
    fn save_delta(&mut self, delta: &PersistDelta) -> Result<()> {
        self.tables.apply(delta);
        Ok(())
    }

    fn load_all(&mut self) -> Result<OsmDownloadData> {
        Ok(self.tables.load())
    }

    fn clear(&mut self) -> Result<()> {
        self.tables = Tables::default();
        Ok(())
    }
}

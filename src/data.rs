use serde::{Deserialize, Serialize};

use self::geometry::OsmRect;
use self::osm::{ExtendedId, Node, Relation, Way};

pub mod geometry;
pub mod osm;
pub mod tags;

/// A subset of the map as it travels over the wire or comes out of the local
/// cache. Elements keep document order, which matters for merge.
#[derive(Serialize, Deserialize, Debug, Default, Clone, PartialEq)]
pub struct OsmDownloadData {
    pub nodes: Vec<Node>,
    pub ways: Vec<Way>,
    pub relations: Vec<Relation>,
    /// `<bounds>` of the document, when the server sent one.
    pub bounds: Option<OsmRect>,
}

impl OsmDownloadData {
    pub fn is_empty(&self) -> bool {
        self.nodes.is_empty() && self.ways.is_empty() && self.relations.is_empty()
    }

    pub fn len(&self) -> usize {
        self.nodes.len() + self.ways.len() + self.relations.len()
    }

    pub fn extended_ids(&self) -> impl Iterator<Item = ExtendedId> + '_ {
        self.nodes
            .iter()
            .map(|node| ExtendedId::node(node.meta.id))
            .chain(self.ways.iter().map(|way| ExtendedId::way(way.meta.id)))
            .chain(
                self.relations
                    .iter()
                    .map(|relation| ExtendedId::relation(relation.meta.id)),
            )
    }
}

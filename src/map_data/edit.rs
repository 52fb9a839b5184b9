use crate::data::osm::{EntityMeta, ExtendedId, Member, Node, OsmId, Relation, Way};
use crate::data::tags::{self, Tags};
use crate::errors::{Error, Result};
use crate::map_data::MapData;

/// Editing commands. Each checks its preconditions before touching anything
/// and registers its inverse in the current undo group.
impl MapData {
    pub(crate) fn ensure_live(&self, ext: ExtendedId) -> Result<()> {
        match self.entity(ext) {
            None => Err(Error::invariant(format!("No such entity {}", ext))),
            Some(entity) if entity.meta().deleted => {
                Err(Error::invariant(format!("Cannot modify deleted {}", ext)))
            }
            Some(_) => Ok(()),
        }
    }

    pub fn create_node(&mut self, lat: f64, lon: f64) -> Result<OsmId> {
        let id = self.allocate_placeholder();
        let mut node = Node::new(EntityMeta::user_created(id, self.user()), lat, lon);
        node.meta.deleted = true;
        let bbox = node.bounding_box();
        self.nodes.insert(id, node);

        self.register_comment("create node");
        self.prim_set_deleted(ExtendedId::node(id), false)?;
        self.prim_spatial_add(ExtendedId::node(id), bbox);
        Ok(id)
    }

    /// The way is indexed once it gets nodes.
    pub fn create_way(&mut self) -> Result<OsmId> {
        let id = self.allocate_placeholder();
        let mut way = Way::new(EntityMeta::user_created(id, self.user()), Vec::new());
        way.meta.deleted = true;
        self.ways.insert(id, way);

        self.register_comment("create way");
        self.prim_set_deleted(ExtendedId::way(id), false)?;
        Ok(id)
    }

    pub fn create_relation(&mut self) -> Result<OsmId> {
        let id = self.allocate_placeholder();
        let mut relation = Relation::new(EntityMeta::user_created(id, self.user()), Vec::new());
        relation.meta.deleted = true;
        self.relations.insert(id, relation);

        self.register_comment("create relation");
        self.prim_set_deleted(ExtendedId::relation(id), false)?;
        Ok(id)
    }

    pub fn set_tags(&mut self, target: ExtendedId, new_tags: &Tags) -> Result<()> {
        self.ensure_live(target)?;
        self.register_comment("set tags");
        self.prim_set_tags(target, tags::truncated(new_tags))
    }

    /// Moves a node. Boxes of the ways using it and of every relation above
    /// them follow.
    pub fn set_location(&mut self, node: OsmId, lat: f64, lon: f64) -> Result<()> {
        let ext = ExtendedId::node(node);
        self.ensure_live(ext)?;
        self.register_comment("move");
        self.prim_set_location(node, lat, lon)?;
        self.refresh_box(ext)?;
        self.refresh_ancestors(ext)?;
        for way in self.ways_containing(node) {
            self.refresh_box(ExtendedId::way(way))?;
            self.refresh_ancestors(ExtendedId::way(way))?;
        }
        Ok(())
    }

    pub fn add_node_to_way(&mut self, way: OsmId, node: OsmId, index: usize) -> Result<()> {
        self.ensure_live(ExtendedId::way(way))?;
        self.ensure_live(ExtendedId::node(node))?;
        let nodes = &self.ways[&way].nodes;
        if index > nodes.len() {
            return Err(Error::invariant(format!("Index {} out of range for way {}", index, way)));
        }
        let before = index.checked_sub(1).and_then(|i| nodes.get(i));
        if before == Some(&node) || nodes.get(index) == Some(&node) {
            return Err(Error::invariant(format!("Node {} would repeat in way {}", node, way)));
        }
        self.register_comment("add node to way");
        self.prim_add_node(way, node, index)?;
        self.refresh_box(ExtendedId::way(way))?;
        self.refresh_ancestors(ExtendedId::way(way))
    }

    /// Removes the node at `index`. A node no longer used by any way is
    /// deleted as well, unless `preserve_node` is set.
    pub fn delete_node_from_way(&mut self, way: OsmId, index: usize, preserve_node: bool) -> Result<()> {
        self.ensure_live(ExtendedId::way(way))?;
        if index >= self.ways[&way].nodes.len() {
            return Err(Error::invariant(format!("Index {} out of range for way {}", index, way)));
        }
        self.register_comment("delete node from way");
        self.delete_node_from_way_inner(way, index, preserve_node)
    }

    fn delete_node_from_way_inner(&mut self, way_id: OsmId, index: usize, preserve_node: bool) -> Result<()> {
        let node = self.prim_remove_node(way_id, index)?;
        // the removal may leave the same node twice in a row
        loop {
            let Some(way) = self.ways.get(&way_id) else {
                break;
            };
            if index > 0 && index < way.nodes.len() && way.nodes[index - 1] == way.nodes[index] {
                self.prim_remove_node(way_id, index)?;
            } else {
                break;
            }
        }
        self.refresh_box(ExtendedId::way(way_id))?;
        self.refresh_ancestors(ExtendedId::way(way_id))?;

        let orphaned = self.nodes.get(&node).map(|n| n.way_count == 0 && !n.meta.deleted);
        if orphaned == Some(true) && !preserve_node {
            self.delete_node_inner(node)?;
        }
        Ok(())
    }

    pub fn add_member(&mut self, relation: OsmId, member: Member, index: usize) -> Result<()> {
        self.ensure_live(ExtendedId::relation(relation))?;
        if index > self.relations[&relation].members.len() {
            return Err(Error::invariant(format!(
                "Index {} out of range for relation {}",
                index, relation
            )));
        }
        self.register_comment("add object to relation");
        self.prim_add_member(relation, member, index)?;
        self.refresh_box(ExtendedId::relation(relation))?;
        self.refresh_ancestors(ExtendedId::relation(relation))
    }

    /// Deleting the last member deletes the relation.
    pub fn delete_member(&mut self, relation: OsmId, index: usize) -> Result<()> {
        self.ensure_live(ExtendedId::relation(relation))?;
        if index >= self.relations[&relation].members.len() {
            return Err(Error::invariant(format!(
                "Index {} out of range for relation {}",
                index, relation
            )));
        }
        self.register_comment("delete object from relation");
        self.delete_member_inner(relation, index)
    }

    fn delete_member_inner(&mut self, relation: OsmId, index: usize) -> Result<()> {
        if self.relations[&relation].members.len() == 1 {
            return self.delete_relation_inner(relation);
        }
        self.prim_remove_member(relation, index)?;
        self.refresh_box(ExtendedId::relation(relation))?;
        self.refresh_ancestors(ExtendedId::relation(relation))
    }

    pub fn update_members(&mut self, relation: OsmId, members: Vec<Member>) -> Result<()> {
        self.ensure_live(ExtendedId::relation(relation))?;
        self.register_comment("update relation members");
        self.prim_set_members(relation, members)?;
        self.refresh_box(ExtendedId::relation(relation))?;
        self.refresh_ancestors(ExtendedId::relation(relation))
    }

    fn remove_from_parent_relations(&mut self, ext: ExtendedId) -> Result<()> {
        for relation in self.relations_containing(ext) {
            let mut index = 0;
            loop {
                let target = self
                    .relations
                    .get(&relation)
                    .filter(|r| !r.meta.deleted)
                    .and_then(|r| r.members.get(index))
                    .map(Member::target);
                match target {
                    None => break,
                    Some(target) if target == ext => self.delete_member_inner(relation, index)?,
                    Some(_) => index += 1,
                }
            }
        }
        Ok(())
    }

    /// Only nodes that no way uses can be deleted.
    pub fn delete_node(&mut self, node: OsmId) -> Result<()> {
        self.ensure_live(ExtendedId::node(node))?;
        if self.nodes[&node].way_count != 0 {
            return Err(Error::invariant(format!("Node {} is still part of a way", node)));
        }
        self.register_comment("delete node");
        self.delete_node_inner(node)
    }

    pub(crate) fn delete_node_inner(&mut self, node: OsmId) -> Result<()> {
        let ext = ExtendedId::node(node);
        self.remove_from_parent_relations(ext)?;
        self.prim_set_deleted(ext, true)?;
        self.refresh_box(ext)
    }

    /// Deletes the way along with nodes nothing else needs. Nodes carrying
    /// interesting tags stay behind as points.
    pub fn delete_way(&mut self, way: OsmId) -> Result<()> {
        let ext = ExtendedId::way(way);
        self.ensure_live(ext)?;
        self.register_comment("delete way");
        self.delete_way_inner(way)
    }

    pub(crate) fn delete_way_inner(&mut self, way: OsmId) -> Result<()> {
        let ext = ExtendedId::way(way);
        self.remove_from_parent_relations(ext)?;
        while let Some(&last) = self.ways[&way].nodes.last() {
            let index = self.ways[&way].nodes.len() - 1;
            let preserve = self
                .nodes
                .get(&last)
                .map(|node| tags::has_interesting_tags(&node.meta.tags))
                .unwrap_or(false);
            self.delete_node_from_way_inner(way, index, preserve)?;
        }
        self.prim_set_deleted(ext, true)?;
        self.refresh_box(ext)
    }

    pub fn delete_relation(&mut self, relation: OsmId) -> Result<()> {
        self.ensure_live(ExtendedId::relation(relation))?;
        self.register_comment("delete relation");
        self.delete_relation_inner(relation)
    }

    fn delete_relation_inner(&mut self, relation: OsmId) -> Result<()> {
        let ext = ExtendedId::relation(relation);
        self.remove_from_parent_relations(ext)?;
        while let Some(last) = self.relations[&relation].members.len().checked_sub(1) {
            self.prim_remove_member(relation, last)?;
        }
        self.prim_set_deleted(ext, true)?;
        self.refresh_box(ext)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::data::osm::OsmType;
    use crate::errors::ErrorKind;
    use serde_json::json;

    fn triangle(map: &mut MapData) -> (OsmId, [OsmId; 3]) {
        let a = map.create_node(0.0, 0.0).unwrap();
        let b = map.create_node(0.0, 1.0).unwrap();
        let c = map.create_node(1.0, 1.0).unwrap();
        let way = map.create_way().unwrap();
        for (index, node) in [a, b, c, a].iter().enumerate() {
            map.add_node_to_way(way, *node, index).unwrap();
        }
        (way, [a, b, c])
    }

    #[test]
    fn way_counts_follow_edits() {
        let mut map = MapData::new("mapper");
        let (way, [a, b, _]) = triangle(&mut map);
        assert_eq!(map.node(a).unwrap().way_count, 2);
        assert_eq!(map.node(b).unwrap().way_count, 1);
        map.consistency_check().unwrap();

        map.delete_node_from_way(way, 1, false).unwrap();
        assert!(map.node(b).unwrap().meta.deleted);
        assert_eq!(map.way(way).unwrap().nodes.len(), 3);
        map.consistency_check().unwrap();
    }

    #[test]
    fn removal_collapses_repeated_neighbours() {
        let mut map = MapData::new("mapper");
        let a = map.create_node(0.0, 0.0).unwrap();
        let b = map.create_node(0.0, 1.0).unwrap();
        let way = map.create_way().unwrap();
        for (index, node) in [a, b, a].iter().enumerate() {
            map.add_node_to_way(way, *node, index).unwrap();
        }
        map.delete_node_from_way(way, 1, true).unwrap();
        assert_eq!(map.way(way).unwrap().nodes, vec![a]);
        assert_eq!(map.node(a).unwrap().way_count, 1);
        assert!(!map.node(b).unwrap().meta.deleted);
        map.consistency_check().unwrap();
    }

    #[test]
    fn deleting_a_way_keeps_tagged_nodes() {
        let mut map = MapData::new("mapper");
        let (way, [a, b, c]) = triangle(&mut map);
        let mut shop = Tags::new();
        shop.insert("shop".to_string(), "bakery".to_string());
        map.set_tags(ExtendedId::node(b), &shop).unwrap();

        map.delete_way(way).unwrap();
        assert!(map.way(way).unwrap().meta.deleted);
        assert!(map.node(a).unwrap().meta.deleted);
        assert!(!map.node(b).unwrap().meta.deleted);
        assert!(map.node(c).unwrap().meta.deleted);
        map.consistency_check().unwrap();
    }

    #[test]
    fn deleted_entities_reject_edits() {
        let mut map = MapData::new("mapper");
        let node = map.create_node(1.0, 1.0).unwrap();
        map.delete_node(node).unwrap();
        let err = map.set_location(node, 2.0, 2.0).unwrap_err();
        assert_eq!(err.kind, ErrorKind::Invariant);
        let err = map.set_tags(ExtendedId::node(99), &Tags::new()).unwrap_err();
        assert_eq!(err.kind, ErrorKind::Invariant);
    }

    #[test]
    fn nodes_in_ways_cannot_be_deleted_directly() {
        let mut map = MapData::new("mapper");
        let (_, [a, _, _]) = triangle(&mut map);
        assert!(map.delete_node(a).is_err());
        assert!(!map.node(a).unwrap().meta.deleted);
    }

    #[test]
    fn last_member_takes_relation_with_it() {
        let mut map = MapData::new("mapper");
        let node = map.create_node(1.0, 1.0).unwrap();
        let relation = map.create_relation().unwrap();
        map.add_member(relation, Member::new(OsmType::Node, node, "label"), 0).unwrap();
        assert!(map.spatial().contains(ExtendedId::relation(relation)));

        map.delete_member(relation, 0).unwrap();
        assert!(map.relation(relation).unwrap().meta.deleted);
        assert!(!map.spatial().contains(ExtendedId::relation(relation)));
        map.consistency_check().unwrap();
    }

    #[test]
    fn deleting_a_node_detaches_it_from_relations() {
        let mut map = MapData::new("mapper");
        let a = map.create_node(1.0, 1.0).unwrap();
        let b = map.create_node(2.0, 2.0).unwrap();
        let relation = map.create_relation().unwrap();
        map.add_member(relation, Member::new(OsmType::Node, a, ""), 0).unwrap();
        map.add_member(relation, Member::new(OsmType::Node, b, ""), 1).unwrap();
        map.delete_node(a).unwrap();
        let members = &map.relation(relation).unwrap().members;
        assert_eq!(members.len(), 1);
        assert_eq!(members[0].reference, b);
    }

    #[test]
    fn moving_a_node_moves_parents() {
        let mut map = MapData::new("mapper");
        let (way, [_, _, c]) = triangle(&mut map);
        let relation = map.create_relation().unwrap();
        map.add_member(relation, Member::new(OsmType::Way, way, "outer"), 0).unwrap();

        map.set_location(c, 5.0, 5.0).unwrap();
        let way_box = map.spatial().recorded_box(ExtendedId::way(way)).unwrap();
        let relation_box = map.spatial().recorded_box(ExtendedId::relation(relation)).unwrap();
        assert_eq!(way_box.max_y(), 5.0);
        assert_eq!(relation_box, way_box);
        map.consistency_check().unwrap();
    }

    #[test]
    fn undo_returns_oldest_comment_of_group() {
        let mut map = MapData::new("mapper");
        map.set_comment_provider(Box::new(|operation: &str| json!({ "op": operation })));
        map.tick();
        let node = map.create_node(1.0, 1.0).unwrap();
        map.set_location(node, 2.0, 2.0).unwrap();

        let comment = map.undo().unwrap();
        assert_eq!(comment, Some(json!({"op": "create node"})));
        assert!(map.node(node).unwrap().meta.deleted);
        // the redo group was registered in reverse, so its oldest comment is the move
        let comment = map.redo().unwrap();
        assert_eq!(comment, Some(json!({"op": "move"})));
        assert_eq!(map.node(node).unwrap().lat, 2.0);
    }

    #[test]
    fn tags_are_truncated() {
        let mut map = MapData::new("mapper");
        let node = map.create_node(1.0, 1.0).unwrap();
        let mut long = Tags::new();
        long.insert("note".to_string(), "x".repeat(400));
        map.set_tags(ExtendedId::node(node), &long).unwrap();
        assert_eq!(map.node(node).unwrap().meta.tags["note"].len(), tags::MAX_TAG_LENGTH);
    }
}

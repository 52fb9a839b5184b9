use std::collections::HashMap;

use crate::data::geometry::OsmRect;
use crate::data::osm::ExtendedId;
use crate::spatial::quad_box::{FindObjects, QuadBox};

/// Bounding box index of live entities.
///
/// The box each entity was filed under is remembered, so moving an entity
/// only needs its new box.
#[derive(Debug, Default, Clone)]
pub struct ObjectIndex {
    root: QuadBox,
    boxes: HashMap<ExtendedId, OsmRect>,
}

impl ObjectIndex {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn contains(&self, member: ExtendedId) -> bool {
        self.boxes.contains_key(&member)
    }

    pub fn recorded_box(&self, member: ExtendedId) -> Option<OsmRect> {
        self.boxes.get(&member).copied()
    }

    pub fn len(&self) -> usize {
        self.boxes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.boxes.is_empty()
    }

    /// Files `member` under `bbox`. An entity already present is moved.
    pub fn add_member(&mut self, member: ExtendedId, bbox: OsmRect) {
        if self.boxes.contains_key(&member) {
            self.update_member(member, bbox);
            return;
        }
        self.root.add_member(member, bbox);
        self.boxes.insert(member, bbox);
    }

    /// Returns the box the member was filed under.
    pub fn remove_member(&mut self, member: ExtendedId) -> Option<OsmRect> {
        let bbox = self.boxes.remove(&member)?;
        self.root.remove_member(member, &bbox);
        Some(bbox)
    }

    /// Returns the previous box.
    pub fn update_member(&mut self, member: ExtendedId, bbox: OsmRect) -> Option<OsmRect> {
        let previous = self.remove_member(member);
        self.root.add_member(member, bbox);
        self.boxes.insert(member, bbox);
        previous
    }

    pub fn find_objects(&self, area: OsmRect) -> FindObjects<'_> {
        self.root.find_objects(area)
    }

    pub fn delete_objects(&mut self, mut predicate: impl FnMut(ExtendedId) -> bool) {
        self.root.delete_objects(&mut predicate);
        self.boxes.retain(|id, _| !predicate(*id));
    }

    /// Every indexed member with the box it is filed under, in tree order.
    pub fn members(&self) -> Vec<(ExtendedId, OsmRect)> {
        let mut members = Vec::with_capacity(self.boxes.len());
        self.root.for_each(&mut |quad| members.extend(quad.members.iter().copied()));
        members
    }

    pub fn reset(&mut self) {
        self.root.reset();
        self.boxes.clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::data::geometry::MAP_RECT;

    #[test]
    fn query_only_returns_intersecting_members() {
        let mut index = ObjectIndex::new();
        index.add_member(ExtendedId::node(1), OsmRect::new(1.0, 1.0, 0.0, 0.0));
        index.add_member(ExtendedId::way(2), OsmRect::new(5.0, 5.0, 2.0, 2.0));
        index.add_member(ExtendedId::node(3), OsmRect::new(-50.0, 1.0, 0.0, 0.0));

        let mut found: Vec<_> = index.find_objects(OsmRect::new(0.0, 0.0, 6.0, 6.0)).collect();
        found.sort();
        assert_eq!(found, vec![ExtendedId::node(1), ExtendedId::way(2)]);
    }

    #[test]
    fn update_moves_between_buckets() {
        let mut index = ObjectIndex::new();
        for i in 0..50 {
            index.add_member(ExtendedId::node(i), OsmRect::new(i as f64, 0.5, 0.0, 0.0));
        }
        let previous = index.update_member(ExtendedId::node(7), OsmRect::new(-120.0, -40.0, 0.0, 0.0));
        assert_eq!(previous, Some(OsmRect::new(7.0, 0.5, 0.0, 0.0)));
        assert_eq!(index.find_objects(OsmRect::new(6.5, 0.0, 1.0, 1.0)).count(), 0);
        assert_eq!(
            index.find_objects(OsmRect::new(-121.0, -41.0, 2.0, 2.0)).collect::<Vec<_>>(),
            vec![ExtendedId::node(7)]
        );
        assert_eq!(index.members().len(), 50);
    }

    #[test]
    fn delete_by_predicate() {
        let mut index = ObjectIndex::new();
        index.add_member(ExtendedId::node(1), OsmRect::new(1.0, 1.0, 0.0, 0.0));
        index.add_member(ExtendedId::node(2), OsmRect::new(2.0, 1.0, 0.0, 0.0));
        index.delete_objects(|id| id.id == 1);
        assert_eq!(index.find_objects(MAP_RECT).collect::<Vec<_>>(), vec![ExtendedId::node(2)]);
        assert!(!index.contains(ExtendedId::node(1)));
    }
}

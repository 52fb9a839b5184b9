//! Edits built from several primitives: split, join, reverse, merge and
//! duplicate. Each lands in an undo group of its own, and one that fails
//! halfway is rolled back through that group.

use std::collections::BTreeSet;

use log::error;

use crate::data::osm::{ExtendedId, Member, OsmId, OsmType, Relation, Way};
use crate::data::tags::{self, Tags};
use crate::errors::{Error, Result};
use crate::map_data::MapData;

/// Longest way a join may produce.
pub const MAX_WAY_NODES: usize = 2000;

fn is_restriction(relation: &Relation) -> bool {
    relation.meta.tags.get("type").map(String::as_str) == Some("restriction")
}

/// Whether the two ways share an end node.
fn connects(a: &Way, b: &Way) -> bool {
    let ends = |way: &Way| [way.nodes.first().copied(), way.nodes.last().copied()];
    ends(a)
        .into_iter()
        .flatten()
        .any(|node| ends(b).contains(&Some(node)))
}

fn reverse_role(role: &str) -> &str {
    match role {
        "forward" => "backward",
        "backward" => "forward",
        "north" => "south",
        "south" => "north",
        "east" => "west",
        "west" => "east",
        _ => role,
    }
}

impl MapData {
    /// Runs `edit` as one undo group headed by `comment`.
    fn grouped<T>(&mut self, comment: &str, edit: impl FnOnce(&mut Self) -> Result<T>) -> Result<T> {
        self.tick();
        self.begin_undo_grouping();
        let recorded = self.undo.undo_len();
        self.register_comment(comment);
        let result = edit(self);
        self.end_undo_grouping();
        if let Err(err) = &result {
            error!(operation = comment, error = err.message.as_str(); "Edit failed, reverting it");
            if self.undo.undo_len() > recorded && self.undo().is_ok() {
                self.remove_most_recent_redo();
            }
        }
        result
    }

    fn live_way(&self, id: OsmId) -> Result<&Way> {
        self.ensure_live(ExtendedId::way(id))?;
        self.way(id)
            .ok_or_else(|| Error::invariant(format!("No such way {}", id)))
    }

    fn refresh_way(&mut self, way: OsmId) -> Result<()> {
        self.refresh_box(ExtendedId::way(way))?;
        self.refresh_ancestors(ExtendedId::way(way))
    }

    fn restricted(&self, ext: ExtendedId) -> bool {
        self.relations_containing(ext)
            .iter()
            .filter_map(|id| self.relation(*id))
            .any(is_restriction)
    }

    /// Splits `way` at `node` and returns the new way, which carries the
    /// same tags and memberships. A closed way is cut a second time at the
    /// node across from `node`.
    pub fn split_way(&mut self, way: OsmId, node: OsmId) -> Result<OsmId> {
        let current = self.live_way(way)?;
        let closed = current.is_closed();
        let position = current.nodes.iter().position(|id| *id == node);
        match position {
            None => return Err(Error::invariant(format!("Node {} is not part of way {}", node, way))),
            Some(index) if !closed && (index == 0 || index + 1 == current.nodes.len()) => {
                return Err(Error::invariant(format!("Way {} cannot be split at an end", way)))
            }
            Some(_) => (),
        }
        if closed && current.nodes.len() < 4 {
            return Err(Error::invariant(format!("Way {} is too short to split", way)));
        }
        if self.restricted(ExtendedId::way(way)) {
            return Err(Error::invariant(format!("Way {} is part of a turn restriction", way)));
        }
        self.grouped("split", |map| map.split_way_inner(way, node, closed))
    }

    fn split_way_inner(&mut self, way: OsmId, node: OsmId, closed: bool) -> Result<OsmId> {
        let tags = self.ways[&way].meta.tags.clone();
        let split = self.create_way()?;
        self.prim_set_tags(ExtendedId::way(split), tags)?;

        if closed {
            let last = self.ways[&way].nodes.len() - 1;
            self.prim_remove_node(way, last)?;
            let nodes = self.ways[&way].nodes.clone();
            let start = nodes.iter().position(|id| *id == node).unwrap_or(0);
            let opposite = self.opposite_node(&nodes, start);
            let mut index = opposite;
            while index != start {
                let len = self.ways[&split].nodes.len();
                self.prim_add_node(split, nodes[index], len)?;
                index = (index + 1) % nodes.len();
            }
            for moved in self.ways[&split].nodes.clone() {
                if let Some(index) = self.ways[&way].nodes.iter().position(|id| *id == moved) {
                    self.prim_remove_node(way, index)?;
                }
            }
            while self.ways[&way].nodes.first() != Some(&node) {
                let first = self.ways[&way].nodes[0];
                let len = self.ways[&way].nodes.len();
                self.prim_add_node(way, first, len)?;
                self.prim_remove_node(way, 0)?;
            }
            let split_first = self.ways[&split].nodes[0];
            let len = self.ways[&way].nodes.len();
            self.prim_add_node(way, split_first, len)?;
            let len = self.ways[&split].nodes.len();
            self.prim_add_node(split, node, len)?;
        } else {
            self.prim_add_node(split, node, 0)?;
            let index = self.ways[&way].nodes.iter().position(|id| *id == node).unwrap_or(0) + 1;
            while index < self.ways[&way].nodes.len() {
                let moved = self.ways[&way].nodes[index];
                let len = self.ways[&split].nodes.len();
                self.prim_add_node(split, moved, len)?;
                self.prim_remove_node(way, index)?;
            }
        }

        // the new way joins every relation of the old one, next to it
        for relation in self.relations_containing(ExtendedId::way(way)) {
            let members = &self.relations[&relation].members;
            let Some(index) = members.iter().position(|member| member.target() == ExtendedId::way(way)) else {
                continue;
            };
            let role = members[index].role.clone();
            let before = index
                .checked_sub(1)
                .map(|previous| members[previous].target())
                .filter(|previous| previous.kind == OsmType::Way)
                .and_then(|previous| self.way(previous.id))
                .zip(self.way(split))
                .map_or(false, |(previous, split)| connects(previous, split));
            let at = if before { index } else { index + 1 };
            self.prim_add_member(relation, Member::new(OsmType::Way, split, &role), at)?;
        }

        self.refresh_way(way)?;
        self.refresh_way(split)?;
        Ok(split)
    }

    /// Index of the node a closed ring is best cut at, opposite `start`: far
    /// along the ring but close as the crow flies.
    fn opposite_node(&self, ring: &[OsmId], start: usize) -> usize {
        let count = ring.len();
        let point = |index: usize| self.nodes.get(&ring[index]).map(|node| node.location()).unwrap_or_default();
        let distance = |a: usize, b: usize| {
            let (p, q) = (point(a), point(b));
            ((p.x - q.x).powi(2) + (p.y - q.y).powi(2)).sqrt()
        };

        let mut along = vec![0.0; count];
        let mut length = 0.0;
        let mut index = (start + 1) % count;
        while index != start {
            length += distance(index, (index + count - 1) % count);
            along[index] = length;
            index = (index + 1) % count;
        }
        length = 0.0;
        index = (start + count - 1) % count;
        while index != start {
            length += distance(index, (index + 1) % count);
            if length < along[index] {
                along[index] = length;
            }
            index = (index + count - 1) % count;
        }

        let mut best = 0.0;
        let mut opposite = (start + count / 2) % count;
        for (index, walked) in along.iter().enumerate() {
            if index == start {
                continue;
            }
            let beeline = distance(start, index);
            if beeline > 0.0 && walked / beeline > best {
                best = walked / beeline;
                opposite = index;
            }
        }
        opposite
    }

    /// Joins `way` with the one other way ending at `node`. The older way
    /// survives and is returned; the other is deleted.
    pub fn join_ways(&mut self, way: OsmId, node: OsmId) -> Result<OsmId> {
        let selected = self.live_way(way)?;
        if selected.nodes.first() != Some(&node) && selected.nodes.last() != Some(&node) {
            return Err(Error::invariant(format!("Node {} does not end way {}", node, way)));
        }
        let candidates: Vec<&Way> = self
            .ways_containing(node)
            .into_iter()
            .filter(|id| *id != way)
            .filter_map(|id| self.way(id))
            .filter(|other| other.nodes.first() == Some(&node) || other.nodes.last() == Some(&node))
            .collect();
        let matching: Vec<&Way> = candidates
            .iter()
            .copied()
            .filter(|other| other.meta.tags == selected.meta.tags)
            .collect();
        let others = if matching.is_empty() { candidates } else { matching };
        let other = match others[..] {
            [only] => only,
            [] => return Err(Error::invariant(format!("No way to join at node {}", node))),
            _ => return Err(Error::invariant(format!("Joining at node {} is ambiguous", node))),
        };
        if selected.nodes.len() + other.nodes.len() > MAX_WAY_NODES {
            return Err(Error::invariant(format!("Joined way would exceed {} nodes", MAX_WAY_NODES)));
        }
        let merged_tags = tags::merge(&selected.meta.tags, &other.meta.tags)
            .ok_or_else(|| Error::invariant("The ways carry conflicting tags"))?;

        let (selected_ext, other_ext) = (ExtendedId::way(way), ExtendedId::way(other.meta.id));
        let shared: BTreeSet<OsmId> = self
            .relations_containing(selected_ext)
            .into_iter()
            .filter(|id| self.relations_containing(other_ext).contains(id))
            .collect();
        for relation in shared.iter().filter_map(|id| self.relation(*id)) {
            let via = |ext| {
                relation
                    .members
                    .iter()
                    .any(|member| member.target() == ext && member.role == "via")
            };
            if is_restriction(relation) && !(via(selected_ext) && via(other_ext)) {
                return Err(Error::invariant("Joining would break a turn restriction"));
            }
        }

        let (mut keep, mut gone) = (selected, other);
        if keep.meta.version < gone.meta.version || (keep.meta.id < 0 && gone.meta.id > 0) {
            std::mem::swap(&mut keep, &mut gone);
        }
        let (keep, gone) = (keep.meta.id, gone.meta.id);
        self.grouped("join", |map| map.join_ways_inner(keep, gone, merged_tags))
    }

    fn join_ways_inner(&mut self, keep: OsmId, gone: OsmId, merged_tags: Tags) -> Result<OsmId> {
        let kept = self.ways[&keep].nodes.clone();
        let mut other = self.ways[&gone].nodes.clone();
        let (first, last) = (kept[0], kept[kept.len() - 1]);
        if last != other[0] && (last == other[other.len() - 1] || first == other[0]) {
            // walking the other way flips its direction tags too
            self.reverse_way_inner(gone)?;
            other = self.ways[&gone].nodes.clone();
        }
        if last == other[0] {
            for node in other.into_iter().skip(1) {
                let len = self.ways[&keep].nodes.len();
                self.prim_add_node(keep, node, len)?;
            }
        } else {
            for node in other.into_iter().rev().skip(1) {
                self.prim_add_node(keep, node, 0)?;
            }
        }
        self.prim_set_tags(ExtendedId::way(keep), merged_tags)?;
        self.delete_way_inner(gone)?;
        self.refresh_way(keep)?;
        Ok(keep)
    }

    /// Reverses the node order of `way` along with every tag, node direction
    /// and relation role that depends on it.
    pub fn reverse_way(&mut self, way: OsmId) -> Result<()> {
        self.live_way(way)?;
        self.grouped("reverse", |map| map.reverse_way_inner(way))
    }

    fn reverse_way_inner(&mut self, way: OsmId) -> Result<()> {
        let count = self.ways[&way].nodes.len();
        for index in 0..count.saturating_sub(1) {
            let node = self.prim_remove_node(way, count - 1)?;
            self.prim_add_node(way, node, index)?;
        }

        let ext = ExtendedId::way(way);
        let reversed: Tags = self.ways[&way]
            .meta
            .tags
            .iter()
            .map(|(key, value)| (tags::reverse_key(key), tags::reverse_value(key, value)))
            .collect();
        if reversed != self.ways[&way].meta.tags {
            self.prim_set_tags(ext, reversed)?;
        }

        let nodes: BTreeSet<OsmId> = self.ways[&way].nodes.iter().copied().collect();
        for node in nodes {
            let Some(current) = self.nodes.get(&node) else {
                continue;
            };
            let flipped = match current.meta.tags.get("direction").map(String::as_str) {
                Some("forward") => "backward",
                Some("backward") => "forward",
                _ => continue,
            };
            let mut node_tags = current.meta.tags.clone();
            node_tags.insert("direction".to_string(), flipped.to_string());
            self.prim_set_tags(ExtendedId::node(node), node_tags)?;
        }

        for relation in self.relations_containing(ext) {
            let members = self.relations[&relation].members.clone();
            let flipped: Vec<Member> = members
                .iter()
                .map(|member| {
                    let mut member = member.clone();
                    if member.target() == ext {
                        member.role = reverse_role(&member.role).to_string();
                    }
                    member
                })
                .collect();
            if flipped != members {
                self.prim_set_members(relation, flipped)?;
            }
        }
        self.refresh_way(way)
    }

    /// Merges `node` into `into`, as when dragging one onto the other. The
    /// node with more history survives, takes the other's position when it
    /// moves and replaces it in every way and relation. Returns the survivor.
    pub fn merge_nodes(&mut self, node: OsmId, into: OsmId) -> Result<OsmId> {
        self.ensure_live(ExtendedId::node(node))?;
        self.ensure_live(ExtendedId::node(into))?;
        if node == into {
            return Err(Error::invariant(format!("Node {} cannot merge with itself", node)));
        }
        let (first, second) = (&self.nodes[&node], &self.nodes[&into]);
        let merged_tags = tags::merge(&first.meta.tags, &second.meta.tags)
            .ok_or_else(|| Error::invariant("The nodes carry conflicting tags"))?;
        let survivor = if first.meta.id < 0 {
            into
        } else if second.meta.id < 0 || first.way_count > second.way_count {
            node
        } else {
            into
        };
        let dead = if survivor == node { into } else { node };

        let mut roles: Vec<(OsmId, String)> = Vec::new();
        for id in [survivor, dead] {
            let ext = ExtendedId::node(id);
            let in_restriction = self.restricted(ext)
                || self
                    .ways_containing(id)
                    .into_iter()
                    .any(|way| self.restricted(ExtendedId::way(way)));
            if in_restriction {
                return Err(Error::invariant("Merging would damage a turn restriction"));
            }
            for relation in self.relations_containing(ext) {
                let role = self.relations[&relation]
                    .members
                    .iter()
                    .find(|member| member.target() == ext)
                    .map(|member| member.role.clone())
                    .unwrap_or_default();
                if roles.iter().any(|(seen, other)| *seen == relation && *other != role) {
                    return Err(Error::invariant("The nodes have different roles in a relation"));
                }
                roles.push((relation, role));
            }
        }
        for way in self.ways_containing(dead) {
            let remaining: BTreeSet<OsmId> = self.ways[&way]
                .nodes
                .iter()
                .map(|id| if *id == dead { survivor } else { *id })
                .collect();
            if remaining.len() < 2 {
                return Err(Error::invariant(format!("Merging would collapse way {}", way)));
            }
        }

        let location = (self.nodes[&into].lat, self.nodes[&into].lon);
        self.grouped("merge nodes", |map| map.merge_nodes_inner(survivor, dead, location, merged_tags))
    }

    fn merge_nodes_inner(&mut self, survivor: OsmId, dead: OsmId, location: (f64, f64), merged_tags: Tags) -> Result<OsmId> {
        let survivor_ext = ExtendedId::node(survivor);
        if (self.nodes[&survivor].lat, self.nodes[&survivor].lon) != location {
            self.prim_set_location(survivor, location.0, location.1)?;
        }
        if self.nodes[&survivor].meta.tags != merged_tags {
            self.prim_set_tags(survivor_ext, merged_tags)?;
        }

        let ways = self.ways_containing(dead);
        for way in &ways {
            while let Some(index) = self.ways[way].nodes.iter().position(|id| *id == dead) {
                self.prim_add_node(*way, survivor, index)?;
                self.prim_remove_node(*way, index + 1)?;
            }
            // the two nodes may have been neighbours
            let mut index = 1;
            while index < self.ways[way].nodes.len() {
                if self.ways[way].nodes[index - 1] == self.ways[way].nodes[index] {
                    self.prim_remove_node(*way, index)?;
                } else {
                    index += 1;
                }
            }
        }

        let dead_ext = ExtendedId::node(dead);
        for relation in self.relations_containing(dead_ext) {
            let members: Vec<Member> = self.relations[&relation]
                .members
                .iter()
                .map(|member| {
                    let mut member = member.clone();
                    if member.target() == dead_ext {
                        member.reference = survivor;
                    }
                    member
                })
                .collect();
            self.prim_set_members(relation, members)?;
        }
        self.delete_node_inner(dead)?;

        self.refresh_box(survivor_ext)?;
        self.refresh_ancestors(survivor_ext)?;
        for way in self.ways_containing(survivor) {
            self.refresh_way(way)?;
        }
        Ok(survivor)
    }

    /// Copies a node, a way with its nodes or a multipolygon with its ways,
    /// shifted by the given offset. Other relations are not copied and give
    /// `None`.
    pub fn duplicate(&mut self, target: ExtendedId, lat_offset: f64, lon_offset: f64) -> Result<Option<ExtendedId>> {
        self.ensure_live(target)?;
        match target.kind {
            OsmType::Node => self.grouped("duplicate", |map| {
                map.duplicate_node(target.id, lat_offset, lon_offset)
                    .map(|id| Some(ExtendedId::node(id)))
            }),
            OsmType::Way => self.grouped("duplicate", |map| {
                map.duplicate_way(target.id, lat_offset, lon_offset)
                    .map(|id| Some(ExtendedId::way(id)))
            }),
            OsmType::Relation if self.relations[&target.id].is_multipolygon() => self.grouped("duplicate", |map| {
                map.duplicate_multipolygon(target.id, lat_offset, lon_offset)
                    .map(|id| Some(ExtendedId::relation(id)))
            }),
            OsmType::Relation => Ok(None),
        }
    }

    fn duplicate_node(&mut self, node: OsmId, lat_offset: f64, lon_offset: f64) -> Result<OsmId> {
        let source = &self.nodes[&node];
        let (lat, lon, tags) = (source.lat + lat_offset, source.lon + lon_offset, source.meta.tags.clone());
        let copy = self.create_node(lat, lon)?;
        if !tags.is_empty() {
            self.prim_set_tags(ExtendedId::node(copy), tags)?;
        }
        Ok(copy)
    }

    fn duplicate_way(&mut self, way: OsmId, lat_offset: f64, lon_offset: f64) -> Result<OsmId> {
        let source = self.ways[&way].clone();
        let copy = self.create_way()?;
        let mut copies: Vec<(OsmId, OsmId)> = Vec::new();
        for (index, node) in source.nodes.iter().enumerate() {
            let duplicate = match copies.iter().find(|(original, _)| original == node) {
                Some((_, duplicate)) => *duplicate,
                None => {
                    let duplicate = self.duplicate_node(*node, lat_offset, lon_offset)?;
                    copies.push((*node, duplicate));
                    duplicate
                }
            };
            self.prim_add_node(copy, duplicate, index)?;
        }
        if !source.meta.tags.is_empty() {
            self.prim_set_tags(ExtendedId::way(copy), source.meta.tags)?;
        }
        self.refresh_box(ExtendedId::way(copy))?;
        Ok(copy)
    }

    fn duplicate_multipolygon(&mut self, relation: OsmId, lat_offset: f64, lon_offset: f64) -> Result<OsmId> {
        let source = self.relations[&relation].clone();
        let copy = self.create_relation()?;
        let mut copies: Vec<(OsmId, OsmId)> = Vec::new();
        for member in source.members.iter().filter(|member| member.kind == OsmType::Way) {
            if !self.ways.contains_key(&member.reference) {
                continue;
            }
            let duplicate = match copies.iter().find(|(original, _)| *original == member.reference) {
                Some((_, duplicate)) => *duplicate,
                None => {
                    let duplicate = self.duplicate_way(member.reference, lat_offset, lon_offset)?;
                    copies.push((member.reference, duplicate));
                    duplicate
                }
            };
            let len = self.relations[&copy].members.len();
            self.prim_add_member(copy, Member::new(OsmType::Way, duplicate, &member.role), len)?;
        }
        self.prim_set_tags(ExtendedId::relation(copy), source.meta.tags)?;
        self.refresh_box(ExtendedId::relation(copy))?;
        Ok(copy)
    }
}

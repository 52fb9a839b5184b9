//! The entity graph: arenas keyed by id, the two quadtrees and the undo log.
//!
//! Every cross-entity reference is an id resolved through the arenas. Edits
//! go through undoable primitives that register their own inverse, so replay
//! and editing share one code path.

use std::collections::{BTreeSet, HashMap, HashSet};

use log::{error, warn};

use crate::data::geometry::{OsmPoint, OsmRect};
use crate::data::osm::{EntityMeta, EntityRef, ExtendedId, Member, Node, OsmId, OsmType, Relation, Way};
use crate::data::tags::Tags;
use crate::data::OsmDownloadData;
use crate::errors::{Error, Result};
use crate::spatial::objects::ObjectIndex;
use crate::spatial::region::RegionIndex;
use crate::undo::{Action, ReplayMode, UndoComment, UndoEntry, UndoManager};

pub mod compound;
pub mod edit;
pub mod merge;
pub mod purge;

/// Produces the caller context stored with each edit.
pub type CommentProvider = Box<dyn Fn(&str) -> UndoComment + Send>;

pub struct MapData {
    pub(crate) nodes: HashMap<OsmId, Node>,
    pub(crate) ways: HashMap<OsmId, Way>,
    pub(crate) relations: HashMap<OsmId, Relation>,
    pub(crate) region: RegionIndex,
    pub(crate) spatial: ObjectIndex,
    pub(crate) undo: UndoManager,
    next_placeholder: OsmId,
    user: String,
    comment_provider: Option<CommentProvider>,
}

impl Default for MapData {
    fn default() -> Self {
        MapData::new("")
    }
}

enum Saved {
    Node(Node),
    Way(Way),
    Relation(Relation),
}

/// State of the entities a replay or merge touches, taken before it starts.
struct Snapshot {
    entries: Vec<(ExtendedId, Option<Saved>, Option<OsmRect>)>,
}

impl MapData {
    pub fn new(user: &str) -> Self {
        MapData {
            nodes: HashMap::new(),
            ways: HashMap::new(),
            relations: HashMap::new(),
            region: RegionIndex::new(),
            spatial: ObjectIndex::new(),
            undo: UndoManager::new(),
            next_placeholder: -1,
            user: user.to_string(),
            comment_provider: None,
        }
    }

    pub fn set_comment_provider(&mut self, provider: CommentProvider) {
        self.comment_provider = Some(provider);
    }

    pub fn user(&self) -> &str {
        &self.user
    }

    pub fn node(&self, id: OsmId) -> Option<&Node> {
        self.nodes.get(&id)
    }

    pub fn way(&self, id: OsmId) -> Option<&Way> {
        self.ways.get(&id)
    }

    pub fn relation(&self, id: OsmId) -> Option<&Relation> {
        self.relations.get(&id)
    }

    pub fn entity(&self, ext: ExtendedId) -> Option<EntityRef<'_>> {
        match ext.kind {
            OsmType::Node => self.nodes.get(&ext.id).map(EntityRef::Node),
            OsmType::Way => self.ways.get(&ext.id).map(EntityRef::Way),
            OsmType::Relation => self.relations.get(&ext.id).map(EntityRef::Relation),
        }
    }

    pub fn contains(&self, ext: ExtendedId) -> bool {
        match ext.kind {
            OsmType::Node => self.nodes.contains_key(&ext.id),
            OsmType::Way => self.ways.contains_key(&ext.id),
            OsmType::Relation => self.relations.contains_key(&ext.id),
        }
    }

    pub fn node_count(&self) -> usize {
        self.nodes.len()
    }

    pub fn way_count(&self) -> usize {
        self.ways.len()
    }

    pub fn relation_count(&self) -> usize {
        self.relations.len()
    }

    pub fn object_count(&self) -> usize {
        self.nodes.len() + self.ways.len() + self.relations.len()
    }

    pub fn nodes(&self) -> impl Iterator<Item = &Node> {
        self.nodes.values()
    }

    pub fn ways(&self) -> impl Iterator<Item = &Way> {
        self.ways.values()
    }

    pub fn relations(&self) -> impl Iterator<Item = &Relation> {
        self.relations.values()
    }

    pub fn region(&self) -> &RegionIndex {
        &self.region
    }

    pub fn region_mut(&mut self) -> &mut RegionIndex {
        &mut self.region
    }

    pub fn spatial(&self) -> &ObjectIndex {
        &self.spatial
    }

    pub fn undo_manager(&self) -> &UndoManager {
        &self.undo
    }

    pub fn next_placeholder(&self) -> OsmId {
        self.next_placeholder
    }

    /// Used when restoring a session so placeholders never collide.
    pub fn restore_session_state(&mut self, undo: UndoManager, region: RegionIndex, next_placeholder: OsmId) {
        self.undo = undo;
        self.region = region;
        self.next_placeholder = next_placeholder.min(-1);
    }

    /// Loads entities from the local cache, then the saved edits on top of
    /// them. Edited copies replace cached ones as they are, modification
    /// counts included.
    pub fn restore_entities(&mut self, cached: OsmDownloadData, edited: OsmDownloadData) {
        for data in [cached, edited] {
            self.nodes
                .extend(data.nodes.into_iter().map(|node| (node.meta.id, node)));
            self.ways
                .extend(data.ways.into_iter().map(|way| (way.meta.id, way)));
            self.relations.extend(
                data.relations
                    .into_iter()
                    .map(|relation| (relation.meta.id, relation)),
            );
        }
        self.rebuild_derived_state();
    }

    pub(crate) fn allocate_placeholder(&mut self) -> OsmId {
        let id = self.next_placeholder;
        self.next_placeholder -= 1;
        id
    }

    // Undo interface

    pub fn tick(&mut self) {
        self.undo.tick();
    }

    pub fn begin_undo_grouping(&mut self) {
        self.undo.begin_grouping();
    }

    pub fn end_undo_grouping(&mut self) {
        self.undo.end_grouping();
    }

    pub fn can_undo(&self) -> bool {
        self.undo.can_undo()
    }

    pub fn can_redo(&self) -> bool {
        self.undo.can_redo()
    }

    pub fn remove_most_recent_redo(&mut self) {
        self.undo.remove_most_recent_redo();
    }

    pub fn clear_undo_stack(&mut self) {
        self.undo.remove_all_actions();
    }

    pub(crate) fn register_comment(&mut self, operation: &str) {
        if let Some(provider) = &self.comment_provider {
            let comment = provider(operation);
            self.undo.register_comment(comment);
        }
    }

    /// Reverts the most recent group of edits. Returns the oldest comment
    /// registered with that group.
    pub fn undo(&mut self) -> Result<Option<UndoComment>> {
        self.replay(ReplayMode::Undoing)
    }

    pub fn redo(&mut self) -> Result<Option<UndoComment>> {
        self.replay(ReplayMode::Redoing)
    }

    fn replay(&mut self, mode: ReplayMode) -> Result<Option<UndoComment>> {
        let pending = match mode {
            ReplayMode::Undoing => self.undo.can_undo(),
            ReplayMode::Redoing => self.undo.can_redo(),
            ReplayMode::Normal => false,
        };
        if !pending {
            return Ok(None);
        }
        let entries = self.undo.begin_replay(mode);
        let snapshot = self.snapshot(&entries);

        let mut comment = None;
        let mut failure = None;
        for entry in entries.iter().rev() {
            match self.apply(&entry.action) {
                Ok(Some(text)) => comment = Some(text),
                Ok(None) => {}
                Err(err) => {
                    failure = Some(err);
                    break;
                }
            }
        }

        match failure {
            None => {
                self.undo.end_replay();
                Ok(comment)
            }
            Some(err) => {
                self.restore(snapshot);
                self.undo.abort_replay(mode, entries);
                error!(err = err.message.as_str(); "Replay failed, group left in place");
                Err(Error::invariant(format!("Replay aborted: {}", err.message)))
            }
        }
    }

    fn snapshot(&self, entries: &[UndoEntry]) -> Snapshot {
        let mut touched = BTreeSet::new();
        for entry in entries {
            let Some(target) = entry.action.target() else {
                continue;
            };
            touched.insert(target);
            if let Some(way) = self.ways.get(&target.id).filter(|_| target.kind == OsmType::Way) {
                touched.extend(way.nodes.iter().map(|id| ExtendedId::node(*id)));
            }
            if let Action::AddNode { node, .. } = &entry.action {
                touched.insert(ExtendedId::node(*node));
            }
        }
        self.snapshot_of(touched)
    }

    /// Copies of `touched` entities and their index entries, for rolling
    /// back an operation that failed halfway.
    fn snapshot_of(&self, touched: BTreeSet<ExtendedId>) -> Snapshot {
        let entries = touched
            .into_iter()
            .map(|ext| {
                let saved = match ext.kind {
                    OsmType::Node => self.nodes.get(&ext.id).cloned().map(Saved::Node),
                    OsmType::Way => self.ways.get(&ext.id).cloned().map(Saved::Way),
                    OsmType::Relation => self.relations.get(&ext.id).cloned().map(Saved::Relation),
                };
                (ext, saved, self.spatial.recorded_box(ext))
            })
            .collect();
        Snapshot { entries }
    }

    fn restore(&mut self, snapshot: Snapshot) {
        for (ext, saved, bbox) in snapshot.entries {
            match saved {
                Some(Saved::Node(node)) => {
                    self.nodes.insert(ext.id, node);
                }
                Some(Saved::Way(way)) => {
                    self.ways.insert(ext.id, way);
                }
                Some(Saved::Relation(relation)) => {
                    self.relations.insert(ext.id, relation);
                }
                None => {
                    self.remove_from_arena(ext);
                }
            }
            self.spatial.remove_member(ext);
            if let Some(bbox) = bbox {
                self.spatial.add_member(ext, bbox);
            }
        }
    }

    pub(crate) fn remove_from_arena(&mut self, ext: ExtendedId) {
        match ext.kind {
            OsmType::Node => {
                self.nodes.remove(&ext.id);
            }
            OsmType::Way => {
                self.ways.remove(&ext.id);
            }
            OsmType::Relation => {
                self.relations.remove(&ext.id);
            }
        }
    }

    // Primitives. Each one mutates and registers its own inverse.

    pub(crate) fn apply(&mut self, action: &Action) -> Result<Option<UndoComment>> {
        match action.clone() {
            Action::Comment { comment } => {
                self.undo.register_comment(comment.clone());
                return Ok(Some(comment));
            }
            Action::SetTags { target, tags } => self.prim_set_tags(target, tags)?,
            Action::SetLocation { node, lat, lon } => self.prim_set_location(node, lat, lon)?,
            Action::SetDeleted { target, deleted } => self.prim_set_deleted(target, deleted)?,
            Action::AddNode { way, node, index } => self.prim_add_node(way, node, index)?,
            Action::RemoveNode { way, index } => {
                self.prim_remove_node(way, index)?;
            }
            Action::AddMember {
                relation,
                member,
                index,
            } => self.prim_add_member(relation, member, index)?,
            Action::RemoveMember { relation, index } => {
                self.prim_remove_member(relation, index)?;
            }
            Action::SetMembers { relation, members } => self.prim_set_members(relation, members)?,
            Action::SpatialAdd { target, bbox } => self.prim_spatial_add(target, bbox),
            Action::SpatialRemove { target } => self.prim_spatial_remove(target)?,
            Action::SpatialUpdate { target, to } => self.prim_spatial_update(target, to),
        }
        Ok(None)
    }

    pub(crate) fn meta_mut(&mut self, ext: ExtendedId) -> Result<&mut EntityMeta> {
        let meta = match ext.kind {
            OsmType::Node => self.nodes.get_mut(&ext.id).map(|node| &mut node.meta),
            OsmType::Way => self.ways.get_mut(&ext.id).map(|way| &mut way.meta),
            OsmType::Relation => self.relations.get_mut(&ext.id).map(|relation| &mut relation.meta),
        };
        meta.ok_or_else(|| Error::invariant(format!("No such entity {}", ext)))
    }

    fn way_mut(&mut self, id: OsmId) -> Result<&mut Way> {
        self.ways
            .get_mut(&id)
            .ok_or_else(|| Error::invariant(format!("No such way {}", id)))
    }

    fn relation_mut(&mut self, id: OsmId) -> Result<&mut Relation> {
        self.relations
            .get_mut(&id)
            .ok_or_else(|| Error::invariant(format!("No such relation {}", id)))
    }

    pub(crate) fn prim_set_tags(&mut self, target: ExtendedId, tags: Tags) -> Result<()> {
        let undoing = self.undo.is_undoing();
        let previous = {
            let meta = self.meta_mut(target)?;
            meta.touch(undoing);
            std::mem::replace(&mut meta.tags, tags)
        };
        self.undo.register(Action::SetTags {
            target,
            tags: previous,
        });
        Ok(())
    }

    pub(crate) fn prim_set_location(&mut self, id: OsmId, lat: f64, lon: f64) -> Result<()> {
        let undoing = self.undo.is_undoing();
        let node = self
            .nodes
            .get_mut(&id)
            .ok_or_else(|| Error::invariant(format!("No such node {}", id)))?;
        node.meta.touch(undoing);
        let previous = (node.lat, node.lon);
        node.lat = lat;
        node.lon = lon;
        self.undo.register(Action::SetLocation {
            node: id,
            lat: previous.0,
            lon: previous.1,
        });
        Ok(())
    }

    pub(crate) fn prim_set_deleted(&mut self, target: ExtendedId, deleted: bool) -> Result<()> {
        let undoing = self.undo.is_undoing();
        let previous = {
            let meta = self.meta_mut(target)?;
            meta.touch(undoing);
            std::mem::replace(&mut meta.deleted, deleted)
        };
        self.undo.register(Action::SetDeleted {
            target,
            deleted: previous,
        });
        Ok(())
    }

    pub(crate) fn prim_add_node(&mut self, way_id: OsmId, node_id: OsmId, index: usize) -> Result<()> {
        if !self.nodes.contains_key(&node_id) {
            return Err(Error::invariant(format!("No such node {}", node_id)));
        }
        let undoing = self.undo.is_undoing();
        let way = self.way_mut(way_id)?;
        if index > way.nodes.len() {
            return Err(Error::invariant(format!("Index {} out of range for way {}", index, way_id)));
        }
        way.nodes.insert(index, node_id);
        way.meta.touch(undoing);
        if let Some(node) = self.nodes.get_mut(&node_id) {
            node.way_count += 1;
        }
        self.undo.register(Action::RemoveNode { way: way_id, index });
        Ok(())
    }

    pub(crate) fn prim_remove_node(&mut self, way_id: OsmId, index: usize) -> Result<OsmId> {
        let undoing = self.undo.is_undoing();
        let way = self.way_mut(way_id)?;
        if index >= way.nodes.len() {
            return Err(Error::invariant(format!("Index {} out of range for way {}", index, way_id)));
        }
        let node_id = way.nodes.remove(index);
        way.meta.touch(undoing);
        if let Some(node) = self.nodes.get_mut(&node_id) {
            node.way_count = node.way_count.saturating_sub(1);
        }
        self.undo.register(Action::AddNode {
            way: way_id,
            node: node_id,
            index,
        });
        Ok(node_id)
    }

    pub(crate) fn prim_add_member(&mut self, relation_id: OsmId, mut member: Member, index: usize) -> Result<()> {
        member.resolved = self.contains(member.target());
        let undoing = self.undo.is_undoing();
        let relation = self.relation_mut(relation_id)?;
        if index > relation.members.len() {
            return Err(Error::invariant(format!(
                "Index {} out of range for relation {}",
                index, relation_id
            )));
        }
        relation.members.insert(index, member);
        relation.meta.touch(undoing);
        self.undo.register(Action::RemoveMember {
            relation: relation_id,
            index,
        });
        Ok(())
    }

    pub(crate) fn prim_remove_member(&mut self, relation_id: OsmId, index: usize) -> Result<Member> {
        let undoing = self.undo.is_undoing();
        let relation = self.relation_mut(relation_id)?;
        if index >= relation.members.len() {
            return Err(Error::invariant(format!(
                "Index {} out of range for relation {}",
                index, relation_id
            )));
        }
        let member = relation.members.remove(index);
        relation.meta.touch(undoing);
        self.undo.register(Action::AddMember {
            relation: relation_id,
            member: member.clone(),
            index,
        });
        Ok(member)
    }

    pub(crate) fn prim_set_members(&mut self, relation_id: OsmId, mut members: Vec<Member>) -> Result<()> {
        for member in members.iter_mut() {
            member.resolved = self.contains(member.target());
        }
        let undoing = self.undo.is_undoing();
        let relation = self.relation_mut(relation_id)?;
        relation.meta.touch(undoing);
        let previous = std::mem::replace(&mut relation.members, members);
        self.undo.register(Action::SetMembers {
            relation: relation_id,
            members: previous,
        });
        Ok(())
    }

    pub(crate) fn prim_spatial_add(&mut self, target: ExtendedId, bbox: OsmRect) {
        self.spatial.add_member(target, bbox);
        self.undo.register(Action::SpatialRemove { target });
    }

    pub(crate) fn prim_spatial_remove(&mut self, target: ExtendedId) -> Result<()> {
        let bbox = self
            .spatial
            .remove_member(target)
            .ok_or_else(|| Error::invariant(format!("{} is not indexed", target)))?;
        self.undo.register(Action::SpatialAdd { target, bbox });
        Ok(())
    }

    pub(crate) fn prim_spatial_update(&mut self, target: ExtendedId, to: OsmRect) {
        match self.spatial.update_member(target, to) {
            Some(previous) => self.undo.register(Action::SpatialUpdate { target, to: previous }),
            None => self.undo.register(Action::SpatialRemove { target }),
        }
    }

    /// Brings the indexed box of `ext` in line with its geometry, undoably.
    pub(crate) fn refresh_box(&mut self, ext: ExtendedId) -> Result<()> {
        let live = self.entity(ext).map(|e| !e.meta().deleted).unwrap_or(false);
        let bbox = if live { self.bounding_box(ext) } else { OsmRect::zero() };
        let recorded = self.spatial.recorded_box(ext);
        match (recorded, bbox.is_zero()) {
            (Some(_), true) => self.prim_spatial_remove(ext)?,
            (Some(previous), false) if previous != bbox => self.prim_spatial_update(ext, bbox),
            (None, false) => self.prim_spatial_add(ext, bbox),
            _ => {}
        }
        Ok(())
    }

    /// Refreshes every relation that contains `ext`, directly or through
    /// other relations.
    pub(crate) fn refresh_ancestors(&mut self, ext: ExtendedId) -> Result<()> {
        for relation in self.ancestor_relations(ext) {
            self.refresh_box(ExtendedId::relation(relation))?;
        }
        Ok(())
    }

    // Queries

    pub fn bounding_box(&self, ext: ExtendedId) -> OsmRect {
        match ext.kind {
            OsmType::Node => self
                .nodes
                .get(&ext.id)
                .map(Node::bounding_box)
                .unwrap_or_default(),
            OsmType::Way => self
                .ways
                .get(&ext.id)
                .map(|way| self.way_box(way))
                .unwrap_or_default(),
            OsmType::Relation => self.relation_box(ext.id),
        }
    }

    fn way_box(&self, way: &Way) -> OsmRect {
        let mut boxes = way
            .nodes
            .iter()
            .filter_map(|id| self.nodes.get(id))
            .map(Node::bounding_box);
        match boxes.next() {
            Some(first) => boxes.fold(first, |acc, rect| acc.union(&rect)),
            None => OsmRect::zero(),
        }
    }

    fn relation_box(&self, id: OsmId) -> OsmRect {
        let mut visited = HashSet::new();
        let mut stack = vec![id];
        let mut result: Option<OsmRect> = None;
        while let Some(current) = stack.pop() {
            if !visited.insert(current) {
                continue;
            }
            let Some(relation) = self.relations.get(&current) else {
                continue;
            };
            for member in &relation.members {
                let rect = match member.kind {
                    OsmType::Relation => {
                        stack.push(member.reference);
                        continue;
                    }
                    OsmType::Node => self.nodes.get(&member.reference).map(Node::bounding_box),
                    OsmType::Way => self.ways.get(&member.reference).map(|way| self.way_box(way)),
                };
                if let Some(rect) = rect.filter(|rect| !rect.is_zero()) {
                    result = Some(match result {
                        Some(acc) => acc.union(&rect),
                        None => rect,
                    });
                }
            }
        }
        result.unwrap_or_default()
    }

    pub fn ways_containing(&self, node: OsmId) -> Vec<OsmId> {
        let mut ways: Vec<OsmId> = self
            .ways
            .values()
            .filter(|way| !way.meta.deleted && way.nodes.contains(&node))
            .map(|way| way.meta.id)
            .collect();
        ways.sort_unstable();
        ways
    }

    pub fn relations_containing(&self, ext: ExtendedId) -> Vec<OsmId> {
        let mut relations: Vec<OsmId> = self
            .relations
            .values()
            .filter(|relation| !relation.meta.deleted && relation.contains(ext))
            .map(|relation| relation.meta.id)
            .collect();
        relations.sort_unstable();
        relations
    }

    /// All relations containing `ext` transitively, nearest first.
    pub fn ancestor_relations(&self, ext: ExtendedId) -> Vec<OsmId> {
        let mut found = Vec::new();
        let mut seen = HashSet::new();
        let mut queue = vec![ext];
        while let Some(current) = queue.pop() {
            for relation in self.relations_containing(current) {
                if seen.insert(relation) {
                    found.push(relation);
                    queue.insert(0, ExtendedId::relation(relation));
                }
            }
        }
        found
    }

    /// Lazily walks live entities whose box intersects `area`. Queries past
    /// the antimeridian are split in two.
    pub fn enumerate(&self, area: OsmRect) -> impl Iterator<Item = EntityRef<'_>> + '_ {
        let (first, second) = match area.split_at_antimeridian() {
            Some((west, east)) => (west, Some(east)),
            None => (area, None),
        };
        self.spatial
            .find_objects(first)
            .chain(second.into_iter().flat_map(move |rect| self.spatial.find_objects(rect)))
            .filter_map(move |ext| self.entity(ext))
            .filter(|entity| !entity.meta().deleted)
    }

    /// Number of pending changes the user would think of.
    pub fn modification_count(&self) -> usize {
        let modified = self
            .nodes
            .values()
            .map(|node| &node.meta)
            .chain(self.ways.values().map(|way| &way.meta))
            .chain(self.relations.values().map(|relation| &relation.meta))
            .filter(|meta| meta.needs_upload())
            .count();
        modified.min(self.undo.count_undo_groups())
    }

    /// Everything the undo log references, plus the nodes of those ways.
    pub fn modified_objects(&self) -> OsmDownloadData {
        let mut refs = self.undo.object_refs();
        for ext in refs.clone() {
            if let (OsmType::Way, Some(way)) = (ext.kind, self.ways.get(&ext.id)) {
                refs.extend(way.nodes.iter().map(|id| ExtendedId::node(*id)));
            }
        }
        let mut modified = OsmDownloadData::default();
        for ext in refs {
            match self.entity(ext) {
                Some(EntityRef::Node(node)) => modified.nodes.push(node.clone()),
                Some(EntityRef::Way(way)) => modified.ways.push(way.clone()),
                Some(EntityRef::Relation(relation)) => modified.relations.push(relation.clone()),
                None => {}
            }
        }
        modified
    }

    /// Checks the graph invariants. Expensive, meant for tests and after
    /// loading from disk.
    pub fn consistency_check(&self) -> Result<()> {
        let mut way_counts: HashMap<OsmId, u32> = HashMap::new();
        for way in self.ways.values() {
            for node in &way.nodes {
                *way_counts.entry(*node).or_default() += 1;
            }
            if way.nodes.windows(2).any(|pair| pair[0] == pair[1]) {
                return Err(Error::invariant(format!("Way {} repeats a node", way.meta.id)));
            }
        }
        for node in self.nodes.values() {
            let expected = way_counts.remove(&node.meta.id).unwrap_or(0);
            if node.way_count != expected {
                return Err(Error::invariant(format!(
                    "Node {} has way count {} but is used by {} ways",
                    node.meta.id, node.way_count, expected
                )));
            }
        }
        if let Some(missing) = way_counts.keys().next() {
            return Err(Error::invariant(format!("Way references missing node {}", missing)));
        }

        let mut indexed = HashSet::new();
        for (ext, _) in self.spatial.members() {
            if !indexed.insert(ext) {
                return Err(Error::invariant(format!("{} indexed twice", ext)));
            }
            match self.entity(ext) {
                Some(entity) if !entity.meta().deleted => {}
                _ => return Err(Error::invariant(format!("{} indexed but not live", ext))),
            }
        }
        let live = self
            .nodes
            .values()
            .map(EntityRef::Node)
            .chain(self.ways.values().map(EntityRef::Way))
            .chain(self.relations.values().map(EntityRef::Relation))
            .filter(|entity| !entity.meta().deleted);
        for entity in live {
            let ext = entity.extended_id();
            if !self.bounding_box(ext).is_zero() && !indexed.contains(&ext) {
                return Err(Error::invariant(format!("{} is not indexed", ext)));
            }
        }

        for relation in self.relations.values() {
            for member in &relation.members {
                if member.resolved != self.contains(member.target()) {
                    return Err(Error::invariant(format!(
                        "Relation {} has a stale member {}",
                        relation.meta.id,
                        member.target()
                    )));
                }
            }
        }

        for ext in self.undo.object_refs() {
            if !self.contains(ext) {
                warn!(entity = ext.to_string().as_str(); "Undo log references a missing entity");
                return Err(Error::invariant(format!("Undo log references missing {}", ext)));
            }
        }
        Ok(())
    }

    /// Whether any point of the entity lies in downloaded coverage.
    pub(crate) fn is_covered(&self, ext: ExtendedId) -> bool {
        match self.entity(ext) {
            Some(EntityRef::Node(node)) => self.region.point_is_covered(node.location()),
            Some(EntityRef::Way(way)) => {
                let points: Vec<OsmPoint> = way
                    .nodes
                    .iter()
                    .filter_map(|id| self.nodes.get(id))
                    .map(Node::location)
                    .collect();
                self.region.any_point_is_covered(&points)
            }
            Some(EntityRef::Relation(relation)) => relation.members.iter().any(|member| match member.kind {
                OsmType::Relation => false,
                _ => self.is_covered(member.target()),
            }),
            None => false,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::data::geometry::MAP_RECT;

    #[test]
    fn interrupted_replay_leaves_group_in_place() {
        let mut map = MapData::new("mapper");
        map.tick();
        let a = map.create_node(1.0, 1.0).unwrap();
        let b = map.create_node(2.0, 2.0).unwrap();
        let way = map.create_way().unwrap();
        map.add_node_to_way(way, a, 0).unwrap();
        map.add_node_to_way(way, b, 1).unwrap();

        map.tick();
        map.add_node_to_way(way, a, 2).unwrap();
        map.set_location(b, 3.0, 3.0).unwrap();

        // corrupt the way so the last inverse cannot apply
        map.ways.get_mut(&way).unwrap().nodes.truncate(2);
        let groups = map.undo.count_undo_groups();
        let err = map.undo().unwrap_err();
        assert_eq!(err.kind, crate::errors::ErrorKind::Invariant);

        let node = map.node(b).unwrap();
        assert_eq!((node.lat, node.lon), (3.0, 3.0));
        assert_eq!(map.undo.count_undo_groups(), groups);
        assert!(!map.can_redo());
    }

    #[test]
    fn relation_box_spans_nested_members() {
        let mut map = MapData::new("mapper");
        let a = map.create_node(1.0, 1.0).unwrap();
        let b = map.create_node(5.0, 6.0).unwrap();
        let inner = map.create_relation().unwrap();
        let outer = map.create_relation().unwrap();
        map.add_member(inner, Member::new(OsmType::Node, a, ""), 0).unwrap();
        map.add_member(outer, Member::new(OsmType::Node, b, ""), 0).unwrap();
        map.add_member(outer, Member::new(OsmType::Relation, inner, "sub"), 1).unwrap();
        // membership cycle must not hang
        map.add_member(inner, Member::new(OsmType::Relation, outer, "loop"), 1).unwrap();

        let rect = map.bounding_box(ExtendedId::relation(outer));
        assert_eq!(rect, OsmRect::new(1.0, 1.0, 5.0, 4.0));
        assert_eq!(map.ancestor_relations(ExtendedId::node(a)), vec![inner, outer]);
        map.consistency_check().unwrap();
    }

    #[test]
    fn enumerate_skips_deleted_and_splits_antimeridian() {
        let mut map = MapData::new("mapper");
        let east = map.create_node(0.0, 179.5).unwrap();
        let west = map.create_node(0.0, -179.5).unwrap();
        let gone = map.create_node(0.0, 179.6).unwrap();
        map.delete_node(gone).unwrap();

        let mut found: Vec<OsmId> = map
            .enumerate(OsmRect::new(179.0, -1.0, 2.0, 2.0))
            .map(|entity| entity.meta().id)
            .collect();
        found.sort();
        assert_eq!(found, vec![west, east]);
        assert_eq!(map.enumerate(MAP_RECT).count(), 2);
    }
}

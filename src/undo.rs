use std::collections::BTreeSet;

use serde::{Deserialize, Serialize};

use crate::data::geometry::OsmRect;
use crate::data::osm::{ExtendedId, Member, OsmId, OsmType};
use crate::data::tags::Tags;

/// Opaque caller context attached to an edit, handed back when the edit is
/// undone or redone.
pub type UndoComment = serde_json::Value;

/// One replayable step. Every payload is the state to restore, captured when
/// the inverse was registered.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
#[serde(tag = "action")]
pub enum Action {
    Comment { comment: UndoComment },
    SetTags { target: ExtendedId, tags: Tags },
    SetLocation { node: OsmId, lat: f64, lon: f64 },
    SetDeleted { target: ExtendedId, deleted: bool },
    AddNode { way: OsmId, node: OsmId, index: usize },
    RemoveNode { way: OsmId, index: usize },
    AddMember { relation: OsmId, member: Member, index: usize },
    RemoveMember { relation: OsmId, index: usize },
    SetMembers { relation: OsmId, members: Vec<Member> },
    SpatialAdd { target: ExtendedId, bbox: OsmRect },
    SpatialRemove { target: ExtendedId },
    SpatialUpdate { target: ExtendedId, to: OsmRect },
}

impl Action {
    /// The entity the action mutates, if any.
    pub fn target(&self) -> Option<ExtendedId> {
        match self {
            Action::Comment { .. } => None,
            Action::SetTags { target, .. }
            | Action::SetDeleted { target, .. }
            | Action::SpatialAdd { target, .. }
            | Action::SpatialRemove { target }
            | Action::SpatialUpdate { target, .. } => Some(*target),
            Action::SetLocation { node, .. } => Some(ExtendedId::node(*node)),
            Action::AddNode { way, .. } | Action::RemoveNode { way, .. } => {
                Some(ExtendedId::way(*way))
            }
            Action::AddMember { relation, .. }
            | Action::RemoveMember { relation, .. }
            | Action::SetMembers { relation, .. } => Some(ExtendedId::relation(*relation)),
        }
    }

    fn references(&self, refs: &mut BTreeSet<ExtendedId>) {
        if let Some(target) = self.target() {
            refs.insert(target);
        }
        // members are plain references, a missing one becomes an unresolved stub
        if let Action::AddNode { node, .. } = self {
            refs.insert(ExtendedId::node(*node));
        }
    }

    fn remap(&mut self, old: ExtendedId, new_id: OsmId) {
        let rewrite = |target: &mut ExtendedId| {
            if *target == old {
                target.id = new_id;
            }
        };
        let rewrite_member = |member: &mut Member| {
            if member.target() == old {
                member.reference = new_id;
            }
        };
        let rewrite_id = |kind: OsmType, id: &mut OsmId| {
            if kind == old.kind && *id == old.id {
                *id = new_id;
            }
        };
        match self {
            Action::Comment { .. } => {}
            Action::SetTags { target, .. }
            | Action::SetDeleted { target, .. }
            | Action::SpatialAdd { target, .. }
            | Action::SpatialRemove { target }
            | Action::SpatialUpdate { target, .. } => rewrite(target),
            Action::SetLocation { node, .. } => rewrite_id(OsmType::Node, node),
            Action::AddNode { way, node, .. } => {
                rewrite_id(OsmType::Way, way);
                rewrite_id(OsmType::Node, node);
            }
            Action::RemoveNode { way, .. } => rewrite_id(OsmType::Way, way),
            Action::AddMember {
                relation, member, ..
            } => {
                rewrite_id(OsmType::Relation, relation);
                rewrite_member(member);
            }
            Action::RemoveMember { relation, .. } => rewrite_id(OsmType::Relation, relation),
            Action::SetMembers { relation, members } => {
                rewrite_id(OsmType::Relation, relation);
                members.iter_mut().for_each(rewrite_member);
            }
        }
    }
}

#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
pub struct UndoEntry {
    pub group: u64,
    pub action: Action,
}

#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub enum ReplayMode {
    #[default]
    Normal,
    Undoing,
    Redoing,
}

/// Two stacks of grouped actions.
///
/// Edits made between two calls to [`UndoManager::tick`] share a group unless
/// an explicit grouping is open. Replays register their inverses under a
/// fresh group so that two undos never fuse into a single redo.
#[derive(Serialize, Deserialize, Debug, Default, Clone, PartialEq)]
pub struct UndoManager {
    undo_stack: Vec<UndoEntry>,
    redo_stack: Vec<UndoEntry>,
    serial: u64,
    idle_group: u64,
    #[serde(skip)]
    grouping_stack: Vec<u64>,
    #[serde(skip)]
    mode: ReplayMode,
    #[serde(skip)]
    replay_group: u64,
}

impl UndoManager {
    pub fn new() -> Self {
        Self::default()
    }

    fn next_serial(&mut self) -> u64 {
        self.serial += 1;
        self.serial
    }

    /// Starts a new idle group, typically once per UI event.
    pub fn tick(&mut self) {
        self.idle_group = self.next_serial();
    }

    pub fn begin_grouping(&mut self) {
        let group = self.current_group();
        self.grouping_stack.push(group);
    }

    pub fn end_grouping(&mut self) {
        self.grouping_stack.pop();
    }

    fn current_group(&self) -> u64 {
        match self.mode {
            ReplayMode::Normal => self.grouping_stack.last().copied().unwrap_or(self.idle_group),
            ReplayMode::Undoing | ReplayMode::Redoing => self.replay_group,
        }
    }

    pub fn mode(&self) -> ReplayMode {
        self.mode
    }

    pub fn is_undoing(&self) -> bool {
        self.mode == ReplayMode::Undoing
    }

    pub fn register(&mut self, action: Action) {
        let entry = UndoEntry {
            group: self.current_group(),
            action,
        };
        match self.mode {
            ReplayMode::Undoing => self.redo_stack.push(entry),
            ReplayMode::Redoing => self.undo_stack.push(entry),
            ReplayMode::Normal => {
                self.undo_stack.push(entry);
                self.redo_stack.clear();
            }
        }
    }

    pub fn register_comment(&mut self, comment: UndoComment) {
        self.register(Action::Comment { comment });
    }

    pub fn can_undo(&self) -> bool {
        !self.undo_stack.is_empty()
    }

    pub fn can_redo(&self) -> bool {
        !self.redo_stack.is_empty()
    }

    pub fn count_undo_groups(&self) -> usize {
        let mut count = 0;
        let mut group = None;
        for entry in &self.undo_stack {
            if group != Some(entry.group) {
                count += 1;
                group = Some(entry.group);
            }
        }
        count
    }

    pub fn undo_len(&self) -> usize {
        self.undo_stack.len()
    }

    pub fn redo_len(&self) -> usize {
        self.redo_stack.len()
    }

    fn pop_group(stack: &mut Vec<UndoEntry>) -> Vec<UndoEntry> {
        let Some(group) = stack.last().map(|entry| entry.group) else {
            return Vec::new();
        };
        let start = stack
            .iter()
            .rposition(|entry| entry.group != group)
            .map(|position| position + 1)
            .unwrap_or(0);
        stack.split_off(start)
    }

    /// Removes the top group of the stack that `mode` replays from, in
    /// registration order, and switches into that replay mode.
    pub fn begin_replay(&mut self, mode: ReplayMode) -> Vec<UndoEntry> {
        let entries = match mode {
            ReplayMode::Undoing => Self::pop_group(&mut self.undo_stack),
            ReplayMode::Redoing => Self::pop_group(&mut self.redo_stack),
            ReplayMode::Normal => Vec::new(),
        };
        self.replay_group = self.next_serial();
        self.mode = mode;
        entries
    }

    pub fn end_replay(&mut self) {
        self.mode = ReplayMode::Normal;
    }

    /// Undoes the bookkeeping of a failed replay: drops whatever the replay
    /// registered and puts the original group back.
    pub fn abort_replay(&mut self, mode: ReplayMode, entries: Vec<UndoEntry>) {
        let group = self.replay_group;
        match mode {
            ReplayMode::Undoing => {
                self.redo_stack.retain(|entry| entry.group != group);
                self.undo_stack.extend(entries);
            }
            ReplayMode::Redoing => {
                self.undo_stack.retain(|entry| entry.group != group);
                self.redo_stack.extend(entries);
            }
            ReplayMode::Normal => {}
        }
        self.mode = ReplayMode::Normal;
    }

    pub fn remove_most_recent_redo(&mut self) {
        Self::pop_group(&mut self.redo_stack);
    }

    pub fn remove_all_actions(&mut self) {
        self.undo_stack.clear();
        self.redo_stack.clear();
    }

    /// Every entity referenced from either stack. These must survive purges.
    pub fn object_refs(&self) -> BTreeSet<ExtendedId> {
        let mut refs = BTreeSet::new();
        for entry in self.undo_stack.iter().chain(self.redo_stack.iter()) {
            entry.action.references(&mut refs);
        }
        refs
    }

    pub fn remap_identifier(&mut self, old: ExtendedId, new_id: OsmId) {
        for entry in self.undo_stack.iter_mut().chain(self.redo_stack.iter_mut()) {
            entry.action.remap(old, new_id);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn tags_action(id: OsmId) -> Action {
        Action::SetTags {
            target: ExtendedId::node(id),
            tags: Tags::new(),
        }
    }

    #[test]
    fn edits_in_one_tick_share_a_group() {
        let mut undo = UndoManager::new();
        undo.tick();
        undo.register(tags_action(-1));
        undo.register(tags_action(-2));
        undo.tick();
        undo.register(tags_action(-3));
        assert_eq!(undo.count_undo_groups(), 2);
    }

    #[test]
    fn explicit_grouping_spans_ticks() {
        let mut undo = UndoManager::new();
        undo.tick();
        undo.begin_grouping();
        undo.register(tags_action(-1));
        undo.tick();
        undo.begin_grouping();
        undo.register(tags_action(-2));
        undo.end_grouping();
        undo.end_grouping();
        assert_eq!(undo.count_undo_groups(), 1);
    }

    #[test]
    fn new_edit_clears_redo() {
        let mut undo = UndoManager::new();
        undo.register(tags_action(-1));
        let entries = undo.begin_replay(ReplayMode::Undoing);
        assert_eq!(entries.len(), 1);
        undo.register(tags_action(-1));
        undo.end_replay();
        assert!(undo.can_redo());
        undo.tick();
        undo.register(tags_action(-2));
        assert!(!undo.can_redo());
    }

    #[test]
    fn aborted_replay_restores_stacks() {
        let mut undo = UndoManager::new();
        undo.tick();
        undo.register(tags_action(-1));
        undo.register(tags_action(-2));
        let before = undo.clone();
        let entries = undo.begin_replay(ReplayMode::Undoing);
        undo.register(tags_action(-2));
        undo.abort_replay(ReplayMode::Undoing, entries);
        assert_eq!(undo.undo_stack, before.undo_stack);
        assert!(!undo.can_redo());
    }

    #[test]
    fn refs_and_remap_cover_payloads() {
        let mut undo = UndoManager::new();
        undo.register(Action::AddNode {
            way: -4,
            node: -5,
            index: 0,
        });
        undo.register(Action::Comment {
            comment: json!({"selection": "way -4"}),
        });
        let refs = undo.object_refs();
        assert!(refs.contains(&ExtendedId::way(-4)));
        assert!(refs.contains(&ExtendedId::node(-5)));

        undo.remap_identifier(ExtendedId::node(-5), 77);
        let refs = undo.object_refs();
        assert!(refs.contains(&ExtendedId::node(77)));
        assert!(!refs.contains(&ExtendedId::node(-5)));
        assert!(refs.contains(&ExtendedId::way(-4)));
    }

    #[test]
    fn remove_most_recent_redo_drops_one_group() {
        let mut undo = UndoManager::new();
        undo.tick();
        undo.register(tags_action(-1));
        undo.tick();
        undo.register(tags_action(-2));
        for _ in 0..2 {
            let _ = undo.begin_replay(ReplayMode::Undoing);
            undo.register(tags_action(-1));
            undo.end_replay();
        }
        assert_eq!(undo.redo_len(), 2);
        undo.remove_most_recent_redo();
        assert_eq!(undo.redo_len(), 1);
    }
}

use std::collections::{BTreeSet, HashMap, HashSet};
use std::fmt;

use log::{debug, error, info, warn};
use regex::Regex;

use crate::codec::{decode_diff_result, decode_osm, encode_changeset, encode_osm_change, DiffResultEntry};
use crate::config::Config;
use crate::data::osm::{ExtendedId, OsmId, OsmType};
use crate::data::tags::Tags;
use crate::data::OsmDownloadData;
use crate::errors::{Error, Result};
use crate::map_data::MapData;
use crate::persist::PersistDelta;
use crate::sync::{Response, Transport};

pub const DEFAULT_UPLOAD_RETRIES: usize = 20;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UploadState {
    Idle,
    ChangesetOpen,
    Uploading,
    VersionConflict,
    ResyncElement,
    Success,
    ChangesetClose,
    HardError,
}

impl fmt::Display for UploadState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Debug::fmt(self, f)
    }
}

/// Ids of one kind of change, per entity type.
#[derive(Debug, Default, Clone, PartialEq)]
pub struct ChangeBucket {
    pub nodes: Vec<OsmId>,
    pub ways: Vec<OsmId>,
    pub relations: Vec<OsmId>,
}

impl ChangeBucket {
    fn push(&mut self, ext: ExtendedId) {
        match ext.kind {
            OsmType::Node => self.nodes.push(ext.id),
            OsmType::Way => self.ways.push(ext.id),
            OsmType::Relation => self.relations.push(ext.id),
        }
    }

    fn sort(&mut self, descending: bool) {
        for ids in [&mut self.nodes, &mut self.ways, &mut self.relations] {
            ids.sort_unstable();
            if descending {
                ids.reverse();
            }
        }
    }

    pub fn len(&self) -> usize {
        self.nodes.len() + self.ways.len() + self.relations.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// Everything the server has not seen yet, read from the graph.
#[derive(Debug, Default, Clone, PartialEq)]
pub struct ChangesetDiff {
    pub create: ChangeBucket,
    pub modify: ChangeBucket,
    pub delete: ChangeBucket,
}

impl ChangesetDiff {
    /// Buckets dirty entities. Placeholders that were deleted again never
    /// reach the server. A deleted way's orphaned nodes are deleted entities
    /// themselves, so they land in the node deletions.
    pub fn from_map(map: &MapData) -> Self {
        let mut diff = ChangesetDiff::default();
        let metas = map
            .nodes()
            .map(|node| (ExtendedId::node(node.meta.id), &node.meta))
            .chain(map.ways().map(|way| (ExtendedId::way(way.meta.id), &way.meta)))
            .chain(
                map.relations()
                    .map(|relation| (ExtendedId::relation(relation.meta.id), &relation.meta)),
            );
        for (ext, meta) in metas {
            match (meta.deleted, ext.id > 0) {
                (true, true) => diff.delete.push(ext),
                (true, false) => (),
                (false, false) if meta.is_modified() => diff.create.push(ext),
                (false, true) if meta.is_modified() => diff.modify.push(ext),
                _ => (),
            }
        }
        // placeholders in creation order
        diff.create.sort(true);
        diff.modify.sort(false);
        diff.delete.sort(false);
        diff
    }

    pub fn len(&self) -> usize {
        self.create.len() + self.modify.len() + self.delete.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// A rejected upload because one element is out of date.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct VersionConflict {
    pub provided: u32,
    pub server: u32,
    pub element: ExtendedId,
}

pub fn parse_version_conflict(body: &str) -> Option<VersionConflict> {
    let pattern = Regex::new(r"(?i)Version mismatch: Provided (\d+), server had: (\d+) of (\w+) (-?\d+)").ok()?;
    let captures = pattern.captures(body)?;
    let kind = OsmType::parse(captures.get(3)?.as_str()).ok()?;
    Some(VersionConflict {
        provided: captures.get(1)?.as_str().parse().ok()?,
        server: captures.get(2)?.as_str().parse().ok()?,
        element: ExtendedId::new(kind, captures.get(4)?.as_str().parse().ok()?),
    })
}

fn is_conflict(response: &Response) -> bool {
    response.status == 409 || response.body.trim_start().starts_with("Version mismatch")
}

#[derive(Debug, Default, Clone, PartialEq)]
pub struct UploadReport {
    pub changeset: i64,
    pub attempts: usize,
    pub created: usize,
    pub modified: usize,
    pub deleted: usize,
    /// Accepted changes for the local cache.
    pub persist: PersistDelta,
    /// Set when the changeset could not be closed or a follow-up fetch
    /// failed. The edits are committed regardless.
    pub warning: Option<String>,
    /// The server took the diff but its answer could not be read. Local
    /// data was dropped and has to be downloaded again.
    pub refetch_required: bool,
}

/// What applying a diff result changed locally.
#[derive(Debug, Default, Clone, PartialEq)]
pub(crate) struct DiffApplied {
    pub persist: PersistDelta,
    /// Ways and relations whose deletion the server refused. They were
    /// dropped locally and must be fetched again.
    pub refetch: Vec<ExtendedId>,
}

struct Upload<'a> {
    map: &'a mut MapData,
    transport: &'a dyn Transport,
    config: &'a Config,
    state: UploadState,
    changeset: i64,
}

impl Upload<'_> {
    fn transition(&mut self, next: UploadState) {
        info!(
            from = self.state.to_string().as_str(),
            to = next.to_string().as_str(),
            changeset = self.changeset;
            "Upload state"
        );
        self.state = next;
    }

    fn fail(&mut self, err: Error) -> Error {
        self.transition(UploadState::HardError);
        warn!(error = err.message.as_str(), changeset = self.changeset; "Upload failed");
        if self.changeset > 0 {
            self.close();
        }
        self.transition(UploadState::Idle);
        err
    }

    fn open(&mut self, tags: &Tags) -> Result<()> {
        self.transition(UploadState::ChangesetOpen);
        let mut tags = tags.clone();
        tags.entry("created_by".to_string())
            .or_insert_with(|| self.config.generator.clone());
        let response = self
            .transport
            .put("api/0.6/changeset/create", &encode_changeset(&tags)?)?;
        if !response.is_success() {
            return Err(Error::protocol(format!(
                "Could not open changeset: {} {}",
                response.status,
                response.body.trim()
            )));
        }
        self.changeset = response
            .body
            .trim()
            .parse()
            .map_err(|_| Error::protocol(format!("Bad changeset id {:?}", response.body)))?;
        Ok(())
    }

    /// Fetches one element, with its nodes and members unless it is a node.
    fn fetch_element(&self, element: ExtendedId) -> Result<OsmDownloadData> {
        let mut path = format!("api/0.6/{}/{}", element.kind.as_str(), element.id);
        if element.kind != OsmType::Node {
            path.push_str("/full");
        }
        let response = self.transport.get(&path)?;
        if !response.is_success() {
            return Err(Error::conflict(format!("Could not fetch {}: {}", element, response.status)));
        }
        decode_osm(&response.body)
    }

    /// Re-fetches the conflicted element and merges it so the next attempt
    /// carries the server's version.
    fn resync(&mut self, conflict: VersionConflict) -> Result<()> {
        self.transition(UploadState::ResyncElement);
        let data = self.fetch_element(conflict.element)?;
        self.map.merge_conflict_resync(data, conflict.element)?;
        Ok(())
    }

    /// Brings back elements the server would not delete.
    fn refetch(&mut self, elements: &[ExtendedId], persist: &mut PersistDelta, warnings: &mut Vec<String>) {
        for element in elements {
            let merged = match self.fetch_element(*element) {
                Ok(data) => self.map.merge(data, true, &[], true),
                Err(err) => Err(err),
            };
            match merged {
                Ok(outcome) => persist.append(outcome.persist),
                Err(err) => {
                    warn!(element = element.to_string().as_str(), error = err.message.as_str(); "Kept element not refetched");
                    warnings.push(format!("refetching {} failed: {}", element, err.message));
                }
            }
        }
    }

    fn close(&mut self) -> Option<String> {
        self.transition(UploadState::ChangesetClose);
        let path = format!("api/0.6/changeset/{}/close", self.changeset);
        let problem = match self.transport.put(&path, "") {
            Ok(response) if response.is_success() => None,
            Ok(response) => Some(format!("closing changeset failed: {}", response.status)),
            Err(err) => Some(format!("closing changeset failed: {}", err.message)),
        };
        if let Some(problem) = &problem {
            warn!(warning = problem.as_str(), changeset = self.changeset; "Changes committed, changeset left open");
        }
        problem
    }

    fn run(&mut self, tags: &Tags) -> Result<UploadReport> {
        self.open(tags)?;
        let retries = self.config.upload_retries.max(1);
        for attempt in 1..=retries {
            self.transition(UploadState::Uploading);
            let diff = ChangesetDiff::from_map(self.map);
            if diff.is_empty() {
                return Err(Error::conflict("Nothing left to upload after resync"));
            }
            let body = encode_osm_change(self.map, &diff, self.changeset, &self.config.generator)?;
            debug!(attempt = attempt, elements = diff.len(); "Uploading diff");
            let path = format!("api/0.6/changeset/{}/upload", self.changeset);
            let response = self.transport.post(&path, &body)?;

            if response.is_success() {
                self.transition(UploadState::Success);
                let mut report = UploadReport {
                    changeset: self.changeset,
                    attempts: attempt,
                    created: diff.create.len(),
                    modified: diff.modify.len(),
                    deleted: diff.delete.len(),
                    ..Default::default()
                };
                let mut warnings = Vec::new();
                match decode_diff_result(&response.body) {
                    Ok(entries) => {
                        let applied = self.map.apply_diff_result(&entries, self.changeset);
                        report.persist = applied.persist;
                        self.refetch(&applied.refetch, &mut report.persist, &mut warnings);
                    }
                    Err(err) => {
                        // committed on the server, but placeholders cannot be mapped
                        warn!(error = err.message.as_str(), changeset = self.changeset; "Unreadable diff result");
                        warnings.push(format!("diff result unreadable: {}", err.message));
                        report.refetch_required = true;
                    }
                }
                warnings.extend(self.close());
                report.warning = (!warnings.is_empty()).then(|| warnings.join("; "));
                return Ok(report);
            }
            if !is_conflict(&response) {
                return Err(Error::protocol(format!(
                    "Upload rejected: {} {}",
                    response.status,
                    response.body.trim()
                )));
            }
            self.transition(UploadState::VersionConflict);
            let conflict = parse_version_conflict(&response.body).ok_or_else(|| {
                Error::conflict(format!("Unrecognised conflict: {}", response.body.trim()))
            })?;
            info!(
                element = conflict.element.to_string().as_str(),
                provided = conflict.provided,
                server = conflict.server;
                "Version conflict"
            );
            self.resync(conflict)?;
        }
        Err(Error::conflict(format!(
            "Version conflicts unresolved after {} attempts",
            retries
        )))
    }
}

/// Uploads every local change as one changeset. Version conflicts are
/// resolved by refreshing the one element the server complained about and
/// trying again, up to `config.upload_retries` attempts. On success the undo
/// log is cleared, since replaying it against server versions is
/// meaningless. When the server's answer cannot be read, all local data is
/// dropped so nothing is uploaded twice.
pub fn upload_changeset(
    map: &mut MapData,
    transport: &dyn Transport,
    config: &Config,
    tags: &Tags,
) -> Result<UploadReport> {
    if ChangesetDiff::from_map(map).is_empty() {
        info!("Nothing to upload");
        return Ok(UploadReport::default());
    }
    let mut upload = Upload {
        map,
        transport,
        config,
        state: UploadState::Idle,
        changeset: 0,
    };
    match upload.run(tags) {
        Ok(report) => {
            upload.transition(UploadState::Idle);
            if report.refetch_required {
                upload.map.purge_hard();
            } else {
                upload.map.clear_undo_stack();
                upload.map.drop_deleted_placeholders();
            }
            info!(
                changeset = report.changeset,
                attempts = report.attempts,
                created = report.created,
                modified = report.modified,
                deleted = report.deleted;
                "Upload complete"
            );
            Ok(report)
        }
        Err(err) => Err(upload.fail(err)),
    }
}

impl MapData {
    /// Applies the server's answer to an upload. Placeholders get their real
    /// ids everywhere they are referenced, confirmed deletions disappear and
    /// accepted entities are clean again. A deletion answered with a new
    /// version was refused because the element is still in use.
    pub(crate) fn apply_diff_result(&mut self, entries: &[DiffResultEntry], changeset: i64) -> DiffApplied {
        let mut persist = PersistDelta::default();
        let mut node_ids: HashMap<OsmId, OsmId> = HashMap::new();
        let mut remapped: HashMap<ExtendedId, OsmId> = HashMap::new();
        let mut accepted: BTreeSet<ExtendedId> = BTreeSet::new();
        let mut refetch: Vec<ExtendedId> = Vec::new();

        for entry in entries {
            let old = ExtendedId::new(entry.kind, entry.old_id);
            let Some(new_id) = entry.new_id else {
                self.spatial.remove_member(old);
                self.remove_from_arena(old);
                match entry.kind {
                    OsmType::Node => persist.delete_nodes.push(old.id),
                    OsmType::Way => persist.delete_ways.push(old.id),
                    OsmType::Relation => persist.delete_relations.push(old.id),
                }
                continue;
            };
            if !self.contains(old) {
                warn!(entity = old.to_string().as_str(); "Server confirmed an unknown element");
                continue;
            }
            if self.entity(old).map(|entity| entity.meta().deleted).unwrap_or(false) {
                info!(entity = old.to_string().as_str(); "Server kept an element still in use");
                if old.kind == OsmType::Node {
                    if let Ok(meta) = self.meta_mut(old) {
                        meta.deleted = false;
                        meta.modify_count = 0;
                        meta.version = entry.new_version.unwrap_or(meta.version);
                    }
                    self.reindex(old);
                    accepted.insert(old);
                } else {
                    // stripped of nodes or members locally, only the server copy is whole
                    self.spatial.remove_member(old);
                    self.remove_from_arena(old);
                    refetch.push(old);
                }
                continue;
            }
            let new = ExtendedId::new(entry.kind, new_id);
            if new_id != old.id {
                self.rekey(old, new_id);
                if entry.kind == OsmType::Node {
                    node_ids.insert(old.id, new_id);
                }
                remapped.insert(old, new_id);
            }
            if let Ok(meta) = self.meta_mut(new) {
                if let Some(version) = entry.new_version {
                    meta.version = version;
                }
                meta.changeset = changeset;
                meta.modify_count = 0;
            }
            accepted.insert(new);
        }

        if !remapped.is_empty() {
            for way in self.ways.values_mut() {
                let mut touched = false;
                for node in way.nodes.iter_mut() {
                    if let Some(new_id) = node_ids.get(node) {
                        *node = *new_id;
                        touched = true;
                    }
                }
                if touched {
                    accepted.insert(ExtendedId::way(way.meta.id));
                }
            }
            for relation in self.relations.values_mut() {
                let mut touched = false;
                for member in relation.members.iter_mut() {
                    if let Some(new_id) = remapped.get(&member.target()) {
                        member.reference = *new_id;
                        touched = true;
                    }
                }
                if touched {
                    accepted.insert(ExtendedId::relation(relation.meta.id));
                }
            }
            for (old, new_id) in &remapped {
                self.undo.remap_identifier(*old, *new_id);
            }
        }

        for ext in accepted {
            match ext.kind {
                OsmType::Node => persist.save_nodes.extend(self.nodes.get(&ext.id).cloned()),
                OsmType::Way => persist.save_ways.extend(self.ways.get(&ext.id).cloned()),
                OsmType::Relation => persist
                    .save_relations
                    .extend(self.relations.get(&ext.id).cloned()),
            }
        }
        if !refetch.is_empty() {
            let dropped: HashSet<ExtendedId> = refetch.iter().copied().collect();
            if let Err(err) = self.resolve_relations(&dropped) {
                error!(error = err.message.as_str(); "Relations unsettled after refused deletions");
            }
        }
        info!(
            remapped = remapped.len(),
            deleted = persist.delete_count(),
            saved = persist.save_count(),
            refetch = refetch.len();
            "Applied upload result"
        );
        DiffApplied { persist, refetch }
    }

    /// Moves an entity to a new id in the arena and the object index.
    fn rekey(&mut self, old: ExtendedId, new_id: OsmId) {
        match old.kind {
            OsmType::Node => {
                if let Some(mut node) = self.nodes.remove(&old.id) {
                    node.meta.id = new_id;
                    self.nodes.insert(new_id, node);
                }
            }
            OsmType::Way => {
                if let Some(mut way) = self.ways.remove(&old.id) {
                    way.meta.id = new_id;
                    self.ways.insert(new_id, way);
                }
            }
            OsmType::Relation => {
                if let Some(mut relation) = self.relations.remove(&old.id) {
                    relation.meta.id = new_id;
                    self.relations.insert(new_id, relation);
                }
            }
        }
        if let Some(bbox) = self.spatial.remove_member(old) {
            self.spatial.add_member(ExtendedId::new(old.kind, new_id), bbox);
        }
    }

    /// Removes placeholders that were created and deleted again locally.
    pub(crate) fn drop_deleted_placeholders(&mut self) {
        let before = self.object_count();
        self.nodes.retain(|id, node| *id > 0 || !node.meta.deleted);
        self.ways.retain(|id, way| *id > 0 || !way.meta.deleted);
        self.relations
            .retain(|id, relation| *id > 0 || !relation.meta.deleted);
        debug!(dropped = before - self.object_count(); "Dropped deleted placeholders");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::data::geometry::OsmRect;
    use crate::data::osm::{EntityMeta, Member, Node, Way};

    fn seeded() -> MapData {
        let mut map = MapData::new("mapper");
        let meta = |id| EntityMeta {
            id,
            version: 2,
            ..Default::default()
        };
        let delta = OsmDownloadData {
            nodes: vec![
                Node::new(meta(1), 1.0, 1.0),
                Node::new(meta(2), 1.0, 2.0),
                Node::new(meta(3), 5.0, 5.0),
            ],
            ways: vec![Way::new(meta(10), vec![1, 2])],
            ..Default::default()
        };
        map.merge(delta, false, &[OsmRect::new(0.0, 0.0, 8.0, 8.0)], true)
            .unwrap();
        map
    }

    #[test]
    fn diff_buckets_every_dirty_entity_once() {
        let mut map = seeded();
        let a = map.create_node(3.0, 3.0).unwrap();
        let b = map.create_node(3.0, 4.0).unwrap();
        let way = map.create_way().unwrap();
        map.add_node_to_way(way, a, 0).unwrap();
        map.add_node_to_way(way, b, 1).unwrap();
        let gone = map.create_node(9.0, 9.0).unwrap();
        map.delete_node(gone).unwrap();
        map.set_location(1, 1.5, 1.0).unwrap();
        map.delete_node(3).unwrap();

        let diff = ChangesetDiff::from_map(&map);
        assert_eq!(diff.create.nodes, vec![a, b]);
        assert_eq!(diff.create.ways, vec![way]);
        // moving node 1 reshapes way 10 but does not modify it
        assert_eq!(diff.modify.nodes, vec![1]);
        assert!(diff.modify.ways.is_empty());
        assert_eq!(diff.delete.nodes, vec![3]);
        assert_eq!(diff.len(), 5);
    }

    #[test]
    fn conflict_message_is_parsed() {
        let conflict =
            parse_version_conflict("Version mismatch: Provided 2, server had: 5 of Node 4242").unwrap();
        assert_eq!(conflict.provided, 2);
        assert_eq!(conflict.server, 5);
        assert_eq!(conflict.element, ExtendedId::node(4242));
        assert!(parse_version_conflict("Precondition failed").is_none());
    }

    /// One line of a diffResult; `None` for a deleted element.
    fn answer(kind: OsmType, old_id: OsmId, new: Option<(OsmId, u32)>) -> DiffResultEntry {
        DiffResultEntry {
            kind,
            old_id,
            new_id: new.map(|(id, _)| id),
            new_version: new.map(|(_, version)| version),
        }
    }

    #[test]
    fn diff_result_replaces_placeholders() {
        let mut map = seeded();
        let a = map.create_node(3.0, 3.0).unwrap();
        let way = map.create_way().unwrap();
        map.add_node_to_way(way, a, 0).unwrap();
        map.add_node_to_way(way, 1, 1).unwrap();
        let relation = map.create_relation().unwrap();
        map.add_member(relation, Member::new(OsmType::Way, way, "outer"), 0).unwrap();
        map.delete_node(3).unwrap();

        let entries = [
            answer(OsmType::Node, a, Some((900, 1))),
            answer(OsmType::Way, way, Some((901, 1))),
            answer(OsmType::Relation, relation, Some((902, 1))),
            answer(OsmType::Node, 3, None),
        ];
        let persist = map.apply_diff_result(&entries, 77).persist;

        assert!(map.nodes().all(|node| node.meta.id > 0));
        assert!(map.ways().all(|way| way.meta.id > 0));
        assert_eq!(map.way(901).unwrap().nodes, vec![900, 1]);
        assert_eq!(map.relation(902).unwrap().members[0].reference, 901);
        assert_eq!(map.node(900).unwrap().meta.changeset, 77);
        assert!(!map.node(900).unwrap().meta.is_modified());
        assert!(map.node(3).is_none());
        assert_eq!(persist.delete_nodes, vec![3]);
        assert!(map.spatial().contains(ExtendedId::way(901)));
        assert!(!map.spatial().contains(ExtendedId::way(way)));
        // the undo log still mentions node 3, as it does until the upload clears it
        map.clear_undo_stack();
        map.consistency_check().unwrap();
    }

    #[test]
    fn refused_way_delete_is_dropped_for_refetch() {
        let mut map = seeded();
        map.delete_way(10).unwrap();
        assert_eq!(ChangesetDiff::from_map(&map).delete.nodes, vec![1, 2]);

        let entries = [
            answer(OsmType::Way, 10, Some((10, 2))),
            answer(OsmType::Node, 1, Some((1, 2))),
            answer(OsmType::Node, 2, Some((2, 2))),
        ];
        let applied = map.apply_diff_result(&entries, 77);

        assert_eq!(applied.refetch, vec![ExtendedId::way(10)]);
        assert!(map.way(10).is_none());
        assert!(!map.node(1).unwrap().meta.deleted);
        assert!(map.spatial().contains(ExtendedId::node(2)));
        assert!(ChangesetDiff::from_map(&map).is_empty());

        // what the refetch brings back
        let meta = EntityMeta {
            id: 10,
            version: 2,
            ..Default::default()
        };
        let refetched = OsmDownloadData {
            ways: vec![Way::new(meta, vec![1, 2])],
            ..Default::default()
        };
        map.merge(refetched, true, &[], true).unwrap();
        assert_eq!(map.node(1).unwrap().way_count, 1);
        map.clear_undo_stack();
        map.consistency_check().unwrap();
    }
}

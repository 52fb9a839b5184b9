use std::collections::{BTreeSet, HashSet};

use log::{debug, error, info, warn};

use crate::data::geometry::OsmRect;
use crate::data::osm::{ExtendedId, Node, OsmId, OsmType};
use crate::data::OsmDownloadData;
use crate::errors::{Error, Result};
use crate::map_data::MapData;
use crate::persist::PersistDelta;

#[derive(Debug, Default, Clone, PartialEq)]
pub struct MergeOutcome {
    /// New and updated entities, filled only for downloads.
    pub persist: PersistDelta,
    /// Number of entities inserted or updated.
    pub merged: usize,
}

impl MapData {
    /// Folds a server response into the graph and commits coverage for
    /// `quads`. A failed fetch (`success == false`) only releases the quads
    /// so they are requested again later.
    pub fn merge(
        &mut self,
        delta: OsmDownloadData,
        from_download: bool,
        quads: &[OsmRect],
        success: bool,
    ) -> Result<MergeOutcome> {
        if !success {
            self.region.cancel(quads);
            debug!(quads = quads.len(); "Download failed, quads left pending");
            return Ok(MergeOutcome::default());
        }
        if let Err(err) = self.validate_delta(&delta) {
            self.region.cancel(quads);
            warn!(error = err.message.as_str(); "Rejected download");
            return Err(err);
        }

        let snapshot = self.snapshot_of(self.merge_footprint(&delta));
        let outcome = match self.merge_entities(delta, from_download, None) {
            Ok(outcome) => outcome,
            Err(err) => {
                self.restore(snapshot);
                self.region.cancel(quads);
                error!(error = err.message.as_str(), quads = quads.len(); "Merge failed, rolled back");
                return Err(err);
            }
        };
        for quad in quads {
            self.region.make_whole(quad, true);
        }
        info!(
            merged = outcome.merged,
            quads = quads.len(),
            objects = self.object_count();
            "Merged download"
        );
        Ok(outcome)
    }

    /// Merges the server's copy of a conflicted element. The element keeps
    /// its local content when it has local edits, but adopts the server's
    /// version so the next upload attempt is accepted.
    pub fn merge_conflict_resync(&mut self, delta: OsmDownloadData, element: ExtendedId) -> Result<MergeOutcome> {
        self.validate_delta(&delta)?;
        let snapshot = self.snapshot_of(self.merge_footprint(&delta));
        let outcome = match self.merge_entities(delta, false, Some(element)) {
            Ok(outcome) => outcome,
            Err(err) => {
                self.restore(snapshot);
                return Err(err);
            }
        };
        info!(element = element.to_string().as_str(), merged = outcome.merged; "Resynced conflicted element");
        Ok(outcome)
    }

    fn validate_delta(&self, delta: &OsmDownloadData) -> Result<()> {
        let incoming: HashSet<OsmId> = delta.nodes.iter().map(|node| node.meta.id).collect();
        for way in &delta.ways {
            if let Some(missing) = way
                .nodes
                .iter()
                .find(|id| !incoming.contains(id) && !self.nodes.contains_key(id))
            {
                return Err(Error::protocol(format!(
                    "Way {} references missing node {}",
                    way.meta.id, missing
                )));
            }
        }
        Ok(())
    }

    /// Everything merging `delta` may change: its own entities, the nodes
    /// whose way counts move, ways whose boxes move and every relation above
    /// any of those.
    fn merge_footprint(&self, delta: &OsmDownloadData) -> BTreeSet<ExtendedId> {
        let mut touched: BTreeSet<ExtendedId> = delta.extended_ids().collect();
        let incoming: HashSet<OsmId> = delta.nodes.iter().map(|node| node.meta.id).collect();
        for way in &delta.ways {
            touched.extend(way.nodes.iter().map(|id| ExtendedId::node(*id)));
            if let Some(local) = self.ways.get(&way.meta.id) {
                touched.extend(local.nodes.iter().map(|id| ExtendedId::node(*id)));
            }
        }
        touched.extend(
            self.ways
                .values()
                .filter(|way| way.nodes.iter().any(|id| incoming.contains(id)))
                .map(|way| ExtendedId::way(way.meta.id)),
        );
        loop {
            let parents: Vec<ExtendedId> = self
                .relations
                .values()
                .map(|relation| (ExtendedId::relation(relation.meta.id), relation))
                .filter(|(ext, relation)| {
                    !touched.contains(ext)
                        && relation.members.iter().any(|member| touched.contains(&member.target()))
                })
                .map(|(ext, _)| ext)
                .collect();
            if parents.is_empty() {
                return touched;
            }
            touched.extend(parents);
        }
    }

    /// Whether local content should survive a newer server version.
    fn keeps_local(keep_local: Option<ExtendedId>, ext: ExtendedId, modified: bool) -> bool {
        modified && keep_local == Some(ext)
    }

    fn merge_entities(
        &mut self,
        delta: OsmDownloadData,
        from_download: bool,
        keep_local: Option<ExtendedId>,
    ) -> Result<MergeOutcome> {
        let mut outcome = MergeOutcome::default();
        let mut changed: HashSet<ExtendedId> = HashSet::new();
        let mut moved_nodes: HashSet<OsmId> = HashSet::new();

        for incoming in delta.nodes {
            let ext = ExtendedId::node(incoming.meta.id);
            match self.nodes.get_mut(&incoming.meta.id) {
                Some(local) if incoming.meta.version > local.meta.version => {
                    if Self::keeps_local(keep_local, ext, local.meta.needs_upload()) {
                        local.meta.server_update_version(&incoming.meta);
                    } else {
                        local.meta.server_update(&incoming.meta);
                        if (local.lat, local.lon) != (incoming.lat, incoming.lon) {
                            local.lat = incoming.lat;
                            local.lon = incoming.lon;
                            moved_nodes.insert(incoming.meta.id);
                        }
                    }
                    if from_download {
                        outcome.persist.save_nodes.push(local.clone());
                    }
                }
                Some(_) => continue,
                None => {
                    let mut node = Node::new(incoming.meta, incoming.lat, incoming.lon);
                    node.meta.deleted = false;
                    node.meta.modify_count = 0;
                    if from_download {
                        outcome.persist.save_nodes.push(node.clone());
                    }
                    self.nodes.insert(ext.id, node);
                }
            }
            changed.insert(ext);
        }

        for incoming in delta.ways {
            let ext = ExtendedId::way(incoming.meta.id);
            let previous_nodes = match self.ways.get_mut(&incoming.meta.id) {
                Some(local) if incoming.meta.version > local.meta.version => {
                    if Self::keeps_local(keep_local, ext, local.meta.needs_upload()) {
                        local.meta.server_update_version(&incoming.meta);
                        None
                    } else {
                        local.meta.server_update(&incoming.meta);
                        Some(std::mem::replace(&mut local.nodes, incoming.nodes.clone()))
                    }
                }
                Some(_) => continue,
                None => {
                    let mut way = incoming.clone();
                    way.meta.deleted = false;
                    way.meta.modify_count = 0;
                    self.ways.insert(ext.id, way);
                    Some(Vec::new())
                }
            };
            if let Some(previous_nodes) = previous_nodes {
                for node in &previous_nodes {
                    if let Some(node) = self.nodes.get_mut(node) {
                        node.way_count = node.way_count.saturating_sub(1);
                    }
                }
                for node in &incoming.nodes {
                    if let Some(node) = self.nodes.get_mut(node) {
                        node.way_count += 1;
                    }
                }
            }
            if let (true, Some(way)) = (from_download, self.ways.get(&ext.id)) {
                outcome.persist.save_ways.push(way.clone());
            }
            changed.insert(ext);
        }

        for incoming in delta.relations {
            let ext = ExtendedId::relation(incoming.meta.id);
            if incoming.members.iter().any(|member| member.target() == ext) {
                return Err(Error::protocol(format!("Relation {} lists itself as a member", ext.id)));
            }
            match self.relations.get_mut(&incoming.meta.id) {
                Some(local) if incoming.meta.version > local.meta.version => {
                    if Self::keeps_local(keep_local, ext, local.meta.needs_upload()) {
                        local.meta.server_update_version(&incoming.meta);
                    } else {
                        local.meta.server_update(&incoming.meta);
                        local.members = incoming.members;
                    }
                }
                Some(_) => continue,
                None => {
                    let mut relation = incoming;
                    relation.meta.deleted = false;
                    relation.meta.modify_count = 0;
                    self.relations.insert(ext.id, relation);
                }
            }
            if let (true, Some(relation)) = (from_download, self.relations.get(&ext.id)) {
                outcome.persist.save_relations.push(relation.clone());
            }
            changed.insert(ext);
        }

        outcome.merged = changed.len();
        if !moved_nodes.is_empty() {
            let affected: Vec<OsmId> = self
                .ways
                .values()
                .filter(|way| way.nodes.iter().any(|node| moved_nodes.contains(node)))
                .map(|way| way.meta.id)
                .collect();
            changed.extend(affected.into_iter().map(ExtendedId::way));
        }
        for ext in changed.iter().filter(|ext| ext.kind != OsmType::Relation) {
            self.reindex(*ext);
        }
        self.resolve_relations(&changed)?;
        Ok(outcome)
    }

    /// Updates member resolution and relation boxes after `changed` entities
    /// arrived or moved. Box changes propagate to parent relations until
    /// nothing changes any more.
    pub(crate) fn resolve_relations(&mut self, changed: &HashSet<ExtendedId>) -> Result<()> {
        let ids: Vec<OsmId> = self.relations.keys().copied().collect();
        let mut frontier: HashSet<ExtendedId> = changed.clone();
        let mut pending: HashSet<OsmId> = changed
            .iter()
            .filter(|ext| ext.kind == OsmType::Relation)
            .map(|ext| ext.id)
            .collect();

        for id in &ids {
            let Some(relation) = self.relations.get(id) else {
                continue;
            };
            let stale: Vec<usize> = relation
                .members
                .iter()
                .enumerate()
                .filter(|(_, member)| member.resolved != self.contains(member.target()))
                .map(|(index, _)| index)
                .collect();
            if stale.is_empty() {
                continue;
            }
            let resolved: Vec<bool> = stale
                .iter()
                .map(|index| self.contains(relation.members[*index].target()))
                .collect();
            if let Some(relation) = self.relations.get_mut(id) {
                for (index, resolved) in stale.into_iter().zip(resolved) {
                    relation.members[index].resolved = resolved;
                }
            }
            pending.insert(*id);
        }

        let bound = ids.len() + 2;
        let mut passes = 0;
        while !frontier.is_empty() || !pending.is_empty() {
            passes += 1;
            if passes > bound {
                return Err(Error::invariant(format!(
                    "Relation resolution did not settle after {} passes",
                    bound
                )));
            }
            for id in &ids {
                if let Some(relation) = self.relations.get(id) {
                    if relation.members.iter().any(|member| frontier.contains(&member.target())) {
                        pending.insert(*id);
                    }
                }
            }
            frontier.clear();
            for id in pending.drain() {
                let ext = ExtendedId::relation(id);
                if self.reindex(ext) {
                    frontier.insert(ext);
                }
            }
        }
        debug!(passes = passes; "Relations resolved");
        Ok(())
    }

    /// Brings the index entry of `ext` in line with its geometry without
    /// touching the undo log. Returns whether the entry changed.
    pub(crate) fn reindex(&mut self, ext: ExtendedId) -> bool {
        let live = self.entity(ext).map(|e| !e.meta().deleted).unwrap_or(false);
        let bbox = if live { self.bounding_box(ext) } else { OsmRect::zero() };
        let recorded = self.spatial.recorded_box(ext);
        match (recorded, bbox.is_zero()) {
            (Some(_), true) => {
                self.spatial.remove_member(ext);
                true
            }
            (Some(previous), false) if previous != bbox => {
                self.spatial.update_member(ext, bbox);
                true
            }
            (None, false) => {
                self.spatial.add_member(ext, bbox);
                true
            }
            _ => false,
        }
    }
}

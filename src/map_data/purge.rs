use std::collections::{BTreeSet, HashMap, HashSet};

use log::{debug, error, info};

use crate::data::geometry::OsmRect;
use crate::data::osm::{EntityRef, ExtendedId, OsmId, OsmType};
use crate::map_data::MapData;
use crate::persist::PersistDelta;
use crate::spatial::now_secs;

/// Above this many objects old coverage is discarded in proportion.
pub const DEFAULT_OBJECT_LIMIT: usize = 100_000;
/// Coverage older than this is always discarded.
pub const DEFAULT_DISCARD_AGE_SECS: f64 = 24.0 * 60.0 * 60.0;

impl MapData {
    /// Forgets everything, the undo log included. Used when the graph can no
    /// longer be trusted.
    pub fn purge_hard(&mut self) {
        self.nodes.clear();
        self.ways.clear();
        self.relations.clear();
        self.region.reset();
        self.spatial.reset();
        self.undo.remove_all_actions();
        info!("Purged all map data");
    }

    /// Forgets downloaded data the user has not touched. Modified entities
    /// and everything the undo log refers to stay, and all coverage is reset
    /// so the area is fetched again.
    pub fn purge_soft(&mut self) {
        let keep = self.protected_entities();
        let before = self.object_count();
        self.nodes.retain(|id, _| keep.contains(&ExtendedId::node(*id)));
        self.ways.retain(|id, _| keep.contains(&ExtendedId::way(*id)));
        self.relations
            .retain(|id, _| keep.contains(&ExtendedId::relation(*id)));
        self.region.reset();
        self.rebuild_derived_state();
        info!(kept = self.object_count(), removed = before - self.object_count(); "Soft purge");
    }

    /// Entities a purge must never drop: anything with unsent changes or
    /// referenced by the undo log, plus the nodes of those ways.
    fn protected_entities(&self) -> BTreeSet<ExtendedId> {
        let mut keep = self.undo.object_refs();
        let dirty = self
            .nodes
            .values()
            .map(EntityRef::Node)
            .chain(self.ways.values().map(EntityRef::Way))
            .chain(self.relations.values().map(EntityRef::Relation))
            .filter(|entity| entity.meta().needs_upload() || entity.meta().is_modified())
            .map(|entity| entity.extended_id());
        keep.extend(dirty.collect::<Vec<_>>());
        let way_nodes: Vec<ExtendedId> = keep
            .iter()
            .filter(|ext| ext.kind == OsmType::Way)
            .filter_map(|ext| self.ways.get(&ext.id))
            .flat_map(|way| way.nodes.iter().map(|id| ExtendedId::node(*id)))
            .collect();
        keep.extend(way_nodes);
        keep
    }

    /// Recomputes way counts, member resolution and the object index from
    /// the arenas alone.
    pub(crate) fn rebuild_derived_state(&mut self) {
        let mut way_counts: HashMap<OsmId, u32> = HashMap::new();
        for way in self.ways.values() {
            for node in &way.nodes {
                *way_counts.entry(*node).or_default() += 1;
            }
        }
        for node in self.nodes.values_mut() {
            node.way_count = way_counts.get(&node.meta.id).copied().unwrap_or(0);
        }
        self.fix_member_resolution();

        self.spatial.reset();
        let all: Vec<ExtendedId> = self
            .nodes
            .keys()
            .map(|id| ExtendedId::node(*id))
            .chain(self.ways.keys().map(|id| ExtendedId::way(*id)))
            .chain(self.relations.keys().map(|id| ExtendedId::relation(*id)))
            .collect();
        for ext in all {
            self.reindex(ext);
        }
        debug!(indexed = self.spatial.len(); "Rebuilt derived state");
    }

    fn fix_member_resolution(&mut self) {
        let present: HashSet<ExtendedId> = self
            .nodes
            .keys()
            .map(|id| ExtendedId::node(*id))
            .chain(self.ways.keys().map(|id| ExtendedId::way(*id)))
            .chain(self.relations.keys().map(|id| ExtendedId::relation(*id)))
            .collect();
        for relation in self.relations.values_mut() {
            for member in relation.members.iter_mut() {
                member.resolved = present.contains(&member.target());
            }
        }
    }

    /// Trims the graph when it is too large or too old, using the default
    /// limits.
    pub fn discard_stale_data(&mut self) -> Option<PersistDelta> {
        self.discard_stale_data_with(DEFAULT_OBJECT_LIMIT, DEFAULT_DISCARD_AGE_SECS, now_secs())
    }

    /// Evicts old download coverage and then every unmodified entity that no
    /// longer touches covered ground. Nothing is discarded while there are
    /// unsent changes. Returns the deletions for the local cache, or `None`
    /// when nothing was removed.
    pub fn discard_stale_data_with(&mut self, limit: usize, max_age_secs: f64, now: f64) -> Option<PersistDelta> {
        if self.modification_count() > 0 {
            return None;
        }
        let keep = self.protected_entities();
        let protected: Vec<OsmRect> = keep
            .iter()
            .map(|ext| self.bounding_box(*ext))
            .filter(|rect| !rect.is_zero())
            .collect();

        let mut oldest = now - max_age_secs;
        let mut fraction = self.object_count() as f64 / limit.max(1) as f64;
        if fraction <= 1.0 {
            fraction = 0.0;
        } else {
            fraction = (1.0 - 1.0 / fraction).max(0.3);
        }

        let mut removed = PersistDelta::default();
        let mut expanded = false;
        loop {
            let Some(cutoff) = self.region.discard_oldest_quads(fraction, oldest, &protected) else {
                if !expanded {
                    return None;
                }
                break;
            };
            oldest = cutoff;
            let pass = self.remove_uncovered(&keep);
            let count = pass.delete_count();
            removed.append(pass);
            debug!(removed = count, cutoff = cutoff; "Discard pass");

            if (self.object_count() as f64) < limit as f64 * 1.3 {
                if !expanded && count == 0 {
                    return None;
                }
                break;
            }
            expanded = true;
            fraction = 0.3;
        }

        let (nodes, ways, relations) = (&self.nodes, &self.ways, &self.relations);
        self.spatial.delete_objects(|ext| match ext.kind {
            OsmType::Node => !nodes.contains_key(&ext.id),
            OsmType::Way => !ways.contains_key(&ext.id),
            OsmType::Relation => !relations.contains_key(&ext.id),
        });
        self.fix_member_resolution();
        let changed: HashSet<ExtendedId> = self
            .relations
            .keys()
            .map(|id| ExtendedId::relation(*id))
            .collect();
        if let Err(err) = self.resolve_relations(&changed) {
            error!(error = err.message.as_str(); "Relation boxes unsettled after discard");
        }
        info!(
            nodes = removed.delete_nodes.len(),
            ways = removed.delete_ways.len(),
            relations = removed.delete_relations.len();
            "Discarded stale data"
        );
        Some(removed)
    }

    fn remove_uncovered(&mut self, keep: &BTreeSet<ExtendedId>) -> PersistDelta {
        let mut removed = PersistDelta::default();
        let candidates = |ext: ExtendedId| !keep.contains(&ext);

        for relation in self.relations.values() {
            let ext = ExtendedId::relation(relation.meta.id);
            if candidates(ext) && !relation.meta.is_modified() && !self.is_covered(ext) {
                removed.delete_relations.push(ext.id);
            }
        }
        for way in self.ways.values() {
            let ext = ExtendedId::way(way.meta.id);
            if candidates(ext) && !way.meta.is_modified() && !self.is_covered(ext) {
                removed.delete_ways.push(ext.id);
            }
        }
        for id in &removed.delete_ways {
            if let Some(way) = self.ways.remove(id) {
                for node in &way.nodes {
                    if let Some(node) = self.nodes.get_mut(node) {
                        node.way_count = node.way_count.saturating_sub(1);
                    }
                }
            }
        }
        for node in self.nodes.values() {
            let ext = ExtendedId::node(node.meta.id);
            if candidates(ext)
                && !node.meta.is_modified()
                && node.way_count == 0
                && !self.region.point_is_covered(node.location())
            {
                removed.delete_nodes.push(ext.id);
            }
        }
        for id in &removed.delete_nodes {
            self.nodes.remove(id);
        }
        for id in &removed.delete_relations {
            self.relations.remove(id);
        }
        removed
    }

    /// Entities touched since the last upload, ready to persist.
    pub fn dirty_entities(&self) -> PersistDelta {
        PersistDelta {
            save_nodes: self.nodes.values().filter(|n| n.meta.is_modified()).cloned().collect(),
            save_ways: self.ways.values().filter(|w| w.meta.is_modified()).cloned().collect(),
            save_relations: self
                .relations
                .values()
                .filter(|r| r.meta.is_modified())
                .cloned()
                .collect(),
            ..Default::default()
        }
    }
}

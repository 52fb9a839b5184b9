//! An editing session: the graph plus the download, upload and persistence
//! machinery around it, and the session archive that lets unsent edits and
//! their undo history survive a restart.

use std::collections::BTreeSet;
use std::fs::{self, File};
use std::io::{BufReader, BufWriter, Write};
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use log::{error, info, warn};
use serde::{Deserialize, Serialize};

use crate::config::Config;
use crate::data::geometry::OsmRect;
use crate::data::osm::{ExtendedId, OsmId};
use crate::data::tags::Tags;
use crate::data::OsmDownloadData;
use crate::errors::{Error, Result};
use crate::map_data::MapData;
use crate::persist::queue::{PersistEvent, PersistQueue};
use crate::persist::{PersistDelta, Persistence};
use crate::spatial::now_secs;
use crate::spatial::region::RegionIndex;
use crate::sync::download::{DownloadReport, Downloader};
use crate::sync::upload::{upload_changeset, UploadReport};
use crate::sync::Transport;
use crate::undo::UndoManager;

/// What is written to the archive file on save.
#[derive(Serialize, Deserialize, Debug, Default, Clone, PartialEq)]
pub struct SessionArchive {
    pub undo: UndoManager,
    pub region: RegionIndex,
    /// Entities with unsent edits or referenced by the undo log.
    pub edited: OsmDownloadData,
    pub next_placeholder: OsmId,
}

impl SessionArchive {
    pub fn capture(map: &MapData) -> Self {
        let mut edited = map.modified_objects();
        let mut seen: BTreeSet<ExtendedId> = edited.extended_ids().collect();
        let dirty = map.dirty_entities();
        edited.nodes.extend(
            dirty
                .save_nodes
                .into_iter()
                .filter(|node| seen.insert(ExtendedId::node(node.meta.id))),
        );
        edited.ways.extend(
            dirty
                .save_ways
                .into_iter()
                .filter(|way| seen.insert(ExtendedId::way(way.meta.id))),
        );
        edited.relations.extend(
            dirty
                .save_relations
                .into_iter()
                .filter(|relation| seen.insert(ExtendedId::relation(relation.meta.id))),
        );
        SessionArchive {
            undo: map.undo_manager().clone(),
            region: map.region().clone(),
            edited,
            next_placeholder: map.next_placeholder(),
        }
    }

    pub fn read(path: &Path) -> Result<Option<Self>> {
        if !path.exists() {
            return Ok(None);
        }
        let file = File::open(path)?;
        let archive = serde_json::from_reader(BufReader::new(file))
            .map_err(|err| Error::persistence(format!("Corrupt session archive: {}", err)))?;
        Ok(Some(archive))
    }

    pub fn write(&self, path: &Path) -> Result<()> {
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)?;
        }
        let staging = path.with_extension("tmp");
        let mut writer = BufWriter::new(File::create(&staging)?);
        serde_json::to_writer(&mut writer, self)?;
        writer.flush()?;
        fs::rename(&staging, path)?;
        Ok(())
    }
}

pub struct EditSession {
    map: MapData,
    config: Config,
    transport: Arc<dyn Transport>,
    downloader: Downloader,
    /// `None` when the worker could not be started; editing goes on
    /// without a cache.
    persist: Option<PersistQueue>,
    store_healthy: bool,
}

impl EditSession {
    /// Restores the last session from the cache and the archive. A cache
    /// that cannot be read is cleared and all coverage dropped, so the data
    /// is simply downloaded again; saved edits survive either way. A broken
    /// store never keeps the session from opening.
    pub fn open(config: Config, transport: Arc<dyn Transport>, mut store: Box<dyn Persistence + Send>) -> Result<Self> {
        let archive_path = Path::new(&config.archive_path);
        let mut archive = match SessionArchive::read(archive_path) {
            Ok(archive) => archive.unwrap_or_default(),
            Err(err) => {
                warn!(error = err.message.as_str(); "Ignoring session archive");
                SessionArchive::default()
            }
        };

        let mut store_healthy = true;
        let cached = match store.load_all() {
            Ok(cached) => cached,
            Err(err) => {
                error!(error = err.message.as_str(); "Local cache unreadable, starting over");
                store_healthy = clear_store(store.as_mut());
                archive.region = RegionIndex::new();
                OsmDownloadData::default()
            }
        };

        let mut map = MapData::new(&config.user_name);
        map.restore_entities(cached, archive.edited);
        map.restore_session_state(archive.undo, archive.region, archive.next_placeholder);
        if let Err(err) = map.consistency_check() {
            error!(error = err.message.as_str(); "Restored graph is inconsistent, discarding it");
            map.purge_hard();
            store_healthy &= clear_store(store.as_mut());
        }
        info!(
            objects = map.object_count(),
            edits = map.modification_count(),
            user = config.user_name.as_str();
            "Session opened"
        );

        let persist = match PersistQueue::spawn(store) {
            Ok(queue) => Some(queue),
            Err(err) => {
                warn!(error = err.message.as_str(); "Persistence worker not started, editing without cache");
                store_healthy = false;
                None
            }
        };

        Ok(EditSession {
            map,
            downloader: Downloader::new(Arc::clone(&transport)),
            persist,
            store_healthy,
            transport,
            config,
        })
    }

    /// False once a cache read or write failed. Cleared again by the next
    /// successful write.
    pub fn store_healthy(&self) -> bool {
        self.store_healthy
    }

    pub fn map(&self) -> &MapData {
        &self.map
    }

    pub fn map_mut(&mut self) -> &mut MapData {
        &mut self.map
    }

    pub fn config(&self) -> &Config {
        &self.config
    }

    /// Writes the archive. Cache writes are already queued as they happen.
    pub fn save(&self) -> Result<()> {
        let archive = SessionArchive::capture(&self.map);
        archive.write(Path::new(&self.config.archive_path))?;
        info!(
            edited = archive.edited.len(),
            undo_groups = self.map.undo_manager().count_undo_groups();
            "Session saved"
        );
        Ok(())
    }

    pub fn download(&mut self, viewport: OsmRect) -> Result<usize> {
        self.downloader.download_missing_data(&mut self.map, viewport)
    }

    pub fn downloads_in_progress(&self) -> usize {
        self.downloader.downloads_in_progress()
    }

    /// Merges finished downloads and queues their entities for the cache.
    /// Meant to be called from the editing loop.
    pub fn pump(&mut self) -> Result<DownloadReport> {
        let mut report = self.downloader.process_completions(&mut self.map);
        self.queue_save(std::mem::take(&mut report.persist));
        self.drain_persist_events();
        Ok(report)
    }

    pub fn wait_for_downloads(&mut self, timeout: Duration) -> Result<DownloadReport> {
        let mut report = self.downloader.wait_for_completions(&mut self.map, timeout);
        self.queue_save(std::mem::take(&mut report.persist));
        self.drain_persist_events();
        Ok(report)
    }

    fn queue_save(&mut self, delta: PersistDelta) {
        let Some(persist) = &self.persist else {
            return;
        };
        if let Err(err) = persist.save(delta) {
            warn!(error = err.message.as_str(); "Cache write not queued");
            self.store_healthy = false;
        }
    }

    fn queue_clear(&mut self) {
        let Some(persist) = &self.persist else {
            return;
        };
        if let Err(err) = persist.clear() {
            warn!(error = err.message.as_str(); "Cache clear not queued");
            self.store_healthy = false;
        }
    }

    fn drain_persist_events(&mut self) {
        let Some(persist) = &self.persist else {
            return;
        };
        for event in persist.poll_events() {
            match event {
                PersistEvent::Failed(err) => {
                    warn!(error = err.message.as_str(); "Cache write failed");
                    self.store_healthy = false;
                }
                PersistEvent::Saved { .. } | PersistEvent::Cleared => self.store_healthy = true,
            }
        }
    }

    /// Uploads all local changes. Running downloads are cancelled first so
    /// no merge lands between building the changeset and applying the
    /// server's answer. An upload whose answer was unreadable empties the
    /// cache as well.
    pub fn upload(&mut self, tags: &Tags) -> Result<UploadReport> {
        self.downloader.cancel_current_downloads(&mut self.map);
        let mut report = upload_changeset(&mut self.map, self.transport.as_ref(), &self.config, tags)?;
        if report.refetch_required {
            self.queue_clear();
        }
        self.queue_save(std::mem::take(&mut report.persist));
        self.save()?;
        Ok(report)
    }

    /// Trims old data from the graph and the cache. Returns whether anything
    /// was removed.
    pub fn discard_stale_data(&mut self) -> Result<bool> {
        let removed = self.map.discard_stale_data_with(
            self.config.object_limit,
            self.config.discard_age_secs,
            now_secs(),
        );
        match removed {
            Some(delta) => {
                self.queue_save(delta);
                Ok(true)
            }
            None => Ok(false),
        }
    }

    /// Saves the archive and waits for pending cache writes.
    pub fn close(mut self) -> Result<()> {
        self.downloader.cancel_current_downloads(&mut self.map);
        self.save()?;
        if let Some(persist) = &self.persist {
            if let Err(err) = persist.flush() {
                warn!(error = err.message.as_str(); "Pending cache writes lost");
            }
        }
        self.drain_persist_events();
        Ok(())
    }
}

/// Empties a store that could not be trusted. Returns whether that worked.
fn clear_store(store: &mut dyn Persistence) -> bool {
    match store.clear() {
        Ok(()) => true,
        Err(err) => {
            warn!(error = err.message.as_str(); "Cache could not be cleared, editing without it");
            false
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::data::osm::{EntityMeta, Node};
    use crate::persist::MemoryStore;
    use crate::sync::Response;

    /// Fails every call, like a cache on a vanished disk.
    struct DiskGone;

    impl Persistence for DiskGone {
        fn save_delta(&mut self, _delta: &PersistDelta) -> Result<()> {
            Err(Error::persistence("disk gone"))
        }

        fn load_all(&mut self) -> Result<OsmDownloadData> {
            Err(Error::persistence("disk gone"))
        }

        fn clear(&mut self) -> Result<()> {
            Err(Error::persistence("disk gone"))
        }
    }

    struct Offline;

    impl Transport for Offline {
        fn get(&self, _path: &str) -> Result<Response> {
            Err(Error::transport("offline"))
        }

        fn put(&self, _path: &str, _body: &str) -> Result<Response> {
            Err(Error::transport("offline"))
        }

        fn post(&self, _path: &str, _body: &str) -> Result<Response> {
            Err(Error::transport("offline"))
        }
    }

    fn config(dir: &Path) -> Config {
        Config {
            user_name: "mapper".to_string(),
            archive_path: dir.join("session.json").to_string_lossy().into_owned(),
            ..Default::default()
        }
    }

    #[test]
    fn edits_and_undo_survive_a_restart() {
        let dir = tempfile::tempdir().unwrap();
        let mut store = MemoryStore::default();
        store
            .save_delta(&crate::persist::PersistDelta {
                save_nodes: vec![Node::new(
                    EntityMeta {
                        id: 5,
                        version: 1,
                        ..Default::default()
                    },
                    1.0,
                    1.0,
                )],
                ..Default::default()
            })
            .unwrap();

        let mut session = EditSession::open(config(dir.path()), Arc::new(Offline), Box::new(store.clone())).unwrap();
        assert_eq!(session.map().node_count(), 1);
        let created = session.map_mut().create_node(2.0, 2.0).unwrap();
        session.map_mut().set_location(5, 1.5, 1.0).unwrap();
        session.close().unwrap();

        let mut session = EditSession::open(config(dir.path()), Arc::new(Offline), Box::new(store)).unwrap();
        let map = session.map_mut();
        assert!(map.node(created).unwrap().meta.is_modified());
        assert_eq!(map.node(5).unwrap().lat, 1.5);
        assert!(map.next_placeholder() < created);
        map.undo().unwrap();
        assert_eq!(map.node(5).unwrap().lat, 1.0);
        map.consistency_check().unwrap();
    }

    #[test]
    fn corrupt_archive_is_ignored() {
        let dir = tempfile::tempdir().unwrap();
        let config = config(dir.path());
        fs::write(&config.archive_path, "{ not json").unwrap();
        let session = EditSession::open(config, Arc::new(Offline), Box::new(MemoryStore::default())).unwrap();
        assert_eq!(session.map().object_count(), 0);
    }

    #[test]
    fn broken_store_still_opens_for_editing() {
        let dir = tempfile::tempdir().unwrap();
        let mut session = EditSession::open(config(dir.path()), Arc::new(Offline), Box::new(DiskGone)).unwrap();
        assert!(!session.store_healthy());
        assert_eq!(session.map().object_count(), 0);

        let node = session.map_mut().create_node(1.0, 1.0).unwrap();
        assert!(session.map().node(node).is_some());
        session.pump().unwrap();
        session.close().unwrap();
    }

    #[test]
    fn failed_cache_writes_mark_the_store_unhealthy() {
        struct WriteOnlyFails;

        impl Persistence for WriteOnlyFails {
            fn save_delta(&mut self, _delta: &PersistDelta) -> Result<()> {
                Err(Error::persistence("disk full"))
            }

            fn load_all(&mut self) -> Result<OsmDownloadData> {
                Ok(OsmDownloadData::default())
            }

            fn clear(&mut self) -> Result<()> {
                Ok(())
            }
        }

        let dir = tempfile::tempdir().unwrap();
        let mut session = EditSession::open(config(dir.path()), Arc::new(Offline), Box::new(WriteOnlyFails)).unwrap();
        assert!(session.store_healthy());
        session.queue_save(PersistDelta {
            delete_nodes: vec![7],
            ..Default::default()
        });
        session.persist.as_ref().unwrap().flush().unwrap();
        session.drain_persist_events();
        assert!(!session.store_healthy());
        // editing carries on
        session.map_mut().create_node(1.0, 1.0).unwrap();
    }
}

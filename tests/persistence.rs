use std::fs;
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use osm_editor_core::config::Config;
use osm_editor_core::data::geometry::{OsmPoint, OsmRect};
use osm_editor_core::errors::{Error, Result};
use osm_editor_core::persist::file_store::FileStore;
use osm_editor_core::session::EditSession;
use osm_editor_core::sync::{Response, Transport};

/// Serves a way with two nodes for any map request.
struct MapServer;

impl Transport for MapServer {
    fn get(&self, path: &str) -> Result<Response> {
        if !path.starts_with("api/0.6/map?") {
            return Err(Error::transport("unexpected request"));
        }
        Ok(Response::ok(
            r#"<osm version="0.6">
  <node id="1" version="1" lat="20.1" lon="20.1"/>
  <node id="2" version="1" lat="20.2" lon="20.2"/>
  <way id="3" version="1"><nd ref="1"/><nd ref="2"/></way>
</osm>"#,
        ))
    }

    fn put(&self, _path: &str, _body: &str) -> Result<Response> {
        Err(Error::transport("read only"))
    }

    fn post(&self, _path: &str, _body: &str) -> Result<Response> {
        Err(Error::transport("read only"))
    }
}

fn config(dir: &Path) -> Config {
    Config {
        user_name: "mapper".to_string(),
        cache_path: dir.join("cache.rkyv.xz").to_string_lossy().into_owned(),
        archive_path: dir.join("session.json").to_string_lossy().into_owned(),
        ..Default::default()
    }
}

fn open(config: &Config) -> EditSession {
    let store = FileStore::new(&config.cache_path);
    EditSession::open(config.clone(), Arc::new(MapServer), Box::new(store)).unwrap()
}

fn download_and_edit(config: &Config) {
    let mut session = open(config);
    session.download(OsmRect::new(20.0, 20.0, 0.5, 0.5)).unwrap();
    let report = session.wait_for_downloads(Duration::from_secs(10)).unwrap();
    assert!(!report.is_partial());
    session.map_mut().tick();
    session.map_mut().set_location(2, 20.3, 20.2).unwrap();
    session.close().unwrap();
}

#[test]
fn downloads_and_edits_survive_a_restart() {
    let dir = tempfile::tempdir().unwrap();
    let config = config(dir.path());
    download_and_edit(&config);

    let mut session = open(&config);
    let map = session.map();
    assert_eq!(map.node_count(), 2);
    assert_eq!(map.way(3).unwrap().nodes, vec![1, 2]);
    assert_eq!(map.node(1).unwrap().way_count, 1);
    assert_eq!(map.node(2).unwrap().lat, 20.3);
    assert!(map.region().point_is_covered(OsmPoint { x: 20.25, y: 20.25 }));
    assert_eq!(map.modification_count(), 1);
    map.consistency_check().unwrap();

    // covered ground is not fetched again
    assert_eq!(session.download(OsmRect::new(20.0, 20.0, 0.5, 0.5)).unwrap(), 0);
    session.map_mut().undo().unwrap();
    assert_eq!(session.map().node(2).unwrap().lat, 20.2);
}

#[test]
fn corrupt_cache_degrades_to_a_fresh_download() {
    let dir = tempfile::tempdir().unwrap();
    let config = config(dir.path());
    download_and_edit(&config);
    fs::write(&config.cache_path, b"definitely not xz").unwrap();

    let session = open(&config);
    let map = session.map();
    // the edited node and its way come from the archive
    assert_eq!(map.node(2).unwrap().lat, 20.3);
    assert!(!map.region().point_is_covered(OsmPoint { x: 20.25, y: 20.25 }));
    map.consistency_check().unwrap();
}

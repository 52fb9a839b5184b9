use std::env;
use std::io;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use log::info;
use structured_logger::json::new_writer;
use structured_logger::Builder;

use osm_editor_core::config::{load_config, Config};
use osm_editor_core::errors::{Error, Result};
use osm_editor_core::etl::import_osm::ImportOsmEtl;
use osm_editor_core::etl::Etl;
use osm_editor_core::persist::file_store::FileStore;
use osm_editor_core::session::EditSession;
use osm_editor_core::sync::{Response, Transport};

const USAGE: &str = "usage: osm_editor_core <config.json> (import <file> | stats)";

/// The commands here never talk to the server.
struct Offline;

impl Transport for Offline {
    fn get(&self, path: &str) -> Result<Response> {
        Err(Error::transport(format!("offline, cannot GET {}", path)))
    }

    fn put(&self, path: &str, _body: &str) -> Result<Response> {
        Err(Error::transport(format!("offline, cannot PUT {}", path)))
    }

    fn post(&self, path: &str, _body: &str) -> Result<Response> {
        Err(Error::transport(format!("offline, cannot POST {}", path)))
    }
}

fn setup_logging(config: &Config) {
    Builder::with_level(&config.log_level)
        .with_target_writer("*", new_writer(io::stdout()))
        .init();
}

fn work_dir(config: &Config) -> PathBuf {
    Path::new(&config.cache_path)
        .parent()
        .map(Path::to_path_buf)
        .unwrap_or_default()
}

fn import(config: &Config, source: &str) -> Result<()> {
    let mut store = FileStore::new(&config.cache_path);
    let mut etl = ImportOsmEtl::new(source, &config.archive_path, &mut store);
    etl.process(&work_dir(config))
}

fn stats(config: Config) -> Result<()> {
    let store = FileStore::new(&config.cache_path);
    let session = EditSession::open(config, Arc::new(Offline), Box::new(store))?;
    let map = session.map();
    info!(
        nodes = map.node_count(),
        ways = map.way_count(),
        relations = map.relation_count(),
        edits = map.modification_count(),
        downloaded_quads = map.region().count_downloaded(),
        can_undo = map.can_undo();
        "Session stats"
    );
    session.close()
}

fn main() -> Result<()> {
    let args: Vec<String> = env::args().collect();
    let config_path = args.get(1).ok_or_else(|| Error::config(USAGE))?;
    let config = load_config(Path::new(config_path))?;
    setup_logging(&config);

    match (args.get(2).map(String::as_str), args.get(3)) {
        (Some("import"), Some(source)) => import(&config, source),
        (Some("stats"), None) => stats(config),
        _ => Err(Error::config(USAGE)),
    }
}

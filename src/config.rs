use std::fs::File;
use std::io::BufReader;
use std::path::Path;

use serde::{Deserialize, Serialize};

use crate::errors::{Error, Result};
use crate::map_data::purge::{DEFAULT_DISCARD_AGE_SECS, DEFAULT_OBJECT_LIMIT};
use crate::sync::upload::DEFAULT_UPLOAD_RETRIES;

/// Settings read from a JSON file. Every field has a default, so `{}` is a
/// valid config.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
#[serde(default)]
pub struct Config {
    pub server_url: String,
    /// Entity cache written by the persistence worker.
    pub cache_path: String,
    /// Undo log, coverage and unsaved edits.
    pub archive_path: String,
    pub user_name: String,
    /// `created_by` of uploaded changesets.
    pub generator: String,
    pub upload_retries: usize,
    pub object_limit: usize,
    pub discard_age_secs: f64,
    pub log_level: String,
}

impl Default for Config {
    fn default() -> Self {
        Config {
            server_url: "https://api.openstreetmap.org/".to_string(),
            cache_path: "cache/entities.rkyv.xz".to_string(),
            archive_path: "cache/session.json".to_string(),
            user_name: String::new(),
            generator: format!("{} {}", env!("CARGO_PKG_NAME"), env!("CARGO_PKG_VERSION")),
            upload_retries: DEFAULT_UPLOAD_RETRIES,
            object_limit: DEFAULT_OBJECT_LIMIT,
            discard_age_secs: DEFAULT_DISCARD_AGE_SECS,
            log_level: "info".to_string(),
        }
    }
}

pub fn load_config(path: &Path) -> Result<Config> {
    let file = File::open(path)
        .map_err(|err| Error::config(format!("Could not open config {}: {}", path.display(), err)))?;
    serde_json::from_reader(BufReader::new(file))
        .map_err(|err| Error::config(format!("Could not parse config {}: {}", path.display(), err)))
}

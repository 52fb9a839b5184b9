use std::fs;
use std::io::{BufReader, Read, Write};
use std::path::{Path, PathBuf};

use log::{debug, info};
use xz::bufread::XzDecoder;
use xz::write::XzEncoder;

use crate::data::OsmDownloadData;
use crate::errors::{Error, Result};
use crate::persist::{PersistDelta, Persistence, Tables};

const COMPRESSION_LEVEL: u32 = 6;

/// Tables archived with rkyv and compressed with xz in a single file. Every
/// save rewrites the file through a temporary sibling and a rename, so a
/// crash never leaves a half written cache behind.
pub struct FileStore {
    path: PathBuf,
    tables: Option<Tables>,
}

impl FileStore {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        FileStore {
            path: path.into(),
            tables: None,
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    fn read_tables(&self) -> Result<Tables> {
        if !self.path.exists() {
            return Ok(Tables::default());
        }
        let file = fs::File::open(&self.path)?;
        let mut decoder = XzDecoder::new(BufReader::new(file));
        let mut buf = Vec::new();
        decoder.read_to_end(&mut buf)?;
        let mut aligned = rkyv::AlignedVec::with_capacity(buf.len());
        aligned.extend_from_slice(&buf);
        rkyv::from_bytes::<Tables>(&aligned)
            .map_err(|err| Error::persistence(format!("Corrupt cache {:?}: {:?}", self.path, err)))
    }

    fn write_tables(&self, tables: &Tables) -> Result<()> {
        let bytes = rkyv::to_bytes::<_, 256>(tables)
            .map_err(|err| Error::persistence(format!("Could not serialize cache: {:?}", err)))?;
        if let Some(parent) = self.path.parent().filter(|p| !p.as_os_str().is_empty()) {
            fs::create_dir_all(parent)?;
        }
        let tmp_path = self.path.with_extension("tmp");
        {
            let file = fs::File::create(&tmp_path)?;
            let mut encoder = XzEncoder::new(file, COMPRESSION_LEVEL);
            encoder.write_all(&bytes)?;
            encoder.finish()?.sync_all()?;
        }
        fs::rename(&tmp_path, &self.path)?;
        debug!(path = self.path.to_string_lossy().as_ref(), bytes = bytes.len(); "Wrote cache file");
        Ok(())
    }

    fn tables(&mut self) -> Result<&mut Tables> {
        if self.tables.is_none() {
            self.tables = Some(self.read_tables()?);
        }
        self.tables
            .as_mut()
            .ok_or_else(|| Error::persistence("Cache tables unavailable"))
    }
}

impl Persistence for FileStore {
    fn save_delta(&mut self, delta: &PersistDelta) -> Result<()> {
        let tables = self.tables()?;
        tables.apply(delta);
        let snapshot = tables.clone();
        self.write_tables(&snapshot)
    }

    fn load_all(&mut self) -> Result<OsmDownloadData> {
        let tables = self.read_tables()?;
        let data = tables.load();
        info!(
            path = self.path.to_string_lossy().as_ref(),
            nodes = data.nodes.len(),
            ways = data.ways.len(),
            relations = data.relations.len();
            "Loaded cache"
        );
        self.tables = Some(tables);
        Ok(data)
    }

    fn clear(&mut self) -> Result<()> {
        self.tables = Some(Tables::default());
        if self.path.exists() {
            fs::remove_file(&self.path)?;
        }
        info!(path = self.path.to_string_lossy().as_ref(); "Cleared cache");
        Ok(())
    }
}

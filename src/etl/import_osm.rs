use std::fs;
use std::io::{BufReader, Read};
use std::path::{Path, PathBuf};

use log::info;
use xz::bufread::XzDecoder;

use crate::codec::decode_osm;
use crate::data::OsmDownloadData;
use crate::errors::Result;
use crate::etl::Etl;
use crate::map_data::MapData;
use crate::persist::Persistence;
use crate::session::SessionArchive;

const ETL_NAME: &str = "import_osm";
const STAMP_FILE_NAME: &str = "import_osm.stamp";

/// Seeds the local cache from an `.osm` or `.osm.xz` extract, as if the
/// area had been downloaded. Quads lying fully inside the extract's bounds
/// are recorded as covered in the session archive.
pub struct ImportOsmEtl<'a> {
    source: PathBuf,
    archive_path: PathBuf,
    store: &'a mut dyn Persistence,
}

impl<'a> ImportOsmEtl<'a> {
    pub fn new(source: impl Into<PathBuf>, archive_path: impl Into<PathBuf>, store: &'a mut dyn Persistence) -> Self {
        ImportOsmEtl {
            source: source.into(),
            archive_path: archive_path.into(),
            store,
        }
    }

    fn stamp(&self) -> String {
        self.source.display().to_string()
    }

    fn read_source(&self) -> Result<String> {
        let mut file = BufReader::new(fs::File::open(&self.source)?);
        let mut text = String::new();
        if self.source.extension().map_or(false, |ext| ext == "xz") {
            XzDecoder::new(file).read_to_string(&mut text)?;
        } else {
            file.read_to_string(&mut text)?;
        }
        Ok(text)
    }

    fn record_coverage(&self, data: &OsmDownloadData) -> Result<usize> {
        let Some(bounds) = data.bounds else {
            return Ok(0);
        };
        let mut archive = SessionArchive::read(&self.archive_path)?.unwrap_or_default();
        let quads = archive.region.new_quads(&bounds);
        let (inside, outside): (Vec<_>, Vec<_>) = quads.into_iter().partition(|quad| bounds.contains_rect(quad));
        for quad in &inside {
            archive.region.make_whole(quad, true);
        }
        archive.region.cancel(&outside);
        archive.write(&self.archive_path)?;
        Ok(inside.len())
    }
}

impl Etl for ImportOsmEtl<'_> {
    type Input = String;
    type Output = OsmDownloadData;

    fn etl_name(&self) -> &str {
        ETL_NAME
    }

    fn is_cached(&self, dir: &Path) -> Result<bool> {
        match fs::read_to_string(dir.join(STAMP_FILE_NAME)) {
            Ok(stamp) => Ok(stamp == self.stamp()),
            Err(_) => Ok(false),
        }
    }

    fn clean(&self, dir: &Path) -> Result<()> {
        let stamp = dir.join(STAMP_FILE_NAME);
        if stamp.exists() {
            fs::remove_file(stamp)?;
        }
        Ok(())
    }

    fn extract(&mut self, _dir: &Path) -> Result<Self::Input> {
        self.read_source()
    }

    fn transform(&mut self, input: Self::Input) -> Result<Self::Output> {
        decode_osm(&input)
    }

    fn load(&mut self, dir: &Path, output: Self::Output) -> Result<()> {
        let covered = self.record_coverage(&output)?;
        let mut map = MapData::default();
        let outcome = map.merge(output, true, &[], true)?;
        self.store.save_delta(&outcome.persist)?;
        fs::create_dir_all(dir)?;
        fs::write(dir.join(STAMP_FILE_NAME), self.stamp())?;
        info!(
            etl_name = ETL_NAME,
            objects = outcome.merged,
            covered_quads = covered;
            "Imported extract"
        );
        Ok(())
    }
}

pub mod import_osm;

use std::path::Path;
use std::time::Instant;

use log::{error, info};

use crate::errors::Result;

/// Logs the outcome of one stage and passes it on.
fn logged_stage<T>(etl_name: &str, stage: &str, started: Instant, result: Result<T>) -> Result<T> {
    match &result {
        Ok(_) => info!(
            etl_name = etl_name,
            stage = stage,
            elapsed_ms = started.elapsed().as_millis() as u64;
            "Stage finished"
        ),
        Err(err) => error!(
            etl_name = etl_name,
            stage = stage,
            err = err.message.as_str();
            "Stage failed with error"
        ),
    }
    result
}

/// A batch job run in three logged stages. `dir` is the job's working
/// directory, where it keeps whatever marks it as done.
pub trait Etl {
    type Input;
    type Output;

    fn etl_name(&self) -> &str;

    fn is_cached(&self, dir: &Path) -> Result<bool>;
    fn clean(&self, dir: &Path) -> Result<()>;

    fn extract(&mut self, dir: &Path) -> Result<Self::Input>;
    fn transform(&mut self, input: Self::Input) -> Result<Self::Output>;
    fn load(&mut self, dir: &Path, output: Self::Output) -> Result<()>;

    fn process(&mut self, dir: &Path) -> Result<()> {
        let name = self.etl_name().to_string();
        if self.is_cached(dir)? {
            info!(etl_name = name.as_str(); "Already done, skipping");
            return Ok(());
        }
        let started = Instant::now();
        let extracted = self.extract(dir);
        let input = logged_stage(&name, "extract", started, extracted)?;

        let started = Instant::now();
        let transformed = self.transform(input);
        let output = logged_stage(&name, "transform", started, transformed)?;

        let started = Instant::now();
        let loaded = self.load(dir, output);
        logged_stage(&name, "load", started, loaded)
    }

    /// Drops whatever marks the job as done and runs it again.
    fn reprocess(&mut self, dir: &Path) -> Result<()> {
        self.clean(dir)?;
        self.process(dir)
    }
}

use log::{debug, info};
use serde::{Deserialize, Serialize};

use crate::data::geometry::{OsmPoint, OsmRect};
use crate::spatial::{now_secs, quad_box::QuadBox};

/// Tracks which parts of the world have been downloaded completely.
#[derive(Serialize, Deserialize, Debug, Default, Clone, PartialEq)]
pub struct RegionIndex {
    root: QuadBox,
}

impl RegionIndex {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn root(&self) -> &QuadBox {
        &self.root
    }

    /// Returns the quads of `viewport` that are neither covered nor already
    /// being fetched, and marks them busy.
    pub fn new_quads(&mut self, viewport: &OsmRect) -> Vec<OsmRect> {
        let mut missing = Vec::new();
        self.root.missing_pieces(&mut missing, viewport);
        debug!(count = missing.len(); "New quads for viewport");
        missing
    }

    pub fn make_whole(&mut self, quad: &OsmRect, success: bool) -> bool {
        self.make_whole_at(quad, success, now_secs())
    }

    pub fn make_whole_at(&mut self, quad: &OsmRect, success: bool, date: f64) -> bool {
        self.root.make_whole(quad, success, date)
    }

    pub fn cancel(&mut self, quads: &[OsmRect]) {
        for quad in quads {
            self.root.make_whole(quad, false, 0.0);
        }
    }

    /// Evicts downloads older than the later of `older_than` and the date at
    /// the `fraction` percentile. Quads touching any `protected` box survive.
    /// Returns the cutoff used when something was evicted.
    pub fn discard_oldest_quads(
        &mut self,
        fraction: f64,
        older_than: f64,
        protected: &[OsmRect],
    ) -> Option<f64> {
        let mut cutoff = older_than;
        if fraction > 0.0 {
            let mut dates = Vec::new();
            self.root.for_each(&mut |quad| {
                if quad.download_date > 0.0 {
                    dates.push(quad.download_date);
                }
            });
            dates.sort_by(f64::total_cmp);
            if !dates.is_empty() {
                let index = ((dates.len() as f64 * fraction) as usize).min(dates.len() - 1);
                cutoff = cutoff.max(dates[index]);
            }
        }
        if self.root.discard_quads_older_than(cutoff, protected) {
            info!(cutoff = cutoff; "Discarded old download regions");
            Some(cutoff)
        } else {
            None
        }
    }

    pub fn point_is_covered(&self, point: OsmPoint) -> bool {
        self.root.point_is_covered(point)
    }

    pub fn any_point_is_covered(&self, points: &[OsmPoint]) -> bool {
        points.iter().any(|point| self.root.point_is_covered(*point))
    }

    pub fn count_busy(&self) -> usize {
        self.root.count_busy()
    }

    pub fn count_downloaded(&self) -> usize {
        let mut count = 0;
        self.root.for_each(&mut |quad| {
            if quad.download_date > 0.0 {
                count += 1
            }
        });
        count
    }

    pub fn reset(&mut self) {
        self.root.reset();
    }
}

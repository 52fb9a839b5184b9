use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};

use crossbeam_channel::{unbounded, Receiver, RecvTimeoutError, Sender};
use log::{debug, info, warn};

use crate::codec::decode_osm;
use crate::data::geometry::OsmRect;
use crate::data::OsmDownloadData;
use crate::errors::{Error, ErrorKind, Result};
use crate::map_data::MapData;
use crate::persist::PersistDelta;
use crate::sync::{coalesce_quad_queries, ServerQuery, Transport};

struct Completion {
    batch: u64,
    query: ServerQuery,
    result: Result<OsmDownloadData>,
}

/// What a round of completions did to the graph.
#[derive(Debug, Default)]
pub struct DownloadReport {
    /// Queries whose data is now in the graph.
    pub merged: usize,
    /// One error per failed query. Their quads stay pending.
    pub failed: Vec<Error>,
    /// New and updated entities for the local cache.
    pub persist: PersistDelta,
}

impl DownloadReport {
    pub fn is_partial(&self) -> bool {
        !self.failed.is_empty()
    }

    fn absorb(&mut self, other: DownloadReport) {
        self.merged += other.merged;
        self.failed.extend(other.failed);
        self.persist.append(other.persist);
    }
}

/// Fetches missing coverage in the background. Lives on the editing task;
/// fetch threads only see the transport and hand decoded data back over a
/// channel, and merging happens in [`Downloader::process_completions`].
pub struct Downloader {
    transport: Arc<dyn Transport>,
    sender: Sender<Completion>,
    receiver: Receiver<Completion>,
    batch: u64,
    in_flight: Vec<ServerQuery>,
}

fn fetch(transport: &dyn Transport, query: &ServerQuery) -> Result<OsmDownloadData> {
    let response = transport.get(&query.path())?;
    if !response.is_success() {
        return Err(Error::transport(format!(
            "Server replied {} to {}",
            response.status,
            query.path()
        )));
    }
    decode_osm(&response.body)
}

impl Downloader {
    pub fn new(transport: Arc<dyn Transport>) -> Self {
        let (sender, receiver) = unbounded();
        Downloader {
            transport,
            sender,
            receiver,
            batch: 0,
            in_flight: Vec::new(),
        }
    }

    pub fn downloads_in_progress(&self) -> usize {
        self.in_flight.len()
    }

    /// Drops the current batch. Its quads go back to pending and anything
    /// it still delivers is ignored.
    pub fn cancel_current_downloads(&mut self, map: &mut MapData) {
        self.batch += 1;
        if self.in_flight.is_empty() {
            return;
        }
        let quads: Vec<OsmRect> = self
            .in_flight
            .drain(..)
            .flat_map(|query| query.quads)
            .collect();
        map.region_mut().cancel(&quads);
        info!(quads = quads.len(), batch = self.batch; "Cancelled downloads");
    }

    /// Starts fetching whatever `viewport` needs that is neither downloaded
    /// nor being fetched. Returns the number of requests issued.
    pub fn download_missing_data(&mut self, map: &mut MapData, viewport: OsmRect) -> Result<usize> {
        self.cancel_current_downloads(map);

        let mut quads = Vec::new();
        match viewport.split_at_antimeridian() {
            Some((west, east)) => {
                quads.extend(map.region_mut().new_quads(&west));
                quads.extend(map.region_mut().new_quads(&east));
            }
            None => quads.extend(map.region_mut().new_quads(&viewport)),
        }
        if quads.is_empty() {
            return Ok(0);
        }

        let queries = coalesce_quad_queries(&quads);
        for query in &queries {
            let transport = Arc::clone(&self.transport);
            let sender = self.sender.clone();
            let batch = self.batch;
            let request = query.clone();
            let spawned = thread::Builder::new()
                .name("osm-fetch".to_string())
                .spawn(move || {
                    let result = fetch(transport.as_ref(), &request);
                    // the receiver is gone when the session shut down
                    let _ = sender.send(Completion {
                        batch,
                        query: request,
                        result,
                    });
                });
            if let Err(err) = spawned {
                map.region_mut().cancel(&query.quads);
                warn!(error = err.to_string().as_str(); "Could not start fetch thread");
                continue;
            }
            self.in_flight.push(query.clone());
        }
        info!(
            quads = quads.len(),
            requests = self.in_flight.len(),
            batch = self.batch;
            "Downloading missing data"
        );
        Ok(self.in_flight.len())
    }

    fn handle(&mut self, completion: Completion, map: &mut MapData) -> DownloadReport {
        let mut report = DownloadReport::default();
        if completion.batch != self.batch {
            debug!(batch = completion.batch; "Dropping completion of cancelled batch");
            return report;
        }
        self.in_flight.retain(|query| *query != completion.query);
        let quads = &completion.query.quads;
        let merged = match completion.result {
            Ok(data) => map.merge(data, true, quads, true),
            Err(err) => {
                // nothing to merge, just release the quads
                if let Err(cancel_err) = map.merge(OsmDownloadData::default(), true, quads, false) {
                    warn!(error = cancel_err.message.as_str(); "Releasing quads failed");
                }
                Err(err)
            }
        };
        match merged {
            Ok(outcome) => {
                report.merged += 1;
                report.persist = outcome.persist;
            }
            Err(err) => {
                match err.kind {
                    ErrorKind::Transport => {
                        warn!(error = err.message.as_str(), quads = quads.len(); "Download failed, will retry")
                    }
                    _ => warn!(error = err.message.as_str(), quads = quads.len(); "Download rejected"),
                }
                report.failed.push(err);
            }
        }
        report
    }

    /// Merges every completion that has arrived, in arrival order.
    pub fn process_completions(&mut self, map: &mut MapData) -> DownloadReport {
        let mut report = DownloadReport::default();
        let arrived: Vec<Completion> = self.receiver.try_iter().collect();
        for completion in arrived {
            let handled = self.handle(completion, map);
            report.absorb(handled);
        }
        report
    }

    /// Blocks until the current batch is complete or `timeout` passes.
    pub fn wait_for_completions(&mut self, map: &mut MapData, timeout: Duration) -> DownloadReport {
        let deadline = Instant::now() + timeout;
        let mut report = DownloadReport::default();
        while !self.in_flight.is_empty() {
            let remaining = deadline.saturating_duration_since(Instant::now());
            match self.receiver.recv_timeout(remaining) {
                Ok(completion) => {
                    let handled = self.handle(completion, map);
                    report.absorb(handled);
                }
                Err(RecvTimeoutError::Timeout) => {
                    warn!(pending = self.in_flight.len(); "Timed out waiting for downloads");
                    break;
                }
                Err(RecvTimeoutError::Disconnected) => break,
            }
        }
        report
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Mutex;

    use super::*;
    use crate::sync::Response;

    /// Serves one node per request, failing requests that touch `fail_x`.
    struct FakeServer {
        requests: Mutex<Vec<String>>,
        fail_x: Option<f64>,
    }

    impl Transport for FakeServer {
        fn get(&self, path: &str) -> Result<Response> {
            let mut requests = self.requests.lock().unwrap();
            requests.push(path.to_string());
            let bbox: Vec<f64> = path
                .trim_start_matches("api/0.6/map?bbox=")
                .split(',')
                .map(|v| v.parse().unwrap())
                .collect();
            if let Some(fail_x) = self.fail_x {
                if bbox[0] <= fail_x && fail_x < bbox[2] {
                    return Err(Error::transport("connection reset"));
                }
            }
            let id = requests.len();
            Ok(Response::ok(format!(
                r#"<osm version="0.6"><node id="{}" version="1" lat="{}" lon="{}"/></osm>"#,
                id,
                (bbox[1] + bbox[3]) / 2.0,
                (bbox[0] + bbox[2]) / 2.0
            )))
        }

        fn put(&self, _path: &str, _body: &str) -> Result<Response> {
            unreachable!()
        }

        fn post(&self, _path: &str, _body: &str) -> Result<Response> {
            unreachable!()
        }
    }

    fn server(fail_x: Option<f64>) -> Arc<FakeServer> {
        Arc::new(FakeServer {
            requests: Mutex::new(Vec::new()),
            fail_x,
        })
    }

    #[test]
    fn downloaded_area_is_not_fetched_again() {
        let fake = server(None);
        let mut downloader = Downloader::new(fake.clone());
        let mut map = MapData::new("mapper");
        let viewport = OsmRect::new(10.0, 10.0, 1.0, 1.0);

        let issued = downloader.download_missing_data(&mut map, viewport).unwrap();
        assert!(issued > 0);
        let report = downloader.wait_for_completions(&mut map, Duration::from_secs(10));
        assert_eq!(report.merged, issued);
        assert!(!report.is_partial());
        assert_eq!(map.node_count(), issued);
        assert_eq!(report.persist.save_nodes.len(), issued);

        assert_eq!(downloader.download_missing_data(&mut map, viewport).unwrap(), 0);
        assert_eq!(fake.requests.lock().unwrap().len(), issued);
    }

    #[test]
    fn failed_request_leaves_its_quads_pending() {
        let fake = server(Some(10.5));
        let mut downloader = Downloader::new(fake.clone());
        let mut map = MapData::new("mapper");
        let viewport = OsmRect::new(10.0, 10.0, 1.0, 1.0);

        downloader.download_missing_data(&mut map, viewport).unwrap();
        let report = downloader.wait_for_completions(&mut map, Duration::from_secs(10));
        assert!(report.is_partial());
        assert_eq!(report.failed[0].kind, ErrorKind::Transport);
        assert_eq!(map.region().count_busy(), 0);
        assert!(!map.region().point_is_covered(crate::data::geometry::OsmPoint { x: 10.5, y: 10.5 }));
        // the failed part is requested again
        assert!(downloader.download_missing_data(&mut map, viewport).unwrap() > 0);
    }

    #[test]
    fn cancelled_batch_is_ignored() {
        let fake = server(None);
        let mut downloader = Downloader::new(fake);
        let mut map = MapData::new("mapper");
        downloader
            .download_missing_data(&mut map, OsmRect::new(10.0, 10.0, 1.0, 1.0))
            .unwrap();
        downloader.cancel_current_downloads(&mut map);
        assert_eq!(downloader.downloads_in_progress(), 0);
        assert_eq!(map.region().count_busy(), 0);

        thread::sleep(Duration::from_millis(200));
        let report = downloader.process_completions(&mut map);
        assert_eq!(report.merged, 0);
        assert_eq!(map.node_count(), 0);
    }
}

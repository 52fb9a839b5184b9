//! Talking to an OSM API 0.6 server: fetching what the viewport is missing
//! and uploading local edits.

use std::cmp::Ordering;

use crate::data::geometry::OsmRect;
use crate::errors::Result;

pub mod download;
pub mod upload;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Response {
    pub status: u16,
    pub body: String,
}

impl Response {
    pub fn ok(body: impl Into<String>) -> Self {
        Response {
            status: 200,
            body: body.into(),
        }
    }

    pub fn is_success(&self) -> bool {
        (200..300).contains(&self.status)
    }
}

/// The HTTP exchange with the server. Paths are relative to the API root,
/// e.g. `api/0.6/map?bbox=...`. A failed exchange (no connection, timeout)
/// is an `Err` of kind `Transport`; any reply from the server is a
/// `Response`, whatever its status.
pub trait Transport: Send + Sync {
    fn get(&self, path: &str) -> Result<Response>;
    fn put(&self, path: &str, body: &str) -> Result<Response>;
    fn post(&self, path: &str, body: &str) -> Result<Response>;
}

/// One request to the server covering a run of adjacent quads.
#[derive(Debug, Clone, PartialEq)]
pub struct ServerQuery {
    pub rect: OsmRect,
    pub quads: Vec<OsmRect>,
}

impl ServerQuery {
    fn single(quad: OsmRect) -> Self {
        ServerQuery {
            rect: quad,
            quads: vec![quad],
        }
    }

    pub fn path(&self) -> String {
        format!(
            "api/0.6/map?bbox={},{},{},{}",
            self.rect.x,
            self.rect.y,
            self.rect.max_x(),
            self.rect.max_y()
        )
    }
}

fn by_row(a: &OsmRect, b: &OsmRect) -> Ordering {
    a.y.total_cmp(&b.y).then(a.x.total_cmp(&b.x))
}

fn by_column(a: &OsmRect, b: &OsmRect) -> Ordering {
    a.x.total_cmp(&b.x).then(a.y.total_cmp(&b.y))
}

/// Joins quads into as few rectangular queries as a greedy sweep allows.
/// First quads in the same row with equal height and a shared edge are
/// joined, then whatever stayed alone is joined by column. Every quad ends
/// up in exactly one query.
pub fn coalesce_quad_queries(quads: &[OsmRect]) -> Vec<ServerQuery> {
    let mut sorted = quads.to_vec();
    sorted.sort_by(by_row);

    let mut rows: Vec<ServerQuery> = Vec::new();
    for quad in sorted {
        match rows.last_mut() {
            Some(prev)
                if quad.y == prev.rect.y
                    && quad.x == prev.rect.max_x()
                    && quad.height == prev.rect.height =>
            {
                prev.quads.push(quad);
                prev.rect.width += quad.width;
            }
            _ => rows.push(ServerQuery::single(quad)),
        }
    }

    let (mut queries, singles): (Vec<ServerQuery>, Vec<ServerQuery>) =
        rows.into_iter().partition(|query| query.quads.len() > 1);
    let mut singles: Vec<OsmRect> = singles.into_iter().map(|query| query.rect).collect();
    singles.sort_by(by_column);

    let mut columns: Vec<ServerQuery> = Vec::new();
    for quad in singles {
        match columns.last_mut() {
            Some(prev)
                if quad.x == prev.rect.x
                    && quad.y == prev.rect.max_y()
                    && quad.width == prev.rect.width =>
            {
                prev.quads.push(quad);
                prev.rect.height += quad.height;
            }
            _ => columns.push(ServerQuery::single(quad)),
        }
    }
    queries.extend(columns);
    queries
}

use log::debug;
use quick_xml::events::{BytesStart, Event};
use quick_xml::reader::Reader;

use crate::codec::{attribute_parse, attribute_value, API_VERSION};
use crate::data::geometry::OsmRect;
use crate::data::osm::{EntityMeta, Member, Node, OsmId, OsmType, Relation, Way};
use crate::data::tags;
use crate::data::OsmDownloadData;
use crate::errors::{Error, Result};

enum ParserState {
    Top,
    Node(Node),
    Way(Way),
    Relation(Relation),
}

impl ParserState {
    fn meta_mut(&mut self) -> Option<&mut EntityMeta> {
        match self {
            ParserState::Top => None,
            ParserState::Node(node) => Some(&mut node.meta),
            ParserState::Way(way) => Some(&mut way.meta),
            ParserState::Relation(relation) => Some(&mut relation.meta),
        }
    }

    fn finish(self, output: &mut OsmDownloadData) {
        match self {
            ParserState::Top => (),
            ParserState::Node(node) => output.nodes.push(node),
            ParserState::Way(way) => output.ways.push(way),
            ParserState::Relation(relation) => output.relations.push(relation),
        }
    }
}

/// Fills the attributes every entity carries. Returns the ones it did not
/// recognise so the caller can look at them.
fn parse_meta<'a>(el: &'a BytesStart) -> Result<(EntityMeta, Vec<quick_xml::events::attributes::Attribute<'a>>)> {
    let mut meta = EntityMeta::default();
    let mut has_id = false;
    let mut rest = Vec::new();
    for attribute_res in el.attributes() {
        let attribute = attribute_res?;
        match attribute.key.as_ref() {
            b"id" => {
                meta.id = attribute_parse(&attribute)?;
                has_id = true;
            }
            b"version" => meta.version = attribute_parse(&attribute)?,
            b"changeset" => meta.changeset = attribute_parse(&attribute)?,
            b"user" => meta.user = attribute_value(&attribute)?,
            b"uid" => meta.uid = attribute_parse(&attribute)?,
            b"timestamp" => meta.timestamp = attribute_value(&attribute)?,
            b"visible" => (),
            _ => rest.push(attribute),
        }
    }
    if !has_id {
        return Err(Error::protocol(format!(
            "{} element without id",
            String::from_utf8_lossy(el.name().as_ref())
        )));
    }
    Ok((meta, rest))
}

fn parse_node(el: &BytesStart) -> Result<Node> {
    let (meta, rest) = parse_meta(el)?;
    let mut lat: Option<f64> = None;
    let mut lon: Option<f64> = None;
    for attribute in rest {
        match attribute.key.as_ref() {
            b"lat" => lat = Some(attribute_parse(&attribute)?),
            b"lon" => lon = Some(attribute_parse(&attribute)?),
            _ => (),
        }
    }
    match (lat, lon) {
        (Some(lat), Some(lon)) => Ok(Node::new(meta, lat, lon)),
        _ => Err(Error::protocol(format!("Node {} without a location", meta.id))),
    }
}

fn parse_tag(el: &BytesStart, meta: &mut EntityMeta) -> Result<()> {
    let mut key = None;
    let mut value = None;
    for attribute_res in el.attributes() {
        let attribute = attribute_res?;
        match attribute.key.as_ref() {
            b"k" => key = Some(attribute_value(&attribute)?),
            b"v" => value = Some(attribute_value(&attribute)?),
            _ => (),
        }
    }
    let (Some(key), Some(value)) = (key, value) else {
        return Err(Error::protocol(format!("Incomplete tag on {}", meta.id)));
    };
    // stamped by editors, never meaningful to keep
    if key == "created_by" {
        return Ok(());
    }
    meta.tags.insert(tags::truncate(&key), tags::truncate(&value));
    Ok(())
}

fn parse_nd(el: &BytesStart) -> Result<OsmId> {
    for attribute_res in el.attributes() {
        let attribute = attribute_res?;
        if attribute.key.as_ref() == b"ref" {
            return attribute_parse(&attribute);
        }
    }
    Err(Error::protocol("nd element without ref"))
}

fn parse_member(el: &BytesStart) -> Result<Member> {
    let mut kind = None;
    let mut reference = None;
    let mut role = String::new();
    for attribute_res in el.attributes() {
        let attribute = attribute_res?;
        match attribute.key.as_ref() {
            b"type" => kind = Some(OsmType::parse(&attribute_value(&attribute)?)?),
            b"ref" => reference = Some(attribute_parse(&attribute)?),
            b"role" => role = attribute_value(&attribute)?,
            _ => (),
        }
    }
    match (kind, reference) {
        (Some(kind), Some(reference)) => Ok(Member::new(kind, reference, &role)),
        _ => Err(Error::protocol("Incomplete relation member")),
    }
}

fn parse_bounds(el: &BytesStart) -> Result<OsmRect> {
    let (mut min_lat, mut min_lon, mut max_lat, mut max_lon) = (None, None, None, None);
    for attribute_res in el.attributes() {
        let attribute = attribute_res?;
        match attribute.key.as_ref() {
            b"minlat" => min_lat = Some(attribute_parse(&attribute)?),
            b"minlon" => min_lon = Some(attribute_parse(&attribute)?),
            b"maxlat" => max_lat = Some(attribute_parse(&attribute)?),
            b"maxlon" => max_lon = Some(attribute_parse(&attribute)?),
            _ => (),
        }
    }
    match (min_lat, min_lon, max_lat, max_lon) {
        (Some(min_lat), Some(min_lon), Some(max_lat), Some(max_lon)) => {
            Ok(OsmRect::from_corners(min_lon, min_lat, max_lon, max_lat))
        }
        _ => Err(Error::protocol("Incomplete bounds")),
    }
}

fn check_version(el: &BytesStart) -> Result<()> {
    for attribute_res in el.attributes() {
        let attribute = attribute_res?;
        if attribute.key.as_ref() == b"version" {
            let version = attribute_value(&attribute)?;
            if version != API_VERSION {
                return Err(Error::protocol(format!("Unsupported API version {}", version)));
            }
            return Ok(());
        }
    }
    Err(Error::protocol("Document has no API version"))
}

/// Starts an element. `empty` elements are finished right away.
fn open_element(
    el: &BytesStart,
    empty: bool,
    state: &mut ParserState,
    output: &mut OsmDownloadData,
) -> Result<()> {
    let name = el.name();
    let opened = match name.as_ref() {
        b"osm" => {
            check_version(el)?;
            None
        }
        b"bounds" => {
            output.bounds = Some(parse_bounds(el)?);
            None
        }
        b"node" => Some(ParserState::Node(parse_node(el)?)),
        b"way" => Some(ParserState::Way(Way::new(parse_meta(el)?.0, Vec::new()))),
        b"relation" => Some(ParserState::Relation(Relation::new(parse_meta(el)?.0, Vec::new()))),
        b"tag" => {
            if let Some(meta) = state.meta_mut() {
                parse_tag(el, meta)?;
            }
            None
        }
        b"nd" => {
            if let ParserState::Way(way) = state {
                way.nodes.push(parse_nd(el)?);
            }
            None
        }
        b"member" => {
            if let ParserState::Relation(relation) = state {
                relation.members.push(parse_member(el)?);
            }
            None
        }
        other => {
            debug!(element = String::from_utf8_lossy(other).as_ref(); "Skipping element");
            None
        }
    };
    if let Some(opened) = opened {
        if empty {
            opened.finish(output);
        } else {
            std::mem::replace(state, opened).finish(output);
        }
    }
    Ok(())
}

/// Decodes an `<osm>` document as returned by the map and element calls.
pub fn decode_osm(text: &str) -> Result<OsmDownloadData> {
    let mut reader = Reader::from_str(text);
    reader.trim_text(true);

    let mut output = OsmDownloadData::default();
    let mut state = ParserState::Top;
    let mut saw_root = false;
    loop {
        match reader.read_event()? {
            Event::Eof => break,
            Event::Start(e) => {
                saw_root |= e.name().as_ref() == b"osm";
                open_element(&e, false, &mut state, &mut output)?;
            }
            Event::Empty(e) => {
                saw_root |= e.name().as_ref() == b"osm";
                open_element(&e, true, &mut state, &mut output)?;
            }
            Event::End(e) => {
                if matches!(e.name().as_ref(), b"node" | b"way" | b"relation") {
                    std::mem::replace(&mut state, ParserState::Top).finish(&mut output);
                }
            }
            // declarations, comments and the text of <note>
            _ => (),
        }
    }
    if !saw_root {
        return Err(Error::protocol("Not an osm document"));
    }
    Ok(output)
}

/// One element of a `<diffResult>`. Deleted elements have neither a new id
/// nor a new version.
#[derive(Debug, Clone, PartialEq)]
pub struct DiffResultEntry {
    pub kind: OsmType,
    pub old_id: OsmId,
    pub new_id: Option<OsmId>,
    pub new_version: Option<u32>,
}

pub fn decode_diff_result(text: &str) -> Result<Vec<DiffResultEntry>> {
    let mut reader = Reader::from_str(text);
    reader.trim_text(true);

    let mut entries = Vec::new();
    let mut saw_root = false;
    loop {
        match reader.read_event()? {
            Event::Eof => break,
            Event::Start(e) | Event::Empty(e) => {
                let kind = match e.name().as_ref() {
                    b"diffResult" => {
                        saw_root = true;
                        continue;
                    }
                    b"node" => OsmType::Node,
                    b"way" => OsmType::Way,
                    b"relation" => OsmType::Relation,
                    _ => continue,
                };
                let mut old_id = None;
                let mut new_id = None;
                let mut new_version = None;
                for attribute_res in e.attributes() {
                    let attribute = attribute_res?;
                    match attribute.key.as_ref() {
                        b"old_id" => old_id = Some(attribute_parse(&attribute)?),
                        b"new_id" => new_id = Some(attribute_parse(&attribute)?),
                        b"new_version" => new_version = Some(attribute_parse(&attribute)?),
                        _ => (),
                    }
                }
                let old_id = old_id.ok_or_else(|| Error::protocol("diffResult entry without old_id"))?;
                entries.push(DiffResultEntry {
                    kind,
                    old_id,
                    new_id,
                    new_version,
                });
            }
            _ => (),
        }
    }
    if !saw_root {
        return Err(Error::protocol("Upload failed: invalid server response"));
    }
    Ok(entries)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::errors::ErrorKind;

    const MAP: &str = r#"<?xml version="1.0" encoding="UTF-8"?>
<osm version="0.6" generator="test server">
  <note>The data included in this document is from www.openstreetmap.org.</note>
  <bounds minlat="51.50" minlon="-0.13" maxlat="51.51" maxlon="-0.12"/>
  <node id="1" visible="true" version="3" changeset="77" timestamp="2024-01-02T03:04:05Z" user="a &amp; b" uid="42" lat="51.505" lon="-0.125">
    <tag k="amenity" v="cafe"/>
    <tag k="created_by" v="JOSM"/>
  </node>
  <node id="2" version="1" changeset="77" lat="51.506" lon="-0.126"/>
  <way id="10" version="2" changeset="78">
    <nd ref="1"/>
    <nd ref="2"/>
    <tag k="highway" v="footway"/>
  </way>
  <relation id="20" version="1" changeset="79">
    <member type="way" ref="10" role="outer"/>
    <member type="node" ref="99" role=""/>
    <tag k="type" v="multipolygon"/>
  </relation>
</osm>"#;

    #[test]
    fn decodes_a_map_response() {
        let data = decode_osm(MAP).unwrap();
        assert_eq!(data.nodes.len(), 2);
        let cafe = &data.nodes[0];
        assert_eq!(cafe.meta.user, "a & b");
        assert_eq!(cafe.meta.version, 3);
        assert_eq!((cafe.lat, cafe.lon), (51.505, -0.125));
        assert_eq!(cafe.meta.tags.len(), 1);
        assert_eq!(data.ways[0].nodes, vec![1, 2]);
        assert_eq!(data.relations[0].members[1], Member::new(OsmType::Node, 99, ""));
        assert!(data.relations[0].is_multipolygon());
        let bounds = data.bounds.unwrap();
        assert!((bounds.width - 0.01).abs() < 1e-9);
    }

    #[test]
    fn rejects_other_api_versions() {
        let err = decode_osm(r#"<osm version="0.5"></osm>"#).unwrap_err();
        assert_eq!(err.kind, ErrorKind::Protocol);
        assert!(decode_osm("<html></html>").is_err());
    }

    #[test]
    fn long_tags_are_truncated() {
        let long = "x".repeat(300);
        let doc = format!(
            r#"<osm version="0.6"><node id="1" version="1" lat="0" lon="0"><tag k="note" v="{}"/></node></osm>"#,
            long
        );
        let data = decode_osm(&doc).unwrap();
        assert_eq!(data.nodes[0].meta.tags["note"].len(), tags::MAX_TAG_LENGTH);
    }

    #[test]
    fn decodes_diff_result() {
        let doc = r#"<diffResult version="0.6">
  <node old_id="-1" new_id="501" new_version="1"/>
  <way old_id="7" new_id="7" new_version="4"/>
  <relation old_id="8"/>
</diffResult>"#;
        let entries = decode_diff_result(doc).unwrap();
        assert_eq!(
            entries,
            vec![
                DiffResultEntry {
                    kind: OsmType::Node,
                    old_id: -1,
                    new_id: Some(501),
                    new_version: Some(1),
                },
                DiffResultEntry {
                    kind: OsmType::Way,
                    old_id: 7,
                    new_id: Some(7),
                    new_version: Some(4),
                },
                DiffResultEntry {
                    kind: OsmType::Relation,
                    old_id: 8,
                    new_id: None,
                    new_version: None,
                },
            ]
        );
    }
}

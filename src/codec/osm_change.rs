use quick_xml::events::{BytesDecl, BytesEnd, BytesStart, Event};
use quick_xml::Writer;

use crate::codec::API_VERSION;
use crate::data::osm::{EntityMeta, Member, Node, OsmId, OsmType, Relation, Way};
use crate::data::tags::Tags;
use crate::data::OsmDownloadData;
use crate::errors::{Error, Result};
use crate::map_data::MapData;
use crate::sync::upload::{ChangeBucket, ChangesetDiff};

type XmlWriter = Writer<Vec<u8>>;

fn element(name: &'static str, attributes: &[(&str, String)]) -> BytesStart<'static> {
    let mut el = BytesStart::new(name);
    for (key, value) in attributes {
        el.push_attribute((*key, value.as_str()));
    }
    el
}

fn tag_elements(tags: &Tags) -> Vec<BytesStart<'static>> {
    tags.iter()
        .map(|(key, value)| element("tag", &[("k", key.clone()), ("v", value.clone())]))
        .collect()
}

fn write_element(
    writer: &mut XmlWriter,
    name: &'static str,
    attributes: &[(&str, String)],
    children: Vec<BytesStart<'static>>,
) -> Result<()> {
    let el = element(name, attributes);
    if children.is_empty() {
        writer.write_event(Event::Empty(el))?;
        return Ok(());
    }
    writer.write_event(Event::Start(el))?;
    for child in children {
        writer.write_event(Event::Empty(child))?;
    }
    writer.write_event(Event::End(BytesEnd::new(name)))?;
    Ok(())
}

fn finish(writer: XmlWriter) -> Result<String> {
    String::from_utf8(writer.into_inner()).map_err(|err| Error::protocol(err.to_string()))
}

fn new_writer() -> Result<XmlWriter> {
    let mut writer = Writer::new_with_indent(Vec::new(), b' ', 2);
    writer.write_event(Event::Decl(BytesDecl::new("1.0", Some("UTF-8"), None)))?;
    Ok(writer)
}

/// Attributes of a full entity, as the server sends them.
fn meta_attributes(meta: &EntityMeta) -> Vec<(&'static str, String)> {
    let mut attributes = vec![
        ("id", meta.id.to_string()),
        ("version", meta.version.to_string()),
        ("changeset", meta.changeset.to_string()),
    ];
    if !meta.user.is_empty() {
        attributes.push(("user", meta.user.clone()));
        attributes.push(("uid", meta.uid.to_string()));
    }
    if !meta.timestamp.is_empty() {
        attributes.push(("timestamp", meta.timestamp.clone()));
    }
    attributes
}

/// Attributes of an element inside an upload, bound to `changeset`.
fn change_attributes(meta: &EntityMeta, changeset: i64) -> Vec<(&'static str, String)> {
    vec![
        ("id", meta.id.to_string()),
        ("version", meta.version.to_string()),
        ("changeset", changeset.to_string()),
    ]
}

fn nd_elements(way: &Way) -> Vec<BytesStart<'static>> {
    way.nodes
        .iter()
        .map(|id| element("nd", &[("ref", id.to_string())]))
        .collect()
}

fn member_elements(members: &[Member]) -> Vec<BytesStart<'static>> {
    members
        .iter()
        .map(|member| {
            element(
                "member",
                &[
                    ("type", member.kind.as_str().to_string()),
                    ("ref", member.reference.to_string()),
                    ("role", member.role.clone()),
                ],
            )
        })
        .collect()
}

fn write_node(writer: &mut XmlWriter, node: &Node, mut attributes: Vec<(&'static str, String)>) -> Result<()> {
    attributes.push(("lat", node.lat.to_string()));
    attributes.push(("lon", node.lon.to_string()));
    write_element(writer, "node", &attributes, tag_elements(&node.meta.tags))
}

fn write_way(writer: &mut XmlWriter, way: &Way, attributes: Vec<(&'static str, String)>) -> Result<()> {
    let mut children = nd_elements(way);
    children.extend(tag_elements(&way.meta.tags));
    write_element(writer, "way", &attributes, children)
}

fn write_relation(
    writer: &mut XmlWriter,
    relation: &Relation,
    attributes: Vec<(&'static str, String)>,
) -> Result<()> {
    let mut children = member_elements(&relation.members);
    children.extend(tag_elements(&relation.meta.tags));
    write_element(writer, "relation", &attributes, children)
}

/// Encodes entities as an `<osm>` document, the inverse of
/// [`decode_osm`](crate::codec::decode_osm).
pub fn encode_osm(data: &OsmDownloadData) -> Result<String> {
    let mut writer = new_writer()?;
    let root = element(
        "osm",
        &[("version", API_VERSION.to_string()), ("generator", env!("CARGO_PKG_NAME").to_string())],
    );
    writer.write_event(Event::Start(root))?;
    if let Some(bounds) = data.bounds {
        let el = element(
            "bounds",
            &[
                ("minlat", bounds.y.to_string()),
                ("minlon", bounds.x.to_string()),
                ("maxlat", bounds.max_y().to_string()),
                ("maxlon", bounds.max_x().to_string()),
            ],
        );
        writer.write_event(Event::Empty(el))?;
    }
    for node in &data.nodes {
        write_node(&mut writer, node, meta_attributes(&node.meta))?;
    }
    for way in &data.ways {
        write_way(&mut writer, way, meta_attributes(&way.meta))?;
    }
    for relation in &data.relations {
        write_relation(&mut writer, relation, meta_attributes(&relation.meta))?;
    }
    writer.write_event(Event::End(BytesEnd::new("osm")))?;
    finish(writer)
}

fn write_bucket(
    writer: &mut XmlWriter,
    map: &MapData,
    action: &'static str,
    kind: OsmType,
    ids: &[OsmId],
    changeset: i64,
) -> Result<()> {
    if ids.is_empty() {
        return Ok(());
    }
    let mut block = BytesStart::new(action);
    if action == "delete" {
        block.push_attribute(("if-unused", "yes"));
    }
    writer.write_event(Event::Start(block))?;
    let deleting = action == "delete";
    for id in ids {
        let missing = || Error::invariant(format!("Changeset refers to missing {} {}", kind.as_str(), id));
        match kind {
            OsmType::Node => {
                let node = map.node(*id).ok_or_else(missing)?;
                let attributes = change_attributes(&node.meta, changeset);
                if deleting {
                    write_element(writer, "node", &attributes, Vec::new())?;
                } else {
                    write_node(writer, node, attributes)?;
                }
            }
            OsmType::Way => {
                let way = map.way(*id).ok_or_else(missing)?;
                let attributes = change_attributes(&way.meta, changeset);
                if deleting {
                    write_element(writer, "way", &attributes, Vec::new())?;
                } else {
                    write_way(writer, way, attributes)?;
                }
            }
            OsmType::Relation => {
                let relation = map.relation(*id).ok_or_else(missing)?;
                let attributes = change_attributes(&relation.meta, changeset);
                if deleting {
                    write_element(writer, "relation", &attributes, Vec::new())?;
                } else {
                    write_relation(writer, relation, attributes)?;
                }
            }
        }
    }
    writer.write_event(Event::End(BytesEnd::new(action)))?;
    Ok(())
}

fn write_forward(
    writer: &mut XmlWriter,
    map: &MapData,
    action: &'static str,
    bucket: &ChangeBucket,
    changeset: i64,
) -> Result<()> {
    write_bucket(writer, map, action, OsmType::Node, &bucket.nodes, changeset)?;
    write_bucket(writer, map, action, OsmType::Way, &bucket.ways, changeset)?;
    write_bucket(writer, map, action, OsmType::Relation, &bucket.relations, changeset)
}

/// Encodes the `<osmChange>` upload for `diff`, reading entity content from
/// the graph. Deletions run from relations down to nodes so nothing is
/// deleted while still in use.
pub fn encode_osm_change(map: &MapData, diff: &ChangesetDiff, changeset: i64, generator: &str) -> Result<String> {
    let mut writer = new_writer()?;
    let root = element(
        "osmChange",
        &[("version", API_VERSION.to_string()), ("generator", generator.to_string())],
    );
    writer.write_event(Event::Start(root))?;
    write_forward(&mut writer, map, "create", &diff.create, changeset)?;
    write_forward(&mut writer, map, "modify", &diff.modify, changeset)?;
    write_bucket(&mut writer, map, "delete", OsmType::Relation, &diff.delete.relations, changeset)?;
    write_bucket(&mut writer, map, "delete", OsmType::Way, &diff.delete.ways, changeset)?;
    write_bucket(&mut writer, map, "delete", OsmType::Node, &diff.delete.nodes, changeset)?;
    writer.write_event(Event::End(BytesEnd::new("osmChange")))?;
    finish(writer)
}

/// Body of the changeset create call.
pub fn encode_changeset(tags: &Tags) -> Result<String> {
    let mut writer = new_writer()?;
    writer.write_event(Event::Start(BytesStart::new("osm")))?;
    write_element(&mut writer, "changeset", &[], tag_elements(tags))?;
    writer.write_event(Event::End(BytesEnd::new("osm")))?;
    finish(writer)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::codec::decode_osm;
    use crate::data::geometry::OsmRect;

    fn meta(id: OsmId, tags: &[(&str, &str)]) -> EntityMeta {
        EntityMeta {
            id,
            version: 4,
            changeset: 31,
            user: "<mapper>".to_string(),
            uid: 8,
            timestamp: "2024-02-03T04:05:06Z".to_string(),
            tags: tags.iter().map(|(k, v)| (k.to_string(), v.to_string())).collect(),
            ..Default::default()
        }
    }

    #[test]
    fn encoded_documents_decode_to_the_same_entities() {
        let data = OsmDownloadData {
            nodes: vec![
                Node::new(meta(1, &[("name", "Fish & \"Chips\"")]), 51.123456789, -0.987654321),
                Node::new(meta(2, &[]), -33.5, 151.25),
            ],
            ways: vec![Way::new(meta(3, &[("highway", "service")]), vec![2, 1])],
            relations: vec![Relation::new(
                meta(4, &[("type", "route")]),
                vec![
                    Member::new(OsmType::Way, 3, "forward"),
                    Member::new(OsmType::Node, 1, "stop"),
                ],
            )],
            bounds: Some(OsmRect::new(-1.0, -34.0, 2.0, 86.0)),
        };
        let text = encode_osm(&data).unwrap();
        assert_eq!(decode_osm(&text).unwrap(), data);
    }

    #[test]
    fn created_by_does_not_survive_decoding() {
        let data = OsmDownloadData {
            nodes: vec![Node::new(meta(1, &[("created_by", "JOSM"), ("amenity", "bench")]), 1.0, 2.0)],
            ..Default::default()
        };
        let text = encode_osm(&data).unwrap();
        assert!(text.contains(r#"<tag k="created_by" v="JOSM"/>"#));

        let decoded = decode_osm(&text).unwrap();
        let tags = &decoded.nodes[0].meta.tags;
        assert!(!tags.contains_key("created_by"));
        assert_eq!(tags.get("amenity").map(String::as_str), Some("bench"));
        assert_ne!(decoded, data);
    }

    #[test]
    fn changeset_body_carries_tags() {
        let mut tags = Tags::new();
        tags.insert("comment".to_string(), "Fix <names>".to_string());
        let text = encode_changeset(&tags).unwrap();
        assert!(text.contains("<changeset>"));
        assert!(text.contains(r#"<tag k="comment" v="Fix &lt;names&gt;"/>"#));
    }
}

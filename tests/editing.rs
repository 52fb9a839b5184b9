use proptest::collection::vec;
use proptest::prelude::*;
use serde_json::json;

use osm_editor_core::data::geometry::OsmRect;
use osm_editor_core::data::osm::{EntityMeta, ExtendedId, Member, Node, OsmId, OsmType, Relation, Way};
use osm_editor_core::data::tags::Tags;
use osm_editor_core::data::OsmDownloadData;
use osm_editor_core::map_data::MapData;

fn meta(id: OsmId) -> EntityMeta {
    EntityMeta {
        id,
        version: 1,
        ..Default::default()
    }
}

/// Four nodes, a way over the first three and a relation holding the way.
fn base_map() -> MapData {
    let mut map = MapData::new("mapper");
    let delta = OsmDownloadData {
        nodes: (1..=4)
            .map(|id| Node::new(meta(id), 10.0 + id as f64 / 10.0, 10.0))
            .collect(),
        ways: vec![Way::new(meta(10), vec![1, 2, 3])],
        relations: vec![Relation::new(meta(20), vec![Member::new(OsmType::Way, 10, "outer")])],
        bounds: None,
    };
    map.merge(delta, true, &[OsmRect::new(9.0, 9.0, 2.0, 2.0)], true)
        .unwrap();
    map
}

#[derive(Debug, PartialEq)]
struct State {
    nodes: Vec<Node>,
    ways: Vec<Way>,
    relations: Vec<Relation>,
    indexed: Vec<(ExtendedId, OsmRect)>,
}

/// Live entities and the object index. Undone creations linger as
/// tombstones, so those are left out.
fn state(map: &MapData) -> State {
    let mut nodes: Vec<Node> = map.nodes().filter(|node| !node.meta.deleted).cloned().collect();
    nodes.sort_by_key(|node| node.meta.id);
    let mut ways: Vec<Way> = map.ways().filter(|way| !way.meta.deleted).cloned().collect();
    ways.sort_by_key(|way| way.meta.id);
    let mut relations: Vec<Relation> = map
        .relations()
        .filter(|relation| !relation.meta.deleted)
        .cloned()
        .collect();
    relations.sort_by_key(|relation| relation.meta.id);
    let mut indexed = map.spatial().members();
    indexed.sort_by_key(|(ext, _)| *ext);
    State {
        nodes,
        ways,
        relations,
        indexed,
    }
}

#[test]
fn undo_and_redo_walk_through_history() {
    let mut map = base_map();
    map.set_comment_provider(Box::new(|operation: &str| json!({ "operation": operation })));
    let before = state(&map);

    map.tick();
    map.set_location(2, 10.9, 10.9).unwrap();
    let moved = state(&map);
    map.tick();
    let node = map.create_node(10.5, 10.5).unwrap();
    map.add_node_to_way(10, node, 3).unwrap();
    assert_eq!(map.way(10).unwrap().nodes, vec![1, 2, 3, node]);
    let extended = state(&map);

    let comment = map.undo().unwrap();
    assert_eq!(comment, Some(json!({ "operation": "create node" })));
    assert_eq!(state(&map), moved);
    map.undo().unwrap();
    assert_eq!(state(&map), before);
    assert!(!map.can_undo());

    map.redo().unwrap();
    assert_eq!(state(&map), moved);
    map.redo().unwrap();
    assert_eq!(state(&map), extended);
    assert!(!map.can_redo());
    map.consistency_check().unwrap();
}

#[test]
fn new_edit_clears_redo() {
    let mut map = base_map();
    map.tick();
    map.set_location(1, 10.8, 10.0).unwrap();
    map.undo().unwrap();
    assert!(map.can_redo());
    map.tick();
    let mut tags = Tags::new();
    tags.insert("name".to_string(), "Mill lane".to_string());
    map.set_tags(ExtendedId::way(10), &tags).unwrap();
    assert!(!map.can_redo());
}

#[test]
fn deleting_a_way_drops_its_untagged_nodes_and_membership() {
    let mut map = base_map();
    map.tick();
    map.delete_way(10).unwrap();
    assert!(map.way(10).unwrap().meta.deleted);
    assert!((1..=3).all(|id| map.node(id).unwrap().meta.deleted));
    assert!(map.relation(20).unwrap().members.is_empty());
    assert!(!map.spatial().contains(ExtendedId::way(10)));
    map.consistency_check().unwrap();

    map.undo().unwrap();
    assert_eq!(map.way(10).unwrap().nodes, vec![1, 2, 3]);
    assert_eq!(map.relation(20).unwrap().members.len(), 1);
    map.consistency_check().unwrap();
}

fn tags(pairs: &[(&str, &str)]) -> Tags {
    pairs.iter().map(|(k, v)| (k.to_string(), v.to_string())).collect()
}

#[test]
fn split_and_join_are_single_undo_steps() {
    let mut map = base_map();
    let before = state(&map);

    let split = map.split_way(10, 2).unwrap();
    assert_eq!(map.way(10).unwrap().nodes, vec![1, 2]);
    assert_eq!(map.way(split).unwrap().nodes, vec![2, 3]);
    assert_eq!(map.node(2).unwrap().way_count, 2);
    let members: Vec<OsmId> = map.relation(20).unwrap().members.iter().map(|m| m.reference).collect();
    assert_eq!(members, vec![10, split]);
    map.consistency_check().unwrap();
    let after_split = state(&map);

    map.undo().unwrap();
    assert_eq!(state(&map), before);
    map.redo().unwrap();
    assert_eq!(state(&map), after_split);

    assert_eq!(map.join_ways(split, 2).unwrap(), 10);
    assert_eq!(map.way(10).unwrap().nodes, vec![1, 2, 3]);
    assert!(map.way(split).unwrap().meta.deleted);
    assert_eq!(map.relation(20).unwrap().members.len(), 1);
    map.consistency_check().unwrap();
    map.undo().unwrap();
    assert_eq!(state(&map), after_split);
}

#[test]
fn closed_way_is_cut_across() {
    let mut map = base_map();
    let corners: Vec<OsmId> = [(0.0, 0.0), (0.0, 1.0), (1.0, 1.0), (1.0, 0.0)]
        .iter()
        .map(|(lat, lon)| map.create_node(*lat, *lon).unwrap())
        .collect();
    let ring = map.create_way().unwrap();
    for (index, node) in corners.iter().chain(&corners[..1]).enumerate() {
        map.add_node_to_way(ring, *node, index).unwrap();
    }

    let other = map.split_way(ring, corners[0]).unwrap();
    assert_eq!(map.way(ring).unwrap().nodes, vec![corners[0], corners[1], corners[2]]);
    assert_eq!(map.way(other).unwrap().nodes, vec![corners[2], corners[3], corners[0]]);
    map.consistency_check().unwrap();
}

#[test]
fn ways_with_conflicting_tags_do_not_join() {
    let mut map = base_map();
    let split = map.split_way(10, 2).unwrap();
    map.set_tags(ExtendedId::way(10), &tags(&[("highway", "path")])).unwrap();
    map.set_tags(ExtendedId::way(split), &tags(&[("highway", "track")])).unwrap();
    let before = state(&map);
    assert!(map.join_ways(10, 2).is_err());
    assert_eq!(state(&map), before);
}

#[test]
fn reversing_flips_direction_dependent_tags() {
    let mut map = base_map();
    map.set_tags(ExtendedId::way(10), &tags(&[("oneway", "yes"), ("sidewalk:left", "yes")]))
        .unwrap();
    map.set_tags(ExtendedId::node(2), &tags(&[("direction", "forward")])).unwrap();
    let before = state(&map);

    map.reverse_way(10).unwrap();
    let way = map.way(10).unwrap();
    assert_eq!(way.nodes, vec![3, 2, 1]);
    assert_eq!(way.meta.tags, tags(&[("oneway", "yes"), ("sidewalk:right", "yes")]));
    assert_eq!(map.node(2).unwrap().meta.tags["direction"], "backward");
    map.consistency_check().unwrap();

    map.undo().unwrap();
    assert_eq!(state(&map), before);
}

#[test]
fn merged_node_takes_over_the_other() {
    let mut map = base_map();
    map.set_tags(ExtendedId::node(4), &tags(&[("barrier", "gate")])).unwrap();
    let target = map.node(4).map(|node| (node.lat, node.lon)).unwrap();

    // node 3 is in a way, so it survives and moves onto node 4
    assert_eq!(map.merge_nodes(3, 4).unwrap(), 3);
    let survivor = map.node(3).unwrap();
    assert_eq!((survivor.lat, survivor.lon), target);
    assert_eq!(survivor.meta.tags["barrier"], "gate");
    assert!(map.node(4).unwrap().meta.deleted);
    assert_eq!(map.way(10).unwrap().nodes, vec![1, 2, 3]);
    map.consistency_check().unwrap();

    // neighbours collapse into one
    assert_eq!(map.merge_nodes(2, 3).unwrap(), 3);
    assert_eq!(map.way(10).unwrap().nodes, vec![1, 3]);
    assert!(map.merge_nodes(1, 3).is_err());
    map.consistency_check().unwrap();
}

#[test]
fn duplicate_copies_a_way_with_fresh_nodes() {
    let mut map = base_map();
    map.set_tags(ExtendedId::way(10), &tags(&[("highway", "path")])).unwrap();
    let before = state(&map);

    let copy = map.duplicate(ExtendedId::way(10), 0.0, 0.5).unwrap().unwrap();
    let way = map.way(copy.id).unwrap();
    assert_eq!(way.meta.tags["highway"], "path");
    assert_eq!(way.nodes.len(), 3);
    assert!(way.nodes.iter().all(|id| *id < 0));
    assert_eq!(map.node(way.nodes[0]).unwrap().lon, 10.5);
    assert!(map.spatial().contains(copy));
    map.consistency_check().unwrap();

    // plain relations are not copied
    assert_eq!(map.duplicate(ExtendedId::relation(20), 0.0, 0.5).unwrap(), None);
    map.undo().unwrap();
    assert_eq!(state(&map), before);
}

#[derive(Debug, Clone)]
enum Op {
    Create(f64, f64),
    Append(usize),
    Remove(usize),
    Move(usize, f64, f64),
    Tag(usize),
    DeleteNode(usize),
    DeleteWay,
    Undo,
    Redo,
}

fn op() -> impl Strategy<Value = Op> {
    prop_oneof![
        (9.5..10.5f64, 9.5..10.5f64).prop_map(|(lat, lon)| Op::Create(lat, lon)),
        any::<usize>().prop_map(Op::Append),
        any::<usize>().prop_map(Op::Remove),
        (any::<usize>(), 9.5..10.5f64, 9.5..10.5f64).prop_map(|(i, lat, lon)| Op::Move(i, lat, lon)),
        any::<usize>().prop_map(Op::Tag),
        any::<usize>().prop_map(Op::DeleteNode),
        Just(Op::DeleteWay),
        Just(Op::Undo),
        Just(Op::Redo),
    ]
}

fn live_nodes(map: &MapData) -> Vec<OsmId> {
    let mut ids: Vec<OsmId> = map
        .nodes()
        .filter(|node| !node.meta.deleted)
        .map(|node| node.meta.id)
        .collect();
    ids.sort_unstable();
    ids
}

fn pick(ids: &[OsmId], i: usize) -> Option<OsmId> {
    (!ids.is_empty()).then(|| ids[i % ids.len()])
}

/// Runs one step. Undo and redo must always succeed. An edit the graph
/// refuses (deleting a node still in a way, repeating a node) must leave
/// everything as it was.
fn run(map: &mut MapData, op: &Op) -> Result<(), String> {
    map.tick();
    let before = state(map);
    let nodes = live_nodes(map);
    let way_live = map.way(10).map_or(false, |way| !way.meta.deleted);
    let result = match *op {
        Op::Create(lat, lon) => map.create_node(lat, lon).map(|_| ()),
        Op::Append(i) => match pick(&nodes, i) {
            Some(node) if way_live => {
                let end = map.way(10).map_or(0, |way| way.nodes.len());
                map.add_node_to_way(10, node, end)
            }
            _ => Ok(()),
        },
        Op::Remove(i) => {
            let len = map.way(10).map_or(0, |way| way.nodes.len());
            if way_live && len > 0 {
                map.delete_node_from_way(10, i % len, false)
            } else {
                Ok(())
            }
        }
        Op::Move(i, lat, lon) => match pick(&nodes, i) {
            Some(node) => map.set_location(node, lat, lon),
            None => Ok(()),
        },
        Op::Tag(i) => match pick(&nodes, i) {
            Some(node) => {
                let mut tags = Tags::new();
                tags.insert("ref".to_string(), i.to_string());
                map.set_tags(ExtendedId::node(node), &tags)
            }
            None => Ok(()),
        },
        Op::DeleteNode(i) => match pick(&nodes, i) {
            Some(node) => map.delete_node(node),
            None => Ok(()),
        },
        Op::DeleteWay if way_live => map.delete_way(10),
        Op::DeleteWay => Ok(()),
        Op::Undo => map.undo().map(|_| ()),
        Op::Redo => map.redo().map(|_| ()),
    };
    match (op, result) {
        (_, Ok(())) => Ok(()),
        (Op::Undo | Op::Redo, Err(err)) => Err(format!("{:?} failed: {}", op, err.message)),
        (_, Err(_)) if state(map) == before => Ok(()),
        (_, Err(err)) => Err(format!("refused {:?} still changed the graph: {}", op, err.message)),
    }
}

proptest! {
    #![proptest_config(ProptestConfig::with_cases(64))]

    #[test]
    fn way_counts_stay_consistent(ops in vec(op(), 1..40)) {
        let mut map = base_map();
        for op in &ops {
            let outcome = run(&mut map, op);
            prop_assert!(outcome.is_ok(), "{:?}", outcome);
            prop_assert!(map.consistency_check().is_ok(), "after {:?}", op);
        }
    }

    #[test]
    fn undo_then_redo_restores_the_same_state(ops in vec(op(), 1..25)) {
        let mut map = base_map();
        for op in &ops {
            let outcome = run(&mut map, op);
            prop_assert!(outcome.is_ok(), "{:?}", outcome);
        }
        prop_assume!(map.can_undo());
        let edited = state(&map);
        map.undo().unwrap();
        map.redo().unwrap();
        prop_assert_eq!(state(&map), edited);
        prop_assert!(map.consistency_check().is_ok());
    }
}

//! Property tests for the store laws: NML round trip, revision accounting and
//! segment lengths.

use proptest::prelude::*;
use skeletrace_core::{
    Coordinate, LoadMode, Mutation, NewNode, SharedSkeleton, Skeleton, SkeletonConfig,
};

/// A random forest: node positions per tree plus edges by node index.
#[derive(Debug, Clone)]
struct Forest {
    trees: Vec<Vec<(i32, i32, i32)>>,
    edges: Vec<(usize, usize)>,
    comments: Vec<(usize, String)>,
}

fn forest() -> impl Strategy<Value = Forest> {
    let position = (0..2000i32, 0..2000i32, 0..500i32);
    (
        prop::collection::vec(prop::collection::vec(position, 1..8), 1..4),
        prop::collection::vec((0..32usize, 0..32usize), 0..24),
        prop::collection::vec((0..32usize, "[a-z <>&\"]{1,12}"), 0..6),
    )
        .prop_map(|(trees, edges, comments)| Forest {
            trees,
            edges,
            comments,
        })
}

fn build(forest: &Forest) -> Skeleton {
    let mut skeleton = Skeleton::default();
    let mut ids = Vec::new();
    for positions in &forest.trees {
        let tree = skeleton.add_tree(0, None).unwrap();
        for &(x, y, z) in positions {
            ids.push(
                skeleton
                    .add_node(NewNode::new(tree, Coordinate::new(x, y, z)))
                    .unwrap(),
            );
        }
    }
    for &(a, b) in &forest.edges {
        // Self loops and duplicates are rejected; that is fine here.
        let _ = skeleton.add_segment(ids[a % ids.len()], ids[b % ids.len()]);
    }
    for (index, text) in &forest.comments {
        skeleton.set_comment(ids[index % ids.len()], text).unwrap();
    }
    skeleton
}

fn structure(skeleton: &Skeleton) -> Vec<String> {
    let mut out: Vec<String> = skeleton
        .nodes()
        .map(|n| format!("{} {} {} {} {:?}", n.id, n.tree, n.position, n.radius, n.comment))
        .collect();
    let mut segments: Vec<String> = skeleton
        .segments()
        .map(|s| format!("{}->{}", s.source, s.target))
        .collect();
    segments.sort();
    out.extend(segments);
    out.extend(skeleton.trees().map(|t| format!("tree {} {:?}", t.id, t.nodes())));
    out
}

fn assert_lengths(skeleton: &Skeleton) -> Result<(), TestCaseError> {
    for segment in skeleton.segments() {
        let a = skeleton.find_node_by_id(segment.source).unwrap().position;
        let b = skeleton.find_node_by_id(segment.target).unwrap().position;
        prop_assert!((segment.length - a.distance(b)).abs() < 1e-3);
    }
    Ok(())
}

proptest! {
    #[test]
    fn replace_round_trip_is_lossless(forest in forest()) {
        let original = build(&forest);
        let mut copy = Skeleton::default();
        copy.load_nml(&original.to_nml(), LoadMode::Replace).unwrap();
        prop_assert_eq!(structure(&copy), structure(&original));
    }

    #[test]
    fn merge_shifts_every_reference(first in forest(), second in forest()) {
        let mut target = build(&first);
        let source = build(&second);
        let node_offset = target.greatest_node_id();
        let tree_offset = target.greatest_tree_id();
        let before = target.node_count();

        target.load_nml(&source.to_nml(), LoadMode::Merge).unwrap();

        prop_assert_eq!(target.node_count(), before + source.node_count());
        for node in source.nodes() {
            let shifted = target.find_node_by_id(node.id + node_offset).unwrap();
            prop_assert_eq!(shifted.tree, node.tree + tree_offset);
            prop_assert_eq!(shifted.position, node.position);
        }
        for segment in source.segments() {
            prop_assert!(target
                .find_segment_between(segment.source + node_offset, segment.target + node_offset)
                .is_some());
        }
    }

    #[test]
    fn revision_counts_successful_mutations(
        steps in prop::collection::vec((0..6u8, 0..8u64, 0..8u64, -50..50i32), 1..40)
    ) {
        let skeleton = SharedSkeleton::new(SkeletonConfig::default());
        for (kind, a, b, offset) in steps {
            let mutation = match kind {
                0 => Mutation::AddTree { id: 0, color: None },
                1 => Mutation::AddNode {
                    node: NewNode::new(a % 3 + 1, Coordinate::new(offset, offset * 2, 7)),
                },
                2 => Mutation::AddSegment { source: a, target: b },
                3 => Mutation::DeleteNode { id: a },
                4 => Mutation::MoveNode { id: a, position: Coordinate::new(offset, 0, offset) },
                _ => Mutation::ExtractComponent { start: a, tree: 0 },
            };
            let before = skeleton.revision().unwrap();
            let shape = skeleton.with_read(structure).unwrap();
            match skeleton.submit(mutation) {
                Ok(effect) if effect.changed() => {
                    prop_assert_eq!(skeleton.revision().unwrap(), before + 1);
                }
                Ok(_) => {
                    prop_assert_eq!(skeleton.revision().unwrap(), before);
                }
                Err(_) => {
                    prop_assert_eq!(skeleton.revision().unwrap(), before);
                    prop_assert_eq!(skeleton.with_read(structure).unwrap(), shape);
                }
            }
            skeleton.with_read(assert_lengths).unwrap()?;
        }
    }

    #[test]
    fn moves_keep_segment_lengths_exact(
        forest in forest(),
        moves in prop::collection::vec((0..32usize, -300..300i32, -300..300i32, -300..300i32), 1..12)
    ) {
        let mut skeleton = build(&forest);
        let ids: Vec<u64> = skeleton.nodes().map(|n| n.id).collect();
        for (index, dx, dy, dz) in moves {
            let id = ids[index % ids.len()];
            let position = skeleton.find_node_by_id(id).unwrap().position + Coordinate::new(dx, dy, dz);
            skeleton.move_node(id, position).unwrap();
            assert_lengths(&skeleton)?;
        }
    }
}

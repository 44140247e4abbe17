//! Octree spatial partitioning.
//!
//! Nodes live in a flat arena (`Vec<OctreeNode>`) and refer to their parent
//! by index, so the tree is `Send` and trivially walkable in both
//! directions. A node is either internal with exactly eight children or a
//! leaf carrying item indices; there is no mixed state.
//!
//! Grid addressing: a node at depth `d` has integer coordinates in
//! `[0, 2^d)` per axis. Each child's coordinate is its parent's times two
//! plus a 0/1 offset per axis, and the offsets pack into an octant digit
//! `'0'..='7'` (x in bit 0, y in bit 1, z in bit 2). Concatenating the
//! digits from root to node yields the node code used in output paths.

use std::collections::HashSet;

use crate::config::{DistributionMode, PartitionPolicy};
use crate::error::PartitionError;
use crate::types::{Aabb, SourceModel};

pub type NodeId = usize;

#[derive(Debug)]
pub enum NodeKind {
    /// All eight children exist, even when some hold no items.
    Internal([NodeId; 8]),
    /// Indices into the source model slice the tree was built over.
    Leaf(Vec<usize>),
}

#[derive(Debug)]
pub struct OctreeNode {
    pub depth: u8,
    pub coord: [u32; 3],
    pub volume: Aabb,
    pub parent: Option<NodeId>,
    pub kind: NodeKind,
}

impl OctreeNode {
    pub fn is_leaf(&self) -> bool {
        matches!(self.kind, NodeKind::Leaf(_))
    }

    pub fn items(&self) -> &[usize] {
        match &self.kind {
            NodeKind::Leaf(items) => items,
            NodeKind::Internal(_) => &[],
        }
    }
}

#[derive(Debug)]
pub struct Octree {
    nodes: Vec<OctreeNode>,
}

/// Octant digit for a child given parent and child grid coordinates.
///
/// Valid only when the child is one level below the parent and each child
/// coordinate is the doubled parent coordinate plus 0 or 1.
pub fn octant_index(
    parent_depth: u8,
    parent_coord: [u32; 3],
    child_depth: u8,
    child_coord: [u32; 3],
) -> Result<u8, PartitionError> {
    let not_a_child = || PartitionError::NotAChild {
        parent_depth,
        child_depth,
    };
    if child_depth != parent_depth + 1 {
        return Err(not_a_child());
    }
    let mut digit = 0u8;
    for a in 0..3 {
        let off = child_coord[a]
            .checked_sub(parent_coord[a] * 2)
            .ok_or_else(not_a_child)?;
        if off > 1 {
            return Err(not_a_child());
        }
        digit |= (off as u8) << a;
    }
    Ok(digit)
}

fn check_coord(depth: u8, coord: [u32; 3]) -> Result<(), PartitionError> {
    let side = 1u64 << depth;
    if coord.iter().any(|&c| c as u64 >= side) {
        return Err(PartitionError::CoordOutOfRange {
            depth,
            x: coord[0],
            y: coord[1],
            z: coord[2],
        });
    }
    Ok(())
}

/// Node code derived directly from a grid address, most significant level
/// first. The root (depth 0) has the empty code.
pub fn code_from_coord(depth: u8, coord: [u32; 3]) -> Result<String, PartitionError> {
    check_coord(depth, coord)?;
    let mut code = String::with_capacity(depth as usize);
    for level in (0..depth).rev() {
        let mut digit = 0u8;
        for a in 0..3 {
            digit |= (((coord[a] >> level) & 1) as u8) << a;
        }
        code.push((b'0' + digit) as char);
    }
    Ok(code)
}

impl Octree {
    pub fn root(&self) -> NodeId {
        0
    }

    pub fn node(&self, id: NodeId) -> &OctreeNode {
        &self.nodes[id]
    }

    pub fn len(&self) -> usize {
        self.nodes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.nodes.is_empty()
    }

    /// Leaf ids in arena order; deterministic for a given build.
    pub fn leaves(&self) -> Vec<NodeId> {
        (0..self.nodes.len())
            .filter(|&id| self.nodes[id].is_leaf())
            .collect()
    }

    /// Node code built by walking parent links up to the root.
    pub fn node_code(&self, id: NodeId) -> Result<String, PartitionError> {
        let node = &self.nodes[id];
        check_coord(node.depth, node.coord)?;
        let mut digits = Vec::with_capacity(node.depth as usize);
        let mut cur = id;
        while let Some(parent) = self.nodes[cur].parent {
            let c = &self.nodes[cur];
            let p = &self.nodes[parent];
            digits.push(octant_index(p.depth, p.coord, c.depth, c.coord)?);
            cur = parent;
        }
        digits.reverse();
        Ok(digits.iter().map(|d| (b'0' + d) as char).collect())
    }

    /// Codes of all leaves, checked for uniqueness. Collisions indicate a
    /// corrupted tree and abort the run.
    pub fn leaf_codes(&self) -> Result<Vec<(NodeId, String)>, PartitionError> {
        let mut seen = HashSet::new();
        let mut out = Vec::new();
        for id in self.leaves() {
            let code = self.node_code(id)?;
            if !seen.insert(code.clone()) {
                return Err(PartitionError::DuplicateCode(code));
            }
            out.push((id, code));
        }
        Ok(out)
    }
}

fn child_volume(parent: &Aabb, digit: u8) -> Aabb {
    let mid = parent.center();
    let mut min = [0.0; 3];
    let mut max = [0.0; 3];
    for a in 0..3 {
        if (digit >> a) & 1 == 1 {
            min[a] = mid[a];
            max[a] = parent.max[a];
        } else {
            min[a] = parent.min[a];
            max[a] = mid[a];
        }
    }
    Aabb { min, max }
}

fn octant_of_point(volume: &Aabb, p: [f64; 3]) -> u8 {
    let mid = volume.center();
    let mut digit = 0u8;
    for a in 0..3 {
        if p[a] > mid[a] {
            digit |= 1 << a;
        }
    }
    digit
}

/// Build an octree over `models` inside `volume`.
///
/// Splitting stops when a node hits `max_depth`, shrinks below
/// `min_box_size` on any axis, or holds fewer than `min_item_count` items.
pub fn build(
    volume: Aabb,
    models: &[SourceModel],
    policy: &PartitionPolicy,
) -> Result<Octree, PartitionError> {
    for a in 0..3 {
        if volume.min[a] > volume.max[a] {
            return Err(PartitionError::InvalidVolume { axis: a });
        }
    }
    let mut nodes = Vec::new();
    nodes.push(OctreeNode {
        depth: 0,
        coord: [0; 3],
        volume,
        parent: None,
        kind: NodeKind::Leaf((0..models.len()).collect()),
    });
    split(&mut nodes, 0, models, policy);
    Ok(Octree { nodes })
}

fn split(nodes: &mut Vec<OctreeNode>, id: NodeId, models: &[SourceModel], policy: &PartitionPolicy) {
    let (depth, coord, volume, items) = {
        let node = &nodes[id];
        let items = match &node.kind {
            NodeKind::Leaf(items) => items.clone(),
            NodeKind::Internal(_) => return,
        };
        (node.depth, node.coord, node.volume, items)
    };
    if depth >= policy.max_depth
        || items.len() < policy.min_item_count
        || (0..3).any(|a| volume.extent(a) < policy.min_box_size)
    {
        return;
    }

    let mut buckets: [Vec<usize>; 8] = Default::default();
    for &item in &items {
        let model = &models[item];
        match policy.mode {
            DistributionMode::Center => {
                buckets[octant_of_point(&volume, model.representative_point()) as usize]
                    .push(item);
            }
            DistributionMode::BoundingBox { unique } => {
                let Some(bounds) = model.bounds() else {
                    buckets[octant_of_point(&volume, model.representative_point()) as usize]
                        .push(item);
                    continue;
                };
                for digit in 0u8..8 {
                    if child_volume(&volume, digit).overlaps(&bounds) {
                        buckets[digit as usize].push(item);
                        if unique {
                            break;
                        }
                    }
                }
            }
        }
    }

    // If everything collapses into one octant a split gains nothing and
    // can recurse forever on coincident geometry.
    if buckets.iter().filter(|b| !b.is_empty()).count() <= 1 {
        return;
    }

    let mut children = [0usize; 8];
    for digit in 0u8..8 {
        let child_id = nodes.len();
        let coord = [
            coord[0] * 2 + (digit & 1) as u32,
            coord[1] * 2 + ((digit >> 1) & 1) as u32,
            coord[2] * 2 + ((digit >> 2) & 1) as u32,
        ];
        nodes.push(OctreeNode {
            depth: depth + 1,
            coord,
            volume: child_volume(&volume, digit),
            parent: Some(id),
            kind: NodeKind::Leaf(std::mem::take(&mut buckets[digit as usize])),
        });
        children[digit as usize] = child_id;
    }
    nodes[id].kind = NodeKind::Internal(children);
    for child_id in children {
        split(nodes, child_id, models, policy);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::{MaterialDescriptor, MeshData, SourceModel, Transform};
    use rand::rngs::StdRng;
    use rand::{Rng, SeedableRng};
    use std::collections::HashMap;

    fn model_at(id: &str, p: [f64; 3]) -> SourceModel {
        SourceModel {
            id: id.to_string(),
            file_name: format!("{id}.obj"),
            node_name: id.to_string(),
            mesh: MeshData {
                positions: vec![p],
                indices: vec![0, 0, 0],
                ..Default::default()
            },
            material: MaterialDescriptor::colored(0, [1.0, 1.0, 1.0, 1.0]),
            transform: Transform::default(),
            metadata: Default::default(),
        }
    }

    fn unit_policy(mode: DistributionMode) -> PartitionPolicy {
        PartitionPolicy {
            max_depth: 4,
            min_box_size: 0.0,
            min_item_count: 2,
            mode,
        }
    }

    #[test]
    fn octant_round_trip_random_coords() {
        let mut rng = StdRng::seed_from_u64(7);
        for _ in 0..500 {
            let depth = rng.gen_range(1..=8u8);
            let side = 1u32 << depth;
            let coord = [
                rng.gen_range(0..side),
                rng.gen_range(0..side),
                rng.gen_range(0..side),
            ];
            let parent = [coord[0] / 2, coord[1] / 2, coord[2] / 2];
            let digit = octant_index(depth - 1, parent, depth, coord).unwrap();
            let code = code_from_coord(depth, coord).unwrap();
            assert_eq!(code.as_bytes()[depth as usize - 1], b'0' + digit);
        }
    }

    #[test]
    fn codes_never_collide_up_to_depth_8() {
        let mut rng = StdRng::seed_from_u64(11);
        let mut seen: HashMap<String, (u8, [u32; 3])> = HashMap::new();
        for _ in 0..2000 {
            let depth = rng.gen_range(0..=8u8);
            let side = 1u32 << depth;
            let coord = [
                rng.gen_range(0..side),
                rng.gen_range(0..side),
                rng.gen_range(0..side),
            ];
            let code = code_from_coord(depth, coord).unwrap();
            assert_eq!(code.len(), depth as usize);
            if let Some(prev) = seen.insert(code, (depth, coord)) {
                assert_eq!(prev, (depth, coord), "distinct addresses shared a code");
            }
        }
    }

    #[test]
    fn out_of_range_coord_rejected() {
        assert!(matches!(
            code_from_coord(2, [4, 0, 0]),
            Err(PartitionError::CoordOutOfRange { depth: 2, x: 4, .. })
        ));
        assert!(code_from_coord(2, [3, 3, 3]).is_ok());
    }

    #[test]
    fn non_child_relation_rejected() {
        assert!(octant_index(1, [0, 0, 0], 3, [0, 0, 0]).is_err());
        assert!(octant_index(1, [1, 0, 0], 2, [0, 0, 0]).is_err());
        assert!(octant_index(1, [0, 0, 0], 2, [3, 0, 0]).is_err());
        assert_eq!(octant_index(1, [1, 0, 1], 2, [3, 1, 2]).unwrap(), 0b011);
    }

    #[test]
    fn tree_codes_match_grid_addresses() {
        let volume = Aabb::new([0.0; 3], [16.0; 3]);
        let models: Vec<SourceModel> = (0..32)
            .map(|i| {
                let f = i as f64 * 0.5 + 0.25;
                model_at(&format!("m{i}"), [f, 16.0 - f, (i % 4) as f64 * 4.0 + 1.0])
            })
            .collect();
        let tree = build(volume, &models, &unit_policy(DistributionMode::Center)).unwrap();
        for (id, code) in tree.leaf_codes().unwrap() {
            let node = tree.node(id);
            assert_eq!(code, code_from_coord(node.depth, node.coord).unwrap());
        }
    }

    #[test]
    fn center_mode_assigns_each_item_once() {
        let volume = Aabb::new([0.0; 3], [8.0; 3]);
        let models = vec![
            model_at("a", [1.0, 1.0, 1.0]),
            model_at("b", [7.0, 1.0, 1.0]),
            model_at("c", [1.0, 7.0, 7.0]),
            model_at("d", [7.0, 7.0, 7.0]),
        ];
        let tree = build(volume, &models, &unit_policy(DistributionMode::Center)).unwrap();
        let mut total = 0;
        for id in tree.leaves() {
            total += tree.node(id).items().len();
        }
        assert_eq!(total, models.len());
    }

    #[test]
    fn bbox_mode_duplicates_straddling_items() {
        let volume = Aabb::new([0.0; 3], [8.0; 3]);
        // Straddles the x midplane; far models force a split.
        let mut straddler = model_at("wide", [0.0; 3]);
        straddler.mesh.positions = vec![[3.0, 1.0, 1.0], [5.0, 1.0, 1.0]];
        let models = vec![
            straddler,
            model_at("a", [1.0, 7.0, 1.0]),
            model_at("b", [7.0, 7.0, 7.0]),
        ];

        let shared = build(
            volume,
            &models,
            &unit_policy(DistributionMode::BoundingBox { unique: false }),
        )
        .unwrap();
        let shared_count: usize = shared
            .leaves()
            .iter()
            .map(|&id| shared.node(id).items().iter().filter(|&&i| i == 0).count())
            .sum();
        assert!(shared_count >= 2, "straddler should land in several leaves");

        let unique = build(
            volume,
            &models,
            &unit_policy(DistributionMode::BoundingBox { unique: true }),
        )
        .unwrap();
        let unique_count: usize = unique
            .leaves()
            .iter()
            .map(|&id| unique.node(id).items().iter().filter(|&&i| i == 0).count())
            .sum();
        assert_eq!(unique_count, 1);
    }

    #[test]
    fn split_stops_on_coincident_geometry() {
        let volume = Aabb::new([0.0; 3], [8.0; 3]);
        let models: Vec<SourceModel> = (0..10)
            .map(|i| model_at(&format!("m{i}"), [1.0, 1.0, 1.0]))
            .collect();
        let tree = build(volume, &models, &unit_policy(DistributionMode::Center)).unwrap();
        // Coincident items cannot be separated; the tree must stay finite
        // and keep everything in one leaf.
        let leaves = tree.leaves();
        let populated: Vec<_> = leaves
            .iter()
            .filter(|&&id| !tree.node(id).items().is_empty())
            .collect();
        assert_eq!(populated.len(), 1);
        assert_eq!(tree.node(*populated[0]).items().len(), 10);
    }

    #[test]
    fn split_continues_until_node_shrinks_below_min_box() {
        // Root extent 8 with a 3-unit floor: depth-1 nodes (extent 4) may
        // still split, depth-2 nodes (extent 2) may not.
        let volume = Aabb::new([0.0; 3], [8.0; 3]);
        let models = vec![
            model_at("a", [0.5, 0.5, 0.5]),
            model_at("b", [3.5, 3.5, 3.5]),
            model_at("c", [7.5, 7.5, 7.5]),
        ];
        let policy = PartitionPolicy {
            max_depth: 8,
            min_box_size: 3.0,
            min_item_count: 2,
            mode: DistributionMode::Center,
        };
        let tree = build(volume, &models, &policy).unwrap();
        let deepest = tree
            .leaves()
            .iter()
            .map(|&id| tree.node(id).depth)
            .max()
            .unwrap();
        assert_eq!(deepest, 2);
    }

    #[test]
    fn invalid_volume_rejected() {
        let bad = Aabb {
            min: [0.0, 5.0, 0.0],
            max: [1.0, 1.0, 1.0],
        };
        assert!(matches!(
            build(bad, &[], &PartitionPolicy::default()),
            Err(PartitionError::InvalidVolume { axis: 1 })
        ));
    }
}

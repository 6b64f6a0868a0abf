//! Packs features into an R-tree, ordered by Hilbert-curve distance.

use crate::geom::{hilbert_distance, Bbox};
use crate::model::element::ElemId;
use crate::model::TileModel;

/// Index of a leaf within its [`RTree`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LeafId(pub u32);

/// Index of a trunk within its [`RTree`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TrunkId(pub u32);

#[derive(Debug, Clone, Copy)]
pub enum Branch {
    Leaf(LeafId),
    Trunk(TrunkId),
}

/// A leaf holds up to `bucket_size` features; on disk it has no record of
/// its own, the parent trunk points at the first feature stub.
#[derive(Debug)]
pub struct Leaf {
    pub bounds: Bbox,
    pub features: Vec<ElemId>,
}

/// A trunk's on-disk size is 20 bytes per child (pointer plus bbox).
#[derive(Debug)]
pub struct Trunk {
    pub bounds: Bbox,
    pub children: Vec<Branch>,
    /// Assigned by placement.
    pub location: i32,
}

/// One root's spatial tree. The root is always a trunk, even over a single
/// leaf.
#[derive(Debug)]
pub struct RTree {
    pub leaves: Vec<Leaf>,
    pub trunks: Vec<Trunk>,
    pub root: TrunkId,
}

impl RTree {
    pub fn leaf(&self, id: LeafId) -> &Leaf {
        &self.leaves[id.0 as usize]
    }

    pub fn trunk(&self, id: TrunkId) -> &Trunk {
        &self.trunks[id.0 as usize]
    }

    pub fn trunk_mut(&mut self, id: TrunkId) -> &mut Trunk {
        &mut self.trunks[id.0 as usize]
    }

    pub fn branch_bounds(&self, branch: Branch) -> &Bbox {
        match branch {
            Branch::Leaf(id) => &self.leaf(id).bounds,
            Branch::Trunk(id) => &self.trunk(id).bounds,
        }
    }
}

/// The representative point of a feature: a node's location, or the center
/// of a 2D feature's bbox clamped to the tile.
fn representative_distance(model: &TileModel, feature: ElemId) -> u32 {
    let stub = model.stub(feature);
    let tile_bounds = model.bounds();
    let point = if stub.is_node() {
        stub.xy()
    } else {
        let clamped = stub.bbox().intersection(tile_bounds);
        if clamped.is_empty() {
            stub.bbox().center()
        } else {
            clamped.center()
        }
    };
    hilbert_distance(point, tile_bounds)
}

/// Builds the R-tree over the given features.
pub fn build_rtree(model: &TileModel, features: &[ElemId], bucket_size: usize) -> RTree {
    debug_assert!(!features.is_empty());
    let bucket_size = bucket_size.max(2);

    let mut ordered: Vec<(u32, ElemId)> = features
        .iter()
        .map(|&f| (representative_distance(model, f), f))
        .collect();
    ordered.sort_by_key(|&(distance, _)| distance);

    let mut leaves = Vec::with_capacity(ordered.len().div_ceil(bucket_size));
    for chunk in ordered.chunks(bucket_size) {
        let mut bounds = Bbox::default();
        let features: Vec<ElemId> = chunk.iter().map(|&(_, f)| f).collect();
        for &f in &features {
            bounds.expand_to_include_bbox(&model.stub(f).bounds());
        }
        leaves.push(Leaf { bounds, features });
    }

    let mut tree = RTree {
        leaves,
        trunks: Vec::new(),
        root: TrunkId(0),
    };
    let mut level: Vec<Branch> = (0..tree.leaves.len())
        .map(|i| Branch::Leaf(LeafId(i as u32)))
        .collect();
    loop {
        let mut next_level = Vec::with_capacity(level.len().div_ceil(bucket_size));
        for chunk in level.chunks(bucket_size) {
            let mut bounds = Bbox::default();
            for &branch in chunk {
                bounds.expand_to_include_bbox(tree.branch_bounds(branch));
            }
            let id = TrunkId(tree.trunks.len() as u32);
            tree.trunks.push(Trunk {
                bounds,
                children: chunk.to_vec(),
                location: 0,
            });
            next_level.push(Branch::Trunk(id));
        }
        if next_level.len() == 1 {
            let Branch::Trunk(root) = next_level[0] else {
                unreachable!()
            };
            tree.root = root;
            return tree;
        }
        level = next_level;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::geom::{Coord, Tile};
    use crate::types::{FeatureType, TypedFeatureId};

    fn model_with_nodes(count: u64) -> (TileModel, Vec<ElemId>) {
        let tile = Tile::new(8, 100, 60);
        let bounds = tile.bounds();
        let mut model = TileModel::new(tile);
        let mut nodes = Vec::new();
        for i in 0..count {
            let id = model
                .create_feature(TypedFeatureId::new(FeatureType::Node, i + 1))
                .unwrap();
            let step = (bounds.max_x - bounds.min_x) / (count as i32 + 1);
            model.stub_mut(id).set_node_xy(Coord::new(
                bounds.min_x + step * (i as i32 + 1),
                bounds.min_y + step * (i as i32 + 1),
            ));
            nodes.push(id);
        }
        (model, nodes)
    }

    #[test]
    fn single_leaf_still_gets_a_trunk() {
        let (model, nodes) = model_with_nodes(3);
        let tree = build_rtree(&model, &nodes, 16);
        assert_eq!(tree.leaves.len(), 1);
        assert_eq!(tree.trunks.len(), 1);
        assert_eq!(tree.leaves[0].features.len(), 3);
    }

    #[test]
    fn leaves_respect_the_bucket_size() {
        let (model, nodes) = model_with_nodes(40);
        let tree = build_rtree(&model, &nodes, 16);
        assert_eq!(tree.leaves.len(), 3);
        assert!(tree.leaves.iter().all(|l| l.features.len() <= 16));
        let total: usize = tree.leaves.iter().map(|l| l.features.len()).sum();
        assert_eq!(total, 40);
        // Leaf bounds must cover their features
        for leaf in &tree.leaves {
            for &f in &leaf.features {
                let xy = model.stub(f).xy();
                assert!(leaf.bounds.contains(xy));
            }
        }
    }

    #[test]
    fn root_covers_everything() {
        let (model, nodes) = model_with_nodes(100);
        let tree = build_rtree(&model, &nodes, 4);
        let root_bounds = tree.trunk(tree.root).bounds;
        for &n in &nodes {
            assert!(root_bounds.contains(model.stub(n).xy()));
        }
    }
}

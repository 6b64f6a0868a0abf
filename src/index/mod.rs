//! The per-kind spatial indexes of a tile: nodes, non-area ways, areas and
//! relations, each split into up to 32 roots by indexed-key category.

pub mod hilbert;

use std::collections::HashMap;

use crate::catalog::Settings;
use crate::error::TileResult;
use crate::model::element::{ElemId, ElementKind, CATEGORY_UNASSIGNED};
use crate::model::tagtable::GlobalTagIter;
use crate::model::TileModel;
use crate::types::feature_flags;
use hilbert::{build_rtree, RTree};

/// Largest category id a key can map to.
pub const MAX_CATEGORIES: u8 = 30;
/// Roots per index: the no-category root, 30 category roots, and MULTI.
pub const NUM_ROOTS: usize = MAX_CATEGORIES as usize + 2;
/// Root holding features that match several categories (or leftovers of
/// folded categories).
pub const MULTI_CATEGORY: u8 = MAX_CATEGORIES + 1;

/// Index slots of a tile, in on-disk order.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IndexKind {
    Nodes = 0,
    Ways = 1,
    Areas = 2,
    Relations = 3,
}

pub const INDEX_KINDS: [IndexKind; 4] = [
    IndexKind::Nodes,
    IndexKind::Ways,
    IndexKind::Areas,
    IndexKind::Relations,
];

/// Settings slice the indexer needs, with the derived scan cutoff.
#[derive(Debug, Clone)]
pub struct IndexSettings {
    pub rtree_bucket_size: usize,
    pub max_key_indexes: usize,
    pub key_index_min_features: u32,
    pub keys_to_categories: HashMap<u16, u8>,
    /// Largest key code mapped to a category; tag scans stop past it.
    pub max_indexed_key: u16,
}

impl From<&Settings> for IndexSettings {
    fn from(settings: &Settings) -> Self {
        let max_indexed_key = settings.keys_to_categories.keys().copied().max().unwrap_or(0);
        Self {
            rtree_bucket_size: settings.rtree_bucket_size,
            max_key_indexes: settings.max_key_indexes,
            key_index_min_features: settings.key_index_min_features,
            keys_to_categories: settings.keys_to_categories.clone(),
            max_indexed_key,
        }
    }
}

/// One finished root: its key-category bitmask and its spatial tree.
#[derive(Debug)]
pub struct BuiltRoot {
    pub index_bits: u32,
    pub feature_count: u32,
    pub tree: RTree,
}

/// One finished index; `roots` is in on-disk order (descending feature
/// count, MULTI last).
#[derive(Debug, Default)]
pub struct BuiltIndex {
    pub roots: Vec<BuiltRoot>,
}

impl BuiltIndex {
    pub fn is_empty(&self) -> bool {
        self.roots.is_empty()
    }

    /// On-disk size of the root table.
    pub fn size(&self) -> u32 {
        self.roots.len() as u32 * 8
    }
}

/// Scans a tag table against the indexed-key schema, caching the result on
/// the element. Returns `(category, index_bits)`.
fn assign_index_category(
    model: &mut TileModel,
    tags: ElemId,
    settings: &IndexSettings,
) -> TileResult<(u8, u32)> {
    let elem = model.element(tags);
    let cached = elem.shared().category;
    if cached != CATEGORY_UNASSIGNED && cached < MULTI_CATEGORY {
        let bits = if cached == 0 { 0 } else { 1u32 << (cached - 1) };
        return Ok((cached, bits));
    }

    let mut category = 0u8;
    let mut index_bits = 0u32;
    {
        let data = model.payload(tags);
        let anchor = elem.anchor as usize;
        let handle = elem.handle;
        let mut iter = GlobalTagIter::new(data, anchor, handle);
        while let Some(tag) = iter.try_next()? {
            if tag.key > settings.max_indexed_key {
                break;
            }
            if let Some(&key_category) = settings.keys_to_categories.get(&tag.key) {
                debug_assert!((1..=MAX_CATEGORIES).contains(&key_category));
                category = if category == 0 {
                    key_category
                } else {
                    MULTI_CATEGORY
                };
                index_bits |= 1 << (key_category - 1);
            }
        }
    }
    model.element_mut(tags).shared_mut().category = category;
    Ok((category, index_bits))
}

/// Buckets every live feature into its index and category root, folds small
/// and overflow categories into MULTI, and builds the R-trees.
pub fn build_indexes(
    model: &mut TileModel,
    settings: &IndexSettings,
) -> TileResult<[BuiltIndex; 4]> {
    #[derive(Default)]
    struct Root {
        index_bits: u32,
        features: Vec<ElemId>,
    }

    let mut roots: Vec<[Root; NUM_ROOTS]> = (0..4)
        .map(|_| std::array::from_fn(|_| Root::default()))
        .collect();

    let feature_ids: Vec<ElemId> = model.feature_ids().collect();
    for feature in feature_ids {
        let elem = model.element(feature);
        if elem.is_deleted() {
            continue;
        }
        let stub = model.stub(feature);
        let flags = stub.flags();
        let is_area = flags & feature_flags::AREA != 0;
        let slot = match stub.feature_type() {
            crate::types::FeatureType::Node => IndexKind::Nodes,
            crate::types::FeatureType::Way if is_area => IndexKind::Areas,
            crate::types::FeatureType::Way => IndexKind::Ways,
            crate::types::FeatureType::Relation if is_area => IndexKind::Areas,
            crate::types::FeatureType::Relation => IndexKind::Relations,
        };
        let tags_handle = stub.tags_handle(elem.handle);
        if tags_handle == elem.handle + 8 {
            // A zero tag pointer can only mean a stub that was created on
            // demand and never resolved by a change record
            return Err(crate::error::TileError::unresolved(format!(
                "{} has no tag table; its change was never resolved",
                stub.typed_id()
            )));
        }
        let tags = model.expect_tag_table(tags_handle)?;
        let (category, index_bits) = assign_index_category(model, tags, settings)?;
        let root = &mut roots[slot as usize][category as usize];
        root.features.push(feature);
        root.index_bits |= index_bits;
    }

    let mut built: [BuiltIndex; 4] = std::array::from_fn(|_| BuiltIndex::default());
    for (slot, mut kind_roots) in roots.into_iter().enumerate() {
        // Fold categories below the feature threshold into MULTI
        let multi = MULTI_CATEGORY as usize;
        for category in 0..multi {
            if !kind_roots[category].features.is_empty()
                && (kind_roots[category].features.len() as u32) < settings.key_index_min_features
            {
                let folded = std::mem::take(&mut kind_roots[category]);
                kind_roots[multi].index_bits |= folded.index_bits;
                kind_roots[multi].features.extend(folded.features);
            }
        }

        // Order the surviving category roots: largest first, ties by
        // ascending category id
        let mut order: Vec<usize> = (0..multi)
            .filter(|&c| !kind_roots[c].features.is_empty())
            .collect();
        order.sort_by_key(|&c| (std::cmp::Reverse(kind_roots[c].features.len()), c));

        // Fold overflow roots (beyond the cap, MULTI slot reserved) into MULTI
        let keep = order.len().min(settings.max_key_indexes.saturating_sub(1));
        for &c in &order[keep..] {
            let folded = std::mem::take(&mut kind_roots[c]);
            kind_roots[multi].index_bits |= folded.index_bits;
            kind_roots[multi].features.extend(folded.features);
        }
        order.truncate(keep);
        if !kind_roots[multi].features.is_empty() {
            order.push(multi);
        }

        let index = &mut built[slot];
        for c in order {
            let root = std::mem::take(&mut kind_roots[c]);
            index.roots.push(BuiltRoot {
                index_bits: root.index_bits,
                feature_count: root.features.len() as u32,
                tree: build_rtree(model, &root.features, settings.rtree_bucket_size),
            });
        }
    }
    Ok(built)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::compiler::tags::build_tag_table;
    use crate::geom::{Coord, Tile};
    use crate::tag::{TagModel, TagValue};
    use crate::types::{FeatureType, TypedFeatureId};

    fn settings(min_features: u32, max_indexes: usize) -> IndexSettings {
        IndexSettings {
            rtree_bucket_size: 4,
            max_key_indexes: max_indexes,
            key_index_min_features: min_features,
            keys_to_categories: HashMap::from([(10, 1), (11, 2), (12, 3)]),
            max_indexed_key: 12,
        }
    }

    fn add_node(model: &mut TileModel, id: u64, key: u16) -> ElemId {
        let node = model
            .create_feature(TypedFeatureId::new(FeatureType::Node, id))
            .unwrap();
        let bounds = *model.bounds();
        let mut tags = TagModel::new();
        tags.add_global(key, TagValue::NarrowNumber(256));
        let table = build_tag_table(model, &mut tags, None);
        let node_handle = model.element(node).handle;
        let tags_handle = model.element(table).handle;
        let mut stub = model.stub_mut(node);
        stub.set_node_xy(Coord::new(
            bounds.min_x + id as i32 * 16,
            bounds.min_y + id as i32 * 16,
        ));
        stub.set_tags(node_handle, tags_handle, false);
        node
    }

    #[test]
    fn small_categories_fold_into_multi() {
        let mut model = TileModel::new(Tile::new(10, 17, 39));
        for i in 0..5 {
            add_node(&mut model, i + 1, 10);
        }
        add_node(&mut model, 100, 11); // below the threshold of 3
        let indexes = build_indexes(&mut model, &settings(3, 8)).unwrap();

        let nodes = &indexes[IndexKind::Nodes as usize];
        assert_eq!(nodes.roots.len(), 2);
        assert_eq!(nodes.roots[0].feature_count, 5);
        assert_eq!(nodes.roots[0].index_bits, 1);
        // The folded root keeps its category bit
        assert_eq!(nodes.roots[1].index_bits, 1 << 1);
        assert!(indexes[IndexKind::Ways as usize].is_empty());
    }

    #[test]
    fn overflow_roots_fold_into_multi() {
        let mut model = TileModel::new(Tile::new(10, 17, 39));
        let mut id = 0;
        for key in [10u16, 11, 12] {
            for _ in 0..4 {
                id += 1;
                add_node(&mut model, id, key);
            }
        }
        // Cap of 2 leaves room for one category root plus MULTI
        let indexes = build_indexes(&mut model, &settings(2, 2)).unwrap();
        let nodes = &indexes[IndexKind::Nodes as usize];
        assert_eq!(nodes.roots.len(), 2);
        // Equal counts: ascending category id wins the tie
        assert_eq!(nodes.roots[0].index_bits, 1);
        assert_eq!(nodes.roots[1].feature_count, 8);
        assert_eq!(nodes.roots[1].index_bits, (1 << 1) | (1 << 2));
    }

    #[test]
    fn untagged_features_land_in_the_no_category_root() {
        let mut model = TileModel::new(Tile::new(10, 17, 39));
        for i in 0..4 {
            add_node(&mut model, i + 1, 99); // key without a category
        }
        let indexes = build_indexes(&mut model, &settings(2, 8)).unwrap();
        let nodes = &indexes[IndexKind::Nodes as usize];
        assert_eq!(nodes.roots.len(), 1);
        assert_eq!(nodes.roots[0].index_bits, 0);
        assert_eq!(nodes.roots[0].feature_count, 4);
    }
}

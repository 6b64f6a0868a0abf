//! Assigns final byte offsets to every element of a tile.
//!
//! The header sits at offset 4, after the length prefix. Each index is laid
//! out as its root table followed by its trunks depth-first; a leaf has no
//! record of its own, its features are placed in leaf order. Each feature is
//! followed by its body and, on first use, its tag table and that table's
//! strings. Shared relation tables and role strings go through a deferred
//! queue flushed after the indexes; the export table comes last.

use std::collections::VecDeque;

use crate::error::TileResult;
use crate::index::hilbert::{Branch, TrunkId};
use crate::index::BuiltIndex;
use crate::model::element::{elem_flags, Alignment, ElemId, ElementKind};
use crate::model::tables::MemberTableIter;
use crate::model::tagtable::{GlobalTagIter, LocalTagIter, RawTagValue};
use crate::model::TileModel;

/// Byte offset of the tile header within the blob.
pub const HEADER_LOCATION: i32 = 4;
/// Size of the tile header: revision, four index pointers, export pointer.
pub const HEADER_SIZE: u32 = 24;

/// One item of the placement chain, in emission order.
#[derive(Debug, Clone, Copy)]
pub enum PlacedItem {
    Header,
    /// Root table of the index in slot `kind`.
    IndexRoots { kind: usize },
    Trunk { kind: usize, root: usize, trunk: TrunkId },
    Elem(ElemId),
}

/// The finished placement: every element has a location, trunks know where
/// they landed, and `placed` lists everything in output order.
pub struct Layout {
    pub placed: Vec<PlacedItem>,
    /// Location of each index's root table (0 = index absent).
    pub index_locations: [i32; 4],
    /// Total blob length excluding the trailing checksum.
    pub size: u32,
}

struct Placer<'a> {
    model: &'a mut TileModel,
    placed: Vec<PlacedItem>,
    deferred: VecDeque<ElemId>,
    pos: i32,
}

impl<'a> Placer<'a> {
    fn place_elem(&mut self, id: ElemId) {
        let elem = self.model.element_mut(id);
        debug_assert!(elem.location <= 0);
        self.pos = elem.alignment.align_up(self.pos);
        elem.location = self.pos;
        self.pos += elem.size as i32;
        self.placed.push(PlacedItem::Elem(id));
    }

    /// Queues a shared element for placement after the index region, unless
    /// it is already placed or queued.
    fn defer(&mut self, id: ElemId) {
        let elem = self.model.element_mut(id);
        if elem.location == 0 {
            elem.location = -1;
            self.deferred.push_back(id);
        }
    }

    fn place_leaf_feature(&mut self, feature: ElemId, is_last: bool) -> TileResult<()> {
        self.place_elem(feature);
        self.model
            .element_mut(feature)
            .set_flag(elem_flags::LAST, is_last);

        if let Some(body) = self.model.element(feature).feature().body {
            self.place_elem(body);
            self.defer_role_strings(body)?;
        }
        if let Some(rels) = self.model.parent_rels(feature)? {
            self.defer(rels);
        }

        let stub = self.model.stub(feature);
        let tags_handle = stub.tags_handle(self.model.element(feature).handle);
        let tags = self.model.expect_tag_table(tags_handle)?;
        if self.model.element(tags).location == 0 {
            self.place_elem(tags);
            self.place_tag_strings(tags)?;
        }
        Ok(())
    }

    /// Places the strings a freshly placed tag table references, unless they
    /// were already placed with an earlier table.
    fn place_tag_strings(&mut self, tags: ElemId) -> TileResult<()> {
        if !self.model.element(tags).needs_fixup() {
            return Ok(());
        }
        let mut strings = Vec::new();
        {
            let elem = self.model.element(tags);
            let data = self.model.payload(tags);
            let anchor = elem.anchor as usize;
            let handle = elem.handle;
            let mut locals = LocalTagIter::new(data, anchor, handle);
            while let Some(tag) = locals.try_next()? {
                strings.push(self.model.key_string(tag.key_target)?);
                if let RawTagValue::LocalString { target, .. } = tag.value {
                    strings.push(self.model.expect_string(target)?);
                }
            }
            let mut globals = GlobalTagIter::new(data, anchor, handle);
            while let Some(tag) = globals.try_next()? {
                if let RawTagValue::LocalString { target, .. } = tag.value {
                    strings.push(self.model.expect_string(target)?);
                }
            }
        }
        for string in strings {
            if self.model.element(string).location == 0 {
                self.place_elem(string);
            }
        }
        Ok(())
    }

    /// Queues the local role strings of a relation body.
    fn defer_role_strings(&mut self, body: ElemId) -> TileResult<()> {
        if self.model.element(body).kind != ElementKind::RelationBody
            || !self.model.element(body).needs_fixup()
        {
            return Ok(());
        }
        let mut strings = Vec::new();
        {
            let elem = self.model.element(body);
            let data = self.model.payload(body);
            let mut iter = MemberTableIter::new(data, elem.anchor as usize, elem.handle);
            while let Some(member) = iter.try_next()? {
                if let Some(crate::model::tables::RoleRef::Local { target, .. }) = member.role {
                    strings.push(self.model.expect_string(target)?);
                }
            }
        }
        for string in strings {
            self.defer(string);
        }
        Ok(())
    }

    fn place_trunk(
        &mut self,
        indexes: &mut [BuiltIndex; 4],
        kind: usize,
        root: usize,
        trunk_id: TrunkId,
    ) -> TileResult<()> {
        let child_count = {
            let tree = &mut indexes[kind].roots[root].tree;
            self.pos = Alignment::DWord.align_up(self.pos);
            let trunk = tree.trunk_mut(trunk_id);
            trunk.location = self.pos;
            self.pos += trunk.children.len() as i32 * 20;
            trunk.children.len()
        };
        self.placed.push(PlacedItem::Trunk {
            kind,
            root,
            trunk: trunk_id,
        });
        for i in 0..child_count {
            let branch = indexes[kind].roots[root].tree.trunk(trunk_id).children[i];
            match branch {
                Branch::Trunk(child) => self.place_trunk(indexes, kind, root, child)?,
                Branch::Leaf(leaf) => {
                    let features = indexes[kind].roots[root].tree.leaf(leaf).features.clone();
                    for (n, &feature) in features.iter().enumerate() {
                        self.place_leaf_feature(feature, n + 1 == features.len())?;
                    }
                }
            }
        }
        Ok(())
    }
}

/// Computes the placement for the model and its built indexes.
pub fn place(model: &mut TileModel, indexes: &mut [BuiltIndex; 4]) -> TileResult<Layout> {
    let mut placer = Placer {
        model,
        placed: vec![PlacedItem::Header],
        deferred: VecDeque::new(),
        pos: HEADER_LOCATION + HEADER_SIZE as i32,
    };
    let mut index_locations = [0i32; 4];

    for kind in 0..4 {
        if indexes[kind].is_empty() {
            continue;
        }
        placer.pos = Alignment::DWord.align_up(placer.pos);
        index_locations[kind] = placer.pos;
        placer.pos += indexes[kind].size() as i32;
        placer.placed.push(PlacedItem::IndexRoots { kind });
        for root in 0..indexes[kind].roots.len() {
            let trunk = indexes[kind].roots[root].tree.root;
            placer.place_trunk(indexes, kind, root, trunk)?;
        }
    }

    while let Some(id) = placer.deferred.pop_front() {
        debug_assert_eq!(placer.model.element(id).location, -1);
        placer.model.element_mut(id).location = 0;
        placer.place_elem(id);
    }

    if let Some(exports) = placer.model.export_table() {
        placer.place_elem(exports);
    }

    Ok(Layout {
        placed: placer.placed,
        index_locations,
        size: placer.pos as u32,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::compiler::tags::build_tag_table;
    use crate::geom::{Coord, Tile};
    use crate::index::{build_indexes, IndexSettings};
    use crate::tag::TagModel;
    use crate::types::{FeatureType, TypedFeatureId};

    fn build_simple_model() -> (TileModel, [BuiltIndex; 4]) {
        let mut model = TileModel::new(Tile::new(10, 17, 39));
        let bounds = *model.bounds();
        for i in 0..5u64 {
            let node = model
                .create_feature(TypedFeatureId::new(FeatureType::Node, i + 1))
                .unwrap();
            let mut tags = TagModel::new();
            tags.add_global(7, crate::tag::TagValue::NarrowNumber(300));
            let table = build_tag_table(&mut model, &mut tags, None);
            let node_handle = model.element(node).handle;
            let tags_handle = model.element(table).handle;
            let mut stub = model.stub_mut(node);
            stub.set_node_xy(Coord::new(bounds.min_x + 64 * i as i32, bounds.min_y + 8));
            stub.set_tags(node_handle, tags_handle, false);
        }
        let settings = IndexSettings {
            rtree_bucket_size: 4,
            max_key_indexes: 8,
            key_index_min_features: 1,
            keys_to_categories: std::collections::HashMap::new(),
            max_indexed_key: 0,
        };
        let indexes = build_indexes(&mut model, &settings).unwrap();
        (model, indexes)
    }

    #[test]
    fn placement_is_aligned_and_disjoint() {
        let (mut model, mut indexes) = build_simple_model();
        let layout = place(&mut model, &mut indexes).unwrap();

        let mut intervals: Vec<(i32, i32)> = vec![(4, 4 + HEADER_SIZE as i32)];
        for item in &layout.placed {
            match *item {
                PlacedItem::Elem(id) => {
                    let elem = model.element(id);
                    assert!(elem.location > 0, "unplaced element in chain");
                    assert_eq!(
                        elem.location % elem.alignment.bytes() as i32,
                        0,
                        "misaligned element"
                    );
                    intervals.push((elem.location, elem.location + elem.size as i32));
                }
                PlacedItem::Trunk { kind, root, trunk } => {
                    let t = indexes[kind].roots[root].tree.trunk(trunk);
                    intervals.push((t.location, t.location + t.children.len() as i32 * 20));
                }
                PlacedItem::IndexRoots { kind } => {
                    let loc = layout.index_locations[kind];
                    intervals.push((loc, loc + indexes[kind].size() as i32));
                }
                PlacedItem::Header => {}
            }
        }
        intervals.sort_unstable();
        for pair in intervals.windows(2) {
            assert!(pair[0].1 <= pair[1].0, "overlapping placements: {pair:?}");
        }
        let max_end = intervals.iter().map(|&(_, e)| e).max().unwrap();
        assert!(max_end as u32 <= layout.size);
    }

    #[test]
    fn shared_tags_are_placed_once() {
        let (mut model, mut indexes) = build_simple_model();
        place(&mut model, &mut indexes).unwrap();
        let tag_tables: Vec<_> = model
            .elements()
            .filter(|(_, e)| e.kind == ElementKind::TagTable)
            .collect();
        // All five nodes share one deduplicated table, placed exactly once
        assert_eq!(tag_tables.len(), 1);
        assert!(tag_tables[0].1.location > 0);
    }
}

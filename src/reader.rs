//! Parses an existing tile blob back into a [`TileModel`].
//!
//! Every element is registered under its byte offset as its handle and
//! marked ORIGINAL, so the writer can copy its bytes verbatim (modulo
//! fixup). Shared-element hashes are recomputed with the same algorithms the
//! builders use; if they ever diverged, deduplication across updates would
//! silently stop working.

use bytes::Bytes;

use crate::error::{TileError, TileResult};
use crate::geom::Tile;
use crate::model::element::{elem_flags, Alignment, ElemId, ExportTarget};
use crate::model::feature::{follow_ptr, Stub, NODE_ANCHOR, FEATURE2D_ANCHOR};
use crate::model::tables::{
    read_i32, read_u32, MemberTableIter, NodeTableIter, RelTableIter, RoleRef, TableRef,
};
use crate::model::tagtable::{GlobalTagIter, LocalTagIter, RawTagValue, RelTableHasher, TagHasher};
use crate::model::TileModel;
use crate::types::{feature_flags, FeatureType, Handle, TypedFeatureId};
use crate::writer::validate_blob;

/// Blob offsets of the header slots (body offsets 0..23, shifted past the
/// length prefix).
const NODE_INDEX_SLOT: usize = 8;
const WAY_INDEX_SLOT: usize = 12;
const AREA_INDEX_SLOT: usize = 16;
const RELATION_INDEX_SLOT: usize = 20;
const EXPORTS_SLOT: usize = 24;

/// Reads a tile blob into a model ready for updating.
pub fn read_tile(tile: Tile, blob: Bytes) -> TileResult<TileModel> {
    validate_blob(&blob)?;
    let mut model = TileModel::new(tile);
    model.set_source(blob.clone());
    let mut reader = TileReader {
        model: &mut model,
        blob: &blob,
    };
    reader.read_index(NODE_INDEX_SLOT, NODE_ANCHOR as usize)?;
    reader.read_index(WAY_INDEX_SLOT, FEATURE2D_ANCHOR as usize)?;
    reader.read_index(AREA_INDEX_SLOT, FEATURE2D_ANCHOR as usize)?;
    reader.read_index(RELATION_INDEX_SLOT, FEATURE2D_ANCHOR as usize)?;
    reader.read_exports()?;
    Ok(model)
}

struct TileReader<'a> {
    model: &'a mut TileModel,
    blob: &'a Bytes,
}

impl TileReader<'_> {
    fn read_index(&mut self, slot: usize, anchor: usize) -> TileResult<()> {
        let root_table = follow_ptr(self.blob, slot)?;
        if root_table == 0 {
            return Ok(());
        }
        if root_table & 3 != 0 {
            return Err(TileError::malformed("misaligned index root table"));
        }
        let mut pos = root_table as usize;
        loop {
            let word = read_i32(self.blob, pos)?;
            let last = word & 1 != 0;
            let trunk = pos as i32 + (word & !1);
            self.read_trunk(trunk as usize, anchor)?;
            if last {
                return Ok(());
            }
            pos += 8;
        }
    }

    fn read_trunk(&mut self, mut pos: usize, anchor: usize) -> TileResult<()> {
        loop {
            let word = read_i32(self.blob, pos)?;
            let last = word & 1 != 0;
            let is_leaf = word & 2 != 0;
            let child = pos as i32 + (word & !3);
            if is_leaf {
                self.read_leaf(child as usize, anchor)?;
            } else {
                self.read_trunk(child as usize, anchor)?;
            }
            if last {
                return Ok(());
            }
            pos += 20;
        }
    }

    fn read_leaf(&mut self, first_stub: usize, anchor: usize) -> TileResult<()> {
        let mut pos = first_stub;
        loop {
            let flags = read_u32(self.blob, pos + anchor)?;
            let last = flags & 1 != 0;
            let advance = self.read_feature(pos, anchor)?;
            if last {
                return Ok(());
            }
            pos += advance;
        }
    }

    /// Reads one feature stub and everything it references. Returns the
    /// stub's byte size.
    fn read_feature(&mut self, stub_start: usize, anchor: usize) -> TileResult<usize> {
        let handle = (stub_start + anchor) as Handle;
        let stub_view = Stub::new(&self.blob[stub_start..], anchor as u32);
        let typed_id = stub_view.typed_id();
        let is_member = stub_view.is_relation_member();
        let size = match typed_id.feature_type() {
            FeatureType::Node => 20 + if is_member { 4 } else { 0 },
            _ => 32,
        };

        let feature = self
            .model
            .add_original_feature(typed_id, handle, size as u32)?;
        let tags_handle = stub_view.tags_handle(handle);
        let tags = self.read_tag_table(tags_handle, stub_view.has_local_tags())?;
        self.model.add_user(tags);

        match typed_id.feature_type() {
            FeatureType::Node => {
                if let Some(rels_handle) = stub_view.node_rels_handle(handle) {
                    self.read_rel_table(rels_handle)?;
                }
            }
            FeatureType::Way => self.read_way_body(feature, stub_start, is_member)?,
            FeatureType::Relation => self.read_relation_body(feature, stub_start, is_member)?,
        }
        Ok(size)
    }

    fn read_way_body(
        &mut self,
        feature: ElemId,
        stub_start: usize,
        is_member: bool,
    ) -> TileResult<()> {
        let body_pos = follow_ptr(self.blob, stub_start + FEATURE2D_ANCHOR as usize + 12)?;
        let body_pos = body_pos as usize;
        let stub = Stub::new(&self.blob[stub_start..], FEATURE2D_ANCHOR);
        let rels_ptr_size = if is_member { 4usize } else { 0 };

        let mut needs_fixup = false;
        let mut node_table_size = 0usize;
        if stub.has_flag(feature_flags::WAYNODE) {
            let table_anchor = body_pos - rels_ptr_size;
            let mut iter = NodeTableIter::new(self.blob, table_anchor, table_anchor as Handle);
            while let Some(entry) = iter.try_next()? {
                needs_fixup |= !entry.reference.is_foreign();
            }
            node_table_size = iter.consumed();
        }
        let anchor = node_table_size + rels_ptr_size;

        // Coordinate section: count, then delta pairs, then node ids when
        // the store carries them
        let mut r = crate::codec::StreamReader::new(&self.blob[body_pos..], "tile");
        let count = r.usize()?;
        r.skip_varints(count * 2)?;
        if self.model.waynode_ids() {
            r.skip_varints(count)?;
        }
        let coords_size = self.blob.len() - body_pos - r.remaining();
        let size = anchor + coords_size;

        if is_member {
            let rels_handle = body_pos as Handle - 4 + read_i32(self.blob, body_pos - 4)?;
            self.read_rel_table(rels_handle)?;
        }
        let body = self.model.attach_original_body(
            feature,
            body_pos as Handle,
            (body_pos - anchor) as u32,
            size as u32,
            anchor as u32,
            needs_fixup,
        );
        let _ = body;
        Ok(())
    }

    fn read_relation_body(
        &mut self,
        feature: ElemId,
        stub_start: usize,
        is_member: bool,
    ) -> TileResult<()> {
        let body_pos = follow_ptr(self.blob, stub_start + FEATURE2D_ANCHOR as usize + 12)?;
        let body_pos = body_pos as usize;

        let mut needs_fixup = false;
        let mut role_strings = Vec::new();
        let mut iter = MemberTableIter::new(self.blob, body_pos, body_pos as Handle);
        while let Some(entry) = iter.try_next()? {
            needs_fixup |= !entry.reference.is_foreign();
            if let Some(RoleRef::Local { target, .. }) = entry.role {
                role_strings.push(target);
                needs_fixup = true;
            }
        }
        let table_size = iter.consumed();
        for target in role_strings {
            self.read_string(target)?;
        }

        let (size, anchor) = if is_member {
            let rels_handle = body_pos as Handle - 4 + read_i32(self.blob, body_pos - 4)?;
            self.read_rel_table(rels_handle)?;
            (table_size + 4, 4usize)
        } else {
            (table_size, 0)
        };
        self.model.attach_original_body(
            feature,
            body_pos as Handle,
            (body_pos - anchor) as u32,
            size as u32,
            anchor as u32,
            needs_fixup,
        );
        Ok(())
    }

    /// Interns a string stored at the given blob offset.
    fn read_string(&mut self, handle: Handle) -> TileResult<ElemId> {
        if let Some(existing) = self.model.by_handle(handle) {
            self.model.add_user(existing);
            return Ok(existing);
        }
        let pos = handle as usize;
        let (len, prefix) = decode_string_len(self.blob, pos)?;
        let id = self
            .model
            .add_unique_string(handle, pos as u32, (prefix + len) as u32);
        self.model.add_user(id);
        Ok(id)
    }

    /// Interns a tag table, recomputing its content hash in build order:
    /// local tags in stored order, then global tags.
    fn read_tag_table(&mut self, handle: Handle, has_locals: bool) -> TileResult<ElemId> {
        if let Some(existing) = self.model.by_handle(handle) {
            return Ok(existing);
        }
        let pos = handle as usize;
        let mut hasher = TagHasher::new();
        let mut needs_fixup = false;

        let mut anchor = 0usize;
        if has_locals {
            needs_fixup = true;
            // First pass to find the extent, second to read key strings; the
            // iterator needs the anchor only as a buffer position
            let mut iter = LocalTagIter::new(self.blob, pos, handle);
            let mut lowest = pos;
            let mut entries = Vec::new();
            while let Some(tag) = iter.try_next()? {
                let width = 2 + usize::from(tag.flags & 2);
                lowest = tag.key_ofs - width;
                entries.push(tag);
            }
            anchor = pos - lowest;
            for tag in entries {
                let key = self.read_key_string(tag.key_target)?;
                hasher.add_string_hash(self.model.element(key).shared().hash);
                match tag.value {
                    RawTagValue::Narrow(v) => hasher.add_value(u32::from(v)),
                    RawTagValue::Wide(v) => hasher.add_value(v),
                    RawTagValue::LocalString { target, .. } => {
                        let value = self.read_string(target)?;
                        hasher.add_string_hash(self.model.element(value).shared().hash);
                    }
                }
            }
        }

        let mut iter = GlobalTagIter::new(self.blob, pos, handle);
        let mut global_size = 0usize;
        while let Some(tag) = iter.try_next()? {
            hasher.add_code(u32::from(tag.key));
            match tag.value {
                RawTagValue::Narrow(v) => hasher.add_value(u32::from(v)),
                RawTagValue::Wide(v) => hasher.add_value(v),
                RawTagValue::LocalString { target, .. } => {
                    let value = self.read_string(target)?;
                    hasher.add_string_hash(self.model.element(value).shared().hash);
                    needs_fixup = true;
                }
            }
            global_size = iter.consumed();
        }

        let size = (anchor + global_size) as u32;
        let id = self.model.add_tag_table(
            handle,
            (pos - anchor) as u32,
            size,
            anchor as u32,
            hasher.hash(),
        );
        self.model
            .element_mut(id)
            .set_flag(elem_flags::NEEDS_FIXUP, needs_fixup);
        Ok(id)
    }

    /// Key strings may sit at unaligned handles rounded down by the encoder.
    fn read_key_string(&mut self, masked_handle: Handle) -> TileResult<ElemId> {
        // The true handle is within [h, h+3]; an existing entry wins
        for probe in masked_handle..masked_handle + 4 {
            if self.model.by_handle(probe).is_some() {
                return self.read_string(probe);
            }
        }
        // Not yet interned: the masked handle is exact for aligned strings;
        // otherwise the writer aligned the string itself, so this holds
        let id = self.read_string(masked_handle)?;
        self.model.element_mut(id).alignment = Alignment::DWord;
        Ok(id)
    }

    fn read_rel_table(&mut self, handle: Handle) -> TileResult<ElemId> {
        if let Some(existing) = self.model.by_handle(handle) {
            self.model.add_user(existing);
            return Ok(existing);
        }
        let pos = handle as usize;
        let mut hasher = RelTableHasher::new();
        let mut needs_fixup = false;
        let mut iter = RelTableIter::new(&self.blob[pos..], handle);
        while let Some(entry) = iter.try_next()? {
            match entry.reference {
                TableRef::Local(target) => {
                    hasher.add_local(target);
                    needs_fixup = true;
                }
                TableRef::Foreign {
                    tex_delta,
                    tip_delta,
                } => {
                    if let Some(tip) = tip_delta {
                        hasher.add_tip_delta(tip);
                    }
                    hasher.add_tex_delta(tex_delta);
                }
            }
        }
        let size = iter.consumed() as u32;
        let id = self
            .model
            .add_rel_table(handle, pos as u32, size, hasher.hash());
        self.model
            .element_mut(id)
            .set_flag(elem_flags::NEEDS_FIXUP, needs_fixup);
        self.model.add_user(id);
        Ok(id)
    }

    fn read_exports(&mut self) -> TileResult<()> {
        let target = follow_ptr(self.blob, EXPORTS_SLOT)?;
        if target == 0 {
            return Ok(());
        }
        let target = target as usize;
        let count = read_u32(self.blob, target - 4)? as usize;
        let mut targets = Vec::with_capacity(count);
        for i in 0..count {
            let slot = target + i * 4;
            let feature_pos = follow_ptr(self.blob, slot)?;
            let feature = self.model.by_handle(feature_pos).ok_or_else(|| {
                TileError::unresolved(format!("export entry {i} targets nothing at {feature_pos}"))
            })?;
            targets.push(ExportTarget::Elem(feature));
        }
        self.model.create_export_table(targets);
        Ok(())
    }
}

fn decode_string_len(blob: &[u8], pos: usize) -> TileResult<(usize, usize)> {
    let mut len = 0usize;
    let mut shift = 0u32;
    for i in 0..3 {
        let b = *blob
            .get(pos + i)
            .ok_or_else(|| TileError::malformed("string runs past tile end"))?;
        len |= usize::from(b & 0x7F) << shift;
        if b & 0x80 == 0 {
            return Ok((len, i + 1));
        }
        shift += 7;
    }
    Err(TileError::malformed("string length prefix too long"))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::geom::Coord;
    use crate::index::{build_indexes, IndexSettings};
    use crate::layout::place;
    use crate::testutil::{compile_fixture, test_context, test_tile};
    use crate::writer::write_tile;

    fn fixture_blob() -> Bytes {
        let context = test_context();
        let o = test_tile().bounds().bottom_left();
        compile_fixture(&context, |w| {
            w.export_table(&[TypedFeatureId::new(FeatureType::Way, 2)]);
            w.node(5, Coord::new(o.x + 150, o.y + 150), &[("place", "city")]);
            w.node(10, Coord::new(o.x + 100, o.y + 100), &[]);
            w.node(11, Coord::new(o.x + 200, o.y + 100), &[]);
            w.node(12, Coord::new(o.x + 200, o.y + 200), &[]);
            w.way(2, &[10, 5, 11, 12], false, &[("highway", "footway"), ("name:loc", "Gasse")]);
            w.relation(
                3,
                &[(TypedFeatureId::new(FeatureType::Way, 2), "outer")],
                &[("type", "multipolygon"), ("natural", "wood")],
            );
        })
        .unwrap()
    }

    #[test]
    fn reading_and_rewriting_reproduces_the_blob() {
        let blob = fixture_blob();
        let context = test_context();
        let mut model = read_tile(test_tile(), blob.clone()).unwrap();
        let settings = IndexSettings::from(&context.settings);
        let mut indexes = build_indexes(&mut model, &settings).unwrap();
        let layout = place(&mut model, &mut indexes).unwrap();
        let rewritten = write_tile(&model, &indexes, &layout).unwrap();
        assert_eq!(blob, rewritten);
    }

    #[test]
    fn round_trip_preserves_the_feature_graph() {
        let blob = fixture_blob();
        let model = read_tile(test_tile(), blob).unwrap();

        // The tagged node survives with its membership-free stub
        let node = model
            .get_feature(TypedFeatureId::new(FeatureType::Node, 5))
            .unwrap();
        let stub = model.stub(node);
        assert!(stub.has_flag(crate::types::feature_flags::WAYNODE));
        assert!(!stub.is_relation_member());

        // The way carries a node table referencing the feature node
        let way = model
            .get_feature(TypedFeatureId::new(FeatureType::Way, 2))
            .unwrap();
        let way_elem = model.element(way);
        assert!(model.stub(way).has_flag(crate::types::feature_flags::WAYNODE));
        assert!(model.stub(way).is_relation_member());
        let body = way_elem.feature().body.unwrap();
        assert!(model.element(body).needs_fixup());

        // The local key string of the way's tags was interned
        let tags_handle = model.stub(way).tags_handle(way_elem.handle);
        let tags = model.expect_tag_table(tags_handle).unwrap();
        assert!(model.element(tags).needs_fixup());
        assert!(model.element(tags).anchor > 0);

        // Export table binds way/2
        let exports = model.export_table().unwrap();
        match &model.element(exports).detail {
            crate::model::element::Detail::Exports(e) => {
                assert_eq!(e.targets.len(), 1);
            }
            _ => panic!("wrong detail"),
        }
    }

    #[test]
    fn rejects_corrupted_blobs() {
        let blob = fixture_blob();
        let mut corrupted = blob.to_vec();
        let middle = corrupted.len() / 2;
        corrupted[middle] ^= 0xFF;
        assert!(matches!(
            read_tile(test_tile(), Bytes::from(corrupted)),
            Err(TileError::ChecksumMismatch { .. })
        ));

        let mut truncated = blob.to_vec();
        truncated.truncate(10);
        assert!(read_tile(test_tile(), Bytes::from(truncated)).is_err());
    }
}

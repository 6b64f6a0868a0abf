//! Applies a Tile Edit Script (TES) to a tile model: resolves feature
//! references by index, mutates stubs, rebuilds bodies and re-deduplicates
//! shared tables.

pub mod writer;

use log::warn;

use crate::codec::{put_i64_varint, put_u64_varint, StreamReader};
use crate::compiler::writers::{
    MemberTableWriter, NodeTableWriter, RelTableWriter, StrRef, TagTableWriter,
};
use crate::error::{TileError, TileResult};
use crate::geom::{Bbox, Coord};
use crate::model::element::{elem_flags, Alignment, ElemId, Payload};
use crate::model::tables::{read_i32, write_i32};
use crate::model::TileModel;
use crate::types::{feature_flags, FeatureType, Handle, TypedFeatureId};

/// Per-feature change flags. Bits 16–64 are reused between feature types:
/// what is `MEMBERS_CHANGED` on a way is `NODE_BELONGS_TO_WAY` on a node.
pub mod tes_flags {
    pub const TAGS_CHANGED: u8 = 1;
    pub const SHARED_TAGS: u8 = 1 << 1;
    pub const RELATIONS_CHANGED: u8 = 1 << 2;
    pub const GEOMETRY_CHANGED: u8 = 1 << 3;
    // 2D features
    pub const MEMBERS_CHANGED: u8 = 1 << 4;
    /// Ways: the node-id section is replaced.
    pub const NODE_IDS_CHANGED: u8 = 1 << 5;
    /// Relations: an explicit bbox follows.
    pub const BBOX_CHANGED: u8 = 1 << 5;
    pub const IS_AREA: u8 = 1 << 6;
    // Nodes
    pub const NODE_BELONGS_TO_WAY: u8 = 1 << 4;
    pub const HAS_SHARED_LOCATION: u8 = 1 << 5;
    pub const IS_EXCEPTION_NODE: u8 = 1 << 6;
}

/// Applies one TES stream to the model.
pub fn apply_tes(model: &mut TileModel, data: &[u8]) -> TileResult<()> {
    let mut reader = TesReader {
        model,
        r: StreamReader::new(data, "TES"),
        strings: Vec::new(),
        tag_tables: Vec::new(),
        rel_tables: Vec::new(),
        features: Vec::new(),
        group_starts: [0; 3],
        prev_xy: Coord::default(),
    };
    reader.prev_xy = reader.model.bounds().bottom_left();
    reader.read_feature_index()?;
    reader.read_strings()?;
    reader.read_tag_tables()?;
    reader.read_rel_tables()?;
    reader.read_feature_changes()?;
    reader.read_removed_features()?;
    reader.read_exports()?;
    Ok(())
}

struct TesReader<'a, 'd> {
    model: &'a mut TileModel,
    r: StreamReader<'d>,
    strings: Vec<ElemId>,
    tag_tables: Vec<ElemId>,
    rel_tables: Vec<ElemId>,
    /// Indexed feature references with their changed bit.
    features: Vec<(ElemId, bool)>,
    /// Start offset of each type group within `features`.
    group_starts: [usize; 3],
    prev_xy: Coord,
}

impl TesReader<'_, '_> {
    fn read_feature_index(&mut self) -> TileResult<()> {
        let count = self.r.usize()?;
        self.features.reserve(count);
        let mut group = 0usize;
        let mut prev_id = 0u64;
        while self.features.len() < count {
            let reference = self.r.u64()?;
            if reference == 0 {
                group += 1;
                if group > 2 {
                    return Err(TileError::malformed("too many feature groups in TES"));
                }
                self.group_starts[group] = self.features.len();
                prev_id = 0;
                continue;
            }
            let id = (reference >> 1) + prev_id;
            prev_id = id;
            let changed = reference & 1 != 0;
            let feature_type = match group {
                0 => FeatureType::Node,
                1 => FeatureType::Way,
                _ => FeatureType::Relation,
            };
            let typed_id = TypedFeatureId::new(feature_type, id);
            let elem = match self.model.get_feature(typed_id) {
                Some(elem) => elem,
                // Not present: create a stub on demand and let a later
                // change record (or the write-time check) resolve it
                None => self.model.create_feature(typed_id)?,
            };
            self.features.push((elem, changed));
        }
        // Groups that never appeared start at the end
        for g in group + 1..3 {
            self.group_starts[g] = self.features.len();
        }
        Ok(())
    }

    fn read_strings(&mut self) -> TileResult<()> {
        let count = self.r.usize()?;
        self.strings.reserve(count);
        for _ in 0..count {
            let s = self.r.string()?.as_bytes().to_vec();
            let id = self.model.add_string(&s);
            self.strings.push(id);
        }
        Ok(())
    }

    fn string_ref(&self, number: usize) -> TileResult<StrRef> {
        let id = self.shared_string(number)?;
        Ok(StrRef {
            handle: self.model.element(id).handle,
            hash: self.model.element(id).shared().hash,
        })
    }

    fn shared_string(&self, number: usize) -> TileResult<ElemId> {
        self.strings.get(number).copied().ok_or_else(|| {
            TileError::malformed(format!(
                "string #{number} exceeds range ({} strings)",
                self.strings.len()
            ))
        })
    }

    fn shared_tag_table(&self, number: usize) -> TileResult<ElemId> {
        self.tag_tables.get(number).copied().ok_or_else(|| {
            TileError::malformed(format!(
                "tag table #{number} exceeds range ({} tables)",
                self.tag_tables.len()
            ))
        })
    }

    fn shared_rel_table(&self, number: usize) -> TileResult<ElemId> {
        self.rel_tables.get(number).copied().ok_or_else(|| {
            TileError::malformed(format!(
                "relation table #{number} exceeds range ({} tables)",
                self.rel_tables.len()
            ))
        })
    }

    fn indexed_feature(&self, number: usize) -> TileResult<ElemId> {
        self.features.get(number).map(|&(elem, _)| elem).ok_or_else(|| {
            TileError::malformed(format!(
                "feature #{number} exceeds range ({} features)",
                self.features.len()
            ))
        })
    }

    fn indexed_node(&self, number: usize) -> TileResult<ElemId> {
        if number >= self.group_starts[1] {
            return Err(TileError::malformed(format!(
                "node #{number} exceeds range ({} nodes)",
                self.group_starts[1]
            )));
        }
        self.indexed_feature(number)
    }

    fn indexed_relation(&self, number: usize) -> TileResult<ElemId> {
        self.indexed_feature(self.group_starts[2] + number)
    }

    fn read_tag_tables(&mut self) -> TileResult<()> {
        let count = self.r.usize()?;
        self.tag_tables.reserve(count);
        for _ in 0..count {
            let table = self.read_tag_table()?;
            self.tag_tables.push(table);
        }
        Ok(())
    }

    fn read_tag_table(&mut self) -> TileResult<ElemId> {
        let tagged_size = self.r.u32()?;
        let size = tagged_size & !1;
        if size < 4 {
            return Err(TileError::malformed(
                "tag table smaller than the reserved end marker".to_string(),
            ));
        }
        let mut local_size = 0u32;
        let mut needs_fixup = false;
        if tagged_size & 1 != 0 {
            needs_fixup = true;
            local_size = self.r.u32()? << 1;
            if local_size > size.saturating_sub(4) {
                return Err(TileError::malformed(format!(
                    "local-tag size {local_size} too large for tag table of {size} bytes"
                )));
            }
        }

        // Pre-read both sections so the speculative table allocation stays
        // the most recent one while it is written
        enum L {
            Value { flags: u32, key: usize, value: u32 },
            Str { key: usize, value: usize },
        }
        enum G {
            Value { flags: u32, code: u32, value: u32 },
            Str { code: u32, value: usize },
        }
        let mut locals = Vec::new();
        let mut produced = 0u32;
        while produced < local_size {
            let key_bits = self.r.u32()?;
            let value = self.r.u32()?;
            let flags = key_bits & 3;
            produced += 4 + 2 + (flags & 2);
            if flags == 3 {
                locals.push(L::Str {
                    key: (key_bits >> 2) as usize,
                    value: value as usize,
                });
            } else {
                locals.push(L::Value {
                    flags,
                    key: (key_bits >> 2) as usize,
                    value,
                });
            }
        }
        if produced != local_size {
            return Err(TileError::malformed("local tags overrun their size"));
        }
        let mut globals = Vec::new();
        let mut produced = local_size;
        let mut prev_key_shifted = 0u32;
        while produced < size {
            let key_bits = self.r.u32()? + prev_key_shifted;
            prev_key_shifted = key_bits & 0xFFFC;
            let flags = key_bits & 3;
            let value = self.r.u32()?;
            produced += 2 + 2 + (flags & 2);
            if flags == 3 {
                globals.push(G::Str {
                    code: key_bits >> 2,
                    value: value as usize,
                });
                needs_fixup = true;
            } else {
                globals.push(G::Value {
                    flags,
                    code: key_bits >> 2,
                    value,
                });
            }
        }
        if produced != size {
            return Err(TileError::malformed("tag table sections overrun its size"));
        }

        // Force 4-byte alignment on local key strings before encoding
        for local in &locals {
            let key = match local {
                L::Value { key, .. } | L::Str { key, .. } => *key,
            };
            let id = self.shared_string(key)?;
            self.model.element_mut(id).alignment = Alignment::DWord;
        }

        let table = self.model.begin_tag_table(size, local_size);
        let handle = self.model.element(table).handle;
        let mut resolved_locals = Vec::with_capacity(locals.len());
        for local in &locals {
            resolved_locals.push(match local {
                L::Value { flags, key, value } => {
                    (self.string_ref(*key)?, *flags, *value, None)
                }
                L::Str { key, value } => {
                    (self.string_ref(*key)?, 3, 0, Some(self.string_ref(*value)?))
                }
            });
        }
        let mut resolved_globals = Vec::with_capacity(globals.len());
        for global in &globals {
            resolved_globals.push(match global {
                G::Value { flags, code, value } => (*flags, *code, *value, None),
                G::Str { code, value } => (3, *code, 0, Some(self.string_ref(*value)?)),
            });
        }

        let payload = self.model.payload_mut(table);
        let mut writer = TagTableWriter::new(payload, handle, local_size);
        for (key, flags, value, string) in resolved_locals {
            match string {
                Some(value) => writer.local_tag_string(key, value),
                None => writer.local_tag_value(flags, key, value),
            }
        }
        writer.end_local_tags();
        for (flags, code, value, string) in resolved_globals {
            match string {
                Some(value) => writer.global_tag_string(code, value),
                None => writer.global_tag_value(flags, code, value),
            }
        }
        writer.end_global_tags();
        let hash = writer.hash();
        Ok(self.model.complete_tag_table(table, hash, needs_fixup))
    }

    fn read_rel_tables(&mut self) -> TileResult<()> {
        let count = self.r.usize()?;
        self.rel_tables.reserve(count);
        for _ in 0..count {
            let size = self.r.u32()?;
            let table = self.read_rel_table_contents(size)?;
            self.rel_tables.push(table);
        }
        Ok(())
    }

    fn read_rel_table_contents(&mut self, size: u32) -> TileResult<ElemId> {
        if size == 0 {
            return Err(TileError::malformed("empty relation table in TES"));
        }
        enum Entry {
            Local(Handle),
            Foreign { tex: i32, tip: Option<i32> },
        }
        let mut entries = Vec::new();
        let mut produced = 0u32;
        let mut is_foreign = false;
        while produced < size {
            let reference = self.r.u32()?;
            if reference & 1 != 0 {
                let tip = self.r.i32()?;
                let tex = zigzag_decode(reference >> 1);
                is_foreign = true;
                produced += entry_width_fwd(tex, 12, Some(tip));
                entries.push(Entry::Foreign { tex, tip: Some(tip) });
            } else if is_foreign {
                // Locals always precede foreigns; past the first foreign,
                // even references are same-tile TEX deltas
                let tex = zigzag_decode(reference >> 1);
                produced += entry_width_fwd(tex, 12, None);
                entries.push(Entry::Foreign { tex, tip: None });
            } else {
                let relation = self.indexed_relation((reference >> 1) as usize)?;
                produced += 4;
                entries.push(Entry::Local(self.model.element(relation).handle));
            }
        }
        if produced != size {
            return Err(TileError::malformed("relation table overruns its size"));
        }

        let table = self.model.begin_rel_table(size);
        let handle = self.model.element(table).handle;
        let mut needs_fixup = false;
        let payload = self.model.payload_mut(table);
        let mut writer = RelTableWriter::new(payload, handle);
        for entry in entries {
            match entry {
                Entry::Local(target) => {
                    writer.local(target);
                    needs_fixup = true;
                }
                Entry::Foreign { tex, tip: Some(tip) } => {
                    writer.foreign_in_tile(crate::types::TipDelta(tip), crate::types::TexDelta(tex));
                }
                Entry::Foreign { tex, tip: None } => {
                    writer.foreign(crate::types::TexDelta(tex));
                }
            }
        }
        writer.mark_last();
        let actual = writer.size();
        let hash = writer.hash();
        debug_assert_eq!(actual, size);
        Ok(self.model.complete_rel_table(table, hash, needs_fixup))
    }

    // ----- feature changes -------------------------------------------------

    fn read_feature_changes(&mut self) -> TileResult<()> {
        for i in 0..self.features.len() {
            let (elem, changed) = self.features[i];
            if !changed {
                continue;
            }
            if i < self.group_starts[1] {
                self.read_node_change(elem)?;
            } else if i < self.group_starts[2] {
                self.read_way_change(elem)?;
            } else {
                self.read_relation_change(elem)?;
            }
        }
        Ok(())
    }

    /// Common stub change: flags byte, tags, relation table. Returns the
    /// flags and, when RELATIONS_CHANGED, the new table (None = dropped).
    fn read_feature_change(&mut self, elem: ElemId) -> TileResult<(u8, Option<Option<ElemId>>)> {
        self.model.make_mutable(elem);
        let flags = self.r.byte()?;

        if flags & tes_flags::TAGS_CHANGED != 0 {
            let table = if flags & tes_flags::SHARED_TAGS != 0 {
                let number = self.r.usize()?;
                self.shared_tag_table(number)?
            } else {
                self.read_tag_table()?
            };
            self.model.add_user(table);
            let handle = self.model.element(elem).handle;
            let tags_handle = self.model.element(table).handle;
            let has_locals = self.model.element(table).anchor != 0;
            self.model
                .stub_mut(elem)
                .set_tags(handle, tags_handle, has_locals);
        }

        let mut new_rels = None;
        if flags & tes_flags::RELATIONS_CHANGED != 0 {
            let size_or_ref = self.r.u32()?;
            if size_or_ref == 0 {
                new_rels = Some(None);
                self.model
                    .stub_mut(elem)
                    .set_flag(feature_flags::RELATION_MEMBER, false);
            } else {
                let table = if size_or_ref & 1 != 0 {
                    self.shared_rel_table((size_or_ref >> 1) as usize)?
                } else {
                    self.read_rel_table_contents(size_or_ref)?
                };
                self.model.add_user(table);
                new_rels = Some(Some(table));
                self.model
                    .stub_mut(elem)
                    .set_flag(feature_flags::RELATION_MEMBER, true);
            }
        }
        Ok((flags, new_rels))
    }

    fn read_coordinate(&mut self, prev: Coord) -> TileResult<Coord> {
        let dx = self.r.i64()?;
        let dy = self.r.i64()?;
        Ok(Coord::new(
            (i64::from(prev.x) + dx) as i32,
            (i64::from(prev.y) + dy) as i32,
        ))
    }

    fn read_first_coordinate(&mut self) -> TileResult<Coord> {
        let xy = self.read_coordinate(self.prev_xy)?;
        self.prev_xy = xy;
        Ok(xy)
    }

    fn read_bounds(&mut self) -> TileResult<Bbox> {
        let bottom_left = self.read_first_coordinate()?;
        let w = self.r.u64()?;
        let h = self.r.u64()?;
        Ok(Bbox::new(
            bottom_left.x,
            bottom_left.y,
            (i64::from(bottom_left.x) + w as i64) as i32,
            (i64::from(bottom_left.y) + h as i64) as i32,
        ))
    }

    fn read_node_change(&mut self, node: ElemId) -> TileResult<()> {
        let (flags, new_rels) = self.read_feature_change(node)?;
        if flags & tes_flags::GEOMETRY_CHANGED != 0 {
            let xy = self.read_first_coordinate()?;
            if !self.model.bounds().contains(xy) {
                return Err(TileError::LayoutInvariant(format!(
                    "node/{} moved outside its tile",
                    self.model.stub(node).id()
                )));
            }
            self.model.stub_mut(node).set_node_xy(xy);
        }
        {
            let mut stub = self.model.stub_mut(node);
            stub.set_flag(
                feature_flags::WAYNODE,
                flags & tes_flags::NODE_BELONGS_TO_WAY != 0,
            );
            stub.set_flag(
                feature_flags::SHARED_LOCATION,
                flags & tes_flags::HAS_SHARED_LOCATION != 0,
            );
            stub.set_flag(
                feature_flags::EXCEPTION_NODE,
                flags & tes_flags::IS_EXCEPTION_NODE != 0,
            );
        }
        match new_rels {
            Some(Some(rels)) => {
                let handle = self.model.element(node).handle;
                let rels_handle = self.model.element(rels).handle;
                self.model.stub_mut(node).set_node_rels(handle, rels_handle);
                self.model.element_mut(node).size = 24;
            }
            Some(None) => {
                self.model.element_mut(node).size = 20;
            }
            None => {}
        }
        Ok(())
    }

    #[allow(clippy::too_many_lines)]
    fn read_way_change(&mut self, way: ElemId) -> TileResult<()> {
        let was_member = self.model.stub(way).is_relation_member();
        let (flags, new_rels) = self.read_feature_change(way)?;
        let way_id = self.model.stub(way).id();
        let body = self.model.element(way).feature().body.ok_or_else(|| {
            TileError::unresolved(format!("way/{way_id} has no body element"))
        })?;

        // Pieces of the new body, gathered before assembly
        let mut count_and_first = [0u8; 32];
        let mut count_and_first_size = 0usize;
        enum Coords<'d> {
            Fresh(&'d [u8]),
            FromOldBody { ofs: usize, len: usize },
        }
        let coords;
        let mut node_ids: Option<(usize, usize)> = None; // old-body range
        let mut new_bounds = None;

        let old_anchor = self.model.element(body).anchor as usize;
        let old_size = self.model.element(body).size as usize;
        let body_missing = matches!(self.model.element(body).payload, Payload::None);

        if flags & tes_flags::GEOMETRY_CHANGED != 0 {
            let coord_count = self.r.usize()?;
            if coord_count == 0 {
                return Err(TileError::malformed(format!(
                    "way/{way_id} geometry change with no coordinates"
                )));
            }
            let first = self.read_first_coordinate()?;
            let coords_tail = self.r.tail();
            let mut bounds = Bbox::of_point(first);
            let mut xy = first;
            for _ in 1..coord_count {
                xy = self.read_coordinate(xy)?;
                bounds.expand_to_include(xy);
            }
            let coords_len;
            if flags & tes_flags::NODE_IDS_CHANGED != 0 {
                let ids_tail_len = self.r.remaining();
                self.r.skip_varints(coord_count)?;
                if self.model.waynode_ids() {
                    // Fresh ids travel with the fresh coordinates
                    coords_len = coords_tail.len() - self.r.remaining();
                } else {
                    coords_len = coords_tail.len() - ids_tail_len;
                }
            } else {
                if self.model.waynode_ids() {
                    if body_missing {
                        return Err(TileError::unresolved(format!(
                            "way/{way_id}: partial change but its body is missing"
                        )));
                    }
                    // Geometry changed but ids did not: recover them from
                    // the old body
                    let payload = self.model.payload(body);
                    let mut old = StreamReader::new(&payload[old_anchor..], "tile");
                    let before = old.remaining();
                    let old_count = old.usize()?;
                    if old_count != coord_count {
                        return Err(TileError::malformed(format!(
                            "way/{way_id}: node count changed from {old_count} to \
                             {coord_count} without NODE_IDS_CHANGED"
                        )));
                    }
                    old.skip_varints(coord_count * 2)?;
                    let ids_from = before - old.remaining();
                    old.skip_varints(coord_count)?;
                    let ids_to = before - old.remaining();
                    node_ids = Some((old_anchor + ids_from, ids_to - ids_from));
                }
                coords_len = coords_tail.len() - self.r.remaining();
            }
            // The body stores the first coordinate relative to the bbox
            let mut pos = 0usize;
            put_u64_varint(&mut count_and_first, &mut pos, coord_count as u64);
            put_i64_varint(
                &mut count_and_first,
                &mut pos,
                i64::from(first.x) - i64::from(bounds.min_x),
            );
            put_i64_varint(
                &mut count_and_first,
                &mut pos,
                i64::from(first.y) - i64::from(bounds.min_y),
            );
            count_and_first_size = pos;

            if !bounds.intersects(self.model.bounds()) {
                return Err(TileError::LayoutInvariant(format!(
                    "way/{way_id} bbox no longer touches its tile"
                )));
            }
            new_bounds = Some(bounds);
            coords = Coords::Fresh(&coords_tail[..coords_len]);
        } else {
            if flags & tes_flags::NODE_IDS_CHANGED != 0 {
                return Err(TileError::malformed(
                    "NODE_IDS_CHANGED requires GEOMETRY_CHANGED".to_string(),
                ));
            }
            if body_missing {
                return Err(TileError::unresolved(format!(
                    "way/{way_id}: partial change but its body is missing"
                )));
            }
            coords = Coords::FromOldBody {
                ofs: old_anchor,
                len: old_size - old_anchor,
            };
        }

        // A created or dropped relation-table pointer shifts the body's
        // handle, keeping node-table deltas stable
        let will_be_member = self.model.stub(way).is_relation_member();
        if was_member != will_be_member {
            let delta = if will_be_member { 4 } else { -4 };
            self.model.element_mut(body).handle += delta;
        }
        let body_handle = self.model.element(body).handle;

        let node_table_size;
        let fresh_node_table = flags & tes_flags::MEMBERS_CHANGED != 0;
        if fresh_node_table {
            node_table_size = self.r.usize()?;
            self.model
                .stub_mut(way)
                .set_flag(feature_flags::WAYNODE, node_table_size > 0);
        } else {
            node_table_size = old_anchor - if was_member { 4 } else { 0 };
        }

        let rels_ptr_size = if will_be_member { 4usize } else { 0 };
        let new_anchor = node_table_size + rels_ptr_size;
        let (coords_bytes, ids_bytes) = {
            let payload = self.model.payload(body);
            let coords_bytes: Vec<u8> = match coords {
                Coords::Fresh(bytes) => bytes.to_vec(),
                Coords::FromOldBody { ofs, len } => payload[ofs..ofs + len].to_vec(),
            };
            let ids_bytes: Vec<u8> = match node_ids {
                Some((ofs, len)) => payload[ofs..ofs + len].to_vec(),
                None => Vec::new(),
            };
            (coords_bytes, ids_bytes)
        };
        let old_table: Vec<u8> = if fresh_node_table {
            Vec::new()
        } else {
            let payload = self.model.payload(body);
            payload[..node_table_size].to_vec()
        };
        let old_rels_ptr = if will_be_member && flags & tes_flags::RELATIONS_CHANGED == 0 {
            Some(read_i32(self.model.payload(body), old_anchor - 4)?)
        } else {
            None
        };

        let new_size =
            new_anchor + count_and_first_size + coords_bytes.len() + ids_bytes.len();
        let alloc = self.model.arena_alloc(new_size, 2);

        let mut needs_fixup = self.model.element(body).needs_fixup();
        {
            // Assemble outside the borrow of `buf` where possible
            let table_entries = if fresh_node_table && node_table_size > 0 {
                Some(self.read_way_node_entries(node_table_size)?)
            } else {
                None
            };
            let buf = self.model.arena_bytes_mut(alloc, new_size);
            if let Some(entries) = table_entries {
                let table_handle = body_handle - rels_ptr_size as i32;
                let mut writer = NodeTableWriter::new(
                    &mut buf[..node_table_size],
                    table_handle,
                    node_table_size,
                );
                needs_fixup = false;
                for entry in entries {
                    match entry {
                        WayNodeEntry::Local(handle) => {
                            writer.local(handle);
                            needs_fixup = true;
                        }
                        WayNodeEntry::Foreign { tex, tip: Some(tip) } => writer.foreign_in_tile(
                            crate::types::TipDelta(tip),
                            crate::types::TexDelta(tex),
                        ),
                        WayNodeEntry::Foreign { tex, tip: None } => {
                            writer.foreign(crate::types::TexDelta(tex));
                        }
                    }
                }
                writer.mark_last();
                if writer.size() as usize != node_table_size {
                    return Err(TileError::malformed(format!(
                        "way/{way_id}: node table size mismatch"
                    )));
                }
            } else if fresh_node_table {
                needs_fixup = false;
            } else {
                buf[..node_table_size].copy_from_slice(&old_table);
            }
            let mut pos = new_anchor;
            buf[pos..pos + count_and_first_size]
                .copy_from_slice(&count_and_first[..count_and_first_size]);
            pos += count_and_first_size;
            buf[pos..pos + coords_bytes.len()].copy_from_slice(&coords_bytes);
            pos += coords_bytes.len();
            buf[pos..pos + ids_bytes.len()].copy_from_slice(&ids_bytes);
        }

        if let Some(bounds) = new_bounds {
            crate::compiler::way::set_feature_bounds(self.model, way, &bounds);
        }
        self.set_geometry_flags(way, flags);

        // Wire the relation-table pointer
        if will_be_member {
            let raw = match (new_rels, old_rels_ptr) {
                (Some(Some(rels)), _) => self.model.element(rels).handle - body_handle + 4,
                (_, Some(old)) => old,
                _ => {
                    return Err(TileError::unresolved(format!(
                        "way/{way_id} is a member but has no relation table"
                    )))
                }
            };
            let buf = self.model.arena_bytes_mut(alloc, new_size);
            write_i32(buf, new_anchor - 4, raw);
        }

        let elem = self.model.element_mut(body);
        elem.payload = Payload::Arena(alloc);
        elem.size = new_size as u32;
        elem.anchor = new_anchor as u32;
        elem.set_flag(elem_flags::ORIGINAL, false);
        elem.set_flag(elem_flags::NEEDS_FIXUP, needs_fixup);
        let plain = new_anchor == 0;
        elem.alignment = if plain { Alignment::Byte } else { Alignment::Word };
        Ok(())
    }

    fn read_way_node_entries(&mut self, table_size: usize) -> TileResult<Vec<WayNodeEntry>> {
        let mut entries = Vec::new();
        let mut produced = 0usize;
        while produced < table_size {
            let node = self.r.u32()?;
            if node & 1 != 0 {
                let tex = zigzag_decode(node >> 2);
                if node & 2 != 0 {
                    let tip = self.r.i32()?;
                    produced += entry_width_fwd(tex, 12, Some(tip)) as usize;
                    entries.push(WayNodeEntry::Foreign { tex, tip: Some(tip) });
                } else {
                    produced += entry_width_fwd(tex, 12, None) as usize;
                    entries.push(WayNodeEntry::Foreign { tex, tip: None });
                }
            } else {
                let node_elem = self.indexed_node((node >> 1) as usize)?;
                produced += 4;
                entries.push(WayNodeEntry::Local(self.model.element(node_elem).handle));
            }
        }
        if produced != table_size {
            return Err(TileError::malformed("way node table overruns its size"));
        }
        Ok(entries)
    }

    fn read_relation_change(&mut self, rel: ElemId) -> TileResult<()> {
        let (flags, new_rels) = self.read_feature_change(rel)?;
        let rel_id = self.model.stub(rel).id();
        let body = self.model.element(rel).feature().body.ok_or_else(|| {
            TileError::unresolved(format!("relation/{rel_id} has no body element"))
        })?;

        if flags & tes_flags::BBOX_CHANGED != 0 {
            let bounds = self.read_bounds()?;
            self.model.stub_mut(rel).set_bbox(&bounds);
        }

        let is_member = self.model.stub(rel).is_relation_member();
        let rels_ptr_size = if is_member { 4usize } else { 0 };
        let old_anchor = self.model.element(body).anchor as usize;
        let old_size = self.model.element(body).size as usize;
        if matches!(self.model.element(body).payload, Payload::None)
            && flags & tes_flags::MEMBERS_CHANGED == 0
        {
            return Err(TileError::unresolved(format!(
                "relation/{rel_id}: partial change but its body is missing"
            )));
        }

        let table_size;
        if flags & tes_flags::MEMBERS_CHANGED != 0 {
            table_size = self.r.usize()?;
        } else if flags & tes_flags::RELATIONS_CHANGED != 0 {
            table_size = old_size - old_anchor;
        } else {
            // Only geometry changed; the body stays as it is
            self.set_geometry_flags(rel, flags);
            return Ok(());
        }

        let body_handle = self.model.element(body).handle;
        let new_size = table_size + rels_ptr_size;
        let old_rels_ptr = if is_member && flags & tes_flags::RELATIONS_CHANGED == 0 {
            Some(read_i32(self.model.payload(body), old_anchor - 4)?)
        } else {
            None
        };
        let old_table: Vec<u8> = if flags & tes_flags::MEMBERS_CHANGED == 0 {
            let payload = self.model.payload(body);
            payload[old_anchor..old_size].to_vec()
        } else {
            Vec::new()
        };

        let mut needs_fixup = self.model.element(body).needs_fixup();
        let alloc = self.model.arena_alloc(new_size, 2);

        if flags & tes_flags::MEMBERS_CHANGED != 0 {
            let entries = self.read_member_entries(table_size)?;
            let buf = self.model.arena_bytes_mut(alloc, new_size);
            let mut writer =
                MemberTableWriter::new(&mut buf[rels_ptr_size..], body_handle);
            needs_fixup = false;
            for entry in entries {
                match entry.reference {
                    MemberRef::Local(handle) => {
                        writer.local(handle, entry.role.is_some());
                        needs_fixup = true;
                    }
                    MemberRef::Foreign { tex, tip: Some(tip) } => writer.foreign_in_tile(
                        crate::types::TipDelta(tip),
                        crate::types::TexDelta(tex),
                        entry.role.is_some(),
                    ),
                    MemberRef::Foreign { tex, tip: None } => {
                        writer.foreign(crate::types::TexDelta(tex), entry.role.is_some());
                    }
                }
                match entry.role {
                    Some(MemberRole::Global(code)) => writer.global_role(u32::from(code)),
                    Some(MemberRole::Local(handle)) => {
                        writer.local_role(handle);
                        needs_fixup = true;
                    }
                    None => {}
                }
            }
            writer.mark_last();
            if writer.size() as usize != table_size {
                return Err(TileError::malformed(format!(
                    "relation/{rel_id}: member table size mismatch"
                )));
            }
        } else {
            let buf = self.model.arena_bytes_mut(alloc, new_size);
            buf[rels_ptr_size..].copy_from_slice(&old_table);
        }

        if is_member {
            let raw = match (new_rels, old_rels_ptr) {
                (Some(Some(rels)), _) => self.model.element(rels).handle - body_handle + 4,
                (_, Some(old)) => old,
                _ => {
                    return Err(TileError::unresolved(format!(
                        "relation/{rel_id} is a member but has no relation table"
                    )))
                }
            };
            // The pointer slot sits just ahead of the anchor
            let buf = self.model.arena_bytes_mut(alloc, new_size);
            write_i32(buf, rels_ptr_size - 4, raw);
        }

        self.set_geometry_flags(rel, flags);
        let elem = self.model.element_mut(body);
        elem.payload = Payload::Arena(alloc);
        elem.size = new_size as u32;
        elem.anchor = rels_ptr_size as u32;
        elem.alignment = Alignment::Word;
        elem.set_flag(elem_flags::ORIGINAL, false);
        elem.set_flag(elem_flags::NEEDS_FIXUP, needs_fixup);
        Ok(())
    }

    fn read_member_entries(&mut self, table_size: usize) -> TileResult<Vec<MemberEntry>> {
        let mut entries = Vec::new();
        let mut produced = 0usize;
        while produced < table_size {
            let member = self.r.u32()?;
            let role_changed = member & 2 != 0;
            let reference = if member & 1 != 0 {
                let tex = zigzag_decode(member >> 3);
                if member & 4 != 0 {
                    let tip = self.r.i32()?;
                    produced += entry_width_fwd(tex, 11, Some(tip)) as usize;
                    MemberRef::Foreign { tex, tip: Some(tip) }
                } else {
                    produced += entry_width_fwd(tex, 11, None) as usize;
                    MemberRef::Foreign { tex, tip: None }
                }
            } else {
                let feature = self.indexed_feature((member >> 2) as usize)?;
                produced += 4;
                MemberRef::Local(self.model.element(feature).handle)
            };
            let role = if role_changed {
                let role = self.r.u32()?;
                if role & 1 != 0 {
                    produced += 2;
                    Some(MemberRole::Global((role >> 1) as u16))
                } else {
                    produced += 4;
                    let string = self.shared_string((role >> 1) as usize)?;
                    Some(MemberRole::Local(self.model.element(string).handle))
                }
            } else {
                None
            };
            entries.push(MemberEntry { reference, role });
        }
        if produced != table_size {
            return Err(TileError::malformed("member table overruns its size"));
        }
        Ok(entries)
    }

    /// Sets AREA and the multitile continuation flags of a 2D feature after
    /// its change record.
    fn set_geometry_flags(&mut self, feature: ElemId, flags: u8) {
        let tile_bounds = *self.model.bounds();
        let bbox = self.model.stub(feature).bbox();
        let mut stub = self.model.stub_mut(feature);
        stub.set_flag(feature_flags::AREA, flags & tes_flags::IS_AREA != 0);
        stub.set_flag(
            feature_flags::MULTITILE_WEST,
            bbox.min_x < tile_bounds.min_x,
        );
        stub.set_flag(
            feature_flags::MULTITILE_NORTH,
            bbox.max_y > tile_bounds.max_y,
        );
    }

    fn read_removed_features(&mut self) -> TileResult<()> {
        let mut count = self.r.usize()?;
        let mut group = 0usize;
        let mut prev_id = 0u64;
        while count > 0 {
            let reference = self.r.u64()?;
            if reference == 0 {
                group += 1;
                if group > 2 {
                    return Err(TileError::malformed("too many removal groups in TES"));
                }
                prev_id = 0;
                continue;
            }
            let id = (reference >> 1) + prev_id;
            prev_id = id;
            count -= 1;
            if reference & 1 == 0 {
                continue;
            }
            let feature_type = match group {
                0 => FeatureType::Node,
                1 => FeatureType::Way,
                _ => FeatureType::Relation,
            };
            let typed_id = TypedFeatureId::new(feature_type, id);
            match self.model.get_feature(typed_id) {
                Some(elem) => {
                    self.model
                        .element_mut(elem)
                        .set_flag(elem_flags::DELETED, true);
                }
                None => warn!("TES removes {typed_id}, which is not in this tile"),
            }
        }
        Ok(())
    }

    fn read_exports(&mut self) -> TileResult<()> {
        let tagged_count = self.r.u32()?;
        let count = (tagged_count >> 1) as usize;
        let mut targets = Vec::with_capacity(count);
        for _ in 0..count {
            let number = self.r.usize()?;
            let feature = self.indexed_feature(number)?;
            targets.push(crate::model::element::ExportTarget::Elem(feature));
        }
        if count > 0 {
            self.model.replace_export_table(targets);
        }
        Ok(())
    }
}

enum WayNodeEntry {
    Local(Handle),
    Foreign { tex: i32, tip: Option<i32> },
}

enum MemberRef {
    Local(Handle),
    Foreign { tex: i32, tip: Option<i32> },
}

enum MemberRole {
    Global(u16),
    Local(Handle),
}

struct MemberEntry {
    reference: MemberRef,
    role: Option<MemberRole>,
}

fn zigzag_decode(v: u32) -> i32 {
    ((v >> 1) as i32) ^ -((v & 1) as i32)
}

/// Encoded width of a forward-table foreign entry.
fn entry_width_fwd(tex: i32, narrow_bits: u32, tip: Option<i32>) -> u32 {
    let mut width = 2;
    if crate::types::TexDelta(tex).is_wide(narrow_bits) {
        width += 2;
    }
    if let Some(tip) = tip {
        width += 2;
        if crate::types::TipDelta(tip).is_wide() {
            width += 2;
        }
    }
    width
}

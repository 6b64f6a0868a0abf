//! Serializes a placed tile model into its binary blob and rewrites every
//! intra-tile pointer from handle space to final locations.
//!
//! Fixers read the element's own payload (whose pointers are still in handle
//! space) and write rewritten words into the output buffer, so re-running
//! fixup is idempotent by construction.

use bytes::Bytes;

use crate::error::{TileError, TileResult};
use crate::index::hilbert::Branch;
use crate::index::BuiltIndex;
use crate::layout::{Layout, PlacedItem, HEADER_LOCATION};
use crate::model::element::{elem_flags, Detail, ElemId, ElementKind, ExportTarget};
use crate::model::tables::{
    write_i32, write_u16, MemberTableIter, NodeTableIter, RelTableIter, RoleRef, TableRef,
};
use crate::model::tagtable::{GlobalTagIter, LocalTagIter, RawTagValue};
use crate::model::TileModel;

/// Checks the framing of a finished tile blob: length prefix and CRC-32C
/// trailer.
pub fn validate_blob(blob: &[u8]) -> TileResult<()> {
    if blob.len() < 12 {
        return Err(TileError::malformed("tile blob too short"));
    }
    let prefix = u32::from_le_bytes([blob[0], blob[1], blob[2], blob[3]]);
    let body_size = (blob.len() - 8) as u32;
    if prefix != body_size {
        return Err(TileError::LengthMismatch {
            prefix,
            body: body_size,
        });
    }
    let body = &blob[4..4 + body_size as usize];
    let stored = u32::from_le_bytes([
        blob[blob.len() - 4],
        blob[blob.len() - 3],
        blob[blob.len() - 2],
        blob[blob.len() - 1],
    ]);
    let computed = crc32c::crc32c(body);
    if stored != computed {
        return Err(TileError::ChecksumMismatch { stored, computed });
    }
    Ok(())
}

/// Serializes the placed model. The returned blob is framed as
/// `| u32 body_size | body | u32 crc32c(body) |` and verified before it is
/// handed back.
pub fn write_tile(
    model: &TileModel,
    indexes: &[BuiltIndex; 4],
    layout: &Layout,
) -> TileResult<Bytes> {
    let total = layout.size as usize + 4;
    let mut out = vec![0u8; total];

    for item in &layout.placed {
        match *item {
            PlacedItem::Header => write_header(model, layout, &mut out)?,
            PlacedItem::IndexRoots { kind } => write_index_roots(layout, indexes, kind, &mut out),
            PlacedItem::Trunk { kind, root, trunk } => {
                write_trunk(model, indexes, kind, root, trunk, &mut out);
            }
            PlacedItem::Elem(id) => write_element(model, id, &mut out)?,
        }
    }

    let body_size = layout.size - 4;
    let crc = crc32c::crc32c(&out[4..layout.size as usize]);
    write_i32(&mut out, 0, body_size as i32);
    write_i32(&mut out, layout.size as usize, crc as i32);

    validate_blob(&out)?;
    Ok(Bytes::from(out))
}

fn write_header(model: &TileModel, layout: &Layout, out: &mut [u8]) -> TileResult<()> {
    let base = HEADER_LOCATION as usize;
    write_i32(out, base, 0); // revision
    for (i, &loc) in layout.index_locations.iter().enumerate() {
        let slot = base + 4 + i * 4;
        let ptr = if loc == 0 { 0 } else { loc - slot as i32 };
        write_i32(out, slot, ptr);
    }
    let exports_slot = base + 20;
    let ptr = match model.export_table() {
        Some(exports) => {
            let elem = model.element(exports);
            elem.target() - exports_slot as i32
        }
        None => 0,
    };
    write_i32(out, exports_slot, ptr);
    Ok(())
}

fn write_index_roots(layout: &Layout, indexes: &[BuiltIndex; 4], kind: usize, out: &mut [u8]) {
    let mut pos = layout.index_locations[kind] as usize;
    let roots = &indexes[kind].roots;
    for (i, root) in roots.iter().enumerate() {
        let trunk_loc = root.tree.trunk(root.tree.root).location;
        debug_assert!(trunk_loc > 0);
        let last = i + 1 == roots.len();
        write_i32(out, pos, (trunk_loc - pos as i32) | i32::from(last));
        write_i32(out, pos + 4, root.index_bits as i32);
        pos += 8;
    }
}

fn write_trunk(
    model: &TileModel,
    indexes: &[BuiltIndex; 4],
    kind: usize,
    root: usize,
    trunk: crate::index::hilbert::TrunkId,
    out: &mut [u8],
) {
    let tree = &indexes[kind].roots[root].tree;
    let t = tree.trunk(trunk);
    let mut pos = t.location as usize;
    for (i, &child) in t.children.iter().enumerate() {
        let (child_loc, is_leaf) = match child {
            Branch::Leaf(leaf) => {
                let first = tree.leaf(leaf).features[0];
                (model.element(first).location, true)
            }
            Branch::Trunk(child_trunk) => (tree.trunk(child_trunk).location, false),
        };
        debug_assert!(child_loc > 0);
        let last = i + 1 == t.children.len();
        let word = (child_loc - pos as i32) | i32::from(last) | (i32::from(is_leaf) << 1);
        write_i32(out, pos, word);
        let bounds = tree.branch_bounds(child);
        write_i32(out, pos + 4, bounds.min_x);
        write_i32(out, pos + 8, bounds.min_y);
        write_i32(out, pos + 12, bounds.max_x);
        write_i32(out, pos + 16, bounds.max_y);
        pos += 20;
    }
}

fn write_element(model: &TileModel, id: ElemId, out: &mut [u8]) -> TileResult<()> {
    let elem = model.element(id);
    let loc = elem.location as usize;
    let payload = model.payload(id);
    if !payload.is_empty() {
        out[loc..loc + elem.size as usize].copy_from_slice(payload);
    }

    match elem.kind {
        ElementKind::Node | ElementKind::Feature2D => fix_feature_stub(model, id, out)?,
        ElementKind::WayBody => fix_way_body(model, id, out)?,
        ElementKind::RelationBody => fix_relation_body(model, id, out)?,
        ElementKind::TagTable => {
            if elem.needs_fixup() {
                fix_tag_table(model, id, out)?;
            }
        }
        ElementKind::RelTable => {
            if elem.needs_fixup() {
                fix_rel_table(model, id, out)?;
            }
        }
        ElementKind::String => {}
        ElementKind::Exports => write_exports(model, id, out)?,
    }
    Ok(())
}

fn resolve(model: &TileModel, handle: i32, what: &str) -> TileResult<ElemId> {
    let id = model.by_handle(handle).ok_or_else(|| {
        TileError::unresolved(format!("{what}: no element at handle {handle}"))
    })?;
    if model.element(id).location <= 0 {
        // A stale reference to an element that was never placed, e.g. a
        // feature a change stream deleted without rewriting its referrers
        return Err(TileError::unresolved(format!(
            "{what}: element at handle {handle} was not placed"
        )));
    }
    Ok(id)
}

fn fix_feature_stub(model: &TileModel, id: ElemId, out: &mut [u8]) -> TileResult<()> {
    let elem = model.element(id);
    let stub = model.stub(id);
    let loc = elem.location;
    let anchor = elem.anchor as i32;

    // The last-in-leaf flag lives in bit 0 of the flags word
    let flags_at = (loc + anchor) as usize;
    let flags = (stub.flags() & !1) | u32::from(elem.has_flag(elem_flags::LAST));
    write_i32(out, flags_at, flags as i32);

    let tags = model.expect_tag_table(stub.tags_handle(elem.handle))?;
    let tags_elem = model.element(tags);
    let tags_slot = loc + anchor + 8;
    let has_locals = tags_elem.anchor != 0;
    write_i32(
        out,
        tags_slot as usize,
        (tags_elem.target() - tags_slot) | i32::from(has_locals),
    );

    if elem.kind == ElementKind::Node {
        if let Some(rels) = model.parent_rels(id)? {
            let slot = loc + 20;
            write_i32(out, slot as usize, model.element(rels).location - slot);
        }
    } else {
        let body = elem
            .feature()
            .body
            .ok_or_else(|| TileError::unresolved(format!("{} has no body", stub.typed_id())))?;
        let slot = loc + 28;
        write_i32(out, slot as usize, model.element(body).target() - slot);
    }
    Ok(())
}

/// Rewrites the relation-table pointer just ahead of a body's anchor.
fn fix_body_rels_ptr(model: &TileModel, body: ElemId, out: &mut [u8]) -> TileResult<()> {
    let elem = model.element(body);
    let raw = crate::model::tables::read_i32(model.payload(body), elem.anchor as usize - 4)?;
    let rels = model.expect_rel_table(elem.handle - 4 + raw)?;
    let slot = elem.location + elem.anchor as i32 - 4;
    write_i32(
        out,
        slot as usize,
        model.element(rels).location - slot,
    );
    Ok(())
}

fn fix_way_body(model: &TileModel, id: ElemId, out: &mut [u8]) -> TileResult<()> {
    let elem = model.element(id);
    let Detail::Body { feature } = elem.detail else {
        return Err(TileError::unresolved("way body without a feature".to_string()));
    };
    let stub = model.stub(feature);
    let member = stub.is_relation_member();
    if member {
        fix_body_rels_ptr(model, id, out)?;
    }
    if !elem.needs_fixup() {
        return Ok(());
    }

    let rels_ptr_size = if member { 4 } else { 0 };
    let anchor_idx = elem.anchor as usize - rels_ptr_size;
    let table_handle = elem.handle - rels_ptr_size as i32;
    let data = model.payload(id);
    let mut iter = NodeTableIter::new(data, anchor_idx, table_handle);
    while let Some(entry) = iter.try_next()? {
        if let TableRef::Local(target) = entry.reference {
            let node = resolve(model, target, "way node")?;
            let out_pos = elem.location + entry.ofs as i32;
            let rel_ptr = model.element(node).target() - out_pos;
            write_u16(
                out,
                out_pos as usize,
                ((rel_ptr << 1) | i32::from(entry.last)) as u16,
            );
            write_u16(out, out_pos as usize - 2, (rel_ptr >> 15) as u16);
        }
    }
    Ok(())
}

fn fix_relation_body(model: &TileModel, id: ElemId, out: &mut [u8]) -> TileResult<()> {
    let elem = model.element(id);
    let Detail::Body { feature } = elem.detail else {
        return Err(TileError::unresolved("relation body without a feature"));
    };
    if model.stub(feature).is_relation_member() {
        fix_body_rels_ptr(model, id, out)?;
    }
    if !elem.needs_fixup() {
        return Ok(());
    }

    let data = model.payload(id);
    let mut iter = MemberTableIter::new(data, elem.anchor as usize, elem.handle);
    while let Some(entry) = iter.try_next()? {
        if let TableRef::Local(target) = entry.reference {
            let member = resolve(model, target, "relation member")?;
            let out_pos = elem.location + entry.ofs as i32;
            let rel_ptr = model.element(member).target() - (out_pos & !3);
            write_i32(
                out,
                out_pos as usize,
                (rel_ptr << 1) | i32::from(entry.flags & 7),
            );
        }
        if let Some(RoleRef::Local { target, ofs }) = entry.role {
            let role = model.expect_string(target)?;
            let out_pos = elem.location + ofs as i32;
            let rel_ptr = model.element(role).location - out_pos;
            write_i32(out, out_pos as usize, rel_ptr << 1);
        }
    }
    Ok(())
}

fn fix_tag_table(model: &TileModel, id: ElemId, out: &mut [u8]) -> TileResult<()> {
    let elem = model.element(id);
    let data = model.payload(id);
    let anchor = elem.anchor as usize;
    let target_base = elem.target();
    let new_origin = target_base & !3;

    let mut locals = LocalTagIter::new(data, anchor, elem.handle);
    while let Some(tag) = locals.try_next()? {
        if let RawTagValue::LocalString { target, ofs } = tag.value {
            let value = model.expect_string(target)?;
            let out_pos = elem.location + ofs as i32;
            write_i32(out, out_pos as usize, model.element(value).location - out_pos);
        }
        let key = model.key_string(tag.key_target)?;
        let key_ptr = model.element(key).location - new_origin;
        debug_assert_eq!(key_ptr & 3, 0, "local key must stay 4-byte aligned");
        let out_pos = elem.location + tag.key_ofs as i32;
        write_i32(
            out,
            out_pos as usize,
            (key_ptr << 1) | i32::from(tag.flags & 7),
        );
    }

    let mut globals = GlobalTagIter::new(data, anchor, elem.handle);
    while let Some(tag) = globals.try_next()? {
        if let RawTagValue::LocalString { target, ofs } = tag.value {
            let value = model.expect_string(target)?;
            let out_pos = elem.location + ofs as i32;
            write_i32(out, out_pos as usize, model.element(value).location - out_pos);
        }
    }
    Ok(())
}

fn fix_rel_table(model: &TileModel, id: ElemId, out: &mut [u8]) -> TileResult<()> {
    let elem = model.element(id);
    let data = model.payload(id);
    let mut iter = RelTableIter::new(data, elem.handle);
    while let Some(entry) = iter.try_next()? {
        // Locals precede foreigns; foreign entries carry no local pointers
        if let TableRef::Local(target) = entry.reference {
            let relation = resolve(model, target, "parent relation")?;
            let out_pos = elem.location + entry.ofs as i32;
            let rel_ptr = model.element(relation).target() - out_pos;
            write_i32(
                out,
                out_pos as usize,
                (rel_ptr << 1) | i32::from(entry.last),
            );
        }
    }
    Ok(())
}

fn write_exports(model: &TileModel, id: ElemId, out: &mut [u8]) -> TileResult<()> {
    let elem = model.element(id);
    let Detail::Exports(exports) = &elem.detail else {
        return Err(TileError::unresolved("export element without targets"));
    };
    let loc = elem.location;
    write_i32(out, loc as usize, exports.targets.len() as i32);
    for (i, target) in exports.targets.iter().enumerate() {
        let slot = loc + 4 + i as i32 * 4;
        let feature = match target {
            ExportTarget::Elem(feature) => *feature,
            ExportTarget::TypedId(typed_id) => model.get_feature(*typed_id).ok_or_else(|| {
                TileError::unresolved(format!("exported feature {typed_id} not in tile"))
            })?,
        };
        if model.element(feature).location <= 0 {
            return Err(TileError::unresolved(format!(
                "export entry {i} targets {}, which was not placed",
                model.stub(feature).typed_id()
            )));
        }
        write_i32(
            out,
            slot as usize,
            model.element(feature).target() - slot,
        );
    }
    Ok(())
}

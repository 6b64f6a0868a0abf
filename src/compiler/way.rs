//! Builds a way's stub and body from its proto-GOL record.

use std::collections::HashMap;
use std::hash::BuildHasherDefault;

use twox_hash::XxHash3_64;

use crate::area::AreaClassifier;
use crate::catalog::StringCatalog;
use crate::codec::{put_i64_varint, put_u64_varint, StreamReader};
use crate::compiler::proto::parse_tags;
use crate::compiler::tags::build_tag_table;
use crate::compiler::writers::NodeTableWriter;
use crate::error::{TileError, TileResult};
use crate::geom::{Bbox, Coord};
use crate::model::element::{elem_flags, Alignment, ElemId, Payload};
use crate::model::TileModel;
use crate::types::{
    feature_flags, ForeignFeatureRef, Handle, Tex, TexDelta, Tip, TipDelta, START_TIP,
    WAYNODES_START_TEX,
};

pub(crate) type FxMap<K, V> = HashMap<K, V, BuildHasherDefault<XxHash3_64>>;

/// A node imported from another tile, with its coordinates.
#[derive(Debug, Clone, Copy)]
pub(crate) struct ForeignNode {
    pub reference: ForeignFeatureRef,
    pub xy: Coord,
}

/// A resolved node of a way under construction.
enum WayNode {
    /// Plain coordinate, local or foreign; the common case.
    Coord(Coord),
    Local { handle: Handle, xy: Coord },
    Foreign { reference: ForeignFeatureRef, xy: Coord },
}

impl WayNode {
    fn xy(&self) -> Coord {
        match self {
            WayNode::Coord(xy) | WayNode::Local { xy, .. } | WayNode::Foreign { xy, .. } => *xy,
        }
    }

    fn is_feature(&self) -> bool {
        !matches!(self, WayNode::Coord(_))
    }
}

/// Sets a 2D feature's bounds and the multi-tile continuation flags.
pub(crate) fn set_feature_bounds(model: &mut TileModel, feature: ElemId, bounds: &Bbox) {
    let tile_bounds = *model.bounds();
    let mut stub = model.stub_mut(feature);
    stub.set_bbox(bounds);
    stub.set_flag(
        feature_flags::MULTITILE_WEST,
        bounds.min_x < tile_bounds.min_x,
    );
    stub.set_flag(
        feature_flags::MULTITILE_NORTH,
        bounds.max_y > tile_bounds.max_y,
    );
}

struct NodeTableState {
    prev_tip: Tip,
    prev_tex: Tex,
    any_local: bool,
}

fn write_node_entry(writer: &mut NodeTableWriter<'_>, state: &mut NodeTableState, node: &WayNode) {
    match node {
        WayNode::Coord(_) => {}
        WayNode::Local { handle, .. } => {
            writer.local(*handle);
            state.any_local = true;
        }
        WayNode::Foreign { reference, .. } => {
            let tex_delta = TexDelta::between(reference.tex, state.prev_tex);
            if reference.tip != state.prev_tip {
                if state.prev_tip.is_null() {
                    // The first foreign node always carries DIFFERENT_TILE,
                    // even when its TIP equals the baseline
                    state.prev_tip = START_TIP;
                }
                writer.foreign_in_tile(
                    TipDelta::between(reference.tip, state.prev_tip),
                    tex_delta,
                );
                state.prev_tip = reference.tip;
            } else {
                writer.foreign(tex_delta);
            }
            state.prev_tex = reference.tex;
        }
    }
}

/// Builds the given way from its proto body: resolves its nodes, interns its
/// tags, and encodes the body (node table, coordinate deltas, optional
/// node-id deltas).
#[allow(clippy::too_many_lines)]
pub(crate) fn build_way(
    model: &mut TileModel,
    way: ElemId,
    proto_body: &[u8],
    coords: &FxMap<u64, Coord>,
    foreign_nodes: &FxMap<u64, ForeignNode>,
    strings: &dyn StringCatalog,
    area: &AreaClassifier,
    include_waynode_ids: bool,
) -> TileResult<()> {
    let way_id = model.stub(way).id();
    let mut r = StreamReader::new(proto_body, "proto-GOL");
    let tagged_count = r.u64()?;
    let node_count = (tagged_count >> 1) as usize;
    let closed_ring = tagged_count & 1 != 0;
    if node_count < 2 {
        return Err(TileError::malformed(format!(
            "way/{way_id} has {node_count} nodes"
        )));
    }

    let ids_start = proto_body.len() - r.remaining();
    let mut way_nodes = Vec::with_capacity(node_count);
    let mut bounds = Bbox::default();
    let mut feature_node_count = 0usize;
    let mut node_id = 0i64;
    let mut first_id = 0i64;
    for i in 0..node_count {
        node_id += r.i64()?;
        if i == 0 {
            first_id = node_id;
        }
        let id = node_id as u64;
        let way_node = if let Some(&xy) = coords.get(&id) {
            WayNode::Coord(xy)
        } else if let Some(node) = model.get_node(id) {
            model.stub_mut(node).set_flag(feature_flags::WAYNODE, true);
            feature_node_count += 1;
            WayNode::Local {
                handle: model.element(node).handle,
                xy: model.stub(node).xy(),
            }
        } else if let Some(foreign) = foreign_nodes.get(&id) {
            feature_node_count += 1;
            WayNode::Foreign {
                reference: foreign.reference,
                xy: foreign.xy,
            }
        } else {
            return Err(TileError::unresolved(format!(
                "way/{way_id}: node/{id} is neither local nor imported"
            )));
        };
        bounds.expand_to_include(way_node.xy());
        way_nodes.push(way_node);
    }
    let ids_end = proto_body.len() - r.remaining();
    let last_id = node_id;

    if !bounds.intersects(model.bounds()) {
        return Err(TileError::LayoutInvariant(format!(
            "way/{way_id} does not touch its tile"
        )));
    }
    set_feature_bounds(model, way, &bounds);

    // Tags first: whether a closed ring is an area decides how the
    // coordinates are encoded
    let mut tag_model = parse_tags(&proto_body[ids_end..], strings)?;
    let tags = build_tag_table(
        model,
        &mut tag_model,
        if closed_ring { Some(area) } else { None },
    );
    let is_area = closed_ring && model.element(tags).has_flag(elem_flags::WAY_AREA_TAGS);
    {
        let way_handle = model.element(way).handle;
        let tags_handle = model.element(tags).handle;
        let has_locals = model.element(tags).anchor != 0;
        let mut stub = model.stub_mut(way);
        stub.set_tags(way_handle, tags_handle, has_locals);
        stub.set_flag(feature_flags::AREA, is_area);
        if feature_node_count > 0 {
            stub.set_flag(feature_flags::WAYNODE, true);
        }
    }
    model.add_user(tags);

    let has_memberships = !model.element(way).feature().memberships.is_empty();
    let rels_ptr_size: usize = if has_memberships { 4 } else { 0 };
    let repeat_first = closed_ring && !is_area;

    // Most conservative sizing: every node a foreign feature node with wide
    // deltas, 10 bytes per coordinate pair, one duplicated closing node, and
    // the verbatim node-id section plus one extra closing delta
    let ids_size = ids_end - ids_start;
    let max_ids_size = if include_waynode_ids { ids_size + 8 } else { 0 };
    let max_size = 5
        + (node_count + 1) * 10
        + (feature_node_count + 1) * 8
        + rels_ptr_size
        + max_ids_size;
    let alloc = model.arena_alloc(max_size, 2);
    let body_handle = model.new_handle();
    let body = match model.element(way).feature().body {
        Some(body) => body,
        None => unreachable!("way without a body element"),
    };

    let mut needs_fixup = false;
    let mut node_table_size = 0usize;
    let anchor;
    let actual_size;
    {
        let buf = model.arena_bytes_mut(alloc, max_size);
        if feature_node_count > 0 {
            let table_handle = body_handle - rels_ptr_size as i32;
            let mut writer = NodeTableWriter::new(buf, table_handle, max_size);
            let mut state = NodeTableState {
                prev_tip: Tip(0),
                prev_tex: WAYNODES_START_TEX,
                any_local: false,
            };
            for node in &way_nodes {
                write_node_entry(&mut writer, &mut state, node);
            }
            if closed_ring && way_nodes[0].is_feature() {
                // A closed ring repeats its first feature node, area or not;
                // this differs from the coordinate section below
                write_node_entry(&mut writer, &mut state, &way_nodes[0]);
            }
            writer.mark_last();
            node_table_size = writer.size() as usize;
            needs_fixup = state.any_local;
            let start = writer.start_idx();
            buf.copy_within(start..max_size, 0);
        }

        anchor = node_table_size + rels_ptr_size;
        let mut pos = anchor;
        put_u64_varint(
            buf,
            &mut pos,
            (node_count + usize::from(repeat_first)) as u64,
        );
        let mut prev = bounds.bottom_left();
        for node in &way_nodes {
            let xy = node.xy();
            put_i64_varint(buf, &mut pos, i64::from(xy.x) - i64::from(prev.x));
            put_i64_varint(buf, &mut pos, i64::from(xy.y) - i64::from(prev.y));
            prev = xy;
        }
        if repeat_first {
            let first = way_nodes[0].xy();
            put_i64_varint(buf, &mut pos, i64::from(first.x) - i64::from(prev.x));
            put_i64_varint(buf, &mut pos, i64::from(first.y) - i64::from(prev.y));
        }

        if include_waynode_ids {
            // Node-id deltas are copied verbatim from the proto body
            buf[pos..pos + ids_size].copy_from_slice(&proto_body[ids_start..ids_end]);
            pos += ids_size;
            if repeat_first {
                put_i64_varint(buf, &mut pos, first_id - last_id);
            }
        }
        actual_size = pos;
    }
    model.arena_shrink_last(alloc, max_size - actual_size);

    let elem = model.element_mut(body);
    elem.handle = body_handle;
    elem.payload = Payload::Arena(alloc);
    elem.size = actual_size as u32;
    elem.anchor = anchor as u32;
    elem.alignment = if anchor > 0 {
        Alignment::Word
    } else {
        Alignment::Byte
    };
    elem.set_flag(elem_flags::NEEDS_FIXUP, needs_fixup);
    model.element_mut(way).set_flag(elem_flags::BUILT, true);
    Ok(())
}

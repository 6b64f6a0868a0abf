//! Encoder for Tile Edit Scripts, used by tests and tooling. The change
//! analyzer that produces TES streams in production lives upstream; this
//! writer covers exactly the record shapes the reader consumes.

use crate::codec::StreamWriter;
use crate::geom::{Bbox, Coord};
use crate::tes::tes_flags;
use crate::types::{TexDelta, TipDelta};

/// A tag value in TES terms; strings are indexes into the stream's shared
/// string table.
#[derive(Debug, Clone, Copy)]
pub enum TesValue {
    Narrow(u16),
    GlobalString(u16),
    Wide(u32),
    LocalString(u32),
}

impl TesValue {
    fn flags(self) -> u32 {
        match self {
            Self::Narrow(_) => 0,
            Self::GlobalString(_) => 1,
            Self::Wide(_) => 2,
            Self::LocalString(_) => 3,
        }
    }

    fn raw(self) -> u32 {
        match self {
            Self::Narrow(v) => u32::from(v),
            Self::GlobalString(v) => u32::from(v),
            Self::Wide(v) => v,
            Self::LocalString(v) => v,
        }
    }

    fn width(self) -> u32 {
        2 + (self.flags() & 2)
    }
}

/// A tag table carried in a TES stream. Keys of local tags index the shared
/// string table; global keys are catalog codes in ascending order.
#[derive(Debug, Clone, Default)]
pub struct TesTagTable {
    pub locals: Vec<(u32, TesValue)>,
    pub globals: Vec<(u16, TesValue)>,
}

impl TesTagTable {
    /// Encoded size of the resulting tile tag table.
    fn table_size(&self) -> (u32, u32) {
        let local_size: u32 = self.locals.iter().map(|(_, v)| 4 + v.width()).sum();
        let mut global_size: u32 = self.globals.iter().map(|(_, v)| 2 + v.width()).sum();
        if self.globals.is_empty() {
            global_size = 4; // reserved end marker
        }
        (local_size, global_size)
    }

    fn write(&self, w: &mut StreamWriter) {
        let (local_size, global_size) = self.table_size();
        let size = local_size + global_size;
        w.u32((size & !1) | u32::from(local_size > 0));
        if local_size > 0 {
            w.u32(local_size >> 1);
        }
        for &(key, value) in &self.locals {
            w.u32((key << 2) | value.flags());
            w.u32(value.raw());
        }
        let mut prev_key_shifted = 0u32;
        let globals = if self.globals.is_empty() {
            vec![(0u16, TesValue::Narrow(0))]
        } else {
            self.globals.clone()
        };
        for (code, value) in globals {
            let key_bits = (u32::from(code) << 2) | value.flags();
            w.u32(key_bits - prev_key_shifted);
            prev_key_shifted = key_bits & 0xFFFC;
            w.u32(value.raw());
        }
    }
}

/// A reference in a relation table: a local relation by feature index, or
/// TEX/TIP deltas. Locals must precede foreigns.
#[derive(Debug, Clone, Copy)]
pub enum TesRelRef {
    Local(u32),
    Foreign { tex_delta: i32, tip_delta: Option<i32> },
}

#[derive(Debug, Clone, Default)]
pub struct TesRelTable {
    pub entries: Vec<TesRelRef>,
}

impl TesRelTable {
    fn table_size(&self) -> u32 {
        self.entries
            .iter()
            .map(|entry| match *entry {
                TesRelRef::Local(_) => 4,
                TesRelRef::Foreign {
                    tex_delta,
                    tip_delta,
                } => foreign_width(tex_delta, 12, tip_delta),
            })
            .sum()
    }

    fn write(&self, w: &mut StreamWriter) {
        for entry in &self.entries {
            match *entry {
                TesRelRef::Local(index) => w.u32(index << 1),
                TesRelRef::Foreign {
                    tex_delta,
                    tip_delta: Some(tip),
                } => {
                    w.u32((zigzag_encode(tex_delta) << 1) | 1);
                    w.i32(tip);
                }
                TesRelRef::Foreign {
                    tex_delta,
                    tip_delta: None,
                } => w.u32(zigzag_encode(tex_delta) << 1),
            }
        }
    }
}

#[derive(Debug, Clone)]
pub enum TesTagsChange {
    Shared(u32),
    Inline(TesTagTable),
}

#[derive(Debug, Clone)]
pub enum TesRelsChange {
    /// No longer a member of any relation.
    Drop,
    Shared(u32),
    Inline(TesRelTable),
}

/// One node of a way's rebuilt node table.
#[derive(Debug, Clone, Copy)]
pub enum TesWayNode {
    /// Index into the stream's node group.
    Local(u32),
    Foreign { tex_delta: i32, tip_delta: Option<i32> },
}

#[derive(Debug, Clone, Copy)]
pub enum TesRole {
    Global(u16),
    /// Index into the shared string table.
    Local(u32),
}

#[derive(Debug, Clone, Copy)]
pub enum TesMemberRef {
    /// Index into the full feature index.
    Local(u32),
    Foreign { tex_delta: i32, tip_delta: Option<i32> },
}

#[derive(Debug, Clone)]
pub struct TesMember {
    pub reference: TesMemberRef,
    /// Present when the role differs from the previous member's.
    pub role: Option<TesRole>,
}

#[derive(Debug, Clone, Default)]
pub struct NodeChange {
    pub tags: Option<TesTagsChange>,
    pub rels: Option<TesRelsChange>,
    pub xy: Option<Coord>,
    pub belongs_to_way: bool,
    pub shared_location: bool,
    pub exception: bool,
}

#[derive(Debug, Clone, Default)]
pub struct WayChange {
    pub tags: Option<TesTagsChange>,
    pub rels: Option<TesRelsChange>,
    /// Absolute coordinates of the way's geometry.
    pub geometry: Option<Vec<Coord>>,
    /// Fresh node-id list (requires `geometry`).
    pub node_ids: Option<Vec<u64>>,
    /// Rebuilt feature-node table; empty = way has none anymore.
    pub members: Option<Vec<TesWayNode>>,
    pub is_area: bool,
}

#[derive(Debug, Clone, Default)]
pub struct RelationChange {
    pub tags: Option<TesTagsChange>,
    pub rels: Option<TesRelsChange>,
    pub bbox: Option<Bbox>,
    pub members: Option<Vec<TesMember>>,
    pub is_area: bool,
}

/// The full change record for one tile; [`TesWriter`] turns it into bytes.
#[derive(Debug, Default)]
pub struct TesChangeSet {
    pub nodes: Vec<(u64, Option<NodeChange>)>,
    pub ways: Vec<(u64, Option<WayChange>)>,
    pub relations: Vec<(u64, Option<RelationChange>)>,
    pub strings: Vec<Vec<u8>>,
    pub shared_tags: Vec<TesTagTable>,
    pub shared_rels: Vec<TesRelTable>,
    pub removed_nodes: Vec<u64>,
    pub removed_ways: Vec<u64>,
    pub removed_relations: Vec<u64>,
    /// Feature-index references of the new export table, in TEX order.
    pub exports: Vec<u32>,
}

/// Serializes a [`TesChangeSet`]. The rolling coordinate baseline starts at
/// the tile bounds' bottom-left corner, matching the reader.
pub struct TesWriter {
    w: StreamWriter,
    prev_xy: Coord,
}

impl TesWriter {
    #[must_use]
    pub fn new(tile_bounds: &Bbox) -> Self {
        Self {
            w: StreamWriter::new(),
            prev_xy: tile_bounds.bottom_left(),
        }
    }

    pub fn write(mut self, changes: &TesChangeSet) -> Vec<u8> {
        self.write_feature_index(changes);
        self.w.u64(changes.strings.len() as u64);
        for s in &changes.strings {
            self.w.u64(s.len() as u64);
            self.w.bytes(s);
        }
        self.w.u64(changes.shared_tags.len() as u64);
        for table in &changes.shared_tags {
            table.write(&mut self.w);
        }
        self.w.u64(changes.shared_rels.len() as u64);
        for table in &changes.shared_rels {
            self.w.u32(table.table_size());
            table.write(&mut self.w);
        }
        for (_, change) in &changes.nodes {
            if let Some(change) = change {
                self.write_node_change(change);
            }
        }
        for (_, change) in &changes.ways {
            if let Some(change) = change {
                self.write_way_change(change);
            }
        }
        for (_, change) in &changes.relations {
            if let Some(change) = change {
                self.write_relation_change(change);
            }
        }
        self.write_removed(changes);
        self.w.u32((changes.exports.len() as u32) << 1);
        for &index in &changes.exports {
            self.w.u64(u64::from(index));
        }
        self.w.into_bytes()
    }

    fn write_feature_index(&mut self, changes: &TesChangeSet) {
        let count = changes.nodes.len() + changes.ways.len() + changes.relations.len();
        self.w.u64(count as u64);
        let mut write_group = |w: &mut StreamWriter, ids: &[(u64, bool)]| {
            let mut prev = 0u64;
            for &(id, changed) in ids {
                debug_assert!(id > prev || prev == 0);
                w.u64(((id - prev) << 1) | u64::from(changed));
                prev = id;
            }
        };
        let nodes: Vec<(u64, bool)> = changes
            .nodes
            .iter()
            .map(|(id, c)| (*id, c.is_some()))
            .collect();
        let ways: Vec<(u64, bool)> = changes
            .ways
            .iter()
            .map(|(id, c)| (*id, c.is_some()))
            .collect();
        let relations: Vec<(u64, bool)> = changes
            .relations
            .iter()
            .map(|(id, c)| (*id, c.is_some()))
            .collect();
        write_group(&mut self.w, &nodes);
        if !ways.is_empty() || !relations.is_empty() {
            self.w.u64(0);
            write_group(&mut self.w, &ways);
        }
        if !relations.is_empty() {
            self.w.u64(0);
            write_group(&mut self.w, &relations);
        }
    }

    fn write_common(
        &mut self,
        tags: &Option<TesTagsChange>,
        rels: &Option<TesRelsChange>,
        mut flags: u8,
    ) -> u8 {
        if tags.is_some() {
            flags |= tes_flags::TAGS_CHANGED;
            if matches!(tags, Some(TesTagsChange::Shared(_))) {
                flags |= tes_flags::SHARED_TAGS;
            }
        }
        if rels.is_some() {
            flags |= tes_flags::RELATIONS_CHANGED;
        }
        self.w.byte(flags);
        match tags {
            Some(TesTagsChange::Shared(index)) => self.w.u64(u64::from(*index)),
            Some(TesTagsChange::Inline(table)) => table.write(&mut self.w),
            None => {}
        }
        match rels {
            Some(TesRelsChange::Drop) => self.w.u32(0),
            Some(TesRelsChange::Shared(index)) => self.w.u32((index << 1) | 1),
            Some(TesRelsChange::Inline(table)) => {
                self.w.u32(table.table_size());
                table.write(&mut self.w);
            }
            None => {}
        }
        flags
    }

    fn write_first_coordinate(&mut self, xy: Coord) {
        self.w.i64(i64::from(xy.x) - i64::from(self.prev_xy.x));
        self.w.i64(i64::from(xy.y) - i64::from(self.prev_xy.y));
        self.prev_xy = xy;
    }

    fn write_node_change(&mut self, change: &NodeChange) {
        let mut flags = 0u8;
        if change.xy.is_some() {
            flags |= tes_flags::GEOMETRY_CHANGED;
        }
        if change.belongs_to_way {
            flags |= tes_flags::NODE_BELONGS_TO_WAY;
        }
        if change.shared_location {
            flags |= tes_flags::HAS_SHARED_LOCATION;
        }
        if change.exception {
            flags |= tes_flags::IS_EXCEPTION_NODE;
        }
        self.write_common(&change.tags, &change.rels, flags);
        if let Some(xy) = change.xy {
            self.write_first_coordinate(xy);
        }
    }

    fn write_way_change(&mut self, change: &WayChange) {
        let mut flags = 0u8;
        if change.geometry.is_some() {
            flags |= tes_flags::GEOMETRY_CHANGED;
        }
        if change.node_ids.is_some() {
            flags |= tes_flags::NODE_IDS_CHANGED;
        }
        if change.members.is_some() {
            flags |= tes_flags::MEMBERS_CHANGED;
        }
        if change.is_area {
            flags |= tes_flags::IS_AREA;
        }
        self.write_common(&change.tags, &change.rels, flags);

        if let Some(coords) = &change.geometry {
            debug_assert!(!coords.is_empty());
            self.w.u64(coords.len() as u64);
            self.write_first_coordinate(coords[0]);
            let mut prev = coords[0];
            for &xy in &coords[1..] {
                self.w.i64(i64::from(xy.x) - i64::from(prev.x));
                self.w.i64(i64::from(xy.y) - i64::from(prev.y));
                prev = xy;
            }
            if let Some(node_ids) = &change.node_ids {
                debug_assert_eq!(node_ids.len(), coords.len());
                let mut prev = 0i64;
                for &id in node_ids {
                    self.w.i64(id as i64 - prev);
                    prev = id as i64;
                }
            }
        }

        if let Some(members) = &change.members {
            let size: u32 = members
                .iter()
                .map(|m| match *m {
                    TesWayNode::Local(_) => 4,
                    TesWayNode::Foreign {
                        tex_delta,
                        tip_delta,
                    } => foreign_width(tex_delta, 12, tip_delta),
                })
                .sum();
            self.w.u64(u64::from(size));
            for member in members {
                match *member {
                    TesWayNode::Local(index) => self.w.u32(index << 1),
                    TesWayNode::Foreign {
                        tex_delta,
                        tip_delta: Some(tip),
                    } => {
                        self.w.u32((zigzag_encode(tex_delta) << 2) | 3);
                        self.w.i32(tip);
                    }
                    TesWayNode::Foreign {
                        tex_delta,
                        tip_delta: None,
                    } => self.w.u32((zigzag_encode(tex_delta) << 2) | 1),
                }
            }
        }
    }

    fn write_relation_change(&mut self, change: &RelationChange) {
        let mut flags = 0u8;
        if change.bbox.is_some() {
            flags |= tes_flags::BBOX_CHANGED;
        }
        if change.members.is_some() {
            flags |= tes_flags::MEMBERS_CHANGED;
        }
        if change.is_area {
            flags |= tes_flags::IS_AREA;
        }
        self.write_common(&change.tags, &change.rels, flags);

        if let Some(bbox) = &change.bbox {
            self.write_first_coordinate(bbox.bottom_left());
            self.w.u64((i64::from(bbox.max_x) - i64::from(bbox.min_x)) as u64);
            self.w.u64((i64::from(bbox.max_y) - i64::from(bbox.min_y)) as u64);
        }

        if let Some(members) = &change.members {
            let size: u32 = members
                .iter()
                .map(|m| {
                    let entry = match m.reference {
                        TesMemberRef::Local(_) => 4,
                        TesMemberRef::Foreign {
                            tex_delta,
                            tip_delta,
                        } => foreign_width(tex_delta, 11, tip_delta),
                    };
                    let role = match m.role {
                        Some(TesRole::Global(_)) => 2,
                        Some(TesRole::Local(_)) => 4,
                        None => 0,
                    };
                    entry + role
                })
                .sum();
            self.w.u64(u64::from(size));
            for member in members {
                let role_bit = u32::from(member.role.is_some()) << 1;
                match member.reference {
                    TesMemberRef::Local(index) => self.w.u32((index << 2) | role_bit),
                    TesMemberRef::Foreign {
                        tex_delta,
                        tip_delta: Some(tip),
                    } => {
                        self.w.u32((zigzag_encode(tex_delta) << 3) | 5 | role_bit);
                        self.w.i32(tip);
                    }
                    TesMemberRef::Foreign {
                        tex_delta,
                        tip_delta: None,
                    } => self.w.u32((zigzag_encode(tex_delta) << 3) | 1 | role_bit),
                }
                match member.role {
                    Some(TesRole::Global(code)) => self.w.u32((u32::from(code) << 1) | 1),
                    Some(TesRole::Local(index)) => self.w.u32(index << 1),
                    None => {}
                }
            }
        }
    }

    fn write_removed(&mut self, changes: &TesChangeSet) {
        let count =
            changes.removed_nodes.len() + changes.removed_ways.len() + changes.removed_relations.len();
        self.w.u64(count as u64);
        if count == 0 {
            return;
        }
        let mut write_group = |w: &mut StreamWriter, ids: &[u64]| {
            let mut prev = 0u64;
            for &id in ids {
                w.u64(((id - prev) << 1) | 1);
                prev = id;
            }
        };
        write_group(&mut self.w, &changes.removed_nodes);
        if !changes.removed_ways.is_empty() || !changes.removed_relations.is_empty() {
            self.w.u64(0);
            write_group(&mut self.w, &changes.removed_ways);
        }
        if !changes.removed_relations.is_empty() {
            self.w.u64(0);
            write_group(&mut self.w, &changes.removed_relations);
        }
    }
}

fn zigzag_encode(v: i32) -> u32 {
    ((v << 1) ^ (v >> 31)) as u32
}

fn foreign_width(tex: i32, narrow_bits: u32, tip: Option<i32>) -> u32 {
    let mut width = 2;
    if TexDelta(tex).is_wide(narrow_bits) {
        width += 2;
    }
    if let Some(tip) = tip {
        width += 2;
        if TipDelta(tip).is_wide() {
            width += 2;
        }
    }
    width
}

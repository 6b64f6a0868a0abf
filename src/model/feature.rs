//! Byte-level access to feature stubs.
//!
//! A stub is the fixed-size on-disk record of a feature. Coordinates or the
//! bbox sit ahead of the anchor; the header word, id and outgoing pointers
//! follow it. Pointers hold handle-space deltas until the tile is written,
//! when the writer rewrites them against final locations.

use crate::error::{TileError, TileResult};
use crate::geom::{Bbox, Coord};
use crate::model::tables::{read_i32, write_i32};
use crate::types::{feature_flags, FeatureType, Handle, TypedFeatureId};

/// Stub sizes and anchors.
pub const NODE_STUB_SIZE: u32 = 20;
pub const NODE_MEMBER_STUB_SIZE: u32 = 24;
pub const NODE_ANCHOR: u32 = 8;
pub const FEATURE2D_STUB_SIZE: u32 = 32;
pub const FEATURE2D_ANCHOR: u32 = 16;

/// Read-only view of a stub; `anchor` is the anchor's byte offset.
#[derive(Clone, Copy)]
pub struct Stub<'a> {
    data: &'a [u8],
    anchor: usize,
}

impl<'a> Stub<'a> {
    pub fn new(data: &'a [u8], anchor: u32) -> Self {
        Self {
            data,
            anchor: anchor as usize,
        }
    }

    fn word(&self, ofs: i32) -> i32 {
        let at = (self.anchor as i32 + ofs) as usize;
        i32::from_le_bytes([
            self.data[at],
            self.data[at + 1],
            self.data[at + 2],
            self.data[at + 3],
        ])
    }

    pub fn flags(&self) -> u32 {
        self.word(0) as u32
    }

    pub fn id(&self) -> u64 {
        (u64::from(self.flags() >> 8) << 32) | u64::from(self.word(4) as u32)
    }

    pub fn feature_type(&self) -> FeatureType {
        match (self.flags() & feature_flags::TYPE_MASK) >> feature_flags::TYPE_SHIFT {
            0 => FeatureType::Node,
            1 => FeatureType::Way,
            _ => FeatureType::Relation,
        }
    }

    pub fn typed_id(&self) -> TypedFeatureId {
        TypedFeatureId::new(self.feature_type(), self.id())
    }

    pub fn has_flag(&self, flag: u32) -> bool {
        self.flags() & flag != 0
    }

    pub fn is_node(&self) -> bool {
        self.feature_type() == FeatureType::Node
    }

    pub fn is_area(&self) -> bool {
        self.has_flag(feature_flags::AREA)
    }

    pub fn is_relation_member(&self) -> bool {
        self.has_flag(feature_flags::RELATION_MEMBER)
    }

    pub fn xy(&self) -> Coord {
        debug_assert!(self.is_node());
        Coord::new(self.word(-8), self.word(-4))
    }

    pub fn bbox(&self) -> Bbox {
        debug_assert!(!self.is_node());
        Bbox::new(self.word(-16), self.word(-12), self.word(-8), self.word(-4))
    }

    /// Representative bounds: the point itself for nodes.
    pub fn bounds(&self) -> Bbox {
        if self.is_node() {
            Bbox::of_point(self.xy())
        } else {
            self.bbox()
        }
    }

    /// Handle of the feature's tag table; `handle` is the stub's own handle.
    pub fn tags_handle(&self, handle: Handle) -> Handle {
        let raw = self.word(8);
        handle + 8 + (raw & !1)
    }

    pub fn has_local_tags(&self) -> bool {
        self.word(8) & 1 != 0
    }

    /// Handle of a node's relation table (member nodes only).
    pub fn node_rels_handle(&self, handle: Handle) -> Option<Handle> {
        if !self.is_node() || !self.is_relation_member() {
            return None;
        }
        Some(handle + 12 + self.word(12))
    }
}

/// Mutable view of a stub.
pub struct StubMut<'a> {
    data: &'a mut [u8],
    anchor: usize,
}

impl<'a> StubMut<'a> {
    pub fn new(data: &'a mut [u8], anchor: u32) -> Self {
        Self {
            data,
            anchor: anchor as usize,
        }
    }

    pub fn as_stub(&self) -> Stub<'_> {
        Stub {
            data: self.data,
            anchor: self.anchor,
        }
    }

    fn put_word(&mut self, ofs: i32, v: i32) {
        let at = (self.anchor as i32 + ofs) as usize;
        write_i32(self.data, at, v);
    }

    /// Initializes the header word and id of a zeroed stub.
    pub fn init_header(&mut self, feature_type: FeatureType, id: u64) {
        let flags =
            ((feature_type as u32) << feature_flags::TYPE_SHIFT) | (((id >> 32) as u32) << 8);
        self.put_word(0, flags as i32);
        self.put_word(4, id as u32 as i32);
    }

    pub fn set_flag(&mut self, flag: u32, set: bool) {
        let flags = self.as_stub().flags();
        let flags = if set { flags | flag } else { flags & !flag };
        self.put_word(0, flags as i32);
    }

    pub fn set_node_xy(&mut self, xy: Coord) {
        self.put_word(-8, xy.x);
        self.put_word(-4, xy.y);
    }

    pub fn set_bbox(&mut self, bbox: &Bbox) {
        self.put_word(-16, bbox.min_x);
        self.put_word(-12, bbox.min_y);
        self.put_word(-8, bbox.max_x);
        self.put_word(-4, bbox.max_y);
    }

    /// Points the stub at its tag table, in handle space.
    pub fn set_tags(&mut self, handle: Handle, tags_handle: Handle, has_local_tags: bool) {
        self.put_word(8, (tags_handle - handle - 8) | i32::from(has_local_tags));
    }

    /// Points a member node at its relation table, in handle space.
    pub fn set_node_rels(&mut self, handle: Handle, rels_handle: Handle) {
        self.put_word(12, rels_handle - handle - 12);
        self.set_flag(feature_flags::RELATION_MEMBER, true);
    }
}

/// Resolves the location-space pointer at `slot` of a written tile body,
/// returning the absolute target location (0 when the slot is empty).
pub fn follow_ptr(blob: &[u8], slot: usize) -> TileResult<i32> {
    let rel = read_i32(blob, slot)?;
    if rel == 0 {
        return Ok(0);
    }
    let target = slot as i32 + rel;
    if target <= 0 || target as usize >= blob.len() {
        return Err(TileError::malformed(format!(
            "pointer at {slot} targets {target}, outside the tile"
        )));
    }
    Ok(target)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn node_stub_round_trip() {
        let mut data = vec![0u8; NODE_MEMBER_STUB_SIZE as usize];
        let mut stub = StubMut::new(&mut data, NODE_ANCHOR);
        stub.init_header(FeatureType::Node, 0xAB_1234_5678);
        stub.set_node_xy(Coord::new(-5, 99));
        stub.set_tags(100, 220, true);
        stub.set_node_rels(100, 400);

        let stub = Stub::new(&data, NODE_ANCHOR);
        assert_eq!(stub.id(), 0xAB_1234_5678);
        assert_eq!(stub.feature_type(), FeatureType::Node);
        assert_eq!(stub.xy(), Coord::new(-5, 99));
        assert_eq!(stub.tags_handle(100), 220);
        assert!(stub.has_local_tags());
        assert_eq!(stub.node_rels_handle(100), Some(400));
        assert!(stub.is_relation_member());
    }

    #[test]
    fn way_stub_round_trip() {
        let mut data = vec![0u8; FEATURE2D_STUB_SIZE as usize];
        let mut stub = StubMut::new(&mut data, FEATURE2D_ANCHOR);
        stub.init_header(FeatureType::Way, 42);
        let bbox = Bbox::new(-10, -20, 30, 40);
        stub.set_bbox(&bbox);
        stub.set_flag(feature_flags::AREA, true);

        let stub = Stub::new(&data, FEATURE2D_ANCHOR);
        assert_eq!(stub.typed_id(), TypedFeatureId::new(FeatureType::Way, 42));
        assert_eq!(stub.bbox(), bbox);
        assert!(stub.is_area());
        assert!(!stub.is_relation_member());
    }
}

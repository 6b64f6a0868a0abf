//! Identifiers shared across the tile model and the wire formats.

use std::fmt;

/// Byte offset of an element within one tile, stable for the lifetime of a
/// [`TileModel`](crate::model::TileModel). Elements parsed from an existing
/// tile keep their source offset; new elements receive fresh handles in
/// 4-byte steps past the source size. Signed, because pointer deltas are.
pub type Handle = i32;

/// Kind of an OSM-style feature.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
#[repr(u8)]
pub enum FeatureType {
    Node = 0,
    Way = 1,
    Relation = 2,
}

impl FeatureType {
    pub fn from_code(code: u32) -> Option<Self> {
        match code {
            0 => Some(Self::Node),
            1 => Some(Self::Way),
            2 => Some(Self::Relation),
            _ => None,
        }
    }

    pub fn name(self) -> &'static str {
        match self {
            Self::Node => "node",
            Self::Way => "way",
            Self::Relation => "relation",
        }
    }
}

/// A feature id tagged with its type: `(id << 2) | type_code`.
#[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct TypedFeatureId(u64);

impl TypedFeatureId {
    pub fn new(feature_type: FeatureType, id: u64) -> Self {
        Self((id << 2) | feature_type as u64)
    }

    pub fn from_bits(bits: u64) -> Option<Self> {
        FeatureType::from_code((bits & 3) as u32).map(|_| Self(bits))
    }

    pub fn bits(self) -> u64 {
        self.0
    }

    pub fn id(self) -> u64 {
        self.0 >> 2
    }

    #[allow(clippy::missing_panics_doc)] // low bits are validated on construction
    pub fn feature_type(self) -> FeatureType {
        match self.0 & 3 {
            0 => FeatureType::Node,
            1 => FeatureType::Way,
            _ => FeatureType::Relation,
        }
    }

    pub fn is_node(self) -> bool {
        self.feature_type() == FeatureType::Node
    }
}

impl fmt::Display for TypedFeatureId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.feature_type().name(), self.id())
    }
}

impl fmt::Debug for TypedFeatureId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Display::fmt(self, f)
    }
}

/// Tile index pointer: the compact id of a tile within the store.
/// Opaque to the tile compiler; `0` means "none".
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct Tip(pub u32);

impl Tip {
    pub fn is_null(self) -> bool {
        self.0 == 0
    }
}

impl fmt::Display for Tip {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "tip:{:06X}", self.0)
    }
}

/// Index of a feature in another tile's export table.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct Tex(pub u32);

/// Baseline TIP assumed before the first foreign entry of any table. The
/// first entry always carries DIFFERENT_TILE, so only the delta magnitude
/// matters; a mid-range start keeps it small in either direction.
pub const START_TIP: Tip = Tip(0x4000);

/// Baseline TEX for the feature-node table of a way body.
pub const WAYNODES_START_TEX: Tex = Tex(0);
/// Baseline TEX for a relation's member table.
pub const MEMBERS_START_TEX: Tex = Tex(0);
/// Baseline TEX for a parent-relation table.
pub const RELATIONS_START_TEX: Tex = Tex(0);

/// Signed difference between two TIPs.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TipDelta(pub i32);

impl TipDelta {
    pub fn between(tip: Tip, prev: Tip) -> Self {
        Self(tip.0 as i32 - prev.0 as i32)
    }

    /// Whether the delta needs the wide (two-word) encoding.
    pub fn is_wide(self) -> bool {
        self.0 < -(1 << 14) || self.0 >= (1 << 14)
    }
}

/// Signed difference between two TEXes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TexDelta(pub i32);

impl TexDelta {
    pub fn between(tex: Tex, prev: Tex) -> Self {
        Self(tex.0 as i32 - prev.0 as i32)
    }

    /// Whether the delta overflows a narrow field of `narrow_bits` bits.
    pub fn is_wide(self, narrow_bits: u32) -> bool {
        self.0 < -(1 << (narrow_bits - 1)) || self.0 >= (1 << (narrow_bits - 1))
    }
}

/// A reference to a feature in another tile.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash)]
pub struct ForeignFeatureRef {
    pub tip: Tip,
    pub tex: Tex,
}

impl ForeignFeatureRef {
    pub fn new(tip: Tip, tex: Tex) -> Self {
        Self { tip, tex }
    }

    pub fn is_null(self) -> bool {
        self.tip.is_null()
    }
}

impl fmt::Display for ForeignFeatureRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}#{}", self.tip, self.tex.0)
    }
}

/// Flags stored in the low byte of a feature stub's flags word.
pub mod feature_flags {
    /// Set on the last feature stub of an index leaf.
    pub const LAST_IN_LEAF: u32 = 1;
    pub const AREA: u32 = 1 << 1;
    pub const RELATION_MEMBER: u32 = 1 << 2;
    /// Bits 3-4 hold the feature type code.
    pub const TYPE_SHIFT: u32 = 3;
    pub const TYPE_MASK: u32 = 3 << TYPE_SHIFT;
    pub const WAYNODE: u32 = 1 << 5;
    /// Nodes only: another feature node shares this node's location.
    pub const SHARED_LOCATION: u32 = 1 << 6;
    /// Nodes only: orphan or duplicate node kept with synthesized tags.
    pub const EXCEPTION_NODE: u32 = 1 << 7;
    /// Ways/relations only: geometry continues in the tile to the west.
    pub const MULTITILE_WEST: u32 = 1 << 6;
    /// Ways/relations only: geometry continues in the tile to the north.
    pub const MULTITILE_NORTH: u32 = 1 << 7;
}

/// Entry flags shared by the member-style tables (relation tables, way-node
/// tables, member tables). `DIFFERENT_TILE` sits at bit 2 for node and
/// relation tables and at bit 3 for member tables, which carry the extra
/// `DIFFERENT_ROLE` flag.
pub mod member_flags {
    pub const LAST: u16 = 1;
    pub const FOREIGN: u16 = 1 << 1;
    pub const DIFFERENT_ROLE: u16 = 1 << 2;
}

/// Largest key code that can appear in a global tag.
pub const MAX_GLOBAL_KEY: u32 = 0x1FFF;
/// Largest role code that can be encoded as a global role.
pub const MAX_GLOBAL_ROLE: u32 = 0x7FFF;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn typed_ids_round_trip() {
        let id = TypedFeatureId::new(FeatureType::Way, 123_456_789);
        assert_eq!(id.id(), 123_456_789);
        assert_eq!(id.feature_type(), FeatureType::Way);
        assert_eq!(TypedFeatureId::from_bits(id.bits()), Some(id));
        assert_eq!(format!("{id}"), "way/123456789");
    }

    #[test]
    fn delta_width_thresholds() {
        assert!(!TipDelta(16_383).is_wide());
        assert!(TipDelta(16_384).is_wide());
        assert!(!TipDelta(-16_384).is_wide());
        assert!(TipDelta(-16_385).is_wide());

        assert!(!TexDelta(2047).is_wide(12));
        assert!(TexDelta(2048).is_wide(12));
        assert!(!TexDelta(1023).is_wide(11));
        assert!(TexDelta(1024).is_wide(11));
    }
}

//! Reader and encoder for the proto-GOL per-tile stream, the bundle the
//! upstream sorter produces for each pile.

use crate::catalog::StringCatalog;
use crate::codec::{StreamReader, StreamWriter};
use crate::error::{TileError, TileResult};
use crate::geom::{Bbox, Coord};
use crate::tag::{TagModel, TagValue};
use crate::types::{ForeignFeatureRef, Tex, Tip, TypedFeatureId};

const REC_EXPORTS: u8 = 1;
const REC_FOREIGN_NODE: u8 = 2;
const REC_FOREIGN_FEATURE: u8 = 3;
const REC_NODE: u8 = 4;
const REC_WAY: u8 = 5;
const REC_RELATION: u8 = 6;
const REC_MEMBERSHIP: u8 = 7;
const REC_SPECIAL_NODE: u8 = 8;

/// Special-node marker flags.
pub mod special_node_flags {
    pub const SHARED: u8 = 1;
    pub const ORPHAN: u8 = 2;
}

/// One record of a proto-GOL stream. Body and tag payloads stay borrowed;
/// they are decoded lazily by the build phase.
#[derive(Debug)]
pub enum ProtoRecord<'a> {
    ExportTable(Vec<TypedFeatureId>),
    ForeignNode {
        id: u64,
        xy: Coord,
        /// Null when the exported node is a plain coordinate, not a feature.
        reference: ForeignFeatureRef,
    },
    ForeignFeature {
        typed_id: TypedFeatureId,
        bounds: Option<Bbox>,
        reference: ForeignFeatureRef,
    },
    Node {
        id: u64,
        xy: Coord,
        tags: &'a [u8],
    },
    Way {
        /// Zoom levels between this tile and the way's home tile; a way at a
        /// delta > 0 is a ghost carrying only node ids.
        zoom_delta: u8,
        id: u64,
        body: &'a [u8],
    },
    Relation {
        id: u64,
        body: &'a [u8],
    },
    Membership {
        relation_id: u64,
        zoom_delta: u8,
        member: TypedFeatureId,
    },
    SpecialNode {
        id: u64,
        flags: u8,
    },
}

pub struct ProtoReader<'a> {
    r: StreamReader<'a>,
}

impl<'a> ProtoReader<'a> {
    pub fn new(data: &'a [u8]) -> Self {
        Self {
            r: StreamReader::new(data, "proto-GOL"),
        }
    }

    pub fn next_record(&mut self) -> TileResult<Option<ProtoRecord<'a>>> {
        if self.r.is_empty() {
            return Ok(None);
        }
        let kind = self.r.byte()?;
        let record = match kind {
            REC_EXPORTS => {
                let count = self.r.usize()?;
                let mut typed_id = 0i64;
                let mut exports = Vec::with_capacity(count);
                for _ in 0..count {
                    typed_id += self.r.i64()?;
                    let id = TypedFeatureId::from_bits(typed_id as u64).ok_or_else(|| {
                        TileError::malformed("export table entry with invalid feature type")
                    })?;
                    exports.push(id);
                }
                ProtoRecord::ExportTable(exports)
            }
            REC_FOREIGN_NODE => ProtoRecord::ForeignNode {
                id: self.r.u64()?,
                xy: Coord::new(self.r.i32()?, self.r.i32()?),
                reference: ForeignFeatureRef::new(Tip(self.r.u32()?), Tex(self.r.u32()?)),
            },
            REC_FOREIGN_FEATURE => {
                let type_byte = self.r.byte()?;
                let has_bounds = type_byte & 0x80 != 0;
                let feature_type = crate::types::FeatureType::from_code(u32::from(type_byte & 3))
                    .ok_or_else(|| TileError::malformed("foreign feature with invalid type"))?;
                let id = self.r.u64()?;
                let bounds = if has_bounds {
                    Some(Bbox::new(
                        self.r.i32()?,
                        self.r.i32()?,
                        self.r.i32()?,
                        self.r.i32()?,
                    ))
                } else {
                    None
                };
                ProtoRecord::ForeignFeature {
                    typed_id: TypedFeatureId::new(feature_type, id),
                    bounds,
                    reference: ForeignFeatureRef::new(Tip(self.r.u32()?), Tex(self.r.u32()?)),
                }
            }
            REC_NODE => {
                let id = self.r.u64()?;
                let xy = Coord::new(self.r.i32()?, self.r.i32()?);
                let len = self.r.usize()?;
                ProtoRecord::Node {
                    id,
                    xy,
                    tags: self.r.take(len)?,
                }
            }
            REC_WAY => {
                let zoom_delta = self.r.byte()?;
                let id = self.r.u64()?;
                let len = self.r.usize()?;
                ProtoRecord::Way {
                    zoom_delta,
                    id,
                    body: self.r.take(len)?,
                }
            }
            REC_RELATION => {
                let id = self.r.u64()?;
                let len = self.r.usize()?;
                ProtoRecord::Relation {
                    id,
                    body: self.r.take(len)?,
                }
            }
            REC_MEMBERSHIP => ProtoRecord::Membership {
                relation_id: self.r.u64()?,
                zoom_delta: self.r.byte()?,
                member: TypedFeatureId::from_bits(self.r.u64()?)
                    .ok_or_else(|| TileError::malformed("membership with invalid member type"))?,
            },
            REC_SPECIAL_NODE => ProtoRecord::SpecialNode {
                id: self.r.u64()?,
                flags: self.r.byte()?,
            },
            other => {
                return Err(TileError::malformed(format!(
                    "unknown proto-GOL record kind {other}"
                )))
            }
        };
        Ok(Some(record))
    }
}

/// A key or value string within a proto payload: either a global code or a
/// string carried inline.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProtoStr<'a> {
    Global(u16),
    Local(&'a str),
}

pub(crate) fn read_proto_str<'a>(r: &mut StreamReader<'a>) -> TileResult<ProtoStr<'a>> {
    let v = r.u64()?;
    if v & 1 != 0 {
        let len = (v >> 1) as usize;
        let bytes = r.take(len)?;
        let s = std::str::from_utf8(bytes)
            .map_err(|_| TileError::malformed("invalid UTF-8 in proto string"))?;
        Ok(ProtoStr::Local(s))
    } else {
        Ok(ProtoStr::Global((v >> 1) as u16))
    }
}

/// Decodes a tag payload into a staged [`TagModel`]. String values that look
/// numeric are reclassified into the numeric encodings.
pub fn parse_tags(data: &[u8], strings: &dyn StringCatalog) -> TileResult<TagModel> {
    let mut r = StreamReader::new(data, "proto-GOL");
    let mut model = TagModel::new();
    while !r.is_empty() {
        let key = read_proto_str(&mut r)?;
        let value = read_proto_str(&mut r)?;
        let value = match value {
            ProtoStr::Global(code) => TagValue::GlobalString(code),
            ProtoStr::Local(s) => TagValue::classify(s),
        };
        match key {
            ProtoStr::Global(code) => model.add_global(code, value),
            ProtoStr::Local(s) => {
                // The sorter only localizes keys missing from the catalog,
                // but a stale catalog is not an error; re-check
                match strings.global_code(s) {
                    Some(code) => model.add_global(code, value),
                    None => model.add_local(s, value),
                }
            }
        }
    }
    Ok(model)
}

/// A member role: global code or inline string.
pub(crate) fn read_role<'a>(r: &mut StreamReader<'a>) -> TileResult<ProtoStr<'a>> {
    let v = r.u64()?;
    if v & 1 != 0 {
        Ok(ProtoStr::Global((v >> 1) as u16))
    } else {
        let len = (v >> 1) as usize;
        let bytes = r.take(len)?;
        let s = std::str::from_utf8(bytes)
            .map_err(|_| TileError::malformed("invalid UTF-8 in member role"))?;
        Ok(ProtoStr::Local(s))
    }
}

// ---------------------------------------------------------------------------
// Encoder (used by the upstream sorter and by tests)

/// Encodes proto-GOL records. Records must be added in the order the
/// compiler expects: exports, foreign features and local features,
/// memberships, special nodes.
#[derive(Default)]
pub struct ProtoWriter<'a> {
    w: StreamWriter,
    strings: Option<&'a dyn StringCatalog>,
}

impl<'a> ProtoWriter<'a> {
    pub fn new(strings: &'a dyn StringCatalog) -> Self {
        Self {
            w: StreamWriter::new(),
            strings: Some(strings),
        }
    }

    pub fn into_bytes(self) -> Vec<u8> {
        self.w.into_bytes()
    }

    pub fn export_table(&mut self, exports: &[TypedFeatureId]) {
        self.w.byte(REC_EXPORTS);
        self.w.u64(exports.len() as u64);
        let mut prev = 0i64;
        for id in exports {
            self.w.i64(id.bits() as i64 - prev);
            prev = id.bits() as i64;
        }
    }

    pub fn foreign_node(&mut self, id: u64, xy: Coord, reference: ForeignFeatureRef) {
        self.w.byte(REC_FOREIGN_NODE);
        self.w.u64(id);
        self.w.i32(xy.x);
        self.w.i32(xy.y);
        self.w.u32(reference.tip.0);
        self.w.u32(reference.tex.0);
    }

    /// Exported coordinate that is not a feature in its home tile.
    pub fn foreign_coord(&mut self, id: u64, xy: Coord) {
        self.foreign_node(id, xy, ForeignFeatureRef::default());
    }

    pub fn foreign_feature(
        &mut self,
        typed_id: TypedFeatureId,
        bounds: Option<&Bbox>,
        reference: ForeignFeatureRef,
    ) {
        self.w.byte(REC_FOREIGN_FEATURE);
        let type_byte = typed_id.feature_type() as u8 | if bounds.is_some() { 0x80 } else { 0 };
        self.w.byte(type_byte);
        self.w.u64(typed_id.id());
        if let Some(b) = bounds {
            self.w.i32(b.min_x);
            self.w.i32(b.min_y);
            self.w.i32(b.max_x);
            self.w.i32(b.max_y);
        }
        self.w.u32(reference.tip.0);
        self.w.u32(reference.tex.0);
    }

    pub fn node(&mut self, id: u64, xy: Coord, tags: &[(&str, &str)]) {
        self.w.byte(REC_NODE);
        self.w.u64(id);
        self.w.i32(xy.x);
        self.w.i32(xy.y);
        let tag_bytes = self.encode_tags(tags);
        self.w.u64(tag_bytes.len() as u64);
        self.w.bytes(&tag_bytes);
    }

    pub fn way(&mut self, id: u64, node_ids: &[u64], closed_ring: bool, tags: &[(&str, &str)]) {
        self.way_at_delta(0, id, node_ids, closed_ring, tags);
    }

    /// Ghost way from a lower-zoom parent tile; only marks waynodes.
    pub fn ghost_way(&mut self, zoom_delta: u8, id: u64, node_ids: &[u64]) {
        debug_assert!(zoom_delta > 0);
        self.way_at_delta(zoom_delta, id, node_ids, false, &[]);
    }

    fn way_at_delta(
        &mut self,
        zoom_delta: u8,
        id: u64,
        node_ids: &[u64],
        closed_ring: bool,
        tags: &[(&str, &str)],
    ) {
        self.w.byte(REC_WAY);
        self.w.byte(zoom_delta);
        self.w.u64(id);
        let mut body = StreamWriter::new();
        body.u64((node_ids.len() as u64) << 1 | u64::from(closed_ring));
        let mut prev = 0i64;
        for &node_id in node_ids {
            body.i64(node_id as i64 - prev);
            prev = node_id as i64;
        }
        let tag_bytes = self.encode_tags(tags);
        let body = body.into_bytes();
        self.w.u64((body.len() + tag_bytes.len()) as u64);
        self.w.bytes(&body);
        self.w.bytes(&tag_bytes);
    }

    pub fn relation(
        &mut self,
        id: u64,
        members: &[(TypedFeatureId, &str)],
        tags: &[(&str, &str)],
    ) {
        self.w.byte(REC_RELATION);
        self.w.u64(id);
        let mut body = StreamWriter::new();
        body.u64(members.len() as u64);
        for &(member, role) in members {
            body.u64(member.bits());
            match self.strings.and_then(|s| s.global_code(role)) {
                Some(code) => body.u64((u64::from(code) << 1) | 1),
                None => {
                    body.u64((role.len() as u64) << 1);
                    body.bytes(role.as_bytes());
                }
            }
        }
        let tag_bytes = self.encode_tags(tags);
        let body = body.into_bytes();
        self.w.u64((body.len() + tag_bytes.len()) as u64);
        self.w.bytes(&body);
        self.w.bytes(&tag_bytes);
    }

    pub fn membership(&mut self, relation_id: u64, zoom_delta: u8, member: TypedFeatureId) {
        self.w.byte(REC_MEMBERSHIP);
        self.w.u64(relation_id);
        self.w.byte(zoom_delta);
        self.w.u64(member.bits());
    }

    pub fn special_node(&mut self, id: u64, flags: u8) {
        self.w.byte(REC_SPECIAL_NODE);
        self.w.u64(id);
        self.w.byte(flags);
    }

    fn encode_tags(&self, tags: &[(&str, &str)]) -> Vec<u8> {
        let mut w = StreamWriter::new();
        for &(key, value) in tags {
            self.encode_str(&mut w, key);
            self.encode_str(&mut w, value);
        }
        w.into_bytes()
    }

    fn encode_str(&self, w: &mut StreamWriter, s: &str) {
        match self.strings.and_then(|c| c.global_code(s)) {
            Some(code) => w.u64(u64::from(code) << 1),
            None => {
                w.u64(((s.len() as u64) << 1) | 1);
                w.bytes(s.as_bytes());
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::catalog::MemoryStringCatalog;
    use crate::types::FeatureType;

    #[test]
    fn records_round_trip() {
        let strings = MemoryStringCatalog::new(["highway", "footway"]);
        let mut writer = ProtoWriter::new(&strings);
        writer.export_table(&[
            TypedFeatureId::new(FeatureType::Node, 10),
            TypedFeatureId::new(FeatureType::Way, 2),
        ]);
        writer.node(1, Coord::new(1000, 2000), &[("highway", "footway")]);
        writer.way(2, &[10, 11, 12, 10], true, &[("highway", "footway")]);
        writer.membership(3, 1, TypedFeatureId::new(FeatureType::Way, 2));
        writer.special_node(10, special_node_flags::SHARED);
        let bytes = writer.into_bytes();

        let mut reader = ProtoReader::new(&bytes);
        let Some(ProtoRecord::ExportTable(exports)) = reader.next_record().unwrap() else {
            panic!("expected export table");
        };
        assert_eq!(exports.len(), 2);
        assert_eq!(exports[1], TypedFeatureId::new(FeatureType::Way, 2));

        let Some(ProtoRecord::Node { id, xy, tags }) = reader.next_record().unwrap() else {
            panic!("expected node");
        };
        assert_eq!((id, xy), (1, Coord::new(1000, 2000)));
        let model = parse_tags(tags, &strings).unwrap();
        assert_eq!(model.globals().len(), 1);

        let Some(ProtoRecord::Way { zoom_delta, id, body }) = reader.next_record().unwrap() else {
            panic!("expected way");
        };
        assert_eq!((zoom_delta, id), (0, 2));
        assert!(!body.is_empty());

        let Some(ProtoRecord::Membership {
            relation_id,
            zoom_delta,
            member,
        }) = reader.next_record().unwrap()
        else {
            panic!("expected membership");
        };
        assert_eq!(relation_id, 3);
        assert_eq!(zoom_delta, 1);
        assert_eq!(member, TypedFeatureId::new(FeatureType::Way, 2));

        let Some(ProtoRecord::SpecialNode { id, flags }) = reader.next_record().unwrap() else {
            panic!("expected special node");
        };
        assert_eq!((id, flags), (10, special_node_flags::SHARED));
        assert!(reader.next_record().unwrap().is_none());
    }

    #[test]
    fn local_tags_survive() {
        let strings = MemoryStringCatalog::new(["name"]);
        let mut writer = ProtoWriter::new(&strings);
        writer.node(5, Coord::new(0, 0), &[("name:unseen", "Piazza")]);
        let bytes = writer.into_bytes();
        let mut reader = ProtoReader::new(&bytes);
        let Some(ProtoRecord::Node { tags, .. }) = reader.next_record().unwrap() else {
            panic!("expected node");
        };
        let model = parse_tags(tags, &strings).unwrap();
        assert_eq!(model.locals().len(), 1);
    }
}

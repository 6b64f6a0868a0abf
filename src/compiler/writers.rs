//! Handle-space encoders for the pointer-bearing tables.
//!
//! Writers place local references as deltas against element handles; the
//! fixup pass rewrites them to final locations after placement. Offsets are
//! tracked in handle space throughout (`buf[0]` sits at handle-space offset
//! `base`), which keeps the arithmetic identical to what the fixup pass and
//! the iterators use. Local keys can legitimately produce negative offsets,
//! since they sit ahead of the anchor.

use crate::model::tagtable::{RelTableHasher, TagHasher};
use crate::model::tables::{read_u16, write_i32, write_u16};
use crate::types::{member_flags, Handle, TexDelta, TipDelta, MAX_GLOBAL_KEY, MAX_GLOBAL_ROLE};

/// A string reference: handle plus content hash, as the writers need both.
#[derive(Debug, Clone, Copy)]
pub struct StrRef {
    pub handle: Handle,
    pub hash: u32,
}

/// Writes a two-part tag table: local tags below the anchor, globals above.
pub struct TagTableWriter<'a> {
    buf: &'a mut [u8],
    /// Handle-space offset of `buf[0]`.
    base: i32,
    ofs: i32,
    prev_key_ofs: i32,
    table_ofs: i32,
    origin_ofs: i32,
    hasher: TagHasher,
}

impl<'a> TagTableWriter<'a> {
    pub fn new(buf: &'a mut [u8], handle: Handle, anchor: u32) -> Self {
        Self {
            buf,
            base: handle - anchor as i32,
            ofs: handle,
            prev_key_ofs: handle,
            table_ofs: handle,
            origin_ofs: handle & !3,
            hasher: TagHasher::new(),
        }
    }

    pub fn hash(&self) -> u32 {
        self.hasher.hash()
    }

    /// Current handle-space offset.
    pub fn ofs(&self) -> i32 {
        self.ofs
    }

    fn idx(&self, ofs: i32) -> usize {
        (ofs - self.base) as usize
    }

    fn write_local_key(&mut self, value_flags: u32, key: StrRef) {
        debug_assert!(value_flags & 3 == value_flags);
        self.ofs -= 4;
        self.prev_key_ofs = self.ofs;
        // Strings used as local keys are forced to 4-byte alignment; an
        // existing string may carry an unaligned handle, so mask it
        let key_handle = key.handle & !3;
        let word = ((key_handle - self.origin_ofs) << 1) | value_flags as i32;
        write_i32(self.buf, self.idx(self.ofs), word);
        self.hasher.add_string_hash(key.hash);
    }

    pub fn local_tag_value(&mut self, value_flags: u32, key: StrRef, value: u32) {
        self.write_local_key(value_flags, key);
        if value_flags & 2 != 0 {
            self.ofs -= 4;
            write_i32(self.buf, self.idx(self.ofs), value as i32);
        } else {
            self.ofs -= 2;
            write_u16(self.buf, self.idx(self.ofs), value as u16);
        }
        self.hasher.add_value(value);
    }

    pub fn local_tag_string(&mut self, key: StrRef, value: StrRef) {
        self.write_local_key(3, key);
        self.ofs -= 4;
        write_i32(self.buf, self.idx(self.ofs), value.handle - self.ofs);
        self.hasher.add_string_hash(value.hash);
    }

    /// Marks the last local key and repositions at the anchor for globals.
    pub fn end_local_tags(&mut self) {
        if self.prev_key_ofs < self.table_ofs {
            let idx = self.idx(self.prev_key_ofs);
            let word = read_u16(self.buf, idx).unwrap_or(0);
            write_u16(self.buf, idx, word | 4);
            self.ofs = self.table_ofs;
        }
    }

    fn write_global_key(&mut self, value_flags: u32, code: u32) {
        debug_assert!(code <= MAX_GLOBAL_KEY);
        self.prev_key_ofs = self.ofs;
        write_u16(
            self.buf,
            self.idx(self.ofs),
            ((code << 2) | value_flags) as u16,
        );
        self.ofs += 2;
        self.hasher.add_code(code);
    }

    pub fn global_tag_value(&mut self, value_flags: u32, code: u32, value: u32) {
        self.write_global_key(value_flags, code);
        if value_flags & 2 != 0 {
            write_i32(self.buf, self.idx(self.ofs), value as i32);
            self.ofs += 4;
        } else {
            write_u16(self.buf, self.idx(self.ofs), value as u16);
            self.ofs += 2;
        }
        self.hasher.add_value(value);
    }

    pub fn global_tag_string(&mut self, code: u32, value: StrRef) {
        self.write_global_key(3, code);
        write_i32(self.buf, self.idx(self.ofs), value.handle - self.ofs);
        self.ofs += 4;
        self.hasher.add_string_hash(value.hash);
    }

    /// Marks the last global key. At least one global tag (possibly the
    /// reserved end marker) must have been written.
    pub fn end_global_tags(&mut self) {
        debug_assert!(self.prev_key_ofs >= self.table_ofs);
        let idx = self.idx(self.prev_key_ofs);
        let word = read_u16(self.buf, idx).unwrap_or(0);
        write_u16(self.buf, idx, word | 0x8000);
    }
}

/// Writes a parent-relation table (forward; 12-bit narrow TEX deltas).
pub struct RelTableWriter<'a> {
    buf: &'a mut [u8],
    base: i32,
    ofs: i32,
    last_entry_ofs: i32,
    hasher: RelTableHasher,
}

impl<'a> RelTableWriter<'a> {
    pub fn new(buf: &'a mut [u8], handle: Handle) -> Self {
        Self {
            buf,
            base: handle,
            ofs: handle,
            last_entry_ofs: handle,
            hasher: RelTableHasher::new(),
        }
    }

    pub fn hash(&self) -> u32 {
        self.hasher.hash()
    }

    /// Bytes written so far.
    pub fn size(&self) -> u32 {
        (self.ofs - self.base) as u32
    }

    fn idx(&self, ofs: i32) -> usize {
        (ofs - self.base) as usize
    }

    pub fn local(&mut self, relation_handle: Handle) {
        self.hasher.add_local(relation_handle);
        self.last_entry_ofs = self.ofs;
        let ptr = relation_handle - self.ofs;
        write_i32(self.buf, self.idx(self.ofs), ptr << 1);
        self.ofs += 4;
    }

    pub fn foreign(&mut self, tex: TexDelta) {
        self.hasher.add_tex_delta(tex.0);
        self.last_entry_ofs = self.ofs;
        self.ofs = write_foreign_fwd(self.buf, self.base, self.ofs, tex, 12, 0);
    }

    pub fn foreign_in_tile(&mut self, tip: TipDelta, tex: TexDelta) {
        self.hasher.add_tip_delta(tip.0);
        self.hasher.add_tex_delta(tex.0);
        self.last_entry_ofs = self.ofs;
        self.ofs = write_foreign_fwd(self.buf, self.base, self.ofs, tex, 12, 1 << 2);
        self.ofs = write_tip_fwd(self.buf, self.base, self.ofs, tip);
    }

    pub fn mark_last(&mut self) {
        mark_last_at(self.buf, self.idx(self.last_entry_ofs));
    }
}

/// Writes a relation member table (forward; 11-bit narrow TEX deltas,
/// role-change handling).
pub struct MemberTableWriter<'a> {
    buf: &'a mut [u8],
    base: i32,
    ofs: i32,
    last_entry_ofs: i32,
}

impl<'a> MemberTableWriter<'a> {
    pub fn new(buf: &'a mut [u8], handle: Handle) -> Self {
        Self {
            buf,
            base: handle,
            ofs: handle,
            last_entry_ofs: handle,
        }
    }

    pub fn size(&self) -> u32 {
        (self.ofs - self.base) as u32
    }

    fn idx(&self, ofs: i32) -> usize {
        (ofs - self.base) as usize
    }

    pub fn local(&mut self, member_handle: Handle, role_change: bool) {
        self.last_entry_ofs = self.ofs;
        // Member stubs are 4-byte aligned but entries only 2-byte aligned,
        // so local pointers are rebased on the rounded-down entry offset
        let ptr = member_handle - (self.ofs & !3);
        let flags = i32::from(role_change) << 2;
        write_i32(self.buf, self.idx(self.ofs), (ptr << 1) | flags);
        self.ofs += 4;
    }

    pub fn foreign(&mut self, tex: TexDelta, role_change: bool) {
        self.last_entry_ofs = self.ofs;
        let flags = u16::from(role_change) << 2;
        self.ofs = write_foreign_fwd(self.buf, self.base, self.ofs, tex, 11, flags);
    }

    pub fn foreign_in_tile(&mut self, tip: TipDelta, tex: TexDelta, role_change: bool) {
        self.last_entry_ofs = self.ofs;
        let flags = (u16::from(role_change) << 2) | (1 << 3);
        self.ofs = write_foreign_fwd(self.buf, self.base, self.ofs, tex, 11, flags);
        self.ofs = write_tip_fwd(self.buf, self.base, self.ofs, tip);
    }

    pub fn global_role(&mut self, code: u32) {
        debug_assert!(code <= MAX_GLOBAL_ROLE);
        write_u16(self.buf, self.idx(self.ofs), ((code << 1) | 1) as u16);
        self.ofs += 2;
    }

    pub fn local_role(&mut self, string_handle: Handle) {
        let word = (string_handle - self.ofs) << 1;
        write_i32(self.buf, self.idx(self.ofs), word);
        self.ofs += 4;
    }

    pub fn mark_last(&mut self) {
        mark_last_at(self.buf, self.idx(self.last_entry_ofs));
    }
}

/// Writes a way's feature-node table, which grows downward from the anchor.
pub struct NodeTableWriter<'a> {
    buf: &'a mut [u8],
    base: i32,
    ofs: i32,
    anchor_ofs: i32,
    last_entry_ofs: i32,
}

impl<'a> NodeTableWriter<'a> {
    /// `handle` and `anchor_idx` both denote the table's anchor boundary:
    /// `buf[anchor_idx]` sits at handle-space offset `handle`.
    pub fn new(buf: &'a mut [u8], handle: Handle, anchor_idx: usize) -> Self {
        Self {
            buf,
            base: handle - anchor_idx as i32,
            ofs: handle,
            anchor_ofs: handle,
            last_entry_ofs: handle,
        }
    }

    /// Bytes occupied by the table so far.
    pub fn size(&self) -> u32 {
        (self.anchor_ofs - self.ofs) as u32
    }

    fn idx(&self, ofs: i32) -> usize {
        (ofs - self.base) as usize
    }

    /// Lowest buffer index written (the table's start).
    pub fn start_idx(&self) -> usize {
        self.idx(self.ofs)
    }

    pub fn local(&mut self, node_handle: Handle) {
        self.ofs -= 2;
        self.last_entry_ofs = self.ofs;
        let ptr = node_handle - self.ofs;
        write_u16(self.buf, self.idx(self.ofs), (ptr << 1) as u16);
        self.ofs -= 2;
        write_u16(self.buf, self.idx(self.ofs), (ptr >> 15) as u16);
    }

    pub fn foreign(&mut self, tex: TexDelta) {
        self.ofs -= 2;
        self.last_entry_ofs = self.ofs;
        self.write_tex_down(tex, 0);
    }

    pub fn foreign_in_tile(&mut self, tip: TipDelta, tex: TexDelta) {
        self.ofs -= 2;
        self.last_entry_ofs = self.ofs;
        self.write_tex_down(tex, 1 << 2);
        self.ofs -= 2;
        let wide = tip.is_wide();
        write_u16(
            self.buf,
            self.idx(self.ofs),
            ((tip.0 << 1) | i32::from(wide)) as u16,
        );
        if wide {
            self.ofs -= 2;
            write_u16(self.buf, self.idx(self.ofs), (tip.0 >> 15) as u16);
        }
    }

    fn write_tex_down(&mut self, tex: TexDelta, flags: u16) {
        let wide = tex.is_wide(12);
        let word =
            ((tex.0 << 4) as u16) | member_flags::FOREIGN | flags | (u16::from(wide) << 3);
        write_u16(self.buf, self.idx(self.ofs), word);
        if wide {
            self.ofs -= 2;
            write_u16(self.buf, self.idx(self.ofs), (tex.0 >> 12) as u16);
        }
    }

    pub fn mark_last(&mut self) {
        mark_last_at(self.buf, self.idx(self.last_entry_ofs));
    }
}

fn mark_last_at(buf: &mut [u8], idx: usize) {
    let word = read_u16(buf, idx).unwrap_or(0);
    write_u16(buf, idx, word | member_flags::LAST);
}

fn write_foreign_fwd(
    buf: &mut [u8],
    base: i32,
    ofs: i32,
    tex: TexDelta,
    narrow_bits: u32,
    flags: u16,
) -> i32 {
    let mut ofs = ofs;
    let wide = tex.is_wide(narrow_bits);
    let shift = 16 - narrow_bits;
    let wide_flag = u16::from(wide) << (15 - narrow_bits);
    let word = ((tex.0 << shift) as u16) | member_flags::FOREIGN | flags | wide_flag;
    write_u16(buf, (ofs - base) as usize, word);
    ofs += 2;
    if wide {
        write_u16(buf, (ofs - base) as usize, (tex.0 >> narrow_bits) as u16);
        ofs += 2;
    }
    ofs
}

fn write_tip_fwd(buf: &mut [u8], base: i32, ofs: i32, tip: TipDelta) -> i32 {
    let mut ofs = ofs;
    let wide = tip.is_wide();
    write_u16(
        buf,
        (ofs - base) as usize,
        ((tip.0 << 1) | i32::from(wide)) as u16,
    );
    ofs += 2;
    if wide {
        write_u16(buf, (ofs - base) as usize, (tip.0 >> 15) as u16);
        ofs += 2;
    }
    ofs
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::tables::{NodeTableIter, RelTableIter, TableRef};

    #[test]
    fn rel_table_writer_round_trips() {
        let mut buf = vec![0u8; 64];
        let handle = 40;
        let mut writer = RelTableWriter::new(&mut buf, handle);
        writer.local(96);
        writer.foreign_in_tile(TipDelta(3), TexDelta(-17));
        writer.foreign(TexDelta(9000)); // wide for 12 bits
        writer.mark_last();
        let size = writer.size() as usize;

        let mut iter = RelTableIter::new(&buf[..size], handle);
        let first = iter.try_next().unwrap().unwrap();
        assert_eq!(first.reference, TableRef::Local(96));
        assert!(!first.last);
        let second = iter.try_next().unwrap().unwrap();
        assert_eq!(
            second.reference,
            TableRef::Foreign {
                tex_delta: -17,
                tip_delta: Some(3)
            }
        );
        let third = iter.try_next().unwrap().unwrap();
        assert_eq!(
            third.reference,
            TableRef::Foreign {
                tex_delta: 9000,
                tip_delta: None
            }
        );
        assert!(third.last);
        assert!(iter.try_next().unwrap().is_none());
        assert_eq!(iter.consumed(), size);
    }

    #[test]
    fn node_table_writer_round_trips() {
        let mut buf = vec![0u8; 32];
        let anchor_idx = 32;
        let handle = 100;
        let mut writer = NodeTableWriter::new(&mut buf, handle, anchor_idx);
        writer.foreign_in_tile(TipDelta(-2), TexDelta(5));
        writer.local(64);
        writer.foreign(TexDelta(2100)); // wide for 12 bits
        writer.mark_last();
        let size = writer.size() as usize;
        let start = writer.start_idx();
        assert_eq!(anchor_idx - start, size);

        let mut iter = NodeTableIter::new(&buf, anchor_idx, handle);
        let first = iter.try_next().unwrap().unwrap();
        assert_eq!(
            first.reference,
            TableRef::Foreign {
                tex_delta: 5,
                tip_delta: Some(-2)
            }
        );
        let second = iter.try_next().unwrap().unwrap();
        assert_eq!(second.reference, TableRef::Local(64));
        let third = iter.try_next().unwrap().unwrap();
        assert_eq!(
            third.reference,
            TableRef::Foreign {
                tex_delta: 2100,
                tip_delta: None
            }
        );
        assert!(third.last);
        assert_eq!(iter.consumed(), size);
    }

    #[test]
    fn tag_writer_emits_end_markers() {
        let mut buf = vec![0u8; 10];
        let handle = 8;
        let anchor = 6u32;
        let mut writer = TagTableWriter::new(&mut buf, handle, anchor);
        writer.local_tag_value(0, StrRef { handle: 40, hash: 1 }, 7);
        writer.end_local_tags();
        writer.global_tag_value(0, 0, 0);
        writer.end_global_tags();
        assert_eq!(writer.ofs(), handle + 4);

        // Last-local flag on the only local key
        let key_word = i32::from_le_bytes([buf[2], buf[3], buf[4], buf[5]]);
        assert_eq!(key_word & 7, 4);
        // Last-global flag on the end marker
        let key = u16::from_le_bytes([buf[6], buf[7]]);
        assert_eq!(key, 0x8000);
    }
}

//! Iterators over the encoded reference tables: parent-relation tables,
//! way-node tables and relation member tables.
//!
//! All three share one family of u16 entry flags; they differ in direction
//! (node tables grow downward from their anchor), in the width of the narrow
//! TEX-delta field, and in whether entries carry roles. Iterators work in
//! "handle space": local pointers are deltas against the element's handle,
//! exactly as written by the builders, so the same code serves the reader
//! (source tiles), the dedup equality checks and the fixup pass.

use crate::error::{TileError, TileResult};
use crate::types::Handle;

pub(crate) fn read_u16(data: &[u8], ofs: usize) -> TileResult<u16> {
    data.get(ofs..ofs + 2)
        .map(|b| u16::from_le_bytes([b[0], b[1]]))
        .ok_or_else(|| TileError::malformed("table read out of bounds"))
}

pub(crate) fn read_i32(data: &[u8], ofs: usize) -> TileResult<i32> {
    data.get(ofs..ofs + 4)
        .map(|b| i32::from_le_bytes([b[0], b[1], b[2], b[3]]))
        .ok_or_else(|| TileError::malformed("table read out of bounds"))
}

pub(crate) fn read_u32(data: &[u8], ofs: usize) -> TileResult<u32> {
    read_i32(data, ofs).map(|v| v as u32)
}

pub(crate) fn write_u16(data: &mut [u8], ofs: usize, v: u16) {
    data[ofs..ofs + 2].copy_from_slice(&v.to_le_bytes());
}

pub(crate) fn write_i32(data: &mut [u8], ofs: usize, v: i32) {
    data[ofs..ofs + 4].copy_from_slice(&v.to_le_bytes());
}

pub(crate) fn sign_extend(v: u32, bits: u32) -> i32 {
    let shift = 32 - bits;
    ((v << shift) as i32) >> shift
}

/// Entry flags common to all member-style tables.
const LAST: u16 = 1;
const FOREIGN: u16 = 1 << 1;

/// One reference in a table, before role handling.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TableRef {
    /// Handle of a local element (relation stub, node stub, member stub).
    Local(Handle),
    Foreign {
        tex_delta: i32,
        /// Present when the entry carries DIFFERENT_TILE.
        tip_delta: Option<i32>,
    },
}

impl TableRef {
    pub fn is_foreign(&self) -> bool {
        matches!(self, TableRef::Foreign { .. })
    }
}

/// Decodes the foreign part of a forward-table entry whose first word is at
/// `pos`. Returns the reference and the position of the last word consumed.
fn decode_foreign(
    data: &[u8],
    pos: usize,
    word: u16,
    narrow_bits: u32,
    different_tile_flag: u16,
) -> TileResult<(TableRef, usize)> {
    let wide_tex_flag = 1u16 << (15 - narrow_bits);
    let mut pos = pos;
    let shift = 16 - narrow_bits;
    let tex_delta = if word & wide_tex_flag != 0 {
        pos += 2;
        let hi = read_u16(data, pos)?;
        sign_extend(
            (u32::from(word) >> shift) | (u32::from(hi) << narrow_bits),
            narrow_bits + 16,
        )
    } else {
        sign_extend(u32::from(word) >> shift, narrow_bits)
    };
    let tip_delta = if word & different_tile_flag != 0 {
        pos += 2;
        let tip_word = read_u16(data, pos)?;
        if tip_word & 1 != 0 {
            pos += 2;
            let hi = read_u16(data, pos)?;
            Some(sign_extend(
                (u32::from(tip_word) >> 1) | (u32::from(hi) << 15),
                31,
            ))
        } else {
            Some(sign_extend(u32::from(tip_word) >> 1, 15))
        }
    } else {
        None
    };
    Ok((TableRef::Foreign { tex_delta, tip_delta }, pos))
}

/// One entry of a parent-relation table.
#[derive(Debug, Clone, Copy)]
pub struct RelTableEntry {
    /// Byte offset of the entry within the table payload.
    pub ofs: usize,
    pub reference: TableRef,
    pub last: bool,
}

/// Iterates a parent-relation table. `handle` is the handle-space offset of
/// the table's first byte (its anchor is always 0).
pub struct RelTableIter<'a> {
    data: &'a [u8],
    handle: Handle,
    pos: usize,
    done: bool,
}

impl<'a> RelTableIter<'a> {
    pub fn new(data: &'a [u8], handle: Handle) -> Self {
        Self {
            data,
            handle,
            pos: 0,
            done: false,
        }
    }

    /// Byte size consumed so far; the table's total size once iteration ends.
    pub fn consumed(&self) -> usize {
        self.pos
    }

    pub fn try_next(&mut self) -> TileResult<Option<RelTableEntry>> {
        if self.done {
            return Ok(None);
        }
        let entry_ofs = self.pos;
        let word = read_u16(self.data, self.pos)?;
        let last = word & LAST != 0;
        let reference;
        if word & FOREIGN != 0 {
            let (r, end) = decode_foreign(self.data, self.pos, word, 12, 1 << 2)?;
            reference = r;
            self.pos = end + 2;
        } else {
            let val = read_i32(self.data, self.pos)?;
            reference = TableRef::Local(self.handle + entry_ofs as i32 + (val >> 1));
            self.pos += 4;
        }
        self.done = last;
        Ok(Some(RelTableEntry {
            ofs: entry_ofs,
            reference,
            last,
        }))
    }
}

/// One entry of a way's feature-node table.
#[derive(Debug, Clone, Copy)]
pub struct NodeTableEntry {
    /// Byte offset of the entry's low word within the body payload.
    pub ofs: usize,
    pub reference: TableRef,
    pub last: bool,
}

/// Iterates a way-node table, which grows downward from the body's anchor
/// (minus the relation-table pointer, when present). `anchor` is the byte
/// offset of that boundary within `data`; `handle` its handle-space offset.
pub struct NodeTableIter<'a> {
    data: &'a [u8],
    handle: Handle,
    anchor: usize,
    pos: usize,
    done: bool,
}

impl<'a> NodeTableIter<'a> {
    pub fn new(data: &'a [u8], anchor: usize, handle: Handle) -> Self {
        Self {
            data,
            handle,
            anchor,
            pos: anchor,
            done: anchor < 2,
        }
    }

    /// Byte size of the table walked so far.
    pub fn consumed(&self) -> usize {
        self.anchor - self.pos
    }

    fn step_down(&mut self) -> TileResult<usize> {
        self.pos = self
            .pos
            .checked_sub(2)
            .ok_or_else(|| TileError::malformed("node table underflow"))?;
        Ok(self.pos)
    }

    pub fn try_next(&mut self) -> TileResult<Option<NodeTableEntry>> {
        if self.done {
            return Ok(None);
        }
        let entry_ofs = self.step_down()?;
        let word = read_u16(self.data, entry_ofs)?;
        let last = word & LAST != 0;
        let reference;
        if word & FOREIGN != 0 {
            let wide_tex = word & (1 << 3) != 0;
            let shift = 4;
            let tex_delta = if wide_tex {
                let hi = read_u16(self.data, self.step_down()?)?;
                sign_extend((u32::from(word) >> shift) | (u32::from(hi) << 12), 28)
            } else {
                sign_extend(u32::from(word) >> shift, 12)
            };
            let tip_delta = if word & (1 << 2) != 0 {
                let tip_word = read_u16(self.data, self.step_down()?)?;
                if tip_word & 1 != 0 {
                    let hi = read_u16(self.data, self.step_down()?)?;
                    Some(sign_extend(
                        (u32::from(tip_word) >> 1) | (u32::from(hi) << 15),
                        31,
                    ))
                } else {
                    Some(sign_extend(u32::from(tip_word) >> 1, 15))
                }
            } else {
                None
            };
            reference = TableRef::Foreign { tex_delta, tip_delta };
        } else {
            let lo = read_u16(self.data, entry_ofs)?;
            let hi = read_u16(self.data, self.step_down()?)?;
            let val = ((i32::from(hi as i16)) << 16) | i32::from(lo);
            let entry_handle = self.handle + entry_ofs as i32 - self.anchor as i32;
            reference = TableRef::Local(entry_handle + (val >> 1));
        }
        self.done = last;
        Ok(Some(NodeTableEntry {
            ofs: entry_ofs,
            reference,
            last,
        }))
    }
}

/// Role attached to a member entry whose DIFFERENT_ROLE flag is set.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RoleRef {
    Global(u16),
    /// Handle of a local role string, plus the offset of the 4-byte role
    /// slot within the table payload.
    Local { target: Handle, ofs: usize },
}

/// One entry of a relation's member table.
#[derive(Debug, Clone, Copy)]
pub struct MemberTableEntry {
    pub ofs: usize,
    /// Low three flag bits (LAST, FOREIGN, DIFFERENT_ROLE), as stored.
    pub flags: u16,
    pub reference: TableRef,
    pub role: Option<RoleRef>,
    pub last: bool,
}

/// Iterates a relation member table. `handle` is the handle-space offset of
/// `data[start]`, where `start` is the body anchor.
pub struct MemberTableIter<'a> {
    data: &'a [u8],
    handle: Handle,
    start: usize,
    pos: usize,
    done: bool,
}

impl<'a> MemberTableIter<'a> {
    pub fn new(data: &'a [u8], start: usize, handle: Handle) -> Self {
        Self {
            data,
            handle,
            start,
            pos: start,
            done: false,
        }
    }

    pub fn consumed(&self) -> usize {
        self.pos - self.start
    }

    pub fn try_next(&mut self) -> TileResult<Option<MemberTableEntry>> {
        if self.done {
            return Ok(None);
        }
        let entry_ofs = self.pos;
        let word = read_u16(self.data, self.pos)?;
        let last = word & LAST != 0;
        let different_role = word & (1 << 2) != 0;
        let reference;
        if word & FOREIGN != 0 {
            let (r, end) = decode_foreign(self.data, self.pos, word, 11, 1 << 3)?;
            reference = r;
            self.pos = end + 2;
        } else {
            let val = read_i32(self.data, self.pos)?;
            let entry_handle = self.handle + (entry_ofs - self.start) as i32;
            reference = TableRef::Local((entry_handle & !3) + ((val & !7) >> 1));
            self.pos += 4;
        }
        let role = if different_role {
            let role_word = read_u16(self.data, self.pos)?;
            if role_word & 1 != 0 {
                self.pos += 2;
                Some(RoleRef::Global(role_word >> 1))
            } else {
                let val = read_i32(self.data, self.pos)?;
                let role_handle = self.handle + (self.pos - self.start) as i32;
                let role = RoleRef::Local {
                    target: role_handle + (val >> 1),
                    ofs: self.pos,
                };
                self.pos += 4;
                Some(role)
            }
        } else {
            None
        };
        self.done = last;
        Ok(Some(MemberTableEntry {
            ofs: entry_ofs,
            flags: word & 7,
            reference,
            role,
            last,
        }))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn sign_extension() {
        assert_eq!(sign_extend(0xFFF, 12), -1);
        assert_eq!(sign_extend(0x7FF, 12), 2047);
        assert_eq!(sign_extend(0x800, 12), -2048);
        assert_eq!(sign_extend(5, 15), 5);
    }

    #[test]
    fn local_rel_entry_round_trip() {
        // Local relation at handle 100, table handle 20: ptr = 100+16-20
        let target: i32 = 96; // target() of the relation (handle + anchor)
        let val = ((target - 20) << 1) | 1; // LAST
        let mut data = vec![0u8; 4];
        write_i32(&mut data, 0, val);
        let mut iter = RelTableIter::new(&data, 20);
        let entry = iter.try_next().unwrap().unwrap();
        assert!(entry.last);
        assert_eq!(entry.reference, TableRef::Local(96));
        assert!(iter.try_next().unwrap().is_none());
        assert_eq!(iter.consumed(), 4);
    }

    #[test]
    fn foreign_rel_entry_wide_tex_and_tip() {
        let tex_delta: i32 = 5000; // wide for 12 bits
        let tip_delta: i32 = -20000; // wide for 15 bits
        let word: u16 = ((tex_delta << 4) as u16) | FOREIGN | (1 << 2) | (1 << 3) | LAST;
        let mut data = Vec::new();
        data.extend_from_slice(&word.to_le_bytes());
        data.extend_from_slice(&(((tex_delta >> 12) as u16).to_le_bytes()));
        data.extend_from_slice(&((((tip_delta << 1) | 1) as u16).to_le_bytes()));
        data.extend_from_slice(&(((tip_delta >> 15) as u16).to_le_bytes()));
        let mut iter = RelTableIter::new(&data, 0);
        let entry = iter.try_next().unwrap().unwrap();
        assert_eq!(
            entry.reference,
            TableRef::Foreign {
                tex_delta: 5000,
                tip_delta: Some(-20000)
            }
        );
        assert!(iter.try_next().unwrap().is_none());
    }

    #[test]
    fn truncated_table_is_an_error() {
        let data = [0u8; 2]; // claims a local entry but has only 2 bytes
        let mut iter = RelTableIter::new(&data, 0);
        assert!(iter.try_next().is_err());
    }
}

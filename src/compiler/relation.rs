//! Builders for relation member tables and parent-relation tables.

use crate::compiler::writers::{MemberTableWriter, RelTableWriter};
use crate::model::element::{elem_flags, Alignment, ElemId, Payload};
use crate::model::reltable::{Membership, MembershipTarget};
use crate::model::TileModel;
use crate::types::{
    ForeignFeatureRef, Handle, TexDelta, Tip, TipDelta, MEMBERS_START_TEX, RELATIONS_START_TEX,
    START_TIP,
};

/// A member's role, normalized to interned identity: global roles by code,
/// local roles by the content-interned string element.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Role {
    Global(u16),
    Local(Handle),
}

/// Builds the deduplicated parent-relation table for a feature's sorted
/// membership list.
pub fn build_rel_table(model: &mut TileModel, memberships: &[Membership]) -> ElemId {
    debug_assert!(!memberships.is_empty());

    enum Entry {
        Local(Handle),
        Foreign(ForeignFeatureRef),
    }
    let entries: Vec<Entry> = memberships
        .iter()
        .map(|m| match m.target {
            MembershipTarget::Local(relation) => Entry::Local(model.element(relation).handle),
            MembershipTarget::Foreign(fref) => Entry::Foreign(fref),
        })
        .collect();

    // Worst case: every relation is foreign and in its own tile, with wide
    // TIP and TEX deltas
    let max_size = memberships.len() as u32 * 8;
    let table = model.begin_rel_table(max_size);
    let handle = model.element(table).handle;

    let mut needs_fixup = false;
    let mut prev_tip = Tip(0);
    let mut prev_tex = RELATIONS_START_TEX;
    let payload = model.payload_mut(table);
    let mut writer = RelTableWriter::new(payload, handle);
    for entry in &entries {
        match entry {
            Entry::Local(target) => {
                writer.local(*target);
                needs_fixup = true;
            }
            Entry::Foreign(fref) => {
                let tex_delta = TexDelta::between(fref.tex, prev_tex);
                if fref.tip != prev_tip {
                    if prev_tip.is_null() {
                        // The first foreign entry always carries
                        // DIFFERENT_TILE, even at the baseline TIP
                        prev_tip = START_TIP;
                    }
                    writer.foreign_in_tile(TipDelta::between(fref.tip, prev_tip), tex_delta);
                    prev_tip = fref.tip;
                } else {
                    writer.foreign(tex_delta);
                }
                prev_tex = fref.tex;
            }
        }
    }
    writer.mark_last();
    let actual = writer.size();
    let hash = writer.hash();
    model.shrink_rel_table(table, actual);
    model.complete_rel_table(table, hash, needs_fixup)
}

/// One staged member of a relation under construction.
struct StagedMember {
    local: Option<Handle>,
    foreign: ForeignFeatureRef,
    role: Role,
}

/// Accumulates a relation's members, then encodes its body.
///
/// A foreign member that exists in two tiles arrives with an alternate
/// reference; the builder prefers whichever tile keeps the TIP unchanged,
/// looking one member back to pair up dual-tile runs.
pub struct RelationBodyBuilder {
    members: Vec<StagedMember>,
    prev_alt: ForeignFeatureRef,
    prev_tip: Tip,
}

impl RelationBodyBuilder {
    pub fn new(member_count: usize) -> Self {
        Self {
            members: Vec::with_capacity(member_count),
            prev_alt: ForeignFeatureRef::default(),
            prev_tip: Tip(0),
        }
    }

    pub fn add_local(&mut self, model: &TileModel, member: ElemId, role: Role) {
        self.members.push(StagedMember {
            local: Some(model.element(member).handle),
            foreign: ForeignFeatureRef::default(),
            role,
        });
        self.prev_alt = ForeignFeatureRef::default();
    }

    pub fn add_foreign(
        &mut self,
        mut reference: ForeignFeatureRef,
        mut alt: ForeignFeatureRef,
        role: Role,
    ) {
        if !self.prev_alt.is_null() {
            if let Some(prev) = self.members.last_mut() {
                debug_assert!(!prev.foreign.is_null());
                if alt == self.prev_alt {
                    // Both this member and the previous one live in the
                    // alternate tile; switching the pair saves a TIP change
                    prev.foreign = self.prev_alt;
                    reference = alt;
                    alt = ForeignFeatureRef::default();
                } else if reference == self.prev_alt {
                    prev.foreign = self.prev_alt;
                    alt = ForeignFeatureRef::default();
                }
            }
        }
        if !alt.is_null() {
            if alt.tip == self.prev_tip {
                reference = alt;
                alt = ForeignFeatureRef::default();
            } else if reference.tip == self.prev_tip {
                alt = ForeignFeatureRef::default();
            }
        }
        self.members.push(StagedMember {
            local: None,
            foreign: reference,
            role,
        });
        self.prev_tip = reference.tip;
        self.prev_alt = alt;
    }

    /// Encodes the member table into the relation's body element.
    /// `has_parents` reserves the relation-table pointer slot.
    pub fn build(self, model: &mut TileModel, body: ElemId, has_parents: bool) {
        debug_assert!(!self.members.is_empty());
        let body_handle = model.new_handle();
        let rels_ptr_size: u32 = if has_parents { 4 } else { 0 };

        // Worst case per member: wide TIP and TEX deltas plus a local-string
        // role pointer
        let max_size = self.members.len() * 12 + rels_ptr_size as usize;
        let alloc = model.arena_alloc(max_size, 2);

        let mut needs_fixup = false;
        let mut prev_foreign = ForeignFeatureRef::new(Tip(0), MEMBERS_START_TEX);
        let mut prev_role = Role::Global(0);
        let buf = model.arena_bytes_mut(alloc, max_size);
        let mut writer = MemberTableWriter::new(&mut buf[rels_ptr_size as usize..], body_handle);
        for member in &self.members {
            let role_change = member.role != prev_role;
            if let Some(target) = member.local {
                writer.local(target, role_change);
                needs_fixup = true;
            } else if member.foreign.tip != prev_foreign.tip {
                let base_tip = if prev_foreign.tip.is_null() {
                    START_TIP
                } else {
                    prev_foreign.tip
                };
                writer.foreign_in_tile(
                    TipDelta::between(member.foreign.tip, base_tip),
                    TexDelta::between(member.foreign.tex, prev_foreign.tex),
                    role_change,
                );
                prev_foreign = member.foreign;
            } else {
                writer.foreign(
                    TexDelta::between(member.foreign.tex, prev_foreign.tex),
                    role_change,
                );
                prev_foreign.tex = member.foreign.tex;
            }
            if role_change {
                match member.role {
                    Role::Global(code) => writer.global_role(u32::from(code)),
                    Role::Local(string_handle) => {
                        writer.local_role(string_handle);
                        needs_fixup = true;
                    }
                }
                prev_role = member.role;
            }
        }
        writer.mark_last();
        let actual = rels_ptr_size + writer.size();
        model.arena_shrink_last(alloc, max_size - actual as usize);

        let elem = model.element_mut(body);
        elem.handle = body_handle;
        elem.payload = Payload::Arena(alloc);
        elem.size = actual;
        elem.anchor = rels_ptr_size;
        elem.alignment = Alignment::Word;
        elem.set_flag(elem_flags::NEEDS_FIXUP, needs_fixup);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::geom::Tile;
    use crate::model::tables::{MemberTableIter, RelTableIter, RoleRef, TableRef};
    use crate::types::{FeatureType, Tex, TypedFeatureId};

    fn model() -> TileModel {
        TileModel::new(Tile::new(9, 100, 200))
    }

    #[test]
    fn rel_table_orders_locals_before_foreigns() {
        let mut m = model();
        let rel = m
            .create_feature(TypedFeatureId::new(FeatureType::Relation, 9))
            .unwrap();
        let mut memberships = Vec::new();
        crate::model::reltable::sorted_insert(
            &mut memberships,
            Membership::foreign(11, ForeignFeatureRef::new(Tip(0x4005), Tex(7))),
        );
        crate::model::reltable::sorted_insert(&mut memberships, Membership::local(9, rel));
        let table = build_rel_table(&mut m, &memberships);

        let handle = m.element(table).handle;
        let payload = m.payload(table);
        let mut iter = RelTableIter::new(payload, handle);
        let first = iter.try_next().unwrap().unwrap();
        assert_eq!(first.reference, TableRef::Local(m.element(rel).handle));
        let second = iter.try_next().unwrap().unwrap();
        // First foreign entry is measured against the baselines
        assert_eq!(
            second.reference,
            TableRef::Foreign {
                tex_delta: 7,
                tip_delta: Some(5)
            }
        );
        assert!(second.last);
        assert!(m.element(table).needs_fixup());
    }

    #[test]
    fn identical_rel_tables_deduplicate() {
        let mut m = model();
        let memberships = vec![Membership::foreign(
            11,
            ForeignFeatureRef::new(Tip(0x4005), Tex(7)),
        )];
        let a = build_rel_table(&mut m, &memberships);
        let b = build_rel_table(&mut m, &memberships);
        assert_eq!(a, b);
        assert!(!m.element(a).needs_fixup());
    }

    #[test]
    fn member_table_encodes_roles_once_per_run() {
        let mut m = model();
        let rel = m
            .create_feature(TypedFeatureId::new(FeatureType::Relation, 3))
            .unwrap();
        let way = m
            .create_feature(TypedFeatureId::new(FeatureType::Way, 2))
            .unwrap();
        let body = m.element(rel).feature().body.unwrap();

        let mut builder = RelationBodyBuilder::new(3);
        builder.add_local(&m, way, Role::Global(5));
        builder.add_foreign(
            ForeignFeatureRef::new(Tip(0x4005), Tex(7)),
            ForeignFeatureRef::default(),
            Role::Global(5),
        );
        builder.add_foreign(
            ForeignFeatureRef::new(Tip(0x4005), Tex(9)),
            ForeignFeatureRef::default(),
            Role::Global(8),
        );
        builder.build(&mut m, body, false);

        let elem = m.element(body);
        assert_eq!(elem.anchor, 0);
        assert!(elem.needs_fixup());
        let handle = elem.handle;
        let payload = m.payload(body);
        let mut iter = MemberTableIter::new(payload, 0, handle);

        let first = iter.try_next().unwrap().unwrap();
        assert_eq!(first.reference, TableRef::Local(m.element(way).handle));
        assert_eq!(first.role, Some(RoleRef::Global(5)));

        let second = iter.try_next().unwrap().unwrap();
        assert_eq!(
            second.reference,
            TableRef::Foreign {
                tex_delta: 7,
                tip_delta: Some(5)
            }
        );
        // Same role as the previous member: no role change
        assert_eq!(second.role, None);

        let third = iter.try_next().unwrap().unwrap();
        assert_eq!(
            third.reference,
            TableRef::Foreign {
                tex_delta: 2,
                tip_delta: None
            }
        );
        assert_eq!(third.role, Some(RoleRef::Global(8)));
        assert!(third.last);
        assert_eq!(iter.consumed() as u32, elem.size);
    }

    #[test]
    fn dual_tile_members_prefer_the_previous_tile() {
        let mut builder = RelationBodyBuilder::new(2);
        builder.add_foreign(
            ForeignFeatureRef::new(Tip(0x4001), Tex(1)),
            ForeignFeatureRef::default(),
            Role::Global(0),
        );
        // Second member lives in two tiles; its alternate matches the
        // previous member's tile and wins
        builder.add_foreign(
            ForeignFeatureRef::new(Tip(0x4002), Tex(6)),
            ForeignFeatureRef::new(Tip(0x4001), Tex(9)),
            Role::Global(0),
        );
        assert_eq!(
            builder.members[1].foreign,
            ForeignFeatureRef::new(Tip(0x4001), Tex(9))
        );
    }
}

//! Parent-relation memberships accumulated during compile.

use std::cmp::Ordering;

use crate::model::element::ElemId;
use crate::types::ForeignFeatureRef;

/// The relation a feature belongs to: in this tile, or elsewhere.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MembershipTarget {
    Local(ElemId),
    Foreign(ForeignFeatureRef),
}

/// One entry of a feature's transient membership list. The list is kept
/// sorted by `(is_foreign, tip, relation id)`, which is exactly the order
/// relation tables are encoded in.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Membership {
    pub relation_id: u64,
    pub target: MembershipTarget,
}

impl Membership {
    pub fn local(relation_id: u64, relation: ElemId) -> Self {
        Self {
            relation_id,
            target: MembershipTarget::Local(relation),
        }
    }

    pub fn foreign(relation_id: u64, reference: ForeignFeatureRef) -> Self {
        Self {
            relation_id,
            target: MembershipTarget::Foreign(reference),
        }
    }

    pub fn is_foreign(&self) -> bool {
        matches!(self.target, MembershipTarget::Foreign(_))
    }

    fn sort_key(&self) -> (bool, u32, u64) {
        match self.target {
            MembershipTarget::Local(_) => (false, 0, self.relation_id),
            MembershipTarget::Foreign(fref) => (true, fref.tip.0, self.relation_id),
        }
    }

    fn compare(&self, other: &Membership) -> Ordering {
        self.sort_key().cmp(&other.sort_key())
    }
}

/// Inserts into a sorted membership list, dropping exact duplicates.
/// Returns whether the membership was added.
pub fn sorted_insert(list: &mut Vec<Membership>, membership: Membership) -> bool {
    for (i, existing) in list.iter().enumerate() {
        match membership.compare(existing) {
            Ordering::Equal if membership == *existing => return false,
            Ordering::Less => {
                list.insert(i, membership);
                return true;
            }
            _ => {}
        }
    }
    list.push(membership);
    true
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::{Tex, Tip};

    fn foreign(id: u64, tip: u32) -> Membership {
        Membership::foreign(id, ForeignFeatureRef::new(Tip(tip), Tex(0)))
    }

    #[test]
    fn locals_sort_before_foreigns() {
        let mut list = Vec::new();
        sorted_insert(&mut list, foreign(5, 100));
        sorted_insert(&mut list, Membership::local(9, ElemId(1)));
        sorted_insert(&mut list, foreign(2, 50));
        sorted_insert(&mut list, Membership::local(3, ElemId(2)));

        let foreign_start = list.iter().position(Membership::is_foreign).unwrap();
        assert!(list[..foreign_start].iter().all(|m| !m.is_foreign()));
        assert_eq!(list[0].relation_id, 3);
        assert_eq!(list[1].relation_id, 9);
        // Foreigns grouped by tip
        assert_eq!(list[2].relation_id, 2);
        assert_eq!(list[3].relation_id, 5);
    }

    #[test]
    fn duplicates_are_dropped() {
        let mut list = Vec::new();
        assert!(sorted_insert(&mut list, foreign(5, 100)));
        assert!(!sorted_insert(&mut list, foreign(5, 100)));
        assert_eq!(list.len(), 1);
    }
}

use std::collections::BTreeSet;

use serde::{Deserialize, Serialize};

use crate::Addr;

pub type ViewId = u32;

/// Ordered membership of a replica group.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct View {
    pub id: ViewId,
    pub members: BTreeSet<Addr>,
}

impl View {
    pub fn new(id: ViewId, members: impl IntoIterator<Item = Addr>) -> Self {
        Self {
            id,
            members: members.into_iter().collect(),
        }
    }

    pub fn is_newer_than(&self, other: &View) -> bool {
        self.id > other.id
    }

    /// Members of `new` that `me` has to send its data to when the group moves
    /// from `self` to `new`.
    ///
    /// Old members split the ring into segments. A joining member belongs to
    /// the segment closed by the first old member ordered after it, and that
    /// member serves it. Joining members ordered after every old member are
    /// served by the last old member. So each joining member has exactly one
    /// sender, and a replica that is not in `self` sends nothing.
    pub fn recipients(&self, new: &View, me: &Addr) -> BTreeSet<Addr> {
        if !self.members.contains(me) {
            return Default::default();
        }
        let predecessor = self.members.range::<Addr, _>(..me).next_back();
        let is_last = self.members.range::<Addr, _>(me..).nth(1).is_none();
        new.members
            .iter()
            .filter(|addr| !self.members.contains(*addr))
            .filter(|&addr| {
                let after_predecessor = predecessor.map_or(true, |lower| lower < addr);
                (after_predecessor && addr < me) || (is_last && addr > me)
            })
            .cloned()
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn addr(i: u8) -> Addr {
        Addr::Untyped(format!("node-{i:02}"))
    }

    fn view(id: ViewId, members: &[u8]) -> View {
        View::new(id, members.iter().copied().map(addr))
    }

    #[test]
    fn joining_between_predecessor_and_me() {
        let old = view(1, &[2, 5, 8]);
        let new = view(2, &[2, 3, 5, 8]);
        assert_eq!(old.recipients(&new, &addr(5)), BTreeSet::from([addr(3)]));
        assert!(old.recipients(&new, &addr(2)).is_empty());
        assert!(old.recipients(&new, &addr(8)).is_empty());
    }

    #[test]
    fn ring_edges() {
        let old = view(1, &[2, 5]);
        // before the first old member
        let new = view(2, &[1, 2, 5]);
        assert_eq!(old.recipients(&new, &addr(2)), BTreeSet::from([addr(1)]));
        assert!(old.recipients(&new, &addr(5)).is_empty());
        // after the last old member
        let new = view(2, &[2, 5, 9]);
        assert_eq!(old.recipients(&new, &addr(5)), BTreeSet::from([addr(9)]));
        assert!(old.recipients(&new, &addr(2)).is_empty());
    }

    #[test]
    fn single_member_serves_everyone() {
        let old = view(1, &[4]);
        let new = view(2, &[1, 4, 7, 9]);
        assert_eq!(
            old.recipients(&new, &addr(4)),
            BTreeSet::from([addr(1), addr(7), addr(9)])
        );
    }

    #[test]
    fn not_an_old_member() {
        let old = view(1, &[2, 5]);
        let new = view(2, &[2, 3, 5]);
        assert!(old.recipients(&new, &addr(3)).is_empty());
    }

    #[test]
    fn every_joining_member_has_exactly_one_sender() {
        const N: u8 = 6;
        // every (old, new) pair of non-empty member subsets of `0..N`
        for old_mask in 1u32..(1 << N) {
            for new_mask in 1u32..(1 << N) {
                let pick = |mask: u32| (0..N).filter(move |i| mask & (1 << i) != 0);
                let old = View::new(1, pick(old_mask).map(addr));
                let new = View::new(2, pick(new_mask).map(addr));
                for joining in new.members.difference(&old.members) {
                    let senders = old
                        .members
                        .iter()
                        .filter(|me| old.recipients(&new, me).contains(joining))
                        .count();
                    assert_eq!(senders, 1, "{old:?} -> {new:?} joining {joining:?}");
                }
                for me in &old.members {
                    for recipient in old.recipients(&new, me) {
                        assert!(new.members.contains(&recipient));
                        assert!(!old.members.contains(&recipient));
                    }
                }
            }
        }
    }
}

//! Membership differencing.

use either::Either;
use itertools::Itertools;

use crate::types::{MemberSet, MembershipDelta};

/// Compute which members joined and which left.
///
/// An absent `old` means the group is observed for the first time, so every
/// current member counts as added.
#[must_use]
pub fn diff(old: Option<&MemberSet>, new: &MemberSet) -> MembershipDelta {
    let Some(old) = old else {
        return MembershipDelta {
            added: new.clone(),
            removed: MemberSet::new(),
        };
    };

    let (added, removed) = old
        .symmetric_difference(new)
        .cloned()
        .partition_map(|member| {
            if new.contains(&member) {
                Either::Left(member)
            } else {
                Either::Right(member)
            }
        });

    MembershipDelta { added, removed }
}

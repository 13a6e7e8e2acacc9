use std::cmp::Ordering;

use super::{MergeConflict, RevTree};
use crate::rev::RevId;

/// Ranking used to pick the winner: every replica must agree on it.
fn rank(a: &(RevId, bool), b: &(RevId, bool)) -> Ordering {
    let (rev_a, deleted_a) = a;
    let (rev_b, deleted_b) = b;
    // `false` (live) must rank above `true` (deleted)
    deleted_b
        .cmp(deleted_a)
        .then(rev_a.pos.cmp(&rev_b.pos))
        .then_with(|| rev_a.hash.cmp(&rev_b.hash))
}

pub(super) fn winning_rev(tree: &RevTree) -> Option<RevId> {
    tree.leaves()
        .into_iter()
        .max_by(rank)
        .map(|(rev, _)| rev)
}

/// Decide whether a locally authored edit must be rejected.
///
/// `previously_deleted` is the deletion state of the winner before the
/// write, `deleted` the deletion flag carried by the write itself.
pub fn is_conflict(previously_deleted: bool, deleted: bool, conflicts: MergeConflict) -> bool {
    match (previously_deleted, deleted) {
        (false, _) => conflicts != MergeConflict::NewLeaf,
        (true, true) => conflicts != MergeConflict::NewLeaf,
        (true, false) => conflicts == MergeConflict::NewBranch,
    }
}

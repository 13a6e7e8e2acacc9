//! Merging an incoming path into a revision tree, then stemming.
//!
//! The incoming value is always a single lineage (what the parser built).
//! Merging never discards anything; stemming afterwards cuts every
//! root-to-leaf path down to `rev_limit` generations.

use std::collections::HashSet;

use super::{RevBranch, RevNode, RevStatus, RevTree};
use crate::rev::RevId;

/// Generations kept per path when the caller gives no limit.
pub const DEFAULT_REV_LIMIT: usize = 1000;

/// How the incoming path related to the existing tree.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MergeConflict {
    /// Extended an existing leaf (or populated an empty tree).
    NewLeaf,
    /// Diverged from an existing node: the document is now in conflict.
    NewBranch,
    /// Nothing new structurally: the path was already known, or it did not
    /// attach anywhere and was added as a separate root.
    InternalNode,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MergeResult {
    pub tree: RevTree,
    pub conflicts: MergeConflict,
    /// Revisions removed by stemming, for the caller to garbage-collect.
    pub stemmed_revs: Vec<RevId>,
}

/// Merge `path` into `tree` and stem the result to `rev_limit` generations.
///
/// A `rev_limit` of zero means [`DEFAULT_REV_LIMIT`].
pub fn merge(tree: RevTree, path: RevBranch, rev_limit: usize) -> MergeResult {
    let rev_limit = if rev_limit == 0 { DEFAULT_REV_LIMIT } else { rev_limit };
    let (merged, conflicts) = do_merge(tree.into_branches(), path, false);
    let (tree, stemmed_revs) = stem(merged, rev_limit);
    if !stemmed_revs.is_empty() {
        log::trace!("Stemmed {} revisions beyond depth {rev_limit}", stemmed_revs.len());
    }
    MergeResult {
        tree,
        conflicts,
        stemmed_revs,
    }
}

/// Merge `incoming` into `existing`, which is known to be the same revision.
fn merge_node(existing: &mut RevNode, incoming: RevNode) -> Option<MergeConflict> {
    if existing.status == RevStatus::Available || incoming.status == RevStatus::Available {
        existing.status = RevStatus::Available;
    }
    // A stub carries no deletion information; a real body does.
    if incoming.status == RevStatus::Available {
        existing.deleted = incoming.deleted;
    }

    let mut conflicts = None;
    for child in incoming.children {
        if existing.children.is_empty() {
            existing.children.push(child);
            conflicts = Some(MergeConflict::NewLeaf);
            continue;
        }
        match existing.children.iter_mut().find(|c| c.hash == child.hash) {
            Some(known) => {
                if let Some(found) = merge_node(known, child) {
                    conflicts = Some(found);
                }
            }
            None => {
                let at = existing
                    .children
                    .partition_point(|c| c.hash.as_str() < child.hash.as_str());
                existing.children.insert(at, child);
                conflicts = Some(MergeConflict::NewBranch);
            }
        }
    }
    conflicts
}

/// Node `depth` generations below `node` carrying `hash`.
fn node_at_depth_mut<'a>(node: &'a mut RevNode, depth: u64, hash: &str) -> Option<&'a mut RevNode> {
    if depth == 0 {
        return (node.hash == hash).then_some(node);
    }
    node.children
        .iter_mut()
        .rev()
        .find_map(|child| node_at_depth_mut(child, depth - 1, hash))
}

fn do_merge(
    branches: Vec<RevBranch>,
    mut path: RevBranch,
    dont_expand: bool,
) -> (RevTree, MergeConflict) {
    if branches.is_empty() {
        return (RevTree::single(path), MergeConflict::NewLeaf);
    }

    let mut result: Vec<RevBranch> = Vec::with_capacity(branches.len() + 1);
    let mut conflicts = None;
    let mut merged = false;
    // The path swallowed an existing branch and now stands in for it.
    let mut absorbed = false;

    for mut branch in branches {
        if branch.pos == path.pos && branch.root.hash == path.root.hash {
            // Same starting point: merge node by node.
            let found = merge_node(&mut branch.root, path.root.clone());
            conflicts = conflicts.or(found);
            result.push(branch);
            merged = true;
        } else if !dont_expand {
            // Different starting points: walk down the earlier one to the
            // later one's generation and merge there if the hashes line up.
            if branch.pos < path.pos {
                let diff = path.pos - branch.pos;
                if let Some(target) = node_at_depth_mut(&mut branch.root, diff, &path.root.hash) {
                    let found = merge_node(target, path.root.clone());
                    conflicts = conflicts.or(found);
                    merged = true;
                }
                result.push(branch);
            } else {
                let diff = branch.pos - path.pos;
                let attach_hash = branch.root.hash.clone();
                match node_at_depth_mut(&mut path.root, diff, &attach_hash) {
                    Some(target) => {
                        let found = merge_node(target, branch.root);
                        conflicts = conflicts.or(found);
                        absorbed = true;
                        merged = true;
                    }
                    None => result.push(branch),
                }
            }
        } else {
            result.push(branch);
        }
    }

    if absorbed || !merged {
        result.push(path);
    }
    result.sort_by_key(|b| b.pos);

    (
        RevTree::from_branches(result),
        conflicts.unwrap_or(MergeConflict::InternalNode),
    )
}

/// Cut every root-to-leaf path to at most `depth` generations.
fn stem(tree: RevTree, depth: usize) -> (RevTree, Vec<RevId>) {
    let mut stemmed: Vec<RevId> = Vec::new();
    let mut seen: HashSet<RevId> = HashSet::new();
    let mut result: Option<RevTree> = None;

    for path in tree.paths() {
        let cut = path.nodes.len().saturating_sub(depth);
        for (offset, node) in path.nodes.iter().take(cut).enumerate() {
            let rev = RevId::new(path.pos + offset as u64, node.hash.clone());
            if seen.insert(rev.clone()) {
                stemmed.push(rev);
            }
        }
        let Some(branch) = path.into_branch(cut) else {
            continue;
        };
        result = Some(match result {
            // Re-merge without expansion so that paths which were cut at
            // different points do not reconnect past the limit.
            Some(acc) => do_merge(acc.into_branches(), branch, true).0,
            None => RevTree::single(branch),
        });
    }

    let tree = result.unwrap_or_default();
    if !stemmed.is_empty() {
        // Some revisions were cut from one path but survive in another.
        let kept: HashSet<RevId> = tree.revs().into_iter().collect();
        stemmed.retain(|rev| !kept.contains(rev));
    }
    (tree, stemmed)
}

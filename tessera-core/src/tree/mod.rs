//! Revision trees.
//!
//! A document's history is a forest of branches. Each branch starts at some
//! generation (`pos`) and owns a tree of [`RevNode`]s; a document with
//! conflicting edits has several leaves.
//!
//! ```text
//!  pos 1      pos 2      pos 3
//!  1-a ────── 2-b ────── 3-c      leaf
//!              └──────── 3-d      leaf (conflict)
//! ```
//!
//! Nodes own their children; there are no back-references, so merging and
//! stemming work on plain owned values.

mod merge;
mod winner;

pub use merge::{merge, MergeConflict, MergeResult, DEFAULT_REV_LIMIT};
pub use winner::is_conflict;

use serde::{Deserialize, Serialize};
use serde_json::{json, Value};

use crate::rev::RevId;

/// Whether the body of a revision is held by the backend.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum RevStatus {
    /// Body stored.
    Available,
    /// Known ancestor whose body was never received (or was compacted).
    Missing,
}

/// One revision inside a tree.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RevNode {
    pub hash: String,
    pub status: RevStatus,
    /// Tombstone flag, orthogonal to availability.
    pub deleted: bool,
    /// Kept sorted by hash.
    pub children: Vec<RevNode>,
}

impl RevNode {
    pub fn available(hash: impl Into<String>, deleted: bool) -> Self {
        Self {
            hash: hash.into(),
            status: RevStatus::Available,
            deleted,
            children: Vec::new(),
        }
    }

    pub fn missing(hash: impl Into<String>) -> Self {
        Self {
            hash: hash.into(),
            status: RevStatus::Missing,
            deleted: false,
            children: Vec::new(),
        }
    }

    pub fn with_child(mut self, child: RevNode) -> Self {
        self.children.push(child);
        self
    }

    pub fn is_leaf(&self) -> bool {
        self.children.is_empty()
    }

    fn to_json(&self) -> Value {
        let mut opts = json!({
            "status": match self.status {
                RevStatus::Available => "available",
                RevStatus::Missing => "missing",
            }
        });
        if self.deleted {
            opts["deleted"] = Value::Bool(true);
        }
        let children: Vec<Value> = self.children.iter().map(RevNode::to_json).collect();
        json!([self.hash, opts, children])
    }
}

/// A lineage starting at generation `pos`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RevBranch {
    pub pos: u64,
    pub root: RevNode,
}

impl RevBranch {
    pub fn new(pos: u64, root: RevNode) -> Self {
        Self { pos, root }
    }
}

/// Flattened node of a root-to-leaf path.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PathNode {
    pub hash: String,
    pub status: RevStatus,
    pub deleted: bool,
}

/// A single root-to-leaf path; `nodes[0]` sits at generation `pos`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RevPath {
    pub pos: u64,
    pub nodes: Vec<PathNode>,
}

impl RevPath {
    /// Rebuild a single-branch tree from `nodes[skip..]`.
    pub(crate) fn into_branch(self, skip: usize) -> Option<RevBranch> {
        let pos = self.pos + skip as u64;
        let mut nodes = self.nodes.into_iter().skip(skip).rev();
        let leaf = nodes.next()?;
        let mut node = RevNode {
            hash: leaf.hash,
            status: leaf.status,
            deleted: leaf.deleted,
            children: Vec::new(),
        };
        for parent in nodes {
            node = RevNode {
                hash: parent.hash,
                status: parent.status,
                deleted: parent.deleted,
                children: vec![node],
            };
        }
        Some(RevBranch::new(pos, node))
    }
}

/// The full revision history of one document.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct RevTree {
    branches: Vec<RevBranch>,
}

impl RevTree {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn from_branches(branches: Vec<RevBranch>) -> Self {
        Self { branches }
    }

    /// Tree holding one branch.
    pub fn single(branch: RevBranch) -> Self {
        Self {
            branches: vec![branch],
        }
    }

    pub fn branches(&self) -> &[RevBranch] {
        &self.branches
    }

    pub fn into_branches(self) -> Vec<RevBranch> {
        self.branches
    }

    pub fn is_empty(&self) -> bool {
        self.branches.is_empty()
    }

    /// Visit every node with its generation, depth first.
    pub fn traverse<F>(&self, mut visit: F)
    where
        F: FnMut(u64, &RevNode),
    {
        fn walk<F: FnMut(u64, &RevNode)>(pos: u64, node: &RevNode, visit: &mut F) {
            visit(pos, node);
            for child in &node.children {
                walk(pos + 1, child, visit);
            }
        }
        for branch in &self.branches {
            walk(branch.pos, &branch.root, &mut visit);
        }
    }

    /// Look up a node by revision.
    pub fn find(&self, rev: &RevId) -> Option<&RevNode> {
        fn search<'a>(pos: u64, node: &'a RevNode, rev: &RevId) -> Option<&'a RevNode> {
            if pos == rev.pos {
                return (node.hash == rev.hash).then_some(node);
            }
            if pos > rev.pos {
                return None;
            }
            node.children
                .iter()
                .find_map(|child| search(pos + 1, child, rev))
        }
        self.branches
            .iter()
            .find_map(|branch| search(branch.pos, &branch.root, rev))
    }

    pub fn contains(&self, rev: &RevId) -> bool {
        self.find(rev).is_some()
    }

    /// All revisions in the tree.
    pub fn revs(&self) -> Vec<RevId> {
        let mut revs = Vec::new();
        self.traverse(|pos, node| revs.push(RevId::new(pos, node.hash.clone())));
        revs
    }

    /// Leaf revisions with their deletion flag.
    pub fn leaves(&self) -> Vec<(RevId, bool)> {
        let mut leaves = Vec::new();
        self.traverse(|pos, node| {
            if node.is_leaf() {
                leaves.push((RevId::new(pos, node.hash.clone()), node.deleted));
            }
        });
        leaves
    }

    /// Break the tree into its root-to-leaf paths, left to right.
    pub fn paths(&self) -> Vec<RevPath> {
        fn walk(node: &RevNode, history: &mut Vec<PathNode>, leaf_pos: u64, out: &mut Vec<RevPath>) {
            history.push(PathNode {
                hash: node.hash.clone(),
                status: node.status,
                deleted: node.deleted,
            });
            if node.is_leaf() {
                out.push(RevPath {
                    pos: leaf_pos + 1 - history.len() as u64,
                    nodes: history.clone(),
                });
            }
            for child in &node.children {
                walk(child, history, leaf_pos + 1, out);
            }
            history.pop();
        }

        let mut paths = Vec::new();
        let mut history = Vec::new();
        for branch in &self.branches {
            walk(&branch.root, &mut history, branch.pos, &mut paths);
        }
        paths
    }

    /// Deepest generation present anywhere in the tree.
    pub fn depth(&self) -> usize {
        self.paths().iter().map(|p| p.nodes.len()).max().unwrap_or(0)
    }

    /// Deterministic winner among the leaves.
    ///
    /// Non-deleted leaves beat deleted ones, then the higher generation wins,
    /// then the lexicographically greater hash. `None` only for an empty tree.
    pub fn winning_rev(&self) -> Option<RevId> {
        winner::winning_rev(self)
    }

    /// Deletion flag of `rev`, `false` when the revision is unknown.
    pub fn is_deleted(&self, rev: &RevId) -> bool {
        self.find(rev).is_some_and(|node| node.deleted)
    }

    /// Deletion flag of the winning revision.
    pub fn winner_is_deleted(&self) -> bool {
        self.winning_rev()
            .is_some_and(|rev| self.is_deleted(&rev))
    }

    /// True when the oldest stored node of the first branch has no body.
    pub fn root_is_missing(&self) -> bool {
        self.branches
            .first()
            .is_some_and(|branch| branch.root.status == RevStatus::Missing)
    }

    /// Render in the `[{pos, ids: [hash, opts, children]}]` interchange shape.
    pub fn to_json(&self) -> Value {
        Value::Array(
            self.branches
                .iter()
                .map(|b| json!({ "pos": b.pos, "ids": b.root.to_json() }))
                .collect(),
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    /// 1-a → 2-b → {3-c, 3-d(deleted)}
    fn forked() -> RevTree {
        let root = RevNode::missing("a").with_child(
            RevNode::available("b", false)
                .with_child(RevNode::available("c", false))
                .with_child(RevNode::available("d", true)),
        );
        RevTree::single(RevBranch::new(1, root))
    }

    #[test]
    fn test_find_and_contains() {
        let tree = forked();
        assert!(tree.contains(&RevId::new(1, "a")));
        assert!(tree.contains(&RevId::new(3, "d")));
        assert!(!tree.contains(&RevId::new(2, "d")));
        assert!(!tree.contains(&RevId::new(4, "c")));
    }

    #[test]
    fn test_leaves() {
        let leaves = forked().leaves();
        assert_eq!(
            leaves,
            vec![(RevId::new(3, "c"), false), (RevId::new(3, "d"), true)]
        );
    }

    #[test]
    fn test_paths_left_to_right() {
        let paths = forked().paths();
        assert_eq!(paths.len(), 2);
        assert_eq!(paths[0].pos, 1);
        let hashes: Vec<&str> = paths[1].nodes.iter().map(|n| n.hash.as_str()).collect();
        assert_eq!(hashes, vec!["a", "b", "d"]);
    }

    #[test]
    fn test_path_into_branch_skips_root_end() {
        let path = forked().paths().remove(0);
        let branch = path.into_branch(1).unwrap();
        assert_eq!(branch.pos, 2);
        assert_eq!(branch.root.hash, "b");
        assert_eq!(branch.root.children[0].hash, "c");
    }

    #[test]
    fn test_is_deleted_and_root_missing() {
        let tree = forked();
        assert!(tree.is_deleted(&RevId::new(3, "d")));
        assert!(!tree.is_deleted(&RevId::new(3, "c")));
        assert!(!tree.is_deleted(&RevId::new(9, "zz")));
        assert!(tree.root_is_missing());
        assert_eq!(tree.depth(), 3);
    }

    #[test]
    fn test_to_json_shape() {
        let tree = RevTree::single(RevBranch::new(1, RevNode::available("abc", false)));
        assert_eq!(
            tree.to_json(),
            json!([{ "pos": 1, "ids": ["abc", { "status": "available" }, []] }])
        );
    }
}

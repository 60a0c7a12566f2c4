//! Commit history graph
//!
//! Indexes the commits and tree objects of a document so any commit can be
//! checked out into a working tree, heads can be compared for fast-forward,
//! and diverged heads can be merged.

use crate::object::{Commit, Head, ObjectId, TreeObject, WorkingTree};
use std::collections::{HashMap, HashSet, VecDeque};

/// Local id given to the root node on checkout
pub const ROOT_LOCAL_ID: &str = "0";

/// Errors raised while walking history
#[derive(Debug, thiserror::Error)]
pub enum HistoryError {
    #[error("Commit not found: {0}")]
    CommitNotFound(ObjectId),

    #[error("Tree object not found: {0}")]
    TreeNotFound(ObjectId),

    #[error("Tree object {0} does not match its content")]
    Corrupt(ObjectId),
}

pub type Result<T> = std::result::Result<T, HistoryError>;

/// How two heads relate
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Divergence {
    Equal,
    /// Local already contains remote; pushing is a fast-forward
    LocalAhead,
    /// Remote contains local; pulling is a fast-forward
    RemoteAhead,
    /// Neither contains the other; a merge is required
    Diverged,
}

/// Compare heads by their ancestor lists
pub fn compare_heads(local: &Head, remote: &Head) -> Divergence {
    if local.value == remote.value {
        Divergence::Equal
    } else if local.contains(&remote.value) {
        Divergence::LocalAhead
    } else if remote.contains(&local.value) {
        Divergence::RemoteAhead
    } else {
        Divergence::Diverged
    }
}

/// In-memory index of a document's immutable objects
#[derive(Debug, Clone, Default)]
pub struct CommitGraph {
    commits: HashMap<ObjectId, Commit>,
    trees: HashMap<ObjectId, TreeObject>,
}

impl CommitGraph {
    pub fn new(commits: impl IntoIterator<Item = Commit>, trees: impl IntoIterator<Item = TreeObject>) -> Self {
        Self {
            commits: commits.into_iter().map(|c| (c.id, c)).collect(),
            trees: trees.into_iter().map(|t| (t.id, t)).collect(),
        }
    }

    pub fn commit(&self, id: &ObjectId) -> Option<&Commit> {
        self.commits.get(id)
    }

    pub fn contains_commit(&self, id: &ObjectId) -> bool {
        self.commits.contains_key(id)
    }

    pub fn commit_count(&self) -> usize {
        self.commits.len()
    }

    /// Rebuild the working tree of any commit, referenced by a head or not
    pub fn checkout(&self, commit_id: &ObjectId) -> Result<WorkingTree> {
        let commit = self
            .commits
            .get(commit_id)
            .ok_or(HistoryError::CommitNotFound(*commit_id))?;
        self.resolve_tree(&commit.tree, ROOT_LOCAL_ID)
    }

    fn resolve_tree(&self, id: &ObjectId, local_id: &str) -> Result<WorkingTree> {
        let object = self.trees.get(id).ok_or(HistoryError::TreeNotFound(*id))?;
        if !object.verify() {
            return Err(HistoryError::Corrupt(*id));
        }
        let children = object
            .children
            .iter()
            .map(|(child_id, child_local)| self.resolve_tree(child_id, child_local))
            .collect::<Result<Vec<_>>>()?;
        Ok(WorkingTree {
            id: local_id.to_string(),
            content: object.content.clone(),
            children,
            object_id: Some(*id),
        })
    }

    /// Commits reachable from `from`, newest first by breadth
    pub fn log(&self, from: &ObjectId, limit: usize) -> Vec<&Commit> {
        let mut out = Vec::new();
        let mut seen = HashSet::new();
        let mut queue = VecDeque::from([*from]);
        while let Some(id) = queue.pop_front() {
            if out.len() >= limit || !seen.insert(id) {
                continue;
            }
            if let Some(commit) = self.commits.get(&id) {
                queue.extend(commit.parents.iter().copied());
                out.push(commit);
            }
        }
        out
    }

    /// Every commit reachable from `id`, excluding `id` itself
    pub fn ancestors(&self, id: &ObjectId) -> HashSet<ObjectId> {
        let mut seen = HashSet::new();
        let mut stack: Vec<ObjectId> = self
            .commits
            .get(id)
            .map(|c| c.parents.clone())
            .unwrap_or_default();
        while let Some(next) = stack.pop() {
            if seen.insert(next) {
                if let Some(commit) = self.commits.get(&next) {
                    stack.extend(commit.parents.iter().copied());
                }
            }
        }
        seen
    }

    pub fn is_ancestor(&self, ancestor: &ObjectId, of: &ObjectId) -> bool {
        self.ancestors(of).contains(ancestor)
    }

    /// Build a head for `value`, listing every reachable commit
    pub fn head_for(&self, value: ObjectId) -> Head {
        let mut ancestors: Vec<ObjectId> = self.log(&value, usize::MAX).iter().map(|c| c.id).collect();
        ancestors.retain(|id| *id != value);
        Head { value, ancestors }
    }

    /// Nearest common ancestor of two commits
    pub fn merge_base(&self, a: &ObjectId, b: &ObjectId) -> Option<ObjectId> {
        let mut from_a = self.ancestors(a);
        from_a.insert(*a);
        // Breadth-first from b finds the nearest shared commit
        self.log(b, usize::MAX)
            .into_iter()
            .map(|c| c.id)
            .find(|id| from_a.contains(id))
    }
}

/// Result of a three-way outline merge
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MergeOutcome {
    pub tree: WorkingTree,
    /// Local ids of nodes edited differently on both sides; "ours" was kept
    pub conflicts: Vec<String>,
}

/// Three-way merge of working trees, node by node keyed by local id.
///
/// Content changed on one side only takes that side. Children keep "ours"
/// order with nodes added only by "theirs" appended. A node deleted on one
/// side is dropped unless the other side edited it.
pub fn merge_trees(base: &WorkingTree, ours: &WorkingTree, theirs: &WorkingTree) -> MergeOutcome {
    let base_index = index(base);
    let ours_index = index(ours);
    let theirs_index = index(theirs);
    let mut conflicts = Vec::new();
    let tree = merge_node(
        Some(base),
        ours,
        Some(theirs),
        &Indexes {
            base: &base_index,
            ours: &ours_index,
            theirs: &theirs_index,
        },
        &mut conflicts,
    );
    MergeOutcome { tree, conflicts }
}

struct Indexes<'a> {
    base: &'a HashMap<&'a str, &'a WorkingTree>,
    ours: &'a HashMap<&'a str, &'a WorkingTree>,
    theirs: &'a HashMap<&'a str, &'a WorkingTree>,
}

fn index(tree: &WorkingTree) -> HashMap<&str, &WorkingTree> {
    let mut map = HashMap::new();
    let mut stack = vec![tree];
    while let Some(node) = stack.pop() {
        map.insert(node.id.as_str(), node);
        stack.extend(node.children.iter());
    }
    map
}

fn merge_node(
    base: Option<&WorkingTree>,
    ours: &WorkingTree,
    theirs: Option<&WorkingTree>,
    idx: &Indexes<'_>,
    conflicts: &mut Vec<String>,
) -> WorkingTree {
    let content = match (base, theirs) {
        (_, None) => ours.content.clone(),
        (Some(b), Some(t)) if ours.content == b.content => t.content.clone(),
        (Some(b), Some(t)) if t.content == b.content => ours.content.clone(),
        (_, Some(t)) if t.content == ours.content => ours.content.clone(),
        (_, Some(_)) => {
            conflicts.push(ours.id.clone());
            ours.content.clone()
        }
    };

    let mut children = Vec::new();
    for child in &ours.children {
        let child_base = idx.base.get(child.id.as_str()).copied();
        let child_theirs = idx.theirs.get(child.id.as_str()).copied();
        // Deleted by theirs and untouched by us
        if child_theirs.is_none() && child_base.is_some_and(|b| unchanged(b, child)) {
            continue;
        }
        children.push(merge_node(child_base, child, child_theirs, idx, conflicts));
    }
    if let Some(theirs) = theirs {
        for child in &theirs.children {
            if idx.ours.contains_key(child.id.as_str()) {
                continue;
            }
            let child_base = idx.base.get(child.id.as_str()).copied();
            match child_base {
                // Added by theirs
                None => children.push(strip_ids(child)),
                // Deleted by us; keep only if theirs edited it
                Some(b) if !unchanged(b, child) => {
                    conflicts.push(child.id.clone());
                    children.push(strip_ids(child));
                }
                Some(_) => {}
            }
        }
    }

    WorkingTree {
        id: ours.id.clone(),
        content,
        children,
        object_id: None,
    }
}

fn unchanged(a: &WorkingTree, b: &WorkingTree) -> bool {
    a.content == b.content
        && a.children.len() == b.children.len()
        && a.children.iter().zip(&b.children).all(|(x, y)| x.id == y.id && unchanged(x, y))
}

fn strip_ids(tree: &WorkingTree) -> WorkingTree {
    WorkingTree {
        id: tree.id.clone(),
        content: tree.content.clone(),
        children: tree.children.iter().map(strip_ids).collect(),
        object_id: None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::object::commit_tree;

    fn doc(content: &str) -> WorkingTree {
        WorkingTree::node(
            ROOT_LOCAL_ID,
            "",
            vec![
                WorkingTree::node("1", content, vec![WorkingTree::leaf("2", "child")]),
                WorkingTree::leaf("3", "tail"),
            ],
        )
    }

    fn graph_with(commits: &[(&WorkingTree, Vec<ObjectId>, i64)]) -> (CommitGraph, Vec<ObjectId>) {
        let mut all_commits = Vec::new();
        let mut all_trees = Vec::new();
        let mut ids = Vec::new();
        for (tree, parents, ts) in commits {
            let mut tree = (*tree).clone();
            let bundle = commit_tree("alice", parents.clone(), &mut tree, *ts, None);
            ids.push(bundle.commit_id());
            all_trees.extend(bundle.objects.clone());
            all_commits.push(bundle.commit);
        }
        (CommitGraph::new(all_commits, all_trees), ids)
    }

    #[test]
    fn test_checkout_roundtrip() {
        let original = doc("hello");
        let (graph, ids) = graph_with(&[(&original, vec![], 1)]);
        let mut restored = graph.checkout(&ids[0]).unwrap();
        assert_eq!(restored.content, original.content);
        assert_eq!(restored.children.len(), 2);
        assert_eq!(restored.children[0].children[0].id, "2");

        let again = commit_tree("alice", vec![], &mut restored, 1, None);
        assert_eq!(again.commit_id(), ids[0]);
    }

    #[test]
    fn test_checkout_older_commit() {
        let v1 = doc("one");
        let (mut graph, ids) = graph_with(&[(&v1, vec![], 1)]);
        let mut v2 = doc("two");
        let bundle = commit_tree("alice", vec![ids[0]], &mut v2, 2, None);
        graph = CommitGraph::new(
            [graph.commit(&ids[0]).cloned().unwrap(), bundle.commit.clone()],
            graph.trees.values().cloned().chain(bundle.objects.clone()),
        );
        assert_eq!(graph.checkout(&ids[0]).unwrap().children[0].content, "one");
        assert_eq!(graph.checkout(&bundle.commit_id()).unwrap().children[0].content, "two");
    }

    #[test]
    fn test_checkout_missing_tree() {
        let mut tree = doc("x");
        let bundle = commit_tree("alice", vec![], &mut tree, 1, None);
        let graph = CommitGraph::new([bundle.commit.clone()], []);
        assert!(matches!(graph.checkout(&bundle.commit_id()), Err(HistoryError::TreeNotFound(_))));
        assert!(matches!(
            graph.checkout(&ObjectId::from_data(b"nope")),
            Err(HistoryError::CommitNotFound(_))
        ));
    }

    #[test]
    fn test_compare_heads() {
        let a = ObjectId::from_data(b"a");
        let b = ObjectId::from_data(b"b");
        let c = ObjectId::from_data(b"c");
        let base = Head::initial(a);
        let local = Head::advance(b, [&base]);
        let remote = Head::advance(c, [&base]);
        assert_eq!(compare_heads(&local, &base), Divergence::LocalAhead);
        assert_eq!(compare_heads(&base, &local), Divergence::RemoteAhead);
        assert_eq!(compare_heads(&local, &remote), Divergence::Diverged);
        assert_eq!(compare_heads(&local, &local), Divergence::Equal);
    }

    #[test]
    fn test_merge_base_and_log() {
        let base_tree = doc("base");
        let (graph0, ids0) = graph_with(&[(&base_tree, vec![], 1)]);
        let root = ids0[0];
        let (g1, ids1) = graph_with(&[(&doc("left"), vec![root], 2), (&doc("right"), vec![root], 3)]);
        let graph = CommitGraph::new(
            graph0.commits.values().cloned().chain(g1.commits.values().cloned()),
            graph0.trees.values().cloned().chain(g1.trees.values().cloned()),
        );
        assert_eq!(graph.merge_base(&ids1[0], &ids1[1]), Some(root));
        assert!(graph.is_ancestor(&root, &ids1[0]));
        assert!(!graph.is_ancestor(&ids1[0], &ids1[1]));
        assert_eq!(graph.log(&ids1[0], 10).len(), 2);
        assert_eq!(graph.head_for(ids1[0]).ancestors, vec![root]);
    }

    #[test]
    fn test_merge_trees_takes_one_sided_edits() {
        let base = doc("base");
        let mut ours = doc("base");
        ours.children[1].content = "our tail".into();
        let theirs = doc("their title");
        let merged = merge_trees(&base, &ours, &theirs);
        assert!(merged.conflicts.is_empty());
        assert_eq!(merged.tree.children[0].content, "their title");
        assert_eq!(merged.tree.children[1].content, "our tail");
    }

    #[test]
    fn test_merge_trees_reports_conflicts() {
        let base = doc("base");
        let merged = merge_trees(&base, &doc("ours"), &doc("theirs"));
        assert_eq!(merged.conflicts, vec!["1".to_string()]);
        assert_eq!(merged.tree.children[0].content, "ours");
    }

    #[test]
    fn test_merge_trees_additions_and_deletions() {
        let base = doc("base");
        let mut ours = doc("base");
        ours.children.remove(1);
        let mut theirs = doc("base");
        theirs.children.push(WorkingTree::leaf("4", "new"));
        let merged = merge_trees(&base, &ours, &theirs);
        let ids: Vec<&str> = merged.tree.children.iter().map(|c| c.id.as_str()).collect();
        assert_eq!(ids, vec!["1", "4"]);
    }
}

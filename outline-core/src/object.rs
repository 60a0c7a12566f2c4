//! Core object model for outline documents
//!
//! Implements content-addressable storage with Tree and Commit objects,
//! similar to Git's object model but hashing outline nodes instead of files.
//! Identical subtrees always collide to the same id, so a save only has to
//! persist the objects whose ids are not already known to be durable.

use serde::{Deserialize, Deserializer, Serialize, Serializer};
use sha2::{Digest, Sha256};
use std::collections::HashSet;

/// Unique identifier for any stored object
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ObjectId([u8; 32]);

impl ObjectId {
    /// Create a new ObjectId from raw bytes
    pub fn new(bytes: [u8; 32]) -> Self {
        Self(bytes)
    }

    /// Compute ObjectId from data
    pub fn from_data(data: &[u8]) -> Self {
        let hash = Sha256::digest(data);
        Self(hash.into())
    }

    /// Convert to hexadecimal string
    pub fn to_hex(&self) -> String {
        hex::encode(self.0)
    }

    /// Parse from hexadecimal string
    pub fn from_hex(hex_str: &str) -> Result<Self, hex::FromHexError> {
        let bytes = hex::decode(hex_str)?;
        if bytes.len() != 32 {
            return Err(hex::FromHexError::InvalidStringLength);
        }
        let mut arr = [0u8; 32];
        arr.copy_from_slice(&bytes);
        Ok(Self(arr))
    }

    /// Get raw bytes
    pub fn as_bytes(&self) -> &[u8; 32] {
        &self.0
    }
}

impl std::fmt::Display for ObjectId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.to_hex())
    }
}

// Stored records and wire payloads carry ids as hex strings.
impl Serialize for ObjectId {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&self.to_hex())
    }
}

impl<'de> Deserialize<'de> for ObjectId {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let s = String::deserialize(deserializer)?;
        ObjectId::from_hex(&s).map_err(serde::de::Error::custom)
    }
}

/// Mutable outline as edited by the application.
///
/// `id` is the node's local id, stable across edits. `object_id` is filled in
/// by [`write_tree`] with the content address of the node.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct WorkingTree {
    pub id: String,
    pub content: String,
    #[serde(default)]
    pub children: Vec<WorkingTree>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub object_id: Option<ObjectId>,
}

impl WorkingTree {
    /// Create a leaf node
    pub fn leaf(id: impl Into<String>, content: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            content: content.into(),
            children: Vec::new(),
            object_id: None,
        }
    }

    /// Create a node with children
    pub fn node(id: impl Into<String>, content: impl Into<String>, children: Vec<WorkingTree>) -> Self {
        Self {
            id: id.into(),
            content: content.into(),
            children,
            object_id: None,
        }
    }

    /// Number of nodes in this subtree, including the root
    pub fn node_count(&self) -> usize {
        1 + self.children.iter().map(WorkingTree::node_count).sum::<usize>()
    }

    /// Find a node by local id
    pub fn find(&self, id: &str) -> Option<&WorkingTree> {
        if self.id == id {
            return Some(self);
        }
        self.children.iter().find_map(|c| c.find(id))
    }
}

/// Immutable outline node
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TreeObject {
    pub id: ObjectId,
    pub content: String,
    /// `(child object id, child local id)` in sibling order
    pub children: Vec<(ObjectId, String)>,
}

impl TreeObject {
    /// Create a tree object, computing its content address
    pub fn new(content: String, children: Vec<(ObjectId, String)>) -> Self {
        let id = Self::compute_id(&content, &children);
        Self { id, content, children }
    }

    /// `hash(content + "\n" + join("\n", child_id + " " + local_id))`
    pub fn compute_id(content: &str, children: &[(ObjectId, String)]) -> ObjectId {
        let mut buf = String::with_capacity(content.len() + 1 + children.len() * 72);
        buf.push_str(content);
        buf.push('\n');
        let lines: Vec<String> = children
            .iter()
            .map(|(id, local)| format!("{} {}", id, local))
            .collect();
        buf.push_str(&lines.join("\n"));
        ObjectId::from_data(buf.as_bytes())
    }

    /// Whether the stored id matches the content
    pub fn verify(&self) -> bool {
        Self::compute_id(&self.content, &self.children) == self.id
    }
}

/// Commit object
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Commit {
    pub id: ObjectId,
    /// Root tree object
    pub tree: ObjectId,
    /// Parent commit IDs (empty for initial commit)
    pub parents: Vec<ObjectId>,
    pub author: String,
    /// Commit timestamp (Unix milliseconds)
    pub timestamp: i64,
}

impl Commit {
    /// Create a new commit, computing its id
    pub fn new(tree: ObjectId, parents: Vec<ObjectId>, author: String, timestamp: i64) -> Self {
        let id = Self::compute_id(&tree, &parents, &author, timestamp);
        Self {
            id,
            tree,
            parents,
            author,
            timestamp,
        }
    }

    /// `hash(tree + "\n" + join("\n", parents) + "\n" + author + " " + timestamp)`
    pub fn compute_id(tree: &ObjectId, parents: &[ObjectId], author: &str, timestamp: i64) -> ObjectId {
        let parents: Vec<String> = parents.iter().map(ObjectId::to_hex).collect();
        let data = format!("{}\n{}\n{} {}", tree, parents.join("\n"), author, timestamp);
        ObjectId::from_data(data.as_bytes())
    }

    /// Check if this is an initial commit (no parents)
    pub fn is_initial(&self) -> bool {
        self.parents.is_empty()
    }
}

/// Mutable head pointer of a document's commit history
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Head {
    pub value: ObjectId,
    /// Every commit reachable from `value`, newest first
    #[serde(default)]
    pub ancestors: Vec<ObjectId>,
}

impl Head {
    /// Head for a first commit
    pub fn initial(value: ObjectId) -> Self {
        Self {
            value,
            ancestors: Vec::new(),
        }
    }

    /// Advance to `value`, folding every previous head into the ancestor list
    pub fn advance<'a>(value: ObjectId, previous: impl IntoIterator<Item = &'a Head>) -> Self {
        let mut seen = HashSet::new();
        let mut ancestors = Vec::new();
        for head in previous {
            for id in std::iter::once(&head.value).chain(head.ancestors.iter()) {
                if *id != value && seen.insert(*id) {
                    ancestors.push(*id);
                }
            }
        }
        Self { value, ancestors }
    }

    /// True when `other` is strictly behind this head
    pub fn contains(&self, other: &ObjectId) -> bool {
        self.ancestors.contains(other)
    }
}

/// Per-document metadata, last-writer-wins by `updated_at`
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Metadata {
    #[serde(default)]
    pub name: Option<String>,
    pub created_at: i64,
    pub updated_at: i64,
    /// Card tree that superseded this document, if it was migrated
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub migrated_to: Option<String>,
}

impl Metadata {
    pub fn new(name: Option<String>, now: i64) -> Self {
        Self {
            name,
            created_at: now,
            updated_at: now,
            migrated_to: None,
        }
    }
}

/// Everything a document namespace can hold, discriminated by `type`
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "lowercase")]
pub enum Record {
    Commit(Commit),
    Tree(TreeObject),
    Ref(Head),
    Metadata(Metadata),
}

impl Record {
    /// Discriminator as stored in the `type` field
    pub fn kind(&self) -> &'static str {
        match self {
            Record::Commit(_) => "commit",
            Record::Tree(_) => "tree",
            Record::Ref(_) => "ref",
            Record::Metadata(_) => "metadata",
        }
    }

    /// Content address for immutable records
    pub fn object_id(&self) -> Option<ObjectId> {
        match self {
            Record::Commit(c) => Some(c.id),
            Record::Tree(t) => Some(t.id),
            Record::Ref(_) | Record::Metadata(_) => None,
        }
    }
}

/// Hash every node of `tree` bottom-up, annotating each node with its id.
///
/// Children precede their parents in the returned list. Subtrees that hash to
/// an id already emitted are listed once.
pub fn write_tree(tree: &mut WorkingTree) -> Vec<TreeObject> {
    let mut out = Vec::new();
    let mut seen = HashSet::new();
    write_node(tree, &mut out, &mut seen);
    out
}

fn write_node(node: &mut WorkingTree, out: &mut Vec<TreeObject>, seen: &mut HashSet<ObjectId>) -> ObjectId {
    let mut children = Vec::with_capacity(node.children.len());
    for child in node.children.iter_mut() {
        let id = write_node(child, out, seen);
        children.push((id, child.id.clone()));
    }
    let object = TreeObject::new(node.content.clone(), children);
    let id = object.id;
    node.object_id = Some(id);
    if seen.insert(id) {
        out.push(object);
    }
    id
}

/// Output of [`commit_tree`], ready for a single bulk write
#[derive(Debug, Clone)]
pub struct CommitBundle {
    pub commit: Commit,
    pub objects: Vec<TreeObject>,
    pub metadata: Option<Metadata>,
}

impl CommitBundle {
    pub fn commit_id(&self) -> ObjectId {
        self.commit.id
    }

    /// Immutable records in write order: trees first, then the commit
    pub fn immutable_records(&self) -> impl Iterator<Item = Record> + '_ {
        self.objects
            .iter()
            .cloned()
            .map(Record::Tree)
            .chain(std::iter::once(Record::Commit(self.commit.clone())))
    }
}

/// Hash `tree` and build the commit on top of `parents`
pub fn commit_tree(
    author: &str,
    parents: Vec<ObjectId>,
    tree: &mut WorkingTree,
    timestamp: i64,
    metadata: Option<Metadata>,
) -> CommitBundle {
    let objects = write_tree(tree);
    // write_tree always emits the root last
    let root = tree.object_id.unwrap_or_else(|| TreeObject::compute_id(&tree.content, &[]));
    let commit = Commit::new(root, parents, author.to_string(), timestamp);
    CommitBundle {
        commit,
        objects,
        metadata,
    }
}

//! Core record types for the perspective/commit data layer.
//!
//! Perspectives are branch-like pointers into a context's commit history;
//! commits are immutable snapshots; text nodes are the tree-document
//! fragments commits point at. All three are content-addressed: their ids
//! are pure functions of their canonical fields (see `cid`).

use serde::{Deserialize, Serialize};
use std::fmt;

/// Content-derived identifier. Self-describing string encoding of a hash
/// over an object's canonical fields (see `cid::generate_id`).
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Cid(String);

impl Cid {
    pub fn new(s: impl Into<String>) -> Self {
        Cid(s.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for Cid {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for Cid {
    fn from(s: &str) -> Self {
        Cid(s.to_string())
    }
}

/// Name of a registered backend adapter (e.g. "eth", "ipfs", "rest").
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct BackendId(String);

impl BackendId {
    pub fn new(s: impl Into<String>) -> Self {
        BackendId(s.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for BackendId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// A branch-like pointer into a context's history.
///
/// `origin` names the authoritative backend: head and ownership reads must
/// always be resolved from `origin`, never from the cache, so that a
/// non-authoritative source cannot spoof state.
///
/// Canonical field order: origin, creatorId, timestamp, context, name.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Perspective {
    pub id: Option<Cid>,
    pub origin: BackendId,
    pub creator_id: String,
    pub timestamp: i64,
    pub context: String,
    pub name: String,
}

/// An immutable snapshot. Merge commits have two or more parents.
///
/// Canonical field order: creatorId, timestamp, message, parentsIds, dataId.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Commit {
    pub id: Option<Cid>,
    pub creator_id: String,
    pub timestamp: i64,
    pub message: String,
    pub parents_ids: Vec<Cid>,
    pub data_id: Cid,
}

/// Document node style.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum NodeType {
    Title,
    Paragraph,
}

impl NodeType {
    pub fn as_str(&self) -> &'static str {
        match self {
            NodeType::Title => "title",
            NodeType::Paragraph => "paragraph",
        }
    }
}

impl fmt::Display for NodeType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A tree-document fragment. `links` reference child *perspective* ids, not
/// commit ids; this indirection is what lets subtrees evolve and merge
/// independently of their parent.
///
/// Canonical field order: text, links, doc_node_type.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TextNode {
    pub id: Option<Cid>,
    pub text: String,
    pub doc_node_type: NodeType,
    pub links: Vec<Cid>,
}

impl TextNode {
    /// Single point to initialize empty text nodes.
    pub fn empty(text: impl Into<String>, doc_node_type: NodeType) -> Self {
        TextNode {
            id: None,
            text: text.into(),
            doc_node_type,
            links: Vec::new(),
        }
    }
}

/// Uncommitted local working state of a perspective. Never hashed, never
/// given an id of its own; superseded by a commit on flush. The draft is
/// stale when `base_commit_id` no longer equals the perspective's head.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Draft {
    pub base_commit_id: Option<Cid>,
    pub node: TextNode,
}

/// A proposed head move produced by a merge. Accumulated by the merge
/// engine and applied (or discarded) atomically by the caller.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct HeadUpdate {
    pub perspective_id: Cid,
    pub head_id: Cid,
}

/// Head update entry inside a merge request, keyed by the hash of the
/// perspective id under the target backend's hash algorithm.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RequestHeadUpdate {
    pub perspective_id_hash: String,
    pub head_id: Cid,
    pub executed: u32,
}

/// A batched, owner-approved set of proposed head updates hosted on an
/// authoritative backend.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MergeRequest {
    pub id: Option<String>,
    pub to_perspective_id: Cid,
    pub from_perspective_id: Cid,
    pub owner: String,
    pub nonce: Option<u64>,
    pub head_updates: Vec<RequestHeadUpdate>,
    pub approved_addresses: Vec<String>,
    pub status: Option<u32>,
    pub authorized: Option<u32>,
}

/// Materialized perspective: head, draft and owner resolved, with links
/// expanded recursively up to the requested depth.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PerspectiveFull {
    pub id: Cid,
    pub origin: BackendId,
    pub creator_id: String,
    pub owner: Option<String>,
    pub timestamp: i64,
    pub context: String,
    pub name: String,
    pub draft: Option<TextNodeFull>,
    pub head: Option<CommitFull>,
}

/// Materialized commit with its data nested.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CommitFull {
    pub id: Cid,
    pub creator_id: String,
    pub timestamp: i64,
    pub message: String,
    pub parents_ids: Vec<Cid>,
    pub data: Option<TextNodeFull>,
}

/// Materialized text node with perspectives in place of links.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TextNodeFull {
    pub id: Option<Cid>,
    pub text: String,
    pub doc_node_type: NodeType,
    pub links: Vec<PerspectiveFull>,
}

/// Flattened read view: text and style only, draft-if-present else head
/// data, children in link order.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TextNodeTree {
    pub id: Cid,
    pub text: String,
    pub doc_node_type: NodeType,
    pub links: Vec<TextNodeTree>,
}

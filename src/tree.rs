//! Tree-document service over the router and the draft store.
//!
//! All editing operations mutate drafts, never commits. A perspective moves
//! through `Committed -> Drafted -> Committed` on edit and flush; a remote
//! head observed while drafted makes the draft stale, and `pull` reconciles
//! it by merging rather than discarding either side.
//!
//! Recursive operations fix their traversal order per operation: `commit`
//! and `create_global_perspective` run bottom-up (children first, so the
//! parent can reference the children's new ids), `pull` runs parent-first
//! (the parent's reconciled links decide which children exist). Child
//! fan-ins are all-or-nothing: the first failure aborts the whole
//! operation.

use crate::cid::{self, Canonical, CanonicalWriter, CidConfig};
use crate::error::TreeError;
use crate::merge::{self, DraftContentMergeStrategy, MergeStrategy};
use crate::router::Router;
use crate::store::DraftStore;
use crate::types::{
    BackendId, Cid, Commit, CommitFull, Draft, NodeType, Perspective, PerspectiveFull, TextNode,
    TextNodeFull, TextNodeTree,
};
use chrono::Utc;
use futures::future::{try_join_all, BoxFuture};
use parking_lot::Mutex;
use std::collections::HashSet;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tracing::{debug, instrument};

/// Seed record hashed into a fresh context id. Contexts carry no state of
/// their own; the nonce keeps two seeds distinct even when they share a
/// creator and a millisecond.
struct ContextSeed {
    creator_id: String,
    timestamp: i64,
    nonce: u64,
}

impl Canonical for ContextSeed {
    fn canonical_bytes(&self) -> Vec<u8> {
        let mut w = CanonicalWriter::new("context");
        w.str_field("creatorId", &self.creator_id);
        w.i64_field("timestamp", self.timestamp);
        w.i64_field("nonce", self.nonce as i64);
        w.finish()
    }
}

pub struct TreeService {
    router: Arc<Router>,
    creator_id: String,
    seed_nonce: AtomicU64,
}

impl TreeService {
    pub fn new(router: Arc<Router>, creator_id: impl Into<String>) -> Self {
        TreeService {
            router,
            creator_id: creator_id.into(),
            seed_nonce: AtomicU64::new(0),
        }
    }

    pub fn router(&self) -> &Arc<Router> {
        &self.router
    }

    // ---- drafts ----

    pub fn get_draft(&self, perspective_id: &Cid) -> Result<Option<TextNode>, TreeError> {
        Ok(self
            .router
            .cache()
            .get_draft(perspective_id)?
            .map(|draft| draft.node))
    }

    /// Store `node` as the draft of a perspective, recording the current
    /// head as the draft's base. The base is what `pull` later three-way
    /// merges against. Drafts never carry a data id; the id of a node
    /// copied from committed data belongs to that commit's data, not to
    /// the draft that will diverge from it.
    pub async fn set_draft(&self, perspective_id: &Cid, mut node: TextNode) -> Result<(), TreeError> {
        node.id = None;
        let base_commit_id = self.router.get_head(perspective_id).await?;
        self.router.cache().set_draft(
            perspective_id,
            Draft {
                base_commit_id,
                node,
            },
        )?;
        Ok(())
    }

    /// Head data of a perspective, or `None` when it has no head yet.
    pub async fn get_perspective_data(
        &self,
        perspective_id: &Cid,
    ) -> Result<Option<TextNode>, TreeError> {
        let head = match self.router.get_head(perspective_id).await? {
            Some(head) => head,
            None => return Ok(None),
        };
        let commit = match self.router.get_commit(&head).await? {
            Some(commit) => commit,
            None => return Ok(None),
        };
        Ok(self.router.get_data(&commit.data_id).await?)
    }

    /// Draft if present, committed data otherwise.
    async fn applicable_data(&self, perspective_id: &Cid) -> Result<Option<TextNode>, TreeError> {
        if let Some(draft) = self.get_draft(perspective_id)? {
            return Ok(Some(draft));
        }
        self.get_perspective_data(perspective_id).await
    }

    /// The existing draft, or a new one seeded from the perspective's
    /// committed data (an empty paragraph when there is none).
    pub async fn get_or_create_draft(&self, perspective_id: &Cid) -> Result<TextNode, TreeError> {
        if let Some(draft) = self.get_draft(perspective_id)? {
            return Ok(draft);
        }

        let mut seed = self
            .get_perspective_data(perspective_id)
            .await?
            .unwrap_or_else(|| TextNode::empty("", NodeType::Paragraph));
        seed.id = None;
        self.set_draft(perspective_id, seed.clone()).await?;
        Ok(seed)
    }

    /// Update only the text of the draft, leaving type and links untouched.
    pub async fn set_draft_text(
        &self,
        perspective_id: &Cid,
        text: impl Into<String>,
    ) -> Result<TextNode, TreeError> {
        let mut draft = self.get_or_create_draft(perspective_id).await?;
        draft.text = text.into();
        self.set_draft(perspective_id, draft.clone()).await?;
        Ok(draft)
    }

    /// Update only the node type of the draft.
    pub async fn set_draft_type(
        &self,
        perspective_id: &Cid,
        doc_node_type: NodeType,
    ) -> Result<TextNode, TreeError> {
        let mut draft = self.get_or_create_draft(perspective_id).await?;
        draft.doc_node_type = doc_node_type;
        self.set_draft(perspective_id, draft.clone()).await?;
        Ok(draft)
    }

    // ---- seeding ----

    /// Create a fresh context id and a first perspective under it, with a
    /// seeded draft. Returns the perspective id.
    pub async fn init_context(
        &self,
        backend_id: &BackendId,
        content: impl Into<String>,
        doc_node_type: NodeType,
        timestamp: i64,
    ) -> Result<Cid, TreeError> {
        let seed = ContextSeed {
            creator_id: self.creator_id.clone(),
            timestamp,
            nonce: self.seed_nonce.fetch_add(1, Ordering::Relaxed),
        };
        let context = cid::generate_id(&seed, &CidConfig::default());
        self.init_perspective(backend_id, context.as_str(), content, doc_node_type)
            .await
    }

    /// Create a perspective on an existing context and seed its draft.
    pub async fn init_perspective(
        &self,
        backend_id: &BackendId,
        context: impl Into<String>,
        content: impl Into<String>,
        doc_node_type: NodeType,
    ) -> Result<Cid, TreeError> {
        let perspective = Perspective {
            id: None,
            origin: backend_id.clone(),
            creator_id: self.creator_id.clone(),
            timestamp: Utc::now().timestamp_millis(),
            context: context.into(),
            name: "first".to_string(),
        };
        let perspective_id = self
            .router
            .create_perspective_in(backend_id, perspective)
            .await?;

        self.set_draft(&perspective_id, TextNode::empty(content, doc_node_type))
            .await?;
        Ok(perspective_id)
    }

    /// Create a fresh context and perspective and splice it into an
    /// existing perspective's draft links at `index` (`-1` appends).
    pub async fn init_context_under(
        &self,
        backend_id: &BackendId,
        parent_id: &Cid,
        index: isize,
        content: impl Into<String>,
        doc_node_type: NodeType,
    ) -> Result<Cid, TreeError> {
        let child_id = self
            .init_context(
                backend_id,
                content,
                doc_node_type,
                Utc::now().timestamp_millis(),
            )
            .await?;
        self.insert_perspective(parent_id, &child_id, index).await?;
        Ok(child_id)
    }

    // ---- structural edits ----

    /// Splice `child_id` into the parent's draft links at `index`; `-1`
    /// appends. An index past the end is an out-of-range error, raised
    /// before any mutation.
    #[instrument(skip(self), fields(parent = %parent_id, child = %child_id))]
    pub async fn insert_perspective(
        &self,
        parent_id: &Cid,
        child_id: &Cid,
        index: isize,
    ) -> Result<(), TreeError> {
        let mut draft = self.get_or_create_draft(parent_id).await?;

        if index == -1 || index as usize == draft.links.len() {
            draft.links.push(child_id.clone());
        } else if index >= 0 && (index as usize) < draft.links.len() {
            draft.links.insert(index as usize, child_id.clone());
        } else {
            return Err(TreeError::MissingParent(format!(
                "{parent_id} has no slot at index {index}"
            )));
        }

        self.set_draft(parent_id, draft).await?;
        Ok(())
    }

    /// Remove the child at `index` from the parent's draft links. The
    /// removed subtree goes with it.
    #[instrument(skip(self), fields(parent = %parent_id))]
    pub async fn remove_perspective(
        &self,
        parent_id: &Cid,
        index: usize,
    ) -> Result<Cid, TreeError> {
        let mut draft = self.get_or_create_draft(parent_id).await?;

        if index >= draft.links.len() {
            return Err(TreeError::MissingParent(format!(
                "{parent_id} has no child at index {index}"
            )));
        }
        let removed = draft.links.remove(index);

        self.set_draft(parent_id, draft).await?;
        Ok(removed)
    }

    async fn node_style(&self, perspective_id: &Cid) -> Result<NodeType, TreeError> {
        Ok(self
            .applicable_data(perspective_id)
            .await?
            .map(|data| data.doc_node_type)
            .unwrap_or(NodeType::Paragraph))
    }

    async fn child_at(&self, parent_id: &Cid, index: usize) -> Result<Cid, TreeError> {
        let links = self
            .applicable_data(parent_id)
            .await?
            .map(|data| data.links)
            .unwrap_or_default();
        links.get(index).cloned().ok_or_else(|| {
            TreeError::MissingParent(format!("{parent_id} has no child at index {index}"))
        })
    }

    /// Move a title block one level up: out of its parent, in as the
    /// parent's next sibling under the grandparent. Non-title blocks are
    /// left alone. Removal and insertion run sequentially; index validity
    /// depends on the ordering.
    pub async fn indent_left(
        &self,
        grandparent_id: &Cid,
        parent_id: &Cid,
        index: usize,
    ) -> Result<(), TreeError> {
        let block_id = self.child_at(parent_id, index).await?;
        if self.node_style(&block_id).await? != NodeType::Title {
            return Ok(());
        }

        let grandparent_links = self
            .applicable_data(grandparent_id)
            .await?
            .map(|data| data.links)
            .unwrap_or_default();
        let parent_index = grandparent_links
            .iter()
            .position(|id| id == parent_id)
            .ok_or_else(|| {
                TreeError::MissingParent(format!("{parent_id} is not a child of {grandparent_id}"))
            })?;

        self.remove_perspective(parent_id, index).await?;
        self.insert_perspective(grandparent_id, &block_id, (parent_index + 1) as isize)
            .await?;
        Ok(())
    }

    /// Change a block's style and re-parent accordingly.
    ///
    /// Title to paragraph moves all the block's children up as its younger
    /// siblings. Paragraph to title moves the block's younger siblings
    /// (up to the next title) down as its children. Every removal and
    /// insertion runs sequentially.
    pub async fn set_style(
        &self,
        parent_id: &Cid,
        index: usize,
        new_style: NodeType,
    ) -> Result<(), TreeError> {
        let block_id = self.child_at(parent_id, index).await?;
        let old_style = self.node_style(&block_id).await?;
        if old_style == new_style {
            return Ok(());
        }

        self.set_draft_type(&block_id, new_style).await?;

        match (old_style, new_style) {
            (NodeType::Title, NodeType::Paragraph) => {
                let children = self
                    .applicable_data(&block_id)
                    .await?
                    .map(|data| data.links)
                    .unwrap_or_default();

                for _ in 0..children.len() {
                    self.remove_perspective(&block_id, 0).await?;
                }
                for (offset, child_id) in children.iter().enumerate() {
                    self.insert_perspective(parent_id, child_id, (index + offset + 1) as isize)
                        .await?;
                }
            }
            (NodeType::Paragraph, NodeType::Title) => {
                let siblings = self
                    .applicable_data(parent_id)
                    .await?
                    .map(|data| data.links)
                    .unwrap_or_default();

                let mut adopted: Vec<Cid> = Vec::new();
                for sibling_id in siblings.iter().skip(index + 1) {
                    if self.node_style(sibling_id).await? == NodeType::Title {
                        break;
                    }
                    adopted.push(sibling_id.clone());
                }

                for _ in 0..adopted.len() {
                    self.remove_perspective(parent_id, index + 1).await?;
                }
                for sibling_id in &adopted {
                    self.insert_perspective(&block_id, sibling_id, -1).await?;
                }
            }
            _ => {}
        }
        Ok(())
    }

    // ---- materialized reads ----

    /// Materialize a perspective with head, draft and owner resolved, and
    /// links expanded `levels` deep (`-1` unbounded, `0` no recursion).
    /// A perspective recurring on its own expansion path is a cycle error.
    pub async fn get_perspective_full(
        &self,
        perspective_id: &Cid,
        levels: i64,
    ) -> Result<PerspectiveFull, TreeError> {
        let mut path = HashSet::new();
        self.perspective_full_inner(perspective_id, levels, &mut path)
            .await
    }

    fn perspective_full_inner<'a>(
        &'a self,
        perspective_id: &'a Cid,
        levels: i64,
        path: &'a mut HashSet<Cid>,
    ) -> BoxFuture<'a, Result<PerspectiveFull, TreeError>> {
        Box::pin(async move {
            if !path.insert(perspective_id.clone()) {
                return Err(TreeError::CycleDetected(perspective_id.clone()));
            }

            let perspective = self
                .router
                .get_perspective(perspective_id)
                .await?
                .ok_or_else(|| TreeError::PerspectiveNotFound(perspective_id.clone()))?;
            let owner = self.router.get_perspective_owner(perspective_id).await?;

            let draft = match self.get_draft(perspective_id)? {
                Some(node) => Some(self.text_node_full_inner(&node, levels, path).await?),
                None => None,
            };

            let head = match self.router.get_head(perspective_id).await? {
                Some(head_id) => self.commit_full_inner(&head_id, levels, path).await?,
                None => None,
            };

            path.remove(perspective_id);

            Ok(PerspectiveFull {
                id: perspective_id.clone(),
                origin: perspective.origin,
                creator_id: perspective.creator_id,
                owner,
                timestamp: perspective.timestamp,
                context: perspective.context,
                name: perspective.name,
                draft,
                head,
            })
        })
    }

    async fn commit_full_inner(
        &self,
        commit_id: &Cid,
        levels: i64,
        path: &mut HashSet<Cid>,
    ) -> Result<Option<CommitFull>, TreeError> {
        let commit = match self.router.get_commit(commit_id).await? {
            Some(commit) => commit,
            None => return Ok(None),
        };

        let data = match self.router.get_data(&commit.data_id).await? {
            Some(node) => Some(self.text_node_full_inner(&node, levels, path).await?),
            None => None,
        };

        Ok(Some(CommitFull {
            id: commit_id.clone(),
            creator_id: commit.creator_id,
            timestamp: commit.timestamp,
            message: commit.message,
            parents_ids: commit.parents_ids,
            data,
        }))
    }

    async fn text_node_full_inner(
        &self,
        node: &TextNode,
        levels: i64,
        path: &mut HashSet<Cid>,
    ) -> Result<TextNodeFull, TreeError> {
        let mut links = Vec::new();
        if levels != 0 {
            let next = if levels > 0 { levels - 1 } else { levels };
            // Sequential to keep link order.
            for link in &node.links {
                links.push(self.perspective_full_inner(link, next, path).await?);
            }
        }

        Ok(TextNodeFull {
            id: node.id.clone(),
            text: node.text.clone(),
            doc_node_type: node.doc_node_type,
            links,
        })
    }

    /// Flattened read view of a subtree: draft-if-present else head data,
    /// children in link order. `None` when the perspective carries no data
    /// at all.
    pub async fn to_text_node_tree(
        &self,
        perspective_id: &Cid,
    ) -> Result<Option<TextNodeTree>, TreeError> {
        let mut path = HashSet::new();
        self.text_node_tree_inner(perspective_id, &mut path).await
    }

    fn text_node_tree_inner<'a>(
        &'a self,
        perspective_id: &'a Cid,
        path: &'a mut HashSet<Cid>,
    ) -> BoxFuture<'a, Result<Option<TextNodeTree>, TreeError>> {
        Box::pin(async move {
            if !path.insert(perspective_id.clone()) {
                return Err(TreeError::CycleDetected(perspective_id.clone()));
            }

            let data = match self.applicable_data(perspective_id).await? {
                Some(data) => data,
                None => {
                    path.remove(perspective_id);
                    return Ok(None);
                }
            };

            let mut links = Vec::new();
            for link in &data.links {
                if let Some(subtree) = self.text_node_tree_inner(link, path).await? {
                    links.push(subtree);
                }
            }

            path.remove(perspective_id);

            Ok(Some(TextNodeTree {
                id: perspective_id.clone(),
                text: data.text,
                doc_node_type: data.doc_node_type,
                links,
            }))
        })
    }

    // ---- publishing ----

    /// Publish a local subtree as a brand-new perspective tree on
    /// `backend_id`. Children are branched first so the parent's new
    /// commit can point at their new ids. A subtree with no draft and no
    /// changed children reuses its head commit; the source subtree is
    /// never mutated.
    #[instrument(skip(self), fields(root = %perspective_id, backend = %backend_id))]
    pub async fn create_global_perspective(
        &self,
        backend_id: &BackendId,
        perspective_id: &Cid,
        name: &str,
    ) -> Result<Cid, TreeError> {
        let mut path = HashSet::new();
        self.branch_inner(backend_id, perspective_id, name, &mut path)
            .await
    }

    fn branch_inner<'a>(
        &'a self,
        backend_id: &'a BackendId,
        perspective_id: &'a Cid,
        name: &'a str,
        path: &'a mut HashSet<Cid>,
    ) -> BoxFuture<'a, Result<Cid, TreeError>> {
        Box::pin(async move {
            if !path.insert(perspective_id.clone()) {
                return Err(TreeError::CycleDetected(perspective_id.clone()));
            }

            let perspective = self
                .router
                .get_perspective(perspective_id)
                .await?
                .ok_or_else(|| TreeError::PerspectiveNotFound(perspective_id.clone()))?;
            let head = self.router.get_head(perspective_id).await?;
            let has_draft = self.get_draft(perspective_id)?.is_some();
            let data = self.applicable_data(perspective_id).await?;

            // Sequential bottom-up; each child subtree is fully branched
            // before the parent commit is assembled.
            let links = data.as_ref().map(|d| d.links.clone()).unwrap_or_default();
            let mut new_links = Vec::with_capacity(links.len());
            for child_id in &links {
                new_links.push(self.branch_inner(backend_id, child_id, name, path).await?);
            }

            let children_changed = new_links != links;
            let new_head = match &data {
                Some(data) if has_draft || children_changed => {
                    let node = TextNode {
                        id: None,
                        text: data.text.clone(),
                        doc_node_type: data.doc_node_type,
                        links: new_links,
                    };
                    let data_id = self.router.create_data_in(backend_id, node).await?;
                    let commit = Commit {
                        id: None,
                        creator_id: self.creator_id.clone(),
                        timestamp: Utc::now().timestamp_millis(),
                        message: format!("creating new global perspective {name}"),
                        parents_ids: head.iter().cloned().collect(),
                        data_id,
                    };
                    Some(self.router.create_commit_in(backend_id, commit).await?)
                }
                _ => head,
            };

            let new_perspective = Perspective {
                id: None,
                origin: backend_id.clone(),
                creator_id: self.creator_id.clone(),
                timestamp: Utc::now().timestamp_millis(),
                context: perspective.context,
                name: name.to_string(),
            };
            let new_perspective_id = self
                .router
                .create_perspective_in(backend_id, new_perspective)
                .await?;

            if let Some(commit_id) = new_head {
                self.router
                    .update_head(&new_perspective_id, Some(commit_id))
                    .await?;
            }

            path.remove(perspective_id);
            Ok(new_perspective_id)
        })
    }

    // ---- committing ----

    /// Flush drafts to commits, bottom-up. With `recurse`, every child
    /// reachable through the current draft or data is committed first,
    /// concurrently. A perspective with no draft is a no-op at its own
    /// level.
    #[instrument(skip(self, message), fields(root = %perspective_id, backend = %backend_id))]
    pub async fn commit(
        &self,
        backend_id: &BackendId,
        perspective_id: &Cid,
        message: &str,
        timestamp: i64,
        recurse: bool,
    ) -> Result<(), TreeError> {
        let visited = Mutex::new(HashSet::new());
        self.commit_inner(backend_id, perspective_id, message, timestamp, recurse, &visited)
            .await
    }

    fn commit_inner<'a>(
        &'a self,
        backend_id: &'a BackendId,
        perspective_id: &'a Cid,
        message: &'a str,
        timestamp: i64,
        recurse: bool,
        visited: &'a Mutex<HashSet<Cid>>,
    ) -> BoxFuture<'a, Result<(), TreeError>> {
        Box::pin(async move {
            if !visited.lock().insert(perspective_id.clone()) {
                return Ok(());
            }

            let draft = self.get_draft(perspective_id)?;
            let applicable = match &draft {
                Some(node) => Some(node.clone()),
                None => self.get_perspective_data(perspective_id).await?,
            };
            let applicable = match applicable {
                Some(data) => data,
                None => return Ok(()),
            };

            if recurse {
                try_join_all(applicable.links.iter().map(|link| {
                    self.commit_inner(backend_id, link, message, timestamp, recurse, visited)
                }))
                .await?;
            }

            let draft = match draft {
                Some(draft) => draft,
                None => return Ok(()),
            };

            let data_id = self.router.create_data_in(backend_id, draft).await?;
            let head = self.router.get_head(perspective_id).await?;
            let commit = Commit {
                id: None,
                creator_id: self.creator_id.clone(),
                timestamp,
                message: message.to_string(),
                parents_ids: head.into_iter().collect(),
                data_id,
            };
            let commit_id = self.router.create_commit_in(backend_id, commit).await?;

            self.router
                .update_head(perspective_id, Some(commit_id))
                .await?;
            self.router.cache().remove_draft(perspective_id)?;

            debug!(perspective = %perspective_id, "draft flushed to commit");
            Ok(())
        })
    }

    // ---- pulling ----

    /// Reconcile a subtree with its authoritative backends, parent first,
    /// children concurrently. Per perspective: adopt the remote head when
    /// the local head is its ancestor, otherwise synthesize a merge commit
    /// over both heads; then three-way merge any local draft against the
    /// updated head.
    #[instrument(skip(self), fields(root = %perspective_id))]
    pub async fn pull(&self, perspective_id: &Cid) -> Result<(), TreeError> {
        let visited = Mutex::new(HashSet::new());
        self.pull_inner(perspective_id, &visited).await
    }

    fn pull_inner<'a>(
        &'a self,
        perspective_id: &'a Cid,
        visited: &'a Mutex<HashSet<Cid>>,
    ) -> BoxFuture<'a, Result<(), TreeError>> {
        Box::pin(async move {
            if !visited.lock().insert(perspective_id.clone()) {
                return Ok(());
            }

            if self.applicable_data(perspective_id).await?.is_none() {
                return Ok(());
            }

            let new_head = self.pull_head(perspective_id).await?;
            if let Some(new_head) = &new_head {
                self.pull_to_draft(perspective_id, new_head).await?;
            }

            // Recurse over the reconciled state, not the pre-pull links.
            let links = self
                .applicable_data(perspective_id)
                .await?
                .map(|data| data.links)
                .unwrap_or_default();
            try_join_all(links.iter().map(|link| self.pull_inner(link, visited))).await?;
            Ok(())
        })
    }

    /// Resolve the perspective's next head. When the cached head is an
    /// ancestor of the remote head the remote head is adopted as is; a
    /// diverged pair gets a synthesized merge commit over both, and the
    /// head moves to it. Divergence is expected state here, not an error.
    async fn pull_head(&self, perspective_id: &Cid) -> Result<Option<Cid>, TreeError> {
        let cached_head = self.router.get_head(perspective_id).await?;
        let remote_head = self.router.get_remote_head(perspective_id).await?;

        if let (Some(cached), Some(remote)) = (&cached_head, &remote_head) {
            if !merge::is_ancestor_of(&self.router, cached, remote).await? {
                let strategy = DraftContentMergeStrategy::new();
                let merged = self.merge_heads(&strategy, cached, remote).await?;
                self.router
                    .update_head(perspective_id, Some(merged.clone()))
                    .await?;
                return Ok(Some(merged));
            }
        }

        Ok(remote_head)
    }

    /// Synthesize a merge commit over two diverged heads.
    async fn merge_heads(
        &self,
        strategy: &dyn MergeStrategy,
        cached: &Cid,
        remote: &Cid,
    ) -> Result<Cid, TreeError> {
        let base = match merge::common_ancestor(&self.router, cached, remote).await? {
            Some(ancestor_id) => {
                let commit = self
                    .router
                    .get_commit(&ancestor_id)
                    .await?
                    .ok_or_else(|| TreeError::CommitNotFound(ancestor_id.clone()))?;
                self.router
                    .get_data(&commit.data_id)
                    .await?
                    .ok_or(TreeError::DataNotFound(commit.data_id))?
            }
            None => TextNode::empty("", NodeType::Paragraph),
        };

        let mut datas = Vec::with_capacity(2);
        for head in [cached, remote] {
            let commit = self
                .router
                .get_commit(head)
                .await?
                .ok_or_else(|| TreeError::CommitNotFound(head.clone()))?;
            datas.push(
                self.router
                    .get_data(&commit.data_id)
                    .await?
                    .ok_or(TreeError::DataNotFound(commit.data_id))?,
            );
        }

        let merged = strategy.merge_data(&base, &datas).await?;
        let data_id = self.router.create_data(merged).await?;
        let commit = Commit {
            id: None,
            creator_id: self.creator_id.clone(),
            timestamp: Utc::now().timestamp_millis(),
            message: "merge".to_string(),
            parents_ids: vec![cached.clone(), remote.clone()],
            data_id,
        };
        Ok(self.router.create_commit(commit).await?)
    }

    /// Rebase a stale draft onto a freshly pulled head: three-way merge of
    /// the draft's old base data, the new head data, and the draft itself.
    /// The draft's base moves to the new head. Remote state is untouched.
    async fn pull_to_draft(&self, perspective_id: &Cid, head_id: &Cid) -> Result<(), TreeError> {
        let draft = match self.router.cache().get_draft(perspective_id)? {
            Some(draft) => draft,
            None => return Ok(()),
        };
        if draft.base_commit_id.as_ref() == Some(head_id) {
            return Ok(());
        }

        let head_commit = self
            .router
            .get_commit(head_id)
            .await?
            .ok_or_else(|| TreeError::CommitNotFound(head_id.clone()))?;
        let new_data = self
            .router
            .get_data(&head_commit.data_id)
            .await?
            .ok_or(TreeError::DataNotFound(head_commit.data_id))?;

        let old_data = match &draft.base_commit_id {
            Some(base_id) => {
                let base_commit = self
                    .router
                    .get_commit(base_id)
                    .await?
                    .ok_or_else(|| TreeError::CommitNotFound(base_id.clone()))?;
                self.router
                    .get_data(&base_commit.data_id)
                    .await?
                    .ok_or(TreeError::DataNotFound(base_commit.data_id))?
            }
            None => TextNode::empty("", NodeType::Paragraph),
        };

        let strategy = DraftContentMergeStrategy::new();
        let new_draft = strategy
            .merge_data(&old_data, &[new_data, draft.node])
            .await?;

        self.router.cache().set_draft(
            perspective_id,
            Draft {
                base_commit_id: Some(head_id.clone()),
                node: new_draft,
            },
        )?;
        Ok(())
    }

    // ---- ownership ----

    /// Propagate an ownership change to every perspective reachable via
    /// current head links, children first. All-or-nothing: any failure
    /// aborts with the first error.
    pub async fn change_perspective_owner_global(
        &self,
        perspective_id: &Cid,
        new_owner: &str,
    ) -> Result<(), TreeError> {
        let visited = Mutex::new(HashSet::new());
        self.change_owner_inner(perspective_id, new_owner, &visited)
            .await
    }

    fn change_owner_inner<'a>(
        &'a self,
        perspective_id: &'a Cid,
        new_owner: &'a str,
        visited: &'a Mutex<HashSet<Cid>>,
    ) -> BoxFuture<'a, Result<(), TreeError>> {
        Box::pin(async move {
            if !visited.lock().insert(perspective_id.clone()) {
                return Ok(());
            }

            let links = self
                .get_perspective_data(perspective_id)
                .await?
                .map(|data| data.links)
                .unwrap_or_default();
            try_join_all(
                links
                    .iter()
                    .map(|link| self.change_owner_inner(link, new_owner, visited)),
            )
            .await?;

            self.router
                .change_perspective_owner(perspective_id, new_owner)
                .await?;
            Ok(())
        })
    }
}

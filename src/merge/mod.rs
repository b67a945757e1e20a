//! Merge engine.
//!
//! Strategies compose a handful of primitives: content merge, link merge,
//! scalar merge, data merge, commit merge, perspective merge. A strategy
//! never writes head updates itself; each perspective-level change is
//! appended to an accumulator and the caller applies (or discards) the
//! whole batch atomically once the merge succeeds.
//!
//! Merges always terminate with a result. An ambiguous bucket resolves by
//! a fixed policy (see `merge_scalar`), never by rejection.

pub mod draft;
pub mod recursive;
pub mod simple;

pub use draft::DraftContentMergeStrategy;
pub use recursive::RecursiveContextMergeStrategy;
pub use simple::SimpleMergeStrategy;

use crate::error::MergeError;
use crate::router::Router;
use crate::types::{Cid, Commit, HeadUpdate, NodeType, TextNode};
use async_trait::async_trait;
use chrono::Utc;
use parking_lot::Mutex;
use std::collections::HashSet;
use std::sync::Arc;

/// Pluggable merge contract.
///
/// `merge_perspectives` returns the accumulated head updates for the whole
/// (possibly recursive) merge; the remaining operations are the composable
/// primitives for the data type in play.
#[async_trait]
pub trait MergeStrategy: Send + Sync {
    async fn merge_perspectives(
        &self,
        to_perspective_id: &Cid,
        from_perspective_ids: &[Cid],
    ) -> Result<Vec<HeadUpdate>, MergeError>;

    /// Merge the given commits into one, returning the resulting commit id.
    /// Degenerate inputs (one distinct commit, or all non-first commits
    /// already ancestors of the first with no data change) return an
    /// existing id without creating anything.
    async fn merge_commits(&self, commit_ids: &[Cid]) -> Result<Cid, MergeError>;

    async fn merge_data(
        &self,
        original: &TextNode,
        modifications: &[TextNode],
    ) -> Result<TextNode, MergeError>;

    async fn merge_content(
        &self,
        original: &str,
        modifications: &[String],
    ) -> Result<String, MergeError>;

    async fn merge_links(
        &self,
        original: &[Cid],
        modifications: &[Vec<Cid>],
    ) -> Result<Vec<Cid>, MergeError>;
}

/// Three-way scalar merge. A side equal to the original loses to a side
/// that modified; when several sides modified to different values, the last
/// modification in argument order wins. Deterministic and total: every
/// input resolves.
pub fn merge_scalar<T: Clone + PartialEq>(original: &T, modifications: &[T]) -> T {
    let mut result = original.clone();
    for modification in modifications {
        if modification != original {
            result = modification.clone();
        }
    }
    result
}

/// Default link merge: set union preserving the first side's order,
/// appending unseen links from later sides in order of appearance.
/// Generic because the recursive strategy merges at the context level
/// before resolving back to perspective ids.
pub fn merge_link_sets<T: Clone + Eq + std::hash::Hash>(
    original: &[T],
    modifications: &[Vec<T>],
) -> Vec<T> {
    if modifications.is_empty() {
        return original.to_vec();
    }

    let mut seen: HashSet<&T> = HashSet::new();
    let mut merged = Vec::new();
    for links in modifications {
        for link in links {
            if seen.insert(link) {
                merged.push(link.clone());
            }
        }
    }
    merged
}

/// Whether `ancestor_id` is an ancestor of (or equal to) `commit_id`.
/// Traversal is visited-set guarded, so malformed cyclic histories
/// terminate; commits missing from every backend end the branch.
pub async fn is_ancestor_of(
    router: &Router,
    ancestor_id: &Cid,
    commit_id: &Cid,
) -> Result<bool, MergeError> {
    if ancestor_id == commit_id {
        return Ok(true);
    }

    let mut visited: HashSet<Cid> = HashSet::new();
    let mut pending = vec![commit_id.clone()];
    while let Some(id) = pending.pop() {
        if !visited.insert(id.clone()) {
            continue;
        }
        let commit = match router.get_commit(&id).await? {
            Some(commit) => commit,
            None => continue,
        };
        for parent in commit.parents_ids {
            if &parent == ancestor_id {
                return Ok(true);
            }
            pending.push(parent);
        }
    }
    Ok(false)
}

/// Closest common ancestor of two commits, or `None` when the histories
/// are unrelated. Breadth-first from `b` against the full ancestor set of
/// `a`, so the first hit is the nearest one on `b`'s side.
pub async fn common_ancestor(
    router: &Router,
    a: &Cid,
    b: &Cid,
) -> Result<Option<Cid>, MergeError> {
    let mut a_ancestors: HashSet<Cid> = HashSet::new();
    let mut pending = vec![a.clone()];
    while let Some(id) = pending.pop() {
        if !a_ancestors.insert(id.clone()) {
            continue;
        }
        if let Some(commit) = router.get_commit(&id).await? {
            pending.extend(commit.parents_ids);
        }
    }

    let mut visited: HashSet<Cid> = HashSet::new();
    let mut queue = std::collections::VecDeque::from([b.clone()]);
    while let Some(id) = queue.pop_front() {
        if !visited.insert(id.clone()) {
            continue;
        }
        if a_ancestors.contains(&id) {
            return Ok(Some(id));
        }
        if let Some(commit) = router.get_commit(&id).await? {
            queue.extend(commit.parents_ids);
        }
    }
    Ok(None)
}

/// Shared strategy state: the router the strategy reads and writes through,
/// the identity stamped on merge commits, and the head-update accumulator.
pub(crate) struct MergeContext {
    pub router: Arc<Router>,
    pub creator_id: String,
    pub updates: Mutex<Vec<HeadUpdate>>,
}

impl MergeContext {
    pub fn new(router: Arc<Router>, creator_id: impl Into<String>) -> Self {
        MergeContext {
            router,
            creator_id: creator_id.into(),
            updates: Mutex::new(Vec::new()),
        }
    }

    pub fn push_update(&self, update: HeadUpdate) {
        self.updates.lock().push(update);
    }

    pub fn take_updates(&self) -> Vec<HeadUpdate> {
        std::mem::take(&mut *self.updates.lock())
    }
}

/// Three-way data merge over the strategy's own primitives: text through
/// `merge_content`, node type through the scalar policy, links through the
/// strategy's `merge_links` (which is where the recursive strategy hooks
/// in).
pub(crate) async fn three_way_data(
    strategy: &dyn MergeStrategy,
    original: &TextNode,
    modifications: &[TextNode],
) -> Result<TextNode, MergeError> {
    let texts: Vec<String> = modifications.iter().map(|m| m.text.clone()).collect();
    let text = strategy.merge_content(&original.text, &texts).await?;

    let types: Vec<NodeType> = modifications.iter().map(|m| m.doc_node_type).collect();
    let doc_node_type = merge_scalar(&original.doc_node_type, &types);

    let link_sets: Vec<Vec<Cid>> = modifications.iter().map(|m| m.links.clone()).collect();
    let links = strategy.merge_links(&original.links, &link_sets).await?;

    Ok(TextNode {
        id: None,
        text,
        doc_node_type,
        links,
    })
}

/// Commit-level merge pipeline shared by the strategies.
///
/// Resolves the closest common ancestor as the three-way base (an empty
/// node when histories are unrelated), merges the commit datas through the
/// strategy, and creates a merge commit whose parents are the input heads.
/// No commit is created when the merge changes nothing and every other
/// input is already an ancestor of the first.
pub(crate) async fn merge_commits_core(
    strategy: &dyn MergeStrategy,
    ctx: &MergeContext,
    commit_ids: &[Cid],
) -> Result<Cid, MergeError> {
    let mut distinct: Vec<Cid> = Vec::new();
    for id in commit_ids {
        if !distinct.contains(id) {
            distinct.push(id.clone());
        }
    }
    if distinct.is_empty() {
        return Err(MergeError::Unsupported("merge_commits on empty input"));
    }
    if distinct.len() == 1 {
        return Ok(distinct.remove(0));
    }

    let mut datas = Vec::with_capacity(distinct.len());
    for id in &distinct {
        let commit = ctx
            .router
            .get_commit(id)
            .await?
            .ok_or_else(|| MergeError::CommitNotFound(id.clone()))?;
        let data = ctx
            .router
            .get_data(&commit.data_id)
            .await?
            .ok_or_else(|| MergeError::DataNotFound(commit.data_id.clone()))?;
        datas.push(data);
    }

    // Fold a common ancestor across all heads; unrelated histories merge
    // against an empty base.
    let mut ancestor = Some(distinct[0].clone());
    for id in &distinct[1..] {
        ancestor = match ancestor {
            Some(current) => common_ancestor(&ctx.router, &current, id).await?,
            None => None,
        };
    }
    let original = match &ancestor {
        Some(ancestor_id) => {
            let commit = ctx
                .router
                .get_commit(ancestor_id)
                .await?
                .ok_or_else(|| MergeError::CommitNotFound(ancestor_id.clone()))?;
            ctx.router
                .get_data(&commit.data_id)
                .await?
                .ok_or_else(|| MergeError::DataNotFound(commit.data_id.clone()))?
        }
        None => TextNode::empty("", NodeType::Paragraph),
    };

    let merged = strategy.merge_data(&original, &datas).await?;

    // Nothing new to record: the first head already carries the merged
    // data and subsumes every other input.
    let mut first_data = datas[0].clone();
    first_data.id = None;
    if merged == first_data {
        let mut all_subsumed = true;
        for id in &distinct[1..] {
            if !is_ancestor_of(&ctx.router, id, &distinct[0]).await? {
                all_subsumed = false;
                break;
            }
        }
        if all_subsumed {
            return Ok(distinct[0].clone());
        }
    }

    let data_id = ctx.router.create_data(merged).await?;
    let commit = Commit {
        id: None,
        creator_id: ctx.creator_id.clone(),
        timestamp: Utc::now().timestamp_millis(),
        message: "merge".to_string(),
        parents_ids: distinct,
        data_id,
    };
    Ok(ctx.router.create_commit(commit).await?)
}

/// Perspective-level merge pipeline shared by the strategies: merge the
/// heads, and record a head update for `to` only when the merged head
/// differs from the current one.
pub(crate) async fn merge_perspectives_core(
    strategy: &dyn MergeStrategy,
    ctx: &MergeContext,
    to_perspective_id: &Cid,
    from_perspective_ids: &[Cid],
) -> Result<(), MergeError> {
    let to_head = ctx.router.get_head(to_perspective_id).await?;

    let mut heads: Vec<Cid> = Vec::new();
    if let Some(head) = &to_head {
        heads.push(head.clone());
    }
    for from in from_perspective_ids {
        if let Some(head) = ctx.router.get_head(from).await? {
            heads.push(head.clone());
        }
    }
    if heads.is_empty() {
        return Ok(());
    }

    let merged_head = strategy.merge_commits(&heads).await?;
    if to_head.as_ref() != Some(&merged_head) {
        ctx.push_update(HeadUpdate {
            perspective_id: to_perspective_id.clone(),
            head_id: merged_head,
        });
    }
    Ok(())
}

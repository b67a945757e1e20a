//! Context-bucketed recursive merge.
//!
//! Perspectives on different branches that share a context are "the same
//! logical node"; this strategy is what makes them merge instead of being
//! treated as unrelated objects. Before merging it visits every
//! perspective reachable from `to` and from each `from` root, bucketing
//! them by context. The actual merge then runs top-down: whenever the link
//! merge must decide the merged value of a link, the link's target is
//! resolved to its context bucket, and a bucket holding both a `to` and
//! one or more `from` candidates triggers a recursive sub-merge.
//!
//! Head updates are never applied here; they accumulate and are returned
//! from the root call.

use super::{
    merge_commits_core, merge_link_sets, merge_perspectives_core, merge_scalar, three_way_data,
    MergeContext, MergeStrategy,
};
use crate::error::MergeError;
use crate::router::Router;
use crate::types::{Cid, Commit, HeadUpdate, Perspective, TextNode};
use async_trait::async_trait;
use chrono::Utc;
use futures::future::{try_join_all, BoxFuture};
use parking_lot::Mutex;
use std::collections::{HashMap, HashSet};
use std::sync::Arc;

#[derive(Debug, Clone, Default)]
struct ContextBucket {
    to: Option<Cid>,
    from: Vec<Cid>,
}

#[derive(Default)]
struct BucketState {
    by_context: HashMap<String, ContextBucket>,
    perspectives: HashMap<Cid, Perspective>,
    /// Perspectives whose children were already walked by
    /// `merge_perspective_children`; guards against cyclic links.
    children_visited: HashSet<Cid>,
    /// Contexts whose bucket was already sub-merged this run. A context
    /// linked from several parents resolves to the same merged head on
    /// every later encounter; re-merging would mint a second, competing
    /// merge commit.
    contexts_merged: HashSet<String>,
}

pub struct RecursiveContextMergeStrategy {
    ctx: MergeContext,
    state: Mutex<Option<BucketState>>,
}

impl RecursiveContextMergeStrategy {
    pub fn new(router: Arc<Router>, creator_id: impl Into<String>) -> Self {
        RecursiveContextMergeStrategy {
            ctx: MergeContext::new(router, creator_id),
            state: Mutex::new(None),
        }
    }

    fn record_perspective(&self, perspective: &Perspective, is_to: bool) {
        let id = match &perspective.id {
            Some(id) => id.clone(),
            None => return,
        };
        let mut guard = self.state.lock();
        if let Some(state) = guard.as_mut() {
            let bucket = state
                .by_context
                .entry(perspective.context.clone())
                .or_default();
            if is_to {
                bucket.to = Some(id.clone());
            } else {
                bucket.from.push(id.clone());
            }
            state.perspectives.insert(id, perspective.clone());
        }
    }

    fn already_read(&self, perspective_id: &Cid) -> bool {
        let guard = self.state.lock();
        guard
            .as_ref()
            .map(|state| state.perspectives.contains_key(perspective_id))
            .unwrap_or(false)
    }

    /// Walk a perspective tree, filing every reachable perspective into its
    /// context bucket. The already-read marker is set before recursing, so
    /// cyclic links terminate.
    fn read_perspective<'a>(
        &'a self,
        perspective_id: &'a Cid,
        is_to: bool,
    ) -> BoxFuture<'a, Result<(), MergeError>> {
        Box::pin(async move {
            if self.already_read(perspective_id) {
                return Ok(());
            }

            let perspective = self
                .ctx
                .router
                .get_perspective(perspective_id)
                .await?
                .ok_or_else(|| MergeError::PerspectiveNotFound(perspective_id.clone()))?;
            self.record_perspective(&perspective, is_to);

            let head = match self.ctx.router.get_head(perspective_id).await? {
                Some(head) => head,
                None => return Ok(()),
            };
            let commit = match self.ctx.router.get_commit(&head).await? {
                Some(commit) => commit,
                None => return Ok(()),
            };
            let data = match self.ctx.router.get_data(&commit.data_id).await? {
                Some(data) => data,
                None => return Ok(()),
            };

            try_join_all(
                data.links
                    .iter()
                    .map(|link| self.read_perspective(link, is_to)),
            )
            .await?;
            Ok(())
        })
    }

    async fn read_all_subcontexts(
        &self,
        to_perspective_id: &Cid,
        from_perspective_ids: &[Cid],
    ) -> Result<(), MergeError> {
        let mut reads: Vec<_> = from_perspective_ids
            .iter()
            .map(|id| self.read_perspective(id, false))
            .collect();
        reads.push(self.read_perspective(to_perspective_id, true));
        try_join_all(reads).await?;
        Ok(())
    }

    async fn context_of(&self, perspective_id: &Cid) -> Result<String, MergeError> {
        {
            let guard = self.state.lock();
            if let Some(state) = guard.as_ref() {
                if let Some(perspective) = state.perspectives.get(perspective_id) {
                    return Ok(perspective.context.clone());
                }
            }
        }
        let perspective = self
            .ctx
            .router
            .get_perspective(perspective_id)
            .await?
            .ok_or_else(|| MergeError::PerspectiveNotFound(perspective_id.clone()))?;
        Ok(perspective.context)
    }

    fn bucket_for(&self, context: &str) -> Option<ContextBucket> {
        let guard = self.state.lock();
        guard
            .as_ref()
            .and_then(|state| state.by_context.get(context).cloned())
    }

    fn mark_children_visited(&self, perspective_id: &Cid) -> bool {
        let mut guard = self.state.lock();
        match guard.as_mut() {
            Some(state) => state.children_visited.insert(perspective_id.clone()),
            None => false,
        }
    }

    fn mark_context_merged(&self, context: &str) -> bool {
        let mut guard = self.state.lock();
        match guard.as_mut() {
            Some(state) => state.contexts_merged.insert(context.to_string()),
            None => false,
        }
    }

    /// Head data of a perspective, straight through the router.
    async fn perspective_data(
        &self,
        perspective_id: &Cid,
    ) -> Result<Option<TextNode>, MergeError> {
        let head = match self.ctx.router.get_head(perspective_id).await? {
            Some(head) => head,
            None => return Ok(None),
        };
        let commit = self
            .ctx
            .router
            .get_commit(&head)
            .await?
            .ok_or_else(|| MergeError::CommitNotFound(head.clone()))?;
        Ok(self.ctx.router.get_data(&commit.data_id).await?)
    }

    /// Create a new commit carrying `node` on top of the perspective's
    /// current head, and append the head move to the accumulator. Nothing
    /// is written to the perspective's head here.
    async fn update_perspective_data(
        &self,
        perspective_id: &Cid,
        node: TextNode,
    ) -> Result<(), MergeError> {
        let head = self.ctx.router.get_head(perspective_id).await?;
        let data_id = self.ctx.router.create_data(node).await?;
        let commit = Commit {
            id: None,
            creator_id: self.ctx.creator_id.clone(),
            timestamp: Utc::now().timestamp_millis(),
            message: "merge update".to_string(),
            parents_ids: head.into_iter().collect(),
            data_id,
        };
        let new_head = self.ctx.router.create_commit(commit).await?;
        self.ctx.push_update(HeadUpdate {
            perspective_id: perspective_id.clone(),
            head_id: new_head,
        });
        Ok(())
    }

    /// Merge a perspective "with itself": re-run the link merge over its
    /// own links so that descendant context buckets with pending `from`
    /// candidates still get merged, even when this perspective itself had
    /// no counterpart.
    fn merge_perspective_children<'a>(
        &'a self,
        perspective_id: &'a Cid,
    ) -> BoxFuture<'a, Result<(), MergeError>> {
        Box::pin(async move {
            if !self.mark_children_visited(perspective_id) {
                return Ok(());
            }

            let data = match self.perspective_data(perspective_id).await? {
                Some(data) => data,
                None => return Ok(()),
            };

            let merged_links = self
                .merge_links(&data.links, &[data.links.clone()])
                .await?;

            if merged_links != data.links {
                let node = TextNode {
                    id: None,
                    text: data.text,
                    doc_node_type: data.doc_node_type,
                    links: merged_links,
                };
                self.update_perspective_data(perspective_id, node).await?;
            }
            Ok(())
        })
    }
}

#[async_trait]
impl MergeStrategy for RecursiveContextMergeStrategy {
    async fn merge_perspectives(
        &self,
        to_perspective_id: &Cid,
        from_perspective_ids: &[Cid],
    ) -> Result<Vec<HeadUpdate>, MergeError> {
        let is_root = {
            let mut guard = self.state.lock();
            if guard.is_none() {
                *guard = Some(BucketState::default());
                true
            } else {
                false
            }
        };

        let result = async {
            if is_root {
                self.read_all_subcontexts(to_perspective_id, from_perspective_ids)
                    .await?;
            }
            merge_perspectives_core(self, &self.ctx, to_perspective_id, from_perspective_ids).await
        }
        .await;

        if is_root {
            *self.state.lock() = None;
            match result {
                Ok(()) => Ok(self.ctx.take_updates()),
                Err(err) => {
                    // Discard partial accumulation; nothing was applied.
                    self.ctx.take_updates();
                    Err(err)
                }
            }
        } else {
            result.map(|()| Vec::new())
        }
    }

    async fn merge_commits(&self, commit_ids: &[Cid]) -> Result<Cid, MergeError> {
        merge_commits_core(self, &self.ctx, commit_ids).await
    }

    async fn merge_data(
        &self,
        original: &TextNode,
        modifications: &[TextNode],
    ) -> Result<TextNode, MergeError> {
        three_way_data(self, original, modifications).await
    }

    async fn merge_content(
        &self,
        original: &str,
        modifications: &[String],
    ) -> Result<String, MergeError> {
        Ok(merge_scalar(&original.to_string(), modifications))
    }

    /// Link merge through context buckets. Links are first translated to
    /// contexts and merged at that level; each merged context is then
    /// resolved back to a single perspective id, recursively sub-merging
    /// buckets that have candidates on both sides.
    async fn merge_links(
        &self,
        original: &[Cid],
        modifications: &[Vec<Cid>],
    ) -> Result<Vec<Cid>, MergeError> {
        let mut fallback: HashMap<String, Cid> = HashMap::new();

        let mut original_contexts = Vec::with_capacity(original.len());
        for link in original {
            let context = self.context_of(link).await?;
            fallback.entry(context.clone()).or_insert_with(|| link.clone());
            original_contexts.push(context);
        }

        let mut modification_contexts = Vec::with_capacity(modifications.len());
        for links in modifications {
            let mut contexts = Vec::with_capacity(links.len());
            for link in links {
                let context = self.context_of(link).await?;
                fallback.entry(context.clone()).or_insert_with(|| link.clone());
                contexts.push(context);
            }
            modification_contexts.push(contexts);
        }

        let merged_contexts = merge_link_sets(&original_contexts, &modification_contexts);

        // Sequential on purpose: two links resolving into the same bucket
        // must not race the sub-merge.
        let mut merged_links = Vec::with_capacity(merged_contexts.len());
        for context in merged_contexts {
            let bucket = self.bucket_for(&context).unwrap_or_default();

            let final_id = match (&bucket.to, bucket.from.as_slice()) {
                (Some(to), from @ [_, ..]) => {
                    let to = to.clone();
                    if self.mark_context_merged(&context) {
                        self.merge_perspectives(&to, from).await?;
                    }
                    to
                }
                _ => {
                    let resolved = bucket
                        .to
                        .clone()
                        .or_else(|| bucket.from.first().cloned())
                        .or_else(|| fallback.get(&context).cloned());
                    let final_id = match resolved {
                        Some(id) => id,
                        None => continue,
                    };
                    self.merge_perspective_children(&final_id).await?;
                    final_id
                }
            };
            merged_links.push(final_id);
        }
        Ok(merged_links)
    }
}

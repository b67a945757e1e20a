//! Three-way merge of a single text node, no recursion into linked
//! sub-perspectives.

use super::{
    merge_commits_core, merge_link_sets, merge_perspectives_core, merge_scalar, three_way_data,
    MergeContext, MergeStrategy,
};
use crate::error::MergeError;
use crate::router::Router;
use crate::types::{Cid, HeadUpdate, TextNode};
use async_trait::async_trait;
use std::sync::Arc;

pub struct SimpleMergeStrategy {
    ctx: MergeContext,
}

impl SimpleMergeStrategy {
    pub fn new(router: Arc<Router>, creator_id: impl Into<String>) -> Self {
        SimpleMergeStrategy {
            ctx: MergeContext::new(router, creator_id),
        }
    }
}

#[async_trait]
impl MergeStrategy for SimpleMergeStrategy {
    async fn merge_perspectives(
        &self,
        to_perspective_id: &Cid,
        from_perspective_ids: &[Cid],
    ) -> Result<Vec<HeadUpdate>, MergeError> {
        merge_perspectives_core(self, &self.ctx, to_perspective_id, from_perspective_ids).await?;
        Ok(self.ctx.take_updates())
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

    async fn merge_links(
        &self,
        original: &[Cid],
        modifications: &[Vec<Cid>],
    ) -> Result<Vec<Cid>, MergeError> {
        Ok(merge_link_sets(original, modifications))
    }
}

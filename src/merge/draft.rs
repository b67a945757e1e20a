//! Three-way content merge used when pulling remote changes under a
//! locally edited draft. Only the data level is supported; perspective
//! and commit merging belong to the full strategies.

use super::{merge_link_sets, merge_scalar, three_way_data, MergeStrategy};
use crate::error::MergeError;
use crate::types::{Cid, HeadUpdate, TextNode};
use async_trait::async_trait;

#[derive(Debug, Default)]
pub struct DraftContentMergeStrategy;

impl DraftContentMergeStrategy {
    pub fn new() -> Self {
        DraftContentMergeStrategy
    }
}

#[async_trait]
impl MergeStrategy for DraftContentMergeStrategy {
    async fn merge_perspectives(
        &self,
        _to_perspective_id: &Cid,
        _from_perspective_ids: &[Cid],
    ) -> Result<Vec<HeadUpdate>, MergeError> {
        Err(MergeError::Unsupported(
            "draft merge operates on data only",
        ))
    }

    async fn merge_commits(&self, _commit_ids: &[Cid]) -> Result<Cid, MergeError> {
        Err(MergeError::Unsupported(
            "draft merge operates on data only",
        ))
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

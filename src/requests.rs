//! Merge coordination: applying accumulated head updates locally, and
//! packaging them into owner-approved merge requests hosted on a
//! perspective's authoritative backend.
//!
//! Both flows wait for the pending-write barrier before acting: a head
//! update or request payload must never reference objects whose backend
//! writes are still in flight.

use crate::cid;
use crate::error::{MergeError, StoreError};
use crate::merge::MergeStrategy;
use crate::router::Router;
use crate::types::{Cid, HeadUpdate, MergeRequest, RequestHeadUpdate};
use futures::future::try_join_all;
use std::sync::Arc;
use tracing::info;

pub struct MergeCoordinator {
    router: Arc<Router>,
    creator_id: String,
}

impl MergeCoordinator {
    pub fn new(router: Arc<Router>, creator_id: impl Into<String>) -> Self {
        MergeCoordinator {
            router,
            creator_id: creator_id.into(),
        }
    }

    /// Run a merge and apply every accumulated head update directly. The
    /// whole batch is applied only after the merge succeeded and all
    /// optimistic writes it dispatched have landed.
    pub async fn merge_locally(
        &self,
        strategy: &dyn MergeStrategy,
        to_perspective_id: &Cid,
        from_perspective_ids: &[Cid],
    ) -> Result<Vec<HeadUpdate>, MergeError> {
        let updates = strategy
            .merge_perspectives(to_perspective_id, from_perspective_ids)
            .await?;
        self.router.wait_drained().await?;

        try_join_all(updates.iter().map(|update| {
            self.router
                .update_head(&update.perspective_id, Some(update.head_id.clone()))
        }))
        .await?;

        info!(
            to = %to_perspective_id,
            updates = updates.len(),
            "merge applied locally"
        );
        Ok(updates)
    }

    /// Run a merge and, instead of applying it, propose it as a merge
    /// request on the target perspective's origin. Head updates are keyed
    /// by perspective-id hash under the origin's hash algorithm.
    pub async fn propose_merge(
        &self,
        strategy: &dyn MergeStrategy,
        to_perspective_id: &Cid,
        from_perspective_id: &Cid,
    ) -> Result<String, MergeError> {
        let updates = strategy
            .merge_perspectives(to_perspective_id, &[from_perspective_id.clone()])
            .await?;
        self.router.wait_drained().await?;

        let to_perspective = self
            .router
            .get_perspective(to_perspective_id)
            .await?
            .ok_or_else(|| MergeError::PerspectiveNotFound(to_perspective_id.clone()))?;
        let owner = self
            .router
            .get_perspective_owner(to_perspective_id)
            .await?
            .unwrap_or_else(|| self.creator_id.clone());
        let config = self.router.cid_config_of(&to_perspective.origin)?;

        let head_updates: Vec<RequestHeadUpdate> = updates
            .iter()
            .map(|update| RequestHeadUpdate {
                perspective_id_hash: cid::hash_cid(&update.perspective_id, &config),
                head_id: update.head_id.clone(),
                executed: 0,
            })
            .collect();

        let request = MergeRequest {
            id: None,
            to_perspective_id: to_perspective_id.clone(),
            from_perspective_id: from_perspective_id.clone(),
            owner,
            nonce: Some(0),
            head_updates,
            approved_addresses: vec![self.creator_id.clone()],
            status: None,
            authorized: None,
        };

        let request_id = self
            .router
            .create_merge_request_in(&to_perspective.origin, request)
            .await?;
        info!(
            to = %to_perspective_id,
            from = %from_perspective_id,
            request = %request_id,
            "merge request proposed"
        );
        Ok(request_id)
    }

    /// Pending merge requests targeting a perspective, read from its
    /// origin.
    pub async fn requests_to(
        &self,
        perspective_id: &Cid,
    ) -> Result<Vec<MergeRequest>, StoreError> {
        self.router.get_merge_requests_to(perspective_id).await
    }

    pub async fn authorize(
        &self,
        request_id: &str,
        perspective_id: &Cid,
    ) -> Result<(), StoreError> {
        self.router
            .authorize_merge_request_in(request_id, perspective_id)
            .await
    }

    pub async fn execute(
        &self,
        request_id: &str,
        perspective_id: &Cid,
    ) -> Result<(), StoreError> {
        self.router
            .execute_merge_request_in(request_id, perspective_id)
            .await
    }
}

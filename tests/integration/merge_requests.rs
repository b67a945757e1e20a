//! Integration tests for the propose / authorize / execute request flow

use super::test_utils::*;
use braid::cid::{self, CidConfig};
use braid::merge::SimpleMergeStrategy;
use braid::store::PerspectiveStore;
use std::sync::Arc;

async fn diverged_pair(bed: &TestBed) -> (braid::types::Cid, braid::types::Cid) {
    let to = create_perspective(bed, "ctx-req", 1).await;
    commit_node(bed, &to, "base", vec![], 2).await;
    drain(bed).await;

    let from = bed
        .tree
        .create_global_perspective(&backend_id(), &to, "proposal")
        .await
        .unwrap();
    drain(bed).await;

    bed.tree.set_draft_text(&from, "proposed").await.unwrap();
    bed.tree
        .commit(&backend_id(), &from, "propose", 3, false)
        .await
        .unwrap();
    drain(bed).await;
    (to, from)
}

/// Proposing a merge records a request on the origin without moving the
/// target head; the request carries the merged head keyed by
/// perspective-id hash.
#[tokio::test]
async fn test_propose_leaves_head_untouched() {
    let bed = bed();
    let (to, from) = diverged_pair(&bed).await;
    let head_before = bed.router.get_head(&to).await.unwrap().unwrap();

    let strategy = SimpleMergeStrategy::new(Arc::clone(&bed.router), CREATOR);
    let request_id = bed
        .coordinator
        .propose_merge(&strategy, &to, &from)
        .await
        .unwrap();

    assert_eq!(
        bed.router.get_head(&to).await.unwrap(),
        Some(head_before.clone())
    );
    assert_eq!(
        bed.backend().get_head(&to).await.unwrap(),
        Some(head_before)
    );

    let requests = bed.coordinator.requests_to(&to).await.unwrap();
    assert_eq!(requests.len(), 1);
    let request = &requests[0];
    assert_eq!(request.id.as_deref(), Some(request_id.as_str()));
    assert_eq!(request.from_perspective_id, from);
    assert_eq!(request.authorized, Some(0));
    assert_eq!(request.head_updates.len(), 1);
    assert_eq!(request.head_updates[0].executed, 0);
    assert_eq!(
        request.head_updates[0].perspective_id_hash,
        cid::hash_cid(&to, &CidConfig::default())
    );
    assert_eq!(request.approved_addresses, vec![CREATOR.to_string()]);
}

/// Execution is gated on authorization.
#[tokio::test]
async fn test_execute_requires_authorization() {
    let bed = bed();
    let (to, from) = diverged_pair(&bed).await;

    let strategy = SimpleMergeStrategy::new(Arc::clone(&bed.router), CREATOR);
    let request_id = bed
        .coordinator
        .propose_merge(&strategy, &to, &from)
        .await
        .unwrap();

    assert!(bed.coordinator.execute(&request_id, &to).await.is_err());

    bed.coordinator.authorize(&request_id, &to).await.unwrap();
    bed.coordinator.execute(&request_id, &to).await.unwrap();
}

/// Executing an authorized request moves the backend head to the merged
/// commit and marks the request done.
#[tokio::test]
async fn test_execute_applies_proposed_head() {
    let bed = bed();
    let (to, from) = diverged_pair(&bed).await;

    let strategy = SimpleMergeStrategy::new(Arc::clone(&bed.router), CREATOR);
    let request_id = bed
        .coordinator
        .propose_merge(&strategy, &to, &from)
        .await
        .unwrap();

    let requests = bed.coordinator.requests_to(&to).await.unwrap();
    let proposed = requests[0].head_updates[0].head_id.clone();

    bed.coordinator.authorize(&request_id, &to).await.unwrap();
    bed.coordinator.execute(&request_id, &to).await.unwrap();

    assert_eq!(
        bed.backend().get_head(&to).await.unwrap(),
        Some(proposed.clone())
    );

    // The merged commit was written optimistically during proposal, so
    // the backend can serve it and its data.
    let merged = bed.router.get_commit(&proposed).await.unwrap().unwrap();
    let data = bed.router.get_data(&merged.data_id).await.unwrap().unwrap();
    assert_eq!(data.text, "proposed");

    let requests = bed.coordinator.requests_to(&to).await.unwrap();
    assert_eq!(requests[0].status, Some(1));
    assert_eq!(requests[0].head_updates[0].executed, 1);
}

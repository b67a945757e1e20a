//! Integration tests for ancestor-aware pull and draft reconciliation

use super::test_utils::*;
use braid::store::{DataStore, DraftStore, PerspectiveStore};
use braid::types::{Cid, Commit};
use std::collections::HashSet;

/// Advance a perspective's head on the backend directly, simulating a
/// remote writer the local cache has not observed.
async fn remote_commit(bed: &TestBed, perspective_id: &Cid, text: &str, timestamp: i64) -> Cid {
    let backend = bed.backend();
    let parents: Vec<Cid> = backend
        .get_head(perspective_id)
        .await
        .unwrap()
        .into_iter()
        .collect();
    let data_id = backend.create_data(text_node(text, vec![])).await.unwrap();
    let commit_id = backend
        .create_commit(Commit {
            id: None,
            creator_id: "remote-writer".to_string(),
            timestamp,
            message: "remote".to_string(),
            parents_ids: parents,
            data_id,
        })
        .await
        .unwrap();
    backend
        .update_head(perspective_id, Some(commit_id.clone()))
        .await
        .unwrap();
    commit_id
}

/// Local head is an ancestor of the remote head: pull adopts the remote
/// head directly, no merge commit is synthesized.
#[tokio::test]
async fn test_pull_fast_forwards_to_remote_head() {
    let bed = bed();
    let pid = create_perspective(&bed, "ctx-ff", 1).await;
    commit_node(&bed, &pid, "v1", vec![], 2).await;
    drain(&bed).await;

    let remote_head = remote_commit(&bed, &pid, "v2", 3).await;

    bed.tree.pull(&pid).await.unwrap();
    drain(&bed).await;

    assert_eq!(bed.router.get_head(&pid).await.unwrap(), Some(remote_head.clone()));
    let commit = bed.router.get_commit(&remote_head).await.unwrap().unwrap();
    let data = bed.router.get_data(&commit.data_id).await.unwrap().unwrap();
    assert_eq!(data.text, "v2");
}

/// Diverged heads: pull synthesizes a merge commit whose parents are the
/// local and remote heads.
#[tokio::test]
async fn test_pull_merges_diverged_heads() {
    let bed = bed();
    let pid = create_perspective(&bed, "ctx-div", 1).await;
    let base = commit_node(&bed, &pid, "base", vec![], 2).await;
    drain(&bed).await;

    // Remote writer moves on from base while the local head also advances
    // from base.
    let remote_head = remote_commit(&bed, &pid, "remote", 3).await;
    let data_id = bed.router.create_data(text_node("local", vec![])).await.unwrap();
    let local_head = bed
        .router
        .create_commit(Commit {
            id: None,
            creator_id: CREATOR.to_string(),
            timestamp: 4,
            message: "local".to_string(),
            parents_ids: vec![base.clone()],
            data_id,
        })
        .await
        .unwrap();
    bed.router.cache().set_head(&pid, Some(local_head.clone())).unwrap();
    drain(&bed).await;

    bed.tree.pull(&pid).await.unwrap();
    drain(&bed).await;

    let merged_head = bed.router.get_head(&pid).await.unwrap().unwrap();
    assert_ne!(merged_head, local_head);
    assert_ne!(merged_head, remote_head);

    let merge_commit = bed.router.get_commit(&merged_head).await.unwrap().unwrap();
    let parents: HashSet<Cid> = merge_commit.parents_ids.iter().cloned().collect();
    assert_eq!(parents, HashSet::from([local_head, remote_head]));

    // Both sides modified "base"; the draft-order policy resolves to the
    // later modification.
    let data = bed
        .router
        .get_data(&merge_commit.data_id)
        .await
        .unwrap()
        .unwrap();
    assert_eq!(data.text, "remote");
}

/// A stale draft survives a pull: it is three-way rebased onto the new
/// head instead of being discarded.
#[tokio::test]
async fn test_pull_rebases_stale_draft() {
    let bed = bed();
    let pid = create_perspective(&bed, "ctx-draft", 1).await;
    let base = commit_node(&bed, &pid, "base", vec![], 2).await;
    drain(&bed).await;

    bed.tree.set_draft_text(&pid, "local edit").await.unwrap();
    let remote_head = remote_commit(&bed, &pid, "remote edit", 3).await;

    bed.tree.pull(&pid).await.unwrap();
    drain(&bed).await;

    assert_eq!(bed.router.get_head(&pid).await.unwrap(), Some(remote_head.clone()));

    let draft = bed.router.cache().get_draft(&pid).unwrap().unwrap();
    assert_eq!(draft.base_commit_id, Some(remote_head));
    // Draft modified, remote modified: the draft side is the last
    // modification and wins the scalar merge.
    assert_eq!(draft.node.text, "local edit");
    assert_ne!(draft.base_commit_id, Some(base));
}

/// A draft that tracked the old head but was never edited adopts the
/// remote content wholesale.
#[tokio::test]
async fn test_pull_unedited_draft_takes_remote_content() {
    let bed = bed();
    let pid = create_perspective(&bed, "ctx-clean", 1).await;
    commit_node(&bed, &pid, "base", vec![], 2).await;
    drain(&bed).await;

    bed.tree.get_or_create_draft(&pid).await.unwrap();
    remote_commit(&bed, &pid, "remote edit", 3).await;

    bed.tree.pull(&pid).await.unwrap();
    drain(&bed).await;

    let draft = bed.tree.get_draft(&pid).unwrap().unwrap();
    assert_eq!(draft.text, "remote edit");
}

/// Children are pulled too, through the reconciled parent links.
#[tokio::test]
async fn test_pull_recurses_into_children() {
    let bed = bed();
    let child = create_perspective(&bed, "ctx-child", 1).await;
    commit_node(&bed, &child, "child v1", vec![], 2).await;
    let root = create_perspective(&bed, "ctx-root", 3).await;
    commit_node(&bed, &root, "root", vec![child.clone()], 4).await;
    drain(&bed).await;

    let child_remote = remote_commit(&bed, &child, "child v2", 5).await;

    bed.tree.pull(&root).await.unwrap();
    drain(&bed).await;

    assert_eq!(bed.router.get_head(&child).await.unwrap(), Some(child_remote));
}

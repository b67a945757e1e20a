//! Integration tests for the cached multi-backend router

use super::test_utils::*;
use braid::error::StoreError;
use braid::store::{DataStore, InMemoryBackend, PerspectiveStore};
use braid::types::Cid;
use std::sync::Arc;

#[tokio::test]
async fn test_create_get_round_trip() {
    let bed = bed();
    let p = perspective(MEM, "ctx-rt", 1);
    let id = bed
        .router
        .create_perspective_in(&backend_id(), p.clone())
        .await
        .unwrap();
    drain(&bed).await;

    let found = bed.router.get_perspective(&id).await.unwrap().unwrap();
    assert_eq!(found.id, Some(id));
    assert_eq!(found.context, p.context);
    assert_eq!(found.creator_id, p.creator_id);
}

/// Cold cache: the object is discovered from a backend once; the second
/// read is served from the cache with no further backend calls.
#[tokio::test]
async fn test_cold_cache_population_then_cache_hit() {
    let first = Arc::new(InMemoryBackend::new(MEM));
    let second = Arc::new(InMemoryBackend::new("other"));
    let bed = bed_with_backends(vec![Arc::clone(&first), Arc::clone(&second)]);

    // Seed directly into one backend, bypassing the router.
    let id = second
        .create_perspective(perspective("other", "ctx-cold", 2))
        .await
        .unwrap();

    let found = bed.router.get_perspective(&id).await.unwrap().unwrap();
    assert_eq!(found.id, Some(id.clone()));

    let calls_after_miss = first.read_calls() + second.read_calls();
    let again = bed.router.get_perspective(&id).await.unwrap().unwrap();
    assert_eq!(again.id, Some(id));
    assert_eq!(first.read_calls() + second.read_calls(), calls_after_miss);
}

/// A commit discovery pulls the whole closure (parents, data, linked
/// perspectives) into the cache.
#[tokio::test]
async fn test_commit_discovery_caches_closure() {
    let backend = Arc::new(InMemoryBackend::new(MEM));
    let bed = bed_with_backends(vec![Arc::clone(&backend)]);

    let child_pid = backend
        .create_perspective(perspective(MEM, "ctx-child", 3))
        .await
        .unwrap();
    let data_id = backend
        .create_data(text_node("hello", vec![child_pid.clone()]))
        .await
        .unwrap();
    let commit_id = backend
        .create_commit(braid::types::Commit {
            id: None,
            creator_id: CREATOR.to_string(),
            timestamp: 4,
            message: String::new(),
            parents_ids: vec![],
            data_id: data_id.clone(),
        })
        .await
        .unwrap();

    bed.router.get_commit(&commit_id).await.unwrap().unwrap();

    // Everything referenced must now be served without backend reads.
    backend.set_fail_reads(true);
    assert!(bed.router.get_data(&data_id).await.unwrap().is_some());
    assert!(bed
        .router
        .get_perspective(&child_pid)
        .await
        .unwrap()
        .is_some());
}

/// A backend that reports a different id than the locally computed one
/// surfaces IdMismatch at the drain barrier; nothing is cached under the
/// mangled id.
#[tokio::test]
async fn test_backend_id_mismatch_rejected() {
    let bed = bed();
    bed.backend().set_mangle_created_ids(true);

    let computed = bed
        .router
        .create_data(text_node("x", vec![]))
        .await
        .unwrap();

    let err = bed.router.wait_drained().await.unwrap_err();
    match err {
        StoreError::DeferredWrite(inner) => {
            assert!(matches!(*inner, StoreError::IdMismatch { .. }));
        }
        other => panic!("unexpected error: {other}"),
    }

    let mangled = Cid::new(format!("{computed}0"));
    assert!(bed.router.cache().data(&mangled).unwrap().is_none());
    assert!(bed.router.cache().data(&computed).unwrap().is_some());
}

/// Head reads are origin-scoped: a non-origin backend claiming a head for
/// the perspective is never consulted.
#[tokio::test]
async fn test_remote_head_is_origin_scoped() {
    let origin = Arc::new(InMemoryBackend::new(MEM));
    let imposter = Arc::new(InMemoryBackend::new("imposter"));
    let bed = bed_with_backends(vec![Arc::clone(&origin), Arc::clone(&imposter)]);

    let pid = create_perspective(&bed, "ctx-auth", 5).await;
    let head = commit_node(&bed, &pid, "content", vec![], 6).await;
    drain(&bed).await;

    imposter
        .update_head(&pid, Some(Cid::new("fdeadbeef")))
        .await
        .unwrap();

    assert_eq!(bed.router.get_remote_head(&pid).await.unwrap(), Some(head));
}

/// An unreachable origin fails the remote head read; the cached head is
/// never served in its place as if it were authoritative.
#[tokio::test]
async fn test_remote_head_read_fails_when_origin_is_down() {
    let bed = bed();
    let pid = create_perspective(&bed, "ctx-down", 9).await;
    commit_node(&bed, &pid, "content", vec![], 10).await;
    drain(&bed).await;

    bed.backend().set_fail_reads(true);
    assert!(bed.router.get_remote_head(&pid).await.is_err());

    // The cached head slot stays usable for cache-scoped reads.
    bed.backend().set_fail_reads(false);
    assert!(bed.router.get_head(&pid).await.unwrap().is_some());
}

#[tokio::test]
async fn test_context_fan_out_union() {
    let first = Arc::new(InMemoryBackend::new(MEM));
    let second = Arc::new(InMemoryBackend::new("other"));
    let bed = bed_with_backends(vec![Arc::clone(&first), Arc::clone(&second)]);

    let a = first
        .create_perspective(perspective(MEM, "ctx-fan", 7))
        .await
        .unwrap();
    let b = second
        .create_perspective(perspective("other", "ctx-fan", 8))
        .await
        .unwrap();

    let found = bed.router.get_context_perspectives("ctx-fan").await.unwrap();
    let ids: Vec<_> = found.iter().map(|p| p.id.clone().unwrap()).collect();
    assert_eq!(found.len(), 2);
    assert!(ids.contains(&a));
    assert!(ids.contains(&b));

    // Fan-out populated the cache; the cached variant needs no backends.
    first.set_fail_reads(true);
    second.set_fail_reads(true);
    let cached = bed
        .router
        .get_cached_context_perspectives("ctx-fan")
        .await
        .unwrap();
    assert_eq!(cached.len(), 2);
}

//! Shared test utilities for integration tests
//!
//! Builds a full stack (sled cache, in-memory backends, router, tree
//! service) on temp directories, plus helpers to seed committed
//! perspectives.

use braid::requests::MergeCoordinator;
use braid::router::Router;
use braid::store::{Backend, InMemoryBackend, LocalStore};
use braid::tree::TreeService;
use braid::types::{BackendId, Cid, Commit, NodeType, Perspective, TextNode};
use std::sync::Arc;
use tempfile::TempDir;

pub const MEM: &str = "mem";
pub const CREATOR: &str = "alice";

pub fn backend_id() -> BackendId {
    BackendId::new(MEM)
}

pub struct TestBed {
    pub _cache_dir: TempDir,
    pub router: Arc<Router>,
    pub backends: Vec<Arc<InMemoryBackend>>,
    pub tree: TreeService,
    pub coordinator: MergeCoordinator,
}

impl TestBed {
    pub fn backend(&self) -> &Arc<InMemoryBackend> {
        &self.backends[0]
    }
}

/// One in-memory backend named "mem", default everything else.
pub fn bed() -> TestBed {
    bed_with_backends(vec![Arc::new(InMemoryBackend::new(MEM))])
}

pub fn bed_with_backends(backends: Vec<Arc<InMemoryBackend>>) -> TestBed {
    let cache_dir = TempDir::new().unwrap();
    let cache = Arc::new(LocalStore::open(cache_dir.path()).unwrap());

    let mut router = Router::new(cache, backends[0].name().clone());
    for backend in &backends {
        router.register(
            backend.name().clone(),
            Arc::clone(backend) as Arc<dyn Backend>,
        );
    }
    let router = Arc::new(router);

    TestBed {
        _cache_dir: cache_dir,
        tree: TreeService::new(Arc::clone(&router), CREATOR),
        coordinator: MergeCoordinator::new(Arc::clone(&router), CREATOR),
        router,
        backends,
    }
}

pub fn perspective(origin: &str, context: &str, timestamp: i64) -> Perspective {
    Perspective {
        id: None,
        origin: BackendId::new(origin),
        creator_id: CREATOR.to_string(),
        timestamp,
        context: context.to_string(),
        name: "main".to_string(),
    }
}

pub fn text_node(text: &str, links: Vec<Cid>) -> TextNode {
    TextNode {
        id: None,
        text: text.to_string(),
        doc_node_type: NodeType::Paragraph,
        links,
    }
}

/// Create a perspective on the default backend through the router.
pub async fn create_perspective(bed: &TestBed, context: &str, timestamp: i64) -> Cid {
    bed.router
        .create_perspective_in(&backend_id(), perspective(MEM, context, timestamp))
        .await
        .unwrap()
}

/// Commit `text` (with `links`) onto a perspective: create the data and a
/// commit on top of the current head, and move the head to it.
pub async fn commit_node(
    bed: &TestBed,
    perspective_id: &Cid,
    text: &str,
    links: Vec<Cid>,
    timestamp: i64,
) -> Cid {
    let data_id = bed.router.create_data(text_node(text, links)).await.unwrap();
    let parents: Vec<Cid> = bed
        .router
        .get_head(perspective_id)
        .await
        .unwrap()
        .into_iter()
        .collect();
    let commit_id = bed
        .router
        .create_commit(Commit {
            id: None,
            creator_id: CREATOR.to_string(),
            timestamp,
            message: "seed".to_string(),
            parents_ids: parents,
            data_id,
        })
        .await
        .unwrap();
    bed.router
        .update_head(perspective_id, Some(commit_id.clone()))
        .await
        .unwrap();
    commit_id
}

/// Await all optimistic backend writes dispatched so far.
pub async fn drain(bed: &TestBed) {
    bed.router.wait_drained().await.unwrap();
}

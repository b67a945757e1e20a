//! Store contracts and the adapters that live inside the data layer.
//!
//! Each platform (blockchain, IPFS, REST, ...) implements these contracts
//! once; how a call is actually transported is the adapter's own business.
//! The crate ships two adapters: the sled-backed local cache and an
//! in-memory reference adapter.

pub mod local;
pub mod memory;

pub use local::LocalStore;
pub use memory::InMemoryBackend;

use crate::cid::CidConfig;
use crate::error::StoreError;
use crate::types::{Cid, Commit, Draft, MergeRequest, Perspective, TextNode};
use async_trait::async_trait;

/// Perspective/commit store contract, implemented once per platform.
///
/// Reads return `Ok(None)` when the object is absent; errors are reserved
/// for transport and integrity failures. Merge-request and ownership
/// operations default to `Unimplemented` so a backend lacking them fails
/// explicitly instead of silently succeeding.
#[async_trait]
pub trait PerspectiveStore: Send + Sync {
    /// Resolves once the backend is usable.
    async fn ready(&self) -> Result<(), StoreError>;

    /// Kick off any connection handshake. Reads may be issued before this
    /// resolves; they must then wait on `ready`.
    async fn connect(&self) -> Result<(), StoreError> {
        Ok(())
    }

    /// The id configuration native to this backend. All id computation for
    /// writes targeting this backend must use it.
    fn cid_config(&self) -> CidConfig;

    async fn get_perspective(&self, id: &Cid) -> Result<Option<Perspective>, StoreError>;

    async fn get_commit(&self, id: &Cid) -> Result<Option<Commit>, StoreError>;

    /// All perspectives this backend knows for a context.
    async fn get_context_perspectives(&self, context: &str)
        -> Result<Vec<Perspective>, StoreError>;

    /// Store a perspective and return its id, computed under this backend's
    /// native configuration when the record carries none.
    async fn create_perspective(&self, perspective: Perspective) -> Result<Cid, StoreError>;

    async fn create_commit(&self, commit: Commit) -> Result<Cid, StoreError>;

    async fn get_head(&self, perspective_id: &Cid) -> Result<Option<Cid>, StoreError>;

    async fn update_head(
        &self,
        perspective_id: &Cid,
        head_id: Option<Cid>,
    ) -> Result<(), StoreError>;

    async fn get_perspective_owner(
        &self,
        perspective_id: &Cid,
    ) -> Result<Option<String>, StoreError>;

    async fn change_perspective_owner(
        &self,
        _perspective_id: &Cid,
        _new_owner: &str,
    ) -> Result<(), StoreError> {
        Err(StoreError::Unimplemented("change_perspective_owner"))
    }

    async fn create_merge_request(&self, _request: MergeRequest) -> Result<String, StoreError> {
        Err(StoreError::Unimplemented("create_merge_request"))
    }

    async fn get_merge_request(&self, _request_id: &str) -> Result<Option<MergeRequest>, StoreError> {
        Err(StoreError::Unimplemented("get_merge_request"))
    }

    async fn authorize_merge_request(&self, _request_id: &str) -> Result<(), StoreError> {
        Err(StoreError::Unimplemented("authorize_merge_request"))
    }

    async fn execute_merge_request(&self, _request_id: &str) -> Result<(), StoreError> {
        Err(StoreError::Unimplemented("execute_merge_request"))
    }

    async fn get_merge_requests_to(
        &self,
        _perspective_id: &Cid,
    ) -> Result<Vec<MergeRequest>, StoreError> {
        Err(StoreError::Unimplemented("get_merge_requests_to"))
    }
}

/// Data store contract for tree-document fragments.
#[async_trait]
pub trait DataStore: Send + Sync {
    async fn get_data(&self, id: &Cid) -> Result<Option<TextNode>, StoreError>;

    /// Store a text node and return its id, computed under this backend's
    /// native configuration when the record carries none.
    async fn create_data(&self, node: TextNode) -> Result<Cid, StoreError>;
}

/// A full backend adapter: perspective store plus data store.
pub trait Backend: PerspectiveStore + DataStore {}

impl<T: PerspectiveStore + DataStore> Backend for T {}

/// Local-only staging area for uncommitted working copies, keyed by
/// perspective id. Raw key-value contract; no merge or validation logic
/// lives here.
pub trait DraftStore: Send + Sync {
    fn get_draft(&self, perspective_id: &Cid) -> Result<Option<Draft>, StoreError>;
    fn set_draft(&self, perspective_id: &Cid, draft: Draft) -> Result<(), StoreError>;
    fn remove_draft(&self, perspective_id: &Cid) -> Result<(), StoreError>;
}

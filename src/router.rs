//! Cached multi-backend router.
//!
//! Sits in front of the registered backend adapters plus the sled-backed
//! local cache. Reads are read-through: cache hit returns immediately, a
//! miss fans out to every backend concurrently and the first successful
//! response wins (all failures collapse to absent). Writes are optimistic:
//! the cache is updated synchronously under the locally computed id and the
//! backend write is dispatched in the background, tracked by a pending-task
//! counter.
//!
//! No adapter is more authoritative than another for generic reads. Heads
//! and ownership are the exception: they are always resolved against the
//! perspective's `origin` backend so a non-authoritative source cannot
//! spoof state.

use crate::cid::{self, CidConfig};
use crate::error::StoreError;
use crate::store::{Backend, LocalStore};
use crate::types::{BackendId, Cid, Commit, MergeRequest, Perspective, TextNode};
use futures::future::{self, BoxFuture};
use futures::stream::{FuturesUnordered, StreamExt};
use parking_lot::Mutex;
use std::collections::HashMap;
use std::future::Future;
use std::sync::Arc;
use tokio::sync::watch;
use tracing::{debug, warn};

/// Tracks in-flight optimistic backend writes.
///
/// Operations that depend on every pending write having landed (hashing a
/// merge-request payload, applying accumulated head updates) must await
/// `wait_drained` first. This counter is the only synchronization barrier
/// in the system.
pub struct TaskTracker {
    count: watch::Sender<usize>,
    drained: watch::Receiver<usize>,
    errors: Mutex<Vec<StoreError>>,
}

impl TaskTracker {
    fn new() -> Self {
        let (count, drained) = watch::channel(0usize);
        TaskTracker {
            count,
            drained,
            errors: Mutex::new(Vec::new()),
        }
    }

    fn begin(self: &Arc<Self>) -> TaskGuard {
        self.count.send_modify(|c| *c += 1);
        TaskGuard {
            tracker: Arc::clone(self),
        }
    }

    fn record_error(&self, err: StoreError) {
        warn!(error = %err, "deferred backend write failed");
        self.errors.lock().push(err);
    }

    /// Wait until the pending-write counter reaches zero, then surface any
    /// failure collected since the last drain. Once a write has been
    /// dispatched there is no cancellation: a failure here means the cache
    /// may be inconsistent with the backend, and it is not automatically
    /// repaired.
    pub async fn wait_drained(&self) -> Result<(), StoreError> {
        let mut rx = self.drained.clone();
        while *rx.borrow() != 0 {
            if rx.changed().await.is_err() {
                break;
            }
        }

        let mut errors = std::mem::take(&mut *self.errors.lock());
        if errors.is_empty() {
            Ok(())
        } else {
            for extra in errors.drain(1..) {
                warn!(error = %extra, "additional deferred write failure");
            }
            Err(StoreError::DeferredWrite(Box::new(errors.remove(0))))
        }
    }

    pub fn pending(&self) -> usize {
        *self.drained.borrow()
    }
}

struct TaskGuard {
    tracker: Arc<TaskTracker>,
}

impl Drop for TaskGuard {
    fn drop(&mut self) {
        self.tracker.count.send_modify(|c| *c -= 1);
    }
}

pub struct Router {
    backends: HashMap<BackendId, Arc<dyn Backend>>,
    cache: Arc<LocalStore>,
    tracker: Arc<TaskTracker>,
    default_backend: BackendId,
}

impl Router {
    pub fn new(cache: Arc<LocalStore>, default_backend: BackendId) -> Self {
        Router {
            backends: HashMap::new(),
            cache,
            tracker: Arc::new(TaskTracker::new()),
            default_backend,
        }
    }

    pub fn register(&mut self, name: BackendId, backend: Arc<dyn Backend>) {
        self.backends.insert(name, backend);
    }

    pub fn cache(&self) -> &Arc<LocalStore> {
        &self.cache
    }

    pub fn default_backend(&self) -> &BackendId {
        &self.default_backend
    }

    pub fn tracker(&self) -> &Arc<TaskTracker> {
        &self.tracker
    }

    /// Await the pending-write counter reaching zero. See `TaskTracker`.
    pub async fn wait_drained(&self) -> Result<(), StoreError> {
        self.tracker.wait_drained().await
    }

    fn backend(&self, id: &BackendId) -> Result<Arc<dyn Backend>, StoreError> {
        self.backends
            .get(id)
            .cloned()
            .ok_or_else(|| StoreError::UnknownBackend(id.clone()))
    }

    pub fn cid_config_of(&self, backend_id: &BackendId) -> Result<CidConfig, StoreError> {
        Ok(self.backend(backend_id)?.cid_config())
    }

    /// Resolve every registered backend's `ready`.
    pub async fn ready(&self) -> Result<(), StoreError> {
        future::try_join_all(self.backends.values().map(|b| b.ready())).await?;
        Ok(())
    }

    pub async fn connect(&self) -> Result<(), StoreError> {
        future::try_join_all(self.backends.values().map(|b| b.connect())).await?;
        Ok(())
    }

    /// Concurrent fan-out over every backend; the first successful response
    /// carrying an object wins. Individual failures are logged and treated
    /// as absence.
    async fn discover<T, F, Fut>(&self, fetch: F) -> Result<Option<T>, StoreError>
    where
        F: Fn(BackendId, Arc<dyn Backend>) -> Fut,
        Fut: Future<Output = Result<Option<T>, StoreError>>,
    {
        let mut in_flight: FuturesUnordered<_> = self
            .backends
            .iter()
            .map(|(name, backend)| {
                let fut = fetch(name.clone(), Arc::clone(backend));
                let name = name.clone();
                async move { (name, fut.await) }
            })
            .collect();

        while let Some((name, result)) = in_flight.next().await {
            match result {
                Ok(Some(value)) => return Ok(Some(value)),
                Ok(None) => {}
                Err(err) => {
                    warn!(backend = %name, error = %err, "backend read failed during discovery");
                }
            }
        }
        Ok(None)
    }

    /// Read-through perspective fetch. Perspectives reference no other
    /// objects, so a discovery only caches the record itself.
    pub async fn get_perspective(&self, id: &Cid) -> Result<Option<Perspective>, StoreError> {
        if let Some(found) = self.cache.perspective(id)? {
            return Ok(Some(found));
        }

        match self
            .discover(|_, backend| {
                let id = id.clone();
                async move { backend.get_perspective(&id).await }
            })
            .await?
        {
            Some(found) => {
                self.cache.put_perspective(&found)?;
                Ok(Some(found))
            }
            None => Ok(None),
        }
    }

    /// Read-through commit fetch. On a miss the commit and, recursively,
    /// everything it references (parents, data) are pulled into the cache.
    /// Caching the commit before recursing is what bounds traversal on
    /// malformed cyclic histories.
    pub fn get_commit<'a>(&'a self, id: &'a Cid) -> BoxFuture<'a, Result<Option<Commit>, StoreError>> {
        Box::pin(async move {
            if let Some(found) = self.cache.commit(id)? {
                return Ok(Some(found));
            }

            let found = self
                .discover(|_, backend| {
                    let id = id.clone();
                    async move { backend.get_commit(&id).await }
                })
                .await?;

            let commit = match found {
                Some(commit) => commit,
                None => return Ok(None),
            };
            self.cache.put_commit(&commit)?;

            for parent in &commit.parents_ids {
                self.get_commit(parent).await?;
            }
            self.get_data(&commit.data_id).await?;

            Ok(Some(commit))
        })
    }

    /// Read-through data fetch; linked child perspectives are cached too.
    pub fn get_data<'a>(&'a self, id: &'a Cid) -> BoxFuture<'a, Result<Option<TextNode>, StoreError>> {
        Box::pin(async move {
            if let Some(found) = self.cache.data(id)? {
                return Ok(Some(found));
            }

            let found = self
                .discover(|_, backend| {
                    let id = id.clone();
                    async move { backend.get_data(&id).await }
                })
                .await?;

            let node = match found {
                Some(node) => node,
                None => return Ok(None),
            };
            self.cache.put_data(&node)?;

            for link in &node.links {
                self.get_perspective(link).await?;
            }

            Ok(Some(node))
        })
    }

    /// Union of every backend's perspectives for a context, deduplicated by
    /// id and pulled into the cache.
    pub async fn get_context_perspectives(
        &self,
        context: &str,
    ) -> Result<Vec<Perspective>, StoreError> {
        let fetches = self.backends.iter().map(|(name, backend)| {
            let name = name.clone();
            let backend = Arc::clone(backend);
            let context = context.to_string();
            async move { (name, backend.get_context_perspectives(&context).await) }
        });

        let mut merged: Vec<Perspective> = Vec::new();
        for (name, result) in future::join_all(fetches).await {
            match result {
                Ok(found) => {
                    for perspective in found {
                        if !merged.iter().any(|p| p.id == perspective.id) {
                            self.cache.put_perspective(&perspective)?;
                            merged.push(perspective);
                        }
                    }
                }
                Err(err) => {
                    warn!(backend = %name, error = %err, "context lookup failed on backend");
                }
            }
        }
        Ok(merged)
    }

    /// Cache-first context lookup; falls through to the backend fan-out
    /// only when the cache knows nothing for the context.
    pub async fn get_cached_context_perspectives(
        &self,
        context: &str,
    ) -> Result<Vec<Perspective>, StoreError> {
        let cached = self.cache.context_perspectives(context)?;
        if !cached.is_empty() {
            return Ok(cached);
        }
        self.get_context_perspectives(context).await
    }

    pub async fn create_perspective(&self, perspective: Perspective) -> Result<Cid, StoreError> {
        let backend_id = self.default_backend.clone();
        self.create_perspective_in(&backend_id, perspective).await
    }

    /// Optimistic perspective create: the id is computed locally under the
    /// target backend's configuration, the cache is updated synchronously
    /// (including an empty head slot when none exists), and the backend
    /// write is dispatched in the background.
    pub async fn create_perspective_in(
        &self,
        backend_id: &BackendId,
        mut perspective: Perspective,
    ) -> Result<Cid, StoreError> {
        let backend = self.backend(backend_id)?;
        let config = backend.cid_config();

        let computed = cid::generate_id(&perspective, &config);
        if let Some(supplied) = &perspective.id {
            if !cid::validate(supplied, &perspective)? {
                return Err(StoreError::IdMismatch {
                    computed,
                    assigned: supplied.clone(),
                });
            }
        } else {
            perspective.id = Some(computed.clone());
        }
        let id = perspective.id.clone().unwrap_or(computed);

        self.cache.put_perspective(&perspective)?;
        if !self.cache.head_exists(&id)? {
            self.cache.set_head(&id, None)?;
        }

        self.dispatch_create(backend_id.clone(), id.clone(), move |backend| async move {
            backend.create_perspective(perspective).await
        });

        Ok(id)
    }

    pub async fn create_commit(&self, commit: Commit) -> Result<Cid, StoreError> {
        let backend_id = self.default_backend.clone();
        self.create_commit_in(&backend_id, commit).await
    }

    pub async fn create_commit_in(
        &self,
        backend_id: &BackendId,
        mut commit: Commit,
    ) -> Result<Cid, StoreError> {
        let backend = self.backend(backend_id)?;
        let config = backend.cid_config();

        let computed = cid::generate_id(&commit, &config);
        if let Some(supplied) = &commit.id {
            if !cid::validate(supplied, &commit)? {
                return Err(StoreError::IdMismatch {
                    computed,
                    assigned: supplied.clone(),
                });
            }
        } else {
            commit.id = Some(computed.clone());
        }
        let id = commit.id.clone().unwrap_or(computed);

        self.cache.put_commit(&commit)?;

        self.dispatch_create(backend_id.clone(), id.clone(), move |backend| async move {
            backend.create_commit(commit).await
        });

        Ok(id)
    }

    pub async fn create_data(&self, node: TextNode) -> Result<Cid, StoreError> {
        let backend_id = self.default_backend.clone();
        self.create_data_in(&backend_id, node).await
    }

    pub async fn create_data_in(
        &self,
        backend_id: &BackendId,
        mut node: TextNode,
    ) -> Result<Cid, StoreError> {
        let backend = self.backend(backend_id)?;
        let config = backend.cid_config();

        let computed = cid::generate_id(&node, &config);
        if let Some(supplied) = &node.id {
            if !cid::validate(supplied, &node)? {
                return Err(StoreError::IdMismatch {
                    computed,
                    assigned: supplied.clone(),
                });
            }
        } else {
            node.id = Some(computed.clone());
        }
        let id = node.id.clone().unwrap_or(computed);

        self.cache.put_data(&node)?;

        self.dispatch_create(backend_id.clone(), id.clone(), move |backend| async move {
            backend.create_data(node).await
        });

        Ok(id)
    }

    /// Dispatch a tracked background create. A backend-assigned id that
    /// differs from the locally computed one is fatal for that call: it is
    /// recorded as `IdMismatch`, never retried, and nothing is cached under
    /// the mismatched id.
    fn dispatch_create<F, Fut>(&self, backend_id: BackendId, computed: Cid, create: F)
    where
        F: FnOnce(Arc<dyn Backend>) -> Fut + Send + 'static,
        Fut: Future<Output = Result<Cid, StoreError>> + Send + 'static,
    {
        let backend = match self.backend(&backend_id) {
            Ok(backend) => backend,
            Err(err) => {
                self.tracker.record_error(err);
                return;
            }
        };
        let tracker = Arc::clone(&self.tracker);
        let guard = self.tracker.begin();

        tokio::spawn(async move {
            let _guard = guard;
            match create(backend).await {
                Ok(assigned) if assigned == computed => {
                    debug!(backend = %backend_id, id = %assigned, "optimistic create landed");
                }
                Ok(assigned) => {
                    tracker.record_error(StoreError::IdMismatch {
                        computed,
                        assigned,
                    });
                }
                Err(err) => {
                    tracker.record_error(err);
                }
            }
        });
    }

    /// Head of a perspective, served from the cache when a head slot
    /// exists, otherwise resolved from `origin`.
    pub async fn get_head(&self, perspective_id: &Cid) -> Result<Option<Cid>, StoreError> {
        if let Some(cached) = self.cache.head(perspective_id)? {
            return Ok(cached);
        }
        self.get_remote_head(perspective_id).await
    }

    /// Authoritative head, always read from the perspective's `origin`.
    /// An origin failure is the caller's problem; serving the cached head
    /// instead would let reconciliation compare the cache against itself.
    pub async fn get_remote_head(&self, perspective_id: &Cid) -> Result<Option<Cid>, StoreError> {
        let perspective = match self.get_perspective(perspective_id).await? {
            Some(perspective) => perspective,
            None => return Ok(None),
        };

        let backend = self.backend(&perspective.origin)?;
        match backend.get_head(perspective_id).await {
            Ok(head) => {
                self.cache.set_head(perspective_id, head.clone())?;
                Ok(head)
            }
            Err(err) => {
                warn!(
                    backend = %perspective.origin,
                    error = %err,
                    "origin head read failed"
                );
                Err(err)
            }
        }
    }

    /// Optimistic head update against the perspective's `origin`. The cache
    /// value is advisory only; the authoritative value is re-read from
    /// `origin` on the next remote fetch.
    pub async fn update_head(
        &self,
        perspective_id: &Cid,
        head_id: Option<Cid>,
    ) -> Result<(), StoreError> {
        let perspective = self
            .get_perspective(perspective_id)
            .await?
            .ok_or_else(|| StoreError::NotFound(perspective_id.clone()))?;
        let backend = self.backend(&perspective.origin)?;

        self.cache.set_head(perspective_id, head_id.clone())?;

        let tracker = Arc::clone(&self.tracker);
        let guard = self.tracker.begin();
        let perspective_id = perspective_id.clone();
        tokio::spawn(async move {
            let _guard = guard;
            if let Err(err) = backend.update_head(&perspective_id, head_id).await {
                tracker.record_error(err);
            }
        });
        Ok(())
    }

    /// Ownership is origin-scoped and never served from the cache.
    pub async fn get_perspective_owner(
        &self,
        perspective_id: &Cid,
    ) -> Result<Option<String>, StoreError> {
        let perspective = match self.get_perspective(perspective_id).await? {
            Some(perspective) => perspective,
            None => return Ok(None),
        };
        self.backend(&perspective.origin)?
            .get_perspective_owner(perspective_id)
            .await
    }

    pub async fn change_perspective_owner(
        &self,
        perspective_id: &Cid,
        new_owner: &str,
    ) -> Result<(), StoreError> {
        let perspective = self
            .get_perspective(perspective_id)
            .await?
            .ok_or_else(|| StoreError::NotFound(perspective_id.clone()))?;
        self.backend(&perspective.origin)?
            .change_perspective_owner(perspective_id, new_owner)
            .await
    }

    pub async fn create_merge_request_in(
        &self,
        backend_id: &BackendId,
        request: MergeRequest,
    ) -> Result<String, StoreError> {
        self.backend(backend_id)?.create_merge_request(request).await
    }

    pub async fn get_merge_requests_to(
        &self,
        perspective_id: &Cid,
    ) -> Result<Vec<MergeRequest>, StoreError> {
        let perspective = self
            .get_perspective(perspective_id)
            .await?
            .ok_or_else(|| StoreError::NotFound(perspective_id.clone()))?;
        self.backend(&perspective.origin)?
            .get_merge_requests_to(perspective_id)
            .await
    }

    pub async fn authorize_merge_request_in(
        &self,
        request_id: &str,
        perspective_id: &Cid,
    ) -> Result<(), StoreError> {
        let perspective = self
            .get_perspective(perspective_id)
            .await?
            .ok_or_else(|| StoreError::NotFound(perspective_id.clone()))?;
        self.backend(&perspective.origin)?
            .authorize_merge_request(request_id)
            .await
    }

    pub async fn execute_merge_request_in(
        &self,
        request_id: &str,
        perspective_id: &Cid,
    ) -> Result<(), StoreError> {
        let perspective = self
            .get_perspective(perspective_id)
            .await?
            .ok_or_else(|| StoreError::NotFound(perspective_id.clone()))?;
        self.backend(&perspective.origin)?
            .execute_merge_request(request_id)
            .await
    }
}

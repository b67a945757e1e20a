//! In-memory backend adapter.
//!
//! Reference implementation of the store contracts, also the workhorse of
//! the test suites. Supports the full surface including ownership and merge
//! requests, plus fault hooks to exercise the router's failure paths.

use crate::cid::{self, CidConfig};
use crate::error::StoreError;
use crate::types::{BackendId, Cid, Commit, MergeRequest, Perspective, TextNode};
use async_trait::async_trait;
use parking_lot::RwLock;
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};

#[derive(Default)]
struct State {
    perspectives: HashMap<Cid, Perspective>,
    commits: HashMap<Cid, Commit>,
    data: HashMap<Cid, TextNode>,
    heads: HashMap<Cid, Option<Cid>>,
    owners: HashMap<Cid, String>,
    requests: HashMap<String, MergeRequest>,
    next_request_id: u64,
}

pub struct InMemoryBackend {
    name: BackendId,
    config: CidConfig,
    state: RwLock<State>,
    /// When set, every read fails with a backend error.
    fail_reads: AtomicBool,
    /// When set, create calls store correctly but report a mangled id,
    /// simulating a backend that disagrees on content addressing.
    mangle_created_ids: AtomicBool,
    read_calls: AtomicUsize,
}

impl InMemoryBackend {
    pub fn new(name: impl Into<String>) -> Self {
        Self::with_config(name, CidConfig::default())
    }

    pub fn with_config(name: impl Into<String>, config: CidConfig) -> Self {
        InMemoryBackend {
            name: BackendId::new(name),
            config,
            state: RwLock::new(State::default()),
            fail_reads: AtomicBool::new(false),
            mangle_created_ids: AtomicBool::new(false),
            read_calls: AtomicUsize::new(0),
        }
    }

    pub fn name(&self) -> &BackendId {
        &self.name
    }

    pub fn set_fail_reads(&self, fail: bool) {
        self.fail_reads.store(fail, Ordering::SeqCst);
    }

    pub fn set_mangle_created_ids(&self, mangle: bool) {
        self.mangle_created_ids.store(mangle, Ordering::SeqCst);
    }

    /// Number of read calls served (or refused) so far.
    pub fn read_calls(&self) -> usize {
        self.read_calls.load(Ordering::SeqCst)
    }

    fn check_read(&self) -> Result<(), StoreError> {
        self.read_calls.fetch_add(1, Ordering::SeqCst);
        if self.fail_reads.load(Ordering::SeqCst) {
            return Err(StoreError::Backend {
                backend: self.name.clone(),
                detail: "reads disabled".to_string(),
            });
        }
        Ok(())
    }

    fn assigned_id(&self, computed: Cid) -> Cid {
        if self.mangle_created_ids.load(Ordering::SeqCst) {
            Cid::new(format!("{}0", computed))
        } else {
            computed
        }
    }
}

#[async_trait]
impl super::PerspectiveStore for InMemoryBackend {
    async fn ready(&self) -> Result<(), StoreError> {
        Ok(())
    }

    fn cid_config(&self) -> CidConfig {
        self.config
    }

    async fn get_perspective(&self, id: &Cid) -> Result<Option<Perspective>, StoreError> {
        self.check_read()?;
        Ok(self.state.read().perspectives.get(id).cloned())
    }

    async fn get_commit(&self, id: &Cid) -> Result<Option<Commit>, StoreError> {
        self.check_read()?;
        Ok(self.state.read().commits.get(id).cloned())
    }

    async fn get_context_perspectives(
        &self,
        context: &str,
    ) -> Result<Vec<Perspective>, StoreError> {
        self.check_read()?;
        Ok(self
            .state
            .read()
            .perspectives
            .values()
            .filter(|p| p.context == context)
            .cloned()
            .collect())
    }

    async fn create_perspective(&self, mut perspective: Perspective) -> Result<Cid, StoreError> {
        let computed = match &perspective.id {
            Some(id) if cid::validate(id, &perspective)? => id.clone(),
            _ => cid::generate_id(&perspective, &self.config),
        };
        perspective.id = Some(computed.clone());

        let mut state = self.state.write();
        state
            .owners
            .entry(computed.clone())
            .or_insert_with(|| perspective.creator_id.clone());
        state.heads.entry(computed.clone()).or_insert(None);
        state.perspectives.insert(computed.clone(), perspective);
        drop(state);

        Ok(self.assigned_id(computed))
    }

    async fn create_commit(&self, mut commit: Commit) -> Result<Cid, StoreError> {
        let computed = match &commit.id {
            Some(id) if cid::validate(id, &commit)? => id.clone(),
            _ => cid::generate_id(&commit, &self.config),
        };
        commit.id = Some(computed.clone());
        self.state.write().commits.insert(computed.clone(), commit);
        Ok(self.assigned_id(computed))
    }

    async fn get_head(&self, perspective_id: &Cid) -> Result<Option<Cid>, StoreError> {
        self.check_read()?;
        Ok(self
            .state
            .read()
            .heads
            .get(perspective_id)
            .cloned()
            .flatten())
    }

    async fn update_head(
        &self,
        perspective_id: &Cid,
        head_id: Option<Cid>,
    ) -> Result<(), StoreError> {
        self.state
            .write()
            .heads
            .insert(perspective_id.clone(), head_id);
        Ok(())
    }

    async fn get_perspective_owner(
        &self,
        perspective_id: &Cid,
    ) -> Result<Option<String>, StoreError> {
        self.check_read()?;
        Ok(self.state.read().owners.get(perspective_id).cloned())
    }

    async fn change_perspective_owner(
        &self,
        perspective_id: &Cid,
        new_owner: &str,
    ) -> Result<(), StoreError> {
        self.state
            .write()
            .owners
            .insert(perspective_id.clone(), new_owner.to_string());
        Ok(())
    }

    async fn create_merge_request(&self, mut request: MergeRequest) -> Result<String, StoreError> {
        let mut state = self.state.write();
        state.next_request_id += 1;
        let id = state.next_request_id.to_string();
        request.id = Some(id.clone());
        request.status = Some(0);
        request.authorized = Some(0);
        state.requests.insert(id.clone(), request);
        Ok(id)
    }

    async fn get_merge_request(&self, request_id: &str) -> Result<Option<MergeRequest>, StoreError> {
        self.check_read()?;
        Ok(self.state.read().requests.get(request_id).cloned())
    }

    async fn authorize_merge_request(&self, request_id: &str) -> Result<(), StoreError> {
        let mut state = self.state.write();
        match state.requests.get_mut(request_id) {
            Some(request) => {
                request.authorized = Some(1);
                Ok(())
            }
            None => Err(StoreError::Backend {
                backend: self.name.clone(),
                detail: format!("unknown merge request {request_id}"),
            }),
        }
    }

    async fn execute_merge_request(&self, request_id: &str) -> Result<(), StoreError> {
        let mut state = self.state.write();
        let request = match state.requests.get(request_id) {
            Some(request) if request.authorized == Some(1) => request.clone(),
            Some(_) => {
                return Err(StoreError::Backend {
                    backend: self.name.clone(),
                    detail: format!("merge request {request_id} not authorized"),
                })
            }
            None => {
                return Err(StoreError::Backend {
                    backend: self.name.clone(),
                    detail: format!("unknown merge request {request_id}"),
                })
            }
        };

        // Head updates are keyed by perspective-id hash; resolve against the
        // perspectives this backend hosts.
        let targets: Vec<(Cid, Cid)> = request
            .head_updates
            .iter()
            .filter_map(|update| {
                state
                    .perspectives
                    .keys()
                    .find(|pid| cid::hash_cid(pid, &self.config) == update.perspective_id_hash)
                    .map(|pid| (pid.clone(), update.head_id.clone()))
            })
            .collect();
        for (pid, head) in targets {
            state.heads.insert(pid, Some(head));
        }

        if let Some(request) = state.requests.get_mut(request_id) {
            request.status = Some(1);
            for update in &mut request.head_updates {
                update.executed = 1;
            }
        }
        Ok(())
    }

    async fn get_merge_requests_to(
        &self,
        perspective_id: &Cid,
    ) -> Result<Vec<MergeRequest>, StoreError> {
        self.check_read()?;
        Ok(self
            .state
            .read()
            .requests
            .values()
            .filter(|r| &r.to_perspective_id == perspective_id)
            .cloned()
            .collect())
    }
}

#[async_trait]
impl super::DataStore for InMemoryBackend {
    async fn get_data(&self, id: &Cid) -> Result<Option<TextNode>, StoreError> {
        self.check_read()?;
        Ok(self.state.read().data.get(id).cloned())
    }

    async fn create_data(&self, mut node: TextNode) -> Result<Cid, StoreError> {
        let computed = match &node.id {
            Some(id) if cid::validate(id, &node)? => id.clone(),
            _ => cid::generate_id(&node, &self.config),
        };
        node.id = Some(computed.clone());
        self.state.write().data.insert(computed.clone(), node);
        Ok(self.assigned_id(computed))
    }
}

//! Sled-backed local store.
//!
//! Backs both the router's read-through cache and the draft staging area.
//! Values are bincode-encoded; perspectives get a secondary index by
//! context through a prefixed key scan.
//!
//! The head slot is explicit: a perspective whose head was cached as "none
//! yet" is distinguishable from a perspective whose head was never cached.
//! Only the router's origin-scoped path may treat the slot as advisory.

use crate::error::StoreError;
use crate::types::{Cid, Commit, Draft, Perspective, TextNode};
use std::path::Path;

/// Separator between context and perspective id in the context index key.
/// Neither side may contain a NUL, which holds for id strings and for the
/// hashed context ids this layer produces.
const CONTEXT_KEY_SEP: u8 = 0;

pub struct LocalStore {
    perspectives: sled::Tree,
    commits: sled::Tree,
    data: sled::Tree,
    heads: sled::Tree,
    drafts: sled::Tree,
    contexts: sled::Tree,
}

impl LocalStore {
    /// Open (or create) a local store at the given path.
    pub fn open<P: AsRef<Path>>(path: P) -> Result<Self, StoreError> {
        let db = sled::open(path)?;
        Ok(LocalStore {
            perspectives: db.open_tree("perspectives")?,
            commits: db.open_tree("commits")?,
            data: db.open_tree("data")?,
            heads: db.open_tree("heads")?,
            drafts: db.open_tree("drafts")?,
            contexts: db.open_tree("contexts")?,
        })
    }

    pub fn perspective(&self, id: &Cid) -> Result<Option<Perspective>, StoreError> {
        match self.perspectives.get(id.as_str().as_bytes())? {
            Some(bytes) => Ok(Some(bincode::deserialize(&bytes)?)),
            None => Ok(None),
        }
    }

    pub fn put_perspective(&self, perspective: &Perspective) -> Result<(), StoreError> {
        let id = perspective
            .id
            .as_ref()
            .ok_or_else(|| StoreError::MalformedId("perspective without id".to_string()))?;
        let value = bincode::serialize(perspective)?;
        self.perspectives.insert(id.as_str().as_bytes(), value)?;

        let mut context_key = perspective.context.as_bytes().to_vec();
        context_key.push(CONTEXT_KEY_SEP);
        context_key.extend_from_slice(id.as_str().as_bytes());
        self.contexts
            .insert(context_key, id.as_str().as_bytes())?;
        Ok(())
    }

    pub fn commit(&self, id: &Cid) -> Result<Option<Commit>, StoreError> {
        match self.commits.get(id.as_str().as_bytes())? {
            Some(bytes) => Ok(Some(bincode::deserialize(&bytes)?)),
            None => Ok(None),
        }
    }

    pub fn put_commit(&self, commit: &Commit) -> Result<(), StoreError> {
        let id = commit
            .id
            .as_ref()
            .ok_or_else(|| StoreError::MalformedId("commit without id".to_string()))?;
        let value = bincode::serialize(commit)?;
        self.commits.insert(id.as_str().as_bytes(), value)?;
        Ok(())
    }

    pub fn data(&self, id: &Cid) -> Result<Option<TextNode>, StoreError> {
        match self.data.get(id.as_str().as_bytes())? {
            Some(bytes) => Ok(Some(bincode::deserialize(&bytes)?)),
            None => Ok(None),
        }
    }

    pub fn put_data(&self, node: &TextNode) -> Result<(), StoreError> {
        let id = node
            .id
            .as_ref()
            .ok_or_else(|| StoreError::MalformedId("text node without id".to_string()))?;
        let value = bincode::serialize(node)?;
        self.data.insert(id.as_str().as_bytes(), value)?;
        Ok(())
    }

    /// All cached perspectives for a context, by index scan.
    pub fn context_perspectives(&self, context: &str) -> Result<Vec<Perspective>, StoreError> {
        let mut prefix = context.as_bytes().to_vec();
        prefix.push(CONTEXT_KEY_SEP);

        let mut found = Vec::new();
        for entry in self.contexts.scan_prefix(prefix) {
            let (_, id_bytes) = entry?;
            let id = Cid::new(String::from_utf8_lossy(&id_bytes).to_string());
            if let Some(perspective) = self.perspective(&id)? {
                found.push(perspective);
            }
        }
        Ok(found)
    }

    /// Whether a head slot exists for the perspective, regardless of its
    /// value.
    pub fn head_exists(&self, perspective_id: &Cid) -> Result<bool, StoreError> {
        Ok(self.heads.contains_key(perspective_id.as_str().as_bytes())?)
    }

    /// Cached head value. `Ok(None)` means the slot was never written;
    /// `Ok(Some(None))` means the head was cached as unset.
    pub fn head(&self, perspective_id: &Cid) -> Result<Option<Option<Cid>>, StoreError> {
        match self.heads.get(perspective_id.as_str().as_bytes())? {
            Some(bytes) => Ok(Some(bincode::deserialize(&bytes)?)),
            None => Ok(None),
        }
    }

    pub fn set_head(&self, perspective_id: &Cid, head_id: Option<Cid>) -> Result<(), StoreError> {
        let value = bincode::serialize(&head_id)?;
        self.heads
            .insert(perspective_id.as_str().as_bytes(), value)?;
        Ok(())
    }
}

impl super::DraftStore for LocalStore {
    fn get_draft(&self, perspective_id: &Cid) -> Result<Option<Draft>, StoreError> {
        match self.drafts.get(perspective_id.as_str().as_bytes())? {
            Some(bytes) => Ok(Some(bincode::deserialize(&bytes)?)),
            None => Ok(None),
        }
    }

    fn set_draft(&self, perspective_id: &Cid, draft: Draft) -> Result<(), StoreError> {
        let value = bincode::serialize(&draft)?;
        self.drafts
            .insert(perspective_id.as_str().as_bytes(), value)?;
        Ok(())
    }

    fn remove_draft(&self, perspective_id: &Cid) -> Result<(), StoreError> {
        self.drafts.remove(perspective_id.as_str().as_bytes())?;
        Ok(())
    }
}

//! Braid: Content-Addressed Perspective Data Layer
//!
//! A local-first, multi-backend data layer for tree documents: perspectives
//! (branch-like pointers) and commits (immutable snapshots) addressed by
//! content-derived ids, cached locally, written optimistically, and merged
//! by context.

pub mod cid;
pub mod config;
pub mod error;
pub mod logging;
pub mod merge;
pub mod requests;
pub mod router;
pub mod store;
pub mod tree;
pub mod types;

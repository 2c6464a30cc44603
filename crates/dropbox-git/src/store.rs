//! Abstract blob store interface.
//!
//! The remote is modeled as a file service where every file carries an
//! opaque revision tag that changes on each write. Conditional writes
//! against those tags (and against absence) are the only primitives the
//! engine needs to build a transactional ref database.

use std::collections::HashMap;
use std::fmt;
use std::sync::Mutex;

use async_trait::async_trait;
use thiserror::Error;

/// Opaque server-assigned revision tag.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord)]
pub struct Rev(pub String);

impl Rev {
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for Rev {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

#[derive(Error, Debug)]
pub enum StoreError {
    #[error("not found: {0}")]
    NotFound(String),

    #[error("already exists: {0}")]
    AlreadyExists(String),

    #[error("revision mismatch on {0}")]
    RevMismatch(String),

    #[error("authentication rejected: {0}")]
    Auth(String),

    /// Network failure, rate limiting, or a service-side 5xx. Retryable.
    #[error("transient store failure: {0}")]
    Transient(String),

    #[error("{0}")]
    Other(String),
}

impl StoreError {
    pub fn is_transient(&self) -> bool {
        matches!(self, StoreError::Transient(_))
    }
}

/// A file service with revision-tagged conditional writes.
///
/// `put_create` fails if the path exists; `put_update` fails unless the
/// current revision matches; `delete` is likewise conditional. Absence of a
/// file is a distinguishable precondition, which is what makes ref creation
/// race-safe.
#[async_trait]
pub trait BlobStore: Send + Sync {
    async fn get(&self, path: &str) -> Result<(Vec<u8>, Rev), StoreError>;

    /// All files under `prefix`, recursively. `NotFound` if the folder
    /// itself does not exist.
    async fn list(&self, prefix: &str) -> Result<Vec<(String, Rev)>, StoreError>;

    async fn put_create(&self, path: &str, data: Vec<u8>) -> Result<Rev, StoreError>;

    async fn put_update(
        &self,
        path: &str,
        data: Vec<u8>,
        expected: &Rev,
    ) -> Result<Rev, StoreError>;

    async fn put_overwrite(&self, path: &str, data: Vec<u8>) -> Result<Rev, StoreError>;

    async fn delete(&self, path: &str, expected: &Rev) -> Result<(), StoreError>;
}

/// In-memory [`BlobStore`] with the same conditional-write semantics as the
/// real backend. Used by the test suites; also handy for offline
/// experiments.
#[derive(Default)]
pub struct MemoryStore {
    state: Mutex<MemoryState>,
}

#[derive(Default)]
struct MemoryState {
    files: HashMap<String, (Vec<u8>, u64)>,
    next_rev: u64,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    fn rev_tag(counter: u64) -> Rev {
        Rev(format!("mem-{:08x}", counter))
    }

    fn parse_rev(rev: &Rev) -> Option<u64> {
        rev.0.strip_prefix("mem-").and_then(|s| u64::from_str_radix(s, 16).ok())
    }
}

#[async_trait]
impl BlobStore for MemoryStore {
    async fn get(&self, path: &str) -> Result<(Vec<u8>, Rev), StoreError> {
        let state = self.state.lock().map_err(|e| StoreError::Other(e.to_string()))?;
        state
            .files
            .get(path)
            .map(|(data, rev)| (data.clone(), Self::rev_tag(*rev)))
            .ok_or_else(|| StoreError::NotFound(path.into()))
    }

    async fn list(&self, prefix: &str) -> Result<Vec<(String, Rev)>, StoreError> {
        let state = self.state.lock().map_err(|e| StoreError::Other(e.to_string()))?;
        let folder = format!("{}/", prefix.trim_end_matches('/'));
        let mut entries: Vec<(String, Rev)> = state
            .files
            .iter()
            .filter(|(path, _)| path.starts_with(&folder))
            .map(|(path, (_, rev))| (path.clone(), Self::rev_tag(*rev)))
            .collect();
        if entries.is_empty() {
            return Err(StoreError::NotFound(prefix.into()));
        }
        entries.sort();
        Ok(entries)
    }

    async fn put_create(&self, path: &str, data: Vec<u8>) -> Result<Rev, StoreError> {
        let mut state = self.state.lock().map_err(|e| StoreError::Other(e.to_string()))?;
        if state.files.contains_key(path) {
            return Err(StoreError::AlreadyExists(path.into()));
        }
        state.next_rev += 1;
        let rev = state.next_rev;
        state.files.insert(path.to_string(), (data, rev));
        Ok(Self::rev_tag(rev))
    }

    async fn put_update(
        &self,
        path: &str,
        data: Vec<u8>,
        expected: &Rev,
    ) -> Result<Rev, StoreError> {
        let mut state = self.state.lock().map_err(|e| StoreError::Other(e.to_string()))?;
        let current = match state.files.get(path) {
            Some((_, rev)) => *rev,
            None => return Err(StoreError::RevMismatch(path.into())),
        };
        if Self::parse_rev(expected) != Some(current) {
            return Err(StoreError::RevMismatch(path.into()));
        }
        state.next_rev += 1;
        let rev = state.next_rev;
        state.files.insert(path.to_string(), (data, rev));
        Ok(Self::rev_tag(rev))
    }

    async fn put_overwrite(&self, path: &str, data: Vec<u8>) -> Result<Rev, StoreError> {
        let mut state = self.state.lock().map_err(|e| StoreError::Other(e.to_string()))?;
        state.next_rev += 1;
        let rev = state.next_rev;
        state.files.insert(path.to_string(), (data, rev));
        Ok(Self::rev_tag(rev))
    }

    async fn delete(&self, path: &str, expected: &Rev) -> Result<(), StoreError> {
        let mut state = self.state.lock().map_err(|e| StoreError::Other(e.to_string()))?;
        let current = match state.files.get(path) {
            Some((_, rev)) => *rev,
            None => return Err(StoreError::NotFound(path.into())),
        };
        if Self::parse_rev(expected) != Some(current) {
            return Err(StoreError::RevMismatch(path.into()));
        }
        state.files.remove(path);
        Ok(())
    }
}

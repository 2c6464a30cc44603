//! Ref database over the blob store.
//!
//! Every mutation is a conditional write against the revision tag observed
//! when the caller decided to mutate. A lost race surfaces as
//! [`Error::Conflict`] and is never retried; the user fetches and tries
//! again, exactly as with a native remote.

use std::collections::HashMap;
use std::sync::Arc;

use futures::future::join_all;
use tracing::{debug, warn};

use crate::error::{Error, Result};
use crate::object::ObjectId;
use crate::refs::{self, Ref};
use crate::retry::{with_retry, RetryPolicy};
use crate::store::{BlobStore, Rev, StoreError};

/// Precondition for a ref write.
#[derive(Debug, Clone)]
pub enum Expect {
    /// The ref must not exist yet.
    Absent,
    /// The ref must still carry this revision tag.
    Rev(Rev),
}

pub struct RefStore {
    store: Arc<dyn BlobStore>,
    root: String,
    retry: RetryPolicy,
}

impl RefStore {
    pub fn new(store: Arc<dyn BlobStore>, root: impl Into<String>) -> Self {
        Self {
            store,
            root: root.into(),
            retry: RetryPolicy::default(),
        }
    }

    pub fn root(&self) -> &str {
        &self.root
    }

    /// All direct refs on the remote with their revision tags.
    ///
    /// `None` means the repository has no `refs/` folder at all (nothing was
    /// ever pushed), which callers treat differently from an empty map.
    /// Files whose contents are not a ref are skipped with a warning.
    pub async fn list_refs(&self) -> Result<Option<HashMap<String, (ObjectId, Rev)>>> {
        let prefix = format!("{}/refs", self.root);
        let entries = match with_retry(&self.retry, || {
            let store = self.store.clone();
            let prefix = prefix.clone();
            async move { store.list(&prefix).await }
        })
        .await
        {
            Ok(entries) => entries,
            Err(StoreError::NotFound(_)) => return Ok(None),
            Err(err) => return Err(err.into()),
        };

        let fetches = entries.into_iter().map(|(path, _)| {
            let store = self.store.clone();
            let retry = self.retry.clone();
            async move {
                let result = with_retry(&retry, || {
                    let store = store.clone();
                    let path = path.clone();
                    async move { store.get(&path).await }
                })
                .await;
                (path, result)
            }
        });

        let mut map = HashMap::new();
        for (path, result) in join_all(fetches).await {
            let (data, rev) = match result {
                Ok(ok) => ok,
                // deleted between list and get; a ref that is gone is not
                // part of the snapshot
                Err(StoreError::NotFound(_)) => continue,
                Err(err) => return Err(err.into()),
            };
            let name = refs::ref_name_from_path(&self.root, &path)?;
            match Ref::parse(&data) {
                Some(Ref::Direct(id)) => {
                    map.insert(name, (id, rev));
                }
                _ => {
                    warn!(%path, "ignoring ref with invalid contents");
                }
            }
        }
        Ok(Some(map))
    }

    /// Read a symbolic ref such as `HEAD`.
    pub async fn read_symbolic(&self, name: &str) -> Result<Option<(String, Rev)>> {
        let path = refs::symbolic_ref_path(&self.root, name);
        let result = with_retry(&self.retry, || {
            let store = self.store.clone();
            let path = path.clone();
            async move { store.get(&path).await }
        })
        .await;
        match result {
            Ok((data, rev)) => match Ref::parse(&data) {
                Some(Ref::Symbolic(target)) => Ok(Some((target, rev))),
                _ => {
                    warn!(%path, "symbolic ref has invalid contents");
                    Ok(None)
                }
            },
            Err(StoreError::NotFound(_)) => Ok(None),
            Err(err) => Err(err.into()),
        }
    }

    /// Write a symbolic ref under the given precondition.
    pub async fn write_symbolic(&self, name: &str, target: &str, expect: Expect) -> Result<Rev> {
        let path = refs::symbolic_ref_path(&self.root, name);
        let data = Ref::Symbolic(target.to_string()).to_bytes();
        debug!(name, target, ?expect, "writing symbolic ref");
        self.conditional_put(&path, data, expect).await
    }

    /// Point a direct ref at an object under the given precondition.
    ///
    /// The caller is responsible for having uploaded the object's closure
    /// first; this method only performs the guarded write.
    pub async fn update_ref(&self, name: &str, id: &ObjectId, expect: Expect) -> Result<Rev> {
        let path = refs::ref_path(&self.root, name)?;
        let data = Ref::Direct(*id).to_bytes();
        debug!(name, %id, ?expect, "updating ref");
        self.conditional_put(&path, data, expect).await
    }

    async fn conditional_put(&self, path: &str, data: Vec<u8>, expect: Expect) -> Result<Rev> {
        let result = match expect {
            Expect::Absent => {
                with_retry(&self.retry, || {
                    let store = self.store.clone();
                    let path = path.to_string();
                    let data = data.clone();
                    async move { store.put_create(&path, data).await }
                })
                .await
            }
            Expect::Rev(rev) => {
                with_retry(&self.retry, || {
                    let store = self.store.clone();
                    let path = path.to_string();
                    let data = data.clone();
                    let rev = rev.clone();
                    async move { store.put_update(&path, data, &rev).await }
                })
                .await
            }
        };
        result.map_err(|err| match err {
            StoreError::AlreadyExists(_) | StoreError::RevMismatch(_) => {
                Error::Conflict(path.to_string())
            }
            other => other.into(),
        })
    }

    /// Delete a direct ref, guarded by its observed revision. Deleting the
    /// branch HEAD points at is refused.
    pub async fn delete_ref(&self, name: &str, expected: &Rev) -> Result<()> {
        if let Some((target, _)) = self.read_symbolic(refs::HEAD).await? {
            if target == name {
                return Err(Error::HeadProtected(name.to_string()));
            }
        }
        let path = refs::ref_path(&self.root, name)?;
        debug!(name, "deleting ref");
        let result = with_retry(&self.retry, || {
            let store = self.store.clone();
            let path = path.clone();
            let rev = expected.clone();
            async move { store.delete(&path, &rev).await }
        })
        .await;
        match result {
            Ok(()) => Ok(()),
            // someone else deleted it first, which is the outcome we wanted
            Err(StoreError::NotFound(_)) => Ok(()),
            Err(StoreError::RevMismatch(_)) => Err(Error::Conflict(name.to_string())),
            Err(err) => Err(err.into()),
        }
    }
}

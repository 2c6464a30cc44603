//! Core engine for using Dropbox as a git remote.
//!
//! The pieces here are backend-agnostic: everything talks to the remote
//! through the [`store::BlobStore`] trait, which models a file service with
//! per-file revision tags. Compare-and-swap on those tags is what turns a
//! plain file API into a safe, concurrent ref database.

pub mod error;
pub mod git;
pub mod object;
pub mod refs;
pub mod refstore;
pub mod retry;
pub mod store;
pub mod transfer;

pub use error::{Error, Result};
pub use git::GitProcess;
pub use object::{ObjectId, ObjectType};
pub use refstore::RefStore;
pub use store::{BlobStore, Rev, StoreError};
pub use transfer::Transfer;

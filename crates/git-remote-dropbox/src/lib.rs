//! Git remote helper for Dropbox.
//!
//! Usage: git remote add origin dropbox:///path/to/repo
//!        git push origin master
//!        git pull origin master
//!
//! The helper implements the git remote helper protocol:
//! https://git-scm.com/docs/gitremote-helpers

pub mod credentials;
pub mod helper;
pub mod url;

pub use credentials::Credentials;
pub use helper::Helper;
pub use url::{parse_remote_url, RemoteUrl, TokenSelector};

//! Git references as stored on the remote.
//!
//! A direct ref file holds `"<hash>\n"`; a symbolic ref holds
//! `"ref: <target>\n"`. The byte formats are exact: copied verbatim into a
//! bare repository these files are valid git refs.

use crate::error::{Error, Result};
use crate::object::ObjectId;

pub const HEAD: &str = "HEAD";
pub const REFS_HEADS: &str = "refs/heads/";

/// A ref value: either an object hash or a pointer to another ref.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Ref {
    Direct(ObjectId),
    Symbolic(String),
}

impl Ref {
    /// Parse the contents of a ref file.
    pub fn parse(data: &[u8]) -> Option<Self> {
        let text = std::str::from_utf8(data).ok()?;
        let text = text.trim_end();
        if let Some(target) = text.strip_prefix("ref: ") {
            if target.is_empty() {
                return None;
            }
            Some(Ref::Symbolic(target.to_string()))
        } else {
            ObjectId::from_hex(text).map(Ref::Direct)
        }
    }

    /// Serialize to the exact on-store byte format.
    pub fn to_bytes(&self) -> Vec<u8> {
        match self {
            Ref::Direct(id) => format!("{}\n", id.to_hex()).into_bytes(),
            Ref::Symbolic(target) => format!("ref: {}\n", target).into_bytes(),
        }
    }
}

/// Store path of a named ref. Direct refs must live under `refs/`.
pub fn ref_path(root: &str, name: &str) -> Result<String> {
    if !name.starts_with("refs/") {
        return Err(Error::Protocol(format!("invalid ref name: {}", name)));
    }
    Ok(format!("{}/{}", root, name))
}

/// Store path of a symbolic ref (e.g. `HEAD`), which lives at the top level.
pub fn symbolic_ref_path(root: &str, name: &str) -> String {
    format!("{}/{}", root, name)
}

/// Recover a ref name from its full store path.
pub fn ref_name_from_path(root: &str, path: &str) -> Result<String> {
    let prefix = format!("{}/", root);
    path.strip_prefix(&prefix)
        .map(|s| s.to_string())
        .ok_or_else(|| Error::Protocol(format!("ref path {} outside repository {}", path, root)))
}

/// Branch name for a `refs/heads/` ref, if it is one.
pub fn branch_name(full_ref: &str) -> Option<&str> {
    full_ref.strip_prefix(REFS_HEADS)
}

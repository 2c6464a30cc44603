//! Wrapper around the local `git` executable.
//!
//! All access to the local repository goes through here. Object writes are
//! content-addressed and idempotent, so concurrent invocations are safe to
//! interleave. `GIT_DIR` is inherited from the environment; tests point the
//! wrapper at a temporary repository instead.

use std::io::Write;
use std::path::PathBuf;
use std::process::{Command, Stdio};

use crate::error::{Error, Result};
use crate::object::{self, ObjectId, ObjectType};

#[derive(Debug, Clone, Default)]
pub struct GitProcess {
    work_dir: Option<PathBuf>,
}

impl GitProcess {
    /// Operate on the repository of the current working directory.
    pub fn new() -> Self {
        Self::default()
    }

    /// Operate on the repository at `dir`.
    pub fn in_dir(dir: impl Into<PathBuf>) -> Self {
        Self {
            work_dir: Some(dir.into()),
        }
    }

    fn command(&self, args: &[&str]) -> Command {
        let mut cmd = Command::new("git");
        cmd.args(args);
        if let Some(dir) = &self.work_dir {
            cmd.current_dir(dir);
        }
        cmd
    }

    fn output_raw(&self, args: &[&str]) -> Result<Vec<u8>> {
        let output = self
            .command(args)
            .stderr(Stdio::piped())
            .output()
            .map_err(|e| Error::Git(format!("failed to run git: {}", e)))?;
        if !output.status.success() {
            return Err(Error::Git(format!(
                "git {} failed: {}",
                args.join(" "),
                String::from_utf8_lossy(&output.stderr).trim()
            )));
        }
        Ok(output.stdout)
    }

    fn output(&self, args: &[&str]) -> Result<String> {
        let raw = self.output_raw(args)?;
        Ok(String::from_utf8_lossy(&raw).trim().to_string())
    }

    fn status_ok(&self, args: &[&str]) -> bool {
        self.command(args)
            .stdout(Stdio::null())
            .stderr(Stdio::null())
            .status()
            .map(|s| s.success())
            .unwrap_or(false)
    }

    /// Whether `ancestor` is an ancestor of `descendant` (a fast-forward is
    /// possible between them).
    pub fn is_ancestor(&self, ancestor: &ObjectId, descendant: &ObjectId) -> bool {
        self.status_ok(&[
            "merge-base",
            "--is-ancestor",
            &ancestor.to_hex(),
            &descendant.to_hex(),
        ])
    }

    pub fn object_exists(&self, id: &ObjectId) -> bool {
        self.status_ok(&["cat-file", "-e", &id.to_hex()])
    }

    /// Whether the object and everything reachable from it is present
    /// locally.
    pub fn history_exists(&self, id: &ObjectId) -> bool {
        self.status_ok(&["rev-list", "--objects", &id.to_hex()])
    }

    /// Resolve a ref or rev expression to an object id.
    pub fn ref_value(&self, name: &str) -> Result<ObjectId> {
        let hex_id = self.output(&["rev-parse", name])?;
        ObjectId::from_hex(&hex_id)
            .ok_or_else(|| Error::Git(format!("rev-parse returned non-hash: {}", hex_id)))
    }

    /// One level of symbolic ref resolution, `None` if `name` is not
    /// symbolic or does not exist.
    pub fn symbolic_ref(&self, name: &str) -> Option<String> {
        self.output(&["symbolic-ref", name]).ok()
    }

    /// All local refs as (name, hash) pairs.
    pub fn local_refs(&self) -> Result<Vec<(String, ObjectId)>> {
        let listing = self.output(&["for-each-ref", "--format=%(objectname) %(refname)"])?;
        let mut refs = Vec::new();
        for line in listing.lines() {
            let mut parts = line.splitn(2, ' ');
            let id = parts.next().and_then(ObjectId::from_hex);
            let name = parts.next();
            if let (Some(id), Some(name)) = (id, name) {
                refs.push((name.to_string(), id));
            }
        }
        Ok(refs)
    }

    pub fn remote_url(&self, remote: &str) -> Result<String> {
        self.output(&["remote", "get-url", remote])
            .map_err(|_| Error::Config(format!("no such remote '{}'", remote)))
    }

    pub fn object_kind(&self, id: &ObjectId) -> Result<ObjectType> {
        let kind = self.output(&["cat-file", "-t", &id.to_hex()])?;
        ObjectType::from_str(&kind)
            .ok_or_else(|| Error::Git(format!("unexpected object type: {}", kind)))
    }

    /// Raw payload of an object, without the loose header.
    pub fn object_payload(&self, id: &ObjectId, kind: ObjectType) -> Result<Vec<u8>> {
        self.output_raw(&["cat-file", kind.as_str(), &id.to_hex()])
    }

    /// Encode a local object into the zlib loose format, byte-identical to
    /// what git would write under `.git/objects/`.
    pub fn encode_object(&self, id: &ObjectId) -> Result<Vec<u8>> {
        let kind = self.object_kind(id)?;
        let payload = self.object_payload(id, kind)?;
        object::encode_loose(kind, &payload)
    }

    /// The objects directly referenced by a locally present object.
    pub fn referenced_objects(&self, id: &ObjectId) -> Result<Vec<ObjectId>> {
        let kind = self.object_kind(id)?;
        let payload = self.object_payload(id, kind)?;
        object::referents(kind, &payload)
    }

    /// Feed an object into the local repository, returning its id. A
    /// rejection here means the payload is not a valid object of the claimed
    /// type.
    pub fn write_object(&self, kind: ObjectType, payload: &[u8]) -> Result<ObjectId> {
        let mut child = self
            .command(&["hash-object", "-w", "--stdin", "-t", kind.as_str()])
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .spawn()
            .map_err(|e| Error::Git(format!("failed to run git hash-object: {}", e)))?;

        if let Some(stdin) = child.stdin.as_mut() {
            stdin.write_all(payload)?;
        }
        let output = child
            .wait_with_output()
            .map_err(|e| Error::Git(format!("git hash-object: {}", e)))?;
        if !output.status.success() {
            return Err(Error::CorruptObject(format!(
                "git rejected {} object: {}",
                kind,
                String::from_utf8_lossy(&output.stderr).trim()
            )));
        }
        let hex_id = String::from_utf8_lossy(&output.stdout).trim().to_string();
        ObjectId::from_hex(&hex_id)
            .ok_or_else(|| Error::Git(format!("hash-object returned non-hash: {}", hex_id)))
    }

    /// Objects reachable from `include` but from none of `exclude`.
    ///
    /// Excludes that are not present locally are dropped first; `rev-list`
    /// refuses to negate unknown objects.
    pub fn rev_list_missing(
        &self,
        include: &[ObjectId],
        exclude: &[ObjectId],
    ) -> Result<Vec<ObjectId>> {
        let mut args: Vec<String> = vec!["rev-list".into(), "--objects".into()];
        args.extend(include.iter().map(|id| id.to_hex()));
        for id in exclude {
            if self.object_exists(id) {
                args.push(format!("^{}", id.to_hex()));
            }
        }
        let arg_refs: Vec<&str> = args.iter().map(|s| s.as_str()).collect();
        let listing = self.output(&arg_refs)?;

        let mut ids = Vec::new();
        for line in listing.lines() {
            if let Some(id) = line.split_whitespace().next().and_then(ObjectId::from_hex) {
                ids.push(id);
            }
        }
        Ok(ids)
    }
}

//! Git remote helper protocol engine.
//!
//! Implements the stateless git remote helper protocol over stdio.
//! See: https://git-scm.com/docs/gitremote-helpers
//!
//! The engine itself is single-threaded: commands arrive in order and
//! responses leave in order. All parallelism lives inside the transfer
//! engine, which is drained to quiescence before any ref update, so a ref
//! on the remote never points at an object that is not yet durable.

use std::collections::HashMap;
use std::sync::Arc;

use tokio::runtime::Runtime;
use tracing::{debug, info, warn};

use dropbox_git::error::{Error, Result};
use dropbox_git::git::GitProcess;
use dropbox_git::object::ObjectId;
use dropbox_git::refs;
use dropbox_git::refstore::{Expect, RefStore};
use dropbox_git::store::{BlobStore, Rev};
use dropbox_git::transfer::Transfer;

#[derive(Debug)]
struct PushSpec {
    src: String, // local ref, empty when deleting
    dst: String, // remote ref
    force: bool,
}

#[derive(Debug)]
struct FetchSpec {
    sha: String,
    name: String,
}

pub struct Helper {
    runtime: Runtime,
    git: GitProcess,
    refstore: RefStore,
    transfer: Transfer,
    verbosity: u8,
    progress: bool,
    cloning: bool,
    /// Refs observed on the remote by the last `list`, with the revision
    /// tags the next CAS writes are conditioned on. Entries are refreshed
    /// from each successful mutation's returned tag.
    refs: HashMap<String, (ObjectId, Rev)>,
    /// Refs written during this session, excluded from missing-object
    /// computation for later requests in the same batch.
    pushed: HashMap<String, ObjectId>,
    first_push: bool,
    push_specs: Vec<PushSpec>,
    fetch_specs: Vec<FetchSpec>,
    should_exit: bool,
}

impl Helper {
    pub fn new(
        store: Arc<dyn BlobStore>,
        root: impl Into<String>,
        git: GitProcess,
        workers: usize,
    ) -> Result<Self> {
        let runtime = Runtime::new()?;
        let root = root.into();
        let refstore = RefStore::new(store.clone(), root.clone());
        let mut transfer = Transfer::new(store, git.clone(), root).with_workers(workers);
        transfer.set_progress(true);
        Ok(Self {
            runtime,
            git,
            refstore,
            transfer,
            verbosity: 1,
            progress: true,
            cloning: false,
            refs: HashMap::new(),
            pushed: HashMap::new(),
            first_push: false,
            push_specs: Vec::new(),
            fetch_specs: Vec::new(),
            should_exit: false,
        })
    }

    pub fn should_exit(&self) -> bool {
        self.should_exit
    }

    /// Handle one command line from git, returning the response lines to
    /// print, if any.
    pub fn handle_command(&mut self, line: &str) -> Result<Option<Vec<String>>> {
        let mut parts = line.splitn(2, ' ');
        let cmd = parts.next().unwrap_or("");
        let arg = parts.next();

        match cmd {
            "capabilities" => Ok(Some(vec![
                "option".to_string(),
                "push".to_string(),
                "fetch".to_string(),
                String::new(),
            ])),
            "option" => {
                let response = self.do_option(arg.unwrap_or(""));
                Ok(Some(vec![response]))
            }
            "list" => self.do_list(arg == Some("for-push")),
            "push" => {
                self.queue_push(arg.ok_or_else(|| Error::Protocol("push without spec".into()))?)?;
                Ok(None)
            }
            "fetch" => {
                self.queue_fetch(arg.ok_or_else(|| Error::Protocol("fetch without spec".into()))?)?;
                Ok(None)
            }
            "" => {
                if !self.fetch_specs.is_empty() {
                    return self.execute_fetch();
                }
                if !self.push_specs.is_empty() {
                    return self.execute_push();
                }
                self.should_exit = true;
                Ok(None)
            }
            _ => Err(Error::Protocol(format!("unsupported operation: {}", line))),
        }
    }

    fn do_option(&mut self, arg: &str) -> String {
        let mut parts = arg.splitn(2, ' ');
        let (name, value) = (parts.next().unwrap_or(""), parts.next().unwrap_or(""));
        let understood = match name {
            "verbosity" => match value.parse::<u8>() {
                Ok(level) => {
                    self.verbosity = level;
                    true
                }
                Err(_) => false,
            },
            "progress" => match value {
                "true" => {
                    self.progress = true;
                    true
                }
                "false" => {
                    self.progress = false;
                    true
                }
                _ => false,
            },
            "cloning" => match value {
                "true" | "false" => {
                    self.cloning = value == "true";
                    debug!(cloning = self.cloning, "cloning option set");
                    true
                }
                _ => false,
            },
            _ => false,
        };
        if understood {
            self.transfer
                .set_progress(self.progress && self.verbosity >= 1);
            "ok".to_string()
        } else {
            "unsupported".to_string()
        }
    }

    fn do_list(&mut self, for_push: bool) -> Result<Option<Vec<String>>> {
        let snapshot = self.runtime.block_on(self.refstore.list_refs())?;
        self.refs.clear();
        self.pushed.clear();

        let mut lines = Vec::new();
        match snapshot {
            None => {
                if for_push {
                    // nothing exists yet; this push will bootstrap the repo
                    self.first_push = true;
                } else {
                    info!("repository is empty");
                }
            }
            Some(map) => {
                let mut names: Vec<&String> = map.keys().collect();
                names.sort();
                for name in names {
                    let (id, _) = &map[name];
                    lines.push(format!("{} {}", id, name));
                }
                self.refs = map;
            }
        }

        if !for_push {
            match self.runtime.block_on(self.refstore.read_symbolic(refs::HEAD))? {
                Some((target, _)) => lines.push(format!("@{} HEAD", target)),
                None => info!("no default branch on remote"),
            }
        }

        lines.push(String::new());
        Ok(Some(lines))
    }

    fn queue_push(&mut self, arg: &str) -> Result<()> {
        let force = arg.starts_with('+');
        let spec = if force { &arg[1..] } else { arg };
        let mut parts = spec.splitn(2, ':');
        let src = parts.next().unwrap_or("");
        let dst = parts
            .next()
            .ok_or_else(|| Error::Protocol(format!("invalid push spec: {}", arg)))?;
        if dst.is_empty() {
            return Err(Error::Protocol(format!("invalid push spec: {}", arg)));
        }
        self.push_specs.push(PushSpec {
            src: src.to_string(),
            dst: dst.to_string(),
            force,
        });
        Ok(())
    }

    fn queue_fetch(&mut self, arg: &str) -> Result<()> {
        let mut parts = arg.splitn(2, ' ');
        let sha = parts.next().unwrap_or("");
        let name = parts
            .next()
            .ok_or_else(|| Error::Protocol(format!("invalid fetch spec: {}", arg)))?;
        self.fetch_specs.push(FetchSpec {
            sha: sha.to_string(),
            name: name.to_string(),
        });
        Ok(())
    }

    fn execute_push(&mut self) -> Result<Option<Vec<String>>> {
        let specs = std::mem::take(&mut self.push_specs);
        debug!(requests = specs.len(), "executing push batch");

        // pick the branch the bootstrap HEAD should point at: the one
        // matching the local HEAD, or failing that the first pushed branch
        let mut remote_head: Option<String> = None;
        if self.first_push {
            let local_head = self.git.symbolic_ref("HEAD");
            for spec in &specs {
                if spec.src.is_empty() || refs::branch_name(&spec.dst).is_none() {
                    continue;
                }
                let matches_head = local_head.as_deref() == Some(spec.src.as_str());
                if remote_head.is_none() || matches_head {
                    remote_head = Some(spec.dst.clone());
                }
            }
        }

        let mut lines = Vec::new();
        for spec in &specs {
            lines.push(self.push_one(spec)?);
        }

        if self.first_push {
            self.first_push = false;
            match remote_head {
                Some(target) => self.bootstrap_head(&target)?,
                None => info!("first push but no branch to set as remote HEAD"),
            }
        }

        lines.push(String::new());
        Ok(Some(lines))
    }

    /// Process one push request, converting request-scoped failures into
    /// `error <dst> <reason>` lines. Anything else tears down the session.
    fn push_one(&mut self, spec: &PushSpec) -> Result<String> {
        let outcome = if spec.src.is_empty() {
            self.try_delete(&spec.dst)
        } else {
            self.try_push(spec)
        };
        match outcome {
            Ok(()) => Ok(format!("ok {}", spec.dst)),
            Err(Error::Conflict(_)) => Ok(format!("error {} fetch first", spec.dst)),
            Err(Error::NonFastForward(_)) => Ok(format!("error {} non-fast-forward", spec.dst)),
            Err(Error::HeadProtected(target)) => Ok(format!(
                "error {} refusing to delete the current branch: {}",
                spec.dst, target
            )),
            Err(Error::Transient(msg)) => {
                warn!(dst = %spec.dst, %msg, "push failed on exhausted retries");
                Ok(format!("error {} store unavailable (try again)", spec.dst))
            }
            Err(Error::Cancelled) => Ok(format!("error {} transfer cancelled", spec.dst)),
            Err(fatal) => Err(fatal),
        }
    }

    fn try_push(&mut self, spec: &PushSpec) -> Result<()> {
        let new_id = self.git.ref_value(&spec.src)?;
        let observed = self.refs.get(&spec.dst).cloned();
        debug!(src = %spec.src, dst = %spec.dst, force = spec.force, %new_id, "pushing");

        if let Some((old_id, _)) = &observed {
            if *old_id == new_id {
                // the remote already has exactly this; nothing to do
                return Ok(());
            }
            if !spec.force {
                if !self.git.object_exists(old_id) {
                    // we have never seen the remote's tip, cannot validate
                    return Err(Error::Conflict(spec.dst.clone()));
                }
                if !self.git.is_ancestor(old_id, &new_id) {
                    return Err(Error::NonFastForward(spec.dst.clone()));
                }
            }
        }

        // upload everything reachable from the new tip that the remote does
        // not already have, before the ref becomes visible
        let exclude: Vec<ObjectId> = self
            .refs
            .values()
            .map(|(id, _)| *id)
            .chain(self.pushed.values().copied())
            .collect();
        let missing = self.git.rev_list_missing(&[new_id], &exclude)?;
        self.runtime.block_on(self.transfer.upload_missing(&missing))?;

        let expect = match &observed {
            Some((_, rev)) => Expect::Rev(rev.clone()),
            None => Expect::Absent,
        };
        let rev = self
            .runtime
            .block_on(self.refstore.update_ref(&spec.dst, &new_id, expect))?;
        self.refs.insert(spec.dst.clone(), (new_id, rev));
        self.pushed.insert(spec.dst.clone(), new_id);
        Ok(())
    }

    fn try_delete(&mut self, dst: &str) -> Result<()> {
        debug!(%dst, "deleting ref");
        match self.refs.get(dst).cloned() {
            Some((_, rev)) => {
                self.runtime.block_on(self.refstore.delete_ref(dst, &rev))?;
            }
            None => {
                // not on the remote as far as we observed; a concurrent
                // delete would have been fine too
                debug!(%dst, "delete of unobserved ref is a no-op");
            }
        }
        self.refs.remove(dst);
        self.pushed.remove(dst);
        Ok(())
    }

    fn bootstrap_head(&mut self, target: &str) -> Result<()> {
        debug!(target, "bootstrapping remote HEAD");
        match self
            .runtime
            .block_on(self.refstore.write_symbolic(refs::HEAD, target, Expect::Absent))
        {
            Ok(_) => Ok(()),
            Err(Error::Conflict(_)) => {
                // another client bootstrapped concurrently; theirs stands
                match self.runtime.block_on(self.refstore.read_symbolic(refs::HEAD))? {
                    Some((existing, _)) => {
                        info!(%existing, "remote HEAD was created concurrently")
                    }
                    None => warn!("remote HEAD bootstrap conflicted but HEAD is unreadable"),
                }
                Ok(())
            }
            Err(err) => {
                // not worth failing the push over; the management tool can
                // set HEAD later
                info!(%err, "failed to set default branch on remote");
                Ok(())
            }
        }
    }

    fn execute_fetch(&mut self) -> Result<Option<Vec<String>>> {
        let specs = std::mem::take(&mut self.fetch_specs);
        debug!(requests = specs.len(), "executing fetch batch");

        let mut roots = Vec::new();
        for spec in &specs {
            let id = ObjectId::from_hex(&spec.sha)
                .ok_or_else(|| Error::Protocol(format!("invalid fetch hash: {}", spec.sha)))?;
            debug!(name = %spec.name, %id, "fetch requested");
            if !roots.contains(&id) {
                roots.push(id);
            }
        }
        self.runtime.block_on(self.transfer.download_closure(roots))?;
        Ok(Some(vec![String::new()]))
    }
}

//! Concurrent object transfer between the local repository and the store.
//!
//! A fixed-size pool of workers (bounded by a semaphore) moves loose
//! objects in both directions. Uploads are conditional creates, so racing
//! writers are harmless: content-addressing guarantees the bytes are
//! identical. Downloads walk the object graph recursively; installs via
//! `git hash-object` are idempotent, so the walk is safe to parallelize.

use std::collections::HashSet;
use std::sync::Arc;

use tokio::sync::Semaphore;
use tokio::task::{self, JoinSet};
use tracing::debug;

use crate::error::{Error, Result};
use crate::git::GitProcess;
use crate::object::{self, ObjectId, ObjectType, EMPTY_TREE_HASH};
use crate::retry::{with_retry, RetryPolicy};
use crate::store::{BlobStore, StoreError};

pub const DEFAULT_WORKERS: usize = 8;

pub struct Transfer {
    store: Arc<dyn BlobStore>,
    git: GitProcess,
    root: String,
    workers: usize,
    retry: RetryPolicy,
    progress: bool,
}

/// What to do with an object the fetch walk reached.
enum LocalPlan {
    /// Present with its full history; the whole sub-DAG is pruned.
    Skip,
    /// Present but with missing ancestry (an aborted fetch that was
    /// resumed); continue the walk through its referents.
    Expand(Vec<ObjectId>),
    Download,
}

impl Transfer {
    pub fn new(store: Arc<dyn BlobStore>, git: GitProcess, root: impl Into<String>) -> Self {
        Self {
            store,
            git,
            root: root.into(),
            workers: DEFAULT_WORKERS,
            retry: RetryPolicy::default(),
            progress: false,
        }
    }

    pub fn with_workers(mut self, workers: usize) -> Self {
        self.workers = workers.max(1);
        self
    }

    /// Toggle `Writing objects` / `Receiving objects` status lines on
    /// stderr.
    pub fn set_progress(&mut self, on: bool) {
        self.progress = on;
    }

    fn status(&self, line: &str) {
        if self.progress {
            eprint!("{}", line);
        }
    }

    /// Upload the given objects, which the caller has determined to be
    /// missing on the remote. Drains to quiescence before returning, so a
    /// ref update issued afterwards never references an absent object.
    pub async fn upload_missing(&self, want: &[ObjectId]) -> Result<()> {
        let total = want.len();
        if total == 0 {
            return Ok(());
        }
        let semaphore = Arc::new(Semaphore::new(self.workers));
        let mut tasks = JoinSet::new();
        for &id in want {
            let semaphore = semaphore.clone();
            let git = self.git.clone();
            let store = self.store.clone();
            let retry = self.retry.clone();
            let path = object::object_path(&self.root, &id);
            tasks.spawn(async move {
                let _permit = semaphore
                    .acquire_owned()
                    .await
                    .map_err(|_| Error::Cancelled)?;
                let data = task::spawn_blocking(move || git.encode_object(&id))
                    .await
                    .map_err(|_| Error::Cancelled)??;
                debug!(%id, bytes = data.len(), "uploading object");
                match with_retry(&retry, || {
                    let store = store.clone();
                    let path = path.clone();
                    let data = data.clone();
                    async move { store.put_create(&path, data).await }
                })
                .await
                {
                    Ok(_) => Ok(()),
                    // another writer got there first; identical content
                    Err(StoreError::AlreadyExists(_)) => Ok(()),
                    Err(err) => Err(err.into()),
                }
            });
        }

        let mut done = 0usize;
        while let Some(joined) = tasks.join_next().await {
            match joined {
                Ok(Ok(())) => {
                    done += 1;
                    self.status(&format!(
                        "\rWriting objects: {:3}% ({}/{})",
                        done * 100 / total,
                        done,
                        total
                    ));
                }
                Ok(Err(err)) => {
                    tasks.abort_all();
                    return Err(err);
                }
                Err(join_err) if join_err.is_cancelled() => continue,
                Err(_) => {
                    tasks.abort_all();
                    return Err(Error::Cancelled);
                }
            }
        }
        self.status(&format!(
            "\rWriting objects: 100% ({}/{}), done.\n",
            done, done
        ));
        Ok(())
    }

    /// Download the transitive closure of `roots` into the local
    /// repository.
    ///
    /// The store is closed under reachability (pushes upload full
    /// closures), but the local repository may be partial, so the walk
    /// prunes only at objects whose entire local history is present.
    pub async fn download_closure(&self, roots: Vec<ObjectId>) -> Result<()> {
        let semaphore = Arc::new(Semaphore::new(self.workers));
        let mut tasks: JoinSet<Result<(ObjectId, ObjectType, Vec<u8>)>> = JoinSet::new();
        let mut queue = roots;
        let mut seen: HashSet<ObjectId> = HashSet::new();
        let mut done = 0usize;

        loop {
            while let Some(id) = queue.pop() {
                if !seen.insert(id) {
                    continue;
                }
                let planner = self.git.clone();
                let plan = task::spawn_blocking(move || plan_local(&planner, &id))
                    .await
                    .map_err(|_| Error::Cancelled)??;
                match plan {
                    LocalPlan::Skip => {
                        debug!(%id, "already present with full history");
                    }
                    LocalPlan::Expand(referents) => {
                        debug!(%id, "present but history incomplete, continuing walk");
                        queue.extend(referents);
                    }
                    LocalPlan::Download => {
                        self.spawn_download(&mut tasks, semaphore.clone(), id);
                    }
                }
            }

            match tasks.join_next().await {
                None => break,
                Some(joined) => match joined {
                    Ok(Ok((id, kind, payload))) => {
                        debug!(%id, %kind, "installed object");
                        queue.extend(object::referents(kind, &payload)?);
                        done += 1;
                        let total = done + tasks.len() + queue.len();
                        self.status(&format!(
                            "\rReceiving objects: {:3}% ({}/{})",
                            done * 100 / total,
                            done,
                            total
                        ));
                    }
                    Ok(Err(err)) => {
                        tasks.abort_all();
                        return Err(err);
                    }
                    Err(join_err) if join_err.is_cancelled() => continue,
                    Err(_) => {
                        tasks.abort_all();
                        return Err(Error::Cancelled);
                    }
                },
            }
        }
        if done > 0 {
            self.status(&format!(
                "\rReceiving objects: 100% ({}/{}), done.\n",
                done, done
            ));
        }
        Ok(())
    }

    fn spawn_download(
        &self,
        tasks: &mut JoinSet<Result<(ObjectId, ObjectType, Vec<u8>)>>,
        semaphore: Arc<Semaphore>,
        id: ObjectId,
    ) {
        let store = self.store.clone();
        let git = self.git.clone();
        let retry = self.retry.clone();
        let path = object::object_path(&self.root, &id);
        tasks.spawn(async move {
            let _permit = semaphore
                .acquire_owned()
                .await
                .map_err(|_| Error::Cancelled)?;
            debug!(%id, "downloading object");
            let (data, _rev) = with_retry(&retry, || {
                let store = store.clone();
                let path = path.clone();
                async move { store.get(&path).await }
            })
            .await
            .map_err(|err| match err {
                // a reachable object absent from the store violates the
                // closure invariant; the store is corrupt
                StoreError::NotFound(_) => {
                    Error::CorruptObject(format!("object {} missing from store", id))
                }
                other => other.into(),
            })?;
            let (kind, payload) = object::decode_loose_verified(&data, &id)?;
            let (written, payload) = task::spawn_blocking(move || {
                git.write_object(kind, &payload).map(|w| (w, payload))
            })
            .await
            .map_err(|_| Error::Cancelled)??;
            if written != id {
                return Err(Error::CorruptObject(format!(
                    "git stored {} as {}",
                    id, written
                )));
            }
            Ok((id, kind, payload))
        });
    }
}

fn plan_local(git: &GitProcess, id: &ObjectId) -> Result<LocalPlan> {
    if !git.object_exists(id) {
        return Ok(LocalPlan::Download);
    }
    if id.to_hex() == EMPTY_TREE_HASH {
        // cat-file -e reports the empty tree present even without a loose
        // file; write it so `git fsck` stays clean
        git.write_object(ObjectType::Tree, b"")?;
    }
    if git.history_exists(id) {
        Ok(LocalPlan::Skip)
    } else {
        Ok(LocalPlan::Expand(git.referenced_objects(id)?))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::MemoryStore;
    use std::fs;
    use std::process::Command;
    use tempfile::tempdir;

    fn git_available() -> bool {
        Command::new("git")
            .arg("--version")
            .output()
            .map(|o| o.status.success())
            .unwrap_or(false)
    }

    fn init_repo(dir: &std::path::Path) -> GitProcess {
        run(dir, &["init", "-q"]);
        run(dir, &["config", "user.email", "test@test.com"]);
        run(dir, &["config", "user.name", "Test"]);
        GitProcess::in_dir(dir)
    }

    fn run(dir: &std::path::Path, args: &[&str]) {
        let output = Command::new("git")
            .args(args)
            .current_dir(dir)
            .output()
            .unwrap();
        assert!(output.status.success(), "git {:?}", args);
    }

    fn commit(git: &GitProcess, dir: &std::path::Path, name: &str, contents: &str) -> ObjectId {
        fs::write(dir.join(name), contents).unwrap();
        run(dir, &["add", name]);
        run(dir, &["commit", "-q", "-m", name]);
        git.ref_value("HEAD").unwrap()
    }

    #[tokio::test]
    async fn upload_then_download_into_fresh_repo() {
        if !git_available() {
            return;
        }
        let src_dir = tempdir().unwrap();
        let src_git = init_repo(src_dir.path());
        let c1 = commit(&src_git, src_dir.path(), "bar", "foo\n");

        let store = Arc::new(MemoryStore::new());
        let up = Transfer::new(store.clone(), src_git.clone(), "/t/repo");
        let missing = src_git.rev_list_missing(&[c1], &[]).unwrap();
        up.upload_missing(&missing).await.unwrap();

        // every object in the closure is now durable at its sharded path
        for id in &missing {
            let path = object::object_path("/t/repo", id);
            let (data, _) = store.get(&path).await.unwrap();
            object::decode_loose_verified(&data, id).unwrap();
        }

        let dst_dir = tempdir().unwrap();
        let dst_git = init_repo(dst_dir.path());
        let down = Transfer::new(store.clone(), dst_git.clone(), "/t/repo");
        down.download_closure(vec![c1]).await.unwrap();

        assert!(dst_git.object_exists(&c1));
        assert!(dst_git.history_exists(&c1));
        // a second walk prunes everything and stays quiet
        down.download_closure(vec![c1]).await.unwrap();
    }

    #[tokio::test]
    async fn upload_tolerates_existing_objects() {
        if !git_available() {
            return;
        }
        let dir = tempdir().unwrap();
        let git = init_repo(dir.path());
        let c1 = commit(&git, dir.path(), "bar", "foo\n");

        let store = Arc::new(MemoryStore::new());
        let transfer = Transfer::new(store.clone(), git.clone(), "/t/repo");
        let missing = git.rev_list_missing(&[c1], &[]).unwrap();

        // pre-seed one object, as if a previous push died mid-flight
        let seeded = missing[0];
        store
            .put_create(
                &object::object_path("/t/repo", &seeded),
                git.encode_object(&seeded).unwrap(),
            )
            .await
            .unwrap();

        transfer.upload_missing(&missing).await.unwrap();
        for id in &missing {
            assert!(store.get(&object::object_path("/t/repo", id)).await.is_ok());
        }
    }

    #[tokio::test]
    async fn corrupt_store_data_is_fatal() {
        if !git_available() {
            return;
        }
        let dir = tempdir().unwrap();
        let git = init_repo(dir.path());

        let store = Arc::new(MemoryStore::new());
        let wanted = ObjectId::from_hex("3b18e512dba79e4c8300dd08aeb37f8e728b8dad").unwrap();
        store
            .put_create(
                &object::object_path("/t/repo", &wanted),
                object::encode_loose(ObjectType::Blob, b"tampered contents").unwrap(),
            )
            .await
            .unwrap();

        let transfer = Transfer::new(store, git, "/t/repo");
        let result = transfer.download_closure(vec![wanted]).await;
        assert!(matches!(result, Err(Error::CorruptObject(_))));
    }

    #[tokio::test]
    async fn missing_object_in_store_is_fatal() {
        if !git_available() {
            return;
        }
        let dir = tempdir().unwrap();
        let git = init_repo(dir.path());
        let store = Arc::new(MemoryStore::new());
        let transfer = Transfer::new(store, git, "/t/repo");

        let wanted = ObjectId::from_hex("4444444444444444444444444444444444444444").unwrap();
        let result = transfer.download_closure(vec![wanted]).await;
        assert!(matches!(result, Err(Error::CorruptObject(_))));
    }
}

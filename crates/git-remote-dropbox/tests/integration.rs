//! End-to-end tests driving the helper protocol against a real git CLI.
//!
//! A `MemoryStore` stands in for Dropbox; it implements the same
//! conditional-write semantics, so the CAS behavior under test is the real
//! thing. Tests are skipped when git is not installed.

use std::fs;
use std::future::Future;
use std::path::Path;
use std::process::Command;
use std::sync::Arc;

use tempfile::{tempdir, TempDir};

use dropbox_git::git::GitProcess;
use dropbox_git::object::{object_path, ObjectId};
use dropbox_git::store::{BlobStore, MemoryStore};
use git_remote_dropbox::helper::Helper;

const ROOT: &str = "/t/repo";

fn git_available() -> bool {
    Command::new("git")
        .arg("--version")
        .output()
        .map(|o| o.status.success())
        .unwrap_or(false)
}

fn block_on<F: Future>(future: F) -> F::Output {
    tokio::runtime::Builder::new_current_thread()
        .enable_all()
        .build()
        .unwrap()
        .block_on(future)
}

fn run(dir: &Path, args: &[&str]) {
    let output = Command::new("git")
        .args(args)
        .current_dir(dir)
        .env("GIT_TERMINAL_PROMPT", "0")
        .output()
        .unwrap();
    assert!(
        output.status.success(),
        "git {:?}: {}",
        args,
        String::from_utf8_lossy(&output.stderr)
    );
}

fn init_repo() -> (TempDir, GitProcess) {
    let dir = tempdir().unwrap();
    run(dir.path(), &["init", "-q"]);
    // pin the branch name regardless of init.defaultBranch
    run(dir.path(), &["symbolic-ref", "HEAD", "refs/heads/master"]);
    run(dir.path(), &["config", "user.email", "test@test.com"]);
    run(dir.path(), &["config", "user.name", "Test"]);
    let git = GitProcess::in_dir(dir.path());
    (dir, git)
}

fn commit(dir: &Path, git: &GitProcess, name: &str, contents: &str) -> ObjectId {
    fs::write(dir.join(name), contents).unwrap();
    run(dir, &["add", name]);
    run(dir, &["commit", "-q", "-m", name]);
    git.ref_value("HEAD").unwrap()
}

fn helper(store: &Arc<MemoryStore>, dir: &Path) -> Helper {
    Helper::new(store.clone(), ROOT, GitProcess::in_dir(dir), 4).unwrap()
}

/// Drive one command and collect its response lines.
fn send(helper: &mut Helper, line: &str) -> Vec<String> {
    helper.handle_command(line).unwrap().unwrap_or_default()
}

/// Run a `list for-push` followed by a batch of push commands, returning
/// the per-request result lines (without the trailing blank).
fn push_session(store: &Arc<MemoryStore>, dir: &Path, specs: &[&str]) -> Vec<String> {
    let mut helper = helper(store, dir);
    send(&mut helper, "list for-push");
    for spec in specs {
        assert!(helper
            .handle_command(&format!("push {}", spec))
            .unwrap()
            .is_none());
    }
    let mut lines = send(&mut helper, "");
    assert_eq!(lines.pop().as_deref(), Some(""));
    lines
}

fn ref_bytes(store: &Arc<MemoryStore>, name: &str) -> Option<Vec<u8>> {
    block_on(store.get(&format!("{}/{}", ROOT, name)))
        .ok()
        .map(|(data, _)| data)
}

fn closure_is_stored(store: &Arc<MemoryStore>, git: &GitProcess, tip: &ObjectId) {
    for id in git.rev_list_missing(&[*tip], &[]).unwrap() {
        assert!(
            block_on(store.get(&object_path(ROOT, &id))).is_ok(),
            "object {} missing from store",
            id
        );
    }
}

#[test]
fn capabilities_and_options() {
    if !git_available() {
        return;
    }
    let (dir, _git) = init_repo();
    let store = Arc::new(MemoryStore::new());
    let mut helper = helper(&store, dir.path());

    let caps = send(&mut helper, "capabilities");
    assert_eq!(caps, vec!["option", "push", "fetch", ""]);

    assert_eq!(send(&mut helper, "option verbosity 2"), vec!["ok"]);
    assert_eq!(send(&mut helper, "option progress false"), vec!["ok"]);
    assert_eq!(send(&mut helper, "option cloning true"), vec!["ok"]);
    assert_eq!(send(&mut helper, "option followtags true"), vec!["unsupported"]);

    assert!(helper.handle_command("export").is_err());
}

#[test]
fn fresh_push_bootstraps_head() {
    if !git_available() {
        return;
    }
    let (dir, git) = init_repo();
    let c1 = commit(dir.path(), &git, "bar", "foo\n");
    let store = Arc::new(MemoryStore::new());

    let mut session = helper(&store, dir.path());
    // empty repository advertises nothing
    assert_eq!(send(&mut session, "list for-push"), vec![""]);
    assert!(session
        .handle_command("push refs/heads/master:refs/heads/master")
        .unwrap()
        .is_none());
    assert_eq!(
        send(&mut session, ""),
        vec!["ok refs/heads/master", ""]
    );

    assert_eq!(
        ref_bytes(&store, "refs/heads/master").unwrap(),
        format!("{}\n", c1).into_bytes()
    );
    assert_eq!(
        ref_bytes(&store, "HEAD").unwrap(),
        b"ref: refs/heads/master\n".to_vec()
    );
    closure_is_stored(&store, &git, &c1);
}

#[test]
fn repeated_push_is_a_noop() {
    if !git_available() {
        return;
    }
    let (dir, git) = init_repo();
    let c1 = commit(dir.path(), &git, "bar", "foo\n");
    let store = Arc::new(MemoryStore::new());

    push_session(&store, dir.path(), &["refs/heads/master:refs/heads/master"]);
    let (_, rev_before) = block_on(store.get(&format!("{}/refs/heads/master", ROOT))).unwrap();

    let results = push_session(&store, dir.path(), &["refs/heads/master:refs/heads/master"]);
    assert_eq!(results, vec!["ok refs/heads/master"]);

    let (data, rev_after) = block_on(store.get(&format!("{}/refs/heads/master", ROOT))).unwrap();
    assert_eq!(rev_before, rev_after, "no-op push must not rewrite the ref");
    assert_eq!(data, format!("{}\n", c1).into_bytes());
}

#[test]
fn fast_forward_then_divergent_then_force() {
    if !git_available() {
        return;
    }
    let (dir, git) = init_repo();
    let c1 = commit(dir.path(), &git, "a.txt", "one\n");
    let store = Arc::new(MemoryStore::new());
    push_session(&store, dir.path(), &["refs/heads/master:refs/heads/master"]);

    // fast-forward
    let c2 = commit(dir.path(), &git, "b.txt", "two\n");
    let results = push_session(&store, dir.path(), &["refs/heads/master:refs/heads/master"]);
    assert_eq!(results, vec!["ok refs/heads/master"]);
    assert_eq!(
        ref_bytes(&store, "refs/heads/master").unwrap(),
        format!("{}\n", c2).into_bytes()
    );

    // diverge from c1
    run(dir.path(), &["reset", "-q", "--hard", &c1.to_hex()]);
    let c3 = commit(dir.path(), &git, "c.txt", "three\n");
    assert!(!git.is_ancestor(&c2, &c3));

    let results = push_session(&store, dir.path(), &["refs/heads/master:refs/heads/master"]);
    assert_eq!(results, vec!["error refs/heads/master non-fast-forward"]);

    // the force push still CASes, but against the rev it observed
    let results = push_session(&store, dir.path(), &["+refs/heads/master:refs/heads/master"]);
    assert_eq!(results, vec!["ok refs/heads/master"]);
    assert_eq!(
        ref_bytes(&store, "refs/heads/master").unwrap(),
        format!("{}\n", c3).into_bytes()
    );
}

#[test]
fn head_target_cannot_be_deleted() {
    if !git_available() {
        return;
    }
    let (dir, git) = init_repo();
    commit(dir.path(), &git, "bar", "foo\n");
    run(dir.path(), &["branch", "develop"]);
    let store = Arc::new(MemoryStore::new());

    let results = push_session(
        &store,
        dir.path(),
        &[
            "refs/heads/master:refs/heads/master",
            "refs/heads/develop:refs/heads/develop",
        ],
    );
    assert_eq!(
        results,
        vec!["ok refs/heads/master", "ok refs/heads/develop"]
    );
    // bootstrap pointed HEAD at master
    assert_eq!(
        ref_bytes(&store, "HEAD").unwrap(),
        b"ref: refs/heads/master\n".to_vec()
    );

    let results = push_session(
        &store,
        dir.path(),
        &[":refs/heads/master", ":refs/heads/develop"],
    );
    assert!(results[0].starts_with("error refs/heads/master refusing to delete"));
    assert_eq!(results[1], "ok refs/heads/develop");

    assert!(ref_bytes(&store, "refs/heads/master").is_some());
    assert!(ref_bytes(&store, "refs/heads/develop").is_none());
}

#[test]
fn concurrent_pushes_linearize() {
    if !git_available() {
        return;
    }
    let (dir, git) = init_repo();
    commit(dir.path(), &git, "a.txt", "one\n");
    let c2 = commit(dir.path(), &git, "b.txt", "two\n");
    let store = Arc::new(MemoryStore::new());
    push_session(&store, dir.path(), &["refs/heads/master:refs/heads/master"]);

    // two descendants of c2 on separate branches
    let c3a = commit(dir.path(), &git, "left.txt", "left\n");
    run(dir.path(), &["branch", "left"]);
    run(dir.path(), &["reset", "-q", "--hard", &c2.to_hex()]);
    let c3b = commit(dir.path(), &git, "right.txt", "right\n");
    run(dir.path(), &["branch", "right"]);

    // both sessions observe the same remote state before either writes
    let mut session_a = helper(&store, dir.path());
    let mut session_b = helper(&store, dir.path());
    send(&mut session_a, "list for-push");
    send(&mut session_b, "list for-push");

    session_a
        .handle_command("push refs/heads/left:refs/heads/master")
        .unwrap();
    assert_eq!(
        send(&mut session_a, ""),
        vec!["ok refs/heads/master", ""]
    );

    session_b
        .handle_command("push refs/heads/right:refs/heads/master")
        .unwrap();
    assert_eq!(
        send(&mut session_b, ""),
        vec!["error refs/heads/master fetch first", ""]
    );

    // the winner's commit is the ref; the loser's objects remain, orphaned
    assert_eq!(
        ref_bytes(&store, "refs/heads/master").unwrap(),
        format!("{}\n", c3a).into_bytes()
    );
    closure_is_stored(&store, &git, &c3b);
}

#[test]
fn interrupted_push_resumes() {
    if !git_available() {
        return;
    }
    let (dir, git) = init_repo();
    let c1 = commit(dir.path(), &git, "bar", "foo\n");
    let store = Arc::new(MemoryStore::new());

    // a previous helper died after uploading part of the closure
    let all = git.rev_list_missing(&[c1], &[]).unwrap();
    let seeded = &all[..all.len() / 2 + 1];
    for id in seeded {
        block_on(store.put_create(&object_path(ROOT, id), git.encode_object(id).unwrap()))
            .unwrap();
    }
    assert!(ref_bytes(&store, "refs/heads/master").is_none());

    let results = push_session(&store, dir.path(), &["refs/heads/master:refs/heads/master"]);
    assert_eq!(results, vec!["ok refs/heads/master"]);
    closure_is_stored(&store, &git, &c1);
    assert_eq!(
        ref_bytes(&store, "refs/heads/master").unwrap(),
        format!("{}\n", c1).into_bytes()
    );
}

#[test]
fn fetch_into_fresh_repository() {
    if !git_available() {
        return;
    }
    let (src_dir, src_git) = init_repo();
    commit(src_dir.path(), &src_git, "a.txt", "one\n");
    let c2 = commit(src_dir.path(), &src_git, "b.txt", "two\n");
    let store = Arc::new(MemoryStore::new());
    push_session(&store, src_dir.path(), &["refs/heads/master:refs/heads/master"]);

    let (dst_dir, dst_git) = init_repo();
    let mut session = helper(&store, dst_dir.path());

    let listing = send(&mut session, "list");
    assert!(listing.contains(&format!("{} refs/heads/master", c2)));
    assert!(listing.contains(&"@refs/heads/master HEAD".to_string()));
    assert_eq!(listing.last().map(String::as_str), Some(""));

    assert!(session
        .handle_command(&format!("fetch {} refs/heads/master", c2))
        .unwrap()
        .is_none());
    assert_eq!(send(&mut session, ""), vec![""]);

    assert!(dst_git.object_exists(&c2));
    assert!(dst_git.history_exists(&c2));

    // with the ref installed the clone is a healthy repository
    run(
        dst_dir.path(),
        &["update-ref", "refs/heads/master", &c2.to_hex()],
    );
    run(dst_dir.path(), &["fsck", "--strict"]);
    let in_tree = Command::new("git")
        .args(["show", &format!("{}:b.txt", c2.to_hex())])
        .current_dir(dst_dir.path())
        .output()
        .unwrap();
    assert_eq!(String::from_utf8_lossy(&in_tree.stdout), "two\n");

    // fetching again prunes the walk entirely
    assert!(session
        .handle_command(&format!("fetch {} refs/heads/master", c2))
        .unwrap()
        .is_none());
    assert_eq!(send(&mut session, ""), vec![""]);
}

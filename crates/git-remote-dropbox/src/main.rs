//! Entry point for the `git-remote-dropbox` helper.
//!
//! Git discovers this binary via PATH for remotes whose URL starts with
//! `dropbox://` and calls it as `git-remote-dropbox <remote-name> <url>`.
//! The protocol runs on stdio; diagnostics go to stderr.

use std::io::{BufRead, Write};
use std::sync::Arc;

use anyhow::{bail, Context, Result};
use tracing::debug;

use dropbox_blob_store::DropboxClient;
use dropbox_git::git::GitProcess;
use dropbox_git::transfer::DEFAULT_WORKERS;
use git_remote_dropbox::credentials::Credentials;
use git_remote_dropbox::helper::Helper;
use git_remote_dropbox::url::parse_remote_url;

fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::from_default_env()
                .add_directive("git_remote_dropbox=info".parse()?)
                .add_directive("dropbox_git=info".parse()?),
        )
        .with_writer(std::io::stderr)
        .init();

    let args: Vec<String> = std::env::args().collect();
    debug!("git-remote-dropbox called with args: {:?}", args);
    if args.len() < 3 {
        bail!("usage: git-remote-dropbox <remote-name> <url>");
    }
    let url = &args[2];

    let remote = parse_remote_url(url)?;
    let credentials = Credentials::load()?;
    let token = credentials.token_for(&remote.selector)?;
    let client = DropboxClient::new(token).map_err(dropbox_git::Error::from)?;

    // fail fast on a bad token rather than midway through a transfer
    tokio::runtime::Builder::new_current_thread()
        .enable_all()
        .build()?
        .block_on(client.check_connection())
        .map_err(dropbox_git::Error::from)
        .context("invalid access token, try logging in again with 'git-dropbox-manage login'")?;

    let mut helper = Helper::new(
        Arc::new(client),
        remote.root,
        GitProcess::new(),
        DEFAULT_WORKERS,
    )?;

    let stdin = std::io::stdin();
    let stdout = std::io::stdout();
    let mut stdout = stdout.lock();

    for line in stdin.lock().lines() {
        let line = line?;
        let line = line.trim_end();
        debug!("command: '{}'", line);

        if let Some(response) = helper.handle_command(line)? {
            for out in response {
                writeln!(stdout, "{}", out)?;
            }
            stdout.flush()?;
        }
        if helper.should_exit() {
            break;
        }
    }

    Ok(())
}

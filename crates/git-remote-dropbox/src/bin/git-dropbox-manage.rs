//! Out-of-band repository management for Dropbox remotes.
//!
//! Everything here is safe alongside concurrent pushes except where noted:
//! `set-head` can race a concurrent branch delete, which it detects and
//! reports rather than leaving HEAD dangling silently.

use std::io::{BufRead, Write};
use std::sync::Arc;

use anyhow::{bail, Context, Result};
use clap::{Parser, Subcommand};

use dropbox_blob_store::DropboxClient;
use dropbox_git::git::GitProcess;
use dropbox_git::refstore::{Expect, RefStore};
use dropbox_git::Error;
use git_remote_dropbox::credentials::Credentials;
use git_remote_dropbox::url::parse_remote_url;

#[derive(Parser)]
#[command(name = "git-dropbox-manage")]
#[command(about = "Manage Dropbox git remotes", long_about = None)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Store a Dropbox access token
    Login {
        /// Account name; omit for the default account
        name: Option<String>,
    },
    /// Remove a stored access token
    Logout {
        /// Account name; omit for the default account
        name: Option<String>,
    },
    /// Show stored accounts
    ShowLogins,
    /// Set the default branch on the remote
    SetHead {
        /// Name of the remote
        remote: String,
        /// Name of the branch on the remote
        branch: String,
    },
    /// Print the version
    Version,
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .with_writer(std::io::stderr)
        .init();

    let cli = Cli::parse();
    match cli.command {
        Commands::Login { name } => login(name.as_deref()),
        Commands::Logout { name } => logout(name.as_deref()),
        Commands::ShowLogins => show_logins(),
        Commands::SetHead { remote, branch } => set_head(&remote, &branch).await,
        Commands::Version => {
            println!("git-remote-dropbox {}", env!("CARGO_PKG_VERSION"));
            Ok(())
        }
    }
}

fn login(name: Option<&str>) -> Result<()> {
    print!("Enter a Dropbox API access token: ");
    std::io::stdout().flush()?;
    let mut token = String::new();
    std::io::stdin().lock().read_line(&mut token)?;
    let token = token.trim().to_string();
    if token.is_empty() {
        bail!("no token given");
    }

    let mut credentials = Credentials::load()?;
    credentials.set(name, token);
    credentials.save()?;

    let example = match name {
        Some(name) => format!("dropbox://{}@/path/to/repo", name),
        None => "dropbox:///path/to/repo".to_string(),
    };
    println!("Logged in! You can now add Dropbox remotes like '{}'", example);
    Ok(())
}

fn logout(name: Option<&str>) -> Result<()> {
    let mut credentials = Credentials::load()?;
    credentials.remove(name);
    credentials.save()?;
    match name {
        Some(name) => println!("Logged out {}!", name),
        None => println!("Logged out!"),
    }
    Ok(())
}

fn show_logins() -> Result<()> {
    let credentials = Credentials::load()?;
    if credentials.has_default() {
        println!("(default account)");
    }
    for name in credentials.names() {
        println!("{}", name);
    }
    Ok(())
}

/// Point the remote HEAD at a branch, compare-and-swapping against the
/// revision observed first so a concurrent `set-head` cannot be lost.
async fn set_head(remote: &str, branch: &str) -> Result<()> {
    let git = GitProcess::new();
    let url = git.remote_url(remote)?;
    let parsed = parse_remote_url(&url)?;
    let credentials = Credentials::load()?;
    let token = credentials.token_for(&parsed.selector)?;
    let client = DropboxClient::new(token).map_err(Error::from)?;
    client
        .check_connection()
        .await
        .map_err(Error::from)
        .context("invalid access token, try logging in again with 'git-dropbox-manage login'")?;

    let refstore = RefStore::new(Arc::new(client), parsed.root);
    let remote_ref = format!("refs/heads/{}", branch);

    if !branch_exists(&refstore, &remote_ref).await? {
        bail!("remote has no such ref '{}'", remote_ref);
    }

    let old_head = refstore.read_symbolic("HEAD").await?;
    if let Some((target, _)) = &old_head {
        if *target == remote_ref {
            bail!("remote HEAD is already '{}'", remote_ref);
        }
    }
    let expect = match old_head {
        Some((_, rev)) => Expect::Rev(rev),
        None => Expect::Absent,
    };
    match refstore.write_symbolic("HEAD", &remote_ref, expect).await {
        Ok(_) => {}
        Err(Error::Conflict(_)) => {
            bail!("concurrent modification of remote HEAD detected (try again)")
        }
        Err(err) => return Err(err.into()),
    }

    // the branch may have been deleted between our check and the write;
    // rare, but the user has to resolve it
    if !branch_exists(&refstore, &remote_ref).await? {
        bail!(
            "remote ref '{}' was concurrently deleted: remote HEAD needs to be fixed (try again)",
            remote_ref
        );
    }

    println!("Updated remote HEAD to '{}'.", remote_ref);
    Ok(())
}

async fn branch_exists(refstore: &RefStore, name: &str) -> Result<bool, Error> {
    Ok(refstore
        .list_refs()
        .await?
        .map_or(false, |refs| refs.contains_key(name)))
}

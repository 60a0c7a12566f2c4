//! outlinesync: command-line client for outline document replicas.
//!
//! Supports:
//! - Committing outline trees and browsing history
//! - Pull/push/sync against another replica directory
//! - Automatic merging of diverged heads
//! - Migration to cards and verified export
//!
//! # Usage
//!
//! ```bash
//! # Create a workspace
//! outlinesync init --dir ~/notes --author alice
//!
//! # Commit a tree read from JSON
//! outlinesync commit --dir ~/notes --doc todo --file todo.json --name "Todo"
//!
//! # Exchange commits with a shared replica
//! outlinesync sync --dir ~/notes --doc todo --remote /mnt/shared/notes
//!
//! # Merge after a pull reported diverged heads
//! outlinesync merge --dir ~/notes --doc todo
//! ```

mod workspace;

use anyhow::{anyhow, Context, Result};
use clap::{Parser, Subcommand};
use outline_core::object::ObjectId;
use outline_core::replication::Pulled;
use outline_core::ReplicationReport;
use std::path::PathBuf;
use workspace::{open_remote, read_tree, Workspace};

#[derive(Parser, Debug)]
#[command(name = "outlinesync")]
#[command(author = "Outline Sync Contributors")]
#[command(version = "0.1.0")]
#[command(about = "Outline document versioning and sync tool")]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Create a workspace (config + local replica)
    Init {
        /// Workspace directory
        #[arg(short, long)]
        dir: PathBuf,
        /// Author recorded on commits
        #[arg(short, long)]
        author: Option<String>,
    },

    /// Commit an outline tree from a JSON file
    Commit {
        #[arg(short, long)]
        dir: PathBuf,
        /// Document id
        #[arg(long)]
        doc: String,
        /// Tree JSON (`{"id":"0","content":"","children":[...]}`)
        #[arg(short, long)]
        file: PathBuf,
        /// Rename the document
        #[arg(short, long)]
        name: Option<String>,
    },

    /// Show commit history from the head
    Log {
        #[arg(short, long)]
        dir: PathBuf,
        #[arg(long)]
        doc: String,
        /// Maximum commits to show
        #[arg(short, long, default_value_t = 20)]
        limit: usize,
    },

    /// Print the tree at a commit without moving the head
    Checkout {
        #[arg(short, long)]
        dir: PathBuf,
        #[arg(long)]
        doc: String,
        /// Commit id (hex); defaults to the head
        #[arg(short, long)]
        commit: Option<String>,
    },

    /// Pull a document from a remote replica
    Pull {
        #[arg(short, long)]
        dir: PathBuf,
        #[arg(long)]
        doc: String,
        /// Remote replica directory
        #[arg(short, long)]
        remote: PathBuf,
    },

    /// Push a document to a remote replica
    Push {
        #[arg(short, long)]
        dir: PathBuf,
        #[arg(long)]
        doc: String,
        #[arg(short, long)]
        remote: PathBuf,
        /// Push even while local heads are conflicted
        #[arg(long)]
        force: bool,
    },

    /// Pull, then push unless a merge is pending
    Sync {
        #[arg(short, long)]
        dir: PathBuf,
        #[arg(long)]
        doc: String,
        #[arg(short, long)]
        remote: PathBuf,
    },

    /// Merge diverged heads
    Merge {
        #[arg(short, long)]
        dir: PathBuf,
        #[arg(long)]
        doc: String,
    },

    /// Convert a document to cards and write them as JSON
    Migrate {
        #[arg(short, long)]
        dir: PathBuf,
        #[arg(long)]
        doc: String,
        /// Output file
        #[arg(short, long)]
        out: PathBuf,
    },

    /// Write the head tree as JSON with integrity verification
    Export {
        #[arg(short, long)]
        dir: PathBuf,
        #[arg(long)]
        doc: String,
        #[arg(short, long)]
        out: PathBuf,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::from_default_env()
                .add_directive("outlinesync=info".parse().context("Invalid log directive")?),
        )
        .init();

    let cli = Cli::parse();
    tracing::debug!(command = ?cli.command, "starting");

    match cli.command {
        Commands::Init { dir, author } => cmd_init(dir, author),
        Commands::Commit { dir, doc, file, name } => cmd_commit(dir, doc, file, name).await,
        Commands::Log { dir, doc, limit } => cmd_log(dir, doc, limit).await,
        Commands::Checkout { dir, doc, commit } => cmd_checkout(dir, doc, commit).await,
        Commands::Pull { dir, doc, remote } => cmd_pull(dir, doc, remote).await,
        Commands::Push {
            dir,
            doc,
            remote,
            force,
        } => cmd_push(dir, doc, remote, force).await,
        Commands::Sync { dir, doc, remote } => cmd_sync(dir, doc, remote).await,
        Commands::Merge { dir, doc } => cmd_merge(dir, doc).await,
        Commands::Migrate { dir, doc, out } => cmd_migrate(dir, doc, out).await,
        Commands::Export { dir, doc, out } => cmd_export(dir, doc, out).await,
    }
}

fn cmd_init(dir: PathBuf, author: Option<String>) -> Result<()> {
    let ws = Workspace::init(&dir, author)?;
    println!("Initialized workspace in {}", ws.dir().display());
    println!("  Client: {}", ws.config().client_id);
    println!("  Author: {}", ws.config().author);
    Ok(())
}

async fn cmd_commit(dir: PathBuf, doc: String, file: PathBuf, name: Option<String>) -> Result<()> {
    let ws = Workspace::open(&dir)?;
    let tree = read_tree(&file)?;
    let outcome = ws.commit(&doc, tree, name).await?;
    println!("Committed {}", outcome.commit);
    println!("  Objects written: {}", outcome.persisted.len());
    if let Some(event) = &outcome.merge {
        println!("  Heads diverged: {} vs {}", event.local, event.remote);
        println!("  Run `outlinesync merge --doc {}` to combine them", doc);
    }
    Ok(())
}

async fn cmd_log(dir: PathBuf, doc: String, limit: usize) -> Result<()> {
    let ws = Workspace::open(&dir)?;
    let commits = ws.log(&doc, limit).await?;
    if commits.is_empty() {
        println!("No commits.");
        return Ok(());
    }
    for commit in commits {
        let date = chrono::DateTime::from_timestamp_millis(commit.timestamp)
            .map(|dt| dt.format("%Y-%m-%d %H:%M:%S UTC").to_string())
            .unwrap_or_else(|| commit.timestamp.to_string());
        println!("commit {}", commit.id);
        if commit.parents.len() > 1 {
            let parents: Vec<String> = commit.parents.iter().map(|p| short(p)).collect();
            println!("Merge:  {}", parents.join(" "));
        }
        println!("Author: {}", commit.author);
        println!("Date:   {}", date);
        println!();
    }
    Ok(())
}

async fn cmd_checkout(dir: PathBuf, doc: String, commit: Option<String>) -> Result<()> {
    let ws = Workspace::open(&dir)?;
    let at = commit
        .map(|hex| ObjectId::from_hex(&hex).map_err(|e| anyhow!("Invalid commit id {}: {}", hex, e)))
        .transpose()?;
    let tree = ws.checkout(&doc, at).await?;
    println!("{}", serde_json::to_string_pretty(&tree)?);
    Ok(())
}

async fn cmd_pull(dir: PathBuf, doc: String, remote: PathBuf) -> Result<()> {
    let ws = Workspace::open(&dir)?;
    let remote = open_remote(&remote)?;
    let session = ws.session(&doc).await?;
    let pulled = session.pull(remote.as_ref()).await?;
    print_pulled(&doc, pulled.as_ref());
    Ok(())
}

async fn cmd_push(dir: PathBuf, doc: String, remote: PathBuf, force: bool) -> Result<()> {
    let ws = Workspace::open(&dir)?;
    let remote = open_remote(&remote)?;
    let session = ws.session(&doc).await?;
    let report = session.push(remote.as_ref(), !force).await?;
    print_pushed(report.as_ref());
    Ok(())
}

async fn cmd_sync(dir: PathBuf, doc: String, remote: PathBuf) -> Result<()> {
    let ws = Workspace::open(&dir)?;
    let remote = open_remote(&remote)?;
    let session = ws.session(&doc).await?;
    session
        .sync(
            remote.as_ref(),
            None,
            |pulled| {
                print_pulled(&doc, pulled);
                None
            },
            print_pushed,
        )
        .await?;
    Ok(())
}

async fn cmd_merge(dir: PathBuf, doc: String) -> Result<()> {
    let ws = Workspace::open(&dir)?;
    match ws.merge(&doc).await? {
        None => println!("Nothing to merge."),
        Some(merged) => {
            println!("Merged into {}", merged.outcome.commit);
            for id in &merged.conflicts {
                println!("  Both sides edited node {}; kept the local version", id);
            }
        }
    }
    Ok(())
}

async fn cmd_migrate(dir: PathBuf, doc: String, out: PathBuf) -> Result<()> {
    let ws = Workspace::open(&dir)?;
    let (outcome, hash) = ws.migrate(&doc, &out).await?;
    if outcome.created {
        println!("Migrated {} to card tree {}", doc, outcome.tree_id);
    } else {
        println!("{} was already migrated to {}", doc, outcome.tree_id);
    }
    println!("  Cards:  {}", outcome.cards.len());
    println!("  Output: {} (sha256 {})", out.display(), hash);
    Ok(())
}

async fn cmd_export(dir: PathBuf, doc: String, out: PathBuf) -> Result<()> {
    let ws = Workspace::open(&dir)?;
    let hash = ws.export(&doc, &out).await?;
    println!("Exported {} to {}", doc, out.display());
    println!("  sha256: {}", hash);
    Ok(())
}

fn print_pulled(doc: &str, pulled: Option<&Pulled>) {
    let Some(pulled) = pulled else {
        println!("Already up to date.");
        return;
    };
    println!("Pulled {} records", pulled.report.docs_written);
    if let Some(event) = pulled.resolution.merge() {
        println!("  Heads diverged: {} vs {}", short(&event.local), short(&event.remote));
        println!("  Run `outlinesync merge --doc {}` to combine them", doc);
    }
}

fn print_pushed(report: Option<&ReplicationReport>) {
    match report {
        Some(report) => println!("Pushed {} records", report.docs_written),
        None => println!("Push skipped: unresolved conflicts."),
    }
}

fn short(id: &ObjectId) -> String {
    id.to_hex()[..12].to_string()
}

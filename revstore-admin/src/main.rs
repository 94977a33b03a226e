//! Revstore Administration CLI

mod verify;

use anyhow::{Context, Result};
use bytes::Bytes;
use clap::{Parser, Subcommand};
use revstore_core::{
    CommitInfo, PutMode, Repository, ResourceFilter, Version, VersionId,
};
use std::collections::BTreeMap;
use std::io::Write;
use std::path::Path;
use tracing::info;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

#[derive(Parser, Debug)]
#[command(name = "revstore-admin")]
#[command(author = "Revstore Contributors")]
#[command(version = "0.1.0")]
#[command(about = "Revstore repository administration tool")]
struct Cli {
    /// Enable debug logging
    #[arg(long, global = true)]
    debug: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Initialize a new repository
    Init { path: String },

    /// Store a file as a resource of an open version
    Put {
        #[arg(short, long)]
        repo: String,
        /// Version to update; a new root version is created when omitted
        #[arg(short, long)]
        version: Option<i64>,
        /// Resource path inside the version
        path: String,
        /// Local file to read
        file: String,
    },

    /// Print the content of a resource
    Cat {
        #[arg(short, long)]
        repo: String,
        #[arg(short, long)]
        version: i64,
        path: String,
    },

    /// List the resources of a version
    Ls {
        #[arg(short, long)]
        repo: String,
        #[arg(short, long)]
        version: i64,
        #[arg(short, long)]
        prefix: Option<String>,
        /// Only direct children of the prefix
        #[arg(long)]
        shallow: bool,
    },

    /// Create an open child of a version
    Branch {
        #[arg(short, long)]
        repo: String,
        #[arg(short, long)]
        version: i64,
    },

    /// Commit an open version
    Commit {
        #[arg(short, long)]
        repo: String,
        #[arg(short, long)]
        version: i64,
        #[arg(short, long)]
        message: String,
        #[arg(short, long)]
        author: Option<String>,
    },

    /// Show a version and its ancestors, newest first
    Log {
        #[arg(short, long)]
        repo: String,
        #[arg(short, long)]
        version: i64,
        #[arg(short, long, default_value_t = 20)]
        limit: usize,
        /// Print commit manifests as JSON
        #[arg(long)]
        json: bool,
    },

    /// Verify every revision referenced by any version
    Verify {
        #[arg(short, long)]
        repo: String,
        #[arg(short, long)]
        quiet: bool,
    },
}

fn init_tracing(debug: bool) {
    let env_filter = if debug {
        tracing_subscriber::EnvFilter::new("debug")
    } else {
        tracing_subscriber::EnvFilter::from_default_env()
            .add_directive(tracing::Level::WARN.into())
    };

    tracing_subscriber::registry()
        .with(tracing_subscriber::fmt::layer().with_writer(std::io::stderr))
        .with(env_filter)
        .init();
}

fn open_repository(path: &str) -> Result<Repository> {
    Repository::open(Path::new(path))
        .with_context(|| format!("Failed to open repository at {}", path))
}

fn format_stamp(stamp: i64) -> String {
    chrono::DateTime::from_timestamp_millis(stamp)
        .map(|t| t.format("%Y-%m-%d %H:%M:%S").to_string())
        .unwrap_or_else(|| stamp.to_string())
}

fn describe(version: &Version) -> String {
    match version.seal {
        Some(seal) => format!("{} committed (seal {})", version.id, seal),
        None => format!("{} open", version.id),
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    init_tracing(cli.debug);

    match cli.command {
        Commands::Init { path } => {
            println!("Initializing repository at {}", path);
            let repo = Repository::init(Path::new(&path))?;
            println!(
                "Repository initialized successfully (database: {})",
                repo.config().database_file
            );
        }

        Commands::Put {
            repo,
            version,
            path,
            file,
        } => {
            let repository = open_repository(&repo)?;
            let versions = repository.versions();
            let version = match version {
                Some(id) => VersionId(id),
                None => {
                    let root = versions.create_root().await?;
                    println!("Created root version {}", root.id.get());
                    root.id
                }
            };
            let content = std::fs::read(&file)
                .with_context(|| format!("Failed to read {}", file))?;
            let resources = BTreeMap::from([(path.clone(), Bytes::from(content))]);
            let stored = versions
                .put_resources(version, resources, PutMode::Merge)
                .await?;
            for (path, revision) in stored {
                println!(
                    "{} -> {} ({} bytes, {}, {})",
                    path,
                    revision.hash,
                    revision.length,
                    revision.id,
                    if revision.is_diff() { "diff" } else { "full" }
                );
            }
        }

        Commands::Cat {
            repo,
            version,
            path,
        } => {
            let repository = open_repository(&repo)?;
            let content = repository
                .versions()
                .load_resource(VersionId(version), &path)
                .await?;
            let mut stdout = std::io::stdout().lock();
            stdout.write_all(&content)?;
            stdout.flush()?;
        }

        Commands::Ls {
            repo,
            version,
            prefix,
            shallow,
        } => {
            let repository = open_repository(&repo)?;
            let filter = ResourceFilter {
                prefix,
                shallow,
                ..Default::default()
            };
            let entries = repository
                .versions()
                .list_resources(VersionId(version), &filter)
                .await?;
            for entry in entries {
                println!(
                    "{:>10}  {}  {}",
                    entry.revision.length, entry.revision.hash, entry.path
                );
            }
        }

        Commands::Branch { repo, version } => {
            let repository = open_repository(&repo)?;
            let child = repository.versions().create_child(VersionId(version)).await?;
            info!("Branched {} from v{}", child.id, version);
            println!("Created version {}", child.id.get());
        }

        Commands::Commit {
            repo,
            version,
            message,
            author,
        } => {
            let repository = open_repository(&repo)?;
            let info = CommitInfo {
                author,
                message: Some(message),
                ..Default::default()
            };
            let sealed = repository
                .versions()
                .commit(VersionId(version), info)
                .await?;
            println!("{}", describe(&sealed));
        }

        Commands::Log {
            repo,
            version,
            limit,
            json,
        } => {
            let repository = open_repository(&repo)?;
            let versions = repository.versions();
            for entry in versions.history(VersionId(version), limit).await? {
                let manifest = versions.load_commit_info(entry.id).await?;
                if json {
                    println!("{}", serde_json::to_string_pretty(&manifest)?);
                    continue;
                }
                println!("{}", "-".repeat(72));
                println!("{} | {}", describe(&entry), format_stamp(entry.stamp));
                let parents = versions.parents(entry.id).await?;
                if !parents.is_empty() {
                    let parents: Vec<String> = parents.iter().map(|p| p.to_string()).collect();
                    println!("parents: {}", parents.join(", "));
                }
                if let Some(manifest) = manifest {
                    if let Some(author) = &manifest.author {
                        println!("author: {}", author);
                    }
                    println!("\n{}\n", manifest.message.as_deref().unwrap_or(""));
                }
            }
        }

        Commands::Verify { repo, quiet } => {
            let repository = open_repository(&repo)?;
            if !quiet {
                println!("Verifying repository: {}", repo);
            }
            verify::verify_repository(&repository, quiet).await?;
        }
    }

    Ok(())
}

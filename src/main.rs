use anyhow::{Context, Result};
use clap::{Parser, Subcommand};

use burrow::config::Config;
use burrow::error::IndexError;
use burrow::git::GitCli;
use burrow::index::chunker::ChunkLimits;
use burrow::index::{IndexEvent, IndexRunner, Indexer};
use burrow::plugins;
use burrow::registry::state::{list_git_repositories, repo_path, sync_state_with_registry};
use burrow::registry::{RepoDefaults, Registry};
use burrow::runtime::Initializer;
use burrow::search::{Retriever, SearchRequest};

#[derive(Parser)]
#[command(name = "burrow", version, about = "Git-aware semantic code index and retrieval")]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Fully index a repository at its current HEAD
    Index {
        repo_id: String,
        /// Stack type override (e.g. android_app)
        #[arg(long)]
        stack_type: Option<String>,
    },
    /// Incrementally index new commits, or working-tree edits when HEAD is
    /// already indexed
    Update {
        repo_id: String,
        #[arg(long)]
        stack_type: Option<String>,
    },
    /// Semantic search over the latest indexed view
    Search {
        query: String,
        /// Restrict to one repository (also enables block/focus hydration)
        #[arg(long)]
        repo: Option<String>,
        #[arg(short = 'k', long, default_value = "5")]
        k: usize,
        #[arg(long)]
        stack_type: Option<String>,
        #[arg(long)]
        component_type: Option<String>,
        #[arg(long)]
        screen_name: Option<String>,
        /// May be given multiple times; matches any
        #[arg(long = "tag")]
        tags: Vec<String>,
    },
    /// Working-tree change classification for a repository
    Status { repo_id: String },
    /// Last indexing run recorded in the registry
    IndexStatus { repo_id: String },
    /// List git repositories under the repos root
    Repos,
}

fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .with_writer(std::io::stderr)
        .init();

    let config = Config::from_env();
    let cli = Cli::parse();

    match cli.command {
        Commands::Index { repo_id, stack_type } => cmd_index(&config, &repo_id, stack_type, true),
        Commands::Update { repo_id, stack_type } => cmd_index(&config, &repo_id, stack_type, false),
        Commands::Search { query, repo, k, stack_type, component_type, screen_name, tags } => {
            cmd_search(&config, query, repo, k, stack_type, component_type, screen_name, tags)
        }
        Commands::Status { repo_id } => cmd_status(&config, &repo_id),
        Commands::IndexStatus { repo_id } => cmd_index_status(&config, &repo_id),
        Commands::Repos => cmd_repos(&config),
    }
}

fn repo_defaults(config: &Config, repo_id: &str, stack_type: Option<&str>) -> RepoDefaults {
    RepoDefaults {
        name: repo_id.to_string(),
        collection_name: config.collection(),
        embedding_model: config.embed_model.clone(),
        stack_type: stack_type.map(str::to_string).or_else(|| config.stack_type.clone()),
    }
}

/// Fetch-or-create the registry row and reject archived repositories.
fn ensure_entry(
    registry: &Registry,
    config: &Config,
    repo_id: &str,
    stack_override: Option<&str>,
) -> Result<burrow::registry::RepoEntry> {
    let mut entry = registry.ensure(repo_id, &repo_defaults(config, repo_id, stack_override))?;
    if let Some(stack) = stack_override {
        if entry.stack_type.as_deref() != Some(stack) {
            registry.set_stack_type(repo_id, stack)?;
            entry = registry.get(repo_id)?.context("repo row vanished")?;
        }
    }
    if entry.archived {
        return Err(
            IndexError::InvalidRequest(format!("repository '{repo_id}' is archived")).into()
        );
    }
    Ok(entry)
}

fn cmd_index(config: &Config, repo_id: &str, stack_override: Option<String>, full: bool) -> Result<()> {
    let registry = Registry::open(&config.registry_db)?;
    let entry = ensure_entry(&registry, config, repo_id, stack_override.as_deref())?;
    let stack_type =
        stack_override.or_else(|| entry.stack_type.clone()).or_else(|| config.stack_type.clone());

    sync_state_with_registry(&config.state_file, repo_id, entry.last_indexed_commit.as_deref())?;
    let repo_dir = repo_path(&config.repos_dir, repo_id)?;

    let initializer = Initializer::new(config.clone());
    if !config.skip_collection_init {
        initializer.ensure_default_collection()?;
    }
    let (embedder, store) = initializer.clients(&entry.collection_name, &entry.embedding_model)?;

    let indexer = Indexer::new(
        &repo_dir,
        repo_id,
        &config.branch,
        embedder,
        store,
        plugins::for_stack(stack_type.as_deref()),
        stack_type,
        ChunkLimits::from_config(config),
    )?;
    let runner = IndexRunner::new(indexer, registry, config.state_file.clone());

    let events = if full { runner.stream_full() } else { runner.stream_update() };
    let mut failed = false;
    for event in events {
        println!("{}", serde_json::to_string(&event)?);
        if matches!(event, IndexEvent::Error { .. }) {
            failed = true;
        }
    }
    if failed {
        std::process::exit(1);
    }
    Ok(())
}

#[allow(clippy::too_many_arguments)]
fn cmd_search(
    config: &Config,
    query: String,
    repo: Option<String>,
    k: usize,
    stack_type: Option<String>,
    component_type: Option<String>,
    screen_name: Option<String>,
    tags: Vec<String>,
) -> Result<()> {
    let initializer = Initializer::new(config.clone());
    if !config.skip_collection_init {
        initializer.ensure_default_collection()?;
    }

    let mut effective_stack = stack_type.or_else(|| config.stack_type.clone());
    let (embedder, store, repo_root) = match &repo {
        Some(repo_id) => {
            let registry = Registry::open(&config.registry_db)?;
            let entry = ensure_entry(&registry, config, repo_id, None)?;
            if effective_stack.is_none() {
                effective_stack = entry.stack_type.clone();
            }
            let (embedder, store) =
                initializer.clients(&entry.collection_name, &entry.embedding_model)?;
            (embedder, store, Some(repo_path(&config.repos_dir, repo_id)?))
        }
        None => {
            let (embedder, store) =
                initializer.clients(&config.collection(), &config.embed_model)?;
            (embedder, store, None)
        }
    };

    let request = SearchRequest {
        query,
        k,
        repo,
        stack_type: effective_stack,
        component_type,
        screen_name,
        tags: if tags.is_empty() { None } else { Some(tags) },
    };
    let retriever = Retriever::new(store, embedder, repo_root);
    let hits = retriever.search(&request, &config.branch)?;
    println!("{}", serde_json::to_string_pretty(&hits)?);
    Ok(())
}

fn cmd_status(config: &Config, repo_id: &str) -> Result<()> {
    let registry = Registry::open(&config.registry_db)?;
    ensure_entry(&registry, config, repo_id, None)?;
    let git = GitCli::new(repo_path(&config.repos_dir, repo_id)?)?;
    println!("{}", serde_json::to_string_pretty(&git.classify_status()?)?);
    Ok(())
}

fn cmd_index_status(config: &Config, repo_id: &str) -> Result<()> {
    let registry = Registry::open(&config.registry_db)?;
    registry.ensure(repo_id, &repo_defaults(config, repo_id, None))?;
    let status = registry.run_status(repo_id)?.unwrap_or_default();
    println!("{}", serde_json::to_string_pretty(&status)?);
    Ok(())
}

fn cmd_repos(config: &Config) -> Result<()> {
    let repos = list_git_repositories(&config.repos_dir);
    println!("{}", serde_json::to_string_pretty(&repos)?);
    Ok(())
}

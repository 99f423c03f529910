//! CLI implementation for kbq
//!
//! A diagnostic harness over the library API: every command opens the
//! engine, runs one operation and prints the result.

mod display;
mod signal;

use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use clap::{Parser, Subcommand, ValueEnum};

use kbsearch::config::{set_database_in_config, Config, PROJECT_CONFIG};
use kbsearch::query::SortBy;
use kbsearch::{NewEntry, SearchEngine, SearchOptions, UsageOutcome};

use signal::{interruptible, ExitCode};

#[derive(Parser)]
#[command(name = "kbq")]
#[command(about = "Search an embedded knowledge base")]
#[command(version)]
pub struct Cli {
    #[command(subcommand)]
    command: Commands,

    /// Store file (default from config, else the user data dir)
    #[arg(long, global = true, env = "KBSEARCH_DB")]
    db: Option<PathBuf>,

    /// Output as JSON
    #[arg(long, global = true)]
    json: bool,

    /// Show debug info (sets RUST_LOG=debug)
    #[arg(short, long, global = true)]
    pub verbose: bool,
}

#[derive(Subcommand)]
enum Commands {
    /// Create the store (and optionally record it in .kbsearch.toml)
    Init {
        /// Write the store path into the project config
        #[arg(long)]
        save: bool,
    },
    /// Search the knowledge base
    Search {
        /// Query text, error code, `category:<name>` or `tag:<a,b>`
        query: String,
        /// Max results
        #[arg(short = 'n', long)]
        limit: Option<usize>,
        /// Results to skip
        #[arg(long, default_value = "0")]
        offset: usize,
        /// Filter by category
        #[arg(short = 'c', long)]
        category: Option<String>,
        /// Filter by tag (repeatable)
        #[arg(short = 't', long = "tag")]
        tags: Vec<String>,
        /// relevance, usage, success_rate or created_at
        #[arg(long, default_value = "relevance")]
        sort: String,
        /// Include archived entries
        #[arg(long)]
        archived: bool,
    },
    /// Suggest completions for a prefix
    Complete {
        prefix: String,
        /// Max suggestions
        #[arg(short = 'n', long, default_value = "10")]
        limit: usize,
    },
    /// Add an entry
    Add {
        #[arg(long)]
        title: String,
        #[arg(long)]
        problem: String,
        #[arg(long)]
        solution: String,
        #[arg(long)]
        category: String,
        /// Tag (repeatable)
        #[arg(short = 't', long = "tag")]
        tags: Vec<String>,
    },
    /// Record how an entry worked out
    Feedback {
        id: String,
        #[arg(value_enum)]
        outcome: OutcomeArg,
    },
    /// Archive an entry (or restore it with --restore)
    Archive {
        id: String,
        #[arg(long)]
        restore: bool,
    },
    /// Show store, pool and cache statistics
    Stats,
    /// Check pool, store and cache health
    Health,
}

#[derive(Clone, Copy, ValueEnum)]
enum OutcomeArg {
    Viewed,
    Success,
    Failure,
}

impl From<OutcomeArg> for UsageOutcome {
    fn from(arg: OutcomeArg) -> Self {
        match arg {
            OutcomeArg::Viewed => UsageOutcome::Viewed,
            OutcomeArg::Success => UsageOutcome::Success,
            OutcomeArg::Failure => UsageOutcome::Failure,
        }
    }
}

/// Run CLI with pre-parsed arguments (main.rs inspects `verbose` first)
pub async fn run_with(cli: Cli) -> Result<()> {
    let cwd = std::env::current_dir().context("Failed to read working directory")?;
    let config = Config::load(&cwd);
    let db = cli.db.clone().unwrap_or_else(|| config.database_or_default());

    let engine = SearchEngine::open(&db, config.engine_config())
        .await
        .with_context(|| format!("Failed to open store {}", db.display()))?;

    let result = interruptible(dispatch(&cli, &engine, &config, &db, &cwd)).await;
    engine.close().await;
    result
}

async fn dispatch(
    cli: &Cli,
    engine: &SearchEngine,
    config: &Config,
    db: &Path,
    cwd: &Path,
) -> Result<()> {
    match &cli.command {
        Commands::Init { save } => cmd_init(engine, db, cwd, *save).await,
        Commands::Search {
            query,
            limit,
            offset,
            category,
            tags,
            sort,
            archived,
        } => {
            let sort_by: SortBy = sort.parse()?;
            let mut options = SearchOptions::default()
                .with_limit(limit.unwrap_or_else(|| config.limit_or_default()))
                .with_offset(*offset)
                .with_sort(sort_by)
                .with_archived(*archived)
                .with_tags(tags.iter().cloned());
            if let Some(c) = category {
                options = options.with_category(c.clone());
            }
            cmd_search(cli, engine, query, options).await
        }
        Commands::Complete { prefix, limit } => cmd_complete(cli, engine, prefix, *limit).await,
        Commands::Add {
            title,
            problem,
            solution,
            category,
            tags,
        } => {
            let entry = NewEntry::new(title, problem, solution, category).with_tags(tags.iter().cloned());
            let id = engine.add_entry(entry).await?;
            if cli.json {
                println!("{}", serde_json::json!({ "id": id }));
            } else {
                println!("Added {id}");
            }
            Ok(())
        }
        Commands::Feedback { id, outcome } => {
            engine.record_feedback(id, (*outcome).into()).await?;
            if !cli.json {
                println!("Recorded");
            }
            Ok(())
        }
        Commands::Archive { id, restore } => {
            engine.archive_entry(id, !restore).await?;
            if !cli.json {
                println!("{} {id}", if *restore { "Restored" } else { "Archived" });
            }
            Ok(())
        }
        Commands::Stats => cmd_stats(cli, engine).await,
        Commands::Health => cmd_health(cli, engine).await,
    }
}

// === Commands ===

/// Create the store file and schema. `SearchEngine::open` already did the
/// work; this reports it and optionally records the path.
async fn cmd_init(engine: &SearchEngine, db: &Path, cwd: &Path, save: bool) -> Result<()> {
    let stats = engine.store_stats().await?;
    println!("Store ready at {} ({} entries)", db.display(), stats.total_entries);
    if save {
        let config_path = cwd.join(PROJECT_CONFIG);
        set_database_in_config(&config_path, db)
            .with_context(|| format!("Failed to update {}", config_path.display()))?;
        println!("Recorded in {}", config_path.display());
    }
    Ok(())
}

async fn cmd_search(cli: &Cli, engine: &SearchEngine, query: &str, options: SearchOptions) -> Result<()> {
    let response = engine.search(query, options).await?;
    if cli.json {
        println!("{}", serde_json::to_string_pretty(&response)?);
    } else {
        display::display_search(&response);
    }
    if response.results.is_empty() {
        engine.close().await;
        std::process::exit(ExitCode::NoResults as i32);
    }
    Ok(())
}

async fn cmd_complete(cli: &Cli, engine: &SearchEngine, prefix: &str, limit: usize) -> Result<()> {
    let suggestions = engine.auto_complete(prefix, limit).await?;
    if cli.json {
        println!("{}", serde_json::to_string_pretty(&suggestions)?);
    } else {
        display::display_suggestions(&suggestions);
    }
    Ok(())
}

async fn cmd_stats(cli: &Cli, engine: &SearchEngine) -> Result<()> {
    let store = engine.store_stats().await?;
    let pool = engine.pool_stats();
    let cache = engine.cache_stats();
    if cli.json {
        let out = serde_json::json!({ "store": store, "pool": pool, "cache": cache });
        println!("{}", serde_json::to_string_pretty(&out)?);
    } else {
        display::display_stats(&store, &pool, &cache);
    }
    Ok(())
}

async fn cmd_health(cli: &Cli, engine: &SearchEngine) -> Result<()> {
    let report = engine.health_check().await;
    if cli.json {
        println!("{}", serde_json::to_string_pretty(&report)?);
    } else {
        display::display_health(&report);
    }
    if !report.healthy {
        engine.close().await;
        std::process::exit(ExitCode::Unhealthy as i32);
    }
    Ok(())
}

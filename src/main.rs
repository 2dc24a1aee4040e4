use std::collections::{BTreeSet, HashSet};
use std::path::PathBuf;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use tracing::info;
use tracing_subscriber::EnvFilter;

use logsift::storage::patterns::{self, NewPattern};
use logsift::{Config, Database, PatternCatalog, ScanEngine, ScanPolicy};

/// logsift - attribute failed CI builds to known failure patterns
#[derive(Parser)]
#[command(name = "logsift")]
#[command(version = env!("CARGO_PKG_VERSION"))]
#[command(about = "Incremental CI failure log scanner", long_about = None)]
struct Cli {
    /// Enable verbose logging
    #[arg(short, long)]
    verbose: bool,

    /// Path to the configuration file
    #[arg(long, default_value_os_t = default_config_path())]
    config: PathBuf,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Write a default config file and initialize the database schema
    Init,

    /// Run one scan batch
    Scan {
        /// Cap on unvisited builds to process (defaults to the configured
        /// fetch_limit)
        #[arg(long)]
        count: Option<usize>,
        /// Restrict the batch to these build numbers (comma-separated)
        #[arg(long, value_delimiter = ',')]
        builds: Vec<i64>,
    },

    /// Show row counts and configuration
    Status,

    /// Pattern catalog management
    Patterns {
        #[command(subcommand)]
        action: PatternsAction,
    },
}

#[derive(Subcommand)]
enum PatternsAction {
    /// List the pattern catalog
    List,

    /// Add a pattern to the catalog
    Add {
        /// The literal substring or regex to match
        expression: String,
        /// Treat the expression as a regex
        #[arg(long)]
        regex: bool,
        /// Human-readable description
        #[arg(long)]
        description: Option<String>,
        /// Tags (repeatable)
        #[arg(long)]
        tag: Vec<String>,
        /// Restrict to these step names (repeatable; none = applies to all)
        #[arg(long = "step")]
        steps: Vec<String>,
        /// Rank against competing patterns; higher wins
        #[arg(long, default_value = "1")]
        specificity: i32,
        /// Only match within the last N lines of a log
        #[arg(long)]
        lines_from_end: Option<i32>,
    },

    /// Retire a pattern (keeps history, drops best-match eligibility)
    Retire {
        /// Pattern ID to retire
        pattern_id: i64,
    },
}

fn default_config_path() -> PathBuf {
    dirs::home_dir()
        .unwrap_or_else(|| PathBuf::from("."))
        .join(".logsift")
        .join("config.toml")
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    let filter = if cli.verbose {
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("debug"))
    } else {
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"))
    };

    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .with_writer(std::io::stderr)
        .init();

    match cli.command {
        Commands::Init => {
            Config::write_default(&cli.config)?;
            println!("Config: {}", cli.config.display());

            let config = Config::load(&cli.config)?;
            let db = Database::connect(&config.database_url, 1)
                .await
                .context("failed to connect to database")?;
            db.init_schema().await?;
            println!("Schema initialized at {}", config.database_url);
        }

        Commands::Scan { count, builds } => {
            let config = Config::load(&cli.config)?;
            let engine = ScanEngine::from_config(&config).await?;

            // Ctrl-C stops the batch between builds; in-flight builds
            // finish persisting first.
            let flag = engine.cancel_flag();
            ctrlc::set_handler(move || {
                info!("cancellation requested");
                flag.cancel();
            })
            .context("failed to set signal handler")?;

            let policy = if builds.is_empty() {
                ScanPolicy::FetchLimit(count.unwrap_or(config.fetch_limit))
            } else {
                ScanPolicy::Whitelist(builds.into_iter().collect::<HashSet<i64>>())
            };

            let stats = engine.scan_batch(&policy).await?;

            println!("Scan {} complete in {}ms", stats.scan_id, stats.duration_ms);
            println!("  Builds visited:    {}", stats.builds_visited);
            println!("  Builds revisited:  {}", stats.builds_revisited);
            println!("  Matches inserted:  {}", stats.matches_inserted);
            println!("  Timeouts:          {}", stats.timeouts);
            println!("  Idiopathic:        {}", stats.idiopathic);
            println!("  No log available:  {}", stats.no_log);
            println!("  Skipped (retry):   {}", stats.skipped);
            if stats.cancelled > 0 {
                println!("  Cancelled:         {}", stats.cancelled);
            }
        }

        Commands::Status => {
            let config = Config::load(&cli.config)?;
            let db = Database::connect(&config.database_url, 1).await?;
            let counts = db.counts().await?;

            println!("logsift status");
            println!("==============");
            println!("CI provider:  {}", config.ci_base_url);
            println!("Log cache:    {}", config.cache_dir.display());
            println!();
            println!("Builds:       {}", counts.builds);
            println!("Build steps:  {}", counts.build_steps);
            println!("Patterns:     {}", counts.patterns);
            println!("Matches:      {}", counts.matches);
            println!("Scans:        {}", counts.scans);
        }

        Commands::Patterns { action } => {
            let config = Config::load(&cli.config)?;
            let db = Database::connect(&config.database_url, 1).await?;

            match action {
                PatternsAction::List => {
                    let catalog = PatternCatalog::load(db.pool()).await?;
                    if catalog.is_empty() {
                        println!("No patterns in the catalog.");
                        return Ok(());
                    }

                    for pattern in catalog.all() {
                        let kind = if pattern.is_regex { "regex" } else { "literal" };
                        let retired = if pattern.is_retired { " [retired]" } else { "" };
                        println!(
                            "#{} [{}] spec={}{} {:?}",
                            pattern.id, kind, pattern.specificity, retired, pattern.expression
                        );
                        if !pattern.applicable_steps.is_empty() {
                            let steps: Vec<&str> =
                                pattern.applicable_steps.iter().map(String::as_str).collect();
                            println!("    steps: {}", steps.join(", "));
                        }
                        if let Some(desc) = &pattern.description {
                            println!("    {}", desc);
                        }
                    }
                }

                PatternsAction::Add {
                    expression,
                    regex,
                    description,
                    tag,
                    steps,
                    specificity,
                    lines_from_end,
                } => {
                    // Validate the expression before persisting so a typo
                    // doesn't land a permanently-excluded catalog entry.
                    if regex {
                        regex::Regex::new(&expression)
                            .context("expression is not a valid regex")?;
                    }

                    let pattern = NewPattern {
                        expression,
                        is_regex: regex,
                        is_nondeterministic: false,
                        description,
                        tags: tag.into_iter().collect::<BTreeSet<String>>(),
                        applicable_steps: steps.into_iter().collect::<BTreeSet<String>>(),
                        specificity,
                        lines_from_end,
                        author: std::env::var("USER").ok(),
                    };

                    let id = patterns::insert_pattern(db.pool(), &pattern).await?;
                    println!("Added pattern #{}", id);
                }

                PatternsAction::Retire { pattern_id } => {
                    patterns::retire_pattern(db.pool(), pattern_id).await?;
                    println!("Retired pattern #{}", pattern_id);
                }
            }
        }
    }

    Ok(())
}

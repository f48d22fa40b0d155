mod agent;
mod cleanup_cmd;
mod config;
mod gate_cmd;
mod invariant_cmds;
mod log_cmd;
mod run_cmds;
mod task_cmds;
mod tui;

use anyhow::Context;
use clap::{Parser, Subcommand};

use orc_core::token::guard;
use orc_db::pool;

use config::GatorConfig;

#[derive(Parser)]
#[command(name = "orc", about = "LLM coding agent fleet orchestrator")]
struct Cli {
    /// Database URL (overrides ORC_DATABASE_URL env var)
    #[arg(long, global = true)]
    database_url: Option<String>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
pub enum Commands {
    /// Write a orc config file (no database required)
    Init {
        /// PostgreSQL connection URL
        #[arg(long, default_value = "postgresql://localhost:5432/orc")]
        db_url: String,
        /// Overwrite existing config file
        #[arg(long)]
        force: bool,
    },
    /// Initialize the orc database (requires config file or env vars)
    DbInit,
    /// Task management
    Tasks {
        #[command(subcommand)]
        command: TaskCommands,
    },
    /// Invariant management
    Invariant {
        #[command(subcommand)]
        command: InvariantCommands,
    },
    /// Advance every active task by one scheduler tick
    Tick {
        /// `owner/repo=/local/checkout/path` (repeatable)
        #[arg(long = "repo-path")]
        repo_paths: Vec<String>,
        /// GitHub token (overrides ORC_GITHUB_TOKEN/GITHUB_TOKEN)
        #[arg(long)]
        github_token: Option<String>,
        /// Model to run agents with
        #[arg(long, default_value = "claude-sonnet-4-5")]
        model: String,
    },
    /// Drive the scheduler until it runs dry or a bound is hit
    Run {
        /// `owner/repo=/local/checkout/path` (repeatable)
        #[arg(long = "repo-path")]
        repo_paths: Vec<String>,
        /// GitHub token (overrides ORC_GITHUB_TOKEN/GITHUB_TOKEN)
        #[arg(long)]
        github_token: Option<String>,
        /// Model to run agents with
        #[arg(long, default_value = "claude-sonnet-4-5")]
        model: String,
        /// Maximum number of ticks to run
        #[arg(long, default_value_t = 100)]
        max_ticks: usize,
        /// Maximum wall-clock duration in seconds
        #[arg(long, default_value_t = 3600)]
        max_duration_secs: u64,
        /// Seconds to sleep between ticks
        #[arg(long, default_value_t = 5)]
        tick_interval_secs: u64,
    },
    /// Show the lifecycle event log for a task
    Log {
        /// Task ID to show events for
        task_id: String,
        /// Filter to a specific event type
        #[arg(long)]
        event_type: Option<String>,
    },
    /// Approve a task awaiting human review
    Approve {
        /// Task ID to approve
        task_id: String,
    },
    /// Reject a task awaiting human review (sends it back for retry)
    Reject {
        /// Task ID to reject
        task_id: String,
    },
    /// Retry a failed or human-waiting task
    Retry {
        /// Task ID to retry
        task_id: String,
    },
    /// View gate results for a task
    Gate {
        /// Task ID to view gate results for
        task_id: String,
    },
    /// Remove the worktree backing a task
    Cleanup {
        /// Task ID to clean up
        task_id: String,
        /// Local path to the repo this task's worktree was created under
        #[arg(long)]
        repo_path: String,
    },
    /// Launch interactive TUI dashboard
    Dashboard,
    /// Read your assigned task (agent mode)
    Task,
    /// Run invariants for your task (agent mode)
    Check,
    /// Report progress (agent mode)
    Progress {
        /// Progress message to report
        message: String,
    },
    /// Signal task completion (agent mode)
    Done,
}

#[derive(Subcommand)]
pub enum TaskCommands {
    /// Register a new task for a repo issue
    New {
        /// Repo in `owner/name` form
        repo: String,
        /// Issue number
        issue_number: i32,
        /// Retry budget for this task
        #[arg(long, default_value_t = 3)]
        max_attempts: i32,
        /// Requested coding harness (e.g. claude-code)
        #[arg(long)]
        harness: Option<String>,
    },
    /// Show one task's full state
    Show {
        /// Task ID to show
        task_id: String,
    },
    /// List tasks, optionally filtered by status
    List {
        /// Filter to one status (e.g. coding, reviewing, failed)
        #[arg(long)]
        status: Option<String>,
    },
}

#[derive(Subcommand)]
pub enum InvariantCommands {
    /// Add a new invariant definition
    Add {
        /// Unique invariant name (e.g. rust_build)
        name: String,
        /// Kind of invariant: test_suite, typecheck, lint, coverage, custom
        #[arg(long)]
        kind: String,
        /// Command to execute (e.g. "cargo")
        #[arg(long)]
        command: String,
        /// Comma-separated arguments (e.g. "build,--workspace")
        #[arg(long)]
        args: Option<String>,
        /// Human-readable description
        #[arg(long)]
        description: Option<String>,
        /// Expected exit code (default: 0)
        #[arg(long, default_value_t = 0)]
        expected_exit_code: i32,
        /// Numeric threshold (e.g. coverage percentage)
        #[arg(long)]
        threshold: Option<f32>,
        /// Scope: global or project (default: project)
        #[arg(long, default_value = "project")]
        scope: String,
    },
    /// List all invariants
    List {
        /// Show full details for each invariant
        #[arg(long)]
        verbose: bool,
    },
    /// Test-run an invariant in the current directory
    Test {
        /// Invariant name to test
        name: String,
    },
    /// Built-in invariant presets by project type
    Presets {
        #[command(subcommand)]
        command: PresetCommands,
    },
}

#[derive(Subcommand)]
pub enum PresetCommands {
    /// List available presets (optionally filtered to one project type)
    List {
        /// Project type to filter to (e.g. rust-cargo); autodetects if omitted
        project_type: Option<String>,
    },
    /// Install presets as invariants (optionally filtered to one project type)
    Install {
        /// Project type to install (e.g. rust-cargo); autodetects if omitted
        project_type: Option<String>,
    },
}

/// Execute the `orc init` command: write config file.
fn cmd_init(db_url: &str, force: bool) -> anyhow::Result<()> {
    let path = config::config_path();

    if path.exists() && !force {
        anyhow::bail!(
            "config file already exists at {}\nUse --force to overwrite.",
            path.display()
        );
    }

    let token_secret = config::generate_token_secret();

    let cfg = config::ConfigFile {
        database: config::DatabaseSection {
            url: db_url.to_string(),
        },
        auth: config::AuthSection {
            token_secret: token_secret.clone(),
        },
    };

    config::save_config(&cfg)?;

    println!("Config written to {}", path.display());
    println!("  database.url = {db_url}");
    println!("  auth.token_secret = {}...{}", &token_secret[..8], &token_secret[56..]);
    println!();
    println!("Next: run `orc db-init` to create and migrate the database.");

    Ok(())
}

/// Execute the `orc db-init` command: create database and run migrations.
async fn cmd_db_init(cli_db_url: Option<&str>) -> anyhow::Result<()> {
    let resolved = GatorConfig::resolve(cli_db_url)?;

    println!("Initializing orc database...");

    // 1. Create the database if it does not exist.
    pool::ensure_database_exists(&resolved.db_config).await?;

    // 2. Connect to the target database.
    let db_pool = pool::create_pool(&resolved.db_config).await?;

    // 3. Run migrations.
    let migrations_path = pool::default_migrations_path();
    pool::run_migrations(&db_pool, migrations_path).await?;

    // 4. Print success with table counts.
    let counts = pool::table_counts(&db_pool).await?;
    println!("Database ready. Tables:");
    for (table, count) in &counts {
        println!("  {table}: {count} rows");
    }

    // 5. Clean shutdown.
    db_pool.close().await;

    println!("orc db-init complete.");
    Ok(())
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .init();

    let cli = Cli::parse();

    // -----------------------------------------------------------------
    // Agent-mode detection: if ORC_AGENT_TOKEN is set, restrict the
    // command surface to the four agent-mode commands.
    // -----------------------------------------------------------------
    if guard::is_agent_mode() {
        // Resolve config for DB URL (best-effort).
        let db_config = GatorConfig::resolve(cli.database_url.as_deref())
            .map(|c| c.db_config)
            .unwrap_or_else(|_| orc_db::config::DbConfig::from_env());

        let pool_result = pool::create_pool(&db_config).await;
        let pool = pool_result.ok();

        let result = agent::run_agent_mode(cli.command, pool.as_ref()).await;

        // Clean shutdown if we have a pool.
        if let Some(p) = pool {
            p.close().await;
        }

        if let Err(e) = result {
            eprintln!("{e:#}");
            std::process::exit(1);
        }
        return Ok(());
    }

    // -----------------------------------------------------------------
    // Operator mode (default): full command surface.
    // -----------------------------------------------------------------
    match cli.command {
        Commands::Init { db_url, force } => {
            cmd_init(&db_url, force)?;
        }
        Commands::DbInit => {
            cmd_db_init(cli.database_url.as_deref()).await?;
        }
        Commands::Tasks { command } => {
            let resolved = GatorConfig::resolve(cli.database_url.as_deref())?;
            let db_pool = pool::create_pool(&resolved.db_config).await?;
            let result = match command {
                TaskCommands::New {
                    repo,
                    issue_number,
                    max_attempts,
                    harness,
                } => task_cmds::run_new(&db_pool, &repo, issue_number, max_attempts, harness.as_deref()).await,
                TaskCommands::Show { task_id } => task_cmds::run_show(&db_pool, &task_id).await,
                TaskCommands::List { status } => task_cmds::run_list(&db_pool, status.as_deref()).await,
            };
            db_pool.close().await;
            result?;
        }
        Commands::Invariant { command } => {
            let resolved = GatorConfig::resolve(cli.database_url.as_deref())?;
            let db_pool = pool::create_pool(&resolved.db_config).await?;
            let result = invariant_cmds::run_invariant_command(command, &db_pool).await;
            db_pool.close().await;
            result?;
        }
        Commands::Tick {
            repo_paths,
            github_token,
            model,
        } => {
            let resolved = GatorConfig::resolve(cli.database_url.as_deref())?;
            let db_pool = pool::create_pool(&resolved.db_config).await?;
            let paths = run_cmds::parse_repo_paths(&repo_paths)?;
            let result = run_cmds::run_tick(&db_pool, paths, github_token.as_deref(), &model).await;
            db_pool.close().await;
            result?;
        }
        Commands::Run {
            repo_paths,
            github_token,
            model,
            max_ticks,
            max_duration_secs,
            tick_interval_secs,
        } => {
            let resolved = GatorConfig::resolve(cli.database_url.as_deref())?;
            let db_pool = pool::create_pool(&resolved.db_config).await?;
            let paths = run_cmds::parse_repo_paths(&repo_paths)?;
            let result = run_cmds::run_bounded(
                &db_pool,
                paths,
                github_token.as_deref(),
                &model,
                max_ticks,
                max_duration_secs,
                tick_interval_secs,
            )
            .await;
            db_pool.close().await;
            result?;
        }
        Commands::Log { task_id, event_type } => {
            let resolved = GatorConfig::resolve(cli.database_url.as_deref())?;
            let db_pool = pool::create_pool(&resolved.db_config).await?;
            let result = log_cmd::run_log(&db_pool, &task_id, event_type.as_deref()).await;
            db_pool.close().await;
            result?;
        }
        Commands::Approve { task_id } => {
            let resolved = GatorConfig::resolve(cli.database_url.as_deref())?;
            let db_pool = pool::create_pool(&resolved.db_config).await?;
            let id = uuid::Uuid::parse_str(&task_id)
                .with_context(|| format!("invalid task ID: {task_id}"))?;
            let result = orc_core::state::dispatch::approve_task(&db_pool, id).await;
            db_pool.close().await;
            result?;
            println!("Task {task_id} approved.");
        }
        Commands::Reject { task_id } => {
            let resolved = GatorConfig::resolve(cli.database_url.as_deref())?;
            let db_pool = pool::create_pool(&resolved.db_config).await?;
            let id = uuid::Uuid::parse_str(&task_id)
                .with_context(|| format!("invalid task ID: {task_id}"))?;
            let result = orc_core::state::dispatch::reject_task(&db_pool, id).await;
            db_pool.close().await;
            result?;
            println!("Task {task_id} rejected.");
        }
        Commands::Retry { task_id } => {
            let resolved = GatorConfig::resolve(cli.database_url.as_deref())?;
            let db_pool = pool::create_pool(&resolved.db_config).await?;
            let id = uuid::Uuid::parse_str(&task_id)
                .with_context(|| format!("invalid task ID: {task_id}"))?;
            let result = orc_core::state::dispatch::operator_retry_task(&db_pool, id).await;
            db_pool.close().await;
            result?;
            println!("Task {task_id} reset to pending for retry.");
        }
        Commands::Gate { task_id } => {
            let resolved = GatorConfig::resolve(cli.database_url.as_deref())?;
            let db_pool = pool::create_pool(&resolved.db_config).await?;
            let result = gate_cmd::run_gate(&db_pool, &task_id).await;
            db_pool.close().await;
            result?;
        }
        Commands::Cleanup { task_id, repo_path } => {
            let resolved = GatorConfig::resolve(cli.database_url.as_deref())?;
            let db_pool = pool::create_pool(&resolved.db_config).await?;
            let result = cleanup_cmd::run_cleanup(&db_pool, &task_id, &repo_path).await;
            db_pool.close().await;
            result?;
        }
        Commands::Dashboard => {
            let resolved = GatorConfig::resolve(cli.database_url.as_deref())?;
            let db_pool = pool::create_pool(&resolved.db_config).await?;
            let result = tui::run_dashboard(db_pool.clone()).await;
            db_pool.close().await;
            result?;
        }
        Commands::Task => {
            println!("orc task: not available in operator mode (set ORC_AGENT_TOKEN)");
        }
        Commands::Check => {
            println!("orc check: not available in operator mode (set ORC_AGENT_TOKEN)");
        }
        Commands::Progress { message } => {
            println!("orc progress: not available in operator mode (set ORC_AGENT_TOKEN)");
            let _ = message;
        }
        Commands::Done => {
            println!("orc done: not available in operator mode (set ORC_AGENT_TOKEN)");
        }
    }

    Ok(())
}

//! Baton CLI — run workflows whose steps execute locally or are delegated
//! to an external agent runtime.

use baton_cli::commands;
use baton_core::workflow::GlobalFlags;
use clap::{Parser, Subcommand};

/// Baton — local/delegated workflow runner
#[derive(Parser)]
#[command(name = "baton", version, about = "Baton — local/delegated workflow runner")]
pub struct Cli {
    /// Path to the engine config file (defaults to ./baton.yaml when present)
    #[arg(long, env = "BATON_CONFIG")]
    config: Option<String>,

    /// Override the state directory holding the run database and worktrees
    #[arg(long, env = "BATON_STATE_DIR")]
    state_dir: Option<String>,

    #[command(subcommand)]
    command: Option<Commands>,
}

#[derive(Subcommand)]
enum Commands {
    /// Run a workflow from a YAML file
    Run {
        /// Path to the workflow YAML file
        file: String,
        /// Delegate every delegation-capable step automatically
        #[arg(long)]
        force_auto: bool,
        /// Run every step that has a local action locally
        #[arg(long = "no-delegate")]
        disable_delegation: bool,
        /// Trigger manual steps without prompting
        #[arg(long, short = 'y')]
        yes: bool,
    },

    /// Validate a workflow file and show the resolved execution modes
    Validate {
        /// Path to the workflow YAML file
        file: String,
        #[arg(long)]
        force_auto: bool,
        #[arg(long = "no-delegate")]
        disable_delegation: bool,
    },

    /// Show the status of a run
    Status {
        /// Run ID
        run_id: String,
        /// Print the full snapshot as JSON
        #[arg(long)]
        json: bool,
    },

    /// List runs
    Runs {
        /// Only runs of this workflow
        #[arg(long)]
        workflow: Option<String>,
        /// Only runs with this status: running, succeeded, failed, cancelled
        #[arg(long)]
        status: Option<String>,
        #[arg(long, default_value_t = 20)]
        limit: usize,
        #[arg(long)]
        json: bool,
    },

    /// Resume an unfinished run from its stored state
    Resume {
        /// Run ID
        run_id: String,
        /// Trigger manual steps without prompting
        #[arg(long, short = 'y')]
        yes: bool,
    },

    /// Cancel a run
    Cancel {
        /// Run ID
        run_id: String,
    },

    /// Inspect and clean up execution contexts
    Worktrees {
        #[command(subcommand)]
        action: WorktreeAction,
    },
}

#[derive(Subcommand)]
enum WorktreeAction {
    /// List released contexts
    List {
        /// Only contexts released at least this many seconds ago
        #[arg(long, default_value_t = 0)]
        stale_secs: u64,
    },
    /// Delete completed and failed contexts past the retention window
    Sweep,
    /// Delete one released context now (including abandoned ones)
    Reclaim {
        /// Context ID (same as the invocation ID)
        id: String,
    },
}

#[tokio::main]
async fn main() {
    let cli = Cli::parse();

    // Initialize tracing
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "baton_core=info,baton_cli=info".into()),
        )
        .with_writer(std::io::stderr)
        .init();

    let config = cli.config.as_deref();
    let state_dir = cli.state_dir.as_deref();

    let result = match cli.command {
        Some(command) => execute(command, config, state_dir).await,

        None => {
            // No subcommand — show help
            use clap::CommandFactory;
            Cli::command().print_help().ok();
            println!();
            Ok(())
        }
    };

    if let Err(e) = result {
        eprintln!("Error: {}", e);
        std::process::exit(1);
    }
}

/// Run one subcommand. Everything except `validate` opens the state directory.
async fn execute(
    command: Commands,
    config: Option<&str>,
    state_dir: Option<&str>,
) -> Result<(), String> {
    let engine = || commands::init_engine(config, state_dir);
    match command {
        Commands::Validate {
            file,
            force_auto,
            disable_delegation,
        } => commands::workflow::validate(
            &file,
            GlobalFlags {
                force_auto,
                disable_delegation,
            },
        ),
        Commands::Run {
            file,
            force_auto,
            disable_delegation,
            yes,
        } => {
            let flags = GlobalFlags {
                force_auto,
                disable_delegation,
            };
            commands::run::run(&engine().await?, &file, flags, yes).await
        }
        Commands::Status { run_id, json } => {
            commands::run::status(&engine().await?, &run_id, json).await
        }
        Commands::Runs {
            workflow,
            status,
            limit,
            json,
        } => commands::run::list(&engine().await?, workflow, status.as_deref(), limit, json).await,
        Commands::Resume { run_id, yes } => commands::run::resume(&engine().await?, &run_id, yes).await,
        Commands::Cancel { run_id } => commands::run::cancel(&engine().await?, &run_id).await,
        Commands::Worktrees { action } => {
            let engine = engine().await?;
            match action {
                WorktreeAction::List { stale_secs } => commands::worktree::list(&engine, stale_secs),
                WorktreeAction::Sweep => commands::worktree::sweep(&engine),
                WorktreeAction::Reclaim { id } => commands::worktree::reclaim(&engine, &id),
            }
        }
    }
}

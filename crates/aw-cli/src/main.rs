mod commands;

use std::path::PathBuf;
use std::process::ExitCode;

use clap::{Parser, Subcommand};
use uuid::Uuid;

use crate::commands::Env;

#[global_allocator]
static GLOBAL: mimalloc::MiMalloc = mimalloc::MiMalloc;

/// auto-wave -- run a task list wave by wave with parallel build agents.
#[derive(Parser)]
#[command(name = "aw", version, about)]
struct Cli {
    /// Config file (default: ~/.auto-wave/config.toml).
    #[arg(long, global = true)]
    config: Option<PathBuf>,

    /// State database, overriding `store.path`.
    #[arg(long, global = true)]
    db: Option<PathBuf>,

    /// Working tree the agents modify, overriding `general.workdir`.
    #[arg(long, global = true)]
    workdir: Option<PathBuf>,

    /// Log as JSON lines.
    #[arg(long, global = true)]
    json_logs: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Plan and execute a task list.
    Run {
        /// Task list id.
        list: Uuid,
        /// Print Prometheus metrics when the run ends.
        #[arg(long)]
        metrics: bool,
    },

    /// Show a run's waves and tasks.
    Status {
        /// Execution run id.
        run: Uuid,
    },

    /// Ask a running orchestrator to stop the run.
    Cancel {
        /// Execution run id.
        run: Uuid,
    },

    /// Continue a run whose orchestrator went away.
    Resume {
        /// Execution run id.
        run: Uuid,
    },

    /// Create a task list from a JSON document.
    Import {
        /// Path to the JSON document.
        file: PathBuf,
    },

    /// List the tasks of a task list.
    Tasks {
        /// Task list id.
        list: Uuid,
    },
}

#[tokio::main]
async fn main() -> ExitCode {
    let cli = Cli::parse();

    let env = match Env::resolve(cli.config, cli.db, cli.workdir) {
        Ok(env) => env,
        Err(e) => {
            eprintln!("error: {e:#}");
            return ExitCode::from(2);
        }
    };
    aw_telemetry::logging::init_from_config("aw", &env.config.telemetry, cli.json_logs);

    let result = match cli.command {
        Commands::Run { list, metrics } => commands::run::run(&env, list, metrics).await,
        Commands::Status { run } => commands::status::run(&env, run).await,
        Commands::Cancel { run } => commands::cancel::run(&env, run).await,
        Commands::Resume { run } => commands::run::resume(&env, run).await,
        Commands::Import { file } => commands::import::run(&env, &file).await,
        Commands::Tasks { list } => commands::tasks::run(&env, list).await,
    };

    match result {
        Ok(code) => code,
        Err(e) => {
            tracing::error!(error = %e, "command failed");
            eprintln!("error: {e:#}");
            ExitCode::from(2)
        }
    }
}

use std::path::PathBuf;

use clap::{Parser, Subcommand};
use swarmdb::output::Format;

#[derive(Parser)]
#[command(
    name = "swarmdb",
    version,
    about = "Coordination store maintenance for multi-agent workflows"
)]
struct Cli {
    /// Output format
    #[arg(long, global = true, value_enum, default_value = "json")]
    format: Format,
    /// Shorthand for --format pretty
    #[arg(long, global = true, hide = true)]
    pretty: bool,
    /// Any path inside the repository (defaults to the current directory)
    #[arg(long, global = true)]
    project: Option<PathBuf>,
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Show the canonical database path for this repository or worktree
    Path,
    /// Compare the database schema against the expected tables
    Validate,
    /// Create missing tables and columns; refuse changes that would drop rows
    Migrate,
    /// List stray databases in historical locations
    Strays,
    /// Merge stray databases into the canonical one
    Consolidate {
        /// Do not ask for confirmation
        #[arg(long, short)]
        yes: bool,
    },
    /// Rebuild projection tables by replaying the event log
    Rebuild,
    /// Show agents, active reservations and locks
    Status {
        /// Project key (defaults to the principal repository root)
        #[arg(long)]
        key: Option<String>,
    },
}

fn run(cli: Cli, format: Format) -> swarmdb::error::Result<()> {
    let project = match cli.project {
        Some(path) => path,
        None => std::env::current_dir()?,
    };

    match cli.command {
        Commands::Path => swarmdb::commands::path::run(&project, format),
        Commands::Validate => swarmdb::commands::validate::run(&project, format),
        Commands::Migrate => swarmdb::commands::migrate::run(&project, format),
        Commands::Strays => swarmdb::commands::strays::run(&project, format),
        Commands::Consolidate { yes } => {
            swarmdb::commands::consolidate::run(&project, yes, format)
        }
        Commands::Rebuild => swarmdb::commands::rebuild::run(&project, format),
        Commands::Status { key } => {
            let key = match key {
                Some(key) => key,
                None => swarmdb::worktree::main_repo_root(&project)?
                    .display()
                    .to_string(),
            };
            swarmdb::commands::status::run(&project, &key, format)
        }
    }
}

fn main() {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::from_default_env()
                .add_directive(tracing::Level::WARN.into()),
        )
        .with_writer(std::io::stderr)
        .init();

    let cli = Cli::parse();
    let format = if cli.pretty {
        Format::Pretty
    } else {
        cli.format
    };
    if let Err(e) = run(cli, format) {
        match format {
            Format::Json => {
                eprintln!(
                    "{}",
                    serde_json::json!({
                        "error": e.code(),
                        "message": e.to_string()
                    })
                );
            }
            Format::Pretty => eprintln!("error: {e}"),
        }
        std::process::exit(1);
    }
}

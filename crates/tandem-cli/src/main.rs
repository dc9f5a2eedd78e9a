mod actor;
mod cmd;
mod output;
mod root;

use clap::{Parser, Subcommand};
use cmd::{
    audit::AuditArgs, commit::CommitArgs, config::ConfigSubcommand, lock::LockSubcommand,
    queue::QueueSubcommand, watch::WatchArgs,
};
use std::path::PathBuf;

#[derive(Parser)]
#[command(
    name = "tandem",
    about = "Exclusive locks and crash-safe auto-commits for binary project files",
    version,
    propagate_version = true
)]
struct Cli {
    /// Repository root (default: auto-detect from .tandem/)
    #[arg(long, global = true, env = "TANDEM_ROOT")]
    root: Option<PathBuf>,

    /// Output as JSON
    #[arg(long, global = true, short = 'j')]
    json: bool,

    /// Identity recorded on locks and audit entries (default: $USER@host)
    #[arg(long, global = true, env = "TANDEM_ACTOR")]
    actor: Option<String>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Initialize tandem state in the repository
    Init {
        /// VCS program to drive (e.g. oxen, git)
        #[arg(long)]
        engine: Option<String>,
    },

    /// Acquire, release, renew, break or inspect the repository lock
    Lock {
        #[command(subcommand)]
        subcommand: LockSubcommand,
    },

    /// Show the audit log
    Audit(AuditArgs),

    /// Record a milestone commit on the working branch
    Commit(CommitArgs),

    /// Inspect and drain the offline queue
    Queue {
        #[command(subcommand)]
        subcommand: QueueSubcommand,
    },

    /// Show or validate the configuration
    Config {
        #[command(subcommand)]
        subcommand: ConfigSubcommand,
    },

    /// Watch the repository and draft-commit settled changes until stopped
    Watch(WatchArgs),
}

fn main() {
    let cli = Cli::parse();

    let default_level = match &cli.command {
        Commands::Watch(_) => tracing::Level::INFO,
        _ => tracing::Level::WARN,
    };

    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::from_default_env().add_directive(default_level.into()),
        )
        .with_target(false)
        .with_writer(std::io::stderr)
        .init();

    let root = root::resolve_root(cli.root.as_deref());
    let actor = cli.actor.unwrap_or_else(actor::default_actor);

    let result = match cli.command {
        Commands::Init { engine } => cmd::init::run(&root, engine.as_deref()),
        Commands::Lock { subcommand } => cmd::lock::run(&root, &actor, subcommand, cli.json),
        Commands::Audit(args) => cmd::audit::run(&root, args, cli.json),
        Commands::Commit(args) => cmd::commit::run(&root, &actor, args, cli.json),
        Commands::Queue { subcommand } => cmd::queue::run(&root, subcommand, cli.json),
        Commands::Config { subcommand } => cmd::config::run(&root, subcommand, cli.json),
        Commands::Watch(args) => cmd::watch::run(&root, &actor, args),
    };

    if let Err(e) = result {
        eprintln!("error: {e:#}");
        std::process::exit(1);
    }
}

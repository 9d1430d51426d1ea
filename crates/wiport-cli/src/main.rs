#![forbid(unsafe_code)]

mod cmd;
mod output;

use clap::{Parser, Subcommand};
use output::OutputMode;
use std::env;
use std::process::ExitCode;
use tracing::info;
use tracing_subscriber::{EnvFilter, fmt, prelude::*};

#[derive(Parser, Debug)]
#[command(
    author,
    version,
    about = "wiport: resumable revision replay into a work tracker",
    long_about = None
)]
struct Cli {
    /// Enable verbose logging.
    #[arg(short, long, global = true)]
    verbose: bool,

    /// Emit JSON output instead of human-readable text.
    #[arg(long, global = true)]
    json: bool,

    /// Only log errors (ignored when WIPORT_LOG is set).
    #[arg(short, long, global = true)]
    quiet: bool,

    #[command(subcommand)]
    command: Commands,
}

impl Cli {
    /// Derive the output mode from flags.
    const fn output_mode(&self) -> OutputMode {
        if self.json {
            OutputMode::Json
        } else {
            OutputMode::Human
        }
    }
}

#[derive(Subcommand, Debug)]
enum Commands {
    #[command(
        next_help_heading = "Replay",
        about = "Replay an export into an in-memory destination",
        long_about = "Replay every revision of an export into an in-memory destination, \
                      journaling progress in SQLite. Rerunning with the same journal skips \
                      revisions that were already replayed.",
        after_help = "EXAMPLES:\n    # Rehearse a migration\n    wiport rehearse --export export.json\n\n    # Use a directory of per-item files and a custom journal\n    wiport rehearse --export ./export --journal run.sqlite3 --workers 8\n\n    # Emit machine-readable output\n    wiport rehearse --export export.json --json"
    )]
    Rehearse(cmd::rehearse::RehearseArgs),

    #[command(
        next_help_heading = "Inspect",
        about = "Show journal progress",
        long_about = "Show how many items, revisions, and attachments a journal has recorded.",
        after_help = "EXAMPLES:\n    # Overall progress\n    wiport journal --journal run.sqlite3\n\n    # Replayed revisions of one item\n    wiport journal --journal run.sqlite3 --origin WI-42\n\n    # Emit machine-readable output\n    wiport journal --json"
    )]
    Journal(cmd::journal::JournalArgs),
}

fn default_filter(quiet: bool) -> &'static str {
    if quiet {
        "error"
    } else if env::var("DEBUG").is_ok() {
        "wiport=debug,info"
    } else {
        "wiport=info,warn"
    }
}

fn init_tracing(quiet: bool) {
    let filter = EnvFilter::try_from_env("WIPORT_LOG")
        .unwrap_or_else(|_| EnvFilter::new(default_filter(quiet)));

    let format = env::var("WIPORT_LOG_FORMAT").unwrap_or_else(|_| "compact".to_string());

    let registry = tracing_subscriber::registry().with(filter);

    match format.as_str() {
        "json" => {
            let layer = fmt::layer().json().with_ansi(false);
            registry.with(layer.with_writer(std::io::stderr)).init();
        }
        _ => {
            let layer = fmt::layer().compact();
            registry.with(layer.with_writer(std::io::stderr)).init();
        }
    }
}

fn main() -> anyhow::Result<ExitCode> {
    let cli = Cli::parse();
    init_tracing(cli.quiet);

    if cli.verbose {
        info!("Verbose mode enabled");
    }

    let output = cli.output_mode();
    let succeeded = match cli.command {
        Commands::Rehearse(ref args) => cmd::rehearse::run_rehearse(args, output)?,
        Commands::Journal(ref args) => cmd::journal::run_journal(args, output)?,
    };

    Ok(if succeeded {
        ExitCode::SUCCESS
    } else {
        ExitCode::FAILURE
    })
}

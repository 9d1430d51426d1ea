//! `wiport rehearse`: replay an export into the in-memory destination.
//!
//! Progress goes to a SQLite journal, so an interrupted rehearsal resumes
//! at the first unjournaled revision of each item.

use std::io::Write;
use std::path::PathBuf;
use std::time::Duration;

use clap::Args;
use tracing::info;

use wiport_core::config::resolve_config;
use wiport_core::destination::memory::InMemoryDestination;
use wiport_core::export::load_export;
use wiport_core::journal::open_journal;
use wiport_core::lock::JournalLock;
use wiport_core::setup::bootstrap;
use wiport_core::{EntityState, RevisionReplayer, RunSummary, run};

use crate::output::{CliError, OutputMode, pretty_kv, pretty_section, render, render_error};

#[derive(Args, Debug)]
pub struct RehearseArgs {
    /// Export file, or directory of per-item JSON files.
    #[arg(long)]
    pub export: PathBuf,

    /// SQLite journal recording replayed revisions.
    #[arg(long, default_value = "wiport-journal.sqlite3")]
    pub journal: PathBuf,

    /// Config file (defaults to the per-user config, then built-in defaults).
    #[arg(long)]
    pub config: Option<PathBuf>,

    /// Override `replay.workers`.
    #[arg(long)]
    pub workers: Option<usize>,

    /// Seconds to wait for another run to release the journal lock.
    #[arg(long, default_value = "5")]
    pub lock_timeout: u64,
}

/// Returns `Ok(false)` when the run was aborted or left items unfinished.
pub fn run_rehearse(args: &RehearseArgs, output: OutputMode) -> anyhow::Result<bool> {
    let mut config = resolve_config(args.config.as_deref())?;
    if let Some(workers) = args.workers {
        config.replay.workers = workers;
    }
    let export = load_export(&args.export)?;

    let _lock = match JournalLock::acquire(&args.journal, Duration::from_secs(args.lock_timeout)) {
        Ok(lock) => lock,
        Err(err) => {
            render_error(output, &CliError::with_code(err.to_string(), err.code()))?;
            return Ok(false);
        }
    };
    let journal = open_journal(&args.journal)?;

    let destination = InMemoryDestination::new().with_project(&config.project);
    let boot = match bootstrap(&destination, &config) {
        Ok(boot) => boot,
        Err(err) => {
            render_error(output, &CliError::with_code(err.to_string(), err.code()))?;
            return Ok(false);
        }
    };
    info!(project = %boot.project.name, "Destination ready.");

    let replayer = RevisionReplayer::new(
        &destination,
        &journal,
        &boot.classifications,
        &boot.links,
        &config,
    );
    let summary = run(
        &replayer,
        export.histories(),
        config.replay.effective_workers(),
    );

    render(output, &summary, render_summary)?;
    let finished = summary.failed() == 0 && summary.not_started() == 0;
    Ok(finished && !summary.aborted)
}

fn render_summary(summary: &RunSummary, w: &mut dyn Write) -> std::io::Result<()> {
    pretty_section(w, "Replay summary")?;
    pretty_kv(w, "Items", summary.items.len().to_string())?;
    pretty_kv(w, "Completed", summary.completed().to_string())?;
    pretty_kv(w, "Failed", summary.failed().to_string())?;
    pretty_kv(w, "Not started", summary.not_started().to_string())?;
    pretty_kv(w, "Incomplete", summary.incomplete_revisions().to_string())?;
    if summary.aborted {
        pretty_kv(w, "Aborted", "yes")?;
    }

    for item in &summary.items {
        if item.state != EntityState::Completed {
            let reason = item.error.as_deref().unwrap_or("not started");
            writeln!(w, "  {} {reason}", item.origin_id)?;
        }
    }
    for item in summary.items.iter().filter(|i| !i.incomplete.is_empty()) {
        let revisions: Vec<String> = item.incomplete.iter().map(u32::to_string).collect();
        writeln!(
            w,
            "  {} incomplete revisions: {}",
            item.origin_id,
            revisions.join(", ")
        )?;
    }
    Ok(())
}

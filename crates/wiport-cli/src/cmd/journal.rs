//! `wiport journal`: inspect replay progress recorded in a journal.

use std::io::Write;
use std::path::PathBuf;
use std::time::Duration;

use anyhow::bail;
use clap::Args;
use serde::Serialize;

use wiport_core::journal::{Journal, JournalProgress, open_journal};
use wiport_core::lock::JournalLock;
use wiport_core::model::WorkItemId;

use crate::output::{CliError, OutputMode, pretty_kv, pretty_section, render, render_error};

#[derive(Args, Debug)]
pub struct JournalArgs {
    /// SQLite journal to inspect.
    #[arg(long, default_value = "wiport-journal.sqlite3")]
    pub journal: PathBuf,

    /// Show the destination id and replayed revisions of one origin item.
    #[arg(long)]
    pub origin: Option<String>,

    /// Seconds to wait while a replay run holds the journal.
    #[arg(long, default_value = "5")]
    pub lock_timeout: u64,
}

#[derive(Debug, Serialize)]
struct OriginReport {
    origin_id: String,
    destination_id: Option<WorkItemId>,
    revisions: Vec<u32>,
}

#[derive(Debug, Serialize)]
struct JournalReport {
    journal: PathBuf,
    progress: JournalProgress,
    #[serde(skip_serializing_if = "Option::is_none")]
    origin: Option<OriginReport>,
}

/// Returns `Ok(false)` when the journal is locked by a running replay.
pub fn run_journal(args: &JournalArgs, output: OutputMode) -> anyhow::Result<bool> {
    if !args.journal.exists() {
        bail!("journal {} does not exist", args.journal.display());
    }

    let timeout = Duration::from_secs(args.lock_timeout);
    let _lock = match JournalLock::acquire_shared(&args.journal, timeout) {
        Ok(lock) => lock,
        Err(err) => {
            render_error(output, &CliError::with_code(err.to_string(), err.code()))?;
            return Ok(false);
        }
    };
    let journal = open_journal(&args.journal)?;

    let origin = match &args.origin {
        Some(origin_id) => Some(OriginReport {
            origin_id: origin_id.clone(),
            destination_id: journal.resolve_destination_id(origin_id)?,
            revisions: journal.processed_revisions(origin_id)?,
        }),
        None => None,
    };
    let report = JournalReport {
        journal: args.journal.clone(),
        progress: journal.progress()?,
        origin,
    };

    render(output, &report, render_report)?;
    Ok(true)
}

fn render_report(report: &JournalReport, w: &mut dyn Write) -> std::io::Result<()> {
    pretty_section(w, &format!("Journal {}", report.journal.display()))?;
    pretty_kv(w, "Items", report.progress.items.to_string())?;
    pretty_kv(w, "Revisions", report.progress.revisions.to_string())?;
    pretty_kv(w, "Attachments", report.progress.attachments.to_string())?;

    if let Some(origin) = &report.origin {
        writeln!(w)?;
        pretty_section(w, &format!("Origin {}", origin.origin_id))?;
        let destination = origin
            .destination_id
            .map_or_else(|| "not migrated".to_string(), |id| id.to_string());
        pretty_kv(w, "Destination", destination)?;

        let revisions = if origin.revisions.is_empty() {
            "none".to_string()
        } else {
            let indexes: Vec<String> = origin.revisions.iter().map(u32::to_string).collect();
            indexes.join(", ")
        };
        pretty_kv(w, "Revisions", revisions)?;
    }
    Ok(())
}

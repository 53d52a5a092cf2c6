//! # Upgrade Commands
//!
//! Clap subcommands a host binary can mount under its own CLI to run and
//! inspect upgrades from a terminal.
//!
//! ```rust,no_run
//! use clap::Parser;
//! use switchy_upgrade::cli::UpgradeCommand;
//!
//! #[derive(Parser)]
//! struct Args {
//!     #[command(subcommand)]
//!     upgrade: UpgradeCommand,
//! }
//! ```
//!
//! Unlike the scheduler path, `update` runs routines inline: a routine that
//! asks for another pass is invoked again right away, up to `--max-passes`.

use std::{io::Write, sync::Arc};

use clap::Subcommand;

use crate::{
    Result, db_version_key,
    handler::{RunState, UpdateHandler},
    installer::{DEFAULT_INSTALLED_VERSION, Installer},
    version::Version,
};

pub const DEFAULT_MAX_PASSES: u32 = 100;

#[derive(Subcommand, Debug, Clone, PartialEq, Eq)]
pub enum UpgradeCommand {
    /// Run every outstanding upgrade routine now
    Update {
        /// Version to upgrade from instead of the stored one
        #[arg(long)]
        from: Option<String>,

        /// Run every routine, including ones that already completed
        #[arg(long)]
        force: bool,

        /// How many times a routine asking for another pass is run
        #[arg(long, default_value_t = DEFAULT_MAX_PASSES, value_parser = clap::value_parser!(u32).range(1..))]
        max_passes: u32,
    },
    /// Show the version marker and outstanding routines
    Status,
    /// Run a single upgrade routine
    Run {
        #[arg(index = 1)]
        method_id: String,
    },
}

/// Summary of a command run.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct CliReport {
    /// Routines the command found to run, in order.
    pub found: Vec<String>,
    /// How many of them completed.
    pub completed: usize,
    /// `(method_id, message)` for every routine that did not complete.
    pub faults: Vec<(String, String)>,
    /// The version marker after the command.
    pub db_version: Option<String>,
}

/// Run `command` against `handler`, writing progress to `out`.
///
/// # Errors
///
/// * If `--from` or the stored marker is malformed
/// * If the store or scheduler fails
/// * If `run` names an unknown routine
/// * If writing to `out` fails
pub async fn execute(
    handler: &Arc<UpdateHandler>,
    command: &UpgradeCommand,
    out: &mut impl Write,
) -> Result<CliReport> {
    match command {
        UpgradeCommand::Update {
            from,
            force,
            max_passes,
        } => update(handler, from.as_deref(), *force, *max_passes, out).await,
        UpgradeCommand::Status => status(handler, out).await,
        UpgradeCommand::Run { method_id } => run(handler, method_id, out).await,
    }
}

async fn marker(handler: &UpdateHandler) -> Result<Option<String>> {
    Ok(handler.db_version().await?.map(|version| version.to_string()))
}

async fn update(
    handler: &UpdateHandler,
    from: Option<&str>,
    force: bool,
    max_passes: u32,
    out: &mut impl Write,
) -> Result<CliReport> {
    let from = match from {
        Some(from) => from.to_string(),
        None if force => Version::SENTINEL.to_string(),
        None => {
            handler
                .store()
                .get_or(&db_version_key(handler.slug()), DEFAULT_INSTALLED_VERSION)
                .await?
        }
    };

    let plan = handler.plan(Some(&from), force).await?;
    let found = plan
        .method_ids()
        .into_iter()
        .map(ToString::to_string)
        .collect::<Vec<_>>();

    if found.is_empty() {
        handler.update_db_version(None).await?;
        let db_version = marker(handler).await?;
        writeln!(
            out,
            "No updates required. Database version is {}",
            db_version.as_deref().unwrap_or(&from)
        )?;
        return Ok(CliReport {
            db_version,
            ..CliReport::default()
        });
    }

    writeln!(out, "Found {} updates ({})", found.len(), found.join(", "))?;

    let mut completed = 0;
    let mut faults = Vec::new();

    for (index, method_id) in found.iter().enumerate() {
        let mut passes = 0;
        let state = loop {
            passes += 1;
            let state = handler.invoke(method_id).await;
            if state != RunState::PendingRetry || passes >= max_passes {
                break state;
            }
        };

        let step = format!("[{}/{}] {method_id}", index + 1, found.len());
        match state {
            RunState::Succeeded => {
                completed += 1;
                writeln!(out, "{step}: done")?;
            }
            RunState::PendingRetry => {
                let message = format!("still unfinished after {passes} passes");
                writeln!(out, "{step}: {message}")?;
                faults.push((method_id.clone(), message));
            }
            RunState::Failed(message) => {
                writeln!(out, "{step}: error: {message}")?;
                faults.push((method_id.clone(), message));
            }
            RunState::Unknown => {
                let message = "not registered".to_string();
                writeln!(out, "{step}: {message}")?;
                faults.push((method_id.clone(), message));
            }
        }
    }

    let db_version = marker(handler).await?;
    writeln!(
        out,
        "{completed} update functions completed. Database version is {}",
        db_version.as_deref().unwrap_or("not set")
    )?;

    Ok(CliReport {
        found,
        completed,
        faults,
        db_version,
    })
}

async fn status(handler: &Arc<UpdateHandler>, out: &mut impl Write) -> Result<CliReport> {
    let db_version = marker(handler).await?;
    let pending = handler
        .get_needed(None, false)
        .await?
        .into_iter()
        .map(|routine| routine.method_id)
        .collect::<Vec<_>>();
    let notice = Installer::new(handler.clone()).notice().await?;

    writeln!(
        out,
        "Database version: {}",
        db_version.as_deref().unwrap_or("not set")
    )?;
    writeln!(out, "Plugin version: {}", handler.config().plugin_version)?;
    writeln!(out, "Schema version: {}", handler.schema_version())?;
    if pending.is_empty() {
        writeln!(out, "Pending updates: none")?;
    } else {
        writeln!(out, "Pending updates: {}", pending.join(", "))?;
    }
    if let Some(notice) = notice {
        writeln!(out, "Notice: {notice}")?;
    }

    Ok(CliReport {
        found: pending,
        db_version,
        ..CliReport::default()
    })
}

async fn run(handler: &UpdateHandler, method_id: &str, out: &mut impl Write) -> Result<CliReport> {
    handler.require(method_id)?;

    let state = handler.invoke(method_id).await;
    let mut report = CliReport {
        found: vec![method_id.to_string()],
        ..CliReport::default()
    };

    match state {
        RunState::Succeeded => {
            report.completed = 1;
            writeln!(out, "{method_id}: done")?;
        }
        RunState::PendingRetry => writeln!(out, "{method_id}: needs another pass")?,
        RunState::Failed(message) => {
            writeln!(out, "{method_id}: error: {message}")?;
            report.faults.push((method_id.to_string(), message));
        }
        RunState::Unknown => writeln!(out, "{method_id}: not registered")?,
    }

    report.db_version = marker(handler).await?;

    Ok(report)
}

//! Command-line surface.

use chrono::NaiveDate;
use clap::{Args, Parser, Subcommand};
use std::io::{BufRead, Write};
use std::path::PathBuf;

use crate::config::{parse_date, PipelineConfig};
use crate::decoder::GenderFilter;
use crate::errors::ConfigError;
use crate::pipeline::SchedulingStrategy;

/// The word a user must type to allow a live correction run.
pub const CONFIRMATION_WORD: &str = "YES";

/// Command-line arguments for enrichflow
#[derive(Parser, Debug)]
#[command(name = "enrichflow")]
#[command(about = "Backfill birth dates, genders and languages for identity records")]
#[command(version)]
pub struct Cli {
    /// TOML configuration file
    #[arg(long, global = true, env = "ENRICHFLOW_CONFIG")]
    pub config: Option<PathBuf>,

    /// Also write logs to this file
    #[arg(long, global = true, env = "ENRICHFLOW_LOG_FILE")]
    pub log_file: Option<PathBuf>,

    /// Emit JSON logs on stdout
    #[arg(long, global = true)]
    pub json_logs: bool,

    /// Command to run
    #[command(subcommand)]
    pub command: Commands,
}

/// Subcommands.
#[derive(Subcommand, Debug, Clone, PartialEq, Eq)]
pub enum Commands {
    /// Predict gender and language from names for records missing either
    Demographics {
        /// Shared run options
        #[command(flatten)]
        run: RunArgs,

        /// Concurrent prediction calls
        #[arg(long)]
        concurrency: Option<usize>,

        /// Admission policy: chunked or sliding
        #[arg(long)]
        strategy: Option<SchedulingStrategy>,
    },

    /// Decode birth dates from identifiers for records missing one
    Birthdates {
        /// Shared run options
        #[command(flatten)]
        run: RunArgs,
    },

    /// Decode and store the birth date of a single record
    BackfillOne {
        /// Master record id
        #[arg(long)]
        id: i64,
    },

    /// Shift implausible birth dates back one century
    CorrectBirthdates {
        /// Dates after this are shifted (YYYY-MM-DD)
        #[arg(long, value_parser = parse_threshold)]
        threshold: Option<NaiveDate>,

        /// Commit the changes instead of rehearsing them
        #[arg(long)]
        commit: bool,

        /// Directory for the audit CSV
        #[arg(long)]
        export_dir: Option<PathBuf>,
    },

    /// Show enrichment coverage
    Report {
        /// Records still missing a birth date to list
        #[arg(long, default_value = "20")]
        sample: usize,
    },

    /// List identifiers matching a mask with '*' wildcards
    MaskSolve {
        /// 13-character mask, e.g. 970420****08*
        #[arg(long)]
        mask: String,

        /// M, F or U
        #[arg(long, default_value = "U")]
        gender: GenderFilter,
    },
}

/// Options shared by the two enrichment pipelines.
#[derive(Args, Debug, Clone, Default, PartialEq, Eq)]
pub struct RunArgs {
    /// Stop after this many records
    #[arg(long)]
    pub max_records: Option<u64>,

    /// Records per page
    #[arg(long)]
    pub page_size: Option<usize>,

    /// Compute writes without applying them
    #[arg(long)]
    pub dry_run: bool,

    /// Ignore the persisted watermark
    #[arg(long)]
    pub from_start: bool,
}

impl RunArgs {
    /// Applies the flags over `config`.
    pub fn apply(&self, config: &mut PipelineConfig) {
        if let Some(max) = self.max_records {
            config.max_records = Some(max);
        }
        if let Some(size) = self.page_size {
            config.page_size = size;
        }
        if self.dry_run {
            config.dry_run = true;
        }
    }
}

fn parse_threshold(value: &str) -> Result<NaiveDate, ConfigError> {
    parse_date("threshold", value)
}

/// Asks for the confirmation word before a live run.
///
/// Returns `Ok(true)` only if the reply, trimmed, is exactly `YES`.
pub fn confirm_live_run<R, W>(input: &mut R, output: &mut W, rows: usize) -> std::io::Result<bool>
where
    R: BufRead,
    W: Write,
{
    writeln!(
        output,
        "About to commit {rows} birth-date corrections. Type {CONFIRMATION_WORD} to continue:"
    )?;
    output.flush()?;

    let mut reply = String::new();
    input.read_line(&mut reply)?;
    Ok(reply.trim() == CONFIRMATION_WORD)
}

//! enrichflow - command-line entry point
//!
//! Loads configuration, installs logging and the interrupt handler, and
//! dispatches to one of the enrichment, correction or reporting commands.

use std::io::{self, Write};
use std::sync::Arc;

use anyhow::{Context, Result};
use clap::Parser;
use tokio::signal;
use tracing::{info, warn};

use enrichflow::cancellation::CancellationToken;
use enrichflow::cli::{confirm_live_run, Cli, Commands, RunArgs};
use enrichflow::config::AppConfig;
use enrichflow::correction::{CorrectionPass, CorrectionReport};
use enrichflow::decoder::{BirthDateDecoder, GenderFilter, IdMask};
use enrichflow::errors::CorrectionError;
use enrichflow::events::{EventSink, LoggingEventSink};
use enrichflow::observability::{init_tracing, LogSettings};
use enrichflow::pipeline::{
    backfill_one, BackfillOutcome, BirthDateEnricher, DemographicEnricher, DriverSettings,
    Enricher, PipelineDriver, RetryPolicy, RunStats, Scheduler,
};
use enrichflow::prediction::OpenAiPredictionClient;
use enrichflow::store::{CorrectionMode, EnrichmentStore, SqliteStore};

#[tokio::main]
async fn main() -> Result<()> {
    dotenv::dotenv().ok();
    let cli = Cli::parse();

    init_tracing(
        &LogSettings::default()
            .with_json(cli.json_logs)
            .with_log_file(cli.log_file.clone()),
    )
    .context("Failed to open log file")?;

    let config = AppConfig::load(cli.config.as_deref()).context("Failed to load configuration")?;

    match cli.command {
        Commands::Demographics {
            run,
            concurrency,
            strategy,
        } => {
            let mut config = config;
            if let Some(concurrency) = concurrency {
                config.pipeline.concurrency = concurrency;
            }
            if let Some(strategy) = strategy {
                config.pipeline.strategy = strategy;
            }
            run.apply(&mut config.pipeline);
            config.pipeline.validate()?;

            let client = OpenAiPredictionClient::from_config(&config.prediction)
                .context("Prediction client unavailable")?;
            let retry = RetryPolicy::from_config(&config.pipeline);
            let scheduler = Scheduler::from_config(&config.pipeline);
            info!(
                model = client.model(),
                concurrency = scheduler.concurrency(),
                strategy = %scheduler.strategy(),
                retry_attempts = retry.max_attempts,
                backoff = ?retry.backoff,
                jitter = ?retry.jitter,
                "Prediction client ready"
            );
            let enricher = DemographicEnricher::new(client, retry, scheduler);
            run_pipeline(&config, &run, enricher).await
        }

        Commands::Birthdates { run } => {
            let mut config = config;
            run.apply(&mut config.pipeline);
            config.pipeline.validate()?;
            let enricher = BirthDateEnricher::new(BirthDateDecoder::for_today());
            run_pipeline(&config, &run, enricher).await
        }

        Commands::BackfillOne { id } => {
            let store = connect(&config).await?;
            let enricher = BirthDateEnricher::new(BirthDateDecoder::for_today());
            match backfill_one(&store, &enricher, id).await? {
                BackfillOutcome::NotFound => println!("No master record with id {id}"),
                BackfillOutcome::Written {
                    birth_date,
                    written: true,
                } => println!("Record {id}: birth date {birth_date} stored"),
                BackfillOutcome::Written {
                    birth_date,
                    written: false,
                } => println!("Record {id}: birth date {birth_date} already stored"),
                BackfillOutcome::Failed(failure) => {
                    println!("Record {id}: {} ({})", failure.message, failure.code);
                }
                BackfillOutcome::Skipped(reason) => println!("Record {id}: skipped, {reason}"),
            }
            Ok(())
        }

        Commands::CorrectBirthdates {
            threshold,
            commit,
            export_dir,
        } => {
            let mut correction = config.correction.clone();
            if let Some(threshold) = threshold {
                correction.threshold = threshold;
            }
            if let Some(dir) = export_dir {
                correction.export_dir = dir;
            }
            let store = Arc::new(connect(&config).await?);
            let pass = CorrectionPass::new(store, &correction)
                .with_event_sink(Arc::new(LoggingEventSink::default()));

            let rehearsal = pass.run(CorrectionMode::Rehearsal).await?;
            print_correction(&rehearsal);
            if !commit || rehearsal.changes.is_empty() {
                return Ok(());
            }

            let confirmed = {
                let stdin = io::stdin();
                let mut input = stdin.lock();
                let mut output = io::stdout();
                confirm_live_run(&mut input, &mut output, rehearsal.changes.len())?
            };
            if !confirmed {
                return Err(CorrectionError::NotConfirmed.into());
            }
            let committed = pass.run(CorrectionMode::Commit).await?;
            print_correction(&committed);
            Ok(())
        }

        Commands::Report { sample } => {
            let store = connect(&config).await?;
            let counts = store.enrichment_counts().await?;
            println!("Total records:                    {}", counts.total_records);
            println!("Missing birth date:               {}", counts.missing_birth_date);
            println!("Missing gender:                   {}", counts.missing_gender);
            println!("Missing language:                 {}", counts.missing_language);
            println!("Missing gender and language:      {}", counts.missing_gender_and_language);

            let missing = store.sample_missing_birth_dates(sample).await?;
            if !missing.is_empty() {
                println!();
                println!("Records missing a birth date (first {}):", missing.len());
                for record in missing {
                    println!(
                        "{:>10}  {} {}  {}",
                        record.id,
                        record.full_name,
                        record.surname,
                        record.raw_identifier.as_deref().unwrap_or("-")
                    );
                }
            }
            Ok(())
        }

        Commands::MaskSolve { mask, gender } => solve_mask(&mask, gender),
    }
}

async fn connect(config: &AppConfig) -> Result<SqliteStore> {
    SqliteStore::connect(&config.database)
        .await
        .context("Failed to connect to store")
}

async fn run_pipeline<E: Enricher>(config: &AppConfig, run: &RunArgs, enricher: E) -> Result<()> {
    let store = Arc::new(connect(config).await?);
    let cancel = Arc::new(CancellationToken::new());
    let trigger = Arc::clone(&cancel);
    tokio::spawn(async move {
        if signal::ctrl_c().await.is_ok() {
            warn!("Interrupt received, stopping at the next page or chunk boundary");
            trigger.cancel("Interrupted");
        }
    });

    let events: Arc<dyn EventSink> = Arc::new(LoggingEventSink::debug());
    let settings = DriverSettings::from_config(&config.pipeline).with_from_start(run.from_start);
    let stats = PipelineDriver::new(store, enricher, settings)
        .with_event_sink(events)
        .run(&cancel)
        .await?;
    print_stats(&stats)
}

fn print_stats(stats: &RunStats) -> Result<()> {
    if stats.has_failures() {
        warn!(
            failed = stats.failed,
            "Some records failed and stay eligible for the next run"
        );
    }
    let summary = serde_json::to_string_pretty(&stats.summary_json())?;
    println!("{summary}");
    Ok(())
}

fn print_correction(report: &CorrectionReport) {
    let label = if report.mode.is_rehearsal() {
        "Rehearsal (rolled back)"
    } else {
        "Committed"
    };
    println!("{label}: {} birth dates above threshold", report.changes.len());
    if let Some(path) = &report.export_path {
        println!("Audit export: {}", path.display());
    }
}

fn solve_mask(mask: &str, gender: GenderFilter) -> Result<()> {
    let mask = IdMask::parse(mask)?;
    let stdout = io::stdout();
    let mut out = stdout.lock();
    let mut found = 0usize;
    for id in mask.solutions(BirthDateDecoder::for_today(), gender) {
        writeln!(out, "{id}")?;
        found += 1;
    }
    info!(found, wildcards = mask.wildcard_count(), %gender, "Mask solved");
    Ok(())
}

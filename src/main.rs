//! # Guideline Synth CLI (`gsynth`)
//!
//! Drives the three pipeline stages (`extract`, `cases`, `reasoning`)
//! through prepare, execute, and merge.
//!
//! ## Usage
//!
//! ```bash
//! gsynth --config ./config/gsynth.toml <command> <stage>
//! ```
//!
//! ## Commands
//!
//! | Command | Description |
//! |---------|-------------|
//! | `gsynth prepare <stage>` | Write the stage's batch manifest |
//! | `gsynth run <stage>` | Send the requests in-process, then merge |
//! | `gsynth merge <stage>` | Merge a downloaded results file into the output tree |
//! | `gsynth status <stage>` | Show manifest, response, and output counts |
//!
//! ## Examples
//!
//! ```bash
//! # Build the extraction manifest from scratch
//! gsynth prepare extract --fresh
//!
//! # Merge results downloaded from the batch service
//! gsynth merge extract --results ./downloads/batch_123.jsonl
//!
//! # Try the first 20 case requests against the live endpoint
//! gsynth run cases --limit 20 --no-merge
//! ```

use clap::{Parser, Subcommand};
use std::path::PathBuf;
use tracing_subscriber::EnvFilter;

use guideline_synth::config;
use guideline_synth::llm::OpenAiCompatProvider;
use guideline_synth::merge::{self, MergeReport};
use guideline_synth::models::Stage;
use guideline_synth::pipeline::{self, PrepareOptions, RunOptions};
use guideline_synth::progress::ProgressMode;
use guideline_synth::status;

/// Guideline Synth CLI: turn clinical guidelines into rules, cases, and
/// reasoning traces with a chat-completion model.
///
/// All commands accept a `--config` flag pointing to a TOML configuration
/// file. See `config/gsynth.example.toml` for a full example.
#[derive(Parser)]
#[command(
    name = "gsynth",
    about = "Guideline Synth: a resumable batch pipeline from clinical guidelines to training data",
    version
)]
struct Cli {
    /// Path to configuration file (TOML).
    #[arg(long, global = true, default_value = "./config/gsynth.toml")]
    config: PathBuf,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Build the stage's requests and append them to its batch manifest.
    ///
    /// Requests already in the manifest are skipped, so this is safe to rerun
    /// after adding input files.
    Prepare {
        #[arg(value_enum)]
        stage: Stage,

        /// Truncate the manifest instead of appending to it.
        #[arg(long)]
        fresh: bool,

        /// Dry run: count requests without writing the manifest.
        #[arg(long)]
        dry_run: bool,
    },

    /// Send the stage's requests to the configured endpoint one at a time.
    ///
    /// Responses are appended to the stage's results file; identities that
    /// already have a response are skipped. Merges afterwards unless
    /// `--no-merge` is given.
    Run {
        #[arg(value_enum)]
        stage: Stage,

        /// Maximum number of requests to send.
        #[arg(long)]
        limit: Option<usize>,

        /// Do not merge after sending.
        #[arg(long)]
        no_merge: bool,

        /// Progress on stderr. Defaults to `human` on a terminal, else `off`.
        #[arg(long, value_enum)]
        progress: Option<ProgressMode>,
    },

    /// Merge a results file into the stage's output tree.
    Merge {
        #[arg(value_enum)]
        stage: Stage,

        /// Results file to merge instead of the configured one.
        #[arg(long)]
        results: Option<PathBuf>,
    },

    /// Show how far along a stage is.
    Status {
        #[arg(value_enum)]
        stage: Stage,
    },
}

fn main() -> anyhow::Result<()> {
    init_tracing();
    let cli = Cli::parse();
    let cfg = config::load_config(&cli.config)?;

    match cli.command {
        Commands::Prepare {
            stage,
            fresh,
            dry_run,
        } => {
            let report = pipeline::prepare(&cfg, stage, PrepareOptions { fresh, dry_run })?;
            let stage_cfg = cfg.stage(stage)?;
            if dry_run {
                println!("prepare {} (dry-run)", stage);
            } else {
                println!("prepare {}", stage);
            }
            println!("  files scanned: {}", report.build.files_scanned);
            println!("  files skipped: {}", report.build.files_skipped);
            println!("  requests: {}", report.build.requests);
            println!("  new: {}", report.new_requests);
            println!("  already in manifest: {}", report.already_present);
            if !report.build.unknown_scenarios.is_empty() {
                println!("  unknown scenario labels: {}", report.build.unknown_scenarios.len());
            }
            println!("  manifest: {}", stage_cfg.manifest.display());
            println!("ok");
        }
        Commands::Run {
            stage,
            limit,
            no_merge,
            progress,
        } => {
            let provider = OpenAiCompatProvider::new(&cfg.llm)?;
            let reporter = progress.unwrap_or_else(ProgressMode::default_for_tty).reporter();
            let options = RunOptions {
                limit,
                merge: !no_merge,
            };
            let report = pipeline::run(&cfg, stage, &provider, options, reporter.as_ref())?;
            println!("run {}", stage);
            println!("  requests: {}", report.build.requests);
            println!("  already done: {}", report.direct.already_done);
            println!("  sent: {}", report.direct.attempted);
            println!("  succeeded: {}", report.direct.succeeded);
            println!("  failed: {}", report.direct.failed);
            if let Some(merge) = &report.merge {
                print_merge(merge);
            }
            println!("ok");
        }
        Commands::Merge { stage, results } => {
            let report = merge::run_merge(&cfg, stage, results.as_deref())?;
            println!("merge {}", stage);
            print_merge(&report);
            println!("  error log: {}", cfg.stage(stage)?.error_log.display());
            println!("ok");
        }
        Commands::Status { stage } => {
            status::run_status(&cfg, stage)?;
        }
    }

    Ok(())
}

fn print_merge(report: &MergeReport) {
    println!("  merged: {}", report.succeeded);
    println!("  failed: {}", report.failed);
    for (kind, count) in &report.failures {
        println!("    {}: {}", kind, count);
    }
    println!("  files written: {}", report.files_written);
    println!("  records written: {}", report.records_written);
}

fn init_tracing() {
    let env_filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));

    tracing_subscriber::fmt()
        .with_env_filter(env_filter)
        .with_target(false)
        .with_writer(std::io::stderr)
        .init();
}

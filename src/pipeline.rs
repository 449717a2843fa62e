//! Stage orchestration.
//!
//! Every stage runs the same three steps; only the record shapes differ:
//!
//! ```text
//! prepare:  input tree ──build_requests──▶ manifest (JSONL)
//! execute:  manifest ──batch service or `run`──▶ results (JSONL)
//! merge:    results + input tree ──merge──▶ output tree + error log
//! ```
//!
//! The output tree of one stage is the input tree of the next. Because
//! every step is driven by files, a stage can be stopped and resumed at
//! any point.

use anyhow::Result;

use crate::config::Config;
use crate::direct::{run_direct, DirectOptions, DirectReport};
use crate::llm::CompletionProvider;
use crate::manifest::{build_requests, pending_requests, write_manifest, BuildReport, ManifestSummary};
use crate::merge::{run_merge, MergeReport};
use crate::models::Stage;
use crate::progress::{StageProgressEvent, StageProgressReporter};

#[derive(Debug, Clone, Copy, Default)]
pub struct PrepareOptions {
    /// Discard the existing manifest instead of appending to it.
    pub fresh: bool,
    /// Report what would be written without touching the manifest.
    pub dry_run: bool,
}

#[derive(Debug, Clone, Default)]
pub struct PrepareReport {
    pub build: BuildReport,
    /// New requests (written, or that would be written on a dry run).
    pub new_requests: usize,
    pub already_present: usize,
}

/// Build the stage's requests and write them to its manifest.
pub fn prepare(config: &Config, stage: Stage, options: PrepareOptions) -> Result<PrepareReport> {
    let stage_cfg = config.stage(stage)?;
    let (requests, build) = build_requests(config, stage)?;

    let (new_requests, already_present) = if options.dry_run {
        let pending = if options.fresh {
            requests.len()
        } else {
            pending_requests(&stage_cfg.manifest, &requests)?.len()
        };
        (pending, requests.len() - pending)
    } else {
        let ManifestSummary {
            written,
            already_present,
        } = write_manifest(&stage_cfg.manifest, &requests, options.fresh)?;
        (written, already_present)
    };

    tracing::info!(
        stage = %stage,
        files = build.files_scanned,
        requests = build.requests,
        new = new_requests,
        dry_run = options.dry_run,
        "prepared manifest"
    );

    Ok(PrepareReport {
        build,
        new_requests,
        already_present,
    })
}

#[derive(Debug, Clone, Copy, Default)]
pub struct RunOptions {
    pub limit: Option<usize>,
    /// Merge the results file once all requests have been sent.
    pub merge: bool,
}

#[derive(Debug, Clone, Default)]
pub struct RunReport {
    pub build: BuildReport,
    pub direct: DirectReport,
    pub merge: Option<MergeReport>,
}

/// Run a stage in-process against `provider`, then optionally merge.
pub fn run(
    config: &Config,
    stage: Stage,
    provider: &dyn CompletionProvider,
    options: RunOptions,
    progress: &dyn StageProgressReporter,
) -> Result<RunReport> {
    let stage_cfg = config.stage(stage)?;

    progress.report(StageProgressEvent::Preparing { stage });
    let (requests, build) = build_requests(config, stage)?;

    let direct_options = DirectOptions {
        policy: config.llm.retry_policy(),
        rate_limit: config.llm.rate_limit(),
        limit: options.limit,
    };
    let direct = run_direct(
        stage,
        provider,
        &requests,
        &stage_cfg.results,
        &direct_options,
        progress,
    )?;

    let merge = if options.merge {
        Some(run_merge(config, stage, None)?)
    } else {
        None
    };

    Ok(RunReport {
        build,
        direct,
        merge,
    })
}

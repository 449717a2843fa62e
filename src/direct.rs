//! In-process runner: send a stage's requests one at a time.
//!
//! An alternative to uploading the manifest to a batch service. Each
//! successful response is appended to the stage's results file as a
//! batch-format [`ResultLine`], so the same merge step consumes both.
//!
//! Runs are resumable. Identities that already have a usable response in
//! the results file are skipped. A reply with no payload of the stage's
//! shape is not usable and is sent again. Failed calls are only logged,
//! never written, so they are retried next time.

use anyhow::Result;
use std::collections::BTreeSet;
use std::io::Write;
use std::path::Path;
use std::time::Duration;

use crate::llm::CompletionProvider;
use crate::models::{BatchRequest, ResultLine, Stage};
use crate::progress::{StageProgressEvent, StageProgressReporter};
use crate::retry::RetryPolicy;
use crate::store;

#[derive(Debug, Clone)]
pub struct DirectOptions {
    pub policy: RetryPolicy,
    /// Pause between consecutive requests.
    pub rate_limit: Duration,
    /// Send at most this many pending requests.
    pub limit: Option<usize>,
}

#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct DirectReport {
    /// Requests skipped because a usable response already exists.
    pub already_done: usize,
    pub attempted: usize,
    pub succeeded: usize,
    pub failed: usize,
}

/// Send every pending request in `requests` and append the responses to
/// `results_path`.
pub fn run_direct(
    stage: Stage,
    provider: &dyn CompletionProvider,
    requests: &[BatchRequest],
    results_path: &Path,
    options: &DirectOptions,
    progress: &dyn StageProgressReporter,
) -> Result<DirectReport> {
    let done: BTreeSet<String> = store::completed_ids(results_path, stage)?.ids;

    let mut pending: Vec<&BatchRequest> = requests
        .iter()
        .filter(|r| !done.contains(&r.custom_id))
        .collect();
    let mut report = DirectReport {
        already_done: requests.len() - pending.len(),
        ..Default::default()
    };
    if let Some(limit) = options.limit {
        pending.truncate(limit);
    }

    tracing::info!(
        stage = %stage,
        model = provider.model_name(),
        pending = pending.len(),
        already_done = report.already_done,
        "starting in-process run"
    );

    let mut out = store::open_jsonl(results_path, false)?;
    let total = pending.len() as u64;

    for (i, req) in pending.iter().enumerate() {
        if i > 0 && !options.rate_limit.is_zero() {
            std::thread::sleep(options.rate_limit);
        }

        progress.report(StageProgressEvent::Calling {
            stage,
            custom_id: req.custom_id.clone(),
            n: i as u64 + 1,
            total,
        });

        report.attempted += 1;
        match options.policy.run(|_| provider.complete(&req.body)) {
            Ok(content) => {
                store::append_jsonl(&mut out, &ResultLine::success(&req.custom_id, content))?;
                out.flush()?;
                report.succeeded += 1;
            }
            Err(e) => {
                tracing::error!(custom_id = %req.custom_id, error = %e, "request failed");
                report.failed += 1;
            }
        }
    }

    Ok(report)
}

//! Per-stage progress overview.
//!
//! Answers "how far along is this stage?" from the files alone: inputs
//! found, requests in the manifest, responses collected, and output written.
//! Used by `gsynth status` before deciding whether to rerun or merge.

use anyhow::Result;
use serde_json::Value;

use crate::config::Config;
use crate::models::Stage;
use crate::scan::{scan_dir, scan_stage_inputs};
use crate::store;

#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct StageStatus {
    pub input_files: usize,
    pub manifest_requests: usize,
    /// Manifest identities with a usable response.
    pub completed: usize,
    /// Usable responses for identities not in the manifest.
    pub orphaned: usize,
    /// Result lines carrying a usable response.
    pub result_ok: usize,
    /// Result lines with an upstream error or no usable payload.
    pub result_errors: usize,
    pub output_files: usize,
    pub output_records: usize,
}

impl StageStatus {
    pub fn remaining(&self) -> usize {
        self.manifest_requests.saturating_sub(self.completed)
    }
}

/// Collect the status of `stage`. Missing directories and files count as empty.
pub fn stage_status(config: &Config, stage: Stage) -> Result<StageStatus> {
    let stage_cfg = config.stage(stage)?;
    let mut status = StageStatus::default();

    if stage_cfg.input_root.is_dir() {
        status.input_files = scan_stage_inputs(stage_cfg)?.len();
    }

    let manifest = store::manifest_ids(&stage_cfg.manifest)?.ids;
    let results = store::completed_ids(&stage_cfg.results, stage)?;
    status.result_ok = results.matched;
    status.result_errors = results.lines - results.matched + results.undecodable;
    let done = results.ids;
    status.manifest_requests = manifest.len();
    status.completed = done.iter().filter(|id| manifest.contains(*id)).count();
    status.orphaned = done.len() - status.completed;

    if stage_cfg.output_root.is_dir() {
        let ext = stage_cfg.output_extension.trim_start_matches('.');
        let outputs = scan_dir(&stage_cfg.output_root, &[format!("**/*.{}", ext)], &[])?;
        status.output_files = outputs.len();
        for file in &outputs {
            match store::load_records::<Value>(&file.absolute_path) {
                Ok(records) => status.output_records += records.len(),
                Err(e) => tracing::warn!(file = %file.relative_path, error = %e, "unreadable output"),
            }
        }
    }

    Ok(status)
}

/// Run the status command and print a summary.
pub fn run_status(config: &Config, stage: Stage) -> Result<()> {
    let status = stage_status(config, stage)?;
    let stage_cfg = config.stage(stage)?;

    println!("stage {}", stage);
    println!("  input root:     {}", stage_cfg.input_root.display());
    println!("  input files:    {}", status.input_files);
    println!(
        "  requests:       {} ({})",
        status.manifest_requests,
        stage_cfg.manifest.display()
    );
    println!(
        "  completed:      {} / {} ({}%)",
        status.completed,
        status.manifest_requests,
        if status.manifest_requests > 0 {
            status.completed * 100 / status.manifest_requests
        } else {
            0
        }
    );
    println!("  remaining:      {}", status.remaining());
    println!(
        "  result lines:   {} ok, {} errored ({})",
        status.result_ok,
        status.result_errors,
        stage_cfg.results.display()
    );
    if status.orphaned > 0 {
        println!("  not in manifest: {}", status.orphaned);
    }
    println!(
        "  output:         {} files, {} records ({})",
        status.output_files,
        status.output_records,
        stage_cfg.output_root.display()
    );
    println!("ok");
    Ok(())
}

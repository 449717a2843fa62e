//! Batch manifest construction.
//!
//! Turns a stage's input tree into one [`BatchRequest`] per unit of work:
//!
//! | Stage       | Input file              | One request per        |
//! |-------------|-------------------------|------------------------|
//! | `extract`   | guideline document      | heading-aligned chunk  |
//! | `cases`     | JSON list of rules      | rule                   |
//! | `reasoning` | JSON list of cases      | case                   |
//!
//! Every request carries `custom_id = "<relative path>|<index>"`, which is
//! the only thing the merge step needs to put the response back.
//!
//! Writing is resumable: identities already present in the manifest are
//! skipped, so preparing twice never duplicates a request. An identity is a
//! position in the input file, so if the request stored under an identity no
//! longer matches the one built from the current inputs, the manifest is
//! stale and is refused until it is rebuilt with `--fresh`.

use anyhow::{bail, Context, Result};
use std::collections::{BTreeMap, BTreeSet};
use std::fs::File;
use std::io::BufReader;
use std::path::Path;

use crate::chunk::split_document;
use crate::config::{Config, StageConfig};
use crate::identity::Identity;
use crate::models::{BatchRequest, CaseRecord, Chunk, ChatMessage, ChatRequest, Rule, Stage};
use crate::prompt;
use crate::scan::{scan_stage_inputs, SourceFile};
use crate::store;

/// Endpoint path recorded in every manifest line.
pub const COMPLETIONS_URL: &str = "/v1/chat/completions";

/// What happened while building requests for a stage.
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct BuildReport {
    pub files_scanned: usize,
    /// Unreadable, malformed, or empty inputs.
    pub files_skipped: usize,
    pub requests: usize,
    /// `"<label> | <file>"` for every case whose scenario label was unknown.
    pub unknown_scenarios: BTreeSet<String>,
}

/// Build every request for `stage`, in path order then index order.
pub fn build_requests(config: &Config, stage: Stage) -> Result<(Vec<BatchRequest>, BuildReport)> {
    let stage_cfg = config.stage(stage)?;
    let model = config.model_for(stage_cfg);
    let files = scan_stage_inputs(stage_cfg)?;

    let mut report = BuildReport {
        files_scanned: files.len(),
        ..Default::default()
    };
    let mut requests = Vec::new();

    for file in &files {
        let built = match stage {
            Stage::Extract => extract_requests(config, stage_cfg, &model, file),
            Stage::Cases => case_requests(stage_cfg, &model, file),
            Stage::Reasoning => reasoning_requests(stage_cfg, &model, file, &mut report),
        };

        match built {
            Ok(file_requests) if !file_requests.is_empty() => requests.extend(file_requests),
            Ok(_) => {
                tracing::warn!(file = %file.relative_path, "no work units, skipping");
                report.files_skipped += 1;
            }
            Err(e) => {
                tracing::warn!(file = %file.relative_path, error = %e, "skipping unreadable input");
                report.files_skipped += 1;
            }
        }
    }

    for label in &report.unknown_scenarios {
        tracing::warn!(scenario = %label, "unknown scenario label, treated as general diagnosis");
    }

    report.requests = requests.len();
    Ok((requests, report))
}

fn extract_requests(
    config: &Config,
    stage: &StageConfig,
    model: &str,
    file: &SourceFile,
) -> Result<Vec<BatchRequest>> {
    let chunks = document_chunks(config, file)?;
    let total = chunks.len();
    let title = file.stem();

    chunks
        .iter()
        .map(|chunk| {
            let id = Identity::new(&file.relative_path, chunk.index)?;
            let messages = prompt::extraction_messages(&title, &chunk.text, chunk.index + 1, total);
            Ok(request(&id, model, stage, messages))
        })
        .collect()
}

/// Read and chunk one guideline document. Whitespace-only documents have
/// no chunks.
pub fn document_chunks(config: &Config, file: &SourceFile) -> Result<Vec<Chunk>> {
    let text = std::fs::read_to_string(&file.absolute_path)?;
    if text.trim().is_empty() {
        return Ok(Vec::new());
    }
    Ok(split_document(&file.relative_path, &text, config.chunking.max_chars))
}

fn case_requests(stage: &StageConfig, model: &str, file: &SourceFile) -> Result<Vec<BatchRequest>> {
    let rules: Vec<Rule> = store::load_records(&file.absolute_path)?;
    let topic = file.stem();

    rules
        .iter()
        .enumerate()
        .map(|(i, rule)| {
            let id = Identity::new(&file.relative_path, i)?;
            Ok(request(&id, model, stage, prompt::case_messages(&topic, rule)))
        })
        .collect()
}

fn reasoning_requests(
    stage: &StageConfig,
    model: &str,
    file: &SourceFile,
    report: &mut BuildReport,
) -> Result<Vec<BatchRequest>> {
    let cases: Vec<CaseRecord> = store::load_records(&file.absolute_path)?;

    cases
        .iter()
        .enumerate()
        .map(|(i, case)| {
            let id = Identity::new(&file.relative_path, i)?;
            let (messages, unknown) = prompt::reasoning_messages(case);
            if unknown {
                report
                    .unknown_scenarios
                    .insert(format!("{} | {}", case.scenario_type, file.file_name()));
            }
            Ok(request(&id, model, stage, messages))
        })
        .collect()
}

fn request(id: &Identity, model: &str, stage: &StageConfig, messages: Vec<ChatMessage>) -> BatchRequest {
    BatchRequest {
        custom_id: id.to_string(),
        method: "POST".to_string(),
        url: COMPLETIONS_URL.to_string(),
        body: ChatRequest {
            model: model.to_string(),
            messages,
            max_tokens: stage.max_tokens,
            temperature: stage.temperature,
            top_p: stage.top_p,
        },
    }
}

/// Result of writing a manifest.
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct ManifestSummary {
    pub written: usize,
    pub already_present: usize,
}

/// Append `requests` to the manifest at `path`, skipping identities it
/// already holds. `fresh` truncates the manifest first.
pub fn write_manifest(path: &Path, requests: &[BatchRequest], fresh: bool) -> Result<ManifestSummary> {
    let existing = if fresh {
        BTreeSet::new()
    } else {
        existing_ids(path, requests)?
    };

    let mut summary = ManifestSummary::default();
    let mut out = store::open_jsonl(path, fresh)?;
    let mut seen = BTreeSet::new();

    for req in requests {
        if existing.contains(&req.custom_id) || !seen.insert(req.custom_id.as_str()) {
            summary.already_present += 1;
            continue;
        }
        store::append_jsonl(&mut out, req)?;
        summary.written += 1;
    }

    std::io::Write::flush(&mut out)?;
    Ok(summary)
}

/// Requests not yet present in the manifest at `path`, without writing.
pub fn pending_requests<'a>(path: &Path, requests: &'a [BatchRequest]) -> Result<Vec<&'a BatchRequest>> {
    let existing = existing_ids(path, requests)?;
    Ok(requests
        .iter()
        .filter(|r| !existing.contains(&r.custom_id))
        .collect())
}

/// Identities already in the manifest. Fails if any stored request differs
/// from the one rebuilt for the same identity.
fn existing_ids(path: &Path, requests: &[BatchRequest]) -> Result<BTreeSet<String>> {
    let stored = stored_requests(path)?;
    let stale: Vec<&str> = requests
        .iter()
        .filter(|r| stored.get(&r.custom_id).is_some_and(|s| s.body != r.body))
        .map(|r| r.custom_id.as_str())
        .collect();

    if let Some(first) = stale.first() {
        for id in &stale {
            tracing::warn!(custom_id = %id, "manifest request no longer matches its input");
        }
        bail!(
            "{} request(s) in {} no longer match the inputs (first: {}); \
             rerun prepare with --fresh and discard results collected for the old manifest",
            stale.len(),
            path.display(),
            first
        );
    }

    Ok(store::manifest_ids(path)?.ids)
}

/// Decodable requests of the manifest at `path`, by identity. The first
/// line for an identity wins.
fn stored_requests(path: &Path) -> Result<BTreeMap<String, BatchRequest>> {
    let mut stored = BTreeMap::new();
    if !path.exists() {
        return Ok(stored);
    }

    let file = File::open(path).with_context(|| format!("Failed to open {}", path.display()))?;
    for line in store::jsonl_lines(BufReader::new(file)) {
        let (_, text) = line?;
        let Ok(text) = text else { continue };
        if let Ok(req) = serde_json::from_str::<BatchRequest>(&text) {
            stored.entry(req.custom_id.clone()).or_insert(req);
        }
    }
    Ok(stored)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::parse_config;
    use std::fs;
    use tempfile::TempDir;

    fn config_for(tmp: &TempDir, stage: &str, max_chars: usize) -> Config {
        let root = tmp.path().display().to_string().replace('\\', "/");
        parse_config(&format!(
            r#"
[llm]
model = "test-model"

[chunking]
max_chars = {max_chars}

[stages.{stage}]
input_root = "{root}/in"
output_root = "{root}/out"
manifest = "{root}/batch/input.jsonl"
"#
        ))
        .unwrap()
    }

    #[test]
    fn test_extract_ids_follow_chunks() {
        let tmp = TempDir::new().unwrap();
        fs::create_dir_all(tmp.path().join("in")).unwrap();
        fs::write(
            tmp.path().join("in/A.md"),
            format!("# One\n{}\n# Two\n{}\n", "x".repeat(40), "y".repeat(40)),
        )
        .unwrap();
        fs::write(tmp.path().join("in/B.md"), "# Only\nshort\n").unwrap();

        let cfg = config_for(&tmp, "extract", 60);
        let (requests, report) = build_requests(&cfg, Stage::Extract).unwrap();
        let ids: Vec<_> = requests.iter().map(|r| r.custom_id.as_str()).collect();
        assert_eq!(ids, vec!["A.md|0", "A.md|1", "B.md|0"]);
        assert_eq!(report.files_scanned, 2);

        let body = &requests[0].body;
        assert_eq!(body.model, "test-model");
        assert_eq!(body.max_tokens, 8192);
        assert_eq!(body.top_p, Some(0.95));
        assert!(body.messages[1].content.contains("part 1/2"));
        assert!(requests[2].body.messages[1].content.contains("\"B\""));
        assert_eq!(requests[0].url, COMPLETIONS_URL);
    }

    #[test]
    fn test_empty_document_is_skipped() {
        let tmp = TempDir::new().unwrap();
        fs::create_dir_all(tmp.path().join("in")).unwrap();
        fs::write(tmp.path().join("in/empty.md"), "  \n\n").unwrap();

        let cfg = config_for(&tmp, "extract", 100);
        let (requests, report) = build_requests(&cfg, Stage::Extract).unwrap();
        assert!(requests.is_empty());
        assert_eq!(report.files_skipped, 1);
    }

    #[test]
    fn test_malformed_rule_file_skipped_whole() {
        let tmp = TempDir::new().unwrap();
        fs::create_dir_all(tmp.path().join("in/sub")).unwrap();
        fs::write(
            tmp.path().join("in/sub/good.json"),
            r#"[{"condition":"c1","action":"a1"},{"condition":"c2","action":"a2"}]"#,
        )
        .unwrap();
        fs::write(tmp.path().join("in/bad.json"), "[{\"condition\":").unwrap();

        let cfg = config_for(&tmp, "cases", 100);
        let (requests, report) = build_requests(&cfg, Stage::Cases).unwrap();
        let ids: Vec<_> = requests.iter().map(|r| r.custom_id.as_str()).collect();
        assert_eq!(ids, vec!["sub/good.json|0", "sub/good.json|1"]);
        assert_eq!(report.files_skipped, 1);
        assert_eq!(requests[0].body.max_tokens, 2048);
        assert_eq!(requests[0].body.top_p, None);
    }

    #[test]
    fn test_reasoning_reports_unknown_labels() {
        let tmp = TempDir::new().unwrap();
        fs::create_dir_all(tmp.path().join("in")).unwrap();
        fs::write(
            tmp.path().join("in/g.json"),
            r#"[
  {"id":0,"file_name":"g.json","scenario_type":"场景A","case_input":"x",
   "reference_rule":{"condition":"c","action":"a","evidence":"e"}},
  {"id":1,"file_name":"g.json","scenario_type":"Bogus","case_input":"y",
   "reference_rule":{"condition":"c","action":"a","evidence":"e"}}
]"#,
        )
        .unwrap();

        let cfg = config_for(&tmp, "reasoning", 100);
        let (requests, report) = build_requests(&cfg, Stage::Reasoning).unwrap();
        assert_eq!(requests.len(), 2);
        assert_eq!(
            report.unknown_scenarios.into_iter().collect::<Vec<_>>(),
            vec!["Bogus | g.json".to_string()]
        );
    }

    #[test]
    fn test_write_manifest_resumes() {
        let tmp = TempDir::new().unwrap();
        fs::create_dir_all(tmp.path().join("in")).unwrap();
        fs::write(tmp.path().join("in/r.json"), r#"[{"condition":"c","action":"a"}]"#).unwrap();
        let cfg = config_for(&tmp, "cases", 100);
        let manifest = cfg.stage(Stage::Cases).unwrap().manifest.clone();

        let (requests, _) = build_requests(&cfg, Stage::Cases).unwrap();
        let first = write_manifest(&manifest, &requests, false).unwrap();
        assert_eq!(first.written, 1);

        let second = write_manifest(&manifest, &requests, false).unwrap();
        assert_eq!(second.written, 0);
        assert_eq!(second.already_present, 1);
        assert_eq!(fs::read_to_string(&manifest).unwrap().lines().count(), 1);

        fs::write(
            tmp.path().join("in/s.json"),
            r#"[{"condition":"c","action":"a"}]"#,
        )
        .unwrap();
        let (requests, _) = build_requests(&cfg, Stage::Cases).unwrap();
        assert_eq!(pending_requests(&manifest, &requests).unwrap().len(), 1);
        let third = write_manifest(&manifest, &requests, false).unwrap();
        assert_eq!(third.written, 1);

        let fresh = write_manifest(&manifest, &requests, true).unwrap();
        assert_eq!(fresh.written, 2);
        assert_eq!(fs::read_to_string(&manifest).unwrap().lines().count(), 2);
    }

    #[test]
    fn test_shifted_inputs_make_manifest_stale() {
        let tmp = TempDir::new().unwrap();
        fs::create_dir_all(tmp.path().join("in")).unwrap();
        let rules = tmp.path().join("in/A.json");
        fs::write(&rules, r#"[{"condition":"beta","action":"b"}]"#).unwrap();
        let cfg = config_for(&tmp, "cases", 100);
        let manifest = cfg.stage(Stage::Cases).unwrap().manifest.clone();

        let (requests, _) = build_requests(&cfg, Stage::Cases).unwrap();
        write_manifest(&manifest, &requests, false).unwrap();

        // a rule merged in late lands at index 0 and shifts the old one
        fs::write(
            &rules,
            r#"[{"condition":"alpha","action":"a"},{"condition":"beta","action":"b"}]"#,
        )
        .unwrap();
        let (requests, _) = build_requests(&cfg, Stage::Cases).unwrap();

        let err = write_manifest(&manifest, &requests, false).unwrap_err();
        assert!(err.to_string().contains("A.json|0"), "{}", err);
        assert!(err.to_string().contains("--fresh"), "{}", err);
        assert!(pending_requests(&manifest, &requests).is_err());
        assert_eq!(fs::read_to_string(&manifest).unwrap().lines().count(), 1);

        let rebuilt = write_manifest(&manifest, &requests, true).unwrap();
        assert_eq!(rebuilt.written, 2);
        assert_eq!(write_manifest(&manifest, &requests, false).unwrap().written, 0);
    }

    #[test]
    fn test_append_to_manifest_without_trailing_newline() {
        let tmp = TempDir::new().unwrap();
        fs::create_dir_all(tmp.path().join("in")).unwrap();
        fs::write(tmp.path().join("in/r.json"), r#"[{"condition":"c","action":"a"}]"#).unwrap();
        let cfg = config_for(&tmp, "cases", 100);
        let manifest = cfg.stage(Stage::Cases).unwrap().manifest.clone();

        let (requests, _) = build_requests(&cfg, Stage::Cases).unwrap();
        write_manifest(&manifest, &requests, false).unwrap();
        let trimmed = fs::read_to_string(&manifest).unwrap().trim_end().to_string();
        fs::write(&manifest, trimmed).unwrap();

        fs::write(tmp.path().join("in/s.json"), r#"[{"condition":"d","action":"b"}]"#).unwrap();
        let (requests, _) = build_requests(&cfg, Stage::Cases).unwrap();
        assert_eq!(write_manifest(&manifest, &requests, false).unwrap().written, 1);

        let scan = store::manifest_ids(&manifest).unwrap();
        assert_eq!(scan.undecodable, 0);
        assert_eq!(
            scan.ids.into_iter().collect::<Vec<_>>(),
            vec!["r.json|0", "s.json|0"]
        );
    }
}

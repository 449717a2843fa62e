//! Result merging: route each batch response back to its source record.
//!
//! For every result line the merge:
//!
//! 1. decodes the line and parses its `custom_id` into an [`Identity`];
//! 2. rejects it if the service reported an error;
//! 3. pulls a JSON payload out of the message content with
//!    [`extract_json`];
//! 4. looks up the source record at `identity.index` in the stage's input
//!    file;
//! 5. joins source and payload into the stage's output record(s).
//!
//! Any failure in steps 1–5 becomes a [`RecordError`]: it is logged, counted
//! under its [`ErrorKind`], and the merge moves on. Only a missing results
//! file, a missing input root, or an unwritable output aborts.
//!
//! Output is grouped per source file and ordered by source index, so a file
//! merged twice from the same inputs is byte-identical.

use anyhow::{bail, Context, Result};
use serde::Serialize;
use serde_json::Value;
use std::collections::BTreeMap;
use std::fs::File;
use std::io::{BufRead, BufReader};
use std::path::Path;

use crate::config::{Config, StageConfig};
use crate::error::{ErrorKind, ErrorLog, RecordError};
use crate::extract::extract_json;
use crate::identity::Identity;
use crate::manifest::document_chunks;
use crate::models::{CaseRecord, Chunk, ReasoningRecord, ResultLine, Rule, Stage};
use crate::scan::{file_name, output_path, scan_stage_inputs};
use crate::store;

/// Counts from one merge run.
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct MergeReport {
    /// Result lines that produced output.
    pub succeeded: usize,
    pub failed: usize,
    pub failures: BTreeMap<ErrorKind, usize>,
    pub files_written: usize,
    pub records_written: usize,
}

impl MergeReport {
    fn fail(&mut self, kind: ErrorKind) {
        self.failed += 1;
        *self.failures.entry(kind).or_default() += 1;
    }
}

/// How one stage turns (source record, model payload) into output records.
pub trait Join {
    /// One record of the stage's input file.
    type Source;
    /// One record of the stage's output file.
    type Output: Serialize;

    fn assemble(
        &self,
        id: &Identity,
        source: &Self::Source,
        payload: Value,
    ) -> Result<Vec<Self::Output>, RecordError>;

    /// Adjust the fully ordered output before it is written.
    fn finalize(&self, _groups: &mut BTreeMap<String, Vec<Self::Output>>) {}
}

/// Source records of a stage, keyed by relative path.
pub type SourceCache<S> = BTreeMap<String, Vec<S>>;

/// Merged output plus counts.
#[derive(Debug)]
pub struct Merged<T> {
    pub groups: BTreeMap<String, Vec<T>>,
    pub report: MergeReport,
}

/// Merge every line of `results` against `cache`.
///
/// Per-record failures go to `log`; only I/O errors are returned.
pub fn merge_results<J: Join>(
    join: &J,
    cache: &SourceCache<J::Source>,
    results: impl BufRead,
    log: &mut ErrorLog,
) -> Result<Merged<J::Output>> {
    let mut report = MergeReport::default();
    let mut slots: BTreeMap<String, BTreeMap<usize, Vec<J::Output>>> = BTreeMap::new();

    for line in store::jsonl_lines(results) {
        let (line_no, text) = line.context("Failed to read results")?;

        let outcome = match text {
            Ok(text) => merge_line(join, cache, &text, line_no),
            Err(lossy) => Err((
                format!("Line_{}", line_no),
                RecordError::new(ErrorKind::DecodeError, "line is not valid UTF-8").with_raw(lossy),
            )),
        };

        let failure = match outcome {
            Ok((id, outputs)) => {
                let file_slots = slots.entry(id.path().to_string()).or_default();
                if file_slots.contains_key(&id.index()) {
                    Err((
                        id.to_string(),
                        RecordError::new(
                            ErrorKind::DuplicateIdentity,
                            "identity already merged; keeping the first response",
                        ),
                    ))
                } else {
                    file_slots.insert(id.index(), outputs);
                    report.succeeded += 1;
                    Ok(())
                }
            }
            Err(failure) => Err(failure),
        };

        if let Err((id, err)) = failure {
            tracing::warn!(id = %id, kind = %err.kind, "{}", err.message);
            log.record(&id, &err)?;
            report.fail(err.kind);
        }
    }
    log.flush()?;

    let mut groups: BTreeMap<String, Vec<J::Output>> = slots
        .into_iter()
        .map(|(path, by_index)| (path, by_index.into_values().flatten().collect()))
        .collect();
    join.finalize(&mut groups);

    Ok(Merged { groups, report })
}

fn merge_line<J: Join>(
    join: &J,
    cache: &SourceCache<J::Source>,
    text: &str,
    line_no: usize,
) -> Result<(Identity, Vec<J::Output>), (String, RecordError)> {
    let line: ResultLine = serde_json::from_str(text).map_err(|e| {
        (
            format!("Line_{}", line_no),
            RecordError::new(ErrorKind::DecodeError, format!("invalid JSON line: {}", e))
                .with_raw(text),
        )
    })?;

    let raw_id = line
        .custom_id
        .clone()
        .unwrap_or_else(|| format!("Unknown_ID_Line_{}", line_no));
    let fail = |err: RecordError| (raw_id.clone(), err);

    let id: Identity = raw_id
        .parse()
        .map_err(|e| fail(RecordError::from(e).with_raw(text)))?;

    if let Some(upstream) = line.upstream_error() {
        return Err(fail(RecordError::new(ErrorKind::UpstreamError, upstream)));
    }

    let content = line.content().ok_or_else(|| {
        fail(RecordError::new(
            ErrorKind::ExtractionFailed,
            "response has no message content",
        ))
    })?;

    let payload = extract_json(content).ok_or_else(|| {
        fail(
            RecordError::new(ErrorKind::ExtractionFailed, "no JSON payload in model output")
                .with_raw(content),
        )
    })?;

    let records = cache.get(id.path()).ok_or_else(|| {
        fail(RecordError::new(
            ErrorKind::SourceMissing,
            format!("source file '{}' not found", id.path()),
        ))
    })?;

    let source = records.get(id.index()).ok_or_else(|| {
        fail(RecordError::new(
            ErrorKind::IndexOutOfBounds,
            format!("index {} >= length {}", id.index(), records.len()),
        ))
    })?;

    let outputs = join
        .assemble(&id, source, payload)
        .map_err(|e| fail(e.with_raw(content)))?;

    Ok((id, outputs))
}

// ============ Stage joins ============

/// Rules extracted from one chunk; all chunks of a document are concatenated
/// in chunk order.
pub struct ExtractJoin;

impl Join for ExtractJoin {
    type Source = Chunk;
    type Output = Rule;

    fn assemble(&self, id: &Identity, _chunk: &Chunk, payload: Value) -> Result<Vec<Rule>, RecordError> {
        let items = match payload {
            Value::Array(items) => items,
            obj @ Value::Object(_) => vec![obj],
            other => {
                return Err(RecordError::new(
                    ErrorKind::InvalidPayload,
                    format!("expected a list of rules, got {}", json_type(&other)),
                ))
            }
        };

        let total = items.len();
        let rules: Vec<Rule> = items
            .into_iter()
            .filter_map(|item| serde_json::from_value(item).ok())
            .collect();

        if rules.len() < total {
            tracing::warn!(id = %id, dropped = total - rules.len(), "dropping rules without condition/action");
        }
        Ok(rules)
    }
}

/// One synthetic case per rule. Ids are assigned after merging, in output order.
pub struct CasesJoin;

impl Join for CasesJoin {
    type Source = Rule;
    type Output = CaseRecord;

    fn assemble(&self, id: &Identity, rule: &Rule, payload: Value) -> Result<Vec<CaseRecord>, RecordError> {
        let obj = expect_object(payload)?;
        Ok(vec![CaseRecord {
            id: 0,
            file_name: file_name(id.path()),
            scenario_type: text_field(&obj, "scenario_type").unwrap_or_else(|| "Unknown".to_string()),
            patient_demographics: text_field(&obj, "patient_demographics"),
            case_input: text_field(&obj, "input").unwrap_or_default(),
            reference_rule: rule.clone(),
        }])
    }

    fn finalize(&self, groups: &mut BTreeMap<String, Vec<CaseRecord>>) {
        let mut next = 0u64;
        for case in groups.values_mut().flatten() {
            case.id = next;
            next += 1;
        }
    }
}

/// The case with the model's reasoning attached.
pub struct ReasoningJoin;

impl Join for ReasoningJoin {
    type Source = CaseRecord;
    type Output = ReasoningRecord;

    fn assemble(
        &self,
        _id: &Identity,
        case: &CaseRecord,
        payload: Value,
    ) -> Result<Vec<ReasoningRecord>, RecordError> {
        let obj = expect_object(payload)?;
        Ok(vec![ReasoningRecord {
            case: case.clone(),
            thought: text_field(&obj, "thought"),
            medical_order: text_field(&obj, "medical_order"),
            patient_dialogue: text_field(&obj, "patient_dialogue"),
        }])
    }
}

fn expect_object(payload: Value) -> Result<serde_json::Map<String, Value>, RecordError> {
    match payload {
        Value::Object(obj) => Ok(obj),
        other => Err(RecordError::new(
            ErrorKind::InvalidPayload,
            format!("expected a JSON object, got {}", json_type(&other)),
        )),
    }
}

/// A string field, or a non-string value rendered as JSON. Null and missing
/// fields are `None`.
fn text_field(obj: &serde_json::Map<String, Value>, key: &str) -> Option<String> {
    match obj.get(key)? {
        Value::Null => None,
        Value::String(s) => Some(s.clone()),
        other => Some(other.to_string()),
    }
}

fn json_type(value: &Value) -> &'static str {
    match value {
        Value::Null => "null",
        Value::Bool(_) => "a boolean",
        Value::Number(_) => "a number",
        Value::String(_) => "a string",
        Value::Array(_) => "a list",
        Value::Object(_) => "an object",
    }
}

// ============ Stage driver ============

/// Merge the results file for `stage` and write its output tree.
///
/// `results` overrides the configured results path.
pub fn run_merge(config: &Config, stage: Stage, results: Option<&Path>) -> Result<MergeReport> {
    let stage_cfg = config.stage(stage)?;
    let results_path = results.unwrap_or(&stage_cfg.results);
    if !results_path.is_file() {
        bail!("Results file not found: {}", results_path.display());
    }

    tracing::info!(stage = %stage, results = %results_path.display(), "merging");

    match stage {
        Stage::Extract => {
            let cache = load_chunk_cache(config, stage_cfg)?;
            merge_stage(&ExtractJoin, &cache, stage_cfg, results_path)
        }
        Stage::Cases => {
            let cache = load_record_cache::<Rule>(stage_cfg)?;
            merge_stage(&CasesJoin, &cache, stage_cfg, results_path)
        }
        Stage::Reasoning => {
            let cache = load_record_cache::<CaseRecord>(stage_cfg)?;
            merge_stage(&ReasoningJoin, &cache, stage_cfg, results_path)
        }
    }
}

fn merge_stage<J: Join>(
    join: &J,
    cache: &SourceCache<J::Source>,
    stage_cfg: &StageConfig,
    results_path: &Path,
) -> Result<MergeReport> {
    let file = File::open(results_path)
        .with_context(|| format!("Failed to open {}", results_path.display()))?;
    let mut log = ErrorLog::create(&stage_cfg.error_log)?;

    let Merged { groups, mut report } = merge_results(join, cache, BufReader::new(file), &mut log)?;

    let extension = stage_cfg.output_extension.trim_start_matches('.');
    for (path, records) in &groups {
        let out = output_path(&stage_cfg.output_root, path, extension);
        store::write_records(&out, records)?;
        report.files_written += 1;
        report.records_written += records.len();
    }

    tracing::info!(
        succeeded = report.succeeded,
        failed = report.failed,
        files = report.files_written,
        "merge complete"
    );
    Ok(report)
}

/// Re-chunk every guideline document exactly as the manifest did.
pub fn load_chunk_cache(config: &Config, stage_cfg: &StageConfig) -> Result<SourceCache<Chunk>> {
    let mut cache = BTreeMap::new();
    for file in scan_stage_inputs(stage_cfg)? {
        match document_chunks(config, &file) {
            Ok(chunks) => {
                cache.insert(file.relative_path, chunks);
            }
            Err(e) => tracing::warn!(file = %file.relative_path, error = %e, "skipping unreadable document"),
        }
    }
    Ok(cache)
}

/// Load every input record file of a stage; malformed files are left out.
pub fn load_record_cache<T: serde::de::DeserializeOwned>(
    stage_cfg: &StageConfig,
) -> Result<SourceCache<T>> {
    let mut cache = BTreeMap::new();
    for file in scan_stage_inputs(stage_cfg)? {
        match store::load_records(&file.absolute_path) {
            Ok(records) => {
                cache.insert(file.relative_path, records);
            }
            Err(e) => tracing::warn!(file = %file.relative_path, error = %e, "skipping malformed input"),
        }
    }
    Ok(cache)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;
    use std::sync::{Arc, Mutex};

    #[derive(Clone, Default)]
    struct SharedBuf(Arc<Mutex<Vec<u8>>>);

    impl Write for SharedBuf {
        fn write(&mut self, buf: &[u8]) -> std::io::Result<usize> {
            self.0.lock().unwrap().extend_from_slice(buf);
            Ok(buf.len())
        }
        fn flush(&mut self) -> std::io::Result<()> {
            Ok(())
        }
    }

    impl SharedBuf {
        fn text(&self) -> String {
            String::from_utf8(self.0.lock().unwrap().clone()).unwrap()
        }
    }

    fn rule(n: usize) -> Rule {
        Rule {
            condition: format!("c{}", n),
            action: format!("a{}", n),
            contraindication: None,
            evidence: String::new(),
        }
    }

    fn ok_line(id: &str, content: &str) -> String {
        serde_json::to_string(&ResultLine::success(id, content.to_string())).unwrap()
    }

    fn case_payload(label: &str) -> String {
        format!(
            "```json\n{{\"scenario_type\":\"{}\",\"patient_demographics\":\"60M\",\"input\":\"case text\"}}\n```",
            label
        )
    }

    fn rule_cache(files: &[(&str, usize)]) -> SourceCache<Rule> {
        files
            .iter()
            .map(|(path, n)| (path.to_string(), (0..*n).map(rule).collect()))
            .collect()
    }

    fn run<J: Join>(join: &J, cache: &SourceCache<J::Source>, lines: &[String]) -> (Merged<J::Output>, String) {
        let buf = SharedBuf::default();
        let mut log = ErrorLog::from_writer(buf.clone());
        let input = lines.join("\n");
        let merged = merge_results(join, cache, input.as_bytes(), &mut log).unwrap();
        (merged, buf.text())
    }

    #[test]
    fn test_one_upstream_error_nine_ok() {
        let cache = rule_cache(&[("g.json", 10)]);
        let mut lines: Vec<String> = (0..10)
            .filter(|i| *i != 4)
            .map(|i| ok_line(&format!("g.json|{}", i), &case_payload("场景A")))
            .collect();
        lines.push(r#"{"custom_id":"g.json|4","response":{"status_code":500,"body":null},"error":null}"#.to_string());

        let (merged, log) = run(&CasesJoin, &cache, &lines);
        assert_eq!(merged.report.succeeded, 9);
        assert_eq!(merged.report.failed, 1);
        assert_eq!(merged.report.failures.get(&ErrorKind::UpstreamError), Some(&1));
        assert!(log.contains("[UpstreamError] ID: g.json|4"));

        let cases = &merged.groups["g.json"];
        assert_eq!(cases.len(), 9);
        assert!(cases.iter().all(|c| c.reference_rule.condition != "c4"));
    }

    #[test]
    fn test_index_out_of_bounds() {
        let cache = rule_cache(&[("g.json", 3)]);
        let lines = vec![ok_line("g.json|5", &case_payload("A"))];
        let (merged, log) = run(&CasesJoin, &cache, &lines);
        assert_eq!(merged.report.failures.get(&ErrorKind::IndexOutOfBounds), Some(&1));
        assert!(merged.groups.is_empty());
        assert!(log.contains("index 5 >= length 3"));
    }

    #[test]
    fn test_source_missing_and_format_errors() {
        let cache = rule_cache(&[("g.json", 3)]);
        let lines = vec![
            ok_line("other.json|0", &case_payload("A")),
            ok_line("no-separator", &case_payload("A")),
            ok_line("g.json|-1", &case_payload("A")),
            r#"{"response":{"body":{"choices":[{"message":{"content":"{}"}}]}}}"#.to_string(),
            "{not json".to_string(),
        ];
        let (merged, log) = run(&CasesJoin, &cache, &lines);
        let f = &merged.report.failures;
        assert_eq!(f.get(&ErrorKind::SourceMissing), Some(&1));
        assert_eq!(f.get(&ErrorKind::FormatError), Some(&3));
        assert_eq!(f.get(&ErrorKind::DecodeError), Some(&1));
        assert!(log.contains("ID: Unknown_ID_Line_4"));
        assert!(log.contains("ID: Line_5"));
    }

    #[test]
    fn test_extraction_failed_keeps_raw() {
        let cache = rule_cache(&[("g.json", 1)]);
        let lines = vec![ok_line("g.json|0", "I could not produce JSON, sorry.")];
        let (merged, log) = run(&CasesJoin, &cache, &lines);
        assert_eq!(merged.report.failures.get(&ErrorKind::ExtractionFailed), Some(&1));
        assert!(log.contains("Raw Data: I could not produce JSON, sorry...."));
    }

    #[test]
    fn test_duplicate_identity_first_wins() {
        let cache = rule_cache(&[("g.json", 1)]);
        let lines = vec![
            r#"{"custom_id":"g.json|0","error":{"message":"timeout"}}"#.to_string(),
            ok_line("g.json|0", &case_payload("B")),
            ok_line("g.json|0", &case_payload("C")),
        ];
        let (merged, _) = run(&CasesJoin, &cache, &lines);
        assert_eq!(merged.report.succeeded, 1);
        assert_eq!(merged.report.failures.get(&ErrorKind::DuplicateIdentity), Some(&1));
        assert_eq!(merged.groups["g.json"][0].scenario_type, "B");
    }

    #[test]
    fn test_output_ordered_by_index_and_ids_sequential() {
        let cache = rule_cache(&[("b.json", 2), ("a.json", 2)]);
        let lines = vec![
            ok_line("b.json|1", &case_payload("A")),
            ok_line("a.json|1", &case_payload("A")),
            ok_line("b.json|0", &case_payload("A")),
            ok_line("a.json|0", &case_payload("A")),
        ];
        let (merged, _) = run(&CasesJoin, &cache, &lines);
        let order: Vec<(u64, &str, &str)> = merged
            .groups
            .values()
            .flatten()
            .map(|c| (c.id, c.file_name.as_str(), c.reference_rule.condition.as_str()))
            .collect();
        assert_eq!(
            order,
            vec![
                (0, "a.json", "c0"),
                (1, "a.json", "c1"),
                (2, "b.json", "c0"),
                (3, "b.json", "c1"),
            ]
        );
    }

    #[test]
    fn test_extract_concatenates_chunks() {
        let chunk = |i: usize| Chunk {
            document: "doc.md".into(),
            index: i,
            text: format!("part {}", i),
        };
        let mut cache = SourceCache::new();
        cache.insert("doc.md".to_string(), vec![chunk(0), chunk(1)]);

        let lines = vec![
            ok_line(
                "doc.md|1",
                r#"[{"condition":"late","action":"x"},{"note":"no condition"}]"#,
            ),
            ok_line(
                "doc.md|0",
                "<think>hmm</think>```json\n[{\"condition\":\"early\",\"action\":\"y\",\"evidence\":\"src\"}]\n```",
            ),
        ];
        let (merged, _) = run(&ExtractJoin, &cache, &lines);
        let rules = &merged.groups["doc.md"];
        let conditions: Vec<_> = rules.iter().map(|r| r.condition.as_str()).collect();
        assert_eq!(conditions, vec!["early", "late"]);
        assert_eq!(merged.report.succeeded, 2);
    }

    #[test]
    fn test_extract_rejects_scalar_payload() {
        let mut cache = SourceCache::new();
        cache.insert(
            "doc.md".to_string(),
            vec![Chunk {
                document: "doc.md".into(),
                index: 0,
                text: "t".into(),
            }],
        );
        let lines = vec![ok_line("doc.md|0", "```json\n42\n```")];
        let (merged, _) = run(&ExtractJoin, &cache, &lines);
        assert_eq!(merged.report.failures.get(&ErrorKind::InvalidPayload), Some(&1));
    }

    #[test]
    fn test_reasoning_join_keeps_case_fields() {
        let case = CaseRecord {
            id: 42,
            file_name: "g.json".into(),
            scenario_type: "场景D".into(),
            patient_demographics: Some("70F".into()),
            case_input: "ckd".into(),
            reference_rule: rule(0),
        };
        let mut cache = SourceCache::new();
        cache.insert("g.json".to_string(), vec![case.clone()]);
        let lines = vec![ok_line(
            "g.json|0",
            r#"{"thought":"t","medical_order":"m","patient_dialogue":{"text":"hi"}}"#,
        )];
        let (merged, _) = run(&ReasoningJoin, &cache, &lines);
        let record = &merged.groups["g.json"][0];
        assert_eq!(record.case, case);
        assert_eq!(record.thought.as_deref(), Some("t"));
        assert_eq!(record.patient_dialogue.as_deref(), Some(r#"{"text":"hi"}"#));
    }
}

//! Stage file I/O.
//!
//! Each stage owns its output tree: one pretty-printed JSON array per input
//! file. Downstream stages only read it back. The batch manifest and result
//! files are line-delimited JSON.

use anyhow::{bail, Context, Result};
use serde::de::DeserializeOwned;
use serde::Serialize;
use serde_json::Value;
use std::collections::BTreeSet;
use std::fs::{File, OpenOptions};
use std::io::{BufRead, BufReader, BufWriter, Read, Seek, SeekFrom, Write};
use std::path::Path;

use crate::extract::extract_json;
use crate::models::{ResultLine, Stage};

/// Load a stage file as a list of records.
///
/// A JSON array yields its elements; a single object is treated as a list of
/// one. Anything else, or any element that does not fit `T`, fails the
/// whole file so no partial record list ever reaches a manifest or cache.
pub fn load_records<T: DeserializeOwned>(path: &Path) -> Result<Vec<T>> {
    let content = std::fs::read_to_string(path)
        .with_context(|| format!("Failed to read {}", path.display()))?;
    let value: Value = serde_json::from_str(&content)
        .with_context(|| format!("{} is not valid JSON", path.display()))?;

    let items = match value {
        Value::Array(items) => items,
        obj @ Value::Object(_) => vec![obj],
        _ => bail!("{} does not hold a JSON list of records", path.display()),
    };

    items
        .into_iter()
        .enumerate()
        .map(|(i, item)| {
            serde_json::from_value(item)
                .with_context(|| format!("{}: record {} is malformed", path.display(), i))
        })
        .collect()
}

/// Write `records` as a pretty-printed JSON array, creating parent directories.
pub fn write_records<T: Serialize>(path: &Path, records: &[T]) -> Result<()> {
    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent)
            .with_context(|| format!("Failed to create {}", parent.display()))?;
    }
    let mut json = serde_json::to_string_pretty(records)?;
    json.push('\n');
    std::fs::write(path, json).with_context(|| format!("Failed to write {}", path.display()))?;
    Ok(())
}

/// Open a JSONL file for appending (or truncating, if `fresh`).
///
/// An existing file whose last line is unterminated gets its newline first,
/// so the next appended object starts on a line of its own.
pub fn open_jsonl(path: &Path, fresh: bool) -> Result<BufWriter<File>> {
    if let Some(parent) = path.parent() {
        if !parent.as_os_str().is_empty() {
            std::fs::create_dir_all(parent)
                .with_context(|| format!("Failed to create {}", parent.display()))?;
        }
    }
    let needs_newline = !fresh && lacks_trailing_newline(path)?;
    let file = OpenOptions::new()
        .create(true)
        .write(true)
        .append(!fresh)
        .truncate(fresh)
        .open(path)
        .with_context(|| format!("Failed to open {}", path.display()))?;
    let mut out = BufWriter::new(file);
    if needs_newline {
        out.write_all(b"\n")?;
    }
    Ok(out)
}

fn lacks_trailing_newline(path: &Path) -> Result<bool> {
    let mut file = match File::open(path) {
        Ok(file) => file,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(false),
        Err(e) => return Err(e).with_context(|| format!("Failed to open {}", path.display())),
    };
    if file.metadata()?.len() == 0 {
        return Ok(false);
    }
    let mut last = [0u8; 1];
    file.seek(SeekFrom::End(-1))?;
    file.read_exact(&mut last)?;
    Ok(last[0] != b'\n')
}

/// Append one value as a JSON line.
pub fn append_jsonl<T: Serialize>(out: &mut impl Write, value: &T) -> Result<()> {
    serde_json::to_writer(&mut *out, value)?;
    out.write_all(b"\n")?;
    Ok(())
}

/// Non-blank lines of a JSONL file, with 1-based line numbers.
///
/// Lines that are not valid UTF-8 come back as `Err` so callers can treat
/// them as decode failures instead of aborting.
pub fn jsonl_lines(
    reader: impl BufRead,
) -> impl Iterator<Item = std::io::Result<(usize, Result<String, String>)>> {
    reader
        .split(b'\n')
        .enumerate()
        .filter_map(|(i, bytes)| {
            let line_no = i + 1;
            match bytes {
                Err(e) => Some(Err(e)),
                Ok(bytes) => {
                    let decoded = String::from_utf8(bytes)
                        .map(|s| s.trim_end_matches('\r').to_string())
                        .map_err(|e| String::from_utf8_lossy(e.as_bytes()).into_owned());
                    if matches!(&decoded, Ok(s) if s.trim().is_empty()) {
                        None
                    } else {
                        Some(Ok((line_no, decoded)))
                    }
                }
            }
        })
}

/// Summary of the `custom_id`s found in a JSONL file.
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct IdScan {
    pub ids: BTreeSet<String>,
    /// Decoded lines, including those that yielded no id.
    pub lines: usize,
    /// Decoded lines that yielded an id (duplicates included).
    pub matched: usize,
    /// Lines that did not decode or carried no usable id.
    pub undecodable: usize,
}

/// Every `custom_id` present in a manifest. A missing file is empty.
pub fn manifest_ids(path: &Path) -> Result<IdScan> {
    scan_ids(path, |value: &Value| {
        value
            .get("custom_id")
            .and_then(|v| v.as_str())
            .map(str::to_string)
    })
}

/// `custom_id`s that already have a usable response in a results file.
///
/// A response is usable when it carries no upstream error and its content
/// yields a payload of the shape `stage` merges. Anything else is retried on
/// the next run.
pub fn completed_ids(path: &Path, stage: Stage) -> Result<IdScan> {
    scan_ids(path, |value: &Value| {
        let line: ResultLine = serde_json::from_value(value.clone()).ok()?;
        if line.upstream_error().is_some() {
            return None;
        }
        let payload = extract_json(line.content()?)?;
        if stage.accepts_payload(&payload) {
            line.custom_id
        } else {
            None
        }
    })
}

fn scan_ids(path: &Path, id_of: impl Fn(&Value) -> Option<String>) -> Result<IdScan> {
    let mut scan = IdScan::default();
    if !path.exists() {
        return Ok(scan);
    }

    let file = File::open(path).with_context(|| format!("Failed to open {}", path.display()))?;
    for line in jsonl_lines(BufReader::new(file)) {
        let (line_no, text) = line?;
        let value = text
            .ok()
            .and_then(|t| serde_json::from_str::<Value>(&t).ok());
        match value {
            Some(v) => {
                scan.lines += 1;
                if let Some(id) = id_of(&v) {
                    scan.matched += 1;
                    scan.ids.insert(id);
                }
            }
            None => {
                tracing::warn!(file = %path.display(), line = line_no, "skipping undecodable line");
                scan.undecodable += 1;
            }
        }
    }

    Ok(scan)
}

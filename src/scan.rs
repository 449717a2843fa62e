use anyhow::{bail, Context, Result};
use globset::{Glob, GlobSet, GlobSetBuilder};
use std::path::{Component, Path, PathBuf};
use walkdir::WalkDir;

use crate::config::StageConfig;

/// An eligible input file under a stage's input root.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SourceFile {
    /// Path relative to the input root, `/`-separated.
    pub relative_path: String,
    pub absolute_path: PathBuf,
}

impl SourceFile {
    /// File name without its extension, used as the document topic.
    pub fn stem(&self) -> String {
        file_stem(&self.relative_path)
    }

    pub fn file_name(&self) -> String {
        file_name(&self.relative_path)
    }
}

/// Recursively list the files a stage should read, sorted by relative path.
///
/// A missing input root is fatal: there is nothing to iterate over.
pub fn scan_stage_inputs(stage: &StageConfig) -> Result<Vec<SourceFile>> {
    scan_dir(&stage.input_root, &stage.include_globs, &stage.exclude_globs)
}

pub fn scan_dir(root: &Path, include: &[String], exclude: &[String]) -> Result<Vec<SourceFile>> {
    if !root.is_dir() {
        bail!("Input root does not exist: {}", root.display());
    }

    let include_set = build_globset(include)?;

    let mut default_excludes = vec!["**/.git/**".to_string()];
    default_excludes.extend(exclude.iter().cloned());
    let exclude_set = build_globset(&default_excludes)?;

    let mut files = Vec::new();

    for entry in WalkDir::new(root).sort_by_file_name() {
        let entry = entry.with_context(|| format!("Failed to walk {}", root.display()))?;
        if !entry.file_type().is_file() {
            continue;
        }

        let path = entry.path();
        let relative = path.strip_prefix(root).unwrap_or(path);
        let rel_str = relative_to_string(relative);

        if exclude_set.is_match(&rel_str) {
            continue;
        }
        if !include_set.is_match(&rel_str) {
            continue;
        }

        files.push(SourceFile {
            relative_path: rel_str,
            absolute_path: path.to_path_buf(),
        });
    }

    files.sort_by(|a, b| a.relative_path.cmp(&b.relative_path));

    Ok(files)
}

/// Where a stage writes the output for `relative_path`: same directories
/// under `output_root`, extension replaced by `extension`.
pub fn output_path(output_root: &Path, relative_path: &str, extension: &str) -> PathBuf {
    let mut path = output_root.to_path_buf();
    for part in relative_path.split('/') {
        path.push(part);
    }
    path.set_extension(extension);
    path
}

/// File name without directories or extension.
/// Last component of a `/`-separated relative path.
pub fn file_name(relative_path: &str) -> String {
    relative_path
        .rsplit('/')
        .next()
        .unwrap_or(relative_path)
        .to_string()
}

pub fn file_stem(relative_path: &str) -> String {
    let name = file_name(relative_path);
    match name.rfind('.') {
        Some(pos) if pos > 0 => name[..pos].to_string(),
        _ => name.to_string(),
    }
}

fn relative_to_string(relative: &Path) -> String {
    relative
        .components()
        .filter_map(|c| match c {
            Component::Normal(part) => Some(part.to_string_lossy().into_owned()),
            _ => None,
        })
        .collect::<Vec<_>>()
        .join("/")
}

fn build_globset(patterns: &[String]) -> Result<GlobSet> {
    let mut builder = GlobSetBuilder::new();
    for pattern in patterns {
        builder.add(Glob::new(pattern).with_context(|| format!("Invalid glob: {}", pattern))?);
    }
    Ok(builder.build()?)
}

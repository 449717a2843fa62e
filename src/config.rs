use anyhow::{bail, Context, Result};
use serde::Deserialize;
use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::models::Stage;
use crate::retry::{Backoff, RetryPolicy};

#[derive(Debug, Clone)]
pub struct Config {
    pub llm: LlmConfig,
    pub chunking: ChunkingConfig,
    pub stages: StagesConfig,
}

/// On-disk form of [`Config`] before stage defaults are applied.
#[derive(Debug, Deserialize)]
struct ConfigFile {
    llm: LlmConfig,
    #[serde(default)]
    chunking: ChunkingConfig,
    #[serde(default)]
    stages: StagesFile,
}

#[derive(Debug, Deserialize, Clone)]
pub struct LlmConfig {
    #[serde(default = "default_api_url")]
    pub api_url: String,
    #[serde(default = "default_api_key_env")]
    pub api_key_env: String,
    pub model: String,
    #[serde(default = "default_timeout_secs")]
    pub timeout_secs: u64,
    #[serde(default = "default_max_retries")]
    pub max_retries: u32,
    #[serde(default = "default_retry_delay_ms")]
    pub retry_delay_ms: u64,
    #[serde(default)]
    pub backoff: Backoff,
    #[serde(default = "default_rate_limit_ms")]
    pub rate_limit_ms: u64,
}

fn default_api_url() -> String {
    "https://api.siliconflow.cn/v1/chat/completions".to_string()
}
fn default_api_key_env() -> String {
    "LLM_API_KEY".to_string()
}
fn default_timeout_secs() -> u64 {
    300
}
fn default_max_retries() -> u32 {
    3
}
fn default_retry_delay_ms() -> u64 {
    2000
}
fn default_rate_limit_ms() -> u64 {
    1000
}

impl LlmConfig {
    pub fn retry_policy(&self) -> RetryPolicy {
        RetryPolicy {
            max_attempts: self.max_retries,
            delay: Duration::from_millis(self.retry_delay_ms),
            backoff: self.backoff,
        }
    }

    pub fn rate_limit(&self) -> Duration {
        Duration::from_millis(self.rate_limit_ms)
    }
}

#[derive(Debug, Deserialize, Clone)]
pub struct ChunkingConfig {
    #[serde(default = "default_max_chars")]
    pub max_chars: usize,
}

impl Default for ChunkingConfig {
    fn default() -> Self {
        Self {
            max_chars: default_max_chars(),
        }
    }
}

fn default_max_chars() -> usize {
    15000
}

#[derive(Debug, Clone, Default)]
pub struct StagesConfig {
    pub extract: Option<StageConfig>,
    pub cases: Option<StageConfig>,
    pub reasoning: Option<StageConfig>,
}

#[derive(Debug, Deserialize, Default)]
struct StagesFile {
    extract: Option<StageFile>,
    cases: Option<StageFile>,
    reasoning: Option<StageFile>,
}

/// Settings for one pipeline stage, with defaults applied.
#[derive(Debug, Clone)]
pub struct StageConfig {
    pub input_root: PathBuf,
    pub output_root: PathBuf,
    pub include_globs: Vec<String>,
    pub exclude_globs: Vec<String>,
    pub output_extension: String,
    pub manifest: PathBuf,
    pub results: PathBuf,
    pub error_log: PathBuf,
    pub model: Option<String>,
    pub max_tokens: u32,
    pub temperature: f32,
    pub top_p: Option<f32>,
}

/// A `[stages.<name>]` table; everything but the two roots is optional.
#[derive(Debug, Deserialize)]
struct StageFile {
    input_root: PathBuf,
    output_root: PathBuf,
    include_globs: Option<Vec<String>>,
    #[serde(default)]
    exclude_globs: Vec<String>,
    output_extension: Option<String>,
    manifest: Option<PathBuf>,
    results: Option<PathBuf>,
    error_log: Option<PathBuf>,
    model: Option<String>,
    max_tokens: Option<u32>,
    temperature: Option<f32>,
    top_p: Option<f32>,
}

impl StageFile {
    fn resolve(self, stage: Stage) -> StageConfig {
        let d = StageConfig::defaults(stage);
        StageConfig {
            input_root: self.input_root,
            output_root: self.output_root,
            include_globs: self.include_globs.unwrap_or(d.include_globs),
            exclude_globs: self.exclude_globs,
            output_extension: self.output_extension.unwrap_or(d.output_extension),
            manifest: self.manifest.unwrap_or(d.manifest),
            results: self.results.unwrap_or(d.results),
            error_log: self.error_log.unwrap_or(d.error_log),
            model: self.model,
            max_tokens: self.max_tokens.unwrap_or(d.max_tokens),
            temperature: self.temperature.unwrap_or(d.temperature),
            top_p: self.top_p.or(d.top_p),
        }
    }
}

impl StageConfig {
    /// Defaults for `stage`, as tuned for the reasoning models in use.
    pub fn defaults(stage: Stage) -> StageConfig {
        let (globs, max_tokens, top_p) = match stage {
            Stage::Extract => ("**/*.md", 8192, Some(0.95)),
            Stage::Cases => ("**/*.json", 2048, None),
            Stage::Reasoning => ("**/*.json", 4096, None),
        };
        let name = stage.as_str();
        StageConfig {
            input_root: PathBuf::new(),
            output_root: PathBuf::new(),
            include_globs: vec![globs.to_string()],
            exclude_globs: Vec::new(),
            output_extension: "json".to_string(),
            manifest: PathBuf::from(format!("batch/{}_input.jsonl", name)),
            results: PathBuf::from(format!("batch/{}_output.jsonl", name)),
            error_log: PathBuf::from(format!("batch/{}_errors.txt", name)),
            model: None,
            max_tokens,
            temperature: 0.6,
            top_p,
        }
    }
}

impl Config {
    /// Settings for `stage`, or an error if the stage is not configured.
    pub fn stage(&self, stage: Stage) -> Result<&StageConfig> {
        let cfg = match stage {
            Stage::Extract => self.stages.extract.as_ref(),
            Stage::Cases => self.stages.cases.as_ref(),
            Stage::Reasoning => self.stages.reasoning.as_ref(),
        };
        cfg.ok_or_else(|| anyhow::anyhow!("Stage '{}' is not configured ([stages.{}])", stage, stage))
    }

    /// Model used by `stage`: the stage override, else `llm.model`.
    pub fn model_for(&self, stage: &StageConfig) -> String {
        stage.model.clone().unwrap_or_else(|| self.llm.model.clone())
    }
}

pub fn load_config(path: &Path) -> Result<Config> {
    let content = std::fs::read_to_string(path)
        .with_context(|| format!("Failed to read config file: {}", path.display()))?;

    parse_config(&content)
}

/// Parse and validate configuration from TOML text.
pub fn parse_config(content: &str) -> Result<Config> {
    let file: ConfigFile =
        toml::from_str(content).with_context(|| "Failed to parse config file")?;

    let config = Config {
        llm: file.llm,
        chunking: file.chunking,
        stages: StagesConfig {
            extract: file.stages.extract.map(|s| s.resolve(Stage::Extract)),
            cases: file.stages.cases.map(|s| s.resolve(Stage::Cases)),
            reasoning: file.stages.reasoning.map(|s| s.resolve(Stage::Reasoning)),
        },
    };

    if config.chunking.max_chars == 0 {
        bail!("chunking.max_chars must be > 0");
    }

    if config.llm.max_retries == 0 {
        bail!("llm.max_retries must be >= 1");
    }

    if config.llm.model.trim().is_empty() {
        bail!("llm.model must not be empty");
    }

    for stage in [Stage::Extract, Stage::Cases, Stage::Reasoning] {
        let Ok(s) = config.stage(stage) else {
            continue;
        };
        if s.max_tokens == 0 {
            bail!("stages.{}.max_tokens must be > 0", stage);
        }
        if !(0.0..=2.0).contains(&s.temperature) {
            bail!("stages.{}.temperature must be in [0.0, 2.0]", stage);
        }
        if let Some(top_p) = s.top_p {
            if !(top_p > 0.0 && top_p <= 1.0) {
                bail!("stages.{}.top_p must be in (0.0, 1.0]", stage);
            }
        }
        if s.output_extension.trim_start_matches('.').is_empty() {
            bail!("stages.{}.output_extension must not be empty", stage);
        }
    }

    Ok(config)
}

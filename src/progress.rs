//! Run progress reporting.
//!
//! Reports what `gsynth run` is doing so users see how many requests are
//! left. Progress is emitted on **stderr** so stdout remains parseable for
//! scripts.

use std::io::Write;

use crate::models::Stage;

/// A single progress event for an in-process run.
#[derive(Clone, Debug)]
pub enum StageProgressEvent {
    /// Building requests from the stage's input tree. Total unknown.
    Preparing { stage: Stage },
    /// Request `n` of `total` is being sent.
    Calling {
        stage: Stage,
        custom_id: String,
        n: u64,
        total: u64,
    },
}

/// Reports run progress. Implementations write to stderr (human or JSON).
pub trait StageProgressReporter {
    fn report(&self, event: StageProgressEvent);
}

/// Human-friendly progress on stderr: "run cases  calling  12 / 1,034  guide.json|11".
pub struct StderrProgress;

impl StageProgressReporter for StderrProgress {
    fn report(&self, event: StageProgressEvent) {
        let line = match &event {
            StageProgressEvent::Preparing { stage } => format!("run {}  preparing...\n", stage),
            StageProgressEvent::Calling {
                stage,
                custom_id,
                n,
                total,
            } => format!(
                "run {}  calling  {} / {}  {}\n",
                stage,
                format_number(*n),
                format_number(*total),
                custom_id
            ),
        };
        let mut err = std::io::stderr().lock();
        let _ = err.write_all(line.as_bytes());
        let _ = err.flush();
    }
}

/// Machine-readable progress: one JSON object per line on stderr.
pub struct JsonProgress;

impl StageProgressReporter for JsonProgress {
    fn report(&self, event: StageProgressEvent) {
        let obj = match &event {
            StageProgressEvent::Preparing { stage } => serde_json::json!({
                "event": "progress",
                "stage": stage.as_str(),
                "phase": "preparing"
            }),
            StageProgressEvent::Calling {
                stage,
                custom_id,
                n,
                total,
            } => serde_json::json!({
                "event": "progress",
                "stage": stage.as_str(),
                "phase": "calling",
                "custom_id": custom_id,
                "n": n,
                "total": total
            }),
        };
        if let Ok(line) = serde_json::to_string(&obj) {
            let mut err = std::io::stderr().lock();
            let _ = writeln!(err, "{}", line);
            let _ = err.flush();
        }
    }
}

/// No-op reporter when progress is disabled.
pub struct NoProgress;

impl StageProgressReporter for NoProgress {
    fn report(&self, _event: StageProgressEvent) {}
}

fn format_number(n: u64) -> String {
    let s = n.to_string();
    let mut result = String::with_capacity(s.len() + (s.len() - 1) / 3);
    for (i, c) in s.chars().rev().enumerate() {
        if i > 0 && i % 3 == 0 {
            result.push(',');
        }
        result.push(c);
    }
    result.chars().rev().collect()
}

/// Progress mode for the CLI: off, human (stderr), or JSON (stderr).
#[derive(Clone, Copy, Debug, Eq, PartialEq, clap::ValueEnum)]
pub enum ProgressMode {
    Off,
    Human,
    Json,
}

impl ProgressMode {
    /// Default: human progress when stderr is a TTY, otherwise off.
    pub fn default_for_tty() -> Self {
        if atty::is(atty::Stream::Stderr) {
            ProgressMode::Human
        } else {
            ProgressMode::Off
        }
    }

    pub fn reporter(&self) -> Box<dyn StageProgressReporter> {
        match self {
            ProgressMode::Off => Box::new(NoProgress),
            ProgressMode::Human => Box::new(StderrProgress),
            ProgressMode::Json => Box::new(JsonProgress),
        }
    }
}

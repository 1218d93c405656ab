use serde::Serialize;
use std::path::PathBuf;

/// Run-level failures. Anything in here stops the run; per-sample problems
/// are recorded as [`SampleFailure`] instead.
#[derive(Debug, thiserror::Error)]
pub enum HarnessError {
    #[error("Failed to load dataset from {path:?}: {reason}")]
    DatasetLoad { path: PathBuf, reason: String },

    #[error("Failed to load scorer: {0}")]
    ScorerLoad(String),

    #[error("Scorer call failed: {0}")]
    Scorer(String),

    #[error("Process error: {0}")]
    Process(String),

    #[error("Timeout: {0}")]
    Timeout(String),

    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Interrupted")]
    Interrupted,

    #[error("No samples were scored ({failed} failed of {total})")]
    NothingScored { failed: usize, total: usize },

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
}

/// Why one sample produced no score. Recorded and counted, never propagated.
#[derive(Debug, Clone, PartialEq, Serialize, thiserror::Error)]
#[serde(tag = "kind", content = "detail", rename_all = "snake_case")]
pub enum SampleFailure {
    #[error("engine could not be launched: {0}")]
    Launch(String),

    #[error("engine exited with status {}", exit_label(.0))]
    NonZeroExit(Option<i32>),

    #[error("engine did not exit within {0}s")]
    TimedOut(u64),

    #[error("could not read engine output: {0}")]
    OutputRead(String),

    #[error("empty prediction")]
    EmptyPrediction,

    #[error("sample has no references for this metric")]
    MissingReferences,

    #[error("scorer failed: {0}")]
    Scoring(String),
}

impl SampleFailure {
    /// Failures of the engine itself, as opposed to scoring problems.
    pub fn is_trial_failure(&self) -> bool {
        matches!(
            self,
            SampleFailure::Launch(_)
                | SampleFailure::NonZeroExit(_)
                | SampleFailure::TimedOut(_)
                | SampleFailure::OutputRead(_)
        )
    }
}

fn exit_label(code: &Option<i32>) -> String {
    match code {
        Some(c) => c.to_string(),
        None => "signal".to_string(),
    }
}

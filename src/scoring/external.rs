//! Scorer adapters backed by a long-lived helper process.
//!
//! The helper reads one JSON request per line on stdin and answers with one
//! JSON object per line on stdout:
//!
//! ```text
//! <- {"ready": true, "model": "bleurt-large-128"}
//! -> {"predictions": ["..."], "references": ["..."]}
//! <- {"scores": [0.12]}
//! <- {"error": "reason"}
//! ```
//!
//! Lines on stdout that are not JSON objects (library banners, progress
//! bars) are skipped. The helper's stderr is inherited.

use serde::de::DeserializeOwned;
use serde::Deserialize;
use std::path::Path;
use std::process::Stdio;
use std::time::Duration;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader, Lines};
use tokio::process::{Child, ChildStdin, ChildStdout, Command};
use tracing::{debug, info, warn};

use super::{OverlapScorer, OverlapScores, SemanticScorer};
use crate::error::HarnessError;
use crate::trial::args::engine_command;

pub const SCORER_LOAD_TIMEOUT_SECS: u64 = 900;
pub const SCORER_CALL_TIMEOUT_SECS: u64 = 600;

#[derive(Debug, Deserialize)]
struct Ready {
    ready: bool,
    #[serde(default)]
    model: Option<String>,
}

#[derive(Debug, Deserialize)]
#[serde(untagged)]
enum Reply<T> {
    Scores { scores: Vec<T> },
    Error { error: String },
}

/// Parse one stdout line as a JSON object, tolerating text around it.
pub fn parse_reply_line<T: DeserializeOwned>(line: &str) -> Option<T> {
    let trimmed = line.trim();
    if let Ok(v) = serde_json::from_str::<T>(trimmed) {
        return Some(v);
    }
    let start = trimmed.find('{')?;
    let end = trimmed.rfind('}')?;
    if end < start {
        return None;
    }
    serde_json::from_str::<T>(&trimmed[start..=end]).ok()
}

/// One running helper process.
///
/// A call that times out or loses the pipe leaves the helper out of step with
/// its requests (a late reply would be read as the answer to the next one),
/// so the process is killed and every later call fails straight away.
pub struct ScorerProcess {
    name: String,
    child: Child,
    stdin: ChildStdin,
    lines: Lines<BufReader<ChildStdout>>,
    call_timeout: Duration,
    broken: Option<String>,
}

impl ScorerProcess {
    /// Spawn the helper and wait for its ready line. Any failure here is a
    /// scorer load failure and ends the run. `.sh` helpers run through bash.
    pub async fn spawn(name: &str, command: &Path) -> Result<Self, HarnessError> {
        let load_err = |reason: String| HarnessError::ScorerLoad(format!("{}: {}", name, reason));

        let (program, args) = engine_command(command);
        let mut child = Command::new(&program)
            .args(&args)
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::inherit())
            .kill_on_drop(true)
            .spawn()
            .map_err(|e| load_err(format!("failed to spawn {}: {}", command.display(), e)))?;

        let stdin = child
            .stdin
            .take()
            .ok_or_else(|| load_err("no stdin".to_string()))?;
        let stdout = child
            .stdout
            .take()
            .ok_or_else(|| load_err("no stdout".to_string()))?;

        let mut process = Self {
            name: name.to_string(),
            child,
            stdin,
            lines: BufReader::new(stdout).lines(),
            call_timeout: Duration::from_secs(SCORER_CALL_TIMEOUT_SECS),
            broken: None,
        };

        let ready: Ready = tokio::time::timeout(
            Duration::from_secs(SCORER_LOAD_TIMEOUT_SECS),
            process.next_object(),
        )
        .await
        .map_err(|_| load_err(format!("not ready after {}s", SCORER_LOAD_TIMEOUT_SECS)))?
        .map_err(|e| load_err(e.to_string()))?;

        if !ready.ready {
            return Err(load_err("reported not ready".to_string()));
        }
        info!(
            "Scorer {} ready (model: {})",
            name,
            ready.model.as_deref().unwrap_or("unknown")
        );
        Ok(process)
    }

    pub fn with_call_timeout(mut self, call_timeout: Duration) -> Self {
        self.call_timeout = call_timeout;
        self
    }

    /// Why the helper stopped taking calls, if it did.
    pub fn broken(&self) -> Option<&str> {
        self.broken.as_deref()
    }

    async fn next_object<T: DeserializeOwned>(&mut self) -> Result<T, HarnessError> {
        loop {
            match self.lines.next_line().await {
                Ok(Some(line)) => {
                    if let Some(obj) = parse_reply_line::<T>(&line) {
                        return Ok(obj);
                    }
                    debug!("{} scorer: {}", self.name, line);
                }
                Ok(None) => {
                    return Err(HarnessError::Scorer(format!(
                        "{} scorer closed its output",
                        self.name
                    )))
                }
                Err(e) => return Err(HarnessError::Io(e)),
            }
        }
    }

    async fn exchange<T: DeserializeOwned>(
        &mut self,
        predictions: &[String],
        references: &[String],
    ) -> Result<Reply<T>, HarnessError> {
        let mut body = serde_json::to_string(&serde_json::json!({
            "predictions": predictions,
            "references": references,
        }))?;
        body.push('\n');
        self.stdin.write_all(body.as_bytes()).await?;
        self.stdin.flush().await?;

        let limit = self.call_timeout;
        tokio::time::timeout(limit, self.next_object())
            .await
            .map_err(|_| {
                HarnessError::Timeout(format!(
                    "{} scorer did not answer within {:.1}s",
                    self.name,
                    limit.as_secs_f64()
                ))
            })?
    }

    /// Send one batch and wait for the matching reply.
    pub async fn request<T: DeserializeOwned>(
        &mut self,
        predictions: &[String],
        references: &[String],
    ) -> Result<Vec<T>, HarnessError> {
        if let Some(reason) = &self.broken {
            return Err(HarnessError::Scorer(format!(
                "{} scorer unavailable after earlier failure: {}",
                self.name, reason
            )));
        }

        match self.exchange(predictions, references).await {
            Ok(Reply::Scores { scores }) => Ok(scores),
            Ok(Reply::Error { error }) => Err(HarnessError::Scorer(error)),
            Err(e) => {
                warn!("{} scorer out of step, stopping it: {}", self.name, e);
                self.broken = Some(e.to_string());
                let _ = self.child.start_kill();
                Err(e)
            }
        }
    }

    /// Close stdin and wait for the helper to exit.
    pub async fn shutdown(mut self) {
        drop(self.stdin);
        match tokio::time::timeout(Duration::from_secs(10), self.child.wait()).await {
            Ok(Ok(status)) if !status.success() && self.broken.is_none() => {
                warn!("{} scorer exited with status {}", self.name, status)
            }
            Ok(Err(e)) => warn!("Error waiting for {} scorer: {}", self.name, e),
            Err(_) => {
                warn!("{} scorer did not exit, killing", self.name);
                let _ = self.child.kill().await;
            }
            _ => {}
        }
    }
}

/// Semantic-similarity helper (e.g. a BLEURT wrapper).
pub struct ExternalSemanticScorer(pub ScorerProcess);

impl ExternalSemanticScorer {
    pub async fn load(command: &Path) -> Result<Self, HarnessError> {
        Ok(Self(ScorerProcess::spawn("semantic", command).await?))
    }
}

impl SemanticScorer for ExternalSemanticScorer {
    async fn score_batch(
        &mut self,
        predictions: &[String],
        references: &[String],
    ) -> Result<Vec<f64>, HarnessError> {
        self.0.request(predictions, references).await
    }
}

/// Overlap helper (e.g. a ROUGE wrapper returning per-pair records).
pub struct ExternalOverlapScorer(pub ScorerProcess);

impl ExternalOverlapScorer {
    pub async fn load(command: &Path) -> Result<Self, HarnessError> {
        Ok(Self(ScorerProcess::spawn("overlap", command).await?))
    }
}

impl OverlapScorer for ExternalOverlapScorer {
    async fn score_batch(
        &mut self,
        predictions: &[String],
        references: &[String],
    ) -> Result<Vec<OverlapScores>, HarnessError> {
        self.0.request(predictions, references).await
    }
}

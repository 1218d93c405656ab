pub mod args;
pub mod launcher;

use serde::Serialize;
use std::path::PathBuf;
use std::time::{Duration, Instant};
use tracing::{info, warn};

use crate::config::{flatten_sample_id, output_file_name, PROMPT_FILE_SUFFIX};
use crate::dataset::Sample;
use crate::error::SampleFailure;
use crate::settings::TrialConfig;
use args::{build_args, engine_command, PromptDelivery};
use launcher::{ExitKind, LaunchRequest, ProcessLauncher};

/// Outcome of one engine invocation.
#[derive(Debug, Clone, Serialize)]
pub struct TrialResult {
    pub sample_id: String,
    /// Trimmed primary output; `None` when the trial failed.
    pub text: Option<String>,
    pub latency_secs: f64,
    pub failure: Option<SampleFailure>,
    pub output_path: PathBuf,
    #[serde(skip)]
    pub diagnostics: String,
}

impl TrialResult {
    pub fn success(&self) -> bool {
        self.failure.is_none()
    }
}

/// Invokes the engine for one sample at a time.
pub struct TrialRunner<L> {
    launcher: L,
    engine: PathBuf,
    outputs_dir: PathBuf,
    prompts_dir: PathBuf,
    output_prefix: String,
    timeout: Option<Duration>,
}

impl<L: ProcessLauncher> TrialRunner<L> {
    pub fn new(
        launcher: L,
        engine: PathBuf,
        outputs_dir: PathBuf,
        prompts_dir: PathBuf,
        output_prefix: impl Into<String>,
        timeout: Option<Duration>,
    ) -> Self {
        Self {
            launcher,
            engine,
            outputs_dir,
            prompts_dir,
            output_prefix: output_prefix.into(),
            timeout,
        }
    }

    pub fn output_path(&self, sample: &Sample) -> PathBuf {
        self.outputs_dir
            .join(output_file_name(&self.output_prefix, &sample.id))
    }

    /// Decide how the prompt is delivered, writing a prompt file when the
    /// inline text is over the configured limit.
    fn delivery(&self, sample: &Sample, config: &TrialConfig) -> std::io::Result<PromptDelivery> {
        if let Some(path) = &sample.prompt_file {
            return Ok(PromptDelivery::File(path.clone()));
        }
        match config.inline_prompt_max_chars {
            Some(limit) if sample.prompt.chars().count() > limit => {
                std::fs::create_dir_all(&self.prompts_dir)?;
                let path = self.prompts_dir.join(format!(
                    "{}_{}{}",
                    self.output_prefix,
                    flatten_sample_id(&sample.id),
                    PROMPT_FILE_SUFFIX
                ));
                std::fs::write(&path, &sample.prompt)?;
                Ok(PromptDelivery::File(path))
            }
            _ => Ok(PromptDelivery::Inline(sample.prompt.clone())),
        }
    }

    /// Run the engine for `sample`. Never fails: every problem is folded
    /// into the returned [`TrialResult`].
    pub async fn invoke(&mut self, sample: &Sample, config: &TrialConfig) -> TrialResult {
        let output_path = self.output_path(sample);
        let failed = |failure: SampleFailure, latency_secs: f64, diagnostics: String| TrialResult {
            sample_id: sample.id.clone(),
            text: None,
            latency_secs,
            failure: Some(failure),
            output_path: output_path.clone(),
            diagnostics,
        };

        let delivery = match self.delivery(sample, config) {
            Ok(d) => d,
            Err(e) => {
                return failed(
                    SampleFailure::Launch(format!("could not write prompt file: {}", e)),
                    0.0,
                    String::new(),
                )
            }
        };

        let (program, mut args) = engine_command(&self.engine);
        args.extend(build_args(config, &delivery));

        if let Err(e) = std::fs::create_dir_all(&self.outputs_dir) {
            return failed(SampleFailure::Launch(e.to_string()), 0.0, String::new());
        }

        let start = Instant::now();
        let launched = self
            .launcher
            .launch(LaunchRequest {
                label: &sample.id,
                program: &program,
                args: &args,
                stdout_sink: &output_path,
                timeout: self.timeout,
            })
            .await;
        let latency_secs = start.elapsed().as_secs_f64();

        let outcome = match launched {
            Ok(outcome) => outcome,
            Err(e) => {
                warn!("[ERROR] Engine launch failed for sample {}: {}", sample.id, e);
                return failed(SampleFailure::Launch(e.to_string()), latency_secs, String::new());
            }
        };

        match outcome.exit {
            ExitKind::Success => {}
            ExitKind::Failed(code) => {
                warn!("[ERROR] Engine failed for sample {} (status {:?})", sample.id, code);
                return failed(SampleFailure::NonZeroExit(code), latency_secs, outcome.diagnostics);
            }
            ExitKind::TimedOut => {
                let secs = self.timeout.map(|t| t.as_secs()).unwrap_or_default();
                return failed(SampleFailure::TimedOut(secs), latency_secs, outcome.diagnostics);
            }
        }

        let text = match std::fs::read(&output_path) {
            Ok(bytes) => String::from_utf8_lossy(&bytes).trim().to_string(),
            Err(e) => {
                return failed(
                    SampleFailure::OutputRead(e.to_string()),
                    latency_secs,
                    outcome.diagnostics,
                )
            }
        };

        info!("    latency: {:.3} s.", latency_secs);

        TrialResult {
            sample_id: sample.id.clone(),
            text: Some(text),
            latency_secs,
            failure: None,
            output_path,
            diagnostics: outcome.diagnostics,
        }
    }

    /// Give back the launcher, closing the run-scoped debug log for the
    /// real implementation.
    pub fn into_launcher(self) -> L {
        self.launcher
    }
}

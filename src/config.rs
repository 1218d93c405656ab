use clap::{Args, Parser, Subcommand, ValueEnum};
use std::path::PathBuf;
use std::time::Duration;

use crate::aggregate::AggregationPolicy;

/// LLM trial harness: runs a generation engine CLI over a dataset and scores the output.
#[derive(Parser, Debug, Clone)]
#[command(name = "llm-trial-harness", version)]
pub struct CliArgs {
    /// Mirror harness logs to this file
    #[arg(short = 'l', long = "log-file", global = true)]
    pub log_file: Option<PathBuf>,

    #[command(subcommand)]
    pub command: Command,
}

#[derive(Subcommand, Debug, Clone)]
pub enum Command {
    /// Invoke the engine once per sample, score the outputs and write a report
    Run(RunArgs),
    /// Extract per-phase throughput from an existing debug log
    ParseLog(ParseLogArgs),
    /// Score previously generated output files against dataset references
    ScoreOutputs(ScoreOutputsArgs),
}

#[derive(Args, Debug, Clone)]
pub struct RunArgs {
    /// Engine command or wrapper script (`.sh` scripts are run through bash)
    #[arg(short = 'e', long = "engine")]
    pub engine: PathBuf,

    /// JSONL dataset file
    #[arg(short = 'd', long = "dataset", conflicts_with = "prompt_dir")]
    pub dataset: Option<PathBuf>,

    /// Directory of `*.prompt.txt` files, delivered to the engine by path
    #[arg(long = "prompt-dir")]
    pub prompt_dir: Option<PathBuf>,

    /// Path prefix the engine sees for prompt files (e.g. an on-device directory)
    #[arg(long = "device-prompt-prefix", requires = "prompt_dir")]
    pub device_prompt_prefix: Option<PathBuf>,

    /// Only evaluate the first N samples
    #[arg(short = 'n', long = "limit")]
    pub limit: Option<usize>,

    /// Trial config JSON (one sweep point)
    #[arg(short = 'c', long = "trial-config")]
    pub trial_config: Option<PathBuf>,

    /// Override the maximum number of new tokens
    #[arg(long = "max-new-tokens")]
    pub max_new_tokens: Option<u32>,

    /// Run directory for outputs, debug log and report
    #[arg(short = 'o', long = "run-dir", default_value = DEFAULT_RUN_DIR)]
    pub run_dir: PathBuf,

    /// Which quality metric to compute
    #[arg(short = 'm', long = "metric", value_enum, default_value_t = MetricKind::Semantic)]
    pub metric: MetricKind,

    /// Semantic-similarity scorer command (reads JSON on stdin, writes JSON on stdout)
    #[arg(long = "semantic-scorer")]
    pub semantic_scorer: Option<PathBuf>,

    /// Overlap scorer command (reads JSON on stdin, writes JSON on stdout)
    #[arg(long = "overlap-scorer")]
    pub overlap_scorer: Option<PathBuf>,

    #[command(flatten)]
    pub policy: PolicyArgs,

    /// Kill a trial after this many seconds (unbounded when omitted)
    #[arg(long = "trial-timeout-secs")]
    pub trial_timeout_secs: Option<u64>,

    /// Stop the whole run at the first failed trial (legacy behaviour)
    #[arg(long = "abort-on-trial-failure")]
    pub abort_on_trial_failure: bool,
}

#[derive(Args, Debug, Clone, Default)]
pub struct PolicyArgs {
    /// Denominator used for the accuracy ratio
    #[arg(long = "accuracy-denominator", value_enum, default_value_t = AccuracyDenominator::Scored)]
    pub accuracy_denominator: AccuracyDenominator,

    /// Drop samples whose ROUGE-L is exactly 0.0 from the pooled overlap mean
    #[arg(long = "pool-exclude-zero-lcs")]
    pub pool_exclude_zero_lcs: bool,
}

impl PolicyArgs {
    pub fn aggregation_policy(&self) -> AggregationPolicy {
        AggregationPolicy {
            accuracy_denominator: self.accuracy_denominator,
            pool_exclude_zero_lcs: self.pool_exclude_zero_lcs,
        }
    }
}

#[derive(Args, Debug, Clone)]
pub struct ParseLogArgs {
    /// Debug log to parse
    pub logfile: PathBuf,

    /// Also write the extracted records as CSV
    #[arg(long = "csv")]
    pub csv: Option<PathBuf>,
}

#[derive(Args, Debug, Clone)]
pub struct ScoreOutputsArgs {
    /// Directory holding `<prefix>_<id>.txt` output files
    pub output_dir: PathBuf,

    /// JSONL dataset providing the references
    #[arg(short = 'd', long = "dataset")]
    pub dataset: PathBuf,

    /// Output file name prefix
    #[arg(long = "prefix", default_value = DEFAULT_OUTPUT_PREFIX)]
    pub prefix: String,

    /// Overlap scorer command
    #[arg(long = "overlap-scorer")]
    pub overlap_scorer: PathBuf,

    #[command(flatten)]
    pub policy: PolicyArgs,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
pub enum MetricKind {
    /// Semantic similarity against correct/incorrect references, with forced-choice accuracy
    Semantic,
    /// N-gram / LCS overlap against the first reference
    Overlap,
    /// No quality scoring; latency and throughput only
    Latency,
}

impl MetricKind {
    pub fn label(&self) -> &'static str {
        match self {
            MetricKind::Semantic => "semantic",
            MetricKind::Overlap => "overlap",
            MetricKind::Latency => "latency",
        }
    }
}

/// Which count the accuracy ratio is divided by.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, ValueEnum)]
pub enum AccuracyDenominator {
    /// Samples that were actually scored
    #[default]
    Scored,
    /// Every submitted sample, counting harness failures as incorrect
    Submitted,
}

impl AccuracyDenominator {
    pub fn label(&self) -> &'static str {
        match self {
            AccuracyDenominator::Scored => "scored",
            AccuracyDenominator::Submitted => "submitted",
        }
    }
}

// Engine output constants
pub const PERF_LINE_PREFIX: &str = "llama_perf_context_print:";
pub const NON_CONVERSATIONAL_FLAG: &str = "-no-cnv";
pub const DEFAULT_MAX_NEW_TOKENS: u32 = 250;

// Artifact naming
pub const DEFAULT_RUN_DIR: &str = "harness-run";
pub const DEFAULT_OUTPUT_PREFIX: &str = "sample";
pub const OUTPUTS_SUBDIR: &str = "outputs";
pub const PROMPTS_SUBDIR: &str = "prompts";
pub const DEBUG_LOG_FILE: &str = "debug.log";
pub const REPORT_FILE: &str = "report.txt";
pub const REPORT_JSON_FILE: &str = "report.json";
pub const PROMPT_FILE_SUFFIX: &str = ".prompt.txt";

// Inline prompt sanitising
pub const PROMPT_QUOTE_REPLACEMENT: char = ' ';

/// Everything the run driver needs, resolved from [`RunArgs`].
#[derive(Debug, Clone)]
pub struct HarnessConfig {
    pub engine: PathBuf,
    pub run_dir: PathBuf,
    pub output_prefix: String,
    pub metric: MetricKind,
    pub accuracy_denominator: AccuracyDenominator,
    pub pool_exclude_zero_lcs: bool,
    pub trial_timeout: Option<Duration>,
    pub abort_on_trial_failure: bool,
}

impl HarnessConfig {
    pub fn from_args(args: &RunArgs) -> Self {
        HarnessConfig {
            engine: args.engine.clone(),
            run_dir: args.run_dir.clone(),
            output_prefix: DEFAULT_OUTPUT_PREFIX.to_string(),
            metric: args.metric,
            accuracy_denominator: args.policy.accuracy_denominator,
            pool_exclude_zero_lcs: args.policy.pool_exclude_zero_lcs,
            trial_timeout: args.trial_timeout_secs.map(Duration::from_secs),
            abort_on_trial_failure: args.abort_on_trial_failure,
        }
    }

    pub fn outputs_dir(&self) -> PathBuf {
        self.run_dir.join(OUTPUTS_SUBDIR)
    }

    pub fn debug_log_path(&self) -> PathBuf {
        self.run_dir.join(DEBUG_LOG_FILE)
    }

    pub fn report_path(&self) -> PathBuf {
        self.run_dir.join(REPORT_FILE)
    }

    pub fn report_json_path(&self) -> PathBuf {
        self.run_dir.join(REPORT_JSON_FILE)
    }

    pub fn prompts_dir(&self) -> PathBuf {
        self.run_dir.join(PROMPTS_SUBDIR)
    }

    pub fn aggregation_policy(&self) -> AggregationPolicy {
        AggregationPolicy {
            accuracy_denominator: self.accuracy_denominator,
            pool_exclude_zero_lcs: self.pool_exclude_zero_lcs,
        }
    }
}

/// Sample id as it appears in file names. Path separators are flattened so
/// every per-sample file lands directly in its directory.
pub fn flatten_sample_id(sample_id: &str) -> String {
    sample_id.replace(['/', '\\'], "_")
}

pub fn output_file_name(prefix: &str, sample_id: &str) -> String {
    format!("{}_{}.txt", prefix, flatten_sample_id(sample_id))
}

use anyhow::Context;
use clap::Parser;
use std::path::{Path, PathBuf};
use tracing::{error, info, warn};
use tracing_appender::non_blocking::WorkerGuard;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::{EnvFilter, Layer};

use llm_trial_harness::config::{
    CliArgs, Command, HarnessConfig, MetricKind, ParseLogArgs, RunArgs, ScoreOutputsArgs,
};
use llm_trial_harness::dataset::{JsonlDataset, PromptDir, SampleSource};
use llm_trial_harness::engine;
use llm_trial_harness::error::HarnessError;
use llm_trial_harness::perf_log::{extract_records, records_to_csv, Phase, ThroughputSummary};
use llm_trial_harness::scoring::external::{ExternalOverlapScorer, ExternalSemanticScorer};
use llm_trial_harness::scoring::QualityScorer;
use llm_trial_harness::settings::{load_trial_config, TrialConfig};

type Scorer = QualityScorer<ExternalSemanticScorer, ExternalOverlapScorer>;

fn init_tracing(log_file: Option<&Path>) -> anyhow::Result<Option<WorkerGuard>> {
    let filter = || {
        EnvFilter::try_from_default_env().unwrap_or_else(|_| "llm_trial_harness=info".into())
    };

    let mut guard = None;
    let file_layer = match log_file {
        Some(path) => {
            let dir = path
                .parent()
                .filter(|p| !p.as_os_str().is_empty())
                .unwrap_or(Path::new("."));
            let name = path
                .file_name()
                .with_context(|| format!("--log-file {:?} has no file name", path))?;
            std::fs::create_dir_all(dir)?;
            let (writer, g) = tracing_appender::non_blocking(tracing_appender::rolling::never(dir, name));
            guard = Some(g);
            Some(
                tracing_subscriber::fmt::layer()
                    .with_ansi(false)
                    .with_writer(writer)
                    .with_filter(filter()),
            )
        }
        None => None,
    };

    tracing_subscriber::registry()
        .with(tracing_subscriber::fmt::layer().with_filter(filter()))
        .with(file_layer)
        .init();
    Ok(guard)
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let args = CliArgs::parse();
    let _guard = init_tracing(args.log_file.as_deref())?;
    info!("llm-trial-harness v{}", env!("CARGO_PKG_VERSION"));

    match args.command {
        Command::Run(run_args) => run(run_args).await,
        Command::ParseLog(parse_args) => parse_log(&parse_args),
        Command::ScoreOutputs(score_args) => score_outputs(score_args).await,
    }
}

fn sample_source(args: &RunArgs) -> anyhow::Result<Box<dyn SampleSource>> {
    match (&args.dataset, &args.prompt_dir) {
        (Some(path), _) => Ok(Box::new(JsonlDataset {
            path: path.clone(),
            limit: args.limit,
        })),
        (None, Some(dir)) => Ok(Box::new(PromptDir {
            dir: dir.clone(),
            device_prefix: args.device_prompt_prefix.clone(),
            limit: args.limit,
        })),
        (None, None) => anyhow::bail!("one of --dataset or --prompt-dir is required"),
    }
}

fn required_scorer<'a>(path: &'a Option<PathBuf>, flag: &str) -> Result<&'a Path, HarnessError> {
    path.as_deref()
        .ok_or_else(|| HarnessError::ScorerLoad(format!("{} is required for this metric", flag)))
}

async fn load_scorer(args: &RunArgs) -> Result<Scorer, HarnessError> {
    match args.metric {
        MetricKind::Semantic => {
            let cmd = required_scorer(&args.semantic_scorer, "--semantic-scorer")?;
            Ok(QualityScorer::Semantic(ExternalSemanticScorer::load(cmd).await?))
        }
        MetricKind::Overlap => {
            let cmd = required_scorer(&args.overlap_scorer, "--overlap-scorer")?;
            Ok(QualityScorer::Overlap(ExternalOverlapScorer::load(cmd).await?))
        }
        MetricKind::Latency => Ok(QualityScorer::LatencyOnly),
    }
}

async fn shutdown_scorer(scorer: Scorer) {
    match scorer {
        QualityScorer::Semantic(s) => s.0.shutdown().await,
        QualityScorer::Overlap(o) => o.0.shutdown().await,
        QualityScorer::LatencyOnly => {}
    }
}

async fn run(args: RunArgs) -> anyhow::Result<()> {
    let source = sample_source(&args)?;

    let mut trial_config = match &args.trial_config {
        Some(path) => load_trial_config(path)
            .with_context(|| format!("Failed to load trial config {:?}", path))?,
        None => TrialConfig::default(),
    };
    if let Some(n) = args.max_new_tokens {
        trial_config.max_new_tokens = n;
    }
    trial_config.validate()?;

    let samples = source.load()?;
    if samples.is_empty() {
        warn!("{} contains no samples", source.describe());
    }

    let mut scorer = load_scorer(&args).await?;
    let config = HarnessConfig::from_args(&args);
    // Engines run in their own process group, so the terminal's Ctrl-C only
    // reaches us; dropping the run future kills the current trial's group.
    let result = tokio::select! {
        result = engine::run(&config, source.describe(), &samples, &trial_config, &mut scorer) => result,
        _ = tokio::signal::ctrl_c() => {
            warn!("Interrupted, stopping the current trial");
            Err(HarnessError::Interrupted)
        }
    };
    shutdown_scorer(scorer).await;

    match result {
        Ok(report) => {
            info!(
                "Done: {} scored, {} failed of {}",
                report.aggregate.scored, report.aggregate.failed, report.aggregate.total
            );
            Ok(())
        }
        Err(e) => {
            error!("{}", e);
            Err(e.into())
        }
    }
}

fn parse_log(args: &ParseLogArgs) -> anyhow::Result<()> {
    let log = std::fs::read(&args.logfile)
        .with_context(|| format!("Failed to read {:?}", args.logfile))?;
    let log = String::from_utf8_lossy(&log);
    let records = extract_records(&log);
    let summary = ThroughputSummary::from_records(&records);

    for phase in Phase::ALL {
        match summary.get(phase) {
            Some(tps) => println!("Average {} speed: {:.2} tokens/s", phase.as_str(), tps),
            None => println!("No {} records found", phase.as_str()),
        }
    }
    if summary.dropped > 0 {
        println!(
            "{} of {} records had zero time or tokens and were skipped",
            summary.dropped, summary.records
        );
    }

    if let Some(csv) = &args.csv {
        std::fs::write(csv, records_to_csv(&records))
            .with_context(|| format!("Failed to write {:?}", csv))?;
        info!("Wrote {} records to {:?}", records.len(), csv);
    }
    Ok(())
}

async fn score_outputs(args: ScoreOutputsArgs) -> anyhow::Result<()> {
    let samples = JsonlDataset {
        path: args.dataset.clone(),
        limit: None,
    }
    .load()?;

    let mut scorer = ExternalOverlapScorer::load(&args.overlap_scorer).await?;
    let result = engine::score_outputs(&args, &samples, &mut scorer).await;
    scorer.0.shutdown().await;

    let report = result?;
    println!("{}", report);
    if report.aggregate.scored == 0 {
        return Err(HarnessError::NothingScored {
            failed: report.aggregate.failed,
            total: report.aggregate.total,
        }
        .into());
    }
    Ok(())
}

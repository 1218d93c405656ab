use chrono::Utc;
use regex::Regex;
use std::collections::HashMap;
use std::path::Path;
use std::time::Instant;
use tracing::{error, info, warn};

use crate::aggregate::{AggregateReport, Outcome, ResultAggregator};
use crate::config::{flatten_sample_id, HarnessConfig, MetricKind, ScoreOutputsArgs};
use crate::dataset::Sample;
use crate::error::{HarnessError, SampleFailure};
use crate::perf_log::{extract_records, PerfLogRecord, ThroughputSummary};
use crate::report::{LatencyStats, RunReport};
use crate::scoring::{
    ensure_finite, OverlapScorer, OverlapScores, QualityScorer, SampleScores, SemanticScorer,
};
use crate::settings::{effective_config_path, save_trial_config, TrialConfig};
use crate::trial::launcher::{CommandLauncher, ProcessLauncher};
use crate::trial::TrialRunner;

/// Everything collected while walking the samples once.
#[derive(Debug)]
pub struct BenchmarkRun {
    pub aggregate: AggregateReport,
    pub latency: LatencyStats,
    pub perf_records: Vec<PerfLogRecord>,
    /// Set when the run stopped early on a trial failure.
    pub aborted: bool,
}

/// Process one sample end to end and record its outcome. Returns false when
/// the trial failed.
async fn process_sample<L, S, O>(
    sample: &Sample,
    runner: &mut TrialRunner<L>,
    scorer: &mut QualityScorer<S, O>,
    trial_config: &TrialConfig,
    aggregator: &mut ResultAggregator,
    latency: &mut LatencyStats,
    perf_records: &mut Vec<PerfLogRecord>,
) -> bool
where
    L: ProcessLauncher,
    S: SemanticScorer,
    O: OverlapScorer,
{
    let result = runner.invoke(sample, trial_config).await;
    latency.record(&sample.id, result.latency_secs);
    perf_records.extend(extract_records(&result.diagnostics));

    let text = match (result.failure, result.text) {
        (Some(failure), _) => {
            warn!("Sample {} failed: {}", sample.id, failure);
            aggregator.record(&sample.id, Outcome::Failed(failure));
            return false;
        }
        (None, Some(text)) => text,
        (None, None) => {
            aggregator.record(
                &sample.id,
                Outcome::Failed(SampleFailure::OutputRead("no output captured".into())),
            );
            return false;
        }
    };

    match scorer.score_sample(sample, &text).await {
        Ok(scores) => {
            match &scores {
                SampleScores::Semantic(fc) => {
                    info!("    max_score: {:.4}", fc.max_score);
                    info!("    acc: {}", u8::from(fc.is_correct));
                }
                SampleScores::Overlap(o) => info!("    rougeL: {:.4}", o.rouge_l),
                SampleScores::Unscored => {}
            }
            aggregator.record(&sample.id, Outcome::Scored(scores));
        }
        Err(failure) => {
            warn!("Sample {} not scored: {}", sample.id, failure);
            aggregator.record(&sample.id, Outcome::Failed(failure));
        }
    }
    true
}

/// Walk `samples` strictly in order: launch, wait, read, score, record.
pub async fn run_samples<L, S, O>(
    samples: &[Sample],
    runner: &mut TrialRunner<L>,
    scorer: &mut QualityScorer<S, O>,
    trial_config: &TrialConfig,
    config: &HarnessConfig,
) -> BenchmarkRun
where
    L: ProcessLauncher,
    S: SemanticScorer,
    O: OverlapScorer,
{
    let mut aggregator = ResultAggregator::new(config.aggregation_policy());
    let mut latency = LatencyStats::default();
    let mut perf_records = Vec::new();
    let mut aborted = false;

    let started = Instant::now();
    for (i, sample) in samples.iter().enumerate() {
        info!(
            "-------- sample {}/{} ({}) --------",
            i + 1,
            samples.len(),
            sample.id
        );
        let ok = process_sample(
            sample,
            runner,
            scorer,
            trial_config,
            &mut aggregator,
            &mut latency,
            &mut perf_records,
        )
        .await;

        if !ok && config.abort_on_trial_failure {
            error!(
                "Stopping after failed trial for sample {} ({} of {} samples not run)",
                sample.id,
                samples.len() - i - 1,
                samples.len()
            );
            aborted = true;
            break;
        }
    }
    latency.total_wall_secs = started.elapsed().as_secs_f64();

    BenchmarkRun {
        aggregate: aggregator.finalize(),
        latency,
        perf_records,
        aborted,
    }
}

/// Full run with the given launcher: prepare the run directory, walk the
/// samples, write the report. Fails with `NothingScored` (after the report
/// is written) when no sample could be scored.
pub async fn run_with<L, S, O>(
    launcher: L,
    config: &HarnessConfig,
    source: String,
    samples: &[Sample],
    trial_config: &TrialConfig,
    scorer: &mut QualityScorer<S, O>,
) -> Result<RunReport, HarnessError>
where
    L: ProcessLauncher,
    S: SemanticScorer,
    O: OverlapScorer,
{
    std::fs::create_dir_all(config.outputs_dir())?;
    save_trial_config(&effective_config_path(config), trial_config);

    let run_id = uuid::Uuid::new_v4().to_string();
    let started_at = Utc::now();
    info!(
        "Run {}: {} samples from {}, metric {}",
        run_id,
        samples.len(),
        source,
        config.metric.label()
    );

    let mut runner = TrialRunner::new(
        launcher,
        config.engine.clone(),
        config.outputs_dir(),
        config.prompts_dir(),
        config.output_prefix.clone(),
        config.trial_timeout,
    );
    let run = run_samples(samples, &mut runner, scorer, trial_config, config).await;
    drop(runner.into_launcher());

    let throughput = ThroughputSummary::from_records(&run.perf_records);
    let report = RunReport {
        run_id,
        started_at,
        finished_at: Utc::now(),
        source,
        metric: config.metric.label().to_string(),
        trial_config: Some(trial_config.clone()),
        aggregate: run.aggregate,
        latency: Some(run.latency),
        throughput: Some(throughput),
    };

    report.write(&config.report_path(), &config.report_json_path())?;
    println!("{}", report);
    info!("Report written to {:?}", config.report_path());

    if report.aggregate.scored == 0 {
        return Err(HarnessError::NothingScored {
            failed: report.aggregate.failed,
            total: report.aggregate.total,
        });
    }
    if config.metric != MetricKind::Latency && report.aggregate.metric_means.is_empty() {
        warn!("No quality metric was produced for this run");
    }
    Ok(report)
}

/// Run against the real engine, with every process's diagnostics going to
/// the run's debug log.
pub async fn run<S, O>(
    config: &HarnessConfig,
    source: String,
    samples: &[Sample],
    trial_config: &TrialConfig,
    scorer: &mut QualityScorer<S, O>,
) -> Result<RunReport, HarnessError>
where
    S: SemanticScorer,
    O: OverlapScorer,
{
    std::fs::create_dir_all(&config.run_dir)?;
    let launcher = CommandLauncher::open(&config.debug_log_path())?;
    run_with(launcher, config, source, samples, trial_config, scorer).await
}

/// Map `<prefix>_<id>.txt` file names in `dir` to sample ids.
pub fn scan_outputs(dir: &Path, prefix: &str) -> Result<HashMap<String, String>, HarnessError> {
    let pattern = Regex::new(&format!(r"^{}_(.+)\.txt$", regex::escape(prefix)))
        .map_err(|e| HarnessError::Config(format!("bad output prefix {:?}: {}", prefix, e)))?;

    let mut found = HashMap::new();
    for entry in std::fs::read_dir(dir)? {
        let entry = entry?;
        if !entry.file_type()?.is_file() {
            continue;
        }
        let name = entry.file_name().to_string_lossy().into_owned();
        match pattern.captures(&name) {
            Some(caps) => {
                let text = std::fs::read_to_string(entry.path())?;
                found.insert(caps[1].to_string(), text);
            }
            None => warn!("Skipping unrecognised file {}", name),
        }
    }
    Ok(found)
}

/// Score previously generated outputs against dataset references with the
/// overlap metric. Samples are visited in dataset order; ids with no output
/// file are not submitted.
pub async fn score_outputs<O: OverlapScorer>(
    args: &ScoreOutputsArgs,
    samples: &[Sample],
    scorer: &mut O,
) -> Result<RunReport, HarnessError> {
    let started_at = Utc::now();
    let mut outputs = scan_outputs(&args.output_dir, &args.prefix)?;
    let mut aggregator = ResultAggregator::new(args.policy.aggregation_policy());

    // Dataset order; `None` marks a sample waiting on the batch call.
    let mut submitted: Vec<(String, Option<SampleFailure>)> = Vec::new();
    let mut predictions = Vec::new();
    let mut references = Vec::new();

    for sample in samples {
        let Some(text) = outputs.remove(&flatten_sample_id(&sample.id)) else {
            continue;
        };
        let Some(reference) = sample.primary_reference() else {
            warn!("Sample {} has no reference, skipping", sample.id);
            continue;
        };
        let prediction = text.trim();
        if prediction.is_empty() {
            submitted.push((sample.id.clone(), Some(SampleFailure::EmptyPrediction)));
            continue;
        }
        submitted.push((sample.id.clone(), None));
        predictions.push(prediction.to_string());
        references.push(reference.to_string());
    }
    for id in outputs.keys() {
        warn!("Output for id {} has no matching dataset sample", id);
    }

    let batch: Vec<Result<OverlapScores, SampleFailure>> = if predictions.is_empty() {
        Vec::new()
    } else {
        info!("Scoring {} outputs from {:?}", predictions.len(), args.output_dir);
        match scorer.score_batch(&predictions, &references).await {
            Ok(scores) if scores.len() == predictions.len() => scores
                .into_iter()
                .map(|s| ensure_finite(&s.named().map(|(_, v)| v)).map(|_| s))
                .collect(),
            Ok(scores) => {
                let reason = format!("expected {} records, got {}", predictions.len(), scores.len());
                vec![Err(SampleFailure::Scoring(reason)); predictions.len()]
            }
            Err(e) => {
                error!("Overlap scoring failed: {}", e);
                vec![Err(SampleFailure::Scoring(e.to_string())); predictions.len()]
            }
        }
    };

    let mut batch = batch.into_iter();
    for (id, early) in submitted {
        let outcome = match early.map(Err).or_else(|| batch.next()) {
            Some(Ok(scores)) => Outcome::Scored(SampleScores::Overlap(scores)),
            Some(Err(failure)) => Outcome::Failed(failure),
            None => Outcome::Failed(SampleFailure::Scoring("no score returned".to_string())),
        };
        aggregator.record(id, outcome);
    }

    Ok(RunReport {
        run_id: uuid::Uuid::new_v4().to_string(),
        started_at,
        finished_at: Utc::now(),
        source: format!("outputs:{}", args.output_dir.display()),
        metric: MetricKind::Overlap.label().to_string(),
        trial_config: None,
        aggregate: aggregator.finalize(),
        latency: None,
        throughput: None,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn test_scan_outputs_matches_prefix() {
        let dir = TempDir::new().unwrap();
        std::fs::write(dir.path().join("sample_0.txt"), "a").unwrap();
        std::fs::write(dir.path().join("sample_q_12.txt"), "b").unwrap();
        std::fs::write(dir.path().join("other_1.txt"), "c").unwrap();
        std::fs::write(dir.path().join("sample_2.log"), "d").unwrap();

        let found = scan_outputs(dir.path(), "sample").unwrap();
        assert_eq!(found.len(), 2);
        assert_eq!(found["0"], "a");
        assert_eq!(found["q_12"], "b");
    }

    #[test]
    fn test_scan_outputs_escapes_prefix() {
        let dir = TempDir::new().unwrap();
        std::fs::write(dir.path().join("run.1_7.txt"), "x").unwrap();
        std::fs::write(dir.path().join("runX1_8.txt"), "y").unwrap();

        let found = scan_outputs(dir.path(), "run.1").unwrap();
        assert_eq!(found.len(), 1);
        assert!(found.contains_key("7"));
    }
}

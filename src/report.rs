//! Final run report: a human-readable summary followed by a `KEY=value`
//! trailer that sweep tooling can grep without parsing the rest.

use chrono::{DateTime, Utc};
use serde::Serialize;
use std::fmt;
use std::path::Path;

use crate::aggregate::AggregateReport;
use crate::perf_log::{Phase, ThroughputSummary};
use crate::settings::TrialConfig;

#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct LatencyStats {
    /// Every attempted trial, failed ones included, in dataset order.
    pub per_sample: Vec<(String, f64)>,
    pub total_wall_secs: f64,
}

impl LatencyStats {
    pub fn record(&mut self, sample_id: &str, latency_secs: f64) {
        self.per_sample.push((sample_id.to_string(), latency_secs));
    }

    pub fn mean(&self) -> Option<f64> {
        if self.per_sample.is_empty() {
            return None;
        }
        let sum: f64 = self.per_sample.iter().map(|(_, l)| l).sum();
        Some(sum / self.per_sample.len() as f64)
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct RunReport {
    pub run_id: String,
    pub started_at: DateTime<Utc>,
    pub finished_at: DateTime<Utc>,
    pub source: String,
    pub metric: String,
    pub trial_config: Option<TrialConfig>,
    pub aggregate: AggregateReport,
    pub latency: Option<LatencyStats>,
    pub throughput: Option<ThroughputSummary>,
}

impl RunReport {
    /// Machine-parseable key/value pairs. Keys whose value does not exist
    /// for this run (no data) are omitted rather than printed as zero.
    pub fn trailer(&self) -> Vec<(&'static str, String)> {
        let agg = &self.aggregate;
        let mut out: Vec<(&'static str, String)> = Vec::new();

        if let Some(v) = agg.metric_means.get("max_score") {
            out.push(("SEMANTIC_AVG", v.to_string()));
        }
        if let Some(acc) = &agg.accuracy {
            out.push(("ACCURACY", acc.ratio.to_string()));
            out.push(("ACCURACY_DENOMINATOR", acc.denominator_kind.to_string()));
        }
        if let Some(pooled) = &agg.pooled_overlap {
            out.push(("ROUGE1", pooled.scores.rouge1.to_string()));
            out.push(("ROUGE2", pooled.scores.rouge2.to_string()));
            out.push(("ROUGEL", pooled.scores.rouge_l.to_string()));
            out.push(("ROUGELSUM", pooled.scores.rouge_lsum.to_string()));
        }
        if let Some(mean) = self.latency.as_ref().and_then(LatencyStats::mean) {
            out.push(("AVG_LATENCY_S", mean.to_string()));
        }
        if let Some(tp) = &self.throughput {
            for (key, phase) in [
                ("PREFILL_TPS", Phase::Prefill),
                ("DECODE_TPS", Phase::Decode),
                ("TOTAL_TPS", Phase::Total),
            ] {
                if let Some(v) = tp.get(phase) {
                    out.push((key, v.to_string()));
                }
            }
        }
        out.push(("SCORED", agg.scored.to_string()));
        out.push(("FAILED", agg.failed.to_string()));
        out.push(("TOTAL", agg.total.to_string()));
        out
    }

    pub fn write(&self, text_path: &Path, json_path: &Path) -> std::io::Result<()> {
        std::fs::write(text_path, self.to_string())?;
        let json = serde_json::to_string_pretty(self)
            .map_err(|e| std::io::Error::new(std::io::ErrorKind::Other, e))?;
        std::fs::write(json_path, json)
    }
}

fn fmt_opt(v: Option<f64>, precision: usize) -> String {
    match v {
        Some(v) => format!("{:.*}", precision, v),
        None => "no data".to_string(),
    }
}

impl fmt::Display for RunReport {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let agg = &self.aggregate;

        writeln!(f, "=== Benchmark Summary ===")?;
        writeln!(f, "Run:      {}", self.run_id)?;
        writeln!(f, "Source:   {}", self.source)?;
        writeln!(f, "Metric:   {}", self.metric)?;
        writeln!(
            f,
            "Started:  {}",
            self.started_at.format("%Y-%m-%d %H:%M:%S UTC")
        )?;
        writeln!(
            f,
            "Finished: {}",
            self.finished_at.format("%Y-%m-%d %H:%M:%S UTC")
        )?;
        writeln!(f)?;

        writeln!(
            f,
            "Samples: {} submitted, {} scored, {} failed ({} trial, {} scoring)",
            agg.total, agg.scored, agg.failed, agg.trial_failures, agg.scoring_failures
        )?;
        for failed in &agg.failures {
            writeln!(f, "  failed {}: {}", failed.sample_id, failed.failure)?;
        }
        writeln!(f)?;

        if let Some(latency) = &self.latency {
            writeln!(f, "--- Latency ---")?;
            for (id, secs) in &latency.per_sample {
                writeln!(f, "{}: {:.3} s", id, secs)?;
            }
            writeln!(
                f,
                "Total time for {} samples: {:.3} s",
                latency.per_sample.len(),
                latency.total_wall_secs
            )?;
            writeln!(f, "Average latency: {} s", fmt_opt(latency.mean(), 3))?;
            writeln!(f)?;
        }

        if let Some(tp) = &self.throughput {
            writeln!(f, "--- Throughput ---")?;
            writeln!(f, "Average Prefill Speed: {} tokens/s", fmt_opt(tp.prefill_tps, 2))?;
            writeln!(f, "Average Decode Speed: {} tokens/s", fmt_opt(tp.decode_tps, 2))?;
            writeln!(f, "Average Total Speed: {} tokens/s", fmt_opt(tp.total_tps, 2))?;
            if tp.dropped > 0 {
                writeln!(
                    f,
                    "({} of {} perf records had zero time or tokens and were skipped)",
                    tp.dropped, tp.records
                )?;
            }
            writeln!(f)?;
        }

        writeln!(f, "--- Quality ---")?;
        if agg.metric_means.is_empty() {
            writeln!(f, "No scored samples.")?;
        }
        for (name, mean) in &agg.metric_means {
            writeln!(f, "avg {}: {:.4} (over {} scored)", name, mean, agg.scored)?;
        }
        if let Some(acc) = &agg.accuracy {
            writeln!(
                f,
                "avg accuracy: {:.3} ({} correct / {} {})",
                acc.ratio, acc.correct, acc.denominator, acc.denominator_kind
            )?;
        }
        if let Some(pooled) = &agg.pooled_overlap {
            write!(f, "pooled overlap over {} samples", pooled.pooled)?;
            if pooled.excluded_zero_lcs > 0 {
                write!(f, " (excluding {} with ROUGE-L = 0)", pooled.excluded_zero_lcs)?;
            }
            writeln!(f, ":")?;
            writeln!(
                f,
                "ROUGE-L (F1): {:.4}",
                pooled.scores.rouge_l
            )?;
            writeln!(
                f,
                "ROUGE-1: {:.4}, ROUGE-2: {:.4}, ROUGE-Lsum: {:.4}",
                pooled.scores.rouge1, pooled.scores.rouge2, pooled.scores.rouge_lsum
            )?;
        }

        let rouge_l: Vec<_> = agg.per_sample.iter().filter(|r| r.metric == "rougeL").collect();
        if !rouge_l.is_empty() {
            writeln!(f)?;
            writeln!(f, "--- ROUGE-L per sample ---")?;
            for r in rouge_l {
                writeln!(f, "Sample {}: ROUGE-L = {:.4}", r.sample_id, r.value)?;
            }
        }

        writeln!(f)?;
        writeln!(f, "=======================================")?;
        for (key, value) in self.trailer() {
            writeln!(f, "{}={}", key, value)?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::aggregate::{AggregationPolicy, Outcome, ResultAggregator};
    use crate::error::SampleFailure;
    use crate::scoring::{ForcedChoice, SampleScores};

    fn report() -> RunReport {
        let mut agg = ResultAggregator::new(AggregationPolicy::default());
        agg.record(
            "0",
            Outcome::Scored(SampleScores::Semantic(ForcedChoice {
                max_score: -0.25,
                is_correct: true,
            })),
        );
        agg.record("1", Outcome::Failed(SampleFailure::NonZeroExit(Some(1))));

        let mut latency = LatencyStats::default();
        latency.record("0", 1.0);
        latency.record("1", 3.0);
        latency.total_wall_secs = 4.5;

        RunReport {
            run_id: "run".into(),
            started_at: Utc::now(),
            finished_at: Utc::now(),
            source: "jsonl:data.jsonl".into(),
            metric: "semantic".into(),
            trial_config: None,
            aggregate: agg.finalize(),
            latency: Some(latency),
            throughput: Some(ThroughputSummary::default()),
        }
    }

    #[test]
    fn test_trailer_keys() {
        let trailer = report().trailer();
        let get = |k: &str| trailer.iter().find(|(key, _)| *key == k).map(|(_, v)| v.clone());
        assert_eq!(get("SEMANTIC_AVG").as_deref(), Some("-0.25"));
        assert_eq!(get("ACCURACY").as_deref(), Some("1"));
        assert_eq!(get("ACCURACY_DENOMINATOR").as_deref(), Some("scored"));
        assert_eq!(get("AVG_LATENCY_S").as_deref(), Some("2"));
        assert_eq!(get("SCORED").as_deref(), Some("1"));
        assert_eq!(get("FAILED").as_deref(), Some("1"));
        assert_eq!(get("TOTAL").as_deref(), Some("2"));
        assert!(get("DECODE_TPS").is_none());
        assert!(get("ROUGEL").is_none());
    }

    #[test]
    fn test_summary_ends_with_trailer() {
        let text = report().to_string();
        assert!(text.contains("1 scored, 1 failed"));
        assert!(text.contains("failed 1: engine exited with status 1"));
        assert!(text.contains("Average Decode Speed: no data tokens/s"));
        assert!(text.trim_end().ends_with("TOTAL=2"));
    }
}

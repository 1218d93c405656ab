use serde::Serialize;
use std::collections::BTreeMap;

use crate::config::AccuracyDenominator;
use crate::error::SampleFailure;
use crate::scoring::{pool_overlap, OverlapScores, PooledOverlap, SampleScores};

/// What happened to one submitted sample.
#[derive(Debug, Clone, PartialEq)]
pub enum Outcome {
    Failed(SampleFailure),
    Scored(SampleScores),
}

/// One per-sample metric value.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ScoreRecord {
    pub sample_id: String,
    pub metric: String,
    pub value: f64,
}

#[derive(Debug, Clone, Copy, Default)]
pub struct AggregationPolicy {
    pub accuracy_denominator: AccuracyDenominator,
    pub pool_exclude_zero_lcs: bool,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Accuracy {
    pub correct: usize,
    pub denominator: usize,
    pub denominator_kind: &'static str,
    pub ratio: f64,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct FailedSample {
    pub sample_id: String,
    pub failure: SampleFailure,
}

/// Final statistics. `scored + failed == total` always holds.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct AggregateReport {
    pub total: usize,
    pub scored: usize,
    pub failed: usize,
    pub trial_failures: usize,
    pub scoring_failures: usize,
    /// Arithmetic mean of each continuous metric over scored samples.
    pub metric_means: BTreeMap<String, f64>,
    /// Present when the metric has a correct/incorrect classification.
    pub accuracy: Option<Accuracy>,
    pub pooled_overlap: Option<PooledOverlap>,
    pub per_sample: Vec<ScoreRecord>,
    pub failures: Vec<FailedSample>,
}

/// Collects outcomes in submission order.
#[derive(Debug, Default)]
pub struct ResultAggregator {
    policy: AggregationPolicy,
    outcomes: Vec<(String, Outcome)>,
}

impl ResultAggregator {
    pub fn new(policy: AggregationPolicy) -> Self {
        Self {
            policy,
            outcomes: Vec::new(),
        }
    }

    pub fn record(&mut self, sample_id: impl Into<String>, outcome: Outcome) {
        self.outcomes.push((sample_id.into(), outcome));
    }

    pub fn submitted(&self) -> usize {
        self.outcomes.len()
    }

    pub fn scored(&self) -> usize {
        self.outcomes
            .iter()
            .filter(|(_, o)| matches!(o, Outcome::Scored(_)))
            .count()
    }

    pub fn finalize(&self) -> AggregateReport {
        let total = self.outcomes.len();

        let mut sums: BTreeMap<String, (f64, usize)> = BTreeMap::new();
        let mut per_sample = Vec::new();
        let mut failures = Vec::new();
        let mut overlap: Vec<OverlapScores> = Vec::new();
        let mut classified = 0usize;
        let mut correct = 0usize;
        let mut scored = 0usize;

        for (sample_id, outcome) in &self.outcomes {
            let scores = match outcome {
                Outcome::Failed(failure) => {
                    failures.push(FailedSample {
                        sample_id: sample_id.clone(),
                        failure: failure.clone(),
                    });
                    continue;
                }
                Outcome::Scored(scores) => scores,
            };
            scored += 1;

            for (name, value) in scores.scalars() {
                let entry = sums.entry(name.to_string()).or_insert((0.0, 0));
                entry.0 += value;
                entry.1 += 1;
                per_sample.push(ScoreRecord {
                    sample_id: sample_id.clone(),
                    metric: name.to_string(),
                    value,
                });
            }
            if let Some(is_correct) = scores.is_correct() {
                classified += 1;
                if is_correct {
                    correct += 1;
                }
                per_sample.push(ScoreRecord {
                    sample_id: sample_id.clone(),
                    metric: "is_correct".to_string(),
                    value: if is_correct { 1.0 } else { 0.0 },
                });
            }
            if let SampleScores::Overlap(o) = scores {
                overlap.push(*o);
            }
        }

        let metric_means = sums
            .into_iter()
            .map(|(name, (sum, n))| (name, sum / n as f64))
            .collect();

        let accuracy = (classified > 0).then(|| {
            let denominator = match self.policy.accuracy_denominator {
                AccuracyDenominator::Scored => scored,
                AccuracyDenominator::Submitted => total,
            };
            Accuracy {
                correct,
                denominator,
                denominator_kind: self.policy.accuracy_denominator.label(),
                ratio: if denominator == 0 {
                    0.0
                } else {
                    correct as f64 / denominator as f64
                },
            }
        });

        let pooled_overlap =
            (!overlap.is_empty()).then(|| pool_overlap(&overlap, self.policy.pool_exclude_zero_lcs));

        let trial_failures = failures
            .iter()
            .filter(|f| f.failure.is_trial_failure())
            .count();

        AggregateReport {
            total,
            scored,
            failed: failures.len(),
            trial_failures,
            scoring_failures: failures.len() - trial_failures,
            metric_means,
            accuracy,
            pooled_overlap,
            per_sample,
            failures,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::scoring::ForcedChoice;

    fn semantic(max_score: f64, is_correct: bool) -> Outcome {
        Outcome::Scored(SampleScores::Semantic(ForcedChoice {
            max_score,
            is_correct,
        }))
    }

    #[test]
    fn test_empty_finalize_is_defined() {
        let report = ResultAggregator::new(AggregationPolicy::default()).finalize();
        assert_eq!(report.total, 0);
        assert_eq!(report.scored, 0);
        assert_eq!(report.failed, 0);
        assert!(report.metric_means.is_empty());
        assert!(report.accuracy.is_none());
        assert!(report.pooled_overlap.is_none());
    }

    #[test]
    fn test_all_failed_is_defined() {
        let mut agg = ResultAggregator::new(AggregationPolicy {
            accuracy_denominator: AccuracyDenominator::Submitted,
            ..Default::default()
        });
        agg.record("0", Outcome::Failed(SampleFailure::NonZeroExit(Some(1))));
        agg.record("1", Outcome::Failed(SampleFailure::EmptyPrediction));
        let report = agg.finalize();
        assert_eq!(report.scored, 0);
        assert_eq!(report.failed, 2);
        assert_eq!(report.trial_failures, 1);
        assert_eq!(report.scoring_failures, 1);
        assert!(report.accuracy.is_none());
    }

    #[test]
    fn test_accuracy_uses_scored_denominator_by_default() {
        let mut agg = ResultAggregator::new(AggregationPolicy::default());
        agg.record("1", semantic(0.4, true));
        agg.record("2", Outcome::Failed(SampleFailure::NonZeroExit(Some(2))));
        agg.record("3", semantic(0.2, false));
        let report = agg.finalize();

        assert_eq!(report.scored + report.failed, report.total);
        let acc = report.accuracy.unwrap();
        assert_eq!(acc.correct, 1);
        assert_eq!(acc.denominator, 2);
        assert_eq!(acc.denominator_kind, "scored");
        assert!((acc.ratio - 0.5).abs() < 1e-12);
        assert!((report.metric_means["max_score"] - 0.3).abs() < 1e-12);
    }

    #[test]
    fn test_submitted_denominator_is_opt_in() {
        let mut agg = ResultAggregator::new(AggregationPolicy {
            accuracy_denominator: AccuracyDenominator::Submitted,
            ..Default::default()
        });
        agg.record("1", semantic(0.4, true));
        agg.record("2", Outcome::Failed(SampleFailure::TimedOut(30)));
        agg.record("3", semantic(0.2, true));
        let acc = agg.finalize().accuracy.unwrap();
        assert_eq!(acc.denominator, 3);
        assert_eq!(acc.denominator_kind, "submitted");
        assert!((acc.ratio - 2.0 / 3.0).abs() < 1e-12);
    }

    #[test]
    fn test_per_sample_keeps_zero_lcs_samples() {
        let mut agg = ResultAggregator::new(AggregationPolicy {
            pool_exclude_zero_lcs: true,
            ..Default::default()
        });
        for (id, l) in [("a", 0.3), ("b", 0.0), ("c", 0.5)] {
            agg.record(
                id,
                Outcome::Scored(SampleScores::Overlap(OverlapScores {
                    rouge1: l,
                    rouge2: l,
                    rouge_l: l,
                    rouge_lsum: l,
                })),
            );
        }
        let report = agg.finalize();
        let rouge_l_rows = report
            .per_sample
            .iter()
            .filter(|r| r.metric == "rougeL")
            .count();
        assert_eq!(rouge_l_rows, 3);

        let pooled = report.pooled_overlap.unwrap();
        assert_eq!(pooled.pooled, 2);
        assert!((pooled.scores.rouge_l - 0.4).abs() < 1e-12);
        // The plain mean still covers every scored sample.
        assert!((report.metric_means["rougeL"] - 0.8 / 3.0).abs() < 1e-12);
        assert!(report.accuracy.is_none());
    }
}

pub mod external;

use serde::{Deserialize, Serialize};

use crate::dataset::Sample;
use crate::error::{HarnessError, SampleFailure};

/// Batch semantic-similarity model. One score per (prediction, reference)
/// pair, in input order.
#[allow(async_fn_in_trait)]
pub trait SemanticScorer {
    async fn score_batch(
        &mut self,
        predictions: &[String],
        references: &[String],
    ) -> Result<Vec<f64>, HarnessError>;

    /// Score one prediction against every reference by repeating it once
    /// per reference in a single batch call.
    async fn score(&mut self, prediction: &str, references: &[String]) -> Result<Vec<f64>, HarnessError> {
        let predictions = vec![prediction.to_string(); references.len()];
        let scores = self.score_batch(&predictions, references).await?;
        if scores.len() != references.len() {
            return Err(HarnessError::Scorer(format!(
                "expected {} scores, got {}",
                references.len(),
                scores.len()
            )));
        }
        Ok(scores)
    }
}

/// N-gram / longest-common-subsequence overlap between a prediction and a
/// single reference.
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
pub struct OverlapScores {
    pub rouge1: f64,
    pub rouge2: f64,
    #[serde(rename = "rougeL")]
    pub rouge_l: f64,
    #[serde(rename = "rougeLsum")]
    pub rouge_lsum: f64,
}

impl OverlapScores {
    pub fn named(&self) -> [(&'static str, f64); 4] {
        [
            ("rouge1", self.rouge1),
            ("rouge2", self.rouge2),
            ("rougeL", self.rouge_l),
            ("rougeLsum", self.rouge_lsum),
        ]
    }
}

#[allow(async_fn_in_trait)]
pub trait OverlapScorer {
    async fn score_batch(
        &mut self,
        predictions: &[String],
        references: &[String],
    ) -> Result<Vec<OverlapScores>, HarnessError>;

    async fn score(&mut self, prediction: &str, reference: &str) -> Result<OverlapScores, HarnessError> {
        let mut scores = self
            .score_batch(&[prediction.to_string()], &[reference.to_string()])
            .await?;
        match (scores.pop(), scores.is_empty()) {
            (Some(s), true) => Ok(s),
            _ => Err(HarnessError::Scorer(
                "expected exactly one overlap record".to_string(),
            )),
        }
    }
}

/// Forced-choice result for one prediction.
#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct ForcedChoice {
    pub max_score: f64,
    pub is_correct: bool,
}

fn max_of(scores: &[f64]) -> f64 {
    scores.iter().copied().fold(f64::NEG_INFINITY, f64::max)
}

/// Correct only when the best correct-reference score is strictly greater
/// than the best incorrect-reference score. Ties count as incorrect.
/// `None` when either set is empty.
pub fn forced_choice(scores_correct: &[f64], scores_incorrect: &[f64]) -> Option<ForcedChoice> {
    if scores_correct.is_empty() || scores_incorrect.is_empty() {
        return None;
    }
    let max_score = max_of(scores_correct);
    Some(ForcedChoice {
        max_score,
        is_correct: max_score > max_of(scores_incorrect),
    })
}

/// Scorer output must be finite to be averaged.
pub fn ensure_finite(scores: &[f64]) -> Result<(), SampleFailure> {
    match scores.iter().find(|s| !s.is_finite()) {
        Some(bad) => Err(SampleFailure::Scoring(format!(
            "scorer returned non-finite value {}",
            bad
        ))),
        None => Ok(()),
    }
}

/// Mean overlap over a set of samples.
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize)]
pub struct PooledOverlap {
    pub scores: OverlapScores,
    pub pooled: usize,
    pub excluded_zero_lcs: usize,
}

/// Pool per-sample overlap records. With `exclude_zero_lcs`, samples whose
/// ROUGE-L is exactly 0.0 are left out of the mean (but still counted in
/// `excluded_zero_lcs`). An empty pool yields all zeros.
pub fn pool_overlap(per_sample: &[OverlapScores], exclude_zero_lcs: bool) -> PooledOverlap {
    let kept: Vec<&OverlapScores> = per_sample
        .iter()
        .filter(|s| !(exclude_zero_lcs && s.rouge_l == 0.0))
        .collect();
    let excluded_zero_lcs = per_sample.len() - kept.len();

    if kept.is_empty() {
        return PooledOverlap {
            scores: OverlapScores::default(),
            pooled: 0,
            excluded_zero_lcs,
        };
    }

    let n = kept.len() as f64;
    let mean = |f: fn(&OverlapScores) -> f64| kept.iter().map(|s| f(s)).sum::<f64>() / n;
    PooledOverlap {
        scores: OverlapScores {
            rouge1: mean(|s| s.rouge1),
            rouge2: mean(|s| s.rouge2),
            rouge_l: mean(|s| s.rouge_l),
            rouge_lsum: mean(|s| s.rouge_lsum),
        },
        pooled: kept.len(),
        excluded_zero_lcs,
    }
}

/// Per-sample metric values.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "metric", rename_all = "snake_case")]
pub enum SampleScores {
    Semantic(ForcedChoice),
    Overlap(OverlapScores),
    /// Latency/throughput-only runs.
    Unscored,
}

impl SampleScores {
    /// Continuous metrics, averaged by the aggregator.
    pub fn scalars(&self) -> Vec<(&'static str, f64)> {
        match self {
            SampleScores::Semantic(fc) => vec![("max_score", fc.max_score)],
            SampleScores::Overlap(o) => o.named().to_vec(),
            SampleScores::Unscored => Vec::new(),
        }
    }

    /// Classification-style metric, when the strategy has one.
    pub fn is_correct(&self) -> Option<bool> {
        match self {
            SampleScores::Semantic(fc) => Some(fc.is_correct),
            _ => None,
        }
    }
}

/// The quality metric for a run, over concrete scorer adapters.
pub enum QualityScorer<S, O> {
    Semantic(S),
    Overlap(O),
    LatencyOnly,
}

impl<S: SemanticScorer, O: OverlapScorer> QualityScorer<S, O> {
    /// Score one prediction. Empty predictions and missing references are
    /// rejected before the external model is called.
    pub async fn score_sample(
        &mut self,
        sample: &Sample,
        prediction: &str,
    ) -> Result<SampleScores, SampleFailure> {
        if matches!(self, QualityScorer::LatencyOnly) {
            return Ok(SampleScores::Unscored);
        }
        if prediction.trim().is_empty() {
            return Err(SampleFailure::EmptyPrediction);
        }

        match self {
            QualityScorer::Semantic(scorer) => {
                if sample.correct_answers.is_empty() || sample.incorrect_answers.is_empty() {
                    return Err(SampleFailure::MissingReferences);
                }
                let scores_correct = scorer
                    .score(prediction, &sample.correct_answers)
                    .await
                    .map_err(|e| SampleFailure::Scoring(e.to_string()))?;
                let scores_incorrect = scorer
                    .score(prediction, &sample.incorrect_answers)
                    .await
                    .map_err(|e| SampleFailure::Scoring(e.to_string()))?;
                ensure_finite(&scores_correct)?;
                ensure_finite(&scores_incorrect)?;
                forced_choice(&scores_correct, &scores_incorrect)
                    .map(SampleScores::Semantic)
                    .ok_or(SampleFailure::MissingReferences)
            }
            QualityScorer::Overlap(scorer) => {
                let reference = sample
                    .primary_reference()
                    .ok_or(SampleFailure::MissingReferences)?;
                let scores = scorer
                    .score(prediction, reference)
                    .await
                    .map_err(|e| SampleFailure::Scoring(e.to_string()))?;
                ensure_finite(&scores.named().map(|(_, v)| v))?;
                Ok(SampleScores::Overlap(scores))
            }
            QualityScorer::LatencyOnly => Ok(SampleScores::Unscored),
        }
    }
}

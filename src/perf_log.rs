use regex::Regex;
use serde::Serialize;
use std::sync::LazyLock;

use crate::config::PERF_LINE_PREFIX;

// Signed decimal or integer with an optional exponent.
static NUMBER_PATTERN: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"[+-]?(?:\d+\.\d*|\.\d+|\d+)(?:[eE][+-]?\d+)?").unwrap()
});

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum Phase {
    Prefill,
    Decode,
    Total,
}

impl Phase {
    pub const ALL: [Phase; 3] = [Phase::Prefill, Phase::Decode, Phase::Total];

    pub fn as_str(&self) -> &'static str {
        match self {
            Phase::Prefill => "prefill",
            Phase::Decode => "decode",
            Phase::Total => "total",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct PerfLogRecord {
    pub phase: Phase,
    pub time_ms: f64,
    pub token_count: u64,
    pub line: String,
}

impl PerfLogRecord {
    /// Tokens per second, or `None` for records that would divide by zero
    /// or carry no work.
    pub fn tokens_per_sec(&self) -> Option<f64> {
        if self.time_ms > 0.0 && self.token_count > 0 {
            Some(self.token_count as f64 / self.time_ms * 1000.0)
        } else {
            None
        }
    }
}

/// Phase of a perf-summary line. "prompt eval" wins over "total", which
/// wins over a bare "eval".
pub fn classify_phase(line: &str) -> Option<Phase> {
    if !line.starts_with(PERF_LINE_PREFIX) {
        return None;
    }
    if line.contains("prompt eval") {
        Some(Phase::Prefill)
    } else if line.contains("total") {
        Some(Phase::Total)
    } else if line.contains("eval") {
        Some(Phase::Decode)
    } else {
        None
    }
}

/// First floating literal and first integral literal on the line. Either
/// may be absent; a negative first integral counts as absent.
pub fn first_numbers(line: &str) -> (Option<f64>, Option<u64>) {
    let mut float: Option<Option<f64>> = None;
    let mut int: Option<Option<u64>> = None;
    for m in NUMBER_PATTERN.find_iter(line) {
        let s = m.as_str();
        if s.contains('.') || s.contains(['e', 'E']) {
            float.get_or_insert_with(|| s.parse::<f64>().ok());
        } else {
            int.get_or_insert_with(|| s.parse::<u64>().ok());
        }
        if float.is_some() && int.is_some() {
            break;
        }
    }
    (float.flatten(), int.flatten())
}

pub fn classify_and_extract(line: &str) -> Option<(Phase, f64, u64)> {
    let phase = classify_phase(line)?;
    match first_numbers(line) {
        (Some(time_ms), Some(tokens)) => Some((phase, time_ms, tokens)),
        _ => None,
    }
}

pub fn extract_records(log: &str) -> Vec<PerfLogRecord> {
    log.lines()
        .filter_map(|line| {
            let line = line.trim_end();
            classify_and_extract(line).map(|(phase, time_ms, token_count)| PerfLogRecord {
                phase,
                time_ms,
                token_count,
                line: line.to_string(),
            })
        })
        .collect()
}

/// Mean tokens/s over usable records, `None` when there are none.
pub fn aggregate<'a>(records: impl IntoIterator<Item = &'a PerfLogRecord>) -> Option<f64> {
    let (sum, count) = records
        .into_iter()
        .filter_map(PerfLogRecord::tokens_per_sec)
        .fold((0.0, 0usize), |(sum, n), tps| (sum + tps, n + 1));
    if count == 0 {
        None
    } else {
        Some(sum / count as f64)
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct ThroughputSummary {
    pub prefill_tps: Option<f64>,
    pub decode_tps: Option<f64>,
    pub total_tps: Option<f64>,
    pub records: usize,
    pub dropped: usize,
}

impl ThroughputSummary {
    pub fn from_records(records: &[PerfLogRecord]) -> Self {
        let of = |phase: Phase| aggregate(records.iter().filter(|r| r.phase == phase));
        Self {
            prefill_tps: of(Phase::Prefill),
            decode_tps: of(Phase::Decode),
            total_tps: of(Phase::Total),
            records: records.len(),
            dropped: records.iter().filter(|r| r.tokens_per_sec().is_none()).count(),
        }
    }

    pub fn get(&self, phase: Phase) -> Option<f64> {
        match phase {
            Phase::Prefill => self.prefill_tps,
            Phase::Decode => self.decode_tps,
            Phase::Total => self.total_tps,
        }
    }
}

pub fn records_to_csv(records: &[PerfLogRecord]) -> String {
    let mut out = String::from("phase,time_ms,token_count,tokens_per_sec\n");
    for r in records {
        let tps = r
            .tokens_per_sec()
            .map(|v| format!("{:.4}", v))
            .unwrap_or_default();
        out.push_str(&format!(
            "{},{},{},{}\n",
            r.phase.as_str(),
            r.time_ms,
            r.token_count,
            tps
        ));
    }
    out
}

use std::collections::{BTreeMap, HashMap};
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error_handling::FailureKind;
use crate::identity::HardwareArchetype;
use crate::session::{SessionOutcome, Step};

const UNKNOWN_ERROR: &str = "Unknown error";

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LatencyPercentiles {
    pub p50_secs: f64,
    pub p95_secs: f64,
    pub p99_secs: f64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ErrorCount {
    pub error: String,
    pub count: usize,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ArchetypeStats {
    pub archetype: HardwareArchetype,
    pub weight: f64,
    pub sessions: usize,
    pub successes: usize,
}

/// Summary of one run. `None` marks figures that have no data behind them
/// (no sessions, or a run that took no measurable time).
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct AggregateReport {
    pub total_sessions: usize,
    pub successes: usize,
    pub failures: usize,
    pub success_rate: Option<f64>,
    pub duration_secs: f64,
    pub throughput_per_sec: Option<f64>,
    pub latency: Option<LatencyPercentiles>,
    pub step_mean_secs: BTreeMap<Step, f64>,
    pub top_errors: Vec<ErrorCount>,
    pub failure_kinds: BTreeMap<FailureKind, usize>,
    pub total_retries: u64,
    pub duplicate_sessions: usize,
    pub malformed_sessions: usize,
    pub archetypes: Vec<ArchetypeStats>,
}

/// Median, averaging the two middle values for even counts.
pub fn median(sorted: &[f64]) -> Option<f64> {
    let n = sorted.len();
    match n {
        0 => None,
        _ if n % 2 == 1 => Some(sorted[n / 2]),
        _ => Some((sorted[n / 2 - 1] + sorted[n / 2]) / 2.0),
    }
}

/// Value at index floor(len·pct/100); no interpolation.
pub fn percentile(sorted: &[f64], pct: usize) -> Option<f64> {
    if sorted.is_empty() {
        return None;
    }
    let idx = (sorted.len() * pct / 100).min(sorted.len() - 1);
    Some(sorted[idx])
}

#[derive(Debug, Clone)]
pub struct ResultAggregator {
    top_k: usize,
}

impl Default for ResultAggregator {
    fn default() -> Self {
        Self { top_k: 5 }
    }
}

impl ResultAggregator {
    pub fn new(top_k: usize) -> Self {
        Self { top_k }
    }

    pub fn aggregate(&self, outcomes: &[SessionOutcome], duration: Duration) -> AggregateReport {
        let total = outcomes.len();
        let successes = outcomes.iter().filter(|o| o.success).count();
        let duration_secs = duration.as_secs_f64();

        let success_rate = (total > 0).then(|| successes as f64 / total as f64);
        let throughput_per_sec = (duration_secs > 0.0).then(|| successes as f64 / duration_secs);

        let mut totals: Vec<f64> = outcomes.iter().map(|o| o.total.as_secs_f64()).collect();
        totals.sort_by(|a, b| a.total_cmp(b));
        let latency = median(&totals).and_then(|p50| {
            Some(LatencyPercentiles {
                p50_secs: p50,
                p95_secs: percentile(&totals, 95)?,
                p99_secs: percentile(&totals, 99)?,
            })
        });

        let mut step_mean_secs = BTreeMap::new();
        for step in Step::ALL {
            let times: Vec<f64> = outcomes
                .iter()
                .filter_map(|o| o.steps.get(&step))
                .map(Duration::as_secs_f64)
                .collect();
            if !times.is_empty() {
                step_mean_secs.insert(step, times.iter().sum::<f64>() / times.len() as f64);
            }
        }

        let mut failure_kinds = BTreeMap::new();
        let mut error_counts: HashMap<&str, usize> = HashMap::new();
        for o in outcomes.iter().filter(|o| !o.success) {
            *error_counts.entry(o.error.as_deref().unwrap_or(UNKNOWN_ERROR)).or_default() += 1;
            if let Some(kind) = o.failure {
                *failure_kinds.entry(kind).or_default() += 1;
            }
        }
        let mut top_errors: Vec<ErrorCount> = error_counts
            .into_iter()
            .map(|(error, count)| ErrorCount { error: error.to_string(), count })
            .collect();
        top_errors.sort_by(|a, b| b.count.cmp(&a.count).then_with(|| a.error.cmp(&b.error)));
        top_errors.truncate(self.top_k);

        let archetypes = HardwareArchetype::ALL
            .into_iter()
            .map(|archetype| {
                let of_kind = outcomes.iter().filter(|o| o.archetype == archetype);
                ArchetypeStats {
                    archetype,
                    weight: archetype.descriptor().weight,
                    sessions: of_kind.clone().count(),
                    successes: of_kind.filter(|o| o.success).count(),
                }
            })
            .filter(|a| a.sessions > 0)
            .collect();

        AggregateReport {
            total_sessions: total,
            successes,
            failures: total - successes,
            success_rate,
            duration_secs,
            throughput_per_sec,
            latency,
            step_mean_secs,
            top_errors,
            failure_kinds,
            total_retries: outcomes.iter().map(|o| o.retries as u64).sum(),
            duplicate_sessions: outcomes.iter().filter(|o| o.is_duplicate).count(),
            malformed_sessions: outcomes.iter().filter(|o| o.is_malformed).count(),
            archetypes,
        }
    }
}

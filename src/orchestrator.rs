//! Drives every simulated miner of a run through the protocol under a concurrency bound.

use std::sync::Arc;
use std::time::Duration;

use futures::future::join_all;
use rand::RngCore;
use tokio::sync::Semaphore;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use crate::error_handling::{HarnessError, RetryPolicy};
use crate::identity::MinerSimulator;
use crate::metrics::{AggregateReport, ResultAggregator};
use crate::prng::{entropy_seed, DPrng};
use crate::prometheus_metrics::RunMetrics;
use crate::session::{SessionContext, SessionOutcome, Step};
use crate::transport::Transport;
use crate::types::RequestBody;

/// Every n-th session submits a corrupted payload.
pub const MALFORMED_EVERY: usize = 5;

#[derive(Debug, Clone, PartialEq)]
pub struct ScenarioParams {
    pub num_miners: usize,
    pub duplicate_ratio: f64,
    pub malformed: bool,
    pub epoch_boundary: bool,
}

#[derive(Debug, Clone, PartialEq)]
pub struct SessionPlan {
    pub index: usize,
    pub forced_id: Option<String>,
    pub malformed: bool,
    pub start_delay: Duration,
}

/// floor(n·ratio), ratio clamped to [0, 1].
pub fn duplicate_count(num_miners: usize, ratio: f64) -> usize {
    ((num_miners as f64 * ratio.clamp(0.0, 1.0)).floor() as usize).min(num_miners)
}

/// Lay out the scenario flags for each launch index. The first `duplicate_count`
/// sessions share `duplicate_id`; sessions past the midpoint wait `epoch_offset`.
pub fn plan_sessions(params: &ScenarioParams, duplicate_id: &str, epoch_offset: Duration) -> Vec<SessionPlan> {
    let dupes = duplicate_count(params.num_miners, params.duplicate_ratio);
    let midpoint = params.num_miners / 2;
    (0..params.num_miners)
        .map(|index| SessionPlan {
            index,
            forced_id: (index < dupes).then(|| duplicate_id.to_string()),
            malformed: params.malformed && index % MALFORMED_EVERY == 0,
            start_delay: if params.epoch_boundary && index > midpoint { epoch_offset } else { Duration::ZERO },
        })
        .collect()
}

#[derive(Debug, Clone)]
pub struct HarnessSettings {
    pub base_url: String,
    pub concurrency: usize,
    pub retry: RetryPolicy,
    pub epoch_offset: Duration,
    pub top_errors: usize,
    pub seed: Option<u64>,
}

impl Default for HarnessSettings {
    fn default() -> Self {
        Self {
            base_url: "http://127.0.0.1:8099".to_string(),
            concurrency: 20,
            retry: RetryPolicy::default(),
            epoch_offset: Duration::from_secs(5),
            top_errors: 5,
            seed: None,
        }
    }
}

/// Outcomes in launch order plus the report built from them.
#[derive(Debug, Clone)]
pub struct RunSummary {
    pub outcomes: Vec<SessionOutcome>,
    pub duration: Duration,
    pub report: AggregateReport,
}

pub struct Harness {
    transport: Arc<dyn Transport>,
    settings: HarnessSettings,
    metrics: Option<Arc<RunMetrics>>,
}

impl Harness {
    pub fn new(transport: Arc<dyn Transport>, settings: HarnessSettings) -> Self {
        Self { transport, settings, metrics: None }
    }

    pub fn with_metrics(mut self, metrics: Arc<RunMetrics>) -> Self {
        self.metrics = Some(metrics);
        self
    }

    pub fn settings(&self) -> &HarnessSettings {
        &self.settings
    }

    /// Any HTTP answer from the challenge endpoint means the target is up.
    pub async fn preflight(&self) -> Result<(), HarnessError> {
        let url = format!("{}{}", self.settings.base_url.trim_end_matches('/'), Step::Challenge.path());
        match self.transport.post(&url, &RequestBody::empty_object()).await {
            Ok(resp) => {
                info!(status = resp.status, url = %url, "target reachable");
                Ok(())
            }
            Err(source) => Err(HarnessError::TargetUnreachable { url, source }),
        }
    }

    pub async fn run(&self, params: &ScenarioParams, cancel: &CancellationToken) -> Result<RunSummary, HarnessError> {
        let seed = self.settings.seed.unwrap_or_else(entropy_seed);
        let mut run_rng = DPrng::for_session(seed, usize::MAX);
        let duplicate_id = format!("duplicate-miner-{:04x}", run_rng.next_u32() & 0xffff);
        let plans = plan_sessions(params, &duplicate_id, self.settings.epoch_offset);

        info!(
            url = %self.settings.base_url,
            miners = params.num_miners,
            concurrency = self.settings.concurrency,
            duplicates = plans.iter().filter(|p| p.forced_id.is_some()).count(),
            malformed = plans.iter().filter(|p| p.malformed).count(),
            epoch_boundary = params.epoch_boundary,
            seed,
            "Starting stress run"
        );

        let gate = Semaphore::new(self.settings.concurrency);
        let ctx = SessionContext {
            transport: self.transport.as_ref(),
            base_url: &self.settings.base_url,
            retry: &self.settings.retry,
            gate: &gate,
            cancel,
        };
        let metrics = self.metrics.as_deref();

        let start = Instant::now();
        let sessions = plans.iter().map(|plan| {
            let ctx = &ctx;
            let simulator = MinerSimulator::generate(DPrng::for_session(seed, plan.index));
            async move {
                if !plan.start_delay.is_zero() {
                    tokio::time::sleep(plan.start_delay).await;
                }
                let outcome = ctx
                    .run_session(plan.index, simulator, plan.forced_id.as_deref(), plan.malformed)
                    .await;
                if let Some(m) = metrics {
                    m.record_session(&outcome);
                }
                outcome
            }
        });

        // join_all keeps launch order whatever order sessions finish in
        let outcomes = tokio::select! {
            biased;
            _ = cancel.cancelled() => None,
            outcomes = join_all(sessions) => Some(outcomes),
        };
        let outcomes = match outcomes {
            Some(o) if !cancel.is_cancelled() => o,
            _ => {
                warn!("Run aborted, discarding partial results");
                return Err(HarnessError::Aborted);
            }
        };
        let duration = start.elapsed();

        let report = ResultAggregator::new(self.settings.top_errors).aggregate(&outcomes, duration);
        if let Some(m) = metrics {
            m.update_from_report(&report);
        }
        info!(
            sessions = report.total_sessions,
            successes = report.successes,
            duration_ms = duration.as_millis() as u64,
            "Stress run finished"
        );

        Ok(RunSummary { outcomes, duration, report })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn params(n: usize, ratio: f64, malformed: bool, epoch: bool) -> ScenarioParams {
        ScenarioParams { num_miners: n, duplicate_ratio: ratio, malformed, epoch_boundary: epoch }
    }

    #[test]
    fn duplicate_count_floors() {
        assert_eq!(duplicate_count(10, 0.2), 2);
        assert_eq!(duplicate_count(7, 0.5), 3);
        assert_eq!(duplicate_count(3, 0.0), 0);
        assert_eq!(duplicate_count(4, 1.0), 4);
        assert_eq!(duplicate_count(4, 2.0), 4);
    }

    #[test]
    fn plan_flags_every_fifth_session_as_malformed() {
        let plan = plan_sessions(&params(12, 0.0, true, false), "dup", Duration::from_secs(5));
        let flagged: Vec<_> = plan.iter().filter(|p| p.malformed).map(|p| p.index).collect();
        assert_eq!(flagged, vec![0, 5, 10]);
        assert!(plan.iter().all(|p| p.forced_id.is_none()));
    }

    #[test]
    fn plan_delays_sessions_past_the_midpoint() {
        let offset = Duration::from_secs(5);
        let plan = plan_sessions(&params(10, 0.0, false, true), "dup", offset);
        let delayed: Vec<_> = plan.iter().filter(|p| p.start_delay == offset).map(|p| p.index).collect();
        assert_eq!(delayed, vec![6, 7, 8, 9]);

        let plan = plan_sessions(&params(10, 0.0, false, false), "dup", offset);
        assert!(plan.iter().all(|p| p.start_delay.is_zero()));
    }

    #[test]
    fn plan_forces_shared_identity_on_leading_sessions() {
        let plan = plan_sessions(&params(10, 0.3, false, false), "duplicate-miner-beef", Duration::ZERO);
        let forced: Vec<_> = plan.iter().filter_map(|p| p.forced_id.as_deref()).collect();
        assert_eq!(forced, vec!["duplicate-miner-beef"; 3]);
        assert!(plan[..3].iter().all(|p| p.forced_id.is_some()));
    }
}

use prometheus_client::{
    encoding::text::encode,
    metrics::{counter::Counter, gauge::Gauge, histogram::Histogram},
    registry::Registry,
};
use crate::error_handling::FailureKind;
use crate::metrics::AggregateReport;
use crate::session::{SessionOutcome, Step};

pub struct RunMetrics {
    registry: Registry,

    // Counters
    sessions: Counter,
    successful_sessions: Counter,
    failed_sessions: Counter,
    retries: Counter,
    protocol_rejections: Counter,
    transport_faults: Counter,
    retry_exhaustions: Counter,
    aborted_sessions: Counter,

    // Gauges
    success_rate: Gauge<i64>,

    // Histograms
    session_duration_seconds: Histogram,
    challenge_seconds: Histogram,
    submit_seconds: Histogram,
    enroll_seconds: Histogram,
}

fn latency_buckets() -> impl Iterator<Item = f64> {
    [0.01, 0.025, 0.05, 0.1, 0.25, 0.5, 1.0, 2.5, 5.0, 10.0, 30.0, 60.0].into_iter()
}

impl RunMetrics {
    pub fn new() -> Self {
        let mut registry = Registry::default();

        let sessions = Counter::default();
        let successful_sessions = Counter::default();
        let failed_sessions = Counter::default();
        let retries = Counter::default();
        let protocol_rejections = Counter::default();
        let transport_faults = Counter::default();
        let retry_exhaustions = Counter::default();
        let aborted_sessions = Counter::default();

        let success_rate = Gauge::default();

        let session_duration_seconds = Histogram::new(latency_buckets());
        let challenge_seconds = Histogram::new(latency_buckets());
        let submit_seconds = Histogram::new(latency_buckets());
        let enroll_seconds = Histogram::new(latency_buckets());

        registry.register("attest_stress_sessions", "Sessions finished", sessions.clone());
        registry.register("attest_stress_successful_sessions", "Sessions that reached SUCCESS", successful_sessions.clone());
        registry.register("attest_stress_failed_sessions", "Sessions that ended FAILED", failed_sessions.clone());
        registry.register("attest_stress_retries", "Throttled (429) responses", retries.clone());
        registry.register("attest_stress_protocol_rejections", "Sessions failed by a 400/403 or ok=false reply", protocol_rejections.clone());
        registry.register("attest_stress_transport_faults", "Sessions failed by network errors or unexpected status", transport_faults.clone());
        registry.register("attest_stress_retry_exhaustions", "Sessions failed after the retry ceiling", retry_exhaustions.clone());
        registry.register("attest_stress_aborted_sessions", "Sessions interrupted by an abort", aborted_sessions.clone());
        registry.register("attest_stress_success_rate", "Success rate in basis points", success_rate.clone());
        registry.register("attest_stress_session_duration_seconds", "Total session time", session_duration_seconds.clone());
        registry.register("attest_stress_challenge_seconds", "Challenge step request time", challenge_seconds.clone());
        registry.register("attest_stress_submit_seconds", "Submit step request time", submit_seconds.clone());
        registry.register("attest_stress_enroll_seconds", "Enroll step request time", enroll_seconds.clone());

        Self {
            registry,
            sessions,
            successful_sessions,
            failed_sessions,
            retries,
            protocol_rejections,
            transport_faults,
            retry_exhaustions,
            aborted_sessions,
            success_rate,
            session_duration_seconds,
            challenge_seconds,
            submit_seconds,
            enroll_seconds,
        }
    }

    pub fn record_session(&self, outcome: &SessionOutcome) {
        self.sessions.inc();
        if outcome.success {
            self.successful_sessions.inc();
        } else {
            self.failed_sessions.inc();
        }
        self.retries.inc_by(outcome.retries as u64);

        match outcome.failure {
            Some(FailureKind::ProtocolRejection) => { self.protocol_rejections.inc(); }
            Some(FailureKind::TransportFault) => { self.transport_faults.inc(); }
            Some(FailureKind::RetryExhaustion) => { self.retry_exhaustions.inc(); }
            Some(FailureKind::Aborted) => { self.aborted_sessions.inc(); }
            None => {}
        }

        self.session_duration_seconds.observe(outcome.total.as_secs_f64());
        for (step, elapsed) in &outcome.steps {
            let h = match step {
                Step::Challenge => &self.challenge_seconds,
                Step::Submit => &self.submit_seconds,
                Step::Enroll => &self.enroll_seconds,
            };
            h.observe(elapsed.as_secs_f64());
        }
    }

    pub fn update_from_report(&self, report: &AggregateReport) {
        let rate = report.success_rate.map(|r| (r * 10000.0) as i64).unwrap_or(0);
        self.success_rate.set(rate);
    }

    pub fn export_metrics(&self) -> Result<String, std::fmt::Error> {
        let mut buffer = String::new();
        encode(&mut buffer, &self.registry)?;
        Ok(buffer)
    }
}

impl Default for RunMetrics {
    fn default() -> Self {
        Self::new()
    }
}

//! One simulated miner walking challenge → submit → enroll against the target.

use std::collections::BTreeMap;
use std::time::Duration;

use rand::RngCore;
use serde::Serialize;
use serde_json::Value;
use tokio::sync::Semaphore;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use crate::error_handling::{FailureKind, RetryPolicy, StepError};
use crate::identity::{Corruption, HardwareArchetype, MinerSimulator};
use crate::transport::Transport;
use crate::types::{ChallengeReply, RequestBody};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum Step {
    Challenge,
    Submit,
    Enroll,
}

impl Step {
    pub const ALL: [Step; 3] = [Step::Challenge, Step::Submit, Step::Enroll];

    pub fn name(&self) -> &'static str {
        match self {
            Step::Challenge => "challenge",
            Step::Submit => "submit",
            Step::Enroll => "enroll",
        }
    }

    pub fn path(&self) -> &'static str {
        match self {
            Step::Challenge => "/attest/challenge",
            Step::Submit => "/attest/submit",
            Step::Enroll => "/epoch/enroll",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum SessionState {
    Start,
    ChallengePending,
    ChallengeOk,
    SubmitPending,
    SubmitOk,
    SubmitRejected,
    EnrollPending,
    EnrollOk,
    Success,
    Failed,
}

impl SessionState {
    pub fn is_terminal(&self) -> bool {
        matches!(self, SessionState::Success | SessionState::Failed)
    }
}

/// Decoded reply of a step that the target answered with 200, 400 or 403.
#[derive(Debug, Clone, PartialEq)]
pub struct StepReply {
    pub status: u16,
    pub body: Value,
}

impl StepReply {
    fn parse(status: u16, raw: &str) -> Result<Self, StepError> {
        let body = match serde_json::from_str(raw) {
            Ok(v) => v,
            Err(e) if status == 200 => return Err(StepError::Decode(e.to_string())),
            // rejections are not required to carry JSON
            Err(_) => Value::String(raw.to_string()),
        };
        Ok(Self { status, body })
    }

    pub fn is_rejection(&self) -> bool {
        matches!(self.status, 400 | 403)
    }

    pub fn accepted(&self) -> bool {
        self.status == 200 && self.body.get("ok").and_then(Value::as_bool) == Some(true)
    }
}

/// Per-session record. Mutated while the session runs, read-only once returned.
#[derive(Debug, Clone)]
pub struct SessionOutcome {
    pub index: usize,
    pub miner_id: String,
    pub archetype: HardwareArchetype,
    pub success: bool,
    pub state: SessionState,
    /// Request time per step, summed over attempts. Steps never reached are absent.
    pub steps: BTreeMap<Step, Duration>,
    /// Includes gate wait and backoff sleeps.
    pub total: Duration,
    pub retries: u32,
    pub is_duplicate: bool,
    pub is_malformed: bool,
    pub corruption: Option<Corruption>,
    pub failure: Option<FailureKind>,
    pub error: Option<String>,
    pub note: Option<String>,
}

impl SessionOutcome {
    fn new(index: usize, miner_id: &str, archetype: HardwareArchetype, is_duplicate: bool, is_malformed: bool) -> Self {
        Self {
            index,
            miner_id: miner_id.to_string(),
            archetype,
            success: false,
            state: SessionState::Start,
            steps: BTreeMap::new(),
            total: Duration::ZERO,
            retries: 0,
            is_duplicate,
            is_malformed,
            corruption: None,
            failure: None,
            error: None,
            note: None,
        }
    }

    fn transition(&mut self, next: SessionState) {
        debug!(session = self.index, miner_id = %self.miner_id, from = ?self.state, to = ?next, "session transition");
        self.state = next;
    }

    fn fail(&mut self, kind: FailureKind, error: String) {
        warn!(session = self.index, miner_id = %self.miner_id, kind = %kind, error = %error, "session failed");
        self.failure = Some(kind);
        self.error = Some(error);
        self.transition(SessionState::Failed);
    }

    fn fail_step(&mut self, err: StepError) {
        self.fail(err.kind(), err.to_string());
    }

    fn succeed(&mut self) {
        self.success = true;
        self.transition(SessionState::Success);
    }
}

/// Shared, read-only pieces every session of a run borrows.
pub struct SessionContext<'a> {
    pub transport: &'a dyn Transport,
    pub base_url: &'a str,
    pub retry: &'a RetryPolicy,
    pub gate: &'a Semaphore,
    pub cancel: &'a CancellationToken,
}

impl SessionContext<'_> {
    fn url(&self, step: Step) -> String {
        format!("{}{}", self.base_url.trim_end_matches('/'), step.path())
    }

    /// Send one step, backing off on 429 until the attempt ceiling.
    pub async fn perform_step_with_retry(
        &self,
        step: Step,
        body: &RequestBody,
        outcome: &mut SessionOutcome,
    ) -> Result<StepReply, StepError> {
        let url = self.url(step);
        for attempt in 0..self.retry.max_attempts {
            let started = Instant::now();
            let resp = self.transport.post(&url, body).await?;
            *outcome.steps.entry(step).or_default() += started.elapsed();

            match resp.status {
                200 | 400 | 403 => return StepReply::parse(resp.status, &resp.body),
                429 => {
                    outcome.retries += 1;
                    if attempt + 1 >= self.retry.max_attempts {
                        break;
                    }
                    let delay = self.retry.delay_for(attempt);
                    debug!(session = outcome.index, step = step.name(), attempt, delay_ms = delay.as_millis() as u64, "throttled, backing off");
                    tokio::select! {
                        _ = self.cancel.cancelled() => return Err(StepError::Cancelled),
                        _ = tokio::time::sleep(delay) => {}
                    }
                }
                other => return Err(StepError::unexpected_status(other, &resp.body)),
            }
        }
        Err(StepError::RetryExhausted)
    }

    /// Run the full exchange for one miner. Never returns an error: every failure
    /// ends up in the outcome.
    pub async fn run_session<R: RngCore>(
        &self,
        index: usize,
        simulator: MinerSimulator<R>,
        forced_id: Option<&str>,
        malformed: bool,
    ) -> SessionOutcome {
        let mut simulator = match forced_id {
            Some(id) => simulator.with_forced_id(id),
            None => simulator,
        };
        let profile = simulator.profile();
        let mut outcome = SessionOutcome::new(index, &profile.miner_id, profile.archetype, forced_id.is_some(), malformed);

        let started = Instant::now();
        match self.gate.acquire().await {
            Ok(_permit) => self.exchange(&mut simulator, &mut outcome).await,
            Err(_) => outcome.fail_step(StepError::Cancelled),
        }
        outcome.total = started.elapsed();
        outcome
    }

    async fn exchange<R: RngCore>(&self, sim: &mut MinerSimulator<R>, outcome: &mut SessionOutcome) {
        // challenge
        outcome.transition(SessionState::ChallengePending);
        let reply = match self.perform_step_with_retry(Step::Challenge, &RequestBody::empty_object(), outcome).await {
            Ok(r) => r,
            Err(e) => return outcome.fail_step(e),
        };
        let nonce = match (reply.status, serde_json::from_value::<ChallengeReply>(reply.body.clone())) {
            (200, Ok(c)) => c.nonce,
            _ => return outcome.fail(FailureKind::ProtocolRejection, format!("Challenge rejected: {}", reply.body)),
        };
        outcome.transition(SessionState::ChallengeOk);

        // submit
        let submit = if outcome.is_malformed {
            sim.build_malformed_payload(&nonce).map(|(c, body)| {
                outcome.corruption = Some(c);
                body
            })
        } else {
            sim.build_attestation_payload(&nonce).map(crate::types::SubmitBody::Structured)
        };
        let request = match submit.and_then(|b| b.to_request()) {
            Ok(r) => r,
            Err(e) => return outcome.fail_step(StepError::Encode(e.to_string())),
        };
        outcome.transition(SessionState::SubmitPending);
        let reply = match self.perform_step_with_retry(Step::Submit, &request, outcome).await {
            Ok(r) => r,
            Err(e) => return outcome.fail_step(e),
        };

        if outcome.is_malformed {
            if reply.accepted() {
                return outcome.fail(FailureKind::ProtocolRejection, "Malformed payload accepted".to_string());
            }
            outcome.transition(SessionState::SubmitRejected);
            outcome.note = Some("Correctly rejected malformed payload".to_string());
            return outcome.succeed();
        }
        if !reply.accepted() {
            outcome.transition(SessionState::SubmitRejected);
            return outcome.fail(FailureKind::ProtocolRejection, format!("Submit rejected: {}", reply.body));
        }
        outcome.transition(SessionState::SubmitOk);

        // enroll
        let request = match RequestBody::json(&sim.build_enroll_payload()) {
            Ok(r) => r,
            Err(e) => return outcome.fail_step(StepError::Encode(e.to_string())),
        };
        outcome.transition(SessionState::EnrollPending);
        let reply = match self.perform_step_with_retry(Step::Enroll, &request, outcome).await {
            Ok(r) => r,
            Err(e) => return outcome.fail_step(e),
        };
        if !reply.accepted() {
            return outcome.fail(FailureKind::ProtocolRejection, format!("Enroll failed: {}", reply.body));
        }
        outcome.transition(SessionState::EnrollOk);
        outcome.succeed();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::prng::DPrng;
    use crate::transport::{TransportError, TransportResponse};
    use async_trait::async_trait;
    use std::sync::Mutex;

    /// Replays canned replies per step and records when each request arrived.
    struct Scripted {
        replies: Mutex<Vec<(Step, Result<TransportResponse, TransportError>)>>,
        calls: Mutex<Vec<(String, Instant)>>,
    }

    impl Scripted {
        fn new(replies: Vec<(Step, Result<TransportResponse, TransportError>)>) -> Self {
            Self { replies: Mutex::new(replies), calls: Mutex::new(vec![]) }
        }
    }

    fn ok(status: u16, body: &str) -> Result<TransportResponse, TransportError> {
        Ok(TransportResponse { status, body: body.to_string() })
    }

    #[async_trait]
    impl Transport for Scripted {
        async fn post(&self, url: &str, _body: &RequestBody) -> Result<TransportResponse, TransportError> {
            self.calls.lock().unwrap().push((url.to_string(), Instant::now()));
            let mut replies = self.replies.lock().unwrap();
            let idx = replies
                .iter()
                .position(|(s, _)| url.ends_with(s.path()))
                .expect("unscripted request");
            replies.remove(idx).1
        }
    }

    async fn run(transport: &Scripted, malformed: bool) -> SessionOutcome {
        let retry = RetryPolicy { max_attempts: 5, base_delay: Duration::from_secs(2) };
        let gate = Semaphore::new(1);
        let cancel = CancellationToken::new();
        let ctx = SessionContext { transport, base_url: "http://node/", retry: &retry, gate: &gate, cancel: &cancel };
        ctx.run_session(0, MinerSimulator::generate(DPrng::for_session(1, 0)), None, malformed).await
    }

    fn happy_path(extra: Vec<(Step, Result<TransportResponse, TransportError>)>) -> Scripted {
        let mut v = extra;
        v.push((Step::Challenge, ok(200, r#"{"nonce":"abc"}"#)));
        v.push((Step::Submit, ok(200, r#"{"ok":true}"#)));
        v.push((Step::Enroll, ok(200, r#"{"ok":true}"#)));
        Scripted::new(v)
    }

    #[tokio::test(start_paused = true)]
    async fn happy_path_records_every_step() {
        let t = happy_path(vec![]);
        let o = run(&t, false).await;
        assert!(o.success);
        assert_eq!(o.state, SessionState::Success);
        assert_eq!(o.steps.keys().copied().collect::<Vec<_>>(), Step::ALL.to_vec());
        assert_eq!(o.retries, 0);
        assert!(o.error.is_none());
        assert_eq!(t.calls.lock().unwrap()[0].0, "http://node/attest/challenge");
    }

    #[tokio::test(start_paused = true)]
    async fn throttled_step_backs_off_with_doubling_delays() {
        for k in 1..5u32 {
            let throttles = (0..k).map(|_| (Step::Challenge, ok(429, "slow down"))).collect();
            let t = happy_path(throttles);
            let o = run(&t, false).await;
            assert!(o.success, "k={k}: {:?}", o.error);
            assert_eq!(o.retries, k);

            let calls = t.calls.lock().unwrap();
            let gaps: Vec<u64> = calls[..=k as usize]
                .windows(2)
                .map(|w| (w[1].1 - w[0].1).as_secs())
                .collect();
            let expected: Vec<u64> = (0..k).map(|i| 2u64 << i).collect();
            assert_eq!(gaps, expected);
        }
    }

    #[tokio::test(start_paused = true)]
    async fn five_throttles_exhaust_the_step() {
        let throttles = (0..5).map(|_| (Step::Challenge, ok(429, ""))).collect();
        let t = happy_path(throttles);
        let o = run(&t, false).await;
        assert!(!o.success);
        assert_eq!(o.failure, Some(FailureKind::RetryExhaustion));
        assert_eq!(o.error.as_deref(), Some("Max retries exceeded (429)"));
        assert_eq!(o.retries, 5);
        // 2 + 4 + 8 + 16 seconds of backoff, none after the last attempt
        assert!(o.total >= Duration::from_secs(30) && o.total < Duration::from_secs(31));
    }

    #[tokio::test(start_paused = true)]
    async fn rejection_is_never_retried() {
        let t = Scripted::new(vec![
            (Step::Challenge, ok(200, r#"{"nonce":"abc"}"#)),
            (Step::Submit, ok(403, r#"{"ok":false,"reason":"vm_detected"}"#)),
        ]);
        let o = run(&t, false).await;
        assert!(!o.success);
        assert_eq!(o.failure, Some(FailureKind::ProtocolRejection));
        assert!(o.error.as_deref().unwrap().starts_with("Submit rejected:"));
        assert_eq!(t.calls.lock().unwrap().len(), 2);
        assert!(!o.steps.contains_key(&Step::Enroll));
    }

    #[tokio::test(start_paused = true)]
    async fn malformed_rejection_counts_as_success() {
        let t = Scripted::new(vec![
            (Step::Challenge, ok(200, r#"{"nonce":"abc"}"#)),
            (Step::Submit, ok(400, "bad request")),
        ]);
        let o = run(&t, true).await;
        assert!(o.success);
        assert!(o.corruption.is_some());
        assert_eq!(o.note.as_deref(), Some("Correctly rejected malformed payload"));
        assert!(!o.steps.contains_key(&Step::Enroll));
    }

    #[tokio::test(start_paused = true)]
    async fn malformed_acceptance_fails() {
        let t = Scripted::new(vec![
            (Step::Challenge, ok(200, r#"{"nonce":"abc"}"#)),
            (Step::Submit, ok(200, r#"{"ok":true}"#)),
        ]);
        let o = run(&t, true).await;
        assert!(!o.success);
        assert_eq!(o.error.as_deref(), Some("Malformed payload accepted"));
    }

    #[tokio::test(start_paused = true)]
    async fn unknown_status_and_transport_faults_are_verbatim() {
        let t = Scripted::new(vec![(Step::Challenge, ok(502, "bad gateway"))]);
        let o = run(&t, false).await;
        assert_eq!(o.error.as_deref(), Some("HTTP 502: bad gateway"));
        assert_eq!(o.failure, Some(FailureKind::TransportFault));

        let t = Scripted::new(vec![(Step::Challenge, Err(TransportError("operation timed out".into())))]);
        let o = run(&t, false).await;
        assert_eq!(o.error.as_deref(), Some("operation timed out"));
        assert_eq!(o.failure, Some(FailureKind::TransportFault));
        assert!(o.steps.is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn challenge_without_nonce_is_rejected() {
        let t = Scripted::new(vec![(Step::Challenge, ok(200, r#"{"error":"epoch closed"}"#))]);
        let o = run(&t, false).await;
        assert_eq!(o.failure, Some(FailureKind::ProtocolRejection));
        assert!(o.error.as_deref().unwrap().starts_with("Challenge rejected:"));
    }

    #[tokio::test(start_paused = true)]
    async fn cancellation_interrupts_backoff() {
        let t = happy_path(vec![(Step::Challenge, ok(429, ""))]);
        let retry = RetryPolicy { max_attempts: 5, base_delay: Duration::from_secs(3600) };
        let gate = Semaphore::new(1);
        let cancel = CancellationToken::new();
        cancel.cancel();
        let ctx = SessionContext { transport: &t, base_url: "http://node", retry: &retry, gate: &gate, cancel: &cancel };
        let o = ctx.run_session(0, MinerSimulator::generate(DPrng::for_session(1, 0)), None, false).await;
        assert_eq!(o.failure, Some(FailureKind::Aborted));
        assert!(o.total < Duration::from_secs(3600));
        assert_eq!(gate.available_permits(), 1);
    }
}

use std::fmt::Write as _;
use std::path::Path;

use chrono::{DateTime, Utc};
use serde::Serialize;
use thiserror::Error;

use crate::metrics::AggregateReport;
use crate::orchestrator::ScenarioParams;

#[derive(Error, Debug)]
pub enum ReportError {
    #[error("failed to write report: {0}")]
    Io(#[from] std::io::Error),
    #[error("failed to encode report: {0}")]
    Json(#[from] serde_json::Error),
}

#[derive(Debug, Clone, Serialize)]
pub struct ScenarioSummary {
    pub miners: usize,
    pub concurrency: usize,
    pub duplicate_ratio: f64,
    pub malformed: bool,
    pub epoch_boundary: bool,
}

/// The one document a finished run produces.
#[derive(Debug, Clone, Serialize)]
pub struct ReportDocument {
    pub generated_at: DateTime<Utc>,
    pub target_url: String,
    pub scenario: ScenarioSummary,
    pub summary: AggregateReport,
}

fn secs(v: Option<f64>) -> String {
    v.map(|s| format!("{s:.3}s")).unwrap_or_else(|| "n/a".to_string())
}

impl ReportDocument {
    pub fn new(target_url: &str, params: &ScenarioParams, concurrency: usize, summary: AggregateReport) -> Self {
        Self {
            generated_at: Utc::now(),
            target_url: target_url.to_string(),
            scenario: ScenarioSummary {
                miners: params.num_miners,
                concurrency,
                duplicate_ratio: params.duplicate_ratio,
                malformed: params.malformed,
                epoch_boundary: params.epoch_boundary,
            },
            summary,
        }
    }

    fn success_line(&self) -> String {
        let s = &self.summary;
        match s.success_rate {
            Some(rate) => format!("{:.1}% ({}/{})", rate * 100.0, s.successes, s.total_sessions),
            None => "n/a (no sessions)".to_string(),
        }
    }

    fn throughput_line(&self) -> String {
        self.summary
            .throughput_per_sec
            .map(|t| format!("{t:.2} miners/sec"))
            .unwrap_or_else(|| "n/a".to_string())
    }

    /// Console summary printed at the end of a run.
    pub fn print_summary(&self) {
        let s = &self.summary;
        println!("\n{}", "=".repeat(50));
        println!("STRESS TEST SUMMARY");
        println!("{}", "=".repeat(50));
        println!("Total Miners:     {}", s.total_sessions);
        println!("Success Rate:     {}", self.success_line());
        println!("Total Duration:   {:.2}s", s.duration_secs);
        println!("Avg Throughput:   {}", self.throughput_line());
        println!("Retries (429):    {}", s.total_retries);

        if let Some(l) = &s.latency {
            println!("\nLatency (Total Session):");
            println!("  P50 (Median):   {:.3}s", l.p50_secs);
            println!("  P95:            {:.3}s", l.p95_secs);
            println!("  P99:            {:.3}s", l.p99_secs);
        }
        for (step, mean) in &s.step_mean_secs {
            println!("  Avg {:<10}    {:.3}s", format!("{}:", step.name()), mean);
        }

        if !s.top_errors.is_empty() {
            println!("\nTop Errors:");
            for e in &s.top_errors {
                println!("  - {}x: {}", e.count, e.error);
            }
        }
        println!("{}", "=".repeat(50));
    }

    pub fn to_markdown(&self) -> String {
        let s = &self.summary;
        let mut md = String::new();
        let _ = writeln!(md, "# Attestation Stress Test Report\n");
        let _ = writeln!(md, "- Generated: {}", self.generated_at.to_rfc3339());
        let _ = writeln!(md, "- Target: `{}`", self.target_url);
        let _ = writeln!(
            md,
            "- Scenario: {} miners, concurrency {}, duplicate ratio {:.2}, malformed {}, epoch boundary {}\n",
            self.scenario.miners,
            self.scenario.concurrency,
            self.scenario.duplicate_ratio,
            self.scenario.malformed,
            self.scenario.epoch_boundary,
        );

        let _ = writeln!(md, "## Summary\n");
        let _ = writeln!(md, "| Metric | Value |\n|---|---|");
        let _ = writeln!(md, "| Sessions | {} |", s.total_sessions);
        let _ = writeln!(md, "| Success rate | {} |", self.success_line());
        let _ = writeln!(md, "| Duration | {:.2}s |", s.duration_secs);
        let _ = writeln!(md, "| Throughput | {} |", self.throughput_line());
        let _ = writeln!(md, "| Retries (429) | {} |", s.total_retries);
        let _ = writeln!(md, "| Duplicate-identity sessions | {} |", s.duplicate_sessions);
        let _ = writeln!(md, "| Malformed-payload sessions | {} |\n", s.malformed_sessions);

        let _ = writeln!(md, "## Latency\n");
        let _ = writeln!(md, "| Percentile | Total session |\n|---|---|");
        let l = s.latency.as_ref();
        let _ = writeln!(md, "| p50 | {} |", secs(l.map(|l| l.p50_secs)));
        let _ = writeln!(md, "| p95 | {} |", secs(l.map(|l| l.p95_secs)));
        let _ = writeln!(md, "| p99 | {} |\n", secs(l.map(|l| l.p99_secs)));

        if !s.step_mean_secs.is_empty() {
            let _ = writeln!(md, "| Step | Mean |\n|---|---|");
            for (step, mean) in &s.step_mean_secs {
                let _ = writeln!(md, "| {} | {:.3}s |", step.name(), mean);
            }
            md.push('\n');
        }

        if !s.archetypes.is_empty() {
            let _ = writeln!(md, "## Hardware archetypes\n");
            let _ = writeln!(md, "| Archetype | Weight | Sessions | Successes |\n|---|---|---|---|");
            for a in &s.archetypes {
                let _ = writeln!(md, "| {} | {:.1}x | {} | {} |", a.archetype, a.weight, a.sessions, a.successes);
            }
            md.push('\n');
        }

        let _ = writeln!(md, "## Failures\n");
        if s.top_errors.is_empty() {
            let _ = writeln!(md, "No failures.");
        } else {
            let _ = writeln!(md, "| Kind | Sessions |\n|---|---|");
            for (kind, count) in &s.failure_kinds {
                let _ = writeln!(md, "| {kind} | {count} |");
            }
            let _ = writeln!(md, "\n| Count | Error |\n|---|---|");
            for e in &s.top_errors {
                let _ = writeln!(md, "| {} | {} |", e.count, e.error.replace('|', "\\|"));
            }
        }
        md
    }

    /// JSON when the path ends in `.json`, Markdown otherwise.
    pub fn write_to(&self, path: &Path) -> Result<(), ReportError> {
        let is_json = path.extension().is_some_and(|e| e.eq_ignore_ascii_case("json"));
        let body = if is_json {
            serde_json::to_string_pretty(self)?
        } else {
            self.to_markdown()
        };
        std::fs::write(path, body)?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::metrics::ResultAggregator;
    use crate::metrics::tests::outcome;
    use std::time::Duration;

    fn params() -> ScenarioParams {
        ScenarioParams { num_miners: 3, duplicate_ratio: 0.0, malformed: false, epoch_boundary: false }
    }

    #[test]
    fn markdown_lists_errors_and_percentiles() {
        let outcomes = vec![
            outcome(0, 1, true, None),
            outcome(1, 2, false, Some("HTTP 502: bad gateway")),
            outcome(2, 3, false, Some("HTTP 502: bad gateway")),
        ];
        let summary = ResultAggregator::default().aggregate(&outcomes, Duration::from_secs(4));
        let md = ReportDocument::new("http://node", &params(), 2, summary).to_markdown();
        assert!(md.contains("| Success rate | 33.3% (1/3) |"));
        assert!(md.contains("| p50 | 2.000s |"));
        assert!(md.contains("| 2 | HTTP 502: bad gateway |"));
        assert!(md.contains("| transport-fault | 2 |"));
    }

    #[test]
    fn empty_summary_renders_placeholders() {
        let summary = ResultAggregator::default().aggregate(&[], Duration::ZERO);
        let md = ReportDocument::new("http://node", &params(), 1, summary).to_markdown();
        assert!(md.contains("n/a (no sessions)"));
        assert!(md.contains("| p99 | n/a |"));
        assert!(md.contains("No failures."));
    }

    #[test]
    fn json_output_chosen_by_extension() {
        let dir = tempfile::tempdir().unwrap();
        let summary = ResultAggregator::default().aggregate(&[outcome(0, 1, true, None)], Duration::from_secs(1));
        let doc = ReportDocument::new("http://node", &params(), 1, summary);

        let json_path = dir.path().join("report.json");
        doc.write_to(&json_path).unwrap();
        let v: serde_json::Value = serde_json::from_str(&std::fs::read_to_string(&json_path).unwrap()).unwrap();
        assert_eq!(v["summary"]["successes"], 1);
        assert_eq!(v["target_url"], "http://node");

        let md_path = dir.path().join("report.md");
        doc.write_to(&md_path).unwrap();
        assert!(std::fs::read_to_string(&md_path).unwrap().starts_with("# Attestation Stress Test Report"));
    }
}

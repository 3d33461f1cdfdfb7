use std::time::Duration;

use serde::Serialize;

/// How a single issued request ended.
#[derive(Debug, Clone)]
pub enum Disposition {
    /// A response arrived; `check_passed` records the status-code check.
    Response { status: u16, check_passed: bool },
    /// No response at all: timeout, connection refused, DNS failure, etc.
    TransportFailure { error: String },
}

/// Record of one issued request. Created once by the worker that issued it
/// and never mutated afterwards.
#[derive(Debug, Clone)]
pub struct RequestOutcome {
    /// Time since run start at which the request was issued.
    pub offset: Duration,
    /// Wall-clock time from issue to response or transport error.
    pub duration: Duration,
    pub disposition: Disposition,
}

impl RequestOutcome {
    pub fn check_passed(&self) -> bool {
        matches!(
            self.disposition,
            Disposition::Response {
                check_passed: true,
                ..
            }
        )
    }

    /// Latency in milliseconds, only for requests that got a response.
    /// Transport failures never enter latency statistics.
    pub fn response_duration_ms(&self) -> Option<f64> {
        match self.disposition {
            Disposition::Response { .. } => Some(self.duration.as_secs_f64() * 1000.0),
            Disposition::TransportFailure { .. } => None,
        }
    }
}

/// End-of-run aggregates over the full outcome sequence.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Summary {
    pub total_requests: usize,
    pub responses: usize,
    pub transport_failures: usize,
    pub checks_passed: usize,
    pub dropped_iterations: u64,
    pub average_duration_ms: f64,
    pub p95_duration_ms: f64,
    /// Passed checks over total issued requests; every request, including a
    /// transport failure, contributes exactly one check result.
    pub check_pass_rate: f64,
}

impl Summary {
    pub fn from_outcomes(outcomes: &[RequestOutcome], dropped_iterations: u64) -> Summary {
        let total_requests = outcomes.len();

        let mut durations_ms: Vec<f64> = Vec::new();
        let mut checks_passed = 0usize;
        for outcome in outcomes {
            if let Some(ms) = outcome.response_duration_ms() {
                durations_ms.push(ms);
            }
            if outcome.check_passed() {
                checks_passed += 1;
            }
        }
        durations_ms.sort_by(|a, b| a.total_cmp(b));

        let responses = durations_ms.len();
        let average_duration_ms = if responses == 0 {
            0.0
        } else {
            durations_ms.iter().sum::<f64>() / responses as f64
        };
        let check_pass_rate = if total_requests == 0 {
            1.0 // no check failed
        } else {
            checks_passed as f64 / total_requests as f64
        };

        Summary {
            total_requests,
            responses,
            transport_failures: total_requests - responses,
            checks_passed,
            dropped_iterations,
            average_duration_ms,
            p95_duration_ms: percentile(&durations_ms, 0.95),
            check_pass_rate,
        }
    }
}

/// Nearest-rank percentile over an ascending-sorted slice.
fn percentile(sorted: &[f64], quantile: f64) -> f64 {
    if sorted.is_empty() {
        return 0.0;
    }
    let rank = (quantile * sorted.len() as f64).ceil() as usize;
    sorted[rank.saturating_sub(1).min(sorted.len() - 1)]
}

#[cfg(test)]
mod tests {
    use super::*;

    fn response(offset_ms: u64, duration_ms: u64, status: u16) -> RequestOutcome {
        RequestOutcome {
            offset: Duration::from_millis(offset_ms),
            duration: Duration::from_millis(duration_ms),
            disposition: Disposition::Response {
                status,
                check_passed: status == 200,
            },
        }
    }

    fn failure(offset_ms: u64, duration_ms: u64) -> RequestOutcome {
        RequestOutcome {
            offset: Duration::from_millis(offset_ms),
            duration: Duration::from_millis(duration_ms),
            disposition: Disposition::TransportFailure {
                error: "request timed out".to_string(),
            },
        }
    }

    #[test]
    fn percentile_uses_nearest_rank() {
        let values: Vec<f64> = (1..=100).map(|v| v as f64).collect();
        assert_eq!(percentile(&values, 0.95), 95.0);
        assert_eq!(percentile(&values, 1.0), 100.0);
        assert_eq!(percentile(&[42.0], 0.95), 42.0);
        assert_eq!(percentile(&[], 0.95), 0.0);
    }

    #[test]
    fn summarizes_all_successful_responses() {
        let outcomes: Vec<_> = (0..10).map(|k| response(k * 100, 5, 200)).collect();
        let summary = Summary::from_outcomes(&outcomes, 0);
        assert_eq!(summary.total_requests, 10);
        assert_eq!(summary.responses, 10);
        assert_eq!(summary.transport_failures, 0);
        assert_eq!(summary.average_duration_ms, 5.0);
        assert_eq!(summary.p95_duration_ms, 5.0);
        assert_eq!(summary.check_pass_rate, 1.0);
    }

    #[test]
    fn transport_failures_are_excluded_from_latency_but_fail_checks() {
        let mut outcomes = Vec::new();
        for k in 0..10 {
            if k % 2 == 0 {
                outcomes.push(response(k * 100, 10, 200));
            } else {
                // Transport failures take the full timeout and would skew the
                // latency stats if they were counted.
                outcomes.push(failure(k * 100, 30_000));
            }
        }
        let summary = Summary::from_outcomes(&outcomes, 0);
        assert_eq!(summary.total_requests, 10);
        assert_eq!(summary.responses, 5);
        assert_eq!(summary.transport_failures, 5);
        assert_eq!(summary.average_duration_ms, 10.0);
        assert_eq!(summary.check_pass_rate, 0.5);
    }

    #[test]
    fn non_matching_status_is_a_response_but_a_failed_check() {
        let outcomes = vec![response(0, 5, 500), response(100, 5, 500)];
        let summary = Summary::from_outcomes(&outcomes, 0);
        assert_eq!(summary.responses, 2);
        assert_eq!(summary.checks_passed, 0);
        assert_eq!(summary.check_pass_rate, 0.0);
        assert_eq!(summary.average_duration_ms, 5.0);
    }

    #[test]
    fn empty_run_yields_neutral_summary() {
        let summary = Summary::from_outcomes(&[], 0);
        assert_eq!(summary.total_requests, 0);
        assert_eq!(summary.average_duration_ms, 0.0);
        assert_eq!(summary.p95_duration_ms, 0.0);
        assert_eq!(summary.check_pass_rate, 1.0);
    }

    #[test]
    fn pass_rate_stays_within_bounds() {
        let outcomes = vec![
            response(0, 5, 200),
            response(100, 5, 500),
            failure(200, 30_000),
        ];
        let summary = Summary::from_outcomes(&outcomes, 0);
        assert!(summary.check_pass_rate >= 0.0 && summary.check_pass_rate <= 1.0);
        assert_eq!(
            summary.checks_passed as f64 / summary.total_requests as f64,
            summary.check_pass_rate
        );
        for outcome in &outcomes {
            assert!(outcome.duration >= Duration::ZERO);
        }
    }
}

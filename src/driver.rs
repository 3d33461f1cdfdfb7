use std::sync::Arc;

use futures::future::join_all;
use log::{debug, info, warn};
use tokio::sync::{mpsc, Mutex};
use tokio::task::JoinHandle;
use tokio::time::{sleep_until, Instant};

use crate::config::RunConfig;
use crate::factory::Transport;
use crate::stats::{Disposition, RequestOutcome};

/// What a finished run produced: every issued request's outcome, ordered by
/// issue offset, plus the count of iterations that could not start on
/// schedule.
#[derive(Debug)]
pub struct RunRecord {
    pub outcomes: Vec<RequestOutcome>,
    pub dropped_iterations: u64,
}

/// Constant-arrival-rate driver: target issue times are computed up front and
/// spaced 1/rate apart, and an elastic pool of workers (pre-allocated up to a
/// hard maximum) carries them out, one request per tick.
pub struct Driver {
    config: Arc<RunConfig>,
    transport: Arc<dyn Transport>,
}

impl Driver {
    pub fn new(config: RunConfig, transport: Arc<dyn Transport>) -> Self {
        Driver {
            config: Arc::new(config),
            transport,
        }
    }

    pub async fn run(&self) -> RunRecord {
        let interval = self.config.tick_interval();
        let total_ticks = self.config.total_ticks();
        let start = Instant::now();
        let run_deadline = start + self.config.duration;

        // Capacity 1: a busy pool makes the scheduler fall behind schedule
        // instead of queueing ticks unboundedly.
        let (tick_tx, tick_rx) = mpsc::channel::<Instant>(1);
        let tick_rx = Arc::new(Mutex::new(tick_rx));

        let mut workers: Vec<JoinHandle<Vec<RequestOutcome>>> = Vec::new();
        for _ in 0..self.config.pre_allocated_workers {
            workers.push(self.spawn_worker(tick_rx.clone(), start));
        }
        info!(
            "run started: {} ticks at {} req/s over {:?}, {} workers pre-allocated (max {})",
            total_ticks,
            self.config.rate,
            self.config.duration,
            self.config.pre_allocated_workers,
            self.config.max_workers
        );

        let mut dropped_iterations = 0u64;
        'schedule: for tick in 0..total_ticks {
            let target = start + interval * tick as u32;
            sleep_until(target).await;

            match tick_tx.try_send(target) {
                Ok(()) => {}
                Err(mpsc::error::TrySendError::Full(target)) => {
                    if workers.len() < self.config.max_workers {
                        // All current workers busy: grow the pool first.
                        workers.push(self.spawn_worker(tick_rx.clone(), start));
                        debug!("scaled worker pool to {}", workers.len());
                        if tick_tx.send(target).await.is_err() {
                            break 'schedule;
                        }
                    } else {
                        // Pool is at its hard maximum; the iteration cannot
                        // start on schedule and is counted as dropped. It is
                        // still issued late unless the run window ends first.
                        dropped_iterations += 1;
                        warn!(
                            "tick {} delayed: all {} workers busy",
                            tick,
                            workers.len()
                        );
                        tokio::select! {
                            sent = tick_tx.send(target) => {
                                if sent.is_err() {
                                    break 'schedule;
                                }
                            }
                            _ = sleep_until(run_deadline) => {
                                dropped_iterations += total_ticks - tick - 1;
                                warn!(
                                    "run window elapsed with {} ticks unissued",
                                    total_ticks - tick
                                );
                                break 'schedule;
                            }
                        }
                    }
                }
                Err(mpsc::error::TrySendError::Closed(_)) => break 'schedule,
            }
        }

        // Closing the channel stops the workers once they drain it; in-flight
        // requests run to completion bounded by the per-request timeout.
        drop(tick_tx);

        let mut outcomes: Vec<RequestOutcome> = Vec::new();
        for joined in join_all(workers).await {
            match joined {
                Ok(mut worker_outcomes) => outcomes.append(&mut worker_outcomes),
                Err(e) => warn!("worker task failed: {}", e),
            }
        }
        outcomes.sort_by_key(|outcome| outcome.offset);

        info!(
            "run finished: {} requests issued, {} iterations dropped",
            outcomes.len(),
            dropped_iterations
        );
        RunRecord {
            outcomes,
            dropped_iterations,
        }
    }

    fn spawn_worker(
        &self,
        tick_rx: Arc<Mutex<mpsc::Receiver<Instant>>>,
        run_start: Instant,
    ) -> JoinHandle<Vec<RequestOutcome>> {
        let transport = self.transport.clone();
        let expected_status = self.config.expected_status;
        tokio::spawn(async move {
            // Outcomes are worker-owned and merged after join, so no shared
            // lock is held for the duration of a request.
            let mut outcomes = Vec::new();
            loop {
                let tick = { tick_rx.lock().await.recv().await };
                let Some(tick) = tick else { break };
                // The target time is a lower bound; never issue early.
                sleep_until(tick).await;
                outcomes.push(execute_once(transport.as_ref(), expected_status, run_start).await);
            }
            outcomes
        })
    }
}

/// Issues exactly one request and classifies the result. Transport failures
/// are recorded, never propagated; the schedule is what is being measured.
async fn execute_once(
    transport: &dyn Transport,
    expected_status: u16,
    run_start: Instant,
) -> RequestOutcome {
    let offset = run_start.elapsed();
    let issued = Instant::now();
    let disposition = match transport.dispatch().await {
        Ok(status) => {
            let check_passed = status == expected_status;
            if !check_passed {
                debug!(
                    "check failed: status {} (expected {})",
                    status, expected_status
                );
            }
            Disposition::Response {
                status,
                check_passed,
            }
        }
        Err(e) => {
            debug!("transport failure: {}", e);
            Disposition::TransportFailure {
                error: e.to_string(),
            }
        }
    };
    RequestOutcome {
        offset,
        duration: issued.elapsed(),
        disposition,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::HttpMethod;
    use crate::factory::TransportError;
    use crate::stats::Summary;
    use crate::thresholds::{evaluate, parse_specs, verdict};
    use async_trait::async_trait;
    use std::collections::HashMap;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::Duration;
    use tokio::time::sleep;

    fn run_config(rate: u32, duration_secs: u64, pre: usize, max: usize) -> RunConfig {
        RunConfig {
            url: "http://localhost:8000/generar_pdf/".parse().unwrap(),
            method: HttpMethod::POST,
            headers: HashMap::new(),
            body: b"{}".to_vec(),
            rate,
            duration: Duration::from_secs(duration_secs),
            pre_allocated_workers: pre,
            max_workers: max,
            expected_status: 200,
            request_timeout: Duration::from_secs(30),
        }
    }

    fn default_thresholds() -> Vec<crate::thresholds::ThresholdSpec> {
        let raw = HashMap::from([
            ("average_duration".to_string(), vec!["<500".to_string()]),
            ("p95_duration".to_string(), vec!["<1000".to_string()]),
            ("check_pass_rate".to_string(), vec![">0.95".to_string()]),
        ]);
        parse_specs(&raw).unwrap()
    }

    /// Always responds with the same status after a fixed delay.
    struct FixedResponse {
        status: u16,
        delay: Duration,
    }

    #[async_trait]
    impl Transport for FixedResponse {
        async fn dispatch(&self) -> Result<u16, TransportError> {
            sleep(self.delay).await;
            Ok(self.status)
        }
    }

    /// Times out on every second dispatch.
    struct AlternatingTimeout {
        calls: AtomicUsize,
    }

    #[async_trait]
    impl Transport for AlternatingTimeout {
        async fn dispatch(&self) -> Result<u16, TransportError> {
            let call = self.calls.fetch_add(1, Ordering::SeqCst);
            if call % 2 == 0 {
                sleep(Duration::from_millis(5)).await;
                Ok(200)
            } else {
                sleep(Duration::from_secs(1)).await;
                Err(TransportError::Timeout)
            }
        }
    }

    #[tokio::test(start_paused = true)]
    async fn issues_rate_times_duration_requests() {
        let driver = Driver::new(
            run_config(10, 10, 10, 60),
            Arc::new(FixedResponse {
                status: 200,
                delay: Duration::from_millis(5),
            }),
        );
        let record = driver.run().await;

        assert_eq!(record.outcomes.len(), 100);
        assert_eq!(record.dropped_iterations, 0);

        let summary = Summary::from_outcomes(&record.outcomes, record.dropped_iterations);
        assert!((summary.average_duration_ms - 5.0).abs() < 0.5);
        assert!((summary.p95_duration_ms - 5.0).abs() < 0.5);
        assert_eq!(summary.check_pass_rate, 1.0);

        let reports = evaluate(&default_thresholds(), &summary);
        assert!(verdict(&reports));
    }

    #[tokio::test(start_paused = true)]
    async fn outcomes_are_ordered_and_never_issued_early() {
        let driver = Driver::new(
            run_config(10, 2, 10, 60),
            Arc::new(FixedResponse {
                status: 200,
                delay: Duration::from_millis(5),
            }),
        );
        let record = driver.run().await;

        let interval = Duration::from_millis(100);
        for (tick, outcome) in record.outcomes.iter().enumerate() {
            assert!(outcome.offset >= interval * tick as u32);
            assert!(outcome.duration >= Duration::ZERO);
        }
    }

    #[tokio::test(start_paused = true)]
    async fn all_error_statuses_fail_the_check_threshold() {
        let driver = Driver::new(
            run_config(10, 10, 10, 60),
            Arc::new(FixedResponse {
                status: 500,
                delay: Duration::from_millis(5),
            }),
        );
        let record = driver.run().await;
        let summary = Summary::from_outcomes(&record.outcomes, record.dropped_iterations);

        assert_eq!(summary.check_pass_rate, 0.0);
        assert_eq!(summary.responses, 100);

        // Latency thresholds pass, the check-rate threshold alone sinks the run.
        let reports = evaluate(&default_thresholds(), &summary);
        assert!(!verdict(&reports));
        let failed: Vec<_> = reports.iter().filter(|r| !r.passed).collect();
        assert_eq!(failed.len(), 1);
        assert_eq!(failed[0].metric, "check_pass_rate");
    }

    #[tokio::test(start_paused = true)]
    async fn timeouts_are_excluded_from_latency_and_fail_checks() {
        let driver = Driver::new(
            run_config(10, 2, 10, 60),
            Arc::new(AlternatingTimeout {
                calls: AtomicUsize::new(0),
            }),
        );
        let record = driver.run().await;
        let summary = Summary::from_outcomes(&record.outcomes, record.dropped_iterations);

        assert_eq!(summary.total_requests, 20);
        assert_eq!(summary.transport_failures, 10);
        assert_eq!(summary.responses, 10);
        assert_eq!(summary.check_pass_rate, 0.5);
        // Mean over responses only; the 1s timeouts never enter the stats.
        assert!((summary.average_duration_ms - 5.0).abs() < 0.5);

        let reports = evaluate(&default_thresholds(), &summary);
        assert!(!verdict(&reports));
    }

    #[tokio::test(start_paused = true)]
    async fn starved_pool_reports_dropped_iterations() {
        // One worker, 300ms per request, ticks every 100ms: most iterations
        // cannot start on schedule.
        let driver = Driver::new(
            run_config(10, 1, 1, 1),
            Arc::new(FixedResponse {
                status: 200,
                delay: Duration::from_millis(300),
            }),
        );
        let record = driver.run().await;

        assert!(record.dropped_iterations > 0);
        assert!(record.outcomes.len() < 10);
    }

    #[tokio::test(start_paused = true)]
    async fn pool_scales_up_before_dropping() {
        // Requests take 10 ticks each, but the pool may grow far beyond the
        // two pre-allocated workers, so nothing is dropped.
        let driver = Driver::new(
            run_config(10, 2, 2, 60),
            Arc::new(FixedResponse {
                status: 200,
                delay: Duration::from_secs(1),
            }),
        );
        let record = driver.run().await;

        assert_eq!(record.outcomes.len(), 20);
        assert_eq!(record.dropped_iterations, 0);
    }

    #[tokio::test(start_paused = true)]
    async fn identical_runs_produce_equivalent_summaries() {
        let driver = Driver::new(
            run_config(10, 10, 10, 60),
            Arc::new(FixedResponse {
                status: 200,
                delay: Duration::from_millis(10),
            }),
        );

        let first = driver.run().await;
        let second = driver.run().await;
        let first = Summary::from_outcomes(&first.outcomes, first.dropped_iterations);
        let second = Summary::from_outcomes(&second.outcomes, second.dropped_iterations);

        assert_eq!(first.total_requests, second.total_requests);
        assert_eq!(first.check_pass_rate, second.check_pass_rate);
        assert!((first.average_duration_ms - second.average_duration_ms).abs() < 0.5);
        assert!((first.p95_duration_ms - second.p95_duration_ms).abs() < 0.5);
        assert!((first.average_duration_ms - 10.0).abs() < 0.5);
    }
}

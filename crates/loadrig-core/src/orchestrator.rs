use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tokio::sync::watch;
use tokio::time::{Instant, MissedTickBehavior};
use tracing::{error, info, warn};

use crate::config::Config;
use crate::metrics::{MetricSink, MetricSummary};
use crate::scenario::{Scenario, SetupContext};
use crate::scheduler::{SchedulerSettings, VuScheduler};
use crate::threshold::{ThresholdOutcome, ThresholdSet};
use crate::transport::Transport;

const BREACH_CHECK_INTERVAL: Duration = Duration::from_secs(1);

/// Final immutable snapshot of one run.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TestResult {
    pub scenario: String,
    pub timestamp: String,
    pub duration_ms: u64,
    pub iterations: u64,
    pub aborted: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub abort_reason: Option<String>,
    pub metrics: BTreeMap<String, MetricSummary>,
    pub thresholds: Vec<ThresholdOutcome>,
    /// AND across all thresholds; a missing or empty metric fails its
    /// threshold.
    pub passed: bool,
}

impl TestResult {
    /// Exit-code convention for wrapping tools: success only when every
    /// threshold passed and the run was not aborted.
    pub fn success(&self) -> bool {
        self.passed && !self.aborted
    }
}

/// Runs one complete test: setup once, the full schedule, teardown once, then
/// the authoritative threshold evaluation.
///
/// Setup failure aborts before any VU starts and skips teardown. Teardown
/// failure is logged and never changes the verdict. The external `shutdown`
/// signal drains the run cooperatively; in-flight iterations complete.
pub async fn run_test(
    config: &Config,
    scenario: Arc<dyn Scenario>,
    transport: Arc<dyn Transport>,
    shutdown: watch::Receiver<bool>,
) -> anyhow::Result<TestResult> {
    let thresholds = ThresholdSet::from_config(&config.thresholds)?;
    let schedule = config.schedule();
    let settings = SchedulerSettings {
        // A zero tick would spin; clamp to 1ms.
        tick: Duration::from_millis(config.options.tick_ms.max(1)),
        max_vus: config.options.max_vus,
    };

    let metrics = MetricSink::new();
    let setup_cx = SetupContext::new(transport.clone(), metrics.clone());
    let timestamp = chrono::Utc::now().to_rfc3339();
    let started = Instant::now();

    info!(
        scenario = scenario.name(),
        stages = schedule.stages().len(),
        thresholds = thresholds.len(),
        "run starting"
    );

    let shared = match scenario.setup(&setup_cx).await {
        Ok(shared) => Arc::new(shared),
        Err(err) => {
            error!(%err, "setup failed, aborting before any VU starts");
            let outcomes = thresholds.evaluate(&metrics);
            let passed = overall(&outcomes);
            return Ok(TestResult {
                scenario: scenario.name().to_string(),
                timestamp,
                duration_ms: started.elapsed().as_millis() as u64,
                iterations: 0,
                aborted: true,
                abort_reason: Some(err.to_string()),
                metrics: metrics.snapshot_all(),
                thresholds: outcomes,
                passed,
            });
        }
    };

    // Internal cancel fans in the external shutdown signal and, when
    // configured, threshold breaches.
    let (cancel_tx, cancel_rx) = watch::channel(false);
    {
        let mut shutdown = shutdown.clone();
        let cancel_tx = cancel_tx.clone();
        tokio::spawn(async move {
            if shutdown.wait_for(|stop| *stop).await.is_ok() {
                let _ = cancel_tx.send(true);
            }
        });
    }

    let breach_watcher = if config.options.abort_on_breach && !thresholds.is_empty() {
        Some(spawn_breach_watcher(
            thresholds.clone(),
            metrics.clone(),
            cancel_tx.clone(),
            cancel_rx.clone(),
        ))
    } else {
        None
    };

    let scheduler = VuScheduler::new(schedule, settings);
    let iterations = scheduler
        .run(
            scenario.clone(),
            shared.clone(),
            transport.clone(),
            metrics.clone(),
            config.scenario.seed,
            cancel_rx,
        )
        .await;

    let _ = cancel_tx.send(true);
    let breach = match breach_watcher {
        Some(handle) => handle.await.unwrap_or(None),
        None => None,
    };

    if let Err(err) = scenario.teardown(&setup_cx, &shared).await {
        // Reported, but never changes the already-earned verdict.
        error!(err = %err, "teardown failed");
    }

    let outcomes = thresholds.evaluate(&metrics);
    let passed = overall(&outcomes);
    let externally_aborted = *shutdown.borrow();
    let abort_reason = breach.or_else(|| {
        externally_aborted.then(|| "aborted by shutdown signal".to_string())
    });

    let result = TestResult {
        scenario: scenario.name().to_string(),
        timestamp,
        duration_ms: started.elapsed().as_millis() as u64,
        iterations,
        aborted: abort_reason.is_some(),
        abort_reason,
        metrics: metrics.snapshot_all(),
        thresholds: outcomes,
        passed,
    };
    info!(
        iterations = result.iterations,
        passed = result.passed,
        aborted = result.aborted,
        "run finished"
    );
    Ok(result)
}

fn overall(outcomes: &[ThresholdOutcome]) -> bool {
    outcomes.iter().all(|outcome| outcome.passed)
}

fn spawn_breach_watcher(
    thresholds: ThresholdSet,
    metrics: MetricSink,
    cancel_tx: watch::Sender<bool>,
    mut cancel_rx: watch::Receiver<bool>,
) -> tokio::task::JoinHandle<Option<String>> {
    tokio::spawn(async move {
        let mut interval = tokio::time::interval(BREACH_CHECK_INTERVAL);
        interval.set_missed_tick_behavior(MissedTickBehavior::Skip);
        loop {
            tokio::select! {
                _ = interval.tick() => {
                    // Only breaches with observed data abort; thresholds on
                    // metrics with no samples yet stay pending.
                    let breached = thresholds
                        .evaluate(&metrics)
                        .into_iter()
                        .find(|outcome| !outcome.passed && outcome.observed.is_some());
                    if let Some(outcome) = breached {
                        warn!(
                            metric = %outcome.metric,
                            expression = %outcome.expression,
                            "threshold breached, aborting run"
                        );
                        let _ = cancel_tx.send(true);
                        return Some(format!(
                            "threshold breached: {} {}",
                            outcome.metric, outcome.expression
                        ));
                    }
                }
                _ = cancel_rx.wait_for(|stop| *stop) => return None,
            }
        }
    })
}

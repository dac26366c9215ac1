use std::time::Duration;

use tokio::time::Instant;
use tracing::warn;

use crate::error::IterationError;
use crate::metrics::{ERRORS, ITERATIONS, ITERATION_DURATION};
use crate::scenario::{Scenario, VuContext};

/// Outcome of a single iteration. The runner never lets an iteration error
/// escape into the VU loop.
#[derive(Debug)]
pub struct IterationOutcome {
    pub duration: Duration,
    pub failed: bool,
    pub error: Option<IterationError>,
}

/// Runs one iteration to completion: times it, converts any failure into
/// metric samples, and reports the outcome.
pub async fn run_iteration(scenario: &dyn Scenario, vu: &VuContext) -> IterationOutcome {
    let start = Instant::now();
    let result = scenario.iteration(vu).await;
    let duration = start.elapsed();

    let metrics = vu.metrics();
    metrics.add_trend(ITERATION_DURATION, duration.as_secs_f64() * 1000.0);
    metrics.add_counter(ITERATIONS, 1.0);
    vu.bump_iteration();

    match result {
        Ok(()) => {
            metrics.add_rate(ERRORS, false);
            IterationOutcome {
                duration,
                failed: false,
                error: None,
            }
        }
        Err(error) => {
            warn!(vu = vu.vu_id(), %error, "iteration failed");
            metrics.add_rate(ERRORS, true);
            IterationOutcome {
                duration,
                failed: true,
                error: Some(error),
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::SetupError;
    use crate::metrics::{MetricSink, MetricSummary};
    use crate::sampler::Sampler;
    use crate::scenario::{ScenarioFuture, SetupContext, SharedContext};
    use crate::transport::MockTransport;
    use std::sync::Arc;
    use tokio::sync::watch;

    struct FlakyScenario {
        fail: bool,
    }

    impl Scenario for FlakyScenario {
        fn name(&self) -> &'static str {
            "flaky"
        }

        fn setup<'a>(
            &'a self,
            _cx: &'a SetupContext,
        ) -> ScenarioFuture<'a, Result<SharedContext, SetupError>> {
            Box::pin(async { Ok(serde_json::json!({})) })
        }

        fn iteration<'a>(
            &'a self,
            _vu: &'a VuContext,
        ) -> ScenarioFuture<'a, Result<(), IterationError>> {
            Box::pin(async move {
                tokio::time::sleep(Duration::from_millis(20)).await;
                if self.fail {
                    Err(IterationError::Other(anyhow::anyhow!("boom")))
                } else {
                    Ok(())
                }
            })
        }

        fn teardown<'a>(
            &'a self,
            _cx: &'a SetupContext,
            _shared: &'a SharedContext,
        ) -> ScenarioFuture<'a, anyhow::Result<()>> {
            Box::pin(async { Ok(()) })
        }
    }

    fn vu(metrics: MetricSink) -> (VuContext, watch::Sender<bool>) {
        let (tx, rx) = watch::channel(false);
        let vu = VuContext::new(
            1,
            Arc::new(serde_json::json!({})),
            Arc::new(MockTransport::new(1)),
            metrics,
            Sampler::new(1),
            rx,
        );
        (vu, tx)
    }

    #[tokio::test(start_paused = true)]
    async fn test_successful_iteration_records_samples() {
        let metrics = MetricSink::new();
        let (vu, _cancel) = vu(metrics.clone());
        let scenario = FlakyScenario { fail: false };

        let outcome = run_iteration(&scenario, &vu).await;
        assert!(!outcome.failed);
        assert!(outcome.error.is_none());
        assert!(outcome.duration >= Duration::from_millis(20));
        assert_eq!(vu.iteration(), 1);

        match metrics.snapshot(ITERATION_DURATION) {
            Some(MetricSummary::Trend { count, .. }) => assert_eq!(count, 1),
            other => panic!("unexpected summary: {other:?}"),
        }
        match metrics.snapshot(ERRORS) {
            Some(MetricSummary::Rate { trues, total, .. }) => {
                assert_eq!((trues, total), (0, 1));
            }
            other => panic!("unexpected summary: {other:?}"),
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_failed_iteration_is_isolated() {
        let metrics = MetricSink::new();
        let (vu, _cancel) = vu(metrics.clone());
        let scenario = FlakyScenario { fail: true };

        let outcome = run_iteration(&scenario, &vu).await;
        assert!(outcome.failed);
        assert!(outcome.error.is_some());

        // The failure still produced a full set of samples.
        match metrics.snapshot(ERRORS) {
            Some(MetricSummary::Rate { trues, total, .. }) => {
                assert_eq!((trues, total), (1, 1));
            }
            other => panic!("unexpected summary: {other:?}"),
        }
        match metrics.snapshot(ITERATIONS) {
            Some(MetricSummary::Counter { sum, .. }) => assert_eq!(sum, 1.0),
            other => panic!("unexpected summary: {other:?}"),
        }
    }
}

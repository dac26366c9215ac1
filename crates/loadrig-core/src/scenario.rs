use std::future::Future;
use std::pin::Pin;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::watch;
use tracing::debug;

use crate::error::{IterationError, SetupError, TransportError};
use crate::metrics::{MetricSink, CHECKS, HTTP_REQ_DURATION, HTTP_REQ_FAILED};
use crate::sampler::Sampler;
use crate::transport::{HttpRequest, HttpResponse, Transport};

/// Value produced by setup, shared read-only with every VU for the whole run.
pub type SharedContext = serde_json::Value;

pub type ScenarioFuture<'a, T> = Pin<Box<dyn Future<Output = T> + Send + 'a>>;

/// User-supplied script: one setup, an iteration body run repeatedly by every
/// VU, one teardown.
pub trait Scenario: Send + Sync {
    fn name(&self) -> &'static str;

    fn setup<'a>(
        &'a self,
        cx: &'a SetupContext,
    ) -> ScenarioFuture<'a, Result<SharedContext, SetupError>>;

    fn iteration<'a>(&'a self, vu: &'a VuContext)
        -> ScenarioFuture<'a, Result<(), IterationError>>;

    fn teardown<'a>(
        &'a self,
        cx: &'a SetupContext,
        shared: &'a SharedContext,
    ) -> ScenarioFuture<'a, anyhow::Result<()>>;
}

/// Handed to setup and teardown, which run outside any VU.
pub struct SetupContext {
    transport: Arc<dyn Transport>,
    metrics: MetricSink,
}

impl SetupContext {
    pub(crate) fn new(transport: Arc<dyn Transport>, metrics: MetricSink) -> Self {
        Self { transport, metrics }
    }

    pub fn metrics(&self) -> &MetricSink {
        &self.metrics
    }

    pub async fn request(&self, req: &HttpRequest) -> Result<HttpResponse, TransportError> {
        match self.transport.request(req).await {
            Ok(response) => {
                record_http(&self.metrics, &response);
                Ok(response)
            }
            Err(err) => {
                self.metrics.add_rate(HTTP_REQ_FAILED, true);
                Err(err)
            }
        }
    }

    pub fn check(&self, name: &str, pass: bool) -> bool {
        record_check(&self.metrics, name, pass)
    }
}

/// Per-VU execution context: the only API iteration code sees.
pub struct VuContext {
    vu_id: u64,
    iterations: AtomicU64,
    shared: Arc<SharedContext>,
    transport: Arc<dyn Transport>,
    metrics: MetricSink,
    sampler: Sampler,
    cancel: watch::Receiver<bool>,
}

impl VuContext {
    pub(crate) fn new(
        vu_id: u64,
        shared: Arc<SharedContext>,
        transport: Arc<dyn Transport>,
        metrics: MetricSink,
        sampler: Sampler,
        cancel: watch::Receiver<bool>,
    ) -> Self {
        Self {
            vu_id,
            iterations: AtomicU64::new(0),
            shared,
            transport,
            metrics,
            sampler,
            cancel,
        }
    }

    pub fn vu_id(&self) -> u64 {
        self.vu_id
    }

    /// Iterations this VU has completed so far.
    pub fn iteration(&self) -> u64 {
        self.iterations.load(Ordering::Relaxed)
    }

    pub(crate) fn bump_iteration(&self) {
        self.iterations.fetch_add(1, Ordering::Relaxed);
    }

    pub fn shared(&self) -> &SharedContext {
        &self.shared
    }

    pub fn metrics(&self) -> &MetricSink {
        &self.metrics
    }

    /// Issues a request through the transport, recording `http_req_duration`
    /// and `http_req_failed`. A transport-level failure is recorded as a
    /// failed request before being handed back to the iteration.
    pub async fn request(&self, req: &HttpRequest) -> Result<HttpResponse, IterationError> {
        match self.transport.request(req).await {
            Ok(response) => {
                record_http(&self.metrics, &response);
                Ok(response)
            }
            Err(err) => {
                self.metrics.add_rate(HTTP_REQ_FAILED, true);
                Err(IterationError::Transport(err))
            }
        }
    }

    /// Records a named assertion into the `checks` rate and returns it.
    pub fn check(&self, name: &str, pass: bool) -> bool {
        record_check(&self.metrics, name, pass)
    }

    /// Like `check`, but fails the iteration when the assertion does not hold.
    pub fn require(&self, name: &str, pass: bool) -> Result<(), IterationError> {
        if self.check(name, pass) {
            Ok(())
        } else {
            Err(IterationError::CheckFailed(name.to_string()))
        }
    }

    /// True with probability `p`, drawn from this VU's seeded sampler.
    pub fn chance(&self, p: f64) -> bool {
        self.sampler.chance(p)
    }

    /// Cancellable pause between operations. Returns `true` when cut short by
    /// run cancellation.
    pub async fn sleep(&self, duration: Duration) -> bool {
        let mut cancel = self.cancel.clone();
        tokio::select! {
            () = tokio::time::sleep(duration) => false,
            _ = cancel.wait_for(|stop| *stop) => true,
        }
    }

    pub fn is_cancelled(&self) -> bool {
        *self.cancel.borrow()
    }
}

fn record_http(metrics: &MetricSink, response: &HttpResponse) {
    metrics.add_trend(HTTP_REQ_DURATION, response.duration.as_secs_f64() * 1000.0);
    metrics.add_rate(HTTP_REQ_FAILED, response.status >= 400);
}

fn record_check(metrics: &MetricSink, name: &str, pass: bool) -> bool {
    metrics.add_rate(CHECKS, pass);
    if !pass {
        debug!(check = name, "check failed");
    }
    pass
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::metrics::MetricSummary;
    use crate::transport::MockTransport;

    fn vu_context(cancel: watch::Receiver<bool>) -> VuContext {
        VuContext::new(
            0,
            Arc::new(serde_json::json!({})),
            Arc::new(MockTransport::new(1)),
            MetricSink::new(),
            Sampler::new(1),
            cancel,
        )
    }

    #[tokio::test]
    async fn test_request_records_http_metrics() {
        let (_tx, rx) = watch::channel(false);
        let vu = vu_context(rx);

        let response = vu
            .request(&HttpRequest::get("http://localhost/health"))
            .await
            .unwrap();
        assert!(response.is_success());

        match vu.metrics().snapshot(HTTP_REQ_DURATION) {
            Some(MetricSummary::Trend { count, .. }) => assert_eq!(count, 1),
            other => panic!("unexpected summary: {other:?}"),
        }
        match vu.metrics().snapshot(HTTP_REQ_FAILED) {
            Some(MetricSummary::Rate { trues, total, .. }) => {
                assert_eq!((trues, total), (0, 1));
            }
            other => panic!("unexpected summary: {other:?}"),
        }
    }

    #[tokio::test]
    async fn test_checks_feed_the_checks_rate() {
        let (_tx, rx) = watch::channel(false);
        let vu = vu_context(rx);

        assert!(vu.check("passes", true));
        assert!(!vu.check("fails", false));
        assert!(matches!(
            vu.require("hard fail", false),
            Err(IterationError::CheckFailed(_))
        ));

        match vu.metrics().snapshot(CHECKS) {
            Some(MetricSummary::Rate { trues, total, .. }) => {
                assert_eq!((trues, total), (1, 3));
            }
            other => panic!("unexpected summary: {other:?}"),
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_sleep_observes_cancellation() {
        let (tx, rx) = watch::channel(false);
        let vu = vu_context(rx);

        assert!(!vu.sleep(Duration::from_millis(10)).await);

        tx.send(true).unwrap();
        assert!(vu.sleep(Duration::from_secs(3600)).await);
        assert!(vu.is_cancelled());
    }
}

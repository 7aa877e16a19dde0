use std::time::Instant;

use prometheus::{histogram_opts, opts, HistogramVec, IntCounter, IntCounterVec, Registry};

use crate::Error;

#[derive(Clone)]
pub struct Metrics {
    pub reconciliations: IntCounter,
    pub failures: IntCounterVec,
    pub child_failures: IntCounterVec,
    pub reconcile_duration: HistogramVec,
}

impl Default for Metrics {
    fn default() -> Self {
        let reconcile_duration = HistogramVec::new(
            histogram_opts!(
                "mk_controller_reconcile_duration_seconds",
                "The duration of reconcile to complete in seconds"
            )
            .buckets(vec![0.01, 0.1, 0.25, 0.5, 1., 5., 15., 60.]),
            &[],
        )
        .unwrap();
        let failures = IntCounterVec::new(
            opts!(
                "mk_controller_reconciliation_errors_total",
                "reconciliation errors"
            ),
            &["key", "error"],
        )
        .unwrap();
        let child_failures = IntCounterVec::new(
            opts!(
                "mk_controller_child_create_errors_total",
                "child object create errors"
            ),
            &["kind", "error"],
        )
        .unwrap();
        let reconciliations =
            IntCounter::new("mk_controller_reconciliations_total", "reconciliations").unwrap();
        Metrics {
            reconciliations,
            failures,
            child_failures,
            reconcile_duration,
        }
    }
}

impl Metrics {
    /// Register API metrics to start tracking them.
    pub fn register(self, registry: &Registry) -> Result<Self, prometheus::Error> {
        registry.register(Box::new(self.reconciliations.clone()))?;
        registry.register(Box::new(self.failures.clone()))?;
        registry.register(Box::new(self.child_failures.clone()))?;
        registry.register(Box::new(self.reconcile_duration.clone()))?;
        Ok(self)
    }

    pub fn reconcile_failure(&self, key: &str, e: &Error) {
        self.failures
            .with_label_values(&[key, e.metric_label().as_ref()])
            .inc()
    }

    pub fn child_create_failure(&self, kind: &str, e: &Error) {
        self.child_failures
            .with_label_values(&[kind, e.metric_label().as_ref()])
            .inc()
    }

    pub fn count_and_measure(&self) -> ReconcileMeasurer {
        self.reconciliations.inc();
        ReconcileMeasurer {
            start: Instant::now(),
            metric: self.reconcile_duration.clone(),
        }
    }
}

/// Smart function duration measurer
///
/// Relies on Drop to calculate duration and register the observation in the histogram
pub struct ReconcileMeasurer {
    start: Instant,
    metric: HistogramVec,
}

impl Drop for ReconcileMeasurer {
    fn drop(&mut self) {
        #[allow(clippy::cast_precision_loss)]
        let duration = self.start.elapsed().as_millis() as f64 / 1000.0;
        self.metric.with_label_values(&[]).observe(duration);
    }
}

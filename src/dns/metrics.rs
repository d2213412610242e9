use std::time::Duration;

use anyhow::Result;
use prometheus::{HistogramOpts, HistogramVec, IntCounterVec, Opts, Registry};

/// Receives per-upstream outcomes of successful exchanges.
pub trait MetricsSink: Send + Sync {
    fn record_exchange(&self, upstream: &str, rcode: &str, elapsed: Duration);
}

pub struct NoopMetrics;

impl MetricsSink for NoopMetrics {
    fn record_exchange(&self, _upstream: &str, _rcode: &str, _elapsed: Duration) {}
}

pub struct PrometheusMetrics {
    request_count: IntCounterVec,
    rcode_count: IntCounterVec,
    request_duration: HistogramVec,
}

impl PrometheusMetrics {
    pub fn new(registry: &Registry) -> Result<Self> {
        let request_count = IntCounterVec::new(
            Opts::new("fanout_request_count_total", "Counter of requests made per upstream."),
            &["to"],
        )?;
        let rcode_count = IntCounterVec::new(
            Opts::new(
                "fanout_response_rcode_count_total",
                "Counter of responses per upstream and response code.",
            ),
            &["rcode", "to"],
        )?;
        let request_duration = HistogramVec::new(
            HistogramOpts::new(
                "fanout_request_duration_seconds",
                "Histogram of the time each request took.",
            )
            .buckets(prometheus::exponential_buckets(0.00025, 2.0, 16)?),
            &["to"],
        )?;
        registry.register(Box::new(request_count.clone()))?;
        registry.register(Box::new(rcode_count.clone()))?;
        registry.register(Box::new(request_duration.clone()))?;
        Ok(Self {
            request_count,
            rcode_count,
            request_duration,
        })
    }
}

impl MetricsSink for PrometheusMetrics {
    fn record_exchange(&self, upstream: &str, rcode: &str, elapsed: Duration) {
        self.request_count.with_label_values(&[upstream]).inc();
        self.rcode_count.with_label_values(&[rcode, upstream]).inc();
        self.request_duration
            .with_label_values(&[upstream])
            .observe(elapsed.as_secs_f64());
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use anyhow::Result;
    use pretty_assertions::assert_eq;
    use prometheus::Registry;

    use super::{MetricsSink, PrometheusMetrics};

    #[test]
    fn should_count_per_upstream_and_rcode() -> Result<()> {
        let registry = Registry::new();
        let metrics = PrometheusMetrics::new(&registry)?;

        metrics.record_exchange("8.8.8.8:53", "NOERROR", Duration::from_millis(3));
        metrics.record_exchange("8.8.8.8:53", "NXDOMAIN", Duration::from_millis(5));
        metrics.record_exchange("1.1.1.1:53", "NOERROR", Duration::from_millis(7));

        assert_eq!(
            metrics
                .request_count
                .with_label_values(&["8.8.8.8:53"])
                .get(),
            2
        );
        assert_eq!(
            metrics
                .rcode_count
                .with_label_values(&["NOERROR", "1.1.1.1:53"])
                .get(),
            1
        );
        assert_eq!(
            metrics
                .request_duration
                .with_label_values(&["8.8.8.8:53"])
                .get_sample_count(),
            2
        );
        Ok(())
    }

    #[test]
    fn should_refuse_double_registration() -> Result<()> {
        let registry = Registry::new();
        PrometheusMetrics::new(&registry)?;

        assert!(PrometheusMetrics::new(&registry).is_err());
        Ok(())
    }
}

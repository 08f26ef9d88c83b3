//! Per-invocation status metric, reported to CloudWatch.

use anyhow::{Context, Result};
use async_trait::async_trait;
use aws_sdk_cloudwatch::types::{Dimension, MetricDatum, StandardUnit};
use derive_more::Display;

/// Every metric is reported under this namespace.
pub const NAMESPACE: &str = "Streambot";

/// Name of the single dimension attached to each data point.
pub const STATUS_DIMENSION: &str = "Status";

/// Default metric name when none is configured.
pub const DEFAULT_METRIC_NAME: &str = "Invocations";

/// Outcome of an invocation, as reported in the `Status` dimension.
#[derive(Debug, Display, Clone, Copy, PartialEq, Eq)]
pub enum Status {
    #[display("Success")]
    Success,
    #[display("Error")]
    Error,
}

impl<T, E> From<&std::result::Result<T, E>> for Status {
    fn from(result: &std::result::Result<T, E>) -> Self {
        match result {
            Ok(_) => Status::Success,
            Err(_) => Status::Error,
        }
    }
}

/// Destination for the per-invocation status metric.
#[async_trait]
pub trait MetricSink: Send + Sync {
    /// Record a single count against `metric_name` with the given status.
    async fn put_status(&self, metric_name: &str, status: Status) -> Result<()>;
}

/// A [MetricSink] which calls CloudWatch `PutMetricData`.
#[derive(Debug, Clone)]
pub struct CloudWatchSink {
    client: aws_sdk_cloudwatch::Client,
}

impl CloudWatchSink {
    pub fn new(client: aws_sdk_cloudwatch::Client) -> Self {
        CloudWatchSink { client }
    }
}

/// Build the data point for one invocation.
pub fn status_datum(metric_name: &str, status: Status) -> MetricDatum {
    MetricDatum::builder()
        .metric_name(metric_name)
        .dimensions(
            Dimension::builder()
                .name(STATUS_DIMENSION)
                .value(status.to_string())
                .build(),
        )
        .value(1.0)
        .unit(StandardUnit::Count)
        .build()
}

#[async_trait]
impl MetricSink for CloudWatchSink {
    async fn put_status(&self, metric_name: &str, status: Status) -> Result<()> {
        self.client
            .put_metric_data()
            .namespace(NAMESPACE)
            .metric_data(status_datum(metric_name, status))
            .send()
            .await
            .with_context(|| format!("Failed to put {status} metric {NAMESPACE}/{metric_name}"))?;
        Ok(())
    }
}

/// A [MetricSink] which only logs the data point. Used when running outside of Lambda.
#[derive(Debug, Clone, Copy, Default)]
pub struct TracingSink;

#[async_trait]
impl MetricSink for TracingSink {
    async fn put_status(&self, metric_name: &str, status: Status) -> Result<()> {
        tracing::info!(namespace = NAMESPACE, metric = metric_name, status = %status, "metric");
        Ok(())
    }
}

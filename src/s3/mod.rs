//! Shipping buffered invocation logs to S3.

use anyhow::{Context, Result};
use async_trait::async_trait;
use aws_sdk_s3::primitives::ByteStream;

/// Re-export of [aws_sdk_s3::client::Client](https://docs.rs/aws-sdk-s3/latest/aws_sdk_s3/client/struct.Client.html).
pub use aws_sdk_s3::Client;

mod s3_object;
pub use s3_object::S3Object;

/// Destination for the buffered log document of an invocation.
#[async_trait]
pub trait LogSink: Send + Sync {
    /// Write `contents` to `dst`, replacing anything already there.
    async fn put_logs(&self, dst: &S3Object, contents: String) -> Result<()>;
}

/// A [LogSink] which writes each log document as a single S3 object.
#[derive(Debug, Clone)]
pub struct S3LogSink {
    client: Client,
}

impl S3LogSink {
    pub fn new(client: Client) -> Self {
        S3LogSink { client }
    }
}

#[async_trait]
impl LogSink for S3LogSink {
    async fn put_logs(&self, dst: &S3Object, contents: String) -> Result<()> {
        tracing::debug!("Writing {} bytes of logs to {}", contents.len(), dst);
        self.client
            .put_object()
            .bucket(&dst.bucket)
            .key(&dst.key)
            .content_type("text/plain")
            .body(ByteStream::from(contents.into_bytes()))
            .send()
            .await
            .with_context(|| format!("Failed to write logs to {dst}"))?;
        Ok(())
    }
}

/// A [LogSink] which drops everything. Used when running outside of Lambda.
#[derive(Debug, Clone, Copy, Default)]
pub struct DiscardLogSink;

#[async_trait]
impl LogSink for DiscardLogSink {
    async fn put_logs(&self, dst: &S3Object, contents: String) -> Result<()> {
        tracing::debug!("Discarding {} bytes of logs for {}", contents.len(), dst);
        Ok(())
    }
}

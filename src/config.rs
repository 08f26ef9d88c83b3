//! Shared [aws_types::SdkConfig](https://docs.rs/aws-types/latest/aws_types/sdk_config/struct.SdkConfig.html)
//! construction.

use anyhow::Result;
use aws_config::retry::RetryConfig;
use aws_config::timeout::TimeoutConfig;
use aws_config::ConfigLoader;
use aws_types::region::Region;
use aws_types::SdkConfig;
use std::time::Duration;

use crate::localstack;

/// Per-attempt timeout used when reading runtime configuration.
pub const BOUNDED_ATTEMPT_TIMEOUT: Duration = Duration::from_millis(500);

/// Maximum number of attempts used when reading runtime configuration.
pub const BOUNDED_MAX_ATTEMPTS: u32 = 10;

/// Create a shared `SdkConfig` with LocalStack support.
///
/// # Example
///
/// ```
/// use streambot::config::load_from_env;
///
/// # tokio_test::block_on(async {
/// let shared_config = load_from_env().await.unwrap();
/// let client = aws_sdk_s3::Client::new(&shared_config);
/// # })
/// ```
///
/// ## LocalStack
///
/// If `LOCALSTACK_HOSTNAME` is set, every client created from this config talks to
/// [LocalStack](https://localstack.cloud/) instead of AWS. `EDGE_PORT` may be set if the
/// edge service is not on the default port of `4566`.
///
/// ## Errors
///
/// An error will be returned if `LOCALSTACK_HOSTNAME` is set and a valid URI cannot be constructed.
pub async fn load_from_env() -> Result<SdkConfig> {
    Ok(with_localstack(aws_config::from_env())?.load().await)
}

/// Create a shared `SdkConfig` for latency sensitive lookups.
///
/// Every attempt is cut off after [BOUNDED_ATTEMPT_TIMEOUT] and up to
/// [BOUNDED_MAX_ATTEMPTS] attempts are made, so that a slow endpoint costs a retry
/// rather than the rest of the invocation. When `region` is given it overrides the
/// region found in the environment.
pub async fn load_bounded(region: Option<&str>) -> Result<SdkConfig> {
    let mut loader = aws_config::from_env()
        .timeout_config(
            TimeoutConfig::builder()
                .operation_attempt_timeout(BOUNDED_ATTEMPT_TIMEOUT)
                .build(),
        )
        .retry_config(RetryConfig::standard().with_max_attempts(BOUNDED_MAX_ATTEMPTS));
    if let Some(region) = region {
        loader = loader.region(Region::new(region.to_owned()));
    }
    Ok(with_localstack(loader)?.load().await)
}

/// Create a shared `SdkConfig` for `region`, otherwise as [load_from_env].
pub async fn load_for_region(region: &str) -> Result<SdkConfig> {
    let loader = aws_config::from_env().region(Region::new(region.to_owned()));
    Ok(with_localstack(loader)?.load().await)
}

fn with_localstack(loader: ConfigLoader) -> Result<ConfigLoader> {
    Ok(match localstack::get_endpoint_uri()? {
        Some(uri) => loader.endpoint_url(uri.to_string()),
        None => loader,
    })
}

#[cfg(test)]
mod test {
    use super::*;

    use serial_test::serial;

    #[tokio::test]
    #[serial]
    async fn test_load_from_env() {
        load_from_env().await.unwrap();
    }

    #[tokio::test]
    #[serial]
    async fn test_load_for_region() {
        let config = load_for_region("ap-southeast-2").await.unwrap();
        assert_eq!(config.region(), Some(&Region::new("ap-southeast-2")));
    }

    #[tokio::test]
    #[serial]
    async fn test_load_bounded_region_override() {
        let config = load_bounded(Some("us-east-1")).await.unwrap();
        assert_eq!(config.region(), Some(&Region::new("us-east-1")));
        let retry = config.retry_config().unwrap();
        assert_eq!(retry.max_attempts(), BOUNDED_MAX_ATTEMPTS);
        let timeouts = config.timeout_config().unwrap();
        assert_eq!(
            timeouts.operation_attempt_timeout(),
            Some(BOUNDED_ATTEMPT_TIMEOUT)
        );
    }
}

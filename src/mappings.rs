//! Event source mappings between streams and Lambda functions.

use anyhow::{Context, Result};
use async_trait::async_trait;
use aws_sdk_lambda::types::EventSourcePosition;
use aws_types::region::Region;
use aws_types::SdkConfig;

pub const DEFAULT_BATCH_SIZE: i32 = 100;
pub const DEFAULT_STARTING_POSITION: &str = "TRIM_HORIZON";

/// The desired state of a mapping.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MappingSpec {
    pub function_name: String,
    pub stream_arn: String,
    pub batch_size: i32,
    /// Only used when the mapping is created.
    pub starting_position: String,
    pub enabled: bool,
}

impl MappingSpec {
    /// A mapping with the default batch size and starting position, enabled.
    pub fn new(function_name: impl Into<String>, stream_arn: impl Into<String>) -> Self {
        MappingSpec {
            function_name: function_name.into(),
            stream_arn: stream_arn.into(),
            batch_size: DEFAULT_BATCH_SIZE,
            starting_position: DEFAULT_STARTING_POSITION.to_owned(),
            enabled: true,
        }
    }
}

/// Access to a region's event source mappings. Every operation returning a mapping returns
/// its UUID.
#[async_trait]
pub trait EventSourceMappings: Send + Sync {
    /// The mappings between `stream_arn` and `function_name`.
    async fn list(&self, stream_arn: &str, function_name: &str) -> Result<Vec<String>>;
    async fn create(&self, spec: &MappingSpec) -> Result<String>;
    async fn update(&self, uuid: &str, spec: &MappingSpec) -> Result<String>;
    async fn delete(&self, uuid: &str) -> Result<()>;
}

/// [EventSourceMappings] through the Lambda API.
#[derive(Debug, Clone)]
pub struct LambdaEventSourceMappings {
    client: aws_sdk_lambda::Client,
}

impl LambdaEventSourceMappings {
    pub fn new(client: aws_sdk_lambda::Client) -> Self {
        LambdaEventSourceMappings { client }
    }

    /// Use the credentials of `shared_config` against the Lambda API of `region`.
    pub fn for_region(shared_config: &SdkConfig, region: &str) -> Self {
        let config = aws_sdk_lambda::config::Builder::from(shared_config)
            .region(Region::new(region.to_owned()))
            .build();
        LambdaEventSourceMappings::new(aws_sdk_lambda::Client::from_conf(config))
    }
}

fn returned_uuid(uuid: Option<&str>, action: &str) -> Result<String> {
    uuid.map(str::to_owned)
        .with_context(|| format!("Lambda did not return the UUID of the {action} mapping"))
}

#[async_trait]
impl EventSourceMappings for LambdaEventSourceMappings {
    async fn list(&self, stream_arn: &str, function_name: &str) -> Result<Vec<String>> {
        let output = self
            .client
            .list_event_source_mappings()
            .event_source_arn(stream_arn)
            .function_name(function_name)
            .send()
            .await
            .with_context(|| {
                format!("Failed to list event source mappings for {stream_arn} - {function_name}")
            })?;
        Ok(output
            .event_source_mappings()
            .iter()
            .filter_map(|mapping| mapping.uuid().map(str::to_owned))
            .collect())
    }

    async fn create(&self, spec: &MappingSpec) -> Result<String> {
        let output = self
            .client
            .create_event_source_mapping()
            .function_name(&spec.function_name)
            .event_source_arn(&spec.stream_arn)
            .batch_size(spec.batch_size)
            .enabled(spec.enabled)
            .starting_position(EventSourcePosition::from(spec.starting_position.as_str()))
            .send()
            .await
            .with_context(|| {
                format!(
                    "Failed to create event source mapping for {} - {}",
                    spec.stream_arn, spec.function_name
                )
            })?;
        returned_uuid(output.uuid(), "created")
    }

    async fn update(&self, uuid: &str, spec: &MappingSpec) -> Result<String> {
        let output = self
            .client
            .update_event_source_mapping()
            .uuid(uuid)
            .function_name(&spec.function_name)
            .batch_size(spec.batch_size)
            .enabled(spec.enabled)
            .send()
            .await
            .with_context(|| format!("Failed to update event source mapping {uuid}"))?;
        returned_uuid(output.uuid(), "updated")
    }

    async fn delete(&self, uuid: &str) -> Result<()> {
        self.client
            .delete_event_source_mapping()
            .uuid(uuid)
            .send()
            .await
            .with_context(|| format!("Failed to delete event source mapping {uuid}"))?;
        Ok(())
    }
}


#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn test_mapping_defaults() {
        let spec = MappingSpec::new("streambot-test", "arn:aws:kinesis:us-east-1:1:stream/s");
        assert_eq!(spec.batch_size, 100);
        assert_eq!(spec.starting_position, "TRIM_HORIZON");
        assert!(spec.enabled);
    }

    #[test]
    fn test_starting_position_conversion() {
        assert_eq!(
            EventSourcePosition::from(DEFAULT_STARTING_POSITION),
            EventSourcePosition::TrimHorizon
        );
        assert_eq!(EventSourcePosition::from("LATEST"), EventSourcePosition::Latest);
    }
}

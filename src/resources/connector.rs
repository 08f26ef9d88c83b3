//! The `StreambotConnector` custom resource, an event source mapping between a stream and a
//! function.
//!
//! Required properties are `FunctionRegion`, `FunctionName` and `StreamArn`. `BatchSize`
//! (default 100), `StartingPosition` (default `TRIM_HORIZON`) and `Enabled` (default true)
//! are optional.

use anyhow::Result;
use async_trait::async_trait;
use serde_json::Value;
use std::sync::Arc;

use super::{CustomResource, CustomResourceError, CustomResourceRequest, RequestType, ResourceData};
use crate::mappings::{EventSourceMappings, MappingSpec, DEFAULT_BATCH_SIZE, DEFAULT_STARTING_POSITION};

pub const RESOURCE_NAME: &str = "StreambotConnector";

/// Opens the event source mappings of a region.
pub type ConnectFn = dyn Fn(&str) -> Arc<dyn EventSourceMappings> + Send + Sync;

/// The validated properties of a connector.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConnectorProperties {
    pub function_region: String,
    pub mapping: MappingSpec,
}

impl ConnectorProperties {
    pub fn from_request(request: &CustomResourceRequest) -> Result<Self, CustomResourceError> {
        let invalid = || CustomResourceError::InvalidProperties {
            resource: RESOURCE_NAME,
        };
        let required = |key| request.property(key).map(str::to_owned).ok_or_else(invalid);

        // A delete only needs to find the mapping, so it must not fail on options that a
        // create or update would reject.
        let props = &request.resource_properties;
        let deleting = request.request_type == RequestType::Delete;
        let batch_size = match props.get("BatchSize") {
            None | Some(Value::Null) => DEFAULT_BATCH_SIZE,
            Some(_) if deleting => DEFAULT_BATCH_SIZE,
            Some(value) => parse_int(value).ok_or_else(invalid)?,
        };
        let enabled = match props.get("Enabled") {
            None | Some(Value::Null) => true,
            Some(_) if deleting => true,
            Some(value) => parse_bool(value).ok_or_else(invalid)?,
        };
        let starting_position = request
            .property("StartingPosition")
            .filter(|p| !p.is_empty())
            .unwrap_or(DEFAULT_STARTING_POSITION)
            .to_owned();

        Ok(ConnectorProperties {
            function_region: required("FunctionRegion")?,
            mapping: MappingSpec {
                function_name: required("FunctionName")?,
                stream_arn: required("StreamArn")?,
                batch_size,
                starting_position,
                enabled,
            },
        })
    }
}

// CloudFormation hands template values over as strings.
fn parse_int(value: &Value) -> Option<i32> {
    match value {
        Value::Number(n) => n.as_i64().and_then(|n| i32::try_from(n).ok()),
        Value::String(s) => s.trim().parse().ok(),
        _ => None,
    }
}

fn parse_bool(value: &Value) -> Option<bool> {
    match value {
        Value::Bool(b) => Some(*b),
        Value::String(s) => s.trim().parse().ok(),
        _ => None,
    }
}

pub struct ConnectorResource {
    connect: Arc<ConnectFn>,
}

impl ConnectorResource {
    pub fn new(connect: Arc<ConnectFn>) -> Self {
        ConnectorResource { connect }
    }
}

#[async_trait]
impl CustomResource for ConnectorResource {
    fn name(&self) -> &'static str {
        RESOURCE_NAME
    }

    async fn handle(&self, request: &CustomResourceRequest) -> Result<ResourceData> {
        let props = ConnectorProperties::from_request(request)?;
        let spec = &props.mapping;
        tracing::info!(
            "{} event source mapping {} - {}",
            request.request_type,
            spec.stream_arn,
            spec.function_name
        );
        let mappings = (self.connect)(&props.function_region);

        let existing = match mappings.list(&spec.stream_arn, &spec.function_name).await {
            Ok(uuids) => uuids.into_iter().next(),
            // A connector that was never created, e.g. because of a bad stream ARN, must
            // still be deletable.
            Err(e) if request.request_type == RequestType::Delete => {
                tracing::warn!("Ignoring failure to list mappings on delete: {:?}", e);
                return Ok(ResourceData::new());
            }
            Err(e) => return Err(e),
        };

        let uuid = match (request.request_type, existing) {
            (RequestType::Delete, None) => return Ok(ResourceData::new()),
            (RequestType::Delete, Some(uuid)) => {
                mappings.delete(&uuid).await?;
                return Ok(ResourceData::new());
            }
            (_, Some(uuid)) => mappings.update(&uuid, spec).await?,
            (_, None) => mappings.create(spec).await?,
        };

        let mut data = ResourceData::new();
        data.insert("UUID".to_owned(), Value::from(uuid));
        Ok(data)
    }
}

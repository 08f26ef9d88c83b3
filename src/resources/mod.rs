//! CloudFormation custom resources backed by Lambda functions.
//!
//! CloudFormation invokes the function with a request describing the change, and then waits
//! for a response document to be `PUT` to the pre-signed `ResponseURL` of the request. The
//! [CustomResourceProvider] takes care of validating requests and delivering responses, while
//! a [CustomResource] implementation performs the actual change.
//!
//! Two resources are provided:
//!
//! * [env::EnvResource] (`StreambotEnv`) stores a function's runtime configuration.
//! * [connector::ConnectorResource] (`StreambotConnector`) maps a stream onto a function.

use anyhow::{Context as _, Result};
use async_trait::async_trait;
use derive_more::Display;
use lambda_runtime::{service_fn, LambdaEvent};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::sync::Arc;
use thiserror::Error;
use url::Url;

use crate::lambda::{init_tracing, Error};
use crate::retry::{Backoff, Immediate, Retry};

pub mod connector;
pub mod env;

/// Returned, successfully, when a function is invoked with something other than a custom
/// resource request.
pub const INVALID_EVENT_MESSAGE: &str = "ERROR: Invalid CloudFormation event";

const REQUIRED_FIELDS: [&str; 6] = [
    "RequestType",
    "ResourceProperties",
    "StackId",
    "LogicalResourceId",
    "RequestId",
    "ResponseURL",
];

/// Attributes returned to CloudFormation, available through `Fn::GetAtt`.
pub type ResourceData = Map<String, Value>;

#[derive(Debug, Error)]
pub enum CustomResourceError {
    #[error("ERROR: Invalid CloudFormation event")]
    InvalidEvent,
    #[error("Invalid {resource} parameters")]
    InvalidProperties { resource: &'static str },
    #[error("Failed to respond to CloudFormation after {attempts} attempts: {reason}")]
    Respond { attempts: usize, reason: String },
    #[error("Failed to encode response: {0}")]
    Encode(#[from] serde_json::Error),
}

#[derive(Debug, Display, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum RequestType {
    Create,
    Update,
    Delete,
}

/// A custom resource request, as sent by CloudFormation.
#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct CustomResourceRequest {
    pub request_type: RequestType,
    #[serde(rename = "ResponseURL")]
    pub response_url: Url,
    pub stack_id: String,
    pub request_id: String,
    pub logical_resource_id: String,
    #[serde(default)]
    pub physical_resource_id: Option<String>,
    #[serde(default)]
    pub resource_type: Option<String>,
    pub resource_properties: Map<String, Value>,
    #[serde(default)]
    pub old_resource_properties: Option<Map<String, Value>>,
}

impl CustomResourceRequest {
    /// Parse an invocation payload, rejecting anything that is not a custom resource request.
    pub fn parse(payload: Value) -> Result<Self, CustomResourceError> {
        let Value::Object(fields) = &payload else {
            return Err(CustomResourceError::InvalidEvent);
        };
        if let Some(missing) = REQUIRED_FIELDS.iter().find(|f| !fields.contains_key(**f)) {
            tracing::warn!("Not a CloudFormation event, missing {missing}");
            return Err(CustomResourceError::InvalidEvent);
        }
        serde_json::from_value(payload).map_err(|e| {
            tracing::warn!("Not a CloudFormation event: {e}");
            CustomResourceError::InvalidEvent
        })
    }

    /// A string property, if present.
    pub fn property(&self, key: &str) -> Option<&str> {
        self.resource_properties.get(key).and_then(Value::as_str)
    }
}

#[derive(Debug, Display, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum ResponseStatus {
    #[display("SUCCESS")]
    Success,
    #[display("FAILED")]
    Failed,
}

/// The document delivered to the request's `ResponseURL`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct CustomResourceResponse {
    pub status: ResponseStatus,
    pub reason: String,
    pub physical_resource_id: String,
    pub stack_id: String,
    pub logical_resource_id: String,
    pub request_id: String,
    pub data: ResourceData,
}

impl CustomResourceResponse {
    /// Build the response to `request` for the given outcome.
    ///
    /// The physical resource id is kept from the request, or taken from `log_stream_name` for
    /// new resources.
    pub fn new(
        request: &CustomResourceRequest,
        outcome: &Result<ResourceData>,
        log_stream_name: &str,
    ) -> Self {
        let (status, reason, data) = match outcome {
            Ok(data) => (ResponseStatus::Success, String::new(), data.clone()),
            Err(e) => (ResponseStatus::Failed, e.to_string(), ResourceData::new()),
        };
        CustomResourceResponse {
            status,
            reason,
            physical_resource_id: request
                .physical_resource_id
                .clone()
                .unwrap_or_else(|| log_stream_name.to_owned()),
            stack_id: request.stack_id.clone(),
            logical_resource_id: request.logical_resource_id.clone(),
            request_id: request.request_id.clone(),
            data,
        }
    }
}

/// Delivers response documents to CloudFormation.
#[async_trait]
pub trait ResponseTransport: Send + Sync {
    /// Deliver `body` to `url`. Any HTTP response counts as delivered.
    async fn put(&self, url: &Url, body: String) -> Result<()>;
}

/// A [ResponseTransport] over HTTPS.
#[derive(Debug, Clone, Default)]
pub struct HttpTransport {
    client: reqwest::Client,
}

impl HttpTransport {
    pub fn new(client: reqwest::Client) -> Self {
        HttpTransport { client }
    }
}

#[async_trait]
impl ResponseTransport for HttpTransport {
    async fn put(&self, url: &Url, body: String) -> Result<()> {
        let response = self
            .client
            .put(url.clone())
            // The pre-signed URL is signed for an empty content type.
            .header(reqwest::header::CONTENT_TYPE, "")
            .body(body)
            .send()
            .await
            .with_context(|| format!("Failed to PUT response to {}", url.host_str().unwrap_or_default()))?;
        tracing::info!("Response status: {}", response.status());
        Ok(())
    }
}

/// A resource managed through CloudFormation.
#[async_trait]
pub trait CustomResource: Send + Sync {
    /// The resource type, as used in log and failure messages.
    fn name(&self) -> &'static str;

    /// Apply the change described by `request`, returning the attributes of the resource.
    async fn handle(&self, request: &CustomResourceRequest) -> Result<ResourceData>;
}

/// Runs a [CustomResource] for each request and delivers the response.
///
/// Deliveries are retried according to a [Retry] policy, by default
/// [DEFAULT_MAX_ATTEMPTS](crate::retry::DEFAULT_MAX_ATTEMPTS) attempts without pausing.
pub struct CustomResourceProvider<R, B = Immediate> {
    resource: R,
    transport: Arc<dyn ResponseTransport>,
    retry: Retry<B>,
}

impl<R: CustomResource> CustomResourceProvider<R> {
    pub fn new(resource: R, transport: Arc<dyn ResponseTransport>) -> Self {
        CustomResourceProvider {
            resource,
            transport,
            retry: Retry::default(),
        }
    }
}

impl<R: CustomResource, B: Backoff> CustomResourceProvider<R, B> {
    /// Replace the delivery retry policy, including its backoff.
    pub fn with_retry<B2: Backoff>(self, retry: Retry<B2>) -> CustomResourceProvider<R, B2> {
        CustomResourceProvider {
            resource: self.resource,
            transport: self.transport,
            retry,
        }
    }

    pub fn resource(&self) -> &R {
        &self.resource
    }

    /// Handle one invocation.
    ///
    /// Returns the delivered response document. Failures of the resource itself are reported
    /// to CloudFormation and do not fail the invocation; failing to deliver the response does.
    pub async fn handle(
        &self,
        payload: Value,
        log_stream_name: &str,
    ) -> Result<String, CustomResourceError> {
        let request = match CustomResourceRequest::parse(payload) {
            Ok(request) => request,
            Err(CustomResourceError::InvalidEvent) => return Ok(INVALID_EVENT_MESSAGE.to_owned()),
            Err(e) => return Err(e),
        };
        tracing::info!(
            "{} {} {} for {}",
            request.request_type,
            self.resource.name(),
            request.logical_resource_id,
            request.stack_id
        );

        let outcome = self.resource.handle(&request).await;
        if let Err(e) = &outcome {
            tracing::error!("{:?}", e);
        }
        let response = CustomResourceResponse::new(&request, &outcome, log_stream_name);
        self.respond(&request.response_url, &response).await
    }

    async fn respond(
        &self,
        url: &Url,
        response: &CustomResourceResponse,
    ) -> Result<String, CustomResourceError> {
        let body = serde_json::to_string(response)?;
        tracing::info!("Response body: {}", body);
        self.retry
            .run(|_| self.transport.put(url, body.clone()))
            .await
            .map_err(|e| {
                let attempts = self.retry.max_attempts();
                let reason = e
                    .into_last()
                    .map_or_else(|| "no attempt made".to_owned(), |last| format!("{last:#}"));
                CustomResourceError::Respond { attempts, reason }
            })?;
        Ok(body)
    }
}

/// Executes a [CustomResource] against every invocation of the Lambda function.
///
/// Sets up tracing the same way as [crate::lambda::run_service]. `setup` runs once, before
/// the runtime starts; if it fails every invocation fails.
pub async fn run_custom_resource<R, F, Fut>(setup: F) -> Result<(), Error>
where
    R: CustomResource,
    F: FnOnce() -> Fut,
    Fut: std::future::Future<Output = Result<R>>,
{
    init_tracing();
    let init_result = setup()
        .await
        .map(|resource| CustomResourceProvider::new(resource, Arc::new(HttpTransport::default())));

    lambda_runtime::run(service_fn(|event: LambdaEvent<Value>| async {
        let provider = match &init_result {
            Ok(x) => x,
            Err(e) => {
                tracing::error!("{:?}", e);
                return Err(Error::from("Failed to initialise custom resource."));
            }
        };
        let (payload, context) = event.into_parts();
        provider
            .handle(payload, &context.env_config.log_stream)
            .await
            .map_err(|e| {
                tracing::error!("{:?}", e);
                Error::from(e)
            })
    }))
    .await
}

#[cfg(test)]
pub(crate) mod fixtures {
    use super::*;
    use serde_json::json;
    use std::sync::Mutex;

    pub const LOG_STREAM: &str = "2015/03/30/[$LATEST]0123456789abcdef";

    pub fn request(request_type: &str, properties: Value) -> Value {
        json!({
            "RequestType": request_type,
            "ServiceToken": "arn:aws:lambda:us-east-1:123456789012:function:streambot-env",
            "ResponseURL": "https://cloudformation-custom-resource-response-useast1.s3.amazonaws.com/response?sig=1",
            "StackId": "arn:aws:cloudformation:us-east-1:123456789012:stack/streambot-test/guid",
            "RequestId": "unique-request-id",
            "ResourceType": "Custom::Test",
            "LogicalResourceId": "TestResource",
            "ResourceProperties": properties,
        })
    }

    /// Records delivered responses, failing the first `failures` deliveries.
    #[derive(Debug, Default)]
    pub struct FakeTransport {
        pub failures: usize,
        pub attempts: Mutex<usize>,
        pub delivered: Mutex<Vec<(Url, String)>>,
    }

    impl FakeTransport {
        pub fn failing(failures: usize) -> Self {
            FakeTransport {
                failures,
                ..Default::default()
            }
        }

        pub fn attempts(&self) -> usize {
            *self.attempts.lock().unwrap()
        }

        pub fn responses(&self) -> Vec<CustomResourceResponse> {
            self.delivered
                .lock()
                .unwrap()
                .iter()
                .map(|(_, body)| serde_json::from_str(body).unwrap())
                .collect()
        }
    }

    #[async_trait]
    impl ResponseTransport for FakeTransport {
        async fn put(&self, url: &Url, body: String) -> Result<()> {
            let attempt = {
                let mut attempts = self.attempts.lock().unwrap();
                *attempts += 1;
                *attempts
            };
            if attempt <= self.failures {
                anyhow::bail!("connection reset on attempt {attempt}");
            }
            self.delivered.lock().unwrap().push((url.clone(), body));
            Ok(())
        }
    }
}

#[cfg(test)]
mod test {
    use super::fixtures::*;
    use super::*;

    use crate::retry::FixedDelay;
    use assert_matches::assert_matches;
    use serde_json::json;
    use std::time::Duration;
    use tokio::time::Instant;

    /// Succeeds with its properties echoed back, unless asked to fail.
    struct Echo;

    #[async_trait]
    impl CustomResource for Echo {
        fn name(&self) -> &'static str {
            "Echo"
        }

        async fn handle(&self, request: &CustomResourceRequest) -> Result<ResourceData> {
            if request.property("Fail").is_some() {
                anyhow::bail!("asked to fail");
            }
            Ok(request.resource_properties.clone())
        }
    }

    fn provider(transport: Arc<FakeTransport>) -> CustomResourceProvider<Echo> {
        CustomResourceProvider::new(Echo, transport)
    }

    #[test]
    fn test_parse_request() {
        let request =
            CustomResourceRequest::parse(request("Create", json!({"Key": "value"}))).unwrap();
        assert_eq!(request.request_type, RequestType::Create);
        assert_eq!(request.logical_resource_id, "TestResource");
        assert_eq!(request.physical_resource_id, None);
        assert_eq!(request.property("Key"), Some("value"));
        assert_eq!(
            request.response_url.host_str(),
            Some("cloudformation-custom-resource-response-useast1.s3.amazonaws.com")
        );
    }

    #[test]
    fn test_parse_rejects_incomplete_requests() {
        for field in REQUIRED_FIELDS {
            let mut payload = request("Create", json!({}));
            payload.as_object_mut().unwrap().remove(field);
            assert_matches!(
                CustomResourceRequest::parse(payload),
                Err(CustomResourceError::InvalidEvent),
                "{field}"
            );
        }
        assert_matches!(
            CustomResourceRequest::parse(json!({"Records": []})),
            Err(CustomResourceError::InvalidEvent)
        );
        assert_matches!(
            CustomResourceRequest::parse(json!("Create")),
            Err(CustomResourceError::InvalidEvent)
        );
    }

    #[tokio::test]
    async fn test_invalid_event_is_not_answered() {
        let transport = Arc::new(FakeTransport::default());
        let mut payload = request("Create", json!({}));
        payload.as_object_mut().unwrap().remove("ResponseURL");
        let result = provider(transport.clone())
            .handle(payload, LOG_STREAM)
            .await
            .unwrap();
        assert_eq!(result, INVALID_EVENT_MESSAGE);
        assert_eq!(transport.attempts(), 0);
    }

    #[tokio::test]
    async fn test_success_response() {
        let transport = Arc::new(FakeTransport::default());
        provider(transport.clone())
            .handle(request("Create", json!({"Key": "value"})), LOG_STREAM)
            .await
            .unwrap();
        let responses = transport.responses();
        assert_eq!(responses.len(), 1);
        let response = &responses[0];
        assert_eq!(response.status, ResponseStatus::Success);
        assert_eq!(response.reason, "");
        assert_eq!(response.physical_resource_id, LOG_STREAM);
        assert_eq!(response.request_id, "unique-request-id");
        assert_eq!(response.logical_resource_id, "TestResource");
        assert_eq!(
            response.stack_id,
            "arn:aws:cloudformation:us-east-1:123456789012:stack/streambot-test/guid"
        );
        assert_eq!(response.data.get("Key"), Some(&json!("value")));
    }

    #[tokio::test]
    async fn test_failure_response_keeps_physical_id() {
        let transport = Arc::new(FakeTransport::default());
        let mut payload = request("Update", json!({"Fail": "yes"}));
        payload["PhysicalResourceId"] = json!("existing-id");
        provider(transport.clone())
            .handle(payload, LOG_STREAM)
            .await
            .unwrap();
        let response = &transport.responses()[0];
        assert_eq!(response.status, ResponseStatus::Failed);
        assert_eq!(response.reason, "asked to fail");
        assert_eq!(response.physical_resource_id, "existing-id");
        assert!(response.data.is_empty());
    }

    #[test]
    fn test_response_wire_format() {
        let request =
            CustomResourceRequest::parse(request("Delete", json!({}))).unwrap();
        let response = CustomResourceResponse::new(&request, &Ok(ResourceData::new()), LOG_STREAM);
        let body = serde_json::to_value(&response).unwrap();
        assert_eq!(body["Status"], "SUCCESS");
        assert_eq!(body["PhysicalResourceId"], LOG_STREAM);
        assert_eq!(body["Data"], json!({}));
        for key in ["Reason", "StackId", "LogicalResourceId", "RequestId"] {
            assert!(body.get(key).is_some(), "{key}");
        }
    }

    #[tokio::test]
    async fn test_delivery_retried() {
        let transport = Arc::new(FakeTransport::failing(4));
        provider(transport.clone())
            .handle(request("Create", json!({})), LOG_STREAM)
            .await
            .unwrap();
        assert_eq!(transport.attempts(), 5);
        assert_eq!(transport.responses().len(), 1);
    }

    #[tokio::test]
    async fn test_delivery_gives_up_after_six_attempts() {
        let transport = Arc::new(FakeTransport::failing(usize::MAX));
        let e = provider(transport.clone())
            .handle(request("Create", json!({})), LOG_STREAM)
            .await
            .unwrap_err();
        assert_eq!(transport.attempts(), 6);
        assert_matches!(e, CustomResourceError::Respond { attempts: 6, .. });
        assert!(e.to_string().starts_with("Failed to respond to CloudFormation"));
    }

    #[tokio::test(start_paused = true)]
    async fn test_delivery_waits_between_attempts() {
        let transport = Arc::new(FakeTransport::failing(2));
        let retry = Retry::builder()
            .max_attempts(4)
            .backoff(FixedDelay(Duration::from_secs(1)))
            .build();
        let provider = provider(transport.clone()).with_retry(retry);
        let start = Instant::now();
        provider
            .handle(request("Create", json!({})), LOG_STREAM)
            .await
            .unwrap();
        assert_eq!(transport.attempts(), 3);
        assert_eq!(transport.responses().len(), 1);
        assert_eq!(start.elapsed(), Duration::from_secs(2));
    }

    #[tokio::test(start_paused = true)]
    async fn test_delivery_gives_up_after_configured_attempts() {
        let transport = Arc::new(FakeTransport::failing(usize::MAX));
        let retry = Retry::builder()
            .max_attempts(3)
            .backoff(FixedDelay(Duration::from_millis(500)))
            .build();
        let e = provider(transport.clone())
            .with_retry(retry)
            .handle(request("Create", json!({})), LOG_STREAM)
            .await
            .unwrap_err();
        assert_eq!(transport.attempts(), 3);
        assert_matches!(e, CustomResourceError::Respond { attempts: 3, .. });
    }
}

//! The `StreambotEnv` custom resource.
//!
//! ```yaml
//! Config:
//!   Type: Custom::StreambotEnv
//!   Properties:
//!     ServiceToken: !GetAtt StreambotEnvFunction.Arn
//!     FunctionName: my-service-production
//!     EventBucket: my-bucket
//!     EventPrefix: events
//! ```
//!
//! Every property other than `ServiceToken` and `FunctionName` becomes a variable in the
//! function's runtime configuration.

use anyhow::Result;
use async_trait::async_trait;
use serde_json::Value;
use std::sync::Arc;

use super::{CustomResource, CustomResourceError, CustomResourceRequest, RequestType, ResourceData};
use crate::env::{Env, EnvStore};

pub const RESOURCE_NAME: &str = "StreambotEnv";

const FUNCTION_NAME: &str = "FunctionName";
const SERVICE_TOKEN: &str = "ServiceToken";

pub struct EnvResource {
    store: Arc<dyn EnvStore>,
}

impl EnvResource {
    pub fn new(store: Arc<dyn EnvStore>) -> Self {
        EnvResource { store }
    }
}

/// The configuration described by a request's properties.
///
/// CloudFormation passes most values as strings; anything else is stored as its JSON text.
pub fn env_from_properties(request: &CustomResourceRequest) -> Env {
    request
        .resource_properties
        .iter()
        .filter(|(key, _)| key.as_str() != SERVICE_TOKEN && key.as_str() != FUNCTION_NAME)
        .map(|(key, value)| {
            let value = match value {
                Value::String(s) => s.clone(),
                other => other.to_string(),
            };
            (key.clone(), value)
        })
        .collect()
}

#[async_trait]
impl CustomResource for EnvResource {
    fn name(&self) -> &'static str {
        RESOURCE_NAME
    }

    async fn handle(&self, request: &CustomResourceRequest) -> Result<ResourceData> {
        let function_name = request
            .property(FUNCTION_NAME)
            .filter(|name| !name.is_empty())
            .ok_or(CustomResourceError::InvalidProperties {
                resource: RESOURCE_NAME,
            })?;

        match request.request_type {
            RequestType::Delete => self.store.delete(function_name).await?,
            RequestType::Create | RequestType::Update => {
                let env = env_from_properties(request);
                tracing::info!(
                    "Storing {} configuration variables for {}",
                    env.len(),
                    function_name
                );
                self.store.put(function_name, &env).await?;
            }
        }

        let mut data = ResourceData::new();
        data.insert(FUNCTION_NAME.to_owned(), Value::from(function_name));
        Ok(data)
    }
}

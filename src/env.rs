//! Runtime configuration records, keyed by Lambda function name.
//!
//! Configuration lives in a DynamoDB table (by default `streambot-env` in `us-east-1`), one
//! item per function:
//!
//! | attribute | type | value                                           |
//! |-----------|------|-------------------------------------------------|
//! | `name`    | `S`  | the function name (hash key)                    |
//! | `env`     | `S`  | a JSON object mapping variable names to strings |
//!
//! The `StreambotEnv` custom resource writes these items; the invocation wrapper reads them.

use anyhow::{Context, Result};
use async_trait::async_trait;
use aws_sdk_dynamodb::types::AttributeValue;
use derive_more::{From, Into};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

use crate::config;

/// The table the configuration records are stored in, unless overridden.
pub const DEFAULT_TABLE: &str = "streambot-env";

/// The configuration table lives in a single well-known region.
pub const DEFAULT_REGION: &str = "us-east-1";

const NAME_ATTRIBUTE: &str = "name";
const ENV_ATTRIBUTE: &str = "env";

/// The runtime configuration of one function: a flat map of variable names to values.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize, From, Into)]
#[serde(transparent)]
pub struct Env(BTreeMap<String, String>);

impl Env {
    /// Parse an [Env] from its stored JSON form.
    pub fn from_json(json: &str) -> Result<Self> {
        serde_json::from_str(json).context("Configuration is not a flat JSON object of strings")
    }

    /// Serialise to the stored JSON form.
    pub fn to_json(&self) -> Result<String> {
        Ok(serde_json::to_string(&self.0)?)
    }

    /// Look up a single variable.
    pub fn get(&self, key: &str) -> Option<&str> {
        self.0.get(key).map(String::as_str)
    }

    /// Look up a variable which the service cannot run without.
    pub fn require(&self, key: &str) -> Result<&str> {
        self.get(key)
            .with_context(|| format!("Missing configuration variable {key}"))
    }

    pub fn contains_key(&self, key: &str) -> bool {
        self.0.contains_key(key)
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    pub fn keys(&self) -> impl Iterator<Item = &str> {
        self.0.keys().map(String::as_str)
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, &str)> {
        self.0.iter().map(|(k, v)| (k.as_str(), v.as_str()))
    }
}

impl<K: Into<String>, V: Into<String>> FromIterator<(K, V)> for Env {
    fn from_iter<I: IntoIterator<Item = (K, V)>>(iter: I) -> Self {
        Env(iter
            .into_iter()
            .map(|(k, v)| (k.into(), v.into()))
            .collect())
    }
}

/// Storage for configuration records.
#[async_trait]
pub trait EnvStore: Send + Sync {
    /// Fetch the configuration for `function_name`. A missing record is `Ok(None)`.
    async fn get(&self, function_name: &str) -> Result<Option<Env>>;
    /// Create or replace the configuration for `function_name`.
    async fn put(&self, function_name: &str, env: &Env) -> Result<()>;
    /// Remove the configuration for `function_name`. Removing a missing record succeeds.
    async fn delete(&self, function_name: &str) -> Result<()>;
}

/// An [EnvStore] backed by a DynamoDB table.
#[derive(Debug, Clone)]
pub struct DynamoEnvStore {
    client: aws_sdk_dynamodb::Client,
    table: String,
}

impl DynamoEnvStore {
    pub fn new(client: aws_sdk_dynamodb::Client, table: impl Into<String>) -> Self {
        DynamoEnvStore {
            client,
            table: table.into(),
        }
    }

    /// Connect to `table` in `region` with a client tuned for fast failure.
    ///
    /// See [config::load_bounded].
    pub async fn connect(table: impl Into<String>, region: &str) -> Result<Self> {
        let shared_config = config::load_bounded(Some(region)).await?;
        Ok(DynamoEnvStore::new(
            aws_sdk_dynamodb::Client::new(&shared_config),
            table,
        ))
    }

    pub fn table(&self) -> &str {
        &self.table
    }
}

#[async_trait]
impl EnvStore for DynamoEnvStore {
    async fn get(&self, function_name: &str) -> Result<Option<Env>> {
        let output = self
            .client
            .get_item()
            .table_name(&self.table)
            .key(NAME_ATTRIBUTE, AttributeValue::S(function_name.to_owned()))
            .send()
            .await
            .with_context(|| {
                format!(
                    "Failed to read configuration for {function_name} from {}",
                    self.table
                )
            })?;
        let Some(item) = output.item() else {
            return Ok(None);
        };
        let json = item
            .get(ENV_ATTRIBUTE)
            .and_then(|value| value.as_s().ok())
            .with_context(|| {
                format!("Configuration record for {function_name} has no string `env` attribute")
            })?;
        Env::from_json(json).map(Some)
    }

    async fn put(&self, function_name: &str, env: &Env) -> Result<()> {
        self.client
            .put_item()
            .table_name(&self.table)
            .item(NAME_ATTRIBUTE, AttributeValue::S(function_name.to_owned()))
            .item(ENV_ATTRIBUTE, AttributeValue::S(env.to_json()?))
            .send()
            .await
            .with_context(|| {
                format!(
                    "Failed to write configuration for {function_name} to {}",
                    self.table
                )
            })?;
        Ok(())
    }

    async fn delete(&self, function_name: &str) -> Result<()> {
        self.client
            .delete_item()
            .table_name(&self.table)
            .key(NAME_ATTRIBUTE, AttributeValue::S(function_name.to_owned()))
            .send()
            .await
            .with_context(|| {
                format!(
                    "Failed to delete configuration for {function_name} from {}",
                    self.table
                )
            })?;
        Ok(())
    }
}

/// A read-only [EnvStore] which hands every function the same configuration.
///
/// Useful when running a service outside of Lambda.
#[derive(Debug, Clone, Default)]
pub struct StaticEnvStore(pub Env);

#[async_trait]
impl EnvStore for StaticEnvStore {
    async fn get(&self, _function_name: &str) -> Result<Option<Env>> {
        Ok(Some(self.0.clone()))
    }

    async fn put(&self, function_name: &str, _env: &Env) -> Result<()> {
        anyhow::bail!("Cannot store configuration for {function_name} in a static store")
    }

    async fn delete(&self, function_name: &str) -> Result<()> {
        anyhow::bail!("Cannot delete configuration for {function_name} from a static store")
    }
}

//! Lambda function backing the `StreambotEnv` custom resource.

use std::sync::Arc;
use streambot::env::DynamoEnvStore;
use streambot::lambda::{Error, Settings};
use streambot::resources::env::EnvResource;
use streambot::resources::run_custom_resource;

#[tokio::main]
async fn main() -> Result<(), Error> {
    run_custom_resource(|| async {
        let settings = Settings::from_env()?;
        let store = DynamoEnvStore::connect(&settings.env_table, &settings.env_region).await?;
        tracing::info!("Storing configuration in {}", store.table());
        anyhow::Ok(EnvResource::new(Arc::new(store)))
    })
    .await
}

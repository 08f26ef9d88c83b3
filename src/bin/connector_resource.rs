//! Lambda function backing the `StreambotConnector` custom resource.

use std::sync::Arc;
use streambot::lambda::Error;
use streambot::mappings::{EventSourceMappings, LambdaEventSourceMappings};
use streambot::resources::connector::{ConnectFn, ConnectorResource};
use streambot::resources::run_custom_resource;

#[tokio::main]
async fn main() -> Result<(), Error> {
    run_custom_resource(|| async {
        let shared_config = streambot::config::load_from_env().await?;
        let connect: Arc<ConnectFn> = Arc::new(move |region: &str| {
            Arc::new(LambdaEventSourceMappings::for_region(&shared_config, region))
                as Arc<dyn EventSourceMappings>
        });
        anyhow::Ok(ConnectorResource::new(connect))
    })
    .await
}

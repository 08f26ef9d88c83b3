//! Bundle and deploy a stream consumer.
//!
//! ```text
//! streambot-deploy <env> <stack> [--region us-east-1] [--stream-arn ARN]
//! ```

use anyhow::Result;
use clap::Parser;
use streambot::deploy::{deploy_to_aws, DeployArgs};

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .init();
    let args = DeployArgs::parse();
    let arn = deploy_to_aws(&args).await?;
    println!("{arn}");
    Ok(())
}

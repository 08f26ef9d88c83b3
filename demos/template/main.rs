//! A minimal template to use as a starting point when writing your stream consumer.
use anyhow::Result;
use std::sync::Arc;
use streambot::lambda::{run_service, Error, Invocation};
use streambot::records::Record;

#[tokio::main]
async fn main() -> Result<(), Error> {
    run_service(service).await
}

async fn service(records: Vec<Record>, invocation: Arc<Invocation>) -> Result<()> {
    tracing::info!("Env: {:?}", invocation.env());

    for record in records {
        tracing::info!("Record: {:?}", record);
    }

    Ok(())
}

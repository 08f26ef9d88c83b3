use anyhow::Result;
use serde::Deserialize;
use std::fmt::Debug;
use std::sync::Arc;

use streambot::lambda::{run_service, Error, Invocation};
use streambot::records::Record;

#[tokio::main]
async fn main() -> Result<(), Error> {
    run_service(service).await
}

/// The structure of the messages we expect to see on the stream.
#[derive(Debug, Deserialize)]
pub struct Message {
    pub target: String,
}

/// Greet the target of every message in the batch.
///
/// The greeting comes from the function's runtime configuration, written by a
/// `StreambotEnv` resource:
///
/// ```yaml
/// Properties:
///   FunctionName: hello-stream-production
///   Greeting: Hello
/// ```
async fn service(records: Vec<Record>, invocation: Arc<Invocation>) -> Result<()> {
    let greeting = invocation.env().get("Greeting").unwrap_or("Hello");

    for record in records.iter().filter_map(Record::as_kinesis) {
        let message: Message = record.json()?;
        tracing::debug!("Message: {:?}", message);

        // Buffered, and shipped to S3 once the invocation completes
        invocation
            .log()
            .info(format!("{}, {}!", greeting, message.target));
    }

    Ok(())
}

//! # Streambot
//!
//! Streambot runs Kinesis stream consumers on [AWS Lambda](https://aws.amazon.com/lambda/).
//!
//! It is built around the [aws-sdk-rust](https://github.com/awslabs/aws-sdk-rust) and
//! [lambda_runtime](https://github.com/awslabs/aws-lambda-rust-runtime) packages and provides:
//!
//! * [lambda::run_service], which wraps your own service function so that every invocation
//!   loads runtime configuration from DynamoDB, hands your service a buffered logger, warns
//!   when the invocation is close to timing out, reports a `Success`/`Error` metric to
//!   CloudWatch and ships the buffered logs to S3.
//! * Two CloudFormation custom resources, `StreambotEnv` and `StreambotConnector`, which store
//!   runtime configuration and manage event source mappings between streams and functions.
//! * A small deploy CLI, `streambot-deploy`.
//!

// Public modules

pub mod config;
pub mod env;
pub mod lambda;
pub mod log;
pub mod metrics;
pub mod records;
pub mod retry;
pub mod s3;

#[cfg(feature = "deploy")]
pub mod deploy;
#[cfg(any(feature = "custom-resources", feature = "deploy"))]
pub mod mappings;
#[cfg(feature = "custom-resources")]
pub mod resources;

// Internal shared modules
mod localstack;
#[cfg(test)]
mod testing;

//! A wrapper around the [lambda_runtime](https://github.com/awslabs/aws-lambda-rust-runtime) crate
//! for services which consume a Kinesis stream.
//!
//! Each invocation of a wrapped service goes through the same steps:
//!
//! 1. The function's runtime configuration is read from the configuration table
//!    (see [crate::env]).
//! 2. The invocation records are normalised (see [crate::records]).
//! 3. The service runs with the records and an [Invocation], which carries the configuration
//!    and a buffered [Logger]. If the invocation gets close to its deadline a warning is
//!    logged, but the service is left to finish.
//! 4. A `Success` or `Error` data point is sent to CloudWatch (see [crate::metrics]).
//! 5. The buffered logs are written to S3, when a log bucket is configured and anything was
//!    logged (see [crate::s3]).
//! 6. The outcome of the service is returned to Lambda.
//!
//! Failures in steps 4 and 5 are logged and never change the outcome of the invocation.

use anyhow::{Context as _, Result};
use clap::{Parser, ValueEnum};
use lambda_runtime::{service_fn, LambdaEvent};
use serde_json::Value;
use std::ffi::OsString;
use std::future::Future;
use std::iter::empty;
use std::sync::Arc;
use std::time::{Duration, SystemTime, UNIX_EPOCH};
use tokio::time::Instant;
use tracing_subscriber::filter::EnvFilter;
use typed_builder::TypedBuilder;

use crate::env::{self, DynamoEnvStore, Env, EnvStore, StaticEnvStore};
use crate::log::Logger;
use crate::metrics::{self, CloudWatchSink, MetricSink, Status, TracingSink};
use crate::records::{self, Record};
use crate::s3::{LogSink, S3LogSink, S3Object};

/// Re-export of [lambda_runtime::Error](https://docs.rs/lambda_runtime/latest/lambda_runtime/type.Error.html).
///
// We provide this re-export so that the user doesn't need to have lambda_runtime as a direct dependency.
pub use lambda_runtime::Error;

/// Default remaining time below which a timeout warning is logged.
pub const DEFAULT_LOW_WATER_MARK: Duration = Duration::from_millis(200);

/// This struct is used to attempt to parse the `AWS_LAMBDA_FUNCTION_NAME` environment variable.
///
/// We assume that if this variable is present then we're running in a Lambda function.
/// https://docs.aws.amazon.com/lambda/latest/dg/configuration-envvars.html
#[derive(Debug, Parser)]
struct CheckLambda {
    #[arg(long, env)]
    aws_lambda_function_name: Option<String>,
}

/// Determine whether the code is being executed within an AWS Lambda.
///
/// This function can be used to write binaries that are able to run both locally
/// or as a Lambda function.
pub fn running_on_lambda() -> Result<bool> {
    let check_lambda = CheckLambda::try_parse_from(empty::<OsString>())
        .context("An error occurred while parsing environment variables for lambda detection.")?;
    Ok(check_lambda.aws_lambda_function_name.is_some())
}

/// How to treat a failure to read the function's runtime configuration.
///
/// A *missing* configuration record is never a failure; the service simply receives an empty
/// [Env].
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, ValueEnum)]
pub enum EnvPolicy {
    /// Log the failure and run the service with an empty [Env].
    #[default]
    Permissive,
    /// Fail the invocation without running the service.
    Strict,
}

/// Settings for the wrapper, read from environment variables.
#[derive(Debug, Clone, Parser)]
pub struct Settings {
    /// DynamoDB table holding runtime configuration.
    #[arg(long, env = "STREAMBOT_ENV_TABLE", default_value = env::DEFAULT_TABLE)]
    pub env_table: String,
    /// Region of the configuration table.
    #[arg(long, env = "STREAMBOT_ENV_REGION", default_value = env::DEFAULT_REGION)]
    pub env_region: String,
    /// What to do when the configuration cannot be read.
    #[arg(long, env = "STREAMBOT_ENV_POLICY", value_enum, default_value_t = EnvPolicy::Permissive)]
    pub env_policy: EnvPolicy,
    /// Name of the status metric.
    #[arg(long, env = "STREAMBOT_METRIC_NAME", default_value = metrics::DEFAULT_METRIC_NAME)]
    pub metric_name: String,
    /// Bucket to write buffered logs to. Logs are not shipped when unset.
    #[arg(long, env = "STREAMBOT_LOG_BUCKET")]
    pub log_bucket: Option<String>,
    /// Key prefix for buffered logs.
    #[arg(long, env = "STREAMBOT_LOG_PREFIX")]
    pub log_prefix: Option<String>,
    /// Remaining time, in milliseconds, below which a timeout warning is logged.
    #[arg(long, env = "STREAMBOT_LOW_WATER_MS", default_value_t = 200)]
    pub low_water_ms: u64,
}

impl Settings {
    /// Read the settings from environment variables only.
    pub fn from_env() -> Result<Self> {
        // We pass in an empty iterator rather than having clap parse the command line, as
        // Lambda may hand the process arguments which are not meant for us.
        Settings::try_parse_from(empty::<OsString>())
            .context("An error occurred while parsing environment variables for streambot.")
    }
}

/// The facts about an invocation which the wrapper needs from the Lambda context.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InvocationContext {
    pub function_name: String,
    pub request_id: String,
    pub log_stream_name: String,
    /// Time left before Lambda terminates the invocation.
    pub remaining: Duration,
}

impl From<&lambda_runtime::Context> for InvocationContext {
    fn from(ctx: &lambda_runtime::Context) -> Self {
        let deadline = UNIX_EPOCH + Duration::from_millis(ctx.deadline);
        InvocationContext {
            function_name: ctx.env_config.function_name.clone(),
            request_id: ctx.request_id.clone(),
            log_stream_name: ctx.env_config.log_stream.clone(),
            remaining: deadline
                .duration_since(SystemTime::now())
                .unwrap_or_default(),
        }
    }
}

/// The scope a service runs in for one invocation.
#[derive(Debug)]
pub struct Invocation {
    env: Env,
    log: Logger,
    function_name: String,
    request_id: String,
    deadline: Instant,
}

impl Invocation {
    /// The function's runtime configuration.
    pub fn env(&self) -> &Env {
        &self.env
    }

    /// The buffered logger for this invocation.
    pub fn log(&self) -> &Logger {
        &self.log
    }

    pub fn function_name(&self) -> &str {
        &self.function_name
    }

    pub fn request_id(&self) -> &str {
        &self.request_id
    }

    /// Time left before Lambda terminates the invocation.
    pub fn remaining_time(&self) -> Duration {
        self.deadline.saturating_duration_since(Instant::now())
    }
}

/// Runs a service for each invocation, with configuration, metrics and log shipping.
#[derive(Clone, TypedBuilder)]
pub struct Streambot {
    env_store: Arc<dyn EnvStore>,
    metric_sink: Arc<dyn MetricSink>,
    log_sink: Arc<dyn LogSink>,
    #[builder(default)]
    env_policy: EnvPolicy,
    #[builder(default = metrics::DEFAULT_METRIC_NAME.to_owned(), setter(into))]
    metric_name: String,
    #[builder(default, setter(strip_option, into))]
    log_bucket: Option<String>,
    #[builder(default, setter(strip_option, into))]
    log_prefix: Option<String>,
    #[builder(default = DEFAULT_LOW_WATER_MARK)]
    low_water_mark: Duration,
}

impl std::fmt::Debug for Streambot {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Streambot")
            .field("env_policy", &self.env_policy)
            .field("metric_name", &self.metric_name)
            .field("log_bucket", &self.log_bucket)
            .field("log_prefix", &self.log_prefix)
            .field("low_water_mark", &self.low_water_mark)
            .finish_non_exhaustive()
    }
}

impl Streambot {
    /// Create a wrapper talking to DynamoDB, CloudWatch and S3.
    pub async fn from_settings(settings: &Settings) -> Result<Self> {
        let shared_config = crate::config::load_from_env().await?;
        let env_store = DynamoEnvStore::connect(&settings.env_table, &settings.env_region).await?;
        Ok(Streambot {
            env_store: Arc::new(env_store),
            metric_sink: Arc::new(CloudWatchSink::new(aws_sdk_cloudwatch::Client::new(
                &shared_config,
            ))),
            log_sink: Arc::new(S3LogSink::new(aws_sdk_s3::Client::new(&shared_config))),
            env_policy: settings.env_policy,
            metric_name: settings.metric_name.clone(),
            log_bucket: settings.log_bucket.clone(),
            log_prefix: settings.log_prefix.clone(),
            low_water_mark: Duration::from_millis(settings.low_water_ms),
        })
    }

    /// Run `service` for a single invocation, returning the completion summary or the
    /// service's error.
    pub async fn invoke<F, Fut>(
        &self,
        service: &F,
        payload: Value,
        ctx: InvocationContext,
    ) -> Result<String>
    where
        F: Fn(Vec<Record>, Arc<Invocation>) -> Fut,
        Fut: Future<Output = Result<()>>,
    {
        let deadline = Instant::now() + ctx.remaining;
        let log = Logger::new(&ctx.function_name);

        let env = match self.load_env(&ctx.function_name).await {
            Ok(env) => env,
            Err(e) => return self.finish(Err(e), &[], &log).await,
        };
        let records = match records::normalize(payload) {
            Ok(records) => records,
            Err(e) => return self.finish(Err(e.into()), &[], &log).await,
        };
        let ids: Vec<String> = records
            .iter()
            .filter_map(Record::id)
            .map(str::to_owned)
            .collect();
        tracing::debug!("Invoking service with {} records", records.len());

        let invocation = Arc::new(Invocation {
            env,
            log: log.clone(),
            function_name: ctx.function_name,
            request_id: ctx.request_id,
            deadline,
        });
        let result = self
            .supervise(service(records, invocation), deadline, &log)
            .await;
        self.finish(result, &ids, &log).await
    }

    async fn load_env(&self, function_name: &str) -> Result<Env> {
        match self.env_store.get(function_name).await {
            Ok(Some(env)) => {
                tracing::debug!("Loaded {} configuration variables", env.len());
                Ok(env)
            }
            Ok(None) => {
                tracing::info!("No configuration found for {function_name}");
                Ok(Env::default())
            }
            Err(e) => match self.env_policy {
                EnvPolicy::Strict => Err(e),
                EnvPolicy::Permissive => {
                    tracing::error!("Continuing without configuration: {:?}", e);
                    Ok(Env::default())
                }
            },
        }
    }

    /// Await the service, logging a single warning if it is still running once the remaining
    /// time drops under the low-water mark.
    async fn supervise<Fut>(&self, service: Fut, deadline: Instant, log: &Logger) -> Result<()>
    where
        Fut: Future<Output = Result<()>>,
    {
        let warn_at = deadline
            .checked_sub(self.low_water_mark)
            .unwrap_or_else(Instant::now);
        tokio::pin!(service);
        tokio::select! {
            biased;
            result = &mut service => result,
            _ = tokio::time::sleep_until(warn_at) => {
                log.warn(format!(
                    "Invocation is about to time out, {:?} remaining",
                    deadline.saturating_duration_since(Instant::now())
                ));
                service.await
            }
        }
    }

    /// Report the outcome, ship the logs and build the response for Lambda.
    async fn finish(&self, result: Result<()>, ids: &[String], log: &Logger) -> Result<String> {
        let status = Status::from(&result);
        if let Err(e) = self.metric_sink.put_status(&self.metric_name, status).await {
            tracing::error!("Failed to report {} metric: {:?}", status, e);
        }

        if let Some(dst) = self.log_destination(log.function_name(), ids) {
            if !log.is_empty() {
                if let Err(e) = self.log_sink.put_logs(&dst, log.contents()).await {
                    tracing::error!("Failed to ship logs to {}: {:?}", dst, e);
                }
            }
        }

        result.map(|()| records::summarize(ids.iter().map(String::as_str)))
    }

    fn log_destination(&self, function_name: &str, ids: &[String]) -> Option<S3Object> {
        let bucket = self.log_bucket.as_deref()?;
        let (Some(first), Some(last)) = (ids.first(), ids.last()) else {
            tracing::debug!("No record ids to name the log object after");
            return None;
        };
        Some(S3Object::for_invocation_logs(
            bucket,
            self.log_prefix.as_deref(),
            function_name,
            records::shard_id(first),
            records::sequence_number(last),
        ))
    }
}

/// Set up tracing so that all `tracing::<...>!()` calls are JSON formatted for consumption
/// by CloudWatch. The level defaults to `info` and can be changed with `RUST_LOG`.
pub fn init_tracing() {
    // A subscriber may already be installed, e.g. by tests.
    let _ = tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .json()
        .try_init();
}

/// Executes a service against every invocation of the Lambda function.
///
/// The `run_service` function takes care of the following tasks:
///
/// * Executes the Lambda runtime, using [lambda_runtime](https://github.com/awslabs/aws-lambda-rust-runtime).
/// * Sets up tracing to ensure all `tracing::<...>!()` calls are JSON formatted for consumption by CloudWatch.
/// * Reads the wrapper [Settings] from environment variables.
/// * For each invocation, loads the function's runtime configuration and calls your service
///   with the decoded records and an [Invocation].
/// * Reports a `Success`/`Error` metric and ships buffered logs.
///
/// # Example
///
/// ```no_run
/// use anyhow::Result;
/// use std::sync::Arc;
/// use streambot::lambda::{run_service, Error, Invocation};
/// use streambot::records::Record;
///
/// #[tokio::main]
/// async fn main() -> Result<(), Error> {
///     run_service(service).await
/// }
///
/// async fn service(records: Vec<Record>, invocation: Arc<Invocation>) -> Result<()> {
///     let bucket = invocation.env().require("EventBucket")?;
///     for record in records.iter().filter_map(Record::as_kinesis) {
///         invocation
///             .log()
///             .info(format!("{} -> {bucket}", record.sequence_number));
///     }
///     Ok(())
/// }
/// ```
///
/// # Error handling
///
/// If the wrapper cannot be set up, every invocation fails. Errors returned by the service
/// fail the invocation, so the batch will be retried by the event source mapping. The full
/// error is logged to stdout in a format compatible with CloudWatch.
pub async fn run_service<F, Fut>(service: F) -> Result<(), Error>
where
    F: Fn(Vec<Record>, Arc<Invocation>) -> Fut,
    Fut: Future<Output = Result<()>>,
{
    // Perform initial setup outside of the runtime to avoid this code being run
    // on every invocation of the lambda. Errors are captured and raised by the
    // handler, as lambda_runtime has no way to report an initialization error.
    let init_result = async {
        init_tracing();
        let settings = Settings::from_env()?;
        tracing::info!("Settings: {:?}", settings);
        Streambot::from_settings(&settings).await
    }
    .await;

    lambda_runtime::run(service_fn(|event: LambdaEvent<Value>| async {
        let streambot = match &init_result {
            Ok(x) => x,
            Err(e) => {
                tracing::error!("{:?}", e);
                return Err(Error::from("Failed to initialise streambot."));
            }
        };

        let (payload, context) = event.into_parts();
        let result = streambot
            .invoke(&service, payload, InvocationContext::from(&context))
            .await;

        // Log out the full error, as the lambda_runtime only logs the first line of the error
        // message, which can hide crucial information.
        result.map_err(|e| {
            tracing::error!("{:?}", e);
            Error::from(format!("{e:#}"))
        })
    }))
    .await
}

/// Executes a service once against `payload`, outside of Lambda.
///
/// The service receives `env` as its configuration. Metrics are only logged and logs are
/// not shipped.
pub async fn run_local_service<F, Fut>(service: F, payload: Value, env: Env) -> Result<String>
where
    F: Fn(Vec<Record>, Arc<Invocation>) -> Fut,
    Fut: Future<Output = Result<()>>,
{
    init_tracing();
    let streambot = Streambot::builder()
        .env_store(Arc::new(StaticEnvStore(env)))
        .metric_sink(Arc::new(TracingSink))
        .log_sink(Arc::new(crate::s3::DiscardLogSink))
        .build();
    let ctx = InvocationContext {
        function_name: "local".to_owned(),
        request_id: "local".to_owned(),
        log_stream_name: "local".to_owned(),
        remaining: Duration::from_secs(900),
    };
    streambot.invoke(&service, payload, ctx).await
}

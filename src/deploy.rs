//! Deploying a stream consumer.
//!
//! A deployment bundles the function, looks up the outputs of the application's stack (which
//! must point at the primary Streambot stack through its `StreambotStack` output), creates or
//! updates the function `<package>-<env>`, and optionally connects it to a stream.
//!
//! The individual steps are exposed so that they can be scripted separately.

use anyhow::{Context, Result};
use async_trait::async_trait;
use aws_sdk_cloudformation::types::StackResource;
use aws_sdk_lambda::primitives::Blob;
use aws_sdk_lambda::types::{FunctionCode, Runtime};
use clap::Parser;
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use thiserror::Error;
use tokio::process::Command;

use crate::config;
use crate::mappings::{EventSourceMappings, LambdaEventSourceMappings, MappingSpec};

pub const DEFAULT_REGION: &str = "us-east-1";
pub const DEFAULT_BUNDLE_COMMAND: &str = "cargo lambda build --release --output-format zip";

/// Output of the application stack naming the primary Streambot stack.
pub const STREAMBOT_STACK_OUTPUT: &str = "StreambotStack";
/// Output holding the ARN of the role functions execute as.
pub const EXECUTION_ROLE_OUTPUT: &str = "LambdaExecutionRole";

pub const RUNTIME: &str = "provided.al2023";
pub const HANDLER: &str = "bootstrap";
pub const MEMORY_SIZE: i32 = 128;
pub const TIMEOUT_SECONDS: i32 = 60;

#[derive(Debug, Error)]
pub enum DeployError {
    #[error("Could not find stack {0}")]
    StackNotFound(String),
    #[error("Stack {stack} missing {key} output")]
    MissingOutput { stack: String, key: &'static str },
    #[error("Bundle command `{command}` failed with {status}: {stderr}")]
    BundleFailed {
        command: String,
        status: std::process::ExitStatus,
        stderr: String,
    },
    #[error("Bundle command did not produce a zip file, looked for {0}")]
    BundleNotFound(PathBuf),
}

/// The parts of a CloudFormation stack a deployment reads.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct StackDescription {
    pub outputs: BTreeMap<String, String>,
    pub parameters: BTreeMap<String, String>,
}

#[async_trait]
pub trait Stacks: Send + Sync {
    async fn describe(&self, stack_name: &str) -> Result<StackDescription>;
    /// Physical resource ids keyed by logical resource id.
    async fn resources(&self, stack_name: &str) -> Result<BTreeMap<String, String>>;
}

/// [Stacks] through the CloudFormation API.
#[derive(Debug, Clone)]
pub struct CloudFormationStacks {
    client: aws_sdk_cloudformation::Client,
}

impl CloudFormationStacks {
    pub fn new(client: aws_sdk_cloudformation::Client) -> Self {
        CloudFormationStacks { client }
    }
}

#[async_trait]
impl Stacks for CloudFormationStacks {
    async fn describe(&self, stack_name: &str) -> Result<StackDescription> {
        let output = self
            .client
            .describe_stacks()
            .stack_name(stack_name)
            .send()
            .await
            .with_context(|| format!("Failed to describe stack {stack_name}"))?;
        let stack = output
            .stacks()
            .first()
            .ok_or_else(|| DeployError::StackNotFound(stack_name.to_owned()))?;
        Ok(StackDescription {
            outputs: stack
                .outputs()
                .iter()
                .filter_map(|o| Some((o.output_key()?.to_owned(), o.output_value()?.to_owned())))
                .collect(),
            parameters: stack
                .parameters()
                .iter()
                .filter_map(|p| {
                    Some((p.parameter_key()?.to_owned(), p.parameter_value()?.to_owned()))
                })
                .collect(),
        })
    }

    async fn resources(&self, stack_name: &str) -> Result<BTreeMap<String, String>> {
        let output = self
            .client
            .describe_stack_resources()
            .stack_name(stack_name)
            .send()
            .await
            .with_context(|| format!("Failed to describe resources of stack {stack_name}"))?;
        Ok(output
            .stack_resources()
            .iter()
            .filter_map(resource_ids)
            .collect())
    }
}

/// The logical and physical id of a resource. Resources still being created have no
/// physical id and are skipped.
fn resource_ids(resource: &StackResource) -> Option<(String, String)> {
    Some((
        resource.logical_resource_id()?.to_owned(),
        resource.physical_resource_id()?.to_owned(),
    ))
}

/// The outputs of `stack_name` merged with those of the Streambot stack it points at.
///
/// Outputs of the Streambot stack win when both stacks define the same key.
pub async fn get_stack_outputs(
    stacks: &dyn Stacks,
    stack_name: &str,
) -> Result<BTreeMap<String, String>> {
    let mut outputs = stacks.describe(stack_name).await?.outputs;
    let streambot_stack = outputs
        .get(STREAMBOT_STACK_OUTPUT)
        .cloned()
        .ok_or_else(|| DeployError::MissingOutput {
            stack: stack_name.to_owned(),
            key: STREAMBOT_STACK_OUTPUT,
        })?;
    tracing::debug!("Following {stack_name} to {streambot_stack}");
    outputs.extend(stacks.describe(&streambot_stack).await?.outputs);
    Ok(outputs)
}

pub async fn get_stack_parameters(
    stacks: &dyn Stacks,
    stack_name: &str,
) -> Result<BTreeMap<String, String>> {
    Ok(stacks.describe(stack_name).await?.parameters)
}

pub async fn get_stack_resources(
    stacks: &dyn Stacks,
    stack_name: &str,
) -> Result<BTreeMap<String, String>> {
    stacks.resources(stack_name).await
}

/// Run the bundle `command` in `dir` and locate the zip file it built.
///
/// The last line printed by the command is taken as the path of the zip, relative to `dir`.
/// When that is not a file, the `cargo lambda` output location for `package` is used.
pub async fn bundle(command: &str, dir: &Path, package: &str) -> Result<PathBuf> {
    tracing::info!("Bundling with `{command}`");
    let output = Command::new("sh")
        .arg("-c")
        .arg(command)
        .current_dir(dir)
        .output()
        .await
        .with_context(|| format!("Failed to run bundle command `{command}`"))?;
    if !output.status.success() {
        return Err(DeployError::BundleFailed {
            command: command.to_owned(),
            status: output.status,
            stderr: String::from_utf8_lossy(&output.stderr).trim().to_owned(),
        }
        .into());
    }

    let stdout = String::from_utf8_lossy(&output.stdout);
    if let Some(printed) = stdout.lines().map(str::trim).filter(|l| !l.is_empty()).last() {
        let path = dir.join(printed);
        if path.is_file() {
            return Ok(path);
        }
    }
    let default = dir
        .join("target")
        .join("lambda")
        .join(package)
        .join("bootstrap.zip");
    if default.is_file() {
        Ok(default)
    } else {
        Err(DeployError::BundleNotFound(default).into())
    }
}

/// What a deployed function looks like.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FunctionSpec {
    pub name: String,
    pub role: String,
    pub description: Option<String>,
}

#[async_trait]
pub trait Functions: Send + Sync {
    async fn exists(&self, name: &str) -> Result<bool>;
    /// Create the function, returning its ARN.
    async fn create(&self, spec: &FunctionSpec, zip: Vec<u8>) -> Result<String>;
    /// Replace the code of the function, returning its ARN.
    async fn update_code(&self, name: &str, zip: Vec<u8>) -> Result<String>;
}

/// [Functions] through the Lambda API.
#[derive(Debug, Clone)]
pub struct LambdaFunctions {
    client: aws_sdk_lambda::Client,
}

impl LambdaFunctions {
    pub fn new(client: aws_sdk_lambda::Client) -> Self {
        LambdaFunctions { client }
    }
}

#[async_trait]
impl Functions for LambdaFunctions {
    async fn exists(&self, name: &str) -> Result<bool> {
        match self.client.get_function().function_name(name).send().await {
            Ok(_) => Ok(true),
            Err(e)
                if e.as_service_error()
                    .is_some_and(|e| e.is_resource_not_found_exception()) =>
            {
                Ok(false)
            }
            Err(e) => Err(e).with_context(|| format!("Failed to look up function {name}")),
        }
    }

    async fn create(&self, spec: &FunctionSpec, zip: Vec<u8>) -> Result<String> {
        let output = self
            .client
            .create_function()
            .function_name(&spec.name)
            .runtime(Runtime::from(RUNTIME))
            .handler(HANDLER)
            .role(&spec.role)
            .set_description(spec.description.clone())
            .memory_size(MEMORY_SIZE)
            .timeout(TIMEOUT_SECONDS)
            .code(FunctionCode::builder().zip_file(Blob::new(zip)).build())
            .send()
            .await
            .with_context(|| format!("Failed to create function {}", spec.name))?;
        output
            .function_arn()
            .map(str::to_owned)
            .with_context(|| format!("Lambda did not return the ARN of {}", spec.name))
    }

    async fn update_code(&self, name: &str, zip: Vec<u8>) -> Result<String> {
        let output = self
            .client
            .update_function_code()
            .function_name(name)
            .zip_file(Blob::new(zip))
            .send()
            .await
            .with_context(|| format!("Failed to update code of function {name}"))?;
        output
            .function_arn()
            .map(str::to_owned)
            .with_context(|| format!("Lambda did not return the ARN of {name}"))
    }
}

/// Create the function described by `spec` from `zip_file`, or update its code if it already
/// exists. Returns the function ARN.
pub async fn deploy_function(
    functions: &dyn Functions,
    spec: &FunctionSpec,
    zip_file: &Path,
) -> Result<String> {
    let zip = tokio::fs::read(zip_file)
        .await
        .with_context(|| format!("Failed to read bundle {}", zip_file.display()))?;
    if functions.exists(&spec.name).await? {
        tracing::info!("Updating code of {}", spec.name);
        functions.update_code(&spec.name, zip).await
    } else {
        tracing::info!("Creating {}", spec.name);
        functions.create(spec, zip).await
    }
}

/// Make sure `function_name` reads from `stream_arn`, returning the mapping's UUID.
pub async fn set_event_source(
    mappings: &dyn EventSourceMappings,
    stream_arn: &str,
    function_name: &str,
) -> Result<String> {
    if let Some(uuid) = mappings
        .list(stream_arn, function_name)
        .await?
        .into_iter()
        .next()
    {
        return Ok(uuid);
    }
    mappings
        .create(&MappingSpec::new(function_name, stream_arn))
        .await
}

/// Render variables in `.env` format, one `KEY=value` per line.
pub fn render_dotenv(vars: &BTreeMap<String, String>) -> String {
    vars.iter().map(|(k, v)| format!("{k}={v}\n")).collect()
}

pub fn write_dotenv(vars: &BTreeMap<String, String>, path: &Path) -> Result<()> {
    std::fs::write(path, render_dotenv(vars))
        .with_context(|| format!("Failed to write {}", path.display()))
}

/// The function name used for `package` in environment `env`.
pub fn function_name(package: &str, env: &str) -> String {
    format!("{package}-{env}")
}

/// Arguments of the `streambot-deploy` command.
#[derive(Debug, Clone, Parser)]
#[command(version, about = "Bundle and deploy a stream consumer")]
pub struct DeployArgs {
    /// Deployment environment, e.g. `staging`.
    pub env: String,
    /// Name of the application stack.
    pub stack: String,
    #[arg(long, default_value = DEFAULT_REGION)]
    pub region: String,
    /// Connect the function to this stream.
    #[arg(long)]
    pub stream_arn: Option<String>,
    #[arg(long, default_value = DEFAULT_BUNDLE_COMMAND)]
    pub bundle_command: String,
    #[arg(long)]
    pub description: Option<String>,
    /// Package name, used to name the function.
    #[arg(long, env = "CARGO_PKG_NAME")]
    pub package: String,
    /// Directory of the package.
    #[arg(long, default_value = ".")]
    pub dir: PathBuf,
}

/// Run every step of a deployment. Returns the function ARN.
pub async fn deploy(
    args: &DeployArgs,
    stacks: &dyn Stacks,
    functions: &dyn Functions,
    mappings: &dyn EventSourceMappings,
) -> Result<String> {
    let zip_file = bundle(&args.bundle_command, &args.dir, &args.package).await?;
    let outputs = get_stack_outputs(stacks, &args.stack).await?;
    let role = outputs
        .get(EXECUTION_ROLE_OUTPUT)
        .cloned()
        .ok_or_else(|| DeployError::MissingOutput {
            stack: args.stack.clone(),
            key: EXECUTION_ROLE_OUTPUT,
        })?;
    let spec = FunctionSpec {
        name: function_name(&args.package, &args.env),
        role,
        description: args.description.clone(),
    };
    let arn = deploy_function(functions, &spec, &zip_file).await?;
    if let Some(stream_arn) = &args.stream_arn {
        let uuid = set_event_source(mappings, stream_arn, &spec.name).await?;
        tracing::info!("{} reads from {} through mapping {}", spec.name, stream_arn, uuid);
    }
    Ok(arn)
}

/// Run a deployment against AWS in `args.region`.
pub async fn deploy_to_aws(args: &DeployArgs) -> Result<String> {
    let shared_config = config::load_for_region(&args.region).await?;
    let stacks = CloudFormationStacks::new(aws_sdk_cloudformation::Client::new(&shared_config));
    let lambda = aws_sdk_lambda::Client::new(&shared_config);
    let functions = LambdaFunctions::new(lambda.clone());
    let mappings = LambdaEventSourceMappings::new(lambda);
    deploy(args, &stacks, &functions, &mappings).await
}

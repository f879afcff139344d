use std::collections::HashMap;

use anyhow::{bail, Context};
use async_trait::async_trait;
use aws_config::BehaviorVersion;
use aws_sdk_lambda::types::Environment;
use aws_sdk_lambda::Client as LambdaClient;
use bon::Builder;
use lambda_runtime::LambdaEvent;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use thiserror::Error;
use tracing::{error, info};

pub const TARGET_FUNCTION_NAME_VAR: &str = "TARGET_FUNCTION_NAME";
pub const FAILURE_RATE_KEY: &str = "FAILURE_RATE";
pub const DISABLED_FAILURE_RATE: &str = "0";

#[derive(Debug, Error)]
pub enum RemediationError {
    #[error("TARGET_FUNCTION_NAME must name the function to remediate")]
    MissingTargetFunction,

    #[error("failed to read configuration of {target}: {cause:#}")]
    Fetch {
        target: String,
        cause: anyhow::Error,
    },

    #[error("failed to update configuration of {target}: {cause:#}")]
    Update {
        target: String,
        cause: anyhow::Error,
    },

    #[error("failed to encode response body: {0}")]
    Encode(#[from] serde_json::Error),
}

#[derive(Debug, Clone, PartialEq)]
pub struct RemediatorConfig {
    pub target_function_name: String,
}

impl RemediatorConfig {
    pub fn from_lookup<F>(lookup: F) -> Result<Self, RemediationError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let target_function_name = lookup(TARGET_FUNCTION_NAME_VAR)
            .filter(|name| !name.trim().is_empty())
            .ok_or(RemediationError::MissingTargetFunction)?;

        Ok(Self {
            target_function_name,
        })
    }
}

pub fn process_env(key: &str) -> Option<String> {
    std::env::var_os(key).map(|value| value.to_string_lossy().into_owned())
}

/// Environment variables of a deployed function, as last read from the platform.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct FunctionEnvironment {
    pub variables: HashMap<String, String>,
    /// Revision the variables were read at. Passing it back on update makes the
    /// platform reject the write if the function changed in between.
    pub revision_id: Option<String>,
}

/// Forces `FAILURE_RATE` to `"0"` and returns the value it replaced.
pub fn disable_failure_injection(variables: &mut HashMap<String, String>) -> Option<String> {
    variables.insert(
        FAILURE_RATE_KEY.to_string(),
        DISABLED_FAILURE_RATE.to_string(),
    )
}

#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait FunctionConfigurationStore: Send + Sync {
    async fn fetch_environment(&self, function_name: &str) -> anyhow::Result<FunctionEnvironment>;

    /// Replaces the function's whole environment with `variables`.
    async fn replace_environment(
        &self,
        function_name: &str,
        variables: HashMap<String, String>,
        revision_id: Option<String>,
    ) -> anyhow::Result<()>;
}

pub struct LambdaConfigurationStore {
    client: LambdaClient,
}

impl LambdaConfigurationStore {
    pub fn new(client: LambdaClient) -> Self {
        Self { client }
    }

    pub async fn from_env() -> Self {
        let config = aws_config::defaults(BehaviorVersion::latest()).load().await;
        Self::new(LambdaClient::new(&config))
    }
}

#[async_trait]
impl FunctionConfigurationStore for LambdaConfigurationStore {
    async fn fetch_environment(&self, function_name: &str) -> anyhow::Result<FunctionEnvironment> {
        let output = self
            .client
            .get_function_configuration()
            .function_name(function_name)
            .send()
            .await
            .with_context(|| format!("GetFunctionConfiguration failed for {function_name}"))?;

        let environment = output.environment();

        // Variables that failed to decrypt come back empty; writing them back
        // would wipe the live configuration.
        if let Some(env_error) = environment.and_then(|env| env.error()) {
            bail!(
                "environment of {} is unreadable: {} ({})",
                function_name,
                env_error.message().unwrap_or("no message"),
                env_error.error_code().unwrap_or("unknown error"),
            );
        }

        Ok(FunctionEnvironment {
            variables: environment
                .and_then(|env| env.variables())
                .cloned()
                .unwrap_or_default(),
            revision_id: output.revision_id().map(str::to_string),
        })
    }

    async fn replace_environment(
        &self,
        function_name: &str,
        variables: HashMap<String, String>,
        revision_id: Option<String>,
    ) -> anyhow::Result<()> {
        self.client
            .update_function_configuration()
            .function_name(function_name)
            .environment(Environment::builder().set_variables(Some(variables)).build())
            .set_revision_id(revision_id)
            .send()
            .await
            .with_context(|| format!("UpdateFunctionConfiguration failed for {function_name}"))?;

        Ok(())
    }
}

#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct Response {
    pub status_code: u16,
    pub body: String,
}

impl Response {
    pub fn ok<T: Serialize>(body: &T) -> Result<Self, serde_json::Error> {
        Ok(Self {
            status_code: 200,
            body: serde_json::to_string(body)?,
        })
    }
}

#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
pub struct RemediationReport {
    pub message: String,
    pub target: String,
}

impl RemediationReport {
    pub fn applied(target: &str) -> Self {
        Self {
            message: "Remediation applied".to_string(),
            target: target.to_string(),
        }
    }
}

#[derive(Builder, Debug, Clone, PartialEq)]
pub struct Remediation {
    #[builder(into)]
    pub target: String,
    pub previous_failure_rate: Option<String>,
    pub preserved_keys: usize,
}

pub struct Remediator<S> {
    store: S,
}

impl<S: FunctionConfigurationStore> Remediator<S> {
    pub fn new(store: S) -> Self {
        Self { store }
    }

    pub fn store(&self) -> &S {
        &self.store
    }

    /// Resolves the target through `lookup` and remediates it. A missing
    /// target fails before the store is touched.
    pub async fn handle<F>(&self, lookup: F) -> Result<Response, RemediationError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let config = RemediatorConfig::from_lookup(lookup)?;
        let remediation = self.remediate(&config.target_function_name).await?;

        Ok(Response::ok(&RemediationReport::applied(&remediation.target))?)
    }

    pub async fn remediate(&self, target: &str) -> Result<Remediation, RemediationError> {
        info!(target_function = target, "Fetching function configuration");

        let FunctionEnvironment {
            mut variables,
            revision_id,
        } = self
            .store
            .fetch_environment(target)
            .await
            .map_err(|cause| {
                error!("Failed to read configuration of {}: {:#}", target, cause);
                RemediationError::Fetch {
                    target: target.to_string(),
                    cause,
                }
            })?;

        let previous_failure_rate = disable_failure_injection(&mut variables);
        let preserved_keys = variables.len() - 1;

        self.store
            .replace_environment(target, variables, revision_id)
            .await
            .map_err(|cause| {
                error!("Failed to update configuration of {}: {:#}", target, cause);
                RemediationError::Update {
                    target: target.to_string(),
                    cause,
                }
            })?;

        info!(
            target_function = target,
            previous_failure_rate = previous_failure_rate.as_deref().unwrap_or("<unset>"),
            preserved_keys,
            "Remediation applied"
        );

        Ok(Remediation::builder()
            .target(target)
            .maybe_previous_failure_rate(previous_failure_rate)
            .preserved_keys(preserved_keys)
            .build())
    }
}

/// Lambda entry point. The event only triggers the run; its payload is ignored.
pub async fn function_handler<S, F>(
    remediator: &Remediator<S>,
    _event: LambdaEvent<Value>,
    lookup: F,
) -> Result<Response, lambda_runtime::Error>
where
    S: FunctionConfigurationStore,
    F: Fn(&str) -> Option<String>,
{
    Ok(remediator.handle(lookup).await?)
}

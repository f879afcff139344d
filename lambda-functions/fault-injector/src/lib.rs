use std::str::FromStr;
use std::time::Duration;

use async_trait::async_trait;
use bon::Builder;
use lambda_runtime::LambdaEvent;
use rand::Rng;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use thiserror::Error;
use tracing::{info, warn};

pub const FAILURE_RATE_VAR: &str = "FAILURE_RATE";

/// How long a simulated slow dependency stalls before the invocation fails.
pub const DEFAULT_FAILURE_DELAY: Duration = Duration::from_secs(2);

#[derive(Debug, Error)]
pub enum FaultInjectorError {
    #[error("FAILURE_RATE must be a number between 0 and 1, got {value:?}")]
    InvalidFailureRate { value: String },

    #[error("Downstream API timeout")]
    DownstreamTimeout,

    #[error("failed to encode response body: {0}")]
    Encode(#[from] serde_json::Error),
}

/// Probability in `[0, 1]` that an invocation fails.
#[derive(Debug, Clone, Copy, PartialEq, Default)]
pub struct FailureRate(f64);

impl FailureRate {
    pub fn new(value: f64) -> Option<Self> {
        (0.0..=1.0).contains(&value).then_some(Self(value))
    }

    pub fn value(self) -> f64 {
        self.0
    }

    pub fn should_fail(self, sample: f64) -> bool {
        sample < self.0
    }
}

impl FromStr for FailureRate {
    type Err = FaultInjectorError;

    fn from_str(raw: &str) -> Result<Self, Self::Err> {
        raw.trim()
            .parse::<f64>()
            .ok()
            .and_then(Self::new)
            .ok_or_else(|| FaultInjectorError::InvalidFailureRate {
                value: raw.to_string(),
            })
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Default)]
pub struct FaultInjectorConfig {
    pub failure_rate: FailureRate,
}

impl FaultInjectorConfig {
    /// Builds the config from `lookup`; an unset `FAILURE_RATE` means no failures.
    pub fn from_lookup<F>(lookup: F) -> Result<Self, FaultInjectorError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let failure_rate = match lookup(FAILURE_RATE_VAR) {
            Some(raw) => raw.parse()?,
            None => FailureRate::default(),
        };

        Ok(Self { failure_rate })
    }
}

pub fn process_env(key: &str) -> Option<String> {
    std::env::var_os(key).map(|value| value.to_string_lossy().into_owned())
}

/// Source of uniform samples in `[0, 1)`.
#[cfg_attr(test, mockall::automock)]
pub trait Entropy: Send + Sync {
    fn sample(&self) -> f64;
}

pub struct ThreadRngEntropy;

impl Entropy for ThreadRngEntropy {
    fn sample(&self) -> f64 {
        rand::thread_rng().gen::<f64>()
    }
}

#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait Delay: Send + Sync {
    async fn pause(&self, duration: Duration);
}

pub struct TokioDelay;

#[async_trait]
impl Delay for TokioDelay {
    async fn pause(&self, duration: Duration) {
        tokio::time::sleep(duration).await;
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
pub struct HealthReport {
    pub status: String,
    pub failure_rate: f64,
}

impl HealthReport {
    pub fn healthy(failure_rate: FailureRate) -> Self {
        Self {
            status: "healthy".to_string(),
            failure_rate: failure_rate.value(),
        }
    }
}

#[derive(Builder)]
pub struct FaultInjector<E, D> {
    entropy: E,
    delay: D,
    #[builder(default = DEFAULT_FAILURE_DELAY)]
    failure_delay: Duration,
}

pub type LiveFaultInjector = FaultInjector<ThreadRngEntropy, TokioDelay>;

impl LiveFaultInjector {
    pub fn new() -> Self {
        Self::builder()
            .entropy(ThreadRngEntropy)
            .delay(TokioDelay)
            .build()
    }
}

impl Default for LiveFaultInjector {
    fn default() -> Self {
        Self::new()
    }
}

impl<E: Entropy, D: Delay> FaultInjector<E, D> {
    /// Reads the configuration through `lookup`, then runs one invocation.
    pub async fn handle<F>(&self, lookup: F) -> Result<Response, FaultInjectorError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let config = FaultInjectorConfig::from_lookup(lookup)?;
        self.invoke(&config).await
    }

    pub async fn invoke(&self, config: &FaultInjectorConfig) -> Result<Response, FaultInjectorError> {
        let failure_rate = config.failure_rate;

        if failure_rate.should_fail(self.entropy.sample()) {
            warn!(
                failure_rate = failure_rate.value(),
                delay = ?self.failure_delay,
                "Injecting downstream failure"
            );
            self.delay.pause(self.failure_delay).await;
            return Err(FaultInjectorError::DownstreamTimeout);
        }

        info!(failure_rate = failure_rate.value(), "Responding healthy");
        Ok(Response::ok(&HealthReport::healthy(failure_rate))?)
    }
}

/// Lambda entry point. `FAILURE_RATE` is resolved through `lookup` on every call;
/// the event payload is ignored.
pub async fn function_handler<E, D, F>(
    injector: &FaultInjector<E, D>,
    _event: LambdaEvent<Value>,
    lookup: F,
) -> Result<Response, lambda_runtime::Error>
where
    E: Entropy,
    D: Delay,
    F: Fn(&str) -> Option<String>,
{
    Ok(injector.handle(lookup).await?)
}

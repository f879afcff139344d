use async_trait::async_trait;
use fault_injector::{
    function_handler, Delay, Entropy, FailureRate, FaultInjector, FaultInjectorConfig,
    FaultInjectorError, HealthReport, Response, FAILURE_RATE_VAR,
};
use lambda_runtime::{Context, LambdaEvent};
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use serde_json::json;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

struct SeededEntropy(Mutex<StdRng>);

impl SeededEntropy {
    fn new(seed: u64) -> Self {
        Self(Mutex::new(StdRng::seed_from_u64(seed)))
    }
}

impl Entropy for SeededEntropy {
    fn sample(&self) -> f64 {
        self.0.lock().unwrap().gen::<f64>()
    }
}

#[derive(Default)]
struct RecordingDelay {
    pauses: Arc<AtomicUsize>,
}

#[async_trait]
impl Delay for RecordingDelay {
    async fn pause(&self, _duration: Duration) {
        self.pauses.fetch_add(1, Ordering::SeqCst);
    }
}

fn seeded_injector(seed: u64) -> FaultInjector<SeededEntropy, RecordingDelay> {
    FaultInjector::builder()
        .entropy(SeededEntropy::new(seed))
        .delay(RecordingDelay::default())
        .build()
}

fn env_with_rate(rate: &'static str) -> impl Fn(&str) -> Option<String> {
    move |key: &str| (key == FAILURE_RATE_VAR).then(|| rate.to_string())
}

async fn failure_proportion(rate: &'static str, invocations: usize) -> f64 {
    let injector = seeded_injector(42);
    let mut failures = 0;

    for _ in 0..invocations {
        if injector.handle(env_with_rate(rate)).await.is_err() {
            failures += 1;
        }
    }

    failures as f64 / invocations as f64
}

#[tokio::test]
async fn test_zero_rate_is_always_healthy() {
    let injector = seeded_injector(7);

    for _ in 0..500 {
        let response = tokio_test::assert_ok!(injector.handle(env_with_rate("0")).await);
        assert_eq!(response.status_code, 200);

        let body: serde_json::Value = serde_json::from_str(&response.body).unwrap();
        assert_eq!(body["status"], "healthy");
        assert_eq!(body["failure_rate"].as_f64(), Some(0.0));
    }
}

#[tokio::test]
async fn test_unset_rate_is_always_healthy() {
    let injector = seeded_injector(7);

    for _ in 0..100 {
        tokio_test::assert_ok!(injector.handle(|_| None).await);
    }
}

#[tokio::test]
async fn test_full_rate_always_fails() {
    let injector = seeded_injector(7);

    for _ in 0..500 {
        let err = tokio_test::assert_err!(injector.handle(env_with_rate("1")).await);
        assert!(matches!(err, FaultInjectorError::DownstreamTimeout));
    }
}

#[tokio::test]
async fn test_every_failure_pauses_first() {
    let pauses = Arc::new(AtomicUsize::new(0));
    let injector = FaultInjector::builder()
        .entropy(SeededEntropy::new(99))
        .delay(RecordingDelay {
            pauses: Arc::clone(&pauses),
        })
        .build();

    let mut failures = 0;
    for _ in 0..200 {
        if injector.handle(env_with_rate("0.5")).await.is_err() {
            failures += 1;
        }
    }

    assert!(failures > 0);
    assert_eq!(pauses.load(Ordering::SeqCst), failures);
}

#[tokio::test]
async fn test_failure_proportion_converges_to_rate() {
    for (rate, expected) in [("0.1", 0.1), ("0.3", 0.3), ("0.5", 0.5), ("0.9", 0.9)] {
        let observed = failure_proportion(rate, 10_000).await;
        assert!(
            (observed - expected).abs() < 0.03,
            "rate {rate}: observed {observed}"
        );
    }
}

#[tokio::test]
async fn test_malformed_rate_is_not_swallowed() {
    let injector = seeded_injector(1);

    let err = tokio_test::assert_err!(injector.handle(env_with_rate("zero")).await);
    assert_eq!(
        err.to_string(),
        "FAILURE_RATE must be a number between 0 and 1, got \"zero\""
    );
}

#[tokio::test]
async fn test_function_handler_ignores_event_payload() {
    let injector = seeded_injector(3);
    let event = LambdaEvent {
        payload: json!({"source": "aws.events", "detail": {"anything": [1, 2, 3]}}),
        context: Context::default(),
    };

    let response =
        tokio_test::assert_ok!(function_handler(&injector, event, env_with_rate("0")).await);

    let body: serde_json::Value = serde_json::from_str(&response.body).unwrap();
    assert_eq!(body, json!({"status": "healthy", "failure_rate": 0.0}));
}

#[tokio::test]
async fn test_function_handler_surfaces_injected_failure() {
    let injector = seeded_injector(3);
    let event = LambdaEvent {
        payload: json!(null),
        context: Context::default(),
    };

    let err = tokio_test::assert_err!(function_handler(&injector, event, env_with_rate("1")).await);
    assert_eq!(err.to_string(), "Downstream API timeout");
}

#[tokio::test]
async fn test_function_handler_surfaces_malformed_rate() {
    let injector = seeded_injector(3);
    let event = LambdaEvent {
        payload: json!({}),
        context: Context::default(),
    };

    let err = tokio_test::assert_err!(function_handler(&injector, event, env_with_rate("high")).await);
    assert!(err.to_string().starts_with("FAILURE_RATE must be a number"));
}

#[test]
fn test_response_json_structure() {
    let response = Response::ok(&HealthReport::healthy(FailureRate::new(0.2).unwrap())).unwrap();

    let json = serde_json::to_value(&response).unwrap();
    assert_eq!(json["statusCode"], 200);
    assert!(json["body"].is_string());
    assert!(json.get("status_code").is_none());

    let body: serde_json::Value = serde_json::from_str(json["body"].as_str().unwrap()).unwrap();
    assert_eq!(body, json!({"status": "healthy", "failure_rate": 0.2}));
}

#[test]
fn test_config_from_lookup() {
    let config = FaultInjectorConfig::from_lookup(env_with_rate("0.35")).unwrap();
    assert_eq!(config.failure_rate, FailureRate::new(0.35).unwrap());
}

#[cfg(test)]
mod boundary_tests {
    use super::*;

    #[test]
    fn test_rate_bounds_are_inclusive() {
        assert!(FailureRate::new(0.0).is_some());
        assert!(FailureRate::new(1.0).is_some());
        assert!(FailureRate::new(-f64::EPSILON).is_none());
        assert!(FailureRate::new(1.0 + f64::EPSILON).is_none());
        assert!(FailureRate::new(f64::NAN).is_none());
    }

    #[test]
    fn test_scientific_notation_is_accepted() {
        let rate: FailureRate = "5e-1".parse().unwrap();
        assert_eq!(rate.value(), 0.5);
    }
}

// Runs against a deployed function; requires AWS credentials.
#[cfg(test)]
mod integration_tests {
    #[tokio::test]
    #[ignore] // Run with: cargo test -- --ignored
    async fn test_deployed_function_reports_healthy() {
        // Invoke the deployed fault injector with FAILURE_RATE=0 and check the body
    }
}

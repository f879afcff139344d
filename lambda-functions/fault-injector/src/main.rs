use fault_injector::{function_handler, process_env, LiveFaultInjector};
use lambda_runtime::{run, service_fn, Error, LambdaEvent};
use serde_json::Value;

#[tokio::main]
async fn main() -> Result<(), Error> {
    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .json()
        .init();

    let injector = LiveFaultInjector::new();
    let injector = &injector;

    run(service_fn(move |event: LambdaEvent<Value>| async move {
        function_handler(injector, event, process_env).await
    }))
    .await
}

use lambda_runtime::{run, service_fn, Error, LambdaEvent};
use remediator::{function_handler, process_env, LambdaConfigurationStore, Remediator};
use serde_json::Value;

#[tokio::main]
async fn main() -> Result<(), Error> {
    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .json()
        .init();

    // One Lambda client per execution environment, shared by all invocations.
    let remediator = Remediator::new(LambdaConfigurationStore::from_env().await);
    let remediator = &remediator;

    run(service_fn(move |event: LambdaEvent<Value>| async move {
        function_handler(remediator, event, process_env).await
    }))
    .await
}

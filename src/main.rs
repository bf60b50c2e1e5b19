use clap::Parser;
use funcworker::runtime::{
    FunctionRegistry, LogFormat, ObservabilityConfig, ParamType, Worker, WorkerOptions, from_fn, init_logging,
    limits::DEFAULT_MAX_MESSAGE_LENGTH,
};
use funcworker::value::{Record, Value};
use std::process::ExitCode;
use std::time::Instant;

/// Function worker process started by the functions host.
#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
struct Args {
    /// Host address to connect back to
    #[arg(long, env = "FUNCTIONS_WORKER_HOST", default_value = "127.0.0.1")]
    host: String,

    /// Host port to connect back to
    #[arg(long, env = "FUNCTIONS_WORKER_PORT")]
    port: u16,

    /// Worker id announced in the start-stream message
    #[arg(long = "worker-id", env = "FUNCTIONS_WORKER_ID")]
    worker_id: String,

    /// Request id assigned by the host at startup
    #[arg(long = "request-id", env = "FUNCTIONS_REQUEST_ID", default_value = "")]
    request_id: String,

    /// Largest inbound message accepted, in bytes
    #[arg(long = "functions-grpc-max-message-length", default_value_t = DEFAULT_MAX_MESSAGE_LENGTH)]
    max_message_length: usize,

    #[arg(long, value_enum, default_value_t = LogFormat::Compact)]
    log_format: LogFormat,

    #[arg(long, env = "FUNCTIONS_WORKER_LOG_LEVEL", default_value = "info")]
    log_level: String,
}

#[derive(serde::Deserialize)]
struct AddInput {
    a: i64,
    b: i64,
}

#[derive(serde::Serialize)]
struct AddOutput {
    sum: i64,
}

fn sample_functions() -> Result<FunctionRegistry, String> {
    FunctionRegistry::builder()
        .register_sync("Echo", [("message", ParamType::of::<String>())], |_inv, args| {
            Ok(args.get::<String>("message").cloned().map(Value::from))
        })
        .register(
            "Orders.Create",
            [("order", ParamType::of::<serde_json::Value>())],
            |inv, mut args| async move {
                let order = args
                    .take::<serde_json::Value>("order")
                    .ok_or_else(|| anyhow::anyhow!("order payload is required"))?;
                inv.add_trace_attribute("order.id", order["id"].to_string());
                Ok(Some(Value::object(
                    Record::new().with("body", "accepted").with("queue", Value::Json(order)),
                )))
            },
        )
        .register_typed("Math.Add", "input", |_inv, input: AddInput| async move {
            Ok(AddOutput { sum: input.a + input.b })
        })
        .build_result()
}

#[tokio::main]
async fn main() -> ExitCode {
    let args = Args::parse();

    let config = ObservabilityConfig {
        log_format: args.log_format,
        log_level: args.log_level.clone(),
        ..Default::default()
    };
    if let Err(e) = init_logging(&config) {
        eprintln!("funcworker: {e}");
    }
    tracing::info!(worker_id = %args.worker_id, request_id = %args.request_id, "worker starting");

    let registry = match sample_functions() {
        Ok(registry) => registry,
        Err(e) => {
            tracing::error!(error = %e, "function registration failed");
            return ExitCode::FAILURE;
        }
    };

    let worker = Worker::builder(registry)
        .options(WorkerOptions::default())
        .use_middleware(from_fn(|ctx, next| {
            Box::pin(async move {
                let started = Instant::now();
                let result = next.run(ctx).await;
                tracing::debug!(
                    invocation_id = %ctx.invocation_id(),
                    elapsed_ms = started.elapsed().as_millis() as u64,
                    "invocation timing"
                );
                result
            })
        }))
        .build();

    let session =
        funcworker::transport::connect(worker, &args.host, args.port, &args.worker_id, args.max_message_length).await;
    match session {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            tracing::error!(error = %e, "worker session failed");
            ExitCode::FAILURE
        }
    }
}

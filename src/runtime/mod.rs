//! The worker runtime: routes host messages, loads functions and runs
//! invocations through the middleware pipeline.
//!
//! ```rust,no_run
//! use funcworker::runtime::{Worker, WorkerOptions, FunctionRegistry, ParamType};
//! use funcworker::Value;
//! use tokio::sync::mpsc;
//!
//! # async fn demo() {
//! let registry = FunctionRegistry::builder()
//!     .register_sync("Echo", [("message", ParamType::of::<String>())], |_inv, args| {
//!         Ok(args.get::<String>("message").cloned().map(Value::from))
//!     })
//!     .build();
//! let worker = Worker::builder(registry).options(WorkerOptions::default()).build();
//!
//! let (_host_tx, inbound) = mpsc::channel(16);
//! let (outbound, _host_rx) = mpsc::channel(16);
//! worker.run(inbound, outbound).await.unwrap();
//! # }
//! ```

use crate::errors::TransportError;
use crate::protocol::StreamingMessage;
use crate::value::{JsonSerializer, Serializer};
use std::collections::BTreeMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, RwLock};
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::task::JoinSet;
use tokio::time::Instant;

pub mod binding;
pub mod context;
pub mod converters;
pub mod definition;
pub mod execution;
pub mod features;
pub mod limits;
pub mod observability;
pub mod pipeline;
pub mod projection;
pub mod registry;
mod router;

pub use binding::FunctionArguments;
pub use context::{Disposable, FunctionContext, FunctionContextFactory};
pub use converters::{ConversionResult, Converter, ConverterContext, ConverterRegistry};
pub use definition::{FunctionDefinition, FunctionParameter, FunctionStore, ParamType};
pub use execution::{FunctionExecutionMiddleware, InvocationHandler, OutputBindingsMiddleware};
pub use features::{Features, FunctionInvocation, RetryContext};
pub use observability::{LogFormat, MetricsSnapshot, ObservabilityConfig, WorkerMetrics, init_logging};
pub use pipeline::{InvocationPipeline, Middleware, Next, PipelineBuilder, from_fn};
pub use projection::{OutputProjection, RETURN_BINDING_NAME};
pub use registry::{FunctionHandler, FunctionRegistry, FunctionRegistryBuilder};

/// Capabilities this worker always reports. They override any value of the
/// same name in [`WorkerOptions::capabilities`].
pub const REQUIRED_CAPABILITIES: &[&str] = &[
    "RpcHttpBodyOnly",
    "RawHttpBodyBytes",
    "RpcHttpTriggerMetadataRemoved",
    "UseNullableValueDictionaryForHttp",
    "TypedDataCollection",
    "WorkerStatus",
    "HandlesInvocationCancelMessage",
];

/// Configuration options for the Worker.
#[derive(Debug, Clone)]
pub struct WorkerOptions {
    /// Extra capabilities reported in the init response.
    pub capabilities: BTreeMap<String, bool>,
    /// Turns output values into wire payloads.
    pub serializer: Arc<dyn Serializer>,
    /// Converter chain used for model binding.
    pub converters: Arc<ConverterRegistry>,
    /// Report user-code faults as user exceptions with their message verbatim.
    /// Default: true
    pub enable_user_code_exception: bool,
    /// Forward stack traces in failure responses.
    /// Default: true
    pub include_exception_details: bool,
    /// Grace period applied when a terminate request carries none.
    /// Default: 5s
    pub terminate_grace_period: Duration,
}

impl Default for WorkerOptions {
    fn default() -> Self {
        Self {
            capabilities: BTreeMap::new(),
            serializer: Arc::new(JsonSerializer),
            converters: Arc::new(ConverterRegistry::default()),
            enable_user_code_exception: true,
            include_exception_details: true,
            terminate_grace_period: Duration::from_millis(limits::DEFAULT_TERMINATE_GRACE_PERIOD_MS),
        }
    }
}

/// What the host told us about itself.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct HostState {
    pub host_version: String,
    pub capabilities: BTreeMap<String, bool>,
    pub function_app_directory: String,
    pub environment: BTreeMap<String, String>,
}

pub struct Worker {
    options: Arc<WorkerOptions>,
    registry: FunctionRegistry,
    store: Arc<FunctionStore>,
    invocations: Arc<InvocationHandler>,
    metrics: Arc<WorkerMetrics>,
    initialized: AtomicBool,
    accepting: AtomicBool,
    host: RwLock<HostState>,
}

pub struct WorkerBuilder {
    registry: FunctionRegistry,
    options: WorkerOptions,
    pipeline: PipelineBuilder,
}

impl WorkerBuilder {
    pub fn options(mut self, options: WorkerOptions) -> Self {
        self.options = options;
        self
    }

    /// Add a user middleware. User middleware runs before output projection
    /// and function execution, in registration order.
    pub fn use_middleware(mut self, middleware: impl Middleware + 'static) -> Self {
        self.pipeline = self.pipeline.use_middleware(middleware);
        self
    }

    pub fn use_when<P>(mut self, predicate: P, middleware: impl Middleware + 'static) -> Self
    where
        P: Fn(&FunctionContext) -> bool + Send + Sync + 'static,
    {
        self.pipeline = self.pipeline.use_when(predicate, middleware);
        self
    }

    pub fn build(self) -> Arc<Worker> {
        let options = Arc::new(self.options);
        let metrics = Arc::new(WorkerMetrics::new());
        let store = Arc::new(FunctionStore::new());
        let pipeline = self
            .pipeline
            .use_middleware(OutputBindingsMiddleware)
            .use_middleware(FunctionExecutionMiddleware)
            .build();
        let factory = FunctionContextFactory::new(store.clone(), options.converters.clone());
        let invocations = Arc::new(InvocationHandler::new(factory, pipeline, options.clone(), metrics.clone()));

        Arc::new(Worker {
            options,
            registry: self.registry,
            store,
            invocations,
            metrics,
            initialized: AtomicBool::new(false),
            accepting: AtomicBool::new(true),
            host: RwLock::new(HostState::default()),
        })
    }
}

/// Shutdown progress of the read loop.
#[derive(Clone, Copy)]
enum Phase {
    Running,
    /// Terminate received; in-flight invocations may finish until the deadline.
    Draining(Instant),
    /// Grace period over; tokens cancelled, waiting for tasks to unwind.
    Cancelling(Instant),
}

enum Event {
    Message(Option<StreamingMessage>),
    Joined(Result<(), tokio::task::JoinError>),
    Deadline,
}

impl Worker {
    pub fn builder(registry: FunctionRegistry) -> WorkerBuilder {
        WorkerBuilder {
            registry,
            options: WorkerOptions::default(),
            pipeline: PipelineBuilder::new(),
        }
    }

    pub fn options(&self) -> &WorkerOptions {
        &self.options
    }

    pub fn registry(&self) -> &FunctionRegistry {
        &self.registry
    }

    pub fn store(&self) -> &Arc<FunctionStore> {
        &self.store
    }

    pub fn invocations(&self) -> &Arc<InvocationHandler> {
        &self.invocations
    }

    pub fn metrics(&self) -> MetricsSnapshot {
        self.metrics.snapshot()
    }

    pub fn is_initialized(&self) -> bool {
        self.initialized.load(Ordering::SeqCst)
    }

    pub fn is_accepting(&self) -> bool {
        self.accepting.load(Ordering::SeqCst)
    }

    pub fn host_state(&self) -> HostState {
        self.host.read().unwrap_or_else(|poisoned| poisoned.into_inner()).clone()
    }

    /// Process messages until the inbound stream ends or a terminate request
    /// has been fully honoured.
    ///
    /// Requests that complete synchronously are answered before the next
    /// message is read; invocations run concurrently.
    pub async fn run(
        self: Arc<Self>,
        mut inbound: mpsc::Receiver<StreamingMessage>,
        outbound: mpsc::Sender<StreamingMessage>,
    ) -> Result<(), TransportError> {
        let mut tasks: JoinSet<()> = JoinSet::new();
        let mut phase = Phase::Running;
        let mut inbound_open = true;

        loop {
            if !matches!(phase, Phase::Running) && tasks.is_empty() {
                tracing::info!(target: "funcworker::runtime", "all invocations finished; worker exiting");
                break;
            }

            let deadline = match phase {
                Phase::Running => None,
                Phase::Draining(d) | Phase::Cancelling(d) => Some(d),
            };
            let event = tokio::select! {
                msg = inbound.recv(), if inbound_open => Event::Message(msg),
                Some(joined) = tasks.join_next(), if !tasks.is_empty() => Event::Joined(joined),
                _ = sleep_until_opt(deadline) => Event::Deadline,
            };

            match event {
                Event::Message(Some(message)) => {
                    if let Some(grace) = self.route(message, &outbound, &mut tasks).await?
                        && matches!(phase, Phase::Running)
                    {
                        self.accepting.store(false, Ordering::SeqCst);
                        tracing::info!(
                            target: "funcworker::runtime",
                            grace_period_ms = grace.as_millis() as u64,
                            in_flight = tasks.len(),
                            "terminate requested; draining invocations"
                        );
                        phase = Phase::Draining(Instant::now() + grace);
                    }
                }
                Event::Message(None) => {
                    tracing::info!(target: "funcworker::runtime", in_flight = tasks.len(), "inbound stream closed");
                    inbound_open = false;
                    if matches!(phase, Phase::Running) {
                        break;
                    }
                }
                Event::Joined(result) => log_join(result),
                Event::Deadline => match phase {
                    Phase::Draining(_) => {
                        let cancelled = self.invocations.cancel_all();
                        tracing::warn!(
                            target: "funcworker::runtime",
                            cancelled,
                            "grace period elapsed; cancelling remaining invocations"
                        );
                        let drain = Duration::from_millis(limits::CANCELLED_DRAIN_TIMEOUT_MS);
                        phase = Phase::Cancelling(Instant::now() + drain);
                    }
                    Phase::Cancelling(_) => {
                        tracing::error!(
                            target: "funcworker::runtime",
                            remaining = tasks.len(),
                            "invocations ignored cancellation; aborting"
                        );
                        tasks.abort_all();
                        break;
                    }
                    Phase::Running => {}
                },
            }
        }

        self.accepting.store(false, Ordering::SeqCst);
        if !tasks.is_empty() {
            self.invocations.cancel_all();
            let drain = async {
                while let Some(result) = tasks.join_next().await {
                    log_join(result);
                }
            };
            if tokio::time::timeout(Duration::from_millis(limits::CANCELLED_DRAIN_TIMEOUT_MS), drain)
                .await
                .is_err()
            {
                tasks.abort_all();
            }
        }
        Ok(())
    }
}

async fn sleep_until_opt(deadline: Option<Instant>) {
    match deadline {
        Some(deadline) => tokio::time::sleep_until(deadline).await,
        None => std::future::pending::<()>().await,
    }
}

fn log_join(result: Result<(), tokio::task::JoinError>) {
    if let Err(e) = result
        && !e.is_cancelled()
    {
        tracing::error!(target: "funcworker::runtime", error = %e, "invocation task failed");
    }
}

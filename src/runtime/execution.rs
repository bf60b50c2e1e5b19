//! Function execution, output projection and response assembly.

use super::context::{FunctionContext, FunctionContextFactory};
use super::limits::RESERVED_TRACE_ATTRIBUTES;
use super::observability::WorkerMetrics;
use super::pipeline::{InvocationPipeline, Middleware, Next};
use super::WorkerOptions;
use crate::errors::{FunctionFault, InvocationError};
use crate::protocol::{InvocationRequest, InvocationResponse, ParameterBinding, RpcTraceContext, Status, StatusResult};
use crate::value::Serializer;
use async_trait::async_trait;
use futures::FutureExt;
use std::collections::{BTreeMap, HashMap};
use std::panic::AssertUnwindSafe;
use std::sync::{Arc, Mutex};
use tokio_util::sync::CancellationToken;

/// Projects the return value onto output bindings once the rest of the
/// chain has completed successfully.
#[derive(Debug, Default)]
pub struct OutputBindingsMiddleware;

#[async_trait]
impl Middleware for OutputBindingsMiddleware {
    async fn invoke(&self, ctx: &mut FunctionContext, next: Next) -> Result<(), InvocationError> {
        next.run(ctx).await?;
        ctx.apply_output_projection();
        Ok(())
    }
}

/// Terminal component: binds input, runs user code and records its result.
#[derive(Debug, Default)]
pub struct FunctionExecutionMiddleware;

#[async_trait]
impl Middleware for FunctionExecutionMiddleware {
    async fn invoke(&self, ctx: &mut FunctionContext, _next: Next) -> Result<(), InvocationError> {
        let args = ctx.bind_input().await?;
        ctx.checkpoint()?;

        let invocation = ctx.invocation()?.clone();
        let handler = ctx.definition().handler.clone();
        crate::invocation_debug!(ctx, "executing function");

        let outcome = AssertUnwindSafe(handler.invoke(invocation.clone(), args)).catch_unwind().await;
        for (name, value) in invocation.take_outputs() {
            ctx.set_output(name, value);
        }

        match outcome {
            Ok(Ok(result)) => {
                ctx.set_result(result);
                Ok(())
            }
            // user code bailing out after cancellation counts as cancelled
            Ok(Err(_)) if ctx.is_cancelled() => Err(InvocationError::Cancelled(ctx.invocation_id().to_string())),
            Ok(Err(e)) => Err(FunctionFault::from_anyhow(&e).into()),
            Err(panic) => Err(FunctionFault::from_panic(panic).into()),
        }
    }
}

/// Runs invocations end to end and owns the cancellation tokens of the
/// ones in flight.
pub struct InvocationHandler {
    factory: FunctionContextFactory,
    pipeline: InvocationPipeline,
    options: Arc<WorkerOptions>,
    metrics: Arc<WorkerMetrics>,
    in_flight: Mutex<HashMap<String, CancellationToken>>,
}

impl InvocationHandler {
    pub fn new(
        factory: FunctionContextFactory,
        pipeline: InvocationPipeline,
        options: Arc<WorkerOptions>,
        metrics: Arc<WorkerMetrics>,
    ) -> Self {
        Self {
            factory,
            pipeline,
            options,
            metrics,
            in_flight: Mutex::new(HashMap::new()),
        }
    }

    /// Run one invocation. Always produces a response; failures are encoded
    /// in its status.
    pub async fn invoke(&self, request: InvocationRequest) -> InvocationResponse {
        let invocation_id = request.invocation_id.clone();
        let cancellation = CancellationToken::new();
        if !self.track(&invocation_id, cancellation.clone()) {
            let err = InvocationError::DuplicateInvocation(invocation_id.clone());
            tracing::warn!(invocation_id = %invocation_id, "duplicate invocation id; rejecting");
            return InvocationResponse::failed(invocation_id, self.failure_status(&err));
        }
        self.metrics.record_invocation_start();

        let response = match self.factory.create(request, cancellation.clone()) {
            Ok(ctx) => self.run(ctx).await,
            Err(err) => {
                tracing::warn!(invocation_id = %invocation_id, error = %err, "cannot create invocation context");
                InvocationResponse::failed(invocation_id.clone(), self.failure_status(&err))
            }
        };

        self.untrack(&invocation_id);
        match response.result.status {
            Status::Success => self.metrics.record_invocation_success(),
            Status::Failure => self.metrics.record_invocation_failure(),
            Status::Cancelled => self.metrics.record_invocation_cancelled(),
        }
        response
    }

    async fn run(&self, mut ctx: FunctionContext) -> InvocationResponse {
        crate::invocation_debug!(ctx, "invocation started");
        let outcome = AssertUnwindSafe(self.pipeline.invoke(&mut ctx))
            .catch_unwind()
            .await
            .unwrap_or_else(|panic| Err(FunctionFault::from_panic(panic).into()));

        let mut response = match outcome.and_then(|()| self.assemble(&mut ctx)) {
            Ok(response) => response,
            Err(err) => {
                if err.is_cancellation() {
                    crate::invocation_info!(ctx, "invocation cancelled");
                } else if err.type_name() == "Panic" {
                    crate::invocation_error!(ctx, error = %err, "function panicked");
                } else {
                    crate::invocation_warn!(ctx, error = %err, kind = %err.type_name(), "invocation failed");
                }
                InvocationResponse::failed(ctx.invocation_id(), self.failure_status(&err))
            }
        };
        response.trace_context = Some(self.response_trace(&ctx));

        let dispose_failures = ctx.dispose();
        if dispose_failures > 0 {
            self.metrics.record_dispose_failures(dispose_failures);
        }
        response
    }

    /// Serialize outputs and the residual result. Nothing is emitted unless
    /// every value serializes.
    fn assemble(&self, ctx: &mut FunctionContext) -> Result<InvocationResponse, InvocationError> {
        let serializer: &dyn Serializer = self.options.serializer.as_ref();
        let (result, outputs) = ctx.take_result_and_outputs();

        let mut output_data = Vec::with_capacity(outputs.len());
        for (name, value) in outputs {
            let data = serializer
                .serialize(&value)
                .map_err(|source| InvocationError::Serialization { name: name.clone(), source })?;
            output_data.push(ParameterBinding::new(name, data));
        }
        let return_value = match result {
            Some(value) => serializer
                .serialize(&value)
                .map_err(|source| InvocationError::Serialization {
                    name: super::projection::RETURN_BINDING_NAME.to_string(),
                    source,
                })?,
            None => None,
        };

        crate::invocation_info!(ctx, outputs = output_data.len(), "invocation succeeded");
        Ok(InvocationResponse {
            invocation_id: ctx.invocation_id().to_string(),
            output_data,
            return_value,
            result: StatusResult::success(),
            trace_context: None,
        })
    }

    fn failure_status(&self, err: &InvocationError) -> StatusResult {
        let exception = err.to_rpc_exception(
            self.options.include_exception_details,
            self.options.enable_user_code_exception,
        );
        if err.is_cancellation() {
            StatusResult::cancelled(Some(exception))
        } else {
            StatusResult::failure(exception)
        }
    }

    fn response_trace(&self, ctx: &FunctionContext) -> RpcTraceContext {
        let request = ctx.trace_context();
        let mut attributes: BTreeMap<String, String> = request.attributes.clone();
        if let Ok(invocation) = ctx.invocation() {
            for (k, v) in invocation.trace_attributes() {
                if !RESERVED_TRACE_ATTRIBUTES.contains(&k.as_str()) {
                    attributes.insert(k, v);
                }
            }
        }
        RpcTraceContext {
            trace_parent: request.trace_parent.clone(),
            trace_state: request.trace_state.clone(),
            attributes,
        }
    }

    /// Signal cancellation for an in-flight invocation. Returns false when
    /// the id is unknown (already finished or never started).
    pub fn cancel(&self, invocation_id: &str) -> bool {
        match self.lock().get(invocation_id) {
            Some(token) => {
                token.cancel();
                true
            }
            None => false,
        }
    }

    /// Signal cancellation for every in-flight invocation.
    pub fn cancel_all(&self) -> usize {
        let map = self.lock();
        for token in map.values() {
            token.cancel();
        }
        map.len()
    }

    pub fn in_flight(&self) -> usize {
        self.lock().len()
    }

    fn track(&self, invocation_id: &str, token: CancellationToken) -> bool {
        let mut map = self.lock();
        if map.contains_key(invocation_id) {
            return false;
        }
        map.insert(invocation_id.to_string(), token);
        true
    }

    fn untrack(&self, invocation_id: &str) {
        self.lock().remove(invocation_id);
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, HashMap<String, CancellationToken>> {
        self.in_flight.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

//! Per-invocation context and the factory that creates it.

use super::converters::ConverterRegistry;
use super::definition::{FunctionDefinition, FunctionStore};
use super::features::{Features, FunctionInvocation, InvocationRetryContext, RetryContext};
use crate::errors::InvocationError;
use crate::protocol::{InvocationRequest, RpcTraceContext, TypedData};
use crate::value::Value;
use std::any::Any;
use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;
use tokio_util::sync::CancellationToken;

/// A resource released when the invocation ends, whatever its outcome.
pub trait Disposable: Send + Sync {
    fn dispose(self: Box<Self>) -> anyhow::Result<()>;
}

impl<F> Disposable for F
where
    F: FnOnce() -> anyhow::Result<()> + Send + Sync,
{
    fn dispose(self: Box<Self>) -> anyhow::Result<()> {
        (*self)()
    }
}

/// State of one invocation, owned by the task running it.
pub struct FunctionContext {
    invocation_id: String,
    definition: Arc<FunctionDefinition>,
    trace_context: RpcTraceContext,
    cancellation: CancellationToken,
    pub(crate) input_data: HashMap<String, Option<TypedData>>,
    pub(crate) trigger_metadata: BTreeMap<String, TypedData>,
    pub(crate) converters: Arc<ConverterRegistry>,
    result: Option<Value>,
    outputs: BTreeMap<String, Value>,
    items: HashMap<String, Box<dyn Any + Send + Sync>>,
    features: Features,
    pub(crate) bound: bool,
    disposables: Vec<Box<dyn Disposable>>,
}

impl std::fmt::Debug for FunctionContext {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("FunctionContext")
            .field("invocation_id", &self.invocation_id)
            .field("function_id", &self.definition.id)
            .field("function_name", &self.definition.name)
            .field("bound", &self.bound)
            .field("outputs", &self.outputs.keys().collect::<Vec<_>>())
            .finish_non_exhaustive()
    }
}

impl FunctionContext {
    pub fn invocation_id(&self) -> &str {
        &self.invocation_id
    }

    pub fn function_id(&self) -> &str {
        &self.definition.id
    }

    pub fn function_name(&self) -> &str {
        &self.definition.name
    }

    pub fn definition(&self) -> &Arc<FunctionDefinition> {
        &self.definition
    }

    pub fn trace_context(&self) -> &RpcTraceContext {
        &self.trace_context
    }

    pub fn cancellation_token(&self) -> &CancellationToken {
        &self.cancellation
    }

    pub fn is_cancelled(&self) -> bool {
        self.cancellation.is_cancelled()
    }

    /// Cancellation checkpoint.
    pub fn checkpoint(&self) -> Result<(), InvocationError> {
        if self.cancellation.is_cancelled() {
            Err(InvocationError::Cancelled(self.invocation_id.clone()))
        } else {
            Ok(())
        }
    }

    /// Raw input payload for a parameter: input data first, then trigger
    /// metadata. Names match case-insensitively. An input entry with no data
    /// is a present-but-null source.
    pub fn binding_source(&self, name: &str) -> Option<&TypedData> {
        if let Some(entry) = lookup(&self.input_data, name) {
            return entry.as_ref();
        }
        self.trigger_metadata
            .get(name)
            .or_else(|| {
                self.trigger_metadata
                    .iter()
                    .find(|(k, _)| k.eq_ignore_ascii_case(name))
                    .map(|(_, v)| v)
            })
    }

    pub fn trigger_metadata(&self) -> &BTreeMap<String, TypedData> {
        &self.trigger_metadata
    }

    pub fn result(&self) -> Option<&Value> {
        self.result.as_ref()
    }

    pub fn set_result(&mut self, result: Option<Value>) {
        self.result = result;
    }

    pub fn outputs(&self) -> &BTreeMap<String, Value> {
        &self.outputs
    }

    pub fn set_output(&mut self, name: impl Into<String>, value: impl Into<Value>) {
        self.outputs.insert(name.into(), value.into());
    }

    /// Apply the definition's output projection to the current result.
    pub fn apply_output_projection(&mut self) {
        let projection = &self.definition.projection;
        projection.apply(&mut self.result, &mut self.outputs);
    }

    pub(crate) fn take_result_and_outputs(&mut self) -> (Option<Value>, BTreeMap<String, Value>) {
        (self.result.take(), std::mem::take(&mut self.outputs))
    }

    /// Free-form, invocation-scoped storage shared by middleware.
    pub fn items(&self) -> &HashMap<String, Box<dyn Any + Send + Sync>> {
        &self.items
    }

    pub fn items_mut(&mut self) -> &mut HashMap<String, Box<dyn Any + Send + Sync>> {
        &mut self.items
    }

    pub fn features(&self) -> &Features {
        &self.features
    }

    pub fn features_mut(&mut self) -> &mut Features {
        &mut self.features
    }

    /// Handle given to user code. Always present on a context built by the
    /// factory.
    pub fn invocation(&self) -> Result<&FunctionInvocation, InvocationError> {
        self.features.require::<FunctionInvocation>()
    }

    pub fn retry_context(&self) -> Option<&Arc<dyn RetryContext>> {
        self.features.get::<Arc<dyn RetryContext>>()
    }

    pub fn register_disposable(&mut self, resource: impl Disposable + 'static) {
        self.disposables.push(Box::new(resource));
    }

    /// Release every registered resource in reverse registration order.
    /// Failures are logged and counted, never propagated.
    pub fn dispose(mut self) -> usize {
        let mut failures = 0;
        while let Some(resource) = self.disposables.pop() {
            if let Err(e) = resource.dispose() {
                failures += 1;
                crate::invocation_warn!(self, error = %e, "failed to dispose invocation resource");
            }
        }
        failures
    }
}

fn lookup<'a, V>(map: &'a HashMap<String, V>, name: &str) -> Option<&'a V> {
    map.get(name)
        .or_else(|| map.iter().find(|(k, _)| k.eq_ignore_ascii_case(name)).map(|(_, v)| v))
}

/// Builds contexts for invocation requests against the loaded functions.
#[derive(Debug, Clone)]
pub struct FunctionContextFactory {
    store: Arc<FunctionStore>,
    converters: Arc<ConverterRegistry>,
}

impl FunctionContextFactory {
    pub fn new(store: Arc<FunctionStore>, converters: Arc<ConverterRegistry>) -> Self {
        Self { store, converters }
    }

    /// Fails without building anything when the function id is unknown.
    pub fn create(
        &self,
        request: InvocationRequest,
        cancellation: CancellationToken,
    ) -> Result<FunctionContext, InvocationError> {
        let definition = self
            .store
            .get(&request.function_id)
            .ok_or_else(|| InvocationError::UnknownFunction(request.function_id.clone()))?;

        let mut features = Features::new();
        features.set(FunctionInvocation::new(
            request.invocation_id.clone(),
            definition.id.clone(),
            definition.name.clone(),
            cancellation.clone(),
        ))?;
        let retry = match (&request.retry_context, &definition.retry) {
            (Some(ctx), _) => Some(InvocationRetryContext::from(ctx)),
            (None, Some(options)) => Some(InvocationRetryContext::from(&crate::protocol::RetryContext {
                retry_count: 0,
                max_retry_count: options.max_retry_count,
                exception: None,
            })),
            (None, None) => None,
        };
        if let Some(retry) = retry {
            features.set::<Arc<dyn RetryContext>>(Arc::new(retry))?;
        }

        let input_data = request
            .input_data
            .into_iter()
            .map(|binding| (binding.name, binding.data))
            .collect();

        Ok(FunctionContext {
            invocation_id: request.invocation_id,
            definition,
            trace_context: request.trace_context,
            cancellation,
            input_data,
            trigger_metadata: request.trigger_metadata,
            converters: self.converters.clone(),
            result: None,
            outputs: BTreeMap::new(),
            items: HashMap::new(),
            features,
            bound: false,
            disposables: Vec::new(),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::{FunctionLoadRequest, ParameterBinding, RetryOptions, RetryStrategy, RpcFunctionMetadata};
    use crate::runtime::definition::ParamType;
    use crate::runtime::registry::FunctionRegistry;
    use std::sync::Mutex;

    fn factory() -> FunctionContextFactory {
        factory_with_retry(None)
    }

    fn factory_with_retry(retry: Option<RetryOptions>) -> FunctionContextFactory {
        let registry = FunctionRegistry::builder()
            .register_sync("Echo", [("name", ParamType::of::<String>())], |_inv, _args| Ok(None))
            .build();
        let store = Arc::new(FunctionStore::new());
        let request = FunctionLoadRequest {
            function_id: "f1".into(),
            metadata: RpcFunctionMetadata {
                name: "Echo".into(),
                entry_point: "Echo".into(),
                retry_options: retry,
                ..Default::default()
            },
        };
        store
            .insert(FunctionDefinition::from_load_request(&request, &registry).unwrap())
            .unwrap();
        FunctionContextFactory::new(store, Arc::new(ConverterRegistry::default()))
    }

    fn request(function_id: &str) -> InvocationRequest {
        InvocationRequest {
            invocation_id: "inv-1".into(),
            function_id: function_id.into(),
            input_data: vec![
                ParameterBinding::new("Name", Some(TypedData::String("from-input".into()))),
                ParameterBinding::new("empty", None),
            ],
            trigger_metadata: BTreeMap::from([
                ("name".to_string(), TypedData::String("from-metadata".into())),
                ("Sys".to_string(), TypedData::Json("{}".into())),
            ]),
            ..Default::default()
        }
    }

    #[test]
    fn unknown_function_creates_no_context() {
        let err = factory().create(request("missing"), CancellationToken::new()).unwrap_err();
        assert!(matches!(err, InvocationError::UnknownFunction(id) if id == "missing"));
    }

    #[test]
    fn sources_prefer_input_data_and_ignore_case() {
        let ctx = factory().create(request("f1"), CancellationToken::new()).unwrap();
        assert_eq!(ctx.binding_source("name"), Some(&TypedData::String("from-input".into())));
        assert_eq!(ctx.binding_source("sys"), Some(&TypedData::Json("{}".into())));
        assert_eq!(ctx.binding_source("empty"), None);
        assert_eq!(ctx.binding_source("absent"), None);
    }

    #[test]
    fn invocation_feature_is_seeded() {
        let ctx = factory().create(request("f1"), CancellationToken::new()).unwrap();
        let inv = ctx.invocation().unwrap();
        assert_eq!(inv.invocation_id(), "inv-1");
        assert_eq!(inv.function_name(), "Echo");
        assert!(ctx.retry_context().is_none());
    }

    #[test]
    fn retry_context_falls_back_to_declared_policy() {
        let policy = RetryOptions {
            max_retry_count: 4,
            strategy: RetryStrategy::FixedDelay { delay_interval_ms: 100 },
        };
        let ctx = factory_with_retry(Some(policy))
            .create(request("f1"), CancellationToken::new())
            .unwrap();
        let retry = ctx.retry_context().expect("declared policy seeds a retry context");
        assert_eq!(retry.retry_count(), 0);
        assert_eq!(retry.max_retry_count(), 4);

        let mut req = request("f1");
        req.retry_context = Some(crate::protocol::RetryContext {
            retry_count: 2,
            max_retry_count: 5,
            exception: None,
        });
        let ctx = factory_with_retry(Some(policy)).create(req, CancellationToken::new()).unwrap();
        let retry = ctx.retry_context().unwrap();
        assert_eq!(retry.retry_count(), 2);
        assert_eq!(retry.max_retry_count(), 5);
    }

    #[test]
    fn dispose_runs_in_reverse_and_counts_failures() {
        let order = Arc::new(Mutex::new(Vec::new()));
        let mut ctx = factory().create(request("f1"), CancellationToken::new()).unwrap();
        for i in 0..3 {
            let order = order.clone();
            ctx.register_disposable(move || {
                order.lock().unwrap().push(i);
                if i == 1 { Err(anyhow::anyhow!("close failed")) } else { Ok(()) }
            });
        }
        assert_eq!(ctx.dispose(), 1);
        assert_eq!(*order.lock().unwrap(), vec![2, 1, 0]);
    }

    #[test]
    fn checkpoint_reports_cancellation() {
        let token = CancellationToken::new();
        let ctx = factory().create(request("f1"), token.clone()).unwrap();
        assert!(ctx.checkpoint().is_ok());
        token.cancel();
        assert!(matches!(ctx.checkpoint(), Err(InvocationError::Cancelled(_))));
    }
}

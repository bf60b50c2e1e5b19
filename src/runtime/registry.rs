//! Registry of function entry points known to this worker.
//!
//! User code is registered by entry point before the worker starts. A
//! function load request names an entry point; the loaded definition then
//! points at the registered handler. Registration errors (duplicates) are
//! collected and reported by [`FunctionRegistryBuilder::build_result`].

use super::binding::FunctionArguments;
use super::definition::ParamType;
use super::features::FunctionInvocation;
use crate::protocol::RpcFunctionMetadata;
use crate::value::Value;
use async_trait::async_trait;
use serde::Serialize;
use serde::de::DeserializeOwned;
use std::collections::HashMap;
use std::future::Future;
use std::sync::Arc;

/// Trait implemented by user functions that the worker can invoke.
#[async_trait]
pub trait FunctionHandler: Send + Sync {
    async fn invoke(&self, invocation: FunctionInvocation, args: FunctionArguments) -> anyhow::Result<Option<Value>>;
}

/// Function wrapper that implements `FunctionHandler`.
pub struct FnFunction<F, Fut>(pub F)
where
    F: Fn(FunctionInvocation, FunctionArguments) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = anyhow::Result<Option<Value>>> + Send + 'static;

#[async_trait]
impl<F, Fut> FunctionHandler for FnFunction<F, Fut>
where
    F: Fn(FunctionInvocation, FunctionArguments) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = anyhow::Result<Option<Value>>> + Send + 'static,
{
    async fn invoke(&self, invocation: FunctionInvocation, args: FunctionArguments) -> anyhow::Result<Option<Value>> {
        (self.0)(invocation, args).await
    }
}

/// A registered entry point.
pub struct RegisteredFunction {
    pub entry_point: String,
    /// Declared parameters in call order.
    pub parameters: Vec<(String, ParamType)>,
    pub(crate) handler: Arc<dyn FunctionHandler>,
    /// Metadata reported when the host asks the worker to index functions.
    pub metadata: Option<RpcFunctionMetadata>,
}

#[derive(Clone, Default)]
pub struct FunctionRegistry {
    inner: Arc<HashMap<String, Arc<RegisteredFunction>>>,
}

pub struct FunctionRegistryBuilder {
    map: HashMap<String, Arc<RegisteredFunction>>,
    errors: Vec<String>,
}

impl FunctionRegistry {
    pub fn builder() -> FunctionRegistryBuilder {
        FunctionRegistryBuilder {
            map: HashMap::new(),
            errors: Vec::new(),
        }
    }

    pub fn builder_from(reg: &FunctionRegistry) -> FunctionRegistryBuilder {
        FunctionRegistryBuilder {
            map: reg.inner.as_ref().clone(),
            errors: Vec::new(),
        }
    }

    pub fn resolve(&self, entry_point: &str) -> Option<Arc<RegisteredFunction>> {
        let result = self.inner.get(entry_point).cloned();
        if result.is_none() {
            self.log_registry_miss(entry_point);
        }
        result
    }

    /// List all registered entry points
    pub fn list_entry_points(&self) -> Vec<String> {
        let mut names: Vec<String> = self.inner.keys().cloned().collect();
        names.sort();
        names
    }

    pub fn has(&self, entry_point: &str) -> bool {
        self.inner.contains_key(entry_point)
    }

    pub fn count(&self) -> usize {
        self.inner.len()
    }

    /// Metadata of every entry point that describes itself, sorted by name.
    pub fn metadata(&self) -> Vec<RpcFunctionMetadata> {
        let mut all: Vec<RpcFunctionMetadata> = self.inner.values().filter_map(|f| f.metadata.clone()).collect();
        all.sort_by(|a, b| a.name.cmp(&b.name));
        all
    }

    fn log_registry_miss(&self, entry_point: &str) {
        tracing::debug!(
            target: "funcworker::runtime::registry",
            requested_entry_point = %entry_point,
            registered_count = self.inner.len(),
            registered_entry_points = ?self.list_entry_points(),
            "Registry lookup miss"
        );
    }
}

impl FunctionRegistryBuilder {
    pub fn build(self) -> FunctionRegistry {
        FunctionRegistry {
            inner: Arc::new(self.map),
        }
    }

    /// Build the registry, returning an error if there were any registration errors.
    ///
    /// # Errors
    ///
    /// Returns an error string containing all registration errors if any handlers failed to register.
    pub fn build_result(self) -> Result<FunctionRegistry, String> {
        if self.errors.is_empty() {
            Ok(self.build())
        } else {
            Err(self.errors.join("; "))
        }
    }

    pub fn merge(mut self, other: FunctionRegistry) -> Self {
        for (name, registered) in other.inner.iter() {
            if self.map.contains_key(name) {
                self.errors.push(format!("duplicate function in merge: {name}"));
            } else {
                self.map.insert(name.clone(), registered.clone());
            }
        }
        self
    }

    /// Register an async handler.
    pub fn register<P, S, F, Fut>(self, entry_point: impl Into<String>, parameters: P, f: F) -> Self
    where
        P: IntoIterator<Item = (S, ParamType)>,
        S: Into<String>,
        F: Fn(FunctionInvocation, FunctionArguments) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = anyhow::Result<Option<Value>>> + Send + 'static,
    {
        self.insert(entry_point.into(), parameters, Arc::new(FnFunction(f)))
    }

    /// Register a handler that completes without awaiting anything.
    pub fn register_sync<P, S, F>(self, entry_point: impl Into<String>, parameters: P, f: F) -> Self
    where
        P: IntoIterator<Item = (S, ParamType)>,
        S: Into<String>,
        F: Fn(FunctionInvocation, FunctionArguments) -> anyhow::Result<Option<Value>> + Send + Sync + 'static,
    {
        let wrapper = move |inv: FunctionInvocation, args: FunctionArguments| std::future::ready(f(inv, args));
        self.insert(entry_point.into(), parameters, Arc::new(FnFunction(wrapper)))
    }

    /// Register a handler with one JSON-decoded input and a serializable output.
    pub fn register_typed<In, Out, F, Fut>(
        self,
        entry_point: impl Into<String>,
        parameter: impl Into<String>,
        f: F,
    ) -> Self
    where
        In: DeserializeOwned + Send + 'static,
        Out: Serialize + Send + 'static,
        F: Fn(FunctionInvocation, In) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = anyhow::Result<Out>> + Send + 'static,
    {
        let parameter = parameter.into();
        let f_clone = Arc::new(f);
        let param_name = parameter.clone();
        let wrapper = move |inv: FunctionInvocation, mut args: FunctionArguments| {
            let f_inner = f_clone.clone();
            let input = args.take::<In>(&param_name);
            let param_name = param_name.clone();
            async move {
                let input = input.ok_or_else(|| anyhow::anyhow!("input parameter '{param_name}' has no value"))?;
                let out: Out = (f_inner)(inv, input).await?;
                Ok::<_, anyhow::Error>(Some(Value::json(&out)?))
            }
        };
        self.insert(entry_point.into(), [(parameter, ParamType::json::<In>())], Arc::new(FnFunction(wrapper)))
    }

    /// Attach indexing metadata to an already registered entry point.
    pub fn describe(mut self, entry_point: &str, metadata: RpcFunctionMetadata) -> Self {
        match self.map.get(entry_point) {
            Some(existing) => {
                let updated = RegisteredFunction {
                    entry_point: existing.entry_point.clone(),
                    parameters: existing.parameters.clone(),
                    handler: existing.handler.clone(),
                    metadata: Some(metadata),
                };
                self.map.insert(entry_point.to_string(), Arc::new(updated));
            }
            None => self
                .errors
                .push(format!("cannot describe unregistered function: {entry_point}")),
        }
        self
    }

    fn insert<P, S>(mut self, entry_point: String, parameters: P, handler: Arc<dyn FunctionHandler>) -> Self
    where
        P: IntoIterator<Item = (S, ParamType)>,
        S: Into<String>,
    {
        if self.check_duplicate(&entry_point) {
            return self;
        }
        let parameters = parameters.into_iter().map(|(name, ty)| (name.into(), ty)).collect();
        self.map.insert(
            entry_point.clone(),
            Arc::new(RegisteredFunction {
                entry_point,
                parameters,
                handler,
                metadata: None,
            }),
        );
        self
    }

    fn check_duplicate(&mut self, entry_point: &str) -> bool {
        if self.map.contains_key(entry_point) {
            self.errors.push(format!("duplicate function registration: {entry_point}"));
            true
        } else {
            false
        }
    }
}

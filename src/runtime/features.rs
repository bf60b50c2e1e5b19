//! Type-keyed feature bag attached to each invocation.
//!
//! A feature is any `Send + Sync` value looked up by its type. Each type can
//! be set once per invocation; a second insert is rejected so that two
//! components cannot silently replace each other's capability.

use crate::errors::InvocationError;
use crate::protocol;
use crate::value::Value;
use std::any::{Any, TypeId, type_name};
use std::collections::{BTreeMap, HashMap};
use std::sync::{Arc, Mutex};
use tokio_util::sync::CancellationToken;

#[derive(Default)]
pub struct Features {
    map: HashMap<TypeId, Box<dyn Any + Send + Sync>>,
}

impl Features {
    pub fn new() -> Self {
        Self::default()
    }

    /// Install a feature. Fails if a feature of the same type is present.
    pub fn set<T: Any + Send + Sync>(&mut self, feature: T) -> Result<(), InvocationError> {
        let key = TypeId::of::<T>();
        if self.map.contains_key(&key) {
            return Err(InvocationError::FeatureAlreadySet(type_name::<T>()));
        }
        self.map.insert(key, Box::new(feature));
        Ok(())
    }

    pub fn get<T: Any + Send + Sync>(&self) -> Option<&T> {
        self.map.get(&TypeId::of::<T>()).and_then(|f| f.downcast_ref::<T>())
    }

    pub fn get_mut<T: Any + Send + Sync>(&mut self) -> Option<&mut T> {
        self.map.get_mut(&TypeId::of::<T>()).and_then(|f| f.downcast_mut::<T>())
    }

    /// Like [`Features::get`] but reports the missing type as an error.
    pub fn require<T: Any + Send + Sync>(&self) -> Result<&T, InvocationError> {
        self.get::<T>().ok_or(InvocationError::MissingFeature(type_name::<T>()))
    }

    pub fn contains<T: Any + Send + Sync>(&self) -> bool {
        self.map.contains_key(&TypeId::of::<T>())
    }

    pub fn len(&self) -> usize {
        self.map.len()
    }

    pub fn is_empty(&self) -> bool {
        self.map.is_empty()
    }
}

impl std::fmt::Debug for Features {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Features").field("count", &self.map.len()).finish()
    }
}

/// Retry state of the current attempt.
pub trait RetryContext: Send + Sync {
    /// Zero on the first attempt.
    fn retry_count(&self) -> u32;

    /// Negative means "retry forever".
    fn max_retry_count(&self) -> i32;
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct InvocationRetryContext {
    retry_count: u32,
    max_retry_count: i32,
}

impl From<&protocol::RetryContext> for InvocationRetryContext {
    fn from(ctx: &protocol::RetryContext) -> Self {
        Self {
            retry_count: ctx.retry_count,
            max_retry_count: ctx.max_retry_count,
        }
    }
}

impl RetryContext for InvocationRetryContext {
    fn retry_count(&self) -> u32 {
        self.retry_count
    }

    fn max_retry_count(&self) -> i32 {
        self.max_retry_count
    }
}

#[derive(Debug, Default)]
struct InvocationSink {
    outputs: BTreeMap<String, Value>,
    trace_attributes: BTreeMap<String, String>,
}

/// Owned handle to the running invocation, handed to user code.
///
/// Clones share the same output side channel, which the worker drains once
/// the function returns.
#[derive(Debug, Clone)]
pub struct FunctionInvocation {
    invocation_id: String,
    function_id: String,
    function_name: String,
    cancellation: CancellationToken,
    sink: Arc<Mutex<InvocationSink>>,
}

impl FunctionInvocation {
    pub(crate) fn new(
        invocation_id: impl Into<String>,
        function_id: impl Into<String>,
        function_name: impl Into<String>,
        cancellation: CancellationToken,
    ) -> Self {
        Self {
            invocation_id: invocation_id.into(),
            function_id: function_id.into(),
            function_name: function_name.into(),
            cancellation,
            sink: Arc::new(Mutex::new(InvocationSink::default())),
        }
    }

    pub fn invocation_id(&self) -> &str {
        &self.invocation_id
    }

    pub fn function_id(&self) -> &str {
        &self.function_id
    }

    pub fn function_name(&self) -> &str {
        &self.function_name
    }

    pub fn cancellation_token(&self) -> &CancellationToken {
        &self.cancellation
    }

    pub fn is_cancelled(&self) -> bool {
        self.cancellation.is_cancelled()
    }

    /// Write an output binding value directly. Projection of the return
    /// value wins over a value set here under the same name.
    pub fn set_output(&self, name: impl Into<String>, value: impl Into<Value>) {
        self.sink().outputs.insert(name.into(), value.into());
    }

    /// Tag the invocation's trace. Reserved attribute names are ignored when
    /// the response is assembled.
    pub fn add_trace_attribute(&self, key: impl Into<String>, value: impl Into<String>) {
        self.sink().trace_attributes.insert(key.into(), value.into());
    }

    pub(crate) fn take_outputs(&self) -> BTreeMap<String, Value> {
        std::mem::take(&mut self.sink().outputs)
    }

    pub(crate) fn trace_attributes(&self) -> BTreeMap<String, String> {
        self.sink().trace_attributes.clone()
    }

    fn sink(&self) -> std::sync::MutexGuard<'_, InvocationSink> {
        // A panic in user code while holding the lock leaves plain maps behind.
        self.sink.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[derive(Debug, PartialEq)]
    struct Marker(u32);

    #[test]
    fn features_are_set_once() {
        let mut features = Features::new();
        features.set(Marker(1)).unwrap();
        let err = features.set(Marker(2)).unwrap_err();
        assert!(matches!(err, InvocationError::FeatureAlreadySet(name) if name.ends_with("Marker")));
        assert_eq!(features.get::<Marker>(), Some(&Marker(1)));
    }

    #[test]
    fn missing_feature_is_reported_by_type() {
        let features = Features::new();
        assert!(features.get::<Marker>().is_none());
        assert!(matches!(features.require::<Marker>(), Err(InvocationError::MissingFeature(_))));
    }

    #[test]
    fn trait_object_features_are_addressable() {
        let mut features = Features::new();
        let retry: Arc<dyn RetryContext> = Arc::new(InvocationRetryContext::from(&protocol::RetryContext {
            retry_count: 2,
            max_retry_count: 5,
            exception: None,
        }));
        features.set(retry).unwrap();
        let got = features.get::<Arc<dyn RetryContext>>().unwrap();
        assert_eq!(got.retry_count(), 2);
        assert_eq!(got.max_retry_count(), 5);
    }

    #[test]
    fn invocation_clones_share_outputs() {
        let inv = FunctionInvocation::new("i1", "f1", "Echo", CancellationToken::new());
        let clone = inv.clone();
        clone.set_output("queue", "hello");
        let outputs = inv.take_outputs();
        assert_eq!(outputs.get("queue"), Some(&Value::from("hello")));
        assert!(inv.take_outputs().is_empty());
    }
}

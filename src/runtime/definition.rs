//! Loaded function definitions and the store that holds them.

use super::projection::OutputProjection;
use super::registry::{FunctionHandler, FunctionRegistry};
use crate::errors::LoadError;
use crate::protocol::{BindingInfo, FunctionLoadRequest, RetryOptions};
use serde::de::DeserializeOwned;
use std::any::{Any, TypeId, type_name};
use std::collections::{BTreeMap, HashMap};
use std::fmt;
use std::sync::{Arc, RwLock};

/// A bound argument, type-erased.
pub type BoxedArg = Box<dyn Any + Send>;

type JsonDecoder = fn(&[u8]) -> serde_json::Result<BoxedArg>;

fn decode_json<T: DeserializeOwned + Any + Send>(bytes: &[u8]) -> serde_json::Result<BoxedArg> {
    Ok(Box::new(serde_json::from_slice::<T>(bytes)?))
}

/// Declared target type of a parameter.
///
/// `of::<T>()` names a type the converters know natively. `json::<T>()`
/// additionally carries a JSON decoder so structured payloads can be
/// materialized into `T`.
#[derive(Clone, Copy)]
pub struct ParamType {
    id: TypeId,
    name: &'static str,
    decoder: Option<JsonDecoder>,
}

impl ParamType {
    pub fn of<T: Any + Send>() -> Self {
        Self {
            id: TypeId::of::<T>(),
            name: type_name::<T>(),
            decoder: None,
        }
    }

    pub fn json<T: DeserializeOwned + Any + Send>() -> Self {
        Self {
            id: TypeId::of::<T>(),
            name: type_name::<T>(),
            decoder: Some(decode_json::<T>),
        }
    }

    pub fn is<T: Any>(&self) -> bool {
        self.id == TypeId::of::<T>()
    }

    pub fn type_id(&self) -> TypeId {
        self.id
    }

    /// Fully qualified type name.
    pub fn name(&self) -> &'static str {
        self.name
    }

    /// Decode `bytes` as JSON into the target type, if a decoder is attached.
    pub fn decode_json(&self, bytes: &[u8]) -> Option<serde_json::Result<BoxedArg>> {
        self.decoder.map(|decode| decode(bytes))
    }
}

impl PartialEq for ParamType {
    fn eq(&self, other: &Self) -> bool {
        self.id == other.id
    }
}

impl Eq for ParamType {}

impl fmt::Debug for ParamType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name)
    }
}

/// One declared input parameter of a loaded function.
#[derive(Debug, Clone)]
pub struct FunctionParameter {
    pub name: String,
    pub param_type: ParamType,
    /// Properties of the matching input binding, if any.
    pub properties: BTreeMap<String, String>,
}

/// Immutable description of a loaded function.
pub struct FunctionDefinition {
    pub id: String,
    pub name: String,
    pub entry_point: String,
    pub parameters: Vec<FunctionParameter>,
    pub input_bindings: Vec<BindingInfo>,
    pub output_bindings: Vec<BindingInfo>,
    pub retry: Option<RetryOptions>,
    pub projection: OutputProjection,
    pub(crate) handler: Arc<dyn FunctionHandler>,
}

impl fmt::Debug for FunctionDefinition {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("FunctionDefinition")
            .field("id", &self.id)
            .field("name", &self.name)
            .field("entry_point", &self.entry_point)
            .field("parameters", &self.parameters)
            .field("projection", &self.projection)
            .finish_non_exhaustive()
    }
}

impl FunctionDefinition {
    /// Resolve a load request against the registered entry points.
    pub fn from_load_request(request: &FunctionLoadRequest, registry: &FunctionRegistry) -> Result<Self, LoadError> {
        if request.function_id.trim().is_empty() {
            return Err(LoadError::MissingFunctionId);
        }
        let metadata = &request.metadata;
        let entry_point = if metadata.entry_point.is_empty() {
            metadata.name.as_str()
        } else {
            metadata.entry_point.as_str()
        };
        let registered = registry.resolve(entry_point).ok_or_else(|| LoadError::UnknownEntryPoint {
            name: metadata.name.clone(),
            entry_point: entry_point.to_string(),
        })?;

        let (input_bindings, output_bindings): (Vec<BindingInfo>, Vec<BindingInfo>) = metadata
            .bindings
            .iter()
            .cloned()
            .partition(|b| b.direction.is_input());
        // in/out bindings take part in both directions
        let output_bindings: Vec<BindingInfo> = output_bindings
            .into_iter()
            .chain(input_bindings.iter().filter(|b| b.direction.is_output()).cloned())
            .collect();

        let parameters = registered
            .parameters
            .iter()
            .map(|(name, param_type)| FunctionParameter {
                name: name.clone(),
                param_type: *param_type,
                properties: input_bindings
                    .iter()
                    .find(|b| b.name.eq_ignore_ascii_case(name))
                    .map(|b| b.properties.clone())
                    .unwrap_or_default(),
            })
            .collect();

        let output_names: Vec<&str> = output_bindings.iter().map(|b| b.name.as_str()).collect();
        let projection = OutputProjection::resolve(&metadata.name, &output_names)?;

        Ok(Self {
            id: request.function_id.clone(),
            name: metadata.name.clone(),
            entry_point: entry_point.to_string(),
            parameters,
            input_bindings,
            output_bindings,
            retry: metadata.retry_options,
            projection,
            handler: registered.handler.clone(),
        })
    }
}

/// Loaded definitions keyed by function id. Entries are never replaced.
#[derive(Debug, Default)]
pub struct FunctionStore {
    inner: RwLock<HashMap<String, Arc<FunctionDefinition>>>,
}

impl FunctionStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&self, definition: FunctionDefinition) -> Result<Arc<FunctionDefinition>, LoadError> {
        let mut map = self.inner.write().unwrap_or_else(|poisoned| poisoned.into_inner());
        if map.contains_key(&definition.id) {
            return Err(LoadError::DuplicateFunctionId {
                name: definition.name,
                function_id: definition.id,
            });
        }
        let definition = Arc::new(definition);
        map.insert(definition.id.clone(), definition.clone());
        Ok(definition)
    }

    pub fn get(&self, function_id: &str) -> Option<Arc<FunctionDefinition>> {
        self.inner
            .read()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .get(function_id)
            .cloned()
    }

    pub fn contains(&self, function_id: &str) -> bool {
        self.get(function_id).is_some()
    }

    pub fn len(&self) -> usize {
        self.inner.read().unwrap_or_else(|poisoned| poisoned.into_inner()).len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

//! Envelope types exchanged with the host over the duplex stream.
//!
//! Every message is a [`StreamingMessage`]: a correlation id plus a
//! [`Content`] discriminator. Responses echo the `request_id` of the request
//! they answer. Unrecognised discriminators deserialize to
//! [`Content::Unknown`] so that a newer host can talk to an older worker.

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

/// Protocol revision advertised in worker metadata.
pub const PROTOCOL_VERSION: &str = "1.0";

/// One unit on the streaming channel.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StreamingMessage {
    #[serde(default)]
    pub request_id: String,
    pub content: Content,
}

impl StreamingMessage {
    pub fn new(request_id: impl Into<String>, content: Content) -> Self {
        Self {
            request_id: request_id.into(),
            content,
        }
    }
}

/// Payload discriminator.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum Content {
    StartStream(StartStream),
    WorkerInitRequest(WorkerInitRequest),
    WorkerInitResponse(WorkerInitResponse),
    FunctionLoadRequest(FunctionLoadRequest),
    FunctionLoadResponse(FunctionLoadResponse),
    FunctionsMetadataRequest(FunctionsMetadataRequest),
    FunctionMetadataResponse(FunctionMetadataResponse),
    InvocationRequest(InvocationRequest),
    InvocationResponse(InvocationResponse),
    InvocationCancel(InvocationCancel),
    FunctionEnvironmentReloadRequest(FunctionEnvironmentReloadRequest),
    FunctionEnvironmentReloadResponse(FunctionEnvironmentReloadResponse),
    WorkerStatusRequest(WorkerStatusRequest),
    WorkerStatusResponse(WorkerStatusResponse),
    WorkerTerminate(WorkerTerminate),
    /// Any discriminator this worker does not understand.
    #[serde(other)]
    Unknown,
}

/// Short, stable name for a payload kind. Used as a log field.
pub fn kind_of(content: &Content) -> &'static str {
    match content {
        Content::StartStream(_) => "StartStream",
        Content::WorkerInitRequest(_) => "WorkerInitRequest",
        Content::WorkerInitResponse(_) => "WorkerInitResponse",
        Content::FunctionLoadRequest(_) => "FunctionLoadRequest",
        Content::FunctionLoadResponse(_) => "FunctionLoadResponse",
        Content::FunctionsMetadataRequest(_) => "FunctionsMetadataRequest",
        Content::FunctionMetadataResponse(_) => "FunctionMetadataResponse",
        Content::InvocationRequest(_) => "InvocationRequest",
        Content::InvocationResponse(_) => "InvocationResponse",
        Content::InvocationCancel(_) => "InvocationCancel",
        Content::FunctionEnvironmentReloadRequest(_) => "FunctionEnvironmentReloadRequest",
        Content::FunctionEnvironmentReloadResponse(_) => "FunctionEnvironmentReloadResponse",
        Content::WorkerStatusRequest(_) => "WorkerStatusRequest",
        Content::WorkerStatusResponse(_) => "WorkerStatusResponse",
        Content::WorkerTerminate(_) => "WorkerTerminate",
        Content::Unknown => "Unknown",
    }
}

// ============================================================================
// Shared payload pieces
// ============================================================================

/// Raw payload value as carried on the wire.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TypedData {
    String(String),
    /// JSON document in text form.
    Json(String),
    Bytes(Vec<u8>),
    Int(i64),
    Double(f64),
    CollectionString(Vec<String>),
    CollectionBytes(Vec<Vec<u8>>),
    CollectionDouble(Vec<f64>),
    CollectionSint64(Vec<i64>),
}

impl TypedData {
    /// Name of the payload shape, used in conversion error messages.
    pub fn type_name(&self) -> &'static str {
        match self {
            TypedData::String(_) => "String",
            TypedData::Json(_) => "Json",
            TypedData::Bytes(_) => "Bytes",
            TypedData::Int(_) => "Int",
            TypedData::Double(_) => "Double",
            TypedData::CollectionString(_) => "CollectionString",
            TypedData::CollectionBytes(_) => "CollectionBytes",
            TypedData::CollectionDouble(_) => "CollectionDouble",
            TypedData::CollectionSint64(_) => "CollectionSint64",
        }
    }

    pub fn is_collection(&self) -> bool {
        matches!(
            self,
            TypedData::CollectionString(_)
                | TypedData::CollectionBytes(_)
                | TypedData::CollectionDouble(_)
                | TypedData::CollectionSint64(_)
        )
    }
}

/// A named payload (input data entry or output binding value).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ParameterBinding {
    pub name: String,
    #[serde(default)]
    pub data: Option<TypedData>,
}

impl ParameterBinding {
    pub fn new(name: impl Into<String>, data: Option<TypedData>) -> Self {
        Self {
            name: name.into(),
            data,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Status {
    Failure,
    Success,
    Cancelled,
}

/// Structured fault for cross-process transport.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct RpcException {
    /// Type name of the fault (for user code, the fault kind it raised).
    #[serde(default)]
    pub type_name: String,
    pub message: String,
    #[serde(default)]
    pub stack_trace: String,
    #[serde(default)]
    pub is_user_exception: bool,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StatusResult {
    pub status: Status,
    #[serde(default)]
    pub exception: Option<RpcException>,
}

impl StatusResult {
    pub fn success() -> Self {
        Self {
            status: Status::Success,
            exception: None,
        }
    }

    pub fn failure(exception: RpcException) -> Self {
        Self {
            status: Status::Failure,
            exception: Some(exception),
        }
    }

    pub fn cancelled(exception: Option<RpcException>) -> Self {
        Self {
            status: Status::Cancelled,
            exception,
        }
    }

    pub fn is_success(&self) -> bool {
        self.status == Status::Success
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct RpcTraceContext {
    #[serde(default)]
    pub trace_parent: String,
    #[serde(default)]
    pub trace_state: String,
    #[serde(default)]
    pub attributes: BTreeMap<String, String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct WorkerMetadata {
    pub runtime_name: String,
    pub runtime_version: String,
    pub worker_version: String,
    pub worker_bitness: String,
    #[serde(default)]
    pub custom_properties: BTreeMap<String, String>,
}

// ============================================================================
// Function metadata
// ============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BindingDirection {
    In,
    Out,
    Inout,
}

impl BindingDirection {
    pub fn is_input(self) -> bool {
        matches!(self, BindingDirection::In | BindingDirection::Inout)
    }

    pub fn is_output(self) -> bool {
        matches!(self, BindingDirection::Out | BindingDirection::Inout)
    }
}

/// One declared binding of a function.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BindingInfo {
    pub name: String,
    /// Binding type such as `httpTrigger` or `queue`.
    #[serde(rename = "type")]
    pub binding_type: String,
    pub direction: BindingDirection,
    /// Free-form binding properties (converter hints live here).
    #[serde(default)]
    pub properties: BTreeMap<String, String>,
}

impl BindingInfo {
    pub fn new(name: impl Into<String>, binding_type: impl Into<String>, direction: BindingDirection) -> Self {
        Self {
            name: name.into(),
            binding_type: binding_type.into(),
            direction,
            properties: BTreeMap::new(),
        }
    }

    pub fn with_property(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.properties.insert(key.into(), value.into());
        self
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "strategy", rename_all = "snake_case")]
pub enum RetryStrategy {
    FixedDelay { delay_interval_ms: u64 },
    ExponentialBackoff { minimum_interval_ms: u64, maximum_interval_ms: u64 },
}

/// Function-level retry policy declared in metadata.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct RetryOptions {
    pub max_retry_count: i32,
    #[serde(flatten)]
    pub strategy: RetryStrategy,
}

#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct RpcFunctionMetadata {
    #[serde(default)]
    pub function_id: String,
    pub name: String,
    #[serde(default)]
    pub entry_point: String,
    #[serde(default)]
    pub script_file: String,
    #[serde(default)]
    pub is_proxy: bool,
    #[serde(default)]
    pub bindings: Vec<BindingInfo>,
    #[serde(default)]
    pub retry_options: Option<RetryOptions>,
}

// ============================================================================
// Requests and responses
// ============================================================================

#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct StartStream {
    pub worker_id: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct WorkerInitRequest {
    #[serde(default)]
    pub host_version: String,
    #[serde(default)]
    pub capabilities: BTreeMap<String, bool>,
    #[serde(default)]
    pub worker_directory: String,
    #[serde(default)]
    pub function_app_directory: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WorkerInitResponse {
    pub worker_version: String,
    pub capabilities: BTreeMap<String, bool>,
    pub worker_metadata: WorkerMetadata,
    pub result: StatusResult,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FunctionLoadRequest {
    pub function_id: String,
    pub metadata: RpcFunctionMetadata,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FunctionLoadResponse {
    pub function_id: String,
    pub result: StatusResult,
}

#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct FunctionsMetadataRequest {
    #[serde(default)]
    pub function_app_directory: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FunctionMetadataResponse {
    pub function_metadata_results: Vec<RpcFunctionMetadata>,
    pub use_default_metadata_indexing: bool,
    pub result: StatusResult,
}

/// Retry state for the current attempt, supplied by the host.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct RetryContext {
    pub retry_count: u32,
    pub max_retry_count: i32,
    #[serde(default)]
    pub exception: Option<RpcException>,
}

#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct InvocationRequest {
    pub invocation_id: String,
    pub function_id: String,
    #[serde(default)]
    pub input_data: Vec<ParameterBinding>,
    #[serde(default)]
    pub trigger_metadata: BTreeMap<String, TypedData>,
    #[serde(default)]
    pub trace_context: RpcTraceContext,
    #[serde(default)]
    pub retry_context: Option<RetryContext>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct InvocationResponse {
    pub invocation_id: String,
    #[serde(default)]
    pub output_data: Vec<ParameterBinding>,
    #[serde(default)]
    pub return_value: Option<TypedData>,
    pub result: StatusResult,
    #[serde(default)]
    pub trace_context: Option<RpcTraceContext>,
}

impl InvocationResponse {
    pub(crate) fn failed(invocation_id: impl Into<String>, result: StatusResult) -> Self {
        Self {
            invocation_id: invocation_id.into(),
            output_data: Vec::new(),
            return_value: None,
            result,
            trace_context: None,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct InvocationCancel {
    pub invocation_id: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct FunctionEnvironmentReloadRequest {
    #[serde(default)]
    pub environment_variables: BTreeMap<String, String>,
    #[serde(default)]
    pub function_app_directory: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FunctionEnvironmentReloadResponse {
    pub worker_metadata: WorkerMetadata,
    pub capabilities: BTreeMap<String, bool>,
    pub result: StatusResult,
}

#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct WorkerStatusRequest {}

#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct WorkerStatusResponse {}

#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct WorkerTerminate {
    /// How long in-flight invocations may keep running before they are cancelled.
    #[serde(default)]
    pub grace_period_ms: Option<u64>,
}

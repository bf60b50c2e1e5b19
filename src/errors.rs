//! Error types surfaced by the worker.
//!
//! Worker-side failures are typed enums. User code reports failures through
//! `anyhow::Error`; those are captured as a [`FunctionFault`] before they
//! cross the invocation boundary.

use crate::protocol::RpcException;
use std::any::Any;
use std::backtrace::BacktraceStatus;
use thiserror::Error;

/// Failure while loading a function definition.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum LoadError {
    #[error("the function id for the current load request is invalid")]
    MissingFunctionId,

    #[error("unable to load function '{name}': a function with the id '{function_id}' already exists")]
    DuplicateFunctionId { name: String, function_id: String },

    #[error("unable to load function '{name}': entry point '{entry_point}' is not registered with this worker")]
    UnknownEntryPoint { name: String, entry_point: String },

    #[error(
        "function '{name}' declares the '$return' output binding together with {others} other output binding(s); '$return' must be the only output binding"
    )]
    AmbiguousReturnBinding { name: String, others: usize },
}

/// One parameter that could not be bound.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ParameterFailure {
    pub parameter: String,
    pub target_type: &'static str,
    pub source_type: &'static str,
    pub reason: String,
}

impl std::fmt::Display for ParameterFailure {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "Cannot convert input parameter '{}' to type '{}' from type '{}'. Error: {}",
            self.parameter, self.target_type, self.source_type, self.reason
        )
    }
}

/// Every parameter failure of one binding pass, reported together.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BindingError {
    pub function_name: String,
    pub failures: Vec<ParameterFailure>,
}

impl std::fmt::Display for BindingError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "Error converting {} input parameter(s) for function '{}'",
            self.failures.len(),
            self.function_name
        )?;
        for failure in &self.failures {
            write!(f, ": {failure}")?;
        }
        Ok(())
    }
}

impl std::error::Error for BindingError {}

/// Failure raised by user code (or by a panic inside it).
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("{message}")]
pub struct FunctionFault {
    pub type_name: String,
    pub message: String,
    pub stack_trace: String,
}

impl FunctionFault {
    /// Build a fault with an explicit kind. User code can return this through
    /// `anyhow` to control the type name reported to the host.
    pub fn new(type_name: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            type_name: type_name.into(),
            message: message.into(),
            stack_trace: String::new(),
        }
    }

    pub(crate) fn from_anyhow(err: &anyhow::Error) -> Self {
        if let Some(fault) = err.downcast_ref::<FunctionFault>() {
            return fault.clone();
        }

        let mut stack: Vec<String> = err.chain().skip(1).map(|cause| format!("---> {cause}")).collect();
        let backtrace = err.backtrace();
        if backtrace.status() == BacktraceStatus::Captured {
            stack.push(backtrace.to_string());
        }

        Self {
            type_name: "FunctionError".to_string(),
            message: err.to_string(),
            stack_trace: stack.join("\n"),
        }
    }

    pub(crate) fn from_panic(payload: Box<dyn Any + Send>) -> Self {
        let message = if let Some(s) = payload.downcast_ref::<&str>() {
            (*s).to_string()
        } else if let Some(s) = payload.downcast_ref::<String>() {
            s.clone()
        } else {
            "function panicked".to_string()
        };
        Self::new("Panic", message)
    }
}

/// Failure of a single invocation. Never escapes the invocation boundary;
/// it is always turned into a failed or cancelled response.
#[derive(Debug, Error)]
pub enum InvocationError {
    #[error("function id '{0}' is not loaded")]
    UnknownFunction(String),

    #[error("invocation '{0}' is already in flight")]
    DuplicateInvocation(String),

    #[error(
        "Duplicate binding call detected. Input parameters can only be bound to arguments once. Use the bound arguments of the first binding call"
    )]
    DuplicateBinding,

    #[error(transparent)]
    Binding(#[from] BindingError),

    #[error("feature '{0}' is already set on this invocation")]
    FeatureAlreadySet(&'static str),

    #[error("feature '{0}' is missing from this invocation")]
    MissingFeature(&'static str),

    #[error("invocation '{0}' was cancelled")]
    Cancelled(String),

    #[error("the worker is shutting down and no longer accepts invocations")]
    ShuttingDown,

    #[error("failed to serialize output '{name}': {source}")]
    Serialization {
        name: String,
        #[source]
        source: serde_json::Error,
    },

    #[error(transparent)]
    Function(#[from] FunctionFault),
}

impl InvocationError {
    /// Type name reported in [`RpcException::type_name`].
    pub fn type_name(&self) -> &str {
        match self {
            InvocationError::UnknownFunction(_) => "UnknownFunction",
            InvocationError::DuplicateInvocation(_) => "DuplicateInvocation",
            InvocationError::DuplicateBinding => "DuplicateBinding",
            InvocationError::Binding(_) => "FunctionInputConverterError",
            InvocationError::FeatureAlreadySet(_) | InvocationError::MissingFeature(_) => "FeatureError",
            InvocationError::Cancelled(_) => "OperationCanceled",
            InvocationError::ShuttingDown => "WorkerShuttingDown",
            InvocationError::Serialization { .. } => "OutputSerializationError",
            InvocationError::Function(fault) => &fault.type_name,
        }
    }

    pub fn is_cancellation(&self) -> bool {
        matches!(self, InvocationError::Cancelled(_))
    }

    pub fn is_user_error(&self) -> bool {
        matches!(self, InvocationError::Function(_))
    }

    /// Convert to the wire shape.
    ///
    /// `include_details` controls whether stack traces are forwarded.
    /// `user_code_exceptions` marks faults raised by user code as such and
    /// reports their message verbatim; when false the type name is folded
    /// into the message instead.
    pub fn to_rpc_exception(&self, include_details: bool, user_code_exceptions: bool) -> RpcException {
        let type_name = self.type_name().to_string();
        let (message, stack_trace) = match self {
            InvocationError::Function(fault) => {
                let message = if user_code_exceptions {
                    fault.message.clone()
                } else {
                    format!("{}: {}", fault.type_name, fault.message)
                };
                (message, fault.stack_trace.clone())
            }
            other => (other.to_string(), String::new()),
        };

        RpcException {
            type_name,
            message,
            stack_trace: if include_details { stack_trace } else { String::new() },
            is_user_exception: user_code_exceptions && self.is_user_error(),
        }
    }
}

/// Failure of the transport itself. These are fatal to the worker.
#[derive(Debug, Error)]
pub enum TransportError {
    #[error("transport I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("failed to encode message: {0}")]
    Encode(#[from] serde_json::Error),

    #[error("the outbound channel is closed")]
    Closed,
}

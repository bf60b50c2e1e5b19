//! # funcworker
//!
//! A language worker for a functions host. The host streams envelopes over
//! a long-lived duplex connection; the worker loads function definitions,
//! binds invocation payloads to typed parameters, runs user code through a
//! middleware pipeline and streams the results back.
//!
//! ## Moving parts
//!
//! - [`protocol`]: the envelope types exchanged with the host.
//! - [`runtime::Worker`]: routes envelopes, answers control requests inline
//!   and runs every invocation on its own task.
//! - [`runtime::FunctionRegistry`]: user code, registered by entry point.
//! - [`runtime::PipelineBuilder`]: middleware composed around execution.
//! - [`runtime::ConverterRegistry`]: ordered converters used for binding.
//! - [`runtime::OutputProjection`]: maps a return value onto output bindings.
//! - [`transport`]: JSON-lines framing over any async byte stream.
//!
//! ## Quick start
//!
//! ```rust,no_run
//! use funcworker::runtime::{FunctionRegistry, ParamType, Worker};
//! use funcworker::value::{Record, Value};
//!
//! # async fn start() -> Result<(), funcworker::errors::TransportError> {
//! let registry = FunctionRegistry::builder()
//!     .register("Orders.Create", [("order", ParamType::of::<serde_json::Value>())], |inv, args| async move {
//!         let order = args.get::<serde_json::Value>("order").cloned().unwrap_or_default();
//!         inv.add_trace_attribute("order.kind", "create");
//!         Ok(Some(Value::object(
//!             Record::new().with("body", "accepted").with("queue", Value::Json(order)),
//!         )))
//!     })
//!     .build();
//!
//! let worker = Worker::builder(registry).build();
//! funcworker::transport::connect(worker, "127.0.0.1", 7071, "worker-1", 1 << 20).await
//! # }
//! ```

pub mod errors;
mod logging;
pub mod protocol;
pub mod runtime;
pub mod transport;
pub mod value;

pub use errors::{BindingError, FunctionFault, InvocationError, LoadError, TransportError};
pub use runtime::{
    FunctionArguments, FunctionContext, FunctionInvocation, FunctionRegistry, Middleware, Next, ParamType,
    RETURN_BINDING_NAME, Worker, WorkerOptions,
};
pub use value::{Record, Value};

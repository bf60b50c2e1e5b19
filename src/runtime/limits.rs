//! Runtime limits and constants.
//!
//! Collect all hard limits in one place so they're easy to find and
//! reference from the router, the transport and the CLI.

/// Default time in-flight invocations get to finish after a terminate
/// request before their cancellation tokens are signalled.
pub const DEFAULT_TERMINATE_GRACE_PERIOD_MS: u64 = 5_000;

/// How long to wait for cancelled invocations to wind down after the grace
/// period has elapsed.
pub const CANCELLED_DRAIN_TIMEOUT_MS: u64 = 1_000;

/// Largest inbound line accepted by the transport. Longer lines are dropped.
///
/// 128 MiB matches the usual host-side default for function payloads.
pub const DEFAULT_MAX_MESSAGE_LENGTH: usize = 128 * 1024 * 1024;

/// Capacity of the inbound and outbound message queues.
pub const MESSAGE_QUEUE_CAPACITY: usize = 1_024;

/// Trace attributes the worker sets itself; user code may not override them.
pub const RESERVED_TRACE_ATTRIBUTES: &[&str] = &["faas.execution", "faas.name", "faas.invocation_id"];

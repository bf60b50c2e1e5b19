//! Logging helpers that stamp invocation correlation fields on every event.

#[macro_export]
macro_rules! invocation_info {
    ($ctx:expr, $($arg:tt)+) => {{
        ::tracing::info!(
            invocation_id = %$ctx.invocation_id(),
            function_id = %$ctx.function_id(),
            function_name = %$ctx.function_name(),
            $($arg)+
        );
    }};
}

#[macro_export]
macro_rules! invocation_debug {
    ($ctx:expr, $($arg:tt)+) => {{
        ::tracing::debug!(
            invocation_id = %$ctx.invocation_id(),
            function_id = %$ctx.function_id(),
            function_name = %$ctx.function_name(),
            $($arg)+
        );
    }};
}

#[macro_export]
macro_rules! invocation_warn {
    ($ctx:expr, $($arg:tt)+) => {{
        ::tracing::warn!(
            invocation_id = %$ctx.invocation_id(),
            function_id = %$ctx.function_id(),
            function_name = %$ctx.function_name(),
            $($arg)+
        );
    }};
}

#[macro_export]
macro_rules! invocation_error {
    ($ctx:expr, $($arg:tt)+) => {{
        ::tracing::error!(
            invocation_id = %$ctx.invocation_id(),
            function_id = %$ctx.function_id(),
            function_name = %$ctx.function_name(),
            $($arg)+
        );
    }};
}

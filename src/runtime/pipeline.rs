//! Middleware pipeline around function execution.
//!
//! Components are registered in order and composed right to left, so the
//! first registered component runs outermost. Each component receives the
//! context and a [`Next`] handle; calling [`Next::run`] continues the chain,
//! returning without calling it short-circuits everything downstream.

use super::context::FunctionContext;
use crate::errors::InvocationError;
use async_trait::async_trait;
use futures::future::BoxFuture;
use std::sync::Arc;

/// The composed chain (or any suffix of it).
pub type ExecutionDelegate =
    Arc<dyn for<'a> Fn(&'a mut FunctionContext) -> BoxFuture<'a, Result<(), InvocationError>> + Send + Sync>;

fn delegate<F>(f: F) -> ExecutionDelegate
where
    F: for<'a> Fn(&'a mut FunctionContext) -> BoxFuture<'a, Result<(), InvocationError>> + Send + Sync + 'static,
{
    Arc::new(f)
}

/// Continuation into the rest of the pipeline. Consumed on use, so a
/// component can run the remainder of the chain at most once.
pub struct Next {
    inner: ExecutionDelegate,
}

impl Next {
    pub async fn run(self, ctx: &mut FunctionContext) -> Result<(), InvocationError> {
        (self.inner)(ctx).await
    }
}

#[async_trait]
pub trait Middleware: Send + Sync {
    async fn invoke(&self, ctx: &mut FunctionContext, next: Next) -> Result<(), InvocationError>;
}

/// Adapter that turns a closure into a [`Middleware`]. Build with [`from_fn`].
pub struct FnMiddleware<F>(F);

/// ```
/// use funcworker::runtime::pipeline::{from_fn, PipelineBuilder};
///
/// let pipeline = PipelineBuilder::new()
///     .use_middleware(from_fn(|ctx, next| {
///         Box::pin(async move {
///             ctx.items_mut().insert("seen".into(), Box::new(true));
///             next.run(ctx).await
///         })
///     }))
///     .build();
/// # let _ = pipeline;
/// ```
pub fn from_fn<F>(f: F) -> FnMiddleware<F>
where
    F: for<'a> Fn(&'a mut FunctionContext, Next) -> BoxFuture<'a, Result<(), InvocationError>> + Send + Sync,
{
    FnMiddleware(f)
}

#[async_trait]
impl<F> Middleware for FnMiddleware<F>
where
    F: for<'a> Fn(&'a mut FunctionContext, Next) -> BoxFuture<'a, Result<(), InvocationError>> + Send + Sync,
{
    async fn invoke(&self, ctx: &mut FunctionContext, next: Next) -> Result<(), InvocationError> {
        (self.0)(ctx, next).await
    }
}

type Predicate = Arc<dyn Fn(&FunctionContext) -> bool + Send + Sync>;

/// Runs the inner middleware only when the predicate holds; otherwise
/// passes straight through to the next component.
struct Conditional {
    predicate: Predicate,
    inner: Arc<dyn Middleware>,
}

#[async_trait]
impl Middleware for Conditional {
    async fn invoke(&self, ctx: &mut FunctionContext, next: Next) -> Result<(), InvocationError> {
        if (self.predicate)(ctx) {
            self.inner.invoke(ctx, next).await
        } else {
            next.run(ctx).await
        }
    }
}

#[derive(Default)]
pub struct PipelineBuilder {
    components: Vec<Arc<dyn Middleware>>,
}

impl PipelineBuilder {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn use_middleware(mut self, middleware: impl Middleware + 'static) -> Self {
        self.components.push(Arc::new(middleware));
        self
    }

    pub fn use_shared(mut self, middleware: Arc<dyn Middleware>) -> Self {
        self.components.push(middleware);
        self
    }

    /// Register a middleware that only runs for invocations matching `predicate`.
    pub fn use_when<P>(mut self, predicate: P, middleware: impl Middleware + 'static) -> Self
    where
        P: Fn(&FunctionContext) -> bool + Send + Sync + 'static,
    {
        self.components.push(Arc::new(Conditional {
            predicate: Arc::new(predicate),
            inner: Arc::new(middleware),
        }));
        self
    }

    pub fn len(&self) -> usize {
        self.components.len()
    }

    pub fn is_empty(&self) -> bool {
        self.components.is_empty()
    }

    /// Compose the registered components around a terminal that does nothing.
    pub fn build(self) -> InvocationPipeline {
        let terminal = delegate(|_ctx| Box::pin(async { Ok(()) }));
        let chain = self.components.into_iter().rev().fold(terminal, |next, component| {
            delegate(move |ctx| {
                let component = component.clone();
                let next = Next { inner: next.clone() };
                Box::pin(async move { component.invoke(ctx, next).await })
            })
        });
        InvocationPipeline { chain }
    }
}

/// A composed pipeline, shared by every invocation.
#[derive(Clone)]
pub struct InvocationPipeline {
    chain: ExecutionDelegate,
}

impl InvocationPipeline {
    pub async fn invoke(&self, ctx: &mut FunctionContext) -> Result<(), InvocationError> {
        (self.chain)(ctx).await
    }
}

impl std::fmt::Debug for InvocationPipeline {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str("InvocationPipeline")
    }
}

//! Middleware pipeline.
//!
//! Each middleware returns a [`Flow`] exactly once, so a stage can never
//! be resumed twice. The pipeline runs global middlewares first, then the
//! matched route's, strictly in order.

use std::fmt;
use std::sync::Arc;

use dashmap::DashMap;
use tracing::{debug, warn};
use wsgate_core::{GatewayError, MiddlewareError};

use crate::context::RequestContext;

/// What a middleware decided.
#[derive(Debug)]
pub enum Flow {
    /// Pass to the next middleware (or the backend after the last one).
    Continue,
    /// Stop and send this error to the client.
    Abort(MiddlewareError),
    /// Stop; the middleware answered (or deliberately dropped) the request.
    Handled,
}

/// An interceptor run before dispatch.
pub trait Middleware: Send + Sync {
    fn handle(&self, ctx: &mut RequestContext) -> Flow;
}

impl<F> Middleware for F
where
    F: Fn(&mut RequestContext) -> Flow + Send + Sync,
{
    fn handle(&self, ctx: &mut RequestContext) -> Flow {
        self(ctx)
    }
}

/// A middleware by name (late-bound) or by value.
#[derive(Clone)]
pub enum MiddlewareRef {
    /// Looked up in the [`MiddlewareRegistry`] on every request.
    Named(String),
    Inline(Arc<dyn Middleware>),
}

impl MiddlewareRef {
    pub fn inline(middleware: impl Middleware + 'static) -> Self {
        Self::Inline(Arc::new(middleware))
    }

    fn label(&self) -> &str {
        match self {
            Self::Named(name) => name,
            Self::Inline(_) => "<inline>",
        }
    }
}

impl fmt::Debug for MiddlewareRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Named(name) => f.debug_tuple("Named").field(name).finish(),
            Self::Inline(_) => f.write_str("Inline(..)"),
        }
    }
}

impl From<&str> for MiddlewareRef {
    fn from(name: &str) -> Self {
        Self::Named(name.to_owned())
    }
}

impl From<String> for MiddlewareRef {
    fn from(name: String) -> Self {
        Self::Named(name)
    }
}

impl From<Arc<dyn Middleware>> for MiddlewareRef {
    fn from(middleware: Arc<dyn Middleware>) -> Self {
        Self::Inline(middleware)
    }
}

/// Name → middleware table. Entries can be replaced at runtime.
#[derive(Default)]
pub struct MiddlewareRegistry {
    entries: DashMap<String, Arc<dyn Middleware>>,
}

impl MiddlewareRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register (or replace) a named middleware.
    pub fn register(&self, name: impl Into<String>, middleware: impl Middleware + 'static) {
        let name = name.into();
        if self.entries.insert(name.clone(), Arc::new(middleware)).is_some() {
            debug!(middleware = %name, "middleware replaced");
        }
    }

    pub fn unregister(&self, name: &str) -> bool {
        self.entries.remove(name).is_some()
    }

    pub fn get(&self, name: &str) -> Option<Arc<dyn Middleware>> {
        self.entries.get(name).map(|entry| entry.value().clone())
    }

    /// Registered names, sorted.
    pub fn names(&self) -> Vec<String> {
        let mut names: Vec<String> = self.entries.iter().map(|e| e.key().clone()).collect();
        names.sort();
        names
    }
}

/// How a pipeline run ended.
#[derive(Debug)]
pub enum PipelineOutcome {
    /// Every middleware continued; dispatch may proceed.
    Completed,
    /// A middleware aborted. The error envelope has already been sent,
    /// unless the middleware had answered the request itself.
    Aborted(GatewayError),
    /// A middleware took over the request.
    Handled,
}

/// Runs middleware chains against a [`MiddlewareRegistry`].
pub struct Pipeline<'a> {
    registry: &'a MiddlewareRegistry,
}

impl<'a> Pipeline<'a> {
    pub fn new(registry: &'a MiddlewareRegistry) -> Self {
        Self { registry }
    }

    /// Run `global` then `route` middlewares against `ctx`.
    pub fn run(
        &self,
        global: &[MiddlewareRef],
        route: &[MiddlewareRef],
        ctx: &mut RequestContext,
    ) -> PipelineOutcome {
        for entry in global.iter().chain(route) {
            let middleware = match entry {
                MiddlewareRef::Inline(m) => m.clone(),
                MiddlewareRef::Named(name) => match self.registry.get(name) {
                    Some(m) => m,
                    None => {
                        let err = MiddlewareError::new(format!(
                            "Middleware '{name}' is not registered"
                        ));
                        return abort(ctx, err);
                    }
                },
            };

            match middleware.handle(ctx) {
                Flow::Continue if ctx.has_responded() => {
                    // Responding and continuing would answer the client twice.
                    warn!(
                        middleware = entry.label(),
                        action = %ctx.action,
                        "middleware responded and continued; treating as handled"
                    );
                    return PipelineOutcome::Handled;
                }
                Flow::Continue => {}
                Flow::Abort(err) => return abort(ctx, err),
                Flow::Handled => {
                    debug!(middleware = entry.label(), action = %ctx.action, "request handled by middleware");
                    return PipelineOutcome::Handled;
                }
            }
        }
        PipelineOutcome::Completed
    }
}

fn abort(ctx: &mut RequestContext, err: MiddlewareError) -> PipelineOutcome {
    let error = GatewayError::Middleware(err);
    if ctx.has_responded() {
        warn!(action = %ctx.action, error = %error, "middleware aborted after responding; error not sent");
    } else {
        debug!(action = %ctx.action, error = %error, "middleware aborted request");
        let _ = ctx.respond_error(&error);
    }
    PipelineOutcome::Aborted(error)
}

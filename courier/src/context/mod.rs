//! Ambient execution context
//!
//! Correlation and trace state for the current logical request lives in a
//! tokio task-local. A send started outside any context runs inside a fresh
//! root context scoped to that send.
//!
//! Task-locals do not follow `tokio::spawn`; spawn inside
//! [`run_and_return`] again to carry a context into a new task.

use std::collections::HashMap;
use std::future::Future;

use tracing::debug;
use uuid::Uuid;

use crate::observability::{Carrier, SpanContext, Tracer};

tokio::task_local! {
    static CURRENT: ExecutionContext;
}

/// Correlation state for one logical request
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ExecutionContext {
    correlation_id: String,
    origin: bool,
    span: Option<SpanContext>,
    values: HashMap<String, String>,
}

impl ExecutionContext {
    /// Context for work that starts here rather than continuing a trace
    pub fn root() -> Self {
        Self {
            correlation_id: Uuid::new_v4().to_string(),
            origin: true,
            span: None,
            values: HashMap::new(),
        }
    }

    /// Context continuing the trace `parent` belongs to
    pub fn continuation(parent: SpanContext) -> Self {
        Self {
            correlation_id: parent.trace_id.to_string(),
            origin: false,
            span: Some(parent),
            values: HashMap::new(),
        }
    }

    /// Resume a trace from message headers, or start a root context if the
    /// carrier holds nothing usable
    pub fn from_carrier(tracer: &dyn Tracer, carrier: &Carrier) -> Self {
        match tracer.extract(carrier) {
            Some(parent) => Self::continuation(parent),
            None => Self::root(),
        }
    }

    pub fn with_value(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.values.insert(key.into(), value.into());
        self
    }

    pub fn correlation_id(&self) -> &str {
        &self.correlation_id
    }

    /// True when this context started a new trace
    pub fn is_origin(&self) -> bool {
        self.origin
    }

    /// The span new work should be a child of
    pub fn span(&self) -> Option<&SpanContext> {
        self.span.as_ref()
    }

    pub fn value(&self, key: &str) -> Option<&str> {
        self.values.get(key).map(String::as_str)
    }
}

pub fn is_active() -> bool {
    CURRENT.try_with(|_| ()).is_ok()
}

/// Snapshot of the active context
pub fn current() -> Option<ExecutionContext> {
    CURRENT.try_with(Clone::clone).ok()
}

/// Look up a value stored in the active context
pub fn get(key: &str) -> Option<String> {
    CURRENT
        .try_with(|ctx| ctx.value(key).map(str::to_string))
        .ok()
        .flatten()
}

/// Run `fut` inside `ctx`, returning its output
pub async fn run_and_return<F: Future>(ctx: ExecutionContext, fut: F) -> F::Output {
    CURRENT.scope(ctx, fut).await
}

/// Run `fut` in the active context, establishing a root context first if
/// there is none
pub async fn ensure<F: Future>(fut: F) -> F::Output {
    if is_active() {
        fut.await
    } else {
        let ctx = ExecutionContext::root();
        debug!(correlation_id = %ctx.correlation_id, "No active context, starting root context");
        run_and_return(ctx, fut).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::observability::W3cTracer;

    #[tokio::test]
    async fn test_inactive_outside_scope() {
        assert!(!is_active());
        assert!(current().is_none());
        assert_eq!(get("tenant"), None);
    }

    #[tokio::test]
    async fn test_run_and_return_scopes_values() {
        let ctx = ExecutionContext::root().with_value("tenant", "acme");

        let seen = run_and_return(ctx, async { (is_active(), get("tenant")) }).await;

        assert_eq!(seen, (true, Some("acme".to_string())));
        assert!(!is_active());
    }

    #[tokio::test]
    async fn test_ensure_creates_root_when_absent() {
        let ctx = ensure(async { current() }).await.unwrap();
        assert!(ctx.is_origin());
        assert!(ctx.span().is_none());
    }

    #[tokio::test]
    async fn test_ensure_keeps_existing_context() {
        let parent = SpanContext::new_root();
        let outer = ExecutionContext::continuation(parent);

        let inner = run_and_return(outer.clone(), ensure(async { current() }))
            .await
            .unwrap();

        assert_eq!(inner, outer);
        assert!(!inner.is_origin());
        assert_eq!(inner.correlation_id(), parent.trace_id.to_string());
    }

    #[test]
    fn test_from_carrier() {
        let tracer = W3cTracer;
        let parent = SpanContext::new_root();
        let mut carrier = Carrier::new();
        tracer.inject(&parent, &mut carrier);

        let ctx = ExecutionContext::from_carrier(&tracer, &carrier);
        assert_eq!(ctx.span(), Some(&parent));

        let ctx = ExecutionContext::from_carrier(&tracer, &Carrier::new());
        assert!(ctx.is_origin());
    }
}

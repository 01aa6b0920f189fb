//! Handler registry: maps a stable `(assembly, class)` key to the code that
//! runs when a job fires.
//!
//! Registration is explicit and happens at startup, before the scheduler
//! starts. Definitions referencing an unregistered key still persist; they
//! fail at fire time with `HandlerNotFound`.

use std::collections::HashMap;
use std::fmt;
use std::future::Future;
use std::sync::Arc;

use async_trait::async_trait;
use cadence_core::types::JobId;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio_util::sync::CancellationToken;

/// Identity of a registered handler.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct HandlerKey {
    pub assembly: String,
    pub class: String,
}

impl HandlerKey {
    pub fn new(assembly: impl Into<String>, class: impl Into<String>) -> Self {
        Self {
            assembly: assembly.into(),
            class: class.into(),
        }
    }
}

impl fmt::Display for HandlerKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.assembly, self.class)
    }
}

/// Everything a handler gets to see about the fire it is serving.
#[derive(Debug, Clone)]
pub struct JobContext {
    pub job_id: JobId,
    pub job_name: String,
    pub job_group: String,
    pub run_params: String,
    pub fired_at: DateTime<Utc>,
    /// Cancelled when the run exceeds its budget. Handlers should check it
    /// at convenient points; the executor never waits for them to notice.
    pub cancel: CancellationToken,
}

#[async_trait]
pub trait JobHandler: Send + Sync {
    async fn run(&self, ctx: JobContext) -> anyhow::Result<()>;
}

/// Adapter turning an async closure into a [`JobHandler`].
pub struct FnHandler<F>(F);

/// Wrap `f` so it can be registered as a handler.
pub fn handler_fn<F, Fut>(f: F) -> FnHandler<F>
where
    F: Fn(JobContext) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = anyhow::Result<()>> + Send + 'static,
{
    FnHandler(f)
}

#[async_trait]
impl<F, Fut> JobHandler for FnHandler<F>
where
    F: Fn(JobContext) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = anyhow::Result<()>> + Send + 'static,
{
    async fn run(&self, ctx: JobContext) -> anyhow::Result<()> {
        (self.0)(ctx).await
    }
}

#[derive(Default, Clone)]
pub struct HandlerRegistry {
    handlers: HashMap<HandlerKey, Arc<dyn JobHandler>>,
}

impl HandlerRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register `handler` under `(assembly, class)`, replacing any previous entry.
    pub fn register<H>(
        &mut self,
        assembly: impl Into<String>,
        class: impl Into<String>,
        handler: H,
    ) -> &mut Self
    where
        H: JobHandler + 'static,
    {
        self.handlers
            .insert(HandlerKey::new(assembly, class), Arc::new(handler));
        self
    }

    pub fn resolve(&self, key: &HandlerKey) -> Option<Arc<dyn JobHandler>> {
        self.handlers.get(key).cloned()
    }

    pub fn contains(&self, key: &HandlerKey) -> bool {
        self.handlers.contains_key(key)
    }

    /// Registered keys, sorted for stable output.
    pub fn keys(&self) -> Vec<HandlerKey> {
        let mut keys: Vec<_> = self.handlers.keys().cloned().collect();
        keys.sort_by(|a, b| (&a.assembly, &a.class).cmp(&(&b.assembly, &b.class)));
        keys
    }

    pub fn len(&self) -> usize {
        self.handlers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.handlers.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn ctx() -> JobContext {
        JobContext {
            job_id: JobId::new(),
            job_name: "echo".into(),
            job_group: "default".into(),
            run_params: "hello".into(),
            fired_at: Utc::now(),
            cancel: CancellationToken::new(),
        }
    }

    #[tokio::test]
    async fn registered_closure_resolves_and_runs() {
        let mut registry = HandlerRegistry::new();
        registry.register(
            "Tests",
            "Echo",
            handler_fn(|ctx: JobContext| async move {
                anyhow::ensure!(ctx.run_params == "hello", "unexpected params");
                Ok(())
            }),
        );

        let handler = registry
            .resolve(&HandlerKey::new("Tests", "Echo"))
            .expect("handler registered");
        handler.run(ctx()).await.unwrap();
    }

    #[test]
    fn unknown_key_does_not_resolve() {
        let registry = HandlerRegistry::new();
        assert!(registry.resolve(&HandlerKey::new("Tests", "Missing")).is_none());
        assert!(registry.is_empty());
    }

    #[test]
    fn keys_are_sorted_and_contains_matches_registration() {
        let mut registry = HandlerRegistry::new();
        let noop = || handler_fn(|_ctx: JobContext| async { Ok(()) });
        registry
            .register("Tests", "Zeta", noop())
            .register("Billing", "Invoice", noop())
            .register("Tests", "Alpha", noop());

        let keys: Vec<String> = registry.keys().iter().map(ToString::to_string).collect();
        assert_eq!(keys, ["Billing/Invoice", "Tests/Alpha", "Tests/Zeta"]);
        assert!(registry.contains(&HandlerKey::new("Tests", "Alpha")));
        assert!(!registry.contains(&HandlerKey::new("Tests", "Beta")));
    }

    #[test]
    fn key_display_joins_assembly_and_class() {
        assert_eq!(
            HandlerKey::new("Cadence.Jobs", "ConsoleWriteJob").to_string(),
            "Cadence.Jobs/ConsoleWriteJob"
        );
    }
}

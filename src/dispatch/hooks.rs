//! Operation lifecycle hooks
//!
//! Hooks observe operations being announced and finished. They run after the
//! matching notification has been broadcast and cannot influence dispatch.

use async_trait::async_trait;
use std::sync::Arc;

use super::types::{FinishedOperation, OperationSummary};

#[async_trait]
pub trait OperationHook: Send + Sync {
    /// Called once when an operation is announced
    async fn on_created(&self, _summary: &OperationSummary) {}

    /// Called once when an operation leaves the registry
    async fn on_finished(&self, _finished: &FinishedOperation) {}
}

/// Composite hook that chains multiple hooks
#[derive(Default)]
pub struct CompositeHook {
    hooks: Vec<Arc<dyn OperationHook>>,
}

impl CompositeHook {
    pub fn new() -> Self {
        Self { hooks: Vec::new() }
    }

    pub fn add_hook(&mut self, hook: Arc<dyn OperationHook>) {
        self.hooks.push(hook);
    }

    pub fn len(&self) -> usize {
        self.hooks.len()
    }

    pub fn is_empty(&self) -> bool {
        self.hooks.is_empty()
    }
}

#[async_trait]
impl OperationHook for CompositeHook {
    async fn on_created(&self, summary: &OperationSummary) {
        for hook in &self.hooks {
            hook.on_created(summary).await;
        }
    }

    async fn on_finished(&self, finished: &FinishedOperation) {
        for hook in &self.hooks {
            hook.on_finished(finished).await;
        }
    }
}

/// Logs every lifecycle event as JSON at debug level
pub struct LoggingHook;

#[async_trait]
impl OperationHook for LoggingHook {
    async fn on_created(&self, summary: &OperationSummary) {
        match serde_json::to_string(summary) {
            Ok(json) => tracing::debug!(operation = %summary.id, "NewDispatchOperation {}", json),
            Err(e) => tracing::warn!(operation = %summary.id, error = %e, "Cannot encode operation summary"),
        }
    }

    async fn on_finished(&self, finished: &FinishedOperation) {
        match serde_json::to_string(&finished.outcome) {
            Ok(json) => tracing::debug!(
                operation = %finished.id,
                channel = %finished.channel,
                "DispatchOperationFinished {}",
                json
            ),
            Err(e) => tracing::warn!(operation = %finished.id, error = %e, "Cannot encode operation outcome"),
        }
    }
}

//! Operation registry
//!
//! Tracks every live dispatch operation and broadcasts a notification when
//! one is announced and when it finishes. Each notification is emitted
//! exactly once per operation, and the finish notification always follows
//! the creation one.

use async_broadcast::{InactiveReceiver, Receiver, Sender};
use chrono::Utc;
use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use std::sync::Arc;
use tokio::sync::RwLock;
use tracing::{debug, trace};

use super::hooks::OperationHook;
use super::operation::DispatchOperation;
use super::types::{DispatchEvent, DispatchOutcome, FinishedOperation, OperationId, OperationSummary};
use crate::core::errors::{DispatchError, Result};

pub struct OperationRegistry {
    // Creation order; insert and remove are serialised on this lock
    order: RwLock<Vec<OperationId>>,
    by_id: DashMap<OperationId, Arc<DispatchOperation>>,
    by_channel: DashMap<String, OperationId>,
    events: Sender<DispatchEvent>,
    // Keeps the channel open while nobody is subscribed
    _idle: InactiveReceiver<DispatchEvent>,
    hook: Option<Arc<dyn OperationHook>>,
}

impl OperationRegistry {
    pub fn new(capacity: usize) -> Self {
        let (mut events, rx) = async_broadcast::broadcast(capacity.max(1));
        events.set_overflow(true); // Drop oldest notifications when a subscriber lags
        events.set_await_active(false);
        Self {
            order: RwLock::new(Vec::new()),
            by_id: DashMap::new(),
            by_channel: DashMap::new(),
            events,
            _idle: rx.deactivate(),
            hook: None,
        }
    }

    pub fn with_hook(mut self, hook: Arc<dyn OperationHook>) -> Self {
        self.hook = Some(hook);
        self
    }

    /// Receive notifications emitted from now on
    pub fn subscribe(&self) -> Receiver<DispatchEvent> {
        self.events.new_receiver()
    }

    /// Add an operation and announce it.
    ///
    /// Fails if the channel already has a live operation.
    pub async fn insert(&self, operation: Arc<DispatchOperation>) -> Result<()> {
        let id = operation.id().clone();
        {
            let mut order = self.order.write().await;
            match self.by_channel.entry(operation.channel_path().to_string()) {
                Entry::Occupied(existing) => {
                    return Err(DispatchError::AlreadyDispatching {
                        channel: existing.key().clone(),
                        operation: existing.get().to_string(),
                    });
                }
                Entry::Vacant(slot) => {
                    self.by_id.insert(id.clone(), operation.clone());
                    slot.insert(id.clone());
                }
            }
            order.push(id.clone());
            // Announce before releasing the lock so no finish can overtake it
            let summary = operation.summary().await;
            self.emit(DispatchEvent::OperationCreated(summary.clone()));
            drop(order);
            if let Some(hook) = &self.hook {
                hook.on_created(&summary).await;
            }
        }
        debug!(operation = %id, channel = %operation.channel_path(), "Dispatch operation added");
        Ok(())
    }

    /// Remove a finished operation and announce its outcome.
    ///
    /// Returns false if it had already been removed.
    pub async fn finish(&self, operation: &DispatchOperation, outcome: &DispatchOutcome) -> bool {
        let id = operation.id();
        let finished = {
            let mut order = self.order.write().await;
            let Some(position) = order.iter().position(|o| o == id) else {
                return false;
            };
            order.remove(position);
            self.by_channel
                .remove_if(operation.channel_path(), |_, owner| owner == id);
            self.by_id.remove(id);

            let finished = FinishedOperation {
                id: id.clone(),
                channel: operation.channel_path().to_string(),
                outcome: outcome.clone(),
                finished_at: Utc::now(),
            };
            self.emit(DispatchEvent::OperationFinished(finished.clone()));
            finished
        };
        if let Some(hook) = &self.hook {
            hook.on_finished(&finished).await;
        }
        debug!(operation = %id, outcome = outcome.kind(), "Dispatch operation removed");
        true
    }

    fn emit(&self, event: DispatchEvent) {
        // Without subscribers the notification is simply dropped
        if let Err(e) = self.events.try_broadcast(event) {
            trace!(error = %e, "Dispatch notification not delivered");
        }
    }

    pub fn get(&self, id: &OperationId) -> Option<Arc<DispatchOperation>> {
        self.by_id.get(id).map(|entry| entry.value().clone())
    }

    /// The live operation for a channel, if any
    pub fn find_by_channel(&self, channel: &str) -> Option<Arc<DispatchOperation>> {
        let id = self.by_channel.get(channel).map(|entry| entry.value().clone())?;
        self.get(&id)
    }

    /// Live operations in creation order
    pub async fn operations(&self) -> Vec<Arc<DispatchOperation>> {
        let order = self.order.read().await;
        order.iter().filter_map(|id| self.get(id)).collect()
    }

    /// Snapshot of every live operation, in creation order
    pub async fn list(&self) -> Vec<OperationSummary> {
        let mut summaries = Vec::new();
        for operation in self.operations().await {
            summaries.push(operation.summary().await);
        }
        summaries
    }

    pub fn len(&self) -> usize {
        self.by_id.len()
    }

    pub fn is_empty(&self) -> bool {
        self.by_id.is_empty()
    }

    /// Number of live operations whose channel has the given type
    pub fn channel_type_usage(&self, channel_type: &str) -> usize {
        self.by_id
            .iter()
            .filter(|entry| entry.value().channel().channel_type() == Some(channel_type))
            .count()
    }
}

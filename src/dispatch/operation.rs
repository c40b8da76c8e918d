//! Dispatch operation
//!
//! One operation exists per incoming channel, from arrival until the channel
//! has been handed to exactly one owner. All state transitions go through a
//! single per-operation mutex, so concurrent Claim/HandleWith attempts see
//! exactly one winner and every loser gets a "no longer available" error.

use chrono::{DateTime, Utc};
use std::sync::Arc;
use tokio::sync::{watch, Mutex};
use tracing::debug;

use super::channel::Channel;
use super::clients::ClientRegistry;
use super::types::{
    capabilities, ApprovalPhase, Commit, DispatchOutcome, OperationId, OperationState,
    OperationSummary, Properties,
};
use crate::core::errors::{DispatchError, Result};

pub struct DispatchOperation {
    id: OperationId,
    account: String,
    connection: String,
    channel: Arc<dyn Channel>,
    possible_handlers: Vec<String>,
    clients: ClientRegistry,
    created_at: DateTime<Utc>,
    state: Mutex<OperationState>,
    // Set exactly once, by whichever commit wins
    commit_tx: watch::Sender<Option<Commit>>,
    cancel_tx: watch::Sender<bool>,
    outcome_tx: watch::Sender<Option<DispatchOutcome>>,
}

impl DispatchOperation {
    pub fn new(
        channel: Arc<dyn Channel>,
        account: impl Into<String>,
        connection: impl Into<String>,
        possible_handlers: Vec<String>,
        clients: ClientRegistry,
    ) -> Arc<Self> {
        let (commit_tx, _) = watch::channel(None);
        let (cancel_tx, _) = watch::channel(false);
        let (outcome_tx, _) = watch::channel(None);
        Arc::new(Self {
            id: OperationId::generate(),
            account: account.into(),
            connection: connection.into(),
            channel,
            possible_handlers,
            clients,
            created_at: Utc::now(),
            state: Mutex::new(OperationState::Created),
            commit_tx,
            cancel_tx,
            outcome_tx,
        })
    }

    pub fn id(&self) -> &OperationId {
        &self.id
    }

    pub fn account(&self) -> &str {
        &self.account
    }

    pub fn connection(&self) -> &str {
        &self.connection
    }

    pub fn channel(&self) -> &Arc<dyn Channel> {
        &self.channel
    }

    pub fn channel_path(&self) -> &str {
        self.channel.path()
    }

    pub fn properties(&self) -> &Properties {
        self.channel.properties()
    }

    /// Registered handlers whose filters matched at creation, in registration order
    pub fn possible_handlers(&self) -> &[String] {
        &self.possible_handlers
    }

    pub async fn state(&self) -> OperationState {
        self.state.lock().await.clone()
    }

    pub async fn is_finished(&self) -> bool {
        self.state.lock().await.is_finished()
    }

    /// Capabilities currently offered to approvers
    pub async fn interfaces(&self) -> Vec<String> {
        match *self.state.lock().await {
            OperationState::Approving(_) => vec![
                capabilities::CLAIM.to_string(),
                capabilities::HANDLE_WITH.to_string(),
            ],
            _ => Vec::new(),
        }
    }

    pub async fn summary(&self) -> OperationSummary {
        OperationSummary {
            id: self.id.clone(),
            account: self.account.clone(),
            connection: self.connection.clone(),
            channel: self.channel_path().to_string(),
            possible_handlers: self.possible_handlers.clone(),
            interfaces: self.interfaces().await,
            created_at: self.created_at,
        }
    }

    /// The calling approver becomes the handler.
    ///
    /// Returns once the operation has finished.
    pub async fn claim(&self, caller: &str) -> Result<()> {
        if self.is_finished().await {
            return Err(DispatchError::stale(self.id.as_str()));
        }
        if !self.clients.contains(caller).await {
            return Err(DispatchError::invalid_argument(format!(
                "{} is not a registered client",
                caller
            )));
        }
        self.commit(Commit::Claim {
            by: caller.to_string(),
        })
        .await?;
        match self.wait_finished().await {
            DispatchOutcome::Claimed { by } if by == caller => Ok(()),
            // Committed callers are not told about a vanished channel
            DispatchOutcome::Vanished => Ok(()),
            other => Err(DispatchError::internal(format!(
                "claim by {} on {} ended as {}",
                caller,
                self.id,
                other.kind()
            ))),
        }
    }

    /// Hand the channel to `handler`, or let the dispatcher pick when `None`.
    ///
    /// Other possible handlers are tried in order if the chosen one fails.
    pub async fn handle_with(&self, handler: Option<&str>) -> Result<()> {
        if self.is_finished().await {
            return Err(DispatchError::stale(self.id.as_str()));
        }
        if let Some(name) = handler {
            if !self.possible_handlers.iter().any(|h| h == name) {
                return Err(DispatchError::invalid_argument(format!(
                    "{} is not a possible handler for {}",
                    name, self.id
                )));
            }
        }
        self.commit(Commit::HandleWith {
            handler: handler.map(str::to_string),
        })
        .await?;
        match self.wait_finished().await {
            DispatchOutcome::Handled { .. } | DispatchOutcome::Vanished => Ok(()),
            DispatchOutcome::Failed { tried, .. } => {
                Err(DispatchError::handlers_exhausted(self.id.as_str(), tried))
            }
            other => Err(DispatchError::internal(format!(
                "HandleWith on {} ended as {}",
                self.id,
                other.kind()
            ))),
        }
    }

    /// Try to commit the operation. Only valid while Approving; the first
    /// successful call wins.
    pub(crate) async fn commit(&self, commit: Commit) -> Result<()> {
        let mut state = self.state.lock().await;
        match &*state {
            OperationState::Approving(_) => {
                debug!(operation = %self.id, commit = ?commit, "Operation committed");
                *state = OperationState::Dispatching(commit.clone());
                self.commit_tx.send_replace(Some(commit));
                Ok(())
            }
            OperationState::Finished(_) => Err(DispatchError::stale(self.id.as_str())),
            OperationState::Dispatching(_) => Err(DispatchError::not_available(
                self.id.as_str(),
                "already committed",
            )),
            OperationState::Created | OperationState::PolicyPending => Err(
                DispatchError::not_available(self.id.as_str(), "not yet approving"),
            ),
        }
    }

    /// The winning commit, if one has been made
    pub(crate) async fn pending_commit(&self) -> Option<Commit> {
        match &*self.state.lock().await {
            OperationState::Dispatching(commit) => Some(commit.clone()),
            _ => None,
        }
    }

    /// Resolves once some party has committed
    pub(crate) async fn committed(&self) -> Option<Commit> {
        let mut rx = self.commit_tx.subscribe();
        let commit = rx.wait_for(Option::is_some).await.ok()?;
        commit.clone()
    }

    pub(crate) async fn enter_policy(&self) -> bool {
        self.advance(|s| matches!(s, OperationState::Created), OperationState::PolicyPending)
            .await
    }

    /// Move into an approval sub-phase; false once the operation was committed
    pub(crate) async fn enter_approving(&self, phase: ApprovalPhase) -> bool {
        self.advance(
            |s| matches!(s, OperationState::PolicyPending | OperationState::Approving(_)),
            OperationState::Approving(phase),
        )
        .await
    }

    async fn advance(&self, allowed: impl Fn(&OperationState) -> bool, next: OperationState) -> bool {
        let mut state = self.state.lock().await;
        if !allowed(&*state) {
            return false;
        }
        debug!(operation = %self.id, from = state.name(), to = next.name(), "Operation state change");
        *state = next;
        true
    }

    /// Record the terminal outcome; false if already finished
    pub(crate) async fn mark_finished(&self, outcome: &DispatchOutcome) -> bool {
        let mut state = self.state.lock().await;
        if state.is_finished() {
            return false;
        }
        *state = OperationState::Finished(outcome.clone());
        true
    }

    /// Wake everyone waiting in `wait_finished`
    pub(crate) fn publish_outcome(&self, outcome: DispatchOutcome) {
        self.outcome_tx.send_replace(Some(outcome));
    }

    pub async fn wait_finished(&self) -> DispatchOutcome {
        let mut rx = self.outcome_tx.subscribe();
        let outcome = match rx.wait_for(Option::is_some).await {
            Ok(outcome) => outcome.clone().unwrap_or(DispatchOutcome::Vanished),
            // the sender lives as long as self
            Err(_) => DispatchOutcome::Vanished,
        };
        outcome
    }

    /// Signal that the channel has gone away
    pub fn cancel(&self) {
        self.cancel_tx.send_replace(true);
    }

    pub fn is_cancelled(&self) -> bool {
        *self.cancel_tx.borrow()
    }

    /// Resolves once the channel has gone away
    pub(crate) async fn cancelled(&self) {
        let mut rx = self.cancel_tx.subscribe();
        if rx.wait_for(|gone| *gone).await.is_err() {
            std::future::pending::<()>().await;
        }
    }
}

impl std::fmt::Debug for DispatchOperation {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DispatchOperation")
            .field("id", &self.id)
            .field("account", &self.account)
            .field("connection", &self.connection)
            .field("channel", &self.channel_path())
            .field("possible_handlers", &self.possible_handlers)
            .finish()
    }
}

//! Dispatcher - drives every incoming channel to exactly one owner
//!
//! Each channel gets its own dispatch operation and its own driver task. The
//! driver walks the operation through the policy gate, the observer and
//! approver fan-outs and finally the handler hand-off, racing every phase
//! against the channel vanishing. Approvers commit through the operation
//! itself, so the driver only ever reacts to the winning commit.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tokio::sync::mpsc;
use tracing::{debug, error, info, warn};

use super::channel::Channel;
use super::clients::{
    ApprovalRequest, Client, ClientDescriptor, ClientRegistry, HandleRequest, ObserveRequest,
    RegisteredClient,
};
use super::hooks::{CompositeHook, LoggingHook, OperationHook};
use super::operation::DispatchOperation;
use super::policy::{PolicyDecision, PolicyGate, PolicyPlugin, PolicyQuery};
use super::registry::OperationRegistry;
use super::types::{
    ApprovalPhase, ClientRole, Commit, DispatchEvent, DispatchOutcome, OperationId,
    OperationSummary, RemovalReason,
};
use crate::core::config::DispatcherConfig;
use crate::core::errors::{DispatchError, Result};

/// Everything a driver task needs, shared between all operations
#[derive(Clone)]
struct DispatchContext {
    clients: ClientRegistry,
    policy: PolicyGate,
    registry: Arc<OperationRegistry>,
    config: Arc<DispatcherConfig>,
}

pub struct Dispatcher {
    ctx: DispatchContext,
    shut_down: AtomicBool,
}

impl Dispatcher {
    pub fn new(config: DispatcherConfig) -> Result<Self> {
        Self::with_hooks(config, Vec::new())
    }

    /// Create a dispatcher whose operation lifecycle is also reported to `hooks`
    pub fn with_hooks(config: DispatcherConfig, hooks: Vec<Arc<dyn OperationHook>>) -> Result<Self> {
        config.validate()?;

        let mut composite = CompositeHook::new();
        composite.add_hook(Arc::new(LoggingHook));
        for hook in hooks {
            composite.add_hook(hook);
        }

        let registry = OperationRegistry::new(config.notification_capacity)
            .with_hook(Arc::new(composite));
        Ok(Self {
            ctx: DispatchContext {
                clients: ClientRegistry::new(),
                policy: PolicyGate::new(config.policy_timeout),
                registry: Arc::new(registry),
                config: Arc::new(config),
            },
            shut_down: AtomicBool::new(false),
        })
    }

    pub fn config(&self) -> &DispatcherConfig {
        &self.ctx.config
    }

    pub fn clients(&self) -> &ClientRegistry {
        &self.ctx.clients
    }

    pub fn policy(&self) -> &PolicyGate {
        &self.ctx.policy
    }

    pub fn operations(&self) -> &OperationRegistry {
        &self.ctx.registry
    }

    pub async fn register_client(&self, descriptor: ClientDescriptor, endpoint: Arc<dyn Client>) -> Result<()> {
        self.ctx.clients.register(descriptor, endpoint).await
    }

    pub async fn unregister_client(&self, name: &str) -> Result<()> {
        self.ctx.clients.unregister(name).await
    }

    pub async fn add_policy_plugin(&self, plugin: Arc<dyn PolicyPlugin>) {
        self.ctx.policy.add_plugin(plugin).await
    }

    /// Notifications for operations announced or finished from now on
    pub fn subscribe(&self) -> async_broadcast::Receiver<DispatchEvent> {
        self.ctx.registry.subscribe()
    }

    /// Snapshot of the live operations, in creation order
    pub async fn list_operations(&self) -> Vec<OperationSummary> {
        self.ctx.registry.list().await
    }

    /// Start dispatching a newly arrived channel.
    ///
    /// Channels that no registered handler accepts are closed straight away
    /// and never announced.
    pub async fn channel_created(
        &self,
        channel: Arc<dyn Channel>,
        account: impl Into<String>,
        connection: impl Into<String>,
    ) -> Result<OperationId> {
        if self.shut_down.load(Ordering::SeqCst) {
            return Err(DispatchError::internal("dispatcher has been shut down"));
        }
        let path = channel.path().to_string();
        if let Some(existing) = self.ctx.registry.find_by_channel(&path) {
            return Err(DispatchError::AlreadyDispatching {
                channel: path,
                operation: existing.id().to_string(),
            });
        }

        let possible_handlers = self
            .ctx
            .clients
            .match_clients(channel.properties(), ClientRole::Handle)
            .await;
        if possible_handlers.is_empty() {
            let err = DispatchError::no_matching_handler(&path);
            warn!(channel = %path, error = %err, "Closing undispatchable channel");
            if let Err(e) = channel.close().await {
                warn!(channel = %path, error = %format!("{:#}", e), "Failed to close channel");
            }
            return Err(err);
        }

        let operation = DispatchOperation::new(
            channel,
            account,
            connection,
            possible_handlers,
            self.ctx.clients.clone(),
        );
        self.ctx.registry.insert(operation.clone()).await?;
        // shutdown may have taken its snapshot before the insert
        if self.shut_down.load(Ordering::SeqCst) {
            operation.cancel();
        }
        info!(
            operation = %operation.id(),
            channel = %path,
            handlers = ?operation.possible_handlers(),
            "Dispatching channel"
        );

        let id = operation.id().clone();
        tokio::spawn(drive_operation(operation, self.ctx.clone()));
        Ok(id)
    }

    /// The channel went away; its operation finishes without a handler
    pub fn channel_closed(&self, channel: &str) -> bool {
        match self.ctx.registry.find_by_channel(channel) {
            Some(operation) => {
                debug!(operation = %operation.id(), channel = %channel, "Channel vanished");
                operation.cancel();
                true
            }
            None => false,
        }
    }

    /// Claim on behalf of `caller`; see [`DispatchOperation::claim`]
    pub async fn claim(&self, operation: &OperationId, caller: &str) -> Result<()> {
        self.live(operation)?.claim(caller).await
    }

    /// See [`DispatchOperation::handle_with`]
    pub async fn handle_with(&self, operation: &OperationId, handler: Option<&str>) -> Result<()> {
        self.live(operation)?.handle_with(handler).await
    }

    fn live(&self, operation: &OperationId) -> Result<Arc<DispatchOperation>> {
        self.ctx
            .registry
            .get(operation)
            .ok_or_else(|| DispatchError::stale(operation.as_str()))
    }

    /// Stop accepting channels and finish every live operation
    pub async fn shutdown(&self) {
        if self.shut_down.swap(true, Ordering::SeqCst) {
            return;
        }
        let live = self.ctx.registry.operations().await;
        info!(operations = live.len(), "Dispatcher shutting down");
        for operation in &live {
            operation.cancel();
        }
        for operation in live {
            operation.wait_finished().await;
        }
    }
}

async fn drive_operation(operation: Arc<DispatchOperation>, ctx: DispatchContext) {
    let outcome = match run_phases(&operation, &ctx).await {
        Ok(outcome) => outcome,
        Err(DispatchError::ChannelVanished { .. }) => DispatchOutcome::Vanished,
        Err(e) => {
            error!(operation = %operation.id(), error = %e, category = e.category(), "Dispatch failed");
            close_channel(&operation).await;
            DispatchOutcome::Failed {
                reason: e.to_string(),
                tried: Vec::new(),
            }
        }
    };
    conclude(&operation, &ctx, outcome).await;
}

async fn conclude(operation: &DispatchOperation, ctx: &DispatchContext, outcome: DispatchOutcome) {
    if !operation.mark_finished(&outcome).await {
        return;
    }
    info!(
        operation = %operation.id(),
        channel = %operation.channel_path(),
        outcome = outcome.kind(),
        owner = outcome.owner().unwrap_or("-"),
        "Dispatch operation finished"
    );
    ctx.registry.finish(operation, &outcome).await;
    operation.publish_outcome(outcome);
}

async fn run_phases(operation: &Arc<DispatchOperation>, ctx: &DispatchContext) -> Result<DispatchOutcome> {
    let vanished = || DispatchError::vanished(operation.channel_path());

    operation.enter_policy().await;
    let query = PolicyQuery {
        account: operation.account().to_string(),
        connection: operation.connection().to_string(),
        channel_path: operation.channel_path().to_string(),
        properties: operation.properties().clone(),
    };
    let decision = tokio::select! {
        biased;
        _ = operation.cancelled() => return Err(vanished()),
        decision = ctx.policy.evaluate(&query) => decision,
    };
    if let PolicyDecision::Deny { plugin, reason, removal_reason } = decision {
        info!(operation = %operation.id(), plugin = %plugin, reason = %reason, "Channel rejected by policy");
        reject_channel(operation, &reason, removal_reason).await;
        return Ok(DispatchOutcome::Denied {
            reason,
            removal_reason,
        });
    }

    operation.enter_approving(ApprovalPhase::Observation).await;
    run_observers(operation, ctx).await?;

    let commit = if operation.enter_approving(ApprovalPhase::Approval).await {
        run_approvers(operation, ctx).await?
    } else {
        // committed while observers were still being told
        operation
            .pending_commit()
            .await
            .ok_or_else(|| DispatchError::internal("operation left approval without a commit"))?
    };

    match commit {
        Commit::Claim { by } => {
            info!(operation = %operation.id(), client = %by, "Channel claimed");
            Ok(DispatchOutcome::Claimed { by })
        }
        Commit::HandleWith { handler } => dispatch_to_handlers(operation, ctx, handler.as_deref()).await,
        Commit::Automatic => dispatch_to_handlers(operation, ctx, None).await,
    }
}

/// Remove ourselves from a denied group channel, then close it
async fn reject_channel(operation: &DispatchOperation, reason: &str, removal_reason: RemovalReason) {
    let channel = operation.channel();
    if channel.is_group() {
        if let Err(e) = channel.remove_self(reason, removal_reason).await {
            let err = DispatchError::client(operation.channel_path(), "RemoveMembersWithReason", &e);
            warn!(operation = %operation.id(), error = %err, "Failed to leave denied channel");
        }
    }
    close_channel(operation).await;
}

async fn close_channel(operation: &DispatchOperation) {
    if let Err(e) = operation.channel().close().await {
        let err = DispatchError::client(operation.channel_path(), "Close", &e);
        warn!(operation = %operation.id(), error = %err, "Failed to close channel");
    }
}

/// Tell every matching observer and wait, bounded, for them to acknowledge
async fn run_observers(operation: &Arc<DispatchOperation>, ctx: &DispatchContext) -> Result<()> {
    let observers = phase_clients(ctx, operation, ClientRole::Observe).await;
    if operation.is_cancelled() {
        return Err(DispatchError::vanished(operation.channel_path()));
    }
    if observers.is_empty() {
        return Ok(());
    }

    let expected = observers.len();
    let timeout = ctx.config.observer_timeout;
    let (tx, mut rx) = mpsc::channel(expected);
    for observer in observers {
        let tx = tx.clone();
        let request = ObserveRequest {
            account: operation.account().to_string(),
            connection: operation.connection().to_string(),
            channel_path: operation.channel_path().to_string(),
            properties: operation.properties().clone(),
            operation: operation.clone(),
        };
        let id = operation.id().clone();
        tokio::spawn(async move {
            let name = observer.name().to_string();
            match tokio::time::timeout(timeout, observer.endpoint.observe_channels(request)).await {
                Ok(Ok(())) => debug!(operation = %id, observer = %name, "Observer acknowledged"),
                Ok(Err(e)) => {
                    let err = DispatchError::client(name.as_str(), "ObserveChannels", &e);
                    warn!(operation = %id, error = %err, "Observer failed");
                }
                Err(_) => warn!(operation = %id, observer = %name, "Observer did not answer in time"),
            }
            // The driver may have stopped listening
            let _ = tx.send(name).await;
        });
    }
    drop(tx);

    let all_answered = async {
        let mut answered = 0;
        while answered < expected && rx.recv().await.is_some() {
            answered += 1;
        }
    };
    tokio::select! {
        biased;
        _ = operation.cancelled() => Err(DispatchError::vanished(operation.channel_path())),
        _ = all_answered => Ok(()),
    }
}

/// Offer the operation to approvers until somebody commits.
///
/// If nobody can or will approve, the operation commits to automatic dispatch.
async fn run_approvers(operation: &Arc<DispatchOperation>, ctx: &DispatchContext) -> Result<Commit> {
    // Channels the local user asked for are never put to approvers
    if operation.channel().is_requested() {
        debug!(operation = %operation.id(), "Requested channel; skipping approval");
        return commit_automatic(operation).await;
    }

    if ctx.config.skip_approval_for_bypass_handlers {
        if let Some(default_handler) = operation.possible_handlers().first() {
            let bypass = ctx
                .clients
                .get(default_handler)
                .await
                .map(|c| c.descriptor.bypass_approval)
                .unwrap_or(false);
            if bypass {
                debug!(operation = %operation.id(), handler = %default_handler, "Default handler bypasses approval");
                return commit_automatic(operation).await;
            }
        }
    }

    let approvers: Vec<_> = phase_clients(ctx, operation, ClientRole::Approve)
        .await
        .into_iter()
        .filter(|c| !c.descriptor.bypass_approval)
        .collect();
    if operation.is_cancelled() {
        return Err(DispatchError::vanished(operation.channel_path()));
    }
    if approvers.is_empty() {
        debug!(operation = %operation.id(), "No approvers; dispatching automatically");
        return commit_automatic(operation).await;
    }

    let timeout = ctx.config.approver_timeout;
    let (tx, mut rx) = mpsc::channel(approvers.len());
    let mut outstanding = approvers.len();
    for approver in approvers {
        let tx = tx.clone();
        let request = ApprovalRequest {
            account: operation.account().to_string(),
            connection: operation.connection().to_string(),
            channel_path: operation.channel_path().to_string(),
            properties: operation.properties().clone(),
            possible_handlers: operation.possible_handlers().to_vec(),
            operation: operation.clone(),
        };
        tokio::spawn(async move {
            let name = approver.name().to_string();
            let accepted = match tokio::time::timeout(
                timeout,
                approver.endpoint.add_dispatch_operation(request),
            )
            .await
            {
                Ok(Ok(())) => Ok(()),
                Ok(Err(e)) => Err(DispatchError::client(name.as_str(), "AddDispatchOperation", &e)),
                Err(_) => Err(DispatchError::client(
                    name.as_str(),
                    "AddDispatchOperation",
                    &anyhow::anyhow!("no reply within {}ms", timeout.as_millis()),
                )),
            };
            let _ = tx.send((name, accepted)).await;
        });
    }
    drop(tx);

    let mut accepted = 0;
    loop {
        tokio::select! {
            biased;
            _ = operation.cancelled() => return Err(DispatchError::vanished(operation.channel_path())),
            commit = operation.committed() => {
                return commit.ok_or_else(|| DispatchError::internal("commit signal closed"));
            }
            answer = rx.recv(), if outstanding > 0 => {
                match answer {
                    Some((name, Ok(()))) => {
                        debug!(operation = %operation.id(), approver = %name, "Approver accepted operation");
                        accepted += 1;
                        outstanding -= 1;
                    }
                    Some((_, Err(err))) => {
                        warn!(operation = %operation.id(), error = %err, "Approver failed");
                        outstanding -= 1;
                    }
                    None => outstanding = 0,
                }
                if outstanding == 0 && accepted == 0 {
                    info!(operation = %operation.id(), "No approver accepted; dispatching automatically");
                    return commit_automatic(operation).await;
                }
            }
        }
    }
}

/// Clients taking `role` for this channel, from one registry snapshot
async fn phase_clients(
    ctx: &DispatchContext,
    operation: &DispatchOperation,
    role: ClientRole,
) -> Vec<RegisteredClient> {
    ctx.clients
        .snapshot()
        .await
        .into_iter()
        .filter(|c| c.descriptor.wants(role, operation.properties()))
        .collect()
}

/// Commit to automatic dispatch, deferring to any commit that got there first
async fn commit_automatic(operation: &DispatchOperation) -> Result<Commit> {
    match operation.commit(Commit::Automatic).await {
        Ok(()) => Ok(Commit::Automatic),
        Err(e) if e.is_no_longer_active() => operation.pending_commit().await.ok_or(e),
        Err(e) => Err(e),
    }
}

/// Hand the channel to `preferred`, falling back through the other
/// possible handlers in order.
async fn dispatch_to_handlers(
    operation: &Arc<DispatchOperation>,
    ctx: &DispatchContext,
    preferred: Option<&str>,
) -> Result<DispatchOutcome> {
    let mut candidates: Vec<String> = preferred.map(str::to_string).into_iter().collect();
    candidates.extend(
        operation
            .possible_handlers()
            .iter()
            .filter(|h| Some(h.as_str()) != preferred)
            .cloned(),
    );

    let timeout = ctx.config.handler_timeout;
    let mut tried = Vec::with_capacity(candidates.len());
    for name in candidates {
        tried.push(name.clone());
        let Some(handler) = ctx.clients.get(&name).await else {
            warn!(operation = %operation.id(), handler = %name, "Handler is no longer registered");
            continue;
        };

        let request = HandleRequest {
            operation: operation.id().clone(),
            account: operation.account().to_string(),
            connection: operation.connection().to_string(),
            channel: operation.channel().clone(),
            properties: operation.properties().clone(),
        };
        let answer = tokio::select! {
            biased;
            _ = operation.cancelled() => return Err(DispatchError::vanished(operation.channel_path())),
            answer = tokio::time::timeout(timeout, handler.endpoint.handle_channels(request)) => answer,
        };
        let err = match answer {
            Ok(Ok(())) => {
                info!(operation = %operation.id(), handler = %name, "Channel handled");
                return Ok(DispatchOutcome::Handled { by: name });
            }
            Ok(Err(e)) => DispatchError::handler_rejected(name.as_str(), format!("{:#}", e)),
            Err(_) => DispatchError::handler_rejected(
                name.as_str(),
                format!("no reply within {}ms", timeout.as_millis()),
            ),
        };
        warn!(operation = %operation.id(), error = %err, "Handler failed; trying the next one");
    }

    let err = DispatchError::handlers_exhausted(operation.id().as_str(), tried.clone());
    error!(operation = %operation.id(), error = %err, "Closing channel nobody would handle");
    close_channel(operation).await;
    Ok(DispatchOutcome::Failed {
        reason: err.to_string(),
        tried,
    })
}
